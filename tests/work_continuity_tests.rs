//! Integration tests for workflow continuity across engine restarts
//!
//! These tests verify that workflow state and behavior profiles written by
//! one engine instance are picked up unchanged by the next one.

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use serde_json::json;
    use std::sync::Arc;
    use tempfile::TempDir;

    use flexflow::{
        FileSystemStore, FlexflowConfig, Payload, PersistenceConfig, StepRegistry, StepStatus,
        TrackedAction, WorkflowEngine, WorkflowMode, WorkflowPersistence,
    };

    fn create_test_config(temp_dir: &TempDir) -> FlexflowConfig {
        let mut config = FlexflowConfig::default();
        config.persistence = PersistenceConfig {
            enabled: true,
            directory: temp_dir.path().to_path_buf(),
            auto_save_interval_seconds: 30,
        };
        config
    }

    #[tokio::test]
    async fn test_manual_save_survives_restart() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let config = create_test_config(&temp_dir);

        let (workflow_id, saved) = {
            let engine = WorkflowEngine::from_config(&config)?;
            let id = engine.create_workflow("alice", WorkflowMode::Guided).await;
            assert!(
                engine
                    .advance_step(
                        &id,
                        "select_template",
                        json!({ "template": "classic", "copies": 40 })
                            .as_object()
                            .cloned()
                            .unwrap(),
                    )
                    .await
            );
            assert!(engine.save_workflow(&id).await);
            let saved = engine.get_workflow(&id).await.unwrap();
            (id, saved)
        };

        let engine = WorkflowEngine::from_config(&config)?;
        assert_eq!(engine.resume_latest_workflow("alice").await, Some(workflow_id.clone()));

        let resumed = engine.get_workflow(&workflow_id).await.unwrap();
        assert_eq!(resumed, saved);
        assert_eq!(resumed.current_step.as_deref(), Some("upload_data"));
        assert_eq!(resumed.form_data.get("copies"), Some(&json!(40)));

        // Work continues where it stopped
        assert!(engine.advance_step(&workflow_id, "upload_data", Payload::new()).await);
        assert_eq!(
            engine.get_workflow(&workflow_id).await.unwrap().current_step.as_deref(),
            Some("validate_data")
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_unsaved_mutations_inside_interval_are_lost() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let config = create_test_config(&temp_dir);

        let workflow_id = {
            let engine = WorkflowEngine::from_config(&config)?;
            let id = engine.create_workflow("alice", WorkflowMode::Quick).await;
            assert!(engine.advance_step(&id, "select_template", Payload::new()).await);
            id
        };

        let engine = WorkflowEngine::from_config(&config)?;
        let state = engine.get_workflow(&workflow_id).await.unwrap();
        assert_eq!(state.status_of("select_template"), Some(StepStatus::Active));
        Ok(())
    }

    #[tokio::test]
    async fn test_completed_workflow_is_persisted_without_manual_save() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let config = create_test_config(&temp_dir);

        let workflow_id = {
            let engine = WorkflowEngine::from_config(&config)?;
            let id = engine.create_workflow("alice", WorkflowMode::Quick).await;
            for step in ["select_template", "upload_data", "validate_data", "generate"] {
                assert!(engine.advance_step(&id, step, Payload::new()).await);
            }
            id
        };

        let engine = WorkflowEngine::from_config(&config)?;
        let state = engine.get_workflow(&workflow_id).await.unwrap();
        assert!(state.completed_at.is_some());

        let summaries = engine.list_user_workflows("alice").await;
        assert_eq!(summaries.len(), 1);
        assert!(summaries[0].completed);
        assert_eq!(summaries[0].progress, 100.0);

        let profile = engine.behavior_profile("alice").await;
        assert_eq!(profile.successful_completions, 1);
        assert_eq!(profile.usage(&TrackedAction::ModeSelected(WorkflowMode::Quick)), 1);
        assert_eq!(profile.usage(&TrackedAction::StepAdvanced("generate".to_string())), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_corrupt_record_is_treated_as_missing() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let config = create_test_config(&temp_dir);

        let workflow_id = {
            let engine = WorkflowEngine::from_config(&config)?;
            engine.create_workflow("alice", WorkflowMode::Quick).await
        };

        let record = temp_dir
            .path()
            .join("workflows")
            .join(format!("{}.json", flexflow::persistence::filesystem::record_key(&workflow_id)));
        assert!(record.exists());
        std::fs::write(&record, "{ not json")?;

        let engine = WorkflowEngine::from_config(&config)?;
        assert!(engine.get_workflow(&workflow_id).await.is_none());
        assert!(!engine.advance_step(&workflow_id, "select_template", Payload::new()).await);
        assert!(engine.list_user_workflows("alice").await.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_engines_share_store_through_trait_object() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let store = Arc::new(FileSystemStore::new(PersistenceConfig {
            directory: temp_dir.path().to_path_buf(),
            ..PersistenceConfig::default()
        }));
        let registry = Arc::new(StepRegistry::certificate_catalog()?);

        let engine = WorkflowEngine::new(registry.clone(), store.clone(), store.clone());
        let id = engine.create_workflow("alice", WorkflowMode::Advanced).await;
        assert!(engine.jump_to_step(&id, "upload_data").await);
        assert!(engine.save_workflow(&id).await);

        let latest = store.load_latest_for_user("alice").await?.unwrap();
        assert_eq!(latest.workflow_id, id);
        assert_eq!(latest.current_step.as_deref(), Some("upload_data"));
        assert_eq!(latest.status_of("select_template"), Some(StepStatus::Pending));

        assert!(engine.delete_workflow(&id).await);
        assert!(store.load_workflow(&id).await?.is_none());
        assert!(store.load_latest_for_user("alice").await?.is_none());
        Ok(())
    }
}
