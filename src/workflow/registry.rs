use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use thiserror::Error;

use super::state::WorkflowMode;

/// Errors raised while building or querying the step catalog
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Step not found: {step_id}")]
    NotFound { step_id: String },

    #[error("Step already registered: {step_id}")]
    DuplicateStep { step_id: String },

    #[error("Step {step_id} depends on unregistered step {dependency}")]
    UnknownDependency { step_id: String, dependency: String },

    #[error("Step {step_id} is enabled in {mode} mode but its dependency {dependency} is not")]
    DependencyDisabledInMode {
        step_id: String,
        dependency: String,
        mode: WorkflowMode,
    },

    #[error("Required step {step_id} depends on optional step {dependency}")]
    RequiredDependsOnOptional { step_id: String, dependency: String },
}

/// Immutable definition of one unit of work in the catalog
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub id: String,
    pub name: String,
    pub description: String,
    pub required: bool,
    pub depends_on: BTreeSet<String>,
    pub enabled_in_quick: bool,
    pub enabled_in_guided: bool,
    pub enabled_in_advanced: bool,
    pub estimated_seconds: u32,
    pub help_text: Option<String>,
}

impl WorkflowStep {
    /// A required step with no dependencies, enabled in every mode
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            required: true,
            depends_on: BTreeSet::new(),
            enabled_in_quick: true,
            enabled_in_guided: true,
            enabled_in_advanced: true,
            estimated_seconds: 60,
            help_text: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    pub fn with_dependencies<I, S>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = dependencies.into_iter().map(Into::into).collect();
        self
    }

    /// Restrict the step to the given modes
    pub fn with_modes(mut self, modes: &[WorkflowMode]) -> Self {
        self.enabled_in_quick = modes.contains(&WorkflowMode::Quick);
        self.enabled_in_guided = modes.contains(&WorkflowMode::Guided);
        self.enabled_in_advanced = modes.contains(&WorkflowMode::Advanced);
        self
    }

    pub fn with_estimated_seconds(mut self, seconds: u32) -> Self {
        self.estimated_seconds = seconds;
        self
    }

    pub fn with_help_text(mut self, help: impl Into<String>) -> Self {
        self.help_text = Some(help.into());
        self
    }

    pub fn enabled_for(&self, mode: WorkflowMode) -> bool {
        match mode {
            WorkflowMode::Quick => self.enabled_in_quick,
            WorkflowMode::Guided => self.enabled_in_guided,
            WorkflowMode::Advanced => self.enabled_in_advanced,
        }
    }
}

/// Static catalog of steps, populated once at startup.
///
/// Iteration order is insertion order. Because a dependency must be registered
/// before its dependents, insertion order is always a valid topological order.
#[derive(Debug, Clone, Default)]
pub struct StepRegistry {
    steps: Vec<WorkflowStep>,
    index: HashMap<String, usize>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, step: WorkflowStep) -> Result<(), RegistryError> {
        if self.index.contains_key(&step.id) {
            return Err(RegistryError::DuplicateStep { step_id: step.id });
        }

        for dependency_id in &step.depends_on {
            let dependency = self.index.get(dependency_id).map(|&i| &self.steps[i]).ok_or_else(|| {
                RegistryError::UnknownDependency {
                    step_id: step.id.clone(),
                    dependency: dependency_id.clone(),
                }
            })?;

            // A skipped optional dependency would leave a required step unreachable
            if step.required && !dependency.required {
                return Err(RegistryError::RequiredDependsOnOptional {
                    step_id: step.id.clone(),
                    dependency: dependency_id.clone(),
                });
            }

            for mode in WorkflowMode::ALL {
                if step.enabled_for(mode) && !dependency.enabled_for(mode) {
                    return Err(RegistryError::DependencyDisabledInMode {
                        step_id: step.id.clone(),
                        dependency: dependency_id.clone(),
                        mode,
                    });
                }
            }
        }

        self.index.insert(step.id.clone(), self.steps.len());
        self.steps.push(step);
        Ok(())
    }

    pub fn get(&self, step_id: &str) -> Result<&WorkflowStep, RegistryError> {
        self.index
            .get(step_id)
            .map(|&i| &self.steps[i])
            .ok_or_else(|| RegistryError::NotFound {
                step_id: step_id.to_string(),
            })
    }

    pub fn enabled_for(&self, step_id: &str, mode: WorkflowMode) -> bool {
        self.get(step_id).map(|step| step.enabled_for(mode)).unwrap_or(false)
    }

    pub fn steps(&self) -> impl Iterator<Item = &WorkflowStep> {
        self.steps.iter()
    }

    /// Steps enabled for `mode`, in registry order
    pub fn steps_for(&self, mode: WorkflowMode) -> impl Iterator<Item = &WorkflowStep> {
        self.steps.iter().filter(move |step| step.enabled_for(mode))
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// The certificate generation catalog shipped with the engine
    pub fn certificate_catalog() -> Result<Self, RegistryError> {
        use WorkflowMode::{Advanced, Guided, Quick};

        let mut registry = Self::new();

        registry.register(
            WorkflowStep::new("select_template", "Select template")
                .with_description("Choose the certificate template to fill")
                .with_estimated_seconds(30),
        )?;
        registry.register(
            WorkflowStep::new("upload_data", "Upload recipients")
                .with_description("Provide the recipient records for the batch")
                .with_estimated_seconds(60)
                .with_help_text("CSV or spreadsheet with one row per certificate"),
        )?;
        registry.register(
            WorkflowStep::new("validate_data", "Validate recipients")
                .with_description("Check the uploaded records for missing or malformed fields")
                .with_dependencies(["upload_data"])
                .with_estimated_seconds(45),
        )?;
        registry.register(
            WorkflowStep::new("map_fields", "Map fields")
                .with_description("Bind record columns to template placeholders")
                .with_dependencies(["select_template", "validate_data"])
                .with_modes(&[Guided, Advanced])
                .with_estimated_seconds(90),
        )?;
        registry.register(
            WorkflowStep::new("customize_design", "Customize design")
                .with_description("Adjust fonts, colours and layout of the template")
                .optional()
                .with_dependencies(["select_template"])
                .with_modes(&[Advanced])
                .with_estimated_seconds(120),
        )?;
        registry.register(
            WorkflowStep::new("configure_output", "Configure output")
                .with_description("Pick file naming, format and delivery options")
                .optional()
                .with_dependencies(["select_template"])
                .with_modes(&[Guided, Advanced])
                .with_estimated_seconds(40),
        )?;
        registry.register(
            WorkflowStep::new("preview", "Preview")
                .with_description("Render a sample certificate before generating the batch")
                .optional()
                .with_dependencies(["select_template", "validate_data"])
                .with_modes(&[Guided, Advanced])
                .with_estimated_seconds(30),
        )?;
        registry.register(
            WorkflowStep::new("generate", "Generate certificates")
                .with_description("Produce the certificate documents")
                .with_dependencies(["select_template", "validate_data"])
                .with_modes(&[Quick, Guided, Advanced])
                .with_estimated_seconds(20),
        )?;

        Ok(registry)
    }
}
