use serde::{Deserialize, Serialize};

use super::{BehaviorConfig, TrackedAction, UserBehaviorProfile};
use crate::workflow::{StepRegistry, WorkflowMode, WorkflowSummary};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModeSuggestion {
    pub mode: WorkflowMode,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Suggestions {
    pub recommended_mode: Option<ModeSuggestion>,
    pub shortcuts: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionCount {
    pub action: String,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Widget {
    RecentWorkflows {
        workflows: Vec<WorkflowSummary>,
    },
    MostUsedActions {
        actions: Vec<ActionCount>,
    },
    EfficiencyScore {
        score: u8,
        average_seconds: f64,
        benchmark_seconds: f64,
    },
}

/// Most frequently chosen mode, once the user has enough completed workflows
/// to make the recommendation meaningful. Ties go to the simpler mode.
pub fn recommend_mode(profile: &UserBehaviorProfile, config: &BehaviorConfig) -> Option<ModeSuggestion> {
    if profile.successful_completions < config.suggestion_min_completions {
        return None;
    }

    let usage = profile.mode_usage();
    let total: u64 = usage.values().sum();

    let mut best: Option<(WorkflowMode, u64)> = None;
    for mode in WorkflowMode::ALL {
        let count = usage.get(&mode).copied().unwrap_or(0);
        if count > 0 && best.map_or(true, |(_, top)| count > top) {
            best = Some((mode, count));
        }
    }

    best.map(|(mode, count)| ModeSuggestion {
        mode,
        reason: format!(
            "You chose {} mode for {} of the {} workflows you started",
            mode, count, total
        ),
    })
}

/// Human-readable hints derived from repeated skips, jumps and slow steps
pub fn shortcut_hints(
    profile: &UserBehaviorProfile,
    registry: &StepRegistry,
    config: &BehaviorConfig,
) -> Vec<String> {
    let step_name = |step_id: &str| {
        registry
            .get(step_id)
            .map(|step| step.name.clone())
            .unwrap_or_else(|_| step_id.to_string())
    };

    let mut hints = Vec::new();
    for (key, count) in &profile.feature_usage {
        if *count < config.shortcut_min_occurrences {
            continue;
        }
        match TrackedAction::parse(key) {
            Some(TrackedAction::StepSkipped(step_id)) => {
                let quick_omits = registry
                    .get(&step_id)
                    .map(|step| !step.enabled_for(WorkflowMode::Quick))
                    .unwrap_or(false);
                if quick_omits {
                    hints.push(format!(
                        "You usually skip \"{}\"; Quick mode leaves it out entirely",
                        step_name(&step_id)
                    ));
                } else {
                    hints.push(format!("You usually skip \"{}\"", step_name(&step_id)));
                }
            }
            Some(TrackedAction::StepJumped(step_id)) => hints.push(format!(
                "You often jump straight to \"{}\"",
                step_name(&step_id)
            )),
            _ => {}
        }
    }

    if profile.successful_completions >= config.suggestion_min_completions {
        let slowest = profile
            .average_step_seconds
            .iter()
            .max_by(|a, b| a.1.total_cmp(b.1));
        if let Some((step_id, seconds)) = slowest {
            hints.push(format!(
                "\"{}\" takes you the longest, about {:.0}s on average",
                step_name(step_id),
                seconds
            ));
        }
    }

    hints
}

pub fn suggestions(
    profile: &UserBehaviorProfile,
    registry: &StepRegistry,
    config: &BehaviorConfig,
) -> Suggestions {
    Suggestions {
        recommended_mode: recommend_mode(profile, config),
        shortcuts: shortcut_hints(profile, registry, config),
    }
}

/// Percentage of the benchmark time achieved, capped at 100
pub fn efficiency_score(average_seconds: f64, benchmark_seconds: f64) -> u8 {
    if average_seconds <= 0.0 {
        return 100;
    }
    (benchmark_seconds / average_seconds * 100.0).round().clamp(0.0, 100.0) as u8
}

/// Dashboard widgets for the user. `recent` is expected newest first.
///
/// Recent workflows are always shown; usage and efficiency widgets appear
/// only for experienced users.
pub fn dashboard_widgets(
    profile: &UserBehaviorProfile,
    recent: &[WorkflowSummary],
    config: &BehaviorConfig,
) -> Vec<Widget> {
    let mut widgets = vec![Widget::RecentWorkflows {
        workflows: recent
            .iter()
            .take(config.recent_workflows_limit)
            .cloned()
            .collect(),
    }];

    if profile.successful_completions < config.dashboard_min_completions {
        return widgets;
    }

    let mut actions: Vec<ActionCount> = profile
        .feature_usage
        .iter()
        .map(|(action, count)| ActionCount {
            action: action.clone(),
            count: *count,
        })
        .collect();
    actions.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.action.cmp(&b.action)));
    actions.truncate(config.most_used_actions_limit);
    widgets.push(Widget::MostUsedActions { actions });

    let average_seconds = profile.average_completion_seconds.or_else(|| {
        if profile.average_step_seconds.is_empty() {
            None
        } else {
            Some(profile.average_step_seconds.values().sum())
        }
    });
    if let Some(average_seconds) = average_seconds {
        widgets.push(Widget::EfficiencyScore {
            score: efficiency_score(average_seconds, config.benchmark_completion_seconds),
            average_seconds,
            benchmark_seconds: config.benchmark_completion_seconds,
        });
    }

    widgets
}
