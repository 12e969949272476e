use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::ControlError;
use super::scope::Scope;

/// Per-directory settings owned exclusively by the directory.
///
/// A default row is synthesized whenever none has been persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectSettings {
    /// Owning directory.
    pub directory_id: String,

    /// Scope triple, matching the directory.
    #[serde(flatten)]
    pub scope: Scope,

    /// Branch the project is pinned to, if any. A pinned project only
    /// schedules work while checked out on this branch.
    pub pinned_branch: Option<String>,

    /// How the scheduler mixes task scopes for this project.
    pub task_focus_mode: TaskFocusMode,

    /// Whether new work reuses an existing thread or spawns a fresh one.
    pub thread_spawn_mode: ThreadSpawnMode,

    /// When the settings row was last written.
    pub updated_at: DateTime<Utc>,
}

impl ProjectSettings {
    /// The synthesized default for a directory with no persisted row.
    #[must_use]
    pub fn default_for(directory_id: &str, scope: &Scope) -> Self {
        Self {
            directory_id: directory_id.to_owned(),
            scope: scope.clone(),
            pinned_branch: None,
            task_focus_mode: TaskFocusMode::Balanced,
            thread_spawn_mode: ThreadSpawnMode::NewThread,
            updated_at: Utc::now(),
        }
    }
}

/// How the scheduler mixes task scopes when pulling for a project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum TaskFocusMode {
    /// Project tasks first, then repository and global tasks.
    #[default]
    Balanced,

    /// Only project-scoped tasks.
    OwnOnly,
}

impl TaskFocusMode {
    /// Stable storage representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Balanced => "balanced",
            Self::OwnOnly => "own-only",
        }
    }
}

impl std::str::FromStr for TaskFocusMode {
    type Err = ControlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "balanced" => Ok(Self::Balanced),
            "own-only" => Ok(Self::OwnOnly),
            other => Err(ControlError::integrity(format!(
                "expected task focus mode enum value, got '{other}'"
            ))),
        }
    }
}

/// Whether new work reuses an existing thread or spawns a fresh one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ThreadSpawnMode {
    /// Spawn a new thread per task.
    #[default]
    NewThread,

    /// Reuse the project's existing thread.
    ReuseThread,
}

impl ThreadSpawnMode {
    /// Stable storage representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NewThread => "new-thread",
            Self::ReuseThread => "reuse-thread",
        }
    }
}

impl std::str::FromStr for ThreadSpawnMode {
    type Err = ControlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new-thread" => Ok(Self::NewThread),
            "reuse-thread" => Ok(Self::ReuseThread),
            other => Err(ControlError::integrity(format!(
                "expected thread spawn mode enum value, got '{other}'"
            ))),
        }
    }
}

/// Automation on/off switches at one scope level.
///
/// Unique by (scope triple, level, scope id). The effective policy for a
/// directory is the first persisted row walking project, then repository,
/// then global, falling back to enabled-and-unfrozen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutomationPolicy {
    /// Unique identifier (`automation-<uuid>`, or the stable synthesized
    /// global default id).
    pub id: String,

    /// Owning scope triple.
    #[serde(flatten)]
    pub scope: Scope,

    /// Which level this policy binds to.
    pub scope_level: PolicyScopeLevel,

    /// Directory or repository id for non-global levels.
    pub scope_id: Option<String>,

    /// Whether automation may claim work at all.
    pub automation_enabled: bool,

    /// Whether automation is temporarily frozen.
    pub frozen: bool,

    /// When the policy row was last written.
    pub updated_at: DateTime<Utc>,
}

impl AutomationPolicy {
    /// Stable id for the synthesized global default row.
    #[must_use]
    pub fn global_default_id(scope: &Scope) -> String {
        format!(
            "automation-global-{}-{}-{}",
            scope.tenant_id, scope.user_id, scope.workspace_id
        )
    }

    /// The synthesized global default: enabled, not frozen.
    #[must_use]
    pub fn default_global(scope: &Scope) -> Self {
        Self {
            id: Self::global_default_id(scope),
            scope: scope.clone(),
            scope_level: PolicyScopeLevel::Global,
            scope_id: None,
            automation_enabled: true,
            frozen: false,
            updated_at: Utc::now(),
        }
    }
}

/// Scope level an automation policy binds to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyScopeLevel {
    /// Applies to the whole scope triple.
    Global,

    /// Applies to one repository.
    Repository,

    /// Applies to one project (directory).
    Project,
}

impl PolicyScopeLevel {
    /// Stable storage representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Global => "global",
            Self::Repository => "repository",
            Self::Project => "project",
        }
    }
}

impl std::str::FromStr for PolicyScopeLevel {
    type Err = ControlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "global" => Ok(Self::Global),
            "repository" => Ok(Self::Repository),
            "project" => Ok(Self::Project),
            other => Err(ControlError::integrity(format!(
                "expected policy scope level enum value, got '{other}'"
            ))),
        }
    }
}

/// Resolved automation switches for one directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EffectiveAutomation {
    /// Whether automation may claim work.
    pub enabled: bool,

    /// Whether automation is frozen.
    pub frozen: bool,
}

impl Default for EffectiveAutomation {
    fn default() -> Self {
        Self {
            enabled: true,
            frozen: false,
        }
    }
}

/// Resolve the effective policy from the project, repository, and global
/// rows, in that precedence order.
#[must_use]
pub fn effective_automation(
    project: Option<&AutomationPolicy>,
    repository: Option<&AutomationPolicy>,
    global: Option<&AutomationPolicy>,
) -> EffectiveAutomation {
    for policy in [project, repository, global].into_iter().flatten() {
        return EffectiveAutomation {
            enabled: policy.automation_enabled,
            frozen: policy.frozen,
        };
    }
    EffectiveAutomation::default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(level: PolicyScopeLevel, enabled: bool, frozen: bool) -> AutomationPolicy {
        AutomationPolicy {
            id: "automation-test".to_owned(),
            scope: Scope::local(),
            scope_level: level,
            scope_id: None,
            automation_enabled: enabled,
            frozen,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn project_policy_wins() {
        let project = policy(PolicyScopeLevel::Project, false, false);
        let global = policy(PolicyScopeLevel::Global, true, true);
        let effective = effective_automation(Some(&project), None, Some(&global));
        assert!(!effective.enabled);
        assert!(!effective.frozen);
    }

    #[test]
    fn absent_rows_fall_back_to_default() {
        let effective = effective_automation(None, None, None);
        assert!(effective.enabled);
        assert!(!effective.frozen);
    }
}
