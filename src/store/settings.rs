use chrono::Utc;
use tracing::instrument;

use crate::core::settings::effective_automation;
use crate::core::{
    AutomationPolicy, ControlError, ControlResult, EffectiveAutomation, PolicyScopeLevel,
    ProjectSettings, Scope, TaskFocusMode, ThreadSpawnMode,
};
use crate::utils::ids::prefixed_id;

use super::{SqliteStore, parse_ts};

/// Parameters for [`SqliteStore::update_project_settings`].
#[derive(Debug, Clone, Default)]
pub struct UpdateProjectSettingsParams {
    /// Pinned branch; `Some(None)` clears it, `None` leaves it alone.
    pub pinned_branch: Option<Option<String>>,

    /// New task focus mode, when changing.
    pub task_focus_mode: Option<TaskFocusMode>,

    /// New thread spawn mode, when changing.
    pub thread_spawn_mode: Option<ThreadSpawnMode>,
}

impl SqliteStore {
    /// Project settings for a directory, synthesizing the default row when
    /// none has been persisted.
    ///
    /// # Errors
    ///
    /// Fails only on storage errors or malformed rows.
    pub async fn get_project_settings(
        &self,
        scope: &Scope,
        directory_id: &str,
    ) -> ControlResult<ProjectSettings> {
        let row = sqlx::query_as::<_, ProjectSettingsRow>(
            r"
            SELECT * FROM project_settings
            WHERE directory_id = ? AND tenant_id = ? AND user_id = ? AND workspace_id = ?
            ",
        )
        .bind(directory_id)
        .bind(&scope.tenant_id)
        .bind(&scope.user_id)
        .bind(&scope.workspace_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => row.try_into(),
            None => Ok(ProjectSettings::default_for(directory_id, scope)),
        }
    }

    /// Write project settings for a directory, merging over the current
    /// (possibly synthesized) row.
    ///
    /// # Errors
    ///
    /// Fails when the directory does not exist in this scope.
    #[instrument(skip(self, params))]
    pub async fn update_project_settings(
        &self,
        scope: &Scope,
        directory_id: &str,
        params: UpdateProjectSettingsParams,
    ) -> ControlResult<ProjectSettings> {
        let current = self.get_project_settings(scope, directory_id).await?;

        let pinned_branch = match params.pinned_branch {
            Some(value) => value,
            None => current.pinned_branch,
        };
        let task_focus_mode = params.task_focus_mode.unwrap_or(current.task_focus_mode);
        let thread_spawn_mode = params
            .thread_spawn_mode
            .unwrap_or(current.thread_spawn_mode);

        let mut tx = self.pool.begin().await?;
        let now = Utc::now();

        sqlx::query(
            r"
            INSERT INTO project_settings (
                directory_id, tenant_id, user_id, workspace_id,
                pinned_branch, task_focus_mode, thread_spawn_mode, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (directory_id) DO UPDATE SET
                pinned_branch = excluded.pinned_branch,
                task_focus_mode = excluded.task_focus_mode,
                thread_spawn_mode = excluded.thread_spawn_mode,
                updated_at = excluded.updated_at
            ",
        )
        .bind(directory_id)
        .bind(&scope.tenant_id)
        .bind(&scope.user_id)
        .bind(&scope.workspace_id)
        .bind(&pinned_branch)
        .bind(task_focus_mode.as_str())
        .bind(thread_spawn_mode.as_str())
        .bind(now.to_rfc3339())
        .execute(&mut *tx)
        .await?;

        let row = sqlx::query_as::<_, ProjectSettingsRow>(
            "SELECT * FROM project_settings WHERE directory_id = ?",
        )
        .bind(directory_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| ControlError::missing_after("project settings", "update"))?;

        let settings = row.try_into()?;
        tx.commit().await?;
        Ok(settings)
    }

    /// Fetch the persisted automation policy for one level, if any.
    ///
    /// # Errors
    ///
    /// Fails only on storage errors or malformed rows.
    pub async fn get_automation_policy(
        &self,
        scope: &Scope,
        scope_level: PolicyScopeLevel,
        scope_id: Option<&str>,
    ) -> ControlResult<Option<AutomationPolicy>> {
        let row = sqlx::query_as::<_, AutomationPolicyRow>(
            r"
            SELECT * FROM automation_policies
            WHERE tenant_id = ? AND user_id = ? AND workspace_id = ?
              AND scope_level = ? AND scope_ref = ?
            ",
        )
        .bind(&scope.tenant_id)
        .bind(&scope.user_id)
        .bind(&scope.workspace_id)
        .bind(scope_level.as_str())
        .bind(scope_id.unwrap_or(""))
        .fetch_optional(&self.pool)
        .await?;

        row.map(TryInto::try_into).transpose()
    }

    /// Fetch a level's policy, synthesizing the stable global default for
    /// an absent global row.
    ///
    /// # Errors
    ///
    /// Fails when a non-global level has no persisted row.
    pub async fn get_automation_policy_or_default(
        &self,
        scope: &Scope,
        scope_level: PolicyScopeLevel,
        scope_id: Option<&str>,
    ) -> ControlResult<AutomationPolicy> {
        match self
            .get_automation_policy(scope, scope_level, scope_id)
            .await?
        {
            Some(policy) => Ok(policy),
            None if scope_level == PolicyScopeLevel::Global => {
                Ok(AutomationPolicy::default_global(scope))
            }
            None => Err(ControlError::not_found("automation policy")),
        }
    }

    /// Write an automation policy, upserting by (scope, level, scope id).
    ///
    /// # Errors
    ///
    /// Fails when a non-global level omits the scope id.
    #[instrument(skip(self))]
    pub async fn set_automation_policy(
        &self,
        scope: &Scope,
        scope_level: PolicyScopeLevel,
        scope_id: Option<&str>,
        automation_enabled: bool,
        frozen: bool,
    ) -> ControlResult<AutomationPolicy> {
        if scope_level != PolicyScopeLevel::Global && scope_id.is_none() {
            return Err(ControlError::validation("expected non-empty scopeId"));
        }

        let mut tx = self.pool.begin().await?;
        let now = Utc::now();
        let id = match scope_level {
            PolicyScopeLevel::Global => AutomationPolicy::global_default_id(scope),
            _ => prefixed_id("automation"),
        };

        sqlx::query(
            r"
            INSERT INTO automation_policies (
                policy_id, tenant_id, user_id, workspace_id,
                scope_level, scope_ref, automation_enabled, frozen, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (tenant_id, user_id, workspace_id, scope_level, scope_ref)
            DO UPDATE SET
                automation_enabled = excluded.automation_enabled,
                frozen = excluded.frozen,
                updated_at = excluded.updated_at
            ",
        )
        .bind(&id)
        .bind(&scope.tenant_id)
        .bind(&scope.user_id)
        .bind(&scope.workspace_id)
        .bind(scope_level.as_str())
        .bind(scope_id.unwrap_or(""))
        .bind(i64::from(automation_enabled))
        .bind(i64::from(frozen))
        .bind(now.to_rfc3339())
        .execute(&mut *tx)
        .await?;

        let row = sqlx::query_as::<_, AutomationPolicyRow>(
            r"
            SELECT * FROM automation_policies
            WHERE tenant_id = ? AND user_id = ? AND workspace_id = ?
              AND scope_level = ? AND scope_ref = ?
            ",
        )
        .bind(&scope.tenant_id)
        .bind(&scope.user_id)
        .bind(&scope.workspace_id)
        .bind(scope_level.as_str())
        .bind(scope_id.unwrap_or(""))
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| ControlError::missing_after("automation policy", "set"))?;

        let policy = row.try_into()?;
        tx.commit().await?;
        Ok(policy)
    }

    /// Resolve the effective automation switches for a directory:
    /// project row, then repository row, then global row, then the
    /// enabled-and-unfrozen default.
    ///
    /// # Errors
    ///
    /// Fails only on storage errors or malformed rows.
    pub async fn effective_automation_for_directory(
        &self,
        scope: &Scope,
        directory_id: &str,
        repository_id: Option<&str>,
    ) -> ControlResult<EffectiveAutomation> {
        let project = self
            .get_automation_policy(scope, PolicyScopeLevel::Project, Some(directory_id))
            .await?;
        let repository = match repository_id {
            Some(repo_id) => {
                self.get_automation_policy(scope, PolicyScopeLevel::Repository, Some(repo_id))
                    .await?
            }
            None => None,
        };
        let global = self
            .get_automation_policy(scope, PolicyScopeLevel::Global, None)
            .await?;

        Ok(effective_automation(
            project.as_ref(),
            repository.as_ref(),
            global.as_ref(),
        ))
    }
}

#[derive(sqlx::FromRow)]
struct ProjectSettingsRow {
    directory_id: String,
    tenant_id: String,
    user_id: String,
    workspace_id: String,
    pinned_branch: Option<String>,
    task_focus_mode: String,
    thread_spawn_mode: String,
    updated_at: String,
}

impl TryFrom<ProjectSettingsRow> for ProjectSettings {
    type Error = ControlError;

    fn try_from(row: ProjectSettingsRow) -> Result<Self, Self::Error> {
        Ok(Self {
            directory_id: row.directory_id,
            scope: Scope::new(row.tenant_id, row.user_id, row.workspace_id),
            pinned_branch: row.pinned_branch,
            task_focus_mode: row.task_focus_mode.parse()?,
            thread_spawn_mode: row.thread_spawn_mode.parse()?,
            updated_at: parse_ts(&row.updated_at, "project settings updated_at")?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct AutomationPolicyRow {
    policy_id: String,
    tenant_id: String,
    user_id: String,
    workspace_id: String,
    scope_level: String,
    scope_ref: String,
    automation_enabled: i64,
    frozen: i64,
    updated_at: String,
}

impl TryFrom<AutomationPolicyRow> for AutomationPolicy {
    type Error = ControlError;

    fn try_from(row: AutomationPolicyRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.policy_id,
            scope: Scope::new(row.tenant_id, row.user_id, row.workspace_id),
            scope_level: row.scope_level.parse()?,
            scope_id: if row.scope_ref.is_empty() {
                None
            } else {
                Some(row.scope_ref)
            },
            automation_enabled: row.automation_enabled != 0,
            frozen: row.frozen != 0,
            updated_at: parse_ts(&row.updated_at, "automation policy updated_at")?,
        })
    }
}
