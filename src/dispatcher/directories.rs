//! Directory, project-settings, and automation-policy commands.


use tracing::instrument;

use crate::api::protocol::{
    AutomationPolicyGetParams, AutomationPolicySetParams, DirectoriesResponse, DirectoryIdParams,
    DirectoryListParams, DirectoryUpsertParams, GitStatusResponse, ProjectParams,
    ProjectSettingsUpdateParams, Response,
};
use crate::core::{
    AutomationPolicy, ControlResult, EventScope, ObservedEvent, PolicyScopeLevel,
};
use crate::store::{UpdateProjectSettingsParams, UpsertDirectoryParams};

use super::Dispatcher;

impl Dispatcher {
    #[instrument(skip(self, params), fields(path = %params.path))]
    pub(super) async fn directory_upsert(
        &self,
        params: DirectoryUpsertParams,
    ) -> ControlResult<Response> {
        let scope = params.scope.resolve();
        let directory = self
            .store()
            .upsert_directory(UpsertDirectoryParams {
                id: params.id,
                scope: scope.clone(),
                path: params.path,
            })
            .await?;

        {
            let mut state = self.state().await;
            state.publish(
                EventScope::directory(&scope, &directory.id),
                ObservedEvent::DirectoryUpserted {
                    directory: directory.clone(),
                },
            );
        }

        // Prime the git-status tracker with a best-effort refresh.
        self.spawn_git_status_refresh(directory.clone());

        Ok(Response::Directory(directory))
    }

    pub(super) async fn directory_list(
        &self,
        params: DirectoryListParams,
    ) -> ControlResult<Response> {
        let scope = params.scope.resolve();
        let directories = self
            .store()
            .list_directories(&scope, params.include_archived)
            .await?;
        Ok(Response::Directories(DirectoriesResponse { directories }))
    }

    #[instrument(skip(self, params), fields(directory_id = %params.id))]
    pub(super) async fn directory_archive(
        &self,
        params: DirectoryIdParams,
    ) -> ControlResult<Response> {
        let scope = params.scope.resolve();
        let directory = self.store().archive_directory(&scope, &params.id).await?;

        let mut state = self.state().await;
        state.git_status.evict(&directory.id);
        state.publish(
            EventScope::directory(&scope, &directory.id),
            ObservedEvent::DirectoryArchived {
                directory_id: directory.id.clone(),
            },
        );
        drop(state);

        Ok(Response::Directory(directory))
    }

    pub(super) async fn directory_git_status(
        &self,
        params: DirectoryIdParams,
    ) -> ControlResult<Response> {
        let scope = params.scope.resolve();
        let directory = self.store().require_directory(&scope, &params.id).await?;

        let state = self.state().await;
        let status = state.git_status.get(&directory.id).cloned();
        drop(state);

        Ok(Response::GitStatus(GitStatusResponse {
            directory_id: directory.id,
            tracked: status.is_some(),
            status,
        }))
    }

    pub(super) async fn project_settings_get(
        &self,
        params: ProjectParams,
    ) -> ControlResult<Response> {
        let scope = params.scope.resolve();
        self.store()
            .require_directory(&scope, &params.directory_id)
            .await?;
        let settings = self
            .store()
            .get_project_settings(&scope, &params.directory_id)
            .await?;
        Ok(Response::Settings(settings))
    }

    #[instrument(skip(self, params), fields(directory_id = %params.directory_id))]
    pub(super) async fn project_settings_update(
        &self,
        params: ProjectSettingsUpdateParams,
    ) -> ControlResult<Response> {
        let scope = params.scope.resolve();
        self.store()
            .require_directory(&scope, &params.directory_id)
            .await?;

        let pinned_branch = if params.clear_pinned_branch {
            Some(None)
        } else {
            params.pinned_branch.map(Some)
        };

        let settings = self
            .store()
            .update_project_settings(
                &scope,
                &params.directory_id,
                UpdateProjectSettingsParams {
                    pinned_branch,
                    task_focus_mode: params.task_focus_mode,
                    thread_spawn_mode: params.thread_spawn_mode,
                },
            )
            .await?;

        let mut state = self.state().await;
        state.publish(
            EventScope::directory(&scope, &params.directory_id),
            ObservedEvent::ProjectSettingsUpdated {
                settings: settings.clone(),
            },
        );
        drop(state);

        Ok(Response::Settings(settings))
    }

    pub(super) async fn automation_policy_get(
        &self,
        params: AutomationPolicyGetParams,
    ) -> ControlResult<Response> {
        let scope = params.scope.resolve();
        let persisted = self
            .store()
            .get_automation_policy(&scope, params.scope_level, params.scope_id.as_deref())
            .await?;

        let policy = persisted.unwrap_or_else(|| {
            // Synthesized default: enabled, not frozen, with a stable id.
            let mut policy = AutomationPolicy::default_global(&scope);
            if params.scope_level != PolicyScopeLevel::Global {
                policy.id = format!(
                    "automation-{}-{}",
                    params.scope_level.as_str(),
                    params.scope_id.as_deref().unwrap_or("")
                );
                policy.scope_level = params.scope_level;
                policy.scope_id = params.scope_id.clone();
            }
            policy
        });

        Ok(Response::Policy(Box::new(policy)))
    }

    #[instrument(skip(self, params), fields(scope_level = ?params.scope_level))]
    pub(super) async fn automation_policy_set(
        &self,
        params: AutomationPolicySetParams,
    ) -> ControlResult<Response> {
        let scope = params.scope.resolve();
        let policy = self
            .store()
            .set_automation_policy(
                &scope,
                params.scope_level,
                params.scope_id.as_deref(),
                params.automation_enabled,
                params.frozen,
            )
            .await?;

        let mut state = self.state().await;
        let event_scope = match (params.scope_level, params.scope_id.as_deref()) {
            (PolicyScopeLevel::Project, Some(directory_id)) => {
                EventScope::directory(&scope, directory_id)
            }
            _ => EventScope::workspace(&scope),
        };
        state.publish(
            event_scope,
            ObservedEvent::AutomationPolicyUpdated {
                policy: policy.clone(),
            },
        );
        drop(state);

        Ok(Response::Policy(Box::new(policy)))
    }
}
