//! Task commands, the scheduler entry point, and Linear import.


use tracing::instrument;

use crate::api::protocol::{
    DeletedResponse, LinearIssueImportParams, ProjectParams, ProjectStatusResponse, Response,
    TaskClaimParams, TaskCreateParams, TaskIdParams, TaskListParams, TaskPullParams,
    TaskReorderParams, TaskUpdateCmdParams, TasksResponse,
};
use crate::core::{
    ControlError, ControlResult, Directory, EventScope, LinearFields, ObservedEvent, Scope,
};
use crate::linear;
use crate::scheduler::{
    self, ProjectPullContext, PullOverrides, evaluate_project_availability,
};
use crate::store;

use super::Dispatcher;

impl Dispatcher {
    #[instrument(skip(self, params), fields(title = %params.title))]
    pub(super) async fn task_create(
        &self,
        params: TaskCreateParams,
    ) -> ControlResult<Response> {
        let scope = params.scope.resolve();
        let task = self
            .store()
            .create_task(store::CreateTaskParams {
                id: params.id,
                scope: scope.clone(),
                repository_id: params.repository_id,
                project_id: params.project_id,
                title: params.title,
                body: params.body,
                status: params.status,
                linear: params.linear,
            })
            .await?;

        self.publish_task_event(&scope, ObservedEvent::TaskCreated { task: task.clone() })
            .await;
        Ok(Response::Task(Box::new(task)))
    }

    pub(super) async fn task_get(
        &self,
        params: TaskIdParams,
    ) -> ControlResult<Response> {
        let scope = params.scope.resolve();
        let task = self.store().require_task(&scope, &params.id).await?;
        Ok(Response::Task(Box::new(task)))
    }

    pub(super) async fn task_list(
        &self,
        params: TaskListParams,
    ) -> ControlResult<Response> {
        let scope = params.scope.resolve();
        let tasks = self
            .store()
            .list_tasks(
                &scope,
                params.status,
                params.scope_kind,
                params.repository_id.as_deref(),
                params.project_id.as_deref(),
            )
            .await?;
        Ok(Response::Tasks(TasksResponse { tasks }))
    }

    #[instrument(skip(self, params), fields(task_id = %params.id))]
    pub(super) async fn task_update(
        &self,
        params: TaskUpdateCmdParams,
    ) -> ControlResult<Response> {
        let scope = params.scope.resolve();
        let task = self
            .store()
            .update_task(
                &scope,
                &params.id,
                store::UpdateTaskParams {
                    title: params.title,
                    body: params.body,
                    linear: params.linear,
                },
            )
            .await?;

        self.publish_task_event(&scope, ObservedEvent::TaskUpdated { task: task.clone() })
            .await;
        Ok(Response::Task(Box::new(task)))
    }

    #[instrument(skip(self, params), fields(task_id = %params.id))]
    pub(super) async fn task_delete(
        &self,
        params: TaskIdParams,
    ) -> ControlResult<Response> {
        let scope = params.scope.resolve();
        self.store().delete_task(&scope, &params.id).await?;

        self.publish_task_event(
            &scope,
            ObservedEvent::TaskDeleted {
                task_id: params.id.clone(),
            },
        )
        .await;
        Ok(Response::Deleted(DeletedResponse {
            id: params.id,
            deleted: true,
        }))
    }

    #[instrument(skip(self, params), fields(task_id = %params.id, controller_id = %params.controller_id))]
    pub(super) async fn task_claim(
        &self,
        params: TaskClaimParams,
    ) -> ControlResult<Response> {
        let scope = params.scope.resolve();
        let task = self
            .store()
            .claim_task(store::ClaimTaskParams {
                scope: scope.clone(),
                task_id: params.id,
                controller_id: params.controller_id,
                directory_id: params.directory_id,
                branch_name: params.branch_name,
                base_branch: params.base_branch,
            })
            .await?;

        self.publish_task_event(&scope, ObservedEvent::TaskUpdated { task: task.clone() })
            .await;
        Ok(Response::Task(Box::new(task)))
    }

    pub(super) async fn task_complete(
        &self,
        params: TaskIdParams,
    ) -> ControlResult<Response> {
        let scope = params.scope.resolve();
        let task = self.store().complete_task(&scope, &params.id).await?;
        self.publish_task_event(&scope, ObservedEvent::TaskUpdated { task: task.clone() })
            .await;
        Ok(Response::Task(Box::new(task)))
    }

    pub(super) async fn task_ready(
        &self,
        params: TaskIdParams,
    ) -> ControlResult<Response> {
        let scope = params.scope.resolve();
        let task = self.store().ready_task(&scope, &params.id).await?;
        self.publish_task_event(&scope, ObservedEvent::TaskUpdated { task: task.clone() })
            .await;
        Ok(Response::Task(Box::new(task)))
    }

    pub(super) async fn task_draft(
        &self,
        params: TaskIdParams,
    ) -> ControlResult<Response> {
        let scope = params.scope.resolve();
        let task = self.store().draft_task(&scope, &params.id).await?;
        self.publish_task_event(&scope, ObservedEvent::TaskUpdated { task: task.clone() })
            .await;
        Ok(Response::Task(Box::new(task)))
    }

    #[instrument(skip(self, params), fields(count = params.ordered_task_ids.len()))]
    pub(super) async fn task_reorder(
        &self,
        params: TaskReorderParams,
    ) -> ControlResult<Response> {
        let scope = params.scope.resolve();
        let tasks = self
            .store()
            .reorder_tasks(
                &scope,
                params.project_id.as_deref(),
                params.repository_id.as_deref(),
                &params.ordered_task_ids,
            )
            .await?;

        self.publish_task_event(
            &scope,
            ObservedEvent::TasksReordered {
                task_ids: tasks.iter().map(|t| t.id.clone()).collect(),
            },
        )
        .await;
        Ok(Response::Tasks(TasksResponse { tasks }))
    }

    /// Claim one ready task for a project or across a repository.
    #[instrument(skip(self, params), fields(controller_id = %params.controller_id))]
    pub(super) async fn task_pull(
        &self,
        params: TaskPullParams,
    ) -> ControlResult<Response> {
        let scope = params.scope.resolve();
        let overrides = PullOverrides {
            branch_name: params.branch_name.clone(),
            base_branch: params.base_branch.clone(),
        };

        let outcome = match (params.directory_id.as_deref(), params.repository_id.as_deref()) {
            (Some(directory_id), _) => {
                let directory = self.store().require_directory(&scope, directory_id).await?;
                let ctx = self.build_pull_context(directory).await?;
                scheduler::pull_for_directory(
                    self.store(),
                    &ctx,
                    params.repository_id.as_deref(),
                    &params.controller_id,
                    &overrides,
                )
                .await?
            }
            (None, Some(repository_id)) => {
                self.store().require_repository(&scope, repository_id).await?;

                let directories = self.store().list_directories(&scope, false).await?;
                let mut contexts = Vec::with_capacity(directories.len());
                for directory in directories {
                    contexts.push(self.build_pull_context(directory).await?);
                }

                scheduler::pull_for_repository(
                    self.store(),
                    &contexts,
                    repository_id,
                    &params.controller_id,
                    &overrides,
                )
                .await?
            }
            (None, None) => {
                return Err(ControlError::precondition(
                    "task pull requires directoryId or repositoryId",
                ));
            }
        };

        if let Some(ref task) = outcome.task {
            self.publish_task_event(&scope, ObservedEvent::TaskUpdated { task: task.clone() })
                .await;
        }

        Ok(Response::Pull(Box::new(outcome)))
    }

    /// Aggregate status for one project.
    pub(super) async fn project_status(
        &self,
        params: ProjectParams,
    ) -> ControlResult<Response> {
        let scope = params.scope.resolve();
        let directory = self
            .store()
            .require_directory(&scope, &params.directory_id)
            .await?;
        let ctx = self.build_pull_context(directory.clone()).await?;
        let availability = evaluate_project_availability(&ctx, None);

        Ok(Response::ProjectStatus(Box::new(ProjectStatusResponse {
            directory,
            availability,
            reason: availability.reason().to_owned(),
            git: ctx.git,
            settings: ctx.settings,
            automation: ctx.automation,
            live_thread_count: ctx.live_threads,
        })))
    }

    /// Import a Linear issue as a task.
    #[instrument(skip(self, params))]
    pub(super) async fn linear_issue_import(
        &self,
        params: LinearIssueImportParams,
    ) -> ControlResult<Response> {
        if !self.config().linear.enabled {
            return Err(ControlError::validation("linear integration is disabled"));
        }
        let Some(api) = self.linear.clone() else {
            return Err(ControlError::validation(format!(
                "linear api key not configured: set {}",
                self.config().linear.api_key_env
            )));
        };

        let identifier = params
            .identifier
            .as_deref()
            .and_then(linear::normalize_linear_identifier)
            .or_else(|| {
                params
                    .url
                    .as_deref()
                    .and_then(linear::parse_linear_issue_url)
            })
            .ok_or_else(|| {
                ControlError::validation("expected linear issue url or identifier")
            })?;

        if params.repository_id.is_none() && params.project_id.is_none() {
            return Err(ControlError::precondition(
                "task scope required: repositoryId or projectId",
            ));
        }

        let issue = api
            .issue_by_identifier(&identifier)
            .await?
            .ok_or_else(|| {
                ControlError::validation(format!("linear issue not found: {identifier}"))
            })?;

        let scope = params.scope.resolve();
        let task = self
            .store()
            .create_task(store::CreateTaskParams {
                id: None,
                scope: scope.clone(),
                repository_id: params.repository_id,
                project_id: params.project_id,
                title: issue.title.clone(),
                body: issue.description.clone(),
                status: params.status,
                linear: Some(LinearFields {
                    issue_id: Some(issue.id),
                    identifier: Some(issue.identifier),
                    team: issue.team,
                    project: issue.project,
                    state: issue.state,
                    assignee: issue.assignee,
                    priority: issue.priority,
                    estimate: issue.estimate,
                    due_date: issue.due_date,
                    label_ids: issue.label_ids,
                }),
            })
            .await?;

        self.publish_task_event(&scope, ObservedEvent::TaskCreated { task: task.clone() })
            .await;
        Ok(Response::Task(Box::new(task)))
    }

    /// Assemble everything the scheduler needs about one directory.
    pub(crate) async fn build_pull_context(
        &self,
        directory: Directory,
    ) -> ControlResult<ProjectPullContext> {
        let scope = directory.scope.clone();
        let settings = self
            .store()
            .get_project_settings(&scope, &directory.id)
            .await?;

        let state = self.state().await;
        let git = state.git_status.get(&directory.id).cloned();
        let live_threads = state.sessions.live_thread_count(&directory.id);
        drop(state);

        let automation = self
            .store()
            .effective_automation_for_directory(
                &scope,
                &directory.id,
                git.as_ref().and_then(|g| g.repository_id.as_deref()),
            )
            .await?;

        let claimed_tasks = self
            .store()
            .count_in_progress_tasks_for_directory(&scope, &directory.id)
            .await?;

        Ok(ProjectPullContext {
            directory,
            settings,
            automation,
            git,
            live_threads,
            claimed_tasks,
        })
    }

    async fn publish_task_event(&self, scope: &Scope, event: ObservedEvent) {
        let mut state = self.state().await;
        state.publish(EventScope::workspace(scope), event);
    }
}
