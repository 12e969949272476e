use chrono::Utc;
use tracing::instrument;

use crate::core::{
    ControlError, ControlResult, LinearFields, Scope, Task, TaskClaim, TaskScopeKind, TaskStatus,
};
use crate::utils::ids::prefixed_id;

use super::{SqliteStore, parse_opt_ts, parse_ts};

/// Parameters for [`SqliteStore::create_task`].
#[derive(Debug, Clone)]
pub struct CreateTaskParams {
    /// Explicit id, or `None` to generate one.
    pub id: Option<String>,

    /// Scope triple of the caller.
    pub scope: Scope,

    /// Repository link, if any.
    pub repository_id: Option<String>,

    /// Project (directory) link, if any. Wins over the repository link.
    pub project_id: Option<String>,

    /// Short title.
    pub title: String,

    /// Longer body text.
    pub body: String,

    /// Initial status; only `draft` or `ready` are accepted.
    pub status: Option<TaskStatus>,

    /// Linear metadata, when imported.
    pub linear: Option<LinearFields>,
}

/// Parameters for [`SqliteStore::update_task`].
#[derive(Debug, Clone, Default)]
pub struct UpdateTaskParams {
    /// New title, when changing.
    pub title: Option<String>,

    /// New body, when changing.
    pub body: Option<String>,

    /// New Linear metadata, when changing.
    pub linear: Option<LinearFields>,
}

/// Parameters for [`SqliteStore::claim_task`].
#[derive(Debug, Clone)]
pub struct ClaimTaskParams {
    /// Scope triple of the caller.
    pub scope: Scope,

    /// Task to claim.
    pub task_id: String,

    /// Controller taking the claim.
    pub controller_id: String,

    /// Directory the work happens in, when known; must be active and
    /// scope-matched.
    pub directory_id: Option<String>,

    /// Working branch.
    pub branch_name: Option<String>,

    /// Base branch.
    pub base_branch: Option<String>,
}

impl SqliteStore {
    /// Create a task.
    ///
    /// The scope kind is derived from the links (project wins over
    /// repository); the order index is appended at the end of the derived
    /// ordering scope.
    ///
    /// # Errors
    ///
    /// Fails on an id conflict, a missing or archived linked record, a
    /// scope mismatch, or invalid Linear metadata.
    #[instrument(skip(self, params), fields(title = %params.title))]
    pub async fn create_task(&self, params: CreateTaskParams) -> ControlResult<Task> {
        if params.title.trim().is_empty() {
            return Err(ControlError::validation("expected non-empty title"));
        }
        if let Some(status) = params.status {
            if !matches!(status, TaskStatus::Draft | TaskStatus::Ready) {
                return Err(ControlError::validation(
                    "expected draft or ready for task status",
                ));
            }
        }
        if let Some(ref linear) = params.linear {
            linear.validate()?;
        }

        let mut tx = self.pool.begin().await?;

        let id = params.id.unwrap_or_else(|| prefixed_id("task"));
        let taken: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM tasks WHERE task_id = ?")
            .bind(&id)
            .fetch_one(&mut *tx)
            .await?;
        if taken > 0 {
            return Err(ControlError::conflict("task already exists"));
        }

        Self::check_task_links(
            &mut tx,
            &params.scope,
            params.repository_id.as_deref(),
            params.project_id.as_deref(),
        )
        .await?;

        let scope_kind = Task::derive_scope_kind(
            params.project_id.as_deref(),
            params.repository_id.as_deref(),
        );
        let order_index = Self::next_task_order_index(
            &mut tx,
            &params.scope,
            scope_kind,
            params.project_id.as_deref(),
            params.repository_id.as_deref(),
        )
        .await?;

        let now = Utc::now();
        sqlx::query(
            r"
            INSERT INTO tasks (
                task_id, tenant_id, user_id, workspace_id,
                repository_id, project_id, scope_kind,
                title, body, status, order_index, linear_json,
                created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ",
        )
        .bind(&id)
        .bind(&params.scope.tenant_id)
        .bind(&params.scope.user_id)
        .bind(&params.scope.workspace_id)
        .bind(&params.repository_id)
        .bind(&params.project_id)
        .bind(scope_kind.as_str())
        .bind(&params.title)
        .bind(&params.body)
        .bind(params.status.unwrap_or(TaskStatus::Draft).as_str())
        .bind(order_index)
        .bind(
            params
                .linear
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
        )
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .execute(&mut *tx)
        .await?;

        let task = Self::reread_task(&mut tx, &id, "create").await?;
        tx.commit().await?;
        Ok(task)
    }

    /// Fetch a task by id within a scope.
    ///
    /// # Errors
    ///
    /// Fails only on storage errors; an absent row returns `Ok(None)`.
    pub async fn get_task(&self, scope: &Scope, task_id: &str) -> ControlResult<Option<Task>> {
        let row = sqlx::query_as::<_, TaskRow>(
            r"
            SELECT * FROM tasks
            WHERE task_id = ? AND tenant_id = ? AND user_id = ? AND workspace_id = ?
            ",
        )
        .bind(task_id)
        .bind(&scope.tenant_id)
        .bind(&scope.user_id)
        .bind(&scope.workspace_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(TryInto::try_into).transpose()
    }

    /// Fetch a task by id, failing with `task not found` when absent.
    ///
    /// # Errors
    ///
    /// Fails when the task does not exist in this scope.
    pub async fn require_task(&self, scope: &Scope, task_id: &str) -> ControlResult<Task> {
        self.get_task(scope, task_id)
            .await?
            .ok_or_else(|| ControlError::not_found("task"))
    }

    /// List tasks in a scope with optional filters, in ordering-scope
    /// order.
    ///
    /// # Errors
    ///
    /// Fails only on storage errors.
    pub async fn list_tasks(
        &self,
        scope: &Scope,
        status: Option<TaskStatus>,
        scope_kind: Option<TaskScopeKind>,
        repository_id: Option<&str>,
        project_id: Option<&str>,
    ) -> ControlResult<Vec<Task>> {
        let mut sql = String::from(
            "SELECT * FROM tasks WHERE tenant_id = ? AND user_id = ? AND workspace_id = ?",
        );
        if status.is_some() {
            sql.push_str(" AND status = ?");
        }
        if scope_kind.is_some() {
            sql.push_str(" AND scope_kind = ?");
        }
        if repository_id.is_some() {
            sql.push_str(" AND repository_id = ?");
        }
        if project_id.is_some() {
            sql.push_str(" AND project_id = ?");
        }
        sql.push_str(" ORDER BY order_index ASC, created_at ASC, task_id ASC");

        let mut query = sqlx::query_as::<_, TaskRow>(&sql)
            .bind(&scope.tenant_id)
            .bind(&scope.user_id)
            .bind(&scope.workspace_id);
        if let Some(status) = status {
            query = query.bind(status.as_str());
        }
        if let Some(kind) = scope_kind {
            query = query.bind(kind.as_str());
        }
        if let Some(repo) = repository_id {
            query = query.bind(repo);
        }
        if let Some(project) = project_id {
            query = query.bind(project);
        }

        let rows = query.fetch_all(&self.pool).await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    /// Ready project-scoped tasks for one directory, in pull order.
    ///
    /// # Errors
    ///
    /// Fails only on storage errors.
    pub async fn list_ready_project_tasks(
        &self,
        scope: &Scope,
        directory_id: &str,
    ) -> ControlResult<Vec<Task>> {
        self.list_tasks(
            scope,
            Some(TaskStatus::Ready),
            Some(TaskScopeKind::Project),
            None,
            Some(directory_id),
        )
        .await
    }

    /// Ready repository-scoped tasks for one repository, in pull order.
    ///
    /// # Errors
    ///
    /// Fails only on storage errors.
    pub async fn list_ready_repository_tasks(
        &self,
        scope: &Scope,
        repository_id: &str,
    ) -> ControlResult<Vec<Task>> {
        self.list_tasks(
            scope,
            Some(TaskStatus::Ready),
            Some(TaskScopeKind::Repository),
            Some(repository_id),
            None,
        )
        .await
    }

    /// Number of in-progress tasks claimed against a directory.
    ///
    /// # Errors
    ///
    /// Fails only on storage errors.
    pub async fn count_in_progress_tasks_for_directory(
        &self,
        scope: &Scope,
        directory_id: &str,
    ) -> ControlResult<usize> {
        let count: i64 = sqlx::query_scalar(
            r"
            SELECT COUNT(*) FROM tasks
            WHERE tenant_id = ? AND user_id = ? AND workspace_id = ?
              AND status = 'in-progress' AND claimed_by_directory_id = ?
            ",
        )
        .bind(&scope.tenant_id)
        .bind(&scope.user_id)
        .bind(&scope.workspace_id)
        .bind(directory_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(usize::try_from(count).unwrap_or(0))
    }

    /// Ready global-scoped tasks, in pull order.
    ///
    /// # Errors
    ///
    /// Fails only on storage errors.
    pub async fn list_ready_global_tasks(&self, scope: &Scope) -> ControlResult<Vec<Task>> {
        self.list_tasks(
            scope,
            Some(TaskStatus::Ready),
            Some(TaskScopeKind::Global),
            None,
            None,
        )
        .await
    }

    /// Update a task's mutable fields.
    ///
    /// # Errors
    ///
    /// Fails when the task does not exist or the Linear metadata is
    /// invalid.
    #[instrument(skip(self, params))]
    pub async fn update_task(
        &self,
        scope: &Scope,
        task_id: &str,
        params: UpdateTaskParams,
    ) -> ControlResult<Task> {
        if let Some(ref title) = params.title {
            if title.trim().is_empty() {
                return Err(ControlError::validation("expected non-empty title"));
            }
        }
        if let Some(ref linear) = params.linear {
            linear.validate()?;
        }

        let mut tx = self.pool.begin().await?;

        let row = Self::load_task_row(&mut tx, scope, task_id).await?;

        sqlx::query(
            r"
            UPDATE tasks SET title = ?, body = ?, linear_json = ?, updated_at = ?
            WHERE task_id = ?
            ",
        )
        .bind(params.title.as_deref().unwrap_or(&row.title))
        .bind(params.body.as_deref().unwrap_or(&row.body))
        .bind(match params.linear {
            Some(ref linear) => Some(serde_json::to_string(linear)?),
            None => row.linear_json.clone(),
        })
        .bind(Utc::now().to_rfc3339())
        .bind(task_id)
        .execute(&mut *tx)
        .await?;

        let task = Self::reread_task(&mut tx, task_id, "update").await?;
        tx.commit().await?;
        Ok(task)
    }

    /// Delete a task.
    ///
    /// # Errors
    ///
    /// Fails when the task does not exist in this scope.
    #[instrument(skip(self))]
    pub async fn delete_task(&self, scope: &Scope, task_id: &str) -> ControlResult<()> {
        let deleted = sqlx::query(
            r"
            DELETE FROM tasks
            WHERE task_id = ? AND tenant_id = ? AND user_id = ? AND workspace_id = ?
            ",
        )
        .bind(task_id)
        .bind(&scope.tenant_id)
        .bind(&scope.user_id)
        .bind(&scope.workspace_id)
        .execute(&self.pool)
        .await?;

        if deleted.rows_affected() == 0 {
            return Err(ControlError::not_found("task"));
        }
        Ok(())
    }

    /// Transition a task to `ready`, clearing any claim and completion.
    ///
    /// # Errors
    ///
    /// Fails when the task does not exist in this scope.
    #[instrument(skip(self))]
    pub async fn ready_task(&self, scope: &Scope, task_id: &str) -> ControlResult<Task> {
        self.transition_task(scope, task_id, TaskStatus::Ready, "ready")
            .await
    }

    /// Transition a task to `draft`, clearing any claim and completion.
    ///
    /// # Errors
    ///
    /// Fails when the task does not exist in this scope.
    #[instrument(skip(self))]
    pub async fn draft_task(&self, scope: &Scope, task_id: &str) -> ControlResult<Task> {
        self.transition_task(scope, task_id, TaskStatus::Draft, "draft")
            .await
    }

    /// Transition a task to `completed`, stamping `completed_at` and
    /// clearing the claim.
    ///
    /// # Errors
    ///
    /// Fails when the task does not exist in this scope.
    #[instrument(skip(self))]
    pub async fn complete_task(&self, scope: &Scope, task_id: &str) -> ControlResult<Task> {
        self.transition_task(scope, task_id, TaskStatus::Completed, "complete")
            .await
    }

    async fn transition_task(
        &self,
        scope: &Scope,
        task_id: &str,
        to: TaskStatus,
        op: &'static str,
    ) -> ControlResult<Task> {
        let mut tx = self.pool.begin().await?;

        let _ = Self::load_task_row(&mut tx, scope, task_id).await?;

        let completed_at = match to {
            TaskStatus::Completed => Some(Utc::now().to_rfc3339()),
            _ => None,
        };

        sqlx::query(
            r"
            UPDATE tasks SET
                status = ?,
                claimed_by_controller_id = NULL,
                claimed_by_directory_id = NULL,
                branch_name = NULL,
                base_branch = NULL,
                claimed_at = NULL,
                completed_at = ?,
                updated_at = ?
            WHERE task_id = ?
            ",
        )
        .bind(to.as_str())
        .bind(completed_at)
        .bind(Utc::now().to_rfc3339())
        .bind(task_id)
        .execute(&mut *tx)
        .await?;

        let task = Self::reread_task(&mut tx, task_id, op).await?;
        tx.commit().await?;
        Ok(task)
    }

    /// Claim a ready task for a controller.
    ///
    /// Re-claiming an in-progress task is idempotent for the same
    /// controller and refreshes the claim timestamp. Draft and completed
    /// tasks are unclaimable; another controller's claim is a conflict.
    ///
    /// # Errors
    ///
    /// Fails per the task state machine, on a missing or archived claim
    /// directory, or on a scope mismatch.
    #[instrument(skip(self, params), fields(task_id = %params.task_id, controller_id = %params.controller_id))]
    pub async fn claim_task(&self, params: ClaimTaskParams) -> ControlResult<Task> {
        let mut tx = self.pool.begin().await?;

        let row = Self::load_task_row(&mut tx, &params.scope, &params.task_id).await?;
        let status: TaskStatus = row.status.parse()?;

        match status {
            TaskStatus::Draft => {
                return Err(ControlError::precondition("cannot claim draft task"));
            }
            TaskStatus::Completed => {
                return Err(ControlError::precondition("cannot claim completed task"));
            }
            TaskStatus::InProgress => {
                let holder = row.claimed_by_controller_id.as_deref().unwrap_or("");
                if holder != params.controller_id {
                    return Err(ControlError::conflict(format!(
                        "task already claimed: {holder}"
                    )));
                }
            }
            TaskStatus::Ready => {}
        }

        if let Some(ref directory_id) = params.directory_id {
            let directory = sqlx::query_as::<_, ClaimDirRow>(
                r"
                SELECT tenant_id, user_id, workspace_id, archived_at
                FROM directories WHERE directory_id = ?
                ",
            )
            .bind(directory_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| ControlError::not_found("directory"))?;

            if directory.archived_at.is_some() {
                return Err(ControlError::not_found("directory"));
            }
            if directory.tenant_id != params.scope.tenant_id
                || directory.user_id != params.scope.user_id
                || directory.workspace_id != params.scope.workspace_id
            {
                return Err(ControlError::scope_mismatch("task directory"));
            }
        }

        let now = Utc::now();
        sqlx::query(
            r"
            UPDATE tasks SET
                status = 'in-progress',
                claimed_by_controller_id = ?,
                claimed_by_directory_id = ?,
                branch_name = ?,
                base_branch = ?,
                claimed_at = ?,
                completed_at = NULL,
                updated_at = ?
            WHERE task_id = ?
            ",
        )
        .bind(&params.controller_id)
        .bind(&params.directory_id)
        .bind(&params.branch_name)
        .bind(&params.base_branch)
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .bind(&params.task_id)
        .execute(&mut *tx)
        .await?;

        let task = Self::reread_task(&mut tx, &params.task_id, "claim").await?;
        tx.commit().await?;
        Ok(task)
    }

    /// Reorder tasks within one ordering scope.
    ///
    /// Listed ids take `order_index = position`; the remaining tasks in
    /// the scope follow in their prior relative order. Blank ids are
    /// trimmed; duplicates and ids outside the scope are rejected.
    ///
    /// # Errors
    ///
    /// Fails on duplicate ids, ids outside the ordering scope, or storage
    /// errors.
    #[instrument(skip(self, ordered_task_ids))]
    pub async fn reorder_tasks(
        &self,
        scope: &Scope,
        project_id: Option<&str>,
        repository_id: Option<&str>,
        ordered_task_ids: &[String],
    ) -> ControlResult<Vec<Task>> {
        let listed: Vec<&str> = ordered_task_ids
            .iter()
            .map(String::as_str)
            .filter(|id| !id.trim().is_empty())
            .collect();

        {
            let mut seen = std::collections::HashSet::new();
            for id in &listed {
                if !seen.insert(*id) {
                    return Err(ControlError::validation(
                        "orderedTaskIds contains duplicate ids",
                    ));
                }
            }
        }

        let mut tx = self.pool.begin().await?;

        let scope_kind = Task::derive_scope_kind(project_id, repository_id);
        let mut sql = String::from(
            r"
            SELECT * FROM tasks
            WHERE tenant_id = ? AND user_id = ? AND workspace_id = ? AND scope_kind = ?
            ",
        );
        match scope_kind {
            TaskScopeKind::Project => sql.push_str(" AND project_id = ?"),
            TaskScopeKind::Repository => sql.push_str(" AND repository_id = ?"),
            TaskScopeKind::Global => {}
        }
        sql.push_str(" ORDER BY order_index ASC, created_at ASC, task_id ASC");

        let mut query = sqlx::query_as::<_, TaskRow>(&sql)
            .bind(&scope.tenant_id)
            .bind(&scope.user_id)
            .bind(&scope.workspace_id)
            .bind(scope_kind.as_str());
        match scope_kind {
            TaskScopeKind::Project => query = query.bind(project_id),
            TaskScopeKind::Repository => query = query.bind(repository_id),
            TaskScopeKind::Global => {}
        }

        let rows = query.fetch_all(&mut *tx).await?;
        let in_scope: std::collections::HashSet<&str> =
            rows.iter().map(|r| r.task_id.as_str()).collect();

        for id in &listed {
            if !in_scope.contains(id) {
                return Err(ControlError::not_found("task"));
            }
        }

        let mut new_order: Vec<String> = listed.iter().map(|s| (*s).to_owned()).collect();
        for row in &rows {
            if !listed.contains(&row.task_id.as_str()) {
                new_order.push(row.task_id.clone());
            }
        }

        let now = Utc::now().to_rfc3339();
        for (position, id) in new_order.iter().enumerate() {
            sqlx::query("UPDATE tasks SET order_index = ?, updated_at = ? WHERE task_id = ?")
                .bind(position as i64)
                .bind(&now)
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }

        let mut result = Vec::with_capacity(new_order.len());
        for id in &new_order {
            result.push(Self::reread_task(&mut tx, id, "reorder").await?);
        }

        tx.commit().await?;
        Ok(result)
    }

    /// Next order index in an ordering scope: `max + 1`, starting at 0.
    async fn next_task_order_index(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        scope: &Scope,
        scope_kind: TaskScopeKind,
        project_id: Option<&str>,
        repository_id: Option<&str>,
    ) -> ControlResult<i64> {
        let mut sql = String::from(
            r"
            SELECT MAX(order_index) FROM tasks
            WHERE tenant_id = ? AND user_id = ? AND workspace_id = ? AND scope_kind = ?
            ",
        );
        match scope_kind {
            TaskScopeKind::Project => sql.push_str(" AND project_id = ?"),
            TaskScopeKind::Repository => sql.push_str(" AND repository_id = ?"),
            TaskScopeKind::Global => {}
        }

        let mut query = sqlx::query_scalar::<_, Option<i64>>(&sql)
            .bind(&scope.tenant_id)
            .bind(&scope.user_id)
            .bind(&scope.workspace_id)
            .bind(scope_kind.as_str());
        match scope_kind {
            TaskScopeKind::Project => query = query.bind(project_id),
            TaskScopeKind::Repository => query = query.bind(repository_id),
            TaskScopeKind::Global => {}
        }

        let max = query.fetch_one(&mut **tx).await?;
        Ok(max.map_or(0, |m| m + 1))
    }

    /// Validate repository/project links: present, active, scope-matched.
    async fn check_task_links(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        scope: &Scope,
        repository_id: Option<&str>,
        project_id: Option<&str>,
    ) -> ControlResult<()> {
        if let Some(repo_id) = repository_id {
            let row = sqlx::query_as::<_, ClaimDirRow>(
                r"
                SELECT tenant_id, user_id, workspace_id, archived_at
                FROM repositories WHERE repository_id = ?
                ",
            )
            .bind(repo_id)
            .fetch_optional(&mut **tx)
            .await?
            .ok_or_else(|| ControlError::not_found("repository"))?;

            if row.archived_at.is_some() {
                return Err(ControlError::not_found("repository"));
            }
            if row.tenant_id != scope.tenant_id
                || row.user_id != scope.user_id
                || row.workspace_id != scope.workspace_id
            {
                return Err(ControlError::scope_mismatch("task repository"));
            }
        }

        if let Some(dir_id) = project_id {
            let row = sqlx::query_as::<_, ClaimDirRow>(
                r"
                SELECT tenant_id, user_id, workspace_id, archived_at
                FROM directories WHERE directory_id = ?
                ",
            )
            .bind(dir_id)
            .fetch_optional(&mut **tx)
            .await?
            .ok_or_else(|| ControlError::not_found("directory"))?;

            if row.archived_at.is_some() {
                return Err(ControlError::not_found("directory"));
            }
            if row.tenant_id != scope.tenant_id
                || row.user_id != scope.user_id
                || row.workspace_id != scope.workspace_id
            {
                return Err(ControlError::scope_mismatch("task project"));
            }
        }

        Ok(())
    }

    async fn load_task_row(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        scope: &Scope,
        task_id: &str,
    ) -> ControlResult<TaskRow> {
        sqlx::query_as::<_, TaskRow>(
            r"
            SELECT * FROM tasks
            WHERE task_id = ? AND tenant_id = ? AND user_id = ? AND workspace_id = ?
            ",
        )
        .bind(task_id)
        .bind(&scope.tenant_id)
        .bind(&scope.user_id)
        .bind(&scope.workspace_id)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or_else(|| ControlError::not_found("task"))
    }

    async fn reread_task(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        task_id: &str,
        op: &'static str,
    ) -> ControlResult<Task> {
        let row = sqlx::query_as::<_, TaskRow>("SELECT * FROM tasks WHERE task_id = ?")
            .bind(task_id)
            .fetch_optional(&mut **tx)
            .await?;

        row.ok_or_else(|| ControlError::missing_after("task", op))?
            .try_into()
    }
}

#[derive(sqlx::FromRow)]
struct ClaimDirRow {
    tenant_id: String,
    user_id: String,
    workspace_id: String,
    archived_at: Option<String>,
}

#[derive(sqlx::FromRow)]
struct TaskRow {
    task_id: String,
    tenant_id: String,
    user_id: String,
    workspace_id: String,
    repository_id: Option<String>,
    project_id: Option<String>,
    scope_kind: Option<String>,
    title: String,
    body: String,
    status: String,
    order_index: i64,
    claimed_by_controller_id: Option<String>,
    claimed_by_directory_id: Option<String>,
    branch_name: Option<String>,
    base_branch: Option<String>,
    claimed_at: Option<String>,
    completed_at: Option<String>,
    linear_json: Option<String>,
    created_at: String,
    updated_at: String,
}

impl TryFrom<TaskRow> for Task {
    type Error = ControlError;

    fn try_from(row: TaskRow) -> Result<Self, Self::Error> {
        // A persisted scope kind that is missing or unrecognized is
        // recomputed from the links rather than raised.
        let scope_kind = row
            .scope_kind
            .as_deref()
            .and_then(|k| k.parse::<TaskScopeKind>().ok())
            .unwrap_or_else(|| {
                Task::derive_scope_kind(row.project_id.as_deref(), row.repository_id.as_deref())
            });

        let claim = match row.claimed_by_controller_id {
            Some(controller_id) => Some(TaskClaim {
                controller_id,
                directory_id: row.claimed_by_directory_id,
                branch_name: row.branch_name,
                base_branch: row.base_branch,
                claimed_at: parse_ts(
                    row.claimed_at.as_deref().ok_or_else(|| {
                        ControlError::integrity("task claim missing claimed_at")
                    })?,
                    "task claimed_at",
                )?,
            }),
            None => None,
        };

        // Malformed Linear JSON degrades to the default record.
        let linear = row.linear_json.as_deref().map(|raw| {
            serde_json::from_str::<LinearFields>(raw).unwrap_or_default()
        });

        Ok(Self {
            id: row.task_id,
            scope: Scope::new(row.tenant_id, row.user_id, row.workspace_id),
            repository_id: row.repository_id,
            project_id: row.project_id,
            scope_kind,
            title: row.title,
            body: row.body,
            status: row.status.parse()?,
            order_index: row.order_index,
            claim,
            completed_at: parse_opt_ts(row.completed_at.as_deref(), "task completed_at")?,
            linear,
            created_at: parse_ts(&row.created_at, "task created_at")?,
            updated_at: parse_ts(&row.updated_at, "task updated_at")?,
        })
    }
}
