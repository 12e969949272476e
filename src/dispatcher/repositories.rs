//! Repository commands.


use tracing::instrument;

use crate::api::protocol::{
    RepositoriesResponse, RepositoryIdParams, RepositoryListParams, RepositoryUpdateParams,
    RepositoryUpsertParams, Response,
};
use crate::core::{ControlResult, EventScope, ObservedEvent};
use crate::store;

use super::Dispatcher;

impl Dispatcher {
    #[instrument(skip(self, params), fields(remote_url = %params.remote_url))]
    pub(super) async fn repository_upsert(
        &self,
        params: RepositoryUpsertParams,
    ) -> ControlResult<Response> {
        let scope = params.scope.resolve();
        let repository = self
            .store()
            .upsert_repository(store::UpsertRepositoryParams {
                id: params.id,
                scope: scope.clone(),
                name: params.name,
                remote_url: params.remote_url,
                default_branch: params.default_branch,
                metadata: params.metadata,
            })
            .await?;

        let mut state = self.state().await;
        state.publish(
            EventScope::workspace(&scope),
            ObservedEvent::RepositoryUpserted {
                repository: repository.clone(),
            },
        );
        drop(state);

        Ok(Response::Repository(repository))
    }

    pub(super) async fn repository_get(
        &self,
        params: RepositoryIdParams,
    ) -> ControlResult<Response> {
        let scope = params.scope.resolve();
        let repository = self.store().require_repository(&scope, &params.id).await?;
        Ok(Response::Repository(repository))
    }

    pub(super) async fn repository_list(
        &self,
        params: RepositoryListParams,
    ) -> ControlResult<Response> {
        let scope = params.scope.resolve();
        let repositories = self
            .store()
            .list_repositories(&scope, params.include_archived)
            .await?;
        Ok(Response::Repositories(RepositoriesResponse { repositories }))
    }

    #[instrument(skip(self, params), fields(repository_id = %params.id))]
    pub(super) async fn repository_update(
        &self,
        params: RepositoryUpdateParams,
    ) -> ControlResult<Response> {
        let scope = params.scope.resolve();
        let repository = self
            .store()
            .update_repository(
                &scope,
                &params.id,
                store::UpdateRepositoryParams {
                    name: params.name,
                    default_branch: params.default_branch,
                    metadata: params.metadata,
                },
            )
            .await?;

        let mut state = self.state().await;
        state.publish(
            EventScope::workspace(&scope),
            ObservedEvent::RepositoryUpdated {
                repository: repository.clone(),
            },
        );
        drop(state);

        Ok(Response::Repository(repository))
    }

    #[instrument(skip(self, params), fields(repository_id = %params.id))]
    pub(super) async fn repository_archive(
        &self,
        params: RepositoryIdParams,
    ) -> ControlResult<Response> {
        let scope = params.scope.resolve();
        let repository = self.store().archive_repository(&scope, &params.id).await?;

        let mut state = self.state().await;
        state.publish(
            EventScope::workspace(&scope),
            ObservedEvent::RepositoryArchived {
                repository_id: repository.id.clone(),
            },
        );
        drop(state);

        Ok(Response::Repository(repository))
    }
}
