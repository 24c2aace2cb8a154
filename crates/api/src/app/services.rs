//! Collaborator wiring for one orchestrator instance.

use std::sync::Arc;

use anyhow::Context;
use sqlx::PgPool;
use tracing::{info, warn};

use curator_infra::config::Config;
use curator_infra::external::{HttpCallbackSink, OpenAiBatchClient};
use curator_infra::jobs::{CallbackSink, Collaborators};
use curator_infra::store::{DurableStore, InMemoryDurableStore, PostgresDurableStore};
use curator_infra::vector_store::{InMemoryVectorStore, PostgresVectorStore, VectorStore};

/// Build the durable store, job provider, vector store and consumer sink
/// described by `config`.
///
/// With `DATABASE_URL` set, Postgres backs both stores; otherwise state is
/// kept in memory and lost on restart.
pub async fn build_collaborators(config: &Config) -> anyhow::Result<Collaborators> {
    let (store, vectors): (Arc<dyn DurableStore>, Arc<dyn VectorStore>) =
        match &config.database_url {
            Some(url) => {
                let pool = PgPool::connect(url)
                    .await
                    .context("failed to connect to DATABASE_URL")?;
                let store = PostgresDurableStore::new(pool.clone(), config.scope.clone());
                store
                    .ensure_schema()
                    .await
                    .context("failed to create orchestrator tables")?;
                info!(scope = %config.scope, "using postgres durable store");
                (Arc::new(store), Arc::new(PostgresVectorStore::new(pool)))
            }
            None => {
                warn!("DATABASE_URL not set; orchestrator state will not survive a restart");
                (
                    Arc::new(InMemoryDurableStore::new()),
                    Arc::new(InMemoryVectorStore::permissive()),
                )
            }
        };

    let provider = OpenAiBatchClient::new(&config.provider)
        .context("job provider is not configured")?;

    let sink = HttpCallbackSink::from_config(&config.callback)
        .map(|sink| Arc::new(sink) as Arc<dyn CallbackSink>);
    if sink.is_none() {
        warn!("CALLBACK_URL not set; notifications will wait in the pending-callback ledger");
    }

    Ok(Collaborators {
        store,
        provider: Arc::new(provider),
        vectors,
        sink,
    })
}
