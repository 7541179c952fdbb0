//! HTTP surface: lock administration, pull-closed cleanup and job output
//! streaming over WebSocket.

pub mod api;
pub mod ws;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::config::GitplanToml;
use crate::db::{DbHandle, GitplanDb};
use crate::deploy::{
    AutoApprove, Deployer, DeploymentStore, InMemoryDeploymentStore, RebaseScanner, SqliteDeploymentStore,
    TerraformWorkflow,
};
use crate::events::PullClosedExecutor;
use crate::jobs::{OutputHandler, StorageBackend, storage};
use crate::locking::{
    Backend, Client, CommandLocker, InMemoryBackend, Locker, NoOpLocker, ProjectLocker, SqliteBackend,
    spawn_lock_sweeper,
};
use crate::terraform::AsyncClient;
use crate::vcs::{GithubClient, VcsClient};

pub use api::{ApiError, AppState, SharedState};

/// Build the full application router.
pub fn build_router(state: SharedState) -> Router {
    api::api_router()
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Lock and deployment storage selected by `[database] path`.
#[derive(Clone)]
pub struct Stores {
    pub locks: Arc<dyn Backend>,
    pub deployments: Arc<dyn DeploymentStore>,
}

pub fn open_stores(config: &GitplanToml) -> Result<Stores> {
    let path = &config.database.path;
    if path.as_os_str() == ":memory:" {
        return Ok(Stores {
            locks: Arc::new(InMemoryBackend::new()),
            deployments: Arc::new(InMemoryDeploymentStore::new()),
        });
    }
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context("Failed to create database directory")?;
    }
    let db = DbHandle::new(GitplanDb::new(path).context("Failed to initialize gitplan database")?);
    Ok(Stores {
        locks: Arc::new(SqliteBackend::new(db.clone())),
        deployments: Arc::new(SqliteDeploymentStore::new(db)),
    })
}

/// Wire the long-lived services. Background tasks stop when `cancel` fires.
pub fn build_state(config: &GitplanToml, stores: Stores, cancel: &CancellationToken) -> SharedState {
    let backend = stores.locks;
    let locker: Arc<dyn Locker> = if config.locking.disabled {
        tracing::warn!("locking is disabled; every lock request is granted");
        Arc::new(NoOpLocker)
    } else {
        Arc::new(Client::new(backend.clone()))
    };

    let token = config.github.token.clone().unwrap_or_else(|| {
        tracing::warn!("no GitHub token configured; VCS calls will be unauthenticated");
        String::new()
    });
    let vcs: Arc<dyn VcsClient> = Arc::new(GithubClient::new(&config.github.api_url, token));

    let job_storage: Arc<dyn StorageBackend> = Arc::from(storage::from_config(&config.jobs));
    let output = OutputHandler::new(job_storage, config.jobs.subscriber_buffer);
    let handler = output.clone();
    let handler_cancel = cancel.clone();
    tokio::spawn(async move { handler.handle(handler_cancel).await });

    if !config.locking.disabled
        && let Some(max_age) = config.locking.stale_after()
    {
        spawn_lock_sweeper(
            backend.clone(),
            max_age,
            Duration::from_secs(config.locking.sweep_interval_secs.max(1)),
            cancel.clone(),
        );
    }

    let terraform = AsyncClient::new(&config.terraform, output.clone());
    let workflow = TerraformWorkflow::new(
        terraform,
        locker.clone(),
        Arc::new(AutoApprove),
        &config.terraform.repos_dir,
    )
    .with_cancellation(cancel.child_token());
    let deployer = Deployer::new(
        vcs.clone(),
        stores.deployments,
        Arc::new(workflow),
        RebaseScanner::new(vcs.clone(), config.rebase.retry_policy()),
    );

    let pull_closed = PullClosedExecutor::new(locker.clone(), output.clone(), vcs.clone());
    Arc::new(AppState {
        project_locker: ProjectLocker::new(locker.clone(), vcs),
        locker,
        command_locker: CommandLocker::new(backend),
        output,
        pull_closed,
        deployer: Arc::new(deployer),
        roots: config.roots(),
    })
}

/// Start the gitplan server and run until Ctrl+C.
pub async fn start_server(config: GitplanToml) -> Result<()> {
    let stores = open_stores(&config)?;
    let cancel = CancellationToken::new();
    let state = build_state(&config, stores, &cancel);
    let output = state.output.clone();
    let app = build_router(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    tracing::info!(%local_addr, "gitplan server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    output.flush().await;
    cancel.cancel();
    tracing::info!("server shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}
