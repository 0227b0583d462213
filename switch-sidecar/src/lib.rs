// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The switch sidecar: runs next to one worker and keeps its lifecycle state
//! in line with the desired state pushed by the controller, or recorded in
//! the fallback directory.

use cutover_common::FileKv;
use display_error_chain::DisplayErrorChain;
use dropshot::HttpServer;
use slog::{error, info, o, Drain, Logger};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

mod config;
mod context;
mod fallback;
mod http_entrypoints;
mod lifecycle;
mod reconciler;
mod stats;
mod task;

pub use config::{Config, ConfigError, LifecycleConfig, ReconcilerConfig};
pub use fallback::FileFallback;
pub use lifecycle::{LifecycleClient, LifecycleError, WorkerLifecycle};
pub use reconciler::{ReconcileOutcome, Reconciler};
pub use stats::{SidecarCounters, SidecarStats};
pub use task::{
    ActivationReason, DesiredStateHandle, LastReconcile, ReconcileStatus,
    ReconcilerTask,
};

#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error("failed to initialize logger")]
    InitializeLogger(#[source] std::io::Error),
    #[error("failed to initialize HTTP client")]
    InitializeHttpClient(#[source] reqwest::Error),
    #[error("failed to initialize HTTP server")]
    InitializeHttpServer(#[source] dropshot::BuildError),
}

/// A running sidecar: the push and health API plus the reconcile loop.
pub struct Server {
    http: HttpServer<Arc<context::ServerContext>>,
    reconciler: JoinHandle<()>,
    cancel: CancellationToken,
    desired: DesiredStateHandle,
    status: watch::Receiver<ReconcileStatus>,
    stats: Arc<SidecarStats>,
    log: Logger,
}

impl Server {
    /// Builds the root logger from `config.log` and starts the server.
    pub async fn start_with_config(config: Config) -> Result<Server, StartError> {
        let base = config
            .log
            .to_logger("switch-sidecar")
            .map_err(StartError::InitializeLogger)?;
        let log = Logger::root(base.fuse(), o!(FileKv));
        Server::start(config, &log).await
    }

    pub async fn start(config: Config, log: &Logger) -> Result<Server, StartError> {
        let log = log.new(o!(
            "component" => "SwitchSidecarServer",
            "hostname" => config.reconciler.hostname.clone(),
        ));

        let worker = LifecycleClient::new(&log, &config.lifecycle)
            .map_err(StartError::InitializeHttpClient)?;
        let fallback = FileFallback::new(
            &log,
            &config.reconciler.fallback_dir,
            &config.reconciler.hostname,
        );
        let stats = Arc::new(SidecarStats::new());
        let (desired, pushed) = DesiredStateHandle::new();
        let cancel = CancellationToken::new();

        let reconciler =
            Reconciler::new(&log, worker.clone(), pushed, fallback, stats.clone());
        let (task, status) = ReconcilerTask::new(
            &log,
            reconciler,
            config.reconciler.interval_secs,
            cancel.clone(),
        );

        let context = context::ServerContext::new(
            desired.clone(),
            worker,
            stats.clone(),
            status.clone(),
            log.clone(),
        );
        let http = dropshot::ServerBuilder::new(
            http_entrypoints::api(),
            Arc::new(context),
            log.new(o!("component" => "dropshot")),
        )
        .config(config.dropshot.clone())
        .start()
        .map_err(|err| {
            error!(
                log,
                "failed to start HTTP server";
                "error" => %DisplayErrorChain::new(&err),
            );
            StartError::InitializeHttpServer(err)
        })?;

        let reconciler = tokio::spawn(task.run());

        info!(
            log,
            "switch sidecar started";
            "address" => %http.local_addr(),
            "worker" => %config.lifecycle.worker,
            "fallback_dir" => %config.reconciler.fallback_dir,
        );
        Ok(Server { http, reconciler, cancel, desired, status, stats, log })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.http.local_addr()
    }

    pub fn desired_state(&self) -> &DesiredStateHandle {
        &self.desired
    }

    /// Status of the reconcile loop, updated after every cycle.
    pub fn reconcile_status(&self) -> watch::Receiver<ReconcileStatus> {
        self.status.clone()
    }

    pub fn stats(&self) -> &SidecarStats {
        &self.stats
    }

    /// Stops the reconcile loop and shuts down the HTTP server.
    pub async fn close(self) -> Result<(), String> {
        info!(self.log, "shutting down");
        self.cancel.cancel();
        if let Err(error) = self.reconciler.await {
            error!(self.log, "reconcile task failed"; "error" => %error);
        }
        self.http.close().await
    }

    /// Runs until the HTTP server exits.
    pub async fn wait_for_finish(self) -> Result<(), String> {
        let result = self.http.await;
        self.cancel.cancel();
        result
    }
}
