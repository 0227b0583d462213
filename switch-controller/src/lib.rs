// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The switch controller: watches the active-role record and drives the
//! worker fleet from one role to the other when it changes.

use cutover_common::FileKv;
use cutover_lease::{InMemoryLeaseBackend, LeaseClient};
use display_error_chain::DisplayErrorChain;
use dropshot::HttpServer;
use slog::{error, info, o, Drain, Logger};
use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

mod config;
mod context;
mod http_entrypoints;
pub mod intent;
pub mod records;
pub mod resolver;
mod rollback;
mod stats;
mod switch;

pub use config::{
    Config, ConfigError, IntentConfig, LeaseConfig, RoleConfig, SwitchConfig,
};
pub use stats::{SwitchMetrics, SwitchStats};
pub use switch::{
    switch_holder, AbortReason, RollbackReason, SwitchController,
    SwitchOutcome,
};

use intent::{DirectoryIntentStore, InMemoryIntentStore, IntentStore, IntentWriter};
use records::InMemoryActiveRole;
use resolver::StaticResolver;

#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error("failed to initialize logger")]
    InitializeLogger(#[source] std::io::Error),
    #[error("failed to initialize HTTP client")]
    InitializeHttpClient(#[source] reqwest::Error),
    #[error("failed to seed intent record")]
    SeedIntent(#[source] intent::IntentError),
    #[error("failed to initialize HTTP server")]
    InitializeHttpServer(#[source] dropshot::BuildError),
}

/// A running switch controller: the operator API plus the task processing
/// active-role changes.
pub struct Server {
    http: HttpServer<Arc<context::ServerContext>>,
    controller: JoinHandle<()>,
    cancel: CancellationToken,
    active: Arc<InMemoryActiveRole>,
    stats: Arc<SwitchStats>,
    log: Logger,
}

impl Server {
    /// Builds the root logger from `config.log` and starts the server.
    pub async fn start_with_config(config: Config) -> Result<Server, StartError> {
        let base = config
            .log
            .to_logger("switch-controller")
            .map_err(StartError::InitializeLogger)?;
        let log = Logger::root(base.fuse(), o!(FileKv));
        Server::start(config, &log).await
    }

    pub async fn start(config: Config, log: &Logger) -> Result<Server, StartError> {
        let log = log.new(o!("component" => "SwitchControllerServer"));

        let active = Arc::new(InMemoryActiveRole::new(Some(
            config.initial_active.clone(),
        )));

        let store: Arc<dyn IntentStore> = match &config.intent.directory {
            Some(dir) => {
                info!(log, "intent record is directory-backed"; "dir" => %dir);
                Arc::new(DirectoryIntentStore::new(dir.clone()))
            }
            None => Arc::new(InMemoryIntentStore::new()),
        };
        let intent = IntentWriter::new(
            &log,
            store,
            config.intent.key_prefix.clone(),
            config.switch.intent_retries,
            config.switch.intent_retry_delay_ms,
        );
        intent
            .seed(&config.intent.keys, &config.initial_active)
            .await
            .map_err(StartError::SeedIntent)?;

        let lease = LeaseClient::new(
            &log,
            Arc::new(InMemoryLeaseBackend::new()),
            config.lease.name.clone(),
            config.lease.duration_secs,
        );
        let roles: BTreeSet<_> = config.roles.keys().cloned().collect();
        let resolver = Arc::new(StaticResolver::new(
            config.roles.clone(),
            config.switch.lifecycle_port,
        ));

        let controller = SwitchController::new(
            &log,
            config.switch.clone(),
            lease,
            intent,
            resolver,
            active.clone(),
        )
        .map_err(StartError::InitializeHttpClient)?;
        let stats = controller.stats();
        let cancel = controller.cancel_token();

        let context = context::ServerContext::new(
            active.clone(),
            stats.clone(),
            roles,
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

        let subscription = active.subscribe();
        let controller = tokio::spawn(async move {
            controller.run(subscription).await;
        });

        info!(log, "switch controller started"; "address" => %http.local_addr());
        Ok(Server { http, controller, cancel, active, stats, log })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.http.local_addr()
    }

    pub fn active(&self) -> &InMemoryActiveRole {
        &self.active
    }

    pub fn stats(&self) -> &SwitchStats {
        &self.stats
    }

    /// Stops processing changes and shuts down the HTTP server.
    pub async fn close(self) -> Result<(), String> {
        info!(self.log, "shutting down");
        self.cancel.cancel();
        if let Err(error) = self.controller.await {
            error!(self.log, "switch controller task failed"; "error" => %error);
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
