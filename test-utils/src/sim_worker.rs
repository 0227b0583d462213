// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A simulated stream-processing worker.
//!
//! [`SimWorker`] serves the worker lifecycle surface, the fault surface and
//! the sidecar's desired-state push surface on one ephemeral port, records
//! every request it receives, and can be told to misbehave in the ways the
//! switch protocol has to survive.

use cutover_types::{
    DesiredState, FaultSetting, LifecycleCommand, LifecycleState,
    PushAccepted, StatusResponse, WorkerEndpoint,
};
use dropshot::{
    endpoint, ApiDescription, ConfigDropshot, HttpError, HttpResponseOk,
    HttpResponseUpdatedNoContent, HttpServer, RequestContext, ServerBuilder,
    TypedBody,
};
use schemars::JsonSchema;
use serde::Deserialize;
use slog::{o, Logger};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug)]
struct SimState {
    state: LifecycleState,
    /// answer lifecycle commands with a 500
    reject_commands: bool,
    /// accept lifecycle commands without changing state
    ignore_commands: bool,
    /// answer status queries with a 503
    status_unavailable: bool,
    /// number of status queries to report `DRAINING` for after a pause
    drain_polls: usize,
    draining_left: usize,
    /// after this many more status queries, jump to the given state
    flip: Option<(usize, LifecycleState)>,
    status_queries: usize,
    commands: Vec<LifecycleCommand>,
    pushes: Vec<DesiredState>,
    faults: Vec<FaultSetting>,
}

/// Shared state behind a running [`SimWorker`].
pub struct SimWorkerContext {
    inner: Mutex<SimState>,
}

impl SimWorkerContext {
    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.inner.lock().unwrap()
    }
}

pub struct SimWorker {
    server: HttpServer<Arc<SimWorkerContext>>,
}

impl SimWorker {
    /// Starts a simulated worker on an ephemeral localhost port.
    pub fn start(
        log: &Logger,
        initial: LifecycleState,
    ) -> Result<SimWorker, dropshot::BuildError> {
        let context = Arc::new(SimWorkerContext {
            inner: Mutex::new(SimState {
                state: initial,
                reject_commands: false,
                ignore_commands: false,
                status_unavailable: false,
                drain_polls: 0,
                draining_left: 0,
                flip: None,
                status_queries: 0,
                commands: Vec::new(),
                pushes: Vec::new(),
                faults: Vec::new(),
            }),
        });
        let config = ConfigDropshot {
            bind_address: "127.0.0.1:0".parse().unwrap(),
            ..Default::default()
        };
        let server = ServerBuilder::new(
            api(),
            context,
            log.new(o!("component" => "SimWorker")),
        )
        .config(config)
        .start()?;
        Ok(SimWorker { server })
    }

    fn ctx(&self) -> &SimWorkerContext {
        self.server.app_private()
    }

    pub fn endpoint(&self) -> WorkerEndpoint {
        WorkerEndpoint::from(self.server.local_addr())
    }

    pub fn state(&self) -> LifecycleState {
        self.ctx().lock().state
    }

    pub fn set_state(&self, state: LifecycleState) {
        self.ctx().lock().state = state;
    }

    pub fn reject_commands(&self, reject: bool) {
        self.ctx().lock().reject_commands = reject;
    }

    pub fn ignore_commands(&self, ignore: bool) {
        self.ctx().lock().ignore_commands = ignore;
    }

    pub fn status_unavailable(&self, unavailable: bool) {
        self.ctx().lock().status_unavailable = unavailable;
    }

    /// After a pause, report `DRAINING` for `polls` status queries before
    /// reporting `PAUSED`.
    pub fn drain_polls(&self, polls: usize) {
        self.ctx().lock().drain_polls = polls;
    }

    /// Answer the next `queries` status queries truthfully, then switch to
    /// `state` without being told to.
    pub fn report_state_after(&self, queries: usize, state: LifecycleState) {
        self.ctx().lock().flip = Some((queries, state));
    }

    pub fn status_queries(&self) -> usize {
        self.ctx().lock().status_queries
    }

    /// Every lifecycle command received, in order, whether or not it was
    /// honoured.
    pub fn commands(&self) -> Vec<LifecycleCommand> {
        self.ctx().lock().commands.clone()
    }

    pub fn clear_commands(&self) {
        self.ctx().lock().commands.clear();
    }

    pub fn pushes(&self) -> Vec<DesiredState> {
        self.ctx().lock().pushes.clone()
    }

    pub fn faults(&self) -> Vec<FaultSetting> {
        self.ctx().lock().faults.clone()
    }

    pub async fn shutdown(self) -> Result<(), String> {
        self.server.close().await
    }
}

type SimWorkerApiDescription = ApiDescription<Arc<SimWorkerContext>>;

fn api() -> SimWorkerApiDescription {
    fn register_endpoints(
        api: &mut SimWorkerApiDescription,
    ) -> Result<(), String> {
        api.register(lifecycle_status).map_err(|e| e.to_string())?;
        api.register(lifecycle_pause).map_err(|e| e.to_string())?;
        api.register(lifecycle_resume).map_err(|e| e.to_string())?;
        api.register(fault_processing_delay).map_err(|e| e.to_string())?;
        api.register(fault_error_rate).map_err(|e| e.to_string())?;
        api.register(fault_commit_delay).map_err(|e| e.to_string())?;
        api.register(desired_state_push).map_err(|e| e.to_string())?;
        Ok(())
    }

    let mut api = SimWorkerApiDescription::new();
    if let Err(err) = register_endpoints(&mut api) {
        panic!("failed to register entrypoints: {}", err);
    }
    api
}

#[endpoint {
    method = GET,
    path = "/lifecycle/status",
}]
async fn lifecycle_status(
    rqctx: RequestContext<Arc<SimWorkerContext>>,
) -> Result<HttpResponseOk<StatusResponse>, HttpError> {
    let mut sim = rqctx.context().lock();
    sim.status_queries += 1;
    if sim.status_unavailable {
        return Err(HttpError::for_unavail(
            None,
            "worker status unavailable".to_string(),
        ));
    }

    match sim.flip {
        Some((0, next)) => {
            sim.state = next;
            sim.flip = None;
        }
        Some((n, next)) => sim.flip = Some((n - 1, next)),
        None => (),
    }

    let state = if sim.draining_left > 0 {
        sim.draining_left -= 1;
        LifecycleState::Draining
    } else {
        sim.state
    };

    Ok(HttpResponseOk(StatusResponse { state }))
}

fn apply_command(
    ctx: &SimWorkerContext,
    command: LifecycleCommand,
) -> Result<HttpResponseOk<()>, HttpError> {
    let mut sim = ctx.lock();
    sim.commands.push(command);
    if sim.reject_commands {
        return Err(HttpError::for_internal_error(format!(
            "simulated failure of {command}"
        )));
    }
    if !sim.ignore_commands {
        match command {
            LifecycleCommand::Pause => {
                if sim.state != LifecycleState::Paused {
                    sim.draining_left = sim.drain_polls;
                }
                sim.state = LifecycleState::Paused;
            }
            LifecycleCommand::Resume => {
                sim.draining_left = 0;
                sim.state = LifecycleState::Active;
            }
        }
    }
    Ok(HttpResponseOk(()))
}

#[endpoint {
    method = POST,
    path = "/lifecycle/pause",
}]
async fn lifecycle_pause(
    rqctx: RequestContext<Arc<SimWorkerContext>>,
) -> Result<HttpResponseOk<()>, HttpError> {
    apply_command(rqctx.context(), LifecycleCommand::Pause)
}

#[endpoint {
    method = POST,
    path = "/lifecycle/resume",
}]
async fn lifecycle_resume(
    rqctx: RequestContext<Arc<SimWorkerContext>>,
) -> Result<HttpResponseOk<()>, HttpError> {
    apply_command(rqctx.context(), LifecycleCommand::Resume)
}

#[derive(Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
struct DelayBody {
    delay_ms: u64,
}

#[derive(Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
struct ErrorRateBody {
    error_rate_percent: u32,
}

#[endpoint {
    method = PUT,
    path = "/fault/processing-delay",
}]
async fn fault_processing_delay(
    rqctx: RequestContext<Arc<SimWorkerContext>>,
    body: TypedBody<DelayBody>,
) -> Result<HttpResponseUpdatedNoContent, HttpError> {
    let delay_ms = body.into_inner().delay_ms;
    rqctx.context().lock().faults.push(FaultSetting::ProcessingDelay { delay_ms });
    Ok(HttpResponseUpdatedNoContent())
}

#[endpoint {
    method = PUT,
    path = "/fault/error-rate",
}]
async fn fault_error_rate(
    rqctx: RequestContext<Arc<SimWorkerContext>>,
    body: TypedBody<ErrorRateBody>,
) -> Result<HttpResponseUpdatedNoContent, HttpError> {
    let error_rate_percent = body.into_inner().error_rate_percent;
    rqctx
        .context()
        .lock()
        .faults
        .push(FaultSetting::ErrorRate { error_rate_percent });
    Ok(HttpResponseUpdatedNoContent())
}

#[endpoint {
    method = PUT,
    path = "/fault/commit-delay",
}]
async fn fault_commit_delay(
    rqctx: RequestContext<Arc<SimWorkerContext>>,
    body: TypedBody<DelayBody>,
) -> Result<HttpResponseUpdatedNoContent, HttpError> {
    let delay_ms = body.into_inner().delay_ms;
    rqctx.context().lock().faults.push(FaultSetting::CommitDelay { delay_ms });
    Ok(HttpResponseUpdatedNoContent())
}

/// Stands in for the sidecar that would normally run next to the worker.
#[endpoint {
    method = POST,
    path = "/desired-state",
}]
async fn desired_state_push(
    rqctx: RequestContext<Arc<SimWorkerContext>>,
    body: TypedBody<DesiredState>,
) -> Result<HttpResponseOk<PushAccepted>, HttpError> {
    rqctx.context().lock().pushes.push(body.into_inner());
    Ok(HttpResponseOk(PushAccepted::accepted()))
}
