// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! HTTP entrypoint functions for the switch sidecar

use crate::context::ServerContext;
use crate::stats::SidecarCounters;
use crate::task::ReconcileStatus;
use cutover_types::{DesiredState, LifecycleState, PushAccepted};
use display_error_chain::DisplayErrorChain;
use dropshot::{
    endpoint, ApiDescription, HttpError, HttpResponseOk, RequestContext,
    TypedBody,
};
use schemars::JsonSchema;
use serde::Serialize;
use slog::info;
use std::sync::Arc;

type SidecarApiDescription = ApiDescription<Arc<ServerContext>>;

/// Returns a description of the switch sidecar API
pub fn api() -> SidecarApiDescription {
    fn register_endpoints(api: &mut SidecarApiDescription) -> Result<(), String> {
        api.register(desired_state_push).map_err(|e| e.to_string())?;
        api.register(healthz).map_err(|e| e.to_string())?;
        api.register(readyz).map_err(|e| e.to_string())?;
        api.register(metrics).map_err(|e| e.to_string())?;
        Ok(())
    }

    let mut api = SidecarApiDescription::new();
    if let Err(err) = register_endpoints(&mut api) {
        panic!("failed to register entrypoints: {}", err);
    }
    api
}

/// Replaces the cached desired state and wakes the reconcile loop. Returns
/// without waiting for the worker to converge.
#[endpoint {
    method = POST,
    path = "/desired-state",
}]
async fn desired_state_push(
    rqctx: RequestContext<Arc<ServerContext>>,
    body: TypedBody<DesiredState>,
) -> Result<HttpResponseOk<PushAccepted>, HttpError> {
    let ctx = rqctx.context();
    let desired = body.into_inner();
    info!(
        ctx.log(),
        "received desired state push";
        "lifecycle" => &desired.lifecycle,
        "has_fault" => desired.fault.is_some(),
    );
    ctx.desired().push(desired);
    Ok(HttpResponseOk(PushAccepted::accepted()))
}

#[derive(Serialize, JsonSchema)]
struct Health {
    status: String,
}

#[endpoint {
    method = GET,
    path = "/healthz",
}]
async fn healthz(
    _rqctx: RequestContext<Arc<ServerContext>>,
) -> Result<HttpResponseOk<Health>, HttpError> {
    Ok(HttpResponseOk(Health { status: "ok".to_string() }))
}

#[derive(Serialize, JsonSchema)]
struct Readiness {
    status: String,
    worker_state: LifecycleState,
}

/// Ready while the local worker's status can be read.
#[endpoint {
    method = GET,
    path = "/readyz",
}]
async fn readyz(
    rqctx: RequestContext<Arc<ServerContext>>,
) -> Result<HttpResponseOk<Readiness>, HttpError> {
    match rqctx.context().worker().check_status().await {
        Ok(worker_state) => Ok(HttpResponseOk(Readiness {
            status: "ok".to_string(),
            worker_state,
        })),
        Err(error) => Err(HttpError::for_unavail(
            None,
            format!("worker status unavailable: {}", DisplayErrorChain::new(&error)),
        )),
    }
}

#[derive(Serialize, JsonSchema)]
struct SidecarMetrics {
    #[serde(flatten)]
    counters: SidecarCounters,
    reconcile: ReconcileStatus,
}

#[endpoint {
    method = GET,
    path = "/metrics",
}]
async fn metrics(
    rqctx: RequestContext<Arc<ServerContext>>,
) -> Result<HttpResponseOk<SidecarMetrics>, HttpError> {
    let ctx = rqctx.context();
    Ok(HttpResponseOk(SidecarMetrics {
        counters: ctx.stats().snapshot(),
        reconcile: ctx.reconcile_status(),
    }))
}
