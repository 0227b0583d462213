// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! HTTP entrypoint functions for the switch controller's operator API

use crate::context::ServerContext;
use crate::stats::SwitchMetrics;
use cutover_types::ActiveRole;
use dropshot::{
    endpoint, ApiDescription, HttpError, HttpResponseOk,
    HttpResponseUpdatedNoContent, RequestContext, TypedBody,
};
use schemars::JsonSchema;
use serde::Serialize;
use slog::info;
use std::sync::Arc;

type SwitchControllerApiDescription = ApiDescription<Arc<ServerContext>>;

/// Returns a description of the switch controller API
pub fn api() -> SwitchControllerApiDescription {
    fn register_endpoints(
        api: &mut SwitchControllerApiDescription,
    ) -> Result<(), String> {
        api.register(healthz).map_err(|e| e.to_string())?;
        api.register(readyz).map_err(|e| e.to_string())?;
        api.register(metrics).map_err(|e| e.to_string())?;
        api.register(active_get).map_err(|e| e.to_string())?;
        api.register(active_put).map_err(|e| e.to_string())?;
        Ok(())
    }

    let mut api = SwitchControllerApiDescription::new();
    if let Err(err) = register_endpoints(&mut api) {
        panic!("failed to register entrypoints: {}", err);
    }
    api
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

/// Ready once an active role is known.
#[endpoint {
    method = GET,
    path = "/readyz",
}]
async fn readyz(
    rqctx: RequestContext<Arc<ServerContext>>,
) -> Result<HttpResponseOk<ActiveRole>, HttpError> {
    match rqctx.context().active().get() {
        Some(active) => Ok(HttpResponseOk(ActiveRole { active })),
        None => Err(HttpError::for_unavail(
            None,
            "no active role recorded".to_string(),
        )),
    }
}

#[endpoint {
    method = GET,
    path = "/metrics",
}]
async fn metrics(
    rqctx: RequestContext<Arc<ServerContext>>,
) -> Result<HttpResponseOk<SwitchMetrics>, HttpError> {
    Ok(HttpResponseOk(rqctx.context().stats().snapshot()))
}

#[endpoint {
    method = GET,
    path = "/active",
}]
async fn active_get(
    rqctx: RequestContext<Arc<ServerContext>>,
) -> Result<HttpResponseOk<ActiveRole>, HttpError> {
    rqctx
        .context()
        .active()
        .get()
        .map(|active| HttpResponseOk(ActiveRole { active }))
        .ok_or_else(|| {
            HttpError::for_not_found(None, "no active role recorded".to_string())
        })
}

/// Sets the active role. A change starts a switch.
#[endpoint {
    method = PUT,
    path = "/active",
}]
async fn active_put(
    rqctx: RequestContext<Arc<ServerContext>>,
    body: TypedBody<ActiveRole>,
) -> Result<HttpResponseUpdatedNoContent, HttpError> {
    let ctx = rqctx.context();
    let ActiveRole { active } = body.into_inner();
    if !ctx.is_known_role(&active) {
        return Err(HttpError::for_bad_request(
            None,
            format!("role {active} is not configured"),
        ));
    }
    info!(ctx.log(), "active role set by operator"; "active" => %active);
    ctx.active().set(active);
    Ok(HttpResponseUpdatedNoContent())
}
