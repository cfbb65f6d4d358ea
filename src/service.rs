// Copyright (c) 2026 The Trireme developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Built-in introspection routes.
//!
//! Every engine installs `/health`, `/metrics` and `/info` into the user's
//! router when it starts. They are ordinary routes and go through the same
//! matching and middleware machinery as everything else.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use serde::Serialize;

use crate::handler;
use crate::metrics::Metrics;
use crate::response::Response;
use crate::router::{PatternError, Router};

/// What `/info` reports about the running server.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerInfo {
    pub name: String,
    pub version: String,
    pub engine: String,
    pub port: u16,
    pub backlog: u32,
    pub read_buffer_size: usize,
    pub write_buffer_size: usize,
}

/// Engine-specific numbers merged into the `/metrics` payload, e.g. pool
/// utilizations. Must return a JSON object.
pub type ExtraMetrics = Arc<dyn Fn() -> serde_json::Value + Send + Sync>;

/// Registers the three built-in routes.
pub fn install_builtin_routes(
    router: &mut Router,
    metrics: Arc<Metrics>,
    info: ServerInfo,
    extras: Option<ExtraMetrics>,
) -> Result<(), PatternError> {
    let health_metrics = metrics.clone();
    router.get(
        "/health",
        handler::sync(move |_| {
            Response::json(&serde_json::json!({
                "status": "UP",
                "activeConnections":
                    health_metrics.active_connections.load(Ordering::Relaxed),
            }))
        }),
    )?;

    router.get(
        "/metrics",
        handler::sync(move |_| {
            let mut payload = match serde_json::to_value(metrics.snapshot()) {
                Ok(value) => value,
                Err(err) => return Response::text(err.to_string()).with_status_code(500),
            };
            if let Some(extras) = extras.as_ref() {
                let extra = extras();
                if let (Some(target), Some(source)) =
                    (payload.as_object_mut(), extra.as_object())
                {
                    for (key, value) in source {
                        target.insert(key.clone(), value.clone());
                    }
                }
            }
            Response::json(&payload)
        }),
    )?;

    router.get("/info", handler::sync(move |_| Response::json(&info)))?;

    Ok(())
}
