//! ACVPS enforcement gateway.
//!
//! HTTP surface around `acvps-core`: the enforcement proxy, the backend
//! client, admin endpoints and request logging.

pub mod admin;
pub mod backend;
pub mod error;
pub mod logging_layer;
pub mod proxy;

use axum::Router;
use std::sync::Arc;

use admin::AdminServer;
use logging_layer::logging_layer;
use proxy::ProxyState;

/// The main listener's router: admin routes first, everything else through
/// the proxy.
pub fn app(proxy: Arc<ProxyState>, admin: &AdminServer) -> Router {
    admin
        .router()
        .merge(proxy::router(proxy))
        .layer(logging_layer())
}
