//! HTTP ingress (§6): the REST/SSE surface layered over the core. Routes
//! are thin — parsing and validation only; all decisions are made by the
//! pipeline, sync engine, and workspace registry underneath.

pub mod auth;
pub mod multipart;

use axum::Router;
use axum::middleware;
use axum::routing::{get, post};

use crate::state::AppState;

/// Build the tenant/conversation routes, gated behind executor auth. The
/// caller merges this into the full app router and applies `with_state`
/// once, alongside the health/metrics routes.
pub fn router(state: &AppState) -> Router<AppState> {
	Router::new()
		.route(
			"/tenants/{tenant}/conversations/{conversation}/stream",
			post(multipart::stream_handler),
		)
		.route(
			"/tenants/{tenant}/conversations/{conversation}/files",
			get(multipart::list_files),
		)
		.route(
			"/tenants/{tenant}/conversations/{conversation}/files/download",
			get(multipart::download_file),
		)
		.route(
			"/tenants/{tenant}/conversations/{conversation}/files/presented",
			get(multipart::presented_files),
		)
		.route_layer(middleware::from_fn_with_state(state.clone(), auth::require_executor_auth))
}
