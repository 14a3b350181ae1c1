#![forbid(unsafe_code)]

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parley_domain::{ConnectionId, Identity};
use parley_protocol::version::SUBPROTOCOL;
use parley_util::endpoint::path_matches;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::header::{SEC_WEBSOCKET_PROTOCOL, WWW_AUTHENTICATE};
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode};
use tracing::{debug, info, warn};

use crate::server::auth::{AuthError, AuthGate, bearer_token};
use crate::server::connection::{ConnectionSettings, run_connection};
use crate::server::health::HealthState;
use crate::server::router::Router;

/// Everything an accepted socket needs.
#[derive(Clone)]
pub struct ServerContext {
	pub router: Router,
	pub auth: Arc<dyn AuthGate>,
	pub settings: ConnectionSettings,
	pub health: HealthState,
	/// How long shutdown waits for connections to drain.
	pub drain_timeout: Duration,
	/// Only this request path is upgraded; `None` accepts any.
	pub upgrade_path: Option<String>,
}

/// Accept loop. Returns after `shutdown` resolves and connections have drained (or the drain timeout hit).
pub async fn serve(listener: TcpListener, ctx: ServerContext, shutdown: impl Future<Output = ()>) -> anyhow::Result<()> {
	let next_conn_id = Arc::new(AtomicU64::new(1));
	tokio::pin!(shutdown);

	ctx.health.mark_ready();
	if let Ok(addr) = listener.local_addr() {
		info!(%addr, "parley_server: accepting websocket connections");
	}

	loop {
		let accepted = tokio::select! {
			_ = &mut shutdown => break,
			accepted = listener.accept() => accepted,
		};

		let (stream, remote) = match accepted {
			Ok(v) => v,
			Err(e) => {
				warn!(error = %e, "accept failed");
				continue;
			}
		};

		let conn_id = ConnectionId(next_conn_id.fetch_add(1, Ordering::Relaxed));
		metrics::counter!("parley_server_connections_total").increment(1);

		let ctx = ctx.clone();
		tokio::spawn(async move {
			handle_socket(stream, remote, conn_id, ctx).await;
		});
	}

	drain(&ctx).await;
	Ok(())
}

async fn drain(ctx: &ServerContext) {
	ctx.health.mark_draining();
	let hub = ctx.router.hub();
	match hub.shutdown().await {
		Ok(n) => info!(connections = n, "draining connections"),
		Err(e) => {
			warn!(error = %e, "hub already stopped");
			return;
		}
	}

	let deadline = tokio::time::Instant::now() + ctx.drain_timeout;
	while tokio::time::Instant::now() < deadline {
		match hub.connection_count().await {
			Ok(0) | Err(_) => break,
			Ok(_) => tokio::time::sleep(Duration::from_millis(50)).await,
		}
	}
}

async fn handle_socket(stream: TcpStream, remote: SocketAddr, conn_id: ConnectionId, ctx: ServerContext) {
	let _ = stream.set_nodelay(true);

	let mut identity: Option<Identity> = None;
	let auth = Arc::clone(&ctx.auth);
	let upgrade_path = ctx.upgrade_path.as_deref();
	let callback = |req: &Request, mut resp: Response| -> Result<Response, ErrorResponse> {
		if !path_matches(upgrade_path, req.uri().path()) {
			return Err(not_found(req.uri().path()));
		}

		let result = bearer_token(req)
			.ok_or(AuthError::Missing)
			.and_then(|token| auth.validate(&token));

		match result {
			Ok(id) => {
				identity = Some(id);
				if offers_subprotocol(req) {
					resp.headers_mut()
						.insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(SUBPROTOCOL));
				}
				Ok(resp)
			}
			Err(e) => Err(unauthorized(&e)),
		}
	};

	let ws = match tokio_tungstenite::accept_hdr_async_with_config(stream, callback, Some(ctx.settings.websocket_config())).await
	{
		Ok(ws) => ws,
		Err(e) => {
			metrics::counter!("parley_server_handshake_failures_total").increment(1);
			debug!(conn_id = %conn_id, %remote, error = %e, "websocket handshake rejected");
			return;
		}
	};

	let Some(identity) = identity else {
		warn!(conn_id = %conn_id, %remote, "handshake completed without identity");
		return;
	};

	info!(conn_id = %conn_id, %remote, user = %identity, "accepted connection");
	run_connection(ws, conn_id, identity, ctx.router.clone(), ctx.settings.clone()).await;
}

fn offers_subprotocol(req: &Request) -> bool {
	req.headers()
		.get_all(SEC_WEBSOCKET_PROTOCOL)
		.iter()
		.filter_map(|v| v.to_str().ok())
		.flat_map(|v| v.split(','))
		.any(|p| p.trim() == SUBPROTOCOL)
}

fn not_found(path: &str) -> ErrorResponse {
	metrics::counter!("parley_server_unknown_path_total").increment(1);
	debug!(path, "upgrade rejected: no websocket endpoint here");
	let mut resp = ErrorResponse::new(Some("not found".to_string()));
	*resp.status_mut() = StatusCode::NOT_FOUND;
	resp
}

fn unauthorized(err: &AuthError) -> ErrorResponse {
	metrics::counter!("parley_server_auth_failures_total").increment(1);
	debug!(error = %err, "upgrade rejected");
	let mut resp = ErrorResponse::new(Some(format!("unauthorized: {err}")));
	*resp.status_mut() = StatusCode::UNAUTHORIZED;
	resp.headers_mut()
		.insert(WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
	resp
}
