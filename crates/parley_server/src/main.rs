#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use parley_server::config::{self, DEFAULT_BIND};
use parley_server::server::auth::JwtAuthGate;
use parley_server::server::health::{HealthState, spawn_health_server};
use parley_server::server::hub::Hub;
use parley_server::server::listener::{ServerContext, serve};
use parley_server::server::router::Router;
use parley_server::server::store::Stores;
use parley_util::endpoint::WsEndpoint;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: parley_server [--bind ws://host:port[/path]] [--config path]\n\
\n\
Options:\n\
\t--bind    Bind endpoint (default: {DEFAULT_BIND})\n\
\t         Format: ws://host:port[/path]; with a path, other request paths get 404\n\
\t--config  Config file (default: ~/.parley/config.toml)\n\
\t--help   Show this help\n\
"
	);
	std::process::exit(2)
}

struct Args {
	bind: Option<WsEndpoint>,
	config: Option<PathBuf>,
}

fn parse_args() -> Args {
	let mut args = Args { bind: None, config: None };

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--bind" | "--listen" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				let bind = WsEndpoint::parse(&v).unwrap_or_else(|e| {
					eprintln!("{e}");
					usage_and_exit();
				});
				args.bind = Some(bind);
			}
			"--config" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--config must be non-empty");
					usage_and_exit();
				}
				args.config = Some(PathBuf::from(v));
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	args
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,parley_server=debug".to_string());

	let otlp_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
		.ok()
		.map(|v| v.trim().to_string())
		.filter(|v| !v.is_empty());
	let base = tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false));

	if let Some(endpoint) = otlp_endpoint {
		use opentelemetry::global;
		use opentelemetry::trace::TracerProvider as _;
		use opentelemetry_otlp::WithExportConfig;

		match opentelemetry_otlp::SpanExporter::builder()
			.with_tonic()
			.with_endpoint(endpoint.clone())
			.build()
		{
			Ok(exporter) => {
				let tracer_provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
					.with_batch_exporter(exporter)
					.build();
				let tracer = tracer_provider.tracer("parley_server");
				global::set_tracer_provider(tracer_provider);

				let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
				base.with(otel_layer).init();
				info!(endpoint = %endpoint, "otlp tracing enabled");
			}
			Err(e) => {
				base.init();
				warn!(error = %e, "failed to initialize otlp tracing");
			}
		}
	} else {
		base.init();
	}
}

fn init_metrics(bind: Option<&str>) {
	let Some(bind) = bind else {
		return;
	};

	match bind.parse::<SocketAddr>() {
		Ok(addr) => {
			if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new()
				.with_http_listener(addr)
				.install()
			{
				warn!(error = %e, "failed to start metrics exporter");
			} else {
				info!(%addr, "metrics exporter listening");
			}
		}
		Err(e) => {
			warn!(error = %e, %bind, "invalid metrics bind address (expected host:port)");
		}
	}
}

async fn shutdown_signal() {
	let ctrl_c = async {
		if let Err(e) = tokio::signal::ctrl_c().await {
			warn!(error = %e, "failed to listen for ctrl-c");
			std::future::pending::<()>().await;
		}
	};

	#[cfg(unix)]
	let terminate = async {
		match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
			Ok(mut sig) => {
				sig.recv().await;
			}
			Err(e) => {
				warn!(error = %e, "failed to listen for SIGTERM");
				std::future::pending::<()>().await;
			}
		}
	};

	#[cfg(not(unix))]
	let terminate = std::future::pending::<()>();

	tokio::select! {
		_ = ctrl_c => {},
		_ = terminate => {},
	}
	info!("shutdown requested");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();

	let args = parse_args();

	let config_path = match args.config {
		Some(path) => path,
		None => config::default_config_path()?,
	};
	let mut server_cfg = config::load_server_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "loaded server config (toml + env overrides)");
	if let Some(bind) = args.bind {
		server_cfg.bind = bind;
	}

	init_metrics(server_cfg.server.metrics_bind.as_deref());

	let health_state = HealthState::new();
	if let Some(bind) = server_cfg.server.health_bind.as_deref() {
		match bind.parse::<SocketAddr>() {
			Ok(addr) => {
				spawn_health_server(addr, health_state.clone());
				info!(%addr, "health server listening");
			}
			Err(e) => warn!(error = %e, %bind, "invalid health bind address (expected host:port)"),
		}
	}

	let Some(secret) = server_cfg.auth.jwt_secret.as_ref() else {
		return Err(anyhow::anyhow!(
			"no jwt_secret configured (set [auth].jwt_secret or PARLEY_JWT_SECRET)"
		));
	};
	let auth = Arc::new(JwtAuthGate::new(secret.expose(), server_cfg.auth.issuer.clone()));

	let stores = if server_cfg.persistence.enabled {
		let Some(database_url) = server_cfg.persistence.database_url.as_deref() else {
			return Err(anyhow::anyhow!("persistence enabled but no database_url configured"));
		};
		Stores::connect(database_url).await?
	} else {
		warn!("persistence disabled; messages are kept in memory only");
		Stores::in_memory()
	};

	let (hub, _hub_task) = Hub::spawn(server_cfg.hub.hub.clone());
	let router = Router::new(hub, stores, server_cfg.hub.router.clone());

	let listener = TcpListener::bind(server_cfg.bind.bind_addr()).await?;
	info!(bind = %server_cfg.bind, "parley_server: listening");

	let ctx = ServerContext {
		router,
		auth,
		settings: server_cfg.connection.clone(),
		health: health_state,
		drain_timeout: server_cfg.server.drain_timeout,
		upgrade_path: server_cfg.bind.path.clone(),
	};

	serve(listener, ctx, shutdown_signal()).await?;
	info!("parley_server: stopped");
	Ok(())
}
