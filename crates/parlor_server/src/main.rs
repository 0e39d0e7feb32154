#![forbid(unsafe_code)]

mod config;
mod server;
mod util;

use std::net::SocketAddr;
use std::sync::Arc;

use parlor_util::endpoint::HttpEndpoint;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::server::api::{ApiState, HealthState, run_api_server};
use crate::server::identity::AuthService;
use crate::server::launch::LaunchVerifier;
use crate::server::rooms::RoomService;
use crate::server::store::{MemoryRoomStore, RoomStore, SqlRoomStore};

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: parlor_server [--bind http://host:port]\n\
\n\
Options:\n\
\t--bind    Bind endpoint (default: http://127.0.0.1:8803)\n\
\t         Format: http://host:port\n\
\t--help   Show this help\n\
"
	);
	std::process::exit(2)
}

fn parse_args() -> SocketAddr {
	let mut bind_endpoint = "http://127.0.0.1:8803".to_string();

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--bind" | "--listen" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--bind must be non-empty (expected http://host:port)");
					usage_and_exit();
				}
				bind_endpoint = v;
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	let bind = HttpEndpoint::parse(&bind_endpoint).unwrap_or_else(|e| {
		eprintln!("{e}");
		usage_and_exit();
	});

	let addr: SocketAddr = bind.to_socket_addr_if_ip_literal().unwrap_or_else(|e| {
		eprintln!("{e}");
		usage_and_exit();
	});

	addr
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,parlor_server=debug".to_string());

	tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false))
		.init();
}

fn init_metrics(bind: Option<&str>) {
	let Some(bind) = bind else {
		return;
	};

	match bind.parse::<std::net::SocketAddr>() {
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

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();

	let bind_addr = parse_args();

	let config_path = crate::config::default_config_path()?;
	let cfg = crate::config::load_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "loaded config (toml + env overrides)");

	init_metrics(cfg.server.metrics_bind.as_deref());

	// no secret, no service: a server without the bot token cannot verify
	// anything and must not pretend otherwise
	let Some(bot_token) = cfg.auth.bot_token.clone() else {
		return Err(anyhow::anyhow!(
			"bot_token is not configured; refusing to serve (set [auth] bot_token or PARLOR_BOT_TOKEN)"
		));
	};

	let store: Arc<dyn RoomStore> = match cfg.storage.database_url.as_deref() {
		Some(database_url) => {
			let store = SqlRoomStore::connect(database_url).await?;
			info!("room store: sql backend");
			Arc::new(store)
		}
		None => {
			warn!("room store: no database_url configured, using in-memory store");
			Arc::new(MemoryRoomStore::default())
		}
	};

	let verifier = LaunchVerifier::new(&bot_token);
	let auth = Arc::new(AuthService::new(
		verifier,
		cfg.auth.identity_fields.clone(),
		Arc::clone(&store),
	));
	let rooms = Arc::new(RoomService::new(Arc::clone(&store)));

	let health = HealthState::new();
	health.mark_ready();

	info!(bind = %bind_addr, "parlor_server: api listening");
	run_api_server(bind_addr, ApiState { auth, rooms, health }).await
}
