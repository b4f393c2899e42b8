#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use plaza_server::config::{ServerConfig, default_config_path, load_server_config_from_path, parse_quic_bind};
use plaza_server::quic::QuicServerConfig;
use plaza_server::server::auth::{HmacSessionGate, SessionGate};
use plaza_server::server::connection::{ConnectionSettings, handle_connection};
use plaza_server::server::health::{HealthState, spawn_health_server};
use plaza_server::server::repository::{IdentityRepository, InMemoryIdentityRepository, SqlIdentityRepository};
use plaza_server::server::state::ServerState;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: plaza_server [--bind quic://host:port] [--config path]\n\
\n\
Options:\n\
\t--bind    Bind endpoint (default from config, else quic://127.0.0.1:18310)\n\
\t         Format: quic://host:port\n\
\t--config  Config file (default: ~/.plaza/config.toml)\n\
\t--help   Show this help\n\
"
	);
	std::process::exit(2)
}

struct Args {
	bind: Option<String>,
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
				if v.trim().is_empty() {
					eprintln!("--bind must be non-empty (expected quic://host:port)");
					usage_and_exit();
				}
				args.bind = Some(v);
			}
			"--config" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
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

fn init_rustls_crypto_provider() {
	let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,plaza_server=debug".to_string());

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
				let tracer = tracer_provider.tracer("plaza_server");
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

async fn open_repository(cfg: &ServerConfig) -> anyhow::Result<Arc<dyn IdentityRepository>> {
	match cfg.persistence.database_url.as_deref() {
		Some(url) => Ok(Arc::new(SqlIdentityRepository::connect(url).await?)),
		None => {
			warn!("no database_url configured; identities are kept in memory only");
			Ok(Arc::new(InMemoryIdentityRepository::new()))
		}
	}
}

fn session_gate(cfg: &ServerConfig) -> Arc<dyn SessionGate> {
	match cfg.server.auth_hmac_secret.as_ref() {
		Some(secret) => Arc::new(HmacSessionGate::new(secret.expose().as_bytes().to_vec(), cfg.server.session_ttl)),
		None => {
			warn!("no auth_hmac_secret configured; using a random per-process secret");
			Arc::new(HmacSessionGate::with_random_secret(cfg.server.session_ttl))
		}
	}
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_rustls_crypto_provider();
	init_tracing();

	let args = parse_args();

	let config_path = match args.config {
		Some(path) => path,
		None => default_config_path()?,
	};
	let server_cfg = load_server_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "loaded server config (toml + env overrides)");

	let bind_endpoint = args.bind.unwrap_or_else(|| server_cfg.server.bind.clone());
	let bind_addr = parse_quic_bind(&bind_endpoint).unwrap_or_else(|e| {
		eprintln!("{e}");
		usage_and_exit();
	});

	init_metrics(server_cfg.server.metrics_bind.as_deref());

	let repo = open_repository(&server_cfg).await?;
	let state = ServerState::new(
		repo,
		session_gate(&server_cfg),
		server_cfg.world.clone(),
		ConnectionSettings {
			server_name: server_cfg.server.server_name.clone(),
			..ConnectionSettings::default()
		},
	);

	let health_state = HealthState::new(state.clone());
	if let Some(bind) = server_cfg.server.health_bind.as_deref() {
		match bind.parse::<SocketAddr>() {
			Ok(addr) => {
				spawn_health_server(addr, health_state.clone());
				info!(%addr, "health server listening");
			}
			Err(e) => warn!(error = %e, %bind, "invalid health bind address (expected host:port)"),
		}
	}

	let quic_cfg = QuicServerConfig::new(bind_addr);
	let endpoint = if let (Some(cert_path), Some(key_path)) = (
		server_cfg.server.tls_cert_path.as_deref(),
		server_cfg.server.tls_key_path.as_deref(),
	) {
		info!(cert = %cert_path.display(), key = %key_path.display(), "loading TLS cert/key");
		quic_cfg.bind_endpoint_with_tls(cert_path, key_path)?
	} else {
		let (endpoint, server_cert_der) = quic_cfg.bind_dev_endpoint()?;
		info!(
			bind = %bind_addr,
			cert_der_len = server_cert_der.len(),
			"plaza_server: QUIC endpoint ready (dev self-signed cert)"
		);
		endpoint
	};

	health_state.mark_ready();
	info!(
		bind = %bind_addr,
		region = %server_cfg.world.region,
		room = %server_cfg.world.chat_room,
		"plaza_server: accepting connections"
	);

	let mut next_conn_id: u64 = 1;
	loop {
		let incoming = tokio::select! {
			incoming = endpoint.accept() => incoming,
			_ = tokio::signal::ctrl_c() => {
				info!("shutdown requested");
				break;
			}
		};
		let Some(incoming) = incoming else {
			break;
		};

		let conn_id = next_conn_id;
		next_conn_id += 1;
		metrics::counter!("plaza_server_connections_total").increment(1);

		let state = state.clone();
		tokio::spawn(async move {
			match incoming.await {
				Ok(connection) => {
					info!(conn_id, remote = %connection.remote_address(), "accepted connection");
					if let Err(e) = handle_connection(conn_id, connection, state).await {
						warn!(conn_id, error = %e, "connection handler exited with error");
					}
				}
				Err(e) => {
					warn!(conn_id, error = %e, "failed to establish QUIC connection");
				}
			}
		});
	}

	health_state.mark_not_ready();
	endpoint.close(0u32.into(), b"server shutdown");
	endpoint.wait_idle().await;
	info!("plaza_server stopped");
	Ok(())
}
