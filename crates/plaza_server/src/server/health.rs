#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode, header};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing::warn;

use crate::server::state::ServerState;

#[derive(Clone)]
pub struct HealthState {
	ready: Arc<AtomicBool>,
	server: ServerState,
}

impl HealthState {
	pub fn new(server: ServerState) -> Self {
		Self {
			ready: Arc::new(AtomicBool::new(false)),
			server,
		}
	}

	pub fn mark_ready(&self) {
		self.ready.store(true, Ordering::Relaxed);
	}

	pub fn mark_not_ready(&self) {
		self.ready.store(false, Ordering::Relaxed);
	}

	pub fn is_ready(&self) -> bool {
		self.ready.load(Ordering::Relaxed)
	}
}

pub fn spawn_health_server(bind: SocketAddr, state: HealthState) {
	tokio::spawn(async move {
		if let Err(err) = run_health_server(bind, state).await {
			warn!(error = %err, "health server stopped");
		}
	});
}

async fn run_health_server(bind: SocketAddr, state: HealthState) -> anyhow::Result<()> {
	let listener = TcpListener::bind(bind).await?;
	loop {
		let (stream, _addr) = listener.accept().await?;
		let io = TokioIo::new(stream);
		let state = state.clone();
		tokio::spawn(async move {
			let service = service_fn(move |req| handle_health(req, state.clone()));
			if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
				warn!(error = %err, "health connection error");
			}
		});
	}
}

fn respond(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
	let mut resp = Response::new(Full::new(body.into()));
	*resp.status_mut() = status;
	resp
}

async fn handle_health(req: Request<Incoming>, state: HealthState) -> Result<Response<Full<Bytes>>, hyper::Error> {
	if req.method() != Method::GET {
		return Ok(respond(StatusCode::METHOD_NOT_ALLOWED, Bytes::new()));
	}

	let resp = match req.uri().path() {
		"/healthz" => respond(StatusCode::OK, Bytes::from_static(b"ok")),
		"/readyz" if state.is_ready() => respond(StatusCode::OK, Bytes::from_static(b"ready")),
		"/readyz" => respond(StatusCode::SERVICE_UNAVAILABLE, Bytes::from_static(b"not-ready")),
		"/statsz" => match serde_json::to_vec(&state.server.stats().await) {
			Ok(body) => {
				let mut resp = respond(StatusCode::OK, body);
				resp.headers_mut()
					.insert(header::CONTENT_TYPE, header::HeaderValue::from_static("application/json"));
				resp
			}
			Err(err) => {
				warn!(error = %err, "encode stats");
				respond(StatusCode::INTERNAL_SERVER_ERROR, Bytes::new())
			}
		},
		_ => respond(StatusCode::NOT_FOUND, Bytes::new()),
	};
	Ok(resp)
}
