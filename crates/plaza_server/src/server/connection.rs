#![forbid(unsafe_code)]

use std::time::Duration;

use anyhow::Context as _;
use plaza_protocol::framing::DEFAULT_MAX_FRAME_SIZE;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::server::bridge::StreamBridge;
use crate::server::state::ServerState;

/// Grace period for the peer to close after the bridge is done.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Per-connection server settings.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
	/// Name reported in `Welcome`.
	pub server_name: String,
	pub max_frame_bytes: usize,
}

impl Default for ConnectionSettings {
	fn default() -> Self {
		Self {
			server_name: "plaza".to_string(),
			max_frame_bytes: DEFAULT_MAX_FRAME_SIZE,
		}
	}
}

/// Serve one QUIC connection: its first bidirectional stream is the control stream.
pub async fn handle_connection(conn_id: u64, connection: quinn::Connection, state: ServerState) -> anyhow::Result<()> {
	let _active = state.track_connection();

	let (control_send, control_recv) = connection
		.accept_bi()
		.await
		.context("accept control bidirectional stream")?;
	debug!(conn_id, "control stream accepted");

	let cancel = CancellationToken::new();
	let watcher = {
		let connection = connection.clone();
		let cancel = cancel.clone();
		tokio::spawn(async move {
			tokio::select! {
				reason = connection.closed() => {
					debug!(conn_id, %reason, "connection closed");
					cancel.cancel();
				}
				_ = cancel.cancelled() => {}
			}
		})
	};

	let result = StreamBridge::new(state, conn_id)
		.run(control_recv, control_send, cancel.clone())
		.await;

	// Give the peer a chance to read the last frames and close first.
	if tokio::time::timeout(CLOSE_GRACE, connection.closed()).await.is_err() {
		connection.close(0u32.into(), b"bye");
	}
	cancel.cancel();
	let _ = watcher.await;

	info!(conn_id, "connection finished");
	result
}
