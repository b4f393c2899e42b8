#![forbid(unsafe_code)]

//! Minimal plaza client: one QUIC connection, one control stream.
//!
//! Replies are matched to requests by `request_id`; pushed presence and chat
//! events are forwarded to the receiver returned by [`PlazaClient::connect`].

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Context as _;
use plaza_protocol::framing::{DEFAULT_MAX_FRAME_SIZE, FrameReader, FramingError, write_message};
use plaza_protocol::pb::envelope::Msg;
use plaza_protocol::{ALPN, envelope, pb};
use quinn::{ClientConfig as QuinnClientConfig, Endpoint, TransportConfig, VarInt};
use tokio::sync::{Mutex, mpsc, oneshot};
use tracing::{debug, info, warn};

/// Request ids with this prefix are background keep-alives; their replies are dropped.
const KEEP_ALIVE_PREFIX: &str = "ka-";

#[derive(Debug, Clone)]
pub struct ClientConfig {
	pub server_addr: SocketAddr,
	/// TLS server name (SNI).
	pub server_name: String,
	pub max_frame_bytes: usize,
	pub connect_timeout: Duration,
	pub request_timeout: Duration,
	/// How often a joined client re-sends its hello.
	pub keep_alive_interval: Duration,
}

impl ClientConfig {
	pub fn new(server_addr: SocketAddr) -> Self {
		Self {
			server_addr,
			server_name: "localhost".to_string(),
			max_frame_bytes: DEFAULT_MAX_FRAME_SIZE,
			connect_timeout: Duration::from_secs(15),
			request_timeout: Duration::from_secs(10),
			keep_alive_interval: Duration::from_secs(10),
		}
	}
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
	#[error("failed to create QUIC endpoint: {0}")]
	Endpoint(String),

	#[error("failed to connect: {0}")]
	Connect(String),

	#[error(transparent)]
	Framing(#[from] FramingError),

	/// The server answered with an error reply.
	#[error("server error {code}: {message}")]
	Server { code: String, message: String },

	#[error("protocol error: {0}")]
	Protocol(String),

	#[error("request timed out after {0:?}")]
	Timeout(Duration),

	#[error("connection closed")]
	Closed,
}

impl ClientError {
	/// Wire error code for [`ClientError::Server`].
	pub fn code(&self) -> Option<&str> {
		match self {
			ClientError::Server { code, .. } => Some(code),
			_ => None,
		}
	}
}

/// Event pushed by the server outside any request.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
	Presence(pb::presence_event::Event),
	Chat(pb::ChatEvent),
}

type Pending = Arc<Mutex<HashMap<String, oneshot::Sender<Msg>>>>;

struct Inner {
	send: Mutex<quinn::SendStream>,
	pending: Pending,
	next_request: AtomicU64,
	max_frame_bytes: usize,
	request_timeout: Duration,
}

impl Inner {
	async fn write(&self, env: &pb::Envelope) -> Result<(), ClientError> {
		let mut send = self.send.lock().await;
		write_message(&mut *send, env, self.max_frame_bytes).await?;
		Ok(())
	}

	async fn request(&self, msg: Msg) -> Result<Msg, ClientError> {
		let request_id = format!("req-{}", self.next_request.fetch_add(1, Ordering::Relaxed));
		let (tx, rx) = oneshot::channel();
		self.pending.lock().await.insert(request_id.clone(), tx);

		if let Err(e) = self.write(&envelope(request_id.clone(), msg)).await {
			self.pending.lock().await.remove(&request_id);
			return Err(e);
		}

		let reply = match tokio::time::timeout(self.request_timeout, rx).await {
			Ok(Ok(reply)) => reply,
			Ok(Err(_)) => return Err(ClientError::Closed),
			Err(_) => {
				self.pending.lock().await.remove(&request_id);
				return Err(ClientError::Timeout(self.request_timeout));
			}
		};

		match reply {
			Msg::Error(err) => Err(ClientError::Server {
				code: err.code,
				message: err.message,
			}),
			other => Ok(other),
		}
	}
}

pub struct PlazaClient {
	conn: quinn::Connection,
	inner: Arc<Inner>,
	keep_alive_interval: Duration,
	keep_alive: Option<tokio::task::JoinHandle<()>>,
}

impl PlazaClient {
	/// Connect and open the control stream.
	pub async fn connect(cfg: ClientConfig) -> Result<(Self, mpsc::UnboundedReceiver<ServerEvent>), ClientError> {
		let endpoint = make_client_endpoint().map_err(|e| ClientError::Endpoint(format!("{e:#}")))?;
		let quinn_cfg = make_insecure_client_config().map_err(|e| ClientError::Endpoint(format!("{e:#}")))?;

		let connecting = endpoint
			.connect_with(quinn_cfg, cfg.server_addr, &cfg.server_name)
			.map_err(|e| ClientError::Connect(format!("connect_with({}): {e}", cfg.server_addr)))?;
		let conn = tokio::time::timeout(cfg.connect_timeout, connecting)
			.await
			.map_err(|_| ClientError::Connect(format!("connect timeout after {:?}", cfg.connect_timeout)))?
			.map_err(|e| ClientError::Connect(e.to_string()))?;
		info!(remote = %conn.remote_address(), "connected");

		let (send, recv) = tokio::time::timeout(cfg.connect_timeout, conn.open_bi())
			.await
			.map_err(|_| ClientError::Connect("timeout opening control stream".to_string()))?
			.map_err(|e| ClientError::Connect(format!("open_bi(control) failed: {e}")))?;

		let pending: Pending = Arc::default();
		let (events_tx, events_rx) = mpsc::unbounded_channel();
		tokio::spawn(read_loop(
			FrameReader::new(recv, cfg.max_frame_bytes),
			Arc::clone(&pending),
			events_tx,
		));

		let inner = Arc::new(Inner {
			send: Mutex::new(send),
			pending,
			next_request: AtomicU64::new(1),
			max_frame_bytes: cfg.max_frame_bytes,
			request_timeout: cfg.request_timeout,
		});

		Ok((
			Self {
				conn,
				inner,
				keep_alive_interval: cfg.keep_alive_interval,
				keep_alive: None,
			},
			events_rx,
		))
	}

	pub async fn login(&self, account: &str) -> Result<pb::LoginResult, ClientError> {
		let msg = Msg::Login(pb::Login {
			account: account.to_string(),
		});
		match self.inner.request(msg).await? {
			Msg::LoginResult(result) => Ok(result),
			other => Err(unexpected("LoginResult", &other)),
		}
	}

	/// Send a single hello. The first one on a stream joins; later ones refresh.
	pub async fn hello(&self, identity_id: &str, session_token: &str) -> Result<Msg, ClientError> {
		self.inner
			.request(Msg::Hello(pb::Hello {
				identity_id: identity_id.to_string(),
				session_token: session_token.to_string(),
			}))
			.await
	}

	/// Join and keep the subscription alive in the background.
	pub async fn join(&mut self, identity_id: &str, session_token: &str) -> Result<pb::Welcome, ClientError> {
		let welcome = match self.hello(identity_id, session_token).await? {
			Msg::Welcome(welcome) => welcome,
			other => return Err(unexpected("Welcome", &other)),
		};

		let hello = pb::Hello {
			identity_id: identity_id.to_string(),
			session_token: session_token.to_string(),
		};
		if let Some(previous) = self.keep_alive.take() {
			previous.abort();
		}
		self.keep_alive = Some(tokio::spawn(keep_alive_loop(
			Arc::downgrade(&self.inner),
			hello,
			self.keep_alive_interval,
		)));

		Ok(welcome)
	}

	pub async fn move_to(&self, x: f32, y: f32) -> Result<pb::Ack, ClientError> {
		self.ack(Msg::Move(pb::Move { x, y })).await
	}

	pub async fn rename(&self, new_name: &str) -> Result<pb::Ack, ClientError> {
		self.ack(Msg::Rename(pb::Rename {
			new_name: new_name.to_string(),
		}))
		.await
	}

	pub async fn change_skin(&self, new_skin: u32) -> Result<pb::Ack, ClientError> {
		self.ack(Msg::ChangeSkin(pb::ChangeSkin { new_skin })).await
	}

	pub async fn chat(&self, text: &str) -> Result<pb::Ack, ClientError> {
		self.ack(Msg::ChatSend(pb::ChatSend { text: text.to_string() })).await
	}

	pub async fn echo(&self) -> Result<pb::EchoResult, ClientError> {
		let msg = Msg::Echo(pb::Echo {
			client_time_unix_ms: unix_ms_now(),
		});
		match self.inner.request(msg).await? {
			Msg::EchoResult(result) => Ok(result),
			other => Err(unexpected("EchoResult", &other)),
		}
	}

	/// Leave the world and close the connection.
	pub async fn disconnect(mut self) -> Result<(), ClientError> {
		if let Some(keep_alive) = self.keep_alive.take() {
			keep_alive.abort();
		}
		self.ack(Msg::Disconnect(pb::Disconnect {})).await?;
		if let Err(e) = self.inner.send.lock().await.finish() {
			debug!(error = %e, "control stream already finished");
		}
		self.conn.close(VarInt::from_u32(0), b"bye");
		Ok(())
	}

	async fn ack(&self, msg: Msg) -> Result<pb::Ack, ClientError> {
		match self.inner.request(msg).await? {
			Msg::Ack(ack) => Ok(ack),
			other => Err(unexpected("Ack", &other)),
		}
	}
}

impl Drop for PlazaClient {
	fn drop(&mut self) {
		if let Some(keep_alive) = self.keep_alive.take() {
			keep_alive.abort();
		}
	}
}

fn unexpected(expected: &str, got: &Msg) -> ClientError {
	ClientError::Protocol(format!("expected {expected}, got {got:?}"))
}

async fn read_loop(
	mut frames: FrameReader<quinn::RecvStream>,
	pending: Pending,
	events: mpsc::UnboundedSender<ServerEvent>,
) {
	loop {
		let env = match frames.read_message::<pb::Envelope>().await {
			Ok(Some(env)) => env,
			Ok(None) => {
				info!("control stream closed by server");
				break;
			}
			Err(e) => {
				warn!(error = %e, "control stream read failed");
				break;
			}
		};
		let Some(msg) = env.msg else {
			continue;
		};

		if env.request_id.is_empty() {
			let event = match msg {
				Msg::Presence(p) => p.event.map(ServerEvent::Presence),
				Msg::Chat(c) => Some(ServerEvent::Chat(c)),
				other => {
					warn!(msg = ?other, "unexpected push from server");
					None
				}
			};
			if let Some(event) = event {
				let _ = events.send(event);
			}
			continue;
		}

		if env.request_id.starts_with(KEEP_ALIVE_PREFIX) {
			if let Msg::Error(err) = &msg {
				warn!(code = %err.code, message = %err.message, "keep-alive rejected");
			}
			continue;
		}

		match pending.lock().await.remove(&env.request_id) {
			Some(tx) => {
				let _ = tx.send(msg);
			}
			None => debug!(request_id = %env.request_id, "reply for unknown request"),
		}
	}

	// Dropping the senders fails every outstanding request with `Closed`.
	pending.lock().await.clear();
}

async fn keep_alive_loop(inner: Weak<Inner>, hello: pb::Hello, interval: Duration) {
	let mut ticker = tokio::time::interval(interval);
	ticker.tick().await;
	let mut seq = 0u64;
	loop {
		ticker.tick().await;
		let Some(inner) = inner.upgrade() else {
			return;
		};
		seq += 1;
		let env = envelope(format!("{KEEP_ALIVE_PREFIX}{seq}"), Msg::Hello(hello.clone()));
		if let Err(e) = inner.write(&env).await {
			debug!(error = %e, "keep-alive write failed");
			return;
		}
	}
}

fn unix_ms_now() -> i64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.map(|d| d.as_millis() as i64)
		.unwrap_or(0)
}

fn make_client_endpoint() -> anyhow::Result<Endpoint> {
	let addr: SocketAddr = SocketAddr::from(([0, 0, 0, 0], 0));
	let endpoint = Endpoint::client(addr).context("create client endpoint")?;
	Ok(endpoint)
}

/// Dev-only TLS config that skips server cert validation.
fn make_insecure_client_config() -> anyhow::Result<QuinnClientConfig> {
	let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

	#[derive(Debug)]
	struct NoVerifier;

	impl rustls::client::danger::ServerCertVerifier for NoVerifier {
		fn verify_server_cert(
			&self,
			_end_entity: &rustls::pki_types::CertificateDer<'_>,
			_intermediates: &[rustls::pki_types::CertificateDer<'_>],
			_server_name: &rustls::pki_types::ServerName<'_>,
			_ocsp_response: &[u8],
			_now: rustls::pki_types::UnixTime,
		) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
			Ok(rustls::client::danger::ServerCertVerified::assertion())
		}

		fn verify_tls12_signature(
			&self,
			_message: &[u8],
			_cert: &rustls::pki_types::CertificateDer<'_>,
			_dss: &rustls::DigitallySignedStruct,
		) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
			Err(rustls::Error::General("TLS1.2 not supported".into()))
		}

		fn verify_tls13_signature(
			&self,
			_message: &[u8],
			_cert: &rustls::pki_types::CertificateDer<'_>,
			_dss: &rustls::DigitallySignedStruct,
		) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
			Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
		}

		fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
			vec![
				rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
				rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
				rustls::SignatureScheme::RSA_PSS_SHA256,
				rustls::SignatureScheme::RSA_PSS_SHA384,
				rustls::SignatureScheme::RSA_PSS_SHA512,
				rustls::SignatureScheme::ED25519,
			]
		}
	}

	let mut tls = rustls::ClientConfig::builder()
		.with_root_certificates(rustls::RootCertStore::empty())
		.with_no_client_auth();

	tls.dangerous().set_certificate_verifier(Arc::new(NoVerifier));
	tls.alpn_protocols = vec![ALPN.to_vec()];

	let quic_tls = quinn::crypto::rustls::QuicClientConfig::try_from(tls)?;
	let mut cfg = QuinnClientConfig::new(Arc::new(quic_tls));

	// One control stream per connection.
	let mut transport = TransportConfig::default();
	transport.max_concurrent_bidi_streams(VarInt::from_u32(4));
	transport.max_concurrent_uni_streams(VarInt::from_u32(0));
	cfg.transport_config(Arc::new(transport));

	Ok(cfg)
}
