#![forbid(unsafe_code)]

//! Per-connection adapter between the control stream and the actors.
//!
//! The inbound half decodes envelopes and drives actor calls; the outbound
//! half is a separate task draining one ordered queue that carries both
//! replies and observer pushes. The connection's observer id is registered
//! with the region and chat room on the first hello and released exactly once
//! on teardown.

use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use plaza_domain::{ChatLine, DisplayName, Identity, IdentityId, PlazaError, Position, PresenceEvent};
use plaza_protocol::framing::{FrameReader, write_message};
use plaza_protocol::pb::envelope::Msg;
use plaza_protocol::{envelope, pb};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt as _};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::server::actor::{CallScope, LeaveOutcome};
use crate::server::observer::{DeliveryError, EventSink, ObserverHandle, ObserverId};
use crate::server::state::ServerState;
use crate::util::time::unix_ms_now;

/// How long queued replies may take to flush once the inbound side is done.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

enum Outbound {
	Envelope(pb::Envelope),
	/// Flush what is queued, then shut the write side down.
	Finish,
}

/// Observer sink bound to one connection's outbound queue.
struct ConnectionSink {
	tx: mpsc::UnboundedSender<Outbound>,
}

impl ConnectionSink {
	fn push(&self, msg: Msg) -> Result<(), DeliveryError> {
		self.tx
			.send(Outbound::Envelope(envelope(String::new(), msg)))
			.map_err(|_| DeliveryError::Closed)
	}
}

impl EventSink<PresenceEvent> for ConnectionSink {
	fn deliver(&self, event: PresenceEvent) -> Result<(), DeliveryError> {
		self.push(Msg::Presence((&event).into()))
	}

	fn is_closed(&self) -> bool {
		self.tx.is_closed()
	}
}

impl EventSink<ChatLine> for ConnectionSink {
	fn deliver(&self, event: ChatLine) -> Result<(), DeliveryError> {
		self.push(Msg::Chat((&event).into()))
	}

	fn is_closed(&self) -> bool {
		self.tx.is_closed()
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BridgePhase {
	Connecting,
	AwaitingFirstHello,
	Joined { identity: IdentityId },
	Closing,
}

enum Flow {
	Continue,
	Close,
}

/// Undo for a (possibly partial) join. Runs at most once.
struct Teardown {
	state: ServerState,
	conn_id: u64,
	identity: IdentityId,
	observer: ObserverId,
	joined: bool,
}

impl Teardown {
	async fn run(self) {
		let Teardown {
			state,
			conn_id,
			identity,
			observer,
			joined,
		} = self;
		let region = state.world.region;
		let room = state.world.chat_room;
		let scope = || CallScope::detached(state.world.call_timeout);

		// Unsubscribe first so this connection never sees its own Leave.
		if let Err(e) = state.regions.unsubscribe(region, &scope(), observer).await {
			warn!(conn_id, %identity, %region, error = %e, "presence unsubscribe failed");
		}
		if let Err(e) = state.chat_rooms.unsubscribe(room, &scope(), observer).await {
			warn!(conn_id, %identity, %room, error = %e, "chat unsubscribe failed");
		}

		match state.regions.leave(region, &scope(), identity, Some(observer)).await {
			Ok(LeaveOutcome::Left) | Err(PlazaError::NotFound(_)) => {}
			Ok(LeaveOutcome::Superseded) => {
				debug!(conn_id, %identity, "presence kept by a newer connection");
			}
			Err(e) => warn!(conn_id, %identity, %region, error = %e, "presence leave failed"),
		}
		match state.chat_rooms.leave(room, &scope(), identity, Some(observer)).await {
			Ok(_) | Err(PlazaError::NotFound(_)) => {}
			Err(e) => warn!(conn_id, %identity, %room, error = %e, "chat leave failed"),
		}

		if joined {
			if let Err(e) = state.identities.touch(identity, &scope(), unix_ms_now()).await {
				warn!(conn_id, %identity, error = %e, "last_seen update failed");
			}
			info!(conn_id, %identity, "session closed");
		}
	}
}

/// Holds the pending teardown. Dropping an armed guard spawns it.
#[derive(Default)]
struct SessionGuard {
	pending: Option<Teardown>,
}

impl SessionGuard {
	fn arm(&mut self, teardown: Teardown) {
		self.pending = Some(teardown);
	}

	fn mark_joined(&mut self) {
		if let Some(pending) = self.pending.as_mut() {
			pending.joined = true;
		}
	}

	async fn release(&mut self) {
		if let Some(teardown) = self.pending.take() {
			teardown.run().await;
		}
	}
}

impl Drop for SessionGuard {
	fn drop(&mut self) {
		let Some(teardown) = self.pending.take() else {
			return;
		};
		match tokio::runtime::Handle::try_current() {
			Ok(handle) => {
				handle.spawn(teardown.run());
			}
			Err(_) => warn!(
				conn_id = teardown.conn_id,
				identity = %teardown.identity,
				"no runtime to run session teardown"
			),
		}
	}
}

pub struct StreamBridge {
	conn_id: u64,
	state: ServerState,
	observer: ObserverId,
	sink: Arc<ConnectionSink>,
	outbound_rx: Option<mpsc::UnboundedReceiver<Outbound>>,
	phase: BridgePhase,
	guard: SessionGuard,
}

impl StreamBridge {
	pub fn new(state: ServerState, conn_id: u64) -> Self {
		let (tx, rx) = mpsc::unbounded_channel();
		Self {
			conn_id,
			state,
			observer: ObserverId::next(),
			sink: Arc::new(ConnectionSink { tx }),
			outbound_rx: Some(rx),
			phase: BridgePhase::Connecting,
			guard: SessionGuard::default(),
		}
	}

	/// Serve one control stream until the peer finishes, disconnects, or `cancel` fires.
	pub async fn run<R, W>(mut self, reader: R, writer: W, cancel: CancellationToken) -> anyhow::Result<()>
	where
		R: AsyncRead + Unpin + Send,
		W: AsyncWrite + Unpin + Send + 'static,
	{
		let max_frame_size = self.state.connection.max_frame_bytes;
		let Some(outbound_rx) = self.outbound_rx.take() else {
			return Err(anyhow!("stream bridge already ran"));
		};
		let mut writer_task = tokio::spawn(write_loop(
			self.conn_id,
			writer,
			outbound_rx,
			max_frame_size,
			cancel.clone(),
		));

		self.phase = BridgePhase::AwaitingFirstHello;
		let mut frames = FrameReader::new(reader, max_frame_size);
		let result = loop {
			let next = tokio::select! {
				biased;
				_ = cancel.cancelled() => break Ok(()),
				next = frames.read_message::<pb::Envelope>() => next,
			};

			match next {
				Ok(Some(env)) => {
					metrics::counter!("plaza_server_envelopes_in_total").increment(1);
					if let Flow::Close = self.handle_envelope(env, &cancel).await {
						break Ok(());
					}
				}
				Ok(None) => {
					debug!(conn_id = self.conn_id, "control stream finished by peer");
					break Ok(());
				}
				Err(e) => {
					metrics::counter!("plaza_server_control_decode_errors_total").increment(1);
					break Err(anyhow!(e).context("read control stream"));
				}
			}
		};

		self.phase = BridgePhase::Closing;
		self.guard.release().await;

		let _ = self.sink.tx.send(Outbound::Finish);
		if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer_task).await.is_err() {
			debug!(conn_id = self.conn_id, "outbound queue did not drain in time");
			cancel.cancel();
			writer_task.abort();
		}

		result
	}

	fn reply(&self, request_id: String, msg: Msg) {
		let _ = self.sink.tx.send(Outbound::Envelope(envelope(request_id, msg)));
	}

	async fn handle_envelope(&mut self, env: pb::Envelope, cancel: &CancellationToken) -> Flow {
		let request_id = env.request_id;
		let Some(msg) = env.msg else {
			let err = PlazaError::InvalidArgument("envelope without a message".to_string());
			self.reply(request_id, Msg::Error((&err).into()));
			return Flow::Continue;
		};

		let scope = CallScope::new(cancel, self.state.world.call_timeout);
		let mut flow = Flow::Continue;
		let result = match msg {
			Msg::Login(login) => self.login(&login.account, &scope).await,
			Msg::Hello(hello) => self.hello(hello, &scope).await,
			Msg::Move(m) => self.move_to(m, &scope).await,
			Msg::Rename(r) => self.rename(r.new_name, &scope).await,
			Msg::ChangeSkin(c) => self.change_skin(c.new_skin, &scope).await,
			Msg::ChatSend(c) => self.chat(c.text, &scope).await,
			Msg::Echo(e) => self.echo(e.client_time_unix_ms, &scope).await,
			Msg::Disconnect(_) => {
				flow = Flow::Close;
				Ok(Msg::Ack(pb::Ack::default()))
			}
			Msg::Welcome(_)
			| Msg::LoginResult(_)
			| Msg::Ack(_)
			| Msg::Error(_)
			| Msg::EchoResult(_)
			| Msg::Presence(_)
			| Msg::Chat(_) => Err(PlazaError::InvalidArgument("server message sent by client".to_string())),
		};

		match result {
			Ok(msg) => self.reply(request_id, msg),
			// The connection is gone; teardown replaces the reply.
			Err(PlazaError::Cancelled) if cancel.is_cancelled() => return Flow::Close,
			Err(err) => {
				metrics::counter!("plaza_server_request_errors_total", "code" => err.code()).increment(1);
				debug!(conn_id = self.conn_id, request_id = %request_id, error = %err, "request failed");
				self.reply(request_id, Msg::Error((&err).into()));
			}
		}
		flow
	}

	fn joined_identity(&self) -> Result<IdentityId, PlazaError> {
		match self.phase {
			BridgePhase::Joined { identity } => Ok(identity),
			_ => Err(PlazaError::NotFound("no identity joined on this stream".to_string())),
		}
	}

	async fn login(&self, account: &str, scope: &CallScope) -> Result<Msg, PlazaError> {
		if matches!(self.phase, BridgePhase::Joined { .. }) {
			return Err(PlazaError::InvalidArgument("already joined on this stream".to_string()));
		}
		let login = self.state.lobby.login(account, scope).await?;
		Ok(Msg::LoginResult(pb::LoginResult {
			profile: Some((&login.identity).into()),
			session_token: login.session_token,
			server_time_unix_ms: unix_ms_now(),
		}))
	}

	async fn hello(&mut self, hello: pb::Hello, scope: &CallScope) -> Result<Msg, PlazaError> {
		let claimed: IdentityId = hello
			.identity_id
			.parse()
			.map_err(|e| PlazaError::InvalidArgument(format!("identity id: {e}")))?;

		match self.phase {
			BridgePhase::Joined { identity } if identity == claimed => {
				self.subscribe_all(scope).await?;
				debug!(conn_id = self.conn_id, %identity, "keep-alive");
				Ok(Msg::Ack(pb::Ack::default()))
			}
			BridgePhase::Joined { identity } => Err(PlazaError::InvalidArgument(format!(
				"stream is bound to {identity}, hello named {claimed}"
			))),
			_ => self.first_hello(claimed, &hello.session_token, scope).await,
		}
	}

	async fn first_hello(&mut self, claimed: IdentityId, token: &str, scope: &CallScope) -> Result<Msg, PlazaError> {
		let validated = self.state.gate.validate(token)?;
		if validated != claimed {
			return Err(PlazaError::Unauthenticated(
				"session token was issued for another identity".to_string(),
			));
		}

		let profile = self.state.identities.get_profile(claimed, scope).await?;

		self.guard.arm(Teardown {
			state: self.state.clone(),
			conn_id: self.conn_id,
			identity: claimed,
			observer: self.observer,
			joined: false,
		});
		if let Err(err) = self.join_rooms(&profile, scope).await {
			debug!(conn_id = self.conn_id, identity = %claimed, error = %err, "join failed, rolling back");
			self.guard.release().await;
			return Err(err);
		}
		self.guard.mark_joined();
		self.phase = BridgePhase::Joined { identity: claimed };

		metrics::counter!("plaza_server_joins_total").increment(1);
		info!(
			conn_id = self.conn_id,
			identity = %claimed,
			region = %self.state.world.region,
			observer = %self.observer,
			"joined"
		);

		Ok(Msg::Welcome(pb::Welcome {
			server_name: self.state.connection.server_name.clone(),
			server_time_unix_ms: unix_ms_now(),
			max_frame_bytes: u32::try_from(self.state.connection.max_frame_bytes).unwrap_or(u32::MAX),
			profile: Some((&profile).into()),
		}))
	}

	async fn join_rooms(&self, profile: &Identity, scope: &CallScope) -> Result<(), PlazaError> {
		self.subscribe_all(scope).await?;
		self.state
			.regions
			.join(self.state.world.region, scope, profile.into(), self.observer)
			.await?;
		self.state
			.chat_rooms
			.join(
				self.state.world.chat_room,
				scope,
				profile.id,
				profile.display_name.clone(),
				self.observer,
			)
			.await
	}

	/// Register (or refresh) this connection's observer with both rooms.
	async fn subscribe_all(&self, scope: &CallScope) -> Result<(), PlazaError> {
		let presence_sink: Arc<dyn EventSink<PresenceEvent>> = self.sink.clone();
		let chat_sink: Arc<dyn EventSink<ChatLine>> = self.sink.clone();

		self.state
			.regions
			.subscribe(
				self.state.world.region,
				scope,
				ObserverHandle::new(self.observer, presence_sink),
			)
			.await?;
		self.state
			.chat_rooms
			.subscribe(
				self.state.world.chat_room,
				scope,
				ObserverHandle::new(self.observer, chat_sink),
			)
			.await
	}

	/// The durable write already succeeded; a room that no longer lists the
	/// identity (it left concurrently) is not an error for the caller.
	fn tolerate_departed(&self, room: &'static str, result: Result<(), PlazaError>) -> Result<(), PlazaError> {
		match result {
			Err(PlazaError::NotFound(msg)) => {
				debug!(conn_id = self.conn_id, room, %msg, "room no longer lists this identity");
				Ok(())
			}
			other => other,
		}
	}

	fn ack(profile: &Identity) -> Msg {
		Msg::Ack(pb::Ack {
			profile: Some(profile.into()),
		})
	}

	async fn move_to(&self, m: pb::Move, scope: &CallScope) -> Result<Msg, PlazaError> {
		let id = self.joined_identity()?;
		let position = Position::new(m.x, m.y)?;

		let profile = self.state.identities.set_position(id, scope, position).await?;
		let moved = self
			.state
			.regions
			.move_to(self.state.world.region, scope, id, position)
			.await;
		self.tolerate_departed("presence", moved)?;
		Ok(Self::ack(&profile))
	}

	async fn rename(&self, new_name: String, scope: &CallScope) -> Result<Msg, PlazaError> {
		let id = self.joined_identity()?;
		let name = DisplayName::new(new_name)?;

		let profile = self.state.identities.rename(id, scope, name.clone()).await?;
		let renamed = self
			.state
			.regions
			.rename(self.state.world.region, scope, id, name.clone())
			.await;
		self.tolerate_departed("presence", renamed)?;
		let renamed = self
			.state
			.chat_rooms
			.rename(self.state.world.chat_room, scope, id, name)
			.await;
		self.tolerate_departed("chat", renamed)?;
		Ok(Self::ack(&profile))
	}

	async fn change_skin(&self, skin: u32, scope: &CallScope) -> Result<Msg, PlazaError> {
		let id = self.joined_identity()?;

		let profile = self.state.identities.change_skin(id, scope, skin).await?;
		let changed = self
			.state
			.regions
			.change_skin(self.state.world.region, scope, id, skin)
			.await;
		self.tolerate_departed("presence", changed)?;
		Ok(Self::ack(&profile))
	}

	async fn chat(&self, text: String, scope: &CallScope) -> Result<Msg, PlazaError> {
		let id = self.joined_identity()?;
		self.state
			.chat_rooms
			.chat(self.state.world.chat_room, scope, id, text)
			.await?;
		Ok(Msg::Ack(pb::Ack::default()))
	}

	async fn echo(&self, client_time_unix_ms: i64, scope: &CallScope) -> Result<Msg, PlazaError> {
		let id = self.joined_identity()?;
		let gateway_time_unix_ms = unix_ms_now();
		let data = self
			.state
			.identities
			.echo(id, scope, client_time_unix_ms, gateway_time_unix_ms)
			.await?;
		let actor_to_gateway_ms = unix_ms_now() - data.actor_time_unix_ms;
		Ok(Msg::EchoResult(plaza_protocol::convert::echo_result(&data, actor_to_gateway_ms)))
	}
}

async fn write_loop<W>(
	conn_id: u64,
	mut writer: W,
	mut rx: mpsc::UnboundedReceiver<Outbound>,
	max_frame_size: usize,
	cancel: CancellationToken,
) where
	W: AsyncWrite + Unpin + Send,
{
	loop {
		let next = tokio::select! {
			biased;
			_ = cancel.cancelled() => return,
			next = rx.recv() => next,
		};

		let env = match next {
			Some(Outbound::Envelope(env)) => env,
			Some(Outbound::Finish) | None => {
				let _ = writer.shutdown().await;
				return;
			}
		};

		let written = tokio::select! {
			biased;
			_ = cancel.cancelled() => return,
			written = write_message(&mut writer, &env, max_frame_size) => written,
		};
		match written {
			Ok(n) => {
				metrics::counter!("plaza_server_envelopes_out_total").increment(1);
				metrics::counter!("plaza_server_control_bytes_out_total").increment(n as u64);
			}
			Err(e) => {
				debug!(conn_id, error = %e, "control stream write failed");
				cancel.cancel();
				return;
			}
		}
	}
}
