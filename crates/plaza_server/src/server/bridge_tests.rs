#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use plaza_domain::{DisplayName, Identity, IdentityId, Position, SYSTEM_SENDER, Skin};
use plaza_protocol::framing::{DEFAULT_MAX_FRAME_SIZE, FrameReader, write_message};
use plaza_protocol::pb::envelope::Msg;
use plaza_protocol::pb::presence_event::Event;
use plaza_protocol::{envelope, pb};
use tokio::io::{AsyncWriteExt as _, DuplexStream};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::config::WorldSettings;
use crate::server::auth::HmacSessionGate;
use crate::server::bridge::StreamBridge;
use crate::server::connection::ConnectionSettings;
use crate::server::repository::{IdentityRepository, InMemoryIdentityRepository};
use crate::server::state::ServerState;
use crate::server::test_support::{TEST_SECRET, identity, scope, test_state};

struct TestClient {
	writer: DuplexStream,
	reader: FrameReader<DuplexStream>,
	pushed: Vec<Msg>,
	next_request: u64,
	cancel: CancellationToken,
	task: JoinHandle<anyhow::Result<()>>,
}

fn connect(state: &ServerState, conn_id: u64) -> TestClient {
	let (client_w, server_r) = tokio::io::duplex(64 * 1024);
	let (server_w, client_r) = tokio::io::duplex(64 * 1024);
	let bridge = StreamBridge::new(state.clone(), conn_id);
	let cancel = CancellationToken::new();
	let task = tokio::spawn(bridge.run(server_r, server_w, cancel.clone()));

	TestClient {
		writer: client_w,
		reader: FrameReader::new(client_r, DEFAULT_MAX_FRAME_SIZE),
		pushed: Vec::new(),
		next_request: 0,
		cancel,
		task,
	}
}

impl TestClient {
	async fn send(&mut self, env: pb::Envelope) {
		write_message(&mut self.writer, &env, DEFAULT_MAX_FRAME_SIZE)
			.await
			.expect("write envelope");
	}

	async fn read(&mut self) -> Option<pb::Envelope> {
		timeout(Duration::from_secs(2), self.reader.read_message::<pb::Envelope>())
			.await
			.expect("frame within timeout")
			.expect("decode frame")
	}

	/// Send `msg` and return its reply. Pushes seen on the way are kept.
	async fn request(&mut self, msg: Msg) -> Msg {
		self.next_request += 1;
		let request_id = format!("req-{}", self.next_request);
		self.send(envelope(request_id.clone(), msg)).await;

		loop {
			let env = self.read().await.expect("reply before end of stream");
			if env.request_id == request_id {
				return env.msg.expect("reply carries a message");
			}
			assert!(
				env.request_id.is_empty(),
				"reply for unexpected request {}",
				env.request_id
			);
			self.pushed.push(env.msg.expect("push carries a message"));
		}
	}

	/// Everything pushed so far, plus whatever arrives before the stream goes quiet.
	async fn drain_pushes(&mut self) -> Vec<Msg> {
		while let Ok(Ok(Some(env))) =
			timeout(Duration::from_millis(100), self.reader.read_message::<pb::Envelope>()).await
		{
			self.pushed.push(env.msg.expect("push carries a message"));
		}
		std::mem::take(&mut self.pushed)
	}

	async fn login(&mut self, account: &str) -> (String, String) {
		match self
			.request(Msg::Login(pb::Login {
				account: account.to_string(),
			}))
			.await
		{
			Msg::LoginResult(result) => (result.profile.expect("profile").id, result.session_token),
			other => panic!("expected LoginResult, got {other:?}"),
		}
	}

	async fn hello(&mut self, identity_id: &str, session_token: &str) -> Msg {
		self.request(Msg::Hello(pb::Hello {
			identity_id: identity_id.to_string(),
			session_token: session_token.to_string(),
		}))
		.await
	}

	/// Login and join; returns the identity id and session token.
	async fn join(&mut self, account: &str) -> (String, String) {
		let (id, token) = self.login(account).await;
		match self.hello(&id, &token).await {
			Msg::Welcome(welcome) => {
				assert_eq!(welcome.profile.expect("profile").id, id);
			}
			other => panic!("expected Welcome, got {other:?}"),
		}
		(id, token)
	}

	async fn disconnect(mut self) -> Vec<Msg> {
		match self.request(Msg::Disconnect(pb::Disconnect {})).await {
			Msg::Ack(_) => {}
			other => panic!("expected Ack, got {other:?}"),
		}
		let mut rest = std::mem::take(&mut self.pushed);
		while let Some(env) = self.read().await {
			rest.push(env.msg.expect("push carries a message"));
		}
		timeout(Duration::from_secs(2), self.task)
			.await
			.expect("bridge finished")
			.expect("bridge task")
			.expect("bridge result");
		rest
	}
}

fn error_code(msg: Msg) -> String {
	match msg {
		Msg::Error(err) => err.code,
		other => panic!("expected Error, got {other:?}"),
	}
}

fn presence_events(msgs: &[Msg]) -> Vec<Event> {
	msgs.iter()
		.filter_map(|m| match m {
			Msg::Presence(p) => p.event.clone(),
			_ => None,
		})
		.collect()
}

fn chat_events(msgs: &[Msg]) -> Vec<pb::ChatEvent> {
	msgs.iter()
		.filter_map(|m| match m {
			Msg::Chat(c) => Some(c.clone()),
			_ => None,
		})
		.collect()
}

fn joined_ids(events: &[Event]) -> Vec<String> {
	events
		.iter()
		.filter_map(|e| match e {
			Event::Join(c) => Some(c.id.clone()),
			_ => None,
		})
		.collect()
}

#[tokio::test]
async fn commands_before_hello_are_not_found() {
	let (state, _repo) = test_state();
	let mut client = connect(&state, 1);

	let reply = client.request(Msg::Move(pb::Move { x: 1.0, y: 1.0 })).await;
	assert_eq!(error_code(reply), "NOT_FOUND");

	let reply = client
		.request(Msg::ChatSend(pb::ChatSend {
			text: "hi".to_string(),
		}))
		.await;
	assert_eq!(error_code(reply), "NOT_FOUND");
}

#[tokio::test]
async fn hello_with_bad_token_is_unauthenticated() {
	let (state, _repo) = test_state();
	let mut client = connect(&state, 1);
	let (id, token) = client.login("ana").await;

	let reply = client.hello(&id, "v1.bogus.token").await;
	assert_eq!(error_code(reply), "UNAUTHENTICATED");

	let other = IdentityId::new_v4().to_string();
	let reply = client.hello(&other, &token).await;
	assert_eq!(error_code(reply), "UNAUTHENTICATED");

	let reply = client.hello("not-an-id", &token).await;
	assert_eq!(error_code(reply), "INVALID_ARGUMENT");

	// Still unjoined: nothing was registered.
	let roster = state.regions.roster(state.world.region, &scope()).await.expect("roster");
	assert!(roster.is_empty());
}

#[tokio::test]
async fn second_client_gets_snapshot_and_first_sees_join() {
	let (state, _repo) = test_state();
	let mut a = connect(&state, 1);
	let mut b = connect(&state, 2);

	let (a_id, _) = a.join("a").await;
	assert_eq!(joined_ids(&presence_events(&a.drain_pushes().await)), vec![a_id.clone()]);

	let (b_id, _) = b.join("b").await;
	let b_events = presence_events(&b.drain_pushes().await);
	assert_eq!(joined_ids(&b_events), vec![a_id.clone(), b_id.clone()]);

	let a_events = presence_events(&a.drain_pushes().await);
	assert_eq!(joined_ids(&a_events), vec![b_id]);
}

#[tokio::test]
async fn keep_alive_hello_does_not_rebroadcast_join() {
	let (state, _repo) = test_state();
	let mut a = connect(&state, 1);
	let mut b = connect(&state, 2);

	let (a_id, a_token) = a.join("a").await;
	b.join("b").await;
	a.drain_pushes().await;
	b.drain_pushes().await;

	for _ in 0..3 {
		match a.hello(&a_id, &a_token).await {
			Msg::Ack(_) => {}
			other => panic!("expected Ack for keep-alive, got {other:?}"),
		}
	}

	assert!(b.drain_pushes().await.is_empty());
	assert!(a.drain_pushes().await.is_empty());

	let other = IdentityId::new_v4().to_string();
	assert_eq!(error_code(a.hello(&other, &a_token).await), "INVALID_ARGUMENT");
}

#[tokio::test]
async fn move_rename_and_skin_are_acked_and_broadcast() {
	let (state, repo) = test_state();
	let mut a = connect(&state, 1);
	let mut b = connect(&state, 2);

	let (a_id, _) = a.join("a").await;
	b.join("b").await;
	a.drain_pushes().await;
	b.drain_pushes().await;

	match a.request(Msg::Move(pb::Move { x: 4.0, y: -2.0 })).await {
		Msg::Ack(ack) => {
			let profile = ack.profile.expect("profile");
			assert_eq!((profile.x, profile.y), (4.0, -2.0));
		}
		other => panic!("expected Ack, got {other:?}"),
	}
	match a
		.request(Msg::Rename(pb::Rename {
			new_name: "Ana".to_string(),
		}))
		.await
	{
		Msg::Ack(ack) => assert_eq!(ack.profile.expect("profile").name, "Ana"),
		other => panic!("expected Ack, got {other:?}"),
	}
	match a.request(Msg::ChangeSkin(pb::ChangeSkin { new_skin: 2 })).await {
		Msg::Ack(ack) => assert_eq!(ack.profile.expect("profile").skin, 2),
		other => panic!("expected Ack, got {other:?}"),
	}

	let events = presence_events(&b.drain_pushes().await);
	assert_eq!(events.len(), 3, "got {events:?}");
	assert!(matches!(&events[0], Event::Move(m) if m.id == a_id && m.x == 4.0 && m.y == -2.0));
	assert!(matches!(&events[1], Event::Rename(r) if r.id == a_id && r.name == "Ana"));
	assert!(matches!(&events[2], Event::SkinChange(s) if s.id == a_id && s.skin == 2));

	let stored = repo
		.get_identity(a_id.parse().expect("id"))
		.await
		.expect("get")
		.expect("present");
	assert_eq!(stored.display_name.as_str(), "Ana");
	assert_eq!(stored.skin.get(), 2);
}

#[tokio::test]
async fn invalid_arguments_are_rejected_without_broadcast() {
	let (state, _repo) = test_state();
	let mut a = connect(&state, 1);
	let mut b = connect(&state, 2);

	a.join("a").await;
	b.join("b").await;
	a.drain_pushes().await;
	b.drain_pushes().await;

	let reply = a.request(Msg::ChangeSkin(pb::ChangeSkin { new_skin: 7 })).await;
	assert_eq!(error_code(reply), "INVALID_ARGUMENT");
	let reply = a
		.request(Msg::Rename(pb::Rename {
			new_name: "  ".to_string(),
		}))
		.await;
	assert_eq!(error_code(reply), "INVALID_ARGUMENT");
	let reply = a.request(Msg::Move(pb::Move { x: f32::NAN, y: 0.0 })).await;
	assert_eq!(error_code(reply), "INVALID_ARGUMENT");
	let reply = a.request(Msg::Ack(pb::Ack::default())).await;
	assert_eq!(error_code(reply), "INVALID_ARGUMENT");

	assert!(b.drain_pushes().await.is_empty());
}

#[tokio::test]
async fn envelope_without_message_is_invalid() {
	let (state, _repo) = test_state();
	let mut client = connect(&state, 1);

	client
		.send(pb::Envelope {
			version: plaza_protocol::PROTOCOL_VERSION,
			request_id: "empty".to_string(),
			msg: None,
		})
		.await;
	let env = client.read().await.expect("reply");
	assert_eq!(env.request_id, "empty");
	assert_eq!(error_code(env.msg.expect("msg")), "INVALID_ARGUMENT");
}

#[tokio::test]
async fn login_after_join_is_rejected() {
	let (state, _repo) = test_state();
	let mut a = connect(&state, 1);
	a.join("a").await;

	let reply = a
		.request(Msg::Login(pb::Login {
			account: "other".to_string(),
		}))
		.await;
	assert_eq!(error_code(reply), "INVALID_ARGUMENT");
}

#[tokio::test]
async fn chat_reaches_everyone_in_the_room() {
	let (state, _repo) = test_state();
	let mut a = connect(&state, 1);
	let mut b = connect(&state, 2);

	a.join("a").await;
	b.join("b").await;
	a.drain_pushes().await;
	b.drain_pushes().await;

	match a
		.request(Msg::ChatSend(pb::ChatSend {
			text: "hello plaza".to_string(),
		}))
		.await
	{
		Msg::Ack(_) => {}
		other => panic!("expected Ack, got {other:?}"),
	}

	for client in [&mut a, &mut b] {
		let lines = chat_events(&client.drain_pushes().await);
		assert_eq!(lines.len(), 1);
		assert_eq!(lines[0].sender, "Guest-a");
		assert_eq!(lines[0].text, "hello plaza");
	}

	let reply = a.request(Msg::ChatSend(pb::ChatSend { text: " ".to_string() })).await;
	assert_eq!(error_code(reply), "INVALID_ARGUMENT");
}

#[tokio::test]
async fn late_joiner_receives_chat_backlog() {
	let (state, _repo) = test_state();
	let mut a = connect(&state, 1);
	a.join("a").await;
	for text in ["first", "second"] {
		a.request(Msg::ChatSend(pb::ChatSend { text: text.to_string() }))
			.await;
	}

	let mut b = connect(&state, 2);
	b.join("b").await;
	let lines = chat_events(&b.drain_pushes().await);
	let texts: Vec<_> = lines.iter().map(|l| l.text.as_str()).collect();
	assert_eq!(texts, vec!["first", "second"]);
}

#[tokio::test]
async fn echo_returns_latency_breakdown() {
	let (state, _repo) = test_state();
	let mut a = connect(&state, 1);
	a.join("a").await;

	let client_time = crate::util::time::unix_ms_now();
	match a
		.request(Msg::Echo(pb::Echo {
			client_time_unix_ms: client_time,
		}))
		.await
	{
		Msg::EchoResult(result) => {
			assert!(result.client_to_gateway_ms >= 0);
			assert!(result.gateway_to_actor_ms >= 0);
			assert!(result.actor_to_gateway_ms >= 0);
			assert!(result.actor_time_unix_ms >= client_time);
		}
		other => panic!("expected EchoResult, got {other:?}"),
	}
}

#[tokio::test]
async fn disconnect_tears_down_without_echoing_leave_to_self() {
	let (state, _repo) = test_state();
	let mut a = connect(&state, 1);
	let mut b = connect(&state, 2);

	let (a_id, _) = a.join("a").await;
	b.join("b").await;
	a.drain_pushes().await;
	b.drain_pushes().await;

	let tail = a.disconnect().await;
	assert!(
		presence_events(&tail).is_empty(),
		"disconnecting client saw presence events: {tail:?}"
	);
	assert!(chat_events(&tail).is_empty());

	let pushes = b.drain_pushes().await;
	let events = presence_events(&pushes);
	assert!(matches!(events.as_slice(), [Event::Leave(l)] if l.id == a_id), "got {events:?}");
	let lines = chat_events(&pushes);
	assert_eq!(lines.len(), 1);
	assert_eq!(lines[0].sender, SYSTEM_SENDER);
	assert_eq!(lines[0].text, "Guest-a left.");

	let roster = state.regions.roster(state.world.region, &scope()).await.expect("roster");
	assert_eq!(roster.len(), 1);
	assert!(roster.iter().all(|p| p.id.to_string() != a_id));
}

#[tokio::test]
async fn stream_end_runs_teardown() {
	let (state, _repo) = test_state();
	let mut a = connect(&state, 1);
	let mut b = connect(&state, 2);

	let (a_id, _) = a.join("a").await;
	b.join("b").await;
	b.drain_pushes().await;

	a.writer.shutdown().await.expect("shutdown");
	timeout(Duration::from_secs(2), a.task)
		.await
		.expect("bridge finished")
		.expect("bridge task")
		.expect("bridge result");

	let events = presence_events(&b.drain_pushes().await);
	assert!(matches!(events.as_slice(), [Event::Leave(l)] if l.id == a_id), "got {events:?}");
}

#[tokio::test]
async fn reconnect_overlap_keeps_presence_of_new_connection() {
	let (state, _repo) = test_state();
	let mut old = connect(&state, 1);
	let mut watcher = connect(&state, 2);

	let (id, _) = old.join("a").await;
	watcher.join("w").await;
	old.drain_pushes().await;
	watcher.drain_pushes().await;

	let mut new = connect(&state, 3);
	let (again, token) = new.login("a").await;
	assert_eq!(again, id);
	match new.hello(&id, &token).await {
		Msg::Welcome(_) => {}
		other => panic!("expected Welcome, got {other:?}"),
	}
	let snapshot = joined_ids(&presence_events(&new.drain_pushes().await));
	assert_eq!(snapshot.len(), 2);
	assert!(snapshot.contains(&id));

	old.disconnect().await;

	// Neither the rejoin nor the stale connection's teardown is visible to others.
	assert!(watcher.drain_pushes().await.is_empty());

	let roster = state.regions.roster(state.world.region, &scope()).await.expect("roster");
	assert!(roster.iter().any(|p| p.id.to_string() == id));

	match new.request(Msg::Move(pb::Move { x: 1.0, y: 1.0 })).await {
		Msg::Ack(_) => {}
		other => panic!("expected Ack, got {other:?}"),
	}
}

async fn wait_for_roster_len(state: &ServerState, len: usize) {
	let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
	loop {
		let roster = state.regions.roster(state.world.region, &scope()).await.expect("roster");
		if roster.len() == len {
			return;
		}
		assert!(tokio::time::Instant::now() < deadline, "roster stuck at {}", roster.len());
		tokio::time::sleep(Duration::from_millis(10)).await;
	}
}

#[tokio::test(start_paused = true)]
async fn keep_alive_hello_refreshes_subscriptions() {
	let (state, _repo) = test_state();
	let mut kept = connect(&state, 1);
	let mut lapsed = connect(&state, 2);
	let mut mover = connect(&state, 3);

	let (kept_id, kept_token) = kept.join("kept").await;
	lapsed.join("lapsed").await;
	let (mover_id, _) = mover.join("mover").await;
	for client in [&mut kept, &mut lapsed, &mut mover] {
		client.drain_pushes().await;
	}

	tokio::time::advance(Duration::from_secs(120)).await;
	match kept.hello(&kept_id, &kept_token).await {
		Msg::Ack(_) => {}
		other => panic!("expected Ack for keep-alive, got {other:?}"),
	}
	// 210 s after joining: past the TTL unless the keep-alive refreshed it.
	tokio::time::advance(Duration::from_secs(90)).await;

	match mover.request(Msg::Move(pb::Move { x: 5.0, y: 5.0 })).await {
		Msg::Ack(_) => {}
		other => panic!("expected Ack, got {other:?}"),
	}

	let events = presence_events(&kept.drain_pushes().await);
	assert!(matches!(events.as_slice(), [Event::Move(m)] if m.id == mover_id), "got {events:?}");
	let events = presence_events(&lapsed.drain_pushes().await);
	assert!(events.is_empty(), "expired subscription still delivered {events:?}");
}

#[tokio::test]
async fn cancel_racing_stream_end_tears_down_once() {
	let (state, _repo) = test_state();
	let mut a = connect(&state, 1);
	let mut b = connect(&state, 2);

	let (a_id, _) = a.join("a").await;
	b.join("b").await;
	b.drain_pushes().await;

	let cancel = a.cancel.clone();
	let (_, shutdown) = tokio::join!(async move { cancel.cancel() }, a.writer.shutdown());
	shutdown.expect("shutdown");
	timeout(Duration::from_secs(2), a.task)
		.await
		.expect("bridge finished")
		.expect("bridge task")
		.expect("bridge result");

	let pushes = b.drain_pushes().await;
	let events = presence_events(&pushes);
	assert!(matches!(events.as_slice(), [Event::Leave(l)] if l.id == a_id), "got {events:?}");
	let lines = chat_events(&pushes);
	assert_eq!(lines.len(), 1, "got {lines:?}");
	assert_eq!(lines[0].text, "Guest-a left.");

	let roster = state.regions.roster(state.world.region, &scope()).await.expect("roster");
	assert_eq!(roster.len(), 1);
}

#[tokio::test]
async fn dropped_bridge_still_runs_teardown() {
	let (state, _repo) = test_state();
	let mut a = connect(&state, 1);
	let mut b = connect(&state, 2);

	let (a_id, _) = a.join("a").await;
	b.join("b").await;
	b.drain_pushes().await;

	a.task.abort();
	let aborted = a.task.await.expect_err("bridge task aborted");
	assert!(aborted.is_cancelled());

	wait_for_roster_len(&state, 1).await;
	let pushes = b.drain_pushes().await;
	let events = presence_events(&pushes);
	assert!(matches!(events.as_slice(), [Event::Leave(l)] if l.id == a_id), "got {events:?}");
	assert_eq!(chat_events(&pushes).len(), 1);
}

/// Repository whose `get_identity` parks while `hold` is locked.
#[derive(Default)]
struct HeldRepository {
	inner: InMemoryIdentityRepository,
	hold: Mutex<()>,
	entered: Notify,
}

#[async_trait]
impl IdentityRepository for HeldRepository {
	async fn get_identity(&self, id: IdentityId) -> anyhow::Result<Option<Identity>> {
		self.entered.notify_one();
		let _held = self.hold.lock().await;
		self.inner.get_identity(id).await
	}

	async fn get_by_account(&self, account: &str) -> anyhow::Result<Option<Identity>> {
		self.inner.get_by_account(account).await
	}

	async fn create_identity(&self, account: &str, display_name: DisplayName) -> anyhow::Result<Identity> {
		self.inner.create_identity(account, display_name).await
	}

	async fn update_name(&self, id: IdentityId, name: &DisplayName) -> anyhow::Result<Option<Identity>> {
		self.inner.update_name(id, name).await
	}

	async fn update_skin(&self, id: IdentityId, skin: Skin) -> anyhow::Result<Option<Identity>> {
		self.inner.update_skin(id, skin).await
	}

	async fn update_position(&self, id: IdentityId, position: Position) -> anyhow::Result<Option<Identity>> {
		self.inner.update_position(id, position).await
	}

	async fn touch_last_seen(&self, id: IdentityId, at_unix_ms: i64) -> anyhow::Result<Option<Identity>> {
		self.inner.touch_last_seen(id, at_unix_ms).await
	}
}

#[tokio::test]
async fn cancel_during_first_hello_leaves_no_presence() {
	let repo = Arc::new(HeldRepository::default());
	let slow = identity("slow");
	repo.inner.insert(slow.clone()).await;
	let state = ServerState::new(
		repo.clone(),
		Arc::new(HmacSessionGate::new(TEST_SECRET.to_vec(), Duration::from_secs(600))),
		WorldSettings::default(),
		ConnectionSettings::default(),
	);
	let token = state.gate.issue(slow.id).expect("issue token");

	let held = repo.hold.lock().await;
	let mut client = connect(&state, 1);
	client
		.send(envelope(
			"hello-1".to_string(),
			Msg::Hello(pb::Hello {
				identity_id: slow.id.to_string(),
				session_token: token,
			}),
		))
		.await;
	timeout(Duration::from_secs(2), repo.entered.notified())
		.await
		.expect("profile load started");

	client.cancel.cancel();
	while let Some(env) = client.read().await {
		assert_ne!(env.request_id, "hello-1", "cancelled hello was answered");
	}
	timeout(Duration::from_secs(2), client.task)
		.await
		.expect("bridge finished")
		.expect("bridge task")
		.expect("bridge result");
	drop(held);

	let roster = state.regions.roster(state.world.region, &scope()).await.expect("roster");
	assert!(roster.is_empty(), "got {roster:?}");

	let mut late = connect(&state, 2);
	let (late_id, _) = late.join("late").await;
	let events = presence_events(&late.drain_pushes().await);
	assert_eq!(joined_ids(&events), vec![late_id]);
}
