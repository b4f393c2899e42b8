#![forbid(unsafe_code)]

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use plaza_domain::{DisplayName, Identity, IdentityId, Position, Presence, Skin};
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::config::WorldSettings;
use crate::server::actor::CallScope;
use crate::server::auth::HmacSessionGate;
use crate::server::connection::ConnectionSettings;
use crate::server::observer::{EventSink, ObserverHandle, ObserverId};
use crate::server::repository::InMemoryIdentityRepository;
use crate::server::state::ServerState;

pub const TEST_SECRET: &[u8] = b"plaza-test-secret";

pub fn scope() -> CallScope {
	CallScope::detached(Duration::from_secs(5))
}

pub fn presence(name: &str) -> Presence {
	Presence {
		id: IdentityId::new_v4(),
		display_name: DisplayName::new(name).expect("valid name"),
		skin: Skin::default(),
		position: Position::ORIGIN,
	}
}

pub fn identity(account: &str) -> Identity {
	Identity {
		id: IdentityId::new_v4(),
		account: account.to_string(),
		display_name: DisplayName::new(format!("Guest-{account}")).expect("valid name"),
		skin: Skin::default(),
		position: Position::ORIGIN,
		last_seen_unix_ms: 0,
	}
}

/// Observer backed by an unbounded channel; the receiver sees every delivered event.
pub fn observer<E: Send + 'static>() -> (ObserverHandle<E>, mpsc::UnboundedReceiver<E>) {
	let (tx, rx) = mpsc::unbounded_channel::<E>();
	let sink: Arc<dyn EventSink<E>> = Arc::new(tx);
	(ObserverHandle::new(ObserverId::next(), sink), rx)
}

pub async fn recv_within<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
	timeout(Duration::from_millis(500), rx.recv())
		.await
		.expect("expected an event within timeout")
		.expect("channel open")
}

pub async fn assert_silent<T: Debug>(rx: &mut mpsc::UnboundedReceiver<T>) {
	let got = timeout(Duration::from_millis(50), rx.recv()).await;
	assert!(got.is_err(), "unexpected event: {got:?}");
}

pub fn test_state() -> (ServerState, Arc<InMemoryIdentityRepository>) {
	test_state_with(WorldSettings::default())
}

pub fn test_state_with(world: WorldSettings) -> (ServerState, Arc<InMemoryIdentityRepository>) {
	let repo = Arc::new(InMemoryIdentityRepository::new());
	let gate = Arc::new(HmacSessionGate::new(TEST_SECRET.to_vec(), Duration::from_secs(600)));
	let state = ServerState::new(repo.clone(), gate, world, ConnectionSettings::default());
	(state, repo)
}
