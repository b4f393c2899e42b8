#![forbid(unsafe_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde::Serialize;

use crate::config::WorldSettings;
use crate::server::actor::DirectoryConfig;
use crate::server::auth::SessionGate;
use crate::server::chat::{ChatActor, ChatDirectory};
use crate::server::connection::ConnectionSettings;
use crate::server::identity::{IdentityActor, IdentityDirectory};
use crate::server::lobby::Lobby;
use crate::server::presence::{PresenceActor, PresenceDirectory};
use crate::server::repository::IdentityRepository;

/// Shared server state. Cheap to clone; one copy per connection task.
#[derive(Clone)]
pub struct ServerState {
	pub identities: IdentityDirectory,
	pub regions: PresenceDirectory,
	pub chat_rooms: ChatDirectory,
	pub lobby: Lobby,
	pub gate: Arc<dyn SessionGate>,
	pub world: WorldSettings,
	pub connection: ConnectionSettings,
	active_connections: Arc<AtomicUsize>,
}

/// Snapshot served on `/statsz`.
#[derive(Debug, Clone, Serialize)]
pub struct ServerStats {
	pub active_connections: usize,
	pub identity_actors: usize,
	pub presence_actors: usize,
	pub chat_actors: usize,
}

impl ServerState {
	pub fn new(
		repo: Arc<dyn IdentityRepository>,
		gate: Arc<dyn SessionGate>,
		world: WorldSettings,
		connection: ConnectionSettings,
	) -> Self {
		let directory_cfg = DirectoryConfig {
			mailbox_capacity: world.mailbox_capacity,
			idle_after: world.actor_idle,
		};

		let identities = {
			let repo = Arc::clone(&repo);
			IdentityDirectory::new(directory_cfg.clone(), move |id| IdentityActor::new(id, Arc::clone(&repo)))
		};

		let observer_ttl = world.observer_ttl;
		let regions = PresenceDirectory::new(directory_cfg.clone(), move |region| PresenceActor::new(region, observer_ttl));

		let history_capacity = world.chat_history_capacity;
		let chat_rooms = ChatDirectory::new(directory_cfg, move |room| ChatActor::new(room, history_capacity, observer_ttl));

		let lobby = Lobby::new(repo, identities.clone(), Arc::clone(&gate));

		Self {
			identities,
			regions,
			chat_rooms,
			lobby,
			gate,
			world,
			connection,
			active_connections: Arc::new(AtomicUsize::new(0)),
		}
	}

	/// Count a connection until the returned guard is dropped.
	pub fn track_connection(&self) -> ConnectionCount {
		self.active_connections.fetch_add(1, Ordering::Relaxed);
		metrics::gauge!("plaza_server_active_connections").increment(1.0);
		ConnectionCount {
			active: Arc::clone(&self.active_connections),
		}
	}

	pub fn active_connections(&self) -> usize {
		self.active_connections.load(Ordering::Relaxed)
	}

	pub async fn stats(&self) -> ServerStats {
		ServerStats {
			active_connections: self.active_connections(),
			identity_actors: self.identities.len().await,
			presence_actors: self.regions.len().await,
			chat_actors: self.chat_rooms.len().await,
		}
	}
}

pub struct ConnectionCount {
	active: Arc<AtomicUsize>,
}

impl Drop for ConnectionCount {
	fn drop(&mut self) {
		self.active.fetch_sub(1, Ordering::Relaxed);
		metrics::gauge!("plaza_server_active_connections").decrement(1.0);
	}
}
