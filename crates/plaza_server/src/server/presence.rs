#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use plaza_domain::{DisplayName, IdentityId, PlazaError, Position, Presence, PresenceEvent, RegionKey, Skin};
use tracing::debug;

use crate::server::actor::{Actor, ActorDirectory, CallScope, LeaveOutcome, Reply};
use crate::server::observer::{ObserverHandle, ObserverId, ObserverRegistry};

pub type PresenceDirectory = ActorDirectory<PresenceActor>;

/// Result of a presence join.
#[derive(Debug, Clone, PartialEq)]
pub struct JoinOutcome {
	pub presence: Presence,
	/// False when the id was already present (rejoin).
	pub newly_joined: bool,
}

pub enum PresenceMsg {
	Subscribe {
		observer: ObserverHandle<PresenceEvent>,
		reply: Reply<()>,
	},
	Unsubscribe {
		observer: ObserverId,
		reply: Reply<()>,
	},
	Join {
		presence: Presence,
		observer: ObserverId,
		reply: Reply<JoinOutcome>,
	},
	Move {
		id: IdentityId,
		position: Position,
		reply: Reply<()>,
	},
	Rename {
		id: IdentityId,
		name: DisplayName,
		reply: Reply<()>,
	},
	ChangeSkin {
		id: IdentityId,
		skin: u32,
		reply: Reply<()>,
	},
	Leave {
		id: IdentityId,
		owner: Option<ObserverId>,
		reply: Reply<LeaveOutcome>,
	},
	Roster {
		reply: Reply<Vec<Presence>>,
	},
}

struct PresenceRecord {
	presence: Presence,
	/// Observer of the connection that most recently joined this id.
	owner: ObserverId,
}

/// Roster of one region.
pub struct PresenceActor {
	region: RegionKey,
	roster: BTreeMap<IdentityId, PresenceRecord>,
	observers: ObserverRegistry<PresenceEvent>,
}

impl PresenceActor {
	pub fn new(region: RegionKey, observer_ttl: Duration) -> Self {
		Self {
			region,
			roster: BTreeMap::new(),
			observers: ObserverRegistry::new("presence", observer_ttl),
		}
	}

	fn join(&mut self, presence: Presence, observer: ObserverId) -> JoinOutcome {
		if let Some(record) = self.roster.get_mut(&presence.id) {
			record.owner = observer;
			let current = record.presence.clone();

			// Rejoin: fresh snapshot to the requester only, nothing global.
			let snapshot: Vec<Presence> = self.roster.values().map(|r| r.presence.clone()).collect();
			for member in snapshot {
				self.observers.send_to(observer, PresenceEvent::Join(member));
			}
			debug!(region = %self.region, id = %presence.id, %observer, "presence rejoined");
			return JoinOutcome {
				presence: current,
				newly_joined: false,
			};
		}

		let existing: Vec<Presence> = self.roster.values().map(|r| r.presence.clone()).collect();
		for member in existing {
			self.observers.send_to(observer, PresenceEvent::Join(member));
		}

		self.roster.insert(
			presence.id,
			PresenceRecord {
				presence: presence.clone(),
				owner: observer,
			},
		);
		let delivered = self.observers.notify(&PresenceEvent::Join(presence.clone()));
		debug!(region = %self.region, id = %presence.id, %observer, delivered, "presence joined");

		JoinOutcome {
			presence,
			newly_joined: true,
		}
	}

	fn record_mut(&mut self, id: IdentityId) -> Result<&mut PresenceRecord, PlazaError> {
		self.roster
			.get_mut(&id)
			.ok_or_else(|| PlazaError::not_found(format!("{id} is not present in {}", self.region)))
	}

	fn move_to(&mut self, id: IdentityId, position: Position) -> Result<(), PlazaError> {
		self.record_mut(id)?.presence.position = position;
		self.observers.notify(&PresenceEvent::Move { id, position });
		Ok(())
	}

	fn rename(&mut self, id: IdentityId, name: DisplayName) -> Result<(), PlazaError> {
		self.record_mut(id)?.presence.display_name = name.clone();
		self.observers.notify(&PresenceEvent::Rename { id, name });
		Ok(())
	}

	fn change_skin(&mut self, id: IdentityId, skin: u32) -> Result<(), PlazaError> {
		let record = self.record_mut(id)?;
		let skin = Skin::new(skin)?;
		record.presence.skin = skin;
		self.observers.notify(&PresenceEvent::SkinChange { id, skin });
		Ok(())
	}

	fn leave(&mut self, id: IdentityId, owner: Option<ObserverId>) -> Result<LeaveOutcome, PlazaError> {
		let current = self.record_mut(id)?.owner;
		if let Some(owner) = owner
			&& current != owner
		{
			debug!(region = %self.region, %id, stale = %owner, %current, "ignoring leave from superseded connection");
			return Ok(LeaveOutcome::Superseded);
		}

		self.roster.remove(&id);
		let delivered = self.observers.notify(&PresenceEvent::Leave { id });
		debug!(region = %self.region, %id, delivered, "presence left");
		Ok(LeaveOutcome::Left)
	}
}

#[async_trait]
impl Actor for PresenceActor {
	type Key = RegionKey;
	type Message = PresenceMsg;

	const KIND: &'static str = "presence";

	async fn handle(&mut self, msg: PresenceMsg) {
		match msg {
			PresenceMsg::Subscribe { observer, reply } => {
				let _ = reply.send(self.observers.subscribe(observer));
			}
			PresenceMsg::Unsubscribe { observer, reply } => {
				self.observers.unsubscribe(observer);
				let _ = reply.send(Ok(()));
			}
			PresenceMsg::Join {
				presence,
				observer,
				reply,
			} => {
				let _ = reply.send(Ok(self.join(presence, observer)));
			}
			PresenceMsg::Move { id, position, reply } => {
				let _ = reply.send(self.move_to(id, position));
			}
			PresenceMsg::Rename { id, name, reply } => {
				let _ = reply.send(self.rename(id, name));
			}
			PresenceMsg::ChangeSkin { id, skin, reply } => {
				let _ = reply.send(self.change_skin(id, skin));
			}
			PresenceMsg::Leave { id, owner, reply } => {
				let _ = reply.send(self.leave(id, owner));
			}
			PresenceMsg::Roster { reply } => {
				let _ = reply.send(Ok(self.roster.values().map(|r| r.presence.clone()).collect()));
			}
		}
	}

	fn is_idle(&mut self) -> bool {
		self.roster.is_empty() && self.observers.prune() == 0
	}
}

impl ActorDirectory<PresenceActor> {
	pub async fn subscribe(
		&self,
		region: RegionKey,
		scope: &CallScope,
		observer: ObserverHandle<PresenceEvent>,
	) -> Result<(), PlazaError> {
		self.ask(region, scope, |reply| PresenceMsg::Subscribe {
			observer: observer.clone(),
			reply,
		})
		.await
	}

	pub async fn unsubscribe(&self, region: RegionKey, scope: &CallScope, observer: ObserverId) -> Result<(), PlazaError> {
		self.ask(region, scope, |reply| PresenceMsg::Unsubscribe { observer, reply })
			.await
	}

	pub async fn join(
		&self,
		region: RegionKey,
		scope: &CallScope,
		presence: Presence,
		observer: ObserverId,
	) -> Result<JoinOutcome, PlazaError> {
		self.ask(region, scope, |reply| PresenceMsg::Join {
			presence: presence.clone(),
			observer,
			reply,
		})
		.await
	}

	pub async fn move_to(
		&self,
		region: RegionKey,
		scope: &CallScope,
		id: IdentityId,
		position: Position,
	) -> Result<(), PlazaError> {
		self.ask(region, scope, |reply| PresenceMsg::Move { id, position, reply })
			.await
	}

	pub async fn rename(
		&self,
		region: RegionKey,
		scope: &CallScope,
		id: IdentityId,
		name: DisplayName,
	) -> Result<(), PlazaError> {
		self.ask(region, scope, |reply| PresenceMsg::Rename {
			id,
			name: name.clone(),
			reply,
		})
		.await
	}

	pub async fn change_skin(&self, region: RegionKey, scope: &CallScope, id: IdentityId, skin: u32) -> Result<(), PlazaError> {
		self.ask(region, scope, |reply| PresenceMsg::ChangeSkin { id, skin, reply })
			.await
	}

	pub async fn leave(
		&self,
		region: RegionKey,
		scope: &CallScope,
		id: IdentityId,
		owner: Option<ObserverId>,
	) -> Result<LeaveOutcome, PlazaError> {
		self.ask(region, scope, |reply| PresenceMsg::Leave { id, owner, reply })
			.await
	}

	pub async fn roster(&self, region: RegionKey, scope: &CallScope) -> Result<Vec<Presence>, PlazaError> {
		self.ask(region, scope, |reply| PresenceMsg::Roster { reply }).await
	}
}
