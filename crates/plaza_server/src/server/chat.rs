#![forbid(unsafe_code)]

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use plaza_domain::{ChatLine, ChatRoomKey, DisplayName, IdentityId, PlazaError};
use tracing::debug;

use crate::server::actor::{Actor, ActorDirectory, CallScope, LeaveOutcome, Reply};
use crate::server::observer::{ObserverHandle, ObserverId, ObserverRegistry};

pub type ChatDirectory = ActorDirectory<ChatActor>;

/// Default number of lines a room keeps.
pub const DEFAULT_HISTORY_CAPACITY: usize = 240;

/// Longest accepted chat line, in characters.
pub const MAX_CHAT_TEXT_CHARS: usize = 512;

pub enum ChatMsg {
	Subscribe {
		observer: ObserverHandle<ChatLine>,
		reply: Reply<()>,
	},
	Unsubscribe {
		observer: ObserverId,
		reply: Reply<()>,
	},
	Join {
		id: IdentityId,
		name: DisplayName,
		observer: ObserverId,
		reply: Reply<()>,
	},
	Rename {
		id: IdentityId,
		name: DisplayName,
		reply: Reply<()>,
	},
	Chat {
		id: IdentityId,
		text: String,
		reply: Reply<()>,
	},
	Leave {
		id: IdentityId,
		owner: Option<ObserverId>,
		reply: Reply<LeaveOutcome>,
	},
	History {
		reply: Reply<Vec<ChatLine>>,
	},
}

struct Participant {
	name: DisplayName,
	owner: ObserverId,
}

/// One chat room: participants plus a bounded history.
pub struct ChatActor {
	room: ChatRoomKey,
	capacity: usize,
	participants: HashMap<IdentityId, Participant>,
	history: VecDeque<ChatLine>,
	observers: ObserverRegistry<ChatLine>,
}

impl ChatActor {
	pub fn new(room: ChatRoomKey, capacity: usize, observer_ttl: Duration) -> Self {
		let capacity = capacity.max(1);
		Self {
			room,
			capacity,
			participants: HashMap::new(),
			history: VecDeque::with_capacity(capacity),
			observers: ObserverRegistry::new("chat", observer_ttl),
		}
	}

	fn join(&mut self, id: IdentityId, name: DisplayName, observer: ObserverId) {
		self.participants.insert(id, Participant { name, owner: observer });

		// Only the joining observer gets the backlog.
		for line in &self.history {
			if !self.observers.send_to(observer, line.clone()) {
				break;
			}
		}
		debug!(room = %self.room, %id, %observer, replayed = self.history.len(), "chat participant joined");
	}

	fn participant_mut(&mut self, id: IdentityId) -> Result<&mut Participant, PlazaError> {
		self.participants
			.get_mut(&id)
			.ok_or_else(|| PlazaError::not_found(format!("{id} is not in {}", self.room)))
	}

	fn rename(&mut self, id: IdentityId, name: DisplayName) -> Result<(), PlazaError> {
		self.participant_mut(id)?.name = name;
		Ok(())
	}

	fn chat(&mut self, id: IdentityId, text: String) -> Result<(), PlazaError> {
		let sender = self.participant_mut(id)?.name.to_string();
		if text.trim().is_empty() {
			return Err(PlazaError::InvalidArgument("chat text is blank".to_string()));
		}
		if text.chars().count() > MAX_CHAT_TEXT_CHARS {
			return Err(PlazaError::InvalidArgument(format!(
				"chat text longer than {MAX_CHAT_TEXT_CHARS} characters"
			)));
		}

		let line = ChatLine::new(sender, text);
		self.push_history(line.clone());
		self.observers.notify(&line);
		Ok(())
	}

	fn push_history(&mut self, line: ChatLine) {
		while self.history.len() >= self.capacity {
			self.history.pop_front();
		}
		self.history.push_back(line);
	}

	fn leave(&mut self, id: IdentityId, owner: Option<ObserverId>) -> Result<LeaveOutcome, PlazaError> {
		let current = self.participant_mut(id)?.owner;
		if let Some(owner) = owner
			&& current != owner
		{
			debug!(room = %self.room, %id, stale = %owner, %current, "ignoring leave from superseded connection");
			return Ok(LeaveOutcome::Superseded);
		}

		let Some(participant) = self.participants.remove(&id) else {
			return Err(PlazaError::not_found(id));
		};

		// Departure notices are broadcast but never kept in history.
		let delivered = self.observers.notify(&ChatLine::departure(&participant.name));
		debug!(room = %self.room, %id, delivered, "chat participant left");
		Ok(LeaveOutcome::Left)
	}
}

#[async_trait]
impl Actor for ChatActor {
	type Key = ChatRoomKey;
	type Message = ChatMsg;

	const KIND: &'static str = "chat";

	async fn handle(&mut self, msg: ChatMsg) {
		match msg {
			ChatMsg::Subscribe { observer, reply } => {
				let _ = reply.send(self.observers.subscribe(observer));
			}
			ChatMsg::Unsubscribe { observer, reply } => {
				self.observers.unsubscribe(observer);
				let _ = reply.send(Ok(()));
			}
			ChatMsg::Join {
				id,
				name,
				observer,
				reply,
			} => {
				self.join(id, name, observer);
				let _ = reply.send(Ok(()));
			}
			ChatMsg::Rename { id, name, reply } => {
				let _ = reply.send(self.rename(id, name));
			}
			ChatMsg::Chat { id, text, reply } => {
				let _ = reply.send(self.chat(id, text));
			}
			ChatMsg::Leave { id, owner, reply } => {
				let _ = reply.send(self.leave(id, owner));
			}
			ChatMsg::History { reply } => {
				let _ = reply.send(Ok(self.history.iter().cloned().collect()));
			}
		}
	}

	fn is_idle(&mut self) -> bool {
		self.participants.is_empty() && self.observers.prune() == 0
	}
}

impl ActorDirectory<ChatActor> {
	pub async fn subscribe(&self, room: ChatRoomKey, scope: &CallScope, observer: ObserverHandle<ChatLine>) -> Result<(), PlazaError> {
		self.ask(room, scope, |reply| ChatMsg::Subscribe {
			observer: observer.clone(),
			reply,
		})
		.await
	}

	pub async fn unsubscribe(&self, room: ChatRoomKey, scope: &CallScope, observer: ObserverId) -> Result<(), PlazaError> {
		self.ask(room, scope, |reply| ChatMsg::Unsubscribe { observer, reply }).await
	}

	pub async fn join(
		&self,
		room: ChatRoomKey,
		scope: &CallScope,
		id: IdentityId,
		name: DisplayName,
		observer: ObserverId,
	) -> Result<(), PlazaError> {
		self.ask(room, scope, |reply| ChatMsg::Join {
			id,
			name: name.clone(),
			observer,
			reply,
		})
		.await
	}

	pub async fn rename(&self, room: ChatRoomKey, scope: &CallScope, id: IdentityId, name: DisplayName) -> Result<(), PlazaError> {
		self.ask(room, scope, |reply| ChatMsg::Rename {
			id,
			name: name.clone(),
			reply,
		})
		.await
	}

	pub async fn chat(&self, room: ChatRoomKey, scope: &CallScope, id: IdentityId, text: String) -> Result<(), PlazaError> {
		self.ask(room, scope, |reply| ChatMsg::Chat {
			id,
			text: text.clone(),
			reply,
		})
		.await
	}

	pub async fn leave(
		&self,
		room: ChatRoomKey,
		scope: &CallScope,
		id: IdentityId,
		owner: Option<ObserverId>,
	) -> Result<LeaveOutcome, PlazaError> {
		self.ask(room, scope, |reply| ChatMsg::Leave { id, owner, reply }).await
	}

	pub async fn history(&self, room: ChatRoomKey, scope: &CallScope) -> Result<Vec<ChatLine>, PlazaError> {
		self.ask(room, scope, |reply| ChatMsg::History { reply }).await
	}
}
