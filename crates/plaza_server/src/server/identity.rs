#![forbid(unsafe_code)]

use std::sync::Arc;

use async_trait::async_trait;
use plaza_domain::{DisplayName, EchoData, Identity, IdentityId, PlazaError, Position, Skin};
use tracing::{debug, warn};

use crate::server::actor::{Actor, ActorDirectory, CallScope, Reply};
use crate::server::repository::IdentityRepository;
use crate::util::time::unix_ms_now;

pub type IdentityDirectory = ActorDirectory<IdentityActor>;

pub enum IdentityMsg {
	GetProfile {
		reply: Reply<Identity>,
	},
	SetPosition {
		position: Position,
		reply: Reply<Identity>,
	},
	Rename {
		name: DisplayName,
		reply: Reply<Identity>,
	},
	ChangeSkin {
		skin: u32,
		reply: Reply<Identity>,
	},
	Touch {
		at_unix_ms: i64,
		reply: Reply<Identity>,
	},
	Echo {
		client_time_unix_ms: i64,
		gateway_time_unix_ms: i64,
		reply: Reply<EchoData>,
	},
}

/// Durable profile of one identity. Reads are served from a projection loaded
/// on first use; every mutation goes through the repository first.
pub struct IdentityActor {
	id: IdentityId,
	repo: Arc<dyn IdentityRepository>,
	cached: Option<Identity>,
}

fn storage_error(id: IdentityId, err: anyhow::Error) -> PlazaError {
	warn!(%id, error = ?err, "identity repository failed");
	PlazaError::internal(format!("identity storage: {err}"))
}

impl IdentityActor {
	pub fn new(id: IdentityId, repo: Arc<dyn IdentityRepository>) -> Self {
		Self { id, repo, cached: None }
	}

	async fn profile(&mut self) -> Result<Identity, PlazaError> {
		if let Some(identity) = &self.cached {
			return Ok(identity.clone());
		}

		let identity = self
			.repo
			.get_identity(self.id)
			.await
			.map_err(|e| storage_error(self.id, e))?
			.ok_or_else(|| PlazaError::not_found(format!("identity {}", self.id)))?;
		debug!(id = %self.id, "loaded identity projection");
		self.cached = Some(identity.clone());
		Ok(identity)
	}

	/// Store the repository's answer for a mutation. `None` means the identity is gone.
	fn apply(&mut self, updated: anyhow::Result<Option<Identity>>) -> Result<Identity, PlazaError> {
		match updated.map_err(|e| storage_error(self.id, e))? {
			Some(identity) => {
				self.cached = Some(identity.clone());
				Ok(identity)
			}
			None => {
				self.cached = None;
				Err(PlazaError::not_found(format!("identity {}", self.id)))
			}
		}
	}

	async fn set_position(&mut self, position: Position) -> Result<Identity, PlazaError> {
		let updated = self.repo.update_position(self.id, position).await;
		self.apply(updated)
	}

	async fn rename(&mut self, name: DisplayName) -> Result<Identity, PlazaError> {
		let updated = self.repo.update_name(self.id, &name).await;
		self.apply(updated)
	}

	async fn change_skin(&mut self, skin: u32) -> Result<Identity, PlazaError> {
		let skin = Skin::new(skin)?;
		let updated = self.repo.update_skin(self.id, skin).await;
		self.apply(updated)
	}

	async fn touch(&mut self, at_unix_ms: i64) -> Result<Identity, PlazaError> {
		let updated = self.repo.touch_last_seen(self.id, at_unix_ms).await;
		self.apply(updated)
	}
}

fn echo(client_time_unix_ms: i64, gateway_time_unix_ms: i64) -> EchoData {
	let now = unix_ms_now();
	EchoData {
		client_to_gateway_ms: gateway_time_unix_ms - client_time_unix_ms,
		gateway_to_actor_ms: now - gateway_time_unix_ms,
		actor_time_unix_ms: now,
	}
}

#[async_trait]
impl Actor for IdentityActor {
	type Key = IdentityId;
	type Message = IdentityMsg;

	const KIND: &'static str = "identity";

	async fn handle(&mut self, msg: IdentityMsg) {
		match msg {
			IdentityMsg::GetProfile { reply } => {
				let _ = reply.send(self.profile().await);
			}
			IdentityMsg::SetPosition { position, reply } => {
				let _ = reply.send(self.set_position(position).await);
			}
			IdentityMsg::Rename { name, reply } => {
				let _ = reply.send(self.rename(name).await);
			}
			IdentityMsg::ChangeSkin { skin, reply } => {
				let _ = reply.send(self.change_skin(skin).await);
			}
			IdentityMsg::Touch { at_unix_ms, reply } => {
				let _ = reply.send(self.touch(at_unix_ms).await);
			}
			IdentityMsg::Echo {
				client_time_unix_ms,
				gateway_time_unix_ms,
				reply,
			} => {
				let _ = reply.send(Ok(echo(client_time_unix_ms, gateway_time_unix_ms)));
			}
		}
	}

	// The projection can always be reloaded from the repository.
	fn is_idle(&mut self) -> bool {
		true
	}
}

impl ActorDirectory<IdentityActor> {
	pub async fn get_profile(&self, id: IdentityId, scope: &CallScope) -> Result<Identity, PlazaError> {
		self.ask(id, scope, |reply| IdentityMsg::GetProfile { reply }).await
	}

	pub async fn set_position(&self, id: IdentityId, scope: &CallScope, position: Position) -> Result<Identity, PlazaError> {
		self.ask(id, scope, |reply| IdentityMsg::SetPosition { position, reply })
			.await
	}

	pub async fn rename(&self, id: IdentityId, scope: &CallScope, name: DisplayName) -> Result<Identity, PlazaError> {
		self.ask(id, scope, |reply| IdentityMsg::Rename {
			name: name.clone(),
			reply,
		})
		.await
	}

	pub async fn change_skin(&self, id: IdentityId, scope: &CallScope, skin: u32) -> Result<Identity, PlazaError> {
		self.ask(id, scope, |reply| IdentityMsg::ChangeSkin { skin, reply }).await
	}

	pub async fn touch(&self, id: IdentityId, scope: &CallScope, at_unix_ms: i64) -> Result<Identity, PlazaError> {
		self.ask(id, scope, |reply| IdentityMsg::Touch { at_unix_ms, reply }).await
	}

	/// `gateway_time_unix_ms` is stamped by the caller when the request arrived.
	pub async fn echo(
		&self,
		id: IdentityId,
		scope: &CallScope,
		client_time_unix_ms: i64,
		gateway_time_unix_ms: i64,
	) -> Result<EchoData, PlazaError> {
		self.ask(id, scope, |reply| IdentityMsg::Echo {
			client_time_unix_ms,
			gateway_time_unix_ms,
			reply,
		})
		.await
	}
}
