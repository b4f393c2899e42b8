#![forbid(unsafe_code)]

use std::sync::Arc;

use plaza_domain::{DisplayName, Identity, MAX_DISPLAY_NAME_CHARS, PlazaError};
use tracing::{debug, info, warn};

use crate::server::actor::CallScope;
use crate::server::auth::SessionGate;
use crate::server::identity::IdentityDirectory;
use crate::server::repository::IdentityRepository;
use crate::util::time::unix_ms_now;

/// Longest accepted account name, in characters.
pub const MAX_ACCOUNT_CHARS: usize = 64;

#[derive(Debug, Clone)]
pub struct LoginData {
	pub identity: Identity,
	pub session_token: String,
}

/// Account lookup/creation and session issuance.
#[derive(Clone)]
pub struct Lobby {
	repo: Arc<dyn IdentityRepository>,
	identities: IdentityDirectory,
	gate: Arc<dyn SessionGate>,
}

impl Lobby {
	pub fn new(repo: Arc<dyn IdentityRepository>, identities: IdentityDirectory, gate: Arc<dyn SessionGate>) -> Self {
		Self { repo, identities, gate }
	}

	pub async fn login(&self, account: &str, scope: &CallScope) -> Result<LoginData, PlazaError> {
		let account = account.trim();
		if account.is_empty() {
			return Err(PlazaError::InvalidArgument("account is blank".to_string()));
		}
		if account.chars().count() > MAX_ACCOUNT_CHARS {
			return Err(PlazaError::InvalidArgument(format!(
				"account longer than {MAX_ACCOUNT_CHARS} characters"
			)));
		}

		let existing = scope
			.run(self.repo.get_by_account(account))
			.await?
			.map_err(PlazaError::internal)?;
		let identity = match existing {
			Some(identity) => identity,
			None => self.create(account, scope).await?,
		};

		// Goes through the actor so a live projection sees the new last_seen.
		let identity = self.identities.touch(identity.id, scope, unix_ms_now()).await?;
		let session_token = self.gate.issue(identity.id)?;
		info!(id = %identity.id, account, "login");

		Ok(LoginData { identity, session_token })
	}

	async fn create(&self, account: &str, scope: &CallScope) -> Result<Identity, PlazaError> {
		let name = guest_name(account)?;
		match scope.run(self.repo.create_identity(account, name)).await? {
			Ok(identity) => {
				info!(id = %identity.id, account, "created identity");
				Ok(identity)
			}
			Err(err) => {
				// A concurrent login may have created the account first.
				debug!(account, error = ?err, "create failed, retrying lookup");
				match scope.run(self.repo.get_by_account(account)).await? {
					Ok(Some(identity)) => Ok(identity),
					Ok(None) => {
						warn!(account, error = ?err, "identity create failed");
						Err(PlazaError::internal(err))
					}
					Err(lookup) => Err(PlazaError::internal(lookup)),
				}
			}
		}
	}
}

/// Default display name for a new account, clipped to the display name limit.
pub fn guest_name(account: &str) -> Result<DisplayName, PlazaError> {
	let name: String = format!("Guest-{account}").chars().take(MAX_DISPLAY_NAME_CHARS).collect();
	DisplayName::new(name)
}
