#![forbid(unsafe_code)]

use std::time::Duration;

use anyhow::{Context, anyhow};
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use plaza_domain::{IdentityId, PlazaError};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::debug;

use crate::util::time::unix_secs_now;

/// Default session lifetime.
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(600);

/// Pass/fail check for session tokens, plus issuance at login.
pub trait SessionGate: Send + Sync {
	fn issue(&self, id: IdentityId) -> Result<String, PlazaError>;

	fn validate(&self, token: &str) -> Result<IdentityId, PlazaError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionClaims {
	pub sub: String,
	pub exp: u64,
}

/// Stateless `v1.<payload>.<signature>` tokens signed with HMAC-SHA256.
#[derive(Clone)]
pub struct HmacSessionGate {
	secret: Vec<u8>,
	ttl: Duration,
}

impl HmacSessionGate {
	pub fn new(secret: impl Into<Vec<u8>>, ttl: Duration) -> Self {
		Self {
			secret: secret.into(),
			ttl,
		}
	}

	/// Per-process secret; tokens stop validating after a restart.
	pub fn with_random_secret(ttl: Duration) -> Self {
		let mut secret = Vec::with_capacity(32);
		secret.extend_from_slice(uuid::Uuid::new_v4().as_bytes());
		secret.extend_from_slice(uuid::Uuid::new_v4().as_bytes());
		Self::new(secret, ttl)
	}

	pub fn ttl(&self) -> Duration {
		self.ttl
	}

	/// Sign arbitrary claims. Exposed so tests can mint expired or foreign tokens.
	pub fn sign_claims(&self, claims: &SessionClaims) -> anyhow::Result<String> {
		let payload = serde_json::to_vec(claims).context("encode token claims")?;
		let payload_b64 = URL_SAFE_NO_PAD.encode(payload);
		let sig = sign(payload_b64.as_bytes(), &self.secret)?;
		Ok(format!("v1.{payload_b64}.{}", URL_SAFE_NO_PAD.encode(sig)))
	}
}

impl SessionGate for HmacSessionGate {
	fn issue(&self, id: IdentityId) -> Result<String, PlazaError> {
		let claims = SessionClaims {
			sub: id.to_string(),
			exp: unix_secs_now() + self.ttl.as_secs(),
		};
		self.sign_claims(&claims).map_err(PlazaError::internal)
	}

	fn validate(&self, token: &str) -> Result<IdentityId, PlazaError> {
		let claims = verify_hmac_token(token, &self.secret).map_err(|e| {
			debug!(error = %e, "session token rejected");
			PlazaError::Unauthenticated(e.to_string())
		})?;
		claims
			.sub
			.parse()
			.map_err(|e| PlazaError::Unauthenticated(format!("token subject: {e}")))
	}
}

pub fn verify_hmac_token(token: &str, secret: &[u8]) -> anyhow::Result<SessionClaims> {
	let parts = token.split('.').collect::<Vec<_>>();
	if parts.len() != 3 || parts[0] != "v1" {
		return Err(anyhow!("invalid token format"));
	}

	let payload_b64 = parts[1];
	let sig_b64 = parts[2];

	let payload = URL_SAFE_NO_PAD.decode(payload_b64).context("decode token payload")?;
	let expected_sig = sign(payload_b64.as_bytes(), secret)?;
	let provided_sig = URL_SAFE_NO_PAD.decode(sig_b64).context("decode token signature")?;

	if !constant_time_eq(&expected_sig, &provided_sig) {
		return Err(anyhow!("invalid token signature"));
	}

	let claims: SessionClaims = serde_json::from_slice(&payload).context("parse token claims")?;
	if claims.exp <= unix_secs_now() {
		return Err(anyhow!("token expired"));
	}

	Ok(claims)
}

fn sign(payload_b64: &[u8], secret: &[u8]) -> anyhow::Result<Vec<u8>> {
	let mut mac = Hmac::<Sha256>::new_from_slice(secret).map_err(|e| anyhow!("hmac key: {e}"))?;
	mac.update(payload_b64);
	Ok(mac.finalize().into_bytes().to_vec())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
	if a.len() != b.len() {
		return false;
	}

	let mut diff = 0u8;
	for (x, y) in a.iter().zip(b.iter()) {
		diff |= x ^ y;
	}

	diff == 0
}
