#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Sender name used for server-authored chat lines.
pub const SYSTEM_SENDER: &str = "<system>";

/// Maximum display name length, in characters.
pub const MAX_DISPLAY_NAME_CHARS: usize = 32;

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("invalid format: {0}")]
	InvalidFormat(String),
}

/// Error taxonomy shared by actors, the session gate and the stream bridge.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PlazaError {
	/// The target has no record of the referenced id.
	#[error("not found: {0}")]
	NotFound(String),

	#[error("invalid argument: {0}")]
	InvalidArgument(String),

	/// Raised by the session gate only.
	#[error("unauthenticated: {0}")]
	Unauthenticated(String),

	/// The calling connection was torn down or the call timed out.
	#[error("cancelled")]
	Cancelled,

	/// Repository or storage failure.
	#[error("internal error: {0}")]
	Internal(String),
}

impl PlazaError {
	/// Stable code written into wire error replies.
	pub const fn code(&self) -> &'static str {
		match self {
			PlazaError::NotFound(_) => "NOT_FOUND",
			PlazaError::InvalidArgument(_) => "INVALID_ARGUMENT",
			PlazaError::Unauthenticated(_) => "UNAUTHENTICATED",
			PlazaError::Cancelled => "CANCELLED",
			PlazaError::Internal(_) => "INTERNAL",
		}
	}

	pub fn not_found(what: impl fmt::Display) -> Self {
		PlazaError::NotFound(what.to_string())
	}

	pub fn internal(err: impl fmt::Display) -> Self {
		PlazaError::Internal(err.to_string())
	}
}

/// Durable identity identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentityId(uuid::Uuid);

impl IdentityId {
	/// Create a new random identity id.
	pub fn new_v4() -> Self {
		Self(uuid::Uuid::new_v4())
	}

	pub const fn from_uuid(id: uuid::Uuid) -> Self {
		Self(id)
	}

	pub const fn as_uuid(&self) -> &uuid::Uuid {
		&self.0
	}
}

impl fmt::Display for IdentityId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0.simple())
	}
}

impl FromStr for IdentityId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}
		uuid::Uuid::parse_str(s)
			.map(Self)
			.map_err(|e| ParseIdError::InvalidFormat(e.to_string()))
	}
}

/// Key of a spatial region (one presence actor per key).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RegionKey(pub u64);

impl fmt::Display for RegionKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "region:{}", self.0)
	}
}

/// Key of a chat room (one chat actor per key).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChatRoomKey(pub u64);

impl fmt::Display for ChatRoomKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "chat:{}", self.0)
	}
}

/// Character appearance code. Only `1..=2` is valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Skin(u8);

impl Skin {
	pub const MIN: u8 = 1;
	pub const MAX: u8 = 2;

	pub fn new(code: u32) -> Result<Self, PlazaError> {
		if code >= u32::from(Self::MIN) && code <= u32::from(Self::MAX) {
			Ok(Self(code as u8))
		} else {
			Err(PlazaError::InvalidArgument(format!(
				"skin {code} outside {}..={}",
				Self::MIN,
				Self::MAX
			)))
		}
	}

	pub const fn get(self) -> u8 {
		self.0
	}
}

impl Default for Skin {
	fn default() -> Self {
		Self(Self::MIN)
	}
}

impl fmt::Display for Skin {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// Non-blank display name, trimmed on construction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DisplayName(String);

impl DisplayName {
	pub fn new(name: impl Into<String>) -> Result<Self, PlazaError> {
		let name = name.into();
		let trimmed = name.trim();
		if trimmed.is_empty() {
			return Err(PlazaError::InvalidArgument("display name is blank".to_string()));
		}
		if trimmed.chars().count() > MAX_DISPLAY_NAME_CHARS {
			return Err(PlazaError::InvalidArgument(format!(
				"display name longer than {MAX_DISPLAY_NAME_CHARS} characters"
			)));
		}
		Ok(Self(trimmed.to_string()))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}

	pub fn into_string(self) -> String {
		self.0
	}
}

impl fmt::Display for DisplayName {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for DisplayName {
	type Err = PlazaError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		DisplayName::new(s)
	}
}

/// Position inside a region.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
	pub x: f32,
	pub y: f32,
}

impl Position {
	pub const ORIGIN: Position = Position { x: 0.0, y: 0.0 };

	pub fn new(x: f32, y: f32) -> Result<Self, PlazaError> {
		if !x.is_finite() || !y.is_finite() {
			return Err(PlazaError::InvalidArgument(format!("non-finite position ({x}, {y})")));
		}
		Ok(Self { x, y })
	}
}

/// Durable profile of a user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
	pub id: IdentityId,
	pub account: String,
	pub display_name: DisplayName,
	pub skin: Skin,
	pub position: Position,
	pub last_seen_unix_ms: i64,
}

/// Ephemeral, region-scoped record of a joined identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Presence {
	pub id: IdentityId,
	pub display_name: DisplayName,
	pub skin: Skin,
	pub position: Position,
}

impl From<&Identity> for Presence {
	fn from(identity: &Identity) -> Self {
		Self {
			id: identity.id,
			display_name: identity.display_name.clone(),
			skin: identity.skin,
			position: identity.position,
		}
	}
}

/// Incremental change broadcast by a presence actor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PresenceEvent {
	Join(Presence),
	Move { id: IdentityId, position: Position },
	Rename { id: IdentityId, name: DisplayName },
	SkinChange { id: IdentityId, skin: Skin },
	Leave { id: IdentityId },
}

impl PresenceEvent {
	/// Identity affected by the event.
	pub fn id(&self) -> IdentityId {
		match self {
			PresenceEvent::Join(p) => p.id,
			PresenceEvent::Move { id, .. }
			| PresenceEvent::Rename { id, .. }
			| PresenceEvent::SkinChange { id, .. }
			| PresenceEvent::Leave { id } => *id,
		}
	}

	/// Stable string identifier, for logs and metrics.
	pub const fn kind(&self) -> &'static str {
		match self {
			PresenceEvent::Join(_) => "join",
			PresenceEvent::Move { .. } => "move",
			PresenceEvent::Rename { .. } => "rename",
			PresenceEvent::SkinChange { .. } => "skin_change",
			PresenceEvent::Leave { .. } => "leave",
		}
	}
}

/// One chat history entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatLine {
	pub sender: String,
	pub text: String,
}

impl ChatLine {
	pub fn new(sender: impl Into<String>, text: impl Into<String>) -> Self {
		Self {
			sender: sender.into(),
			text: text.into(),
		}
	}

	/// Departure notice authored by [`SYSTEM_SENDER`].
	pub fn departure(name: &DisplayName) -> Self {
		Self::new(SYSTEM_SENDER, format!("{name} left."))
	}

	pub fn is_system(&self) -> bool {
		self.sender == SYSTEM_SENDER
	}
}

/// Latency components measured by an echo round trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EchoData {
	pub client_to_gateway_ms: i64,
	pub gateway_to_actor_ms: i64,
	pub actor_time_unix_ms: i64,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn identity_id_parse_and_display() {
		let id = IdentityId::new_v4();
		let shown = id.to_string();
		assert_eq!(shown.len(), 32);
		assert_eq!(shown.parse::<IdentityId>().unwrap(), id);

		let hyphenated = id.as_uuid().hyphenated().to_string();
		assert_eq!(hyphenated.parse::<IdentityId>().unwrap(), id);
		assert_eq!("".parse::<IdentityId>(), Err(ParseIdError::Empty));
		assert!("not-a-uuid".parse::<IdentityId>().is_err());
	}

	#[test]
	fn skin_range_is_closed() {
		assert!(Skin::new(0).is_err());
		assert_eq!(Skin::new(1).unwrap().get(), 1);
		assert_eq!(Skin::new(2).unwrap().get(), 2);
		assert!(matches!(Skin::new(3), Err(PlazaError::InvalidArgument(_))));
		assert_eq!(Skin::default().get(), 1);
	}

	#[test]
	fn display_name_rejects_blank_and_trims() {
		assert!(matches!(DisplayName::new("   "), Err(PlazaError::InvalidArgument(_))));
		assert_eq!(DisplayName::new("  bob ").unwrap().as_str(), "bob");
		assert!(DisplayName::new("x".repeat(MAX_DISPLAY_NAME_CHARS + 1)).is_err());
	}

	#[test]
	fn departure_notice_is_system_authored() {
		let line = ChatLine::departure(&DisplayName::new("alice").unwrap());
		assert!(line.is_system());
		assert_eq!(line.text, "alice left.");
	}

	#[test]
	fn position_rejects_non_finite() {
		assert!(Position::new(f32::NAN, 0.0).is_err());
		assert_eq!(Position::new(1.0, 2.0).unwrap(), Position { x: 1.0, y: 2.0 });
	}

	#[test]
	fn error_codes_are_stable() {
		assert_eq!(PlazaError::not_found("x").code(), "NOT_FOUND");
		assert_eq!(PlazaError::Cancelled.code(), "CANCELLED");
		assert_eq!(PlazaError::internal("db").code(), "INTERNAL");
	}
}
