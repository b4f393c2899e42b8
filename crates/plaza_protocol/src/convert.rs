#![forbid(unsafe_code)]

use plaza_domain::{ChatLine, EchoData, Identity, PlazaError, Presence, PresenceEvent};

use crate::pb;

impl From<&Presence> for pb::Character {
	fn from(p: &Presence) -> Self {
		Self {
			id: p.id.to_string(),
			name: p.display_name.to_string(),
			skin: u32::from(p.skin.get()),
			x: p.position.x,
			y: p.position.y,
		}
	}
}

impl From<&Identity> for pb::Character {
	fn from(identity: &Identity) -> Self {
		pb::Character::from(&Presence::from(identity))
	}
}

impl From<&PresenceEvent> for pb::PresenceEvent {
	fn from(ev: &PresenceEvent) -> Self {
		use pb::presence_event::Event;

		let event = match ev {
			PresenceEvent::Join(p) => Event::Join(p.into()),
			PresenceEvent::Move { id, position } => Event::Move(pb::CharacterMoved {
				id: id.to_string(),
				x: position.x,
				y: position.y,
			}),
			PresenceEvent::Rename { id, name } => Event::Rename(pb::CharacterRenamed {
				id: id.to_string(),
				name: name.to_string(),
			}),
			PresenceEvent::SkinChange { id, skin } => Event::SkinChange(pb::CharacterSkinChanged {
				id: id.to_string(),
				skin: u32::from(skin.get()),
			}),
			PresenceEvent::Leave { id } => Event::Leave(pb::CharacterLeft { id: id.to_string() }),
		};

		Self { event: Some(event) }
	}
}

impl From<&ChatLine> for pb::ChatEvent {
	fn from(line: &ChatLine) -> Self {
		Self {
			sender: line.sender.clone(),
			text: line.text.clone(),
		}
	}
}

impl From<&PlazaError> for pb::Error {
	fn from(err: &PlazaError) -> Self {
		Self {
			code: err.code().to_string(),
			message: err.to_string(),
		}
	}
}

/// Build the echo reply. `actor_to_gateway_ms` is measured by the caller on return.
pub fn echo_result(data: &EchoData, actor_to_gateway_ms: i64) -> pb::EchoResult {
	pb::EchoResult {
		client_to_gateway_ms: data.client_to_gateway_ms,
		gateway_to_actor_ms: data.gateway_to_actor_ms,
		actor_to_gateway_ms,
		actor_time_unix_ms: data.actor_time_unix_ms,
	}
}
