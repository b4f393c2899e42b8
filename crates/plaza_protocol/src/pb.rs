//! Wire messages for `plaza.v1`.
//!
//! Declared directly with prost derives; the field tags are the wire contract.

#![forbid(unsafe_code)]

/// Top-level frame payload. Replies echo the request's `request_id`; pushed
/// events carry an empty one.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Envelope {
	#[prost(uint32, tag = "1")]
	pub version: u32,
	#[prost(string, tag = "2")]
	pub request_id: String,
	#[prost(
		oneof = "envelope::Msg",
		tags = "10, 11, 12, 13, 14, 15, 16, 17, 30, 31, 32, 33, 34, 35, 36"
	)]
	pub msg: Option<envelope::Msg>,
}

pub mod envelope {
	#[derive(Clone, PartialEq, ::prost::Oneof)]
	pub enum Msg {
		// client -> server
		#[prost(message, tag = "10")]
		Login(super::Login),
		#[prost(message, tag = "11")]
		Hello(super::Hello),
		#[prost(message, tag = "12")]
		Move(super::Move),
		#[prost(message, tag = "13")]
		Rename(super::Rename),
		#[prost(message, tag = "14")]
		ChangeSkin(super::ChangeSkin),
		#[prost(message, tag = "15")]
		ChatSend(super::ChatSend),
		#[prost(message, tag = "16")]
		Echo(super::Echo),
		#[prost(message, tag = "17")]
		Disconnect(super::Disconnect),

		// server -> client
		#[prost(message, tag = "30")]
		Welcome(super::Welcome),
		#[prost(message, tag = "31")]
		LoginResult(super::LoginResult),
		#[prost(message, tag = "32")]
		Ack(super::Ack),
		#[prost(message, tag = "33")]
		Error(super::Error),
		#[prost(message, tag = "34")]
		EchoResult(super::EchoResult),
		#[prost(message, tag = "35")]
		Presence(super::PresenceEvent),
		#[prost(message, tag = "36")]
		Chat(super::ChatEvent),
	}
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Login {
	#[prost(string, tag = "1")]
	pub account: String,
}

/// Join-or-refresh. The first hello on a stream joins; later ones only refresh subscriptions.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Hello {
	#[prost(string, tag = "1")]
	pub identity_id: String,
	#[prost(string, tag = "2")]
	pub session_token: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Move {
	#[prost(float, tag = "1")]
	pub x: f32,
	#[prost(float, tag = "2")]
	pub y: f32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Rename {
	#[prost(string, tag = "1")]
	pub new_name: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ChangeSkin {
	#[prost(uint32, tag = "1")]
	pub new_skin: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ChatSend {
	#[prost(string, tag = "1")]
	pub text: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Echo {
	#[prost(int64, tag = "1")]
	pub client_time_unix_ms: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Disconnect {}

/// Character as seen by other members of a region. Also used as the caller's profile.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Character {
	#[prost(string, tag = "1")]
	pub id: String,
	#[prost(string, tag = "2")]
	pub name: String,
	#[prost(uint32, tag = "3")]
	pub skin: u32,
	#[prost(float, tag = "4")]
	pub x: f32,
	#[prost(float, tag = "5")]
	pub y: f32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Welcome {
	#[prost(string, tag = "1")]
	pub server_name: String,
	#[prost(int64, tag = "2")]
	pub server_time_unix_ms: i64,
	#[prost(uint32, tag = "3")]
	pub max_frame_bytes: u32,
	#[prost(message, optional, tag = "4")]
	pub profile: Option<Character>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LoginResult {
	#[prost(message, optional, tag = "1")]
	pub profile: Option<Character>,
	#[prost(string, tag = "2")]
	pub session_token: String,
	#[prost(int64, tag = "3")]
	pub server_time_unix_ms: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Ack {
	#[prost(message, optional, tag = "1")]
	pub profile: Option<Character>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Error {
	#[prost(string, tag = "1")]
	pub code: String,
	#[prost(string, tag = "2")]
	pub message: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct EchoResult {
	#[prost(int64, tag = "1")]
	pub client_to_gateway_ms: i64,
	#[prost(int64, tag = "2")]
	pub gateway_to_actor_ms: i64,
	#[prost(int64, tag = "3")]
	pub actor_to_gateway_ms: i64,
	#[prost(int64, tag = "4")]
	pub actor_time_unix_ms: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PresenceEvent {
	#[prost(oneof = "presence_event::Event", tags = "1, 2, 3, 4, 5")]
	pub event: Option<presence_event::Event>,
}

pub mod presence_event {
	#[derive(Clone, PartialEq, ::prost::Oneof)]
	pub enum Event {
		#[prost(message, tag = "1")]
		Join(super::Character),
		#[prost(message, tag = "2")]
		Move(super::CharacterMoved),
		#[prost(message, tag = "3")]
		Rename(super::CharacterRenamed),
		#[prost(message, tag = "4")]
		SkinChange(super::CharacterSkinChanged),
		#[prost(message, tag = "5")]
		Leave(super::CharacterLeft),
	}
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CharacterMoved {
	#[prost(string, tag = "1")]
	pub id: String,
	#[prost(float, tag = "2")]
	pub x: f32,
	#[prost(float, tag = "3")]
	pub y: f32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CharacterRenamed {
	#[prost(string, tag = "1")]
	pub id: String,
	#[prost(string, tag = "2")]
	pub name: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CharacterSkinChanged {
	#[prost(string, tag = "1")]
	pub id: String,
	#[prost(uint32, tag = "2")]
	pub skin: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CharacterLeft {
	#[prost(string, tag = "1")]
	pub id: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ChatEvent {
	#[prost(string, tag = "1")]
	pub sender: String,
	#[prost(string, tag = "2")]
	pub text: String,
}
