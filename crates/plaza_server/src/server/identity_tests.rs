#![forbid(unsafe_code)]

use plaza_domain::{DisplayName, IdentityId, MAX_DISPLAY_NAME_CHARS, PlazaError, Position};

use crate::server::lobby::{MAX_ACCOUNT_CHARS, guest_name};
use crate::server::repository::IdentityRepository as _;
use crate::server::test_support::{identity, scope, test_state};

#[tokio::test]
async fn login_creates_identity_once_and_issues_token() {
	let (state, repo) = test_state();

	let first = state.lobby.login("  ana  ", &scope()).await.expect("first login");
	assert_eq!(first.identity.account, "ana");
	assert_eq!(first.identity.display_name.as_str(), "Guest-ana");
	assert!(first.identity.last_seen_unix_ms > 0);
	assert_eq!(state.gate.validate(&first.session_token).expect("token"), first.identity.id);

	let second = state.lobby.login("ana", &scope()).await.expect("second login");
	assert_eq!(second.identity.id, first.identity.id);

	let stored = repo.get_by_account("ana").await.expect("lookup").expect("stored");
	assert_eq!(stored.id, first.identity.id);
}

#[tokio::test]
async fn login_rejects_blank_and_long_accounts() {
	let (state, _repo) = test_state();

	let err = state.lobby.login("   ", &scope()).await.unwrap_err();
	assert!(matches!(err, PlazaError::InvalidArgument(_)));

	let long = "a".repeat(MAX_ACCOUNT_CHARS + 1);
	let err = state.lobby.login(&long, &scope()).await.unwrap_err();
	assert!(matches!(err, PlazaError::InvalidArgument(_)));
}

#[tokio::test]
async fn concurrent_logins_for_one_account_share_an_identity() {
	let (state, _repo) = test_state();

	let mut tasks = Vec::new();
	for _ in 0..4 {
		let lobby = state.lobby.clone();
		tasks.push(tokio::spawn(async move { lobby.login("racer", &scope()).await }));
	}

	let mut ids = Vec::new();
	for task in tasks {
		ids.push(task.await.expect("join").expect("login").identity.id);
	}
	ids.dedup();
	assert_eq!(ids.len(), 1);
}

#[test]
fn guest_name_is_clipped_to_display_name_limit() {
	let name = guest_name(&"x".repeat(MAX_ACCOUNT_CHARS)).expect("name");
	assert_eq!(name.as_str().chars().count(), MAX_DISPLAY_NAME_CHARS);
	assert!(name.as_str().starts_with("Guest-"));
}

#[tokio::test]
async fn unknown_identity_is_not_found() {
	let (state, _repo) = test_state();
	let err = state
		.identities
		.get_profile(IdentityId::new_v4(), &scope())
		.await
		.unwrap_err();
	assert!(matches!(err, PlazaError::NotFound(_)), "got {err:?}");
}

#[tokio::test]
async fn mutations_are_persisted_and_visible_to_reads() {
	let (state, repo) = test_state();
	let ana = identity("ana");
	repo.insert(ana.clone()).await;

	let loaded = state.identities.get_profile(ana.id, &scope()).await.expect("profile");
	assert_eq!(loaded, ana);

	let position = Position::new(3.5, -1.0).expect("position");
	let moved = state
		.identities
		.set_position(ana.id, &scope(), position)
		.await
		.expect("move");
	assert_eq!(moved.position, position);

	let renamed = state
		.identities
		.rename(ana.id, &scope(), DisplayName::new("Ana").expect("name"))
		.await
		.expect("rename");
	assert_eq!(renamed.display_name.as_str(), "Ana");

	let skinned = state.identities.change_skin(ana.id, &scope(), 2).await.expect("skin");
	assert_eq!(skinned.skin.get(), 2);

	let stored = repo.get_identity(ana.id).await.expect("get").expect("present");
	assert_eq!(stored.position, position);
	assert_eq!(stored.display_name.as_str(), "Ana");
	assert_eq!(stored.skin.get(), 2);

	let profile = state.identities.get_profile(ana.id, &scope()).await.expect("profile");
	assert_eq!(profile, stored);
}

#[tokio::test]
async fn invalid_skin_leaves_profile_untouched() {
	let (state, repo) = test_state();
	let ana = identity("ana");
	repo.insert(ana.clone()).await;

	for bad in [0, 3] {
		let err = state.identities.change_skin(ana.id, &scope(), bad).await.unwrap_err();
		assert!(matches!(err, PlazaError::InvalidArgument(_)));
	}

	let stored = repo.get_identity(ana.id).await.expect("get").expect("present");
	assert_eq!(stored.skin, ana.skin);
}

#[tokio::test]
async fn echo_reports_latency_components() {
	let (state, repo) = test_state();
	let ana = identity("ana");
	repo.insert(ana.clone()).await;

	let client = 1_000;
	let gateway = 1_250;
	let data = state
		.identities
		.echo(ana.id, &scope(), client, gateway)
		.await
		.expect("echo");
	assert_eq!(data.client_to_gateway_ms, 250);
	assert!(data.actor_time_unix_ms >= gateway);
	assert_eq!(data.gateway_to_actor_ms, data.actor_time_unix_ms - gateway);
}
