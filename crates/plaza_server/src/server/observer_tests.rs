#![forbid(unsafe_code)]

use std::time::Duration;

use plaza_domain::PlazaError;

use crate::server::observer::{ObserverId, ObserverRegistry};
use crate::server::test_support::observer;

#[tokio::test]
async fn notify_reaches_every_subscriber() {
	let mut registry = ObserverRegistry::<u32>::new("test", Duration::from_secs(180));
	let (a, mut rx_a) = observer::<u32>();
	let (b, mut rx_b) = observer::<u32>();
	registry.subscribe(a).expect("subscribe a");
	registry.subscribe(b).expect("subscribe b");

	assert_eq!(registry.notify(&7), 2);
	assert_eq!(rx_a.try_recv().expect("a got event"), 7);
	assert_eq!(rx_b.try_recv().expect("b got event"), 7);
}

#[tokio::test]
async fn resubscribe_replaces_entry_without_duplicates() {
	let mut registry = ObserverRegistry::<u32>::new("test", Duration::from_secs(180));
	let (a, mut rx_a) = observer::<u32>();
	registry.subscribe(a.clone()).expect("subscribe");
	registry.subscribe(a).expect("resubscribe");

	assert_eq!(registry.len(), 1);
	assert_eq!(registry.notify(&1), 1);
	assert_eq!(rx_a.try_recv().expect("event"), 1);
	assert!(rx_a.try_recv().is_err(), "event delivered twice");
}

#[tokio::test]
async fn unsubscribe_of_unknown_observer_is_a_noop() {
	let mut registry = ObserverRegistry::<u32>::new("test", Duration::from_secs(180));
	assert!(!registry.unsubscribe(ObserverId::next()));

	let (a, _rx) = observer::<u32>();
	let id = a.id();
	registry.subscribe(a).expect("subscribe");
	assert!(registry.unsubscribe(id));
	assert!(!registry.unsubscribe(id));
	assert!(registry.is_empty());
}

#[tokio::test(start_paused = true)]
async fn entries_expire_without_refresh() {
	let ttl = Duration::from_secs(180);
	let mut registry = ObserverRegistry::<u32>::new("test", ttl);
	let (stale, mut rx_stale) = observer::<u32>();
	let (fresh, mut rx_fresh) = observer::<u32>();
	let fresh_id = fresh.id();
	registry.subscribe(stale).expect("subscribe stale");
	registry.subscribe(fresh.clone()).expect("subscribe fresh");

	tokio::time::advance(Duration::from_secs(120)).await;
	registry.subscribe(fresh).expect("refresh");

	tokio::time::advance(Duration::from_secs(90)).await;
	assert_eq!(registry.notify(&5), 1);
	assert!(rx_stale.try_recv().is_err(), "expired observer still received events");
	assert_eq!(rx_fresh.try_recv().expect("fresh event"), 5);
	assert!(registry.contains(fresh_id));
	assert_eq!(registry.len(), 1);
}

#[tokio::test]
async fn failing_sink_is_pruned_and_others_still_receive() {
	let mut registry = ObserverRegistry::<u32>::new("test", Duration::from_secs(180));
	let (gone, rx_gone) = observer::<u32>();
	let (alive, mut rx_alive) = observer::<u32>();
	let gone_id = gone.id();
	registry.subscribe(gone).expect("subscribe");
	registry.subscribe(alive).expect("subscribe");
	drop(rx_gone);

	assert_eq!(registry.notify(&9), 1);
	assert_eq!(rx_alive.try_recv().expect("alive event"), 9);
	assert!(!registry.contains(gone_id));
	assert_eq!(registry.len(), 1);
}

#[tokio::test]
async fn closed_sink_cannot_subscribe() {
	let mut registry = ObserverRegistry::<u32>::new("test", Duration::from_secs(180));
	let (handle, rx) = observer::<u32>();
	drop(rx);

	let err = registry.subscribe(handle).unwrap_err();
	assert!(matches!(err, PlazaError::InvalidArgument(_)), "got {err:?}");
	assert!(registry.is_empty());
}

#[tokio::test]
async fn send_to_targets_one_observer() {
	let mut registry = ObserverRegistry::<u32>::new("test", Duration::from_secs(180));
	let (a, mut rx_a) = observer::<u32>();
	let (b, mut rx_b) = observer::<u32>();
	let a_id = a.id();
	registry.subscribe(a).expect("subscribe a");
	registry.subscribe(b).expect("subscribe b");

	assert!(registry.send_to(a_id, 3));
	assert_eq!(rx_a.try_recv().expect("a event"), 3);
	assert!(rx_b.try_recv().is_err());
	assert!(!registry.send_to(ObserverId::next(), 4));
}
