#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use plaza_domain::PlazaError;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

/// Entries not refreshed within this window stop receiving events.
pub const DEFAULT_OBSERVER_TTL: Duration = Duration::from_secs(180);

static NEXT_OBSERVER_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique observer key. One per connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObserverId(u64);

impl ObserverId {
	pub fn next() -> Self {
		Self(NEXT_OBSERVER_ID.fetch_add(1, Ordering::Relaxed))
	}
}

impl fmt::Display for ObserverId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "obs-{}", self.0)
	}
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeliveryError {
	#[error("observer channel closed")]
	Closed,
}

/// Send-only delivery path bound to one observer.
///
/// `deliver` must not block: it is called from inside an actor's turn.
pub trait EventSink<E>: Send + Sync {
	fn deliver(&self, event: E) -> Result<(), DeliveryError>;

	fn is_closed(&self) -> bool;
}

impl<E: Send> EventSink<E> for mpsc::UnboundedSender<E> {
	fn deliver(&self, event: E) -> Result<(), DeliveryError> {
		self.send(event).map_err(|_| DeliveryError::Closed)
	}

	fn is_closed(&self) -> bool {
		mpsc::UnboundedSender::is_closed(self)
	}
}

/// Opaque capability handed to an actor. Only event values cross it.
pub struct ObserverHandle<E> {
	id: ObserverId,
	sink: Arc<dyn EventSink<E>>,
}

impl<E> ObserverHandle<E> {
	pub fn new(id: ObserverId, sink: Arc<dyn EventSink<E>>) -> Self {
		Self { id, sink }
	}

	pub fn id(&self) -> ObserverId {
		self.id
	}

	pub fn deliver(&self, event: E) -> Result<(), DeliveryError> {
		self.sink.deliver(event)
	}

	pub fn is_closed(&self) -> bool {
		self.sink.is_closed()
	}
}

impl<E> Clone for ObserverHandle<E> {
	fn clone(&self) -> Self {
		Self {
			id: self.id,
			sink: Arc::clone(&self.sink),
		}
	}
}

impl<E> fmt::Debug for ObserverHandle<E> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("ObserverHandle")
			.field("id", &self.id)
			.field("closed", &self.is_closed())
			.finish()
	}
}

struct ObserverEntry<E> {
	handle: ObserverHandle<E>,
	last_refreshed: Instant,
}

/// Subscription table with TTL eviction, owned by exactly one actor.
pub struct ObserverRegistry<E> {
	label: &'static str,
	ttl: Duration,
	entries: HashMap<ObserverId, ObserverEntry<E>>,
}

impl<E: Clone> ObserverRegistry<E> {
	pub fn new(label: &'static str, ttl: Duration) -> Self {
		Self {
			label,
			ttl,
			entries: HashMap::new(),
		}
	}

	/// Register or replace the entry for `handle.id()` and reset its TTL.
	pub fn subscribe(&mut self, handle: ObserverHandle<E>) -> Result<(), PlazaError> {
		if handle.is_closed() {
			return Err(PlazaError::InvalidArgument(format!(
				"observer {} subscribed with a closed sink",
				handle.id()
			)));
		}

		let id = handle.id();
		let replaced = self
			.entries
			.insert(
				id,
				ObserverEntry {
					handle,
					last_refreshed: Instant::now(),
				},
			)
			.is_some();
		debug!(registry = self.label, observer = %id, replaced, "observer subscribed");
		Ok(())
	}

	/// Remove the entry. Absent keys are a no-op.
	pub fn unsubscribe(&mut self, id: ObserverId) -> bool {
		let removed = self.entries.remove(&id).is_some();
		if removed {
			debug!(registry = self.label, observer = %id, "observer unsubscribed");
		}
		removed
	}

	/// Deliver to every live entry. Returns how many deliveries succeeded.
	pub fn notify(&mut self, event: &E) -> usize {
		self.notify_where(event, |_| true)
	}

	/// Deliver to every live entry whose id matches `predicate`.
	pub fn notify_where(&mut self, event: &E, predicate: impl Fn(ObserverId) -> bool) -> usize {
		self.evict_expired();

		let mut delivered = 0usize;
		let mut failed = Vec::new();
		for (id, entry) in &self.entries {
			if !predicate(*id) {
				continue;
			}
			match entry.handle.deliver(event.clone()) {
				Ok(()) => delivered += 1,
				Err(e) => {
					debug!(registry = self.label, observer = %id, error = %e, "observer delivery failed");
					metrics::counter!("plaza_server_observer_deliveries_failed_total").increment(1);
					failed.push(*id);
				}
			}
		}

		for id in failed {
			self.entries.remove(&id);
		}

		delivered
	}

	/// Deliver to a single live entry. Returns false when it is absent, expired or closed.
	pub fn send_to(&mut self, id: ObserverId, event: E) -> bool {
		self.evict_expired();

		let Some(entry) = self.entries.get(&id) else {
			return false;
		};
		match entry.handle.deliver(event) {
			Ok(()) => true,
			Err(e) => {
				debug!(registry = self.label, observer = %id, error = %e, "observer delivery failed");
				metrics::counter!("plaza_server_observer_deliveries_failed_total").increment(1);
				self.entries.remove(&id);
				false
			}
		}
	}

	/// Drop expired and closed entries. Returns the number still live.
	pub fn prune(&mut self) -> usize {
		self.evict_expired();
		self.entries.retain(|_, entry| !entry.handle.is_closed());
		self.entries.len()
	}

	pub fn contains(&self, id: ObserverId) -> bool {
		self.entries
			.get(&id)
			.is_some_and(|entry| entry.last_refreshed.elapsed() <= self.ttl)
	}

	pub fn len(&self) -> usize {
		self.entries.len()
	}

	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}

	fn evict_expired(&mut self) {
		let now = Instant::now();
		let ttl = self.ttl;
		let label = self.label;
		self.entries.retain(|id, entry| {
			let live = now.saturating_duration_since(entry.last_refreshed) <= ttl;
			if !live {
				debug!(registry = label, observer = %id, "observer expired");
			}
			live
		});
	}
}
