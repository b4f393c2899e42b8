#![forbid(unsafe_code)]

//! Keyed single-writer actors.
//!
//! An [`ActorDirectory`] maps a key to a bounded mailbox drained by one task,
//! so each actor handles its messages one at a time in arrival order while
//! different keys run in parallel. Entries are created on first use and remove
//! themselves after an idle period (see [`DirectoryConfig::idle_after`]).

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use plaza_domain::PlazaError;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Reply channel carried by actor messages.
pub type Reply<T> = oneshot::Sender<Result<T, PlazaError>>;

#[async_trait]
pub trait Actor: Send + 'static {
	type Key: Copy + Eq + Hash + fmt::Display + Send + Sync + 'static;
	type Message: Send + 'static;

	/// Short name used in logs and metric labels.
	const KIND: &'static str;

	async fn handle(&mut self, msg: Self::Message);

	/// True when the actor holds nothing that would be lost by dropping it.
	fn is_idle(&mut self) -> bool;
}

/// Result of a `Leave` that carries the caller's observer id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaveOutcome {
	Left,
	/// A newer connection re-joined the same identity; the record was kept.
	Superseded,
}

/// Cancellation scope for one request: fires on connection cancel or deadline.
#[derive(Debug, Clone)]
pub struct CallScope {
	token: CancellationToken,
	deadline: Instant,
}

impl CallScope {
	pub fn new(parent: &CancellationToken, timeout: Duration) -> Self {
		Self {
			token: parent.child_token(),
			deadline: Instant::now() + timeout,
		}
	}

	/// Scope not tied to any connection. Used for teardown after the connection is gone.
	pub fn detached(timeout: Duration) -> Self {
		Self {
			token: CancellationToken::new(),
			deadline: Instant::now() + timeout,
		}
	}

	pub fn token(&self) -> &CancellationToken {
		&self.token
	}

	pub fn is_cancelled(&self) -> bool {
		self.token.is_cancelled()
	}

	/// Run `fut` until it completes, the scope is cancelled, or the deadline passes.
	pub async fn run<F: Future>(&self, fut: F) -> Result<F::Output, PlazaError> {
		tokio::select! {
			biased;
			_ = self.token.cancelled() => Err(PlazaError::Cancelled),
			res = tokio::time::timeout_at(self.deadline, fut) => res.map_err(|_| PlazaError::Cancelled),
		}
	}
}

#[derive(Debug, Clone)]
pub struct DirectoryConfig {
	pub mailbox_capacity: usize,
	pub idle_after: Duration,
}

impl Default for DirectoryConfig {
	fn default() -> Self {
		Self {
			mailbox_capacity: 1024,
			idle_after: Duration::from_secs(300),
		}
	}
}

type Factory<A> = Box<dyn Fn(<A as Actor>::Key) -> A + Send + Sync>;

struct Slot<M> {
	tx: mpsc::Sender<M>,
	generation: u64,
}

struct DirectoryInner<A: Actor> {
	cfg: DirectoryConfig,
	factory: Factory<A>,
	slots: Mutex<HashMap<A::Key, Slot<A::Message>>>,
	next_generation: AtomicU64,
}

/// Locates or creates the actor for a key.
pub struct ActorDirectory<A: Actor> {
	inner: Arc<DirectoryInner<A>>,
}

impl<A: Actor> Clone for ActorDirectory<A> {
	fn clone(&self) -> Self {
		Self {
			inner: Arc::clone(&self.inner),
		}
	}
}

impl<A: Actor> ActorDirectory<A> {
	pub fn new(cfg: DirectoryConfig, factory: impl Fn(A::Key) -> A + Send + Sync + 'static) -> Self {
		Self {
			inner: Arc::new(DirectoryInner {
				cfg,
				factory: Box::new(factory),
				slots: Mutex::new(HashMap::new()),
				next_generation: AtomicU64::new(1),
			}),
		}
	}

	/// Send a request built by `make` and await the reply within `scope`.
	///
	/// A send to a closed mailbox or a dropped reply means the message was never
	/// handled (the actor was evicted in between), so it is retried once against
	/// a fresh instance.
	pub async fn ask<T, F>(&self, key: A::Key, scope: &CallScope, make: F) -> Result<T, PlazaError>
	where
		T: Send + 'static,
		F: Fn(Reply<T>) -> A::Message + Send,
	{
		for attempt in 0..2 {
			let (mailbox, generation) = self.mailbox(key).await;
			let (reply_tx, reply_rx) = oneshot::channel();

			if scope.run(mailbox.send(make(reply_tx))).await?.is_err() {
				debug!(actor = A::KIND, %key, attempt, "mailbox closed before send");
				self.forget(key, generation).await;
				continue;
			}

			match scope.run(reply_rx).await? {
				Ok(result) => return result,
				Err(_) => {
					debug!(actor = A::KIND, %key, attempt, "reply dropped before handling");
					self.forget(key, generation).await;
				}
			}
		}

		warn!(actor = A::KIND, %key, "actor unavailable after retry");
		Err(PlazaError::Internal(format!("{} {key} unavailable", A::KIND)))
	}

	/// Number of live directory entries.
	pub async fn len(&self) -> usize {
		self.inner.slots.lock().await.len()
	}

	pub async fn is_empty(&self) -> bool {
		self.len().await == 0
	}

	async fn mailbox(&self, key: A::Key) -> (mpsc::Sender<A::Message>, u64) {
		let mut slots = self.inner.slots.lock().await;
		if let Some(slot) = slots.get(&key)
			&& !slot.tx.is_closed()
		{
			return (slot.tx.clone(), slot.generation);
		}

		let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
		let (tx, rx) = mpsc::channel(self.inner.cfg.mailbox_capacity.max(1));
		let actor = (self.inner.factory)(key);
		slots.insert(
			key,
			Slot {
				tx: tx.clone(),
				generation,
			},
		);

		metrics::gauge!("plaza_server_actor_mailboxes_active", "kind" => A::KIND).increment(1.0);
		debug!(actor = A::KIND, %key, generation, "activated actor");

		tokio::spawn(run_mailbox(
			Arc::downgrade(&self.inner),
			key,
			generation,
			actor,
			rx,
			self.inner.cfg.idle_after,
		));

		(tx, generation)
	}

	async fn forget(&self, key: A::Key, generation: u64) {
		let mut slots = self.inner.slots.lock().await;
		if slots.get(&key).is_some_and(|slot| slot.generation == generation) {
			slots.remove(&key);
		}
	}
}

async fn run_mailbox<A: Actor>(
	directory: Weak<DirectoryInner<A>>,
	key: A::Key,
	generation: u64,
	mut actor: A,
	mut rx: mpsc::Receiver<A::Message>,
	idle_after: Duration,
) {
	loop {
		match tokio::time::timeout(idle_after, rx.recv()).await {
			Ok(Some(msg)) => actor.handle(msg).await,
			Ok(None) => break,
			Err(_) => {
				if !actor.is_idle() {
					continue;
				}
				let Some(directory) = directory.upgrade() else {
					break;
				};

				// Senders clone the mailbox under this lock, so nothing new can be
				// routed here once the entry is gone.
				let mut slots = directory.slots.lock().await;
				if !rx.is_empty() {
					continue;
				}
				if slots.get(&key).is_some_and(|slot| slot.generation == generation) {
					slots.remove(&key);
				}
				rx.close();
				drop(slots);

				debug!(actor = A::KIND, %key, generation, "evicted idle actor");
				break;
			}
		}
	}

	// Anything still queued raced with eviction. Dropping it drops the reply
	// senders, which makes `ask` retry on a fresh instance.
	let mut unhandled = 0usize;
	while rx.try_recv().is_ok() {
		unhandled += 1;
	}
	if unhandled > 0 {
		debug!(actor = A::KIND, %key, unhandled, "released queued messages after eviction");
	}

	metrics::gauge!("plaza_server_actor_mailboxes_active", "kind" => A::KIND).decrement(1.0);
}
