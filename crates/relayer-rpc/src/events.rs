//! Chain event subscriptions.
//!
//! Endpoints emit new block numbers and mined transaction receipts to
//! registered listeners. Listeners are identified by id so that a router can
//! move them from one endpoint to another and still remove them later.

use relayer_types::{TransactionReceipt, B256};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

/// What a listener subscribes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
	/// Every new block number.
	Block,
	/// The receipt of one transaction, once it is mined.
	Transaction(B256),
}

/// An event delivered to listeners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainEvent {
	Block(u64),
	Transaction(TransactionReceipt),
}

impl ChainEvent {
	pub fn event_type(&self) -> EventType {
		match self {
			ChainEvent::Block(_) => EventType::Block,
			ChainEvent::Transaction(receipt) => EventType::Transaction(receipt.transaction_hash),
		}
	}
}

type Callback = Arc<dyn Fn(&ChainEvent) + Send + Sync>;

/// A callback with a stable identity.
#[derive(Clone)]
pub struct Listener {
	id: u64,
	callback: Callback,
}

impl Listener {
	pub fn new<F>(callback: F) -> Self
	where
		F: Fn(&ChainEvent) + Send + Sync + 'static,
	{
		Self {
			id: NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed),
			callback: Arc::new(callback),
		}
	}

	pub fn id(&self) -> u64 {
		self.id
	}

	pub fn notify(&self, event: &ChainEvent) {
		(self.callback)(event)
	}

	/// Returns a listener with the same id and a different callback.
	pub fn rebind<F>(&self, callback: F) -> Self
	where
		F: Fn(&ChainEvent) + Send + Sync + 'static,
	{
		Self {
			id: self.id,
			callback: Arc::new(callback),
		}
	}
}

impl PartialEq for Listener {
	fn eq(&self, other: &Self) -> bool {
		self.id == other.id
	}
}

impl Eq for Listener {}

impl fmt::Debug for Listener {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Listener").field("id", &self.id).finish()
	}
}

/// A registered listener.
#[derive(Debug, Clone)]
pub struct ListenerEntry {
	pub event: EventType,
	pub listener: Listener,
	pub once: bool,
}

/// Thread-safe listener registry.
///
/// Callbacks run outside the internal lock, so a callback may register or
/// remove listeners on the same set.
#[derive(Debug, Default)]
pub struct ListenerSet {
	entries: Mutex<Vec<ListenerEntry>>,
}

impl ListenerSet {
	pub fn new() -> Self {
		Self::default()
	}

	fn lock(&self) -> MutexGuard<'_, Vec<ListenerEntry>> {
		self.entries.lock().unwrap_or_else(|e| e.into_inner())
	}

	pub fn add(&self, event: EventType, listener: Listener, once: bool) {
		self.lock().push(ListenerEntry {
			event,
			listener,
			once,
		});
	}

	/// Removes one listener of `event`, or all of them when `listener` is `None`.
	pub fn remove(&self, event: &EventType, listener: Option<&Listener>) {
		self.lock().retain(|entry| {
			entry.event != *event || listener.is_some_and(|l| l.id() != entry.listener.id())
		});
	}

	/// Removes every registration of the listener with this id.
	pub fn remove_id(&self, id: u64) {
		self.lock().retain(|entry| entry.listener.id() != id);
	}

	/// Removes every listener of `event`, or everything when `event` is `None`.
	pub fn clear(&self, event: Option<&EventType>) {
		match event {
			Some(event) => self.lock().retain(|entry| entry.event != *event),
			None => self.lock().clear(),
		}
	}

	/// Delivers `event` to its listeners and drops fired one-shot listeners.
	///
	/// Returns the number of listeners notified.
	pub fn emit(&self, event: &ChainEvent) -> usize {
		let target = event.event_type();
		let fired: Vec<Listener> = {
			let mut entries = self.lock();
			let fired = entries
				.iter()
				.filter(|entry| entry.event == target)
				.map(|entry| entry.listener.clone())
				.collect();
			entries.retain(|entry| !(entry.once && entry.event == target));
			fired
		};
		for listener in &fired {
			listener.notify(event);
		}
		fired.len()
	}

	/// Snapshot of all registrations in insertion order.
	pub fn entries(&self) -> Vec<ListenerEntry> {
		self.lock().clone()
	}

	pub fn len(&self) -> usize {
		self.lock().len()
	}

	pub fn is_empty(&self) -> bool {
		self.lock().is_empty()
	}

	/// Returns true if anyone listens for `event`.
	pub fn has(&self, event: &EventType) -> bool {
		self.lock().iter().any(|entry| entry.event == *event)
	}
}
