//! Per-conversation mutual exclusion.
//!
//! Each conversation id maps to its own fair async mutex, so waiters are
//! served in arrival order and unrelated conversations never contend. The
//! entry for an id only exists while someone holds or waits for it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, warn};

use colloquy_core::domain::tracker::ConversationId;
use colloquy_core::errors::LockError;

#[derive(Default)]
struct SlotState {
    mutex: Arc<AsyncMutex<()>>,
    waiting: AtomicUsize,
}

type Slot = Arc<SlotState>;
type SlotMap = Arc<Mutex<HashMap<ConversationId, Slot>>>;

/// Counts a caller as queued until it gets the lock or gives up.
struct Queued<'a>(&'a AtomicUsize);

impl<'a> Queued<'a> {
    fn enter(waiting: &'a AtomicUsize) -> Self {
        waiting.fetch_add(1, Ordering::AcqRel);
        Self(waiting)
    }
}

impl Drop for Queued<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

#[derive(Default)]
pub struct LockManager {
    slots: SlotMap,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits up to `timeout` for exclusive access to `conversation_id`.
    pub async fn acquire(
        &self,
        conversation_id: &ConversationId,
        holder: &str,
        timeout: Duration,
    ) -> Result<ConversationLock, LockError> {
        let slot = {
            let mut slots = lock_map(&self.slots);
            slots.entry(conversation_id.clone()).or_default().clone()
        };

        let started = Instant::now();
        let acquired = {
            let _queued = Queued::enter(&slot.waiting);
            tokio::time::timeout(timeout, Arc::clone(&slot.mutex).lock_owned()).await
        };
        match acquired {
            Ok(guard) => {
                debug!(
                    event_name = "lock.acquired",
                    conversation_id = %conversation_id,
                    holder,
                    waited_ms = started.elapsed().as_millis() as u64,
                    "conversation lock acquired"
                );
                Ok(ConversationLock {
                    conversation_id: conversation_id.clone(),
                    holder: holder.to_string(),
                    acquired_at: Instant::now(),
                    guard: Some(guard),
                    slot,
                    slots: Arc::clone(&self.slots),
                })
            }
            Err(_) => {
                prune(&self.slots, conversation_id, &slot);
                let waited_ms = timeout.as_millis() as u64;
                warn!(
                    event_name = "lock.timed_out",
                    conversation_id = %conversation_id,
                    holder,
                    waited_ms,
                    "conversation lock not acquired in time"
                );
                Err(LockError::Timeout { conversation_id: conversation_id.clone(), waited_ms })
            }
        }
    }

    pub fn is_locked(&self, conversation_id: &ConversationId) -> bool {
        lock_map(&self.slots)
            .get(conversation_id)
            .is_some_and(|slot| slot.mutex.try_lock().is_err())
    }

    /// Number of callers currently waiting to acquire `conversation_id`.
    pub fn waiting(&self, conversation_id: &ConversationId) -> usize {
        lock_map(&self.slots)
            .get(conversation_id)
            .map_or(0, |slot| slot.waiting.load(Ordering::Acquire))
    }

    pub fn tracked_conversations(&self) -> usize {
        lock_map(&self.slots).len()
    }
}

/// Exclusive access to one conversation, released on drop.
pub struct ConversationLock {
    conversation_id: ConversationId,
    holder: String,
    acquired_at: Instant,
    guard: Option<OwnedMutexGuard<()>>,
    slot: Slot,
    slots: SlotMap,
}

impl ConversationLock {
    pub fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }
}

impl Drop for ConversationLock {
    fn drop(&mut self) {
        drop(self.guard.take());
        prune(&self.slots, &self.conversation_id, &self.slot);
        debug!(
            event_name = "lock.released",
            conversation_id = %self.conversation_id,
            holder = %self.holder,
            held_ms = self.acquired_at.elapsed().as_millis() as u64,
            "conversation lock released"
        );
    }
}

fn lock_map(slots: &SlotMap) -> MutexGuard<'_, HashMap<ConversationId, Slot>> {
    slots.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Drops the map entry once only the map and `slot` still reference it;
/// every holder and waiter keeps its own reference.
fn prune(slots: &SlotMap, conversation_id: &ConversationId, slot: &Slot) {
    let mut slots = lock_map(slots);
    let unused = slots
        .get(conversation_id)
        .is_some_and(|current| Arc::ptr_eq(current, slot) && Arc::strong_count(slot) == 2);
    if unused {
        slots.remove(conversation_id);
    }
}
