//! Event triggers: 32 pre-registered signal slots that any thread can fire
//! and the reactor thread services.
//!
//! A trigger id is a one-hot mask; slot 0 is the most significant bit.
//! Ids may be or-ed together to fire or delete several slots at once.

use std::{
    any::Any,
    fmt,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
};

use parking_lot::Mutex;

use crate::poller::Notify;

pub const MAX_NUM_EVENT_TRIGGERS: usize = 32;

/// One-hot trigger mask. `0` is never a valid trigger.
pub type EventTriggerId = u32;

/// Payload handed from [`TriggerHandle::trigger_event`] to the trigger's
/// handler.
pub type ClientData = Arc<dyn Any + Send + Sync>;

pub fn mask_for(index: usize) -> EventTriggerId {
    0x8000_0000 >> index
}

/// Slot indices whose bit is set in `id`, lowest index first.
pub fn indices(id: EventTriggerId) -> impl Iterator<Item = usize> {
    (0..MAX_NUM_EVENT_TRIGGERS).filter(move |&index| id & mask_for(index) != 0)
}

/// The part of the trigger table shared with other threads.
struct Shared {
    awaiting: AtomicU32,
    client_data: [Mutex<Option<ClientData>>; MAX_NUM_EVENT_TRIGGERS],
    notifier: Option<Arc<dyn Notify>>,
}

/// Fires event triggers from any thread.
///
/// The awaiting bit is published with a release `fetch_or` after the
/// client data is stored, so the reactor never sees a bit before the data
/// written by the same call. A slot keeps its data until the next call
/// overwrites it, so two calls racing on one slot may both be dispatched
/// with the later payload; use immutable payloads.
#[derive(Clone)]
pub struct TriggerHandle {
    shared: Arc<Shared>,
}

impl Shared {
    fn trigger(&self, id: EventTriggerId, client_data: Option<ClientData>) {
        for index in indices(id) {
            *self.client_data[index].lock() = client_data.clone();
        }

        // must follow the data writes
        self.awaiting.fetch_or(id, Ordering::Release);

        if let Some(notifier) = &self.notifier {
            if let Err(err) = notifier.notify() {
                tracing::warn!(%err, trigger = id, "failed to wake the reactor");
            }
        }
    }
}

impl TriggerHandle {
    pub fn trigger_event(&self, id: EventTriggerId, client_data: Option<ClientData>) {
        self.shared.trigger(id, client_data);
    }

    /// Bits signalled but not yet serviced.
    pub fn awaiting(&self) -> EventTriggerId {
        self.shared.awaiting.load(Ordering::Acquire)
    }
}

impl fmt::Debug for TriggerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TriggerHandle")
            .field("awaiting", &format_args!("{:#010x}", self.awaiting()))
            .finish()
    }
}

/// Reactor-side trigger table: the handlers live here, on the reactor
/// thread only.
pub struct TriggerTable<F> {
    handlers: [Option<F>; MAX_NUM_EVENT_TRIGGERS],
    last_used_num: usize,
    last_used_mask: EventTriggerId,
    shared: Arc<Shared>,
}

impl<F> TriggerTable<F> {
    pub fn new(notifier: Option<Arc<dyn Notify>>) -> Self {
        Self {
            handlers: std::array::from_fn(|_| None),
            last_used_num: MAX_NUM_EVENT_TRIGGERS - 1,
            last_used_mask: 1,
            shared: Arc::new(Shared {
                awaiting: AtomicU32::new(0),
                client_data: std::array::from_fn(|_| Mutex::new(None)),
                notifier,
            }),
        }
    }

    pub fn handle(&self) -> TriggerHandle {
        TriggerHandle {
            shared: self.shared.clone(),
        }
    }

    /// Claim the next free slot after the last one handed out.
    /// Returns 0 once all slots are taken.
    pub fn create(&mut self, handler: F) -> EventTriggerId {
        let mut index = self.last_used_num;
        let mut mask = self.last_used_mask;

        loop {
            index = (index + 1) % MAX_NUM_EVENT_TRIGGERS;
            mask >>= 1;
            if mask == 0 {
                mask = 0x8000_0000;
            }

            if self.handlers[index].is_none() {
                self.handlers[index] = Some(handler);
                *self.shared.client_data[index].lock() = None;
                self.last_used_num = index;
                self.last_used_mask = mask;
                tracing::debug!(index, trigger = mask, "event trigger created");
                return mask;
            }

            if index == self.last_used_num {
                tracing::warn!("all {MAX_NUM_EVENT_TRIGGERS} event triggers are in use");
                return 0;
            }
        }
    }

    /// Free every slot set in `id`, discarding any pending signal.
    pub fn delete(&mut self, id: EventTriggerId) {
        self.shared.awaiting.fetch_and(!id, Ordering::AcqRel);

        for index in indices(id) {
            self.handlers[index] = None;
            *self.shared.client_data[index].lock() = None;
        }
    }

    pub fn handler(&self, index: usize) -> Option<&F> {
        self.handlers.get(index)?.as_ref()
    }

    pub fn trigger_event(&self, id: EventTriggerId, client_data: Option<ClientData>) {
        self.shared.trigger(id, client_data);
    }

    pub fn awaiting(&self) -> EventTriggerId {
        self.shared.awaiting.load(Ordering::Acquire)
    }

    pub fn is_pending(&self) -> bool {
        self.awaiting() != 0
    }

    /// Atomically clear the awaiting bit for `index`. If it was set, return
    /// the client data currently recorded in the slot.
    pub fn claim(&self, index: usize) -> Option<Option<ClientData>> {
        let mask = mask_for(index);
        let previous = self.shared.awaiting.fetch_and(!mask, Ordering::AcqRel);
        if previous & mask == 0 {
            return None;
        }
        Some(self.shared.client_data[index].lock().clone())
    }
}

impl<F> fmt::Debug for TriggerTable<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let in_use: Vec<usize> = (0..MAX_NUM_EVENT_TRIGGERS)
            .filter(|&index| self.handlers[index].is_some())
            .collect();
        f.debug_struct("TriggerTable")
            .field("in_use", &in_use)
            .field("awaiting", &format_args!("{:#010x}", self.awaiting()))
            .finish()
    }
}
