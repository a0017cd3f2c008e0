use std::{
    fmt,
    ops::{BitAnd, BitOr, BitOrAssign},
};

use slab::Slab;

/// Platform socket number.
pub type Socket = i32;

/// Socket conditions a handler is interested in, or that became ready.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Condition(u8);

impl Condition {
    pub const NONE: Condition = Condition(0);
    pub const READABLE: Condition = Condition(1);
    pub const WRITABLE: Condition = Condition(2);
    pub const EXCEPTION: Condition = Condition(4);

    pub fn from_bits(bits: u8) -> Self {
        Condition(bits & 0x7)
    }

    pub fn bits(&self) -> u8 {
        self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
    pub fn contains(&self, other: Condition) -> bool {
        self.0 & other.0 == other.0
    }
    pub fn intersects(&self, other: Condition) -> bool {
        self.0 & other.0 != 0
    }
    pub fn is_readable(&self) -> bool {
        self.intersects(Self::READABLE)
    }
    pub fn is_writable(&self) -> bool {
        self.intersects(Self::WRITABLE)
    }
    pub fn is_exception(&self) -> bool {
        self.intersects(Self::EXCEPTION)
    }
}

impl BitOr for Condition {
    type Output = Condition;

    fn bitor(self, rhs: Condition) -> Condition {
        Condition(self.0 | rhs.0)
    }
}

impl BitOrAssign for Condition {
    fn bitor_assign(&mut self, rhs: Condition) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for Condition {
    type Output = Condition;

    fn bitand(self, rhs: Condition) -> Condition {
        Condition(self.0 & rhs.0)
    }
}

impl fmt::Debug for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut set = f.debug_set();
        if self.is_readable() {
            set.entry(&"READABLE");
        }
        if self.is_writable() {
            set.entry(&"WRITABLE");
        }
        if self.is_exception() {
            set.entry(&"EXCEPTION");
        }
        set.finish()
    }
}

/// One registered socket: what it waits for and who to call.
pub struct HandlerDescriptor<H> {
    pub socket: Socket,
    pub conditions: Condition,
    pub handler: H,
    prev: usize,
    next: usize,
}

impl<H> fmt::Debug for HandlerDescriptor<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerDescriptor")
            .field("socket", &self.socket)
            .field("conditions", &self.conditions)
            .finish_non_exhaustive()
    }
}

/// Anchor of the descriptor list. Holds no handler.
const SENTINEL: usize = 0;

enum Slot<H> {
    Sentinel { prev: usize, next: usize },
    Handler(HandlerDescriptor<H>),
}

impl<H> Slot<H> {
    fn links(&self) -> (usize, usize) {
        match self {
            Slot::Sentinel { prev, next } => (*prev, *next),
            Slot::Handler(d) => (d.prev, d.next),
        }
    }

    fn set_prev(&mut self, to: usize) {
        match self {
            Slot::Sentinel { prev, .. } => *prev = to,
            Slot::Handler(d) => d.prev = to,
        }
    }

    fn set_next(&mut self, to: usize) {
        match self {
            Slot::Sentinel { next, .. } => *next = to,
            Slot::Handler(d) => d.next = to,
        }
    }
}

/// Registry of per-socket handlers, most recently added first.
///
/// Lookup is a linear scan; the set is expected to stay small.
pub struct HandlerSet<H> {
    slots: Slab<Slot<H>>,
}

impl<H> Default for HandlerSet<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H> HandlerSet<H> {
    pub fn new() -> Self {
        let mut slots = Slab::new();
        let sentinel = slots.insert(Slot::Sentinel {
            prev: SENTINEL,
            next: SENTINEL,
        });
        debug_assert_eq!(sentinel, SENTINEL);
        Self { slots }
    }

    pub fn len(&self) -> usize {
        self.slots.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Register `handler` for `socket`, replacing any existing registration
    /// in place.
    pub fn assign_handler(&mut self, socket: Socket, conditions: Condition, handler: H) {
        if let Some(key) = self.find(socket) {
            if let Slot::Handler(descriptor) = &mut self.slots[key] {
                descriptor.conditions = conditions;
                descriptor.handler = handler;
            }
            return;
        }

        let (_, first) = self.slots[SENTINEL].links();
        let key = self.slots.insert(Slot::Handler(HandlerDescriptor {
            socket,
            conditions,
            handler,
            prev: SENTINEL,
            next: first,
        }));
        self.slots[first].set_prev(key);
        self.slots[SENTINEL].set_next(key);
    }

    /// Remove and return the handler for `socket`.
    pub fn clear_handler(&mut self, socket: Socket) -> Option<H> {
        let key = self.find(socket)?;
        let (prev, next) = self.slots[key].links();
        self.slots[prev].set_next(next);
        self.slots[next].set_prev(prev);
        match self.slots.remove(key) {
            Slot::Handler(descriptor) => Some(descriptor.handler),
            Slot::Sentinel { .. } => None,
        }
    }

    /// Relabel the descriptor for `old` as `new`. Returns false if `old` is
    /// not registered.
    pub fn move_handler(&mut self, old: Socket, new: Socket) -> bool {
        match self.lookup_mut(old) {
            Some(descriptor) => {
                descriptor.socket = new;
                true
            }
            None => false,
        }
    }

    pub fn lookup(&self, socket: Socket) -> Option<&HandlerDescriptor<H>> {
        self.iter().find(|descriptor| descriptor.socket == socket)
    }

    pub fn lookup_mut(&mut self, socket: Socket) -> Option<&mut HandlerDescriptor<H>> {
        let key = self.find(socket)?;
        match &mut self.slots[key] {
            Slot::Handler(descriptor) => Some(descriptor),
            Slot::Sentinel { .. } => None,
        }
    }

    /// Descriptors in list order, most recently assigned first.
    pub fn iter(&self) -> Iter<'_, H> {
        let (_, next) = self.slots[SENTINEL].links();
        Iter { set: self, next }
    }

    fn find(&self, socket: Socket) -> Option<usize> {
        let mut cur = self.slots[SENTINEL].links().1;
        while cur != SENTINEL {
            match &self.slots[cur] {
                Slot::Handler(descriptor) if descriptor.socket == socket => return Some(cur),
                slot => cur = slot.links().1,
            }
        }
        None
    }
}

impl<H> fmt::Debug for HandlerSet<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

pub struct Iter<'a, H> {
    set: &'a HandlerSet<H>,
    next: usize,
}

impl<'a, H> Iterator for Iter<'a, H> {
    type Item = &'a HandlerDescriptor<H>;

    fn next(&mut self) -> Option<Self::Item> {
        match &self.set.slots[self.next] {
            Slot::Sentinel { .. } => None,
            Slot::Handler(descriptor) => {
                self.next = descriptor.next;
                Some(descriptor)
            }
        }
    }
}

impl<'a, H> IntoIterator for &'a HandlerSet<H> {
    type Item = &'a HandlerDescriptor<H>;
    type IntoIter = Iter<'a, H>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
