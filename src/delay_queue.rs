//! Timer queue keyed by relative time-to-fire.
//!
//! Entries are kept in deadline order, but each one only stores the time
//! remaining *after its predecessor* fires. Advancing the clock therefore
//! touches the leading run of expired entries plus one more, instead of
//! every pending timer.

use std::fmt;

use slab::Slab;

use crate::{
    hash_table::HashTable,
    time::{Clock, DelayInterval, EventTime, SystemClock},
};

/// Opaque handle to a scheduled entry. Issued in increasing order and never
/// reused by the queue that issued it.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskToken(usize);

impl TaskToken {
    pub fn as_usize(&self) -> usize {
        self.0
    }
}

impl fmt::Debug for TaskToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TaskToken({})", self.0)
    }
}

/// Slab key of the list anchor. Inserted first, never removed.
const SENTINEL: usize = 0;

struct Node<T> {
    prev: usize,
    next: usize,
    delta: DelayInterval,
    token: usize,
    // `None` only for the sentinel
    payload: Option<T>,
}

pub struct DelayQueue<T> {
    nodes: Slab<Node<T>>,
    by_token: HashTable<usize, usize>,
    token_counter: usize,
    last_sync: EventTime,
    clock: Box<dyn Clock>,
}

impl<T> Default for DelayQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> DelayQueue<T> {
    pub fn new() -> Self {
        Self::with_clock(Box::new(SystemClock))
    }

    pub fn with_clock(clock: Box<dyn Clock>) -> Self {
        let mut nodes = Slab::new();
        let sentinel = nodes.insert(Node {
            prev: SENTINEL,
            next: SENTINEL,
            delta: DelayInterval::ETERNITY,
            token: 0,
            payload: None,
        });
        debug_assert_eq!(sentinel, SENTINEL);

        Self {
            nodes,
            by_token: HashTable::new(),
            token_counter: 0,
            last_sync: clock.now(),
            clock,
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.head() == SENTINEL
    }

    /// Schedule `payload` to become due after `delay`.
    ///
    /// Entries with equal deadlines become due in insertion order.
    pub fn add_entry(&mut self, delay: DelayInterval, payload: T) -> TaskToken {
        self.token_counter += 1;
        let token = self.token_counter;

        let key = self.nodes.insert(Node {
            prev: SENTINEL,
            next: SENTINEL,
            delta: delay,
            token,
            payload: Some(payload),
        });
        self.by_token.add(token, key);
        self.link(key);

        TaskToken(token)
    }

    /// Detach the entry for `token` and hand back its payload.
    /// `None` if the token already fired or was removed.
    pub fn remove_entry(&mut self, token: TaskToken) -> Option<T> {
        let key = self.by_token.remove(&token.0)?;
        self.unlink(key);
        match self.nodes.try_remove(key) {
            Some(node) => node.payload,
            None => {
                tracing::error!(?token, key, "delay queue index points at a vacant slot");
                debug_assert!(false, "delay queue index out of sync");
                None
            }
        }
    }

    /// Move the entry for `token` so it becomes due `new_delay` from now.
    /// Returns false if the token is not pending.
    pub fn update_entry(&mut self, token: TaskToken, new_delay: DelayInterval) -> bool {
        let Some(&key) = self.by_token.lookup(&token.0) else {
            return false;
        };
        self.unlink(key);
        self.nodes[key].delta = new_delay;
        self.link(key);
        true
    }

    pub fn contains(&self, token: TaskToken) -> bool {
        self.by_token.contains_key(&token.0)
    }

    /// How long until the earliest entry is due. [`DelayInterval::ETERNITY`]
    /// when the queue is empty.
    pub fn time_to_next_alarm(&mut self) -> DelayInterval {
        let head = self.head();
        if self.nodes[head].delta.is_zero() {
            return DelayInterval::ZERO;
        }

        self.synchronize();
        self.nodes[self.head()].delta
    }

    /// If the earliest entry is due, detach it and return its payload.
    ///
    /// The entry is out of the queue before the caller runs it, so the
    /// handler is free to schedule or unschedule other entries.
    pub fn handle_alarm(&mut self) -> Option<(TaskToken, T)> {
        if !self.nodes[self.head()].delta.is_zero() {
            self.synchronize();
        }

        let head = self.head();
        if head == SENTINEL || !self.nodes[head].delta.is_zero() {
            return None;
        }

        let token = TaskToken(self.nodes[head].token);
        self.remove_entry(token).map(|payload| (token, payload))
    }

    /// Drop every pending entry.
    pub fn clear(&mut self) {
        while self.head() != SENTINEL {
            let token = TaskToken(self.nodes[self.head()].token);
            if self.remove_entry(token).is_none() {
                break;
            }
        }
    }

    fn head(&self) -> usize {
        self.nodes[SENTINEL].next
    }

    /// Bring the head of the queue up to date with the clock.
    fn synchronize(&mut self) {
        let now = self.clock.now();
        if now < self.last_sync {
            // clock went backwards
            tracing::debug!(?now, last_sync = ?self.last_sync, "clock moved backwards");
            self.last_sync = now;
            return;
        }
        let mut elapsed = now - self.last_sync;
        self.last_sync = now;

        let mut cur = self.head();
        while cur != SENTINEL && elapsed >= self.nodes[cur].delta {
            elapsed -= self.nodes[cur].delta;
            self.nodes[cur].delta = DelayInterval::ZERO;
            cur = self.nodes[cur].next;
        }
        if cur != SENTINEL {
            self.nodes[cur].delta -= elapsed;
        }
    }

    /// Insert a detached node, whose delta holds its full delay, at its
    /// position in deadline order.
    fn link(&mut self, key: usize) {
        self.synchronize();

        let mut remaining = self.nodes[key].delta;
        let mut cur = self.head();
        while cur != SENTINEL && remaining >= self.nodes[cur].delta {
            remaining -= self.nodes[cur].delta;
            cur = self.nodes[cur].next;
        }
        if cur != SENTINEL {
            self.nodes[cur].delta -= remaining;
        }

        let prev = self.nodes[cur].prev;
        let node = &mut self.nodes[key];
        node.delta = remaining;
        node.next = cur;
        node.prev = prev;
        self.nodes[prev].next = key;
        self.nodes[cur].prev = key;
    }

    /// Detach a node, folding its delta into its successor.
    fn unlink(&mut self, key: usize) {
        debug_assert_ne!(key, SENTINEL, "the sentinel is never removed");
        let Node {
            prev, next, delta, ..
        } = self.nodes[key];
        if self.nodes[prev].next != key || self.nodes[next].prev != key {
            tracing::error!(key, prev, next, "delay queue entry is not linked where it claims");
            debug_assert!(false, "delay queue links are inconsistent");
            return;
        }

        if next != SENTINEL {
            self.nodes[next].delta += delta;
        }
        self.nodes[prev].next = next;
        self.nodes[next].prev = prev;

        let node = &mut self.nodes[key];
        node.prev = key;
        node.next = key;
    }
}

impl<T> fmt::Debug for DelayQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut list = f.debug_list();
        let mut cur = self.head();
        while cur != SENTINEL {
            let node = &self.nodes[cur];
            list.entry(&(TaskToken(node.token), node.delta));
            cur = node.next;
        }
        list.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::ManualClock;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    fn queue() -> (DelayQueue<u32>, ManualClock) {
        let clock = ManualClock::new(EventTime::new(1_000, 0));
        (DelayQueue::with_clock(Box::new(clock.clone())), clock)
    }

    fn ms(n: i64) -> DelayInterval {
        DelayInterval::from_micros(n * 1_000)
    }

    fn deltas<T>(queue: &DelayQueue<T>) -> Vec<DelayInterval> {
        let mut out = Vec::new();
        let mut cur = queue.head();
        while cur != SENTINEL {
            out.push(queue.nodes[cur].delta);
            cur = queue.nodes[cur].next;
        }
        out
    }

    fn drain_due(queue: &mut DelayQueue<u32>) -> Vec<u32> {
        let mut fired = Vec::new();
        while let Some((_, payload)) = queue.handle_alarm() {
            fired.push(payload);
        }
        fired
    }

    #[test]
    fn deltas_are_relative_to_predecessor() {
        let (mut queue, _clock) = queue();
        queue.add_entry(ms(500), 500);
        queue.add_entry(ms(100), 100);
        queue.add_entry(ms(300), 300);
        assert_eq!(deltas(&queue), vec![ms(100), ms(200), ms(200)]);
        assert_eq!(queue.time_to_next_alarm(), ms(100));
    }

    #[test]
    fn fires_in_deadline_order() {
        let (mut queue, clock) = queue();
        queue.add_entry(ms(500), 500);
        queue.add_entry(ms(100), 100);
        queue.add_entry(ms(300), 300);

        assert!(drain_due(&mut queue).is_empty());
        clock.advance(ms(150));
        assert_eq!(drain_due(&mut queue), vec![100]);
        clock.advance(ms(150));
        assert_eq!(drain_due(&mut queue), vec![300]);
        clock.advance(ms(1_000));
        assert_eq!(drain_due(&mut queue), vec![500]);
        assert!(queue.is_empty());
        assert_eq!(queue.time_to_next_alarm(), DelayInterval::ETERNITY);
    }

    #[test]
    fn equal_deadlines_fire_in_insertion_order() {
        let (mut queue, clock) = queue();
        for i in 0..5 {
            queue.add_entry(ms(50), i);
        }
        clock.advance(ms(50));
        assert_eq!(drain_due(&mut queue), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn synchronize_consumes_elapsed_time_across_entries() {
        let (mut queue, clock) = queue();
        queue.add_entry(ms(10), 1);
        queue.add_entry(ms(20), 2);
        queue.add_entry(ms(45), 3);
        clock.advance(ms(25));
        assert_eq!(queue.time_to_next_alarm(), DelayInterval::ZERO);
        assert_eq!(deltas(&queue), vec![ms(0), ms(0), ms(20)]);
    }

    #[test]
    fn time_to_next_alarm_short_circuits_on_zero_head() {
        let (mut queue, clock) = queue();
        queue.add_entry(DelayInterval::ZERO, 1);
        queue.add_entry(ms(10), 2);
        clock.advance(ms(5));
        // head already zero: no sync, second entry untouched
        assert_eq!(queue.time_to_next_alarm(), DelayInterval::ZERO);
        assert_eq!(deltas(&queue), vec![ms(0), ms(10)]);
    }

    #[test]
    fn backwards_clock_counts_as_no_elapsed_time() {
        let (mut queue, clock) = queue();
        queue.add_entry(ms(100), 1);
        clock.set(EventTime::new(500, 0));
        assert_eq!(queue.time_to_next_alarm(), ms(100));
        clock.advance(ms(60));
        assert_eq!(queue.time_to_next_alarm(), ms(40));
    }

    #[test]
    fn remove_folds_delta_into_successor() {
        let (mut queue, clock) = queue();
        queue.add_entry(ms(100), 1);
        let middle = queue.add_entry(ms(200), 2);
        queue.add_entry(ms(300), 3);

        assert_eq!(queue.remove_entry(middle), Some(2));
        assert_eq!(deltas(&queue), vec![ms(100), ms(200)]);
        assert_eq!(queue.remove_entry(middle), None);
        assert!(!queue.contains(middle));

        clock.advance(ms(300));
        assert_eq!(drain_due(&mut queue), vec![1, 3]);
    }

    #[test]
    fn update_moves_entry() {
        let (mut queue, clock) = queue();
        let first = queue.add_entry(ms(100), 1);
        queue.add_entry(ms(200), 2);

        assert!(queue.update_entry(first, ms(300)));
        clock.advance(ms(250));
        assert_eq!(drain_due(&mut queue), vec![2]);
        clock.advance(ms(50));
        assert_eq!(drain_due(&mut queue), vec![1]);
        assert!(!queue.update_entry(first, ms(10)));
    }

    #[test]
    fn tokens_increase_and_are_not_reused() {
        let (mut queue, clock) = queue();
        let a = queue.add_entry(ms(1), 1);
        let b = queue.add_entry(ms(1), 2);
        assert!(b > a);
        clock.advance(ms(1));
        drain_due(&mut queue);
        let c = queue.add_entry(ms(1), 3);
        assert!(c > b);
        assert_eq!(queue.remove_entry(a), None);
    }

    #[test]
    fn clear_drops_everything() {
        let (mut queue, _clock) = queue();
        for i in 0..10 {
            queue.add_entry(ms(i64::from(i)), i);
        }
        assert_eq!(queue.len(), 10);
        queue.clear();
        assert!(queue.is_empty());
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn cumulative_deltas_match_true_deadlines() {
        let mut rng = StdRng::seed_from_u64(42);
        let (mut queue, clock) = queue();
        let start = clock.now();
        // token -> absolute deadline in microseconds since start
        let mut deadlines: Vec<(TaskToken, i64)> = Vec::new();
        let mut elapsed = 0i64;

        for _ in 0..500 {
            match rng.gen_range(0..4) {
                0 | 1 => {
                    let delay = rng.gen_range(0..5_000_000i64);
                    let token = queue.add_entry(DelayInterval::from_micros(delay), 0);
                    deadlines.push((token, elapsed + delay));
                }
                2 if !deadlines.is_empty() => {
                    let (token, _) = deadlines.swap_remove(rng.gen_range(0..deadlines.len()));
                    assert!(queue.remove_entry(token).is_some());
                }
                _ => {
                    let step = rng.gen_range(0..200_000i64);
                    clock.advance_micros(step);
                    elapsed += step;
                    queue.time_to_next_alarm();
                }
            }
        }

        queue.synchronize();
        assert_eq!(clock.now() - start, DelayInterval::from_micros(elapsed));

        let mut expected: Vec<i64> = deadlines
            .iter()
            .map(|(_, deadline)| (deadline - elapsed).max(0))
            .collect();
        expected.sort_unstable();

        let mut sum = DelayInterval::ZERO;
        let cumulative: Vec<i64> = deltas(&queue)
            .into_iter()
            .map(|delta| {
                sum += delta;
                sum.as_micros()
            })
            .collect();
        assert_eq!(cumulative, expected);
    }
}
