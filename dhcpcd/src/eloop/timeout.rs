//! Deadline-ordered timeout queue.

use super::Eloop;
use std::time::Instant;

/// Deferred callback.
pub(crate) type Action = Box<dyn FnOnce(&mut Eloop)>;

/// A pending timeout.
pub(crate) struct Timeout {
    /// Absolute monotonic deadline.
    pub when: Instant,
    /// Queue tag for bulk cancellation.
    pub queue: u32,
    /// Callback identity.
    pub callback: &'static str,
    /// Opaque argument identity.
    pub arg: u64,
    pub action: Action,
}

/// Timeouts sorted ascending by deadline.
///
/// There is at most one timeout per `(callback, arg)` pair.
#[derive(Default)]
pub(crate) struct Timeouts(Vec<Timeout>);

impl Timeouts {
    /// Insert the timeout, replacing any entry with the same identity.
    pub fn insert(&mut self, timeout: Timeout) {
        self.0
            .retain(|t| !(t.callback == timeout.callback && t.arg == timeout.arg));
        // Entries with an equal deadline keep their insertion order.
        let pos = self.0.partition_point(|t| t.when <= timeout.when);
        self.0.insert(pos, timeout);
    }

    /// Delete all timeouts matching the queue (0 for all), the
    /// callback (`None` for any) and the argument.
    pub fn delete(&mut self, queue: u32, callback: Option<&str>, arg: u64) -> usize {
        let before = self.0.len();
        self.0.retain(|t| {
            !((queue == 0 || t.queue == queue)
                && t.arg == arg
                && callback.map_or(true, |cb| cb == t.callback))
        });
        before - self.0.len()
    }

    /// Deadline of the first timeout.
    pub fn first(&self) -> Option<Instant> {
        self.0.first().map(|t| t.when)
    }

    /// Remove the oldest timeout if it expired.
    pub fn pop_expired(&mut self, now: Instant) -> Option<Timeout> {
        match self.0.first() {
            Some(t) if t.when <= now => Some(self.0.remove(0)),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Timeout> {
        self.0.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::{Timeout, Timeouts};
    use std::time::{Duration, Instant};

    fn timeout(base: Instant, millis: u64, callback: &'static str, arg: u64) -> Timeout {
        Timeout {
            when: base + Duration::from_millis(millis),
            queue: 1,
            callback,
            arg,
            action: Box::new(|_| {}),
        }
    }

    #[test]
    fn test_sorted() {
        let base = Instant::now();
        let mut timeouts = Timeouts::default();

        for (i, millis) in [500, 20, 300, 20, 0, 900, 100].iter().enumerate() {
            timeouts.insert(timeout(base, *millis, "cb", i as u64));
            let deadlines = timeouts.iter().map(|t| t.when).collect::<Vec<_>>();
            assert!(deadlines.windows(2).all(|w| w[0] <= w[1]));
        }
        assert_eq!(timeouts.len(), 7);
    }

    #[test]
    fn test_replace() {
        let base = Instant::now();
        let mut timeouts = Timeouts::default();

        timeouts.insert(timeout(base, 100, "probe", 1));
        timeouts.insert(timeout(base, 200, "other", 1));
        timeouts.insert(timeout(base, 300, "probe", 1));

        assert_eq!(timeouts.len(), 2);
        let probe = timeouts.iter().find(|t| t.callback == "probe").unwrap();
        assert_eq!(probe.when, base + Duration::from_millis(300));
        assert_eq!(timeouts.iter().next().unwrap().callback, "other");
    }

    #[test]
    fn test_delete() {
        let base = Instant::now();
        let mut timeouts = Timeouts::default();

        timeouts.insert(timeout(base, 100, "a", 1));
        timeouts.insert(timeout(base, 100, "b", 1));
        timeouts.insert(timeout(base, 100, "a", 2));

        assert_eq!(timeouts.delete(2, None, 1), 0);
        assert_eq!(timeouts.delete(1, Some("a"), 1), 1);
        assert_eq!(timeouts.delete(0, None, 1), 1);
        assert_eq!(timeouts.len(), 1);
        assert!(timeouts.pop_expired(base).is_none());
        assert!(timeouts
            .pop_expired(base + Duration::from_millis(100))
            .is_some());
        assert!(timeouts.is_empty());
    }
}
