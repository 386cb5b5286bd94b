//! Ordered, removable subscriber lists.

use std::fmt;

/// Identifies one subscription so it can be removed later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

type Callback<E> = Box<dyn FnMut(&E) + Send>;

/// A publish/subscribe list for one event type.
///
/// Callbacks run synchronously in subscription order. A callback removed
/// with [`unsubscribe`](Self::unsubscribe) never runs again.
pub struct Subscribers<E> {
    entries: Vec<(SubscriptionId, Callback<E>)>,
    next_id: u64,
}

impl<E> Default for Subscribers<E> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            next_id: 0,
        }
    }
}

impl<E> Subscribers<E> {
    /// An empty list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a callback.
    pub fn subscribe(&mut self, callback: impl FnMut(&E) + Send + 'static) -> SubscriptionId {
        self.next_id += 1;
        let id = SubscriptionId(self.next_id);
        self.entries.push((id, Box::new(callback)));
        id
    }

    /// Removes a callback. Returns `false` if it was already gone.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(entry, _)| *entry != id);
        self.entries.len() != before
    }

    /// Calls every callback with `event`, in subscription order.
    pub fn publish(&mut self, event: &E) {
        for (_, callback) in &mut self.entries {
            callback(event);
        }
    }

    /// Number of live subscriptions.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// `true` if nobody is subscribed.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<E> fmt::Debug for Subscribers<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscribers")
            .field("len", &self.entries.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    #[test]
    fn test_publish_runs_in_subscription_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut subs = Subscribers::<u32>::new();
        for name in ["a", "b", "c"] {
            let seen = Arc::clone(&seen);
            subs.subscribe(move |v| seen.lock().unwrap().push(format!("{name}{v}")));
        }
        subs.publish(&1);
        assert_eq!(*seen.lock().unwrap(), vec!["a1", "b1", "c1"]);
    }

    #[test]
    fn test_unsubscribe_removes_only_that_callback() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut subs = Subscribers::<&'static str>::new();
        let first = {
            let seen = Arc::clone(&seen);
            subs.subscribe(move |v| seen.lock().unwrap().push(format!("first:{v}")))
        };
        {
            let seen = Arc::clone(&seen);
            subs.subscribe(move |v| seen.lock().unwrap().push(format!("second:{v}")));
        }

        assert!(subs.unsubscribe(first));
        assert!(!subs.unsubscribe(first));
        subs.publish(&"x");
        assert_eq!(*seen.lock().unwrap(), vec!["second:x"]);
        assert_eq!(subs.len(), 1);
    }
}
