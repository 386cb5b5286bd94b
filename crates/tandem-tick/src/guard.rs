use tokio::sync::oneshot;
use tracing::trace;

type Predicate<S> = Box<dyn Fn(&S) -> bool + Send>;

struct Guard<S> {
    id: u64,
    predicate: Predicate<S>,
    waiter: oneshot::Sender<()>,
}

/// Resolves when its guard's condition holds. Resolves with an error if the
/// guard set is cleared or dropped first.
pub type GuardWaiter = oneshot::Receiver<()>;

/// A set of pending "wait until" conditions over some state `S`.
///
/// The owner of `S` calls [`check`](Self::check) once per tick. Every guard
/// whose predicate holds is resolved and removed, in registration order.
/// Guards whose waiter has gone away are pruned on the same pass.
pub struct GuardSet<S> {
    guards: Vec<Guard<S>>,
    next_id: u64,
}

impl<S> Default for GuardSet<S> {
    fn default() -> Self {
        Self {
            guards: Vec::new(),
            next_id: 0,
        }
    }
}

impl<S> GuardSet<S> {
    /// An empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a condition and returns the future that resolves once it
    /// holds on a tick.
    pub fn register(&mut self, predicate: impl Fn(&S) -> bool + Send + 'static) -> GuardWaiter {
        let (waiter, rx) = oneshot::channel();
        self.next_id += 1;
        self.guards.push(Guard {
            id: self.next_id,
            predicate: Box::new(predicate),
            waiter,
        });
        rx
    }

    /// Evaluates every pending guard against `state`. Returns how many
    /// were resolved.
    pub fn check(&mut self, state: &S) -> usize {
        let mut resolved = 0;
        self.guards.retain_mut(|guard| {
            if guard.waiter.is_closed() {
                trace!(guard = guard.id, "guard abandoned");
                return false;
            }
            if !(guard.predicate)(state) {
                return true;
            }
            // Swap out the sender so it can be consumed.
            let (placeholder, _) = oneshot::channel();
            let waiter = std::mem::replace(&mut guard.waiter, placeholder);
            let _ = waiter.send(());
            trace!(guard = guard.id, "guard resolved");
            resolved += 1;
            false
        });
        resolved
    }

    /// Drops every pending guard; their waiters see an error.
    pub fn clear(&mut self) {
        self.guards.clear();
    }

    /// Pending guards.
    pub fn len(&self) -> usize {
        self.guards.len()
    }

    /// `true` if nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.guards.is_empty()
    }
}

impl<S> std::fmt::Debug for GuardSet<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuardSet")
            .field("pending", &self.guards.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_resolves_only_satisfied_guards() {
        let mut guards = GuardSet::<u32>::new();
        let mut low = guards.register(|v| *v >= 1);
        let mut high = guards.register(|v| *v >= 10);

        assert_eq!(guards.check(&0), 0);
        assert_eq!(guards.check(&5), 1);
        assert!(low.try_recv().is_ok());
        assert!(high.try_recv().is_err());
        assert_eq!(guards.len(), 1);

        assert_eq!(guards.check(&10), 1);
        assert!(high.try_recv().is_ok());
        assert!(guards.is_empty());
    }

    #[test]
    fn test_check_prunes_dropped_waiters() {
        let mut guards = GuardSet::<bool>::new();
        drop(guards.register(|v| *v));
        assert_eq!(guards.len(), 1);
        assert_eq!(guards.check(&false), 0);
        assert!(guards.is_empty());
    }

    #[test]
    fn test_clear_fails_waiters() {
        let mut guards = GuardSet::<bool>::new();
        let mut waiter = guards.register(|v| *v);
        guards.clear();
        assert!(matches!(
            waiter.try_recv(),
            Err(oneshot::error::TryRecvError::Closed)
        ));
    }
}
