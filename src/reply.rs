use std::any::Any;
use std::mem;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// Result of a `reply` call as seen by the reaction body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReplyStatus {
    /// The waiter was still present and received the value.
    Accepted,
    /// The waiter had already timed out; the value was dropped.
    AfterTimeout,
    /// A reply was already delivered. Protocol violation.
    AlreadyReplied,
}

/// What the blocking emitter observes when its wait ends.
pub(crate) enum ReplyOutcome<R> {
    Replied(R),
    TimedOut,
    Failed(String),
}

enum State<R> {
    Waiting,
    Replied(R),
    /// The waiter consumed the reply and went away.
    Delivered,
    TimedOut,
    Failed(String),
}

/// Single-use reply channel created for each blocking emission.
///
/// Exactly one transition leaves `Waiting`: a reply, the waiter's timeout,
/// or a failure injected by the reaction completion hook. The emitting
/// thread parks on the condvar until that transition happens.
pub(crate) struct ReplySlot<R> {
    state: Mutex<State<R>>,
    wakeup: Condvar,
}

impl<R: Send + 'static> ReplySlot<R> {
    pub(crate) fn new() -> ReplySlot<R> {
        ReplySlot {
            state: Mutex::new(State::Waiting),
            wakeup: Condvar::new(),
        }
    }

    pub(crate) fn reply(&self, value: R) -> ReplyStatus {
        let mut state = self.state.lock();
        match &*state {
            State::Waiting => {
                *state = State::Replied(value);
                self.wakeup.notify_one();
                ReplyStatus::Accepted
            }
            State::TimedOut => ReplyStatus::AfterTimeout,
            State::Replied(_) | State::Delivered | State::Failed(_) => ReplyStatus::AlreadyReplied,
        }
    }

    /// Blocks until the slot leaves `Waiting`. With a timeout, the slot
    /// transitions to `TimedOut` on expiry; a reply that lost the race is
    /// dropped by the replier, not here.
    pub(crate) fn await_reply(&self, timeout: Option<Duration>) -> ReplyOutcome<R> {
        let mut state = self.state.lock();
        loop {
            match mem::replace(&mut *state, State::Delivered) {
                State::Replied(value) => return ReplyOutcome::Replied(value),
                State::Failed(reason) => {
                    *state = State::Failed(reason.clone());
                    return ReplyOutcome::Failed(reason);
                }
                State::TimedOut => {
                    *state = State::TimedOut;
                    return ReplyOutcome::TimedOut;
                }
                State::Waiting => *state = State::Waiting,
                State::Delivered => unreachable!("reply consumed twice"),
            }
            match timeout {
                None => self.wakeup.wait(&mut state),
                Some(timeout) => {
                    if self.wakeup.wait_for(&mut state, timeout).timed_out() {
                        if matches!(&*state, State::Waiting) {
                            *state = State::TimedOut;
                            return ReplyOutcome::TimedOut;
                        }
                        // a transition raced the timeout; loop once more to
                        // pick it up
                    }
                }
            }
        }
    }
}

/// Type-erased view of a reply slot, stored inside a `MolValue` and used by
/// the reaction completion hook, which does not know `R`.
pub(crate) trait ErasedReply: Any + Send + Sync {
    /// `Waiting` -> `Failed(reason)`; returns whether the transition happened.
    fn fail(&self, reason: String) -> bool;
    fn has_replied(&self) -> bool;
    fn has_timed_out(&self) -> bool;
    fn as_any(&self) -> &dyn Any;
}

impl<R: Send + Sync + 'static> ErasedReply for ReplySlot<R> {
    fn fail(&self, reason: String) -> bool {
        let mut state = self.state.lock();
        if matches!(&*state, State::Waiting) {
            *state = State::Failed(reason);
            self.wakeup.notify_one();
            true
        } else {
            false
        }
    }

    fn has_replied(&self) -> bool {
        matches!(
            &*self.state.lock(),
            State::Replied(_) | State::Delivered
        )
    }

    fn has_timed_out(&self) -> bool {
        matches!(&*self.state.lock(), State::TimedOut)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use super::*;

    #[test]
    fn reply_wakes_waiter() {
        let slot = Arc::new(ReplySlot::<i32>::new());
        let replier = slot.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            replier.reply(42)
        });
        match slot.await_reply(None) {
            ReplyOutcome::Replied(v) => assert_eq!(v, 42),
            _ => panic!("expected a reply"),
        }
        assert_eq!(handle.join().unwrap(), ReplyStatus::Accepted);
        assert!(slot.has_replied());
    }

    #[test]
    fn timeout_then_reply_is_detected() {
        let slot = ReplySlot::<i32>::new();
        match slot.await_reply(Some(Duration::from_millis(5))) {
            ReplyOutcome::TimedOut => {}
            _ => panic!("expected timeout"),
        }
        assert!(slot.has_timed_out());
        assert_eq!(slot.reply(1), ReplyStatus::AfterTimeout);
    }

    #[test]
    fn second_reply_is_a_violation() {
        let slot = Arc::new(ReplySlot::<&'static str>::new());
        let replier = slot.clone();
        let handle = thread::spawn(move || {
            assert_eq!(replier.reply("first"), ReplyStatus::Accepted);
            replier.reply("second")
        });
        match slot.await_reply(Some(Duration::from_secs(1))) {
            ReplyOutcome::Replied(v) => assert_eq!(v, "first"),
            _ => panic!("expected a reply"),
        }
        assert_eq!(handle.join().unwrap(), ReplyStatus::AlreadyReplied);
    }

    #[test]
    fn failure_unblocks_with_reason() {
        let slot = Arc::new(ReplySlot::<()>::new());
        let failer = slot.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            assert!(failer.fail("no reply".to_owned()));
        });
        match slot.await_reply(None) {
            ReplyOutcome::Failed(reason) => assert_eq!(reason, "no reply"),
            _ => panic!("expected failure"),
        }
    }
}
