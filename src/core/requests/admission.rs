//! Priority-aware concurrency admission.
//!
//! A request runs immediately when both the global limit and its class limit
//! have room; otherwise it waits FIFO within its class. Freed slots are
//! offered to queued requests high → normal → low.

use std::collections::VecDeque;
use tokio::sync::oneshot;

use super::record::{Priority, RequestId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConcurrencyLimits {
    pub max_concurrent: usize,
    pub high: usize,
    pub normal: usize,
    pub low: usize,
}

impl ConcurrencyLimits {
    fn for_class(&self, priority: Priority) -> usize {
        match priority {
            Priority::High => self.high,
            Priority::Normal => self.normal,
            Priority::Low => self.low,
        }
    }
}

impl Default for ConcurrencyLimits {
    fn default() -> Self {
        Self {
            max_concurrent: 6,
            high: 4,
            normal: 4,
            low: 2,
        }
    }
}

struct Waiter {
    id: RequestId,
    admit: oneshot::Sender<()>,
}

pub(crate) struct Admission {
    limits: ConcurrencyLimits,
    running: [usize; 3],
    queues: [VecDeque<Waiter>; 3],
}

impl Admission {
    pub(crate) fn new(limits: ConcurrencyLimits) -> Self {
        Self {
            limits,
            running: [0; 3],
            queues: Default::default(),
        }
    }

    fn total_running(&self) -> usize {
        self.running.iter().sum()
    }

    fn has_room(&self, priority: Priority) -> bool {
        self.total_running() < self.limits.max_concurrent.max(1)
            && self.running[priority.index()] < self.limits.for_class(priority).max(1)
    }

    /// Claims a slot if one is free and nobody of the same class is already
    /// waiting ahead of us.
    pub(crate) fn try_admit(&mut self, priority: Priority) -> bool {
        if self.queues[priority.index()].is_empty() && self.has_room(priority) {
            self.running[priority.index()] += 1;
            true
        } else {
            false
        }
    }

    pub(crate) fn enqueue(&mut self, id: RequestId, priority: Priority) -> oneshot::Receiver<()> {
        let (admit, rx) = oneshot::channel();
        self.queues[priority.index()].push_back(Waiter { id, admit });
        rx
    }

    /// Drops a queued request. Returns `false` when it was already promoted
    /// (and therefore holds a slot).
    pub(crate) fn remove_waiter(&mut self, id: RequestId, priority: Priority) -> bool {
        let queue = &mut self.queues[priority.index()];
        match queue.iter().position(|waiter| waiter.id == id) {
            Some(position) => {
                queue.remove(position);
                true
            }
            None => false,
        }
    }

    pub(crate) fn release(&mut self, priority: Priority) {
        let slot = &mut self.running[priority.index()];
        *slot = slot.saturating_sub(1);
        self.promote();
    }

    fn promote(&mut self) {
        for priority in Priority::ALL {
            while self.has_room(priority) {
                let Some(waiter) = self.queues[priority.index()].pop_front() else {
                    break;
                };
                self.running[priority.index()] += 1;
                // A dropped receiver is settled by the waiter's own guard.
                let _ = waiter.admit.send(());
            }
        }
    }

    pub(crate) fn queued(&self) -> usize {
        self.queues.iter().map(VecDeque::len).sum()
    }

    #[cfg(test)]
    pub(crate) fn running(&self) -> usize {
        self.total_running()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(max: usize, high: usize, normal: usize, low: usize) -> ConcurrencyLimits {
        ConcurrencyLimits {
            max_concurrent: max,
            high,
            normal,
            low,
        }
    }

    #[test]
    fn admits_until_global_limit() {
        let mut admission = Admission::new(limits(2, 2, 2, 2));
        assert!(admission.try_admit(Priority::Normal));
        assert!(admission.try_admit(Priority::Low));
        assert!(!admission.try_admit(Priority::High));
        assert_eq!(admission.running(), 2);
    }

    #[test]
    fn class_limit_applies_independently() {
        let mut admission = Admission::new(limits(10, 1, 1, 1));
        assert!(admission.try_admit(Priority::Low));
        assert!(!admission.try_admit(Priority::Low));
        assert!(admission.try_admit(Priority::High));
    }

    #[test]
    fn release_drains_high_before_normal_before_low() {
        let mut admission = Admission::new(limits(1, 1, 1, 1));
        assert!(admission.try_admit(Priority::Normal));

        let mut low = admission.enqueue(RequestId(1), Priority::Low);
        let mut normal = admission.enqueue(RequestId(2), Priority::Normal);
        let mut high = admission.enqueue(RequestId(3), Priority::High);
        assert_eq!(admission.queued(), 3);

        admission.release(Priority::Normal);
        assert!(high.try_recv().is_ok());
        assert!(normal.try_recv().is_err());

        admission.release(Priority::High);
        assert!(normal.try_recv().is_ok());
        assert!(low.try_recv().is_err());

        admission.release(Priority::Normal);
        assert!(low.try_recv().is_ok());
        assert_eq!(admission.queued(), 0);
    }

    #[test]
    fn queue_is_fifo_within_a_class() {
        let mut admission = Admission::new(limits(1, 1, 1, 1));
        assert!(admission.try_admit(Priority::Normal));
        let mut first = admission.enqueue(RequestId(1), Priority::Normal);
        let mut second = admission.enqueue(RequestId(2), Priority::Normal);

        admission.release(Priority::Normal);
        assert!(first.try_recv().is_ok());
        assert!(second.try_recv().is_err());
    }

    #[test]
    fn removed_waiter_is_never_promoted() {
        let mut admission = Admission::new(limits(1, 1, 1, 1));
        assert!(admission.try_admit(Priority::High));
        let mut dropped = admission.enqueue(RequestId(7), Priority::Low);

        assert!(admission.remove_waiter(RequestId(7), Priority::Low));
        assert!(!admission.remove_waiter(RequestId(7), Priority::Low));
        admission.release(Priority::High);

        assert!(dropped.try_recv().is_err());
        assert_eq!(admission.running(), 0);
    }
}
