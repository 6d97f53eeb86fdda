// SPDX-License-Identifier: MPL-2.0

//! Command buffer completion tracking.
//!
//! Every submitted command buffer is tagged with the current fence value, after which the value
//! advances. The backend signals completion on whatever thread it likes, and completions may
//! arrive out of submission order, so the completed watermark is raised with a max-merge and never
//! moves backwards.

use std::{
    sync::{Arc, Mutex, PoisonError},
    thread,
};

/// Merges a completion into a watermark.
pub fn advance(watermark: u64, fence: u64) -> u64 {
    watermark.max(fence)
}

#[derive(Debug)]
pub struct FenceTracker {
    current: u64,
    completed: Arc<Mutex<u64>>,
}

impl Default for FenceTracker {
    fn default() -> Self {
        Self {
            current: 1,
            completed: Arc::new(Mutex::new(0)),
        }
    }
}

impl FenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// The fence value of the command buffer currently being built.
    pub fn current(&self) -> u64 {
        self.current
    }

    pub fn completed(&self) -> u64 {
        *self.completed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_complete(&self, fence: u64) -> bool {
        self.completed() >= fence
    }

    /// Assigns the current fence value to the command buffer about to be submitted and moves on to
    /// the next one.
    pub fn begin_submission(&mut self) -> CompletionSignal {
        let fence = self.current;
        self.current += 1;

        CompletionSignal {
            fence,
            watermark: Arc::clone(&self.completed),
        }
    }

    /// Blocks until `fence` has completed, calling `poll` between checks.
    ///
    /// Returns `false` without waiting if `fence` has not been submitted, as it could never
    /// complete.
    pub fn wait_for(&self, fence: u64, mut poll: impl FnMut()) -> bool {
        if fence >= self.current {
            tracing::error!(
                "Refusing to wait for fence {} (current is {})",
                fence,
                self.current,
            );
            return false;
        }

        while !self.is_complete(fence) {
            poll();
            thread::yield_now();
        }

        true
    }
}

/// Raises the completed watermark when a command buffer finishes.
#[derive(Debug)]
pub struct CompletionSignal {
    fence: u64,
    watermark: Arc<Mutex<u64>>,
}

impl CompletionSignal {
    pub fn fence(&self) -> u64 {
        self.fence
    }

    pub fn signal(self) {
        let mut watermark = self.watermark.lock().unwrap_or_else(PoisonError::into_inner);
        *watermark = advance(*watermark, self.fence);
    }
}

#[cfg(test)]
mod tests {
    use rand::seq::SliceRandom as _;

    use super::*;

    #[test]
    fn advance_is_max_merge() {
        for _ in 0..1000 {
            let w: u64 = rand::random::<u16>().into();
            let a: u64 = rand::random::<u16>().into();
            let b: u64 = rand::random::<u16>().into();
            assert_eq!(advance(advance(w, a), b), advance(w, a.max(b)));
            assert!(advance(w, a) >= w);
        }
    }

    #[test]
    fn out_of_order_completions_never_lower_the_watermark() {
        let mut fences = FenceTracker::new();
        let one = fences.begin_submission();
        let two = fences.begin_submission();
        let three = fences.begin_submission();
        assert_eq!((one.fence(), two.fence(), three.fence()), (1, 2, 3));
        assert_eq!(fences.current(), 4);

        two.signal();
        assert_eq!(fences.completed(), 2);
        one.signal();
        assert_eq!(fences.completed(), 2);
        three.signal();
        assert_eq!(fences.completed(), 3);
    }

    #[test]
    fn random_completion_order_ends_at_last_fence() {
        let mut fences = FenceTracker::new();
        let mut signals: Vec<_> = (0..64).map(|_| fences.begin_submission()).collect();
        signals.shuffle(&mut rand::thread_rng());

        let mut highest = 0;
        for signal in signals {
            highest = highest.max(signal.fence());
            signal.signal();
            assert_eq!(fences.completed(), highest);
        }
        assert_eq!(fences.completed(), 64);
    }

    #[test]
    fn completion_from_another_thread_ends_wait() {
        let mut fences = FenceTracker::new();
        let signal = fences.begin_submission();
        let worker = thread::spawn(move || signal.signal());

        assert!(fences.wait_for(1, || {}));
        worker.join().unwrap();
        assert!(fences.is_complete(1));
    }

    #[test]
    fn waiting_for_unsubmitted_fence_returns_immediately() {
        let fences = FenceTracker::new();
        assert!(!fences.wait_for(1, || panic!("should not poll")));
    }
}
