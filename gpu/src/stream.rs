// SPDX-License-Identifier: MPL-2.0

//! Fixed-size ring buffers for per-frame data.
//!
//! A [`StreamBuffer`] hands out host-writable regions of a GPU-visible buffer. Each commit records
//! the fence of the command buffer being built along with the write offset reached, so once that
//! fence completes the GPU is known to have consumed everything up to that offset.
//!
//! A reservation never straddles the end of the buffer. When the remaining linear space is too
//! small, the buffer wraps to offset 0 if the GPU has moved far enough ahead, asks the caller to
//! wait for a submitted fence that would free enough space, or fails so the caller can submit the
//! command buffer it is building and try again.

use std::{collections::VecDeque, ops::Range};

use umbra_util::align_up;

use crate::{backend::BufferId, fence::FenceTracker, release::Handle};

/// The outcome of [`StreamBuffer::reserve`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Reservation {
    /// Space is available at [`StreamBuffer::current_offset`].
    Ready,
    /// Space becomes available once this (already submitted) fence completes.
    WaitFor(u64),
    /// The command buffer being built holds too much of the buffer. It must be submitted first.
    Full,
}

pub struct StreamBuffer {
    buffer: Handle<BufferId>,
    host: Vec<u8>,
    size: u32,
    current_offset: u32,
    current_space: u32,
    current_gpu_position: u32,
    /// `(fence, offset)` pairs, oldest first.
    tracked_fences: VecDeque<(u64, u32)>,
}

impl StreamBuffer {
    pub fn new(buffer: Handle<BufferId>, size: u32) -> Self {
        Self {
            buffer,
            host: vec![0; size as usize],
            size,
            current_offset: 0,
            current_space: 0,
            current_gpu_position: 0,
            tracked_fences: VecDeque::new(),
        }
    }

    pub fn buffer(&self) -> BufferId {
        self.buffer.id()
    }

    pub(crate) fn handle_mut(&mut self) -> &mut Handle<BufferId> {
        &mut self.buffer
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn current_offset(&self) -> u32 {
        self.current_offset
    }

    /// Bytes writable at the current offset after a successful reservation.
    pub fn current_space(&self) -> u32 {
        self.current_space
    }

    /// The host-writable region of the last successful reservation.
    pub fn host_mut(&mut self) -> &mut [u8] {
        let start = self.current_offset as usize;
        let end = start + self.current_space as usize;

        &mut self.host[start..end]
    }

    pub fn host(&self, range: Range<u32>) -> &[u8] {
        &self.host[(range.start as usize)..(range.end as usize)]
    }

    pub fn reserve(
        &mut self,
        num_bytes: u32,
        alignment: u32,
        fences: &FenceTracker,
    ) -> Reservation {
        let alignment = alignment.max(1);
        let required = num_bytes.saturating_add(alignment);
        if required > self.size {
            tracing::error!(
                "Attempting to reserve {} bytes from a {} byte stream buffer",
                num_bytes,
                self.size,
            );
            return Reservation::Full;
        }

        self.update_gpu_position(fences.completed());

        if self.current_offset >= self.current_gpu_position {
            // We're in front of the GPU.
            let remaining = self.size - self.current_offset;
            if required <= remaining {
                self.current_offset = align_up(self.current_offset, alignment);
                self.current_space = self.size - self.current_offset;
                return Reservation::Ready;
            }

            // Strictly less, so that the offset never catches up with the GPU position; equality
            // would read as "the GPU has consumed everything".
            if required < self.current_gpu_position {
                self.current_offset = 0;
                self.current_space = self.current_gpu_position - 1;
                return Reservation::Ready;
            }
        }

        if self.current_offset < self.current_gpu_position {
            // We're behind the GPU, after wrapping.
            let remaining = self.current_gpu_position - self.current_offset;
            if required < remaining {
                self.current_offset = align_up(self.current_offset, alignment);
                self.current_space = self.current_gpu_position - self.current_offset - 1;
                return Reservation::Ready;
            }
        }

        self.find_fence_to_wait_for(required, fences.current())
    }

    /// Advances the write cursor past `num_bytes` of the last reservation and returns the written
    /// range.
    pub fn commit(&mut self, num_bytes: u32, fences: &FenceTracker) -> Range<u32> {
        debug_assert!(
            num_bytes <= self.current_space,
            "committing {} bytes of a {} byte reservation",
            num_bytes,
            self.current_space,
        );
        let num_bytes = num_bytes.min(self.current_space);

        let start = self.current_offset;
        if num_bytes == 0 {
            return start..start;
        }

        self.current_offset += num_bytes;
        self.current_space -= num_bytes;
        self.update_current_fence_position(fences.current());

        start..self.current_offset
    }

    fn update_current_fence_position(&mut self, fence: u64) {
        match self.tracked_fences.back_mut() {
            Some((last, offset)) if *last == fence => *offset = self.current_offset,
            _ => self.tracked_fences.push_back((fence, self.current_offset)),
        }
    }

    fn update_gpu_position(&mut self, completed: u64) {
        while let Some(&(fence, offset)) = self.tracked_fences.front() {
            if fence > completed {
                break;
            }
            self.current_gpu_position = offset;
            self.tracked_fences.pop_front();
        }

        if self.tracked_fences.is_empty() {
            // Nothing written is still in flight, so the whole buffer is free.
            self.current_offset = 0;
            self.current_gpu_position = 0;
        }
    }

    /// Finds the oldest submitted fence whose completion would leave `required` bytes free.
    fn find_fence_to_wait_for(&self, required: u32, current_fence: u64) -> Reservation {
        for &(fence, gpu_position) in &self.tracked_fences {
            if fence >= current_fence {
                // Everything from here on belongs to the command buffer being built.
                break;
            }

            let fits = if self.current_offset == gpu_position {
                // The GPU would have consumed everything we've written.
                true
            } else if self.current_offset > gpu_position {
                (self.size - self.current_offset) >= required || gpu_position > required
            } else {
                (gpu_position - self.current_offset) > required
            };

            if fits {
                return Reservation::WaitFor(fence);
            }
        }

        Reservation::Full
    }
}

impl std::fmt::Debug for StreamBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamBuffer")
            .field("buffer", &self.buffer)
            .field("size", &self.size)
            .field("current_offset", &self.current_offset)
            .field("current_space", &self.current_space)
            .field("current_gpu_position", &self.current_gpu_position)
            .field("tracked_fences", &self.tracked_fences.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use rand::Rng as _;

    use super::*;
    use crate::fence::CompletionSignal;

    fn stream(size: u32) -> StreamBuffer {
        let (tx, rx) = crossbeam_channel::unbounded();
        // Keep the receiver alive for the duration of the test.
        std::mem::forget(rx);

        StreamBuffer::new(Handle::new(BufferId(0), tx), size)
    }

    fn reserve_and_commit(sb: &mut StreamBuffer, fences: &FenceTracker, size: u32) -> u32 {
        assert_eq!(sb.reserve(size, 1, fences), Reservation::Ready);
        let offset = sb.current_offset();
        sb.commit(size, fences);

        offset
    }

    #[test]
    fn reservation_fails_before_wrap_and_succeeds_after_flush() {
        let mut fences = FenceTracker::new();
        let mut sb = stream(4096);

        assert_eq!(reserve_and_commit(&mut sb, &fences, 1000), 0);
        assert_eq!(reserve_and_commit(&mut sb, &fences, 1000), 1000);
        assert_eq!(reserve_and_commit(&mut sb, &fences, 1000), 2000);

        // Everything written belongs to the unsubmitted command buffer.
        assert_eq!(sb.reserve(1200, 1, &fences), Reservation::Full);

        // Submit and let the GPU finish.
        fences.begin_submission().signal();

        assert_eq!(sb.reserve(1200, 1, &fences), Reservation::Ready);
        assert_eq!(sb.current_offset(), 0);
    }

    #[test]
    fn asks_to_wait_for_submitted_fence() {
        let mut fences = FenceTracker::new();
        let mut sb = stream(4096);

        reserve_and_commit(&mut sb, &fences, 3000);
        let signal = fences.begin_submission();

        assert_eq!(sb.reserve(1200, 1, &fences), Reservation::WaitFor(1));
        signal.signal();
        assert_eq!(sb.reserve(1200, 1, &fences), Reservation::Ready);
        assert_eq!(sb.current_offset(), 0);
    }

    #[test]
    fn wraps_behind_gpu() {
        let mut fences = FenceTracker::new();
        let mut sb = stream(4096);

        reserve_and_commit(&mut sb, &fences, 2000);
        fences.begin_submission().signal();
        // Fence 2 is still building.
        reserve_and_commit(&mut sb, &fences, 1000);
        assert_eq!(sb.current_offset(), 1000);

        reserve_and_commit(&mut sb, &fences, 2000);
        let _in_flight = fences.begin_submission();
        assert_eq!(sb.current_offset(), 3000);

        // The GPU position is 0 until fence 2 completes, so only the linear tail is usable.
        assert_eq!(sb.reserve(1000, 1, &fences), Reservation::Ready);
        assert_eq!(sb.current_offset(), 3000);
        assert_eq!(sb.current_space(), 1096);
    }

    #[test]
    fn alignment_is_applied_to_offset() {
        let fences = FenceTracker::new();
        let mut sb = stream(1024);

        reserve_and_commit(&mut sb, &fences, 3);
        assert_eq!(sb.reserve(16, 256, &fences), Reservation::Ready);
        assert_eq!(sb.current_offset(), 256);
        assert_eq!(sb.current_space(), 768);
    }

    #[test]
    fn oversized_request_is_full() {
        let fences = FenceTracker::new();
        let mut sb = stream(512);

        assert_eq!(sb.reserve(512, 4, &fences), Reservation::Full);
    }

    #[test]
    fn commit_returns_written_range() {
        let fences = FenceTracker::new();
        let mut sb = stream(256);

        assert_eq!(sb.reserve(8, 4, &fences), Reservation::Ready);
        sb.host_mut()[..8].copy_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
        let range = sb.commit(8, &fences);

        assert_eq!(range, 0..8);
        assert_eq!(sb.host(range), &[1, 2, 3, 4, 5, 6, 7, 8]);
    }

    /// Randomized reserve/commit/submit/complete sequences, checking that a fresh reservation never
    /// overlaps bytes committed under a fence that hasn't completed.
    #[test]
    fn live_regions_never_overlap() {
        const SIZE: u32 = 2048;

        let mut rng = rand::thread_rng();
        let mut fences = FenceTracker::new();
        let mut sb = stream(SIZE);
        let mut in_flight: VecDeque<CompletionSignal> = VecDeque::new();
        let mut live: Vec<(u64, Range<u32>)> = Vec::new();

        for _ in 0..5000 {
            let size = rng.gen_range(1..=400);
            let alignment = [1, 4, 16, 256][rng.gen_range(0..4)];

            let mut submitted = false;
            loop {
                match sb.reserve(size, alignment, &fences) {
                    Reservation::Ready => break,
                    Reservation::WaitFor(fence) => {
                        while !fences.is_complete(fence) {
                            in_flight.pop_front().unwrap().signal();
                        }
                    }
                    Reservation::Full => {
                        assert!(!submitted, "reservation failed twice");
                        in_flight.push_back(fences.begin_submission());
                        while let Some(signal) = in_flight.pop_front() {
                            signal.signal();
                        }
                        submitted = true;
                    }
                }
            }

            let completed = fences.completed();
            live.retain(|(fence, _)| *fence > completed);

            let start = sb.current_offset();
            let end = start + size;
            assert!(end <= SIZE);
            for (_, range) in &live {
                assert!(
                    end <= range.start || start >= range.end,
                    "{:?} overlaps live {:?}",
                    start..end,
                    range,
                );
            }

            let range = sb.commit(size, &fences);
            live.push((fences.current(), range));

            match rng.gen_range(0..10) {
                0..=2 => in_flight.push_back(fences.begin_submission()),
                3 => {
                    if let Some(signal) = in_flight.pop_front() {
                        signal.signal();
                    }
                }
                _ => {}
            }
        }
    }
}
