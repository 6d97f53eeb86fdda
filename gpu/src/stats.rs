// SPDX-License-Identifier: MPL-2.0

/// Counters of device work, reset on demand.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Statistics {
    /// Bytes committed to any stream buffer.
    pub buffer_streamed: u64,
    pub num_draws: u32,
    pub num_render_passes: u32,
    pub num_copies: u32,
    pub num_uploads: u32,
    pub num_submissions: u32,
}

impl Statistics {
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
