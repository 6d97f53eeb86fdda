// SPDX-License-Identifier: MPL-2.0

//! Deferred destruction of GPU objects.
//!
//! Dropping a [`Handle`] does not destroy the object it names; it sends the object to the device,
//! which tags it with the fence of the command buffer currently being built and keeps it in a
//! [`DeferredReleaseQueue`] until that fence has completed.

use std::{collections::VecDeque, fmt};

use crate::backend::{BufferId, DepthStateId, PipelineId, SamplerId, ShaderId, TextureId};

/// A GPU object whose destruction has been requested.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Release {
    Buffer(BufferId),
    Texture(TextureId),
    Sampler(SamplerId),
    Shader(ShaderId),
    Pipeline(PipelineId),
    DepthState(DepthStateId),
}

macro_rules! impl_into_release {
    ($($id:ident => $variant:ident),* $(,)?) => {
        $(
            impl From<$id> for Release {
                fn from(id: $id) -> Self {
                    Self::$variant(id)
                }
            }
        )*
    };
}

impl_into_release!(
    BufferId => Buffer,
    TextureId => Texture,
    SamplerId => Sampler,
    ShaderId => Shader,
    PipelineId => Pipeline,
    DepthStateId => DepthState,
);

pub type ReleaseSender = crossbeam_channel::Sender<Release>;
pub type ReleaseReceiver = crossbeam_channel::Receiver<Release>;

/// Exclusive ownership of a backend object.
///
/// When the handle is dropped, ownership of the object passes to the device's release queue.
pub struct Handle<T: Copy + Into<Release> + fmt::Debug> {
    id: T,
    sink: Option<ReleaseSender>,
}

impl<T: Copy + Into<Release> + fmt::Debug> Handle<T> {
    pub(crate) fn new(id: T, sink: ReleaseSender) -> Self {
        Self { id, sink: Some(sink) }
    }

    pub fn id(&self) -> T {
        self.id
    }

    /// Detaches the handle from the release queue, leaving the caller responsible for the object.
    pub(crate) fn forget(&mut self) -> T {
        self.sink = None;

        self.id
    }
}

impl<T: Copy + Into<Release> + fmt::Debug> Drop for Handle<T> {
    fn drop(&mut self) {
        if let Some(sink) = self.sink.take() {
            if sink.send(self.id.into()).is_err() {
                tracing::warn!("{:?} was dropped after its device", self.id);
            }
        }
    }
}

impl<T: Copy + Into<Release> + fmt::Debug> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Handle").field(&self.id).finish()
    }
}

/// Objects waiting for their fence to complete.
///
/// Entries must be pushed in non-decreasing fence order; this holds naturally because fence values
/// only grow. That lets the queue be drained from the front.
#[derive(Debug)]
pub struct DeferredReleaseQueue<T> {
    entries: VecDeque<(u64, T)>,
}

impl<T> Default for DeferredReleaseQueue<T> {
    fn default() -> Self {
        Self { entries: VecDeque::new() }
    }
}

impl<T> DeferredReleaseQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, fence: u64, object: T) {
        debug_assert!(
            self.entries.back().map_or(true, |(last, _)| *last <= fence),
            "release queue fences must not decrease",
        );
        self.entries.push_back((fence, object));
    }

    /// Removes the oldest object if its fence is no later than `completed`.
    pub fn pop_completed(&mut self, completed: u64) -> Option<T> {
        match self.entries.front() {
            Some((fence, _)) if *fence <= completed => {
                self.entries.pop_front().map(|(_, object)| object)
            }
            _ => None,
        }
    }

    /// Removes every object regardless of its fence.
    pub fn drain_all(&mut self) -> impl Iterator<Item = T> + '_ {
        self.entries.drain(..).map(|(_, object)| object)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
