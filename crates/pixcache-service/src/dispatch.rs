//! Handing finished loads to the consumers that asked for them.
//!
//! Results are produced on worker units, but slots can only be touched from the consumer's own
//! execution context. The [`Dispatcher`] hops onto that context through a [`ConsumerContext`],
//! and only there checks whether the slot still wants the result.

use std::fmt;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::caching::ResourceKey;

/// A display slot that shows one image at a time.
///
/// The consumer sets the slot's interest synchronously before asking for a load, and may
/// change it at any time afterwards, for example when the slot is reused for another image.
pub trait Slot<R>: Send + Sync + 'static {
    /// The key of the image this slot currently wants to show.
    fn interest_key(&self) -> Option<ResourceKey>;

    /// Shows `resource`, which was loaded for `key`.
    fn apply(&self, key: &ResourceKey, resource: Arc<R>);

    /// Shows the default image while the real one is being loaded.
    fn show_placeholder(&self);
}

/// A job to run on the consumer's context.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// The execution context consumers require their slots to be touched from.
pub trait ConsumerContext: Send + Sync + 'static {
    /// Runs `job` on this context, now or later.
    fn run(&self, job: Job);
}

/// A [`ConsumerContext`] running jobs right away on the calling thread.
///
/// This fits consumers whose slots can be touched from any thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct InlineContext;

impl ConsumerContext for InlineContext {
    fn run(&self, job: Job) {
        job()
    }
}

/// A [`ConsumerContext`] sending jobs to a [`ContextReceiver`], drained by the consumer's own
/// loop.
#[derive(Clone)]
pub struct ChannelContext {
    tx: mpsc::UnboundedSender<Job>,
}

impl fmt::Debug for ChannelContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelContext")
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

impl ConsumerContext for ChannelContext {
    fn run(&self, job: Job) {
        if self.tx.send(job).is_err() {
            tracing::debug!("Consumer context is gone, dropping delivery");
        }
    }
}

/// The consumer's end of a [`ChannelContext`].
pub struct ContextReceiver {
    rx: mpsc::UnboundedReceiver<Job>,
}

impl fmt::Debug for ContextReceiver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextReceiver")
            .field("pending", &self.rx.len())
            .finish()
    }
}

impl ContextReceiver {
    /// Runs all jobs that are currently queued, returning how many ran.
    pub fn run_pending(&mut self) -> usize {
        let mut ran = 0;
        while let Ok(job) = self.rx.try_recv() {
            job();
            ran += 1;
        }
        ran
    }

    /// Runs the next job, waiting for one to arrive.
    ///
    /// Returns `false` once all [`ChannelContext`]s are gone.
    pub async fn run_next(&mut self) -> bool {
        match self.rx.recv().await {
            Some(job) => {
                job();
                true
            }
            None => false,
        }
    }

    /// Runs jobs until all [`ChannelContext`]s are gone.
    pub async fn run(mut self) {
        while self.run_next().await {}
    }
}

/// Creates a [`ChannelContext`] and the receiver that runs its jobs.
pub fn channel_context() -> (ChannelContext, ContextReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ChannelContext { tx }, ContextReceiver { rx })
}

/// Delivers results on the consumer's context.
#[derive(Clone)]
pub struct Dispatcher {
    context: Arc<dyn ConsumerContext>,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher").finish_non_exhaustive()
    }
}

impl Dispatcher {
    pub fn new(context: impl ConsumerContext) -> Self {
        Self {
            context: Arc::new(context),
        }
    }

    /// Delivers `resource` to `slot` on the consumer's context.
    ///
    /// The slot only gets the resource if it is still interested in `key` by the time the job
    /// runs on the consumer's context.
    pub fn deliver<R>(&self, slot: Arc<dyn Slot<R>>, key: ResourceKey, resource: Arc<R>)
    where
        R: Send + Sync + 'static,
    {
        self.context.run(Box::new(move || {
            apply_if_interested(&*slot, &key, resource);
        }))
    }
}

/// Applies `resource` to `slot` if the slot still wants `key`.
///
/// This must run on the consumer's context.
pub fn apply_if_interested<R: Send + Sync + 'static>(
    slot: &dyn Slot<R>,
    key: &ResourceKey,
    resource: Arc<R>,
) -> bool {
    match slot.interest_key() {
        Some(interest) if interest == *key => {
            slot.apply(key, resource);
            metric!(counter("loads.delivered") += 1);
            true
        }
        interest => {
            tracing::trace!(
                %key,
                interest = interest.as_ref().map(ResourceKey::as_str),
                "Slot moved on, dropping stale result"
            );
            metric!(counter("loads.stale") += 1);
            false
        }
    }
}
