//! The serialization domain every router runs its state machine in.
//!
//! All mutation of router, policy and pending-queue state happens inside
//! closures executed one at a time by a single task, in the order they were
//! submitted. Code running inside the domain therefore never needs locks
//! around that state, no matter how many threads submit work concurrently.

use std::{
    collections::VecDeque,
    future::Future,
    sync::{Arc, Mutex, PoisonError},
};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing_futures::Instrument;

type Work<S> = Box<dyn FnOnce(&mut S) + Send>;

/// Strong handle to a serialization domain owning a state `S`.
///
/// The domain lives as long as at least one strong handle exists. Once the
/// last one is dropped, the queued work drains and the state is dropped.
pub(crate) struct WorkSerializer<S> {
    sender: mpsc::UnboundedSender<Work<S>>,
}

/// Handle that does not keep the domain alive, held by the domain's own
/// components and by background tasks reporting back into it.
pub(crate) struct WeakWorkSerializer<S> {
    sender: mpsc::WeakUnboundedSender<Work<S>>,
}

impl<S: Send + 'static> WorkSerializer<S> {
    /// Start a domain whose state is built by `init`, which receives a weak
    /// handle to the domain being created.
    pub(crate) fn spawn<F>(span: tracing::Span, init: F) -> Self
    where
        F: FnOnce(WeakWorkSerializer<S>) -> S,
    {
        let (sender, mut receiver) = mpsc::unbounded_channel::<Work<S>>();
        let mut state = init(WeakWorkSerializer {
            sender: sender.downgrade(),
        });

        tokio::spawn(
            async move {
                while let Some(work) = receiver.recv().await {
                    work(&mut state);
                }
                tracing::debug!("work serializer drained, dropping state");
            }
            .instrument(span),
        );

        Self { sender }
    }

    /// Submit `work` to the domain. Returns `false` if the domain is gone, in
    /// which case `work` is dropped without running.
    pub(crate) fn run<F>(&self, work: F) -> bool
    where
        F: FnOnce(&mut S) + Send + 'static,
    {
        self.sender.send(Box::new(work)).is_ok()
    }

    pub(crate) fn downgrade(&self) -> WeakWorkSerializer<S> {
        WeakWorkSerializer {
            sender: self.sender.downgrade(),
        }
    }
}

impl<S: Send + 'static> WeakWorkSerializer<S> {
    /// Submit `work` if the domain is still alive.
    pub(crate) fn run<F>(&self, work: F) -> bool
    where
        F: FnOnce(&mut S) + Send + 'static,
    {
        match self.sender.upgrade() {
            Some(sender) => sender.send(Box::new(work)).is_ok(),
            None => false,
        }
    }
}

impl<S> Clone for WorkSerializer<S> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl<S> Clone for WeakWorkSerializer<S> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

/// Lets a component ask the domain to call back into its `work` method.
///
/// Multiple requests made before the callback runs may be coalesced.
pub trait WorkScheduler: Send + Sync {
    fn schedule_work(&self);
}

/// Events posted from background tasks to a component living in the domain.
///
/// Posting schedules work on the domain; the component drains its inbox from
/// its `work` method.
pub struct Inbox<E> {
    events: Arc<Mutex<VecDeque<E>>>,
    scheduler: Arc<dyn WorkScheduler>,
}

impl<E: Send> Inbox<E> {
    pub fn new(scheduler: Arc<dyn WorkScheduler>) -> Self {
        Self {
            events: Arc::new(Mutex::new(VecDeque::new())),
            scheduler,
        }
    }

    pub fn post(&self, event: E) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(event);
        self.scheduler.schedule_work();
    }

    /// Take every event posted so far, oldest first.
    pub fn drain(&self) -> Vec<E> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect()
    }
}

impl<E> Clone for Inbox<E> {
    fn clone(&self) -> Self {
        Self {
            events: Arc::clone(&self.events),
            scheduler: Arc::clone(&self.scheduler),
        }
    }
}

/// A spawned task that is aborted when the guard is dropped.
#[derive(Debug)]
pub struct TaskGuard(JoinHandle<()>);

impl TaskGuard {
    pub fn spawn<F>(future: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Self(tokio::spawn(future))
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}
