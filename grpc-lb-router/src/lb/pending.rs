//! Picks and pings waiting for a connection.

use crate::{completion::Completion, error::PickError, subchannel::Connection};
use std::{
    collections::VecDeque,
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};
use tokio::sync::oneshot;
use tonic::metadata::MetadataMap;

static NEXT_PICK_ID: AtomicU64 = AtomicU64::new(1);

/// Identifies a pick so it can be cancelled while queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PickId(u64);

impl PickId {
    fn next() -> Self {
        Self(NEXT_PICK_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for PickId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pick-{}", self.0)
    }
}

/// What a policy knows about the call it is picking a connection for.
#[derive(Debug, Clone)]
pub struct CallInfo {
    id: PickId,
    path: Option<String>,
    metadata: MetadataMap,
    wait_for_ready: bool,
}

impl CallInfo {
    pub fn new() -> Self {
        Self {
            id: PickId::next(),
            path: None,
            metadata: MetadataMap::new(),
            wait_for_ready: false,
        }
    }

    /// The `/service/method` path of the call.
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_metadata(mut self, metadata: MetadataMap) -> Self {
        self.metadata = metadata;
        self
    }

    /// Queue the pick through TRANSIENT_FAILURE instead of failing it fast.
    pub fn with_wait_for_ready(mut self, wait_for_ready: bool) -> Self {
        self.wait_for_ready = wait_for_ready;
        self
    }

    pub fn id(&self) -> PickId {
        self.id
    }

    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    pub fn metadata(&self) -> &MetadataMap {
        &self.metadata
    }

    pub fn wait_for_ready(&self) -> bool {
        self.wait_for_ready
    }
}

impl Default for CallInfo {
    fn default() -> Self {
        Self::new()
    }
}

pub type PickOutcome = Result<Connection, PickError>;

/// A request for a connection that completes exactly once.
#[derive(Debug)]
pub struct PendingPick {
    call: CallInfo,
    completion: Completion<PickOutcome>,
}

impl PendingPick {
    pub fn new(call: CallInfo, completion: Completion<PickOutcome>) -> Self {
        Self { call, completion }
    }

    /// A pick whose outcome is delivered through the returned receiver.
    pub fn channel(call: CallInfo) -> (Self, oneshot::Receiver<PickOutcome>) {
        let (completion, receiver) = Completion::channel(|| Err(PickError::abandoned()));
        (Self::new(call, completion), receiver)
    }

    pub fn call(&self) -> &CallInfo {
        &self.call
    }

    pub fn id(&self) -> PickId {
        self.call.id
    }

    pub fn complete(self, outcome: PickOutcome) {
        self.completion.complete(outcome)
    }
}

/// A request to ping some connected backend.
#[derive(Debug)]
pub struct PendingPing {
    completion: Completion<Result<(), PickError>>,
}

impl PendingPing {
    pub fn new(completion: Completion<Result<(), PickError>>) -> Self {
        Self { completion }
    }

    pub fn channel() -> (Self, oneshot::Receiver<Result<(), PickError>>) {
        let (completion, receiver) = Completion::channel(|| Err(PickError::abandoned()));
        (Self::new(completion), receiver)
    }

    pub fn complete(self, outcome: Result<(), PickError>) {
        self.completion.complete(outcome)
    }
}

/// FIFO queues of picks and pings a policy cannot serve yet.
#[derive(Debug, Default)]
pub struct PendingQueue {
    picks: VecDeque<PendingPick>,
    pings: VecDeque<PendingPing>,
}

impl PendingQueue {
    pub fn push_pick(&mut self, pick: PendingPick) {
        self.picks.push_back(pick);
    }

    pub fn push_ping(&mut self, ping: PendingPing) {
        self.pings.push_back(ping);
    }

    pub fn is_empty(&self) -> bool {
        self.picks.is_empty() && self.pings.is_empty()
    }

    pub fn picks(&self) -> usize {
        self.picks.len()
    }

    pub fn pings(&self) -> usize {
        self.pings.len()
    }

    /// Complete the pick with `id` with `error`, if it is queued here.
    pub fn cancel_pick(&mut self, id: PickId, error: PickError) -> bool {
        match self.picks.iter().position(|pick| pick.id() == id) {
            Some(index) => {
                if let Some(pick) = self.picks.remove(index) {
                    pick.complete(Err(error));
                }
                true
            }
            None => false,
        }
    }

    /// Complete every queued pick whose call matches `predicate` with `error`.
    pub fn cancel_picks_matching(
        &mut self,
        predicate: &dyn Fn(&CallInfo) -> bool,
        error: PickError,
    ) -> usize {
        let (cancelled, kept) = std::mem::take(&mut self.picks)
            .into_iter()
            .partition::<VecDeque<_>, _>(|pick| predicate(pick.call()));
        self.picks = kept;
        let count = cancelled.len();
        for pick in cancelled {
            pick.complete(Err(error.clone()));
        }
        count
    }

    /// Fail the picks that did not ask to wait for ready.
    pub fn fail_fast(&mut self, error: PickError) {
        self.cancel_picks_matching(&|call| !call.wait_for_ready(), error);
    }

    pub fn take_picks(&mut self) -> VecDeque<PendingPick> {
        std::mem::take(&mut self.picks)
    }

    pub fn take_pings(&mut self) -> VecDeque<PendingPing> {
        std::mem::take(&mut self.pings)
    }

    /// Move everything queued in `other` to the back of this queue.
    pub fn append(&mut self, other: &mut PendingQueue) {
        self.picks.append(&mut other.picks);
        self.pings.append(&mut other.pings);
    }

    pub fn fail_all(&mut self, error: PickError) {
        for pick in self.picks.drain(..) {
            pick.complete(Err(error.clone()));
        }
        for ping in self.pings.drain(..) {
            ping.complete(Err(error.clone()));
        }
    }
}
