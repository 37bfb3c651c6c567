//! A resolver driven by hand, for tests and for embedding the router behind
//! an address source of one's own.

use super::{
    ResolutionOutcome, ResolutionResult, Resolver, ResolverArgs, ResolverFactory,
    ResultCompletion, ResultSlot,
};
use crate::error::{ResolverError, SharedError};
use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

/// Creates resolvers whose results are pushed through a [`FakeResolverHandle`].
#[derive(Debug, Clone)]
pub struct FakeResolverFactory {
    scheme: &'static str,
    handle: FakeResolverHandle,
}

impl FakeResolverFactory {
    /// A factory for the `fake` scheme and the handle driving its resolvers.
    pub fn new() -> (Self, FakeResolverHandle) {
        Self::with_scheme("fake")
    }

    pub fn with_scheme(scheme: &'static str) -> (Self, FakeResolverHandle) {
        let handle = FakeResolverHandle::default();
        (
            Self {
                scheme,
                handle: handle.clone(),
            },
            handle,
        )
    }
}

impl ResolverFactory for FakeResolverFactory {
    fn scheme(&self) -> &'static str {
        self.scheme
    }

    fn create(&self, _args: ResolverArgs) -> Box<dyn Resolver> {
        let slot = ResultSlot::default();
        {
            let mut state = self.handle.state();
            if let Some(previous) = state.slot.replace(slot.clone()) {
                previous.close(None);
            }
            state.shut_down = false;
            state.started = false;
        }
        Box::new(FakeResolver {
            handle: self.handle.clone(),
            slot,
        })
    }
}

#[derive(Default)]
struct HandleState {
    slot: Option<ResultSlot>,
    unsent: VecDeque<ResolutionOutcome>,
    started: bool,
    result_requests: usize,
    reresolution_requests: usize,
    shut_down: bool,
}

/// Pushes results into the most recently created fake resolver.
///
/// Outcomes set before the resolver starts are delivered, in order, when it
/// does.
#[derive(Clone, Default)]
pub struct FakeResolverHandle {
    state: Arc<Mutex<HandleState>>,
}

impl FakeResolverHandle {
    pub fn set_result(&self, result: ResolutionResult) {
        self.publish(Ok(result));
    }

    /// Report `error`, which the channel treats as fatal.
    pub fn set_error(&self, error: ResolverError) {
        self.publish(Err(error));
    }

    /// How many times the channel asked for a result.
    pub fn result_requests(&self) -> usize {
        self.state().result_requests
    }

    /// How many times the channel asked to re-resolve.
    pub fn reresolution_requests(&self) -> usize {
        self.state().reresolution_requests
    }

    pub fn is_shut_down(&self) -> bool {
        self.state().shut_down
    }

    fn publish(&self, outcome: ResolutionOutcome) {
        let slot = {
            let mut state = self.state();
            match (&state.slot, state.started) {
                (Some(slot), true) => slot.clone(),
                _ => {
                    state.unsent.push_back(outcome);
                    return;
                }
            }
        };
        slot.publish(outcome);
    }

    fn state(&self) -> MutexGuard<'_, HandleState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for FakeResolverHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state();
        f.debug_struct("FakeResolverHandle")
            .field("result_requests", &state.result_requests)
            .field("reresolution_requests", &state.reresolution_requests)
            .field("shut_down", &state.shut_down)
            .finish()
    }
}

struct FakeResolver {
    handle: FakeResolverHandle,
    slot: ResultSlot,
}

impl Resolver for FakeResolver {
    fn start_resolving(&mut self) {
        let unsent = {
            let mut state = self.handle.state();
            state.started = true;
            std::mem::take(&mut state.unsent)
        };
        for outcome in unsent {
            self.slot.publish(outcome);
        }
    }

    fn next_result(&mut self, completion: ResultCompletion) {
        self.handle.state().result_requests += 1;
        self.slot.request(completion);
    }

    fn notify_channel_saw_error(&mut self) {
        self.handle.state().reresolution_requests += 1;
    }

    fn shutdown(&mut self, error: Option<SharedError>) {
        self.handle.state().shut_down = true;
        self.slot.close(error);
    }
}
