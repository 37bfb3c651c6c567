//! Name resolution: turning a [`Target`] into a stream of address lists.
//!
//! A [`Resolver`] is created by the [`ResolverFactory`] registered for the
//! target's scheme. The router asks for one result at a time through
//! [`Resolver::next_result`]; results produced while nobody is asking are
//! queued and delivered in the order they were produced.

pub mod dns;
pub mod fake;
mod registry;
pub mod static_list;

pub use registry::{ResolverRegistry, ResolverRegistryBuilder};

use crate::{
    completion::Completion,
    error::{ResolverError, SharedError},
    Address, Target,
};
use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

/// Default interval between two DNS probes.
pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(10);

/// One pass of name resolution.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolutionResult {
    pub addresses: Vec<Address>,
    /// Raw service config JSON chosen for this client, if any.
    pub service_config: Option<String>,
}

pub type ResolutionOutcome = Result<ResolutionResult, ResolverError>;

/// Delivers the next resolution outcome. Fires with
/// [`ResolverError::Shutdown`] if the resolver goes away first.
pub type ResultCompletion = Completion<ResolutionOutcome>;

impl ResolverError {
    fn abandoned() -> ResolutionOutcome {
        Err(ResolverError::Shutdown(None))
    }
}

/// Produces resolution results for one target.
///
/// All methods are called from the router's serialization domain.
pub trait Resolver: Send {
    /// Begin resolving. Called once, before any other method.
    fn start_resolving(&mut self);

    /// Ask for the next result. At most one request is outstanding at a time.
    fn next_result(&mut self, completion: ResultCompletion);

    /// The channel ran into trouble with the current addresses, resolve again
    /// soon.
    fn notify_channel_saw_error(&mut self);

    /// Stop resolving, completing an outstanding request with
    /// [`ResolverError::Shutdown`] carrying `error`.
    fn shutdown(&mut self, error: Option<SharedError>);
}

/// What a resolver is created for.
#[derive(Debug, Clone)]
pub struct ResolverArgs {
    pub target: Target,
    pub probe_interval: Duration,
    /// Also look up the service config published for the target.
    pub request_service_config: bool,
    /// Matched against `clientHostname` when choosing a service config.
    pub hostname: Option<String>,
}

impl ResolverArgs {
    pub fn new(target: Target) -> Self {
        Self {
            target,
            probe_interval: DEFAULT_PROBE_INTERVAL,
            request_service_config: false,
            hostname: None,
        }
    }
}

/// Creates resolvers for one URI scheme.
pub trait ResolverFactory: Send + Sync {
    fn scheme(&self) -> &'static str;

    /// Create a resolver for `args.target`.
    ///
    /// Never fails: a resolver that cannot work reports a fatal
    /// [`ResolverError`] as its first result.
    fn create(&self, args: ResolverArgs) -> Box<dyn Resolver>;
}

/// FIFO handoff between the task producing results and the router
/// consuming them.
#[derive(Clone, Default)]
pub struct ResultSlot {
    inner: Arc<Mutex<SlotState>>,
}

#[derive(Default)]
struct SlotState {
    unconsumed: VecDeque<ResolutionOutcome>,
    waiting: Option<ResultCompletion>,
    closed: Option<Option<SharedError>>,
}

impl ResultSlot {
    /// Deliver `outcome` to the waiting consumer, or queue it behind the
    /// outcomes not consumed yet.
    pub fn publish(&self, outcome: ResolutionOutcome) {
        let mut state = self.state();
        if state.closed.is_some() {
            return;
        }
        match state.waiting.take() {
            Some(completion) => {
                drop(state);
                completion.complete(outcome);
            }
            None => {
                state.unconsumed.push_back(outcome);
                tracing::trace!(queued = state.unconsumed.len(), "queued resolution result");
            }
        }
    }

    pub fn request(&self, completion: ResultCompletion) {
        let mut state = self.state();
        if let Some(error) = &state.closed {
            let error = error.clone();
            drop(state);
            completion.complete(Err(ResolverError::Shutdown(error)));
            return;
        }
        match state.unconsumed.pop_front() {
            Some(outcome) => {
                drop(state);
                completion.complete(outcome);
            }
            None => {
                debug_assert!(state.waiting.is_none(), "two outstanding result requests");
                state.waiting = Some(completion);
            }
        }
    }

    /// Whether a consumer is waiting for a result.
    pub fn is_waiting(&self) -> bool {
        self.state().waiting.is_some()
    }

    /// Drop unconsumed outcomes and fail the waiting request, and every later
    /// one, with [`ResolverError::Shutdown`] carrying `error`.
    pub fn close(&self, error: Option<SharedError>) {
        let waiting = {
            let mut state = self.state();
            if state.closed.is_some() {
                return;
            }
            state.closed = Some(error.clone());
            state.unconsumed.clear();
            state.waiting.take()
        };
        if let Some(completion) = waiting {
            completion.complete(Err(ResolverError::Shutdown(error)));
        }
    }

    fn state(&self) -> MutexGuard<'_, SlotState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Wrap `callback` as a [`ResultCompletion`].
pub fn result_completion<F>(callback: F) -> ResultCompletion
where
    F: FnOnce(ResolutionOutcome) + Send + 'static,
{
    Completion::new(callback, ResolverError::abandoned)
}

#[cfg(test)]
mod test {
    use super::*;
    use tokio::sync::oneshot;

    fn request(slot: &ResultSlot) -> oneshot::Receiver<ResolutionOutcome> {
        let (sender, receiver) = oneshot::channel();
        slot.request(result_completion(move |outcome| {
            let _ = sender.send(outcome);
        }));
        receiver
    }

    fn result(endpoint: &str) -> ResolutionOutcome {
        Ok(ResolutionResult {
            addresses: vec![Address::new(endpoint)],
            service_config: None,
        })
    }

    #[test]
    fn unconsumed_results_are_delivered_in_order() {
        let slot = ResultSlot::default();
        slot.publish(result("10.0.0.1:80"));
        slot.publish(result("10.0.0.2:80"));

        let mut first = request(&slot);
        assert_eq!(first.try_recv().unwrap().unwrap(), result("10.0.0.1:80").unwrap());
        let mut second = request(&slot);
        assert_eq!(second.try_recv().unwrap().unwrap(), result("10.0.0.2:80").unwrap());

        let mut third = request(&slot);
        assert!(third.try_recv().is_err());
        slot.publish(result("10.0.0.3:80"));
        assert_eq!(third.try_recv().unwrap().unwrap(), result("10.0.0.3:80").unwrap());
    }

    #[test]
    fn closing_completes_the_waiting_request() {
        let slot = ResultSlot::default();
        let mut waiting = request(&slot);
        slot.close(Some(SharedError::msg("channel closed")));
        let error = waiting.try_recv().unwrap().unwrap_err();
        assert_eq!(
            crate::error::error_chain(&error),
            "resolver shut down: channel closed"
        );

        let mut late = request(&slot);
        assert!(matches!(
            late.try_recv().unwrap(),
            Err(ResolverError::Shutdown(Some(_)))
        ));
    }

    #[test]
    fn closing_discards_unconsumed_results() {
        let slot = ResultSlot::default();
        slot.publish(result("10.0.0.1:80"));
        slot.close(None);

        let mut late = request(&slot);
        assert!(matches!(
            late.try_recv().unwrap(),
            Err(ResolverError::Shutdown(None))
        ));
    }
}
