//! Connects to the first reachable address and sends every call there.

use super::{
    CallInfo, ChannelControl, LbPolicy, LbPolicyArgs, LbPolicyFactory, PendingPick, PendingPing,
    PendingQueue, PickId, PickResult, PingResult,
};
use crate::{
    connectivity::{ConnectivityState, ConnectivityStateTracker, StateWatcher},
    error::{LbPolicyError, PickError, SharedError},
    subchannel::{Connection, Subchannel},
    Address,
};

pub const PICK_FIRST: &str = "pick_first";

#[derive(Debug, Clone, Copy, Default)]
pub struct PickFirstFactory;

impl LbPolicyFactory for PickFirstFactory {
    fn name(&self) -> &'static str {
        PICK_FIRST
    }

    fn create(
        &self,
        args: &LbPolicyArgs,
        ctx: &mut dyn ChannelControl,
    ) -> Result<Box<dyn LbPolicy>, LbPolicyError> {
        if args.addresses.is_empty() {
            return Err(LbPolicyError::NoAddresses(PICK_FIRST));
        }
        Ok(Box::new(PickFirst::new(&args.addresses, ctx)))
    }
}

struct Candidate {
    address: Address,
    subchannel: Option<Subchannel>,
}

/// Tries addresses in resolution order until one connects, then drops the
/// others. When the selected connection is lost, re-resolves and moves on to
/// the next address.
pub struct PickFirst {
    candidates: Vec<Candidate>,
    selected: Option<usize>,
    attempting: usize,
    started: bool,
    shut_down: bool,
    pending: PendingQueue,
    tracker: ConnectivityStateTracker,
}

impl PickFirst {
    fn new(addresses: &[Address], ctx: &mut dyn ChannelControl) -> Self {
        let mut policy = Self {
            candidates: Vec::new(),
            selected: None,
            attempting: 0,
            started: false,
            shut_down: false,
            pending: PendingQueue::default(),
            tracker: ConnectivityStateTracker::new(PICK_FIRST, ConnectivityState::Idle),
        };
        policy.replace_candidates(addresses, ctx);
        policy
    }

    /// Install a new candidate list, reusing pooled subchannels and
    /// adopting one that is already connected.
    fn replace_candidates(&mut self, addresses: &[Address], ctx: &mut dyn ChannelControl) {
        self.candidates = addresses
            .iter()
            .map(|address| Candidate {
                address: address.clone(),
                subchannel: Some(ctx.create_subchannel(address)),
            })
            .collect();
        self.selected = None;
        self.attempting = 0;

        let ready = self.candidates.iter().position(|candidate| {
            candidate
                .subchannel
                .as_ref()
                .map_or(false, |subchannel| subchannel.state() == ConnectivityState::Ready)
        });
        if let Some(index) = ready {
            self.select(index);
        }
    }

    fn selected_connection(&self) -> Option<Connection> {
        let candidate = &self.candidates[self.selected?];
        candidate
            .subchannel
            .as_ref()?
            .connection(candidate.address.lb_token().cloned())
    }

    fn selected_subchannel(&self) -> Option<&Subchannel> {
        self.candidates[self.selected?].subchannel.as_ref()
    }

    fn start(&mut self, ctx: &mut dyn ChannelControl) {
        if self.started || self.selected.is_some() {
            return;
        }
        self.started = true;
        self.try_candidate(0, ctx);
    }

    fn try_candidate(&mut self, index: usize, ctx: &mut dyn ChannelControl) {
        self.attempting = index;
        let candidate = &mut self.candidates[index];
        if candidate.subchannel.is_none() {
            candidate.subchannel = Some(ctx.create_subchannel(&candidate.address));
        }
        let Some(subchannel) = candidate.subchannel.clone() else {
            return;
        };

        if subchannel.state() == ConnectivityState::Ready {
            self.select(index);
            return;
        }
        subchannel.request_connection();
        if self.tracker.state() != ConnectivityState::TransientFailure {
            self.tracker
                .set(ConnectivityState::Connecting, None, "connecting to next address");
        }
    }

    fn select(&mut self, index: usize) {
        tracing::debug!(address = %self.candidates[index].address, "selected address");
        self.started = true;
        self.selected = Some(index);
        self.attempting = index;
        for (position, candidate) in self.candidates.iter_mut().enumerate() {
            if position != index {
                candidate.subchannel = None;
            }
        }
        self.tracker
            .set(ConnectivityState::Ready, None, "subchannel connected");

        for pick in self.pending.take_picks() {
            match self.selected_connection() {
                Some(connection) => pick.complete(Ok(connection)),
                None => self.pending.push_pick(pick),
            }
        }
        if let Some(subchannel) = self.selected_subchannel().cloned() {
            for ping in self.pending.take_pings() {
                subchannel.ping(ping);
            }
        }
    }

    fn fail(&mut self, error: SharedError, ctx: &mut dyn ChannelControl) {
        self.tracker.set(
            ConnectivityState::TransientFailure,
            Some(error.clone()),
            "every address failed",
        );
        self.pending.fail_fast(PickError::Unavailable(error));
        ctx.request_reresolution();
    }

    fn failure(&self) -> SharedError {
        self.tracker
            .error()
            .cloned()
            .unwrap_or_else(|| SharedError::msg("no address is reachable"))
    }
}

impl LbPolicy for PickFirst {
    fn name(&self) -> &'static str {
        PICK_FIRST
    }

    fn update(&mut self, args: &LbPolicyArgs, ctx: &mut dyn ChannelControl) {
        if self.shut_down {
            return;
        }
        if args.addresses.is_empty() {
            tracing::warn!("ignoring update without addresses");
            return;
        }

        if let Some(current) = self.selected_subchannel().cloned() {
            if let Some(index) = args
                .addresses
                .iter()
                .position(|address| address.endpoint() == current.address().endpoint())
            {
                self.candidates = args
                    .addresses
                    .iter()
                    .map(|address| Candidate {
                        address: address.clone(),
                        subchannel: None,
                    })
                    .collect();
                self.candidates[index].subchannel = Some(current);
                self.selected = Some(index);
                self.attempting = index;
                return;
            }
        }

        self.replace_candidates(&args.addresses, ctx);
        if self.selected.is_none() && self.started {
            self.started = false;
            self.start(ctx);
        }
    }

    fn pick(&mut self, pick: PendingPick, ctx: &mut dyn ChannelControl) -> PickResult {
        if self.shut_down {
            return PickResult::Complete(pick, Err(PickError::Shutdown(None)));
        }
        self.start(ctx);
        if let Some(connection) = self.selected_connection() {
            return PickResult::Complete(pick, Ok(connection));
        }
        if self.tracker.state() == ConnectivityState::TransientFailure
            && !pick.call().wait_for_ready()
        {
            let error = self.failure();
            return PickResult::Complete(pick, Err(PickError::Unavailable(error)));
        }
        self.pending.push_pick(pick);
        PickResult::Queued
    }

    fn cancel_pick(&mut self, id: PickId, error: PickError) {
        self.pending.cancel_pick(id, error);
    }

    fn cancel_picks_matching(&mut self, predicate: &dyn Fn(&CallInfo) -> bool, error: PickError) {
        self.pending.cancel_picks_matching(predicate, error);
    }

    fn ping_one(&mut self, ping: PendingPing, ctx: &mut dyn ChannelControl) -> PingResult {
        if self.shut_down {
            return PingResult::Failed(ping, PickError::Shutdown(None));
        }
        self.start(ctx);
        match self.selected_subchannel() {
            Some(subchannel) => {
                subchannel.ping(ping);
                PingResult::Sent
            }
            None => {
                self.pending.push_ping(ping);
                PingResult::Queued
            }
        }
    }

    fn exit_idle(&mut self, ctx: &mut dyn ChannelControl) {
        if !self.shut_down {
            self.start(ctx);
        }
    }

    fn check_connectivity_state(&self) -> ConnectivityState {
        self.tracker.state()
    }

    fn connectivity_error(&self) -> Option<SharedError> {
        self.tracker.error().cloned()
    }

    fn notify_on_state_change(&mut self, current: ConnectivityState, watcher: StateWatcher) {
        self.tracker.notify_on_state_change(current, watcher);
    }

    fn subchannel_update(
        &mut self,
        subchannel: &Subchannel,
        state: ConnectivityState,
        ctx: &mut dyn ChannelControl,
    ) {
        if self.shut_down {
            return;
        }
        let Some(index) = self.candidates.iter().position(|candidate| {
            candidate
                .subchannel
                .as_ref()
                .map_or(false, |own| own.ptr_eq(subchannel))
        }) else {
            return;
        };

        if self.selected == Some(index) {
            if state == ConnectivityState::Ready {
                return;
            }
            tracing::info!(address = %subchannel.address(), %state, "lost selected connection");
            self.selected = None;
            ctx.request_reresolution();
            self.try_candidate((index + 1) % self.candidates.len(), ctx);
            return;
        }
        if self.selected.is_some() || index != self.attempting {
            return;
        }

        match state {
            ConnectivityState::Ready => self.select(index),
            ConnectivityState::TransientFailure => {
                let next = index + 1;
                if next < self.candidates.len() {
                    self.try_candidate(next, ctx);
                } else {
                    let error = subchannel
                        .error()
                        .unwrap_or_else(|| SharedError::msg("every address failed"));
                    tracing::warn!(%error, "no address is reachable");
                    self.fail(error, ctx);
                    self.try_candidate(0, ctx);
                }
            }
            // The backoff after a failed attempt is over.
            ConnectivityState::Idle => subchannel.request_connection(),
            ConnectivityState::Connecting | ConnectivityState::Shutdown => {}
        }
    }

    fn take_pending(&mut self) -> PendingQueue {
        std::mem::take(&mut self.pending)
    }

    fn shutdown(&mut self, error: PickError) {
        debug_assert!(!self.shut_down, "pick_first shut down twice");
        self.shut_down = true;
        self.pending.fail_all(error);
        self.candidates.clear();
        self.selected = None;
        self.tracker
            .set(ConnectivityState::Shutdown, None, "policy shut down");
    }
}
