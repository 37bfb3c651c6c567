//! Spreads calls over every connected address in turn.

use super::{
    CallInfo, ChannelControl, LbPolicy, LbPolicyArgs, LbPolicyFactory, PendingPick, PendingPing,
    PendingQueue, PickId, PickResult, PingResult,
};
use crate::{
    connectivity::{aggregate, ConnectivityState, ConnectivityStateTracker, StateWatcher},
    error::{LbPolicyError, PickError, SharedError},
    subchannel::{Connection, Subchannel},
    Address,
};
use std::collections::HashMap;

pub const ROUND_ROBIN: &str = "round_robin";

#[derive(Debug, Clone, Copy, Default)]
pub struct RoundRobinFactory;

impl LbPolicyFactory for RoundRobinFactory {
    fn name(&self) -> &'static str {
        ROUND_ROBIN
    }

    fn create(
        &self,
        args: &LbPolicyArgs,
        ctx: &mut dyn ChannelControl,
    ) -> Result<Box<dyn LbPolicy>, LbPolicyError> {
        if args.addresses.is_empty() {
            return Err(LbPolicyError::NoAddresses(ROUND_ROBIN));
        }
        Ok(Box::new(RoundRobin::new(&args.addresses, ctx)))
    }
}

struct Child {
    address: Address,
    subchannel: Subchannel,
    state: ConnectivityState,
}

impl Child {
    fn connection(&self) -> Option<Connection> {
        if self.state != ConnectivityState::Ready {
            return None;
        }
        self.subchannel.connection(self.address.lb_token().cloned())
    }
}

/// Keeps a connection to every address and rotates picks over the ready ones.
pub struct RoundRobin {
    children: Vec<Child>,
    /// Index the next pick starts scanning at.
    next: usize,
    started: bool,
    shut_down: bool,
    pending: PendingQueue,
    tracker: ConnectivityStateTracker,
}

impl RoundRobin {
    fn new(addresses: &[Address], ctx: &mut dyn ChannelControl) -> Self {
        let children: Vec<Child> = addresses
            .iter()
            .map(|address| Self::child(address, ctx))
            .collect();
        let initial = if children
            .iter()
            .any(|child| child.state == ConnectivityState::Ready)
        {
            ConnectivityState::Ready
        } else {
            ConnectivityState::Idle
        };
        Self {
            children,
            next: 0,
            started: false,
            shut_down: false,
            pending: PendingQueue::default(),
            tracker: ConnectivityStateTracker::new(ROUND_ROBIN, initial),
        }
    }

    fn child(address: &Address, ctx: &mut dyn ChannelControl) -> Child {
        let subchannel = ctx.create_subchannel(address);
        Child {
            address: address.clone(),
            state: subchannel.state(),
            subchannel,
        }
    }

    fn start(&mut self, ctx: &mut dyn ChannelControl) {
        if self.started {
            return;
        }
        self.started = true;
        self.connect_idle();
        self.refresh_state(ctx, "started connecting");
    }

    fn connect_idle(&self) {
        for child in &self.children {
            if child.state == ConnectivityState::Idle {
                child.subchannel.request_connection();
            }
        }
    }

    /// The next ready connection in rotation.
    fn next_connection(&mut self) -> Option<Connection> {
        let count = self.children.len();
        (0..count)
            .map(|offset| (self.next + offset) % count)
            .find_map(|index| {
                self.children[index]
                    .connection()
                    .map(|connection| (index, connection))
            })
            .map(|(index, connection)| {
                self.next = (index + 1) % count;
                connection
            })
    }

    fn ready_subchannel(&self) -> Option<Subchannel> {
        self.children
            .iter()
            .find(|child| child.state == ConnectivityState::Ready)
            .map(|child| child.subchannel.clone())
    }

    fn failure(&self) -> SharedError {
        self.children
            .iter()
            .find_map(|child| child.subchannel.error())
            .unwrap_or_else(|| SharedError::msg("no address is reachable"))
    }

    fn refresh_state(&mut self, ctx: &mut dyn ChannelControl, reason: &str) {
        let previous = self.tracker.state();
        let state = match aggregate(self.children.iter().map(|child| child.state)) {
            ConnectivityState::Idle if self.started => ConnectivityState::Connecting,
            state => state,
        };

        match state {
            ConnectivityState::Ready => {
                self.tracker.set(state, None, reason);
                self.flush_pending();
            }
            ConnectivityState::TransientFailure => {
                let error = self.failure();
                self.tracker.set(state, Some(error.clone()), reason);
                self.pending.fail_fast(PickError::Unavailable(error));
                if previous != ConnectivityState::TransientFailure {
                    ctx.request_reresolution();
                }
            }
            state => self.tracker.set(state, None, reason),
        }
    }

    fn flush_pending(&mut self) {
        for pick in self.pending.take_picks() {
            match self.next_connection() {
                Some(connection) => pick.complete(Ok(connection)),
                None => self.pending.push_pick(pick),
            }
        }
        if let Some(subchannel) = self.ready_subchannel() {
            for ping in self.pending.take_pings() {
                subchannel.ping(ping);
            }
        }
    }
}

impl LbPolicy for RoundRobin {
    fn name(&self) -> &'static str {
        ROUND_ROBIN
    }

    fn update(&mut self, args: &LbPolicyArgs, ctx: &mut dyn ChannelControl) {
        if self.shut_down {
            return;
        }
        if args.addresses.is_empty() {
            tracing::warn!("ignoring update without addresses");
            return;
        }

        // Endpoints in the order the rotation would have reached them.
        let count = self.children.len();
        let upcoming: Vec<String> = (0..count)
            .map(|offset| {
                self.children[(self.next + offset) % count]
                    .address
                    .endpoint()
                    .to_string()
            })
            .collect();

        let mut previous: HashMap<String, Child> = self
            .children
            .drain(..)
            .map(|child| (child.address.endpoint().to_string(), child))
            .collect();
        self.children = args
            .addresses
            .iter()
            .map(|address| match previous.remove(address.endpoint()) {
                Some(mut child) => {
                    child.address = address.clone();
                    child
                }
                None => Self::child(address, ctx),
            })
            .collect();
        self.next = upcoming
            .iter()
            .find_map(|endpoint| {
                self.children
                    .iter()
                    .position(|child| child.address.endpoint() == endpoint)
            })
            .unwrap_or(0);
        tracing::debug!(
            addresses = self.children.len(),
            removed = previous.len(),
            "updated address list"
        );

        if self.started {
            self.connect_idle();
        }
        self.refresh_state(ctx, "address list updated");
    }

    fn pick(&mut self, pick: PendingPick, ctx: &mut dyn ChannelControl) -> PickResult {
        if self.shut_down {
            return PickResult::Complete(pick, Err(PickError::Shutdown(None)));
        }
        self.start(ctx);
        if let Some(connection) = self.next_connection() {
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
        match self.ready_subchannel() {
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
        let Some(child) = self
            .children
            .iter_mut()
            .find(|child| child.subchannel.ptr_eq(subchannel))
        else {
            return;
        };
        child.state = state;
        if state == ConnectivityState::Idle && self.started {
            subchannel.request_connection();
        }
        self.refresh_state(ctx, "subchannel state changed");
    }

    fn take_pending(&mut self) -> PendingQueue {
        std::mem::take(&mut self.pending)
    }

    fn shutdown(&mut self, error: PickError) {
        debug_assert!(!self.shut_down, "round_robin shut down twice");
        self.shut_down = true;
        self.pending.fail_all(error);
        self.children.clear();
        self.tracker
            .set(ConnectivityState::Shutdown, None, "policy shut down");
    }
}
