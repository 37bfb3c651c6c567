//! Delegates backend selection to an external `grpc.lb.v1` balancer.
//!
//! The policy keeps a streaming `BalanceLoad` call open to one of the
//! resolved balancer addresses. Every server list received on that stream
//! becomes a fresh `round_robin` child, handed the picks queued on its
//! predecessor. A broken stream is retried with backoff and never surfaced
//! to the router.

pub mod proto;

use super::{
    requeue, round_robin::ROUND_ROBIN, CallInfo, ChannelControl, LbPolicy, LbPolicyArgs,
    LbPolicyFactory, PendingPick, PendingPing, PendingQueue, PickId, PickResult, PingResult,
};
use crate::{
    backoff::{Backoff, BackoffConfig},
    completion::Completion,
    connectivity::{ConnectivityState, ConnectivityStateTracker, StateWatcher},
    error::{LbPolicyError, PickError, SharedError},
    service_config::ServiceConfig,
    subchannel::Subchannel,
    work_serializer::{Inbox, TaskGuard},
    Address,
};
use bytes::Bytes;
use futures::{stream::BoxStream, StreamExt};
use proto::{
    load_balance_response::LoadBalanceResponseType, LoadBalanceRequest, LoadBalanceResponse,
    Server, ServerList,
};
use std::{
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};

pub const GRPCLB: &str = "grpclb";

/// A channel to the external load balancers.
pub trait BalancerChannel: Send + Sync + 'static {
    /// Open a `BalanceLoad` stream, sending `request` as its first message.
    fn balance_load(
        &self,
        request: LoadBalanceRequest,
    ) -> BoxStream<'static, Result<LoadBalanceResponse, tonic::Status>>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct GrpclbFactory;

impl LbPolicyFactory for GrpclbFactory {
    fn name(&self) -> &'static str {
        GRPCLB
    }

    fn create(
        &self,
        args: &LbPolicyArgs,
        ctx: &mut dyn ChannelControl,
    ) -> Result<Box<dyn LbPolicy>, LbPolicyError> {
        Ok(Box::new(Grpclb::new(args, ctx)?))
    }
}

enum Event {
    Response {
        call: u64,
        response: LoadBalanceResponse,
    },
    CallEnded {
        call: u64,
        status: Option<tonic::Status>,
    },
    Retry {
        call: u64,
    },
    ChildState {
        child: u64,
    },
}

#[derive(Debug, thiserror::Error)]
enum InvalidServer {
    #[error("entry is marked as drop")]
    Drop,
    #[error("port {0} is out of range")]
    Port(i32),
    #[error("IP address has {0} bytes")]
    IpLength(usize),
}

pub struct Grpclb {
    server_name: String,
    service_config: Option<Arc<ServiceConfig>>,
    balancers: Vec<Address>,
    channel: Arc<dyn BalancerChannel>,
    /// Identifies the current balancer call. Events from older calls are stale.
    call_id: u64,
    call: Option<TaskGuard>,
    retry: Option<TaskGuard>,
    backoff: Backoff,
    initial_response: bool,
    server_list: Option<ServerList>,
    /// Identifies the current child. Watches on older children are stale.
    child_id: u64,
    child: Option<Box<dyn LbPolicy>>,
    inbox: Inbox<Event>,
    pending: PendingQueue,
    tracker: ConnectivityStateTracker,
    started: bool,
    shut_down: bool,
}

impl Grpclb {
    pub fn new(args: &LbPolicyArgs, ctx: &mut dyn ChannelControl) -> Result<Self, LbPolicyError> {
        let balancers = balancer_addresses(&args.addresses);
        if balancers.is_empty() {
            return Err(LbPolicyError::NoAddresses(GRPCLB));
        }
        let channel = ctx
            .create_balancer_channel(&balancers)
            .map_err(|error| LbPolicyError::Creation {
                policy: GRPCLB,
                source: error.into(),
            })?;

        Ok(Self {
            server_name: args.server_name.clone(),
            service_config: args.service_config.clone(),
            balancers,
            channel,
            call_id: 0,
            call: None,
            retry: None,
            backoff: Backoff::new(BackoffConfig::default()),
            initial_response: false,
            server_list: None,
            child_id: 0,
            child: None,
            inbox: Inbox::new(ctx.work_scheduler()),
            pending: PendingQueue::default(),
            tracker: ConnectivityStateTracker::new(GRPCLB, ConnectivityState::Idle),
            started: false,
            shut_down: false,
        })
    }

    fn start(&mut self, ctx: &mut dyn ChannelControl) {
        if self.started {
            return;
        }
        self.started = true;
        self.start_call();
        if let Some(child) = self.child.as_mut() {
            child.exit_idle(ctx);
        }
        if self.child.is_none() {
            self.tracker
                .set(ConnectivityState::Connecting, None, "waiting for server list");
        }
    }

    fn start_call(&mut self) {
        self.call_id += 1;
        self.retry = None;
        let call = self.call_id;
        let mut responses = self
            .channel
            .balance_load(LoadBalanceRequest::initial(self.server_name.clone()));
        let inbox = self.inbox.clone();
        tracing::debug!(call, service = %self.server_name, "starting balancer call");

        self.call = Some(TaskGuard::spawn(async move {
            while let Some(item) = responses.next().await {
                match item {
                    Ok(response) => inbox.post(Event::Response { call, response }),
                    Err(status) => {
                        inbox.post(Event::CallEnded {
                            call,
                            status: Some(status),
                        });
                        return;
                    }
                }
            }
            inbox.post(Event::CallEnded { call, status: None });
        }));
    }

    fn restart_call(&mut self) {
        self.call = None;
        self.backoff.reset();
        self.initial_response = false;
        self.start_call();
    }

    fn on_response(&mut self, response: LoadBalanceResponse, ctx: &mut dyn ChannelControl) {
        self.backoff.reset();
        match response.load_balance_response_type {
            Some(LoadBalanceResponseType::InitialResponse(initial)) => {
                if self.initial_response {
                    tracing::warn!("ignoring repeated initial response from balancer");
                    return;
                }
                self.initial_response = true;
                let interval = initial
                    .client_stats_report_interval
                    .and_then(|interval| Duration::try_from(interval).ok());
                tracing::info!(
                    client_stats_report_interval = ?interval,
                    "received initial balancer response"
                );
            }
            Some(LoadBalanceResponseType::ServerList(list)) => self.on_server_list(list, ctx),
            None => tracing::warn!("ignoring empty balancer response"),
        }
    }

    fn on_server_list(&mut self, list: ServerList, ctx: &mut dyn ChannelControl) {
        if self.server_list.as_ref() == Some(&list) {
            tracing::debug!("ignoring identical server list");
            return;
        }
        let addresses = backend_addresses(&list);
        tracing::info!(
            received = list.servers.len(),
            usable = addresses.len(),
            "received server list"
        );
        self.server_list = Some(list);
        if addresses.is_empty() {
            tracing::info!("no usable servers, picks stay pending until a non-empty list arrives");
            return;
        }
        self.hand_over(addresses, ctx);
    }

    /// Replace the child with a round_robin over `addresses`, moving every
    /// queued pick and ping onto it before the old child goes away.
    fn hand_over(&mut self, addresses: Vec<Address>, ctx: &mut dyn ChannelControl) {
        let args = LbPolicyArgs {
            addresses,
            service_config: self.service_config.clone(),
            server_name: self.server_name.clone(),
        };
        let mut child = match ctx.create_lb_policy(ROUND_ROBIN, &args) {
            Ok(child) => child,
            Err(error) => {
                tracing::error!(%error, "failed to create child policy, picks stay pending");
                return;
            }
        };

        self.child_id += 1;
        watch_child(&self.inbox, self.child_id, child.as_mut());
        if self.started {
            child.exit_idle(ctx);
        }

        let mut pending = std::mem::take(&mut self.pending);
        if let Some(old) = self.child.as_mut() {
            pending.append(&mut old.take_pending());
        }
        requeue(&mut pending, child.as_mut(), ctx);

        if let Some(mut old) = self.child.replace(child) {
            old.shutdown(PickError::Shutdown(None));
        }
        self.sync_state();
    }

    /// Adopt the child's state, except for TRANSIENT_FAILURE and SHUTDOWN
    /// which leave the previous state in place.
    fn sync_state(&mut self) {
        let Some(child) = self.child.as_ref() else {
            return;
        };
        match child.check_connectivity_state() {
            ConnectivityState::TransientFailure | ConnectivityState::Shutdown => {}
            state => self.tracker.set(state, None, "child policy state changed"),
        }
    }

    fn on_call_ended(&mut self, status: Option<tonic::Status>) {
        self.call = None;
        let delay = self.backoff.next_delay();
        match status {
            Some(status) => {
                tracing::warn!(code = ?status.code(), message = status.message(), ?delay, "balancer call failed, retrying")
            }
            None => tracing::warn!(?delay, "balancer closed the stream, retrying"),
        }
        let inbox = self.inbox.clone();
        let call = self.call_id;
        self.retry = Some(TaskGuard::spawn(async move {
            tokio::time::sleep(delay).await;
            inbox.post(Event::Retry { call });
        }));
    }
}

impl LbPolicy for Grpclb {
    fn name(&self) -> &'static str {
        GRPCLB
    }

    fn update(&mut self, args: &LbPolicyArgs, ctx: &mut dyn ChannelControl) {
        if self.shut_down {
            return;
        }
        self.service_config = args.service_config.clone();
        let balancers = balancer_addresses(&args.addresses);
        if balancers.is_empty() {
            tracing::warn!("ignoring update without balancer addresses");
            return;
        }
        if balancers == self.balancers {
            return;
        }

        match ctx.create_balancer_channel(&balancers) {
            Ok(channel) => {
                tracing::info!(balancers = balancers.len(), "balancer addresses changed");
                self.channel = channel;
                self.balancers = balancers;
                if self.started {
                    self.restart_call();
                }
            }
            Err(error) => {
                tracing::error!(error = %SharedError::from(error), "failed to create balancer channel, keeping the current one")
            }
        }
    }

    fn pick(&mut self, pick: PendingPick, ctx: &mut dyn ChannelControl) -> PickResult {
        if self.shut_down {
            return PickResult::Complete(pick, Err(PickError::Shutdown(None)));
        }
        self.start(ctx);
        match self.child.as_mut() {
            Some(child) => child.pick(pick, ctx),
            None => {
                self.pending.push_pick(pick);
                PickResult::Queued
            }
        }
    }

    fn cancel_pick(&mut self, id: PickId, error: PickError) {
        if !self.pending.cancel_pick(id, error.clone()) {
            if let Some(child) = self.child.as_mut() {
                child.cancel_pick(id, error);
            }
        }
    }

    fn cancel_picks_matching(&mut self, predicate: &dyn Fn(&CallInfo) -> bool, error: PickError) {
        self.pending.cancel_picks_matching(predicate, error.clone());
        if let Some(child) = self.child.as_mut() {
            child.cancel_picks_matching(predicate, error);
        }
    }

    fn ping_one(&mut self, ping: PendingPing, ctx: &mut dyn ChannelControl) -> PingResult {
        if self.shut_down {
            return PingResult::Failed(ping, PickError::Shutdown(None));
        }
        self.start(ctx);
        match self.child.as_mut() {
            Some(child) => child.ping_one(ping, ctx),
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
        self.child.as_ref().and_then(|child| child.connectivity_error())
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
        if let Some(child) = self.child.as_mut() {
            child.subchannel_update(subchannel, state, ctx);
            self.sync_state();
        }
    }

    fn work(&mut self, ctx: &mut dyn ChannelControl) {
        for event in self.inbox.drain() {
            if self.shut_down {
                return;
            }
            match event {
                Event::Response { call, response } if call == self.call_id => {
                    self.on_response(response, ctx)
                }
                Event::CallEnded { call, status } if call == self.call_id => {
                    self.on_call_ended(status)
                }
                Event::Retry { call } if call == self.call_id && self.call.is_none() => {
                    self.start_call()
                }
                Event::ChildState { child } if child == self.child_id => {
                    self.sync_state();
                    if let Some(policy) = self.child.as_mut() {
                        watch_child(&self.inbox, child, policy.as_mut());
                    }
                }
                _ => tracing::trace!("dropping stale balancer event"),
            }
        }
    }

    fn take_pending(&mut self) -> PendingQueue {
        let mut pending = std::mem::take(&mut self.pending);
        if let Some(child) = self.child.as_mut() {
            pending.append(&mut child.take_pending());
        }
        pending
    }

    fn shutdown(&mut self, error: PickError) {
        debug_assert!(!self.shut_down, "grpclb shut down twice");
        self.shut_down = true;
        self.call = None;
        self.retry = None;
        self.pending.fail_all(error.clone());
        if let Some(mut child) = self.child.take() {
            child.shutdown(error);
        }
        self.tracker
            .set(ConnectivityState::Shutdown, None, "policy shut down");
    }
}

/// Post a [`Event::ChildState`] once `child` leaves its current state.
fn watch_child(inbox: &Inbox<Event>, id: u64, child: &mut dyn LbPolicy) {
    let inbox = inbox.clone();
    let watcher = Completion::new(
        move |_| inbox.post(Event::ChildState { child: id }),
        || ConnectivityState::Shutdown,
    );
    let current = child.check_connectivity_state();
    child.notify_on_state_change(current, watcher);
}

fn balancer_addresses(addresses: &[Address]) -> Vec<Address> {
    addresses
        .iter()
        .filter(|address| address.is_balancer())
        .cloned()
        .collect()
}

/// The usable backends of a server list, in order.
fn backend_addresses(list: &ServerList) -> Vec<Address> {
    list.servers
        .iter()
        .enumerate()
        .filter_map(|(index, server)| match backend_address(server) {
            Ok(address) => Some(address),
            Err(error) => {
                tracing::error!(index, %error, "skipping invalid server list entry");
                None
            }
        })
        .collect()
}

fn backend_address(server: &Server) -> Result<Address, InvalidServer> {
    if server.drop {
        return Err(InvalidServer::Drop);
    }
    let port = u16::try_from(server.port).map_err(|_| InvalidServer::Port(server.port))?;
    let ip = match <[u8; 4]>::try_from(server.ip_address.as_slice()) {
        Ok(octets) => IpAddr::V4(Ipv4Addr::from(octets)),
        Err(_) => match <[u8; 16]>::try_from(server.ip_address.as_slice()) {
            Ok(octets) => IpAddr::V6(Ipv6Addr::from(octets)),
            Err(_) => return Err(InvalidServer::IpLength(server.ip_address.len())),
        },
    };

    let address = Address::from(SocketAddr::new(ip, port));
    if server.load_balance_token.is_empty() {
        Ok(address)
    } else {
        Ok(address.with_lb_token(Bytes::from(server.load_balance_token.clone())))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::lb::{testing::Harness, PickOutcome};
    use futures::stream;
    use proto::InitialLoadBalanceResponse;
    use std::sync::Mutex;
    use tokio::sync::{mpsc, oneshot};

    type ResponseSender = mpsc::UnboundedSender<Result<LoadBalanceResponse, tonic::Status>>;

    #[derive(Default)]
    struct FakeBalancer {
        calls: Mutex<Vec<(LoadBalanceRequest, ResponseSender)>>,
    }

    impl BalancerChannel for FakeBalancer {
        fn balance_load(
            &self,
            request: LoadBalanceRequest,
        ) -> BoxStream<'static, Result<LoadBalanceResponse, tonic::Status>> {
            let (sender, receiver) = mpsc::unbounded_channel();
            self.calls.lock().unwrap().push((request, sender));
            stream::unfold(receiver, |mut receiver| async move {
                receiver.recv().await.map(|item| (item, receiver))
            })
            .boxed()
        }
    }

    impl FakeBalancer {
        fn calls(&self) -> usize {
            self.calls.lock().unwrap().len()
        }

        fn respond(&self, response: LoadBalanceResponse) {
            let calls = self.calls.lock().unwrap();
            let (_, sender) = calls.last().expect("no balancer call");
            sender.send(Ok(response)).unwrap();
        }

        fn fail(&self) {
            let calls = self.calls.lock().unwrap();
            let (_, sender) = calls.last().expect("no balancer call");
            sender
                .send(Err(tonic::Status::unavailable("balancer going away")))
                .unwrap();
        }
    }

    fn server(ip: &[u8], port: i32, token: &str) -> Server {
        Server {
            ip_address: ip.to_vec(),
            port,
            load_balance_token: token.to_string(),
            drop: false,
        }
    }

    fn server_list(servers: Vec<Server>) -> LoadBalanceResponse {
        LoadBalanceResponse {
            load_balance_response_type: Some(LoadBalanceResponseType::ServerList(ServerList {
                servers,
            })),
        }
    }

    fn setup() -> (Harness, Arc<FakeBalancer>, Grpclb) {
        let mut harness = Harness::new();
        let balancer = Arc::new(FakeBalancer::default());
        harness.factory.set_balancer(balancer.clone());
        let args = LbPolicyArgs {
            addresses: vec![Address::balancer("10.1.0.1:9000", "lb.example.com")],
            service_config: None,
            server_name: "test.service".to_string(),
        };
        let policy = Grpclb::new(&args, &mut harness).unwrap();
        (harness, balancer, policy)
    }

    fn queue_pick(
        policy: &mut Grpclb,
        harness: &mut Harness,
        call: CallInfo,
    ) -> oneshot::Receiver<PickOutcome> {
        let (pick, receiver) = PendingPick::channel(call);
        policy.pick(pick, harness).finish();
        receiver
    }

    #[tokio::test]
    async fn requires_balancer_addresses() {
        let mut harness = Harness::new();
        let error = harness
            .create_lb_policy(GRPCLB, &crate::lb::testing::args(&["10.0.0.1:80"]))
            .unwrap_err();
        assert!(matches!(error, LbPolicyError::NoAddresses(GRPCLB)));
    }

    #[tokio::test]
    async fn picks_wait_for_the_server_list() {
        let (mut harness, balancer, mut policy) = setup();
        let mut receiver = queue_pick(&mut policy, &mut harness, CallInfo::new());

        assert_eq!(balancer.calls(), 1);
        assert_eq!(
            balancer.calls.lock().unwrap()[0].0,
            LoadBalanceRequest::initial("test.service")
        );
        assert!(receiver.try_recv().is_err());

        balancer.respond(LoadBalanceResponse {
            load_balance_response_type: Some(LoadBalanceResponseType::InitialResponse(
                InitialLoadBalanceResponse::default(),
            )),
        });
        balancer.respond(server_list(vec![server(&[10, 0, 0, 1], 80, "token-1")]));
        harness
            .drive_until_state(&mut policy, ConnectivityState::Ready)
            .await;

        let connection = receiver.await.unwrap().unwrap();
        assert_eq!(connection.address().endpoint(), "10.0.0.1:80");
        assert_eq!(connection.lb_token().map(|t| &t[..]), Some(&b"token-1"[..]));
    }

    #[tokio::test]
    async fn invalid_entries_are_skipped() {
        let (mut harness, balancer, mut policy) = setup();
        let mut receiver = queue_pick(&mut policy, &mut harness, CallInfo::new());

        let mut dropped = server(&[10, 0, 0, 2], 80, "");
        dropped.drop = true;
        balancer.respond(server_list(vec![
            dropped,
            server(&[10, 0, 0, 3], 70000, ""),
            server(&[10, 0, 0], 80, ""),
        ]));
        harness.settle(&mut policy).await;

        assert!(policy.child.is_none());
        assert!(receiver.try_recv().is_err());
        assert_eq!(policy.check_connectivity_state(), ConnectivityState::Connecting);

        balancer.respond(server_list(vec![server(
            &[0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1],
            443,
            "",
        )]));
        harness
            .drive_until_state(&mut policy, ConnectivityState::Ready)
            .await;
        let connection = receiver.await.unwrap().unwrap();
        assert_eq!(connection.address().endpoint(), "[::1]:443");
    }

    #[tokio::test]
    async fn identical_server_list_is_ignored() {
        let (mut harness, balancer, mut policy) = setup();
        policy.exit_idle(&mut harness);

        balancer.respond(server_list(vec![server(&[10, 0, 0, 1], 80, "")]));
        harness
            .drive_until_state(&mut policy, ConnectivityState::Ready)
            .await;
        assert_eq!(policy.child_id, 1);

        balancer.respond(server_list(vec![server(&[10, 0, 0, 1], 80, "")]));
        harness.settle(&mut policy).await;
        assert_eq!(policy.child_id, 1);
    }

    #[tokio::test]
    async fn hand_over_moves_queued_picks_to_the_new_child() {
        let (mut harness, balancer, mut policy) = setup();
        harness.factory.fail("10.0.0.1:80");
        let receiver = queue_pick(
            &mut policy,
            &mut harness,
            CallInfo::new().with_wait_for_ready(true),
        );

        balancer.respond(server_list(vec![server(&[10, 0, 0, 1], 80, "")]));
        harness.settle(&mut policy).await;
        assert_eq!(policy.child_id, 1);
        assert_eq!(policy.check_connectivity_state(), ConnectivityState::Connecting);

        balancer.respond(server_list(vec![server(&[10, 0, 0, 2], 80, "")]));
        harness
            .drive_until_state(&mut policy, ConnectivityState::Ready)
            .await;

        let connection = receiver.await.unwrap().unwrap();
        assert_eq!(connection.address().endpoint(), "10.0.0.2:80");
    }

    #[tokio::test]
    async fn broken_stream_is_retried() {
        let (mut harness, balancer, mut policy) = setup();
        policy.exit_idle(&mut harness);
        balancer.respond(server_list(vec![server(&[10, 0, 0, 1], 80, "")]));
        harness
            .drive_until_state(&mut policy, ConnectivityState::Ready)
            .await;

        balancer.fail();
        let watched = Arc::clone(&balancer);
        harness
            .drive_until(&mut policy, |_| watched.calls() == 2)
            .await;

        assert_eq!(policy.check_connectivity_state(), ConnectivityState::Ready);
    }

    #[tokio::test]
    async fn new_balancer_addresses_restart_the_call() {
        let (mut harness, balancer, mut policy) = setup();
        policy.exit_idle(&mut harness);
        assert_eq!(balancer.calls(), 1);

        let same = LbPolicyArgs {
            addresses: vec![Address::balancer("10.1.0.1:9000", "lb.example.com")],
            service_config: None,
            server_name: "test.service".to_string(),
        };
        policy.update(&same, &mut harness);
        assert_eq!(balancer.calls(), 1);

        let moved = LbPolicyArgs {
            addresses: vec![Address::balancer("10.1.0.2:9000", "lb.example.com")],
            ..same
        };
        policy.update(&moved, &mut harness);
        assert_eq!(balancer.calls(), 2);
    }

    #[test]
    fn server_entries_are_validated() {
        assert!(matches!(
            backend_address(&Server {
                drop: true,
                ..server(&[10, 0, 0, 1], 80, "")
            }),
            Err(InvalidServer::Drop)
        ));
        assert!(matches!(
            backend_address(&server(&[10, 0, 0, 1], -1, "")),
            Err(InvalidServer::Port(-1))
        ));
        assert!(matches!(
            backend_address(&server(&[10, 0, 1], 80, "")),
            Err(InvalidServer::IpLength(3))
        ));
        let address = backend_address(&server(&[10, 0, 0, 1], 65535, "tok")).unwrap();
        assert_eq!(address.endpoint(), "10.0.0.1:65535");
        assert_eq!(address.lb_token().map(|t| &t[..]), Some(&b"tok"[..]));
    }
}
