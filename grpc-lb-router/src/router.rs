//! The per-target entry point routing calls to connections.
//!
//! A [`RequestRouter`] owns one resolver and at most one active
//! load-balancing policy. Both live inside the router's serialization
//! domain together with the subchannel pool, so resolution results, picks,
//! cancellations and subchannel state changes are applied one at a time in
//! the order they were submitted.
//!
//! Whenever a resolution result asks for a different policy, the router
//! builds the new one, subscribes to it, hands it every pick still queued on
//! its predecessor and only then shuts the predecessor down.

use crate::{
    backoff::BackoffConfig,
    completion::Completion,
    connectivity::{ConnectivityState, ConnectivityStateTracker},
    error::{error_chain, BuildError, LbPolicyError, PickError, ResolverError, SharedError},
    lb::{
        grpclb::{BalancerChannel, GRPCLB},
        requeue, CallInfo, ChannelControl, LbPolicy, LbPolicyArgs, LbPolicyRegistry, PendingPick,
        PendingPing, PendingQueue, PickId, DEFAULT_LB_POLICY,
    },
    resolver::{
        result_completion, ResolutionOutcome, ResolutionResult, Resolver, ResolverArgs,
        ResolverRegistry, DEFAULT_PROBE_INTERVAL,
    },
    service_config::ServiceConfig,
    subchannel::{
        Connection, ConnectionArgs, Subchannel, SubchannelFactory, SubchannelPool,
        SubchannelUpdate,
    },
    transport::TonicConnector,
    work_serializer::{WeakWorkSerializer, WorkScheduler, WorkSerializer},
    Address, Target,
};
use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::sync::oneshot;

/// Routes calls for one target to connections chosen by the active
/// load-balancing policy.
///
/// Cloning is cheap, every clone drives the same router. The router shuts
/// itself down once the last clone is dropped.
#[derive(Clone)]
pub struct RequestRouter {
    domain: WorkSerializer<RouterCore>,
    target: Target,
    request_service_config: bool,
}

impl RequestRouter {
    pub fn builder(target: impl Into<String>) -> RequestRouterBuilder {
        RequestRouterBuilder::new(target)
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    /// Pick a connection for `call`.
    ///
    /// The pick is queued until the active policy can serve it. Dropping the
    /// returned future cancels the pick.
    pub async fn route_call(&self, call: CallInfo) -> Result<Connection, PickError> {
        let guard = CancelOnDrop {
            domain: self.domain.downgrade(),
            id: Some(call.id()),
        };
        let (pick, outcome) = PendingPick::channel(call);
        self.pick(pick);
        let outcome = outcome
            .await
            .unwrap_or_else(|_| Err(PickError::abandoned()));
        guard.disarm();
        outcome
    }

    /// Submit a pick completed through its own completion.
    pub fn pick(&self, pick: PendingPick) {
        self.domain.run(move |core| core.pick(pick));
    }

    /// Complete the queued pick with `id` as cancelled. Picks that already
    /// completed are not affected.
    pub fn cancel_pick(&self, id: PickId) {
        self.domain
            .run(move |core| core.cancel_pick(id, PickError::Cancelled));
    }

    /// Cancel every queued pick whose call matches `predicate`.
    pub fn cancel_picks_matching<F>(&self, predicate: F)
    where
        F: Fn(&CallInfo) -> bool + Send + 'static,
    {
        self.domain
            .run(move |core| core.cancel_picks_matching(&predicate, PickError::Cancelled));
    }

    /// Ping one connected backend.
    pub async fn ping_one(&self) -> Result<(), PickError> {
        let (ping, outcome) = PendingPing::channel();
        self.domain.run(move |core| core.ping(ping));
        outcome
            .await
            .unwrap_or_else(|_| Err(PickError::abandoned()))
    }

    /// Start resolving and connecting without waiting for a call.
    pub fn exit_idle(&self) {
        self.domain.run(RouterCore::exit_idle);
    }

    /// The router's connectivity state, optionally leaving IDLE.
    pub async fn connectivity_state(&self, try_to_connect: bool) -> ConnectivityState {
        self.query(ConnectivityState::Shutdown, move |core| {
            if try_to_connect && core.tracker.state() == ConnectivityState::Idle {
                core.exit_idle();
            }
            core.tracker.state()
        })
        .await
    }

    /// Wait until the state differs from `current` and return the new one.
    pub async fn wait_for_state_change(&self, current: ConnectivityState) -> ConnectivityState {
        let (watcher, state) = Completion::channel(|| ConnectivityState::Shutdown);
        self.domain
            .run(move |core| core.tracker.notify_on_state_change(current, watcher));
        state.await.unwrap_or(ConnectivityState::Shutdown)
    }

    /// The service config of the latest resolution result.
    ///
    /// When the router was built to request service configs, this waits for
    /// the first resolution result.
    pub async fn service_config(&self) -> Option<Arc<ServiceConfig>> {
        if self.request_service_config {
            let _ = self.wait_for_resolution().await;
        }
        self.query(None, |core| core.service_config.clone()).await
    }

    /// Wait until the first resolution result has been applied.
    pub async fn wait_for_resolution(&self) -> Result<(), PickError> {
        let (completion, resolved) = Completion::channel(|| Err(PickError::abandoned()));
        self.domain
            .run(move |core| core.wait_for_resolution(completion));
        resolved
            .await
            .unwrap_or_else(|_| Err(PickError::abandoned()))
    }

    /// Name of the active load-balancing policy.
    pub async fn lb_policy_name(&self) -> Option<&'static str> {
        self.query(None, |core| core.policy.as_ref().map(|policy| policy.name()))
            .await
    }

    /// Shut the router down, failing every queued operation with `error`.
    ///
    /// Returns once every queued pick and ping, the outstanding resolver
    /// request and every resolution waiter have been completed. A ping
    /// already sent over a connection completes when that connection answers.
    pub async fn shutdown(&self, error: Option<SharedError>) {
        let (done, finished) = oneshot::channel();
        self.domain.run(move |core| {
            core.shutdown(error);
            // Queued behind anything the shutdown itself posted.
            core.weak.run(move |_| {
                let _ = done.send(());
            });
        });
        let _ = finished.await;
    }

    async fn query<T, F>(&self, fallback: T, query: F) -> T
    where
        T: Send + 'static,
        F: FnOnce(&mut RouterCore) -> T + Send + 'static,
    {
        let (sender, receiver) = oneshot::channel();
        self.domain.run(move |core| {
            let _ = sender.send(query(core));
        });
        receiver.await.unwrap_or(fallback)
    }
}

impl fmt::Debug for RequestRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestRouter")
            .field("target", &self.target)
            .finish()
    }
}

/// Cancels a pick whose caller stopped waiting for it.
struct CancelOnDrop {
    domain: WeakWorkSerializer<RouterCore>,
    id: Option<PickId>,
}

impl CancelOnDrop {
    fn disarm(mut self) {
        self.id = None;
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if let Some(id) = self.id.take() {
            self.domain
                .run(move |core| core.cancel_pick(id, PickError::Cancelled));
        }
    }
}

/// Configures and starts a [`RequestRouter`].
pub struct RequestRouterBuilder {
    target: String,
    resolvers: Option<Arc<ResolverRegistry>>,
    lb_policies: Option<Arc<LbPolicyRegistry>>,
    connector: Option<Arc<dyn SubchannelFactory>>,
    default_lb_policy: String,
    request_service_config: bool,
    probe_interval: Duration,
    hostname: Option<String>,
    backoff: BackoffConfig,
    authority: Option<String>,
}

impl RequestRouterBuilder {
    fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            resolvers: None,
            lb_policies: None,
            connector: None,
            default_lb_policy: DEFAULT_LB_POLICY.to_string(),
            request_service_config: false,
            probe_interval: DEFAULT_PROBE_INTERVAL,
            hostname: None,
            backoff: BackoffConfig::default(),
            authority: None,
        }
    }

    /// Resolvers to pick from by target scheme. Defaults to
    /// [`ResolverRegistry::global`].
    pub fn resolver_registry(mut self, registry: Arc<ResolverRegistry>) -> Self {
        self.resolvers = Some(registry);
        self
    }

    /// Policies to pick from by name. Defaults to [`LbPolicyRegistry::global`].
    pub fn lb_policy_registry(mut self, registry: Arc<LbPolicyRegistry>) -> Self {
        self.lb_policies = Some(registry);
        self
    }

    /// How connections to backends and balancers are opened. Defaults to
    /// [`TonicConnector`].
    pub fn subchannel_factory(mut self, factory: impl SubchannelFactory) -> Self {
        self.connector = Some(Arc::new(factory));
        self
    }

    /// Policy used when neither the addresses nor the service config ask for
    /// one.
    pub fn default_lb_policy(mut self, name: impl Into<String>) -> Self {
        self.default_lb_policy = name.into();
        self
    }

    /// Look up the service config published for the target, and make
    /// [`RequestRouter::service_config`] wait for the first result.
    pub fn request_service_config(mut self, request: bool) -> Self {
        self.request_service_config = request;
        self
    }

    /// Interval between two periodic resolutions.
    pub fn probe_interval(mut self, interval: Duration) -> Self {
        self.probe_interval = interval;
        self
    }

    /// Host name matched against `clientHostname` in service config choices.
    pub fn client_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    /// Backoff between connection attempts to the same address.
    pub fn connection_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// Authority used for TLS and `:authority` on every connection. Defaults
    /// to the target's endpoint.
    pub fn authority(mut self, authority: impl Into<String>) -> Self {
        self.authority = Some(authority.into());
        self
    }

    /// Start the router. Must be called from within a tokio runtime.
    pub fn build(self) -> Result<RequestRouter, BuildError> {
        let target = Target::parse(&self.target)?;
        let lb_policies = self.lb_policies.unwrap_or_else(LbPolicyRegistry::global);
        if !lb_policies.contains(&self.default_lb_policy) {
            return Err(BuildError::UnknownLbPolicy(self.default_lb_policy));
        }
        let resolvers = self.resolvers.unwrap_or_else(ResolverRegistry::global);
        let connector = self
            .connector
            .unwrap_or_else(|| Arc::new(TonicConnector::default()));
        let connection_args = ConnectionArgs {
            authority: self
                .authority
                .unwrap_or_else(|| target.endpoint().to_string()),
        };
        let resolver_args = ResolverArgs {
            target: target.clone(),
            probe_interval: self.probe_interval,
            request_service_config: self.request_service_config,
            hostname: self.hostname,
        };
        let backoff = self.backoff;
        let default_lb_policy = self.default_lb_policy;

        let span = tracing::info_span!("request_router", target = %target);
        let core_target = target.clone();
        let domain = WorkSerializer::spawn(span, move |weak: WeakWorkSerializer<RouterCore>| {
            let updates = weak.clone();
            let pool = SubchannelPool::new(
                connector,
                connection_args,
                backoff,
                Arc::new(move |update: SubchannelUpdate| {
                    updates.run(move |core: &mut RouterCore| core.on_subchannel_update(update));
                }),
            );
            RouterCore {
                target: core_target,
                controls: Controls {
                    pool,
                    lb_policies,
                    resolver: Some(resolvers.create(resolver_args)),
                    scheduler: Arc::new(PolicyWork {
                        domain: weak.clone(),
                        scheduled: Arc::default(),
                    }),
                },
                weak,
                default_lb_policy,
                policy: None,
                policy_generation: 0,
                pending: PendingQueue::default(),
                tracker: ConnectivityStateTracker::new("request_router", ConnectivityState::Idle),
                service_config: None,
                resolving: false,
                resolved: false,
                resolution_error: None,
                resolution_waiters: Vec::new(),
                previous_resolution_contained_addresses: false,
                exit_idle_requested: false,
                shutdown_error: None,
            }
        });
        domain.run(RouterCore::start_resolving);

        Ok(RequestRouter {
            domain,
            target,
            request_service_config: self.request_service_config,
        })
    }
}

impl fmt::Debug for RequestRouterBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestRouterBuilder")
            .field("target", &self.target)
            .field("default_lb_policy", &self.default_lb_policy)
            .field("request_service_config", &self.request_service_config)
            .field("probe_interval", &self.probe_interval)
            .finish_non_exhaustive()
    }
}

/// Calls the active policy's `work` method from the domain, coalescing
/// requests made before it runs.
struct PolicyWork {
    domain: WeakWorkSerializer<RouterCore>,
    scheduled: Arc<AtomicBool>,
}

impl WorkScheduler for PolicyWork {
    fn schedule_work(&self) {
        if self.scheduled.swap(true, Ordering::AcqRel) {
            return;
        }
        let scheduled = Arc::clone(&self.scheduled);
        self.domain.run(move |core| {
            scheduled.store(false, Ordering::Release);
            core.run_policy_work();
        });
    }
}

/// The parts of the router a policy may drive.
struct Controls {
    pool: SubchannelPool,
    lb_policies: Arc<LbPolicyRegistry>,
    resolver: Option<Box<dyn Resolver>>,
    scheduler: Arc<PolicyWork>,
}

impl ChannelControl for Controls {
    fn create_subchannel(&mut self, address: &Address) -> Subchannel {
        self.pool.get_or_create(address)
    }

    fn create_balancer_channel(
        &mut self,
        balancers: &[Address],
    ) -> Result<Arc<dyn BalancerChannel>, anyhow::Error> {
        self.pool.create_balancer_channel(balancers)
    }

    fn create_lb_policy(
        &mut self,
        name: &str,
        args: &LbPolicyArgs,
    ) -> Result<Box<dyn LbPolicy>, LbPolicyError> {
        let registry = Arc::clone(&self.lb_policies);
        registry.create(name, args, self)
    }

    fn request_reresolution(&mut self) {
        if let Some(resolver) = self.resolver.as_mut() {
            resolver.notify_channel_saw_error();
        }
    }

    fn work_scheduler(&self) -> Arc<dyn WorkScheduler> {
        self.scheduler.clone()
    }
}

/// Router state, only ever touched from inside the domain.
struct RouterCore {
    target: Target,
    weak: WeakWorkSerializer<RouterCore>,
    controls: Controls,
    default_lb_policy: String,
    policy: Option<Box<dyn LbPolicy>>,
    /// Bumped on every hand-over so watchers of replaced policies are ignored.
    policy_generation: u64,
    /// Picks and pings received before the first policy was created.
    pending: PendingQueue,
    tracker: ConnectivityStateTracker,
    service_config: Option<Arc<ServiceConfig>>,
    resolving: bool,
    resolved: bool,
    resolution_error: Option<ResolverError>,
    resolution_waiters: Vec<Completion<Result<(), PickError>>>,
    previous_resolution_contained_addresses: bool,
    exit_idle_requested: bool,
    shutdown_error: Option<PickError>,
}

impl RouterCore {
    /// The error every new operation fails with once the router is done.
    fn terminal_error(&self) -> Option<PickError> {
        self.shutdown_error.clone().or_else(|| {
            self.resolution_error
                .clone()
                .map(PickError::ResolutionFailed)
        })
    }

    fn start_resolving(&mut self) {
        if self.resolving || self.terminal_error().is_some() {
            return;
        }
        let Some(resolver) = self.controls.resolver.as_mut() else {
            return;
        };
        self.resolving = true;
        tracing::debug!("starting resolver");
        resolver.start_resolving();
        self.request_next_result();
    }

    fn request_next_result(&mut self) {
        let Some(resolver) = self.controls.resolver.as_mut() else {
            return;
        };
        let domain = self.weak.clone();
        resolver.next_result(result_completion(move |outcome: ResolutionOutcome| {
            domain.run(move |core: &mut RouterCore| core.on_resolver_result(outcome));
        }));
    }

    fn on_resolver_result(&mut self, outcome: ResolutionOutcome) {
        if self.shutdown_error.is_some() {
            return;
        }
        match outcome {
            Ok(result) => {
                self.apply_resolution(result);
                self.request_next_result();
            }
            Err(ResolverError::Shutdown(_)) => tracing::debug!("resolver shut down"),
            Err(error) => self.fail_resolution(error),
        }
    }

    fn fail_resolution(&mut self, error: ResolverError) {
        tracing::error!(error = %error_chain(&error), "name resolution failed for good");
        let pick_error = PickError::ResolutionFailed(error.clone());
        self.resolution_error = Some(error.clone());

        if let Some(mut resolver) = self.controls.resolver.take() {
            resolver.shutdown(None);
        }
        if let Some(mut policy) = self.policy.take() {
            policy.shutdown(pick_error.clone());
        }
        self.pending.fail_all(pick_error.clone());
        self.complete_resolution_waiters(Err(pick_error));
        self.tracker.set(
            ConnectivityState::TransientFailure,
            Some(SharedError::new(error)),
            "name resolution failed",
        );
    }

    fn apply_resolution(&mut self, result: ResolutionResult) {
        let ResolutionResult {
            addresses,
            service_config,
        } = result;

        self.service_config = match service_config {
            Some(json) => {
                match ServiceConfig::from_json_with_registry(&json, &self.controls.lb_policies) {
                    Ok(config) => Some(Arc::new(config)),
                    Err(error) => {
                        tracing::warn!(%error, "keeping previous service config, new one is invalid");
                        self.service_config.take()
                    }
                }
            }
            None => None,
        };

        if addresses.is_empty() {
            if self.previous_resolution_contained_addresses {
                tracing::warn!("resolver returned no addresses, previous result had some");
            } else {
                tracing::debug!("resolver returned no addresses");
            }
        }
        self.previous_resolution_contained_addresses = !addresses.is_empty();

        let policy_name = self.select_lb_policy(&addresses);
        let args = LbPolicyArgs {
            addresses,
            service_config: self.service_config.clone(),
            server_name: self.target.endpoint().to_string(),
        };
        match self.policy.as_mut() {
            Some(policy) if policy.name() == policy_name => {
                tracing::debug!(
                    policy = policy.name(),
                    addresses = args.addresses.len(),
                    "updating lb policy"
                );
                policy.update(&args, &mut self.controls);
            }
            _ => self.switch_policy(&policy_name, &args),
        }

        if !self.resolved {
            self.resolved = true;
            self.complete_resolution_waiters(Ok(()));
        }
        self.sync_state("resolution result applied");
    }

    /// Balancer addresses force `grpclb`; otherwise the service config's
    /// choice wins if registered.
    fn select_lb_policy(&self, addresses: &[Address]) -> String {
        let requested = self
            .service_config
            .as_deref()
            .and_then(ServiceConfig::lb_policy_name);

        if addresses.iter().any(Address::is_balancer) {
            if let Some(name) = requested.filter(|name| *name != GRPCLB) {
                tracing::debug!(requested = name, "balancer addresses resolved, using grpclb");
            }
            return GRPCLB.to_string();
        }

        match requested {
            Some(name) if self.controls.lb_policies.contains(name) => name.to_string(),
            Some(name) => {
                tracing::warn!(
                    requested = name,
                    fallback = %self.default_lb_policy,
                    "service config asks for an unknown lb policy"
                );
                self.default_lb_policy.clone()
            }
            None => self.default_lb_policy.clone(),
        }
    }

    fn switch_policy(&mut self, name: &str, args: &LbPolicyArgs) {
        let mut policy = match self.controls.create_lb_policy(name, args) {
            Ok(policy) => policy,
            Err(error) => {
                match &self.policy {
                    Some(current) => tracing::warn!(
                        %error,
                        current = current.name(),
                        "failed to create lb policy, keeping the current one"
                    ),
                    None => {
                        tracing::warn!(%error, "failed to create lb policy, picks stay queued");
                        self.controls.request_reresolution();
                    }
                }
                return;
            }
        };

        tracing::info!(
            from = self.policy.as_ref().map(|policy| policy.name()),
            to = policy.name(),
            "switching lb policy"
        );
        self.policy_generation += 1;
        watch_policy(&self.weak, self.policy_generation, policy.as_mut());

        let was_active = self
            .policy
            .as_ref()
            .is_some_and(|old| old.check_connectivity_state() != ConnectivityState::Idle);
        if self.exit_idle_requested || was_active {
            policy.exit_idle(&mut self.controls);
        }

        let mut pending = match self.policy.as_mut() {
            Some(old) => old.take_pending(),
            None => PendingQueue::default(),
        };
        pending.append(&mut self.pending);
        requeue(&mut pending, policy.as_mut(), &mut self.controls);

        if let Some(mut old) = self.policy.replace(policy) {
            old.shutdown(PickError::Shutdown(None));
        }
    }

    fn on_policy_state_change(&mut self, generation: u64) {
        if generation != self.policy_generation {
            return;
        }
        if let Some(policy) = self.policy.as_mut() {
            watch_policy(&self.weak, generation, policy.as_mut());
        }
        self.sync_state("lb policy state changed");
    }

    /// Mirror the active policy's state, unless the router is done.
    fn sync_state(&mut self, reason: &str) {
        if self.terminal_error().is_some() {
            return;
        }
        if let Some(policy) = &self.policy {
            self.tracker.set(
                policy.check_connectivity_state(),
                policy.connectivity_error(),
                reason,
            );
        }
    }

    /// Leave IDLE while no policy exists yet.
    fn await_first_policy(&mut self) {
        self.start_resolving();
        if self.tracker.state() == ConnectivityState::Idle {
            self.tracker.set(
                ConnectivityState::Connecting,
                None,
                "waiting for the first resolution result",
            );
        }
    }

    fn pick(&mut self, pick: PendingPick) {
        if let Some(error) = self.terminal_error() {
            pick.complete(Err(error));
            return;
        }
        match self.policy.as_mut() {
            Some(policy) => policy.pick(pick, &mut self.controls).finish(),
            None => {
                self.pending.push_pick(pick);
                self.await_first_policy();
            }
        }
    }

    fn cancel_pick(&mut self, id: PickId, error: PickError) {
        if self.pending.cancel_pick(id, error.clone()) {
            return;
        }
        if let Some(policy) = self.policy.as_mut() {
            policy.cancel_pick(id, error);
        }
    }

    fn cancel_picks_matching(&mut self, predicate: &dyn Fn(&CallInfo) -> bool, error: PickError) {
        let cancelled = self
            .pending
            .cancel_picks_matching(predicate, error.clone());
        if cancelled > 0 {
            tracing::debug!(cancelled, "cancelled picks waiting for a policy");
        }
        if let Some(policy) = self.policy.as_mut() {
            policy.cancel_picks_matching(predicate, error);
        }
    }

    fn ping(&mut self, ping: PendingPing) {
        if let Some(error) = self.terminal_error() {
            ping.complete(Err(error));
            return;
        }
        match self.policy.as_mut() {
            Some(policy) => policy.ping_one(ping, &mut self.controls).finish(),
            None => {
                self.pending.push_ping(ping);
                self.await_first_policy();
            }
        }
    }

    fn exit_idle(&mut self) {
        if self.terminal_error().is_some() {
            return;
        }
        self.exit_idle_requested = true;
        match self.policy.as_mut() {
            Some(policy) => {
                policy.exit_idle(&mut self.controls);
                self.sync_state("exit idle requested");
            }
            None => self.await_first_policy(),
        }
    }

    fn wait_for_resolution(&mut self, completion: Completion<Result<(), PickError>>) {
        if self.resolved {
            completion.complete(Ok(()));
        } else if let Some(error) = self.terminal_error() {
            completion.complete(Err(error));
        } else {
            self.start_resolving();
            self.resolution_waiters.push(completion);
        }
    }

    fn complete_resolution_waiters(&mut self, outcome: Result<(), PickError>) {
        for waiter in self.resolution_waiters.drain(..) {
            waiter.complete(outcome.clone());
        }
    }

    fn on_subchannel_update(&mut self, update: SubchannelUpdate) {
        let Some(subchannel) = update.subchannel() else {
            return;
        };
        if !subchannel.apply(update) {
            return;
        }
        if let Some(policy) = self.policy.as_mut() {
            let state = subchannel.state();
            policy.subchannel_update(&subchannel, state, &mut self.controls);
        }
    }

    fn run_policy_work(&mut self) {
        if let Some(policy) = self.policy.as_mut() {
            policy.work(&mut self.controls);
        }
    }

    fn shutdown(&mut self, error: Option<SharedError>) {
        if self.shutdown_error.is_some() {
            return;
        }
        tracing::info!("shutting down");
        let pick_error = PickError::Shutdown(error.clone());
        self.shutdown_error = Some(pick_error.clone());

        if let Some(mut resolver) = self.controls.resolver.take() {
            resolver.shutdown(error.clone());
        }
        if let Some(mut policy) = self.policy.take() {
            policy.shutdown(pick_error.clone());
        }
        self.pending.fail_all(pick_error.clone());
        self.complete_resolution_waiters(Err(pick_error));
        self.tracker
            .set(ConnectivityState::Shutdown, error, "router shut down");
    }
}

impl Drop for RouterCore {
    fn drop(&mut self) {
        self.shutdown(None);
    }
}

/// Re-sync the router whenever `policy` changes state.
fn watch_policy(
    domain: &WeakWorkSerializer<RouterCore>,
    generation: u64,
    policy: &mut dyn LbPolicy,
) {
    let domain = domain.clone();
    let current = policy.check_connectivity_state();
    policy.notify_on_state_change(
        current,
        Completion::new(
            move |_: ConnectivityState| {
                domain.run(move |core: &mut RouterCore| core.on_policy_state_change(generation));
            },
            || ConnectivityState::Shutdown,
        ),
    );
}
