//! Load-balancing policies and the interface the router drives them through.
//!
//! A policy lives inside the router's serialization domain: every method is
//! called from there, with a [`ChannelControl`] giving access to the parts of
//! the channel a policy may use. Asynchronous work a policy starts itself
//! reports back through an [`Inbox`](crate::Inbox) and the policy's
//! [`LbPolicy::work`] method.

pub mod grpclb;
mod pending;
pub mod pick_first;
pub mod round_robin;

pub use pending::{CallInfo, PendingPick, PendingPing, PendingQueue, PickId, PickOutcome};

use crate::{
    connectivity::{ConnectivityState, StateWatcher},
    error::{LbPolicyError, PickError},
    service_config::ServiceConfig,
    subchannel::Subchannel,
    work_serializer::WorkScheduler,
    Address,
};
use grpclb::BalancerChannel;
use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, OnceLock},
};

/// Name of the policy used when neither the addresses nor the service config
/// ask for a specific one.
pub const DEFAULT_LB_POLICY: &str = pick_first::PICK_FIRST;

/// Outcome of [`LbPolicy::pick`].
#[derive(Debug)]
#[must_use]
pub enum PickResult {
    /// The pick can be completed right away. The policy hands it back so the
    /// caller completes it outside of the policy.
    Complete(PendingPick, PickOutcome),
    /// The policy queued the pick and will complete it later.
    Queued,
}

impl PickResult {
    /// Complete the pick if the policy did not queue it.
    pub fn finish(self) {
        if let PickResult::Complete(pick, outcome) = self {
            pick.complete(outcome);
        }
    }
}

/// Outcome of [`LbPolicy::ping_one`].
#[derive(Debug)]
#[must_use]
pub enum PingResult {
    /// The ping was handed to a connected subchannel.
    Sent,
    /// The policy queued the ping until a subchannel is connected.
    Queued,
    Failed(PendingPing, PickError),
}

impl PingResult {
    pub fn finish(self) {
        if let PingResult::Failed(ping, error) = self {
            ping.complete(Err(error));
        }
    }
}

/// Input a policy is created or updated with.
#[derive(Debug, Clone, Default)]
pub struct LbPolicyArgs {
    pub addresses: Vec<Address>,
    pub service_config: Option<Arc<ServiceConfig>>,
    /// The name of the service the channel talks to.
    pub server_name: String,
}

/// The channel capabilities available to a policy.
pub trait ChannelControl {
    /// The pooled subchannel for `address`.
    fn create_subchannel(&mut self, address: &Address) -> Subchannel;

    /// A channel to the given external load balancers.
    fn create_balancer_channel(
        &mut self,
        balancers: &[Address],
    ) -> Result<Arc<dyn BalancerChannel>, anyhow::Error>;

    /// Instantiate a child policy by name.
    fn create_lb_policy(
        &mut self,
        name: &str,
        args: &LbPolicyArgs,
    ) -> Result<Box<dyn LbPolicy>, LbPolicyError>;

    /// Ask the resolver for a fresh result.
    fn request_reresolution(&mut self);

    /// Schedules a call to [`LbPolicy::work`] on the active policy.
    fn work_scheduler(&self) -> Arc<dyn WorkScheduler>;
}

/// A strategy for picking a connection for each call.
pub trait LbPolicy: Send {
    fn name(&self) -> &'static str;

    /// Apply a new resolution result.
    fn update(&mut self, args: &LbPolicyArgs, ctx: &mut dyn ChannelControl);

    /// Pick a connection for a call, or queue the pick until one is available.
    fn pick(&mut self, pick: PendingPick, ctx: &mut dyn ChannelControl) -> PickResult;

    /// Complete the queued pick with `id` with `error`. Unknown ids are ignored.
    fn cancel_pick(&mut self, id: PickId, error: PickError);

    /// Complete every queued pick whose call matches `predicate` with `error`.
    fn cancel_picks_matching(&mut self, predicate: &dyn Fn(&CallInfo) -> bool, error: PickError);

    fn ping_one(&mut self, ping: PendingPing, ctx: &mut dyn ChannelControl) -> PingResult;

    /// Start connecting if the policy has not done so yet.
    fn exit_idle(&mut self, ctx: &mut dyn ChannelControl);

    fn check_connectivity_state(&self) -> ConnectivityState;

    /// The error behind the current TRANSIENT_FAILURE, if any.
    fn connectivity_error(&self) -> Option<crate::SharedError> {
        None
    }

    /// Register a one-shot watcher firing once the state differs from `current`.
    fn notify_on_state_change(&mut self, current: ConnectivityState, watcher: StateWatcher);

    /// A subchannel created through `ctx` changed state.
    fn subchannel_update(
        &mut self,
        subchannel: &Subchannel,
        state: ConnectivityState,
        ctx: &mut dyn ChannelControl,
    );

    /// Process events posted by tasks the policy spawned.
    fn work(&mut self, _ctx: &mut dyn ChannelControl) {}

    /// Give up every queued pick and ping, in the order they were queued.
    fn take_pending(&mut self) -> PendingQueue;

    /// Stop the policy, completing everything it still holds with `error`.
    fn shutdown(&mut self, error: PickError);
}

impl fmt::Debug for dyn LbPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LbPolicy")
            .field("name", &self.name())
            .field("state", &self.check_connectivity_state())
            .finish()
    }
}

/// Creates instances of one policy.
pub trait LbPolicyFactory: Send + Sync {
    fn name(&self) -> &'static str;

    fn create(
        &self,
        args: &LbPolicyArgs,
        ctx: &mut dyn ChannelControl,
    ) -> Result<Box<dyn LbPolicy>, LbPolicyError>;
}

/// Policies available by name.
#[derive(Clone)]
pub struct LbPolicyRegistry {
    factories: HashMap<&'static str, Arc<dyn LbPolicyFactory>>,
}

impl LbPolicyRegistry {
    pub fn builder() -> LbPolicyRegistryBuilder {
        LbPolicyRegistryBuilder {
            factories: HashMap::new(),
        }
    }

    /// A registry with `pick_first`, `round_robin` and `grpclb`.
    pub fn with_defaults() -> Self {
        Self::builder()
            .register(pick_first::PickFirstFactory)
            .register(round_robin::RoundRobinFactory)
            .register(grpclb::GrpclbFactory)
            .build()
    }

    /// The process-wide registry used unless a router is given its own.
    pub fn global() -> Arc<LbPolicyRegistry> {
        static GLOBAL: OnceLock<Arc<LbPolicyRegistry>> = OnceLock::new();
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(Self::with_defaults())))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn create(
        &self,
        name: &str,
        args: &LbPolicyArgs,
        ctx: &mut dyn ChannelControl,
    ) -> Result<Box<dyn LbPolicy>, LbPolicyError> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| LbPolicyError::UnknownPolicy(name.to_string()))?;
        factory.create(args, ctx)
    }
}

impl fmt::Debug for LbPolicyRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.factories.keys().collect();
        names.sort();
        f.debug_struct("LbPolicyRegistry")
            .field("policies", &names)
            .finish()
    }
}

pub struct LbPolicyRegistryBuilder {
    factories: HashMap<&'static str, Arc<dyn LbPolicyFactory>>,
}

impl LbPolicyRegistryBuilder {
    /// Register a policy factory.
    ///
    /// # Panics
    ///
    /// If a factory with the same name was already registered.
    pub fn register(mut self, factory: impl LbPolicyFactory + 'static) -> Self {
        let name = factory.name();
        if self.factories.insert(name, Arc::new(factory)).is_some() {
            panic!("load balancing policy '{name}' registered twice");
        }
        self
    }

    pub fn build(self) -> LbPolicyRegistry {
        LbPolicyRegistry {
            factories: self.factories,
        }
    }
}

/// Hand every queued pick of `pending` to `policy`, completing those it
/// can serve right away. Pings are re-issued the same way.
pub(crate) fn requeue(
    pending: &mut PendingQueue,
    policy: &mut dyn LbPolicy,
    ctx: &mut dyn ChannelControl,
) {
    for pick in pending.take_picks() {
        policy.pick(pick, ctx).finish();
    }
    for ping in pending.take_pings() {
        policy.ping_one(ping, ctx).finish();
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Drives a policy against real subchannels backed by a fake factory,
    //! delivering subchannel updates one at a time.

    use super::*;
    use crate::{
        backoff::BackoffConfig,
        subchannel::{testing::FakeFactory, ConnectionArgs, SubchannelPool, SubchannelUpdate},
    };
    use std::time::Duration;
    use tokio::sync::{mpsc, Notify};

    #[derive(Default)]
    pub(crate) struct TestScheduler {
        notify: Notify,
    }

    impl WorkScheduler for TestScheduler {
        fn schedule_work(&self) {
            self.notify.notify_one();
        }
    }

    enum Step {
        Update(SubchannelUpdate),
        Work,
    }

    pub(crate) struct Harness {
        pub(crate) factory: FakeFactory,
        pub(crate) reresolutions: usize,
        pool: SubchannelPool,
        updates: mpsc::UnboundedReceiver<SubchannelUpdate>,
        registry: LbPolicyRegistry,
        scheduler: Arc<TestScheduler>,
    }

    impl Harness {
        pub(crate) fn new() -> Self {
            let factory = FakeFactory::default();
            let (sender, updates) = mpsc::unbounded_channel();
            let pool = SubchannelPool::new(
                Arc::new(factory.clone()),
                ConnectionArgs::default(),
                BackoffConfig {
                    initial: Duration::from_millis(20),
                    multiplier: 1.0,
                    jitter: 0.0,
                    max: Duration::from_millis(20),
                },
                Arc::new(move |update| {
                    let _ = sender.send(update);
                }),
            );
            Self {
                factory,
                reresolutions: 0,
                pool,
                updates,
                registry: LbPolicyRegistry::with_defaults(),
                scheduler: Arc::default(),
            }
        }

        pub(crate) fn create(&mut self, name: &str, addresses: &[&str]) -> Box<dyn LbPolicy> {
            let args = args(addresses);
            self.create_lb_policy(name, &args).unwrap()
        }

        /// Deliver subchannel updates and scheduled work to `policy` until
        /// `done` holds.
        pub(crate) async fn drive_until(
            &mut self,
            policy: &mut dyn LbPolicy,
            done: impl Fn(&dyn LbPolicy) -> bool,
        ) {
            let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
            while !done(&*policy) {
                let scheduler = Arc::clone(&self.scheduler);
                let step = tokio::select! {
                    update = self.updates.recv() => Step::Update(update.expect("pool is alive")),
                    _ = scheduler.notify.notified() => Step::Work,
                    _ = tokio::time::sleep_until(deadline) => panic!("policy never reached the expected state"),
                };
                match step {
                    Step::Update(update) => {
                        if let Some(subchannel) = update.subchannel() {
                            if subchannel.apply(update) {
                                let state = subchannel.state();
                                policy.subchannel_update(&subchannel, state, self);
                            }
                        }
                    }
                    Step::Work => policy.work(self),
                }
            }
        }

        pub(crate) async fn drive_until_state(
            &mut self,
            policy: &mut dyn LbPolicy,
            state: ConnectivityState,
        ) {
            self.drive_until(policy, |policy| policy.check_connectivity_state() == state)
                .await
        }

        /// Deliver updates until none arrive for a while.
        pub(crate) async fn settle(&mut self, policy: &mut dyn LbPolicy) {
            let _ = tokio::time::timeout(
                Duration::from_millis(100),
                self.drive_until(policy, |_| false),
            )
            .await;
        }

        pub(crate) fn live_subchannels(&self) -> usize {
            self.pool.live()
        }
    }

    pub(crate) fn args(addresses: &[&str]) -> LbPolicyArgs {
        LbPolicyArgs {
            addresses: addresses.iter().map(|a| Address::new(*a)).collect(),
            service_config: None,
            server_name: "test.service".to_string(),
        }
    }

    impl ChannelControl for Harness {
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
            let registry = self.registry.clone();
            registry.create(name, args, self)
        }

        fn request_reresolution(&mut self) {
            self.reresolutions += 1;
        }

        fn work_scheduler(&self) -> Arc<dyn WorkScheduler> {
            self.scheduler.clone()
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn default_registry_knows_builtin_policies() {
        let registry = LbPolicyRegistry::with_defaults();
        assert!(registry.contains("pick_first"));
        assert!(registry.contains("round_robin"));
        assert!(registry.contains("grpclb"));
        assert!(!registry.contains("weighted_target"));
    }

    #[test]
    #[should_panic(expected = "registered twice")]
    fn duplicate_registration_panics() {
        LbPolicyRegistry::builder()
            .register(pick_first::PickFirstFactory)
            .register(pick_first::PickFirstFactory);
    }

    #[tokio::test]
    async fn unknown_policy_is_rejected() {
        let mut harness = testing::Harness::new();
        let error = harness
            .create_lb_policy("weighted_target", &testing::args(&["127.0.0.1:1"]))
            .unwrap_err();
        assert!(matches!(error, LbPolicyError::UnknownPolicy(name) if name == "weighted_target"));
    }
}
