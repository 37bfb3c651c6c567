//! Subchannels: reusable, address-scoped connections shared by LB policies.
//!
//! A [`Subchannel`] owns the connection attempts for one backend address.
//! Attempts run in background tasks that report every state transition back
//! into the router's serialization domain, where the new state is applied and
//! forwarded to the active policy. Subchannels are pooled per router by
//! endpoint, so two policies alive during a hand-over share one connection.
//! The connection is torn down when the last [`Subchannel`] handle is dropped.

use crate::{
    backoff::{Backoff, BackoffConfig},
    connectivity::ConnectivityState,
    error::{PickError, SharedError},
    lb::{grpclb::BalancerChannel, PendingPing},
    work_serializer::TaskGuard,
    Address,
};
use bytes::Bytes;
use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
};
use tracing_futures::Instrument;

/// An established connection to one backend, produced by a [`SubchannelFactory`].
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Round-trip a health-check style ping over the connection.
    async fn ping(&self) -> Result<(), anyhow::Error>;

    /// Resolves once the connection is no longer usable.
    async fn closed(&self);

    /// The tonic channel carrying calls over this connection, if it has one.
    fn grpc_channel(&self) -> Option<tonic::transport::Channel> {
        None
    }
}

/// Per-channel arguments handed to the [`SubchannelFactory`].
#[derive(Debug, Clone, Default)]
pub struct ConnectionArgs {
    /// The authority calls are made to, e.g. the hostname of a DNS target.
    /// Used as TLS server name when connecting to resolved IPs.
    pub authority: String,
}

/// Creates the connections subchannels and balancer channels run over.
#[async_trait::async_trait]
pub trait SubchannelFactory: Send + Sync + 'static {
    /// Establish a connection to `address`.
    async fn connect(
        &self,
        address: &Address,
        args: &ConnectionArgs,
    ) -> Result<Arc<dyn Transport>, anyhow::Error>;

    /// Create a channel spanning the given balancer addresses, used by the
    /// delegating policy to talk to its external load balancer.
    fn create_balancer_channel(
        &self,
        balancers: &[Address],
        args: &ConnectionArgs,
    ) -> Result<Arc<dyn BalancerChannel>, anyhow::Error>;
}

/// A connection picked for one call.
#[derive(Clone)]
pub struct Connection {
    subchannel: Subchannel,
    transport: Arc<dyn Transport>,
    lb_token: Option<Bytes>,
}

impl Connection {
    pub fn address(&self) -> &Address {
        self.subchannel.address()
    }

    pub fn subchannel(&self) -> &Subchannel {
        &self.subchannel
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn grpc_channel(&self) -> Option<tonic::transport::Channel> {
        self.transport.grpc_channel()
    }

    /// Token the balancer asked to be sent along with calls to this backend.
    pub fn lb_token(&self) -> Option<&Bytes> {
        self.lb_token.as_ref()
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("address", &self.subchannel.address().endpoint())
            .field("lb_token", &self.lb_token)
            .finish()
    }
}

/// A state transition reported by a connection attempt.
pub(crate) struct SubchannelUpdate {
    subchannel: Weak<SubchannelInner>,
    attempt: u64,
    state: ConnectivityState,
    transport: Option<Arc<dyn Transport>>,
    error: Option<SharedError>,
}

/// Where connection attempts report their updates, typically a closure
/// submitting the update to the router's serialization domain.
pub(crate) type UpdateSink = Arc<dyn Fn(SubchannelUpdate) + Send + Sync>;

struct SubchannelContext {
    factory: Arc<dyn SubchannelFactory>,
    args: ConnectionArgs,
    sink: UpdateSink,
    backoff: BackoffConfig,
}

struct SubchannelInner {
    id: u64,
    address: Address,
    context: Arc<SubchannelContext>,
    status: Mutex<Status>,
}

struct Status {
    state: ConnectivityState,
    transport: Option<Arc<dyn Transport>>,
    error: Option<SharedError>,
    attempt: u64,
    backoff: Backoff,
    task: Option<TaskGuard>,
}

/// Handle to a pooled connection for one address.
///
/// Clones share the same connection. State is only mutated from inside the
/// serialization domain.
#[derive(Clone)]
pub struct Subchannel {
    inner: Arc<SubchannelInner>,
}

impl Subchannel {
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn address(&self) -> &Address {
        &self.inner.address
    }

    pub fn state(&self) -> ConnectivityState {
        self.status().state
    }

    /// The error behind the last TRANSIENT_FAILURE or disconnect.
    pub fn error(&self) -> Option<SharedError> {
        self.status().error.clone()
    }

    pub fn ptr_eq(&self, other: &Subchannel) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// The connection to hand to a call, if the subchannel is READY.
    pub fn connection(&self, lb_token: Option<Bytes>) -> Option<Connection> {
        let status = self.status();
        match (&status.state, &status.transport) {
            (ConnectivityState::Ready, Some(transport)) => Some(Connection {
                subchannel: self.clone(),
                transport: Arc::clone(transport),
                lb_token,
            }),
            _ => None,
        }
    }

    /// Start connecting unless an attempt (or its backoff) is in progress.
    pub fn request_connection(&self) {
        let mut status = self.status();
        if status.task.is_some() || status.state == ConnectivityState::Shutdown {
            return;
        }
        status.attempt += 1;
        let retry_delay = status.backoff.next_delay();
        let attempt = status.attempt;
        let weak = Arc::downgrade(&self.inner);
        let context = Arc::clone(&self.inner.context);
        let address = self.inner.address.clone();
        let span = tracing::debug_span!("subchannel", address = %address, attempt);

        status.task = Some(TaskGuard::spawn(
            async move {
                let report = |state: ConnectivityState,
                              transport: Option<Arc<dyn Transport>>,
                              error: Option<SharedError>| {
                    (context.sink)(SubchannelUpdate {
                        subchannel: weak.clone(),
                        attempt,
                        state,
                        transport,
                        error,
                    })
                };

                report(ConnectivityState::Connecting, None, None);
                match context.factory.connect(&address, &context.args).await {
                    Ok(transport) => {
                        tracing::debug!("connected");
                        report(ConnectivityState::Ready, Some(Arc::clone(&transport)), None);
                        transport.closed().await;
                        tracing::debug!("connection closed");
                        report(
                            ConnectivityState::Idle,
                            None,
                            Some(SharedError::msg(format!("connection to {address} closed"))),
                        );
                    }
                    Err(error) => {
                        let error = SharedError::from(
                            error.context(format!("failed to connect to {address}")),
                        );
                        tracing::debug!(%error, ?retry_delay, "connection attempt failed");
                        report(ConnectivityState::TransientFailure, None, Some(error.clone()));
                        tokio::time::sleep(retry_delay).await;
                        report(ConnectivityState::Idle, None, Some(error));
                    }
                }
            }
            .instrument(span),
        ));
    }

    /// Ping over the current connection, completing `ping` with the outcome.
    pub fn ping(&self, ping: PendingPing) {
        let transport = self.status().transport.clone();
        let Some(transport) = transport else {
            ping.complete(Err(PickError::Unavailable(SharedError::msg(format!(
                "subchannel {} is not connected",
                self.address()
            )))));
            return;
        };
        tokio::spawn(async move {
            let outcome = transport
                .ping()
                .await
                .map_err(|error| PickError::Unavailable(error.into()));
            ping.complete(outcome);
        });
    }

    /// Apply an update reported by a connection attempt. Returns `true` if
    /// the state changed, `false` for no-ops and stale attempts.
    pub(crate) fn apply(&self, update: SubchannelUpdate) -> bool {
        let mut status = self.status();
        if update.attempt != status.attempt {
            return false;
        }
        match update.state {
            ConnectivityState::Ready => {
                status.transport = update.transport;
                status.error = None;
                status.backoff.reset();
            }
            ConnectivityState::Idle => {
                // The attempt is over, a new one may be requested.
                status.transport = None;
                status.task = None;
                status.error = update.error;
            }
            ConnectivityState::TransientFailure => {
                status.transport = None;
                status.error = update.error;
            }
            ConnectivityState::Connecting | ConnectivityState::Shutdown => {}
        }
        if status.state == update.state {
            return false;
        }
        status.state = update.state;
        true
    }

    fn status(&self) -> MutexGuard<'_, Status> {
        self.inner
            .status
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl SubchannelUpdate {
    /// The subchannel this update is about, if it is still alive.
    pub(crate) fn subchannel(&self) -> Option<Subchannel> {
        self.subchannel
            .upgrade()
            .map(|inner| Subchannel { inner })
    }
}

impl fmt::Debug for Subchannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subchannel")
            .field("id", &self.inner.id)
            .field("address", &self.inner.address.endpoint())
            .finish()
    }
}

/// Per-router pool handing out one [`Subchannel`] per endpoint.
pub(crate) struct SubchannelPool {
    context: Arc<SubchannelContext>,
    subchannels: HashMap<String, Weak<SubchannelInner>>,
    next_id: u64,
}

impl SubchannelPool {
    pub(crate) fn new(
        factory: Arc<dyn SubchannelFactory>,
        args: ConnectionArgs,
        backoff: BackoffConfig,
        sink: UpdateSink,
    ) -> Self {
        Self {
            context: Arc::new(SubchannelContext {
                factory,
                args,
                sink,
                backoff,
            }),
            subchannels: HashMap::new(),
            next_id: 0,
        }
    }

    /// The live subchannel for `address`, or a new IDLE one.
    pub(crate) fn get_or_create(&mut self, address: &Address) -> Subchannel {
        if let Some(inner) = self
            .subchannels
            .get(address.endpoint())
            .and_then(Weak::upgrade)
        {
            return Subchannel { inner };
        }

        self.subchannels.retain(|_, weak| weak.strong_count() > 0);
        self.next_id += 1;
        let inner = Arc::new(SubchannelInner {
            id: self.next_id,
            address: Address::new(address.endpoint()),
            context: Arc::clone(&self.context),
            status: Mutex::new(Status {
                state: ConnectivityState::Idle,
                transport: None,
                error: None,
                attempt: 0,
                backoff: Backoff::new(self.context.backoff),
                task: None,
            }),
        });
        self.subchannels
            .insert(address.endpoint().to_string(), Arc::downgrade(&inner));
        tracing::debug!(address = %address, id = inner.id, "created subchannel");
        Subchannel { inner }
    }

    pub(crate) fn create_balancer_channel(
        &self,
        balancers: &[Address],
    ) -> Result<Arc<dyn BalancerChannel>, anyhow::Error> {
        self.context
            .factory
            .create_balancer_channel(balancers, &self.context.args)
    }

    #[cfg(test)]
    pub(crate) fn live(&self) -> usize {
        self.subchannels
            .values()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }
}
