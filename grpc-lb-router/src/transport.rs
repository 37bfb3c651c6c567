//! tonic-backed connections for subchannels and balancer streams.

use crate::{
    lb::grpclb::{
        proto::{LoadBalanceRequest, LoadBalanceResponse},
        BalancerChannel,
    },
    subchannel::{ConnectionArgs, SubchannelFactory, Transport},
    Address,
};
use anyhow::Context as _;
use futures::{stream::BoxStream, StreamExt};
use http::uri::PathAndQuery;
use std::{
    fmt,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use tonic::{
    codec::ProstCodec,
    transport::{Channel, ClientTlsConfig, Endpoint},
    Code, Status,
};
use tonic_health::pb::{
    health_check_response::ServingStatus, health_client::HealthClient, HealthCheckRequest,
};

const BALANCE_LOAD_PATH: &str = "/grpc.lb.v1.LoadBalancer/BalanceLoad";

/// Default interval between two health checks of an established connection.
pub const DEFAULT_HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(10);

type EndpointLayer = Arc<dyn Fn(Endpoint) -> Option<Endpoint> + Send + Sync>;

/// Opens tonic [`Channel`]s to backends and balancers.
///
/// Every backend connection is established eagerly and then health-checked
/// periodically with the standard `grpc.health.v1` service. A failing check
/// closes the connection. Servers that do not implement the health service
/// are considered healthy as long as they answer.
#[derive(Clone, Default)]
pub struct TonicConnector {
    timeout: Option<Duration>,
    connect_timeout: Option<Duration>,
    tls_config: Option<ClientTlsConfig>,
    health_check_interval: Option<Duration>,
    endpoint_layer: Option<EndpointLayer>,
}

impl TonicConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a request timeout that will be applied to every new `Endpoint`.
    pub fn timeout(self, timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            ..self
        }
    }

    /// Set a connection timeout that will be applied to every new `Endpoint`.
    ///
    /// Defaults to the overall request `timeout` if not set.
    pub fn connect_timeout(self, connect_timeout: Duration) -> Self {
        Self {
            connect_timeout: Some(connect_timeout),
            ..self
        }
    }

    /// Connect using TLS. The server name is taken from the channel's
    /// authority, since backends are dialed by IP.
    pub fn with_tls(self, tls_config: ClientTlsConfig) -> Self {
        Self {
            tls_config: Some(tls_config),
            ..self
        }
    }

    /// How often an established connection is health-checked.
    ///
    /// Defaults to [`DEFAULT_HEALTH_CHECK_INTERVAL`].
    pub fn health_check_interval(self, interval: Duration) -> Self {
        Self {
            health_check_interval: Some(interval),
            ..self
        }
    }

    /// Apply additional configuration to every endpoint before connecting.
    /// Returning `None` fails the connection attempt.
    pub fn with_endpoint_layer<F>(self, layer: F) -> Self
    where
        F: Fn(Endpoint) -> Option<Endpoint> + Send + Sync + 'static,
    {
        Self {
            endpoint_layer: Some(Arc::new(layer)),
            ..self
        }
    }

    fn endpoint(&self, address: &str, server_name: &str) -> Result<Endpoint, anyhow::Error> {
        let scheme = if self.tls_config.is_some() {
            "https"
        } else {
            "http"
        };
        let mut endpoint = Endpoint::from_shared(format!("{scheme}://{address}"))
            .with_context(|| format!("invalid endpoint address '{address}'"))?;

        if let Some(timeout) = self.timeout {
            endpoint = endpoint.timeout(timeout);
        }
        if let Some(connect_timeout) = self.connect_timeout.or(self.timeout) {
            endpoint = endpoint.connect_timeout(connect_timeout);
        }
        if let Some(tls_config) = &self.tls_config {
            endpoint = endpoint
                .tls_config(tls_config.clone().domain_name(server_name))
                .context("invalid tls configuration")?;
        }
        match &self.endpoint_layer {
            Some(layer) => layer(endpoint)
                .ok_or_else(|| anyhow::anyhow!("endpoint layer rejected '{address}'")),
            None => Ok(endpoint),
        }
    }
}

impl fmt::Debug for TonicConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TonicConnector")
            .field("timeout", &self.timeout)
            .field("connect_timeout", &self.connect_timeout)
            .field("tls", &self.tls_config.is_some())
            .field("health_check_interval", &self.health_check_interval)
            .finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl SubchannelFactory for TonicConnector {
    async fn connect(
        &self,
        address: &Address,
        args: &ConnectionArgs,
    ) -> Result<Arc<dyn Transport>, anyhow::Error> {
        let channel = self
            .endpoint(address.endpoint(), server_name(&args.authority))?
            .connect()
            .await
            .with_context(|| format!("failed to connect to {address}"))?;

        Ok(Arc::new(TonicTransport {
            channel,
            health_check_interval: self
                .health_check_interval
                .unwrap_or(DEFAULT_HEALTH_CHECK_INTERVAL),
        }))
    }

    fn create_balancer_channel(
        &self,
        balancers: &[Address],
        args: &ConnectionArgs,
    ) -> Result<Arc<dyn BalancerChannel>, anyhow::Error> {
        let channels = balancers
            .iter()
            .map(|balancer| {
                let name = balancer
                    .attributes()
                    .balancer_name
                    .as_deref()
                    .unwrap_or_else(|| server_name(&args.authority));
                Ok(self.endpoint(balancer.endpoint(), name)?.connect_lazy())
            })
            .collect::<Result<Vec<_>, anyhow::Error>>()?;
        anyhow::ensure!(!channels.is_empty(), "no balancer addresses");

        Ok(Arc::new(TonicBalancerChannel {
            channels,
            next: AtomicUsize::new(0),
        }))
    }
}

/// The host part of an `authority`, used as TLS server name.
fn server_name(authority: &str) -> &str {
    if let Some(rest) = authority.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }
    match authority.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') && port.parse::<u16>().is_ok() => host,
        _ => authority,
    }
}

/// An established tonic connection to one backend.
pub struct TonicTransport {
    channel: Channel,
    health_check_interval: Duration,
}

impl TonicTransport {
    async fn check(&self) -> Result<(), anyhow::Error> {
        let mut client = HealthClient::new(self.channel.clone());
        match client
            .check(HealthCheckRequest {
                service: String::new(),
            })
            .await
        {
            Ok(response) => {
                let status = response.into_inner().status();
                anyhow::ensure!(
                    status == ServingStatus::Serving,
                    "backend reports {}",
                    status.as_str_name()
                );
                Ok(())
            }
            Err(status) if status.code() == Code::Unimplemented => Ok(()),
            Err(status) => Err(anyhow::Error::new(status).context("health check failed")),
        }
    }
}

#[async_trait::async_trait]
impl Transport for TonicTransport {
    async fn ping(&self) -> Result<(), anyhow::Error> {
        self.check().await
    }

    async fn closed(&self) {
        let mut interval = tokio::time::interval(self.health_check_interval);
        // The first tick completes immediately, right after connecting.
        interval.tick().await;
        loop {
            interval.tick().await;
            if let Err(error) = self.check().await {
                tracing::debug!(error = %format!("{error:#}"), "connection is no longer healthy");
                return;
            }
        }
    }

    fn grpc_channel(&self) -> Option<Channel> {
        Some(self.channel.clone())
    }
}

/// Opens `BalanceLoad` streams, rotating over the balancer addresses on
/// every new stream.
struct TonicBalancerChannel {
    channels: Vec<Channel>,
    next: AtomicUsize,
}

impl BalancerChannel for TonicBalancerChannel {
    fn balance_load(
        &self,
        request: LoadBalanceRequest,
    ) -> BoxStream<'static, Result<LoadBalanceResponse, Status>> {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.channels.len();
        let channel = self.channels[index].clone();

        let call = async move {
            let mut grpc = tonic::client::Grpc::new(channel);
            grpc.ready()
                .await
                .map_err(|error| Status::unavailable(format!("balancer not ready: {error}")))?;
            // The request stream stays open for as long as the call does.
            let requests = futures::stream::once(futures::future::ready(request))
                .chain(futures::stream::pending::<LoadBalanceRequest>());
            let response = grpc
                .streaming(
                    tonic::Request::new(requests),
                    PathAndQuery::from_static(BALANCE_LOAD_PATH),
                    ProstCodec::<LoadBalanceRequest, LoadBalanceResponse>::default(),
                )
                .await?;
            Ok::<_, Status>(response.into_inner())
        };

        futures::stream::once(call)
            .map(|opened| match opened {
                Ok(responses) => responses.boxed(),
                Err(status) => futures::stream::once(futures::future::ready(Err(status))).boxed(),
            })
            .flatten()
            .boxed()
    }
}
