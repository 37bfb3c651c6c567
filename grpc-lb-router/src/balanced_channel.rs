//! Provides the builder and implementation of [`GrpcService`] that routes
//! every call through a [`RequestRouter`].

use crate::{
    resolver::{
        dns::DnsResolverFactory,
        static_list::{Ipv4ResolverFactory, Ipv6ResolverFactory},
        ResolverRegistry,
    },
    transport::TonicConnector,
    CallInfo, DnsResolver, LookupService, RequestRouter, ServiceDefinition,
};
use anyhow::Context as _;
use http::{header::HeaderName, HeaderValue, Request};
use std::{
    convert::TryInto,
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};
use tokio::time::Duration;
use tonic::{
    body::Body,
    client::GrpcService,
    metadata::MetadataMap,
    transport::{Channel, ClientTlsConfig, Endpoint},
    Status,
};
use tower::{Service, ServiceExt};

/// Header carrying the token a balancer assigned to the picked backend.
pub const LB_TOKEN_HEADER: HeaderName = HeaderName::from_static("lb-token");

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Implements tonic [`GrpcService`] on top of a [`RequestRouter`]: every call
/// is routed to the connection the active load-balancing policy picks.
///
/// A failed pick fails the call with an `UNAVAILABLE` status describing
/// which stage failed.
///
/// ```rust
/// #[tokio::main]
/// async fn main() {
///     use grpc_lb_router::LoadBalancedChannel;
///     use tonic_health::pb::health_client::HealthClient;
///
///     let load_balanced_channel = LoadBalancedChannel::builder(("my.hostname", 5000))
///         .channel()
///         .await
///         .expect("failed to construct LoadBalancedChannel");
///
///     let client = HealthClient::new(load_balanced_channel);
/// }
/// ```
///
#[derive(Debug, Clone)]
pub struct LoadBalancedChannel {
    router: RequestRouter,
    wait_for_ready: bool,
}

impl From<RequestRouter> for LoadBalancedChannel {
    fn from(router: RequestRouter) -> Self {
        Self {
            router,
            wait_for_ready: false,
        }
    }
}

impl LoadBalancedChannel {
    /// Start configuring a `LoadBalancedChannel` by passing in the [`ServiceDefinition`]
    /// for the gRPC server service you want to call -  e.g. `my.service.uri` and `5000`.
    ///
    /// The service is resolved through DNS, including any `grpclb` balancers
    /// and service config published for [`ServiceDefinition::hostname`].
    pub fn builder<S>(service_definition: S) -> LoadBalancedChannelBuilder<DnsResolver, S>
    where
        S: TryInto<ServiceDefinition> + Send + Sync + 'static,
        S::Error: Into<Box<dyn std::error::Error + Send + Sync>> + Send + Sync,
    {
        LoadBalancedChannelBuilder::new_with_service(service_definition)
    }

    /// The router the channel sends calls through.
    pub fn router(&self) -> &RequestRouter {
        &self.router
    }
}

impl Service<http::Request<Body>> for LoadBalancedChannel {
    type Response = http::Response<<Channel as GrpcService<Body>>::ResponseBody>;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        // Readiness is decided per call, when a connection has been picked.
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, mut request: Request<Body>) -> Self::Future {
        let router = self.router.clone();
        let call = CallInfo::new()
            .with_path(request.uri().path())
            .with_metadata(MetadataMap::from_headers(request.headers().clone()))
            .with_wait_for_ready(self.wait_for_ready);

        Box::pin(async move {
            let connection = router
                .route_call(call)
                .await
                .map_err(|error| Box::new(Status::from(error)) as BoxError)?;

            if let Some(token) = connection.lb_token() {
                let value = HeaderValue::from_maybe_shared(token.clone())?;
                request.headers_mut().insert(LB_TOKEN_HEADER, value);
            }
            let channel = connection.grpc_channel().ok_or_else(|| {
                Box::new(Status::internal("picked connection carries no gRPC channel")) as BoxError
            })?;

            let response = channel.oneshot(request).await?;
            Ok(response)
        })
    }
}

/// Enumerates the different domain name resolution strategies that
/// the [`LoadBalancedChannelBuilder`] supports.
pub enum ResolutionStrategy {
    /// Creates the channel without waiting for the first resolution result.
    Lazy,
    /// Waits for the first resolution result before creating the channel
    /// in order to start with a non-empty set of IPs.
    Eager { timeout: Duration },
}

/// Builder to configure and create a [`LoadBalancedChannel`].
pub struct LoadBalancedChannelBuilder<T, S> {
    service_definition: S,
    probe_interval: Option<Duration>,
    resolution_strategy: ResolutionStrategy,
    connector: TonicConnector,
    lookup_service: Option<T>,
    lb_policy: Option<String>,
    service_config_lookup: bool,
    wait_for_ready: bool,
}

impl<S> LoadBalancedChannelBuilder<DnsResolver, S>
where
    S: TryInto<ServiceDefinition> + 'static,
    S::Error: Into<Box<dyn std::error::Error + Send + Sync>> + Send + Sync,
{
    /// Set the [`ServiceDefinition`] of the gRPC server service
    /// -  e.g. `my.service.uri` and `5000`.
    pub fn new_with_service(service_definition: S) -> LoadBalancedChannelBuilder<DnsResolver, S> {
        Self {
            service_definition,
            probe_interval: None,
            connector: TonicConnector::new(),
            lookup_service: None,
            resolution_strategy: ResolutionStrategy::Lazy,
            lb_policy: None,
            service_config_lookup: true,
            wait_for_ready: false,
        }
    }

    /// Set a custom [`LookupService`].
    pub fn lookup_service<T: LookupService + 'static>(
        self,
        lookup_service: T,
    ) -> LoadBalancedChannelBuilder<T, S> {
        LoadBalancedChannelBuilder {
            lookup_service: Some(lookup_service),
            service_definition: self.service_definition,
            probe_interval: self.probe_interval,
            connector: self.connector,
            resolution_strategy: self.resolution_strategy,
            lb_policy: self.lb_policy,
            service_config_lookup: self.service_config_lookup,
            wait_for_ready: self.wait_for_ready,
        }
    }
}

impl<T: LookupService + 'static, S> LoadBalancedChannelBuilder<T, S>
where
    S: TryInto<ServiceDefinition> + 'static,
    S::Error: Into<Box<dyn std::error::Error + Send + Sync>> + Send + Sync,
{
    /// Set the how often, the client should probe for changes to  gRPC server endpoints.
    /// Default interval in seconds is 10.
    pub fn dns_probe_interval(self, interval: Duration) -> LoadBalancedChannelBuilder<T, S> {
        Self {
            probe_interval: Some(interval),
            ..self
        }
    }

    /// Set a request timeout that will be applied to every new `Endpoint`.
    pub fn timeout(self, timeout: Duration) -> LoadBalancedChannelBuilder<T, S> {
        Self {
            connector: self.connector.timeout(timeout),
            ..self
        }
    }

    /// Set a connection timeout that will be applied to every new `Endpoint`.
    ///
    /// Defaults to the overall request `timeout` if not set.
    pub fn connect_timeout(self, connection_timeout: Duration) -> LoadBalancedChannelBuilder<T, S> {
        Self {
            connector: self.connector.connect_timeout(connection_timeout),
            ..self
        }
    }

    /// Set the [`ResolutionStrategy`].
    ///
    /// Default set to [`ResolutionStrategy::Lazy`].
    ///
    /// If [`ResolutionStrategy::Lazy`] the domain name will be resolved after-the-fact.
    ///
    /// Instead, if [`ResolutionStrategy::Eager`] is set the first resolution result
    /// is awaited before the [`LoadBalancedChannel`] is returned. If it does not
    /// arrive in time, or resolution fails, the channel creation fails too.
    pub fn resolution_strategy(
        self,
        resolution_strategy: ResolutionStrategy,
    ) -> LoadBalancedChannelBuilder<T, S> {
        Self {
            resolution_strategy,
            ..self
        }
    }

    /// Configure the channel to use tls.
    /// A `tls_config` MUST be specified to use the `HTTPS` scheme.
    ///
    /// Since backends are dialed by IP, the service hostname is used as the
    /// TLS server name.
    pub fn with_tls(self, tls_config: ClientTlsConfig) -> LoadBalancedChannelBuilder<T, S> {
        Self {
            connector: self.connector.with_tls(tls_config),
            ..self
        }
    }

    /// Apply additional configuration to every endpoint the channel connects to.
    pub fn with_endpoint_layer<F>(self, layer: F) -> LoadBalancedChannelBuilder<T, S>
    where
        F: Fn(Endpoint) -> Option<Endpoint> + Send + Sync + 'static,
    {
        Self {
            connector: self.connector.with_endpoint_layer(layer),
            ..self
        }
    }

    /// Load-balancing policy used unless the service config or the resolved
    /// addresses ask for another one. Defaults to `pick_first`.
    pub fn lb_policy(self, name: impl Into<String>) -> LoadBalancedChannelBuilder<T, S> {
        Self {
            lb_policy: Some(name.into()),
            ..self
        }
    }

    /// Whether to look up the service config published in DNS.
    ///
    /// Enabled by default.
    pub fn service_config_lookup(self, enabled: bool) -> LoadBalancedChannelBuilder<T, S> {
        Self {
            service_config_lookup: enabled,
            ..self
        }
    }

    /// Keep calls queued while no backend is reachable instead of failing
    /// them right away.
    pub fn wait_for_ready(self, wait_for_ready: bool) -> LoadBalancedChannelBuilder<T, S> {
        Self {
            wait_for_ready,
            ..self
        }
    }

    /// Construct a [`LoadBalancedChannel`] from the [`LoadBalancedChannelBuilder`] instance.
    pub async fn channel(mut self) -> Result<LoadBalancedChannel, anyhow::Error> {
        let resolvers = match self.lookup_service.take() {
            Some(lookup_service) => Arc::new(
                ResolverRegistry::builder()
                    .register(DnsResolverFactory::new(lookup_service))
                    .register(Ipv4ResolverFactory)
                    .register(Ipv6ResolverFactory)
                    .build(),
            ),
            None => ResolverRegistry::global(),
        };

        let service_definition: ServiceDefinition = self
            .service_definition
            .try_into()
            .map_err(Into::into)
            .map_err(|err| anyhow::anyhow!(err))?;

        let mut builder = RequestRouter::builder(dns_target(&service_definition))
            .resolver_registry(resolvers)
            .subchannel_factory(self.connector)
            .request_service_config(self.service_config_lookup)
            .authority(service_definition.hostname());
        if let Some(interval) = self.probe_interval {
            builder = builder.probe_interval(interval);
        }
        if let Some(lb_policy) = self.lb_policy {
            builder = builder.default_lb_policy(lb_policy);
        }
        let router = builder.build()?;

        if let ResolutionStrategy::Eager { timeout } = self.resolution_strategy {
            tokio::time::timeout(timeout, router.wait_for_resolution())
                .await
                .context("timeout out while attempting to resolve IPs")?
                .context("failed to resolve IPs")?;
        }

        Ok(LoadBalancedChannel {
            router,
            wait_for_ready: self.wait_for_ready,
        })
    }
}

fn dns_target(service_definition: &ServiceDefinition) -> String {
    let hostname = service_definition.hostname();
    if hostname.contains(':') {
        format!("dns:///[{hostname}]:{}", service_definition.port())
    } else {
        format!("dns:///{hostname}:{}", service_definition.port())
    }
}

const _: () = {
    const fn assert_is_send<T: Send>() {}
    assert_is_send::<LoadBalancedChannelBuilder<DnsResolver, ServiceDefinition>>();
    assert_is_send::<LoadBalancedChannel>();
};
