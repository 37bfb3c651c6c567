//! `grpc-lb-router` is the name-resolution and load-balancing layer of a
//! client-side gRPC channel, built on tonic.
//!
//! A [`RequestRouter`] turns a target string such as
//! `dns:///my.service:50051` into connections: a [`Resolver`] produces
//! address lists, a load-balancing policy ([`pick_first`](lb::pick_first),
//! [`round_robin`](lb::round_robin) or [`grpclb`](lb::grpclb)) connects to
//! them and picks one connection per call. [`LoadBalancedChannel`] wraps a
//! router into a tonic [`GrpcService`](tonic::client::GrpcService).
//!
//! # Simple example
//!
//! ```rust
//! #[tokio::main]
//! async fn main() {
//!     use grpc_lb_router::LoadBalancedChannel;
//!     use tonic_health::pb::health_client::HealthClient;
//!
//!     // Create a load balanced channel with the default lookup implementation.
//!     let load_balanced_channel = LoadBalancedChannel::builder(("my.hostname", 5000))
//!         .channel()
//!         .await
//!         .expect("failed to construct LoadBalancedChannel");
//!
//!     let health_client = HealthClient::new(load_balanced_channel);
//! }
//! ```
//!
//! [`LoadBalancedChannel`] also allows plugging in a different implementation of [`LookupService`].
//!
//! ```rust
//! use grpc_lb_router::{LookupService, ServiceDefinition};
//! use std::net::SocketAddr;
//!
//! // This does nothing
//! struct DummyLookupService;
//!
//! #[async_trait::async_trait]
//! impl LookupService for DummyLookupService {
//!     async fn resolve_service_endpoints(
//!         &self,
//!         _definition: &ServiceDefinition,
//!     ) -> Result<Vec<SocketAddr>, anyhow::Error> {
//!         Ok(Vec::new())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     use grpc_lb_router::LoadBalancedChannel;
//!
//!     let load_balanced_channel = LoadBalancedChannel::builder(("my.hostname", 5000))
//!         .lookup_service(DummyLookupService)
//!         .channel()
//!         .await
//!         .expect("failed to construct LoadBalancedChannel");
//! }
//! ```
//!
//! Calls go to the first reachable backend (`pick_first`) unless the service
//! config published for the service asks for another policy. The fallback
//! policy can be changed, e.g. to spread calls over every backend.
//!
//! ```rust
//! #[tokio::main]
//! async fn main() {
//!     use grpc_lb_router::LoadBalancedChannel;
//!
//!     let load_balanced_channel = LoadBalancedChannel::builder(("my.hostname", 5000))
//!         .lb_policy("round_robin")
//!         .dns_probe_interval(std::time::Duration::from_secs(3))
//!         .timeout(std::time::Duration::from_secs(10))
//!         .channel()
//!         .await
//!         .expect("failed to construct LoadBalancedChannel");
//! }
//! ```
//!
//! It's also possible to wait for the first resolution result before the
//! [`LoadBalancedChannel`] is returned.
//!
//! ```rust,no_run
//! #[tokio::main]
//! async fn main() {
//!     use grpc_lb_router::{LoadBalancedChannel, ResolutionStrategy};
//!     use std::time::Duration;
//!
//!     let load_balanced_channel = LoadBalancedChannel::builder(("my.hostname", 5000))
//!         .resolution_strategy(ResolutionStrategy::Eager {
//!             timeout: Duration::from_secs(20),
//!         })
//!         .channel()
//!         .await
//!         .expect("failed to construct LoadBalancedChannel");
//! }
//! ```
//!
//! The router can also be driven directly, with resolvers, policies and
//! connections of one's own.
//!
//! ```rust
//! #[tokio::main]
//! async fn main() {
//!     use grpc_lb_router::RequestRouter;
//!
//!     let router = RequestRouter::builder("ipv4:///10.0.0.1:50051,10.0.0.2:50051")
//!         .default_lb_policy("round_robin")
//!         .build()
//!         .expect("failed to build router");
//!
//!     router.exit_idle();
//!     router.shutdown(None).await;
//! }
//! ```
//!
//! # Internals
//! Each router runs its state machine in a serialization domain: a single
//! task executing submitted closures one at a time. Picks, cancellations,
//! resolver results and subchannel state changes are all submitted there, so
//! the resolver, the active policy and the queued picks are never touched
//! concurrently.

mod address;
mod backoff;
mod balanced_channel;
mod completion;
mod connectivity;
mod dns_resolver;
mod error;
pub mod lb;
mod lookup_service;
pub mod resolver;
mod router;
mod service_config;
mod service_definition;
mod subchannel;
mod target;
pub mod transport;
mod work_serializer;

pub use address::*;
pub use backoff::{Backoff, BackoffConfig};
pub use balanced_channel::*;
pub use completion::Completion;
pub use connectivity::{aggregate, ConnectivityState, ConnectivityStateTracker, StateWatcher};
pub use dns_resolver::*;
pub use error::*;
pub use lb::{
    CallInfo, ChannelControl, LbPolicy, LbPolicyArgs, LbPolicyFactory, LbPolicyRegistry,
    PendingPick, PendingPing, PickId, DEFAULT_LB_POLICY,
};
pub use lookup_service::*;
pub use resolver::{
    ResolutionResult, Resolver, ResolverArgs, ResolverFactory, ResolverRegistry,
};
pub use router::{RequestRouter, RequestRouterBuilder};
pub use service_config::*;
pub use service_definition::*;
pub use subchannel::{Connection, ConnectionArgs, Subchannel, SubchannelFactory, Transport};
pub use target::{ParseError, Target};
pub use transport::TonicConnector;
pub use work_serializer::{Inbox, TaskGuard, WorkScheduler};
