//! Defines the interface the `dns` resolver requires in order to resolve the
//! addresses, balancers and service config of a given service.

use crate::{Address, ServiceDefinition};
use std::net::SocketAddr;

/// Interface that provides functionality to
/// acquire a list of ips given a valid host name.
#[async_trait::async_trait]
pub trait LookupService: Send + Sync {
    /// Return the [`SocketAddr`]s associated with the provided
    /// [`ServiceDefinition`](crate::ServiceDefinition) containing the `hostname` `port` of the service,
    /// without duplicates and in the order the lookup returned them.
    /// If no ip addresses were resolved, an empty Vec is returned.
    async fn resolve_service_endpoints(
        &self,
        definition: &ServiceDefinition,
    ) -> Result<Vec<SocketAddr>, anyhow::Error>;

    /// Return the external load balancers published for the service, as
    /// balancer [`Address`]es.
    async fn resolve_balancers(
        &self,
        _definition: &ServiceDefinition,
    ) -> Result<Vec<Address>, anyhow::Error> {
        Ok(Vec::new())
    }

    /// Return the service config choices published for the service, as the
    /// raw JSON array.
    async fn resolve_service_config(
        &self,
        _definition: &ServiceDefinition,
    ) -> Result<Option<String>, anyhow::Error> {
        Ok(None)
    }
}
