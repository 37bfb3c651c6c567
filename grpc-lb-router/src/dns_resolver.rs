//! Implements [`LookupService`] for dns.

use crate::{Address, LookupService, ServiceDefinition};
use anyhow::Context;
use hickory_resolver::{
    error::{ResolveError, ResolveErrorKind},
    system_conf, TokioAsyncResolver,
};
use std::net::SocketAddr;

/// Prefix of the TXT record string carrying service config choices.
const SERVICE_CONFIG_PREFIX: &str = "grpc_config=";

/// Implements [`LookupService`] by using DNS queries to lookup [`ServiceDefinition::hostname`].
///
/// Balancers are found through `_grpclb._tcp.<hostname>` SRV records and service
/// config choices through `_grpc_config.<hostname>` TXT records.
pub struct DnsResolver {
    /// The hickory resolver which contacts the dns service directly such
    /// that we bypass os-specific dns caching.
    dns: TokioAsyncResolver,
}

impl DnsResolver {
    /// Construct a new [`DnsResolver`] from env and system configuration, e.g `resolv.conf`.
    pub fn from_system_config() -> Result<Self, anyhow::Error> {
        let (config, mut opts) = system_conf::read_system_conf()
            .context("failed to read dns services from system configuration")?;

        // We do not want any caching on our side.
        opts.cache_size = 0;

        let dns = TokioAsyncResolver::tokio(config, opts);

        Ok(Self { dns })
    }
}

fn no_records(error: &ResolveError) -> bool {
    matches!(error.kind(), ResolveErrorKind::NoRecordsFound { .. })
}

#[async_trait::async_trait]
impl LookupService for DnsResolver {
    #[tracing::instrument(level = "debug", skip(self))]
    async fn resolve_service_endpoints(
        &self,
        definition: &ServiceDefinition,
    ) -> Result<Vec<SocketAddr>, anyhow::Error> {
        match self.dns.lookup_ip(definition.hostname()).await {
            Ok(lookup) => {
                tracing::debug!("dns query expires in: {:?}", lookup.valid_until());
                let mut endpoints: Vec<SocketAddr> = Vec::new();
                for ip_addr in lookup.iter() {
                    tracing::debug!("result: ip {}", ip_addr);
                    let endpoint = (ip_addr, definition.port()).into();
                    if !endpoints.contains(&endpoint) {
                        endpoints.push(endpoint);
                    }
                }
                Ok(endpoints)
            }
            Err(err) if no_records(&err) => Ok(Vec::new()),
            Err(err) => Err(err.into()),
        }
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn resolve_balancers(
        &self,
        definition: &ServiceDefinition,
    ) -> Result<Vec<Address>, anyhow::Error> {
        let name = format!("_grpclb._tcp.{}", definition.hostname());
        let records = match self.dns.srv_lookup(name.as_str()).await {
            Ok(records) => records,
            Err(err) if no_records(&err) => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut balancers = Vec::new();
        for srv in records.iter() {
            let target = srv.target().to_utf8();
            let balancer_name = target.trim_end_matches('.');
            let ips = self
                .dns
                .lookup_ip(target.as_str())
                .await
                .with_context(|| format!("failed to resolve balancer '{balancer_name}'"))?;
            for ip_addr in ips.iter() {
                tracing::debug!("result: balancer {} at {}", balancer_name, ip_addr);
                balancers.push(Address::balancer(
                    SocketAddr::new(ip_addr, srv.port()).to_string(),
                    balancer_name,
                ));
            }
        }
        Ok(balancers)
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn resolve_service_config(
        &self,
        definition: &ServiceDefinition,
    ) -> Result<Option<String>, anyhow::Error> {
        let name = format!("_grpc_config.{}", definition.hostname());
        let records = match self.dns.txt_lookup(name.as_str()).await {
            Ok(records) => records,
            Err(err) if no_records(&err) => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        // A record may be split into several strings, they are concatenated.
        Ok(records.iter().find_map(|txt| {
            let data: Vec<u8> = txt.txt_data().iter().flat_map(|part| part.iter().copied()).collect();
            String::from_utf8(data)
                .ok()?
                .strip_prefix(SERVICE_CONFIG_PREFIX)
                .map(str::to_string)
        }))
    }
}
