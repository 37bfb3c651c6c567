//! The `dns` resolver: periodic lookups of `dns:///host[:port]` targets.

use super::{
    static_list::StaticResolver, ResolutionResult, Resolver, ResolverArgs, ResolverFactory,
    ResultCompletion, ResultSlot,
};
use crate::{
    backoff::{Backoff, BackoffConfig},
    error::SharedError,
    service_config::{choose_service_config, ChoiceContext},
    work_serializer::TaskGuard,
    Address, DnsResolver, LookupService, ServiceDefinition,
};
use std::{
    sync::{Arc, OnceLock},
    time::Duration,
};
use tokio::sync::Notify;
use tracing_futures::Instrument;

/// Creates `dns` resolvers sharing one [`LookupService`].
pub struct DnsResolverFactory {
    lookup: OnceLock<Result<Arc<dyn LookupService>, SharedError>>,
}

impl DnsResolverFactory {
    /// Resolve through `lookup`.
    pub fn new(lookup: impl LookupService + 'static) -> Self {
        let factory = Self {
            lookup: OnceLock::new(),
        };
        let _ = factory.lookup.set(Ok(Arc::new(lookup)));
        factory
    }

    /// Resolve through the system's DNS configuration, read when the first
    /// resolver is created.
    pub fn system() -> Self {
        Self {
            lookup: OnceLock::new(),
        }
    }

    fn lookup(&self) -> Result<Arc<dyn LookupService>, SharedError> {
        self.lookup
            .get_or_init(|| {
                DnsResolver::from_system_config()
                    .map(|resolver| Arc::new(resolver) as Arc<dyn LookupService>)
                    .map_err(SharedError::from)
            })
            .clone()
    }
}

impl ResolverFactory for DnsResolverFactory {
    fn scheme(&self) -> &'static str {
        "dns"
    }

    fn create(&self, args: ResolverArgs) -> Box<dyn Resolver> {
        let target = args.target.as_str().to_string();
        if !args.target.authority().is_empty() {
            tracing::warn!(
                target = %target,
                authority = args.target.authority(),
                "custom DNS authorities are not supported, using the system resolver"
            );
        }
        let definition = match ServiceDefinition::from_endpoint(args.target.endpoint()) {
            Ok(definition) => definition,
            Err(error) => return Box::new(StaticResolver::failing(&target, error)),
        };
        let lookup = match self.lookup() {
            Ok(lookup) => lookup,
            Err(error) => return Box::new(StaticResolver::failing(&target, error)),
        };

        Box::new(DnsTargetResolver {
            probe: Arc::new(Probe {
                definition,
                lookup,
                request_service_config: args.request_service_config,
                choice_context: ChoiceContext {
                    hostname: args.hostname,
                },
            }),
            probe_interval: args.probe_interval,
            slot: ResultSlot::default(),
            wake: Arc::new(Notify::new()),
            task: None,
        })
    }
}

struct Probe {
    definition: ServiceDefinition,
    lookup: Arc<dyn LookupService>,
    request_service_config: bool,
    choice_context: ChoiceContext,
}

impl Probe {
    async fn resolve(&self) -> Result<ResolutionResult, anyhow::Error> {
        let endpoints = self
            .lookup
            .resolve_service_endpoints(&self.definition)
            .await?;
        let mut result = ResolutionResult {
            addresses: endpoints.into_iter().map(Address::from).collect(),
            service_config: None,
        };
        if !self.request_service_config {
            return Ok(result);
        }

        match self.lookup.resolve_balancers(&self.definition).await {
            Ok(balancers) => result.addresses.extend(balancers),
            Err(error) => tracing::debug!(%error, "balancer lookup failed"),
        }
        match self.lookup.resolve_service_config(&self.definition).await {
            Ok(Some(choices)) => {
                let chosen =
                    choose_service_config(&choices, &self.choice_context, &mut rand::thread_rng());
                match chosen {
                    Ok(config) => result.service_config = config,
                    Err(error) => tracing::warn!(%error, "ignoring published service config"),
                }
            }
            Ok(None) => {}
            Err(error) => tracing::debug!(%error, "service config lookup failed"),
        }
        Ok(result)
    }

    /// Resolve forever, publishing every result that differs from the last
    /// published one.
    async fn run(self: Arc<Self>, interval: Duration, slot: ResultSlot, wake: Arc<Notify>) {
        let mut backoff = Backoff::new(BackoffConfig::default());
        let mut published: Option<ResolutionResult> = None;
        loop {
            let delay = match self.resolve().await {
                Ok(result) => {
                    backoff.reset();
                    if published.as_ref() != Some(&result) {
                        tracing::debug!(addresses = result.addresses.len(), "resolved");
                        published = Some(result.clone());
                        slot.publish(Ok(result));
                    }
                    interval
                }
                Err(error) => {
                    let delay = backoff.next_delay();
                    tracing::warn!(
                        error = %SharedError::from(error),
                        ?delay,
                        "dns lookup failed, retrying"
                    );
                    delay
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = wake.notified() => tracing::debug!("re-resolution requested"),
            }
        }
    }
}

struct DnsTargetResolver {
    probe: Arc<Probe>,
    probe_interval: Duration,
    slot: ResultSlot,
    wake: Arc<Notify>,
    task: Option<TaskGuard>,
}

impl Resolver for DnsTargetResolver {
    fn start_resolving(&mut self) {
        if self.task.is_some() {
            return;
        }
        let span = tracing::debug_span!(
            "dns_resolver",
            hostname = self.probe.definition.hostname(),
            port = self.probe.definition.port()
        );
        self.task = Some(TaskGuard::spawn(
            Arc::clone(&self.probe)
                .run(self.probe_interval, self.slot.clone(), Arc::clone(&self.wake))
                .instrument(span),
        ));
    }

    fn next_result(&mut self, completion: ResultCompletion) {
        self.slot.request(completion);
    }

    fn notify_channel_saw_error(&mut self) {
        self.wake.notify_one();
    }

    fn shutdown(&mut self, error: Option<SharedError>) {
        self.task = None;
        self.slot.close(error);
    }
}
