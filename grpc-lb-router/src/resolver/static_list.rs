//! Resolvers for targets that already are addresses.

use super::{
    ResolutionOutcome, ResolutionResult, Resolver, ResolverArgs, ResolverFactory,
    ResultCompletion, ResultSlot,
};
use crate::{
    error::{ResolverError, SharedError},
    Address,
};
use std::net::SocketAddr;

/// Reports one fixed outcome, then nothing until shut down.
pub(crate) struct StaticResolver {
    outcome: Option<ResolutionOutcome>,
    slot: ResultSlot,
}

impl StaticResolver {
    pub(crate) fn new(outcome: ResolutionOutcome) -> Self {
        Self {
            outcome: Some(outcome),
            slot: ResultSlot::default(),
        }
    }

    pub(crate) fn failing(target: &str, error: impl Into<SharedError>) -> Self {
        Self::new(Err(ResolverError::fatal(target, error)))
    }

    fn addresses(addresses: Vec<Address>) -> Self {
        Self::new(Ok(ResolutionResult {
            addresses,
            service_config: None,
        }))
    }
}

impl Resolver for StaticResolver {
    fn start_resolving(&mut self) {
        if let Some(outcome) = self.outcome.take() {
            self.slot.publish(outcome);
        }
    }

    fn next_result(&mut self, completion: ResultCompletion) {
        self.slot.request(completion);
    }

    fn notify_channel_saw_error(&mut self) {}

    fn shutdown(&mut self, error: Option<SharedError>) {
        self.slot.close(error);
    }
}

/// `passthrough:///host:port`: the endpoint is handed to the connector as is.
///
/// Also the default for targets without a known scheme, which are passed
/// through whole.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughResolverFactory;

impl ResolverFactory for PassthroughResolverFactory {
    fn scheme(&self) -> &'static str {
        "passthrough"
    }

    fn create(&self, args: ResolverArgs) -> Box<dyn Resolver> {
        let endpoint = if args.target.scheme() == self.scheme() {
            args.target.endpoint()
        } else {
            args.target.as_str()
        };
        if endpoint.is_empty() {
            return Box::new(StaticResolver::failing(
                args.target.as_str(),
                SharedError::msg("no address to pass through"),
            ));
        }
        Box::new(StaticResolver::addresses(vec![Address::new(endpoint)]))
    }
}

/// `ipv4:///1.2.3.4:80,1.2.3.5:80`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Ipv4ResolverFactory;

impl ResolverFactory for Ipv4ResolverFactory {
    fn scheme(&self) -> &'static str {
        "ipv4"
    }

    fn create(&self, args: ResolverArgs) -> Box<dyn Resolver> {
        Box::new(parse_list(&args, SocketAddr::is_ipv4))
    }
}

/// `ipv6:///[::1]:80,[::2]:80`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Ipv6ResolverFactory;

impl ResolverFactory for Ipv6ResolverFactory {
    fn scheme(&self) -> &'static str {
        "ipv6"
    }

    fn create(&self, args: ResolverArgs) -> Box<dyn Resolver> {
        Box::new(parse_list(&args, SocketAddr::is_ipv6))
    }
}

fn parse_list(args: &ResolverArgs, family: fn(&SocketAddr) -> bool) -> StaticResolver {
    let target = args.target.as_str();
    let mut addresses = Vec::new();
    for entry in args.target.endpoint().split(',') {
        match entry.trim().parse::<SocketAddr>() {
            Ok(address) if family(&address) => addresses.push(Address::from(address)),
            Ok(address) => {
                return StaticResolver::failing(
                    target,
                    SharedError::msg(format!(
                        "'{address}' is not an {} address",
                        args.target.scheme()
                    )),
                )
            }
            Err(error) => {
                return StaticResolver::failing(
                    target,
                    anyhow::Error::new(error).context(format!("invalid address '{entry}'")),
                )
            }
        }
    }
    StaticResolver::addresses(addresses)
}
