use super::{
    dns::DnsResolverFactory,
    static_list::{Ipv4ResolverFactory, Ipv6ResolverFactory, PassthroughResolverFactory},
    Resolver, ResolverArgs, ResolverFactory,
};
use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, OnceLock},
};

/// Resolver factories by URI scheme.
#[derive(Clone)]
pub struct ResolverRegistry {
    factories: HashMap<&'static str, Arc<dyn ResolverFactory>>,
    default: Arc<dyn ResolverFactory>,
}

impl ResolverRegistry {
    pub fn builder() -> ResolverRegistryBuilder {
        ResolverRegistryBuilder {
            factories: HashMap::new(),
            default: None,
        }
    }

    /// A registry with `dns`, `ipv4`, `ipv6` and `passthrough`, defaulting to
    /// `passthrough` for targets without a known scheme.
    pub fn with_defaults() -> Self {
        Self::builder()
            .register(DnsResolverFactory::system())
            .register(Ipv4ResolverFactory)
            .register(Ipv6ResolverFactory)
            .register(PassthroughResolverFactory)
            .build()
    }

    /// The process-wide registry used unless a router is given its own.
    pub fn global() -> Arc<ResolverRegistry> {
        static GLOBAL: OnceLock<Arc<ResolverRegistry>> = OnceLock::new();
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(Self::with_defaults())))
    }

    pub fn lookup(&self, scheme: &str) -> Option<&Arc<dyn ResolverFactory>> {
        self.factories.get(scheme)
    }

    /// Used for targets whose scheme is missing or unknown.
    pub fn default_factory(&self) -> &Arc<dyn ResolverFactory> {
        &self.default
    }

    /// Create the resolver for `args.target`.
    pub fn create(&self, args: ResolverArgs) -> Box<dyn Resolver> {
        match self.lookup(args.target.scheme()) {
            Some(factory) => factory.create(args),
            None => {
                if !args.target.scheme().is_empty() {
                    tracing::debug!(
                        target = %args.target,
                        "unknown scheme, resolving the whole target with the default resolver"
                    );
                }
                self.default.create(args)
            }
        }
    }
}

impl fmt::Debug for ResolverRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut schemes: Vec<_> = self.factories.keys().collect();
        schemes.sort();
        f.debug_struct("ResolverRegistry")
            .field("schemes", &schemes)
            .field("default", &self.default.scheme())
            .finish()
    }
}

pub struct ResolverRegistryBuilder {
    factories: HashMap<&'static str, Arc<dyn ResolverFactory>>,
    default: Option<Arc<dyn ResolverFactory>>,
}

impl ResolverRegistryBuilder {
    /// Register a factory for its scheme.
    ///
    /// # Panics
    ///
    /// If a factory for the same scheme was already registered.
    pub fn register(mut self, factory: impl ResolverFactory + 'static) -> Self {
        let scheme = factory.scheme();
        if self.factories.insert(scheme, Arc::new(factory)).is_some() {
            panic!("resolver for scheme '{scheme}' registered twice");
        }
        self
    }

    /// Replace the factory used for targets without a known scheme.
    pub fn default_factory(mut self, factory: impl ResolverFactory + 'static) -> Self {
        self.default = Some(Arc::new(factory));
        self
    }

    pub fn build(self) -> ResolverRegistry {
        ResolverRegistry {
            factories: self.factories,
            default: self
                .default
                .unwrap_or_else(|| Arc::new(PassthroughResolverFactory)),
        }
    }
}
