//! Resolved backend addresses.

use bytes::Bytes;
use std::{fmt, net::SocketAddr};

/// One resolved address plus the attributes a resolver attached to it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address {
    endpoint: String,
    attributes: AddressAttributes,
}

/// Per-address data produced by resolvers and balancers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct AddressAttributes {
    /// Set when the address points at an external load balancer rather than
    /// an application backend. Holds the balancer's name.
    pub balancer_name: Option<String>,
    /// Opaque token a balancer asks the client to attach to calls routed to
    /// this backend.
    pub lb_token: Option<Bytes>,
}

impl Address {
    /// An address for `endpoint`, typically `host:port` or `ip:port`.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            attributes: AddressAttributes::default(),
        }
    }

    /// An address pointing at an external balancer.
    pub fn balancer(endpoint: impl Into<String>, balancer_name: impl Into<String>) -> Self {
        Self::new(endpoint).with_attributes(AddressAttributes {
            balancer_name: Some(balancer_name.into()),
            lb_token: None,
        })
    }

    pub fn with_attributes(self, attributes: AddressAttributes) -> Self {
        Self { attributes, ..self }
    }

    pub fn with_lb_token(mut self, token: impl Into<Bytes>) -> Self {
        self.attributes.lb_token = Some(token.into());
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn attributes(&self) -> &AddressAttributes {
        &self.attributes
    }

    pub fn is_balancer(&self) -> bool {
        self.attributes.balancer_name.is_some()
    }

    pub fn lb_token(&self) -> Option<&Bytes> {
        self.attributes.lb_token.as_ref()
    }
}

impl From<SocketAddr> for Address {
    fn from(address: SocketAddr) -> Self {
        Self::new(address.to_string())
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.endpoint)
    }
}
