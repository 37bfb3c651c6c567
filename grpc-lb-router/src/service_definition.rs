use anyhow::Context;
use std::net::{IpAddr, SocketAddr};

/// Port used when a DNS target does not name one.
pub const DEFAULT_PORT: u16 = 443;

/// Defines a gRPC service with a `hostname` and a `port`.
/// The hostname will be resolved to the concrete ips of the service servers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDefinition {
    /// The hostname of the service, or an IP literal.
    hostname: String,
    /// The service port.
    port: u16,
}

impl ServiceDefinition {
    /// Create a [`ServiceDefinition`] from a valid `hostname` and `port`.
    ///
    /// This function will fail is the `hostname` is not a valid domain name.
    pub fn from_parts<T: ToString>(hostname: T, port: u16) -> Result<Self, anyhow::Error> {
        let hostname = hostname.to_string();

        hickory_resolver::Name::from_ascii(&hostname)
            .map_err(anyhow::Error::from)
            .context("invalid 'hostname'")?;

        Ok(Self { hostname, port })
    }

    /// Parse the `host[:port]` endpoint of a DNS target.
    ///
    /// IP literals are accepted as hosts, IPv6 ones in brackets when followed
    /// by a port. The port defaults to [`DEFAULT_PORT`].
    pub fn from_endpoint(endpoint: &str) -> Result<Self, anyhow::Error> {
        if endpoint.is_empty() {
            anyhow::bail!("no hostname given");
        }
        if let Ok(address) = endpoint.parse::<SocketAddr>() {
            return Ok(Self::from_ip(address.ip(), address.port()));
        }
        let unbracketed = endpoint
            .strip_prefix('[')
            .and_then(|rest| rest.strip_suffix(']'))
            .unwrap_or(endpoint);
        if let Ok(ip) = unbracketed.parse::<IpAddr>() {
            return Ok(Self::from_ip(ip, DEFAULT_PORT));
        }

        match endpoint.rsplit_once(':') {
            Some((hostname, port)) => {
                let port = port
                    .parse()
                    .with_context(|| format!("invalid port in '{endpoint}'"))?;
                Self::from_parts(hostname, port)
            }
            None => Self::from_parts(endpoint, DEFAULT_PORT),
        }
    }

    fn from_ip(ip: IpAddr, port: u16) -> Self {
        Self {
            hostname: ip.to_string(),
            port,
        }
    }

    /// Get the `hostname` part of a `ServiceDefinition`.
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Get the `port` part of a `ServiceDefinition`.
    pub fn port(&self) -> u16 {
        self.port
    }
}

/// ```
/// let sd = grpc_lb_router::ServiceDefinition::try_from(("localhost", 8090)).unwrap();
/// assert_eq!(sd.hostname(), "localhost");
/// assert_eq!(sd.port(), 8090);
/// ```
impl TryFrom<(&str, u16)> for ServiceDefinition {
    type Error = anyhow::Error;

    fn try_from((hostname, port): (&str, u16)) -> Result<Self, Self::Error> {
        Self::from_parts(hostname, port)
    }
}

impl TryFrom<(String, u16)> for ServiceDefinition {
    type Error = anyhow::Error;

    fn try_from((hostname, port): (String, u16)) -> Result<Self, Self::Error> {
        Self::from_parts(hostname, port)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use proptest::prop_compose;

    prop_compose! {
        fn valid_hostname()(s in "[a-z0-9]{1,20}(\\.[a-z0-9]{1,20}){0,3}") -> String {
            s
        }
    }

    prop_compose! {
        fn invalid_hostname()(s in "[^\\a-z.0-9*A-Z]+") -> String {
            s
        }
    }

    proptest::proptest! {
        #[test]
        fn valid_hostname_shall_succeed(hostname in valid_hostname()) {
            proptest::prop_assert!(ServiceDefinition::from_parts(&hostname, 5000).is_ok());
            let parsed = ServiceDefinition::from_endpoint(&format!("{hostname}:5000")).unwrap();
            proptest::prop_assert_eq!(parsed.hostname(), hostname.as_str());
            proptest::prop_assert_eq!(parsed.port(), 5000);
        }

        #[test]
        fn invalid_hostname_shall_fail(hostname in invalid_hostname()) {
            proptest::prop_assert!(ServiceDefinition::from_parts(hostname, 5000).is_err());
        }
    }

    #[test]
    fn endpoint_port_defaults_to_443() {
        let definition = ServiceDefinition::from_endpoint("api.example.com").unwrap();
        assert_eq!(definition.hostname(), "api.example.com");
        assert_eq!(definition.port(), DEFAULT_PORT);
    }

    #[test]
    fn endpoint_accepts_ip_literals() {
        let definition = ServiceDefinition::from_endpoint("[::1]:8080").unwrap();
        assert_eq!((definition.hostname(), definition.port()), ("::1", 8080));

        let definition = ServiceDefinition::from_endpoint("::1").unwrap();
        assert_eq!((definition.hostname(), definition.port()), ("::1", DEFAULT_PORT));

        let definition = ServiceDefinition::from_endpoint("10.0.0.1").unwrap();
        assert_eq!((definition.hostname(), definition.port()), ("10.0.0.1", DEFAULT_PORT));
    }

    #[test]
    fn endpoint_rejects_bad_ports() {
        assert!(ServiceDefinition::from_endpoint("api.example.com:http").is_err());
        assert!(ServiceDefinition::from_endpoint("api.example.com:70000").is_err());
        assert!(ServiceDefinition::from_endpoint("").is_err());
    }
}
