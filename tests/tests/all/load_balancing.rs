use grpc_lb_router::{
    LoadBalancedChannel, LoadBalancedChannelBuilder, LookupService, ResolutionStrategy,
    ServiceDefinition,
};
use std::{collections::HashSet, net::SocketAddr, time::Duration};
use tests::{lookup::TestDnsResolver, test_server::SERVER_NAME_HEADER};
use tonic::{Code, Status};
use tonic_health::pb::{health_client::HealthClient, HealthCheckRequest};

const PROBE_INTERVAL: Duration = Duration::from_millis(10);

/// Issue one health check and return the name of the server that answered.
async fn call(client: &mut HealthClient<LoadBalancedChannel>) -> Result<String, Status> {
    let response = client
        .check(tonic::Request::new(HealthCheckRequest {
            service: String::new(),
        }))
        .await?;
    Ok(response
        .metadata()
        .get(SERVER_NAME_HEADER)
        .and_then(|name| name.to_str().ok())
        .unwrap_or_default()
        .to_string())
}

/// Call until `expected` answers, giving the DNS probe time to catch up.
async fn call_until(client: &mut HealthClient<LoadBalancedChannel>, expected: &str) {
    for _ in 0..200 {
        if let Ok(server) = call(client).await {
            if server == expected {
                return;
            }
        }
        tokio::time::sleep(PROBE_INTERVAL).await;
    }
    panic!("{expected} never answered");
}

fn channel(
    resolver: &TestDnsResolver,
) -> LoadBalancedChannelBuilder<TestDnsResolver, ServiceDefinition> {
    LoadBalancedChannelBuilder::new_with_service(
        ServiceDefinition::from_parts("test", 5000).unwrap(),
    )
    .lookup_service(resolver.clone())
    .dns_probe_interval(PROBE_INTERVAL)
}

#[tokio::test]
async fn load_balance_succeeds_with_churn() {
    // Steps:
    //  1. Create a server that is added to the list of endpoints.
    //  2. Do a gRPC call.
    //  3. Remove the server from the list of endpoints and shut it down.
    //  4. Repeat 1-3.
    // What we want to test:
    //  Clients function normally when servers are removed and added.

    // Arrange
    let resolver = TestDnsResolver::default();
    let load_balanced_channel = channel(&resolver)
        .channel()
        .await
        .expect("failed to init");
    let mut client = HealthClient::new(load_balanced_channel);

    let servers: Vec<String> = (0..5).map(|s| format!("server_{s}")).collect();
    let mut servers_called = Vec::new();

    // Act
    for server in &servers {
        resolver.add_server(server).await;
        call_until(&mut client, server).await;
        servers_called.push(server.clone());
        resolver.remove_server(server).await;
    }

    // Assert
    assert_eq!(servers, servers_called);
}

#[tokio::test]
async fn round_robin_calls_all_endpoints() {
    // A common load balancing scenario in which you have more calls
    // than servers, and you want all servers to be called.
    let resolver = TestDnsResolver::default();
    for name in ["server_a", "server_b", "server_c"] {
        resolver.add_server(name).await;
    }

    let load_balanced_channel = channel(&resolver)
        .lb_policy("round_robin")
        .resolution_strategy(ResolutionStrategy::Eager {
            timeout: Duration::from_secs(5),
        })
        .channel()
        .await
        .expect("failed to init");
    let mut client = HealthClient::new(load_balanced_channel);

    let mut called = HashSet::new();
    for _ in 0..200 {
        called.insert(call(&mut client).await.expect("failed to call server"));
        if called.len() == 3 {
            break;
        }
    }

    assert_eq!(
        called,
        HashSet::from(["server_a", "server_b", "server_c"].map(String::from))
    );
}

#[tokio::test]
async fn service_config_published_in_dns_selects_the_policy() {
    let resolver = TestDnsResolver::default();
    resolver.add_server("server_a").await;
    resolver.set_service_config(
        r#"[
            {"clientLanguage": ["go"], "serviceConfig": {"loadBalancingPolicy": "pick_first"}},
            {"serviceConfig": {"loadBalancingConfig": [{"round_robin": {}}]}}
        ]"#,
    );

    let load_balanced_channel = channel(&resolver)
        .resolution_strategy(ResolutionStrategy::Eager {
            timeout: Duration::from_secs(5),
        })
        .channel()
        .await
        .expect("failed to init");

    let router = load_balanced_channel.router();
    assert_eq!(router.lb_policy_name().await, Some("round_robin"));
    let config = router.service_config().await.expect("no service config");
    assert_eq!(config.lb_policy_name(), Some("round_robin"));

    let mut client = HealthClient::new(load_balanced_channel.clone());
    assert_eq!(call(&mut client).await.unwrap(), "server_a");
}

struct UnreachableLookup(SocketAddr);

#[async_trait::async_trait]
impl LookupService for UnreachableLookup {
    async fn resolve_service_endpoints(
        &self,
        _definition: &ServiceDefinition,
    ) -> Result<Vec<SocketAddr>, anyhow::Error> {
        Ok(vec![self.0])
    }
}

#[tokio::test]
async fn unreachable_backend_fails_calls_with_unavailable() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let address = listener.local_addr().unwrap();
    drop(listener);

    let load_balanced_channel = LoadBalancedChannel::builder(("test", 5000_u16))
        .lookup_service(UnreachableLookup(address))
        .connect_timeout(Duration::from_secs(1))
        .channel()
        .await
        .expect("failed to init");
    let mut client = HealthClient::new(load_balanced_channel);

    let status = tokio::time::timeout(Duration::from_secs(5), call(&mut client))
        .await
        .expect("call was never failed")
        .unwrap_err();
    assert_eq!(status.code(), Code::Unavailable);
    assert!(
        status.message().starts_with("no connection available"),
        "{}",
        status.message()
    );
}

#[tokio::test]
async fn eager_resolution_fails_when_lookup_keeps_failing() {
    let resolver = TestDnsResolver::default();
    resolver.set_failing(true);

    let result = channel(&resolver)
        .resolution_strategy(ResolutionStrategy::Eager {
            timeout: Duration::from_millis(200),
        })
        .channel()
        .await;

    assert!(result.is_err());
}

#[tokio::test]
async fn wait_for_ready_calls_wait_for_a_backend() {
    let resolver = TestDnsResolver::default();
    let load_balanced_channel = channel(&resolver)
        .wait_for_ready(true)
        .channel()
        .await
        .expect("failed to init");
    let mut client = HealthClient::new(load_balanced_channel);

    let pending = tokio::spawn(async move { call(&mut client).await });
    tokio::time::sleep(PROBE_INTERVAL * 5).await;
    assert!(!pending.is_finished());

    resolver.add_server("late").await;
    let server = tokio::time::timeout(Duration::from_secs(5), pending)
        .await
        .expect("call never completed")
        .unwrap()
        .unwrap();
    assert_eq!(server, "late");
}
