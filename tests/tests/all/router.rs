use grpc_lb_router::{CallInfo, ConnectivityState, PickError, RequestRouter};
use std::{collections::HashSet, time::Duration};
use tests::test_server::TestServer;
use tonic_health::ServingStatus;

#[tokio::test]
async fn round_robin_router_hands_out_every_backend() {
    let a = TestServer::start_named("a", ServingStatus::Serving).await;
    let b = TestServer::start_named("b", ServingStatus::Serving).await;

    let router = RequestRouter::builder(format!("ipv4:///{},{}", a.address(), b.address()))
        .default_lb_policy("round_robin")
        .build()
        .expect("failed to build router");

    let mut endpoints = HashSet::new();
    for _ in 0..4 {
        let connection = tokio::time::timeout(
            Duration::from_secs(5),
            router.route_call(CallInfo::new().with_wait_for_ready(true)),
        )
        .await
        .expect("pick never completed")
        .expect("pick failed");
        assert!(connection.grpc_channel().is_some());
        endpoints.insert(connection.address().endpoint().to_string());
    }

    assert_eq!(
        endpoints,
        HashSet::from([a.address().to_string(), b.address().to_string()])
    );
    assert_eq!(
        router.connectivity_state(false).await,
        ConnectivityState::Ready
    );
    router.ping_one().await.expect("ping failed");

    router.shutdown(None).await;
    assert_eq!(
        router.connectivity_state(false).await,
        ConnectivityState::Shutdown
    );
}

#[tokio::test]
async fn ping_reports_unhealthy_backend() {
    let server = TestServer::start_named("sick", ServingStatus::NotServing).await;

    let router = RequestRouter::builder(format!("ipv4:///{}", server.address()))
        .build()
        .expect("failed to build router");
    router.exit_idle();

    let result = tokio::time::timeout(Duration::from_secs(5), router.ping_one())
        .await
        .expect("ping never completed");
    assert!(matches!(result, Err(PickError::Unavailable(_))), "{result:?}");
}

#[tokio::test]
async fn picks_after_shutdown_fail() {
    let server = TestServer::start_named("a", ServingStatus::Serving).await;
    let router = RequestRouter::builder(format!("ipv4:///{}", server.address()))
        .build()
        .expect("failed to build router");

    router.shutdown(None).await;

    let result = router.route_call(CallInfo::new()).await;
    assert!(matches!(result, Err(PickError::Shutdown(_))), "{result:?}");
}
