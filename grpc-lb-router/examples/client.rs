use std::time::Duration;

use anyhow::Context;
use grpc_lb_router::LoadBalancedChannel;
use tonic_health::pb::{health_client::HealthClient, HealthCheckRequest};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Spread calls over every address `localhost` resolves to, and hold calls
    // until a backend is reachable instead of failing them.
    let channel = LoadBalancedChannel::builder(("localhost", 5000_u16))
        .lb_policy("round_robin")
        .wait_for_ready(true)
        .dns_probe_interval(Duration::from_secs(5))
        .resolution_strategy(grpc_lb_router::ResolutionStrategy::Eager {
            timeout: Duration::from_secs(20),
        })
        .channel()
        .await
        .context("failed to build LoadBalancedChannel")?;

    println!(
        "policy={}",
        channel.router().lb_policy_name().await.unwrap_or("none")
    );

    let mut client = HealthClient::new(channel);

    let request = tonic::Request::new(HealthCheckRequest {
        service: String::new(),
    });

    let response = client.check(request).await?;

    println!("RESPONSE={response:?}");

    Ok(())
}
