use crate::test_server::TestServer;
use grpc_lb_router::{LookupService, ServiceDefinition};
use std::{
    collections::BTreeMap,
    net::SocketAddr,
    sync::{Arc, Mutex, MutexGuard},
};
use tonic_health::ServingStatus;

#[derive(Default)]
struct Records {
    servers: BTreeMap<String, TestServer>,
    service_config: Option<String>,
    failing: bool,
}

/// A [`LookupService`] answering with the addresses of the servers it
/// started, so tests can add and remove backends while a channel is running.
#[derive(Clone, Default)]
pub struct TestDnsResolver {
    records: Arc<Mutex<Records>>,
}

impl TestDnsResolver {
    /// Start a healthy server named `name` and publish its address.
    pub async fn add_server(&self, name: &str) -> String {
        self.add_server_with_status(name, ServingStatus::Serving)
            .await
    }

    pub async fn add_server_with_status(&self, name: &str, status: ServingStatus) -> String {
        let server = TestServer::start_named(name, status).await;
        let address = server.address().to_string();
        self.records().servers.insert(name.to_string(), server);
        address
    }

    /// Stop publishing the server named `name` and shut it down.
    pub async fn remove_server(&self, name: &str) {
        let server = self.records().servers.remove(name);
        if let Some(server) = server {
            server.shutdown_sync().await;
        }
    }

    /// Publish `choices`, a JSON array of service config choices.
    pub fn set_service_config(&self, choices: &str) {
        self.records().service_config = Some(choices.to_string());
    }

    /// Make every lookup fail until called again with `false`.
    pub fn set_failing(&self, failing: bool) {
        self.records().failing = failing;
    }

    fn records(&self) -> MutexGuard<'_, Records> {
        self.records.lock().expect("lookup records poisoned")
    }
}

#[async_trait::async_trait]
impl LookupService for TestDnsResolver {
    async fn resolve_service_endpoints(
        &self,
        _definition: &ServiceDefinition,
    ) -> Result<Vec<SocketAddr>, anyhow::Error> {
        let records = self.records();
        anyhow::ensure!(!records.failing, "lookup failed");
        records
            .servers
            .values()
            .map(|server| Ok(server.address().parse()?))
            .collect()
    }

    async fn resolve_service_config(
        &self,
        _definition: &ServiceDefinition,
    ) -> Result<Option<String>, anyhow::Error> {
        Ok(self.records().service_config.clone())
    }
}
