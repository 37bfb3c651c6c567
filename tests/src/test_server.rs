use futures::future::{BoxFuture, FutureExt};
use http::{HeaderValue, Request, Response};
use std::{
    task::{Context, Poll},
    time::{Duration, Instant},
};
use tokio::net::{TcpListener, TcpStream};
use tokio_stream::wrappers::TcpListenerStream;
use tonic::{
    body::Body,
    service::Routes,
    transport::server::{Router, Server},
};
use tonic_health::ServingStatus;
use tower_layer::Layer;
use tower_service::Service;

/// Response header every [`TestServer::start_named`] server stamps its name on.
pub const SERVER_NAME_HEADER: &str = "x-server-name";

/// Manages construction and destruction of a tonic gRPC server for testing.
pub struct TestServer {
    shutdown_handle: Option<tokio::sync::oneshot::Sender<()>>,
    server_addr: String,
    server_future:
        Option<tokio::task::JoinHandle<std::result::Result<(), tonic::transport::Error>>>,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        // Gracefully shutdown the gRPC Server.
        if let Some(sender) = self.shutdown_handle.take() {
            let _res = sender.send(());
        }
    }
}

impl TestServer {
    /// Bootstrap a `TestServer` serving `grpc.health.v1` with the given
    /// overall status, stamping `name` on every response.
    ///
    /// This function will run the server asynchronously, and
    /// tear it down when `Self` is dropped.
    pub async fn start_named(name: &str, status: ServingStatus) -> Self {
        let (reporter, health_service) = tonic_health::server::health_reporter();
        reporter.set_service_status("", status).await;

        let router = Server::builder()
            .layer(ServerNameLayer::new(name))
            .add_service(health_service);
        Self::start_with_router(router, None).await
    }

    /// Bootstrap a tonic `TestServer`, with the a tonic [`Router`].
    /// This enables you to construct a `TestServer` with multiple services.
    ///
    /// ```
    ///  use tests::test_server::TestServer;
    ///  use tonic::transport::Server;
    ///
    /// async fn build_test_server() {
    ///     let router = Server::builder()
    ///                     .add_service(tonic_health::server::health_reporter().1);
    ///
    ///     TestServer::start_with_router(router, "localhost:9000".to_string()).await;
    ///  }
    ///
    /// ```
    ///
    /// This function will run the server asynchronously, and
    /// tear it down when `Self` is dropped.
    pub async fn start_with_router<L, T>(router: Router<L>, address: T) -> TestServer
    where
        L: Layer<Routes> + Send + 'static,
        L::Service: Service<Request<Body>, Response = Response<Body>> + Clone + Send + 'static,
        <<L as Layer<Routes>>::Service as Service<Request<Body>>>::Future: Send + 'static,
        <<L as Layer<Routes>>::Service as Service<Request<Body>>>::Error:
            Into<Box<dyn std::error::Error + Send + Sync>> + Send,
        T: Into<Option<String>>,
    {
        let (shutdown_handle, shutdown) = tokio::sync::oneshot::channel::<()>();

        let listener =
            TcpListener::bind(address.into().unwrap_or_else(|| "127.0.0.1:0".to_string()))
                .await
                .expect("failed to bind tcplistener");
        let listener_addr = listener
            .local_addr()
            .expect("failed to retrieve sockeaddr from tokio listener");

        let server_addr = format!("127.0.0.1:{}", listener_addr.port());
        tracing::info!("server address: {}", server_addr);

        let server_future =
            tokio::spawn(router.serve_with_incoming_shutdown(
                TcpListenerStream::new(listener),
                shutdown.map(|_| ()),
            ));

        // await connectivity
        let wait_start = Instant::now();
        while let Err(e) = TcpStream::connect(listener_addr).await {
            if wait_start.elapsed() > Duration::from_secs(10) {
                panic!("Cannot connect to {listener_addr}: {e}");
            }
            tokio::task::yield_now().await;
        }

        TestServer {
            shutdown_handle: Some(shutdown_handle),
            server_addr,
            server_future: Some(server_future),
        }
    }

    /// Get the address `TestServer` is listening on.
    pub fn address(&self) -> &str {
        &self.server_addr
    }

    /// Shut the server down.
    pub async fn shutdown_sync(mut self) {
        // Gracefully shutdown the gRPC Server.
        if let Some(sender) = self.shutdown_handle.take() {
            let _res = sender.send(());
        }

        if let Some(server_future) = self.server_future.take() {
            server_future
                .await
                .expect("server did not exit gracefully")
                .expect("");
        }
    }
}

/// Adds the [`SERVER_NAME_HEADER`] to every response.
#[derive(Clone)]
pub struct ServerNameLayer {
    name: HeaderValue,
}

impl ServerNameLayer {
    pub fn new(name: &str) -> Self {
        Self {
            name: HeaderValue::from_str(name).expect("server name is not a valid header value"),
        }
    }
}

impl<S> Layer<S> for ServerNameLayer {
    type Service = ServerNameService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        ServerNameService {
            inner,
            name: self.name.clone(),
        }
    }
}

#[derive(Clone)]
pub struct ServerNameService<S> {
    inner: S,
    name: HeaderValue,
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for ServerNameService<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>>,
    S::Future: Send + 'static,
{
    type Response = Response<ResBody>;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<ReqBody>) -> Self::Future {
        let name = self.name.clone();
        let response = self.inner.call(request);
        async move {
            let mut response = response.await?;
            response.headers_mut().insert(SERVER_NAME_HEADER, name);
            Ok(response)
        }
        .boxed()
    }
}
