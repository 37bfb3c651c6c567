//! Test harness shared by the integration tests: in-process gRPC servers and
//! a scriptable [`LookupService`](grpc_lb_router::LookupService).

pub mod lookup;
pub mod test_server;
