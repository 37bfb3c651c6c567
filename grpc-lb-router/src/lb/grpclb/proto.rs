//! Messages of the `grpc.lb.v1.LoadBalancer` service.
//!
//! Only the parts used by the client are declared: client load reporting
//! is not supported, so `ClientStats` and its request variant are absent.

/// Request sent on the `BalanceLoad` stream.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LoadBalanceRequest {
    #[prost(oneof = "load_balance_request::LoadBalanceRequestType", tags = "1")]
    pub load_balance_request_type: Option<load_balance_request::LoadBalanceRequestType>,
}

pub mod load_balance_request {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum LoadBalanceRequestType {
        #[prost(message, tag = "1")]
        InitialRequest(super::InitialLoadBalanceRequest),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct InitialLoadBalanceRequest {
    /// Name of the service the client wants backends for.
    #[prost(string, tag = "1")]
    pub name: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LoadBalanceResponse {
    #[prost(oneof = "load_balance_response::LoadBalanceResponseType", tags = "1, 2")]
    pub load_balance_response_type: Option<load_balance_response::LoadBalanceResponseType>,
}

pub mod load_balance_response {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum LoadBalanceResponseType {
        #[prost(message, tag = "1")]
        InitialResponse(super::InitialLoadBalanceResponse),
        #[prost(message, tag = "2")]
        ServerList(super::ServerList),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct InitialLoadBalanceResponse {
    #[prost(string, tag = "1")]
    pub load_balancer_delegate: String,
    #[prost(message, optional, tag = "2")]
    pub client_stats_report_interval: Option<::prost_types::Duration>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ServerList {
    #[prost(message, repeated, tag = "1")]
    pub servers: Vec<Server>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Server {
    /// Big-endian IPv4 (4 bytes) or IPv6 (16 bytes) address.
    #[prost(bytes = "vec", tag = "1")]
    pub ip_address: Vec<u8>,
    #[prost(int32, tag = "2")]
    pub port: i32,
    #[prost(string, tag = "3")]
    pub load_balance_token: String,
    /// The balancer asks for calls to this entry to be dropped.
    #[prost(bool, tag = "4")]
    pub drop: bool,
}

impl LoadBalanceRequest {
    pub fn initial(name: impl Into<String>) -> Self {
        Self {
            load_balance_request_type: Some(
                load_balance_request::LoadBalanceRequestType::InitialRequest(
                    InitialLoadBalanceRequest { name: name.into() },
                ),
            ),
        }
    }
}
