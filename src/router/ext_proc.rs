//! Envoy `ExternalProcessor` gRPC service.
//!
//! The filter must run with the request body in BUFFERED mode so the whole
//! JSON-RPC envelope arrives in a single `RequestBody` message. Header
//! mutations are emitted in `raw_value`.

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;

use envoy_types::pb::envoy::config::core::v3::{HeaderValue, HeaderValueOption};
use envoy_types::pb::envoy::r#type::v3::HttpStatus;
use envoy_types::pb::envoy::service::ext_proc::v3::external_processor_server::{
    ExternalProcessor, ExternalProcessorServer,
};
use envoy_types::pb::envoy::service::ext_proc::v3::{
    BodyMutation, BodyResponse, CommonResponse, HeaderMutation, HeadersResponse, HttpBody,
    HttpHeaders, ImmediateResponse, ProcessingRequest, ProcessingResponse, TrailersResponse,
    body_mutation, processing_request, processing_response,
};
use futures::Stream;
use serde_json::Value;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, info, warn};

use super::{McpRouter, RouteDecision};
use crate::error::RouterError;
use crate::protocol::{JsonRpcResponse, RequestHeaders, RequestId};

type ResponseStream = Pin<Box<dyn Stream<Item = Result<ProcessingResponse, Status>> + Send>>;

/// `ExternalProcessor` implementation backed by an [`McpRouter`]
#[derive(Clone)]
pub struct McpExtProc {
    router: Arc<McpRouter>,
}

impl McpExtProc {
    /// Wrap a router
    #[must_use]
    pub fn new(router: Arc<McpRouter>) -> Self {
        Self { router }
    }

    /// Answer one processing message.
    ///
    /// `headers` carries the request headers seen earlier on the same stream.
    pub async fn handle(
        &self,
        headers: &mut RequestHeaders,
        request: ProcessingRequest,
    ) -> Option<ProcessingResponse> {
        use processing_request::Request as Phase;
        use processing_response::Response as Reply;

        let reply = match request.request? {
            Phase::RequestHeaders(http_headers) => {
                *headers = collect_headers(&http_headers);
                let decision = self.router.route_request_headers(headers);
                Reply::RequestHeaders(HeadersResponse {
                    response: Some(common_response(&decision)),
                })
            }
            Phase::RequestBody(body) => self.route_body(headers, &body).await,
            Phase::RequestTrailers(_) => Reply::RequestTrailers(TrailersResponse::default()),
            Phase::ResponseHeaders(_) => Reply::ResponseHeaders(HeadersResponse::default()),
            Phase::ResponseBody(_) => Reply::ResponseBody(BodyResponse::default()),
            Phase::ResponseTrailers(_) => Reply::ResponseTrailers(TrailersResponse::default()),
        };

        Some(ProcessingResponse {
            response: Some(reply),
            ..Default::default()
        })
    }

    async fn route_body(
        &self,
        headers: &RequestHeaders,
        body: &HttpBody,
    ) -> processing_response::Response {
        if !body.end_of_stream {
            debug!(bytes = body.body.len(), "Partial request body; filter should buffer");
        }

        match self.router.route_mcp_request(headers, &body.body).await {
            Ok(decision) => {
                telemetry_metrics::counter!("mcp_router_requests_total", "outcome" => "routed")
                    .increment(1);
                processing_response::Response::RequestBody(BodyResponse {
                    response: Some(common_response(&decision)),
                })
            }
            Err(e) => {
                warn!(status = e.code(), error = %e.cause(), "Rejecting MCP request");
                telemetry_metrics::counter!("mcp_router_requests_total", "outcome" => "rejected")
                    .increment(1);
                processing_response::Response::ImmediateResponse(immediate_error(&e, &body.body))
            }
        }
    }
}

#[tonic::async_trait]
impl ExternalProcessor for McpExtProc {
    type ProcessStream = ResponseStream;

    async fn process(
        &self,
        request: Request<Streaming<ProcessingRequest>>,
    ) -> Result<Response<Self::ProcessStream>, Status> {
        let mut inbound = request.into_inner();
        let processor = self.clone();

        let output = async_stream::try_stream! {
            let mut headers = RequestHeaders::new();
            while let Some(message) = inbound.message().await? {
                if let Some(response) = processor.handle(&mut headers, message).await {
                    yield response;
                }
            }
        };

        Ok(Response::new(Box::pin(output) as Self::ProcessStream))
    }
}

/// Serve the ext_proc gRPC endpoint until `cancel` fires
pub async fn serve_ext_proc(
    router: Arc<McpRouter>,
    addr: SocketAddr,
    cancel: CancellationToken,
) -> crate::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "ext_proc server listening");
    serve_ext_proc_on(router, listener, cancel).await
}

/// Serve on an already bound listener
pub async fn serve_ext_proc_on(
    router: Arc<McpRouter>,
    listener: tokio::net::TcpListener,
    cancel: CancellationToken,
) -> crate::Result<()> {
    tonic::transport::Server::builder()
        .add_service(ExternalProcessorServer::new(McpExtProc::new(router)))
        .serve_with_incoming_shutdown(TcpListenerStream::new(listener), cancel.cancelled_owned())
        .await
        .map_err(|e| crate::Error::Transport(format!("ext_proc server failed: {e}")))
}

fn collect_headers(http_headers: &HttpHeaders) -> RequestHeaders {
    let mut headers = RequestHeaders::new();
    for header in http_headers.headers.iter().flat_map(|map| map.headers.iter()) {
        let value = if header.raw_value.is_empty() {
            header.value.clone()
        } else {
            String::from_utf8_lossy(&header.raw_value).into_owned()
        };
        headers.append(&header.key, value);
    }
    headers
}

fn header_option(name: &str, value: &str) -> HeaderValueOption {
    HeaderValueOption {
        header: Some(HeaderValue {
            key: name.to_string(),
            value: String::new(),
            raw_value: value.as_bytes().to_vec(),
        }),
        ..Default::default()
    }
}

fn common_response(decision: &RouteDecision) -> CommonResponse {
    let header_mutation = (!decision.headers.is_empty()).then(|| HeaderMutation {
        set_headers: decision
            .headers
            .iter()
            .map(|(name, value)| header_option(name, value))
            .collect(),
        ..Default::default()
    });
    let body_mutation = decision.body.as_ref().map(|body| BodyMutation {
        mutation: Some(body_mutation::Mutation::Body(body.clone())),
    });

    CommonResponse {
        clear_route_cache: header_mutation.is_some(),
        header_mutation,
        body_mutation,
        ..Default::default()
    }
}

fn immediate_error(error: &RouterError, body: &[u8]) -> ImmediateResponse {
    let id = serde_json::from_slice::<Value>(body)
        .ok()
        .and_then(|v| v.get("id").cloned())
        .and_then(|id| serde_json::from_value::<RequestId>(id).ok());
    let payload = JsonRpcResponse::error(id, error.cause().to_rpc_code(), error.cause().to_string());
    let payload = serde_json::to_string(&payload).unwrap_or_default();

    ImmediateResponse {
        status: Some(HttpStatus {
            code: i32::from(error.code()),
        }),
        headers: Some(HeaderMutation {
            set_headers: vec![header_option("content-type", "application/json")],
            ..Default::default()
        }),
        body: payload.into(),
        details: format!("mcp_router_{}", error.code()),
        ..Default::default()
    }
}
