//! HTTP/1.1 JSON-RPC endpoint.
//!
//! Every connection is served on its own tokio task. Requests must be `POST`
//! with a JSON-RPC body of at most [`MAX_BODY_BYTES`].
//!
//! # Example
//!
//! ```no_run
//! use evalpool_server::{config::EngineConfig, http_server::HttpServer, Engine};
//!
//! #[tokio::main]
//! async fn main() {
//!     let engine = Engine::with_config(EngineConfig::default()).unwrap();
//!     let _errors = engine.start().unwrap();
//!     let server = HttpServer::new(engine.rpc().unwrap());
//!     server
//!         .run("127.0.0.1:8080".parse().unwrap(), async {
//!             let _ = tokio::signal::ctrl_c().await;
//!         })
//!         .await
//!         .unwrap();
//! }
//! ```

use evalpool_common::protocol::error::{EvalError, Result};
use evalpool_common::protocol::{JsonRpcError, JsonRpcResponse};
use evalpool_common::transport::{HttpTransport, HyperRequest, HyperResponse, MAX_BODY_BYTES};
use http_body_util::{BodyExt, LengthLimitError, Limited};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, StatusCode};
use hyper_util::rt::TokioIo;
use serde_json::Value;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;

use crate::http_router::EngineRouter;
use crate::rpc::ExecuteHandler;

pub struct HttpServer {
    router: Arc<EngineRouter>,
}

impl HttpServer {
    pub fn new(handler: ExecuteHandler) -> Self {
        Self {
            router: Arc::new(EngineRouter::new(handler)),
        }
    }

    /// Binds `addr` and serves until `shutdown` resolves.
    pub async fn run<F>(self, addr: SocketAddr, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| EvalError::Transport(format!("Failed to bind to {}: {}", addr, e)))?;
        self.serve(listener, shutdown).await
    }

    /// Serves an already bound listener until `shutdown` resolves.
    ///
    /// Connections accepted before shutdown keep running to completion on
    /// their own tasks.
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let local = listener
            .local_addr()
            .map_err(|e| EvalError::Transport(format!("Failed to get local address: {}", e)))?;
        tracing::info!("HTTP server listening on {}", local);

        tokio::pin!(shutdown);
        loop {
            let (stream, peer) = tokio::select! {
                _ = &mut shutdown => break,
                accepted = listener.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::warn!("Failed to accept connection: {}", e);
                        continue;
                    }
                },
            };

            let io = TokioIo::new(stream);
            let router = self.router.clone();

            tokio::task::spawn(async move {
                let service = service_fn(move |req| {
                    let router = router.clone();
                    async move { Self::handle_request(router, req).await }
                });

                if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                    tracing::debug!("Error serving connection from {}: {}", peer, err);
                }
            });
        }

        tracing::info!("HTTP server on {} stopped accepting connections", local);
        Ok(())
    }

    async fn handle_request(router: Arc<EngineRouter>, req: HyperRequest) -> Result<HyperResponse> {
        if req.method() != Method::POST {
            return Ok(HttpTransport::to_http_error(
                Value::Null,
                JsonRpcError::invalid_request("only POST is supported"),
            ));
        }

        let body = match Limited::new(req.into_body(), MAX_BODY_BYTES).collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => {
                let response = JsonRpcResponse::error(
                    Value::Null,
                    JsonRpcError::request_too_large(MAX_BODY_BYTES),
                );
                return Ok(HttpTransport::to_http_response_with_status(
                    response,
                    StatusCode::PAYLOAD_TOO_LARGE,
                ));
            }
            Err(e) => {
                return Err(EvalError::Transport(format!(
                    "Failed to read request body: {}",
                    e
                )))
            }
        };

        let jsonrpc_req = match HttpTransport::parse_jsonrpc(&body) {
            Ok(req) => req,
            Err(e) => {
                tracing::debug!("Failed to parse JSON-RPC request: {}", e);
                return Ok(HttpTransport::to_http_error(
                    Value::Null,
                    JsonRpcError::parse_error(),
                ));
            }
        };

        let response = router.handle_request(jsonrpc_req).await;
        Ok(HttpTransport::to_http_response(response))
    }
}
