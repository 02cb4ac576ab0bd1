// shared-core - bitdrift's common client/server libraries
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use crate::call::{CallReceiver, CallSender, StreamElem};
use crate::client::{Client, ConnectParams};
use crate::error::{Error, Result};
use crate::headers::{CallParams, RequestHeaders};
use crate::server::{
  ClientStreamingHandler,
  Handler,
  ServerStreamingHandler,
  StreamingHandler,
  make_client_streaming_router,
  make_server_streaming_router,
  make_streaming_router,
  make_unary_router,
  out_of_spec_fallback,
  serve_with_connect_info,
};
use crate::service::{ServiceMethod, StreamingType};
use crate::stats::EndpointStats;
use crate::status::Status;
use assert_matches::assert_matches;
use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::routing::post;
use bd_grpc_codec::code::Code;
use bd_grpc_codec::timeout::Timeout;
use bd_grpc_codec::{Compression, Message, Negotiation};
use bytes::Bytes;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use prometheus::Registry;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

#[ctor::ctor]
fn test_global_init() {
  let _ = env_logger::builder().is_test(true).try_init();
}

//
// EchoRequest / EchoResponse
//

#[derive(Debug, Clone, PartialEq, Eq, Default)]
struct EchoRequest {
  echo: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
struct EchoResponse {
  echo: String,
}

macro_rules! text_message {
  ($name:ident) => {
    impl Message for $name {
      fn to_bytes(&self) -> Bytes {
        self.echo.clone().into_bytes().into()
      }

      fn from_bytes(bytes: Bytes) -> bd_grpc_codec::Result<Self> {
        Ok(Self {
          echo: String::from_utf8(bytes.to_vec()).map_err(bd_grpc_codec::Error::decode)?,
        })
      }
    }
  };
}

text_message!(EchoRequest);
text_message!(EchoResponse);

fn unary_method() -> ServiceMethod<EchoRequest, EchoResponse> {
  ServiceMethod::new("test.Test", "Echo", "proto", StreamingType::NonStreaming)
}

fn server_streaming_method() -> ServiceMethod<EchoRequest, EchoResponse> {
  ServiceMethod::new("test.Test", "Expand", "proto", StreamingType::ServerStreaming)
}

fn client_streaming_method() -> ServiceMethod<EchoRequest, EchoResponse> {
  ServiceMethod::new("test.Test", "Collect", "proto", StreamingType::ClientStreaming)
}

fn streaming_method() -> ServiceMethod<EchoRequest, EchoResponse> {
  ServiceMethod::new("test.Test", "Chat", "proto", StreamingType::BiDiStreaming)
}

async fn start_server(router: Router) -> SocketAddr {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let local_address = listener.local_addr().unwrap();
  let server = axum::serve(
    listener,
    router.fallback(out_of_spec_fallback).into_make_service(),
  );
  tokio::spawn(async { server.await.unwrap() });
  local_address
}

fn new_client(address: SocketAddr) -> Client<HttpConnector> {
  Client::new_http(&address.to_string(), ConnectParams::default()).unwrap()
}

//
// EchoHandler
//

#[derive(Default)]
struct EchoHandler {
  sleep: Option<Duration>,
}

#[async_trait]
impl Handler<EchoRequest, EchoResponse> for EchoHandler {
  async fn handle(&self, _headers: RequestHeaders, request: EchoRequest) -> Result<EchoResponse> {
    if let Some(sleep) = self.sleep {
      tokio::time::sleep(sleep).await;
    }

    Ok(EchoResponse { echo: request.echo })
  }
}

//
// MetadataProbeHandler
//

// Echoes the custom metadata it received so that tests can observe the parsed request headers.
struct MetadataProbeHandler {}

#[async_trait]
impl Handler<EchoRequest, EchoResponse> for MetadataProbeHandler {
  async fn handle(&self, headers: RequestHeaders, _request: EchoRequest) -> Result<EchoResponse> {
    let ascii = headers
      .custom_metadata
      .get("x-request-id")
      .and_then(|value| value.as_ascii())
      .unwrap_or_default()
      .to_string();
    let binary = headers
      .custom_metadata
      .get("blob")
      .and_then(|value| value.as_binary())
      .unwrap_or_default()
      .to_vec();

    Ok(EchoResponse {
      echo: format!("{ascii}/{binary:?}"),
    })
  }
}

//
// ErrorHandler
//

struct ErrorHandler {}

#[async_trait]
impl Handler<EchoRequest, EchoResponse> for ErrorHandler {
  async fn handle(&self, _headers: RequestHeaders, _request: EchoRequest) -> Result<EchoResponse> {
    Err(Error::Grpc(Status::new(Code::Internal, "foo")))
  }
}

//
// RepeatHandler
//

// Streams the request back `count` times, optionally sleeping first, optionally finishing with
// explicit trailers carrying custom metadata.
struct RepeatHandler {
  count: usize,
  sleep: Option<Duration>,
  finish_with_metadata: bool,
}

#[async_trait]
impl ServerStreamingHandler<EchoResponse, EchoRequest> for RepeatHandler {
  async fn stream(
    &self,
    _headers: RequestHeaders,
    request: EchoRequest,
    sender: &mut CallSender<EchoResponse>,
  ) -> Result<()> {
    if let Some(sleep) = self.sleep {
      tokio::time::sleep(sleep).await;
    }

    for i in 0 .. self.count {
      sender
        .send(StreamElem::Elem(EchoResponse {
          echo: format!("{} {i}", request.echo),
        }))
        .await?;
    }

    if self.finish_with_metadata {
      let mut status = Status::new(Code::Ok, "all done");
      status
        .custom_metadata
        .append_ascii("x-trailer", "present")
        .unwrap();
      sender.finish(status).await?;
    }

    Ok(())
  }
}

//
// CollectHandler
//

// Joins every request message into the single client streaming response.
struct CollectHandler {}

#[async_trait]
impl ClientStreamingHandler<EchoResponse, EchoRequest> for CollectHandler {
  async fn handle(
    &self,
    _headers: RequestHeaders,
    receiver: &mut CallReceiver<EchoRequest>,
  ) -> Result<EchoResponse> {
    let mut parts = Vec::new();
    loop {
      match receiver.recv().await? {
        StreamElem::Elem(message) | StreamElem::Final(message, _) => parts.push(message.echo),
        StreamElem::NoMore(_) => break,
      }
    }

    Ok(EchoResponse {
      echo: parts.join(","),
    })
  }
}

//
// ChatHandler
//

// Echoes every inbound message back on the outbound direction.
struct ChatHandler {}

#[async_trait]
impl StreamingHandler<EchoResponse, EchoRequest> for ChatHandler {
  async fn stream(
    &self,
    _headers: RequestHeaders,
    sender: &mut CallSender<EchoResponse>,
    receiver: &mut CallReceiver<EchoRequest>,
  ) -> Result<()> {
    loop {
      match receiver.recv().await? {
        StreamElem::Elem(message) | StreamElem::Final(message, _) => {
          sender
            .send(StreamElem::Elem(EchoResponse {
              echo: format!("ack {}", message.echo),
            }))
            .await?;
        },
        StreamElem::NoMore(_) => return Ok(()),
      }
    }
  }
}

#[tokio::test]
async fn unary() {
  let stats = Registry::new();
  let endpoint_stats = EndpointStats::new(&stats);
  let local_address = start_server(make_unary_router(
    &unary_method(),
    Arc::new(EchoHandler::default()),
    |_| {},
    Some(&endpoint_stats),
    Arc::new(Negotiation::none()),
  ))
  .await;

  let client = new_client(local_address);
  let response = client
    .unary(&unary_method(), None, EchoRequest {
      echo: "hello world".to_string(),
    })
    .await
    .unwrap();
  assert_eq!(response.echo, "hello world");

  let families = stats.gather();
  let rpc = families.iter().find(|f| f.get_name() == "rpc").unwrap();
  let success = rpc
    .get_metric()
    .iter()
    .find(|m| m.get_label().iter().any(|l| l.get_value() == "success"))
    .unwrap();
  assert_eq!(success.get_counter().get_value() as u64, 1);
}

#[tokio::test]
async fn unary_custom_metadata() {
  let local_address = start_server(make_unary_router(
    &unary_method(),
    Arc::new(MetadataProbeHandler {}),
    |_| {},
    None,
    Arc::new(Negotiation::none()),
  ))
  .await;

  let mut params = CallParams::default();
  params
    .custom_metadata
    .append_ascii("x-request-id", "abc-123")
    .unwrap();
  params
    .custom_metadata
    .append_binary("blob", vec![0, 255])
    .unwrap();

  let client = new_client(local_address);
  let response = client
    .unary(&unary_method(), Some(params), EchoRequest::default())
    .await
    .unwrap();
  assert_eq!(response.echo, "abc-123/[0, 255]");
}

#[tokio::test]
async fn unary_error_handler() {
  let called = Arc::new(AtomicBool::new(false));
  let called_clone = called.clone();
  let local_address = start_server(make_unary_router(
    &unary_method(),
    Arc::new(ErrorHandler {}),
    move |e| {
      assert_matches!(e, Error::Grpc(_));
      called_clone.store(true, Ordering::SeqCst);
    },
    None,
    Arc::new(Negotiation::none()),
  ))
  .await;

  let client = new_client(local_address);
  assert_matches!(
    client
      .unary(&unary_method(), None, EchoRequest::default())
      .await,
    Err(Error::Grpc(status)) => {
      assert_eq!(status.code, Code::Internal);
      assert_eq!(status.message.as_deref(), Some("foo"));
    }
  );
  assert!(called.load(Ordering::SeqCst));
}

#[tokio::test]
async fn unary_unimplemented_is_trailers_only() {
  // No routes registered at all: the fallback owns every path.
  let local_address = start_server(Router::new()).await;

  let client = new_client(local_address);
  assert_matches!(
    client
      .unary(&unary_method(), None, EchoRequest::default())
      .await,
    Err(Error::Grpc(status)) => assert_eq!(status.code, Code::Unimplemented)
  );
}

#[tokio::test]
async fn server_streaming() {
  let local_address = start_server(make_server_streaming_router(
    &server_streaming_method(),
    Arc::new(RepeatHandler {
      count: 3,
      sleep: None,
      finish_with_metadata: false,
    }),
    |_| {},
    None,
    Arc::new(Negotiation::none()),
    false,
  ))
  .await;

  let client = new_client(local_address);
  let mut call = client
    .server_streaming(&server_streaming_method(), None, EchoRequest {
      echo: "feature".to_string(),
    })
    .await
    .unwrap();

  for i in 0 .. 3 {
    assert_matches!(
      call.recv().await.unwrap(),
      StreamElem::Elem(message) => assert_eq!(message.echo, format!("feature {i}"))
    );
  }
  assert_matches!(
    call.recv().await.unwrap(),
    StreamElem::NoMore(trailers) => assert!(trailers.code.is_ok())
  );
  // The terminal state is sticky and repeats the observed trailers.
  assert_matches!(call.recv().await.unwrap(), StreamElem::NoMore(_));
  assert!(call.trailers().unwrap().code.is_ok());
}

#[tokio::test]
async fn server_streaming_trailers_with_custom_metadata() {
  let local_address = start_server(make_server_streaming_router(
    &server_streaming_method(),
    Arc::new(RepeatHandler {
      count: 1,
      sleep: None,
      finish_with_metadata: true,
    }),
    |_| {},
    None,
    Arc::new(Negotiation::none()),
    false,
  ))
  .await;

  let client = new_client(local_address);
  let mut call = client
    .server_streaming(&server_streaming_method(), None, EchoRequest {
      echo: "x".to_string(),
    })
    .await
    .unwrap();

  assert_matches!(call.recv().await.unwrap(), StreamElem::Elem(_));
  assert_matches!(
    call.recv().await.unwrap(),
    StreamElem::NoMore(trailers) => {
      assert!(trailers.code.is_ok());
      // grpc-message survives percent encoding.
      assert_eq!(trailers.message.as_deref(), Some("all done"));
      assert_eq!(
        trailers.custom_metadata.get("x-trailer").unwrap().as_ascii(),
        Some("present")
      );
    }
  );
}

#[tokio::test]
async fn empty_server_streaming_collapses_to_trailers_only() {
  let local_address = start_server(make_server_streaming_router(
    &server_streaming_method(),
    Arc::new(RepeatHandler {
      count: 0,
      sleep: None,
      finish_with_metadata: false,
    }),
    |_| {},
    None,
    Arc::new(Negotiation::none()),
    true,
  ))
  .await;

  let client = new_client(local_address);
  let mut call = client
    .server_streaming(&server_streaming_method(), None, EchoRequest::default())
    .await
    .unwrap();

  // The status arrived fused with the response headers; no message is ever observed.
  assert_matches!(
    call.recv().await.unwrap(),
    StreamElem::NoMore(trailers) => assert!(trailers.code.is_ok())
  );
}

#[tokio::test]
async fn client_streaming() {
  let local_address = start_server(make_client_streaming_router(
    &client_streaming_method(),
    Arc::new(CollectHandler {}),
    |_| {},
    None,
    Arc::new(Negotiation::none()),
  ))
  .await;

  let client = new_client(local_address);
  let mut call = client
    .client_streaming(&client_streaming_method(), None)
    .await
    .unwrap();

  for i in 0 .. 3 {
    call
      .send(StreamElem::Elem(EchoRequest {
        echo: format!("p{i}"),
      }))
      .await
      .unwrap();
  }
  call
    .send(StreamElem::Final(
      EchoRequest {
        echo: "p3".to_string(),
      },
      (),
    ))
    .await
    .unwrap();

  assert_matches!(
    call.recv().await.unwrap(),
    StreamElem::Elem(response) => assert_eq!(response.echo, "p0,p1,p2,p3")
  );
  assert_matches!(
    call.recv().await.unwrap(),
    StreamElem::NoMore(trailers) => assert!(trailers.code.is_ok())
  );
}

#[tokio::test]
async fn send_after_half_close_is_failed_precondition() {
  let local_address = start_server(make_client_streaming_router(
    &client_streaming_method(),
    Arc::new(CollectHandler {}),
    |_| {},
    None,
    Arc::new(Negotiation::none()),
  ))
  .await;

  let client = new_client(local_address);
  let mut call = client
    .client_streaming(&client_streaming_method(), None)
    .await
    .unwrap();

  call.send(StreamElem::NoMore(())).await.unwrap();
  assert_matches!(
    call.send(StreamElem::Elem(EchoRequest::default())).await,
    Err(Error::Grpc(status)) => assert_eq!(status.code, Code::FailedPrecondition)
  );
}

#[tokio::test]
async fn bidi_streaming() {
  let local_address = start_server(make_streaming_router(
    &streaming_method(),
    Arc::new(ChatHandler {}),
    |_| {},
    None,
    Arc::new(Negotiation::none()),
  ))
  .await;

  let client = new_client(local_address);
  let call = client.streaming(&streaming_method(), None).await.unwrap();
  let (mut sender, mut receiver) = call.split();

  // Interleave the directions: the peer acks each note as it arrives.
  for i in 0 .. 2 {
    sender
      .send(StreamElem::Elem(EchoRequest {
        echo: format!("note{i}"),
      }))
      .await
      .unwrap();
    assert_matches!(
      receiver.recv().await.unwrap(),
      StreamElem::Elem(message) => assert_eq!(message.echo, format!("ack note{i}"))
    );
  }

  // Half closing the outbound direction does not terminate the inbound one by itself; the
  // handler drains and completes, producing trailers.
  sender.send(StreamElem::NoMore(())).await.unwrap();
  assert_matches!(
    receiver.recv().await.unwrap(),
    StreamElem::NoMore(trailers) => assert!(trailers.code.is_ok())
  );
}

#[tokio::test]
async fn cancelled_call_fails_pending_operations() {
  let local_address = start_server(make_streaming_router(
    &streaming_method(),
    Arc::new(ChatHandler {}),
    |_| {},
    None,
    Arc::new(Negotiation::none()),
  ))
  .await;

  let client = new_client(local_address);
  let mut call = client.streaming(&streaming_method(), None).await.unwrap();

  call.cancel("test is done");
  assert_matches!(
    call.send(StreamElem::Elem(EchoRequest::default())).await,
    Err(Error::Cancelled(_))
  );
  assert_matches!(call.recv().await, Err(Error::Cancelled(_)));
}

#[tokio::test]
async fn local_deadline() {
  let local_address = start_server(make_unary_router(
    &unary_method(),
    Arc::new(EchoHandler {
      sleep: Some(Duration::from_secs(10)),
    }),
    |_| {},
    None,
    Arc::new(Negotiation::none()),
  ))
  .await;

  let client = new_client(local_address);
  let params = CallParams {
    timeout: Timeout::parse("50m"),
    ..Default::default()
  };
  // Both sides enforce the deadline; whichever fires first, the observed status is
  // DeadlineExceeded.
  let result = client
    .unary(&unary_method(), Some(params), EchoRequest::default())
    .await;
  assert_eq!(
    result.unwrap_err().into_status().code,
    Code::DeadlineExceeded
  );
}

#[tokio::test]
async fn server_deadline() {
  let local_address = start_server(make_server_streaming_router(
    &server_streaming_method(),
    Arc::new(RepeatHandler {
      count: 1,
      sleep: Some(Duration::from_secs(10)),
      finish_with_metadata: false,
    }),
    |_| {},
    None,
    Arc::new(Negotiation::none()),
    false,
  ))
  .await;

  let client = new_client(local_address);
  let params = CallParams {
    timeout: Timeout::parse("100m"),
    ..Default::default()
  };
  let mut call = client
    .server_streaming(&server_streaming_method(), Some(params), EchoRequest::default())
    .await
    .unwrap();

  // The server enforces grpc-timeout and reports the expiry in trailers.
  assert_matches!(
    call.recv().await.unwrap(),
    StreamElem::NoMore(trailers) => assert_eq!(trailers.code, Code::DeadlineExceeded)
  );
}

#[tokio::test]
async fn compression_mismatch_fails_with_internal() {
  // A peer that claims gzip even though the connection negotiated nothing.
  let router = Router::new().route(
    &unary_method().full_path(),
    post(|| async {
      axum::response::Response::builder()
        .header("content-type", "application/grpc")
        .header("grpc-encoding", "gzip")
        .body(Body::empty())
        .unwrap()
    }),
  );
  let local_address = start_server(router).await;

  let client = new_client(local_address);
  assert_matches!(
    client
      .unary(&unary_method(), None, EchoRequest::default())
      .await,
    Err(Error::Grpc(status)) => {
      assert_eq!(status.code, Code::Internal);
      assert!(status.message.unwrap().contains("not negotiated"));
    }
  );
}

#[tokio::test]
async fn compressed_frame_without_negotiation_fails_decoding() {
  // A peer that sets the compressed flag without announcing any encoding at all.
  let router = Router::new().route(
    &server_streaming_method().full_path(),
    post(|| async {
      // flag=1, len=3, then junk: a frame that claims compression.
      let frame = Bytes::from_static(&[1, 0, 0, 0, 3, 0xaa, 0xbb, 0xcc]);
      axum::response::Response::builder()
        .header("content-type", "application/grpc")
        .body(Body::from(frame))
        .unwrap()
    }),
  );
  let local_address = start_server(router).await;

  let client = new_client(local_address);
  let mut call = client
    .server_streaming(&server_streaming_method(), None, EchoRequest::default())
    .await
    .unwrap();
  assert_matches!(
    call.recv().await,
    Err(Error::Codec(bd_grpc_codec::Error::Protocol(_)))
  );
}

#[tokio::test]
async fn compression_negotiation_round_trip() {
  let local_address = start_server(make_unary_router(
    &unary_method(),
    Arc::new(EchoHandler::default()),
    |_| {},
    None,
    Arc::new(Negotiation::choose_first(vec![Compression::Gzip {
      level: 5,
    }])),
  ))
  .await;

  let client = Client::new_http(&local_address.to_string(), ConnectParams {
    negotiation: Negotiation::choose_first(vec![Compression::Gzip { level: 5 }]),
    ..Default::default()
  })
  .unwrap();

  // First call goes out with identity (negotiation has not completed) and observes the server's
  // accept-encoding; the second call is compressed end to end.
  for _ in 0 .. 2 {
    let response = client
      .unary(&unary_method(), None, EchoRequest {
        echo: "a".repeat(1000),
      })
      .await
      .unwrap();
    assert_eq!(response.echo, "a".repeat(1000));
  }
}

#[tokio::test]
async fn out_of_spec_requests() {
  let local_address = start_server(make_unary_router(
    &unary_method(),
    Arc::new(EchoHandler::default()),
    |_| {},
    None,
    Arc::new(Negotiation::none()),
  ))
  .await;

  let raw_client: hyper_util::client::legacy::Client<HttpConnector, Body> =
    hyper_util::client::legacy::Client::builder(TokioExecutor::new())
      .http2_only(true)
      .build(HttpConnector::new());

  // Non-POST: plain HTTP 405 with Allow, not a gRPC status.
  let response = raw_client
    .request(
      hyper::Request::builder()
        .method(hyper::Method::GET)
        .uri(format!("http://{local_address}/test.Test/Echo"))
        .body(Body::empty())
        .unwrap(),
    )
    .await
    .unwrap();
  assert_eq!(response.status(), 405);
  assert_eq!(response.headers().get("allow").unwrap(), "POST");

  // Unparseable path: plain HTTP 400.
  let response = raw_client
    .request(
      hyper::Request::builder()
        .method(hyper::Method::POST)
        .uri(format!("http://{local_address}/notaservice"))
        .body(Body::empty())
        .unwrap(),
    )
    .await
    .unwrap();
  assert_eq!(response.status(), 400);

  // Well formed but unregistered path: 200 with a fused Unimplemented status.
  let response = raw_client
    .request(
      hyper::Request::builder()
        .method(hyper::Method::POST)
        .uri(format!("http://{local_address}/test.Test/Nope"))
        .header("content-type", "application/grpc")
        .body(Body::empty())
        .unwrap(),
    )
    .await
    .unwrap();
  assert_eq!(response.status(), 200);
  assert_eq!(response.headers().get("grpc-status").unwrap(), "12");
}

#[tokio::test]
async fn graceful_serve() {
  let router = make_unary_router(
    &unary_method(),
    Arc::new(EchoHandler::default()),
    |_| {},
    None,
    Arc::new(Negotiation::none()),
  )
  .fallback(out_of_spec_fallback);

  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let local_address = listener.local_addr().unwrap();
  let cx_total = prometheus::IntCounter::new("cx_total", "-").unwrap();
  let cx_active = prometheus::IntGauge::new("cx_active", "-").unwrap();
  let (shutdown_tx, shutdown_rx) = oneshot::channel();

  let serve_task = tokio::spawn(serve_with_connect_info(
    router,
    listener,
    cx_total.clone(),
    cx_active.clone(),
    async {
      let _ignored = shutdown_rx.await;
    },
  ));

  let client = new_client(local_address);
  let response = client
    .unary(&unary_method(), None, EchoRequest {
      echo: "shutdown next".to_string(),
    })
    .await
    .unwrap();
  assert_eq!(response.echo, "shutdown next");
  assert_eq!(cx_total.get(), 1);

  shutdown_tx.send(()).unwrap();
  serve_task.await.unwrap().unwrap();
  assert_eq!(cx_active.get(), 0);
}
