// shared-core - bitdrift's common client/server libraries
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use crate::CONTENT_TYPE_GRPC;
use crate::call::{CallReceiver, CallSender, Role, StreamElem};
use crate::error::{Error, Result};
use crate::headers::{self, RequestHeaders};
use crate::service::{ServiceMethod, StreamingType};
use crate::stats::{EndpointStats, ResolvedEndpointStats, StreamStats};
use crate::status::Status;
use axum::body::{Body, to_bytes};
use axum::extract::Request;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{BoxError, Router};
use bd_grpc_codec::code::Code;
use bd_grpc_codec::timeout::Timeout;
use bd_grpc_codec::{
  CompressionId,
  Decoder,
  Decompression,
  GRPC_ACCEPT_ENCODING_HEADER,
  GRPC_ENCODING_HEADER,
  Message,
  Negotiation,
  OptimizeFor,
};
use bytes::Bytes;
use futures::FutureExt;
use http::header::{ALLOW, CONTENT_TYPE};
use http::{HeaderMap, StatusCode};
use http_body::Frame;
use http_body_util::StreamBody;
use hyper::body::Incoming;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder;
use prometheus::{IntCounter, IntGauge};
use std::future::Future;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tower::{Service, ServiceExt};

// Handler for a unary API.
#[async_trait::async_trait]
pub trait Handler<OutgoingType: Message, IncomingType: Message>: Send + Sync {
  async fn handle(&self, headers: RequestHeaders, request: OutgoingType) -> Result<IncomingType>;
}

// Handler for a server streaming API: one request in, any number of response messages pushed
// through the sender.
#[async_trait::async_trait]
pub trait ServerStreamingHandler<ResponseType: Message, RequestType: Message>: Send + Sync {
  async fn stream(
    &self,
    headers: RequestHeaders,
    request: RequestType,
    sender: &mut CallSender<ResponseType>,
  ) -> Result<()>;
}

// Handler for a client streaming API: the request messages are pulled from the receiver, and the
// returned value becomes the single response message.
#[async_trait::async_trait]
pub trait ClientStreamingHandler<ResponseType: Message, RequestType: Message>: Send + Sync {
  async fn handle(
    &self,
    headers: RequestHeaders,
    receiver: &mut CallReceiver<RequestType>,
  ) -> Result<ResponseType>;
}

// Handler for a bi-di streaming API. Both directions are live for the duration of the call.
#[async_trait::async_trait]
pub trait StreamingHandler<ResponseType: Message, RequestType: Message>: Send + Sync {
  async fn stream(
    &self,
    headers: RequestHeaders,
    sender: &mut CallSender<ResponseType>,
    receiver: &mut CallReceiver<RequestType>,
  ) -> Result<()>;
}

// Everything the per-request glue derives from the request headers before the handler runs.
struct PreparedRequest {
  request_headers: RequestHeaders,
  decompression: Option<Decompression>,
  response_compression: Option<bd_grpc_codec::Compression>,
}

fn prepare_request(
  headers: &HeaderMap,
  format: &str,
  negotiation: &Negotiation,
) -> Result<PreparedRequest> {
  let request_headers = headers::parse_request_headers(headers, format)?;

  let decompression = if request_headers.encoding.is_identity() {
    None
  } else {
    if !negotiation.accepts(&request_headers.encoding) {
      return Err(Error::internal(format!(
        "peer chose compression '{}' that was not negotiated",
        request_headers.encoding
      )));
    }

    Some(
      Decompression::for_id(&request_headers.encoding).ok_or_else(|| {
        Error::internal(format!(
          "peer chose unsupported compression '{}'",
          request_headers.encoding
        ))
      })?,
    )
  };

  // Response compression: the first of our preferences the client accepts. A client that accepts
  // nothing we offer simply gets identity.
  let response_compression = negotiation
    .choose(&request_headers.accept_encoding)
    .unwrap_or_else(|e| {
      log::debug!("response compression unavailable: {e}");
      None
    });

  Ok(PreparedRequest {
    request_headers,
    decompression,
    response_compression,
  })
}

// Create a new successful gRPC response with a given body.
#[must_use]
pub fn new_grpc_response(
  body: Body,
  content_type: &str,
  encoding: Option<CompressionId>,
  accept_encoding: &str,
) -> Response {
  let mut builder = Response::builder()
    .header(CONTENT_TYPE, content_type)
    .header(GRPC_ACCEPT_ENCODING_HEADER, accept_encoding);

  if let Some(encoding) = encoding {
    if !encoding.is_identity() {
      builder = builder.header(GRPC_ENCODING_HEADER, encoding.as_str());
    }
  }

  builder.body(body).unwrap()
}

// Enforce the peer provided deadline around a handler future.
async fn with_deadline<T>(
  timeout: Option<Timeout>,
  f: impl Future<Output = Result<T>>,
) -> Result<T> {
  match timeout {
    Some(timeout) => {
      match tokio::time::timeout(timeout.as_duration().unsigned_abs(), f).await {
        Ok(result) => result,
        Err(_) => Err(Error::RequestTimeout),
      }
    },
    None => f.await,
  }
}

// A panicking handler must still produce trailers for the peer, as Unknown.
async fn catch_handler_panic<T>(f: impl Future<Output = Result<T>>) -> Result<T> {
  match AssertUnwindSafe(f).catch_unwind().await {
    Ok(result) => result,
    Err(_) => Err(Error::Grpc(Status::new(Code::Unknown, "handler panicked"))),
  }
}

async fn decode_single_request<MessageType: Message>(
  body: Body,
  decompression: Option<Decompression>,
) -> Result<MessageType> {
  let body_bytes = to_bytes(body, usize::MAX)
    .await
    .map_err(|e| Error::BodyStream(e.into()))?;
  let mut decoder = Decoder::<MessageType>::new(decompression, OptimizeFor::Cpu);
  let mut messages = decoder.decode_data(&body_bytes).map_err(|e| {
    Error::Grpc(Status::new(
      Code::InvalidArgument,
      format!("Invalid request body: {e}"),
    ))
  })?;

  if messages.len() != 1 {
    return Err(Error::Grpc(Status::new(
      Code::InvalidArgument,
      "Invalid request body",
    )));
  }

  Ok(messages.remove(0))
}

// Build the streaming response around the frame channel. With the trailers-only shortcut the
// response HEADERS are held back until the first frame: a stream that opens with trailers (no
// messages were sent) collapses into the single fused HEADERS frame.
async fn streaming_response(
  mut rx: mpsc::Receiver<std::result::Result<Frame<Bytes>, BoxError>>,
  trailers_only_shortcut: bool,
  content_type: &str,
  encoding: Option<CompressionId>,
  accept_encoding: &str,
) -> Response {
  if !trailers_only_shortcut {
    return new_grpc_response(
      Body::new(StreamBody::new(ReceiverStream::new(rx))),
      content_type,
      encoding,
      accept_encoding,
    );
  }

  match rx.recv().await {
    Some(Ok(frame)) => match frame.into_data() {
      Ok(data) => {
        let first = tokio_stream::once(Ok(Frame::data(data)));
        new_grpc_response(
          Body::new(StreamBody::new(first.chain(ReceiverStream::new(rx)))),
          content_type,
          encoding,
          accept_encoding,
        )
      },
      Err(frame) => {
        let trailers = frame.into_trailers().unwrap_or_default();
        let mut builder = Response::builder().header(CONTENT_TYPE, CONTENT_TYPE_GRPC);
        for (name, value) in &trailers {
          builder = builder.header(name, value);
        }
        builder.body(Body::empty()).unwrap()
      },
    },
    Some(Err(_)) | None => {
      Status::new(Code::Internal, "stream closed before any frame").into_response()
    },
  }
}

// Unary glue: decode the single request, run the handler under the deadline, emit one DATA frame
// and OK trailers.
async fn unary_handler<OutgoingType: Message, IncomingType: Message>(
  request: Request,
  handler: Arc<dyn Handler<OutgoingType, IncomingType>>,
  format: &str,
  content_type: &str,
  negotiation: &Negotiation,
) -> Result<Response> {
  let (parts, body) = request.into_parts();
  let prepared = prepare_request(&parts.headers, format, negotiation)?;

  let message = decode_single_request::<OutgoingType>(body, prepared.decompression).await?;

  let timeout = prepared.request_headers.timeout;
  let response = with_deadline(
    timeout,
    catch_handler_panic(handler.handle(prepared.request_headers, message)),
  )
  .await?;

  let (tx, rx) = mpsc::channel::<std::result::Result<_, BoxError>>(2);
  let mut encoder = bd_grpc_codec::Encoder::new(prepared.response_compression);
  let encoded = encoder.encode(&response);
  tx.send(Ok(Frame::data(encoded))).await.unwrap();
  tx.send(Ok(Frame::trailers(Status::ok().to_trailers())))
    .await
    .unwrap();

  Ok(new_grpc_response(
    Body::new(StreamBody::new(ReceiverStream::new(rx))),
    content_type,
    prepared
      .response_compression
      .map(|compression| compression.id()),
    &negotiation.accept_encoding(),
  ))
}

// Create an axum router for a unary request and a handler.
pub fn make_unary_router<OutgoingType: Message, IncomingType: Message>(
  service_method: &ServiceMethod<OutgoingType, IncomingType>,
  handler: Arc<dyn Handler<OutgoingType, IncomingType>>,
  error_handler: impl Fn(&Error) + Clone + Send + Sync + 'static,
  endpoint_stats: Option<&EndpointStats>,
  negotiation: Arc<Negotiation>,
) -> Router {
  debug_assert_eq!(service_method.streaming_type(), StreamingType::NonStreaming);

  let endpoint = endpoint_stats.map(|stats| stats.resolve(service_method));
  let format = service_method.serialization_format().to_string();
  let content_type = headers::content_type_for_format(&format);
  let full_path = Arc::new(service_method.full_path());

  Router::new().route(
    &service_method.full_path(),
    post(move |request: Request| {
      let handler = handler.clone();
      let error_handler = error_handler.clone();
      let endpoint = endpoint.clone();
      let format = format.clone();
      let content_type = content_type.clone();
      let negotiation = negotiation.clone();
      let full_path = full_path.clone();
      async move {
        match unary_handler(request, handler, &format, &content_type, &negotiation).await {
          Ok(response) => {
            if let Some(endpoint) = &endpoint {
              endpoint.success.inc();
            }
            response
          },
          Err(e) => {
            if let Some(warning) = e.warn_every_message() {
              log::warn!("{full_path} failed: {warning}");
            }
            error_handler(&e);
            if let Some(endpoint) = &endpoint {
              endpoint.failure.inc();
            }

            e.into_handler_status().into_response()
          },
        }
      }
    }),
  )
}

// Server streaming glue: decode the single request, then drive the handler in its own task while
// the response streams out.
async fn server_streaming_handler<ResponseType: Message, RequestType: Message>(
  request: Request,
  handler: Arc<dyn ServerStreamingHandler<ResponseType, RequestType>>,
  error_handler: impl Fn(&Error) + Clone + Send + Sync + 'static,
  stream_stats: Option<StreamStats>,
  format: &str,
  content_type: &str,
  negotiation: &Negotiation,
  trailers_only_shortcut: bool,
  full_path: Arc<String>,
) -> Result<Response> {
  if let Some(stats) = &stream_stats {
    stats.stream_initiations_total.inc();
  }

  let (parts, body) = request.into_parts();
  let prepared = prepare_request(&parts.headers, format, negotiation)?;
  let message = decode_single_request::<RequestType>(body, prepared.decompression).await?;

  let (tx, rx) = mpsc::channel(1);
  let timeout = prepared.request_headers.timeout;
  let response_compression = prepared.response_compression;
  let request_headers = prepared.request_headers;

  tokio::spawn(async move {
    let mut sender = CallSender::<ResponseType>::new(
      tx,
      response_compression,
      Role::Server,
      StreamingType::ServerStreaming,
    );
    if let Some(stats) = &stream_stats {
      sender.initialize_stats(
        stats.tx_messages_total.clone(),
        stats.tx_bytes_total.clone(),
        stats.tx_bytes_uncompressed_total.clone(),
      );
    }

    let result = with_deadline(
      timeout,
      catch_handler_panic(handler.stream(request_headers, message, &mut sender)),
    )
    .await;

    match result {
      Ok(()) => {
        if let Some(stats) = &stream_stats {
          stats.rpc.success.inc();
        }

        // Make sure we send grpc-status: 0 to indicate success if we stop without error.
        // This can fail if the client has disconnected or the handler already ended the stream.
        // We ignore the error here since there is nothing more to do.
        let _ignored = sender.send(StreamElem::NoMore(())).await;
      },
      Err(e) => {
        if let Some(warning) = e.warn_every_message() {
          log::warn!("{full_path} failed: {warning}");
        }
        if let Some(stats) = &stream_stats {
          stats.rpc.failure.inc();
        }
        error_handler(&e);

        let status = e.into_handler_status();
        log::debug!("Stream {full_path} failed: {status}");

        // This can fail if the client has disconnected. We ignore the error here since there is
        // nothing more to do.
        let _ignored = sender.finish(status).await;
      },
    }
  });

  Ok(
    streaming_response(
      rx,
      trailers_only_shortcut,
      content_type,
      response_compression.map(|compression| compression.id()),
      &negotiation.accept_encoding(),
    )
    .await,
  )
}

// Create an axum router for a one directional streaming handler.
pub fn make_server_streaming_router<ResponseType: Message, RequestType: Message>(
  service_method: &ServiceMethod<RequestType, ResponseType>,
  handler: Arc<dyn ServerStreamingHandler<ResponseType, RequestType>>,
  error_handler: impl Fn(&Error) + Clone + Send + Sync + 'static,
  endpoint_stats: Option<&EndpointStats>,
  negotiation: Arc<Negotiation>,
  trailers_only_shortcut: bool,
) -> Router {
  debug_assert_eq!(
    service_method.streaming_type(),
    StreamingType::ServerStreaming
  );

  let stream_stats = endpoint_stats.map(|stats| stats.resolve_streaming(service_method));
  let format = service_method.serialization_format().to_string();
  let content_type = headers::content_type_for_format(&format);
  let full_path = Arc::new(service_method.full_path());

  Router::new().route(
    &service_method.full_path(),
    post(move |request: Request| {
      let handler = handler.clone();
      let error_handler = error_handler.clone();
      let stream_stats = stream_stats.clone();
      let format = format.clone();
      let content_type = content_type.clone();
      let negotiation = negotiation.clone();
      let full_path = full_path.clone();
      async move {
        let result = server_streaming_handler(
          request,
          handler,
          error_handler.clone(),
          stream_stats.clone(),
          &format,
          &content_type,
          &negotiation,
          trailers_only_shortcut,
          full_path.clone(),
        )
        .await;

        result.unwrap_or_else(|e| {
          if let Some(warning) = e.warn_every_message() {
            log::warn!("{full_path} failed: {warning}");
          }
          if let Some(stats) = &stream_stats {
            stats.rpc.failure.inc();
          }
          error_handler(&e);

          e.into_handler_status().into_response()
        })
      }
    }),
  )
}

// Client streaming glue: the handler consumes the inbound stream and returns the single
// response message. Handler outcomes happen after the response has started, so accounting and
// the error hook live in the spawned task.
async fn client_streaming_handler<ResponseType: Message, RequestType: Message>(
  request: Request,
  handler: Arc<dyn ClientStreamingHandler<ResponseType, RequestType>>,
  error_handler: impl Fn(&Error) + Clone + Send + Sync + 'static,
  endpoint: Option<ResolvedEndpointStats>,
  format: &str,
  content_type: &str,
  negotiation: &Negotiation,
  full_path: Arc<String>,
) -> Result<Response> {
  let (parts, body) = request.into_parts();
  let prepared = prepare_request(&parts.headers, format, negotiation)?;

  let timeout = prepared.request_headers.timeout;
  let response_compression = prepared.response_compression;
  let request_headers = prepared.request_headers;
  let mut receiver = CallReceiver::<RequestType>::new(
    parts.headers,
    body,
    prepared.decompression,
    OptimizeFor::Memory,
    Role::Server,
    StreamingType::ClientStreaming,
  );

  let (tx, rx) = mpsc::channel(1);
  tokio::spawn(async move {
    let mut sender = CallSender::<ResponseType>::new(
      tx,
      response_compression,
      Role::Server,
      StreamingType::ClientStreaming,
    );

    let result = with_deadline(
      timeout,
      catch_handler_panic(handler.handle(request_headers, &mut receiver)),
    )
    .await;

    match result {
      Ok(response) => {
        if let Some(endpoint) = &endpoint {
          endpoint.success.inc();
        }
        let _ignored = sender.send(StreamElem::Final(response, ())).await;
      },
      Err(e) => {
        if let Some(warning) = e.warn_every_message() {
          log::warn!("{full_path} failed: {warning}");
        }
        if let Some(endpoint) = &endpoint {
          endpoint.failure.inc();
        }
        error_handler(&e);

        let status = e.into_handler_status();
        let _ignored = sender.finish(status).await;
      },
    }
  });

  Ok(
    streaming_response(
      rx,
      false,
      content_type,
      response_compression.map(|compression| compression.id()),
      &negotiation.accept_encoding(),
    )
    .await,
  )
}

// Create an axum router for a client streaming handler.
pub fn make_client_streaming_router<ResponseType: Message, RequestType: Message>(
  service_method: &ServiceMethod<RequestType, ResponseType>,
  handler: Arc<dyn ClientStreamingHandler<ResponseType, RequestType>>,
  error_handler: impl Fn(&Error) + Clone + Send + Sync + 'static,
  endpoint_stats: Option<&EndpointStats>,
  negotiation: Arc<Negotiation>,
) -> Router {
  debug_assert_eq!(
    service_method.streaming_type(),
    StreamingType::ClientStreaming
  );

  let endpoint = endpoint_stats.map(|stats| stats.resolve(service_method));
  let format = service_method.serialization_format().to_string();
  let content_type = headers::content_type_for_format(&format);
  let full_path = Arc::new(service_method.full_path());

  Router::new().route(
    &service_method.full_path(),
    post(move |request: Request| {
      let handler = handler.clone();
      let error_handler = error_handler.clone();
      let endpoint = endpoint.clone();
      let format = format.clone();
      let content_type = content_type.clone();
      let negotiation = negotiation.clone();
      let full_path = full_path.clone();
      async move {
        let result = client_streaming_handler(
          request,
          handler,
          error_handler.clone(),
          endpoint.clone(),
          &format,
          &content_type,
          &negotiation,
          full_path.clone(),
        )
        .await;

        result.unwrap_or_else(|e| {
          if let Some(warning) = e.warn_every_message() {
            log::warn!("{full_path} failed: {warning}");
          }
          error_handler(&e);
          if let Some(endpoint) = &endpoint {
            endpoint.failure.inc();
          }

          e.into_handler_status().into_response()
        })
      }
    }),
  )
}

// Bi-di glue: both directions are handed to the handler and run concurrently for the duration of
// the call.
async fn streaming_handler<ResponseType: Message, RequestType: Message>(
  request: Request,
  handler: Arc<dyn StreamingHandler<ResponseType, RequestType>>,
  error_handler: impl Fn(&Error) + Clone + Send + Sync + 'static,
  stream_stats: Option<StreamStats>,
  format: &str,
  content_type: &str,
  negotiation: &Negotiation,
  full_path: Arc<String>,
) -> Result<Response> {
  if let Some(stats) = &stream_stats {
    stats.stream_initiations_total.inc();
  }

  let (parts, body) = request.into_parts();
  let prepared = prepare_request(&parts.headers, format, negotiation)?;

  let timeout = prepared.request_headers.timeout;
  let response_compression = prepared.response_compression;
  let request_headers = prepared.request_headers;
  let mut receiver = CallReceiver::<RequestType>::new(
    parts.headers,
    body,
    prepared.decompression,
    OptimizeFor::Memory,
    Role::Server,
    StreamingType::BiDiStreaming,
  );

  let (tx, rx) = mpsc::channel(1);
  tokio::spawn(async move {
    let mut sender = CallSender::<ResponseType>::new(
      tx,
      response_compression,
      Role::Server,
      StreamingType::BiDiStreaming,
    );
    if let Some(stats) = &stream_stats {
      sender.initialize_stats(
        stats.tx_messages_total.clone(),
        stats.tx_bytes_total.clone(),
        stats.tx_bytes_uncompressed_total.clone(),
      );
    }

    let result = with_deadline(
      timeout,
      catch_handler_panic(handler.stream(request_headers, &mut sender, &mut receiver)),
    )
    .await;

    match result {
      Ok(()) => {
        if let Some(stats) = &stream_stats {
          stats.rpc.success.inc();
        }
        let _ignored = sender.send(StreamElem::NoMore(())).await;
      },
      Err(e) => {
        if let Some(warning) = e.warn_every_message() {
          log::warn!("{full_path} failed: {warning}");
        }
        if let Some(stats) = &stream_stats {
          stats.rpc.failure.inc();
        }
        error_handler(&e);

        let status = e.into_handler_status();
        log::debug!("Stream {full_path} failed: {status}");
        let _ignored = sender.finish(status).await;
      },
    }
  });

  Ok(
    streaming_response(
      rx,
      false,
      content_type,
      response_compression.map(|compression| compression.id()),
      &negotiation.accept_encoding(),
    )
    .await,
  )
}

// Create an axum router for a bi-di streaming handler.
pub fn make_streaming_router<ResponseType: Message, RequestType: Message>(
  service_method: &ServiceMethod<RequestType, ResponseType>,
  handler: Arc<dyn StreamingHandler<ResponseType, RequestType>>,
  error_handler: impl Fn(&Error) + Clone + Send + Sync + 'static,
  endpoint_stats: Option<&EndpointStats>,
  negotiation: Arc<Negotiation>,
) -> Router {
  debug_assert_eq!(
    service_method.streaming_type(),
    StreamingType::BiDiStreaming
  );

  let stream_stats = endpoint_stats.map(|stats| stats.resolve_streaming(service_method));
  let format = service_method.serialization_format().to_string();
  let content_type = headers::content_type_for_format(&format);
  let full_path = Arc::new(service_method.full_path());

  Router::new().route(
    &service_method.full_path(),
    post(move |request: Request| {
      let handler = handler.clone();
      let error_handler = error_handler.clone();
      let stream_stats = stream_stats.clone();
      let format = format.clone();
      let content_type = content_type.clone();
      let negotiation = negotiation.clone();
      let full_path = full_path.clone();
      async move {
        let result = streaming_handler(
          request,
          handler,
          error_handler.clone(),
          stream_stats.clone(),
          &format,
          &content_type,
          &negotiation,
          full_path.clone(),
        )
        .await;

        result.unwrap_or_else(|e| {
          if let Some(warning) = e.warn_every_message() {
            log::warn!("{full_path} failed: {warning}");
          }
          if let Some(stats) = &stream_stats {
            stats.rpc.failure.inc();
          }
          error_handler(&e);

          e.into_handler_status().into_response()
        })
      }
    }),
  )
}

// Fallback for requests that never reach the gRPC layer. These deliberately break the protocol's
// "always 200" rule: a non-POST method is answered with plain HTTP 405 + Allow, an unparseable
// path with 400. A well formed path that simply isn't registered is a gRPC level Unimplemented.
pub async fn out_of_spec_fallback(request: Request) -> Response {
  if request.method() != http::Method::POST {
    log::debug!(
      "rejecting {} request to {}",
      request.method(),
      request.uri().path()
    );
    return Response::builder()
      .status(StatusCode::METHOD_NOT_ALLOWED)
      .header(ALLOW, "POST")
      .body(Body::empty())
      .unwrap();
  }

  if headers::parse_path(request.uri().path()).is_none() {
    log::debug!("rejecting malformed path {}", request.uri().path());
    return StatusCode::BAD_REQUEST.into_response();
  }

  Status::new(
    Code::Unimplemented,
    format!("unknown service method {}", request.uri().path()),
  )
  .into_response()
}

// This is a manual implementation of the axum accept loop with graceful shutdown. It adds
// connection count tracking.
pub async fn serve_with_connect_info(
  router: Router,
  listener: TcpListener,
  cx_total: IntCounter,
  cx_active: IntGauge,
  shutdown: impl Future<Output = ()>,
) -> anyhow::Result<()> {
  let mut make_service = router.into_make_service_with_connect_info::<SocketAddr>();
  tokio::pin!(shutdown);

  let (cx_shutdown_tx, cx_shutdown_rx) = watch::channel(false);
  let mut connections: JoinSet<()> = JoinSet::new();

  loop {
    let (socket, remote_addr) = tokio::select! {
      result = listener.accept() => result.map_err(|e| {
        log::warn!("listener accept failure, shutting down: {e}");
        e
      })?,
      () = &mut shutdown => {
        break;
      },
    };

    // We don't need to call `poll_ready` because `IntoMakeServiceWithConnectInfo` is always
    // ready.
    let tower_service = make_service.call(remote_addr).await.unwrap();

    cx_total.inc();
    cx_active.inc();
    let cx_active = cx_active.clone();
    let mut cx_shutdown = cx_shutdown_rx.clone();

    connections.spawn(async move {
      let socket = TokioIo::new(socket);

      let hyper_service = hyper::service::service_fn(move |request: http::Request<Incoming>| {
        tower_service.clone().oneshot(request)
      });

      let builder = Builder::new(TokioExecutor::new());
      let cx = builder.serve_connection_with_upgrades(socket, hyper_service);
      tokio::pin!(cx);

      tokio::select! {
        result = &mut cx => {
          if let Err(e) = result {
            log::debug!("connection serve failure: {e}");
          }
        },
        _ = cx_shutdown.changed() => {
          cx.as_mut().graceful_shutdown();
          if let Err(e) = cx.await {
            log::debug!("connection serve failure: {e}");
          }
        },
      }

      cx_active.dec();
    });
  }

  drop(listener);
  let _ignored = cx_shutdown_tx.send(true);
  while connections.join_next().await.is_some() {}

  Ok(())
}
