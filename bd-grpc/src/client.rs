// shared-core - bitdrift's common client/server libraries
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use crate::GRPC_STATUS;
use crate::call::{Call, CallReceiver, CallSender, Role, StreamElem};
use crate::error::{Error, Result};
use crate::headers::{self, CallParams};
use crate::service::{ServiceMethod, StreamingType};
use crate::status::Status;
use axum::body::Body;
use backoff::SystemClock;
use backoff::backoff::Backoff;
use backoff::exponential::{ExponentialBackoff, ExponentialBackoffBuilder};
use bd_grpc_codec::code::Code;
use bd_grpc_codec::{
  Compression,
  CompressionId,
  Decompression,
  GRPC_ACCEPT_ENCODING_HEADER,
  Message,
  Negotiation,
  NegotiationError,
  OptimizeFor,
};
use http::{HeaderMap, Uri};
use http_body_util::StreamBody;
use hyper_util::client::legacy::connect::{Connect, HttpConnector};
use hyper_util::rt::TokioExecutor;
use parking_lot::Mutex;
use std::error::Error as StdError;
use std::io::ErrorKind;
use std::sync::OnceLock;
use time::Duration;
use tokio::sync::{Semaphore, mpsc};
use tokio_stream::wrappers::ReceiverStream;

//
// AddressHelper
//

#[derive(Debug)]
pub struct AddressHelper {
  address: Uri,
}

impl AddressHelper {
  pub fn new<E: Send + Sync + std::error::Error + 'static>(
    address: impl TryInto<Uri, Error = E>,
  ) -> anyhow::Result<Self> {
    let address: Uri = address.try_into()?;

    // These are unwrapped later on to construct the full URI, so bail early if they are not set.
    if address.scheme().is_none() {
      anyhow::bail!("missing scheme in address");
    }

    if address.authority().is_none() {
      anyhow::bail!("missing authority in address");
    }

    // These are dropped when constructing the final URI, so providing them likely indicates a bug.
    if address.path() != "/" {
      anyhow::bail!(
        "extra path parameter not supported in address: {}",
        address.path()
      );
    }

    if address.query().is_some() {
      anyhow::bail!("extra query parameter not supported in address");
    }

    Ok(Self { address })
  }

  pub fn build<OutgoingType: Message, IncomingType: Message>(
    &self,
    service_method: &ServiceMethod<OutgoingType, IncomingType>,
  ) -> Uri {
    Uri::builder()
      .scheme(self.address.scheme().unwrap().clone())
      .authority(self.address.authority().unwrap().as_str())
      .path_and_query(service_method.full_path())
      .build()
      .unwrap()
  }
}

//
// ConnectParams
//

// Connection level configuration: compression negotiation, defaults applied to every call, and
// the reconnect backoff bounds. The backoff base and cap are deliberately configuration, not
// constants.
pub struct ConnectParams {
  pub negotiation: Negotiation,
  pub default_call_params: CallParams,
  pub connect_timeout: Duration,
  pub max_request_concurrency: u64,
  pub initial_backoff: Duration,
  pub max_backoff: Duration,
}

impl Default for ConnectParams {
  fn default() -> Self {
    Self {
      negotiation: Negotiation::none(),
      default_call_params: CallParams::default(),
      connect_timeout: Duration::seconds(30),
      max_request_concurrency: 1024,
      initial_backoff: Duration::seconds(1),
      max_backoff: Duration::seconds(10),
    }
  }
}

//
// Client
//

struct ReconnectBackoff {
  policy: ExponentialBackoff<SystemClock>,
  // Armed by a transport failure and consumed (slept) by the next call attempt.
  next_delay: Option<std::time::Duration>,
}

// A gRPC client bound to a single peer. Multiplexes calls over the underlying HTTP/2 transport,
// negotiates message compression once per connection, and applies a randomized exponential
// backoff between reconnect attempts after transport loss.
pub struct Client<C> {
  client: hyper_util::client::legacy::Client<C, Body>,
  address: AddressHelper,
  concurrency: Semaphore,
  negotiation: Negotiation,
  // The one shot negotiation outcome, set when the first response headers arrive. Until then
  // outgoing messages use identity.
  negotiated: OnceLock<std::result::Result<Option<Compression>, NegotiationError>>,
  backoff: Mutex<ReconnectBackoff>,
  default_call_params: CallParams,
}

impl Client<HttpConnector> {
  // Creates a new client against a target address using HTTP over a TCP socket.
  pub fn new_http(address: &str, params: ConnectParams) -> anyhow::Result<Self> {
    let mut connector = HttpConnector::new();
    connector.set_nodelay(true);
    connector.set_connect_timeout(Some(params.connect_timeout.unsigned_abs()));

    Self::new_with_client(
      format!("http://{address}"),
      hyper_util::client::legacy::Client::builder(TokioExecutor::new())
        .http2_only(true)
        .build(connector),
      params,
    )
  }
}

impl<C: Connect + Clone + Send + Sync + 'static> Client<C> {
  // Create a new client against a target address. The connector (and with it the TLS story) is
  // the caller's business.
  pub fn new_with_client<E: Send + Sync + std::error::Error + 'static>(
    address: impl TryInto<Uri, Error = E>,
    client: hyper_util::client::legacy::Client<C, Body>,
    params: ConnectParams,
  ) -> anyhow::Result<Self> {
    // The reconnect delay is min(cap, base * 1.5^n) randomized within a [1, 2) multiplier. The
    // backoff crate randomizes symmetrically around its current interval, so the interval is
    // scaled to 1.5x the nominal value and randomized by 1/3: 1.5x * (1 +/- 1/3) lands on the
    // same [1x, 2x] window.
    let policy = ExponentialBackoffBuilder::<SystemClock>::new()
      .with_initial_interval(params.initial_backoff.unsigned_abs().mul_f64(1.5))
      .with_max_interval(params.max_backoff.unsigned_abs().mul_f64(1.5))
      .with_multiplier(1.5)
      .with_randomization_factor(1.0 / 3.0)
      .with_max_elapsed_time(None)
      .build();

    Ok(Self {
      client,
      address: AddressHelper::new(address)?,
      concurrency: Semaphore::new(params.max_request_concurrency.try_into().unwrap()),
      negotiation: params.negotiation,
      negotiated: OnceLock::new(),
      backoff: Mutex::new(ReconnectBackoff {
        policy,
        next_delay: None,
      }),
      default_call_params: params.default_call_params,
    })
  }

  // Open a streaming call. The request headers go out immediately; the returned call is ready
  // for send/recv according to its kind.
  pub async fn start_call<OutgoingType: Message, IncomingType: Message>(
    &self,
    service_method: &ServiceMethod<OutgoingType, IncomingType>,
    call_params: Option<CallParams>,
  ) -> Result<Call<OutgoingType, IncomingType>> {
    let outbound = self.outbound_compression()?;
    let (tx, rx) = mpsc::channel(1);
    let body = Body::new(StreamBody::new(ReceiverStream::new(rx)));
    let sender = CallSender::new(tx, outbound, Role::Client, service_method.streaming_type());

    self
      .start_call_inner(service_method, call_params, outbound, body, sender)
      .await
  }

  // Open a single-request call (unary, server streaming). The request message ships complete
  // with the request itself so the server never has to wait on a second write before it can
  // respond.
  async fn start_single_request_call<OutgoingType: Message, IncomingType: Message>(
    &self,
    service_method: &ServiceMethod<OutgoingType, IncomingType>,
    call_params: Option<CallParams>,
    request: OutgoingType,
  ) -> Result<Call<OutgoingType, IncomingType>> {
    let outbound = self.outbound_compression()?;
    let mut encoder = bd_grpc_codec::Encoder::new(outbound);
    let body = Body::from(encoder.encode(&request));
    let sender = CallSender::pre_sent(encoder, Role::Client, service_method.streaming_type());

    self
      .start_call_inner(service_method, call_params, outbound, body, sender)
      .await
  }

  async fn start_call_inner<OutgoingType: Message, IncomingType: Message>(
    &self,
    service_method: &ServiceMethod<OutgoingType, IncomingType>,
    call_params: Option<CallParams>,
    outbound: Option<Compression>,
    body: Body,
    mut sender: CallSender<OutgoingType>,
  ) -> Result<Call<OutgoingType, IncomingType>> {
    let _permit = self.concurrency.acquire().await.unwrap();

    // Honor the reconnect policy armed by a previous transport failure.
    let delay = self.backoff.lock().next_delay.take();
    if let Some(delay) = delay {
      log::debug!("transport was lost, reconnecting in {} ms", delay.as_millis());
      tokio::time::sleep(delay).await;
    }

    let params = call_params.unwrap_or_else(|| self.default_call_params.clone());
    let outbound_id = outbound.map(|compression| compression.id());
    let request_headers = headers::build_request_headers(
      service_method,
      &params,
      outbound_id.as_ref(),
      &self.negotiation,
    );

    let mut request = hyper::Request::builder()
      .method(hyper::Method::POST)
      .uri(self.address.build(service_method))
      .body(body)
      .unwrap();
    request.headers_mut().extend(request_headers);

    let response = match self.client.request(request).await {
      Ok(response) => response,
      Err(e) => {
        self.note_transport_failure();

        // This is absolutely horrendous but I can't figure out any other way of doing this
        // more cleanly.
        if e
          .source()
          .and_then(StdError::source)
          .and_then(|e| e.downcast_ref::<std::io::Error>())
          .is_some_and(|e| e.kind() == ErrorKind::TimedOut)
        {
          return Err(Error::ConnectionTimeout);
        }

        return Err(e.into());
      },
    };
    self.note_success();

    if !response.status().is_success() {
      return Err(Error::Grpc(Status::new(
        Code::Internal,
        format!("Non-200 response code: {}", response.status()),
      )));
    }

    let (parts, body) = response.into_parts();

    // One shot compression negotiation against the first response headers seen on this
    // connection. A failed negotiation poisons the connection and is not retried.
    self.finalize_negotiation(&parts.headers)?;

    let streaming_type = service_method.streaming_type();

    // The trailers-only shape: the terminal status arrived fused into the response headers and
    // no message will ever follow.
    if parts.headers.contains_key(GRPC_STATUS) {
      let trailers = Status::from_trailers(&parts.headers)?;
      sender.close();
      let receiver =
        CallReceiver::new_trailers_only(parts.headers, trailers, Role::Client, streaming_type);
      return Ok(Call::new(sender, receiver));
    }

    let response_headers =
      headers::parse_response_headers(&parts.headers, service_method.serialization_format())?;
    let decompression = self.resolve_decompression(&response_headers.encoding)?;

    let receiver = CallReceiver::new(
      parts.headers,
      Body::new(body),
      decompression,
      OptimizeFor::Cpu,
      Role::Client,
      streaming_type,
    );
    Ok(Call::new(sender, receiver))
  }

  // Perform a unary request: one message out, one message in, OK trailers. A call timeout (from
  // the params or the connection defaults) is enforced locally as well as being sent to the
  // server via grpc-timeout.
  pub async fn unary<OutgoingType: Message, IncomingType: Message>(
    &self,
    service_method: &ServiceMethod<OutgoingType, IncomingType>,
    call_params: Option<CallParams>,
    request: OutgoingType,
  ) -> Result<IncomingType> {
    debug_assert_eq!(service_method.streaming_type(), StreamingType::NonStreaming);

    let params = call_params.unwrap_or_else(|| self.default_call_params.clone());
    let timeout = params.timeout;
    let call_future = async {
      let mut call = self
        .start_single_request_call(service_method, Some(params), request)
        .await?;

      match call.recv().await? {
        StreamElem::Elem(response) => match call.recv().await? {
          StreamElem::NoMore(trailers) if trailers.code.is_ok() => Ok(response),
          StreamElem::NoMore(trailers) => Err(Error::Grpc(trailers)),
          StreamElem::Elem(_) | StreamElem::Final(..) => {
            Err(Error::internal("received more than one response message"))
          },
        },
        // Trailers-only: no message was ever observed. An error status is the peer's verbatim
        // report; OK with no message violates the unary arity contract.
        StreamElem::NoMore(trailers) => {
          if trailers.code.is_ok() {
            Err(Error::internal("expected exactly one response message"))
          } else {
            Err(Error::Grpc(trailers))
          }
        },
        StreamElem::Final(..) => Err(Error::internal("unexpected final response element")),
      }
    };

    match timeout {
      Some(timeout) => {
        match tokio::time::timeout(timeout.as_duration().unsigned_abs(), call_future).await {
          Ok(result) => result,
          Err(_) => Err(Error::RequestTimeout),
        }
      },
      None => call_future.await,
    }
  }

  // Perform a server streaming request: the single request message goes out immediately and the
  // returned call is receive only.
  pub async fn server_streaming<OutgoingType: Message, IncomingType: Message>(
    &self,
    service_method: &ServiceMethod<OutgoingType, IncomingType>,
    call_params: Option<CallParams>,
    request: OutgoingType,
  ) -> Result<Call<OutgoingType, IncomingType>> {
    debug_assert_eq!(
      service_method.streaming_type(),
      StreamingType::ServerStreaming
    );

    self
      .start_single_request_call(service_method, call_params, request)
      .await
  }

  // Perform a client streaming request. The caller sends elements and half-closes, then receives
  // the single response.
  pub async fn client_streaming<OutgoingType: Message, IncomingType: Message>(
    &self,
    service_method: &ServiceMethod<OutgoingType, IncomingType>,
    call_params: Option<CallParams>,
  ) -> Result<Call<OutgoingType, IncomingType>> {
    debug_assert_eq!(
      service_method.streaming_type(),
      StreamingType::ClientStreaming
    );

    self.start_call(service_method, call_params).await
  }

  // Perform a bi-di streaming request. Both directions run concurrently; split() the call.
  pub async fn streaming<OutgoingType: Message, IncomingType: Message>(
    &self,
    service_method: &ServiceMethod<OutgoingType, IncomingType>,
    call_params: Option<CallParams>,
  ) -> Result<Call<OutgoingType, IncomingType>> {
    debug_assert_eq!(
      service_method.streaming_type(),
      StreamingType::BiDiStreaming
    );

    self.start_call(service_method, call_params).await
  }

  fn outbound_compression(&self) -> Result<Option<Compression>> {
    match self.negotiated.get() {
      // Negotiation has not completed yet; identity until it does.
      None => Ok(None),
      Some(Ok(compression)) => Ok(*compression),
      Some(Err(e)) => Err(Error::CompressionNegotiation(e.clone())),
    }
  }

  fn finalize_negotiation(&self, response_headers: &HeaderMap) -> Result<()> {
    if self.negotiated.get().is_none() {
      let peer_supported = response_headers
        .get(GRPC_ACCEPT_ENCODING_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(CompressionId::parse_list)
        .unwrap_or_default();

      let result = self.negotiation.choose(&peer_supported);
      if let Ok(Some(compression)) = &result {
        log::debug!("negotiated {} compression for connection", compression.id());
      }
      let _ignored = self.negotiated.set(result);
    }

    match self.negotiated.get() {
      Some(Err(e)) => Err(Error::CompressionNegotiation(e.clone())),
      _ => Ok(()),
    }
  }

  // An inbound encoding is only acceptable if we advertised it; a peer compressing outside the
  // negotiated set violated the protocol.
  fn resolve_decompression(&self, encoding: &CompressionId) -> Result<Option<Decompression>> {
    if encoding.is_identity() {
      return Ok(None);
    }

    if !self.negotiation.accepts(encoding) {
      return Err(Error::internal(format!(
        "peer chose compression '{encoding}' that was not negotiated"
      )));
    }

    Decompression::for_id(encoding).map(Some).ok_or_else(|| {
      Error::internal(format!("peer chose unsupported compression '{encoding}'"))
    })
  }

  fn note_transport_failure(&self) {
    let backoff = &mut *self.backoff.lock();
    // With no max elapsed time configured this always yields a delay.
    backoff.next_delay = backoff.policy.next_backoff();
  }

  fn note_success(&self) {
    let backoff = &mut *self.backoff.lock();
    backoff.policy.reset();
    backoff.next_delay = None;
  }
}
