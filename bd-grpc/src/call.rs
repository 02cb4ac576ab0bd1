// shared-core - bitdrift's common client/server libraries
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use crate::BodySender;
use crate::error::{Error, Result};
use crate::service::StreamingType;
use crate::stats::BandwidthStatsSummary;
use crate::status::Status;
use axum::body::Body;
use bd_grpc_codec::code::Code;
use bd_grpc_codec::{Compression, Decoder, Decompression, Encoder, Message, OptimizeFor};
use http::HeaderMap;
use http_body::Frame;
use http_body_util::BodyExt;
use prometheus::IntCounter;
use std::collections::VecDeque;

//
// StreamElem
//

// A positioned element in one direction of a call. Finality is explicit: either the element is
// known to be the last one (Final), or the direction ends without a trailing element (NoMore),
// carrying the direction's terminal metadata in both cases.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum StreamElem<T, M = ()> {
  // An element that is not known to be the last one.
  Elem(T),
  // The element known to be final at the time it is produced.
  Final(T, M),
  // The direction finished without an accompanying element.
  NoMore(M),
}

impl<T, M> StreamElem<T, M> {
  #[must_use]
  pub const fn message(&self) -> Option<&T> {
    match self {
      Self::Elem(message) | Self::Final(message, _) => Some(message),
      Self::NoMore(_) => None,
    }
  }

  #[must_use]
  pub fn into_message(self) -> Option<T> {
    match self {
      Self::Elem(message) | Self::Final(message, _) => Some(message),
      Self::NoMore(_) => None,
    }
  }

  #[must_use]
  pub const fn is_terminal(&self) -> bool {
    matches!(self, Self::Final(..) | Self::NoMore(_))
  }
}

//
// Role
//

// Which peer a call half belongs to. The two sides half-close differently: a client ends the
// request body (END_STREAM on the HTTP/2 stream), a server emits trailers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
  Client,
  Server,
}

//
// CallSender
//

#[derive(Debug, PartialEq, Eq)]
enum SendState {
  Open,
  HalfClosed,
  Closed,
}

// The sending half of a call. Enforces the send side of the state machine: messages only while
// open, exactly one terminal event, arity bounds by streaming kind.
pub struct CallSender<MessageType: Message> {
  tx: Option<BodySender>,
  encoder: Encoder<MessageType>,
  role: Role,
  streaming_type: StreamingType,
  state: SendState,
  sent_messages: u64,
  // Attached late by initialize_stats; sent_messages carries the count accrued before then.
  tx_messages_counter: Option<IntCounter>,
  cancelled: Option<String>,
}

impl<MessageType: Message> CallSender<MessageType> {
  pub(crate) fn new(
    tx: BodySender,
    compression: Option<Compression>,
    role: Role,
    streaming_type: StreamingType,
  ) -> Self {
    Self {
      tx: Some(tx),
      encoder: Encoder::new(compression),
      role,
      streaming_type,
      state: SendState::Open,
      sent_messages: 0,
      tx_messages_counter: None,
      cancelled: None,
    }
  }

  // A sender whose single message already went out with the request itself (single-request call
  // kinds ship a complete body so the peer never waits on a second write). The half is born
  // half closed; the encoder is kept for its bandwidth stats.
  pub(crate) fn pre_sent(
    encoder: Encoder<MessageType>,
    role: Role,
    streaming_type: StreamingType,
  ) -> Self {
    Self {
      tx: None,
      encoder,
      role,
      streaming_type,
      state: SendState::HalfClosed,
      sent_messages: 1,
      tx_messages_counter: None,
      cancelled: None,
    }
  }

  // Send one positioned element. Final and NoMore half-close the local side; any send after that
  // is a precondition failure.
  pub async fn send(&mut self, elem: StreamElem<MessageType>) -> Result<()> {
    if let Some(reason) = &self.cancelled {
      return Err(Error::Cancelled(reason.clone()));
    }
    if self.state != SendState::Open {
      return Err(Error::failed_precondition(
        "send on a closed or half closed stream",
      ));
    }

    match elem {
      StreamElem::Elem(message) => self.send_message(message).await,
      StreamElem::Final(message, ()) => {
        self.send_message(message).await?;
        self.half_close().await
      },
      StreamElem::NoMore(()) => self.half_close().await,
    }
  }

  // Server side: end the response stream with an explicit status, error trailers included.
  pub async fn finish(&mut self, status: Status) -> Result<()> {
    debug_assert_eq!(self.role, Role::Server);

    if let Some(reason) = &self.cancelled {
      return Err(Error::Cancelled(reason.clone()));
    }
    if self.state != SendState::Open {
      return Err(Error::failed_precondition(
        "finish on a closed or half closed stream",
      ));
    }

    self.send_trailers(status).await?;
    self.state = SendState::HalfClosed;
    Ok(())
  }

  async fn send_message(&mut self, message: MessageType) -> Result<()> {
    let single = match self.role {
      Role::Client => self.streaming_type.single_request(),
      Role::Server => self.streaming_type.single_response(),
    };
    if single && self.sent_messages >= 1 {
      return Err(Error::failed_precondition(
        "only one message is permitted on this stream",
      ));
    }

    let encoded = self.encoder.encode(&message);
    let Some(tx) = &self.tx else {
      return Err(Error::Closed);
    };
    tx.send(Ok(Frame::data(encoded)))
      .await
      .map_err(|_| Error::Closed)?;
    self.sent_messages += 1;
    if let Some(counter) = &self.tx_messages_counter {
      counter.inc();
    }
    Ok(())
  }

  async fn half_close(&mut self) -> Result<()> {
    match self.role {
      // Dropping the body channel ends the request stream, which the transport translates into
      // END_STREAM.
      Role::Client => self.tx = None,
      Role::Server => self.send_trailers(Status::ok()).await?,
    }

    self.state = SendState::HalfClosed;
    Ok(())
  }

  async fn send_trailers(&mut self, status: Status) -> Result<()> {
    log::trace!("sending trailers for stream: {status}");

    let Some(tx) = &self.tx else {
      return Err(Error::Closed);
    };
    tx.send(Ok(Frame::trailers(status.to_trailers())))
      .await
      .map_err(|_| Error::Closed)?;

    // Nothing may follow trailers.
    self.tx = None;
    Ok(())
  }

  #[must_use]
  pub fn sent_messages(&self) -> u64 {
    self.sent_messages
  }

  pub(crate) fn cancel(&mut self, reason: &str) {
    self.cancelled = Some(reason.to_string());
    self.tx = None;
    self.state = SendState::Closed;
  }

  pub(crate) fn close(&mut self) {
    self.tx = None;
    self.state = SendState::Closed;
  }

  #[must_use]
  pub const fn bandwidth_stats(&self) -> (u64, u64) {
    self.encoder.bandwidth_stats()
  }

  pub fn initialize_stats(
    &mut self,
    tx_messages_total: IntCounter,
    tx_bytes: IntCounter,
    tx_bytes_uncompressed: IntCounter,
  ) {
    self
      .encoder
      .initialize_stats(tx_bytes, tx_bytes_uncompressed);
    debug_assert!(self.tx_messages_counter.is_none());
    tx_messages_total.inc_by(self.sent_messages);
    self.tx_messages_counter = Some(tx_messages_total);
  }
}

//
// CallReceiver
//

#[derive(Debug)]
enum RecvState {
  Open,
  // Terminal state is sticky and keeps the observed trailers so that every further recv repeats
  // NoMore with the same metadata.
  Closed(Status),
}

// The receiving half of a call. Yields Elem per message and commits to the NoMore(trailers)
// terminator shape: END_STREAM is treated as authoritative wherever it arrives, and trailers are
// observed exactly once.
pub struct CallReceiver<MessageType: Message> {
  headers: HeaderMap,
  body: Option<Body>,
  decoder: Decoder<MessageType>,
  role: Role,
  streaming_type: StreamingType,
  pending: VecDeque<MessageType>,
  state: RecvState,
  received_messages: u64,
  cancelled: Option<String>,
}

impl<MessageType: Message> CallReceiver<MessageType> {
  pub(crate) fn new(
    headers: HeaderMap,
    body: Body,
    decompression: Option<Decompression>,
    optimize_for: OptimizeFor,
    role: Role,
    streaming_type: StreamingType,
  ) -> Self {
    Self {
      headers,
      body: Some(body),
      decoder: Decoder::new(decompression, optimize_for),
      role,
      streaming_type,
      pending: VecDeque::new(),
      state: RecvState::Open,
      received_messages: 0,
      cancelled: None,
    }
  }

  // A receiver for the trailers-only response shape: headers and trailers arrived fused, no
  // message will ever be yielded.
  pub(crate) fn new_trailers_only(
    headers: HeaderMap,
    trailers: Status,
    role: Role,
    streaming_type: StreamingType,
  ) -> Self {
    Self {
      headers,
      body: None,
      decoder: Decoder::new(None, OptimizeFor::Cpu),
      role,
      streaming_type,
      pending: VecDeque::new(),
      state: RecvState::Closed(trailers),
      received_messages: 0,
      cancelled: None,
    }
  }

  // Receive the next positioned element. After the terminal NoMore has been observed, recv keeps
  // yielding it with the already observed trailers.
  pub async fn recv(&mut self) -> Result<StreamElem<MessageType, Status>> {
    loop {
      if let Some(reason) = &self.cancelled {
        return Err(Error::Cancelled(reason.clone()));
      }

      if let Some(message) = self.pending.pop_front() {
        self.received_messages += 1;
        self.check_recv_arity()?;
        return Ok(StreamElem::Elem(message));
      }

      if let RecvState::Closed(trailers) = &self.state {
        return Ok(StreamElem::NoMore(trailers.clone()));
      }

      let Some(body) = &mut self.body else {
        return Err(Error::Closed);
      };
      match body.frame().await {
        Some(Ok(frame)) => {
          if frame.is_data() {
            let messages = self.decoder.decode_data(frame.data_ref().unwrap())?;
            self.pending.extend(messages);
          } else if let Some(trailers) = frame.trailers_ref() {
            let trailers = Status::from_trailers(trailers)?;
            self.close_with_trailers(trailers)?;
          }
        },
        Some(Err(e)) => return Err(Error::BodyStream(e.into())),
        None => match self.role {
          // The request body simply ended; the inbound direction at a server carries no wire
          // trailers.
          Role::Server => self.close_with_trailers(Status::ok())?,
          // A response must end in trailers (or the trailers-only shape handled at call start).
          Role::Client => {
            return Err(Error::Protocol(
              "response stream ended without trailers".to_string(),
            ));
          },
        },
      }
    }
  }

  fn single_message(&self) -> bool {
    match self.role {
      Role::Client => self.streaming_type.single_response(),
      Role::Server => self.streaming_type.single_request(),
    }
  }

  fn check_recv_arity(&self) -> Result<()> {
    if self.single_message() && self.received_messages > 1 {
      return Err(match self.role {
        Role::Client => Error::internal("received more than one response message"),
        Role::Server => Error::Grpc(Status::new(
          Code::InvalidArgument,
          "received more than one request message",
        )),
      });
    }

    Ok(())
  }

  fn close_with_trailers(&mut self, trailers: Status) -> Result<()> {
    let observed = self.received_messages + self.pending.len() as u64;
    if self.single_message() && trailers.code.is_ok() && observed == 0 {
      return Err(match self.role {
        Role::Client => Error::internal("expected exactly one response message"),
        Role::Server => Error::Grpc(Status::new(
          Code::InvalidArgument,
          "expected exactly one request message",
        )),
      });
    }

    self.body = None;
    self.state = RecvState::Closed(trailers);
    Ok(())
  }

  // The peer's headers as received when the call was established.
  #[must_use]
  pub const fn received_headers(&self) -> &HeaderMap {
    &self.headers
  }

  // The terminal trailers, once observed.
  #[must_use]
  pub const fn trailers(&self) -> Option<&Status> {
    match &self.state {
      RecvState::Closed(trailers) => Some(trailers),
      RecvState::Open => None,
    }
  }

  pub(crate) fn cancel(&mut self, reason: &str) {
    self.cancelled = Some(reason.to_string());
    self.body = None;
  }

  #[must_use]
  pub const fn bandwidth_stats(&self) -> (u64, u64) {
    self.decoder.bandwidth_stats()
  }

  pub fn initialize_stats(&mut self, rx_bytes: IntCounter, rx_bytes_decompressed: IntCounter) {
    self.decoder.initialize_stats(rx_bytes, rx_bytes_decompressed);
  }
}

//
// Call
//

// A client call: the paired send and receive halves of one HTTP/2 stream. Bidirectional calls
// split() the halves so both directions can run concurrently.
pub struct Call<OutgoingType: Message, IncomingType: Message> {
  sender: CallSender<OutgoingType>,
  receiver: CallReceiver<IncomingType>,
}

impl<OutgoingType: Message, IncomingType: Message> Call<OutgoingType, IncomingType> {
  pub(crate) fn new(
    sender: CallSender<OutgoingType>,
    receiver: CallReceiver<IncomingType>,
  ) -> Self {
    Self { sender, receiver }
  }

  pub async fn send(&mut self, elem: StreamElem<OutgoingType>) -> Result<()> {
    self.sender.send(elem).await
  }

  pub async fn recv(&mut self) -> Result<StreamElem<IncomingType, Status>> {
    self.receiver.recv().await
  }

  // Abort the call. The stream is reset (dropping the body halves releases the HTTP/2 stream)
  // and any further send or recv fails with Cancelled.
  pub fn cancel(&mut self, reason: &str) {
    log::debug!("cancelling call: {reason}");
    self.sender.cancel(reason);
    self.receiver.cancel(reason);
  }

  #[must_use]
  pub fn split(self) -> (CallSender<OutgoingType>, CallReceiver<IncomingType>) {
    (self.sender, self.receiver)
  }

  #[must_use]
  pub const fn received_headers(&self) -> &HeaderMap {
    self.receiver.received_headers()
  }

  #[must_use]
  pub const fn trailers(&self) -> Option<&Status> {
    self.receiver.trailers()
  }

  #[must_use]
  pub const fn bandwidth_stats(&self) -> BandwidthStatsSummary {
    let (rx, rx_decompressed) = self.receiver.bandwidth_stats();
    let (tx, tx_uncompressed) = self.sender.bandwidth_stats();
    BandwidthStatsSummary {
      rx,
      rx_decompressed,
      tx,
      tx_uncompressed,
    }
  }

  pub fn initialize_stats(
    &mut self,
    tx_messages_total: IntCounter,
    tx_bytes: IntCounter,
    tx_bytes_uncompressed: IntCounter,
    rx_bytes: IntCounter,
    rx_bytes_decompressed: IntCounter,
  ) {
    self
      .sender
      .initialize_stats(tx_messages_total, tx_bytes, tx_bytes_uncompressed);
    self
      .receiver
      .initialize_stats(rx_bytes, rx_bytes_decompressed);
  }
}
