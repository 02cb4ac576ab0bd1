// shared-core - bitdrift's common client/server libraries
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use crate::metadata::MetadataError;
use crate::status::Status;
use axum::BoxError;
use axum::response::Response;
use bd_grpc_codec::NegotiationError;
use bd_grpc_codec::code::Code;

//
// Error
//

#[derive(Debug, thiserror::Error)]
pub enum Error {
  #[error("Body stream error ocurred: {0}")]
  BodyStream(BoxError),
  #[error("The call was cancelled: {0}")]
  Cancelled(String),
  #[error("Stream has closed")]
  Closed,
  #[error("A codec error occurred: {0}")]
  Codec(#[from] bd_grpc_codec::Error),
  #[error("A compression negotiation error occurred: {0}")]
  CompressionNegotiation(#[from] NegotiationError),
  #[error("A connection timeout occurred")]
  ConnectionTimeout,
  #[error("A gRPC error occurred: {0}")]
  Grpc(#[from] Status),
  #[error("A hyper client error occurred: {0}")]
  HyperClient(#[from] hyper_util::client::legacy::Error),
  #[error("An invalid metadata error occurred: {0}")]
  Metadata(#[from] MetadataError),
  #[error("A protocol violation occurred: {0}")]
  Protocol(String),
  #[error("A request timeout occurred")]
  RequestTimeout,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
  // Shorthand for the state machine misuse error (send/recv against a closed or half closed
  // side, arity violations, etc.).
  pub(crate) fn failed_precondition(message: &str) -> Self {
    Self::Grpc(Status::new(Code::FailedPrecondition, message))
  }

  // Shorthand for a protocol violation by the peer, surfaced locally and propagated as Internal.
  pub(crate) fn internal(message: impl Into<String>) -> Self {
    Self::Grpc(Status::new(Code::Internal, message.into()))
  }

  // Fold every failure into the status taxonomy:
  // - peer-reported statuses pass through verbatim,
  // - transport loss is Unavailable,
  // - deadline expiry is DeadlineExceeded,
  // - wire/codec violations are Internal.
  #[must_use]
  pub fn into_status(self) -> Status {
    match self {
      Self::Grpc(status) => status,
      Self::Cancelled(reason) => Status::new(Code::Cancelled, reason),
      Self::RequestTimeout => Status::new(Code::DeadlineExceeded, "request timeout"),
      Self::Codec(_) | Self::CompressionNegotiation(_) | Self::Metadata(_) | Self::Protocol(_) => {
        Status::new(Code::Internal, self.to_string())
      },
      Self::BodyStream(_) | Self::Closed | Self::ConnectionTimeout | Self::HyperClient(_) => {
        Status::new(Code::Unavailable, self.to_string())
      },
    }
  }

  // Handler failures propagate to the peer as Unknown unless the handler raised a gRPC status
  // itself.
  #[must_use]
  pub fn into_handler_status(self) -> Status {
    match self {
      Self::Grpc(status) => status,
      Self::RequestTimeout => Status::new(Code::DeadlineExceeded, "request timeout"),
      e => Status::new(Code::Unknown, e.to_string()),
    }
  }

  #[must_use]
  pub fn warn_every_message(&self) -> Option<String> {
    match self {
      Self::ConnectionTimeout | Self::RequestTimeout => Some("upstream timeout".to_string()),
      Self::Grpc(status) => {
        if status.code == Code::Internal {
          Some(format!(
            "gRPC internal error ({})",
            status.message.as_ref().map_or_else(|| "", |s| s.as_str())
          ))
        } else {
          None
        }
      },
      Self::Cancelled(_)
      | Self::Closed
      | Self::Codec(_)
      | Self::CompressionNegotiation(_)
      | Self::Metadata(_)
      | Self::Protocol(_) => None,
      Self::BodyStream(e) => Some(format!("body stream error: {e}")),
      Self::HyperClient(e) => Some(format!("hyper client error: {e}")),
    }
  }

  // Convert a pre-body failure into the fused headers+trailers response shape.
  #[must_use]
  pub fn into_response(self) -> Response {
    self.into_status().into_response()
  }
}
