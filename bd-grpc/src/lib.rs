// shared-core - bitdrift's common client/server libraries
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./grpc_test.rs"]
mod grpc_test;

pub mod call;
pub mod client;
pub mod error;
pub mod headers;
pub mod metadata;
pub mod server;
pub mod service;
pub mod stats;
pub mod status;

pub use crate::call::{Call, CallReceiver, CallSender, StreamElem};
pub use crate::client::{AddressHelper, Client, ConnectParams};
pub use crate::error::{Error, Result};
pub use crate::headers::{CallParams, RequestHeaders, ResponseHeaders};
pub use crate::metadata::{Metadata, MetadataKey, MetadataValue};
pub use crate::server::{
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
pub use crate::service::{ServiceMethod, StreamingType};
pub use crate::status::Status;
pub use bd_grpc_codec::code::Code;

use axum::BoxError;
use bytes::Bytes;
use http_body::Frame;
use tokio::sync::mpsc;

pub(crate) const GRPC_STATUS: &str = "grpc-status";
pub(crate) const GRPC_MESSAGE: &str = "grpc-message";
pub const CONTENT_TYPE_GRPC: &str = "application/grpc";
pub(crate) const TE_HEADER: &str = "te";
pub(crate) const TE_TRAILERS: &str = "trailers";
pub(crate) const USER_AGENT_VALUE: &str = concat!("bd-grpc/", env!("CARGO_PKG_VERSION"));

// The sending half of an HTTP/2 stream body: DATA frames carrying gRPC messages, optionally
// terminated by a trailer frame.
pub type BodySender = mpsc::Sender<std::result::Result<Frame<Bytes>, BoxError>>;
