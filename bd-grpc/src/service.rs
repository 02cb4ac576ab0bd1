// shared-core - bitdrift's common client/server libraries
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use bd_grpc_codec::Message;
use std::marker::PhantomData;

//
// StreamingType
//

// The streaming kind of an RPC. The call state machine specializes its send/recv arity
// obligations on this tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamingType {
  NonStreaming,
  ClientStreaming,
  ServerStreaming,
  BiDiStreaming,
}

impl StreamingType {
  // Exactly one request message is permitted in this kind.
  #[must_use]
  pub const fn single_request(&self) -> bool {
    matches!(self, Self::NonStreaming | Self::ServerStreaming)
  }

  // Exactly one response message is expected in this kind.
  #[must_use]
  pub const fn single_response(&self) -> bool {
    matches!(self, Self::NonStreaming | Self::ClientStreaming)
  }
}

//
// ServiceMethod
//

// Identifies a single RPC: the /{service}/{method} path, the serialization format announced in
// content-type, the streaming kind, and (via the type parameters) the request and response
// payload codecs. This is the registration key for both client calls and server routes.
pub struct ServiceMethod<OutgoingType: Message, IncomingType: Message> {
  service: String,
  method: String,
  serialization_format: String,
  streaming_type: StreamingType,
  outgoing_type: PhantomData<OutgoingType>,
  incoming_type: PhantomData<IncomingType>,
}

impl<OutgoingType: Message, IncomingType: Message> ServiceMethod<OutgoingType, IncomingType> {
  // Create a new service method given the service name (conventionally package qualified, e.g.
  // "helloworld.Greeter") and the method name.
  #[must_use]
  pub fn new(
    service_name: &str,
    method_name: &str,
    serialization_format: &str,
    streaming_type: StreamingType,
  ) -> Self {
    Self {
      service: service_name.to_string(),
      method: method_name.to_string(),
      serialization_format: serialization_format.to_string(),
      streaming_type,
      outgoing_type: PhantomData,
      incoming_type: PhantomData,
    }
  }

  #[must_use]
  pub fn service_name(&self) -> &str {
    &self.service
  }

  #[must_use]
  pub fn method_name(&self) -> &str {
    &self.method
  }

  #[must_use]
  pub fn serialization_format(&self) -> &str {
    &self.serialization_format
  }

  #[must_use]
  pub const fn streaming_type(&self) -> StreamingType {
    self.streaming_type
  }

  #[must_use]
  pub fn full_path(&self) -> String {
    format!("/{}/{}", self.service, self.method)
  }
}
