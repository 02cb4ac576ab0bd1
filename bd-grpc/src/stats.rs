// shared-core - bitdrift's common client/server libraries
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use crate::service::ServiceMethod;
use bd_grpc_codec::Message;
use prometheus::{IntCounter, IntCounterVec, Opts, Registry};

//
// EndpointStats
//

pub struct EndpointStats {
  rpc: IntCounterVec,
  stream_initiations: IntCounterVec,
  stream_tx_messages: IntCounterVec,
  bandwidth_tx_bytes: IntCounterVec,
  bandwidth_tx_bytes_uncompressed: IntCounterVec,
}

#[derive(Clone)]
pub struct ResolvedEndpointStats {
  pub success: IntCounter,
  pub failure: IntCounter,
}

impl EndpointStats {
  #[must_use]
  pub fn new(registry: &Registry) -> Self {
    fn register(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> IntCounterVec {
      let counter = IntCounterVec::new(Opts::new(name, help), labels).unwrap();
      registry.register(Box::new(counter.clone())).unwrap();
      counter
    }

    Self {
      rpc: register(
        registry,
        "rpc",
        "RPC completions by result.",
        &["service", "endpoint", "result"],
      ),
      stream_initiations: register(
        registry,
        "stream_initiations_total",
        "Initiated streaming requests.",
        &["service", "endpoint"],
      ),
      stream_tx_messages: register(
        registry,
        "stream_tx_messages_total",
        "Messages sent across streams.",
        &["service", "endpoint"],
      ),
      bandwidth_tx_bytes: register(
        registry,
        "bandwidth_tx_bytes_total",
        "Bytes sent on the wire.",
        &["service", "endpoint"],
      ),
      bandwidth_tx_bytes_uncompressed: register(
        registry,
        "bandwidth_tx_bytes_uncompressed_total",
        "Bytes sent before compression.",
        &["service", "endpoint"],
      ),
    }
  }

  #[must_use]
  pub fn resolve<OutgoingType: Message, IncomingType: Message>(
    &self,
    service: &ServiceMethod<OutgoingType, IncomingType>,
  ) -> ResolvedEndpointStats {
    let service_label = service.service_name().replace('.', "_");
    ResolvedEndpointStats {
      success: self.rpc.with_label_values(&[
        service_label.as_str(),
        service.method_name(),
        "success",
      ]),
      failure: self.rpc.with_label_values(&[
        service_label.as_str(),
        service.method_name(),
        "failure",
      ]),
    }
  }

  #[must_use]
  pub fn resolve_streaming<OutgoingType: Message, IncomingType: Message>(
    &self,
    service: &ServiceMethod<OutgoingType, IncomingType>,
  ) -> StreamStats {
    let service_label = service.service_name().replace('.', "_");
    let labels = [service_label.as_str(), service.method_name()];

    StreamStats {
      stream_initiations_total: self.stream_initiations.with_label_values(&labels),
      rpc: self.resolve(service),
      tx_messages_total: self.stream_tx_messages.with_label_values(&labels),
      tx_bytes_total: self.bandwidth_tx_bytes.with_label_values(&labels),
      tx_bytes_uncompressed_total: self
        .bandwidth_tx_bytes_uncompressed
        .with_label_values(&labels),
    }
  }
}

//
// BandwidthStatsSummary
//

pub struct BandwidthStatsSummary {
  pub rx: u64,
  pub rx_decompressed: u64,
  pub tx: u64,
  pub tx_uncompressed: u64,
}

//
// StreamStats
//

// gRPC streaming request stats.
#[derive(Clone)]
pub struct StreamStats {
  // The number of initiated streaming requests.
  pub(crate) stream_initiations_total: IntCounter,

  pub(crate) rpc: ResolvedEndpointStats,

  // The number of messages sent across a stream that was opened in response to a streaming
  // request.
  pub(crate) tx_messages_total: IntCounter,

  pub(crate) tx_bytes_total: IntCounter,
  pub(crate) tx_bytes_uncompressed_total: IntCounter,
}
