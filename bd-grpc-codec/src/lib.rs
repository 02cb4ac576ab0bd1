// shared-core - bitdrift's common client/server libraries
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./coding_test.rs"]
mod coding_test;

pub mod code;
pub mod compression;
pub mod timeout;

pub use compression::{Compression, CompressionId, Decompression, Negotiation, NegotiationError};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use prometheus::IntCounter;
use std::marker::PhantomData;

// Compression byte + 4 message size bytes.
const GRPC_MESSAGE_PREFIX_LEN: usize = 5;
// Expressed in bytes, the minimum size of the message for it to be considered
// compressable. Used to avoid compression of small messages whose compressed
// version is often greater in size than orginal.
const GRPC_MIN_MESSAGE_SIZE_COMPRESSION_THRESHOLD: usize = 100;

pub const GRPC_ENCODING_HEADER: &str = "grpc-encoding";
pub const GRPC_ACCEPT_ENCODING_HEADER: &str = "grpc-accept-encoding";
pub const GRPC_TIMEOUT_HEADER: &str = "grpc-timeout";

#[derive(thiserror::Error, Debug)]
pub enum Error {
  #[error("message decode error: {0}")]
  Decode(#[source] Box<dyn std::error::Error + Send + Sync>),
  #[error("An io error ocurred: {0}")]
  Io(#[from] std::io::Error),
  #[error("gRPC protocol error: {0}")]
  Protocol(&'static str),
  #[error("A snap error occurred: {0}")]
  Snap(#[from] snap::Error),
}

impl Error {
  pub fn decode(e: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
    Self::Decode(e.into())
  }
}

pub type Result<T> = std::result::Result<T, Error>;

//
// Message
//

// Serialization boundary for payloads carried in gRPC frames. The runtime is agnostic to the
// application codec (protobuf, flatbuffers, etc.); anything that can move to and from bytes can
// ride in a frame.
pub trait Message: Sized + Send + 'static {
  fn to_bytes(&self) -> Bytes;
  fn from_bytes(bytes: Bytes) -> Result<Self>;
}

//
// BinaryMessage
//

// Opaque passthrough payload, for RPCs that carry pre-encoded or foreign bytes.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BinaryMessage(pub Bytes);

impl Message for BinaryMessage {
  fn to_bytes(&self) -> Bytes {
    self.0.clone()
  }

  fn from_bytes(bytes: Bytes) -> Result<Self> {
    Ok(Self(bytes))
  }
}

//
// Encoder
//

struct EncoderCounters {
  tx_bytes: IntCounter,
  tx_bytes_uncompressed: IntCounter,
}

pub struct Encoder<MessageType: Message> {
  compression: Option<Compression>,
  // Byte counts accumulate locally until counters attach: the labels a caller wants on them
  // (negotiated compression among others) are only known once the peer has answered.
  tx_bytes: u64,
  tx_bytes_uncompressed: u64,
  counters: Option<EncoderCounters>,
  _type: PhantomData<MessageType>,
}

impl<MessageType: Message> Encoder<MessageType> {
  #[must_use]
  pub fn new(compression: Option<Compression>) -> Self {
    Self {
      compression,
      tx_bytes: 0,
      tx_bytes_uncompressed: 0,
      counters: None,
      _type: PhantomData,
    }
  }

  // Converts a message into a gRPC frame, potentially compressing the payload.
  pub fn encode(&mut self, message: &MessageType) -> Bytes {
    // Serialize the message then prefix it with the compression byte and the length in big endian
    // (the default for BufMut).
    // See https://github.com/grpc/grpc/blob/master/doc/PROTOCOL-HTTP2.md#requests for an
    // explanation of the gRPC wire format.
    let payload = message.to_bytes();

    let bytes = match self.compression {
      Some(compression) if payload.len() >= GRPC_MIN_MESSAGE_SIZE_COMPRESSION_THRESHOLD => {
        match compression.compress(&payload) {
          Ok(compressed) => {
            log::trace!(
              "compression completed; {} bytes compressed to {} bytes",
              payload.len(),
              compressed.len()
            );
            Self::frame(&compressed, 1)
          },
          Err(e) => {
            // Compression failed, fall back to uncompressed and nullify the compressor so that
            // the encoder doesn't make further attempts to compress incoming messages.
            log::warn!("gRPC compression failed, disabling compression for stream: {e}");
            self.compression = None;
            Self::frame(&payload, 0)
          },
        }
      },
      _ => Self::frame(&payload, 0),
    };

    self.tx_bytes += bytes.len() as u64;
    self.tx_bytes_uncompressed += (payload.len() + GRPC_MESSAGE_PREFIX_LEN) as u64;
    if let Some(counters) = &self.counters {
      counters.tx_bytes.inc_by(bytes.len() as u64);
      counters
        .tx_bytes_uncompressed
        .inc_by((payload.len() + GRPC_MESSAGE_PREFIX_LEN) as u64);
    }

    bytes
  }

  fn frame(payload: &[u8], compressed_flag: u8) -> Bytes {
    let mut buffer = BytesMut::with_capacity(payload.len() + GRPC_MESSAGE_PREFIX_LEN);
    buffer.put_u8(compressed_flag);
    #[allow(clippy::cast_possible_truncation)]
    buffer.put_u32(payload.len() as u32);
    buffer.extend_from_slice(payload);
    buffer.freeze()
  }

  // (wire bytes, pre-compression bytes) sent so far.
  #[must_use]
  pub const fn bandwidth_stats(&self) -> (u64, u64) {
    (self.tx_bytes, self.tx_bytes_uncompressed)
  }

  // Attach prometheus counters, folding in everything sent before they existed.
  pub fn initialize_stats(&mut self, tx_bytes: IntCounter, tx_bytes_uncompressed: IntCounter) {
    debug_assert!(self.counters.is_none());
    tx_bytes.inc_by(self.tx_bytes);
    tx_bytes_uncompressed.inc_by(self.tx_bytes_uncompressed);
    self.counters = Some(EncoderCounters {
      tx_bytes,
      tx_bytes_uncompressed,
    });
  }
}

//
// OptimizeFor
//

pub enum OptimizeFor {
  // Will attempt to reduce CPU usage at the expense of memory usage.
  Cpu,
  // Will attempt to reduce memory usage at the expense of CPU usage.
  Memory,
}

//
// Decoder
//

struct DecoderCounters {
  rx_bytes: IntCounter,
  rx_bytes_decompressed: IntCounter,
}

// A stateful gRPC decoder. As data is added for decoding, the decoder will attempt to decode as
// many messages as possible. If the data contains a partial message, the remaining partial data
// will be retained combined with the data added when decode is next called. This allows for online
// processing of a data stream which might not align with gRPC message boundaries (e.g. a single
// gRPC message split between multiple DATA frames).
pub struct Decoder<MessageType: Message> {
  input_buffer: BytesMut,
  decompression: Option<Decompression>,
  current_message_compressed: bool,
  current_message_size: Option<usize>,
  // As on the encode side, counts accumulate locally until counters attach.
  rx_bytes: u64,
  rx_bytes_decompressed: u64,
  counters: Option<DecoderCounters>,
  optimize_for: OptimizeFor,
  _type: PhantomData<MessageType>,
}

impl<MessageType: Message> Decoder<MessageType> {
  #[must_use]
  pub fn new(decompression: Option<Decompression>, optimize_for: OptimizeFor) -> Self {
    Self {
      input_buffer: BytesMut::new(),
      decompression,
      current_message_compressed: false,
      current_message_size: None,
      rx_bytes: 0,
      rx_bytes_decompressed: 0,
      counters: None,
      optimize_for,
      _type: PhantomData,
    }
  }

  // (wire bytes, post-decompression bytes) received so far.
  #[must_use]
  pub const fn bandwidth_stats(&self) -> (u64, u64) {
    (self.rx_bytes, self.rx_bytes_decompressed)
  }

  // Decodes data, returning all complete messages parsed from the incoming data + any leftover
  // data from a previous chunk of data.
  pub fn decode_data(&mut self, data: &[u8]) -> Result<Vec<MessageType>> {
    self.input_buffer.extend_from_slice(data);

    self.rx_bytes += data.len() as u64;
    if let Some(counters) = &self.counters {
      counters.rx_bytes.inc_by(data.len() as u64);
    }

    let mut messages: Vec<MessageType> = Vec::new();

    // To parse the incoming data, we use a simple state machine:
    // - At the start, we attempt to read enough data to parse the gRPC message prefix (1 byte for
    //   compression, 4 for message size) and use this to determine how large the current message
    //   is.
    // - Once we know the message size, we attempt to read the data for the entire message. At this
    //   point we record the parsed message and go back to step 1.
    // - We end parsing once there is not enough data available to parse either the message prefix
    //   or the message, depending on which stage of the state machine we're at, returning all
    //   messages parsed and keeping track of any partial data remaining for further decode_data
    //   calls.
    //
    // See https://github.com/grpc/grpc/blob/master/doc/PROTOCOL-HTTP2.md#requests for an
    // explanation of the gRPC wire format.
    let messages = loop {
      match self.current_message_size {
        None => {
          if self.input_buffer.len() >= GRPC_MESSAGE_PREFIX_LEN {
            // Read compression byte. `1` means compressed, `0` uncompressed.
            self.current_message_compressed = self.input_buffer.get_u8() == 1;
            // Read the message size as big endian.
            self.current_message_size = Some(self.input_buffer.get_u32().try_into().unwrap());
            log::trace!("next message len={}", self.current_message_size.unwrap());

            continue;
          }

          break messages;
        },
        Some(message_size) => {
          if self.input_buffer.len() >= message_size {
            let message_buffer = if self.current_message_compressed {
              self.decompress(message_size)?
            } else {
              self.input_buffer.split_to(message_size).freeze()
            };

            self.rx_bytes_decompressed += message_buffer.len() as u64;
            if let Some(counters) = &self.counters {
              counters.rx_bytes_decompressed.inc_by(message_buffer.len() as u64);
            }

            self.current_message_size = None;
            messages.push(MessageType::from_bytes(message_buffer)?);
          } else {
            break messages;
          }
        },
      }
    };

    if matches!(self.optimize_for, OptimizeFor::Memory) && self.input_buffer.is_empty() {
      // BytesMut will keep capacity around even if it's empty. If we are trying to reduce memory
      // usage (as in the case of many long lived low throughput connections) we will swap out
      // the buffer for an empty buffer with no backing allocations.
      std::mem::take(&mut self.input_buffer);
    }

    Ok(messages)
  }

  fn decompress(&mut self, message_size: usize) -> Result<Bytes> {
    let compressed = self.input_buffer.split_to(message_size);

    let Some(decompression) = &self.decompression else {
      return Err(Error::Protocol(
        "compressed frame with no compression negotiated",
      ));
    };

    let bytes = decompression.decompress(&compressed)?;
    log::trace!(
      "decompression completed; decompressed {} bytes to {} bytes",
      message_size,
      bytes.len()
    );

    Ok(bytes.into())
  }

  // Attach prometheus counters, folding in everything received before they existed.
  pub fn initialize_stats(&mut self, rx_bytes: IntCounter, rx_bytes_decompressed: IntCounter) {
    debug_assert!(self.counters.is_none());
    rx_bytes.inc_by(self.rx_bytes);
    rx_bytes_decompressed.inc_by(self.rx_bytes_decompressed);
    self.counters = Some(DecoderCounters {
      rx_bytes,
      rx_bytes_decompressed,
    });
  }
}
