// shared-core - bitdrift's common client/server libraries
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use crate::Result;
use std::io::Write;

// zlib has 10 compression levels (0-9). Level 5 provides a good balance between compression
// speed and compression ratio.
pub const DEFAULT_COMPRESSION_LEVEL: u32 = 5;

pub const GRPC_ENCODING_IDENTITY: &str = "identity";
pub const GRPC_ENCODING_GZIP: &str = "gzip";
pub const GRPC_ENCODING_DEFLATE: &str = "deflate";
pub const GRPC_ENCODING_SNAPPY: &str = "snappy";

//
// CompressionId
//

// A message compression algorithm as named on the wire in grpc-encoding / grpc-accept-encoding.
// Vendor algorithms are carried opaquely so that offers from peers round-trip, even though this
// crate cannot code for them.
#[derive(PartialEq, Eq, Debug, Clone, Hash)]
pub enum CompressionId {
  Identity,
  Gzip,
  Deflate,
  Snappy,
  Other(String),
}

impl CompressionId {
  #[must_use]
  pub fn parse(token: &str) -> Self {
    match token {
      GRPC_ENCODING_IDENTITY => Self::Identity,
      GRPC_ENCODING_GZIP => Self::Gzip,
      GRPC_ENCODING_DEFLATE => Self::Deflate,
      GRPC_ENCODING_SNAPPY => Self::Snappy,
      other => Self::Other(other.to_string()),
    }
  }

  #[must_use]
  pub fn as_str(&self) -> &str {
    match self {
      Self::Identity => GRPC_ENCODING_IDENTITY,
      Self::Gzip => GRPC_ENCODING_GZIP,
      Self::Deflate => GRPC_ENCODING_DEFLATE,
      Self::Snappy => GRPC_ENCODING_SNAPPY,
      Self::Other(other) => other.as_str(),
    }
  }

  #[must_use]
  pub const fn is_identity(&self) -> bool {
    matches!(self, Self::Identity)
  }

  // Parse a comma separated accept-encoding list, ignoring surrounding whitespace and empty
  // entries.
  #[must_use]
  pub fn parse_list(value: &str) -> Vec<Self> {
    value
      .split(',')
      .map(str::trim)
      .filter(|token| !token.is_empty())
      .map(Self::parse)
      .collect()
  }
}

impl std::fmt::Display for CompressionId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.as_str())
  }
}

//
// Compression
//

// Outbound message compression. Each message is compressed independently so that per-message
// compressed flags remain authoritative.
#[derive(Debug, Clone, Copy)]
pub enum Compression {
  // Parameter is the compression level in the range of 0-9.
  Gzip { level: u32 },
  // Parameter is the compression level in the range of 0-9.
  Deflate { level: u32 },
  Snappy,
}

impl Compression {
  #[must_use]
  pub const fn id(&self) -> CompressionId {
    match self {
      Self::Gzip { .. } => CompressionId::Gzip,
      Self::Deflate { .. } => CompressionId::Deflate,
      Self::Snappy => CompressionId::Snappy,
    }
  }

  pub fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
    match self {
      Self::Gzip { level } => {
        let mut encoder =
          flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::new(*level));
        encoder.write_all(data)?;
        Ok(encoder.finish()?)
      },
      Self::Deflate { level } => {
        let mut encoder =
          flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::new(*level));
        encoder.write_all(data)?;
        Ok(encoder.finish()?)
      },
      Self::Snappy => Ok(snap::raw::Encoder::new().compress_vec(data)?),
    }
  }
}

//
// Decompression
//

// Inbound message decompression. Decoding support is independent of what we offer: we can always
// decode any built-in algorithm the peer chose. Identity has no decompressor and maps to None.
#[derive(Debug, Clone, Copy)]
pub enum Decompression {
  Gzip,
  Deflate,
  Snappy,
}

impl Decompression {
  #[must_use]
  pub fn for_id(id: &CompressionId) -> Option<Self> {
    match id {
      CompressionId::Gzip => Some(Self::Gzip),
      CompressionId::Deflate => Some(Self::Deflate),
      CompressionId::Snappy => Some(Self::Snappy),
      CompressionId::Identity | CompressionId::Other(_) => None,
    }
  }

  pub fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
    match self {
      Self::Gzip => {
        let mut decoder = flate2::write::GzDecoder::new(Vec::new());
        decoder.write_all(data)?;
        Ok(decoder.finish()?)
      },
      Self::Deflate => {
        let mut decoder = flate2::write::ZlibDecoder::new(Vec::new());
        decoder.write_all(data)?;
        Ok(decoder.finish()?)
      },
      Self::Snappy => Ok(snap::raw::Decoder::new().decompress_vec(data)?),
    }
  }
}

//
// NegotiationError
//

// The peer supports none of the algorithms our negotiation strategy insists on. Carries the
// peer's advertised set for diagnostics.
#[derive(Debug, Clone, thiserror::Error)]
#[error("compression negotiation failed, peer supports: [{}]",
        .peer_supported.iter().map(CompressionId::as_str).collect::<Vec<_>>().join(", "))]
pub struct NegotiationError {
  pub peer_supported: Vec<CompressionId>,
}

//
// Negotiation
//

#[derive(Debug)]
enum Strategy {
  // Never compress.
  Identity,
  // Insist on a single algorithm.
  Require(Compression),
  // Pick the first peer supported entry in our preference order, falling back to identity when
  // nothing overlaps (every peer implicitly decodes identity).
  ChooseFirst(Vec<Compression>),
}

// A connection-scoped compression negotiation: what we advertise, how we pick an outbound
// algorithm from the peer's advertised set, and which inbound ids we will decode. Negotiation
// runs once per connection; until it completes outbound messages use identity.
#[derive(Debug)]
pub struct Negotiation {
  offer: Vec<CompressionId>,
  strategy: Strategy,
}

impl Negotiation {
  // Only identity, never compress.
  #[must_use]
  pub fn none() -> Self {
    Self {
      offer: vec![CompressionId::Identity],
      strategy: Strategy::Identity,
    }
  }

  // Insist on the given algorithm; negotiation fails if the peer does not support it.
  #[must_use]
  pub fn require(compression: Compression) -> Self {
    Self {
      offer: vec![compression.id()],
      strategy: Strategy::Require(compression),
    }
  }

  // Offer the given algorithms in preference order and pick the first one the peer supports.
  #[must_use]
  pub fn choose_first(preferences: Vec<Compression>) -> Self {
    if preferences.is_empty() {
      return Self::none();
    }

    Self {
      offer: preferences.iter().map(Compression::id).collect(),
      strategy: Strategy::ChooseFirst(preferences),
    }
  }

  // The non-empty ordered list advertised in grpc-accept-encoding.
  #[must_use]
  pub fn offer(&self) -> &[CompressionId] {
    &self.offer
  }

  #[must_use]
  pub fn accept_encoding(&self) -> String {
    self
      .offer
      .iter()
      .map(CompressionId::as_str)
      .collect::<Vec<_>>()
      .join(",")
  }

  // Select the outbound algorithm given the peer's advertised set. Ok(None) means identity.
  pub fn choose(
    &self,
    peer_supported: &[CompressionId],
  ) -> std::result::Result<Option<Compression>, NegotiationError> {
    match &self.strategy {
      Strategy::Identity => Ok(None),
      Strategy::Require(compression) => {
        if peer_supported.contains(&compression.id()) {
          Ok(Some(*compression))
        } else {
          Err(NegotiationError {
            peer_supported: peer_supported.to_vec(),
          })
        }
      },
      Strategy::ChooseFirst(preferences) => Ok(
        preferences
          .iter()
          .find(|compression| peer_supported.contains(&compression.id()))
          .copied(),
      ),
    }
  }

  // Whether an inbound grpc-encoding id is acceptable on this connection. Anything outside our
  // advertised offer (identity aside) is a protocol violation by the peer.
  #[must_use]
  pub fn accepts(&self, id: &CompressionId) -> bool {
    id.is_identity() || self.offer.contains(id)
  }
}

#[cfg(test)]
mod tests {
  use super::{Compression, CompressionId, Decompression, Negotiation};

  #[test]
  fn id_tokens_round_trip() {
    for id in [
      CompressionId::Identity,
      CompressionId::Gzip,
      CompressionId::Deflate,
      CompressionId::Snappy,
      CompressionId::Other("custom-lz".to_string()),
    ] {
      assert_eq!(CompressionId::parse(id.as_str()), id);
    }
  }

  #[test]
  fn accept_encoding_list_parse() {
    assert_eq!(
      CompressionId::parse_list("gzip, identity ,custom-lz,"),
      vec![
        CompressionId::Gzip,
        CompressionId::Identity,
        CompressionId::Other("custom-lz".to_string()),
      ]
    );
    assert!(CompressionId::parse_list("").is_empty());
  }

  #[test]
  fn choose_first_picks_our_order() {
    let negotiation = Negotiation::choose_first(vec![
      Compression::Snappy,
      Compression::Gzip { level: 5 },
    ]);
    assert_eq!(negotiation.accept_encoding(), "snappy,gzip");

    let chosen = negotiation
      .choose(&[CompressionId::Gzip, CompressionId::Snappy])
      .unwrap()
      .unwrap();
    assert_eq!(chosen.id(), CompressionId::Snappy);

    // No overlap falls back to identity rather than failing.
    assert!(negotiation
      .choose(&[CompressionId::Deflate])
      .unwrap()
      .is_none());
  }

  #[test]
  fn require_fails_without_peer_support() {
    let negotiation = Negotiation::require(Compression::Gzip { level: 5 });
    let error = negotiation.choose(&[CompressionId::Snappy]).unwrap_err();
    assert_eq!(error.peer_supported, vec![CompressionId::Snappy]);

    assert!(negotiation.choose(&[CompressionId::Gzip]).unwrap().is_some());
  }

  #[test]
  fn inbound_acceptance_is_bounded_by_the_offer() {
    let negotiation = Negotiation::none();
    assert!(negotiation.accepts(&CompressionId::Identity));
    assert!(!negotiation.accepts(&CompressionId::Gzip));

    let negotiation = Negotiation::choose_first(vec![Compression::Gzip { level: 5 }]);
    assert!(negotiation.accepts(&CompressionId::Gzip));
    assert!(!negotiation.accepts(&CompressionId::Snappy));
  }

  #[test]
  fn round_trip_all_algorithms() {
    let payload = b"the quick brown fox jumps over the lazy dog".repeat(20);
    for compression in [
      Compression::Gzip { level: 5 },
      Compression::Deflate { level: 5 },
      Compression::Snappy,
    ] {
      let compressed = compression.compress(&payload).unwrap();
      let decompression = Decompression::for_id(&compression.id()).unwrap();
      assert_eq!(decompression.decompress(&compressed).unwrap(), payload);
    }
  }

  #[test]
  fn identity_has_no_decompressor() {
    assert!(Decompression::for_id(&CompressionId::Identity).is_none());
    assert!(Decompression::for_id(&CompressionId::Other("x".to_string())).is_none());
  }
}
