// shared-core - bitdrift's common client/server libraries
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use base64ct::{Base64, Base64Unpadded, Encoding};
use http::{HeaderMap, HeaderName, HeaderValue};

// Binary metadata rides under "{name}-bin" with a base64 encoded value.
const BINARY_SUFFIX: &str = "-bin";
// The grpc- namespace belongs to the protocol and may never appear in custom metadata.
const RESERVED_PREFIX: &str = "grpc-";

//
// MetadataError
//

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum MetadataError {
  #[error("invalid metadata key '{0}'")]
  InvalidKey(String),
  #[error("invalid metadata value for key '{0}'")]
  InvalidValue(String),
  #[error("invalid base64 in binary metadata for key '{0}'")]
  InvalidBase64(String),
}

//
// MetadataKey
//

// A validated custom metadata name: lowercase ASCII letters, digits, '-', '_' and '.'. The
// reserved grpc- prefix is rejected, as is a trailing -bin (the suffix is a wire artifact that is
// applied and stripped by the codec, never part of the logical name).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MetadataKey(String);

impl MetadataKey {
  pub fn new(name: impl Into<String>) -> Result<Self, MetadataError> {
    let name = name.into();
    let valid = !name.is_empty()
      && name
        .bytes()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || matches!(b, b'-' | b'_' | b'.'));
    if !valid || name.starts_with(RESERVED_PREFIX) || name.ends_with(BINARY_SUFFIX) {
      return Err(MetadataError::InvalidKey(name));
    }

    Ok(Self(name))
  }

  #[must_use]
  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl std::fmt::Display for MetadataKey {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.0)
  }
}

//
// MetadataValue
//

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetadataValue {
  // Printable ASCII without CR/LF/NUL, carried under the plain name.
  Ascii(String),
  // Arbitrary bytes, base64 encoded under the -bin suffixed name.
  Binary(Vec<u8>),
}

impl MetadataValue {
  fn validate_ascii(value: &str) -> bool {
    value.bytes().all(|b| (0x20 ..= 0x7e).contains(&b))
  }

  #[must_use]
  pub fn as_ascii(&self) -> Option<&str> {
    match self {
      Self::Ascii(value) => Some(value.as_str()),
      Self::Binary(_) => None,
    }
  }

  #[must_use]
  pub fn as_binary(&self) -> Option<&[u8]> {
    match self {
      Self::Binary(value) => Some(value.as_slice()),
      Self::Ascii(_) => None,
    }
  }
}

//
// Metadata
//

// Custom call metadata: an ordered multimap of validated key/value pairs. Order is preserved on
// the wire, though gRPC only guarantees ordering among values of the same key.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Metadata {
  entries: Vec<(MetadataKey, MetadataValue)>,
}

impl Metadata {
  #[must_use]
  pub const fn new() -> Self {
    Self {
      entries: Vec::new(),
    }
  }

  pub fn append_ascii(
    &mut self,
    name: impl Into<String>,
    value: impl Into<String>,
  ) -> Result<(), MetadataError> {
    let key = MetadataKey::new(name)?;
    let value = value.into();
    if !MetadataValue::validate_ascii(&value) {
      return Err(MetadataError::InvalidValue(key.0));
    }

    self.entries.push((key, MetadataValue::Ascii(value)));
    Ok(())
  }

  pub fn append_binary(
    &mut self,
    name: impl Into<String>,
    value: Vec<u8>,
  ) -> Result<(), MetadataError> {
    let key = MetadataKey::new(name)?;
    self.entries.push((key, MetadataValue::Binary(value)));
    Ok(())
  }

  pub(crate) fn push(&mut self, key: MetadataKey, value: MetadataValue) {
    self.entries.push((key, value));
  }

  // First value for a key, if any.
  #[must_use]
  pub fn get(&self, name: &str) -> Option<&MetadataValue> {
    self
      .entries
      .iter()
      .find(|(key, _)| key.as_str() == name)
      .map(|(_, value)| value)
  }

  pub fn iter(&self) -> impl Iterator<Item = (&MetadataKey, &MetadataValue)> {
    self.entries.iter().map(|(key, value)| (key, value))
  }

  #[must_use]
  pub fn len(&self) -> usize {
    self.entries.len()
  }

  #[must_use]
  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  // Write all entries into an outgoing header (or trailer) map. Binary values are emitted as
  // padded base64 under the suffixed name; both key and value were validated at insertion so
  // header construction cannot fail.
  pub fn write_headers(&self, headers: &mut HeaderMap) {
    for (key, value) in &self.entries {
      match value {
        MetadataValue::Ascii(value) => {
          headers.append(
            HeaderName::from_bytes(key.as_str().as_bytes()).unwrap(),
            HeaderValue::from_str(value).unwrap(),
          );
        },
        MetadataValue::Binary(value) => {
          headers.append(
            HeaderName::from_bytes(format!("{}{BINARY_SUFFIX}", key.as_str()).as_bytes()).unwrap(),
            HeaderValue::from_str(&Base64::encode_string(value)).unwrap(),
          );
        },
      }
    }
  }
}

// Decode a single wire header into a metadata entry. A -bin suffix switches to binary mode;
// padded and unpadded base64 are both accepted.
pub(crate) fn parse_wire_entry(
  name: &str,
  value: &HeaderValue,
) -> Result<(MetadataKey, MetadataValue), MetadataError> {
  if let Some(base_name) = name.strip_suffix(BINARY_SUFFIX) {
    let key = MetadataKey::new(base_name)?;
    let encoded = value
      .to_str()
      .map_err(|_| MetadataError::InvalidValue(key.0.clone()))?;
    let decoded = Base64::decode_vec(encoded)
      .or_else(|_| Base64Unpadded::decode_vec(encoded))
      .map_err(|_| MetadataError::InvalidBase64(key.0.clone()))?;
    Ok((key, MetadataValue::Binary(decoded)))
  } else {
    let key = MetadataKey::new(name)?;
    let value = value
      .to_str()
      .map_err(|_| MetadataError::InvalidValue(key.0.clone()))?;
    if !MetadataValue::validate_ascii(value) {
      return Err(MetadataError::InvalidValue(key.0));
    }

    Ok((key, MetadataValue::Ascii(value.to_string())))
  }
}

#[cfg(test)]
mod tests {
  use super::{Metadata, MetadataError, MetadataKey, MetadataValue, parse_wire_entry};
  use assert_matches::assert_matches;
  use http::{HeaderMap, HeaderValue};

  #[test]
  fn key_validation() {
    assert!(MetadataKey::new("x-request-id").is_ok());
    assert!(MetadataKey::new("trace.id_0").is_ok());

    assert_matches!(MetadataKey::new(""), Err(MetadataError::InvalidKey(_)));
    assert_matches!(MetadataKey::new("X-Upper"), Err(MetadataError::InvalidKey(_)));
    assert_matches!(MetadataKey::new("has space"), Err(MetadataError::InvalidKey(_)));
    // The protocol namespace is off limits for custom metadata.
    assert_matches!(
      MetadataKey::new("grpc-anything"),
      Err(MetadataError::InvalidKey(_))
    );
    // The binary suffix is applied by the codec, never part of the name.
    assert_matches!(
      MetadataKey::new("payload-bin"),
      Err(MetadataError::InvalidKey(_))
    );
  }

  #[test]
  fn ascii_value_validation() {
    let mut metadata = Metadata::new();
    assert!(metadata.append_ascii("k", "printable value").is_ok());
    assert_matches!(
      metadata.append_ascii("k", "line\nbreak"),
      Err(MetadataError::InvalidValue(_))
    );
    assert_matches!(
      metadata.append_ascii("k", "nul\0byte"),
      Err(MetadataError::InvalidValue(_))
    );
  }

  #[test]
  fn wire_round_trip() {
    let mut metadata = Metadata::new();
    metadata.append_ascii("x-request-id", "abc-123").unwrap();
    metadata
      .append_binary("payload", vec![0x00, 0xff, 0x10])
      .unwrap();

    let mut headers = HeaderMap::new();
    metadata.write_headers(&mut headers);
    assert_eq!(headers.get("x-request-id").unwrap(), "abc-123");
    // Padded base64 under the suffixed name.
    assert_eq!(headers.get("payload-bin").unwrap(), "AP8Q");

    let mut parsed = Metadata::new();
    for (name, value) in &headers {
      let (key, value) = parse_wire_entry(name.as_str(), value).unwrap();
      parsed.push(key, value);
    }
    assert_eq!(parsed, metadata);
  }

  #[test]
  fn binary_parse_accepts_padded_and_unpadded() {
    let (_, value) =
      parse_wire_entry("payload-bin", &HeaderValue::from_static("3q2+7w==")).unwrap();
    assert_eq!(value, MetadataValue::Binary(vec![0xde, 0xad, 0xbe, 0xef]));

    let (_, value) =
      parse_wire_entry("payload-bin", &HeaderValue::from_static("3q2+7w")).unwrap();
    assert_eq!(value, MetadataValue::Binary(vec![0xde, 0xad, 0xbe, 0xef]));

    assert_matches!(
      parse_wire_entry("payload-bin", &HeaderValue::from_static("!!!")),
      Err(MetadataError::InvalidBase64(_))
    );
  }
}
