// shared-core - bitdrift's common client/server libraries
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use crate::compression::DEFAULT_COMPRESSION_LEVEL;
use crate::{
  BinaryMessage,
  Compression,
  Decoder,
  Decompression,
  Encoder,
  Error,
  Message,
  OptimizeFor,
  Result,
};
use assert_matches::assert_matches;
use bytes::Bytes;
use rstest::rstest;

#[ctor::ctor]
fn test_global_init() {
  let _ = env_logger::builder().is_test(true).try_init();
}

//
// TextMessage
//

// A trivial UTF-8 payload codec, standing in for whatever application codec rides on the framing.
#[derive(Debug, PartialEq, Eq, Clone)]
struct TextMessage(String);

impl Message for TextMessage {
  fn to_bytes(&self) -> Bytes {
    self.0.clone().into_bytes().into()
  }

  fn from_bytes(bytes: Bytes) -> Result<Self> {
    Ok(Self(
      String::from_utf8(bytes.to_vec()).map_err(crate::Error::decode)?,
    ))
  }
}

#[rstest]
#[case((Compression::Gzip { level: DEFAULT_COMPRESSION_LEVEL }, Decompression::Gzip, OptimizeFor::Cpu))]
#[case((Compression::Deflate { level: DEFAULT_COMPRESSION_LEVEL }, Decompression::Deflate, OptimizeFor::Memory))]
#[case((Compression::Snappy, Decompression::Snappy, OptimizeFor::Cpu))]
fn encoding_decoding_flow(
  #[case] (compression, decompression, optimize_for): (Compression, Decompression, OptimizeFor),
) {
  let mut encoder = Encoder::<TextMessage>::new(Some(compression));
  let mut decoder = Decoder::<TextMessage>::new(Some(decompression), optimize_for);

  // Check various message sizes to make sure that compressor and decompressor work with diff
  // message lengths, including sizes below the compression threshold. Verify that buffering done
  // internally by encoder and decoder works correctly.
  for i in 0 .. 100 {
    let message = TextMessage("abc".repeat(i * 10));

    let bytes = encoder.encode(&message);
    let result = decoder.decode_data(&bytes);

    assert_eq!(message, result.unwrap().remove(0));
  }
}

#[test]
fn decoder_reassembles_split_frames() {
  let mut encoder = Encoder::<TextMessage>::new(None);
  let message = TextMessage("hello world, again and again".to_string());
  let bytes = encoder.encode(&message);

  // Feed one byte at a time. Only the final byte completes the message.
  let mut decoder = Decoder::<TextMessage>::new(None, OptimizeFor::Memory);
  for chunk in bytes[.. bytes.len() - 1].chunks(1) {
    assert!(decoder.decode_data(chunk).unwrap().is_empty());
  }
  let messages = decoder.decode_data(&bytes[bytes.len() - 1 ..]).unwrap();
  assert_eq!(messages, vec![message]);
}

#[test]
fn decoder_emits_multiple_messages_from_one_chunk() {
  let mut encoder = Encoder::<TextMessage>::new(None);
  let mut buffer = Vec::new();
  buffer.extend_from_slice(&encoder.encode(&TextMessage("one".to_string())));
  buffer.extend_from_slice(&encoder.encode(&TextMessage("two".to_string())));
  buffer.extend_from_slice(&encoder.encode(&TextMessage(String::new())));

  let mut decoder = Decoder::<TextMessage>::new(None, OptimizeFor::Cpu);
  assert_eq!(
    decoder.decode_data(&buffer).unwrap(),
    vec![
      TextMessage("one".to_string()),
      TextMessage("two".to_string()),
      TextMessage(String::new()),
    ]
  );
}

#[test]
fn compressed_frame_without_negotiation_is_a_protocol_error() {
  let mut encoder = Encoder::<TextMessage>::new(Some(Compression::Gzip {
    level: DEFAULT_COMPRESSION_LEVEL,
  }));
  // Large enough to clear the compression threshold so the flag is actually set.
  let bytes = encoder.encode(&TextMessage("a".repeat(1000)));
  assert_eq!(bytes[0], 1);

  let mut decoder = Decoder::<TextMessage>::new(None, OptimizeFor::Cpu);
  assert_matches!(
    decoder.decode_data(&bytes),
    Err(Error::Protocol("compressed frame with no compression negotiated"))
  );
}

#[test]
fn small_messages_skip_compression() {
  let mut encoder = Encoder::<TextMessage>::new(Some(Compression::Snappy));
  let bytes = encoder.encode(&TextMessage("tiny".to_string()));
  assert_eq!(bytes[0], 0);

  // The per-message flag is authoritative, so a decoder with no decompressor still reads it.
  let mut decoder = Decoder::<TextMessage>::new(None, OptimizeFor::Cpu);
  assert_eq!(
    decoder.decode_data(&bytes).unwrap(),
    vec![TextMessage("tiny".to_string())]
  );
}

#[test]
fn payload_decode_errors_propagate() {
  let mut encoder = Encoder::<BinaryMessage>::new(None);
  let bytes = encoder.encode(&BinaryMessage(Bytes::from_static(&[0xff, 0xfe])));

  let mut decoder = Decoder::<TextMessage>::new(None, OptimizeFor::Cpu);
  assert_matches!(decoder.decode_data(&bytes), Err(Error::Decode(_)));
}

#[test]
fn bandwidth_stats_track_frames() {
  let mut encoder = Encoder::<TextMessage>::new(None);
  let message = TextMessage("hello".to_string());
  let bytes = encoder.encode(&message);
  // 5 payload bytes + 5 prefix bytes, identity on both axes.
  assert_eq!(encoder.bandwidth_stats(), (10, 10));

  let mut decoder = Decoder::<TextMessage>::new(None, OptimizeFor::Cpu);
  decoder.decode_data(&bytes).unwrap();
  assert_eq!(decoder.bandwidth_stats(), (10, 5));
}
