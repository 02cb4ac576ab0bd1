// shared-core - bitdrift's common client/server libraries
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use crate::error::{Error, Result};
use crate::metadata::{self, Metadata};
use crate::{CONTENT_TYPE_GRPC, GRPC_MESSAGE, GRPC_STATUS};
use axum::body::Body;
use axum::response::Response;
use bd_grpc_codec::code::Code;
use http::header::CONTENT_TYPE;
use http::{HeaderMap, HeaderValue};

//
// Status
//

// A gRPC status as carried in proper trailers (or a trailers-only response): the numeric code,
// the optional percent-encoded human readable message, and any custom trailing metadata the peer
// attached.
#[derive(PartialEq, Debug, Clone)]
pub struct Status {
  pub code: Code,
  pub message: Option<String>,
  pub custom_metadata: Metadata,
}

impl Status {
  // Create a new status.
  #[must_use]
  pub fn new(code: Code, message: impl Into<String>) -> Self {
    Self {
      code,
      message: Some(message.into()),
      custom_metadata: Metadata::new(),
    }
  }

  // A bare OK status with no message, the terminal metadata of a cleanly finished direction.
  #[must_use]
  pub const fn ok() -> Self {
    Self {
      code: Code::Ok,
      message: None,
      custom_metadata: Metadata::new(),
    }
  }

  #[must_use]
  pub fn with_custom_metadata(mut self, custom_metadata: Metadata) -> Self {
    self.custom_metadata = custom_metadata;
    self
  }

  // Parse proper trailers (or the trailer portion of a trailers-only response). A missing or
  // malformed grpc-status is a protocol violation by the peer, not a synthetic Unknown.
  pub fn from_trailers(trailers: &HeaderMap) -> Result<Self> {
    let code = trailers
      .get(GRPC_STATUS)
      .ok_or_else(|| Error::Protocol("missing grpc-status in trailers".to_string()))?;
    let code = Code::from_string(code.to_str().unwrap_or_default())
      .ok_or_else(|| Error::Protocol("invalid grpc-status in trailers".to_string()))?;

    // grpc-message is percent-encoded on the wire. Tolerate both its absence and sequences that
    // do not decode, keeping the raw value in the latter case.
    let message = trailers.get(GRPC_MESSAGE).and_then(|value| {
      let raw = value.to_str().ok()?;
      Some(
        urlencoding::decode(raw)
          .map_or_else(|_| raw.to_string(), std::borrow::Cow::into_owned),
      )
    });

    let mut custom_metadata = Metadata::new();
    for (name, value) in trailers {
      let name = name.as_str();
      if name.starts_with("grpc-") {
        // Reserved namespace; grpc-status and grpc-message were consumed above and anything else
        // is skipped rather than exposed as custom metadata.
        continue;
      }

      // The fused trailers-only shape arrives as response headers, so transport furniture can
      // ride alongside the trailers proper.
      if matches!(
        name,
        "content-type" | "content-length" | "date" | "server" | "trailer" | "te" | "vary" | "allow"
      ) {
        continue;
      }

      let (key, value) = metadata::parse_wire_entry(name, value)
        .map_err(|e| Error::Protocol(format!("invalid trailer metadata: {e}")))?;
      custom_metadata.push(key, value);
    }

    Ok(Self {
      code,
      message,
      custom_metadata,
    })
  }

  // Render the proper trailer map.
  #[must_use]
  pub fn to_trailers(&self) -> HeaderMap {
    let mut trailers = HeaderMap::new();
    trailers.insert(
      GRPC_STATUS,
      HeaderValue::from_str(&self.code.to_int().to_string()).unwrap(),
    );

    if let Some(message) = &self.message {
      // We need to make sure the message is a valid header so we URL encode it to be sure.
      let encoded = urlencoding::encode(message);
      trailers.insert(GRPC_MESSAGE, HeaderValue::from_str(&encoded).unwrap());
    }

    self.custom_metadata.write_headers(&mut trailers);

    trailers
  }

  // Convert a status into a trailers-only response compatible with axum: headers and trailers
  // fused into the single HEADERS frame of an empty response.
  #[must_use]
  pub fn into_response(self) -> Response {
    self.into_response_with_body(().into())
  }

  // Convert a status into a response compatible with axum.
  #[must_use]
  pub fn into_response_with_body(self, body: Body) -> Response {
    let mut builder = Response::builder().header(CONTENT_TYPE, CONTENT_TYPE_GRPC);

    let trailers = self.to_trailers();
    for (name, value) in &trailers {
      builder = builder.header(name, value);
    }

    builder.body(body).unwrap()
  }
}

impl std::fmt::Display for Status {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(
      f,
      "code: {}, message: {}",
      self.code.to_int(),
      self.message.as_ref().map_or("<none>", |s| s.as_str())
    )
  }
}

impl std::error::Error for Status {}
