// shared-core - bitdrift's common client/server libraries
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use crate::error::{Error, Result};
use crate::metadata::{self, Metadata};
use crate::service::ServiceMethod;
use crate::status::Status;
use crate::{CONTENT_TYPE_GRPC, TE_HEADER, TE_TRAILERS, USER_AGENT_VALUE};
use bd_grpc_codec::code::Code;
use bd_grpc_codec::timeout::Timeout;
use bd_grpc_codec::{
  CompressionId,
  GRPC_ACCEPT_ENCODING_HEADER,
  GRPC_ENCODING_HEADER,
  GRPC_TIMEOUT_HEADER,
  Message,
  Negotiation,
};
use http::header::{CONTENT_TYPE, USER_AGENT};
use http::{HeaderMap, HeaderValue};

pub const CONTENT_TYPE_GRPC_OCTET_STREAM: &str = "application/grpc+octet-stream";

// The content types we accept for an RPC whose serialization format is `format`: the bare gRPC
// type, the octet-stream wildcard, and our own format. Everything else is rejected.
fn content_type_acceptable(value: &str, format: &str) -> bool {
  value == CONTENT_TYPE_GRPC
    || value == CONTENT_TYPE_GRPC_OCTET_STREAM
    || value
      .strip_prefix("application/grpc+")
      .is_some_and(|f| f == format)
}

pub(crate) fn content_type_for_format(format: &str) -> String {
  format!("application/grpc+{format}")
}

// Split a request path into /{service}/{method}. Returns None when the path does not have exactly
// two non-empty segments.
#[must_use]
pub fn parse_path(path: &str) -> Option<(&str, &str)> {
  let rest = path.strip_prefix('/')?;
  let (service, method) = rest.split_once('/')?;
  if service.is_empty() || method.is_empty() || method.contains('/') {
    return None;
  }

  Some((service, method))
}

fn invalid_argument(message: impl Into<String>) -> Error {
  Error::Grpc(Status::new(Code::InvalidArgument, message.into()))
}

//
// CallParams
//

// The user facing subset of request headers: everything else is derived from the service method
// and the connection state.
#[derive(Debug, Clone, Default)]
pub struct CallParams {
  pub timeout: Option<Timeout>,
  pub custom_metadata: Metadata,
}

//
// RequestHeaders
//

// Parsed request headers as seen by the server side of a call.
#[derive(Debug)]
pub struct RequestHeaders {
  pub timeout: Option<Timeout>,
  pub encoding: CompressionId,
  pub accept_encoding: Vec<CompressionId>,
  pub custom_metadata: Metadata,
}

// Accumulator for the single pass header parse: per-field optional slots filled while walking
// the map, validated once at the end.
#[derive(Default)]
struct RequestHeadersBuilder {
  content_type: Option<String>,
  timeout: Option<Timeout>,
  encoding: Option<CompressionId>,
  accept_encoding: Option<Vec<CompressionId>>,
  custom_metadata: Metadata,
}

impl RequestHeadersBuilder {
  fn finalize(self, format: &str) -> Result<RequestHeaders> {
    let Some(content_type) = self.content_type else {
      return Err(invalid_argument("missing content-type"));
    };
    if !content_type_acceptable(&content_type, format) {
      return Err(invalid_argument(format!(
        "unsupported content-type: {content_type}"
      )));
    }

    Ok(RequestHeaders {
      timeout: self.timeout,
      encoding: self.encoding.unwrap_or(CompressionId::Identity),
      accept_encoding: self.accept_encoding.unwrap_or_default(),
      custom_metadata: self.custom_metadata,
    })
  }
}

// Parse the request headers of an incoming call. Failures map to InvalidArgument, which the
// server reports via a trailers-only response.
pub fn parse_request_headers(headers: &HeaderMap, format: &str) -> Result<RequestHeaders> {
  let mut builder = RequestHeadersBuilder::default();
  for (name, value) in headers {
    match name.as_str() {
      "content-type" => {
        builder.content_type = Some(
          value
            .to_str()
            .map_err(|_| invalid_argument("invalid content-type"))?
            .to_string(),
        );
      },
      GRPC_TIMEOUT_HEADER => {
        builder.timeout = Some(
          value
            .to_str()
            .ok()
            .and_then(Timeout::parse)
            .ok_or_else(|| invalid_argument("invalid grpc-timeout"))?,
        );
      },
      GRPC_ENCODING_HEADER => {
        builder.encoding = Some(CompressionId::parse(
          value
            .to_str()
            .map_err(|_| invalid_argument("invalid grpc-encoding"))?,
        ));
      },
      GRPC_ACCEPT_ENCODING_HEADER => {
        builder.accept_encoding = Some(CompressionId::parse_list(
          value
            .to_str()
            .map_err(|_| invalid_argument("invalid grpc-accept-encoding"))?,
        ));
      },
      // Transport level headers that are neither protocol nor custom metadata.
      "te" | "user-agent" | "host" | "content-length" | "accept" | "accept-encoding" => {},
      name if name.starts_with("grpc-") => {
        // Reserved namespace: tolerate headers from future protocol revisions.
      },
      name => {
        let (key, value) = metadata::parse_wire_entry(name, value)
          .map_err(|e| invalid_argument(format!("invalid metadata header '{name}': {e}")))?;
        builder.custom_metadata.push(key, value);
      },
    }
  }

  builder.finalize(format)
}

// Assemble the wire headers for an outgoing call.
pub(crate) fn build_request_headers<OutgoingType: Message, IncomingType: Message>(
  service_method: &ServiceMethod<OutgoingType, IncomingType>,
  params: &CallParams,
  encoding: Option<&CompressionId>,
  negotiation: &Negotiation,
) -> HeaderMap {
  let mut headers = HeaderMap::new();
  headers.insert(
    CONTENT_TYPE,
    HeaderValue::from_str(&content_type_for_format(
      service_method.serialization_format(),
    ))
    .unwrap(),
  );
  headers.insert(TE_HEADER, HeaderValue::from_static(TE_TRAILERS));
  headers.insert(USER_AGENT, HeaderValue::from_static(USER_AGENT_VALUE));

  if let Some(timeout) = params.timeout {
    headers.insert(
      GRPC_TIMEOUT_HEADER,
      HeaderValue::from_str(&timeout.format()).unwrap(),
    );
  }

  // Identity is the wire default and is never announced explicitly.
  if let Some(encoding) = encoding {
    if !encoding.is_identity() {
      headers.insert(
        GRPC_ENCODING_HEADER,
        HeaderValue::from_str(encoding.as_str()).unwrap(),
      );
    }
  }

  headers.insert(
    GRPC_ACCEPT_ENCODING_HEADER,
    HeaderValue::from_str(&negotiation.accept_encoding()).unwrap(),
  );

  params.custom_metadata.write_headers(&mut headers);

  headers
}

//
// ResponseHeaders
//

// Parsed response headers as seen by the client side of a call.
#[derive(Debug)]
pub struct ResponseHeaders {
  pub encoding: CompressionId,
  pub accept_encoding: Vec<CompressionId>,
  pub custom_metadata: Metadata,
}

#[derive(Default)]
struct ResponseHeadersBuilder {
  content_type: Option<String>,
  encoding: Option<CompressionId>,
  accept_encoding: Option<Vec<CompressionId>>,
  custom_metadata: Metadata,
}

impl ResponseHeadersBuilder {
  fn finalize(self, format: &str) -> Result<ResponseHeaders> {
    // Tolerate an absent response content-type, but reject an alien one.
    if let Some(content_type) = &self.content_type {
      if !content_type_acceptable(content_type, format) {
        return Err(Error::Protocol(format!(
          "unsupported response content-type: {content_type}"
        )));
      }
    }

    Ok(ResponseHeaders {
      encoding: self.encoding.unwrap_or(CompressionId::Identity),
      accept_encoding: self.accept_encoding.unwrap_or_default(),
      custom_metadata: self.custom_metadata,
    })
  }
}

// Parse the response headers of a call. Failures here are protocol violations by the peer and
// surface as Internal.
pub fn parse_response_headers(headers: &HeaderMap, format: &str) -> Result<ResponseHeaders> {
  let mut builder = ResponseHeadersBuilder::default();
  for (name, value) in headers {
    match name.as_str() {
      "content-type" => {
        builder.content_type = Some(
          value
            .to_str()
            .map_err(|_| Error::Protocol("invalid response content-type".to_string()))?
            .to_string(),
        );
      },
      GRPC_ENCODING_HEADER => {
        builder.encoding = Some(CompressionId::parse(value.to_str().map_err(|_| {
          Error::Protocol("invalid grpc-encoding in response".to_string())
        })?));
      },
      GRPC_ACCEPT_ENCODING_HEADER => {
        builder.accept_encoding = Some(CompressionId::parse_list(value.to_str().map_err(
          |_| Error::Protocol("invalid grpc-accept-encoding in response".to_string()),
        )?));
      },
      // Server/framework furniture that is neither protocol nor custom metadata.
      "content-length" | "date" | "server" | "trailer" | "te" | "vary" => {},
      name if name.starts_with("grpc-") => {
        // grpc-status/grpc-message ride here only in the trailers-only shape, which the caller
        // handles before parsing; other reserved names are tolerated.
      },
      name => {
        let (key, value) = metadata::parse_wire_entry(name, value)
          .map_err(|e| Error::Protocol(format!("invalid metadata header '{name}': {e}")))?;
        builder.custom_metadata.push(key, value);
      },
    }
  }

  builder.finalize(format)
}

#[cfg(test)]
mod tests {
  use super::{CallParams, build_request_headers, parse_path, parse_request_headers};
  use crate::error::Error;
  use crate::service::{ServiceMethod, StreamingType};
  use assert_matches::assert_matches;
  use bd_grpc_codec::code::Code;
  use bd_grpc_codec::timeout::Timeout;
  use bd_grpc_codec::{BinaryMessage, CompressionId, Negotiation};

  fn service_method() -> ServiceMethod<BinaryMessage, BinaryMessage> {
    ServiceMethod::new("pkg.Test", "Echo", "proto", StreamingType::NonStreaming)
  }

  #[test]
  fn path_parsing() {
    assert_eq!(
      parse_path("/helloworld.Greeter/SayHello"),
      Some(("helloworld.Greeter", "SayHello"))
    );
    assert_eq!(parse_path("/a/b/c"), None);
    assert_eq!(parse_path("/a/"), None);
    assert_eq!(parse_path("//b"), None);
    assert_eq!(parse_path("/a"), None);
    assert_eq!(parse_path("a/b"), None);
  }

  #[test]
  fn request_headers_round_trip() {
    let mut params = CallParams {
      timeout: Timeout::parse("250m"),
      ..Default::default()
    };
    params
      .custom_metadata
      .append_ascii("x-request-id", "abc")
      .unwrap();
    params
      .custom_metadata
      .append_binary("blob", vec![1, 2, 3])
      .unwrap();

    let headers = build_request_headers(
      &service_method(),
      &params,
      Some(&CompressionId::Gzip),
      &Negotiation::none(),
    );
    assert_eq!(headers.get("te").unwrap(), "trailers");
    assert_eq!(headers.get("content-type").unwrap(), "application/grpc+proto");
    assert_eq!(headers.get("grpc-timeout").unwrap(), "250m");
    assert_eq!(headers.get("grpc-encoding").unwrap(), "gzip");
    assert_eq!(headers.get("grpc-accept-encoding").unwrap(), "identity");
    assert!(headers.get("user-agent").is_some());

    let parsed = parse_request_headers(&headers, "proto").unwrap();
    assert_eq!(parsed.timeout, params.timeout);
    assert_eq!(parsed.encoding, CompressionId::Gzip);
    assert_eq!(parsed.accept_encoding, vec![CompressionId::Identity]);
    assert_eq!(parsed.custom_metadata, params.custom_metadata);
  }

  #[test]
  fn identity_encoding_is_not_announced() {
    let headers = build_request_headers(
      &service_method(),
      &CallParams::default(),
      Some(&CompressionId::Identity),
      &Negotiation::none(),
    );
    assert!(headers.get("grpc-encoding").is_none());
  }

  #[test]
  fn content_type_validation() {
    for acceptable in [
      "application/grpc",
      "application/grpc+octet-stream",
      "application/grpc+proto",
    ] {
      let mut headers = build_request_headers(
        &service_method(),
        &CallParams::default(),
        None,
        &Negotiation::none(),
      );
      headers.insert("content-type", acceptable.try_into().unwrap());
      assert!(parse_request_headers(&headers, "proto").is_ok());
    }

    let mut headers = build_request_headers(
      &service_method(),
      &CallParams::default(),
      None,
      &Negotiation::none(),
    );
    headers.insert("content-type", "application/json".try_into().unwrap());
    assert_matches!(
      parse_request_headers(&headers, "proto"),
      Err(Error::Grpc(status)) => assert_eq!(status.code, Code::InvalidArgument)
    );
  }

  #[test]
  fn malformed_timeout_is_invalid_argument() {
    let mut headers = build_request_headers(
      &service_method(),
      &CallParams::default(),
      None,
      &Negotiation::none(),
    );
    headers.insert("grpc-timeout", "12x".try_into().unwrap());
    assert_matches!(
      parse_request_headers(&headers, "proto"),
      Err(Error::Grpc(status)) => assert_eq!(status.code, Code::InvalidArgument)
    );
  }
}
