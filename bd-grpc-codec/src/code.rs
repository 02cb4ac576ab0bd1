// shared-core - bitdrift's common client/server libraries
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

//
// Code
//

// The full gRPC status code taxonomy. The numeric mapping is fixed by
// https://grpc.github.io/grpc/core/md_doc_statuscodes.html and must never change.
#[derive(PartialEq, Eq, Debug, Clone, Copy, Hash)]
pub enum Code {
  Ok,
  Cancelled,
  Unknown,
  InvalidArgument,
  DeadlineExceeded,
  NotFound,
  AlreadyExists,
  PermissionDenied,
  ResourceExhausted,
  FailedPrecondition,
  Aborted,
  OutOfRange,
  Unimplemented,
  Internal,
  Unavailable,
  DataLoss,
  Unauthenticated,
}

impl Code {
  #[must_use]
  pub const fn to_int(&self) -> i32 {
    match self {
      Self::Ok => 0,
      Self::Cancelled => 1,
      Self::Unknown => 2,
      Self::InvalidArgument => 3,
      Self::DeadlineExceeded => 4,
      Self::NotFound => 5,
      Self::AlreadyExists => 6,
      Self::PermissionDenied => 7,
      Self::ResourceExhausted => 8,
      Self::FailedPrecondition => 9,
      Self::Aborted => 10,
      Self::OutOfRange => 11,
      Self::Unimplemented => 12,
      Self::Internal => 13,
      Self::Unavailable => 14,
      Self::DataLoss => 15,
      Self::Unauthenticated => 16,
    }
  }

  // Decode a numeric code. Values outside 0..=16 are not part of the taxonomy and yield None;
  // the caller decides whether that is a protocol violation or a synthetic Unknown.
  #[must_use]
  pub const fn from_int(code: i32) -> Option<Self> {
    match code {
      0 => Some(Self::Ok),
      1 => Some(Self::Cancelled),
      2 => Some(Self::Unknown),
      3 => Some(Self::InvalidArgument),
      4 => Some(Self::DeadlineExceeded),
      5 => Some(Self::NotFound),
      6 => Some(Self::AlreadyExists),
      7 => Some(Self::PermissionDenied),
      8 => Some(Self::ResourceExhausted),
      9 => Some(Self::FailedPrecondition),
      10 => Some(Self::Aborted),
      11 => Some(Self::OutOfRange),
      12 => Some(Self::Unimplemented),
      13 => Some(Self::Internal),
      14 => Some(Self::Unavailable),
      15 => Some(Self::DataLoss),
      16 => Some(Self::Unauthenticated),
      _ => None,
    }
  }

  // Decode the decimal representation used by the grpc-status header.
  #[must_use]
  pub fn from_string(status: &str) -> Option<Self> {
    status.parse().ok().and_then(Self::from_int)
  }

  #[must_use]
  pub const fn is_ok(&self) -> bool {
    matches!(self, Self::Ok)
  }
}

impl std::fmt::Display for Code {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let name = match self {
      Self::Ok => "OK",
      Self::Cancelled => "CANCELLED",
      Self::Unknown => "UNKNOWN",
      Self::InvalidArgument => "INVALID_ARGUMENT",
      Self::DeadlineExceeded => "DEADLINE_EXCEEDED",
      Self::NotFound => "NOT_FOUND",
      Self::AlreadyExists => "ALREADY_EXISTS",
      Self::PermissionDenied => "PERMISSION_DENIED",
      Self::ResourceExhausted => "RESOURCE_EXHAUSTED",
      Self::FailedPrecondition => "FAILED_PRECONDITION",
      Self::Aborted => "ABORTED",
      Self::OutOfRange => "OUT_OF_RANGE",
      Self::Unimplemented => "UNIMPLEMENTED",
      Self::Internal => "INTERNAL",
      Self::Unavailable => "UNAVAILABLE",
      Self::DataLoss => "DATA_LOSS",
      Self::Unauthenticated => "UNAUTHENTICATED",
    };
    write!(f, "{name}")
  }
}

#[cfg(test)]
mod tests {
  use super::Code;

  #[test]
  fn int_codec_is_a_bijection_on_the_taxonomy() {
    for code in 0 .. 17 {
      let decoded = Code::from_int(code).unwrap();
      assert_eq!(decoded.to_int(), code);
    }
  }

  #[test]
  fn out_of_range_codes_decode_to_none() {
    assert_eq!(Code::from_int(17), None);
    assert_eq!(Code::from_int(-1), None);
    assert_eq!(Code::from_int(i32::MAX), None);
  }

  #[test]
  fn header_value_decode() {
    assert_eq!(Code::from_string("0"), Some(Code::Ok));
    assert_eq!(Code::from_string("4"), Some(Code::DeadlineExceeded));
    assert_eq!(Code::from_string("16"), Some(Code::Unauthenticated));
    assert_eq!(Code::from_string("17"), None);
    assert_eq!(Code::from_string(""), None);
    assert_eq!(Code::from_string("abc"), None);
  }
}
