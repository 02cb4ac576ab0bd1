// shared-core - bitdrift's common client/server libraries
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use time::Duration;

// The wire format allows at most 8 ASCII digits before the unit suffix.
const MAX_TIMEOUT_VALUE: u64 = 99_999_999;

//
// TimeoutUnit
//

// Unit suffix for the grpc-timeout header, per
// https://github.com/grpc/grpc/blob/master/doc/PROTOCOL-HTTP2.md#requests.
#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub enum TimeoutUnit {
  Hours,
  Minutes,
  Seconds,
  Milliseconds,
  Microseconds,
  Nanoseconds,
}

impl TimeoutUnit {
  #[must_use]
  pub const fn as_char(&self) -> char {
    match self {
      Self::Hours => 'H',
      Self::Minutes => 'M',
      Self::Seconds => 'S',
      Self::Milliseconds => 'm',
      Self::Microseconds => 'u',
      Self::Nanoseconds => 'n',
    }
  }

  #[must_use]
  pub const fn from_char(c: char) -> Option<Self> {
    match c {
      'H' => Some(Self::Hours),
      'M' => Some(Self::Minutes),
      'S' => Some(Self::Seconds),
      'm' => Some(Self::Milliseconds),
      'u' => Some(Self::Microseconds),
      'n' => Some(Self::Nanoseconds),
      _ => None,
    }
  }

  // Microseconds per unit. Nanoseconds are sub-microsecond and handled separately.
  const fn micros_multiplier(self) -> Option<u64> {
    match self {
      Self::Hours => Some(3_600_000_000),
      Self::Minutes => Some(60_000_000),
      Self::Seconds => Some(1_000_000),
      Self::Milliseconds => Some(1_000),
      Self::Microseconds => Some(1),
      Self::Nanoseconds => None,
    }
  }
}

//
// Timeout
//

// A decoded grpc-timeout value. The value/unit pair is kept as-is rather than being collapsed
// into a duration so that rendering is an exact inverse of parsing.
#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub struct Timeout {
  value: u64,
  unit: TimeoutUnit,
}

impl Timeout {
  // Create a timeout. Values that do not fit in the wire format's 8 digits are rejected.
  #[must_use]
  pub const fn new(value: u64, unit: TimeoutUnit) -> Option<Self> {
    if value > MAX_TIMEOUT_VALUE {
      return None;
    }

    Some(Self { value, unit })
  }

  // Parse a grpc-timeout header value ("1*8DIGIT UNIT").
  #[must_use]
  pub fn parse(s: &str) -> Option<Self> {
    if s.len() < 2 || s.len() > 9 || !s.is_ascii() {
      return None;
    }

    let (digits, unit) = s.split_at(s.len() - 1);
    if !digits.bytes().all(|b| b.is_ascii_digit()) {
      return None;
    }

    Self::new(
      digits.parse().ok()?,
      TimeoutUnit::from_char(unit.chars().next()?)?,
    )
  }

  // Render the header value.
  #[must_use]
  pub fn format(&self) -> String {
    format!("{}{}", self.value, self.unit.as_char())
  }

  // Convert to microseconds. Sub-microsecond values round up, with a 1us floor for any non-zero
  // timeout so that a tiny deadline never becomes "no deadline".
  #[must_use]
  pub const fn to_micros(&self) -> u64 {
    match self.unit.micros_multiplier() {
      Some(multiplier) => self.value * multiplier,
      None => {
        if self.value == 0 {
          0
        } else {
          let micros = self.value.div_ceil(1_000);
          if micros == 0 { 1 } else { micros }
        }
      },
    }
  }

  #[must_use]
  pub fn as_duration(&self) -> Duration {
    Duration::microseconds(self.to_micros().try_into().unwrap_or(i64::MAX))
  }

  // Express a duration as a timeout, using the largest unit that renders it exactly, or rounding
  // up to the smallest unit that fits the 8 digit bound.
  #[must_use]
  pub fn from_duration(duration: Duration) -> Option<Self> {
    if duration.is_negative() {
      return None;
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let micros = {
      let whole = duration.whole_microseconds();
      let as_micros = whole as u64;
      // Round sub-microsecond remainders up.
      if i128::from(as_micros) * 1_000 < duration.whole_nanoseconds() {
        as_micros + 1
      } else {
        as_micros
      }
    };

    const EXACT_UNITS: [TimeoutUnit; 5] = [
      TimeoutUnit::Hours,
      TimeoutUnit::Minutes,
      TimeoutUnit::Seconds,
      TimeoutUnit::Milliseconds,
      TimeoutUnit::Microseconds,
    ];
    for unit in EXACT_UNITS {
      let multiplier = unit.micros_multiplier().unwrap();
      if micros % multiplier == 0 {
        if let Some(timeout) = Self::new(micros / multiplier, unit) {
          return Some(timeout);
        }
      }
    }

    // Nothing renders exactly within 8 digits. Round up to the smallest unit that fits.
    for unit in EXACT_UNITS.into_iter().rev() {
      let multiplier = unit.micros_multiplier().unwrap();
      if let Some(timeout) = Self::new(micros.div_ceil(multiplier), unit) {
        return Some(timeout);
      }
    }

    None
  }
}

impl std::fmt::Display for Timeout {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.format())
  }
}
