//! Time-ordered 64-bit identifiers.
//!
//! Every channel, message and user carries a [`Snowflake`]. The high bits hold
//! the milliseconds elapsed since the service epoch, the low 16 bits are
//! payload. Identifiers stay `u64` end to end: JSON integers are decoded
//! through serde_json's integer path, decimal strings are accepted, and
//! floating-point numbers are rejected instead of being rounded.

mod epoch;

pub use epoch::{Epoch, SetupDocument, time_of};

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::num::ParseIntError;
use std::str::FromStr;

/// Number of low bits that do not encode time.
pub const PAYLOAD_BITS: u32 = 16;

/// A time-ordered 64-bit identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Snowflake(u64);

impl Snowflake {
    /// Lower sentinel: no lower bound.
    pub const MIN: Snowflake = Snowflake(0);

    /// Upper sentinel: no upper bound. Server identifiers are signed 64-bit,
    /// so this is the largest value the server can hold.
    pub const MAX: Snowflake = Snowflake(i64::MAX as u64);

    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }

    /// Milliseconds since the service epoch.
    pub const fn elapsed_millis(self) -> u64 {
        self.0 >> PAYLOAD_BITS
    }

    /// The non-temporal low bits.
    pub const fn payload(self) -> u16 {
        (self.0 & 0xFFFF) as u16
    }

    /// The identifier immediately below this one, or `None` at zero.
    pub const fn checked_pred(self) -> Option<Self> {
        match self.0.checked_sub(1) {
            Some(raw) => Some(Self(raw)),
            None => None,
        }
    }

    /// The identifier immediately above this one, or `None` at `u64::MAX`.
    pub const fn checked_succ(self) -> Option<Self> {
        match self.0.checked_add(1) {
            Some(raw) => Some(Self(raw)),
            None => None,
        }
    }
}

impl From<u64> for Snowflake {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

impl From<Snowflake> for u64 {
    fn from(id: Snowflake) -> Self {
        id.0
    }
}

impl fmt::Display for Snowflake {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl FromStr for Snowflake {
    type Err = ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse::<u64>().map(Self)
    }
}

impl Serialize for Snowflake {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(self.0)
    }
}

impl<'de> Deserialize<'de> for Snowflake {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(SnowflakeVisitor)
    }
}

struct SnowflakeVisitor;

impl Visitor<'_> for SnowflakeVisitor {
    type Value = Snowflake;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a non-negative 64-bit integer or its decimal string")
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
        Ok(Snowflake(v))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
        u64::try_from(v)
            .map(Snowflake)
            .map_err(|_| E::invalid_value(de::Unexpected::Signed(v), &self))
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> Result<Self::Value, E> {
        Err(E::invalid_type(de::Unexpected::Float(v), &self))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
        v.parse()
            .map_err(|_| E::invalid_value(de::Unexpected::Str(v), &self))
    }
}
