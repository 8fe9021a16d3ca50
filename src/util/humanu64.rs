//! Byte counts that people can type
// (c) 2024 Ross Younger

use std::{fmt, ops::Deref, str::FromStr};

use anyhow::Context as _;
use human_repr::HumanCount as _;
use humanize_rs::bytes::Bytes;
use serde::{de, Serialize};

/// A byte count, as used for chunk sizes.
///
/// In configuration files, the environment and on the command line it may be a plain integer
/// or carry an SI suffix understood by `humanize_rs`: `256k` is 256,000 bytes.
/// It always serializes as a plain integer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(into = "u64")]
pub struct HumanU64(pub u64);

impl HumanU64 {
    #[must_use]
    #[allow(missing_docs)]
    pub fn new(value: u64) -> Self {
        Self(value)
    }
}

impl Deref for HumanU64 {
    type Target = u64;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<HumanU64> for u64 {
    fn from(value: HumanU64) -> Self {
        value.0
    }
}

impl FromStr for HumanU64 {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::new(
            Bytes::from_str(s)
                .with_context(|| "parsing bytes string")?
                .size(),
        ))
    }
}

impl From<u64> for HumanU64 {
    fn from(value: u64) -> Self {
        Self::new(value)
    }
}

impl<'de> serde::Deserialize<'de> for HumanU64 {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        deserializer.deserialize_any(IntOrString)
    }
}

/// Accepts either a bare integer or a string that `humanize_rs` understands
struct IntOrString;

impl de::Visitor<'_> for IntOrString {
    type Value = HumanU64;

    fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str("a byte count, either an integer or a string such as \"256k\"")
    }

    fn visit_str<E: de::Error>(self, value: &str) -> Result<HumanU64, E> {
        HumanU64::from_str(value).map_err(|e| de::Error::custom(format!("{e:#}")))
    }

    fn visit_u64<E: de::Error>(self, value: u64) -> Result<HumanU64, E> {
        Ok(HumanU64(value))
    }

    fn visit_i64<E: de::Error>(self, value: i64) -> Result<HumanU64, E> {
        u64::try_from(value)
            .map(HumanU64)
            .map_err(|_| de::Error::invalid_value(de::Unexpected::Signed(value), &self))
    }
}

impl std::fmt::Display for HumanU64 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.human_count_bytes())
    }
}
