//! Canonical timestamp encoding for the exchange format.
//!
//! Timestamps are UTC RFC 3339 with millisecond precision and a `Z` suffix
//! (`2026-03-01T09:30:00.000Z`). Two clones serializing the same instant must
//! produce identical bytes, so the precision is fixed rather than whatever
//! the clock happens to carry. Input is tolerant: any RFC 3339 offset is
//! accepted and normalized to UTC.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serializer};

/// Format a timestamp in the canonical exchange form.
#[must_use]
pub fn encode(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse a canonical (or any RFC 3339) timestamp.
///
/// # Errors
/// Returns a chrono parse error for non-RFC 3339 input.
pub fn decode(s: &str) -> chrono::ParseResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s).map(|dt| dt.with_timezone(&Utc))
}

/// Serde adapter for required timestamp fields.
pub mod ts {
    use super::{DateTime, Deserialize, Deserializer, Serializer, Utc};

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&super::encode(ts))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(de)?;
        super::decode(&raw).map_err(serde::de::Error::custom)
    }
}

/// Serde adapter for optional timestamp fields.
pub mod opt_ts {
    use super::{DateTime, Deserialize, Deserializer, Serializer, Utc};

    pub fn serialize<S: Serializer>(
        ts: &Option<DateTime<Utc>>,
        ser: S,
    ) -> Result<S::Ok, S::Error> {
        match ts {
            Some(ts) => ser.serialize_str(&super::encode(ts)),
            None => ser.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        de: D,
    ) -> Result<Option<DateTime<Utc>>, D::Error> {
        let raw = Option::<String>::deserialize(de)?;
        raw.map(|s| super::decode(&s).map_err(serde::de::Error::custom))
            .transpose()
    }
}
