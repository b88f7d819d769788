use chrono::{DateTime, NaiveDateTime};
use serde::{Deserialize, Deserializer};

/// The vendor API rejects timestamps that carry an offset; everything is naive UTC.
pub const VENDOR_TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

pub fn format_vendor_timestamp(ts: NaiveDateTime) -> String {
    ts.format(VENDOR_TIMESTAMP_FORMAT).to_string()
}

/// Parse a timestamp as returned by the vendor.
///
/// Accepts `2026-02-01T00:00:00`, fractional seconds, a space instead of `T`,
/// and RFC 3339 values with `Z` or an explicit offset (converted to UTC).
pub fn parse_vendor_timestamp(raw: &str) -> Result<NaiveDateTime, String> {
    let s = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.naive_utc());
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(ts) = NaiveDateTime::parse_from_str(s, fmt) {
            return Ok(ts);
        }
    }
    Err(format!("unrecognised timestamp {:?}", raw))
}

pub fn de_vendor_timestamp<'de, D>(deserializer: D) -> Result<NaiveDateTime, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_vendor_timestamp(&raw).map_err(serde::de::Error::custom)
}

/// Like [`de_vendor_timestamp`] but maps `null` and empty strings to `None`.
pub fn de_opt_vendor_timestamp<'de, D>(deserializer: D) -> Result<Option<NaiveDateTime>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<String>::deserialize(deserializer)? {
        Some(raw) if !raw.trim().is_empty() => parse_vendor_timestamp(&raw)
            .map(Some)
            .map_err(serde::de::Error::custom),
        _ => Ok(None),
    }
}
