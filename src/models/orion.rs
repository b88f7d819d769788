//! Payloads of the Orion monitoring API.
//!
//! Only the fields the ingester uses are modelled; unknown fields are ignored.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::utils::{de_opt_vendor_timestamp, de_vendor_timestamp};

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(pub i64);

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SensorId(pub i64);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for SensorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Channel number as sent by the vendor, which uses `1`, `1.0` and `"1"`.
/// Any other JSON shape decodes to a channel without a number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Channel(pub String);

impl Channel {
    pub fn number(&self) -> Option<u32> {
        self.0.trim().parse().ok()
    }
}

impl<'de> Deserialize<'de> for Channel {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::de::{IgnoredAny, MapAccess, SeqAccess};

        struct V;
        impl<'de> serde::de::Visitor<'de> for V {
            type Value = Channel;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, "a channel number")
            }

            fn visit_i64<E: serde::de::Error>(self, value: i64) -> Result<Channel, E> {
                Ok(Channel(value.to_string()))
            }

            fn visit_u64<E: serde::de::Error>(self, value: u64) -> Result<Channel, E> {
                Ok(Channel(value.to_string()))
            }

            fn visit_f64<E: serde::de::Error>(self, value: f64) -> Result<Channel, E> {
                if value.fract() == 0.0 && value.abs() < 1e15 {
                    Ok(Channel((value as i64).to_string()))
                } else {
                    Ok(Channel(value.to_string()))
                }
            }

            fn visit_str<E: serde::de::Error>(self, value: &str) -> Result<Channel, E> {
                Ok(Channel(value.to_string()))
            }

            fn visit_bool<E: serde::de::Error>(self, value: bool) -> Result<Channel, E> {
                Ok(Channel(value.to_string()))
            }

            fn visit_unit<E: serde::de::Error>(self) -> Result<Channel, E> {
                Ok(Channel(String::new()))
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Channel, A::Error> {
                while seq.next_element::<IgnoredAny>()?.is_some() {}
                Ok(Channel(String::new()))
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Channel, A::Error> {
                while map.next_entry::<IgnoredAny, IgnoredAny>()?.is_some() {}
                Ok(Channel(String::new()))
            }
        }

        deserializer.deserialize_any(V)
    }
}

/// Connectivity as reported on `/UserDevices`. Comparison is case-insensitive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceStatus {
    Online,
    Offline,
    Unknown(String),
}

impl DeviceStatus {
    /// A device listed without a status counts as `unknown`.
    pub fn reported(raw: Option<&str>) -> Self {
        raw.map_or(DeviceStatus::Unknown("unknown".to_string()), DeviceStatus::parse)
    }

    pub fn parse(raw: &str) -> Self {
        let lower = raw.trim().to_lowercase();
        match lower.as_str() {
            "online" => DeviceStatus::Online,
            "offline" => DeviceStatus::Offline,
            _ => DeviceStatus::Unknown(lower),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            DeviceStatus::Online => "online",
            DeviceStatus::Offline => "offline",
            DeviceStatus::Unknown(s) => s,
        }
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub token: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserDevice {
    pub device_id: DeviceId,
    #[serde(default)]
    pub device_name: Option<String>,
    #[serde(default)]
    pub serial_number: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
    #[serde(default, deserialize_with = "de_opt_vendor_timestamp")]
    pub last_upload: Option<NaiveDateTime>,
    #[serde(default)]
    pub battery_percentage: Option<f64>,
    #[serde(default)]
    pub sensors: Vec<DeviceSensor>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSensor {
    pub sensor_id: SensorId,
    #[serde(default)]
    pub channel_number: Option<Channel>,
    #[serde(default)]
    pub sensor_type: Option<String>,
    #[serde(default)]
    pub custom_name: Option<String>,
    #[serde(default)]
    pub uom: Option<String>,
}

/// One row of `/SensorData`. A null `sensorValue` is kept so the caller can count it.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorReading {
    pub sensor_id: SensorId,
    #[serde(deserialize_with = "de_vendor_timestamp")]
    pub reading_date: NaiveDateTime,
    #[serde(default)]
    pub sensor_value: Option<f64>,
}
