//! Blocking client for the Orion monitoring API.
//!
//! - Every call goes through an [`HttpTransport`], normally the retrying one.
//! - `/token` exchanges the static API key for a bearer token; the token is
//!   re-acquired once if an authenticated call answers 401.
//! - Payloads are decoded with `serde_path_to_error` so failures name the JSON path.

use chrono::NaiveDateTime;
use http::StatusCode;
use serde::de::DeserializeOwned;
use std::sync::{PoisonError, RwLock};

use crate::models::orion::{SensorId, SensorReading, TokenResponse, UserDevice};
use crate::transport::{GetRequest, HttpResponse, HttpTransport, TransportError};
use crate::utils::format_vendor_timestamp;

pub const DEFAULT_BASE_URL: &str = "https://api.oriondata.io/api";
pub const SENSOR_DATA_VERSION: &str = "1.3";

#[derive(Debug)]
pub enum ClientError {
    Transport(TransportError),
    Http { status: u16, message: String },
    Decode { path: String, message: String },
    Auth(String),
}

impl core::fmt::Display for ClientError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ClientError::Transport(e) => write!(f, "{}", e),
            ClientError::Http { status, message } => write!(f, "http {}: {}", status, message),
            ClientError::Decode { path, message } => write!(f, "malformed payload at `{}`: {}", path, message),
            ClientError::Auth(e) => write!(f, "auth error: {}", e),
        }
    }
}

impl std::error::Error for ClientError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ClientError::Transport(e) => Some(e),
            _ => None,
        }
    }
}

impl From<TransportError> for ClientError {
    fn from(value: TransportError) -> Self {
        ClientError::Transport(value)
    }
}

pub struct OrionClient<T> {
    transport: T,
    base_url: String,
    api_key: String,
    token: RwLock<String>,
}

impl<T: HttpTransport> OrionClient<T> {
    /// Build a client and acquire the first bearer token.
    pub fn connect(transport: T, base_url: &str, api_key: &str) -> Result<Self, ClientError> {
        let base_url = base_url.trim_end_matches('/').to_string();
        let token = acquire_token(&transport, &base_url, api_key)?;
        Ok(OrionClient {
            transport,
            base_url,
            api_key: api_key.to_string(),
            token: RwLock::new(token),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn current_token(&self) -> String {
        self.token.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn refresh_token(&self) -> Result<String, ClientError> {
        let fresh = acquire_token(&self.transport, &self.base_url, &self.api_key)?;
        *self.token.write().unwrap_or_else(PoisonError::into_inner) = fresh.clone();
        Ok(fresh)
    }

    fn get_json<R: DeserializeOwned>(&self, path: &str, query: &[(&str, String)]) -> Result<R, ClientError> {
        let url = self.url(path);
        let token = self.current_token();
        let res = self.transport.get(&GetRequest {
            url: &url,
            query,
            bearer: Some(&token),
        })?;

        // retry once on 401 after forcing a new token
        let res = if res.status == StatusCode::UNAUTHORIZED {
            let token = self.refresh_token()?;
            self.transport.get(&GetRequest {
                url: &url,
                query,
                bearer: Some(&token),
            })?
        } else {
            res
        };

        decode(ensure_success(res)?)
    }

    pub fn get_user_devices(&self) -> Result<Vec<UserDevice>, ClientError> {
        self.get_json("/UserDevices", &[])
    }

    /// One page of readings for `sensors` in `[start, end]`, starting at `offset`.
    /// An empty page marks the end of the window.
    pub fn get_sensor_data(
        &self,
        sensors: &[SensorId],
        start: NaiveDateTime,
        end: NaiveDateTime,
        offset: u64,
    ) -> Result<Vec<SensorReading>, ClientError> {
        let sensor_ids = sensors.iter().map(|s| s.0.to_string()).collect::<Vec<_>>().join(",");
        self.get_json(
            "/SensorData",
            &[
                ("version", SENSOR_DATA_VERSION.to_string()),
                ("startDate", format_vendor_timestamp(start)),
                ("endDate", format_vendor_timestamp(end)),
                ("offset", offset.to_string()),
                ("sensorIds", sensor_ids),
            ],
        )
    }
}

/// `GET /token?apiKey=...`. Any failure here is fatal for the run.
pub fn acquire_token<T: HttpTransport>(transport: &T, base_url: &str, api_key: &str) -> Result<String, ClientError> {
    let url = format!("{}/token", base_url.trim_end_matches('/'));
    let query = [("apiKey", api_key.to_string())];
    let res = transport
        .get(&GetRequest {
            url: &url,
            query: &query,
            bearer: None,
        })
        .map_err(|e| ClientError::Auth(e.to_string()))?;
    if !res.status.is_success() {
        return Err(ClientError::Auth(format!("http {}: {}", res.status.as_u16(), snippet(&res.body))));
    }
    let TokenResponse { token } = decode(res).map_err(|e| ClientError::Auth(e.to_string()))?;
    if token.trim().is_empty() {
        return Err(ClientError::Auth("token response carried an empty token".to_string()));
    }
    Ok(token)
}

fn ensure_success(res: HttpResponse) -> Result<HttpResponse, ClientError> {
    if res.status.is_success() {
        Ok(res)
    } else {
        Err(ClientError::Http {
            status: res.status.as_u16(),
            message: snippet(&res.body),
        })
    }
}

fn decode<R: DeserializeOwned>(res: HttpResponse) -> Result<R, ClientError> {
    let de = &mut serde_json::Deserializer::from_str(&res.body);
    serde_path_to_error::deserialize(de).map_err(|e| ClientError::Decode {
        path: e.path().to_string(),
        message: e.inner().to_string(),
    })
}

fn snippet(body: &str) -> String {
    const LIMIT: usize = 512;
    if body.is_empty() {
        return "<no body>".to_string();
    }
    match body.char_indices().nth(LIMIT) {
        Some((idx, _)) => format!("{}...", &body[..idx]),
        None => body.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::testing::{ScriptedTransport, response};
    use chrono::NaiveDate;

    const BASE: &str = "https://orion.invalid/api/";

    fn token_ok(token: &str) -> Result<HttpResponse, TransportError> {
        Ok(response(200, &format!(r#"{{"token":"{}"}}"#, token)))
    }

    #[test]
    fn token_is_requested_with_api_key() {
        let transport = ScriptedTransport::new(vec![token_ok("abc")]);
        let token = acquire_token(&transport, BASE, "k3y").unwrap();
        assert_eq!(token, "abc");

        let seen = transport.seen.lock().unwrap();
        assert_eq!(seen[0].0, "https://orion.invalid/api/token");
        assert_eq!(seen[0].1, vec![("apiKey".to_string(), "k3y".to_string())]);
        assert_eq!(seen[0].2, None);
    }

    #[test]
    fn token_failure_is_auth_error() {
        let transport = ScriptedTransport::new(vec![Ok(response(403, "forbidden"))]);
        match acquire_token(&transport, BASE, "bad") {
            Err(ClientError::Auth(msg)) => assert!(msg.contains("403")),
            other => panic!("unexpected: {:?}", other.map(|_| ())),
        }

        let transport = ScriptedTransport::new(vec![Ok(response(200, r#"{"nope":1}"#))]);
        assert!(matches!(acquire_token(&transport, BASE, "k"), Err(ClientError::Auth(_))));
    }

    #[test]
    fn sensor_data_query_uses_vendor_format() {
        let transport = ScriptedTransport::new(vec![
            token_ok("abc"),
            Ok(response(
                200,
                r#"[{"sensorId":101,"readingDate":"2026-02-01T00:10:00","sensorValue":1.5}]"#,
            )),
        ]);
        let client = OrionClient::connect(transport, BASE, "k").unwrap();
        let day = NaiveDate::from_ymd_opt(2026, 2, 1).unwrap();
        let rows = client
            .get_sensor_data(
                &[SensorId(101), SensorId(102)],
                day.and_hms_opt(0, 0, 0).unwrap(),
                day.and_hms_opt(12, 0, 0).unwrap(),
                50,
            )
            .unwrap();
        assert_eq!(rows.len(), 1);

        let seen = client.transport.seen.lock().unwrap();
        let (url, query, bearer) = &seen[1];
        assert_eq!(url, "https://orion.invalid/api/SensorData");
        assert_eq!(bearer.as_deref(), Some("abc"));
        let q = |k: &str| query.iter().find(|(n, _)| n == k).map(|(_, v)| v.clone());
        assert_eq!(q("version").as_deref(), Some("1.3"));
        assert_eq!(q("startDate").as_deref(), Some("2026-02-01T00:00:00"));
        assert_eq!(q("endDate").as_deref(), Some("2026-02-01T12:00:00"));
        assert_eq!(q("offset").as_deref(), Some("50"));
        assert_eq!(q("sensorIds").as_deref(), Some("101,102"));
    }

    #[test]
    fn reauthenticates_once_on_401() {
        let transport = ScriptedTransport::new(vec![
            token_ok("old"),
            Ok(response(401, "expired")),
            token_ok("new"),
            Ok(response(200, "[]")),
        ]);
        let client = OrionClient::connect(transport, BASE, "k").unwrap();
        let devices = client.get_user_devices().unwrap();
        assert!(devices.is_empty());
        assert_eq!(client.current_token(), "new");

        let seen = client.transport.seen.lock().unwrap();
        assert_eq!(seen[3].2.as_deref(), Some("new"));
    }

    #[test]
    fn malformed_payload_names_the_path() {
        let transport = ScriptedTransport::new(vec![
            token_ok("abc"),
            Ok(response(200, r#"[{"sensorId":101,"readingDate":"not a date","sensorValue":1.0}]"#)),
        ]);
        let client = OrionClient::connect(transport, BASE, "k").unwrap();
        let day = NaiveDate::from_ymd_opt(2026, 2, 1).unwrap().and_hms_opt(0, 0, 0).unwrap();
        match client.get_sensor_data(&[SensorId(101)], day, day, 0) {
            Err(ClientError::Decode { path, .. }) => assert_eq!(path, "[0].readingDate"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn non_success_status_is_http_error() {
        let transport = ScriptedTransport::new(vec![token_ok("abc"), Ok(response(400, "bad sensorIds"))]);
        let client = OrionClient::connect(transport, BASE, "k").unwrap();
        match client.get_user_devices() {
            Err(ClientError::Http { status, message }) => {
                assert_eq!(status, 400);
                assert_eq!(message, "bad sensorIds");
            }
            other => panic!("unexpected: {:?}", other.map(|d| d.len())),
        }
    }
}
