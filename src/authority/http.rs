//! HTTP authority client.

use std::net::Ipv4Addr;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use super::{
    Authority, AuthorityError, ReportSummary, Session, SessionTimeUpdate, SystemMetrics,
    UsageUpdate,
};
use crate::config::AuthorityConfig;

/// Response envelope used by every authority route.
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[serde(default)]
    success: bool,
    data: Option<T>,
    error: Option<String>,
}

impl<T> Envelope<T> {
    fn into_data(self) -> Result<Option<T>, AuthorityError> {
        if self.success {
            Ok(self.data)
        } else {
            Err(AuthorityError::Rejected(
                self.error.unwrap_or_else(|| "unspecified error".to_string()),
            ))
        }
    }
}

/// Ceiling on the delay between retries.
const MAX_BACKOFF: Duration = Duration::from_secs(5);

/// Exponential backoff before retry `attempt` (1-based): 100ms, 200ms, 400ms...
fn backoff(attempt: u32) -> Duration {
    2u64.checked_pow(attempt.saturating_sub(1))
        .and_then(|factor| factor.checked_mul(100))
        .map(Duration::from_millis)
        .map_or(MAX_BACKOFF, |delay| delay.min(MAX_BACKOFF))
}

#[derive(Debug, Deserialize)]
struct SessionList {
    #[serde(default)]
    sessions: Vec<Session>,
}

#[derive(Debug, Deserialize)]
struct BanStatus {
    blocked: Option<bool>,
}

/// [`Authority`] over HTTP.
pub struct HttpAuthority {
    base_url: String,
    client: Client,
    timeout: Duration,
    retries: u32,
}

impl std::fmt::Debug for HttpAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpAuthority")
            .field("base_url", &self.base_url)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl HttpAuthority {
    /// Build a client for `{url}/api/v1`, tagging every request with the contract id.
    pub fn new(config: &AuthorityConfig, contract_id: &str) -> Result<Self, AuthorityError> {
        let mut headers = HeaderMap::new();
        let value = HeaderValue::from_str(contract_id)
            .map_err(|e| AuthorityError::Http(format!("invalid contract id header: {}", e)))?;
        headers.insert("x-contract-id", value);

        let client = Client::builder()
            .timeout(config.timeout)
            .default_headers(headers)
            .build()
            .map_err(|e| AuthorityError::Http(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            base_url: format!("{}/api/v1", config.url.trim_end_matches('/')),
            client,
            timeout: config.timeout,
            retries: config.retries,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn map_transport(&self, e: reqwest::Error) -> AuthorityError {
        if e.is_timeout() {
            AuthorityError::Timeout(self.timeout)
        } else if e.is_connect() {
            AuthorityError::Http(format!("connection failed: {}", e))
        } else {
            AuthorityError::Http(format!("request failed: {}", e))
        }
    }

    /// GET with retry and exponential backoff on 429, 5xx and transport errors.
    async fn get<R: DeserializeOwned>(&self, path: &str) -> Result<Envelope<R>, AuthorityError> {
        let url = self.url(path);
        let mut last_error = None;

        for attempt in 0..=self.retries {
            if attempt > 0 {
                tokio::time::sleep(backoff(attempt)).await;
                debug!(path, attempt, "retrying authority request");
            }

            match self.client.get(&url).send().await {
                Ok(response) => {
                    let status = response.status();
                    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                        warn!(path, status = %status, "authority request failed, will retry");
                        last_error = Some(AuthorityError::Http(format!("server error: {}", status)));
                        continue;
                    }
                    return decode(status, response).await;
                }
                Err(e) => {
                    last_error = Some(self.map_transport(e));
                    continue;
                }
            }
        }

        Err(last_error.unwrap_or_else(|| AuthorityError::Http("unknown error".into())))
    }

    /// Single-attempt write.
    async fn send<B: Serialize + ?Sized, R: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: &B,
    ) -> Result<Envelope<R>, AuthorityError> {
        let response = self
            .client
            .request(method, self.url(path))
            .json(body)
            .send()
            .await
            .map_err(|e| self.map_transport(e))?;

        decode(response.status(), response).await
    }
}

/// Decode an envelope. Error statuses still carry the envelope when the
/// authority produced one.
async fn decode<R: DeserializeOwned>(
    status: StatusCode,
    response: reqwest::Response,
) -> Result<Envelope<R>, AuthorityError> {
    let body = response
        .bytes()
        .await
        .map_err(|e| AuthorityError::Http(format!("failed to read response: {}", e)))?;

    match serde_json::from_slice::<Envelope<R>>(&body) {
        Ok(envelope) => {
            if !status.is_success() && envelope.success {
                return Err(AuthorityError::Http(format!("unexpected status {}", status)));
            }
            Ok(envelope)
        }
        Err(_) if !status.is_success() => {
            Err(AuthorityError::Http(format!("authority returned status {}", status)))
        }
        Err(e) => Err(AuthorityError::Decode(e.to_string())),
    }
}

#[async_trait]
impl Authority for HttpAuthority {
    async fn list_active_sessions(&self, contract_id: &str) -> Result<Vec<Session>, AuthorityError> {
        let path = format!("/portal/sessions/active?contractId={}", contract_id);
        let data: Option<SessionList> = self.get(&path).await?.into_data()?;
        Ok(data.map(|d| d.sessions).unwrap_or_default())
    }

    async fn list_expired_sessions(
        &self,
        contract_id: &str,
    ) -> Result<Vec<Session>, AuthorityError> {
        let path = format!("/portal/sessions/expired?contractId={}", contract_id);
        let data: Option<SessionList> = self.get(&path).await?.into_data()?;
        Ok(data.map(|d| d.sessions).unwrap_or_default())
    }

    async fn report_time_updates(
        &self,
        updates: &[SessionTimeUpdate],
    ) -> Result<ReportSummary, AuthorityError> {
        let body = json!({ "sessionUpdates": updates });
        let data: Option<ReportSummary> = self
            .send(Method::PUT, "/portal/sessions/time", &body)
            .await?
            .into_data()?;
        Ok(data.unwrap_or(ReportSummary {
            success_count: updates.len(),
            error_count: 0,
        }))
    }

    async fn report_expired(&self, session_ids: &[String]) -> Result<(), AuthorityError> {
        let body = json!({ "sessionIds": session_ids });
        self.send::<_, serde_json::Value>(Method::PUT, "/portal/sessions/expire", &body)
            .await?
            .into_data()
            .map(|_| ())
    }

    async fn report_pause(
        &self,
        session_id: &str,
        user_ip: &str,
        contract_id: &str,
    ) -> Result<(), AuthorityError> {
        let body = json!({
            "sessionId": session_id,
            "userIP": user_ip,
            "contractId": contract_id,
        });
        self.send::<_, serde_json::Value>(Method::POST, "/portal/sessions/pause", &body)
            .await?
            .into_data()
            .map(|_| ())
    }

    async fn report_usage(&self, updates: &[UsageUpdate]) -> Result<ReportSummary, AuthorityError> {
        let body = json!({ "sessionUpdates": updates });
        let data: Option<ReportSummary> = self
            .send(Method::PUT, "/portal/sessions/update-data-usage", &body)
            .await?
            .into_data()?;
        Ok(data.unwrap_or(ReportSummary {
            success_count: updates.len(),
            error_count: 0,
        }))
    }

    async fn report_system_metrics(
        &self,
        contract_id: &str,
        metrics: &SystemMetrics,
    ) -> Result<(), AuthorityError> {
        let body = json!({ "contractId": contract_id, "systemMetrics": metrics });
        self.send::<_, serde_json::Value>(
            Method::PUT,
            "/portal/sessions/update-system-metrics",
            &body,
        )
        .await?
        .into_data()
        .map(|_| ())
    }

    async fn check_banned(&self, ip: Ipv4Addr) -> Result<bool, AuthorityError> {
        let envelope: Envelope<BanStatus> =
            self.get(&format!("/portal/blocked/check/{}", ip)).await?;
        // Older authorities answer success=false for banned IPs without a body
        Ok(envelope
            .data
            .and_then(|d| d.blocked)
            .unwrap_or(!envelope.success))
    }

    async fn activate_temp_access(&self, ip: Ipv4Addr) -> Result<(), AuthorityError> {
        let body = json!({ "userIP": ip.to_string() });
        self.send::<_, serde_json::Value>(Method::POST, "/portal/temp-access/activate", &body)
            .await?
            .into_data()
            .map(|_| ())
    }

    async fn deactivate_temp_access(&self, ip: Ipv4Addr) -> Result<(), AuthorityError> {
        let body = json!({ "userIP": ip.to_string() });
        self.send::<_, serde_json::Value>(Method::POST, "/portal/temp-access/deactivate", &body)
            .await?
            .into_data()
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url() {
        let config = AuthorityConfig {
            url: "http://main.local:3005/".to_string(),
            ..Default::default()
        };
        let authority = HttpAuthority::new(&config, "C1").unwrap();
        assert_eq!(authority.base_url(), "http://main.local:3005/api/v1");
    }

    #[test]
    fn test_backoff_doubles_then_caps() {
        assert_eq!(backoff(1), Duration::from_millis(100));
        assert_eq!(backoff(2), Duration::from_millis(200));
        assert_eq!(backoff(4), Duration::from_millis(800));
        assert_eq!(backoff(10), MAX_BACKOFF);
        assert_eq!(backoff(64), MAX_BACKOFF);
        assert_eq!(backoff(u32::MAX), MAX_BACKOFF);
    }

    #[test]
    fn test_envelope_rejected() {
        let envelope: Envelope<SessionList> =
            serde_json::from_str(r#"{"success": false, "error": "unknown contract"}"#).unwrap();
        let err = envelope.into_data().unwrap_err();
        assert!(matches!(err, AuthorityError::Rejected(ref m) if m == "unknown contract"));
    }

    #[test]
    fn test_envelope_sessions() {
        let envelope: Envelope<SessionList> = serde_json::from_str(
            r#"{"success": true, "data": {"sessions": [{"sessionId": "S1", "userIP": "10.0.0.5", "remainingTimeSecs": 60}]}}"#,
        )
        .unwrap();
        let sessions = envelope.into_data().unwrap().unwrap().sessions;
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].remaining_time_secs, 60);
    }

    #[tokio::test]
    async fn test_unreachable_authority() {
        let config = AuthorityConfig {
            url: "http://127.0.0.1:1".to_string(),
            timeout: Duration::from_secs(2),
            retries: 0,
        };
        let authority = HttpAuthority::new(&config, "C1").unwrap();
        assert!(authority.list_active_sessions("C1").await.is_err());
    }
}
