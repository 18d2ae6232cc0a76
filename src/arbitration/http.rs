//! Blocking HTTP transport for the remote arbiter.

use std::time::Duration;

use reqwest::blocking::{Client, RequestBuilder};
use reqwest::header::AUTHORIZATION;
use serde::{Deserialize, Serialize};

use super::{ArbitrationCall, RemoteArbiter, RemoteError, RemoteJudgment};
use crate::core::config::ArbitrationConfig;
use crate::core::errors::{CfnError, Result};
use crate::core::evidence::CategoryScore;

#[derive(Debug, Serialize)]
struct WireRequest<'a> {
    unit_id: &'a str,
    media_ref: Option<&'a str>,
    summary: &'a str,
    deadline_ms: u64,
}

/// Response body: parallel `categories` / `confidences` arrays.
#[derive(Debug, Deserialize)]
struct WireResponse {
    #[serde(default)]
    categories: Vec<String>,
    #[serde(default)]
    confidences: Vec<f64>,
    #[serde(default)]
    rationale: String,
    #[serde(default)]
    latency_ms: Option<u64>,
}

/// JSON-over-HTTP arbiter.
#[derive(Debug, Clone)]
pub struct HttpArbiter {
    endpoint: String,
    http: Client,
    auth_token: Option<String>,
}

impl HttpArbiter {
    /// Client for `endpoint`. The per-call timeout comes from each
    /// [`ArbitrationCall`]; `connect_timeout` bounds connection setup.
    pub fn new(
        endpoint: impl Into<String>,
        auth_token: Option<String>,
        connect_timeout: Duration,
    ) -> Result<Self> {
        let http = Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| CfnError::Runtime {
                details: format!("failed to build arbitration HTTP client: {e}"),
            })?;
        Ok(Self {
            endpoint: endpoint.into(),
            http,
            auth_token,
        })
    }

    /// Build from config, reading the bearer token from the env var named by
    /// `api_key_env`. Returns `Ok(None)` when no endpoint is configured.
    pub fn from_config(config: &ArbitrationConfig) -> Result<Option<Self>> {
        let Some(endpoint) = config.endpoint.as_deref() else {
            return Ok(None);
        };
        let token = std::env::var(&config.api_key_env)
            .ok()
            .filter(|t| !t.trim().is_empty());
        if token.is_none() {
            log::info!(
                "no arbitration token in ${}; calling {endpoint} unauthenticated",
                config.api_key_env
            );
        }
        Self::new(endpoint, token, config.attempt_timeout()).map(Some)
    }

    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        if let Some(token) = &self.auth_token {
            request.header(AUTHORIZATION, format!("Bearer {token}"))
        } else {
            request
        }
    }
}

impl RemoteArbiter for HttpArbiter {
    fn judge(&self, call: &ArbitrationCall) -> std::result::Result<RemoteJudgment, RemoteError> {
        let body = WireRequest {
            unit_id: &call.unit_id,
            media_ref: call.media_ref.as_deref(),
            summary: &call.summary,
            deadline_ms: u64::try_from(call.timeout.as_millis()).unwrap_or(u64::MAX),
        };
        let request = self.http.post(&self.endpoint).timeout(call.timeout).json(&body);
        let response = self.authorized(request).send().map_err(classify)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(RemoteError::Transport(format!(
                "unexpected status {status}: {}",
                body.chars().take(200).collect::<String>()
            )));
        }
        let wire: WireResponse = response.json().map_err(|e| {
            if e.is_timeout() {
                RemoteError::Timeout
            } else {
                RemoteError::Malformed(e.to_string())
            }
        })?;
        into_judgment(wire)
    }
}

fn classify(err: reqwest::Error) -> RemoteError {
    if err.is_timeout() {
        RemoteError::Timeout
    } else {
        RemoteError::Transport(err.to_string())
    }
}

fn into_judgment(wire: WireResponse) -> std::result::Result<RemoteJudgment, RemoteError> {
    if wire.categories.len() != wire.confidences.len() {
        return Err(RemoteError::Malformed(format!(
            "{} categories but {} confidences",
            wire.categories.len(),
            wire.confidences.len()
        )));
    }
    if let Some(latency) = wire.latency_ms {
        log::trace!("arbiter reported {latency} ms model latency");
    }
    let categories = wire
        .categories
        .into_iter()
        .zip(wire.confidences)
        .map(|(c, conf)| CategoryScore::new(c.trim().to_lowercase(), conf))
        .collect();
    Ok(RemoteJudgment {
        categories,
        rationale: wire.rationale,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wire(raw: &str) -> WireResponse {
        serde_json::from_str(raw).unwrap()
    }

    #[test]
    fn parallel_arrays_zip_into_scores() {
        let j = into_judgment(wire(
            r#"{"categories":["Weapon","violence"],"confidences":[0.82,0.4],"rationale":"knife in hand","latency_ms":311}"#,
        ))
        .unwrap();
        assert_eq!(j.categories[0], CategoryScore::new("weapon", 0.82));
        assert_eq!(j.categories.len(), 2);
        assert_eq!(j.rationale, "knife in hand");
    }

    #[test]
    fn mismatched_arrays_are_malformed() {
        let err = into_judgment(wire(r#"{"categories":["weapon"],"confidences":[]}"#)).unwrap_err();
        assert!(matches!(err, RemoteError::Malformed(_)));
    }

    #[test]
    fn empty_response_is_a_clean_judgment() {
        let j = into_judgment(wire("{}")).unwrap();
        assert!(j.categories.is_empty());
    }

    #[test]
    fn no_endpoint_means_no_arbiter() {
        let config = ArbitrationConfig::default();
        assert!(HttpArbiter::from_config(&config).unwrap().is_none());
    }

    #[test]
    fn unreachable_endpoint_is_a_transport_failure() {
        let arbiter =
            HttpArbiter::new("http://127.0.0.1:9/judge", None, Duration::from_millis(200)).unwrap();
        let err = arbiter
            .judge(&ArbitrationCall {
                unit_id: "u".to_string(),
                media_ref: None,
                summary: "s".to_string(),
                timeout: Duration::from_millis(300),
            })
            .unwrap_err();
        assert!(matches!(err, RemoteError::Transport(_) | RemoteError::Timeout));
    }
}
