//! On-demand session-status polling against a worker's own API.
//!
//! Derived state only: any failure along the way (unreachable worker,
//! missing credential, malformed body) degrades to `Disconnected` rather
//! than erroring, since connectivity is exactly what is being probed.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::debug;

use wahub_common::{
    BackendAdapter, HubError, Instance, InstanceStatus, Result, SessionStatus,
};

const CONNECTED: &str = "CONNECTED";

pub struct SessionPoller {
    http: reqwest::Client,
    adapter: Arc<dyn BackendAdapter>,
}

impl SessionPoller {
    pub fn new(adapter: Arc<dyn BackendAdapter>, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| HubError::Config(format!("failed to build http client: {e}")))?;
        Ok(Self { http, adapter })
    }

    /// Reports `Connected` as soon as any session on the worker is in the
    /// CONNECTED state; remaining sessions are not queried.
    pub async fn session_status(&self, instance: &Instance) -> SessionStatus {
        if instance.status != InstanceStatus::Running {
            return SessionStatus::Disconnected;
        }
        let Some(base) = self.adapter.endpoint(instance) else {
            return SessionStatus::Disconnected;
        };
        let Some(api_key) = instance.worker_api_key() else {
            debug!(instance = %instance.id, "no worker credential, reporting disconnected");
            return SessionStatus::Disconnected;
        };

        let sessions = match self.list_sessions(&base, api_key).await {
            Ok(sessions) => sessions,
            Err(e) => {
                debug!(instance = %instance.id, "session listing failed: {e}");
                return SessionStatus::Disconnected;
            }
        };

        for session_id in sessions {
            match self.fetch_state(&base, api_key, &session_id).await {
                Ok(state) if state.eq_ignore_ascii_case(CONNECTED) => {
                    return SessionStatus::Connected;
                }
                Ok(_) => {}
                Err(e) => {
                    debug!(
                        instance = %instance.id,
                        session = %session_id,
                        "session status probe failed: {e}"
                    );
                }
            }
        }
        SessionStatus::Disconnected
    }

    async fn list_sessions(&self, base: &str, api_key: &str) -> Result<Vec<String>> {
        let body: Value = self
            .http
            .get(format!("{base}/api/sessions"))
            .header("x-api-key", api_key)
            .send()
            .await
            .map_err(|e| HubError::Poll(e.to_string()))?
            .error_for_status()
            .map_err(|e| HubError::Poll(e.to_string()))?
            .json()
            .await
            .map_err(|e| HubError::Poll(e.to_string()))?;
        Ok(extract_session_ids(&body))
    }

    async fn fetch_state(&self, base: &str, api_key: &str, session_id: &str) -> Result<String> {
        let body: Value = self
            .http
            .get(format!("{base}/session/status/{session_id}"))
            .header("x-api-key", api_key)
            .send()
            .await
            .map_err(|e| HubError::Poll(e.to_string()))?
            .error_for_status()
            .map_err(|e| HubError::Poll(e.to_string()))?
            .json()
            .await
            .map_err(|e| HubError::Poll(e.to_string()))?;
        extract_state(&body)
            .ok_or_else(|| HubError::Poll("status response carries no state field".to_string()))
    }
}

/// Pulls session identifiers out of the listing body. Workers respond
/// either with a bare array or with the array nested under `sessions` or
/// `response`; entries are plain strings or objects keyed by `id`/`session`.
fn extract_session_ids(body: &Value) -> Vec<String> {
    let array = match body {
        Value::Array(items) => items,
        Value::Object(map) => match map.get("sessions").or_else(|| map.get("response")) {
            Some(Value::Array(items)) => items,
            _ => return Vec::new(),
        },
        _ => return Vec::new(),
    };
    array
        .iter()
        .filter_map(|entry| match entry {
            Value::String(id) => Some(id.clone()),
            Value::Object(map) => map
                .get("id")
                .or_else(|| map.get("session"))
                .and_then(Value::as_str)
                .map(str::to_string),
            _ => None,
        })
        .collect()
}

/// Workers report the session state under either `state` or `status`.
fn extract_state(body: &Value) -> Option<String> {
    body.get("state")
        .or_else(|| body.get("status"))
        .and_then(Value::as_str)
        .map(str::to_string)
}
