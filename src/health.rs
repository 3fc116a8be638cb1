use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;

use crate::store::Store;

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub checks: HealthChecks,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ok,
    Unhealthy,
}

#[derive(Debug, Serialize)]
pub struct HealthChecks {
    pub store: CheckResult,
}

#[derive(Debug, Serialize)]
pub struct CheckResult {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl CheckResult {
    fn healthy() -> Self {
        Self {
            ok: true,
            detail: None,
        }
    }

    fn unhealthy(detail: impl Into<String>) -> Self {
        Self {
            ok: false,
            detail: Some(detail.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Checks
// ---------------------------------------------------------------------------

async fn check_store(store: &dyn Store) -> CheckResult {
    match store.ping().await {
        Ok(()) => CheckResult::healthy(),
        Err(e) => CheckResult::unhealthy(format!("PING failed: {e}")),
    }
}

/// Probe every dependency and summarise.  The store is the only one, and
/// without it every component is running degraded.
pub async fn check(store: &dyn Store) -> HealthResponse {
    let checks = HealthChecks {
        store: check_store(store).await,
    };
    let status = if checks.store.ok {
        HealthStatus::Ok
    } else {
        HealthStatus::Unhealthy
    };
    HealthResponse { status, checks }
}

/// Render a [`HealthResponse`]: 200 when ok, 503 otherwise.
pub fn respond(body: HealthResponse) -> impl IntoResponse {
    let http_status = match body.status {
        HealthStatus::Ok => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (http_status, Json(body))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::store::memory::MemoryStore;
    use crate::store::testing::FailingStore;

    #[tokio::test]
    async fn reachable_store_is_ok() {
        let body = check(&MemoryStore::new()).await;
        assert_eq!(body.status, HealthStatus::Ok);
        assert_eq!(
            serde_json::to_value(&body).unwrap(),
            json!({"status": "ok", "checks": {"store": {"ok": true}}})
        );
    }

    #[tokio::test]
    async fn unreachable_store_is_unhealthy() {
        let body = check(&FailingStore).await;
        assert_eq!(body.status, HealthStatus::Unhealthy);
        let detail = body.checks.store.detail.as_deref().unwrap();
        assert!(detail.starts_with("PING failed"), "{detail}");
    }
}
