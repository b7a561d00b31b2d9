//! Health probe for contactgate.
//!
//! `GET /health` pings the primary ephemeral store. A degraded primary is
//! reported with 503 even though requests keep working on the in-process
//! fallback, so orchestrators can see the outage.

use crate::GIT_COMMIT_HASH;
use crate::api::AppState;
use axum::{
    extract::Extension,
    http::{HeaderMap, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Json},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::time::{Duration, timeout};
use tracing::{debug, warn};
use utoipa::ToSchema;

const HEALTH_STORE_TIMEOUT_SECONDS: u64 = 2;

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct Health {
    commit: String,
    name: String,
    version: String,
    store: String,
    store_status: String,
    mailer: String,
}

#[utoipa::path(
    get,
    path= "/health",
    responses (
        (status = 200, description = "Primary store is reachable", body = Health),
        (status = 503, description = "Primary store is degraded", body = Health)
    ),
    tag = "health",
)]
/// Report build info and store reachability.
pub async fn health(method: Method, state: Extension<Arc<AppState>>) -> impl IntoResponse {
    let stores = state.flow.stores();
    let store_healthy = matches!(
        timeout(
            Duration::from_secs(HEALTH_STORE_TIMEOUT_SECONDS),
            stores.primary().ping()
        )
        .await,
        Ok(Ok(()))
    );
    if !store_healthy {
        warn!(store = stores.primary().backend(), "primary store ping failed");
    }

    let health = Health {
        commit: GIT_COMMIT_HASH.to_string(),
        name: env!("CARGO_PKG_NAME").to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        store: stores.primary().backend().to_string(),
        store_status: if store_healthy {
            "ok".to_string()
        } else {
            "degraded".to_string()
        },
        mailer: state.flow.mailer_kind().to_string(),
    };

    let status = if store_healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let mut headers = HeaderMap::new();
    match HeaderValue::from_str(&app_header(&health)) {
        Ok(value) => {
            headers.insert("X-App", value);
        }
        Err(err) => debug!("invalid X-App header: {err}"),
    }

    if method == Method::GET {
        (status, headers, Json(health)).into_response()
    } else {
        (status, headers).into_response()
    }
}

/// `name:version:short-commit`; the commit part is empty for unknown builds.
fn app_header(health: &Health) -> String {
    let commit = health.commit.get(..7).filter(|_| health.commit.len() > 7);
    format!(
        "{}:{}:{}",
        health.name,
        health.version,
        commit.unwrap_or_default()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn health(commit: &str) -> Health {
        Health {
            commit: commit.to_string(),
            name: "contactgate".to_string(),
            version: "1.2.3".to_string(),
            store: "memory".to_string(),
            store_status: "ok".to_string(),
            mailer: "log".to_string(),
        }
    }

    #[test]
    fn app_header_shortens_commit() {
        assert_eq!(
            app_header(&health("0123456789abcdef")),
            "contactgate:1.2.3:0123456"
        );
        assert_eq!(app_header(&health("unknown")), "contactgate:1.2.3:");
    }
}
