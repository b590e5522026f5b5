// SPDX-License-Identifier: MIT OR Apache-2.0
//! Request handlers for the snapshot-resolution HTTP API.

use crate::AppState;
use axum::extract::{Path, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use rosdistro_engine::EngineError;
use serde_json::json;
use std::sync::Arc;

/// `GET /healthz` — liveness/readiness probe. Carries no engine semantics.
pub async fn healthz() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

/// Structured error body: `{"error": "<message>"}`, mapped to 404 for an
/// unknown distribution and 500 for everything else.
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl From<Arc<EngineError>> for ApiError {
    fn from(err: Arc<EngineError>) -> Self {
        let status = match err.as_ref() {
            EngineError::UnknownDistro { .. } => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ApiError { status, message: err.to_string() }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

enum Format {
    Json,
    Yaml,
}

fn split_format(raw_reference: &str) -> Result<(&str, Format), ApiError> {
    if let Some(stripped) = raw_reference.strip_suffix(".json") {
        Ok((stripped, Format::Json))
    } else if let Some(stripped) = raw_reference.strip_suffix(".yaml") {
        Ok((stripped, Format::Yaml))
    } else {
        Err(ApiError {
            status: StatusCode::NOT_FOUND,
            message: "reference must end in .json or .yaml".to_string(),
        })
    }
}

/// `GET /get/{dist}/{*reference}` where `reference` ends in `.json` or
/// `.yaml`. Resolves the snapshot and renders it in the requested format.
pub async fn get_snapshot(State(state): State<Arc<AppState>>, Path((dist, raw_reference)): Path<(String, String)>) -> Result<Response, ApiError> {
    let (reference, format) = split_format(&raw_reference)?;

    let repositories = state.engine.get_set(&dist, reference).await?;
    let metadata_inclusions = &state.engine.config().metadata_inclusions;

    let mut repo_map = serde_json::Map::new();
    for desc in &repositories {
        let name = desc.name.clone().unwrap_or_default();
        repo_map.insert(name, desc.to_canonical_json(metadata_inclusions));
    }

    let document = json!({
        "rosdistro": {
            "repository": state.engine.config().distro_repository,
            "distribution": dist,
            "ref": reference,
        },
        "repositories": serde_json::Value::Object(repo_map),
    });

    match format {
        Format::Json => Ok(Json(document).into_response()),
        Format::Yaml => {
            let yaml = serde_yaml::to_string(&document).map_err(|e| ApiError {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                message: format!("failed to render yaml: {e}"),
            })?;

            let filename = format!("{}.yaml", reference.replace('/', "-"));
            let mut response = yaml.into_response();
            response.headers_mut().insert(header::CONTENT_TYPE, HeaderValue::from_static("application/yaml"));
            response.headers_mut().insert(
                header::CONTENT_DISPOSITION,
                HeaderValue::from_str(&format!("attachment; filename={filename}")).unwrap_or(HeaderValue::from_static("attachment")),
            );
            Ok(response)
        }
    }
}
