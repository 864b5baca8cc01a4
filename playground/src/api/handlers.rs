use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{error, info};

use super::AppState;
use crate::engine::executer::run_job;
use crate::error::{EngineError, ValidationError};
use crate::jobs::validator::build_job;
use crate::packages::Package;

#[derive(Debug, Serialize)]
pub struct RuntimeInfo {
    pub language: String,
    pub version: String,
    pub aliases: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct PackageInfo {
    pub language: String,
    pub language_version: String,
    pub installed: bool,
}

fn bad_request(message: impl Into<String>) -> Response {
    EngineError::from(ValidationError::new(message)).into_response()
}

pub async fn execute(
    State(state): State<Arc<AppState>>,
    body: Result<Json<Value>, JsonRejection>,
) -> Response {
    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => return bad_request(rejection.body_text()),
    };

    let job = match build_job(&body, &state.registry()) {
        Ok(job) => job,
        Err(e) => return EngineError::from(e).into_response(),
    };
    info!(
        "Job {} accepted: {}-{}",
        job.id, job.runtime.language, job.runtime.version
    );

    // Detached so a client disconnect does not abort the job mid-stage
    let pool = Arc::clone(&state.pool);
    let handle = tokio::spawn(run_job(pool, job));

    match handle.await {
        Ok(Ok(result)) => (StatusCode::OK, Json(result.with_run_fallback())).into_response(),
        Ok(Err(e)) => e.into_response(),
        Err(e) => {
            error!("Job task failed: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

pub async fn runtimes(State(state): State<Arc<AppState>>) -> Json<Vec<RuntimeInfo>> {
    let registry = state.registry();
    Json(
        registry
            .list()
            .iter()
            .map(|rt| RuntimeInfo {
                language: rt.language.clone(),
                version: rt.version.to_string(),
                aliases: rt.aliases.clone(),
                runtime: rt.runtime.clone(),
            })
            .collect(),
    )
}

pub async fn packages(State(state): State<Arc<AppState>>) -> Response {
    let packages = match state.packages.list().await {
        Ok(packages) => packages,
        Err(e) => {
            error!("Failed to list packages: {:#}", e);
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let mut infos = Vec::with_capacity(packages.len());
    for pkg in &packages {
        infos.push(PackageInfo {
            language: pkg.language.clone(),
            language_version: pkg.version.to_string(),
            installed: state.packages.installed(pkg).await,
        });
    }
    Json(infos).into_response()
}

/// Parse a `{language, version}` body and resolve it against the index.
/// Failures come back as the response to send.
async fn resolve_package_request(
    state: &AppState,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<Package, Response> {
    let Json(body) = body.map_err(|rejection| bad_request(rejection.body_text()))?;
    let Some(language) = body.get("language").and_then(Value::as_str) else {
        return Err(bad_request("language is required as a string"));
    };
    let Some(version) = body.get("version").and_then(Value::as_str) else {
        return Err(bad_request("version is required as a string"));
    };

    match state.packages.resolve(language, version).await {
        Ok(Some(pkg)) => Ok(pkg),
        Ok(None) => Err((
            StatusCode::NOT_FOUND,
            Json(json!({
                "message": format!("Requested package {}-{} does not exist", language, version)
            })),
        )
            .into_response()),
        Err(e) => {
            error!("Failed to resolve package {}-{}: {:#}", language, version, e);
            Err(StatusCode::INTERNAL_SERVER_ERROR.into_response())
        }
    }
}

/// Pick up the runtimes a package change added or removed
async fn package_changed(state: &AppState, pkg: &Package) -> Response {
    if let Err(e) = state.reload_runtimes().await {
        error!(
            "Failed to reload runtimes after {}-{} changed: {:#}",
            pkg.language, pkg.version, e
        );
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    Json(json!({
        "language": pkg.language,
        "version": pkg.version.to_string(),
    }))
    .into_response()
}

pub async fn install_package(
    State(state): State<Arc<AppState>>,
    body: Result<Json<Value>, JsonRejection>,
) -> Response {
    let pkg = match resolve_package_request(&state, body).await {
        Ok(pkg) => pkg,
        Err(response) => return response,
    };

    if let Err(e) = state.packages.install(&pkg).await {
        error!("Failed to install {}-{}: {:#}", pkg.language, pkg.version, e);
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    package_changed(&state, &pkg).await
}

pub async fn uninstall_package(
    State(state): State<Arc<AppState>>,
    body: Result<Json<Value>, JsonRejection>,
) -> Response {
    let pkg = match resolve_package_request(&state, body).await {
        Ok(pkg) => pkg,
        Err(response) => return response,
    };

    if let Err(e) = state.packages.uninstall(&pkg).await {
        error!("Failed to uninstall {}-{}: {:#}", pkg.language, pkg.version, e);
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    package_changed(&state, &pkg).await
}

pub async fn health() -> Json<Value> {
    Json(json!({ "currentTime": Utc::now().to_rfc3339() }))
}

pub async fn version() -> Json<Value> {
    Json(json!({ "version": env!("CARGO_PKG_VERSION") }))
}
