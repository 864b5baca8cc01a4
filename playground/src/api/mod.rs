//! HTTP surface
//!
//! | Method | Path        | Handler                         |
//! |--------|-------------|---------------------------------|
//! | POST   | `/execute`  | [`handlers::execute`]           |
//! | GET    | `/runtimes` | [`handlers::runtimes`]          |
//! | GET    | `/packages` | [`handlers::packages`]          |
//! | POST   | `/packages` | [`handlers::install_package`]   |
//! | DELETE | `/packages` | [`handlers::uninstall_package`] |
//! | GET    | `/health`   | [`handlers::health`]            |
//! | GET    | `/version`  | [`handlers::version`]           |

pub mod handlers;

use std::sync::{Arc, RwLock};

use anyhow::{Context, Result};
use axum::routing::{get, post};
use axum::Router;
use tracing::info;

use crate::config::AppConfig;
use crate::core::runtimes::RuntimeRegistry;
use crate::engine::sandbox::SandboxPool;
use crate::packages::PackageRepository;

pub struct AppState {
    pub config: Arc<AppConfig>,
    /// Swapped wholesale after package changes; running jobs keep their own `Arc<Runtime>`
    registry: RwLock<Arc<RuntimeRegistry>>,
    pub pool: Arc<SandboxPool>,
    pub packages: Arc<PackageRepository>,
}

impl AppState {
    pub fn new(
        config: Arc<AppConfig>,
        registry: RuntimeRegistry,
        pool: Arc<SandboxPool>,
        packages: Arc<PackageRepository>,
    ) -> Self {
        Self {
            config,
            registry: RwLock::new(Arc::new(registry)),
            pool,
            packages,
        }
    }

    /// Current runtime snapshot
    pub fn registry(&self) -> Arc<RuntimeRegistry> {
        let registry = self.registry.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&*registry)
    }

    /// Rebuild the registry from the runtimes file and installed packages
    pub async fn reload_runtimes(&self) -> Result<()> {
        let config = Arc::clone(&self.config);
        let registry = tokio::task::spawn_blocking(move || RuntimeRegistry::load(&config))
            .await
            .context("Runtime reload task panicked")??;

        let count = registry.list().len();
        *self.registry.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(registry);
        info!("Runtime registry reloaded ({} runtimes)", count);
        Ok(())
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/execute", post(handlers::execute))
        .route("/runtimes", get(handlers::runtimes))
        .route(
            "/packages",
            get(handlers::packages)
                .post(handlers::install_package)
                .delete(handlers::uninstall_package),
        )
        .route("/health", get(handlers::health))
        .route("/version", get(handlers::version))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::core::runtimes::{parse_runtimes, Stage, PACKAGE_RUNTIME_FILE};
    use crate::engine::sandbox::fake::{exited, FakeBackend};
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use serde_json::{json, Value};
    use sha2::{Digest, Sha256};
    use tempfile::TempDir;
    use tokio::net::TcpListener;
    use tower::ServiceExt;

    const RUNTIMES: &str = r#"
[[runtime]]
language = "python"
version = "3.10.0"
aliases = ["py"]
runtime = "cpython"
run_command = "/usr/bin/python3"

[runtime.limits]
run_timeout = 10000

[[runtime]]
language = "c"
version = "10.2.0"
compile_command = "/usr/bin/gcc -o main"
run_command = "./main"
"#;

    fn app_with(backend: Arc<FakeBackend>, capacity: usize, queue: Option<usize>) -> Router {
        let config = AppConfig::default();
        let registry = RuntimeRegistry::new(parse_runtimes(RUNTIMES, &config, None, None).unwrap());
        let packages = PackageRepository::with_client(
            reqwest::Client::new(),
            "http://127.0.0.1:9/index",
            std::env::temp_dir().join("playground-api-test"),
        );
        router(Arc::new(AppState::new(
            Arc::new(config),
            registry,
            SandboxPool::new(backend, 0, capacity, queue),
            Arc::new(packages),
        )))
    }

    fn app(backend: Arc<FakeBackend>) -> Router {
        app_with(backend, 2, None)
    }

    async fn send(app: Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Vec<u8>) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(match body {
                Some(body) => Body::from(body.to_string()),
                None => Body::empty(),
            })
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, bytes.to_vec())
    }

    fn json_of(bytes: &[u8]) -> Value {
        serde_json::from_slice(bytes).unwrap()
    }

    #[tokio::test]
    async fn test_execute_interpreted() {
        let backend = Arc::new(FakeBackend::new(|_, _| Ok(exited(0, "2\n"))));
        let (status, body) = send(
            app(backend),
            "POST",
            "/execute",
            Some(json!({
                "language": "python",
                "version": "3.10.0",
                "files": [{ "content": "print(1+1)" }]
            })),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        let body = json_of(&body);
        assert_eq!(body["run"]["stdout"], "2\n");
        assert_eq!(body["run"]["code"], 0);
        assert_eq!(body["run"]["signal"], Value::Null);
        assert!(body.get("compile").is_none());
    }

    #[tokio::test]
    async fn test_execute_compile_failure_mirrors_compile() {
        let backend = Arc::new(FakeBackend::new(|req, _| match req.stage {
            Stage::Compile => Ok(exited(1, "error: expected ';'")),
            Stage::Run => panic!("run must not start"),
        }));
        let (status, body) = send(
            app(backend.clone()),
            "POST",
            "/execute",
            Some(json!({
                "language": "c",
                "version": "10.x",
                "files": [{ "name": "main.c", "content": "int main(" }],
                "stdin": "unused"
            })),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        let body = json_of(&body);
        assert_eq!(body["compile"]["code"], 1);
        assert_eq!(body["run"], body["compile"]);
        assert_eq!(backend.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_execute_validation_errors() {
        let backend = Arc::new(FakeBackend::default());

        let (status, body) = send(
            app(backend.clone()),
            "POST",
            "/execute",
            Some(json!({ "language": "cobol", "version": "99", "files": [{ "content": "x" }] })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json_of(&body)["message"], "cobol-99 runtime is unknown");

        let (status, body) = send(
            app(backend.clone()),
            "POST",
            "/execute",
            Some(json!({
                "language": "python",
                "version": "3.10.0",
                "files": [{ "content": "x" }],
                "run_timeout": 20000
            })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(
            json_of(&body)["message"],
            "run_timeout cannot exceed the configured limit of 10000"
        );

        // nothing ran, nothing was leased
        assert_eq!(backend.inits(), 0);
    }

    #[tokio::test]
    async fn test_execute_malformed_json() {
        let app = app(Arc::new(FakeBackend::default()));
        let request = Request::builder()
            .method("POST")
            .uri("/execute")
            .header("content-type", "application/json")
            .body(Body::from("{not json"))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert!(json_of(&bytes)["message"].is_string());
    }

    #[tokio::test]
    async fn test_execute_infrastructure_error_is_empty_500() {
        let backend = Arc::new(FakeBackend::new(|_, _| anyhow::bail!("isolate missing")));
        let (status, body) = send(
            app(backend.clone()),
            "POST",
            "/execute",
            Some(json!({ "language": "py", "version": "*", "files": [{ "content": "x" }] })),
        )
        .await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body.is_empty());
        assert_eq!(backend.cleanups(), 1);
    }

    #[tokio::test]
    async fn test_execute_pool_exhausted() {
        let backend = Arc::new(FakeBackend::default());
        let app = app_with(backend, 0, Some(0));
        let (status, body) = send(
            app,
            "POST",
            "/execute",
            Some(json!({ "language": "py", "version": "*", "files": [{ "content": "x" }] })),
        )
        .await;

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(json_of(&body)["message"].is_string());
    }

    #[tokio::test]
    async fn test_runtimes() {
        let (status, body) = send(app(Arc::new(FakeBackend::default())), "GET", "/runtimes", None).await;
        assert_eq!(status, StatusCode::OK);

        let body = json_of(&body);
        assert_eq!(
            body[0],
            json!({
                "language": "python",
                "version": "3.10.0",
                "aliases": ["py"],
                "runtime": "cpython"
            })
        );
        assert!(body[1].get("runtime").is_none());
    }

    #[tokio::test]
    async fn test_packages_unreachable_index() {
        let (status, body) = send(app(Arc::new(FakeBackend::default())), "GET", "/packages", None).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body.is_empty());
    }

    fn package_archive(runtime_toml: &str) -> Vec<u8> {
        let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
        let mut header = tar::Header::new_gnu();
        header.set_size(runtime_toml.len() as u64);
        header.set_mode(0o644);
        builder
            .append_data(&mut header, PACKAGE_RUNTIME_FILE, runtime_toml.as_bytes())
            .unwrap();
        builder.into_inner().unwrap().finish().unwrap()
    }

    #[tokio::test]
    async fn test_installed_package_becomes_resolvable() {
        let archive = package_archive(
            r#"
[[runtime]]
language = "ruby"
version = "3.0.1"
aliases = ["rb"]
run_command = "/runtime/bin/ruby"
"#,
        );
        let checksum = hex::encode(Sha256::digest(&archive));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let index = format!("ruby,3.0.1,{},http://{}/ruby-3.0.1.tar.gz\n", checksum, addr);
        let repo = Router::new()
            .route("/index", get(move || async move { index }))
            .route("/ruby-3.0.1.tar.gz", get(move || async move { archive }));
        tokio::spawn(async move {
            axum::serve(listener, repo).await.unwrap();
        });

        let data = TempDir::new().unwrap();
        let runtimes_file = data.path().join("runtimes.toml");
        std::fs::write(&runtimes_file, RUNTIMES).unwrap();
        let config = AppConfig {
            data_directory: data.path().to_path_buf(),
            runtimes_config: runtimes_file,
            repo_url: format!("http://{}/index", addr),
            ..AppConfig::default()
        };
        let registry = RuntimeRegistry::load(&config).unwrap();
        let packages = Arc::new(PackageRepository::new(&config));
        let install_path = config.packages_dir().join("ruby/3.0.1");
        let backend = Arc::new(FakeBackend::new(|_, _| Ok(exited(0, "hi\n"))));
        let app = router(Arc::new(AppState::new(
            Arc::new(config),
            registry,
            SandboxPool::new(backend.clone(), 0, 1, None),
            packages,
        )));
        let ruby_job = json!({ "language": "rb", "version": "3.x", "files": [{ "content": "puts 'hi'" }] });

        let (status, body) = send(app.clone(), "POST", "/execute", Some(ruby_job.clone())).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json_of(&body)["message"], "rb-3.x runtime is unknown");

        let (status, body) = send(
            app.clone(),
            "POST",
            "/packages",
            Some(json!({ "language": "ruby", "version": "3.x" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json_of(&body), json!({ "language": "ruby", "version": "3.0.1" }));

        let (_, body) = send(app.clone(), "GET", "/runtimes", None).await;
        let listed = json_of(&body);
        assert!(listed
            .as_array()
            .unwrap()
            .iter()
            .any(|rt| rt["language"] == "ruby" && rt["version"] == "3.0.1"));

        let (status, body) = send(app.clone(), "POST", "/execute", Some(ruby_job.clone())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json_of(&body)["run"]["stdout"], "hi\n");
        let request = backend.requests().pop().unwrap();
        assert_eq!(request.mount.as_deref(), Some(install_path.as_path()));
        assert_eq!(request.command[0], "/runtime/bin/ruby");

        let (status, _) = send(
            app.clone(),
            "DELETE",
            "/packages",
            Some(json!({ "language": "ruby", "version": "3.0.1" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(!install_path.exists());

        let (status, _) = send(app, "POST", "/execute", Some(ruby_job)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_package_request_validation() {
        let app = app(Arc::new(FakeBackend::default()));
        let (status, body) = send(app.clone(), "POST", "/packages", Some(json!({ "version": "1" }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json_of(&body)["message"], "language is required as a string");

        let (status, body) = send(app, "DELETE", "/packages", Some(json!({ "language": "ruby" }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json_of(&body)["message"], "version is required as a string");
    }

    #[tokio::test]
    async fn test_health_and_version() {
        let (status, body) = send(app(Arc::new(FakeBackend::default())), "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        let time = json_of(&body)["currentTime"].as_str().unwrap().to_string();
        assert!(chrono::DateTime::parse_from_rfc3339(&time).is_ok());

        let (status, body) = send(app(Arc::new(FakeBackend::default())), "GET", "/version", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json_of(&body)["version"], env!("CARGO_PKG_VERSION"));
    }
}
