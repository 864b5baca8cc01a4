//! Package repository
//!
//! The remote index is plain text, one package per line:
//! `language,version,checksum,download_url`. Installs land in
//! `<data>/packages/<language>/<version>` and only count once the
//! [`INSTALLED_SENTINEL`] file exists, which is always written last.

use std::collections::HashMap;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use chrono::Utc;
use semver::Version;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::core::utils::{extract_tar_gz, extract_zip};
use crate::core::version::{pick_latest, VersionRange};

/// Marks a complete install
pub const INSTALLED_SENTINEL: &str = ".installed";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Package {
    pub language: String,
    pub version: Version,
    /// SHA-256 of the archive, hex encoded
    pub checksum: String,
    pub download_url: String,
}

/// Parse the package index. Malformed lines are skipped.
pub fn parse_index(text: &str) -> Vec<Package> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| {
            let fields: Vec<&str> = line.splitn(4, ',').collect();
            let &[language, version, checksum, download_url] = fields.as_slice() else {
                warn!("Skipping malformed index line: {:?}", line);
                return None;
            };
            let version = match Version::parse(version.trim()) {
                Ok(v) => v,
                Err(e) => {
                    warn!("Skipping index line with bad version {:?}: {}", version, e);
                    return None;
                }
            };
            Some(Package {
                language: language.trim().to_string(),
                version,
                checksum: checksum.trim().to_string(),
                download_url: download_url.trim().to_string(),
            })
        })
        .collect()
}

pub struct PackageRepository {
    client: reqwest::Client,
    index_url: String,
    packages_dir: PathBuf,
    install_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl PackageRepository {
    pub fn new(config: &AppConfig) -> Self {
        Self::with_client(reqwest::Client::new(), &config.repo_url, config.packages_dir())
    }

    pub fn with_client(client: reqwest::Client, index_url: &str, packages_dir: PathBuf) -> Self {
        Self {
            client,
            index_url: index_url.to_string(),
            packages_dir,
            install_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn install_path(&self, pkg: &Package) -> PathBuf {
        self.packages_dir
            .join(&pkg.language)
            .join(pkg.version.to_string())
    }

    /// Fetch and parse the remote index
    pub async fn list(&self) -> Result<Vec<Package>> {
        let text = self
            .client
            .get(&self.index_url)
            .send()
            .await
            .with_context(|| format!("Failed to fetch package index {}", self.index_url))?
            .error_for_status()
            .context("Package index request failed")?
            .text()
            .await
            .context("Failed to read package index")?;

        Ok(parse_index(&text))
    }

    /// Highest indexed version of `language` satisfying `range`
    pub async fn resolve(&self, language: &str, range: &str) -> Result<Option<Package>> {
        let Some(range) = VersionRange::parse(range) else {
            return Ok(None);
        };
        let packages = self.list().await?;
        Ok(pick_latest(
            packages.iter().filter(|p| p.language == language),
            &range,
            |p| &p.version,
        )
        .cloned())
    }

    /// True once an install has fully completed
    pub async fn installed(&self, pkg: &Package) -> bool {
        fs::try_exists(self.install_path(pkg).join(INSTALLED_SENTINEL))
            .await
            .unwrap_or(false)
    }

    fn install_lock(&self, pkg: &Package) -> Arc<tokio::sync::Mutex<()>> {
        let key = format!("{}-{}", pkg.language, pkg.version);
        let mut locks = self.install_locks.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(locks.entry(key).or_default())
    }

    /// Download, verify and unpack `pkg`. Installs of the same package are
    /// serialised; an already installed package is left untouched.
    pub async fn install(&self, pkg: &Package) -> Result<()> {
        let lock = self.install_lock(pkg);
        let _guard = lock.lock().await;

        if self.installed(pkg).await {
            info!("{}-{} is already installed", pkg.language, pkg.version);
            return Ok(());
        }

        let install_path = self.install_path(pkg);
        let language_dir = install_path
            .parent()
            .context("Install path has no parent")?
            .to_path_buf();
        fs::create_dir_all(&language_dir)
            .await
            .with_context(|| format!("Failed to create {}", language_dir.display()))?;

        let staging = language_dir.join(format!(".staging-{}-{}", pkg.version, Uuid::new_v4()));
        let result = self.stage_and_commit(pkg, &staging, &install_path).await;
        let _ = fs::remove_dir_all(&staging).await;

        match &result {
            Ok(()) => info!("Installed {}-{} at {}", pkg.language, pkg.version, install_path.display()),
            Err(e) => warn!("Install of {}-{} failed: {:#}", pkg.language, pkg.version, e),
        }
        result
    }

    async fn stage_and_commit(&self, pkg: &Package, staging: &Path, install_path: &Path) -> Result<()> {
        fs::create_dir_all(staging).await?;

        info!("Downloading {}-{} from {}", pkg.language, pkg.version, pkg.download_url);
        let archive = self
            .client
            .get(&pkg.download_url)
            .send()
            .await
            .with_context(|| format!("Failed to download {}", pkg.download_url))?
            .error_for_status()
            .context("Package download failed")?
            .bytes()
            .await
            .context("Failed to read package archive")?;

        let digest = hex::encode(Sha256::digest(&archive));
        if !digest.eq_ignore_ascii_case(&pkg.checksum) {
            anyhow::bail!(
                "Checksum mismatch for {}-{}: expected {}, got {}",
                pkg.language,
                pkg.version,
                pkg.checksum,
                digest
            );
        }

        let payload = staging.join("payload");
        let extract_to = payload.clone();
        let is_zip = pkg.download_url.ends_with(".zip");
        tokio::task::spawn_blocking(move || -> Result<()> {
            std::fs::create_dir_all(&extract_to)?;
            if is_zip {
                extract_zip(Cursor::new(archive), &extract_to)
            } else {
                extract_tar_gz(Cursor::new(archive), &extract_to)
            }
        })
        .await
        .context("Extraction task panicked")??;

        // A directory without the sentinel is a leftover from an interrupted install
        if fs::try_exists(install_path).await? {
            fs::remove_dir_all(install_path)
                .await
                .with_context(|| format!("Failed to remove stale {}", install_path.display()))?;
        }
        fs::rename(&payload, install_path)
            .await
            .with_context(|| format!("Failed to move package into {}", install_path.display()))?;

        write_sentinel(install_path, pkg).await
    }

    /// Remove an installed package. The sentinel goes first so a partial
    /// removal never looks installed.
    pub async fn uninstall(&self, pkg: &Package) -> Result<()> {
        let lock = self.install_lock(pkg);
        let _guard = lock.lock().await;

        let install_path = self.install_path(pkg);
        let sentinel = install_path.join(INSTALLED_SENTINEL);
        if fs::try_exists(&sentinel).await? {
            fs::remove_file(&sentinel).await?;
        }
        if fs::try_exists(&install_path).await? {
            fs::remove_dir_all(&install_path)
                .await
                .with_context(|| format!("Failed to remove {}", install_path.display()))?;
        }
        info!("Uninstalled {}-{}", pkg.language, pkg.version);
        Ok(())
    }
}

/// Write the sentinel atomically: temp file, fsync, rename
async fn write_sentinel(install_path: &Path, pkg: &Package) -> Result<()> {
    let tmp = install_path.join(format!("{}.tmp", INSTALLED_SENTINEL));
    let mut file = fs::File::create(&tmp)
        .await
        .with_context(|| format!("Failed to create {}", tmp.display()))?;
    file.write_all(format!("{}\n{}\n", pkg.checksum, Utc::now().to_rfc3339()).as_bytes())
        .await?;
    file.sync_all().await?;
    drop(file);

    fs::rename(&tmp, install_path.join(INSTALLED_SENTINEL))
        .await
        .context("Failed to commit install sentinel")
}
