//! Filesystem helpers shared by package installs and job staging

use std::io::{Read, Seek};
use std::path::{Component, Path};

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use zip::ZipArchive;

/// True when `name` is a non-empty relative path that stays inside its root
pub fn is_safe_relative_path(name: &str) -> bool {
    let path = Path::new(name);
    !name.is_empty()
        && !name.contains('\0')
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
        && path.components().any(|c| matches!(c, Component::Normal(_)))
}

/// Extract a zip archive into `dest`. Entries escaping `dest` are rejected.
pub fn extract_zip<R: Read + Seek>(data: R, dest: &Path) -> Result<()> {
    let mut archive = ZipArchive::new(data).context("Invalid zip archive")?;

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;

        // ZIP Slip
        let relative = match entry.enclosed_name() {
            Some(path) => path.to_owned(),
            None => anyhow::bail!("Archive entry {:?} escapes the install directory", entry.name()),
        };
        let out_path = dest.join(&relative);

        if entry.is_dir() {
            std::fs::create_dir_all(&out_path)?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out = std::fs::File::create(&out_path)
            .with_context(|| format!("Failed to create {}", out_path.display()))?;
        std::io::copy(&mut entry, &mut out)?;

        #[cfg(unix)]
        if let Some(mode) = entry.unix_mode() {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&out_path, std::fs::Permissions::from_mode(mode))?;
        }
    }

    Ok(())
}

/// Extract a gzip-compressed tarball into `dest`. Entries escaping `dest` are rejected.
pub fn extract_tar_gz<R: Read>(data: R, dest: &Path) -> Result<()> {
    let mut archive = tar::Archive::new(GzDecoder::new(data));
    archive.set_preserve_permissions(true);

    for entry in archive.entries().context("Invalid tar.gz archive")? {
        let mut entry = entry?;
        // unpack_in refuses paths with `..` or absolute roots
        if !entry.unpack_in(dest)? {
            let path = entry.path()?.display().to_string();
            anyhow::bail!("Archive entry {:?} escapes the install directory", path);
        }
    }

    Ok(())
}
