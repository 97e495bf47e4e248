//! Filesystem operations confined to the sandbox root.
//!
//! These are thin wrappers: validate the request shape, resolve the path
//! through the sandbox resolver, make one filesystem call. None of them
//! touch either service lock.

use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use glob::Pattern;
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::error::{Result, SandboxError};
use crate::service::SandboxService;
use crate::types::{FileInfo, OperationResponse};

/// Maximum file content size accepted by create/write, in bytes.
pub const MAX_FILE_SIZE: usize = 100 * 1024 * 1024;

/// Maximum number of paths in one batch delete.
pub const MAX_BATCH_DELETE: usize = 1000;

impl SandboxService {
    /// Create a file with the given content, creating parent directories
    /// as needed.
    pub fn create_file(&self, path: &str, content: &str) -> Result<()> {
        check_content_size(content)?;
        let abs = self.resolver.resolve(path)?;
        if let Some(parent) = abs.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&abs, content)?;
        info!(path = %abs.display(), "file created");
        Ok(())
    }

    /// Create a directory and any missing parents.
    pub fn create_dir(&self, path: &str) -> Result<()> {
        let abs = self.resolver.resolve(path)?;
        fs::create_dir_all(&abs)?;
        info!(path = %abs.display(), "directory created");
        Ok(())
    }

    /// Read a file's content as UTF-8.
    pub fn read_file(&self, path: &str) -> Result<String> {
        let abs = self.resolver.resolve(path)?;
        fs::read_to_string(&abs).map_err(|e| not_found_or_io(e, path))
    }

    /// Overwrite a file's content, creating parent directories as needed.
    pub fn write_file(&self, path: &str, content: &str) -> Result<()> {
        check_content_size(content)?;
        let abs = self.resolver.resolve(path)?;
        if let Some(parent) = abs.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&abs, content)?;
        info!(path = %abs.display(), "file written");
        Ok(())
    }

    /// Delete a file or directory tree. Deleting a missing path is not an
    /// error.
    pub fn delete(&self, path: &str) -> Result<()> {
        let abs = self.resolver.resolve(path)?;
        match fs::symlink_metadata(&abs) {
            Ok(meta) if meta.is_dir() => fs::remove_dir_all(&abs)?,
            Ok(_) => fs::remove_file(&abs)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        }
        info!(path = %abs.display(), "deleted");
        Ok(())
    }

    /// Copy a file or directory tree. Both endpoints must resolve inside
    /// the sandbox.
    pub fn copy(&self, source: &str, destination: &str) -> Result<()> {
        check_source_destination(source, destination)?;
        let src = self.resolver.resolve(source)?;
        let dst = self.resolver.resolve(destination)?;
        let meta = fs::metadata(&src).map_err(|e| not_found_or_io(e, source))?;

        if meta.is_dir() {
            copy_dir(&src, &dst)?;
        } else {
            copy_file(&src, &dst)?;
        }
        info!(source = %src.display(), destination = %dst.display(), "copied");
        Ok(())
    }

    /// Move (rename) a file or directory, creating the destination's parent
    /// directories as needed.
    pub fn move_path(&self, source: &str, destination: &str) -> Result<()> {
        check_source_destination(source, destination)?;
        let src = self.resolver.resolve(source)?;
        let dst = self.resolver.resolve(destination)?;
        if !src.exists() {
            return Err(SandboxError::NotFound {
                path: source.to_string(),
            });
        }
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(&src, &dst)?;
        info!(source = %src.display(), destination = %dst.display(), "moved");
        Ok(())
    }

    /// List one directory's entries.
    pub fn list_dir(&self, path: &str) -> Result<Vec<FileInfo>> {
        let abs = self.resolver.resolve(path)?;
        let entries = fs::read_dir(&abs).map_err(|e| not_found_or_io(e, path))?;

        let mut files = Vec::new();
        for entry in entries {
            let entry = entry?;
            let meta = match entry.metadata() {
                Ok(meta) => meta,
                Err(e) => {
                    warn!(name = %entry.file_name().to_string_lossy(), error = %e, "skipping unreadable entry");
                    continue;
                }
            };
            let name = entry.file_name().to_string_lossy().into_owned();
            let rel = Path::new(path).join(&name);
            files.push(file_info(name, rel.to_string_lossy().into_owned(), &meta));
        }
        Ok(files)
    }

    /// Recursively search for entries whose file name matches a glob
    /// pattern. Result paths are relative to the sandbox root.
    pub fn search(&self, path: &str, pattern: &str) -> Result<Vec<FileInfo>> {
        if pattern.trim().is_empty() {
            return Err(SandboxError::InvalidRequest {
                reason: "search pattern cannot be empty".to_string(),
            });
        }
        let matcher = Pattern::new(pattern).map_err(|e| SandboxError::InvalidRequest {
            reason: format!("invalid search pattern: {e}"),
        })?;
        let abs = self.resolver.resolve(path)?;

        let mut matches = Vec::new();
        for entry in WalkDir::new(&abs).into_iter().filter_map(|e| e.ok()) {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !matcher.matches(&name) {
                continue;
            }
            let meta = match entry.metadata() {
                Ok(meta) => meta,
                Err(_) => continue,
            };
            let rel = self.resolver.relative(entry.path());
            matches.push(file_info(name, rel.to_string_lossy().into_owned(), &meta));
        }
        Ok(matches)
    }

    /// Delete up to [`MAX_BATCH_DELETE`] paths, continuing past failures.
    /// Any failed path turns the overall response into `success=false` with
    /// the failures named; paths that did delete stay deleted.
    pub fn batch_delete(&self, paths: &[String]) -> Result<OperationResponse> {
        if paths.is_empty() {
            return Err(SandboxError::InvalidRequest {
                reason: "paths list cannot be empty".to_string(),
            });
        }
        if paths.len() > MAX_BATCH_DELETE {
            return Err(SandboxError::InvalidRequest {
                reason: format!(
                    "batch delete count exceeds maximum allowed count of {MAX_BATCH_DELETE}"
                ),
            });
        }

        let mut failed = Vec::new();
        for path in paths {
            if let Err(e) = self.delete(path) {
                warn!(%path, error = %e, "batch delete entry failed");
                failed.push(path.clone());
            }
        }

        if failed.is_empty() {
            Ok(OperationResponse {
                success: true,
                message: format!("deleted {} paths", paths.len()),
            })
        } else {
            Ok(OperationResponse {
                success: false,
                message: format!(
                    "failed to delete {} paths: {}",
                    failed.len(),
                    failed.join(", ")
                ),
            })
        }
    }

    /// Metadata for one path, expressed relative to the sandbox root.
    pub fn file_stat(&self, path: &str) -> Result<FileInfo> {
        let abs = self.resolver.resolve(path)?;
        let meta = fs::metadata(&abs).map_err(|e| not_found_or_io(e, path))?;
        let name = abs
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let rel = self.resolver.relative(&abs);
        Ok(file_info(name, rel.to_string_lossy().into_owned(), &meta))
    }

    /// Whether a path exists inside the sandbox.
    pub fn file_exists(&self, path: &str) -> Result<bool> {
        let abs = self.resolver.resolve(path)?;
        Ok(abs.exists())
    }
}

fn check_content_size(content: &str) -> Result<()> {
    if content.len() > MAX_FILE_SIZE {
        return Err(SandboxError::InvalidRequest {
            reason: format!("content size exceeds maximum allowed size of {MAX_FILE_SIZE} bytes"),
        });
    }
    Ok(())
}

fn check_source_destination(source: &str, destination: &str) -> Result<()> {
    if source.trim().is_empty() || destination.trim().is_empty() {
        return Err(SandboxError::InvalidPath);
    }
    if source == destination {
        return Err(SandboxError::InvalidRequest {
            reason: "source and destination cannot be the same".to_string(),
        });
    }
    Ok(())
}

fn not_found_or_io(e: std::io::Error, path: &str) -> SandboxError {
    if e.kind() == std::io::ErrorKind::NotFound {
        SandboxError::NotFound {
            path: path.to_string(),
        }
    } else {
        SandboxError::Io(e)
    }
}

fn file_info(name: String, path: String, meta: &fs::Metadata) -> FileInfo {
    FileInfo {
        name,
        path,
        size: meta.len(),
        is_dir: meta.is_dir(),
        modified: meta.modified().ok().map(DateTime::<Utc>::from),
    }
}

fn copy_file(src: &Path, dst: &Path) -> Result<()> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::copy(src, dst)?;
    Ok(())
}

fn copy_dir(src: &Path, dst: &Path) -> Result<()> {
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir(&src_path, &dst_path)?;
        } else {
            copy_file(&src_path, &dst_path)?;
        }
    }
    Ok(())
}
