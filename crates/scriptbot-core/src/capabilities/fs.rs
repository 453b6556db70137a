//! The `fs` module. Paths are resolved inside the configured root; absolute
//! paths are taken relative to it, `..` is refused and symlinks may not lead
//! outside the root.

use std::{
    fs,
    path::{Component, Path, PathBuf},
    time::UNIX_EPOCH,
};

use scriptbot_plugin_sdk::{OperationError, OperationErrorKind};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileInfo {
    pub name: String,
    pub size: u64,
    pub is_dir: bool,
    pub mode: u32,
    /// Seconds since the Unix epoch.
    pub modified: Option<u64>,
}

impl FileInfo {
    fn from_metadata(name: String, metadata: &fs::Metadata) -> Self {
        Self {
            name,
            size: metadata.len(),
            is_dir: metadata.is_dir(),
            mode: mode_of(metadata),
            modified: metadata
                .modified()
                .ok()
                .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
                .map(|elapsed| elapsed.as_secs()),
        }
    }
}

pub struct FsNamespace {
    root: PathBuf,
}

impl FsNamespace {
    pub(crate) fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn exists(&self, path: &str) -> bool {
        self.resolve(path).is_ok_and(|full| full.exists())
    }

    pub fn read_file(&self, path: &str) -> Result<Vec<u8>, OperationError> {
        fs::read(self.resolve(path)?).map_err(|err| OperationError::io(&err))
    }

    /// Creates or truncates `path`. `mode` applies on Unix only.
    pub fn write_file(&self, path: &str, data: &[u8], mode: u32) -> Result<(), OperationError> {
        let full = self.resolve_for_write(path)?;
        fs::write(&full, data).map_err(|err| OperationError::io(&err))?;
        set_mode(&full, mode)
    }

    pub fn stat(&self, path: &str) -> Result<FileInfo, OperationError> {
        let full = self.resolve(path)?;
        let metadata = fs::metadata(&full).map_err(|err| OperationError::io(&err))?;
        let name = full
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(FileInfo::from_metadata(name, &metadata))
    }

    /// Directory entries sorted by name.
    pub fn read_dir(&self, path: &str) -> Result<Vec<FileInfo>, OperationError> {
        let full = self.resolve(path)?;
        let mut entries = Vec::new();
        for entry in fs::read_dir(&full).map_err(|err| OperationError::io(&err))? {
            let entry = entry.map_err(|err| OperationError::io(&err))?;
            let metadata = entry.metadata().map_err(|err| OperationError::io(&err))?;
            entries.push(FileInfo::from_metadata(
                entry.file_name().to_string_lossy().into_owned(),
                &metadata,
            ));
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    /// Removes a file or an empty directory.
    pub fn remove(&self, path: &str) -> Result<(), OperationError> {
        let full = self.resolve(path)?;
        if full == self.root {
            return Err(denied("refusing to remove the sandbox root"));
        }
        let metadata = fs::symlink_metadata(&full).map_err(|err| OperationError::io(&err))?;
        let result = if metadata.is_dir() {
            fs::remove_dir(&full)
        } else {
            fs::remove_file(&full)
        };
        result.map_err(|err| OperationError::io(&err))
    }

    pub fn mkdir(&self, path: &str, mode: u32) -> Result<(), OperationError> {
        let full = self.resolve_for_write(path)?;
        fs::create_dir(&full).map_err(|err| OperationError::io(&err))?;
        set_mode(&full, mode)
    }

    pub fn mkdir_all(&self, path: &str, mode: u32) -> Result<(), OperationError> {
        let full = self.resolve(path)?;
        fs::create_dir_all(&full).map_err(|err| OperationError::io(&err))?;
        set_mode(&full, mode)
    }

    pub fn rename(&self, from: &str, to: &str) -> Result<(), OperationError> {
        let source = self.resolve(from)?;
        let target = self.resolve_for_write(to)?;
        fs::rename(source, target).map_err(|err| OperationError::io(&err))
    }

    fn resolve(&self, requested: &str) -> Result<PathBuf, OperationError> {
        let mut full = self.root.clone();
        for component in Path::new(requested).components() {
            match component {
                Component::Normal(part) => full.push(part),
                Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
                Component::ParentDir => {
                    return Err(denied(format!("path `{requested}` leaves the sandbox")));
                }
            }
        }
        self.confine(&full, requested)?;
        Ok(full)
    }

    /// Follows symlinks on the deepest existing part of `full` and checks the
    /// result is still under the root.
    fn confine(&self, full: &Path, requested: &str) -> Result<(), OperationError> {
        let Ok(root) = fs::canonicalize(&self.root) else {
            // Nothing exists under a missing root yet.
            return Ok(());
        };
        let mut ancestor = full;
        while fs::symlink_metadata(ancestor).is_err() {
            match ancestor.parent() {
                Some(parent) => ancestor = parent,
                None => return Ok(()),
            }
        }
        let escapes = match fs::canonicalize(ancestor) {
            Ok(canonical) => !canonical.starts_with(&root),
            // Dangling symlink.
            Err(_) => true,
        };
        if escapes {
            return Err(denied(format!("path `{requested}` leaves the sandbox")));
        }
        Ok(())
    }

    fn resolve_for_write(&self, requested: &str) -> Result<PathBuf, OperationError> {
        fs::create_dir_all(&self.root).map_err(|err| OperationError::io(&err))?;
        self.resolve(requested)
    }
}

fn denied(message: impl Into<String>) -> OperationError {
    OperationError::new(OperationErrorKind::Denied, message)
}

#[cfg(unix)]
fn mode_of(metadata: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn mode_of(metadata: &fs::Metadata) -> u32 {
    if metadata.permissions().readonly() {
        0o444
    } else {
        0o644
    }
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<(), OperationError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
        .map_err(|err| OperationError::io(&err))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> Result<(), OperationError> {
    Ok(())
}
