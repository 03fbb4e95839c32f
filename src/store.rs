//! JSON snapshot persistence for [`MemoryGateway`].

use std::fs::{File, OpenOptions};
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[cfg(unix)]
use std::os::unix::io::AsRawFd;

use crate::gateway::{MemoryGateway, MemorySnapshot};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Snapshot {path} is not valid JSON: {source}")]
    Json {
        path: String,
        source: serde_json::Error,
    },
    #[error("Lock error: {0}")]
    Lock(String),
}

/// RAII guard for the snapshot lock - released on drop
struct FileLock {
    #[cfg(unix)]
    file: File,
}

impl FileLock {
    #[cfg(unix)]
    fn acquire<P: AsRef<Path>>(lock_path: P) -> Result<Self, StoreError> {
        if let Some(parent) = lock_path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)?;

        let fd = file.as_raw_fd();
        let ret = unsafe { libc::flock(fd, libc::LOCK_EX) };

        if ret != 0 {
            return Err(StoreError::Lock(format!(
                "Failed to acquire lock on {:?}: {}",
                lock_path.as_ref(),
                std::io::Error::last_os_error()
            )));
        }

        Ok(FileLock { file })
    }

    #[cfg(not(unix))]
    fn acquire<P: AsRef<Path>>(_lock_path: P) -> Result<Self, StoreError> {
        Ok(FileLock {})
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            let fd = self.file.as_raw_fd();
            unsafe {
                libc::flock(fd, libc::LOCK_UN);
            }
        }
    }
}

fn lock_path_for(store_path: &Path) -> PathBuf {
    let mut name = store_path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "store.json".into());
    name.push(".lock");
    store_path.with_file_name(name)
}

/// Load a gateway snapshot. A missing file yields an empty store whose
/// current user is `default_user`.
pub fn load_store<P: AsRef<Path>>(path: P, default_user: &str) -> Result<MemoryGateway, StoreError> {
    let path = path.as_ref();
    let _lock = FileLock::acquire(lock_path_for(path))?;

    if !path.exists() {
        return Ok(MemoryGateway::new(default_user));
    }

    let reader = BufReader::new(File::open(path)?);
    let snapshot: MemorySnapshot =
        serde_json::from_reader(reader).map_err(|e| StoreError::Json {
            path: path.display().to_string(),
            source: e,
        })?;
    Ok(MemoryGateway::from_snapshot(snapshot))
}

/// Save a gateway snapshot with an advisory lock and an atomic
/// temp-file-plus-rename write.
pub fn save_store<P: AsRef<Path>>(gateway: &MemoryGateway, path: P) -> Result<(), StoreError> {
    let path = path.as_ref();
    let _lock = FileLock::acquire(lock_path_for(path))?;

    let parent = path.parent().unwrap_or(Path::new("."));
    std::fs::create_dir_all(parent)?;
    let tmp_path = parent.join(format!(".store.tmp.{}", std::process::id()));

    let result = (|| -> Result<(), StoreError> {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;

        let json = serde_json::to_string_pretty(&gateway.snapshot()).map_err(|e| {
            StoreError::Json {
                path: path.display().to_string(),
                source: e,
            }
        })?;
        file.write_all(json.as_bytes())?;
        file.flush()?;
        #[cfg(unix)]
        {
            let rc = unsafe { libc::fsync(file.as_raw_fd()) };
            if rc != 0 {
                return Err(StoreError::Io(std::io::Error::last_os_error()));
            }
        }
        Ok(())
    })();

    if result.is_ok() {
        std::fs::rename(&tmp_path, path)?;
    } else {
        let _ = std::fs::remove_file(&tmp_path);
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::TcmsClass;
    use crate::gateway::{TcmsGateway, fields};
    use tempfile::TempDir;

    #[test]
    fn test_missing_store_yields_empty_gateway() {
        let dir = TempDir::new().unwrap();
        let gw = load_store(dir.path().join("store.json"), "bob").unwrap();
        assert_eq!(
            gw.current_user().unwrap().str_field("username"),
            Some("bob")
        );
        assert!(gw.objects_of(TcmsClass::Product).is_empty());
    }

    #[test]
    fn test_save_and_reload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("store.json");

        let gw = MemoryGateway::new("bob");
        let id = gw.seed(TcmsClass::Product, fields([("name", "demo")]));
        let plan = gw.seed(TcmsClass::TestPlan, fields([("name", "Smoke")]));
        gw.upload_attachment(TcmsClass::TestPlan, plan, "notes.txt", b"n")
            .unwrap();
        save_store(&gw, &path).unwrap();

        let reloaded = load_store(&path, "someone-else").unwrap();
        assert_eq!(
            reloaded.current_user().unwrap().str_field("username"),
            Some("bob")
        );
        assert_eq!(reloaded.get(TcmsClass::Product, id).unwrap().id, id);
        assert_eq!(
            reloaded.list_attachments(TcmsClass::TestPlan, plan).unwrap().len(),
            1
        );
        assert!(!dir.path().join("nested").join(format!(".store.tmp.{}", std::process::id())).exists());
    }

    #[test]
    fn test_corrupt_store_reports_path() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store.json");
        std::fs::write(&path, "{ not json").unwrap();
        let err = load_store(&path, "bob").unwrap_err();
        assert!(matches!(err, StoreError::Json { .. }));
        assert!(err.to_string().contains("store.json"));
    }
}
