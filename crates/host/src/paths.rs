//! Central path resolution for host data files.
//!
//! Resolved once at startup from: CLI `--data-dir` (or `POCKETRAG_USERDATA_PATH`)
//! > the platform data directory joined with `PocketRAG`.
//! All callsites use these helpers instead of joining paths themselves.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

static DATA_DIR: RwLock<Option<PathBuf>> = RwLock::new(None);

const APP_DIR_NAME: &str = "PocketRAG";

/// Initialize the global data directory. Returns the resolved path.
///
/// Panics if no explicit path is given and the platform has no data directory.
pub fn init_data_dir(explicit: Option<&Path>) -> PathBuf {
    let dir = match explicit {
        Some(p) => p.to_path_buf(),
        None => dirs::data_dir()
            .expect("platform data directory not found")
            .join(APP_DIR_NAME),
    };

    let mut guard = DATA_DIR.write().expect("DATA_DIR lock poisoned");
    *guard = Some(dir.clone());
    dir
}

/// Return the current data directory. Panics if `init_data_dir` hasn't been called.
pub fn data_dir() -> PathBuf {
    DATA_DIR
        .read()
        .expect("DATA_DIR lock poisoned")
        .clone()
        .expect("data_dir() called before init_data_dir()")
}

pub fn log_dir() -> PathBuf {
    data_dir().join("logs")
}

pub fn settings_path() -> PathBuf {
    data_dir().join("settings.json")
}

/// Candidate settings written for the kernel to validate before they are applied.
pub fn modified_settings_path() -> PathBuf {
    data_dir().join("settings-modified.json")
}

/// Create all required subdirectories under the data dir.
pub fn ensure_dirs() -> io::Result<()> {
    let base = data_dir();
    std::fs::create_dir_all(&base)?;
    std::fs::create_dir_all(base.join("logs"))?;
    Ok(())
}

/// Forget the data dir between tests.
#[cfg(test)]
pub fn reset_data_dir() {
    let mut guard = DATA_DIR.write().expect("DATA_DIR lock poisoned");
    *guard = None;
}
