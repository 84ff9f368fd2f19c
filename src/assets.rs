//! Process-wide lookup of auxiliary data files used by engines.

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

/// Environment variable naming the asset directory for engines.
pub const ASSET_ENV: &str = "tunnel.location.asset";

static ASSET_DIR: Lazy<RwLock<Option<PathBuf>>> = Lazy::new(|| RwLock::new(None));

/// Meant to be called once, before the first start cycle. An empty
/// `env_path` leaves the environment untouched; an empty `assets_path`
/// clears the fallback directory.
pub fn set_assets_path(env_path: &str, assets_path: &str) {
    if !env_path.is_empty() {
        std::env::set_var(ASSET_ENV, env_path);
    }
    *ASSET_DIR.write() = if assets_path.is_empty() {
        None
    } else {
        Some(PathBuf::from(assets_path))
    };
}

/// Opens `path` as given when it exists; otherwise looks its file name up in
/// the fallback directory, then in the directory named by [`ASSET_ENV`].
pub fn open_asset(path: impl AsRef<Path>) -> io::Result<File> {
    let path = path.as_ref();
    if path.exists() {
        return File::open(path);
    }
    if let Some(name) = path.file_name() {
        let fallback = ASSET_DIR.read().clone();
        let env_dir = std::env::var_os(ASSET_ENV).map(PathBuf::from);
        for dir in fallback.into_iter().chain(env_dir) {
            let candidate = dir.join(name);
            if candidate.exists() {
                return File::open(candidate);
            }
        }
    }
    Err(io::Error::new(
        io::ErrorKind::NotFound,
        format!("asset {} not found", path.display()),
    ))
}
