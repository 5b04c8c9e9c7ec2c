//! Managed Chromium: install location, lookup and download.

use crate::types::{Result, ScriptsiftError};
use chromiumoxide::fetcher::{BrowserFetcher, BrowserFetcherOptions};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Names a Chrome/Chromium executable can have inside a fetched bundle.
const EXECUTABLE_NAMES: &[&str] = &[
    "chrome",
    "chromium",
    "Chromium",
    "Google Chrome",
    "chrome.exe",
    "chromium.exe",
];

/// Returns the managed Chrome installation directory: `~/.scriptsift/chrome/`
pub fn managed_chrome_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().ok_or_else(|| {
        ScriptsiftError::ConfigError("Could not determine home directory".to_string())
    })?;
    Ok(home.join(".scriptsift").join("chrome"))
}

/// A previously downloaded Chrome executable, if any.
pub fn resolve_chrome_executable() -> Option<PathBuf> {
    find_chrome_in_dir(&managed_chrome_dir().ok()?)
}

/// Download Chromium to the managed directory, returning the executable path.
pub async fn download_chrome(force: bool) -> Result<PathBuf> {
    let chrome_dir = managed_chrome_dir()?;

    if !force {
        if let Some(exe) = find_chrome_in_dir(&chrome_dir) {
            info!("Chrome already installed at {:?}", exe);
            return Ok(exe);
        }
    }

    if force && chrome_dir.exists() {
        info!("Removing existing Chrome installation for re-download...");
        tokio::fs::remove_dir_all(&chrome_dir).await?;
    }
    tokio::fs::create_dir_all(&chrome_dir).await?;

    info!("Downloading Chromium to {:?}...", chrome_dir);
    let options = BrowserFetcherOptions::builder()
        .with_path(&chrome_dir)
        .build()
        .map_err(|e| ScriptsiftError::ConfigError(format!("Failed to configure browser fetcher: {}", e)))?;

    let installed = BrowserFetcher::new(options)
        .fetch()
        .await
        .map_err(|e| ScriptsiftError::Browser(format!("Failed to download Chromium: {}", e)))?;

    info!("Chromium downloaded to {:?}", installed.executable_path);
    Ok(installed.executable_path)
}

/// Depth-first search of `dir` for a Chrome/Chromium executable.
fn find_chrome_in_dir(dir: &Path) -> Option<PathBuf> {
    let mut pending = vec![dir.to_path_buf()];

    while let Some(current) = pending.pop() {
        let Ok(entries) = std::fs::read_dir(&current) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().into_owned();

            // macOS bundle: the binary lives inside the .app
            if name == "Chromium.app" {
                let inner = path.join("Contents/MacOS/Chromium");
                if inner.is_file() {
                    return Some(inner);
                }
                continue;
            }
            if EXECUTABLE_NAMES.contains(&name.as_str()) && path.is_file() {
                debug!("Found managed Chrome at {:?}", path);
                return Some(path);
            }
            if path.is_dir() {
                pending.push(path);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_managed_chrome_dir() {
        let dir = managed_chrome_dir().unwrap();
        assert!(dir.ends_with(".scriptsift/chrome"));
    }

    #[test]
    fn test_find_chrome_in_nested_dir() {
        let root = tempfile::tempdir().unwrap();
        assert!(find_chrome_in_dir(root.path()).is_none());

        let nested = root.path().join("linux-1234").join("chrome-linux");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(nested.join("README"), "").unwrap();
        assert!(find_chrome_in_dir(root.path()).is_none());

        std::fs::write(nested.join("chrome"), "").unwrap();
        assert_eq!(find_chrome_in_dir(root.path()), Some(nested.join("chrome")));
    }

    #[test]
    fn test_missing_dir_is_not_an_error() {
        let root = tempfile::tempdir().unwrap();
        assert!(find_chrome_in_dir(&root.path().join("absent")).is_none());
    }
}
