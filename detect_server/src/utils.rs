//! Utility functions
//!
use std::{
    fs::{self, File},
    io::Cursor,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use reqwest::Client;
use simple_error::simple_error;

/// Download a file from a URL to a given filepath.
///
/// The file only appears at `filepath` once the download completed.
pub async fn download_file(client: &Client, url: &str, filepath: impl AsRef<Path>) -> Result<()> {
    let filepath = filepath.as_ref();
    let resp = client.get(url).send().await?.error_for_status()?;

    let partial = filepath.with_extension("part");
    {
        let mut file = File::create(&partial)
            .with_context(|| format!("failed to create {partial:?}"))?;
        let mut content = Cursor::new(resp.bytes().await?);
        std::io::copy(&mut content, &mut file)?;
    }
    fs::rename(&partial, filepath)?;

    Ok(())
}

/// Path of `file_name` in this application's cache directory, which is
/// created if missing.
pub fn cache_path(file_name: &str) -> Result<PathBuf> {
    let dir = dirs::cache_dir()
        .ok_or_else(|| simple_error!("no cache directory on this platform"))?
        .join("detect_server");
    fs::create_dir_all(&dir).with_context(|| format!("failed to create {dir:?}"))?;

    Ok(dir.join(file_name))
}
