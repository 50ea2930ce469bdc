//! Async filesystem helpers shared by the transcript store and worktree
//! cleanup paths, mapping IO failures onto the crate's domain errors.

use std::path::{Path, PathBuf};

use tokio::fs;

use crate::error::{Error, ErrorCode, Result};

pub struct FsUtils;

impl FsUtils {
    pub fn build_path(base: &Path, segments: &[&str]) -> PathBuf {
        let mut path = base.to_path_buf();
        for segment in segments {
            path.push(segment);
        }
        path
    }

    pub async fn ensure_dir_exists(path: &Path) -> Result<()> {
        if !path.exists() {
            fs::create_dir_all(path)
                .await
                .map_err(|e| Error::write_failed(format!("create dir {}", path.display())).with_source(e))?;
        }
        Ok(())
    }

    pub async fn save_json<T: serde::Serialize>(data: &T, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(data)
            .map_err(|e| Error::new(ErrorCode::WriteFailed, "serialize json").with_source(e))?;
        Self::write_file(path, &content).await
    }

    pub async fn load_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| Error::write_failed(format!("read {}", path.display())).with_source(e))?;
        serde_json::from_str(&content)
            .map_err(|e| Error::new(ErrorCode::WriteFailed, "parse json").with_source(e))
    }

    pub async fn write_file(path: &Path, content: &str) -> Result<()> {
        fs::write(path, content)
            .await
            .map_err(|e| Error::write_failed(format!("write {}", path.display())).with_source(e))
    }

    pub async fn remove_dir_all(path: &Path) -> Result<()> {
        if path.exists() {
            fs::remove_dir_all(path)
                .await
                .map_err(|e| Error::write_failed(format!("remove {}", path.display())).with_source(e))?;
        }
        Ok(())
    }
}
