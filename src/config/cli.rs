use crate::core::Storage;
use crate::utils::error::{FetchError, Result};
use std::path::{Path, PathBuf};

/// Writes raw report files under a base directory on the local disk.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    base_path: PathBuf,
}

impl LocalStorage {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }
}

impl Storage for LocalStorage {
    async fn write_file(&self, path: &str, data: &[u8]) -> Result<String> {
        let full_path = self.base_path.join(path);
        let persistence_error = |source| FetchError::PersistenceError {
            path: full_path.display().to_string(),
            source,
        };

        if let Some(parent) = full_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(persistence_error)?;
        }

        // 同名檔案直接覆寫
        tokio::fs::write(&full_path, data)
            .await
            .map_err(persistence_error)?;

        tracing::debug!("Wrote {} bytes to {}", data.len(), full_path.display());
        Ok(full_path.display().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_write_creates_directories() {
        let temp_dir = TempDir::new().unwrap();
        let storage = LocalStorage::new(temp_dir.path().join("nested/out"));

        let written = storage
            .write_file("xero_data_trial_balance_20250819_raw.json", b"{}")
            .await
            .unwrap();

        assert!(written.ends_with("xero_data_trial_balance_20250819_raw.json"));
        assert_eq!(
            std::fs::read(
                temp_dir
                    .path()
                    .join("nested/out/xero_data_trial_balance_20250819_raw.json")
            )
            .unwrap(),
            b"{}"
        );
    }

    #[tokio::test]
    async fn test_unwritable_location_is_persistence_error() {
        let temp_dir = TempDir::new().unwrap();
        let blocker = temp_dir.path().join("blocker");
        std::fs::write(&blocker, b"not a directory").unwrap();

        // base path 是一般檔案，無法在底下建立檔案
        let storage = LocalStorage::new(&blocker);
        let err = storage.write_file("report.json", b"{}").await.unwrap_err();
        assert!(matches!(err, FetchError::PersistenceError { .. }));
    }
}
