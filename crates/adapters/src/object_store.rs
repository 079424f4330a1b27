//! Object store (spec.md §1, §6): a bucket-addressed remote blob store
//! identified by `(endpoint, bucketId)`. Interface only.

use async_trait::async_trait;
use esd_core::error::DriverError;
use std::path::Path;
use url::Url;

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Upload `local_path` to `bucket` under `label`, returning the
    /// resulting URL. Errors surface as `PutTimeout`/`Unknown`.
    async fn put(&self, local_path: &Path, bucket: &str, label: &str) -> Result<Url, DriverError>;
}

/// Filesystem-backed object store for dry runs and local development:
/// copies into `root/<bucket>/<label>` instead of talking to a remote
/// service.
pub struct LocalObjectStore {
    pub root: std::path::PathBuf,
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn put(&self, local_path: &Path, bucket: &str, label: &str) -> Result<Url, DriverError> {
        let dest_dir = self.root.join(bucket);
        tokio::fs::create_dir_all(&dest_dir)
            .await
            .map_err(|e| DriverError::Unknown { reason: e.to_string() })?;
        let dest = dest_dir.join(label);
        tokio::fs::copy(local_path, &dest)
            .await
            .map_err(|e| DriverError::PutTimeout { path: local_path.display().to_string(), elapsed_s: 0 })?;
        Url::from_file_path(&dest).map_err(|_| DriverError::Unknown {
            reason: format!("could not build a file:// URL for {}", dest.display()),
        })
    }
}

#[cfg(any(test, feature = "test-support"))]
pub mod fake {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    pub struct FakeObjectStore {
        pub uploads: Mutex<Vec<(String, String, String)>>,
        pub fail_labels: Mutex<std::collections::HashSet<String>>,
    }

    #[async_trait]
    impl ObjectStore for FakeObjectStore {
        async fn put(&self, local_path: &Path, bucket: &str, label: &str) -> Result<Url, DriverError> {
            if self.fail_labels.lock().contains(label) {
                return Err(DriverError::PutTimeout {
                    path: local_path.display().to_string(),
                    elapsed_s: 1,
                });
            }
            self.uploads.lock().push((
                local_path.display().to_string(),
                bucket.to_string(),
                label.to_string(),
            ));
            Url::parse(&format!("fake://{bucket}/{label}"))
                .map_err(|e| DriverError::Unknown { reason: e.to_string() })
        }
    }
}
