//! Site-information oracle (spec.md §6): read-only queue parameters,
//! object-store endpoints, and copy-tool setup. Treated as an external
//! collaborator — we specify only the trait it must implement.

use async_trait::async_trait;
use esd_core::config::Catchall;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SiteInfoError {
    #[error("site oracle unavailable: {0}")]
    Unavailable(String),
    #[error("unknown bucket label {0:?}")]
    UnknownBucket(String),
}

#[derive(Debug, Clone)]
pub struct CopySetup {
    pub command: String,
    pub args: Vec<String>,
}

#[async_trait]
pub trait SiteInfoProvider: Send + Sync {
    async fn readpar(&self, key: &str) -> Result<Option<String>, SiteInfoError>;
    async fn get_copy_setup(&self, stage_in: bool) -> Result<CopySetup, SiteInfoError>;
    async fn get_objectstore_ddm_endpoint(&self, bucket_name: &str) -> Result<String, SiteInfoError>;
    async fn get_objectstore_bucket_id(&self, endpoint: &str) -> Result<String, SiteInfoError>;
    async fn get_objectstore_path(&self, bucket_id: &str, label: &str) -> Result<String, SiteInfoError>;
    async fn get_queuedata_file_name(&self) -> Result<String, SiteInfoError>;
    /// The raw catchall string, already parsed into a typed record
    /// (spec.md §6, Design Note §9).
    async fn catchall(&self) -> Result<Catchall, SiteInfoError>;
}

/// Site oracle backed by a pre-fetched catchall string plus a handful of
/// queue-data fields read from the site's `queuedata` file on disk.
pub struct QueuedataSiteInfo {
    raw_catchall: String,
    queuedata_file: String,
    copy_in: CopySetup,
    copy_out: CopySetup,
    ddm_endpoint: String,
    bucket_id: String,
}

impl QueuedataSiteInfo {
    pub fn new(
        raw_catchall: impl Into<String>,
        queuedata_file: impl Into<String>,
        copy_in: CopySetup,
        copy_out: CopySetup,
        ddm_endpoint: impl Into<String>,
        bucket_id: impl Into<String>,
    ) -> Self {
        Self {
            raw_catchall: raw_catchall.into(),
            queuedata_file: queuedata_file.into(),
            copy_in,
            copy_out,
            ddm_endpoint: ddm_endpoint.into(),
            bucket_id: bucket_id.into(),
        }
    }
}

#[async_trait]
impl SiteInfoProvider for QueuedataSiteInfo {
    async fn readpar(&self, key: &str) -> Result<Option<String>, SiteInfoError> {
        let catchall = Catchall::parse(&self.raw_catchall);
        Ok(catchall.get_str(key).map(str::to_string))
    }

    async fn get_copy_setup(&self, stage_in: bool) -> Result<CopySetup, SiteInfoError> {
        Ok(if stage_in { self.copy_in.clone() } else { self.copy_out.clone() })
    }

    async fn get_objectstore_ddm_endpoint(&self, _bucket_name: &str) -> Result<String, SiteInfoError> {
        Ok(self.ddm_endpoint.clone())
    }

    async fn get_objectstore_bucket_id(&self, _endpoint: &str) -> Result<String, SiteInfoError> {
        Ok(self.bucket_id.clone())
    }

    async fn get_objectstore_path(&self, bucket_id: &str, label: &str) -> Result<String, SiteInfoError> {
        Ok(format!("/{bucket_id}/{label}"))
    }

    async fn get_queuedata_file_name(&self) -> Result<String, SiteInfoError> {
        Ok(self.queuedata_file.clone())
    }

    async fn catchall(&self) -> Result<Catchall, SiteInfoError> {
        Ok(Catchall::parse(&self.raw_catchall))
    }
}

#[cfg(any(test, feature = "test-support"))]
pub mod fake {
    use super::*;

    pub struct FakeSiteInfo {
        pub raw_catchall: String,
    }

    impl FakeSiteInfo {
        pub fn new(raw_catchall: impl Into<String>) -> Self {
            Self { raw_catchall: raw_catchall.into() }
        }
    }

    #[async_trait]
    impl SiteInfoProvider for FakeSiteInfo {
        async fn readpar(&self, key: &str) -> Result<Option<String>, SiteInfoError> {
            Ok(Catchall::parse(&self.raw_catchall).get_str(key).map(str::to_string))
        }

        async fn get_copy_setup(&self, _stage_in: bool) -> Result<CopySetup, SiteInfoError> {
            Ok(CopySetup { command: "true".into(), args: vec![] })
        }

        async fn get_objectstore_ddm_endpoint(
            &self,
            _bucket_name: &str,
        ) -> Result<String, SiteInfoError> {
            Ok("TEST_DDM_ENDPOINT".into())
        }

        async fn get_objectstore_bucket_id(&self, _endpoint: &str) -> Result<String, SiteInfoError> {
            Ok("bucket-test".into())
        }

        async fn get_objectstore_path(
            &self,
            bucket_id: &str,
            label: &str,
        ) -> Result<String, SiteInfoError> {
            Ok(format!("/{bucket_id}/{label}"))
        }

        async fn get_queuedata_file_name(&self) -> Result<String, SiteInfoError> {
            Ok("queuedata.json".into())
        }

        async fn catchall(&self) -> Result<Catchall, SiteInfoError> {
            Ok(Catchall::parse(&self.raw_catchall))
        }
    }
}
