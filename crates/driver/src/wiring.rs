//! Concrete adapter wiring (spec.md §6): turns CLI args into the trait
//! objects `esd-engine` drives. No process-wide globals; everything is
//! dependency-injected from here.

use crate::cli::Args;
use esd_adapters::{
    CopySetup, ExternalCommandMover, HttpDispatcherClient, LocalObjectStore, PbsHpcManager,
    QueuedataSiteInfo,
};
use esd_core::error::DriverError;
use esd_core::job::JobDescriptor;
use std::path::Path;
use std::sync::Arc;

pub struct Adapters {
    pub dispatcher: Arc<HttpDispatcherClient>,
    pub site_info: Arc<QueuedataSiteInfo>,
    pub mover: Arc<ExternalCommandMover>,
    pub object_store: Arc<LocalObjectStore>,
    pub hpc_manager: Arc<PbsHpcManager>,
}

pub fn build_adapters(args: &Args) -> Adapters {
    let queuedata_file_name = args
        .queuedata_file
        .as_ref()
        .and_then(|p| p.file_name())
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "queuedata.json".to_string());

    let site_info = Arc::new(QueuedataSiteInfo::new(
        args.catchall.clone(),
        queuedata_file_name,
        CopySetup { command: args.mover_get_command.clone(), args: vec![] },
        CopySetup { command: args.mover_put_command.clone(), args: vec![] },
        args.ddm_endpoint.clone(),
        args.bucket_id.clone(),
    ));

    Adapters {
        dispatcher: Arc::new(HttpDispatcherClient::new(args.dispatcher_url.clone())),
        site_info,
        mover: Arc::new(ExternalCommandMover {
            get_command: args.mover_get_command.clone(),
            put_command: args.mover_put_command.clone(),
        }),
        object_store: Arc::new(LocalObjectStore { root: args.objectstore_root.clone() }),
        hpc_manager: Arc::new(PbsHpcManager::new(
            args.hpc_submit_command.clone(),
            args.hpc_poll_command.clone(),
            args.workdir.join("batch_markers"),
        )),
    }
}

pub fn read_job_descriptor(path: &Path) -> Result<JobDescriptor, DriverError> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| DriverError::Unknown { reason: format!("reading job descriptor {}: {e}", path.display()) })?;
    serde_json::from_str(&raw)
        .map_err(|e| DriverError::Unknown { reason: format!("parsing job descriptor {}: {e}", path.display()) })
}
