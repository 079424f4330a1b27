//! Command-line arguments (spec.md §5).

use clap::Parser;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "esd-driver", about = "HPC event-service pilot driver")]
pub struct Args {
    /// Path to the JSON-encoded bootstrap job descriptor. Ignored on
    /// `--recover`.
    #[arg(long)]
    pub job_def: PathBuf,

    /// The pilot's own scratch directory: checkpoints, recovery
    /// snapshots, and batch markers live here.
    #[arg(long)]
    pub workdir: PathBuf,

    /// Resume from the checkpoints already present in `workdir` instead
    /// of claiming a fresh bootstrap job.
    #[arg(long, default_value_t = false)]
    pub recover: bool,

    /// Base URL of the dispatcher's HTTP/JSON endpoint.
    #[arg(long)]
    pub dispatcher_url: String,

    /// Raw `key=value,...` catchall string (spec.md §6).
    #[arg(long, default_value = "")]
    pub catchall: String,

    /// Path to the site's queuedata file, copied into every job's
    /// working directory during setup.
    #[arg(long)]
    pub queuedata_file: Option<PathBuf>,

    #[arg(long, default_value = "UNKNOWN_DDM_ENDPOINT")]
    pub ddm_endpoint: String,

    #[arg(long, default_value = "UNKNOWN_BUCKET")]
    pub bucket_id: String,

    /// Root directory for the filesystem-backed object store. Swap for
    /// a real object-store adapter at deployment time.
    #[arg(long)]
    pub objectstore_root: PathBuf,

    #[arg(long, default_value = "lcg-cp")]
    pub mover_get_command: String,

    #[arg(long, default_value = "lcg-cp")]
    pub mover_put_command: String,

    #[arg(long, default_value = "qsub")]
    pub hpc_submit_command: String,

    #[arg(long, default_value = "qstat")]
    pub hpc_poll_command: String,

    /// Total cores granted by the allocation, divided evenly across
    /// claimed jobs (spec.md §4.2 step 5).
    #[arg(long, default_value_t = 1)]
    pub total_cores: u32,

    #[arg(long, default_value = "info")]
    pub log_filter: String,
}
