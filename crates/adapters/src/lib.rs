#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! esd-adapters: external collaborators the driver talks to — the
//! dispatcher, the site-information oracle, site movers, the object
//! store, and the HPC batch back-end (spec.md §6).

pub mod container;
pub mod dispatcher;
pub mod hpc_manager;
pub mod mover;
pub mod object_store;
pub mod site_info;

pub use container::{build_singularity_command, ContainerSpec};
pub use dispatcher::{DispatcherClient, DispatcherClientError, HttpDispatcherClient};
pub use hpc_manager::{
    FreeResources, HpcJobLog, HpcJobSpec, HpcJobState, HpcManager, HpcManagerCheckpoint, HpcOutput,
    PbsHpcManager,
};
pub use mover::{watchdog_timeout, ExternalCommandMover, Mover, MoverFactory};
pub use object_store::{LocalObjectStore, ObjectStore};
pub use site_info::{CopySetup, QueuedataSiteInfo, SiteInfoError, SiteInfoProvider};

#[cfg(any(test, feature = "test-support"))]
pub use dispatcher::fake::FakeDispatcher;
#[cfg(any(test, feature = "test-support"))]
pub use hpc_manager::fake::FakeHpcManager;
#[cfg(any(test, feature = "test-support"))]
pub use mover::fake::FakeMover;
#[cfg(any(test, feature = "test-support"))]
pub use object_store::fake::FakeObjectStore;
#[cfg(any(test, feature = "test-support"))]
pub use site_info::fake::FakeSiteInfo;
