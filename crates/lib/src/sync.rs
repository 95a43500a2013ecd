//! The end-to-end synchronization run.

use anyhow::{Context, Result};
use cap_std_ext::cap_std::{self, fs::Dir};
use efibootsync_mount::{resolve_boot_mount, MountInfo, MountInspector, PartitionIdentity};
use fn_error_context::context;

use crate::catalog::BootCatalog;
use crate::config::Config;
use crate::firmware::BootVarStore;
use crate::reconcile::{self, ApplySummary, FirmwareOperation};

/// The result of a synchronization run.
#[derive(Debug)]
pub struct SyncOutcome {
    /// The planned operations, in the order they were (or would be) issued.
    pub operations: Vec<FirmwareOperation>,
    /// `None` for a dry run.
    pub summary: Option<ApplySummary>,
}

/// Find the boot mount and read the catalog from it.
#[context("Loading catalog")]
pub fn load_catalog(
    config: &Config,
    mounts: &dyn MountInspector,
) -> Result<(MountInfo, BootCatalog)> {
    let mount = resolve_boot_mount(mounts, &config.boot_mount_candidates)?;
    let boot = Dir::open_ambient_dir(&mount.mount_path, cap_std::ambient_authority())
        .with_context(|| format!("Opening {}", mount.mount_path))?;
    let catalog = BootCatalog::load(&boot)?;
    Ok((mount, catalog))
}

/// Make the firmware boot table match the entries in the boot partition.
///
/// Failing to find the boot partition or to read the firmware table is
/// an error, and nothing is mutated.  Failures of individual firmware
/// operations are only logged.
#[context("Synchronizing boot entries")]
pub fn sync(
    config: &Config,
    mounts: &dyn MountInspector,
    store: &dyn BootVarStore,
    dry_run: bool,
) -> Result<SyncOutcome> {
    let (mount, catalog) = load_catalog(config, mounts)?;
    let partition = PartitionIdentity::from_mount(&mount)?;
    tracing::debug!(
        "Using {} partition {} for {} entries",
        partition.disk_device,
        partition.partition_number,
        catalog.len()
    );
    let state = store.read_all()?;
    let operations = reconcile::plan(&catalog, &partition, &state);
    if operations.is_empty() {
        tracing::info!("No boot entries in {}", mount.mount_path);
    }
    let summary = if dry_run {
        None
    } else {
        Some(reconcile::apply(&operations, store))
    };
    Ok(SyncOutcome {
        operations,
        summary,
    })
}
