//! Helpers for interacting with mountpoints and the block devices
//! backing them.

use std::collections::BTreeMap;
use std::process::Command;

use anyhow::{anyhow, Result};
use camino::{Utf8Path, Utf8PathBuf};
use efibootsync_utils::CommandRunExt;
use fn_error_context::context;
use serde::Deserialize;

/// Columns requested from `lsblk`.
const LSBLK_COLUMNS: &str = "MOUNTPOINT,LABEL,NAME,PKNAME,KNAME";

/// One node of the `lsblk --json` device tree.
#[derive(Deserialize, Debug)]
#[serde(rename_all = "kebab-case")]
#[allow(missing_docs)]
pub struct Device {
    pub name: String,
    pub kname: Option<String>,
    pub pkname: Option<String>,
    pub label: Option<String>,
    pub mountpoint: Option<String>,
    pub children: Option<Vec<Device>>,
}

impl Device {
    /// The kernel name of the device, falling back to the display name.
    pub fn kernel_name(&self) -> &str {
        self.kname.as_deref().unwrap_or(&self.name)
    }
}

/// Toplevel `lsblk --json` output.
#[derive(Deserialize, Debug)]
pub struct DeviceList {
    /// Whole disks; partitions and stacked devices are in `children`.
    pub blockdevices: Vec<Device>,
}

/// Facts about one mounted filesystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountInfo {
    /// Where the filesystem is mounted.
    pub mount_path: Utf8PathBuf,
    /// Kernel name of the block device holding the filesystem, e.g. `sda2`.
    pub partition_device: String,
    /// Kernel name of the owning disk, e.g. `sda`.
    pub parent_device: String,
    /// Filesystem label, if any.
    pub label: Option<String>,
}

/// Mapping from mount path to the device facts for that mount.
#[derive(Debug, Default, Clone)]
pub struct MountTable(BTreeMap<Utf8PathBuf, MountInfo>);

impl MountTable {
    /// Flatten an `lsblk` device tree.  Only devices which are mounted
    /// and have a parent device are recorded; pseudo mountpoints such
    /// as `[SWAP]` are skipped.
    pub fn from_devices(devices: &DeviceList) -> Self {
        fn walk(devices: &[Device], table: &mut BTreeMap<Utf8PathBuf, MountInfo>) {
            for dev in devices {
                match (dev.mountpoint.as_deref(), dev.pkname.as_deref()) {
                    (Some(mnt), Some(parent)) if mnt.starts_with('/') => {
                        let info = MountInfo {
                            mount_path: mnt.into(),
                            partition_device: dev.kernel_name().to_owned(),
                            parent_device: parent.to_owned(),
                            label: dev.label.clone(),
                        };
                        table.insert(info.mount_path.clone(), info);
                    }
                    (Some(mnt), None) => {
                        tracing::trace!("Skipping {mnt} on {}: no parent device", dev.name);
                    }
                    _ => {}
                }
                if let Some(children) = dev.children.as_deref() {
                    walk(children, table);
                }
            }
        }

        let mut table = BTreeMap::new();
        walk(&devices.blockdevices, &mut table);
        Self(table)
    }

    /// Look up a single mount path.
    pub fn get(&self, path: impl AsRef<Utf8Path>) -> Option<&MountInfo> {
        self.0.get(path.as_ref())
    }

    /// Return the first candidate which is a mountpoint.
    pub fn resolve<P: AsRef<Utf8Path>>(&self, candidates: &[P]) -> Option<&MountInfo> {
        candidates.iter().find_map(|c| self.get(c))
    }
}

impl FromIterator<MountInfo> for MountTable {
    fn from_iter<T: IntoIterator<Item = MountInfo>>(iter: T) -> Self {
        Self(
            iter.into_iter()
                .map(|m| (m.mount_path.clone(), m))
                .collect(),
        )
    }
}

/// Source of the live mount table.
pub trait MountInspector {
    /// Query the system once and return every mounted block device.
    fn mount_table(&self) -> Result<MountTable>;
}

/// Queries the mount table via `lsblk --json`.
#[derive(Debug, Default)]
pub struct Lsblk;

impl MountInspector for Lsblk {
    #[context("Querying block devices")]
    fn mount_table(&self) -> Result<MountTable> {
        let devices: DeviceList = Command::new("lsblk")
            .args(["-J", "--output", LSBLK_COLUMNS])
            .log_debug()
            .run_and_parse_json()?;
        Ok(MountTable::from_devices(&devices))
    }
}

/// Find the boot partition among `candidates`, in order.  Failing to
/// find any of them is fatal for the caller.
#[context("Resolving boot mount")]
pub fn resolve_boot_mount<P: AsRef<Utf8Path>>(
    inspector: &dyn MountInspector,
    candidates: &[P],
) -> Result<MountInfo> {
    let table = inspector.mount_table()?;
    let found = table.resolve(candidates).cloned().ok_or_else(|| {
        let tried = candidates
            .iter()
            .map(|c| c.as_ref().as_str())
            .collect::<Vec<_>>()
            .join(", ");
        anyhow!("Cannot determine boot mount (tried: {tried})")
    })?;
    tracing::debug!(
        "Boot mount {} on {} (disk {}, label {:?})",
        found.mount_path,
        found.partition_device,
        found.parent_device,
        found.label
    );
    Ok(found)
}

/// Where firmware finds the loader: a disk and a partition number on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionIdentity {
    /// Full path to the disk, e.g. `/dev/sda`.
    pub disk_device: Utf8PathBuf,
    /// Partition number on that disk; always non-empty and numeric.
    pub partition_number: String,
}

impl PartitionIdentity {
    /// Derive the identity for a mounted partition.
    #[context("Deriving partition number of {}", mount.partition_device)]
    pub fn from_mount(mount: &MountInfo) -> Result<Self> {
        let partition_number = partition_number(&mount.parent_device, &mount.partition_device);
        if partition_number.is_empty() {
            anyhow::bail!(
                "Cannot derive a partition number from {} on {}",
                mount.partition_device,
                mount.parent_device
            );
        }
        Ok(Self {
            disk_device: device_path(&mount.parent_device),
            partition_number,
        })
    }
}

fn device_name(dev: &str) -> &str {
    dev.strip_prefix("/dev/").unwrap_or(dev)
}

fn device_path(dev: &str) -> Utf8PathBuf {
    Utf8Path::new("/dev").join(device_name(dev))
}

/// Strip the parent name from the partition name and keep the digits,
/// e.g. `sda` + `sda2` gives `2` and `nvme0n1` + `nvme0n1p3` gives `3`.
/// Returns an empty string if there are no digits left.
pub fn partition_number(parent: &str, partition: &str) -> String {
    let parent = device_name(parent);
    let partition = device_name(partition);
    partition
        .strip_prefix(parent)
        .unwrap_or(partition)
        .chars()
        .filter(char::is_ascii_digit)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const LSBLK_FIXTURE: &str = indoc::indoc! { r#"
        {
           "blockdevices": [
              {
                 "mountpoint": null, "label": null, "name": "nvme0n1", "pkname": null, "kname": "nvme0n1",
                 "children": [
                    {"mountpoint": "/efi", "label": "ESP", "name": "nvme0n1p1", "pkname": "nvme0n1", "kname": "nvme0n1p1"},
                    {
                       "mountpoint": null, "label": "cryptroot", "name": "nvme0n1p2", "pkname": "nvme0n1", "kname": "nvme0n1p2",
                       "children": [
                          {"mountpoint": "/", "label": "root", "name": "luks-root", "pkname": "nvme0n1p2", "kname": "dm-0"}
                       ]
                    }
                 ]
              },
              {
                 "mountpoint": "/mnt/raw", "label": null, "name": "sdb", "pkname": null, "kname": "sdb"
              },
              {
                 "mountpoint": null, "label": null, "name": "sda", "pkname": null, "kname": "sda",
                 "children": [
                    {"mountpoint": "[SWAP]", "label": null, "name": "sda1", "pkname": "sda", "kname": "sda1"},
                    {"mountpoint": "/boot", "label": "BOOT", "name": "sda2", "pkname": "sda", "kname": "sda2"}
                 ]
              }
           ]
        }
    "# };

    fn fixture() -> MountTable {
        let devices: DeviceList = serde_json::from_str(LSBLK_FIXTURE).unwrap();
        MountTable::from_devices(&devices)
    }

    #[test]
    fn test_from_devices() {
        let table = fixture();
        let efi = table.get("/efi").unwrap();
        similar_asserts::assert_eq!(
            efi,
            &MountInfo {
                mount_path: "/efi".into(),
                partition_device: "nvme0n1p1".into(),
                parent_device: "nvme0n1".into(),
                label: Some("ESP".into()),
            }
        );
        // Nested children are walked
        assert_eq!(table.get("/").unwrap().partition_device, "dm-0");
        // Unpartitioned disks and swap are not recorded
        assert!(table.get("/mnt/raw").is_none());
        assert!(table.get("[SWAP]").is_none());
    }

    #[test]
    fn test_resolve_order() {
        let table = fixture();
        let found = table.resolve(&["/boot", "/efi"]).unwrap();
        assert_eq!(found.mount_path, "/boot");
        let found = table.resolve(&["/efi", "/boot"]).unwrap();
        assert_eq!(found.mount_path, "/efi");
        let found = table.resolve(&["/nonexistent", "/efi"]).unwrap();
        assert_eq!(found.mount_path, "/efi");
        assert!(table.resolve(&["/nonexistent"]).is_none());
        assert!(table.resolve::<&str>(&[]).is_none());
    }

    #[derive(Debug)]
    struct Fixed(MountTable);

    impl MountInspector for Fixed {
        fn mount_table(&self) -> Result<MountTable> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn test_resolve_boot_mount() {
        let inspector = Fixed(fixture());
        let found = resolve_boot_mount(&inspector, &["/boot", "/efi"]).unwrap();
        assert_eq!(found.partition_device, "sda2");

        let e = resolve_boot_mount(&inspector, &["/nope", "/also-nope"]).unwrap_err();
        let msg = format!("{e:#}");
        assert!(msg.contains("Cannot determine boot mount"), "{msg}");
        assert!(msg.contains("/also-nope"), "{msg}");
    }

    #[test]
    fn test_partition_number() {
        assert_eq!(partition_number("/dev/sda", "/dev/sda2"), "2");
        assert_eq!(partition_number("sda", "sda2"), "2");
        assert_eq!(partition_number("nvme0n1", "nvme0n1p3"), "3");
        assert_eq!(partition_number("mmcblk0", "mmcblk0p12"), "12");
        assert_eq!(partition_number("sda", "sdab"), "");
    }

    #[test]
    fn test_partition_identity() -> Result<()> {
        let table = fixture();
        let ident = PartitionIdentity::from_mount(table.get("/efi").unwrap())?;
        similar_asserts::assert_eq!(
            ident,
            PartitionIdentity {
                disk_device: "/dev/nvme0n1".into(),
                partition_number: "1".into(),
            }
        );

        let bad = MountInfo {
            mount_path: "/boot".into(),
            partition_device: "sdab".into(),
            parent_device: "sda".into(),
            label: None,
        };
        assert!(PartitionIdentity::from_mount(&bad).is_err());
        Ok(())
    }
}
