//! Compute and apply the firmware mutations which make the firmware boot
//! table match the catalog.
//!
//! Entries are matched to firmware variables purely by label.  A variable
//! whose label matches a catalog title is always deleted and recreated, so
//! applying the same plan twice converges to the same state.  Variables
//! whose label matches no title are left alone; renaming an entry thus
//! orphans the old variable.

use std::fmt;

use efibootsync_mount::PartitionIdentity;

use crate::catalog::BootCatalog;
use crate::firmware::{BootVarStore, CreateBootVariable, FirmwareState};

/// A single mutation of the firmware boot table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FirmwareOperation {
    /// Remove an existing variable.
    Delete {
        /// The boot number.
        id: String,
        /// Its label, for diagnostics.
        label: String,
    },
    /// Register a new variable.
    Create(CreateBootVariable),
}

impl fmt::Display for FirmwareOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FirmwareOperation::Delete { id, label } => write!(f, "delete Boot{id} ({label:?})"),
            FirmwareOperation::Create(req) => {
                write!(
                    f,
                    "create {:?} on {} partition {}",
                    req.label, req.partition.disk_device, req.partition.partition_number
                )?;
                if let Some(loader) = req.loader.as_deref() {
                    write!(f, " loader {loader}")?;
                }
                if !req.args.is_empty() {
                    write!(f, " args {:?}", req.args)?;
                }
                if req.priority {
                    f.write_str(" (default)")?;
                }
                Ok(())
            }
        }
    }
}

/// Plan the operations for `catalog`, in catalog order.  For each entry
/// a stale variable with the same label is deleted immediately before
/// the replacement is created.
pub fn plan(
    catalog: &BootCatalog,
    partition: &PartitionIdentity,
    state: &FirmwareState,
) -> Vec<FirmwareOperation> {
    let by_label = state.by_label();
    let mut ops = Vec::with_capacity(catalog.len() * 2);
    for entry in catalog.iter() {
        if let Some(id) = by_label.get(entry.title.as_str()) {
            ops.push(FirmwareOperation::Delete {
                id: (*id).to_owned(),
                label: entry.title.clone(),
            });
        }
        ops.push(FirmwareOperation::Create(CreateBootVariable {
            partition: partition.clone(),
            label: entry.title.clone(),
            loader: entry.loader_path.clone(),
            args: entry.kernel_args(),
            priority: entry.is_default,
        }));
    }
    ops
}

/// Counts of applied operations.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ApplySummary {
    /// Operations which succeeded.
    pub succeeded: usize,
    /// Operations which failed and were logged.
    pub failed: usize,
}

/// Issue `ops` against `store` in order.  A failing operation is logged
/// and does not stop the remaining ones.
pub fn apply(ops: &[FirmwareOperation], store: &dyn BootVarStore) -> ApplySummary {
    let mut summary = ApplySummary::default();
    for op in ops {
        let r = match op {
            FirmwareOperation::Delete { id, label } => {
                tracing::info!("Label exists {label} {id}");
                store.delete(id)
            }
            FirmwareOperation::Create(req) => store.create(req),
        };
        match r {
            Ok(()) => summary.succeeded += 1,
            Err(e) => {
                tracing::error!("Failed to {op}: {e:#}");
                summary.failed += 1;
            }
        }
    }
    summary
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use anyhow::Result;

    use super::*;
    use crate::catalog::EntryFile;
    use crate::firmware::FirmwareBootVariable;

    fn catalog() -> BootCatalog {
        let files = [
            (
                "arch.conf",
                "title Arch Linux\nlinux /vmlinuz-linux\ninitrd /initramfs-linux.img\noptions root=/dev/sda2 rw\n",
            ),
            (
                "windows.conf",
                "title Windows Boot Manager\nefi /EFI/Microsoft/Boot/bootmgfw.efi\n",
            ),
        ];
        BootCatalog::build(
            files.map(|(name, content)| EntryFile {
                name: name.into(),
                content: content.into(),
            }),
            Some("arch"),
        )
    }

    fn partition() -> PartitionIdentity {
        PartitionIdentity {
            disk_device: "/dev/sda".into(),
            partition_number: "2".into(),
        }
    }

    fn var(id: &str, label: &str) -> FirmwareBootVariable {
        FirmwareBootVariable {
            id: id.into(),
            label: label.into(),
            active: true,
        }
    }

    fn created(ops: &[FirmwareOperation]) -> Vec<&CreateBootVariable> {
        ops.iter()
            .filter_map(|op| match op {
                FirmwareOperation::Create(req) => Some(req),
                FirmwareOperation::Delete { .. } => None,
            })
            .collect()
    }

    #[test]
    fn test_plan_fresh() {
        let ops = plan(&catalog(), &partition(), &FirmwareState::default());
        similar_asserts::assert_eq!(
            ops,
            vec![
                FirmwareOperation::Create(CreateBootVariable {
                    partition: partition(),
                    label: "Arch Linux".into(),
                    loader: Some("/vmlinuz-linux".into()),
                    args: "root=/dev/sda2 rw initrd=/initramfs-linux.img".into(),
                    priority: true,
                }),
                FirmwareOperation::Create(CreateBootVariable {
                    partition: partition(),
                    label: "Windows Boot Manager".into(),
                    loader: Some("/EFI/Microsoft/Boot/bootmgfw.efi".into()),
                    args: String::new(),
                    priority: false,
                }),
            ]
        );
    }

    #[test]
    fn test_plan_deletes_before_create() {
        let state: FirmwareState = [
            var("0000", "Windows Boot Manager"),
            var("0004", "Arch Linux"),
            var("0005", "Other"),
        ]
        .into_iter()
        .collect();
        let ops = plan(&catalog(), &partition(), &state);
        assert_eq!(ops.len(), 4);
        assert_eq!(
            ops[0],
            FirmwareOperation::Delete {
                id: "0004".into(),
                label: "Arch Linux".into()
            }
        );
        assert!(matches!(&ops[1], FirmwareOperation::Create(r) if r.label == "Arch Linux"));
        assert_eq!(
            ops[2],
            FirmwareOperation::Delete {
                id: "0000".into(),
                label: "Windows Boot Manager".into()
            }
        );
        assert!(
            matches!(&ops[3], FirmwareOperation::Create(r) if r.label == "Windows Boot Manager")
        );
        // Unrelated variables are never touched
        assert!(!ops.iter().any(|op| op.to_string().contains("Other")));
    }

    #[test]
    fn test_plan_empty_catalog() {
        let state: FirmwareState = [var("0001", "Arch Linux")].into_iter().collect();
        assert!(plan(&BootCatalog::default(), &partition(), &state).is_empty());
    }

    #[test]
    fn test_plan_without_loader() {
        let catalog = BootCatalog::build(
            [EntryFile {
                name: "bare.conf".into(),
                content: b"title Bare\n".to_vec(),
            }],
            None,
        );
        let ops = plan(&catalog, &partition(), &FirmwareState::default());
        let reqs = created(&ops);
        assert_eq!(reqs.len(), 1);
        assert_eq!(reqs[0].loader, None);
        assert!(reqs[0].priority);
    }

    /// An in-memory firmware table which hands out sequential boot numbers.
    #[derive(Debug, Default)]
    struct FakeFirmware {
        vars: RefCell<Vec<FirmwareBootVariable>>,
        next: RefCell<u16>,
        fail_create: Option<&'static str>,
    }

    impl BootVarStore for FakeFirmware {
        fn read_all(&self) -> Result<FirmwareState> {
            Ok(self.vars.borrow().iter().cloned().collect())
        }

        fn delete(&self, id: &str) -> Result<()> {
            let mut vars = self.vars.borrow_mut();
            let before = vars.len();
            vars.retain(|v| v.id != id);
            anyhow::ensure!(vars.len() < before, "No such variable Boot{id}");
            Ok(())
        }

        fn create(&self, req: &CreateBootVariable) -> Result<()> {
            if self.fail_create == Some(req.label.as_str()) {
                anyhow::bail!("injected failure");
            }
            let mut next = self.next.borrow_mut();
            self.vars.borrow_mut().push(FirmwareBootVariable {
                id: format!("{:04X}", *next),
                label: req.label.clone(),
                active: req.priority,
            });
            *next += 1;
            Ok(())
        }
    }

    fn labels(store: &FakeFirmware) -> Vec<String> {
        let mut r: Vec<_> = store.vars.borrow().iter().map(|v| v.label.clone()).collect();
        r.sort();
        r
    }

    #[test]
    fn test_apply_idempotent() -> Result<()> {
        let store = FakeFirmware::default();
        let catalog = catalog();

        let first = plan(&catalog, &partition(), &store.read_all()?);
        let summary = apply(&first, &store);
        assert_eq!(summary, ApplySummary { succeeded: 2, failed: 0 });
        assert_eq!(labels(&store), ["Arch Linux", "Windows Boot Manager"]);

        let second = plan(&catalog, &partition(), &store.read_all()?);
        assert_eq!(second.len(), 4);
        // Same content is recreated
        assert_eq!(created(&first), created(&second));
        let summary = apply(&second, &store);
        assert_eq!(summary, ApplySummary { succeeded: 4, failed: 0 });
        // No growth
        assert_eq!(labels(&store), ["Arch Linux", "Windows Boot Manager"]);
        Ok(())
    }

    #[test]
    fn test_apply_continues_after_failure() -> Result<()> {
        let store = FakeFirmware {
            fail_create: Some("Arch Linux"),
            ..Default::default()
        };
        let ops = plan(&catalog(), &partition(), &store.read_all()?);
        let summary = apply(&ops, &store);
        assert_eq!(summary, ApplySummary { succeeded: 1, failed: 1 });
        assert_eq!(labels(&store), ["Windows Boot Manager"]);
        Ok(())
    }

    #[test]
    fn test_display() {
        let ops = plan(&catalog(), &partition(), &FirmwareState::default());
        assert_eq!(
            ops[0].to_string(),
            r#"create "Arch Linux" on /dev/sda partition 2 loader /vmlinuz-linux args "root=/dev/sda2 rw initrd=/initramfs-linux.img" (default)"#
        );
        let del = FirmwareOperation::Delete {
            id: "0003".into(),
            label: "Arch Linux".into(),
        };
        assert_eq!(del.to_string(), r#"delete Boot0003 ("Arch Linux")"#);
    }
}
