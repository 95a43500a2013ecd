//! Firmware boot variables, as seen through `efibootmgr`.

use std::collections::HashMap;
use std::process::Command;

use anyhow::Result;
use efibootsync_mount::PartitionIdentity;
use efibootsync_utils::CommandRunExt;
use fn_error_context::context;
use serde::Serialize;

/// The default firmware tool.
pub const EFIBOOTMGR: &str = "efibootmgr";

/// One entry in the firmware's boot table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FirmwareBootVariable {
    /// The boot number, e.g. `0001`.
    pub id: String,
    /// The display label.
    pub label: String,
    /// Whether the variable carries the active marker.
    pub active: bool,
}

impl FirmwareBootVariable {
    /// Parse one row of `efibootmgr` output, e.g.
    /// `Boot0001* Arch Linux\tHD(1,GPT,...)/File(\vmlinuz-linux)`.
    /// Metadata rows such as `BootOrder: 0001,0000` give `None`.
    pub fn parse_row(line: &str) -> Option<Self> {
        let (token, rest) = line.trim().split_once(char::is_whitespace)?;
        let number = token.strip_prefix("Boot")?;
        let active = number.contains('*');
        let id = number.replace('*', "");
        if id.is_empty() || !id.chars().all(|c| c.is_ascii_hexdigit()) {
            return None;
        }
        // Newer efibootmgr prints the device path after a tab
        let label = rest.split('\t').next().unwrap_or_default().trim();
        if label.is_empty() {
            return None;
        }
        Some(Self {
            id,
            label: label.to_owned(),
            active,
        })
    }
}

/// The current contents of the firmware boot table.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct FirmwareState(Vec<FirmwareBootVariable>);

impl FirmwareState {
    /// Parse the full output of `efibootmgr`, skipping anything which
    /// isn't a boot variable row.
    pub fn parse(output: &str) -> Self {
        Self(
            output
                .lines()
                .filter_map(FirmwareBootVariable::parse_row)
                .collect(),
        )
    }

    /// Iterate over the variables in the order firmware listed them.
    pub fn iter(&self) -> impl Iterator<Item = &FirmwareBootVariable> {
        self.0.iter()
    }

    /// Map from boot number to label.
    pub fn by_id(&self) -> HashMap<&str, &str> {
        self.0
            .iter()
            .map(|v| (v.id.as_str(), v.label.as_str()))
            .collect()
    }

    /// Map from label to boot number.  Labels are assumed unique; if they
    /// aren't, the last one listed wins.
    pub fn by_label(&self) -> HashMap<&str, &str> {
        self.0
            .iter()
            .map(|v| (v.label.as_str(), v.id.as_str()))
            .collect()
    }
}

impl FromIterator<FirmwareBootVariable> for FirmwareState {
    fn from_iter<T: IntoIterator<Item = FirmwareBootVariable>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// A request to register a new firmware boot variable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateBootVariable {
    /// The partition holding the loader.
    pub partition: PartitionIdentity,
    /// The display label.
    pub label: String,
    /// The image to boot; passed through unvalidated.
    pub loader: Option<String>,
    /// Kernel options plus `initrd=` arguments; may be empty.
    pub args: String,
    /// Also make this the firmware's active boot choice.
    pub priority: bool,
}

/// The firmware boot-variable store.
pub trait BootVarStore {
    /// Read every boot variable.
    fn read_all(&self) -> Result<FirmwareState>;
    /// Remove the variable with boot number `id`.
    fn delete(&self, id: &str) -> Result<()>;
    /// Register a new variable.
    fn create(&self, req: &CreateBootVariable) -> Result<()>;
}

/// [`BootVarStore`] implemented by running `efibootmgr`.
#[derive(Debug, Clone)]
pub struct Efibootmgr {
    program: String,
}

impl Default for Efibootmgr {
    fn default() -> Self {
        Self::new(EFIBOOTMGR)
    }
}

impl Efibootmgr {
    /// Use `program` as the firmware tool.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn delete_command(&self, id: &str) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(["--delete-bootnum", "--bootnum", id]);
        cmd
    }

    fn create_command(&self, req: &CreateBootVariable) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.arg("--disk")
            .arg(req.partition.disk_device.as_str())
            .args(["--part", req.partition.partition_number.as_str()])
            .arg(if req.priority {
                "--create"
            } else {
                "--create-only"
            })
            .args(["--label", req.label.as_str()]);
        if let Some(loader) = req.loader.as_deref() {
            cmd.args(["--loader", loader]);
        }
        if !req.args.is_empty() {
            cmd.args(["--unicode", req.args.as_str()]);
        }
        cmd
    }
}

impl BootVarStore for Efibootmgr {
    #[context("Getting current boot entries")]
    fn read_all(&self) -> Result<FirmwareState> {
        let output = Command::new(&self.program).log_debug().run_get_string()?;
        Ok(FirmwareState::parse(&output))
    }

    #[context("Deleting Boot{id}")]
    fn delete(&self, id: &str) -> Result<()> {
        self.delete_command(id).log_debug().run_capture_stderr()
    }

    #[context("Creating {:?}", req.label)]
    fn create(&self, req: &CreateBootVariable) -> Result<()> {
        let mut cmd = self.create_command(req);
        tracing::info!("{}", cmd.to_string_pretty());
        // efibootmgr echoes the new table, which may not be valid UTF-8
        let output = cmd.run_capture_output()?;
        tracing::debug!("{}", String::from_utf8_lossy(&output.stdout).trim_end());
        Ok(())
    }
}
