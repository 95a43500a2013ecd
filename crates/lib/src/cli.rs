//! # Synchronize bootloader entries into firmware boot variables
//!
//! Command line tool which registers each bootloader entry directly with
//! the firmware, so it can boot without going through the bootloader.

use std::ffi::OsString;
use std::io::Write as _;

use anyhow::{ensure, Result};
use camino::Utf8PathBuf;
use clap::Parser;
use comfy_table::{presets::NOTHING, Table};
use efibootsync_mount::Lsblk;
use rustix::process::getuid;

use crate::catalog::BootCatalog;
use crate::config::Config;
use crate::firmware::{BootVarStore, Efibootmgr, FirmwareState};
use crate::sync::{load_catalog, sync};

/// Options for the `sync` command.
#[derive(Debug, Default, Parser, PartialEq, Eq)]
pub struct SyncOpts {
    /// Print the firmware operations instead of performing them.
    #[clap(long)]
    pub dry_run: bool,
}

/// Options for commands which only print state.
#[derive(Debug, Default, Parser, PartialEq, Eq)]
pub struct ListOpts {
    /// Output in JSON format.
    #[clap(long)]
    pub json: bool,
}

/// The subcommands.
#[derive(Debug, clap::Subcommand, PartialEq, Eq)]
pub enum Cmd {
    /// Create or replace a firmware boot variable for every bootloader entry.
    ///
    /// This is the default when no subcommand is given.
    Sync(SyncOpts),
    /// Show the bootloader entries as they would be synchronized.
    ListEntries(ListOpts),
    /// Show the current firmware boot variables.
    Firmware(ListOpts),
}

/// Synchronize bootloader entries into firmware boot variables.
#[derive(Debug, Parser, PartialEq, Eq)]
#[clap(name = "efibootsync", version)]
pub struct Opt {
    /// Path to a TOML configuration file.
    #[clap(long, global = true)]
    pub config: Option<Utf8PathBuf>,

    /// Boot partition mount to try; may be repeated, earlier wins.
    /// Overrides the configured candidates.
    #[clap(long = "boot-mount", global = true)]
    pub boot_mounts: Vec<Utf8PathBuf>,

    #[clap(subcommand)]
    #[allow(missing_docs)]
    pub cmd: Option<Cmd>,
}

/// Parse the provided arguments and execute.
pub fn run_from_iter<I>(args: I) -> Result<()>
where
    I: IntoIterator,
    I::Item: Into<OsString> + Clone,
{
    run_from_opt(Opt::parse_from(args))
}

fn run_from_opt(opt: Opt) -> Result<()> {
    let mut config = Config::load(opt.config.as_deref())?;
    if !opt.boot_mounts.is_empty() {
        config.boot_mount_candidates = opt.boot_mounts;
    }
    let store = Efibootmgr::new(&config.efibootmgr);
    match opt.cmd.unwrap_or(Cmd::Sync(SyncOpts::default())) {
        Cmd::Sync(opts) => {
            // The firmware tool needs privileges for mutations only
            ensure!(
                opts.dry_run || getuid().is_root(),
                "Must run as the root user (or use --dry-run)"
            );
            let outcome = sync(&config, &Lsblk, &store, opts.dry_run)?;
            match outcome.summary {
                None => {
                    let mut stdout = std::io::stdout().lock();
                    for op in &outcome.operations {
                        writeln!(stdout, "{op}")?;
                    }
                }
                Some(summary) if summary.failed > 0 => {
                    tracing::warn!(
                        "{} of {} firmware operations failed",
                        summary.failed,
                        summary.failed + summary.succeeded
                    );
                }
                Some(summary) => {
                    tracing::info!("Applied {} firmware operations", summary.succeeded);
                }
            }
            Ok(())
        }
        Cmd::ListEntries(opts) => {
            let (mount, catalog) = load_catalog(&config, &Lsblk)?;
            if opts.json {
                print_json(&catalog)
            } else {
                println!("Boot mount: {} ({})", mount.mount_path, mount.partition_device);
                println!("{}", catalog_table(&catalog));
                Ok(())
            }
        }
        Cmd::Firmware(opts) => {
            let state = store.read_all()?;
            if opts.json {
                print_json(&state)
            } else {
                println!("{}", firmware_table(&state));
                Ok(())
            }
        }
    }
}

fn print_json(v: &impl serde::Serialize) -> Result<()> {
    let mut stdout = std::io::stdout().lock();
    serde_json::to_writer_pretty(&mut stdout, v)?;
    writeln!(stdout)?;
    Ok(())
}

fn catalog_table(catalog: &BootCatalog) -> Table {
    let mut table = Table::new();
    table
        .load_preset(NOTHING)
        .set_header(["", "TITLE", "ID", "LOADER", "ARGUMENTS"]);
    for entry in catalog.iter() {
        table.add_row([
            if entry.is_default { "*" } else { "" }.to_owned(),
            entry.title.clone(),
            entry.id.clone(),
            entry.loader_path.clone().unwrap_or_default(),
            entry.kernel_args(),
        ]);
    }
    table
}

fn firmware_table(state: &FirmwareState) -> Table {
    let mut table = Table::new();
    table.load_preset(NOTHING).set_header(["ID", "ACTIVE", "LABEL"]);
    for var in state.iter() {
        table.add_row([
            var.id.as_str(),
            if var.active { "yes" } else { "no" },
            var.label.as_str(),
        ]);
    }
    table
}
