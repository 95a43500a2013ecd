//! # Firmware boot entry synchronization
//!
//! This crate reconciles a bootloader's declarative configuration (the
//! `loader/entries/*.conf` files and the default from `loader/loader.conf`
//! on the boot partition) with the UEFI firmware boot variables, so the
//! firmware can boot each entry directly.
//!
//! The `efibootsync` binary (`crates/cli`) is a thin wrapper that
//! delegates to [`cli::run_from_iter`].
//!
//! # Module Index
//!
//! - [`entry`] - Parsing entry files and `loader.conf`
//! - [`catalog`] - The desired, title-sorted set of entries
//! - [`firmware`] - Reading and mutating firmware boot variables
//! - [`reconcile`] - Planning and applying firmware mutations
//! - [`sync`] - The end-to-end run
//! - [`config`] - Optional TOML configuration
//! - [`cli`] - Command-line interface implementation (clap-based)

pub mod catalog;
pub mod cli;
pub mod config;
pub mod entry;
pub mod firmware;
pub mod reconcile;
pub mod sync;
