//! Optional TOML configuration.

use std::ffi::OsString;

use anyhow::{ensure, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use serde::Deserialize;

use crate::firmware::EFIBOOTMGR;

/// The environment variable that can be used to specify a config file.
pub const CONFIG_VAR: &str = "EFIBOOTSYNC_CONFIG";

/// Read if present and nothing else was specified.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/efibootsync.toml";

/// Boot mounts tried when none are configured; `/boot` wins over `/efi`.
pub const DEFAULT_BOOT_MOUNTS: &[&str] = &["/boot", "/efi"];

/// Runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case", default)]
pub struct Config {
    /// Mount paths to try for the boot partition, in order.
    pub boot_mount_candidates: Vec<Utf8PathBuf>,
    /// The firmware tool to run.
    pub efibootmgr: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            boot_mount_candidates: DEFAULT_BOOT_MOUNTS.iter().map(Utf8PathBuf::from).collect(),
            efibootmgr: EFIBOOTMGR.to_owned(),
        }
    }
}

impl Config {
    /// Parse and validate TOML configuration; missing keys take defaults.
    pub fn parse(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s)?;
        ensure!(
            !config.boot_mount_candidates.is_empty(),
            "boot-mount-candidates must not be empty"
        );
        Ok(config)
    }

    /// Load the configuration from `explicit`, or the file named by
    /// `$EFIBOOTSYNC_CONFIG`, or [`DEFAULT_CONFIG_PATH`] if it exists.
    /// With none of those, built-in defaults are used.
    #[context("Loading configuration")]
    pub fn load(explicit: Option<&Utf8Path>) -> Result<Self> {
        load_impl(
            explicit,
            std::env::var_os(CONFIG_VAR),
            Utf8Path::new(DEFAULT_CONFIG_PATH),
        )
    }
}

fn load_impl(
    explicit: Option<&Utf8Path>,
    from_env: Option<OsString>,
    fallback: &Utf8Path,
) -> Result<Config> {
    let from_env = from_env
        .map(|v| {
            Utf8PathBuf::try_from(std::path::PathBuf::from(v))
                .with_context(|| format!("{CONFIG_VAR} is not UTF-8"))
        })
        .transpose()?;
    let path = match (explicit, from_env.as_deref()) {
        (Some(p), _) | (None, Some(p)) => p,
        (None, None) => {
            if !fallback.try_exists()? {
                tracing::debug!("No {fallback}, using defaults");
                return Ok(Config::default());
            }
            fallback
        }
    };
    let s = std::fs::read_to_string(path).with_context(|| format!("Reading {path}"))?;
    let config = Config::parse(&s).with_context(|| format!("Parsing {path}"))?;
    tracing::debug!("Loaded {path}: {config:?}");
    Ok(config)
}
