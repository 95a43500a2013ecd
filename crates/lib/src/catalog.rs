//! The desired set of boot entries, as declared in the boot partition.

use std::io::Read;

use anyhow::{Context, Result};
use cap_std_ext::cap_std::fs::Dir;
use cap_std_ext::dirext::CapStdExtDirExt;
use fn_error_context::context;
use serde::Serialize;

use crate::entry::{BootEntry, LoaderConfig, ENTRY_EXTENSION};

/// The loader's global configuration, relative to the boot mount.
pub const LOADER_CONF: &str = "loader/loader.conf";
/// The directory holding one file per entry, relative to the boot mount.
pub const ENTRIES_DIR: &str = "loader/entries";

/// The raw contents of one entry file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryFile {
    /// Filename, including the extension.
    pub name: String,
    /// File contents.
    pub content: Vec<u8>,
}

/// Entries sorted case-insensitively by title, with titles unique and
/// at most one default.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct BootCatalog(Vec<BootEntry>);

impl BootCatalog {
    /// Build a catalog from entry files.  Files are processed in name
    /// order; a later file with the same title replaces an earlier one.
    /// If `default_id` matches nothing, the first surviving entry is
    /// promoted to default.
    pub fn build(files: impl IntoIterator<Item = EntryFile>, default_id: Option<&str>) -> Self {
        let mut files: Vec<_> = files
            .into_iter()
            .filter(|f| f.name.ends_with(ENTRY_EXTENSION))
            .collect();
        files.sort_by(|a, b| a.name.cmp(&b.name));

        let mut entries: Vec<BootEntry> = Vec::with_capacity(files.len());
        for file in files {
            let (mut entry, report) = BootEntry::parse(&file.name, &file.content);
            report.log(&file.name);
            entry.is_default = default_id == Some(entry.id.as_str());
            if let Some(existing) = entries.iter_mut().find(|e| e.title == entry.title) {
                tracing::warn!(
                    "Label collision on {:?}: {} replaces {}",
                    entry.title,
                    entry.id,
                    existing.id
                );
                *existing = entry;
            } else {
                entries.push(entry);
            }
        }

        match entries.iter().position(|e| e.is_default) {
            Some(i) => tracing::info!("Default={}", entries[i].id),
            None => {
                if let Some(first) = entries.first_mut() {
                    tracing::warn!(
                        "Configured default {default_id:?} matches no entry; using {}",
                        first.id
                    );
                    first.is_default = true;
                }
            }
        }

        entries.sort_by_cached_key(|e| (e.title.to_lowercase(), e.title.clone()));
        Self(entries)
    }

    /// Read `loader.conf` and the entries directory from the boot partition.
    /// Either being absent is not an error.
    #[context("Loading boot entries")]
    pub fn load(boot: &Dir) -> Result<Self> {
        let default_id = match boot
            .open_optional(LOADER_CONF)
            .with_context(|| format!("Opening {LOADER_CONF}"))?
        {
            Some(mut f) => {
                let mut buf = Vec::new();
                f.read_to_end(&mut buf)
                    .with_context(|| format!("Reading {LOADER_CONF}"))?;
                let (config, report) = LoaderConfig::parse(&buf);
                report.log(LOADER_CONF);
                config.default
            }
            None => {
                tracing::warn!("No {LOADER_CONF} found");
                None
            }
        };

        let Some(entries_dir) = boot
            .open_dir_optional(ENTRIES_DIR)
            .with_context(|| format!("Opening {ENTRIES_DIR}"))?
        else {
            tracing::warn!("No {ENTRIES_DIR} found");
            return Ok(Self::default());
        };

        let mut files = Vec::new();
        for entry in entries_dir
            .entries()
            .with_context(|| format!("Listing {ENTRIES_DIR}"))?
        {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!("Reading {ENTRIES_DIR}: {e}");
                    continue;
                }
            };
            let name = match entry.file_name().into_string() {
                Ok(name) => name,
                Err(name) => {
                    tracing::warn!("Ignoring non-UTF-8 name {name:?}");
                    continue;
                }
            };
            if !name.ends_with(ENTRY_EXTENSION) {
                tracing::trace!("Ignoring {name}");
                continue;
            }
            // Follows symlinks, so a dangling link is skipped rather than fatal
            match entries_dir.metadata(&name) {
                Ok(m) if m.is_file() => {}
                Ok(_) => {
                    tracing::debug!("Ignoring non-file {name}");
                    continue;
                }
                Err(e) => {
                    tracing::warn!("Ignoring {name}: {e}");
                    continue;
                }
            }
            match entries_dir.read(&name) {
                Ok(content) => files.push(EntryFile { name, content }),
                Err(e) => tracing::warn!("Ignoring {name}: {e}"),
            }
        }

        Ok(Self::build(files, default_id.as_deref()))
    }

    /// Iterate over the entries in title order.
    pub fn iter(&self) -> impl Iterator<Item = &BootEntry> {
        self.0.iter()
    }

    /// The number of entries.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether there are no entries.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The default entry, if there are any entries at all.
    pub fn default_entry(&self) -> Option<&BootEntry> {
        self.0.iter().find(|e| e.is_default)
    }
}
