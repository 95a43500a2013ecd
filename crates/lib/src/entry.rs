//! Parsing of bootloader entry files and `loader.conf`.
//!
//! Both use the same line format: a directive followed by whitespace
//! separated values.  Parsing is best-effort per line; lines which can't
//! be used are recorded in a [`ParseReport`] and skipped.

use serde::Serialize;

/// Entry files must have this suffix; the rest of the name is the entry id.
pub const ENTRY_EXTENSION: &str = ".conf";

/// The kernel argument through which an EFI stub finds its initrd.
pub const INITRD_ARG: &str = "initrd=";

/// Directives from the Boot Loader Specification which we recognize but
/// have no use for.
const IGNORED_DIRECTIVES: &[&str] = &[
    "version",
    "machine-id",
    "sort-key",
    "devicetree",
    "devicetree-overlay",
    "architecture",
    "uki",
    "uki-url",
    "profile",
];

/// Why a line was not used.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SkipReason {
    /// The raw line could not be decoded.
    #[error("line is not valid UTF-8")]
    InvalidUtf8,
    /// Only the directive was present.
    #[error("directive {0:?} has no value")]
    MissingValue(String),
    /// The directive is not one we know about.
    #[error("unrecognized directive {0:?}")]
    UnknownDirective(String),
}

/// A line which was skipped, and why.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedLine {
    /// 1-based line number.
    pub lineno: usize,
    /// The reason for skipping it.
    pub reason: SkipReason,
}

/// Aggregated per-line outcomes for one parsed file.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ParseReport {
    /// Every line which was skipped, in file order.
    pub skipped: Vec<SkippedLine>,
}

impl ParseReport {
    fn skip(&mut self, lineno: usize, reason: SkipReason) {
        self.skipped.push(SkippedLine { lineno, reason });
    }

    /// Emit diagnostics for each skipped line of `source`.
    pub fn log(&self, source: &str) {
        for SkippedLine { lineno, reason } in &self.skipped {
            match reason {
                SkipReason::UnknownDirective(_) => {
                    tracing::debug!("{source}:{lineno}: {reason}")
                }
                SkipReason::InvalidUtf8 | SkipReason::MissingValue(_) => {
                    tracing::warn!("{source}:{lineno}: {reason}")
                }
            }
        }
    }
}

#[derive(Debug)]
struct Directive<'a> {
    lineno: usize,
    key: &'a str,
    values: Vec<&'a str>,
}

impl Directive<'_> {
    fn first(&self) -> &str {
        self.values[0]
    }

    fn joined(&self) -> String {
        self.values.join(" ")
    }
}

/// Split `content` into directives.  Blank lines and comments are dropped
/// silently; malformed lines are recorded in `report`.
fn directives<'a>(content: &'a [u8], report: &mut ParseReport) -> Vec<Directive<'a>> {
    let mut r = Vec::new();
    for (i, line) in content.split(|&b| b == b'\n').enumerate() {
        let lineno = i + 1;
        let Ok(line) = std::str::from_utf8(line) else {
            report.skip(lineno, SkipReason::InvalidUtf8);
            continue;
        };
        let mut tokens = line.split_whitespace();
        let Some(key) = tokens.next() else {
            continue;
        };
        if key.starts_with('#') {
            continue;
        }
        let values: Vec<_> = tokens.collect();
        if values.is_empty() {
            report.skip(lineno, SkipReason::MissingValue(key.to_owned()));
            continue;
        }
        r.push(Directive {
            lineno,
            key,
            values,
        });
    }
    r
}

/// The parts of `loader.conf` we consume.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LoaderConfig {
    /// Id of the default entry, without the entry file extension.
    pub default: Option<String>,
}

impl LoaderConfig {
    /// Parse `loader.conf`.  Only `default` is consumed; the last
    /// occurrence wins.
    pub fn parse(content: &[u8]) -> (Self, ParseReport) {
        let mut report = ParseReport::default();
        let mut default = None;
        for d in directives(content, &mut report) {
            if d.key == "default" {
                let id = d.first();
                default = Some(id.strip_suffix(ENTRY_EXTENSION).unwrap_or(id).to_owned());
            }
        }
        (Self { default }, report)
    }
}

/// One bootable configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct BootEntry {
    /// The entry filename without its extension.
    pub id: String,
    /// Human readable label; this is what firmware variables are matched on.
    pub title: String,
    /// Kernel or EFI image handed to firmware.
    pub loader_path: Option<String>,
    /// Initrd images, in file order.
    pub initrd_paths: Vec<String>,
    /// The kernel command line from the entry.
    pub options: Option<String>,
    /// Whether this is the loader's default entry.
    pub is_default: bool,
}

impl BootEntry {
    /// Parse the entry file `filename`.  The title defaults to the
    /// filename; `linux`/`efi` and `options` take the last occurrence,
    /// `initrd` accumulates.  `is_default` is always false here; the
    /// catalog decides that.
    pub fn parse(filename: &str, content: &[u8]) -> (Self, ParseReport) {
        let mut report = ParseReport::default();
        let mut entry = BootEntry {
            id: filename
                .strip_suffix(ENTRY_EXTENSION)
                .unwrap_or(filename)
                .to_owned(),
            title: filename.to_owned(),
            loader_path: None,
            initrd_paths: Vec::new(),
            options: None,
            is_default: false,
        };
        for d in directives(content, &mut report) {
            match d.key {
                "title" => entry.title = d.joined(),
                "linux" | "efi" => entry.loader_path = Some(d.first().to_owned()),
                "initrd" => entry.initrd_paths.push(d.first().to_owned()),
                "options" => entry.options = Some(d.joined()),
                k if IGNORED_DIRECTIVES.contains(&k) => {}
                k => report.skip(d.lineno, SkipReason::UnknownDirective(k.to_owned())),
            }
        }
        (entry, report)
    }

    /// The argument string passed to the loader: the options line followed
    /// by one `initrd=` argument per initrd.
    pub fn kernel_args(&self) -> String {
        self.options
            .iter()
            .cloned()
            .chain(self.initrd_paths.iter().map(|p| format!("{INITRD_ARG}{p}")))
            .collect::<Vec<_>>()
            .join(" ")
    }
}
