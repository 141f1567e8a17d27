//! Extension manifest parsing and discovery.
//!
//! A manifest is a UTF-8 text file (or embedded string) with one entry per
//! line: `name = provider.type.path`, or a bare provider path whose name is
//! derived from the provider's simple type name. `#` starts a comment and
//! blank lines are ignored. Manifests for a capability are discovered by
//! opening the file named by the capability's type path under each of the
//! three well-known prefixes inside every configured root directory.

use std::path::Path;
use std::path::PathBuf;

use snafu::ResultExt;

use crate::extension::error::ExtensionError;
use crate::extension::error::ManifestIoSnafu;

/// Well-known manifest directories, scanned in order. Internal entries load
/// first so the framework's own extensions resolve before vendor or service
/// additions.
pub const MANIFEST_PREFIXES: [&str; 3] = ["extensions/internal", "extensions", "services"];

/// One parsed manifest line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    /// Explicit name, when the line has a `name =` part.
    pub name: Option<String>,
    /// Provider type path.
    pub provider_path: String,
}

/// Parse manifest text into entries, skipping comments and blank lines.
pub fn parse_manifest(text: &str) -> Vec<ManifestEntry> {
    let mut entries = Vec::new();
    for line in text.lines() {
        let line = match line.find('#') {
            Some(i) => &line[..i],
            None => line,
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let entry = match line.split_once('=') {
            Some((name, path)) => ManifestEntry {
                name: Some(name.trim().to_string()),
                provider_path: path.trim().to_string(),
            },
            None => ManifestEntry { name: None, provider_path: line.to_string() },
        };
        if !entry.provider_path.is_empty() {
            entries.push(entry);
        }
    }
    entries
}

/// Read every manifest file for `type_path` under the configured roots.
/// Returns `(source-path, text)` pairs; missing files are simply absent.
pub fn discover(
    roots: &[PathBuf],
    type_path: &str,
) -> Result<Vec<(PathBuf, String)>, ExtensionError> {
    let mut found = Vec::new();
    for root in roots {
        for prefix in MANIFEST_PREFIXES {
            let path: PathBuf = [root.as_path(), Path::new(prefix), Path::new(type_path)]
                .iter()
                .collect();
            if !path.is_file() {
                continue;
            }
            let text = std::fs::read_to_string(&path).context(ManifestIoSnafu { path: path.clone() })?;
            found.push((path, text));
        }
    }
    Ok(found)
}
