//! Version detection: a stable fingerprint of the installed schema-defining
//! modules.
//!
//! Each module is normalized to `lowercase(trim(name)):trim(version)`; the
//! lines are deduplicated, sorted, joined with `\n` and hashed with SHA-256.
//! The fingerprint is therefore independent of list order, name casing and
//! surrounding whitespace.

use crate::error::{SyncError, SyncResult};
use metacache_types::{Fingerprint, ModuleVersion};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;

/// Computes the fingerprint of a module list.
///
/// Fails on an empty list or an entry with a blank name or version.
pub fn fingerprint(modules: &[ModuleVersion]) -> SyncResult<Fingerprint> {
    if modules.is_empty() {
        return Err(SyncError::Detection("installed module list is empty".into()));
    }

    let mut lines = BTreeSet::new();
    for (i, m) in modules.iter().enumerate() {
        let name = m.name.trim();
        let version = m.version.trim();
        if name.is_empty() || version.is_empty() {
            return Err(SyncError::Detection(format!(
                "module entry {i} has a blank name or version"
            )));
        }
        lines.insert(format!("{}:{}", name.to_lowercase(), version));
    }

    let joined = lines.into_iter().collect::<Vec<_>>().join("\n");
    let digest = Sha256::digest(joined.as_bytes());
    Ok(Fingerprint::new(hex::encode(digest)))
}

/// Parses one line of the installed-modules listing.
///
/// Accepts `Name: X | Version: Y | Module: Z | Publisher: P | DisplayName: D`
/// (fields in any order, only name and version required) and the compact
/// `Name:Version` form.
pub fn parse_module_line(line: &str) -> SyncResult<ModuleVersion> {
    let line = line.trim();
    if line.contains('|') || line.to_ascii_lowercase().starts_with("name:") {
        let mut module = ModuleVersion::new("", "");
        for field in line.split('|') {
            let Some((key, value)) = field.split_once(':') else {
                continue;
            };
            let value = value.trim();
            let value = (!value.is_empty()).then(|| value.to_string());
            match key.trim().to_ascii_lowercase().as_str() {
                "name" => module.name = value.unwrap_or_default(),
                "version" => module.version = value.unwrap_or_default(),
                "module" => module.module = value,
                "publisher" => module.publisher = value,
                "displayname" => module.display_name = value,
                _ => {}
            }
        }
        if module.name.is_empty() || module.version.is_empty() {
            return Err(SyncError::Detection(format!("malformed module line: {line:?}")));
        }
        return Ok(module);
    }

    match line.rsplit_once(':') {
        Some((name, version)) if !name.trim().is_empty() && !version.trim().is_empty() => {
            Ok(ModuleVersion::new(name.trim(), version.trim()))
        }
        _ => Err(SyncError::Detection(format!("malformed module line: {line:?}"))),
    }
}

/// Parses a whole listing, skipping blank lines.
pub fn parse_module_lines<'a>(
    lines: impl IntoIterator<Item = &'a str>,
) -> SyncResult<Vec<ModuleVersion>> {
    lines
        .into_iter()
        .filter(|l| !l.trim().is_empty())
        .map(parse_module_line)
        .collect()
}
