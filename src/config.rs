//! The (os, os_version, arch) triple that identifies a package database, plus local-OS
//! autodetection from `/etc/os-release`.

use std::fs;
use std::path::Path;

/// Immutable key for a Content Index Cache and for a [`PackageManager`](crate::package_manager::PackageManager).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PackagingConfig {
    pub os: String,
    pub os_version: String,
    pub arch: String,
}

impl PackagingConfig {
    pub fn new(os: impl Into<String>, os_version: impl Into<String>, arch: impl Into<String>) -> Self {
        Self {
            os: os.into(),
            os_version: os_version.into(),
            arch: arch.into(),
        }
    }

    /// Best-effort detection of the local operating system, mirroring `/etc/os-release`
    /// when present and falling back to `std::env::consts` otherwise.
    pub fn get_local() -> Self {
        let arch = local_arch();
        let mut os = std::env::consts::OS.to_string();
        let mut os_version = String::new();

        if let Ok(contents) = fs::read_to_string(Path::new("/etc/os-release")) {
            let mut version_id = None;
            let mut version_codename = None;
            for line in contents.lines() {
                let Some((key, value)) = parse_os_release_line(line) else {
                    continue;
                };
                match key.as_str() {
                    "id" => os = value,
                    "version_id" => version_id = Some(value),
                    "version_codename" => version_codename = Some(value),
                    _ => {}
                }
            }
            if let Some(codename) = version_codename {
                os_version = codename;
            } else if let Some(id) = version_id {
                os_version = id;
            }
        }

        Self {
            os,
            os_version,
            arch,
        }
    }
}

fn local_arch() -> String {
    match std::env::consts::ARCH {
        "x86_64" => "amd64".to_string(),
        "aarch64" => "arm64".to_string(),
        other => other.to_string(),
    }
}

/// Parses one `/etc/os-release` line of the form `KEY=value`, `KEY="value"`, or `KEY='value'`.
/// Returns the lowercased key and the unquoted value; `None` for blank or malformed lines.
fn parse_os_release_line(line: &str) -> Option<(String, String)> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    let (key, raw_value) = line.split_once('=')?;
    let key = key.trim().to_lowercase();
    let raw_value = raw_value.trim();
    let value = if (raw_value.starts_with('"') && raw_value.ends_with('"') && raw_value.len() >= 2)
        || (raw_value.starts_with('\'') && raw_value.ends_with('\'') && raw_value.len() >= 2)
    {
        raw_value[1..raw_value.len() - 1].to_string()
    } else {
        raw_value.to_string()
    };
    Some((key, value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_quoted_and_bare_values() {
        assert_eq!(
            parse_os_release_line(r#"ID="ubuntu""#),
            Some(("id".to_string(), "ubuntu".to_string()))
        );
        assert_eq!(
            parse_os_release_line("VERSION_CODENAME=noble"),
            Some(("version_codename".to_string(), "noble".to_string()))
        );
        assert_eq!(parse_os_release_line("# a comment"), None);
        assert_eq!(parse_os_release_line(""), None);
    }

    #[test]
    fn config_equality_is_by_triple() {
        let a = PackagingConfig::new("ubuntu", "noble", "amd64");
        let b = PackagingConfig::new("ubuntu", "noble", "amd64");
        assert_eq!(a, b);
        let c = PackagingConfig::new("ubuntu", "jammy", "amd64");
        assert_ne!(a, c);
    }
}
