//! Abstracts one distribution's packaging operations behind a common trait, mirroring
//! how a single content index can be built and queried regardless of which package
//! manager backs it.

pub mod apt;

use std::collections::BTreeMap;
use std::sync::OnceLock;

use crate::config::PackagingConfig;
use crate::containers::ContainerHandle;
use crate::error::PackageDatabaseNotFoundError;

/// One (filename, set-of-providing-packages) pair yielded while enumerating a
/// distribution's content index.
pub struct ContentIndexEntry {
    pub filename: String,
    pub packages: Vec<String>,
}

/// A distribution adapter: carries a [`PackagingConfig`] and knows how to update,
/// install, enumerate its content index, and produce a base-image recipe.
pub trait PackageManager: Send + Sync {
    /// Short, stable identifier under which this adapter is registered (e.g. `"apt"`).
    fn name(&self) -> &'static str;

    fn config(&self) -> &PackagingConfig;

    /// Refreshes the in-container package index. Returns `(exit_code, combined output)`.
    fn update(&self, container: &ContainerHandle) -> Result<(i32, Vec<u8>), anyhow::Error>;

    /// Installs `packages` non-interactively. Returns `(exit_code, combined output)`.
    fn install(
        &self,
        container: &ContainerHandle,
        packages: &[String],
    ) -> Result<(i32, Vec<u8>), anyhow::Error>;

    /// Enumerates the full content index for this adapter's configured triple.
    /// May inject synthetic mappings (e.g. `/usr/bin/cc`) the upstream index omits.
    fn iter_packages(
        &self,
    ) -> Result<Box<dyn Iterator<Item = Result<ContentIndexEntry, anyhow::Error>>>, anyhow::Error>;

    /// Enumerates every (os_version, arch) pair this adapter supports.
    fn versions(&self) -> Result<Vec<PackagingConfig>, anyhow::Error>;

    /// The Dockerfile recipe for this adapter's base image (distribution userland plus
    /// the two embedded helpers).
    fn dockerfile(&self) -> String;
}

impl PartialEq for dyn PackageManager {
    fn eq(&self, other: &Self) -> bool {
        self.name() == other.name() && self.config() == other.config()
    }
}

type Constructor = fn(PackagingConfig) -> Box<dyn PackageManager>;

fn registry() -> &'static BTreeMap<&'static str, Constructor> {
    static REGISTRY: OnceLock<BTreeMap<&'static str, Constructor>> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        let mut map: BTreeMap<&'static str, Constructor> = BTreeMap::new();
        map.insert("apt", |config| Box::new(apt::Apt::new(config)));
        map
    })
}

/// All registered adapter names, sorted.
pub fn registered_names() -> Vec<&'static str> {
    registry().keys().copied().collect()
}

/// Looks up an adapter by name and constructs it bound to `config`.
pub fn get(name: &str, config: PackagingConfig) -> Result<Box<dyn PackageManager>, PackageDatabaseNotFoundError> {
    match registry().get(name) {
        Some(constructor) => Ok(constructor(config.clone())),
        None => Err(PackageDatabaseNotFoundError {
            package_manager: name.to_string(),
            os: config.os,
            os_version: config.os_version,
            arch: config.arch,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apt_is_registered() {
        assert!(registered_names().contains(&"apt"));
    }

    #[test]
    fn unknown_name_is_not_found() {
        let config = PackagingConfig::new("ubuntu", "noble", "amd64");
        assert!(get("nonexistent", config).is_err());
    }
}
