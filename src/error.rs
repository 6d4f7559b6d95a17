//! Error taxonomy for SBOM generation and the CLI driver.

use crate::search::Sbom;

/// Abstract supertype for any error raised while searching for a feasible SBOM.
///
/// Caught at step boundaries so that a failing candidate can be abandoned in favor of
/// the next one; surfaced in full only when no candidate at a given step succeeds.
#[derive(Debug, thiserror::Error)]
pub enum SbomGenerationError {
    /// The command failed without accessing any path we didn't already know about.
    #[error("`{command}` exited with code {exit_code} without accessing any unknown files")]
    NonZeroExit { command: String, exit_code: i32 },

    /// No candidate package can explain the remaining missing files.
    #[error("{message}")]
    PackageResolutionError {
        message: String,
        command_output: Option<Vec<u8>>,
        partial_sbom: Sbom,
    },

    /// The package manager refused to install the requested packages.
    #[error("{message}")]
    PreinstallError {
        message: String,
        output: Option<Vec<u8>>,
    },

    /// Installing the candidate package changed nothing observable; this branch is dead.
    #[error("`{command}` exited with code {exit_code} regardless of installing {package}")]
    IrrelevantPackageInstall {
        command: String,
        exit_code: i32,
        package: String,
    },
}

impl SbomGenerationError {
    /// True if the preinstall output indicates the engine's backing store ran out of space.
    /// This is the one case a [`PreinstallError`](Self::PreinstallError) is promoted to fatal.
    pub fn is_disk_exhaustion(output: &[u8]) -> bool {
        // matches the heuristic the original tool used; a structured signal from the
        // engine would be more robust but none is available over the CLI.
        memchr_substr(output, b"enough free space")
    }
}

fn memchr_substr(haystack: &[u8], needle: &[u8]) -> bool {
    haystack
        .windows(needle.len())
        .any(|window| window == needle)
}

/// The requested distribution triple has no package index available.
#[derive(Debug, thiserror::Error)]
#[error("no package database is available for {package_manager} on {os}:{os_version}-{arch}")]
pub struct PackageDatabaseNotFoundError {
    pub package_manager: String,
    pub os: String,
    pub os_version: String,
    pub arch: String,
}

/// Top-level error type surfaced from `main`, covering everything below the search engine.
#[derive(Debug, thiserror::Error)]
pub enum DeptectiveError {
    #[error(transparent)]
    Sbom(#[from] SbomGenerationError),

    #[error(transparent)]
    DatabaseNotFound(#[from] PackageDatabaseNotFoundError),

    #[error("could not reach the container engine: {0}")]
    Engine(String),

    #[error("timed out waiting for a response: {0}")]
    Timeout(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
