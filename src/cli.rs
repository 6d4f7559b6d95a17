//! The command-line surface: argument parsing, cache loading, and the search drivers
//! (single command, path lookup, multi-step file) wired together with logging and a
//! clean exit on an interrupt.

use std::io::IsTerminal;
use std::path::PathBuf;

use clap::Parser;

use crate::cache::Cache;
use crate::config::PackagingConfig;
use crate::containers::{Engine, Image};
use crate::error::{DeptectiveError, SbomGenerationError};
use crate::multistep::multi_step;
use crate::package_manager::{self, PackageManager};
use crate::progress::SearchProgress;
use crate::search::{Generator, Sbom, StepError};
use crate::signals::SignalHandler;

const DEFAULT_LINUX: (&str, &str, &str) = ("ubuntu", "noble", "amd64");

#[derive(Debug, Parser)]
#[command(
    name = "deptective",
    version,
    about = "Computes the minimal set of OS packages a command needs to run in a fresh container"
)]
pub struct Cli {
    /// List the OS versions and architectures each package manager can resolve against.
    #[clap(short, long)]
    pub list: bool,

    /// The package manager to use.
    #[clap(short = 'p', long = "package-manager", default_value = "apt")]
    pub package_manager: String,

    /// The operating system in which to resolve packages.
    #[clap(short = 'o', long = "operating-system")]
    pub operating_system: Option<String>,

    /// The release of the operating system in which to resolve packages.
    #[clap(short, long)]
    pub release: Option<String>,

    /// The architecture in which to resolve packages.
    #[clap(long)]
    pub arch: Option<String>,

    /// Forces a rebuild of the package cache (requires an Internet connection).
    #[clap(long)]
    pub rebuild: bool,

    /// Treat `command` as one or more paths and list the packages that provide them,
    /// instead of running it.
    #[clap(short, long, conflicts_with = "multi_step")]
    pub search: bool,

    /// Treat `command` as one or more files, each containing one command per line, and
    /// chain the searches across them.
    #[clap(short = 'm', long = "multi-step", conflicts_with = "search")]
    pub multi_step: bool,

    /// The maximum number of satisfying package sets to discover; 0 enumerates all of them.
    #[clap(short = 'n', long = "num-results", default_value_t = 1, conflicts_with = "all")]
    pub num_results: usize,

    /// Enumerate every possible result; equivalent to `--num-results 0`.
    #[clap(short, long, conflicts_with = "num_results")]
    pub all: bool,

    /// Directory in which to store runtime artifacts (the most promising partial SBOM and
    /// the final command output, when the search doesn't fully succeed).
    #[clap(short = 'd', long = "log-dir")]
    pub log_dir: Option<PathBuf>,

    /// Overwrite an existing `--log-dir` if it already exists, without prompting.
    #[clap(short, long)]
    pub force: bool,

    /// Sets the log level (error, warn, info, debug, trace).
    #[clap(long, default_value = "info")]
    pub log_level: String,

    /// Equivalent to `--log-level=debug`.
    #[clap(long)]
    pub debug: bool,

    /// Equivalent to `--log-level=error`, and suppresses the progress spinner.
    #[clap(long)]
    pub quiet: bool,

    /// The command to run, the paths to look up (`--search`), or the multi-step files.
    #[clap(trailing_var_arg = true)]
    pub command: Vec<String>,
}

impl Cli {
    fn log_level(&self) -> &'static str {
        if self.debug {
            "debug"
        } else if self.quiet {
            "error"
        } else {
            match self.log_level.to_lowercase().as_str() {
                "trace" => "trace",
                "debug" => "debug",
                "warn" | "warning" => "warn",
                "error" | "critical" => "error",
                _ => "info",
            }
        }
    }
}

pub fn init_logging(cli: &Cli) {
    tracing_subscriber::fmt()
        .with_env_filter(format!("deptective={}", cli.log_level()))
        .with_target(false)
        .without_time()
        .init();
}

fn resolve_config(cli: &Cli) -> PackagingConfig {
    let local = PackagingConfig::get_local();
    PackagingConfig::new(
        cli.operating_system.clone().unwrap_or(local.os),
        cli.release.clone().unwrap_or(local.os_version),
        cli.arch.clone().unwrap_or(local.arch),
    )
}

fn load_cache(
    name: &str,
    config: PackagingConfig,
    rebuild: bool,
) -> Result<(Box<dyn PackageManager>, Cache), DeptectiveError> {
    let package_manager = package_manager::get(name, config)?;
    if rebuild && Cache::exists(package_manager.as_ref())? {
        Cache::delete(package_manager.as_ref())?;
    }
    let cache = Cache::open(package_manager.as_ref())?;
    Ok((package_manager, cache))
}

fn list_supported_configurations(name: &str, config: PackagingConfig) -> Result<(), DeptectiveError> {
    let package_manager = package_manager::get(name, config)?;
    let versions = package_manager.versions()?;
    println!("{:<10}  {:<10}  {:<12}  {}", "MANAGER", "OS", "RELEASE", "ARCH");
    for version in versions {
        println!(
            "{:<10}  {:<10}  {:<12}  {}",
            name, version.os, version.os_version, version.arch
        );
    }
    Ok(())
}

/// Parses the CLI args and runs the requested operation. Returns the process exit code.
pub fn run() -> i32 {
    let cli = Cli::parse();
    init_logging(&cli);

    if cli.list {
        let config = resolve_config(&cli);
        if let Err(e) = list_supported_configurations(&cli.package_manager, config) {
            tracing::error!("{e}");
            return 1;
        }
        if cli.command.is_empty() {
            return 0;
        }
    }

    if cli.command.is_empty() && !cli.rebuild {
        tracing::error!("no command given; pass a command to run, or --rebuild to only refresh the cache");
        return 1;
    }

    let requested = resolve_config(&cli);
    let (package_manager, cache) = match load_cache(&cli.package_manager, requested.clone(), cli.rebuild) {
        Ok(pair) => pair,
        Err(DeptectiveError::DatabaseNotFound(_)) if requested != fallback_config() => {
            tracing::warn!(
                "the local OS/release/arch isn't compatible with {}; trying {}:{}-{} instead",
                cli.package_manager,
                DEFAULT_LINUX.0,
                DEFAULT_LINUX.1,
                DEFAULT_LINUX.2
            );
            match load_cache(&cli.package_manager, fallback_config(), cli.rebuild) {
                Ok(pair) => pair,
                Err(e) => {
                    tracing::error!("{e}\nrun `deptective --list` for the available OS versions and architectures");
                    return 1;
                }
            }
        }
        Err(e) => {
            tracing::error!("{e}\nrun `deptective --list` for the available OS versions and architectures");
            return 1;
        }
    };

    if cli.rebuild && cli.command.is_empty() {
        return 0;
    }

    if cli.search {
        return run_search_paths(&cache, &cli.command);
    }

    match prepare_log_dir(&cli) {
        Ok(log_dir) => run_generate(&cli, package_manager.as_ref(), &cache, &log_dir),
        Err(e) => {
            tracing::error!("{e}");
            1
        }
    }
}

fn fallback_config() -> PackagingConfig {
    PackagingConfig::new(DEFAULT_LINUX.0, DEFAULT_LINUX.1, DEFAULT_LINUX.2)
}

fn run_search_paths(cache: &Cache, paths: &[String]) -> i32 {
    let mut all_found = true;
    for path in paths {
        match cache.lookup(path) {
            Ok(packages) if !packages.is_empty() => {
                println!("Packages providing {path}: {}", packages.join(", "));
            }
            Ok(_) => {
                tracing::info!("No packages found that provide {path}");
                all_found = false;
            }
            Err(e) => {
                tracing::error!("{e}");
                all_found = false;
            }
        }
    }
    if all_found {
        0
    } else {
        1
    }
}

fn prepare_log_dir(cli: &Cli) -> Result<PathBuf, anyhow::Error> {
    if let Some(dir) = &cli.log_dir {
        if dir.exists() {
            if cli.force {
                std::fs::remove_dir_all(dir)?;
            } else if std::io::stdin().is_terminal()
                && dialoguer::Confirm::new()
                    .with_prompt(format!("{} already exists; overwrite it?", dir.display()))
                    .default(false)
                    .interact()
                    .unwrap_or(false)
            {
                std::fs::remove_dir_all(dir)?;
            } else {
                anyhow::bail!(
                    "{} already exists; choose a different --log-dir, delete it, or pass --force",
                    dir.display()
                );
            }
        }
        std::fs::create_dir_all(dir)?;
        Ok(dir.clone())
    } else {
        Ok(tempfile::Builder::new().prefix("deptective-").tempdir()?.keep())
    }
}

fn run_generate(cli: &Cli, package_manager: &dyn PackageManager, cache: &Cache, log_dir: &PathBuf) -> i32 {
    let engine = match Engine::detect() {
        Ok(engine) => engine,
        Err(e) => {
            tracing::error!("{e}");
            return 1;
        }
    };
    let signals = match SignalHandler::install() {
        Ok(handler) => handler,
        Err(e) => {
            tracing::error!("could not install signal handlers: {e}");
            return 1;
        }
    };
    let progress = SearchProgress::new(cli.quiet);

    let base_reference = match build_base_image(package_manager, &engine) {
        Ok(reference) => reference,
        Err(e) => {
            tracing::error!("{e}");
            return 1;
        }
    };
    let base_image = Image::base(engine.clone(), base_reference);

    let generator = Generator::new(cache, package_manager, engine);
    let mut results: Vec<Sbom> = Vec::new();
    let mut found = 0usize;
    let tty = std::io::stdout().is_terminal();
    let limit = if cli.all { 0 } else { cli.num_results };

    let mut on_feasible = |sbom: Sbom| -> bool {
        if !tty {
            println!("{sbom}");
        } else {
            results.push(sbom.clone());
        }
        found += 1;
        if sbom.is_empty() {
            tracing::info!("the command ran successfully without any additional dependencies");
        } else {
            tracing::info!("satisfying dependencies: {sbom}");
        }
        if signals.cancelled() {
            return false;
        }
        limit == 0 || found < limit
    };

    let outcome = if cli.multi_step {
        let commands = match read_multi_step_files(&cli.command) {
            Ok(commands) => commands,
            Err(e) => {
                tracing::error!("{e}");
                return 1;
            }
        };
        multi_step(&generator, &commands, &base_image, None, &mut on_feasible)
    } else {
        let argv = cli.command.clone();
        generator.search(&base_image, &argv, None, |sbom, _image| on_feasible(sbom))
    };

    progress.finish("done");

    match outcome {
        Ok(()) => {
            for sbom in &results {
                println!("{sbom}");
            }
            0
        }
        Err(e) => report_search_error(e, log_dir, &cli.command),
    }
}

fn build_base_image(package_manager: &dyn PackageManager, engine: &Engine) -> Result<String, anyhow::Error> {
    let repo = format!("deptective/base-{}", package_manager.name());
    let reference = format!("{repo}:latest");
    if engine.image_exists(&reference) {
        return Ok(reference);
    }
    let dockerfile = package_manager.dockerfile();
    let build_dir = tempfile::tempdir()?;
    std::fs::write(build_dir.path().join("Dockerfile"), dockerfile)?;
    std::fs::copy(
        std::env::current_exe()?
            .parent()
            .ok_or_else(|| anyhow::anyhow!("could not locate the deptective binary's directory"))?
            .join("deptective-strace"),
        build_dir.path().join("deptective-strace"),
    )?;
    std::fs::copy(
        std::env::current_exe()?
            .parent()
            .ok_or_else(|| anyhow::anyhow!("could not locate the deptective binary's directory"))?
            .join("deptective-files-exist"),
        build_dir.path().join("deptective-files-exist"),
    )?;
    engine.build_image(build_dir.path(), &reference)?;
    Ok(reference)
}

fn read_multi_step_files(paths: &[String]) -> Result<Vec<Vec<String>>, anyhow::Error> {
    let mut commands = Vec::new();
    for path in paths {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("could not open multi-step file {path}: {e}"))?;
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            commands.push(shlex::split(line).ok_or_else(|| anyhow::anyhow!("malformed command line: {line}"))?);
        }
    }
    Ok(commands)
}

fn report_search_error(error: StepError, log_dir: &PathBuf, command: &[String]) -> i32 {
    match error {
        StepError::Sbom(SbomGenerationError::PackageResolutionError {
            message,
            command_output,
            partial_sbom,
        }) => {
            tracing::error!("{message}");
            if !partial_sbom.is_empty() {
                let path = log_dir.join("most_promising_sbom.txt");
                let text = partial_sbom.iter().cloned().collect::<Vec<_>>().join("\n");
                let _ = std::fs::write(&path, text);
                tracing::info!("most promising partial SBOM saved to {}", path.display());
            }
            if let Some(output) = command_output {
                let path = log_dir.join("final_output.txt");
                let _ = std::fs::write(&path, &output);
                tracing::info!(
                    "`{}` output saved to {}",
                    command.join(" "),
                    path.display()
                );
            }
            1
        }
        StepError::Sbom(e) => {
            tracing::error!("{e}");
            1
        }
        StepError::Fatal(e) => {
            tracing::error!("{e}");
            1
        }
    }
}
