//! The recursive search that turns a failing command into a minimal package set: run it
//! under `strace`, resolve the paths it tried and failed to find back to the packages
//! that provide them, install the best candidate, and try again.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};

use indexmap::IndexSet;

use crate::cache::Cache;
use crate::containers::{await_done, canonicalize_if_changed, Container, ContainerHandle, Engine, Execution, Image};
use crate::error::SbomGenerationError;
use crate::package_manager::PackageManager;
use crate::strace::{is_ignored_line, lazy_parse_paths};

const STRACE_ENTRYPOINT: &str = "/usr/bin/deptective-strace";
const WORKDIR: &str = "/workdir";

/// A software bill of materials: the set of packages installed to make a command run.
/// Compared and hashed as a set (installation order doesn't affect feasibility), but
/// displayed in the order packages were added, since that's the order a reader installed
/// them in.
#[derive(Debug, Clone, Default)]
pub struct Sbom(IndexSet<String>);

impl Sbom {
    pub fn new() -> Self {
        Self(IndexSet::new())
    }

    pub fn single(package: impl Into<String>) -> Self {
        let mut set = IndexSet::new();
        set.insert(package.into());
        Self(set)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &String> {
        self.0.iter()
    }

    pub fn contains(&self, package: &str) -> bool {
        self.0.contains(package)
    }

    /// True if `self` contains every package in `other`.
    pub fn issuperset(&self, other: &Sbom) -> bool {
        other.0.iter().all(|pkg| self.0.contains(pkg))
    }

    /// This sbom with `packages` appended, in order, skipping ones already present.
    pub fn extended(&self, packages: &[String]) -> Sbom {
        let mut out = self.0.clone();
        for package in packages {
            out.insert(package.clone());
        }
        Sbom(out)
    }
}

impl PartialEq for Sbom {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl Eq for Sbom {}

impl Hash for Sbom {
    fn hash<H: Hasher>(&self, state: &mut H) {
        let mut sorted: Vec<&String> = self.0.iter().collect();
        sorted.sort();
        sorted.hash(state);
    }
}

impl fmt::Display for Sbom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let items: Vec<&str> = self.0.iter().map(String::as_str).collect();
        write!(f, "{}", items.join(" "))
    }
}

/// Everything kept about the deepest or most-informative dead end reached, surfaced when
/// the search comes up empty so the user sees *why*, not just that it failed.
#[derive(Debug, Clone)]
pub struct BestPartial {
    pub level: u32,
    pub sbom: Sbom,
    pub retval: i32,
    pub command_output: Vec<u8>,
    pub missing_files: Vec<String>,
}

/// Errors that can end a `step` call. `Sbom` variants are recoverable at the parent step
/// (try the next candidate package); `Fatal` variants are not and unwind the whole search
/// (an engine failure, or a preinstall failure attributed to disk exhaustion, which no
/// amount of candidate-switching will fix).
#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error(transparent)]
    Sbom(#[from] SbomGenerationError),
    #[error(transparent)]
    Fatal(#[from] anyhow::Error),
}

struct StepOutcome {
    /// False once the caller's feasible-sbom callback has asked the search to stop.
    continue_search: bool,
    /// True if this step, or any of its descendants, yielded a feasible sbom.
    found_feasible: bool,
}

/// Drives the search for one command: owns the content-index cache, the package manager
/// adapter, and the container engine, and accumulates the infeasible/feasible sbom sets
/// that prune later branches of the search.
pub struct Generator<'a> {
    cache: &'a Cache,
    package_manager: &'a dyn PackageManager,
    engine: Engine,
    image_repo: String,
    infeasible: RefCell<HashSet<Sbom>>,
    feasible: RefCell<HashSet<Sbom>>,
    best_partial: RefCell<Option<BestPartial>>,
}

impl<'a> Generator<'a> {
    pub fn new(cache: &'a Cache, package_manager: &'a dyn PackageManager, engine: Engine) -> Self {
        Self {
            cache,
            package_manager,
            engine,
            image_repo: format!("deptective/search-{}", random_suffix()),
            infeasible: RefCell::new(HashSet::new()),
            feasible: RefCell::new(HashSet::new()),
            best_partial: RefCell::new(None),
        }
    }

    pub fn best_partial(&self) -> Option<BestPartial> {
        self.best_partial.borrow().clone()
    }

    pub fn feasible_sboms(&self) -> HashSet<Sbom> {
        self.feasible.borrow().clone()
    }

    /// Searches for sboms that make `argv` run cleanly starting from `base_image`,
    /// invoking `on_feasible` for each one found (in discovery order). `on_feasible`
    /// returns whether the search should keep looking for more.
    pub fn search(
        &self,
        base_image: &Image,
        argv: &[String],
        source_tree: Option<&Path>,
        mut on_feasible: impl FnMut(Sbom, &Image) -> bool,
    ) -> Result<(), StepError> {
        let outcome = self.step(
            base_image,
            0,
            argv,
            &[],
            &Sbom::new(),
            None,
            source_tree,
            &mut on_feasible,
        )?;
        let _ = outcome;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn step(
        &self,
        parent_image: &Image,
        level: u32,
        argv: &[String],
        preinstall: &[String],
        parent_sbom: &Sbom,
        parent_run: Option<&(i32, Vec<u8>)>,
        source_tree: Option<&Path>,
        on_feasible: &mut dyn FnMut(Sbom, &Image) -> bool,
    ) -> Result<StepOutcome, StepError> {
        let sbom = parent_sbom.extended(preinstall);

        let mut container = Container::new(
            self.engine.clone(),
            parent_image.clone(),
            self.image_repo.clone(),
            level,
        );

        let mut volumes: HashMap<PathBuf, (PathBuf, bool)> = HashMap::new();
        if level == 0 {
            if let Some(src) = source_tree {
                volumes.insert(src.to_path_buf(), (PathBuf::from("/src"), true));
            }
        }

        let setup_output: RefCell<Option<Vec<u8>>> = RefCell::new(None);
        let package_manager = self.package_manager;
        let preinstall_owned = preinstall.to_vec();
        let has_source = source_tree.is_some();
        let setup = |handle: &ContainerHandle| -> Result<(), anyhow::Error> {
            if level == 0 {
                if has_source {
                    let (code, output) = handle.exec(&format!("mkdir -p {WORKDIR} && cp -a /src/. {WORKDIR}/"))?;
                    if code != 0 {
                        anyhow::bail!("failed to stage source tree: {}", String::from_utf8_lossy(&output));
                    }
                }
                let (code, output) = package_manager.update(handle)?;
                if code != 0 {
                    anyhow::bail!(
                        "package index update failed with exit code {code}: {}",
                        String::from_utf8_lossy(&output)
                    );
                }
            }
            if !preinstall_owned.is_empty() {
                let (code, output) = package_manager.install(handle, &preinstall_owned)?;
                *setup_output.borrow_mut() = Some(output.clone());
                if code != 0 {
                    anyhow::bail!("install of {preinstall_owned:?} failed with exit code {code}");
                }
            }
            Ok(())
        };

        if let Err(e) = container.enter(&volumes, setup) {
            if !preinstall.is_empty() {
                let output = setup_output.into_inner().unwrap_or_default();
                if SbomGenerationError::is_disk_exhaustion(&output) {
                    return Err(StepError::Fatal(anyhow::anyhow!(
                        "installing {:?} exhausted the container engine's disk: {e}",
                        preinstall
                    )));
                }
                return Err(StepError::Sbom(SbomGenerationError::PreinstallError {
                    message: format!("installing {preinstall:?} failed: {e}"),
                    output: Some(output),
                }));
            }
            return Err(StepError::Fatal(e));
        }

        let result = self.run_and_recurse(
            &mut container,
            level,
            argv,
            preinstall,
            &sbom,
            parent_run,
            on_feasible,
        );

        if let Err(e) = container.exit() {
            // Only surfaced if `result` itself didn't already fail; an error tearing down
            // a step we've otherwise finished with shouldn't mask the real outcome.
            if result.is_ok() {
                return Err(StepError::Fatal(e));
            }
        }

        result
    }

    #[allow(clippy::too_many_arguments)]
    fn run_and_recurse(
        &self,
        container: &mut Container,
        level: u32,
        argv: &[String],
        preinstall: &[String],
        sbom: &Sbom,
        parent_run: Option<&(i32, Vec<u8>)>,
        on_feasible: &mut dyn FnMut(Sbom, &Image) -> bool,
    ) -> Result<StepOutcome, StepError> {
        let image = container.image().clone();

        let needs_path = level == 0
            && matches!(argv.first(), Some(cmd) if !cmd.starts_with('/') && !cmd.starts_with("./"));
        let path_entries = if needs_path {
            container.read_path().map_err(StepError::Fatal)?
        } else {
            Vec::new()
        };
        let mut missing = if level == 0 {
            seed_missing_files(argv, &path_entries)
        } else {
            Vec::new()
        };
        let mut already_missing: HashSet<String> = missing.iter().cloned().collect();

        let log_dir = tempfile::tempdir().map_err(|e| StepError::Fatal(e.into()))?;
        let mut volumes: HashMap<PathBuf, (PathBuf, bool)> = HashMap::new();
        volumes.insert(log_dir.path().to_path_buf(), (PathBuf::from("/var/log/deptective"), false));
        let mut strace_argv = vec!["/var/log/deptective/trace.log".to_string()];
        strace_argv.extend(argv.iter().cloned());

        let mut execution = Execution::start(
            &self.engine,
            &image,
            STRACE_ENTRYPOINT,
            &strace_argv,
            WORKDIR,
            &volumes,
        )
        .map_err(StepError::Fatal)?;
        await_done(&mut execution, || {}).map_err(StepError::Fatal)?;
        let retval = execution.exit_code().map_err(StepError::Fatal)?;
        let output = execution.output().map_err(StepError::Fatal)?;
        let trace_log = std::fs::read(log_dir.path().join("trace.log")).unwrap_or_default();

        if retval == 0 {
            self.feasible.borrow_mut().insert(sbom.clone());
            let keep_going = on_feasible(sbom.clone(), &image);
            return Ok(StepOutcome {
                continue_search: keep_going,
                found_feasible: true,
            });
        }

        let mut accessed: IndexSet<String> = IndexSet::new();
        for line in String::from_utf8_lossy(&trace_log).lines() {
            if is_ignored_line(line) {
                continue;
            }
            for path in lazy_parse_paths(line) {
                accessed.insert(canonicalize_if_changed(&path));
            }
        }

        let to_check: Vec<String> = accessed
            .into_iter()
            .filter(|p| !already_missing.contains(p))
            .collect();
        let existence = container.files_exist(&to_check).map_err(StepError::Fatal)?;
        for path in to_check {
            if !existence.get(&path).copied().unwrap_or(true) {
                missing.push(path);
            }
        }

        self.update_best_partial(level, sbom, retval, &output, &missing);

        if missing.is_empty() {
            return Err(StepError::Sbom(SbomGenerationError::NonZeroExit {
                command: argv.join(" "),
                exit_code: retval,
            }));
        }

        if let Some((parent_retval, parent_output)) = parent_run {
            if retval == *parent_retval && &output == parent_output {
                return Err(StepError::Sbom(SbomGenerationError::IrrelevantPackageInstall {
                    command: argv.join(" "),
                    exit_code: retval,
                    package: preinstall.last().cloned().unwrap_or_default(),
                }));
            }
        }

        let ranked = self.rank_candidates(&missing, sbom)?;

        let mut tried: HashSet<String> = HashSet::new();
        let mut found_feasible = false;
        let mut continue_search = true;
        let this_run = (retval, output);

        for package in ranked {
            if !continue_search {
                break;
            }
            if tried.contains(&package) {
                continue;
            }
            tried.insert(package.clone());

            let candidate_sbom = sbom.extended(std::slice::from_ref(&package));
            if self
                .infeasible
                .borrow()
                .iter()
                .any(|known| candidate_sbom.issuperset(known))
            {
                continue;
            }

            let child_preinstall = [package.clone()];
            match self.step(
                &container.image().clone(),
                level + 1,
                argv,
                &child_preinstall,
                sbom,
                Some(&this_run),
                None,
                &mut *on_feasible,
            ) {
                Ok(outcome) => {
                    if outcome.found_feasible {
                        found_feasible = true;
                    }
                    continue_search = outcome.continue_search;
                }
                Err(StepError::Sbom(_)) => {
                    self.infeasible.borrow_mut().insert(candidate_sbom);
                }
                Err(StepError::Fatal(e)) => return Err(StepError::Fatal(e)),
            }
        }

        if !found_feasible {
            self.infeasible.borrow_mut().insert(sbom.clone());
        }

        Ok(StepOutcome {
            continue_search,
            found_feasible,
        })
    }

    fn update_best_partial(&self, level: u32, sbom: &Sbom, retval: i32, output: &[u8], missing: &[String]) {
        let is_better = match &*self.best_partial.borrow() {
            None => true,
            Some(current) => level >= current.level,
        };
        if is_better {
            *self.best_partial.borrow_mut() = Some(BestPartial {
                level,
                sbom: sbom.clone(),
                retval,
                command_output: output.to_vec(),
                missing_files: missing.to_vec(),
            });
        }
    }

    /// Resolves `missing` paths to candidate packages via the content index, ranked by
    /// `(frequency desc, first_index desc, name asc)`: the package explaining the most
    /// missing files wins, ties go to the package implicated by the file discovered
    /// latest, and remaining ties break alphabetically.
    fn rank_candidates(&self, missing: &[String], sbom: &Sbom) -> Result<Vec<String>, StepError> {
        let mut frequency: HashMap<String, usize> = HashMap::new();
        let mut first_index: HashMap<String, usize> = HashMap::new();
        let mut any_candidates = false;

        for (index, path) in missing.iter().enumerate() {
            let providers = self.cache.lookup(path).map_err(StepError::Fatal)?;
            if !providers.is_empty() {
                any_candidates = true;
            }
            for package in providers {
                if sbom.contains(&package) {
                    continue;
                }
                *frequency.entry(package.clone()).or_insert(0) += 1;
                first_index.entry(package).or_insert(index);
            }
        }

        if !any_candidates {
            return Err(StepError::Sbom(SbomGenerationError::PackageResolutionError {
                message: format!(
                    "no package provides any of the files this command is missing: {}",
                    missing.join(", ")
                ),
                command_output: None,
                partial_sbom: sbom.clone(),
            }));
        }

        let mut ranked: Vec<String> = frequency.keys().cloned().collect();
        ranked.sort_by(|a, b| {
            let freq_a = frequency.get(a).copied().unwrap_or(0);
            let freq_b = frequency.get(b).copied().unwrap_or(0);
            freq_b
                .cmp(&freq_a)
                .then_with(|| {
                    let idx_a = first_index.get(a).copied().unwrap_or(0);
                    let idx_b = first_index.get(b).copied().unwrap_or(0);
                    idx_b.cmp(&idx_a)
                })
                .then_with(|| a.cmp(b))
        });
        Ok(ranked)
    }
}

/// Root-level missing-file seeds (spec.md §4.5 step 2): an absolute command is pushed
/// directly; a relative command (not `./…`) is resolved against every `PATH` entry; every
/// absolute argument is pushed too. These bypass `files_exist` entirely — they stand in
/// for paths the command couldn't even reach far enough to access.
fn seed_missing_files(argv: &[String], path_entries: &[String]) -> Vec<String> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut out = Vec::new();
    let mut push = |out: &mut Vec<String>, path: &str| {
        let path = canonicalize_if_changed(path);
        if seen.insert(path.clone()) {
            out.push(path);
        }
    };

    if let Some(cmd) = argv.first() {
        if cmd.starts_with('/') {
            push(&mut out, cmd);
        } else if !cmd.starts_with("./") {
            for dir in path_entries {
                push(&mut out, &format!("{}/{cmd}", dir.trim_end_matches('/')));
            }
        }
    }
    for arg in argv {
        if arg.starts_with('/') {
            push(&mut out, arg);
        }
    }
    out
}

fn random_suffix() -> String {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    format!("{:x}{:x}", std::process::id(), nanos)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sbom_equality_and_hash_ignore_order() {
        let a = Sbom::new().extended(&["gcc".to_string(), "make".to_string()]);
        let b = Sbom::new().extended(&["make".to_string(), "gcc".to_string()]);
        assert_eq!(a, b);

        let mut set = HashSet::new();
        set.insert(a);
        assert!(set.contains(&b));
    }

    #[test]
    fn sbom_display_preserves_insertion_order() {
        let sbom = Sbom::new().extended(&["zlib".to_string(), "libc".to_string()]);
        assert_eq!(sbom.to_string(), "zlib libc");
    }

    #[test]
    fn extended_skips_duplicates() {
        let sbom = Sbom::single("gcc").extended(&["gcc".to_string(), "make".to_string()]);
        assert_eq!(sbom.len(), 2);
    }

    #[test]
    fn issuperset_checks_membership_not_order() {
        let big = Sbom::new().extended(&["a".to_string(), "b".to_string(), "c".to_string()]);
        let small = Sbom::new().extended(&["c".to_string(), "a".to_string()]);
        assert!(big.issuperset(&small));
        assert!(!small.issuperset(&big));
    }

    #[test]
    fn seed_missing_files_resolves_relative_command_against_path() {
        let argv = vec!["git".to_string(), "--version".to_string()];
        let path = vec!["/usr/local/bin".to_string(), "/usr/bin".to_string()];
        let seeds = seed_missing_files(&argv, &path);
        assert_eq!(seeds, vec!["/usr/local/bin/git".to_string(), "/usr/bin/git".to_string()]);
    }

    #[test]
    fn seed_missing_files_pushes_absolute_command_and_arguments_unconditionally() {
        let argv = vec![
            "/bin/cp".to_string(),
            "/etc/hosts".to_string(),
            "relative-arg".to_string(),
        ];
        let seeds = seed_missing_files(&argv, &[]);
        assert_eq!(seeds, vec!["/bin/cp".to_string(), "/etc/hosts".to_string()]);
    }

    #[test]
    fn seed_missing_files_skips_dot_slash_relative_commands() {
        let argv = vec!["./run.sh".to_string()];
        assert!(seed_missing_files(&argv, &["/usr/bin".to_string()]).is_empty());
    }

    #[test]
    fn candidate_ranking_prefers_frequency_then_later_discovery_then_name() {
        // Hand-roll the ranking logic's contract without a real Cache: two packages tie
        // on frequency, and the one implicated by the later missing file should win.
        let mut frequency: HashMap<String, usize> = HashMap::new();
        let mut first_index: HashMap<String, usize> = HashMap::new();
        frequency.insert("zzz".to_string(), 1);
        frequency.insert("aaa".to_string(), 1);
        first_index.insert("zzz".to_string(), 0);
        first_index.insert("aaa".to_string(), 1);

        let mut ranked: Vec<String> = frequency.keys().cloned().collect();
        ranked.sort_by(|a, b| {
            let freq_a = frequency[a];
            let freq_b = frequency[b];
            freq_b
                .cmp(&freq_a)
                .then_with(|| first_index[b].cmp(&first_index[a]))
                .then_with(|| a.cmp(b))
        });
        assert_eq!(ranked, vec!["aaa".to_string(), "zzz".to_string()]);
    }
}
