//! Abstracts an OCi engine (docker or podman) into image snapshots, a stack-like setup
//! container, and a running execution — shelling out to the engine's CLI rather than
//! linking against its API, since no image/commit/exec client crate is available here.

use std::cell::Cell;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::rc::Rc;
use std::time::Duration;

use serde::Deserialize;

use crate::error::DeptectiveError;

const FILES_EXIST_BATCH: usize = 255;
const ALLOWED_LOGGING_DRIVERS: &[&str] = &["json-file", "journald"];

/// The engine binary to shell out to (`docker` or `podman`); both speak the same CLI
/// surface this module relies on.
#[derive(Debug, Clone)]
pub struct Engine {
    binary: String,
}

impl Engine {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Probes `PATH` for `docker`, falling back to `podman`.
    pub fn detect() -> Result<Self, DeptectiveError> {
        for candidate in ["docker", "podman"] {
            if which(candidate) {
                return Ok(Self::new(candidate));
            }
        }
        Err(DeptectiveError::Engine(
            "neither docker nor podman was found on PATH".to_string(),
        ))
    }

    fn command(&self) -> Command {
        Command::new(&self.binary)
    }

    fn run_and_capture(&self, args: &[&str]) -> Result<(i32, Vec<u8>), anyhow::Error> {
        let output = self.command().args(args).output()?;
        let mut combined = output.stdout;
        combined.extend_from_slice(&output.stderr);
        Ok((output.status.code().unwrap_or(-1), combined))
    }

    /// Starts a detached, tty-allocated setup container from `image`, returning its id.
    pub fn run_detached(
        &self,
        image: &str,
        volumes: &HashMap<PathBuf, (PathBuf, bool)>,
    ) -> Result<String, anyhow::Error> {
        let mut cmd = self.command();
        cmd.args(["run", "--detach", "--tty", "--entrypoint", "/bin/bash"]);
        for (host, (container_path, read_only)) in volumes {
            let mode = if *read_only { "ro" } else { "rw" };
            cmd.arg("--volume").arg(format!(
                "{}:{}:{}",
                host.display(),
                container_path.display(),
                mode
            ));
        }
        cmd.arg(image);
        let output = cmd.stdout(Stdio::piped()).output()?;
        if !output.status.success() {
            anyhow::bail!(
                "failed to start container from {image}: {}",
                String::from_utf8_lossy(&output.stderr)
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Runs a shell command inside an already-running container, returning `(exit_code, output)`.
    pub fn exec(&self, container_id: &str, shell_command: &str) -> Result<(i32, Vec<u8>), anyhow::Error> {
        self.run_and_capture(&["exec", container_id, "/bin/sh", "-c", shell_command])
    }

    /// Commits a running container to `repo:tag`, returning the resulting image id.
    pub fn commit(&self, container_id: &str, repo: &str, tag: &str) -> Result<String, anyhow::Error> {
        let reference = format!("{repo}:{tag}");
        let output = self
            .command()
            .args(["commit", container_id, &reference])
            .stdout(Stdio::piped())
            .output()?;
        if !output.status.success() {
            anyhow::bail!(
                "failed to commit {container_id} as {reference}: {}",
                String::from_utf8_lossy(&output.stderr)
            );
        }
        Ok(reference)
    }

    pub fn remove_container(&self, container_id: &str) -> Result<(), anyhow::Error> {
        let _ = self
            .command()
            .args(["rm", "--force", container_id])
            .output()?;
        Ok(())
    }

    pub fn remove_image(&self, reference: &str) -> Result<(), anyhow::Error> {
        let _ = self
            .command()
            .args(["rmi", "--force", reference])
            .output()?;
        Ok(())
    }

    /// Builds `context_dir/Dockerfile` and tags the result as `reference`.
    pub fn build_image(&self, context_dir: &Path, reference: &str) -> Result<(), anyhow::Error> {
        let output = self
            .command()
            .args(["build", "--tag", reference])
            .arg(context_dir)
            .output()?;
        if !output.status.success() {
            anyhow::bail!(
                "failed to build {reference}: {}",
                String::from_utf8_lossy(&output.stderr)
            );
        }
        Ok(())
    }

    pub fn image_exists(&self, reference: &str) -> bool {
        self.command()
            .args(["image", "inspect", reference])
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    pub fn wait(&self, container_id: &str) -> Result<i32, anyhow::Error> {
        let output = self
            .command()
            .args(["wait", container_id])
            .stdout(Stdio::piped())
            .output()?;
        let code = String::from_utf8_lossy(&output.stdout)
            .trim()
            .parse::<i32>()
            .unwrap_or(-1);
        Ok(code)
    }

    pub fn logs(&self, container_id: &str, tail: Option<usize>) -> Vec<u8> {
        let mut args = vec!["logs".to_string()];
        if let Some(n) = tail {
            args.push("--tail".to_string());
            args.push(n.to_string());
        }
        args.push(container_id.to_string());
        self.command()
            .args(&args)
            .output()
            .map(|o| {
                let mut combined = o.stdout;
                combined.extend_from_slice(&o.stderr);
                combined
            })
            .unwrap_or_default()
    }

    pub fn is_exited(&self, container_id: &str) -> bool {
        #[derive(Deserialize)]
        struct InspectEntry {
            #[serde(rename = "State")]
            state: InspectState,
        }
        #[derive(Deserialize)]
        struct InspectState {
            #[serde(rename = "Status")]
            status: String,
        }
        let output = self.command().args(["inspect", container_id]).output();
        let Ok(output) = output else { return true };
        if !output.status.success() {
            return true;
        }
        match serde_json::from_slice::<Vec<InspectEntry>>(&output.stdout) {
            Ok(entries) => entries
                .first()
                .map(|e| e.state.status == "exited")
                .unwrap_or(true),
            Err(_) => false,
        }
    }

    /// Fails fast if the container's logging driver is anything other than
    /// `json-file` or `journald` — the two drivers this module knows how to tail.
    pub fn check_logging_driver(&self, container_id: &str) -> Result<(), anyhow::Error> {
        #[derive(Deserialize)]
        struct InspectEntry {
            #[serde(rename = "HostConfig")]
            host_config: HostConfig,
        }
        #[derive(Deserialize)]
        struct HostConfig {
            #[serde(rename = "LogConfig")]
            log_config: LogConfig,
        }
        #[derive(Deserialize)]
        struct LogConfig {
            #[serde(rename = "Type")]
            driver_type: String,
        }
        let output = self.command().args(["inspect", container_id]).output()?;
        let entries: Vec<InspectEntry> = serde_json::from_slice(&output.stdout)?;
        let driver = entries
            .first()
            .map(|e| e.host_config.log_config.driver_type.clone())
            .unwrap_or_default();
        if !ALLOWED_LOGGING_DRIVERS.contains(&driver.as_str()) {
            anyhow::bail!("unsupported container logging driver: {driver}");
        }
        Ok(())
    }
}

fn which(binary: &str) -> bool {
    Command::new("which")
        .arg(binary)
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// A live setup container, handed to a [`PackageManager`](crate::package_manager::PackageManager)
/// so it can run `update`/`install` before the caller commits a new snapshot.
pub struct ContainerHandle<'a> {
    engine: &'a Engine,
    id: String,
}

impl<'a> ContainerHandle<'a> {
    pub fn new(engine: &'a Engine, id: String) -> Self {
        Self { engine, id }
    }

    pub fn exec(&self, shell_command: &str) -> Result<(i32, Vec<u8>), anyhow::Error> {
        self.engine.exec(&self.id, shell_command)
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

/// An immutable, tagged image snapshot. Per-run snapshots are reference-counted by the
/// step tree: a child step opening its parent bumps the count via [`Image::acquire`];
/// the long-lived base image (built once from the distribution recipe) is not part of
/// this scheme and [`Image::release`] is a no-op for it.
#[derive(Clone)]
pub struct Image {
    engine: Engine,
    reference: String,
    refcount: Rc<Cell<usize>>,
    releasable: bool,
}

impl Image {
    /// The long-lived base image built from the distribution's Dockerfile recipe; never
    /// removed by step refcounting.
    pub fn base(engine: Engine, reference: String) -> Self {
        Self {
            engine,
            reference,
            refcount: Rc::new(Cell::new(1)),
            releasable: false,
        }
    }

    /// A per-step committed snapshot, owned by exactly the caller until acquired again.
    pub fn snapshot(engine: Engine, reference: String) -> Self {
        Self {
            engine,
            reference,
            refcount: Rc::new(Cell::new(1)),
            releasable: true,
        }
    }

    pub fn reference(&self) -> &str {
        &self.reference
    }

    /// Called when a child step opens this image as its parent; bumps the refcount.
    pub fn acquire(&self) -> Self {
        self.refcount.set(self.refcount.get() + 1);
        self.clone()
    }

    /// Releases one reference; removes the underlying engine image when the count hits
    /// zero, unless this is the non-releasable base image.
    pub fn release(self) -> Result<(), anyhow::Error> {
        let remaining = self.refcount.get().saturating_sub(1);
        self.refcount.set(remaining);
        if remaining == 0 && self.releasable {
            self.engine.remove_image(&self.reference)?;
        }
        Ok(())
    }
}

/// A stack-like container handle: `start` runs a short-lived setup container against the
/// parent image, lets the caller mutate it, then commits to a new snapshot; `stop`
/// removes the committed snapshot and releases the parent reference. Re-entrant via an
/// internal entry counter, mirroring the search tree's Step-as-Container relationship.
pub struct Container {
    engine: Engine,
    parent: Image,
    image: Option<Image>,
    entries: usize,
    tag_repo: String,
    level: u32,
}

impl Container {
    /// Opens `parent` as this container's base image, bumping its refcount for the
    /// lifetime of this `Container`.
    pub fn new(engine: Engine, parent: Image, tag_repo: String, level: u32) -> Self {
        let parent = parent.acquire();
        Self {
            engine,
            parent,
            image: None,
            entries: 0,
            tag_repo,
            level,
        }
    }

    pub fn image(&self) -> &Image {
        self.image.as_ref().unwrap_or(&self.parent)
    }

    /// Increments the entry count, starting the underlying setup container on the first entry.
    pub fn enter(
        &mut self,
        volumes: &HashMap<PathBuf, (PathBuf, bool)>,
        setup: impl FnOnce(&ContainerHandle) -> Result<(), anyhow::Error>,
    ) -> Result<(), anyhow::Error> {
        self.entries += 1;
        if self.entries == 1 {
            if let Err(e) = self.start(volumes, setup) {
                self.entries -= 1;
                return Err(e);
            }
        }
        Ok(())
    }

    /// Decrements the entry count, committing removal and releasing the parent reference
    /// once the count returns to zero.
    pub fn exit(&mut self) -> Result<(), anyhow::Error> {
        assert!(self.entries > 0, "Container::exit called without a matching enter");
        self.entries -= 1;
        if self.entries == 0 {
            self.stop()?;
        }
        Ok(())
    }

    fn start(
        &mut self,
        volumes: &HashMap<PathBuf, (PathBuf, bool)>,
        setup: impl FnOnce(&ContainerHandle) -> Result<(), anyhow::Error>,
    ) -> Result<(), anyhow::Error> {
        let container_id = self.engine.run_detached(self.parent.reference(), volumes)?;
        let handle = ContainerHandle {
            engine: &self.engine,
            id: container_id.clone(),
        };
        let setup_result = setup(&handle);
        if let Err(e) = setup_result {
            self.engine.remove_container(&container_id)?;
            return Err(e);
        }
        let tag = format!("step{}", self.level);
        let reference = self.engine.commit(&container_id, &self.tag_repo, &tag)?;
        self.engine.remove_container(&container_id)?;
        self.image = Some(Image::snapshot(self.engine.clone(), reference));
        Ok(())
    }

    fn stop(&mut self) -> Result<(), anyhow::Error> {
        if let Some(image) = self.image.take() {
            image.release()?;
        }
        self.parent.clone().release()
    }

    /// Batch-checks which of `paths` do not exist in this snapshot, by invoking the
    /// embedded `deptective-files-exist` helper in groups of at most 255 arguments.
    pub fn files_exist(&self, paths: &[String]) -> Result<HashMap<String, bool>, anyhow::Error> {
        if paths.is_empty() {
            return Ok(HashMap::new());
        }
        let mut result: HashMap<String, bool> = paths.iter().map(|p| (p.clone(), true)).collect();
        for batch in paths.chunks(FILES_EXIST_BATCH) {
            let mut args = vec!["run", "--rm", "--entrypoint", "/usr/bin/deptective-files-exist"];
            args.push(self.image().reference());
            let mut cmd = Command::new(self.engine_binary());
            cmd.args(&args[..args.len() - 1]).arg(self.image().reference());
            for path in batch {
                cmd.arg(path);
            }
            let output = cmd.output()?;
            if !output.status.success() {
                anyhow::bail!(
                    "deptective-files-exist exited nonzero: {}",
                    String::from_utf8_lossy(&output.stderr)
                );
            }
            for line in output.stdout.split(|b| *b == b'\n') {
                if line.is_empty() {
                    continue;
                }
                let path = String::from_utf8_lossy(line).trim().to_string();
                result.insert(path, false);
            }
        }
        Ok(result)
    }

    /// Reads the `PATH` baked into this snapshot, used to resolve a relative command
    /// before running it, by asking a throwaway container to echo it.
    pub fn read_path(&self) -> Result<Vec<String>, anyhow::Error> {
        let output = Command::new(self.engine_binary())
            .args(["run", "--rm", "--entrypoint", "/bin/sh"])
            .arg(self.image().reference())
            .args(["-c", "echo \"$PATH\""])
            .output()?;
        if !output.status.success() {
            anyhow::bail!(
                "failed to read PATH from {}: {}",
                self.image().reference(),
                String::from_utf8_lossy(&output.stderr)
            );
        }
        let path = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok(path.split(':').filter(|s| !s.is_empty()).map(String::from).collect())
    }

    fn engine_binary(&self) -> &str {
        &self.engine.binary
    }
}

/// A running container produced from a committed snapshot with a specific command. The
/// driver polls [`Execution::done`] at ~0.5s intervals so the progress surface can refresh.
pub struct Execution<'e> {
    engine: &'e Engine,
    container_id: String,
    closed: bool,
    output: Option<Vec<u8>>,
    exit_code: Option<i32>,
}

impl<'e> Execution<'e> {
    pub fn start(
        engine: &'e Engine,
        image: &Image,
        entrypoint: &str,
        command: &[String],
        workdir: &str,
        volumes: &HashMap<PathBuf, (PathBuf, bool)>,
    ) -> Result<Self, anyhow::Error> {
        let mut args = vec![
            "run".to_string(),
            "--detach".to_string(),
            "--tty".to_string(),
            "--workdir".to_string(),
            workdir.to_string(),
            "--entrypoint".to_string(),
            entrypoint.to_string(),
        ];
        for (host, (container_path, read_only)) in volumes {
            let mode = if *read_only { "ro" } else { "rw" };
            args.push("--volume".to_string());
            args.push(format!(
                "{}:{}:{}",
                host.display(),
                container_path.display(),
                mode
            ));
        }
        args.push(image.reference().to_string());
        args.extend(command.iter().cloned());
        let output = Command::new(&engine.binary).args(&args).output()?;
        if !output.status.success() {
            anyhow::bail!(
                "failed to start execution: {}",
                String::from_utf8_lossy(&output.stderr)
            );
        }
        let container_id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        engine.check_logging_driver(&container_id)?;
        Ok(Self {
            engine,
            container_id,
            closed: false,
            output: None,
            exit_code: None,
        })
    }

    /// Non-blocking: true iff the container has exited or been closed.
    pub fn done(&mut self) -> bool {
        if self.closed {
            return true;
        }
        if self.engine.is_exited(&self.container_id) {
            let _ = self.close();
            return true;
        }
        false
    }

    /// Blocks until the execution completes, returning its exit code.
    pub fn exit_code(&mut self) -> Result<i32, anyhow::Error> {
        if self.exit_code.is_none() {
            let code = self.engine.wait(&self.container_id)?;
            self.exit_code = Some(code);
            self.close()?;
        }
        Ok(self.exit_code.unwrap())
    }

    /// Blocks until completion, returning the combined stdout/stderr bytes.
    pub fn output(&mut self) -> Result<Vec<u8>, anyhow::Error> {
        let _ = self.exit_code()?;
        Ok(self.output.clone().unwrap_or_default())
    }

    /// Best-effort tail of current output; empty once [`Execution::close`] has run.
    pub fn logs(&mut self, scrollback: usize) -> Vec<u8> {
        if self.done() {
            return self.output.clone().unwrap_or_default();
        }
        self.engine.logs(&self.container_id, Some(scrollback))
    }

    /// Idempotent; forcibly removes the container.
    pub fn close(&mut self) -> Result<(), anyhow::Error> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.output = Some(self.engine.logs(&self.container_id, None));
        if self.exit_code.is_none() {
            self.exit_code = Some(self.engine.wait(&self.container_id)?);
        }
        self.engine.remove_container(&self.container_id)?;
        Ok(())
    }
}

impl<'e> Drop for Execution<'e> {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// Polls `exe.done()` at ~0.5s intervals, matching the driver's single-threaded
/// polling cadence described for the search engine.
pub fn await_done(exe: &mut Execution, mut on_tick: impl FnMut()) -> Result<(), anyhow::Error> {
    while !exe.done() {
        on_tick();
        std::thread::sleep(Duration::from_millis(500));
    }
    Ok(())
}

/// Resolves embedded `..` in a path when canonicalizing changes the string, matching
/// the search engine's missing-file path normalization.
pub fn canonicalize_if_changed(path: &str) -> String {
    if !path.contains("..") {
        return path.to_string();
    }
    match std::fs::canonicalize(Path::new(path)) {
        Ok(resolved) => {
            let resolved = resolved.to_string_lossy().to_string();
            if resolved != path {
                resolved
            } else {
                path.to_string()
            }
        }
        Err(_) => lexical_normalize(path),
    }
}

/// Lexical `..`-collapse for paths that don't exist on the host (they live only inside
/// the container), so normalization never depends on host filesystem state.
fn lexical_normalize(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    format!("/{}", parts.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lexical_normalize_collapses_dotdot() {
        assert_eq!(lexical_normalize("/foo/bar/../baz"), "/foo/baz");
        assert_eq!(lexical_normalize("/foo/../../baz"), "/baz");
    }

    #[test]
    fn canonicalize_passthrough_without_dotdot() {
        assert_eq!(canonicalize_if_changed("/usr/bin/gcc"), "/usr/bin/gcc");
    }
}
