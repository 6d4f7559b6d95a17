//! Entrypoint baked into every distribution base image: `deptective-strace <log-path>
//! <cmd> [args…]` runs `cmd` under native strace, writing the raw trace to `<log-path>`
//! via strace's own `-o` so the command's real stdout/stderr reach the caller untouched,
//! then forwards `cmd`'s exit code verbatim.

use std::os::unix::process::ExitStatusExt;
use std::process::Command;

const STRACE_BINARY: &str = "/usr/bin/strace-native";

fn main() {
    let mut argv = std::env::args().skip(1);
    let Some(log_path) = argv.next() else {
        eprintln!("deptective-strace: no log path given");
        std::process::exit(2);
    };
    let command: Vec<String> = argv.collect();
    if command.is_empty() {
        eprintln!("deptective-strace: no command given");
        std::process::exit(2);
    }

    let status = Command::new(STRACE_BINARY)
        .args(["-f", "-qq", "-v", "-s", "65536", "-o", &log_path])
        .arg("--")
        .args(&command)
        .status();

    match status {
        Ok(status) => {
            let code = status
                .code()
                .unwrap_or_else(|| 128 + status.signal().unwrap_or(0));
            std::process::exit(code);
        }
        Err(e) => {
            eprintln!("deptective-strace: failed to run {STRACE_BINARY}: {e}");
            std::process::exit(127);
        }
    }
}
