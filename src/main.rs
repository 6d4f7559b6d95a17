mod cache;
mod cli;
mod config;
mod containers;
mod error;
mod multistep;
mod package_manager;
mod progress;
mod search;
mod signals;
mod strace;

fn main() {
    std::process::exit(cli::run());
}
