//! trapdoor - run file reads under syscall interception
//!
//! Installs the engine from config and flags, then reads each FILE and
//! prints its size and first line. Every open goes through the trap
//! handler, so redirects and denials show up in what gets printed.
//!
//!   --config FILE        Load engine config from FILE
//!   --redirect FROM TO   Open TO whenever FROM is opened
//!   --deny PATH          Fail opens of PATH with EACCES
//!   --quiet              Do not log trapped calls
//!   --fail-closed        Deny every syscall not ruled or allowed
//!   --help               Show usage

use std::fs;
use std::path::PathBuf;
use std::process;

use tracing::info;
use tracing_subscriber::EnvFilter;

use trapdoor::config::{DefaultMode, DenyPathConfig, RedirectConfig};
use trapdoor::{Engine, EngineConfig};

/// What this program needs once everything else is denied. The trap
/// handler's own syscalls are allowed by the filter compiler.
const FAIL_CLOSED_ALLOW: &[&str] = &[
    "read",
    "write",
    "close",
    "fstat",
    "newfstatat",
    "statx",
    "lseek",
    "mmap",
    "munmap",
    "mprotect",
    "madvise",
    "brk",
    "futex",
    "sigaltstack",
    "rt_sigprocmask",
    "rt_sigaction",
    "exit",
    "exit_group",
];

struct Options {
    config: Option<PathBuf>,
    redirects: Vec<(String, String)>,
    deny: Vec<String>,
    quiet: bool,
    fail_closed: bool,
    files: Vec<PathBuf>,
}

fn print_usage() {
    eprintln!("trapdoor - read files under syscall interception");
    eprintln!();
    eprintln!("Usage: trapdoor [OPTIONS] FILE...");
    eprintln!();
    eprintln!("  --config FILE        Load engine config from FILE");
    eprintln!("  --redirect FROM TO   Open TO whenever FROM is opened");
    eprintln!("  --deny PATH          Fail opens of PATH with EACCES");
    eprintln!("  --quiet              Do not log trapped calls");
    eprintln!("  --fail-closed        Deny every syscall not ruled or allowed");
    eprintln!("  --help               Show this help");
    eprintln!();
    eprintln!("Config is also read from $TRAPDOOR_CONFIG or ~/.config/trapdoor/config.json.");
}

fn parse_args() -> Options {
    let mut opts = Options {
        config: None,
        redirects: Vec::new(),
        deny: Vec::new(),
        quiet: false,
        fail_closed: false,
        files: Vec::new(),
    };

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => match args.next() {
                Some(path) => opts.config = Some(PathBuf::from(path)),
                None => {
                    eprintln!("--config requires a file argument");
                    process::exit(1);
                }
            },
            "--redirect" => match (args.next(), args.next()) {
                (Some(from), Some(to)) => opts.redirects.push((from, to)),
                _ => {
                    eprintln!("--redirect requires FROM and TO");
                    eprintln!("  Example: trapdoor --redirect /etc/hosts /etc/hostname /etc/hosts");
                    process::exit(1);
                }
            },
            "--deny" => match args.next() {
                Some(path) => opts.deny.push(path),
                None => {
                    eprintln!("--deny requires a path argument");
                    process::exit(1);
                }
            },
            "--quiet" | "-q" => opts.quiet = true,
            "--fail-closed" => opts.fail_closed = true,
            "--help" | "-h" => {
                print_usage();
                process::exit(0);
            }
            other if other.starts_with("--") => {
                eprintln!("Unknown option: {}", other);
                print_usage();
                process::exit(1);
            }
            file => opts.files.push(PathBuf::from(file)),
        }
    }

    if opts.files.is_empty() {
        print_usage();
        process::exit(1);
    }
    opts
}

fn build_config(opts: &Options) -> trapdoor::Result<EngineConfig> {
    let mut config = match &opts.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::discover()?,
    };

    for (from, to) in &opts.redirects {
        config.redirects.push(RedirectConfig {
            from: from.clone(),
            to: to.clone(),
        });
    }
    for path in &opts.deny {
        config.deny_paths.push(DenyPathConfig {
            path: path.clone(),
            errno: libc::EACCES,
        });
    }
    if opts.quiet {
        config.observe = None;
    }
    if opts.fail_closed {
        config.default = DefaultMode::Deny;
        for name in FAIL_CLOSED_ALLOW {
            if !config.allow.iter().any(|a| a == name) {
                config.allow.push(name.to_string());
            }
        }
    }
    Ok(config)
}

/// First line of `bytes`, lossily decoded and without its newline.
fn first_line(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == b'\n').unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let opts = parse_args();

    let config = match build_config(&opts) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("{e}");
            process::exit(1);
        }
    };
    let builder = match Engine::builder().from_config(&config) {
        Ok(b) => b,
        Err(e) => {
            eprintln!("{e}");
            process::exit(1);
        }
    };

    let engine = builder.install_or_abort();

    let mut status = 0;
    for file in &opts.files {
        match fs::read(file) {
            Ok(bytes) => println!(
                "{}: {} bytes, first line: {:?}",
                file.display(),
                bytes.len(),
                first_line(&bytes)
            ),
            Err(e) => {
                eprintln!("{}: {}", file.display(), e);
                status = 1;
            }
        }
    }

    let stats = engine.shutdown();
    info!(
        traps = stats.traps,
        reissued = stats.reissued,
        denied = stats.denied,
        unrecognized = stats.unrecognized,
        "done"
    );
    process::exit(status);
}
