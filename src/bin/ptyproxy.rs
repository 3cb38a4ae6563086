//! ptyproxy - standalone PTY proxy
//!
//! `new` runs a command on a pseudo-terminal, relaying stdin to it and its
//! output to stdout until it exits. `resize` asks a running proxy to change
//! its terminal size through the proxy's control socket.

use std::fs::File;
use std::io;
use std::os::fd::AsFd;
use std::path::PathBuf;
use std::process::ExitCode;

use ptyproxy::config::ProxyConfig;
use ptyproxy::control;
use ptyproxy::error::{exit_code, SetupError};
use ptyproxy::pty::UnixBackend;
use ptyproxy::pump::WriterSink;
use ptyproxy::relay::{self, RelayExit};
use ptyproxy::session::{SessionHandle, SessionOptions};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn main() -> ExitCode {
    // Logs go to stderr; stdout carries the child's output
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();

    let mut args: Vec<String> = std::env::args().skip(1).collect();

    let mut config_path: Option<PathBuf> = None;
    if args.first().map(String::as_str) == Some("--config") {
        if args.len() < 2 {
            eprintln!("--config needs a path");
            return ExitCode::from(exit_code::INVALID_ARGS);
        }
        config_path = Some(PathBuf::from(args.remove(1)));
        args.remove(0);
    }

    let config = match &config_path {
        Some(path) => match ProxyConfig::load(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Error loading config '{}': {}", path.display(), e);
                return ExitCode::from(exit_code::CONFIG);
            },
        },
        None => ProxyConfig::load_or_default(),
    };

    match args.first().map(String::as_str) {
        Some("new") => ExitCode::from(run_new(&config, &args[1..])),
        Some("resize") => ExitCode::from(run_resize(&config, &args[1..])),
        Some("-h") | Some("--help") => {
            print_help();
            ExitCode::SUCCESS
        },
        _ => {
            print_help();
            ExitCode::from(exit_code::INVALID_ARGS)
        },
    }
}

/// `new <id> <width> <height> <command...>`
fn run_new(config: &ProxyConfig, args: &[String]) -> u8 {
    if args.len() < 4 {
        eprintln!("usage: ptyproxy new <id> <width> <height> <command...>");
        return exit_code::INVALID_ARGS;
    }
    let id = &args[0];
    let Some((cols, rows)) = parse_size(&args[1], &args[2]) else {
        eprintln!("width and height must be numbers");
        return exit_code::INVALID_ARGS;
    };
    let command = args[3..].join(" ");

    let backend = match UnixBackend::shared() {
        Ok(backend) => backend,
        Err(e) => return setup_failed(SetupError::BackendUnavailable(e)),
    };

    let options = SessionOptions::new(cols, rows, command)
        .with_id(id.as_str())
        .with_sink(WriterSink::new(io::stdout()));
    let mut session = match SessionHandle::create_with(backend, config, options) {
        Ok(session) => session,
        Err(e) => return setup_failed(e),
    };

    let mut input = match io::stdin().as_fd().try_clone_to_owned() {
        Ok(fd) => File::from(fd),
        Err(e) => {
            eprintln!("Failed to open stdin: {}", e);
            return exit_code::IO;
        },
    };

    let code = match relay::run(&mut session, &mut input) {
        Ok(RelayExit::ChildExited) | Ok(RelayExit::InputClosed) => 0,
        Err(e) => {
            eprintln!("Relay failed: {}", e);
            exit_code::IO
        },
    };

    session.close();
    if let Some(status) = session.exit_code() {
        tracing::info!(status, "child exited");
    }
    code
}

/// `resize <id> <width> <height>`
fn run_resize(config: &ProxyConfig, args: &[String]) -> u8 {
    if args.len() != 3 {
        eprintln!("usage: ptyproxy resize <id> <width> <height>");
        return exit_code::INVALID_ARGS;
    }
    let Some((cols, rows)) = parse_size(&args[1], &args[2]) else {
        eprintln!("width and height must be numbers");
        return exit_code::INVALID_ARGS;
    };

    match control::send_resize(&config.runtime_dir(), &args[0], cols, rows) {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("Resize failed: {}", e);
            e.exit_code()
        },
    }
}

fn parse_size(width: &str, height: &str) -> Option<(u32, u32)> {
    Some((width.parse().ok()?, height.parse().ok()?))
}

fn setup_failed(e: SetupError) -> u8 {
    eprintln!("Failed to start session: {}", e);
    e.exit_code()
}

fn print_help() {
    println!("ptyproxy - pseudo-terminal proxy");
    println!();
    println!("Usage:");
    println!("  ptyproxy [--config <PATH>] new <ID> <WIDTH> <HEIGHT> <COMMAND...>");
    println!("  ptyproxy [--config <PATH>] resize <ID> <WIDTH> <HEIGHT>");
    println!();
    println!("Commands:");
    println!("  new       Run COMMAND on a WIDTHxHEIGHT pty, relaying stdin and stdout");
    println!("  resize    Resize the running session ID");
    println!();
    println!("Options:");
    println!("  --config <PATH>  Load settings from a JSON file");
    println!("  -h, --help       Show this help message");
    println!();
    println!("Examples:");
    println!("  ptyproxy new build 120 40 make test");
    println!("  ptyproxy resize build 160 50");
}
