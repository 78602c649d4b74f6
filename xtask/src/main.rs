use std::env;
use std::path::PathBuf;
use std::process::{Command, ExitCode};

fn main() -> ExitCode {
    let args: Vec<String> = env::args().skip(1).collect();

    if args.is_empty() {
        print_help();
        return ExitCode::SUCCESS;
    }

    match args[0].as_str() {
        "test" => test(&args[1..]),
        "regress" => regress(&args[1..]),
        "help" | "--help" | "-h" => {
            print_help();
            ExitCode::SUCCESS
        }
        cmd => {
            eprintln!("Unknown command: {cmd}");
            eprintln!();
            print_help();
            ExitCode::FAILURE
        }
    }
}

fn print_help() {
    eprintln!(
        r#"relay-harness xtask

USAGE:
    cargo xtask <COMMAND> [OPTIONS]

COMMANDS:
    test [ARGS]                Run the harness's own tests (unit + loopback)
                               and the scenarios against the stub relay
                               ARGS are passed to cargo test

    regress --relay <PATH> [--scale <N>] [-- ARGS]
                               Run the scenario suite against a relay binary
                               --scale stretches every pacing sleep N times
                               ARGS are passed to the scenario runner

    help                       Print this help message

EXAMPLES:
    cargo xtask test
    cargo xtask regress --relay ../tiburoncin/tiburoncin
    cargo xtask regress --relay ./tiburoncin --scale 4 -- slow_receiver
"#
    );
}

fn project_root() -> PathBuf {
    let manifest_dir = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    match manifest_dir.parent() {
        Some(root) => root.to_path_buf(),
        None => manifest_dir,
    }
}

fn test(args: &[String]) -> ExitCode {
    let root = project_root();

    let mut cmd = Command::new("cargo");
    cmd.current_dir(&root)
        .args(["test", "-p", "relay-harness", "-p", "relay-regress"]);

    if !args.is_empty() {
        cmd.args(args);
    }

    run(cmd, "tests")
}

fn regress(args: &[String]) -> ExitCode {
    let (own, passthrough) = match args.iter().position(|a| a == "--") {
        Some(pos) => (&args[..pos], &args[pos + 1..]),
        None => (args, &[][..]),
    };

    let mut relay = None;
    let mut scale = None;
    let mut iter = own.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--relay" => relay = iter.next().cloned(),
            "--scale" => scale = iter.next().cloned(),
            other => {
                eprintln!("Unknown regress option: {other}");
                return ExitCode::FAILURE;
            }
        }
    }

    let Some(relay) = relay else {
        eprintln!("Usage: cargo xtask regress --relay <PATH> [--scale <N>] [-- ARGS]");
        return ExitCode::FAILURE;
    };

    // Scenarios may start the relay from another working directory.
    let relay = match std::fs::canonicalize(&relay) {
        Ok(path) => path,
        Err(e) => {
            eprintln!("Relay binary {relay} not found: {e}");
            return ExitCode::FAILURE;
        }
    };

    let root = project_root();
    let mut cmd = Command::new("cargo");
    cmd.current_dir(&root)
        .args(["test", "-p", "relay-regress", "--test", "regress"])
        .env("RELAY_BIN", &relay);
    if let Some(scale) = scale {
        cmd.env("RELAY_SLEEP_SCALE", scale);
    }
    cmd.arg("--");
    // One scenario at a time.
    cmd.arg("--test-threads=1");
    cmd.args(passthrough);

    eprintln!("==> Running scenarios against {}", relay.display());
    run(cmd, "scenarios")
}

fn run(mut cmd: Command, what: &str) -> ExitCode {
    match cmd.status() {
        Ok(s) if s.success() => ExitCode::SUCCESS,
        Ok(_) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("Failed to run {what}: {e}");
            ExitCode::FAILURE
        }
    }
}
