use std::env;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

mod repl;

use clatter_core::error::{format_error, ERROR_TAG};
use clatter_core::options::OutputKind;
use clatter_core::{CompileOptions, Driver};

fn help() -> ! {
    println!("Usage: clatter compile [OPTIONS] <paths>");
    println!("       clatter run <script>");
    println!("       clatter repl");
    println!("       clatter -e CODE");
    println!();
    println!("Options:");
    println!("  --feature KEY         Activate a reader-conditional feature (repeatable)");
    println!("  --compile-path DIR    Where compiled modules are written");
    println!("  --protocols-path DIR  Where protocol modules are written");
    println!("  --output KIND         beam (default), core, or asm");
    println!("  --read-eval           Enable #=(...) read-time eval");
    println!("  --no-warn-host-fun    Suppress the symbol-as-host-fun warning");
    println!("  --no-warn-dynamic     Suppress the dynamic-var-name warning");
    println!("  --version             Show version");
    println!("  -h, --help            Show this help");
    std::process::exit(0);
}

fn bad_invocation(message: &str) -> ! {
    eprintln!("{} {}", ERROR_TAG, message);
    std::process::exit(2);
}

struct Cli {
    options: CompileOptions,
    command: Command,
}

enum Command {
    Compile(Vec<PathBuf>),
    Run(PathBuf),
    Eval(String),
    Repl,
}

fn parse_args(mut args: Vec<String>) -> Cli {
    let mut options = CompileOptions::default();
    let command = if args.first().map(|s| s.as_str()) == Some("compile") {
        args.remove(0);
        options.compile_files = true;
        Some("compile")
    } else if args.first().map(|s| s.as_str()) == Some("run") {
        args.remove(0);
        Some("run")
    } else if args.first().map(|s| s.as_str()) == Some("repl") {
        args.remove(0);
        Some("repl")
    } else {
        None
    };

    let mut paths = Vec::new();
    let mut eval_code = None;
    let mut iter = args.into_iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "-h" | "--help" => help(),
            "--version" => {
                println!("clatter {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--feature" => match iter.next() {
                Some(key) => {
                    options.features.insert(key.trim_start_matches(':').to_string());
                }
                None => bad_invocation("--feature expects a key"),
            },
            "--compile-path" => match iter.next() {
                Some(dir) => options.compile_path = Some(PathBuf::from(dir)),
                None => bad_invocation("--compile-path expects a directory"),
            },
            "--protocols-path" => match iter.next() {
                Some(dir) => options.compile_protocols_path = Some(PathBuf::from(dir)),
                None => bad_invocation("--protocols-path expects a directory"),
            },
            "--output" => match iter.next().as_deref() {
                Some("beam") => options.output = OutputKind::Beam,
                Some("core") => options.output = OutputKind::Core,
                Some("asm") => options.output = OutputKind::Asm,
                Some(other) => bad_invocation(&format!("unknown output kind '{}'", other)),
                None => bad_invocation("--output expects beam, core or asm"),
            },
            "--read-eval" => options.allow_read_eval = true,
            "--no-warn-host-fun" => options.no_warn_symbol_as_host_fun = true,
            "--no-warn-dynamic" => options.no_warn_dynamic_var_name = true,
            "-e" => match iter.next() {
                Some(code) => eval_code = Some(code),
                None => bad_invocation("-e expects code"),
            },
            other if other.starts_with('-') => {
                bad_invocation(&format!("unknown option: {}", other))
            }
            other => paths.push(PathBuf::from(other)),
        }
    }

    let command = match (command, eval_code) {
        (_, Some(code)) => Command::Eval(code),
        (Some("compile"), _) => {
            if paths.is_empty() {
                bad_invocation("compile expects at least one path");
            }
            Command::Compile(paths)
        }
        (Some("run"), _) => match paths.len() {
            1 => Command::Run(paths.remove(0)),
            _ => bad_invocation("run expects exactly one script"),
        },
        (Some("repl"), _) | (None, None) if paths.is_empty() => Command::Repl,
        (None, None) => match paths.len() {
            1 => Command::Run(paths.remove(0)),
            _ => bad_invocation("expected a single script to run"),
        },
        _ => bad_invocation("unexpected arguments"),
    };
    Cli { options, command }
}

fn report(err: &clatter_core::error::ClatterError) {
    for line in format_error(err) {
        eprintln!("{}", line);
    }
}

fn main() -> ExitCode {
    let cli = parse_args(env::args().skip(1).collect());
    match cli.command {
        Command::Compile(paths) => {
            let driver = Driver::new(cli.options);
            let mut failed = false;
            for path in &paths {
                match driver.compile_file(Path::new(path)) {
                    Ok(result) => {
                        for artifact in result.artifacts {
                            if let Some(path) = artifact.path {
                                println!("{}", path.display());
                            }
                        }
                    }
                    Err(err) => {
                        report(&err);
                        failed = true;
                    }
                }
            }
            if failed {
                ExitCode::from(1)
            } else {
                ExitCode::SUCCESS
            }
        }
        Command::Run(path) => {
            let driver = Driver::new(cli.options);
            match driver.compile_file(&path) {
                Ok(result) => {
                    println!("{}", result.value);
                    ExitCode::SUCCESS
                }
                Err(err) => {
                    report(&err);
                    ExitCode::from(1)
                }
            }
        }
        Command::Eval(code) => {
            let driver = Driver::new(cli.options);
            match driver.compile_source(&code) {
                Ok(result) => {
                    println!("{}", result.value);
                    ExitCode::SUCCESS
                }
                Err(err) => {
                    report(&err);
                    ExitCode::from(1)
                }
            }
        }
        Command::Repl => repl::run(cli.options),
    }
}
