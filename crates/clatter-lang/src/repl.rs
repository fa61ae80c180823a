use std::io::{self, BufRead, Write};
use std::process::ExitCode;

use clatter_core::error::format_error;
use clatter_core::{CompileOptions, Driver};

/// Line-at-a-time REPL over stdin. One driver for the whole session so defs
/// and namespaces persist between inputs.
pub fn run(options: CompileOptions) -> ExitCode {
    let driver = Driver::new(options);
    let stdin = io::stdin();
    let mut line = String::new();
    loop {
        print!("clatter> ");
        if io::stdout().flush().is_err() {
            return ExitCode::from(1);
        }
        line.clear();
        match stdin.lock().read_line(&mut line) {
            Ok(0) => return ExitCode::SUCCESS,
            Ok(_) => {}
            Err(_) => return ExitCode::from(1),
        }
        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        if input == ":quit" || input == ":q" {
            return ExitCode::SUCCESS;
        }
        match driver.compile_source(input) {
            Ok(result) => println!("{}", result.value),
            Err(err) => {
                for line in format_error(&err) {
                    eprintln!("{}", line);
                }
            }
        }
    }
}
