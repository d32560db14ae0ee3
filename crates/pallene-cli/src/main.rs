//! pallenec - command-line interface for the Pallene compiler
//!
//! Dispatches between emit modes and prints diagnostics to standard
//! error, one per line, as `<file>:<line>:<col>: <kind>: <message>`.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;
use log::debug;

use pallene_core::driver::{self, CompileOptions, DriverError, EmitMode};
use pallene_core::ir::passes::PassConfig;

#[derive(Parser)]
#[command(name = "pallenec")]
#[command(version = pallene_core::VERSION)]
#[command(about = "Compiler for the Pallene programming language", long_about = None)]
struct Cli {
    /// Input file (.pln, or .c with --emit-asm / --compile-c)
    input: PathBuf,

    /// Emit a .c file instead of an .so file
    #[arg(long)]
    emit_c: bool,

    /// Emit a .s file from a .c input
    #[arg(long)]
    emit_asm: bool,

    /// Emit a .lua file via the translator
    #[arg(long)]
    emit_lua: bool,

    /// Compile a .c file to an .so file
    #[arg(long)]
    compile_c: bool,

    /// Comma-separated analysis passes to run
    /// (uninitialized, constant_propagation; default: all)
    #[arg(long, value_delimiter = ',')]
    passes: Option<Vec<String>>,
}

impl Cli {
    /// Resolve the emit flags, rejecting conflicting combinations with
    /// the exact message the compiler has always printed
    fn mode(&self) -> Result<EmitMode, String> {
        let flags = [
            (self.emit_c, "--emit-c"),
            (self.emit_asm, "--emit-asm"),
            (self.emit_lua, "--emit-lua"),
            (self.compile_c, "--compile-c"),
        ];
        let on: Vec<&str> = flags.iter().filter(|(f, _)| *f).map(|(_, n)| *n).collect();
        if on.len() > 1 {
            return Err(format!(
                "Error: option '{}' can not be used together with option '{}'",
                on[1], on[0]
            ));
        }
        Ok(if self.emit_c {
            EmitMode::C
        } else if self.emit_asm {
            EmitMode::Asm
        } else if self.emit_lua {
            EmitMode::Lua
        } else if self.compile_c {
            EmitMode::CompileC
        } else {
            EmitMode::SharedLib
        })
    }
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();

    let mode = match cli.mode() {
        Ok(mode) => mode,
        Err(message) => {
            eprintln!("{message}");
            return ExitCode::FAILURE;
        }
    };

    let passes = match &cli.passes {
        Some(names) => match PassConfig::from_names(names.iter().map(String::as_str)) {
            Ok(config) => config,
            Err(err) => {
                eprintln!("Error: {err}");
                return ExitCode::FAILURE;
            }
        },
        None => PassConfig::all(),
    };

    let options = CompileOptions { mode, passes };
    match driver::compile(&cli.input, &options) {
        Ok(output) => {
            debug!("wrote {}", output.display());
            ExitCode::SUCCESS
        }
        Err(DriverError::Frontend(diagnostics)) => {
            for diagnostic in diagnostics {
                eprintln!("{diagnostic}");
            }
            ExitCode::FAILURE
        }
        Err(DriverError::Io(err)) => {
            eprintln!("{}: io: {err}", cli.input.display());
            ExitCode::FAILURE
        }
        Err(DriverError::Toolchain { program, stderr }) => {
            eprintln!("{}: toolchain: {program} failed", cli.input.display());
            eprint!("{stderr}");
            ExitCode::FAILURE
        }
        Err(err) => {
            eprintln!("Error: {err}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(args).expect("arguments should parse")
    }

    #[test]
    fn default_mode_is_shared_lib() {
        let cli = parse(&["pallenec", "foo.pln"]);
        assert_eq!(cli.mode().unwrap(), EmitMode::SharedLib);
    }

    #[test]
    fn emit_flags_select_modes() {
        assert_eq!(
            parse(&["pallenec", "--emit-c", "foo.pln"]).mode().unwrap(),
            EmitMode::C
        );
        assert_eq!(
            parse(&["pallenec", "--emit-lua", "foo.pln"]).mode().unwrap(),
            EmitMode::Lua
        );
        assert_eq!(
            parse(&["pallenec", "--compile-c", "foo.c"]).mode().unwrap(),
            EmitMode::CompileC
        );
    }

    #[test]
    fn conflicting_flags_report_the_exact_message() {
        let cli = parse(&["pallenec", "--emit-c", "--emit-asm", "foo.pln"]);
        let err = cli.mode().unwrap_err();
        assert_eq!(
            err,
            "Error: option '--emit-asm' can not be used together with option '--emit-c'"
        );
    }

    #[test]
    fn passes_are_comma_separated() {
        let cli = parse(&["pallenec", "--passes", "uninitialized", "foo.pln"]);
        assert_eq!(cli.passes.as_deref(), Some(&["uninitialized".to_string()][..]));
    }
}
