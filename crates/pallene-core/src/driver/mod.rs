//! Pipeline driver
//!
//! Dispatches a compilation by input/output extension through the chain
//! `.pln -> .c -> .s -> .o -> .so`, with the off-chain branch
//! `.pln -> .lua` handled by the translator. Intermediate files live in a
//! per-invocation temporary directory that is removed whether the run
//! succeeds or fails; the endpoints are placed next to the input.
//!
//! The C toolchain is an external collaborator: it is invoked as `cc`
//! through `std::process::Command` and its failures surface as toolchain
//! errors carrying the tool's stderr.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicU32, Ordering};

use log::debug;
use thiserror::Error;

use crate::ast::Program;
use crate::codegen;
use crate::ir::passes::{self, PassConfig, UnknownPass};
use crate::ir::{self, lower_program};
use crate::lexer::{LineIndex, Span};
use crate::parser::Parser;
use crate::translator;
use crate::types::{CheckResult, TypeChecker};

/// A rendered diagnostic: `<file>:<line>:<col>: <kind>: <message>`
#[derive(Debug, Clone, PartialEq)]
pub struct Diagnostic {
    pub file: String,
    pub line: u32,
    pub column: u32,
    /// syntax, type, name, uninitialized, io or toolchain
    pub kind: &'static str,
    pub message: String,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}: {}: {}",
            self.file, self.line, self.column, self.kind, self.message
        )
    }
}

/// Errors a compilation can end with
#[derive(Error, Debug)]
pub enum DriverError {
    #[error("{0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    InvalidInput(String),

    #[error("{program} failed:\n{stderr}")]
    Toolchain { program: String, stderr: String },

    #[error("{}", format_diagnostics(.0))]
    Frontend(Vec<Diagnostic>),

    #[error(transparent)]
    UnknownPass(#[from] UnknownPass),
}

fn format_diagnostics(diagnostics: &[Diagnostic]) -> String {
    diagnostics
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("\n")
}

/// What the driver should produce
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmitMode {
    /// `.pln` to `.so` (the default)
    SharedLib,
    /// `.pln` to `.c`
    C,
    /// `.c` to `.s`
    Asm,
    /// `.pln` to `.lua`
    Lua,
    /// `.c` to `.so`
    CompileC,
}

impl EmitMode {
    /// The input extension this mode consumes
    #[must_use]
    pub const fn input_extension(self) -> &'static str {
        match self {
            EmitMode::SharedLib | EmitMode::C | EmitMode::Lua => "pln",
            EmitMode::Asm | EmitMode::CompileC => "c",
        }
    }

    /// The output extension this mode produces
    #[must_use]
    pub const fn output_extension(self) -> &'static str {
        match self {
            EmitMode::SharedLib | EmitMode::CompileC => "so",
            EmitMode::C => "c",
            EmitMode::Asm => "s",
            EmitMode::Lua => "lua",
        }
    }
}

/// Options for a single compilation
#[derive(Debug, Clone)]
pub struct CompileOptions {
    /// What to produce
    pub mode: EmitMode,
    /// Which analysis passes to run
    pub passes: PassConfig,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            mode: EmitMode::SharedLib,
            passes: PassConfig::all(),
        }
    }
}

/// Compile `input`, placing the result next to it
///
/// # Errors
///
/// Returns the first stage failure; front-end failures carry all of
/// that stage's diagnostics in source order.
pub fn compile(input: &Path, options: &CompileOptions) -> Result<PathBuf, DriverError> {
    let base = validated_base_name(input, options.mode)?;
    let output = input.with_extension(options.mode.output_extension());

    match options.mode {
        EmitMode::Lua => {
            let source = fs::read_to_string(input)?;
            let (program, _, _) = front_end(&file_name(input), &source)?;
            debug!("translating {} to {}", input.display(), output.display());
            fs::write(&output, translator::translate(&source, &program))?;
        }
        EmitMode::C => {
            let c_source = compile_to_c(input, &base, options)?;
            fs::write(&output, c_source)?;
        }
        EmitMode::SharedLib => {
            let c_source = compile_to_c(input, &base, options)?;
            let tmp = TempArtifacts::new()?;
            let c_path = tmp.path("module.c");
            fs::write(&c_path, c_source)?;
            let s_path = tmp.path("module.s");
            run_cc(&["-S", "-fPIC"], &c_path, &s_path)?;
            let o_path = tmp.path("module.o");
            run_cc(&["-c"], &s_path, &o_path)?;
            run_cc(&["-shared"], &o_path, &output)?;
        }
        EmitMode::Asm => {
            run_cc(&["-S", "-fPIC"], input, &output)?;
        }
        EmitMode::CompileC => {
            let tmp = TempArtifacts::new()?;
            let s_path = tmp.path("module.s");
            run_cc(&["-S", "-fPIC"], input, &s_path)?;
            let o_path = tmp.path("module.o");
            run_cc(&["-c"], &s_path, &o_path)?;
            run_cc(&["-shared"], &o_path, &output)?;
        }
    }
    Ok(output)
}

/// Run the front end and code generator for a `.pln` input
fn compile_to_c(
    input: &Path,
    module_name: &str,
    options: &CompileOptions,
) -> Result<String, DriverError> {
    let source = fs::read_to_string(input)?;
    let file = file_name(input);
    let (program, check, index) = front_end(&file, &source)?;
    let module = lower_and_optimize(&file, &program, &check, &index, &options.passes)?;
    debug!("emitting C for module '{module_name}'");
    Ok(codegen::emit_c(&module, module_name, &index))
}

/// Parse and type check, accumulating diagnostics per stage
///
/// # Errors
///
/// Returns every syntax error, or every type/name error, in source order.
pub fn front_end(
    file: &str,
    source: &str,
) -> Result<(Program, CheckResult, LineIndex), DriverError> {
    let index = LineIndex::new(source);
    debug!("parsing {file}");
    let mut program = Parser::parse_program(source).map_err(|errors| {
        DriverError::Frontend(
            errors
                .iter()
                .map(|e| diagnostic(file, &index, e.span, "syntax", e.kind.to_string()))
                .collect(),
        )
    })?;

    debug!("type checking {file}");
    let check = TypeChecker::check_program(&mut program);
    if !check.is_ok() {
        return Err(DriverError::Frontend(
            check
                .errors
                .iter()
                .map(|e| diagnostic(file, &index, e.span, e.category(), e.kind.to_string()))
                .collect(),
        ));
    }
    Ok((program, check, index))
}

/// Lower to IR and run the configured analysis passes
///
/// # Errors
///
/// Returns the uninitialized-variable diagnostic that stopped the pass.
pub fn lower_and_optimize(
    file: &str,
    program: &Program,
    check: &CheckResult,
    index: &LineIndex,
    passes: &PassConfig,
) -> Result<ir::Module, DriverError> {
    debug!("lowering {file}");
    let mut module = lower_program(program, check, index);
    debug!("running passes on {file}");
    passes::run_passes(&mut module, passes).map_err(|e| {
        DriverError::Frontend(vec![diagnostic(
            file,
            index,
            e.span,
            "uninitialized",
            e.to_string(),
        )])
    })?;
    Ok(module)
}

/// Compile source text down to optimized IR; the `stop_after ==
/// "optimize"` entry point used by tests and tooling
///
/// # Errors
///
/// Returns front-end or analysis diagnostics.
pub fn compile_source_to_ir(
    file: &str,
    source: &str,
    passes: &PassConfig,
) -> Result<ir::Module, DriverError> {
    let (program, check, index) = front_end(file, source)?;
    lower_and_optimize(file, &program, &check, &index, passes)
}

fn diagnostic(
    file: &str,
    index: &LineIndex,
    span: Span,
    kind: &'static str,
    message: String,
) -> Diagnostic {
    let location = if span.is_dummy() {
        crate::lexer::Location::new(0, 0)
    } else {
        index.location(span.start)
    };
    Diagnostic {
        file: file.to_string(),
        line: location.line,
        column: location.column,
        kind,
        message,
    }
}

fn file_name(path: &Path) -> String {
    path.display().to_string()
}

/// Validate the input path for the mode and produce the runtime-visible
/// module name (the base name with `/` replaced by `_`)
fn validated_base_name(input: &Path, mode: EmitMode) -> Result<String, DriverError> {
    let expected = mode.input_extension();
    let extension = input.extension().and_then(|e| e.to_str()).unwrap_or("");
    if extension != expected {
        return Err(DriverError::InvalidInput(format!(
            "input file '{}' must have extension '.{expected}'",
            input.display()
        )));
    }
    let base = input.with_extension("");
    let base = base.to_string_lossy().into_owned();
    let ok = !base.is_empty()
        && base
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '/');
    if !ok {
        return Err(DriverError::InvalidInput(format!(
            "input base name '{base}' may only contain letters, digits, '_' and '/'"
        )));
    }
    Ok(base.replace('/', "_"))
}

/// Run the system C compiler on one input producing one output
fn run_cc(flags: &[&str], input: &Path, output: &Path) -> Result<(), DriverError> {
    let mut cmd = Command::new("cc");
    cmd.args(flags).arg(input).arg("-o").arg(output);
    if let Ok(cflags) = std::env::var("PALLENE_CFLAGS") {
        cmd.args(cflags.split_whitespace());
    }
    debug!("running {cmd:?}");
    let out = cmd.output()?;
    if !out.status.success() {
        return Err(DriverError::Toolchain {
            program: "cc".to_string(),
            stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
        });
    }
    Ok(())
}

static NEXT_TEMP: AtomicU32 = AtomicU32::new(0);

/// A per-invocation temporary directory, removed on drop so intermediate
/// files disappear on success and on error paths alike
struct TempArtifacts {
    dir: PathBuf,
}

impl TempArtifacts {
    fn new() -> std::io::Result<Self> {
        let dir = std::env::temp_dir().join(format!(
            "pallenec-{}-{}",
            std::process::id(),
            NEXT_TEMP.fetch_add(1, Ordering::Relaxed)
        ));
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }
}

impl Drop for TempArtifacts {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.dir);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extensions_follow_the_chain() {
        assert_eq!(EmitMode::SharedLib.input_extension(), "pln");
        assert_eq!(EmitMode::SharedLib.output_extension(), "so");
        assert_eq!(EmitMode::Asm.input_extension(), "c");
        assert_eq!(EmitMode::Lua.output_extension(), "lua");
    }

    #[test]
    fn module_name_replaces_slashes() {
        let name = validated_base_name(Path::new("examples/gcd.pln"), EmitMode::SharedLib).unwrap();
        assert_eq!(name, "examples_gcd");
    }

    #[test]
    fn wrong_extension_is_rejected() {
        let err = validated_base_name(Path::new("gcd.lua"), EmitMode::SharedLib).unwrap_err();
        assert!(matches!(err, DriverError::InvalidInput(_)));
    }

    #[test]
    fn odd_base_names_are_rejected() {
        let err = validated_base_name(Path::new("my-module.pln"), EmitMode::SharedLib).unwrap_err();
        assert!(matches!(err, DriverError::InvalidInput(_)));
    }

    #[test]
    fn diagnostics_render_in_canonical_form() {
        let source = "function f(: integer return 10 end";
        let err = front_end("test.pln", source).unwrap_err();
        let DriverError::Frontend(diagnostics) = err else {
            panic!("expected diagnostics")
        };
        let rendered = diagnostics[0].to_string();
        assert!(rendered.starts_with("test.pln:1:"), "{rendered}");
        assert!(rendered.contains(": syntax: "), "{rendered}");
    }

    #[test]
    fn checker_diagnostics_carry_their_category() {
        let source = "function f(): integer return x end";
        let err = front_end("test.pln", source).unwrap_err();
        let DriverError::Frontend(diagnostics) = err else {
            panic!("expected diagnostics")
        };
        assert!(diagnostics.iter().any(|d| d.kind == "name"));
    }

    #[test]
    fn uninitialized_pass_is_selectable() {
        let source = "function f(): integer\nlocal x: integer\nreturn x\nend";
        let err =
            compile_source_to_ir("test.pln", source, &PassConfig::all()).unwrap_err();
        let DriverError::Frontend(diagnostics) = err else {
            panic!("expected diagnostics")
        };
        assert_eq!(diagnostics[0].kind, "uninitialized");

        // With the pass disabled the same program lowers fine
        let config = PassConfig::from_names(["constant_propagation"]).unwrap();
        compile_source_to_ir("test.pln", source, &config).unwrap();
    }

    #[test]
    fn temp_artifacts_clean_up() {
        let dir;
        {
            let tmp = TempArtifacts::new().unwrap();
            dir = tmp.dir.clone();
            fs::write(tmp.path("x.c"), "int x;").unwrap();
            assert!(dir.exists());
        }
        assert!(!dir.exists());
    }
}
