//! Pallene Core - compiler pipeline for the Pallene programming language
//!
//! This crate provides every stage of the compiler:
//! - Lexer: tokenization of Pallene source code
//! - AST: abstract syntax tree definitions
//! - Parser: AST construction from the token stream
//! - Types: static type checking and tree decoration
//! - IR: lowering, uninitialized-variable analysis, constant propagation
//! - Codegen: C emission against the host runtime's API
//! - Translator: byte-exact type stripping to host-language source
//! - Driver: extension-chain dispatch and toolchain invocation

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Lexer module - tokenization of Pallene source code
pub mod lexer;

/// Abstract Syntax Tree - parsed representation of Pallene source code
pub mod ast;

/// Parser module - converts tokens into the AST
pub mod parser;

/// Type system module - checking and tree decoration
pub mod types;

/// Intermediate representation - lowering and the analysis passes
pub mod ir;

/// C code generator
pub mod codegen;

/// Type-stripping translator to host-language source
pub mod translator;

/// Pipeline driver
pub mod driver;

/// Convenience re-export of the lexer
pub use lexer::Lexer;

/// Convenience re-export of the parser
pub use parser::Parser;

/// Convenience re-export of the type checker
pub use types::TypeChecker;

/// Convenience re-export of the translator entry point
pub use translator::translate;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_exists() {
        assert!(!VERSION.is_empty());
    }
}
