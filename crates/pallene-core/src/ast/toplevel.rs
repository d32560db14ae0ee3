//! Top-level declaration AST nodes for the Pallene programming language

use crate::lexer::Span;
use crate::types::Type;

use super::{Block, Exp, Ident, Spanned, TypeAnnotation};

/// Visibility of a top-level declaration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    /// `local` — private to the module
    Local,
    /// `export` — registered in the module's export table
    Export,
}

/// A top-level declaration with source location
///
/// For `record` and `typealias` the span covers the entire declaration
/// (first keyword through the terminal `end` or type expression), which is
/// exactly the region the translator blanks out.
#[derive(Debug, Clone, PartialEq)]
pub struct Toplevel {
    /// The kind of declaration
    pub kind: ToplevelKind,
    /// Source location
    pub span: Span,
}

impl Toplevel {
    /// Create a new top-level declaration
    #[must_use]
    pub fn new(kind: ToplevelKind, span: Span) -> Self {
        Self { kind, span }
    }
}

impl Spanned for Toplevel {
    fn span(&self) -> Span {
        self.span
    }
}

/// The kind of top-level declaration
#[derive(Debug, Clone, PartialEq)]
pub enum ToplevelKind {
    /// `local|export function name(params): rets body end`
    Func(FuncDecl),
    /// `local|export name [: T] = exp`
    Var(VarDecl),
    /// `typealias Name = T`
    Typealias(TypealiasDecl),
    /// `record Name fields end`
    Record(RecordDecl),
    /// `local name = import("module")`
    Import(ImportDecl),
}

/// A top-level function declaration
#[derive(Debug, Clone, PartialEq)]
pub struct FuncDecl {
    /// `local` or `export`
    pub visibility: Visibility,
    /// Span of the visibility keyword (the translator rewrites `export`)
    pub vis_span: Span,
    /// Function name
    pub name: Ident,
    /// Parameters, return annotation, and body
    pub body: FuncBody,
}

/// The parameter list, return annotation, and body shared by named
/// functions and lambdas
#[derive(Debug, Clone, PartialEq)]
pub struct FuncBody {
    /// Parameters in declaration order
    pub params: Vec<Param>,
    /// Written return type annotations (empty list means no returns)
    pub ret_annotations: Vec<TypeAnnotation>,
    /// Bytes to blank in the translator: colon through end of the return
    /// annotation, including parentheses around tuple return types
    pub ret_strip_span: Option<Span>,
    /// Resolved return types; filled by the checker
    pub ret_types: Option<Vec<Type>>,
    /// Function body
    pub block: Block,
    /// Span of the whole `function ... end` form
    pub span: Span,
}

impl Spanned for FuncBody {
    fn span(&self) -> Span {
        self.span
    }
}

/// A function parameter
#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    /// Parameter name
    pub name: Ident,
    /// Written annotation (`None` defaults to `any`, so translated
    /// output stays parseable)
    pub annotation: Option<TypeAnnotation>,
    /// Bytes to blank in the translator: colon through end of annotation
    pub strip_span: Option<Span>,
    /// Resolved type; filled by the checker
    pub ty: Option<Type>,
    /// Source location
    pub span: Span,
}

impl Param {
    /// Create a new parameter
    #[must_use]
    pub fn new(name: Ident, annotation: Option<TypeAnnotation>, strip_span: Option<Span>) -> Self {
        let span = name.span;
        Self {
            name,
            annotation,
            strip_span,
            ty: None,
            span,
        }
    }
}

impl Spanned for Param {
    fn span(&self) -> Span {
        self.span
    }
}

/// A top-level variable declaration
#[derive(Debug, Clone, PartialEq)]
pub struct VarDecl {
    /// `local` or `export`
    pub visibility: Visibility,
    /// Span of the visibility keyword
    pub vis_span: Span,
    /// Variable name
    pub name: Ident,
    /// Written annotation, if any
    pub annotation: Option<TypeAnnotation>,
    /// Bytes to blank in the translator
    pub strip_span: Option<Span>,
    /// Resolved type; filled by the checker
    pub ty: Option<Type>,
    /// Initializer
    pub value: Exp,
}

/// `typealias Name = T`
#[derive(Debug, Clone, PartialEq)]
pub struct TypealiasDecl {
    /// Alias name
    pub name: Ident,
    /// Aliased type
    pub annotation: TypeAnnotation,
}

/// `record Name field: T ... end`
#[derive(Debug, Clone, PartialEq)]
pub struct RecordDecl {
    /// Record name (nominal)
    pub name: Ident,
    /// Fields in declaration order
    pub fields: Vec<(Ident, TypeAnnotation)>,
}

/// `local name = import("module")`
#[derive(Debug, Clone, PartialEq)]
pub struct ImportDecl {
    /// Local binding name
    pub name: Ident,
    /// Imported module name
    pub module: String,
}
