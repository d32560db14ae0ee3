//! Statement AST nodes for the Pallene programming language

use crate::lexer::Span;
use crate::types::Type;

use super::{Exp, Ident, Spanned, TypeAnnotation, VarNode};

/// A sequence of statements with its own lexical scope
#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    /// Statements in source order
    pub stats: Vec<Stat>,
    /// Source location
    pub span: Span,
}

impl Block {
    /// Create a new block
    #[must_use]
    pub fn new(stats: Vec<Stat>, span: Span) -> Self {
        Self { stats, span }
    }
}

impl Spanned for Block {
    fn span(&self) -> Span {
        self.span
    }
}

/// A statement with source location
#[derive(Debug, Clone, PartialEq)]
pub struct Stat {
    /// The kind of statement
    pub kind: StatKind,
    /// Source location
    pub span: Span,
}

impl Stat {
    /// Create a new statement
    #[must_use]
    pub fn new(kind: StatKind, span: Span) -> Self {
        Self { kind, span }
    }
}

impl Spanned for Stat {
    fn span(&self) -> Span {
        self.span
    }
}

/// The kind of statement
#[derive(Debug, Clone, PartialEq)]
pub enum StatKind {
    /// `do ... end`
    Block(Block),

    /// `var = exp`
    Assign { target: VarNode, value: Exp },

    /// `local name [: T] [= exp]` — without an initializer the variable
    /// stays undefined until its first assignment
    Decl {
        decl: LocalDecl,
        value: Option<Exp>,
    },

    /// `if exp then ... [elseif ...] [else ...] end`
    If {
        condition: Exp,
        then_block: Block,
        else_branch: Option<ElseBranch>,
    },

    /// `while exp do ... end`
    While { condition: Exp, body: Block },

    /// `repeat ... until exp` — the condition sees the body's scope
    Repeat { body: Block, condition: Exp },

    /// Numeric `for name [: T] = start, limit [, step] do ... end`
    For {
        decl: LocalDecl,
        start: Exp,
        limit: Exp,
        step: Option<Exp>,
        body: Block,
    },

    /// `break`
    Break,

    /// `return [exp, ...]` — must close its block
    Return { values: Vec<Exp> },

    /// A function or method call in statement position
    Call(Exp),
}

/// Which branch follows an `if`'s then-block
#[derive(Debug, Clone, PartialEq)]
pub enum ElseBranch {
    /// `else ... end`
    Else(Block),
    /// `elseif ...` — an `If` statement sharing the outer `end`
    Elseif(Box<Stat>),
}

/// A local variable declaration site (in `local`, `for`)
#[derive(Debug, Clone, PartialEq)]
pub struct LocalDecl {
    /// Variable name
    pub name: Ident,
    /// Written annotation, if any
    pub annotation: Option<TypeAnnotation>,
    /// Bytes to blank in the translator: colon through end of annotation
    pub strip_span: Option<Span>,
    /// Resolved type; filled by the checker (inferred when unannotated)
    pub ty: Option<Type>,
}

impl LocalDecl {
    /// Create a new declaration site
    #[must_use]
    pub fn new(name: Ident, annotation: Option<TypeAnnotation>, strip_span: Option<Span>) -> Self {
        Self {
            name,
            annotation,
            strip_span,
            ty: None,
        }
    }
}
