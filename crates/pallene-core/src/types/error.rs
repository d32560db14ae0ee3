//! Type and name errors reported by the Pallene checker

use thiserror::Error;

use crate::lexer::Span;

use super::Type;

/// A checker error with location information
#[derive(Debug, Clone)]
pub struct TypeError {
    /// The kind of error
    pub kind: TypeErrorKind,
    /// Source location
    pub span: Span,
}

impl TypeError {
    /// Create a new error
    #[must_use]
    pub fn new(kind: TypeErrorKind, span: Span) -> Self {
        Self { kind, span }
    }

    /// Create a type mismatch error
    #[must_use]
    pub fn mismatch(expected: Type, found: Type, span: Span) -> Self {
        Self::new(TypeErrorKind::TypeMismatch { expected, found }, span)
    }

    /// The diagnostic category this error prints under.
    ///
    /// Undeclared and duplicate names are "name" errors; everything else
    /// the checker produces is a "type" error.
    #[must_use]
    pub const fn category(&self) -> &'static str {
        match self.kind {
            TypeErrorKind::UndeclaredName(_) | TypeErrorKind::DuplicateName(_) => "name",
            _ => "type",
        }
    }
}

impl std::fmt::Display for TypeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} at {}", self.kind, self.span)
    }
}

impl std::error::Error for TypeError {}

/// The kind of checker error
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TypeErrorKind {
    #[error("type mismatch: expected {expected}, found {found}")]
    TypeMismatch { expected: Type, found: Type },

    #[error("undeclared variable '{0}'")]
    UndeclaredName(String),

    #[error("duplicate declaration of '{0}'")]
    DuplicateName(String),

    #[error("type '{0}' is not declared")]
    TypeNotDeclared(String),

    #[error("typealias '{0}' is part of a cycle")]
    CyclicTypealias(String),

    #[error("wrong number of arguments: expected {expected}, found {found}")]
    WrongArity { expected: usize, found: usize },

    #[error("wrong type for argument '{name}': expected {expected}, found {found}")]
    ArgumentTypeMismatch {
        name: String,
        expected: Type,
        found: Type,
    },

    #[error("cannot apply '{op}' to {left} and {right}")]
    InvalidBinop {
        op: &'static str,
        left: Type,
        right: Type,
    },

    #[error("cannot apply '{op}' to {operand}")]
    InvalidUnop { op: &'static str, operand: Type },

    #[error("type {0} is not callable")]
    NotCallable(Type),

    #[error("type {0} cannot be indexed")]
    NotIndexable(Type),

    #[error("type {ty} has no field '{field}'")]
    NoSuchField { ty: Type, field: String },

    #[error("missing field '{field}' in initializer for {ty}")]
    MissingField { ty: Type, field: String },

    #[error("unknown field '{field}' in initializer for {ty}")]
    ExtraField { ty: Type, field: String },

    #[error("initializer list needs a type annotation context")]
    CannotInferInitlist,

    #[error("cannot cast {from} to {to}")]
    InvalidCast { from: Type, to: Type },

    #[error("wrong number of return values: expected {expected}, found {found}")]
    ReturnArityMismatch { expected: usize, found: usize },

    #[error("function call has no return value")]
    NoReturnValue,

    #[error("method calls are only allowed on values of type any")]
    MethodCallOnTypedValue,

    #[error("'{0}' cannot be assigned to")]
    AssignToConst(String),

    #[error("cannot infer the type of '{0}' without an annotation or initializer")]
    CannotInfer(String),

    #[error("functions cannot capture the local variable '{0}'")]
    LambdaCapture(String),

    #[error("control reaches the end of the function without returning")]
    MissingReturn,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn undeclared_type_message() {
        let kind = TypeErrorKind::TypeNotDeclared("Point".into());
        assert_eq!(kind.to_string(), "type 'Point' is not declared");
    }

    #[test]
    fn name_errors_have_their_own_category() {
        let err = TypeError::new(TypeErrorKind::UndeclaredName("x".into()), Span::dummy());
        assert_eq!(err.category(), "name");
        let err = TypeError::mismatch(Type::Integer, Type::Float, Span::dummy());
        assert_eq!(err.category(), "type");
    }
}
