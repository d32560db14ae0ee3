//! Type system for the Pallene programming language
//!
//! This module provides:
//! - Internal type representation (`Type`)
//! - Symbol table / scope stack (`Env`)
//! - Type errors (`TypeError`)
//! - The type checker (`TypeChecker`)

mod checker;
mod env;
mod error;

pub use checker::{CheckResult, TypeChecker};
pub use env::{Declaration, Env};
pub use error::{TypeError, TypeErrorKind};

use std::fmt;

/// A unique identifier for record definitions
///
/// Record equality is nominal: two record types are the same type exactly
/// when they carry the same id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RecordId(pub u32);

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "record#{}", self.0)
    }
}

/// Internal type representation used by the type checker
///
/// This is distinct from `TypeAnnotation` in the AST, which is the
/// syntactic form of types as written by the user. No `Typealias` variant
/// exists here: aliases are fully expanded before any body is checked.
#[derive(Debug, Clone, PartialEq)]
pub enum Type {
    /// The nil type
    Nil,

    /// Boolean
    Boolean,

    /// 64-bit signed integer
    Integer,

    /// 64-bit floating point
    Float,

    /// Immutable byte string
    String,

    /// The dynamic type; conversions to and from it are always legal
    Any,

    /// Homogeneous array type
    Array(Box<Type>),

    /// Table type with named fields, order preserved
    Table(Vec<(String, Type)>),

    /// Function type
    Function {
        /// Parameter types
        params: Vec<Type>,
        /// Return types
        rets: Vec<Type>,
    },

    /// A named record type (nominal)
    Record {
        /// Record definition id
        id: RecordId,
        /// Name for diagnostics
        name: String,
    },
}

impl Type {
    /// Create an array type
    #[must_use]
    pub fn array(elem: Type) -> Self {
        Self::Array(Box::new(elem))
    }

    /// Create a function type
    #[must_use]
    pub fn function(params: Vec<Type>, rets: Vec<Type>) -> Self {
        Self::Function { params, rets }
    }

    /// Returns true for `integer` and `float`
    #[must_use]
    pub const fn is_numeric(&self) -> bool {
        matches!(self, Type::Integer | Type::Float)
    }

    /// Returns true if a value of this type can be concatenated
    #[must_use]
    pub const fn is_concatenable(&self) -> bool {
        matches!(self, Type::String | Type::Integer | Type::Float)
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Nil => write!(f, "nil"),
            Type::Boolean => write!(f, "boolean"),
            Type::Integer => write!(f, "integer"),
            Type::Float => write!(f, "float"),
            Type::String => write!(f, "string"),
            Type::Any => write!(f, "any"),
            Type::Array(elem) => write!(f, "{{ {elem} }}"),
            Type::Table(fields) => {
                write!(f, "{{ ")?;
                for (i, (name, ty)) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{name}: {ty}")?;
                }
                write!(f, " }}")
            }
            Type::Function { params, rets } => {
                write!(f, "(")?;
                for (i, p) in params.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{p}")?;
                }
                write!(f, ") -> (")?;
                for (i, r) in rets.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{r}")?;
                }
                write!(f, ")")
            }
            Type::Record { name, .. } => write!(f, "{name}"),
        }
    }
}

/// The layout of a record definition, produced by the checker and consumed
/// by lowering and code generation
#[derive(Debug, Clone, PartialEq)]
pub struct RecordInfo {
    /// Record name
    pub name: String,
    /// Fields in declaration order
    pub fields: Vec<(String, Type)>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn structural_equality() {
        assert_eq!(Type::array(Type::Integer), Type::array(Type::Integer));
        assert_ne!(Type::array(Type::Integer), Type::array(Type::Float));
    }

    #[test]
    fn nominal_record_equality() {
        let a = Type::Record {
            id: RecordId(0),
            name: "Point".into(),
        };
        let b = Type::Record {
            id: RecordId(1),
            name: "Point".into(),
        };
        assert_ne!(a, b);
        assert_eq!(a, a.clone());
    }

    #[test]
    fn display_function_type() {
        let ty = Type::function(vec![Type::Integer, Type::Float], vec![Type::String]);
        assert_eq!(ty.to_string(), "(integer, float) -> (string)");
    }
}
