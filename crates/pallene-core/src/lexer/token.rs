//! Token types for the Pallene lexer

use logos::{Lexer as LogosLexer, Logos};

/// Consume the rest of a comment after the leading `--`.
///
/// Handles both line comments and `--[[ ... ]]` block comments. Returns
/// false when a block comment is left unterminated.
fn lex_comment(lex: &mut LogosLexer<'_, TokenKind>) -> bool {
    let rest = lex.remainder();
    if let Some(body) = rest.strip_prefix("[[") {
        match body.find("]]") {
            Some(end) => {
                lex.bump(2 + end + 2);
                true
            }
            None => {
                lex.bump(rest.len());
                false
            }
        }
    } else {
        let end = rest.find('\n').unwrap_or(rest.len());
        lex.bump(end);
        true
    }
}

/// The kind of token produced by the lexer
#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(skip r"[ \t\r\n\f]+")]
pub enum TokenKind {
    // ========== Keywords ==========
    #[token("and")]
    And,
    #[token("as")]
    As,
    #[token("break")]
    Break,
    #[token("do")]
    Do,
    #[token("else")]
    Else,
    #[token("elseif")]
    Elseif,
    #[token("end")]
    End,
    #[token("export")]
    Export,
    #[token("false")]
    False,
    #[token("for")]
    For,
    #[token("function")]
    Function,
    #[token("if")]
    If,
    #[token("import")]
    Import,
    #[token("in")]
    In,
    #[token("local")]
    Local,
    #[token("nil")]
    Nil,
    #[token("not")]
    Not,
    #[token("or")]
    Or,
    #[token("record")]
    Record,
    #[token("repeat")]
    Repeat,
    #[token("return")]
    Return,
    #[token("then")]
    Then,
    #[token("true")]
    True,
    #[token("typealias")]
    Typealias,
    #[token("until")]
    Until,
    #[token("while")]
    While,

    // ========== Literals ==========
    /// Integer literal, decimal or hexadecimal.
    /// Integer vs. float is decided here, at lex time.
    #[regex(r"[0-9]+", priority = 3)]
    #[regex(r"0[xX][0-9a-fA-F]+")]
    Integer,

    /// Float literal: anything with a decimal point or an exponent
    #[regex(r"[0-9]+\.[0-9]*([eE][+-]?[0-9]+)?")]
    #[regex(r"\.[0-9]+([eE][+-]?[0-9]+)?")]
    #[regex(r"[0-9]+[eE][+-]?[0-9]+")]
    Float,

    /// String literal, double or single quoted, escapes left raw in the lexeme
    #[regex(r#""([^"\\\n]|\\[^\n])*""#)]
    #[regex(r"'([^'\\\n]|\\[^\n])*'")]
    String,

    // ========== Identifiers ==========
    #[regex(r"[A-Za-z_][A-Za-z0-9_]*", priority = 2)]
    Name,

    // ========== Operators ==========
    #[token("+")]
    Plus,
    #[token("-")]
    Minus,
    #[token("*")]
    Star,
    #[token("/")]
    Slash,
    #[token("//")]
    DoubleSlash,
    #[token("%")]
    Percent,
    #[token("^")]
    Caret,
    #[token("#")]
    Hash,
    #[token("&")]
    Ampersand,
    #[token("~")]
    Tilde,
    #[token("|")]
    Pipe,
    #[token("<<")]
    LtLt,
    #[token(">>")]
    GtGt,
    #[token("==")]
    EqEq,
    #[token("~=")]
    TildeEq,
    #[token("<=")]
    LtEq,
    #[token(">=")]
    GtEq,
    #[token("<")]
    Lt,
    #[token(">")]
    Gt,
    #[token("=")]
    Eq,
    #[token("..")]
    DotDot,
    #[token(".")]
    Dot,
    #[token("->")]
    Arrow,

    // ========== Delimiters ==========
    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token("{")]
    LBrace,
    #[token("}")]
    RBrace,
    #[token("[")]
    LBracket,
    #[token("]")]
    RBracket,
    #[token(";")]
    Semicolon,
    #[token(":")]
    Colon,
    #[token(",")]
    Comma,

    // ========== Trivia ==========
    /// Line comment `-- ...` or block comment `--[[ ... ]]`.
    /// Spanned because the translator preserves comment bytes.
    #[regex(r"--", lex_comment)]
    Comment,

    /// End of file (synthesized by the lexer)
    Eof,

    /// Invalid character
    Error,
}

impl TokenKind {
    /// Returns true if this token should be skipped by the parser
    #[must_use]
    pub const fn is_trivia(&self) -> bool {
        matches!(self, Self::Comment)
    }

    /// Returns true if this token can start a statement's expression
    #[must_use]
    pub const fn is_exp_start(&self) -> bool {
        matches!(
            self,
            Self::Nil
                | Self::True
                | Self::False
                | Self::Integer
                | Self::Float
                | Self::String
                | Self::Name
                | Self::Function
                | Self::Not
                | Self::Minus
                | Self::Hash
                | Self::Tilde
                | Self::LParen
                | Self::LBrace
        )
    }
}

impl std::fmt::Display for TokenKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::And => "and",
            Self::As => "as",
            Self::Break => "break",
            Self::Do => "do",
            Self::Else => "else",
            Self::Elseif => "elseif",
            Self::End => "end",
            Self::Export => "export",
            Self::False => "false",
            Self::For => "for",
            Self::Function => "function",
            Self::If => "if",
            Self::Import => "import",
            Self::In => "in",
            Self::Local => "local",
            Self::Nil => "nil",
            Self::Not => "not",
            Self::Or => "or",
            Self::Record => "record",
            Self::Repeat => "repeat",
            Self::Return => "return",
            Self::Then => "then",
            Self::True => "true",
            Self::Typealias => "typealias",
            Self::Until => "until",
            Self::While => "while",
            Self::Integer => "integer literal",
            Self::Float => "float literal",
            Self::String => "string literal",
            Self::Name => "name",
            Self::Plus => "+",
            Self::Minus => "-",
            Self::Star => "*",
            Self::Slash => "/",
            Self::DoubleSlash => "//",
            Self::Percent => "%",
            Self::Caret => "^",
            Self::Hash => "#",
            Self::Ampersand => "&",
            Self::Tilde => "~",
            Self::Pipe => "|",
            Self::LtLt => "<<",
            Self::GtGt => ">>",
            Self::EqEq => "==",
            Self::TildeEq => "~=",
            Self::LtEq => "<=",
            Self::GtEq => ">=",
            Self::Lt => "<",
            Self::Gt => ">",
            Self::Eq => "=",
            Self::DotDot => "..",
            Self::Dot => ".",
            Self::Arrow => "->",
            Self::LParen => "(",
            Self::RParen => ")",
            Self::LBrace => "{",
            Self::RBrace => "}",
            Self::LBracket => "[",
            Self::RBracket => "]",
            Self::Semicolon => ";",
            Self::Colon => ":",
            Self::Comma => ",",
            Self::Comment => "comment",
            Self::Eof => "end of file",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}
