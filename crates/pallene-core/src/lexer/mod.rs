//! Lexer for the Pallene programming language
//!
//! The lexer converts source code into a stream of tokens, handling:
//! - Keywords, names, and operators
//! - Numeric literals (integer vs. float is decided here)
//! - String literals with escape sequences
//! - Comments (line and `--[[ ... ]]` block), kept as spans for the translator
//! - Source location tracking

#![allow(clippy::cast_possible_truncation)] // Spans are u32; sources over 4GB are unsupported

mod span;
mod token;

pub use span::{LineIndex, Location, Span};
pub use token::TokenKind;

use logos::Logos;
use thiserror::Error;

/// A token with its kind, span, and source text
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    /// The kind of token
    pub kind: TokenKind,
    /// The span in the source code
    pub span: Span,
    /// The source text of the token
    pub lexeme: String,
}

impl Token {
    /// Create a new token
    #[must_use]
    pub fn new(kind: TokenKind, span: Span, lexeme: impl Into<String>) -> Self {
        Self {
            kind,
            span,
            lexeme: lexeme.into(),
        }
    }
}

/// Lexer error types
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LexError {
    #[error("unexpected character")]
    UnexpectedChar,
    #[error("unterminated comment")]
    UnterminatedComment,
    #[error("invalid escape sequence '\\{0}'")]
    InvalidEscape(char),
    #[error("malformed number")]
    MalformedNumber,
}

/// A lexer error with location information
#[derive(Debug, Clone)]
pub struct SpannedError {
    pub error: LexError,
    pub span: Span,
}

impl SpannedError {
    #[must_use]
    pub fn new(error: LexError, span: Span) -> Self {
        Self { error, span }
    }
}

impl std::fmt::Display for SpannedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} at {}", self.error, self.span)
    }
}

impl std::error::Error for SpannedError {}

/// Everything the lexer produces in one pass over the source
#[derive(Debug, Clone)]
pub struct LexOutput {
    /// Non-trivia tokens, terminated by an Eof token
    pub tokens: Vec<Token>,
    /// Spans of every comment, in source order
    pub comments: Vec<Span>,
    /// Recoverable errors collected while lexing
    pub errors: Vec<SpannedError>,
}

/// The Pallene lexer
pub struct Lexer;

impl Lexer {
    /// Tokenize the entire source
    #[must_use]
    pub fn tokenize(source: &str) -> LexOutput {
        let mut tokens = Vec::new();
        let mut comments = Vec::new();
        let mut errors = Vec::new();

        let mut logos_lexer = TokenKind::lexer(source);
        while let Some(result) = logos_lexer.next() {
            let span = Span::from_range(logos_lexer.span());
            let lexeme = logos_lexer.slice();
            match result {
                Ok(TokenKind::Comment) => comments.push(span),
                Ok(kind) => tokens.push(Token::new(kind, span, lexeme)),
                Err(()) => {
                    let error = if lexeme.starts_with("--[[") {
                        LexError::UnterminatedComment
                    } else {
                        LexError::UnexpectedChar
                    };
                    errors.push(SpannedError::new(error, span));
                    tokens.push(Token::new(TokenKind::Error, span, lexeme));
                }
            }
        }

        let end = source.len() as u32;
        tokens.push(Token::new(TokenKind::Eof, Span::new(end, end), ""));
        LexOutput {
            tokens,
            comments,
            errors,
        }
    }
}

/// Decode the raw lexeme of a string token (quotes included) into its value
pub fn unescape_string(lexeme: &str) -> Result<String, LexError> {
    let body = &lexeme[1..lexeme.len() - 1];
    let mut out = String::with_capacity(body.len());
    let mut chars = body.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        let escaped = chars.next().ok_or(LexError::InvalidEscape('\0'))?;
        match escaped {
            'n' => out.push('\n'),
            't' => out.push('\t'),
            'r' => out.push('\r'),
            'a' => out.push('\x07'),
            'b' => out.push('\x08'),
            'f' => out.push('\x0c'),
            'v' => out.push('\x0b'),
            '\\' => out.push('\\'),
            '"' => out.push('"'),
            '\'' => out.push('\''),
            '0'..='9' => {
                // Decimal escape, up to three digits
                let mut value = escaped.to_digit(10).unwrap();
                let mut rest = chars.clone();
                for _ in 0..2 {
                    match rest.next() {
                        Some(d) if d.is_ascii_digit() => {
                            value = value * 10 + d.to_digit(10).unwrap();
                            chars = rest.clone();
                        }
                        _ => break,
                    }
                }
                if value > 255 {
                    return Err(LexError::InvalidEscape(escaped));
                }
                out.push(value as u8 as char);
            }
            other => return Err(LexError::InvalidEscape(other)),
        }
    }
    Ok(out)
}

/// Parse an integer token's lexeme (decimal or hexadecimal)
pub fn parse_integer(lexeme: &str) -> Result<i64, LexError> {
    if let Some(hex) = lexeme
        .strip_prefix("0x")
        .or_else(|| lexeme.strip_prefix("0X"))
    {
        // Hex literals wrap around, as in the host language
        u64::from_str_radix(hex, 16)
            .map(|v| v as i64)
            .map_err(|_| LexError::MalformedNumber)
    } else {
        lexeme.parse::<i64>().map_err(|_| LexError::MalformedNumber)
    }
}

/// Parse a float token's lexeme
pub fn parse_float(lexeme: &str) -> Result<f64, LexError> {
    lexeme.parse::<f64>().map_err(|_| LexError::MalformedNumber)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lex_kinds(source: &str) -> Vec<TokenKind> {
        Lexer::tokenize(source)
            .tokens
            .into_iter()
            .map(|t| t.kind)
            .collect()
    }

    #[test]
    fn lex_keywords() {
        assert_eq!(
            lex_kinds("local function end return while"),
            vec![
                TokenKind::Local,
                TokenKind::Function,
                TokenKind::End,
                TokenKind::Return,
                TokenKind::While,
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn lex_integer_vs_float() {
        let out = Lexer::tokenize("10 10.0 1e3 0xFF .5");
        let kinds: Vec<_> = out.tokens.iter().map(|t| t.kind.clone()).collect();
        assert_eq!(
            kinds,
            vec![
                TokenKind::Integer,
                TokenKind::Float,
                TokenKind::Float,
                TokenKind::Integer,
                TokenKind::Float,
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn lex_operators() {
        assert_eq!(
            lex_kinds("// / .. . ~= == << >= ~"),
            vec![
                TokenKind::DoubleSlash,
                TokenKind::Slash,
                TokenKind::DotDot,
                TokenKind::Dot,
                TokenKind::TildeEq,
                TokenKind::EqEq,
                TokenKind::LtLt,
                TokenKind::GtEq,
                TokenKind::Tilde,
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn lex_comments_are_spanned() {
        let out = Lexer::tokenize("local x -- trailing\n--[[ block\ncomment ]] local y");
        assert_eq!(out.comments.len(), 2);
        let kinds: Vec<_> = out.tokens.iter().map(|t| t.kind.clone()).collect();
        assert_eq!(
            kinds,
            vec![
                TokenKind::Local,
                TokenKind::Name,
                TokenKind::Local,
                TokenKind::Name,
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn lex_unterminated_block_comment() {
        let out = Lexer::tokenize("--[[ never closed");
        assert_eq!(out.errors.len(), 1);
        assert_eq!(out.errors[0].error, LexError::UnterminatedComment);
    }

    #[test]
    fn lex_string_lexeme_is_raw() {
        let out = Lexer::tokenize(r#"local s = "a\nb""#);
        let tok = out
            .tokens
            .iter()
            .find(|t| t.kind == TokenKind::String)
            .unwrap();
        assert_eq!(tok.lexeme, r#""a\nb""#);
        assert_eq!(unescape_string(&tok.lexeme).unwrap(), "a\nb");
    }

    #[test]
    fn unescape_decimal() {
        assert_eq!(unescape_string("'\\65\\66'").unwrap(), "AB");
        assert!(unescape_string("'\\999'").is_err());
    }

    #[test]
    fn parse_hex_integer_wraps() {
        assert_eq!(parse_integer("0xFFFFFFFFFFFFFFFF").unwrap(), -1);
        assert_eq!(parse_integer("42").unwrap(), 42);
    }

    #[test]
    fn lex_spans_are_correct() {
        let out = Lexer::tokenize("local x = 42");
        assert_eq!(out.tokens[0].span, Span::new(0, 5));
        assert_eq!(out.tokens[1].span, Span::new(6, 7));
        assert_eq!(out.tokens[2].span, Span::new(8, 9));
        assert_eq!(out.tokens[3].span, Span::new(10, 12));
    }
}
