//! Parser for the Pallene programming language
//!
//! A hand-written recursive-descent parser over the token stream. Binary
//! expressions use precedence climbing with the table from the language
//! definition; every commit point (after `function`, `if`, `record`, ...)
//! carries a label from the static error catalog in [`error`].
//!
//! The parser is a plain context object constructed per invocation; there
//! is no process-global state, so callers that serialize invocations get
//! reentrancy for free.

mod error;

pub use error::{ParseError, ParseErrorKind};

use crate::ast::{
    Binop, Block, ElseBranch, Exp, ExpKind, FuncBody, FuncDecl, Ident, ImportDecl, InitEntry,
    LocalDecl, Param, Program, RecordDecl, Stat, StatKind, TableFieldAnnotation, Toplevel,
    ToplevelKind, TypeAnnotation, TypeKind, TypealiasDecl, Unop, VarDecl, VarKind, VarNode,
    Visibility,
};
use crate::lexer::{self, Lexer, Span, Token, TokenKind};

/// Result type for parsing operations
pub type ParseResult<T> = Result<T, ParseError>;

/// Precedence of unary operators
const UNARY_PRIORITY: u8 = 12;

/// Left/right binding priority for a binary operator token.
///
/// Right-associative operators (`..`, `^`) have a right priority one
/// below their left priority.
fn binop_priority(kind: &TokenKind) -> Option<(Binop, u8, u8)> {
    let entry = match kind {
        TokenKind::Or => (Binop::Or, 1, 1),
        TokenKind::And => (Binop::And, 2, 2),
        TokenKind::EqEq => (Binop::Eq, 3, 3),
        TokenKind::TildeEq => (Binop::Ne, 3, 3),
        TokenKind::Lt => (Binop::Lt, 3, 3),
        TokenKind::Gt => (Binop::Gt, 3, 3),
        TokenKind::LtEq => (Binop::Le, 3, 3),
        TokenKind::GtEq => (Binop::Ge, 3, 3),
        TokenKind::Pipe => (Binop::BOr, 4, 4),
        TokenKind::Tilde => (Binop::BXor, 5, 5),
        TokenKind::Ampersand => (Binop::BAnd, 6, 6),
        TokenKind::LtLt => (Binop::Shl, 7, 7),
        TokenKind::GtGt => (Binop::Shr, 7, 7),
        TokenKind::Plus => (Binop::Add, 10, 10),
        TokenKind::Minus => (Binop::Sub, 10, 10),
        TokenKind::Star => (Binop::Mul, 11, 11),
        TokenKind::Slash => (Binop::Div, 11, 11),
        TokenKind::DoubleSlash => (Binop::IntDiv, 11, 11),
        TokenKind::Percent => (Binop::Mod, 11, 11),
        TokenKind::Caret => (Binop::Pow, 14, 13),
        _ => return None,
    };
    Some(entry)
}

/// Concatenation is right-associative and builds a flattened node
const CONCAT_LEFT: u8 = 9;
const CONCAT_RIGHT: u8 = 8;

/// The Pallene parser
pub struct Parser {
    /// All tokens from the source (comments already filtered)
    tokens: Vec<Token>,
    /// Current position in the token stream
    position: usize,
    /// Collected parse errors (lexer errors folded in at the end)
    errors: Vec<ParseError>,
    /// Comment spans, handed through to the program for the translator
    comments: Vec<Span>,
    /// Lexer errors, merged into the final error list
    lex_errors: Vec<ParseError>,
    /// Nesting depth of loops, for `break` validation
    loop_depth: u32,
}

impl Parser {
    /// Create a new parser from source code
    #[must_use]
    pub fn new(source: &str) -> Self {
        let out = Lexer::tokenize(source);
        let lex_errors = out
            .errors
            .into_iter()
            .map(|e| ParseError::new(ParseErrorKind::Lex(e.error), e.span))
            .collect();
        Self {
            tokens: out.tokens,
            position: 0,
            errors: Vec::new(),
            comments: out.comments,
            lex_errors,
            loop_depth: 0,
        }
    }

    /// Parse an entire program (source file)
    ///
    /// # Errors
    ///
    /// Returns all syntax errors, in source order.
    pub fn parse_program(source: &str) -> Result<Program, Vec<ParseError>> {
        let mut parser = Parser::new(source);
        let program = parser.program();
        let mut errors = parser.lex_errors;
        errors.extend(parser.errors);
        if errors.is_empty() {
            Ok(program)
        } else {
            errors.sort_by_key(|e| e.span.start);
            Err(errors)
        }
    }

    // ==================== Token Management ====================

    fn current(&self) -> &Token {
        self.tokens.get(self.position).unwrap_or_else(|| {
            self.tokens
                .last()
                .expect("token stream always ends with Eof")
        })
    }

    fn current_kind(&self) -> TokenKind {
        self.current().kind.clone()
    }

    fn is_eof(&self) -> bool {
        self.current_kind() == TokenKind::Eof
    }

    fn advance(&mut self) -> Token {
        let token = self.current().clone();
        if self.position < self.tokens.len() - 1 {
            self.position += 1;
        }
        token
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.current_kind() == kind
    }

    fn eat(&mut self, kind: TokenKind) -> Option<Token> {
        if self.check(kind) {
            Some(self.advance())
        } else {
            None
        }
    }

    /// Expect a token, reporting a generic unexpected-token error
    fn expect(&mut self, kind: TokenKind, expected: &'static str) -> ParseResult<Token> {
        if self.check(kind) {
            Ok(self.advance())
        } else {
            Err(ParseError::new(
                ParseErrorKind::UnexpectedToken {
                    found: self.current_kind(),
                    expected,
                },
                self.current().span,
            ))
        }
    }

    /// Expect a token at a commit point, reporting the given label
    fn expect_labeled(&mut self, kind: TokenKind, label: ParseErrorKind) -> ParseResult<Token> {
        if self.check(kind) {
            Ok(self.advance())
        } else {
            Err(ParseError::new(label, self.current().span))
        }
    }

    fn expect_name(&mut self) -> ParseResult<Ident> {
        let token = self.current().clone();
        if token.kind == TokenKind::Name {
            self.advance();
            Ok(Ident::new(token.lexeme, token.span))
        } else {
            Err(ParseError::new(ParseErrorKind::ExpectedName, token.span))
        }
    }

    fn error(&mut self, error: ParseError) {
        self.errors.push(error);
    }

    /// Skip tokens until the start of the next top-level declaration
    fn synchronize(&mut self) {
        while !self.is_eof() {
            if matches!(
                self.current_kind(),
                TokenKind::Local
                    | TokenKind::Export
                    | TokenKind::Function
                    | TokenKind::Record
                    | TokenKind::Typealias
            ) {
                return;
            }
            self.advance();
        }
    }

    // ==================== Program ====================

    fn program(&mut self) -> Program {
        let mut toplevels = Vec::new();
        while !self.is_eof() {
            match self.toplevel() {
                Ok(tl) => toplevels.push(tl),
                Err(e) => {
                    self.error(e);
                    self.advance();
                    self.synchronize();
                }
            }
        }
        Program::new(toplevels, std::mem::take(&mut self.comments))
    }

    fn toplevel(&mut self) -> ParseResult<Toplevel> {
        match self.current_kind() {
            TokenKind::Local | TokenKind::Export => {
                let vis_token = self.advance();
                let visibility = if vis_token.kind == TokenKind::Export {
                    Visibility::Export
                } else {
                    Visibility::Local
                };
                if self.check(TokenKind::Function) {
                    self.toplevel_func(visibility, vis_token.span)
                } else {
                    self.toplevel_var(visibility, vis_token.span)
                }
            }
            // A bare `function` at top level is public
            TokenKind::Function => self.toplevel_func(Visibility::Export, Span::dummy()),
            TokenKind::Typealias => self.toplevel_typealias(),
            TokenKind::Record => self.toplevel_record(),
            _ => Err(ParseError::new(
                ParseErrorKind::ExpectedToplevel,
                self.current().span,
            )),
        }
    }

    fn toplevel_func(&mut self, visibility: Visibility, vis_span: Span) -> ParseResult<Toplevel> {
        let func_token = self.expect(TokenKind::Function, "`function`")?;
        let name = self.expect_name()?;
        let body = self.func_body(func_token.span.start)?;
        let start = if vis_span.is_dummy() {
            func_token.span.start
        } else {
            vis_span.start
        };
        let span = Span::new(start, body.span.end);
        Ok(Toplevel::new(
            ToplevelKind::Func(FuncDecl {
                visibility,
                vis_span,
                name,
                body,
            }),
            span,
        ))
    }

    fn toplevel_var(&mut self, visibility: Visibility, vis_span: Span) -> ParseResult<Toplevel> {
        let name = self.expect_name()?;
        let (annotation, strip_span) = self.optional_annotation()?;
        self.expect(TokenKind::Eq, "`=`")?;
        let value = self.expression()?;
        let span = Span::new(vis_span.start, value.span.end);

        // `local name = import("module")` is an import declaration
        if let ExpKind::CallFunc { callee, args } = &value.kind {
            if let ExpKind::Var(VarNode {
                kind: VarKind::Name(f),
                ..
            }) = &callee.kind
            {
                if f.name == "import" {
                    if visibility == Visibility::Export || annotation.is_some() || args.len() != 1 {
                        return Err(ParseError::new(ParseErrorKind::MalformedImport, value.span));
                    }
                    let ExpKind::String(module) = &args[0].kind else {
                        return Err(ParseError::new(ParseErrorKind::MalformedImport, value.span));
                    };
                    return Ok(Toplevel::new(
                        ToplevelKind::Import(ImportDecl {
                            name,
                            module: module.clone(),
                        }),
                        span,
                    ));
                }
            }
        }

        Ok(Toplevel::new(
            ToplevelKind::Var(VarDecl {
                visibility,
                vis_span,
                name,
                annotation,
                strip_span,
                ty: None,
                value,
            }),
            span,
        ))
    }

    fn toplevel_typealias(&mut self) -> ParseResult<Toplevel> {
        let kw = self.expect(TokenKind::Typealias, "`typealias`")?;
        let name = self.expect_name()?;
        self.expect(TokenKind::Eq, "`=`")?;
        let annotation = self.type_annotation()?;
        let span = Span::new(kw.span.start, annotation.span.end);
        Ok(Toplevel::new(
            ToplevelKind::Typealias(TypealiasDecl { name, annotation }),
            span,
        ))
    }

    fn toplevel_record(&mut self) -> ParseResult<Toplevel> {
        let kw = self.expect(TokenKind::Record, "`record`")?;
        let name = self.expect_name()?;
        let mut fields = Vec::new();
        while self.check(TokenKind::Name) {
            let field = self.expect_name()?;
            self.expect(TokenKind::Colon, "`:`")?;
            let ty = self.type_annotation()?;
            fields.push((field, ty));
            self.eat(TokenKind::Semicolon);
        }
        let end = self.expect_labeled(TokenKind::End, ParseErrorKind::RecordMissingEnd)?;
        let span = Span::new(kw.span.start, end.span.end);
        Ok(Toplevel::new(
            ToplevelKind::Record(RecordDecl { name, fields }),
            span,
        ))
    }

    // ==================== Declarations ====================

    /// Parse an optional `: type` annotation, returning it together with
    /// the byte span the translator must blank (colon through type end)
    fn optional_annotation(&mut self) -> ParseResult<(Option<TypeAnnotation>, Option<Span>)> {
        if let Some(colon) = self.eat(TokenKind::Colon) {
            let annotation = self.type_annotation()?;
            let strip = Span::new(colon.span.start, annotation.span.end);
            Ok((Some(annotation), Some(strip)))
        } else {
            Ok((None, None))
        }
    }

    fn local_decl(&mut self) -> ParseResult<LocalDecl> {
        let name = self.expect_name()?;
        let (annotation, strip_span) = self.optional_annotation()?;
        Ok(LocalDecl::new(name, annotation, strip_span))
    }

    // ==================== Types ====================

    fn type_annotation(&mut self) -> ParseResult<TypeAnnotation> {
        let token = self.current().clone();
        match token.kind {
            TokenKind::Nil => {
                self.advance();
                Ok(TypeAnnotation::new(TypeKind::Nil, token.span))
            }
            TokenKind::Name => {
                self.advance();
                let kind = match token.lexeme.as_str() {
                    "boolean" => TypeKind::Boolean,
                    "integer" => TypeKind::Integer,
                    "float" => TypeKind::Float,
                    "string" => TypeKind::String,
                    "any" => TypeKind::Any,
                    _ => TypeKind::Name(Ident::new(token.lexeme, token.span)),
                };
                Ok(TypeAnnotation::new(kind, token.span))
            }
            TokenKind::LBrace => self.brace_type(),
            TokenKind::LParen => self.function_type(),
            _ => Err(ParseError::new(ParseErrorKind::ExpectedType, token.span)),
        }
    }

    /// `{ T }` array type or `{ name: T, ... }` table type
    fn brace_type(&mut self) -> ParseResult<TypeAnnotation> {
        let open = self.expect(TokenKind::LBrace, "`{`")?;
        let is_table = self.check(TokenKind::Name)
            && self
                .tokens
                .get(self.position + 1)
                .is_some_and(|t| t.kind == TokenKind::Colon);
        if is_table {
            let mut fields = Vec::new();
            loop {
                let name = self.expect_name()?;
                self.expect(TokenKind::Colon, "`:`")?;
                let ty = self.type_annotation()?;
                fields.push(TableFieldAnnotation { name, ty });
                if self.eat(TokenKind::Comma).is_none() {
                    break;
                }
            }
            let close = self.expect(TokenKind::RBrace, "`}`")?;
            Ok(TypeAnnotation::new(
                TypeKind::Table(fields),
                Span::new(open.span.start, close.span.end),
            ))
        } else {
            let elem = self.type_annotation()?;
            let close = self.expect(TokenKind::RBrace, "`}`")?;
            Ok(TypeAnnotation::new(
                TypeKind::Array(Box::new(elem)),
                Span::new(open.span.start, close.span.end),
            ))
        }
    }

    /// `(T1, T2) -> R` or `(T1, T2) -> (R1, R2)`
    fn function_type(&mut self) -> ParseResult<TypeAnnotation> {
        let open = self.expect(TokenKind::LParen, "`(`")?;
        let mut params = Vec::new();
        if !self.check(TokenKind::RParen) {
            loop {
                params.push(self.type_annotation()?);
                if self.eat(TokenKind::Comma).is_none() {
                    break;
                }
            }
        }
        self.expect(TokenKind::RParen, "`)`")?;
        self.expect(TokenKind::Arrow, "`->`")?;
        let (rets, end) = self.return_types()?;
        Ok(TypeAnnotation::new(
            TypeKind::Function { params, rets },
            Span::new(open.span.start, end),
        ))
    }

    /// A single return type or a parenthesized list of them.
    ///
    /// A parenthesized list followed by `->` is re-read as the parameter
    /// list of a function type, so `(): (integer) -> integer` works.
    fn return_types(&mut self) -> ParseResult<(Vec<TypeAnnotation>, u32)> {
        if self.check(TokenKind::LParen) {
            let open = self.advance();
            let mut types = Vec::new();
            if !self.check(TokenKind::RParen) {
                loop {
                    types.push(self.type_annotation()?);
                    if self.eat(TokenKind::Comma).is_none() {
                        break;
                    }
                }
            }
            let close = self.expect(TokenKind::RParen, "`)`")?;
            if self.check(TokenKind::Arrow) {
                self.advance();
                let (rets, end) = self.return_types()?;
                let fn_ty = TypeAnnotation::new(
                    TypeKind::Function {
                        params: types,
                        rets,
                    },
                    Span::new(open.span.start, end),
                );
                return Ok((vec![fn_ty], end));
            }
            Ok((types, close.span.end))
        } else {
            let ty = self.type_annotation()?;
            let end = ty.span.end;
            Ok((vec![ty], end))
        }
    }

    // ==================== Functions ====================

    /// Parameter list, optional return annotation, and body; the caller
    /// has already consumed the `function` keyword at `start`
    fn func_body(&mut self, start: u32) -> ParseResult<FuncBody> {
        self.expect(TokenKind::LParen, "`(`")?;
        let mut params = Vec::new();
        if !self.check(TokenKind::RParen) {
            loop {
                let name = self.expect_name()?;
                let (annotation, strip_span) = self.optional_annotation()?;
                params.push(Param::new(name, annotation, strip_span));
                if self.eat(TokenKind::Comma).is_none() {
                    break;
                }
            }
        }
        self.expect(TokenKind::RParen, "`)`")?;

        let (ret_annotations, ret_strip_span) = if let Some(colon) = self.eat(TokenKind::Colon) {
            let (rets, end) = self.return_types()?;
            (rets, Some(Span::new(colon.span.start, end)))
        } else {
            (Vec::new(), None)
        };

        let block = self.block()?;
        let end = self.expect_labeled(TokenKind::End, ParseErrorKind::FuncMissingEnd)?;
        Ok(FuncBody {
            params,
            ret_annotations,
            ret_strip_span,
            ret_types: None,
            block,
            span: Span::new(start, end.span.end),
        })
    }

    // ==================== Statements ====================

    /// True when the current token ends a block
    fn at_block_end(&self) -> bool {
        matches!(
            self.current_kind(),
            TokenKind::End
                | TokenKind::Else
                | TokenKind::Elseif
                | TokenKind::Until
                | TokenKind::Eof
        )
    }

    fn block(&mut self) -> ParseResult<Block> {
        let start = self.current().span.start;
        let mut stats = Vec::new();
        while !self.at_block_end() {
            if self.eat(TokenKind::Semicolon).is_some() {
                continue;
            }
            let stat = self.statement()?;
            let is_return = matches!(stat.kind, StatKind::Return { .. });
            stats.push(stat);
            if is_return && !self.at_block_end() {
                let span = self.current().span;
                self.error(ParseError::new(ParseErrorKind::ReturnNotLast, span));
            }
        }
        let end = self.current().span.start;
        Ok(Block::new(stats, Span::new(start, end)))
    }

    fn statement(&mut self) -> ParseResult<Stat> {
        match self.current_kind() {
            TokenKind::Do => {
                let kw = self.advance();
                let body = self.block()?;
                let end = self.expect_labeled(TokenKind::End, ParseErrorKind::DoMissingEnd)?;
                Ok(Stat::new(
                    StatKind::Block(body),
                    Span::new(kw.span.start, end.span.end),
                ))
            }
            TokenKind::Local => {
                let kw = self.advance();
                let decl = self.local_decl()?;
                let value = if self.eat(TokenKind::Eq).is_some() {
                    Some(self.expression()?)
                } else {
                    None
                };
                let end = value
                    .as_ref()
                    .map_or_else(|| decl.name.span.end, |v| v.span.end);
                Ok(Stat::new(
                    StatKind::Decl { decl, value },
                    Span::new(kw.span.start, end),
                ))
            }
            TokenKind::If => self.if_statement(),
            TokenKind::While => {
                let kw = self.advance();
                let condition = self.expression()?;
                self.expect_labeled(TokenKind::Do, ParseErrorKind::MissingDo)?;
                self.loop_depth += 1;
                let body = self.block();
                self.loop_depth -= 1;
                let body = body?;
                let end = self.expect_labeled(TokenKind::End, ParseErrorKind::WhileMissingEnd)?;
                Ok(Stat::new(
                    StatKind::While { condition, body },
                    Span::new(kw.span.start, end.span.end),
                ))
            }
            TokenKind::Repeat => {
                let kw = self.advance();
                self.loop_depth += 1;
                let body = self.block();
                self.loop_depth -= 1;
                let body = body?;
                self.expect_labeled(TokenKind::Until, ParseErrorKind::RepeatMissingUntil)?;
                let condition = self.expression()?;
                let end = condition.span.end;
                Ok(Stat::new(
                    StatKind::Repeat { body, condition },
                    Span::new(kw.span.start, end),
                ))
            }
            TokenKind::For => self.for_statement(),
            TokenKind::Break => {
                let kw = self.advance();
                if self.loop_depth == 0 {
                    self.error(ParseError::new(ParseErrorKind::BreakOutsideLoop, kw.span));
                }
                Ok(Stat::new(StatKind::Break, kw.span))
            }
            TokenKind::Return => {
                let kw = self.advance();
                let mut values = Vec::new();
                if !self.at_block_end() && !self.check(TokenKind::Semicolon) {
                    loop {
                        values.push(self.expression()?);
                        if self.eat(TokenKind::Comma).is_none() {
                            break;
                        }
                    }
                }
                self.eat(TokenKind::Semicolon);
                let end = values.last().map_or(kw.span.end, |v| v.span.end);
                Ok(Stat::new(
                    StatKind::Return { values },
                    Span::new(kw.span.start, end),
                ))
            }
            kind if kind.is_exp_start() => self.exp_statement(),
            _ => Err(ParseError::new(
                ParseErrorKind::ExpectedStatement,
                self.current().span,
            )),
        }
    }

    fn if_statement(&mut self) -> ParseResult<Stat> {
        let kw = self.advance(); // `if` or `elseif`
        let condition = self.expression()?;
        self.expect_labeled(TokenKind::Then, ParseErrorKind::MissingThen)?;
        let then_block = self.block()?;

        let (else_branch, end) = match self.current_kind() {
            TokenKind::Elseif => {
                let nested = self.if_statement()?;
                let end = nested.span.end;
                (Some(ElseBranch::Elseif(Box::new(nested))), end)
            }
            TokenKind::Else => {
                self.advance();
                let else_block = self.block()?;
                let end_tok = self.expect_labeled(TokenKind::End, ParseErrorKind::IfMissingEnd)?;
                (Some(ElseBranch::Else(else_block)), end_tok.span.end)
            }
            _ => {
                let end_tok = self.expect_labeled(TokenKind::End, ParseErrorKind::IfMissingEnd)?;
                (None, end_tok.span.end)
            }
        };

        Ok(Stat::new(
            StatKind::If {
                condition,
                then_block,
                else_branch,
            },
            Span::new(kw.span.start, end),
        ))
    }

    fn for_statement(&mut self) -> ParseResult<Stat> {
        let kw = self.advance();
        let decl = self.local_decl()?;
        self.expect(TokenKind::Eq, "`=`")?;
        let start = self.expression()?;
        self.expect(TokenKind::Comma, "`,`")?;
        let limit = self.expression()?;
        let step = if self.eat(TokenKind::Comma).is_some() {
            Some(self.expression()?)
        } else {
            None
        };
        self.expect_labeled(TokenKind::Do, ParseErrorKind::MissingDo)?;
        self.loop_depth += 1;
        let body = self.block();
        self.loop_depth -= 1;
        let body = body?;
        let end = self.expect_labeled(TokenKind::End, ParseErrorKind::ForMissingEnd)?;
        Ok(Stat::new(
            StatKind::For {
                decl,
                start,
                limit,
                step,
                body,
            },
            Span::new(kw.span.start, end.span.end),
        ))
    }

    /// A statement beginning with an expression: assignment or call
    fn exp_statement(&mut self) -> ParseResult<Stat> {
        let exp = self.suffixed_exp()?;
        let start = exp.span.start;

        if self.check(TokenKind::Eq) {
            self.advance();
            let value = self.expression()?;
            let span = Span::new(start, value.span.end);
            // The left side must reduce to a Var node
            return match exp.kind {
                ExpKind::Var(target) => Ok(Stat::new(StatKind::Assign { target, value }, span)),
                _ => Err(ParseError::new(ParseErrorKind::AssignNotToVar, exp.span)),
            };
        }

        match exp.kind {
            ExpKind::CallFunc { .. } | ExpKind::CallMethod { .. } => {
                let span = exp.span;
                Ok(Stat::new(StatKind::Call(exp), span))
            }
            _ => Err(ParseError::new(ParseErrorKind::ExpStatNotCall, exp.span)),
        }
    }

    // ==================== Expressions ====================

    /// Parse an expression
    pub fn expression(&mut self) -> ParseResult<Exp> {
        self.binop_exp(0)
    }

    /// Precedence climbing over binary operators
    fn binop_exp(&mut self, limit: u8) -> ParseResult<Exp> {
        let mut lhs = if let Some(op) = self.unop_here() {
            let op_token = self.advance();
            let operand = self.binop_exp(UNARY_PRIORITY)?;
            let span = Span::new(op_token.span.start, operand.span.end);
            Exp::new(
                ExpKind::Unop {
                    op,
                    exp: Box::new(operand),
                },
                span,
            )
        } else {
            self.simple_exp()?
        };

        loop {
            if self.check(TokenKind::DotDot) {
                if CONCAT_LEFT <= limit {
                    break;
                }
                self.advance();
                let rhs = self.binop_exp(CONCAT_RIGHT)?;
                let span = Span::new(lhs.span.start, rhs.span.end);
                // Right recursion already produced a flattened tail
                let mut exps = vec![lhs];
                match rhs.kind {
                    ExpKind::Concat(tail) => exps.extend(tail),
                    _ => exps.push(rhs),
                }
                lhs = Exp::new(ExpKind::Concat(exps), span);
                continue;
            }

            let Some((op, left_prio, right_prio)) = binop_priority(&self.current_kind()) else {
                break;
            };
            if left_prio <= limit {
                break;
            }
            self.advance();
            let rhs = self.binop_exp(right_prio)?;
            let span = Span::new(lhs.span.start, rhs.span.end);
            lhs = Exp::new(
                ExpKind::Binop {
                    op,
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                },
                span,
            );
        }
        Ok(lhs)
    }

    fn unop_here(&self) -> Option<Unop> {
        match self.current_kind() {
            TokenKind::Not => Some(Unop::Not),
            TokenKind::Hash => Some(Unop::Len),
            TokenKind::Minus => Some(Unop::Neg),
            TokenKind::Tilde => Some(Unop::BNot),
            _ => None,
        }
    }

    /// Literals, initializer lists, lambdas, and suffixed expressions,
    /// with trailing `as T` casts applied
    fn simple_exp(&mut self) -> ParseResult<Exp> {
        let token = self.current().clone();
        let mut exp = match token.kind {
            TokenKind::Nil => {
                self.advance();
                Exp::new(ExpKind::Nil, token.span)
            }
            TokenKind::True => {
                self.advance();
                Exp::new(ExpKind::Bool(true), token.span)
            }
            TokenKind::False => {
                self.advance();
                Exp::new(ExpKind::Bool(false), token.span)
            }
            TokenKind::Integer => {
                self.advance();
                let value = lexer::parse_integer(&token.lexeme)
                    .map_err(|e| ParseError::new(ParseErrorKind::Lex(e), token.span))?;
                Exp::new(ExpKind::Integer(value), token.span)
            }
            TokenKind::Float => {
                self.advance();
                let value = lexer::parse_float(&token.lexeme)
                    .map_err(|e| ParseError::new(ParseErrorKind::Lex(e), token.span))?;
                Exp::new(ExpKind::Float(value), token.span)
            }
            TokenKind::String => {
                self.advance();
                let value = lexer::unescape_string(&token.lexeme)
                    .map_err(|e| ParseError::new(ParseErrorKind::Lex(e), token.span))?;
                Exp::new(ExpKind::String(value), token.span)
            }
            TokenKind::LBrace => self.initlist()?,
            TokenKind::Function => {
                let kw = self.advance();
                let body = self.func_body(kw.span.start)?;
                let span = body.span;
                Exp::new(ExpKind::Lambda(Box::new(body)), span)
            }
            _ => self.suffixed_exp()?,
        };

        // Casts bind tightest of all
        while self.check(TokenKind::As) {
            let as_token = self.advance();
            let annotation = self.type_annotation()?;
            let strip_span = Span::new(as_token.span.start, annotation.span.end);
            let span = Span::new(exp.span.start, annotation.span.end);
            exp = Exp::new(
                ExpKind::Cast {
                    exp: Box::new(exp),
                    annotation: Some(annotation),
                    strip_span,
                    target: None,
                },
                span,
            );
        }
        Ok(exp)
    }

    /// `{ e1, e2 }` or `{ name = e, ... }`
    fn initlist(&mut self) -> ParseResult<Exp> {
        let open = self.expect(TokenKind::LBrace, "`{`")?;
        let mut entries = Vec::new();
        while !self.check(TokenKind::RBrace) {
            let named = self.check(TokenKind::Name)
                && self
                    .tokens
                    .get(self.position + 1)
                    .is_some_and(|t| t.kind == TokenKind::Eq);
            if named {
                let name = self.expect_name()?;
                self.expect(TokenKind::Eq, "`=`")?;
                let value = self.expression()?;
                entries.push(InitEntry::Named { name, value });
            } else {
                entries.push(InitEntry::Positional(self.expression()?));
            }
            if self.eat(TokenKind::Comma).is_none() && self.eat(TokenKind::Semicolon).is_none() {
                break;
            }
        }
        let close = self.expect(TokenKind::RBrace, "`}`")?;
        Ok(Exp::new(
            ExpKind::Initlist(entries),
            Span::new(open.span.start, close.span.end),
        ))
    }

    /// A primary expression followed by `.name`, `[exp]`, calls, and
    /// method calls
    fn suffixed_exp(&mut self) -> ParseResult<Exp> {
        let token = self.current().clone();
        let mut exp = match token.kind {
            TokenKind::Name => {
                self.advance();
                Exp::new(
                    ExpKind::Var(VarNode::new(
                        VarKind::Name(Ident::new(token.lexeme, token.span)),
                        token.span,
                    )),
                    token.span,
                )
            }
            TokenKind::LParen => {
                self.advance();
                let inner = self.expression()?;
                let close = self.expect(TokenKind::RParen, "`)`")?;
                Exp::new(
                    ExpKind::Paren(Box::new(inner)),
                    Span::new(token.span.start, close.span.end),
                )
            }
            _ => {
                return Err(ParseError::new(
                    ParseErrorKind::ExpectedExpression,
                    token.span,
                ))
            }
        };

        loop {
            match self.current_kind() {
                TokenKind::Dot => {
                    self.advance();
                    let field = self.expect_name()?;
                    let span = Span::new(exp.span.start, field.span.end);
                    exp = Exp::new(
                        ExpKind::Var(VarNode::new(
                            VarKind::Dot {
                                prefix: Box::new(exp),
                                field,
                            },
                            span,
                        )),
                        span,
                    );
                }
                TokenKind::LBracket => {
                    self.advance();
                    let index = self.expression()?;
                    let close = self.expect(TokenKind::RBracket, "`]`")?;
                    let span = Span::new(exp.span.start, close.span.end);
                    exp = Exp::new(
                        ExpKind::Var(VarNode::new(
                            VarKind::Bracket {
                                prefix: Box::new(exp),
                                index: Box::new(index),
                            },
                            span,
                        )),
                        span,
                    );
                }
                TokenKind::LParen => {
                    let (args, end) = self.call_args()?;
                    let span = Span::new(exp.span.start, end);
                    exp = Exp::new(
                        ExpKind::CallFunc {
                            callee: Box::new(exp),
                            args,
                        },
                        span,
                    );
                }
                TokenKind::Colon => {
                    self.advance();
                    let method = self.expect_name()?;
                    let (args, end) = self.call_args()?;
                    let span = Span::new(exp.span.start, end);
                    exp = Exp::new(
                        ExpKind::CallMethod {
                            receiver: Box::new(exp),
                            method,
                            args,
                        },
                        span,
                    );
                }
                _ => break,
            }
        }
        Ok(exp)
    }

    fn call_args(&mut self) -> ParseResult<(Vec<Exp>, u32)> {
        self.expect(TokenKind::LParen, "`(`")?;
        let mut args = Vec::new();
        if !self.check(TokenKind::RParen) {
            loop {
                args.push(self.expression()?);
                if self.eat(TokenKind::Comma).is_none() {
                    break;
                }
            }
        }
        let close = self.expect(TokenKind::RParen, "`)`")?;
        Ok((args, close.span.end))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(source: &str) -> Program {
        Parser::parse_program(source).expect("program should parse")
    }

    fn parse_err(source: &str) -> Vec<ParseError> {
        Parser::parse_program(source).expect_err("program should not parse")
    }

    fn first_func(program: &Program) -> &FuncDecl {
        for tl in &program.toplevels {
            if let ToplevelKind::Func(f) = &tl.kind {
                return f;
            }
        }
        panic!("no function in program")
    }

    #[test]
    fn parse_function_with_return_type() {
        let program = parse("function f(): integer return 10 end");
        let func = first_func(&program);
        assert_eq!(func.name.name, "f");
        assert_eq!(func.visibility, Visibility::Export);
        assert_eq!(func.body.ret_annotations.len(), 1);
        assert_eq!(func.body.block.stats.len(), 1);
    }

    #[test]
    fn parse_params_record_strip_spans() {
        let program = parse("local function f(x: integer, y: float) end");
        let func = first_func(&program);
        assert_eq!(func.visibility, Visibility::Local);
        assert_eq!(func.body.params.len(), 2);
        let source = "local function f(x: integer, y: float) end";
        let strip = func.body.params[0].strip_span.unwrap();
        assert_eq!(&source[strip.as_range()], ": integer");
    }

    #[test]
    fn missing_end_reports_labeled_error() {
        let errors = parse_err("function f(): integer return 10");
        assert!(errors
            .iter()
            .any(|e| e.kind == ParseErrorKind::FuncMissingEnd));
    }

    #[test]
    fn break_outside_loop_is_rejected() {
        let errors = parse_err("function f() break end");
        let err = errors
            .iter()
            .find(|e| e.kind == ParseErrorKind::BreakOutsideLoop)
            .expect("break error");
        // The error points at the break itself
        assert_eq!(err.span, Span::new(13, 18));
    }

    #[test]
    fn break_inside_loop_is_fine() {
        parse("function f() while true do break end end");
        parse("function f() repeat break until true end");
        parse("function f() for i = 1, 10 do break end end");
    }

    #[test]
    fn assignment_to_call_is_rejected() {
        let errors = parse_err("function f() g() = 1 end");
        assert!(errors
            .iter()
            .any(|e| e.kind == ParseErrorKind::AssignNotToVar));
    }

    #[test]
    fn assignment_targets() {
        parse("function f(t: {integer}) t[1] = 2 end");
        parse("function f(p: Point) p.x = 1.0 end");
        parse("local x: integer = 0 function f() x = 1 end");
    }

    #[test]
    fn operator_precedence_mul_over_add() {
        let program = parse("local r: integer = 1 + 2 * 3");
        let ToplevelKind::Var(var) = &program.toplevels[0].kind else {
            panic!("expected var")
        };
        let ExpKind::Binop { op, rhs, .. } = &var.value.kind else {
            panic!("expected binop")
        };
        assert_eq!(*op, Binop::Add);
        assert!(matches!(
            rhs.kind,
            ExpKind::Binop { op: Binop::Mul, .. }
        ));
    }

    #[test]
    fn concat_is_flattened() {
        let program = parse(r#"local s: string = "a" .. "b" .. "c""#);
        let ToplevelKind::Var(var) = &program.toplevels[0].kind else {
            panic!("expected var")
        };
        let ExpKind::Concat(parts) = &var.value.kind else {
            panic!("expected concat")
        };
        assert_eq!(parts.len(), 3);
    }

    #[test]
    fn cast_binds_tightest() {
        let program = parse("local r: float = x as float + 1.0");
        let ToplevelKind::Var(var) = &program.toplevels[0].kind else {
            panic!("expected var")
        };
        let ExpKind::Binop { op, lhs, .. } = &var.value.kind else {
            panic!("expected binop")
        };
        assert_eq!(*op, Binop::Add);
        assert!(matches!(lhs.kind, ExpKind::Cast { .. }));
    }

    #[test]
    fn cast_strip_span_covers_as_and_type() {
        let source = "local x: integer = y as integer";
        let program = parse(source);
        let ToplevelKind::Var(var) = &program.toplevels[0].kind else {
            panic!("expected var")
        };
        let ExpKind::Cast { strip_span, .. } = &var.value.kind else {
            panic!("expected cast")
        };
        assert_eq!(&source[strip_span.as_range()], "as integer");
    }

    #[test]
    fn parse_record_declaration() {
        let program = parse("record Point x: float y: float end");
        let ToplevelKind::Record(rec) = &program.toplevels[0].kind else {
            panic!("expected record")
        };
        assert_eq!(rec.name.name, "Point");
        assert_eq!(rec.fields.len(), 2);
        // The toplevel span covers keyword through `end`
        assert_eq!(program.toplevels[0].span, Span::new(0, 34));
    }

    #[test]
    fn parse_typealias() {
        let program = parse("typealias Ints = {integer}");
        let ToplevelKind::Typealias(alias) = &program.toplevels[0].kind else {
            panic!("expected typealias")
        };
        assert_eq!(alias.name.name, "Ints");
        assert!(matches!(alias.annotation.kind, TypeKind::Array(_)));
    }

    #[test]
    fn parse_import() {
        let program = parse(r#"local m = import("foo")"#);
        let ToplevelKind::Import(imp) = &program.toplevels[0].kind else {
            panic!("expected import")
        };
        assert_eq!(imp.name.name, "m");
        assert_eq!(imp.module, "foo");
    }

    #[test]
    fn return_must_close_block() {
        let errors = parse_err("function f(): integer return 1 local x = 2 end");
        assert!(errors.iter().any(|e| e.kind == ParseErrorKind::ReturnNotLast));
    }

    #[test]
    fn parse_elseif_chain() {
        let program = parse(
            "function f(x: integer): integer\n\
             if x == 1 then return 1\n\
             elseif x == 2 then return 2\n\
             else return 3 end\n\
             end",
        );
        let func = first_func(&program);
        let StatKind::If { else_branch, .. } = &func.body.block.stats[0].kind else {
            panic!("expected if")
        };
        assert!(matches!(else_branch, Some(ElseBranch::Elseif(_))));
    }

    #[test]
    fn parse_method_call_statement() {
        let program = parse("function f(o: any) o:m(1, 2) end");
        let func = first_func(&program);
        assert!(matches!(
            func.body.block.stats[0].kind,
            StatKind::Call(Exp {
                kind: ExpKind::CallMethod { .. },
                ..
            })
        ));
    }

    #[test]
    fn parse_tuple_return_annotation_strip_span() {
        let source = "function f(): (integer, float) return 1, 2.0 end";
        let program = parse(source);
        let func = first_func(&program);
        let strip = func.body.ret_strip_span.unwrap();
        assert_eq!(&source[strip.as_range()], ": (integer, float)");
        assert_eq!(func.body.ret_annotations.len(), 2);
    }

    #[test]
    fn errors_come_out_in_source_order() {
        let errors = parse_err("record R x integer end\nfunction f() break end");
        assert!(errors.len() >= 2);
        for pair in errors.windows(2) {
            assert!(pair[0].span.start <= pair[1].span.start);
        }
    }
}
