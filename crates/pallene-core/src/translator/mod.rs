//! Source-to-source translator
//!
//! Consumes the original byte buffer plus the parsed (and checked) tree
//! and produces pure host-language source. The contract is byte-exact:
//! every byte outside a stripped span is copied through at the same
//! offset, and every stripped byte becomes a space — except `\n`, `\r`
//! and `\t`, which map to themselves so line geometry survives.
//!
//! Stripped spans are the `: type` annotations of parameters, locals and
//! returns (including parentheses around tuple return types), `as T`
//! casts, and entire `typealias` and `record` declarations. The `export`
//! keyword is rewritten to `local ` (same byte length). Comments inside
//! stripped spans keep their original bytes.
//!
//! The translator never fails: it is only invoked on programs that
//! parsed and type-checked successfully.

use crate::ast::{
    Block, ElseBranch, Exp, ExpKind, FuncBody, InitEntry, Program, Stat, StatKind, Toplevel,
    ToplevelKind, VarKind, VarNode, Visibility,
};
use crate::lexer::Span;

/// Translate a Pallene source buffer into host-language source
#[must_use]
pub fn translate(source: &str, program: &Program) -> String {
    let mut collector = Collector::default();
    for tl in &program.toplevels {
        collector.toplevel(tl);
    }

    let mut out = source.as_bytes().to_vec();
    for span in &collector.strips {
        blank(&mut out, *span, &program.comments);
    }
    for span in &collector.rewrites {
        out[span.as_range()].copy_from_slice(b"local ");
    }

    if !collector.exports.is_empty() {
        if out.last() != Some(&b'\n') {
            out.push(b'\n');
        }
        out.extend_from_slice(b"return {\n");
        for name in &collector.exports {
            out.extend_from_slice(format!("    {name} = {name},\n").as_bytes());
        }
        out.extend_from_slice(b"}\n");
    }

    // The buffer started as valid UTF-8 and we only wrote ASCII into it
    String::from_utf8(out).expect("translated buffer is UTF-8")
}

/// Blank a span: keep `\n`/`\r`/`\t` and comment bytes, space the rest
fn blank(out: &mut [u8], span: Span, comments: &[Span]) {
    for pos in span.as_range() {
        let byte = out[pos];
        if byte == b'\n' || byte == b'\r' || byte == b'\t' {
            continue;
        }
        let in_comment = comments
            .iter()
            .any(|c| (c.start as usize) <= pos && pos < c.end as usize);
        if !in_comment {
            out[pos] = b' ';
        }
    }
}

/// Walks the tree collecting spans to strip and rewrite
#[derive(Default)]
struct Collector {
    strips: Vec<Span>,
    rewrites: Vec<Span>,
    exports: Vec<String>,
}

impl Collector {
    fn strip(&mut self, span: Option<Span>) {
        if let Some(span) = span {
            if !span.is_dummy() {
                self.strips.push(span);
            }
        }
    }

    fn export_keyword(&mut self, span: Span) {
        // A bare `function` is public too, but has no keyword to rewrite
        if !span.is_dummy() {
            self.rewrites.push(span);
        }
    }

    fn toplevel(&mut self, tl: &Toplevel) {
        match &tl.kind {
            ToplevelKind::Func(func) => {
                if func.visibility == Visibility::Export {
                    self.exports.push(func.name.name.clone());
                    self.export_keyword(func.vis_span);
                }
                self.func_body(&func.body);
            }
            ToplevelKind::Var(var) => {
                if var.visibility == Visibility::Export {
                    self.exports.push(var.name.name.clone());
                    self.export_keyword(var.vis_span);
                }
                self.strip(var.strip_span);
                self.exp(&var.value);
            }
            // Whole declarations vanish
            ToplevelKind::Typealias(_) | ToplevelKind::Record(_) => {
                self.strips.push(tl.span);
            }
            ToplevelKind::Import(_) => {}
        }
    }

    fn func_body(&mut self, body: &FuncBody) {
        for param in &body.params {
            self.strip(param.strip_span);
        }
        self.strip(body.ret_strip_span);
        self.block(&body.block);
    }

    fn block(&mut self, block: &Block) {
        for stat in &block.stats {
            self.stat(stat);
        }
    }

    fn stat(&mut self, stat: &Stat) {
        match &stat.kind {
            StatKind::Block(block) => self.block(block),
            StatKind::Assign { target, value } => {
                self.var(target);
                self.exp(value);
            }
            StatKind::Decl { decl, value } => {
                self.strip(decl.strip_span);
                if let Some(value) = value {
                    self.exp(value);
                }
            }
            StatKind::If {
                condition,
                then_block,
                else_branch,
            } => {
                self.exp(condition);
                self.block(then_block);
                match else_branch {
                    Some(ElseBranch::Else(block)) => self.block(block),
                    Some(ElseBranch::Elseif(stat)) => self.stat(stat),
                    None => {}
                }
            }
            StatKind::While { condition, body } => {
                self.exp(condition);
                self.block(body);
            }
            StatKind::Repeat { body, condition } => {
                self.block(body);
                self.exp(condition);
            }
            StatKind::For {
                decl,
                start,
                limit,
                step,
                body,
            } => {
                self.strip(decl.strip_span);
                self.exp(start);
                self.exp(limit);
                if let Some(step) = step {
                    self.exp(step);
                }
                self.block(body);
            }
            StatKind::Break => {}
            StatKind::Return { values } => {
                for value in values {
                    self.exp(value);
                }
            }
            StatKind::Call(exp) => self.exp(exp),
        }
    }

    fn exp(&mut self, exp: &Exp) {
        match &exp.kind {
            ExpKind::Nil
            | ExpKind::Bool(_)
            | ExpKind::Integer(_)
            | ExpKind::Float(_)
            | ExpKind::String(_) => {}
            ExpKind::Lambda(body) => self.func_body(body),
            ExpKind::Initlist(entries) => {
                for entry in entries {
                    match entry {
                        InitEntry::Positional(exp) => self.exp(exp),
                        InitEntry::Named { value, .. } => self.exp(value),
                    }
                }
            }
            ExpKind::Cast {
                exp: inner,
                strip_span,
                ..
            } => {
                // Synthesized casts carry a dummy span; nothing to strip
                self.strip(Some(*strip_span));
                self.exp(inner);
            }
            ExpKind::Unop { exp: inner, .. } => self.exp(inner),
            ExpKind::Binop { lhs, rhs, .. } => {
                self.exp(lhs);
                self.exp(rhs);
            }
            ExpKind::Concat(parts) => {
                for part in parts {
                    self.exp(part);
                }
            }
            ExpKind::CallFunc { callee, args } => {
                self.exp(callee);
                for arg in args {
                    self.exp(arg);
                }
            }
            ExpKind::CallMethod { receiver, args, .. } => {
                self.exp(receiver);
                for arg in args {
                    self.exp(arg);
                }
            }
            ExpKind::Var(var) => self.var(var),
            ExpKind::Paren(inner) => self.exp(inner),
        }
    }

    fn var(&mut self, var: &VarNode) {
        match &var.kind {
            VarKind::Name(_) => {}
            VarKind::Bracket { prefix, index } => {
                self.exp(prefix);
                self.exp(index);
            }
            VarKind::Dot { prefix, .. } => self.exp(prefix),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::Parser;

    fn run(source: &str) -> String {
        let program = Parser::parse_program(source).expect("program should parse");
        translate(source, &program)
    }

    #[test]
    fn local_annotation_becomes_spaces() {
        assert_eq!(run("local xs: integer = 10\n"), "local xs          = 10\n");
    }

    #[test]
    fn unstripped_bytes_keep_their_positions() {
        let source = "local xs: integer = 10\n";
        let output = run(source);
        assert_eq!(output.len(), source.len());
        for (i, (a, b)) in source.bytes().zip(output.bytes()).enumerate() {
            // Everything outside the annotation is identical
            if !(8..17).contains(&i) {
                assert_eq!(a, b, "byte {i} changed");
            }
        }
    }

    #[test]
    fn export_rewrites_to_local_and_synthesizes_return() {
        let output = run("export function f() end\n");
        assert!(output.contains("local  function f() end"));
        assert!(output.contains("return {\n    f = f,\n}\n"));
    }

    #[test]
    fn bare_function_is_exported_without_rewrite() {
        let output = run("function f() end\n");
        assert!(output.starts_with("function f() end"));
        assert!(output.contains("return {\n    f = f,\n}\n"));
    }

    #[test]
    fn no_exports_appends_nothing() {
        let source = "local function f() end\n";
        assert_eq!(run(source), source);
    }

    #[test]
    fn exports_keep_declaration_order() {
        let output = run("export function b() end\nexport function a() end\n");
        let b = output.find("    b = b,").unwrap();
        let a = output.find("    a = a,").unwrap();
        assert!(b < a);
    }

    #[test]
    fn param_and_return_annotations_strip() {
        let output = run("local function f(x: integer, y: float): integer return x end\n");
        assert_eq!(
            output,
            "local function f(x         , y       )          return x end\n"
        );
    }

    #[test]
    fn cast_strips_keyword_and_type() {
        let output = run("local function f(x: any)\nlocal y = x as integer\nend\n");
        assert!(output.contains("local y = x           \n"));
    }

    #[test]
    fn record_declaration_vanishes_preserving_lines() {
        let source = "record Point\n    x: float\n    y: float\nend\nlocal function f() end\n";
        let output = run(source);
        let expected = "            \n            \n            \n   \nlocal function f() end\n";
        assert_eq!(output, expected);
    }

    #[test]
    fn typealias_vanishes() {
        let source = "typealias Ints = {integer}\nlocal function f() end\n";
        let output = run(source);
        let blank = " ".repeat("typealias Ints = {integer}".len());
        assert_eq!(output, format!("{blank}\nlocal function f() end\n"));
    }

    #[test]
    fn tabs_and_newlines_survive_inside_strips() {
        let source = "local xs:\tinteger = 10\n";
        let output = run(source);
        assert_eq!(output, "local xs \t        = 10\n");
        assert_eq!(output.len(), source.len());
    }

    #[test]
    fn comment_inside_record_is_preserved() {
        let source = "record Point\n    -- position\n    x: float\nend\n";
        let output = run(source);
        assert!(output.contains("-- position"));
        assert!(!output.contains("record"));
        assert!(!output.contains("float"));
    }

    #[test]
    fn translation_is_a_fixed_point_on_its_own_output() {
        // The output has no types left to strip, so translating it again
        // changes nothing
        let source = "local xs: integer = 10\nlocal function f(x)\nlocal y = x\nend\n";
        let once = run(source);
        let twice = run(&once);
        assert_eq!(once, twice);
    }
}
