//! Uninitialized-variable analysis
//!
//! A forward dataflow pass over the structured command tree. For each
//! command we track the set of locals known to be initialized on every
//! path reaching it. Parameters start initialized; a local declared
//! without an initializer stays undefined until its first assignment.
//! Branch joins intersect the two sets; loops iterate to a fixed point
//! before a final reporting pass. The pass stops at the first error.

use thiserror::Error;

use crate::lexer::Span;

use super::super::{Cmd, Function, Module, Value};

/// A read of a possibly-uninitialized local
#[derive(Error, Debug, Clone, PartialEq)]
#[error("variable '{local}' may be used uninitialized")]
pub struct UninitError {
    /// Function the read occurs in
    pub function: String,
    /// The local's declared name
    pub local: String,
    /// The local's declaration site
    pub span: Span,
}

/// Check every function of the module
///
/// # Errors
///
/// Returns the first possibly-uninitialized read found.
pub fn check_module(module: &Module) -> Result<(), UninitError> {
    for function in &module.functions {
        check_function(function)?;
    }
    Ok(())
}

fn check_function(function: &Function) -> Result<(), UninitError> {
    let mut state = vec![false; function.locals.len()];
    for slot in state.iter_mut().take(function.param_count) {
        *slot = true;
    }
    let mut analyzer = Analyzer {
        function,
        break_states: Vec::new(),
    };
    analyzer.check_cmds(&function.body, &mut state, true)?;
    Ok(())
}

/// Whether control continues past a command sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continues,
    Diverges,
}

struct Analyzer<'f> {
    function: &'f Function,
    /// One entry per enclosing loop: the intersection of states observed
    /// at its `Break` commands, if any
    break_states: Vec<Option<Vec<bool>>>,
}

impl Analyzer<'_> {
    fn error(&self, local: usize) -> UninitError {
        let decl = &self.function.locals[local];
        UninitError {
            function: self.function.name.clone(),
            local: decl.name.clone(),
            span: decl.span,
        }
    }

    fn check_read(&self, value: &Value, state: &[bool], report: bool) -> Result<(), UninitError> {
        if let Value::Local(local) = value {
            if report && !state[*local] {
                return Err(self.error(*local));
            }
        }
        Ok(())
    }

    fn check_reads<'v>(
        &self,
        values: impl IntoIterator<Item = &'v Value>,
        state: &[bool],
        report: bool,
    ) -> Result<(), UninitError> {
        for value in values {
            self.check_read(value, state, report)?;
        }
        Ok(())
    }

    /// Analyze a command list. When `report` is false this only computes
    /// the transfer function, which the loop fixed point relies on.
    fn check_cmds(
        &mut self,
        cmds: &[Cmd],
        state: &mut Vec<bool>,
        report: bool,
    ) -> Result<Flow, UninitError> {
        for cmd in cmds {
            match cmd {
                Cmd::If {
                    cond,
                    then_cmds,
                    else_cmds,
                } => {
                    self.check_read(cond, state, report)?;
                    let mut then_state = state.clone();
                    let mut else_state = state.clone();
                    let then_flow = self.check_cmds(then_cmds, &mut then_state, report)?;
                    let else_flow = self.check_cmds(else_cmds, &mut else_state, report)?;
                    match (then_flow, else_flow) {
                        (Flow::Continues, Flow::Continues) => {
                            intersect(&mut then_state, &else_state);
                            *state = then_state;
                        }
                        (Flow::Continues, Flow::Diverges) => *state = then_state,
                        (Flow::Diverges, Flow::Continues) => *state = else_state,
                        (Flow::Diverges, Flow::Diverges) => return Ok(Flow::Diverges),
                    }
                }

                Cmd::Loop { body } => {
                    let entry = state.clone();
                    let stable = self.loop_fixed_point(body, &entry, &[])?;
                    self.break_states.push(None);
                    let mut body_state = stable;
                    self.check_cmds(body, &mut body_state, report)?;
                    let breaks = self.break_states.pop().expect("pushed above");
                    match breaks {
                        Some(break_state) => *state = break_state,
                        // Without a break the loop only exits by returning
                        None => return Ok(Flow::Diverges),
                    }
                }

                Cmd::ForNumInt {
                    var,
                    start,
                    limit,
                    step,
                    body,
                }
                | Cmd::ForNumFloat {
                    var,
                    start,
                    limit,
                    step,
                    body,
                } => {
                    self.check_reads([start, limit, step], state, report)?;
                    let mut entry = state.clone();
                    entry[*var] = true;
                    let stable = self.loop_fixed_point(body, &entry, &[*var])?;
                    self.break_states.push(None);
                    let mut body_state = stable;
                    self.check_cmds(body, &mut body_state, report)?;
                    let breaks = self.break_states.pop().expect("pushed above");
                    // The body may run zero times
                    if let Some(break_state) = breaks {
                        intersect(state, &break_state);
                    }
                }

                Cmd::Break => {
                    let slot = self
                        .break_states
                        .last_mut()
                        .expect("break only occurs inside loops");
                    match slot {
                        Some(acc) => intersect(acc, state),
                        None => *slot = Some(state.clone()),
                    }
                    return Ok(Flow::Diverges);
                }

                Cmd::Return { values } => {
                    self.check_reads(values, state, report)?;
                    return Ok(Flow::Diverges);
                }

                _ => {
                    self.check_reads(straight_line_reads(cmd), state, report)?;
                    if let Some(dst) = cmd.dst() {
                        state[dst] = true;
                    }
                }
            }
        }
        Ok(Flow::Continues)
    }

    /// Iterate a loop body's transfer function until the entry state is
    /// stable: entry(n+1) = entry(0) ∩ exit(n)
    fn loop_fixed_point(
        &mut self,
        body: &[Cmd],
        entry: &[bool],
        always_set: &[usize],
    ) -> Result<Vec<bool>, UninitError> {
        let mut current = entry.to_vec();
        loop {
            self.break_states.push(None);
            let mut exit = current.clone();
            self.check_cmds(body, &mut exit, false)?;
            self.break_states.pop();

            let mut next = entry.to_vec();
            intersect(&mut next, &exit);
            for &local in always_set {
                next[local] = true;
            }
            if next == current {
                return Ok(current);
            }
            current = next;
        }
    }
}

fn intersect(into: &mut [bool], other: &[bool]) {
    for (a, b) in into.iter_mut().zip(other) {
        *a = *a && *b;
    }
}

/// Values read by a straight-line command
fn straight_line_reads(cmd: &Cmd) -> Vec<&Value> {
    match cmd {
        Cmd::Move { src, .. }
        | Cmd::Unop { src, .. }
        | Cmd::Convert { src, .. }
        | Cmd::SetGlobal { src, .. } => vec![src],
        Cmd::Binop { lhs, rhs, .. } => vec![lhs, rhs],
        Cmd::Concat { srcs, .. } => srcs.iter().collect(),
        Cmd::SetArr {
            arr, index, src, ..
        } => vec![arr, index, src],
        Cmd::GetArr { arr, index, .. } => vec![arr, index],
        Cmd::SetField { obj, src, .. } => vec![obj, src],
        Cmd::GetField { obj, .. } => vec![obj],
        Cmd::CallStatic { args, .. } => args.iter().collect(),
        Cmd::CallDyn { func, args, .. } => std::iter::once(func).chain(args).collect(),
        Cmd::CallMethod { obj, args, .. } => std::iter::once(obj).chain(args).collect(),
        Cmd::NewArray { .. }
        | Cmd::NewRecord { .. }
        | Cmd::NewTable { .. }
        | Cmd::GetGlobal { .. }
        | Cmd::LoadFunction { .. }
        | Cmd::Import { .. } => Vec::new(),
        Cmd::If { .. }
        | Cmd::Loop { .. }
        | Cmd::ForNumInt { .. }
        | Cmd::ForNumFloat { .. }
        | Cmd::Break
        | Cmd::Return { .. } => unreachable!("handled by the structured walk"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::lower_program;
    use crate::lexer::LineIndex;
    use crate::parser::Parser;
    use crate::types::TypeChecker;

    fn analyze(source: &str) -> Result<(), UninitError> {
        let mut program = Parser::parse_program(source).expect("parse");
        let check = TypeChecker::check_program(&mut program);
        assert!(check.is_ok(), "type errors: {:?}", check.errors);
        let index = LineIndex::new(source);
        let module = lower_program(&program, &check, &index);
        check_module(&module)
    }

    #[test]
    fn read_before_any_write_is_rejected() {
        let err = analyze(
            "function f(): integer\n\
             local x: integer\n\
             return x\n\
             end",
        )
        .unwrap_err();
        assert_eq!(err.local, "x");
        assert_eq!(err.function, "f");
    }

    #[test]
    fn parameters_start_initialized() {
        analyze("function f(x: integer): integer return x end").unwrap();
    }

    #[test]
    fn initializer_counts_as_definition() {
        analyze(
            "function f(): integer\n\
             local x: integer = 1\n\
             return x\n\
             end",
        )
        .unwrap();
    }

    #[test]
    fn branch_join_intersects_definitions() {
        let err = analyze(
            "function f(c: boolean): integer\n\
             local x: integer\n\
             if c then x = 1 end\n\
             return x\n\
             end",
        )
        .unwrap_err();
        assert_eq!(err.local, "x");
    }

    #[test]
    fn definition_on_both_branches_is_fine() {
        analyze(
            "function f(c: boolean): integer\n\
             local x: integer\n\
             if c then x = 1 else x = 2 end\n\
             return x\n\
             end",
        )
        .unwrap();
    }

    #[test]
    fn assignment_inside_while_may_not_run() {
        let err = analyze(
            "function f(c: boolean): integer\n\
             local x: integer\n\
             while c do x = 1 end\n\
             return x\n\
             end",
        )
        .unwrap_err();
        assert_eq!(err.local, "x");
    }

    #[test]
    fn repeat_body_always_runs() {
        analyze(
            "function f(): integer\n\
             local x: integer\n\
             repeat x = 1 until true\n\
             return x\n\
             end",
        )
        .unwrap();
    }

    #[test]
    fn repeat_condition_sees_body_definitions() {
        analyze(
            "function f()\n\
             local x: boolean\n\
             repeat x = true until x\n\
             end",
        )
        .unwrap();
    }

    #[test]
    fn for_body_definitions_do_not_escape() {
        let err = analyze(
            "function f(n: integer): integer\n\
             local x: integer\n\
             for i = 1, n do x = i end\n\
             return x\n\
             end",
        )
        .unwrap_err();
        assert_eq!(err.local, "x");
    }

    #[test]
    fn loop_carried_initialization_reaches_fixed_point() {
        // x is set on every path before the loop's second iteration read
        analyze(
            "function f(n: integer): integer\n\
             local x: integer = 0\n\
             for i = 1, n do x = x + i end\n\
             return x\n\
             end",
        )
        .unwrap();
    }

    #[test]
    fn definition_before_break_escapes_the_loop() {
        analyze(
            "function f(): integer\n\
             local x: integer\n\
             repeat\n\
             x = 1\n\
             break\n\
             until false\n\
             return x\n\
             end",
        )
        .unwrap();
    }

    #[test]
    fn while_condition_exit_path_is_conservative() {
        // The exit through the condition test does not see the body's
        // definitions, even when the condition is literally true
        let err = analyze(
            "function f(): integer\n\
             local x: integer\n\
             while true do x = 1 break end\n\
             return x\n\
             end",
        )
        .unwrap_err();
        assert_eq!(err.local, "x");
    }
}
