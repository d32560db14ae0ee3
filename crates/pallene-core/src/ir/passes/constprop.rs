//! Constant propagation and folding
//!
//! A single program-order walk per function. A local qualifies when it is
//! assigned exactly once, by a literal or by an operation whose operands
//! are already known constants. Reads of qualifying locals are replaced by
//! the literal and the defining command is removed.
//!
//! Folding reproduces the host runtime's arithmetic exactly: 64-bit
//! integers wrap around, `//` and `%` use floor semantics, shifts are
//! defined for any distance, and division or modulo by integer zero is
//! never folded — it stays a runtime operation. The pass is idempotent:
//! a second run finds nothing left to propagate.

use std::collections::HashMap;

use crate::ast::{Binop, Unop};
use crate::types::Type;

use super::super::{Cmd, ConvertKind, Function, LocalId, Module, Value};

/// Run constant propagation over every function of the module
pub fn run(module: &mut Module) {
    for function in &mut module.functions {
        run_function(function);
    }
}

fn run_function(function: &mut Function) {
    let mut counts = vec![0usize; function.locals.len()];
    // Parameters are assigned at entry
    for count in counts.iter_mut().take(function.param_count) {
        *count += 1;
    }
    count_assignments(&function.body, &mut counts);

    let mut consts: HashMap<LocalId, Value> = HashMap::new();
    collect_consts(&function.body, &counts, &mut consts);
    if consts.is_empty() {
        return;
    }
    substitute(&mut function.body, &consts);
}

fn count_assignments(cmds: &[Cmd], counts: &mut [usize]) {
    for cmd in cmds {
        if let Some(dst) = cmd.dst() {
            counts[dst] += 1;
        }
        match cmd {
            Cmd::If {
                then_cmds,
                else_cmds,
                ..
            } => {
                count_assignments(then_cmds, counts);
                count_assignments(else_cmds, counts);
            }
            Cmd::Loop { body } => count_assignments(body, counts),
            Cmd::ForNumInt { var, body, .. } | Cmd::ForNumFloat { var, body, .. } => {
                counts[*var] += 1;
                count_assignments(body, counts);
            }
            Cmd::CallStatic { dsts, .. } => {
                for dst in dsts {
                    counts[*dst] += 1;
                }
            }
            _ => {}
        }
    }
}

/// Resolve a value to a literal, through already-known constants
fn resolve(value: &Value, consts: &HashMap<LocalId, Value>) -> Option<Value> {
    match value {
        Value::Local(id) => consts.get(id).cloned(),
        literal => Some(literal.clone()),
    }
}

/// Walk in program order, recording every single-assignment local bound
/// to a foldable constant
fn collect_consts(cmds: &[Cmd], counts: &[usize], consts: &mut HashMap<LocalId, Value>) {
    for cmd in cmds {
        match cmd {
            Cmd::Move { dst, src } if counts[*dst] == 1 => {
                if let Some(value) = resolve(src, consts) {
                    consts.insert(*dst, value);
                }
            }
            Cmd::Unop {
                dst,
                op,
                operand_ty,
                src,
            } if counts[*dst] == 1 => {
                if let Some(src) = resolve(src, consts) {
                    if let Some(value) = fold_unop(*op, operand_ty, &src) {
                        consts.insert(*dst, value);
                    }
                }
            }
            Cmd::Binop {
                dst,
                op,
                operand_ty,
                lhs,
                rhs,
                ..
            } if counts[*dst] == 1 => {
                if let (Some(lhs), Some(rhs)) = (resolve(lhs, consts), resolve(rhs, consts)) {
                    if let Some(value) = fold_binop(*op, operand_ty, &lhs, &rhs) {
                        consts.insert(*dst, value);
                    }
                }
            }
            Cmd::Convert {
                dst, kind, src, ..
            } if counts[*dst] == 1 => {
                if let Some(src) = resolve(src, consts) {
                    if let Some(value) = fold_convert(kind, &src) {
                        consts.insert(*dst, value);
                    }
                }
            }
            Cmd::If {
                then_cmds,
                else_cmds,
                ..
            } => {
                collect_consts(then_cmds, counts, consts);
                collect_consts(else_cmds, counts, consts);
            }
            Cmd::Loop { body }
            | Cmd::ForNumInt { body, .. }
            | Cmd::ForNumFloat { body, .. } => {
                collect_consts(body, counts, consts);
            }
            _ => {}
        }
    }
}

/// Replace reads of constant locals and drop their defining commands
fn substitute(cmds: &mut Vec<Cmd>, consts: &HashMap<LocalId, Value>) {
    cmds.retain(|cmd| match cmd {
        Cmd::Move { dst, .. }
        | Cmd::Unop { dst, .. }
        | Cmd::Binop { dst, .. }
        | Cmd::Convert { dst, .. } => !consts.contains_key(dst),
        _ => true,
    });
    for cmd in cmds {
        for value in cmd_values_mut(cmd) {
            if let Value::Local(id) = value {
                if let Some(literal) = consts.get(id) {
                    *value = literal.clone();
                }
            }
        }
        match cmd {
            Cmd::If {
                then_cmds,
                else_cmds,
                ..
            } => {
                substitute(then_cmds, consts);
                substitute(else_cmds, consts);
            }
            Cmd::Loop { body }
            | Cmd::ForNumInt { body, .. }
            | Cmd::ForNumFloat { body, .. } => substitute(body, consts),
            _ => {}
        }
    }
}

/// Every value slot a command reads
fn cmd_values_mut(cmd: &mut Cmd) -> Vec<&mut Value> {
    match cmd {
        Cmd::Move { src, .. }
        | Cmd::Unop { src, .. }
        | Cmd::Convert { src, .. }
        | Cmd::SetGlobal { src, .. } => vec![src],
        Cmd::Binop { lhs, rhs, .. } => vec![lhs, rhs],
        Cmd::Concat { srcs, .. } => srcs.iter_mut().collect(),
        Cmd::SetArr {
            arr, index, src, ..
        } => vec![arr, index, src],
        Cmd::GetArr { arr, index, .. } => vec![arr, index],
        Cmd::SetField { obj, src, .. } => vec![obj, src],
        Cmd::GetField { obj, .. } => vec![obj],
        Cmd::CallStatic { args, .. } => args.iter_mut().collect(),
        Cmd::CallDyn { func, args, .. } => std::iter::once(func).chain(args).collect(),
        Cmd::CallMethod { obj, args, .. } => std::iter::once(obj).chain(args).collect(),
        Cmd::If { cond, .. } => vec![cond],
        Cmd::ForNumInt {
            start, limit, step, ..
        }
        | Cmd::ForNumFloat {
            start, limit, step, ..
        } => vec![start, limit, step],
        Cmd::Return { values } => values.iter_mut().collect(),
        Cmd::NewArray { .. }
        | Cmd::NewRecord { .. }
        | Cmd::NewTable { .. }
        | Cmd::GetGlobal { .. }
        | Cmd::LoadFunction { .. }
        | Cmd::Import { .. }
        | Cmd::Loop { .. }
        | Cmd::Break => Vec::new(),
    }
}

// ==================== Folding ====================

fn fold_unop(op: Unop, operand_ty: &Type, src: &Value) -> Option<Value> {
    match (op, src) {
        (Unop::Neg, Value::Integer(i)) => Some(Value::Integer(i.wrapping_neg())),
        (Unop::Neg, Value::Float(f)) => Some(Value::Float(-f)),
        (Unop::BNot, Value::Integer(i)) => Some(Value::Integer(!i)),
        (Unop::Not, Value::Bool(b)) => Some(Value::Bool(!b)),
        (Unop::Len, Value::String(s)) if *operand_ty == Type::String => {
            Some(Value::Integer(s.len() as i64))
        }
        _ => None,
    }
}

fn fold_binop(op: Binop, operand_ty: &Type, lhs: &Value, rhs: &Value) -> Option<Value> {
    match (lhs, rhs) {
        (Value::Integer(a), Value::Integer(b)) => fold_int_binop(op, *a, *b),
        (Value::Float(a), Value::Float(b)) => fold_float_binop(op, *a, *b),
        (Value::String(a), Value::String(b)) if *operand_ty == Type::String => {
            fold_ord(op, a.cmp(b))
        }
        (Value::Bool(a), Value::Bool(b)) => match op {
            Binop::Eq => Some(Value::Bool(a == b)),
            Binop::Ne => Some(Value::Bool(a != b)),
            _ => None,
        },
        _ => None,
    }
}

fn fold_int_binop(op: Binop, a: i64, b: i64) -> Option<Value> {
    let value = match op {
        // Integer arithmetic wraps, exactly like the host runtime
        Binop::Add => Value::Integer(a.wrapping_add(b)),
        Binop::Sub => Value::Integer(a.wrapping_sub(b)),
        Binop::Mul => Value::Integer(a.wrapping_mul(b)),
        // Division by zero traps at run time; it must not fold
        Binop::IntDiv if b == 0 => return None,
        Binop::IntDiv => Value::Integer(lua_ifloordiv(a, b)),
        Binop::Mod if b == 0 => return None,
        Binop::Mod => Value::Integer(lua_imod(a, b)),
        Binop::BAnd => Value::Integer(a & b),
        Binop::BOr => Value::Integer(a | b),
        Binop::BXor => Value::Integer(a ^ b),
        Binop::Shl => Value::Integer(lua_shift(a, b)),
        Binop::Shr => Value::Integer(lua_shift(a, b.wrapping_neg())),
        Binop::Eq => Value::Bool(a == b),
        Binop::Ne => Value::Bool(a != b),
        Binop::Lt => Value::Bool(a < b),
        Binop::Le => Value::Bool(a <= b),
        Binop::Gt => Value::Bool(a > b),
        Binop::Ge => Value::Bool(a >= b),
        _ => return None,
    };
    Some(value)
}

fn fold_float_binop(op: Binop, a: f64, b: f64) -> Option<Value> {
    let value = match op {
        Binop::Add => Value::Float(a + b),
        Binop::Sub => Value::Float(a - b),
        Binop::Mul => Value::Float(a * b),
        Binop::Div => Value::Float(a / b),
        Binop::IntDiv => Value::Float((a / b).floor()),
        Binop::Mod => Value::Float(lua_fmod(a, b)),
        Binop::Pow => Value::Float(a.powf(b)),
        Binop::Eq => Value::Bool(a == b),
        Binop::Ne => Value::Bool(a != b),
        Binop::Lt => Value::Bool(a < b),
        Binop::Le => Value::Bool(a <= b),
        Binop::Gt => Value::Bool(a > b),
        Binop::Ge => Value::Bool(a >= b),
        _ => return None,
    };
    Some(value)
}

fn fold_convert(kind: &ConvertKind, src: &Value) -> Option<Value> {
    match (kind, src) {
        (ConvertKind::IntToFloat, Value::Integer(i)) => Some(Value::Float(*i as f64)),
        // Only exact conversions fold; the rest trap at run time
        (ConvertKind::FloatToInt, Value::Float(f)) => {
            if f.fract() == 0.0 && *f >= -(2f64.powi(63)) && *f < 2f64.powi(63) {
                Some(Value::Integer(*f as i64))
            } else {
                None
            }
        }
        _ => None,
    }
}

fn fold_ord(op: Binop, ord: std::cmp::Ordering) -> Option<Value> {
    let value = match op {
        Binop::Eq => ord.is_eq(),
        Binop::Ne => ord.is_ne(),
        Binop::Lt => ord.is_lt(),
        Binop::Le => ord.is_le(),
        Binop::Gt => ord.is_gt(),
        Binop::Ge => ord.is_ge(),
        _ => return None,
    };
    Some(Value::Bool(value))
}

/// Floor division with the host's wrap-around on overflow
fn lua_ifloordiv(a: i64, b: i64) -> i64 {
    let mut q = a.wrapping_div(b);
    if (a ^ b) < 0 && q.wrapping_mul(b) != a {
        q -= 1;
    }
    q
}

/// Floor modulo; the result takes the divisor's sign
fn lua_imod(a: i64, b: i64) -> i64 {
    let mut r = a.wrapping_rem(b);
    if r != 0 && (r ^ b) < 0 {
        r = r.wrapping_add(b);
    }
    r
}

/// Host shift semantics: any distance is defined, over-wide shifts are 0,
/// negative distances shift the other way
fn lua_shift(a: i64, b: i64) -> i64 {
    if b <= -64 || b >= 64 {
        0
    } else if b >= 0 {
        ((a as u64) << b) as i64
    } else {
        ((a as u64) >> -b) as i64
    }
}

fn lua_fmod(a: f64, b: f64) -> f64 {
    let r = a % b;
    if r != 0.0 && (r < 0.0) != (b < 0.0) {
        r + b
    } else {
        r
    }
}
