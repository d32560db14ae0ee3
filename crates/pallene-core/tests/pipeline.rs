//! Cross-stage tests driving source text through the whole front end:
//! parse, check, lower, analyze, and then either emit C or translate.
//! The scenarios that need to observe real execution run on a small
//! evaluator over the IR, which is exactly what the generated C encodes.

use pallene_core::driver::{compile_source_to_ir, front_end, DriverError};
use pallene_core::ir::passes::PassConfig;
use pallene_core::ir::{Cmd, ConvertKind, Function, Module, Value};
use pallene_core::lexer::LineIndex;
use pallene_core::{codegen, translate};

fn ir(source: &str) -> Module {
    compile_source_to_ir("test.pln", source, &PassConfig::all()).expect("pipeline should succeed")
}

fn emit(source: &str) -> String {
    let module = ir(source);
    let index = LineIndex::new(source);
    codegen::emit_c(&module, "test", &index)
}

// ==================== A tiny IR evaluator ====================

/// Runtime value for the evaluator; mirrors the host's scalar types
#[derive(Debug, Clone, PartialEq)]
enum V {
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

fn to_v(value: &Value, locals: &[V]) -> V {
    match value {
        Value::Local(l) => locals[*l].clone(),
        Value::Nil => V::Nil,
        Value::Bool(b) => V::Bool(*b),
        Value::Integer(i) => V::Int(*i),
        Value::Float(f) => V::Float(*f),
        Value::String(s) => V::Str(s.clone()),
    }
}

enum Exit {
    Normal,
    Break,
    Return(Vec<V>),
}

fn eval_function(module: &Module, function: &Function, args: Vec<V>) -> Vec<V> {
    let mut locals = vec![V::Nil; function.locals.len()];
    locals[..args.len()].clone_from_slice(&args);
    match eval_cmds(module, &function.body, &mut locals) {
        Exit::Return(values) => values,
        _ => Vec::new(),
    }
}

fn eval_cmds(module: &Module, cmds: &[Cmd], locals: &mut Vec<V>) -> Exit {
    for cmd in cmds {
        match cmd {
            Cmd::Move { dst, src } => locals[*dst] = to_v(src, locals),
            Cmd::Unop { dst, op, src, .. } => {
                use pallene_core::ast::Unop;
                locals[*dst] = match (op, to_v(src, locals)) {
                    (Unop::Neg, V::Int(i)) => V::Int(i.wrapping_neg()),
                    (Unop::Neg, V::Float(f)) => V::Float(-f),
                    (Unop::Not, V::Bool(b)) => V::Bool(!b),
                    (Unop::BNot, V::Int(i)) => V::Int(!i),
                    (Unop::Len, V::Str(s)) => V::Int(s.len() as i64),
                    other => panic!("unsupported unop {other:?}"),
                };
            }
            Cmd::Binop {
                dst, op, lhs, rhs, ..
            } => {
                use pallene_core::ast::Binop;
                let (a, b) = (to_v(lhs, locals), to_v(rhs, locals));
                locals[*dst] = match (op, a, b) {
                    (Binop::Add, V::Int(a), V::Int(b)) => V::Int(a.wrapping_add(b)),
                    (Binop::Sub, V::Int(a), V::Int(b)) => V::Int(a.wrapping_sub(b)),
                    (Binop::Mul, V::Int(a), V::Int(b)) => V::Int(a.wrapping_mul(b)),
                    (Binop::Mod, V::Int(a), V::Int(b)) => {
                        let mut r = a.wrapping_rem(b);
                        if r != 0 && (r ^ b) < 0 {
                            r += b;
                        }
                        V::Int(r)
                    }
                    (Binop::IntDiv, V::Int(a), V::Int(b)) => {
                        let mut q = a.wrapping_div(b);
                        if (a ^ b) < 0 && q.wrapping_mul(b) != a {
                            q -= 1;
                        }
                        V::Int(q)
                    }
                    (Binop::Eq, a, b) => V::Bool(a == b),
                    (Binop::Ne, a, b) => V::Bool(a != b),
                    (Binop::Lt, V::Int(a), V::Int(b)) => V::Bool(a < b),
                    (Binop::Le, V::Int(a), V::Int(b)) => V::Bool(a <= b),
                    (Binop::Gt, V::Int(a), V::Int(b)) => V::Bool(a > b),
                    (Binop::Ge, V::Int(a), V::Int(b)) => V::Bool(a >= b),
                    (Binop::Add, V::Float(a), V::Float(b)) => V::Float(a + b),
                    (Binop::Div, V::Float(a), V::Float(b)) => V::Float(a / b),
                    other => panic!("unsupported binop {other:?}"),
                };
            }
            Cmd::Convert { dst, kind, src, .. } => {
                locals[*dst] = match (kind, to_v(src, locals)) {
                    (ConvertKind::IntToFloat, V::Int(i)) => V::Float(i as f64),
                    (ConvertKind::ToAny(_) | ConvertKind::FromAny(_), v) => v,
                    (ConvertKind::FloatToInt, V::Float(f)) => V::Int(f as i64),
                    other => panic!("unsupported convert {other:?}"),
                };
            }
            Cmd::CallStatic {
                dsts, func, args, ..
            } => {
                let args = args.iter().map(|a| to_v(a, locals)).collect();
                let rets = eval_function(module, &module.functions[*func], args);
                for (dst, ret) in dsts.iter().zip(rets) {
                    locals[*dst] = ret;
                }
            }
            Cmd::Concat { dst, srcs } => {
                let mut out = String::new();
                for src in srcs {
                    match to_v(src, locals) {
                        V::Str(s) => out.push_str(&s),
                        V::Int(i) => out.push_str(&i.to_string()),
                        other => panic!("unsupported concat operand {other:?}"),
                    }
                }
                locals[*dst] = V::Str(out);
            }
            Cmd::If {
                cond,
                then_cmds,
                else_cmds,
            } => {
                let taken = match to_v(cond, locals) {
                    V::Bool(b) => b,
                    V::Nil => false,
                    _ => true,
                };
                let cmds = if taken { then_cmds } else { else_cmds };
                match eval_cmds(module, cmds, locals) {
                    Exit::Normal => {}
                    exit => return exit,
                }
            }
            Cmd::Loop { body } => loop {
                match eval_cmds(module, body, locals) {
                    Exit::Normal => {}
                    Exit::Break => break,
                    exit @ Exit::Return(_) => return exit,
                }
            },
            Cmd::ForNumInt {
                var,
                start,
                limit,
                step,
                body,
            } => {
                let (V::Int(start), V::Int(limit), V::Int(step)) = (
                    to_v(start, locals),
                    to_v(limit, locals),
                    to_v(step, locals),
                ) else {
                    panic!("integer for bounds")
                };
                let mut i = start;
                loop {
                    if step > 0 && i > limit || step < 0 && i < limit {
                        break;
                    }
                    locals[*var] = V::Int(i);
                    match eval_cmds(module, body, locals) {
                        Exit::Normal => {}
                        Exit::Break => break,
                        exit @ Exit::Return(_) => return exit,
                    }
                    let (next, overflow) = i.overflowing_add(step);
                    if overflow {
                        break;
                    }
                    i = next;
                }
            }
            Cmd::Break => return Exit::Break,
            Cmd::Return { values } => {
                return Exit::Return(values.iter().map(|v| to_v(v, locals)).collect());
            }
            other => panic!("unsupported command {other:?}"),
        }
    }
    Exit::Normal
}

fn call(module: &Module, name: &str, args: Vec<V>) -> Vec<V> {
    let function = module
        .functions
        .iter()
        .find(|f| f.name == name)
        .expect("function exists");
    eval_function(module, function, args)
}

// ==================== End-to-end scenarios ====================

#[test]
fn constant_function_exports_through_luaopen() {
    let c = emit("function f(): integer return 10 end");
    assert!(c.contains("int luaopen_test(lua_State *L)"));
    assert!(c.contains("lua_setfield(L, -2, \"f\");"));
    assert!(c.contains("lua_pushinteger(L, INT64_C(10));"));
}

#[test]
fn wrapper_rejects_wrong_argument_type_with_message() {
    let c = emit("function id_int(x: integer): integer return x end");
    assert!(c.contains(
        "wrong type for argument %s at line %d, expected %s but found %s"
    ));
    assert!(c.contains("pallene_arg_error(L, 1, \"x\", 1, \"integer\");"));
}

#[test]
fn array_access_emits_out_of_bounds_check() {
    let c = emit(
        "function get(arr: {integer}, i: integer): integer\n\
         return arr[i]\n\
         end",
    );
    assert!(c.contains("array index out of bounds"));
    assert!(c.contains("pallene_bounds_error(L, 2)"));
}

#[test]
fn translator_blanks_annotation_preserving_geometry() {
    let source = "local xs: integer = 10\n";
    let program = front_end("test.pln", source).expect("front end").0;
    assert_eq!(translate(source, &program), "local xs          = 10\n");
}

#[test]
fn translator_rewrites_export_and_synthesizes_table() {
    let source = "export function f() end\n";
    let program = front_end("test.pln", source).expect("front end").0;
    let output = translate(source, &program);
    assert!(output.contains("local  function f() end"));
    assert!(output.contains("return {\n    f = f,\n}\n"));
}

#[test]
fn gcd_computes_fifteen() {
    let module = ir(
        "function gcd(a: integer, b: integer): integer\n\
         if b == 0 then\n\
         return a\n\
         else\n\
         return gcd(b, a % b)\n\
         end\n\
         end",
    );
    let rets = call(&module, "gcd", vec![V::Int(30), V::Int(105)]);
    assert_eq!(rets, vec![V::Int(15)]);
}

#[test]
fn iterative_sum_runs_through_the_specialized_for() {
    let module = ir(
        "function sum(n: integer): integer\n\
         local acc: integer = 0\n\
         for i = 1, n do\n\
         acc = acc + i\n\
         end\n\
         return acc\n\
         end",
    );
    let rets = call(&module, "sum", vec![V::Int(100)]);
    assert_eq!(rets, vec![V::Int(5050)]);
}

#[test]
fn mixed_arithmetic_promotes_through_convert() {
    let module = ir(
        "function half(x: integer): float\n\
         return x / 2\n\
         end",
    );
    let rets = call(&module, "half", vec![V::Int(7)]);
    assert_eq!(rets, vec![V::Float(3.5)]);
}

#[test]
fn constant_propagation_survives_behavior() {
    let source = "function f(): integer\n\
                  local a: integer = 6\n\
                  local b: integer = 7\n\
                  return a * b\n\
                  end";
    let with = compile_source_to_ir("test.pln", source, &PassConfig::all()).unwrap();
    let without =
        compile_source_to_ir("test.pln", source, &PassConfig::from_names(["uninitialized"]).unwrap())
            .unwrap();
    assert_eq!(call(&with, "f", Vec::new()), vec![V::Int(42)]);
    assert_eq!(call(&without, "f", Vec::new()), vec![V::Int(42)]);
    // And the optimized body really is smaller
    let f_with = with.functions.iter().find(|f| f.name == "f").unwrap();
    let f_without = without.functions.iter().find(|f| f.name == "f").unwrap();
    assert!(f_with.body.len() < f_without.body.len());
}

#[test]
fn uninitialized_read_stops_the_pipeline() {
    let source = "function f(): integer\n\
                  local x: integer\n\
                  return x\n\
                  end";
    let err = compile_source_to_ir("test.pln", source, &PassConfig::all()).unwrap_err();
    let DriverError::Frontend(diagnostics) = err else {
        panic!("expected diagnostics")
    };
    assert_eq!(diagnostics[0].kind, "uninitialized");
    assert!(diagnostics[0].message.contains("'x'"));
}

#[test]
fn checker_errors_come_out_rendered_and_ordered() {
    let source = "function f(): integer\n\
                  return y\n\
                  end\n\
                  function g(p: Missing) end";
    let err = front_end("demo.pln", source).unwrap_err();
    let DriverError::Frontend(diagnostics) = err else {
        panic!("expected diagnostics")
    };
    assert!(diagnostics.len() >= 2);
    assert!(diagnostics[0].to_string().starts_with("demo.pln:2:"));
    for pair in diagnostics.windows(2) {
        assert!(pair[0].line <= pair[1].line);
    }
}

#[test]
fn record_module_compiles_end_to_end() {
    let c = emit(
        "record Point\n\
         x: float\n\
         y: float\n\
         end\n\
         function origin(): Point\n\
         return {x = 0.0, y = 0.0}\n\
         end\n\
         function get_x(p: Point): float\n\
         return p.x\n\
         end",
    );
    assert!(c.contains("lua_setfield(L, -2, \"origin\");"));
    assert!(c.contains("lua_getfield(L, (base + 0), \"x\");"));
}
