//! C code generator
//!
//! Emits portable C against the Lua 5.4 C API. Every IR local maps to a
//! Lua stack slot at a fixed offset from the function's base, which makes
//! `any` conversions free and keeps values visible to the collector.
//! Each function gets an internal implementation (the direct-call path:
//! arguments on the stack, returns left on the stack) plus a
//! `lua_CFunction` wrapper that validates argument count and tags before
//! dispatching; exported functions reach the module table through their
//! wrapper. The `luaopen_<module>` entry point runs the module
//! initializer and returns the export table.

use std::fmt::Write as _;

use crate::ast::{Binop, Unop};
use crate::ir::{Cmd, ConvertKind, Export, ExportItem, Module, Value};
use crate::lexer::LineIndex;
use crate::types::Type;

/// Emit a complete C translation unit for the module
#[must_use]
pub fn emit_c(module: &Module, module_name: &str, line_index: &LineIndex) -> String {
    let mut cg = Codegen {
        out: CWriter::new(),
        module,
        line_index,
    };
    cg.emit_module(module_name);
    cg.out.finish()
}

/// Indentation-tracking writer
struct CWriter {
    out: String,
    indent: usize,
}

impl CWriter {
    fn new() -> Self {
        Self {
            out: String::new(),
            indent: 0,
        }
    }

    fn line(&mut self, text: &str) {
        if !text.is_empty() {
            for _ in 0..self.indent {
                self.out.push_str("    ");
            }
            self.out.push_str(text);
        }
        self.out.push('\n');
    }

    fn open(&mut self, text: &str) {
        self.line(text);
        self.indent += 1;
    }

    fn close(&mut self, text: &str) {
        self.indent -= 1;
        self.line(text);
    }

    fn finish(self) -> String {
        self.out
    }
}

struct Codegen<'a> {
    out: CWriter,
    module: &'a Module,
    line_index: &'a LineIndex,
}

impl Codegen<'_> {
    fn emit_module(&mut self, module_name: &str) {
        self.preamble();
        for id in 0..self.module.functions.len() {
            self.out
                .line(&format!("static void {}(lua_State *L);", impl_name(self.module, id)));
        }
        self.out.line("");
        for id in 0..self.module.functions.len() {
            self.emit_impl(id);
            self.emit_wrapper(id);
        }
        self.emit_luaopen(module_name);
    }

    fn preamble(&mut self) {
        let w = &mut self.out;
        w.line("/* Generated by pallenec. Do not edit. */");
        w.line("#include <lua.h>");
        w.line("#include <lauxlib.h>");
        w.line("#include <math.h>");
        w.line("#include <stdint.h>");
        w.line("");
        w.line("static int pallene_globals_ref = LUA_NOREF;");
        w.line("");
        w.open("static const char *pallene_typename(lua_State *L, int idx) {");
        w.open("if (lua_type(L, idx) == LUA_TNUMBER) {");
        w.line("return lua_isinteger(L, idx) ? \"integer\" : \"float\";");
        w.close("}");
        w.line("return lua_typename(L, lua_type(L, idx));");
        w.close("}");
        w.line("");
        w.open(
            "static int pallene_arg_error(lua_State *L, int slot, const char *name, int line, const char *expected) {",
        );
        w.line(
            "return luaL_error(L, \"wrong type for argument %s at line %d, expected %s but found %s\", name, line, expected, pallene_typename(L, slot));",
        );
        w.close("}");
        w.line("");
        w.open(
            "static int pallene_elem_error(lua_State *L, int slot, int line, const char *expected) {",
        );
        w.line(
            "return luaL_error(L, \"wrong type for array element at line %d, expected %s but found %s\", line, expected, pallene_typename(L, slot));",
        );
        w.close("}");
        w.line("");
        w.open(
            "static int pallene_field_error(lua_State *L, int slot, const char *field, int line, const char *expected) {",
        );
        w.line(
            "return luaL_error(L, \"wrong type for field '%s' at line %d, expected %s but found %s\", field, line, expected, pallene_typename(L, slot));",
        );
        w.close("}");
        w.line("");
        w.open(
            "static int pallene_cast_error(lua_State *L, int slot, int line, const char *expected) {",
        );
        w.line(
            "return luaL_error(L, \"wrong type at line %d, expected %s but found %s\", line, expected, pallene_typename(L, slot));",
        );
        w.close("}");
        w.line("");
        w.open("static int pallene_bounds_error(lua_State *L, int line) {");
        w.line("return luaL_error(L, \"array index out of bounds at line %d\", line);");
        w.close("}");
        w.line("");
        w.open(
            "static int pallene_arity_error(lua_State *L, int line, int expected, int found) {",
        );
        w.line(
            "return luaL_error(L, \"wrong number of arguments at line %d, expected %d but found %d\", line, expected, found);",
        );
        w.close("}");
        w.line("");
        w.open(
            "static lua_Integer pallene_ifloordiv(lua_State *L, lua_Integer a, lua_Integer b, int line) {",
        );
        w.line("lua_Integer q;");
        w.line("if (b == 0) luaL_error(L, \"attempt to perform 'n//0' at line %d\", line);");
        w.line("if (b == -1) return (lua_Integer)(0u - (uint64_t)a);");
        w.line("q = a / b;");
        w.line("if ((a ^ b) < 0 && q * b != a) q -= 1;");
        w.line("return q;");
        w.close("}");
        w.line("");
        w.open(
            "static lua_Integer pallene_imod(lua_State *L, lua_Integer a, lua_Integer b, int line) {",
        );
        w.line("lua_Integer r;");
        w.line("if (b == 0) luaL_error(L, \"attempt to perform 'n%%0' at line %d\", line);");
        w.line("if (b == -1) return 0;");
        w.line("r = a % b;");
        w.line("if (r != 0 && (r ^ b) < 0) r += b;");
        w.line("return r;");
        w.close("}");
        w.line("");
        w.open("static lua_Integer pallene_shiftl(lua_Integer a, lua_Integer b) {");
        w.line("if (b <= -64 || b >= 64) return 0;");
        w.line("if (b >= 0) return (lua_Integer)((uint64_t)a << b);");
        w.line("return (lua_Integer)((uint64_t)a >> -b);");
        w.close("}");
        w.line("");
        w.open("static lua_Number pallene_fmod(lua_Number a, lua_Number b) {");
        w.line("lua_Number r = fmod(a, b);");
        w.line("if (r != 0.0 && (r < 0.0) != (b < 0.0)) r += b;");
        w.line("return r;");
        w.close("}");
        w.line("");
    }

    // ==================== Values ====================

    fn slot(&self, local: usize) -> String {
        format!("(base + {local})")
    }

    /// C expression reading a value as lua_Integer
    fn int_expr(&self, value: &Value) -> String {
        match value {
            Value::Local(l) => format!("lua_tointeger(L, {})", self.slot(*l)),
            Value::Integer(i) => int_literal(*i),
            _ => unreachable!("integer operand expected"),
        }
    }

    /// C expression reading a value as lua_Number
    fn float_expr(&self, value: &Value) -> String {
        match value {
            Value::Local(l) => format!("lua_tonumber(L, {})", self.slot(*l)),
            Value::Float(f) => float_literal(*f),
            Value::Integer(i) => format!("(lua_Number){}", int_literal(*i)),
            _ => unreachable!("float operand expected"),
        }
    }

    /// C expression reading a value as a truth value
    fn bool_expr(&self, value: &Value) -> String {
        match value {
            Value::Local(l) => format!("lua_toboolean(L, {})", self.slot(*l)),
            Value::Bool(true) => "1".to_string(),
            Value::Bool(false) => "0".to_string(),
            _ => unreachable!("boolean operand expected"),
        }
    }

    /// Push a value onto the Lua stack
    fn push_value(&mut self, value: &Value) {
        let code = match value {
            Value::Local(l) => format!("lua_pushvalue(L, {});", self.slot(*l)),
            Value::Nil => "lua_pushnil(L);".to_string(),
            Value::Bool(true) => "lua_pushboolean(L, 1);".to_string(),
            Value::Bool(false) => "lua_pushboolean(L, 0);".to_string(),
            Value::Integer(i) => format!("lua_pushinteger(L, {});", int_literal(*i)),
            Value::Float(f) => format!("lua_pushnumber(L, {});", float_literal(*f)),
            Value::String(s) => {
                let escaped = c_string(s);
                format!("lua_pushlstring(L, {escaped}, {});", s.len())
            }
        };
        self.out.line(&code);
    }

    /// Store the top of the stack into a local slot
    fn store_top(&mut self, dst: usize) {
        let code = format!("lua_replace(L, {});", self.slot(dst));
        self.out.line(&code);
    }

    /// Emit the tag check for a slot against a static type, using the
    /// given error helper call (which receives slot and expected name)
    fn emit_tag_check(&mut self, slot: &str, ty: &Type, error_call: &str) {
        let Some(cond) = tag_mismatch_cond(slot, ty) else {
            return;
        };
        self.out.open(&format!("if ({cond}) {{"));
        self.out.line(error_call);
        self.out.close("}");
    }

    // ==================== Functions ====================

    fn emit_impl(&mut self, id: usize) {
        let name = impl_name(self.module, id);
        let param_count = self.module.functions[id].param_count;
        let nlocals = self.module.functions[id].locals.len();
        let body = self.module.functions[id].body.clone();
        self.out.open(&format!("static void {name}(lua_State *L) {{"));
        self.out
            .line(&format!("int base = lua_gettop(L) - {param_count} + 1;"));
        self.out
            .line(&format!("lua_settop(L, base + {nlocals} - 1);"));
        self.emit_cmds(id, &body);
        self.out.close("}");
        self.out.line("");
    }

    fn emit_wrapper(&mut self, id: usize) {
        let function = &self.module.functions[id];
        let name = wrapper_name(self.module, id);
        self.out
            .open(&format!("static int {name}(lua_State *L) {{"));
        self.out.open(&format!(
            "if (lua_gettop(L) != {}) {{",
            function.param_count
        ));
        self.out.line(&format!(
            "return pallene_arity_error(L, {}, {}, lua_gettop(L));",
            function.line, function.param_count
        ));
        self.out.close("}");
        for (i, local) in function.locals.iter().take(function.param_count).enumerate() {
            let slot = format!("{}", i + 1);
            let line = if local.span.is_dummy() {
                function.line
            } else {
                self.line_index.location(local.span.start).line
            };
            if let Some(cond) = tag_mismatch_cond(&slot, &local.ty) {
                self.out.open(&format!("if ({cond}) {{"));
                self.out.line(&format!(
                    "return pallene_arg_error(L, {slot}, \"{}\", {line}, \"{}\");",
                    local.name,
                    type_name(&local.ty)
                ));
                self.out.close("}");
            }
        }
        self.out
            .line(&format!("{}(L);", impl_name(self.module, id)));
        self.out
            .line(&format!("return {};", function.ret_types.len()));
        self.out.close("}");
        self.out.line("");
    }

    fn emit_luaopen(&mut self, module_name: &str) {
        self.out
            .open(&format!("int luaopen_{module_name}(lua_State *L) {{"));
        self.out.line("lua_newtable(L);");
        self.out
            .line("pallene_globals_ref = luaL_ref(L, LUA_REGISTRYINDEX);");
        let init = impl_name(self.module, self.module.init);
        self.out.line(&format!("{init}(L);"));
        self.out.line("lua_newtable(L);");
        for Export { name, item } in &self.module.exports {
            match item {
                ExportItem::Function(id) => {
                    self.out.line(&format!(
                        "lua_pushcfunction(L, {});",
                        wrapper_name(self.module, *id)
                    ));
                }
                ExportItem::Global(id) => {
                    self.out
                        .line("lua_rawgeti(L, LUA_REGISTRYINDEX, pallene_globals_ref);");
                    self.out.line(&format!("lua_rawgeti(L, -1, {});", id + 1));
                    self.out.line("lua_remove(L, -2);");
                }
            }
            self.out.line(&format!("lua_setfield(L, -2, \"{name}\");"));
        }
        self.out.line("return 1;");
        self.out.close("}");
    }

    // ==================== Commands ====================

    fn emit_cmds(&mut self, func: usize, cmds: &[Cmd]) {
        for cmd in cmds {
            self.emit_cmd(func, cmd);
        }
    }

    #[allow(clippy::too_many_lines)] // One arm per IR command
    fn emit_cmd(&mut self, func: usize, cmd: &Cmd) {
        match cmd {
            Cmd::Move { dst, src } => {
                match src {
                    Value::Local(l) => {
                        let code = format!("lua_copy(L, {}, {});", self.slot(*l), self.slot(*dst));
                        self.out.line(&code);
                    }
                    _ => {
                        self.push_value(src);
                        self.store_top(*dst);
                    }
                }
            }

            Cmd::Unop {
                dst,
                op,
                operand_ty,
                src,
            } => self.emit_unop(*dst, *op, operand_ty, src),

            Cmd::Binop {
                dst,
                op,
                operand_ty,
                lhs,
                rhs,
                line,
            } => self.emit_binop(*dst, *op, operand_ty, lhs, rhs, *line),

            Cmd::Concat { dst, srcs } => {
                for src in srcs {
                    self.push_value(src);
                }
                self.out.line(&format!("lua_concat(L, {});", srcs.len()));
                self.store_top(*dst);
            }

            Cmd::Convert {
                dst,
                kind,
                src,
                line,
            } => self.emit_convert(*dst, kind, src, *line),

            Cmd::NewArray { dst, hint } => {
                self.out
                    .line(&format!("lua_createtable(L, {hint}, 0);"));
                self.store_top(*dst);
            }

            Cmd::NewRecord { dst, rec } => {
                let nfields = self.module.records[rec.0 as usize].fields.len();
                self.out
                    .line(&format!("lua_createtable(L, 0, {nfields});"));
                self.store_top(*dst);
            }

            Cmd::NewTable { dst } => {
                self.out.line("lua_createtable(L, 0, 0);");
                self.store_top(*dst);
            }

            Cmd::SetArr {
                arr,
                index,
                src,
                elem_ty,
                line,
            } => {
                let arr_slot = self.value_slot(arr);
                if *elem_ty == Type::Any {
                    self.push_value(index);
                    self.push_value(src);
                    self.out.line(&format!("lua_settable(L, {arr_slot});"));
                } else {
                    self.out.open("{");
                    let idx = self.int_expr(index);
                    self.out.line(&format!("lua_Integer i = {idx};"));
                    self.out.line(&format!(
                        "if (i < 1 || i > (lua_Integer)lua_rawlen(L, {arr_slot}) + 1) pallene_bounds_error(L, {line});"
                    ));
                    self.push_value(src);
                    self.out.line(&format!("lua_rawseti(L, {arr_slot}, i);"));
                    self.out.close("}");
                }
            }

            Cmd::GetArr {
                dst,
                arr,
                index,
                elem_ty,
                line,
            } => {
                let arr_slot = self.value_slot(arr);
                if *elem_ty == Type::Any {
                    self.push_value(index);
                    self.out.line(&format!("lua_gettable(L, {arr_slot});"));
                    self.store_top(*dst);
                } else {
                    self.out.open("{");
                    let idx = self.int_expr(index);
                    self.out.line(&format!("lua_Integer i = {idx};"));
                    self.out.line(&format!(
                        "if (i < 1 || i > (lua_Integer)lua_rawlen(L, {arr_slot})) pallene_bounds_error(L, {line});"
                    ));
                    self.out.line(&format!("lua_rawgeti(L, {arr_slot}, i);"));
                    self.emit_tag_check(
                        "-1",
                        elem_ty,
                        &format!(
                            "pallene_elem_error(L, -1, {line}, \"{}\");",
                            type_name(elem_ty)
                        ),
                    );
                    self.store_top(*dst);
                    self.out.close("}");
                }
            }

            Cmd::SetField { obj, field, src, .. } => {
                let obj_slot = self.value_slot(obj);
                self.push_value(src);
                self.out
                    .line(&format!("lua_setfield(L, {obj_slot}, \"{field}\");"));
            }

            Cmd::GetField {
                dst,
                obj,
                field,
                field_ty,
                line,
            } => {
                let obj_slot = self.value_slot(obj);
                self.out
                    .line(&format!("lua_getfield(L, {obj_slot}, \"{field}\");"));
                self.emit_tag_check(
                    "-1",
                    field_ty,
                    &format!(
                        "pallene_field_error(L, -1, \"{field}\", {line}, \"{}\");",
                        type_name(field_ty)
                    ),
                );
                self.store_top(*dst);
            }

            Cmd::GetGlobal { dst, global } => {
                self.out
                    .line("lua_rawgeti(L, LUA_REGISTRYINDEX, pallene_globals_ref);");
                self.out.line(&format!("lua_rawgeti(L, -1, {});", global + 1));
                self.store_top(*dst);
                self.out.line("lua_pop(L, 1);");
            }

            Cmd::SetGlobal { global, src } => {
                self.out
                    .line("lua_rawgeti(L, LUA_REGISTRYINDEX, pallene_globals_ref);");
                self.push_value(src);
                self.out.line(&format!("lua_rawseti(L, -2, {});", global + 1));
                self.out.line("lua_pop(L, 1);");
            }

            Cmd::LoadFunction { dst, func } => {
                self.out.line(&format!(
                    "lua_pushcfunction(L, {});",
                    wrapper_name(self.module, *func)
                ));
                self.store_top(*dst);
            }

            Cmd::Import { dst, module } => {
                self.out.line("lua_getglobal(L, \"require\");");
                let escaped = c_string(module);
                self.out
                    .line(&format!("lua_pushlstring(L, {escaped}, {});", module.len()));
                self.out.line("lua_call(L, 1, 1);");
                self.store_top(*dst);
            }

            Cmd::CallStatic {
                dsts,
                func: callee,
                args,
                ..
            } => {
                for arg in args {
                    self.push_value(arg);
                }
                self.out
                    .line(&format!("{}(L);", impl_name(self.module, *callee)));
                let nrets = self.module.functions[*callee].ret_types.len();
                if dsts.is_empty() {
                    if nrets > 0 {
                        self.out.line(&format!("lua_pop(L, {nrets});"));
                    }
                } else {
                    for dst in dsts.iter().rev() {
                        self.store_top(*dst);
                    }
                }
            }

            Cmd::CallDyn {
                dst,
                func: callee,
                args,
                line,
            } => {
                self.push_value(callee);
                for arg in args {
                    self.push_value(arg);
                }
                let nrets = usize::from(dst.is_some());
                self.out
                    .line(&format!("lua_call(L, {}, {nrets});", args.len()));
                if let Some(dst) = dst {
                    let ty = self.module.functions[func].locals[*dst].ty.clone();
                    self.emit_tag_check(
                        "-1",
                        &ty,
                        &format!("pallene_cast_error(L, -1, {line}, \"{}\");", type_name(&ty)),
                    );
                    self.store_top(*dst);
                }
            }

            Cmd::CallMethod {
                dst,
                obj,
                method,
                args,
                line,
            } => {
                let obj_slot = self.value_slot(obj);
                self.out
                    .line(&format!("lua_getfield(L, {obj_slot}, \"{method}\");"));
                self.push_value(obj);
                for arg in args {
                    self.push_value(arg);
                }
                let nrets = usize::from(dst.is_some());
                self.out
                    .line(&format!("lua_call(L, {}, {nrets});", args.len() + 1));
                if let Some(dst) = dst {
                    let ty = self.module.functions[func].locals[*dst].ty.clone();
                    self.emit_tag_check(
                        "-1",
                        &ty,
                        &format!("pallene_cast_error(L, -1, {line}, \"{}\");", type_name(&ty)),
                    );
                    self.store_top(*dst);
                }
            }

            Cmd::If {
                cond,
                then_cmds,
                else_cmds,
            } => {
                let cond = self.bool_expr(cond);
                self.out.open(&format!("if ({cond}) {{"));
                self.emit_cmds(func, then_cmds);
                if else_cmds.is_empty() {
                    self.out.close("}");
                } else {
                    self.out.close("} else {");
                    self.out.indent += 1;
                    self.emit_cmds(func, else_cmds);
                    self.out.close("}");
                }
            }

            Cmd::Loop { body } => {
                self.out.open("for (;;) {");
                self.emit_cmds(func, body);
                self.out.close("}");
            }

            Cmd::ForNumInt {
                var,
                start,
                limit,
                step,
                body,
            } => {
                self.out.open("{");
                let (start, limit, step) = (
                    self.int_expr(start),
                    self.int_expr(limit),
                    self.int_expr(step),
                );
                self.out.line(&format!("lua_Integer pln_start = {start};"));
                self.out.line(&format!("lua_Integer pln_limit = {limit};"));
                self.out.line(&format!("lua_Integer pln_step = {step};"));
                // Iterate by count so the loop variable never wraps
                self.out.line("uint64_t pln_count = 0;");
                self.out.open(
                    "if (pln_step > 0 ? pln_start <= pln_limit : (pln_step < 0 && pln_start >= pln_limit)) {",
                );
                self.out.line(
                    "pln_count = pln_step > 0 ? ((uint64_t)pln_limit - (uint64_t)pln_start) / (uint64_t)pln_step : ((uint64_t)pln_start - (uint64_t)pln_limit) / (0u - (uint64_t)pln_step);",
                );
                self.out.line("lua_Integer pln_i = pln_start;");
                self.out.open("for (;;) {");
                self.out.line("lua_pushinteger(L, pln_i);");
                self.store_top(*var);
                self.emit_cmds(func, body);
                self.out.line("if (pln_count == 0) break;");
                self.out.line("pln_count -= 1;");
                self.out
                    .line("pln_i = (lua_Integer)((uint64_t)pln_i + (uint64_t)pln_step);");
                self.out.close("}");
                self.out.close("}");
                self.out.close("}");
            }

            Cmd::ForNumFloat {
                var,
                start,
                limit,
                step,
                body,
            } => {
                self.out.open("{");
                let (start, limit, step) = (
                    self.float_expr(start),
                    self.float_expr(limit),
                    self.float_expr(step),
                );
                self.out.line(&format!("lua_Number pln_i = {start};"));
                self.out.line(&format!("lua_Number pln_limit = {limit};"));
                self.out.line(&format!("lua_Number pln_step = {step};"));
                self.out.open(
                    "for (; pln_step > 0.0 ? pln_i <= pln_limit : pln_i >= pln_limit; pln_i += pln_step) {",
                );
                self.out.line("lua_pushnumber(L, pln_i);");
                self.store_top(*var);
                self.emit_cmds(func, body);
                self.out.close("}");
                self.out.close("}");
            }

            Cmd::Break => self.out.line("break;"),

            Cmd::Return { values } => {
                for value in values {
                    self.push_value(value);
                }
                let n = values.len();
                self.out.open("{");
                self.out.line("int pln_top = lua_gettop(L);");
                for k in 0..n {
                    let from = format!("pln_top - {} + {}", n, k + 1);
                    self.out.line(&format!("lua_copy(L, {from}, base + {k});"));
                }
                self.out.line(&format!("lua_settop(L, base + {n} - 1);"));
                self.out.line("return;");
                self.out.close("}");
            }
        }
    }

    /// Absolute slot of a value known to be a local
    fn value_slot(&self, value: &Value) -> String {
        match value {
            Value::Local(l) => self.slot(*l),
            _ => unreachable!("container operands are always locals"),
        }
    }

    fn emit_unop(&mut self, dst: usize, op: Unop, operand_ty: &Type, src: &Value) {
        match (op, operand_ty) {
            (Unop::Neg, Type::Integer) => {
                let s = self.int_expr(src);
                self.out.line(&format!(
                    "lua_pushinteger(L, (lua_Integer)(0u - (uint64_t)({s})));"
                ));
                self.store_top(dst);
            }
            (Unop::Neg, _) => {
                let s = self.float_expr(src);
                self.out.line(&format!("lua_pushnumber(L, -({s}));"));
                self.store_top(dst);
            }
            (Unop::BNot, _) => {
                let s = self.int_expr(src);
                self.out
                    .line(&format!("lua_pushinteger(L, ~({s}));"));
                self.store_top(dst);
            }
            (Unop::Not, _) => {
                let s = self.bool_expr(src);
                self.out.line(&format!("lua_pushboolean(L, !({s}));"));
                self.store_top(dst);
            }
            (Unop::Len, _) => {
                match src {
                    Value::Local(l) => {
                        let slot = self.slot(*l);
                        self.out.line(&format!("lua_len(L, {slot});"));
                    }
                    _ => {
                        self.push_value(src);
                        self.out.line("lua_len(L, -1);");
                        self.out.line("lua_remove(L, -2);");
                    }
                }
                self.store_top(dst);
            }
        }
    }

    fn emit_binop(
        &mut self,
        dst: usize,
        op: Binop,
        operand_ty: &Type,
        lhs: &Value,
        rhs: &Value,
        line: u32,
    ) {
        use Binop::*;
        match operand_ty {
            Type::Integer => {
                let a = self.int_expr(lhs);
                let b = self.int_expr(rhs);
                let expr = match op {
                    Add => format!("(lua_Integer)((uint64_t)({a}) + (uint64_t)({b}))"),
                    Sub => format!("(lua_Integer)((uint64_t)({a}) - (uint64_t)({b}))"),
                    Mul => format!("(lua_Integer)((uint64_t)({a}) * (uint64_t)({b}))"),
                    IntDiv => format!("pallene_ifloordiv(L, {a}, {b}, {line})"),
                    Mod => format!("pallene_imod(L, {a}, {b}, {line})"),
                    BAnd => format!("({a}) & ({b})"),
                    BOr => format!("({a}) | ({b})"),
                    BXor => format!("({a}) ^ ({b})"),
                    Shl => format!("pallene_shiftl({a}, {b})"),
                    Shr => format!("pallene_shiftl({a}, (lua_Integer)(0u - (uint64_t)({b})))"),
                    Eq | Ne | Lt | Le | Gt | Ge => {
                        let cmp = c_comparison(op);
                        self.out
                            .line(&format!("lua_pushboolean(L, ({a}) {cmp} ({b}));"));
                        self.store_top(dst);
                        return;
                    }
                    _ => unreachable!("not an integer operator"),
                };
                self.out.line(&format!("lua_pushinteger(L, {expr});"));
                self.store_top(dst);
            }
            Type::Float => {
                let a = self.float_expr(lhs);
                let b = self.float_expr(rhs);
                let expr = match op {
                    Add => format!("({a}) + ({b})"),
                    Sub => format!("({a}) - ({b})"),
                    Mul => format!("({a}) * ({b})"),
                    Div => format!("({a}) / ({b})"),
                    IntDiv => format!("floor(({a}) / ({b}))"),
                    Mod => format!("pallene_fmod({a}, {b})"),
                    Pow => format!("pow({a}, {b})"),
                    Eq | Ne | Lt | Le | Gt | Ge => {
                        let cmp = c_comparison(op);
                        self.out
                            .line(&format!("lua_pushboolean(L, ({a}) {cmp} ({b}));"));
                        self.store_top(dst);
                        return;
                    }
                    _ => unreachable!("not a float operator"),
                };
                self.out.line(&format!("lua_pushnumber(L, {expr});"));
                self.store_top(dst);
            }
            // Strings, booleans and boxed values compare via the host
            _ => {
                self.push_value(lhs);
                self.push_value(rhs);
                let (cop, negate) = match op {
                    Eq => ("LUA_OPEQ", false),
                    Ne => ("LUA_OPEQ", true),
                    Lt => ("LUA_OPLT", false),
                    Le => ("LUA_OPLE", false),
                    Gt => ("LUA_OPLT", false),
                    Ge => ("LUA_OPLE", false),
                    _ => unreachable!("non-numeric operands only compare"),
                };
                let (i1, i2) = if matches!(op, Gt | Ge) {
                    ("-1", "-2")
                } else {
                    ("-2", "-1")
                };
                let bang = if negate { "!" } else { "" };
                self.out.line(&format!(
                    "lua_pushboolean(L, {bang}lua_compare(L, {i1}, {i2}, {cop}));"
                ));
                self.store_top(dst);
                self.out.line("lua_pop(L, 2);");
            }
        }
    }

    fn emit_convert(&mut self, dst: usize, kind: &ConvertKind, src: &Value, line: u32) {
        match kind {
            ConvertKind::IntToFloat => {
                let s = self.int_expr(src);
                self.out
                    .line(&format!("lua_pushnumber(L, (lua_Number)({s}));"));
                self.store_top(dst);
            }
            ConvertKind::FloatToInt => {
                self.out.open("{");
                let s = self.float_expr(src);
                self.out.line(&format!("lua_Number n = {s};"));
                self.out.line("lua_Integer i;");
                self.out.open("if (!lua_numbertointeger(n, &i)) {");
                self.out.line(&format!(
                    "luaL_error(L, \"number has no integer representation at line {line}\");"
                ));
                self.out.close("}");
                self.out.line("lua_pushinteger(L, i);");
                self.store_top(dst);
                self.out.close("}");
            }
            // Locals are stack slots, so boxing is a plain copy
            ConvertKind::ToAny(_) => {
                self.emit_cmd_move(dst, src);
            }
            ConvertKind::FromAny(target) => {
                self.emit_cmd_move(dst, src);
                let slot = self.slot(dst);
                self.emit_tag_check(
                    &slot,
                    target,
                    &format!(
                        "pallene_cast_error(L, {slot}, {line}, \"{}\");",
                        type_name(target)
                    ),
                );
            }
        }
    }

    fn emit_cmd_move(&mut self, dst: usize, src: &Value) {
        match src {
            Value::Local(l) => {
                let code = format!("lua_copy(L, {}, {});", self.slot(*l), self.slot(dst));
                self.out.line(&code);
            }
            _ => {
                self.push_value(src);
                self.store_top(dst);
            }
        }
    }
}

// ==================== Naming and literals ====================

/// The C operator for a comparison on unboxed operands
fn c_comparison(op: Binop) -> &'static str {
    match op {
        Binop::Eq => "==",
        Binop::Ne => "!=",
        Binop::Lt => "<",
        Binop::Le => "<=",
        Binop::Gt => ">",
        Binop::Ge => ">=",
        _ => unreachable!("not a comparison"),
    }
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

fn impl_name(module: &Module, id: usize) -> String {
    format!("pallene_impl_{id}_{}", sanitize(&module.functions[id].name))
}

fn wrapper_name(module: &Module, id: usize) -> String {
    format!("pallene_lua_{id}_{}", sanitize(&module.functions[id].name))
}

fn int_literal(i: i64) -> String {
    if i == i64::MIN {
        "INT64_MIN".to_string()
    } else {
        format!("INT64_C({i})")
    }
}

fn float_literal(f: f64) -> String {
    if f.is_nan() {
        "(0.0/0.0)".to_string()
    } else if f.is_infinite() {
        if f > 0.0 {
            "(1.0/0.0)".to_string()
        } else {
            "(-1.0/0.0)".to_string()
        }
    } else {
        let s = format!("{f:?}");
        if s.contains('.') || s.contains('e') || s.contains('E') {
            s
        } else {
            format!("{s}.0")
        }
    }
}

/// A C string literal with every byte escaped as needed
fn c_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for byte in s.bytes() {
        match byte {
            b'"' => out.push_str("\\\""),
            b'\\' => out.push_str("\\\\"),
            b'\n' => out.push_str("\\n"),
            b'\r' => out.push_str("\\r"),
            b'\t' => out.push_str("\\t"),
            0x20..=0x7e => out.push(byte as char),
            other => {
                let _ = write!(out, "\\{other:03o}");
            }
        }
    }
    out.push('"');
    out
}

/// The condition under which a slot fails the type's tag check
fn tag_mismatch_cond(slot: &str, ty: &Type) -> Option<String> {
    let cond = match ty {
        Type::Any => return None,
        Type::Nil => format!("lua_type(L, {slot}) != LUA_TNIL"),
        Type::Boolean => format!("lua_type(L, {slot}) != LUA_TBOOLEAN"),
        Type::Integer => format!("!lua_isinteger(L, {slot})"),
        Type::Float => {
            format!("lua_type(L, {slot}) != LUA_TNUMBER || lua_isinteger(L, {slot})")
        }
        Type::String => format!("lua_type(L, {slot}) != LUA_TSTRING"),
        Type::Array(_) | Type::Table(_) | Type::Record { .. } => {
            format!("lua_type(L, {slot}) != LUA_TTABLE")
        }
        Type::Function { .. } => format!("lua_type(L, {slot}) != LUA_TFUNCTION"),
    };
    Some(cond)
}

/// The name a runtime diagnostic uses for a type
fn type_name(ty: &Type) -> String {
    match ty {
        Type::Nil => "nil".to_string(),
        Type::Boolean => "boolean".to_string(),
        Type::Integer => "integer".to_string(),
        Type::Float => "float".to_string(),
        Type::String => "string".to_string(),
        Type::Any => "any".to_string(),
        Type::Array(_) | Type::Table(_) => "table".to_string(),
        Type::Function { .. } => "function".to_string(),
        Type::Record { name, .. } => name.clone(),
    }
}
