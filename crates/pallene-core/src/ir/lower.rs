//! AST to IR lowering
//!
//! Converts a checked program into a flat IR module. Compound expressions
//! are flattened into fresh locals, short-circuit operators become
//! branches writing a boolean local, numeric `for` loops are specialized
//! by the loop variable's static type, and checker-inserted casts become
//! explicit `Convert` commands. Lambdas are lifted into module functions;
//! the checker has already rejected lambdas that capture locals.
//!
//! Top-level variable initializers and imports are lowered into a module
//! initializer function that the generated entry point runs at load time.

use std::collections::HashMap;

use crate::ast::{
    Binop, Block, ElseBranch, Exp, ExpKind, FuncBody, InitEntry, Program, Stat, StatKind,
    ToplevelKind, VarKind, VarNode, Visibility,
};
use crate::lexer::{LineIndex, Span};
use crate::types::{CheckResult, RecordInfo, Type};

use super::{
    Cmd, ConvertKind, Export, ExportItem, Function, FunctionId, Global, GlobalId, Local, LocalId,
    Module, Value,
};

/// Lower a checked program into an IR module
#[must_use]
pub fn lower_program(program: &Program, check: &CheckResult, line_index: &LineIndex) -> Module {
    let mut lowerer = ModuleLowerer::new(check, line_index);
    lowerer.declare_toplevels(program);
    lowerer.lower_toplevels(program);
    lowerer.finish(program)
}

struct ModuleLowerer<'a> {
    line_index: &'a LineIndex,
    records: Vec<RecordInfo>,
    functions: Vec<Function>,
    func_ids: HashMap<String, FunctionId>,
    globals: Vec<Global>,
    global_ids: HashMap<String, GlobalId>,
}

impl<'a> ModuleLowerer<'a> {
    fn new(check: &CheckResult, line_index: &'a LineIndex) -> Self {
        Self {
            line_index,
            records: check.records.clone(),
            functions: Vec::new(),
            func_ids: HashMap::new(),
            globals: Vec::new(),
            global_ids: HashMap::new(),
        }
    }

    fn line(&self, span: Span) -> u32 {
        if span.is_dummy() {
            0
        } else {
            self.line_index.location(span.start).line
        }
    }

    /// Reserve ids for named functions and globals in declaration order
    fn declare_toplevels(&mut self, program: &Program) {
        for tl in &program.toplevels {
            match &tl.kind {
                ToplevelKind::Func(func) => {
                    let id = self.functions.len();
                    self.func_ids.insert(func.name.name.clone(), id);
                    let params: Vec<Local> = func
                        .body
                        .params
                        .iter()
                        .map(|p| Local {
                            name: p.name.name.clone(),
                            ty: p.ty.clone().unwrap_or(Type::Any),
                            span: p.span,
                        })
                        .collect();
                    self.functions.push(Function {
                        name: func.name.name.clone(),
                        line: self.line(func.name.span),
                        param_count: params.len(),
                        locals: params,
                        ret_types: func.body.ret_types.clone().unwrap_or_default(),
                        body: Vec::new(),
                    });
                }
                ToplevelKind::Var(var) => {
                    let id = self.globals.len();
                    self.global_ids.insert(var.name.name.clone(), id);
                    self.globals.push(Global {
                        name: var.name.name.clone(),
                        ty: var.ty.clone().unwrap_or(Type::Any),
                    });
                }
                ToplevelKind::Import(imp) => {
                    let id = self.globals.len();
                    self.global_ids.insert(imp.name.name.clone(), id);
                    self.globals.push(Global {
                        name: imp.name.name.clone(),
                        ty: Type::Any,
                    });
                }
                _ => {}
            }
        }
    }

    fn lower_toplevels(&mut self, program: &Program) {
        for tl in &program.toplevels {
            if let ToplevelKind::Func(func) = &tl.kind {
                let id = self.func_ids[&func.name.name];
                let body = self.lower_func_body(&func.body);
                let (locals, cmds) = body;
                self.functions[id].locals = locals;
                self.functions[id].body = cmds;
            }
        }
    }

    /// Lower a function body, returning its locals and commands
    fn lower_func_body(&mut self, body: &FuncBody) -> (Vec<Local>, Vec<Cmd>) {
        let mut fl = FuncLowerer::new(self);
        for param in &body.params {
            let ty = param.ty.clone().unwrap_or(Type::Any);
            let id = fl.fresh_local(&param.name.name, ty, param.span);
            fl.bind(&param.name.name, id);
        }
        let mut cmds = Vec::new();
        fl.lower_block_stats(&mut cmds, &body.block);
        if !matches!(cmds.last(), Some(Cmd::Return { .. })) {
            cmds.push(Cmd::Return { values: Vec::new() });
        }
        (fl.locals, cmds)
    }

    /// Lift a lambda into a fresh module function, returning its id
    fn lower_lambda(&mut self, body: &FuncBody) -> FunctionId {
        let (locals, cmds) = self.lower_func_body(body);
        let id = self.functions.len();
        self.functions.push(Function {
            name: "lambda".to_string(),
            line: self.line(body.span),
            param_count: body.params.len(),
            locals,
            ret_types: body.ret_types.clone().unwrap_or_default(),
            body: cmds,
        });
        id
    }

    /// Build the module initializer and assemble the module
    fn finish(mut self, program: &Program) -> Module {
        let mut fl = FuncLowerer::new(&mut self);
        let mut cmds = Vec::new();
        for tl in &program.toplevels {
            match &tl.kind {
                ToplevelKind::Var(var) => {
                    let global = fl.ml.global_ids[&var.name.name];
                    let src = fl.lower_exp(&mut cmds, &var.value);
                    cmds.push(Cmd::SetGlobal { global, src });
                }
                ToplevelKind::Import(imp) => {
                    let global = fl.ml.global_ids[&imp.name.name];
                    let dst = fl.fresh_local(&imp.name.name, Type::Any, tl.span);
                    cmds.push(Cmd::Import {
                        dst,
                        module: imp.module.clone(),
                    });
                    cmds.push(Cmd::SetGlobal {
                        global,
                        src: Value::Local(dst),
                    });
                }
                _ => {}
            }
        }
        cmds.push(Cmd::Return { values: Vec::new() });
        let locals = fl.locals;

        let init = self.functions.len();
        self.functions.push(Function {
            name: "init".to_string(),
            line: 0,
            param_count: 0,
            locals,
            ret_types: Vec::new(),
            body: cmds,
        });

        let mut exports = Vec::new();
        for tl in &program.toplevels {
            match &tl.kind {
                ToplevelKind::Func(func) if func.visibility == Visibility::Export => {
                    exports.push(Export {
                        name: func.name.name.clone(),
                        item: ExportItem::Function(self.func_ids[&func.name.name]),
                    });
                }
                ToplevelKind::Var(var) if var.visibility == Visibility::Export => {
                    exports.push(Export {
                        name: var.name.name.clone(),
                        item: ExportItem::Global(self.global_ids[&var.name.name]),
                    });
                }
                _ => {}
            }
        }

        Module {
            functions: self.functions,
            globals: self.globals,
            records: self.records,
            exports,
            init,
        }
    }
}

/// Per-function lowering state
struct FuncLowerer<'m, 'a> {
    ml: &'m mut ModuleLowerer<'a>,
    locals: Vec<Local>,
    scopes: Vec<HashMap<String, LocalId>>,
}

impl<'m, 'a> FuncLowerer<'m, 'a> {
    fn new(ml: &'m mut ModuleLowerer<'a>) -> Self {
        Self {
            ml,
            locals: Vec::new(),
            scopes: vec![HashMap::new()],
        }
    }

    fn fresh_local(&mut self, name: &str, ty: Type, span: Span) -> LocalId {
        let id = self.locals.len();
        self.locals.push(Local {
            name: name.to_string(),
            ty,
            span,
        });
        id
    }

    /// A nameless temporary
    fn fresh_temp(&mut self, ty: Type) -> LocalId {
        self.fresh_local("", ty, Span::dummy())
    }

    fn bind(&mut self, name: &str, id: LocalId) {
        self.scopes
            .last_mut()
            .expect("scope stack is never empty")
            .insert(name.to_string(), id);
    }

    fn lookup_local(&self, name: &str) -> Option<LocalId> {
        for scope in self.scopes.iter().rev() {
            if let Some(&id) = scope.get(name) {
                return Some(id);
            }
        }
        None
    }

    fn enter_scope(&mut self) {
        self.scopes.push(HashMap::new());
    }

    fn exit_scope(&mut self) {
        self.scopes.pop();
    }

    // ==================== Statements ====================

    fn lower_block(&mut self, out: &mut Vec<Cmd>, block: &Block) {
        self.enter_scope();
        self.lower_block_stats(out, block);
        self.exit_scope();
    }

    fn lower_block_stats(&mut self, out: &mut Vec<Cmd>, block: &Block) {
        for stat in &block.stats {
            self.lower_stat(out, stat);
        }
    }

    fn lower_stat(&mut self, out: &mut Vec<Cmd>, stat: &Stat) {
        match &stat.kind {
            StatKind::Block(block) => self.lower_block(out, block),
            StatKind::Decl { decl, value } => {
                let ty = decl.ty.clone().unwrap_or(Type::Any);
                // The initializer sees the enclosing binding of the name
                let src = value.as_ref().map(|v| self.lower_exp(out, v));
                let id = self.fresh_local(&decl.name.name, ty, decl.name.span);
                self.bind(&decl.name.name, id);
                if let Some(src) = src {
                    out.push(Cmd::Move { dst: id, src });
                }
            }
            StatKind::Assign { target, value } => {
                let src = self.lower_exp(out, value);
                self.lower_assign(out, target, src);
            }
            StatKind::If {
                condition,
                then_block,
                else_branch,
            } => {
                let cond = self.lower_exp(out, condition);
                let mut then_cmds = Vec::new();
                self.lower_block(&mut then_cmds, then_block);
                let mut else_cmds = Vec::new();
                match else_branch {
                    Some(ElseBranch::Else(block)) => self.lower_block(&mut else_cmds, block),
                    Some(ElseBranch::Elseif(stat)) => self.lower_stat(&mut else_cmds, stat),
                    None => {}
                }
                out.push(Cmd::If {
                    cond,
                    then_cmds,
                    else_cmds,
                });
            }
            StatKind::While { condition, body } => {
                // while c do b end  =>  loop { if c then b else break } }
                let mut loop_body = Vec::new();
                let cond = self.lower_exp(&mut loop_body, condition);
                let mut then_cmds = Vec::new();
                self.lower_block(&mut then_cmds, body);
                loop_body.push(Cmd::If {
                    cond,
                    then_cmds,
                    else_cmds: vec![Cmd::Break],
                });
                out.push(Cmd::Loop { body: loop_body });
            }
            StatKind::Repeat { body, condition } => {
                // repeat b until c  =>  loop { b; if c then break } }
                // The condition sees the body's scope.
                self.enter_scope();
                let mut loop_body = Vec::new();
                self.lower_block_stats(&mut loop_body, body);
                let cond = self.lower_exp(&mut loop_body, condition);
                loop_body.push(Cmd::If {
                    cond,
                    then_cmds: vec![Cmd::Break],
                    else_cmds: Vec::new(),
                });
                self.exit_scope();
                out.push(Cmd::Loop { body: loop_body });
            }
            StatKind::For {
                decl,
                start,
                limit,
                step,
                body,
            } => {
                let ty = decl.ty.clone().unwrap_or(Type::Integer);
                let start_v = self.lower_exp(out, start);
                let limit_v = self.lower_exp(out, limit);
                let step_v = match step {
                    Some(step) => self.lower_exp(out, step),
                    None => match ty {
                        Type::Float => Value::Float(1.0),
                        _ => Value::Integer(1),
                    },
                };
                let var = self.fresh_local(&decl.name.name, ty.clone(), decl.name.span);
                self.enter_scope();
                self.bind(&decl.name.name, var);
                let mut loop_body = Vec::new();
                self.lower_block_stats(&mut loop_body, body);
                self.exit_scope();
                let cmd = if ty == Type::Float {
                    Cmd::ForNumFloat {
                        var,
                        start: start_v,
                        limit: limit_v,
                        step: step_v,
                        body: loop_body,
                    }
                } else {
                    Cmd::ForNumInt {
                        var,
                        start: start_v,
                        limit: limit_v,
                        step: step_v,
                        body: loop_body,
                    }
                };
                out.push(cmd);
            }
            StatKind::Break => out.push(Cmd::Break),
            StatKind::Return { values } => {
                let values = values.iter().map(|v| self.lower_exp(out, v)).collect();
                out.push(Cmd::Return { values });
            }
            StatKind::Call(exp) => {
                self.lower_call_discarding(out, exp);
            }
        }
    }

    fn lower_assign(&mut self, out: &mut Vec<Cmd>, target: &VarNode, src: Value) {
        match &target.kind {
            VarKind::Name(ident) => {
                if let Some(dst) = self.lookup_local(&ident.name) {
                    out.push(Cmd::Move { dst, src });
                } else if let Some(&global) = self.ml.global_ids.get(&ident.name) {
                    out.push(Cmd::SetGlobal { global, src });
                }
                // Assignments to constants were rejected by the checker
            }
            VarKind::Bracket { prefix, index } => {
                let elem_ty = match prefix.typ().clone() {
                    Type::Array(elem) => *elem,
                    _ => Type::Any,
                };
                let arr = self.lower_exp(out, prefix);
                let index = self.lower_exp(out, index);
                let line = self.ml.line(target.span);
                out.push(Cmd::SetArr {
                    arr,
                    index,
                    src,
                    elem_ty,
                    line,
                });
            }
            VarKind::Dot { prefix, field } => {
                let obj = self.lower_exp(out, prefix);
                let line = self.ml.line(target.span);
                out.push(Cmd::SetField {
                    obj,
                    field: field.name.clone(),
                    src,
                    line,
                });
            }
        }
    }

    /// Lower a call in statement position, discarding results
    fn lower_call_discarding(&mut self, out: &mut Vec<Cmd>, exp: &Exp) {
        let line = self.ml.line(exp.span);
        match &exp.kind {
            ExpKind::CallFunc { callee, args } => {
                if let Some(func) = self.direct_callee(callee) {
                    let args = args.iter().map(|a| self.lower_exp(out, a)).collect();
                    out.push(Cmd::CallStatic {
                        dsts: Vec::new(),
                        func,
                        args,
                        line,
                    });
                } else {
                    let func = self.lower_exp(out, callee);
                    let args = args.iter().map(|a| self.lower_exp(out, a)).collect();
                    out.push(Cmd::CallDyn {
                        dst: None,
                        func,
                        args,
                        line,
                    });
                }
            }
            ExpKind::CallMethod {
                receiver,
                method,
                args,
            } => {
                let obj = self.lower_exp(out, receiver);
                let args = args.iter().map(|a| self.lower_exp(out, a)).collect();
                out.push(Cmd::CallMethod {
                    dst: None,
                    obj,
                    method: method.name.clone(),
                    args,
                    line,
                });
            }
            _ => unreachable!("call statements are calls"),
        }
    }

    /// A directly-callable module function, when the callee is a name
    /// that is not shadowed by a local
    fn direct_callee(&self, callee: &Exp) -> Option<FunctionId> {
        let ExpKind::Var(VarNode {
            kind: VarKind::Name(ident),
            ..
        }) = &callee.kind
        else {
            return None;
        };
        if self.lookup_local(&ident.name).is_some() {
            return None;
        }
        self.ml.func_ids.get(&ident.name).copied()
    }

    // ==================== Expressions ====================

    /// Lower an expression, flattening it into fresh locals; the result
    /// is the value holding the expression
    fn lower_exp(&mut self, out: &mut Vec<Cmd>, exp: &Exp) -> Value {
        let line = self.ml.line(exp.span);
        match &exp.kind {
            ExpKind::Nil => Value::Nil,
            ExpKind::Bool(b) => Value::Bool(*b),
            ExpKind::Integer(i) => Value::Integer(*i),
            ExpKind::Float(f) => Value::Float(*f),
            ExpKind::String(s) => Value::String(s.clone()),

            ExpKind::Lambda(body) => {
                let func = self.ml.lower_lambda(body);
                let dst = self.fresh_temp(exp.typ().clone());
                out.push(Cmd::LoadFunction { dst, func });
                Value::Local(dst)
            }

            ExpKind::Initlist(entries) => self.lower_initlist(out, exp, entries, line),

            ExpKind::Cast {
                exp: inner, target, ..
            } => {
                let src = self.lower_exp(out, inner);
                let from = inner.typ().clone();
                let to = target.clone().expect("checker resolved cast target");
                let kind = match (&from, &to) {
                    _ if from == to => return src,
                    (Type::Integer, Type::Float) => ConvertKind::IntToFloat,
                    (Type::Float, Type::Integer) => ConvertKind::FloatToInt,
                    (_, Type::Any) => ConvertKind::ToAny(from.clone()),
                    (Type::Any, _) => ConvertKind::FromAny(to.clone()),
                    // Identity in representation; no conversion needed
                    _ => return src,
                };
                let dst = self.fresh_temp(to);
                out.push(Cmd::Convert {
                    dst,
                    kind,
                    src,
                    line,
                });
                Value::Local(dst)
            }

            ExpKind::Unop { op, exp: operand } => {
                let operand_ty = operand.typ().clone();
                let src = self.lower_exp(out, operand);
                let dst = self.fresh_temp(exp.typ().clone());
                out.push(Cmd::Unop {
                    dst,
                    op: *op,
                    operand_ty,
                    src,
                });
                Value::Local(dst)
            }

            ExpKind::Binop { op, lhs, rhs } => match op {
                Binop::And => self.lower_short_circuit(out, lhs, rhs, true),
                Binop::Or => self.lower_short_circuit(out, lhs, rhs, false),
                _ => {
                    let operand_ty = lhs.typ().clone();
                    let lhs = self.lower_exp(out, lhs);
                    let rhs = self.lower_exp(out, rhs);
                    let dst = self.fresh_temp(exp.typ().clone());
                    out.push(Cmd::Binop {
                        dst,
                        op: *op,
                        operand_ty,
                        lhs,
                        rhs,
                        line,
                    });
                    Value::Local(dst)
                }
            },

            ExpKind::Concat(parts) => {
                let srcs = parts.iter().map(|p| self.lower_exp(out, p)).collect();
                let dst = self.fresh_temp(Type::String);
                out.push(Cmd::Concat { dst, srcs });
                Value::Local(dst)
            }

            ExpKind::CallFunc { callee, args } => {
                if let Some(func) = self.direct_callee(callee) {
                    let args: Vec<Value> = args.iter().map(|a| self.lower_exp(out, a)).collect();
                    let rets = self.ml.functions[func].ret_types.clone();
                    let dsts: Vec<LocalId> =
                        rets.iter().map(|ty| self.fresh_temp(ty.clone())).collect();
                    let result = Value::Local(dsts[0]);
                    out.push(Cmd::CallStatic {
                        dsts,
                        func,
                        args,
                        line,
                    });
                    result
                } else {
                    let func = self.lower_exp(out, callee);
                    let args = args.iter().map(|a| self.lower_exp(out, a)).collect();
                    let dst = self.fresh_temp(exp.typ().clone());
                    out.push(Cmd::CallDyn {
                        dst: Some(dst),
                        func,
                        args,
                        line,
                    });
                    Value::Local(dst)
                }
            }

            ExpKind::CallMethod {
                receiver,
                method,
                args,
            } => {
                let obj = self.lower_exp(out, receiver);
                let args = args.iter().map(|a| self.lower_exp(out, a)).collect();
                let dst = self.fresh_temp(exp.typ().clone());
                out.push(Cmd::CallMethod {
                    dst: Some(dst),
                    obj,
                    method: method.name.clone(),
                    args,
                    line,
                });
                Value::Local(dst)
            }

            ExpKind::Var(var) => self.lower_var_read(out, exp, var, line),

            ExpKind::Paren(inner) => self.lower_exp(out, inner),
        }
    }

    fn lower_var_read(
        &mut self,
        out: &mut Vec<Cmd>,
        exp: &Exp,
        var: &VarNode,
        line: u32,
    ) -> Value {
        match &var.kind {
            VarKind::Name(ident) => {
                if let Some(id) = self.lookup_local(&ident.name) {
                    return Value::Local(id);
                }
                if let Some(&global) = self.ml.global_ids.get(&ident.name) {
                    let dst = self.fresh_temp(exp.typ().clone());
                    out.push(Cmd::GetGlobal { dst, global });
                    return Value::Local(dst);
                }
                if let Some(&func) = self.ml.func_ids.get(&ident.name) {
                    let dst = self.fresh_temp(exp.typ().clone());
                    out.push(Cmd::LoadFunction { dst, func });
                    return Value::Local(dst);
                }
                // Undeclared names never reach lowering
                Value::Nil
            }
            VarKind::Bracket { prefix, index } => {
                let arr = self.lower_exp(out, prefix);
                let index = self.lower_exp(out, index);
                let dst = self.fresh_temp(exp.typ().clone());
                out.push(Cmd::GetArr {
                    dst,
                    arr,
                    index,
                    elem_ty: exp.typ().clone(),
                    line,
                });
                Value::Local(dst)
            }
            VarKind::Dot { prefix, field } => {
                let obj = self.lower_exp(out, prefix);
                let dst = self.fresh_temp(exp.typ().clone());
                out.push(Cmd::GetField {
                    dst,
                    obj,
                    field: field.name.clone(),
                    field_ty: exp.typ().clone(),
                    line,
                });
                Value::Local(dst)
            }
        }
    }

    /// `a and b` / `a or b` as a branch writing a fresh boolean local
    fn lower_short_circuit(
        &mut self,
        out: &mut Vec<Cmd>,
        lhs: &Exp,
        rhs: &Exp,
        is_and: bool,
    ) -> Value {
        let dst = self.fresh_temp(Type::Boolean);
        let cond = self.lower_exp(out, lhs);
        let mut rhs_cmds = Vec::new();
        let rhs_v = self.lower_exp(&mut rhs_cmds, rhs);
        rhs_cmds.push(Cmd::Move { dst, src: rhs_v });
        let short = vec![Cmd::Move {
            dst,
            src: Value::Bool(!is_and),
        }];
        let (then_cmds, else_cmds) = if is_and {
            (rhs_cmds, short)
        } else {
            (short, rhs_cmds)
        };
        out.push(Cmd::If {
            cond,
            then_cmds,
            else_cmds,
        });
        Value::Local(dst)
    }

    fn lower_initlist(
        &mut self,
        out: &mut Vec<Cmd>,
        exp: &Exp,
        entries: &[InitEntry],
        line: u32,
    ) -> Value {
        let ty = exp.typ().clone();
        match &ty {
            Type::Array(elem) => {
                let dst = self.fresh_temp(ty.clone());
                out.push(Cmd::NewArray {
                    dst,
                    hint: entries.len(),
                });
                for (i, entry) in entries.iter().enumerate() {
                    let InitEntry::Positional(value) = entry else {
                        continue;
                    };
                    let src = self.lower_exp(out, value);
                    out.push(Cmd::SetArr {
                        arr: Value::Local(dst),
                        index: Value::Integer(i as i64 + 1),
                        src,
                        elem_ty: (**elem).clone(),
                        line,
                    });
                }
                Value::Local(dst)
            }
            Type::Record { id, .. } => {
                let dst = self.fresh_temp(ty.clone());
                out.push(Cmd::NewRecord { dst, rec: *id });
                self.lower_field_entries(out, dst, entries, line);
                Value::Local(dst)
            }
            Type::Table(_) => {
                let dst = self.fresh_temp(ty.clone());
                out.push(Cmd::NewTable { dst });
                self.lower_field_entries(out, dst, entries, line);
                Value::Local(dst)
            }
            // Ill-typed initializer lists never reach lowering
            _ => Value::Nil,
        }
    }

    fn lower_field_entries(
        &mut self,
        out: &mut Vec<Cmd>,
        dst: LocalId,
        entries: &[InitEntry],
        line: u32,
    ) {
        for entry in entries {
            let InitEntry::Named { name, value } = entry else {
                continue;
            };
            let src = self.lower_exp(out, value);
            out.push(Cmd::SetField {
                obj: Value::Local(dst),
                field: name.name.clone(),
                src,
                line,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::Parser;
    use crate::types::TypeChecker;

    fn lower(source: &str) -> Module {
        let mut program = Parser::parse_program(source).expect("parse");
        let check = TypeChecker::check_program(&mut program);
        assert!(check.is_ok(), "type errors: {:?}", check.errors);
        let index = LineIndex::new(source);
        lower_program(&program, &check, &index)
    }

    fn function<'m>(module: &'m Module, name: &str) -> &'m Function {
        module
            .functions
            .iter()
            .find(|f| f.name == name)
            .expect("function exists")
    }

    #[test]
    fn parameters_come_first_in_local_table() {
        let module = lower("function f(a: integer, b: float): integer return a end");
        let f = function(&module, "f");
        assert_eq!(f.param_count, 2);
        assert_eq!(f.locals[0].name, "a");
        assert_eq!(f.locals[0].ty, Type::Integer);
        assert_eq!(f.locals[1].name, "b");
        assert_eq!(f.locals[1].ty, Type::Float);
    }

    #[test]
    fn compound_expressions_flatten_into_temps() {
        let module = lower("function f(a: integer): integer return (a + 1) * 2 end");
        let f = function(&module, "f");
        // One temp for the add, one for the mul
        let binops = f
            .body
            .iter()
            .filter(|c| matches!(c, Cmd::Binop { .. }))
            .count();
        assert_eq!(binops, 2);
        assert!(f.locals.len() >= 3);
    }

    #[test]
    fn every_used_local_is_in_the_table() {
        let module = lower(
            "function f(n: integer): integer\n\
             local acc: integer = 0\n\
             for i = 1, n do acc = acc + i end\n\
             return acc\n\
             end",
        );
        let f = function(&module, "f");
        fn walk(cmds: &[Cmd], max: usize) {
            for cmd in cmds {
                if let Some(dst) = cmd.dst() {
                    assert!(dst < max);
                }
                match cmd {
                    Cmd::If {
                        then_cmds,
                        else_cmds,
                        ..
                    } => {
                        walk(then_cmds, max);
                        walk(else_cmds, max);
                    }
                    Cmd::Loop { body }
                    | Cmd::ForNumInt { body, .. }
                    | Cmd::ForNumFloat { body, .. } => walk(body, max),
                    _ => {}
                }
            }
        }
        walk(&f.body, f.locals.len());
    }

    #[test]
    fn while_becomes_loop_with_break() {
        let module = lower("function f() while true do end end");
        let f = function(&module, "f");
        let Cmd::Loop { body } = &f.body[0] else {
            panic!("expected loop, got {:?}", f.body[0])
        };
        let Cmd::If { else_cmds, .. } = body.last().unwrap() else {
            panic!("expected if at loop tail")
        };
        assert_eq!(else_cmds, &vec![Cmd::Break]);
    }

    #[test]
    fn integer_for_is_specialized() {
        let module = lower("function f() for i = 1, 10 do end end");
        let f = function(&module, "f");
        assert!(matches!(f.body[0], Cmd::ForNumInt { .. }));

        let module = lower("function f() for x = 1.0, 10.0 do end end");
        let f = function(&module, "f");
        assert!(matches!(f.body[0], Cmd::ForNumFloat { .. }));
    }

    #[test]
    fn short_circuit_becomes_branch_writing_boolean() {
        let module = lower("function f(a: boolean, b: boolean): boolean return a and b end");
        let f = function(&module, "f");
        let Cmd::If {
            then_cmds,
            else_cmds,
            ..
        } = &f.body[0]
        else {
            panic!("expected if, got {:?}", f.body[0])
        };
        assert!(matches!(then_cmds.last(), Some(Cmd::Move { .. })));
        assert_eq!(
            else_cmds,
            &vec![Cmd::Move {
                dst: 2,
                src: Value::Bool(false)
            }]
        );
    }

    #[test]
    fn implicit_casts_become_convert_commands() {
        let module = lower("function f(x: integer, y: float): float return x + y end");
        let f = function(&module, "f");
        assert!(f.body.iter().any(|c| matches!(
            c,
            Cmd::Convert {
                kind: ConvertKind::IntToFloat,
                ..
            }
        )));
    }

    #[test]
    fn array_access_is_a_checked_load() {
        let source = "function get(arr: {integer}, i: integer): integer\n\
                      return arr[i]\n\
                      end";
        let module = lower(source);
        let f = function(&module, "get");
        let get = f
            .body
            .iter()
            .find_map(|c| match c {
                Cmd::GetArr { elem_ty, line, .. } => Some((elem_ty.clone(), *line)),
                _ => None,
            })
            .expect("checked load");
        assert_eq!(get.0, Type::Integer);
        assert_eq!(get.1, 2);
    }

    #[test]
    fn direct_call_to_toplevel_function() {
        let module = lower(
            "function f(x: integer): integer return x end\n\
             function g(): integer return f(1) end",
        );
        let g = function(&module, "g");
        assert!(g
            .body
            .iter()
            .any(|c| matches!(c, Cmd::CallStatic { func: 0, .. })));
    }

    #[test]
    fn call_through_local_is_dynamic() {
        let module = lower(
            "function f(h: (integer) -> (integer)): integer\n\
             return h(1)\n\
             end",
        );
        let f = function(&module, "f");
        assert!(f.body.iter().any(|c| matches!(c, Cmd::CallDyn { .. })));
    }

    #[test]
    fn toplevel_vars_initialize_in_init_function() {
        let module = lower("local limit: integer = 100");
        let init = &module.functions[module.init];
        assert!(init
            .body
            .iter()
            .any(|c| matches!(c, Cmd::SetGlobal { global: 0, .. })));
        assert_eq!(module.globals[0].name, "limit");
    }

    #[test]
    fn lambda_is_lifted_to_module_function() {
        let module = lower(
            "function f(): (integer) -> (integer)\n\
             return function(x: integer): integer return x end\n\
             end",
        );
        assert!(module.functions.iter().any(|f| f.name == "lambda"));
        let f = function(&module, "f");
        assert!(f
            .body
            .iter()
            .any(|c| matches!(c, Cmd::LoadFunction { .. })));
    }

    #[test]
    fn exports_map_to_items() {
        let module = lower(
            "export function f() end\n\
             local function g() end\n\
             export limit: integer = 10",
        );
        assert_eq!(module.exports.len(), 2);
        assert_eq!(module.exports[0].name, "f");
        assert!(matches!(module.exports[0].item, ExportItem::Function(0)));
        assert!(matches!(module.exports[1].item, ExportItem::Global(0)));
    }
}
