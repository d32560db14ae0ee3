//! Type checker for the Pallene programming language
//!
//! Checking runs in passes over the program:
//!
//! 1. Collect record and typealias declarations into the type namespace
//!    (forward references between them are allowed).
//! 2. Expand every typealias, detecting cyclic chains, and resolve record
//!    field types.
//! 3. Collect top-level value declarations (functions, variables, imports)
//!    with their types into the module scope.
//! 4. Check every function body and annotated initializer, decorating the
//!    tree: every expression gets a type, and implicit conversions become
//!    explicit synthesized `Cast` nodes so later stages see homogeneous
//!    operand types.
//!
//! Errors are accumulated and returned in source order; checking never
//! stops at the first error.

use std::collections::HashMap;

use crate::ast::{
    Binop, Block, ElseBranch, Exp, ExpKind, FuncBody, InitEntry, Program, Stat, StatKind,
    ToplevelKind, TypeAnnotation, TypeKind, Unop, VarKind, VarNode, Visibility,
};
use crate::lexer::Span;

use super::{Declaration, Env, RecordId, RecordInfo, Type, TypeError, TypeErrorKind};

/// An exported top-level binding, in declaration order
#[derive(Debug, Clone, PartialEq)]
pub struct ExportInfo {
    /// Exported name
    pub name: String,
    /// Its type
    pub ty: Type,
}

/// Everything the checker produces besides the decorated tree
#[derive(Debug)]
pub struct CheckResult {
    /// Record layouts, indexed by `RecordId`
    pub records: Vec<RecordInfo>,
    /// Exported bindings in declaration order
    pub exports: Vec<ExportInfo>,
    /// All errors, in source order
    pub errors: Vec<TypeError>,
}

impl CheckResult {
    /// True when checking succeeded
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// State of a typealias during expansion
enum AliasSlot {
    Unresolved(TypeAnnotation),
    Resolving,
    Resolved(Type),
}

/// The Pallene type checker
pub struct TypeChecker {
    env: Env,
    errors: Vec<TypeError>,
    /// Record ids by name
    record_ids: HashMap<String, RecordId>,
    /// Record layouts, indexed by id
    records: Vec<RecordInfo>,
    /// Typealias expansion state
    aliases: HashMap<String, AliasSlot>,
    /// Return types of the enclosing functions, innermost last
    ret_stack: Vec<Vec<Type>>,
    /// Scope depth at which each enclosing function's locals begin.
    /// Used to reject lambdas capturing an outer function's locals.
    function_floor: Vec<usize>,
}

impl Default for TypeChecker {
    fn default() -> Self {
        Self::new()
    }
}

impl TypeChecker {
    /// Create a new checker
    #[must_use]
    pub fn new() -> Self {
        Self {
            env: Env::new(),
            errors: Vec::new(),
            record_ids: HashMap::new(),
            records: Vec::new(),
            aliases: HashMap::new(),
            ret_stack: Vec::new(),
            function_floor: Vec::new(),
        }
    }

    /// Check a program, decorating it in place
    pub fn check_program(program: &mut Program) -> CheckResult {
        let mut checker = TypeChecker::new();
        checker.collect_type_names(program);
        checker.resolve_type_declarations(program);
        checker.collect_values(program);
        checker.check_bodies(program);

        let mut errors = checker.errors;
        errors.sort_by_key(|e| e.span.start);
        CheckResult {
            records: checker.records,
            exports: collect_exports(program),
            errors,
        }
    }

    fn error(&mut self, kind: TypeErrorKind, span: Span) {
        self.errors.push(TypeError::new(kind, span));
    }

    // ==================== Type declarations ====================

    fn collect_type_names(&mut self, program: &Program) {
        for tl in &program.toplevels {
            match &tl.kind {
                ToplevelKind::Record(rec) => {
                    let name = rec.name.name.clone();
                    if self.record_ids.contains_key(&name) || self.aliases.contains_key(&name) {
                        self.error(TypeErrorKind::DuplicateName(name), rec.name.span);
                        continue;
                    }
                    let id = RecordId(self.records.len() as u32);
                    self.record_ids.insert(name.clone(), id);
                    self.records.push(RecordInfo {
                        name,
                        fields: Vec::new(),
                    });
                }
                ToplevelKind::Typealias(alias) => {
                    let name = alias.name.name.clone();
                    if self.record_ids.contains_key(&name) || self.aliases.contains_key(&name) {
                        self.error(TypeErrorKind::DuplicateName(name), alias.name.span);
                        continue;
                    }
                    self.aliases
                        .insert(name, AliasSlot::Unresolved(alias.annotation.clone()));
                }
                _ => {}
            }
        }
    }

    fn resolve_type_declarations(&mut self, program: &Program) {
        // Expand every alias; cycles surface here
        let names: Vec<String> = self.aliases.keys().cloned().collect();
        for name in names {
            self.resolve_alias(&name, Span::dummy());
        }

        // Resolve record field types (aliases are expanded by now)
        for tl in &program.toplevels {
            if let ToplevelKind::Record(rec) = &tl.kind {
                let Some(&id) = self.record_ids.get(&rec.name.name) else {
                    continue;
                };
                let mut fields = Vec::with_capacity(rec.fields.len());
                for (field, ann) in &rec.fields {
                    let ty = self.resolve_annotation(ann);
                    fields.push((field.name.clone(), ty));
                }
                self.records[id.0 as usize].fields = fields;
            }
        }
    }

    fn resolve_alias(&mut self, name: &str, use_span: Span) -> Type {
        match self.aliases.get_mut(name) {
            None => {
                self.error(TypeErrorKind::TypeNotDeclared(name.to_string()), use_span);
                Type::Any
            }
            Some(AliasSlot::Resolved(ty)) => ty.clone(),
            Some(AliasSlot::Resolving) => {
                self.error(TypeErrorKind::CyclicTypealias(name.to_string()), use_span);
                Type::Any
            }
            Some(slot @ AliasSlot::Unresolved(_)) => {
                let AliasSlot::Unresolved(ann) = std::mem::replace(slot, AliasSlot::Resolving)
                else {
                    unreachable!()
                };
                let ty = self.resolve_annotation(&ann);
                self.aliases
                    .insert(name.to_string(), AliasSlot::Resolved(ty.clone()));
                ty
            }
        }
    }

    /// Resolve a syntactic annotation into a fully expanded type.
    /// No `Typealias` survives this step.
    fn resolve_annotation(&mut self, ann: &TypeAnnotation) -> Type {
        match &ann.kind {
            TypeKind::Nil => Type::Nil,
            TypeKind::Boolean => Type::Boolean,
            TypeKind::Integer => Type::Integer,
            TypeKind::Float => Type::Float,
            TypeKind::String => Type::String,
            TypeKind::Any => Type::Any,
            TypeKind::Array(elem) => Type::array(self.resolve_annotation(elem)),
            TypeKind::Table(fields) => {
                let fields = fields
                    .iter()
                    .map(|f| (f.name.name.clone(), self.resolve_annotation(&f.ty)))
                    .collect();
                Type::Table(fields)
            }
            TypeKind::Function { params, rets } => {
                let params = params.iter().map(|p| self.resolve_annotation(p)).collect();
                let rets = rets.iter().map(|r| self.resolve_annotation(r)).collect();
                Type::Function { params, rets }
            }
            TypeKind::Name(ident) => {
                if let Some(&id) = self.record_ids.get(&ident.name) {
                    Type::Record {
                        id,
                        name: ident.name.clone(),
                    }
                } else if self.aliases.contains_key(&ident.name) {
                    self.resolve_alias(&ident.name, ident.span)
                } else {
                    self.error(
                        TypeErrorKind::TypeNotDeclared(ident.name.clone()),
                        ident.span,
                    );
                    Type::Any
                }
            }
        }
    }

    // ==================== Top-level values ====================

    fn collect_values(&mut self, program: &mut Program) {
        for tl in &mut program.toplevels {
            match &mut tl.kind {
                ToplevelKind::Func(func) => {
                    let ty = self.resolve_func_signature(&mut func.body);
                    self.declare_toplevel(&func.name.name, ty, false, func.name.span);
                }
                ToplevelKind::Var(var) => {
                    let ty = if let Some(ann) = &var.annotation {
                        self.resolve_annotation(&ann.clone())
                    } else {
                        // No annotation: infer from the initializer, which
                        // may only reference earlier declarations
                        self.check_exp(&mut var.value, None)
                    };
                    var.ty = Some(ty.clone());
                    self.declare_toplevel(&var.name.name, ty, true, var.name.span);
                }
                ToplevelKind::Import(imp) => {
                    self.declare_toplevel(&imp.name.name, Type::Any, false, imp.name.span);
                }
                ToplevelKind::Typealias(_) | ToplevelKind::Record(_) => {}
            }
        }
    }

    fn declare_toplevel(&mut self, name: &str, ty: Type, mutable: bool, span: Span) {
        if self.env.lookup_module(name).is_some() {
            self.error(TypeErrorKind::DuplicateName(name.to_string()), span);
        }
        self.env.declare(Declaration::new(name, ty, mutable, span));
    }

    /// Resolve parameter and return annotations of a function, decorating
    /// them, and produce the function's type
    fn resolve_func_signature(&mut self, body: &mut FuncBody) -> Type {
        let mut params = Vec::with_capacity(body.params.len());
        for param in &mut body.params {
            let ty = match &param.annotation {
                Some(ann) => self.resolve_annotation(&ann.clone()),
                // Unannotated parameters are dynamic, so translated
                // output remains checkable
                None => Type::Any,
            };
            param.ty = Some(ty.clone());
            params.push(ty);
        }
        let mut rets = Vec::with_capacity(body.ret_annotations.len());
        for ann in &body.ret_annotations.clone() {
            rets.push(self.resolve_annotation(ann));
        }
        body.ret_types = Some(rets.clone());
        Type::Function { params, rets }
    }

    // ==================== Bodies ====================

    fn check_bodies(&mut self, program: &mut Program) {
        for tl in &mut program.toplevels {
            match &mut tl.kind {
                ToplevelKind::Func(func) => {
                    self.check_func_body(&mut func.body);
                }
                ToplevelKind::Var(var) => {
                    // Unannotated initializers were already checked while
                    // collecting declarations
                    if var.annotation.is_some() {
                        let expected = var.ty.clone().expect("collected in previous pass");
                        self.check_exp_coerce(&mut var.value, &expected);
                    }
                }
                _ => {}
            }
        }
    }

    /// Check a function body whose signature is already resolved
    fn check_func_body(&mut self, body: &mut FuncBody) {
        let ret_types = body.ret_types.clone().expect("signature resolved");
        let must_return = !ret_types.is_empty();
        self.ret_stack.push(ret_types);
        self.env.enter_scope();
        self.function_floor.push(self.env.depth() - 1);

        for param in &body.params {
            let ty = param.ty.clone().expect("signature resolved");
            self.env
                .declare(Declaration::new(&param.name.name, ty, true, param.span));
        }
        self.check_block_stats(&mut body.block);
        if must_return && !block_always_returns(&body.block) {
            self.error(TypeErrorKind::MissingReturn, body.span);
        }

        self.function_floor.pop();
        self.env.exit_scope();
        self.ret_stack.pop();
    }

    fn check_block(&mut self, block: &mut Block) {
        self.env.enter_scope();
        self.check_block_stats(block);
        self.env.exit_scope();
    }

    fn check_block_stats(&mut self, block: &mut Block) {
        for stat in &mut block.stats {
            self.check_stat(stat);
        }
    }

    fn check_stat(&mut self, stat: &mut Stat) {
        match &mut stat.kind {
            StatKind::Block(block) => self.check_block(block),
            StatKind::Decl { decl, value } => {
                let ty = match (&decl.annotation, value) {
                    (Some(ann), Some(value)) => {
                        let ty = self.resolve_annotation(&ann.clone());
                        self.check_exp_coerce(value, &ty);
                        ty
                    }
                    (Some(ann), None) => self.resolve_annotation(&ann.clone()),
                    (None, Some(value)) => self.check_exp(value, None),
                    (None, None) => {
                        self.error(
                            TypeErrorKind::CannotInfer(decl.name.name.clone()),
                            decl.name.span,
                        );
                        Type::Any
                    }
                };
                decl.ty = Some(ty.clone());
                self.env
                    .declare(Declaration::new(&decl.name.name, ty, true, decl.name.span));
            }
            StatKind::Assign { target, value } => {
                let ty = self.check_var(target, true);
                self.check_exp_coerce(value, &ty);
            }
            StatKind::If {
                condition,
                then_block,
                else_branch,
            } => {
                self.check_exp_coerce(condition, &Type::Boolean);
                self.check_block(then_block);
                match else_branch {
                    Some(ElseBranch::Else(block)) => self.check_block(block),
                    Some(ElseBranch::Elseif(stat)) => self.check_stat(stat),
                    None => {}
                }
            }
            StatKind::While { condition, body } => {
                self.check_exp_coerce(condition, &Type::Boolean);
                self.check_block(body);
            }
            StatKind::Repeat { body, condition } => {
                // The until-condition sees the body's scope
                self.env.enter_scope();
                self.check_block_stats(body);
                self.check_exp_coerce(condition, &Type::Boolean);
                self.env.exit_scope();
            }
            StatKind::For {
                decl,
                start,
                limit,
                step,
                body,
            } => {
                let ty = match &decl.annotation {
                    Some(ann) => self.resolve_annotation(&ann.clone()),
                    None => self.check_exp(start, None),
                };
                let ty = if ty.is_numeric() {
                    ty
                } else {
                    self.error(
                        TypeErrorKind::TypeMismatch {
                            expected: Type::Integer,
                            found: ty,
                        },
                        decl.name.span,
                    );
                    Type::Integer
                };
                decl.ty = Some(ty.clone());
                if decl.annotation.is_some() {
                    self.check_exp_coerce(start, &ty);
                }
                self.check_exp_coerce(limit, &ty);
                if let Some(step) = step {
                    self.check_exp_coerce(step, &ty);
                }
                self.env.enter_scope();
                self.env
                    .declare(Declaration::new(&decl.name.name, ty, true, decl.name.span));
                self.check_block_stats(body);
                self.env.exit_scope();
            }
            StatKind::Break => {}
            StatKind::Return { values } => {
                let expected = self.ret_stack.last().cloned().unwrap_or_default();
                if values.len() != expected.len() {
                    self.error(
                        TypeErrorKind::ReturnArityMismatch {
                            expected: expected.len(),
                            found: values.len(),
                        },
                        stat.span,
                    );
                }
                for (value, ty) in values.iter_mut().zip(expected.iter()) {
                    self.check_exp_coerce(value, ty);
                }
            }
            StatKind::Call(exp) => {
                let span = exp.span;
                let rets = match &mut exp.kind {
                    ExpKind::CallFunc { callee, args } => self.check_call(callee, args, span),
                    ExpKind::CallMethod { receiver, args, .. } => {
                        self.check_method_call(receiver, args, span)
                    }
                    _ => unreachable!("parser only builds calls in statement position"),
                };
                exp.ty = Some(rets.into_iter().next().unwrap_or(Type::Nil));
            }
        }
    }

    // ==================== Expressions ====================

    /// Check an expression and then require it to have the given type,
    /// inserting implicit conversions where the rules allow them
    fn check_exp_coerce(&mut self, exp: &mut Exp, expected: &Type) {
        self.check_exp(exp, Some(expected));
        self.coerce(exp, expected);
    }

    /// Insert a synthesized cast when the found/expected pair admits an
    /// implicit conversion; report a mismatch otherwise.
    ///
    /// Implicit conversions: integer to float promotion, and conversions
    /// to and from `any` (checked at run time).
    fn coerce(&mut self, exp: &mut Exp, expected: &Type) {
        let found = exp.typ().clone();
        if found == *expected {
            return;
        }
        let convertible = matches!(
            (&found, expected),
            (Type::Integer, Type::Float) | (Type::Any, _) | (_, Type::Any)
        );
        if convertible {
            insert_cast(exp, expected.clone());
        } else {
            self.errors
                .push(TypeError::mismatch(expected.clone(), found, exp.span));
        }
    }

    /// Check an expression, decorating it and every subexpression with a
    /// type. `expected` only guides initializer lists; callers wanting a
    /// conversion use [`Self::check_exp_coerce`].
    fn check_exp(&mut self, exp: &mut Exp, expected: Option<&Type>) -> Type {
        let span = exp.span;
        let ty = match &mut exp.kind {
            ExpKind::Nil => Type::Nil,
            ExpKind::Bool(_) => Type::Boolean,
            ExpKind::Integer(_) => Type::Integer,
            ExpKind::Float(_) => Type::Float,
            ExpKind::String(_) => Type::String,
            ExpKind::Lambda(body) => {
                let ty = self.resolve_func_signature(body);
                self.check_func_body(body);
                ty
            }
            ExpKind::Initlist(entries) => self.check_initlist(entries, expected, span),
            ExpKind::Cast {
                exp: inner,
                annotation,
                target,
                ..
            } => {
                let from = self.check_exp(inner, None);
                let to = match annotation {
                    Some(ann) => self.resolve_annotation(&ann.clone()),
                    None => target.clone().unwrap_or(Type::Any),
                };
                let legal = from == to
                    || matches!(&from, Type::Any)
                    || matches!(&to, Type::Any)
                    || (from.is_numeric() && to.is_numeric());
                if !legal {
                    self.error(TypeErrorKind::InvalidCast { from, to: to.clone() }, span);
                }
                *target = Some(to.clone());
                to
            }
            ExpKind::Unop { op, exp: operand } => {
                let op = *op;
                self.check_unop(op, operand, span)
            }
            ExpKind::Binop { op, lhs, rhs } => {
                let op = *op;
                self.check_binop(op, lhs, rhs, span)
            }
            ExpKind::Concat(parts) => self.check_concat(parts, span),
            ExpKind::CallFunc { callee, args } => {
                let rets = self.check_call(callee, args, span);
                match rets.into_iter().next() {
                    Some(ty) => ty,
                    None => {
                        self.error(TypeErrorKind::NoReturnValue, span);
                        Type::Any
                    }
                }
            }
            ExpKind::CallMethod { receiver, args, .. } => {
                let rets = self.check_method_call(receiver, args, span);
                rets.into_iter().next().unwrap_or(Type::Any)
            }
            ExpKind::Var(var) => self.check_var(var, false),
            ExpKind::Paren(inner) => self.check_exp(inner, expected),
        };
        // A folded concat may already carry its type
        if exp.ty.is_none() {
            exp.ty = Some(ty.clone());
        }
        exp.ty.clone().unwrap()
    }

    fn check_var(&mut self, var: &mut VarNode, assigning: bool) -> Type {
        match &mut var.kind {
            VarKind::Name(ident) => match self.env.lookup(&ident.name) {
                Some((scope_index, decl)) => {
                    let ty = decl.ty.clone();
                    let mutable = decl.mutable;
                    let floor = self.function_floor.last().copied().unwrap_or(0);
                    if scope_index > 0 && scope_index < floor {
                        self.error(
                            TypeErrorKind::LambdaCapture(ident.name.clone()),
                            ident.span,
                        );
                    }
                    if assigning && !mutable {
                        self.error(TypeErrorKind::AssignToConst(ident.name.clone()), ident.span);
                    }
                    ty
                }
                None => {
                    self.error(TypeErrorKind::UndeclaredName(ident.name.clone()), ident.span);
                    Type::Any
                }
            },
            VarKind::Bracket { prefix, index } => {
                let prefix_ty = self.check_exp(prefix, None);
                match prefix_ty {
                    Type::Array(elem) => {
                        self.check_exp_coerce(index, &Type::Integer);
                        *elem
                    }
                    Type::Any => {
                        self.check_exp(index, None);
                        Type::Any
                    }
                    other => {
                        self.check_exp(index, None);
                        self.error(TypeErrorKind::NotIndexable(other), var.span);
                        Type::Any
                    }
                }
            }
            VarKind::Dot { prefix, field } => {
                let prefix_ty = self.check_exp(prefix, None);
                match &prefix_ty {
                    Type::Record { id, .. } => {
                        let info = &self.records[id.0 as usize];
                        match info.fields.iter().find(|(name, _)| *name == field.name) {
                            Some((_, ty)) => ty.clone(),
                            None => {
                                self.error(
                                    TypeErrorKind::NoSuchField {
                                        ty: prefix_ty.clone(),
                                        field: field.name.clone(),
                                    },
                                    field.span,
                                );
                                Type::Any
                            }
                        }
                    }
                    Type::Table(fields) => {
                        match fields.iter().find(|(name, _)| *name == field.name) {
                            Some((_, ty)) => ty.clone(),
                            None => {
                                self.error(
                                    TypeErrorKind::NoSuchField {
                                        ty: prefix_ty.clone(),
                                        field: field.name.clone(),
                                    },
                                    field.span,
                                );
                                Type::Any
                            }
                        }
                    }
                    Type::Any => Type::Any,
                    other => {
                        self.error(TypeErrorKind::NotIndexable(other.clone()), var.span);
                        Type::Any
                    }
                }
            }
        }
    }

    fn check_unop(&mut self, op: Unop, operand: &mut Exp, span: Span) -> Type {
        let ty = self.check_exp(operand, None);
        match op {
            Unop::Not => {
                if ty != Type::Boolean {
                    self.coerce(operand, &Type::Boolean);
                }
                Type::Boolean
            }
            Unop::Len => match ty {
                Type::Array(_) | Type::String => Type::Integer,
                other => {
                    self.error(
                        TypeErrorKind::InvalidUnop {
                            op: op.as_str(),
                            operand: other,
                        },
                        span,
                    );
                    Type::Integer
                }
            },
            Unop::Neg => match ty {
                Type::Integer => Type::Integer,
                Type::Float => Type::Float,
                other => {
                    self.error(
                        TypeErrorKind::InvalidUnop {
                            op: op.as_str(),
                            operand: other,
                        },
                        span,
                    );
                    Type::Integer
                }
            },
            Unop::BNot => {
                if ty != Type::Integer {
                    self.error(
                        TypeErrorKind::InvalidUnop {
                            op: op.as_str(),
                            operand: ty,
                        },
                        span,
                    );
                }
                Type::Integer
            }
        }
    }

    fn check_binop(&mut self, op: Binop, lhs: &mut Exp, rhs: &mut Exp, span: Span) -> Type {
        match op {
            Binop::Add | Binop::Sub | Binop::Mul | Binop::Mod | Binop::IntDiv => {
                self.check_arith(op, lhs, rhs, span, false)
            }
            // `/` and `^` always produce float
            Binop::Div | Binop::Pow => self.check_arith(op, lhs, rhs, span, true),
            Binop::BAnd | Binop::BOr | Binop::BXor | Binop::Shl | Binop::Shr => {
                let lt = self.check_exp(lhs, None);
                let rt = self.check_exp(rhs, None);
                if lt != Type::Integer || rt != Type::Integer {
                    self.error(
                        TypeErrorKind::InvalidBinop {
                            op: op.as_str(),
                            left: lt,
                            right: rt,
                        },
                        span,
                    );
                }
                Type::Integer
            }
            Binop::Eq | Binop::Ne => {
                let lt = self.check_exp(lhs, None);
                let rt = self.check_exp(rhs, None);
                match (&lt, &rt) {
                    _ if lt == rt => {}
                    // Numeric cross-kind comparison is by value
                    (Type::Integer, Type::Float) => insert_cast(lhs, Type::Float),
                    (Type::Float, Type::Integer) => insert_cast(rhs, Type::Float),
                    (Type::Any, _) => insert_cast(rhs, Type::Any),
                    (_, Type::Any) => insert_cast(lhs, Type::Any),
                    _ => {
                        self.error(
                            TypeErrorKind::InvalidBinop {
                                op: op.as_str(),
                                left: lt,
                                right: rt,
                            },
                            span,
                        );
                    }
                }
                Type::Boolean
            }
            Binop::Lt | Binop::Le | Binop::Gt | Binop::Ge => {
                let lt = self.check_exp(lhs, None);
                let rt = self.check_exp(rhs, None);
                match (&lt, &rt) {
                    (Type::Integer, Type::Integer)
                    | (Type::Float, Type::Float)
                    | (Type::String, Type::String) => {}
                    (Type::Integer, Type::Float) => insert_cast(lhs, Type::Float),
                    (Type::Float, Type::Integer) => insert_cast(rhs, Type::Float),
                    _ => {
                        self.error(
                            TypeErrorKind::InvalidBinop {
                                op: op.as_str(),
                                left: lt,
                                right: rt,
                            },
                            span,
                        );
                    }
                }
                Type::Boolean
            }
            Binop::And | Binop::Or => {
                // Strictly boolean: there is no truthy coercion
                self.check_exp_coerce(lhs, &Type::Boolean);
                self.check_exp_coerce(rhs, &Type::Boolean);
                Type::Boolean
            }
        }
    }

    /// Arithmetic typing: int op int is int, float op float is float, and
    /// mixed operands promote the integer side to float. When
    /// `force_float` is set the result (and both operands) are float.
    fn check_arith(
        &mut self,
        op: Binop,
        lhs: &mut Exp,
        rhs: &mut Exp,
        span: Span,
        force_float: bool,
    ) -> Type {
        let lt = self.check_exp(lhs, None);
        let rt = self.check_exp(rhs, None);
        match (&lt, &rt) {
            (Type::Integer, Type::Integer) => {
                if force_float {
                    insert_cast(lhs, Type::Float);
                    insert_cast(rhs, Type::Float);
                    Type::Float
                } else {
                    Type::Integer
                }
            }
            (Type::Float, Type::Float) => Type::Float,
            (Type::Integer, Type::Float) => {
                insert_cast(lhs, Type::Float);
                Type::Float
            }
            (Type::Float, Type::Integer) => {
                insert_cast(rhs, Type::Float);
                Type::Float
            }
            _ => {
                self.error(
                    TypeErrorKind::InvalidBinop {
                        op: op.as_str(),
                        left: lt,
                        right: rt,
                    },
                    span,
                );
                if force_float {
                    Type::Float
                } else {
                    Type::Integer
                }
            }
        }
    }

    /// Concatenation: flatten nested chains, fold adjacent string and
    /// integer literals, and require every part to be concatenable.
    fn check_concat(&mut self, parts: &mut Vec<Exp>, span: Span) -> Type {
        // Flatten nested concatenations
        let mut flat: Vec<Exp> = Vec::with_capacity(parts.len());
        for part in parts.drain(..) {
            if let ExpKind::Concat(inner) = part.kind {
                flat.extend(inner);
            } else {
                flat.push(part);
            }
        }

        // Fold runs of compile-time constants. Floats are left to the
        // runtime, which owns their string formatting.
        let mut folded: Vec<Exp> = Vec::with_capacity(flat.len());
        for mut part in flat {
            self.check_exp(&mut part, None);
            let literal = match &part.kind {
                ExpKind::String(s) => Some(s.clone()),
                ExpKind::Integer(i) => Some(i.to_string()),
                _ => None,
            };
            match (literal, folded.last_mut()) {
                (Some(text), Some(prev)) if matches!(prev.kind, ExpKind::String(_)) => {
                    let ExpKind::String(prev_text) = &mut prev.kind else {
                        unreachable!()
                    };
                    prev_text.push_str(&text);
                    prev.span = prev.span.merge(part.span);
                }
                (Some(text), _) => {
                    let mut lit = Exp::new(ExpKind::String(text), part.span);
                    lit.ty = Some(Type::String);
                    folded.push(lit);
                }
                (None, _) => {
                    let ty = part.typ().clone();
                    if !ty.is_concatenable() {
                        self.error(
                            TypeErrorKind::InvalidBinop {
                                op: "..",
                                left: Type::String,
                                right: ty,
                            },
                            span,
                        );
                    }
                    folded.push(part);
                }
            }
        }
        *parts = folded;
        Type::String
    }

    fn check_initlist(
        &mut self,
        entries: &mut [InitEntry],
        expected: Option<&Type>,
        span: Span,
    ) -> Type {
        let Some(expected) = expected else {
            self.error(TypeErrorKind::CannotInferInitlist, span);
            return Type::Any;
        };
        match expected.clone() {
            Type::Array(elem) => {
                for entry in entries.iter_mut() {
                    match entry {
                        InitEntry::Positional(exp) => self.check_exp_coerce(exp, &elem),
                        InitEntry::Named { name, .. } => {
                            self.error(
                                TypeErrorKind::ExtraField {
                                    ty: expected.clone(),
                                    field: name.name.clone(),
                                },
                                name.span,
                            );
                        }
                    }
                }
                expected.clone()
            }
            Type::Table(fields) => {
                self.check_field_initlist(entries, &fields, expected, span);
                expected.clone()
            }
            Type::Record { id, .. } => {
                let fields = self.records[id.0 as usize].fields.clone();
                self.check_field_initlist(entries, &fields, expected, span);
                expected.clone()
            }
            _ => {
                self.error(TypeErrorKind::CannotInferInitlist, span);
                Type::Any
            }
        }
    }

    fn check_field_initlist(
        &mut self,
        entries: &mut [InitEntry],
        fields: &[(String, Type)],
        expected: &Type,
        span: Span,
    ) {
        let mut seen: Vec<String> = Vec::new();
        for entry in entries.iter_mut() {
            match entry {
                InitEntry::Named { name, value } => {
                    match fields.iter().find(|(f, _)| *f == name.name) {
                        Some((_, ty)) => {
                            let ty = ty.clone();
                            self.check_exp_coerce(value, &ty);
                        }
                        None => {
                            self.error(
                                TypeErrorKind::ExtraField {
                                    ty: expected.clone(),
                                    field: name.name.clone(),
                                },
                                name.span,
                            );
                        }
                    }
                    seen.push(name.name.clone());
                }
                InitEntry::Positional(exp) => {
                    self.error(TypeErrorKind::CannotInferInitlist, exp.span);
                }
            }
        }
        for (field, _) in fields {
            if !seen.contains(field) {
                self.error(
                    TypeErrorKind::MissingField {
                        ty: expected.clone(),
                        field: field.clone(),
                    },
                    span,
                );
            }
        }
    }

    fn check_call(&mut self, callee: &mut Exp, args: &mut [Exp], span: Span) -> Vec<Type> {
        let callee_ty = self.check_exp(callee, None);
        match callee_ty {
            Type::Function { params, rets } => {
                if args.len() != params.len() {
                    self.error(
                        TypeErrorKind::WrongArity {
                            expected: params.len(),
                            found: args.len(),
                        },
                        span,
                    );
                }
                for (i, (arg, expected)) in args.iter_mut().zip(params.iter()).enumerate() {
                    let found = self.check_exp(arg, Some(expected));
                    if found == *expected {
                        continue;
                    }
                    let convertible = matches!(
                        (&found, expected),
                        (Type::Integer, Type::Float) | (Type::Any, _) | (_, Type::Any)
                    );
                    if convertible {
                        insert_cast(arg, expected.clone());
                    } else {
                        self.error(
                            TypeErrorKind::ArgumentTypeMismatch {
                                name: format!("#{}", i + 1),
                                expected: expected.clone(),
                                found,
                            },
                            arg.span,
                        );
                    }
                }
                rets
            }
            // Dynamic calls go through the host call protocol
            Type::Any => {
                for arg in args.iter_mut() {
                    self.check_exp(arg, None);
                }
                vec![Type::Any]
            }
            other => {
                for arg in args.iter_mut() {
                    self.check_exp(arg, None);
                }
                self.error(TypeErrorKind::NotCallable(other), span);
                vec![Type::Any]
            }
        }
    }

    fn check_method_call(&mut self, receiver: &mut Exp, args: &mut [Exp], span: Span) -> Vec<Type> {
        let recv_ty = self.check_exp(receiver, None);
        for arg in args.iter_mut() {
            self.check_exp(arg, None);
        }
        if recv_ty != Type::Any {
            self.error(TypeErrorKind::MethodCallOnTypedValue, span);
        }
        vec![Type::Any]
    }
}

/// Wrap an expression in a synthesized cast to `target`.
///
/// Synthesized casts have no annotation and a dummy strip span, so the
/// translator never touches them.
fn insert_cast(exp: &mut Exp, target: Type) {
    let span = exp.span;
    let inner = std::mem::replace(exp, Exp::new(ExpKind::Nil, span));
    *exp = Exp {
        kind: ExpKind::Cast {
            exp: Box::new(inner),
            annotation: None,
            strip_span: Span::dummy(),
            target: Some(target.clone()),
        },
        span,
        ty: Some(target),
    };
}

/// Conservative check that every path through the block ends in `return`
fn block_always_returns(block: &Block) -> bool {
    block.stats.last().is_some_and(stat_always_returns)
}

fn stat_always_returns(stat: &Stat) -> bool {
    match &stat.kind {
        StatKind::Return { .. } => true,
        StatKind::Block(block) => block_always_returns(block),
        StatKind::If {
            then_block,
            else_branch: Some(else_branch),
            ..
        } => {
            block_always_returns(then_block)
                && match else_branch {
                    ElseBranch::Else(block) => block_always_returns(block),
                    ElseBranch::Elseif(stat) => stat_always_returns(stat),
                }
        }
        _ => false,
    }
}

/// Exported bindings in declaration order
fn collect_exports(program: &Program) -> Vec<ExportInfo> {
    let mut exports = Vec::new();
    for tl in &program.toplevels {
        match &tl.kind {
            ToplevelKind::Func(func) if func.visibility == Visibility::Export => {
                let params = func
                    .body
                    .params
                    .iter()
                    .map(|p| p.ty.clone().unwrap_or(Type::Any))
                    .collect();
                let rets = func.body.ret_types.clone().unwrap_or_default();
                exports.push(ExportInfo {
                    name: func.name.name.clone(),
                    ty: Type::Function { params, rets },
                });
            }
            ToplevelKind::Var(var) if var.visibility == Visibility::Export => {
                exports.push(ExportInfo {
                    name: var.name.name.clone(),
                    ty: var.ty.clone().unwrap_or(Type::Any),
                });
            }
            _ => {}
        }
    }
    exports
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::Parser;

    fn check(source: &str) -> (Program, CheckResult) {
        let mut program = Parser::parse_program(source).expect("program should parse");
        let result = TypeChecker::check_program(&mut program);
        (program, result)
    }

    fn check_ok(source: &str) -> Program {
        let (program, result) = check(source);
        assert!(
            result.is_ok(),
            "unexpected type errors: {:?}",
            result.errors
        );
        program
    }

    fn check_errs(source: &str) -> Vec<TypeError> {
        let (_, result) = check(source);
        assert!(!result.is_ok(), "expected type errors");
        result.errors
    }

    fn first_func(program: &Program) -> &crate::ast::FuncDecl {
        for tl in &program.toplevels {
            if let ToplevelKind::Func(f) = &tl.kind {
                return f;
            }
        }
        panic!("no function in program")
    }

    #[test]
    fn every_expression_gets_a_type() {
        let program = check_ok("function f(x: integer): integer return x + 1 end");
        let func = first_func(&program);
        let StatKind::Return { values } = &func.body.block.stats[0].kind else {
            panic!("expected return")
        };
        assert_eq!(values[0].typ(), &Type::Integer);
    }

    #[test]
    fn mixed_arithmetic_inserts_cast_on_integer_side() {
        let program = check_ok("function f(x: integer, y: float): float return x + y end");
        let func = first_func(&program);
        let StatKind::Return { values } = &func.body.block.stats[0].kind else {
            panic!("expected return")
        };
        let ExpKind::Binop { lhs, rhs, .. } = &values[0].kind else {
            panic!("expected binop")
        };
        // Both operand slots are float after checking
        assert!(matches!(lhs.kind, ExpKind::Cast { .. }));
        assert_eq!(lhs.typ(), &Type::Float);
        assert_eq!(rhs.typ(), &Type::Float);
    }

    #[test]
    fn division_always_produces_float() {
        let program = check_ok("function f(x: integer): float return x / 2 end");
        let func = first_func(&program);
        let StatKind::Return { values } = &func.body.block.stats[0].kind else {
            panic!("expected return")
        };
        assert_eq!(values[0].typ(), &Type::Float);
    }

    #[test]
    fn floor_division_preserves_integer() {
        check_ok("function f(x: integer): integer return x // 2 end");
    }

    #[test]
    fn bitwise_requires_integers() {
        let errors = check_errs("function f(x: float): integer return x & 1 end");
        assert!(errors
            .iter()
            .any(|e| matches!(e.kind, TypeErrorKind::InvalidBinop { op: "&", .. })));
    }

    #[test]
    fn undeclared_type_is_reported() {
        let errors = check_errs("function f(p: Pointt) end");
        let msg = errors[0].kind.to_string();
        assert_eq!(msg, "type 'Pointt' is not declared");
    }

    #[test]
    fn typealias_cycle_is_reported() {
        let errors = check_errs("typealias A = B\ntypealias B = A");
        assert!(errors
            .iter()
            .any(|e| matches!(e.kind, TypeErrorKind::CyclicTypealias(_))));
    }

    #[test]
    fn typealias_expands_structurally() {
        check_ok(
            "typealias Ints = {integer}\n\
             function sum(xs: Ints): integer\n\
             local acc: integer = 0\n\
             for i = 1, #xs do acc = acc + xs[i] end\n\
             return acc\n\
             end",
        );
    }

    #[test]
    fn record_fields_are_nominal() {
        check_ok(
            "record Point x: float y: float end\n\
             function get_x(p: Point): float return p.x end",
        );
        let errors = check_errs(
            "record Point x: float y: float end\n\
             function get_z(p: Point): float return p.z end",
        );
        assert!(errors
            .iter()
            .any(|e| matches!(e.kind, TypeErrorKind::NoSuchField { .. })));
    }

    #[test]
    fn return_arity_is_checked() {
        let errors = check_errs("function f(): integer return end");
        assert!(errors.iter().any(|e| matches!(
            e.kind,
            TypeErrorKind::ReturnArityMismatch {
                expected: 1,
                found: 0
            }
        )));
        let errors = check_errs("function f() return 1 end");
        assert!(errors.iter().any(|e| matches!(
            e.kind,
            TypeErrorKind::ReturnArityMismatch {
                expected: 0,
                found: 1
            }
        )));
    }

    #[test]
    fn call_arity_must_match_exactly() {
        let errors = check_errs(
            "function f(x: integer): integer return x end\n\
             function g(): integer return f(1, 2) end",
        );
        assert!(errors.iter().any(|e| matches!(
            e.kind,
            TypeErrorKind::WrongArity {
                expected: 1,
                found: 2
            }
        )));
    }

    #[test]
    fn call_arguments_promote_integer_to_float() {
        let program = check_ok(
            "function f(x: float): float return x end\n\
             function g(): float return f(1) end",
        );
        let ToplevelKind::Func(g) = &program.toplevels[1].kind else {
            panic!("expected function")
        };
        let StatKind::Return { values } = &g.body.block.stats[0].kind else {
            panic!("expected return")
        };
        let ExpKind::CallFunc { args, .. } = &values[0].kind else {
            panic!("expected call")
        };
        assert!(matches!(args[0].kind, ExpKind::Cast { .. }));
    }

    #[test]
    fn initlist_requires_context_type() {
        let errors = check_errs("function f() local x = {1, 2, 3} end");
        assert!(errors
            .iter()
            .any(|e| e.kind == TypeErrorKind::CannotInferInitlist));
        check_ok("function f() local x: {integer} = {1, 2, 3} end");
    }

    #[test]
    fn record_initlist_checks_fields() {
        let errors = check_errs(
            "record Point x: float y: float end\n\
             function f() local p: Point = {x = 1.0} end",
        );
        assert!(errors
            .iter()
            .any(|e| matches!(e.kind, TypeErrorKind::MissingField { .. })));
    }

    #[test]
    fn cast_rules() {
        check_ok("function f(x: any): integer return x as integer end");
        check_ok("function f(x: integer): float return x as float end");
        check_ok("function f(x: integer): any return x as any end");
        let errors = check_errs("function f(x: string): integer return x as integer end");
        assert!(errors
            .iter()
            .any(|e| matches!(e.kind, TypeErrorKind::InvalidCast { .. })));
    }

    #[test]
    fn and_or_are_strictly_boolean() {
        let errors = check_errs("function f(x: integer): boolean return x and true end");
        assert!(!errors.is_empty());
        check_ok("function f(a: boolean, b: boolean): boolean return a and b end");
    }

    #[test]
    fn concat_folds_literal_runs() {
        let program = check_ok(r#"function f(): string return "a" .. "b" .. 10 end"#);
        let func = first_func(&program);
        let StatKind::Return { values } = &func.body.block.stats[0].kind else {
            panic!("expected return")
        };
        let ExpKind::Concat(parts) = &values[0].kind else {
            panic!("expected concat, got {:?}", values[0].kind)
        };
        assert_eq!(parts.len(), 1);
        assert!(matches!(&parts[0].kind, ExpKind::String(s) if s == "ab10"));
    }

    #[test]
    fn lambda_capture_of_local_is_rejected() {
        let errors = check_errs(
            "function f(): (integer) -> (integer)\n\
             local y: integer = 1\n\
             return function(x: integer): integer return x + y end\n\
             end",
        );
        assert!(errors
            .iter()
            .any(|e| matches!(e.kind, TypeErrorKind::LambdaCapture(_))));
    }

    #[test]
    fn lambda_may_reference_toplevel() {
        check_ok(
            "local base: integer = 10\n\
             function f(): (integer) -> (integer)\n\
             return function(x: integer): integer return x + base end\n\
             end",
        );
    }

    #[test]
    fn assigning_to_function_name_is_rejected() {
        let errors = check_errs("function f() end\nfunction g() f = 1 end");
        assert!(errors
            .iter()
            .any(|e| matches!(e.kind, TypeErrorKind::AssignToConst(_))));
    }

    #[test]
    fn duplicate_toplevels_are_name_errors() {
        let errors = check_errs("function f() end\nfunction f() end");
        let err = errors
            .iter()
            .find(|e| matches!(e.kind, TypeErrorKind::DuplicateName(_)))
            .unwrap();
        assert_eq!(err.category(), "name");
    }

    #[test]
    fn exports_are_collected_in_declaration_order() {
        let (_, result) = check(
            "export function b(): integer return 1 end\n\
             local function hidden() end\n\
             export a: integer = 2",
        );
        assert!(result.is_ok(), "{:?}", result.errors);
        let names: Vec<_> = result.exports.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["b", "a"]);
    }

    #[test]
    fn repeat_condition_sees_body_scope() {
        check_ok(
            "function f()\n\
             repeat local done: boolean = true until done\n\
             end",
        );
    }

    #[test]
    fn numeric_for_requires_numeric_bounds() {
        check_ok("function f() for i = 1, 10 do end end");
        check_ok("function f() for x = 1.0, 10.0, 0.5 do end end");
        let errors = check_errs(r#"function f() for i = "a", "b" do end end"#);
        assert!(!errors.is_empty());
    }

    #[test]
    fn errors_are_sorted_by_source_position() {
        let errors = check_errs(
            "function f(): integer return g() end\n\
             function h(): integer return i() end",
        );
        for pair in errors.windows(2) {
            assert!(pair[0].span.start <= pair[1].span.start);
        }
    }
}
