// ABOUTME: Symbol resolution, type inference, and type-compatibility checking over the AST

use crate::ast::{
    BinOp, CaseLabelValue, CompilationUnit, Declaration, Expr, FileOp, LValue, ParamGroup,
    Program, RecordField, Stmt, Unit,
};
use crate::builtins;
use crate::error::SemanticError;
use std::collections::HashMap;

/// Inferred type of an expression or declared variable. `Auto` is the
/// polymorphic placeholder assigned to `abs`/`sqr`; `Unknown`
/// marks an expression whose type could not be determined because an
/// earlier error was already reported for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Type {
    Integer,
    Real,
    Str,
    Boolean,
    Nil,
    Named(String),
    Pointer(Box<Type>),
    Set(Box<Type>),
    Array { elem: Box<Type>, dims: usize },
    Auto,
    Unknown,
}

impl Type {
    pub fn from_name(name: &str) -> Type {
        match name.to_lowercase().as_str() {
            "integer" => Type::Integer,
            "real" => Type::Real,
            "string" => Type::Str,
            "boolean" => Type::Boolean,
            _ if name.starts_with('^') => Type::Pointer(Box::new(Type::from_name(&name[1..]))),
            _ => Type::Named(name.to_string()),
        }
    }

    pub fn display(&self) -> String {
        match self {
            Type::Integer => "integer".to_string(),
            Type::Real => "real".to_string(),
            Type::Str => "string".to_string(),
            Type::Boolean => "boolean".to_string(),
            Type::Nil => "nil".to_string(),
            Type::Named(n) => n.clone(),
            Type::Pointer(t) => format!("^{}", t.display()),
            Type::Set(t) => format!("set of {}", t.display()),
            Type::Array { elem, dims } => format!("array[{dims}] of {}", elem.display()),
            Type::Auto => "auto".to_string(),
            Type::Unknown => "unknown".to_string(),
        }
    }

    fn is_numeric(&self) -> bool {
        matches!(self, Type::Integer | Type::Real | Type::Auto)
    }

    /// Compatibility rule: equal canonical names, `unknown`
    /// universally compatible, `integer` widens to `real`, `nil` assigns to
    /// any pointer, same-element sets compatible, `auto` unifies with any
    /// numeric type.
    pub fn compatible(&self, other: &Type) -> bool {
        match (self, other) {
            (a, b) if a == b => true,
            (Type::Unknown, _) | (_, Type::Unknown) => true,
            (Type::Integer, Type::Real) => true,
            (Type::Nil, Type::Pointer(_)) | (Type::Pointer(_), Type::Nil) => true,
            (Type::Set(a), Type::Set(b)) => a == b,
            (Type::Auto, b) => b.is_numeric(),
            (a, Type::Auto) => a.is_numeric(),
            _ => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ArrayTypeInfo {
    pub dimensions: Vec<(i64, i64)>,
    pub elem_type: Type,
}

#[derive(Debug, Clone)]
pub struct FunctionInfo {
    pub params: Vec<(String, bool, Type)>,
    pub return_type: Option<Type>,
}

#[derive(Debug, Clone, Default)]
pub struct RecordTypeInfo {
    pub fields: Vec<RecordField>,
}

/// One level of the analyzer's symbol tables. A fresh scope is pushed for
/// each procedure/function body and popped when analysis of that body ends,
/// per the saved-and-restored symbol-table scope discipline below.
#[derive(Debug, Clone, Default)]
struct Scope {
    scalars: HashMap<String, Type>,
    arrays: HashMap<String, ArrayTypeInfo>,
    record_vars: HashMap<String, String>,
    pointer_vars: HashMap<String, String>,
    set_vars: HashMap<String, Type>,
    file_vars: HashMap<String, bool>,
}

pub struct Analyzer {
    scopes: Vec<Scope>,
    record_types: HashMap<String, RecordTypeInfo>,
    enum_types: HashMap<String, Vec<String>>,
    enum_values: HashMap<String, String>,
    procedures: HashMap<String, FunctionInfo>,
    functions: HashMap<String, FunctionInfo>,
    /// Active `with` record variables, innermost last. Lexically scoped: a
    /// nested procedure/function body is a separate lexical scope and does
    /// not see the enclosing body's `with`.
    with_stack: Vec<String>,
    errors: Vec<SemanticError>,
}

fn ci(name: &str) -> String {
    name.to_lowercase()
}

impl Analyzer {
    pub fn new() -> Self {
        Analyzer {
            scopes: vec![Scope::default()],
            record_types: HashMap::new(),
            enum_types: HashMap::new(),
            enum_values: HashMap::new(),
            procedures: HashMap::new(),
            functions: HashMap::new(),
            with_stack: Vec::new(),
            errors: Vec::new(),
        }
    }

    fn push_scope(&mut self) {
        self.scopes.push(Scope::default());
    }

    fn pop_scope(&mut self) {
        self.scopes.pop();
    }

    fn current_scope_mut(&mut self) -> &mut Scope {
        self.scopes.last_mut().expect("at least one scope")
    }

    fn error(&mut self, e: SemanticError) {
        self.errors.push(e);
    }

    fn lookup_scalar(&self, name: &str) -> Option<&Type> {
        let key = ci(name);
        self.scopes.iter().rev().find_map(|s| s.scalars.get(&key))
    }

    fn lookup_array(&self, name: &str) -> Option<&ArrayTypeInfo> {
        let key = ci(name);
        self.scopes.iter().rev().find_map(|s| s.arrays.get(&key))
    }

    fn lookup_record_var(&self, name: &str) -> Option<&str> {
        let key = ci(name);
        self.scopes
            .iter()
            .rev()
            .find_map(|s| s.record_vars.get(&key).map(String::as_str))
    }

    fn lookup_pointer_var(&self, name: &str) -> Option<&str> {
        let key = ci(name);
        self.scopes
            .iter()
            .rev()
            .find_map(|s| s.pointer_vars.get(&key).map(String::as_str))
    }

    fn lookup_set_var(&self, name: &str) -> Option<&Type> {
        let key = ci(name);
        self.scopes.iter().rev().find_map(|s| s.set_vars.get(&key))
    }

    fn lookup_file_var(&self, name: &str) -> bool {
        let key = ci(name);
        self.scopes.iter().rev().any(|s| s.file_vars.contains_key(&key))
    }

    /// Finds the innermost active `with` record whose type declares a field
    /// named `name`, returning that record variable's name.
    fn resolve_with_field(&self, name: &str) -> Option<&str> {
        self.with_stack.iter().rev().find_map(|record| {
            let type_name = self.lookup_record_var(record)?;
            let info = self.record_types.get(&ci(type_name))?;
            info.fields
                .iter()
                .any(|f| f.name.eq_ignore_ascii_case(name))
                .then_some(record.as_str())
        })
    }

    fn is_known_name(&self, name: &str) -> bool {
        let key = ci(name);
        self.lookup_scalar(name).is_some()
            || self.lookup_array(name).is_some()
            || self.lookup_record_var(name).is_some()
            || self.lookup_pointer_var(name).is_some()
            || self.lookup_set_var(name).is_some()
            || self.lookup_file_var(name)
            || self.enum_values.contains_key(&key)
            || self.procedures.contains_key(&key)
            || self.functions.contains_key(&key)
    }

    fn is_known_type(&self, name: &str) -> bool {
        matches!(
            name.to_lowercase().as_str(),
            "integer" | "real" | "string" | "boolean"
        ) || self.record_types.contains_key(&ci(name))
            || self.enum_types.contains_key(&ci(name))
    }

    /// Entry point for a whole program: runs the registration and body
    /// analysis passes in registration order, then returns
    /// whatever diagnostics were accumulated (empty on success).
    pub fn analyze_program(program: &Program) -> Vec<SemanticError> {
        Self::analyze_program_with_units(program, &[])
    }

    /// Same as `analyze_program`, but first registers the interface
    /// declarations of every unit the program `uses`, so calls to a unit's
    /// exported procedures/functions resolve instead of reporting a false
    /// `UndeclaredName`. Units are checked independently by `analyze_unit`;
    /// only their public interface is visible here, matching how a caller
    /// of a separately compiled unit only sees its signatures.
    pub fn analyze_program_with_units(program: &Program, units: &[&Unit]) -> Vec<SemanticError> {
        let mut a = Analyzer::new();
        for unit in units {
            a.register_decls(&unit.interface_decls);
        }
        a.register_decls(&program.decls);
        a.analyze_bodies(&program.decls);
        a.analyze_stmt(&program.body);
        a.errors
    }

    /// Entry point for a unit: registers interface types/vars, matches each
    /// interface header with its implementation body by case-insensitive
    /// name, then analyzes implementation bodies and init/finalization.
    pub fn analyze_unit(unit: &Unit) -> Vec<SemanticError> {
        Self::analyze_unit_with_units(unit, &[])
    }

    /// Same as `analyze_unit`, but first registers the interface of every
    /// unit this unit itself `uses`.
    pub fn analyze_unit_with_units(unit: &Unit, deps: &[&Unit]) -> Vec<SemanticError> {
        let mut a = Analyzer::new();
        for dep in deps {
            a.register_decls(&dep.interface_decls);
        }
        a.register_decls(&unit.interface_decls);
        a.register_decls(&unit.impl_decls);
        a.analyze_bodies(&unit.impl_decls);
        if let Some(init) = &unit.initialization {
            a.analyze_stmt(init);
        }
        if let Some(fin) = &unit.finalization {
            a.analyze_stmt(fin);
        }
        a.errors
    }

    pub fn analyze(unit: &CompilationUnit) -> Vec<SemanticError> {
        match unit {
            CompilationUnit::Program(p) => Analyzer::analyze_program(p),
            CompilationUnit::Unit(u) => Analyzer::analyze_unit(u),
        }
    }

    /// Registers types first (records, enums), then variables of every
    /// kind, then procedures/functions (recursing into nested ones) —
    /// exactly the order needed so later declarations can
    /// reference earlier record/enum types.
    fn register_decls(&mut self, decls: &[Declaration]) {
        for d in decls {
            if let Declaration::RecordType { name, fields } = d {
                self.register_record_type(name, fields);
            }
        }
        for d in decls {
            if let Declaration::EnumType { name, values } = d {
                self.register_enum_type(name, values);
            }
        }
        for d in decls {
            match d {
                Declaration::RecordType { .. } | Declaration::EnumType { .. } => {}
                _ => self.register_var_decl(d),
            }
        }
        for d in decls {
            match d {
                Declaration::Procedure { name, params, nested, .. } => {
                    self.register_subprogram(name, params, None, false);
                    self.register_decls(nested);
                }
                Declaration::Function { name, params, return_type, nested, .. } => {
                    self.register_subprogram(name, params, Some(return_type.as_str()), true);
                    self.register_decls(nested);
                }
                _ => {}
            }
        }
    }

    fn register_record_type(&mut self, name: &str, fields: &[RecordField]) {
        let key = ci(name);
        if self.record_types.contains_key(&key) || self.enum_types.contains_key(&key) {
            self.error(SemanticError::DuplicateDeclaration {
                kind: "type",
                name: name.to_string(),
            });
            return;
        }
        self.record_types.insert(key, RecordTypeInfo { fields: fields.to_vec() });
    }

    fn register_enum_type(&mut self, name: &str, values: &[String]) {
        let key = ci(name);
        if self.record_types.contains_key(&key) || self.enum_types.contains_key(&key) {
            self.error(SemanticError::DuplicateDeclaration {
                kind: "type",
                name: name.to_string(),
            });
            return;
        }
        for v in values {
            let vkey = ci(v);
            if self.enum_values.contains_key(&vkey) {
                self.error(SemanticError::DuplicateDeclaration {
                    kind: "enum value",
                    name: v.clone(),
                });
                continue;
            }
            self.enum_values.insert(vkey, key.clone());
        }
        self.enum_types.insert(key, values.to_vec());
    }

    fn declare_scalar(&mut self, name: &str, ty: Type) {
        let key = ci(name);
        if self.current_scope_mut().scalars.contains_key(&key) {
            self.error(SemanticError::DuplicateDeclaration {
                kind: "variable",
                name: name.to_string(),
            });
            return;
        }
        self.current_scope_mut().scalars.insert(key, ty);
    }

    fn register_var_decl(&mut self, d: &Declaration) {
        match d {
            Declaration::Const { name, value } => {
                let ty = self.infer_expr(value);
                self.declare_scalar(name, ty);
            }
            Declaration::Var { names, type_name } => {
                if self.enum_types.contains_key(&ci(type_name)) {
                    for n in names {
                        self.declare_scalar(n, Type::Named(type_name.clone()));
                    }
                } else if self.record_types.contains_key(&ci(type_name)) {
                    for n in names {
                        let key = ci(n);
                        if self.current_scope_mut().record_vars.contains_key(&key) {
                            self.error(SemanticError::DuplicateDeclaration {
                                kind: "variable",
                                name: n.clone(),
                            });
                            continue;
                        }
                        self.current_scope_mut()
                            .record_vars
                            .insert(key, type_name.clone());
                    }
                } else if !self.is_known_type(type_name) {
                    self.error(SemanticError::UnknownType(type_name.clone()));
                    for n in names {
                        self.declare_scalar(n, Type::Unknown);
                    }
                } else {
                    for n in names {
                        self.declare_scalar(n, Type::from_name(type_name));
                    }
                }
            }
            Declaration::ArrayVar { names, dimensions, elem_type } => {
                let elem = if self.is_known_type(elem_type) {
                    Type::from_name(elem_type)
                } else {
                    self.error(SemanticError::UnknownType(elem_type.clone()));
                    Type::Unknown
                };
                for n in names {
                    let key = ci(n);
                    if self.current_scope_mut().arrays.contains_key(&key) {
                        self.error(SemanticError::DuplicateDeclaration {
                            kind: "variable",
                            name: n.clone(),
                        });
                        continue;
                    }
                    self.current_scope_mut().arrays.insert(
                        key,
                        ArrayTypeInfo { dimensions: dimensions.clone(), elem_type: elem.clone() },
                    );
                }
            }
            Declaration::FileVar { names, text, .. } => {
                for n in names {
                    let key = ci(n);
                    if self.current_scope_mut().file_vars.contains_key(&key) {
                        self.error(SemanticError::DuplicateDeclaration {
                            kind: "variable",
                            name: n.clone(),
                        });
                        continue;
                    }
                    self.current_scope_mut().file_vars.insert(key, *text);
                }
            }
            Declaration::PointerVar { names, points_to } => {
                for n in names {
                    let key = ci(n);
                    if self.current_scope_mut().pointer_vars.contains_key(&key) {
                        self.error(SemanticError::DuplicateDeclaration {
                            kind: "variable",
                            name: n.clone(),
                        });
                        continue;
                    }
                    self.current_scope_mut()
                        .pointer_vars
                        .insert(key, points_to.clone());
                }
            }
            Declaration::SetVar { names, elem_type } => {
                let elem = if self.is_known_type(elem_type) {
                    Type::from_name(elem_type)
                } else {
                    self.error(SemanticError::UnknownType(elem_type.clone()));
                    Type::Unknown
                };
                for n in names {
                    let key = ci(n);
                    if self.current_scope_mut().set_vars.contains_key(&key) {
                        self.error(SemanticError::DuplicateDeclaration {
                            kind: "variable",
                            name: n.clone(),
                        });
                        continue;
                    }
                    self.current_scope_mut().set_vars.insert(key, elem.clone());
                }
            }
            Declaration::RecordType { .. } | Declaration::EnumType { .. } => unreachable!(),
            Declaration::Procedure { .. } | Declaration::Function { .. } => {}
        }
    }

    fn register_subprogram(
        &mut self,
        name: &str,
        params: &[ParamGroup],
        return_type: Option<&str>,
        is_function: bool,
    ) {
        let key = ci(name);
        let table = if is_function { &mut self.functions } else { &mut self.procedures };
        if table.contains_key(&key) {
            self.error(SemanticError::DuplicateDeclaration {
                kind: if is_function { "function" } else { "procedure" },
                name: name.to_string(),
            });
            return;
        }
        let flat = ParamGroup::flatten(params);
        let info = FunctionInfo {
            params: flat
                .into_iter()
                .map(|(n, by_ref, ty)| (n, by_ref, Type::from_name(&ty)))
                .collect(),
            return_type: return_type.map(Type::from_name),
        };
        if is_function {
            self.functions.insert(key, info);
        } else {
            self.procedures.insert(key, info);
        }
    }

    /// Analyzes each procedure/function body in its own saved-and-restored
    /// scope: parameters and locals are declared, nested bodies analyze
    /// recursively, then the scope is discarded.
    fn analyze_bodies(&mut self, decls: &[Declaration]) {
        for d in decls {
            match d {
                Declaration::Procedure { params, locals, nested, body, .. } => {
                    self.push_scope();
                    let saved_with = std::mem::take(&mut self.with_stack);
                    for (n, by_ref, ty) in ParamGroup::flatten(params) {
                        let _ = by_ref;
                        self.declare_scalar(&n, Type::from_name(&ty));
                    }
                    self.register_decls(locals);
                    for l in locals {
                        self.register_var_decl_if_not_type(l);
                    }
                    self.analyze_bodies(nested);
                    self.analyze_stmt(body);
                    self.with_stack = saved_with;
                    self.pop_scope();
                }
                Declaration::Function { name, params, return_type, locals, nested, body } => {
                    self.push_scope();
                    let saved_with = std::mem::take(&mut self.with_stack);
                    for (n, by_ref, ty) in ParamGroup::flatten(params) {
                        let _ = by_ref;
                        self.declare_scalar(&n, Type::from_name(&ty));
                    }
                    // a function's own name is assignable within its body to set the result
                    self.declare_scalar(name, Type::from_name(return_type));
                    self.register_decls(locals);
                    for l in locals {
                        self.register_var_decl_if_not_type(l);
                    }
                    self.analyze_bodies(nested);
                    self.analyze_stmt(body);
                    self.with_stack = saved_with;
                    self.pop_scope();
                }
                _ => {}
            }
        }
    }

    fn register_var_decl_if_not_type(&mut self, d: &Declaration) {
        if !matches!(d, Declaration::RecordType { .. } | Declaration::EnumType { .. }) {
            self.register_var_decl(d);
        }
    }

    fn analyze_stmt(&mut self, stmt: &Stmt) {
        match stmt {
            Stmt::Assign { target, value } => {
                let vty = self.infer_expr(value);
                let tty = self.infer_lvalue(target);
                if !tty.compatible(&vty) {
                    self.error(SemanticError::TypeMismatch {
                        context: "assignment".to_string(),
                        expected: tty.display(),
                        actual: vty.display(),
                    });
                }
            }
            Stmt::Compound(stmts) => {
                for s in stmts {
                    self.analyze_stmt(s);
                }
            }
            Stmt::If { cond, then_branch, else_branch } => {
                self.expect_boolean(cond, "if condition");
                self.analyze_stmt(then_branch);
                if let Some(e) = else_branch {
                    self.analyze_stmt(e);
                }
            }
            Stmt::While { cond, body } => {
                self.expect_boolean(cond, "while condition");
                self.analyze_stmt(body);
            }
            Stmt::Repeat { body, cond } => {
                for s in body {
                    self.analyze_stmt(s);
                }
                self.expect_boolean(cond, "repeat-until condition");
            }
            Stmt::For { var, start, end, body, .. } => {
                self.expect_integer(start, "for-loop start");
                self.expect_integer(end, "for-loop end");
                if let Some(ty) = self.lookup_scalar(var).cloned() {
                    if !matches!(ty, Type::Integer | Type::Unknown) {
                        self.error(SemanticError::TypeMismatch {
                            context: format!("for-loop variable {var:?}"),
                            expected: "integer".to_string(),
                            actual: ty.display(),
                        });
                    }
                } else {
                    self.error(SemanticError::UndeclaredName {
                        kind: "variable",
                        name: var.clone(),
                    });
                }
                self.analyze_stmt(body);
            }
            Stmt::Case { selector, branches, else_branch } => {
                self.infer_expr(selector);
                for b in branches {
                    for v in &b.label.values {
                        match v {
                            CaseLabelValue::Single(e) => {
                                self.infer_expr(e);
                            }
                            CaseLabelValue::Range(lo, hi) => {
                                self.infer_expr(lo);
                                self.infer_expr(hi);
                            }
                        }
                    }
                    self.analyze_stmt(&b.body);
                }
                if let Some(e) = else_branch {
                    self.analyze_stmt(e);
                }
            }
            Stmt::With { record, body } => {
                if self.lookup_record_var(record).is_none() {
                    self.error(SemanticError::UndeclaredName {
                        kind: "record variable",
                        name: record.clone(),
                    });
                }
                self.with_stack.push(record.clone());
                self.analyze_stmt(body);
                self.with_stack.pop();
            }
            Stmt::Goto(_) | Stmt::Empty => {}
            Stmt::Labeled { stmt, .. } => self.analyze_stmt(stmt),
            Stmt::ProcCall { name, args } => {
                self.check_call(name, args);
            }
            Stmt::Write { args, .. } => {
                for a in args {
                    self.infer_expr(a);
                }
            }
            Stmt::Read { targets, .. } => {
                for t in targets {
                    self.infer_lvalue(t);
                }
            }
            Stmt::File(op) => self.analyze_file_op(op),
            Stmt::New(name) | Stmt::Dispose(name) => {
                if self.lookup_pointer_var(name).is_none() {
                    self.error(SemanticError::UndeclaredName {
                        kind: "pointer variable",
                        name: name.clone(),
                    });
                }
            }
        }
    }

    fn analyze_file_op(&mut self, op: &FileOp) {
        let check_file = |a: &mut Self, name: &str| {
            if !a.lookup_file_var(name) {
                a.error(SemanticError::UndeclaredName {
                    kind: "file variable",
                    name: name.to_string(),
                });
            }
        };
        match op {
            FileOp::Assign { file, filename } => {
                check_file(self, file);
                self.expect_string(filename, "assign filename");
            }
            FileOp::Reset(f)
            | FileOp::Rewrite(f)
            | FileOp::Close(f)
            | FileOp::Eof(f)
            | FileOp::Page(f)
            | FileOp::Get(f)
            | FileOp::Put(f)
            | FileOp::Pack(f)
            | FileOp::Unpack(f) => check_file(self, f),
            FileOp::Read { file, targets } => {
                check_file(self, file);
                for t in targets {
                    self.infer_lvalue(t);
                }
            }
            FileOp::Write { file, values } => {
                check_file(self, file);
                for v in values {
                    self.infer_expr(v);
                }
            }
        }
    }

    fn check_call(&mut self, name: &str, args: &[Expr]) {
        let key = ci(name);
        if let Some(b) = builtins::lookup(name) {
            if !b.arity.accepts(args.len()) {
                self.error(SemanticError::ArityMismatch {
                    function: name.to_string(),
                    expected: format!("{:?}", b.arity),
                    actual: args.len(),
                });
            }
            for a in args {
                self.infer_expr(a);
            }
            return;
        }
        let info = self.procedures.get(&key).or_else(|| self.functions.get(&key)).cloned();
        match info {
            Some(info) => {
                if info.params.len() != args.len() {
                    self.error(SemanticError::ArityMismatch {
                        function: name.to_string(),
                        expected: info.params.len().to_string(),
                        actual: args.len(),
                    });
                }
                for a in args {
                    self.infer_expr(a);
                }
            }
            None => {
                self.error(SemanticError::UndeclaredName {
                    kind: "procedure or function",
                    name: name.to_string(),
                });
            }
        }
    }

    fn expect_boolean(&mut self, e: &Expr, context: &str) {
        let ty = self.infer_expr(e);
        if !matches!(ty, Type::Boolean | Type::Unknown) {
            self.error(SemanticError::TypeMismatch {
                context: context.to_string(),
                expected: "boolean".to_string(),
                actual: ty.display(),
            });
        }
    }

    fn expect_integer(&mut self, e: &Expr, context: &str) {
        let ty = self.infer_expr(e);
        if !matches!(ty, Type::Integer | Type::Unknown) {
            self.error(SemanticError::TypeMismatch {
                context: context.to_string(),
                expected: "integer".to_string(),
                actual: ty.display(),
            });
        }
    }

    fn expect_string(&mut self, e: &Expr, context: &str) {
        let ty = self.infer_expr(e);
        if !matches!(ty, Type::Str | Type::Unknown) {
            self.error(SemanticError::TypeMismatch {
                context: context.to_string(),
                expected: "string".to_string(),
                actual: ty.display(),
            });
        }
    }

    fn infer_lvalue(&mut self, lv: &LValue) -> Type {
        match lv {
            LValue::Variable(name) => self.infer_variable(name),
            LValue::ArrayElem { name, indices } => {
                for i in indices {
                    self.expect_integer(i, "array index");
                }
                match self.lookup_array(name).cloned() {
                    Some(info) => info.elem_type,
                    None => {
                        self.error(SemanticError::UndeclaredName {
                            kind: "array variable",
                            name: name.clone(),
                        });
                        Type::Unknown
                    }
                }
            }
            LValue::RecordField { record, field } => self.infer_record_field(record, field),
            LValue::RecordFieldArrayElem { record, field, indices } => {
                for i in indices {
                    self.expect_integer(i, "array index");
                }
                self.infer_record_field(record, field)
            }
            LValue::ArrayElemField { array, index, field } => {
                self.expect_integer(index, "array index");
                let elem_type_name = self
                    .lookup_array(array)
                    .map(|info| info.elem_type.display());
                match elem_type_name {
                    Some(tn) => self.infer_record_field(&tn, field),
                    None => {
                        self.error(SemanticError::UndeclaredName {
                            kind: "array variable",
                            name: array.clone(),
                        });
                        Type::Unknown
                    }
                }
            }
            LValue::PointerDeref(name) => match self.lookup_pointer_var(name) {
                Some(points_to) => Type::from_name(points_to),
                None => {
                    self.error(SemanticError::UndeclaredName {
                        kind: "pointer variable",
                        name: name.clone(),
                    });
                    Type::Unknown
                }
            },
        }
    }

    fn infer_record_field(&mut self, record_or_type: &str, field: &str) -> Type {
        let type_name = self
            .lookup_record_var(record_or_type)
            .map(str::to_string)
            .unwrap_or_else(|| record_or_type.to_string());
        match self.record_types.get(&ci(&type_name)).cloned() {
            Some(info) => match info.fields.iter().find(|f| f.name.eq_ignore_ascii_case(field)) {
                Some(f) => Type::from_name(&f.type_name),
                None => {
                    self.error(SemanticError::UndeclaredName {
                        kind: "record field",
                        name: field.to_string(),
                    });
                    Type::Unknown
                }
            },
            None => {
                self.error(SemanticError::UndeclaredName {
                    kind: "record variable",
                    name: record_or_type.to_string(),
                });
                Type::Unknown
            }
        }
    }

    fn infer_variable(&mut self, name: &str) -> Type {
        if let Some(ty) = self.lookup_scalar(name) {
            return ty.clone();
        }
        if let Some(owner) = self.enum_values.get(&ci(name)) {
            return Type::Named(owner.clone());
        }
        if let Some(record) = self.resolve_with_field(name).map(str::to_string) {
            return self.infer_record_field(&record, name);
        }
        self.error(SemanticError::UndeclaredName {
            kind: "variable",
            name: name.to_string(),
        });
        Type::Unknown
    }

    /// Walks an expression, type-checking every operator per the
    /// rules, and returns its inferred type.
    fn infer_expr(&mut self, expr: &Expr) -> Type {
        match expr {
            Expr::IntLiteral(_) => Type::Integer,
            Expr::RealLiteral(_) => Type::Real,
            Expr::StringLiteral(_) => Type::Str,
            Expr::BoolLiteral(_) => Type::Boolean,
            Expr::Nil => Type::Nil,
            Expr::Variable(name) => self.infer_variable(name),
            Expr::Binary { op, lhs, rhs } => self.infer_binary(op, lhs, rhs),
            Expr::Unary { op, operand } => self.infer_unary(op, operand),
            Expr::Call { name, args } => {
                self.check_call(name, args);
                match builtins::lookup(name) {
                    Some(b) => match &b.return_type {
                        Type::Auto => args.first().map(|a| self.infer_expr(a)).unwrap_or(Type::Auto),
                        other => other.clone(),
                    },
                    None => self
                        .functions
                        .get(&ci(name))
                        .and_then(|f| f.return_type.clone())
                        .unwrap_or(Type::Unknown),
                }
            }
            Expr::ArrayAccess { name, indices } => {
                for i in indices {
                    self.expect_integer(i, "array index");
                }
                match self.lookup_array(name).cloned() {
                    Some(info) => info.elem_type,
                    None => {
                        self.error(SemanticError::UndeclaredName {
                            kind: "array variable",
                            name: name.clone(),
                        });
                        Type::Unknown
                    }
                }
            }
            Expr::FieldAccess { record, field } => self.infer_record_field(record, field),
            Expr::RecordFieldArrayAccess { record, field, indices } => {
                for i in indices {
                    self.expect_integer(i, "array index");
                }
                self.infer_record_field(record, field)
            }
            Expr::ArrayOfRecordFieldAccess { array, index, field } => {
                self.expect_integer(index, "array index");
                let elem_type_name = self.lookup_array(array).map(|info| info.elem_type.display());
                match elem_type_name {
                    Some(tn) => self.infer_record_field(&tn, field),
                    None => {
                        self.error(SemanticError::UndeclaredName {
                            kind: "array variable",
                            name: array.clone(),
                        });
                        Type::Unknown
                    }
                }
            }
            Expr::Deref(inner) => match self.infer_expr(inner) {
                Type::Pointer(t) => *t,
                Type::Unknown => Type::Unknown,
                other => {
                    self.error(SemanticError::TypeMismatch {
                        context: "pointer dereference".to_string(),
                        expected: "pointer".to_string(),
                        actual: other.display(),
                    });
                    Type::Unknown
                }
            },
            Expr::AddrOf(name) => {
                let ty = self.infer_variable(name);
                Type::Pointer(Box::new(ty))
            }
            Expr::SetLiteral(elems) => {
                let elem_ty = elems
                    .first()
                    .map(|e| self.infer_expr(e))
                    .unwrap_or(Type::Unknown);
                for e in &elems[1.min(elems.len())..] {
                    self.infer_expr(e);
                }
                Type::Set(Box::new(elem_ty))
            }
            Expr::SetIn { value, set } => {
                self.infer_expr(value);
                let set_ty = self.infer_expr(set);
                if !matches!(set_ty, Type::Set(_) | Type::Unknown) {
                    self.error(SemanticError::TypeMismatch {
                        context: "in operator".to_string(),
                        expected: "set".to_string(),
                        actual: set_ty.display(),
                    });
                }
                Type::Boolean
            }
            Expr::FileEof(name) => {
                if !self.lookup_file_var(name) {
                    self.error(SemanticError::UndeclaredName {
                        kind: "file variable",
                        name: name.clone(),
                    });
                }
                Type::Boolean
            }
        }
    }

    fn infer_binary(&mut self, op: &BinOp, lhs: &Expr, rhs: &Expr) -> Type {
        let lt = self.infer_expr(lhs);
        let rt = self.infer_expr(rhs);
        match op {
            BinOp::Add => {
                if matches!((&lt, &rt), (Type::Str, Type::Str)) {
                    Type::Str
                } else {
                    self.require_numeric_pair(&lt, &rt, "+")
                }
            }
            BinOp::Sub | BinOp::Mul => self.require_numeric_pair(&lt, &rt, "arithmetic"),
            BinOp::Div => {
                self.require_numeric_pair(&lt, &rt, "/");
                Type::Real
            }
            BinOp::IDiv | BinOp::Mod => {
                if !matches!(lt, Type::Integer | Type::Unknown) || !matches!(rt, Type::Integer | Type::Unknown) {
                    self.error(SemanticError::TypeMismatch {
                        context: "div/mod".to_string(),
                        expected: "integer".to_string(),
                        actual: format!("{}/{}", lt.display(), rt.display()),
                    });
                }
                Type::Integer
            }
            BinOp::And | BinOp::Or => {
                if !matches!(lt, Type::Boolean | Type::Unknown) || !matches!(rt, Type::Boolean | Type::Unknown) {
                    self.error(SemanticError::TypeMismatch {
                        context: "and/or".to_string(),
                        expected: "boolean".to_string(),
                        actual: format!("{}/{}", lt.display(), rt.display()),
                    });
                }
                Type::Boolean
            }
            BinOp::Eq | BinOp::NotEq => {
                if !lt.compatible(&rt) {
                    self.error(SemanticError::TypeMismatch {
                        context: "= / <>".to_string(),
                        expected: lt.display(),
                        actual: rt.display(),
                    });
                }
                Type::Boolean
            }
            BinOp::Lt | BinOp::Gt | BinOp::Le | BinOp::Ge => {
                let ok = (lt.is_numeric() && rt.is_numeric())
                    || matches!((&lt, &rt), (Type::Str, Type::Str))
                    || matches!(lt, Type::Unknown)
                    || matches!(rt, Type::Unknown);
                if !ok {
                    self.error(SemanticError::TypeMismatch {
                        context: "ordered comparison".to_string(),
                        expected: "numeric or string".to_string(),
                        actual: format!("{}/{}", lt.display(), rt.display()),
                    });
                }
                Type::Boolean
            }
        }
    }

    fn require_numeric_pair(&mut self, lt: &Type, rt: &Type, context: &str) -> Type {
        if !lt.is_numeric() && !matches!(lt, Type::Unknown) {
            self.error(SemanticError::TypeMismatch {
                context: context.to_string(),
                expected: "numeric".to_string(),
                actual: lt.display(),
            });
        }
        if !rt.is_numeric() && !matches!(rt, Type::Unknown) {
            self.error(SemanticError::TypeMismatch {
                context: context.to_string(),
                expected: "numeric".to_string(),
                actual: rt.display(),
            });
        }
        if matches!(lt, Type::Real) || matches!(rt, Type::Real) {
            Type::Real
        } else {
            Type::Integer
        }
    }

    fn infer_unary(&mut self, op: &crate::ast::UnOp, operand: &Expr) -> Type {
        use crate::ast::UnOp;
        match op {
            UnOp::Neg | UnOp::Plus => {
                let ty = self.infer_expr(operand);
                if !ty.is_numeric() && !matches!(ty, Type::Unknown) {
                    self.error(SemanticError::TypeMismatch {
                        context: "unary +/-".to_string(),
                        expected: "numeric".to_string(),
                        actual: ty.display(),
                    });
                }
                ty
            }
            UnOp::Not => {
                self.expect_boolean(operand, "not");
                Type::Boolean
            }
        }
    }
}

impl Default for Analyzer {
    fn default() -> Self {
        Analyzer::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;

    fn analyze_src(src: &str) -> Vec<SemanticError> {
        match parse(src).unwrap() {
            CompilationUnit::Program(p) => Analyzer::analyze_program(&p),
            CompilationUnit::Unit(u) => Analyzer::analyze_unit(&u),
        }
    }

    #[test]
    fn clean_program_has_no_errors() {
        let errs = analyze_src(
            "program P; var x: integer; begin x := 1; end.",
        );
        assert!(errs.is_empty(), "{errs:?}");
    }

    #[test]
    fn undeclared_variable_is_reported() {
        let errs = analyze_src("program P; begin x := 1; end.");
        assert!(matches!(&errs[0], SemanticError::UndeclaredName { .. }));
    }

    #[test]
    fn duplicate_declaration_is_reported() {
        let errs = analyze_src("program P; var x: integer; x: real; begin end.");
        assert!(errs.iter().any(|e| matches!(e, SemanticError::DuplicateDeclaration { .. })));
    }

    #[test]
    fn int_widens_to_real_on_assignment() {
        let errs = analyze_src("program P; var x: real; y: integer; begin x := y; end.");
        assert!(errs.is_empty(), "{errs:?}");
    }

    #[test]
    fn boolean_condition_mismatch_is_reported() {
        let errs = analyze_src("program P; var x: integer; begin if x then x := 1; end.");
        assert!(errs.iter().any(|e| matches!(e, SemanticError::TypeMismatch { .. })));
    }

    #[test]
    fn builtin_arity_is_checked() {
        let errs = analyze_src("program P; var x: real; begin x := sqrt(1, 2); end.");
        assert!(errs.iter().any(|e| matches!(e, SemanticError::ArityMismatch { .. })));
    }

    #[test]
    fn for_loop_variable_must_be_integer() {
        let errs = analyze_src(
            "program P; var x: real; begin for x := 1 to 10 do ; end.",
        );
        assert!(errs.iter().any(|e| matches!(e, SemanticError::TypeMismatch { .. })));
    }
}
