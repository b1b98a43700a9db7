// ABOUTME: Tree-walking evaluator sharing the VM's state model, with goto implemented as a caught control-flow signal

use crate::ast::{
    CaseLabelValue, Declaration, Expr, FileOp, LValue, ParamGroup, Program as AstProgram, Stmt,
    Unit as AstUnit,
};
use crate::builtins;
use crate::error::{LoadError, RuntimeError};
use crate::unit_loader::SourceUnitLoader;
use crate::value::Value;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fs::File;
use std::io::{self, BufRead, BufReader, Read as IoRead, Write as IoWrite};
use std::rc::Rc;

type Scope = HashMap<String, Value>;

#[derive(Clone)]
struct ArrayMeta {
    dimensions: Vec<(i64, i64)>,
    elem_type: String,
}

struct FileHandle {
    filename: String,
    reader: Option<BufReader<File>>,
    writer: Option<File>,
}

/// A procedure/function declaration callable by name, kept alive past the
/// `Program`/`Unit` it came from so recursive and cross-unit calls can
/// still reach it.
struct Callable {
    params: Vec<ParamGroup>,
    return_type: Option<String>,
    locals: Vec<Declaration>,
    nested: Vec<Declaration>,
    body: Rc<Stmt>,
    display_name: String,
}

/// Unwinds the call stack one `goto` at a time. A block that names the
/// target label catches it and resumes there; everything else (including
/// real errors) propagates unchanged.
enum Flow {
    Error(RuntimeError),
    Goto(String),
}

impl From<RuntimeError> for Flow {
    fn from(e: RuntimeError) -> Self {
        Flow::Error(e)
    }
}

type Exec = Result<(), Flow>;

fn ci(name: &str) -> String {
    name.to_lowercase()
}

pub struct Interpreter {
    globals: Scope,
    scopes: Vec<Scope>,
    functions: HashMap<String, Rc<Callable>>,
    array_meta: HashMap<String, ArrayMeta>,
    arrays: HashMap<String, Vec<Value>>,
    enums: HashMap<String, Vec<String>>,
    heap: HashMap<u64, Value>,
    next_addr: u64,
    files: HashMap<String, FileHandle>,
    out: Vec<u8>,
    input: Box<dyn BufRead>,
    /// Record type name (lowercase) -> declared field names.
    record_types: HashMap<String, Vec<String>>,
    /// Record variable name (lowercase) -> its declared record type name
    /// (lowercase), so a `with` statement can look up the type's fields.
    var_record_type: HashMap<String, String>,
    /// Stack of `(record var name, field names)` pairs for `with` bodies
    /// currently executing, innermost last. Scoped lexically: cleared
    /// across a procedure/function call so a callee's own locals are never
    /// shadowed by the caller's `with`.
    with_stack: Vec<(String, Vec<String>)>,
}

impl Interpreter {
    pub fn new() -> Self {
        Interpreter {
            globals: HashMap::new(),
            scopes: Vec::new(),
            functions: HashMap::new(),
            array_meta: HashMap::new(),
            arrays: HashMap::new(),
            enums: HashMap::new(),
            heap: HashMap::new(),
            next_addr: 1,
            files: HashMap::new(),
            out: Vec::new(),
            input: Box::new(BufReader::new(io::stdin())),
            record_types: HashMap::new(),
            var_record_type: HashMap::new(),
            with_stack: Vec::new(),
        }
    }

    /// The `with`-stack record whose type declares a field named `name`,
    /// searched innermost-first, if any.
    fn resolve_with_field(&self, name: &str) -> Option<String> {
        self.with_stack
            .iter()
            .rev()
            .find(|(_, fields)| fields.iter().any(|f| f.eq_ignore_ascii_case(name)))
            .map(|(record, _)| record.clone())
    }

    fn fields_for_record_var(&self, var_name: &str) -> Vec<String> {
        self.var_record_type
            .get(&ci(var_name))
            .and_then(|ty| self.record_types.get(ty))
            .cloned()
            .unwrap_or_default()
    }

    pub fn with_input(mut self, input: Box<dyn BufRead>) -> Self {
        self.input = input;
        self
    }

    pub fn output(&self) -> &[u8] {
        &self.out
    }

    // ------------------------------------------------------------------
    // Program/unit registration
    // ------------------------------------------------------------------

    pub fn run_program(
        &mut self,
        program: &AstProgram,
        loader: &mut SourceUnitLoader,
    ) -> Result<(), RuntimeError> {
        let mut linked = HashSet::new();
        for name in &program.uses {
            self.link_unit(name, loader, &mut linked)?;
        }
        self.register_decls(&program.decls);
        match self.exec_stmt(&program.body) {
            Ok(()) => Ok(()),
            Err(Flow::Error(e)) => Err(e),
            Err(Flow::Goto(label)) => Err(RuntimeError::Other(format!(
                "goto {label:?} has no enclosing label in the program body"
            ))),
        }
    }

    fn link_unit(
        &mut self,
        name: &str,
        loader: &mut SourceUnitLoader,
        linked: &mut HashSet<String>,
    ) -> Result<(), RuntimeError> {
        let key = ci(name);
        if linked.contains(&key) {
            return Ok(());
        }
        linked.insert(key);

        let unit = loader.load(name).map_err(|e: LoadError| RuntimeError::Other(e.to_string()))?;
        for dep in &unit.uses {
            self.link_unit(dep, loader, linked)?;
        }
        self.register_decls(&unit.interface_decls);
        self.register_decls(&unit.impl_decls);
        if let Some(init) = &unit.initialization {
            match self.exec_stmt(init) {
                Ok(()) => {}
                Err(Flow::Error(e)) => return Err(e),
                Err(Flow::Goto(label)) => {
                    return Err(RuntimeError::Other(format!(
                        "goto {label:?} escaped unit {name:?}'s initialization"
                    )))
                }
            }
        }
        Ok(())
    }

    fn register_decls(&mut self, decls: &[Declaration]) {
        // Record types are registered up front so a `var` group earlier in
        // the same list as its record type still sees the field table.
        for d in decls {
            if let Declaration::RecordType { name, fields } = d {
                self.record_types
                    .insert(ci(name), fields.iter().map(|f| f.name.clone()).collect());
            }
        }
        for d in decls {
            match d {
                Declaration::Var { names, type_name } => {
                    for n in names {
                        self.globals.entry(ci(n)).or_insert(Value::Nil);
                        if self.record_types.contains_key(&ci(type_name)) {
                            self.var_record_type.insert(ci(n), ci(type_name));
                        }
                    }
                }
                Declaration::ArrayVar { names, dimensions, elem_type } => {
                    for n in names {
                        let meta = ArrayMeta { dimensions: dimensions.clone(), elem_type: elem_type.clone() };
                        let size: i64 = meta.dimensions.iter().map(|(lo, hi)| hi - lo + 1).product();
                        let default = default_value_for(&meta.elem_type);
                        self.arrays.insert(ci(n), vec![default; size.max(0) as usize]);
                        self.array_meta.insert(ci(n), meta);
                    }
                }
                Declaration::FileVar { names, .. } | Declaration::PointerVar { names, .. } => {
                    for n in names {
                        self.globals.entry(ci(n)).or_insert(Value::Nil);
                    }
                }
                Declaration::SetVar { names, .. } => {
                    for n in names {
                        self.globals.entry(ci(n)).or_insert(Value::Set(BTreeSet::new()));
                    }
                }
                Declaration::EnumType { name, values } => {
                    self.enums.insert(ci(name), values.clone());
                }
                Declaration::Const { name, value } => {
                    if let Ok(v) = self.eval(value) {
                        self.globals.insert(ci(name), v);
                    }
                }
                Declaration::RecordType { .. } => {}
                Declaration::Procedure { name, params, locals, nested, body } => {
                    self.functions.insert(
                        ci(name),
                        Rc::new(Callable {
                            params: params.clone(),
                            return_type: None,
                            locals: locals.clone(),
                            nested: nested.clone(),
                            body: Rc::new(body.clone()),
                            display_name: name.clone(),
                        }),
                    );
                    self.register_decls(nested);
                }
                Declaration::Function { name, params, return_type, locals, nested, body } => {
                    self.functions.insert(
                        ci(name),
                        Rc::new(Callable {
                            params: params.clone(),
                            return_type: Some(return_type.clone()),
                            locals: locals.clone(),
                            nested: nested.clone(),
                            body: Rc::new(body.clone()),
                            display_name: name.clone(),
                        }),
                    );
                    self.register_decls(nested);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Statements
    // ------------------------------------------------------------------

    fn exec_stmt(&mut self, stmt: &Stmt) -> Exec {
        match stmt {
            Stmt::Assign { target, value } => {
                let v = self.eval(value)?;
                self.store(target, v)?;
                Ok(())
            }
            Stmt::Compound(stmts) => self.exec_block(stmts),
            Stmt::If { cond, then_branch, else_branch } => {
                if self.eval(cond)?.as_bool()? {
                    self.exec_stmt(then_branch)
                } else if let Some(e) = else_branch {
                    self.exec_stmt(e)
                } else {
                    Ok(())
                }
            }
            Stmt::While { cond, body } => {
                while self.eval(cond)?.as_bool()? {
                    self.exec_stmt(body)?;
                }
                Ok(())
            }
            Stmt::Repeat { body, cond } => loop {
                self.exec_block(body)?;
                if self.eval(cond)?.as_bool()? {
                    return Ok(());
                }
            },
            Stmt::For { var, start, end, downto, body } => {
                let start_v = self.eval(start)?.as_int()?;
                let end_v = self.eval(end)?.as_int()?;
                self.store_var(var, Value::Int(start_v));
                let mut i = start_v;
                loop {
                    let done = if *downto { i < end_v } else { i > end_v };
                    if done {
                        break;
                    }
                    self.exec_stmt(body)?;
                    i = if *downto { i - 1 } else { i + 1 };
                    self.store_var(var, Value::Int(i));
                }
                Ok(())
            }
            Stmt::Case { selector, branches, else_branch } => {
                let v = self.eval(selector)?;
                for b in branches {
                    for label in &b.label.values {
                        let matched = match label {
                            CaseLabelValue::Single(e) => v.values_equal(&self.eval(e)?)?,
                            CaseLabelValue::Range(lo, hi) => {
                                let lo = self.eval(lo)?.as_int()?;
                                let hi = self.eval(hi)?.as_int()?;
                                let n = v.as_int()?;
                                n >= lo && n <= hi
                            }
                        };
                        if matched {
                            return self.exec_stmt(&b.body);
                        }
                    }
                }
                if let Some(e) = else_branch {
                    self.exec_stmt(e)
                } else {
                    Ok(())
                }
            }
            Stmt::With { record, body } => {
                let fields = self.fields_for_record_var(record);
                self.with_stack.push((record.clone(), fields));
                let result = self.exec_stmt(body);
                self.with_stack.pop();
                result
            }
            Stmt::Goto(label) => Err(Flow::Goto(label.clone())),
            Stmt::Labeled { stmt, .. } => self.exec_stmt(stmt),
            Stmt::ProcCall { name, args } => {
                self.call(name, args)?;
                Ok(())
            }
            Stmt::Write { args, newline } => {
                for a in args {
                    let v = self.eval(a)?;
                    let _ = write!(self.out, "{v}");
                }
                if *newline {
                    self.out.push(b'\n');
                }
                Ok(())
            }
            Stmt::Read { targets, newline } => {
                for t in targets {
                    let v = read_token_from(&mut self.input)?;
                    self.store(t, v)?;
                }
                let _ = newline;
                Ok(())
            }
            Stmt::File(op) => self.exec_file_op(op),
            Stmt::New(name) => {
                let addr = self.next_addr;
                self.next_addr += 1;
                self.heap.insert(addr, Value::Int(0));
                self.store_var(name, Value::HeapAddr(addr));
                Ok(())
            }
            Stmt::Dispose(name) => {
                if let Value::HeapAddr(addr) = self.load_var(name)? {
                    self.heap.remove(&addr);
                }
                self.store_var(name, Value::Nil);
                Ok(())
            }
            Stmt::Empty => Ok(()),
        }
    }

    /// Runs `stmts` in order. A `goto` raised by one of them is caught here
    /// if `stmts` contains a `Labeled` statement naming that target;
    /// otherwise it propagates to the caller's own enclosing block.
    fn exec_block(&mut self, stmts: &[Stmt]) -> Exec {
        let mut i = 0;
        while i < stmts.len() {
            match self.exec_stmt(&stmts[i]) {
                Ok(()) => i += 1,
                Err(Flow::Goto(label)) => {
                    match stmts.iter().position(|s| matches!(s, Stmt::Labeled { label: l, .. } if l.eq_ignore_ascii_case(&label)))
                    {
                        Some(j) => i = j,
                        None => return Err(Flow::Goto(label)),
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn exec_file_op(&mut self, op: &FileOp) -> Exec {
        match op {
            FileOp::Assign { file, filename } => {
                let name = self.eval(filename)?.as_str()?.to_string();
                self.files.insert(ci(file), FileHandle { filename: name, reader: None, writer: None });
                Ok(())
            }
            FileOp::Reset(name) => {
                let filename = self
                    .files
                    .get(&ci(name))
                    .map(|h| h.filename.clone())
                    .ok_or_else(|| RuntimeError::Other(format!("file {name:?} was never assigned")))?;
                let f = File::open(&filename)
                    .map_err(|e| RuntimeError::Other(format!("cannot open {filename:?}: {e}")))?;
                self.files.get_mut(&ci(name)).unwrap().reader = Some(BufReader::new(f));
                Ok(())
            }
            FileOp::Rewrite(name) => {
                let filename = self
                    .files
                    .get(&ci(name))
                    .map(|h| h.filename.clone())
                    .ok_or_else(|| RuntimeError::Other(format!("file {name:?} was never assigned")))?;
                let f = File::create(&filename)
                    .map_err(|e| RuntimeError::Other(format!("cannot open {filename:?}: {e}")))?;
                self.files.get_mut(&ci(name)).unwrap().writer = Some(f);
                Ok(())
            }
            FileOp::Close(name) => {
                if let Some(h) = self.files.get_mut(&ci(name)) {
                    h.reader = None;
                    h.writer = None;
                }
                Ok(())
            }
            FileOp::Eof(_) => Ok(()),
            FileOp::Page(_) | FileOp::Get(_) | FileOp::Put(_) | FileOp::Pack(_) | FileOp::Unpack(_) => Ok(()),
            FileOp::Read { file, targets } => {
                let key = ci(file);
                for t in targets {
                    let v = match self.files.get_mut(&key).and_then(|h| h.reader.as_mut()) {
                        Some(r) => read_token_from(r)?,
                        None => Value::Int(0),
                    };
                    self.store(t, v)?;
                }
                Ok(())
            }
            FileOp::Write { file, values } => {
                let key = ci(file);
                for v in values {
                    let val = self.eval(v)?;
                    if let Some(w) = self.files.get_mut(&key).and_then(|h| h.writer.as_mut()) {
                        let _ = write!(w, "{val}");
                    }
                }
                Ok(())
            }
        }
    }

    // ------------------------------------------------------------------
    // Variables, arrays, pointers
    // ------------------------------------------------------------------

    fn load_var(&self, name: &str) -> Result<Value, RuntimeError> {
        if let Some(record) = self.resolve_with_field(name) {
            return self.load_var(&format!("{record}.{name}"));
        }
        let key = ci(name);
        for scope in self.scopes.iter().rev() {
            if let Some(v) = scope.get(&key) {
                return Ok(v.clone());
            }
        }
        if let Some(v) = self.globals.get(&key) {
            return Ok(v.clone());
        }
        if let Some(ord) = self.enum_ordinal(name) {
            return Ok(Value::Int(ord));
        }
        Err(RuntimeError::UndeclaredVariable(name.to_string()))
    }

    fn store_var(&mut self, name: &str, value: Value) {
        if let Some(record) = self.resolve_with_field(name) {
            return self.store_var(&format!("{record}.{name}"), value);
        }
        let key = ci(name);
        for scope in self.scopes.iter_mut().rev() {
            if scope.contains_key(&key) {
                scope.insert(key, value);
                return;
            }
        }
        self.globals.insert(key, value);
    }

    fn enum_ordinal(&self, name: &str) -> Option<i64> {
        for values in self.enums.values() {
            if let Some(idx) = values.iter().position(|v| v.eq_ignore_ascii_case(name)) {
                return Some(idx as i64);
            }
        }
        None
    }

    fn array_meta_for(&self, name: &str) -> Option<&ArrayMeta> {
        if let Some(m) = self.array_meta.get(&ci(name)) {
            return Some(m);
        }
        let base = name.split('.').next()?;
        self.array_meta.get(&ci(base))
    }

    fn array_storage(&mut self, name: &str) -> Result<&mut Vec<Value>, RuntimeError> {
        let key = ci(name);
        if !self.arrays.contains_key(&key) {
            let meta = self
                .array_meta_for(name)
                .ok_or_else(|| RuntimeError::Other(format!("no array metadata for {name:?}")))?
                .clone();
            let size: i64 = meta.dimensions.iter().map(|(lo, hi)| hi - lo + 1).product();
            let default = default_value_for(&meta.elem_type);
            self.arrays.insert(key.clone(), vec![default; size.max(0) as usize]);
        }
        Ok(self.arrays.get_mut(&key).expect("inserted above"))
    }

    fn array_index(&self, name: &str, indices: &[i64]) -> Result<usize, RuntimeError> {
        let meta = self
            .array_meta_for(name)
            .ok_or_else(|| RuntimeError::Other(format!("no array metadata for {name:?}")))?
            .clone();
        if meta.dimensions.len() != indices.len() {
            return Err(RuntimeError::ArrayShapeMismatch {
                expected: meta.dimensions.len(),
                actual: indices.len(),
            });
        }
        let mut linear: i64 = 0;
        for ((lo, hi), idx) in meta.dimensions.iter().zip(indices.iter()) {
            if *idx < *lo || *idx > *hi {
                return Err(RuntimeError::IndexOutOfBounds { index: *idx, low: *lo, high: *hi });
            }
            linear = linear * (hi - lo + 1) + (idx - lo);
        }
        Ok(linear as usize)
    }

    fn pointer_addr(&self, v: &Value) -> Result<u64, RuntimeError> {
        match v {
            Value::HeapAddr(0) | Value::Nil => Err(RuntimeError::NilDereference),
            Value::HeapAddr(addr) => Ok(*addr),
            _ => Err(RuntimeError::Other("not a pointer value".to_string())),
        }
    }

    fn store(&mut self, target: &LValue, value: Value) -> Result<(), RuntimeError> {
        match target {
            LValue::Variable(name) => self.store_var(name, value),
            LValue::ArrayElem { name, indices } => {
                let idx_vals: Vec<i64> = indices.iter().map(|e| self.eval(e).and_then(|v| v.as_int())).collect::<Result<_, _>>()?;
                let idx = self.array_index(name, &idx_vals)?;
                self.array_storage(name)?[idx] = value;
            }
            LValue::RecordField { record, field } => self.store_var(&format!("{record}.{field}"), value),
            LValue::RecordFieldArrayElem { record, field, indices } => {
                let key = format!("{record}.{field}");
                let idx_vals: Vec<i64> = indices.iter().map(|e| self.eval(e).and_then(|v| v.as_int())).collect::<Result<_, _>>()?;
                let idx = self.array_index(&key, &idx_vals)?;
                self.array_storage(&key)?[idx] = value;
            }
            LValue::ArrayElemField { array, index, field } => {
                let key = format!("{array}.{field}");
                let i = self.eval(index)?.as_int()?;
                let idx = self.array_index(&key, &[i])?;
                self.array_storage(&key)?[idx] = value;
            }
            LValue::PointerDeref(name) => {
                let addr = self.pointer_addr(&self.load_var(name)?)?;
                if !self.heap.contains_key(&addr) {
                    return Err(RuntimeError::InvalidPointer);
                }
                self.heap.insert(addr, value);
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Expressions
    // ------------------------------------------------------------------

    fn eval(&mut self, expr: &Expr) -> Result<Value, RuntimeError> {
        match expr {
            Expr::IntLiteral(n) => Ok(Value::Int(*n)),
            Expr::RealLiteral(n) => Ok(Value::Real(*n)),
            Expr::StringLiteral(s) => Ok(Value::Str(s.clone())),
            Expr::BoolLiteral(b) => Ok(Value::Bool(*b)),
            Expr::Nil => Ok(Value::Nil),
            Expr::Variable(name) => self.load_var(name),
            Expr::Binary { op, lhs, rhs } => {
                let a = self.eval(lhs)?;
                let b = self.eval(rhs)?;
                binop_eval(op, &a, &b)
            }
            Expr::Unary { op, operand } => {
                let v = self.eval(operand)?;
                match op {
                    crate::ast::UnOp::Neg => v.neg(),
                    crate::ast::UnOp::Plus => Ok(v),
                    crate::ast::UnOp::Not => v.not(),
                }
            }
            Expr::Call { name, args } => self.call(name, args),
            Expr::ArrayAccess { name, indices } => {
                let idx_vals: Vec<i64> =
                    indices.iter().map(|e| self.eval(e).and_then(|v| v.as_int())).collect::<Result<_, _>>()?;
                let idx = self.array_index(name, &idx_vals)?;
                Ok(self.array_storage(name)?[idx].clone())
            }
            Expr::FieldAccess { record, field } => self.load_var(&format!("{record}.{field}")),
            Expr::RecordFieldArrayAccess { record, field, indices } => {
                let key = format!("{record}.{field}");
                let idx_vals: Vec<i64> =
                    indices.iter().map(|e| self.eval(e).and_then(|v| v.as_int())).collect::<Result<_, _>>()?;
                let idx = self.array_index(&key, &idx_vals)?;
                Ok(self.array_storage(&key)?[idx].clone())
            }
            Expr::ArrayOfRecordFieldAccess { array, index, field } => {
                let key = format!("{array}.{field}");
                let i = self.eval(index)?.as_int()?;
                let idx = self.array_index(&key, &[i])?;
                Ok(self.array_storage(&key)?[idx].clone())
            }
            Expr::Deref(inner) => {
                let v = self.eval(inner)?;
                let addr = self.pointer_addr(&v)?;
                self.heap.get(&addr).cloned().ok_or(RuntimeError::InvalidPointer)
            }
            Expr::AddrOf(name) => {
                let v = self.load_var(name)?;
                let addr = self.next_addr;
                self.next_addr += 1;
                self.heap.insert(addr, v);
                Ok(Value::HeapAddr(addr))
            }
            Expr::SetLiteral(elems) => {
                let mut items = BTreeSet::new();
                for e in elems {
                    items.insert(to_ordinal(&self.eval(e)?)?);
                }
                Ok(Value::Set(items))
            }
            Expr::SetIn { value, set } => {
                let v = self.eval(value)?;
                let s = self.eval(set)?;
                let Value::Set(items) = s else {
                    return Err(RuntimeError::Other("`in` requires a set".to_string()));
                };
                Ok(Value::Bool(items.contains(&to_ordinal(&v)?)))
            }
            Expr::FileEof(name) => {
                let eof = match self.files.get_mut(&ci(name)) {
                    Some(h) => match &mut h.reader {
                        Some(r) => r.fill_buf().map(|b| b.is_empty()).unwrap_or(true),
                        None => true,
                    },
                    None => true,
                };
                Ok(Value::Bool(eof))
            }
        }
    }

    // ------------------------------------------------------------------
    // Calls
    // ------------------------------------------------------------------

    fn call(&mut self, name: &str, args: &[Expr]) -> Result<Value, RuntimeError> {
        if let Some(b) = builtins::lookup(name) {
            let values: Vec<Value> = args.iter().map(|a| self.eval(a)).collect::<Result<_, _>>()?;
            return (b.call)(&values);
        }

        let callable = self
            .functions
            .get(&ci(name))
            .cloned()
            .ok_or_else(|| RuntimeError::UndefinedFunction(name.to_string()))?;

        let flat = ParamGroup::flatten(&callable.params);
        if flat.len() != args.len() {
            return Err(RuntimeError::Other(format!(
                "{}: expected {} argument(s), got {}",
                callable.display_name,
                flat.len(),
                args.len()
            )));
        }

        let mut scope = Scope::new();
        let mut var_params: Vec<(String, String)> = Vec::new();
        for ((param_name, by_ref, _), arg) in flat.iter().zip(args.iter()) {
            if *by_ref {
                let caller_name = match arg {
                    Expr::Variable(n) => n.clone(),
                    _ => {
                        return Err(RuntimeError::Other(format!(
                            "var parameter {param_name:?} requires a variable argument"
                        )))
                    }
                };
                let current = self.load_var(&caller_name)?;
                scope.insert(ci(param_name), current);
                var_params.push((ci(param_name), caller_name));
            } else {
                let v = self.eval(arg)?;
                scope.insert(ci(param_name), v);
            }
        }

        for d in &callable.locals {
            for n in decl_names(d) {
                scope.entry(ci(&n)).or_insert(Value::Nil);
            }
            if let Declaration::Var { names, type_name } = d {
                if self.record_types.contains_key(&ci(type_name)) {
                    for n in names {
                        self.var_record_type.insert(ci(n), ci(type_name));
                    }
                }
            }
        }
        if let Some(rt) = &callable.return_type {
            scope.entry(ci(&callable.display_name)).or_insert_with(|| default_value_for(rt));
        }

        // A callee's own locals/`with` blocks are a separate lexical scope
        // from the caller's; the caller's active `with` records must not
        // leak into the callee's body.
        let saved_with = std::mem::take(&mut self.with_stack);

        self.scopes.push(scope);
        let prior_functions_len = self.functions.len();
        self.register_decls(&callable.nested);
        let _ = prior_functions_len;

        let body = callable.body.clone();
        let result = match self.exec_stmt(&body) {
            Ok(()) => Ok(()),
            Err(Flow::Error(e)) => Err(e),
            Err(Flow::Goto(label)) => Err(RuntimeError::Other(format!(
                "goto {label:?} escaped {}'s body",
                callable.display_name
            ))),
        };

        let scope = self.scopes.pop().expect("pushed above");
        self.with_stack = saved_with;
        for (param_name, caller_name) in &var_params {
            let v = scope.get(param_name).cloned().unwrap_or(Value::Nil);
            self.store_var(caller_name, v);
        }
        result?;

        match &callable.return_type {
            Some(_) => Ok(scope.get(&ci(&callable.display_name)).cloned().unwrap_or(Value::Nil)),
            None => Ok(Value::Nil),
        }
    }
}

impl Default for Interpreter {
    fn default() -> Self {
        Interpreter::new()
    }
}

fn binop_eval(op: &crate::ast::BinOp, a: &Value, b: &Value) -> Result<Value, RuntimeError> {
    use crate::ast::BinOp;
    match op {
        BinOp::Add => a.add(b),
        BinOp::Sub => a.sub(b),
        BinOp::Mul => a.mul(b),
        BinOp::Div => a.div(b),
        BinOp::IDiv => a.idiv(b),
        BinOp::Mod => a.modulo(b),
        BinOp::And => Ok(Value::Bool(a.as_bool()? && b.as_bool()?)),
        BinOp::Or => Ok(Value::Bool(a.as_bool()? || b.as_bool()?)),
        BinOp::Eq => Ok(Value::Bool(a.values_equal(b)?)),
        BinOp::NotEq => Ok(Value::Bool(!a.values_equal(b)?)),
        BinOp::Lt => Ok(Value::Bool(a.compare(b)?.is_lt())),
        BinOp::Gt => Ok(Value::Bool(a.compare(b)?.is_gt())),
        BinOp::Le => Ok(Value::Bool(a.compare(b)?.is_le())),
        BinOp::Ge => Ok(Value::Bool(a.compare(b)?.is_ge())),
    }
}

fn decl_names(d: &Declaration) -> Vec<String> {
    match d {
        Declaration::Var { names, .. }
        | Declaration::ArrayVar { names, .. }
        | Declaration::FileVar { names, .. }
        | Declaration::PointerVar { names, .. }
        | Declaration::SetVar { names, .. } => names.clone(),
        Declaration::Const { name, .. } => vec![name.clone()],
        _ => Vec::new(),
    }
}

fn to_ordinal(v: &Value) -> Result<i64, RuntimeError> {
    match v {
        Value::Int(n) => Ok(*n),
        Value::Bool(b) => Ok(*b as i64),
        Value::Real(n) => Ok(*n as i64),
        Value::Str(s) => Ok(s.chars().next().map(|c| c as i64).unwrap_or(0)),
        other => Err(RuntimeError::Other(format!("cannot use {} as a set element", other.type_name()))),
    }
}

fn default_value_for(elem_type: &str) -> Value {
    match elem_type.to_lowercase().as_str() {
        "integer" => Value::Int(0),
        "real" => Value::Real(0.0),
        "string" => Value::Str(String::new()),
        "boolean" => Value::Bool(false),
        _ => Value::Nil,
    }
}

fn read_token_from(input: &mut dyn BufRead) -> Result<Value, RuntimeError> {
    let mut token = String::new();
    let mut started = false;
    loop {
        let mut byte = [0u8; 1];
        let n = input.read(&mut byte).map_err(|e| RuntimeError::Other(e.to_string()))?;
        if n == 0 {
            break;
        }
        let ch = byte[0] as char;
        if ch.is_whitespace() {
            if started {
                break;
            }
            continue;
        }
        started = true;
        token.push(ch);
    }
    Ok(parse_token(&token))
}

fn parse_token(token: &str) -> Value {
    if let Ok(n) = token.parse::<i64>() {
        return Value::Int(n);
    }
    if let Ok(f) = token.parse::<f64>() {
        return Value::Real(f);
    }
    Value::Str(token.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::CompilationUnit;
    use crate::parser::parse;
    use std::io::Cursor;

    fn run_src(src: &str) -> Interpreter {
        let program = match parse(src).unwrap() {
            CompilationUnit::Program(p) => p,
            _ => panic!("expected a program"),
        };
        let mut interp = Interpreter::new();
        let mut loader = SourceUnitLoader::new(".");
        interp.run_program(&program, &mut loader).unwrap();
        interp
    }

    fn output_of(i: &Interpreter) -> String {
        String::from_utf8(i.output().to_vec()).unwrap()
    }

    #[test]
    fn fibonacci_while_loop_prints_expected_value() {
        let i = run_src(
            "program Fib; var a, b, t, i: integer; \
             begin a := 0; b := 1; i := 0; \
             while i < 5 do begin t := a + b; a := b; b := t; i := i + 1; end; \
             writeln(a); end.",
        );
        assert_eq!(output_of(&i).trim(), "5");
    }

    #[test]
    fn var_parameter_swap_mutates_caller_variables() {
        let i = run_src(
            "program Swap; var x, y: integer; \
             procedure DoSwap(var a, b: integer); var t: integer; \
             begin t := a; a := b; b := t; end; \
             begin x := 1; y := 2; DoSwap(x, y); writeln(x); writeln(y); end.",
        );
        assert_eq!(output_of(&i).trim(), "2\n1");
    }

    #[test]
    fn function_return_value_is_usable_by_caller() {
        let i = run_src(
            "program Sq; function Square(n: integer): integer; \
             begin Square := n * n; end; \
             begin writeln(Square(5)); end.",
        );
        assert_eq!(output_of(&i).trim(), "25");
    }

    #[test]
    fn goto_jumps_forward_within_the_same_block() {
        let i = run_src(
            "program G; var x: integer; \
             begin x := 1; goto 10; x := 99; 10: x := 2; writeln(x); end.",
        );
        assert_eq!(output_of(&i).trim(), "2");
    }

    #[test]
    fn recursive_function_computes_factorial() {
        let i = run_src(
            "program F; function Fact(n: integer): integer; \
             begin if n <= 1 then Fact := 1 else Fact := n * Fact(n - 1); end; \
             begin writeln(Fact(5)); end.",
        );
        assert_eq!(output_of(&i).trim(), "120");
    }

    #[test]
    fn console_read_parses_integer_token() {
        let program = match parse("program R; var x: integer; begin read(x); writeln(x * 2); end.").unwrap() {
            CompilationUnit::Program(p) => p,
            _ => panic!("expected a program"),
        };
        let mut interp = Interpreter::new().with_input(Box::new(Cursor::new(b"21\n".to_vec())));
        let mut loader = SourceUnitLoader::new(".");
        interp.run_program(&program, &mut loader).unwrap();
        assert_eq!(output_of(&interp).trim(), "42");
    }

    #[test]
    fn array_store_and_load_round_trip() {
        let i = run_src(
            "program A; var nums: array[1..3] of integer; i: integer; \
             begin for i := 1 to 3 do nums[i] := i * i; writeln(nums[3]); end.",
        );
        assert_eq!(output_of(&i).trim(), "9");
    }
}
