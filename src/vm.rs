// ABOUTME: Stack-oriented bytecode executor with call frames, a closure-capable scope chain, a pointer heap, and unit linking

use crate::builtins;
use crate::bytecode::{ArrayMeta, EnumMeta, FunctionMeta, Op, Operand, Primitive, Program, Unit};
use crate::error::RuntimeError;
use crate::unit_loader::BytecodeUnitLoader;
use crate::value::{Ordinal, Value};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fs::File;
use std::io::{self, BufRead, BufReader, Read as IoRead, Write as IoWrite};

type Scope = HashMap<String, Value>;

/// Per-call bookkeeping: where to resume, and which local parameters were
/// bound by reference so `RETURN` can write their final value back to the
/// caller's variable.
struct CallFrame {
    return_addr: usize,
    var_params: Vec<(String, String)>,
}

struct FileHandle {
    filename: String,
    reader: Option<BufReader<File>>,
    writer: Option<File>,
}

impl FileHandle {
    fn new(filename: String) -> Self {
        FileHandle { filename, reader: None, writer: None }
    }
}

pub struct Vm {
    instructions: Vec<Op>,
    labels: HashMap<String, usize>,
    functions: HashMap<String, FunctionMeta>,
    array_meta: HashMap<String, ArrayMeta>,
    arrays: HashMap<String, Vec<Value>>,
    enums: HashMap<String, EnumMeta>,
    globals: Scope,
    scopes: Vec<Scope>,
    frames: Vec<CallFrame>,
    stack: Vec<Value>,
    heap: HashMap<u64, Value>,
    next_addr: u64,
    files: HashMap<String, FileHandle>,
    ip: usize,
    out: Vec<u8>,
    input: Box<dyn BufRead>,
    finalizations: Vec<(usize, usize)>,
}

impl Vm {
    pub fn new() -> Self {
        Vm {
            instructions: Vec::new(),
            labels: HashMap::new(),
            functions: HashMap::new(),
            array_meta: HashMap::new(),
            arrays: HashMap::new(),
            enums: HashMap::new(),
            globals: HashMap::new(),
            scopes: Vec::new(),
            frames: Vec::new(),
            stack: Vec::new(),
            heap: HashMap::new(),
            next_addr: 1,
            files: HashMap::new(),
            ip: 0,
            out: Vec::new(),
            input: Box::new(BufReader::new(io::stdin())),
            finalizations: Vec::new(),
        }
    }

    pub fn with_input(mut self, input: Box<dyn BufRead>) -> Self {
        self.input = input;
        self
    }

    /// Text written by `write`/`writeln`. The CLI flushes this to real
    /// stdout after the program halts; tests read it directly.
    pub fn output(&self) -> &[u8] {
        &self.out
    }

    fn ci(name: &str) -> String {
        name.to_lowercase()
    }

    // ------------------------------------------------------------------
    // Linking
    // ------------------------------------------------------------------

    /// Loads a compiled program, links every unit it (transitively) uses,
    /// runs their initialization code, and allocates array storage.
    pub fn link_program(
        &mut self,
        program: &Program,
        loader: &mut BytecodeUnitLoader,
    ) -> Result<(), RuntimeError> {
        self.instructions = program.instructions.clone();
        self.labels = program.labels.clone();
        self.functions = program.functions.clone();
        self.array_meta = program.arrays.clone();
        self.enums = program.enums.clone();

        let mut linked = HashSet::new();
        for name in program.uses.clone() {
            self.link_unit(&name, loader, &mut linked)?;
        }
        self.allocate_arrays();
        Ok(())
    }

    fn link_unit(
        &mut self,
        name: &str,
        loader: &mut BytecodeUnitLoader,
        linked: &mut HashSet<String>,
    ) -> Result<(), RuntimeError> {
        let key = Self::ci(name);
        if linked.contains(&key) {
            return Ok(());
        }
        linked.insert(key);

        let unit = loader.load(name).map_err(|e| RuntimeError::Other(e.to_string()))?;
        for dep in unit.uses.clone() {
            self.link_unit(&dep, loader, linked)?;
        }

        let base = self.instructions.len();
        self.instructions.extend(unit.instructions.iter().cloned());
        for (label, addr) in &unit.labels {
            self.labels.entry(label.clone()).or_insert(addr + base);
        }
        for (fname, meta) in &unit.functions {
            self.functions.entry(fname.clone()).or_insert_with(|| {
                let mut m = meta.clone();
                m.address += base as u32;
                m
            });
        }
        for (aname, meta) in &unit.arrays {
            self.array_meta.entry(aname.clone()).or_insert_with(|| meta.clone());
        }
        for (ename, meta) in &unit.enums {
            self.enums.entry(ename.clone()).or_insert_with(|| meta.clone());
        }

        let init_base = self.instructions.len();
        self.instructions.extend(unit.initialization.iter().cloned());
        let init_end = self.instructions.len();
        self.run_segment(init_base, Some(init_end))?;

        let fin_base = self.instructions.len();
        self.instructions.extend(unit.finalization.iter().cloned());
        let fin_end = self.instructions.len();
        if fin_end > fin_base {
            self.finalizations.push((fin_base, fin_end));
        }
        Ok(())
    }

    fn allocate_arrays(&mut self) {
        for (name, meta) in self.array_meta.clone() {
            let size: i64 = meta.dimensions.iter().map(|(lo, hi)| hi - lo + 1).product();
            let default = default_value_for(&meta.elem_type);
            self.arrays.insert(name, vec![default; size.max(0) as usize]);
        }
    }

    // ------------------------------------------------------------------
    // Execution
    // ------------------------------------------------------------------

    /// Runs the linked program to completion, then each linked unit's
    /// finalization list in reverse link order (teardown mirrors setup).
    pub fn run(&mut self) -> Result<(), RuntimeError> {
        self.run_segment(0, None)?;
        for (start, end) in self.finalizations.clone().into_iter().rev() {
            self.run_segment(start, Some(end))?;
        }
        Ok(())
    }

    /// Executes instructions starting at `start` until `HALT`, an out of
    /// range instruction pointer, or (if given) `stop_at` is reached.
    fn run_segment(&mut self, start: usize, stop_at: Option<usize>) -> Result<(), RuntimeError> {
        self.ip = start;
        loop {
            if let Some(stop) = stop_at {
                if self.ip >= stop {
                    return Ok(());
                }
            }
            let Some(op) = self.instructions.get(self.ip).cloned() else {
                return Ok(());
            };
            self.ip += 1;
            if self.step(&op)? {
                return Ok(());
            }
        }
    }

    /// Executes one instruction. Returns `Ok(true)` when it was `HALT`.
    fn step(&mut self, op: &Op) -> Result<bool, RuntimeError> {
        match op {
            Op::Push(operand) => self.stack.push(operand_to_value(operand)),
            Op::Pop => {
                self.pop()?;
            }
            Op::Dup => {
                let v = self.peek()?.clone();
                self.stack.push(v);
            }

            Op::LoadVar(name) => {
                let v = self.load_var(name)?;
                self.stack.push(v);
            }
            Op::StoreVar(name) => {
                let v = self.pop()?;
                self.store_var(name, v);
            }

            Op::Add => self.binop(Value::add)?,
            Op::Sub => self.binop(Value::sub)?,
            Op::Mul => self.binop(Value::mul)?,
            Op::Div => self.binop(Value::div)?,
            Op::IDiv => self.binop(Value::idiv)?,
            Op::Mod => self.binop(Value::modulo)?,
            Op::Neg => {
                let v = self.pop()?;
                self.stack.push(v.neg()?);
            }

            Op::Eq => {
                let (a, b) = self.pop2()?;
                self.stack.push(Value::Bool(a.values_equal(&b)?));
            }
            Op::Ne => {
                let (a, b) = self.pop2()?;
                self.stack.push(Value::Bool(!a.values_equal(&b)?));
            }
            Op::Lt => self.relop(|o| o.is_lt())?,
            Op::Gt => self.relop(|o| o.is_gt())?,
            Op::Le => self.relop(|o| o.is_le())?,
            Op::Ge => self.relop(|o| o.is_ge())?,

            Op::And => {
                let (a, b) = self.pop2()?;
                self.stack.push(Value::Bool(a.as_bool()? && b.as_bool()?));
            }
            Op::Or => {
                let (a, b) = self.pop2()?;
                self.stack.push(Value::Bool(a.as_bool()? || b.as_bool()?));
            }
            Op::Not => {
                let v = self.pop()?;
                self.stack.push(v.not()?);
            }

            Op::Jump(label) => self.ip = self.resolve_label(label)?,
            Op::JumpIfFalse(label) => {
                let v = self.pop()?;
                if !v.as_bool()? {
                    self.ip = self.resolve_label(label)?;
                }
            }
            Op::JumpIfTrue(label) => {
                let v = self.pop()?;
                if v.as_bool()? {
                    self.ip = self.resolve_label(label)?;
                }
            }
            Op::CaseJump => {
                let (a, b) = self.pop2()?;
                self.stack.push(Value::Bool(a.values_equal(&b)?));
            }
            Op::CaseRange => {
                let hi = self.pop()?.as_int()?;
                let lo = self.pop()?.as_int()?;
                let v = self.pop()?.as_int()?;
                self.stack.push(Value::Bool(v >= lo && v <= hi));
            }

            Op::Call(name) => self.call(name)?,
            Op::Return => self.do_return()?,

            Op::Write => self.do_write(false)?,
            Op::Writeln => self.do_write(true)?,
            Op::Read(hint) => {
                let v = self.read_token(hint)?;
                self.stack.push(v);
            }

            Op::New(name) => {
                let addr = self.next_addr;
                self.next_addr += 1;
                self.heap.insert(addr, Value::Int(0));
                self.store_var(name, Value::HeapAddr(addr));
            }
            Op::Dispose(name) => {
                let v = self.load_var(name)?;
                if let Value::HeapAddr(addr) = v {
                    self.heap.remove(&addr);
                }
                self.store_var(name, Value::Nil);
            }
            Op::Deref => {
                let v = self.pop()?;
                self.stack.push(self.deref(&v)?);
            }
            Op::StoreDeref => {
                let addr_val = self.pop()?;
                let value = self.pop()?;
                let addr = self.pointer_addr(&addr_val)?;
                if !self.heap.contains_key(&addr) {
                    return Err(RuntimeError::InvalidPointer);
                }
                self.heap.insert(addr, value);
            }
            Op::AddrOf(name) => {
                let v = self.load_var(name)?;
                let addr = self.next_addr;
                self.next_addr += 1;
                self.heap.insert(addr, v);
                self.stack.push(Value::HeapAddr(addr));
            }
            Op::PushNil => self.stack.push(Value::Nil),

            Op::FileAssign(name) => {
                let filename = self.pop()?.as_str()?.to_string();
                self.files.insert(Self::ci(name), FileHandle::new(filename));
            }
            Op::FileReset(name) => self.file_reset(name)?,
            Op::FileRewrite(name) => self.file_rewrite(name)?,
            Op::FileClose(name) => {
                if let Some(h) = self.files.get_mut(&Self::ci(name)) {
                    h.reader = None;
                    h.writer = None;
                }
            }
            Op::FileRead { file, targets } => self.file_read(file, targets)?,
            Op::FileWrite { file, values } => self.file_write(file, *values)?,
            Op::FileEof(name) => {
                let eof = self.file_eof(name);
                self.stack.push(Value::Bool(eof));
            }

            Op::SetLiteral(n) => {
                let mut items = BTreeSet::new();
                for _ in 0..*n {
                    items.insert(to_ordinal(&self.pop()?)?);
                }
                self.stack.push(Value::Set(items));
            }
            Op::SetContains => {
                let set = self.pop()?;
                let value = self.pop()?;
                let Value::Set(items) = set else {
                    return Err(RuntimeError::Other("`in` requires a set".to_string()));
                };
                self.stack.push(Value::Bool(items.contains(&to_ordinal(&value)?)));
            }

            Op::ArrayLoad { name, dim_count } => {
                let idx = self.array_index(name, *dim_count)?;
                let arr = self.array_storage(name)?;
                self.stack.push(arr[idx].clone());
            }
            Op::ArrayStore { name, dim_count } => {
                let idx = self.array_index(name, *dim_count)?;
                let value = self.pop()?;
                let arr = self.array_storage(name)?;
                arr[idx] = value;
            }

            Op::Abs | Op::Sqr | Op::Sqrt | Op::Sin | Op::Cos | Op::Arctan | Op::Ln | Op::Exp
            | Op::Trunc | Op::Round | Op::Odd | Op::Length | Op::Upcase | Op::Lowercase
            | Op::Chr | Op::Ord => {
                let name = builtin_name(op);
                let arg = self.pop()?;
                self.stack.push(call_builtin(name, &[arg])?);
            }
            Op::Copy => {
                let count = self.pop()?;
                let start = self.pop()?;
                let source = self.pop()?;
                self.stack.push(call_builtin("copy", &[source, start, count])?);
            }
            Op::Pos => {
                let haystack = self.pop()?;
                let needle = self.pop()?;
                self.stack.push(call_builtin("pos", &[needle, haystack])?);
            }
            Op::Concat(n) => {
                let mut args = Vec::with_capacity(*n);
                for _ in 0..*n {
                    args.push(self.pop()?);
                }
                args.reverse();
                self.stack.push(call_builtin("concat", &args)?);
            }

            Op::Halt => return Ok(true),
            Op::Nop => {}
        }
        Ok(false)
    }

    // ------------------------------------------------------------------
    // Stack helpers
    // ------------------------------------------------------------------

    fn pop(&mut self) -> Result<Value, RuntimeError> {
        self.stack.pop().ok_or_else(|| RuntimeError::Other("stack underflow".to_string()))
    }

    fn peek(&self) -> Result<&Value, RuntimeError> {
        self.stack.last().ok_or_else(|| RuntimeError::Other("stack underflow".to_string()))
    }

    /// Pops `b` then `a`, returning `(a, b)` in push order.
    fn pop2(&mut self) -> Result<(Value, Value), RuntimeError> {
        let b = self.pop()?;
        let a = self.pop()?;
        Ok((a, b))
    }

    fn binop(&mut self, f: fn(&Value, &Value) -> Result<Value, RuntimeError>) -> Result<(), RuntimeError> {
        let (a, b) = self.pop2()?;
        self.stack.push(f(&a, &b)?);
        Ok(())
    }

    fn relop(&mut self, f: fn(std::cmp::Ordering) -> bool) -> Result<(), RuntimeError> {
        let (a, b) = self.pop2()?;
        self.stack.push(Value::Bool(f(a.compare(&b)?)));
        Ok(())
    }

    fn resolve_label(&self, label: &str) -> Result<usize, RuntimeError> {
        self.labels.get(label).copied().ok_or_else(|| RuntimeError::UnresolvedLabel(label.to_string()))
    }

    // ------------------------------------------------------------------
    // Variables — scope chain, then globals; enum values resolve on load.
    // ------------------------------------------------------------------

    fn load_var(&self, name: &str) -> Result<Value, RuntimeError> {
        let key = Self::ci(name);
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

    /// Writes into the innermost scope that already holds `name`; a name no
    /// scope recognizes yet is a new global (matching top-level `var`
    /// declarations, which are never pre-seeded into any call's scope).
    fn store_var(&mut self, name: &str, value: Value) {
        let key = Self::ci(name);
        for scope in self.scopes.iter_mut().rev() {
            if scope.contains_key(&key) {
                scope.insert(key, value);
                return;
            }
        }
        self.globals.insert(key, value);
    }

    fn enum_ordinal(&self, name: &str) -> Option<i64> {
        for meta in self.enums.values() {
            if let Some(idx) = meta.values.iter().position(|v| v.eq_ignore_ascii_case(name)) {
                return Some(idx as i64);
            }
        }
        None
    }

    // ------------------------------------------------------------------
    // Calls
    // ------------------------------------------------------------------

    fn call(&mut self, name: &str) -> Result<(), RuntimeError> {
        let meta = self
            .functions
            .get(&Self::ci(name))
            .cloned()
            .ok_or_else(|| RuntimeError::UndefinedFunction(name.to_string()))?;

        let n = meta.param_names.len();
        let mut raw = Vec::with_capacity(n);
        for _ in 0..n {
            raw.push(self.pop()?);
        }
        raw.reverse();

        let mut scope = Scope::new();
        let mut var_params = Vec::new();
        for (i, param_name) in meta.param_names.iter().enumerate() {
            if meta.param_by_ref.get(i).copied().unwrap_or(false) {
                let caller_name = match &raw[i] {
                    Value::Str(s) => s.clone(),
                    _ => {
                        return Err(RuntimeError::Other(format!(
                            "var parameter {param_name:?} requires a variable argument"
                        )))
                    }
                };
                let current = self.load_var(&caller_name)?;
                scope.insert(Self::ci(param_name), current);
                var_params.push((Self::ci(param_name), caller_name));
            } else {
                scope.insert(Self::ci(param_name), raw[i].clone());
            }
        }
        // Pre-seed declared locals (uninitialized per ISO Pascal, so a
        // zero-ish default) so assignments to them land in this frame's
        // scope instead of falling through to `globals`.
        for local in &meta.local_names {
            scope.entry(Self::ci(local)).or_insert(Value::Nil);
        }
        // A function's own name holds its result; seeding it here keeps the
        // first assignment to it local rather than creating a stray global.
        if !meta.return_type.is_empty() {
            scope
                .entry(Self::ci(&meta.display_name))
                .or_insert_with(|| default_value_for(&meta.return_type));
        }

        self.frames.push(CallFrame { return_addr: self.ip, var_params });
        self.scopes.push(scope);
        self.ip = meta.address as usize;
        Ok(())
    }

    fn do_return(&mut self) -> Result<(), RuntimeError> {
        let frame = self.frames.pop().ok_or_else(|| {
            RuntimeError::Other("RETURN with no active call frame".to_string())
        })?;
        let scope = self.scopes.pop().ok_or_else(|| {
            RuntimeError::Other("RETURN with no active scope".to_string())
        })?;
        for (param_name, caller_name) in &frame.var_params {
            let value = scope.get(param_name).cloned().unwrap_or(Value::Nil);
            self.store_var(caller_name, value);
        }
        self.ip = frame.return_addr;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Pointers
    // ------------------------------------------------------------------

    fn pointer_addr(&self, v: &Value) -> Result<u64, RuntimeError> {
        match v {
            Value::HeapAddr(0) | Value::Nil => Err(RuntimeError::NilDereference),
            Value::HeapAddr(addr) => Ok(*addr),
            _ => Err(RuntimeError::Other("not a pointer value".to_string())),
        }
    }

    fn deref(&self, v: &Value) -> Result<Value, RuntimeError> {
        let addr = self.pointer_addr(v)?;
        self.heap.get(&addr).cloned().ok_or(RuntimeError::InvalidPointer)
    }

    // ------------------------------------------------------------------
    // Arrays — `ArrayLoad`/`ArrayStore` pop indices top-to-bottom (last
    // index popped first), matching the emission order in `compiler.rs`.
    // Array-of-record field storage is keyed `"array.field"`; it reuses
    // the base array's dimensions since no separate metadata is recorded
    // for field-projected array keys.
    // ------------------------------------------------------------------

    fn array_meta_for(&self, name: &str) -> Option<&ArrayMeta> {
        if let Some(m) = self.array_meta.get(&Self::ci(name)) {
            return Some(m);
        }
        let base = name.split('.').next()?;
        self.array_meta.get(&Self::ci(base))
    }

    /// Returns the backing storage for `name`, creating it on first use.
    /// A field-projected array like `"rec.field"` (array-of-record column
    /// storage) has no declaration of its own; it borrows its base array's
    /// size the first time one of its elements is touched.
    fn array_storage(&mut self, name: &str) -> Result<&mut Vec<Value>, RuntimeError> {
        let key = Self::ci(name);
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

    fn array_index(&mut self, name: &str, dim_count: usize) -> Result<usize, RuntimeError> {
        let meta = self
            .array_meta_for(name)
            .ok_or_else(|| RuntimeError::Other(format!("no array metadata for {name:?}")))?
            .clone();
        if meta.dimensions.len() != dim_count {
            return Err(RuntimeError::ArrayShapeMismatch {
                expected: meta.dimensions.len(),
                actual: dim_count,
            });
        }
        let mut indices = Vec::with_capacity(dim_count);
        for _ in 0..dim_count {
            indices.push(self.pop()?.as_int()?);
        }
        indices.reverse();

        let mut linear: i64 = 0;
        for ((lo, hi), idx) in meta.dimensions.iter().zip(indices.iter()) {
            if *idx < *lo || *idx > *hi {
                return Err(RuntimeError::IndexOutOfBounds { index: *idx, low: *lo, high: *hi });
            }
            linear = linear * (hi - lo + 1) + (idx - lo);
        }
        Ok(linear as usize)
    }

    // ------------------------------------------------------------------
    // Console and file I/O
    // ------------------------------------------------------------------

    fn do_write(&mut self, newline: bool) -> Result<(), RuntimeError> {
        let count = self.pop()?.as_int()? as usize;
        let mut values = Vec::with_capacity(count);
        for _ in 0..count {
            values.push(self.pop()?);
        }
        values.reverse();
        for v in &values {
            let _ = write!(self.out, "{v}");
        }
        if newline {
            self.out.push(b'\n');
        }
        Ok(())
    }

    /// Best-effort line-oriented token read (no full ISO
    /// file-buffer semantics): skips whitespace, reads one token, and
    /// guesses its runtime type from its shape.
    fn read_token(&mut self, _hint: &str) -> Result<Value, RuntimeError> {
        read_token_from(&mut self.input)
    }

    fn file_reset(&mut self, name: &str) -> Result<(), RuntimeError> {
        let key = Self::ci(name);
        let filename = self
            .files
            .get(&key)
            .map(|h| h.filename.clone())
            .ok_or_else(|| RuntimeError::Other(format!("file {name:?} was never assigned")))?;
        let f = File::open(&filename)
            .map_err(|e| RuntimeError::Other(format!("cannot open {filename:?} for reading: {e}")))?;
        let h = self.files.get_mut(&key).unwrap();
        h.reader = Some(BufReader::new(f));
        Ok(())
    }

    fn file_rewrite(&mut self, name: &str) -> Result<(), RuntimeError> {
        let key = Self::ci(name);
        let filename = self
            .files
            .get(&key)
            .map(|h| h.filename.clone())
            .ok_or_else(|| RuntimeError::Other(format!("file {name:?} was never assigned")))?;
        let f = File::create(&filename)
            .map_err(|e| RuntimeError::Other(format!("cannot open {filename:?} for writing: {e}")))?;
        let h = self.files.get_mut(&key).unwrap();
        h.writer = Some(f);
        Ok(())
    }

    fn file_eof(&mut self, name: &str) -> bool {
        match self.files.get_mut(&Self::ci(name)) {
            Some(h) => match &mut h.reader {
                Some(r) => r.fill_buf().map(|b| b.is_empty()).unwrap_or(true),
                None => true,
            },
            None => true,
        }
    }

    /// Reads `targets.len()` tokens and pushes them in reverse so the
    /// store sequence the compiler emits right after this opcode (one
    /// `StoreVar`/`ArrayStore` per plain-variable target) consumes them in
    /// the original left-to-right order.
    fn file_read(&mut self, file: &str, targets: &[String]) -> Result<(), RuntimeError> {
        let key = Self::ci(file);
        let mut values = Vec::with_capacity(targets.len());
        for _ in targets {
            let v = match self.files.get_mut(&key).and_then(|h| h.reader.as_mut()) {
                Some(reader) => read_token_from(reader)?,
                None => Value::Int(0),
            };
            values.push(v);
        }
        for v in values.into_iter().rev() {
            self.stack.push(v);
        }
        Ok(())
    }

    fn file_write(&mut self, file: &str, count: usize) -> Result<(), RuntimeError> {
        let mut values = Vec::with_capacity(count);
        for _ in 0..count {
            values.push(self.pop()?);
        }
        values.reverse();
        let key = Self::ci(file);
        if let Some(writer) = self.files.get_mut(&key).and_then(|h| h.writer.as_mut()) {
            for v in &values {
                let _ = write!(writer, "{v}");
            }
        }
        Ok(())
    }
}

impl Default for Vm {
    fn default() -> Self {
        Vm::new()
    }
}

fn operand_to_value(operand: &Operand) -> Value {
    match operand {
        Operand::None => Value::Nil,
        Operand::Int(n) => Value::Int(*n as i64),
        Operand::Real(n) => Value::Real(*n),
        Operand::Str(s) => Value::Str(s.clone()),
        Operand::Bool(b) => Value::Bool(*b),
        Operand::StrList(items) => Value::Str(items.join(",")),
        Operand::PrimitiveList(items) => {
            Value::Str(items.iter().map(primitive_display).collect::<Vec<_>>().join(","))
        }
    }
}

fn primitive_display(p: &Primitive) -> String {
    match p {
        Primitive::Int(n) => n.to_string(),
        Primitive::Str(s) => s.clone(),
        Primitive::Bool(b) => b.to_string(),
    }
}

fn to_ordinal(v: &Value) -> Result<Ordinal, RuntimeError> {
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

fn builtin_name(op: &Op) -> &'static str {
    match op {
        Op::Abs => "abs",
        Op::Sqr => "sqr",
        Op::Sqrt => "sqrt",
        Op::Sin => "sin",
        Op::Cos => "cos",
        Op::Arctan => "arctan",
        Op::Ln => "ln",
        Op::Exp => "exp",
        Op::Trunc => "trunc",
        Op::Round => "round",
        Op::Odd => "odd",
        Op::Length => "length",
        Op::Upcase => "upcase",
        Op::Lowercase => "lowercase",
        Op::Chr => "chr",
        Op::Ord => "ord",
        _ => unreachable!("builtin_name called with a non-builtin opcode"),
    }
}

fn call_builtin(name: &str, args: &[Value]) -> Result<Value, RuntimeError> {
    let b = builtins::lookup(name)
        .ok_or_else(|| RuntimeError::Other(format!("no such built-in {name:?}")))?;
    (b.call)(args)
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
    use crate::compiler::compile_program;
    use crate::parser::parse;
    use std::io::Cursor;

    fn compile(src: &str) -> Program {
        match parse(src).unwrap() {
            crate::ast::CompilationUnit::Program(p) => compile_program(&p),
            _ => panic!("expected a program"),
        }
    }

    fn run_src(src: &str) -> Vm {
        let program = compile(src);
        let mut vm = Vm::new();
        let mut loader = BytecodeUnitLoader::new(".");
        vm.link_program(&program, &mut loader).unwrap();
        vm.run().unwrap();
        vm
    }

    fn output_of(vm: &Vm) -> String {
        String::from_utf8(vm.output().to_vec()).unwrap()
    }

    #[test]
    fn fibonacci_for_loop_prints_expected_sequence() {
        let vm = run_src(
            "program Fib; var a, b, t, i: integer; \
             begin a := 0; b := 1; \
             for i := 1 to 5 do begin t := a + b; a := b; b := t; end; \
             writeln(a); end.",
        );
        assert_eq!(output_of(&vm).trim(), "5");
    }

    #[test]
    fn var_parameter_swap_mutates_caller_variables() {
        let vm = run_src(
            "program Swap; var x, y: integer; \
             procedure DoSwap(var a, b: integer); var t: integer; \
             begin t := a; a := b; b := t; end; \
             begin x := 1; y := 2; DoSwap(x, y); writeln(x); writeln(y); end.",
        );
        assert_eq!(output_of(&vm).trim(), "2\n1");
    }

    #[test]
    fn function_return_value_is_usable_by_caller() {
        let vm = run_src(
            "program Sq; function Square(n: integer): integer; \
             begin Square := n * n; end; \
             begin writeln(Square(5)); end.",
        );
        assert_eq!(output_of(&vm).trim(), "25");
    }

    #[test]
    fn case_with_ranges_selects_matching_branch() {
        let vm = run_src(
            "program C; var x: integer; begin x := 7; \
             case x of 1..5: writeln(1); 6..10: writeln(2); else writeln(0); end; end.",
        );
        assert_eq!(output_of(&vm).trim(), "2");
    }

    #[test]
    fn pointer_new_dispose_round_trip() {
        let vm = run_src(
            "program P; type PInt = ^integer; var p: PInt; \
             begin new(p); p^ := 42; writeln(p^); dispose(p); end.",
        );
        assert_eq!(output_of(&vm).trim(), "42");
    }

    #[test]
    fn set_membership_checks_ordinal_contents() {
        let vm = run_src(
            "program S; var ok: boolean; begin ok := 3 in [1, 2, 3]; writeln(ok); end.",
        );
        assert_eq!(output_of(&vm).trim(), "TRUE");
    }

    #[test]
    fn console_read_parses_integer_token() {
        let program = compile(
            "program R; var x: integer; begin read(x); writeln(x * 2); end.",
        );
        let mut vm = Vm::new().with_input(Box::new(Cursor::new(b"21\n".to_vec())));
        let mut loader = BytecodeUnitLoader::new(".");
        vm.link_program(&program, &mut loader).unwrap();
        vm.run().unwrap();
        assert_eq!(output_of(&vm).trim(), "42");
    }

    #[test]
    fn array_store_and_load_round_trip() {
        let vm = run_src(
            "program A; var nums: array[1..3] of integer; i: integer; \
             begin for i := 1 to 3 do nums[i] := i * i; writeln(nums[3]); end.",
        );
        assert_eq!(output_of(&vm).trim(), "9");
    }

    #[test]
    fn undeclared_variable_is_a_runtime_error() {
        let program = Program {
            name: "X".to_string(),
            instructions: vec![Op::LoadVar("missing".to_string()), Op::Halt],
            ..Default::default()
        };
        let mut vm = Vm::new();
        let mut loader = BytecodeUnitLoader::new(".");
        vm.link_program(&program, &mut loader).unwrap();
        assert!(matches!(vm.run(), Err(RuntimeError::UndeclaredVariable(_))));
    }
}
