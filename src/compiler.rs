// ABOUTME: Lowers the AST into stack-machine bytecode per the compilation patterns for each statement kind

use crate::ast::{
    BinOp, CaseLabelValue, CompilationUnit, Declaration, Expr, FileOp, LValue, ParamGroup,
    Program as AstProgram, Stmt, Unit as AstUnit, UnOp,
};
use crate::bytecode::{ArrayMeta, EnumMeta, FunctionMeta, Op, Operand, Program, Unit};
use crate::builtins;

struct LabelGen {
    next: usize,
}

impl LabelGen {
    fn new() -> Self {
        LabelGen { next: 0 }
    }

    /// Every generated name is unique within a compiled program; label
    /// names must stay unique within a single program or unit.
    fn fresh(&mut self, hint: &str) -> String {
        let n = self.next;
        self.next += 1;
        format!("__{hint}_{n}")
    }
}

/// Shared lowering state threaded through every `compile_*` call so that
/// nested procedures/functions append into the same flat instruction
/// vector the outer program/unit uses for out-of-line body emission.
struct Lowering {
    instructions: Vec<Op>,
    labels: std::collections::HashMap<String, usize>,
    functions: std::collections::HashMap<String, FunctionMeta>,
    arrays: std::collections::HashMap<String, ArrayMeta>,
    enums: std::collections::HashMap<String, EnumMeta>,
    variables: Vec<String>,
    gen: LabelGen,
    /// Record type name (lowercase) -> declared field names, gathered from
    /// every `Declaration::RecordType` seen so far.
    record_types: std::collections::HashMap<String, Vec<String>>,
    /// Record variable name (lowercase) -> its declared record type name
    /// (lowercase), so a `with` statement can look up the type's fields.
    var_record_type: std::collections::HashMap<String, String>,
    /// Stack of `(record var name, field names)` pairs for `with` bodies
    /// currently being lowered, innermost last.
    with_stack: Vec<(String, Vec<String>)>,
}

impl Lowering {
    fn new() -> Self {
        Lowering {
            instructions: Vec::new(),
            labels: std::collections::HashMap::new(),
            functions: std::collections::HashMap::new(),
            arrays: std::collections::HashMap::new(),
            enums: std::collections::HashMap::new(),
            variables: Vec::new(),
            gen: LabelGen::new(),
            record_types: std::collections::HashMap::new(),
            var_record_type: std::collections::HashMap::new(),
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
            .get(&var_name.to_lowercase())
            .and_then(|ty| self.record_types.get(ty))
            .cloned()
            .unwrap_or_default()
    }

    fn emit(&mut self, op: Op) {
        self.instructions.push(op);
    }

    fn mark_label(&mut self, name: &str) {
        self.labels.insert(name.to_string(), self.instructions.len());
    }

    fn remember_variable(&mut self, name: &str) {
        if !self.variables.iter().any(|v| v.eq_ignore_ascii_case(name)) {
            self.variables.push(name.to_string());
        }
    }

    fn lower_decls(&mut self, decls: &[Declaration]) {
        // Record types are registered up front so a `var` group earlier in
        // the same list as its record type (or a nested scope's `with`)
        // still sees the field table.
        for d in decls {
            if let Declaration::RecordType { name, fields } = d {
                self.record_types.insert(
                    name.to_lowercase(),
                    fields.iter().map(|f| f.name.clone()).collect(),
                );
            }
        }
        for d in decls {
            match d {
                Declaration::Var { names, type_name } => {
                    for n in names {
                        self.remember_variable(n);
                        if self.record_types.contains_key(&type_name.to_lowercase()) {
                            self.var_record_type.insert(n.to_lowercase(), type_name.to_lowercase());
                        }
                    }
                }
                Declaration::ArrayVar { names, dimensions, elem_type } => {
                    for n in names {
                        self.remember_variable(n);
                        self.arrays.insert(
                            n.to_lowercase(),
                            ArrayMeta { dimensions: dimensions.clone(), elem_type: elem_type.clone() },
                        );
                    }
                }
                Declaration::FileVar { names, .. }
                | Declaration::PointerVar { names, .. }
                | Declaration::SetVar { names, .. } => {
                    names.iter().for_each(|n| self.remember_variable(n))
                }
                Declaration::EnumType { name, values } => {
                    self.enums
                        .insert(name.to_lowercase(), EnumMeta { values: values.clone() });
                }
                Declaration::Const { name, .. } => self.remember_variable(name),
                Declaration::RecordType { .. } => {}
                Declaration::Procedure { name, params, locals, nested, body } => {
                    self.lower_subprogram(name, params, None, locals, nested, body);
                }
                Declaration::Function { name, params, return_type, locals, nested, body } => {
                    self.lower_subprogram(name, params, Some(return_type.as_str()), locals, nested, body);
                }
            }
        }
    }

    /// Emits a procedure/function body out of line behind a skip-jump, then
    /// records its entry address in the function metadata table — the
    /// shape used for every subprogram.
    fn lower_subprogram(
        &mut self,
        name: &str,
        params: &[ParamGroup],
        return_type: Option<&str>,
        locals: &[Declaration],
        nested: &[Declaration],
        body: &Stmt,
    ) {
        let flat = ParamGroup::flatten(params);
        let key = name.to_lowercase();

        // Registered before the body is lowered (address patched in below) so
        // a self-recursive call can already see this subprogram's by-ref
        // parameter shape when `lower_call_args` looks it up.
        self.functions.insert(
            key.clone(),
            FunctionMeta {
                display_name: name.to_string(),
                address: 0,
                param_names: flat.iter().map(|(n, _, _)| n.clone()).collect(),
                param_by_ref: flat.iter().map(|(_, by_ref, _)| *by_ref).collect(),
                return_type: return_type.unwrap_or("").to_string(),
                local_names: Vec::new(),
            },
        );

        let skip_label = self.gen.fresh(&format!("skip_{name}"));
        self.emit(Op::Jump(skip_label.clone()));
        let entry = self.instructions.len() as u32;

        let mut local_names = Vec::new();
        for (n, _, _) in &flat {
            local_names.push(n.clone());
        }
        self.lower_decls(locals);
        for d in locals {
            local_names.extend(decl_names(d));
        }
        self.lower_decls(nested);
        self.lower_stmt(body);
        if return_type.is_some() {
            // By convention the function's own name holds its result; load it
            // so RETURN finds the value already sitting on top of the stack.
            self.emit(Op::LoadVar(name.to_string()));
        }
        self.emit(Op::Return);
        self.mark_label(&skip_label);

        let meta = self.functions.get_mut(&key).expect("registered above");
        meta.address = entry;
        meta.local_names = local_names;
    }

    fn lower_stmt(&mut self, stmt: &Stmt) {
        match stmt {
            Stmt::Assign { target, value } => {
                self.lower_expr(value);
                self.lower_store(target);
            }
            Stmt::Compound(stmts) => {
                for s in stmts {
                    self.lower_stmt(s);
                }
            }
            Stmt::If { cond, then_branch, else_branch } => {
                let else_lbl = self.gen.fresh("else");
                let end_lbl = self.gen.fresh("endif");
                self.lower_expr(cond);
                self.emit(Op::JumpIfFalse(else_lbl.clone()));
                self.lower_stmt(then_branch);
                self.emit(Op::Jump(end_lbl.clone()));
                self.mark_label(&else_lbl);
                if let Some(e) = else_branch {
                    self.lower_stmt(e);
                }
                self.mark_label(&end_lbl);
            }
            Stmt::While { cond, body } => {
                let loop_lbl = self.gen.fresh("while");
                let exit_lbl = self.gen.fresh("endwhile");
                self.mark_label(&loop_lbl);
                self.lower_expr(cond);
                self.emit(Op::JumpIfFalse(exit_lbl.clone()));
                self.lower_stmt(body);
                self.emit(Op::Jump(loop_lbl));
                self.mark_label(&exit_lbl);
            }
            Stmt::Repeat { body, cond } => {
                let loop_lbl = self.gen.fresh("repeat");
                self.mark_label(&loop_lbl);
                for s in body {
                    self.lower_stmt(s);
                }
                self.lower_expr(cond);
                self.emit(Op::JumpIfFalse(loop_lbl));
            }
            Stmt::For { var, start, end, downto, body } => {
                let loop_lbl = self.gen.fresh("for");
                let exit_lbl = self.gen.fresh("endfor");
                self.lower_expr(start);
                self.emit(Op::StoreVar(var.clone()));
                self.mark_label(&loop_lbl);
                self.emit(Op::LoadVar(var.clone()));
                self.lower_expr(end);
                self.emit(if *downto { Op::Ge } else { Op::Le });
                self.emit(Op::JumpIfFalse(exit_lbl.clone()));
                self.lower_stmt(body);
                self.emit(Op::LoadVar(var.clone()));
                self.emit(Op::Push(Operand::Int(1)));
                self.emit(if *downto { Op::Sub } else { Op::Add });
                self.emit(Op::StoreVar(var.clone()));
                self.emit(Op::Jump(loop_lbl));
                self.mark_label(&exit_lbl);
            }
            Stmt::Case { selector, branches, else_branch } => {
                let end_lbl = self.gen.fresh("endcase");
                let mut branch_labels = Vec::new();
                for b in branches {
                    let lbl = self.gen.fresh("case");
                    branch_labels.push(lbl.clone());
                    for v in &b.label.values {
                        self.lower_expr(selector);
                        match v {
                            CaseLabelValue::Single(e) => {
                                self.lower_expr(e);
                                self.emit(Op::Eq);
                            }
                            CaseLabelValue::Range(lo, hi) => {
                                self.lower_expr(lo);
                                self.lower_expr(hi);
                                self.emit(Op::CaseRange);
                            }
                        }
                        self.emit(Op::JumpIfTrue(lbl.clone()));
                    }
                }
                if let Some(e) = else_branch {
                    self.lower_stmt(e);
                }
                self.emit(Op::Jump(end_lbl.clone()));
                for (b, lbl) in branches.iter().zip(branch_labels.iter()) {
                    self.mark_label(lbl);
                    self.lower_stmt(&b.body);
                    self.emit(Op::Jump(end_lbl.clone()));
                }
                self.mark_label(&end_lbl);
            }
            Stmt::With { record, body } => {
                let fields = self.fields_for_record_var(record);
                self.with_stack.push((record.clone(), fields));
                self.lower_stmt(body);
                self.with_stack.pop();
            }
            Stmt::Goto(label) => self.emit(Op::Jump(label.clone())),
            Stmt::Labeled { label, stmt } => {
                self.mark_label(label);
                self.lower_stmt(stmt);
            }
            Stmt::ProcCall { name, args } => {
                self.lower_call_args(name, args);
                self.emit(Op::Call(name.clone()));
            }
            Stmt::Write { args, newline } => {
                for a in args {
                    self.lower_expr(a);
                }
                self.emit(Op::Push(Operand::Int(args.len() as i32)));
                self.emit(if *newline { Op::Writeln } else { Op::Write });
            }
            Stmt::Read { targets, newline } => {
                for t in targets {
                    let hint = match t {
                        LValue::Variable(name) => self
                            .resolve_with_field(name)
                            .map(|record| format!("{record}.{name}"))
                            .unwrap_or_else(|| name.clone()),
                        other => lvalue_var_name(other),
                    };
                    self.emit(Op::Read(hint));
                    self.lower_store(t);
                }
                let _ = newline;
            }
            Stmt::File(op) => self.lower_file_op(op),
            Stmt::New(name) => self.emit(Op::New(name.clone())),
            Stmt::Dispose(name) => self.emit(Op::Dispose(name.clone())),
            Stmt::Empty => {}
        }
    }

    fn lower_file_op(&mut self, op: &FileOp) {
        match op {
            FileOp::Assign { file, filename } => {
                self.lower_expr(filename);
                self.emit(Op::FileAssign(file.clone()));
            }
            FileOp::Reset(f) => self.emit(Op::FileReset(f.clone())),
            FileOp::Rewrite(f) => self.emit(Op::FileRewrite(f.clone())),
            FileOp::Close(f) => self.emit(Op::FileClose(f.clone())),
            FileOp::Eof(f) => self.emit(Op::FileEof(f.clone())),
            FileOp::Page(f) | FileOp::Get(f) | FileOp::Put(f) | FileOp::Pack(f) | FileOp::Unpack(f) => {
                // Best-effort line-oriented file ops: treated
                // as no-ops at the bytecode level beyond acknowledging the file.
                let _ = f;
                self.emit(Op::Nop);
            }
            FileOp::Read { file, targets } => {
                let names: Vec<String> = targets.iter().map(lvalue_var_name).collect();
                self.emit(Op::FileRead { file: file.clone(), targets: names });
                for t in targets {
                    self.lower_store(t);
                }
            }
            FileOp::Write { file, values } => {
                for v in values {
                    self.lower_expr(v);
                }
                self.emit(Op::FileWrite { file: file.clone(), values: values.len() });
            }
        }
    }

    fn lower_store(&mut self, target: &LValue) {
        match target {
            LValue::Variable(name) => match self.resolve_with_field(name) {
                Some(record) => self.emit(Op::StoreVar(format!("{record}.{name}"))),
                None => self.emit(Op::StoreVar(name.clone())),
            },
            LValue::ArrayElem { name, indices } => {
                for i in indices {
                    self.lower_expr(i);
                }
                self.emit(Op::ArrayStore { name: name.clone(), dim_count: indices.len() });
            }
            LValue::RecordField { record, field } => {
                self.emit(Op::StoreVar(format!("{record}.{field}")));
            }
            LValue::RecordFieldArrayElem { record, field, indices } => {
                for i in indices {
                    self.lower_expr(i);
                }
                self.emit(Op::ArrayStore {
                    name: format!("{record}.{field}"),
                    dim_count: indices.len(),
                });
            }
            LValue::ArrayElemField { array, index, field } => {
                self.lower_expr(index);
                self.emit(Op::ArrayStore { name: format!("{array}.{field}"), dim_count: 1 });
            }
            LValue::PointerDeref(name) => {
                self.emit(Op::LoadVar(name.clone()));
                self.emit(Op::StoreDeref);
            }
        }
    }

    /// Pushes call arguments left to right. A by-ref parameter whose
    /// argument is a bare variable is pushed as a variable-name reference
    /// (the operand is interpreted as a variable-name index) instead
    /// of its value, so the callee can write back through it.
    fn lower_call_args(&mut self, name: &str, args: &[Expr]) {
        let by_ref = self.functions.get(&name.to_lowercase()).map(|m| m.param_by_ref.clone());
        for (i, a) in args.iter().enumerate() {
            let is_ref = by_ref.as_ref().and_then(|v| v.get(i)).copied().unwrap_or(false);
            if is_ref {
                if let Expr::Variable(var_name) = a {
                    let resolved = self
                        .resolve_with_field(var_name)
                        .map(|record| format!("{record}.{var_name}"))
                        .unwrap_or_else(|| var_name.clone());
                    self.emit(Op::Push(Operand::Str(resolved)));
                    continue;
                }
            }
            self.lower_expr(a);
        }
    }

    fn lower_expr(&mut self, expr: &Expr) {
        match expr {
            Expr::IntLiteral(n) => self.emit(Op::Push(Operand::Int(*n as i32))),
            Expr::RealLiteral(n) => self.emit(Op::Push(Operand::Real(*n))),
            Expr::StringLiteral(s) => self.emit(Op::Push(Operand::Str(s.clone()))),
            Expr::BoolLiteral(b) => self.emit(Op::Push(Operand::Bool(*b))),
            Expr::Nil => self.emit(Op::PushNil),
            Expr::Variable(name) => match self.resolve_with_field(name) {
                Some(record) => self.emit(Op::LoadVar(format!("{record}.{name}"))),
                None => self.emit(Op::LoadVar(name.clone())),
            },
            Expr::Binary { op, lhs, rhs } => {
                self.lower_expr(lhs);
                self.lower_expr(rhs);
                self.emit(binop_opcode(op));
            }
            Expr::Unary { op, operand } => {
                self.lower_expr(operand);
                match op {
                    UnOp::Neg => self.emit(Op::Neg),
                    UnOp::Plus => {}
                    UnOp::Not => self.emit(Op::Not),
                }
            }
            Expr::Call { name, args } => {
                if let Some(op) = builtin_opcode(name, args.len()) {
                    for a in args {
                        self.lower_expr(a);
                    }
                    self.emit(op);
                } else {
                    self.lower_call_args(name, args);
                    self.emit(Op::Call(name.clone()));
                }
            }
            Expr::ArrayAccess { name, indices } => {
                for i in indices {
                    self.lower_expr(i);
                }
                self.emit(Op::ArrayLoad { name: name.clone(), dim_count: indices.len() });
            }
            Expr::FieldAccess { record, field } => {
                self.emit(Op::LoadVar(format!("{record}.{field}")));
            }
            Expr::RecordFieldArrayAccess { record, field, indices } => {
                for i in indices {
                    self.lower_expr(i);
                }
                self.emit(Op::ArrayLoad { name: format!("{record}.{field}"), dim_count: indices.len() });
            }
            Expr::ArrayOfRecordFieldAccess { array, index, field } => {
                self.lower_expr(index);
                self.emit(Op::ArrayLoad { name: format!("{array}.{field}"), dim_count: 1 });
            }
            Expr::Deref(inner) => {
                self.lower_expr(inner);
                self.emit(Op::Deref);
            }
            Expr::AddrOf(name) => match self.resolve_with_field(name) {
                Some(record) => self.emit(Op::AddrOf(format!("{record}.{name}"))),
                None => self.emit(Op::AddrOf(name.clone())),
            },
            Expr::SetLiteral(elems) => {
                for e in elems {
                    self.lower_expr(e);
                }
                self.emit(Op::SetLiteral(elems.len()));
            }
            Expr::SetIn { value, set } => {
                self.lower_expr(value);
                self.lower_expr(set);
                self.emit(Op::SetContains);
            }
            Expr::FileEof(name) => self.emit(Op::FileEof(name.clone())),
        }
    }
}

/// All variable names a single declaration introduces, for populating a
/// subprogram's `local_names` metadata (`var a, b: integer;` introduces two).
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

fn lvalue_var_name(lv: &LValue) -> String {
    match lv {
        LValue::Variable(n) => n.clone(),
        LValue::ArrayElem { name, .. } => name.clone(),
        LValue::RecordField { record, field } => format!("{record}.{field}"),
        LValue::RecordFieldArrayElem { record, field, .. } => format!("{record}.{field}"),
        LValue::ArrayElemField { array, field, .. } => format!("{array}.{field}"),
        LValue::PointerDeref(n) => n.clone(),
    }
}

fn binop_opcode(op: &BinOp) -> Op {
    match op {
        BinOp::Add => Op::Add,
        BinOp::Sub => Op::Sub,
        BinOp::Mul => Op::Mul,
        BinOp::Div => Op::Div,
        BinOp::IDiv => Op::IDiv,
        BinOp::Mod => Op::Mod,
        BinOp::And => Op::And,
        BinOp::Or => Op::Or,
        BinOp::Eq => Op::Eq,
        BinOp::NotEq => Op::Ne,
        BinOp::Lt => Op::Lt,
        BinOp::Gt => Op::Gt,
        BinOp::Le => Op::Le,
        BinOp::Ge => Op::Ge,
    }
}

/// Maps a math/string built-in call to its dedicated opcode. Returns
/// `None` for anything not in that fixed set (a user procedure/function
/// call).
fn builtin_opcode(name: &str, argc: usize) -> Option<Op> {
    builtins::lookup(name)?;
    match name.to_lowercase().as_str() {
        "abs" => Some(Op::Abs),
        "sqr" => Some(Op::Sqr),
        "sqrt" => Some(Op::Sqrt),
        "sin" => Some(Op::Sin),
        "cos" => Some(Op::Cos),
        "arctan" => Some(Op::Arctan),
        "ln" => Some(Op::Ln),
        "exp" => Some(Op::Exp),
        "trunc" => Some(Op::Trunc),
        "round" => Some(Op::Round),
        "odd" => Some(Op::Odd),
        "length" => Some(Op::Length),
        "copy" => Some(Op::Copy),
        "concat" => Some(Op::Concat(argc)),
        "pos" => Some(Op::Pos),
        "upcase" => Some(Op::Upcase),
        "lowercase" => Some(Op::Lowercase),
        "chr" => Some(Op::Chr),
        "ord" => Some(Op::Ord),
        _ => None,
    }
}

/// Compiles a standalone program into its bytecode form.
pub fn compile_program(program: &AstProgram) -> Program {
    let mut low = Lowering::new();
    low.lower_decls(&program.decls);
    low.lower_stmt(&program.body);
    low.emit(Op::Halt);

    Program {
        name: program.name.clone(),
        uses: program.uses.clone(),
        instructions: low.instructions,
        labels: low.labels,
        variables: low.variables,
        enums: low.enums,
        arrays: low.arrays,
        functions: low.functions,
    }
}

/// Compiles a unit into its bytecode form: the interface+implementation
/// subprograms as normal instructions, plus separate initialization and
/// finalization instruction lists.
pub fn compile_unit(unit: &AstUnit) -> Unit {
    let mut low = Lowering::new();
    low.lower_decls(&unit.interface_decls);
    low.lower_decls(&unit.impl_decls);

    let mut init_low = Lowering::new();
    init_low.labels = low.labels.clone();
    init_low.record_types = low.record_types.clone();
    init_low.var_record_type = low.var_record_type.clone();
    if let Some(init) = &unit.initialization {
        init_low.lower_stmt(init);
    }

    let mut fin_low = Lowering::new();
    fin_low.record_types = low.record_types.clone();
    fin_low.var_record_type = low.var_record_type.clone();
    if let Some(fin) = &unit.finalization {
        fin_low.lower_stmt(fin);
    }

    Unit {
        name: unit.name.clone(),
        uses: unit.uses.clone(),
        instructions: low.instructions,
        labels: low.labels,
        variables: low.variables,
        enums: low.enums,
        arrays: low.arrays,
        functions: low.functions,
        initialization: init_low.instructions,
        finalization: fin_low.instructions,
    }
}

/// Either a compiled standalone program or a compiled unit, mirroring
/// `ast::CompilationUnit`'s top-level split.
pub enum Compiled {
    Program(Program),
    Unit(Unit),
}

pub fn compile(unit: &CompilationUnit) -> Compiled {
    match unit {
        CompilationUnit::Program(p) => Compiled::Program(compile_program(p)),
        CompilationUnit::Unit(u) => Compiled::Unit(compile_unit(u)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{CompilationUnit, Stmt};
    use crate::parser::parse;

    fn compile_src(src: &str) -> Program {
        match parse(src).unwrap() {
            CompilationUnit::Program(p) => compile_program(&p),
            _ => panic!("expected a program"),
        }
    }

    #[test]
    fn assignment_compiles_to_push_then_store() {
        let p = compile_src("program P; var x: integer; begin x := 1; end.");
        assert!(matches!(p.instructions[0], Op::Push(Operand::Int(1))));
        assert!(matches!(&p.instructions[1], Op::StoreVar(n) if n == "x"));
    }

    #[test]
    fn if_else_emits_two_labels_and_a_skip_jump() {
        let p = compile_src(
            "program P; var x: integer; begin if x = 1 then x := 2 else x := 3; end.",
        );
        assert!(p.instructions.iter().any(|op| matches!(op, Op::JumpIfFalse(_))));
        assert_eq!(
            p.instructions.iter().filter(|op| matches!(op, Op::Jump(_))).count(),
            1
        );
    }

    #[test]
    fn for_loop_emits_increment_and_comparison_matching_direction() {
        let p = compile_src(
            "program P; var i: integer; begin for i := 1 to 3 do ; end.",
        );
        assert!(p.instructions.contains(&Op::Le));
        assert!(p.instructions.contains(&Op::Add));

        let p = compile_src(
            "program P; var i: integer; begin for i := 3 downto 1 do ; end.",
        );
        assert!(p.instructions.contains(&Op::Ge));
        assert!(p.instructions.contains(&Op::Sub));
    }

    #[test]
    fn procedure_body_is_emitted_behind_a_skip_jump() {
        let p = compile_src(
            "program P; procedure Greet; begin end; begin Greet; end.",
        );
        assert!(matches!(p.instructions[0], Op::Jump(_)));
        let meta = p.functions.get("greet").expect("function registered");
        assert!((meta.address as usize) < p.instructions.len());
    }

    #[test]
    fn sqrt_call_lowers_to_dedicated_opcode() {
        let p = compile_src(
            "program P; var x: real; begin x := sqrt(4); end.",
        );
        assert!(p.instructions.contains(&Op::Sqrt));
    }

    #[test]
    fn builtin_lookup_distinguishes_user_calls() {
        let p = compile_src(
            "program P; procedure Foo; begin end; begin Foo; end.",
        );
        assert!(p.instructions.iter().any(|op| matches!(op, Op::Call(n) if n == "Foo")));
    }

    #[test]
    fn case_range_branch_uses_case_range_opcode() {
        let p = compile_src(
            "program P; var x: integer; begin case x of 1..5: x := 1; else x := 0; end; end.",
        );
        assert!(p.instructions.contains(&Op::CaseRange));
    }

    #[allow(dead_code)]
    fn unused_stmt_silencer(_s: &Stmt) {}
}
