// ABOUTME: Renders compiled bytecode as a human-readable address/opcode/operand listing

use crate::bytecode::{Op, Operand, Primitive, Program, Unit};
use std::collections::HashMap;
use std::fmt::Write as _;

/// Formats a standalone program for the `--disassemble` CLI flag: a header
/// naming the program, then its instruction stream.
pub fn disassemble_program(program: &Program) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "program {}", program.name);
    if !program.uses.is_empty() {
        let _ = writeln!(out, "  uses {}", program.uses.join(", "));
    }
    let _ = writeln!(out);
    out.push_str(&disassemble_segment("main", &program.instructions, &program.labels));
    out
}

/// Formats a unit: interface/implementation instructions, then its
/// initialization and finalization segments if non-empty.
pub fn disassemble_unit(unit: &Unit) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "unit {}", unit.name);
    if !unit.uses.is_empty() {
        let _ = writeln!(out, "  uses {}", unit.uses.join(", "));
    }
    let _ = writeln!(out);
    out.push_str(&disassemble_segment("body", &unit.instructions, &unit.labels));
    if !unit.initialization.is_empty() {
        let _ = writeln!(out);
        out.push_str(&disassemble_segment("initialization", &unit.initialization, &HashMap::new()));
    }
    if !unit.finalization.is_empty() {
        let _ = writeln!(out);
        out.push_str(&disassemble_segment("finalization", &unit.finalization, &HashMap::new()));
    }
    out
}

fn disassemble_segment(title: &str, instructions: &[Op], labels: &HashMap<String, usize>) -> String {
    let mut by_addr: HashMap<usize, Vec<&str>> = HashMap::new();
    for (label, addr) in labels {
        by_addr.entry(*addr).or_default().push(label);
    }

    let mut out = String::new();
    let _ = writeln!(out, "{title}:");
    for (addr, op) in instructions.iter().enumerate() {
        if let Some(names) = by_addr.get(&addr) {
            for name in names {
                let _ = writeln!(out, "{name}:");
            }
        }
        let _ = writeln!(out, "  {addr:>5}  {}", format_op(op));
    }
    out
}

fn format_op(op: &Op) -> String {
    match op {
        Op::Push(operand) => format!("push {}", format_operand(operand)),
        Op::Pop => "pop".to_string(),
        Op::Dup => "dup".to_string(),
        Op::LoadVar(name) => format!("load_var {name}"),
        Op::StoreVar(name) => format!("store_var {name}"),
        Op::Add => "add".to_string(),
        Op::Sub => "sub".to_string(),
        Op::Mul => "mul".to_string(),
        Op::Div => "div".to_string(),
        Op::IDiv => "idiv".to_string(),
        Op::Mod => "mod".to_string(),
        Op::Neg => "neg".to_string(),
        Op::Eq => "eq".to_string(),
        Op::Ne => "ne".to_string(),
        Op::Lt => "lt".to_string(),
        Op::Gt => "gt".to_string(),
        Op::Le => "le".to_string(),
        Op::Ge => "ge".to_string(),
        Op::And => "and".to_string(),
        Op::Or => "or".to_string(),
        Op::Not => "not".to_string(),
        Op::Jump(label) => format!("jump {label}"),
        Op::JumpIfFalse(label) => format!("jump_if_false {label}"),
        Op::JumpIfTrue(label) => format!("jump_if_true {label}"),
        Op::CaseJump => "case_jump".to_string(),
        Op::CaseRange => "case_range".to_string(),
        Op::Call(name) => format!("call {name}"),
        Op::Return => "return".to_string(),
        Op::Write => "write".to_string(),
        Op::Writeln => "writeln".to_string(),
        Op::Read(name) => format!("read {name}"),
        Op::New(name) => format!("new {name}"),
        Op::Dispose(name) => format!("dispose {name}"),
        Op::Deref => "deref".to_string(),
        Op::StoreDeref => "store_deref".to_string(),
        Op::AddrOf(name) => format!("addr_of {name}"),
        Op::PushNil => "push_nil".to_string(),
        Op::FileAssign(name) => format!("file_assign {name}"),
        Op::FileReset(name) => format!("file_reset {name}"),
        Op::FileRewrite(name) => format!("file_rewrite {name}"),
        Op::FileClose(name) => format!("file_close {name}"),
        Op::FileRead { file, targets } => format!("file_read {file} -> {}", targets.join(", ")),
        Op::FileWrite { file, values } => format!("file_write {file} ({values} values)"),
        Op::FileEof(name) => format!("file_eof {name}"),
        Op::SetLiteral(n) => format!("set_literal {n}"),
        Op::SetContains => "set_contains".to_string(),
        Op::ArrayLoad { name, dim_count } => format!("array_load {name}:{dim_count}"),
        Op::ArrayStore { name, dim_count } => format!("array_store {name}:{dim_count}"),
        Op::Abs => "abs".to_string(),
        Op::Sqr => "sqr".to_string(),
        Op::Sqrt => "sqrt".to_string(),
        Op::Sin => "sin".to_string(),
        Op::Cos => "cos".to_string(),
        Op::Arctan => "arctan".to_string(),
        Op::Ln => "ln".to_string(),
        Op::Exp => "exp".to_string(),
        Op::Trunc => "trunc".to_string(),
        Op::Round => "round".to_string(),
        Op::Odd => "odd".to_string(),
        Op::Length => "length".to_string(),
        Op::Copy => "copy".to_string(),
        Op::Concat(n) => format!("concat {n}"),
        Op::Pos => "pos".to_string(),
        Op::Upcase => "upcase".to_string(),
        Op::Lowercase => "lowercase".to_string(),
        Op::Chr => "chr".to_string(),
        Op::Ord => "ord".to_string(),
        Op::Halt => "halt".to_string(),
        Op::Nop => "nop".to_string(),
    }
}

fn format_operand(operand: &Operand) -> String {
    match operand {
        Operand::None => String::new(),
        Operand::Int(i) => i.to_string(),
        Operand::Real(r) => r.to_string(),
        Operand::Str(s) => format!("{s:?}"),
        Operand::Bool(b) => b.to_string(),
        Operand::StrList(items) => format!("[{}]", items.join(", ")),
        Operand::PrimitiveList(items) => {
            let rendered: Vec<String> = items.iter().map(format_primitive).collect();
            format!("[{}]", rendered.join(", "))
        }
    }
}

fn format_primitive(p: &Primitive) -> String {
    match p {
        Primitive::Int(i) => i.to_string(),
        Primitive::Str(s) => format!("{s:?}"),
        Primitive::Bool(b) => b.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::FunctionMeta;

    #[test]
    fn disassembles_a_simple_program_body() {
        let mut program = Program::new("Demo");
        program.instructions.push(Op::Push(Operand::Int(1)));
        program.instructions.push(Op::StoreVar("x".to_string()));
        program.instructions.push(Op::Halt);
        let text = disassemble_program(&program);
        assert!(text.contains("program Demo"));
        assert!(text.contains("push 1"));
        assert!(text.contains("store_var x"));
        assert!(text.contains("halt"));
    }

    #[test]
    fn labels_are_rendered_before_their_target_instruction() {
        let mut program = Program::new("Demo");
        program.instructions.push(Op::Nop);
        program.instructions.push(Op::Jump("L0".to_string()));
        program.labels.insert("L0".to_string(), 0);
        let text = disassemble_program(&program);
        let label_pos = text.find("L0:").unwrap();
        let nop_pos = text.find("nop").unwrap();
        assert!(label_pos < nop_pos);
    }

    #[test]
    fn unit_segments_appear_in_order_when_present() {
        let mut unit = Unit::new("MathUtils");
        unit.instructions.push(Op::Nop);
        unit.initialization.push(Op::Push(Operand::Int(0)));
        unit.finalization.push(Op::Halt);
        unit.functions.insert(
            "double".to_string(),
            FunctionMeta { display_name: "Double".to_string(), ..Default::default() },
        );
        let text = disassemble_unit(&unit);
        let body_pos = text.find("body:").unwrap();
        let init_pos = text.find("initialization:").unwrap();
        let fin_pos = text.find("finalization:").unwrap();
        assert!(body_pos < init_pos && init_pos < fin_pos);
    }
}
