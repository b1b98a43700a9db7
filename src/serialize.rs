// ABOUTME: Binary encode/decode for the `.pbc` (program) and `.pbu` (unit) bytecode formats

use crate::bytecode::{ArrayMeta, EnumMeta, FunctionMeta, Op, Operand, Primitive, Program, Unit};
use crate::config::{BYTECODE_VERSION, PROGRAM_MAGIC, UNIT_MAGIC};
use crate::error::LoadError;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::collections::HashMap;
use std::io::Cursor;

/// Everything is little-endian; every collection is `u32`-count-prefixed and
/// every string is `u32`-length-prefixed UTF-8.
struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    fn new() -> Self {
        Writer { buf: Vec::new() }
    }

    fn u8(&mut self, v: u8) {
        self.buf.write_u8(v).expect("writing to a Vec never fails");
    }

    fn u16(&mut self, v: u16) {
        self.buf.write_u16::<LittleEndian>(v).expect("writing to a Vec never fails");
    }

    fn u32(&mut self, v: u32) {
        self.buf.write_u32::<LittleEndian>(v).expect("writing to a Vec never fails");
    }

    fn i64(&mut self, v: i64) {
        self.buf.write_i64::<LittleEndian>(v).expect("writing to a Vec never fails");
    }

    fn f64(&mut self, v: f64) {
        self.buf.write_f64::<LittleEndian>(v).expect("writing to a Vec never fails");
    }

    fn bool(&mut self, v: bool) {
        self.u8(v as u8);
    }

    fn string(&mut self, s: &str) {
        self.u32(s.len() as u32);
        self.buf.extend_from_slice(s.as_bytes());
    }

    fn string_list(&mut self, items: &[String]) {
        self.u32(items.len() as u32);
        for s in items {
            self.string(s);
        }
    }

    fn bool_list(&mut self, items: &[bool]) {
        self.u32(items.len() as u32);
        for b in items {
            self.bool(*b);
        }
    }
}

/// Wraps a `Cursor` so every primitive read goes through `byteorder`, with
/// an end-of-buffer short read translated into a `LoadError::ParseFailed`
/// instead of a panic or a silent zero-fill.
struct Reader<'a> {
    cursor: Cursor<&'a [u8]>,
    name: String,
}

fn truncated(name: &str) -> LoadError {
    LoadError::ParseFailed {
        name: name.to_string(),
        message: "unexpected end of bytecode".to_string(),
    }
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8], name: &str) -> Self {
        Reader { cursor: Cursor::new(buf), name: name.to_string() }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], LoadError> {
        let pos = self.cursor.position() as usize;
        let buf = *self.cursor.get_ref();
        if pos + n > buf.len() {
            return Err(truncated(&self.name));
        }
        self.cursor.set_position((pos + n) as u64);
        Ok(&buf[pos..pos + n])
    }

    fn u8(&mut self) -> Result<u8, LoadError> {
        self.cursor.read_u8().map_err(|_| truncated(&self.name))
    }

    fn u16(&mut self) -> Result<u16, LoadError> {
        self.cursor.read_u16::<LittleEndian>().map_err(|_| truncated(&self.name))
    }

    fn u32(&mut self) -> Result<u32, LoadError> {
        self.cursor.read_u32::<LittleEndian>().map_err(|_| truncated(&self.name))
    }

    fn i64(&mut self) -> Result<i64, LoadError> {
        self.cursor.read_i64::<LittleEndian>().map_err(|_| truncated(&self.name))
    }

    fn f64(&mut self) -> Result<f64, LoadError> {
        self.cursor.read_f64::<LittleEndian>().map_err(|_| truncated(&self.name))
    }

    fn bool(&mut self) -> Result<bool, LoadError> {
        Ok(self.u8()? != 0)
    }

    fn string(&mut self) -> Result<String, LoadError> {
        let len = self.u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| truncated(&self.name))
    }

    fn string_list(&mut self) -> Result<Vec<String>, LoadError> {
        let n = self.u32()? as usize;
        (0..n).map(|_| self.string()).collect()
    }

    fn bool_list(&mut self) -> Result<Vec<bool>, LoadError> {
        let n = self.u32()? as usize;
        (0..n).map(|_| self.bool()).collect()
    }
}

fn write_operand(w: &mut Writer, operand: &Operand) {
    match operand {
        Operand::None => w.u8(0),
        Operand::Int(n) => {
            w.u8(1);
            w.i64(*n as i64);
        }
        Operand::Real(n) => {
            w.u8(2);
            w.f64(*n);
        }
        Operand::Str(s) => {
            w.u8(3);
            w.string(s);
        }
        Operand::Bool(b) => {
            w.u8(4);
            w.bool(*b);
        }
        Operand::StrList(items) => {
            w.u8(5);
            w.string_list(items);
        }
        Operand::PrimitiveList(items) => {
            w.u8(6);
            w.u32(items.len() as u32);
            for p in items {
                write_primitive(w, p);
            }
        }
    }
}

fn read_operand(r: &mut Reader) -> Result<Operand, LoadError> {
    match r.u8()? {
        0 => Ok(Operand::None),
        1 => Ok(Operand::Int(r.i64()? as i32)),
        2 => Ok(Operand::Real(r.f64()?)),
        3 => Ok(Operand::Str(r.string()?)),
        4 => Ok(Operand::Bool(r.bool()?)),
        5 => Ok(Operand::StrList(r.string_list()?)),
        6 => {
            let n = r.u32()? as usize;
            let mut items = Vec::with_capacity(n);
            for _ in 0..n {
                items.push(read_primitive(r)?);
            }
            Ok(Operand::PrimitiveList(items))
        }
        other => Err(LoadError::ParseFailed {
            name: r.name.clone(),
            message: format!("unknown operand tag {other}"),
        }),
    }
}

fn write_primitive(w: &mut Writer, p: &Primitive) {
    match p {
        Primitive::Int(n) => {
            w.u8(1);
            w.i64(*n as i64);
        }
        Primitive::Str(s) => {
            w.u8(3);
            w.string(s);
        }
        Primitive::Bool(b) => {
            w.u8(4);
            w.bool(*b);
        }
    }
}

fn read_primitive(r: &mut Reader) -> Result<Primitive, LoadError> {
    match r.u8()? {
        1 => Ok(Primitive::Int(r.i64()? as i32)),
        3 => Ok(Primitive::Str(r.string()?)),
        4 => Ok(Primitive::Bool(r.bool()?)),
        other => Err(LoadError::ParseFailed {
            name: r.name.clone(),
            message: format!("unknown primitive tag {other}"),
        }),
    }
}

/// Opcode tags are assigned by declaration order in `bytecode::Op`; both
/// directions live here side by side so a new variant can't drift out of
/// sync between writer and reader.
fn write_op(w: &mut Writer, op: &Op) {
    match op {
        Op::Push(operand) => {
            w.u8(0);
            write_operand(w, operand);
        }
        Op::Pop => w.u8(1),
        Op::Dup => w.u8(2),
        Op::LoadVar(n) => {
            w.u8(3);
            w.string(n);
        }
        Op::StoreVar(n) => {
            w.u8(4);
            w.string(n);
        }
        Op::Add => w.u8(5),
        Op::Sub => w.u8(6),
        Op::Mul => w.u8(7),
        Op::Div => w.u8(8),
        Op::IDiv => w.u8(9),
        Op::Mod => w.u8(10),
        Op::Neg => w.u8(11),
        Op::Eq => w.u8(12),
        Op::Ne => w.u8(13),
        Op::Lt => w.u8(14),
        Op::Gt => w.u8(15),
        Op::Le => w.u8(16),
        Op::Ge => w.u8(17),
        Op::And => w.u8(18),
        Op::Or => w.u8(19),
        Op::Not => w.u8(20),
        Op::Jump(l) => {
            w.u8(21);
            w.string(l);
        }
        Op::JumpIfFalse(l) => {
            w.u8(22);
            w.string(l);
        }
        Op::JumpIfTrue(l) => {
            w.u8(23);
            w.string(l);
        }
        Op::CaseJump => w.u8(24),
        Op::CaseRange => w.u8(25),
        Op::Call(n) => {
            w.u8(26);
            w.string(n);
        }
        Op::Return => w.u8(27),
        Op::Write => w.u8(28),
        Op::Writeln => w.u8(29),
        Op::Read(n) => {
            w.u8(30);
            w.string(n);
        }
        Op::New(n) => {
            w.u8(31);
            w.string(n);
        }
        Op::Dispose(n) => {
            w.u8(32);
            w.string(n);
        }
        Op::Deref => w.u8(33),
        Op::StoreDeref => w.u8(34),
        Op::AddrOf(n) => {
            w.u8(35);
            w.string(n);
        }
        Op::PushNil => w.u8(36),
        Op::FileAssign(n) => {
            w.u8(37);
            w.string(n);
        }
        Op::FileReset(n) => {
            w.u8(38);
            w.string(n);
        }
        Op::FileRewrite(n) => {
            w.u8(39);
            w.string(n);
        }
        Op::FileClose(n) => {
            w.u8(40);
            w.string(n);
        }
        Op::FileRead { file, targets } => {
            w.u8(41);
            w.string(file);
            w.string_list(targets);
        }
        Op::FileWrite { file, values } => {
            w.u8(42);
            w.string(file);
            w.u32(*values as u32);
        }
        Op::FileEof(n) => {
            w.u8(43);
            w.string(n);
        }
        Op::SetLiteral(n) => {
            w.u8(44);
            w.u32(*n as u32);
        }
        Op::SetContains => w.u8(45),
        Op::ArrayLoad { name, dim_count } => {
            w.u8(46);
            w.string(name);
            w.u32(*dim_count as u32);
        }
        Op::ArrayStore { name, dim_count } => {
            w.u8(47);
            w.string(name);
            w.u32(*dim_count as u32);
        }
        Op::Abs => w.u8(48),
        Op::Sqr => w.u8(49),
        Op::Sqrt => w.u8(50),
        Op::Sin => w.u8(51),
        Op::Cos => w.u8(52),
        Op::Arctan => w.u8(53),
        Op::Ln => w.u8(54),
        Op::Exp => w.u8(55),
        Op::Trunc => w.u8(56),
        Op::Round => w.u8(57),
        Op::Odd => w.u8(58),
        Op::Length => w.u8(59),
        Op::Copy => w.u8(60),
        Op::Concat(n) => {
            w.u8(61);
            w.u32(*n as u32);
        }
        Op::Pos => w.u8(62),
        Op::Upcase => w.u8(63),
        Op::Lowercase => w.u8(64),
        Op::Chr => w.u8(65),
        Op::Ord => w.u8(66),
        Op::Halt => w.u8(67),
        Op::Nop => w.u8(68),
    }
}

fn read_op(r: &mut Reader) -> Result<Op, LoadError> {
    let tag = r.u8()?;
    Ok(match tag {
        0 => Op::Push(read_operand(r)?),
        1 => Op::Pop,
        2 => Op::Dup,
        3 => Op::LoadVar(r.string()?),
        4 => Op::StoreVar(r.string()?),
        5 => Op::Add,
        6 => Op::Sub,
        7 => Op::Mul,
        8 => Op::Div,
        9 => Op::IDiv,
        10 => Op::Mod,
        11 => Op::Neg,
        12 => Op::Eq,
        13 => Op::Ne,
        14 => Op::Lt,
        15 => Op::Gt,
        16 => Op::Le,
        17 => Op::Ge,
        18 => Op::And,
        19 => Op::Or,
        20 => Op::Not,
        21 => Op::Jump(r.string()?),
        22 => Op::JumpIfFalse(r.string()?),
        23 => Op::JumpIfTrue(r.string()?),
        24 => Op::CaseJump,
        25 => Op::CaseRange,
        26 => Op::Call(r.string()?),
        27 => Op::Return,
        28 => Op::Write,
        29 => Op::Writeln,
        30 => Op::Read(r.string()?),
        31 => Op::New(r.string()?),
        32 => Op::Dispose(r.string()?),
        33 => Op::Deref,
        34 => Op::StoreDeref,
        35 => Op::AddrOf(r.string()?),
        36 => Op::PushNil,
        37 => Op::FileAssign(r.string()?),
        38 => Op::FileReset(r.string()?),
        39 => Op::FileRewrite(r.string()?),
        40 => Op::FileClose(r.string()?),
        41 => {
            let file = r.string()?;
            let targets = r.string_list()?;
            Op::FileRead { file, targets }
        }
        42 => {
            let file = r.string()?;
            let values = r.u32()? as usize;
            Op::FileWrite { file, values }
        }
        43 => Op::FileEof(r.string()?),
        44 => Op::SetLiteral(r.u32()? as usize),
        45 => Op::SetContains,
        46 => {
            let name = r.string()?;
            let dim_count = r.u32()? as usize;
            Op::ArrayLoad { name, dim_count }
        }
        47 => {
            let name = r.string()?;
            let dim_count = r.u32()? as usize;
            Op::ArrayStore { name, dim_count }
        }
        48 => Op::Abs,
        49 => Op::Sqr,
        50 => Op::Sqrt,
        51 => Op::Sin,
        52 => Op::Cos,
        53 => Op::Arctan,
        54 => Op::Ln,
        55 => Op::Exp,
        56 => Op::Trunc,
        57 => Op::Round,
        58 => Op::Odd,
        59 => Op::Length,
        60 => Op::Copy,
        61 => Op::Concat(r.u32()? as usize),
        62 => Op::Pos,
        63 => Op::Upcase,
        64 => Op::Lowercase,
        65 => Op::Chr,
        66 => Op::Ord,
        67 => Op::Halt,
        68 => Op::Nop,
        other => {
            return Err(LoadError::ParseFailed {
                name: r.name.clone(),
                message: format!("unknown opcode tag {other}"),
            })
        }
    })
}

fn write_instructions(w: &mut Writer, instrs: &[Op]) {
    w.u32(instrs.len() as u32);
    for op in instrs {
        write_op(w, op);
    }
}

fn read_instructions(r: &mut Reader) -> Result<Vec<Op>, LoadError> {
    let n = r.u32()? as usize;
    (0..n).map(|_| read_op(r)).collect()
}

fn write_labels(w: &mut Writer, labels: &HashMap<String, usize>) {
    w.u32(labels.len() as u32);
    for (name, addr) in labels {
        w.string(name);
        w.u32(*addr as u32);
    }
}

fn read_labels(r: &mut Reader) -> Result<HashMap<String, usize>, LoadError> {
    let n = r.u32()? as usize;
    let mut map = HashMap::with_capacity(n);
    for _ in 0..n {
        let name = r.string()?;
        let addr = r.u32()? as usize;
        map.insert(name, addr);
    }
    Ok(map)
}

fn write_enums(w: &mut Writer, enums: &HashMap<String, EnumMeta>) {
    w.u32(enums.len() as u32);
    for (name, meta) in enums {
        w.string(name);
        w.string_list(&meta.values);
    }
}

fn read_enums(r: &mut Reader) -> Result<HashMap<String, EnumMeta>, LoadError> {
    let n = r.u32()? as usize;
    let mut map = HashMap::with_capacity(n);
    for _ in 0..n {
        let name = r.string()?;
        let values = r.string_list()?;
        map.insert(name, EnumMeta { values });
    }
    Ok(map)
}

fn write_arrays(w: &mut Writer, arrays: &HashMap<String, ArrayMeta>) {
    w.u32(arrays.len() as u32);
    for (name, meta) in arrays {
        w.string(name);
        w.u32(meta.dimensions.len() as u32);
        for (lo, hi) in &meta.dimensions {
            w.i64(*lo);
            w.i64(*hi);
        }
        w.string(&meta.elem_type);
    }
}

fn read_arrays(r: &mut Reader) -> Result<HashMap<String, ArrayMeta>, LoadError> {
    let n = r.u32()? as usize;
    let mut map = HashMap::with_capacity(n);
    for _ in 0..n {
        let name = r.string()?;
        let dim_count = r.u32()? as usize;
        let mut dimensions = Vec::with_capacity(dim_count);
        for _ in 0..dim_count {
            let lo = r.i64()?;
            let hi = r.i64()?;
            dimensions.push((lo, hi));
        }
        let elem_type = r.string()?;
        map.insert(name, ArrayMeta { dimensions, elem_type });
    }
    Ok(map)
}

fn write_functions(w: &mut Writer, functions: &HashMap<String, FunctionMeta>) {
    w.u32(functions.len() as u32);
    for (key, meta) in functions {
        w.string(key);
        w.string(&meta.display_name);
        w.u32(meta.address);
        w.string_list(&meta.param_names);
        w.bool_list(&meta.param_by_ref);
        w.string(&meta.return_type);
        w.string_list(&meta.local_names);
    }
}

fn read_functions(r: &mut Reader) -> Result<HashMap<String, FunctionMeta>, LoadError> {
    let n = r.u32()? as usize;
    let mut map = HashMap::with_capacity(n);
    for _ in 0..n {
        let key = r.string()?;
        let display_name = r.string()?;
        let address = r.u32()?;
        let param_names = r.string_list()?;
        let param_by_ref = r.bool_list()?;
        let return_type = r.string()?;
        let local_names = r.string_list()?;
        map.insert(
            key,
            FunctionMeta { display_name, address, param_names, param_by_ref, return_type, local_names },
        );
    }
    Ok(map)
}

/// Serializes a compiled program to the `.pbc` binary layout.
pub fn write_program(program: &Program) -> Vec<u8> {
    let mut w = Writer::new();
    w.u32(PROGRAM_MAGIC);
    w.u16(BYTECODE_VERSION);
    w.string(&program.name);
    w.string_list(&program.uses);
    w.string_list(&program.variables);
    write_labels(&mut w, &program.labels);
    write_enums(&mut w, &program.enums);
    write_arrays(&mut w, &program.arrays);
    write_functions(&mut w, &program.functions);
    write_instructions(&mut w, &program.instructions);
    w.buf
}

/// Parses a `.pbc` byte stream back into a `Program`.
pub fn read_program(bytes: &[u8]) -> Result<Program, LoadError> {
    let mut r = Reader::new(bytes, "<program bytecode>");
    let magic = r.u32()?;
    if magic != PROGRAM_MAGIC {
        return Err(LoadError::BadMagic { found: magic, expected: PROGRAM_MAGIC });
    }
    let version = r.u16()?;
    if version != BYTECODE_VERSION {
        return Err(LoadError::UnsupportedVersion { found: version, expected: BYTECODE_VERSION });
    }
    let name = r.string()?;
    let uses = r.string_list()?;
    let variables = r.string_list()?;
    let labels = read_labels(&mut r)?;
    let enums = read_enums(&mut r)?;
    let arrays = read_arrays(&mut r)?;
    let functions = read_functions(&mut r)?;
    let instructions = read_instructions(&mut r)?;
    Ok(Program { name, uses, instructions, labels, variables, enums, arrays, functions })
}

/// Serializes a compiled unit to the `.pbu` binary layout.
pub fn write_unit(unit: &Unit) -> Vec<u8> {
    let mut w = Writer::new();
    w.u32(UNIT_MAGIC);
    w.u16(BYTECODE_VERSION);
    w.string(&unit.name);
    w.string_list(&unit.uses);
    w.string_list(&unit.variables);
    write_labels(&mut w, &unit.labels);
    write_enums(&mut w, &unit.enums);
    write_arrays(&mut w, &unit.arrays);
    write_functions(&mut w, &unit.functions);
    write_instructions(&mut w, &unit.instructions);
    write_instructions(&mut w, &unit.initialization);
    write_instructions(&mut w, &unit.finalization);
    w.buf
}

/// Parses a `.pbu` byte stream back into a `Unit`.
pub fn read_unit(bytes: &[u8]) -> Result<Unit, LoadError> {
    let mut r = Reader::new(bytes, "<unit bytecode>");
    let magic = r.u32()?;
    if magic != UNIT_MAGIC {
        return Err(LoadError::BadMagic { found: magic, expected: UNIT_MAGIC });
    }
    let version = r.u16()?;
    if version != BYTECODE_VERSION {
        return Err(LoadError::UnsupportedVersion { found: version, expected: BYTECODE_VERSION });
    }
    let name = r.string()?;
    let uses = r.string_list()?;
    let variables = r.string_list()?;
    let labels = read_labels(&mut r)?;
    let enums = read_enums(&mut r)?;
    let arrays = read_arrays(&mut r)?;
    let functions = read_functions(&mut r)?;
    let instructions = read_instructions(&mut r)?;
    let initialization = read_instructions(&mut r)?;
    let finalization = read_instructions(&mut r)?;
    Ok(Unit {
        name,
        uses,
        instructions,
        labels,
        variables,
        enums,
        arrays,
        functions,
        initialization,
        finalization,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::Primitive;
    use std::collections::HashMap;

    fn sample_program() -> Program {
        let mut labels = HashMap::new();
        labels.insert("L0".to_string(), 3);
        let mut arrays = HashMap::new();
        arrays.insert(
            "nums".to_string(),
            ArrayMeta { dimensions: vec![(1, 10)], elem_type: "integer".to_string() },
        );
        let mut enums = HashMap::new();
        enums.insert(
            "color".to_string(),
            EnumMeta { values: vec!["red".to_string(), "green".to_string(), "blue".to_string()] },
        );
        let mut functions = HashMap::new();
        functions.insert(
            "swap".to_string(),
            FunctionMeta {
                display_name: "Swap".to_string(),
                address: 7,
                param_names: vec!["a".to_string(), "b".to_string()],
                param_by_ref: vec![true, true],
                return_type: String::new(),
                local_names: vec!["a".to_string(), "b".to_string()],
            },
        );

        Program {
            name: "Demo".to_string(),
            uses: vec!["MathUtils".to_string()],
            instructions: vec![
                Op::Push(Operand::Int(1)),
                Op::Push(Operand::PrimitiveList(vec![
                    Primitive::Int(1),
                    Primitive::Str("x".to_string()),
                    Primitive::Bool(true),
                ])),
                Op::StoreVar("x".to_string()),
                Op::Call("Swap".to_string()),
                Op::ArrayLoad { name: "nums".to_string(), dim_count: 1 },
                Op::FileRead { file: "f".to_string(), targets: vec!["x".to_string(), "y".to_string()] },
                Op::Halt,
            ],
            labels,
            variables: vec!["x".to_string(), "y".to_string()],
            enums,
            arrays,
            functions,
        }
    }

    #[test]
    fn program_round_trips_through_bytes() {
        let p = sample_program();
        let bytes = write_program(&p);
        let back = read_program(&bytes).expect("decodes");
        assert_eq!(p, back);
    }

    #[test]
    fn program_bytes_start_with_magic_and_version() {
        let bytes = write_program(&sample_program());
        assert_eq!(&bytes[0..4], &PROGRAM_MAGIC.to_le_bytes());
        assert_eq!(&bytes[4..6], &BYTECODE_VERSION.to_le_bytes());
    }

    #[test]
    fn unit_round_trips_with_init_and_finalization() {
        let mut u = Unit::new("MathUtils");
        u.instructions.push(Op::Nop);
        u.initialization.push(Op::Push(Operand::Int(1)));
        u.initialization.push(Op::StoreVar("ready".to_string()));
        u.finalization.push(Op::Halt);

        let bytes = write_unit(&u);
        let back = read_unit(&bytes).expect("decodes");
        assert_eq!(u, back);
    }

    #[test]
    fn rejects_wrong_magic() {
        let bytes = write_unit(&Unit::new("X"));
        let err = read_program(&bytes).unwrap_err();
        assert!(matches!(err, LoadError::BadMagic { .. }));
    }

    #[test]
    fn rejects_unsupported_version() {
        let mut bytes = write_program(&sample_program());
        bytes[4] = 0xFF;
        bytes[5] = 0xFF;
        let err = read_program(&bytes).unwrap_err();
        assert!(matches!(err, LoadError::UnsupportedVersion { .. }));
    }

    #[test]
    fn rejects_truncated_input() {
        let bytes = write_program(&sample_program());
        let err = read_program(&bytes[..bytes.len() - 1]).unwrap_err();
        assert!(matches!(err, LoadError::ParseFailed { .. }));
    }
}
