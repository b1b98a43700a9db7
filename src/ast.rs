// ABOUTME: Sum-typed abstract syntax tree for Pascal programs and units

#[derive(Debug, Clone, PartialEq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    IDiv,
    Mod,
    And,
    Or,
    Eq,
    NotEq,
    Lt,
    Gt,
    Le,
    Ge,
}

#[derive(Debug, Clone, PartialEq)]
pub enum UnOp {
    Neg,
    Plus,
    Not,
}

/// The resolved target of an assignment or `read` argument. Pascal has
/// several distinct assignment shapes — a plain variable, an array
/// element, a record field, a record-field array element, an
/// array-of-record field, and a pointer dereference — so this enum
/// collapses them behind one `Assign` statement instead of a statement
/// variant per shape.
#[derive(Debug, Clone, PartialEq)]
pub enum LValue {
    Variable(String),
    ArrayElem { name: String, indices: Vec<Expr> },
    RecordField { record: String, field: String },
    RecordFieldArrayElem {
        record: String,
        field: String,
        indices: Vec<Expr>,
    },
    ArrayElemField {
        array: String,
        index: Box<Expr>,
        field: String,
    },
    PointerDeref(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    IntLiteral(i64),
    RealLiteral(f64),
    StringLiteral(String),
    BoolLiteral(bool),
    Nil,
    Variable(String),
    Binary {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Unary {
        op: UnOp,
        operand: Box<Expr>,
    },
    Call {
        name: String,
        args: Vec<Expr>,
    },
    ArrayAccess {
        name: String,
        indices: Vec<Expr>,
    },
    FieldAccess {
        record: String,
        field: String,
    },
    RecordFieldArrayAccess {
        record: String,
        field: String,
        indices: Vec<Expr>,
    },
    ArrayOfRecordFieldAccess {
        array: String,
        index: Box<Expr>,
        field: String,
    },
    Deref(Box<Expr>),
    AddrOf(String),
    SetLiteral(Vec<Expr>),
    SetIn {
        value: Box<Expr>,
        set: Box<Expr>,
    },
    FileEof(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct CaseLabel {
    pub values: Vec<CaseLabelValue>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CaseLabelValue {
    Single(Expr),
    Range(Expr, Expr),
}

#[derive(Debug, Clone, PartialEq)]
pub struct CaseBranch {
    pub label: CaseLabel,
    pub body: Box<Stmt>,
}

/// Parenthesized or bare `write`/`writeln`/`read`/`readln` call, and the
/// file-oriented procedures that share their call-without-parens grammar.
#[derive(Debug, Clone, PartialEq)]
pub enum FileOp {
    Assign { file: String, filename: Expr },
    Reset(String),
    Rewrite(String),
    Close(String),
    Read { file: String, targets: Vec<LValue> },
    Write { file: String, values: Vec<Expr> },
    Eof(String),
    Page(String),
    Get(String),
    Put(String),
    Pack(String),
    Unpack(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    Assign {
        target: LValue,
        value: Expr,
    },
    Compound(Vec<Stmt>),
    If {
        cond: Expr,
        then_branch: Box<Stmt>,
        else_branch: Option<Box<Stmt>>,
    },
    While {
        cond: Expr,
        body: Box<Stmt>,
    },
    Repeat {
        body: Vec<Stmt>,
        cond: Expr,
    },
    For {
        var: String,
        start: Expr,
        end: Expr,
        downto: bool,
        body: Box<Stmt>,
    },
    Case {
        selector: Expr,
        branches: Vec<CaseBranch>,
        else_branch: Option<Box<Stmt>>,
    },
    With {
        record: String,
        body: Box<Stmt>,
    },
    Goto(String),
    Labeled {
        label: String,
        stmt: Box<Stmt>,
    },
    ProcCall {
        name: String,
        args: Vec<Expr>,
    },
    Write {
        args: Vec<Expr>,
        newline: bool,
    },
    Read {
        targets: Vec<LValue>,
        newline: bool,
    },
    File(FileOp),
    New(String),
    Dispose(String),
    Empty,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParamGroup {
    pub names: Vec<String>,
    pub type_name: String,
    pub by_ref: bool,
}

impl ParamGroup {
    /// Expanded (name, by_ref, type) triples — the parameter count callers
    /// care about is this flattened count, not the number of parsed groups.
    pub fn flatten(groups: &[ParamGroup]) -> Vec<(String, bool, String)> {
        groups
            .iter()
            .flat_map(|g| {
                g.names
                    .iter()
                    .map(move |n| (n.clone(), g.by_ref, g.type_name.clone()))
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordField {
    pub name: String,
    pub type_name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Declaration {
    Const {
        name: String,
        value: Expr,
    },
    /// Covers every bare-name-typed variable: built-in scalar, a named enum
    /// type, or a named record type. The parser cannot tell which of the
    /// latter two a type name denotes (that requires the type table), so
    /// `Var` is the single parser-level shape; the analyzer classifies it
    /// into the scalar or record-variable table during registration.
    Var {
        names: Vec<String>,
        type_name: String,
    },
    ArrayVar {
        names: Vec<String>,
        dimensions: Vec<(i64, i64)>,
        elem_type: String,
    },
    FileVar {
        names: Vec<String>,
        text: bool,
        elem_type: Option<String>,
    },
    PointerVar {
        names: Vec<String>,
        points_to: String,
    },
    SetVar {
        names: Vec<String>,
        elem_type: String,
    },
    RecordType {
        name: String,
        fields: Vec<RecordField>,
    },
    EnumType {
        name: String,
        values: Vec<String>,
    },
    Procedure {
        name: String,
        params: Vec<ParamGroup>,
        locals: Vec<Declaration>,
        nested: Vec<Declaration>,
        body: Stmt,
    },
    Function {
        name: String,
        params: Vec<ParamGroup>,
        return_type: String,
        locals: Vec<Declaration>,
        nested: Vec<Declaration>,
        body: Stmt,
    },
}

impl Declaration {
    pub fn name(&self) -> &str {
        match self {
            Declaration::Const { name, .. } => name,
            Declaration::RecordType { name, .. } => name,
            Declaration::EnumType { name, .. } => name,
            Declaration::Procedure { name, .. } => name,
            Declaration::Function { name, .. } => name,
            Declaration::Var { names, .. }
            | Declaration::ArrayVar { names, .. }
            | Declaration::FileVar { names, .. }
            | Declaration::PointerVar { names, .. }
            | Declaration::SetVar { names, .. } => names.first().map(String::as_str).unwrap_or(""),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    pub name: String,
    pub uses: Vec<String>,
    pub decls: Vec<Declaration>,
    pub body: Stmt,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Unit {
    pub name: String,
    pub uses: Vec<String>,
    pub interface_decls: Vec<Declaration>,
    pub impl_decls: Vec<Declaration>,
    pub initialization: Option<Stmt>,
    pub finalization: Option<Stmt>,
}

/// Root of a parse: either a standalone program or a separately compiled unit.
#[derive(Debug, Clone, PartialEq)]
pub enum CompilationUnit {
    Program(Program),
    Unit(Unit),
}
