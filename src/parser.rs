// ABOUTME: Recursive-descent parser turning a token sequence into a Program or Unit AST

use crate::ast::*;
use crate::error::ParseError;
use crate::token::{Token, TokenKind};

pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

type PResult<T> = Result<T, ParseError>;

impl Parser {
    pub fn new(tokens: Vec<Token>) -> Self {
        Parser { tokens, pos: 0 }
    }

    fn peek(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn peek_kind(&self) -> &TokenKind {
        &self.peek().kind
    }

    fn peek_at(&self, offset: usize) -> &Token {
        let idx = (self.pos + offset).min(self.tokens.len() - 1);
        &self.tokens[idx]
    }

    fn advance(&mut self) -> Token {
        let tok = self.peek().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        tok
    }

    fn check(&self, kind: &TokenKind) -> bool {
        std::mem::discriminant(self.peek_kind()) == std::mem::discriminant(kind)
    }

    fn expect(&mut self, kind: TokenKind, what: &str) -> PResult<Token> {
        if self.check(&kind) {
            Ok(self.advance())
        } else {
            Err(ParseError::unexpected(self.peek(), what))
        }
    }

    fn expect_identifier(&mut self) -> PResult<String> {
        match self.peek_kind().clone() {
            TokenKind::Identifier(name) => {
                self.advance();
                Ok(name)
            }
            _ => Err(ParseError::unexpected(self.peek(), "identifier")),
        }
    }

    // ------------------------------------------------------------------
    // Top level
    // ------------------------------------------------------------------

    pub fn parse_compilation_unit(&mut self) -> PResult<CompilationUnit> {
        match self.peek_kind() {
            TokenKind::Program => Ok(CompilationUnit::Program(self.parse_program()?)),
            TokenKind::Unit => Ok(CompilationUnit::Unit(self.parse_unit()?)),
            _ => Err(ParseError::unexpected(self.peek(), "'program' or 'unit'")),
        }
    }

    fn parse_program(&mut self) -> PResult<Program> {
        self.expect(TokenKind::Program, "'program'")?;
        let name = self.expect_identifier()?;
        if self.check(&TokenKind::LParen) {
            // Optional parameter list, e.g. (input, output) — accepted and discarded.
            self.advance();
            while !self.check(&TokenKind::RParen) {
                self.advance();
            }
            self.expect(TokenKind::RParen, "')'")?;
        }
        self.expect(TokenKind::Semicolon, "';'")?;

        let uses = self.parse_opt_uses()?;
        let decls = self.parse_decl_sections(false)?;
        let body = self.parse_compound_stmt()?;
        self.expect(TokenKind::Dot, "'.'")?;

        Ok(Program {
            name,
            uses,
            decls,
            body,
        })
    }

    fn parse_unit(&mut self) -> PResult<Unit> {
        self.expect(TokenKind::Unit, "'unit'")?;
        let name = self.expect_identifier()?;
        self.expect(TokenKind::Semicolon, "';'")?;

        self.expect(TokenKind::Interface, "'interface'")?;
        let mut uses = self.parse_opt_uses()?;
        let interface_decls = self.parse_decl_sections(true)?;

        self.expect(TokenKind::Implementation, "'implementation'")?;
        uses.extend(self.parse_opt_uses()?);
        let impl_decls = self.parse_decl_sections(false)?;

        let initialization = if self.check(&TokenKind::Initialization) {
            self.advance();
            Some(Stmt::Compound(self.parse_stmt_list_until(|k| {
                matches!(k, TokenKind::Finalization | TokenKind::End)
            })?))
        } else {
            None
        };

        let finalization = if self.check(&TokenKind::Finalization) {
            self.advance();
            Some(Stmt::Compound(
                self.parse_stmt_list_until(|k| matches!(k, TokenKind::End))?,
            ))
        } else {
            None
        };

        self.expect(TokenKind::End, "'end'")?;
        self.expect(TokenKind::Dot, "'.'")?;

        Ok(Unit {
            name,
            uses,
            interface_decls,
            impl_decls,
            initialization,
            finalization,
        })
    }

    fn parse_opt_uses(&mut self) -> PResult<Vec<String>> {
        if !self.check(&TokenKind::Uses) {
            return Ok(Vec::new());
        }
        self.advance();
        let mut names = vec![self.expect_identifier()?];
        while self.check(&TokenKind::Comma) {
            self.advance();
            names.push(self.expect_identifier()?);
        }
        self.expect(TokenKind::Semicolon, "';'")?;
        Ok(names)
    }

    // ------------------------------------------------------------------
    // Declaration sections
    // ------------------------------------------------------------------

    fn parse_decl_sections(&mut self, in_interface: bool) -> PResult<Vec<Declaration>> {
        let mut decls = Vec::new();
        loop {
            match self.peek_kind() {
                TokenKind::Label => self.parse_label_section()?,
                TokenKind::Const => decls.extend(self.parse_const_section()?),
                TokenKind::Type => decls.extend(self.parse_type_section()?),
                TokenKind::Var => decls.extend(self.parse_var_section()?),
                TokenKind::Procedure => decls.push(self.parse_procedure_decl(in_interface)?),
                TokenKind::Function => decls.push(self.parse_function_decl(in_interface)?),
                _ => break,
            }
        }
        Ok(decls)
    }

    fn parse_label_section(&mut self) -> PResult<()> {
        self.expect(TokenKind::Label, "'label'")?;
        loop {
            match self.peek_kind().clone() {
                TokenKind::IntLiteral(_) | TokenKind::Identifier(_) => {
                    self.advance();
                }
                _ => break,
            }
            if self.check(&TokenKind::Comma) {
                self.advance();
            } else {
                break;
            }
        }
        self.expect(TokenKind::Semicolon, "';'")?;
        Ok(())
    }

    fn parse_const_section(&mut self) -> PResult<Vec<Declaration>> {
        self.expect(TokenKind::Const, "'const'")?;
        let mut decls = Vec::new();
        while matches!(self.peek_kind(), TokenKind::Identifier(_)) {
            let name = self.expect_identifier()?;
            self.expect(TokenKind::Eq, "'='")?;
            let value = self.parse_expr()?;
            self.expect(TokenKind::Semicolon, "';'")?;
            decls.push(Declaration::Const { name, value });
        }
        Ok(decls)
    }

    fn parse_type_section(&mut self) -> PResult<Vec<Declaration>> {
        self.expect(TokenKind::Type, "'type'")?;
        let mut decls = Vec::new();
        while matches!(self.peek_kind(), TokenKind::Identifier(_)) {
            let name = self.expect_identifier()?;
            self.expect(TokenKind::Eq, "'='")?;
            if self.check(&TokenKind::LParen) {
                self.advance();
                let mut values = vec![self.expect_identifier()?];
                while self.check(&TokenKind::Comma) {
                    self.advance();
                    values.push(self.expect_identifier()?);
                }
                self.expect(TokenKind::RParen, "')'")?;
                self.expect(TokenKind::Semicolon, "';'")?;
                decls.push(Declaration::EnumType { name, values });
            } else if self.check(&TokenKind::Record) {
                self.advance();
                let fields = self.parse_record_fields()?;
                self.expect(TokenKind::End, "'end'")?;
                self.expect(TokenKind::Semicolon, "';'")?;
                decls.push(Declaration::RecordType { name, fields });
            } else {
                // Other type aliases are accepted and skipped to the next ';'.
                while !self.check(&TokenKind::Semicolon) {
                    self.advance();
                }
                self.expect(TokenKind::Semicolon, "';'")?;
            }
        }
        Ok(decls)
    }

    fn parse_record_fields(&mut self) -> PResult<Vec<RecordField>> {
        let mut fields = Vec::new();
        while matches!(self.peek_kind(), TokenKind::Identifier(_)) {
            let mut names = vec![self.expect_identifier()?];
            while self.check(&TokenKind::Comma) {
                self.advance();
                names.push(self.expect_identifier()?);
            }
            self.expect(TokenKind::Colon, "':'")?;
            let type_name = self.read_type_name()?;
            self.expect(TokenKind::Semicolon, "';'")?;
            for name in names {
                fields.push(RecordField {
                    name,
                    type_name: type_name.clone(),
                });
            }
        }
        Ok(fields)
    }

    fn parse_var_section(&mut self) -> PResult<Vec<Declaration>> {
        self.expect(TokenKind::Var, "'var'")?;
        let mut decls = Vec::new();
        while matches!(self.peek_kind(), TokenKind::Identifier(_)) {
            let mut names = vec![self.expect_identifier()?];
            while self.check(&TokenKind::Comma) {
                self.advance();
                names.push(self.expect_identifier()?);
            }
            self.expect(TokenKind::Colon, "':'")?;
            decls.push(self.parse_var_type(names)?);
            self.expect(TokenKind::Semicolon, "';'")?;
        }
        Ok(decls)
    }

    fn parse_var_type(&mut self, names: Vec<String>) -> PResult<Declaration> {
        if self.check(&TokenKind::Packed) {
            self.advance();
        }
        match self.peek_kind().clone() {
            TokenKind::Caret => {
                self.advance();
                let points_to = self.read_type_name()?;
                Ok(Declaration::PointerVar { names, points_to })
            }
            TokenKind::Text => {
                self.advance();
                Ok(Declaration::FileVar {
                    names,
                    text: true,
                    elem_type: None,
                })
            }
            TokenKind::File => {
                self.advance();
                self.expect(TokenKind::Of, "'of'")?;
                let elem_type = self.read_type_name()?;
                Ok(Declaration::FileVar {
                    names,
                    text: false,
                    elem_type: Some(elem_type),
                })
            }
            TokenKind::Array => {
                self.advance();
                self.expect(TokenKind::LBracket, "'['")?;
                let dimensions = self.parse_dimensions()?;
                self.expect(TokenKind::RBracket, "']'")?;
                self.expect(TokenKind::Of, "'of'")?;
                let elem_type = self.read_type_name()?;
                Ok(Declaration::ArrayVar {
                    names,
                    dimensions,
                    elem_type,
                })
            }
            TokenKind::Set => {
                self.advance();
                self.expect(TokenKind::Of, "'of'")?;
                let elem_type = self.read_type_name()?;
                Ok(Declaration::SetVar { names, elem_type })
            }
            _ => {
                let type_name = self.read_type_name()?;
                Ok(Declaration::Var { names, type_name })
            }
        }
    }

    fn parse_dimensions(&mut self) -> PResult<Vec<(i64, i64)>> {
        let mut dims = Vec::new();
        loop {
            let low = self.parse_bound()?;
            self.expect(TokenKind::DotDot, "'..'")?;
            let high = self.parse_bound()?;
            dims.push((low, high));
            if self.check(&TokenKind::Comma) {
                self.advance();
            } else {
                break;
            }
        }
        Ok(dims)
    }

    fn parse_bound(&mut self) -> PResult<i64> {
        let negative = if self.check(&TokenKind::Minus) {
            self.advance();
            true
        } else {
            false
        };
        let value = match self.peek_kind().clone() {
            TokenKind::IntLiteral(n) => {
                self.advance();
                n
            }
            TokenKind::StringLiteral(s) if s.chars().count() == 1 => {
                self.advance();
                s.chars().next().unwrap() as i64
            }
            _ => return Err(ParseError::unexpected(self.peek(), "array bound")),
        };
        Ok(if negative { -value } else { value })
    }

    /// Reads a type reference: a built-in scalar keyword or a named type
    /// (optionally behind a single `^`).
    fn read_type_name(&mut self) -> PResult<String> {
        match self.peek_kind().clone() {
            TokenKind::Integer => {
                self.advance();
                Ok("integer".to_string())
            }
            TokenKind::Real => {
                self.advance();
                Ok("real".to_string())
            }
            TokenKind::StringKw => {
                self.advance();
                Ok("string".to_string())
            }
            TokenKind::Boolean => {
                self.advance();
                Ok("boolean".to_string())
            }
            TokenKind::Caret => {
                self.advance();
                let inner = self.expect_identifier()?;
                Ok(format!("^{inner}"))
            }
            TokenKind::Identifier(name) => {
                self.advance();
                Ok(name)
            }
            _ => Err(ParseError::unexpected(self.peek(), "type name")),
        }
    }

    fn parse_opt_param_list(&mut self) -> PResult<Vec<ParamGroup>> {
        if !self.check(&TokenKind::LParen) {
            return Ok(Vec::new());
        }
        self.advance();
        let mut groups = Vec::new();
        loop {
            let by_ref = if self.check(&TokenKind::Var) {
                self.advance();
                true
            } else {
                false
            };
            let mut names = vec![self.expect_identifier()?];
            while self.check(&TokenKind::Comma) {
                self.advance();
                names.push(self.expect_identifier()?);
            }
            self.expect(TokenKind::Colon, "':'")?;
            let type_name = self.read_type_name()?;
            groups.push(ParamGroup {
                names,
                type_name,
                by_ref,
            });
            if self.check(&TokenKind::Semicolon) {
                self.advance();
            } else {
                break;
            }
        }
        self.expect(TokenKind::RParen, "')'")?;
        Ok(groups)
    }

    fn parse_procedure_decl(&mut self, in_interface: bool) -> PResult<Declaration> {
        self.expect(TokenKind::Procedure, "'procedure'")?;
        let name = self.expect_identifier()?;
        let params = self.parse_opt_param_list()?;
        self.expect(TokenKind::Semicolon, "';'")?;

        if in_interface {
            return Ok(Declaration::Procedure {
                name,
                params,
                locals: Vec::new(),
                nested: Vec::new(),
                body: Stmt::Empty,
            });
        }

        let inner = self.parse_decl_sections(false)?;
        let (locals, nested) = split_locals_nested(inner);
        let body = self.parse_compound_stmt()?;
        self.expect(TokenKind::Semicolon, "';'")?;
        Ok(Declaration::Procedure {
            name,
            params,
            locals,
            nested,
            body,
        })
    }

    fn parse_function_decl(&mut self, in_interface: bool) -> PResult<Declaration> {
        self.expect(TokenKind::Function, "'function'")?;
        let name = self.expect_identifier()?;
        let params = self.parse_opt_param_list()?;
        self.expect(TokenKind::Colon, "':'")?;
        let return_type = self.read_type_name()?;
        self.expect(TokenKind::Semicolon, "';'")?;

        if in_interface {
            return Ok(Declaration::Function {
                name,
                params,
                return_type,
                locals: Vec::new(),
                nested: Vec::new(),
                body: Stmt::Empty,
            });
        }

        let inner = self.parse_decl_sections(false)?;
        let (locals, nested) = split_locals_nested(inner);
        let body = self.parse_compound_stmt()?;
        self.expect(TokenKind::Semicolon, "';'")?;
        Ok(Declaration::Function {
            name,
            params,
            return_type,
            locals,
            nested,
            body,
        })
    }

    // ------------------------------------------------------------------
    // Statements
    // ------------------------------------------------------------------

    fn parse_compound_stmt(&mut self) -> PResult<Stmt> {
        self.expect(TokenKind::Begin, "'begin'")?;
        let stmts = self.parse_stmt_list_until(|k| matches!(k, TokenKind::End))?;
        self.expect(TokenKind::End, "'end'")?;
        Ok(Stmt::Compound(stmts))
    }

    fn parse_stmt_list_until(
        &mut self,
        is_stop: impl Fn(&TokenKind) -> bool,
    ) -> PResult<Vec<Stmt>> {
        let mut stmts = Vec::new();
        loop {
            if is_stop(self.peek_kind()) {
                break;
            }
            stmts.push(self.parse_statement()?);
            if self.check(&TokenKind::Semicolon) {
                self.advance();
            } else {
                break;
            }
        }
        Ok(stmts)
    }

    fn is_statement_terminator(&self) -> bool {
        matches!(
            self.peek_kind(),
            TokenKind::Semicolon
                | TokenKind::End
                | TokenKind::Until
                | TokenKind::Else
                | TokenKind::Eof_
        )
    }

    fn parse_statement(&mut self) -> PResult<Stmt> {
        // Labeled statement: INTEGER|IDENTIFIER ':' stmt
        if matches!(
            self.peek_kind(),
            TokenKind::IntLiteral(_) | TokenKind::Identifier(_)
        ) && matches!(self.peek_at(1).kind, TokenKind::Colon)
        {
            let label = match self.peek_kind().clone() {
                TokenKind::IntLiteral(n) => n.to_string(),
                TokenKind::Identifier(name) => name,
                _ => unreachable!(),
            };
            self.advance();
            self.advance(); // ':'
            let stmt = self.parse_statement()?;
            return Ok(Stmt::Labeled {
                label,
                stmt: Box::new(stmt),
            });
        }

        match self.peek_kind().clone() {
            TokenKind::Begin => self.parse_compound_stmt(),
            TokenKind::If => self.parse_if_stmt(),
            TokenKind::While => self.parse_while_stmt(),
            TokenKind::Repeat => self.parse_repeat_stmt(),
            TokenKind::For => self.parse_for_stmt(),
            TokenKind::Case => self.parse_case_stmt(),
            TokenKind::With => self.parse_with_stmt(),
            TokenKind::Goto => {
                self.advance();
                let label = match self.peek_kind().clone() {
                    TokenKind::IntLiteral(n) => {
                        self.advance();
                        n.to_string()
                    }
                    TokenKind::Identifier(name) => {
                        self.advance();
                        name
                    }
                    _ => return Err(ParseError::unexpected(self.peek(), "label")),
                };
                Ok(Stmt::Goto(label))
            }
            TokenKind::New => {
                self.advance();
                self.expect(TokenKind::LParen, "'('")?;
                let name = self.expect_identifier()?;
                self.expect(TokenKind::RParen, "')'")?;
                Ok(Stmt::New(name))
            }
            TokenKind::Dispose => {
                self.advance();
                self.expect(TokenKind::LParen, "'('")?;
                let name = self.expect_identifier()?;
                self.expect(TokenKind::RParen, "')'")?;
                Ok(Stmt::Dispose(name))
            }
            TokenKind::Assign => {
                self.advance();
                self.expect(TokenKind::LParen, "'('")?;
                let file = self.expect_identifier()?;
                self.expect(TokenKind::Comma, "','")?;
                let filename = self.parse_expr()?;
                self.expect(TokenKind::RParen, "')'")?;
                Ok(Stmt::File(FileOp::Assign { file, filename }))
            }
            TokenKind::Reset => Ok(Stmt::File(FileOp::Reset(self.parse_single_file_arg()?))),
            TokenKind::Rewrite => Ok(Stmt::File(FileOp::Rewrite(self.parse_single_file_arg()?))),
            TokenKind::Close => Ok(Stmt::File(FileOp::Close(self.parse_single_file_arg()?))),
            TokenKind::Eof => Ok(Stmt::File(FileOp::Eof(self.parse_single_file_arg()?))),
            TokenKind::Page => Ok(Stmt::File(FileOp::Page(self.parse_single_file_arg()?))),
            TokenKind::Get => Ok(Stmt::File(FileOp::Get(self.parse_single_file_arg()?))),
            TokenKind::Put => Ok(Stmt::File(FileOp::Put(self.parse_single_file_arg()?))),
            TokenKind::Pack => Ok(Stmt::File(FileOp::Pack(self.parse_single_file_arg()?))),
            TokenKind::Unpack => Ok(Stmt::File(FileOp::Unpack(self.parse_single_file_arg()?))),
            TokenKind::Identifier(name) if is_ci(&name, "write") => self.parse_write_stmt(false),
            TokenKind::Identifier(name) if is_ci(&name, "writeln") => self.parse_write_stmt(true),
            TokenKind::Identifier(name) if is_ci(&name, "read") => self.parse_read_stmt(false),
            TokenKind::Identifier(name) if is_ci(&name, "readln") => self.parse_read_stmt(true),
            TokenKind::Identifier(_) => self.parse_identifier_statement(),
            _ if self.is_statement_terminator() => Ok(Stmt::Empty),
            _ => Err(ParseError::unexpected(self.peek(), "statement")),
        }
    }

    fn parse_single_file_arg(&mut self) -> PResult<String> {
        self.advance(); // the leading keyword
        self.expect(TokenKind::LParen, "'('")?;
        let name = self.expect_identifier()?;
        self.expect(TokenKind::RParen, "')'")?;
        Ok(name)
    }

    fn parse_if_stmt(&mut self) -> PResult<Stmt> {
        self.expect(TokenKind::If, "'if'")?;
        let cond = self.parse_expr()?;
        self.expect(TokenKind::Then, "'then'")?;
        let then_branch = Box::new(self.parse_statement()?);
        let else_branch = if self.check(&TokenKind::Else) {
            self.advance();
            Some(Box::new(self.parse_statement()?))
        } else {
            None
        };
        Ok(Stmt::If {
            cond,
            then_branch,
            else_branch,
        })
    }

    fn parse_while_stmt(&mut self) -> PResult<Stmt> {
        self.expect(TokenKind::While, "'while'")?;
        let cond = self.parse_expr()?;
        self.expect(TokenKind::Do, "'do'")?;
        let body = Box::new(self.parse_statement()?);
        Ok(Stmt::While { cond, body })
    }

    fn parse_repeat_stmt(&mut self) -> PResult<Stmt> {
        self.expect(TokenKind::Repeat, "'repeat'")?;
        let body = self.parse_stmt_list_until(|k| matches!(k, TokenKind::Until))?;
        self.expect(TokenKind::Until, "'until'")?;
        let cond = self.parse_expr()?;
        Ok(Stmt::Repeat { body, cond })
    }

    fn parse_for_stmt(&mut self) -> PResult<Stmt> {
        self.expect(TokenKind::For, "'for'")?;
        let var = self.expect_identifier()?;
        self.expect(TokenKind::Assign_, "':='")?;
        let start = self.parse_expr()?;
        let downto = if self.check(&TokenKind::Downto) {
            self.advance();
            true
        } else {
            self.expect(TokenKind::To, "'to' or 'downto'")?;
            false
        };
        let end = self.parse_expr()?;
        self.expect(TokenKind::Do, "'do'")?;
        let body = Box::new(self.parse_statement()?);
        Ok(Stmt::For {
            var,
            start,
            end,
            downto,
            body,
        })
    }

    fn parse_case_stmt(&mut self) -> PResult<Stmt> {
        self.expect(TokenKind::Case, "'case'")?;
        let selector = self.parse_expr()?;
        self.expect(TokenKind::Of, "'of'")?;

        let mut branches = Vec::new();
        let mut else_branch = None;
        loop {
            if self.check(&TokenKind::Else) {
                self.advance();
                let stmts = self.parse_stmt_list_until(|k| matches!(k, TokenKind::End))?;
                else_branch = Some(Box::new(Stmt::Compound(stmts)));
                break;
            }
            if self.check(&TokenKind::End) {
                break;
            }
            let mut values = vec![self.parse_case_label_value()?];
            while self.check(&TokenKind::Comma) {
                self.advance();
                values.push(self.parse_case_label_value()?);
            }
            self.expect(TokenKind::Colon, "':'")?;
            let body = Box::new(self.parse_statement()?);
            branches.push(CaseBranch {
                label: CaseLabel { values },
                body,
            });
            if self.check(&TokenKind::Semicolon) {
                self.advance();
            } else {
                break;
            }
        }
        self.expect(TokenKind::End, "'end'")?;
        Ok(Stmt::Case {
            selector,
            branches,
            else_branch,
        })
    }

    fn parse_case_label_value(&mut self) -> PResult<CaseLabelValue> {
        let low = self.parse_expr()?;
        if self.check(&TokenKind::DotDot) {
            self.advance();
            let high = self.parse_expr()?;
            Ok(CaseLabelValue::Range(low, high))
        } else {
            Ok(CaseLabelValue::Single(low))
        }
    }

    fn parse_with_stmt(&mut self) -> PResult<Stmt> {
        self.expect(TokenKind::With, "'with'")?;
        let record = self.expect_identifier()?;
        self.expect(TokenKind::Do, "'do'")?;
        let body = Box::new(self.parse_statement()?);
        Ok(Stmt::With { record, body })
    }

    fn parse_write_stmt(&mut self, newline: bool) -> PResult<Stmt> {
        self.advance(); // 'write' / 'writeln'
        if !self.check(&TokenKind::LParen) {
            return Ok(Stmt::Write {
                args: Vec::new(),
                newline,
            });
        }
        self.advance();
        let mut args = vec![self.parse_expr()?];
        while self.check(&TokenKind::Comma) {
            self.advance();
            args.push(self.parse_expr()?);
        }
        self.expect(TokenKind::RParen, "')'")?;
        Ok(Stmt::Write { args, newline })
    }

    fn parse_read_stmt(&mut self, newline: bool) -> PResult<Stmt> {
        self.advance(); // 'read' / 'readln'
        if !self.check(&TokenKind::LParen) {
            return Ok(Stmt::Read {
                targets: Vec::new(),
                newline,
            });
        }
        self.advance();
        let mut names = vec![self.expect_identifier()?];
        while self.check(&TokenKind::Comma) {
            self.advance();
            names.push(self.expect_identifier()?);
        }
        self.expect(TokenKind::RParen, "')'")?;

        if names.len() > 1 {
            // First bare identifier followed by a comma is tentatively a file variable.
            let file = names.remove(0);
            let targets = names.into_iter().map(LValue::Variable).collect();
            Ok(Stmt::File(FileOp::Read { file, targets }))
        } else {
            let targets = names.into_iter().map(LValue::Variable).collect();
            Ok(Stmt::Read { targets, newline })
        }
    }

    /// Disambiguates assignment / call / array-or-record-target assignment
    /// for a statement that begins with a plain identifier.
    fn parse_identifier_statement(&mut self) -> PResult<Stmt> {
        let name = self.expect_identifier()?;
        match self.peek_kind() {
            TokenKind::Assign_ => {
                self.advance();
                let value = self.parse_expr()?;
                Ok(Stmt::Assign {
                    target: LValue::Variable(name),
                    value,
                })
            }
            TokenKind::LParen => {
                self.advance();
                let mut args = Vec::new();
                if !self.check(&TokenKind::RParen) {
                    args.push(self.parse_expr()?);
                    while self.check(&TokenKind::Comma) {
                        self.advance();
                        args.push(self.parse_expr()?);
                    }
                }
                self.expect(TokenKind::RParen, "')'")?;
                Ok(Stmt::ProcCall { name, args })
            }
            TokenKind::LBracket => {
                self.advance();
                let indices = self.parse_index_list()?;
                self.expect(TokenKind::RBracket, "']'")?;
                if self.check(&TokenKind::Dot) {
                    self.advance();
                    let field = self.expect_identifier()?;
                    self.expect(TokenKind::Assign_, "':='")?;
                    let value = self.parse_expr()?;
                    Ok(Stmt::Assign {
                        target: LValue::ArrayElemField {
                            array: name,
                            index: Box::new(indices.into_iter().next().unwrap()),
                            field,
                        },
                        value,
                    })
                } else {
                    self.expect(TokenKind::Assign_, "':='")?;
                    let value = self.parse_expr()?;
                    Ok(Stmt::Assign {
                        target: LValue::ArrayElem { name, indices },
                        value,
                    })
                }
            }
            TokenKind::Caret => {
                self.advance();
                self.expect(TokenKind::Assign_, "':='")?;
                let value = self.parse_expr()?;
                Ok(Stmt::Assign {
                    target: LValue::PointerDeref(name),
                    value,
                })
            }
            TokenKind::Dot => {
                self.advance();
                let field = self.expect_identifier()?;
                if self.check(&TokenKind::LBracket) {
                    self.advance();
                    let indices = self.parse_index_list()?;
                    self.expect(TokenKind::RBracket, "']'")?;
                    self.expect(TokenKind::Assign_, "':='")?;
                    let value = self.parse_expr()?;
                    Ok(Stmt::Assign {
                        target: LValue::RecordFieldArrayElem {
                            record: name,
                            field,
                            indices,
                        },
                        value,
                    })
                } else {
                    self.expect(TokenKind::Assign_, "':='")?;
                    let value = self.parse_expr()?;
                    Ok(Stmt::Assign {
                        target: LValue::RecordField {
                            record: name,
                            field,
                        },
                        value,
                    })
                }
            }
            _ => {
                // Parameterless procedure call.
                Ok(Stmt::ProcCall {
                    name,
                    args: Vec::new(),
                })
            }
        }
    }

    fn parse_index_list(&mut self) -> PResult<Vec<Expr>> {
        let mut indices = vec![self.parse_expr()?];
        while self.check(&TokenKind::Comma) {
            self.advance();
            indices.push(self.parse_expr()?);
        }
        Ok(indices)
    }

    // ------------------------------------------------------------------
    // Expressions (lowest to highest precedence)
    // ------------------------------------------------------------------

    pub fn parse_expr(&mut self) -> PResult<Expr> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> PResult<Expr> {
        let mut lhs = self.parse_and()?;
        while self.check(&TokenKind::Or) {
            self.advance();
            let rhs = self.parse_and()?;
            lhs = Expr::Binary {
                op: BinOp::Or,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> PResult<Expr> {
        let mut lhs = self.parse_comparison()?;
        while self.check(&TokenKind::And) {
            self.advance();
            let rhs = self.parse_comparison()?;
            lhs = Expr::Binary {
                op: BinOp::And,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn parse_comparison(&mut self) -> PResult<Expr> {
        let mut lhs = self.parse_additive()?;
        loop {
            let op = match self.peek_kind() {
                TokenKind::Eq => BinOp::Eq,
                TokenKind::NotEq => BinOp::NotEq,
                TokenKind::Lt => BinOp::Lt,
                TokenKind::Gt => BinOp::Gt,
                TokenKind::Le => BinOp::Le,
                TokenKind::Ge => BinOp::Ge,
                TokenKind::In => {
                    self.advance();
                    let set = self.parse_additive()?;
                    lhs = Expr::SetIn {
                        value: Box::new(lhs),
                        set: Box::new(set),
                    };
                    continue;
                }
                _ => break,
            };
            self.advance();
            let rhs = self.parse_additive()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn parse_additive(&mut self) -> PResult<Expr> {
        let mut lhs = self.parse_multiplicative()?;
        loop {
            let op = match self.peek_kind() {
                TokenKind::Plus => BinOp::Add,
                TokenKind::Minus => BinOp::Sub,
                _ => break,
            };
            self.advance();
            let rhs = self.parse_multiplicative()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn parse_multiplicative(&mut self) -> PResult<Expr> {
        let mut lhs = self.parse_unary()?;
        loop {
            let op = match self.peek_kind() {
                TokenKind::Star => BinOp::Mul,
                TokenKind::Slash => BinOp::Div,
                TokenKind::Div => BinOp::IDiv,
                TokenKind::Mod => BinOp::Mod,
                _ => break,
            };
            self.advance();
            let rhs = self.parse_unary()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> PResult<Expr> {
        match self.peek_kind() {
            TokenKind::Plus => {
                self.advance();
                Ok(Expr::Unary {
                    op: UnOp::Plus,
                    operand: Box::new(self.parse_unary()?),
                })
            }
            TokenKind::Minus => {
                self.advance();
                Ok(Expr::Unary {
                    op: UnOp::Neg,
                    operand: Box::new(self.parse_unary()?),
                })
            }
            TokenKind::Not => {
                self.advance();
                Ok(Expr::Unary {
                    op: UnOp::Not,
                    operand: Box::new(self.parse_unary()?),
                })
            }
            TokenKind::At => {
                self.advance();
                let name = self.expect_identifier()?;
                Ok(Expr::AddrOf(name))
            }
            _ => self.parse_postfix(),
        }
    }

    fn parse_postfix(&mut self) -> PResult<Expr> {
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> PResult<Expr> {
        match self.peek_kind().clone() {
            TokenKind::IntLiteral(n) => {
                self.advance();
                Ok(Expr::IntLiteral(n))
            }
            TokenKind::RealLiteral(n) => {
                self.advance();
                Ok(Expr::RealLiteral(n))
            }
            TokenKind::StringLiteral(s) => {
                self.advance();
                Ok(Expr::StringLiteral(s))
            }
            TokenKind::True => {
                self.advance();
                Ok(Expr::BoolLiteral(true))
            }
            TokenKind::False => {
                self.advance();
                Ok(Expr::BoolLiteral(false))
            }
            TokenKind::Nil => {
                self.advance();
                Ok(Expr::Nil)
            }
            TokenKind::Eof => {
                self.advance();
                self.expect(TokenKind::LParen, "'('")?;
                let name = self.expect_identifier()?;
                self.expect(TokenKind::RParen, "')'")?;
                Ok(Expr::FileEof(name))
            }
            TokenKind::LParen => {
                self.advance();
                let inner = self.parse_expr()?;
                self.expect(TokenKind::RParen, "')'")?;
                Ok(inner)
            }
            TokenKind::LBracket => {
                self.advance();
                if self.check(&TokenKind::RBracket) {
                    self.advance();
                    return Ok(Expr::SetLiteral(Vec::new()));
                }
                let elems = self.parse_index_list()?;
                self.expect(TokenKind::RBracket, "']'")?;
                Ok(Expr::SetLiteral(elems))
            }
            TokenKind::Identifier(name) => {
                self.advance();
                self.parse_identifier_expr(name)
            }
            _ => Err(ParseError::unexpected(self.peek(), "expression")),
        }
    }

    fn parse_identifier_expr(&mut self, name: String) -> PResult<Expr> {
        match self.peek_kind() {
            TokenKind::LParen => {
                self.advance();
                let mut args = Vec::new();
                if !self.check(&TokenKind::RParen) {
                    args.push(self.parse_expr()?);
                    while self.check(&TokenKind::Comma) {
                        self.advance();
                        args.push(self.parse_expr()?);
                    }
                }
                self.expect(TokenKind::RParen, "')'")?;
                Ok(Expr::Call { name, args })
            }
            TokenKind::LBracket => {
                self.advance();
                let indices = self.parse_index_list()?;
                self.expect(TokenKind::RBracket, "']'")?;
                if self.check(&TokenKind::Dot) {
                    self.advance();
                    let field = self.expect_identifier()?;
                    Ok(Expr::ArrayOfRecordFieldAccess {
                        array: name,
                        index: Box::new(indices.into_iter().next().unwrap()),
                        field,
                    })
                } else {
                    Ok(Expr::ArrayAccess { name, indices })
                }
            }
            TokenKind::Dot => {
                self.advance();
                let field = self.expect_identifier()?;
                if self.check(&TokenKind::LBracket) {
                    self.advance();
                    let indices = self.parse_index_list()?;
                    self.expect(TokenKind::RBracket, "']'")?;
                    Ok(Expr::RecordFieldArrayAccess {
                        record: name,
                        field,
                        indices,
                    })
                } else {
                    Ok(Expr::FieldAccess {
                        record: name,
                        field,
                    })
                }
            }
            TokenKind::Caret => {
                self.advance();
                Ok(Expr::Deref(Box::new(Expr::Variable(name))))
            }
            _ => Ok(Expr::Variable(name)),
        }
    }
}

fn split_locals_nested(decls: Vec<Declaration>) -> (Vec<Declaration>, Vec<Declaration>) {
    decls.into_iter().partition(|d| {
        !matches!(
            d,
            Declaration::Procedure { .. } | Declaration::Function { .. }
        )
    })
}

fn is_ci(lexeme: &str, word: &str) -> bool {
    lexeme.eq_ignore_ascii_case(word)
}

/// Parses `source` into a `Program` or `Unit` AST root.
pub fn parse(source: &str) -> Result<CompilationUnit, ParseError> {
    let tokens = crate::lexer::tokenize(source)?;
    Parser::new(tokens).parse_compilation_unit()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_program_src(src: &str) -> Program {
        match parse(src).expect("should parse") {
            CompilationUnit::Program(p) => p,
            CompilationUnit::Unit(_) => panic!("expected program"),
        }
    }

    #[test]
    fn parses_minimal_program() {
        let p = parse_program_src("program Hello; begin end.");
        assert_eq!(p.name, "Hello");
        assert!(p.decls.is_empty());
        assert_eq!(p.body, Stmt::Compound(vec![]));
    }

    #[test]
    fn program_header_discards_parameter_list() {
        let p = parse_program_src("program P(input, output); begin end.");
        assert_eq!(p.name, "P");
    }

    #[test]
    fn parses_var_section_with_array_and_pointer() {
        let p = parse_program_src(
            "program P; var a: array[1..10] of integer; p: ^integer; begin end.",
        );
        assert_eq!(p.decls.len(), 2);
        assert!(matches!(&p.decls[0], Declaration::ArrayVar { dimensions, .. } if dimensions == &vec![(1, 10)]));
        assert!(matches!(&p.decls[1], Declaration::PointerVar { points_to, .. } if points_to == "integer"));
    }

    #[test]
    fn parses_enum_and_record_types() {
        let p = parse_program_src(
            "program P; type Color = (Red, Green, Blue); type Point = record x: integer; y: integer end; begin end.",
        );
        assert!(matches!(&p.decls[0], Declaration::EnumType { values, .. } if values.len() == 3));
        assert!(matches!(&p.decls[1], Declaration::RecordType { fields, .. } if fields.len() == 2));
    }

    #[test]
    fn disambiguates_assignment_call_and_array_forms() {
        let p = parse_program_src(
            "program P; var x: integer; begin x := 1; foo(x); a[1] := 2; r.f := 3 end.",
        );
        match &p.body {
            Stmt::Compound(stmts) => {
                assert!(matches!(
                    stmts[0],
                    Stmt::Assign {
                        target: LValue::Variable(_),
                        ..
                    }
                ));
                assert!(matches!(stmts[1], Stmt::ProcCall { .. }));
                assert!(matches!(
                    stmts[2],
                    Stmt::Assign {
                        target: LValue::ArrayElem { .. },
                        ..
                    }
                ));
                assert!(matches!(
                    stmts[3],
                    Stmt::Assign {
                        target: LValue::RecordField { .. },
                        ..
                    }
                ));
            }
            _ => panic!("expected compound"),
        }
    }

    #[test]
    fn parses_case_with_ranges_and_else() {
        let p = parse_program_src(
            "program P; var g: string; c: integer; begin case c of 90..100: g := 'A'; 80..89: g := 'B' else g := 'X' end end.",
        );
        match &p.body {
            Stmt::Compound(stmts) => match &stmts[0] {
                Stmt::Case {
                    branches,
                    else_branch,
                    ..
                } => {
                    assert_eq!(branches.len(), 2);
                    assert!(matches!(
                        branches[0].label.values[0],
                        CaseLabelValue::Range(_, _)
                    ));
                    assert!(else_branch.is_some());
                }
                _ => panic!("expected case"),
            },
            _ => panic!("expected compound"),
        }
    }

    #[test]
    fn parses_for_to_and_downto() {
        let p = parse_program_src(
            "program P; var i: integer; begin for i := 1 to 10 do ; for i := 10 downto 1 do ; end.",
        );
        match &p.body {
            Stmt::Compound(stmts) => {
                assert!(matches!(stmts[0], Stmt::For { downto: false, .. }));
                assert!(matches!(stmts[1], Stmt::For { downto: true, .. }));
            }
            _ => panic!(),
        }
    }

    #[test]
    fn parses_pointer_new_dispose_and_deref() {
        let p = parse_program_src(
            "program P; var p: ^integer; begin new(p); p^ := 42; writeln(p^); dispose(p) end.",
        );
        match &p.body {
            Stmt::Compound(stmts) => {
                assert!(matches!(stmts[0], Stmt::New(_)));
                assert!(matches!(
                    stmts[1],
                    Stmt::Assign {
                        target: LValue::PointerDeref(_),
                        ..
                    }
                ));
                assert!(matches!(stmts[3], Stmt::Dispose(_)));
            }
            _ => panic!(),
        }
    }

    #[test]
    fn parses_unit_with_interface_and_implementation() {
        let src = r#"
            unit MathUtils;
            interface
            function Square(x: integer): integer;
            implementation
            function Square(x: integer): integer;
            begin
                Square := x * x
            end;
            end.
        "#;
        match parse(src).unwrap() {
            CompilationUnit::Unit(u) => {
                assert_eq!(u.name, "MathUtils");
                assert_eq!(u.interface_decls.len(), 1);
                assert_eq!(u.impl_decls.len(), 1);
                match &u.impl_decls[0] {
                    Declaration::Function { body, .. } => {
                        assert_ne!(*body, Stmt::Empty);
                    }
                    _ => panic!("expected function"),
                }
            }
            _ => panic!("expected unit"),
        }
    }

    #[test]
    fn parses_set_literal_and_in_operator() {
        let p = parse_program_src(
            "program P; var x: integer; b: boolean; begin b := x in [1, 2, 3] end.",
        );
        match &p.body {
            Stmt::Compound(stmts) => match &stmts[0] {
                Stmt::Assign { value, .. } => {
                    assert!(matches!(value, Expr::SetIn { .. }));
                }
                _ => panic!(),
            },
            _ => panic!(),
        }
    }

    #[test]
    fn operator_precedence_multiplicative_over_additive() {
        let p = parse_program_src("program P; var x: integer; begin x := 1 + 2 * 3 end.");
        match &p.body {
            Stmt::Compound(stmts) => match &stmts[0] {
                Stmt::Assign { value, .. } => match value {
                    Expr::Binary {
                        op: BinOp::Add,
                        rhs,
                        ..
                    } => {
                        assert!(matches!(**rhs, Expr::Binary { op: BinOp::Mul, .. }));
                    }
                    _ => panic!("expected addition at top"),
                },
                _ => panic!(),
            },
            _ => panic!(),
        }
    }

    #[test]
    fn address_of_requires_bare_variable() {
        let p = parse_program_src("program P; var p: ^integer; x: integer; begin p := @x end.");
        match &p.body {
            Stmt::Compound(stmts) => match &stmts[0] {
                Stmt::Assign { value, .. } => assert!(matches!(value, Expr::AddrOf(_))),
                _ => panic!(),
            },
            _ => panic!(),
        }
    }

    #[test]
    fn write_and_read_without_parens() {
        let p = parse_program_src("program P; begin writeln; readln end.");
        match &p.body {
            Stmt::Compound(stmts) => {
                assert!(matches!(stmts[0], Stmt::Write { newline: true, .. }));
                assert!(matches!(stmts[1], Stmt::Read { newline: true, .. }));
            }
            _ => panic!(),
        }
    }

    #[test]
    fn read_with_file_variable_and_targets() {
        let p =
            parse_program_src("program P; var f: text; x, y: integer; begin read(f, x, y) end.");
        match &p.body {
            Stmt::Compound(stmts) => {
                assert!(matches!(stmts[0], Stmt::File(FileOp::Read { .. })));
            }
            _ => panic!(),
        }
    }

    #[test]
    fn unexpected_token_is_a_syntax_error() {
        assert!(parse("program P; begin x := end.").is_err());
    }
}
