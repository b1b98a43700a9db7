// ABOUTME: Single-pass lexer turning Pascal source text into a token sequence

use crate::error::LexError;
use crate::token::{lookup_keyword, Position, Token, TokenKind};

pub struct Lexer<'a> {
    chars: Vec<char>,
    src: &'a str,
    pos: usize,
    line: usize,
    column: usize,
}

impl<'a> Lexer<'a> {
    pub fn new(src: &'a str) -> Self {
        Lexer {
            chars: src.chars().collect(),
            src,
            pos: 0,
            line: 1,
            column: 1,
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn advance(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += 1;
        if c == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(c)
    }

    fn current_pos(&self) -> Position {
        Position::new(self.line, self.column)
    }

    fn skip_whitespace_and_comments(&mut self) -> Result<(), LexError> {
        loop {
            match self.peek() {
                Some(c) if c.is_whitespace() => {
                    self.advance();
                }
                Some('{') => {
                    let start = self.current_pos();
                    self.advance();
                    loop {
                        match self.advance() {
                            Some('}') => break,
                            Some(_) => {}
                            None => {
                                return Err(LexError::UnterminatedComment { pos: start });
                            }
                        }
                    }
                }
                Some('(') if self.peek_at(1) == Some('*') => {
                    let start = self.current_pos();
                    self.advance();
                    self.advance();
                    loop {
                        if self.peek() == Some('*') && self.peek_at(1) == Some(')') {
                            self.advance();
                            self.advance();
                            break;
                        }
                        if self.advance().is_none() {
                            return Err(LexError::UnterminatedComment { pos: start });
                        }
                    }
                }
                Some('/') if self.peek_at(1) == Some('/') => {
                    while let Some(c) = self.peek() {
                        if c == '\n' {
                            break;
                        }
                        self.advance();
                    }
                }
                _ => break,
            }
        }
        Ok(())
    }

    fn read_identifier_or_keyword(&mut self) -> Token {
        let start = self.current_pos();
        let mut lexeme = String::new();
        while let Some(c) = self.peek() {
            if c.is_alphanumeric() || c == '_' {
                lexeme.push(c);
                self.advance();
            } else {
                break;
            }
        }
        let lower = lexeme.to_lowercase();
        if let Some(kind) = lookup_keyword(&lower) {
            Token::new(kind, lower, start)
        } else {
            Token::new(TokenKind::Identifier(lexeme.clone()), lexeme, start)
        }
    }

    fn read_number(&mut self) -> Result<Token, LexError> {
        let start = self.current_pos();
        let mut lexeme = String::new();
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() {
                lexeme.push(c);
                self.advance();
            } else {
                break;
            }
        }

        // A single '.' not followed by another '.' (which would be the range
        // operator) makes this a real literal.
        let is_real = self.peek() == Some('.') && self.peek_at(1) != Some('.');

        if is_real {
            lexeme.push('.');
            self.advance();
            while let Some(c) = self.peek() {
                if c.is_ascii_digit() {
                    lexeme.push(c);
                    self.advance();
                } else {
                    break;
                }
            }
            let value: f64 = lexeme
                .parse()
                .map_err(|_| LexError::InvalidNumber { lexeme: lexeme.clone(), pos: start })?;
            Ok(Token::new(TokenKind::RealLiteral(value), lexeme, start))
        } else {
            let value: i64 = lexeme
                .parse()
                .map_err(|_| LexError::InvalidNumber { lexeme: lexeme.clone(), pos: start })?;
            Ok(Token::new(TokenKind::IntLiteral(value), lexeme, start))
        }
    }

    fn read_string(&mut self) -> Result<Token, LexError> {
        let start = self.current_pos();
        let delim = self.advance().expect("caller checked quote");
        let mut value = String::new();
        loop {
            match self.peek() {
                None => return Err(LexError::UnterminatedString { pos: start }),
                Some(c) if c == delim => {
                    self.advance();
                    break;
                }
                Some('\\') if self.peek_at(1) == Some(delim) => {
                    self.advance();
                    value.push(delim);
                    self.advance();
                }
                Some(c) => {
                    value.push(c);
                    self.advance();
                }
            }
        }
        let lexeme = format!("{delim}{value}{delim}");
        Ok(Token::new(TokenKind::StringLiteral(value), lexeme, start))
    }

    fn read_punctuation(&mut self) -> Result<Token, LexError> {
        let start = self.current_pos();
        let c = self.advance().expect("caller checked non-empty");
        macro_rules! tok {
            ($kind:expr, $lex:expr) => {
                Ok(Token::new($kind, $lex, start))
            };
        }
        match c {
            '+' => tok!(TokenKind::Plus, "+"),
            '-' => tok!(TokenKind::Minus, "-"),
            '*' => tok!(TokenKind::Star, "*"),
            '/' => tok!(TokenKind::Slash, "/"),
            '=' => tok!(TokenKind::Eq, "="),
            '<' => {
                if self.peek() == Some('>') {
                    self.advance();
                    tok!(TokenKind::NotEq, "<>")
                } else if self.peek() == Some('=') {
                    self.advance();
                    tok!(TokenKind::Le, "<=")
                } else {
                    tok!(TokenKind::Lt, "<")
                }
            }
            '>' => {
                if self.peek() == Some('=') {
                    self.advance();
                    tok!(TokenKind::Ge, ">=")
                } else {
                    tok!(TokenKind::Gt, ">")
                }
            }
            ':' => {
                if self.peek() == Some('=') {
                    self.advance();
                    tok!(TokenKind::Assign_, ":=")
                } else {
                    tok!(TokenKind::Colon, ":")
                }
            }
            ';' => tok!(TokenKind::Semicolon, ";"),
            ',' => tok!(TokenKind::Comma, ","),
            '.' => {
                if self.peek() == Some('.') {
                    self.advance();
                    tok!(TokenKind::DotDot, "..")
                } else {
                    tok!(TokenKind::Dot, ".")
                }
            }
            '(' => tok!(TokenKind::LParen, "("),
            ')' => tok!(TokenKind::RParen, ")"),
            '[' => tok!(TokenKind::LBracket, "["),
            ']' => tok!(TokenKind::RBracket, "]"),
            '^' => tok!(TokenKind::Caret, "^"),
            '@' => tok!(TokenKind::At, "@"),
            other => Err(LexError::UnexpectedChar { ch: other, pos: start }),
        }
    }

    /// Scans the entire source into a finite token sequence terminated by `Eof_`.
    pub fn tokenize(mut self) -> Result<Vec<Token>, LexError> {
        let mut tokens = Vec::new();
        loop {
            self.skip_whitespace_and_comments()?;
            let pos = self.current_pos();
            match self.peek() {
                None => {
                    tokens.push(Token::new(TokenKind::Eof_, "", pos));
                    break;
                }
                Some(c) if c.is_alphabetic() || c == '_' => {
                    tokens.push(self.read_identifier_or_keyword());
                }
                Some(c) if c.is_ascii_digit() => {
                    tokens.push(self.read_number()?);
                }
                Some(c) if c == '\'' || c == '"' => {
                    tokens.push(self.read_string()?);
                }
                Some(_) => {
                    tokens.push(self.read_punctuation()?);
                }
            }
        }
        let _ = self.src; // retained for potential slice-based diagnostics
        Ok(tokens)
    }
}

/// Convenience entry point: tokenizes `src` in one call.
pub fn tokenize(src: &str) -> Result<Vec<Token>, LexError> {
    Lexer::new(src).tokenize()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<TokenKind> {
        tokenize(src).unwrap().into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn skips_whitespace_and_three_comment_styles() {
        let toks = kinds("  { c1 } x (* c2 *) // c3\n y");
        assert_eq!(
            toks,
            vec![
                TokenKind::Identifier("x".into()),
                TokenKind::Identifier("y".into()),
                TokenKind::Eof_,
            ]
        );
    }

    #[test]
    fn keywords_are_case_insensitive_and_lowercased() {
        let toks = tokenize("BEGIN Begin begin").unwrap();
        for t in &toks[..3] {
            assert_eq!(t.kind, TokenKind::Begin);
            assert_eq!(t.lexeme, "begin");
        }
    }

    #[test]
    fn identifiers_preserve_original_casing() {
        let toks = tokenize("MyVar").unwrap();
        assert_eq!(toks[0].lexeme, "MyVar");
        assert_eq!(toks[0].kind, TokenKind::Identifier("MyVar".into()));
    }

    #[test]
    fn integer_vs_real_literal() {
        assert_eq!(kinds("42")[0], TokenKind::IntLiteral(42));
        assert_eq!(kinds("3.14")[0], TokenKind::RealLiteral(3.14));
        // a range operator must not be consumed as a decimal point
        let toks = tokenize("1..5").unwrap();
        assert_eq!(toks[0].kind, TokenKind::IntLiteral(1));
        assert_eq!(toks[1].kind, TokenKind::DotDot);
        assert_eq!(toks[2].kind, TokenKind::IntLiteral(5));
    }

    #[test]
    fn string_literal_with_escaped_quote() {
        let toks = tokenize(r"'it\'s'").unwrap();
        assert_eq!(toks[0].kind, TokenKind::StringLiteral("it's".into()));
    }

    #[test]
    fn operators_and_punctuation() {
        let toks = kinds(":= <> <= >= .. ^ @");
        assert_eq!(
            toks,
            vec![
                TokenKind::Assign_,
                TokenKind::NotEq,
                TokenKind::Le,
                TokenKind::Ge,
                TokenKind::DotDot,
                TokenKind::Caret,
                TokenKind::At,
                TokenKind::Eof_,
            ]
        );
    }

    #[test]
    fn tracks_line_and_column() {
        let toks = tokenize("x\ny").unwrap();
        assert_eq!(toks[0].pos, Position::new(1, 1));
        assert_eq!(toks[1].pos, Position::new(2, 1));
    }

    #[test]
    fn unexpected_character_is_a_lexical_error() {
        let err = tokenize("x $ y").unwrap_err();
        assert!(matches!(err, LexError::UnexpectedChar { ch: '$', .. }));
    }

    #[test]
    fn unterminated_string_is_an_error() {
        assert!(matches!(
            tokenize("'abc"),
            Err(LexError::UnterminatedString { .. })
        ));
    }
}
