use crate::error::{DbError, DbResult};
use crate::parser::ast::SrcPos;

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Ident(String),
    /// backtick-escaped symbolic name
    EscapedIdent(String),
    Keyword(String),
    IntLiteral(i64),
    DoubleLiteral(f64),
    StringLiteral(String),
    Parameter(String),
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Comma,
    Colon,
    Semicolon,
    Dot,
    DotDot,
    Pipe,
    Dash,
    ArrowRight,
    ArrowLeftDash,
    Eq,
    NotEq,
    /// the `!=` the grammar rejects
    InvalidNotEq,
    Lt,
    Le,
    Gt,
    Ge,
    Plus,
    Star,
    Slash,
    Percent,
    Eof,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub pos: SrcPos,
}

const KEYWORDS: &[&str] = &[
    "MATCH", "OPTIONAL", "WHERE", "RETURN", "WITH", "UNWIND", "AS", "CREATE", "MERGE", "SET",
    "DELETE", "DETACH", "ORDER", "BY", "SKIP", "LIMIT", "DISTINCT", "ASC", "ASCENDING", "DESC",
    "DESCENDING", "AND", "OR", "XOR", "NOT", "TRUE", "FALSE", "NULL", "NODE", "REL", "TABLE",
    "GROUP", "RDF", "GRAPH", "PRIMARY", "KEY", "FROM", "TO", "DROP", "ALTER", "ADD", "RENAME",
    "COPY", "COLUMN", "BEGIN", "TRANSACTION", "READ", "ONLY", "COMMIT", "ROLLBACK", "CHECKPOINT",
    "EXPLAIN", "PROFILE", "COMMENT", "ON", "IS", "CALL", "LOAD", "MACRO", "SHORTEST", "ALL",
    "EXISTS", "COUNT", "UNION",
];

pub struct Lexer<'a> {
    input: &'a [u8],
    pos: usize,
    line: u32,
    column: u32,
}

impl<'a> Lexer<'a> {
    pub fn new(input: &'a str) -> Self {
        Self {
            input: input.as_bytes(),
            pos: 0,
            line: 1,
            column: 1,
        }
    }

    pub fn tokenize(mut self) -> DbResult<Vec<Token>> {
        let mut tokens = Vec::new();
        loop {
            let token = self.next_token()?;
            let is_eof = token.kind == TokenKind::Eof;
            tokens.push(token);
            if is_eof {
                return Ok(tokens);
            }
        }
    }

    fn src_pos(&self) -> SrcPos {
        SrcPos {
            line: self.line,
            column: self.column,
        }
    }

    fn peek(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    fn peek2(&self) -> Option<u8> {
        self.input.get(self.pos + 1).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let c = self.peek()?;
        self.pos += 1;
        if c == b'\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(c)
    }

    fn skip_whitespace_and_comments(&mut self) {
        loop {
            match self.peek() {
                Some(c) if c.is_ascii_whitespace() => {
                    self.bump();
                }
                Some(b'/') if self.peek2() == Some(b'/') => {
                    while let Some(c) = self.peek() {
                        if c == b'\n' {
                            break;
                        }
                        self.bump();
                    }
                }
                _ => return,
            }
        }
    }

    fn next_token(&mut self) -> DbResult<Token> {
        self.skip_whitespace_and_comments();
        let pos = self.src_pos();
        let c = match self.peek() {
            None => {
                return Ok(Token {
                    kind: TokenKind::Eof,
                    pos,
                })
            }
            Some(c) => c,
        };
        let kind = match c {
            b'(' => self.single(TokenKind::LParen),
            b')' => self.single(TokenKind::RParen),
            b'[' => self.single(TokenKind::LBracket),
            b']' => self.single(TokenKind::RBracket),
            b'{' => self.single(TokenKind::LBrace),
            b'}' => self.single(TokenKind::RBrace),
            b',' => self.single(TokenKind::Comma),
            b':' => self.single(TokenKind::Colon),
            b';' => self.single(TokenKind::Semicolon),
            b'|' => self.single(TokenKind::Pipe),
            b'+' => self.single(TokenKind::Plus),
            b'*' => self.single(TokenKind::Star),
            b'/' => self.single(TokenKind::Slash),
            b'%' => self.single(TokenKind::Percent),
            b'=' => self.single(TokenKind::Eq),
            b'.' => {
                self.bump();
                if self.peek() == Some(b'.') {
                    self.bump();
                    TokenKind::DotDot
                } else {
                    TokenKind::Dot
                }
            }
            b'-' => {
                self.bump();
                if self.peek() == Some(b'>') {
                    self.bump();
                    TokenKind::ArrowRight
                } else {
                    TokenKind::Dash
                }
            }
            b'<' => {
                self.bump();
                match self.peek() {
                    Some(b'>') => {
                        self.bump();
                        TokenKind::NotEq
                    }
                    Some(b'=') => {
                        self.bump();
                        TokenKind::Le
                    }
                    Some(b'-') => {
                        self.bump();
                        TokenKind::ArrowLeftDash
                    }
                    _ => TokenKind::Lt,
                }
            }
            b'>' => {
                self.bump();
                if self.peek() == Some(b'=') {
                    self.bump();
                    TokenKind::Ge
                } else {
                    TokenKind::Gt
                }
            }
            b'!' => {
                self.bump();
                if self.peek() == Some(b'=') {
                    self.bump();
                    TokenKind::InvalidNotEq
                } else {
                    return Err(DbError::parser(
                        "unexpected character '!'",
                        pos.line,
                        pos.column,
                    ));
                }
            }
            b'$' => {
                self.bump();
                TokenKind::Parameter(self.take_ident_chars())
            }
            b'\'' | b'"' => self.string_literal(c, pos)?,
            b'`' => {
                self.bump();
                let mut name = String::new();
                loop {
                    match self.bump() {
                        None => {
                            return Err(DbError::parser(
                                "unterminated escaped name",
                                pos.line,
                                pos.column,
                            ))
                        }
                        Some(b'`') => break,
                        Some(c) => name.push(c as char),
                    }
                }
                TokenKind::EscapedIdent(name)
            }
            c if c.is_ascii_digit() => self.number(pos)?,
            c if c.is_ascii_alphabetic() || c == b'_' => {
                let word = self.take_ident_chars();
                let upper = word.to_ascii_uppercase();
                if KEYWORDS.contains(&upper.as_str()) {
                    TokenKind::Keyword(upper)
                } else {
                    TokenKind::Ident(word)
                }
            }
            other => {
                return Err(DbError::parser(
                    format!("unexpected character {:?}", other as char),
                    pos.line,
                    pos.column,
                ))
            }
        };
        Ok(Token { kind, pos })
    }

    fn single(&mut self, kind: TokenKind) -> TokenKind {
        self.bump();
        kind
    }

    fn take_ident_chars(&mut self) -> String {
        let mut word = String::new();
        while let Some(c) = self.peek() {
            if c.is_ascii_alphanumeric() || c == b'_' {
                word.push(c as char);
                self.bump();
            } else {
                break;
            }
        }
        word
    }

    fn string_literal(&mut self, quote: u8, pos: SrcPos) -> DbResult<TokenKind> {
        self.bump();
        let mut s = String::new();
        loop {
            match self.bump() {
                None => {
                    return Err(DbError::parser(
                        "unterminated string literal",
                        pos.line,
                        pos.column,
                    ))
                }
                Some(b'\\') => match self.bump() {
                    Some(b'n') => s.push('\n'),
                    Some(b't') => s.push('\t'),
                    Some(c) => s.push(c as char),
                    None => {
                        return Err(DbError::parser(
                            "unterminated string literal",
                            pos.line,
                            pos.column,
                        ))
                    }
                },
                Some(c) if c == quote => break,
                Some(c) => s.push(c as char),
            }
        }
        Ok(TokenKind::StringLiteral(s))
    }

    fn number(&mut self, pos: SrcPos) -> DbResult<TokenKind> {
        let mut text = String::new();
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() {
                text.push(c as char);
                self.bump();
            } else {
                break;
            }
        }
        // keep `1..3` working: a dot only joins the number when not
        // followed by a second dot
        if self.peek() == Some(b'.')
            && self.peek2().map_or(false, |c| c.is_ascii_digit())
        {
            text.push('.');
            self.bump();
            while let Some(c) = self.peek() {
                if c.is_ascii_digit() {
                    text.push(c as char);
                    self.bump();
                } else {
                    break;
                }
            }
            return text
                .parse()
                .map(TokenKind::DoubleLiteral)
                .map_err(|_| DbError::parser("invalid number literal", pos.line, pos.column));
        }
        text.parse()
            .map(TokenKind::IntLiteral)
            .map_err(|_| DbError::parser("invalid number literal", pos.line, pos.column))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(input: &str) -> Vec<TokenKind> {
        Lexer::new(input)
            .tokenize()
            .unwrap()
            .into_iter()
            .map(|t| t.kind)
            .collect()
    }

    #[test]
    fn arrows_and_operators() {
        assert_eq!(
            kinds("-[r]->"),
            vec![
                TokenKind::Dash,
                TokenKind::LBracket,
                TokenKind::Ident("r".into()),
                TokenKind::RBracket,
                TokenKind::ArrowRight,
                TokenKind::Eof
            ]
        );
        assert_eq!(kinds("<>")[0], TokenKind::NotEq);
        assert_eq!(kinds("!=")[0], TokenKind::InvalidNotEq);
        assert_eq!(kinds("<=")[0], TokenKind::Le);
        assert_eq!(kinds("<-")[0], TokenKind::ArrowLeftDash);
    }

    #[test]
    fn range_does_not_eat_dots() {
        assert_eq!(
            kinds("*2..3"),
            vec![
                TokenKind::Star,
                TokenKind::IntLiteral(2),
                TokenKind::DotDot,
                TokenKind::IntLiteral(3),
                TokenKind::Eof
            ]
        );
        assert_eq!(kinds("1.5")[0], TokenKind::DoubleLiteral(1.5));
    }

    #[test]
    fn keywords_are_case_insensitive() {
        assert_eq!(kinds("match")[0], TokenKind::Keyword("MATCH".into()));
        assert_eq!(kinds("Person")[0], TokenKind::Ident("Person".into()));
    }

    #[test]
    fn positions_are_tracked() {
        let tokens = Lexer::new("MATCH\n  (a)").tokenize().unwrap();
        assert_eq!(tokens[0].pos, SrcPos { line: 1, column: 1 });
        assert_eq!(tokens[1].pos, SrcPos { line: 2, column: 3 });
    }

    #[test]
    fn escaped_names_and_strings() {
        assert_eq!(kinds("`weird name`")[0], TokenKind::EscapedIdent("weird name".into()));
        assert_eq!(
            kinds("'it\\'s'")[0],
            TokenKind::StringLiteral("it's".into())
        );
    }
}
