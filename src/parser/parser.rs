use crate::error::{DbError, DbResult};
use crate::parser::ast::*;
use crate::parser::lexer::{Lexer, Token, TokenKind};

/// Parse one statement. Every grammar-level complaint surfaces as
/// `DbError::Parser` with the offending token's position.
pub fn parse(input: &str) -> DbResult<Statement> {
    let tokens = Lexer::new(input).tokenize()?;
    let mut parser = Parser { tokens, pos: 0 };
    let statement = parser.parse_statement()?;
    parser.skip_semicolons();
    parser.expect_eof()?;
    Ok(statement)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn peek_at(&self, ahead: usize) -> &Token {
        &self.tokens[(self.pos + ahead).min(self.tokens.len() - 1)]
    }

    fn bump(&mut self) -> Token {
        let token = self.peek().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        token
    }

    fn err<T>(&self, msg: impl Into<String>, token: &Token) -> DbResult<T> {
        Err(DbError::parser(msg.into(), token.pos.line, token.pos.column))
    }

    fn at_keyword(&self, kw: &str) -> bool {
        matches!(&self.peek().kind, TokenKind::Keyword(k) if k == kw)
    }

    fn at_keyword_ahead(&self, ahead: usize, kw: &str) -> bool {
        matches!(&self.peek_at(ahead).kind, TokenKind::Keyword(k) if k == kw)
    }

    fn eat_keyword(&mut self, kw: &str) -> bool {
        if self.at_keyword(kw) {
            self.bump();
            true
        } else {
            false
        }
    }

    fn expect_keyword(&mut self, kw: &str) -> DbResult<Token> {
        if self.at_keyword(kw) {
            Ok(self.bump())
        } else {
            let token = self.peek().clone();
            self.err(format!("expected {}", kw), &token)
        }
    }

    fn eat(&mut self, kind: &TokenKind) -> bool {
        if &self.peek().kind == kind {
            self.bump();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: TokenKind, what: &str) -> DbResult<Token> {
        if self.peek().kind == kind {
            Ok(self.bump())
        } else {
            let token = self.peek().clone();
            self.err(format!("expected {}", what), &token)
        }
    }

    fn expect_eof(&mut self) -> DbResult<()> {
        if self.peek().kind == TokenKind::Eof {
            Ok(())
        } else {
            let token = self.peek().clone();
            self.err("unexpected input after statement", &token)
        }
    }

    fn skip_semicolons(&mut self) {
        while self.eat(&TokenKind::Semicolon) {}
    }

    /// Symbolic names: identifiers, escaped names, and a handful of
    /// non-reserved keywords. An empty escaped name is the grammar's
    /// empty-token error.
    fn symbolic_name(&mut self) -> DbResult<String> {
        let token = self.bump();
        let pos = token.pos;
        match token.kind {
            TokenKind::Ident(name) => Ok(name),
            TokenKind::EscapedIdent(name) => {
                if name.is_empty() {
                    Err(DbError::parser(
                        "empty token in escaped symbolic name",
                        pos.line,
                        pos.column,
                    ))
                } else {
                    Ok(name)
                }
            }
            TokenKind::Keyword(kw) => Ok(kw.to_lowercase()),
            _ => Err(DbError::parser("expected a name", pos.line, pos.column)),
        }
    }

    fn string_literal(&mut self) -> DbResult<String> {
        let token = self.bump();
        match token.kind {
            TokenKind::StringLiteral(s) => Ok(s),
            _ => self.err("expected a string literal", &token),
        }
    }

    fn parse_statement(&mut self) -> DbResult<Statement> {
        let token = self.peek().clone();
        match &token.kind {
            TokenKind::Keyword(kw) => match kw.as_str() {
                "EXPLAIN" | "PROFILE" => {
                    let profile = kw == "PROFILE";
                    self.bump();
                    let inner = self.parse_statement()?;
                    Ok(Statement::Explain {
                        inner: Box::new(inner),
                        profile,
                        pos: token.pos,
                    })
                }
                "CREATE" => self.parse_create(),
                "DROP" => self.parse_drop(),
                "ALTER" => self.parse_alter(),
                "COPY" => self.parse_copy(),
                "COMMENT" => self.parse_comment_on(),
                "BEGIN" => {
                    self.bump();
                    self.expect_keyword("TRANSACTION")?;
                    let read_only = if self.eat_keyword("READ") {
                        self.expect_keyword("ONLY")?;
                        true
                    } else {
                        false
                    };
                    Ok(Statement::BeginTransaction {
                        read_only,
                        pos: token.pos,
                    })
                }
                "COMMIT" => {
                    self.bump();
                    let skip_checkpoint = self.parse_skip_checkpoint()?;
                    Ok(Statement::Commit {
                        skip_checkpoint,
                        pos: token.pos,
                    })
                }
                "ROLLBACK" => {
                    self.bump();
                    let skip_checkpoint = self.parse_skip_checkpoint()?;
                    Ok(Statement::Rollback {
                        skip_checkpoint,
                        pos: token.pos,
                    })
                }
                "CALL" if !self.is_query_start() => self.parse_standalone_call(),
                _ => Ok(Statement::Query(self.parse_query()?)),
            },
            _ => Ok(Statement::Query(self.parse_query()?)),
        }
    }

    fn is_query_start(&self) -> bool {
        // CALL at statement level is a config call unless it reads
        // like an in-query call followed by more clauses
        false
    }

    fn parse_skip_checkpoint(&mut self) -> DbResult<bool> {
        if self.eat_keyword("SKIP") {
            self.expect_keyword("CHECKPOINT")?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn parse_create(&mut self) -> DbResult<Statement> {
        let create = self.peek().clone();
        if self.at_keyword_ahead(1, "NODE") {
            self.bump(); // CREATE
            self.bump(); // NODE
            self.expect_keyword("TABLE")?;
            return self.parse_create_node_table(create.pos);
        }
        if self.at_keyword_ahead(1, "REL") {
            self.bump(); // CREATE
            self.bump(); // REL
            self.expect_keyword("TABLE")?;
            if self.eat_keyword("GROUP") {
                self.skip_rest_of_statement();
                return Ok(Statement::CreateRelTableGroup { pos: create.pos });
            }
            return self.parse_create_rel_table(create.pos);
        }
        if self.at_keyword_ahead(1, "RDF") {
            self.bump();
            self.bump();
            self.expect_keyword("GRAPH")?;
            self.skip_rest_of_statement();
            return Ok(Statement::CreateRdfGraph { pos: create.pos });
        }
        if self.at_keyword_ahead(1, "MACRO") {
            self.bump();
            self.bump();
            self.skip_rest_of_statement();
            return Ok(Statement::CreateMacro { pos: create.pos });
        }
        // plain CREATE pattern: an updating query
        Ok(Statement::Query(self.parse_query()?))
    }

    fn skip_rest_of_statement(&mut self) {
        while !matches!(self.peek().kind, TokenKind::Eof | TokenKind::Semicolon) {
            self.bump();
        }
    }

    fn parse_create_node_table(&mut self, pos: SrcPos) -> DbResult<Statement> {
        let name = self.symbolic_name()?;
        self.expect(TokenKind::LParen, "(")?;
        let mut properties = Vec::new();
        let mut primary_key = None;
        loop {
            if self.at_keyword("PRIMARY") {
                self.bump();
                self.expect_keyword("KEY")?;
                self.expect(TokenKind::LParen, "(")?;
                primary_key = Some(self.symbolic_name()?);
                self.expect(TokenKind::RParen, ")")?;
            } else {
                let prop = self.symbolic_name()?;
                let type_name = self.parse_type_name()?;
                properties.push((prop, type_name));
            }
            if !self.eat(&TokenKind::Comma) {
                break;
            }
        }
        self.expect(TokenKind::RParen, ")")?;
        let primary_key = match primary_key {
            Some(pk) => pk,
            None => {
                return Err(DbError::parser(
                    format!("node table {} needs a PRIMARY KEY", name),
                    pos.line,
                    pos.column,
                ))
            }
        };
        Ok(Statement::CreateNodeTable {
            name,
            properties,
            primary_key,
            pos,
        })
    }

    fn parse_create_rel_table(&mut self, pos: SrcPos) -> DbResult<Statement> {
        let name = self.symbolic_name()?;
        self.expect(TokenKind::LParen, "(")?;
        self.expect_keyword("FROM")?;
        let src = self.symbolic_name()?;
        self.expect_keyword("TO")?;
        let dst = self.symbolic_name()?;
        let mut properties = Vec::new();
        let mut multiplicity = None;
        while self.eat(&TokenKind::Comma) {
            let word = self.symbolic_name()?;
            // a trailing bare word is the multiplicity
            if self.peek().kind == TokenKind::RParen {
                multiplicity = Some(word);
                break;
            }
            let type_name = self.parse_type_name()?;
            properties.push((word, type_name));
        }
        self.expect(TokenKind::RParen, ")")?;
        Ok(Statement::CreateRelTable {
            name,
            src,
            dst,
            properties,
            multiplicity,
            pos,
        })
    }

    /// Type names can be `INT64`, `STRING[]`, `FIXED_LIST(INT64, 3)`…
    /// collected as raw text and parsed by the binder.
    fn parse_type_name(&mut self) -> DbResult<String> {
        let mut text = self.symbolic_name()?.to_ascii_uppercase();
        if self.eat(&TokenKind::LParen) {
            text.push('(');
            let mut depth = 1;
            while depth > 0 {
                let token = self.bump();
                match token.kind {
                    TokenKind::LParen => {
                        depth += 1;
                        text.push('(');
                    }
                    TokenKind::RParen => {
                        depth -= 1;
                        if depth > 0 {
                            text.push(')');
                        }
                    }
                    TokenKind::Comma => text.push(','),
                    TokenKind::Ident(w) => text.push_str(&w.to_ascii_uppercase()),
                    TokenKind::Keyword(w) => text.push_str(&w),
                    TokenKind::IntLiteral(n) => text.push_str(&n.to_string()),
                    TokenKind::Eof => {
                        return self.err("unterminated type name", &token);
                    }
                    _ => return self.err("unexpected token in type name", &token),
                }
            }
            text.push(')');
        }
        while self.eat(&TokenKind::LBracket) {
            self.expect(TokenKind::RBracket, "]")?;
            text.push_str("[]");
        }
        Ok(text)
    }

    fn parse_drop(&mut self) -> DbResult<Statement> {
        let token = self.bump(); // DROP
        self.expect_keyword("TABLE")?;
        let name = self.symbolic_name()?;
        Ok(Statement::DropTable {
            name,
            pos: token.pos,
        })
    }

    fn parse_alter(&mut self) -> DbResult<Statement> {
        let token = self.bump(); // ALTER
        self.expect_keyword("TABLE")?;
        let table = self.symbolic_name()?;
        let action = if self.eat_keyword("ADD") {
            let name = self.symbolic_name()?;
            let type_name = self.parse_type_name()?;
            AlterAction::AddProperty { name, type_name }
        } else if self.eat_keyword("DROP") {
            AlterAction::DropProperty {
                name: self.symbolic_name()?,
            }
        } else if self.eat_keyword("RENAME") {
            if self.eat_keyword("TO") {
                AlterAction::RenameTable {
                    new: self.symbolic_name()?,
                }
            } else {
                let old = self.symbolic_name()?;
                self.expect_keyword("TO")?;
                AlterAction::RenameProperty {
                    old,
                    new: self.symbolic_name()?,
                }
            }
        } else {
            let t = self.peek().clone();
            return self.err("expected ADD, DROP or RENAME", &t);
        };
        Ok(Statement::AlterTable {
            table,
            action,
            pos: token.pos,
        })
    }

    fn parse_copy(&mut self) -> DbResult<Statement> {
        let token = self.bump(); // COPY
        if self.eat(&TokenKind::LParen) {
            // COPY (query) TO 'path'
            let query = self.parse_query()?;
            self.expect(TokenKind::RParen, ")")?;
            self.expect_keyword("TO")?;
            let path = self.string_literal()?;
            return Ok(Statement::CopyTo {
                query,
                path,
                pos: token.pos,
            });
        }
        let table = self.symbolic_name()?;
        self.expect_keyword("FROM")?;
        let mut paths = Vec::new();
        if self.eat(&TokenKind::LParen) {
            loop {
                paths.push(self.string_literal()?);
                if !self.eat(&TokenKind::Comma) {
                    break;
                }
            }
            self.expect(TokenKind::RParen, ")")?;
        } else if self.eat(&TokenKind::LBracket) {
            loop {
                paths.push(self.string_literal()?);
                if !self.eat(&TokenKind::Comma) {
                    break;
                }
            }
            self.expect(TokenKind::RBracket, "]")?;
        } else {
            paths.push(self.string_literal()?);
        }
        let by_column = if self.eat_keyword("BY") {
            self.expect_keyword("COLUMN")?;
            true
        } else {
            false
        };
        let mut options = Vec::new();
        if self.eat(&TokenKind::LParen) {
            loop {
                let key = self.symbolic_name()?;
                self.expect(TokenKind::Eq, "=")?;
                let value = match self.bump() {
                    Token {
                        kind: TokenKind::StringLiteral(s),
                        ..
                    } => s,
                    Token {
                        kind: TokenKind::Ident(s),
                        ..
                    } => s,
                    Token {
                        kind: TokenKind::Keyword(s),
                        ..
                    } => s,
                    Token {
                        kind: TokenKind::IntLiteral(n),
                        ..
                    } => n.to_string(),
                    token => return self.err("expected an option value", &token),
                };
                options.push((key, value));
                if !self.eat(&TokenKind::Comma) {
                    break;
                }
            }
            self.expect(TokenKind::RParen, ")")?;
        }
        Ok(Statement::CopyFrom {
            table,
            paths,
            options,
            by_column,
            pos: token.pos,
        })
    }

    fn parse_comment_on(&mut self) -> DbResult<Statement> {
        let token = self.bump(); // COMMENT
        self.expect_keyword("ON")?;
        self.expect_keyword("TABLE")?;
        let table = self.symbolic_name()?;
        self.expect_keyword("IS")?;
        let comment = self.string_literal()?;
        Ok(Statement::CommentOn {
            table,
            comment,
            pos: token.pos,
        })
    }

    fn parse_standalone_call(&mut self) -> DbResult<Statement> {
        let token = self.bump(); // CALL
        let option = self.symbolic_name()?;
        self.expect(TokenKind::Eq, "=")?;
        let value = self.parse_expr()?;
        Ok(Statement::StandaloneCall {
            option,
            value,
            pos: token.pos,
        })
    }

    // query parsing

    fn parse_query(&mut self) -> DbResult<Query> {
        let mut parts = Vec::new();
        loop {
            let part = self.parse_query_part()?;
            let is_return = part.is_return;
            let has_updates = !part.updatings.is_empty();
            parts.push(part);
            if is_return {
                // RETURN must conclude the query
                if !matches!(
                    self.peek().kind,
                    TokenKind::Eof | TokenKind::Semicolon | TokenKind::RParen
                ) {
                    let token = self.peek().clone();
                    return self.err("RETURN can only be used at the end of a query", &token);
                }
                break;
            }
            if parts.last().unwrap().projection.is_none() {
                // no WITH and no RETURN: this must be a terminal
                // updating part
                if !has_updates {
                    let token = self.peek().clone();
                    return self.err("query must conclude with RETURN", &token);
                }
                break;
            }
        }
        Ok(Query { parts })
    }

    fn parse_query_part(&mut self) -> DbResult<QueryPart> {
        let mut readings = Vec::new();
        let mut updatings = Vec::new();
        loop {
            let token = self.peek().clone();
            match &token.kind {
                TokenKind::Keyword(kw) => match kw.as_str() {
                    "MATCH" | "OPTIONAL" => {
                        if !updatings.is_empty() {
                            return self.err("MATCH cannot follow an updating clause", &token);
                        }
                        readings.push(self.parse_match()?);
                    }
                    "UNWIND" => {
                        self.bump();
                        let expr = self.parse_expr()?;
                        self.expect_keyword("AS")?;
                        let var = self.symbolic_name()?;
                        readings.push(ReadingClause::Unwind {
                            expr,
                            var,
                            pos: token.pos,
                        });
                    }
                    "LOAD" => {
                        self.bump();
                        self.expect_keyword("FROM")?;
                        let path = self.string_literal()?;
                        readings.push(ReadingClause::LoadFrom {
                            path,
                            pos: token.pos,
                        });
                    }
                    "CALL" => {
                        self.bump();
                        let function = self.symbolic_name()?;
                        self.expect(TokenKind::LParen, "(")?;
                        let mut args = Vec::new();
                        if self.peek().kind != TokenKind::RParen {
                            loop {
                                args.push(self.parse_expr()?);
                                if !self.eat(&TokenKind::Comma) {
                                    break;
                                }
                            }
                        }
                        self.expect(TokenKind::RParen, ")")?;
                        readings.push(ReadingClause::InQueryCall {
                            function,
                            args,
                            pos: token.pos,
                        });
                    }
                    "CREATE" => {
                        self.bump();
                        let patterns = self.parse_patterns()?;
                        updatings.push(UpdatingClause::Create {
                            patterns,
                            pos: token.pos,
                        });
                    }
                    "MERGE" => {
                        self.bump();
                        let pattern = self.parse_pattern_part()?;
                        let mut on_match = Vec::new();
                        let mut on_create = Vec::new();
                        while self.at_keyword("ON") {
                            self.bump();
                            if self.eat_keyword("MATCH") {
                                self.expect_keyword("SET")?;
                                on_match.extend(self.parse_set_items()?);
                            } else {
                                self.expect_keyword("CREATE")?;
                                self.expect_keyword("SET")?;
                                on_create.extend(self.parse_set_items()?);
                            }
                        }
                        updatings.push(UpdatingClause::Merge {
                            pattern,
                            on_match,
                            on_create,
                            pos: token.pos,
                        });
                    }
                    "SET" => {
                        self.bump();
                        let items = self.parse_set_items()?;
                        updatings.push(UpdatingClause::Set {
                            items,
                            pos: token.pos,
                        });
                    }
                    "DELETE" | "DETACH" => {
                        self.bump();
                        let detach = kw == "DETACH";
                        if detach {
                            self.expect_keyword("DELETE")?;
                        }
                        let mut exprs = vec![self.parse_expr()?];
                        while self.eat(&TokenKind::Comma) {
                            exprs.push(self.parse_expr()?);
                        }
                        updatings.push(UpdatingClause::Delete {
                            detach,
                            exprs,
                            pos: token.pos,
                        });
                    }
                    "WITH" | "RETURN" => {
                        let is_return = kw == "RETURN";
                        self.bump();
                        let mut projection = self.parse_projection_body(token.pos)?;
                        if !is_return && self.eat_keyword("WHERE") {
                            projection.where_clause = Some(self.parse_expr()?);
                        }
                        return Ok(QueryPart {
                            readings,
                            updatings,
                            projection: Some(projection),
                            is_return,
                        });
                    }
                    _ => break,
                },
                _ => break,
            }
        }
        if readings.is_empty() && updatings.is_empty() {
            let token = self.peek().clone();
            return self.err("expected a query clause", &token);
        }
        Ok(QueryPart {
            readings,
            updatings,
            projection: None,
            is_return: false,
        })
    }

    fn parse_match(&mut self) -> DbResult<ReadingClause> {
        let token = self.peek().clone();
        let optional = self.eat_keyword("OPTIONAL");
        self.expect_keyword("MATCH")?;
        let patterns = self.parse_patterns()?;
        let where_clause = if self.eat_keyword("WHERE") {
            Some(self.parse_expr()?)
        } else {
            None
        };
        Ok(ReadingClause::Match {
            optional,
            patterns,
            where_clause,
            pos: token.pos,
        })
    }

    fn parse_patterns(&mut self) -> DbResult<Vec<PatternPart>> {
        let mut patterns = vec![self.parse_pattern_part()?];
        while self.eat(&TokenKind::Comma) {
            patterns.push(self.parse_pattern_part()?);
        }
        Ok(patterns)
    }

    fn parse_pattern_part(&mut self) -> DbResult<PatternPart> {
        let first = self.parse_node_pattern()?;
        let mut chain = Vec::new();
        loop {
            match self.peek().kind {
                TokenKind::Dash | TokenKind::ArrowLeftDash => {
                    let rel = self.parse_rel_pattern()?;
                    let node = self.parse_node_pattern()?;
                    chain.push((rel, node));
                }
                _ => break,
            }
        }
        Ok(PatternPart { first, chain })
    }

    fn parse_node_pattern(&mut self) -> DbResult<NodePattern> {
        let token = self.peek().clone();
        if token.kind != TokenKind::LParen {
            // e.g. `MATCH a-[..]->(b)`
            return self.err("a node pattern must be enclosed in parentheses", &token);
        }
        self.bump();
        let pos = token.pos;
        let var = match &self.peek().kind {
            TokenKind::Ident(_) | TokenKind::EscapedIdent(_) => Some(self.symbolic_name()?),
            _ => None,
        };
        let mut labels = Vec::new();
        while self.eat(&TokenKind::Colon) {
            labels.push(self.symbolic_name()?);
        }
        let props = self.parse_property_map()?;
        self.expect(TokenKind::RParen, ")")?;
        Ok(NodePattern {
            var,
            labels,
            props,
            pos,
        })
    }

    fn parse_rel_pattern(&mut self) -> DbResult<RelPattern> {
        let token = self.bump();
        let pos = token.pos;
        let from_left = token.kind == TokenKind::ArrowLeftDash;
        let mut var = None;
        let mut labels = Vec::new();
        let mut props = Vec::new();
        let mut range = None;
        let mut quantifier = RelQuantifier::None;
        if self.eat(&TokenKind::LBracket) {
            if let TokenKind::Ident(_) | TokenKind::EscapedIdent(_) = self.peek().kind {
                var = Some(self.symbolic_name()?);
            }
            while self.eat(&TokenKind::Colon) {
                labels.push(self.symbolic_name()?);
                while self.eat(&TokenKind::Pipe) {
                    labels.push(self.symbolic_name()?);
                }
            }
            if self.eat(&TokenKind::Star) {
                if self.eat_keyword("SHORTEST") {
                    quantifier = RelQuantifier::Shortest;
                } else if self.at_keyword("ALL") && self.at_keyword_ahead(1, "SHORTEST") {
                    self.bump();
                    self.bump();
                    quantifier = RelQuantifier::AllShortest;
                }
                let lo = match self.peek().kind {
                    TokenKind::IntLiteral(n) => {
                        self.bump();
                        n as u64
                    }
                    _ => 1,
                };
                let hi = if self.eat(&TokenKind::DotDot) {
                    match self.bump() {
                        Token {
                            kind: TokenKind::IntLiteral(n),
                            ..
                        } => n as u64,
                        token => return self.err("expected an upper bound", &token),
                    }
                } else {
                    lo
                };
                range = Some((lo, hi));
            }
            props = self.parse_property_map()?;
            self.expect(TokenKind::RBracket, "]")?;
        }
        let direction = if from_left {
            // `<-[..]-`
            self.expect(TokenKind::Dash, "-")?;
            ArrowDirection::Left
        } else {
            match self.bump() {
                Token {
                    kind: TokenKind::ArrowRight,
                    ..
                } => ArrowDirection::Right,
                Token {
                    kind: TokenKind::Dash,
                    ..
                } => ArrowDirection::Undirected,
                token => return self.err("expected -> or -", &token),
            }
        };
        Ok(RelPattern {
            var,
            labels,
            props,
            direction,
            range,
            quantifier,
            pos,
        })
    }

    fn parse_property_map(&mut self) -> DbResult<Vec<(String, Expr)>> {
        let mut props = Vec::new();
        if self.eat(&TokenKind::LBrace) {
            loop {
                let key = self.symbolic_name()?;
                self.expect(TokenKind::Colon, ":")?;
                let value = self.parse_expr()?;
                props.push((key, value));
                if !self.eat(&TokenKind::Comma) {
                    break;
                }
            }
            self.expect(TokenKind::RBrace, "}")?;
        }
        Ok(props)
    }

    fn parse_set_items(&mut self) -> DbResult<Vec<(Expr, Expr)>> {
        let mut items = Vec::new();
        loop {
            let target = self.parse_expr()?;
            self.expect(TokenKind::Eq, "=")?;
            let value = self.parse_expr()?;
            items.push((target, value));
            if !self.eat(&TokenKind::Comma) {
                break;
            }
        }
        Ok(items)
    }

    fn parse_projection_body(&mut self, pos: SrcPos) -> DbResult<ProjectionBody> {
        let distinct = self.eat_keyword("DISTINCT");
        let mut items = Vec::new();
        let mut star = false;
        if self.eat(&TokenKind::Star) {
            star = true;
        } else {
            loop {
                let expr = self.parse_expr()?;
                let alias = if self.eat_keyword("AS") {
                    Some(self.symbolic_name()?)
                } else {
                    None
                };
                items.push((expr, alias));
                if !self.eat(&TokenKind::Comma) {
                    break;
                }
            }
        }
        let mut order_by = Vec::new();
        if self.at_keyword("ORDER") {
            self.bump();
            self.expect_keyword("BY")?;
            loop {
                let expr = self.parse_expr()?;
                let asc = if self.eat_keyword("DESC") || self.eat_keyword("DESCENDING") {
                    false
                } else {
                    self.eat_keyword("ASC");
                    self.eat_keyword("ASCENDING");
                    true
                };
                order_by.push((expr, asc));
                if !self.eat(&TokenKind::Comma) {
                    break;
                }
            }
        }
        let skip = if self.eat_keyword("SKIP") {
            Some(self.parse_expr()?)
        } else {
            None
        };
        let limit = if self.eat_keyword("LIMIT") {
            Some(self.parse_expr()?)
        } else {
            None
        };
        Ok(ProjectionBody {
            distinct,
            items,
            star,
            order_by,
            skip,
            limit,
            where_clause: None,
            pos,
        })
    }

    // expressions, loosest to tightest

    fn parse_expr(&mut self) -> DbResult<Expr> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> DbResult<Expr> {
        let mut left = self.parse_xor()?;
        while self.at_keyword("OR") {
            let pos = self.bump().pos;
            let right = self.parse_xor()?;
            left = Expr::Binary {
                op: BinOp::Or,
                left: Box::new(left),
                right: Box::new(right),
                pos,
            };
        }
        Ok(left)
    }

    fn parse_xor(&mut self) -> DbResult<Expr> {
        let mut left = self.parse_and()?;
        while self.at_keyword("XOR") {
            let pos = self.bump().pos;
            let right = self.parse_and()?;
            left = Expr::Binary {
                op: BinOp::Xor,
                left: Box::new(left),
                right: Box::new(right),
                pos,
            };
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> DbResult<Expr> {
        let mut left = self.parse_not()?;
        while self.at_keyword("AND") {
            let pos = self.bump().pos;
            let right = self.parse_not()?;
            left = Expr::Binary {
                op: BinOp::And,
                left: Box::new(left),
                right: Box::new(right),
                pos,
            };
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> DbResult<Expr> {
        if self.at_keyword("NOT") {
            let pos = self.bump().pos;
            let expr = self.parse_not()?;
            return Ok(Expr::Unary {
                op: UnaryOp::Not,
                expr: Box::new(expr),
                pos,
            });
        }
        self.parse_comparison()
    }

    fn comparison_op(&self) -> Option<BinOp> {
        match self.peek().kind {
            TokenKind::Eq => Some(BinOp::Eq),
            TokenKind::NotEq => Some(BinOp::Neq),
            TokenKind::Lt => Some(BinOp::Lt),
            TokenKind::Le => Some(BinOp::Le),
            TokenKind::Gt => Some(BinOp::Gt),
            TokenKind::Ge => Some(BinOp::Ge),
            _ => None,
        }
    }

    fn parse_comparison(&mut self) -> DbResult<Expr> {
        let left = self.parse_additive()?;
        if self.peek().kind == TokenKind::InvalidNotEq {
            let token = self.peek().clone();
            return self.err("!= is not a valid operator, did you mean <>?", &token);
        }
        let op = match self.comparison_op() {
            Some(op) => op,
            None => return Ok(left),
        };
        let pos = self.bump().pos;
        let right = self.parse_additive()?;
        // comparisons do not chain: `a < b < c` is rejected
        if self.comparison_op().is_some() || self.peek().kind == TokenKind::InvalidNotEq {
            let token = self.peek().clone();
            return self.err("non-binary comparisons are not supported", &token);
        }
        Ok(Expr::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
            pos,
        })
    }

    fn parse_additive(&mut self) -> DbResult<Expr> {
        let mut left = self.parse_multiplicative()?;
        loop {
            let op = match self.peek().kind {
                TokenKind::Plus => BinOp::Add,
                TokenKind::Dash => BinOp::Sub,
                _ => break,
            };
            let pos = self.bump().pos;
            let right = self.parse_multiplicative()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
                pos,
            };
        }
        Ok(left)
    }

    fn parse_multiplicative(&mut self) -> DbResult<Expr> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek().kind {
                TokenKind::Star => BinOp::Mul,
                TokenKind::Slash => BinOp::Div,
                TokenKind::Percent => BinOp::Mod,
                _ => break,
            };
            let pos = self.bump().pos;
            let right = self.parse_unary()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
                pos,
            };
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> DbResult<Expr> {
        if self.peek().kind == TokenKind::Dash {
            let pos = self.bump().pos;
            let expr = self.parse_unary()?;
            return Ok(Expr::Unary {
                op: UnaryOp::Neg,
                expr: Box::new(expr),
                pos,
            });
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> DbResult<Expr> {
        let mut expr = self.parse_atom()?;
        while self.peek().kind == TokenKind::Dot {
            let pos = self.bump().pos;
            let key = self.symbolic_name()?;
            let var = match &expr {
                Expr::Variable(name, _) => name.clone(),
                _ => {
                    return Err(DbError::parser(
                        "property access requires a variable",
                        pos.line,
                        pos.column,
                    ))
                }
            };
            expr = Expr::Property { var, key, pos };
        }
        Ok(expr)
    }

    fn parse_atom(&mut self) -> DbResult<Expr> {
        let token = self.bump();
        let pos = token.pos;
        match token.kind {
            TokenKind::IntLiteral(n) => Ok(Expr::Literal(Literal::Int(n), pos)),
            TokenKind::DoubleLiteral(d) => Ok(Expr::Literal(Literal::Double(d), pos)),
            TokenKind::StringLiteral(s) => Ok(Expr::Literal(Literal::String(s), pos)),
            TokenKind::Parameter(name) => Ok(Expr::Parameter(name, pos)),
            TokenKind::Keyword(kw) => match kw.as_str() {
                "TRUE" => Ok(Expr::Literal(Literal::Bool(true), pos)),
                "FALSE" => Ok(Expr::Literal(Literal::Bool(false), pos)),
                "NULL" => Ok(Expr::Literal(Literal::Null, pos)),
                "COUNT" => {
                    self.expect(TokenKind::LParen, "(")?;
                    if self.eat(&TokenKind::Star) {
                        self.expect(TokenKind::RParen, ")")?;
                        Ok(Expr::CountStar(pos))
                    } else {
                        let distinct = self.eat_keyword("DISTINCT");
                        let arg = self.parse_expr()?;
                        self.expect(TokenKind::RParen, ")")?;
                        Ok(Expr::FunctionCall {
                            name: "count".to_string(),
                            distinct,
                            args: vec![arg],
                            pos,
                        })
                    }
                }
                "EXISTS" => {
                    let t = Token {
                        kind: TokenKind::Keyword("EXISTS".to_string()),
                        pos,
                    };
                    self.err("EXISTS subqueries are not supported", &t)
                }
                other => {
                    let t = Token {
                        kind: TokenKind::Keyword(other.to_string()),
                        pos,
                    };
                    self.err("unexpected keyword in expression", &t)
                }
            },
            TokenKind::Ident(name) => {
                if self.peek().kind == TokenKind::LParen {
                    self.bump();
                    let distinct = self.eat_keyword("DISTINCT");
                    let mut args = Vec::new();
                    if self.peek().kind != TokenKind::RParen {
                        loop {
                            args.push(self.parse_expr()?);
                            if !self.eat(&TokenKind::Comma) {
                                break;
                            }
                        }
                    }
                    self.expect(TokenKind::RParen, ")")?;
                    Ok(Expr::FunctionCall {
                        name: name.to_lowercase(),
                        distinct,
                        args,
                        pos,
                    })
                } else {
                    Ok(Expr::Variable(name, pos))
                }
            }
            TokenKind::EscapedIdent(name) => {
                if name.is_empty() {
                    let t = Token {
                        kind: TokenKind::EscapedIdent(name),
                        pos,
                    };
                    return self.err("empty token in escaped symbolic name", &t);
                }
                Ok(Expr::Variable(name, pos))
            }
            TokenKind::LParen => {
                let expr = self.parse_expr()?;
                self.expect(TokenKind::RParen, ")")?;
                Ok(expr)
            }
            TokenKind::LBracket => {
                let mut items = Vec::new();
                if self.peek().kind != TokenKind::RBracket {
                    loop {
                        items.push(self.parse_expr()?);
                        if !self.eat(&TokenKind::Comma) {
                            break;
                        }
                    }
                }
                self.expect(TokenKind::RBracket, "]")?;
                Ok(Expr::List(items, pos))
            }
            _ => self.err("expected an expression", &token),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_ok(input: &str) -> Statement {
        parse(input).unwrap()
    }

    fn parse_err(input: &str) -> DbError {
        parse(input).unwrap_err()
    }

    #[test]
    fn parse_ddl() {
        let stmt = parse_ok(
            "CREATE NODE TABLE Person(id INT64, name STRING, PRIMARY KEY(id));",
        );
        match stmt {
            Statement::CreateNodeTable {
                name,
                properties,
                primary_key,
                ..
            } => {
                assert_eq!(name, "Person");
                assert_eq!(properties.len(), 2);
                assert_eq!(primary_key, "id");
            }
            other => panic!("unexpected statement {:?}", other),
        }

        let stmt = parse_ok("CREATE REL TABLE Knows(FROM Person TO Person, since INT64, MANY_MANY)");
        match stmt {
            Statement::CreateRelTable {
                name,
                src,
                dst,
                properties,
                multiplicity,
                ..
            } => {
                assert_eq!(name, "Knows");
                assert_eq!(src, "Person");
                assert_eq!(dst, "Person");
                assert_eq!(properties, vec![("since".to_string(), "INT64".to_string())]);
                assert_eq!(multiplicity.as_deref(), Some("MANY_MANY"));
            }
            other => panic!("unexpected statement {:?}", other),
        }
    }

    #[test]
    fn parse_copy_with_options() {
        let stmt = parse_ok("COPY Person FROM 'person.csv' (HEADER=true, DELIM='|')");
        match stmt {
            Statement::CopyFrom {
                table,
                paths,
                options,
                by_column,
                ..
            } => {
                assert_eq!(table, "Person");
                assert_eq!(paths, vec!["person.csv"]);
                assert_eq!(options.len(), 2);
                assert!(!by_column);
            }
            other => panic!("unexpected statement {:?}", other),
        }
    }

    #[test]
    fn parse_match_return() {
        let stmt = parse_ok("MATCH (a:Person)-[r:Knows]->(b) WHERE a.id < 3 RETURN b.id ORDER BY b.id SKIP 1 LIMIT 2");
        match stmt {
            Statement::Query(q) => {
                assert_eq!(q.parts.len(), 1);
                let part = &q.parts[0];
                assert_eq!(part.readings.len(), 1);
                let projection = part.projection.as_ref().unwrap();
                assert_eq!(projection.order_by.len(), 1);
                assert!(projection.skip.is_some());
                assert!(projection.limit.is_some());
            }
            other => panic!("unexpected statement {:?}", other),
        }
    }

    #[test]
    fn parse_var_length_rel() {
        let stmt = parse_ok("MATCH (a)-[*2..3]->(b) RETURN b.id");
        match stmt {
            Statement::Query(q) => match &q.parts[0].readings[0] {
                ReadingClause::Match { patterns, .. } => {
                    let (rel, _) = &patterns[0].chain[0];
                    assert_eq!(rel.range, Some((2, 3)));
                }
                other => panic!("unexpected clause {:?}", other),
            },
            other => panic!("unexpected statement {:?}", other),
        }
    }

    #[test]
    fn invalid_not_equal_is_rejected() {
        let err = parse_err("MATCH (a) WHERE a.id != 1 RETURN a.id");
        assert!(err.to_string().contains("<>"), "{}", err);
    }

    #[test]
    fn non_binary_comparison_is_rejected() {
        let err = parse_err("MATCH (a) WHERE 1 < a.id < 3 RETURN a.id");
        assert!(err.to_string().contains("non-binary"), "{}", err);
    }

    #[test]
    fn node_pattern_needs_parentheses() {
        let err = parse_err("MATCH a-[r]->(b) RETURN b.id");
        assert!(err.to_string().contains("parentheses"), "{}", err);
    }

    #[test]
    fn empty_escaped_name_is_rejected() {
        let err = parse_err("MATCH (``) RETURN 1");
        assert!(err.to_string().contains("empty token"), "{}", err);
    }

    #[test]
    fn return_must_be_last() {
        let err = parse_err("MATCH (a) RETURN a.id MATCH (b) RETURN b.id");
        assert!(err.to_string().contains("end of a query"), "{}", err);
    }

    #[test]
    fn reading_query_must_return() {
        let err = parse_err("MATCH (a)");
        assert!(err.to_string().contains("conclude with RETURN"), "{}", err);
        // updating queries may end without RETURN
        parse_ok("CREATE (a:Person {id: 1})");
    }

    #[test]
    fn parse_transactions() {
        assert!(matches!(
            parse_ok("BEGIN TRANSACTION READ ONLY"),
            Statement::BeginTransaction { read_only: true, .. }
        ));
        assert!(matches!(
            parse_ok("COMMIT SKIP CHECKPOINT"),
            Statement::Commit {
                skip_checkpoint: true,
                ..
            }
        ));
        assert!(matches!(
            parse_ok("ROLLBACK"),
            Statement::Rollback {
                skip_checkpoint: false,
                ..
            }
        ));
    }

    #[test]
    fn parse_explain_and_comment() {
        assert!(matches!(
            parse_ok("EXPLAIN MATCH (a) RETURN a.id"),
            Statement::Explain { profile: false, .. }
        ));
        assert!(matches!(
            parse_ok("COMMENT ON TABLE Person IS 'people'"),
            Statement::CommentOn { .. }
        ));
    }

    #[test]
    fn parser_error_carries_position() {
        let err = parse_err("MATCH (a) WHERE a.id != 1 RETURN a.id");
        match err {
            DbError::Parser { line, column, .. } => {
                assert_eq!(line, 1);
                assert!(column > 15);
            }
            other => panic!("unexpected error {:?}", other),
        }
    }
}
