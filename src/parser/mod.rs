use crate::ast::*;
use crate::lexer::{self, Token};

pub struct Parser {
    source: String,
    tokens: Vec<(Token, lexer::Span)>,
    pos: usize,
}

#[derive(Debug, thiserror::Error)]
#[error("parse error at offset {}: {message}", span.start)]
pub struct ParseError {
    pub code: &'static str,
    pub span: Span,
    pub message: String,
}

type Result<T> = std::result::Result<T, ParseError>;

/// Lex and parse one compilation unit.
pub fn parse(source: &str, source_name: &str) -> Result<Chunk> {
    let tokens = lexer::lex(source).map_err(|e| ParseError {
        code: "LEP-P001",
        span: Span {
            start: e.position,
            end: e.position + e.snippet.len(),
        },
        message: e.to_string(),
    })?;
    let mut parser = Parser::new(source, tokens);
    parser.parse_chunk(source_name)
}

impl Parser {
    pub fn new(source: &str, tokens: Vec<(Token, lexer::Span)>) -> Parser {
        Parser {
            source: source.to_string(),
            tokens,
            pos: 0,
        }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn peek_at(&self, offset: usize) -> Option<&Token> {
        self.tokens.get(self.pos + offset).map(|(t, _)| t)
    }

    fn peek_span(&self) -> Span {
        self.tokens
            .get(self.pos)
            .map(|(_, s)| Span {
                start: s.start,
                end: s.end,
            })
            .unwrap_or(Span {
                start: self.source.len(),
                end: self.source.len(),
            })
    }

    fn prev_span(&self) -> Span {
        self.tokens
            .get(self.pos.saturating_sub(1))
            .map(|(_, s)| Span {
                start: s.start,
                end: s.end,
            })
            .unwrap_or(Span::UNKNOWN)
    }

    fn advance(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).map(|(t, _)| t.clone());
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: &Token) -> Result<Span> {
        match self.peek() {
            Some(tok) if tok == expected => {
                let span = self.peek_span();
                self.pos += 1;
                Ok(span)
            }
            Some(tok) => Err(self.error(
                "LEP-P002",
                format!("expected {:?}, found {:?}", expected, tok),
            )),
            None => Err(self.error(
                "LEP-P003",
                format!("expected {:?}, found end of input", expected),
            )),
        }
    }

    fn expect_ident(&mut self) -> Result<String> {
        match self.peek().cloned() {
            Some(Token::Ident(name)) => {
                self.pos += 1;
                Ok(name)
            }
            Some(tok) => Err(self.error(
                "LEP-P004",
                format!("expected identifier, found {:?}", tok),
            )),
            None => Err(self.error("LEP-P005", "expected identifier, found end of input".into())),
        }
    }

    fn error(&self, code: &'static str, message: String) -> ParseError {
        ParseError {
            code,
            span: self.peek_span(),
            message,
        }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    /// Statement terminator: semicolons are optional, `}` and EOF also end
    /// a statement.
    fn eat_terminator(&mut self) {
        while self.eat(&Token::Semicolon) {}
    }

    // ---- Statements ----

    pub fn parse_chunk(&mut self, source_name: &str) -> Result<Chunk> {
        let mut body = Vec::new();
        while !self.at_end() {
            body.push(self.parse_stmt()?);
        }
        Ok(Chunk {
            body,
            source_name: source_name.to_string(),
        })
    }

    fn parse_stmt(&mut self) -> Result<Stmt> {
        let start = self.peek_span();
        match self.peek() {
            Some(Token::Semicolon) => {
                self.eat_terminator();
                Ok(Stmt::new(StmtKind::Block(Block::new(Vec::new())), start))
            }
            Some(Token::Export) => {
                // export markers are accepted and erased; the chunk has a
                // single top-level scope
                self.advance();
                self.parse_stmt()
            }
            Some(Token::Import) => Err(self.error(
                "LEP-P010",
                "import statements are not supported in embedded chunks".into(),
            )),
            Some(Token::LBrace) => {
                let block = self.parse_block()?;
                Ok(Stmt::new(StmtKind::Block(block), start.merge(self.prev_span())))
            }
            Some(Token::Var) | Some(Token::Let) | Some(Token::Const) => self.parse_var_decl(),
            Some(Token::Function) => self.parse_function_decl(),
            Some(Token::If) => self.parse_if(),
            Some(Token::While) => self.parse_while(),
            Some(Token::Do) => self.parse_do_while(),
            Some(Token::For) => self.parse_for(),
            Some(Token::Switch) => self.parse_switch(),
            Some(Token::Try) => self.parse_try(),
            Some(Token::Break) => {
                self.advance();
                self.eat_terminator();
                Ok(Stmt::new(StmtKind::Break, start))
            }
            Some(Token::Continue) => {
                self.advance();
                self.eat_terminator();
                Ok(Stmt::new(StmtKind::Continue, start))
            }
            Some(Token::Return) => {
                self.advance();
                let value = if matches!(
                    self.peek(),
                    None | Some(Token::Semicolon) | Some(Token::RBrace)
                ) {
                    None
                } else {
                    Some(self.parse_expr()?)
                };
                self.eat_terminator();
                Ok(Stmt::new(
                    StmtKind::Return(value),
                    start.merge(self.prev_span()),
                ))
            }
            Some(Token::Throw) => {
                self.advance();
                let value = self.parse_expr()?;
                self.eat_terminator();
                Ok(Stmt::new(
                    StmtKind::Throw(value),
                    start.merge(self.prev_span()),
                ))
            }
            Some(_) => {
                let expr = self.parse_expr()?;
                self.eat_terminator();
                let span = start.merge(self.prev_span());
                Ok(Stmt::new(StmtKind::Expr(expr), span))
            }
            None => Err(self.error("LEP-P006", "expected statement, found end of input".into())),
        }
    }

    fn parse_block(&mut self) -> Result<Block> {
        self.expect(&Token::LBrace)?;
        let mut body = Vec::new();
        while !matches!(self.peek(), Some(Token::RBrace) | None) {
            body.push(self.parse_stmt()?);
        }
        self.expect(&Token::RBrace)?;
        Ok(Block::new(body))
    }

    /// Any statement used as a loop/branch body is normalized into its own
    /// block so scoping stays uniform downstream.
    fn parse_body_stmt(&mut self) -> Result<Stmt> {
        let stmt = self.parse_stmt()?;
        match stmt.node {
            StmtKind::Block(_) => Ok(stmt),
            _ => {
                let span = stmt.span;
                Ok(Stmt::new(StmtKind::Block(Block::new(vec![stmt])), span))
            }
        }
    }

    fn parse_var_decl(&mut self) -> Result<Stmt> {
        let start = self.peek_span();
        let kind = match self.advance() {
            Some(Token::Var) => DeclKind::Var,
            Some(Token::Let) => DeclKind::Let,
            Some(Token::Const) => DeclKind::Const,
            _ => unreachable!(),
        };
        let mut decls = Vec::new();
        loop {
            let name = self.expect_ident()?;
            let init = if self.eat(&Token::Assign) {
                Some(self.parse_assignment()?)
            } else if kind == DeclKind::Const {
                return Err(self.error("LEP-P007", format!("const '{}' needs an initializer", name)));
            } else {
                None
            };
            decls.push(VarDeclarator { name, init });
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        self.eat_terminator();
        Ok(Stmt::new(
            StmtKind::VarDecl { kind, decls },
            start.merge(self.prev_span()),
        ))
    }

    fn parse_function_decl(&mut self) -> Result<Stmt> {
        let start = self.peek_span();
        self.expect(&Token::Function)?;
        let name = self.expect_ident()?;
        let func = self.parse_function_rest(Some(name.clone()))?;
        Ok(Stmt::new(
            StmtKind::FunctionDecl { name, func },
            start.merge(self.prev_span()),
        ))
    }

    fn parse_function_rest(&mut self, name: Option<String>) -> Result<FunctionLit> {
        self.expect(&Token::LParen)?;
        let mut params = Vec::new();
        if !matches!(self.peek(), Some(Token::RParen)) {
            loop {
                params.push(self.expect_ident()?);
                if !self.eat(&Token::Comma) {
                    break;
                }
            }
        }
        self.expect(&Token::RParen)?;
        let body = self.parse_block()?;
        Ok(FunctionLit {
            id: 0,
            name,
            params,
            body,
            captures: false,
        })
    }

    fn parse_if(&mut self) -> Result<Stmt> {
        let start = self.peek_span();
        self.expect(&Token::If)?;
        self.expect(&Token::LParen)?;
        let cond = self.parse_expr()?;
        self.expect(&Token::RParen)?;
        let then = Box::new(self.parse_body_stmt()?);
        let alt = if self.eat(&Token::Else) {
            if matches!(self.peek(), Some(Token::If)) {
                Some(Box::new(self.parse_if()?))
            } else {
                Some(Box::new(self.parse_body_stmt()?))
            }
        } else {
            None
        };
        Ok(Stmt::new(
            StmtKind::If { cond, then, alt },
            start.merge(self.prev_span()),
        ))
    }

    fn parse_while(&mut self) -> Result<Stmt> {
        let start = self.peek_span();
        self.expect(&Token::While)?;
        self.expect(&Token::LParen)?;
        let cond = self.parse_expr()?;
        self.expect(&Token::RParen)?;
        let body = Box::new(self.parse_body_stmt()?);
        Ok(Stmt::new(
            StmtKind::While { cond, body },
            start.merge(self.prev_span()),
        ))
    }

    fn parse_do_while(&mut self) -> Result<Stmt> {
        let start = self.peek_span();
        self.expect(&Token::Do)?;
        let body = Box::new(self.parse_body_stmt()?);
        self.expect(&Token::While)?;
        self.expect(&Token::LParen)?;
        let cond = self.parse_expr()?;
        self.expect(&Token::RParen)?;
        self.eat_terminator();
        Ok(Stmt::new(
            StmtKind::DoWhile { body, cond },
            start.merge(self.prev_span()),
        ))
    }

    fn parse_for(&mut self) -> Result<Stmt> {
        let start = self.peek_span();
        self.expect(&Token::For)?;
        self.expect(&Token::LParen)?;
        let init = if self.eat(&Token::Semicolon) {
            None
        } else if matches!(
            self.peek(),
            Some(Token::Var) | Some(Token::Let) | Some(Token::Const)
        ) {
            Some(Box::new(self.parse_var_decl()?))
        } else {
            let expr = self.parse_expr()?;
            let span = expr.span;
            self.expect(&Token::Semicolon)?;
            Some(Box::new(Stmt::new(StmtKind::Expr(expr), span)))
        };
        let cond = if matches!(self.peek(), Some(Token::Semicolon)) {
            None
        } else {
            Some(self.parse_expr()?)
        };
        self.expect(&Token::Semicolon)?;
        let update = if matches!(self.peek(), Some(Token::RParen)) {
            None
        } else {
            Some(self.parse_expr()?)
        };
        self.expect(&Token::RParen)?;
        let body = Box::new(self.parse_body_stmt()?);
        Ok(Stmt::new(
            StmtKind::For {
                init,
                cond,
                update,
                body,
            },
            start.merge(self.prev_span()),
        ))
    }

    fn parse_switch(&mut self) -> Result<Stmt> {
        let start = self.peek_span();
        self.expect(&Token::Switch)?;
        self.expect(&Token::LParen)?;
        let scrutinee = self.parse_expr()?;
        self.expect(&Token::RParen)?;
        self.expect(&Token::LBrace)?;
        let mut cases = Vec::new();
        while !matches!(self.peek(), Some(Token::RBrace) | None) {
            let test = if self.eat(&Token::Case) {
                let test = self.parse_expr()?;
                self.expect(&Token::Colon)?;
                Some(test)
            } else if self.eat(&Token::Default) {
                self.expect(&Token::Colon)?;
                None
            } else {
                return Err(self.error("LEP-P008", "expected 'case' or 'default'".into()));
            };
            let mut body = Vec::new();
            while !matches!(
                self.peek(),
                Some(Token::Case) | Some(Token::Default) | Some(Token::RBrace) | None
            ) {
                body.push(self.parse_stmt()?);
            }
            cases.push(SwitchCase { test, body });
        }
        self.expect(&Token::RBrace)?;
        Ok(Stmt::new(
            StmtKind::Switch { scrutinee, cases },
            start.merge(self.prev_span()),
        ))
    }

    fn parse_try(&mut self) -> Result<Stmt> {
        let start = self.peek_span();
        self.expect(&Token::Try)?;
        let body = self.parse_block()?;
        let catch = if self.eat(&Token::Catch) {
            let param = if self.eat(&Token::LParen) {
                let param = self.expect_ident()?;
                self.expect(&Token::RParen)?;
                Some(param)
            } else {
                None
            };
            Some(CatchClause {
                param,
                body: self.parse_block()?,
            })
        } else {
            None
        };
        let finally = if self.eat(&Token::Finally) {
            Some(self.parse_block()?)
        } else {
            None
        };
        if catch.is_none() && finally.is_none() {
            return Err(self.error("LEP-P009", "try without catch or finally".into()));
        }
        Ok(Stmt::new(
            StmtKind::Try {
                body,
                catch,
                finally,
            },
            start.merge(self.prev_span()),
        ))
    }

    // ---- Expressions ----
    //
    // Precedence climbing, one method per level, tightest at the bottom.

    pub fn parse_expr(&mut self) -> Result<Expr> {
        self.parse_assignment()
    }

    fn parse_assignment(&mut self) -> Result<Expr> {
        let target = self.parse_conditional()?;
        let op = match self.peek() {
            Some(Token::Assign) => None,
            Some(Token::PlusAssign) => Some(BinaryOp::Add),
            Some(Token::MinusAssign) => Some(BinaryOp::Sub),
            Some(Token::StarAssign) => Some(BinaryOp::Mul),
            Some(Token::SlashAssign) => Some(BinaryOp::Div),
            Some(Token::PercentAssign) => Some(BinaryOp::Mod),
            Some(Token::PowAssign) => Some(BinaryOp::Pow),
            _ => return Ok(target),
        };
        if !matches!(
            target.node,
            ExprKind::Ident { .. } | ExprKind::Member { .. }
        ) {
            return Err(self.error("LEP-P011", "invalid assignment target".into()));
        }
        self.advance();
        let value = self.parse_assignment()?;
        let span = target.span.merge(value.span);
        Ok(Expr::new(
            ExprKind::Assign {
                op,
                target: Box::new(target),
                value: Box::new(value),
            },
            span,
        ))
    }

    fn parse_conditional(&mut self) -> Result<Expr> {
        let cond = self.parse_nullish()?;
        if !self.eat(&Token::Question) {
            return Ok(cond);
        }
        let then = self.parse_assignment()?;
        self.expect(&Token::Colon)?;
        let alt = self.parse_assignment()?;
        let span = cond.span.merge(alt.span);
        Ok(Expr::new(
            ExprKind::Conditional {
                cond: Box::new(cond),
                then: Box::new(then),
                alt: Box::new(alt),
            },
            span,
        ))
    }

    fn binary_level(
        &mut self,
        next: fn(&mut Parser) -> Result<Expr>,
        table: &[(Token, BinaryOp)],
    ) -> Result<Expr> {
        let mut left = next(self)?;
        'outer: loop {
            for (tok, op) in table {
                if self.peek() == Some(tok) {
                    self.advance();
                    let right = next(self)?;
                    let span = left.span.merge(right.span);
                    left = Expr::new(
                        ExprKind::Binary {
                            op: *op,
                            left: Box::new(left),
                            right: Box::new(right),
                        },
                        span,
                    );
                    continue 'outer;
                }
            }
            return Ok(left);
        }
    }

    fn parse_nullish(&mut self) -> Result<Expr> {
        self.binary_level(
            Parser::parse_logical_or,
            &[(Token::NullishCoalesce, BinaryOp::Nullish)],
        )
    }

    fn parse_logical_or(&mut self) -> Result<Expr> {
        self.binary_level(Parser::parse_logical_and, &[(Token::OrOr, BinaryOp::Or)])
    }

    fn parse_logical_and(&mut self) -> Result<Expr> {
        self.binary_level(Parser::parse_bit_or, &[(Token::AndAnd, BinaryOp::And)])
    }

    fn parse_bit_or(&mut self) -> Result<Expr> {
        self.binary_level(Parser::parse_bit_xor, &[(Token::BitOr, BinaryOp::BitOr)])
    }

    fn parse_bit_xor(&mut self) -> Result<Expr> {
        self.binary_level(Parser::parse_bit_and, &[(Token::BitXor, BinaryOp::BitXor)])
    }

    fn parse_bit_and(&mut self) -> Result<Expr> {
        self.binary_level(Parser::parse_equality, &[(Token::BitAnd, BinaryOp::BitAnd)])
    }

    fn parse_equality(&mut self) -> Result<Expr> {
        self.binary_level(
            Parser::parse_relational,
            &[
                (Token::AbsEq, BinaryOp::AbsEq),
                (Token::AbsNotEq, BinaryOp::AbsNotEq),
                (Token::Eq, BinaryOp::Eq),
                (Token::NotEq, BinaryOp::NotEq),
            ],
        )
    }

    fn parse_relational(&mut self) -> Result<Expr> {
        self.binary_level(
            Parser::parse_additive,
            &[
                (Token::LessEq, BinaryOp::LessEq),
                (Token::GreaterEq, BinaryOp::GreaterEq),
                (Token::Less, BinaryOp::Less),
                (Token::Greater, BinaryOp::Greater),
            ],
        )
    }

    fn parse_additive(&mut self) -> Result<Expr> {
        self.binary_level(
            Parser::parse_multiplicative,
            &[(Token::Plus, BinaryOp::Add), (Token::Minus, BinaryOp::Sub)],
        )
    }

    fn parse_multiplicative(&mut self) -> Result<Expr> {
        self.binary_level(
            Parser::parse_pow,
            &[
                (Token::Star, BinaryOp::Mul),
                (Token::Slash, BinaryOp::Div),
                (Token::Percent, BinaryOp::Mod),
            ],
        )
    }

    fn parse_pow(&mut self) -> Result<Expr> {
        let base = self.parse_unary()?;
        if self.eat(&Token::Pow) {
            // right associative
            let exp = self.parse_pow()?;
            let span = base.span.merge(exp.span);
            Ok(Expr::new(
                ExprKind::Binary {
                    op: BinaryOp::Pow,
                    left: Box::new(base),
                    right: Box::new(exp),
                },
                span,
            ))
        } else {
            Ok(base)
        }
    }

    fn parse_unary(&mut self) -> Result<Expr> {
        let start = self.peek_span();
        let op = match self.peek() {
            Some(Token::Not) => Some(UnaryOp::Not),
            Some(Token::BitNot) => Some(UnaryOp::BitNot),
            Some(Token::Minus) => Some(UnaryOp::Neg),
            Some(Token::Plus) => Some(UnaryOp::Pos),
            Some(Token::Typeof) => Some(UnaryOp::Typeof),
            Some(Token::PlusPlus) | Some(Token::MinusMinus) => {
                let op = if self.peek() == Some(&Token::PlusPlus) {
                    UpdateOp::Inc
                } else {
                    UpdateOp::Dec
                };
                self.advance();
                let target = self.parse_unary()?;
                let span = start.merge(target.span);
                return Ok(Expr::new(
                    ExprKind::Update {
                        op,
                        prefix: true,
                        target: Box::new(target),
                    },
                    span,
                ));
            }
            _ => None,
        };
        match op {
            Some(op) => {
                self.advance();
                let operand = self.parse_unary()?;
                let span = start.merge(operand.span);
                Ok(Expr::new(
                    ExprKind::Unary {
                        op,
                        operand: Box::new(operand),
                    },
                    span,
                ))
            }
            None => self.parse_postfix(),
        }
    }

    fn parse_postfix(&mut self) -> Result<Expr> {
        let target = self.parse_call_member()?;
        match self.peek() {
            Some(Token::PlusPlus) | Some(Token::MinusMinus) => {
                let op = if self.peek() == Some(&Token::PlusPlus) {
                    UpdateOp::Inc
                } else {
                    UpdateOp::Dec
                };
                self.advance();
                let span = target.span.merge(self.prev_span());
                Ok(Expr::new(
                    ExprKind::Update {
                        op,
                        prefix: false,
                        target: Box::new(target),
                    },
                    span,
                ))
            }
            _ => Ok(target),
        }
    }

    fn parse_call_member(&mut self) -> Result<Expr> {
        let mut expr = self.parse_primary()?;
        loop {
            match self.peek() {
                Some(Token::Dot) => {
                    self.advance();
                    expr = self.member_step(expr, false)?;
                }
                Some(Token::OptionalDot) => {
                    self.advance();
                    match self.peek() {
                        Some(Token::LParen) => expr = self.call_step(expr, true)?,
                        Some(Token::LBracket) => expr = self.computed_step(expr, true)?,
                        _ => expr = self.member_step(expr, true)?,
                    }
                }
                Some(Token::LBracket) => expr = self.computed_step(expr, false)?,
                Some(Token::LParen) => expr = self.call_step(expr, false)?,
                _ => return Ok(expr),
            }
        }
    }

    fn member_step(&mut self, object: Expr, optional: bool) -> Result<Expr> {
        let name_span = self.peek_span();
        let name = self.expect_ident()?;
        let span = object.span.merge(name_span);
        Ok(Expr::new(
            ExprKind::Member {
                object: Box::new(object),
                property: Box::new(Expr::new(ExprKind::Str(name), name_span)),
                computed: false,
                optional,
            },
            span,
        ))
    }

    fn computed_step(&mut self, object: Expr, optional: bool) -> Result<Expr> {
        self.expect(&Token::LBracket)?;
        let index = self.parse_expr()?;
        self.expect(&Token::RBracket)?;
        let span = object.span.merge(self.prev_span());
        Ok(Expr::new(
            ExprKind::Member {
                object: Box::new(object),
                property: Box::new(index),
                computed: true,
                optional,
            },
            span,
        ))
    }

    fn call_step(&mut self, callee: Expr, optional: bool) -> Result<Expr> {
        self.expect(&Token::LParen)?;
        let mut args = Vec::new();
        if !matches!(self.peek(), Some(Token::RParen)) {
            loop {
                args.push(self.parse_assignment()?);
                if !self.eat(&Token::Comma) {
                    break;
                }
            }
        }
        self.expect(&Token::RParen)?;
        let span = callee.span.merge(self.prev_span());
        Ok(Expr::new(
            ExprKind::Call {
                callee: Box::new(callee),
                args,
                optional,
            },
            span,
        ))
    }

    fn parse_primary(&mut self) -> Result<Expr> {
        let span = self.peek_span();
        match self.peek().cloned() {
            Some(Token::Number(n)) => {
                self.advance();
                Ok(Expr::new(ExprKind::Number(n), span))
            }
            Some(Token::Str(s)) => {
                self.advance();
                Ok(Expr::new(ExprKind::Str(s), span))
            }
            Some(Token::True) => {
                self.advance();
                Ok(Expr::new(ExprKind::Bool(true), span))
            }
            Some(Token::False) => {
                self.advance();
                Ok(Expr::new(ExprKind::Bool(false), span))
            }
            Some(Token::Null) => {
                self.advance();
                Ok(Expr::new(ExprKind::Null, span))
            }
            Some(Token::Undefined) => {
                self.advance();
                Ok(Expr::new(ExprKind::Undefined, span))
            }
            Some(Token::Ident(name)) => {
                self.advance();
                Ok(Expr::new(ExprKind::ident(name), span))
            }
            Some(Token::Slash) | Some(Token::SlashAssign) => self.parse_regex_literal(),
            Some(Token::Function) => {
                self.advance();
                let name = match self.peek().cloned() {
                    Some(Token::Ident(name)) => {
                        self.advance();
                        Some(name)
                    }
                    _ => None,
                };
                let func = self.parse_function_rest(name)?;
                Ok(Expr::new(
                    ExprKind::Function(func),
                    span.merge(self.prev_span()),
                ))
            }
            Some(Token::LParen) => {
                self.advance();
                let inner = self.parse_expr()?;
                self.expect(&Token::RParen)?;
                Ok(inner)
            }
            Some(Token::LBracket) => {
                self.advance();
                let mut items = Vec::new();
                if !matches!(self.peek(), Some(Token::RBracket)) {
                    loop {
                        items.push(self.parse_assignment()?);
                        if !self.eat(&Token::Comma) {
                            break;
                        }
                        if matches!(self.peek(), Some(Token::RBracket)) {
                            break;
                        }
                    }
                }
                self.expect(&Token::RBracket)?;
                Ok(Expr::new(
                    ExprKind::Array(items),
                    span.merge(self.prev_span()),
                ))
            }
            Some(Token::LBrace) => {
                self.advance();
                let mut props = Vec::new();
                if !matches!(self.peek(), Some(Token::RBrace)) {
                    loop {
                        let key = self.parse_object_key()?;
                        self.expect(&Token::Colon)?;
                        let value = self.parse_assignment()?;
                        props.push((key, value));
                        if !self.eat(&Token::Comma) {
                            break;
                        }
                        if matches!(self.peek(), Some(Token::RBrace)) {
                            break;
                        }
                    }
                }
                self.expect(&Token::RBrace)?;
                Ok(Expr::new(
                    ExprKind::Object(props),
                    span.merge(self.prev_span()),
                ))
            }
            Some(tok) => Err(self.error(
                "LEP-P012",
                format!("expected expression, found {:?}", tok),
            )),
            None => Err(self.error(
                "LEP-P013",
                "expected expression, found end of input".into(),
            )),
        }
    }

    fn parse_object_key(&mut self) -> Result<String> {
        match self.peek().cloned() {
            Some(Token::Ident(name)) => {
                self.advance();
                Ok(name)
            }
            Some(Token::Str(s)) => {
                self.advance();
                Ok(s)
            }
            Some(Token::Number(n)) => {
                self.advance();
                Ok(crate::value::format_number(n))
            }
            Some(tok) => Err(self.error(
                "LEP-P014",
                format!("expected object key, found {:?}", tok),
            )),
            None => Err(self.error("LEP-P015", "expected object key, found end of input".into())),
        }
    }

    /// `/` in prefix position starts a regex literal. The lexer cannot see
    /// this, so the literal is re-scanned straight from source and the
    /// remainder of the token stream is rebuilt behind it.
    fn parse_regex_literal(&mut self) -> Result<Expr> {
        let span = self.peek_span();
        let bytes = self.source.as_bytes();
        let mut i = span.start + 1;
        let mut in_class = false;
        let pattern_start = i;
        loop {
            let Some(&b) = bytes.get(i) else {
                return Err(ParseError {
                    code: "LEP-P016",
                    span,
                    message: "unterminated regex literal".into(),
                });
            };
            match b {
                b'\\' => i += 1,
                b'[' => in_class = true,
                b']' => in_class = false,
                b'/' if !in_class => break,
                b'\n' => {
                    return Err(ParseError {
                        code: "LEP-P016",
                        span,
                        message: "unterminated regex literal".into(),
                    });
                }
                _ => {}
            }
            i += 1;
        }
        let pattern = self.source[pattern_start..i].to_string();
        i += 1;
        let flags_start = i;
        while bytes.get(i).is_some_and(|b| b.is_ascii_alphabetic()) {
            i += 1;
        }
        let flags = self.source[flags_start..i].to_string();

        // re-lex everything after the literal and splice it in
        let rest = lexer::lex(&self.source[i..]).map_err(|e| ParseError {
            code: "LEP-P001",
            span: Span {
                start: i + e.position,
                end: i + e.position + e.snippet.len(),
            },
            message: e.to_string(),
        })?;
        self.tokens.truncate(self.pos);
        self.tokens
            .extend(rest.into_iter().map(|(t, s)| (t, s.start + i..s.end + i)));
        Ok(Expr::new(
            ExprKind::Regex { pattern, flags },
            Span {
                start: span.start,
                end: i,
            },
        ))
    }
}
