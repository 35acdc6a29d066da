//! The parser.
//!
//! A standard recursive-descent/precedence-climbing parser: the binary
//! operator levels (`assign` down to `multiplicative`) are parsed left-
//! associatively by precedence-climbing loops, and `unary`/`postfix`/`primary`
//! recurse directly, mirroring the grammar in `SPEC_FULL.md` §4.0.

use std::fmt::Debug;

use derive_more::derive::Display;

use crate::common::{Id, NodeId, NodeIdGen};

use super::ast::*;
use super::lex::{LexError, Lexer, Token, TokenKind};

#[derive(Display)]
#[display("{_0}")]
pub struct ParseError(String);

impl std::error::Error for ParseError {}

impl Debug for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self}")
    }
}

impl From<LexError> for ParseError {
    fn from(e: LexError) -> Self {
        ParseError(e.to_string())
    }
}

pub fn parse(input: &str) -> Result<Program, ParseError> {
    let mut lexer = Lexer::new(input);
    let mut tokens = Vec::new();
    while let Some(tok) = lexer.next()? {
        tokens.push(tok);
    }
    Parser {
        tokens,
        pos: 0,
        ids: NodeIdGen::default(),
    }
    .parse_program()
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    ids: NodeIdGen,
}

impl Parser {
    fn peek(&self) -> Option<&TokenKind> {
        self.tokens.get(self.pos).map(|t| &t.kind)
    }

    fn line(&self) -> usize {
        self.tokens
            .get(self.pos)
            .or_else(|| self.tokens.last())
            .map(|t| t.line)
            .unwrap_or(0)
    }

    fn bump(&mut self) -> Option<TokenKind> {
        let kind = self.tokens.get(self.pos).map(|t| t.kind.clone());
        self.pos += 1;
        kind
    }

    fn err(&self, msg: impl Into<String>) -> ParseError {
        ParseError(format!("line {}: {}", self.line(), msg.into()))
    }

    fn expect(&mut self, want: &TokenKind) -> Result<(), ParseError> {
        match self.peek() {
            Some(k) if k == want => {
                self.bump();
                Ok(())
            }
            Some(k) => Err(self.err(format!("expected {want}, found {k}"))),
            None => Err(self.err(format!("expected {want}, found end of input"))),
        }
    }

    fn eat(&mut self, want: &TokenKind) -> bool {
        if self.peek() == Some(want) {
            self.bump();
            true
        } else {
            false
        }
    }

    fn expect_ident(&mut self) -> Result<Id, ParseError> {
        match self.bump() {
            Some(TokenKind::Ident(id)) => Ok(id),
            Some(other) => Err(self.err(format!("expected identifier, found {other}"))),
            None => Err(self.err("expected identifier, found end of input")),
        }
    }

    fn fresh_expr_at(&mut self, line: usize, kind: ExprKind) -> Expr {
        Expr {
            id: self.ids.fresh(),
            line,
            kind,
        }
    }

    fn fresh_expr(&mut self, kind: ExprKind) -> Expr {
        let line = self.line();
        self.fresh_expr_at(line, kind)
    }

    fn stmt(&self, line: usize, kind: StmtKind) -> Stmt {
        Stmt { line, kind }
    }

    fn looks_like_type(&self) -> bool {
        matches!(self.peek(), Some(TokenKind::Int) | Some(TokenKind::Char) | Some(TokenKind::Void))
    }

    // ---------------------------------------------------------------
    // Declarations
    // ---------------------------------------------------------------

    fn parse_program(&mut self) -> Result<Program, ParseError> {
        let mut decls = Vec::new();
        while self.peek().is_some() {
            decls.push(self.parse_top_decl()?);
        }
        Ok(Program { decls })
    }

    fn parse_type(&mut self) -> Result<Type, ParseError> {
        let mut ty = match self.bump() {
            Some(TokenKind::Int) => Type::Int,
            Some(TokenKind::Char) => Type::Char,
            Some(TokenKind::Void) => Type::Void,
            Some(other) => return Err(self.err(format!("expected a type, found {other}"))),
            None => return Err(self.err("expected a type, found end of input")),
        };
        while self.eat(&TokenKind::Star) {
            ty = Type::Pointer(Box::new(ty));
        }
        Ok(ty)
    }

    fn parse_params(&mut self) -> Result<(Vec<Param>, bool), ParseError> {
        self.expect(&TokenKind::LParen)?;
        let mut params = Vec::new();
        let mut variadic = false;
        if !self.eat(&TokenKind::RParen) {
            loop {
                if self.eat(&TokenKind::Ellipsis) {
                    variadic = true;
                    break;
                }
                let ty = self.parse_type()?;
                let name = self.expect_ident()?;
                params.push(Param { ty, name });
                if !self.eat(&TokenKind::Comma) {
                    break;
                }
            }
            self.expect(&TokenKind::RParen)?;
        }
        Ok((params, variadic))
    }

    fn parse_top_decl(&mut self) -> Result<TopDecl, ParseError> {
        let line = self.line();
        let ty = self.parse_type()?;
        let name = self.expect_ident()?;

        if matches!(self.peek(), Some(TokenKind::LParen)) {
            let (params, variadic) = self.parse_params()?;
            if self.eat(&TokenKind::Semi) {
                return Ok(TopDecl::Prototype { line, ret: ty, name, params, variadic });
            }
            let body = self.parse_block()?;
            return Ok(TopDecl::Function { line, ret: ty, name, params, body });
        }

        let init = if self.eat(&TokenKind::Assign) {
            Some(self.parse_expr()?)
        } else {
            None
        };
        self.expect(&TokenKind::Semi)?;
        Ok(TopDecl::Global { line, ty, name, init })
    }

    // ---------------------------------------------------------------
    // Statements
    // ---------------------------------------------------------------

    fn parse_block(&mut self) -> Result<Block, ParseError> {
        self.expect(&TokenKind::LBrace)?;
        let mut stmts = Vec::new();
        while !matches!(self.peek(), Some(TokenKind::RBrace)) {
            stmts.push(self.parse_stmt()?);
        }
        self.expect(&TokenKind::RBrace)?;
        Ok(stmts)
    }

    fn parse_stmt(&mut self) -> Result<Stmt, ParseError> {
        let line = self.line();
        match self.peek() {
            Some(TokenKind::LBrace) => {
                let block = self.parse_block()?;
                Ok(self.stmt(line, StmtKind::Block(block)))
            }
            Some(TokenKind::If) => self.parse_if(line),
            Some(TokenKind::While) => self.parse_while(line),
            Some(TokenKind::For) => self.parse_for(line),
            Some(TokenKind::Break) => {
                self.bump();
                self.expect(&TokenKind::Semi)?;
                Ok(self.stmt(line, StmtKind::Break))
            }
            Some(TokenKind::Return) => {
                self.bump();
                let value = if self.eat(&TokenKind::Semi) {
                    None
                } else {
                    let e = self.parse_expr()?;
                    self.expect(&TokenKind::Semi)?;
                    Some(e)
                };
                Ok(self.stmt(line, StmtKind::Return(value)))
            }
            _ if self.looks_like_type() => {
                let ty = self.parse_type()?;
                let name = self.expect_ident()?;
                let init = if self.eat(&TokenKind::Assign) {
                    Some(self.parse_expr()?)
                } else {
                    None
                };
                self.expect(&TokenKind::Semi)?;
                Ok(self.stmt(line, StmtKind::Decl { ty, name, init }))
            }
            _ => {
                let e = self.parse_expr()?;
                self.expect(&TokenKind::Semi)?;
                Ok(self.stmt(line, StmtKind::Simple(e)))
            }
        }
    }

    fn parse_if(&mut self, line: usize) -> Result<Stmt, ParseError> {
        self.expect(&TokenKind::If)?;
        self.expect(&TokenKind::LParen)?;
        let cond = self.parse_expr()?;
        self.expect(&TokenKind::RParen)?;
        let then_branch = self.parse_braced_or_single()?;
        let else_branch = if self.eat(&TokenKind::Else) {
            Some(self.parse_braced_or_single()?)
        } else {
            None
        };
        Ok(self.stmt(line, StmtKind::If { cond, then_branch, else_branch }))
    }

    fn parse_while(&mut self, line: usize) -> Result<Stmt, ParseError> {
        self.expect(&TokenKind::While)?;
        self.expect(&TokenKind::LParen)?;
        let cond = self.parse_expr()?;
        self.expect(&TokenKind::RParen)?;
        let body = self.parse_braced_or_single()?;
        Ok(self.stmt(line, StmtKind::While { cond, body }))
    }

    fn parse_for(&mut self, line: usize) -> Result<Stmt, ParseError> {
        self.expect(&TokenKind::For)?;
        self.expect(&TokenKind::LParen)?;
        let init = if matches!(self.peek(), Some(TokenKind::Semi)) {
            None
        } else {
            Some(self.parse_expr()?)
        };
        self.expect(&TokenKind::Semi)?;
        let cond = if matches!(self.peek(), Some(TokenKind::Semi)) {
            None
        } else {
            Some(self.parse_expr()?)
        };
        self.expect(&TokenKind::Semi)?;
        let incr = if matches!(self.peek(), Some(TokenKind::RParen)) {
            None
        } else {
            Some(self.parse_expr()?)
        };
        self.expect(&TokenKind::RParen)?;
        let body = self.parse_braced_or_single()?;
        Ok(self.stmt(line, StmtKind::For { init, cond, incr, body }))
    }

    /// A block or a single statement, normalized to a `Block` (a single
    /// statement is equivalent to a block containing just that statement).
    fn parse_braced_or_single(&mut self) -> Result<Block, ParseError> {
        if matches!(self.peek(), Some(TokenKind::LBrace)) {
            self.parse_block()
        } else {
            Ok(vec![self.parse_stmt()?])
        }
    }

    // ---------------------------------------------------------------
    // Expressions
    // ---------------------------------------------------------------

    fn parse_expr(&mut self) -> Result<Expr, ParseError> {
        self.parse_assign()
    }

    fn parse_assign(&mut self) -> Result<Expr, ParseError> {
        let lhs = self.parse_logic_or()?;
        if self.eat(&TokenKind::Assign) {
            let rhs = self.parse_assign()?;
            return Ok(self.fresh_expr(ExprKind::Assign { lhs: Box::new(lhs), rhs: Box::new(rhs) }));
        }
        Ok(lhs)
    }

    fn parse_logic_or(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_logic_and()?;
        while self.eat(&TokenKind::OrOr) {
            let right = self.parse_logic_and()?;
            left = self.fresh_expr(ExprKind::Logical { op: LogicOp::Or, left: Box::new(left), right: Box::new(right) });
        }
        Ok(left)
    }

    fn parse_logic_and(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_equality()?;
        while self.eat(&TokenKind::AndAnd) {
            let right = self.parse_equality()?;
            left = self.fresh_expr(ExprKind::Logical { op: LogicOp::And, left: Box::new(left), right: Box::new(right) });
        }
        Ok(left)
    }

    fn parse_equality(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_relational()?;
        loop {
            let op = match self.peek() {
                Some(TokenKind::EqEq) => BinOp::Eq,
                Some(TokenKind::Ne) => BinOp::Ne,
                _ => break,
            };
            self.bump();
            let right = self.parse_relational()?;
            left = self.fresh_expr(ExprKind::Binary { op, left: Box::new(left), right: Box::new(right) });
        }
        Ok(left)
    }

    fn parse_relational(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_additive()?;
        loop {
            let op = match self.peek() {
                Some(TokenKind::Lt) => BinOp::Lt,
                Some(TokenKind::Gt) => BinOp::Gt,
                Some(TokenKind::Le) => BinOp::Le,
                Some(TokenKind::Ge) => BinOp::Ge,
                _ => break,
            };
            self.bump();
            let right = self.parse_additive()?;
            left = self.fresh_expr(ExprKind::Binary { op, left: Box::new(left), right: Box::new(right) });
        }
        Ok(left)
    }

    fn parse_additive(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_multiplicative()?;
        loop {
            let op = match self.peek() {
                Some(TokenKind::Plus) => BinOp::Add,
                Some(TokenKind::Minus) => BinOp::Sub,
                _ => break,
            };
            self.bump();
            let right = self.parse_multiplicative()?;
            left = self.fresh_expr(ExprKind::Binary { op, left: Box::new(left), right: Box::new(right) });
        }
        Ok(left)
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some(TokenKind::Star) => BinOp::Mul,
                Some(TokenKind::Slash) => BinOp::Div,
                Some(TokenKind::Percent) => BinOp::Rem,
                _ => break,
            };
            self.bump();
            let right = self.parse_unary()?;
            left = self.fresh_expr(ExprKind::Binary { op, left: Box::new(left), right: Box::new(right) });
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, ParseError> {
        let op = match self.peek() {
            Some(TokenKind::Minus) => Some(UnOp::Neg),
            Some(TokenKind::Not) => Some(UnOp::Not),
            Some(TokenKind::Amp) => Some(UnOp::AddrOf),
            Some(TokenKind::Star) => Some(UnOp::Deref),
            _ => None,
        };
        if let Some(op) = op {
            self.bump();
            let expr = self.parse_unary()?;
            return Ok(self.fresh_expr(ExprKind::Unary { op, expr: Box::new(expr) }));
        }

        // A cast is a parenthesized type immediately followed by a unary
        // expression: `(int) x`. Disambiguated by looking inside the parens.
        if matches!(self.peek(), Some(TokenKind::LParen))
            && matches!(self.tokens.get(self.pos + 1).map(|t| &t.kind),
                Some(TokenKind::Int) | Some(TokenKind::Char))
        {
            self.bump();
            let ty = self.parse_type()?;
            self.expect(&TokenKind::RParen)?;
            let expr = self.parse_unary()?;
            return Ok(self.fresh_expr(ExprKind::Cast { ty, expr: Box::new(expr) }));
        }

        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> Result<Expr, ParseError> {
        let primary = self.parse_primary()?;
        if self.eat(&TokenKind::LParen) {
            let callee = match primary.kind {
                ExprKind::Ident(id) => id,
                _ => return Err(self.err("only a plain identifier can be called")),
            };
            let mut args = Vec::new();
            if !self.eat(&TokenKind::RParen) {
                loop {
                    args.push(self.parse_expr()?);
                    if !self.eat(&TokenKind::Comma) {
                        break;
                    }
                }
                self.expect(&TokenKind::RParen)?;
            }
            return Ok(self.fresh_expr(ExprKind::Call { callee, args }));
        }
        Ok(primary)
    }

    fn parse_primary(&mut self) -> Result<Expr, ParseError> {
        match self.bump() {
            Some(TokenKind::Number(n)) => Ok(self.fresh_expr(ExprKind::Number(n))),
            Some(TokenKind::CharLit(c)) => Ok(self.fresh_expr(ExprKind::Number(c))),
            Some(TokenKind::Str(bytes)) => Ok(self.fresh_expr(ExprKind::Str(bytes))),
            Some(TokenKind::Ident(id)) => Ok(self.fresh_expr(ExprKind::Ident(id))),
            Some(TokenKind::LParen) => {
                let e = self.parse_expr()?;
                self.expect(&TokenKind::RParen)?;
                Ok(e)
            }
            Some(other) => Err(self.err(format!("expected an expression, found {other}"))),
            None => Err(self.err("expected an expression, found end of input")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_arithmetic_precedence() {
        let prog = parse("int main() { return 1 + 2 * 3; }").unwrap();
        assert_eq!(prog.decls.len(), 1);
    }

    #[test]
    fn parses_pointer_types_and_deref() {
        let prog = parse("int main() { int x; int *p; p = &x; *p = *p + 1; return x; }").unwrap();
        let TopDecl::Function { body, .. } = &prog.decls[0] else { panic!() };
        assert_eq!(body.len(), 5);
    }

    #[test]
    fn parses_variadic_prototype() {
        let prog = parse(r#"int printf(char *fmt, ...); int main() { printf("hi"); return 0; }"#).unwrap();
        let TopDecl::Prototype { variadic, .. } = &prog.decls[0] else { panic!() };
        assert!(*variadic);
    }

    #[test]
    fn rejects_malformed_input() {
        assert!(parse("int main( { }").is_err());
    }

    #[test]
    fn for_loop_with_optional_clauses() {
        let prog = parse("int main() { int i; for (i = 0; i < 10; i = i + 1) { if (i == 5) break; } return i; }").unwrap();
        let TopDecl::Function { body, .. } = &prog.decls[0] else { panic!() };
        assert!(matches!(body[1].kind, StmtKind::For { .. }));
    }
}
