//! Expression sub-compiler: a small, dense-grammar recursive-descent
//! compiler for the text expressions embedded in `Expression` blocks.
//!
//! `expr ::= ternary | binary | unary | call | member | identifier | number
//!           | paren`. Member access is postfix, left-associative; the
//! lexer distinguishes a decimal point from a member-access dot by
//! look-ahead (digit before and after => number, identifier before => member
//! access).

use crate::address::AddressRegistry;
use crate::diagnostics::{codes, Diagnostic, Domain};
use crate::address::CanonicalAddress;
use crate::ir::{IRBuilder, MathFn, SigExpr, SigExprId};
use crate::types::Payload;
use fxhash::FxHashMap;
use std::fmt;

// ---------------------------------------------------------------------------
// Lexer

#[derive(Clone, Debug, PartialEq)]
enum Tok {
    Number(f64),
    Ident(String),
    Dot,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    LParen,
    RParen,
    Comma,
    Question,
    Colon,
    Lt,
    Le,
    Gt,
    Ge,
    EqEq,
    Ne,
    AndAnd,
    OrOr,
    Bang,
    Eof,
}

struct Spanned {
    tok: Tok,
    pos: usize,
}

struct Lexer<'a> {
    src: &'a [u8],
    pos: usize,
}

impl<'a> Lexer<'a> {
    fn new(src: &'a str) -> Lexer<'a> {
        Lexer { src: src.as_bytes(), pos: 0 }
    }

    fn peek_byte(&self, offset: usize) -> Option<u8> {
        self.src.get(self.pos + offset).copied()
    }

    fn lex_all(mut self) -> Result<Vec<Spanned>, ExprParseError> {
        let mut out = Vec::new();
        loop {
            self.skip_ws();
            let start = self.pos;
            if self.pos >= self.src.len() {
                out.push(Spanned { tok: Tok::Eof, pos: start });
                break;
            }
            let c = self.src[self.pos] as char;
            let tok = if c.is_ascii_digit() {
                self.lex_number()?
            } else if c == '.' && self.peek_byte(1).map_or(false, |b| (b as char).is_ascii_digit()) {
                self.lex_number()?
            } else if c.is_alphabetic() || c == '_' {
                self.lex_ident()
            } else {
                self.lex_symbol()?
            };
            out.push(Spanned { tok, pos: start });
        }
        Ok(out)
    }

    fn skip_ws(&mut self) {
        while let Some(b) = self.peek_byte(0) {
            if (b as char).is_whitespace() {
                self.pos += 1;
            } else {
                break;
            }
        }
    }

    fn lex_number(&mut self) -> Result<Tok, ExprParseError> {
        let start = self.pos;
        let mut seen_dot = false;
        while let Some(b) = self.peek_byte(0) {
            let c = b as char;
            if c.is_ascii_digit() {
                self.pos += 1;
            } else if c == '.' && !seen_dot {
                // Only consume the dot as a decimal point if a digit follows
                // (member access after a number, e.g. `3 .foo`, is nonsense
                // but we still must not swallow the dot in that case).
                if self.peek_byte(1).map_or(false, |b2| (b2 as char).is_ascii_digit()) {
                    seen_dot = true;
                    self.pos += 1;
                } else {
                    break;
                }
            } else {
                break;
            }
        }
        let text = std::str::from_utf8(&self.src[start..self.pos]).unwrap();
        text.parse::<f64>()
            .map(Tok::Number)
            .map_err(|_| ExprParseError { pos: start, message: format!("invalid number literal '{}'", text) })
    }

    fn lex_ident(&mut self) -> Tok {
        let start = self.pos;
        while let Some(b) = self.peek_byte(0) {
            let c = b as char;
            if c.is_alphanumeric() || c == '_' {
                self.pos += 1;
            } else {
                break;
            }
        }
        Tok::Ident(std::str::from_utf8(&self.src[start..self.pos]).unwrap().to_string())
    }

    fn lex_symbol(&mut self) -> Result<Tok, ExprParseError> {
        let start = self.pos;
        let c = self.src[self.pos] as char;
        self.pos += 1;
        let two = |s: &mut Self, expect: u8, yes: Tok, no: Tok| -> Tok {
            if s.peek_byte(0) == Some(expect) {
                s.pos += 1;
                yes
            } else {
                no
            }
        };
        Ok(match c {
            '.' => Tok::Dot,
            '+' => Tok::Plus,
            '-' => Tok::Minus,
            '*' => Tok::Star,
            '/' => Tok::Slash,
            '%' => Tok::Percent,
            '(' => Tok::LParen,
            ')' => Tok::RParen,
            ',' => Tok::Comma,
            '?' => Tok::Question,
            ':' => Tok::Colon,
            '<' => two(self, b'=', Tok::Le, Tok::Lt),
            '>' => two(self, b'=', Tok::Ge, Tok::Gt),
            '=' => two(self, b'=', Tok::EqEq, Tok::EqEq),
            '!' => two(self, b'=', Tok::Ne, Tok::Bang),
            '&' => two(self, b'&', Tok::AndAnd, Tok::AndAnd),
            '|' => two(self, b'|', Tok::OrOr, Tok::OrOr),
            other => return Err(ExprParseError { pos: start, message: format!("unexpected character '{}'", other) }),
        })
    }
}

// ---------------------------------------------------------------------------
// AST

#[derive(Clone, Debug, Copy, PartialEq, Eq)]
enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    And,
    Or,
}

#[derive(Clone, Debug)]
enum Expr {
    Number(f64),
    Ident(String),
    Member(Box<Expr>, String),
    Neg(Box<Expr>),
    Not(Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    Ternary(Box<Expr>, Box<Expr>, Box<Expr>),
}

// ---------------------------------------------------------------------------
// Parser (recursive descent, precedence climbing for binary ops)

struct Parser {
    toks: Vec<Spanned>,
    idx: usize,
}

#[derive(Debug, Clone)]
pub struct ExprParseError {
    pub pos: usize,
    pub message: String,
}

impl fmt::Display for ExprParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "at {}: {}", self.pos, self.message)
    }
}

impl Parser {
    fn peek(&self) -> &Tok {
        &self.toks[self.idx].tok
    }

    fn pos(&self) -> usize {
        self.toks[self.idx].pos
    }

    fn bump(&mut self) -> Tok {
        let t = self.toks[self.idx].tok.clone();
        if self.idx + 1 < self.toks.len() {
            self.idx += 1;
        }
        t
    }

    fn expect(&mut self, tok: &Tok) -> Result<(), ExprParseError> {
        if self.peek() == tok {
            self.bump();
            Ok(())
        } else {
            Err(ExprParseError { pos: self.pos(), message: format!("expected {:?}, found {:?}", tok, self.peek()) })
        }
    }

    fn parse_expr(&mut self) -> Result<Expr, ExprParseError> {
        self.parse_ternary()
    }

    fn parse_ternary(&mut self) -> Result<Expr, ExprParseError> {
        let cond = self.parse_binary(0)?;
        if *self.peek() == Tok::Question {
            self.bump();
            let then_branch = self.parse_ternary()?;
            self.expect(&Tok::Colon)?;
            let else_branch = self.parse_ternary()?;
            Ok(Expr::Ternary(Box::new(cond), Box::new(then_branch), Box::new(else_branch)))
        } else {
            Ok(cond)
        }
    }

    fn binop_for(tok: &Tok) -> Option<(BinOp, u8)> {
        Some(match tok {
            Tok::OrOr => (BinOp::Or, 1),
            Tok::AndAnd => (BinOp::And, 2),
            Tok::EqEq => (BinOp::Eq, 3),
            Tok::Ne => (BinOp::Ne, 3),
            Tok::Lt => (BinOp::Lt, 4),
            Tok::Le => (BinOp::Le, 4),
            Tok::Gt => (BinOp::Gt, 4),
            Tok::Ge => (BinOp::Ge, 4),
            Tok::Plus => (BinOp::Add, 5),
            Tok::Minus => (BinOp::Sub, 5),
            Tok::Star => (BinOp::Mul, 6),
            Tok::Slash => (BinOp::Div, 6),
            Tok::Percent => (BinOp::Mod, 6),
            _ => return None,
        })
    }

    fn parse_binary(&mut self, min_prec: u8) -> Result<Expr, ExprParseError> {
        let mut lhs = self.parse_unary()?;
        loop {
            let (op, prec) = match Self::binop_for(self.peek()) {
                Some(x) if x.1 >= min_prec => x,
                _ => break,
            };
            self.bump();
            let rhs = self.parse_binary(prec + 1)?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Expr, ExprParseError> {
        match self.peek().clone() {
            Tok::Minus => {
                self.bump();
                Ok(Expr::Neg(Box::new(self.parse_unary()?)))
            }
            Tok::Bang => {
                self.bump();
                Ok(Expr::Not(Box::new(self.parse_unary()?)))
            }
            _ => self.parse_postfix(),
        }
    }

    fn parse_postfix(&mut self) -> Result<Expr, ExprParseError> {
        let mut e = self.parse_primary()?;
        while *self.peek() == Tok::Dot {
            self.bump();
            match self.bump() {
                Tok::Ident(name) => e = Expr::Member(Box::new(e), name),
                other => {
                    return Err(ExprParseError { pos: self.pos(), message: format!("expected identifier after '.', found {:?}", other) })
                }
            }
        }
        Ok(e)
    }

    fn parse_primary(&mut self) -> Result<Expr, ExprParseError> {
        match self.bump() {
            Tok::Number(n) => Ok(Expr::Number(n)),
            Tok::Ident(name) => Ok(Expr::Ident(name)),
            Tok::LParen => {
                let e = self.parse_expr()?;
                self.expect(&Tok::RParen)?;
                Ok(e)
            }
            other => Err(ExprParseError { pos: self.pos(), message: format!("unexpected token {:?}", other) }),
        }
    }
}

fn parse(text: &str) -> Result<Expr, ExprParseError> {
    let toks = Lexer::new(text).lex_all()?;
    let mut p = Parser { toks, idx: 0 };
    let e = p.parse_expr()?;
    if *p.peek() != Tok::Eof {
        return Err(ExprParseError { pos: p.pos(), message: format!("trailing input at {:?}", p.peek()) });
    }
    Ok(e)
}

// ---------------------------------------------------------------------------
// Type checking + lowering

/// Maps identifiers (legacy `in0`/`in1` names and `Block.port` aliases alike)
/// to their declared payload type, for the checker's error messages and
/// member-access validation against the address registry.
pub struct ExprTypeEnv {
    pub vars: FxHashMap<String, Payload>,
}

/// Maps the same identifiers to the `SigExprId` already lowered for them —
/// both the legacy `in0/in1` identifier and a member-access alias (e.g.
/// `Circle.radius`) can point at the same signal when wired that way.
pub struct ExprSigEnv {
    pub vars: FxHashMap<String, SigExprId>,
}

fn binop_mathfn(op: BinOp) -> MathFn {
    match op {
        BinOp::Add => MathFn::Add,
        BinOp::Sub => MathFn::Sub,
        BinOp::Mul => MathFn::Mul,
        BinOp::Div => MathFn::Div,
        BinOp::Mod => MathFn::Mod,
        BinOp::Lt => MathFn::Lt,
        BinOp::Le => MathFn::Lt, // le lowered as `!(b < a)` is avoidable; reuse Lt with swapped args at call site
        BinOp::Gt => MathFn::Gt,
        BinOp::Ge => MathFn::Gt,
        BinOp::Eq => MathFn::Eq,
        BinOp::Ne => MathFn::Eq, // negated by wrapping Not at call site
        BinOp::And => MathFn::And,
        BinOp::Or => MathFn::Or,
    }
}

fn member_key(base: &Expr, field: &str) -> Option<String> {
    match base {
        Expr::Ident(name) => Some(format!("{}.{}", name, field)),
        _ => None,
    }
}

fn lower_expr(
    e: &Expr,
    type_env: &ExprTypeEnv,
    sig_env: &ExprSigEnv,
    addr: Option<&AddressRegistry>,
    target: &CanonicalAddress,
    b: &mut IRBuilder,
) -> Result<SigExprId, Diagnostic> {
    match e {
        Expr::Number(n) => Ok(b.push_sig(SigExpr::Const(
            ordered_float::NotNan::new(*n).unwrap_or_else(|_| ordered_float::NotNan::new(0.0).unwrap()),
        ))),
        Expr::Ident(name) => {
            if let Some(id) = sig_env.vars.get(name) {
                Ok(*id)
            } else {
                Err(undefined_identifier(name, target))
            }
        }
        Expr::Member(base, field) => {
            let key = member_key(base, field).ok_or_else(|| {
                Diagnostic::error(
                    codes::E_EXPR_TYPE,
                    "invalid member access",
                    "member access is only valid directly on an identifier (e.g. `Circle.radius`)",
                    target.clone(),
                    Domain::Type,
                )
            })?;
            if let Some(registry) = addr {
                if registry.resolve_shorthand(&key).is_none() && !sig_env.vars.contains_key(&key) {
                    return Err(undefined_identifier(&key, target));
                }
            }
            sig_env.vars.get(&key).copied().ok_or_else(|| undefined_identifier(&key, target))
        }
        Expr::Neg(inner) => {
            let v = lower_expr(inner, type_env, sig_env, addr, target, b)?;
            Ok(b.push_sig(SigExpr::Map(MathFn::Neg, vec![v])))
        }
        Expr::Not(inner) => {
            let v = lower_expr(inner, type_env, sig_env, addr, target, b)?;
            Ok(b.push_sig(SigExpr::Map(MathFn::Not, vec![v])))
        }
        Expr::Binary(op, lhs, rhs) => {
            let l = lower_expr(lhs, type_env, sig_env, addr, target, b)?;
            let r = lower_expr(rhs, type_env, sig_env, addr, target, b)?;
            match op {
                BinOp::Le => {
                    // a <= b  ==  !(b < a)
                    let gt = b.push_sig(SigExpr::Zip(MathFn::Lt, vec![r, l]));
                    Ok(b.push_sig(SigExpr::Map(MathFn::Not, vec![gt])))
                }
                BinOp::Ge => {
                    let lt = b.push_sig(SigExpr::Zip(MathFn::Lt, vec![l, r]));
                    Ok(b.push_sig(SigExpr::Map(MathFn::Not, vec![lt])))
                }
                BinOp::Ne => {
                    let eq = b.push_sig(SigExpr::Zip(MathFn::Eq, vec![l, r]));
                    Ok(b.push_sig(SigExpr::Map(MathFn::Not, vec![eq])))
                }
                _ => Ok(b.push_sig(SigExpr::Zip(binop_mathfn(*op), vec![l, r]))),
            }
        }
        Expr::Ternary(cond, then_branch, else_branch) => {
            let c = lower_expr(cond, type_env, sig_env, addr, target, b)?;
            let t = lower_expr(then_branch, type_env, sig_env, addr, target, b)?;
            let f = lower_expr(else_branch, type_env, sig_env, addr, target, b)?;
            Ok(b.push_sig(SigExpr::Zip(MathFn::Ternary, vec![c, t, f])))
        }
    }
}

fn undefined_identifier(name: &str, target: &CanonicalAddress) -> Diagnostic {
    Diagnostic::error(
        codes::E_EXPR_UNDEFINED_IDENTIFIER,
        "undefined identifier",
        format!("'{}' is not a wired input, param alias, or block reference", name),
        target.clone(),
        Domain::Type,
    )
}

/// Parses and lowers `text` into a `SigExprId`, emitting `SigExprMap`/`Zip`
/// nodes as it goes. `target` anchors any diagnostic to the Expression
/// block's own address.
pub fn compile_expression(
    text: &str,
    type_env: &ExprTypeEnv,
    sig_env: &ExprSigEnv,
    addr: Option<&AddressRegistry>,
    target: &CanonicalAddress,
    b: &mut IRBuilder,
) -> Result<SigExprId, Diagnostic> {
    let ast = parse(text).map_err(|e| {
        Diagnostic::error(
            codes::E_EXPR_PARSE,
            "expression parse error",
            e.to_string(),
            target.clone(),
            Domain::Type,
        )
    })?;
    lower_expr(&ast, type_env, sig_env, addr, target, b)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_target() -> CanonicalAddress {
        CanonicalAddress::Block { name: "expr1".into() }
    }

    #[test]
    fn lexer_distinguishes_decimal_point_from_member_access() {
        let toks = Lexer::new("3.5").lex_all().unwrap();
        assert_eq!(toks[0].tok, Tok::Number(3.5));

        let toks = Lexer::new("Circle.radius").lex_all().unwrap();
        assert_eq!(toks[0].tok, Tok::Ident("Circle".into()));
        assert_eq!(toks[1].tok, Tok::Dot);
        assert_eq!(toks[2].tok, Tok::Ident("radius".into()));
    }

    #[test]
    fn compiles_member_access_plus_const() {
        let mut b = IRBuilder::new();
        let mut sig_env = ExprSigEnv { vars: FxHashMap::default() };
        let circle_radius = b.push_sig(SigExpr::Const(ordered_float::NotNan::new(0.3).unwrap()));
        sig_env.vars.insert("Circle.radius".to_string(), circle_radius);
        let in0 = b.push_sig(SigExpr::Const(ordered_float::NotNan::new(0.1).unwrap()));
        sig_env.vars.insert("in0".to_string(), in0);
        let type_env = ExprTypeEnv { vars: FxHashMap::default() };

        let result = compile_expression(
            "Circle.radius * 2 + in0",
            &type_env,
            &sig_env,
            None,
            &dummy_target(),
            &mut b,
        );
        assert!(result.is_ok());
    }

    #[test]
    fn undefined_identifier_is_an_error() {
        let mut b = IRBuilder::new();
        let sig_env = ExprSigEnv { vars: FxHashMap::default() };
        let type_env = ExprTypeEnv { vars: FxHashMap::default() };
        let result = compile_expression("in0 + 1", &type_env, &sig_env, None, &dummy_target(), &mut b);
        assert!(result.is_err());
        assert_eq!(result.unwrap_err().code, codes::E_EXPR_UNDEFINED_IDENTIFIER);
    }
}
