//! Safe mini expression evaluator for gateway conditions (§4.2, §9).
//!
//! Conditions are template-interpolated first (`${a.b.c}` → the literal
//! context value, via [`crate::context::Context::interpolate`]) and *then*
//! parsed here as a small boolean/comparison grammar over primitives. There
//! is deliberately no identifier lookup or function call support in this
//! grammar — by the time a string reaches [`evaluate`], all variable
//! references have already been substituted with literals. This is the
//! "safe mini-evaluator" §9 calls for in place of a general-purpose `eval`.
//!
//! Grammar (loosest to tightest binding):
//! ```text
//! expr    := or_expr
//! or_expr := and_expr ("||" and_expr)*
//! and_expr:= not_expr ("&&" not_expr)*
//! not_expr:= "!"? cmp_expr
//! cmp_expr:= atom (("==" | "!=" | "<=" | ">=" | "<" | ">") atom)?
//! atom    := "true" | "false" | number | "'...'" | "(" expr ")"
//! ```

use nom::{
    branch::alt,
    bytes::complete::{tag, take_while1},
    character::complete::{char, digit1, multispace0},
    combinator::{map, opt, recognize, value},
    sequence::{delimited, pair, preceded, tuple},
    IResult,
};
use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Bool(bool),
    Num(f64),
    Str(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ExprError {
    #[error("malformed condition expression: {0}")]
    Parse(String),
    #[error("condition expression did not evaluate to a boolean: {0:?}")]
    NotBoolean(Literal),
}

fn ws<'a, F, O>(inner: F) -> impl FnMut(&'a str) -> IResult<&'a str, O>
where
    F: FnMut(&'a str) -> IResult<&'a str, O>,
{
    delimited(multispace0, inner, multispace0)
}

fn lit_bool(input: &str) -> IResult<&str, Literal> {
    alt((
        value(Literal::Bool(true), tag("true")),
        value(Literal::Bool(false), tag("false")),
    ))(input)
}

fn lit_num(input: &str) -> IResult<&str, Literal> {
    map(
        recognize(tuple((opt(char('-')), digit1, opt(pair(char('.'), digit1))))),
        |s: &str| Literal::Num(s.parse().unwrap_or(0.0)),
    )(input)
}

fn lit_str(input: &str) -> IResult<&str, Literal> {
    alt((
        delimited(
            char('\''),
            map(take_while1_or_empty(|c| c != '\''), |s: &str| {
                Literal::Str(s.to_string())
            }),
            char('\''),
        ),
        delimited(
            char('"'),
            map(take_while1_or_empty(|c| c != '"'), |s: &str| {
                Literal::Str(s.to_string())
            }),
            char('"'),
        ),
    ))(input)
}

/// `take_while1` panics on an empty match; gateway conditions may legitimately
/// contain empty string literals (`''`), so fall back to an explicit empty
/// slice when there's nothing to take.
fn take_while1_or_empty(
    pred: impl Fn(char) -> bool + Copy,
) -> impl Fn(&str) -> IResult<&str, &str> {
    move |input: &str| match take_while1(pred)(input) {
        Ok(ok) => Ok(ok),
        Err(_) => Ok((input, "")),
    }
}

fn atom(input: &str) -> IResult<&str, Literal> {
    ws(alt((
        lit_bool,
        lit_num,
        lit_str,
        delimited(char('('), expr_to_bool_literal, char(')')),
    )))(input)
}

/// A parenthesized sub-expression evaluates to a bool literal so it can
/// nest inside comparisons (rare, but keeps the grammar composable).
fn expr_to_bool_literal(input: &str) -> IResult<&str, Literal> {
    map(or_expr, Literal::Bool)(input)
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
}

fn cmp_op(input: &str) -> IResult<&str, CmpOp> {
    ws(alt((
        value(CmpOp::Eq, tag("==")),
        value(CmpOp::Ne, tag("!=")),
        value(CmpOp::Le, tag("<=")),
        value(CmpOp::Ge, tag(">=")),
        value(CmpOp::Lt, tag("<")),
        value(CmpOp::Gt, tag(">")),
    )))(input)
}

fn cmp_expr(input: &str) -> IResult<&str, bool> {
    let (input, left) = atom(input)?;
    let (input, rest) = opt(pair(cmp_op, atom))(input)?;
    match rest {
        None => Ok((input, truthy(&left))),
        Some((op, right)) => Ok((input, compare(&left, op, &right))),
    }
}

fn not_expr(input: &str) -> IResult<&str, bool> {
    let (input, bang) = opt(ws(char('!')))(input)?;
    let (input, v) = cmp_expr(input)?;
    Ok((input, if bang.is_some() { !v } else { v }))
}

fn and_expr(input: &str) -> IResult<&str, bool> {
    let (mut input, mut acc) = not_expr(input)?;
    loop {
        match preceded(ws(tag("&&")), not_expr)(input) {
            Ok((rest, v)) => {
                acc = acc && v;
                input = rest;
            }
            Err(_) => break,
        }
    }
    Ok((input, acc))
}

fn or_expr(input: &str) -> IResult<&str, bool> {
    let (mut input, mut acc) = and_expr(input)?;
    loop {
        match preceded(ws(tag("||")), and_expr)(input) {
            Ok((rest, v)) => {
                acc = acc || v;
                input = rest;
            }
            Err(_) => break,
        }
    }
    Ok((input, acc))
}

fn truthy(lit: &Literal) -> bool {
    match lit {
        Literal::Bool(b) => *b,
        Literal::Num(n) => *n != 0.0,
        Literal::Str(s) => !s.is_empty(),
    }
}

fn compare(left: &Literal, op: CmpOp, right: &Literal) -> bool {
    use Literal::*;
    match (left, right) {
        (Num(a), Num(b)) => numeric_cmp(*a, *b, op),
        (Str(a), Str(b)) => match op {
            CmpOp::Eq => a == b,
            CmpOp::Ne => a != b,
            CmpOp::Lt => a < b,
            CmpOp::Gt => a > b,
            CmpOp::Le => a <= b,
            CmpOp::Ge => a >= b,
        },
        (Bool(a), Bool(b)) => match op {
            CmpOp::Eq => a == b,
            CmpOp::Ne => a != b,
            _ => false,
        },
        _ => matches!(op, CmpOp::Ne),
    }
}

fn numeric_cmp(a: f64, b: f64, op: CmpOp) -> bool {
    match op {
        CmpOp::Eq => a == b,
        CmpOp::Ne => a != b,
        CmpOp::Lt => a < b,
        CmpOp::Gt => a > b,
        CmpOp::Le => a <= b,
        CmpOp::Ge => a >= b,
    }
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::Bool(b) => write!(f, "{b}"),
            Literal::Num(n) => write!(f, "{n}"),
            Literal::Str(s) => write!(f, "{s}"),
        }
    }
}

/// Evaluate an already-interpolated condition string to a boolean.
pub fn evaluate(expr: &str) -> Result<bool, ExprError> {
    let trimmed = expr.trim();
    if trimmed.is_empty() {
        return Err(ExprError::Parse("empty expression".to_string()));
    }
    match or_expr(trimmed) {
        Ok((rest, value)) if rest.trim().is_empty() => Ok(value),
        Ok((rest, _)) => Err(ExprError::Parse(format!("unconsumed input: {rest:?}"))),
        Err(e) => Err(ExprError::Parse(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_comparison() {
        assert_eq!(evaluate("12 > 10").unwrap(), true);
        assert_eq!(evaluate("12 > 10 && 1 == 1").unwrap(), true);
        assert_eq!(evaluate("12 < 10 || true").unwrap(), true);
    }

    #[test]
    fn string_equality() {
        assert_eq!(evaluate("'ORD-1' == 'ORD-1'").unwrap(), true);
        assert_eq!(evaluate("\"a\" != \"b\"").unwrap(), true);
    }

    #[test]
    fn bare_boolean_literal() {
        assert_eq!(evaluate("true").unwrap(), true);
        assert_eq!(evaluate("!false").unwrap(), true);
    }

    #[test]
    fn malformed_expression_errors() {
        assert!(evaluate("12 >").is_err());
        assert!(evaluate("").is_err());
    }
}
