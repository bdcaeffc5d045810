use chumsky::prelude::*;
use std::str::FromStr;

use crate::error::{Result, SemError};
use crate::partable::INTERCEPT_SOURCE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyntaxOp {
    /// `=~`: latent measured by indicators.
    Measure,
    /// `~`: regression of lhs on terms.
    Regress,
    /// `~~`: (co)variance.
    Cov,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CoefSpec {
    Fixed(f64),
    Label(String),
    Start(f64),
    /// `NA*x` frees a coefficient that would otherwise be fixed.
    Free,
    None,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Term {
    pub coef: CoefSpec,
    pub var: String,
}

impl Term {
    pub fn is_intercept(&self) -> bool {
        self.var == INTERCEPT_SOURCE
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SyntaxLine {
    pub lhs: String,
    pub op: SyntaxOp,
    pub terms: Vec<Term>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundOp {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
}

/// `label > value` style bound on a labelled parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundConstraint {
    pub target: String,
    pub op: BoundOp,
    pub value: f64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelSyntax {
    pub lines: Vec<SyntaxLine>,
    pub bounds: Vec<BoundConstraint>,
}

enum ParsedLine {
    Model(SyntaxLine),
    Bound(BoundConstraint),
}

type ParseErr<'a> = chumsky::extra::Err<chumsky::error::Simple<'a, char>>;

fn any_char<'a>() -> impl Parser<'a, &'a str, char, ParseErr<'a>> + Copy {
    any()
}

fn ident_parser<'a>() -> impl Parser<'a, &'a str, String, ParseErr<'a>> + Clone {
    let ident_start =
        any_char().filter(|c: &char| c.is_ascii_alphabetic() || *c == '_' || *c == '.');
    let ident_rest = any_char()
        .filter(|c: &char| c.is_ascii_alphanumeric() || *c == '_' || *c == '.')
        .repeated()
        .collect::<String>();
    ident_start
        .then(ident_rest)
        .map(|(first, rest)| {
            let mut s = String::with_capacity(rest.len() + 1);
            s.push(first);
            s.push_str(&rest);
            s
        })
        .padded()
}

fn number_parser<'a>() -> impl Parser<'a, &'a str, f64, ParseErr<'a>> + Clone {
    let sign = just('-').or(just('+')).or_not();
    let digits = any_char()
        .filter(|c: &char| c.is_ascii_digit())
        .repeated()
        .at_least(1)
        .collect::<String>();
    let frac = just('.').then(digits).or_not();
    let exp = just('e')
        .or(just('E'))
        .then(just('-').or(just('+')).or_not())
        .then(digits)
        .or_not();

    sign.then(digits)
        .then(frac)
        .then(exp)
        .map(|(((sign, int), frac), exp)| {
            let mut s = String::new();
            if let Some(sign) = sign {
                s.push(sign);
            }
            s.push_str(&int);
            if let Some((dot, frac)) = frac {
                s.push(dot);
                s.push_str(&frac);
            }
            if let Some(((e, sign), digits)) = exp {
                s.push(e);
                if let Some(sign) = sign {
                    s.push(sign);
                }
                s.push_str(&digits);
            }
            s
        })
        .map(|s| f64::from_str(&s).unwrap_or(f64::NAN))
        .padded()
}

/// Parses lavaan-style model syntax into structural lines and bound constraints.
pub fn parse_model(model: &str) -> Result<ModelSyntax> {
    let mut syntax = ModelSyntax::default();

    for raw_line in model.lines() {
        let stripped = strip_comments(raw_line);
        for segment in stripped.split(';') {
            let line = segment.trim();
            if line.is_empty() {
                continue;
            }
            if line.contains(":=") {
                return Err(SemError::Syntax(format!(
                    "defined parameters are not supported: {line}"
                )));
            }
            match parse_line(line)? {
                ParsedLine::Model(parsed) => syntax.lines.push(parsed),
                ParsedLine::Bound(bound) => syntax.bounds.push(bound),
            }
        }
    }

    Ok(syntax)
}

fn strip_comments(line: &str) -> &str {
    let mut end = line.len();
    if let Some(idx) = line.find('#') {
        end = end.min(idx);
    }
    if let Some(idx) = line.find("//") {
        end = end.min(idx);
    }
    &line[..end]
}

fn parse_line(line: &str) -> Result<ParsedLine> {
    let ident = ident_parser();
    let number = number_parser();

    let coef = choice((
        just("NA").padded().to(CoefSpec::Free),
        just("start")
            .padded()
            .ignore_then(just('(').padded())
            .ignore_then(number.clone())
            .then_ignore(just(')').padded())
            .map(CoefSpec::Start),
        number.clone().map(CoefSpec::Fixed),
        ident.clone().map(CoefSpec::Label),
    ));

    let intercept = just('1').padded().to(INTERCEPT_SOURCE.to_string());

    let term = coef
        .then_ignore(just('*').padded())
        .then(ident.clone().or(intercept.clone()))
        .map(|(coef, var)| Term { coef, var })
        .or(ident.clone().or(intercept).map(|var| Term {
            coef: CoefSpec::None,
            var,
        }));

    let terms = term
        .separated_by(just('+').padded())
        .at_least(1)
        .collect::<Vec<_>>();

    let op = choice((
        just("=~").to(SyntaxOp::Measure),
        just("~~").to(SyntaxOp::Cov),
        just('~').to(SyntaxOp::Regress),
    ))
    .padded();

    let model_line = ident
        .clone()
        .then(op)
        .then(terms)
        .map(|((lhs, op), terms)| ParsedLine::Model(SyntaxLine { lhs, op, terms }));

    let bound_op = choice((
        just("<=").to(BoundOp::Le),
        just(">=").to(BoundOp::Ge),
        just("==").to(BoundOp::Eq),
        just('<').to(BoundOp::Lt),
        just('>').to(BoundOp::Gt),
    ))
    .padded();

    let bound = ident
        .then(bound_op)
        .then(number)
        .map(|((target, op), value)| ParsedLine::Bound(BoundConstraint { target, op, value }));

    let parser = model_line.or(bound).then_ignore(end());
    parser.parse(line).into_result().map_err(|errs| {
        let msg = errs
            .into_iter()
            .map(|e: chumsky::error::Simple<char>| {
                format!("at {:?}: found {:?}", e.span(), e.found())
            })
            .collect::<Vec<_>>()
            .join("; ");
        SemError::Syntax(format!("cannot parse '{line}': {msg}"))
    })
}
