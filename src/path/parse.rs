//! Parser for the property-path mini-language.
//!
//! ```text
//! path        := concat
//! concat      := atomic_sub ("/" concat)?
//! atomic_sub  := atomic ("@" subfield)?
//! atomic      := PID "_" PID | PID | "qid" | TERM | SITELINK | "." | "(" pipe ")"
//! pipe        := concat ("|" pipe)?
//! ```
//!
//! `@` binds tightest, then `/`; disjunction only occurs inside
//! parentheses, which is what keeps the canonical rendering parseable.
//! No whitespace is allowed anywhere.

use super::{PropertyPath, TermKind};
use winnow::combinator::{alt, cut_err, delimited, opt, preceded};
use winnow::error::{ContextError, ErrMode, StrContext, StrContextValue};
use winnow::prelude::*;
use winnow::token::{literal, one_of, take_while};

/// Parses a complete path string; the entire input must be consumed.
pub fn parse_path(input: &str) -> Result<PropertyPath, String> {
    concat_path
        .parse(input)
        .map_err(|err| render_error(input, err.offset()))
}

fn render_error(input: &str, offset: usize) -> String {
    if offset >= input.len() {
        "unexpected end of input".to_string()
    } else {
        format!("unexpected character at position {offset}")
    }
}

fn pid(input: &mut &str) -> ModalResult<String> {
    let digits = preceded('P', take_while(1.., |c: char| c.is_ascii_digit()))
        .take()
        .parse_next(input)?;
    Ok(digits.to_string())
}

fn lang_code(input: &mut &str) -> ModalResult<String> {
    take_while(1.., |c: char| c.is_ascii_lowercase() || c == '-')
        .map(str::to_string)
        .parse_next(input)
}

fn subfield_name(input: &mut &str) -> ModalResult<String> {
    take_while(1.., |c: char| c.is_ascii_lowercase())
        .map(str::to_string)
        .parse_next(input)
}

/// `P31` or `P31_P642`; one lookahead token decides which.
fn leaf_or_qualifier(input: &mut &str) -> ModalResult<PropertyPath> {
    let property = pid.parse_next(input)?;
    match opt(preceded('_', cut_err(pid))).parse_next(input)? {
        Some(qualifier) => Ok(PropertyPath::Qualifier {
            pid: property,
            qualifier,
        }),
        None => Ok(PropertyPath::Leaf { pid: property }),
    }
}

fn term(input: &mut &str) -> ModalResult<PropertyPath> {
    let kind = one_of(['L', 'D', 'A']).parse_next(input)?;
    let lang = lang_code.parse_next(input)?;
    let kind = match kind {
        'L' => TermKind::Label,
        'D' => TermKind::Description,
        _ => TermKind::Alias,
    };
    Ok(PropertyPath::Term { kind, lang })
}

fn sitelink(input: &mut &str) -> ModalResult<PropertyPath> {
    let site = preceded('S', lang_code).parse_next(input)?;
    Ok(PropertyPath::Sitelink { site })
}

fn qid_token(input: &mut &str) -> ModalResult<PropertyPath> {
    literal("qid").parse_next(input)?;
    // "qid" must not swallow the start of a longer lowercase run
    if input.starts_with(|c: char| c.is_ascii_lowercase()) {
        return Err(ErrMode::Backtrack(ContextError::new()));
    }
    Ok(PropertyPath::Qid)
}

fn atomic(input: &mut &str) -> ModalResult<PropertyPath> {
    alt((
        leaf_or_qualifier,
        qid_token,
        term,
        sitelink,
        '.'.value(PropertyPath::Empty),
        delimited(
            '(',
            pipe_path,
            cut_err(')').context(StrContext::Expected(StrContextValue::CharLiteral(')'))),
        ),
    ))
    .parse_next(input)
}

fn atomic_subfield(input: &mut &str) -> ModalResult<PropertyPath> {
    let base = atomic.parse_next(input)?;
    match opt(preceded('@', cut_err(subfield_name))).parse_next(input)? {
        Some(name) => Ok(PropertyPath::Subfield {
            path: Box::new(base),
            name,
        }),
        None => Ok(base),
    }
}

fn concat_path(input: &mut &str) -> ModalResult<PropertyPath> {
    let head = atomic_subfield.parse_next(input)?;
    match opt(preceded('/', cut_err(concat_path))).parse_next(input)? {
        Some(tail) => Ok(PropertyPath::Concat(Box::new(head), Box::new(tail))),
        None => Ok(head),
    }
}

fn pipe_path(input: &mut &str) -> ModalResult<PropertyPath> {
    let head = concat_path.parse_next(input)?;
    match opt(preceded('|', cut_err(pipe_path))).parse_next(input)? {
        Some(tail) => Ok(PropertyPath::Disjunct(Box::new(head), Box::new(tail))),
        None => Ok(head),
    }
}
