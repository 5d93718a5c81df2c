//! Conditional directive evaluation (`ifeq`, `ifneq`, `ifdef`, `ifndef`).

use crate::error::{MakeError, Result, SourceLocation};
use crate::expand::ExpandCtx;
use crate::vars::Payload;

/// The four conditional kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CondKind {
    Ifeq,
    Ifneq,
    Ifdef,
    Ifndef,
}

impl CondKind {
    /// Parse a directive word.
    #[must_use]
    pub fn from_word(word: &str) -> Option<Self> {
        match word {
            "ifeq" => Some(Self::Ifeq),
            "ifneq" => Some(Self::Ifneq),
            "ifdef" => Some(Self::Ifdef),
            "ifndef" => Some(Self::Ifndef),
            _ => None,
        }
    }
}

/// One open conditional.
#[derive(Debug)]
pub struct CondFrame {
    /// The enclosing context was live when this conditional opened.
    pub parent_active: bool,
    /// Some branch has already been taken.
    pub taken: bool,
    /// The current branch is live.
    pub active: bool,
    /// A bare `else` was seen; another is an error.
    pub else_seen: bool,
}

impl CondFrame {
    /// Open a conditional whose first branch evaluated to `truth`.
    #[must_use]
    pub fn open(parent_active: bool, truth: bool) -> Self {
        let active = parent_active && truth;
        Self {
            parent_active,
            taken: active,
            active,
            else_seen: false,
        }
    }

    /// Enter a plain `else` branch.
    pub fn enter_else(&mut self, location: &SourceLocation) -> Result<()> {
        if self.else_seen {
            return Err(MakeError::parse(
                location.clone(),
                "only one 'else' per conditional",
            ));
        }
        self.else_seen = true;
        self.active = self.parent_active && !self.taken;
        self.taken |= self.active;
        Ok(())
    }

    /// Enter an `else ifX` branch whose condition evaluated to `truth`.
    pub fn enter_else_if(&mut self, truth: bool, location: &SourceLocation) -> Result<()> {
        if self.else_seen {
            return Err(MakeError::parse(
                location.clone(),
                "'else if' after a bare 'else'",
            ));
        }
        self.active = self.parent_active && !self.taken && truth;
        self.taken |= self.active;
        Ok(())
    }
}

/// Evaluate a conditional's argument text.
///
/// `ifeq`/`ifneq` accept `(a,b)` or a pair of quoted words; `ifdef`/`ifndef`
/// take a variable name, true when its raw value is non-empty.
pub fn evaluate(
    ctx: &mut ExpandCtx<'_>,
    kind: CondKind,
    rest: &str,
    location: &SourceLocation,
) -> Result<bool> {
    match kind {
        CondKind::Ifeq | CondKind::Ifneq => {
            let (lhs, rhs) = split_comparison(rest, location)?;
            let lhs = ctx.expand(&lhs)?;
            let rhs = ctx.expand(&rhs)?;
            let equal = lhs == rhs;
            Ok(if kind == CondKind::Ifeq { equal } else { !equal })
        }
        CondKind::Ifdef | CondKind::Ifndef => {
            let name = ctx.expand(rest.trim())?;
            let defined = ctx
                .state
                .lookup(&ctx.scope, name.trim())
                .is_some_and(|value| match &value.payload {
                    Payload::Text(text) => !text.is_empty(),
                    Payload::Computed(_) => true,
                });
            Ok(if kind == CondKind::Ifdef {
                defined
            } else {
                !defined
            })
        }
    }
}

/// Split `(a,b)` or `"a" "b"` into the two comparison arms.
fn split_comparison(rest: &str, location: &SourceLocation) -> Result<(String, String)> {
    let rest = rest.trim();
    if let Some(inner) = rest.strip_prefix('(') {
        let Some(inner) = inner.strip_suffix(')') else {
            return Err(MakeError::parse(
                location.clone(),
                "conditional missing closing parenthesis",
            ));
        };
        let mut depth = 0usize;
        for (i, ch) in inner.char_indices() {
            match ch {
                '(' | '{' => depth += 1,
                ')' | '}' => depth = depth.saturating_sub(1),
                ',' if depth == 0 => {
                    return Ok((inner[..i].to_owned(), inner[i + 1..].trim_start().to_owned()));
                }
                _ => {}
            }
        }
        return Err(MakeError::parse(
            location.clone(),
            "conditional missing comma",
        ));
    }
    let mut arms = Vec::new();
    let mut chars = rest.char_indices().peekable();
    while let Some((start, quote)) = chars.next() {
        if quote != '"' && quote != '\'' {
            continue;
        }
        let mut end = None;
        for (i, ch) in chars.by_ref() {
            if ch == quote {
                end = Some(i);
                break;
            }
        }
        let Some(end) = end else {
            return Err(MakeError::parse(location.clone(), "unterminated quote"));
        };
        arms.push(rest[start + 1..end].to_owned());
    }
    match <[String; 2]>::try_from(arms) {
        Ok([lhs, rhs]) => Ok((lhs, rhs)),
        Err(_) => Err(MakeError::parse(
            location.clone(),
            "conditional needs two quoted words or a parenthesised pair",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn loc() -> SourceLocation {
        SourceLocation::default()
    }

    #[rstest]
    #[case("(a,a)", "a", "a")]
    #[case("(a, b)", "a", "b")]
    #[case("($(X),y)", "$(X)", "y")]
    #[case("\"a\" 'b'", "a", "b")]
    fn split_comparison_forms(#[case] rest: &str, #[case] lhs: &str, #[case] rhs: &str) {
        let (l, r) = split_comparison(rest, &loc()).expect("split");
        assert_eq!((l.as_str(), r.as_str()), (lhs, rhs));
    }

    #[test]
    fn split_comparison_honours_nested_commas() {
        let (l, r) = split_comparison("($(word 1,a b),a)", &loc()).expect("split");
        assert_eq!(l, "$(word 1,a b)");
        assert_eq!(r, "a");
    }

    #[test]
    fn frame_takes_at_most_one_branch() {
        let mut frame = CondFrame::open(true, false);
        assert!(!frame.active);
        frame.enter_else_if(true, &loc()).expect("else if");
        assert!(frame.active);
        frame.enter_else(&loc()).expect("else");
        assert!(!frame.active);
        assert!(frame.enter_else(&loc()).is_err());
    }

    #[test]
    fn inactive_parent_suppresses_all_branches() {
        let mut frame = CondFrame::open(false, true);
        assert!(!frame.active);
        frame.enter_else(&loc()).expect("else");
        assert!(!frame.active);
    }
}
