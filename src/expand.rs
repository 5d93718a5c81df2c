//! The `$(...)` expander.
//!
//! Scans text left to right, copying literal characters and evaluating
//! `$$`, `$x`, `$(...)`, and `${...}` references. Bodies are classified as
//! substitution references, function calls, or plain variable references,
//! in that order.

use tracing::warn;

use crate::caps::Capabilities;
use crate::engine::EngineState;
use crate::error::Result;
use crate::funcs::{self, strings};
use crate::vars::{Payload, ScopeChain, Variables};

/// Nested variable expansions allowed before a reference is abandoned.
const MAX_DEPTH: u32 = 64;

/// Expansion context: engine state, capabilities, and the active scope.
///
/// A context is cheap to construct; the scope chain is swapped in and out
/// around overlays (see [`ExpandCtx::with_overlay`]) rather than mutated,
/// so nested bindings never leak.
pub struct ExpandCtx<'a> {
    /// Live engine state. Functions such as `eval` and `shell` write here.
    pub state: &'a mut EngineState,
    /// Injected capabilities for `wildcard`, `shell`, `file`, and friends.
    pub caps: &'a Capabilities,
    /// Variable overlays consulted before the global store.
    pub scope: ScopeChain,
    depth: u32,
}

impl<'a> ExpandCtx<'a> {
    /// Context over the global scope.
    pub fn new(state: &'a mut EngineState, caps: &'a Capabilities) -> Self {
        Self {
            state,
            caps,
            scope: ScopeChain::new(),
            depth: 0,
        }
    }

    /// Context over an explicit scope chain.
    pub fn with_scope(state: &'a mut EngineState, caps: &'a Capabilities, scope: ScopeChain) -> Self {
        Self {
            state,
            caps,
            scope,
            depth: 0,
        }
    }

    /// Run `f` with `overlay` pushed onto the scope, restoring it after.
    pub fn with_overlay<R>(
        &mut self,
        overlay: Variables,
        f: impl FnOnce(&mut Self) -> R,
    ) -> R {
        let saved = self.scope.clone();
        self.scope = self.scope.with(overlay);
        let out = f(self);
        self.scope = saved;
        out
    }

    /// Expand every reference in `input`.
    ///
    /// # Errors
    ///
    /// Propagates `$(error ...)` and failing function calls. Self-referential
    /// variables are cut off at a fixed depth with a warning, yielding the
    /// reference text unexpanded.
    pub fn expand(&mut self, input: &str) -> Result<String> {
        let chars: Vec<char> = input.chars().collect();
        let mut out = String::with_capacity(input.len());
        let mut i = 0;
        while i < chars.len() {
            let ch = chars[i];
            if ch != '$' {
                out.push(ch);
                i += 1;
                continue;
            }
            match chars.get(i + 1) {
                None => {
                    out.push('$');
                    i += 1;
                }
                Some('$') => {
                    out.push('$');
                    i += 2;
                }
                Some(&open @ ('(' | '{')) => {
                    let close = if open == '(' { ')' } else { '}' };
                    let (body, next) = read_body(&chars, i + 2, open, close)?;
                    out.push_str(&self.eval_body(&body)?);
                    i = next;
                }
                Some(&single) => {
                    out.push_str(&self.reference(&single.to_string())?);
                    i += 2;
                }
            }
        }
        Ok(out)
    }

    /// Evaluate one bracketed body.
    fn eval_body(&mut self, body: &str) -> Result<String> {
        if let Some((name, pattern, replacement)) = split_substitution(body) {
            return self.substitution(&name, &pattern, &replacement);
        }
        if let Some((head, rest)) = split_function_head(body)
            && let Some(spec) = funcs::lookup(head)
        {
            let mut args = split_args(rest, spec.max_args);
            if let Some(first) = args.first_mut() {
                *first = first.trim_start().to_owned();
            }
            if !spec.raw {
                for arg in &mut args {
                    *arg = self.expand(arg)?;
                }
            }
            return funcs::call(self, spec, args);
        }
        self.reference(body)
    }

    /// Substitution reference: `$(name:pattern=replacement)`.
    fn substitution(&mut self, name: &str, pattern: &str, replacement: &str) -> Result<String> {
        let name = self.expand(name)?;
        let pattern = self.expand(pattern)?;
        let replacement = self.expand(replacement)?;
        let value = self.reference(&name)?;
        // Without a `%` this is suffix substitution: `o=c` acts as `%o=%c`.
        let (pattern, replacement) = if pattern.contains('%') {
            (pattern, replacement)
        } else {
            (format!("%{pattern}"), format!("%{replacement}"))
        };
        Ok(strings::patsubst_words(&pattern, &replacement, &value))
    }

    /// Plain variable reference: expand the body as a name, look it up, and
    /// expand the stored value when the flavor is recursive.
    fn reference(&mut self, body: &str) -> Result<String> {
        let name = if body.contains('$') {
            self.expand(body)?
        } else {
            body.to_owned()
        };
        let Some(found) = self.state.lookup(&self.scope, &name) else {
            self.note_undefined(&name);
            return Ok(String::new());
        };
        let recursive = found.recursive;
        let text = match &found.payload {
            Payload::Text(text) => text.clone(),
            Payload::Computed(hook) => {
                let hook = *hook;
                self.state.computed_text(hook)
            }
        };
        if !recursive || !text.contains('$') {
            return Ok(text);
        }
        if self.depth >= MAX_DEPTH {
            warn!(
                target: "kumade::expand",
                name, "variable reference exceeds expansion depth, left unexpanded"
            );
            return Ok(format!("$({name})"));
        }
        self.depth += 1;
        let expanded = self.expand(&text);
        self.depth -= 1;
        expanded
    }

    fn note_undefined(&mut self, name: &str) {
        if self.state.warn_undef && self.state.warned_undef.insert(name.to_owned()) {
            warn!(target: "kumade::expand", name, "undefined variable");
        }
    }
}

/// Read a `$(`/`${` body up to its matching close bracket.
///
/// Nested brackets of the same kind balance, and a backslash protects a
/// bracket character from counting.
fn read_body(chars: &[char], start: usize, open: char, close: char) -> Result<(String, usize)> {
    let mut body = String::new();
    let mut depth = 1usize;
    let mut i = start;
    while i < chars.len() {
        let ch = chars[i];
        if ch == '\\'
            && let Some(&next) = chars.get(i + 1)
            && (next == open || next == close)
        {
            body.push(next);
            i += 2;
            continue;
        }
        if ch == open {
            depth += 1;
        } else if ch == close {
            depth -= 1;
            if depth == 0 {
                return Ok((body, i + 1));
            }
        }
        body.push(ch);
        i += 1;
    }
    Err(crate::error::MakeError::Expand {
        message: format!("unterminated variable reference '${open}{}'", body),
    })
}

/// Detect `name:pattern=replacement` at the top level of a body.
///
/// The name part must be non-empty and contain no top-level whitespace,
/// which keeps function calls like `$(if a,b)` out of this form.
fn split_substitution(body: &str) -> Option<(String, String, String)> {
    let chars: Vec<char> = body.chars().collect();
    let mut depth = 0usize;
    let mut colon = None;
    let mut equals = None;
    for (i, &ch) in chars.iter().enumerate() {
        match ch {
            '(' | '{' => depth += 1,
            ')' | '}' => depth = depth.saturating_sub(1),
            ':' if depth == 0 && colon.is_none() => colon = Some(i),
            '=' if depth == 0 && colon.is_some() => {
                equals = Some(i);
                break;
            }
            c if c.is_whitespace() && depth == 0 && colon.is_none() => return None,
            _ => {}
        }
    }
    let (colon, equals) = (colon?, equals?);
    if colon == 0 {
        return None;
    }
    let name: String = chars[..colon].iter().collect();
    let pattern: String = chars[colon + 1..equals].iter().collect();
    let replacement: String = chars[equals + 1..].iter().collect();
    Some((name, pattern, replacement))
}

/// Split a body into a candidate function name and its argument text.
fn split_function_head(body: &str) -> Option<(&str, &str)> {
    let head_end = body.find(char::is_whitespace)?;
    let head = &body[..head_end];
    let rest = &body[head_end + 1..];
    (!head.is_empty()).then_some((head, rest))
}

/// Split argument text on top-level commas, capping at `max` parts so
/// trailing commas merge into the final argument.
fn split_args(text: &str, max: Option<usize>) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut depth = 0usize;
    for ch in text.chars() {
        match ch {
            '(' | '{' => {
                depth += 1;
                current.push(ch);
            }
            ')' | '}' => {
                depth = depth.saturating_sub(1);
                current.push(ch);
            }
            ',' if depth == 0 && max.is_none_or(|m| args.len() + 1 < m) => {
                args.push(std::mem::take(&mut current));
            }
            _ => current.push(ch),
        }
    }
    args.push(current);
    args
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::caps::Capabilities;
    use crate::engine::Engine;
    use rstest::rstest;

    fn expand_with(defs: &str, input: &str) -> String {
        let engine = Engine::new(Capabilities::host());
        engine.parse_str(defs, None).expect("parse");
        engine.expand(input).expect("expand")
    }

    #[rstest]
    #[case("", "plain text", "plain text")]
    #[case("", "cost is $$5", "cost is $5")]
    #[case("X = hi", "$(X) there", "hi there")]
    #[case("X = hi", "${X} there", "hi there")]
    #[case("XY = hi", "$Xrest", "rest")]
    #[case("", "$(MISSING)", "")]
    fn expands_basic_references(#[case] defs: &str, #[case] input: &str, #[case] expect: &str) {
        assert_eq!(expand_with(defs, input), expect);
    }

    #[test]
    fn recursive_variables_reexpand_on_read() {
        let out = expand_with("A = $(B)\nB = x", "$(A)");
        assert_eq!(out, "x");
    }

    #[test]
    fn simple_variables_freeze_at_assignment() {
        let out = expand_with("A := $(B)\nB = x", "[$(A)]");
        assert_eq!(out, "[]");
    }

    #[test]
    fn nested_references_compute_names() {
        let out = expand_with("N = X\nX = deep", "$($(N))");
        assert_eq!(out, "deep");
    }

    #[test]
    fn substitution_reference_applies_suffix_rewrite() {
        let out = expand_with("OBJS = a.c b.c", "$(OBJS:.c=.o)");
        assert_eq!(out, "a.o b.o");
    }

    #[test]
    fn substitution_reference_honours_percent() {
        let out = expand_with("SRCS = lib/a.c lib/b.c", "$(SRCS:lib/%.c=out/%.o)");
        assert_eq!(out, "out/a.o out/b.o");
    }

    #[test]
    fn self_reference_is_cut_off_with_warning() {
        let out = expand_with("A = $(A)x", "$(A)");
        // The cycle guard leaves the innermost reference unexpanded.
        assert!(out.contains("$(A)"), "got {out}");
    }

    #[test]
    fn unterminated_reference_is_an_error() {
        let engine = Engine::new(Capabilities::host());
        let err = engine.expand("$(oops").expect_err("should fail");
        assert!(err.to_string().contains("unterminated"));
    }

    #[rstest]
    #[case("a,b", None, vec!["a", "b"])]
    #[case("a,b,c", Some(2), vec!["a", "b,c"])]
    #[case("f($(x),y),z", None, vec!["f($(x),y)", "z"])]
    fn split_args_respects_nesting_and_cap(
        #[case] text: &str,
        #[case] max: Option<usize>,
        #[case] expect: Vec<&str>,
    ) {
        assert_eq!(split_args(text, max), expect);
    }

}
