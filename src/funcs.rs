//! Built-in function registry and dispatch.
//!
//! Each function is described by a [`FunctionSpec`] giving its arity and
//! whether it receives raw (unexpanded) arguments. The expander consults
//! [`lookup`] to classify a body and [`call`] to dispatch.

pub mod control;
pub mod io;
pub mod paths;
pub mod strings;

use crate::error::{MakeError, Result};
use crate::expand::ExpandCtx;

/// Registry entry for a built-in function.
#[derive(Debug, Clone, Copy)]
pub struct FunctionSpec {
    /// Name as written in makefiles.
    pub name: &'static str,
    /// Receive arguments unexpanded and expand on demand.
    pub raw: bool,
    /// Minimum argument count.
    pub min_args: usize,
    /// Maximum argument count; `None` for variadic. Comma splitting caps at
    /// this bound so surplus commas merge into the final argument.
    pub max_args: Option<usize>,
}

const fn spec(name: &'static str, raw: bool, min: usize, max: Option<usize>) -> FunctionSpec {
    FunctionSpec {
        name,
        raw,
        min_args: min,
        max_args: max,
    }
}

static SPECS: &[FunctionSpec] = &[
    // String and list functions.
    spec("subst", false, 3, Some(3)),
    spec("patsubst", false, 3, Some(3)),
    spec("strip", false, 1, Some(1)),
    spec("findstring", false, 2, Some(2)),
    spec("filter", false, 2, Some(2)),
    spec("filter-out", false, 2, Some(2)),
    spec("sort", false, 1, Some(1)),
    spec("word", false, 2, Some(2)),
    spec("words", false, 1, Some(1)),
    spec("wordlist", false, 3, Some(3)),
    spec("firstword", false, 1, Some(1)),
    spec("lastword", false, 1, Some(1)),
    spec("join", false, 2, Some(2)),
    spec("addsuffix", false, 2, Some(2)),
    spec("addprefix", false, 2, Some(2)),
    // Path functions.
    spec("dir", false, 1, Some(1)),
    spec("notdir", false, 1, Some(1)),
    spec("suffix", false, 1, Some(1)),
    spec("basename", false, 1, Some(1)),
    spec("realpath", false, 1, Some(1)),
    spec("abspath", false, 1, Some(1)),
    spec("wildcard", false, 1, Some(1)),
    // Conditional and logic functions. These expand lazily.
    spec("if", true, 2, Some(3)),
    spec("or", true, 1, None),
    spec("and", true, 1, None),
    spec("intcmp", false, 2, Some(5)),
    // Meta functions.
    spec("value", false, 1, Some(1)),
    spec("origin", false, 1, Some(1)),
    spec("flavor", false, 1, Some(1)),
    // Control functions binding names in a child scope.
    spec("foreach", true, 3, Some(3)),
    spec("let", true, 3, Some(3)),
    spec("call", false, 1, None),
    // I/O and process functions.
    spec("file", false, 1, Some(2)),
    spec("error", false, 1, Some(1)),
    spec("warning", false, 1, Some(1)),
    spec("info", false, 1, Some(1)),
    spec("shell", false, 1, Some(1)),
    spec("eval", false, 1, Some(1)),
];

/// Find the registry entry for `name`, if it is a built-in function.
#[must_use]
pub fn lookup(name: &str) -> Option<&'static FunctionSpec> {
    SPECS.iter().find(|spec| spec.name == name)
}

/// Dispatch a function call.
///
/// # Errors
///
/// Returns an expansion error on arity mismatch and propagates failures
/// from the function body (`error`, unreadable files, shell spawn).
pub fn call(ctx: &mut ExpandCtx<'_>, spec: &FunctionSpec, args: Vec<String>) -> Result<String> {
    if args.len() < spec.min_args || spec.max_args.is_some_and(|max| args.len() > max) {
        return Err(MakeError::Expand {
            message: format!(
                "'{}' called with {} argument(s), expects {}",
                spec.name,
                args.len(),
                arity_text(spec)
            ),
        });
    }
    match spec.name {
        "subst" => Ok(strings::subst(&args[0], &args[1], &args[2])),
        "patsubst" => Ok(strings::patsubst_words(&args[0], &args[1], &args[2])),
        "strip" => Ok(strings::strip(&args[0])),
        "findstring" => Ok(strings::findstring(&args[0], &args[1])),
        "filter" => Ok(strings::filter(&args[0], &args[1], false)),
        "filter-out" => Ok(strings::filter(&args[0], &args[1], true)),
        "sort" => Ok(strings::sort(&args[0])),
        "word" => strings::word(&args[0], &args[1]),
        "words" => Ok(strings::words(&args[0])),
        "wordlist" => strings::wordlist(&args[0], &args[1], &args[2]),
        "firstword" => Ok(strings::firstword(&args[0])),
        "lastword" => Ok(strings::lastword(&args[0])),
        "join" => Ok(strings::join(&args[0], &args[1])),
        "addsuffix" => Ok(strings::addsuffix(&args[0], &args[1])),
        "addprefix" => Ok(strings::addprefix(&args[0], &args[1])),
        "dir" => Ok(paths::dir(&args[0])),
        "notdir" => Ok(paths::notdir(&args[0])),
        "suffix" => Ok(paths::suffix(&args[0])),
        "basename" => Ok(paths::basename(&args[0])),
        "realpath" => Ok(paths::realpath(ctx, &args[0])),
        "abspath" => Ok(paths::abspath(ctx, &args[0])),
        "wildcard" => Ok(paths::wildcard(ctx, &args[0])),
        "if" => control::if_fn(ctx, &args),
        "or" => control::or_fn(ctx, &args),
        "and" => control::and_fn(ctx, &args),
        "intcmp" => control::intcmp(&args),
        "value" => Ok(control::value(ctx, &args[0])),
        "origin" => Ok(control::origin(ctx, &args[0])),
        "flavor" => Ok(control::flavor(ctx, &args[0])),
        "foreach" => control::foreach(ctx, &args),
        "let" => control::let_fn(ctx, &args),
        "call" => control::call_fn(ctx, &args),
        "file" => io::file(ctx, &args),
        "error" => io::error_fn(&args[0]),
        "warning" => Ok(io::warning_fn(&args[0])),
        "info" => Ok(io::info_fn(&args[0])),
        "shell" => io::shell(ctx, &args[0]),
        "eval" => io::eval(ctx, &args[0]),
        other => Err(MakeError::Expand {
            message: format!("unregistered function '{other}'"),
        }),
    }
}

fn arity_text(spec: &FunctionSpec) -> String {
    match spec.max_args {
        Some(max) if max == spec.min_args => format!("{max}"),
        Some(max) => format!("{} to {max}", spec.min_args),
        None => format!("at least {}", spec.min_args),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_knows_every_group() {
        for name in ["patsubst", "abspath", "if", "foreach", "file", "eval"] {
            assert!(lookup(name).is_some(), "missing {name}");
        }
        assert!(lookup("not-a-function").is_none());
    }

    #[test]
    fn raw_flags_cover_the_lazy_functions() {
        for name in ["if", "or", "and", "foreach", "let"] {
            assert!(lookup(name).expect(name).raw, "{name} should be raw");
        }
        for name in ["call", "subst", "shell", "eval"] {
            assert!(!lookup(name).expect(name).raw, "{name} should pre-expand");
        }
    }
}
