//! Conditional, meta, and scope-binding functions.
//!
//! The raw functions (`if`, `or`, `and`, `foreach`, `let`) receive their
//! arguments unexpanded and expand only the branches they take.

use indexmap::IndexMap;

use super::strings::split_words;
use crate::error::{MakeError, Result};
use crate::expand::ExpandCtx;
use crate::vars::{Origin, Payload, VariableValue, Variables};

/// Truthiness for `if`/`or`/`and`: any non-whitespace after expansion.
fn truthy(text: &str) -> bool {
    !text.trim().is_empty()
}

/// `$(if cond,then[,else])`, expanding only the branch taken.
pub fn if_fn(ctx: &mut ExpandCtx<'_>, args: &[String]) -> Result<String> {
    let cond = ctx.expand(&args[0])?;
    if truthy(&cond) {
        ctx.expand(&args[1])
    } else if let Some(else_arm) = args.get(2) {
        ctx.expand(else_arm)
    } else {
        Ok(String::new())
    }
}

/// `$(or ...)`: the first truthy argument, expanded lazily.
pub fn or_fn(ctx: &mut ExpandCtx<'_>, args: &[String]) -> Result<String> {
    for arg in args {
        let value = ctx.expand(arg)?;
        if truthy(&value) {
            return Ok(value);
        }
    }
    Ok(String::new())
}

/// `$(and ...)`: empty on the first falsy argument, else the last value.
pub fn and_fn(ctx: &mut ExpandCtx<'_>, args: &[String]) -> Result<String> {
    let mut last = String::new();
    for arg in args {
        last = ctx.expand(arg)?;
        if !truthy(&last) {
            return Ok(String::new());
        }
    }
    Ok(last)
}

/// `$(intcmp lhs,rhs[,lt[,eq[,gt]]])`.
pub fn intcmp(args: &[String]) -> Result<String> {
    let parse = |text: &str| -> Result<i64> {
        text.trim().parse().map_err(|_| MakeError::Expand {
            message: format!("non-numeric argument to 'intcmp': '{}'", text.trim()),
        })
    };
    let lhs = parse(&args[0])?;
    let rhs = parse(&args[1])?;
    let pick = |index: usize| args.get(index).cloned().unwrap_or_default();
    Ok(match (args.len(), lhs.cmp(&rhs)) {
        // Two-argument form: the number itself on equality, else empty.
        (2, std::cmp::Ordering::Equal) => lhs.to_string(),
        (2, _) => String::new(),
        (_, std::cmp::Ordering::Less) => pick(2),
        (_, std::cmp::Ordering::Equal) => pick(3),
        // A missing gt branch falls back to the eq branch.
        (4, std::cmp::Ordering::Greater) => pick(3),
        (_, std::cmp::Ordering::Greater) => pick(4),
    })
}

/// `$(value name)`: the stored text without expansion.
#[must_use]
pub fn value(ctx: &mut ExpandCtx<'_>, name: &str) -> String {
    match ctx.state.lookup(&ctx.scope, name) {
        None => String::new(),
        Some(found) => match &found.payload {
            Payload::Text(text) => text.clone(),
            Payload::Computed(hook) => {
                let hook = *hook;
                ctx.state.computed_text(hook)
            }
        },
    }
}

/// `$(origin name)`.
#[must_use]
pub fn origin(ctx: &mut ExpandCtx<'_>, name: &str) -> String {
    ctx.state
        .lookup(&ctx.scope, name)
        .map_or(Origin::Undefined, |found| found.origin)
        .as_str()
        .to_owned()
}

/// `$(flavor name)`.
#[must_use]
pub fn flavor(ctx: &mut ExpandCtx<'_>, name: &str) -> String {
    ctx.state
        .lookup(&ctx.scope, name)
        .map_or("undefined", VariableValue::flavor)
        .to_owned()
}

fn binding(value: String) -> VariableValue {
    VariableValue::text(value, Origin::Automatic, false)
}

/// `$(foreach name,words,text)`: expand `text` once per word with `name`
/// bound, joining results with single spaces.
pub fn foreach(ctx: &mut ExpandCtx<'_>, args: &[String]) -> Result<String> {
    let name = ctx.expand(&args[0])?.trim().to_owned();
    let words = ctx.expand(&args[1])?;
    let mut pieces = Vec::new();
    for word in split_words(&words) {
        let mut overlay = Variables::new();
        overlay.insert(name.clone(), binding(word.to_owned()));
        pieces.push(ctx.with_overlay(overlay, |ctx| ctx.expand(&args[2]))?);
    }
    Ok(pieces.join(" "))
}

/// `$(let names,values,text)`: positional binding; surplus values collapse
/// into the final name.
pub fn let_fn(ctx: &mut ExpandCtx<'_>, args: &[String]) -> Result<String> {
    let names_text = ctx.expand(&args[0])?;
    let values_text = ctx.expand(&args[1])?;
    let names = split_words(&names_text);
    let values = split_words(&values_text);
    let mut overlay = Variables::new();
    for (i, name) in names.iter().enumerate() {
        let bound = if i + 1 == names.len() {
            values.get(i..).map(|rest| rest.join(" ")).unwrap_or_default()
        } else {
            values.get(i).copied().unwrap_or_default().to_owned()
        };
        overlay.insert((*name).to_owned(), binding(bound));
    }
    ctx.with_overlay(overlay, |ctx| ctx.expand(&args[2]))
}

/// `$(call name,args...)`: bind `$(0)`..`$(N)` and expand the named
/// variable's stored value.
pub fn call_fn(ctx: &mut ExpandCtx<'_>, args: &[String]) -> Result<String> {
    let name = args[0].trim().to_owned();
    let body = value(ctx, &name);
    let mut overlay: Variables = IndexMap::new();
    overlay.insert("0".to_owned(), binding(name));
    for (i, arg) in args.iter().enumerate().skip(1) {
        overlay.insert(i.to_string(), binding(arg.clone()));
    }
    ctx.with_overlay(overlay, |ctx| ctx.expand(&body))
}
