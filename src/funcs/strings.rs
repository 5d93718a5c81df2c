//! String and word-list functions.
//!
//! Make treats most values as whitespace-separated word lists; every helper
//! here follows that convention. `%`-pattern matching lives here too, shared
//! with substitution references and the rule table.

use itertools::Itertools;

use crate::error::{MakeError, Result};

/// Split a value into words.
pub fn split_words(text: &str) -> Vec<&str> {
    text.split_whitespace().collect()
}

/// Match `word` against a `%`-pattern, returning the stem.
///
/// The first `%` is the wildcard; a pattern without one matches only
/// exactly, with an empty stem.
#[must_use]
pub fn stem_of(pattern: &str, word: &str) -> Option<String> {
    match pattern.split_once('%') {
        None => (pattern == word).then(String::new),
        Some((prefix, suffix)) => {
            let rest = word.strip_prefix(prefix)?;
            let stem = rest.strip_suffix(suffix)?;
            Some(stem.to_owned())
        }
    }
}

/// Substitute `stem` for the first `%` of `replacement`.
#[must_use]
pub fn substitute_stem(replacement: &str, stem: &str) -> String {
    match replacement.split_once('%') {
        None => replacement.to_owned(),
        Some((prefix, suffix)) => format!("{prefix}{stem}{suffix}"),
    }
}

/// `patsubst`: rewrite each word matching `pattern` using `replacement`.
#[must_use]
pub fn patsubst_words(pattern: &str, replacement: &str, text: &str) -> String {
    split_words(text)
        .into_iter()
        .map(|word| match stem_of(pattern, word) {
            Some(stem) => substitute_stem(replacement, &stem),
            None => word.to_owned(),
        })
        .join(" ")
}

/// `subst`: literal text replacement, no word awareness.
#[must_use]
pub fn subst(from: &str, to: &str, text: &str) -> String {
    if from.is_empty() {
        return text.to_owned();
    }
    text.replace(from, to)
}

/// `strip`: collapse runs of whitespace and trim the ends.
#[must_use]
pub fn strip(text: &str) -> String {
    split_words(text).join(" ")
}

/// `findstring`: the needle when present, else empty.
#[must_use]
pub fn findstring(needle: &str, haystack: &str) -> String {
    if !needle.is_empty() && haystack.contains(needle) {
        needle.to_owned()
    } else {
        String::new()
    }
}

/// `filter` / `filter-out`: keep (or drop) words matching any pattern.
#[must_use]
pub fn filter(patterns: &str, text: &str, invert: bool) -> String {
    let patterns = split_words(patterns);
    split_words(text)
        .into_iter()
        .filter(|word| {
            let matched = patterns.iter().any(|p| stem_of(p, word).is_some());
            matched != invert
        })
        .join(" ")
}

/// `sort`: lexicographic order with duplicates removed.
#[must_use]
pub fn sort(text: &str) -> String {
    let mut words = split_words(text);
    words.sort_unstable();
    words.dedup();
    words.join(" ")
}

fn parse_index(name: &str, text: &str) -> Result<i64> {
    text.trim().parse().map_err(|_| MakeError::Expand {
        message: format!("non-numeric argument to '{name}': '{}'", text.trim()),
    })
}

/// `word`: the n-th word, 1-indexed.
pub fn word(index: &str, text: &str) -> Result<String> {
    let n = parse_index("word", index)?;
    if n < 1 {
        return Err(MakeError::Expand {
            message: format!("'word' index must be at least 1, got {n}"),
        });
    }
    let words = split_words(text);
    Ok(words
        .get(usize::try_from(n).unwrap_or(usize::MAX) - 1)
        .map(|w| (*w).to_owned())
        .unwrap_or_default())
}

/// `words`: the word count.
#[must_use]
pub fn words(text: &str) -> String {
    split_words(text).len().to_string()
}

/// `wordlist`: words `start..=end`, 1-indexed inclusive.
pub fn wordlist(start: &str, end: &str, text: &str) -> Result<String> {
    let s = parse_index("wordlist", start)?;
    let e = parse_index("wordlist", end)?;
    if s < 1 {
        return Err(MakeError::Expand {
            message: format!("'wordlist' start must be at least 1, got {s}"),
        });
    }
    let all = split_words(text);
    if e < s {
        return Ok(String::new());
    }
    let from = usize::try_from(s).unwrap_or(usize::MAX) - 1;
    let to = usize::try_from(e).unwrap_or(usize::MAX).min(all.len());
    if from >= all.len() {
        return Ok(String::new());
    }
    Ok(all[from..to].join(" "))
}

/// `firstword`.
#[must_use]
pub fn firstword(text: &str) -> String {
    text.split_whitespace().next().unwrap_or_default().to_owned()
}

/// `lastword`.
#[must_use]
pub fn lastword(text: &str) -> String {
    text.split_whitespace().last().unwrap_or_default().to_owned()
}

/// `join`: pairwise concatenation; the longer list's tail passes through.
#[must_use]
pub fn join(left: &str, right: &str) -> String {
    let lhs = split_words(left);
    let rhs = split_words(right);
    (0..lhs.len().max(rhs.len()))
        .map(|i| {
            format!(
                "{}{}",
                lhs.get(i).copied().unwrap_or_default(),
                rhs.get(i).copied().unwrap_or_default()
            )
        })
        .join(" ")
}

/// `addsuffix`.
#[must_use]
pub fn addsuffix(suffix: &str, text: &str) -> String {
    split_words(text)
        .into_iter()
        .map(|w| format!("{w}{suffix}"))
        .join(" ")
}

/// `addprefix`.
#[must_use]
pub fn addprefix(prefix: &str, text: &str) -> String {
    split_words(text)
        .into_iter()
        .map(|w| format!("{prefix}{w}"))
        .join(" ")
}
