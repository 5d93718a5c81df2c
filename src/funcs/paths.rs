//! Path functions.
//!
//! All of these are word-wise. `realpath` and `wildcard` consult the
//! injected filesystem; `abspath` is purely lexical.

use camino::{Utf8Component, Utf8Path, Utf8PathBuf};
use itertools::Itertools;

use super::strings::split_words;
use crate::expand::ExpandCtx;

/// `dir`: everything up to and including the last slash, or `./`.
#[must_use]
pub fn dir(text: &str) -> String {
    split_words(text)
        .into_iter()
        .map(|word| match word.rfind('/') {
            Some(i) => word[..=i].to_owned(),
            None => "./".to_owned(),
        })
        .join(" ")
}

/// `notdir`: everything after the last slash.
#[must_use]
pub fn notdir(text: &str) -> String {
    split_words(text)
        .into_iter()
        .map(|word| word.rsplit('/').next().unwrap_or(word))
        .join(" ")
}

/// `suffix`: the last extension including the dot; extensionless words
/// contribute nothing.
#[must_use]
pub fn suffix(text: &str) -> String {
    split_words(text)
        .into_iter()
        .filter_map(|word| {
            let name = word.rsplit('/').next().unwrap_or(word);
            name.rfind('.').map(|i| &name[i..])
        })
        .join(" ")
}

/// `basename`: each word with its last extension removed.
#[must_use]
pub fn basename(text: &str) -> String {
    split_words(text)
        .into_iter()
        .map(|word| {
            let name_start = word.rfind('/').map_or(0, |i| i + 1);
            match word[name_start..].rfind('.') {
                Some(i) => &word[..name_start + i],
                None => word,
            }
        })
        .join(" ")
}

/// `realpath`: canonical path of each word that exists; the rest drop out.
#[must_use]
pub fn realpath(ctx: &mut ExpandCtx<'_>, text: &str) -> String {
    let curdir = ctx.state.curdir.clone();
    split_words(text)
        .into_iter()
        .filter_map(|word| ctx.caps.fs.realpath(&absolute(&curdir, word)))
        .join(" ")
}

/// `abspath`: lexically absolute form of each word. `.` and `..` collapse
/// without consulting the filesystem, so symlinks are not resolved.
#[must_use]
pub fn abspath(ctx: &mut ExpandCtx<'_>, text: &str) -> String {
    let curdir = ctx.state.curdir.clone();
    split_words(text)
        .into_iter()
        .map(|word| absolute(&curdir, word))
        .join(" ")
}

/// `wildcard`: glob each pattern relative to `CURDIR`.
#[must_use]
pub fn wildcard(ctx: &mut ExpandCtx<'_>, text: &str) -> String {
    let curdir = ctx.state.curdir.clone();
    split_words(text)
        .into_iter()
        .flat_map(|pattern| ctx.caps.fs.glob(pattern, &curdir))
        .join(" ")
}

fn absolute(curdir: &Utf8Path, word: &str) -> String {
    let path = Utf8Path::new(word);
    let joined = if path.is_absolute() {
        path.to_owned()
    } else {
        curdir.join(path)
    };
    let mut out = Utf8PathBuf::new();
    for component in joined.components() {
        match component {
            Utf8Component::CurDir => {}
            Utf8Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_str()),
        }
    }
    out.into_string()
}
