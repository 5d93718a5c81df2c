//! Recipe expansion and execution: line flags, automatic variables, the
//! child environment, and the actual shell dispatch.

use indexmap::IndexMap;
use itertools::Itertools;
use tracing::warn;

use crate::caps::{JobServer, OutputChunk, SpawnRequest, acquire};
use crate::error::{MakeError, Result};
use crate::expand::ExpandCtx;
use crate::funcs::strings::split_words;
use crate::run::{OutputSync, RunOptions};
use crate::vars::{Origin, VariableValue, Variables};

/// Leading recipe-line markers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LineFlags {
    /// `@`: do not echo.
    pub silent: bool,
    /// `-`: ignore a non-zero exit.
    pub ignore: bool,
    /// `+`: run even under dry-run.
    pub forced: bool,
}

/// Strip the `@`, `-`, `+` markers off an expanded recipe line.
#[must_use]
pub fn parse_flags(line: &str) -> (LineFlags, &str) {
    let mut flags = LineFlags::default();
    let mut rest = line;
    loop {
        rest = rest.trim_start();
        match rest.chars().next() {
            Some('@') if !flags.silent => flags.silent = true,
            Some('-') if !flags.ignore => flags.ignore = true,
            Some('+') if !flags.forced => flags.forced = true,
            _ => break,
        }
        rest = &rest[1..];
    }
    (flags, rest)
}

/// Whether a raw recipe line invokes a sub-make, forcing execution under
/// dry-run.
#[must_use]
pub fn references_make(raw_line: &str) -> bool {
    raw_line.contains("$(MAKE)") || raw_line.contains("${MAKE}")
}

fn dir_part(word: &str) -> &str {
    match word.rfind('/') {
        Some(0) => "/",
        Some(i) => &word[..i],
        None => ".",
    }
}

fn file_part(word: &str) -> &str {
    word.rsplit('/').next().unwrap_or(word)
}

/// Inputs for one recipe's automatic variables.
#[derive(Debug, Default)]
pub struct AutomaticInputs {
    /// All normal prerequisites, duplicates preserved (`$+`).
    pub all: Vec<String>,
    /// Prerequisites newer than the target (`$?`).
    pub newer: Vec<String>,
    /// Order-only prerequisites (`$|`).
    pub order_only: Vec<String>,
    /// The matched stem (`$*`).
    pub stem: Option<String>,
}

/// Build the automatic-variable overlay for a recipe scope.
#[must_use]
pub fn automatics(target: &str, inputs: &AutomaticInputs) -> Variables {
    let unique: Vec<&str> = inputs.all.iter().map(String::as_str).unique().collect();
    let pairs = [
        ("@", target.to_owned()),
        ("<", inputs.all.first().cloned().unwrap_or_default()),
        ("^", unique.iter().join(" ")),
        ("+", inputs.all.iter().join(" ")),
        ("?", inputs.newer.iter().join(" ")),
        ("|", inputs.order_only.iter().join(" ")),
        ("*", inputs.stem.clone().unwrap_or_default()),
    ];
    let mut overlay = Variables::new();
    for (name, value) in pairs {
        let dirs = split_words(&value).iter().map(|w| dir_part(w)).join(" ");
        let files = split_words(&value).iter().map(|w| file_part(w)).join(" ");
        overlay.insert(
            format!("{name}D"),
            VariableValue::text(dirs, Origin::Automatic, false),
        );
        overlay.insert(
            format!("{name}F"),
            VariableValue::text(files, Origin::Automatic, false),
        );
        overlay.insert(
            name.to_owned(),
            VariableValue::text(value, Origin::Automatic, false),
        );
    }
    overlay
}

fn exportable_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Assemble the child environment: exported globals, the visible scope
/// snapshot, and a bumped `MAKELEVEL`.
///
/// # Errors
///
/// Propagates expansion failures from recursive variable values.
pub fn export_environment(ctx: &mut ExpandCtx<'_>) -> Result<Vec<(String, String)>> {
    let export_all = ctx.state.export_all;
    let globals: Vec<(String, VariableValue)> = ctx
        .state
        .vars
        .iter()
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect();
    let mut env: IndexMap<String, String> = IndexMap::new();
    for (name, value) in globals {
        if !exportable_name(&name) || !should_export(&value, export_all) {
            continue;
        }
        env.insert(name.clone(), exported_text(ctx, &name, &value)?);
    }
    for (name, value) in ctx.scope.flatten() {
        if !exportable_name(&name) || !should_export(&value, export_all) {
            continue;
        }
        env.insert(name.clone(), exported_text(ctx, &name, &value)?);
    }
    env.insert(
        "MAKELEVEL".to_owned(),
        (ctx.state.make_level + 1).to_string(),
    );
    Ok(env.into_iter().collect())
}

fn should_export(value: &VariableValue, export_all: bool) -> bool {
    match value.export {
        Some(explicit) => explicit,
        None => {
            export_all
                || matches!(
                    value.origin,
                    Origin::Environment | Origin::EnvironmentOverride | Origin::CommandLine
                )
        }
    }
}

fn exported_text(
    ctx: &mut ExpandCtx<'_>,
    name: &str,
    value: &VariableValue,
) -> Result<String> {
    if value.recursive {
        ctx.expand(&format!("$({name})"))
    } else {
        match &value.payload {
            crate::vars::Payload::Text(text) => Ok(text.clone()),
            crate::vars::Payload::Computed(hook) => Ok(ctx.state.computed_text(*hook)),
        }
    }
}

/// Join expanded recipe lines into one script for `.ONESHELL`.
///
/// Each command runs in a subshell so a failure stops the script, except
/// ignore-flagged lines, which are neutralised with `|| :`.
#[must_use]
pub fn oneshell_script(lines: &[(LineFlags, String)]) -> String {
    lines
        .iter()
        .map(|(flags, text)| {
            if flags.ignore {
                format!("(({text}) || :)")
            } else {
                format!("({text})")
            }
        })
        .join(" && ")
}

/// Send `text` to the configured sink, or the process streams by default.
pub fn emit(opts: &RunOptions, text: &str, to_stderr: bool) {
    match &opts.output {
        Some(sink) => sink(text),
        None if to_stderr => eprint!("{text}"),
        None => print!("{text}"),
    }
}

/// Everything a spawn needs, captured while the engine state is locked so
/// the lock can be released before the shell blocks.
#[derive(Debug)]
pub struct PreparedSpawn {
    /// Interpreter from the recipe scope's `SHELL`.
    pub shell: String,
    /// Flag word from `.SHELLFLAGS`.
    pub shell_flags: String,
    /// Assembled child environment.
    pub env: Vec<(String, String)>,
    /// Working directory.
    pub cwd: camino::Utf8PathBuf,
}

/// Capture the shell, flags, environment, and cwd for a recipe scope.
///
/// # Errors
///
/// Propagates expansion failures from `SHELL`, `.SHELLFLAGS`, or exported
/// variable values.
pub fn prepare_spawn(ctx: &mut ExpandCtx<'_>) -> Result<PreparedSpawn> {
    Ok(PreparedSpawn {
        shell: ctx.expand("$(SHELL)")?,
        shell_flags: ctx.expand("$(.SHELLFLAGS)")?,
        env: export_environment(ctx)?,
        cwd: ctx.state.curdir.clone(),
    })
}

/// Run one command line through the shell under a jobserver slot.
///
/// The caller must not hold the engine state lock; the slot is claimed
/// just before the spawn and released on every path by its guard.
///
/// # Errors
///
/// Returns [`MakeError::Spawn`] when the interpreter cannot start; exit
/// codes are returned for the caller to police.
pub fn spawn_command(
    shell_cap: &dyn crate::caps::Shell,
    opts: &RunOptions,
    jobs: &dyn JobServer,
    target: &str,
    command: &str,
    prepared: &PreparedSpawn,
) -> Result<i32> {
    let request = SpawnRequest {
        command_line: command,
        cwd: &prepared.cwd,
        env: &prepared.env,
        shell: &prepared.shell,
        shell_flags: &prepared.shell_flags,
    };

    let buffer_whole = matches!(opts.output_sync, OutputSync::Target);
    let mut buffered = String::new();
    let slot = acquire(jobs);
    let code = shell_cap
        .spawn(&request, &mut |chunk| {
            let (text, to_stderr) = match chunk {
                OutputChunk::Stdout(text) => (text, false),
                OutputChunk::Stderr(text) => (text, true),
            };
            if buffer_whole {
                buffered.push_str(text);
            } else {
                emit(opts, text, to_stderr);
            }
        })
        .map_err(|source| MakeError::Spawn {
            target: target.to_owned(),
            source: std::sync::Arc::new(source),
        })?;
    drop(slot);
    if !buffered.is_empty() {
        emit(opts, &buffered, false);
    }
    Ok(code)
}

/// Report an ignored failure the way Make does.
pub fn note_ignored_failure(target: &str, code: i32) {
    warn!(
        target: "kumade::run",
        target_name = target,
        code,
        "recipe failure ignored"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("@echo hi", LineFlags { silent: true, ignore: false, forced: false }, "echo hi")]
    #[case("-rm -f x", LineFlags { silent: false, ignore: true, forced: false }, "rm -f x")]
    #[case("+touch x", LineFlags { silent: false, ignore: false, forced: true }, "touch x")]
    #[case("@-+cmd", LineFlags { silent: true, ignore: true, forced: true }, "cmd")]
    #[case("echo plain", LineFlags::default(), "echo plain")]
    fn parse_flags_strips_markers(
        #[case] line: &str,
        #[case] flags: LineFlags,
        #[case] rest: &str,
    ) {
        assert_eq!(parse_flags(line), (flags, rest));
    }

    #[test]
    fn parse_flags_keeps_second_dash_as_command() {
        // Only the first occurrence of each marker is a flag.
        let (flags, rest) = parse_flags("--version");
        assert!(flags.ignore);
        assert_eq!(rest, "-version");
    }

    #[test]
    fn automatics_dedupe_caret_but_not_plus() {
        let inputs = AutomaticInputs {
            all: vec!["a".into(), "b".into(), "a".into()],
            newer: vec!["b".into()],
            order_only: vec!["dir".into()],
            stem: Some("st".into()),
        };
        let vars = automatics("out/tgt", &inputs);
        let get = |n: &str| match &vars.get(n).expect(n).payload {
            crate::vars::Payload::Text(t) => t.clone(),
            crate::vars::Payload::Computed(_) => unreachable!(),
        };
        assert_eq!(get("@"), "out/tgt");
        assert_eq!(get("<"), "a");
        assert_eq!(get("^"), "a b");
        assert_eq!(get("+"), "a b a");
        assert_eq!(get("?"), "b");
        assert_eq!(get("|"), "dir");
        assert_eq!(get("*"), "st");
        assert_eq!(get("@D"), "out");
        assert_eq!(get("@F"), "tgt");
        assert_eq!(get("^D"), ". .");
    }

    #[test]
    fn oneshell_script_wraps_ignored_lines() {
        let lines = vec![
            (LineFlags::default(), "mkdir -p out".to_owned()),
            (
                LineFlags {
                    ignore: true,
                    ..LineFlags::default()
                },
                "rm out/stale".to_owned(),
            ),
            (LineFlags::default(), "gen out/f".to_owned()),
        ];
        assert_eq!(
            oneshell_script(&lines),
            "(mkdir -p out) && ((rm out/stale) || :) && (gen out/f)"
        );
    }
}
