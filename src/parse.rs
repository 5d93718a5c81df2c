//! Line-oriented makefile parser.
//!
//! Splits source text into logical lines (honouring continuations and the
//! recipe prefix), then recognises each as a recipe line, a conditional, an
//! assignment, a directive, or a rule header, writing results into the
//! engine state.

pub mod conditionals;
pub mod rule_header;

use camino::Utf8PathBuf;
use tracing::debug;

use crate::caps::Capabilities;
use crate::engine::EngineState;
use crate::error::{MakeError, Result, SourceLocation};
use crate::expand::ExpandCtx;
use crate::funcs::io as func_io;
use crate::funcs::strings::split_words;
use crate::rules::{RuleEntry, ScopeEntry, VpathEntry};
use crate::vars::{Origin, Payload, VariableValue};

use conditionals::{CondFrame, CondKind};
use rule_header::{ColonKind, RuleHeader};

/// The assignment operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignOp {
    /// `=`: recursive, stored raw.
    Recursive,
    /// `:=` / `::=`: simple, expanded once at assignment.
    Simple,
    /// `:::=`: expanded once, `$` re-escaped, stored recursive.
    Immediate,
    /// `?=`: recursive, only when unset.
    Conditional,
    /// `+=`: append following the current flavor.
    Append,
    /// `!=`: run through the shell, stored simple.
    Shell,
}

/// Parse `text` into `state`. `file` names the source for diagnostics and
/// is `None` for `eval`-style fragments.
///
/// # Errors
///
/// Returns a [`MakeError::Parse`] carrying file and line on malformed
/// input; no recovery is attempted.
pub fn parse_source(
    state: &mut EngineState,
    caps: &Capabilities,
    text: &str,
    file: Option<Utf8PathBuf>,
) -> Result<()> {
    Parser {
        ctx: ExpandCtx::new(state, caps),
        file,
        conds: Vec::new(),
        last_rule: None,
        define: None,
        skip_define: 0,
    }
    .run(text)
}

/// Install `name = value` without reading makefile syntax, used for
/// command-line variables.
///
/// # Errors
///
/// Propagates expansion failures (none occur for the recursive flavor, but
/// the signature matches the general assignment path).
pub fn apply_simple_assignment(
    ctx: &mut ExpandCtx<'_>,
    name: &str,
    value: &str,
    origin: Origin,
) -> Result<()> {
    apply_assignment(
        ctx,
        name,
        AssignOp::Recursive,
        value,
        origin,
        &Prefixes::default(),
        &SourceLocation::default(),
    )
}

#[derive(Debug, Default, Clone)]
struct Prefixes {
    override_: bool,
    private: bool,
    export: Option<bool>,
}

struct DefineAccumulator {
    name: String,
    op: AssignOp,
    prefixes: Prefixes,
    lines: Vec<String>,
    depth: usize,
    location: SourceLocation,
}

struct Parser<'a> {
    ctx: ExpandCtx<'a>,
    file: Option<Utf8PathBuf>,
    conds: Vec<CondFrame>,
    last_rule: Option<usize>,
    define: Option<DefineAccumulator>,
    skip_define: usize,
}

impl Parser<'_> {
    fn run(mut self, text: &str) -> Result<()> {
        let lines: Vec<&str> = text
            .split('\n')
            .map(|l| l.strip_suffix('\r').unwrap_or(l))
            .collect();
        let mut i = 0;
        while i < lines.len() {
            let start = i;
            let line = lines[i];
            i += 1;
            let location = self.location(start);

            if self.define.is_some() {
                self.define_line(line, &location)?;
                continue;
            }

            // Recipe lines come first: with a rule context open, anything
            // after the prefix belongs to the last rule verbatim.
            if self.last_rule.is_some()
                && let Some(rest) = self.strip_recipe_prefix(line)
            {
                let mut body = rest.to_owned();
                while trailing_backslashes(&body) % 2 == 1 && i < lines.len() {
                    let next = lines[i];
                    i += 1;
                    body.push('\n');
                    body.push_str(self.strip_recipe_prefix(next).unwrap_or(next));
                }
                if !self.active() {
                    continue;
                }
                if let Some(index) = self.last_rule {
                    self.ctx.state.entries[index].recipe.push(body);
                }
                continue;
            }

            let (logical, next) = assemble_logical(&lines, start);
            i = next;
            if logical.trim().is_empty() {
                continue;
            }
            self.logical_line(&logical, &location)?;
        }

        if let Some(define) = &self.define {
            return Err(MakeError::parse(
                define.location.clone(),
                "missing 'endef' for this 'define'",
            ));
        }
        if !self.conds.is_empty() {
            return Err(MakeError::parse(
                self.location(lines.len().saturating_sub(1)),
                "missing 'endif'",
            ));
        }
        Ok(())
    }

    fn location(&self, line_index: usize) -> SourceLocation {
        SourceLocation::new(self.file.clone(), u32::try_from(line_index + 1).unwrap_or(u32::MAX))
    }

    fn active(&self) -> bool {
        self.conds.iter().all(|frame| frame.active)
    }

    fn strip_recipe_prefix<'l>(&self, line: &'l str) -> Option<&'l str> {
        match self.ctx.state.recipe_prefix {
            Some(prefix) => line.strip_prefix(prefix),
            None => line
                .strip_prefix('\t')
                .or_else(|| line.strip_prefix("    ")),
        }
    }

    fn logical_line(&mut self, logical: &str, location: &SourceLocation) -> Result<()> {
        let trimmed = logical.trim();
        let word0 = trimmed.split_whitespace().next().unwrap_or_default();
        let rest = trimmed[word0.len()..].trim_start();

        if self.skip_define > 0 {
            match word0 {
                "define" => self.skip_define += 1,
                "endef" => self.skip_define -= 1,
                _ => {}
            }
            return Ok(());
        }

        if let Some(kind) = CondKind::from_word(word0) {
            let parent_active = self.active();
            let truth = if parent_active {
                conditionals::evaluate(&mut self.ctx, kind, rest, location)?
            } else {
                false
            };
            self.conds.push(CondFrame::open(parent_active, truth));
            return Ok(());
        }
        match word0 {
            "else" => return self.else_line(rest, location),
            "endif" => {
                return match self.conds.pop() {
                    Some(_) => Ok(()),
                    None => Err(MakeError::parse(location.clone(), "'endif' without conditional")),
                };
            }
            "endef" if self.active() => {
                return Err(MakeError::parse(location.clone(), "'endef' without 'define'"));
            }
            _ => {}
        }

        if !self.active() {
            if word0 == "define" {
                self.skip_define = 1;
            }
            return Ok(());
        }

        if self.try_assignment(trimmed, location)? {
            self.last_rule = None;
            return Ok(());
        }
        if self.try_directive(word0, rest, location)? {
            self.last_rule = None;
            return Ok(());
        }
        if let Some(header) = rule_header::split_rule(logical) {
            return self.rule_line(header, location.clone());
        }

        // Last resort: expand the whole line and retry rule recognition, so
        // headers hidden behind variables still parse.
        let expanded = self.ctx.expand(logical)?;
        if expanded.trim().is_empty() {
            return Ok(());
        }
        if let Some(header) = rule_header::split_rule(&expanded) {
            return self.rule_line(header, location.clone());
        }
        Err(MakeError::parse(location.clone(), "missing separator"))
    }

    fn else_line(&mut self, rest: &str, location: &SourceLocation) -> Result<()> {
        let Some(frame) = self.conds.last_mut() else {
            return Err(MakeError::parse(location.clone(), "'else' without conditional"));
        };
        if rest.is_empty() {
            return frame.enter_else(location);
        }
        let word = rest.split_whitespace().next().unwrap_or_default();
        let Some(kind) = CondKind::from_word(word) else {
            return Err(MakeError::parse(
                location.clone(),
                format!("expected a conditional after 'else', found '{word}'"),
            ));
        };
        let cond_rest = rest[word.len()..].trim_start().to_owned();
        let live = frame.parent_active && !frame.taken && !frame.else_seen;
        let truth = if live {
            conditionals::evaluate(&mut self.ctx, kind, &cond_rest, location)?
        } else {
            false
        };
        let frame = self
            .conds
            .last_mut()
            .expect("frame checked above");
        frame.enter_else_if(truth, location)
    }

    fn try_assignment(&mut self, line: &str, location: &SourceLocation) -> Result<bool> {
        let (prefixes, rest) = strip_prefixes(line);

        if let Some(body) = rest.strip_prefix("define")
            && (body.is_empty() || body.starts_with(char::is_whitespace))
        {
            let body = body.trim();
            let (name, op) = match find_operator(body) {
                Some((name_end, op, rhs_start)) if body[rhs_start..].trim().is_empty() => {
                    (body[..name_end].trim(), op)
                }
                Some(_) => {
                    return Err(MakeError::parse(
                        location.clone(),
                        "text after assignment operator in 'define'",
                    ));
                }
                None => (body, AssignOp::Recursive),
            };
            if name.is_empty() {
                return Err(MakeError::parse(location.clone(), "'define' without a name"));
            }
            self.define = Some(DefineAccumulator {
                name: name.to_owned(),
                op,
                prefixes,
                lines: Vec::new(),
                depth: 1,
                location: location.clone(),
            });
            return Ok(true);
        }

        if let Some((name_end, op, rhs_start)) = find_operator(rest) {
            let name = rest[..name_end].trim();
            if name.is_empty() || name.contains(char::is_whitespace) {
                return Ok(false);
            }
            let rhs = rest[rhs_start..].trim_start();
            let origin = if prefixes.override_ {
                Origin::Override
            } else {
                Origin::File
            };
            apply_assignment(&mut self.ctx, name, op, rhs, origin, &prefixes, location)?;
            return Ok(true);
        }

        // `export`/`unexport` without an assignment: flag names, or flip the
        // export-everything toggle when bare.
        if let Some(export) = prefixes.export
            && !prefixes.override_
            && !prefixes.private
        {
            let names = self.ctx.expand(rest)?;
            let names = split_words(&names);
            if names.is_empty() {
                self.ctx.state.export_all = export;
            } else {
                for name in names {
                    match self.ctx.state.vars.get_mut(name) {
                        Some(value) => value.export = Some(export),
                        None => {
                            let mut value = VariableValue::text("", Origin::Undefined, true);
                            value.export = Some(export);
                            self.ctx.state.vars.set(name, value);
                        }
                    }
                }
            }
            return Ok(true);
        }
        Ok(false)
    }

    fn try_directive(&mut self, word0: &str, rest: &str, location: &SourceLocation) -> Result<bool> {
        match word0 {
            "include" | "-include" | "sinclude" => {
                let optional = word0 != "include";
                let names = self.ctx.expand(rest)?;
                for name in split_words(&names) {
                    self.include_file(name, optional, location)?;
                }
                Ok(true)
            }
            "undefine" => {
                let names = self.ctx.expand(rest)?;
                for name in split_words(&names) {
                    self.ctx.state.vars.remove(name);
                }
                Ok(true)
            }
            "vpath" => {
                let text = self.ctx.expand(rest)?;
                self.vpath_directive(&text);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn include_file(&mut self, name: &str, optional: bool, location: &SourceLocation) -> Result<()> {
        let dirs = self.ctx.state.include_dirs.clone();
        match self.ctx.caps.includes.load(name, &dirs) {
            Ok((path, text)) => {
                debug!(target: "kumade::parse", file = %path, "reading included makefile");
                self.ctx.state.makefile_list.push(path.to_string());
                parse_source(self.ctx.state, self.ctx.caps, &text, Some(path))
            }
            Err(source) if optional => {
                self.ctx
                    .state
                    .deferred_includes
                    .push((name.to_owned(), location.clone()));
                debug!(target: "kumade::parse", name, %source, "optional include deferred");
                Ok(())
            }
            Err(source) => Err(MakeError::Include {
                location: location.clone(),
                path: name.to_owned(),
                source: std::sync::Arc::new(source),
            }),
        }
    }

    fn vpath_directive(&mut self, text: &str) {
        let words = split_words(text);
        match words.split_first() {
            None => self.ctx.state.vpaths.clear(),
            Some((pattern, [])) => {
                self.ctx.state.vpaths.retain(|entry| entry.pattern != *pattern);
            }
            Some((pattern, dirs)) => {
                let directories = dirs
                    .iter()
                    .flat_map(|d| d.split(':'))
                    .filter(|d| !d.is_empty())
                    .map(ToOwned::to_owned)
                    .collect();
                self.ctx.state.vpaths.push(VpathEntry {
                    pattern: (*pattern).to_owned(),
                    directories,
                });
            }
        }
    }

    fn rule_line(&mut self, header: RuleHeader, location: SourceLocation) -> Result<()> {
        let (rest, inline) = rule_header::split_inline_recipe(&header.rest);

        // A right-hand side that reads as an assignment installs a
        // target- or pattern-specific scope instead of a rule.
        let (scope_prefixes, scope_rest) = strip_prefixes(&rest);
        if let Some((name_end, op, rhs_start)) = find_operator(scope_rest) {
            let name = scope_rest[..name_end].trim();
            if !name.is_empty() && !name.contains(char::is_whitespace) {
                let rhs = scope_rest[rhs_start..].trim_start();
                let value =
                    scope_value(&mut self.ctx, name, op, rhs, &scope_prefixes, &location)?;
                if let Some(value) = value {
                    let name = self.ctx.expand(name)?.trim().to_owned();
                    self.ctx.state.scopes.push(ScopeEntry {
                        targets: header.targets,
                        name,
                        value,
                    });
                }
                return Ok(());
            }
        }

        let mut targets = header.targets;
        let mut prerequisites = rest;

        if targets.trim() == ".SUFFIXES" {
            let expanded = self.ctx.expand(&prerequisites)?;
            let words: Vec<String> = split_words(&expanded).into_iter().map(ToOwned::to_owned).collect();
            if words.is_empty() {
                self.ctx.state.suffixes.clear();
            } else {
                self.ctx.state.suffixes.extend(words);
            }
            return Ok(());
        }

        let rewrite = {
            let single = targets.trim();
            if prerequisites.is_empty() && !single.contains(char::is_whitespace) {
                rule_header::rewrite_suffix_rule(single, &self.ctx.state.suffixes)
            } else {
                None
            }
        };
        if let Some((pattern_target, pattern_prereq)) = rewrite {
            targets = pattern_target;
            prerequisites = pattern_prereq;
        }

        let expanded_targets = self.ctx.expand(&targets)?;
        if let Some(first) = expanded_targets.split_whitespace().next() {
            self.ctx.state.note_default_goal(first);
        }

        let entry = RuleEntry {
            targets,
            prerequisites,
            recipe: inline.map(|r| vec![r]).into_iter().flatten().collect(),
            double_colon: header.colon == ColonKind::Double,
            grouped: header.colon == ColonKind::Grouped,
            builtin: false,
            location,
        };
        self.ctx.state.entries.push(entry);
        self.last_rule = Some(self.ctx.state.entries.len() - 1);
        Ok(())
    }

    fn define_line(&mut self, line: &str, _location: &SourceLocation) -> Result<()> {
        let define = self.define.as_mut().expect("define mode checked by caller");
        let trimmed = line.trim();
        let word0 = trimmed.split_whitespace().next().unwrap_or_default();
        if word0 == "define" {
            define.depth += 1;
        } else if word0 == "endef" {
            define.depth -= 1;
            if define.depth == 0 {
                let define = self.define.take().expect("define mode");
                let value = define.lines.join("\n");
                if self.active() {
                    let origin = if define.prefixes.override_ {
                        Origin::Override
                    } else {
                        Origin::File
                    };
                    apply_assignment(
                        &mut self.ctx,
                        &define.name,
                        define.op,
                        &value,
                        origin,
                        &define.prefixes,
                        &define.location,
                    )?;
                }
                return Ok(());
            }
        }
        define.lines.push(line.to_owned());
        Ok(())
    }
}

/// Consume leading `override`/`private`/`export`/`unexport` words.
fn strip_prefixes(line: &str) -> (Prefixes, &str) {
    let mut prefixes = Prefixes::default();
    let mut rest = line.trim_start();
    loop {
        let word = rest.split_whitespace().next().unwrap_or_default();
        match word {
            "override" => prefixes.override_ = true,
            "private" => prefixes.private = true,
            "export" => prefixes.export = Some(true),
            "unexport" => prefixes.export = Some(false),
            _ => break,
        }
        rest = rest[word.len()..].trim_start();
    }
    (prefixes, rest)
}

/// Locate the first top-level assignment operator.
///
/// Returns `(name_end, op, rhs_start)`. A bare `:` means a rule header and
/// yields `None`.
fn find_operator(text: &str) -> Option<(usize, AssignOp, usize)> {
    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'$' if matches!(bytes.get(i + 1), Some(b'(' | b'{')) => {
                depth += 1;
                i += 2;
                continue;
            }
            b')' | b'}' => depth = depth.saturating_sub(1),
            _ if depth > 0 => {}
            b'=' => return Some((i, AssignOp::Recursive, i + 1)),
            b':' => {
                let rest = &text[i..];
                if rest.starts_with(":::=") {
                    return Some((i, AssignOp::Immediate, i + 4));
                }
                if rest.starts_with("::=") {
                    return Some((i, AssignOp::Simple, i + 3));
                }
                if rest.starts_with(":=") {
                    return Some((i, AssignOp::Simple, i + 2));
                }
                return None;
            }
            b'?' if bytes.get(i + 1) == Some(&b'=') => {
                return Some((i, AssignOp::Conditional, i + 2));
            }
            b'+' if bytes.get(i + 1) == Some(&b'=') => {
                return Some((i, AssignOp::Append, i + 2));
            }
            b'!' if bytes.get(i + 1) == Some(&b'=') => {
                return Some((i, AssignOp::Shell, i + 2));
            }
            _ => {}
        }
        i += 1;
    }
    None
}

/// Write one assignment into the global store, honouring the origin
/// precedence lattice and computed-variable backing fields.
fn apply_assignment(
    ctx: &mut ExpandCtx<'_>,
    raw_name: &str,
    op: AssignOp,
    rhs: &str,
    origin: Origin,
    prefixes: &Prefixes,
    location: &SourceLocation,
) -> Result<()> {
    let name = ctx.expand(raw_name)?.trim().to_owned();
    if name.is_empty() || name.contains(char::is_whitespace) {
        return Err(MakeError::parse(
            location.clone(),
            format!("invalid variable name '{name}'"),
        ));
    }

    let current = ctx.state.vars.get(&name).cloned();
    let mut write_origin = origin;
    if let Some(current) = &current {
        if current.origin == Origin::Undefined {
            // Placeholder from a bare `export NAME`; any assignment fills it.
        } else {
            match op {
                AssignOp::Conditional => return Ok(()),
                _ => match current.origin {
                    Origin::Override | Origin::CommandLine if origin != Origin::Override => {
                        debug!(
                            target: "kumade::parse",
                            name,
                            current = current.origin.as_str(),
                            "assignment shadowed by stronger origin"
                        );
                        return Ok(());
                    }
                    Origin::Environment | Origin::EnvironmentOverride => {
                        if origin == Origin::Override {
                            write_origin = Origin::EnvironmentOverride;
                        } else if origin == Origin::File && ctx.state.env_overrides {
                            debug!(
                                target: "kumade::parse",
                                name, "environment overrides file assignment"
                            );
                            return Ok(());
                        }
                    }
                    _ => {}
                },
            }
        }
    }

    let (text, recursive) = assigned_value(ctx, op, rhs, current.as_ref())?;

    if let Some(current) = &current
        && let Payload::Computed(hook) = current.payload
    {
        // Builtin-backed entries keep their descriptor; the write lands in
        // the backing field.
        let expanded = if recursive { ctx.expand(&text)? } else { text };
        ctx.state.computed_write(hook, &expanded);
        return Ok(());
    }

    let mut value = VariableValue::text(text, write_origin, recursive);
    value.private = prefixes.private;
    value.export = prefixes.export.or(current.and_then(|c| c.export));
    ctx.state.vars.set(name, value);
    Ok(())
}

/// Produce the stored text and flavor for one assignment.
fn assigned_value(
    ctx: &mut ExpandCtx<'_>,
    op: AssignOp,
    rhs: &str,
    current: Option<&VariableValue>,
) -> Result<(String, bool)> {
    match op {
        AssignOp::Recursive | AssignOp::Conditional => Ok((rhs.to_owned(), true)),
        AssignOp::Simple => Ok((ctx.expand(rhs)?, false)),
        AssignOp::Immediate => {
            let expanded = ctx.expand(rhs)?;
            Ok((expanded.replace('$', "$$"), true))
        }
        AssignOp::Shell => {
            let command = ctx.expand(rhs)?;
            let output = func_io::shell(ctx, &command)?;
            Ok((output, false))
        }
        AssignOp::Append => match current {
            None => Ok((rhs.to_owned(), true)),
            Some(current) => {
                let base = match &current.payload {
                    Payload::Text(text) => text.clone(),
                    Payload::Computed(hook) => ctx.state.computed_text(*hook),
                };
                if current.recursive {
                    Ok((format!("{base} {rhs}"), true))
                } else {
                    let expanded = ctx.expand(rhs)?;
                    Ok((format!("{base} {expanded}"), false))
                }
            }
        },
    }
}

/// Build the value record for a target- or pattern-specific assignment.
///
/// Returns `None` when the assignment should not install a scope entry
/// (a `?=` whose name is already defined).
fn scope_value(
    ctx: &mut ExpandCtx<'_>,
    raw_name: &str,
    op: AssignOp,
    rhs: &str,
    prefixes: &Prefixes,
    location: &SourceLocation,
) -> Result<Option<VariableValue>> {
    let name = ctx.expand(raw_name)?.trim().to_owned();
    if name.is_empty() {
        return Err(MakeError::parse(location.clone(), "scope assignment without a name"));
    }
    if op == AssignOp::Conditional && ctx.state.vars.get(&name).is_some() {
        return Ok(None);
    }
    let current = ctx.state.vars.get(&name).cloned();
    let (text, recursive) = assigned_value(ctx, op, rhs, current.as_ref())?;
    let origin = if prefixes.override_ {
        Origin::Override
    } else {
        Origin::File
    };
    let mut value = VariableValue::text(text, origin, recursive);
    value.private = prefixes.private;
    value.export = prefixes.export;
    Ok(Some(value))
}

/// Join continuation lines, stripping comments per physical line.
fn assemble_logical(lines: &[&str], start: usize) -> (String, usize) {
    let mut text = strip_comment(lines[start]);
    let mut i = start + 1;
    while trailing_backslashes(&text) % 2 == 1 && i <= lines.len() {
        text.pop();
        let next = if i < lines.len() {
            strip_comment(lines[i])
        } else {
            String::new()
        };
        i += 1;
        let trimmed_end = text.trim_end();
        text = if trimmed_end.is_empty() {
            next.trim_start().to_owned()
        } else {
            format!("{trimmed_end} {}", next.trim_start())
        };
        if i > lines.len() {
            break;
        }
    }
    (text, i.min(lines.len()))
}

fn trailing_backslashes(text: &str) -> usize {
    text.chars().rev().take_while(|&c| c == '\\').count()
}

/// Drop a `#` comment unless the `#` is escaped by an odd run of
/// backslashes, then unescape `\#`.
fn strip_comment(line: &str) -> String {
    let bytes = line.as_bytes();
    let mut cut = line.len();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' {
            i += 2;
            continue;
        }
        if bytes[i] == b'#' {
            cut = i;
            break;
        }
        i += 1;
    }
    line[..cut].replace("\\#", "#")
}
