//! Rule records, the post-parse rule table, and special-target sets.
//!
//! The parser appends textual [`RuleEntry`] records; at run start the table
//! expands their target and prerequisite strings once and indexes them into
//! exact rules, `%`-pattern rules, and match-anything rules, plus the
//! target- and pattern-specific variable scopes.

use std::collections::HashSet;

use indexmap::IndexMap;
use regex::Regex;
use tracing::{debug, warn};

use crate::error::{MakeError, Result, SourceLocation};
use crate::expand::ExpandCtx;
use crate::funcs::strings::{split_words, stem_of};
use crate::vars::{VariableValue, Variables};

/// Pseudo-prerequisite separating `.WAIT` scheduling segments.
pub const WAIT: &str = ".WAIT";

/// A rule header as parsed, before any expansion.
#[derive(Debug, Clone)]
pub struct RuleEntry {
    /// Raw target text; may hold several words and `%` patterns.
    pub targets: String,
    /// Raw prerequisite text; may hold `|` and `.WAIT`.
    pub prerequisites: String,
    /// Raw recipe lines in order.
    pub recipe: Vec<String>,
    /// Declared with `::`.
    pub double_colon: bool,
    /// Declared with `&:`: one recipe updates every target together.
    pub grouped: bool,
    /// Installed by the engine rather than a makefile.
    pub builtin: bool,
    /// Header position for diagnostics.
    pub location: SourceLocation,
}

/// A target- or pattern-specific variable assignment as parsed.
#[derive(Debug, Clone)]
pub struct ScopeEntry {
    /// Raw target text the scope is keyed by.
    pub targets: String,
    /// Variable name.
    pub name: String,
    /// Value record, already carrying flavor and flags.
    pub value: VariableValue,
}

/// One `vpath pattern dirs` mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VpathEntry {
    /// `%`-pattern selecting the file names this entry applies to.
    pub pattern: String,
    /// Directories to search, in order.
    pub directories: Vec<String>,
}

/// A resolved rule ready for the runner.
#[derive(Debug, Clone, Default)]
pub struct Rule {
    /// Every member of a grouped rule, in declaration order.
    pub targets: Option<Vec<String>>,
    /// Normal prerequisites, `.WAIT` sentinels included.
    pub prerequisites: Vec<String>,
    /// Order-only prerequisites.
    pub order_only: Vec<String>,
    /// Recipe lines, unexpanded.
    pub recipe: Option<Vec<String>>,
    /// Matched stem for pattern rules.
    pub stem: Option<String>,
    /// Run the recipe regardless of timestamps (a double-colon rule with
    /// no prerequisites).
    pub always_rebuild: bool,
    /// Terminal pattern rule (`::`): excluded from implicit chaining.
    pub terminal: bool,
    /// Header position for diagnostics.
    pub location: SourceLocation,
}

/// Exact-target lookup result: one rule, or the ordered double-colon list.
#[derive(Debug, Clone)]
pub enum TargetRules {
    /// Ordinary target.
    Single(Rule),
    /// Independent double-colon rules in declaration order.
    DoubleColon(Vec<Rule>),
}

/// An indexed `%`-pattern rule.
#[derive(Debug, Clone)]
pub struct PatternRule {
    /// The target patterns as written.
    pub patterns: Vec<String>,
    /// Anchored disjunction of the patterns, `%` captured as `(.*?)`.
    pub regex: Regex,
    /// Prerequisite patterns (stems substituted at resolution).
    pub prerequisites: Vec<String>,
    /// Order-only prerequisite patterns.
    pub order_only: Vec<String>,
    /// Recipe lines, unexpanded.
    pub recipe: Option<Vec<String>>,
    /// Declared with `::`: terminal, no chaining through it.
    pub terminal: bool,
    /// Declared with `&:`.
    pub grouped: bool,
    /// Header position for diagnostics.
    pub location: SourceLocation,
}

impl PatternRule {
    /// The stem when `target` matches any of the patterns.
    #[must_use]
    pub fn stem_for(&self, target: &str) -> Option<String> {
        let captures = self.regex.captures(target)?;
        (1..captures.len())
            .find_map(|i| captures.get(i))
            .map(|m| m.as_str().to_owned())
    }
}

/// Membership set for a special target's prerequisites.
///
/// A special target listed with no prerequisites applies universally.
#[derive(Debug, Clone, Default)]
pub struct NameSet {
    universal: bool,
    names: HashSet<String>,
}

impl NameSet {
    /// Record the prerequisites of one `.NAME:` header.
    pub fn record(&mut self, prereqs: &[String]) {
        if prereqs.is_empty() {
            self.universal = true;
        } else {
            self.names.extend(prereqs.iter().cloned());
        }
    }

    /// Whether `target` is covered.
    #[must_use]
    pub fn contains(&self, target: &str) -> bool {
        self.universal || self.names.contains(target)
    }

    /// Whether the special target appeared at all.
    #[must_use]
    pub fn active(&self) -> bool {
        self.universal || !self.names.is_empty()
    }
}

/// All recognised special targets.
#[derive(Debug, Clone, Default)]
pub struct SpecialTargets {
    pub phony: NameSet,
    pub precious: NameSet,
    pub intermediate: NameSet,
    pub notintermediate: NameSet,
    pub secondary: NameSet,
    pub second_expansion: NameSet,
    pub delete_on_error: NameSet,
    pub ignore: NameSet,
    pub low_resolution_time: NameSet,
    pub silent: NameSet,
    pub export_all_variables: NameSet,
    pub notparallel: NameSet,
    pub oneshell: NameSet,
    pub posix: NameSet,
}

impl SpecialTargets {
    /// Record a `.NAME: prereqs` header. Returns false when the name is not
    /// a recognised special target.
    pub fn record(&mut self, name: &str, prereqs: &[String]) -> bool {
        let set = match name {
            ".PHONY" => &mut self.phony,
            ".PRECIOUS" => &mut self.precious,
            ".INTERMEDIATE" => &mut self.intermediate,
            ".NOTINTERMEDIATE" => &mut self.notintermediate,
            ".SECONDARY" => &mut self.secondary,
            ".SECONDEXPANSION" => &mut self.second_expansion,
            ".DELETE_ON_ERROR" => &mut self.delete_on_error,
            ".IGNORE" => &mut self.ignore,
            ".LOW_RESOLUTION_TIME" => &mut self.low_resolution_time,
            ".SILENT" => &mut self.silent,
            ".EXPORT_ALL_VARIABLES" => &mut self.export_all_variables,
            ".NOTPARALLEL" => &mut self.notparallel,
            ".ONESHELL" => &mut self.oneshell,
            ".POSIX" => &mut self.posix,
            _ => return false,
        };
        set.record(prereqs);
        true
    }
}

/// Split an expanded prerequisite string at the lone `|` into normal and
/// order-only lists. `.WAIT` sentinels stay in the normal list.
#[must_use]
pub fn split_prerequisites(text: &str) -> (Vec<String>, Vec<String>) {
    let mut normal = Vec::new();
    let mut order_only = Vec::new();
    let mut after_pipe = false;
    for word in split_words(text) {
        if word == "|" && !after_pipe {
            after_pipe = true;
            continue;
        }
        if after_pipe {
            order_only.push(word.to_owned());
        } else {
            normal.push(word.to_owned());
        }
    }
    (normal, order_only)
}

/// Compile target patterns into one anchored disjunction.
fn compile_patterns(patterns: &[&str]) -> Result<Regex> {
    let alternatives: Vec<String> = patterns
        .iter()
        .map(|p| match p.split_once('%') {
            Some((prefix, suffix)) => {
                format!("{}(.*?){}", regex::escape(prefix), regex::escape(suffix))
            }
            None => regex::escape(p),
        })
        .collect();
    Regex::new(&format!("^(?:{})$", alternatives.join("|"))).map_err(|err| MakeError::Expand {
        message: format!("invalid pattern rule: {err}"),
    })
}

/// Post-parse index of every rule and scope, built once per run.
#[derive(Debug, Default)]
pub struct RuleTable {
    /// Exact target word to its rule(s).
    pub exact: IndexMap<String, TargetRules>,
    /// `%`-pattern rules in declaration order.
    pub patterns: Vec<PatternRule>,
    /// Rules whose target is exactly `%`.
    pub anything: Vec<PatternRule>,
    /// Target-specific variable scopes.
    pub exact_scopes: IndexMap<String, Variables>,
    /// Pattern-specific variable scopes in declaration order.
    pub pattern_scopes: Vec<(String, Variables)>,
    /// Extensions mentioned by any pattern-rule target, gating chain search.
    pub known_suffixes: HashSet<String>,
    /// Special-target membership.
    pub specials: SpecialTargets,
    /// The `.DEFAULT` recipe, applied to otherwise ruleless targets.
    pub default_rule: Option<Rule>,
}

impl RuleTable {
    /// Expand and index the parsed entries and scopes.
    ///
    /// # Errors
    ///
    /// Propagates expansion failures from target or prerequisite strings.
    pub fn build(ctx: &mut ExpandCtx<'_>) -> Result<Self> {
        let mut table = Self::default();
        let entries = ctx.state.entries.clone();
        for entry in &entries {
            table.index_entry(ctx, entry)?;
        }
        let scopes = ctx.state.scopes.clone();
        for scope in &scopes {
            table.index_scope(ctx, scope)?;
        }
        if table.specials.export_all_variables.active() {
            ctx.state.export_all = true;
        }
        debug!(
            target: "kumade::resolve",
            exact = table.exact.len(),
            patterns = table.patterns.len(),
            anything = table.anything.len(),
            "rule table built"
        );
        Ok(table)
    }

    fn index_entry(&mut self, ctx: &mut ExpandCtx<'_>, entry: &RuleEntry) -> Result<()> {
        let target_text = ctx.expand(&entry.targets)?;
        let targets: Vec<&str> = split_words(&target_text);
        if targets.is_empty() {
            return Ok(());
        }
        let prereq_text = ctx.expand(&entry.prerequisites)?;
        let (prereqs, order_only) = split_prerequisites(&prereq_text);

        if targets.len() == 1 && self.special_entry(targets[0], &prereqs, entry) {
            return Ok(());
        }

        let (pattern_targets, exact_targets): (Vec<&str>, Vec<&str>) =
            targets.iter().partition(|t| t.contains('%'));

        if !pattern_targets.is_empty() {
            self.index_pattern(entry, &pattern_targets, prereqs.clone(), order_only.clone())?;
        }
        if !exact_targets.is_empty() {
            self.index_exact(entry, &exact_targets, prereqs, order_only);
        }
        Ok(())
    }

    fn special_entry(&mut self, target: &str, prereqs: &[String], entry: &RuleEntry) -> bool {
        if target == ".DEFAULT" {
            self.default_rule = Some(Rule {
                recipe: (!entry.recipe.is_empty()).then(|| entry.recipe.clone()),
                location: entry.location.clone(),
                ..Rule::default()
            });
            return true;
        }
        self.specials.record(target, prereqs)
    }

    fn index_pattern(
        &mut self,
        entry: &RuleEntry,
        patterns: &[&str],
        prerequisites: Vec<String>,
        order_only: Vec<String>,
    ) -> Result<()> {
        let rule = PatternRule {
            patterns: patterns.iter().map(|&p| p.to_owned()).collect(),
            regex: compile_patterns(patterns)?,
            prerequisites,
            order_only,
            recipe: (!entry.recipe.is_empty()).then(|| entry.recipe.clone()),
            terminal: entry.double_colon,
            grouped: entry.grouped,
            location: entry.location.clone(),
        };
        for pattern in patterns {
            if let Some(suffix) = pattern_extension(pattern) {
                self.known_suffixes.insert(suffix);
            }
        }
        if patterns.iter().all(|&p| p == "%") {
            self.anything.push(rule);
        } else {
            self.patterns.push(rule);
        }
        Ok(())
    }

    fn index_exact(
        &mut self,
        entry: &RuleEntry,
        targets: &[&str],
        prerequisites: Vec<String>,
        order_only: Vec<String>,
    ) {
        let group: Option<Vec<String>> = entry
            .grouped
            .then(|| targets.iter().map(|&t| t.to_owned()).collect());
        for &target in targets {
            let rule = Rule {
                targets: group.clone(),
                prerequisites: prerequisites.clone(),
                order_only: order_only.clone(),
                recipe: (!entry.recipe.is_empty()).then(|| entry.recipe.clone()),
                stem: None,
                always_rebuild: entry.double_colon && prerequisites.is_empty(),
                terminal: false,
                location: entry.location.clone(),
            };
            self.merge_exact(target, rule, entry.double_colon);
        }
    }

    fn merge_exact(&mut self, target: &str, rule: Rule, double_colon: bool) {
        match self.exact.get_mut(target) {
            None => {
                let rules = if double_colon {
                    TargetRules::DoubleColon(vec![rule])
                } else {
                    TargetRules::Single(rule)
                };
                self.exact.insert(target.to_owned(), rules);
            }
            Some(TargetRules::DoubleColon(list)) if double_colon => list.push(rule),
            Some(TargetRules::DoubleColon(list)) => {
                warn!(
                    target: "kumade::parse",
                    target_name = target,
                    "single-colon header for a double-colon target ignored"
                );
                if let Some(first) = list.first_mut() {
                    first.prerequisites.extend(rule.prerequisites);
                }
            }
            Some(TargetRules::Single(existing)) if double_colon => {
                warn!(
                    target: "kumade::parse",
                    target_name = target,
                    "double-colon header for a single-colon target ignored"
                );
                existing.prerequisites.extend(rule.prerequisites);
            }
            Some(TargetRules::Single(existing)) => {
                // Additional headers accumulate prerequisites; only one may
                // carry a recipe.
                existing.prerequisites.extend(rule.prerequisites);
                existing.order_only.extend(rule.order_only);
                if rule.recipe.is_some() {
                    if existing.recipe.is_some() {
                        warn!(
                            target: "kumade::parse",
                            target_name = target,
                            location = %rule.location,
                            "overriding recipe for target"
                        );
                    }
                    existing.recipe = rule.recipe;
                    existing.location = rule.location;
                }
                if rule.targets.is_some() {
                    existing.targets = rule.targets;
                }
            }
        }
    }

    fn index_scope(&mut self, ctx: &mut ExpandCtx<'_>, scope: &ScopeEntry) -> Result<()> {
        let targets = ctx.expand(&scope.targets)?;
        for word in split_words(&targets) {
            if word.contains('%') {
                match self
                    .pattern_scopes
                    .iter_mut()
                    .find(|(pattern, _)| pattern == word)
                {
                    Some((_, vars)) => {
                        vars.insert(scope.name.clone(), scope.value.clone());
                    }
                    None => {
                        let mut vars = Variables::new();
                        vars.insert(scope.name.clone(), scope.value.clone());
                        self.pattern_scopes.push((word.to_owned(), vars));
                    }
                }
            } else {
                self.exact_scopes
                    .entry(word.to_owned())
                    .or_default()
                    .insert(scope.name.clone(), scope.value.clone());
            }
        }
        Ok(())
    }

    /// Merge the scopes applying to `target`, pattern entries first so the
    /// exact scope wins on conflicts.
    #[must_use]
    pub fn scope_for(&self, target: &str) -> Variables {
        let mut merged = Variables::new();
        for (pattern, vars) in &self.pattern_scopes {
            if stem_of(pattern, target).is_some() {
                for (name, value) in vars {
                    merged.insert(name.clone(), value.clone());
                }
            }
        }
        if let Some(vars) = self.exact_scopes.get(target) {
            for (name, value) in vars {
                merged.insert(name.clone(), value.clone());
            }
        }
        merged
    }
}

fn pattern_extension(pattern: &str) -> Option<String> {
    let tail = pattern.rsplit('%').next()?;
    tail.rfind('.').map(|i| tail[i..].to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{Result, ensure};
    use rstest::rstest;

    #[test]
    fn split_prerequisites_peels_order_only() {
        let (normal, order) = split_prerequisites("a b | c d");
        assert_eq!(normal, vec!["a", "b"]);
        assert_eq!(order, vec!["c", "d"]);
    }

    #[test]
    fn split_prerequisites_keeps_wait_sentinels() {
        let (normal, order) = split_prerequisites("a .WAIT b");
        assert_eq!(normal, vec!["a", ".WAIT", "b"]);
        assert!(order.is_empty());
    }

    #[rstest]
    #[case(&["%.o"], "foo.o", Some("foo"))]
    #[case(&["%.o"], "foo.c", None)]
    #[case(&["lib%.a", "%.so"], "libz.a", Some("z"))]
    #[case(&["lib%.a", "%.so"], "z.so", Some("z"))]
    fn pattern_rule_disjunction_captures_stem(
        #[case] patterns: &[&str],
        #[case] target: &str,
        #[case] stem: Option<&str>,
    ) -> Result<()> {
        let rule = PatternRule {
            patterns: patterns.iter().map(|&p| p.to_owned()).collect(),
            regex: compile_patterns(patterns)?,
            prerequisites: Vec::new(),
            order_only: Vec::new(),
            recipe: None,
            terminal: false,
            grouped: false,
            location: SourceLocation::default(),
        };
        ensure!(
            rule.stem_for(target).as_deref() == stem,
            "expected stem {stem:?} for {target} against {patterns:?}",
        );
        Ok(())
    }

    #[test]
    fn name_set_with_no_prereqs_is_universal() {
        let mut set = NameSet::default();
        set.record(&[]);
        assert!(set.contains("anything"));
        let mut listed = NameSet::default();
        listed.record(&["a".into()]);
        assert!(listed.contains("a"));
        assert!(!listed.contains("b"));
    }

    #[test]
    fn special_targets_recognise_known_names_only() {
        let mut specials = SpecialTargets::default();
        assert!(specials.record(".PHONY", &["all".into()]));
        assert!(!specials.record("all", &[]));
        assert!(specials.phony.contains("all"));
    }
}
