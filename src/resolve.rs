//! Rule resolution: exact and pattern lookup, stem selection, and the
//! implicit-chain search.

use tracing::debug;

use crate::caps::FileSystem;
use crate::funcs::strings::substitute_stem;
use crate::rules::{PatternRule, Rule, RuleTable, TargetRules};

/// Chain searches deeper than this give up rather than loop.
const MAX_CHAIN_DEPTH: u32 = 16;

/// What a target resolves to.
#[derive(Debug, Clone)]
pub enum Resolution {
    /// A single effective rule (possibly with no recipe).
    Single(Rule),
    /// The ordered double-colon rules.
    DoubleColon(Vec<Rule>),
}

/// Resolves targets against a built [`RuleTable`].
pub struct Resolver<'a> {
    table: &'a RuleTable,
    fs: &'a dyn FileSystem,
}

impl<'a> Resolver<'a> {
    /// A resolver over `table` using `fs` for existence checks.
    #[must_use]
    pub fn new(table: &'a RuleTable, fs: &'a dyn FileSystem) -> Self {
        Self { table, fs }
    }

    /// Choose the rule for `target`, merging prerequisites-only
    /// contributions into the recipe-bearing rule.
    #[must_use]
    pub fn get_rule(&self, target: &str) -> Option<Resolution> {
        if let Some(TargetRules::DoubleColon(list)) = self.table.exact.get(target) {
            return Some(Resolution::DoubleColon(list.clone()));
        }

        let mut base = Rule::default();
        let mut contributed = false;

        if let Some(TargetRules::Single(exact)) = self.table.exact.get(target) {
            base = exact.clone();
            contributed = true;
        }

        // Recipeless pattern rules matching the target contribute their
        // prerequisites unconditionally.
        for pattern in self.table.patterns.iter().chain(&self.table.anything) {
            if pattern.recipe.is_some() {
                continue;
            }
            if let Some(stem) = pattern.stem_for(target) {
                contributed = true;
                base.prerequisites
                    .extend(concretise(&pattern.prerequisites, &stem));
                base.order_only.extend(concretise(&pattern.order_only, &stem));
            }
        }

        if base.recipe.is_none() {
            if let Some(found) = self.find_pattern(target, 0) {
                base.recipe = found.recipe;
                base.stem = found.stem;
                base.terminal = found.terminal;
                base.targets = found.targets.or(base.targets);
                base.location = found.location;
                base.prerequisites.extend(found.prerequisites);
                base.order_only.extend(found.order_only);
                contributed = true;
            } else if let Some(default_rule) = &self.table.default_rule
                && !contributed
                && !self.fs.exists(target)
            {
                base.recipe = default_rule.recipe.clone();
                contributed = true;
            }
        }

        contributed.then_some(Resolution::Single(base))
    }

    /// Find the recipe-bearing pattern rule for `target`.
    ///
    /// Candidates are ordered shortest stem first (declaration order breaks
    /// ties), with match-anything rules appended last. The first candidate
    /// whose prerequisites need no missing intermediates wins; otherwise a
    /// chain search runs over the non-terminal candidates.
    fn find_pattern(&self, target: &str, depth: u32) -> Option<Rule> {
        if depth > MAX_CHAIN_DEPTH {
            return None;
        }
        let mut candidates: Vec<(String, &PatternRule)> = self
            .table
            .patterns
            .iter()
            .filter(|p| p.recipe.is_some())
            .filter_map(|p| p.stem_for(target).map(|stem| (stem, p)))
            .collect();
        candidates.sort_by_key(|(stem, _)| stem.len());
        for anything in &self.table.anything {
            if anything.recipe.is_some() {
                candidates.push((target.to_owned(), anything));
            }
        }

        for (stem, pattern) in &candidates {
            let missing = self.missing_intermediates(pattern, stem);
            if missing.is_empty() {
                return Some(materialise(pattern, stem));
            }
        }

        // Chain search. Targets of a known suffix may chain through
        // ordinary pattern rules but never through match-anything rules;
        // terminal rules neither chain nor make intermediates.
        let ordinary = candidates.len() - self.table.anything.iter().filter(|p| p.recipe.is_some()).count();
        let chain_candidates = if self.known_type(target) {
            &candidates[..ordinary]
        } else {
            &candidates[..]
        };
        for (stem, pattern) in chain_candidates {
            if pattern.terminal {
                continue;
            }
            let missing = self.missing_intermediates(pattern, stem);
            let chainable = missing.iter().all(|intermediate| {
                self.find_pattern(intermediate, depth + 1)
                    .is_some_and(|rule| !rule.terminal)
            });
            if chainable {
                debug!(
                    target: "kumade::resolve",
                    target_name = target,
                    via = ?missing,
                    "implicit chain selected"
                );
                return Some(materialise(pattern, stem));
            }
        }
        None
    }

    /// Concrete prerequisites that neither have a rule nor exist on disk.
    ///
    /// Words still holding `$` await second expansion and cannot be judged
    /// here, so they never count as missing.
    fn missing_intermediates(&self, pattern: &PatternRule, stem: &str) -> Vec<String> {
        concretise(&pattern.prerequisites, stem)
            .into_iter()
            .filter(|p| p != crate::rules::WAIT && !p.contains('$'))
            .filter(|p| !self.table.exact.contains_key(p.as_str()) && !self.fs.exists(p))
            .collect()
    }

    fn known_type(&self, target: &str) -> bool {
        target
            .rfind('.')
            .is_some_and(|i| self.table.known_suffixes.contains(&target[i..]))
    }
}

/// Substitute `stem` into a pattern's prerequisite words.
fn concretise(patterns: &[String], stem: &str) -> Vec<String> {
    patterns
        .iter()
        .map(|p| substitute_stem(p, stem))
        .collect()
}

fn materialise(pattern: &PatternRule, stem: &str) -> Rule {
    let targets = pattern.grouped.then(|| {
        pattern
            .patterns
            .iter()
            .map(|p| substitute_stem(p, stem))
            .collect()
    });
    Rule {
        targets,
        prerequisites: concretise(&pattern.prerequisites, stem),
        order_only: concretise(&pattern.order_only, stem),
        recipe: pattern.recipe.clone(),
        stem: Some(stem.to_owned()),
        always_rebuild: false,
        terminal: pattern.terminal,
        location: pattern.location.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::caps::Capabilities;
    use crate::engine::Engine;
    use crate::expand::ExpandCtx;

    struct ListedFs(Vec<&'static str>);

    impl FileSystem for ListedFs {
        fn timestamp(&self, path: &str) -> i64 {
            if self.0.contains(&path) { 10 } else { 0 }
        }
        fn timestamp_symlink(&self, path: &str) -> i64 {
            self.timestamp(path)
        }
        fn read_file(&self, _: &str) -> std::io::Result<String> {
            unimplemented!()
        }
        fn write_file(&self, _: &str, _: &str, _: bool) -> std::io::Result<()> {
            unimplemented!()
        }
        fn unlink(&self, _: &str) -> std::io::Result<()> {
            unimplemented!()
        }
        fn touch(&self, _: &str) -> std::io::Result<()> {
            unimplemented!()
        }
        fn realpath(&self, _: &str) -> Option<String> {
            None
        }
        fn glob(&self, _: &str, _: &camino::Utf8Path) -> Vec<String> {
            Vec::new()
        }
    }

    fn table_for(makefile: &str) -> RuleTable {
        let engine = Engine::new(Capabilities::host());
        engine.parse_str(makefile, None).expect("parse");
        let mut state = engine.lock_state();
        let caps = Capabilities::host();
        let mut ctx = ExpandCtx::new(&mut state, &caps);
        RuleTable::build(&mut ctx).expect("table")
    }

    fn single(resolution: Resolution) -> Rule {
        match resolution {
            Resolution::Single(rule) => rule,
            Resolution::DoubleColon(_) => panic!("expected a single rule"),
        }
    }

    #[test]
    fn exact_rule_wins_over_patterns() {
        let table = table_for("foo.o: special.c\n\tcc special\n%.o: %.c\n\tcc generic\n");
        let fs = ListedFs(vec!["special.c", "foo.c"]);
        let rule = single(Resolver::new(&table, &fs).get_rule("foo.o").expect("rule"));
        assert_eq!(rule.recipe.expect("recipe"), vec!["cc special"]);
    }

    #[test]
    fn shortest_stem_wins() {
        let table = table_for("%.o: %.c\n\tgeneric\nlib%.o: lib%.c\n\tspecific\n");
        let fs = ListedFs(vec!["libz.c"]);
        let rule = single(Resolver::new(&table, &fs).get_rule("libz.o").expect("rule"));
        // Stem "z" (via lib%.o) beats stem "libz" (via %.o).
        assert_eq!(rule.stem.as_deref(), Some("z"));
        assert_eq!(rule.recipe.expect("recipe"), vec!["specific"]);
    }

    #[test]
    fn declaration_order_breaks_stem_ties() {
        let table = table_for("%.x: first.src\n\tfirst\n%.x: second.src\n\tsecond\n");
        let fs = ListedFs(vec!["first.src", "second.src"]);
        let rule = single(Resolver::new(&table, &fs).get_rule("a.x").expect("rule"));
        assert_eq!(rule.recipe.expect("recipe"), vec!["first"]);
    }

    #[test]
    fn prereqless_exact_headers_contribute_to_pattern_rule() {
        let table = table_for("foo.o: extra.h\n%.o: %.c\n\tcc\n");
        let fs = ListedFs(vec!["foo.c", "extra.h"]);
        let rule = single(Resolver::new(&table, &fs).get_rule("foo.o").expect("rule"));
        assert!(rule.prerequisites.contains(&"extra.h".to_owned()));
        assert!(rule.prerequisites.contains(&"foo.c".to_owned()));
        assert_eq!(rule.recipe.expect("recipe"), vec!["cc"]);
    }

    #[test]
    fn implicit_chain_builds_through_missing_intermediates() {
        let table = table_for("%.o: %.c\n\tcompile\n%.c: %.y\n\tyacc\n");
        let fs = ListedFs(vec!["foo.y"]);
        let rule = single(Resolver::new(&table, &fs).get_rule("foo.o").expect("rule"));
        assert_eq!(rule.prerequisites, vec!["foo.c"]);
        assert_eq!(rule.recipe.expect("recipe"), vec!["compile"]);
    }

    #[test]
    fn terminal_rules_do_not_make_intermediates() {
        let table = table_for("%.o: %.c\n\tcompile\n%.c:: %.y\n\tyacc\n");
        let fs = ListedFs(vec!["foo.y"]);
        let resolver = Resolver::new(&table, &fs);
        // Requested directly, the terminal rule applies (foo.y exists)...
        let rule = single(resolver.get_rule("foo.c").expect("rule"));
        assert!(rule.terminal);
        // ...but foo.c may not be made as an intermediate for foo.o.
        assert!(resolver.get_rule("foo.o").is_none());
    }

    #[test]
    fn known_suffix_does_not_chain_through_anything_rules() {
        let table = table_for("%.o: %.c\n\tcc\n%: %.src\n\tgen $@\n");
        let fs = ListedFs(vec!["README.src"]);
        let resolver = Resolver::new(&table, &fs);
        // foo.o has a known suffix: no direct rule applies (foo.c and
        // foo.o.src are both absent) and the match-anything rule is barred.
        assert!(resolver.get_rule("foo.o").is_none());
        // A name with no known suffix uses the match-anything rule.
        let rule = single(resolver.get_rule("README").expect("rule"));
        assert_eq!(rule.stem.as_deref(), Some("README"));
        assert_eq!(rule.prerequisites, vec!["README.src"]);
    }

    #[test]
    fn double_colon_rules_resolve_as_a_list() {
        let table = table_for("log:: a\n\tone\nlog:: b\n\ttwo\n");
        let fs = ListedFs(vec!["a", "b"]);
        match Resolver::new(&table, &fs).get_rule("log").expect("rules") {
            Resolution::DoubleColon(list) => {
                assert_eq!(list.len(), 2);
                assert_eq!(list[0].recipe.as_ref().expect("r"), &vec!["one".to_owned()]);
                assert_eq!(list[1].recipe.as_ref().expect("r"), &vec!["two".to_owned()]);
            }
            Resolution::Single(_) => panic!("expected double-colon rules"),
        }
    }

    #[test]
    fn grouped_pattern_rules_concretise_all_targets() {
        let table = table_for("%.tab.c %.tab.h &: %.y\n\tbison $<\n");
        let fs = ListedFs(vec!["parse.y"]);
        let rule = single(
            Resolver::new(&table, &fs)
                .get_rule("parse.tab.c")
                .expect("rule"),
        );
        assert_eq!(
            rule.targets.expect("group"),
            vec!["parse.tab.c", "parse.tab.h"]
        );
    }
}
