//! Rule-header recognition: target list, colon kind, and the right side.

/// How the header's colon was written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColonKind {
    /// Plain `:`.
    Single,
    /// `::`, declaring an independent double-colon rule.
    Double,
    /// `&:`, declaring a grouped-target rule.
    Grouped,
}

/// A recognised rule header, still textual.
#[derive(Debug, PartialEq, Eq)]
pub struct RuleHeader {
    /// Target words before the colon, `&` marker removed.
    pub targets: String,
    /// Colon flavour.
    pub colon: ColonKind,
    /// Everything after the colon: prerequisites, possibly an inline
    /// assignment or a `;` recipe.
    pub rest: String,
}

/// Find the first top-level colon and split the line around it.
///
/// Colons inside `$(...)`/`${...}` do not count, and the assignment forms
/// `:=`, `::=`, `:::=` never reach here because assignment recognition runs
/// first.
#[must_use]
pub fn split_rule(line: &str) -> Option<RuleHeader> {
    let bytes = line.as_bytes();
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
            b':' if depth == 0 => {
                let (colon, after) = if bytes.get(i + 1) == Some(&b':') {
                    (ColonKind::Double, i + 2)
                } else {
                    (ColonKind::Single, i + 1)
                };
                let mut targets = line[..i].trim_end();
                let colon = if let Some(stripped) = targets.strip_suffix('&') {
                    targets = stripped.trim_end();
                    ColonKind::Grouped
                } else {
                    colon
                };
                return Some(RuleHeader {
                    targets: targets.to_owned(),
                    colon,
                    rest: line[after..].trim_start().to_owned(),
                });
            }
            _ => {}
        }
        i += 1;
    }
    None
}

/// Split `rest` at the first top-level `;`, peeling an inline recipe.
#[must_use]
pub fn split_inline_recipe(rest: &str) -> (String, Option<String>) {
    let bytes = rest.as_bytes();
    let mut depth = 0usize;
    for (i, &b) in bytes.iter().enumerate() {
        match b {
            b'(' | b'{' => depth += 1,
            b')' | b'}' => depth = depth.saturating_sub(1),
            b';' if depth == 0 => {
                return (
                    rest[..i].trim_end().to_owned(),
                    Some(rest[i + 1..].trim_start().to_owned()),
                );
            }
            _ => {}
        }
    }
    (rest.to_owned(), None)
}

/// Rewrite an old-style suffix rule target into its pattern form.
///
/// `.c.o` becomes `%.o : %.c` and a single `.c` becomes `% : %.c`, but only
/// when both suffixes are in the live suffix list.
#[must_use]
pub fn rewrite_suffix_rule(target: &str, suffixes: &[String]) -> Option<(String, String)> {
    if !target.starts_with('.') || target.contains('/') || target.contains('%') {
        return None;
    }
    let known = |s: &str| suffixes.iter().any(|k| k == s);
    // Try splitting into two known suffixes: `.src.dst`.
    for split in 2..target.len() {
        if target.as_bytes()[split] == b'.' {
            let (src, dst) = target.split_at(split);
            if known(src) && known(dst) {
                return Some((format!("%{dst}"), format!("%{src}")));
            }
        }
    }
    known(target).then(|| ("%".to_owned(), format!("%{target}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("all: dep1 dep2", "all", ColonKind::Single, "dep1 dep2")]
    #[case("log:: src", "log", ColonKind::Double, "src")]
    #[case("a b &: seed", "a b", ColonKind::Grouped, "seed")]
    #[case("out: ", "out", ColonKind::Single, "")]
    fn split_rule_recognises_colon_kinds(
        #[case] line: &str,
        #[case] targets: &str,
        #[case] colon: ColonKind,
        #[case] rest: &str,
    ) {
        let header = split_rule(line).expect("header");
        assert_eq!(header.targets, targets);
        assert_eq!(header.colon, colon);
        assert_eq!(header.rest, rest);
    }

    #[test]
    fn split_rule_skips_colons_inside_references() {
        let header = split_rule("$(OBJS:.c=.o): common.h").expect("header");
        assert_eq!(header.targets, "$(OBJS:.c=.o)");
        assert_eq!(header.rest, "common.h");
    }

    #[test]
    fn split_rule_rejects_plain_text() {
        assert!(split_rule("just some words").is_none());
    }

    #[test]
    fn split_inline_recipe_peels_after_semicolon() {
        let (prereqs, recipe) = split_inline_recipe("dep ; echo hi");
        assert_eq!(prereqs, "dep");
        assert_eq!(recipe.as_deref(), Some("echo hi"));
        let (prereqs, recipe) = split_inline_recipe("$(call f,a;b) dep");
        assert_eq!(prereqs, "$(call f,a;b) dep");
        assert_eq!(recipe, None);
    }

    #[rstest]
    #[case(".c.o", Some(("%.o", "%.c")))]
    #[case(".c", Some(("%", "%.c")))]
    #[case(".weird.o", None)]
    #[case("plain", None)]
    fn suffix_rules_rewrite_to_patterns(
        #[case] target: &str,
        #[case] expect: Option<(&str, &str)>,
    ) {
        let suffixes = vec![".o".to_owned(), ".c".to_owned()];
        let rewritten = rewrite_suffix_rule(target, &suffixes);
        assert_eq!(
            rewritten,
            expect.map(|(t, p)| (t.to_owned(), p.to_owned()))
        );
    }
}
