// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::Path;

/// One parsed `.gitignore` rule.
#[derive(Debug, Clone)]
struct Rule {
    /// Pattern segments; `**` is a segment of its own.
    segments: Vec<String>,
    /// `!pattern` re-includes a previously excluded path.
    negated: bool,
    /// `pattern/` matches directories only.
    dir_only: bool,
    /// Patterns containing a slash (or starting with one) match from the
    /// working-directory root; others match any path's final segment.
    anchored: bool,
}

/// Rules parsed from the `.gitignore` at the working-directory root.
///
/// Evaluation follows git: the **last** matching rule wins, negation can
/// re-include, directory-only rules never match files, and a path is ignored
/// when it matches or any ancestor directory matches as a directory.
#[derive(Debug, Default)]
pub struct Gitignore {
    rules: Vec<Rule>,
}

impl Gitignore {
    pub fn parse(text: &str) -> Self {
        let rules = text.lines().filter_map(parse_rule).collect();
        Self { rules }
    }

    /// Load from `<workdir>/.gitignore`; a missing file yields no rules.
    pub fn from_workdir(workdir: &Path) -> Self {
        match std::fs::read_to_string(workdir.join(".gitignore")) {
            Ok(text) => Self::parse(&text),
            Err(_) => Self::default(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Whether the working-directory-relative path is ignored.
    pub fn is_ignored(&self, rel_path: &str, is_dir: bool) -> bool {
        let rel_path = rel_path.trim_matches('/');
        if rel_path.is_empty() {
            return false;
        }
        let parts: Vec<&str> = rel_path.split('/').collect();

        // An ignored ancestor directory ignores the whole subtree; negation
        // deeper down cannot re-include it.
        for end in 1..parts.len() {
            let ancestor = parts[..end].join("/");
            if self.decide(&ancestor, true) == Some(true) {
                return true;
            }
        }
        self.decide(rel_path, is_dir).unwrap_or(false)
    }

    /// Last-matching-rule decision for one exact path: Some(true) = ignored,
    /// Some(false) = re-included, None = no rule matched.
    fn decide(&self, rel_path: &str, is_dir: bool) -> Option<bool> {
        let parts: Vec<&str> = rel_path.split('/').collect();
        let mut verdict = None;
        for rule in &self.rules {
            if rule.dir_only && !is_dir {
                continue;
            }
            let hit = if rule.anchored {
                segments_match(&rule.segments, &parts)
            } else {
                // unanchored single-segment patterns match the final segment
                parts
                    .last()
                    .is_some_and(|last| glob_match(&rule.segments[0], last))
            };
            if hit {
                verdict = Some(!rule.negated);
            }
        }
        verdict
    }
}

fn parse_rule(line: &str) -> Option<Rule> {
    let mut line = line.trim_end();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }

    let mut negated = false;
    if let Some(rest) = line.strip_prefix('!') {
        negated = true;
        line = rest;
    }

    let mut dir_only = false;
    if let Some(rest) = line.strip_suffix('/') {
        dir_only = true;
        line = rest;
    }

    // a slash anywhere (incl. leading) anchors the pattern to the root
    let anchored = line.contains('/');
    let line = line.strip_prefix('/').unwrap_or(line);
    if line.is_empty() {
        return None;
    }

    Some(Rule {
        segments: line.split('/').map(str::to_string).collect(),
        negated,
        dir_only,
        anchored,
    })
}

/// Match pattern segments against path segments.  `**` spans zero or more
/// segments, except a trailing `**` which requires at least one (it selects
/// the directory's contents, not the directory itself).
fn segments_match(pattern: &[String], path: &[&str]) -> bool {
    match pattern.split_first() {
        None => path.is_empty(),
        Some((first, rest)) if first == "**" => {
            if rest.is_empty() {
                return !path.is_empty();
            }
            segments_match(rest, path)
                || (!path.is_empty() && segments_match(pattern, &path[1..]))
        }
        Some((first, rest)) => match path.split_first() {
            Some((head, tail)) => glob_match(first, head) && segments_match(rest, tail),
            None => false,
        },
    }
}

/// Single-segment glob: `*` spans any run of characters, `?` one character.
fn glob_match(pattern: &str, text: &str) -> bool {
    let pat: Vec<char> = pattern.chars().collect();
    let txt: Vec<char> = text.chars().collect();
    glob_match_at(&pat, &txt)
}

fn glob_match_at(pat: &[char], txt: &[char]) -> bool {
    match pat.split_first() {
        None => txt.is_empty(),
        Some(('*', rest)) => {
            (0..=txt.len()).any(|skip| glob_match_at(rest, &txt[skip..]))
        }
        Some(('?', rest)) => match txt.split_first() {
            Some((_, tail)) => glob_match_at(rest, tail),
            None => false,
        },
        Some((c, rest)) => match txt.split_first() {
            Some((t, tail)) => c == t && glob_match_at(rest, tail),
            None => false,
        },
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn ignored(rules: &str, path: &str) -> bool {
        Gitignore::parse(rules).is_ignored(path, false)
    }

    fn dir_ignored(rules: &str, path: &str) -> bool {
        Gitignore::parse(rules).is_ignored(path, true)
    }

    // ── Basic globs ───────────────────────────────────────────────────────────

    #[test]
    fn star_glob_matches_extension_anywhere() {
        assert!(ignored("*.log", "debug.log"));
        assert!(ignored("*.log", "deep/nested/trace.log"));
        assert!(!ignored("*.log", "main.go"));
    }

    #[test]
    fn question_mark_matches_one_char() {
        assert!(ignored("file?.txt", "file1.txt"));
        assert!(!ignored("file?.txt", "file12.txt"));
    }

    #[test]
    fn plain_name_matches_any_depth() {
        assert!(ignored("secrets.env", "secrets.env"));
        assert!(ignored("secrets.env", "config/secrets.env"));
    }

    // ── Directory-only rules ──────────────────────────────────────────────────

    #[test]
    fn dir_only_rule_does_not_match_files() {
        assert!(!ignored("build/", "build"));
        assert!(dir_ignored("build/", "build"));
    }

    #[test]
    fn dir_only_rule_ignores_contents_via_ancestor() {
        // build/out is a file, but its ancestor "build" matches as a directory
        assert!(ignored("build/", "build/out"));
        assert!(ignored("build/", "build/deep/artifact.bin"));
    }

    // ── Anchoring ─────────────────────────────────────────────────────────────

    #[test]
    fn root_anchored_only_matches_at_root() {
        assert!(ignored("/foo", "foo"));
        assert!(!ignored("/foo", "bar/foo"));
    }

    #[test]
    fn middle_anchored_pattern_matches_from_root() {
        assert!(ignored("a/b", "a/b"));
        assert!(!ignored("a/b", "x/a/b"));
        // contents of a matched directory are covered by ancestor propagation
        assert!(ignored("a/b", "a/b/c"));
    }

    // ── Double-star ───────────────────────────────────────────────────────────

    #[test]
    fn double_star_prefix_matches_any_depth() {
        assert!(ignored("**/foo", "foo"));
        assert!(ignored("**/foo", "a/b/foo"));
        assert!(!ignored("**/foo", "a/b/foobar"));
    }

    #[test]
    fn double_star_suffix_matches_contents_not_dir() {
        assert!(ignored("foo/**", "foo/bar"));
        assert!(ignored("foo/**", "foo/a/b/c"));
        assert!(!dir_ignored("foo/**", "foo"));
    }

    #[test]
    fn double_star_middle_spans_zero_or_more() {
        assert!(ignored("a/**/b", "a/b"));
        assert!(ignored("a/**/b", "a/x/b"));
        assert!(ignored("a/**/b", "a/x/y/b"));
        assert!(!ignored("a/**/b", "a/x/c"));
    }

    // ── Negation & rule order ─────────────────────────────────────────────────

    #[test]
    fn negation_reincludes_previously_excluded() {
        let rules = "*.log\n!keep.log\n";
        assert!(ignored(rules, "debug.log"));
        assert!(!ignored(rules, "keep.log"));
    }

    #[test]
    fn last_matching_rule_wins() {
        let rules = "!keep.log\n*.log\n";
        // the later *.log overrides the earlier negation
        assert!(ignored(rules, "keep.log"));
    }

    #[test]
    fn negation_cannot_rescue_file_in_ignored_directory() {
        let rules = "build/\n!build/keep.txt\n";
        assert!(ignored(rules, "build/keep.txt"));
    }

    // ── Comments & blanks ─────────────────────────────────────────────────────

    #[test]
    fn comments_and_blank_lines_are_skipped() {
        let rules = "# generated artifacts\n\n*.log\n";
        let gi = Gitignore::parse(rules);
        assert_eq!(gi.rules.len(), 1);
        assert!(gi.is_ignored("x.log", false));
    }

    #[test]
    fn missing_gitignore_yields_empty_set() {
        let dir = tempfile::tempdir().unwrap();
        let gi = Gitignore::from_workdir(dir.path());
        assert!(gi.is_empty());
        assert!(!gi.is_ignored("anything", false));
    }
}
