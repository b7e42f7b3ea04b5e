// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;

/// Expand `{{name}}` placeholders in hook commands and prompt templates.
///
/// Runs in a single left-to-right scan: each placeholder is resolved once
/// against `vars`, and substituted values are never re-scanned, so hook
/// output containing `{{...}}` syntax cannot trigger a second expansion.
/// Placeholders with no matching variable stay in the text untouched, which
/// keeps a typo in a hook command visible instead of silently vanishing.
pub fn expand_vars(input: &str, vars: &HashMap<String, String>) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(open) = rest.find("{{") {
        out.push_str(&rest[..open]);
        let after_open = &rest[open + 2..];
        let Some(close) = after_open.find("}}") else {
            // unterminated opener: keep it literal and scan what follows
            out.push_str("{{");
            rest = after_open;
            continue;
        };
        let name = &after_open[..close];
        match vars.get(name) {
            Some(value) => out.push_str(value),
            None => {
                out.push_str("{{");
                out.push_str(name);
                out.push_str("}}");
            }
        }
        rest = &after_open[close + 2..];
    }
    out.push_str(rest);
    out
}

/// Split one `--var KEY=VALUE` argument.  The key is trimmed and must be
/// non-empty; the value keeps everything after the first `=` verbatim (so
/// URLs and shell snippets pass through unmangled).
pub fn parse_var(spec: &str) -> Option<(String, String)> {
    let eq = spec.find('=')?;
    let key = spec[..eq].trim();
    if key.is_empty() {
        return None;
    }
    Some((key.to_string(), spec[eq + 1..].to_string()))
}

// ─── Unit tests ───────────────────────────────────────────────────────────────
