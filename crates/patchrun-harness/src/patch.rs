//! Pure helpers for normalizing submitted patches.

use std::sync::LazyLock;

use regex::Regex;
use tracing::debug;

static BINARY_FILES_DIFFER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^Binary files .* and .* differ$").expect("valid binary-differ regex")
});

static DIFF_HEADER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^diff --git a/(.*?) b/(.*?)$").expect("valid diff header regex")
});

const GIT_BINARY_PATCH: &str = "GIT binary patch";
const DIFF_PREFIX: &str = "diff --git ";

type Formatter = fn(&str) -> String;

/// Normalizations applied to every submission before `git apply`.
const FORMATTERS: &[(&str, Formatter)] = &[
    ("filter_binary_patch", filter_binary_patch),
    ("ensure_trailing_newline", ensure_trailing_newline),
];

/// Prepare a submitted patch for application.
pub fn format_patch(patch: &str) -> String {
    FORMATTERS
        .iter()
        .fold(patch.to_string(), |patch, (name, formatter)| {
            let formatted = formatter(&patch);
            if formatted.len() != patch.len() {
                debug!(formatter = name, before = patch.len(), after = formatted.len(), "Patch reformatted");
            }
            formatted
        })
}

/// Drop every file section that carries binary content.
///
/// `git apply` cannot reproduce the binary hunks produced by agents (they
/// are usually truncated), so a file section containing `GIT binary patch`
/// or `Binary files ... differ` is removed whole, from its `diff --git`
/// header up to the next header. Text sections are left untouched.
pub fn filter_binary_patch(patch: &str) -> String {
    let mut out = String::with_capacity(patch.len());
    let mut section = String::new();
    let mut in_section = false;

    for line in patch.split_inclusive('\n') {
        if line.starts_with(DIFF_PREFIX) {
            flush_section(&mut out, &mut section);
            in_section = true;
        }
        if in_section {
            section.push_str(line);
        } else if !is_binary_marker(line) {
            // Preamble before the first header.
            out.push_str(line);
        }
    }
    flush_section(&mut out, &mut section);
    out
}

fn flush_section(out: &mut String, section: &mut String) {
    if section.is_empty() {
        return;
    }
    if section.lines().any(is_binary_marker) {
        let header = section.lines().next().unwrap_or_default();
        debug!(header, "Dropping binary file section from patch");
    } else {
        out.push_str(section);
    }
    section.clear();
}

fn is_binary_marker(line: &str) -> bool {
    let bare = line.trim_end_matches(['\n', '\r']);
    bare == GIT_BINARY_PATCH || BINARY_FILES_DIFFER.is_match(bare)
}

fn ensure_trailing_newline(patch: &str) -> String {
    if patch.is_empty() || patch.ends_with('\n') {
        patch.to_string()
    } else {
        format!("{patch}\n")
    }
}

/// Files in the diff whose changes are more than whitespace.
///
/// Returns the `a/` side path of every section with at least one added or
/// removed line containing non-whitespace characters, in patch order.
pub fn extract_modified_files(patch: &str) -> Vec<String> {
    let mut modified = Vec::new();
    let mut current: Option<String> = None;
    let mut significant = false;

    for line in patch.lines() {
        if let Some(caps) = DIFF_HEADER.captures(line) {
            if let Some(file) = current.take().filter(|_| significant) {
                modified.push(file);
            }
            current = caps.get(1).map(|m| m.as_str().to_string());
            significant = false;
        } else if is_change_line(line) && !line[1..].trim().is_empty() {
            significant = true;
        }
    }
    if let Some(file) = current.filter(|_| significant) {
        modified.push(file);
    }
    modified
}

fn is_change_line(line: &str) -> bool {
    (line.starts_with('+') || line.starts_with('-'))
        && !line.starts_with("+++")
        && !line.starts_with("---")
}
