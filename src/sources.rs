//! The taint-source catalog.
//!
//! A context reference is a taint source iff an attacker can influence
//! its value: issue/PR titles and bodies, branch names, commit
//! messages, and so on. Scalar sources are matched with anchored
//! regexes; object sources (whole event payloads) are matched exactly.

use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

use crate::expr::{ExprRef, RefKind};

/// Reporting severity for a taint source.
#[derive(Copy, Clone, Debug, Eq, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum Severity {
    Low,
    Medium,
    High,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Low => write!(f, "low"),
            Severity::Medium => write!(f, "medium"),
            Severity::High => write!(f, "high"),
        }
    }
}

/// Attacker-controllable scalar contexts, matched against the
/// prefix-stripped reference name (e.g. `event.issue.title`).
const SCALAR_SOURCES: &[(&str, Severity)] = &[
    (r"event\.issue\.title", Severity::High),
    (r"event\.issue\.body", Severity::High),
    (r"event\.pull_request\.title", Severity::High),
    (r"event\.pull_request\.body", Severity::High),
    (r"event\.pull_request\.head\.ref", Severity::Low),
    (r"event\.pull_request\.head\.label", Severity::Low),
    (r"event\.discussion\.title", Severity::High),
    (r"event\.discussion\.body", Severity::High),
    (r"event\.comment\.body", Severity::High),
    (r"event\.review\.body", Severity::High),
    (r"event\.review_comment\.body", Severity::High),
    (r"event\.pages.*\.page_name", Severity::High),
    (r"event\.commits.*\.message", Severity::Medium),
    (r"event\.commits.*\.author\.email", Severity::Medium),
    (r"event\.commits.*\.author\.name", Severity::Medium),
    (r"event\.head_commit\.message", Severity::Medium),
    (r"event\.head_commit\.author\.email", Severity::Medium),
    (r"event\.head_commit\.author\.name", Severity::Medium),
    (r"event\.head_commit\.committer\.email", Severity::Medium),
    (r"event\.head_commit\.committer\.name", Severity::Medium),
    (r"event\.workflow_run\.head_branch", Severity::Low),
    (r"event\.workflow_run\.head_commit\.message", Severity::Medium),
    (r"event\.workflow_run\.head_commit\.author\.email", Severity::Medium),
    (r"event\.workflow_run\.head_commit\.author\.name", Severity::Medium),
    (r"event\.workflow_run\.pull_requests.*\.head\.ref", Severity::Low),
    (r"head_ref", Severity::Low),
];

/// Contexts whose entire subtree is attacker-controllable.
const OBJECT_SOURCES: &[(&str, Severity)] = &[
    ("event.comment", Severity::Medium),
    ("event.issue.pull_request", Severity::Medium),
    ("event.issue", Severity::Medium),
    ("event.pull_request", Severity::Medium),
    ("event.pull_request.commits", Severity::Medium),
    ("event.pull_request.head.repo", Severity::Medium),
    ("event.pull_request.labels", Severity::Medium),
    ("event.commits", Severity::Medium),
    ("event.workflow_run", Severity::Medium),
    ("event.workflow_run.pull_requests", Severity::Medium),
];

static SCALAR_PATTERNS: LazyLock<Vec<(Regex, Severity)>> = LazyLock::new(|| {
    SCALAR_SOURCES
        .iter()
        .map(|(pat, sev)| (Regex::new(&format!("^(?:{pat})")).unwrap(), *sev))
        .collect()
});

/// Environment variables populated by the runner itself. These are
/// excluded from env-originated flows during summary consumption to
/// suppress universal false positives.
pub(crate) const SAFE_ENV: &[&str] = &[
    "GITHUB_ACTION",
    "GITHUB_ACTION_PATH",
    "GITHUB_ACTION_REPOSITORY",
    "GITHUB_ACTIONS",
    "GITHUB_ACTOR",
    "GITHUB_API_URL",
    "GITHUB_BASE_REF",
    "GITHUB_ENV",
    "GITHUB_EVENT_NAME",
    "GITHUB_EVENT_PATH",
    "GITHUB_GRAPHQL_URL",
    "GITHUB_JOB",
    "GITHUB_PATH",
    "GITHUB_REF",
    "GITHUB_REPOSITORY",
    "GITHUB_REPOSITORY_OWNER",
    "GITHUB_RUN_ID",
    "GITHUB_RUN_NUMBER",
    "GITHUB_SERVER_URL",
    "GITHUB_SHA",
    "GITHUB_WORKFLOW",
    "GITHUB_WORKSPACE",
];

pub(crate) fn is_safe_env(name: &str) -> bool {
    SAFE_ENV.contains(&name)
}

/// Returns the severity of a scalar taint source, or `None` if the
/// reference is not attacker-controllable.
pub(crate) fn scalar_source(r: &ExprRef) -> Option<Severity> {
    if r.kind != RefKind::Context {
        return None;
    }

    SCALAR_PATTERNS
        .iter()
        .find(|(pat, _)| pat.is_match(&r.name))
        .map(|(_, sev)| *sev)
}

/// Returns whether the reference names a wholly attacker-controlled
/// object context.
pub(crate) fn object_source(r: &ExprRef) -> bool {
    r.kind == RefKind::Context && OBJECT_SOURCES.iter().any(|(name, _)| *name == r.name)
}

/// Severity lookup for report rendering, keyed by the source name
/// recorded on a taint root. Unknown names (e.g. summarizer-reported
/// sources we can't re-derive) default to high.
pub(crate) fn severity_for(name: &str) -> Severity {
    for (pat, sev) in SCALAR_PATTERNS.iter() {
        if pat.is_match(name.trim_start_matches("github.")) || pat.is_match(name) {
            return *sev;
        }
    }

    for (object, sev) in OBJECT_SOURCES {
        if name.contains(object) {
            return *sev;
        }
    }

    Severity::High
}

#[cfg(test)]
mod tests {
    use super::{Severity, object_source, scalar_source, severity_for};
    use crate::expr::extract_refs;

    #[test]
    fn test_scalar_sources() {
        for (text, severity) in [
            ("${{ github.event.issue.title }}", Some(Severity::High)),
            ("${{ github.event.pull_request.body }}", Some(Severity::High)),
            ("${{ github.event.pull_request.head.ref }}", Some(Severity::Low)),
            ("${{ github.head_ref }}", Some(Severity::Low)),
            ("${{ github.event.head_commit.message }}", Some(Severity::Medium)),
            ("${{ github.sha }}", None),
            ("${{ github.actor }}", None),
            // Not a context reference, even though the name would match.
            ("${{ env.head_ref }}", None),
        ] {
            let refs = extract_refs(text);
            assert_eq!(scalar_source(&refs[0]), severity, "{text}");
        }
    }

    #[test]
    fn test_object_sources() {
        let refs = extract_refs("${{ github.event.pull_request }}");
        assert!(object_source(&refs[0]));

        let refs = extract_refs("${{ github.event.pull_request.number }}");
        assert!(!object_source(&refs[0]));
    }

    #[test]
    fn test_severity_lookup() {
        assert_eq!(severity_for("github.event.issue.title"), Severity::High);
        assert_eq!(severity_for("event.workflow_run.head_branch"), Severity::Low);
        assert_eq!(severity_for("something-opaque"), Severity::High);
    }

    #[test]
    fn test_safe_env() {
        assert!(super::is_safe_env("GITHUB_SHA"));
        assert!(!super::is_safe_env("LD_PRELOAD"));
    }
}
