//! `${{ ... }}` reference extraction and classification.
//!
//! GitHub Actions interpolates `${{ ... }}` template expressions into
//! almost every string-valued field. We don't evaluate expressions; we
//! extract every reference to a well-known context namespace and
//! classify it by prefix, which is all the taint engine needs.

use std::sync::LazyLock;

use regex::Regex;

/// The namespace a reference belongs to, per its leading component.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum RefKind {
    Secret,
    Context,
    Env,
    Steps,
    Runner,
    Job,
    Jobs,
    Matrix,
    Strategy,
    Needs,
    Inputs,
}

/// A single classified reference within a template expression.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct ExprRef {
    /// The reference with its namespace prefix removed, e.g.
    /// `event.issue.title` for `github.event.issue.title`.
    pub(crate) name: String,
    /// The reference as it appeared in the expression.
    pub(crate) expression: String,
    pub(crate) kind: RefKind,
}

/// Matches the interior of `${{ ... }}`, tolerating sloppy brace counts.
static CURLY: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\$\{+(.*?)\}+").unwrap());

const PREFIXES: &[(&str, RefKind)] = &[
    ("secrets.", RefKind::Secret),
    ("github.", RefKind::Context),
    ("GITHUB_", RefKind::Context),
    ("env.", RefKind::Env),
    ("steps.", RefKind::Steps),
    ("runner.", RefKind::Runner),
    ("RUNNER_", RefKind::Runner),
    ("job.", RefKind::Job),
    ("matrix.", RefKind::Matrix),
    ("strategy.", RefKind::Strategy),
    ("needs.", RefKind::Needs),
    ("inputs.", RefKind::Inputs),
    ("jobs.", RefKind::Jobs),
];

/// Per-namespace patterns used to dig references out of expression
/// payloads that don't parse as a bare reference, e.g. function-call
/// arguments like `contains(github.event.issue.title, 'x')`.
static EMBEDDED: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"secrets\.[A-Za-z0-9_\-.]+",
        r"github\.[A-Za-z0-9_\-.]+",
        r"env\.[A-Za-z0-9_\-.]+",
        r"steps\.[A-Za-z0-9_\-.]+",
        r"matrix\.[A-Za-z0-9_\-.]+",
        r"needs\.[A-Za-z0-9_\-.]+",
        r"strategy\.[A-Za-z0-9_\-.]+",
        r"runner\.[A-Za-z0-9_\-.]+",
        r"job\.[A-Za-z0-9_\-.]+",
        r"jobs\.[A-Za-z0-9_\-.]+",
        r"inputs\.[A-Za-z0-9_\-.]+",
        r"GITHUB_[A-Za-z0-9_]+",
        r"RUNNER_[A-Za-z0-9_]+",
    ]
    .iter()
    .map(|pat| Regex::new(pat).unwrap())
    .collect()
});

/// Classifies a candidate reference against the prefix table.
///
/// The returned `name` drops the namespace component and anything after
/// the first space, so that comparison payloads like
/// `secrets.X == 'y'` still yield the name `X`.
fn classify(candidate: &str) -> Option<ExprRef> {
    for (prefix, kind) in PREFIXES {
        if candidate.starts_with(prefix) {
            let mut name = match candidate.split_once('.') {
                Some((_, rest)) => rest,
                None => candidate,
            };
            if let Some((head, _)) = name.split_once(' ') {
                name = head;
            }

            return Some(ExprRef {
                name: name.into(),
                expression: candidate.into(),
                kind: *kind,
            });
        }
    }

    None
}

/// Scans an unclassifiable payload for embedded references.
fn scan_embedded(payload: &str) -> Vec<ExprRef> {
    let mut found: Vec<ExprRef> = vec![];
    for pattern in EMBEDDED.iter() {
        for m in pattern.find_iter(payload) {
            let Some(r) = classify(m.as_str()) else {
                continue;
            };

            // Overlapping namespace patterns produce both a reference
            // and its own prefix; keep only the longest covering match.
            if found
                .iter()
                .any(|prior| prior.expression.contains(&r.expression))
            {
                continue;
            }
            found.push(r);
        }
    }
    found
}

/// Extracts every classified `${{ ... }}` reference from a string.
///
/// The result is de-duplicated by textual expression, preserving
/// first-seen order.
pub(crate) fn extract_refs(text: &str) -> Vec<ExprRef> {
    let mut refs: Vec<ExprRef> = vec![];

    for caps in CURLY.captures_iter(text) {
        let payload = caps[1].trim();

        if let Some(r) = classify(payload)
            && !refs.iter().any(|prior| prior.expression == r.expression)
        {
            refs.push(r);
        }

        for r in scan_embedded(payload) {
            if !refs.contains(&r) {
                refs.push(r);
            }
        }
    }

    refs
}

#[cfg(test)]
mod tests {
    use super::{RefKind, extract_refs};

    #[test]
    fn test_classification() {
        for (text, name, kind) in [
            ("${{ github.event.issue.title }}", "event.issue.title", RefKind::Context),
            ("${{ secrets.DEPLOY_KEY }}", "DEPLOY_KEY", RefKind::Secret),
            ("${{ env.FOO }}", "FOO", RefKind::Env),
            ("${{ steps.build.outputs.digest }}", "build.outputs.digest", RefKind::Steps),
            ("${{ needs.plan.outputs.version }}", "plan.outputs.version", RefKind::Needs),
            ("${{ inputs.script }}", "script", RefKind::Inputs),
            ("${{ matrix.os }}", "os", RefKind::Matrix),
            ("${{ runner.temp }}", "temp", RefKind::Runner),
            ("${{ GITHUB_SHA }}", "GITHUB_SHA", RefKind::Context),
        ] {
            let refs = extract_refs(text);
            assert_eq!(refs.len(), 1, "{text}");
            assert_eq!(refs[0].name, name);
            assert_eq!(refs[0].kind, kind);
        }
    }

    #[test]
    fn test_multiple_and_dedup() {
        let refs = extract_refs(
            "echo ${{ github.head_ref }} ${{ env.A }} and again ${{ github.head_ref }}",
        );
        assert_eq!(
            refs.iter().map(|r| r.expression.as_str()).collect::<Vec<_>>(),
            &["github.head_ref", "env.A"]
        );
    }

    #[test]
    fn test_embedded_function_arguments() {
        let refs = extract_refs("${{ contains(github.event.pull_request.body, 'x') }}");
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].name, "event.pull_request.body");
        assert_eq!(refs[0].kind, RefKind::Context);

        let refs = extract_refs("${{ startsWith(github.head_ref, env.PREFIX) }}");
        assert_eq!(
            refs.iter().map(|r| r.expression.as_str()).collect::<Vec<_>>(),
            &["github.head_ref", "env.PREFIX"]
        );
    }

    #[test]
    fn test_comparison_payload_keeps_lhs_name() {
        let refs = extract_refs("${{ secrets.TOKEN != '' }}");
        assert_eq!(refs[0].name, "TOKEN");
        assert_eq!(refs[0].kind, RefKind::Secret);
    }

    #[test]
    fn test_no_refs() {
        assert!(extract_refs("echo plain text $HOME").is_empty());
        assert!(extract_refs("${{ 1 + 2 }}").is_empty());
    }
}
