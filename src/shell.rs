//! Best-effort shell command parsing.
//!
//! This is deliberately regex-based: we look for the well-known idioms
//! that introduce new taintable names (`>> $GITHUB_ENV`,
//! `>> $GITHUB_OUTPUT`, and the legacy `::set-env`/`::set-output`
//! workflow commands) plus `$UPPER_CASE` environment reads. No shell
//! semantics are modeled; missed flows are acceptable, but every name
//! we do introduce is exact.

use std::sync::LazyLock;

use regex::Regex;

use crate::ir::{NamedValue, TaintKind};

static ENV_READ: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\$[A-Z_]+").unwrap());

static GITHUB_ENV_WRITE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"echo "(?P<name>\w+?)=(?P<value>.*)"[ \t]*>>[ \t]*\$GITHUB_ENV"#).unwrap()
});

static SET_ENV: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"::set-env name=(?P<name>\w+?)::(?P<value>.*)").unwrap());

static GITHUB_OUTPUT_WRITE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"echo ["'](?P<name>\w+?)=(?P<value>.*)['"][ \t]*>>[ \t"]*\$GITHUB_OUTPUT[ \t"]*"#)
        .unwrap()
});

static SET_OUTPUT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"::set-output name=(?P<name>\w+?)::(?P<value>.*)").unwrap());

/// What a `run:` block reads and introduces.
#[derive(Debug, Default)]
pub(crate) struct ParsedCommand {
    /// `$NAME` reads, with the `$` stripped so they match names
    /// introduced by earlier environment writes.
    pub(crate) env_reads: Vec<NamedValue>,
    /// Names written to the job environment.
    pub(crate) env_writes: Vec<NamedValue>,
    /// Names written as step outputs.
    pub(crate) output_writes: Vec<NamedValue>,
}

pub(crate) fn parse_bash_command(command: &str) -> ParsedCommand {
    let mut parsed = ParsedCommand::default();

    for m in ENV_READ.find_iter(command) {
        parsed.env_reads.push(NamedValue::new(
            m.as_str().trim_start_matches('$'),
            TaintKind::Env,
            "",
        ));
    }

    for pattern in [&*GITHUB_ENV_WRITE, &*SET_ENV] {
        for caps in pattern.captures_iter(command) {
            parsed
                .env_writes
                .push(NamedValue::new(&caps["name"], TaintKind::Env, &caps["value"]));
        }
    }

    for pattern in [&*GITHUB_OUTPUT_WRITE, &*SET_OUTPUT] {
        for caps in pattern.captures_iter(command) {
            parsed.output_writes.push(NamedValue::new(
                &caps["name"],
                TaintKind::Output,
                &caps["value"],
            ));
        }
    }

    parsed
}

#[cfg(test)]
mod tests {
    use super::parse_bash_command;

    #[test]
    fn test_env_writes() {
        let parsed = parse_bash_command(
            r#"echo "PR_BODY=${{ github.event.pull_request.body }}" >> $GITHUB_ENV"#,
        );

        assert_eq!(parsed.env_writes.len(), 1);
        assert_eq!(parsed.env_writes[0].name, "PR_BODY");
        assert_eq!(parsed.env_writes[0].value, "${{ github.event.pull_request.body }}");
        assert_eq!(parsed.env_writes[0].refs.len(), 1);
        assert_eq!(parsed.env_writes[0].refs[0].name, "event.pull_request.body");
    }

    #[test]
    fn test_legacy_set_env() {
        let parsed =
            parse_bash_command("echo '::set-env name=TITLE::${{ github.event.issue.title }}'");

        assert_eq!(parsed.env_writes.len(), 1);
        assert_eq!(parsed.env_writes[0].name, "TITLE");
        assert_eq!(parsed.env_writes[0].refs.len(), 1);
    }

    #[test]
    fn test_output_writes() {
        let parsed =
            parse_bash_command(r#"echo "digest=${{ steps.build.outputs.digest }}" >> "$GITHUB_OUTPUT""#);
        assert_eq!(parsed.output_writes.len(), 1);
        assert_eq!(parsed.output_writes[0].name, "digest");

        let parsed = parse_bash_command("echo '::set-output name=body::${{ github.event.comment.body }}'");
        assert_eq!(parsed.output_writes.len(), 1);
        assert_eq!(parsed.output_writes[0].name, "body");
    }

    #[test]
    fn test_env_reads_strip_dollar() {
        let parsed = parse_bash_command("eval \"$X\" && echo $GITHUB_SHA");

        let names = parsed
            .env_reads
            .iter()
            .map(|v| v.name.as_str())
            .collect::<Vec<_>>();
        assert_eq!(names, &["X", "GITHUB_SHA"]);
    }

    #[test]
    fn test_plain_command_introduces_nothing() {
        let parsed = parse_bash_command("make test");
        assert!(parsed.env_writes.is_empty());
        assert!(parsed.output_writes.is_empty());
        assert!(parsed.env_reads.is_empty());
    }
}
