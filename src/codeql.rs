//! Driver for the external JS-action summarizer.
//!
//! JavaScript actions are summarized by building a CodeQL database for
//! the action's source tree and evaluating a fixed query pack against
//! it. Each query materializes one flow relation as a `.bqrs` file;
//! `bqrs decode --format json` turns those into tuple tables we parse
//! here. The summarizer is strictly external: a timeout or failure
//! degrades to an empty report.

use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use anyhow::{Context as _, Result, anyhow};
use camino::{Utf8Path, Utf8PathBuf};
use serde_json::Value;

use crate::config::Config;
use crate::ir::TaintKind;
use crate::summary::{FlowRecord, SinkRecord};

const DANGEROUS_SINKS_FILE: &str = "DangerousSinks.bqrs";
const LESS_DANGEROUS_SINKS_FILE: &str = "LessDangerousSinks.bqrs";
const ENV_SINKS_FILE: &str = "EnvSinks.bqrs";
const LESS_ENV_SINKS_FILE: &str = "LessEnvSinks.bqrs";
const ENV_OUTPUT_TAINTING_FILE: &str = "EnvOutputTainting.bqrs";
const OUTPUT_TAINTING_FILE: &str = "OutputTainting.bqrs";
const CONTEXT_SINKS_FILE: &str = "ContextSinks.bqrs";
const LESS_CONTEXT_SINKS_FILE: &str = "LessContextSinks.bqrs";
const CONTEXT_OUTPUT_FILE: &str = "ContextOutput.bqrs";

/// Query evaluation is bounded; expiry degrades to an empty report.
const QUERY_TIMEOUT: Duration = Duration::from_secs(25 * 60);

/// The nine flow relations produced by the query pack, in raw form.
#[derive(Clone, Debug, Default)]
pub(crate) struct RawJsReport {
    pub(crate) arg_to_sink: Vec<FlowRecord>,
    pub(crate) arg_to_lsink: Vec<FlowRecord>,
    pub(crate) env_to_sink: Vec<FlowRecord>,
    pub(crate) env_to_lsink: Vec<FlowRecord>,
    pub(crate) arg_to_output: Vec<FlowRecord>,
    pub(crate) env_to_output: Vec<FlowRecord>,
    pub(crate) context_to_sink: Vec<FlowRecord>,
    pub(crate) context_to_lsink: Vec<FlowRecord>,
    pub(crate) context_to_output: Vec<FlowRecord>,
}

pub(crate) struct CodeQl<'a> {
    config: &'a Config,
}

impl<'a> CodeQl<'a> {
    pub(crate) fn new(config: &'a Config) -> Self {
        Self { config }
    }

    /// Summarizes the JS action checked out at `action_dir`.
    ///
    /// The database and query results are cached on disk next to the
    /// checkout, keyed by the action's name, so repeated runs of the
    /// analyzer reuse them.
    pub(crate) fn summarize(
        &self,
        action_name: &str,
        action_dir: &Utf8Path,
    ) -> Result<RawJsReport> {
        let db_dir = self
            .config
            .local_folder
            .join(format!("{name}_codeql", name = action_name.replace('/', "#")));

        if !db_dir.join("db-javascript").is_dir() {
            tracing::debug!("creating database at {db_dir}");
            self.create_database(action_dir, &db_dir)?;
        } else {
            tracing::debug!("database {db_dir} already exists");
        }

        let results_dir = db_dir.join("results").join("actions-codeql");
        if results_dir.is_dir() {
            tracing::debug!("query results already present in {db_dir}");
        } else {
            match self.run_queries(&db_dir) {
                Ok(()) => {}
                Err(QueryError::Timeout) => {
                    tracing::warn!("summarizer timed out on {action_name}; treating as opaque");
                    return Ok(RawJsReport::default());
                }
                Err(QueryError::Other(err)) => return Err(err),
            }
            if !results_dir.is_dir() {
                return Err(anyhow!("no query results produced under {db_dir}"));
            }
        }

        self.parse_results(&results_dir)
    }

    fn create_database(&self, source: &Utf8Path, db_dir: &Utf8Path) -> Result<()> {
        let status = Command::new(&self.config.codeql_bin)
            .args([
                "database",
                "create",
                "--language=javascript",
                "--mode=brutal",
                "--finalize-dataset",
                "-s",
                source.as_str(),
                db_dir.as_str(),
            ])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .with_context(|| "couldn't invoke the summarizer")?;

        if !status.success() || !db_dir.join("db-javascript").is_dir() {
            return Err(anyhow!("database creation failed for {source}"));
        }

        Ok(())
    }

    fn run_queries(&self, db_dir: &Utf8Path) -> Result<(), QueryError> {
        let mut child = Command::new(&self.config.codeql_bin)
            .args([
                "database",
                "run-queries",
                "--threads=2",
                db_dir.as_str(),
                self.config.query_path.as_str(),
            ])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|err| QueryError::Other(err.into()))?;

        let deadline = Instant::now() + QUERY_TIMEOUT;
        loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    if status.success() {
                        return Ok(());
                    }
                    return Err(QueryError::Other(anyhow!(
                        "query evaluation failed on {db_dir}"
                    )));
                }
                Ok(None) => {
                    if Instant::now() >= deadline {
                        let _ = child.kill();
                        let _ = child.wait();
                        return Err(QueryError::Timeout);
                    }
                    std::thread::sleep(Duration::from_millis(250));
                }
                Err(err) => return Err(QueryError::Other(err.into())),
            }
        }
    }

    fn decode(&self, result_file: &Utf8PathBuf) -> Result<Value> {
        if !result_file.is_file() {
            return Err(anyhow!("missing query result file {result_file}"));
        }

        let output = Command::new(&self.config.codeql_bin)
            .args([
                "bqrs",
                "decode",
                "--entities=id,url,string",
                "--format",
                "json",
                result_file.as_str(),
            ])
            .output()
            .with_context(|| "couldn't invoke the summarizer")?;

        serde_json::from_slice(&output.stdout)
            .with_context(|| format!("undecodable query result {result_file}"))
    }

    fn parse_results(&self, results_dir: &Utf8Path) -> Result<RawJsReport> {
        let sink_rows = |file: &str, kind: TaintKind| -> Result<Vec<FlowRecord>> {
            Ok(parse_sink_rows(&self.decode(&results_dir.join(file))?, kind))
        };
        let output_rows = |file: &str, kind: TaintKind| -> Result<Vec<FlowRecord>> {
            Ok(parse_output_rows(&self.decode(&results_dir.join(file))?, kind))
        };

        Ok(RawJsReport {
            arg_to_sink: sink_rows(DANGEROUS_SINKS_FILE, TaintKind::Input)?,
            arg_to_lsink: sink_rows(LESS_DANGEROUS_SINKS_FILE, TaintKind::Input)?,
            env_to_sink: sink_rows(ENV_SINKS_FILE, TaintKind::Env)?,
            env_to_lsink: sink_rows(LESS_ENV_SINKS_FILE, TaintKind::Env)?,
            arg_to_output: output_rows(OUTPUT_TAINTING_FILE, TaintKind::Input)?,
            env_to_output: output_rows(ENV_OUTPUT_TAINTING_FILE, TaintKind::Env)?,
            context_to_sink: sink_rows(CONTEXT_SINKS_FILE, TaintKind::Context)?,
            context_to_lsink: sink_rows(LESS_CONTEXT_SINKS_FILE, TaintKind::Context)?,
            context_to_output: output_rows(CONTEXT_OUTPUT_FILE, TaintKind::Context)?,
        })
    }
}

enum QueryError {
    Timeout,
    Other(anyhow::Error),
}

/// A tuple element is either a plain string or an entity object with a
/// `label` and a `url` span.
fn element_label(element: &Value) -> Option<String> {
    let raw = match element {
        Value::String(s) => s.as_str(),
        Value::Object(obj) => obj.get("label")?.as_str()?,
        _ => return None,
    };
    Some(raw.trim_matches('\'').to_string())
}

fn element_uri(element: &Value) -> Option<String> {
    let url = element.as_object()?.get("url")?.as_object()?;
    let uri = percent_decode(url.get("uri")?.as_str()?);
    let line = url.get("startLine")?.as_i64()?;
    let column = url.get("startColumn")?.as_i64()?;
    Some(format!("{uri}:{line}:{column}"))
}

/// Minimal `%XX` decoding for the file URIs the summarizer emits.
fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'%'
            && i + 2 < bytes.len()
            && let (Some(hi), Some(lo)) = (
                (bytes[i + 1] as char).to_digit(16),
                (bytes[i + 2] as char).to_digit(16),
            )
        {
            out.push((hi * 16 + lo) as u8);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }

    String::from_utf8_lossy(&out).into_owned()
}

fn tuples(value: &Value) -> Vec<&Vec<Value>> {
    value
        .get("#select")
        .and_then(|select| select.get("tuples"))
        .and_then(Value::as_array)
        .map(|rows| rows.iter().filter_map(Value::as_array).collect())
        .unwrap_or_default()
}

/// Rows shaped `| source | source-loc | sink-loc | function |`,
/// grouped by source name.
fn parse_sink_rows(value: &Value, kind: TaintKind) -> Vec<FlowRecord> {
    let mut flows: Vec<FlowRecord> = vec![];

    for row in tuples(value) {
        let (Some(name), Some(source), Some(sink), Some(function)) = (
            row.first().and_then(element_label),
            row.get(1).and_then(element_uri),
            row.get(2).and_then(element_uri),
            row.get(3).and_then(Value::as_str),
        ) else {
            continue;
        };

        let record = SinkRecord {
            function: function.into(),
            taint_name: String::new(),
            location: sink,
        };

        match flows.iter_mut().find(|flow| flow.name == name) {
            Some(flow) => flow.sinks.push(record),
            None => flows.push(FlowRecord {
                name,
                kind,
                location: source,
                sinks: vec![record],
            }),
        }
    }

    flows
}

/// Rows shaped `| source | source-loc | sink-loc | function | name |`,
/// where `function` discriminates setOutput/exportVariable/saveState
/// and `name` is the written output or variable.
fn parse_output_rows(value: &Value, kind: TaintKind) -> Vec<FlowRecord> {
    let mut flows: Vec<FlowRecord> = vec![];

    for row in tuples(value) {
        let (Some(name), Some(source), Some(sink), Some(function), Some(taint_name)) = (
            row.first().and_then(element_label),
            row.get(1).and_then(element_uri),
            row.get(2).and_then(element_uri),
            row.get(3).and_then(Value::as_str),
            row.get(4).and_then(Value::as_str),
        ) else {
            continue;
        };

        let record = SinkRecord {
            function: function.into(),
            taint_name: taint_name.into(),
            location: sink,
        };

        match flows.iter_mut().find(|flow| flow.name == name) {
            Some(flow) => flow.sinks.push(record),
            None => flows.push(FlowRecord {
                name,
                kind,
                location: source,
                sinks: vec![record],
            }),
        }
    }

    flows
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{parse_output_rows, parse_sink_rows, percent_decode};
    use crate::ir::TaintKind;

    fn entity(label: &str, uri: &str, line: i64, column: i64) -> serde_json::Value {
        json!({
            "id": 1,
            "label": label,
            "url": { "uri": uri, "startLine": line, "startColumn": column }
        })
    }

    #[test]
    fn test_parse_sink_rows_groups_by_source() {
        let decoded = json!({
            "#select": {
                "tuples": [
                    [
                        entity("'script'", "file:/tmp/a%23b/index.js", 6, 16),
                        entity("input", "file:/tmp/a%23b/index.js", 6, 16),
                        entity("exec", "file:/tmp/a%23b/index.js", 26, 5),
                        "exec"
                    ],
                    [
                        entity("'script'", "file:/tmp/a%23b/index.js", 6, 16),
                        entity("input", "file:/tmp/a%23b/index.js", 6, 16),
                        entity("exec", "file:/tmp/a%23b/other.js", 85, 9),
                        "exec"
                    ]
                ]
            }
        });

        let flows = parse_sink_rows(&decoded, TaintKind::Input);
        assert_eq!(flows.len(), 1);
        assert_eq!(flows[0].name, "script");
        assert_eq!(flows[0].location, "file:/tmp/a#b/index.js:6:16");
        assert_eq!(flows[0].sinks.len(), 2);
        assert_eq!(flows[0].sinks[1].location, "file:/tmp/a#b/other.js:85:9");
    }

    #[test]
    fn test_parse_output_rows_keeps_written_name() {
        let decoded = json!({
            "#select": {
                "tuples": [
                    [
                        entity("'x'", "file:/x.js", 3, 1),
                        entity("input", "file:/x.js", 3, 1),
                        entity("setOutput", "file:/x.js", 9, 1),
                        "setOutput",
                        "y"
                    ]
                ]
            }
        });

        let flows = parse_output_rows(&decoded, TaintKind::Input);
        assert_eq!(flows.len(), 1);
        assert_eq!(flows[0].sinks[0].function, "setOutput");
        assert_eq!(flows[0].sinks[0].taint_name, "y");
    }

    #[test]
    fn test_empty_relation() {
        let decoded = json!({ "#select": { "tuples": [] } });
        assert!(parse_sink_rows(&decoded, TaintKind::Input).is_empty());

        let decoded = json!({});
        assert!(parse_sink_rows(&decoded, TaintKind::Input).is_empty());
    }

    #[test]
    fn test_percent_decode() {
        assert_eq!(percent_decode("file:/tmp/a%23b/x.js"), "file:/tmp/a#b/x.js");
        assert_eq!(percent_decode("plain"), "plain");
        assert_eq!(percent_decode("trailing%2"), "trailing%2");
    }
}
