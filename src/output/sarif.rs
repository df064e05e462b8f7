//! SARIF output.
//!
//! One SARIF 2.1.0 run per analyzed unit. Rule ids and indices are
//! stable per category so downstream consumers can key off them.

use itertools::Itertools as _;
use serde_sarif::sarif::{
    ArtifactLocation, Location as SarifLocation, Message, PhysicalLocation, Region,
    Result as SarifResult, ResultLevel, Run, Sarif, Tool, ToolComponent,
};

use crate::models::ActionKind;
use crate::report::{ActionReport, ReportLevel, WorkflowReport};
use crate::summary::{FlowRecord, SinkRecord};

const SCHEMA_URI: &str =
    "https://raw.githubusercontent.com/oasis-tcs/sarif-spec/master/Schemata/sarif-schema-2.1.0.json";

impl From<ReportLevel> for ResultLevel {
    fn from(level: ReportLevel) -> Self {
        match level {
            ReportLevel::Error => ResultLevel::Error,
            ReportLevel::Warning => ResultLevel::Warning,
            ReportLevel::Note => ResultLevel::Note,
        }
    }
}

fn sarif(results: Vec<SarifResult>) -> Sarif {
    Sarif::builder()
        .version("2.1.0")
        .schema(SCHEMA_URI)
        .runs([Run::builder()
            .tool(
                Tool::builder()
                    .driver(
                        ToolComponent::builder()
                            .name("Argus")
                            .version(env!("CARGO_PKG_VERSION"))
                            .build(),
                    )
                    .build(),
            )
            .results(results)
            .build()])
        .build()
}

/// Renders the markdown-ish sink list embedded in result messages:
/// `[exec](0),[setOutput](1)`.
fn sink_links(sinks: &[SinkRecord]) -> String {
    sinks
        .iter()
        .enumerate()
        .map(|(i, sink)| {
            let label = if sink.function.is_empty() {
                "Here"
            } else {
                &sink.function
            };
            format!("[{label}]({i})")
        })
        .join(",")
}

/// Parses the line number out of a `uri:line:col` location string.
fn location_line(location: &str) -> Option<i64> {
    let mut parts = location.rsplit(':');
    let _col = parts.next()?;
    parts.next()?.parse().ok()
}

fn location(uri: &str, id: Option<i64>, with_region: bool) -> SarifLocation {
    let artifact = ArtifactLocation::builder().uri(uri).build();

    let physical = match (with_region, location_line(uri)) {
        (true, Some(line)) => PhysicalLocation::builder()
            .artifact_location(artifact)
            .region(Region::builder().start_line(line).build())
            .build(),
        _ => PhysicalLocation::builder()
            .artifact_location(artifact)
            .build(),
    };

    match id {
        Some(id) => SarifLocation::builder()
            .physical_location(physical)
            .id(id)
            .build(),
        None => SarifLocation::builder().physical_location(physical).build(),
    }
}

fn flow_result(
    flow: &FlowRecord,
    rule: (&str, i64),
    message: String,
    level: ResultLevel,
    with_regions: bool,
) -> SarifResult {
    SarifResult::builder()
        .rule_id(rule.0)
        .rule_index(rule.1)
        .level(level)
        .message(Message::builder().text(message).build())
        .locations([location(&flow.location, None, with_regions)])
        .related_locations(
            flow.sinks
                .iter()
                .enumerate()
                .map(|(i, sink)| location(&sink.location, Some(i as i64), with_regions))
                .collect::<Vec<_>>(),
        )
        .build()
}

/// Builds the SARIF log for a workflow analysis.
///
/// Rule indices: ArgToSink=0, ContextToSink=1, ArgToOutput=2,
/// ContextToOutput=3.
pub(crate) fn build_workflow_sarif(report: &WorkflowReport) -> Sarif {
    let mut results = vec![];

    let categories: [(&str, i64, &[FlowRecord], &str); 4] = [
        ("ArgToSink", 0, &report.summary.arg_to_sink, "sink"),
        ("ContextToSink", 1, &report.summary.context_to_sink, "sink"),
        ("ArgToOutput", 2, &report.summary.arg_to_output, "output"),
        (
            "ContextToOutput",
            3,
            &report.summary.context_to_output,
            "output",
        ),
    ];

    for (rule, index, flows, target) in categories {
        let what = if rule.starts_with("Arg") {
            "Argument"
        } else {
            "Context"
        };
        for flow in flows {
            let (severity, level) = report.classify(flow);
            let message = format!(
                "[{severity}] {what} {name} flows to {target} {links}",
                name = flow.name,
                links = sink_links(&flow.sinks)
            );
            results.push(flow_result(flow, (rule, index), message, level.into(), false));
        }
    }

    sarif(results)
}

const SINK_TAIL: &str = "It is possible that a user of this action could pass in a tainted \
                         parameter that could cause the action to behave in an unexpected way.";
const PROPAGATION_TAIL: &str =
    "It is possible that a user of this action could use this output in an insecure manner.";

/// Builds the SARIF log for an action analysis.
///
/// JS actions use the seven-category rule table with source regions;
/// composite actions use the four-category table without regions.
pub(crate) fn build_action_sarif(report: &ActionReport) -> Sarif {
    match report.kind {
        ActionKind::JavaScript => js_action_sarif(report),
        _ => composite_action_sarif(report),
    }
}

fn js_action_sarif(report: &ActionReport) -> Sarif {
    let summary = &report.summary;
    let mut results = vec![];

    let categories: [(&str, i64, &[FlowRecord], String, ResultLevel); 7] = [
        (
            "ArgToSink",
            0,
            &summary.arg_to_sink,
            format!("An input argument ({{name}}) is being passed into a dangerous sink ({{links}}). {SINK_TAIL}"),
            ResultLevel::Warning,
        ),
        (
            "EnvToSink",
            1,
            &summary.env_to_sink,
            format!("An environment variable ({{name}}) is being passed into a dangerous sink ({{links}}). {SINK_TAIL}"),
            ResultLevel::Warning,
        ),
        (
            "ContextToSink",
            2,
            &summary.context_to_sink,
            format!("A tainted Context Variable ({{name}}) is being passed into a dangerous sink ({{links}}). {SINK_TAIL}"),
            ResultLevel::Error,
        ),
        (
            "ArgToOutput",
            3,
            &summary.arg_to_output,
            format!("An input argument ({{name}}) is being passed back as an output ({{links}}). {PROPAGATION_TAIL}"),
            ResultLevel::Note,
        ),
        (
            "ArgToEnv",
            4,
            &summary.arg_to_env,
            format!("An input argument ({{name}}) is being passed back as an environment variable ({{links}}). {PROPAGATION_TAIL}"),
            ResultLevel::Note,
        ),
        (
            "ContextToOutput",
            5,
            &summary.context_to_output,
            format!("A tainted Context Variable ({{name}}) is being passed back as an output ({{links}}). {PROPAGATION_TAIL}"),
            ResultLevel::Note,
        ),
        (
            "ContextToEnv",
            6,
            &summary.context_to_env,
            format!("A tainted Context Variable ({{name}}) is being passed back as an environment variable ({{links}}). {PROPAGATION_TAIL}"),
            ResultLevel::Note,
        ),
    ];

    for (rule, index, flows, template, level) in categories {
        for flow in flows {
            let message = template
                .replace("{name}", &flow.name)
                .replace("{links}", &sink_links(&flow.sinks));
            results.push(flow_result(flow, (rule, index), message, level.clone(), true));
        }
    }

    sarif(results)
}

fn composite_action_sarif(report: &ActionReport) -> Sarif {
    let summary = &report.summary;
    let mut results = vec![];

    let categories: [(&str, i64, &[FlowRecord], String, ResultLevel); 4] = [
        (
            "ArgToSink",
            0,
            &summary.arg_to_sink,
            format!("An input argument ({{name}}) is being passed into a dangerous sink ({{links}}). {SINK_TAIL}"),
            ResultLevel::Warning,
        ),
        (
            "ContextToSink",
            1,
            &summary.context_to_sink,
            format!("A tainted Context Variable ({{name}}) is being passed into a dangerous sink ({{links}}). {SINK_TAIL}"),
            ResultLevel::Error,
        ),
        (
            "ArgToOutput",
            2,
            &summary.arg_to_output,
            format!("An input argument ({{name}}) is being passed back as an output ({{links}}). {PROPAGATION_TAIL}"),
            ResultLevel::Note,
        ),
        (
            "ContextToOutput",
            3,
            &summary.context_to_output,
            format!("A tainted Context Variable ({{name}}) is being passed back as an output ({{links}}). {PROPAGATION_TAIL}"),
            ResultLevel::Note,
        ),
    ];

    for (rule, index, flows, template, level) in categories {
        for flow in flows {
            let message = template
                .replace("{name}", &flow.name)
                .replace("{links}", &sink_links(&flow.sinks));
            results.push(flow_result(flow, (rule, index), message, level.clone(), false));
        }
    }

    sarif(results)
}

#[cfg(test)]
mod tests {
    use camino::Utf8PathBuf;

    use super::{build_action_sarif, build_workflow_sarif, location_line, sink_links};
    use crate::ir::TaintKind;
    use crate::models::ActionKind;
    use crate::report::{ActionReport, WorkflowReport};
    use crate::summary::{ActionSummary, FlowRecord, SinkRecord, WorkflowSummary};

    fn flow(name: &str) -> FlowRecord {
        FlowRecord {
            name: name.into(),
            kind: TaintKind::Context,
            location: "file:/tmp/octo#hello/index.js:6:16".into(),
            sinks: vec![SinkRecord {
                function: "exec".into(),
                taint_name: String::new(),
                location: "file:/tmp/octo#hello/index.js:26:5".into(),
            }],
        }
    }

    #[test]
    fn test_sink_links() {
        let f = flow("x");
        assert_eq!(sink_links(&f.sinks), "[exec](0)");
    }

    #[test]
    fn test_location_line() {
        assert_eq!(location_line("file:/a/b.js:26:5"), Some(26));
        assert_eq!(location_line("no-line"), None);
    }

    #[test]
    fn test_workflow_rule_indices_are_stable() {
        let report = WorkflowReport {
            name: "ci".into(),
            path: Utf8PathBuf::from("ci.yml"),
            write_permission: true,
            has_secrets: false,
            summary: WorkflowSummary {
                arg_to_sink: vec![flow("script")],
                context_to_sink: vec![flow("github.event.issue.title")],
                arg_to_output: vec![flow("tag")],
                context_to_output: vec![flow("github.head_ref")],
            },
        };

        let sarif = serde_json::to_value(build_workflow_sarif(&report)).unwrap();
        let results = sarif["runs"][0]["results"].as_array().unwrap();
        assert_eq!(results.len(), 4);

        let pairs = results
            .iter()
            .map(|r| {
                (
                    r["ruleId"].as_str().unwrap().to_string(),
                    r["ruleIndex"].as_i64().unwrap(),
                )
            })
            .collect::<Vec<_>>();
        assert_eq!(
            pairs,
            vec![
                ("ArgToSink".to_string(), 0),
                ("ContextToSink".to_string(), 1),
                ("ArgToOutput".to_string(), 2),
                ("ContextToOutput".to_string(), 3),
            ]
        );

        // An issue-title flow in a privileged workflow is an error.
        assert_eq!(results[1]["level"], "error");
        assert!(
            results[1]["message"]["text"]
                .as_str()
                .unwrap()
                .starts_with("[High Severity]")
        );
    }

    #[test]
    fn test_js_action_report_shape() {
        let report = ActionReport {
            name: "octo/hello".into(),
            kind: ActionKind::JavaScript,
            summary: ActionSummary {
                context_to_sink: vec![flow("context ... e.title")],
                ..ActionSummary::default()
            },
        };

        let sarif = serde_json::to_value(build_action_sarif(&report)).unwrap();
        let results = sarif["runs"][0]["results"].as_array().unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0]["ruleId"], "ContextToSink");
        assert_eq!(results[0]["ruleIndex"], 2);
        assert_eq!(results[0]["level"], "error");
        // JS reports carry source regions parsed from the location.
        assert_eq!(
            results[0]["locations"][0]["physicalLocation"]["region"]["startLine"],
            6
        );
    }

    #[test]
    fn test_composite_action_report_shape() {
        let report = ActionReport {
            name: "octo/composite".into(),
            kind: ActionKind::Composite,
            summary: ActionSummary {
                arg_to_sink: vec![flow("script")],
                context_to_output: vec![flow("github.head_ref")],
                ..ActionSummary::default()
            },
        };

        let sarif = serde_json::to_value(build_action_sarif(&report)).unwrap();
        let results = sarif["runs"][0]["results"].as_array().unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0]["ruleIndex"], 0);
        assert_eq!(results[1]["ruleId"], "ContextToOutput");
        assert_eq!(results[1]["ruleIndex"], 3);
    }
}
