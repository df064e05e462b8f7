//! Callee summaries: the contract between a caller's analysis and the
//! analysis of the actions and reusable workflows it invokes.
//!
//! A summary is a fixed-shape set of source-to-sink and
//! source-to-output flows. Callers translate these mechanically into
//! taint-propagation and sink-check operations against their own state.

use crate::codeql::RawJsReport;
use crate::ir::{NamedValue, TaintKind};
use crate::sources;

/// One sink (or propagation target) reached by a flow.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub(crate) struct SinkRecord {
    /// The callee function or sink label (`exec`, `setOutput`, ...).
    pub(crate) function: String,
    /// The name the flow is visible under on the caller side, e.g. the
    /// output variable written by `setOutput`.
    pub(crate) taint_name: String,
    pub(crate) location: String,
}

/// One summarized flow from a named source.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub(crate) struct FlowRecord {
    pub(crate) name: String,
    pub(crate) kind: TaintKind,
    pub(crate) location: String,
    pub(crate) sinks: Vec<SinkRecord>,
}

impl FlowRecord {
    /// Re-packs this flow so the caller's engine can run its taint
    /// algebra over it.
    pub(crate) fn to_value(&self) -> NamedValue {
        NamedValue {
            name: self.name.clone(),
            kind: self.kind,
            value: String::new(),
            refs: vec![],
            sinks: self.sinks.clone(),
        }
    }
}

/// Flows a workflow exposes to its callers.
#[derive(Clone, Debug, Default)]
pub(crate) struct WorkflowSummary {
    pub(crate) arg_to_sink: Vec<FlowRecord>,
    pub(crate) context_to_sink: Vec<FlowRecord>,
    pub(crate) arg_to_output: Vec<FlowRecord>,
    pub(crate) context_to_output: Vec<FlowRecord>,
}

/// Flows an action exposes to its callers.
#[derive(Clone, Debug, Default)]
pub(crate) struct ActionSummary {
    pub(crate) arg_to_sink: Vec<FlowRecord>,
    pub(crate) env_to_sink: Vec<FlowRecord>,
    pub(crate) context_to_sink: Vec<FlowRecord>,
    pub(crate) arg_to_output: Vec<FlowRecord>,
    pub(crate) env_to_output: Vec<FlowRecord>,
    pub(crate) context_to_output: Vec<FlowRecord>,
    pub(crate) arg_to_env: Vec<FlowRecord>,
    pub(crate) env_to_env: Vec<FlowRecord>,
    pub(crate) context_to_env: Vec<FlowRecord>,
}

impl ActionSummary {
    /// Docker actions (and anything else we can't see inside) are
    /// opaque: an empty summary, i.e. a conservative under-approximation.
    pub(crate) fn empty() -> Self {
        Self::default()
    }

    /// Builds a summary from a composite action's own analysis result.
    ///
    /// Composite actions can't be handed environment variables, so the
    /// env-originated flow families stay empty.
    pub(crate) fn from_composite(result: WorkflowSummary) -> Self {
        Self {
            arg_to_sink: result.arg_to_sink,
            context_to_sink: result.context_to_sink,
            arg_to_output: result.arg_to_output,
            context_to_output: result.context_to_output,
            ..Self::default()
        }
    }

    /// Builds a summary from the external JS summarizer's raw report.
    ///
    /// With `low_priority` enabled, the less-dangerous sink partitions
    /// are merged into the consumed flows. Env-originated flows whose
    /// source is a runner-provided variable are dropped here so that
    /// callers never see them.
    pub(crate) fn from_js_report(report: &RawJsReport, low_priority: bool) -> Self {
        let keep_env = |flow: &FlowRecord| !sources::is_safe_env(&flow.name);

        let mut arg_to_sink = report.arg_to_sink.clone();
        let mut env_to_sink = report.env_to_sink.clone();
        let mut context_to_sink = report.context_to_sink.clone();
        if low_priority {
            arg_to_sink.extend(report.arg_to_lsink.iter().cloned());
            env_to_sink.extend(report.env_to_lsink.iter().cloned());
            context_to_sink.extend(report.context_to_lsink.iter().cloned());
        }
        env_to_sink.retain(keep_env);

        let only = |flows: &[FlowRecord], function: &str| -> Vec<FlowRecord> {
            flows
                .iter()
                .filter_map(|flow| {
                    let sinks = flow
                        .sinks
                        .iter()
                        .filter(|sink| sink.function == function)
                        .cloned()
                        .collect::<Vec<_>>();
                    (!sinks.is_empty()).then(|| FlowRecord {
                        sinks,
                        ..flow.clone()
                    })
                })
                .collect()
        };

        let mut env_to_output = only(&report.env_to_output, "setOutput");
        env_to_output.retain(keep_env);
        let mut env_to_env = only(&report.env_to_output, "exportVariable");
        env_to_env.retain(keep_env);

        Self {
            arg_to_sink,
            env_to_sink,
            context_to_sink,
            arg_to_output: only(&report.arg_to_output, "setOutput"),
            env_to_output,
            context_to_output: only(&report.context_to_output, "setOutput"),
            arg_to_env: only(&report.arg_to_output, "exportVariable"),
            env_to_env,
            context_to_env: only(&report.context_to_output, "exportVariable"),
        }
    }
}

/// An analyzed action: its declared input surface plus its summary.
#[derive(Clone, Debug, Default)]
pub(crate) struct AnalyzedAction {
    pub(crate) name: String,
    pub(crate) inputs: Vec<NamedValue>,
    pub(crate) summary: ActionSummary,
}

/// An analyzed reusable workflow: declared inputs plus its summary.
#[derive(Clone, Debug, Default)]
pub(crate) struct AnalyzedWorkflow {
    pub(crate) inputs: Vec<NamedValue>,
    pub(crate) summary: WorkflowSummary,
}

#[cfg(test)]
mod tests {
    use super::{ActionSummary, FlowRecord, SinkRecord};
    use crate::codeql::RawJsReport;
    use crate::ir::TaintKind;

    fn flow(name: &str, kind: TaintKind, sinks: &[(&str, &str)]) -> FlowRecord {
        FlowRecord {
            name: name.into(),
            kind,
            location: "file:/x.js:1:1".into(),
            sinks: sinks
                .iter()
                .map(|(function, taint_name)| SinkRecord {
                    function: (*function).into(),
                    taint_name: (*taint_name).into(),
                    location: "file:/x.js:2:1".into(),
                })
                .collect(),
        }
    }

    #[test]
    fn test_safe_env_filtered() {
        let report = RawJsReport {
            env_to_sink: vec![
                flow("GITHUB_SHA", TaintKind::Env, &[("exec", "")]),
                flow("UNTRUSTED", TaintKind::Env, &[("exec", "")]),
            ],
            ..RawJsReport::default()
        };

        let summary = ActionSummary::from_js_report(&report, false);
        assert_eq!(summary.env_to_sink.len(), 1);
        assert_eq!(summary.env_to_sink[0].name, "UNTRUSTED");
    }

    #[test]
    fn test_low_priority_merge() {
        let report = RawJsReport {
            arg_to_sink: vec![flow("a", TaintKind::Input, &[("exec", "")])],
            arg_to_lsink: vec![flow("b", TaintKind::Input, &[("eval", "")])],
            ..RawJsReport::default()
        };

        assert_eq!(ActionSummary::from_js_report(&report, false).arg_to_sink.len(), 1);
        assert_eq!(ActionSummary::from_js_report(&report, true).arg_to_sink.len(), 2);
    }

    #[test]
    fn test_output_vs_env_discrimination() {
        let report = RawJsReport {
            arg_to_output: vec![flow(
                "x",
                TaintKind::Input,
                &[("setOutput", "y"), ("exportVariable", "Z")],
            )],
            ..RawJsReport::default()
        };

        let summary = ActionSummary::from_js_report(&report, false);
        assert_eq!(summary.arg_to_output.len(), 1);
        assert_eq!(summary.arg_to_output[0].sinks[0].taint_name, "y");
        assert_eq!(summary.arg_to_env.len(), 1);
        assert_eq!(summary.arg_to_env[0].sinks[0].taint_name, "Z");
    }
}
