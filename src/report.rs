//! Report assembly: engine results plus the workflow facts that drive
//! severity classification.

use camino::Utf8PathBuf;

use crate::ir::WorkflowIr;
use crate::models::ActionKind;
use crate::sources::{self, Severity};
use crate::summary::{ActionSummary, FlowRecord, WorkflowSummary};

/// SARIF result levels, in the tool's own vocabulary.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum ReportLevel {
    Error,
    Warning,
    Note,
}

/// The analysis result of one workflow.
#[derive(Debug)]
pub(crate) struct WorkflowReport {
    pub(crate) name: String,
    pub(crate) path: Utf8PathBuf,
    pub(crate) write_permission: bool,
    pub(crate) has_secrets: bool,
    pub(crate) summary: WorkflowSummary,
}

impl WorkflowReport {
    pub(crate) fn new(ir: &WorkflowIr, summary: WorkflowSummary) -> Self {
        Self {
            name: ir.name.clone(),
            path: ir.path.clone(),
            write_permission: ir.write_permission,
            has_secrets: ir.has_secrets(),
            summary,
        }
    }

    /// Classifies a flow for reporting.
    ///
    /// Severity only escalates when the workflow has something worth
    /// taking: write permissions or secrets in scope. Otherwise every
    /// flow reports as a note.
    pub(crate) fn classify(&self, flow: &FlowRecord) -> (&'static str, ReportLevel) {
        if !(self.write_permission || self.has_secrets) {
            return ("Low Severity", ReportLevel::Note);
        }

        match sources::severity_for(&flow.name) {
            Severity::High => ("High Severity", ReportLevel::Error),
            Severity::Medium => ("Medium Severity", ReportLevel::Warning),
            Severity::Low => ("Low Severity", ReportLevel::Note),
        }
    }
}

/// The analysis result of one action, in either of its report shapes.
#[derive(Debug)]
pub(crate) struct ActionReport {
    pub(crate) name: String,
    pub(crate) kind: ActionKind,
    pub(crate) summary: ActionSummary,
}

#[cfg(test)]
mod tests {
    use camino::Utf8PathBuf;

    use super::{ReportLevel, WorkflowReport};
    use crate::summary::{FlowRecord, WorkflowSummary};

    fn report(write_permission: bool, has_secrets: bool) -> WorkflowReport {
        WorkflowReport {
            name: "ci".into(),
            path: Utf8PathBuf::from(".github/workflows/ci.yml"),
            write_permission,
            has_secrets,
            summary: WorkflowSummary::default(),
        }
    }

    fn flow(name: &str) -> FlowRecord {
        FlowRecord {
            name: name.into(),
            ..FlowRecord::default()
        }
    }

    #[test]
    fn test_severity_gated_on_write_permissions() {
        let privileged = report(true, false);
        assert_eq!(
            privileged.classify(&flow("github.event.issue.title")),
            ("High Severity", ReportLevel::Error)
        );
        assert_eq!(
            privileged.classify(&flow("github.event.head_commit.message")),
            ("Medium Severity", ReportLevel::Warning)
        );
        assert_eq!(
            privileged.classify(&flow("github.head_ref")),
            ("Low Severity", ReportLevel::Note)
        );

        let unprivileged = report(false, false);
        assert_eq!(
            unprivileged.classify(&flow("github.event.issue.title")),
            ("Low Severity", ReportLevel::Note)
        );
    }

    #[test]
    fn test_secrets_escalate_like_write_permissions() {
        let with_secrets = report(false, true);
        assert_eq!(
            with_secrets.classify(&flow("github.event.issue.title")),
            ("High Severity", ReportLevel::Error)
        );
    }
}
