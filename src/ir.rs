//! The analysis intermediate representation.
//!
//! A loaded workflow is flattened into task groups (jobs) and tasks
//! (steps), ordered topologically over `needs`. Every taintable string
//! is projected into a uniform [`NamedValue`] carrying its extracted
//! `${{ ... }}` references, so the engine never touches raw YAML.

use anyhow::{Result, anyhow};
use camino::Utf8PathBuf;
use indexmap::IndexMap;

use crate::expr::{self, ExprRef, RefKind};
use crate::models::{
    ActionManifest, Env, EnvBlock, Step, WorkflowFile,
    uses::{GitRef, Uses},
};
use crate::summary::SinkRecord;

/// The role a taint node (or taintable value) plays.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub(crate) enum TaintKind {
    Input,
    Env,
    Arg,
    Output,
    JobOutput,
    #[default]
    Context,
    Secret,
    Steps,
    Needs,
    WfOutput,
}

impl std::fmt::Display for TaintKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TaintKind::Input => "input",
            TaintKind::Env => "env",
            TaintKind::Arg => "arg",
            TaintKind::Output => "output",
            TaintKind::JobOutput => "job_output",
            TaintKind::Context => "context",
            TaintKind::Secret => "secret",
            TaintKind::Steps => "steps",
            TaintKind::Needs => "needs",
            TaintKind::WfOutput => "wf_output",
        };
        write!(f, "{name}")
    }
}

impl From<RefKind> for TaintKind {
    fn from(kind: RefKind) -> Self {
        match kind {
            RefKind::Secret => TaintKind::Secret,
            RefKind::Env => TaintKind::Env,
            RefKind::Steps => TaintKind::Steps,
            RefKind::Needs => TaintKind::Needs,
            RefKind::Inputs => TaintKind::Input,
            // Everything else is some flavor of runner-provided context.
            RefKind::Context
            | RefKind::Runner
            | RefKind::Job
            | RefKind::Jobs
            | RefKind::Matrix
            | RefKind::Strategy => TaintKind::Context,
        }
    }
}

/// The uniform shape of every taintable named value: a name, the value
/// text, and the references extracted from it. `sinks` is populated
/// only for values derived from callee summary flows.
#[derive(Clone, Debug)]
pub(crate) struct NamedValue {
    pub(crate) name: String,
    pub(crate) kind: TaintKind,
    pub(crate) value: String,
    pub(crate) refs: Vec<ExprRef>,
    pub(crate) sinks: Vec<SinkRecord>,
}

impl NamedValue {
    pub(crate) fn new(name: impl Into<String>, kind: TaintKind, value: impl Into<String>) -> Self {
        let value = value.into();
        let refs = expr::extract_refs(&value);
        Self {
            name: name.into(),
            kind,
            value,
            refs,
            sinks: vec![],
        }
    }

    /// Wraps a single extracted reference so it can be checked directly.
    pub(crate) fn from_ref(r: &ExprRef) -> Self {
        Self {
            name: r.name.clone(),
            kind: r.kind.into(),
            value: r.expression.clone(),
            refs: vec![r.clone()],
            sinks: vec![],
        }
    }
}

/// Projects an env-or-expression block into named values.
pub(crate) fn pack_env_block(block: Option<&EnvBlock>, kind: TaintKind) -> Vec<NamedValue> {
    match block {
        None => vec![],
        Some(EnvBlock::Literal(env)) => pack_env(Some(env), kind),
        // The whole block is one expression; track it under a
        // synthesized name so its references still flow.
        Some(EnvBlock::Raw(value)) => {
            vec![NamedValue::new(format!("special_case_{kind}"), kind, value)]
        }
    }
}

/// Projects a literal mapping into named values.
pub(crate) fn pack_env(env: Option<&Env>, kind: TaintKind) -> Vec<NamedValue> {
    let Some(env) = env else {
        return vec![];
    };

    env.iter()
        .map(|(name, value)| NamedValue::new(name, kind, value.to_string()))
        .collect()
}

/// A step that invokes another action.
#[derive(Clone, Debug)]
pub(crate) struct ActionTask {
    pub(crate) raw: String,
    pub(crate) uses: Uses,
    pub(crate) args: Vec<NamedValue>,
}

/// A step that runs a shell command.
#[derive(Clone, Debug)]
pub(crate) struct RunTask {
    pub(crate) command: String,
    pub(crate) shell: String,
    pub(crate) refs: Vec<ExprRef>,
}

#[derive(Clone, Debug)]
pub(crate) enum TaskKind {
    Action(ActionTask),
    Run(RunTask),
}

/// One step of a normal job, with its step-scoped env.
#[derive(Clone, Debug)]
pub(crate) struct Task {
    pub(crate) id: String,
    pub(crate) step_no: usize,
    pub(crate) env: Vec<NamedValue>,
    pub(crate) kind: TaskKind,
}

/// Where a reusable-workflow call points.
#[derive(Clone, Debug)]
pub(crate) enum ReusableTarget {
    /// `uses: ./.github/workflows/x.yml` within the same repository.
    Local { path: String },
    /// `uses: owner/repo/.github/workflows/x.yml@ref`.
    Remote {
        slug: String,
        path: String,
        git_ref: Option<GitRef>,
    },
}

/// A job that calls a reusable workflow.
#[derive(Clone, Debug)]
pub(crate) struct ReusableCall {
    pub(crate) raw: String,
    pub(crate) args: Vec<NamedValue>,
    pub(crate) target: ReusableTarget,
}

#[derive(Clone, Debug)]
pub(crate) enum TaskGroupKind {
    Normal { tasks: Vec<Task> },
    Reusable(ReusableCall),
}

/// One job of a workflow.
#[derive(Clone, Debug)]
pub(crate) struct TaskGroup {
    pub(crate) id: String,
    pub(crate) needs: Vec<String>,
    pub(crate) env: Vec<NamedValue>,
    pub(crate) outputs: Vec<NamedValue>,
    pub(crate) kind: TaskGroupKind,
}

/// A whole workflow in analysis form. `groups` is already in
/// topological order over `needs`.
#[derive(Clone, Debug)]
pub(crate) struct WorkflowIr {
    pub(crate) name: String,
    pub(crate) path: Utf8PathBuf,
    pub(crate) write_permission: bool,
    pub(crate) inputs: Vec<NamedValue>,
    pub(crate) input_secrets: Vec<NamedValue>,
    pub(crate) outputs: Vec<NamedValue>,
    pub(crate) env: Vec<NamedValue>,
    pub(crate) groups: Vec<TaskGroup>,
}

impl WorkflowIr {
    pub(crate) fn build(workflow: &WorkflowFile) -> Result<Self> {
        let call = workflow.workflow_call();

        let inputs = call
            .iter()
            .flat_map(|call| call.inputs.iter())
            .map(|(name, input)| {
                let default = input
                    .as_ref()
                    .and_then(|i| i.default.as_ref())
                    .map(ToString::to_string)
                    .unwrap_or_default();
                NamedValue::new(name, TaintKind::Input, default)
            })
            .collect();

        let input_secrets = call
            .iter()
            .flat_map(|call| call.secrets.keys())
            .map(|name| NamedValue::new(name, TaintKind::Secret, ""))
            .collect();

        let outputs = call
            .iter()
            .flat_map(|call| call.outputs.iter())
            .map(|(name, output)| {
                let value = output
                    .value
                    .as_ref()
                    .map(ToString::to_string)
                    .unwrap_or_default();
                NamedValue::new(name, TaintKind::WfOutput, value)
            })
            .collect();

        let groups = workflow
            .jobs
            .iter()
            .map(|(id, job)| build_group(id, job))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            name: workflow.display_name(),
            path: workflow.rel_path.clone(),
            write_permission: workflow.write_permission(),
            inputs,
            input_secrets,
            outputs,
            env: pack_env_block(workflow.env.as_ref(), TaintKind::Env),
            groups: topological_order(groups)?,
        })
    }

    /// A workflow is reusable iff it declares call inputs or outputs.
    pub(crate) fn is_reusable(&self) -> bool {
        !self.inputs.is_empty() || !self.outputs.is_empty()
    }

    /// Every reference extracted anywhere in this workflow.
    pub(crate) fn all_refs(&self) -> Vec<&ExprRef> {
        let mut refs: Vec<&ExprRef> = vec![];

        for value in self
            .env
            .iter()
            .chain(&self.inputs)
            .chain(&self.outputs)
        {
            refs.extend(&value.refs);
        }

        for group in &self.groups {
            for value in group.env.iter().chain(&group.outputs) {
                refs.extend(&value.refs);
            }
            match &group.kind {
                TaskGroupKind::Reusable(call) => {
                    for value in &call.args {
                        refs.extend(&value.refs);
                    }
                }
                TaskGroupKind::Normal { tasks } => {
                    for task in tasks {
                        for value in &task.env {
                            refs.extend(&value.refs);
                        }
                        match &task.kind {
                            TaskKind::Action(action) => {
                                for value in &action.args {
                                    refs.extend(&value.refs);
                                }
                            }
                            TaskKind::Run(run) => refs.extend(&run.refs),
                        }
                    }
                }
            }
        }

        refs
    }

    pub(crate) fn has_secrets(&self) -> bool {
        self.all_refs()
            .iter()
            .any(|r| r.kind == crate::expr::RefKind::Secret)
    }
}

fn build_group(id: &str, job: &crate::models::Job) -> Result<TaskGroup> {
    let env = pack_env_block(job.env.as_ref(), TaintKind::Env);
    let outputs = pack_env(job.outputs.as_ref(), TaintKind::Output);

    let kind = match &job.uses {
        Some(raw) => TaskGroupKind::Reusable(ReusableCall {
            raw: raw.clone(),
            args: pack_env(job.with.as_ref(), TaintKind::Arg),
            target: reusable_target(raw)?,
        }),
        None => TaskGroupKind::Normal {
            tasks: job
                .steps
                .iter()
                .enumerate()
                .filter_map(|(step_no, step)| build_task(step_no, step))
                .collect(),
        },
    };

    Ok(TaskGroup {
        id: id.into(),
        needs: job.needs.clone(),
        env,
        outputs,
        kind,
    })
}

fn build_task(step_no: usize, step: &Step) -> Option<Task> {
    let id = step
        .id
        .clone()
        .unwrap_or_else(|| format!("task_{step_no}"));
    let env = pack_env_block(step.env.as_ref(), TaintKind::Env);

    let kind = if let Some(raw) = &step.run {
        TaskKind::Run(RunTask {
            command: raw.clone(),
            shell: step.shell.clone().unwrap_or_else(|| "bash".into()),
            refs: expr::extract_refs(raw),
        })
    } else if let Some(raw) = &step.uses {
        match Uses::parse(raw) {
            Ok(uses) => TaskKind::Action(ActionTask {
                raw: raw.clone(),
                uses,
                args: pack_env(step.with.as_ref(), TaintKind::Arg),
            }),
            Err(err) => {
                tracing::warn!("skipping step {id}: {err}");
                return None;
            }
        }
    } else {
        tracing::warn!("skipping step {id}: neither run nor uses");
        return None;
    };

    Some(Task {
        id,
        step_no,
        env,
        kind,
    })
}

/// Splits a reusable-workflow `uses:` into its target form.
fn reusable_target(raw: &str) -> Result<ReusableTarget> {
    let raw = raw.trim();

    if let Some(path) = raw.strip_prefix("./") {
        let path = match path.split_once('@') {
            Some((path, _)) => path,
            None => path,
        };
        return Ok(ReusableTarget::Local { path: path.into() });
    }

    let (path, git_ref) = match raw.rsplit_once('@') {
        Some((path, git_ref)) => (path, Some(GitRef::decode(git_ref))),
        None => (raw, None),
    };

    let segments = path.split('/').collect::<Vec<_>>();
    if segments.len() < 3 {
        return Err(anyhow!("invalid reusable workflow reference: {raw}"));
    }

    Ok(ReusableTarget::Remote {
        slug: format!("{}/{}", segments[0], segments[1]),
        path: segments[2..].join("/"),
        git_ref,
    })
}

/// Orders task groups so every group appears after all of its `needs`.
///
/// Classic worklist with in-degree counting; a non-empty remainder
/// means the `needs` graph is cyclic, which is a fatal analysis error.
fn topological_order(groups: Vec<TaskGroup>) -> Result<Vec<TaskGroup>> {
    let ids = groups.iter().map(|g| g.id.clone()).collect::<Vec<_>>();

    let mut in_degree: IndexMap<&str, usize> = ids.iter().map(|id| (id.as_str(), 0)).collect();
    for group in &groups {
        for need in &group.needs {
            if !in_degree.contains_key(need.as_str()) {
                return Err(anyhow!(
                    "job '{id}' needs unknown job '{need}'",
                    id = group.id
                ));
            }
        }
        in_degree[group.id.as_str()] = group.needs.len();
    }

    let mut ready = ids
        .iter()
        .filter(|id| in_degree[id.as_str()] == 0)
        .cloned()
        .collect::<std::collections::VecDeque<_>>();

    let mut order: Vec<String> = vec![];
    while let Some(id) = ready.pop_front() {
        order.push(id.clone());
        for group in &groups {
            if group.needs.iter().any(|need| *need == id) {
                let degree = &mut in_degree[group.id.as_str()];
                *degree -= 1;
                if *degree == 0 {
                    ready.push_back(group.id.clone());
                }
            }
        }
    }

    if order.len() != groups.len() {
        return Err(anyhow!("circular job dependency via `needs`"));
    }

    let mut by_id: IndexMap<String, TaskGroup> =
        groups.into_iter().map(|g| (g.id.clone(), g)).collect();
    Ok(order
        .into_iter()
        .map(|id| by_id.shift_remove(&id).unwrap())
        .collect())
}

/// Builds the implicit task group of a composite action: its steps,
/// with no job-level env or declared needs.
pub(crate) fn action_task_group(name: &str, manifest: &ActionManifest) -> TaskGroup {
    TaskGroup {
        id: name.into(),
        needs: vec![],
        env: vec![],
        outputs: vec![],
        kind: TaskGroupKind::Normal {
            tasks: manifest
                .runs
                .steps
                .iter()
                .enumerate()
                .filter_map(|(step_no, step)| build_task(step_no, step))
                .collect(),
        },
    }
}

/// An action's declared inputs, with default values, in packed form.
pub(crate) fn action_inputs(manifest: &ActionManifest) -> Vec<NamedValue> {
    manifest
        .inputs
        .iter()
        .map(|(name, input)| {
            let default = input
                .default
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_default();
            NamedValue::new(name, TaintKind::Input, default)
        })
        .collect()
}

/// An action's declared outputs, in packed form.
pub(crate) fn action_outputs(manifest: &ActionManifest) -> Vec<NamedValue> {
    manifest
        .outputs
        .iter()
        .map(|(name, output)| {
            let value = output
                .value
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_default();
            NamedValue::new(name, TaintKind::WfOutput, value)
        })
        .collect()
}
