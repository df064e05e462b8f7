//! The cross-artifact taint propagation engine.
//!
//! One engine instance is bound to exactly one analysis unit (a
//! workflow or a composite action). Taint nodes live in an
//! append-only arena forming a provenance DAG: parents are always
//! allocated before their children, so cycles are impossible by
//! construction. Scope-stacked state (workflow/job/step env, step
//! args, step and job outputs) mirrors the runtime lifetimes of the
//! corresponding bindings.
//!
//! Callees (actions, reusable workflows) are reached through the
//! [`Resolver`] seam; their summaries are consumed by mechanically
//! translating each summarized flow back into taint or sink-check
//! operations against the caller's state.

use std::rc::Rc;

use indexmap::IndexMap;

use crate::expr::{ExprRef, RefKind};
use crate::ir::{
    ActionTask, NamedValue, ReusableCall, RunTask, TaintKind, Task, TaskGroup, TaskGroupKind,
    TaskKind, WorkflowIr,
};
use crate::models::uses::Uses;
use crate::shell;
use crate::sources;
use crate::summary::{
    AnalyzedAction, AnalyzedWorkflow, FlowRecord, SinkRecord, WorkflowSummary,
};

pub(crate) type NodeId = usize;

/// A node in the provenance DAG.
#[derive(Clone, Debug)]
pub(crate) struct TaintNode {
    pub(crate) name: String,
    pub(crate) kind: TaintKind,
    pub(crate) location: String,
    pub(crate) is_object: bool,
    /// Arena indices of the upstream nodes. Empty means this node is a
    /// root, i.e. a taint source.
    pub(crate) parents: Vec<NodeId>,
    /// Set on terminal nodes attached to an alert.
    pub(crate) sink_location: Option<String>,
}

/// Append-only node storage. Parent links always point at smaller
/// indices, which keeps the parent relation acyclic.
#[derive(Debug, Default)]
pub(crate) struct TaintArena {
    nodes: Vec<TaintNode>,
}

impl TaintArena {
    fn alloc(&mut self, node: TaintNode) -> NodeId {
        let id = self.nodes.len();
        debug_assert!(node.parents.iter().all(|parent| *parent < id));
        self.nodes.push(node);
        id
    }

    pub(crate) fn get(&self, id: NodeId) -> &TaintNode {
        &self.nodes[id]
    }

    pub(crate) fn len(&self) -> usize {
        self.nodes.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (NodeId, &TaintNode)> {
        self.nodes.iter().enumerate()
    }

    /// The transitive root set of a node, in first-reached order.
    pub(crate) fn roots(&self, id: NodeId) -> Vec<NodeId> {
        let mut roots = vec![];
        let mut stack = vec![id];
        let mut seen = vec![false; self.nodes.len()];

        while let Some(current) = stack.pop() {
            if seen[current] {
                continue;
            }
            seen[current] = true;

            let node = &self.nodes[current];
            if node.parents.is_empty() {
                roots.push(current);
            } else {
                stack.extend(node.parents.iter().rev());
            }
        }

        roots
    }
}

/// Binding lifetimes, outermost first.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum Scope {
    Workflow = 0,
    Job = 1,
    Step = 2,
}

/// Where the taint algebra looks for the sources of a value.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum FlowFrom {
    /// Look up each reference extracted from the value.
    Value,
    /// Unconditionally mint a fresh root (used to seed input identities).
    NewRoot,
    /// Mint a fresh root for a flow the callee classified as
    /// context-originated.
    ContextRoot,
    /// Look up the value's name among tainted step args.
    Arg,
    /// Look up the value's name in the scoped env frames.
    Env,
    /// Look up the value's name among step outputs.
    StepOutput,
    /// Look up the value's name among job outputs.
    #[allow(
        dead_code,
        reason = "job-output lookups currently reach the state via `needs.*` references"
    )]
    JobOutput,
}

/// Where a derived taint binding is recorded.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum FlowTo {
    Env,
    Input,
    Arg,
    StepOutput,
    JobOutput,
    /// Not recorded: the derived node is returned to the caller.
    #[allow(
        dead_code,
        reason = "workflow outputs are checked as sinks rather than re-tainted"
    )]
    WorkflowOutput,
}

impl FlowTo {
    fn kind(self) -> TaintKind {
        match self {
            FlowTo::Env => TaintKind::Env,
            FlowTo::Input => TaintKind::Input,
            FlowTo::Arg => TaintKind::Arg,
            FlowTo::StepOutput => TaintKind::Output,
            FlowTo::JobOutput => TaintKind::JobOutput,
            FlowTo::WorkflowOutput => TaintKind::WfOutput,
        }
    }
}

/// Alert families, named for the flow that raised them.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum AlertKind {
    /// A `${{ ... }}` reference expands directly into a shell command.
    ShellCmdTainted,
    /// A shell command reads a tainted environment variable.
    TaintedEnvShellCmd,
    /// A workflow/action output carries taint to the caller.
    OutputTainted,
    /// A callee summary routes a tainted argument into a sink.
    ArgToSink,
    /// A callee summary routes a tainted env variable into a sink.
    EnvToSink,
    /// A callee reaches a sink from its own context reads.
    ContextToSink,
}

#[derive(Clone, Debug)]
pub(crate) struct Alert {
    pub(crate) kind: AlertKind,
    pub(crate) node: NodeId,
}

/// The analyze-and-summarize seam between a caller's engine and its
/// callees. The production implementation clones and analyzes the
/// callee; tests substitute canned summaries.
pub(crate) trait Resolver {
    fn resolve_action(&self, task: &ActionTask) -> anyhow::Result<Rc<AnalyzedAction>>;
    fn resolve_workflow(&self, call: &ReusableCall) -> anyhow::Result<AnalyzedWorkflow>;
}

/// Inputs of well-known actions that execute their value, invisible to
/// static JS analysis of the action itself.
const HARDCODED_SINKS: &[(&str, &str)] = &[("actions/github-script", "script")];

pub(crate) struct TaintEngine<'r> {
    unit_name: String,
    resolver: &'r dyn Resolver,

    pub(crate) arena: TaintArena,
    env: [Vec<NodeId>; 3],
    args: Vec<NodeId>,
    inputs: Vec<NodeId>,
    step_outputs: IndexMap<String, IndexMap<String, Vec<NodeId>>>,
    job_outputs: IndexMap<String, Vec<NodeId>>,

    alerts: Vec<Alert>,

    current_group: Option<String>,
    current_task: Option<(String, usize)>,
    override_location: Option<String>,
}

impl<'r> TaintEngine<'r> {
    pub(crate) fn new(unit_name: impl Into<String>, resolver: &'r dyn Resolver) -> Self {
        Self {
            unit_name: unit_name.into(),
            resolver,
            arena: TaintArena::default(),
            env: [vec![], vec![], vec![]],
            args: vec![],
            inputs: vec![],
            step_outputs: IndexMap::new(),
            job_outputs: IndexMap::new(),
            alerts: vec![],
            current_group: None,
            current_task: None,
            override_location: None,
        }
    }

    pub(crate) fn alerts(&self) -> &[Alert] {
        &self.alerts
    }

    /// Analyzes a whole workflow and returns its summary.
    pub(crate) fn run_workflow(&mut self, ir: &WorkflowIr) -> WorkflowSummary {
        // Workflow inputs are caller-controllable by definition: each
        // becomes a fresh root so flows out of them are attributable.
        self.set_override("workflow_inputs");
        self.taint_values(&ir.inputs, FlowFrom::NewRoot, FlowTo::Input, Scope::Workflow);
        self.clear_override();

        self.taint_values(&ir.env, FlowFrom::Value, FlowTo::Env, Scope::Workflow);

        for group in &ir.groups {
            self.current_group = Some(group.id.clone());

            self.taint_values(&group.env, FlowFrom::Value, FlowTo::Env, Scope::Job);

            match &group.kind {
                TaskGroupKind::Reusable(call) => self.handle_reusable_workflow(call),
                TaskGroupKind::Normal { tasks } => {
                    for task in tasks {
                        tracing::debug!("task: {id}", id = task.id);
                        self.current_task = Some((task.id.clone(), task.step_no));
                        self.handle_task(task);
                        self.current_task = None;
                    }
                }
            }

            self.taint_values(&group.outputs, FlowFrom::Value, FlowTo::JobOutput, Scope::Job);
            self.clear_scope(Scope::Job);
            self.current_group = None;
        }

        self.pack_results("workflow_outputs", &ir.outputs)
    }

    /// Analyzes a composite action's implicit task group and returns
    /// the flows it exposes.
    pub(crate) fn run_task_group(
        &mut self,
        group: &TaskGroup,
        all_inputs: &[NamedValue],
        outputs: &[NamedValue],
    ) -> WorkflowSummary {
        // Every declared input is tainted, supplied or not: the caller
        // decides which ones it feeds.
        self.set_override("action_inputs");
        self.taint_values(all_inputs, FlowFrom::NewRoot, FlowTo::Input, Scope::Job);
        self.clear_override();

        self.current_group = Some(group.id.clone());
        self.taint_values(&group.env, FlowFrom::Value, FlowTo::Env, Scope::Job);

        match &group.kind {
            TaskGroupKind::Normal { tasks } => {
                for task in tasks {
                    tracing::debug!("task: {id}", id = task.id);
                    self.current_task = Some((task.id.clone(), task.step_no));
                    self.handle_task(task);
                    self.current_task = None;
                }
            }
            TaskGroupKind::Reusable(_) => {
                tracing::warn!("composite actions can't call reusable workflows; skipping");
            }
        }

        self.pack_results("outputs", outputs)
    }

    fn handle_task(&mut self, task: &Task) {
        self.taint_values(&task.env, FlowFrom::Value, FlowTo::Env, Scope::Step);

        match &task.kind {
            TaskKind::Action(action) => {
                self.taint_values(&action.args, FlowFrom::Value, FlowTo::Arg, Scope::Step);
                self.handle_action(action);
            }
            TaskKind::Run(run) => self.handle_shell_cmd(run),
        }

        self.clear_scope(Scope::Step);
    }

    fn handle_shell_cmd(&mut self, run: &RunTask) {
        tracing::debug!(
            "shell command: {head}...",
            head = run.command.chars().take(20).collect::<String>()
        );

        // Direct template expansion into the command line.
        let refs = run.refs.iter().map(NamedValue::from_ref).collect::<Vec<_>>();
        self.check_values(&refs, FlowFrom::Value, AlertKind::ShellCmdTainted);

        if run.shell == "bash" || run.shell.is_empty() {
            let parsed = shell::parse_bash_command(&run.command);

            self.check_values(&parsed.env_reads, FlowFrom::Env, AlertKind::TaintedEnvShellCmd);
            // Names introduced through the environment file outlive the
            // job that wrote them; downstream jobs read them by name.
            self.taint_values(
                &parsed.env_writes,
                FlowFrom::Value,
                FlowTo::Env,
                Scope::Workflow,
            );
            self.taint_values(
                &parsed.output_writes,
                FlowFrom::Value,
                FlowTo::StepOutput,
                Scope::Job,
            );
        }
    }

    fn handle_action(&mut self, task: &ActionTask) {
        if let Uses::Docker(docker) = &task.uses {
            // Opaque: no summary, no flows.
            tracing::debug!("docker action {image} is opaque", image = docker.image);
            return;
        }

        let analyzed = match self.resolver.resolve_action(task) {
            Ok(analyzed) => analyzed,
            Err(err) => {
                tracing::warn!(
                    "couldn't analyze action {uses}: {err:#}",
                    uses = task.raw
                );
                Rc::new(AnalyzedAction::default())
            }
        };

        self.check_action_sinks(task, &analyzed);
        self.propagate_action_taint(&analyzed);
    }

    fn check_action_sinks(&mut self, task: &ActionTask, analyzed: &AnalyzedAction) {
        // Inputs the caller didn't supply fall back to their declared
        // defaults, which may themselves carry references.
        for input in &analyzed.inputs {
            if task.args.iter().any(|arg| arg.name == input.name) {
                continue;
            }
            self.taint_values(
                std::slice::from_ref(input),
                FlowFrom::Value,
                FlowTo::Arg,
                Scope::Step,
            );
        }

        let summary = &analyzed.summary;
        self.check_flows(&summary.arg_to_sink, FlowFrom::Arg, AlertKind::ArgToSink);
        self.check_flows(&summary.env_to_sink, FlowFrom::Env, AlertKind::EnvToSink);
        self.check_flows(
            &summary.context_to_sink,
            FlowFrom::NewRoot,
            AlertKind::ContextToSink,
        );

        if let Uses::Repository(repo) = &task.uses {
            let slug = repo.slug();
            for (action, input) in HARDCODED_SINKS.iter().copied() {
                if action != slug {
                    continue;
                }
                let value = NamedValue {
                    name: input.into(),
                    kind: TaintKind::Arg,
                    value: String::new(),
                    refs: vec![],
                    sinks: vec![],
                };
                self.check_values(&[value], FlowFrom::Arg, AlertKind::ArgToSink);
            }
        }
    }

    fn propagate_action_taint(&mut self, analyzed: &AnalyzedAction) {
        let summary = &analyzed.summary;

        self.taint_flows(&summary.arg_to_output, FlowFrom::Arg, FlowTo::StepOutput);
        self.taint_flows(&summary.arg_to_env, FlowFrom::Arg, FlowTo::Env);
        self.taint_flows(&summary.env_to_output, FlowFrom::Env, FlowTo::StepOutput);
        self.taint_flows(&summary.env_to_env, FlowFrom::Env, FlowTo::Env);
        self.taint_flows(
            &summary.context_to_output,
            FlowFrom::ContextRoot,
            FlowTo::StepOutput,
        );
        self.taint_flows(&summary.context_to_env, FlowFrom::ContextRoot, FlowTo::Env);
    }

    fn handle_reusable_workflow(&mut self, call: &ReusableCall) {
        tracing::debug!("reusable workflow: {raw}", raw = call.raw);

        self.set_override("reusable_workflow_inputs");
        self.taint_values(&call.args, FlowFrom::Value, FlowTo::Arg, Scope::Step);
        self.clear_override();

        let analyzed = match self.resolver.resolve_workflow(call) {
            Ok(analyzed) => analyzed,
            Err(err) => {
                tracing::warn!(
                    "couldn't analyze reusable workflow {raw}: {err:#}",
                    raw = call.raw
                );
                AnalyzedWorkflow::default()
            }
        };

        for input in &analyzed.inputs {
            if call.args.iter().any(|arg| arg.name == input.name) {
                continue;
            }
            self.taint_values(
                std::slice::from_ref(input),
                FlowFrom::Value,
                FlowTo::Arg,
                Scope::Step,
            );
        }

        let summary = &analyzed.summary;
        self.check_flows(&summary.arg_to_sink, FlowFrom::Arg, AlertKind::ArgToSink);
        self.check_flows(
            &summary.context_to_sink,
            FlowFrom::NewRoot,
            AlertKind::ContextToSink,
        );

        self.taint_flows(&summary.arg_to_output, FlowFrom::Arg, FlowTo::StepOutput);
        self.taint_flows(
            &summary.context_to_output,
            FlowFrom::ContextRoot,
            FlowTo::StepOutput,
        );
    }

    fn taint_flows(&mut self, flows: &[FlowRecord], from: FlowFrom, to: FlowTo) {
        let values = flows.iter().map(FlowRecord::to_value).collect::<Vec<_>>();
        self.taint_values(&values, from, to, Scope::Job);
    }

    fn check_flows(&mut self, flows: &[FlowRecord], from: FlowFrom, alert: AlertKind) {
        let values = flows.iter().map(FlowRecord::to_value).collect::<Vec<_>>();
        self.check_values(&values, from, alert);
    }

    //
    // The taint algebra.
    //

    /// Runs the source computation for each value and records a derived
    /// node per flow. Returns the derived nodes for
    /// [`FlowTo::WorkflowOutput`], which aren't recorded anywhere.
    pub(crate) fn taint_values(
        &mut self,
        values: &[NamedValue],
        from: FlowFrom,
        to: FlowTo,
        scope: Scope,
    ) -> Vec<NodeId> {
        let mut derived = vec![];

        for item in values {
            let sources = self.sources_for(item, from, Some(to.kind()));
            if sources.is_empty() {
                continue;
            }

            if item.sinks.is_empty() {
                let node = self.alloc_node(&item.name, to.kind(), sources, None);
                if let Some(id) = self.record(node, to, scope) {
                    derived.push(id);
                }
            } else {
                // A summarized flow names the binding after each sink's
                // taint name (e.g. the setOutput key).
                for sink in item.sinks.clone() {
                    let node =
                        self.alloc_node(&sink.taint_name, to.kind(), sources.clone(), None);
                    if let Some(id) = self.record(node, to, scope) {
                        derived.push(id);
                    }
                }
            }
        }

        derived
    }

    /// Runs the source computation and, instead of deriving bindings,
    /// attaches sink locations and raises alerts.
    pub(crate) fn check_values(&mut self, values: &[NamedValue], from: FlowFrom, alert: AlertKind) {
        for item in values {
            let sources = self.sources_for(item, from, None);
            if sources.is_empty() {
                continue;
            }

            let location = self.location();
            let node = self.alloc_node(&item.name, item.kind, sources, Some(location.clone()));
            tracing::info!("alert raised @ {location}");
            self.alerts.push(Alert { kind: alert, node });
        }
    }

    fn alloc_node(
        &mut self,
        name: &str,
        kind: TaintKind,
        parents: Vec<NodeId>,
        sink_location: Option<String>,
    ) -> NodeId {
        let location = self.location();
        self.arena.alloc(TaintNode {
            name: name.into(),
            kind,
            location,
            is_object: false,
            parents,
            sink_location,
        })
    }

    fn alloc_root(&mut self, name: &str, kind: TaintKind, is_object: bool) -> NodeId {
        let location = self.location();
        self.arena.alloc(TaintNode {
            name: name.into(),
            kind,
            location,
            is_object,
            parents: vec![],
            sink_location: None,
        })
    }

    fn record(&mut self, node: NodeId, to: FlowTo, scope: Scope) -> Option<NodeId> {
        match to {
            FlowTo::Env => {
                tracing::debug!(
                    "tainting env {name} at {scope:?}",
                    name = self.arena.get(node).name
                );
                self.env[scope as usize].push(node);
                None
            }
            FlowTo::Input => {
                self.inputs.push(node);
                None
            }
            FlowTo::Arg => {
                self.args.push(node);
                None
            }
            FlowTo::StepOutput => {
                let group = self.current_group.clone().unwrap_or_default();
                let task = self
                    .current_task
                    .as_ref()
                    .map(|(id, _)| id.clone())
                    .unwrap_or_else(|| group.clone());
                self.step_outputs
                    .entry(group)
                    .or_default()
                    .entry(task)
                    .or_default()
                    .push(node);
                None
            }
            FlowTo::JobOutput => {
                let group = self.current_group.clone().unwrap_or_default();
                self.job_outputs.entry(group).or_default().push(node);
                None
            }
            FlowTo::WorkflowOutput => Some(node),
        }
    }

    /// Computes the upstream source set of a value.
    fn sources_for(
        &mut self,
        item: &NamedValue,
        from: FlowFrom,
        root_kind: Option<TaintKind>,
    ) -> Vec<NodeId> {
        match from {
            FlowFrom::Value => {
                let refs = item.refs.clone();
                refs.iter().flat_map(|r| self.lookup_ref(r)).collect()
            }
            FlowFrom::NewRoot => {
                vec![self.alloc_root(&item.name, root_kind.unwrap_or(item.kind), false)]
            }
            FlowFrom::ContextRoot => {
                vec![self.alloc_root(&item.name, root_kind.unwrap_or(TaintKind::Context), false)]
            }
            FlowFrom::Arg => self.lookup_arg(&item.name),
            FlowFrom::Env => self.lookup_env(&item.name),
            FlowFrom::StepOutput => self.lookup_step_output(&item.name),
            FlowFrom::JobOutput => self.lookup_job_output(&item.name),
        }
    }

    /// Resolves one `${{ ... }}` reference to its taint sources.
    fn lookup_ref(&mut self, r: &ExprRef) -> Vec<NodeId> {
        if sources::scalar_source(r).is_some() {
            return vec![self.alloc_root(&r.expression, r.kind.into(), false)];
        }

        if sources::object_source(r) {
            return vec![self.alloc_root(&r.expression, r.kind.into(), true)];
        }

        match r.kind {
            RefKind::Context => match r.name.strip_prefix("event.inputs.") {
                Some(input) => self.lookup_input(input),
                None => vec![],
            },
            RefKind::Steps => self.lookup_step_output(&r.name),
            RefKind::Needs => self.lookup_job_output(&r.name),
            // `jobs.<id>.outputs.<name>` appears in reusable workflow
            // output values and resolves against the same state.
            RefKind::Jobs => self.lookup_job_output(&r.name),
            RefKind::Env => self.lookup_env(&r.name),
            RefKind::Inputs => self.lookup_input(&r.name),
            _ => vec![],
        }
    }

    fn lookup_env(&self, name: &str) -> Vec<NodeId> {
        for scope in [Scope::Step, Scope::Job, Scope::Workflow] {
            for id in &self.env[scope as usize] {
                if self.arena.get(*id).name == name {
                    return vec![*id];
                }
            }
        }
        vec![]
    }

    fn lookup_arg(&self, name: &str) -> Vec<NodeId> {
        self.args
            .iter()
            .find(|id| self.arena.get(**id).name == name)
            .map(|id| vec![*id])
            .unwrap_or_default()
    }

    fn lookup_input(&self, name: &str) -> Vec<NodeId> {
        self.inputs
            .iter()
            .find(|id| self.arena.get(**id).name == name)
            .map(|id| vec![*id])
            .unwrap_or_default()
    }

    /// Step-output lookup, accepting `name`, `task.outputs`, and
    /// `task.outputs.name` forms.
    ///
    /// Comparison payloads of the form `A == B` are accepted by taking
    /// the left side.
    fn lookup_step_output(&self, name: &str) -> Vec<NodeId> {
        let name = match name.split_once("==") {
            Some((lhs, _)) => lhs.trim(),
            None => name,
        };

        let group = self.current_group.as_deref().unwrap_or_default();
        let Some(task_outputs) = self.step_outputs.get(group) else {
            return vec![];
        };

        let parts = name.split('.').collect::<Vec<_>>();
        match parts.as_slice() {
            // A bare name refers to the current task's own outputs.
            [_single] => match &self.current_task {
                Some((task, _)) => task_outputs.get(task).cloned().unwrap_or_default(),
                None => vec![],
            },
            [task, "outputs"] => task_outputs.get(*task).cloned().unwrap_or_default(),
            [task, "outputs", output] => task_outputs
                .get(*task)
                .map(|ids| {
                    ids.iter()
                        .filter(|id| self.arena.get(**id).name == *output)
                        .copied()
                        .collect()
                })
                .unwrap_or_default(),
            _ => {
                tracing::warn!("unrecognized step output reference: {name}");
                vec![]
            }
        }
    }

    /// Job-output lookup, accepting `job`, `job.outputs`, and
    /// `job.outputs.name` forms.
    fn lookup_job_output(&self, name: &str) -> Vec<NodeId> {
        let parts = name.split('.').collect::<Vec<_>>();
        match parts.as_slice() {
            [job] | [job, _] => self.job_outputs.get(*job).cloned().unwrap_or_default(),
            [job, "outputs", output, ..] => self
                .job_outputs
                .get(*job)
                .map(|ids| {
                    ids.iter()
                        .filter(|id| self.arena.get(**id).name == *output)
                        .copied()
                        .collect()
                })
                .unwrap_or_default(),
            _ => vec![],
        }
    }

    fn clear_scope(&mut self, scope: Scope) {
        self.env[scope as usize].clear();
        self.args.clear();
    }

    //
    // Locations.
    //

    fn location(&self) -> String {
        if let Some(over) = &self.override_location {
            return over.clone();
        }

        let mut ret = format!("{name} | ", name = self.unit_name);
        if let Some(group) = &self.current_group {
            ret.push_str(&format!("Job : {group} | "));
        }
        if let Some((task, step_no)) = &self.current_task {
            ret.push_str(&format!("Step : {task} ({step_no}th step)"));
        }
        ret
    }

    fn set_override(&mut self, suffix: &str) {
        self.override_location = Some(format!("{name} | {suffix}", name = self.unit_name));
    }

    fn clear_override(&mut self) {
        self.override_location = None;
    }

    //
    // Result packing.
    //

    /// Checks the unit's declared outputs against the final taint
    /// state, then buckets every raised alert into the summary exposed
    /// to callers.
    fn pack_results(&mut self, outputs_location: &str, outputs: &[NamedValue]) -> WorkflowSummary {
        self.set_override(outputs_location);
        self.check_values(outputs, FlowFrom::Value, AlertKind::OutputTainted);
        self.clear_override();

        let mut summary = WorkflowSummary::default();

        for alert in self.alerts.clone() {
            let flow = self.flow_record(alert.node);
            let roots = self.arena.roots(alert.node);
            let context_rooted = roots.iter().any(|id| {
                matches!(
                    self.arena.get(*id).kind,
                    TaintKind::Context | TaintKind::Output | TaintKind::Steps
                )
            });
            let input_rooted = roots
                .iter()
                .any(|id| self.arena.get(*id).kind == TaintKind::Input);

            if alert.kind == AlertKind::OutputTainted {
                if context_rooted {
                    summary.context_to_output.push(flow);
                } else if input_rooted {
                    summary.arg_to_output.push(flow);
                } else {
                    tracing::warn!("alert with unclassifiable root; dropped from summary");
                }
            } else if context_rooted {
                summary.context_to_sink.push(flow);
            } else if input_rooted {
                summary.arg_to_sink.push(flow);
            } else {
                tracing::warn!("alert with unclassifiable root; dropped from summary");
            }
        }

        summary
    }

    /// Projects an alert node into the flow shape consumed by callers
    /// and the report builder.
    fn flow_record(&self, node: NodeId) -> FlowRecord {
        let roots = self.arena.roots(node);
        // Non-root nodes always have parents, so the root set is
        // non-empty for any node an alert points at.
        let root = self.arena.get(roots[0]);
        let sink = self.arena.get(node);

        FlowRecord {
            name: root.name.clone(),
            kind: root.kind,
            location: root.location.clone(),
            sinks: vec![SinkRecord {
                function: sink.name.clone(),
                taint_name: sink.name.clone(),
                location: sink.sink_location.clone().unwrap_or_default(),
            }],
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::rc::Rc;

    use camino::Utf8Path;
    use pretty_assertions::assert_eq;

    use super::{AlertKind, Resolver, TaintEngine};
    use crate::ir::{ActionTask, ReusableCall, TaintKind, WorkflowIr};
    use crate::models::{Workflow, WorkflowFile};
    use crate::summary::{
        ActionSummary, AnalyzedAction, AnalyzedWorkflow, FlowRecord, SinkRecord, WorkflowSummary,
    };

    /// Treats every callee as opaque.
    struct OpaqueResolver;

    impl Resolver for OpaqueResolver {
        fn resolve_action(&self, _task: &ActionTask) -> anyhow::Result<Rc<AnalyzedAction>> {
            Ok(Rc::new(AnalyzedAction::default()))
        }

        fn resolve_workflow(&self, _call: &ReusableCall) -> anyhow::Result<AnalyzedWorkflow> {
            Ok(AnalyzedWorkflow::default())
        }
    }

    /// Canned callee summaries, keyed by the raw `uses:` clause.
    #[derive(Default)]
    struct StubResolver {
        actions: HashMap<String, Rc<AnalyzedAction>>,
        workflows: HashMap<String, AnalyzedWorkflow>,
    }

    impl Resolver for StubResolver {
        fn resolve_action(&self, task: &ActionTask) -> anyhow::Result<Rc<AnalyzedAction>> {
            Ok(self
                .actions
                .get(&task.raw)
                .cloned()
                .unwrap_or_else(|| Rc::new(AnalyzedAction::default())))
        }

        fn resolve_workflow(&self, call: &ReusableCall) -> anyhow::Result<AnalyzedWorkflow> {
            Ok(self.workflows.get(&call.raw).cloned().unwrap_or_default())
        }
    }

    fn build_ir(yaml: &str) -> WorkflowIr {
        let workflow = Workflow::from_string(yaml).unwrap();
        let file = WorkflowFile::new(
            Utf8Path::new(".github/workflows/test.yml").to_path_buf(),
            workflow,
        );
        WorkflowIr::build(&file).unwrap()
    }

    fn sink_flow(name: &str, kind: TaintKind) -> FlowRecord {
        FlowRecord {
            name: name.into(),
            kind,
            location: "file:/callee/index.js:10:5".into(),
            sinks: vec![SinkRecord {
                function: "exec".into(),
                taint_name: String::new(),
                location: "file:/callee/index.js:26:5".into(),
            }],
        }
    }

    #[test]
    fn test_direct_context_to_shell() {
        let ir = build_ir(r#"
on: issues
jobs:
  echo:
    runs-on: ubuntu-latest
    steps:
      - run: echo "${{ github.event.issue.title }}"
"#);

        let resolver = OpaqueResolver;
        let mut engine = TaintEngine::new(&ir.name, &resolver);
        let summary = engine.run_workflow(&ir);

        assert_eq!(engine.alerts().len(), 1);
        assert_eq!(engine.alerts()[0].kind, AlertKind::ShellCmdTainted);
        assert_eq!(summary.context_to_sink.len(), 1);
        assert_eq!(summary.context_to_sink[0].name, "github.event.issue.title");
        assert!(summary.arg_to_sink.is_empty());
    }

    #[test]
    fn test_env_propagation_across_jobs() {
        let ir = build_ir(r#"
on: pull_request_target
jobs:
  produce:
    steps:
      - run: echo "X=${{ github.event.pull_request.body }}" >> $GITHUB_ENV
  consume:
    needs: produce
    steps:
      - run: eval "$X"
"#);

        let resolver = OpaqueResolver;
        let mut engine = TaintEngine::new(&ir.name, &resolver);
        let summary = engine.run_workflow(&ir);

        let env_alerts = engine
            .alerts()
            .iter()
            .filter(|a| a.kind == AlertKind::TaintedEnvShellCmd)
            .collect::<Vec<_>>();
        assert_eq!(env_alerts.len(), 1);

        let node = engine.arena.get(env_alerts[0].node);
        assert_eq!(node.name, "X");

        // The chain bottoms out at the PR body, not at the env write.
        assert!(summary.context_to_sink.iter().any(|flow| {
            flow.name == "github.event.pull_request.body" && flow.sinks[0].taint_name == "X"
        }));
    }

    #[test]
    fn test_safe_env_read_is_silent() {
        let ir = build_ir(r#"
on: push
jobs:
  build:
    steps:
      - run: echo $GITHUB_SHA
"#);

        let resolver = OpaqueResolver;
        let mut engine = TaintEngine::new(&ir.name, &resolver);
        engine.run_workflow(&ir);

        assert!(engine.alerts().is_empty());
    }

    #[test]
    fn test_reusable_workflow_arg_to_sink() {
        let ir = build_ir(r#"
on: issue_comment
jobs:
  call:
    uses: octo/tools/.github/workflows/run-script.yml@v1
    with:
      script: ${{ github.event.comment.body }}
"#);

        let mut resolver = StubResolver::default();
        resolver.workflows.insert(
            "octo/tools/.github/workflows/run-script.yml@v1".into(),
            AnalyzedWorkflow {
                inputs: vec![],
                summary: WorkflowSummary {
                    arg_to_sink: vec![sink_flow("script", TaintKind::Input)],
                    ..WorkflowSummary::default()
                },
            },
        );

        let mut engine = TaintEngine::new(&ir.name, &resolver);
        let summary = engine.run_workflow(&ir);

        assert_eq!(engine.alerts().len(), 1);
        assert_eq!(engine.alerts()[0].kind, AlertKind::ArgToSink);
        // The root is the caller-side context source, so the flow is
        // reported as context-originated.
        assert_eq!(summary.context_to_sink.len(), 1);
        assert_eq!(summary.context_to_sink[0].name, "github.event.comment.body");
    }

    #[test]
    fn test_hardcoded_github_script_sink() {
        let ir = build_ir(r#"
on: issues
jobs:
  script:
    steps:
      - uses: actions/github-script@v7
        with:
          script: return "${{ github.event.issue.title }}"
"#);

        // No canned summary: the sink comes from the hardcoded table.
        let resolver = StubResolver::default();
        let mut engine = TaintEngine::new(&ir.name, &resolver);
        let summary = engine.run_workflow(&ir);

        assert_eq!(engine.alerts().len(), 1);
        assert_eq!(engine.alerts()[0].kind, AlertKind::ArgToSink);
        assert_eq!(summary.context_to_sink.len(), 1);
        assert_eq!(summary.context_to_sink[0].name, "github.event.issue.title");
    }

    #[test]
    fn test_output_laundering_keeps_root() {
        let ir = build_ir(r#"
on: issue_comment
jobs:
  launder:
    steps:
      - id: A
        uses: octo/launder@v1
        with:
          x: ${{ github.event.comment.body }}
      - run: echo "${{ steps.A.outputs.y }}"
"#);

        let mut resolver = StubResolver::default();
        resolver.actions.insert(
            "octo/launder@v1".into(),
            Rc::new(AnalyzedAction {
                name: "octo/launder".into(),
                inputs: vec![],
                summary: ActionSummary {
                    arg_to_output: vec![FlowRecord {
                        name: "x".into(),
                        kind: TaintKind::Input,
                        location: "file:/launder/index.js:3:1".into(),
                        sinks: vec![SinkRecord {
                            function: "setOutput".into(),
                            taint_name: "y".into(),
                            location: "file:/launder/index.js:9:1".into(),
                        }],
                    }],
                    ..ActionSummary::default()
                },
            }),
        );

        let mut engine = TaintEngine::new(&ir.name, &resolver);
        let summary = engine.run_workflow(&ir);

        assert_eq!(engine.alerts().len(), 1);
        assert_eq!(engine.alerts()[0].kind, AlertKind::ShellCmdTainted);
        // The reported source is the original context value fed to `x`.
        assert_eq!(summary.context_to_sink.len(), 1);
        assert_eq!(summary.context_to_sink[0].name, "github.event.comment.body");
    }

    #[test]
    fn test_callee_env_to_sink_requires_caller_taint() {
        let yaml = r#"
on: pull_request_target
jobs:
  build:
    steps:
      - uses: octo/envreader@v1
        env:
          UNTRUSTED: ${{ github.event.pull_request.title }}
"#;

        let mut resolver = StubResolver::default();
        resolver.actions.insert(
            "octo/envreader@v1".into(),
            Rc::new(AnalyzedAction {
                name: "octo/envreader".into(),
                inputs: vec![],
                summary: ActionSummary {
                    env_to_sink: vec![
                        sink_flow("UNTRUSTED", TaintKind::Env),
                        sink_flow("UNRELATED", TaintKind::Env),
                    ],
                    ..ActionSummary::default()
                },
            }),
        );

        let ir = build_ir(yaml);
        let mut engine = TaintEngine::new(&ir.name, &resolver);
        engine.run_workflow(&ir);

        // Only the env name the caller actually tainted fires.
        assert_eq!(engine.alerts().len(), 1);
        assert_eq!(engine.alerts()[0].kind, AlertKind::EnvToSink);
        assert_eq!(engine.arena.get(engine.alerts()[0].node).name, "UNTRUSTED");
    }

    #[test]
    fn test_reusable_output_check() {
        let ir = build_ir(r#"
on:
  workflow_call:
    inputs:
      tag:
        type: string
    outputs:
      exfil:
        value: ${{ inputs.tag }}
jobs:
  noop:
    steps: []
"#);

        let resolver = OpaqueResolver;
        let mut engine = TaintEngine::new(&ir.name, &resolver);
        let summary = engine.run_workflow(&ir);

        assert_eq!(engine.alerts().len(), 1);
        assert_eq!(engine.alerts()[0].kind, AlertKind::OutputTainted);
        assert_eq!(summary.arg_to_output.len(), 1);
        assert_eq!(summary.arg_to_output[0].name, "tag");
    }

    #[test]
    fn test_provenance_is_a_dag() {
        let ir = build_ir(r#"
on: issue_comment
jobs:
  produce:
    outputs:
      body: ${{ steps.grab.outputs.body }}
    steps:
      - id: grab
        run: echo "body=${{ github.event.comment.body }}" >> "$GITHUB_OUTPUT"
  consume:
    needs: produce
    steps:
      - run: echo "${{ needs.produce.outputs.body }}"
"#);

        let resolver = OpaqueResolver;
        let mut engine = TaintEngine::new(&ir.name, &resolver);
        let summary = engine.run_workflow(&ir);

        assert!(!engine.arena.is_empty());
        assert!(engine.arena.len() >= engine.alerts().len());

        // Every parent edge points backwards in allocation order, and
        // object-level taint only ever marks roots.
        for (id, node) in engine.arena.iter() {
            assert!(node.parents.iter().all(|parent| *parent < id));
            assert!(!node.is_object || node.parents.is_empty());
        }

        // Every alert's root set is non-empty and classifiable.
        for alert in engine.alerts() {
            let roots = engine.arena.roots(alert.node);
            assert!(!roots.is_empty());
            for root in roots {
                let kind = engine.arena.get(root).kind;
                assert!(matches!(
                    kind,
                    TaintKind::Context | TaintKind::Input | TaintKind::Env | TaintKind::Output
                ));
            }
        }

        // The cross-job read resolves through the job output chain.
        assert!(summary
            .context_to_sink
            .iter()
            .any(|flow| flow.name == "github.event.comment.body"));
    }
}
