//! Repositories, sub-repositories, and the memoized action registry.
//!
//! A [`Repo`] is one checked-out repository plus its loaded workflows.
//! Remote callees (actions and reusable workflows) are materialized as
//! further checkouts under the same cache directory; their analyses
//! are memoized per `(slug, subpath, ref)` for the lifetime of the
//! run, and sub-repositories share the same cache.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use anyhow::{Context as _, Result, anyhow};
use camino::Utf8PathBuf;

use crate::codeql::CodeQl;
use crate::config::Config;
use crate::engine::{Resolver, TaintEngine};
use crate::github::Client;
use crate::ir::{self, ActionTask, ReusableCall, ReusableTarget, WorkflowIr};
use crate::models::{self, ActionKind, ActionManifest, WorkflowFile, uses::{GitRef, Uses}};
use crate::report::WorkflowReport;
use crate::summary::{ActionSummary, AnalyzedAction, AnalyzedWorkflow};

type ActionKey = (String, String, String);

/// The per-run memo of analyzed actions.
#[derive(Clone, Default)]
pub(crate) struct ActionCache {
    inner: Rc<RefCell<HashMap<ActionKey, Rc<AnalyzedAction>>>>,
}

impl ActionCache {
    fn get(&self, key: &ActionKey) -> Option<Rc<AnalyzedAction>> {
        self.inner.borrow().get(key).cloned()
    }

    fn insert(&self, key: ActionKey, analyzed: Rc<AnalyzedAction>) {
        self.inner.borrow_mut().insert(key, analyzed);
    }
}

/// Everything an analysis needs besides the unit under analysis.
#[derive(Clone)]
pub(crate) struct AnalysisContext {
    pub(crate) config: Rc<Config>,
    pub(crate) client: Rc<Client>,
    pub(crate) cache: ActionCache,
}

/// A checked-out repository with its workflow set.
pub(crate) struct Repo {
    pub(crate) slug: String,
    pub(crate) folder: Utf8PathBuf,
    pub(crate) workflows: Vec<WorkflowFile>,
    ctx: AnalysisContext,
}

/// Directory name for a checkout: `owner#repo`, suffixed with the ref
/// when one is pinned so distinct refs get distinct checkouts.
fn checkout_dir(config: &Config, slug: &str, git_ref: Option<&GitRef>) -> Utf8PathBuf {
    let base = slug.replace('/', "#");
    let name = match git_ref {
        Some(git_ref) => format!("{base}@{value}", value = git_ref.value.replace('/', "_")),
        None => base,
    };
    config.local_folder.join(name)
}

impl Repo {
    /// Fetches and loads a repository. Workflow files that fail to
    /// parse are skipped with a critical log; the rest still load.
    pub(crate) fn open(ctx: AnalysisContext, slug: &str, git_ref: Option<&GitRef>) -> Result<Self> {
        let folder = checkout_dir(&ctx.config, slug, git_ref);
        tracing::info!("fetching {slug} into {folder}");
        ctx.client
            .fetch_repo(slug, git_ref.map(|r| r.value.as_str()), &folder)?;

        let mut workflows = vec![];
        for path in models::find_workflows(&folder) {
            match WorkflowFile::load(&path, &folder) {
                Ok(workflow) => workflows.push(workflow),
                Err(err) => tracing::error!("skipping workflow {path}: {err:#}"),
            }
        }

        Ok(Self {
            slug: slug.into(),
            folder,
            workflows,
            ctx,
        })
    }

    /// Wraps an already-checked-out action repository so that its own
    /// callees (composite steps, local actions) resolve against it.
    fn for_action_root(ctx: AnalysisContext, slug: &str, folder: Utf8PathBuf) -> Self {
        Self {
            slug: slug.into(),
            folder,
            workflows: vec![],
            ctx,
        }
    }

    /// Analyzes every workflow (or just `workflow_path`) and returns
    /// the reports.
    pub(crate) fn run(&self, workflow_path: Option<&str>) -> Result<Vec<WorkflowReport>> {
        let mut reports = vec![];

        for workflow in &self.workflows {
            if let Some(wanted) = workflow_path
                && workflow.rel_path != wanted
            {
                continue;
            }

            let ir = WorkflowIr::build(workflow)
                .with_context(|| format!("couldn't build IR for {}", workflow.rel_path))?;

            let resolver = RepoResolver { repo: self };
            let mut engine = TaintEngine::new(&ir.name, &resolver);
            let summary = engine.run_workflow(&ir);
            reports.push(WorkflowReport::new(&ir, summary));
        }

        if reports.is_empty() {
            match workflow_path {
                Some(wanted) => {
                    return Err(anyhow!(
                        "workflow {wanted} not found in repository {slug}",
                        slug = self.slug
                    ));
                }
                None => tracing::error!("no workflows found in repository {}", self.slug),
            }
        }

        Ok(reports)
    }

    fn find_workflow(&self, path: &str) -> Option<&WorkflowFile> {
        self.workflows
            .iter()
            .find(|w| w.rel_path == path || w.rel_path.as_str().ends_with(path))
    }

    fn sub_repo(&self, slug: &str, git_ref: Option<&GitRef>) -> Result<Repo> {
        Repo::open(self.ctx.clone(), slug, git_ref)
    }

    /// Analyzes a workflow of this repository by path, as a callee.
    fn analyze_workflow_at(&self, path: &str) -> Result<AnalyzedWorkflow> {
        let workflow = self
            .find_workflow(path)
            .ok_or_else(|| anyhow!("workflow {path} not found in {slug}", slug = self.slug))?;

        let ir = WorkflowIr::build(workflow)?;
        let resolver = RepoResolver { repo: self };
        let mut engine = TaintEngine::new(&ir.name, &resolver);
        let summary = engine.run_workflow(&ir);

        Ok(AnalyzedWorkflow {
            inputs: ir.inputs.clone(),
            summary,
        })
    }

    /// Analyzes an action that lives inside this repository.
    fn analyze_local_action(&self, path: &str) -> Result<Rc<AnalyzedAction>> {
        let key = (format!("./{path}"), String::new(), String::new());
        if let Some(hit) = self.ctx.cache.get(&key) {
            tracing::debug!("local action {path} already analyzed; using cache");
            return Ok(hit);
        }

        let (analyzed, _) = analyze_action_unit(
            &self.ctx,
            &self.slug,
            self.folder.clone(),
            Some(path),
            None,
        )?;
        self.ctx.cache.insert(key, analyzed.clone());
        Ok(analyzed)
    }

    /// Analyzes a remote action, fetching it on first use.
    fn analyze_remote_action(
        &self,
        uses: &crate::models::uses::RepositoryUses,
    ) -> Result<Rc<AnalyzedAction>> {
        let key = (
            uses.slug(),
            uses.subpath.clone().unwrap_or_default(),
            uses.git_ref
                .as_ref()
                .map(|r| r.value.clone())
                .unwrap_or_default(),
        );
        if let Some(hit) = self.ctx.cache.get(&key) {
            tracing::debug!(
                "action {slug}@{version} already analyzed; using cache",
                slug = uses.slug(),
                version = key.2
            );
            return Ok(hit);
        }

        let slug = uses.slug();
        let folder = checkout_dir(&self.ctx.config, &slug, uses.git_ref.as_ref());
        self.ctx.client.fetch_repo(
            &slug,
            uses.git_ref.as_ref().map(|r| r.value.as_str()),
            &folder,
        )?;

        let (analyzed, _) = analyze_action_unit(
            &self.ctx,
            &slug,
            folder,
            uses.subpath.as_deref(),
            uses.git_ref.as_ref(),
        )?;
        self.ctx.cache.insert(key, analyzed.clone());
        Ok(analyzed)
    }
}

/// The production implementation of the engine's callee seam.
pub(crate) struct RepoResolver<'a> {
    pub(crate) repo: &'a Repo,
}

impl Resolver for RepoResolver<'_> {
    fn resolve_action(&self, task: &ActionTask) -> Result<Rc<AnalyzedAction>> {
        match &task.uses {
            Uses::Docker(_) => Ok(Rc::new(AnalyzedAction::default())),
            Uses::Local(local) => self.repo.analyze_local_action(&local.path),
            Uses::Repository(uses) => self.repo.analyze_remote_action(uses),
        }
    }

    fn resolve_workflow(&self, call: &ReusableCall) -> Result<AnalyzedWorkflow> {
        match &call.target {
            ReusableTarget::Local { path } => self.repo.analyze_workflow_at(path),
            ReusableTarget::Remote {
                slug,
                path,
                git_ref,
            } => {
                let sub = self.repo.sub_repo(slug, git_ref.as_ref())?;
                sub.analyze_workflow_at(path)
            }
        }
    }
}

/// Analyzes the action rooted at `folder` (optionally below a
/// subpath), dispatching on `runs.using`.
pub(crate) fn analyze_action_unit(
    ctx: &AnalysisContext,
    slug: &str,
    folder: Utf8PathBuf,
    subpath: Option<&str>,
    git_ref: Option<&GitRef>,
) -> Result<(Rc<AnalyzedAction>, ActionKind)> {
    let manifest_path = ActionManifest::locate(&folder, subpath)?;
    let manifest = ActionManifest::from_file(&manifest_path)?;
    let kind = manifest.kind();
    let inputs = ir::action_inputs(&manifest);

    let name = match subpath {
        Some(subpath) => format!("{slug}/{subpath}"),
        None => slug.to_string(),
    };

    tracing::info!(
        "analyzing action {name}@{version} ({kind:?})",
        version = git_ref.map(|r| r.value.as_str()).unwrap_or("HEAD")
    );

    let summary = match kind {
        ActionKind::Docker => ActionSummary::empty(),
        ActionKind::JavaScript => {
            let raw = CodeQl::new(&ctx.config).summarize(&name, &folder)?;
            ActionSummary::from_js_report(&raw, ctx.config.enable_low_priority_reports)
        }
        ActionKind::Composite => {
            let group = ir::action_task_group(&name, &manifest);
            let packed_inputs = ir::action_inputs(&manifest);
            let outputs = ir::action_outputs(&manifest);

            let action_repo = Repo::for_action_root(ctx.clone(), slug, folder);
            let resolver = RepoResolver { repo: &action_repo };
            let mut engine = TaintEngine::new(&name, &resolver);
            ActionSummary::from_composite(engine.run_task_group(&group, &packed_inputs, &outputs))
        }
    };

    Ok((
        Rc::new(AnalyzedAction {
            name,
            inputs,
            summary,
        }),
        kind,
    ))
}
