//! The parsed workflow and action object model.
//!
//! These are permissive serde models: unknown fields are tolerated and
//! scalar-vs-mapping ambiguities (`needs:`, `env:`, `on:`) are resolved
//! the way the Actions runner resolves them, so that real-world
//! workflow files load without schema friction.

use std::ops::Deref;

use anyhow::{Context as _, Result, anyhow};
use camino::{Utf8Path, Utf8PathBuf};
use indexmap::IndexMap;
use serde::{Deserialize, Deserializer};

pub(crate) mod uses;

/// An environment mapping.
pub(crate) type Env = IndexMap<String, EnvValue>;

/// Environment values are always strings at runtime, but YAML authors
/// write them as native scalars before stringification.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(untagged)]
pub(crate) enum EnvValue {
    #[serde(deserialize_with = "null_to_default")]
    String(String),
    Number(f64),
    Boolean(bool),
}

impl std::fmt::Display for EnvValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::String(s) => write!(f, "{s}"),
            Self::Number(n) => write!(f, "{n}"),
            Self::Boolean(b) => write!(f, "{b}"),
        }
    }
}

/// A block that is usually a mapping but may be a single expression
/// string (e.g. `env: ${{ fromJSON(...) }}`).
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(untagged)]
pub(crate) enum EnvBlock {
    Literal(Env),
    Raw(String),
}

fn null_to_default<'de, D, T>(de: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    let value = Option::<T>::deserialize(de)?;
    Ok(value.unwrap_or_default())
}

/// A "scalar or vector" type for keys like `needs:`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SoV<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> From<SoV<T>> for Vec<T> {
    fn from(value: SoV<T>) -> Self {
        match value {
            SoV::One(v) => vec![v],
            SoV::Many(vs) => vs,
        }
    }
}

fn scalar_or_vector<'de, D, T>(de: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<SoV<T>>::deserialize(de).map(|sov| sov.map(Into::into).unwrap_or_default())
}

/// `permissions:` for a workflow or job.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case", untagged)]
pub(crate) enum Permissions {
    Base(BasePermission),
    Explicit(IndexMap<String, Permission>),
}

#[derive(Copy, Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub(crate) enum BasePermission {
    #[default]
    Default,
    ReadAll,
    WriteAll,
}

#[derive(Copy, Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub(crate) enum Permission {
    Read,
    Write,
    #[default]
    None,
}

/// The `on:` trigger block, in any of its three shapes.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(untagged)]
pub(crate) enum Trigger {
    Event(String),
    Events(Vec<String>),
    Config(IndexMap<String, serde_yaml::Value>),
}

/// The body of a `workflow_call:` trigger.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub(crate) struct WorkflowCall {
    #[serde(default)]
    pub(crate) inputs: IndexMap<String, Option<WorkflowCallInput>>,
    #[serde(default)]
    pub(crate) secrets: IndexMap<String, serde_yaml::Value>,
    #[serde(default)]
    pub(crate) outputs: IndexMap<String, WorkflowCallOutput>,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub(crate) struct WorkflowCallInput {
    pub(crate) default: Option<EnvValue>,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub(crate) struct WorkflowCallOutput {
    pub(crate) value: Option<EnvValue>,
}

/// An entire workflow definition.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub(crate) struct Workflow {
    pub(crate) name: Option<String>,
    #[serde(rename = "on")]
    pub(crate) on: Option<Trigger>,
    pub(crate) permissions: Option<Permissions>,
    pub(crate) env: Option<EnvBlock>,
    #[serde(default)]
    pub(crate) jobs: IndexMap<String, Job>,
}

impl Workflow {
    /// Loads a workflow from a YAML buffer.
    ///
    /// YAML 1.1 loaders turn the bare `on` key into the boolean `true`;
    /// both spellings are accepted here by normalizing boolean
    /// top-level keys before unmarshaling.
    pub(crate) fn from_string(contents: &str) -> Result<Self> {
        let mut value: serde_yaml::Value =
            serde_yaml::from_str(contents).with_context(|| "invalid workflow YAML")?;

        if let serde_yaml::Value::Mapping(mapping) = &mut value {
            let bool_keys = mapping
                .keys()
                .filter(|k| matches!(k, serde_yaml::Value::Bool(true)))
                .cloned()
                .collect::<Vec<_>>();
            for key in bool_keys {
                if let Some(body) = mapping.remove(&key) {
                    mapping.insert(serde_yaml::Value::String("on".into()), body);
                }
            }
        }

        serde_yaml::from_value(value).with_context(|| "invalid workflow definition")
    }

    pub(crate) fn from_file(path: &Utf8Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("couldn't read workflow file {path}"))?;
        Self::from_string(&contents)
    }

    /// The `workflow_call:` trigger body, if this workflow is reusable.
    pub(crate) fn workflow_call(&self) -> Option<WorkflowCall> {
        let Some(Trigger::Config(events)) = &self.on else {
            return None;
        };

        match events.get("workflow_call") {
            Some(serde_yaml::Value::Null) => Some(WorkflowCall::default()),
            Some(body) => serde_yaml::from_value(body.clone()).ok(),
            None => None,
        }
    }

    /// Whether the workflow's token can write to the repository.
    ///
    /// A missing `permissions:` key counts as writable: that is the
    /// historical default for long-lived repositories.
    pub(crate) fn write_permission(&self) -> bool {
        match &self.permissions {
            None => true,
            Some(Permissions::Base(BasePermission::WriteAll)) => true,
            Some(Permissions::Base(_)) => false,
            Some(Permissions::Explicit(perms)) => {
                perms.values().any(|p| matches!(p, Permission::Write))
            }
        }
    }
}

/// A single job.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub(crate) struct Job {
    #[serde(default, deserialize_with = "scalar_or_vector")]
    pub(crate) needs: Vec<String>,
    pub(crate) env: Option<EnvBlock>,
    pub(crate) outputs: Option<Env>,
    /// Present iff this job calls a reusable workflow.
    pub(crate) uses: Option<String>,
    pub(crate) with: Option<Env>,
    #[serde(default)]
    pub(crate) steps: Vec<Step>,
}

/// A single step within a job (or composite action).
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub(crate) struct Step {
    pub(crate) id: Option<String>,
    pub(crate) uses: Option<String>,
    pub(crate) run: Option<String>,
    pub(crate) shell: Option<String>,
    pub(crate) with: Option<Env>,
    pub(crate) env: Option<EnvBlock>,
}

/// A workflow plus where it was found, relative to its repository root.
#[derive(Clone, Debug)]
pub(crate) struct WorkflowFile {
    pub(crate) rel_path: Utf8PathBuf,
    inner: Workflow,
}

impl Deref for WorkflowFile {
    type Target = Workflow;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl WorkflowFile {
    pub(crate) fn new(rel_path: Utf8PathBuf, inner: Workflow) -> Self {
        Self { rel_path, inner }
    }

    pub(crate) fn load(full_path: &Utf8Path, repo_root: &Utf8Path) -> Result<Self> {
        let rel_path = full_path
            .strip_prefix(repo_root)
            .map(Utf8Path::to_path_buf)
            .unwrap_or_else(|_| full_path.to_path_buf());

        Ok(Self {
            rel_path,
            inner: Workflow::from_file(full_path)?,
        })
    }

    /// The workflow's display name: its `name:` key, or its path.
    pub(crate) fn display_name(&self) -> String {
        match &self.inner.name {
            Some(name) if !name.is_empty() => name.clone(),
            _ => self.rel_path.to_string(),
        }
    }
}

/// Enumerates workflow definitions under `.github/workflows/`.
pub(crate) fn find_workflows(repo_root: &Utf8Path) -> Vec<Utf8PathBuf> {
    let dir = repo_root.join(".github").join("workflows");
    let Ok(entries) = dir.read_dir_utf8() else {
        return vec![];
    };

    let mut paths = entries
        .flatten()
        .map(|entry| entry.into_path())
        .filter(|path| {
            matches!(path.extension(), Some("yml") | Some("yaml")) && path.is_file()
        })
        .collect::<Vec<_>>();
    // Directory order is filesystem-dependent; sort for determinism.
    paths.sort();
    paths
}

/// How an action executes, per `runs.using`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum ActionKind {
    JavaScript,
    Composite,
    Docker,
}

/// An `action.yml` manifest.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub(crate) struct ActionManifest {
    #[serde(default)]
    pub(crate) inputs: IndexMap<String, ActionInput>,
    #[serde(default)]
    pub(crate) outputs: IndexMap<String, ActionOutput>,
    pub(crate) runs: ActionRuns,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub(crate) struct ActionInput {
    pub(crate) default: Option<EnvValue>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub(crate) struct ActionOutput {
    pub(crate) value: Option<EnvValue>,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub(crate) struct ActionRuns {
    pub(crate) using: String,
    #[serde(default)]
    pub(crate) steps: Vec<Step>,
}

impl ActionManifest {
    /// Finds `action.yml` (or `action.yaml`) under the given root,
    /// optionally below a subpath.
    pub(crate) fn locate(root: &Utf8Path, subpath: Option<&str>) -> Result<Utf8PathBuf> {
        let base = match subpath {
            Some(sub) => root.join(sub),
            None => root.to_path_buf(),
        };

        for filename in ["action.yml", "action.yaml"] {
            let candidate = base.join(filename);
            if candidate.is_file() {
                return Ok(candidate);
            }
        }

        Err(anyhow!("no action.yml found at {base}"))
    }

    pub(crate) fn from_file(path: &Utf8Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("couldn't read action file {path}"))?;
        serde_yaml::from_str(&contents).with_context(|| format!("invalid action definition: {path}"))
    }

    /// Classifies `runs.using`. Unknown runtimes are treated as Docker,
    /// i.e. opaque to the analysis.
    pub(crate) fn kind(&self) -> ActionKind {
        match self.runs.using.as_str() {
            "node12" | "node14" | "node16" => ActionKind::JavaScript,
            "composite" => ActionKind::Composite,
            _ => ActionKind::Docker,
        }
    }
}
