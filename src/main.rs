//! Argus: cross-artifact taint analysis for GitHub Actions.

use std::process::ExitCode;
use std::rc::Rc;

use anstream::eprintln;
use anyhow::anyhow;
use camino::Utf8PathBuf;
use clap::{Parser, ValueEnum};
use clap_verbosity_flag::InfoLevel;
use owo_colors::OwoColorize;
use thiserror::Error;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt as _, util::SubscriberInitExt as _};

use crate::config::Config;
use crate::github::Client;
use crate::models::ActionKind;
use crate::models::uses::{GitRef, GitRefKind};
use crate::registry::{ActionCache, AnalysisContext, Repo};
use crate::report::ActionReport;

mod codeql;
mod config;
mod engine;
mod expr;
mod github;
mod ir;
mod models;
mod output;
mod registry;
mod report;
mod shell;
mod sources;
mod summary;

/// Finds attacker-controlled dataflows in GitHub Actions setups.
#[derive(Parser)]
#[command(about, version)]
struct App {
    /// The mode of operation: analyze a repository's workflows, or a
    /// single action.
    #[arg(long, value_enum)]
    mode: Mode,

    /// The GitHub URL. Use USER:TOKEN@URL for private repositories.
    #[arg(long)]
    url: String,

    /// The output folder for SARIF reports.
    #[arg(long, default_value = "/tmp")]
    output_folder: Utf8PathBuf,

    /// The config file (JSON).
    #[arg(long)]
    config: Option<Utf8PathBuf>,

    #[command(flatten)]
    verbose: clap_verbosity_flag::Verbosity<InfoLevel>,

    /// The branch to analyze.
    #[arg(long, group = "rev")]
    branch: Option<String>,

    /// The commit to analyze.
    #[arg(long, group = "rev")]
    commit: Option<String>,

    /// The tag to analyze.
    #[arg(long, group = "rev")]
    tag: Option<String>,

    /// The repository-relative path of a single workflow to analyze
    /// (repo mode only).
    #[arg(long)]
    workflow_path: Option<String>,

    /// The repository-relative path of the action definition
    /// (action mode only).
    #[arg(long)]
    action_path: Option<String>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Mode {
    /// Analyze every workflow of a repository.
    Repo,
    /// Analyze a single action.
    Action,
}

/// Top-level errors, grouped by how they should be presented.
#[derive(Debug, Error)]
enum Error {
    /// The command line doesn't make sense.
    #[error("usage error: {0}")]
    Usage(String),
    /// Fetching or reading the top-level unit failed.
    #[error("i/o failure")]
    Io(#[source] anyhow::Error),
    /// The top-level unit couldn't be analyzed.
    #[error("analysis failed")]
    Analysis(#[source] anyhow::Error),
}

impl App {
    /// The pinned ref, decoded from whichever of `--branch`,
    /// `--commit`, `--tag` was supplied. Mutual exclusion is enforced
    /// by the clap group.
    fn checkout_ref(&self) -> Option<GitRef> {
        let decoded = |kind, value: &String| GitRef {
            kind,
            value: value.clone(),
        };

        self.branch
            .as_ref()
            .map(|v| decoded(GitRefKind::Branch, v))
            .or_else(|| self.commit.as_ref().map(|v| decoded(GitRefKind::Commit, v)))
            .or_else(|| self.tag.as_ref().map(|v| decoded(GitRefKind::Tag, v)))
    }
}

fn run(app: &App) -> Result<(), Error> {
    match app.mode {
        Mode::Repo => {
            if app.action_path.is_some() {
                return Err(Error::Usage(
                    "--action-path cannot be used in repo mode".into(),
                ));
            }
        }
        Mode::Action => {
            if app.workflow_path.is_some() {
                return Err(Error::Usage(
                    "--workflow-path cannot be used in action mode".into(),
                ));
            }
        }
    }

    let config = Config::load(app.config.as_deref(), Some(&app.output_folder))
        .map_err(Error::Io)?;

    let (url, token) = github::split_credentials(&app.url);
    let slug = github::repo_slug(&url).map_err(|err| Error::Usage(err.to_string()))?;

    let client = Client::new(token.as_deref()).map_err(Error::Io)?;
    let ctx = AnalysisContext {
        config: Rc::new(config),
        client: Rc::new(client),
        cache: ActionCache::default(),
    };

    std::fs::create_dir_all(&ctx.config.results_folder)
        .map_err(|err| Error::Io(anyhow!(err)))?;

    match app.mode {
        Mode::Repo => run_repo(app, &ctx, &slug),
        Mode::Action => run_action(app, &ctx, &slug),
    }
}

fn run_repo(app: &App, ctx: &AnalysisContext, slug: &str) -> Result<(), Error> {
    let checkout_ref = app.checkout_ref();
    let repo = Repo::open(ctx.clone(), slug, checkout_ref.as_ref()).map_err(Error::Io)?;

    let reports = repo
        .run(app.workflow_path.as_deref())
        .map_err(Error::Analysis)?;

    for report in &reports {
        let stem = report
            .path
            .file_stem()
            .unwrap_or(report.path.as_str())
            .to_string();
        let filename = format!("{slug}#{stem}.sarif", slug = slug.replace('/', "#"));
        let dest = ctx.config.results_folder.join(filename);

        write_sarif(&dest, &output::sarif::build_workflow_sarif(report))?;
        tracing::info!("{name}: wrote {dest}", name = report.name);
    }

    Ok(())
}

fn run_action(app: &App, ctx: &AnalysisContext, slug: &str) -> Result<(), Error> {
    let checkout_ref = app.checkout_ref();
    let folder = {
        let base = slug.replace('/', "#");
        let name = match &checkout_ref {
            Some(git_ref) => format!("{base}@{value}", value = git_ref.value.replace('/', "_")),
            None => base,
        };
        ctx.config.local_folder.join(name)
    };

    ctx.client
        .fetch_repo(
            slug,
            checkout_ref.as_ref().map(|r| r.value.as_str()),
            &folder,
        )
        .map_err(Error::Io)?;

    let (analyzed, kind) = registry::analyze_action_unit(
        ctx,
        slug,
        folder,
        app.action_path.as_deref(),
        checkout_ref.as_ref(),
    )
    .map_err(Error::Analysis)?;

    if kind == ActionKind::Docker {
        tracing::warn!("docker actions are opaque; nothing to report");
        return Ok(());
    }

    let report = ActionReport {
        name: analyzed.name.clone(),
        kind,
        summary: analyzed.summary.clone(),
    };

    let version = checkout_ref
        .map(|r| r.value.replace('/', "_"))
        .unwrap_or_else(|| "HEAD".into());
    let filename = format!("{slug}_{version}.sarif", slug = slug.replace('/', "#"));
    let dest = ctx.config.results_folder.join(filename);

    write_sarif(&dest, &output::sarif::build_action_sarif(&report))?;
    tracing::info!("wrote {dest}");

    Ok(())
}

fn write_sarif(dest: &camino::Utf8Path, sarif: &serde_sarif::sarif::Sarif) -> Result<(), Error> {
    let file = std::fs::File::create(dest).map_err(|err| Error::Io(anyhow!(err)))?;
    serde_json::to_writer_pretty(file, sarif).map_err(|err| Error::Io(anyhow!(err)))
}

fn main() -> ExitCode {
    human_panic::setup_panic!();

    let app = App::parse();

    let filter = EnvFilter::builder()
        .with_default_directive(app.verbose.tracing_level_filter().into())
        .from_env_lossy();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().without_time().with_writer(std::io::stderr))
        .with(filter)
        .init();

    match run(&app) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{fatal}: {err}", fatal = "fatal".red().bold());

            let mut source = std::error::Error::source(&err);
            while let Some(cause) = source {
                eprintln!("  caused by: {cause}");
                source = cause.source();
            }

            ExitCode::FAILURE
        }
    }
}
