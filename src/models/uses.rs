//! `uses:` clause decoding.
//!
//! A step or reusable-workflow job can reference a local path
//! (`./path`), a Docker image (`docker://...`), or another repository
//! (`owner/repo[/subpath][@ref]`). Repository refs are further
//! classified as commit, tag, or branch so that checkouts and cache
//! keys are precise.

use std::sync::LazyLock;

use regex::Regex;

/// How a repository ref should be interpreted.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum GitRefKind {
    Commit,
    Tag,
    Branch,
}

/// A decoded `@ref` component.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct GitRef {
    pub(crate) kind: GitRefKind,
    pub(crate) value: String,
}

static DOTTED_VERSION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d+\.\d+(\.\d+)?$").unwrap());

fn is_version_number(candidate: &str) -> bool {
    candidate.parse::<u64>().is_ok() || DOTTED_VERSION.is_match(candidate)
}

impl GitRef {
    /// Decodes a raw ref string: 40 hex characters are a commit,
    /// version-shaped refs (`v1.2`, `latest`, `releases/v3`, `1.2.3`)
    /// are tags, and everything else is a branch.
    pub(crate) fn decode(raw: &str) -> Self {
        let value = raw.to_string();

        if raw.len() == 40 && raw.chars().all(|c| c.is_ascii_hexdigit()) {
            return Self {
                kind: GitRefKind::Commit,
                value,
            };
        }

        let tagish = matches!(raw.strip_prefix('v'), Some(rest) if is_version_number(rest))
            || raw == "latest"
            || matches!(raw.strip_prefix("releases/v"), Some(rest) if is_version_number(rest))
            || is_version_number(raw.trim());

        Self {
            kind: if tagish {
                GitRefKind::Tag
            } else {
                GitRefKind::Branch
            },
            value,
        }
    }
}

impl std::fmt::Display for GitRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.value)
    }
}

/// A `uses: ./some/path` clause.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct LocalUses {
    pub(crate) path: String,
}

/// A `uses: docker://image` clause. Opaque to the analysis.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct DockerUses {
    pub(crate) image: String,
}

/// A `uses: owner/repo[/subpath][@ref]` clause.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct RepositoryUses {
    pub(crate) owner: String,
    pub(crate) repo: String,
    pub(crate) subpath: Option<String>,
    pub(crate) git_ref: Option<GitRef>,
}

impl RepositoryUses {
    pub(crate) fn slug(&self) -> String {
        format!("{owner}/{repo}", owner = self.owner, repo = self.repo)
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) enum Uses {
    Local(LocalUses),
    Docker(DockerUses),
    Repository(RepositoryUses),
}

#[derive(Debug, PartialEq, thiserror::Error)]
#[error("malformed `uses` clause: {0}")]
pub(crate) struct UsesError(String);

impl Uses {
    pub(crate) fn parse(raw: &str) -> Result<Self, UsesError> {
        let raw = raw.trim();

        if let Some(path) = raw.strip_prefix("./") {
            return Ok(Self::Local(LocalUses { path: path.into() }));
        }

        if let Some(image) = raw.strip_prefix("docker://") {
            return Ok(Self::Docker(DockerUses {
                image: image.into(),
            }));
        }

        // GitHub refuses `uses:` clauses with more than one `@`, so the
        // rightmost split is unambiguous.
        let (path, git_ref) = match raw.rsplit_once('@') {
            Some((path, git_ref)) => (path, Some(GitRef::decode(git_ref))),
            None => (raw, None),
        };

        let mut segments = path.split('/');
        let (Some(owner), Some(repo)) = (segments.next(), segments.next()) else {
            return Err(UsesError(raw.into()));
        };
        if owner.is_empty() || repo.is_empty() {
            return Err(UsesError(raw.into()));
        }

        let subpath = {
            let rest = segments.collect::<Vec<_>>().join("/");
            (!rest.is_empty()).then_some(rest)
        };

        Ok(Self::Repository(RepositoryUses {
            owner: owner.into(),
            repo: repo.into(),
            subpath,
            git_ref,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::{GitRef, GitRefKind, Uses};

    #[test]
    fn test_ref_decode() {
        for (raw, kind) in [
            ("8f4b7f84864484a7bf31766abe9204da3cbe65b3", GitRefKind::Commit),
            ("8f4b7f84864484a7bf31766abe9204da3cbe65b", GitRefKind::Branch),
            ("v1", GitRefKind::Tag),
            ("v1.2", GitRefKind::Tag),
            ("v1.2.3", GitRefKind::Tag),
            ("latest", GitRefKind::Tag),
            ("releases/v2", GitRefKind::Tag),
            ("1.2", GitRefKind::Tag),
            ("main", GitRefKind::Branch),
            ("feature/foo", GitRefKind::Branch),
            ("v1.2.3-beta", GitRefKind::Branch),
        ] {
            let decoded = GitRef::decode(raw);
            assert_eq!(decoded.kind, kind, "{raw}");
            assert_eq!(decoded.value, raw);
        }
    }

    #[test]
    fn test_uses_parse() {
        let Ok(Uses::Repository(repo)) = Uses::parse("actions/checkout@v4") else {
            panic!();
        };
        assert_eq!(repo.slug(), "actions/checkout");
        assert_eq!(repo.subpath, None);
        assert_eq!(repo.git_ref.unwrap().kind, GitRefKind::Tag);

        let Ok(Uses::Repository(repo)) = Uses::parse("github/codeql-action/init@v2") else {
            panic!();
        };
        assert_eq!(repo.slug(), "github/codeql-action");
        assert_eq!(repo.subpath.as_deref(), Some("init"));

        let Ok(Uses::Local(local)) = Uses::parse("./.github/actions/setup") else {
            panic!();
        };
        assert_eq!(local.path, ".github/actions/setup");

        let Ok(Uses::Docker(docker)) = Uses::parse("docker://alpine:3.19") else {
            panic!();
        };
        assert_eq!(docker.image, "alpine:3.19");

        assert!(Uses::parse("lonesegment").is_err());
    }
}
