//! Repository configuration, descriptors, file roots, and the run-control
//! input. Unknown fields are preserved verbatim via `serde_json::Value`
//! maps instead of `#[serde(deny_unknown_fields)]` structs, so a
//! round-tripped configuration never silently drops a field it didn't
//! recognize.

use crate::error::EngineError;
use crate::hash::TreeId;
use anyhow::{bail, Context as _, Error};
use serde_json::{Map, Value};
use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

/// A file root: either a plain filesystem path, or a pinned Git tree inside
/// a given repository's object database.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FileRoot {
    File { path: PathBuf },
    GitTree { tree_id: TreeId, repo_path: PathBuf },
}

impl FileRoot {
    pub fn from_json(value: &Value) -> Result<Self, Error> {
        let arr = value
            .as_array()
            .context("file root must be a JSON array")?;
        let tag = arr
            .first()
            .and_then(Value::as_str)
            .context("file root array must have a string head")?;

        match tag {
            "file" => {
                let path = arr
                    .get(1)
                    .and_then(Value::as_str)
                    .context("'file' root requires a path at index 1")?;
                Ok(FileRoot::File {
                    path: PathBuf::from(path),
                })
            }
            "git tree" => {
                let tree_id = arr
                    .get(1)
                    .and_then(Value::as_str)
                    .context("'git tree' root requires a tree id at index 1")?
                    .parse()
                    .context("invalid tree id in 'git tree' root")?;
                let repo_path = arr
                    .get(2)
                    .and_then(Value::as_str)
                    .context("'git tree' root requires a repo path at index 2")?;
                Ok(FileRoot::GitTree {
                    tree_id,
                    repo_path: PathBuf::from(repo_path),
                })
            }
            other => bail!("unrecognized file root tag '{}'", other),
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            FileRoot::File { path } => {
                Value::Array(vec![Value::from("file"), Value::from(path.to_string_lossy().into_owned())])
            }
            FileRoot::GitTree { tree_id, repo_path } => Value::Array(vec![
                Value::from("git tree"),
                Value::from(tree_id.to_hex()),
                Value::from(repo_path.to_string_lossy().into_owned()),
            ]),
        }
    }
}

/// An archive descriptor (`type ∈ {archive, zip, …}`).
#[derive(Clone, Debug)]
pub struct ArchiveDescriptor {
    pub content: crate::hash::ContentHash,
    pub fetch: url::Url,
    pub distfile: Option<String>,
    pub sha256: Option<String>,
    pub sha512: Option<String>,
    pub subdir: Option<String>,
}

impl ArchiveDescriptor {
    fn from_fields(fields: &Map<String, Value>) -> Result<Self, Error> {
        let content = fields
            .get("content")
            .and_then(Value::as_str)
            .context("archive descriptor missing 'content'")?
            .parse()
            .context("invalid 'content' hash in archive descriptor")?;
        let fetch = fields
            .get("fetch")
            .and_then(Value::as_str)
            .context("archive descriptor missing 'fetch'")?;
        let fetch = url::Url::parse(fetch).context("invalid 'fetch' url in archive descriptor")?;

        Ok(Self {
            content,
            fetch,
            distfile: str_field(fields, "distfile"),
            sha256: str_field(fields, "sha256"),
            sha512: str_field(fields, "sha512"),
            subdir: str_field(fields, "subdir"),
        })
    }
}

fn str_field(fields: &Map<String, Value>, name: &str) -> Option<String> {
    fields.get(name).and_then(Value::as_str).map(str::to_owned)
}

/// A tree-generator descriptor: a command that is run to materialize a
/// pinned tree id on demand.
#[derive(Clone, Debug)]
pub struct GeneratorDescriptor {
    pub command: Vec<String>,
    pub env_vars: BTreeMap<String, String>,
    pub inherit_env: Vec<String>,
    pub tree_id: TreeId,
    pub origin: String,
}

impl GeneratorDescriptor {
    fn from_fields(fields: &Map<String, Value>, origin: String) -> Result<Self, Error> {
        let command = fields
            .get("command")
            .and_then(Value::as_array)
            .context("generator descriptor missing 'command'")?
            .iter()
            .map(|v| {
                v.as_str()
                    .map(str::to_owned)
                    .context("'command' entries must be strings")
            })
            .collect::<Result<Vec<_>, _>>()?;

        if command.is_empty() {
            bail!("generator descriptor 'command' must not be empty");
        }

        let env_vars = fields
            .get("env_vars")
            .and_then(Value::as_object)
            .map(|m| {
                m.iter()
                    .map(|(k, v)| {
                        let v = v.as_str().context("'env_vars' values must be strings")?;
                        Ok((k.clone(), v.to_owned()))
                    })
                    .collect::<Result<BTreeMap<_, _>, Error>>()
            })
            .transpose()?
            .unwrap_or_default();

        let inherit_env = fields
            .get("inherit_env")
            .and_then(Value::as_array)
            .map(|a| {
                a.iter()
                    .map(|v| {
                        v.as_str()
                            .map(str::to_owned)
                            .context("'inherit_env' entries must be strings")
                    })
                    .collect::<Result<Vec<_>, _>>()
            })
            .transpose()?
            .unwrap_or_default();

        let tree_id = fields
            .get("tree_id")
            .and_then(Value::as_str)
            .context("generator descriptor missing 'tree_id'")?
            .parse()
            .context("invalid 'tree_id' in generator descriptor")?;

        Ok(Self {
            command,
            env_vars,
            inherit_env,
            tree_id,
            origin,
        })
    }
}

/// What the `repository` field of a descriptor resolves to: either an
/// indirection to another repository name, or a concrete root.
#[derive(Clone, Debug)]
pub enum RepoRoot {
    Named(String),
    Root(FileRoot),
    Archive(ArchiveDescriptor),
    Generator(GeneratorDescriptor),
}

/// A single entry in the top-level `repositories` map.
#[derive(Clone, Debug)]
pub struct RepoDescriptor {
    pub name: String,
    pub repository: RepoRoot,
    pub target_root: Option<FileRootRef>,
    pub rule_root: Option<FileRootRef>,
    pub expression_root: Option<FileRootRef>,
    pub target_file_name: String,
    pub rule_file_name: String,
    pub expression_file_name: String,
    pub bindings: BTreeMap<String, String>,
    /// Raw JSON so the setup driver can round-trip unknown fields verbatim.
    pub raw: Map<String, Value>,
}

/// An overlay root reference: either a plain string repository name or an
/// inline root value — the config format allows both.
#[derive(Clone, Debug)]
pub enum FileRootRef {
    RepoName(String),
    Inline(Value),
}

impl RepoDescriptor {
    fn parse(name: &str, value: &Value) -> Result<Self, Error> {
        let obj = value
            .as_object()
            .with_context(|| format!("descriptor '{}' must be a JSON object", name))?;

        let repository = obj
            .get("repository")
            .with_context(|| format!("descriptor '{}' missing 'repository'", name))?;

        let repository = parse_repo_root(repository, name)?;

        let bindings = obj
            .get("bindings")
            .and_then(Value::as_object)
            .map(|m| {
                m.iter()
                    .map(|(k, v)| {
                        let v = v
                            .as_str()
                            .with_context(|| format!("binding '{}' value must be a string", k))?;
                        Ok((k.clone(), v.to_owned()))
                    })
                    .collect::<Result<BTreeMap<_, _>, Error>>()
            })
            .transpose()?
            .unwrap_or_default();

        Ok(Self {
            name: name.to_owned(),
            repository,
            target_root: overlay_field(obj, "target_root"),
            rule_root: overlay_field(obj, "rule_root"),
            expression_root: overlay_field(obj, "expression_root"),
            target_file_name: str_field(obj, "target_file_name").unwrap_or_else(|| "TARGETS".into()),
            rule_file_name: str_field(obj, "rule_file_name").unwrap_or_else(|| "RULES".into()),
            expression_file_name: str_field(obj, "expression_file_name")
                .unwrap_or_else(|| "EXPRESSIONS".into()),
            bindings,
            raw: obj.clone(),
        })
    }
}

fn overlay_field(obj: &Map<String, Value>, field: &str) -> Option<FileRootRef> {
    obj.get(field).map(|v| match v.as_str() {
        Some(s) => FileRootRef::RepoName(s.to_owned()),
        None => FileRootRef::Inline(v.clone()),
    })
}

/// Parses the `repository` field of a descriptor. It is one
/// of: a plain string (indirection to another repository name), a file-root
/// array (`["file", path]` / `["git tree", tree_id, repo_path]`), or an
/// object with a `type` discriminant for the archive/generator cases.
fn parse_repo_root(value: &Value, origin: &str) -> Result<RepoRoot, Error> {
    if let Some(name) = value.as_str() {
        return Ok(RepoRoot::Named(name.to_owned()));
    }

    if value.is_array() {
        return Ok(RepoRoot::Root(FileRoot::from_json(value)?));
    }

    let obj = value
        .as_object()
        .with_context(|| format!("'repository' in '{}' must be a string, array, or object", origin))?;

    let ty = obj
        .get("type")
        .and_then(Value::as_str)
        .with_context(|| format!("'repository' object in '{}' missing 'type'", origin))?;

    match ty {
        "archive" | "zip" => Ok(RepoRoot::Archive(ArchiveDescriptor::from_fields(obj)?)),
        "git tree" => Ok(RepoRoot::Generator(GeneratorDescriptor::from_fields(
            obj,
            format!("{}:generator", origin),
        )?)),
        other => bail!("unrecognized repository type '{}' in '{}'", other, origin),
    }
}

/// The top-level repository configuration.
#[derive(Clone, Debug, Default)]
pub struct RepoConfig {
    pub main: String,
    pub repositories: BTreeMap<String, RepoDescriptor>,
}

impl RepoConfig {
    pub fn parse(json: &Value) -> Result<Self, Error> {
        Self::parse_inner(json).map_err(|e| EngineError::Config(format!("{:#}", e)).into())
    }

    fn parse_inner(json: &Value) -> Result<Self, Error> {
        let obj = json.as_object().context("configuration must be a JSON object")?;

        let main = obj
            .get("main")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned();

        let repositories = obj
            .get("repositories")
            .and_then(Value::as_object)
            .map(|m| {
                m.iter()
                    .map(|(name, v)| Ok((name.clone(), RepoDescriptor::parse(name, v)?)))
                    .collect::<Result<BTreeMap<_, _>, Error>>()
            })
            .transpose()?
            .unwrap_or_default();

        Ok(Self { main, repositories })
    }

    pub fn from_str(s: &str) -> Result<Self, Error> {
        Self::from_str_inner(s).map_err(|e| EngineError::Config(format!("{:#}", e)).into())
    }

    fn from_str_inner(s: &str) -> Result<Self, Error> {
        let json: Value = serde_json::from_str(s).context("invalid JSON in repository configuration")?;
        Self::parse_inner(&json)
    }

    /// The `main` to use once defaults are applied: if unspecified and at
    /// least one repository exists, the lexicographically smallest name.
    pub fn effective_main(&self) -> Option<String> {
        if !self.main.is_empty() {
            return Some(self.main.clone());
        }
        self.repositories.keys().next().cloned()
    }
}

/// A resolved `(path, base)` location pair.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedLocation {
    pub path: PathBuf,
    pub base: Option<PathBuf>,
}

/// A single `Location` entry from the run-control input.
/// `Deserialize` is hand-implemented below (`location_serde`) since `root`
/// arrives as one of three string literals and a precise error naming the
/// offending value is worth more than a derive.
#[derive(Clone, Debug)]
pub struct Location {
    pub root: LocationRoot,
    pub path: PathBuf,
    pub base: Option<PathBuf>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LocationRoot {
    Workspace,
    Home,
    System,
}

mod location_serde {
    use super::{Location, LocationRoot};
    use serde::{de, Deserialize, Deserializer};
    use std::path::PathBuf;

    #[derive(Deserialize)]
    struct Raw {
        root: String,
        path: PathBuf,
        base: Option<PathBuf>,
    }

    impl<'de> Deserialize<'de> for Location {
        fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
        where
            D: Deserializer<'de>,
        {
            let raw = Raw::deserialize(deserializer)?;
            let root = match raw.root.as_str() {
                "workspace" => LocationRoot::Workspace,
                "home" => LocationRoot::Home,
                "system" => LocationRoot::System,
                other => {
                    return Err(de::Error::custom(format!(
                        "unknown location root '{}', expected 'workspace', 'home', or 'system'",
                        other
                    )))
                }
            };
            Ok(Location {
                root,
                path: raw.path,
                base: raw.base,
            })
        }
    }
}

/// The run-control input.
#[derive(Clone, Debug, Default, serde::Deserialize)]
pub struct RunControl {
    #[serde(rename = "local build root", default)]
    pub local_build_root: Option<LocationOrList>,
    #[serde(rename = "checkout locations", default)]
    pub checkout_locations: Option<LocationOrList>,
    #[serde(default)]
    pub distdirs: Option<LocationOrList>,
    #[serde(rename = "just args", default)]
    pub just_args: Option<LocationOrList>,
    #[serde(rename = "config lookup order", default)]
    pub config_lookup_order: Option<LocationOrList>,
}

#[derive(Clone, Debug, serde::Deserialize)]
#[serde(untagged)]
pub enum LocationOrList {
    One(Location),
    Many(Vec<Location>),
}

impl LocationOrList {
    pub fn as_slice(&self) -> Vec<&Location> {
        match self {
            LocationOrList::One(l) => vec![l],
            LocationOrList::Many(v) => v.iter().collect(),
        }
    }
}

impl RunControl {
    pub fn from_str(s: &str) -> Result<Self, Error> {
        serde_json::from_str::<Self>(s)
            .context("invalid JSON in run-control input")
            .map_err(|e| EngineError::Config(format!("{:#}", e)).into())
    }

    pub fn distdirs(&self) -> Vec<&Location> {
        self.distdirs.as_ref().map(LocationOrList::as_slice).unwrap_or_default()
    }
}

/// Resolves a [`Location`] to an absolute, canonical `(path, base)` pair.
/// A `workspace`-rooted location is skipped with a warning (returns
/// `Ok(None)`) when no workspace root was detected; this is never fatal.
pub fn resolve_location(loc: &Location, workspace_root: Option<&Path>) -> Result<Option<ResolvedLocation>, Error> {
    let root_dir = match loc.root {
        LocationRoot::Workspace => match workspace_root {
            Some(p) => p.to_path_buf(),
            None => {
                tracing::warn!(
                    path = %loc.path.display(),
                    "skipping workspace-rooted location: no workspace detected"
                );
                return Ok(None);
            }
        },
        LocationRoot::Home => directories::UserDirs::new()
            .map(|d| d.home_dir().to_path_buf())
            .context("could not determine home directory")?,
        LocationRoot::System => PathBuf::from("/"),
    };

    let path = crate::hash::canonical_path(&root_dir.join(&loc.path))?;
    let base = loc
        .base
        .as_ref()
        .map(|b| crate::hash::canonical_path(&root_dir.join(b)))
        .transpose()?;

    Ok(Some(ResolvedLocation { path, base }))
}

/// Marker-file search for the workspace root: walks upward from `start`
/// looking for any of `markers` to exist in a directory.
pub fn detect_workspace_root(start: &Path, markers: &[&str]) -> Option<PathBuf> {
    let mut dir = start;
    loop {
        if markers.iter().any(|m| dir.join(m).exists()) {
            return Some(dir.to_path_buf());
        }
        dir = dir.parent()?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{exit_code_for, ExitCode};

    #[test]
    fn parses_file_root() {
        let v: Value = serde_json::json!(["file", "/src/a"]);
        let root = FileRoot::from_json(&v).unwrap();
        assert_eq!(root, FileRoot::File { path: "/src/a".into() });
    }

    #[test]
    fn parses_git_tree_root() {
        let hex = "a".repeat(40);
        let v: Value = serde_json::json!(["git tree", hex, "/git"]);
        let root = FileRoot::from_json(&v).unwrap();
        match root {
            FileRoot::GitTree { repo_path, .. } => assert_eq!(repo_path, PathBuf::from("/git")),
            _ => panic!("expected GitTree"),
        }
    }

    #[test]
    fn empty_repositories_config() {
        let cfg = RepoConfig::from_str(r#"{}"#).unwrap();
        assert_eq!(cfg.main, "");
        assert!(cfg.repositories.is_empty());
        assert_eq!(cfg.effective_main(), None);
    }

    #[test]
    fn default_main_is_lexicographically_smallest() {
        let cfg = RepoConfig::from_str(
            r#"{"repositories": {
                "zeta": {"repository": ["file", "/z"]},
                "alpha": {"repository": ["file", "/a"]}
            }}"#,
        )
        .unwrap();
        assert_eq!(cfg.effective_main().as_deref(), Some("alpha"));
    }

    #[test]
    fn cyclic_repository_indirection_parses_but_resolves_later() {
        // Parsing itself never detects indirection cycles; that is the
        // resolver's job, so it can report an ancestor chain.
        let cfg = RepoConfig::from_str(
            r#"{"main": "a", "repositories": {
                "a": {"repository": "b"},
                "b": {"repository": "a"}
            }}"#,
        )
        .unwrap();
        assert_eq!(cfg.repositories.len(), 2);
    }

    #[test]
    fn malformed_json_is_tagged_as_a_config_error() {
        let err = RepoConfig::from_str("{ not json").unwrap_err();
        assert_eq!(exit_code_for(&err), ExitCode::ConfigError);
    }

    #[test]
    fn unrecognized_repository_type_is_tagged_as_a_config_error() {
        let err = RepoConfig::from_str(
            r#"{"repositories": {"a": {"repository": {"type": "nonsense"}}}}"#,
        )
        .unwrap_err();
        assert_eq!(exit_code_for(&err), ExitCode::ConfigError);
    }

    #[test]
    fn malformed_run_control_json_is_tagged_as_a_config_error() {
        let err = RunControl::from_str("{ not json").unwrap_err();
        assert_eq!(exit_code_for(&err), ExitCode::ConfigError);
    }

    #[test]
    fn unknown_fields_are_preserved_in_raw() {
        let cfg = RepoConfig::from_str(
            r#"{"repositories": {"a": {"repository": ["file", "/a"], "custom_field": 42}}}"#,
        )
        .unwrap();
        let raw = &cfg.repositories["a"].raw;
        assert_eq!(raw.get("custom_field"), Some(&Value::from(42)));
    }
}
