//! Computes which repositories a run needs to look at, starting from a
//! main repository and following its `bindings` graph, and separately
//! resolves the `repository` indirection chain for a single repository
//! entry.
//!
//! The traversal is an explicit queue-based walk with insertion-order
//! deduplication; `repository` indirection is resolved by walking an
//! explicit ancestor chain so a cycle there can be reported with the full
//! chain instead of just the offending name.

use crate::config::{FileRootRef, RepoConfig, RepoRoot};
use crate::error::EngineError;
use anyhow::Error;
use std::collections::BTreeSet;

/// Two ordered lists: `to_include` drives the emitted configuration,
/// `to_setup` is the strict superset that also materializes overlay roots.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SetupClosure {
    pub to_include: Vec<String>,
    pub to_setup: Vec<String>,
}

/// Resolves the `repository` indirection chain for `name`, following string
/// values until an object/array root is reached. Detects cycles by walking
/// an explicit ancestor chain.
pub fn resolve_repo<'a>(
    config: &'a RepoConfig,
    name: &str,
    ancestors: &mut Vec<String>,
) -> Result<&'a RepoRoot, Error> {
    if ancestors.iter().any(|a| a == name) {
        ancestors.push(name.to_owned());
        return Err(EngineError::Config(format!(
            "cycle in 'repository' indirection: {}",
            ancestors.join(" -> ")
        ))
        .into());
    }

    ancestors.push(name.to_owned());

    let desc = config
        .repositories
        .get(name)
        .ok_or_else(|| EngineError::Resolution(format!("repository '{}' not found", name)))?;

    match &desc.repository {
        RepoRoot::Named(target) => resolve_repo(config, target, ancestors),
        other => {
            ancestors.pop();
            Ok(other)
        }
    }
}

/// Computes `to_include` as the reflexive-transitive closure of the
/// `bindings` graph rooted at `main`, using insertion-order traversal with
/// deduplication: a later-visited name is skipped, not re-added. Cycles
/// through `bindings` are not an error — only cycles in `repository`
/// indirection are.
pub fn reachable_repositories(config: &RepoConfig, main: &str) -> Result<SetupClosure, Error> {
    let mut to_include = Vec::new();
    let mut seen = BTreeSet::new();

    // Breadth-first in insertion order; a name is only ever appended the
    // first time we see it, matching "a later-visited name is skipped, not
    // re-added".
    let mut queue = std::collections::VecDeque::new();
    queue.push_back(main.to_owned());
    seen.insert(main.to_owned());

    while let Some(name) = queue.pop_front() {
        to_include.push(name.clone());

        let desc = config
            .repositories
            .get(&name)
            .ok_or_else(|| EngineError::Resolution(format!("repository '{}' not found", name)))?;

        for target in desc.bindings.values() {
            if seen.insert(target.clone()) {
                queue.push_back(target.clone());
            }
        }
    }

    let to_setup = expand_overlays(config, &to_include)?;

    Ok(SetupClosure { to_include, to_setup })
}

/// `to_setup = to_include ∪ { v | v referenced as an overlay root in any r
/// ∈ to_include }`, deduplicated against entries already present.
fn expand_overlays(config: &RepoConfig, to_include: &[String]) -> Result<Vec<String>, Error> {
    let mut to_setup = to_include.to_vec();
    let mut present: BTreeSet<&str> = to_include.iter().map(String::as_str).collect();

    for name in to_include {
        let desc = config
            .repositories
            .get(name)
            .ok_or_else(|| EngineError::Resolution(format!("repository '{}' not found", name)))?;

        for overlay in [&desc.target_root, &desc.rule_root, &desc.expression_root]
            .into_iter()
            .flatten()
        {
            if let FileRootRef::RepoName(overlay_name) = overlay {
                if !present.contains(overlay_name.as_str()) {
                    present.insert(overlay_name.as_str());
                    to_setup.push(overlay_name.clone());
                }
            }
        }
    }

    Ok(to_setup)
}

/// Both lists equal the full key set of the repositories mapping, used for
/// the `update` driver's global-fetch behavior.
pub fn default_reachable_repositories(config: &RepoConfig) -> SetupClosure {
    let all: Vec<String> = config.repositories.keys().cloned().collect();
    SetupClosure {
        to_include: all.clone(),
        to_setup: all,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RepoConfig;

    #[test]
    fn resolver_is_a_fixed_point_and_main_is_first() {
        let cfg = RepoConfig::from_str(
            r#"{"main": "a", "repositories": {
                "a": {"repository": ["file", "/a"], "bindings": {"x": "b"}},
                "b": {"repository": ["file", "/b"], "bindings": {"y": "c"}},
                "c": {"repository": ["file", "/c"]}
            }}"#,
        )
        .unwrap();

        let closure = reachable_repositories(&cfg, "a").unwrap();
        assert_eq!(closure.to_include, vec!["a", "b", "c"]);
        assert_eq!(closure.to_include.first().unwrap(), "a");

        // Fixed point: re-running from each subsequent element doesn't grow
        // the set further than the full traversal already found.
        let again = reachable_repositories(&cfg, "a").unwrap();
        assert_eq!(closure, again);
    }

    #[test]
    fn cyclic_bindings_terminate_without_error() {
        let cfg = RepoConfig::from_str(
            r#"{"main": "a", "repositories": {
                "a": {"repository": ["file", "/a"], "bindings": {"x": "b"}},
                "b": {"repository": ["file", "/b"], "bindings": {"x": "a"}}
            }}"#,
        )
        .unwrap();

        let closure = reachable_repositories(&cfg, "a").unwrap();
        assert_eq!(closure.to_include, vec!["a", "b"]);
    }

    #[test]
    fn cyclic_repository_indirection_is_fatal() {
        let cfg = RepoConfig::from_str(
            r#"{"repositories": {
                "a": {"repository": "b"},
                "b": {"repository": "a"}
            }}"#,
        )
        .unwrap();

        let mut ancestors = Vec::new();
        let err = resolve_repo(&cfg, "a", &mut ancestors).unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn to_setup_includes_overlay_roots_without_duplicates() {
        let cfg = RepoConfig::from_str(
            r#"{"main": "a", "repositories": {
                "a": {"repository": ["file", "/a"], "target_root": "overlay"},
                "overlay": {"repository": ["file", "/o"]}
            }}"#,
        )
        .unwrap();

        let closure = reachable_repositories(&cfg, "a").unwrap();
        assert_eq!(closure.to_include, vec!["a"]);
        assert_eq!(closure.to_setup, vec!["a", "overlay"]);
    }

    #[test]
    fn default_reachable_repositories_is_everything() {
        let cfg = RepoConfig::from_str(
            r#"{"repositories": {
                "a": {"repository": ["file", "/a"]},
                "b": {"repository": ["file", "/b"]}
            }}"#,
        )
        .unwrap();

        let closure = default_reachable_repositories(&cfg);
        assert_eq!(closure.to_include, vec!["a", "b"]);
        assert_eq!(closure.to_setup, vec!["a", "b"]);
    }
}
