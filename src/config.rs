//! `elm-watch.json` loading and project resolution.
//!
//! The config file maps target names to inputs, an output path (or null
//! for typecheck-only), and an optional postprocess command. Resolution
//! turns that into a [`Project`]: inputs are absolutized and checked,
//! each target is pinned to the `elm.json` its inputs live under, and
//! targets are grouped per manifest in declaration order.
//!
//! Per-target problems do not abort loading; they are collected as
//! [`ElmJsonErrorEntry`] values and reprinted every compile cycle.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use rustc_hash::{FxHashMap, FxHashSet};
use serde::Deserialize;

use crate::errors::ConfigError;
use crate::project::{ElmJson, ElmJsonErrorEntry, OutputPath, OutputState, Project};

/// The configuration file name searched for upward from the cwd.
pub const CONFIG_FILE: &str = "elm-watch.json";

// ============================================================================
// File format
// ============================================================================

#[derive(Debug, Deserialize)]
struct ElmWatchJson {
    #[serde(default)]
    port: Option<u16>,
    /// Declaration order is meaningful (priority tie-break), hence the
    /// order-preserving map.
    targets: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct TargetConfig {
    inputs: Vec<String>,
    #[serde(default)]
    output: Option<String>,
    #[serde(default)]
    postprocess: Option<Vec<String>>,
}

// ============================================================================
// Loading
// ============================================================================

/// Find `elm-watch.json` by searching upward from `cwd`.
pub fn find_config(cwd: &Path) -> Option<PathBuf> {
    cwd.ancestors().map(|dir| dir.join(CONFIG_FILE)).find(|p| p.is_file())
}

/// All target names present in the config file, in declaration order.
pub fn target_names(config_path: &Path) -> Result<Vec<String>> {
    let parsed = parse(config_path)?;
    Ok(parsed.targets.keys().cloned().collect())
}

fn parse(config_path: &Path) -> Result<ElmWatchJson> {
    let json = std::fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    serde_json::from_str(&json)
        .with_context(|| format!("failed to parse {}", config_path.display()))
}

/// Load and resolve the project.
///
/// `enabled` filters targets by name; `None` enables all. Filtered-out
/// targets land in `disabled_outputs` so WebSocket connects to them can
/// be answered with a helpful message.
pub fn load_project(config_path: &Path, enabled: Option<&FxHashSet<String>>) -> Result<Project> {
    let parsed = parse(config_path)?;
    if parsed.targets.is_empty() {
        bail!("{} has no targets", config_path.display());
    }

    // Canonicalized so watcher events compare equal to project paths
    let config_path = config_path.canonicalize().unwrap_or_else(|_| config_path.to_path_buf());
    let watch_root = config_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    let mut elm_jsons: Vec<ElmJson> = Vec::new();
    let mut elm_json_errors = Vec::new();
    let mut disabled_outputs = FxHashSet::default();

    for (name, value) in &parsed.targets {
        if let Some(enabled) = enabled
            && !enabled.contains(name)
        {
            // Keyed by the user-written output path: that is what
            // WebSocket clients identify themselves with
            match serde_json::from_value::<TargetConfig>(value.clone()) {
                Ok(TargetConfig { output: Some(original), .. }) => {
                    disabled_outputs.insert(original);
                }
                _ => {
                    disabled_outputs.insert("/dev/null".to_string());
                }
            }
            continue;
        }

        let target: TargetConfig = match serde_json::from_value(value.clone()) {
            Ok(target) => target,
            Err(e) => bail!("invalid target {:?} in {}: {}", name, config_path.display(), e),
        };
        if target.inputs.is_empty() {
            bail!("target {:?} in {} has no inputs", name, config_path.display());
        }

        match resolve_target(&target, &watch_root) {
            Ok((elm_json_path, output, state)) => {
                match elm_jsons.iter_mut().find(|e| e.path == elm_json_path) {
                    Some(elm_json) => elm_json.outputs.push((output, state)),
                    None => elm_jsons.push(ElmJson {
                        path: elm_json_path,
                        outputs: vec![(output, state)],
                    }),
                }
            }
            Err((error, related_paths)) => elm_json_errors.push(ElmJsonErrorEntry {
                output_name: name.clone(),
                related_paths,
                error,
            }),
        }
    }

    Ok(Project {
        watch_root,
        config_path: config_path.to_path_buf(),
        port_from_config: parsed.port,
        elm_jsons,
        elm_json_errors,
        disabled_outputs,
    })
}

// ============================================================================
// Target resolution
// ============================================================================

type ResolveError = (ConfigError, Vec<PathBuf>);

fn resolve_target(
    target: &TargetConfig,
    watch_root: &Path,
) -> Result<(PathBuf, OutputPath, OutputState), ResolveError> {
    let inputs: Vec<PathBuf> = target.inputs.iter().map(|i| watch_root.join(i)).collect();

    let duplicates = duplicated(&inputs);
    if !duplicates.is_empty() {
        return Err((ConfigError::DuplicateInputs { duplicates: duplicates.clone() }, duplicates));
    }

    let missing: Vec<PathBuf> = inputs.iter().filter(|i| !i.is_file()).cloned().collect();
    if !missing.is_empty() {
        return Err((ConfigError::InputsNotFound { inputs: missing.clone() }, missing));
    }

    let mut resolved = Vec::with_capacity(inputs.len());
    let mut failed = Vec::new();
    for input in &inputs {
        match input.canonicalize() {
            Ok(path) => resolved.push(path),
            Err(e) => failed.push((input.clone(), e.to_string())),
        }
    }
    if !failed.is_empty() {
        let paths: Vec<PathBuf> = failed.iter().map(|(p, _)| p.clone()).collect();
        return Err((ConfigError::InputsFailedToResolve { inputs: failed }, paths));
    }

    let elm_json_path = unique_elm_json(&resolved).map_err(|e| (e, resolved.clone()))?;

    let output = match &target.output {
        None => OutputPath::Null,
        Some(original) => OutputPath::Real {
            absolute: watch_root.join(original),
            original: original.clone(),
        },
    };

    // An empty postprocess array means "none"
    let postprocess = target.postprocess.clone().filter(|p| !p.is_empty());
    Ok((elm_json_path, output, OutputState::new(resolved, postprocess)))
}

fn duplicated(inputs: &[PathBuf]) -> Vec<PathBuf> {
    let mut seen = FxHashSet::default();
    let mut duplicates = Vec::new();
    for input in inputs {
        if !seen.insert(input) && !duplicates.contains(input) {
            duplicates.push(input.clone());
        }
    }
    duplicates
}

/// Walk up from each input until an `elm.json` is found; all inputs of a
/// target must agree on one.
fn unique_elm_json(inputs: &[PathBuf]) -> Result<PathBuf, ConfigError> {
    let mut found: FxHashMap<PathBuf, ()> = FxHashMap::default();
    let mut ordered = Vec::new();
    for input in inputs {
        let Some(elm_json) = input
            .ancestors()
            .skip(1)
            .map(|dir| dir.join("elm.json"))
            .find(|p| p.is_file())
        else {
            return Err(ConfigError::ElmJsonNotFound { inputs: inputs.to_vec() });
        };
        if found.insert(elm_json.clone(), ()).is_none() {
            ordered.push(elm_json);
        }
    }
    match ordered.as_slice() {
        [single] => Ok(single.clone()),
        _ => Err(ConfigError::NonUniqueElmJsonPaths { paths: ordered }),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(path: &Path, contents: &str) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, contents).unwrap();
    }

    fn project_dir() -> TempDir {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        write(&root.join("elm.json"), "{}");
        write(&root.join("src/Main.elm"), "module Main exposing (main)\n");
        write(&root.join("src/Admin.elm"), "module Admin exposing (main)\n");
        temp
    }

    fn config(root: &Path, json: &str) -> PathBuf {
        let path = root.join(CONFIG_FILE);
        write(&path, json);
        path
    }

    #[test]
    fn test_find_config_walks_up() {
        let temp = project_dir();
        let path = config(temp.path(), r#"{"targets":{}}"#);
        let nested = temp.path().join("src");
        assert_eq!(find_config(&nested).unwrap(), path);
        assert_eq!(find_config(temp.path()).unwrap(), path);
    }

    #[test]
    fn test_load_single_target() {
        let temp = project_dir();
        let path = config(
            temp.path(),
            r#"{"targets":{"main":{"inputs":["src/Main.elm"],"output":"build/main.js"}}}"#,
        );
        let project = load_project(&path, None).unwrap();
        assert_eq!(project.elm_jsons.len(), 1);
        assert_eq!(project.enabled_originals(), ["build/main.js"]);
        assert!(project.elm_json_errors.is_empty());
        let (_, output, state) = project.outputs().next().unwrap();
        assert!(!output.is_null());
        assert!(state.postprocess.is_none());
        assert!(state.dirty);
    }

    #[test]
    fn test_null_output_is_typecheck_only() {
        let temp = project_dir();
        let path = config(
            temp.path(),
            r#"{"targets":{"check":{"inputs":["src/Main.elm"],"output":null}}}"#,
        );
        let project = load_project(&path, None).unwrap();
        let (_, output, _) = project.outputs().next().unwrap();
        assert!(output.is_null());
    }

    #[test]
    fn test_declaration_order_and_grouping() {
        let temp = project_dir();
        let path = config(
            temp.path(),
            r#"{"targets":{
                "b":{"inputs":["src/Admin.elm"],"output":"b.js"},
                "a":{"inputs":["src/Main.elm"],"output":"a.js"}
            }}"#,
        );
        let project = load_project(&path, None).unwrap();
        assert_eq!(project.elm_jsons.len(), 1, "same elm.json groups targets");
        assert_eq!(project.enabled_originals(), ["b.js", "a.js"]);
    }

    #[test]
    fn test_missing_input_collected_not_fatal() {
        let temp = project_dir();
        let path = config(
            temp.path(),
            r#"{"targets":{
                "broken":{"inputs":["src/Nope.elm"],"output":"x.js"},
                "ok":{"inputs":["src/Main.elm"],"output":"ok.js"}
            }}"#,
        );
        let project = load_project(&path, None).unwrap();
        assert_eq!(project.elm_json_errors.len(), 1);
        assert!(matches!(project.elm_json_errors[0].error, ConfigError::InputsNotFound { .. }));
        assert_eq!(project.enabled_originals(), ["ok.js"]);
    }

    #[test]
    fn test_duplicate_inputs_collected() {
        let temp = project_dir();
        let path = config(
            temp.path(),
            r#"{"targets":{"dup":{"inputs":["src/Main.elm","src/Main.elm"],"output":"x.js"}}}"#,
        );
        let project = load_project(&path, None).unwrap();
        assert!(matches!(project.elm_json_errors[0].error, ConfigError::DuplicateInputs { .. }));
    }

    #[test]
    fn test_enabled_filter_disables_rest() {
        let temp = project_dir();
        let path = config(
            temp.path(),
            r#"{"targets":{
                "a":{"inputs":["src/Main.elm"],"output":"a.js"},
                "b":{"inputs":["src/Admin.elm"],"output":"b.js"}
            }}"#,
        );
        let enabled: FxHashSet<String> = ["a".to_string()].into_iter().collect();
        let project = load_project(&path, Some(&enabled)).unwrap();
        assert_eq!(project.enabled_originals(), ["a.js"]);
        assert!(project.disabled_outputs.contains("b.js"));
    }

    #[test]
    fn test_port_from_config() {
        let temp = project_dir();
        let path = config(
            temp.path(),
            r#"{"port":43210,"targets":{"a":{"inputs":["src/Main.elm"],"output":"a.js"}}}"#,
        );
        let project = load_project(&path, None).unwrap();
        assert_eq!(project.port_from_config, Some(43210));
    }

    #[test]
    fn test_no_elm_json_collected() {
        let temp = TempDir::new().unwrap();
        write(&temp.path().join("src/Main.elm"), "module Main exposing (main)\n");
        let path = config(
            temp.path(),
            r#"{"targets":{"a":{"inputs":["src/Main.elm"],"output":"a.js"}}}"#,
        );
        let project = load_project(&path, None).unwrap();
        assert!(matches!(project.elm_json_errors[0].error, ConfigError::ElmJsonNotFound { .. }));
    }

    #[test]
    fn test_empty_postprocess_is_none() {
        let temp = project_dir();
        let path = config(
            temp.path(),
            r#"{"targets":{"a":{"inputs":["src/Main.elm"],"output":"a.js","postprocess":[]}}}"#,
        );
        let project = load_project(&path, None).unwrap();
        let (_, _, state) = project.outputs().next().unwrap();
        assert!(state.postprocess.is_none());
    }
}
