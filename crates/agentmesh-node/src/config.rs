//! Configuration loading from `~/.agentmesh/config.toml` with defaults.
//!
//! A config file may list other TOML files under `include`; those are loaded
//! and deep-merged first, in order, and the including file overrides them.

use agentmesh_types::MeshConfig;
use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};
use tracing::{info, warn};

/// Maximum include nesting depth.
const MAX_INCLUDE_DEPTH: u32 = 10;

/// Load node configuration from a TOML file, falling back to defaults.
///
/// A missing, unreadable or malformed file is not fatal: the node starts with
/// defaults and a warning. A broken include drops the includes but keeps the
/// root file.
pub fn load_config(path: Option<&Path>) -> MeshConfig {
    let config_path = path
        .map(Path::to_path_buf)
        .unwrap_or_else(default_config_path);

    if !config_path.exists() {
        info!(path = %config_path.display(), "Config file not found, using defaults");
        return MeshConfig::default();
    }

    let contents = match std::fs::read_to_string(&config_path) {
        Ok(contents) => contents,
        Err(e) => {
            warn!(error = %e, path = %config_path.display(), "Failed to read config file, using defaults");
            return MeshConfig::default();
        }
    };
    let mut root: toml::Value = match toml::from_str(&contents) {
        Ok(value) => value,
        Err(e) => {
            warn!(error = %e, path = %config_path.display(), "Failed to parse config, using defaults");
            return MeshConfig::default();
        }
    };

    let config_dir = config_path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .to_path_buf();
    let mut visited = HashSet::new();
    visited.insert(std::fs::canonicalize(&config_path).unwrap_or_else(|_| config_path.clone()));
    if let Err(e) = resolve_includes(&mut root, &config_dir, &mut visited, 0) {
        warn!(error = %e, "Config include resolution failed, using root config only");
    }
    strip_include(&mut root);

    match root.try_into::<MeshConfig>() {
        Ok(config) => {
            info!(path = %config_path.display(), "Loaded configuration");
            config
        }
        Err(e) => {
            warn!(error = %e, path = %config_path.display(), "Failed to deserialize config, using defaults");
            MeshConfig::default()
        }
    }
}

fn strip_include(value: &mut toml::Value) {
    if let toml::Value::Table(tbl) = value {
        tbl.remove("include");
    }
}

/// Replace `root` with its includes merged underneath it.
///
/// Rejects absolute paths, `..` components, paths escaping the config
/// directory, cycles and excessive nesting.
fn resolve_includes(
    root: &mut toml::Value,
    config_dir: &Path,
    visited: &mut HashSet<PathBuf>,
    depth: u32,
) -> Result<(), String> {
    if depth > MAX_INCLUDE_DEPTH {
        return Err(format!("config include depth exceeds {MAX_INCLUDE_DEPTH}"));
    }

    let includes: Vec<String> = match root.get("include") {
        Some(toml::Value::Array(arr)) => arr
            .iter()
            .filter_map(|v| v.as_str().map(String::from))
            .collect(),
        _ => return Ok(()),
    };
    if includes.is_empty() {
        return Ok(());
    }

    let canonical_dir = std::fs::canonicalize(config_dir)
        .map_err(|e| format!("config dir cannot be canonicalized: {e}"))?;
    let mut merged = toml::Value::Table(toml::map::Map::new());

    for include in &includes {
        let include_path = Path::new(include);
        if include_path.is_absolute() {
            return Err(format!("config include rejects absolute path: {include}"));
        }
        if include_path
            .components()
            .any(|c| matches!(c, Component::ParentDir))
        {
            return Err(format!("config include rejects path traversal: {include}"));
        }

        let canonical = std::fs::canonicalize(config_dir.join(include_path))
            .map_err(|e| format!("config include '{include}' cannot be resolved: {e}"))?;
        if !canonical.starts_with(&canonical_dir) {
            return Err(format!("config include '{include}' escapes config directory"));
        }
        if !visited.insert(canonical.clone()) {
            return Err(format!("circular config include: {include}"));
        }

        info!(include = %include, "Loading config include");
        let contents = std::fs::read_to_string(&canonical)
            .map_err(|e| format!("failed to read config include '{include}': {e}"))?;
        let mut value: toml::Value = toml::from_str(&contents)
            .map_err(|e| format!("failed to parse config include '{include}': {e}"))?;

        let include_dir = canonical.parent().unwrap_or(config_dir).to_path_buf();
        resolve_includes(&mut value, &include_dir, visited, depth + 1)?;
        strip_include(&mut value);
        deep_merge_toml(&mut merged, &value);
    }

    let mut own = root.clone();
    strip_include(&mut own);
    deep_merge_toml(&mut merged, &own);
    *root = merged;
    Ok(())
}

/// Deep-merge `overlay` into `base`. Tables merge key by key; anything else
/// is replaced by the overlay.
pub fn deep_merge_toml(base: &mut toml::Value, overlay: &toml::Value) {
    match (base, overlay) {
        (toml::Value::Table(base_tbl), toml::Value::Table(overlay_tbl)) => {
            for (key, overlay_val) in overlay_tbl {
                match base_tbl.get_mut(key) {
                    Some(base_val) => deep_merge_toml(base_val, overlay_val),
                    None => {
                        base_tbl.insert(key.clone(), overlay_val.clone());
                    }
                }
            }
        }
        (base, overlay) => *base = overlay.clone(),
    }
}

/// The agentmesh home directory (`~/.agentmesh`).
pub fn agentmesh_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".agentmesh")
}

pub fn default_config_path() -> PathBuf {
    agentmesh_home().join("config.toml")
}

/// Where the identity seed lives when the config names none.
pub fn default_key_path() -> PathBuf {
    agentmesh_home().join("identity.key")
}
