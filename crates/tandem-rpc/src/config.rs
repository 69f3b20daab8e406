//! Configuration loading from `~/.tandem/config.toml` with defaults.
//!
//! Supports config includes: the `include` field lists additional TOML files
//! to load and deep-merge before the root config (root overrides includes).
//! `TANDEM_WORKER_ID` and `TANDEM_WORKER_NAME` override the file, since a
//! worker's rank is usually assigned by whatever launched it.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tandem_types::config::RpcConfig;
use tracing::{info, warn};

/// Maximum include nesting depth.
const MAX_INCLUDE_DEPTH: u32 = 10;

pub const ENV_WORKER_ID: &str = "TANDEM_WORKER_ID";
pub const ENV_WORKER_NAME: &str = "TANDEM_WORKER_NAME";

/// Load worker configuration from a TOML file, with defaults and
/// environment overrides.
pub fn load_config(path: Option<&Path>) -> RpcConfig {
    let mut config = load_file(path);
    apply_overrides(&mut config, |key| std::env::var(key).ok());
    config
}

fn load_file(path: Option<&Path>) -> RpcConfig {
    let config_path = path
        .map(|p| p.to_path_buf())
        .unwrap_or_else(default_config_path);

    if !config_path.exists() {
        info!(
            path = %config_path.display(),
            "Config file not found, using defaults"
        );
        return RpcConfig::default();
    }

    let contents = match std::fs::read_to_string(&config_path) {
        Ok(contents) => contents,
        Err(e) => {
            warn!(
                error = %e,
                path = %config_path.display(),
                "Failed to read config file, using defaults"
            );
            return RpcConfig::default();
        }
    };
    let mut root_value = match toml::from_str::<toml::Value>(&contents) {
        Ok(v) => v,
        Err(e) => {
            warn!(
                error = %e,
                path = %config_path.display(),
                "Failed to parse config, using defaults"
            );
            return RpcConfig::default();
        }
    };

    let config_dir = config_path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .to_path_buf();
    let mut visited = HashSet::new();
    visited.insert(std::fs::canonicalize(&config_path).unwrap_or_else(|_| config_path.clone()));

    if let Err(e) = resolve_config_includes(&mut root_value, &config_dir, &mut visited, 0) {
        warn!(
            error = %e,
            "Config include resolution failed, using root config only"
        );
    }
    if let toml::Value::Table(ref mut tbl) = root_value {
        tbl.remove("include");
    }

    match root_value.try_into::<RpcConfig>() {
        Ok(config) => {
            info!(path = %config_path.display(), "Loaded configuration");
            config
        }
        Err(e) => {
            warn!(
                error = %e,
                path = %config_path.display(),
                "Failed to deserialize merged config, using defaults"
            );
            RpcConfig::default()
        }
    }
}

/// Apply `TANDEM_WORKER_ID` / `TANDEM_WORKER_NAME` style overrides read
/// through `lookup`. An unparsable id is ignored with a warning.
pub fn apply_overrides<F>(config: &mut RpcConfig, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(raw) = lookup(ENV_WORKER_ID) {
        match raw.trim().parse::<u16>() {
            Ok(id) => config.worker_id = id,
            Err(e) => warn!(value = %raw, error = %e, "Ignoring invalid {ENV_WORKER_ID}"),
        }
    }
    if let Some(name) = lookup(ENV_WORKER_NAME) {
        if !name.is_empty() {
            config.worker_name = name;
        }
    }
}

/// Resolve config includes by deep-merging included files into the root value.
///
/// Rejects absolute paths, `..` components, and circular references.
fn resolve_config_includes(
    root_value: &mut toml::Value,
    config_dir: &Path,
    visited: &mut HashSet<PathBuf>,
    depth: u32,
) -> Result<(), String> {
    if depth > MAX_INCLUDE_DEPTH {
        return Err(format!(
            "Config include depth exceeded maximum of {MAX_INCLUDE_DEPTH}"
        ));
    }

    let includes = match root_value {
        toml::Value::Table(tbl) => match tbl.get("include") {
            Some(toml::Value::Array(arr)) => arr
                .iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect::<Vec<_>>(),
            _ => return Ok(()),
        },
        _ => return Ok(()),
    };
    if includes.is_empty() {
        return Ok(());
    }

    // Later includes override earlier ones; the root overrides everything.
    let mut merged_base = toml::Value::Table(toml::map::Map::new());

    for include_path_str in &includes {
        let include_path = Path::new(include_path_str);
        if include_path.is_absolute() {
            return Err(format!(
                "Config include rejects absolute path: {include_path_str}"
            ));
        }
        if include_path
            .components()
            .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            return Err(format!(
                "Config include rejects path traversal: {include_path_str}"
            ));
        }

        let canonical = std::fs::canonicalize(config_dir.join(include_path))
            .map_err(|e| format!("Config include '{include_path_str}' cannot be resolved: {e}"))?;
        if !visited.insert(canonical.clone()) {
            return Err(format!(
                "Circular config include detected: {include_path_str}"
            ));
        }

        info!(include = %include_path_str, "Loading config include");

        let contents = std::fs::read_to_string(&canonical)
            .map_err(|e| format!("Failed to read config include '{include_path_str}': {e}"))?;
        let mut include_value: toml::Value = toml::from_str(&contents)
            .map_err(|e| format!("Failed to parse config include '{include_path_str}': {e}"))?;

        let include_dir = canonical.parent().unwrap_or(config_dir).to_path_buf();
        resolve_config_includes(&mut include_value, &include_dir, visited, depth + 1)?;
        if let toml::Value::Table(ref mut tbl) = include_value {
            tbl.remove("include");
        }
        deep_merge_toml(&mut merged_base, &include_value);
    }

    let mut root_without_include = root_value.clone();
    if let toml::Value::Table(ref mut tbl) = root_without_include {
        tbl.remove("include");
    }
    deep_merge_toml(&mut merged_base, &root_without_include);
    *root_value = merged_base;

    Ok(())
}

/// Deep-merge two TOML values. `overlay` values override `base` values.
/// Tables merge recursively; arrays and scalars are replaced wholesale.
pub fn deep_merge_toml(base: &mut toml::Value, overlay: &toml::Value) {
    match (base, overlay) {
        (toml::Value::Table(base_tbl), toml::Value::Table(overlay_tbl)) => {
            for (key, overlay_val) in overlay_tbl {
                if let Some(base_val) = base_tbl.get_mut(key) {
                    deep_merge_toml(base_val, overlay_val);
                } else {
                    base_tbl.insert(key.clone(), overlay_val.clone());
                }
            }
        }
        (base, overlay) => {
            *base = overlay.clone();
        }
    }
}

/// Get the default tandem home directory.
pub fn tandem_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".tandem")
}

/// Get the default config file path.
pub fn default_config_path() -> PathBuf {
    tandem_home().join("config.toml")
}
