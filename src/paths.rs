//! Configuration directory discovery.
//!
//! Priority:
//! 1. `NIMBUS_CONFIG_DIR` environment variable
//! 2. The nearest `.nimbus` directory walking up from the working directory
//! 3. `~/.nimbus`

use std::path::{Path, PathBuf};

use crate::error::{NimbusError, Result};

/// Environment variable for config directory override.
pub const ENV_CONFIG_DIR: &str = "NIMBUS_CONFIG_DIR";

/// Environment variable for the bundled scripts directory.
pub const ENV_BUNDLED_SCRIPTS: &str = "NIMBUS_BUNDLED_SCRIPTS";

/// Name of the per-project configuration directory.
pub const CONFIG_DIR_NAME: &str = ".nimbus";

pub const CLUSTERS_FILE: &str = "clusters.yaml";
pub const VARIABLES_FILE: &str = "variables.yaml";

pub fn config_dir() -> Result<PathBuf> {
    if let Ok(dir) = std::env::var(ENV_CONFIG_DIR) {
        let path = expand_path(&dir);
        log::debug!("Using config dir from {}: {}", ENV_CONFIG_DIR, path.display());
        return Ok(path);
    }

    let cwd = std::env::current_dir()?;
    if let Some(found) = find_upwards(&cwd) {
        log::debug!("Using project config dir: {}", found.display());
        return Ok(found);
    }

    let home = dirs::home_dir()
        .ok_or_else(|| NimbusError::Config("Could not determine home directory".into()))?;
    let path = home.join(CONFIG_DIR_NAME);
    log::debug!("Using default config dir: {}", path.display());
    Ok(path)
}

/// Walks up from `start` looking for a `.nimbus` directory.
fn find_upwards(start: &Path) -> Option<PathBuf> {
    start
        .ancestors()
        .map(|dir| dir.join(CONFIG_DIR_NAME))
        .find(|candidate| candidate.is_dir())
}

/// Directory holding the scripts shipped with nimbus.
pub fn bundled_scripts_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(ENV_BUNDLED_SCRIPTS) {
        return expand_path(&dir);
    }
    // Installed layout: <prefix>/bin/nimbus and <prefix>/scripts.
    if let Some(prefix) = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().and_then(Path::parent).map(Path::to_path_buf))
    {
        let installed = prefix.join("scripts");
        if installed.is_dir() {
            return installed;
        }
    }
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("scripts")
}

/// Expands `~` and environment variables in a path.
pub fn expand_path(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::full(path).map_or_else(|_| path.into(), |p| p.into_owned()))
}

/// Resolves `path` against `base` unless it is already absolute.
pub fn resolve_under(base: &Path, path: &str) -> PathBuf {
    let expanded = expand_path(path);
    if expanded.is_absolute() {
        expanded
    } else {
        base.join(expanded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_upwards_locates_nearest_config_dir() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir(root.path().join(CONFIG_DIR_NAME)).unwrap();
        let nested = root.path().join("a").join("b");
        std::fs::create_dir_all(&nested).unwrap();

        assert_eq!(
            find_upwards(&nested).unwrap(),
            root.path().join(CONFIG_DIR_NAME)
        );
    }

    #[test]
    fn test_resolve_under_keeps_absolute_paths() {
        let base = Path::new("/etc/nimbus");
        assert_eq!(resolve_under(base, "/tmp/key"), PathBuf::from("/tmp/key"));
        assert_eq!(
            resolve_under(base, "keys/nimbus.key"),
            PathBuf::from("/etc/nimbus/keys/nimbus.key")
        );
    }
}
