//! Working-copy configuration: resolves the repo-config key(s) that record
//! where (and in what format) a repository's working copy lives.
//!
//! Two key shapes coexist in the wild: the legacy single-layer
//! `kx.workingcopy = <fmt>:<path>:<layer>`, and the newer
//! `sno.workingcopy.version` / `sno.workingcopy.path` pair. Per design
//! decision: the new key wins whenever present; the legacy key is consulted
//! only when the new key is entirely absent. Fields are never blended across
//! the two shapes.

use git2::{Config, Repository};

use crate::error::{RepoError, Result};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WorkingCopyScheme {
    Gpkg,
    Postgresql,
}

impl WorkingCopyScheme {
    fn parse(s: &str) -> Result<Self> {
        match s {
            "gpkg" => Ok(Self::Gpkg),
            "postgresql" => Ok(Self::Postgresql),
            other => Err(RepoError::Message(format!(
                "unrecognized working copy scheme: {other}"
            ))),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkingCopyConfig {
    pub scheme: WorkingCopyScheme,
    pub path: String,
    /// Only populated by the legacy key, which names a single layer.
    pub legacy_layer: Option<String>,
}

const NEW_VERSION_KEY: &str = "sno.workingcopy.version";
const NEW_PATH_KEY: &str = "sno.workingcopy.path";
const LEGACY_KEY: &str = "kx.workingcopy";

/// Resolve the working copy configuration for `repo`, preferring the new
/// key shape and falling back to the legacy one. Returns `Ok(None)` if
/// neither key is set (i.e. `MissingWorkingCopy` at the call site).
pub fn read_working_copy_config(repo: &Repository) -> Result<Option<WorkingCopyConfig>> {
    let config = repo.config()?;

    if let Some(config) = read_new_key(&config)? {
        return Ok(Some(config));
    }
    read_legacy_key(&config)
}

fn read_new_key(config: &Config) -> Result<Option<WorkingCopyConfig>> {
    let path = match config.get_string(NEW_PATH_KEY) {
        Ok(path) => path,
        Err(err) if err.code() == git2::ErrorCode::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };

    // version is required alongside path, but its value isn't otherwise used:
    // only one schema version has ever existed.
    let _version = config.get_i64(NEW_VERSION_KEY).unwrap_or(1);

    let (scheme_str, rest) = path.split_once("://").ok_or_else(|| {
        RepoError::Message(format!("malformed {NEW_PATH_KEY} value: {path}"))
    })?;
    let scheme = WorkingCopyScheme::parse(scheme_str)?;

    Ok(Some(WorkingCopyConfig {
        scheme,
        path: rest.to_string(),
        legacy_layer: None,
    }))
}

fn read_legacy_key(config: &Config) -> Result<Option<WorkingCopyConfig>> {
    let value = match config.get_string(LEGACY_KEY) {
        Ok(value) => value,
        Err(err) if err.code() == git2::ErrorCode::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };

    let mut parts = value.splitn(3, ':');
    let fmt = parts
        .next()
        .ok_or_else(|| RepoError::Message(format!("malformed {LEGACY_KEY} value: {value}")))?;
    let path = parts
        .next()
        .ok_or_else(|| RepoError::Message(format!("malformed {LEGACY_KEY} value: {value}")))?;
    let layer = parts.next();

    let scheme = WorkingCopyScheme::parse(&fmt.to_ascii_lowercase())?;

    Ok(Some(WorkingCopyConfig {
        scheme,
        path: path.to_string(),
        legacy_layer: layer.map(str::to_string),
    }))
}

/// Write the new-style working copy key pair, the only shape this crate
/// writes going forward (`workingcopy-set-path` CLI verb).
pub fn write_working_copy_config(repo: &Repository, scheme: &str, path: &str) -> Result<()> {
    let mut config = repo.config()?;
    config.set_i64(NEW_VERSION_KEY, 1)?;
    config.set_str(NEW_PATH_KEY, &format!("{scheme}://{path}"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use git2::Repository;
    use tempfile::tempdir;

    fn init_repo() -> (tempfile::TempDir, Repository) {
        let dir = tempdir().unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        (dir, repo)
    }

    #[test]
    fn new_key_takes_precedence_over_legacy() {
        let (_dir, repo) = init_repo();
        {
            let mut config = repo.config().unwrap();
            config.set_str("kx.workingcopy", "GPKG:legacy.gpkg:points").unwrap();
            config.set_i64("sno.workingcopy.version", 1).unwrap();
            config
                .set_str("sno.workingcopy.path", "gpkg://new.gpkg")
                .unwrap();
        }

        let resolved = read_working_copy_config(&repo).unwrap().unwrap();
        assert_eq!(resolved.scheme, WorkingCopyScheme::Gpkg);
        assert_eq!(resolved.path, "new.gpkg");
        assert_eq!(resolved.legacy_layer, None);
    }

    #[test]
    fn falls_back_to_legacy_key_when_new_key_absent() {
        let (_dir, repo) = init_repo();
        {
            let mut config = repo.config().unwrap();
            config
                .set_str("kx.workingcopy", "GPKG:legacy.gpkg:points")
                .unwrap();
        }

        let resolved = read_working_copy_config(&repo).unwrap().unwrap();
        assert_eq!(resolved.path, "legacy.gpkg");
        assert_eq!(resolved.legacy_layer.as_deref(), Some("points"));
    }

    #[test]
    fn missing_working_copy_config_is_none() {
        let (_dir, repo) = init_repo();
        assert!(read_working_copy_config(&repo).unwrap().is_none());
    }
}
