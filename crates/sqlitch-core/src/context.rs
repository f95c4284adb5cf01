//! Per-invocation context shared by every command.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Immutable snapshot of everything a command invocation needs: the project
/// root, the environment, and the global CLI overrides.
///
/// Created once per invocation by the driver and read-only thereafter.
#[derive(Debug, Clone)]
pub struct CoreContext {
    /// Directory containing the plan and script directories.
    pub project_root: PathBuf,
    /// Override for the user-level configuration directory.
    pub config_root: Option<PathBuf>,
    /// Environment snapshot taken at startup.
    pub env: BTreeMap<String, String>,
    /// `--plan-file` override.
    pub plan_file: Option<PathBuf>,
    /// `--engine` override.
    pub engine: Option<String>,
    /// `--target` override.
    pub target: Option<String>,
    /// `--registry` override.
    pub registry: Option<String>,
    /// Count of `--verbose` flags.
    pub verbosity: u8,
    /// `--quiet` flag.
    pub quiet: bool,
    /// `--json` flag.
    pub json: bool,
}

impl CoreContext {
    /// Build a context for `project_root` with an environment snapshot taken
    /// from the current process.
    pub fn new(project_root: impl Into<PathBuf>) -> Self {
        Self::with_env(project_root, std::env::vars().collect())
    }

    /// Build a context with an explicit environment map (tests, embedding).
    pub fn with_env(project_root: impl Into<PathBuf>, env: BTreeMap<String, String>) -> Self {
        Self {
            project_root: project_root.into(),
            config_root: None,
            env,
            plan_file: None,
            engine: None,
            target: None,
            registry: None,
            verbosity: 0,
            quiet: false,
            json: false,
        }
    }

    /// Look up a `SQLITCH_*`/`SQITCH_*` environment pair; the `SQLITCH_`
    /// variant wins. Empty values count as unset.
    pub fn env_pair(&self, suffix: &str) -> Option<&str> {
        env_pair(&self.env, suffix)
    }

    /// Effective plan-file override: the CLI flag, then the
    /// `SQLITCH_PLAN_FILE`/`SQITCH_PLAN_FILE` environment pair.
    pub fn plan_file_override(&self) -> Option<PathBuf> {
        if let Some(path) = &self.plan_file {
            return Some(path.clone());
        }
        self.env_pair("PLAN_FILE").map(PathBuf::from)
    }

    /// Effective target override: the CLI flag, then `SQLITCH_TARGET`.
    pub fn target_override(&self) -> Option<String> {
        if let Some(target) = &self.target {
            return Some(target.clone());
        }
        self.env.get("SQLITCH_TARGET").cloned().filter(|v| !v.is_empty())
    }

    /// Script directory root (`deploy/`, `revert/`, `verify/` live under it).
    pub fn top_dir(&self) -> PathBuf {
        match self.env.get("SQLITCH_TOP_DIR").filter(|v| !v.is_empty()) {
            Some(dir) => {
                let dir = Path::new(dir);
                if dir.is_absolute() {
                    dir.to_path_buf()
                } else {
                    self.project_root.join(dir)
                }
            }
            None => self.project_root.clone(),
        }
    }
}

/// Look up a `SQLITCH_*`/`SQITCH_*` pair in an environment map.
pub fn env_pair<'a>(env: &'a BTreeMap<String, String>, suffix: &str) -> Option<&'a str> {
    for prefix in ["SQLITCH_", "SQITCH_"] {
        if let Some(value) = env.get(&format!("{prefix}{suffix}"))
            && !value.is_empty()
        {
            return Some(value.as_str());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env_of(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn sqlitch_variant_wins_over_sqitch() {
        let ctx = CoreContext::with_env(
            "/tmp/proj",
            env_of(&[
                ("SQITCH_PLAN_FILE", "legacy.plan"),
                ("SQLITCH_PLAN_FILE", "new.plan"),
            ]),
        );
        assert_eq!(ctx.plan_file_override(), Some(PathBuf::from("new.plan")));
    }

    #[test]
    fn empty_env_values_count_as_unset() {
        let ctx = CoreContext::with_env("/tmp/proj", env_of(&[("SQLITCH_PLAN_FILE", "")]));
        assert_eq!(ctx.plan_file_override(), None);
    }

    #[test]
    fn cli_flag_beats_environment() {
        let mut ctx =
            CoreContext::with_env("/tmp/proj", env_of(&[("SQITCH_PLAN_FILE", "env.plan")]));
        ctx.plan_file = Some(PathBuf::from("flag.plan"));
        assert_eq!(ctx.plan_file_override(), Some(PathBuf::from("flag.plan")));
    }

    #[test]
    fn top_dir_joins_relative_paths_to_the_project_root() {
        let ctx = CoreContext::with_env("/tmp/proj", env_of(&[("SQLITCH_TOP_DIR", "db")]));
        assert_eq!(ctx.top_dir(), PathBuf::from("/tmp/proj/db"));

        let ctx = CoreContext::with_env("/tmp/proj", BTreeMap::new());
        assert_eq!(ctx.top_dir(), PathBuf::from("/tmp/proj"));
    }
}
