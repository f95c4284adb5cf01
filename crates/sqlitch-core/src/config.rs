//! Configuration loading and resolution.
//!
//! Configuration is a three-scope hierarchy of Git-style INI files, lowest
//! to highest precedence: **system**, **user**, **local**. Later scopes
//! override earlier ones at the (section, key) granularity; arrays are not
//! supported. Each scope directory may carry either the preferred
//! `sqitch.conf` or the drop-in `sqlitch.conf` (both at once is an error).
//!
//! Scope directories resolve from the environment first, with the
//! `SQLITCH_*` variant of each pair winning over `SQITCH_*`:
//!
//! - system: `SQLITCH_SYSTEM_CONFIG` > `SQITCH_SYSTEM_CONFIG` >
//!   `/etc/sqlitch` if present > `/etc/sqitch` if present > `/etc/sqlitch`
//! - user: `SQLITCH_USER_CONFIG` > `SQITCH_USER_CONFIG` >
//!   `SQLITCH_CONFIG_ROOT` > `SQITCH_CONFIG_ROOT` >
//!   `XDG_CONFIG_HOME/sqlitch` > `$HOME/.sqitch`
//! - local: `SQLITCH_CONFIG` > `SQITCH_CONFIG` > project root

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::context::env_pair;
use crate::engine::{canonicalize_engine_name, derive_sqlite_registry_uri};
use crate::error::SqlitchError;

/// Section name → key → value. `BTreeMap` keeps file writes deterministic.
pub type Settings = BTreeMap<String, BTreeMap<String, String>>;

/// Configuration scope, ordered lowest to highest precedence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConfigScope {
    System,
    User,
    Local,
}

impl ConfigScope {
    pub const ALL: [ConfigScope; 3] = [Self::System, Self::User, Self::Local];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Local => "local",
        }
    }
}

/// The loaded configuration: per-scope layers plus the merged view.
#[derive(Debug, Clone, Default)]
pub struct ConfigProfile {
    /// Project root the local scope was resolved against.
    pub root_dir: PathBuf,
    /// Directory per scope, whether or not a file was found there.
    pub scope_dirs: BTreeMap<ConfigScope, PathBuf>,
    /// Config file actually loaded per scope.
    pub files: BTreeMap<ConfigScope, PathBuf>,
    /// Parsed settings per scope.
    pub layers: BTreeMap<ConfigScope, Settings>,
    /// Merged view; later scopes override earlier ones per (section, key).
    pub settings: Settings,
}

impl ConfigProfile {
    /// Merged lookup.
    pub fn get(&self, section: &str, key: &str) -> Option<&str> {
        self.settings
            .get(section)
            .and_then(|options| options.get(key))
            .map(String::as_str)
    }

    /// Lookup within a single scope's layer.
    pub fn get_in_scope(&self, scope: ConfigScope, section: &str, key: &str) -> Option<&str> {
        self.layers
            .get(&scope)
            .and_then(|settings| settings.get(section))
            .and_then(|options| options.get(key))
            .map(String::as_str)
    }

    /// Engine selected by `core.engine`, if any.
    pub fn active_engine(&self) -> Option<&str> {
        self.get("core", "engine")
    }

    /// The URI configured for a named target section.
    pub fn target_uri(&self, name: &str) -> Option<&str> {
        self.get(&format!("target \"{name}\""), "uri")
    }

    /// The registry override configured for a named target section.
    pub fn target_registry(&self, name: &str) -> Option<&str> {
        self.get(&format!("target \"{name}\""), "registry")
    }
}

/// Parse a Git-style boolean (`true|false|yes|no|on|off|1|0`).
pub fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Some(true),
        "false" | "no" | "off" | "0" => Some(false),
        _ => None,
    }
}

/// Parse INI text into [`Settings`].
///
/// Accepts `[section]` and `[section "subsection"]` headers, `key = value`
/// entries with tab or space indentation, and `;`/`#` comments. Keys are
/// case-sensitive and preserved as written. No interpolation.
pub fn parse_config(text: &str, path: &Path) -> Result<Settings> {
    let mut settings = Settings::new();
    let mut current: Option<String> = None;

    for (idx, raw_line) in text.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw_line.trim();

        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }

        if let Some(rest) = line.strip_prefix('[') {
            let Some(header) = rest.strip_suffix(']') else {
                return Err(parse_error(path, line_no, "unterminated section header"));
            };
            let section = parse_section_header(header)
                .ok_or_else(|| parse_error(path, line_no, "malformed section header"))?;
            settings.entry(section.clone()).or_default();
            current = Some(section);
            continue;
        }

        let Some(section) = current.clone() else {
            return Err(parse_error(path, line_no, "option outside of any section"));
        };

        let (key, value) = match line.split_once('=') {
            Some((key, value)) => {
                let key = key.trim();
                if key.is_empty() {
                    return Err(parse_error(path, line_no, "empty option name"));
                }
                (key.to_string(), parse_value(value))
            }
            // Bare key: Git-style implicit boolean.
            None => (line.to_string(), "true".to_string()),
        };

        if key.contains(char::is_whitespace) {
            return Err(parse_error(path, line_no, "whitespace in option name"));
        }

        settings.entry(section).or_default().insert(key, value);
    }

    Ok(settings)
}

fn parse_error(path: &Path, line: usize, message: &str) -> anyhow::Error {
    SqlitchError::Config(format!("{}:{}: {}", path.display(), line, message)).into()
}

/// `section` or `section "subsection"` → canonical internal section key.
fn parse_section_header(header: &str) -> Option<String> {
    let header = header.trim();
    if header.is_empty() {
        return None;
    }
    match header.split_once(char::is_whitespace) {
        None => Some(header.to_string()),
        Some((name, rest)) => {
            let rest = rest.trim();
            let sub = rest.strip_prefix('"')?.strip_suffix('"')?;
            Some(format!("{name} \"{sub}\""))
        }
    }
}

/// Trim a raw value, honoring double quotes and stripping trailing comments
/// from unquoted values.
fn parse_value(raw: &str) -> String {
    let trimmed = raw.trim();
    if let Some(rest) = trimmed.strip_prefix('"') {
        let mut out = String::new();
        let mut escaped = false;
        for ch in rest.chars() {
            if escaped {
                out.push(ch);
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                break;
            } else {
                out.push(ch);
            }
        }
        return out;
    }
    match trimmed.find([';', '#']) {
        Some(pos) => trimmed[..pos].trim_end().to_string(),
        None => trimmed.to_string(),
    }
}

/// Directories to search per scope.
#[derive(Debug, Clone)]
pub struct ScopeDirs {
    pub system: PathBuf,
    pub user: PathBuf,
    pub local: PathBuf,
}

/// Load and merge the configuration files found under `scope_dirs`.
///
/// A scope entry that names a file directly (rather than a directory) is
/// read as-is; directories go through preferred/drop-in resolution.
pub fn load_config(root_dir: &Path, scope_dirs: &ScopeDirs) -> Result<ConfigProfile> {
    let mut profile = ConfigProfile {
        root_dir: root_dir.to_path_buf(),
        ..ConfigProfile::default()
    };
    profile
        .scope_dirs
        .insert(ConfigScope::System, scope_dirs.system.clone());
    profile
        .scope_dirs
        .insert(ConfigScope::User, scope_dirs.user.clone());
    profile
        .scope_dirs
        .insert(ConfigScope::Local, scope_dirs.local.clone());

    for scope in ConfigScope::ALL {
        let dir = &profile.scope_dirs[&scope];
        let file = if dir.is_file() {
            Some(dir.clone())
        } else {
            sqlitch_fsutil::resolve_config_file(dir)
                .map_err(SqlitchError::ArtifactConflict)?
                .path
        };

        let Some(file) = file else {
            continue;
        };
        let text = std::fs::read_to_string(&file)
            .with_context(|| format!("failed to read config file {}", file.display()))?;
        let layer = parse_config(&text, &file)?;

        for (section, options) in &layer {
            let merged = profile.settings.entry(section.clone()).or_default();
            for (key, value) in options {
                merged.insert(key.clone(), value.clone());
            }
        }
        profile.files.insert(scope, file);
        profile.layers.insert(scope, layer);
    }

    Ok(profile)
}

/// Parameters for [`resolve_config`].
#[derive(Debug, Clone, Default)]
pub struct ConfigResolveParams {
    pub config_root: Option<PathBuf>,
    pub home: Option<PathBuf>,
    pub system_path: Option<PathBuf>,
}

/// Resolve scope directories from the environment and load a profile.
pub fn resolve_config(
    root_dir: &Path,
    env: &BTreeMap<String, String>,
    params: &ConfigResolveParams,
) -> Result<ConfigProfile> {
    let user = resolve_user_scope_root(env, params);
    let system = determine_system_root(env, params.system_path.as_deref());
    let local = env_pair(env, "CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|| root_dir.to_path_buf());

    load_config(
        root_dir,
        &ScopeDirs {
            system,
            user,
            local,
        },
    )
}

/// Directory containing user-level configuration files.
///
/// Always falls back to `$HOME/.sqitch` for Sqitch compatibility; the
/// `~/.config/sqlitch` form is used only when `XDG_CONFIG_HOME` is set.
pub fn determine_config_root(env: &BTreeMap<String, String>, home: Option<&Path>) -> PathBuf {
    if let Some(root) = env_pair(env, "CONFIG_ROOT") {
        return PathBuf::from(root);
    }
    if let Some(xdg) = env.get("XDG_CONFIG_HOME").filter(|v| !v.is_empty()) {
        return Path::new(xdg).join("sqlitch");
    }
    let home = home
        .map(Path::to_path_buf)
        .or_else(|| env.get("HOME").filter(|v| !v.is_empty()).map(PathBuf::from))
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."));
    home.join(".sqitch")
}

fn resolve_user_scope_root(
    env: &BTreeMap<String, String>,
    params: &ConfigResolveParams,
) -> PathBuf {
    if let Some(dir) = env_pair(env, "USER_CONFIG") {
        return PathBuf::from(dir);
    }
    if let Some(dir) = &params.config_root {
        return dir.clone();
    }
    determine_config_root(env, params.home.as_deref())
}

const DEFAULT_SYSTEM_PATH: &str = "/etc/sqlitch";
const FALLBACK_SYSTEM_PATH: &str = "/etc/sqitch";

fn determine_system_root(env: &BTreeMap<String, String>, system_path: Option<&Path>) -> PathBuf {
    if let Some(path) = system_path {
        return path.to_path_buf();
    }
    if let Some(dir) = env_pair(env, "SYSTEM_CONFIG") {
        return PathBuf::from(dir);
    }
    if Path::new(DEFAULT_SYSTEM_PATH).exists() {
        return PathBuf::from(DEFAULT_SYSTEM_PATH);
    }
    if Path::new(FALLBACK_SYSTEM_PATH).exists() {
        return PathBuf::from(FALLBACK_SYSTEM_PATH);
    }
    PathBuf::from(DEFAULT_SYSTEM_PATH)
}

/// Canonical registry URI for an engine target.
///
/// SQLite registries live in a sibling `sqitch.db` in the project root
/// unless overridden; other engines share the workspace URI. Overrides are
/// returned verbatim.
pub fn resolve_registry_uri(
    engine: &str,
    workspace_uri: &str,
    project_root: &Path,
    registry_override: Option<&str>,
) -> Result<String> {
    let canonical = canonicalize_engine_name(engine)?;
    if canonical == "sqlite" {
        return Ok(derive_sqlite_registry_uri(project_root, registry_override));
    }
    if let Some(override_uri) = registry_override.filter(|v| !v.is_empty()) {
        return Ok(override_uri.to_string());
    }
    Ok(workspace_uri.to_string())
}

/// Where a credential value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialSource {
    Cli,
    Env,
    Config,
    Unset,
}

impl CredentialSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cli => "cli",
            Self::Env => "env",
            Self::Config => "config",
            Self::Unset => "unset",
        }
    }
}

/// Credential values supplied directly via CLI flags.
#[derive(Debug, Clone, Default)]
pub struct CredentialOverrides {
    pub username: Option<String>,
    pub password: Option<String>,
}

/// Resolved credential values alongside their originating sources.
#[derive(Debug, Clone)]
pub struct CredentialResolution {
    pub username: Option<String>,
    pub password: Option<String>,
    pub username_source: CredentialSource,
    pub password_source: CredentialSource,
}

const ENV_PREFIXES: [&str; 2] = ["SQLITCH", "SQITCH"];
const USERNAME_ENV_ALIASES: [&str; 2] = ["USERNAME", "USER"];
const PASSWORD_ENV_ALIASES: [&str; 3] = ["PASSWORD", "PASS", "PWD"];
const USERNAME_CONFIG_ALIASES: [&str; 2] = ["username", "user"];
const PASSWORD_CONFIG_ALIASES: [&str; 2] = ["password", "pass"];

/// Resolve credentials for a target: CLI flags, then environment (with and
/// without the target fragment), then config sections `target "<name>"`,
/// `engine "<active>"`, `core`.
pub fn resolve_credentials(
    target: Option<&str>,
    profile: Option<&ConfigProfile>,
    env: &BTreeMap<String, String>,
    overrides: &CredentialOverrides,
) -> CredentialResolution {
    let (username, username_source) = resolve_credential_field(
        overrides.username.as_deref(),
        &USERNAME_ENV_ALIASES,
        &USERNAME_CONFIG_ALIASES,
        target,
        profile,
        env,
    );
    let (password, password_source) = resolve_credential_field(
        overrides.password.as_deref(),
        &PASSWORD_ENV_ALIASES,
        &PASSWORD_CONFIG_ALIASES,
        target,
        profile,
        env,
    );
    CredentialResolution {
        username,
        password,
        username_source,
        password_source,
    }
}

fn resolve_credential_field(
    cli_value: Option<&str>,
    env_aliases: &[&str],
    config_aliases: &[&str],
    target: Option<&str>,
    profile: Option<&ConfigProfile>,
    env: &BTreeMap<String, String>,
) -> (Option<String>, CredentialSource) {
    if let Some(value) = cli_value {
        return (Some(value.to_string()), CredentialSource::Cli);
    }

    let target_fragment = target.map(normalize_env_identifier);
    for prefix in ENV_PREFIXES {
        if let Some(fragment) = &target_fragment {
            for alias in env_aliases {
                if let Some(value) = env.get(&format!("{prefix}_{fragment}_{alias}")) {
                    return (Some(value.clone()), CredentialSource::Env);
                }
            }
        }
        for alias in env_aliases {
            if let Some(value) = env.get(&format!("{prefix}_{alias}")) {
                return (Some(value.clone()), CredentialSource::Env);
            }
        }
    }

    if let Some(profile) = profile {
        let mut sections: Vec<String> = Vec::new();
        if let Some(target) = target {
            sections.push(format!("target \"{target}\""));
        }
        if let Some(engine) = profile.active_engine() {
            sections.push(format!("engine \"{engine}\""));
        }
        sections.push("core".to_string());

        for section in &sections {
            for alias in config_aliases {
                if let Some(value) = profile.get(section, alias) {
                    return (Some(value.to_string()), CredentialSource::Config);
                }
            }
        }
    }

    (None, CredentialSource::Unset)
}

fn normalize_env_identifier(value: &str) -> String {
    value
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

/// Split a dotted config key (`core.engine`, `engine.sqlite.client`) into
/// the internal section key and the option name.
pub fn split_config_key(key: &str) -> Result<(String, String)> {
    let parts: Vec<&str> = key.split('.').collect();
    if parts.len() < 2 || parts.iter().any(|p| p.is_empty()) {
        return Err(SqlitchError::Usage(format!("Invalid config key: {key}")).into());
    }
    let option = parts[parts.len() - 1].to_string();
    let section = if parts.len() == 2 {
        parts[0].to_string()
    } else {
        format!("{} \"{}\"", parts[0], parts[1..parts.len() - 1].join("."))
    };
    Ok((section, option))
}

/// Render [`Settings`] in Git-config style with tab-indented options.
pub fn format_settings(settings: &Settings) -> String {
    let mut out = String::new();
    let mut first = true;
    for (section, options) in settings {
        if options.is_empty() {
            continue;
        }
        if !first {
            out.push('\n');
        }
        first = false;
        out.push_str(&format_section_header(section));
        out.push('\n');
        for (key, value) in options {
            out.push('\t');
            out.push_str(key);
            out.push_str(" = ");
            out.push_str(&format_value(value));
            out.push('\n');
        }
    }
    out
}

fn format_section_header(section: &str) -> String {
    format!("[{section}]")
}

fn format_value(value: &str) -> String {
    let needs_quoting = value.starts_with(char::is_whitespace)
        || value.ends_with(char::is_whitespace)
        || value.contains('#')
        || value.contains(';');
    if needs_quoting {
        format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
    } else {
        value.to_string()
    }
}

/// Load `path` (tolerating absence), apply `mutate`, and rewrite atomically.
fn rewrite_config_file(path: &Path, mutate: impl FnOnce(&mut Settings)) -> Result<()> {
    let mut settings = if path.exists() {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        parse_config(&text, path)?
    } else {
        Settings::new()
    };
    mutate(&mut settings);
    sqlitch_fsutil::atomic_write(path, format_settings(&settings).as_bytes())
}

/// Set `section.key = value` in the file at `path`, creating it if needed.
pub fn set_config_value(path: &Path, section: &str, key: &str, value: &str) -> Result<()> {
    rewrite_config_file(path, |settings| {
        settings
            .entry(section.to_string())
            .or_default()
            .insert(key.to_string(), value.to_string());
    })
}

/// Remove `section.key` from the file at `path`. Empty sections are dropped.
pub fn unset_config_value(path: &Path, section: &str, key: &str) -> Result<()> {
    rewrite_config_file(path, |settings| {
        if let Some(options) = settings.get_mut(section) {
            options.remove(key);
            if options.is_empty() {
                settings.remove(section);
            }
        }
    })
}

/// Remove an entire section from the file at `path`.
pub fn remove_config_section(path: &Path, section: &str) -> Result<()> {
    rewrite_config_file(path, |settings| {
        settings.remove(section);
    })
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::tempdir;

    use super::*;

    fn env_of(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn parses_sections_subsections_and_comments() {
        let text = "\
; leading comment
[core]
\tengine = sqlite
    top_dir = db ; trailing comment

[engine \"sqlite\"]
\tclient = sqlite3
\tregistry = sqitch
";
        let settings = parse_config(text, Path::new("sqitch.conf")).expect("parse");
        assert_eq!(settings["core"]["engine"], "sqlite");
        assert_eq!(settings["core"]["top_dir"], "db");
        assert_eq!(settings["engine \"sqlite\""]["client"], "sqlite3");
    }

    #[test]
    fn quoted_values_preserve_whitespace_and_comment_chars() {
        let text = "[user]\n\tname = \"Ada Lovelace ; #1\"\n";
        let settings = parse_config(text, Path::new("x.conf")).expect("parse");
        assert_eq!(settings["user"]["name"], "Ada Lovelace ; #1");
    }

    #[test]
    fn malformed_lines_report_file_and_line() {
        let err = parse_config("[core\nengine = sqlite\n", Path::new("bad.conf"))
            .expect_err("unterminated header");
        assert!(err.to_string().contains("bad.conf:1"));

        let err = parse_config("engine = sqlite\n", Path::new("bad.conf"))
            .expect_err("option outside section");
        assert!(err.to_string().contains("bad.conf:1"));
    }

    #[test]
    fn booleans_parse_git_style() {
        for v in ["true", "yes", "on", "1"] {
            assert_eq!(parse_bool(v), Some(true));
        }
        for v in ["false", "no", "off", "0"] {
            assert_eq!(parse_bool(v), Some(false));
        }
        assert_eq!(parse_bool("maybe"), None);
    }

    fn write_scoped(dir: &Path, engine: &str) {
        fs::create_dir_all(dir).expect("mkdir");
        fs::write(
            dir.join("sqitch.conf"),
            format!("[core]\n\tengine = {engine}\n"),
        )
        .expect("write");
    }

    #[test]
    fn local_overrides_user_overrides_system() {
        let td = tempdir().expect("tempdir");
        let system = td.path().join("system");
        let user = td.path().join("user");
        let local = td.path().join("local");
        write_scoped(&system, "pg");
        write_scoped(&user, "mysql");
        write_scoped(&local, "sqlite");

        let dirs = ScopeDirs {
            system: system.clone(),
            user: user.clone(),
            local: local.clone(),
        };
        let profile = load_config(&local, &dirs).expect("load");
        assert_eq!(profile.active_engine(), Some("sqlite"));

        // Removing local falls through to user; removing user falls through
        // to system.
        fs::remove_file(local.join("sqitch.conf")).expect("rm");
        let profile = load_config(&local, &dirs).expect("load");
        assert_eq!(profile.active_engine(), Some("mysql"));

        fs::remove_file(user.join("sqitch.conf")).expect("rm");
        let profile = load_config(&local, &dirs).expect("load");
        assert_eq!(profile.active_engine(), Some("pg"));
    }

    #[test]
    fn drop_in_config_is_honored_when_alone_and_conflicts_when_paired() {
        let td = tempdir().expect("tempdir");
        fs::write(td.path().join("sqlitch.conf"), "[core]\n\tengine = sqlite\n")
            .expect("write");

        let dirs = ScopeDirs {
            system: td.path().join("none-a"),
            user: td.path().join("none-b"),
            local: td.path().to_path_buf(),
        };
        let profile = load_config(td.path(), &dirs).expect("load");
        assert_eq!(profile.active_engine(), Some("sqlite"));

        fs::write(td.path().join("sqitch.conf"), "[core]\n\tengine = pg\n").expect("write");
        let err = load_config(td.path(), &dirs).expect_err("conflict");
        assert!(err.to_string().contains("sqitch.conf"));
        assert!(err.to_string().contains("sqlitch.conf"));
    }

    #[test]
    fn user_scope_resolution_order() {
        let env = env_of(&[("SQLITCH_USER_CONFIG", "/custom/user")]);
        let params = ConfigResolveParams::default();
        assert_eq!(
            resolve_user_scope_root(&env, &params),
            PathBuf::from("/custom/user")
        );

        let env = env_of(&[("SQITCH_CONFIG_ROOT", "/legacy/root")]);
        assert_eq!(
            resolve_user_scope_root(&env, &params),
            PathBuf::from("/legacy/root")
        );

        let env = env_of(&[("XDG_CONFIG_HOME", "/xdg")]);
        assert_eq!(
            resolve_user_scope_root(&env, &params),
            PathBuf::from("/xdg/sqlitch")
        );

        let env = env_of(&[("HOME", "/home/ada")]);
        assert_eq!(
            resolve_user_scope_root(&env, &params),
            PathBuf::from("/home/ada/.sqitch")
        );
    }

    #[test]
    fn registry_uri_defaults_to_sibling_sqitch_db_for_sqlite() {
        let uri = resolve_registry_uri(
            "sqlite",
            "db:sqlite:flipr.db",
            Path::new("/proj"),
            None,
        )
        .expect("registry uri");
        assert_eq!(uri, "db:sqlite:/proj/sqitch.db");

        let uri = resolve_registry_uri(
            "sqlite",
            "db:sqlite:flipr.db",
            Path::new("/proj"),
            Some("db:sqlite:/elsewhere/meta.db"),
        )
        .expect("registry uri");
        assert_eq!(uri, "db:sqlite:/elsewhere/meta.db");
    }

    #[test]
    fn registry_uri_for_other_engines_is_workspace_unless_overridden() {
        let uri = resolve_registry_uri("postgres", "db:pg://host/app", Path::new("/p"), None)
            .expect("registry uri");
        assert_eq!(uri, "db:pg://host/app");

        let uri = resolve_registry_uri(
            "pg",
            "db:pg://host/app",
            Path::new("/p"),
            Some("db:pg://host/meta"),
        )
        .expect("registry uri");
        assert_eq!(uri, "db:pg://host/meta");
    }

    #[test]
    fn credentials_prefer_cli_then_env_then_config() {
        let mut profile = ConfigProfile::default();
        profile.settings.insert(
            "target \"prod\"".to_string(),
            BTreeMap::from([("username".to_string(), "cfg-user".to_string())]),
        );

        let env = env_of(&[("SQLITCH_PROD_USERNAME", "env-user")]);

        let res = resolve_credentials(
            Some("prod"),
            Some(&profile),
            &env,
            &CredentialOverrides {
                username: Some("cli-user".into()),
                password: None,
            },
        );
        assert_eq!(res.username.as_deref(), Some("cli-user"));
        assert_eq!(res.username_source, CredentialSource::Cli);

        let res = resolve_credentials(
            Some("prod"),
            Some(&profile),
            &env,
            &CredentialOverrides::default(),
        );
        assert_eq!(res.username.as_deref(), Some("env-user"));
        assert_eq!(res.username_source, CredentialSource::Env);

        let res = resolve_credentials(
            Some("prod"),
            Some(&profile),
            &BTreeMap::new(),
            &CredentialOverrides::default(),
        );
        assert_eq!(res.username.as_deref(), Some("cfg-user"));
        assert_eq!(res.username_source, CredentialSource::Config);
        assert_eq!(res.password, None);
        assert_eq!(res.password_source, CredentialSource::Unset);
    }

    #[test]
    fn target_fragment_env_beats_bare_env() {
        let env = env_of(&[
            ("SQLITCH_PASSWORD", "generic"),
            ("SQLITCH_PROD_DB_PASSWORD", "specific"),
        ]);
        let res = resolve_credentials(
            Some("prod-db"),
            None,
            &env,
            &CredentialOverrides::default(),
        );
        assert_eq!(res.password.as_deref(), Some("specific"));
    }

    #[test]
    fn split_config_key_handles_subsections() {
        assert_eq!(
            split_config_key("core.engine").expect("split"),
            ("core".to_string(), "engine".to_string())
        );
        assert_eq!(
            split_config_key("engine.sqlite.client").expect("split"),
            ("engine \"sqlite\"".to_string(), "client".to_string())
        );
        assert!(split_config_key("nodots").is_err());
    }

    #[test]
    fn set_and_unset_round_trip_through_the_writer() {
        let td = tempdir().expect("tempdir");
        let path = td.path().join("sqitch.conf");

        set_config_value(&path, "core", "engine", "sqlite").expect("set");
        set_config_value(&path, "engine \"sqlite\"", "client", "sqlite3").expect("set");

        let text = fs::read_to_string(&path).expect("read");
        assert_eq!(
            text,
            "[core]\n\tengine = sqlite\n\n[engine \"sqlite\"]\n\tclient = sqlite3\n"
        );

        unset_config_value(&path, "engine \"sqlite\"", "client").expect("unset");
        let text = fs::read_to_string(&path).expect("read");
        assert_eq!(text, "[core]\n\tengine = sqlite\n");
    }

    #[test]
    fn list_rendering_of_merged_settings_is_stable() {
        let mut settings = Settings::new();
        settings.insert(
            "core".to_string(),
            BTreeMap::from([("engine".to_string(), "sqlite".to_string())]),
        );
        settings.insert(
            "engine \"sqlite\"".to_string(),
            BTreeMap::from([("client".to_string(), "sqlite3".to_string())]),
        );
        let dotted: Vec<String> = settings
            .iter()
            .flat_map(|(section, options)| {
                options.iter().map(move |(key, value)| {
                    let section = match section.split_once(" \"") {
                        Some((name, sub)) => {
                            format!("{name}.{}", sub.trim_end_matches('"'))
                        }
                        None => section.clone(),
                    };
                    format!("{section}.{key}={value}")
                })
            })
            .collect();
        insta::assert_snapshot!(
            dotted.join(" "),
            @"core.engine=sqlite engine.sqlite.client=sqlite3"
        );
    }

    #[test]
    fn values_needing_quotes_are_quoted_on_write() {
        let td = tempdir().expect("tempdir");
        let path = td.path().join("sqitch.conf");
        set_config_value(&path, "user", "name", "Ada ; architect").expect("set");

        let text = fs::read_to_string(&path).expect("read");
        assert!(text.contains("name = \"Ada ; architect\""));

        let settings = parse_config(&text, &path).expect("reparse");
        assert_eq!(settings["user"]["name"], "Ada ; architect");
    }
}
