//! Engine adapters over workspace and registry connections.
//!
//! Each supported engine exposes the same contract: distinct logical
//! connections for the workspace and the registry, registry schema
//! creation/upgrade, registry attachment for engines whose deploy scripts
//! may reference registry objects, and script execution honoring the
//! script's transaction mode.
//!
//! SQLite is the reference implementation. The MySQL and PostgreSQL
//! adapters honor the interface but report themselves unsupported from
//! their connect operations until their drivers are wired up.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use rusqlite::{Connection, OpenFlags, params};

use crate::error::SqlitchError;
use crate::identity::Identity;
use crate::migrations::{self, RegistryMigration};
use crate::registry;
use crate::script::{self, TransactionMode};

/// Collapse engine aliases (`postgres`, `postgresql` → `pg`) to the
/// canonical name.
pub fn canonicalize_engine_name(name: &str) -> Result<&'static str> {
    match name.to_ascii_lowercase().as_str() {
        "sqlite" => Ok("sqlite"),
        "mysql" => Ok("mysql"),
        "pg" | "postgres" | "postgresql" => Ok("pg"),
        _ => Err(SqlitchError::Config(format!("Unsupported engine \"{name}\"")).into()),
    }
}

/// A resolved deployment target: workspace plus registry URIs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineTarget {
    /// Display name (target alias or URI as given).
    pub name: String,
    /// Canonical engine name.
    pub engine: String,
    /// Workspace database URI.
    pub uri: String,
    /// Registry database URI.
    pub registry_uri: String,
}

/// What [`EngineAdapter::ensure_registry`] had to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryInit {
    /// Registry already at the latest schema version.
    AlreadyCurrent,
    /// Baseline installed into a fresh registry.
    Created,
    /// Upgrades applied, listing the versions installed.
    Upgraded(Vec<&'static str>),
}

/// Uniform interface over workspace and registry connections for one
/// engine.
pub trait EngineAdapter {
    /// Canonical engine name.
    fn engine_name(&self) -> &'static str;

    /// Open the workspace (application) database.
    fn connect_workspace(&self) -> Result<Connection>;

    /// Open the registry database. Possibly the same underlying database as
    /// the workspace, always a distinct logical handle.
    fn connect_registry(&self) -> Result<Connection>;

    /// Create or upgrade the registry schema, one transaction per
    /// migration, recording each installed version in `releases`.
    fn ensure_registry(&self, installer: &Identity) -> Result<RegistryInit>;

    /// Attach the registry to a workspace connection so deploy scripts can
    /// reference `sqitch.*` objects.
    fn attach_registry(&self, conn: &Connection) -> Result<()>;

    /// Detach a previously attached registry.
    fn detach_registry(&self, conn: &Connection) -> Result<()>;

    /// Execute a script, honoring its transaction mode: wrapped scripts run
    /// inside one transaction that rolls back on any error; self-managed
    /// scripts run bare, with their own `BEGIN`/`COMMIT`/`ROLLBACK` as
    /// written.
    fn execute_script(&self, conn: &Connection, sql: &str, mode: TransactionMode) -> Result<()>;

    /// Execute a script inside a transaction that is always rolled back, so
    /// verification cannot mutate state.
    fn execute_rolled_back(&self, conn: &Connection, sql: &str) -> Result<()>;
}

/// Construct the adapter for a target's engine.
pub fn create_engine(target: &EngineTarget) -> Result<Box<dyn EngineAdapter>> {
    match canonicalize_engine_name(&target.engine)? {
        "sqlite" => Ok(Box::new(SqliteEngine::new(target)?)),
        name => Ok(Box::new(UnsupportedEngine { name })),
    }
}

/// Registry URI for a SQLite target: the override verbatim, else a sibling
/// `sqitch.db` in the project root. Never `:memory:`.
pub fn derive_sqlite_registry_uri(project_root: &Path, registry_override: Option<&str>) -> String {
    if let Some(override_uri) = registry_override.filter(|v| !v.is_empty()) {
        return override_uri.to_string();
    }
    let path = project_root.join("sqitch.db");
    format!("db:sqlite:{}", path.display())
}

/// Extract the filesystem payload from a SQLite URI.
///
/// Accepts `db:sqlite:<path>`, `sqlite:<path>`, `db:sqlite:file:<uri>`, or
/// a bare path. In-memory targets are rejected: deployment state must
/// outlive the connection.
pub fn sqlite_database_path(uri: &str) -> Result<SqlitePath> {
    let payload = uri
        .strip_prefix("db:sqlite:")
        .or_else(|| uri.strip_prefix("sqlite:"))
        .unwrap_or(uri);

    if payload == ":memory:" || payload.contains("mode=memory") {
        return Err(
            SqlitchError::Config("In-memory SQLite targets are not supported".to_string()).into(),
        );
    }
    if payload.is_empty() {
        return Err(SqlitchError::Config(format!("Malformed SQLite URI: {uri}")).into());
    }

    if payload.starts_with("file:") {
        Ok(SqlitePath::Uri(payload.to_string()))
    } else {
        Ok(SqlitePath::File(PathBuf::from(payload)))
    }
}

/// A SQLite database location: a plain path or a `file:` URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqlitePath {
    File(PathBuf),
    Uri(String),
}

impl SqlitePath {
    fn open(&self) -> Result<Connection> {
        let conn = match self {
            Self::File(path) => {
                if let Some(parent) = path.parent()
                    && !parent.as_os_str().is_empty()
                {
                    std::fs::create_dir_all(parent).with_context(|| {
                        format!("failed to create database directory {}", parent.display())
                    })?;
                }
                Connection::open(path)
                    .with_context(|| format!("failed to open database {}", path.display()))?
            }
            Self::Uri(uri) => Connection::open_with_flags(
                uri,
                OpenFlags::SQLITE_OPEN_READ_WRITE
                    | OpenFlags::SQLITE_OPEN_CREATE
                    | OpenFlags::SQLITE_OPEN_URI,
            )
            .with_context(|| format!("failed to open database {uri}"))?,
        };
        conn.execute_batch("PRAGMA foreign_keys = ON")
            .context("failed to enable foreign keys")?;
        Ok(conn)
    }

    /// The location as a string suitable for `ATTACH DATABASE`.
    fn attach_string(&self) -> String {
        match self {
            Self::File(path) => path.display().to_string(),
            Self::Uri(uri) => uri.clone(),
        }
    }
}

/// The reference engine adapter.
pub struct SqliteEngine {
    workspace: SqlitePath,
    registry: SqlitePath,
}

impl SqliteEngine {
    pub fn new(target: &EngineTarget) -> Result<Self> {
        Ok(Self {
            workspace: sqlite_database_path(&target.uri)?,
            registry: sqlite_database_path(&target.registry_uri)?,
        })
    }
}

impl EngineAdapter for SqliteEngine {
    fn engine_name(&self) -> &'static str {
        "sqlite"
    }

    fn connect_workspace(&self) -> Result<Connection> {
        self.workspace.open()
    }

    fn connect_registry(&self) -> Result<Connection> {
        self.registry.open()
    }

    fn ensure_registry(&self, installer: &Identity) -> Result<RegistryInit> {
        let conn = self.connect_registry()?;
        let migrations = migrations::registry_migrations("sqlite")?;
        apply_registry_migrations(&conn, migrations, installer)
    }

    fn attach_registry(&self, conn: &Connection) -> Result<()> {
        conn.execute(
            "ATTACH DATABASE ?1 AS sqitch",
            params![self.registry.attach_string()],
        )
        .context("failed to attach registry database")?;
        Ok(())
    }

    fn detach_registry(&self, conn: &Connection) -> Result<()> {
        conn.execute_batch("DETACH DATABASE sqitch")
            .context("failed to detach registry database")?;
        Ok(())
    }

    fn execute_script(&self, conn: &Connection, sql: &str, mode: TransactionMode) -> Result<()> {
        match mode {
            TransactionMode::Wrap => {
                let tx = conn
                    .unchecked_transaction()
                    .context("failed to begin transaction")?;
                for stmt in script::split_statements(sql) {
                    execute_statement(&tx, &stmt)?;
                }
                tx.commit().context("failed to commit script transaction")?;
            }
            TransactionMode::SelfManaged => {
                for stmt in script::split_statements(sql) {
                    execute_statement(conn, &stmt)?;
                }
            }
        }
        Ok(())
    }

    fn execute_rolled_back(&self, conn: &Connection, sql: &str) -> Result<()> {
        match script::transaction_mode(sql) {
            TransactionMode::Wrap => {
                let tx = conn
                    .unchecked_transaction()
                    .context("failed to begin transaction")?;
                for stmt in script::split_statements(sql) {
                    execute_statement(&tx, &stmt)?;
                }
                // Dropping the transaction rolls it back.
            }
            TransactionMode::SelfManaged => {
                // The script opens its own transaction (the scaffolded
                // verify template ends in ROLLBACK); run it bare and roll
                // back anything it left open.
                let result: Result<()> = (|| {
                    for stmt in script::split_statements(sql) {
                        execute_statement(conn, &stmt)?;
                    }
                    Ok(())
                })();
                if !conn.is_autocommit() {
                    conn.execute_batch("ROLLBACK").ok();
                }
                result?;
            }
        }
        Ok(())
    }
}

/// Execute one statement, draining any rows it returns.
fn execute_statement(conn: &Connection, sql: &str) -> Result<()> {
    if script::first_keyword(sql).is_none() {
        return Ok(());
    }
    let mut stmt = conn
        .prepare(sql)
        .map_err(|e| SqlitchError::Script(format!("{e}")))?;
    if stmt.column_count() == 0 {
        stmt.execute(params![])
            .map_err(|e| SqlitchError::Script(format!("{e}")))?;
    } else {
        let mut rows = stmt
            .query(params![])
            .map_err(|e| SqlitchError::Script(format!("{e}")))?;
        while rows
            .next()
            .map_err(|e| SqlitchError::Script(format!("{e}")))?
            .is_some()
        {}
    }
    Ok(())
}

/// Install the baseline into a fresh registry, or apply the upgrades whose
/// `target_version` exceeds the current one, each in its own transaction.
fn apply_registry_migrations(
    conn: &Connection,
    migrations: &'static [RegistryMigration],
    installer: &Identity,
) -> Result<RegistryInit> {
    let current = registry::registry_version(conn)?;
    let has_tables = registry::has_registry_tables(conn)?;

    match current {
        None if !has_tables => {
            let baseline = migrations
                .iter()
                .find(|m| m.is_baseline)
                .context("registry catalog has no baseline")?;
            conn.execute_batch(baseline.sql)
                .map_err(|e| SqlitchError::Registry(format!("failed to install registry: {e}")))?;
            registry::record_release(conn, baseline.target_version, installer)?;
            Ok(RegistryInit::Created)
        }
        current => {
            // A registry without a releases table predates version 1.0.
            let current: f64 = current.map_or(0.0, |v| v.parse().unwrap_or(0.0));
            let mut installed = Vec::new();
            for migration in migrations.iter().filter(|m| !m.is_baseline) {
                let target: f64 = migration
                    .target_version
                    .parse()
                    .context("malformed migration version")?;
                if target <= current {
                    continue;
                }
                conn.execute_batch(migration.sql).map_err(|e| {
                    SqlitchError::Registry(format!(
                        "failed to upgrade registry to {}: {e}",
                        migration.target_version
                    ))
                })?;
                registry::record_release(conn, migration.target_version, installer)?;
                installed.push(migration.target_version);
            }
            if installed.is_empty() {
                Ok(RegistryInit::AlreadyCurrent)
            } else {
                Ok(RegistryInit::Upgraded(installed))
            }
        }
    }
}

/// Placeholder adapter for engines whose drivers are not wired up yet.
pub struct UnsupportedEngine {
    name: &'static str,
}

impl UnsupportedEngine {
    fn unsupported(&self) -> anyhow::Error {
        SqlitchError::Config(format!("Engine \"{}\" is not yet supported", self.name)).into()
    }
}

impl EngineAdapter for UnsupportedEngine {
    fn engine_name(&self) -> &'static str {
        self.name
    }

    fn connect_workspace(&self) -> Result<Connection> {
        Err(self.unsupported())
    }

    fn connect_registry(&self) -> Result<Connection> {
        Err(self.unsupported())
    }

    fn ensure_registry(&self, _installer: &Identity) -> Result<RegistryInit> {
        Err(self.unsupported())
    }

    fn attach_registry(&self, _conn: &Connection) -> Result<()> {
        Err(self.unsupported())
    }

    fn detach_registry(&self, _conn: &Connection) -> Result<()> {
        Err(self.unsupported())
    }

    fn execute_script(&self, _conn: &Connection, _sql: &str, _mode: TransactionMode) -> Result<()> {
        Err(self.unsupported())
    }

    fn execute_rolled_back(&self, _conn: &Connection, _sql: &str) -> Result<()> {
        Err(self.unsupported())
    }
}

/// Resolve a target string into an [`EngineTarget`].
///
/// Accepts `db:<engine>:<payload>` URIs or a bare SQLite path. The
/// `default_engine` fills in when the URI omits the engine token.
pub fn resolve_engine_target(
    target: &str,
    default_engine: &str,
    project_root: &Path,
    plan_path: &Path,
    registry_override: Option<&str>,
) -> Result<EngineTarget> {
    let candidate = target.trim();
    let (engine_hint, payload) = if let Some(remainder) = candidate.strip_prefix("db:") {
        let (engine_token, payload) = remainder
            .split_once(':')
            .ok_or_else(|| SqlitchError::Config(format!("Malformed target URI: {target}")))?;
        let hint = if engine_token.is_empty() {
            default_engine
        } else {
            engine_token
        };
        (hint, payload.to_string())
    } else {
        (default_engine, candidate.to_string())
    };

    let engine = canonicalize_engine_name(engine_hint)?;

    if engine == "sqlite" {
        let workspace_uri =
            resolve_sqlite_workspace_uri(&payload, project_root, plan_path)?;
        let registry_uri = derive_sqlite_registry_uri(project_root, registry_override);
        return Ok(EngineTarget {
            name: if candidate.is_empty() {
                workspace_uri.clone()
            } else {
                candidate.to_string()
            },
            engine: engine.to_string(),
            uri: workspace_uri,
            registry_uri,
        });
    }

    let workspace_uri = if candidate.starts_with("db:") {
        candidate.to_string()
    } else {
        format!("db:{engine}:{payload}")
    };
    let registry_uri = registry_override
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| workspace_uri.clone());
    Ok(EngineTarget {
        name: candidate.to_string(),
        engine: engine.to_string(),
        uri: workspace_uri,
        registry_uri,
    })
}

fn resolve_sqlite_workspace_uri(
    payload: &str,
    project_root: &Path,
    plan_path: &Path,
) -> Result<String> {
    if payload == ":memory:" {
        return Err(
            SqlitchError::Config("In-memory SQLite targets are not supported".to_string()).into(),
        );
    }
    if payload.starts_with("file:") {
        return Ok(format!("db:sqlite:{payload}"));
    }
    let candidate = if payload.is_empty() {
        plan_path.with_extension("db")
    } else {
        PathBuf::from(payload)
    };
    let database_path = if candidate.is_absolute() {
        candidate
    } else {
        project_root.join(candidate)
    };
    Ok(format!("db:sqlite:{}", database_path.display()))
}
