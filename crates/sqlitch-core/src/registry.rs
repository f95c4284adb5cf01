//! Registry state recorder.
//!
//! CRUD over the `projects`, `changes`, `tags`, `dependencies`, `events`,
//! and `releases` tables. All writes for a single change happen in one
//! transaction; reads are non-transactional snapshots. Reverts delete from
//! `changes`/`dependencies`/`tags` but always append to `events`.

use std::sync::atomic::{AtomicI64, Ordering};

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::ToSql;
use rusqlite::{Connection, OptionalExtension, params};

use crate::error::SqlitchError;
use crate::identity::Identity;

/// A change currently recorded as deployed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployedChange {
    pub change_id: String,
    pub name: String,
    pub script_hash: Option<String>,
    pub committed_at: String,
}

/// One row of the `events` history.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RegistryEvent {
    pub event: String,
    pub change_id: String,
    pub change: String,
    pub project: String,
    pub note: String,
    pub requires: String,
    pub conflicts: String,
    pub tags: String,
    pub committed_at: String,
    pub committer_name: String,
    pub committer_email: String,
}

/// A `require` dependency resolved to its target change, or a `conflict`
/// with no target.
#[derive(Debug, Clone)]
pub struct ResolvedDependency {
    pub name: String,
    /// `Some` for `require`, `None` for `conflict`.
    pub dependency_id: Option<String>,
}

/// A tag to record alongside its anchor change.
#[derive(Debug, Clone)]
pub struct TagRecord {
    pub tag_id: String,
    pub name: String,
    pub note: String,
    pub planned_at: String,
    pub planner_name: String,
    pub planner_email: String,
}

/// Criteria for reading the event history.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    /// Only events of these types (`deploy`, `deploy_fail`, `revert`,
    /// `fail`, `merge`); empty means all.
    pub events: Vec<String>,
    /// Only events for this change name.
    pub change: Option<String>,
    /// Most-recent-first cap on the number of rows returned.
    pub limit: Option<usize>,
}

/// Everything needed to record one deployed change.
#[derive(Debug, Clone)]
pub struct ChangeRecord {
    pub change_id: String,
    pub script_hash: Option<String>,
    pub name: String,
    pub note: String,
    pub planned_at: String,
    pub planner_name: String,
    pub planner_email: String,
    pub requires: Vec<ResolvedDependency>,
    pub conflicts: Vec<String>,
    pub tags: Vec<TagRecord>,
}

/// Registry timestamp rendering: RFC 3339 UTC with microseconds, which
/// sorts lexicographically.
pub fn registry_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

static LAST_COMMIT_MICROS: AtomicI64 = AtomicI64::new(0);

/// Strictly monotonic commit timestamp, so deploy order stays unambiguous
/// even when two writes land in the same clock microsecond.
fn commit_timestamp() -> String {
    let now = Utc::now().timestamp_micros();
    let mut last = LAST_COMMIT_MICROS.load(Ordering::Relaxed);
    let assigned = loop {
        let candidate = now.max(last + 1);
        match LAST_COMMIT_MICROS.compare_exchange(
            last,
            candidate,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => break candidate,
            Err(observed) => last = observed,
        }
    };
    let ts = DateTime::<Utc>::from_timestamp_micros(assigned).unwrap_or_else(Utc::now);
    registry_timestamp(ts)
}

/// Current registry schema version, or `None` when the `releases` table is
/// absent.
pub fn registry_version(conn: &Connection) -> Result<Option<String>> {
    if !table_exists(conn, "releases")? {
        return Ok(None);
    }
    let version: Option<f64> = conn
        .query_row("SELECT MAX(version) FROM releases", [], |row| row.get(0))
        .context("failed to read registry version")?;
    Ok(version.map(|v| format!("{v:.1}")))
}

/// Whether any registry table exists (distinguishes a fresh database from a
/// pre-1.0 registry that lacks `releases`).
pub fn has_registry_tables(conn: &Connection) -> Result<bool> {
    table_exists(conn, "changes")
}

fn table_exists(conn: &Connection, name: &str) -> Result<bool> {
    let count: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
            params![name],
            |row| row.get(0),
        )
        .context("failed to inspect registry schema")?;
    Ok(count > 0)
}

/// Append a row to `releases`.
pub fn record_release(conn: &Connection, version: &str, installer: &Identity) -> Result<()> {
    conn.execute(
        "INSERT INTO releases (version, installed_at, installer_name, installer_email)
         VALUES (?1, ?2, ?3, ?4)",
        params![
            version.parse::<f64>().context("malformed registry version")?,
            commit_timestamp(),
            installer.name,
            installer.email,
        ],
    )
    .context("failed to record registry release")?;
    Ok(())
}

/// Recorder over one project's rows in a registry connection.
pub struct Recorder<'a> {
    conn: &'a Connection,
    project: String,
}

impl<'a> Recorder<'a> {
    pub fn new(conn: &'a Connection, project: &str) -> Self {
        Self {
            conn,
            project: project.to_string(),
        }
    }

    /// Insert the project row if absent.
    pub fn ensure_project(&self, uri: Option<&str>, creator: &Identity) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO projects (project, uri, created_at, creator_name, creator_email)
                 SELECT ?1, ?2, ?3, ?4, ?5
                 WHERE NOT EXISTS (SELECT 1 FROM projects WHERE project = ?1)",
                params![
                    self.project,
                    uri,
                    commit_timestamp(),
                    creator.name,
                    creator.email,
                ],
            )
            .map_err(|e| SqlitchError::Registry(format!("failed to record project: {e}")))?;
        Ok(())
    }

    /// Record a successful deploy: the `changes` row, its dependencies and
    /// tags, and a `deploy` event, all in one transaction.
    pub fn record_deploy(&self, record: &ChangeRecord, committer: &Identity) -> Result<()> {
        let committed_at = commit_timestamp();
        let tx = self
            .conn
            .unchecked_transaction()
            .context("failed to begin registry transaction")?;

        tx.execute(
            "INSERT INTO changes (change_id, script_hash, change, project, note,
                                  committed_at, committer_name, committer_email,
                                  planned_at, planner_name, planner_email)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                record.change_id,
                record.script_hash,
                record.name,
                self.project,
                record.note,
                committed_at,
                committer.name,
                committer.email,
                record.planned_at,
                record.planner_name,
                record.planner_email,
            ],
        )
        .map_err(|e| SqlitchError::Registry(format!("failed to record change: {e}")))?;

        for dep in &record.requires {
            // The schema CHECK demands a resolved id for every `require`
            // row; unresolved external requires live only in the event
            // snapshot.
            let Some(dependency_id) = &dep.dependency_id else {
                continue;
            };
            tx.execute(
                "INSERT INTO dependencies (change_id, type, dependency, dependency_id)
                 VALUES (?1, 'require', ?2, ?3)",
                params![record.change_id, dep.name, dependency_id],
            )
            .map_err(|e| SqlitchError::Registry(format!("failed to record dependency: {e}")))?;
        }
        for conflict in &record.conflicts {
            tx.execute(
                "INSERT INTO dependencies (change_id, type, dependency, dependency_id)
                 VALUES (?1, 'conflict', ?2, NULL)",
                params![record.change_id, conflict],
            )
            .map_err(|e| SqlitchError::Registry(format!("failed to record dependency: {e}")))?;
        }

        for tag in &record.tags {
            tx.execute(
                "INSERT INTO tags (tag_id, tag, project, change_id, note,
                                   committed_at, committer_name, committer_email,
                                   planned_at, planner_name, planner_email)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    tag.tag_id,
                    format!("@{}", tag.name),
                    self.project,
                    record.change_id,
                    tag.note,
                    committed_at,
                    committer.name,
                    committer.email,
                    tag.planned_at,
                    tag.planner_name,
                    tag.planner_email,
                ],
            )
            .map_err(|e| SqlitchError::Registry(format!("failed to record tag: {e}")))?;
        }

        self.insert_event(&tx, "deploy", record, committer, &committed_at)?;
        tx.commit()
            .context("failed to commit registry transaction")?;
        Ok(())
    }

    /// Record a failed deploy: an event only, never a `changes` row.
    pub fn record_deploy_fail(&self, record: &ChangeRecord, committer: &Identity) -> Result<()> {
        let committed_at = commit_timestamp();
        self.insert_event(self.conn, "deploy_fail", record, committer, &committed_at)
    }

    /// Record a revert: delete the change's tags, dependencies, and
    /// `changes` row; append a `revert` event capturing denormalized
    /// snapshots as they were.
    pub fn record_revert(&self, change_id: &str, committer: &Identity) -> Result<()> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("failed to begin registry transaction")?;

        let row = tx
            .query_row(
                "SELECT change, note, planned_at, planner_name, planner_email
                 FROM changes WHERE change_id = ?1 AND project = ?2",
                params![change_id, self.project],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )
            .optional()
            .context("failed to load change for revert")?;
        let Some((name, note, planned_at, planner_name, planner_email)) = row else {
            return Err(SqlitchError::Registry(format!(
                "change {change_id} is not deployed"
            ))
            .into());
        };

        let mut requires = Vec::new();
        let mut conflicts = Vec::new();
        {
            let mut stmt = tx
                .prepare("SELECT type, dependency, dependency_id FROM dependencies WHERE change_id = ?1")
                .context("failed to read dependencies")?;
            let rows = stmt
                .query_map(params![change_id], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<String>>(2)?,
                    ))
                })
                .context("failed to read dependencies")?;
            for row in rows {
                let (kind, dependency, dependency_id) = row.context("dependency row")?;
                if kind == "require" {
                    requires.push(ResolvedDependency {
                        name: dependency,
                        dependency_id,
                    });
                } else {
                    conflicts.push(dependency);
                }
            }
        }

        let mut tags = Vec::new();
        {
            let mut stmt = tx
                .prepare("SELECT tag FROM tags WHERE change_id = ?1 AND project = ?2")
                .context("failed to read tags")?;
            let rows = stmt
                .query_map(params![change_id, self.project], |row| {
                    row.get::<_, String>(0)
                })
                .context("failed to read tags")?;
            for row in rows {
                tags.push(row.context("tag row")?);
            }
        }

        tx.execute(
            "DELETE FROM tags WHERE change_id = ?1 AND project = ?2",
            params![change_id, self.project],
        )
        .map_err(|e| SqlitchError::Registry(format!("failed to delete tags: {e}")))?;
        tx.execute(
            "DELETE FROM dependencies WHERE change_id = ?1",
            params![change_id],
        )
        .map_err(|e| SqlitchError::Registry(format!("failed to delete dependencies: {e}")))?;
        tx.execute(
            "DELETE FROM changes WHERE change_id = ?1 AND project = ?2",
            params![change_id, self.project],
        )
        .map_err(|e| SqlitchError::Registry(format!("failed to delete change: {e}")))?;

        let committed_at = commit_timestamp();
        tx.execute(
            "INSERT INTO events (event, change_id, change, project, note,
                                 requires, conflicts, tags,
                                 committed_at, committer_name, committer_email,
                                 planned_at, planner_name, planner_email)
             VALUES ('revert', ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                change_id,
                name,
                self.project,
                note,
                requires
                    .iter()
                    .map(|d| d.name.clone())
                    .collect::<Vec<_>>()
                    .join(" "),
                conflicts.join(" "),
                tags.join(" "),
                committed_at,
                committer.name,
                committer.email,
                planned_at,
                planner_name,
                planner_email,
            ],
        )
        .map_err(|e| SqlitchError::Registry(format!("failed to record revert event: {e}")))?;

        tx.commit()
            .context("failed to commit registry transaction")?;
        Ok(())
    }

    /// Record a tag applied outside of a deploy.
    pub fn record_tag(&self, change_id: &str, tag: &TagRecord, committer: &Identity) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO tags (tag_id, tag, project, change_id, note,
                                   committed_at, committer_name, committer_email,
                                   planned_at, planner_name, planner_email)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    tag.tag_id,
                    format!("@{}", tag.name),
                    self.project,
                    change_id,
                    tag.note,
                    commit_timestamp(),
                    committer.name,
                    committer.email,
                    tag.planned_at,
                    tag.planner_name,
                    tag.planner_email,
                ],
            )
            .map_err(|e| SqlitchError::Registry(format!("failed to record tag: {e}")))?;
        Ok(())
    }

    /// Deployed changes in deploy order (commit time, change ID tiebreak).
    pub fn deployed_changes(&self) -> Result<Vec<DeployedChange>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT change_id, change, script_hash, committed_at
                 FROM changes WHERE project = ?1
                 ORDER BY committed_at ASC, change_id ASC",
            )
            .context("failed to query deployed changes")?;
        let rows = stmt
            .query_map(params![self.project], |row| {
                Ok(DeployedChange {
                    change_id: row.get(0)?,
                    name: row.get(1)?,
                    script_hash: row.get(2)?,
                    committed_at: row.get(3)?,
                })
            })
            .context("failed to query deployed changes")?;
        let mut changes = Vec::new();
        for row in rows {
            changes.push(row.context("deployed change row")?);
        }
        Ok(changes)
    }

    /// Tags currently recorded for a deployed change.
    pub fn tags_for_change(&self, change_id: &str) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT tag FROM tags WHERE change_id = ?1 AND project = ?2 ORDER BY committed_at")
            .context("failed to query tags")?;
        let rows = stmt
            .query_map(params![change_id, self.project], |row| {
                row.get::<_, String>(0)
            })
            .context("failed to query tags")?;
        let mut tags = Vec::new();
        for row in rows {
            tags.push(row.context("tag row")?);
        }
        Ok(tags)
    }

    /// Event history matching `filter`, most recent first.
    pub fn events(&self, filter: &EventFilter) -> Result<Vec<RegistryEvent>> {
        let mut sql = String::from(
            "SELECT event, change_id, change, project, note, requires, conflicts, tags,
                    committed_at, committer_name, committer_email
             FROM events WHERE project = ?",
        );
        let lowered: Vec<String> = filter
            .events
            .iter()
            .map(|e| e.to_ascii_lowercase())
            .collect();
        let limit = filter.limit.map(|l| l as i64);

        let mut bindings: Vec<&dyn ToSql> = vec![&self.project];
        if let Some(change) = &filter.change {
            sql.push_str(" AND change = ?");
            bindings.push(change);
        }
        if !lowered.is_empty() {
            let placeholders = vec!["?"; lowered.len()].join(", ");
            sql.push_str(&format!(" AND lower(event) IN ({placeholders})"));
            for event in &lowered {
                bindings.push(event);
            }
        }
        sql.push_str(" ORDER BY committed_at DESC, change_id DESC");
        if let Some(limit) = &limit {
            sql.push_str(" LIMIT ?");
            bindings.push(limit);
        }

        let mut stmt = self.conn.prepare(&sql).context("failed to query events")?;
        let rows = stmt
            .query_map(bindings.as_slice(), |row| {
                Ok(RegistryEvent {
                    event: row.get(0)?,
                    change_id: row.get(1)?,
                    change: row.get(2)?,
                    project: row.get(3)?,
                    note: row.get(4)?,
                    requires: row.get(5)?,
                    conflicts: row.get(6)?,
                    tags: row.get(7)?,
                    committed_at: row.get(8)?,
                    committer_name: row.get(9)?,
                    committer_email: row.get(10)?,
                })
            })
            .context("failed to query events")?;
        let mut events = Vec::new();
        for row in rows {
            events.push(row.context("event row")?);
        }
        Ok(events)
    }

    /// Most recent event, if any. Used by `status` for failure reporting.
    pub fn last_event(&self) -> Result<Option<RegistryEvent>> {
        let filter = EventFilter {
            limit: Some(1),
            ..EventFilter::default()
        };
        Ok(self.events(&filter)?.into_iter().next())
    }

    fn insert_event(
        &self,
        conn: &Connection,
        event: &str,
        record: &ChangeRecord,
        committer: &Identity,
        committed_at: &str,
    ) -> Result<()> {
        conn.execute(
            "INSERT INTO events (event, change_id, change, project, note,
                                 requires, conflicts, tags,
                                 committed_at, committer_name, committer_email,
                                 planned_at, planner_name, planner_email)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                event,
                record.change_id,
                record.name,
                self.project,
                record.note,
                record
                    .requires
                    .iter()
                    .map(|d| d.name.clone())
                    .collect::<Vec<_>>()
                    .join(" "),
                record.conflicts.join(" "),
                record
                    .tags
                    .iter()
                    .map(|t| format!("@{}", t.name))
                    .collect::<Vec<_>>()
                    .join(" "),
                committed_at,
                committer.name,
                committer.email,
                record.planned_at,
                record.planner_name,
                record.planner_email,
            ],
        )
        .map_err(|e| SqlitchError::Registry(format!("failed to record {event} event: {e}")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrations;

    fn registry_conn() -> Connection {
        let conn = Connection::open_in_memory().expect("open");
        let baseline = migrations::registry_migrations("sqlite").expect("catalog")[0];
        conn.execute_batch(baseline.sql).expect("baseline");
        conn
    }

    fn committer() -> Identity {
        Identity {
            name: "Alice".into(),
            email: "alice@example.com".into(),
        }
    }

    fn change_record(id: &str, name: &str) -> ChangeRecord {
        ChangeRecord {
            change_id: id.to_string(),
            script_hash: Some(format!("hash-{id}")),
            name: name.to_string(),
            note: String::new(),
            planned_at: "2025-01-01T00:00:00.000000Z".to_string(),
            planner_name: "Alice".to_string(),
            planner_email: "alice@example.com".to_string(),
            requires: Vec::new(),
            conflicts: Vec::new(),
            tags: Vec::new(),
        }
    }

    #[test]
    fn ensure_project_is_idempotent() {
        let conn = registry_conn();
        let recorder = Recorder::new(&conn, "flipr");
        recorder
            .ensure_project(Some("https://example.com/flipr"), &committer())
            .expect("insert");
        recorder
            .ensure_project(Some("https://example.com/flipr"), &committer())
            .expect("no-op");

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM projects", [], |row| row.get(0))
            .expect("count");
        assert_eq!(count, 1);
    }

    #[test]
    fn deploy_records_change_dependencies_and_event() {
        let conn = registry_conn();
        let recorder = Recorder::new(&conn, "flipr");
        recorder.ensure_project(None, &committer()).expect("project");

        recorder
            .record_deploy(&change_record("aaa", "users"), &committer())
            .expect("deploy users");

        let mut flips = change_record("bbb", "flips");
        flips.requires = vec![ResolvedDependency {
            name: "users".to_string(),
            dependency_id: Some("aaa".to_string()),
        }];
        flips.conflicts = vec!["widgets".to_string()];
        recorder
            .record_deploy(&flips, &committer())
            .expect("deploy flips");

        let deployed = recorder.deployed_changes().expect("deployed");
        assert_eq!(deployed.len(), 2);
        assert_eq!(deployed[0].name, "users");
        assert_eq!(deployed[1].name, "flips");

        let dep_count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM dependencies WHERE change_id = 'bbb'",
                [],
                |row| row.get(0),
            )
            .expect("count");
        assert_eq!(dep_count, 2);

        let event = recorder.last_event().expect("event").expect("present");
        assert_eq!(event.event, "deploy");
        assert_eq!(event.change, "flips");
        assert_eq!(event.requires, "users");
        assert_eq!(event.conflicts, "widgets");
    }

    #[test]
    fn conflict_dependencies_must_have_null_ids() {
        let conn = registry_conn();
        let recorder = Recorder::new(&conn, "flipr");
        recorder.ensure_project(None, &committer()).expect("project");
        recorder
            .record_deploy(&change_record("aaa", "users"), &committer())
            .expect("deploy");

        // The schema CHECK enforces the require/conflict invariant.
        let err = conn.execute(
            "INSERT INTO dependencies (change_id, type, dependency, dependency_id)
             VALUES ('aaa', 'conflict', 'x', 'aaa')",
            [],
        );
        assert!(err.is_err());
    }

    #[test]
    fn revert_deletes_rows_but_keeps_history() {
        let conn = registry_conn();
        let recorder = Recorder::new(&conn, "flipr");
        recorder.ensure_project(None, &committer()).expect("project");

        let mut record = change_record("aaa", "users");
        record.tags = vec![TagRecord {
            tag_id: "tag-1".to_string(),
            name: "v1.0".to_string(),
            note: String::new(),
            planned_at: "2025-01-02T00:00:00.000000Z".to_string(),
            planner_name: "Alice".to_string(),
            planner_email: "alice@example.com".to_string(),
        }];
        recorder.record_deploy(&record, &committer()).expect("deploy");

        recorder.record_revert("aaa", &committer()).expect("revert");

        assert!(recorder.deployed_changes().expect("deployed").is_empty());
        let tag_count: i64 = conn
            .query_row("SELECT COUNT(*) FROM tags", [], |row| row.get(0))
            .expect("count");
        assert_eq!(tag_count, 0);

        let events = recorder.events(&EventFilter::default()).expect("events");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event, "revert");
        assert_eq!(events[0].tags, "@v1.0");
        assert_eq!(events[1].event, "deploy");
    }

    #[test]
    fn events_filter_by_change_and_type() {
        let conn = registry_conn();
        let recorder = Recorder::new(&conn, "flipr");
        recorder.ensure_project(None, &committer()).expect("project");

        recorder
            .record_deploy(&change_record("aaa", "users"), &committer())
            .expect("deploy users");
        recorder
            .record_deploy(&change_record("bbb", "flips"), &committer())
            .expect("deploy flips");
        recorder
            .record_deploy_fail(&change_record("ccc", "lists"), &committer())
            .expect("fail lists");

        let by_change = recorder
            .events(&EventFilter {
                change: Some("users".to_string()),
                ..EventFilter::default()
            })
            .expect("events");
        assert_eq!(by_change.len(), 1);
        assert_eq!(by_change[0].change, "users");

        // Event types compare case-insensitively, as the reference does.
        let failures = recorder
            .events(&EventFilter {
                events: vec!["DEPLOY_FAIL".to_string()],
                ..EventFilter::default()
            })
            .expect("events");
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].change, "lists");

        let deploys = recorder
            .events(&EventFilter {
                events: vec!["deploy".to_string()],
                limit: Some(1),
                ..EventFilter::default()
            })
            .expect("events");
        assert_eq!(deploys.len(), 1);
        assert_eq!(deploys[0].change, "flips");

        let none = recorder
            .events(&EventFilter {
                events: vec!["revert".to_string()],
                change: Some("users".to_string()),
                ..EventFilter::default()
            })
            .expect("events");
        assert!(none.is_empty());
    }

    #[test]
    fn deploy_fail_appends_an_event_without_a_changes_row() {
        let conn = registry_conn();
        let recorder = Recorder::new(&conn, "flipr");
        recorder.ensure_project(None, &committer()).expect("project");

        recorder
            .record_deploy_fail(&change_record("bad", "bad"), &committer())
            .expect("fail event");

        assert!(recorder.deployed_changes().expect("deployed").is_empty());
        let event = recorder.last_event().expect("event").expect("present");
        assert_eq!(event.event, "deploy_fail");
        assert_eq!(event.change, "bad");
    }

    #[test]
    fn script_hash_uniqueness_is_scoped_per_project() {
        let conn = registry_conn();
        let recorder = Recorder::new(&conn, "flipr");
        recorder.ensure_project(None, &committer()).expect("project");
        recorder
            .record_deploy(&change_record("aaa", "users"), &committer())
            .expect("deploy");

        let mut dup = change_record("bbb", "other");
        dup.script_hash = Some("hash-aaa".to_string());
        let err = recorder.record_deploy(&dup, &committer()).expect_err("dup hash");
        assert!(err.to_string().contains("failed to record change"));
    }

    #[test]
    fn registry_version_reads_the_releases_table() {
        let conn = registry_conn();
        assert_eq!(registry_version(&conn).expect("version"), None);
        record_release(&conn, "1.1", &committer()).expect("release");
        assert_eq!(
            registry_version(&conn).expect("version"),
            Some("1.1".to_string())
        );

        let bare = Connection::open_in_memory().expect("open");
        assert_eq!(registry_version(&bare).expect("version"), None);
        assert!(!has_registry_tables(&bare).expect("tables"));
    }
}
