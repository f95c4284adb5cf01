//! Deploy, revert, and verify execution engines.
//!
//! Plan order is the sole ordering authority for deploys; reverse deploy
//! order from the registry is authoritative for reverts. A change is either
//! fully recorded or fully absent from `changes`: per-change registry
//! writes commit only if the script succeeded, and a failed script's
//! workspace mutations are rolled back either by the wrapping transaction
//! or by the script's own `ROLLBACK`.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use anyhow::Result;
use chrono::Utc;
use serde_json::json;

use crate::engine::{self, EngineTarget, RegistryInit};
use crate::error::SqlitchError;
use crate::identity::Identity;
use crate::logging::StructuredLogger;
use crate::plan::{Change, Plan, parse_dependency};
use crate::registry::{
    ChangeRecord, DeployedChange, EventFilter, Recorder, RegistryEvent, ResolvedDependency,
    TagRecord, registry_timestamp,
};
use crate::script::{Script, script_hash, transaction_mode};

/// Sink for user-facing progress output.
pub trait Reporter {
    fn info(&mut self, msg: &str);
    fn warn(&mut self, msg: &str);
    fn error(&mut self, msg: &str);
    /// Primary command output (`+ users`, verify lines, summaries).
    fn emit(&mut self, line: &str);
}

/// A reporter that discards everything; useful in tests.
#[derive(Debug, Default)]
pub struct NullReporter;

impl Reporter for NullReporter {
    fn info(&mut self, _msg: &str) {}
    fn warn(&mut self, _msg: &str) {}
    fn error(&mut self, _msg: &str) {}
    fn emit(&mut self, _line: &str) {}
}

/// Everything the engines need for one run against one target.
pub struct ExecutionContext<'a> {
    pub plan: &'a Plan,
    pub target: &'a EngineTarget,
    /// Directory holding `deploy/`, `revert/`, and `verify/`.
    pub top_dir: &'a Path,
    /// Committer identity for registry writes.
    pub identity: &'a Identity,
    pub logger: &'a StructuredLogger,
}

impl ExecutionContext<'_> {
    fn script_path(&self, kind: &str, script_name: &str) -> PathBuf {
        self.top_dir.join(kind).join(format!("{script_name}.sql"))
    }
}

/// Deploy options.
#[derive(Debug, Clone, Default)]
pub struct DeployOptions {
    /// Deploy through this symbolic reference (default `@HEAD`).
    pub to: Option<String>,
}

/// What a deploy run did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploySummary {
    pub deployed: usize,
    pub registry_init: RegistryInit,
}

/// Deploy undeployed changes through the target reference.
pub fn deploy(
    ctx: &ExecutionContext<'_>,
    opts: &DeployOptions,
    reporter: &mut dyn Reporter,
) -> Result<DeploySummary> {
    let adapter = engine::create_engine(ctx.target)?;

    let registry_init = adapter.ensure_registry(ctx.identity)?;
    if registry_init == RegistryInit::Created {
        reporter.info(&format!(
            "Adding registry tables to {}",
            ctx.target.registry_uri
        ));
    }

    let registry_conn = adapter.connect_registry()?;
    let recorder = Recorder::new(&registry_conn, &ctx.plan.project);
    recorder.ensure_project(ctx.plan.uri.as_deref(), ctx.identity)?;

    let deployed = recorder.deployed_changes()?;
    let deployed_ids: BTreeSet<&str> = deployed.iter().map(|c| c.change_id.as_str()).collect();

    let changes = ctx.plan.changes();
    if changes.is_empty() {
        reporter.info("Nothing to deploy (empty plan)");
        return Ok(DeploySummary {
            deployed: 0,
            registry_init,
        });
    }

    // Reworked entries deploy separately: the range is computed by
    // change_id, never by name.
    let start = changes
        .iter()
        .position(|c| !deployed_ids.contains(c.change_id.as_str()));
    let Some(start) = start else {
        reporter.info("Nothing to deploy (up-to-date)");
        return Ok(DeploySummary {
            deployed: 0,
            registry_init,
        });
    };

    let end = match &opts.to {
        Some(reference) => ctx.plan.resolve_ref(reference)?,
        None => changes.len() - 1,
    };
    if end < start {
        reporter.info("Nothing to deploy (already at target)");
        return Ok(DeploySummary {
            deployed: 0,
            registry_init,
        });
    }

    validate_dependencies(ctx.plan, &deployed, start, end)?;

    let workspace = adapter.connect_workspace()?;
    adapter.attach_registry(&workspace)?;

    let mut count = 0usize;
    let result = (|| -> Result<()> {
        for idx in start..=end {
            let change = changes[idx];
            let script_name = ctx.plan.script_name(idx);
            let path = ctx.script_path("deploy", &script_name);
            let script = Script::load(&path).map_err(|e| {
                SqlitchError::Plan(format!(
                    "missing deploy script for change \"{}\": {e}",
                    change.name
                ))
            })?;

            let mode = transaction_mode(&script.content);
            ctx.logger.emit(
                crate::logging::LogLevel::Debug,
                "deploy.change.start",
                Some(&change.name),
                Some(
                    json!({
                        "change": change.name,
                        "change_id": change.change_id,
                        "script": path.display().to_string(),
                    })
                    .as_object()
                    .cloned()
                    .unwrap_or_default(),
                ),
            );

            let record = change_record(ctx.plan, change, idx, Some(&script.content));

            match adapter.execute_script(&workspace, &script.content, mode) {
                Ok(()) => {
                    recorder.record_deploy(&record, ctx.identity)?;
                    reporter.emit(&format!("+ {}", change.name));
                    count += 1;
                }
                Err(script_err) => {
                    // Best-effort failure event; the primary error wins.
                    if let Err(event_err) = recorder.record_deploy_fail(&record, ctx.identity) {
                        ctx.logger.error(
                            "deploy.fail_event",
                            &format!("failed to record deploy_fail event: {event_err}"),
                        );
                    }
                    reporter.emit(&format!("- {}", change.name));
                    return Err(anyhow::Error::from(SqlitchError::Script(format!(
                        "Deploy failed for change \"{}\": {script_err}",
                        change.name
                    ))));
                }
            }
        }
        Ok(())
    })();

    adapter.detach_registry(&workspace).ok();
    result?;

    Ok(DeploySummary {
        deployed: count,
        registry_init,
    })
}

/// Abort before executing anything when a `require` is unsatisfied or a
/// `conflict` is deployed.
fn validate_dependencies(
    plan: &Plan,
    deployed: &[DeployedChange],
    start: usize,
    end: usize,
) -> Result<()> {
    let changes = plan.changes();
    let deployed_ids: BTreeSet<&str> = deployed.iter().map(|c| c.change_id.as_str()).collect();
    let deployed_names: BTreeSet<&str> = deployed.iter().map(|c| c.name.as_str()).collect();

    for (idx, change) in changes.iter().enumerate().take(end + 1).skip(start) {
        for raw in &change.requires {
            let dep = parse_dependency(raw).map_err(SqlitchError::Plan)?;
            if let Some(project) = &dep.project
                && project != &plan.project
            {
                continue;
            }
            let resolved = resolve_dependency_index(plan, &dep.change, dep.tag.as_deref(), idx);
            let satisfied = match resolved {
                Some(dep_idx) => {
                    deployed_ids.contains(changes[dep_idx].change_id.as_str())
                        || (dep_idx >= start && dep_idx < idx)
                }
                None => false,
            };
            if !satisfied {
                return Err(SqlitchError::Plan(format!(
                    "Missing required change: \"{raw}\" (required by \"{}\")",
                    change.name
                ))
                .into());
            }
        }
        for raw in &change.conflicts {
            let dep = parse_dependency(raw).map_err(SqlitchError::Plan)?;
            if let Some(project) = &dep.project
                && project != &plan.project
            {
                continue;
            }
            if deployed_names.contains(dep.change.as_str()) {
                return Err(SqlitchError::Plan(format!(
                    "Conflicts with deployed change: \"{raw}\" (declared by \"{}\")",
                    change.name
                ))
                .into());
            }
        }
    }
    Ok(())
}

fn resolve_dependency_index(
    plan: &Plan,
    name: &str,
    tag: Option<&str>,
    before: usize,
) -> Option<usize> {
    match tag {
        Some(tag) => {
            let limit = plan.tag_anchor_index(tag)?;
            if name.is_empty() {
                Some(limit)
            } else {
                plan.last_index_of(name, Some(limit))
            }
        }
        None => plan.last_index_of(name, before.checked_sub(1)),
    }
}

/// Build the registry record for a plan change.
fn change_record(plan: &Plan, change: &Change, idx: usize, script: Option<&str>) -> ChangeRecord {
    let changes = plan.changes();
    let requires = change
        .requires
        .iter()
        .map(|raw| {
            let dependency_id = parse_dependency(raw).ok().and_then(|dep| {
                if dep.project.as_deref().is_some_and(|p| p != plan.project) {
                    return None;
                }
                resolve_dependency_index(plan, &dep.change, dep.tag.as_deref(), idx)
                    .map(|i| changes[i].change_id.clone())
            });
            ResolvedDependency {
                name: raw.clone(),
                dependency_id,
            }
        })
        .collect();

    let tags = plan
        .tags()
        .into_iter()
        .filter(|t| {
            plan.tag_anchor_index(&t.name) == Some(idx)
        })
        .map(|t| TagRecord {
            tag_id: t.tag_id.clone(),
            name: t.name.clone(),
            note: t.note.clone().unwrap_or_default(),
            planned_at: registry_timestamp(t.tagged_at),
            planner_name: t.planner_name.clone(),
            planner_email: t.planner_email.clone(),
        })
        .collect();

    ChangeRecord {
        change_id: change.change_id.clone(),
        script_hash: script.map(script_hash),
        name: change.name.clone(),
        note: change.note.clone().unwrap_or_default(),
        planned_at: registry_timestamp(change.planned_at),
        planner_name: change.planner_name.clone(),
        planner_email: change.planner_email.clone(),
        requires,
        conflicts: change.conflicts.clone(),
        tags,
    }
}

/// Revert options.
#[derive(Debug, Clone, Default)]
pub struct RevertOptions {
    /// Revert everything strictly after this reference; `None` reverts all.
    pub to: Option<String>,
    /// Skip the confirmation prompt.
    pub yes: bool,
}

/// Revert deployed changes in reverse deploy order.
///
/// `confirm` is consulted once unless `yes` is set; declining aborts with
/// exit-worthy [`SqlitchError::Aborted`].
pub fn revert(
    ctx: &ExecutionContext<'_>,
    opts: &RevertOptions,
    confirm: &mut dyn FnMut(&str) -> Result<bool>,
    reporter: &mut dyn Reporter,
) -> Result<usize> {
    let adapter = engine::create_engine(ctx.target)?;
    let registry_conn = match adapter.connect_registry() {
        Ok(conn) => conn,
        Err(err) => {
            return Err(err.context("cannot revert: registry is not reachable"));
        }
    };
    if crate::registry::registry_version(&registry_conn)?.is_none() {
        reporter.info("Nothing to revert (nothing deployed)");
        return Ok(0);
    }
    let recorder = Recorder::new(&registry_conn, &ctx.plan.project);

    let deployed = recorder.deployed_changes()?;
    if deployed.is_empty() {
        reporter.info("Nothing to revert (nothing deployed)");
        return Ok(0);
    }

    // Everything strictly after the target is reverted; no target means
    // revert all.
    let keep_through = match &opts.to {
        Some(reference) => {
            let plan_idx = ctx.plan.resolve_ref(reference)?;
            let target_id = &ctx.plan.changes()[plan_idx].change_id;
            let position = deployed
                .iter()
                .position(|c| &c.change_id == target_id)
                .ok_or_else(|| {
                    SqlitchError::Plan(format!("Change \"{reference}\" is not deployed"))
                })?;
            Some(position)
        }
        None => None,
    };
    let suffix_start = keep_through.map_or(0, |p| p + 1);
    let to_revert = &deployed[suffix_start..];
    if to_revert.is_empty() {
        reporter.info("Nothing to revert (already at target)");
        return Ok(0);
    }

    if !opts.yes {
        let question = match &opts.to {
            Some(reference) => format!(
                "Revert {} changes to {} from {}?",
                to_revert.len(),
                reference,
                ctx.target.name
            ),
            None => format!(
                "Revert all ({}) changes from {}?",
                to_revert.len(),
                ctx.target.name
            ),
        };
        if !confirm(&question)? {
            return Err(SqlitchError::Aborted("Revert aborted by user.".to_string()).into());
        }
    }

    let by_id: BTreeMap<&str, usize> = ctx
        .plan
        .changes()
        .iter()
        .enumerate()
        .map(|(i, c)| (c.change_id.as_str(), i))
        .collect();

    let workspace = adapter.connect_workspace()?;
    adapter.attach_registry(&workspace)?;

    let mut count = 0usize;
    let result = (|| -> Result<()> {
        for change in to_revert.iter().rev() {
            let plan_idx = *by_id.get(change.change_id.as_str()).ok_or_else(|| {
                SqlitchError::Plan(format!(
                    "Deployed change \"{}\" ({}) is not in the plan",
                    change.name, change.change_id
                ))
            })?;
            let script_name = ctx.plan.script_name(plan_idx);
            let path = ctx.script_path("revert", &script_name);
            let script = Script::load(&path).map_err(|e| {
                SqlitchError::Plan(format!(
                    "missing revert script for change \"{}\": {e}",
                    change.name
                ))
            })?;

            let mode = transaction_mode(&script.content);
            adapter
                .execute_script(&workspace, &script.content, mode)
                .map_err(|e| {
                    SqlitchError::Script(format!(
                        "Revert failed for change \"{}\": {e}",
                        change.name
                    ))
                })?;
            recorder.record_revert(&change.change_id, ctx.identity)?;
            reporter.emit(&format!("- {}", change.name));
            count += 1;
        }
        Ok(())
    })();

    adapter.detach_registry(&workspace).ok();
    result?;
    Ok(count)
}

/// Verify report: counts rendered in the summary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyReport {
    pub changes: usize,
    pub errors: usize,
}

impl VerifyReport {
    pub fn succeeded(&self) -> bool {
        self.errors == 0
    }
}

/// Run verify scripts for every deployed change, each inside an
/// always-rolled-back transaction.
pub fn verify(ctx: &ExecutionContext<'_>, reporter: &mut dyn Reporter) -> Result<VerifyReport> {
    let adapter = engine::create_engine(ctx.target)?;
    let registry_conn = adapter.connect_registry()?;
    if crate::registry::registry_version(&registry_conn)?.is_none() {
        reporter.emit("No changes to verify.");
        return Ok(VerifyReport {
            changes: 0,
            errors: 0,
        });
    }
    let recorder = Recorder::new(&registry_conn, &ctx.plan.project);
    let deployed = recorder.deployed_changes()?;
    if deployed.is_empty() {
        reporter.emit("No changes to verify.");
        return Ok(VerifyReport {
            changes: 0,
            errors: 0,
        });
    }

    let by_id: BTreeMap<&str, usize> = ctx
        .plan
        .changes()
        .iter()
        .enumerate()
        .map(|(i, c)| (c.change_id.as_str(), i))
        .collect();

    let workspace = adapter.connect_workspace()?;
    adapter.attach_registry(&workspace)?;

    let mut errors = 0usize;
    for change in &deployed {
        let script_name = match by_id.get(change.change_id.as_str()) {
            Some(idx) => ctx.plan.script_name(*idx),
            None => change.name.clone(),
        };
        let path = ctx.script_path("verify", &script_name);
        if !path.exists() {
            reporter.emit(&format!("# {} .. SKIP (no verify script)", change.name));
            continue;
        }
        let script = Script::load(&path)?;
        match adapter.execute_rolled_back(&workspace, &script.content) {
            Ok(()) => reporter.emit(&format!("* {} .. ok", change.name)),
            Err(err) => {
                reporter.emit(&format!("# {} .. NOT OK", change.name));
                reporter.error(&format!("  Error: {err}"));
                errors += 1;
            }
        }
    }
    adapter.detach_registry(&workspace).ok();

    reporter.emit("");
    reporter.emit("Verify Summary Report");
    reporter.emit(&format!("Changes: {}", deployed.len()));
    reporter.emit(&format!("Errors:  {errors}"));

    Ok(VerifyReport {
        changes: deployed.len(),
        errors,
    })
}

/// Current deployment state for `status`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct StatusReport {
    pub project: String,
    pub target: String,
    /// Most recently deployed change, if any.
    pub change_id: Option<String>,
    pub change: Option<String>,
    pub committed_at: Option<String>,
    pub tags: Vec<String>,
    /// Plan changes not yet deployed, in deploy order.
    pub undeployed: Vec<String>,
    /// Most recent event when it reports a failure.
    pub failure: Option<RegistryEvent>,
}

impl StatusReport {
    pub fn is_up_to_date(&self) -> bool {
        self.undeployed.is_empty()
    }
}

/// Read the current deployment state from the registry.
pub fn status(ctx: &ExecutionContext<'_>) -> Result<StatusReport> {
    let adapter = engine::create_engine(ctx.target)?;
    let registry_conn = adapter.connect_registry()?;

    let mut report = StatusReport {
        project: ctx.plan.project.clone(),
        target: ctx.target.name.clone(),
        change_id: None,
        change: None,
        committed_at: None,
        tags: Vec::new(),
        undeployed: ctx.plan.changes().iter().map(|c| c.name.clone()).collect(),
        failure: None,
    };
    if crate::registry::registry_version(&registry_conn)?.is_none() {
        return Ok(report);
    }

    let recorder = Recorder::new(&registry_conn, &ctx.plan.project);
    let deployed = recorder.deployed_changes()?;
    let deployed_ids: BTreeSet<&str> = deployed.iter().map(|c| c.change_id.as_str()).collect();

    if let Some(last) = deployed.last() {
        report.change_id = Some(last.change_id.clone());
        report.change = Some(last.name.clone());
        report.committed_at = Some(last.committed_at.clone());
        report.tags = recorder.tags_for_change(&last.change_id)?;
    }
    report.undeployed = ctx
        .plan
        .changes()
        .iter()
        .filter(|c| !deployed_ids.contains(c.change_id.as_str()))
        .map(|c| c.name.clone())
        .collect();

    if let Some(event) = recorder.last_event()?
        && event.event.ends_with("fail")
    {
        report.failure = Some(event);
    }

    Ok(report)
}

/// Read the event history for `log`.
pub fn log_events(
    ctx: &ExecutionContext<'_>,
    filter: &EventFilter,
) -> Result<Vec<RegistryEvent>> {
    let adapter = engine::create_engine(ctx.target)?;
    let registry_conn = adapter.connect_registry()?;
    if crate::registry::registry_version(&registry_conn)?.is_none() {
        return Ok(Vec::new());
    }
    let recorder = Recorder::new(&registry_conn, &ctx.plan.project);
    recorder.events(filter)
}

/// Apply any pending registry schema migrations.
pub fn upgrade_registry(ctx: &ExecutionContext<'_>) -> Result<RegistryInit> {
    let adapter = engine::create_engine(ctx.target)?;
    adapter.ensure_registry(ctx.identity)
}

/// Timestamp source for new plan entries.
pub fn now() -> chrono::DateTime<Utc> {
    Utc::now()
}
