//! Plan model, parser, and formatter.
//!
//! A plan is an ordered sequence of entries, each a change or a tag, read
//! from a line-oriented UTF-8 file:
//!
//! ```text
//! %syntax-version=1.0.0
//! %project=flipr
//!
//! users 2025-01-01T00:00:00Z Alice <alice@example.com> # Creates users table.
//! flips [users] 2025-01-02T00:00:00Z Alice <alice@example.com> # Adds flips table.
//! @v1.0 2025-01-03T00:00:00Z Alice <alice@example.com> # First release.
//! ```
//!
//! Every change carries a derived `change_id`: a SHA-1 over a canonical
//! serialization of the change's identity fields chained through the
//! preceding change's ID, so two plans with identical content produce
//! identical IDs and reworked duplicates stay distinguishable.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use sha1::{Digest, Sha1};

use crate::error::SqlitchError;
use crate::identity::Identity;

/// Default `%syntax-version` pragma value.
pub const DEFAULT_SYNTAX_VERSION: &str = "1.0.0";

/// A planned schema change backed by deploy/revert/verify scripts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    pub name: String,
    /// Required dependencies, as written (possibly `project:change@tag`).
    pub requires: Vec<String>,
    /// Conflicting changes, stored without the `!` prefix.
    pub conflicts: Vec<String>,
    pub planned_at: DateTime<Utc>,
    pub planner_name: String,
    pub planner_email: String,
    pub note: Option<String>,
    /// Derived identity; a pure function of the fields above plus the
    /// parent chain.
    pub change_id: String,
    /// Names of tags anchored on this change, without the leading `@`.
    pub tags: Vec<String>,
}

/// A labeled anchor attached to the nearest preceding change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag {
    /// Tag name without the leading `@`.
    pub name: String,
    /// Name of the change this tag anchors.
    pub change_ref: String,
    pub tagged_at: DateTime<Utc>,
    pub planner_name: String,
    pub planner_email: String,
    pub note: Option<String>,
    pub tag_id: String,
}

/// One plan file line: a change or a tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanEntry {
    Change(Change),
    Tag(Tag),
}

impl PlanEntry {
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::Change(c) => c.planned_at,
            Self::Tag(t) => t.tagged_at,
        }
    }
}

/// An in-memory plan.
#[derive(Debug, Clone)]
pub struct Plan {
    pub syntax_version: String,
    pub project: String,
    pub uri: Option<String>,
    /// `%default_engine` pragma, when present in the file.
    pub default_engine: Option<String>,
    pub entries: Vec<PlanEntry>,
    /// Soft-invariant warnings gathered during parsing.
    pub warnings: Vec<String>,
}

impl PartialEq for Plan {
    fn eq(&self, other: &Self) -> bool {
        // Warnings are parse artifacts, not plan content.
        self.syntax_version == other.syntax_version
            && self.project == other.project
            && self.uri == other.uri
            && self.default_engine == other.default_engine
            && self.entries == other.entries
    }
}

impl Plan {
    /// An empty plan for a new project.
    pub fn new(project: &str, uri: Option<&str>, default_engine: Option<&str>) -> Result<Self> {
        validate_project_name(project)?;
        Ok(Self {
            syntax_version: DEFAULT_SYNTAX_VERSION.to_string(),
            project: project.to_string(),
            uri: uri.map(str::to_string),
            default_engine: default_engine.map(str::to_string),
            entries: Vec::new(),
            warnings: Vec::new(),
        })
    }

    /// Changes in plan order.
    pub fn changes(&self) -> Vec<&Change> {
        self.entries
            .iter()
            .filter_map(|e| match e {
                PlanEntry::Change(c) => Some(c),
                PlanEntry::Tag(_) => None,
            })
            .collect()
    }

    /// Tags in plan order.
    pub fn tags(&self) -> Vec<&Tag> {
        self.entries
            .iter()
            .filter_map(|e| match e {
                PlanEntry::Tag(t) => Some(t),
                PlanEntry::Change(_) => None,
            })
            .collect()
    }

    /// Entry index of each change, in plan order.
    fn change_entry_indices(&self) -> Vec<usize> {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(i, e)| matches!(e, PlanEntry::Change(_)).then_some(i))
            .collect()
    }

    /// Position of a change ID within the change sequence.
    pub fn index_of_change_id(&self, change_id: &str) -> Option<usize> {
        self.changes().iter().position(|c| c.change_id == change_id)
    }

    /// Last occurrence of `name` within the change sequence, optionally
    /// restricted to positions at or before `limit`.
    pub fn last_index_of(&self, name: &str, limit: Option<usize>) -> Option<usize> {
        let changes = self.changes();
        let upper = limit.map_or(changes.len(), |l| (l + 1).min(changes.len()));
        changes[..upper].iter().rposition(|c| c.name == name)
    }

    /// Change-sequence index of the change anchored by `tag` (without `@`).
    pub fn tag_anchor_index(&self, tag: &str) -> Option<usize> {
        let anchor = self
            .tags()
            .into_iter()
            .find(|t| t.name == tag)
            .map(|t| t.change_ref.clone())?;
        // The anchor is the nearest change with that name preceding the tag
        // entry; the tag's position bounds the search.
        let tag_entry = self.entries.iter().position(
            |e| matches!(e, PlanEntry::Tag(t) if t.name == tag),
        )?;
        let mut last = None;
        let mut seq = 0usize;
        for entry in &self.entries[..tag_entry] {
            if let PlanEntry::Change(c) = entry {
                if c.name == anchor {
                    last = Some(seq);
                }
                seq += 1;
            }
        }
        last
    }

    /// Script base name for the change at change-sequence index `idx`:
    /// `<name>` for the latest occurrence, `<name>@<tag>` for a superseded
    /// (reworked-over) occurrence, where `<tag>` is the first tag after it.
    pub fn script_name(&self, idx: usize) -> String {
        let changes = self.changes();
        let change = changes[idx];
        let is_last = self.last_index_of(&change.name, None) == Some(idx);
        if is_last {
            return change.name.clone();
        }
        let entry_idx = self.change_entry_indices()[idx];
        for entry in &self.entries[entry_idx + 1..] {
            if let PlanEntry::Tag(t) = entry {
                return format!("{}@{}", change.name, t.name);
            }
        }
        change.name.clone()
    }

    /// Resolve a symbolic reference to a change-sequence index.
    ///
    /// Accepts `@HEAD`, `@ROOT`, `@<tag>`, `<name>`, `<name>@<tag>`, an
    /// optional `<project>:` qualifier for this project, and trailing
    /// `^[N]`/`~[N]` offsets.
    pub fn resolve_ref(&self, reference: &str) -> Result<usize> {
        let missing =
            || anyhow::Error::from(SqlitchError::Plan(format!(
                "plan does not contain \"{reference}\""
            )));

        let (base, offset) = split_ref_offset(reference).ok_or_else(missing)?;

        let mut base = base;
        if let Some((project, rest)) = base.split_once(':') {
            if project != self.project {
                return Err(missing());
            }
            base = rest;
        }

        let changes = self.changes();
        if changes.is_empty() {
            return Err(missing());
        }

        let idx = if base == "@HEAD" {
            changes.len() - 1
        } else if base == "@ROOT" {
            0
        } else if let Some(tag) = base.strip_prefix('@') {
            self.tag_anchor_index(tag).ok_or_else(missing)?
        } else if let Some((name, tag)) = base.split_once('@') {
            let limit = self.tag_anchor_index(tag).ok_or_else(missing)?;
            self.last_index_of(name, Some(limit)).ok_or_else(missing)?
        } else {
            self.last_index_of(base, None).ok_or_else(missing)?
        };

        idx.checked_sub(offset).ok_or_else(missing)
    }

    /// Append a change, validating names, uniqueness within the current tag
    /// segment, and dependency resolution.
    pub fn add_change(
        &mut self,
        name: &str,
        requires: &[String],
        conflicts: &[String],
        note: Option<&str>,
        planner: &Identity,
        planned_at: DateTime<Utc>,
    ) -> Result<&Change> {
        validate_change_name(name).map_err(SqlitchError::Plan)?;
        validate_note(note)?;

        let segment_start = self
            .entries
            .iter()
            .rposition(|e| matches!(e, PlanEntry::Tag(_)))
            .map_or(0, |i| i + 1);
        let duplicate = self.entries[segment_start..].iter().any(
            |e| matches!(e, PlanEntry::Change(c) if c.name == name),
        );
        if duplicate {
            return Err(SqlitchError::Plan(format!(
                "Change \"{name}\" already exists in plan; use rework to duplicate it after a tag"
            ))
            .into());
        }

        for dep in requires.iter().chain(conflicts) {
            let parsed = parse_dependency(dep).map_err(SqlitchError::Plan)?;
            self.check_local_dependency(&parsed, dep, self.changes().len())?;
        }

        let parent = self.changes().last().map(|c| c.change_id.clone());
        let change_id = compute_change_id(
            &self.project,
            self.uri.as_deref(),
            name,
            parent.as_deref(),
            requires,
            conflicts,
            &planner.name,
            &planner.email,
            planned_at,
            note,
        );
        self.entries.push(PlanEntry::Change(Change {
            name: name.to_string(),
            requires: requires.to_vec(),
            conflicts: conflicts.to_vec(),
            planned_at,
            planner_name: planner.name.clone(),
            planner_email: planner.email.clone(),
            note: note.map(str::to_string),
            change_id,
            tags: Vec::new(),
        }));

        match self.entries.last() {
            Some(PlanEntry::Change(c)) => Ok(c),
            _ => unreachable!("change was just appended"),
        }
    }

    /// Append a tag anchored on `change` (default: the latest change).
    pub fn add_tag(
        &mut self,
        name: &str,
        change: Option<&str>,
        note: Option<&str>,
        planner: &Identity,
        tagged_at: DateTime<Utc>,
    ) -> Result<&Tag> {
        let name = name.strip_prefix('@').unwrap_or(name);
        validate_tag_name(name).map_err(SqlitchError::Plan)?;
        validate_note(note)?;

        if self.tags().iter().any(|t| t.name == name) {
            return Err(SqlitchError::Plan(format!("Tag \"@{name}\" already exists")).into());
        }

        let anchor_idx = match change {
            Some(change_name) => self
                .last_index_of(change_name, None)
                .ok_or_else(|| SqlitchError::Plan(format!("Unknown change: \"{change_name}\"")))?,
            None => {
                let count = self.changes().len();
                count.checked_sub(1).ok_or_else(|| {
                    SqlitchError::Plan("Cannot apply a tag to an empty plan".to_string())
                })?
            }
        };

        let (anchor_name, anchor_id) = {
            let changes = self.changes();
            let anchor = changes[anchor_idx];
            (anchor.name.clone(), anchor.change_id.clone())
        };
        let tag_id = compute_tag_id(
            &self.project,
            self.uri.as_deref(),
            name,
            &anchor_id,
            &planner.name,
            &planner.email,
            tagged_at,
            note,
        );

        // Record the tag on its anchor change.
        let entry_idx = self.change_entry_indices()[anchor_idx];
        if let PlanEntry::Change(c) = &mut self.entries[entry_idx] {
            c.tags.push(name.to_string());
        }

        self.entries.push(PlanEntry::Tag(Tag {
            name: name.to_string(),
            change_ref: anchor_name,
            tagged_at,
            planner_name: planner.name.clone(),
            planner_email: planner.email.clone(),
            note: note.map(str::to_string),
            tag_id,
        }));

        match self.entries.last() {
            Some(PlanEntry::Tag(t)) => Ok(t),
            _ => unreachable!("tag was just appended"),
        }
    }

    /// Duplicate the latest occurrence of `name` after the most recent tag,
    /// with a fresh timestamp and a new `change_id`.
    ///
    /// Returns the tag the previous instance was sealed under; script files
    /// for that instance move to `<name>@<tag>.sql`.
    pub fn rework(
        &mut self,
        name: &str,
        requires: &[String],
        conflicts: &[String],
        note: Option<&str>,
        planner: &Identity,
        planned_at: DateTime<Utc>,
    ) -> Result<String> {
        let last_idx = self
            .last_index_of(name, None)
            .ok_or_else(|| SqlitchError::Plan(format!("Unknown change: \"{name}\"")))?;
        let last_entry_idx = self.change_entry_indices()[last_idx];

        let sealing_tag = self.entries[last_entry_idx + 1..]
            .iter()
            .find_map(|e| match e {
                PlanEntry::Tag(t) => Some(t.name.clone()),
                PlanEntry::Change(_) => None,
            })
            .ok_or_else(|| {
                SqlitchError::Plan(format!(
                    "Cannot rework \"{name}\": change has not been tagged since it was added"
                ))
            })?;

        // The reworked instance implicitly requires its predecessor as of
        // the sealing tag.
        let mut all_requires = vec![format!("{name}@{sealing_tag}")];
        all_requires.extend(requires.iter().cloned());

        let parent = self.changes().last().map(|c| c.change_id.clone());
        let change_id = compute_change_id(
            &self.project,
            self.uri.as_deref(),
            name,
            parent.as_deref(),
            &all_requires,
            conflicts,
            &planner.name,
            &planner.email,
            planned_at,
            note,
        );
        self.entries.push(PlanEntry::Change(Change {
            name: name.to_string(),
            requires: all_requires,
            conflicts: conflicts.to_vec(),
            planned_at,
            planner_name: planner.name.clone(),
            planner_email: planner.email.clone(),
            note: note.map(str::to_string),
            change_id,
            tags: Vec::new(),
        }));

        Ok(sealing_tag)
    }

    fn check_local_dependency(
        &self,
        dep: &DependencyRef,
        raw: &str,
        position: usize,
    ) -> Result<()> {
        if let Some(project) = &dep.project
            && project != &self.project
        {
            // External project: shape-validated only.
            return Ok(());
        }
        if dep.conflict {
            return Ok(());
        }
        let limit = match &dep.tag {
            Some(tag) => Some(self.tag_anchor_index(tag).ok_or_else(|| {
                SqlitchError::Plan(format!("Unknown tag \"@{tag}\" in dependency \"{raw}\""))
            })?),
            None => position.checked_sub(1),
        };
        if dep.change.is_empty() {
            // A bare `@tag` dependency resolves to the tag's anchor.
            return Ok(());
        }
        let resolved = match limit {
            Some(limit) => self.last_index_of(&dep.change, Some(limit)),
            None => None,
        };
        if resolved.is_none() {
            return Err(SqlitchError::Plan(format!(
                "Unknown dependency \"{raw}\"; it must reference an earlier change"
            ))
            .into());
        }
        Ok(())
    }
}

/// A parsed dependency reference: `[!][project:]change[@tag]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyRef {
    pub conflict: bool,
    pub project: Option<String>,
    pub change: String,
    pub tag: Option<String>,
}

/// Parse and shape-validate a dependency reference.
pub fn parse_dependency(raw: &str) -> Result<DependencyRef, String> {
    let (conflict, rest) = match raw.strip_prefix('!') {
        Some(rest) => (true, rest),
        None => (false, raw),
    };
    let (project, rest) = match rest.split_once(':') {
        Some((project, rest)) => {
            validate_project_name_str(project)?;
            (Some(project.to_string()), rest)
        }
        None => (None, rest),
    };
    let (change, tag) = match rest.split_once('@') {
        Some((change, tag)) => {
            validate_tag_name(tag)?;
            (change, Some(tag.to_string()))
        }
        None => (rest, None),
    };
    if !change.is_empty() {
        validate_change_name(change)?;
    } else if tag.is_none() {
        return Err(format!("Invalid dependency \"{raw}\""));
    }
    Ok(DependencyRef {
        conflict,
        project,
        change: change.to_string(),
        tag,
    })
}

/// Split a trailing `^N`/`~N` offset chain off a symbolic reference.
fn split_ref_offset(reference: &str) -> Option<(&str, usize)> {
    let cut = reference.find(['^', '~']).unwrap_or(reference.len());
    let (base, suffix) = reference.split_at(cut);
    if base.is_empty() {
        return None;
    }

    let mut offset = 0usize;
    let mut chars = suffix.chars().peekable();
    while let Some(op) = chars.next() {
        if op != '^' && op != '~' {
            return None;
        }
        let mut digits = String::new();
        while let Some(c) = chars.peek().filter(|c| c.is_ascii_digit()) {
            digits.push(*c);
            chars.next();
        }
        offset += if digits.is_empty() {
            1
        } else {
            digits.parse::<usize>().ok()?
        };
    }
    Some((base, offset))
}

/// Change names cannot be empty, contain whitespace, or contain `@`.
pub fn validate_change_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("Change name cannot be empty".to_string());
    }
    if name.chars().any(char::is_whitespace) {
        return Err(format!("Change name \"{name}\" cannot contain whitespace"));
    }
    if name.contains('@') {
        return Err(format!("Change name \"{name}\" cannot contain @"));
    }
    if name.contains('[') || name.contains(']') || name.contains('#') {
        return Err(format!("Change name \"{name}\" contains reserved characters"));
    }
    Ok(())
}

/// Tag names cannot be empty, start with `@`, or contain whitespace.
pub fn validate_tag_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("Tag name cannot be empty".to_string());
    }
    if name.starts_with('@') {
        return Err(format!("Tag name \"{name}\" cannot start with @"));
    }
    if name.chars().any(char::is_whitespace) {
        return Err(format!("Tag name \"{name}\" cannot contain whitespace"));
    }
    Ok(())
}

fn validate_project_name_str(name: &str) -> Result<(), String> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) if first.is_ascii_alphabetic() => {
            chars.all(|c| c.is_alphanumeric() || c == '-' || c == '_')
        }
        _ => false,
    };
    if valid {
        Ok(())
    } else {
        Err(format!("Invalid project name \"{name}\""))
    }
}

fn validate_project_name(name: &str) -> Result<()> {
    validate_project_name_str(name)
        .map_err(|msg| SqlitchError::Plan(msg).into())
}

fn validate_note(note: Option<&str>) -> Result<()> {
    if let Some(note) = note
        && note.contains('\n')
    {
        return Err(SqlitchError::Plan("Notes must be a single line".to_string()).into());
    }
    Ok(())
}

/// Canonical timestamp rendering: ISO-8601 UTC with a `Z` suffix.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Compute a change's derived identity.
///
/// The digest covers a framed info document (`change <len>\0<doc>`) listing
/// the project, name, parent ID, dependencies, planner, and planned
/// timestamp, so identical content always produces identical IDs.
#[allow(clippy::too_many_arguments)]
pub fn compute_change_id(
    project: &str,
    uri: Option<&str>,
    name: &str,
    parent: Option<&str>,
    requires: &[String],
    conflicts: &[String],
    planner_name: &str,
    planner_email: &str,
    planned_at: DateTime<Utc>,
    note: Option<&str>,
) -> String {
    let mut info = format!("project {project}\n");
    if let Some(uri) = uri {
        info.push_str(&format!("uri {uri}\n"));
    }
    info.push_str(&format!("change {name}\n"));
    if let Some(parent) = parent {
        info.push_str(&format!("parent {parent}\n"));
    }
    if !requires.is_empty() {
        info.push_str("requires\n");
        for dep in requires {
            info.push_str(&format!("  {dep}\n"));
        }
    }
    if !conflicts.is_empty() {
        info.push_str("conflicts\n");
        for dep in conflicts {
            info.push_str(&format!("  {dep}\n"));
        }
    }
    info.push_str(&format!(
        "planner {planner_name} <{planner_email}>\ndate {}\n",
        format_timestamp(planned_at)
    ));
    if let Some(note) = note {
        info.push_str(&format!("\n{note}\n"));
    }
    sha1_object("change", &info)
}

/// Compute a tag's derived identity, chained through its anchor change.
#[allow(clippy::too_many_arguments)]
pub fn compute_tag_id(
    project: &str,
    uri: Option<&str>,
    name: &str,
    change_id: &str,
    planner_name: &str,
    planner_email: &str,
    tagged_at: DateTime<Utc>,
    note: Option<&str>,
) -> String {
    let mut info = format!("project {project}\n");
    if let Some(uri) = uri {
        info.push_str(&format!("uri {uri}\n"));
    }
    info.push_str(&format!("tag @{name}\nchange {change_id}\n"));
    info.push_str(&format!(
        "planner {planner_name} <{planner_email}>\ndate {}\n",
        format_timestamp(tagged_at)
    ));
    if let Some(note) = note {
        info.push_str(&format!("\n{note}\n"));
    }
    sha1_object("tag", &info)
}

fn sha1_object(kind: &str, info: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(format!("{kind} {}\0", info.len()).as_bytes());
    hasher.update(info.as_bytes());
    hex::encode(hasher.finalize())
}

/// Parse a plan file.
pub fn parse_plan(path: &Path, default_engine: Option<&str>) -> Result<Plan> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read plan file {}", path.display()))?;
    parse_plan_text(&text, path, default_engine, false)
}

/// Parse plan text, attributing errors to `file`.
///
/// In strict mode the soft ordering invariant (non-decreasing timestamps)
/// rejects instead of warning. The `default_engine` parameter fills in only
/// when the plan omits `%default_engine`.
pub fn parse_plan_text(
    text: &str,
    file: &Path,
    default_engine: Option<&str>,
    strict: bool,
) -> Result<Plan> {
    let err = |line: usize, message: String| -> anyhow::Error {
        SqlitchError::PlanParse {
            file: file.to_path_buf(),
            line,
            message,
        }
        .into()
    };

    let mut syntax_version: Option<String> = None;
    let mut project: Option<String> = None;
    let mut uri: Option<String> = None;
    let mut engine_pragma: Option<String> = None;

    let mut entries: Vec<PlanEntry> = Vec::new();
    let mut warnings: Vec<String> = Vec::new();
    let mut seen_tags: BTreeSet<String> = BTreeSet::new();
    let mut segment_names: BTreeSet<String> = BTreeSet::new();
    let mut parent_id: Option<String> = None;
    let mut previous_ts: Option<DateTime<Utc>> = None;

    // First pass collects entries; tag anchors and dependencies are
    // validated as lines arrive, against what precedes them.
    let mut plan = Plan {
        syntax_version: DEFAULT_SYNTAX_VERSION.to_string(),
        project: String::new(),
        uri: None,
        default_engine: None,
        entries: Vec::new(),
        warnings: Vec::new(),
    };

    for (idx, raw_line) in text.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw_line.trim_end();
        let trimmed = line.trim_start();

        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        if let Some(pragma) = trimmed.strip_prefix('%') {
            let (key, value) = pragma
                .split_once('=')
                .ok_or_else(|| err(line_no, format!("malformed pragma \"{line}\"")))?;
            match key.trim() {
                "syntax-version" => syntax_version = Some(value.trim().to_string()),
                "project" => {
                    let value = value.trim();
                    validate_project_name_str(value).map_err(|msg| err(line_no, msg))?;
                    project = Some(value.to_string());
                    plan.project = value.to_string();
                }
                "uri" => {
                    uri = Some(value.trim().to_string());
                    plan.uri = uri.clone();
                }
                "default_engine" | "default-engine" => {
                    engine_pragma = Some(value.trim().to_string());
                }
                // Unknown pragmas are tolerated and discarded.
                _ => {}
            }
            continue;
        }

        if project.is_none() {
            return Err(err(line_no, "missing %project pragma".to_string()));
        }

        let entry = parse_entry(trimmed).map_err(|msg| err(line_no, msg))?;

        if strict
            && let Some(prev) = previous_ts
            && entry.timestamp < prev
        {
            return Err(err(
                line_no,
                format!("timestamp moves backwards at \"{}\"", entry.name),
            ));
        }
        if let Some(prev) = previous_ts
            && entry.timestamp < prev
        {
            warnings.push(format!(
                "{}:{}: timestamp moves backwards at \"{}\"",
                file.display(),
                line_no,
                entry.name
            ));
        }
        previous_ts = Some(entry.timestamp);

        plan.entries = entries.clone();
        if entry.is_tag {
            if entries.is_empty() {
                return Err(err(
                    line_no,
                    format!("tag \"@{}\" precedes any change", entry.name),
                ));
            }
            if !seen_tags.insert(entry.name.clone()) {
                return Err(err(line_no, format!("duplicate tag \"@{}\"", entry.name)));
            }
            validate_tag_name(&entry.name).map_err(|msg| err(line_no, msg))?;

            let anchor = entries.iter().rev().find_map(|e| match e {
                PlanEntry::Change(c) => Some((c.name.clone(), c.change_id.clone())),
                PlanEntry::Tag(_) => None,
            });
            let Some((anchor_name, anchor_id)) = anchor else {
                return Err(err(
                    line_no,
                    format!("tag \"@{}\" precedes any change", entry.name),
                ));
            };

            let tag_id = compute_tag_id(
                project.as_deref().unwrap_or_default(),
                uri.as_deref(),
                &entry.name,
                &anchor_id,
                &entry.planner_name,
                &entry.planner_email,
                entry.timestamp,
                entry.note.as_deref(),
            );
            // Record the tag on its anchor change.
            if let Some(PlanEntry::Change(c)) = entries
                .iter_mut()
                .rev()
                .find(|e| matches!(e, PlanEntry::Change(_)))
            {
                c.tags.push(entry.name.clone());
            }
            entries.push(PlanEntry::Tag(Tag {
                name: entry.name,
                change_ref: anchor_name,
                tagged_at: entry.timestamp,
                planner_name: entry.planner_name,
                planner_email: entry.planner_email,
                note: entry.note,
                tag_id,
            }));
            segment_names.clear();
        } else {
            validate_change_name(&entry.name).map_err(|msg| err(line_no, msg))?;
            if !segment_names.insert(entry.name.clone()) {
                return Err(err(
                    line_no,
                    format!(
                        "change \"{}\" appears twice between tags",
                        entry.name
                    ),
                ));
            }

            let position = entries
                .iter()
                .filter(|e| matches!(e, PlanEntry::Change(_)))
                .count();
            for raw in entry.requires.iter().chain(&entry.conflicts) {
                let dep = parse_dependency(raw).map_err(|msg| err(line_no, msg))?;
                plan.check_local_dependency(&dep, raw, position)
                    .map_err(|e| err(line_no, e.to_string()))?;
            }

            let change_id = compute_change_id(
                project.as_deref().unwrap_or_default(),
                uri.as_deref(),
                &entry.name,
                parent_id.as_deref(),
                &entry.requires,
                &entry.conflicts,
                &entry.planner_name,
                &entry.planner_email,
                entry.timestamp,
                entry.note.as_deref(),
            );
            parent_id = Some(change_id.clone());
            entries.push(PlanEntry::Change(Change {
                name: entry.name,
                requires: entry.requires,
                conflicts: entry.conflicts,
                planned_at: entry.timestamp,
                planner_name: entry.planner_name,
                planner_email: entry.planner_email,
                note: entry.note,
                change_id,
                tags: Vec::new(),
            }));
        }
    }

    let project = project.ok_or_else(|| {
        SqlitchError::PlanParse {
            file: file.to_path_buf(),
            line: 0,
            message: "missing %project pragma".to_string(),
        }
    })?;

    Ok(Plan {
        syntax_version: syntax_version.unwrap_or_else(|| DEFAULT_SYNTAX_VERSION.to_string()),
        project,
        uri,
        default_engine: engine_pragma.or_else(|| default_engine.map(str::to_string)),
        entries,
        warnings,
    })
}

struct RawEntry {
    is_tag: bool,
    name: String,
    requires: Vec<String>,
    conflicts: Vec<String>,
    timestamp: DateTime<Utc>,
    planner_name: String,
    planner_email: String,
    note: Option<String>,
}

fn parse_entry(line: &str) -> Result<RawEntry, String> {
    let (is_tag, rest) = match line.strip_prefix('@') {
        Some(rest) => (true, rest),
        None => (false, line),
    };

    let (name, rest) = rest
        .split_once(char::is_whitespace)
        .ok_or_else(|| format!("malformed entry \"{line}\""))?;
    let mut rest = rest.trim_start();

    let mut requires = Vec::new();
    let mut conflicts = Vec::new();
    if !is_tag && rest.starts_with('[') {
        let close = rest
            .find(']')
            .ok_or_else(|| format!("unterminated dependency block in \"{line}\""))?;
        for dep in rest[1..close].split_whitespace() {
            if let Some(conflict) = dep.strip_prefix('!') {
                conflicts.push(conflict.to_string());
            } else {
                requires.push(dep.to_string());
            }
        }
        rest = rest[close + 1..].trim_start();
    }

    let (ts_token, rest) = rest
        .split_once(char::is_whitespace)
        .ok_or_else(|| format!("missing planner in \"{line}\""))?;
    let timestamp = DateTime::parse_from_rfc3339(ts_token)
        .map_err(|_| format!("invalid timestamp \"{ts_token}\""))?
        .with_timezone(&Utc);

    let rest = rest.trim_start();
    let lt = rest
        .find('<')
        .ok_or_else(|| format!("missing planner email in \"{line}\""))?;
    let gt = rest[lt..]
        .find('>')
        .map(|i| lt + i)
        .ok_or_else(|| format!("unterminated planner email in \"{line}\""))?;

    let planner_name = rest[..lt].trim().to_string();
    let planner_email = rest[lt + 1..gt].trim().to_string();
    if planner_name.is_empty() || planner_email.is_empty() {
        return Err(format!("malformed planner in \"{line}\""));
    }

    let tail = rest[gt + 1..].trim_start();
    let note = if tail.is_empty() {
        None
    } else if let Some(note) = tail.strip_prefix('#') {
        Some(note.trim().to_string()).filter(|n| !n.is_empty())
    } else {
        return Err(format!("unexpected trailing content \"{tail}\""));
    };

    Ok(RawEntry {
        is_tag,
        name: name.to_string(),
        requires,
        conflicts,
        timestamp,
        planner_name,
        planner_email,
        note,
    })
}

/// Render a plan in canonical file form.
pub fn format_plan(plan: &Plan) -> String {
    let mut out = String::new();
    out.push_str(&format!("%syntax-version={}\n", plan.syntax_version));
    out.push_str(&format!("%project={}\n", plan.project));
    if let Some(uri) = &plan.uri {
        out.push_str(&format!("%uri={uri}\n"));
    }
    if let Some(engine) = &plan.default_engine {
        out.push_str(&format!("%default_engine={engine}\n"));
    }
    out.push('\n');

    for entry in &plan.entries {
        match entry {
            PlanEntry::Change(c) => {
                out.push_str(&c.name);
                if !c.requires.is_empty() || !c.conflicts.is_empty() {
                    let mut deps: Vec<String> = c.requires.clone();
                    deps.extend(c.conflicts.iter().map(|d| format!("!{d}")));
                    out.push_str(&format!(" [{}]", deps.join(" ")));
                }
                out.push_str(&format!(
                    " {} {} <{}>",
                    format_timestamp(c.planned_at),
                    c.planner_name,
                    c.planner_email
                ));
                if let Some(note) = &c.note {
                    out.push_str(&format!(" # {note}"));
                }
                out.push('\n');
            }
            PlanEntry::Tag(t) => {
                out.push_str(&format!(
                    "@{} {} {} <{}>",
                    t.name,
                    format_timestamp(t.tagged_at),
                    t.planner_name,
                    t.planner_email
                ));
                if let Some(note) = &t.note {
                    out.push_str(&format!(" # {note}"));
                }
                out.push('\n');
            }
        }
    }
    out
}

/// Write a plan atomically.
pub fn write_plan(plan: &Plan, path: &Path) -> Result<()> {
    sqlitch_fsutil::atomic_write(path, format_plan(plan).as_bytes())
}

/// Resolve the plan file for a project root, honoring the override first.
pub fn resolve_plan_path(root: &Path, override_path: Option<&Path>) -> Result<Option<PathBuf>> {
    if let Some(path) = override_path {
        let path = if path.is_absolute() {
            path.to_path_buf()
        } else {
            root.join(path)
        };
        return Ok(Some(path));
    }
    let resolution = sqlitch_fsutil::resolve_plan_file(root).map_err(SqlitchError::ArtifactConflict)?;
    Ok(resolution.path)
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    const SAMPLE: &str = "\
%syntax-version=1.0.0
%project=flipr
%uri=https://github.com/sqitchers/sqitch-sqlite-intro/

users 2025-01-01T00:00:00Z Alice <alice@example.com> # Creates users table.
flips [users] 2025-01-02T00:00:00Z Alice <alice@example.com> # Adds flips table.
@v1.0 2025-01-03T00:00:00Z Alice <alice@example.com> # First release.
";

    fn sample_plan() -> Plan {
        parse_plan_text(SAMPLE, Path::new("sqitch.plan"), None, false).expect("parse")
    }

    fn alice() -> Identity {
        Identity {
            name: "Alice".into(),
            email: "alice@example.com".into(),
        }
    }

    fn ts(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s)
            .expect("timestamp")
            .with_timezone(&Utc)
    }

    #[test]
    fn parses_the_reference_example() {
        let plan = sample_plan();
        assert_eq!(plan.project, "flipr");
        assert_eq!(
            plan.uri.as_deref(),
            Some("https://github.com/sqitchers/sqitch-sqlite-intro/")
        );
        assert_eq!(plan.entries.len(), 3);

        let changes = plan.changes();
        assert_eq!(changes[0].name, "users");
        assert_eq!(changes[1].name, "flips");
        assert_eq!(changes[1].requires, vec!["users".to_string()]);
        assert_eq!(changes[1].tags, vec!["v1.0".to_string()]);

        let tags = plan.tags();
        assert_eq!(tags[0].name, "v1.0");
        assert_eq!(tags[0].change_ref, "flips");
        assert_eq!(tags[0].note.as_deref(), Some("First release."));
    }

    #[test]
    fn round_trip_is_byte_identical() {
        let plan = sample_plan();
        assert_eq!(format_plan(&plan), SAMPLE);
    }

    #[test]
    fn reparse_of_formatted_plan_is_field_identical() {
        let plan = sample_plan();
        let reparsed = parse_plan_text(
            &format_plan(&plan),
            Path::new("sqitch.plan"),
            None,
            false,
        )
        .expect("reparse");
        assert_eq!(plan, reparsed);
        // Including computed change IDs.
        assert_eq!(
            plan.changes()
                .iter()
                .map(|c| c.change_id.clone())
                .collect::<Vec<_>>(),
            reparsed
                .changes()
                .iter()
                .map(|c| c.change_id.clone())
                .collect::<Vec<_>>()
        );
    }

    #[test]
    fn change_ids_are_deterministic_and_parent_chained() {
        let a = sample_plan();
        let b = sample_plan();
        assert_eq!(a.changes()[1].change_id, b.changes()[1].change_id);

        // A different first change shifts every downstream ID.
        let altered = SAMPLE.replace("Creates users table.", "Different note.");
        let c = parse_plan_text(&altered, Path::new("sqitch.plan"), None, false).expect("parse");
        assert_ne!(a.changes()[0].change_id, c.changes()[0].change_id);
        assert_ne!(a.changes()[1].change_id, c.changes()[1].change_id);
    }

    #[test]
    fn default_engine_parameter_fills_only_when_pragma_absent() {
        let plan = parse_plan_text(SAMPLE, Path::new("p"), Some("sqlite"), false).expect("parse");
        assert_eq!(plan.default_engine.as_deref(), Some("sqlite"));

        let with_pragma = SAMPLE.replace(
            "%project=flipr\n",
            "%project=flipr\n%default_engine=pg\n",
        );
        let plan =
            parse_plan_text(&with_pragma, Path::new("p"), Some("sqlite"), false).expect("parse");
        assert_eq!(plan.default_engine.as_deref(), Some("pg"));
    }

    #[test]
    fn tag_before_any_change_is_rejected() {
        let text = "%project=flipr\n\n@v1 2025-01-01T00:00:00Z A <a@b.c>\n";
        let err = parse_plan_text(text, Path::new("p.plan"), None, false).expect_err("reject");
        assert!(err.to_string().contains("p.plan:3"));
        assert!(err.to_string().contains("precedes any change"));
    }

    #[test]
    fn duplicate_change_between_tags_is_rejected() {
        let text = "\
%project=flipr

users 2025-01-01T00:00:00Z A <a@b.c>
users 2025-01-02T00:00:00Z A <a@b.c>
";
        let err = parse_plan_text(text, Path::new("p.plan"), None, false).expect_err("reject");
        assert!(err.to_string().contains("appears twice between tags"));
    }

    #[test]
    fn rework_is_permitted_across_tag_boundaries_with_distinct_ids() {
        let text = "\
%project=flipr

users 2025-01-01T00:00:00Z A <a@b.c>
@v1.0 2025-01-02T00:00:00Z A <a@b.c>
users [users@v1.0] 2025-01-03T00:00:00Z A <a@b.c>
";
        let plan = parse_plan_text(text, Path::new("p.plan"), None, false).expect("parse");
        let changes = plan.changes();
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].name, "users");
        assert_eq!(changes[1].name, "users");
        assert_ne!(changes[0].change_id, changes[1].change_id);

        // The superseded instance's scripts carry the sealing tag.
        assert_eq!(plan.script_name(0), "users@v1.0");
        assert_eq!(plan.script_name(1), "users");
    }

    #[test]
    fn unknown_local_dependency_is_rejected() {
        let text = "\
%project=flipr

flips [users] 2025-01-01T00:00:00Z A <a@b.c>
";
        let err = parse_plan_text(text, Path::new("p.plan"), None, false).expect_err("reject");
        assert!(err.to_string().contains("Unknown dependency"));
    }

    #[test]
    fn external_project_dependencies_are_shape_checked_only() {
        let text = "\
%project=flipr

users [other:base] 2025-01-01T00:00:00Z A <a@b.c>
";
        let plan = parse_plan_text(text, Path::new("p.plan"), None, false).expect("parse");
        assert_eq!(plan.changes()[0].requires, vec!["other:base".to_string()]);
    }

    #[test]
    fn backwards_timestamps_warn_by_default_and_reject_in_strict_mode() {
        let text = "\
%project=flipr

users 2025-01-02T00:00:00Z A <a@b.c>
flips 2025-01-01T00:00:00Z A <a@b.c>
";
        let plan = parse_plan_text(text, Path::new("p.plan"), None, false).expect("parse");
        assert_eq!(plan.warnings.len(), 1);
        assert!(plan.warnings[0].contains("timestamp moves backwards"));

        let err = parse_plan_text(text, Path::new("p.plan"), None, true).expect_err("strict");
        assert!(err.to_string().contains("timestamp moves backwards"));
    }

    #[test]
    fn symbolic_references_resolve() {
        let plan = sample_plan();
        assert_eq!(plan.resolve_ref("@HEAD").expect("head"), 1);
        assert_eq!(plan.resolve_ref("@ROOT").expect("root"), 0);
        assert_eq!(plan.resolve_ref("@v1.0").expect("tag"), 1);
        assert_eq!(plan.resolve_ref("users").expect("name"), 0);
        assert_eq!(plan.resolve_ref("@HEAD^").expect("offset"), 0);
        assert_eq!(plan.resolve_ref("@HEAD~1").expect("offset"), 0);
        assert_eq!(plan.resolve_ref("flipr:flips").expect("qualified"), 1);

        let err = plan.resolve_ref("missing").expect_err("unknown");
        assert!(err.to_string().contains("plan does not contain"));
        let err = plan.resolve_ref("@ROOT^").expect_err("before root");
        assert!(err.to_string().contains("plan does not contain"));
    }

    #[test]
    fn name_at_tag_resolves_the_occurrence_sealed_by_the_tag() {
        let text = "\
%project=flipr

users 2025-01-01T00:00:00Z A <a@b.c>
@v1.0 2025-01-02T00:00:00Z A <a@b.c>
users [users@v1.0] 2025-01-03T00:00:00Z A <a@b.c>
";
        let plan = parse_plan_text(text, Path::new("p.plan"), None, false).expect("parse");
        assert_eq!(plan.resolve_ref("users@v1.0").expect("sealed"), 0);
        assert_eq!(plan.resolve_ref("users").expect("latest"), 1);
    }

    #[test]
    fn add_change_appends_and_validates() {
        let mut plan = Plan::new("flipr", None, Some("sqlite")).expect("plan");
        plan.add_change("users", &[], &[], Some("Adds users."), &alice(), ts("2025-01-01T00:00:00Z"))
            .expect("add");
        plan.add_change(
            "flips",
            &["users".to_string()],
            &[],
            None,
            &alice(),
            ts("2025-01-02T00:00:00Z"),
        )
        .expect("add");

        let err = plan
            .add_change("users", &[], &[], None, &alice(), ts("2025-01-03T00:00:00Z"))
            .expect_err("duplicate in segment");
        assert!(err.to_string().contains("already exists"));

        let err = plan
            .add_change(
                "widgets",
                &["missing".to_string()],
                &[],
                None,
                &alice(),
                ts("2025-01-03T00:00:00Z"),
            )
            .expect_err("unknown dep");
        assert!(err.to_string().contains("Unknown dependency"));
    }

    #[test]
    fn add_tag_anchors_the_latest_change() {
        let mut plan = Plan::new("flipr", None, None).expect("plan");
        plan.add_change("users", &[], &[], None, &alice(), ts("2025-01-01T00:00:00Z"))
            .expect("add");
        let tag = plan
            .add_tag("v1.0", None, Some("First."), &alice(), ts("2025-01-02T00:00:00Z"))
            .expect("tag");
        assert_eq!(tag.change_ref, "users");
        assert_eq!(plan.changes()[0].tags, vec!["v1.0".to_string()]);

        let err = plan
            .add_tag("v1.0", None, None, &alice(), ts("2025-01-03T00:00:00Z"))
            .expect_err("duplicate tag");
        assert!(err.to_string().contains("already exists"));
    }

    #[test]
    fn rework_requires_an_intervening_tag() {
        let mut plan = Plan::new("flipr", None, None).expect("plan");
        plan.add_change("users", &[], &[], None, &alice(), ts("2025-01-01T00:00:00Z"))
            .expect("add");

        let err = plan
            .rework("users", &[], &[], None, &alice(), ts("2025-01-02T00:00:00Z"))
            .expect_err("untagged");
        assert!(err.to_string().contains("has not been tagged"));

        plan.add_tag("v1.0", None, None, &alice(), ts("2025-01-02T00:00:00Z"))
            .expect("tag");
        let sealed_under = plan
            .rework("users", &[], &[], None, &alice(), ts("2025-01-03T00:00:00Z"))
            .expect("rework");
        assert_eq!(sealed_under, "v1.0");

        let changes = plan.changes();
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[1].requires, vec!["users@v1.0".to_string()]);
        assert_ne!(changes[0].change_id, changes[1].change_id);
    }

    #[test]
    fn dependency_parsing_covers_all_forms() {
        let dep = parse_dependency("users").expect("plain");
        assert_eq!(dep.change, "users");
        assert!(!dep.conflict);

        let dep = parse_dependency("!flips").expect("conflict");
        assert!(dep.conflict);
        assert_eq!(dep.change, "flips");

        let dep = parse_dependency("other:users@v1.0").expect("qualified");
        assert_eq!(dep.project.as_deref(), Some("other"));
        assert_eq!(dep.tag.as_deref(), Some("v1.0"));

        assert!(parse_dependency("bad name").is_err());
    }

    #[test]
    fn notes_must_be_single_line() {
        let mut plan = Plan::new("flipr", None, None).expect("plan");
        let err = plan
            .add_change(
                "users",
                &[],
                &[],
                Some("line one\nline two"),
                &alice(),
                ts("2025-01-01T00:00:00Z"),
            )
            .expect_err("multi-line note");
        assert!(err.to_string().contains("single line"));
    }

    proptest! {
        #[test]
        fn change_ids_are_stable_hex_sha1(
            project in "[a-z][a-z0-9]{0,8}",
            name in "[a-z][a-z0-9_]{0,12}",
            note in proptest::option::of("[ -~]{0,30}"),
        ) {
            let planned = ts("2025-06-01T12:00:00Z");
            let id1 = compute_change_id(
                &project, None, &name, None, &[], &[], "A", "a@b.c", planned, note.as_deref(),
            );
            let id2 = compute_change_id(
                &project, None, &name, None, &[], &[], "A", "a@b.c", planned, note.as_deref(),
            );
            prop_assert_eq!(&id1, &id2);
            prop_assert_eq!(id1.len(), 40);
            prop_assert!(id1.chars().all(|c| c.is_ascii_hexdigit()));
        }

        #[test]
        fn formatted_plans_reparse_equal(
            names in proptest::collection::btree_set("[a-z][a-z0-9]{0,6}", 1..6),
        ) {
            let mut plan = Plan::new("demo", None, None).expect("plan");
            let mut when = ts("2025-01-01T00:00:00Z");
            for name in &names {
                plan.add_change(name, &[], &[], None, &alice(), when).expect("add");
                when = when + chrono::Duration::hours(1);
            }
            let reparsed = parse_plan_text(
                &format_plan(&plan),
                Path::new("p.plan"),
                None,
                false,
            ).expect("reparse");
            prop_assert_eq!(plan, reparsed);
        }
    }
}
