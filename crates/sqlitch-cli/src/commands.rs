//! Command implementations: thin mappings from CLI arguments onto core
//! operations.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use sqlitch_core::config::{
    self, ConfigProfile, ConfigResolveParams, ConfigScope, split_config_key,
};
use sqlitch_core::context::CoreContext;
use sqlitch_core::deploy::{
    self, DeployOptions, ExecutionContext, Reporter, RevertOptions,
};
use sqlitch_core::engine::{EngineTarget, RegistryInit, canonicalize_engine_name};
use sqlitch_core::error::SqlitchError;
use sqlitch_core::identity::{Identity, IdentityOverrides, resolve_identity};
use sqlitch_core::logging::{LogConfig, StructuredLogger, generate_run_id};
use sqlitch_core::plan::{Plan, format_plan, parse_plan, write_plan};
use sqlitch_core::registry::{EventFilter, RegistryEvent};
use sqlitch_core::templates::{TEMPLATE_KINDS, TemplateVars, render_template};

use crate::{Cli, Commands};

pub fn run(cli: &Cli) -> Result<u8> {
    let ctx = core_context(cli)?;
    match &cli.command {
        Commands::Init { project, uri } => init(&ctx, project.as_deref(), uri.as_deref()),
        Commands::Add {
            name,
            requires,
            conflicts,
            note,
        } => add(&ctx, name, requires, conflicts, note.as_deref()),
        Commands::Tag { name, change, note } => {
            tag(&ctx, name.as_deref(), change.as_deref(), note.as_deref())
        }
        Commands::Rework {
            name,
            requires,
            conflicts,
            note,
        } => rework(&ctx, name, requires, conflicts, note.as_deref()),
        Commands::Deploy {
            db_target,
            to_change,
            to_tag,
        } => deploy_cmd(
            &ctx,
            db_target.as_deref(),
            merge_to_ref(to_change.as_deref(), to_tag.as_deref())?,
        ),
        Commands::Revert {
            db_target,
            to,
            to_change,
            to_tag,
            yes,
        } => {
            let to = match to {
                Some(to) => Some(to.clone()),
                None => merge_to_ref(to_change.as_deref(), to_tag.as_deref())?,
            };
            revert_cmd(&ctx, db_target.as_deref(), to, *yes)
        }
        Commands::Verify { db_target } => verify_cmd(&ctx, db_target.as_deref()),
        Commands::Status { db_target } => status_cmd(&ctx, db_target.as_deref()),
        Commands::Log {
            db_target,
            events,
            change,
            limit,
            format,
        } => log_cmd(
            &ctx,
            db_target.as_deref(),
            events,
            change.as_deref(),
            *limit,
            format,
        ),
        Commands::Plan => plan_cmd(&ctx),
        Commands::Show { kind, name } => show_cmd(&ctx, kind, name),
        Commands::Config {
            name,
            value,
            local,
            user,
            system,
            list,
            unset,
        } => config_cmd(
            &ctx,
            name.as_deref(),
            value.as_deref(),
            scope_from_flags(*local, *user, *system)?,
            *list,
            *unset,
        ),
        Commands::Engine { action, name, uri } => {
            engine_cmd(&ctx, action.as_deref(), name.as_deref(), uri.as_deref())
        }
        Commands::Target { action, name, uri } => {
            target_cmd(&ctx, action.as_deref(), name.as_deref(), uri.as_deref())
        }
        Commands::Bundle { dest_dir } => bundle_cmd(&ctx, dest_dir),
        Commands::Rebase {
            db_target,
            onto,
            yes,
        } => rebase_cmd(&ctx, db_target.as_deref(), onto.as_deref(), *yes),
        Commands::Upgrade { db_target } => upgrade_cmd(&ctx, db_target.as_deref()),
    }
}

fn core_context(cli: &Cli) -> Result<CoreContext> {
    let cwd = std::env::current_dir().context("failed to resolve working directory")?;
    let root = match &cli.chdir {
        Some(dir) if dir.is_absolute() => dir.clone(),
        Some(dir) => cwd.join(dir),
        None => cwd,
    };
    let mut ctx = CoreContext::new(root);
    ctx.plan_file = cli.plan_file.clone();
    ctx.engine = cli.engine.clone();
    ctx.target = cli.target.clone();
    ctx.registry = cli.registry.clone();
    ctx.verbosity = cli.verbose;
    ctx.quiet = cli.quiet;
    ctx.json = cli.json;
    Ok(ctx)
}

fn load_profile(ctx: &CoreContext) -> Result<ConfigProfile> {
    config::resolve_config(
        &ctx.project_root,
        &ctx.env,
        &ConfigResolveParams {
            config_root: ctx.config_root.clone(),
            ..ConfigResolveParams::default()
        },
    )
}

fn load_plan(ctx: &CoreContext, profile: &ConfigProfile) -> Result<(Plan, PathBuf)> {
    let override_path = ctx.plan_file_override();
    let path = sqlitch_core::plan::resolve_plan_path(&ctx.project_root, override_path.as_deref())?
        .ok_or_else(|| SqlitchError::Plan("No plan file found".to_string()))?;
    if !path.exists() {
        return Err(SqlitchError::Plan(format!("No plan file found at {}", path.display())).into());
    }
    let plan = parse_plan(&path, profile.active_engine())?;
    Ok((plan, path))
}

fn resolve_engine_name(
    ctx: &CoreContext,
    profile: &ConfigProfile,
    plan: Option<&Plan>,
) -> Result<String> {
    let name = ctx
        .engine
        .as_deref()
        .or_else(|| profile.active_engine())
        .or_else(|| plan.and_then(|p| p.default_engine.as_deref()))
        .ok_or_else(|| {
            SqlitchError::Config(
                "No engine specified; use --engine or set core.engine".to_string(),
            )
        })?;
    Ok(canonicalize_engine_name(name)?.to_string())
}

fn build_target(
    ctx: &CoreContext,
    profile: &ConfigProfile,
    plan: &Plan,
    plan_path: &Path,
    positional: Option<&str>,
) -> Result<EngineTarget> {
    let engine = resolve_engine_name(ctx, profile, Some(plan))?;
    let requested = positional
        .map(str::to_string)
        .or_else(|| ctx.target_override())
        .or_else(|| {
            profile
                .get(&format!("engine \"{engine}\""), "target")
                .map(str::to_string)
        })
        .ok_or_else(|| {
            SqlitchError::Config(
                "A target must be provided via --target or configuration".to_string(),
            )
        })?;

    // A configured alias resolves to its URI; anything else is used as-is.
    let (uri, registry_override, display) = match profile.target_uri(&requested) {
        Some(alias_uri) => (
            alias_uri.to_string(),
            ctx.registry
                .clone()
                .or_else(|| profile.target_registry(&requested).map(str::to_string)),
            requested.clone(),
        ),
        None => (requested.clone(), ctx.registry.clone(), requested.clone()),
    };

    let mut target = sqlitch_core::engine::resolve_engine_target(
        &uri,
        &engine,
        &ctx.project_root,
        plan_path,
        registry_override.as_deref(),
    )?;
    target.name = display;
    Ok(target)
}

fn identity_for(ctx: &CoreContext, profile: &ConfigProfile) -> Result<Identity> {
    resolve_identity(&ctx.env, Some(profile), &IdentityOverrides::default())
}

fn make_logger(ctx: &CoreContext) -> StructuredLogger {
    StructuredLogger::new(LogConfig::from_flags(
        generate_run_id(&ctx.env),
        ctx.json,
        ctx.verbosity,
        ctx.quiet,
    ))
}

struct CliReporter {
    quiet: bool,
}

impl Reporter for CliReporter {
    fn info(&mut self, msg: &str) {
        if !self.quiet {
            println!("{msg}");
        }
    }

    fn warn(&mut self, msg: &str) {
        eprintln!("warning: {msg}");
    }

    fn error(&mut self, msg: &str) {
        eprintln!("{msg}");
    }

    fn emit(&mut self, line: &str) {
        println!("{line}");
    }
}

fn confirm_prompt(question: &str) -> Result<bool> {
    print!("{question} [Yes] ");
    std::io::stdout().flush().ok();
    let mut answer = String::new();
    std::io::stdin()
        .read_line(&mut answer)
        .context("failed to read confirmation")?;
    let answer = answer.trim().to_ascii_lowercase();
    Ok(answer.is_empty() || answer == "y" || answer == "yes")
}

fn merge_to_ref(to_change: Option<&str>, to_tag: Option<&str>) -> Result<Option<String>> {
    match (to_change, to_tag) {
        (Some(_), Some(_)) => Err(SqlitchError::Usage(
            "Specify either --to-change or --to-tag, not both".to_string(),
        )
        .into()),
        (Some(change), None) => Ok(Some(change.to_string())),
        (None, Some(tag)) => Ok(Some(if tag.starts_with('@') {
            tag.to_string()
        } else {
            format!("@{tag}")
        })),
        (None, None) => Ok(None),
    }
}

fn display_path(path: &Path, root: &Path) -> String {
    path.strip_prefix(root).unwrap_or(path).display().to_string()
}

fn init(ctx: &CoreContext, project: Option<&str>, uri: Option<&str>) -> Result<u8> {
    let root = &ctx.project_root;
    fs::create_dir_all(root)
        .with_context(|| format!("failed to create project root {}", root.display()))?;

    let project = match project {
        Some(name) => name.to_string(),
        None => root
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| SqlitchError::Usage("A project name is required".to_string()))?,
    };
    let target = ctx.target.as_deref();
    let engine_name = canonicalize_engine_name(ctx.engine.as_deref().unwrap_or("sqlite"))?;

    let plan_res = sqlitch_fsutil::resolve_plan_file(root).map_err(SqlitchError::ArtifactConflict)?;
    if let Some(existing) = plan_res.path {
        return Err(SqlitchError::Plan(format!(
            "Plan file {} already exists",
            display_path(&existing, root)
        ))
        .into());
    }
    let config_res =
        sqlitch_fsutil::resolve_config_file(root).map_err(SqlitchError::ArtifactConflict)?;
    if let Some(existing) = config_res.path {
        return Err(SqlitchError::Config(format!(
            "Config file {} already exists",
            display_path(&existing, root)
        ))
        .into());
    }
    let templates_root = root.join("etc").join("templates");
    if templates_root.exists() {
        return Err(SqlitchError::Config(format!(
            "Templates directory {} already exists",
            display_path(&templates_root, root)
        ))
        .into());
    }

    let config_path = root.join(sqlitch_fsutil::CONFIG_FILE);
    config::set_config_value(&config_path, "core", "engine", engine_name)?;
    if let Some(target) = target {
        config::set_config_value(
            &config_path,
            &format!("engine \"{engine_name}\""),
            "target",
            target,
        )?;
    }

    let plan_path = root.join(sqlitch_fsutil::PLAN_FILE);
    let plan = Plan::new(&project, uri, None)?;
    write_plan(&plan, &plan_path)?;

    let mut created = vec![
        display_path(&config_path, root),
        display_path(&plan_path, root),
    ];
    for dir in ["deploy", "revert", "verify"] {
        let path = root.join(dir);
        fs::create_dir_all(&path)
            .with_context(|| format!("failed to create {}", path.display()))?;
        created.push(format!("{dir}/"));
    }
    for (kind, body) in TEMPLATE_KINDS {
        let dir = templates_root.join(kind);
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
        fs::write(dir.join(format!("{engine_name}.tmpl")), body)
            .with_context(|| format!("failed to write template under {}", dir.display()))?;
    }
    created.push(format!(
        "templates under {}",
        display_path(&templates_root, root)
    ));

    if !ctx.quiet {
        for item in created {
            println!("Created {item}");
        }
    }
    Ok(0)
}

fn add(
    ctx: &CoreContext,
    name: &str,
    requires: &[String],
    conflicts: &[String],
    note: Option<&str>,
) -> Result<u8> {
    let profile = load_profile(ctx)?;
    let (mut plan, plan_path) = load_plan(ctx, &profile)?;
    let engine = resolve_engine_name(ctx, &profile, Some(&plan))?;
    let identity = identity_for(ctx, &profile)?;

    plan.add_change(name, requires, conflicts, note, &identity, deploy::now())?;
    write_plan(&plan, &plan_path)?;

    let vars = TemplateVars {
        project: &plan.project,
        change: name,
        engine: &engine,
        requires,
        conflicts,
    };
    for (kind, builtin) in TEMPLATE_KINDS {
        let dir = ctx.top_dir().join(kind);
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
        let script_path = dir.join(format!("{name}.sql"));
        if script_path.exists() {
            if !ctx.quiet {
                println!(
                    "Skipped {} (already exists)",
                    display_path(&script_path, &ctx.project_root)
                );
            }
            continue;
        }
        let template_path = ctx
            .project_root
            .join("etc")
            .join("templates")
            .join(kind)
            .join(format!("{engine}.tmpl"));
        let template = if template_path.exists() {
            fs::read_to_string(&template_path)
                .with_context(|| format!("failed to read template {}", template_path.display()))?
        } else {
            builtin.to_string()
        };
        fs::write(&script_path, render_template(&template, &vars))
            .with_context(|| format!("failed to write {}", script_path.display()))?;
        if !ctx.quiet {
            println!("Created {}", display_path(&script_path, &ctx.project_root));
        }
    }
    if !ctx.quiet {
        println!(
            "Added \"{name}\" to {}",
            display_path(&plan_path, &ctx.project_root)
        );
    }
    Ok(0)
}

fn tag(
    ctx: &CoreContext,
    name: Option<&str>,
    change: Option<&str>,
    note: Option<&str>,
) -> Result<u8> {
    let profile = load_profile(ctx)?;
    let (mut plan, plan_path) = load_plan(ctx, &profile)?;

    let Some(name) = name else {
        for tag in plan.tags() {
            println!("@{}", tag.name);
        }
        return Ok(0);
    };

    let identity = identity_for(ctx, &profile)?;
    let anchored = plan
        .add_tag(name, change, note, &identity, deploy::now())?
        .change_ref
        .clone();
    write_plan(&plan, &plan_path)?;
    if !ctx.quiet {
        println!(
            "Tagged \"{anchored}\" with @{} in {}",
            name.trim_start_matches('@'),
            display_path(&plan_path, &ctx.project_root)
        );
    }
    Ok(0)
}

fn rework(
    ctx: &CoreContext,
    name: &str,
    requires: &[String],
    conflicts: &[String],
    note: Option<&str>,
) -> Result<u8> {
    let profile = load_profile(ctx)?;
    let (mut plan, plan_path) = load_plan(ctx, &profile)?;
    let identity = identity_for(ctx, &profile)?;

    let sealing_tag = plan.rework(name, requires, conflicts, note, &identity, deploy::now())?;
    write_plan(&plan, &plan_path)?;

    // The previous instance keeps its scripts under the sealed name; the
    // plain name continues as the reworked content.
    for (kind, _) in TEMPLATE_KINDS {
        let dir = ctx.top_dir().join(kind);
        let current = dir.join(format!("{name}.sql"));
        let sealed = dir.join(format!("{name}@{sealing_tag}.sql"));
        if current.exists() && !sealed.exists() {
            fs::copy(&current, &sealed).with_context(|| {
                format!("failed to copy {} to {}", current.display(), sealed.display())
            })?;
            if !ctx.quiet {
                println!("Copied {} to {}",
                    display_path(&current, &ctx.project_root),
                    display_path(&sealed, &ctx.project_root)
                );
            }
        }
    }
    if !ctx.quiet {
        println!(
            "Added \"{name}\" to {} (reworked after @{sealing_tag})",
            display_path(&plan_path, &ctx.project_root)
        );
    }
    Ok(0)
}

fn deploy_cmd(ctx: &CoreContext, target: Option<&str>, to: Option<String>) -> Result<u8> {
    let profile = load_profile(ctx)?;
    let (plan, plan_path) = load_plan(ctx, &profile)?;
    let engine_target = build_target(ctx, &profile, &plan, &plan_path, target)?;
    let identity = identity_for(ctx, &profile)?;
    let logger = make_logger(ctx);
    let top_dir = ctx.top_dir();

    let exec = ExecutionContext {
        plan: &plan,
        target: &engine_target,
        top_dir: &top_dir,
        identity: &identity,
        logger: &logger,
    };
    let mut reporter = CliReporter { quiet: ctx.quiet };
    deploy::deploy(&exec, &DeployOptions { to }, &mut reporter)?;
    Ok(0)
}

fn revert_cmd(
    ctx: &CoreContext,
    target: Option<&str>,
    to: Option<String>,
    yes: bool,
) -> Result<u8> {
    let profile = load_profile(ctx)?;
    let (plan, plan_path) = load_plan(ctx, &profile)?;
    let engine_target = build_target(ctx, &profile, &plan, &plan_path, target)?;
    let identity = identity_for(ctx, &profile)?;
    let logger = make_logger(ctx);
    let top_dir = ctx.top_dir();

    let exec = ExecutionContext {
        plan: &plan,
        target: &engine_target,
        top_dir: &top_dir,
        identity: &identity,
        logger: &logger,
    };
    let mut reporter = CliReporter { quiet: ctx.quiet };
    let mut confirm = confirm_prompt;
    deploy::revert(
        &exec,
        &RevertOptions { to, yes },
        &mut confirm,
        &mut reporter,
    )?;
    Ok(0)
}

fn verify_cmd(ctx: &CoreContext, target: Option<&str>) -> Result<u8> {
    let profile = load_profile(ctx)?;
    let (plan, plan_path) = load_plan(ctx, &profile)?;
    let engine_target = build_target(ctx, &profile, &plan, &plan_path, target)?;
    let identity = identity_for(ctx, &profile)?;
    let logger = make_logger(ctx);
    let top_dir = ctx.top_dir();

    let exec = ExecutionContext {
        plan: &plan,
        target: &engine_target,
        top_dir: &top_dir,
        identity: &identity,
        logger: &logger,
    };
    let mut reporter = CliReporter { quiet: ctx.quiet };
    let report = deploy::verify(&exec, &mut reporter)?;
    Ok(if report.succeeded() { 0 } else { 1 })
}

fn status_cmd(ctx: &CoreContext, target: Option<&str>) -> Result<u8> {
    let profile = load_profile(ctx)?;
    let (plan, plan_path) = load_plan(ctx, &profile)?;
    let engine_target = build_target(ctx, &profile, &plan, &plan_path, target)?;
    let identity = identity_for(ctx, &profile)?;
    let logger = make_logger(ctx);
    let top_dir = ctx.top_dir();

    let exec = ExecutionContext {
        plan: &plan,
        target: &engine_target,
        top_dir: &top_dir,
        identity: &identity,
        logger: &logger,
    };
    let report = deploy::status(&exec)?;

    if ctx.json {
        println!("{}", serde_json::to_string(&report)?);
        return Ok(0);
    }

    println!("# On database {}", report.target);
    println!("# Project:  {}", report.project);
    if let Some(change_id) = &report.change_id {
        println!("# Change:   {change_id}");
    }
    if let Some(change) = &report.change {
        println!("# Name:     {change}");
    }
    if let Some(committed_at) = &report.committed_at {
        println!("# Deployed: {committed_at}");
    }
    if !report.tags.is_empty() {
        println!("# Tags:     {}", report.tags.join(", "));
    }
    println!("#");
    if let Some(failure) = &report.failure {
        println!(
            "# Last event failed: {} {} at {}",
            failure.event, failure.change, failure.committed_at
        );
        println!("#");
    }
    if report.change.is_none() && report.undeployed.len() == plan.changes().len() {
        println!("No changes deployed");
    }
    if report.is_up_to_date() {
        println!("Nothing to deploy (up-to-date)");
    } else {
        println!("Undeployed changes:");
        for name in &report.undeployed {
            println!("  * {name}");
        }
    }
    Ok(0)
}

const LOG_EVENT_TYPES: [&str; 5] = ["deploy", "deploy_fail", "revert", "fail", "merge"];

fn log_cmd(
    ctx: &CoreContext,
    target: Option<&str>,
    events: &[String],
    change: Option<&str>,
    limit: Option<usize>,
    format: &str,
) -> Result<u8> {
    let format = format.to_ascii_lowercase();
    if format != "human" && format != "json" {
        return Err(SqlitchError::Usage(format!("Unknown format \"{format}\"")).into());
    }
    for event in events {
        if !LOG_EVENT_TYPES.contains(&event.to_ascii_lowercase().as_str()) {
            return Err(SqlitchError::Usage(format!(
                "Unknown event type \"{event}\"; expected one of {}",
                LOG_EVENT_TYPES.join(", ")
            ))
            .into());
        }
    }

    let profile = load_profile(ctx)?;
    let (plan, plan_path) = load_plan(ctx, &profile)?;
    let engine_target = build_target(ctx, &profile, &plan, &plan_path, target)?;
    let identity = identity_for(ctx, &profile)?;
    let logger = make_logger(ctx);
    let top_dir = ctx.top_dir();

    let exec = ExecutionContext {
        plan: &plan,
        target: &engine_target,
        top_dir: &top_dir,
        identity: &identity,
        logger: &logger,
    };
    let filter = EventFilter {
        events: events.to_vec(),
        change: change.map(str::to_string),
        limit,
    };
    let events = deploy::log_events(&exec, &filter)?;

    if ctx.json || format == "json" {
        println!("{}", serde_json::to_string(&events)?);
        return Ok(0);
    }

    println!("On database {}", engine_target.name);
    for event in &events {
        print!("{}", render_event(event));
    }
    Ok(0)
}

fn render_event(event: &RegistryEvent) -> String {
    let label = match event.event.as_str() {
        "deploy" => "Deploy",
        "deploy_fail" => "Deploy Fail",
        "revert" => "Revert",
        "fail" => "Fail",
        "merge" => "Merge",
        other => other,
    };
    let mut out = format!("\n{label} {}\n", event.change_id);
    out.push_str(&format!("Name:      {}\n", event.change));
    if !event.tags.is_empty() {
        out.push_str(&format!("Tags:      {}\n", event.tags));
    }
    out.push_str(&format!(
        "Committer: {} <{}>\n",
        event.committer_name, event.committer_email
    ));
    out.push_str(&format!("Date:      {}\n", event.committed_at));
    if !event.note.is_empty() {
        out.push_str(&format!("\n    {}\n", event.note));
    }
    out
}

fn plan_cmd(ctx: &CoreContext) -> Result<u8> {
    let profile = load_profile(ctx)?;
    let (plan, _) = load_plan(ctx, &profile)?;
    print!("{}", format_plan(&plan));
    Ok(0)
}

fn show_cmd(ctx: &CoreContext, kind: &str, name: &str) -> Result<u8> {
    let profile = load_profile(ctx)?;
    let (plan, _) = load_plan(ctx, &profile)?;

    match kind {
        "change" => {
            let idx = plan
                .last_index_of(name, None)
                .ok_or_else(|| SqlitchError::Plan(format!("Unknown change: \"{name}\"")))?;
            let change = plan.changes()[idx].clone();
            println!("change {}", change.name);
            println!("id {}", change.change_id);
            println!(
                "planner {} <{}>",
                change.planner_name, change.planner_email
            );
            println!("date {}", sqlitch_core::plan::format_timestamp(change.planned_at));
            if !change.requires.is_empty() {
                println!("requires {}", change.requires.join(" "));
            }
            if !change.conflicts.is_empty() {
                println!("conflicts {}", change.conflicts.join(" "));
            }
            if let Some(note) = &change.note {
                println!("note {note}");
            }
            Ok(0)
        }
        "deploy" | "revert" | "verify" => {
            let idx = plan
                .last_index_of(name, None)
                .ok_or_else(|| SqlitchError::Plan(format!("Unknown change: \"{name}\"")))?;
            let script_name = plan.script_name(idx);
            let path = ctx.top_dir().join(kind).join(format!("{script_name}.sql"));
            let content = fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            print!("{content}");
            Ok(0)
        }
        other => {
            Err(SqlitchError::Usage(format!(
                "Unknown show kind \"{other}\"; expected change, deploy, revert, or verify"
            ))
            .into())
        }
    }
}

fn scope_from_flags(local: bool, user: bool, system: bool) -> Result<Option<ConfigScope>> {
    match (local, user, system) {
        (false, false, false) => Ok(None),
        (true, false, false) => Ok(Some(ConfigScope::Local)),
        (false, true, false) => Ok(Some(ConfigScope::User)),
        (false, false, true) => Ok(Some(ConfigScope::System)),
        _ => Err(SqlitchError::Usage("Only one config scope may be specified".to_string()).into()),
    }
}

fn dotted_key(section: &str, key: &str) -> String {
    match section.split_once(" \"") {
        Some((name, sub)) => format!("{name}.{}.{key}", sub.trim_end_matches('"')),
        None => format!("{section}.{key}"),
    }
}

fn scope_config_path(
    ctx: &CoreContext,
    profile: &ConfigProfile,
    scope: ConfigScope,
) -> Result<PathBuf> {
    if let Some(path) = profile.files.get(&scope) {
        return Ok(path.clone());
    }
    let dir = profile
        .scope_dirs
        .get(&scope)
        .cloned()
        .unwrap_or_else(|| ctx.project_root.clone());
    if dir.is_file() {
        return Ok(dir);
    }
    Ok(dir.join(sqlitch_fsutil::CONFIG_FILE))
}

fn config_cmd(
    ctx: &CoreContext,
    name: Option<&str>,
    value: Option<&str>,
    scope: Option<ConfigScope>,
    list: bool,
    unset: bool,
) -> Result<u8> {
    let profile = load_profile(ctx)?;

    if list {
        let settings = match scope {
            Some(scope) => profile.layers.get(&scope).cloned().unwrap_or_default(),
            None => profile.settings.clone(),
        };
        for (section, options) in &settings {
            for (key, value) in options {
                println!("{}={}", dotted_key(section, key), value);
            }
        }
        return Ok(0);
    }

    let Some(name) = name else {
        return Err(SqlitchError::Usage("A config key is required".to_string()).into());
    };
    let (section, key) = split_config_key(name)?;

    if unset {
        let scope = scope.unwrap_or(ConfigScope::Local);
        let path = scope_config_path(ctx, &profile, scope)?;
        config::unset_config_value(&path, &section, &key)?;
        return Ok(0);
    }

    match value {
        Some(value) => {
            let scope = scope.unwrap_or(ConfigScope::Local);
            let path = scope_config_path(ctx, &profile, scope)?;
            config::set_config_value(&path, &section, &key, value)?;
            Ok(0)
        }
        None => {
            let found = match scope {
                Some(scope) => profile.get_in_scope(scope, &section, &key),
                None => profile.get(&section, &key),
            };
            match found {
                Some(value) => {
                    println!("{value}");
                    Ok(0)
                }
                None => Ok(1),
            }
        }
    }
}

fn engine_cmd(
    ctx: &CoreContext,
    action: Option<&str>,
    name: Option<&str>,
    uri: Option<&str>,
) -> Result<u8> {
    let profile = load_profile(ctx)?;
    let action = action.unwrap_or("list");

    match action {
        "list" => {
            for section in profile.settings.keys() {
                if let Some(rest) = section.strip_prefix("engine \"") {
                    let engine = rest.trim_end_matches('"');
                    match profile.get(section, "target") {
                        Some(target) => println!("{engine}\t{target}"),
                        None => println!("{engine}"),
                    }
                }
            }
            Ok(0)
        }
        "add" | "alter" => {
            let name = name.ok_or_else(|| {
                SqlitchError::Usage(format!("Usage: sqlitch engine {action} <name> [uri]"))
            })?;
            let canonical = canonicalize_engine_name(name)?;
            let section = format!("engine \"{canonical}\"");
            if action == "alter" && profile.get(&section, "target").is_none() {
                return Err(SqlitchError::Config(format!(
                    "Unknown engine \"{canonical}\"; add it first"
                ))
                .into());
            }
            let target = uri
                .map(str::to_string)
                .unwrap_or_else(|| format!("db:{canonical}:"));
            let path = scope_config_path(ctx, &profile, ConfigScope::Local)?;
            config::set_config_value(&path, &section, "target", &target)?;
            Ok(0)
        }
        "remove" | "rm" => {
            let name = name.ok_or_else(|| {
                SqlitchError::Usage("Usage: sqlitch engine remove <name>".to_string())
            })?;
            let canonical = canonicalize_engine_name(name)?;
            let path = scope_config_path(ctx, &profile, ConfigScope::Local)?;
            config::remove_config_section(&path, &format!("engine \"{canonical}\""))?;
            Ok(0)
        }
        other => Err(SqlitchError::Usage(format!(
            "Unknown engine action \"{other}\"; expected add, alter, remove, or list"
        ))
        .into()),
    }
}

fn target_cmd(
    ctx: &CoreContext,
    action: Option<&str>,
    name: Option<&str>,
    uri: Option<&str>,
) -> Result<u8> {
    let profile = load_profile(ctx)?;
    let action = action.unwrap_or("list");

    match action {
        "list" => {
            for section in profile.settings.keys() {
                if let Some(rest) = section.strip_prefix("target \"") {
                    let target = rest.trim_end_matches('"');
                    match profile.get(section, "uri") {
                        Some(uri) => println!("{target}\t{uri}"),
                        None => println!("{target}"),
                    }
                }
            }
            Ok(0)
        }
        "show" => {
            let name = name.ok_or_else(|| {
                SqlitchError::Usage("Usage: sqlitch target show <name>".to_string())
            })?;
            match profile.target_uri(name) {
                Some(uri) => {
                    println!("{uri}");
                    Ok(0)
                }
                None => Err(SqlitchError::Config(format!("Unknown target \"{name}\"")).into()),
            }
        }
        "add" | "alter" => {
            let name = name.ok_or_else(|| {
                SqlitchError::Usage(format!("Usage: sqlitch target {action} <name> <uri>"))
            })?;
            let uri = uri.ok_or_else(|| {
                SqlitchError::Usage(format!("Usage: sqlitch target {action} <name> <uri>"))
            })?;
            if action == "add" && profile.target_uri(name).is_some() {
                return Err(
                    SqlitchError::Config(format!("Target \"{name}\" already exists")).into(),
                );
            }
            if action == "alter" && profile.target_uri(name).is_none() {
                return Err(SqlitchError::Config(format!(
                    "Unknown target \"{name}\"; add it first"
                ))
                .into());
            }
            let path = scope_config_path(ctx, &profile, ConfigScope::Local)?;
            config::set_config_value(&path, &format!("target \"{name}\""), "uri", uri)?;
            Ok(0)
        }
        "remove" | "rm" => {
            let name = name.ok_or_else(|| {
                SqlitchError::Usage("Usage: sqlitch target remove <name>".to_string())
            })?;
            let path = scope_config_path(ctx, &profile, ConfigScope::Local)?;
            config::remove_config_section(&path, &format!("target \"{name}\""))?;
            Ok(0)
        }
        other => Err(SqlitchError::Usage(format!(
            "Unknown target action \"{other}\"; expected add, alter, remove, show, or list"
        ))
        .into()),
    }
}

fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    fs::create_dir_all(dst).with_context(|| format!("failed to create {}", dst.display()))?;
    for entry in fs::read_dir(src).with_context(|| format!("failed to read {}", src.display()))? {
        let entry = entry.context("directory entry")?;
        let from = entry.path();
        let to = dst.join(entry.file_name());
        if entry
            .file_type()
            .context("failed to stat directory entry")?
            .is_dir()
        {
            copy_tree(&from, &to)?;
        } else {
            fs::copy(&from, &to)
                .with_context(|| format!("failed to copy {}", from.display()))?;
        }
    }
    Ok(())
}

fn bundle_cmd(ctx: &CoreContext, dest_dir: &Path) -> Result<u8> {
    let profile = load_profile(ctx)?;
    let (_, plan_path) = load_plan(ctx, &profile)?;
    let dest = if dest_dir.is_absolute() {
        dest_dir.to_path_buf()
    } else {
        ctx.project_root.join(dest_dir)
    };
    fs::create_dir_all(&dest).with_context(|| format!("failed to create {}", dest.display()))?;

    let config_res = sqlitch_fsutil::resolve_config_file(&ctx.project_root)
        .map_err(SqlitchError::ArtifactConflict)?;
    if let Some(config_path) = config_res.path
        && let Some(name) = config_path.file_name()
    {
        fs::copy(&config_path, dest.join(name))
            .with_context(|| format!("failed to copy {}", config_path.display()))?;
    }
    if let Some(name) = plan_path.file_name() {
        fs::copy(&plan_path, dest.join(name))
            .with_context(|| format!("failed to copy {}", plan_path.display()))?;
    }

    for dir in ["deploy", "revert", "verify"] {
        let src = ctx.top_dir().join(dir);
        if src.is_dir() {
            copy_tree(&src, &dest.join(dir))?;
        }
    }
    if !ctx.quiet {
        println!("Bundled to {}", display_path(&dest, &ctx.project_root));
    }
    Ok(0)
}

fn rebase_cmd(
    ctx: &CoreContext,
    target: Option<&str>,
    onto: Option<&str>,
    yes: bool,
) -> Result<u8> {
    let code = revert_cmd(ctx, target, onto.map(str::to_string), yes)?;
    if code != 0 {
        return Ok(code);
    }
    deploy_cmd(ctx, target, None)
}

fn upgrade_cmd(ctx: &CoreContext, target: Option<&str>) -> Result<u8> {
    let profile = load_profile(ctx)?;
    let (plan, plan_path) = load_plan(ctx, &profile)?;
    let engine_target = build_target(ctx, &profile, &plan, &plan_path, target)?;
    let identity = identity_for(ctx, &profile)?;
    let logger = make_logger(ctx);
    let top_dir = ctx.top_dir();

    let exec = ExecutionContext {
        plan: &plan,
        target: &engine_target,
        top_dir: &top_dir,
        identity: &identity,
        logger: &logger,
    };
    match deploy::upgrade_registry(&exec)? {
        RegistryInit::Created => {
            println!("Adding registry tables to {}", engine_target.registry_uri);
        }
        RegistryInit::Upgraded(versions) => {
            for version in versions {
                println!("Upgraded registry to {version}");
            }
        }
        RegistryInit::AlreadyCurrent => println!("Registry is up-to-date"),
    }
    Ok(0)
}
