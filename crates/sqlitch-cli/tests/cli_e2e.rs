//! End-to-end scenarios driven through the `sqlitch` binary.
//!
//! Each test runs in an isolated project root with config scopes pinned to
//! scratch directories, so nothing leaks from or into the host's Sqitch
//! configuration.

use std::fs;
use std::path::{Path, PathBuf};

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::{TempDir, tempdir};

struct Project {
    _td: TempDir,
    root: PathBuf,
    system_dir: PathBuf,
    user_dir: PathBuf,
}

impl Project {
    fn new() -> Self {
        let td = tempdir().expect("tempdir");
        let root = td.path().join("proj");
        let system_dir = td.path().join("system");
        let user_dir = td.path().join("user");
        fs::create_dir_all(&root).expect("mkdir");
        fs::create_dir_all(&system_dir).expect("mkdir");
        fs::create_dir_all(&user_dir).expect("mkdir");
        Self {
            _td: td,
            root,
            system_dir,
            user_dir,
        }
    }

    fn sqlitch(&self) -> Command {
        let mut cmd = Command::cargo_bin("sqlitch").expect("binary");
        cmd.current_dir(&self.root)
            .env_clear()
            .env("SQLITCH_SYSTEM_CONFIG", &self.system_dir)
            .env("SQLITCH_USER_CONFIG", &self.user_dir)
            .env("SQLITCH_FULLNAME", "Test User")
            .env("SQLITCH_EMAIL", "test@example.com");
        cmd
    }

    fn path(&self, rel: &str) -> PathBuf {
        self.root.join(rel)
    }

    fn write(&self, rel: &str, content: &str) {
        let path = self.path(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("mkdir");
        }
        fs::write(path, content).expect("write");
    }

    fn read(&self, rel: &str) -> String {
        fs::read_to_string(self.path(rel)).expect("read")
    }

    fn init_flipr(&self) {
        self.sqlitch()
            .args(["--engine", "sqlite", "init", "flipr"])
            .assert()
            .success();
    }

    fn add(&self, name: &str) {
        self.sqlitch().args(["add", name]).assert().success();
    }

    fn deploy(&self) {
        self.sqlitch()
            .args(["deploy", "db:sqlite:flipr.db"])
            .assert()
            .success();
    }
}

fn file_exists(path: &Path) -> bool {
    path.exists()
}

// S1: init + add + deploy creates scaffolding, the workspace database, and
// the registry.
#[test]
fn init_add_deploy_round() {
    let p = Project::new();
    p.init_flipr();

    assert!(file_exists(&p.path("sqitch.plan")));
    assert!(file_exists(&p.path("sqitch.conf")));
    assert!(p.read("sqitch.conf").contains("engine = sqlite"));
    assert!(p.read("sqitch.plan").contains("%project=flipr"));

    p.add("users");
    for kind in ["deploy", "revert", "verify"] {
        assert!(file_exists(&p.path(&format!("{kind}/users.sql"))));
    }
    assert!(p.read("deploy/users.sql").contains("-- Deploy flipr:users to sqlite"));

    // Give the scripts real content so deploy/verify exercise the database.
    p.write(
        "deploy/users.sql",
        "BEGIN;\nCREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT);\nCOMMIT;\n",
    );
    p.write("revert/users.sql", "BEGIN;\nDROP TABLE users;\nCOMMIT;\n");
    p.write("verify/users.sql", "SELECT id, name FROM users;\n");

    p.sqlitch()
        .args(["deploy", "db:sqlite:flipr.db"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Adding registry tables to"))
        .stdout(predicate::str::contains("+ users"));

    assert!(file_exists(&p.path("flipr.db")));
    assert!(file_exists(&p.path("sqitch.db")));

    p.sqlitch()
        .args(["status", "db:sqlite:flipr.db"])
        .assert()
        .success()
        .stdout(predicate::str::contains("# Project:  flipr"))
        .stdout(predicate::str::contains("# Name:     users"))
        .stdout(predicate::str::contains("Nothing to deploy (up-to-date)"));
}

// S2: a failing deploy script leaves no workspace objects, no changes row,
// and one deploy_fail event.
#[test]
fn deploy_failure_is_atomic_and_recorded() {
    let p = Project::new();
    p.init_flipr();
    p.add("bad");
    p.write(
        "deploy/bad.sql",
        "CREATE TABLE x (id INT);\nSELECT RAISE(ABORT, 'boom');\n",
    );

    p.sqlitch()
        .args(["deploy", "db:sqlite:flipr.db"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Deploy failed for change \"bad\""));

    p.sqlitch()
        .args(["status", "db:sqlite:flipr.db"])
        .assert()
        .success()
        .stdout(predicate::str::contains("deploy_fail bad"))
        .stdout(predicate::str::contains("Undeployed changes:"));

    p.sqlitch()
        .args(["log", "db:sqlite:flipr.db"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Deploy Fail"))
        .stdout(predicate::str::contains("Name:      bad"));

    p.sqlitch()
        .args(["log", "db:sqlite:flipr.db", "--event", "deploy_fail", "--change", "bad"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Deploy Fail"));

    // A filter matching no events renders only the header.
    p.sqlitch()
        .args(["log", "db:sqlite:flipr.db", "--event", "revert"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Deploy Fail").not());

    p.sqlitch()
        .args(["log", "db:sqlite:flipr.db", "--event", "bogus"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("Unknown event type"));
}

// S3: revert --to @HEAD^ removes only the last change.
#[test]
fn revert_to_head_parent() {
    let p = Project::new();
    p.init_flipr();
    for name in ["a", "b", "c"] {
        p.add(name);
        p.write(
            &format!("deploy/{name}.sql"),
            &format!("CREATE TABLE {name} (id INT);\n"),
        );
        p.write(
            &format!("revert/{name}.sql"),
            &format!("DROP TABLE {name};\n"),
        );
    }
    p.deploy();

    p.sqlitch()
        .args(["revert", "db:sqlite:flipr.db", "--to", "@HEAD^", "-y"])
        .assert()
        .success()
        .stdout(predicate::str::contains("- c").and(predicate::str::contains("- b").not()));

    p.sqlitch()
        .args(["status", "db:sqlite:flipr.db"])
        .assert()
        .success()
        .stdout(predicate::str::contains("# Name:     b"))
        .stdout(predicate::str::contains("Undeployed changes:"))
        .stdout(predicate::str::contains("  * c"));
}

// S4: verify reports ok, SKIP, and NOT OK lines with the summary and exit 1.
#[test]
fn verify_mixed_results() {
    let p = Project::new();
    p.init_flipr();
    for name in ["a", "b", "c"] {
        p.add(name);
        p.write(
            &format!("deploy/{name}.sql"),
            &format!("CREATE TABLE {name} (id INT);\n"),
        );
    }
    p.deploy();

    p.write("verify/a.sql", "SELECT id FROM a;\n");
    fs::remove_file(p.path("verify/b.sql")).expect("rm");
    p.write("verify/c.sql", "SELECT missing_column FROM c;\n");

    p.sqlitch()
        .args(["verify", "db:sqlite:flipr.db"])
        .assert()
        .code(1)
        .stdout(predicate::str::contains("* a .. ok"))
        .stdout(predicate::str::contains("# b .. SKIP (no verify script)"))
        .stdout(predicate::str::contains("# c .. NOT OK"))
        .stdout(predicate::str::contains("Verify Summary Report"))
        .stdout(predicate::str::contains("Changes: 3"))
        .stdout(predicate::str::contains("Errors:  1"));
}

// S5: config precedence is local over user over system, falling through as
// scopes disappear.
#[test]
fn config_scope_precedence() {
    let p = Project::new();
    fs::write(
        p.system_dir.join("sqitch.conf"),
        "[core]\n\tengine = pg\n",
    )
    .expect("write");
    fs::write(
        p.user_dir.join("sqitch.conf"),
        "[core]\n\tengine = mysql\n",
    )
    .expect("write");
    fs::write(p.path("sqitch.conf"), "[core]\n\tengine = sqlite\n").expect("write");

    p.sqlitch()
        .args(["config", "core.engine"])
        .assert()
        .success()
        .stdout("sqlite\n");

    fs::remove_file(p.path("sqitch.conf")).expect("rm");
    p.sqlitch()
        .args(["config", "core.engine"])
        .assert()
        .success()
        .stdout("mysql\n");

    fs::remove_file(p.user_dir.join("sqitch.conf")).expect("rm");
    p.sqlitch()
        .args(["config", "core.engine"])
        .assert()
        .success()
        .stdout("pg\n");
}

// S6: parsing and reformatting the reference plan is byte-identical.
#[test]
fn plan_round_trip_is_byte_identical() {
    let p = Project::new();
    let plan = "\
%syntax-version=1.0.0
%project=flipr
%uri=https://github.com/sqitchers/sqitch-sqlite-intro/

users 2025-01-01T00:00:00Z Alice <alice@example.com> # Creates users table.
flips [users] 2025-01-02T00:00:00Z Alice <alice@example.com> # Adds flips table.
@v1.0 2025-01-03T00:00:00Z Alice <alice@example.com> # First release.
";
    p.write("sqitch.plan", plan);
    p.write("sqitch.conf", "[core]\n\tengine = sqlite\n");

    p.sqlitch().arg("plan").assert().success().stdout(plan.to_string());
}

// Drop-in filenames are honored when alone and conflict when paired.
#[test]
fn drop_in_plan_names() {
    let p = Project::new();
    p.write("sqitch.conf", "[core]\n\tengine = sqlite\n");
    p.write(
        "sqlitch.plan",
        "%syntax-version=1.0.0\n%project=flipr\n\n",
    );

    p.sqlitch()
        .arg("plan")
        .assert()
        .success()
        .stdout(predicate::str::contains("%project=flipr"));

    p.write(
        "sqitch.plan",
        "%syntax-version=1.0.0\n%project=flipr\n\n",
    );
    p.sqlitch()
        .arg("plan")
        .assert()
        .failure()
        .stderr(predicate::str::contains("sqitch.plan"))
        .stderr(predicate::str::contains("sqlitch.plan"));
}

// Deploying twice without plan changes is a no-op the second time.
#[test]
fn deploy_twice_is_idempotent() {
    let p = Project::new();
    p.init_flipr();
    p.add("users");
    p.write("deploy/users.sql", "CREATE TABLE users (id INT);\n");
    p.deploy();

    p.sqlitch()
        .args(["deploy", "db:sqlite:flipr.db"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Nothing to deploy (up-to-date)"))
        .stdout(predicate::str::contains("+ users").not());
}

// Tag and rework: the sealed instance keeps its scripts under name@tag.
#[test]
fn tag_and_rework_flow() {
    let p = Project::new();
    p.init_flipr();
    p.add("users");
    p.write("deploy/users.sql", "CREATE TABLE users (id INT);\n");

    p.sqlitch()
        .args(["tag", "v1.0", "-n", "First release."])
        .assert()
        .success()
        .stdout(predicate::str::contains("Tagged \"users\" with @v1.0"));

    p.sqlitch()
        .args(["rework", "users"])
        .assert()
        .success();

    assert!(file_exists(&p.path("deploy/users@v1.0.sql")));
    let plan_text = p.read("sqitch.plan");
    assert!(plan_text.contains("@v1.0"));
    assert!(plan_text.contains("users [users@v1.0]"));

    // Reworking an untagged change is rejected.
    p.sqlitch()
        .args(["rework", "users"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("has not been tagged"));
}

// The revert prompt default declines only on an explicit "no".
#[test]
fn revert_prompt_decline_aborts() {
    let p = Project::new();
    p.init_flipr();
    p.add("users");
    p.write("deploy/users.sql", "CREATE TABLE users (id INT);\n");
    p.write("revert/users.sql", "DROP TABLE users;\n");
    p.deploy();

    p.sqlitch()
        .args(["revert", "db:sqlite:flipr.db"])
        .write_stdin("no\n")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Revert aborted by user."));

    // The registry still has the change.
    p.sqlitch()
        .args(["status", "db:sqlite:flipr.db"])
        .assert()
        .success()
        .stdout(predicate::str::contains("# Name:     users"));
}

// Usage errors exit 2; unknown engines exit 1.
#[test]
fn exit_codes_follow_the_convention() {
    let p = Project::new();
    p.sqlitch()
        .args(["show", "nonsense-kind", "users"])
        .assert()
        .code(predicate::eq(1).or(predicate::eq(2)));

    p.sqlitch()
        .args(["config", "--local", "--user", "core.engine"])
        .assert()
        .code(2);

    p.write("sqitch.conf", "[core]\n\tengine = sqlite\n");
    p.write("sqitch.plan", "%project=flipr\n\n");
    p.sqlitch()
        .args(["--engine", "oracle", "deploy", "db:sqlite:flipr.db"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("Unsupported engine"));
}

// config --set writes the chosen scope and --list shows merged settings.
#[test]
fn config_set_and_list() {
    let p = Project::new();
    p.sqlitch()
        .args(["config", "core.engine", "sqlite"])
        .assert()
        .success();
    assert!(p.read("sqitch.conf").contains("engine = sqlite"));

    p.sqlitch()
        .args(["config", "--user", "user.name", "Config User"])
        .assert()
        .success();
    let user_conf = fs::read_to_string(p.user_dir.join("sqitch.conf")).expect("read");
    assert!(user_conf.contains("name = Config User"));

    p.sqlitch()
        .args(["config", "--list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("core.engine=sqlite"))
        .stdout(predicate::str::contains("user.name=Config User"));

    p.sqlitch()
        .args(["config", "--unset", "core.engine"])
        .assert()
        .success();
    p.sqlitch()
        .args(["config", "core.engine"])
        .assert()
        .code(1);
}

// engine/target admin commands persist into local config.
#[test]
fn engine_and_target_admin() {
    let p = Project::new();
    p.sqlitch()
        .args(["engine", "add", "sqlite", "db:sqlite:flipr.db"])
        .assert()
        .success();
    p.sqlitch()
        .args(["engine", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("sqlite\tdb:sqlite:flipr.db"));

    p.sqlitch()
        .args(["target", "add", "prod", "db:sqlite:prod.db"])
        .assert()
        .success();
    p.sqlitch()
        .args(["target", "show", "prod"])
        .assert()
        .success()
        .stdout("db:sqlite:prod.db\n");

    p.sqlitch()
        .args(["engine", "add", "oracle"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Unsupported engine"));
}

// A configured engine target makes the target argument optional.
#[test]
fn deploy_uses_configured_engine_target() {
    let p = Project::new();
    p.init_flipr();
    p.add("users");
    p.write("deploy/users.sql", "CREATE TABLE users (id INT);\n");
    p.sqlitch()
        .args(["engine", "add", "sqlite", "db:sqlite:flipr.db"])
        .assert()
        .success();

    p.sqlitch()
        .arg("deploy")
        .assert()
        .success()
        .stdout(predicate::str::contains("+ users"));
    assert!(file_exists(&p.path("flipr.db")));
}

// bundle copies the plan, config, and script directories.
#[test]
fn bundle_copies_project_artifacts() {
    let p = Project::new();
    p.init_flipr();
    p.add("users");

    p.sqlitch().arg("bundle").assert().success();

    assert!(file_exists(&p.path("bundle/sqitch.plan")));
    assert!(file_exists(&p.path("bundle/sqitch.conf")));
    assert!(file_exists(&p.path("bundle/deploy/users.sql")));
    assert!(file_exists(&p.path("bundle/revert/users.sql")));
    assert!(file_exists(&p.path("bundle/verify/users.sql")));
}

// upgrade installs the registry and is idempotent afterwards.
#[test]
fn upgrade_installs_and_reports_current() {
    let p = Project::new();
    p.init_flipr();
    p.add("users");

    p.sqlitch()
        .args(["upgrade", "db:sqlite:flipr.db"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Adding registry tables to"));

    p.sqlitch()
        .args(["upgrade", "db:sqlite:flipr.db"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Registry is up-to-date"));
}
