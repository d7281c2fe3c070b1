use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use tempfile::TempDir;

struct CliTestEnv {
    _temp_dir: TempDir,
    home: PathBuf,
    xdg_data: PathBuf,
    xdg_config: PathBuf,
    xdg_state: PathBuf,
    series_dir: PathBuf,
}

impl CliTestEnv {
    fn new() -> Self {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let base = temp_dir.path().to_path_buf();
        let home = base.join("home");
        let xdg_data = base.join("xdg-data");
        let xdg_config = base.join("xdg-config");
        let xdg_state = base.join("xdg-state");
        let series_dir = base.join("series");

        for dir in [&home, &xdg_data, &xdg_config, &xdg_state, &series_dir] {
            fs::create_dir_all(dir).expect("failed to create test directory");
        }

        seed_series(&series_dir);

        Self {
            _temp_dir: temp_dir,
            home,
            xdg_data,
            xdg_config,
            xdg_state,
            series_dir,
        }
    }

    fn db_path(&self) -> PathBuf {
        self.xdg_data.join("fredrag/data.db")
    }
}

fn seed_series(dir: &Path) {
    let unrate = r#"{"observations": [
        {"date": "2020-01-01", "value": "3.5"},
        {"date": "2020-02-01", "value": "3.5"},
        {"date": "2020-03-01", "value": "4.4"},
        {"date": "2020-04-01", "value": "14.8"},
        {"date": "2020-05-01", "value": "13.2"}
    ]}"#;
    let gdp = r#"{"observations": [
        {"date": "2019-10-01", "value": "21694.5"},
        {"date": "2020-01-01", "value": "21481.4"},
        {"date": "2020-04-01", "value": "19477.4"},
        {"date": "2020-07-01", "value": "21138.6"}
    ]}"#;
    fs::write(dir.join("UNRATE.json"), unrate).expect("failed to write UNRATE");
    fs::write(dir.join("GDP.json"), gdp).expect("failed to write GDP");
}

fn run(env: &CliTestEnv, args: &[&str]) -> Output {
    Command::new(PathBuf::from(assert_cmd::cargo::cargo_bin!("fredrag")))
        .args(args)
        .env("HOME", &env.home)
        .env("XDG_DATA_HOME", &env.xdg_data)
        .env("XDG_CONFIG_HOME", &env.xdg_config)
        .env("XDG_STATE_HOME", &env.xdg_state)
        .env_remove("RUST_LOG")
        .output()
        .unwrap_or_else(|e| panic!("failed to execute fredrag: {e}"))
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn assert_success(args: &[&str], output: &Output) {
    assert!(
        output.status.success(),
        "fredrag {:?} failed\nstdout:\n{}\nstderr:\n{}",
        args,
        stdout(output),
        String::from_utf8_lossy(&output.stderr)
    );
}

fn run_ok(env: &CliTestEnv, args: &[&str]) -> String {
    let output = run(env, args);
    assert_success(args, &output);
    stdout(&output)
}

#[test]
fn list_on_fresh_install_creates_database() {
    let env = CliTestEnv::new();

    let out = run_ok(&env, &["list"]);
    assert!(out.contains("No series ingested"));
    assert!(env.db_path().exists(), "database should be created on startup");
}

#[test]
fn ingest_then_analyze_search_and_chat() {
    let env = CliTestEnv::new();
    let data_dir = env.series_dir.to_string_lossy().into_owned();

    let out = run_ok(&env, &["ingest", "UNRATE", "GDP", "--data-dir", &data_dir]);
    assert!(out.contains("UNRATE: 5 observations (indexed)"), "{out}");
    assert!(out.contains("GDP: 4 observations (indexed)"), "{out}");

    // State survives into a new process through the database
    let out = run_ok(&env, &["list"]);
    assert!(out.contains("GDP: 4 observations (indexed)"), "{out}");
    assert!(out.contains("UNRATE: 5 observations (indexed)"), "{out}");

    let out = run_ok(&env, &["analyze", "UNRATE", "--kind", "trend", "--format", "json"]);
    let report: serde_json::Value = serde_json::from_str(&out).expect("analyze json output");
    assert_eq!(report["series_id"], "UNRATE");
    assert_eq!(report["kind"], "trend");
    assert!(report["payload"]["slope"].as_f64().unwrap() > 0.0);

    let out = run_ok(&env, &["search", "unrate observations", "-k", "1"]);
    assert_eq!(out.lines().count(), 1, "{out}");
    assert!(out.contains("UNRATE"), "{out}");

    // No generation provider is configured, so the turn falls back
    let out = run_ok(&env, &["chat", "how is unemployment?", "--session", "s1"]);
    assert!(out.contains("fallback: generation_unavailable"), "{out}");

    let out = run_ok(&env, &["history", "s1"]);
    assert!(out.contains("> how is unemployment?"), "{out}");
}

#[test]
fn ingest_missing_series_fails() {
    let env = CliTestEnv::new();
    let data_dir = env.series_dir.to_string_lossy().into_owned();

    let output = run(&env, &["ingest", "NOPE", "--data-dir", &data_dir]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("NOPE"));
}

#[test]
fn analyze_unknown_series_fails() {
    let env = CliTestEnv::new();

    let output = run(&env, &["analyze", "GDP"]);
    assert!(!output.status.success());
}

#[test]
fn history_of_unknown_session_fails() {
    let env = CliTestEnv::new();

    let output = run(&env, &["history", "missing"]);
    assert!(!output.status.success());
}
