use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

const ORGANIZATIONS: &str = "\
uuid,name,legal_name,domain,status,category_list,total_funding_usd,founded_on,created_at,updated_at
o1,Acme  Robotics,Acme Robotics Inc,ACME.com,acquired,\"AI, Robotics\",1000000,2015-04-01,2023-01-01 00:00:00,2023-01-02 00:00:00
o2,Beta Labs,,beta.io,operating,Fintech,2000000,2018,2023-01-01 00:00:00,2023-01-02 00:00:00
o3,Gamma,,gamma.dev,operating,,,2020-06-15,2023-01-01 00:00:00,2023-01-02 00:00:00
";

const PEOPLE: &str = "\
uuid,name,first_name,last_name,linkedin_url,created_at,updated_at
p1,Ada Lovelace,Ada,Lovelace,https://linkedin.com/in/ada,2023-01-01 00:00:00,2023-01-02 00:00:00
p2,Grace Hopper,Grace,Hopper,https://linkedin.com/in/grace,2023-01-01 00:00:00,2023-01-02 00:00:00
p3,Linus  Torvalds,Linus,Torvalds,,2023-01-01 00:00:00,2023-01-02 00:00:00
";

const JOBS: &str = "\
uuid,name,person_uuid,person_name,org_uuid,org_name,title,job_type,started_on,ended_on,is_current,created_at,updated_at
j1,Ada at Acme,p1,Ada Lovelace,o1,Acme Robotics,Co-Founder & CEO,founder,2015-04-01,,true,2023-01-01 00:00:00,2023-01-02 00:00:00
j2,Grace at Beta,p2,Grace Hopper,o2,Beta Labs,Engineer,employee,2019-01-01,2021-01-01,false,2023-01-01 00:00:00,2023-01-02 00:00:00
j3,Linus at Nowhere,p3,Linus Torvalds,o-missing,Nowhere,CTO,executive,2020-01-01,,yes,2023-01-01 00:00:00,2023-01-02 00:00:00
j4,Ghost at Acme,p-missing,Ghost,o1,Acme Robotics,Advisor,advisor,2021-01-01,,,2023-01-01 00:00:00,2023-01-02 00:00:00
j5,Grace at Gamma,p2,Grace Hopper,o3,Gamma,VP Sales,executive,2022-01-01,,true,2023-01-01 00:00:00,2023-01-02 00:00:00
";

fn ensemble_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("ensemble");
    path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();
    let data_dir = root.join("data");
    fs::create_dir_all(&data_dir).unwrap();

    fs::write(data_dir.join("organizations.csv"), ORGANIZATIONS).unwrap();
    fs::write(data_dir.join("people.csv"), PEOPLE).unwrap();
    fs::write(data_dir.join("jobs.csv"), JOBS).unwrap();

    let config_content = format!(
        r#"[db]
path = "{root}/data/startup_data.db"

[sources]
data_dir = "{root}/data"

[pipeline]
batch_size = 2
state_file = "{root}/data/pipeline_state.json"
"#,
        root = root.display()
    );
    let config_path = config_dir.join("ensemble.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_ensemble(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = ensemble_binary();
    let mut cmd = Command::new(&binary);
    for var in [
        "DB_PATH",
        "DATA_DIR",
        "ORGANIZATIONS_CSV",
        "PEOPLE_CSV",
        "JOBS_CSV",
        "API_BASE_URL",
        "API_KEY",
        "BATCH_SIZE",
        "INCREMENTAL_MODE",
        "MAX_WORKERS",
        "STATE_FILE",
        "API_MAX_RETRIES",
        "API_RETRY_DELAY_MS",
        "API_TIMEOUT_SECS",
        "LOG_LEVEL",
        "RUST_LOG",
    ] {
        cmd.env_remove(var);
    }
    let output = cmd
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run ensemble binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

#[test]
fn test_full_run_persists_reconciled_data() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_ensemble(&config_path, &["--initialize-db", "--full"]);
    assert!(success, "run failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("organizations persisted: 3"), "{}", stdout);
    assert!(stdout.contains("people persisted: 3"), "{}", stdout);
    assert!(stdout.contains("jobs persisted: 4"), "{}", stdout);
    assert!(stdout.contains("founder features: 1"), "{}", stdout);
    assert!(stdout.contains("1 org references nulled, 1 jobs dropped"), "{}", stdout);
    assert!(stdout.contains("ok"));
}

#[test]
fn test_full_run_is_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (_, _, first) = run_ensemble(&config_path, &["--full"]);
    assert!(first, "first run failed");

    let (stdout, stderr, second) = run_ensemble(&config_path, &["--full"]);
    assert!(second, "second run failed: {}", stderr);
    assert!(stdout.contains("0 inserted, 10 updated, 0 failed"), "{}", stdout);
    assert!(stdout.contains("organizations persisted: 3"));
    assert!(stdout.contains("jobs persisted: 4"));
    assert!(stdout.contains("founder features: 1"));
}

#[test]
fn test_incremental_rerun_skips_unchanged_rows() {
    let (tmp, config_path) = setup_test_env();

    let (_, _, first) = run_ensemble(&config_path, &["--full"]);
    assert!(first, "first run failed");

    let (stdout, stderr, second) = run_ensemble(&config_path, &["--incremental"]);
    assert!(second, "incremental run failed: {}", stderr);
    assert!(stdout.contains("ensemble run (incremental)"));
    assert!(
        stdout.contains("extracted: 0 organizations, 0 people, 1 jobs"),
        "{}",
        stdout
    );
    assert!(stdout.contains("jobs persisted: 4"));
    assert!(stdout.contains("founder features: 1"));

    // Touch one organization far in the future so it counts as updated.
    let orgs = ORGANIZATIONS.replacen("2023-01-02 00:00:00", "2099-01-01 00:00:00", 1);
    fs::write(tmp.path().join("data").join("organizations.csv"), orgs).unwrap();

    let (stdout, stderr, third) = run_ensemble(&config_path, &["--incremental"]);
    assert!(third, "incremental run failed: {}", stderr);
    assert!(
        stdout.contains("extracted: 1 organizations, 0 people, 1 jobs"),
        "{}",
        stdout
    );
    assert!(stdout.contains("organizations persisted: 3"));
    assert!(stdout.contains("founder features: 1"));
}

#[test]
fn test_run_state_is_written() {
    let (tmp, config_path) = setup_test_env();

    let (_, _, success) = run_ensemble(&config_path, &["--full"]);
    assert!(success);

    let state = fs::read_to_string(tmp.path().join("data").join("pipeline_state.json")).unwrap();
    let json: serde_json::Value = serde_json::from_str(&state).unwrap();
    assert_eq!(json["last_run_status"], "success");
    assert!(json["last_load_time"].is_string());
}

#[test]
fn test_missing_source_fails_and_records_error() {
    let (tmp, config_path) = setup_test_env();
    fs::remove_file(tmp.path().join("data").join("jobs.csv")).unwrap();

    let (stdout, _stderr, success) = run_ensemble(&config_path, &["--full"]);
    assert!(!success, "run should fail without jobs.csv");
    assert!(stdout.contains("status: error"), "{}", stdout);
    assert!(stdout.contains("not found"), "{}", stdout);

    let state = fs::read_to_string(tmp.path().join("data").join("pipeline_state.json")).unwrap();
    assert!(state.contains("\"error\""));
}

#[test]
fn test_conflicting_mode_flags_rejected() {
    let (_tmp, config_path) = setup_test_env();
    let (_, stderr, success) = run_ensemble(&config_path, &["--full", "--incremental"]);
    assert!(!success);
    assert!(stderr.contains("cannot be used with"), "{}", stderr);
}

#[test]
fn test_logs_go_to_stderr() {
    let (_tmp, config_path) = setup_test_env();
    let (stdout, stderr, success) = run_ensemble(&config_path, &["--full"]);
    assert!(success);
    assert!(stderr.contains("STAGE: EXTRACT"), "{}", stderr);
    assert!(!stdout.contains("STAGE:"));
}
