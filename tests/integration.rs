use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn cidx_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("cidx");
    path
}

const CARD: &str = r#"<html><body>
<table>
  <tr><th colspan="2">ДЕЛО</th></tr>
  <tr><td>Номер дела</td><td>2-15/2020</td></tr>
  <tr><td>Судья</td><td>Сидоров  С.С.</td></tr>
  <tr><td>Дата поступления</td><td>14.02.2020</td></tr>
</table>
<table>
  <tr><th colspan="3">ДВИЖЕНИЕ ДЕЛА</th></tr>
  <tr><td><b>Наименование события</b></td><td><b>Дата</b></td><td><b>Время</b></td></tr>
  <tr><td>Регистрация иска</td><td>14.02.2020</td><td>10:00</td></tr>
  <tr><td>Подготовка дела</td><td>20.02.2020</td><td>11:30</td></tr>
</table>
</body></html>"#;

fn setup_test_env() -> (TempDir, PathBuf, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let case_dir = root.join("data/2020/02/14/2-15-2020");
    fs::create_dir_all(&case_dir).unwrap();
    fs::write(
        case_dir.join("manifest.json"),
        r#"{"ID": "77RS0001-2-15-2020", "case_number": "2-15/2020", "date_reg": "14.02.2020", "court_id": "77RS0001"}"#,
    )
    .unwrap();
    fs::write(case_dir.join("15-02-2020.09:00:00.html"), CARD).unwrap();
    fs::write(case_dir.join("14-02-2020.18:00:00.html"), CARD).unwrap();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();
    let config_content = format!(
        r#"[backend]
url = "http://127.0.0.1:1"
index = "cases-test"
timeout_secs = 5

[ingest]
root = "{}/data"
workers = 2

[delivery]
flush_docs = 10
idle_flush_ms = 50
max_retries = 0
"#,
        root.display()
    );
    let config_path = config_dir.join("cidx.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path, case_dir)
}

fn run_cidx(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = cidx_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run cidx binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let success = output.status.success();
    (stdout, stderr, success)
}

#[test]
fn test_extract_prints_tables() {
    let (_tmp, config_path, case_dir) = setup_test_env();
    let file = case_dir.join("14-02-2020.18:00:00.html");

    let (stdout, stderr, success) = run_cidx(&config_path, &["extract", file.to_str().unwrap()]);
    assert!(success, "extract failed: stdout={}, stderr={}", stdout, stderr);

    let v: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(v["ДЕЛО"]["Судья"], "Сидоров С.С.");
    let events = v["ДВИЖЕНИЕ ДЕЛА"].as_array().unwrap();
    assert_eq!(events.len(), 2);
    assert_eq!(events[1]["Наименование события"], "Подготовка дела");
}

#[test]
fn test_extract_missing_file_fails() {
    let (tmp, config_path, _) = setup_test_env();
    let missing = tmp.path().join("nope.html");
    let (_, stderr, success) = run_cidx(&config_path, &["extract", missing.to_str().unwrap()]);
    assert!(!success);
    assert!(stderr.contains("Failed to read"));
}

#[test]
fn test_prepare_versions_snapshots() {
    let (tmp, config_path, case_dir) = setup_test_env();
    let root = tmp.path().join("data");

    let (stdout, stderr, success) = run_cidx(
        &config_path,
        &[
            "prepare",
            case_dir.to_str().unwrap(),
            "--root",
            root.to_str().unwrap(),
            "--tag",
            "t1",
        ],
    );
    assert!(success, "prepare failed: stdout={}, stderr={}", stdout, stderr);

    let docs: Vec<serde_json::Value> = serde_json::from_str(&stdout).unwrap();
    assert_eq!(docs.len(), 2);
    assert_eq!(docs[0]["_id"], "77RS0001-2-15-2020::1");
    assert_eq!(docs[1]["_id"], "77RS0001-2-15-2020::2");

    let first = &docs[0]["doc"];
    assert_eq!(first["html_file"], "14-02-2020.18:00:00.html");
    assert_eq!(first["is_latest"], false);
    assert_eq!(first["version_ts"], "2020-02-14T18:00:00.000Z");
    assert_eq!(first["judge"], "Сидоров С.С.");
    assert_eq!(first["date_reg"], "2020-02-14");
    assert_eq!(first["court_code"], "77RS0001");
    assert_eq!(first["meta"]["rel_dir"], "2020/02/14/2-15-2020");
    assert_eq!(first["tag"], "t1");
    assert_eq!(docs[1]["doc"]["is_latest"], true);
}

#[test]
fn test_prepare_is_deterministic() {
    let (_tmp, config_path, case_dir) = setup_test_env();
    let (a, _, ok_a) = run_cidx(&config_path, &["prepare", case_dir.to_str().unwrap()]);
    let (b, _, ok_b) = run_cidx(&config_path, &["prepare", case_dir.to_str().unwrap()]);
    assert!(ok_a && ok_b);
    assert_eq!(a, b);
}

#[test]
fn test_prepare_rejects_bad_manifest() {
    let (_tmp, config_path, case_dir) = setup_test_env();
    fs::write(case_dir.join("manifest.json"), "{broken").unwrap();
    let (_, stderr, success) = run_cidx(&config_path, &["prepare", case_dir.to_str().unwrap()]);
    assert!(!success);
    assert!(stderr.contains("Invalid manifest"));
}

#[test]
fn test_rules_lists_fields() {
    let (_tmp, config_path, _) = setup_test_env();
    let (stdout, stderr, success) = run_cidx(&config_path, &["rules"]);
    assert!(success, "rules failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("date_reg:date ["));
    assert!(stdout.contains("type instances: "));
}

#[test]
fn test_import_missing_config_fails() {
    let tmp = TempDir::new().unwrap();
    let (_, stderr, success) = run_cidx(&tmp.path().join("absent.toml"), &["import"]);
    assert!(!success);
    assert!(stderr.contains("Failed to read config file"));
}

#[test]
fn test_import_invalid_config_fails() {
    let (_tmp, config_path, _) = setup_test_env();
    let content = fs::read_to_string(&config_path).unwrap();
    fs::write(&config_path, content.replace("workers = 2", "workers = 0")).unwrap();
    let (_, stderr, success) = run_cidx(&config_path, &["import"]);
    assert!(!success);
    assert!(stderr.contains("ingest.workers"));
}

#[test]
fn test_import_unreachable_backend_reports_counters() {
    let (_tmp, config_path, _) = setup_test_env();
    let (stdout, stderr, success) = run_cidx(&config_path, &["import", "--progress", "off"]);
    assert!(!success, "import should fail: stdout={}", stdout);
    assert!(stdout.contains("Import summary:"));
    assert!(stdout.contains("units seen:        1"));
    assert!(stdout.contains("docs prepared:     2"));
    assert!(stdout.contains("index errors:      1"));
    assert!(stderr.contains("import aborted"));
}

#[test]
fn test_import_unknown_progress_mode() {
    let (_tmp, config_path, _) = setup_test_env();
    let (_, stderr, success) = run_cidx(&config_path, &["import", "--progress", "fancy"]);
    assert!(!success);
    assert!(stderr.contains("Unknown progress mode"));
}
