use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

const UIPATH_LOG: &str = r#"{"message":"Execution started","level":"Information","processName":"InvoiceBot","robotName":"ROBOT-07","jobId":"8f3c","fileName":"Main.xaml"}
{"message":"UiPath.Core.Activities.Click: Cannot find the UI element corresponding to this selector","level":"Error","processName":"InvoiceBot","robotName":"ROBOT-07","jobId":"8f3c"}
"#;

fn ihx_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_ihx"))
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();
    fs::create_dir_all(root.join("data")).unwrap();

    let uploads = root.join("uploads");
    fs::create_dir_all(&uploads).unwrap();
    fs::write(uploads.join("Robot_execution.log"), UIPATH_LOG).unwrap();

    // ~1 KB of zip for 4 MB of output: far past a ratio of 50
    let bomb = fs::File::create(uploads.join("bomb.zip")).unwrap();
    let mut zip = zip::ZipWriter::new(bomb);
    let opts = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated);
    zip.start_file("huge.log", opts).unwrap();
    zip.write_all(&vec![b'0'; 4 * 1024 * 1024]).unwrap();
    zip.finish().unwrap();

    let config_content = format!(
        r#"[db]
path = "{}/data/ihx.sqlite"

[archive]
max_ratio = 50.0

[embedding]
provider = "hash"
dims = 128

[fingerprint]
min_relevance = 0.0
relevance_threshold = 0.0
visibility = "multi_tenant"

[authz.grants]
ana = ["acme", "globex"]
"#,
        root.display()
    );

    let config_path = config_dir.join("ihx.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_ihx(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = ihx_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run ihx binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

fn upload(config_path: &Path, name: &str) -> PathBuf {
    config_path
        .parent()
        .and_then(Path::parent)
        .unwrap()
        .join("uploads")
        .join(name)
}

/// Ingest and return `(job_id, stdout)`.
fn ingest(config_path: &Path, name: &str, tenant: &str) -> (String, String) {
    let path = upload(config_path, name);
    let (stdout, stderr, success) = run_ihx(
        config_path,
        &["ingest", path.to_str().unwrap(), "--tenant", tenant],
    );
    assert!(success, "ingest failed: {}", stderr);
    let job_id = stdout
        .lines()
        .find_map(|l| l.strip_prefix("job "))
        .expect("job id line")
        .trim()
        .to_string();
    (job_id, stdout)
}

#[test]
fn test_init_is_idempotent() {
    let (_tmp, config) = setup_test_env();
    let (stdout, stderr, success) = run_ihx(&config, &["init"]);
    assert!(success, "init failed: {}", stderr);
    assert!(stdout.contains("Database initialized successfully."));

    let (_, stderr, success) = run_ihx(&config, &["init"]);
    assert!(success, "second init failed: {}", stderr);
}

#[test]
fn test_ingest_uipath_log_runs_parser() {
    let (_tmp, config) = setup_test_env();
    run_ihx(&config, &["init"]);

    let (job_id, stdout) = ingest(&config, "Robot_execution.log", "acme");
    assert!(stdout.contains("status: completed"), "{}", stdout);
    assert!(stdout.contains("platform: uipath"), "{}", stdout);
    assert!(stdout.contains("parser ran"), "{}", stdout);

    let (stdout, stderr, success) = run_ihx(&config, &["job", &job_id]);
    assert!(success, "job failed: {}", stderr);
    assert!(stdout.contains("status:       completed"));
    assert!(stdout.contains("platform:     uipath"));
    assert!(stdout.contains("passed"));
    assert!(stdout.contains("fingerprint:  available"), "{}", stdout);
}

#[test]
fn test_zip_bomb_is_blocked_for_review() {
    let (_tmp, config) = setup_test_env();
    run_ihx(&config, &["init"]);

    let (job_id, stdout) = ingest(&config, "bomb.zip", "acme");
    assert!(stdout.contains("status: needs_review"), "{}", stdout);
    assert!(stdout.contains("review reason: decompression_ratio"), "{}", stdout);
    assert!(stdout.contains("blocked_ratio"), "{}", stdout);
    assert!(!stdout.contains("platform:"));

    let (stdout, _, success) = run_ihx(&config, &["job", &job_id]);
    assert!(success);
    assert!(stdout.contains("chunks:       0"));
}

#[test]
fn test_retrieve_cites_lines() {
    let (_tmp, config) = setup_test_env();
    run_ihx(&config, &["init"]);
    ingest(&config, "Robot_execution.log", "acme");

    let (stdout, stderr, success) = run_ihx(
        &config,
        &["retrieve", "Cannot find the UI element selector", "--tenant", "acme"],
    );
    assert!(success, "retrieve failed: {}", stderr);
    assert!(stdout.contains("mode: hybrid"), "{}", stdout);
    assert!(stdout.contains("lines 1-2"), "{}", stdout);

    // other tenants never see acme's chunks
    let (stdout, _, success) =
        run_ihx(&config, &["retrieve", "selector", "--tenant", "globex"]);
    assert!(success);
    assert!(stdout.contains("No results."));
}

#[test]
fn test_retrieve_without_embeddings_fails() {
    let (_tmp, config) = setup_test_env();
    let content = fs::read_to_string(&config)
        .unwrap()
        .replace("provider = \"hash\"", "provider = \"disabled\"");
    fs::write(&config, content).unwrap();
    run_ihx(&config, &["init"]);

    let (_, stderr, success) = run_ihx(&config, &["retrieve", "x", "--tenant", "acme"]);
    assert!(!success);
    assert!(stderr.contains("embedding provider"), "{}", stderr);
}

#[test]
fn test_cross_workspace_search_is_authorized_and_audited() {
    let (_tmp, config) = setup_test_env();
    run_ihx(&config, &["init"]);
    let (acme_job, _) = ingest(&config, "Robot_execution.log", "acme");
    let (globex_job, _) = ingest(&config, "Robot_execution.log", "globex");

    let query = "UiPath Cannot find the UI element corresponding to this selector";

    let (stdout, stderr, success) = run_ihx(
        &config,
        &["search", query, "--tenant", "acme", "--analyst", "ana"],
    );
    assert!(success, "search failed: {}", stderr);
    assert!(stdout.contains(&acme_job));
    assert!(!stdout.contains(&globex_job));
    assert!(!stdout.contains("audit token"));

    let (stdout, stderr, success) = run_ihx(
        &config,
        &[
            "search", query, "--tenant", "acme", "--analyst", "ana", "--scope", "multi_tenant",
            "--workspace", "globex",
        ],
    );
    assert!(success, "cross search failed: {}", stderr);
    assert!(stdout.contains(&globex_job));
    assert!(stdout.contains("(cross-workspace)"));
    assert!(stdout.contains("audit token:"));

    let (_, stderr, success) = run_ihx(
        &config,
        &[
            "search", query, "--tenant", "acme", "--analyst", "bob", "--scope", "multi_tenant",
            "--workspace", "globex",
        ],
    );
    assert!(!success);
    assert!(stderr.contains("not authorized"), "{}", stderr);
}

#[test]
fn test_related_excludes_source_session() {
    let (_tmp, config) = setup_test_env();
    run_ihx(&config, &["init"]);
    let (first, _) = ingest(&config, "Robot_execution.log", "acme");
    let (second, _) = ingest(&config, "Robot_execution.log", "acme");

    let (stdout, stderr, success) = run_ihx(
        &config,
        &["related", &first, "--tenant", "acme", "--analyst", "ana"],
    );
    assert!(success, "related failed: {}", stderr);
    assert!(stdout.contains(&format!("session: {}", second)));
    assert!(!stdout.contains(&format!("session: {}", first)));
}

#[test]
fn test_stats_and_maintenance_commands() {
    let (_tmp, config) = setup_test_env();
    run_ihx(&config, &["init"]);
    ingest(&config, "Robot_execution.log", "acme");
    ingest(&config, "bomb.zip", "acme");

    let (stdout, stderr, success) = run_ihx(&config, &["stats"]);
    assert!(success, "stats failed: {}", stderr);
    assert!(stdout.contains("Jobs:        2"));
    assert!(stdout.contains("needs_review"));
    assert!(stdout.contains("uipath"));

    let (stdout, stderr, success) = run_ihx(&config, &["cache", "evict"]);
    assert!(success, "evict failed: {}", stderr);
    assert!(stdout.contains("tenants processed: 0"));

    let (stdout, stderr, success) = run_ihx(&config, &["hybrid", "enable", "acme"]);
    assert!(success, "hybrid enable failed: {}", stderr);
    assert!(stdout.contains("-> enabled"));
}

#[test]
fn test_missing_config_fails() {
    let tmp = TempDir::new().unwrap();
    let missing = tmp.path().join("nope.toml");
    let (_, stderr, success) = run_ihx(&missing, &["init"]);
    assert!(!success);
    assert!(stderr.contains("Failed to read config file"));
}
