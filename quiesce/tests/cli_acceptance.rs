use quiesce_core::{KeyValueStore, SqliteStore, DEFAULT_STORAGE_KEY};
use std::ffi::OsString;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Output, Stdio};
use tempfile::TempDir;

struct CliTestEnv {
    _temp_dir: TempDir,
    home: PathBuf,
    xdg_data: PathBuf,
    xdg_config: PathBuf,
    xdg_state: PathBuf,
}

impl CliTestEnv {
    fn new() -> Self {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let base = temp_dir.path().to_path_buf();
        let home = base.join("home");
        let xdg_data = base.join("xdg-data");
        let xdg_config = base.join("xdg-config");
        let xdg_state = base.join("xdg-state");

        fs::create_dir_all(&home).expect("failed to create HOME");
        fs::create_dir_all(&xdg_data).expect("failed to create XDG_DATA_HOME");
        fs::create_dir_all(&xdg_config).expect("failed to create XDG_CONFIG_HOME");
        fs::create_dir_all(&xdg_state).expect("failed to create XDG_STATE_HOME");

        Self {
            _temp_dir: temp_dir,
            home,
            xdg_data,
            xdg_config,
            xdg_state,
        }
    }

    fn store_path(&self) -> PathBuf {
        self.xdg_data.join("quiesce/store.db")
    }

    fn store(&self) -> SqliteStore {
        SqliteStore::open(&self.store_path()).expect("failed to open store")
    }

    fn write_config(&self, contents: &str) {
        let dir = self.xdg_config.join("quiesce");
        fs::create_dir_all(&dir).expect("failed to create config dir");
        fs::write(dir.join("config.toml"), contents).expect("failed to write config");
    }
}

fn run_bin(env: &CliTestEnv, args: &[&str], stdin: impl AsRef<[u8]>) -> Output {
    let bin_path = PathBuf::from(assert_cmd::cargo::cargo_bin!("quiesce"));

    let mut child = Command::new(bin_path)
        .args(args)
        .env("HOME", &env.home)
        .env("XDG_DATA_HOME", &env.xdg_data)
        .env("XDG_CONFIG_HOME", &env.xdg_config)
        .env("XDG_STATE_HOME", &env.xdg_state)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .unwrap_or_else(|e| panic!("failed to execute quiesce: {e}"));

    child
        .stdin
        .take()
        .expect("missing stdin")
        .write_all(stdin.as_ref())
        .expect("failed to write stdin");

    child
        .wait_with_output()
        .expect("failed to wait for quiesce")
}

fn assert_success(args: &[&str], output: &Output) {
    if output.status.success() {
        return;
    }

    let rendered_args = args
        .iter()
        .map(|arg| OsString::from(arg).to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(" ");
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    panic!(
        "quiesce {rendered_args} failed\nstatus: {}\nstdout:\n{}\nstderr:\n{}",
        output.status, stdout, stderr
    );
}

fn stdout_lines(output: &Output) -> Vec<String> {
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(str::to_string)
        .collect()
}

#[test]
fn batch_emits_stdin_lines_as_one_array_on_eof() {
    let env = CliTestEnv::new();
    let args = ["batch", "--delay-ms", "60000"];

    let output = run_bin(&env, &args, "alpha\nbeta\ngamma\n");
    assert_success(&args, &output);

    assert_eq!(stdout_lines(&output), vec![r#"["alpha","beta","gamma"]"#]);
}

#[test]
fn batch_with_empty_stdin_prints_nothing() {
    let env = CliTestEnv::new();
    let args = ["batch"];

    let output = run_bin(&env, &args, "");
    assert_success(&args, &output);

    assert!(
        output.stdout.is_empty(),
        "expected no output, got:\n{}",
        String::from_utf8_lossy(&output.stdout)
    );
    assert!(!env.store_path().exists(), "memory storage must not create a store");
}

#[test]
fn batch_recovers_persisted_lines_before_new_input() {
    let env = CliTestEnv::new();
    env.store()
        .set(DEFAULT_STORAGE_KEY, r#"["left","over"]"#)
        .expect("failed to seed store");

    let args = ["batch", "--storage", "local", "--delay-ms", "60000"];
    let output = run_bin(&env, &args, "fresh\n");
    assert_success(&args, &output);

    assert_eq!(
        stdout_lines(&output),
        vec![r#"["left","over"]"#, r#"["fresh"]"#]
    );
    assert!(env
        .store()
        .get(DEFAULT_STORAGE_KEY)
        .expect("failed to read store")
        .is_none());
}

#[test]
fn batch_keep_leaves_lines_persisted() {
    let env = CliTestEnv::new();

    let args = ["batch", "--storage", "local", "--keep", "--key", "kept"];
    let output = run_bin(&env, &args, "one\ntwo\n");
    assert_success(&args, &output);

    assert_eq!(stdout_lines(&output), vec![r#"["one","two"]"#]);
    assert_eq!(
        env.store().get("kept").expect("failed to read store").as_deref(),
        Some(r#"["one","two"]"#)
    );
}

#[test]
fn batch_keep_prints_recovered_batch_once() {
    let env = CliTestEnv::new();
    env.store()
        .set("kept", r#"["a"]"#)
        .expect("failed to seed store");

    let args = ["batch", "--storage", "local", "--keep", "--key", "kept"];
    let output = run_bin(&env, &args, "");
    assert_success(&args, &output);

    assert_eq!(stdout_lines(&output), vec![r#"["a"]"#]);
    assert_eq!(
        env.store().get("kept").expect("failed to read store").as_deref(),
        Some(r#"["a"]"#)
    );
}

#[test]
fn batch_keep_flushes_recovered_and_new_lines_together() {
    let env = CliTestEnv::new();
    env.store()
        .set("kept", r#"["a"]"#)
        .expect("failed to seed store");

    let args = [
        "batch", "--storage", "local", "--keep", "--key", "kept", "--delay-ms", "60000",
    ];
    let output = run_bin(&env, &args, "b\n");
    assert_success(&args, &output);

    assert_eq!(stdout_lines(&output), vec![r#"["a"]"#, r#"["a","b"]"#]);
}

#[test]
fn batch_flushes_accepted_lines_before_failing_on_bad_input() {
    let env = CliTestEnv::new();
    let args = ["batch", "--delay-ms", "60000"];

    let output = run_bin(&env, &args, b"good1\ngood2\n\xff\xfe\n".as_slice());

    assert!(!output.status.success(), "invalid UTF-8 should fail the run");
    assert_eq!(stdout_lines(&output), vec![r#"["good1","good2"]"#]);

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("failed to read stdin"),
        "expected read error in stderr, got:\n{stderr}"
    );
}

#[test]
fn batch_reads_delay_from_config() {
    let env = CliTestEnv::new();
    env.write_config("[collector]\ndelay_ms = 60000\nstorage = \"local\"\nstorage_key = \"from-config\"\n");

    let args = ["batch"];
    let output = run_bin(&env, &args, "x\n");
    assert_success(&args, &output);

    assert_eq!(stdout_lines(&output), vec![r#"["x"]"#]);
    assert!(env.store_path().exists());
}

#[test]
fn batch_rejects_zero_delay() {
    let env = CliTestEnv::new();

    let output = run_bin(&env, &["batch", "--delay-ms", "0"], "x\n");
    assert!(!output.status.success());

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("delay_ms"),
        "expected delay error in stderr, got:\n{stderr}"
    );
}

#[test]
fn status_and_clear_manage_pending_batch() {
    let env = CliTestEnv::new();

    let status = run_bin(&env, &["status"], "");
    assert_success(&["status"], &status);
    assert!(String::from_utf8_lossy(&status.stdout).contains("No store yet"));

    env.store()
        .set(DEFAULT_STORAGE_KEY, r#"["a","b","c"]"#)
        .expect("failed to seed store");

    let status = run_bin(&env, &["status"], "");
    assert_success(&["status"], &status);
    let stdout = String::from_utf8_lossy(&status.stdout);
    assert!(
        stdout.contains("Pending:         3 items"),
        "expected pending count in status, got:\n{stdout}"
    );
    assert!(stdout.contains("Schema version:  1"));

    let clear = run_bin(&env, &["clear"], "");
    assert_success(&["clear"], &clear);
    assert!(String::from_utf8_lossy(&clear.stdout).contains("Cleared 3 pending items"));
    assert!(env
        .store()
        .get(DEFAULT_STORAGE_KEY)
        .expect("failed to read store")
        .is_none());

    let clear = run_bin(&env, &["clear"], "");
    assert_success(&["clear"], &clear);
    assert!(String::from_utf8_lossy(&clear.stdout).contains("Nothing to clear"));
}

#[test]
fn clear_leaves_foreign_value_untouched() {
    let env = CliTestEnv::new();
    env.store()
        .set("settings", r#"{"theme":"dark"}"#)
        .expect("failed to seed store");

    let args = ["clear", "--key", "settings"];
    let output = run_bin(&env, &args, "");
    assert_success(&args, &output);

    assert!(String::from_utf8_lossy(&output.stdout).contains("leaving it untouched"));
    assert_eq!(
        env.store()
            .get("settings")
            .expect("failed to read store")
            .as_deref(),
        Some(r#"{"theme":"dark"}"#)
    );
}

#[test]
fn verbose_writes_log_file() {
    let env = CliTestEnv::new();

    let args = ["--verbose", "batch", "--storage", "local"];
    let output = run_bin(&env, &args, "logged\n");
    assert_success(&args, &output);

    let log_dir = env.xdg_state.join("quiesce");
    let has_log = fs::read_dir(&log_dir)
        .map(|entries| {
            entries
                .filter_map(|entry| entry.ok())
                .any(|entry| entry.file_name().to_string_lossy().starts_with("quiesce"))
        })
        .unwrap_or(false);
    assert!(has_log, "expected a log file in {}", log_dir.display());
}
