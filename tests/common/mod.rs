//! Shared helpers for CLI integration tests.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};

/// Outcome of one `cfn` invocation, with a log file kept for diagnosis.
pub struct CliResult {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
    pub log_path: PathBuf,
}

/// Run the `cfn` binary with `args` and no stdin.
pub fn run_cli_case(case_name: &str, args: &[&str]) -> CliResult {
    let output = Command::new(env!("CARGO_BIN_EXE_cfn"))
        .args(args)
        .env_remove("CFN_CONFIG")
        .env_remove("CFN_ARBITER_ENDPOINT")
        .env_remove("CFN_RULES_PATH")
        .env_remove("CFN_AUDIT_PATH")
        .env("CFN_LOG", "info")
        .stdin(Stdio::null())
        .output()
        .expect("spawn cfn");

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
    let log_path = write_case_log(case_name, args, &output.status, &stdout, &stderr);
    CliResult {
        status: output.status,
        stdout,
        stderr,
        log_path,
    }
}

fn write_case_log(
    case_name: &str,
    args: &[&str],
    status: &ExitStatus,
    stdout: &str,
    stderr: &str,
) -> PathBuf {
    let dir = Path::new(env!("CARGO_TARGET_TMPDIR")).join("cli-logs");
    std::fs::create_dir_all(&dir).expect("create log dir");
    let safe: String = case_name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
        .collect();
    let path = dir.join(format!("{safe}.log"));
    let body = format!(
        "args: {args:?}\nstatus: {status}\n--- stdout ---\n{stdout}\n--- stderr ---\n{stderr}\n"
    );
    std::fs::write(&path, body).expect("write case log");
    path
}

/// Write a config into `dir` that keeps every artifact inside it.
pub fn write_config(dir: &Path, rules: Option<&Path>) -> PathBuf {
    let mut toml = format!(
        "[audit]\npath = {:?}\nfsync = false\n",
        dir.join("audit.jsonl").display().to_string()
    );
    if let Some(rules) = rules {
        toml.push_str(&format!("\n[policy]\nrules_path = {:?}\n", rules.display().to_string()));
    }
    let path = dir.join("cfn.toml");
    std::fs::write(&path, toml).expect("write config");
    path
}

pub const WEAPON_RULES: &str = r#"
version = "v1"

[[rules]]
id = "weapon-confirmed"
priority = 1
when = '"weapon" in categories AND confidence > 0.7'
action = "block"
severity = 90

[[rules]]
id = "knife-watch"
priority = 20
when = 'label_confidence("knife") >= 0.2'
action = "warn"
severity = 30
"#;
