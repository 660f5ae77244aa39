use std::fs;
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::process::{Child, Command as StdCommand, Stdio};
use std::time::{Duration, Instant};

use assert_cmd::Command;
use serde_json::Value;
use tempfile::TempDir;

const MOCK_BACKEND: &str = r#"
[[backends]]
prefix = "mock"
kind = "mock"
provider = "mock"
default = true
"#;

const SUMMARIZER: &str = r#"
[[custom_agents]]
name = "summarizer"
description = "Summarizes a topic"

[custom_agents.output_config]
output_name = "summary"

[custom_agents.tool_config]
tools = ["read_file"]

[custom_agents.input_config.inputs.topic]
description = "What to summarize"
required = true
"#;

/// Kills the daemon when the test ends, pass or fail.
struct Cleanup {
    child: Child,
}

impl Drop for Cleanup {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn strandd() -> Command {
    Command::new(assert_cmd::cargo::cargo_bin!("strandd"))
}

fn allocate_addr() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind ephemeral port");
    let addr = listener.local_addr().expect("local addr");
    drop(listener);
    addr.to_string()
}

fn write_config(dir: &Path, body: &str) -> PathBuf {
    let config_path = dir.join("strand.toml");
    fs::write(&config_path, body).expect("config should be written");
    config_path
}

fn parse_json_output(output: &[u8]) -> Value {
    serde_json::from_slice(output).expect("command output should be valid json")
}

fn http_client() -> reqwest::blocking::Client {
    reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
        .expect("http client should build")
}

fn wait_healthy(client: &reqwest::blocking::Client, base: &str) -> Value {
    let deadline = Instant::now() + Duration::from_secs(20);
    loop {
        if let Ok(response) = client.get(format!("{base}/healthz")).send() {
            assert_eq!(response.status(), reqwest::StatusCode::OK);
            return response.json().expect("health body should be json");
        }
        assert!(Instant::now() < deadline, "daemon never became healthy");
        std::thread::sleep(Duration::from_millis(100));
    }
}

#[test]
fn validate_only_accepts_good_config() {
    let temp = TempDir::new().expect("tempdir");
    let config = write_config(temp.path(), &format!("{MOCK_BACKEND}{SUMMARIZER}"));

    let stdout = strandd()
        .arg("--config")
        .arg(&config)
        .arg("--validate")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    assert_eq!(String::from_utf8_lossy(&stdout).trim(), "config is valid");
}

#[test]
fn invalid_config_fails_with_context() {
    let temp = TempDir::new().expect("tempdir");
    let config = write_config(temp.path(), "[server]\nbind_addr = \"nowhere\"\n");

    let stderr = strandd()
        .arg("--config")
        .arg(&config)
        .arg("--validate")
        .assert()
        .failure()
        .get_output()
        .stderr
        .clone();
    assert!(String::from_utf8_lossy(&stderr).contains("bind_addr"));
}

#[test]
fn missing_config_file_is_reported() {
    let temp = TempDir::new().expect("tempdir");
    let stderr = strandd()
        .arg("--config")
        .arg(temp.path().join("absent.toml"))
        .arg("--validate")
        .assert()
        .failure()
        .get_output()
        .stderr
        .clone();
    assert!(String::from_utf8_lossy(&stderr).contains("reading config"));
}

#[test]
fn one_shot_agent_run_prints_output_object() {
    let temp = TempDir::new().expect("tempdir");
    let config = write_config(temp.path(), &format!("{MOCK_BACKEND}{SUMMARIZER}"));

    let stdout = strandd()
        .arg("--config")
        .arg(&config)
        .arg("--workspace")
        .arg(temp.path())
        .args(["--agent", "summarizer", "--input", "topic=lifetimes"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();

    let output = parse_json_output(&stdout);
    assert_eq!(output["terminate_reason"], "goal");
    assert!(
        output["result"]
            .as_str()
            .unwrap_or_default()
            .contains("mock summary")
    );
}

#[test]
fn serve_accepts_tasks_and_reports_health() {
    let temp = TempDir::new().expect("tempdir");
    let bind_addr = allocate_addr();
    let config = write_config(
        temp.path(),
        &format!("[server]\nbind_addr = \"{bind_addr}\"\n{MOCK_BACKEND}"),
    );

    let child = StdCommand::new(assert_cmd::cargo::cargo_bin!("strandd"))
        .arg("--config")
        .arg(&config)
        .arg("--workspace")
        .arg(temp.path())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("daemon should start");
    let mut daemon = Cleanup { child };

    let client = http_client();
    let base = format!("http://{bind_addr}");
    let health = wait_healthy(&client, &base);
    assert_eq!(health["status"], "ok");

    let response = client
        .post(format!("{base}/api/v1/tasks"))
        .json(&serde_json::json!({"prompt": "hello there"}))
        .send()
        .expect("task response");
    assert_eq!(response.status(), reqwest::StatusCode::ACCEPTED);
    let accepted: Value = response.json().expect("accepted body should be json");
    assert_eq!(accepted["status"], "task accepted");
    assert!(accepted["sessionId"].as_str().is_some_and(|id| !id.is_empty()));

    let response = client
        .post(format!("{base}/api/v1/tasks"))
        .json(&serde_json::json!({"prompt": ""}))
        .send()
        .expect("rejection response");
    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
    drop(client);

    let killed = StdCommand::new("kill")
        .args(["-TERM", &daemon.child.id().to_string()])
        .status()
        .expect("kill should run");
    assert!(killed.success());

    let deadline = Instant::now() + Duration::from_secs(20);
    let status = loop {
        if let Some(status) = daemon.child.try_wait().expect("daemon status") {
            break status;
        }
        assert!(Instant::now() < deadline, "daemon did not stop on SIGTERM");
        std::thread::sleep(Duration::from_millis(100));
    };
    assert!(status.success(), "daemon exited with {status}");
}
