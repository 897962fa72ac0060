//! CLI smoke tests; backends are local one-shot servers at most

use assert_cmd::Command;
use predicates::prelude::*;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpListener;

fn vidrelay(home: &std::path::Path) -> Command {
    let mut cmd = Command::cargo_bin("vidrelay").unwrap();
    cmd.current_dir(home)
        .env("HOME", home)
        .env_remove("VIDRELAY_CONFIG")
        .env_remove("VIDRELAY_BACKEND")
        .env_remove("RUST_LOG")
        .env_remove("HTTP_PROXY")
        .env_remove("http_proxy")
        .env_remove("ALL_PROXY")
        .env_remove("all_proxy");
    cmd
}

/// Answer a single request with a JSON body, returning the base URL
fn serve_once(body: &'static str) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    std::thread::spawn(move || {
        let Ok((mut stream, _)) = listener.accept() else {
            return;
        };
        let mut reader = BufReader::new(stream.try_clone().unwrap());
        let mut content_length = 0;
        loop {
            let mut line = String::new();
            if reader.read_line(&mut line).unwrap_or(0) == 0 || line == "\r\n" {
                break;
            }
            if let Some(value) = line.to_ascii_lowercase().strip_prefix("content-length:") {
                content_length = value.trim().parse().unwrap_or(0);
            }
        }
        let mut request_body = vec![0; content_length];
        let _ = reader.read_exact(&mut request_body);

        let response = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            body.len(),
            body
        );
        let _ = stream.write_all(response.as_bytes());
    });
    format!("http://{}", addr)
}

#[test]
fn test_config_prints_defaults() {
    let dir = tempfile::tempdir().unwrap();
    vidrelay(dir.path())
        .arg("config")
        .assert()
        .success()
        .stdout(predicate::str::contains("base_url = \"http://127.0.0.1:5000\""))
        .stdout(predicate::str::contains("[progress.platform]"));
}

#[test]
fn test_backend_flag_overrides_config() {
    let dir = tempfile::tempdir().unwrap();
    vidrelay(dir.path())
        .args(["--backend", "http://10.1.2.3:8000", "config"])
        .assert()
        .success()
        .stdout(predicate::str::contains("http://10.1.2.3:8000"));
}

#[test]
fn test_info_rejects_empty_reference() {
    let dir = tempfile::tempdir().unwrap();
    vidrelay(dir.path())
        .args(["info", ""])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Please enter a video reference"));
}

#[test]
fn test_invalid_backend_url() {
    let dir = tempfile::tempdir().unwrap();
    vidrelay(dir.path())
        .args(["--backend", "not a url", "folders"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid backend base_url"));
}

#[test]
fn test_init_writes_config() {
    let dir = tempfile::tempdir().unwrap();
    vidrelay(dir.path()).arg("init").assert().success();

    let written = std::fs::read_to_string(dir.path().join(".vidrelay/config.toml")).unwrap();
    assert!(written.contains("[backend.paths]"));

    // The written file is picked up on the next run
    vidrelay(dir.path())
        .arg("config")
        .assert()
        .success()
        .stdout(predicate::str::contains("get_video_info"));
}

#[test]
fn test_missing_config_file() {
    let dir = tempfile::tempdir().unwrap();
    vidrelay(dir.path())
        .args(["--config", "nope.toml", "config"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Config file not found"));
}

#[test]
fn test_info_reports_stage_of_backend_error() {
    let dir = tempfile::tempdir().unwrap();
    let base_url = serve_once(r#"{"error": "Video unavailable"}"#);
    vidrelay(dir.path())
        .args(["--backend", &base_url, "info", "abc123"])
        .assert()
        .failure()
        .stderr(predicate::str::contains(
            "Error fetching video info: Video unavailable",
        ));
}
