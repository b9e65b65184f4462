use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::net::TcpListener;
use std::path::Path;
use std::process::Command;
use std::thread;

use assert_cmd::prelude::*;
use predicates::prelude::*;
use predicates::str::contains;
use tempfile::TempDir;

fn shiba_cmd(home: &Path) -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("shiba-host"));
    cmd.env("HOME", home)
        .env("USERPROFILE", home)
        .env("RUST_LOG", "warn")
        .env("NO_COLOR", "1");
    cmd
}

#[test]
fn settings_path_is_under_home() {
    let home = TempDir::new().expect("home");
    shiba_cmd(home.path())
        .args(["settings", "path"])
        .assert()
        .success()
        .stdout(contains(".shiba").and(contains("settings.yaml")));
}

#[test]
fn settings_init_then_show() {
    let home = TempDir::new().expect("home");
    shiba_cmd(home.path())
        .args(["settings", "init"])
        .assert()
        .success()
        .stdout(contains("created"));
    assert!(home.path().join(".shiba/settings.yaml").exists());

    shiba_cmd(home.path())
        .args(["settings", "init"])
        .assert()
        .success()
        .stdout(contains("exists"));

    shiba_cmd(home.path())
        .args(["settings", "show"])
        .assert()
        .success()
        .stdout(contains("port: 5184").and(contains("location: built-in-cli")));
}

#[test]
fn settings_show_reports_parse_errors() {
    let home = TempDir::new().expect("home");
    fs::create_dir_all(home.path().join(".shiba")).expect("dir");
    fs::write(home.path().join(".shiba/settings.yaml"), "server: [oops").expect("write");

    shiba_cmd(home.path())
        .args(["settings", "show", "--json"])
        .assert()
        .failure()
        .stderr(contains("failed to load settings"));
}

#[test]
fn run_once_with_nothing_wanted_converges() {
    let home = TempDir::new().expect("home");
    let settings = home.path().join("custom.yaml");
    fs::write(&settings, "server:\n  port: 6001\n").expect("write");

    shiba_cmd(home.path())
        .env("TMPDIR", home.path())
        .args(["run", "--once", "--no-connect", "--no-load", "--settings"])
        .arg(&settings)
        .assert()
        .success()
        .stdout(contains("\"connected\": false").and(contains("\"converged\": true")));
}

#[test]
fn send_build_prints_server_events() {
    let home = TempDir::new().expect("home");
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().expect("addr").port();

    let server = thread::spawn(move || {
        let (stream, _) = listener.accept().expect("accept");
        let mut reader = BufReader::new(stream.try_clone().expect("clone"));
        let mut line = String::new();
        reader.read_line(&mut line).expect("read command");
        let mut writer = stream;
        writer
            .write_all(b"{\"event\":\"build-started\",\"target\":\"executable\"}\n")
            .expect("write event");
        writer.flush().expect("flush");
        line
    });

    shiba_cmd(home.path())
        .args(["send", "--port", &port.to_string(), "--wait-secs", "1"])
        .args(["build", "--mode", "updates", "--target", "executable"])
        .assert()
        .success()
        .stdout(contains("sent build").and(contains("build-started")));

    let command: serde_json::Value =
        serde_json::from_str(&server.join().expect("server thread")).expect("json");
    assert_eq!(command["command"], "build");
    assert_eq!(command["mode"], "updates");
    assert_eq!(command["target"], "executable");
}

#[test]
fn send_without_server_fails() {
    let home = TempDir::new().expect("home");
    let port = {
        let probe = TcpListener::bind("127.0.0.1:0").expect("bind");
        probe.local_addr().expect("addr").port()
    };
    shiba_cmd(home.path())
        .args(["send", "--port", &port.to_string(), "run"])
        .assert()
        .failure()
        .stderr(contains("failed to connect"));
}

#[test]
fn unknown_target_is_rejected() {
    let home = TempDir::new().expect("home");
    shiba_cmd(home.path())
        .args(["send", "build", "--target", "firmware"])
        .assert()
        .failure()
        .stderr(contains("unknown build target"));
}
