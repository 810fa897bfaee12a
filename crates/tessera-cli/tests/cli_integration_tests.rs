//! CLI integration tests for tessera
//!
//! Runs the tessera binary end-to-end against temporary config and data directories.

use assert_cmd::Command;
use predicates::prelude::*;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

const ECHO_MANIFEST: &str = r#"{
    "name": "echo-tool",
    "version": "1.0.0",
    "description": "Echoes its input",
    "author": "Tessera",
    "permissions": ["dataStorage"],
    "entryPoint": "builtin:echo",
    "type": "tool",
    "autoEnable": true,
    "acceptsMessages": true
}"#;

/// Helper to create a command isolated in `home`
#[allow(deprecated)]
fn tessera_cmd(home: &Path) -> Command {
    let mut cmd = Command::cargo_bin("tessera").unwrap();
    cmd.env("TESSERA_CONFIG_DIR", home.join("config"));
    cmd.env("TESSERA_DATA_DIR", home.join("data"));
    cmd.env_remove("RUST_LOG");
    cmd
}

fn write_manifest(home: &Path, name: &str, contents: &str) -> PathBuf {
    let dir = home.join("manifests").join(name);
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("manifest.json");
    std::fs::write(&path, contents).unwrap();
    path
}

fn install(home: &Path, manifest: &Path) -> String {
    let output = tessera_cmd(home)
        .args(["plugins", "install", manifest.to_str().unwrap(), "--quiet"])
        .output()
        .unwrap();
    assert!(output.status.success(), "install failed: {:?}", output);
    String::from_utf8(output.stdout).unwrap().trim().to_string()
}

#[test]
fn test_help_lists_commands() {
    let home = TempDir::new().unwrap();
    tessera_cmd(home.path())
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("plugins"))
        .stdout(predicate::str::contains("exec"))
        .stdout(predicate::str::contains("send"));
}

#[test]
fn test_list_empty() {
    let home = TempDir::new().unwrap();
    tessera_cmd(home.path())
        .args(["plugins", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No plugins installed."));
}

#[test]
fn test_install_list_and_exec() {
    let home = TempDir::new().unwrap();
    let manifest = write_manifest(home.path(), "echo", ECHO_MANIFEST);
    let id = install(home.path(), &manifest);

    tessera_cmd(home.path())
        .args(["plugins", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains(&id))
        .stdout(predicate::str::contains("echo-tool v1.0.0 [active]"));

    tessera_cmd(home.path())
        .args(["exec", &id, "--input", r#"{"greeting":"hello"}"#])
        .assert()
        .success()
        .stdout(predicate::str::contains("Status: success"))
        .stdout(predicate::str::contains(r#""greeting":"hello""#));

    tessera_cmd(home.path())
        .args(["exec", &id, "--format", "json"])
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""success": true"#))
        .stdout(predicate::str::contains(&id));
}

#[test]
fn test_install_rejects_ungranted_permission() {
    let home = TempDir::new().unwrap();
    let manifest = write_manifest(
        home.path(),
        "writer",
        &ECHO_MANIFEST.replace("dataStorage", "fileSystemWrite"),
    );

    tessera_cmd(home.path())
        .args(["plugins", "install", manifest.to_str().unwrap()])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Permissions denied"))
        .stderr(predicate::str::contains("fileSystemWrite"));
}

#[test]
fn test_approved_permission_from_config() {
    let home = TempDir::new().unwrap();
    tessera_cmd(home.path())
        .args(["config", "set", "permissions.approved", "fileSystemWrite"])
        .assert()
        .success();

    let manifest = write_manifest(
        home.path(),
        "writer",
        &ECHO_MANIFEST.replace("dataStorage", "fileSystemWrite"),
    );
    let id = install(home.path(), &manifest);
    assert!(!id.is_empty());
}

#[test]
fn test_disabled_plugin_cannot_execute() {
    let home = TempDir::new().unwrap();
    let manifest = write_manifest(home.path(), "echo", ECHO_MANIFEST);
    let id = install(home.path(), &manifest);

    tessera_cmd(home.path())
        .args(["plugins", "disable", &id])
        .assert()
        .success()
        .stdout(predicate::str::contains("disabled"));

    tessera_cmd(home.path())
        .args(["exec", &id])
        .assert()
        .failure()
        .stderr(predicate::str::contains("is disabled"));

    tessera_cmd(home.path())
        .args(["plugins", "enable", &id])
        .assert()
        .success();

    tessera_cmd(home.path()).args(["exec", &id]).assert().success();
}

#[test]
fn test_uninstall_removes_plugin() {
    let home = TempDir::new().unwrap();
    let manifest = write_manifest(home.path(), "echo", ECHO_MANIFEST);
    let id = install(home.path(), &manifest);
    assert!(home.path().join("data").join("data").join(&id).is_dir());

    tessera_cmd(home.path())
        .args(["plugins", "uninstall", &id])
        .assert()
        .success();

    assert!(!home.path().join("data").join("data").join(&id).exists());
    tessera_cmd(home.path())
        .args(["exec", &id])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not found"));
}

#[test]
fn test_send_message_between_plugins() {
    let home = TempDir::new().unwrap();
    let sender_manifest = write_manifest(
        home.path(),
        "sender",
        &ECHO_MANIFEST
            .replace("echo-tool", "sender")
            .replace("dataStorage", "interPluginCommunication"),
    );
    let target_manifest = write_manifest(home.path(), "target", ECHO_MANIFEST);
    let sender = install(home.path(), &sender_manifest);
    let target = install(home.path(), &target_manifest);

    tessera_cmd(home.path())
        .args(["send", &sender, &target, "--payload", r#"{"n":1}"#])
        .assert()
        .success()
        .stdout(predicate::str::contains(format!("Reply from {}", target)))
        .stdout(predicate::str::contains("plugin_response"));

    // Reverse direction: target lacks interPluginCommunication
    tessera_cmd(home.path())
        .args(["send", &target, &sender])
        .assert()
        .failure()
        .stderr(predicate::str::contains("interPluginCommunication"));
}

#[test]
fn test_discover_lists_plugin_directory() {
    let home = TempDir::new().unwrap();
    let plugin_dir = home.path().join("data").join("plugins-src");
    std::fs::create_dir_all(plugin_dir.join("echo")).unwrap();
    std::fs::write(plugin_dir.join("echo").join("manifest.json"), ECHO_MANIFEST).unwrap();
    std::fs::create_dir_all(plugin_dir.join("broken")).unwrap();
    std::fs::write(plugin_dir.join("broken").join("manifest.json"), "{").unwrap();

    tessera_cmd(home.path())
        .args(["plugins", "discover"])
        .assert()
        .success()
        .stdout(predicate::str::contains("echo-tool v1.0.0 (tool)"))
        .stdout(predicate::str::contains("broken").not());
}

#[test]
fn test_config_get_set() {
    let home = TempDir::new().unwrap();

    tessera_cmd(home.path())
        .args(["config", "get", "ledger.capacity"])
        .assert()
        .success()
        .stdout(predicate::str::contains("1000"));

    tessera_cmd(home.path())
        .args(["config", "set", "sandbox.max_duration_secs", "5"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Set sandbox.max_duration_secs = 5"));

    tessera_cmd(home.path())
        .args(["config", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("sandbox.max_duration_secs = 5"));

    tessera_cmd(home.path())
        .args(["config", "set", "ledger.capacity", "0"])
        .assert()
        .failure();
}
