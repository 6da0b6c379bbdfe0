// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use tempfile::TempDir;

struct MeshsigCmd {
    cmd: Command,
}

impl MeshsigCmd {
    fn new(dir: &Path) -> Self {
        let mut cmd = Command::new(env!("CARGO_BIN_EXE_meshsig"));
        cmd.arg("--cache").arg(dir.join("discovery.redb"));
        cmd.env_remove("RUST_LOG");
        cmd.env_remove("MESHSIG_LOG_JSON");
        Self { cmd }
    }

    fn config(mut self, path: &Path) -> Self {
        self.cmd.arg("--config").arg(path);
        self
    }

    fn args(mut self, args: &[&str]) -> Self {
        self.cmd.args(args);
        self
    }

    fn run(mut self) -> Output {
        self.cmd.output().expect("failed to run meshsig")
    }
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

fn write_config(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("config.toml");
    std::fs::write(&path, body).unwrap();
    path
}

fn node_config(dir: &Path) -> PathBuf {
    write_config(
        dir,
        r#"
dialable_addrs = ["/ip4/192.0.2.10/tcp/4001/p2p/peer-cli"]
relay_addrs = ["/dns4/relay.example/tcp/443/wss/p2p/relay/p2p-circuit/p2p/peer-cli"]
base_delay_ms = 10
"#,
    )
}

#[test]
fn test_keygen_writes_private_key_file() {
    let dir = TempDir::new().unwrap();
    let key = dir.path().join("keys").join("signer.key");

    let output = MeshsigCmd::new(dir.path())
        .args(&["keygen", "--output", key.to_str().unwrap()])
        .run();
    assert!(output.status.success(), "{}", stderr(&output));
    let secret = std::fs::read_to_string(&key).unwrap();
    assert_eq!(secret.trim().len(), 64);

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(&key).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    let again = MeshsigCmd::new(dir.path())
        .args(&["keygen", "--output", key.to_str().unwrap()])
        .run();
    assert!(!again.status.success());
    assert_eq!(std::fs::read_to_string(&key).unwrap(), secret);
}

#[test]
fn test_advertise_import_and_inspect_cache() {
    let dir = TempDir::new().unwrap();
    let config = node_config(dir.path());
    let key = dir.path().join("signer.key");
    let keygen = MeshsigCmd::new(dir.path())
        .args(&["keygen", "--output", key.to_str().unwrap()])
        .run();
    assert!(keygen.status.success(), "{}", stderr(&keygen));

    let advertise = MeshsigCmd::new(dir.path())
        .config(&config)
        .args(&[
            "advertise",
            "--key",
            key.to_str().unwrap(),
            "--peer-id",
            "peer-cli",
            "--kind",
            "transfer",
            "--fee",
            "25",
            "--import",
        ])
        .run();
    assert!(advertise.status.success(), "{}", stderr(&advertise));
    let json: serde_json::Value = serde_json::from_slice(&advertise.stdout).unwrap();
    assert_eq!(json["peerId"], "peer-cli");
    assert_eq!(json["relayAddrs"].as_array().unwrap().len(), 1);

    let ad_file = dir.path().join("ad.json");
    std::fs::write(&ad_file, &advertise.stdout).unwrap();

    let list = MeshsigCmd::new(dir.path()).args(&["cache", "list"]).run();
    assert!(list.status.success(), "{}", stderr(&list));
    assert!(stderr(&list).contains("peer-cli"));

    let show = MeshsigCmd::new(dir.path())
        .args(&["cache", "show", "peer-cli"])
        .run();
    assert!(show.status.success());
    assert!(stderr(&show).contains("manual"));

    let remove = MeshsigCmd::new(dir.path())
        .args(&["cache", "remove", "peer-cli"])
        .run();
    assert!(remove.status.success());
    let missing = MeshsigCmd::new(dir.path())
        .args(&["cache", "show", "peer-cli"])
        .run();
    assert!(!missing.status.success());

    let import = MeshsigCmd::new(dir.path())
        .args(&["cache", "import", ad_file.to_str().unwrap()])
        .run();
    assert!(import.status.success(), "{}", stderr(&import));
    let show = MeshsigCmd::new(dir.path())
        .args(&["cache", "show", "peer-cli"])
        .run();
    assert!(show.status.success());
}

#[test]
fn test_tampered_advertisement_refused() {
    let dir = TempDir::new().unwrap();
    let key = dir.path().join("signer.key");
    assert!(MeshsigCmd::new(dir.path())
        .args(&["keygen", "--output", key.to_str().unwrap()])
        .run()
        .status
        .success());
    let advertise = MeshsigCmd::new(dir.path())
        .config(&node_config(dir.path()))
        .args(&["advertise", "--key", key.to_str().unwrap(), "--peer-id", "peer-cli"])
        .run();
    assert!(advertise.status.success(), "{}", stderr(&advertise));

    let mut json: serde_json::Value = serde_json::from_slice(&advertise.stdout).unwrap();
    json["capabilities"]["fee"] = serde_json::json!(1_000_000);
    let ad_file = dir.path().join("ad.json");
    std::fs::write(&ad_file, serde_json::to_vec(&json).unwrap()).unwrap();

    let import = MeshsigCmd::new(dir.path())
        .args(&["cache", "import", ad_file.to_str().unwrap()])
        .run();
    assert!(!import.status.success());
    let list = MeshsigCmd::new(dir.path()).args(&["cache", "list"]).run();
    assert!(stderr(&list).contains("empty"));
}

#[test]
fn test_invalid_config_exits_with_code_2() {
    let dir = TempDir::new().unwrap();
    let config = write_config(dir.path(), "connect_timeout_secs = 0\n");
    let output = MeshsigCmd::new(dir.path())
        .config(&config)
        .args(&["config", "show"])
        .run();
    assert_eq!(output.status.code(), Some(2));
    assert!(stderr(&output).contains("Invalid config"));
}

#[test]
fn test_simulated_mesh_signs() {
    let dir = TempDir::new().unwrap();
    let output = MeshsigCmd::new(dir.path())
        .config(&node_config(dir.path()))
        .args(&["simulate", "-n", "3"])
        .run();
    assert!(output.status.success(), "{}", stderr(&output));
    assert!(stderr(&output).contains("3 participant(s) produced this signature"));
}

#[test]
fn test_simulated_mesh_respects_quorum_policy() {
    let dir = TempDir::new().unwrap();
    let strict = MeshsigCmd::new(dir.path())
        .config(&node_config(dir.path()))
        .args(&["simulate", "-n", "3", "--unreachable", "1"])
        .run();
    assert_eq!(strict.status.code(), Some(1));
    assert!(stderr(&strict).contains("sim-2"));

    let lenient = write_config(
        dir.path(),
        "base_delay_ms = 10\nallow_partial_connectivity = true\nmin_connected_participants = 2\n",
    );
    let output = MeshsigCmd::new(dir.path())
        .config(&lenient)
        .args(&["simulate", "-n", "3", "--unreachable", "1"])
        .run();
    assert!(output.status.success(), "{}", stderr(&output));
    assert!(stderr(&output).contains("Excluded unreachable participant sim-2"));
    assert!(stderr(&output).contains("2 participant(s) produced this signature"));
}
