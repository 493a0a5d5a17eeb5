//! Command line tests
//!
//! Run the `usg_aaa` binary against configuration files written to disk.

mod common;

use aaa_proto::ConfigSection;
use aaa_server::Config;
use common::{config, server, users_module};
use std::process::{Command, Output};
use tempfile::NamedTempFile;

fn validate(config: &Config) -> Output {
    let file = NamedTempFile::new().unwrap();
    config.to_file(file.path()).unwrap();
    Command::new(env!("CARGO_BIN_EXE_usg_aaa"))
        .arg("--validate")
        .arg(file.path())
        .output()
        .unwrap()
}

#[test]
fn test_validate_compiles_servers() {
    let output = validate(&config(
        vec![users_module()],
        vec![server(
            "default",
            "radius",
            vec![
                ConfigSection::new("recv", Some("Access-Request")).with_word("users"),
                ConfigSection::new("authenticate", Some("users")).with_word("users"),
            ],
        )],
    ));

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    assert!(stdout.contains("Configuration validated successfully"));
    assert!(stdout.contains("default (radius) - 2 compiled sections"));
}

#[test]
fn test_validate_rejects_unknown_module() {
    let output = validate(&config(
        vec![],
        vec![server(
            "default",
            "radius",
            vec![ConfigSection::new("recv", Some("Access-Request")).with_word("nosuchmodule")],
        )],
    ));

    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("Configuration validation failed"));
}
