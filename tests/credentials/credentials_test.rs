//! Coverage for credential loading and permission checks.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use wagate::credentials::{load_credentials, Credentials};

fn temp_env_path(dir: &tempfile::TempDir) -> PathBuf {
    dir.path().join(".env")
}

#[cfg(unix)]
fn make_private(path: &std::path::Path) {
    use std::os::unix::fs::PermissionsExt;

    let perms = fs::set_permissions(path, fs::Permissions::from_mode(0o600));
    assert!(perms.is_ok());
}

#[cfg(not(unix))]
fn make_private(_path: &std::path::Path) {}

#[test]
fn loads_env_credentials() {
    let dir = tempfile::tempdir().expect("should create temp dir");
    let env_path = temp_env_path(&dir);
    let write = fs::write(&env_path, "WAGATE_BRIDGE_TOKEN=secret-token\nOTHER=value\n");
    assert!(write.is_ok());
    make_private(&env_path);

    let credentials = match load_credentials(&env_path) {
        Ok(credentials) => credentials,
        Err(err) => panic!("credentials should load: {err}"),
    };

    assert_eq!(credentials.get("WAGATE_BRIDGE_TOKEN"), Some("secret-token"));
    assert_eq!(credentials.get("OTHER"), Some("value"));
}

#[test]
fn missing_file_yields_empty_credentials() {
    let dir = tempfile::tempdir().expect("should create temp dir");

    let credentials = load_credentials(&temp_env_path(&dir)).expect("missing file is fine");

    assert_eq!(credentials.get("WAGATE_BRIDGE_TOKEN"), None);
}

#[test]
fn blank_values_are_treated_as_absent() {
    let mut vars = BTreeMap::new();
    vars.insert("WAGATE_BRIDGE_TOKEN".to_owned(), "   ".to_owned());
    let credentials = Credentials::from_map(vars);

    assert_eq!(credentials.get("WAGATE_BRIDGE_TOKEN"), None);
}

#[test]
fn debug_output_redacts_values() {
    let mut vars = BTreeMap::new();
    vars.insert("WAGATE_BRIDGE_TOKEN".to_owned(), "secret-token".to_owned());
    let rendered = format!("{:?}", Credentials::from_map(vars));

    assert!(rendered.contains("WAGATE_BRIDGE_TOKEN"));
    assert!(!rendered.contains("secret-token"));
}

#[cfg(unix)]
#[test]
fn rejects_world_readable_env_file() {
    use std::os::unix::fs::PermissionsExt;

    let dir = tempfile::tempdir().expect("should create temp dir");
    let env_path = temp_env_path(&dir);
    let write = fs::write(&env_path, "WAGATE_BRIDGE_TOKEN=secret-token\n");
    assert!(write.is_ok());

    let perms = fs::set_permissions(&env_path, fs::Permissions::from_mode(0o644));
    assert!(perms.is_ok());

    let loaded = load_credentials(&env_path);
    assert!(loaded.is_err());
}
