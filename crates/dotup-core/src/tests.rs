use crate::{
    native_architecture, parse_legacy_key, Config, InstallIdentity, InstallLayout, InstallMode,
    InstallScope,
};

#[test]
fn key_for_local_runtime_has_no_suffix() {
    let identity = InstallIdentity::new("7.0.16", Some("x64"), InstallMode::Runtime, InstallScope::Local);
    assert_eq!(identity.key(), "7.0.16~x64");
}

#[test]
fn key_for_local_sdk_has_no_suffix() {
    let identity = InstallIdentity::new("8.0.100", Some("x64"), InstallMode::Sdk, InstallScope::Local);
    assert_eq!(identity.key(), "8.0.100~x64");
}

#[test]
fn key_for_aspnetcore_appends_mode_suffix() {
    let identity = InstallIdentity::new(
        "7.0.16",
        Some("arm64"),
        InstallMode::AspNetCore,
        InstallScope::Local,
    );
    assert_eq!(identity.key(), "7.0.16~arm64~aspnetcore");
}

#[test]
fn key_for_global_scope_places_marker_before_mode_suffix() {
    let identity = InstallIdentity::new(
        "8.0.100",
        Some("x64"),
        InstallMode::AspNetCore,
        InstallScope::Global,
    );
    assert_eq!(identity.key(), "8.0.100~x64-global~aspnetcore");
}

#[test]
fn key_for_legacy_no_arch_omits_architecture_segment() {
    let identity = InstallIdentity::legacy_no_arch("7.0", InstallMode::Runtime);
    assert_eq!(identity.key(), "7.0");
}

#[test]
fn unset_architecture_defaults_to_native() {
    let identity = InstallIdentity::new("7.0.16", None, InstallMode::Runtime, InstallScope::Local);
    assert_eq!(identity.architecture.as_deref(), Some(native_architecture()));
}

#[test]
fn key_derivation_is_idempotent() {
    let identity = InstallIdentity::new("7.0.16", Some("x64"), InstallMode::Runtime, InstallScope::Local);
    assert_eq!(identity.key(), identity.key());
}

#[test]
fn equivalence_is_key_based() {
    let a = InstallIdentity::new("7.0.16", Some("x64"), InstallMode::Runtime, InstallScope::Local);
    let b = InstallIdentity::new("7.0.16", Some("x64"), InstallMode::Runtime, InstallScope::Local);
    let c = InstallIdentity::new("7.0.16", Some("arm64"), InstallMode::Runtime, InstallScope::Local);
    assert!(a.is_equivalent(&b));
    assert!(!a.is_equivalent(&c));
}

#[test]
fn parse_legacy_key_version_and_arch() {
    let parsed = parse_legacy_key("7.0~x64");
    assert_eq!(parsed.version, "7.0");
    assert_eq!(parsed.architecture.as_deref(), Some("x64"));
    assert_eq!(parsed.mode, InstallMode::Runtime);
    assert_eq!(parsed.scope, InstallScope::Local);
}

#[test]
fn parse_legacy_key_bare_runtime_version() {
    let parsed = parse_legacy_key("7.0.16");
    assert_eq!(parsed.version, "7.0.16");
    assert_eq!(parsed.architecture, None);
    assert_eq!(parsed.mode, InstallMode::Runtime);
    assert_eq!(parsed.scope, InstallScope::Local);
}

#[test]
fn parse_legacy_key_bare_sdk_version_uses_patch_heuristic() {
    let parsed = parse_legacy_key("8.0.100");
    assert_eq!(parsed.mode, InstallMode::Sdk);
}

#[test]
fn parse_legacy_key_prefers_global_marker_split() {
    // Both separators present: the marker split must win so the marker is
    // not absorbed into the architecture segment.
    let parsed = parse_legacy_key("8.0.100~x64-global");
    assert_eq!(parsed.version, "8.0.100");
    assert_eq!(parsed.architecture.as_deref(), Some("x64"));
    assert_eq!(parsed.scope, InstallScope::Global);
    assert_eq!(parsed.mode, InstallMode::Sdk);
}

#[test]
fn parse_legacy_key_global_aspnetcore() {
    let parsed = parse_legacy_key("8.0.100~x64-global~aspnetcore");
    assert_eq!(parsed.scope, InstallScope::Global);
    assert_eq!(parsed.mode, InstallMode::AspNetCore);
    assert_eq!(parsed.architecture.as_deref(), Some("x64"));
}

#[test]
fn parse_legacy_key_aspnetcore_without_arch() {
    let parsed = parse_legacy_key("7.0~aspnetcore");
    assert_eq!(parsed.version, "7.0");
    assert_eq!(parsed.architecture, None);
    assert_eq!(parsed.mode, InstallMode::AspNetCore);
}

#[test]
fn parse_legacy_key_round_trips_through_key() {
    for key in [
        "7.0",
        "7.0~x64",
        "7.0.16~arm64",
        "7.0~x64~aspnetcore",
        "8.0.100~x64-global",
        "8.0.100~x64-global~aspnetcore",
    ] {
        let parsed = parse_legacy_key(key);
        assert_eq!(parsed.key(), key, "key must survive a parse round trip");
        let reparsed = parse_legacy_key(&parsed.key());
        assert_eq!(reparsed.key(), key);
    }
}

#[test]
fn layout_install_dir_matches_directory_convention() {
    let layout = InstallLayout::with_install_dir_name("/tmp/dotup-root", ".dotnet");
    let identity = InstallIdentity::new("7.0.16", Some("x64"), InstallMode::Runtime, InstallScope::Local);
    assert_eq!(
        layout.install_dir(&identity),
        std::path::Path::new("/tmp/dotup-root/.dotnet/7.0.16~x64")
    );
}

#[test]
fn layout_state_paths_live_under_state_dir() {
    let layout = InstallLayout::with_install_dir_name("/tmp/dotup-root", ".dotnet");
    assert_eq!(
        layout.records_path(),
        std::path::Path::new("/tmp/dotup-root/state/records.json")
    );
    assert_eq!(
        layout.locks_dir(),
        std::path::Path::new("/tmp/dotup-root/state/locks")
    );
}

#[test]
fn install_dir_for_aspnetcore_carries_mode_segment() {
    let layout = InstallLayout::with_install_dir_name("/tmp/dotup-root", ".dotnet");
    let identity = InstallIdentity::new(
        "7.0.16",
        Some("x64"),
        InstallMode::AspNetCore,
        InstallScope::Local,
    );
    assert_eq!(
        layout.install_dir(&identity),
        std::path::Path::new("/tmp/dotup-root/.dotnet/7.0.16~x64~aspnetcore")
    );
}

#[test]
fn global_install_root_is_absolute_and_outside_any_storage_root() {
    let global = crate::global_install_root();
    assert!(global.is_absolute());
    let layout = InstallLayout::with_install_dir_name("/tmp/dotup-root", ".dotnet");
    assert!(!global.starts_with(layout.root()));
}

#[test]
fn config_defaults_when_empty() {
    let config = Config::from_toml_str("").expect("must parse empty config");
    assert_eq!(config.storage_root, None);
    assert_eq!(config.lock_timeout_ms, 20_000);
    assert_eq!(config.lock_retry_ms, 100);
    assert_eq!(config.install_timeout_secs, 600);
}

#[test]
fn config_parses_overrides() {
    let config = Config::from_toml_str(
        "storage_root = \"/opt/dotup\"\ninstall_dir_name = \".dotnet-test\"\nlock_timeout_ms = 5000\n",
    )
    .expect("must parse config");
    assert_eq!(
        config.storage_root.as_deref(),
        Some(std::path::Path::new("/opt/dotup"))
    );
    assert_eq!(config.install_dir_name.as_deref(), Some(".dotnet-test"));
    assert_eq!(config.lock_timeout_ms, 5000);
}

#[test]
fn config_rejects_unknown_fields() {
    let err = Config::from_toml_str("no_such_field = 1\n").expect_err("must reject unknown field");
    assert!(format!("{err:#}").contains("failed to parse dotup config"));
}
