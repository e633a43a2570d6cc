use super::*;
use crate::dispatch::{detect_package_type, peek_package_id, run_cli};
use appinst_core::PackageType;
use appinst_installer::{InstallerLayout, Status};
use appinst_registry::{FileRegistry, PackageRegistry};
use clap::error::ErrorKind;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

static COUNTER: AtomicU64 = AtomicU64::new(0);

const PKGID: &str = "org.example.notes";
const UID: u32 = 6001;

fn test_root() -> PathBuf {
    let path = std::env::temp_dir().join(format!(
        "appinst-cli-tests-{}-{}",
        std::process::id(),
        COUNTER.fetch_add(1, Ordering::Relaxed)
    ));
    let _ = fs::remove_dir_all(&path);
    fs::create_dir_all(&path).expect("must create test root");
    path
}

fn write_config(root: &Path) -> PathBuf {
    let path = root.join("config.toml");
    fs::write(
        &path,
        format!(
            "version = 1\nroot = \"{}\"\nallow_unsigned = true\nlog_filter = \"warn\"\n",
            root.join("prefix").display()
        ),
    )
    .expect("must write config");
    path
}

fn write_package(root: &Path, version: &str) -> PathBuf {
    let dir = root.join(format!("notes-{version}"));
    fs::create_dir_all(dir.join("bin")).expect("must create package");
    fs::write(
        dir.join("tizen-manifest.toml"),
        format!(
            "package = \"{PKGID}\"\nversion = \"{version}\"\n\n[[applications]]\napp_id = \"{PKGID}.main\"\nexec = \"bin/notes\"\n"
        ),
    )
    .expect("must write manifest");
    fs::write(dir.join("bin").join("notes"), version).expect("must write binary");
    dir
}

fn run(config: &Path, args: &[&str]) -> i32 {
    let uid = UID.to_string();
    let config = config.display().to_string();
    let mut argv = vec!["appinst", "--config", config.as_str(), "--uid", uid.as_str()];
    argv.extend_from_slice(args);
    run_cli(Cli::try_parse_from(argv).expect("command must parse"))
}

fn registered_version(root: &Path) -> Option<String> {
    let layout = InstallerLayout::new(root.join("prefix"));
    FileRegistry::new(layout.registry_dir())
        .registration(PKGID, UID)
        .expect("registry must be readable")
        .map(|record| record.version)
}

#[test]
fn cli_parses_global_flags_after_subcommand() {
    let cli = Cli::try_parse_from([
        "appinst",
        "install",
        "/tmp/pkg.tpk",
        "--tep",
        "/tmp/extra.tep",
        "--global",
        "--uid",
        "42",
    ])
    .expect("command must parse");

    assert!(cli.global);
    assert_eq!(cli.uid, Some(42));
    match cli.command {
        Commands::Install { path, tep } => {
            assert_eq!(path, PathBuf::from("/tmp/pkg.tpk"));
            assert_eq!(tep, Some(PathBuf::from("/tmp/extra.tep")));
        }
        other => panic!("unexpected command: {other:?}"),
    }
}

#[test]
fn cli_recover_file_is_optional() {
    let cli = Cli::try_parse_from(["appinst", "recover"]).expect("command must parse");
    assert!(matches!(cli.command, Commands::Recover { file: None }));

    let err = Cli::try_parse_from(["appinst", "uninstall"])
        .expect_err("pkgid is required");
    assert_eq!(err.kind(), ErrorKind::MissingRequiredArgument);
}

#[test]
fn package_id_is_read_from_unpacked_directory() {
    let root = test_root();
    let package = write_package(&root, "1.0.0");

    let package_type = detect_package_type(&package).expect("must detect type");
    assert_eq!(package_type, PackageType::Tpk);
    assert_eq!(
        peek_package_id(&package, package_type).expect("must read pkgid"),
        PKGID
    );
    assert!(detect_package_type(&root.join("missing.tpk")).is_err());

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn install_update_uninstall_round_trip() {
    let root = test_root();
    let config = write_config(&root);

    let v1 = write_package(&root, "1.0.0");
    assert_eq!(run(&config, &["install", v1.to_str().expect("utf-8 path")]), 0);
    assert_eq!(registered_version(&root).as_deref(), Some("1.0.0"));

    let v2 = write_package(&root, "1.2.0");
    assert_eq!(run(&config, &["install", v2.to_str().expect("utf-8 path")]), 0);
    assert_eq!(registered_version(&root).as_deref(), Some("1.2.0"));

    assert_eq!(run(&config, &["clear", PKGID]), 0);
    assert_eq!(run(&config, &["uninstall", PKGID]), 0);
    assert_eq!(registered_version(&root), None);
    assert_eq!(
        run(&config, &["uninstall", PKGID]),
        Status::PackageNotFound.exit_code()
    );

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn recover_without_pending_files_succeeds() {
    let root = test_root();
    let config = write_config(&root);

    assert_eq!(run(&config, &["recover"]), 0);

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn invalid_config_maps_to_config_error() {
    let root = test_root();
    let config = root.join("config.toml");
    fs::write(&config, "version = 9\n").expect("must write config");

    assert_eq!(
        run(&config, &["recover"]),
        Status::ConfigError.exit_code()
    );

    let _ = fs::remove_dir_all(&root);
}
