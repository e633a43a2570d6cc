use super::*;
use std::cell::RefCell;
use std::fs;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use appinst_core::{PackageType, PrivilegeLevel, RequestMode, RequestType};
use appinst_registry::{FileRegistry, PackageRegistry};
use appinst_security::{
    reference_digest, sha256_hex, SignatureEntry, SignatureFile, SignatureRole,
    SIGNATURE_FILE_NAME,
};
use ed25519_dalek::{Signer, SigningKey};

use crate::fs_utils::{backup_path_for, create_dir, move_dir, move_file, restore_backup};
use crate::steps::{
    ManifestSource, StepConfigure, StepCopy, StepCopyBackup, StepCreateRecoveryFile,
    StepGenerateManifest, StepParseManifest, StepRegisterApplication,
    StepRemoveStorageDirectories, StepUnzip,
};

const PKGID: &str = "org.example.clock";
const UID: u32 = 5001;

static COUNTER: AtomicU64 = AtomicU64::new(0);

fn unique_dir(label: &str) -> PathBuf {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system time")
        .as_nanos();
    let path = std::env::temp_dir().join(format!(
        "appinst-installer-{label}-{}-{nanos}-{}",
        std::process::id(),
        COUNTER.fetch_add(1, Ordering::Relaxed)
    ));
    let _ = fs::remove_dir_all(&path);
    fs::create_dir_all(&path).expect("must create test dir");
    path
}

fn test_layout() -> InstallerLayout {
    InstallerLayout::new(unique_dir("prefix"))
}

fn unsigned_config() -> InstallerConfig {
    InstallerConfig {
        allow_unsigned: true,
        ..InstallerConfig::default()
    }
}

fn write_tpk(root: &Path, version: &str, with_icon: bool) -> PathBuf {
    let dir = root.join(format!("tpk-{version}"));
    fs::create_dir_all(dir.join("bin")).expect("must create bin");
    fs::create_dir_all(dir.join("res")).expect("must create res");
    let icon_line = if with_icon {
        "icon = \"res/icon.png\"\n"
    } else {
        ""
    };
    fs::write(
        dir.join("tizen-manifest.toml"),
        format!(
            "package = \"{PKGID}\"\nversion = \"{version}\"\n\n[[applications]]\napp_id = \"{PKGID}.ui\"\nexec = \"bin/clock\"\n{icon_line}"
        ),
    )
    .expect("must write manifest");
    fs::write(dir.join("bin").join("clock"), format!("clock {version}\n"))
        .expect("must write binary");
    if with_icon {
        fs::write(dir.join("res").join("icon.png"), version.as_bytes()).expect("must write icon");
    }
    dir
}

fn write_wgt(root: &Path) -> PathBuf {
    let dir = root.join("wgt");
    fs::create_dir_all(&dir).expect("must create widget dir");
    fs::write(
        dir.join("config.toml"),
        format!(
            "package = \"{PKGID}\"\nversion = \"2.0.0\"\n\n[[applications]]\napp_id = \"{PKGID}.widget\"\nexec = \"index.html\"\nicon = \"icon.png\"\n\n[widget]\nstart_file = \"index.html\"\n"
        ),
    )
    .expect("must write widget config");
    fs::write(dir.join("index.html"), b"<html></html>\n").expect("must write start file");
    fs::write(dir.join("icon.png"), b"png").expect("must write icon");
    dir
}

fn sign_package(dir: &Path, author: &SigningKey, distributor: &SigningKey) {
    let digest = reference_digest(dir).expect("must digest");
    let entry = |role, key: &SigningKey| SignatureEntry {
        role,
        public_key: hex::encode(key.verifying_key().as_bytes()),
        digest: digest.clone(),
        signature: hex::encode(key.sign(digest.as_bytes()).to_bytes()),
    };
    let file = SignatureFile {
        signatures: vec![
            entry(SignatureRole::Author, author),
            entry(SignatureRole::Distributor, distributor),
        ],
    };
    fs::write(
        dir.join(SIGNATURE_FILE_NAME),
        file.to_toml_string().expect("must render signatures"),
    )
    .expect("must write signatures");
}

fn context(
    layout: &InstallerLayout,
    request: RequestType,
    package_type: PackageType,
    file_path: &Path,
) -> InstallerContext {
    let mut ctx = InstallerContext::new(layout.clone(), request, package_type);
    ctx.uid = UID;
    ctx.file_path = file_path.to_path_buf();
    ctx
}

fn run_request(
    layout: &InstallerLayout,
    config: &InstallerConfig,
    mut ctx: InstallerContext,
) -> (RunOutcome, AppInstaller, InstallerContext) {
    let services = config.services(layout);
    let mut installer =
        build_pipeline(ctx.request_type, &services).expect("pipeline must build");
    let outcome = installer.run(&mut ctx);
    (outcome, installer, ctx)
}

fn install(layout: &InstallerLayout, config: &InstallerConfig, source: &Path) {
    let ctx = context(layout, RequestType::Install, PackageType::Tpk, source);
    let (outcome, installer, _) = run_request(layout, config, ctx);
    assert_eq!(
        outcome,
        RunOutcome::Ok,
        "install must succeed: {:?}",
        installer.last_error()
    );
}

fn registry(layout: &InstallerLayout) -> FileRegistry {
    FileRegistry::new(layout.registry_dir())
}

fn registered_version(layout: &InstallerLayout) -> Option<String> {
    registry(layout)
        .registration(PKGID, UID)
        .expect("registry must be readable")
        .map(|record| record.version)
}

fn package_path(layout: &InstallerLayout) -> PathBuf {
    layout
        .apps_root(appinst_registry::RegistryScope::User(UID))
        .join(PKGID)
}

fn installed_manifest(layout: &InstallerLayout) -> PathBuf {
    layout
        .manifests_dir(appinst_registry::RegistryScope::User(UID))
        .join(format!("{PKGID}.toml"))
}

fn icon_dir(layout: &InstallerLayout) -> PathBuf {
    layout
        .icons_dir(appinst_registry::RegistryScope::User(UID))
        .join(PKGID)
}

fn dir_entries(dir: &Path) -> Vec<String> {
    match fs::read_dir(dir) {
        Ok(entries) => {
            let mut names = entries
                .map(|entry| {
                    entry
                        .expect("must read entry")
                        .file_name()
                        .to_string_lossy()
                        .into_owned()
                })
                .collect::<Vec<_>>();
            names.sort();
            names
        }
        Err(_) => Vec::new(),
    }
}

fn assert_no_backups(layout: &InstallerLayout) {
    for path in [
        backup_path_for(&package_path(layout)),
        backup_path_for(&installed_manifest(layout)),
        backup_path_for(&icon_dir(layout)),
    ] {
        assert!(!path.exists(), "backup must be gone: {}", path.display());
    }
}

type Log = Rc<RefCell<Vec<String>>>;

/// Scripted step recording each phase it runs.
struct Scripted {
    label: &'static str,
    log: Log,
    fail_precheck: bool,
    fail_process: Option<Status>,
    fail_undo: bool,
    fail_clean: bool,
}

impl Scripted {
    fn new(label: &'static str, log: &Log) -> Self {
        Self {
            label,
            log: log.clone(),
            fail_precheck: false,
            fail_process: None,
            fail_undo: false,
            fail_clean: false,
        }
    }

    fn record(&self, phase: &str) {
        self.log.borrow_mut().push(format!("{phase}:{}", self.label));
    }
}

impl Step for Scripted {
    fn name(&self) -> &'static str {
        self.label
    }

    fn precheck(&mut self, _ctx: &InstallerContext) -> StepResult {
        self.record("precheck");
        if self.fail_precheck {
            return Err(StepError::new(Status::InvalidValue, "precheck rejected"));
        }
        Ok(())
    }

    fn process(&mut self, _ctx: &mut InstallerContext) -> StepResult {
        self.record("process");
        match self.fail_process {
            Some(status) => Err(StepError::new(status, "process failed")),
            None => Ok(()),
        }
    }

    fn clean(&mut self, _ctx: &mut InstallerContext) -> StepResult {
        self.record("clean");
        if self.fail_clean {
            return Err(StepError::new(Status::Error, "clean failed"));
        }
        Ok(())
    }

    fn undo(&mut self, _ctx: &mut InstallerContext) -> StepResult {
        self.record("undo");
        if self.fail_undo {
            return Err(StepError::new(Status::Error, "undo failed"));
        }
        Ok(())
    }
}

/// Forwards to a real step and records process/undo calls.
struct Recorded<S> {
    inner: S,
    log: Log,
}

impl<S: Step> Step for Recorded<S> {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    fn precheck(&mut self, ctx: &InstallerContext) -> StepResult {
        self.inner.precheck(ctx)
    }

    fn process(&mut self, ctx: &mut InstallerContext) -> StepResult {
        self.log
            .borrow_mut()
            .push(format!("process:{}", self.inner.name()));
        self.inner.process(ctx)
    }

    fn clean(&mut self, ctx: &mut InstallerContext) -> StepResult {
        self.inner.clean(ctx)
    }

    fn undo(&mut self, ctx: &mut InstallerContext) -> StepResult {
        self.log
            .borrow_mut()
            .push(format!("undo:{}", self.inner.name()));
        self.inner.undo(ctx)
    }
}

/// Leaves the recovery file on disk and aborts the run without any undo or
/// clean, like a killed process would.
struct Crash {
    recovery_path: Rc<RefCell<Option<PathBuf>>>,
}

impl Step for Crash {
    fn name(&self) -> &'static str {
        "crash"
    }

    fn process(&mut self, ctx: &mut InstallerContext) -> StepResult {
        if let Some(file) = ctx.recovery_info.take() {
            *self.recovery_path.borrow_mut() = Some(file.detach());
        }
        panic!("simulated crash");
    }
}

fn run_until_crash(installer: &mut AppInstaller, ctx: &mut InstallerContext) {
    let result = panic::catch_unwind(AssertUnwindSafe(|| installer.run(ctx)));
    assert!(result.is_err(), "crash step must abort the run");
}

fn recover(layout: &InstallerLayout, config: &InstallerConfig, recovery_path: &Path) -> RunOutcome {
    let package_type =
        RecoveryFile::package_type_from_path(recovery_path).expect("must name package type");
    let ctx = context(layout, RequestType::Recovery, package_type, recovery_path);
    let (outcome, installer, _) = run_request(layout, config, ctx);
    assert_eq!(installer.last_error(), None);
    outcome
}

#[test]
fn prechecks_run_before_any_process_and_clean_runs_forward() {
    let layout = test_layout();
    let log = Log::default();
    let mut installer = AppInstaller::new();
    installer
        .add_step(Scripted::new("a", &log))
        .add_step(Scripted::new("b", &log))
        .add_step(Scripted::new("c", &log));

    let mut ctx = context(&layout, RequestType::Install, PackageType::Tpk, layout.prefix());
    let outcome = installer.run(&mut ctx);

    assert_eq!(outcome, RunOutcome::Ok);
    assert_eq!(installer.exit_code(outcome), 0);
    assert_eq!(
        *log.borrow(),
        vec![
            "precheck:a",
            "precheck:b",
            "precheck:c",
            "process:a",
            "process:b",
            "process:c",
            "clean:a",
            "clean:b",
            "clean:c",
        ]
    );

    let _ = fs::remove_dir_all(layout.prefix());
}

#[test]
fn precheck_failure_stops_before_any_process() {
    let layout = test_layout();
    let log = Log::default();
    let mut failing = Scripted::new("b", &log);
    failing.fail_precheck = true;
    let mut installer = AppInstaller::new();
    installer
        .add_step(Scripted::new("a", &log))
        .add_step(failing)
        .add_step(Scripted::new("c", &log));

    let mut ctx = context(&layout, RequestType::Install, PackageType::Tpk, layout.prefix());
    let outcome = installer.run(&mut ctx);

    assert_eq!(outcome, RunOutcome::Error);
    assert_eq!(*log.borrow(), vec!["precheck:a", "precheck:b"]);
    assert_eq!(
        installer.exit_code(outcome),
        Status::InvalidValue.exit_code()
    );

    let _ = fs::remove_dir_all(layout.prefix());
}

#[test]
fn process_failure_undoes_failed_step_then_earlier_steps_in_reverse() {
    let layout = test_layout();
    let log = Log::default();
    let mut failing = Scripted::new("c", &log);
    failing.fail_process = Some(Status::ManifestError);
    let mut installer = AppInstaller::new();
    installer
        .add_step(Scripted::new("a", &log))
        .add_step(Scripted::new("b", &log))
        .add_step(failing)
        .add_step(Scripted::new("d", &log));

    let mut ctx = context(&layout, RequestType::Install, PackageType::Tpk, layout.prefix());
    let outcome = installer.run(&mut ctx);

    assert_eq!(outcome, RunOutcome::Error);
    let log = log.borrow();
    let after_prechecks = &log[4..];
    assert_eq!(
        after_prechecks,
        ["process:a", "process:b", "process:c", "undo:c", "undo:b", "undo:a"]
    );
    let err = installer.last_error().expect("error must be recorded");
    assert_eq!(err.status, Status::ManifestError);
    assert_eq!(
        installer.exit_code(outcome),
        Status::ManifestError.exit_code()
    );

    let _ = fs::remove_dir_all(layout.prefix());
}

#[test]
fn undo_failure_does_not_stop_rollback() {
    let layout = test_layout();
    let log = Log::default();
    let mut bad_undo = Scripted::new("b", &log);
    bad_undo.fail_undo = true;
    let mut failing = Scripted::new("c", &log);
    failing.fail_process = Some(Status::IconError);
    let mut installer = AppInstaller::new();
    installer
        .add_step(Scripted::new("a", &log))
        .add_step(bad_undo)
        .add_step(failing);

    let mut ctx = context(&layout, RequestType::Install, PackageType::Tpk, layout.prefix());
    let outcome = installer.run(&mut ctx);

    assert_eq!(outcome, RunOutcome::Error);
    assert!(log.borrow().ends_with(&[
        "undo:c".to_string(),
        "undo:b".to_string(),
        "undo:a".to_string()
    ]));
    assert_eq!(
        installer.last_error().map(|err| err.status),
        Some(Status::IconError)
    );

    let _ = fs::remove_dir_all(layout.prefix());
}

#[test]
fn clean_failure_keeps_ok_outcome() {
    let layout = test_layout();
    let log = Log::default();
    let mut bad_clean = Scripted::new("a", &log);
    bad_clean.fail_clean = true;
    let mut installer = AppInstaller::new();
    installer
        .add_step(bad_clean)
        .add_step(Scripted::new("b", &log));

    let mut ctx = context(&layout, RequestType::Install, PackageType::Tpk, layout.prefix());
    let outcome = installer.run(&mut ctx);

    assert_eq!(outcome, RunOutcome::Ok);
    assert!(log.borrow().ends_with(&["clean:a".to_string(), "clean:b".to_string()]));
    assert!(installer.last_error().is_none());

    let _ = fs::remove_dir_all(layout.prefix());
}

#[test]
fn empty_pipeline_reports_unknown() {
    let layout = test_layout();
    let services = unsigned_config().services(&layout);
    let mut installer =
        build_pipeline(RequestType::Unknown, &services).expect("pipeline must build");
    assert!(installer.is_empty());

    let mut ctx = context(&layout, RequestType::Unknown, PackageType::Tpk, layout.prefix());
    let outcome = installer.run(&mut ctx);

    assert_eq!(outcome, RunOutcome::Unknown);
    assert_eq!(installer.exit_code(outcome), UNKNOWN_EXIT_CODE);
    assert!(installer.last_error().is_none());

    let _ = fs::remove_dir_all(layout.prefix());
}

#[test]
fn delta_requests_are_rejected_when_building() {
    let layout = test_layout();
    let services = unsigned_config().services(&layout);
    let err = build_pipeline(RequestType::Delta, &services)
        .err()
        .expect("delta must be rejected");
    assert_eq!(err.status, Status::DeltaError);

    let _ = fs::remove_dir_all(layout.prefix());
}

#[test]
fn observer_sees_progress_and_outcome() {
    #[derive(Default)]
    struct Collect {
        events: Rc<RefCell<Vec<String>>>,
    }

    impl PipelineObserver for Collect {
        fn started(&mut self, request: RequestType, total_steps: usize) {
            self.events
                .borrow_mut()
                .push(format!("started {} {total_steps}", request.as_str()));
        }

        fn step_finished(&mut self, step: &str, completed: usize, total_steps: usize) {
            self.events
                .borrow_mut()
                .push(format!("{step} {completed}/{total_steps}"));
        }

        fn finished(&mut self, outcome: RunOutcome, error: Option<&StepError>) {
            self.events
                .borrow_mut()
                .push(format!("finished {outcome:?} {}", error.is_some()));
        }
    }

    let layout = test_layout();
    let log = Log::default();
    let observer = Collect::default();
    let events = observer.events.clone();
    let mut installer = AppInstaller::with_observer(Box::new(observer));
    installer
        .add_step(Scripted::new("a", &log))
        .add_step(Scripted::new("b", &log));

    let mut ctx = context(&layout, RequestType::Install, PackageType::Tpk, layout.prefix());
    installer.run(&mut ctx);

    assert_eq!(
        *events.borrow(),
        vec!["started install 2", "a 1/2", "b 2/2", "finished Ok false"]
    );

    let _ = fs::remove_dir_all(layout.prefix());
}

#[test]
fn context_identity_fields_are_write_once() {
    let layout = test_layout();
    let mut ctx = context(&layout, RequestType::Install, PackageType::Tpk, layout.prefix());
    assert!(ctx.require_pkgid().is_err());

    ctx.set_pkgid(PKGID).expect("first set must succeed");
    ctx.set_pkgid(PKGID).expect("same value is a no-op");
    let err = ctx
        .set_pkgid("org.example.other")
        .expect_err("different value must fail");
    assert_eq!(err.status, Status::InvalidValue);
    assert_eq!(ctx.pkgid(), Some(PKGID));

    let root = layout.prefix().join("apps");
    ctx.set_root_application_path(&root).expect("must set root");
    assert!(ctx
        .set_root_application_path(&layout.prefix().join("elsewhere"))
        .is_err());
    assert_eq!(ctx.package_path().expect("package path"), root.join(PKGID));

    ctx.set_backend_data(WidgetData {
        start_file: "index.html".to_string(),
    });
    assert_eq!(
        ctx.backend_data::<WidgetData>().map(|data| data.start_file.as_str()),
        Some("index.html")
    );
    assert!(ctx.backend_data::<String>().is_none());

    let _ = fs::remove_dir_all(layout.prefix());
}

#[test]
fn recovery_file_writes_three_lines_and_reads_them_back() {
    let layout = test_layout();
    let owner = RecoveryOwner {
        mode: RequestMode::Global,
        uid: UID,
    };
    let mut file = RecoveryFile::create_unique(
        &layout.recovery_dir(),
        PackageType::Wgt,
        owner,
        RecoveryKind::New,
    )
    .expect("must create recovery file");
    let unpacked = layout.tmp_dir().join("unpack-1");
    file.set_unpacked_dir(&unpacked).expect("must record dir");
    file.set_pkgid(PKGID).expect("must record pkgid");
    let path = file.detach();

    let raw = fs::read_to_string(&path).expect("must read recovery file");
    assert_eq!(raw, format!("NEW\n{}\n{PKGID}\n", unpacked.display()));
    assert_eq!(
        RecoveryFile::package_type_from_path(&path).expect("must parse name"),
        PackageType::Wgt
    );
    assert_eq!(
        RecoveryFile::owner_from_path(&path).expect("must parse owner"),
        Some(owner)
    );
    // Rewrites replace the file whole; no staging file is left next to it.
    let name = path
        .file_name()
        .and_then(|name| name.to_str())
        .expect("must have name")
        .to_string();
    assert_eq!(dir_entries(&layout.recovery_dir()), vec![name]);

    let reopened = RecoveryFile::open(&path).expect("must open");
    assert_eq!(reopened.kind(), RecoveryKind::New);
    assert_eq!(reopened.unpacked_dir(), Some(unpacked.as_path()));
    assert_eq!(reopened.pkgid(), Some(PKGID));
    reopened.remove().expect("must remove");
    assert!(!path.exists());

    let _ = fs::remove_dir_all(layout.prefix());
}

#[test]
fn recovery_file_tolerates_unknown_kind_and_empty_fields() {
    let layout = test_layout();
    let path = layout.prefix().join("tpk-recovery-manual");
    fs::write(&path, "SOMETHING\n\n\n").expect("must write");

    let file = RecoveryFile::open(&path).expect("must open");
    assert_eq!(file.kind(), RecoveryKind::Unknown);
    assert_eq!(file.unpacked_dir(), None);
    assert_eq!(file.pkgid(), None);
    file.detach();
    assert_eq!(
        RecoveryFile::owner_from_path(&path).expect("must parse legacy name"),
        None
    );
    let bad_owner = layout.prefix().join("tpk-admin-x-recovery-1");
    assert!(RecoveryFile::owner_from_path(&bad_owner).is_err());
    assert!(RecoveryFile::package_type_from_path(
        &layout.recovery_dir().join(".tpk-user-5001-recovery-1.tmp")
    )
    .is_err());

    assert_eq!(RecoveryKind::from_keyword("UPDATE"), RecoveryKind::Update);
    assert_eq!(RecoveryKind::from_keyword("RDS"), RecoveryKind::Reinstall);
    assert_eq!(
        RecoveryKind::for_request(RequestType::Uninstall).keyword(),
        "UNINSTALLATION"
    );

    let _ = fs::remove_dir_all(layout.prefix());
}

#[test]
fn recovery_file_is_deleted_when_handle_drops() {
    let layout = test_layout();
    let file = RecoveryFile::create_unique(
        &layout.recovery_dir(),
        PackageType::Tpk,
        RecoveryOwner {
            mode: RequestMode::User,
            uid: UID,
        },
        RecoveryKind::Update,
    )
    .expect("must create");
    let path = file.path().to_path_buf();
    assert!(path.exists());
    drop(file);
    assert!(!path.exists());

    let _ = fs::remove_dir_all(layout.prefix());
}

#[test]
fn move_dir_round_trip_and_destination_guard() {
    let root = unique_dir("move");
    let src = root.join("src");
    fs::create_dir_all(src.join("nested")).expect("must create src");
    fs::write(src.join("nested").join("file"), b"payload").expect("must write file");
    #[cfg(unix)]
    std::os::unix::fs::symlink("nested/file", src.join("link")).expect("must link");

    let dst = root.join("moved").join("dst");
    move_dir(&src, &dst).expect("must move");
    assert!(!src.exists());
    assert_eq!(
        fs::read(dst.join("nested").join("file")).expect("must read"),
        b"payload"
    );
    #[cfg(unix)]
    assert!(fs::symlink_metadata(dst.join("link"))
        .expect("link must exist")
        .file_type()
        .is_symlink());

    move_dir(&dst, &src).expect("must move back");
    assert!(src.join("nested").join("file").is_file());

    let occupied = root.join("occupied");
    fs::create_dir_all(&occupied).expect("must create occupied");
    let err = move_dir(&src, &occupied).expect_err("existing destination must fail");
    assert!(err.to_string().contains("destination already exists"));
    assert!(src.join("nested").join("file").is_file());

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn copy_dir_fallback_copies_tree_with_permissions() {
    let root = unique_dir("copy");
    let src = root.join("src");
    fs::create_dir_all(src.join("bin")).expect("must create src");
    fs::write(src.join("bin").join("tool"), b"#!/bin/sh\n").expect("must write tool");
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(src.join("bin").join("tool"), fs::Permissions::from_mode(0o750))
            .expect("must chmod");
    }

    let dst = root.join("dst");
    crate::fs_utils::copy_dir(&src, &dst).expect("must copy");
    assert_eq!(
        fs::read(dst.join("bin").join("tool")).expect("must read"),
        b"#!/bin/sh\n"
    );
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = fs::metadata(dst.join("bin").join("tool"))
            .expect("must stat")
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o750);
    }
    assert!(src.join("bin").join("tool").exists());

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn move_file_and_restore_backup() {
    let root = unique_dir("file");
    let original = root.join("policy");
    fs::write(&original, b"v1").expect("must write");

    move_file(&original, &backup_path_for(&original)).expect("must back up");
    assert!(!original.exists());
    fs::write(&original, b"v2").expect("must write replacement");
    assert!(move_file(&original, &backup_path_for(&original)).is_err());

    assert!(restore_backup(&original).expect("must restore"));
    assert_eq!(fs::read(&original).expect("must read"), b"v1");
    assert!(!backup_path_for(&original).exists());
    assert!(!restore_backup(&original).expect("nothing to restore"));

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn create_dir_is_idempotent() {
    let root = unique_dir("mkdir");
    let dir = root.join("a").join("b");
    assert!(create_dir(&dir).expect("must create"));
    assert!(!create_dir(&dir).expect("existing dir is fine"));
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = fs::metadata(&dir).expect("must stat").permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
    }

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn install_then_uninstall_leaves_no_trace() {
    let layout = test_layout();
    let config = unsigned_config();
    let source = write_tpk(&unique_dir("src"), "1.0.0", true);

    install(&layout, &config, &source);

    let package = package_path(&layout);
    assert_eq!(
        fs::read_to_string(package.join("bin").join("clock")).expect("must read binary"),
        "clock 1.0.0\n"
    );
    assert!(installed_manifest(&layout).is_file());
    assert!(icon_dir(&layout).join(format!("{PKGID}.ui.png")).is_file());
    for subdir in STORAGE_SUBDIRS {
        assert!(layout.storage_dir(UID, PKGID).join(subdir).is_dir());
    }
    let policy = layout.security_policy_path(appinst_registry::RegistryScope::User(UID), PKGID);
    assert!(policy.is_file());
    assert_eq!(registered_version(&layout).as_deref(), Some("1.0.0"));
    assert!(dir_entries(&layout.recovery_dir()).is_empty());
    assert!(dir_entries(&layout.tmp_dir()).is_empty());
    assert!(source.join("bin").join("clock").is_file());

    let mut ctx = context(&layout, RequestType::Uninstall, PackageType::Tpk, Path::new(""));
    ctx.set_pkgid(PKGID).expect("must set pkgid");
    let (outcome, installer, _) = run_request(&layout, &config, ctx);
    assert_eq!(outcome, RunOutcome::Ok, "{:?}", installer.last_error());

    assert!(!package.exists());
    assert!(!installed_manifest(&layout).exists());
    assert!(!icon_dir(&layout).exists());
    assert!(!policy.exists());
    assert!(!layout.storage_dir(UID, PKGID).exists());
    assert_eq!(registered_version(&layout), None);
    assert_no_backups(&layout);

    let _ = fs::remove_dir_all(layout.prefix());
}

#[test]
fn uninstall_of_missing_package_fails_in_precheck() {
    let layout = test_layout();
    let mut ctx = context(&layout, RequestType::Uninstall, PackageType::Tpk, Path::new(""));
    ctx.set_pkgid(PKGID).expect("must set pkgid");
    let (outcome, installer, _) = run_request(&layout, &unsigned_config(), ctx);

    assert_eq!(outcome, RunOutcome::Error);
    assert_eq!(
        installer.last_error().map(|err| err.status),
        Some(Status::PackageNotFound)
    );
    assert!(!layout.apps_root(appinst_registry::RegistryScope::User(UID)).exists());

    let _ = fs::remove_dir_all(layout.prefix());
}

#[test]
fn widget_content_lands_below_res_wgt() {
    let layout = test_layout();
    let source = write_wgt(&unique_dir("src"));
    let ctx = context(&layout, RequestType::Install, PackageType::Wgt, &source);
    let (outcome, installer, ctx) = run_request(&layout, &unsigned_config(), ctx);
    assert_eq!(outcome, RunOutcome::Ok, "{:?}", installer.last_error());

    let content = package_path(&layout).join(WIDGET_CONTENT_DIR);
    assert!(content.join("index.html").is_file());
    assert!(content.join("config.toml").is_file());
    assert!(icon_dir(&layout).join(format!("{PKGID}.widget.png")).is_file());
    assert_eq!(
        ctx.backend_data::<WidgetData>().map(|data| data.start_file.as_str()),
        Some("index.html")
    );

    let _ = fs::remove_dir_all(layout.prefix());
}

#[test]
fn widget_without_start_file_is_rejected() {
    let layout = test_layout();
    let source = write_wgt(&unique_dir("src"));
    fs::remove_file(source.join("index.html")).expect("must remove start file");
    let ctx = context(&layout, RequestType::Install, PackageType::Wgt, &source);
    let (outcome, installer, _) = run_request(&layout, &unsigned_config(), ctx);

    assert_eq!(outcome, RunOutcome::Error);
    assert_eq!(
        installer.last_error().map(|err| err.status),
        Some(Status::ManifestError)
    );
    assert!(dir_entries(&layout.tmp_dir()).is_empty());
    assert!(dir_entries(&layout.recovery_dir()).is_empty());

    let _ = fs::remove_dir_all(layout.prefix());
}

#[test]
fn failed_copy_rolls_back_previous_steps_in_reverse() {
    let layout = test_layout();
    let config = unsigned_config();
    let services = config.services(&layout);
    let source = write_tpk(&unique_dir("src"), "1.0.0", false);
    let blocked = layout.prefix().join("blocked");
    fs::write(&blocked, b"not a directory").expect("must write blocker");

    let log = Log::default();
    let mut installer = AppInstaller::new();
    installer
        .add_step(Recorded {
            inner: StepUnzip,
            log: log.clone(),
        })
        .add_step(Recorded {
            inner: StepParseManifest::new(ManifestSource::Package),
            log: log.clone(),
        })
        .add_step(Recorded {
            inner: StepGenerateManifest::default(),
            log: log.clone(),
        })
        .add_step(Recorded {
            inner: StepRegisterApplication::new(services.registry.clone()),
            log: log.clone(),
        })
        .add_step(Recorded {
            inner: StepCopy::default(),
            log: log.clone(),
        });

    let mut ctx = context(&layout, RequestType::Install, PackageType::Tpk, &source);
    ctx.set_root_application_path(&blocked.join("apps"))
        .expect("must set root");
    let outcome = installer.run(&mut ctx);

    assert_eq!(outcome, RunOutcome::Error);
    assert_eq!(
        *log.borrow(),
        vec![
            "process:unzip",
            "process:parse-manifest",
            "process:generate-manifest",
            "process:register-application",
            "process:copy-files",
            "undo:copy-files",
            "undo:register-application",
            "undo:generate-manifest",
            "undo:parse-manifest",
            "undo:unzip",
        ]
    );
    assert_eq!(
        installer.exit_code(outcome),
        Status::AppDirError.exit_code()
    );
    assert_eq!(registered_version(&layout), None);
    assert!(!installed_manifest(&layout).exists());
    assert!(!blocked.join("apps").join(PKGID).exists());
    assert!(dir_entries(&layout.tmp_dir()).is_empty());

    let _ = fs::remove_dir_all(layout.prefix());
}

#[test]
fn crash_before_pkgid_is_recovered_without_trace() {
    let layout = test_layout();
    let config = unsigned_config();
    let source = write_tpk(&unique_dir("src"), "1.0.0", true);

    let recovery_path = Rc::new(RefCell::new(None));
    let mut installer = AppInstaller::new();
    installer
        .add_step(StepConfigure)
        .add_step(StepCreateRecoveryFile)
        .add_step(StepUnzip)
        .add_step(Crash {
            recovery_path: recovery_path.clone(),
        });
    let mut ctx = context(&layout, RequestType::Install, PackageType::Tpk, &source);
    run_until_crash(&mut installer, &mut ctx);
    drop(ctx);

    let path = recovery_path
        .borrow_mut()
        .take()
        .expect("recovery file must be left behind");
    let leftover = RecoveryFile::open(&path).expect("must open leftover");
    assert_eq!(leftover.kind(), RecoveryKind::New);
    assert_eq!(leftover.pkgid(), None);
    let unpacked = leftover
        .unpacked_dir()
        .expect("unpacked dir must be recorded")
        .to_path_buf();
    leftover.detach();
    assert!(unpacked.is_dir());

    assert_eq!(recover(&layout, &config, &path), RunOutcome::Ok);

    assert!(!unpacked.exists());
    assert!(!path.exists());
    assert!(dir_entries(&layout.tmp_dir()).is_empty());
    assert_eq!(registered_version(&layout), None);

    let _ = fs::remove_dir_all(layout.prefix());
}

#[test]
fn crash_after_install_processing_is_rolled_back_by_recovery() {
    let layout = test_layout();
    let config = unsigned_config();
    let services = config.services(&layout);
    let source = write_tpk(&unique_dir("src"), "1.0.0", true);

    let recovery_path = Rc::new(RefCell::new(None));
    let mut installer =
        build_pipeline(RequestType::Install, &services).expect("pipeline must build");
    installer.add_step(Crash {
        recovery_path: recovery_path.clone(),
    });
    let mut ctx = context(&layout, RequestType::Install, PackageType::Tpk, &source);
    run_until_crash(&mut installer, &mut ctx);
    drop(ctx);

    assert_eq!(registered_version(&layout).as_deref(), Some("1.0.0"));
    assert!(package_path(&layout).is_dir());
    let path = recovery_path
        .borrow_mut()
        .take()
        .expect("recovery file must be left behind");

    assert_eq!(recover(&layout, &config, &path), RunOutcome::Ok);

    assert_eq!(registered_version(&layout), None);
    assert!(!package_path(&layout).exists());
    assert!(!installed_manifest(&layout).exists());
    assert!(!icon_dir(&layout).exists());
    assert!(!layout.storage_dir(UID, PKGID).exists());
    assert!(!layout
        .security_policy_path(appinst_registry::RegistryScope::User(UID), PKGID)
        .exists());
    assert!(!path.exists());
    assert!(dir_entries(&layout.tmp_dir()).is_empty());

    let _ = fs::remove_dir_all(layout.prefix());
}

#[test]
fn update_replaces_content_and_registration() {
    let layout = test_layout();
    let config = unsigned_config();
    let sources = unique_dir("src");
    install(&layout, &config, &write_tpk(&sources, "1.0.0", true));

    let v2 = write_tpk(&sources, "1.1.0", true);
    let ctx = context(&layout, RequestType::Update, PackageType::Tpk, &v2);
    let (outcome, installer, _) = run_request(&layout, &config, ctx);
    assert_eq!(outcome, RunOutcome::Ok, "{:?}", installer.last_error());

    assert_eq!(registered_version(&layout).as_deref(), Some("1.1.0"));
    assert_eq!(
        fs::read_to_string(package_path(&layout).join("bin").join("clock"))
            .expect("must read binary"),
        "clock 1.1.0\n"
    );
    assert_eq!(
        fs::read(icon_dir(&layout).join(format!("{PKGID}.ui.png"))).expect("must read icon"),
        b"1.1.0"
    );
    assert_no_backups(&layout);
    assert!(dir_entries(&layout.recovery_dir()).is_empty());

    let _ = fs::remove_dir_all(layout.prefix());
}

#[test]
fn failed_update_restores_previous_version() {
    let layout = test_layout();
    let config = unsigned_config();
    let sources = unique_dir("src");
    install(&layout, &config, &write_tpk(&sources, "1.0.0", true));

    let v2 = write_tpk(&sources, "1.1.0", true);
    fs::remove_file(v2.join("res").join("icon.png")).expect("must drop icon");
    let ctx = context(&layout, RequestType::Update, PackageType::Tpk, &v2);
    let (outcome, installer, _) = run_request(&layout, &config, ctx);

    assert_eq!(outcome, RunOutcome::Error);
    assert_eq!(
        installer.last_error().map(|err| err.status),
        Some(Status::IconError)
    );
    assert_eq!(registered_version(&layout).as_deref(), Some("1.0.0"));
    assert_eq!(
        fs::read_to_string(package_path(&layout).join("bin").join("clock"))
            .expect("must read binary"),
        "clock 1.0.0\n"
    );
    let manifest = appinst_core::PackageManifest::from_path(&installed_manifest(&layout))
        .expect("installed manifest must parse");
    assert_eq!(manifest.version.to_string(), "1.0.0");
    assert_eq!(
        fs::read(icon_dir(&layout).join(format!("{PKGID}.ui.png"))).expect("must read icon"),
        b"1.0.0"
    );
    assert_no_backups(&layout);
    assert!(dir_entries(&layout.recovery_dir()).is_empty());
    assert!(dir_entries(&layout.tmp_dir()).is_empty());

    let _ = fs::remove_dir_all(layout.prefix());
}

#[test]
fn crash_during_update_is_restored_by_recovery() {
    let layout = test_layout();
    let config = unsigned_config();
    let services = config.services(&layout);
    let sources = unique_dir("src");
    install(&layout, &config, &write_tpk(&sources, "1.0.0", true));

    let recovery_path = Rc::new(RefCell::new(None));
    let mut installer =
        build_pipeline(RequestType::Update, &services).expect("pipeline must build");
    installer.add_step(Crash {
        recovery_path: recovery_path.clone(),
    });
    let v2 = write_tpk(&sources, "1.1.0", true);
    let mut ctx = context(&layout, RequestType::Update, PackageType::Tpk, &v2);
    run_until_crash(&mut installer, &mut ctx);
    drop(ctx);

    assert_eq!(registered_version(&layout).as_deref(), Some("1.1.0"));
    assert!(backup_path_for(&package_path(&layout)).is_dir());
    let path = recovery_path
        .borrow_mut()
        .take()
        .expect("recovery file must be left behind");
    assert_eq!(
        RecoveryFile::open(&path).expect("must open").kind(),
        RecoveryKind::Update
    );
    let data = layout.storage_dir(UID, PKGID).join("data");
    fs::write(data.join("settings.db"), b"current").expect("must write user data");
    let stale = backup_path_for(&data);
    fs::create_dir_all(&stale).expect("must create stale data backup");
    fs::write(stale.join("settings.db"), b"stale").expect("must write stale data");

    assert_eq!(recover(&layout, &config, &path), RunOutcome::Ok);

    // Updates never move user data, so recovery must not swap it.
    assert_eq!(
        fs::read(data.join("settings.db")).expect("must read user data"),
        b"current"
    );
    assert!(stale.is_dir());

    assert_eq!(registered_version(&layout).as_deref(), Some("1.0.0"));
    assert_eq!(
        fs::read_to_string(package_path(&layout).join("bin").join("clock"))
            .expect("must read binary"),
        "clock 1.0.0\n"
    );
    assert_eq!(
        fs::read(icon_dir(&layout).join(format!("{PKGID}.ui.png"))).expect("must read icon"),
        b"1.0.0"
    );
    assert_no_backups(&layout);
    assert!(!path.exists());
    assert!(dir_entries(&layout.tmp_dir()).is_empty());

    let _ = fs::remove_dir_all(layout.prefix());
}

#[test]
fn recovery_of_unsupported_kind_fails_and_keeps_file() {
    let layout = test_layout();
    let path = layout.recovery_dir().join("tpk-recovery-manual");
    fs::create_dir_all(layout.recovery_dir()).expect("must create recovery dir");
    let mut file = RecoveryFile::create(&path, RecoveryKind::Uninstall).expect("must create");
    file.set_pkgid(PKGID).expect("must record pkgid");
    file.detach();

    let ctx = context(&layout, RequestType::Recovery, PackageType::Tpk, &path);
    let (outcome, installer, _) = run_request(&layout, &unsigned_config(), ctx);

    assert_eq!(outcome, RunOutcome::Error);
    assert_eq!(
        installer.last_error().map(|err| err.status),
        Some(Status::RecoveryError)
    );
    assert!(path.exists());

    let _ = fs::remove_dir_all(layout.prefix());
}

#[test]
fn update_signed_by_another_author_is_rejected() {
    let layout = test_layout();
    let distributor = SigningKey::from_bytes(&[21; 32]);
    let config = InstallerConfig::default();
    let sources = unique_dir("src");

    let v1 = write_tpk(&sources, "1.0.0", true);
    sign_package(&v1, &SigningKey::from_bytes(&[20; 32]), &distributor);
    install(&layout, &config, &v1);
    let registration = registry(&layout)
        .registration(PKGID, UID)
        .expect("registry must be readable")
        .expect("package must be registered");
    assert!(registration.certificate.is_some());

    let v2 = write_tpk(&sources, "1.1.0", true);
    sign_package(&v2, &SigningKey::from_bytes(&[22; 32]), &distributor);
    let ctx = context(&layout, RequestType::Update, PackageType::Tpk, &v2);
    let (outcome, installer, _) = run_request(&layout, &config, ctx);

    assert_eq!(outcome, RunOutcome::Error);
    assert_eq!(
        installer.last_error().map(|err| err.status),
        Some(Status::AuthorCertNotMatch)
    );
    assert_eq!(registered_version(&layout).as_deref(), Some("1.0.0"));

    let _ = fs::remove_dir_all(layout.prefix());
}

#[test]
fn unsigned_package_is_rejected_by_default() {
    let layout = test_layout();
    let source = write_tpk(&unique_dir("src"), "1.0.0", true);
    let ctx = context(&layout, RequestType::Install, PackageType::Tpk, &source);
    let (outcome, installer, _) = run_request(&layout, &InstallerConfig::default(), ctx);

    assert_eq!(outcome, RunOutcome::Error);
    assert_eq!(
        installer.last_error().map(|err| err.status),
        Some(Status::SignatureError)
    );
    assert!(!package_path(&layout).exists());

    let _ = fs::remove_dir_all(layout.prefix());
}

#[test]
fn privileges_above_signer_level_are_rejected() {
    let layout = test_layout();
    let distributor = SigningKey::from_bytes(&[31; 32]);
    let mut config = InstallerConfig::default();
    config.distributors.insert(
        sha256_hex(distributor.verifying_key().as_bytes()),
        PrivilegeLevel::Partner,
    );
    config
        .privileges
        .insert("system.settings".to_string(), PrivilegeLevel::Platform);

    let source = write_tpk(&unique_dir("src"), "1.0.0", true);
    let manifest_path = source.join("tizen-manifest.toml");
    let manifest = fs::read_to_string(&manifest_path).expect("must read manifest");
    fs::write(
        &manifest_path,
        manifest.replacen(
            "\n[[applications]]",
            "privileges = [\"system.settings\"]\n\n[[applications]]",
            1,
        ),
    )
    .expect("must add privilege");
    sign_package(&source, &SigningKey::from_bytes(&[30; 32]), &distributor);

    let ctx = context(&layout, RequestType::Install, PackageType::Tpk, &source);
    let (outcome, installer, _) = run_request(&layout, &config, ctx);
    assert_eq!(outcome, RunOutcome::Error);
    assert_eq!(
        installer.last_error().map(|err| err.status),
        Some(Status::PrivilegeError)
    );

    config
        .privileges
        .insert("system.settings".to_string(), PrivilegeLevel::Partner);
    let ctx = context(&layout, RequestType::Install, PackageType::Tpk, &source);
    let (outcome, installer, ctx) = run_request(&layout, &config, ctx);
    assert_eq!(outcome, RunOutcome::Ok, "{:?}", installer.last_error());
    assert_eq!(ctx.privilege_level, PrivilegeLevel::Partner);

    let _ = fs::remove_dir_all(layout.prefix());
}

#[test]
fn clear_replaces_user_data_with_empty_dir() {
    let layout = test_layout();
    let config = unsigned_config();
    install(&layout, &config, &write_tpk(&unique_dir("src"), "1.0.0", true));
    let data = layout.storage_dir(UID, PKGID).join("data");
    fs::write(data.join("settings.db"), b"state").expect("must write user data");
    fs::write(
        layout.storage_dir(UID, PKGID).join("cache").join("blob"),
        b"cache",
    )
    .expect("must write cache");

    let mut ctx = context(&layout, RequestType::Clear, PackageType::Tpk, Path::new(""));
    ctx.set_pkgid(PKGID).expect("must set pkgid");
    let (outcome, installer, _) = run_request(&layout, &config, ctx);
    assert_eq!(outcome, RunOutcome::Ok, "{:?}", installer.last_error());

    assert!(data.is_dir());
    assert!(dir_entries(&data).is_empty());
    assert!(!backup_path_for(&data).exists());
    assert!(layout
        .storage_dir(UID, PKGID)
        .join("cache")
        .join("blob")
        .is_file());

    let _ = fs::remove_dir_all(layout.prefix());
}

#[test]
fn external_storage_is_allocated_once_and_reused_by_updates() {
    let prefix = unique_dir("prefix");
    let external = prefix.join("sdcard");
    let layout = InstallerLayout::new(&prefix).with_external_root(&external);
    let config = unsigned_config();
    let sources = unique_dir("src");

    let v1 = write_tpk(&sources, "1.0.0", true);
    let manifest_path = v1.join("tizen-manifest.toml");
    let manifest = fs::read_to_string(&manifest_path).expect("must read manifest");
    fs::write(
        &manifest_path,
        manifest.replacen(
            "\n[[applications]]",
            "install_location = \"prefer-external\"\n\n[[applications]]",
            1,
        ),
    )
    .expect("must set install location");

    let ctx = context(&layout, RequestType::Install, PackageType::Tpk, &v1);
    let (outcome, installer, ctx) = run_request(&layout, &config, ctx);
    assert_eq!(outcome, RunOutcome::Ok, "{:?}", installer.last_error());
    let allocation = ctx.storage.clone().expect("storage must be allocated");
    assert_eq!(allocation.location, StorageLocation::External);
    assert!(allocation.created);
    let external_dir = layout
        .external_dir(UID, PKGID)
        .expect("external root configured");
    assert!(external_dir.is_dir());

    let v2 = write_tpk(&sources, "1.1.0", true);
    let ctx = context(&layout, RequestType::Update, PackageType::Tpk, &v2);
    let (outcome, installer, ctx) = run_request(&layout, &config, ctx);
    assert_eq!(outcome, RunOutcome::Ok, "{:?}", installer.last_error());
    let allocation = ctx.storage.clone().expect("storage must be allocated");
    assert_eq!(allocation.location, StorageLocation::External);
    assert!(!allocation.created);

    let _ = fs::remove_dir_all(&prefix);
}

#[test]
fn config_parses_policy_tables() {
    let config = InstallerConfig::from_toml_str(
        r#"
version = 1
root = "/opt/appinst"
allow_unsigned = true
revoked_keys = ["ABCDEF"]
log_filter = "debug"

[distributors]
"0011" = "platform"

[privileges]
"system.settings" = "partner"
"#,
    )
    .expect("config must parse");

    assert_eq!(config.root.as_deref(), Some(Path::new("/opt/appinst")));
    let policy = config.signature_policy();
    assert!(policy.allow_unsigned);
    assert!(policy.revoked_keys.contains("abcdef"));
    assert_eq!(
        policy.distributor_levels.get("0011"),
        Some(&PrivilegeLevel::Platform)
    );
    let privileges = config.privilege_policy();
    assert_eq!(
        privileges.required_level("system.settings"),
        PrivilegeLevel::Partner
    );
    assert_eq!(privileges.required_level("other"), PrivilegeLevel::Public);
    assert_eq!(
        config.layout().expect("layout").prefix(),
        Path::new("/opt/appinst")
    );
}

#[test]
fn config_rejects_unknown_version() {
    let err = InstallerConfig::from_toml_str("version = 7\n").expect_err("must reject");
    assert!(err
        .to_string()
        .contains("unsupported installer config version 7"));
}

#[test]
fn missing_config_file_means_defaults() {
    let root = unique_dir("config");
    let config = InstallerConfig::load(&root.join("config.toml")).expect("must load");
    assert_eq!(config, InstallerConfig::default());

    let _ = fs::remove_dir_all(&root);
}

/// Removes the unpacked content right before the content swap.
struct DropUnpacked;

impl Step for DropUnpacked {
    fn name(&self) -> &'static str {
        "drop-unpacked"
    }

    fn process(&mut self, ctx: &mut InstallerContext) -> StepResult {
        let dir = ctx.unpacked_dir.clone().expect("unpacked dir must be set");
        fs::remove_dir_all(&dir).expect("must remove unpacked dir");
        Ok(())
    }
}

#[test]
fn install_with_missing_icon_leaves_nothing_behind() {
    let layout = test_layout();
    let config = unsigned_config();
    let source = write_tpk(&unique_dir("src"), "1.0.0", true);
    fs::remove_file(source.join("res").join("icon.png")).expect("must drop icon");

    let ctx = context(&layout, RequestType::Install, PackageType::Tpk, &source);
    let (outcome, installer, _) = run_request(&layout, &config, ctx);

    assert_eq!(outcome, RunOutcome::Error);
    assert_eq!(
        installer.last_error().map(|err| err.status),
        Some(Status::IconError)
    );
    assert!(!icon_dir(&layout).exists());
    assert!(!package_path(&layout).exists());
    assert!(!installed_manifest(&layout).exists());
    assert!(!layout.storage_dir(UID, PKGID).exists());
    assert_eq!(registered_version(&layout), None);
    assert!(dir_entries(&layout.recovery_dir()).is_empty());
    assert!(dir_entries(&layout.tmp_dir()).is_empty());

    let _ = fs::remove_dir_all(layout.prefix());
}

#[test]
fn failed_content_swap_restores_installed_package() {
    let layout = test_layout();
    let config = unsigned_config();
    let sources = unique_dir("src");
    install(&layout, &config, &write_tpk(&sources, "1.0.0", true));

    let log = Log::default();
    let mut installer = AppInstaller::new();
    installer
        .add_step(StepConfigure)
        .add_step(StepUnzip)
        .add_step(StepParseManifest::new(ManifestSource::Package))
        .add_step(DropUnpacked)
        .add_step(Recorded {
            inner: StepCopyBackup::default(),
            log: log.clone(),
        });

    let v2 = write_tpk(&sources, "1.1.0", true);
    let mut ctx = context(&layout, RequestType::Update, PackageType::Tpk, &v2);
    let outcome = installer.run(&mut ctx);

    assert_eq!(outcome, RunOutcome::Error);
    assert_eq!(
        installer.last_error().map(|err| err.status),
        Some(Status::AppDirError)
    );
    assert_eq!(*log.borrow(), vec!["process:copy-backup", "undo:copy-backup"]);
    assert_eq!(
        fs::read_to_string(package_path(&layout).join("bin").join("clock"))
            .expect("installed package must be back in place"),
        "clock 1.0.0\n"
    );
    assert!(!backup_path_for(&package_path(&layout)).exists());
    assert_eq!(registered_version(&layout).as_deref(), Some("1.0.0"));

    let _ = fs::remove_dir_all(layout.prefix());
}

#[test]
fn global_install_crash_is_recovered_in_global_scope() {
    let layout = test_layout();
    let config = unsigned_config();
    let services = config.services(&layout);
    let source = write_tpk(&unique_dir("src"), "1.0.0", true);
    let global = appinst_registry::RegistryScope::Global;

    let recovery_path = Rc::new(RefCell::new(None));
    let mut installer =
        build_pipeline(RequestType::Install, &services).expect("pipeline must build");
    installer.add_step(Crash {
        recovery_path: recovery_path.clone(),
    });
    let mut ctx = context(&layout, RequestType::Install, PackageType::Tpk, &source);
    ctx.request_mode = RequestMode::Global;
    run_until_crash(&mut installer, &mut ctx);
    drop(ctx);

    let package = layout.apps_root(global).join(PKGID);
    let manifest = layout.manifests_dir(global).join(format!("{PKGID}.toml"));
    let icons = layout.icons_dir(global).join(PKGID);
    let policy = layout.security_policy_path(global, PKGID);
    assert!(package.is_dir());
    assert!(manifest.is_file());
    assert!(icons.is_dir());
    assert!(policy.is_file());
    assert_eq!(registered_version(&layout).as_deref(), Some("1.0.0"));
    let path = recovery_path
        .borrow_mut()
        .take()
        .expect("recovery file must be left behind");
    assert_eq!(
        RecoveryFile::owner_from_path(&path).expect("must parse owner"),
        Some(RecoveryOwner {
            mode: RequestMode::Global,
            uid: UID,
        })
    );

    // Issued as another user and without the global flag.
    let mut ctx = context(&layout, RequestType::Recovery, PackageType::Tpk, &path);
    ctx.uid = 0;
    let (outcome, installer, ctx) = run_request(&layout, &config, ctx);
    assert_eq!(outcome, RunOutcome::Ok, "{:?}", installer.last_error());
    assert_eq!(ctx.request_mode, RequestMode::Global);
    assert_eq!(ctx.uid, UID);

    assert!(!package.exists());
    assert!(!manifest.exists());
    assert!(!icons.exists());
    assert!(!policy.exists());
    assert!(!layout.storage_dir(UID, PKGID).exists());
    assert_eq!(registered_version(&layout), None);
    assert!(!path.exists());
    assert!(dir_entries(&layout.tmp_dir()).is_empty());
    assert!(dir_entries(&layout.apps_root(appinst_registry::RegistryScope::User(0))).is_empty());

    let _ = fs::remove_dir_all(layout.prefix());
}

#[test]
fn storage_backup_clean_continues_past_a_failed_removal() {
    let prefix = unique_dir("prefix");
    let layout = InstallerLayout::new(&prefix).with_external_root(prefix.join("sdcard"));
    let storage = layout.storage_dir(UID, PKGID);
    let external = layout
        .external_dir(UID, PKGID)
        .expect("external root configured");
    fs::create_dir_all(storage.join("data")).expect("must create storage");
    fs::create_dir_all(&external).expect("must create external dir");

    let mut ctx = context(&layout, RequestType::Uninstall, PackageType::Tpk, Path::new(""));
    ctx.set_pkgid(PKGID).expect("must set pkgid");
    let mut step = StepRemoveStorageDirectories::default();
    step.process(&mut ctx).expect("must move storage aside");
    assert!(backup_path_for(&storage).is_dir());
    assert!(backup_path_for(&external).is_dir());

    // A file where the storage parent was makes its backup unreachable.
    let apps = storage.parent().expect("storage has a parent").to_path_buf();
    let moved_apps = prefix.join("apps-moved");
    fs::rename(&apps, &moved_apps).expect("must move apps dir");
    fs::write(&apps, b"not a directory").expect("must write blocker");

    step.clean(&mut ctx).expect("clean must not fail");
    assert!(!backup_path_for(&external).exists());
    assert!(moved_apps.join(format!("{PKGID}.bck")).is_dir());

    let _ = fs::remove_dir_all(&prefix);
}
