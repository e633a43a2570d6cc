use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{anyhow, bail, Context, Result};
use appinst_core::{PackageManifest, PackageType, RequestMode, RequestType};
use appinst_installer::{
    build_pipeline, default_prefix, InstallerConfig, InstallerContext, InstallerLayout,
    InstallerServices, RecoveryFile, RunOutcome, Status,
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::{Cli, Commands};

const LOG_ENV: &str = "APPINST_LOG";
const DEFAULT_LOG_FILTER: &str = "info";
const CONFIG_FILE_NAME: &str = "config.toml";

/// Runs one CLI invocation and returns the process exit code.
pub(crate) fn run_cli(cli: Cli) -> i32 {
    let config = match load_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("error: {err:#}");
            return Status::ConfigError.exit_code();
        }
    };
    init_tracing(config.log_filter.as_deref());

    match execute(&cli, &config) {
        Ok(code) => code,
        Err(err) => {
            error!(error = %format!("{err:#}"), "request aborted");
            Status::Error.exit_code()
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<InstallerConfig> {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => default_prefix()?.join(CONFIG_FILE_NAME),
    };
    InstallerConfig::load(&path)
}

/// `APPINST_LOG` wins over `RUST_LOG`, which wins over the config's filter.
fn init_tracing(config_filter: Option<&str>) {
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(config_filter.unwrap_or(DEFAULT_LOG_FILTER)));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

#[derive(Debug, Clone, Copy)]
struct Target {
    uid: u32,
    mode: RequestMode,
}

impl Target {
    fn from_cli(cli: &Cli) -> Self {
        Self {
            uid: cli.uid.unwrap_or_else(current_uid),
            mode: if cli.global {
                RequestMode::Global
            } else {
                RequestMode::User
            },
        }
    }

    fn context(
        self,
        layout: &InstallerLayout,
        request: RequestType,
        package_type: PackageType,
    ) -> InstallerContext {
        let mut ctx = InstallerContext::new(layout.clone(), request, package_type);
        ctx.uid = self.uid;
        ctx.request_mode = self.mode;
        ctx
    }
}

fn current_uid() -> u32 {
    // SAFETY: getuid has no preconditions and cannot fail.
    unsafe { libc::getuid() }
}

fn execute(cli: &Cli, config: &InstallerConfig) -> Result<i32> {
    let layout = config.layout()?;
    let services = config.services(&layout);
    let target = Target::from_cli(cli);

    match &cli.command {
        Commands::Install { path, tep } => {
            let package_type = detect_package_type(path)?;
            let pkgid = peek_package_id(path, package_type)?;
            let request = if services.registry.is_installed(&pkgid, target.uid)? {
                info!(pkgid = %pkgid, "package already installed, updating");
                RequestType::Update
            } else {
                RequestType::Install
            };
            let mut ctx = target.context(&layout, request, package_type);
            ctx.file_path = path.clone();
            ctx.tep_path = tep.clone();
            Ok(run_request(ctx, &services))
        }
        Commands::Reinstall { path } => {
            let package_type = detect_package_type(path)?;
            let mut ctx = target.context(&layout, RequestType::Reinstall, package_type);
            ctx.file_path = path.clone();
            Ok(run_request(ctx, &services))
        }
        Commands::Uninstall { pkgid } => {
            run_for_installed(&layout, &services, target, RequestType::Uninstall, pkgid)
        }
        Commands::Clear { pkgid } => {
            run_for_installed(&layout, &services, target, RequestType::Clear, pkgid)
        }
        Commands::Recover { file: Some(file) } => {
            recover_file(&layout, &services, target, file)
        }
        Commands::Recover { file: None } => recover_all(&layout, &services, target),
    }
}

/// Uninstall and clear take the package type from the registry record.
fn run_for_installed(
    layout: &InstallerLayout,
    services: &InstallerServices,
    target: Target,
    request: RequestType,
    pkgid: &str,
) -> Result<i32> {
    let Some(registration) = services.registry.registration(pkgid, target.uid)? else {
        error!(pkgid, uid = target.uid, "package is not installed");
        return Ok(Status::PackageNotFound.exit_code());
    };
    let mut ctx = target.context(layout, request, registration.package_type);
    ctx.set_pkgid(pkgid)?;
    Ok(run_request(ctx, services))
}

/// `target` only applies to files whose name does not record the owner of
/// the interrupted request.
fn recover_file(
    layout: &InstallerLayout,
    services: &InstallerServices,
    target: Target,
    file: &Path,
) -> Result<i32> {
    let package_type = RecoveryFile::package_type_from_path(file)?;
    let mut ctx = target.context(layout, RequestType::Recovery, package_type);
    ctx.file_path = file.to_path_buf();
    Ok(run_request(ctx, services))
}

/// Replays every recovery file left behind by interrupted requests. The
/// first failing file decides the exit code; the rest are still attempted.
fn recover_all(layout: &InstallerLayout, services: &InstallerServices, target: Target) -> Result<i32> {
    let files = pending_recovery_files(&layout.recovery_dir())?;
    if files.is_empty() {
        info!("no interrupted requests to recover");
        return Ok(0);
    }

    let mut exit_code = 0;
    for file in files {
        let code = match recover_file(layout, services, target, &file) {
            Ok(code) => code,
            Err(err) => {
                warn!(file = %file.display(), error = %format!("{err:#}"), "skipping recovery file");
                Status::RecoveryError.exit_code()
            }
        };
        if exit_code == 0 {
            exit_code = code;
        }
    }
    Ok(exit_code)
}

fn pending_recovery_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => {
            return Err(err).with_context(|| format!("failed to read {}", dir.display()));
        }
    };

    let mut files = Vec::new();
    for entry in entries {
        let entry = entry.with_context(|| format!("failed to read {}", dir.display()))?;
        let path = entry.path();
        if path.is_file() && RecoveryFile::package_type_from_path(&path).is_ok() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

fn run_request(mut ctx: InstallerContext, services: &InstallerServices) -> i32 {
    let request = ctx.request_type;
    let mut installer = match build_pipeline(request, services) {
        Ok(installer) => installer,
        Err(err) => {
            error!(request = request.as_str(), error = %err, "request not supported");
            return err.status.exit_code();
        }
    };

    let outcome = installer.run(&mut ctx);
    let code = installer.exit_code(outcome);
    match (outcome, installer.last_error()) {
        (RunOutcome::Ok, _) => info!(request = request.as_str(), pkgid = ?ctx.pkgid(), "done"),
        (_, Some(err)) => error!(request = request.as_str(), exit_code = code, error = %err, "request failed"),
        (_, None) => error!(request = request.as_str(), exit_code = code, "request failed"),
    }
    code
}

pub(crate) fn detect_package_type(path: &Path) -> Result<PackageType> {
    if !path.exists() {
        bail!("package not found: {}", path.display());
    }
    PackageType::infer_from_path(path)
        .ok_or_else(|| anyhow!("cannot tell package type of {}", path.display()))
}

/// Reads the package id without unpacking the whole package.
pub(crate) fn peek_package_id(path: &Path, package_type: PackageType) -> Result<String> {
    let manifest_name = package_type.manifest_file_name();
    let manifest = if path.is_dir() {
        PackageManifest::from_path(&path.join(manifest_name))?
    } else {
        let output = Command::new("unzip")
            .arg("-p")
            .arg(path)
            .arg(manifest_name)
            .output()
            .with_context(|| format!("failed to run unzip on {}", path.display()))?;
        if !output.status.success() {
            bail!(
                "failed to read {manifest_name} from {}: {}",
                path.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        PackageManifest::from_toml_str(&String::from_utf8_lossy(&output.stdout))
            .with_context(|| format!("invalid manifest in {}", path.display()))?
    };
    Ok(manifest.package)
}
