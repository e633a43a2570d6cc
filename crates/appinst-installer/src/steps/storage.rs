use std::path::PathBuf;
use std::rc::Rc;

use appinst_core::InstallLocation;
use tracing::{debug, info, warn};

use crate::context::{InstallerContext, StorageAllocation, StorageLocation};
use crate::directory_helper::{DirectoryHelper, DirectoryOperation};
use crate::error::{OrStatus, Status, StepResult};
use crate::fs_utils::{
    backup_path_for, create_dir, discard_stale_backup, move_dir, remove_all, restore_backup,
};
use crate::recovery::RecoveryStep;
use crate::step::Step;

/// Decides between internal and external storage.
///
/// Fresh installs get an external directory only when one is configured and
/// the manifest prefers it. Every upgrading request (update, reinstall,
/// clear, delta) keeps whatever the installed package already has and never
/// allocates a new external directory.
#[derive(Debug, Default)]
pub struct StepAcquireStorage;

impl Step for StepAcquireStorage {
    fn name(&self) -> &'static str {
        "acquire-storage"
    }

    fn process(&mut self, ctx: &mut InstallerContext) -> StepResult {
        let pkgid = ctx.require_pkgid()?;
        let preference = ctx
            .manifest
            .as_ref()
            .map(|manifest| manifest.install_location)
            .unwrap_or_default();
        let external_dir = ctx.layout.external_dir(ctx.uid, pkgid);

        let allocation = match external_dir {
            Some(dir) if preference != InstallLocation::InternalOnly => {
                if ctx.request_type.is_upgrading() {
                    if dir.is_dir() {
                        external(dir, false)
                    } else {
                        internal()
                    }
                } else if preference == InstallLocation::PreferExternal {
                    let created = create_dir(&dir).or_status(Status::AppDirError)?;
                    external(dir, created)
                } else {
                    internal()
                }
            }
            _ => internal(),
        };

        debug!(
            pkgid,
            location = ?allocation.location,
            external_dir = ?allocation.external_dir,
            "storage acquired"
        );
        ctx.storage = Some(allocation);
        Ok(())
    }

    fn undo(&mut self, ctx: &mut InstallerContext) -> StepResult {
        match ctx.storage.take() {
            Some(StorageAllocation {
                external_dir: Some(dir),
                created: true,
                ..
            }) => remove_all(&dir).or_status(Status::AppDirError),
            _ => Ok(()),
        }
    }
}

/// Creates the per-user storage directories through the directory helper.
pub struct StepCreateStorageDirectories {
    helper: Rc<dyn DirectoryHelper>,
    created: bool,
}

impl StepCreateStorageDirectories {
    pub fn new(helper: Rc<dyn DirectoryHelper>) -> Self {
        Self {
            helper,
            created: false,
        }
    }
}

impl Step for StepCreateStorageDirectories {
    fn name(&self) -> &'static str {
        "create-storage-directories"
    }

    fn process(&mut self, ctx: &mut InstallerContext) -> StepResult {
        let existed = ctx.storage_dir()?.is_dir();
        let pkgid = ctx.require_pkgid()?;
        self.created = !existed;
        self.helper
            .run(
                DirectoryOperation::CreateStorage,
                pkgid,
                ctx.uid,
                ctx.request_mode,
                storage_location(ctx),
            )
            .or_status(Status::AppDirError)
    }

    fn undo(&mut self, ctx: &mut InstallerContext) -> StepResult {
        if !self.created {
            return Ok(());
        }
        self.helper
            .run(
                DirectoryOperation::DeleteStorage,
                ctx.require_pkgid()?,
                ctx.uid,
                ctx.request_mode,
                storage_location(ctx),
            )
            .or_status(Status::AppDirError)
    }
}

/// Uninstall: moves the per-user storage and any external directory aside.
#[derive(Debug, Default)]
pub struct StepRemoveStorageDirectories {
    moved: Vec<PathBuf>,
}

impl Step for StepRemoveStorageDirectories {
    fn name(&self) -> &'static str {
        "remove-storage-directories"
    }

    fn process(&mut self, ctx: &mut InstallerContext) -> StepResult {
        let pkgid = ctx.require_pkgid()?;
        let candidates = std::iter::once(ctx.storage_dir()?)
            .chain(ctx.layout.external_dir(ctx.uid, pkgid))
            .collect::<Vec<_>>();
        for dir in candidates {
            if !dir.exists() {
                continue;
            }
            discard_stale_backup(&dir).or_status(Status::AppDirError)?;
            move_dir(&dir, &backup_path_for(&dir)).or_status(Status::AppDirError)?;
            self.moved.push(dir);
        }
        Ok(())
    }

    /// A backup that cannot be removed is logged and left behind; the
    /// remaining backups are still removed.
    fn clean(&mut self, _ctx: &mut InstallerContext) -> StepResult {
        for dir in &self.moved {
            let backup = backup_path_for(dir);
            if let Err(err) = remove_all(&backup) {
                warn!(
                    path = %backup.display(),
                    error = %format!("{err:#}"),
                    "failed to remove storage backup"
                );
            }
        }
        Ok(())
    }

    fn undo(&mut self, _ctx: &mut InstallerContext) -> StepResult {
        while let Some(dir) = self.moved.pop() {
            restore_backup(&dir).or_status(Status::AppDirError)?;
        }
        Ok(())
    }
}

/// Clear request: replaces the package's data directory with an empty one.
#[derive(Debug, Default)]
pub struct StepClearUserData {
    cleared: Option<PathBuf>,
}

impl Step for StepClearUserData {
    fn name(&self) -> &'static str {
        "clear-user-data"
    }

    fn process(&mut self, ctx: &mut InstallerContext) -> StepResult {
        let data = ctx.storage_dir()?.join("data");
        if data.exists() {
            discard_stale_backup(&data).or_status(Status::AppDirError)?;
            move_dir(&data, &backup_path_for(&data)).or_status(Status::AppDirError)?;
            self.cleared = Some(data.clone());
        }
        create_dir(&data).or_status(Status::AppDirError)?;

        if let Some(StorageAllocation {
            external_dir: Some(dir),
            ..
        }) = &ctx.storage
        {
            debug!(path = %dir.display(), "external storage left untouched");
        }
        info!(path = %data.display(), "user data cleared");
        Ok(())
    }

    fn clean(&mut self, _ctx: &mut InstallerContext) -> StepResult {
        match &self.cleared {
            Some(data) => remove_all(&backup_path_for(data)).or_status(Status::AppDirError),
            None => Ok(()),
        }
    }

    fn undo(&mut self, _ctx: &mut InstallerContext) -> StepResult {
        match self.cleared.take() {
            Some(data) => restore_backup(&data).map(|_| ()).or_status(Status::AppDirError),
            None => Ok(()),
        }
    }
}

/// Recovery of per-user storage and the external directory.
pub struct StepRecoverStorage {
    helper: Rc<dyn DirectoryHelper>,
}

impl StepRecoverStorage {
    pub fn new(helper: Rc<dyn DirectoryHelper>) -> Self {
        Self { helper }
    }
}

impl RecoveryStep for StepRecoverStorage {
    fn name(&self) -> &'static str {
        "recover-storage"
    }

    fn recover_new(&mut self, ctx: &mut InstallerContext) -> StepResult {
        let Some(pkgid) = ctx.pkgid() else {
            return Ok(());
        };
        self.helper
            .run(
                DirectoryOperation::DeleteStorage,
                pkgid,
                ctx.uid,
                ctx.request_mode,
                StorageLocation::Internal,
            )
            .or_status(Status::RecoveryError)?;
        if let Some(dir) = ctx.layout.external_dir(ctx.uid, pkgid) {
            remove_all(&dir).or_status(Status::RecoveryError)?;
        }
        Ok(())
    }

    /// Updates never move user data, so a `data.bck` found here belongs to
    /// some other request and is left alone.
    fn recover_update(&mut self, ctx: &mut InstallerContext) -> StepResult {
        debug!(
            pkgid = ctx.pkgid().unwrap_or_default(),
            "storage untouched by update"
        );
        Ok(())
    }
}

fn storage_location(ctx: &InstallerContext) -> StorageLocation {
    ctx.storage
        .as_ref()
        .map_or(StorageLocation::Internal, |storage| storage.location)
}

fn internal() -> StorageAllocation {
    StorageAllocation {
        location: StorageLocation::Internal,
        external_dir: None,
        created: false,
    }
}

fn external(dir: PathBuf, created: bool) -> StorageAllocation {
    StorageAllocation {
        location: StorageLocation::External,
        external_dir: Some(dir),
        created,
    }
}
