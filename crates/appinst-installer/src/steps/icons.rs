use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::debug;

use crate::context::InstallerContext;
use crate::error::{OrStatus, Status, StepError, StepResult};
use crate::fs_utils::{
    backup_path_for, create_dir, discard_stale_backup, move_dir, remove_all, restore_backup,
};
use crate::recovery::RecoveryStep;
use crate::step::Step;

/// Copies every application icon declared in the manifest into the package's
/// icon directory as `<app_id>[.<ext>]`.
#[derive(Debug, Default)]
pub struct StepCreateIcons {
    created: Option<PathBuf>,
    copied: Vec<PathBuf>,
}

impl Step for StepCreateIcons {
    fn name(&self) -> &'static str {
        "create-icons"
    }

    fn process(&mut self, ctx: &mut InstallerContext) -> StepResult {
        let manifest = ctx.require_manifest()?;
        let icons = manifest
            .icon_entries()
            .map(|(app_id, icon)| (app_id.to_string(), icon.to_string()))
            .collect::<Vec<_>>();
        if icons.is_empty() {
            return Ok(());
        }

        let content_dir = ctx.package_content_dir()?;
        let icon_dir = ctx.icon_dir()?;
        if create_dir(&icon_dir).or_status(Status::IconError)? {
            self.created = Some(icon_dir.clone());
        }
        for (app_id, icon) in icons {
            let src = content_dir.join(&icon);
            if !src.is_file() {
                return Err(StepError::new(
                    Status::IconError,
                    format!("icon of application '{app_id}' not found: {icon}"),
                ));
            }
            let dst = icon_dir.join(icon_file_name(&app_id, &icon));
            self.copied.push(dst.clone());
            fs::copy(&src, &dst)
                .with_context(|| format!("failed to copy icon {}", src.display()))
                .or_status(Status::IconError)?;
            debug!(app_id, icon = %dst.display(), "icon installed");
        }
        Ok(())
    }

    /// Removes the icon directory when this step created it, otherwise only
    /// the icons it copied into it.
    fn undo(&mut self, _ctx: &mut InstallerContext) -> StepResult {
        let copied = std::mem::take(&mut self.copied);
        if let Some(dir) = self.created.take() {
            return remove_all(&dir).or_status(Status::IconError);
        }
        for icon in copied {
            remove_all(&icon).or_status(Status::IconError)?;
        }
        Ok(())
    }
}

/// Moves the package's current icon directory to its `.bck` sibling. Update
/// restores it on undo; uninstall relies on clean to delete it.
#[derive(Debug, Default)]
pub struct StepBackupIcons {
    moved: bool,
}

impl Step for StepBackupIcons {
    fn name(&self) -> &'static str {
        "backup-icons"
    }

    fn process(&mut self, ctx: &mut InstallerContext) -> StepResult {
        let icon_dir = ctx.icon_dir()?;
        if !icon_dir.exists() {
            return Ok(());
        }
        discard_stale_backup(&icon_dir).or_status(Status::IconError)?;
        move_dir(&icon_dir, &backup_path_for(&icon_dir)).or_status(Status::IconError)?;
        self.moved = true;
        Ok(())
    }

    fn clean(&mut self, ctx: &mut InstallerContext) -> StepResult {
        if !self.moved {
            return Ok(());
        }
        remove_all(&backup_path_for(&ctx.icon_dir()?)).or_status(Status::IconError)
    }

    fn undo(&mut self, ctx: &mut InstallerContext) -> StepResult {
        if !self.moved {
            return Ok(());
        }
        restore_backup(&ctx.icon_dir()?).or_status(Status::IconError)?;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct StepRecoverIcons;

impl RecoveryStep for StepRecoverIcons {
    fn name(&self) -> &'static str {
        "recover-icons"
    }

    fn recover_new(&mut self, ctx: &mut InstallerContext) -> StepResult {
        if ctx.pkgid().is_none() {
            return Ok(());
        }
        let icon_dir = ctx.icon_dir()?;
        remove_all(&icon_dir).or_status(Status::RecoveryError)?;
        remove_all(&backup_path_for(&icon_dir)).or_status(Status::RecoveryError)
    }

    fn recover_update(&mut self, ctx: &mut InstallerContext) -> StepResult {
        if ctx.pkgid().is_none() {
            return Ok(());
        }
        restore_backup(&ctx.icon_dir()?).or_status(Status::RecoveryError)?;
        Ok(())
    }
}

fn icon_file_name(app_id: &str, icon: &str) -> String {
    match Path::new(icon).extension().and_then(|ext| ext.to_str()) {
        Some(ext) => format!("{app_id}.{ext}"),
        None => app_id.to_string(),
    }
}
