//! Loopback mounting of a partition inside a raw disk image.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{bail, Context, Result};

/// Owns one active loop mount. Created by [`MountHandle::mount`]; consumed
/// by [`MountHandle::unmount`], which also removes the mount directory.
#[derive(Debug)]
pub struct MountHandle {
    target: PathBuf,
    offset: u64,
}

impl MountHandle {
    /// Mount the filesystem found at `offset` bytes into `image` under
    /// `target`, creating the directory if absent. Mounting requires
    /// elevated privilege; a failed mount is an error because every later
    /// stage reads and writes through the mounted path.
    pub fn mount(image: &Path, offset: u64, target: &Path) -> Result<Self> {
        fs::create_dir_all(target)
            .with_context(|| format!("creating mount directory '{}'", target.display()))?;
        let output = Command::new("sudo")
            .arg("mount")
            .args(["-o", &format!("loop,offset={offset}")])
            .arg(image)
            .arg(target)
            .output()
            .with_context(|| format!("running mount for '{}'", image.display()))?;
        if !output.status.success() {
            bail!(
                "mounting '{}' at '{}' (offset {}) failed: {}",
                image.display(),
                target.display(),
                offset,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        log::info!(
            "mounted '{}' at '{}' (offset {})",
            image.display(),
            target.display(),
            offset
        );
        Ok(Self {
            target: target.to_path_buf(),
            offset,
        })
    }

    pub fn target(&self) -> &Path {
        &self.target
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Unmount and remove the mount directory.
    pub fn unmount(self) -> Result<()> {
        let output = Command::new("sudo")
            .arg("umount")
            .arg(&self.target)
            .output()
            .with_context(|| format!("running umount for '{}'", self.target.display()))?;
        if !output.status.success() {
            bail!(
                "unmounting '{}' failed: {}",
                self.target.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        fs::remove_dir(&self.target)
            .with_context(|| format!("removing mount directory '{}'", self.target.display()))?;
        log::info!("unmounted '{}'", self.target.display());
        Ok(())
    }
}
