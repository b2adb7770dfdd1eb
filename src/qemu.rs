//! QEMU session control: image resizing, invocation building, and the
//! two-phase boot.
//!
//! The first-boot phase runs synchronously: the guest executes `firstrun.sh`
//! once and powers itself off through the `systemd.run` success/failure
//! actions. The persistent phase is spawned in the background and handed
//! back as a supervised [`EmulatorHandle`]; the caller polls SSH
//! reachability instead of the emulator's exit status, so both phases run
//! with suppressed stdout/stderr and their exit codes are not inspected.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};

use anyhow::{bail, Context, Result};

use crate::config::BootConfig;
use crate::prepare::PreparedArtifacts;

/// Kernel command line shared by both phases.
pub const BASE_KERNEL_ARGS: &str =
    "console=ttyAMA0 root=/dev/mmcblk0p2 rw rootwait rootfstype=ext4";

/// One-shot suffix: run the first-boot script, reboot on success, power off
/// on failure. The script strips this suffix from the image's own
/// `cmdline.txt`; this copy only exists on the emulator's command line.
pub const FIRST_BOOT_KERNEL_ARGS: &str = " systemd.run=/boot/firstrun.sh systemd.run_success_action=reboot systemd.run_failure_action=poweroff";

/// Which of the two boot phases an invocation belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootPhase {
    /// One-shot run of the first-boot script; terminates on its own.
    FirstBoot,
    /// Persistent run that provisioning connects to.
    Normal,
}

/// Fully assembled emulator command: program plus ordered argument list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmulatorInvocation {
    pub program: String,
    pub args: Vec<String>,
}

impl EmulatorInvocation {
    fn to_command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args);
        command
    }
}

/// Drives the emulator against one prepared image.
#[derive(Debug)]
pub struct EmulatorSession {
    config: BootConfig,
    artifacts: PreparedArtifacts,
    image: PathBuf,
    port: u16,
}

impl EmulatorSession {
    pub fn new(
        config: &BootConfig,
        artifacts: &PreparedArtifacts,
        image: &Path,
        port: u16,
    ) -> Self {
        Self {
            config: config.clone(),
            artifacts: artifacts.clone(),
            image: image.to_path_buf(),
            port,
        }
    }

    /// Grow the raw image to the next power of two; the emulated SD
    /// controller rejects media of any other size. An image already sized
    /// to a power of two is left unchanged.
    pub fn resize_image(&self) -> Result<()> {
        let len = fs::metadata(&self.image)
            .with_context(|| format!("reading size of '{}'", self.image.display()))?
            .len();
        let target = round_up_to_power_of_two(len)?;
        if target == len {
            return Ok(());
        }
        log::info!(
            "resizing '{}' from {} to {} bytes",
            self.image.display(),
            len,
            target
        );
        let output = Command::new("qemu-img")
            .args(["resize", "-f", "raw"])
            .arg(&self.image)
            .arg(target.to_string())
            .output()
            .with_context(|| format!("running qemu-img resize on '{}'", self.image.display()))?;
        if !output.status.success() {
            bail!(
                "qemu-img resize failed for '{}': {}",
                self.image.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }

    /// Assemble the emulator argument list for one phase.
    pub fn build_invocation(&self, phase: BootPhase) -> EmulatorInvocation {
        let qemu = &self.config.model.qemu;
        let mut append = BASE_KERNEL_ARGS.to_string();
        if phase == BootPhase::FirstBoot {
            append.push_str(FIRST_BOOT_KERNEL_ARGS);
        }
        let args = vec![
            "-machine".to_string(),
            qemu.machine.clone(),
            "-cpu".to_string(),
            qemu.cpu.clone(),
            "-m".to_string(),
            qemu.memory.clone(),
            "-nographic".to_string(),
            "-dtb".to_string(),
            self.artifacts.dtb.display().to_string(),
            "-kernel".to_string(),
            self.artifacts.kernel.display().to_string(),
            "-append".to_string(),
            append,
            "-no-reboot".to_string(),
            "-device".to_string(),
            "usb-net,netdev=net0".to_string(),
            "-netdev".to_string(),
            format!("user,id=net0,hostfwd=tcp::{}-:22", self.port),
            "-drive".to_string(),
            format!("format=raw,file={}", self.image.display()),
        ];
        EmulatorInvocation {
            program: qemu.bin.clone(),
            args,
        }
    }

    /// Run the boot sequence: the first-boot phase to completion when a
    /// first-boot spec exists, then the persistent phase in the background.
    /// Returns immediately with a handle to the background process so the
    /// provisioning loop can start polling for reachability.
    pub fn run(&self) -> Result<EmulatorHandle> {
        if self.config.first_boot.is_some() {
            println!("Starting qemu");
            println!("Running first config");
            let invocation = self.build_invocation(BootPhase::FirstBoot);
            log::debug!("first-boot invocation: {invocation:?}");
            // This phase powers itself off; the status is not inspected.
            invocation
                .to_command()
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .with_context(|| format!("running emulator '{}'", invocation.program))?;
        }

        println!("Starting qemu");
        let invocation = self.build_invocation(BootPhase::Normal);
        log::debug!("persistent invocation: {invocation:?}");
        let child = invocation
            .to_command()
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("launching emulator '{}'", invocation.program))?;
        Ok(EmulatorHandle { child })
    }
}

/// Supervised handle to the persistent background emulator process.
#[derive(Debug)]
pub struct EmulatorHandle {
    child: Child,
}

impl EmulatorHandle {
    /// True while the emulator is still running.
    pub fn is_running(&mut self) -> Result<bool> {
        Ok(self
            .child
            .try_wait()
            .context("polling emulator process")?
            .is_none())
    }

    /// Kill the emulator if it is still running, then reap the process.
    pub fn stop(mut self) -> Result<()> {
        if self
            .child
            .try_wait()
            .context("polling emulator process")?
            .is_none()
        {
            self.child.kill().context("killing emulator process")?;
        }
        self.child.wait().context("reaping emulator process")?;
        Ok(())
    }
}

/// Smallest power of two that is at least `len`.
fn round_up_to_power_of_two(len: u64) -> Result<u64> {
    len.checked_next_power_of_two()
        .ok_or_else(|| anyhow::anyhow!("image size {len} cannot be rounded to a power of two"))
}
