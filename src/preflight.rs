//! Preflight checks for host tool validation.
//!
//! Validates that the host system has the required tools before the image
//! is touched. This prevents cryptic errors halfway through a run, after
//! the image has already been modified.

use anyhow::{bail, Result};

/// Check if a command exists on the host system.
pub fn command_exists(cmd: &str) -> bool {
    which::which(cmd).is_ok()
}

/// Host tools every run needs, as (command, package) pairs.
///
/// `openssl`, `wpa_passphrase` and `iw` are only invoked when a first-boot
/// spec actually requires a derivation, so they are not listed here.
pub const REQUIRED_TOOLS: &[(&str, &str)] = &[
    ("fdisk", "util-linux"),
    ("mount", "util-linux"),
    ("umount", "util-linux"),
    ("sudo", "sudo"),
    ("rsync", "rsync"),
    ("qemu-img", "qemu-utils"),
];

/// Check that specific tools are available.
///
/// Returns `Err` listing every missing tool and its package.
pub fn check_required_tools(tools: &[(&str, &str)]) -> Result<()> {
    let mut missing = Vec::new();

    for (tool, package) in tools {
        if !command_exists(tool) {
            missing.push((*tool, *package));
        }
    }

    if !missing.is_empty() {
        let msg = missing
            .iter()
            .map(|(t, p)| format!("  {} (install: {})", t, p))
            .collect::<Vec<_>>()
            .join("\n");
        bail!("Missing required host tools:\n{}", msg);
    }

    Ok(())
}

/// Check all tools in [`REQUIRED_TOOLS`].
pub fn check_host_tools() -> Result<()> {
    check_required_tools(REQUIRED_TOOLS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_exists() {
        // 'ls' should exist on any Unix system
        assert!(command_exists("ls"));
        // Random garbage should not exist
        assert!(!command_exists("definitely_not_a_real_command_12345"));
    }

    #[test]
    fn test_check_required_tools_success() {
        let tools = &[("ls", "coreutils"), ("cat", "coreutils")];
        assert!(check_required_tools(tools).is_ok());
    }

    #[test]
    fn test_check_required_tools_failure() {
        let tools = &[("nonexistent_command_xyz", "fake-package")];
        assert!(check_required_tools(tools).is_err());
    }
}
