//! Boot artifact staging and boot-partition patching.
//!
//! Runs against the mounted boot partition, before the emulator starts:
//! stages the kernel and device tree where QEMU can read them, syncs the
//! host-side provisioning scripts into the image, patches `config.txt` /
//! `cmdline.txt` for USB gadget mode, and installs the rendered first-boot
//! script. Each step is independent and skipped when its input is absent.
//!
//! Writes into the mounted filesystem go through `sudo tee`; the mount is
//! root-owned. The config patches themselves are pure text transforms and
//! idempotent: applying one twice yields the same bytes as applying it once.

use std::ffi::OsStr;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use anyhow::{bail, Context, Result};
use regex::Regex;

use crate::config::BootConfig;
use crate::firstboot::FirstBootSpec;

/// Name of the one-shot script on the image's boot partition.
pub const FIRST_BOOT_SCRIPT: &str = "firstrun.sh";

/// Directory inside the boot partition that receives provisioning scripts.
const GUEST_SCRIPTS_SUBDIR: &str = "scripts";

/// Staged kernel and device-tree paths handed to the emulator.
#[derive(Debug, Clone)]
pub struct PreparedArtifacts {
    pub dtb: PathBuf,
    pub kernel: PathBuf,
}

/// Prepare the mounted boot partition and stage the boot artifacts.
pub fn prepare(
    mount_dir: &Path,
    staging_dir: &Path,
    scripts_dir: &Path,
    config: &BootConfig,
) -> Result<PreparedArtifacts> {
    let artifacts = stage_boot_artifacts(mount_dir, staging_dir, config)?;
    sync_provisioning_scripts(scripts_dir, mount_dir)?;
    if let Some(module) = config.usb_mode.module_name() {
        apply_usb_mode(mount_dir, module)?;
    }
    if let Some(spec) = &config.first_boot {
        install_first_boot_script(mount_dir, spec)?;
    }
    Ok(artifacts)
}

/// Copy the model's device tree and kernel out of the boot partition into
/// the staging directory, where the emulator reads them after unmount.
fn stage_boot_artifacts(
    mount_dir: &Path,
    staging_dir: &Path,
    config: &BootConfig,
) -> Result<PreparedArtifacts> {
    fs::create_dir_all(staging_dir)
        .with_context(|| format!("creating staging directory '{}'", staging_dir.display()))?;

    let dtb = stage_file(
        &select_dtb(mount_dir, &config.model.dtb_target_string)?,
        staging_dir,
    )?;
    let kernel = stage_file(
        &select_kernel(mount_dir, &config.model.kernel_match_string)?,
        staging_dir,
    )?;
    log::info!(
        "staged boot artifacts '{}' and '{}'",
        dtb.display(),
        kernel.display()
    );
    Ok(PreparedArtifacts { dtb, kernel })
}

fn stage_file(source: &Path, staging_dir: &Path) -> Result<PathBuf> {
    let name = source
        .file_name()
        .ok_or_else(|| anyhow::anyhow!("artifact path '{}' has no name", source.display()))?;
    let dest = staging_dir.join(name);
    fs::copy(source, &dest)
        .with_context(|| format!("copying '{}' to '{}'", source.display(), dest.display()))?;
    Ok(dest)
}

/// First `.dtb` (in name order) containing the model's match string.
fn select_dtb(source_dir: &Path, needle: &str) -> Result<PathBuf> {
    files_with_extension(source_dir, "dtb")?
        .into_iter()
        .find(|path| file_name(path).contains(needle))
        .ok_or_else(|| {
            anyhow::anyhow!(
                "no device tree matching '{}' under '{}'",
                needle,
                source_dir.display()
            )
        })
}

/// Largest `.img` whose name matches the model's kernel pattern. Several
/// kernels can match one pattern (e.g. `kernel7` matches `kernel7.img` and
/// `kernel7l.img`); the largest is taken as the most complete build.
fn select_kernel(source_dir: &Path, pattern: &str) -> Result<PathBuf> {
    let matcher = Regex::new(&format!("^(?:{pattern})"))
        .with_context(|| format!("invalid kernel match pattern '{pattern}'"))?;
    let mut candidates = Vec::new();
    for path in files_with_extension(source_dir, "img")? {
        if !matcher.is_match(&file_name(&path)) {
            continue;
        }
        let size = fs::metadata(&path)
            .with_context(|| format!("reading metadata of '{}'", path.display()))?
            .len();
        candidates.push((path, size));
    }
    candidates
        .into_iter()
        .max_by_key(|(_, size)| *size)
        .map(|(path, _)| path)
        .ok_or_else(|| {
            anyhow::anyhow!(
                "no kernel image matching '{}' under '{}'",
                pattern,
                source_dir.display()
            )
        })
}

fn files_with_extension(dir: &Path, extension: &str) -> Result<Vec<PathBuf>> {
    let entries = fs::read_dir(dir)
        .with_context(|| format!("reading boot partition directory '{}'", dir.display()))?;
    let mut paths = Vec::new();
    for entry in entries {
        let path = entry
            .with_context(|| format!("reading directory entry in '{}'", dir.display()))?
            .path();
        if path.is_file() && path.extension() == Some(OsStr::new(extension)) {
            paths.push(path);
        }
    }
    paths.sort();
    Ok(paths)
}

fn file_name(path: &Path) -> String {
    path.file_name().unwrap_or_default().to_string_lossy().into_owned()
}

/// Sync the host-side provisioning scripts into the image so the guest can
/// run them after boot. Skipped with a warning when the host directory does
/// not exist.
fn sync_provisioning_scripts(scripts_dir: &Path, mount_dir: &Path) -> Result<()> {
    if !scripts_dir.is_dir() {
        log::warn!(
            "provisioning scripts directory '{}' not found, skipping sync",
            scripts_dir.display()
        );
        return Ok(());
    }
    let output = Command::new("sudo")
        .args(["rsync", "-a", "--no-o", "--no-g"])
        .arg(format!("{}/", scripts_dir.display()))
        .arg(mount_dir.join(GUEST_SCRIPTS_SUBDIR))
        .output()
        .with_context(|| format!("running rsync from '{}'", scripts_dir.display()))?;
    if !output.status.success() {
        bail!(
            "syncing provisioning scripts into '{}' failed: {}",
            mount_dir.display(),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(())
}

/// Patch `config.txt` and `cmdline.txt` for the requested USB gadget mode.
fn apply_usb_mode(mount_dir: &Path, module: &str) -> Result<()> {
    let config_path = mount_dir.join("config.txt");
    let config = fs::read_to_string(&config_path)
        .with_context(|| format!("reading '{}'", config_path.display()))?;
    write_as_root(&config_path, &upsert_dwc2_overlay(&config))?;

    let cmdline_path = mount_dir.join("cmdline.txt");
    let cmdline = fs::read_to_string(&cmdline_path)
        .with_context(|| format!("reading '{}'", cmdline_path.display()))?;
    write_as_root(&cmdline_path, &upsert_usb_modules(&cmdline, module)?)?;
    Ok(())
}

/// Append the dwc2 overlay directive unless it is already present.
pub(crate) fn upsert_dwc2_overlay(config: &str) -> String {
    let directive = "\ndtoverlay=dwc2";
    if config.contains(directive) {
        config.to_string()
    } else {
        format!("{config}{directive}\n")
    }
}

/// Set or insert the gadget module-load directive on the kernel command
/// line. A prior directive for any dwc2 gadget module is replaced; otherwise
/// the directive is inserted after `rootwait`.
pub(crate) fn upsert_usb_modules(cmdline: &str, module: &str) -> Result<String> {
    let matcher = Regex::new(r"modules-load=dwc2,\w+").context("compiling modules-load pattern")?;
    let directive = format!("modules-load=dwc2,{module}");
    let patched = if matcher.is_match(cmdline) {
        matcher.replace_all(cmdline, directive.as_str()).into_owned()
    } else {
        cmdline.replace("rootwait", &format!("rootwait {directive}"))
    };
    Ok(patched)
}

/// Render the first-boot script and install it executable on the boot
/// partition.
fn install_first_boot_script(mount_dir: &Path, spec: &FirstBootSpec) -> Result<()> {
    let path = mount_dir.join(FIRST_BOOT_SCRIPT);
    write_as_root(&path, &spec.render_script())?;
    let output = Command::new("sudo")
        .args(["chmod", "+x"])
        .arg(&path)
        .output()
        .with_context(|| format!("running chmod on '{}'", path.display()))?;
    if !output.status.success() {
        bail!(
            "marking '{}' executable failed: {}",
            path.display(),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    log::info!("installed first-boot script at '{}'", path.display());
    Ok(())
}

/// Write a file owned by root through `sudo tee`, discarding tee's echo.
fn write_as_root(path: &Path, content: &str) -> Result<()> {
    let mut child = Command::new("sudo")
        .arg("tee")
        .arg(path)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .with_context(|| format!("spawning tee for '{}'", path.display()))?;
    child
        .stdin
        .take()
        .context("tee stdin unavailable")?
        .write_all(content.as_bytes())
        .with_context(|| format!("writing '{}'", path.display()))?;
    let status = child
        .wait()
        .with_context(|| format!("waiting for tee on '{}'", path.display()))?;
    if !status.success() {
        bail!("writing '{}' as root failed", path.display());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use tempfile::tempdir;

    fn write_file(dir: &Path, name: &str, len: usize) {
        let mut file = File::create(dir.join(name)).unwrap();
        file.write_all(&vec![0u8; len]).unwrap();
    }

    #[test]
    fn dwc2_overlay_append_is_idempotent() {
        let config = "arm_64bit=1\nkernel=kernel8.img";
        let once = upsert_dwc2_overlay(config);
        assert!(once.ends_with("\ndtoverlay=dwc2\n"));
        assert_eq!(upsert_dwc2_overlay(&once), once);
    }

    #[test]
    fn usb_modules_inserted_after_rootwait() {
        let cmdline = "console=serial0,115200 root=PARTUUID=abc rootwait quiet";
        let patched = upsert_usb_modules(cmdline, "g_ether").unwrap();
        assert_eq!(
            patched,
            "console=serial0,115200 root=PARTUUID=abc rootwait modules-load=dwc2,g_ether quiet"
        );
    }

    #[test]
    fn usb_modules_upsert_is_idempotent_and_replaces_prior_mode() {
        let cmdline = "root=PARTUUID=abc rootwait quiet";
        let once = upsert_usb_modules(cmdline, "g_serial").unwrap();
        let twice = upsert_usb_modules(&once, "g_serial").unwrap();
        assert_eq!(twice, once);

        let switched = upsert_usb_modules(&once, "g_ether").unwrap();
        assert!(switched.contains("modules-load=dwc2,g_ether"));
        assert!(!switched.contains("g_serial"));
    }

    #[test]
    fn kernel_selection_prefers_largest_match() {
        let dir = tempdir().unwrap();
        write_file(dir.path(), "kernel7.img", 100);
        write_file(dir.path(), "kernel7l.img", 200);
        write_file(dir.path(), "kernel8.img", 400);
        let kernel = select_kernel(dir.path(), "kernel7").unwrap();
        assert_eq!(file_name(&kernel), "kernel7l.img");
    }

    #[test]
    fn kernel_pattern_is_anchored_at_name_start() {
        let dir = tempdir().unwrap();
        write_file(dir.path(), "notkernel8.img", 100);
        assert!(select_kernel(dir.path(), "kernel8").is_err());
    }

    #[test]
    fn missing_kernel_is_fatal() {
        let dir = tempdir().unwrap();
        write_file(dir.path(), "bootcode.bin", 10);
        let err = select_kernel(dir.path(), "kernel8").unwrap_err().to_string();
        assert!(err.contains("no kernel image"), "{err}");
    }

    #[test]
    fn dtb_selection_matches_substring() {
        let dir = tempdir().unwrap();
        write_file(dir.path(), "bcm2708-rpi-b.dtb", 10);
        write_file(dir.path(), "bcm2710-rpi-zero-2-w.dtb", 10);
        let dtb = select_dtb(dir.path(), "bcm2710-rpi-zero-2").unwrap();
        assert_eq!(file_name(&dtb), "bcm2710-rpi-zero-2-w.dtb");
        assert!(select_dtb(dir.path(), "bcm2711").is_err());
    }
}
