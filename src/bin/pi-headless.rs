use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;

use pi_headless::config::{BootConfig, Credentials, DnsmasqParams, UsbMode};
use pi_headless::firstboot::FirstBootSpec;
use pi_headless::mount::MountHandle;
use pi_headless::provision::ProvisionRunner;
use pi_headless::qemu::EmulatorSession;
use pi_headless::remote::SshConnector;
use pi_headless::{partition, preflight, prepare, ModelCatalog};

/// The boot (FAT) partition is always the image's first partition.
const BOOT_PARTITION_INDEX: usize = 0;

/// Where the boot partition gets mounted during preparation.
const MOUNT_DIR: &str = "boot";

/// Where the kernel and device tree are staged for the emulator.
const STAGING_DIR: &str = "data";

/// Prepare a Raspberry Pi OS image and boot it headless under QEMU, then
/// run the provisioning scripts shipped inside the image over SSH.
#[derive(Debug, Parser)]
#[command(name = "pi-headless", version, about)]
struct Cli {
    /// Raw disk image to provision (modified in place).
    image: PathBuf,

    /// Model name from the model catalog.
    #[arg(short, long, default_value = "rpi-zero-2-w")]
    model: String,

    /// Host TCP port forwarded to the guest's SSH port.
    #[arg(short, long, default_value_t = 5555)]
    port: u16,

    /// Do not create a `<image>.bak` copy before modifying the image.
    #[arg(short = 'n', long)]
    no_backup: bool,

    /// USB gadget mode exposed by the guest.
    #[arg(long, value_parser = ["g_serial", "g_ether"])]
    usb_mode: Option<String>,

    /// Run the dnsmasq gateway script during provisioning.
    #[arg(long)]
    enable_dnsmasq: bool,

    /// Gateway address handed to the dnsmasq script.
    #[arg(long, default_value = "10.20.30.1")]
    dnsmasq_gateway: String,

    /// DHCP address range handed to the dnsmasq script.
    #[arg(long, default_value = "10.20.30.2,10.20.30.40")]
    dnsmasq_range: String,

    /// DHCP lease duration handed to the dnsmasq script.
    #[arg(long, default_value = "12h")]
    dnsmasq_lease: String,

    /// Login user; falls back to the first-boot config's user.
    #[arg(long, env = "PI_USER")]
    user: Option<String>,

    /// Login password; falls back to the first-boot config's password.
    #[arg(long, env = "PI_PASSWORD")]
    password: Option<String>,

    /// First-run configuration YAML for Raspberry Pi OS, see example file.
    #[arg(long = "rpi-os-config")]
    rpi_os_config: Option<PathBuf>,

    /// Model catalog file.
    #[arg(long, default_value = "models.yml")]
    models: PathBuf,

    /// Host directory of provisioning scripts copied into the image.
    #[arg(long, default_value = "scripts")]
    scripts: PathBuf,
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    preflight::check_host_tools()?;

    let catalog = ModelCatalog::load(&cli.models)?;
    let model = catalog.get(&cli.model)?.clone();
    let usb_mode = UsbMode::from_flag(cli.usb_mode.as_deref())?;

    let first_boot = match &cli.rpi_os_config {
        Some(path) => {
            let spec = FirstBootSpec::load(path)?;
            println!("Using first config");
            Some(spec)
        }
        None => None,
    };
    let credentials = Credentials::resolve(cli.user, cli.password, first_boot.as_ref())?;
    let dnsmasq = cli.enable_dnsmasq.then(|| DnsmasqParams {
        gateway: cli.dnsmasq_gateway,
        range: cli.dnsmasq_range,
        lease: cli.dnsmasq_lease,
    });
    let config = BootConfig {
        model,
        usb_mode,
        first_boot,
    };

    if !cli.no_backup {
        backup_image(&cli.image)?;
    }

    let offset = partition::locate(&cli.image, BOOT_PARTITION_INDEX)?;
    let mount = MountHandle::mount(&cli.image, offset, Path::new(MOUNT_DIR))?;
    let artifacts = match prepare::prepare(
        mount.target(),
        Path::new(STAGING_DIR),
        &cli.scripts,
        &config,
    ) {
        Ok(artifacts) => {
            mount.unmount()?;
            artifacts
        }
        Err(err) => {
            if let Err(unmount_err) = mount.unmount() {
                log::warn!("cleanup unmount after failed preparation: {unmount_err:#}");
            }
            return Err(err);
        }
    };

    let session = EmulatorSession::new(&config, &artifacts, &cli.image, cli.port);
    session.resize_image()?;
    let emulator = session.run()?;

    let connector = SshConnector::new(
        "localhost",
        cli.port,
        &credentials.user,
        &credentials.password,
    );
    let report = ProvisionRunner::new(config.usb_mode, dnsmasq).run(&connector)?;
    if !report.failed.is_empty() {
        log::warn!(
            "{} of {} provisioning scripts exited non-zero: {}",
            report.failed.len(),
            report.executed.len(),
            report.failed.join(", ")
        );
    }

    emulator.stop()?;
    Ok(())
}

/// Copy the image to a `.bak` sibling before it is modified in place.
fn backup_image(image: &Path) -> Result<()> {
    let backup = PathBuf::from(format!("{}.bak", image.display()));
    fs::copy(image, &backup).with_context(|| {
        format!(
            "backing up '{}' to '{}'",
            image.display(),
            backup.display()
        )
    })?;
    log::info!("backed up image to '{}'", backup.display());
    Ok(())
}
