//! Headless provisioning of Raspberry Pi OS disk images under QEMU.
//!
//! Takes a stock Raspberry Pi OS image and turns it into a configured,
//! provisioned system without any hardware attached:
//!
//! 1. [`partition::locate`] finds the boot partition's byte offset inside
//!    the raw image from the partition inspection tool's report.
//! 2. [`mount::MountHandle`] loop-mounts the boot partition.
//! 3. [`prepare::prepare`] stages the kernel and device tree for the
//!    emulator, syncs provisioning scripts into the image, patches the boot
//!    configuration for USB gadget mode, and installs the rendered one-shot
//!    [`firstboot`] script.
//! 4. [`qemu::EmulatorSession`] resizes the image and drives two boots: a
//!    synchronous first-boot run that configures the guest and powers
//!    itself off, then the persistent background boot.
//! 5. [`provision::ProvisionRunner`] retries SSH until the guest is
//!    reachable, runs the scripts shipped inside the image in lexicographic
//!    order, and shuts the guest down.
//!
//! The mount-prepare-unmount phase and the emulator phase are strictly
//! sequenced; the raw image is never accessed by both at once.

pub mod catalog;
pub mod config;
pub mod firstboot;
pub mod mount;
pub mod partition;
pub mod preflight;
pub mod prepare;
pub mod provision;
pub mod qemu;
pub mod remote;

pub use catalog::{Model, ModelCatalog, QemuProfile};
pub use config::{BootConfig, Credentials, DnsmasqParams, UsbMode};
pub use firstboot::FirstBootSpec;
pub use mount::MountHandle;
pub use prepare::PreparedArtifacts;
pub use provision::{ProvisionReport, ProvisionRunner};
pub use qemu::{BootPhase, EmulatorHandle, EmulatorInvocation, EmulatorSession};
pub use remote::SshConnector;
