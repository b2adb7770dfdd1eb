//! Run configuration threaded explicitly into each pipeline stage.
//!
//! There is no ambient state: the CLI resolves everything up front and each
//! component receives immutable structs by value or reference.

use anyhow::{bail, Result};

use crate::catalog::Model;
use crate::firstboot::FirstBootSpec;

/// USB gadget mode exposed by the guest over the emulated dwc2 controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UsbMode {
    /// No gadget interface.
    #[default]
    None,
    /// Serial console over USB (`g_serial`).
    Serial,
    /// Ethernet over USB (`g_ether`).
    Ethernet,
}

impl UsbMode {
    /// Kernel module named by the `modules-load=dwc2,<module>` directive.
    pub fn module_name(self) -> Option<&'static str> {
        match self {
            UsbMode::None => None,
            UsbMode::Serial => Some("g_serial"),
            UsbMode::Ethernet => Some("g_ether"),
        }
    }

    /// Parse the CLI flag value. Absent or empty means no gadget mode.
    pub fn from_flag(value: Option<&str>) -> Result<Self> {
        match value {
            None | Some("") => Ok(UsbMode::None),
            Some("g_serial") => Ok(UsbMode::Serial),
            Some("g_ether") => Ok(UsbMode::Ethernet),
            Some(other) => bail!("unknown USB mode '{}' (expected g_serial or g_ether)", other),
        }
    }
}

/// Parameters handed to the dnsmasq gateway script as positional arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsmasqParams {
    pub gateway: String,
    pub range: String,
    pub lease: String,
}

/// Login credentials for the guest's SSH account.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

impl Credentials {
    /// Resolve login credentials: explicit values (CLI flag or environment)
    /// win, then the first-boot spec's user/password. Missing either half is
    /// a fatal pre-condition.
    pub fn resolve(
        user: Option<String>,
        password: Option<String>,
        first_boot: Option<&FirstBootSpec>,
    ) -> Result<Self> {
        let user = user.or_else(|| first_boot.and_then(|spec| spec.user.clone()));
        let password = password.or_else(|| first_boot.and_then(|spec| spec.password.clone()));
        match (user, password) {
            (Some(user), Some(password)) => Ok(Self { user, password }),
            _ => bail!("user and password are not set"),
        }
    }
}

/// Everything the prepare and boot stages need to know about this run.
#[derive(Debug, Clone)]
pub struct BootConfig {
    /// Resolved model catalog entry.
    pub model: Model,
    pub usb_mode: UsbMode,
    /// Present when a first-boot YAML spec was given on the command line.
    pub first_boot: Option<FirstBootSpec>,
}
