//! Model catalog: per-model QEMU profile and boot artifact match strings.
//!
//! The catalog is a YAML map keyed by model name; the repository ships one
//! as `models.yml`. Example entry:
//!
//! ```yaml
//! rpi-zero-2-w:
//!   qemu:
//!     bin: qemu-system-aarch64
//!     machine: raspi3b
//!     cpu: cortex-a53
//!     memory: 1G
//!   dtb-target-string: bcm2710-rpi-zero-2
//!   kernel-match-string: kernel8
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Emulator profile for one hardware model.
#[derive(Debug, Clone, Deserialize)]
pub struct QemuProfile {
    /// Emulator binary, e.g. `qemu-system-aarch64`.
    pub bin: String,
    pub machine: String,
    pub cpu: String,
    pub memory: String,
}

/// One catalog entry: how to emulate the model and how to recognize its
/// boot artifacts inside the image's boot partition.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Model {
    pub qemu: QemuProfile,
    /// Substring that identifies the model's device-tree blob.
    pub dtb_target_string: String,
    /// Regex (anchored at the file name's start) matching the kernel image.
    pub kernel_match_string: String,
}

/// Catalog of known models, keyed by name.
#[derive(Debug, Clone, Deserialize)]
#[serde(transparent)]
pub struct ModelCatalog {
    models: BTreeMap<String, Model>,
}

impl ModelCatalog {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading model catalog '{}'", path.display()))?;
        serde_yaml::from_str(&text)
            .with_context(|| format!("parsing model catalog '{}'", path.display()))
    }

    /// Look up a model by name; unknown names list the catalog's contents.
    pub fn get(&self, name: &str) -> Result<&Model> {
        match self.models.get(name) {
            Some(model) => Ok(model),
            None => bail!(
                "unknown model '{}' (known models: {})",
                name,
                self.names().collect::<Vec<_>>().join(", ")
            ),
        }
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.models.keys().map(String::as_str)
    }
}
