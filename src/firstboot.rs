//! First-boot configuration: YAML spec loading, credential derivation, and
//! rendering of the one-shot `firstrun.sh` script.
//!
//! Loading resolves every derived value up front (password hash, Wi-Fi
//! pre-shared key, regulatory country), so [`FirstBootSpec::render_script`]
//! is a pure function of the resolved spec: rendering twice yields
//! byte-identical output.
//!
//! The rendered script prefers the image-vendor configuration helper
//! (`raspberrypi-sys-mods`) when the guest ships it and falls back to direct
//! file edits otherwise. Its final fragment deletes the script and strips
//! the one-shot `systemd.run` trigger from the kernel command line.

use std::fs;
use std::path::Path;
use std::process::Command;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Used when Wi-Fi is configured but no country is given and the host's
/// radio regulatory domain cannot be read.
pub const FALLBACK_WIFI_COUNTRY: &str = "GB";

/// Raw YAML shape of the first-boot configuration file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct FirstBootFile {
    pub hostname: Option<String>,
    pub user: Option<String>,
    pub password_hash: Option<String>,
    pub password: Option<String>,
    pub enable_ssh: Option<bool>,
    pub wifi: Option<WifiFile>,
    pub keyboard_layout: Option<String>,
    pub timezone: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct WifiFile {
    pub name: Option<String>,
    pub psk: Option<String>,
    pub password: Option<String>,
    pub country: Option<String>,
}

/// Fully resolved Wi-Fi configuration (name + pre-shared key + country).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WifiConfig {
    pub name: String,
    pub psk: String,
    pub country: String,
}

/// Resolved first-boot specification. Immutable once constructed.
#[derive(Debug, Clone)]
pub struct FirstBootSpec {
    pub hostname: Option<String>,
    pub user: Option<String>,
    /// Raw login password, kept as a fallback for the SSH credentials.
    pub password: Option<String>,
    pub password_hash: Option<String>,
    pub enable_ssh: bool,
    pub wifi: Option<WifiConfig>,
    pub keyboard_layout: Option<String>,
    pub timezone: Option<String>,
}

impl Default for FirstBootSpec {
    fn default() -> Self {
        Self {
            hostname: None,
            user: None,
            password: None,
            password_hash: None,
            enable_ssh: true,
            wifi: None,
            keyboard_layout: None,
            timezone: None,
        }
    }
}

impl FirstBootSpec {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading first-boot config '{}'", path.display()))?;
        let raw: FirstBootFile = serde_yaml::from_str(&text)
            .with_context(|| format!("parsing first-boot config '{}'", path.display()))?;
        Self::resolve(raw)
    }

    /// Derive everything script rendering needs: hash a raw password when no
    /// hash was given, derive the Wi-Fi pre-shared key from a raw Wi-Fi
    /// password, and fill in the regulatory country.
    pub fn resolve(raw: FirstBootFile) -> Result<Self> {
        let mut password_hash = raw.password_hash;
        if password_hash.is_none() {
            if let Some(password) = &raw.password {
                password_hash = Some(hash_password(password)?);
            }
        }
        let wifi = resolve_wifi(raw.wifi.unwrap_or_default())?;
        Ok(Self {
            hostname: raw.hostname,
            user: raw.user,
            password: raw.password,
            password_hash,
            enable_ssh: raw.enable_ssh.unwrap_or(true),
            wifi,
            keyboard_layout: raw.keyboard_layout,
            timezone: raw.timezone,
        })
    }

    /// Render the one-shot first-boot shell script. Fragment order is fixed:
    /// hostname, ssh, user, Wi-Fi, keyboard, timezone, self-removal footer.
    pub fn render_script(&self) -> String {
        let mut script = String::from("#!/bin/bash\n\nset +e\n\n");

        if let Some(hostname) = &self.hostname {
            script.push_str(&format!(
                r#"
CURRENT_HOSTNAME=`cat /etc/hostname | tr -d " \t\n\r"`
if [ -f /usr/lib/raspberrypi-sys-mods/imager_custom ]; then
   /usr/lib/raspberrypi-sys-mods/imager_custom set_hostname {hostname}
else
   echo {hostname} >/etc/hostname
   sed -i "s/127.0.1.1.*$CURRENT_HOSTNAME/127.0.1.1	{hostname}/g" /etc/hosts
fi

"#
            ));
        }

        if self.enable_ssh {
            script.push_str(
                r#"
if [ -f /usr/lib/raspberrypi-sys-mods/imager_custom ]; then
   /usr/lib/raspberrypi-sys-mods/imager_custom enable_ssh
else
   systemctl enable ssh
fi

"#,
            );
        }

        if let (Some(user), Some(hash)) = (&self.user, &self.password_hash) {
            script.push_str(&format!(
                r#"
FIRSTUSER=`getent passwd 1000 | cut -d: -f1`
FIRSTUSERHOME=`getent passwd 1000 | cut -d: -f6`
if [ -f /usr/lib/userconf-pi/userconf ]; then
   /usr/lib/userconf-pi/userconf '{user}' '{hash}'
else
   echo "$FIRSTUSER:"'{hash}' | chpasswd -e
   if [ "$FIRSTUSER" != "{user}" ]; then
      usermod -l "{user}" "$FIRSTUSER"
      usermod -m -d "/home/{user}" "{user}"
      groupmod -n "{user}" "$FIRSTUSER"
      if grep -q "^autologin-user=" /etc/lightdm/lightdm.conf ; then
         sed /etc/lightdm/lightdm.conf -i -e "s/^autologin-user=.*/autologin-user={user}/"
      fi
      if [ -f /etc/systemd/system/getty@tty1.service.d/autologin.conf ]; then
         sed /etc/systemd/system/getty@tty1.service.d/autologin.conf -i -e "s/$FIRSTUSER/{user}/"
      fi
      if [ -f /etc/sudoers.d/010_pi-nopasswd ]; then
         sed -i "s/^$FIRSTUSER /{user} /" /etc/sudoers.d/010_pi-nopasswd
      fi
   fi
fi

"#
            ));
        }

        if let Some(wifi) = &self.wifi {
            let (name, psk, country) = (&wifi.name, &wifi.psk, &wifi.country);
            script.push_str(&format!(
                r#"
if [ -f /usr/lib/raspberrypi-sys-mods/imager_custom ]; then
   /usr/lib/raspberrypi-sys-mods/imager_custom set_wlan '{name}' '{psk}' '{country}'
else
cat >/etc/wpa_supplicant/wpa_supplicant.conf <<'WPAEOF'
country={country}
ctrl_interface=DIR=/var/run/wpa_supplicant GROUP=netdev
ap_scan=1

update_config=1
network={{
	ssid="{name}"
	psk={psk}
}}

WPAEOF
   chmod 600 /etc/wpa_supplicant/wpa_supplicant.conf
   rfkill unblock wifi
   for filename in /var/lib/systemd/rfkill/*:wlan ; do
       echo 0 > $filename
   done
fi

"#
            ));
        }

        if let Some(layout) = &self.keyboard_layout {
            script.push_str(&format!(
                r#"
if [ -f /usr/lib/raspberrypi-sys-mods/imager_custom ]; then
   /usr/lib/raspberrypi-sys-mods/imager_custom set_keymap '{layout}'
else
cat >/etc/default/keyboard <<'KBEOF'
XKBMODEL="pc105"
XKBLAYOUT="{layout}"
XKBVARIANT=""
XKBOPTIONS=""

KBEOF
   dpkg-reconfigure -f noninteractive keyboard-configuration
fi

"#
            ));
        }

        if let Some(timezone) = &self.timezone {
            script.push_str(&format!(
                r#"
if [ -f /usr/lib/raspberrypi-sys-mods/imager_custom ]; then
   /usr/lib/raspberrypi-sys-mods/imager_custom set_timezone '{timezone}'
else
   rm -f /etc/localtime
   echo "{timezone}" >/etc/timezone
   dpkg-reconfigure -f noninteractive tzdata
fi

"#
            ));
        }

        script.push_str(
            r#"
rm -f /boot/firstrun.sh
sed -i 's| systemd.run.*||g' /boot/cmdline.txt
exit 0
"#,
        );
        script
    }
}

fn resolve_wifi(raw: WifiFile) -> Result<Option<WifiConfig>> {
    let Some(name) = raw.name else {
        return Ok(None);
    };
    let mut psk = raw.psk;
    if psk.is_none() {
        if let Some(password) = &raw.password {
            psk = Some(derive_psk(&name, password)?);
        }
    }
    let Some(psk) = psk else {
        return Ok(None);
    };
    let country = match raw.country {
        Some(country) => country,
        None => detect_wifi_country(),
    };
    Ok(Some(WifiConfig { name, psk, country }))
}

/// Hash a raw login password with the guest's crypt format.
fn hash_password(password: &str) -> Result<String> {
    let output = Command::new("openssl")
        .args(["passwd", "-6", password])
        .output()
        .context("running openssl passwd")?;
    if !output.status.success() {
        bail!(
            "openssl passwd failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Derive a WPA pre-shared key from the network name and raw password.
fn derive_psk(name: &str, password: &str) -> Result<String> {
    let output = Command::new("wpa_passphrase")
        .args([name, password])
        .output()
        .context("running wpa_passphrase")?;
    if !output.status.success() {
        bail!(
            "wpa_passphrase failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    let text = String::from_utf8_lossy(&output.stdout);
    psk_from_wpa_output(&text)
        .ok_or_else(|| anyhow::anyhow!("wpa_passphrase output contains no psk"))
}

/// Country code from the host's radio regulatory settings, with a fixed
/// fallback when the lookup fails.
fn detect_wifi_country() -> String {
    let country = Command::new("iw")
        .args(["reg", "get"])
        .output()
        .ok()
        .filter(|output| output.status.success())
        .and_then(|output| country_from_reg_output(&String::from_utf8_lossy(&output.stdout)));
    country.unwrap_or_else(|| FALLBACK_WIFI_COUNTRY.to_string())
}

/// `wpa_passphrase` prints a commented plain `#psk=` line before the hex
/// `psk=` line; the last occurrence is the derived key.
fn psk_from_wpa_output(output: &str) -> Option<String> {
    let after = output.rsplit("psk=").next()?;
    let value = after.lines().next()?.trim();
    if value.is_empty() || output.find("psk=").is_none() {
        return None;
    }
    Some(value.to_string())
}

/// First token following the last `country ` in `iw reg get` output.
fn country_from_reg_output(output: &str) -> Option<String> {
    let after = output.rsplit("country ").next()?;
    if !output.contains("country ") {
        return None;
    }
    let code: String = after
        .chars()
        .take_while(|c| !c.is_whitespace() && *c != ':')
        .collect();
    if code.is_empty() {
        None
    } else {
        Some(code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_spec() -> FirstBootSpec {
        FirstBootSpec {
            hostname: Some("pi-test".to_string()),
            user: Some("pi".to_string()),
            password: Some("raspberry".to_string()),
            password_hash: Some("$6$abc$def".to_string()),
            enable_ssh: true,
            wifi: Some(WifiConfig {
                name: "homenet".to_string(),
                psk: "deadbeef".to_string(),
                country: "DE".to_string(),
            }),
            keyboard_layout: Some("de".to_string()),
            timezone: Some("Europe/Berlin".to_string()),
        }
    }

    #[test]
    fn rendering_is_pure() {
        let spec = full_spec();
        assert_eq!(spec.render_script(), spec.render_script());
    }

    #[test]
    fn fragments_appear_in_fixed_order() {
        let script = full_spec().render_script();
        let hostname = script.find("set_hostname pi-test").unwrap();
        let ssh = script.find("enable_ssh").unwrap();
        let user = script.find("userconf-pi").unwrap();
        let wifi = script.find("set_wlan 'homenet'").unwrap();
        let keyboard = script.find("set_keymap 'de'").unwrap();
        let timezone = script.find("set_timezone 'Europe/Berlin'").unwrap();
        let footer = script.find("rm -f /boot/firstrun.sh").unwrap();
        assert!(hostname < ssh);
        assert!(ssh < user);
        assert!(user < wifi);
        assert!(wifi < keyboard);
        assert!(keyboard < timezone);
        assert!(timezone < footer);
    }

    #[test]
    fn omitted_fields_omit_their_fragments() {
        let spec = FirstBootSpec {
            hostname: Some("pi-test".to_string()),
            enable_ssh: false,
            ..FirstBootSpec::default()
        };
        let script = spec.render_script();
        assert!(script.contains("set_hostname pi-test"));
        assert!(!script.contains("enable_ssh"));
        assert!(!script.contains("wpa_supplicant"));
        assert!(!script.contains("set_keymap"));
        assert!(!script.contains("set_timezone"));
        // The self-removal footer is unconditional.
        assert!(script.contains("rm -f /boot/firstrun.sh"));
        assert!(script.contains("sed -i 's| systemd.run.*||g' /boot/cmdline.txt"));
        assert!(script.trim_end().ends_with("exit 0"));
    }

    #[test]
    fn user_fragment_requires_user_and_hash() {
        let spec = FirstBootSpec {
            user: Some("pi".to_string()),
            ..FirstBootSpec::default()
        };
        assert!(!spec.render_script().contains("chpasswd"));
    }

    #[test]
    fn wifi_fragment_embeds_country_ssid_and_key() {
        let script = full_spec().render_script();
        assert!(script.contains("country=DE"));
        assert!(script.contains("ssid=\"homenet\""));
        assert!(script.contains("psk=deadbeef"));
    }

    #[test]
    fn spec_file_parses_kebab_case_fields() {
        let raw: FirstBootFile = serde_yaml::from_str(
            "\
hostname: pi-test
user: pi
password-hash: \"$6$abc$def\"
enable-ssh: false
wifi:
  name: homenet
  psk: deadbeef
  country: DE
keyboard-layout: de
timezone: Europe/Berlin
",
        )
        .unwrap();
        assert_eq!(raw.hostname.as_deref(), Some("pi-test"));
        assert_eq!(raw.password_hash.as_deref(), Some("$6$abc$def"));
        assert_eq!(raw.enable_ssh, Some(false));
        assert_eq!(raw.wifi.as_ref().unwrap().country.as_deref(), Some("DE"));
        let spec = FirstBootSpec::resolve(raw).unwrap();
        assert_eq!(
            spec.wifi,
            Some(WifiConfig {
                name: "homenet".to_string(),
                psk: "deadbeef".to_string(),
                country: "DE".to_string(),
            })
        );
        assert!(!spec.enable_ssh);
    }

    #[test]
    fn psk_is_last_psk_line_of_wpa_output() {
        let output = "\
network={
	ssid=\"homenet\"
	#psk=\"plaintext\"
	psk=0123456789abcdef
}";
        assert_eq!(
            psk_from_wpa_output(output).as_deref(),
            Some("0123456789abcdef")
        );
        assert_eq!(psk_from_wpa_output("no key here"), None);
    }

    #[test]
    fn country_comes_from_reg_output_with_fallback() {
        let output = "global\ncountry DE: DFS-ETSI\n";
        assert_eq!(country_from_reg_output(output).as_deref(), Some("DE"));
        assert_eq!(country_from_reg_output("phy#0 (self-managed)"), None);
    }
}
