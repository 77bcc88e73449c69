//! Environment configuration for the bridge, with validation.

use anyhow::{bail, Result};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use tracing::warn;

// ---------------------------------------------------------------------------
// Settings structures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Settings {
    pub web: WebSettings,
    pub hub: HubSettings,
    pub smtp: SmtpSettings,
    /// Minimum interval between two alerts for the same device.
    pub alert_cooldown_secs: u64,
    pub mapping_path: PathBuf,
    /// Acknowledge relay events with OK even when the hub rejected the command.
    pub optimistic_ack: bool,
}

#[derive(Debug, Clone)]
pub struct WebSettings {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct HubSettings {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub timeout_secs: u64,
    pub simulator: bool,
    pub simulator_url: String,
    pub icon_on: Option<u32>,
    pub icon_off: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct SmtpSettings {
    pub server: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    /// E-mail-to-SMS gateway address.
    pub sms_to: String,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            host: "192.168.1.33".into(),
            port: 80,
            user: String::new(),
            password: String::new(),
            timeout_secs: 10,
            simulator: false,
            simulator_url: "http://127.0.0.1:5000/simulator".into(),
            icon_on: None,
            icon_off: None,
        }
    }
}

impl HubSettings {
    /// Base address every hub request is built on. Port 80 is left implicit.
    pub fn base_url(&self) -> String {
        if self.simulator {
            return self.simulator_url.trim_end_matches('/').to_string();
        }
        if self.port == 80 {
            format!("http://{}", self.host)
        } else {
            format!("http://{}:{}", self.host, self.port)
        }
    }

    pub fn icon_for(&self, on: bool) -> Option<u32> {
        if on {
            self.icon_on
        } else {
            self.icon_off
        }
    }
}

impl SmtpSettings {
    /// Sender and destination are both needed before anything can be sent.
    pub fn is_configured(&self) -> bool {
        !self.user.trim().is_empty() && !self.sms_to.trim().is_empty()
    }
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

impl Settings {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build settings from any key lookup. Unset keys fall back to defaults;
    /// unparsable values fall back too, with a warning.
    pub fn from_lookup<F>(get: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let text = |key: &str, default: &str| get(key).unwrap_or_else(|| default.to_string());

        let web = WebSettings {
            host: text("WEB_HOST", "0.0.0.0"),
            port: parse_or(&get, "WEB_PORT", 5000),
        };

        let hub_defaults = HubSettings::default();
        let hub = HubSettings {
            host: text("FIBARO_IP", &hub_defaults.host),
            port: parse_or(&get, "FIBARO_PORT", hub_defaults.port),
            user: text("FIBARO_USER", ""),
            password: text("FIBARO_PASSWORD", ""),
            timeout_secs: parse_or(&get, "FIBARO_TIMEOUT_S", hub_defaults.timeout_secs),
            simulator: flag(&get, "FIBARO_SIMULATOR", false),
            simulator_url: get("FIBARO_SIMULATOR_URL")
                .unwrap_or_else(|| format!("http://127.0.0.1:{}/simulator", web.port)),
            icon_on: parse_opt(&get, "FIBARO_ICON_ON"),
            icon_off: parse_opt(&get, "FIBARO_ICON_OFF"),
        };

        let smtp = SmtpSettings {
            server: text("SMTP_SERVER", "localhost"),
            port: parse_or(&get, "SMTP_PORT", 587),
            user: text("SMTP_USER", ""),
            password: text("SMTP_PASS", ""),
            sms_to: text("SMS_TO", ""),
        };

        Self {
            web,
            hub,
            smtp,
            alert_cooldown_secs: parse_or(&get, "ALERT_COOLDOWN", 300),
            mapping_path: PathBuf::from(text("DEVICE_MAPPING_PATH", "device_mapping.json")),
            optimistic_ack: flag(&get, "OPTIMISTIC_ACK", true),
        }
    }

    /// Validate all settings. Returns `Ok(())` or an error describing every
    /// violation found.
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        if self.web.port == 0 {
            errors.push("WEB_PORT must not be 0".into());
        }

        // ── Hub ─────────────────────────────────────────────────
        if self.hub.simulator {
            let url = self.hub.simulator_url.as_str();
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                errors.push(format!(
                    "FIBARO_SIMULATOR_URL '{url}' must start with http:// or https://"
                ));
            }
        } else {
            if self.hub.host.trim().is_empty() {
                errors.push("FIBARO_IP is empty".into());
            }
            if self.hub.port == 0 {
                errors.push("FIBARO_PORT must not be 0".into());
            }
        }
        if !(5..=15).contains(&self.hub.timeout_secs) {
            errors.push(format!(
                "FIBARO_TIMEOUT_S {} out of range [5, 15]",
                self.hub.timeout_secs
            ));
        }
        if self.hub.icon_on == Some(0) || self.hub.icon_off == Some(0) {
            errors.push("FIBARO_ICON_ON / FIBARO_ICON_OFF must be positive".into());
        }

        // ── SMTP ────────────────────────────────────────────────
        if self.smtp.port == 0 {
            errors.push("SMTP_PORT must not be 0".into());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }
}

fn parse_or<T, F>(get: &F, key: &str, default: T) -> T
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    parse_opt(get, key).unwrap_or(default)
}

fn parse_opt<T, F>(get: &F, key: &str) -> Option<T>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    let raw = get(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(key, value = %raw, "config: unparsable value, using default");
            None
        }
    }
}

fn flag<F>(get: &F, key: &str, default: bool) -> bool
where
    F: Fn(&str) -> Option<String>,
{
    get(key)
        .map(|v| {
            let v = v.trim();
            v == "1" || v.eq_ignore_ascii_case("true")
        })
        .unwrap_or(default)
}

// ===========================================================================
// Tests
// ===========================================================================
