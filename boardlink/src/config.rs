//! Configuration management for boardlink.
//!
//! Settings are read once, at the edge of the program, from environment
//! variables:
//!
//! - `BOARDLINK_DEVICE`: name of the preferred board
//! - `BOARDLINK_DISCOVERY_TIMEOUT_SECS`: how long single-device commands search
//! - `BOARDLINK_USB_DISABLE`: when set, never look for boards over USB
//! - `BOARDLINK_LAN_DISABLE`: when set, never look for boards over LAN
//! - `BOARDLINK_LAN_PREFER`: when set, talk LAN to boards reachable both ways
//! - `BOARDLINK_BUILDS_URL`: root of the firmware build server
//!
//! Nothing below this module reads the environment.

use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{
    discovery::{Authorization, DiscoveryFilter, DEFAULT_TIMEOUT},
    error::{Error, Result},
    select::SelectOptions,
};

const DEFAULT_BUILDS_URL: &str = "https://builds.tessel.io/t2";

/// Main configuration structure.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Config {
    pub discovery: DiscoveryConfig,

    /// Board to pick when several are found and none was named
    pub preferred_name: Option<String>,

    pub builds: BuildsConfig,
}

/// Defaults for every discovery session.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct DiscoveryConfig {
    pub timeout_secs: u64,
    pub usb: bool,
    pub lan: bool,
    #[serde(default)]
    pub lan_prefer: bool,
}

/// Build server locations.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct BuildsConfig {
    /// JSON list of published builds
    pub catalog_url: String,
    /// Per-build image directories live under here, keyed by build SHA
    pub artifact_base_url: String,
    /// Images used to restore a board with a broken flash
    pub restore_base_url: String,
}

impl BuildsConfig {
    pub fn from_base(base: &str) -> Self {
        let base = base.trim_end_matches('/');
        Self {
            catalog_url: format!("{}/firmware/builds.json", base),
            artifact_base_url: format!("{}/firmware", base),
            restore_base_url: format!("{}/restore", base),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            discovery: DiscoveryConfig {
                timeout_secs: DEFAULT_TIMEOUT.as_secs(),
                usb: true,
                lan: true,
                lan_prefer: false,
            },
            preferred_name: None,
            builds: BuildsConfig::from_base(DEFAULT_BUILDS_URL),
        }
    }
}

impl Config {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        config.preferred_name = lookup("BOARDLINK_DEVICE").filter(|name| !name.is_empty());

        if let Some(raw) = lookup("BOARDLINK_DISCOVERY_TIMEOUT_SECS") {
            config.discovery.timeout_secs = raw.trim().parse().map_err(|_| {
                Error::Config(format!(
                    "BOARDLINK_DISCOVERY_TIMEOUT_SECS must be a whole number of seconds, got '{}'",
                    raw
                ))
            })?;
        }

        config.discovery.usb = lookup("BOARDLINK_USB_DISABLE").is_none();
        config.discovery.lan = lookup("BOARDLINK_LAN_DISABLE").is_none();
        config.discovery.lan_prefer = lookup("BOARDLINK_LAN_PREFER").is_some();

        if let Some(base) = lookup("BOARDLINK_BUILDS_URL") {
            config.builds = BuildsConfig::from_base(&base);
        }

        Ok(config)
    }

    /// Starting filter for a session; commands narrow it further.
    pub fn discovery_filter(&self) -> DiscoveryFilter {
        DiscoveryFilter {
            timeout: Duration::from_secs(self.discovery.timeout_secs),
            usb: self.discovery.usb,
            lan: self.discovery.lan,
            authorized: Authorization::Any,
            name: None,
            lan_prefer: self.discovery.lan_prefer,
            usb_alt_setting: None,
        }
    }

    /// Selection options for a command naming `name`, if any.
    pub fn select_options(&self, name: Option<&str>) -> SelectOptions {
        SelectOptions {
            name: name.map(str::to_string),
            preferred_name: self.preferred_name.clone(),
        }
    }
}
