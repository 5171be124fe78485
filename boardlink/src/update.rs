//! Firmware version resolution and update.
//!
//! An update runs through a fixed sequence:
//!
//! ```text
//! fetch catalog -> current version -> target build -> decide -> skip | flash
//! ```
//!
//! The decision itself ([`plan`]) is a pure function of the catalog, the
//! version the board runs and the request, so it is tested without any
//! transport. [`UpdateResolver`] wraps it with the I/O: the [`BuildSource`]
//! for the catalog and images, and the device for its current build and its
//! flash chip.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::{
    config::BuildsConfig,
    device::Device,
    error::{Error, Result},
    flash::{self, FirmwareImages},
    tracing::prelude::*,
};

/// Requested version meaning "whatever is newest".
pub const LATEST: &str = "latest";

/// A `major.minor.patch` firmware version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FirmwareVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl FirmwareVersion {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }
}

impl FromStr for FirmwareVersion {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::Catalog(format!("invalid firmware version '{}'", s));
        let mut parts = s.split('.');
        let mut next = || -> Result<u32> {
            parts
                .next()
                .and_then(|p| p.parse().ok())
                .ok_or_else(invalid)
        };
        let version = Self::new(next()?, next()?, next()?);
        if parts.next().is_some() {
            return Err(invalid());
        }
        Ok(version)
    }
}

impl fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// One entry of the build list.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct BuildDescriptor {
    pub version: String,
    /// Commit the build was made from; also what a board reports as its
    /// current build
    pub sha: String,
    #[serde(with = "time::serde::rfc3339")]
    pub released: OffsetDateTime,
}

impl BuildDescriptor {
    pub fn firmware_version(&self) -> Result<FirmwareVersion> {
        self.version.parse()
    }
}

/// Available builds, oldest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildCatalog {
    builds: Vec<BuildDescriptor>,
}

impl BuildCatalog {
    pub fn new(builds: Vec<BuildDescriptor>) -> Self {
        Self { builds }
    }

    /// Parse the JSON build list served by the build server.
    pub fn from_json(json: &str) -> Result<Self> {
        let builds: Vec<BuildDescriptor> = serde_json::from_str(json)?;
        Ok(Self::new(builds))
    }

    pub fn builds(&self) -> &[BuildDescriptor] {
        &self.builds
    }

    pub fn latest(&self) -> Option<&BuildDescriptor> {
        self.builds.last()
    }

    pub fn find_by_version(&self, version: &str) -> Option<&BuildDescriptor> {
        self.builds.iter().find(|b| b.version == version)
    }

    pub fn find_by_sha(&self, sha: &str) -> Option<&BuildDescriptor> {
        self.builds.iter().find(|b| b.sha == sha)
    }

    /// The `n` newest builds, newest first.
    pub fn recent(&self, n: usize) -> impl Iterator<Item = &BuildDescriptor> {
        self.builds.iter().rev().take(n)
    }
}

/// Where builds and their images come from.
#[async_trait]
pub trait BuildSource: Send + Sync {
    async fn fetch_catalog(&self) -> Result<BuildCatalog>;

    async fn fetch_artifact(&self, build: &BuildDescriptor) -> Result<FirmwareImages>;

    /// The images used to bring a board back from a broken flash.
    async fn fetch_restore_images(&self) -> Result<FirmwareImages>;
}

/// Images making up a firmware set, by file stem.
const UBOOT_IMAGE: &str = "uboot";
const SQUASHFS_IMAGE: &str = "squashfs";

/// URL of one image file, under a build's directory when `sha` is given.
pub fn artifact_url(base: &str, sha: Option<&str>, image: &str) -> String {
    let base = base.trim_end_matches('/');
    match sha {
        Some(sha) => format!("{}/{}/{}.bin", base, sha, image),
        None => format!("{}/{}.bin", base, image),
    }
}

/// [`BuildSource`] backed by the HTTP build server.
#[derive(Debug, Clone)]
pub struct HttpBuildSource {
    client: reqwest::Client,
    config: BuildsConfig,
}

impl HttpBuildSource {
    pub fn new(config: BuildsConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    async fn get(&self, url: &str) -> Result<reqwest::Response> {
        debug!(url = %url, "Fetching");
        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(Error::Catalog(format!(
                "{} answered HTTP {}",
                url,
                response.status()
            )));
        }
        Ok(response)
    }

    async fn get_bytes(&self, url: &str) -> Result<Bytes> {
        let bytes = self.get(url).await?.bytes().await?;
        debug!(url = %url, bytes = bytes.len(), "Downloaded");
        Ok(bytes)
    }

    async fn fetch_images(&self, base: &str, sha: Option<&str>) -> Result<FirmwareImages> {
        let uboot = self
            .get_bytes(&artifact_url(base, sha, UBOOT_IMAGE))
            .await?;
        let squashfs = self
            .get_bytes(&artifact_url(base, sha, SQUASHFS_IMAGE))
            .await?;
        Ok(FirmwareImages { uboot, squashfs })
    }
}

#[async_trait]
impl BuildSource for HttpBuildSource {
    async fn fetch_catalog(&self) -> Result<BuildCatalog> {
        let text = self.get(&self.config.catalog_url).await?.text().await?;
        BuildCatalog::from_json(&text)
    }

    async fn fetch_artifact(&self, build: &BuildDescriptor) -> Result<FirmwareImages> {
        self.fetch_images(&self.config.artifact_base_url, Some(&build.sha))
            .await
    }

    async fn fetch_restore_images(&self) -> Result<FirmwareImages> {
        self.fetch_images(&self.config.restore_base_url, None).await
    }
}

/// What the caller asked to update to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateRequest {
    /// A specific version, or `None` (or `"latest"`) for the newest build
    pub version: Option<String>,
    /// Skip the current version check and the flash chip ID check
    pub force: bool,
}

impl UpdateRequest {
    fn explicit_version(&self) -> Option<&str> {
        self.version.as_deref().filter(|v| *v != LATEST)
    }
}

/// Outcome of [`plan`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Skip {
        current: FirmwareVersion,
    },
    Flash {
        target: BuildDescriptor,
        from: Option<FirmwareVersion>,
    },
}

/// Decide what an update should do.
///
/// `current` is `None` when the running version was not looked up, which
/// only happens for forced updates.
pub fn plan(
    catalog: &BuildCatalog,
    current: Option<FirmwareVersion>,
    request: &UpdateRequest,
) -> Result<Decision> {
    if let Some(version) = request.explicit_version() {
        let target = catalog
            .find_by_version(version)
            .ok_or_else(|| Error::VersionNotFound(version.to_string()))?;
        return Ok(Decision::Flash {
            target: target.clone(),
            from: current,
        });
    }

    let target = catalog
        .latest()
        .ok_or_else(|| Error::Catalog("build catalog is empty".into()))?;
    let target_version = target.firmware_version()?;

    match current {
        Some(current) if !request.force && target_version <= current => {
            Ok(Decision::Skip { current })
        }
        _ => Ok(Decision::Flash {
            target: target.clone(),
            from: current,
        }),
    }
}

/// Result of an update that did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    AlreadyCurrent {
        current: FirmwareVersion,
    },
    Updated {
        from: Option<FirmwareVersion>,
        to: FirmwareVersion,
    },
}

/// Runs updates against one build source.
pub struct UpdateResolver<'a> {
    source: &'a dyn BuildSource,
}

impl<'a> UpdateResolver<'a> {
    pub fn new(source: &'a dyn BuildSource) -> Self {
        Self { source }
    }

    /// The version `device` runs, looked up by the build SHA it reports.
    pub async fn current_version(
        &self,
        device: &mut Device,
        catalog: &BuildCatalog,
    ) -> Result<FirmwareVersion> {
        let name = device.name().to_string();
        let unknown = || Error::VersionUnknown {
            device: name.clone(),
        };

        let Some(sha) = device.current_build_sha().await? else {
            warn!(device = %name, "Could not find firmware version");
            return Err(unknown());
        };
        let Some(build) = catalog.find_by_sha(&sha) else {
            warn!(device = %name, sha = %sha, "Running build is not in the catalog");
            return Err(unknown());
        };
        build.firmware_version()
    }

    pub async fn update(
        &self,
        device: &mut Device,
        request: &UpdateRequest,
    ) -> Result<UpdateOutcome> {
        if !device.has_usb() {
            return Err(Error::UsbRequired);
        }

        let catalog = self.source.fetch_catalog().await?;
        debug!(builds = catalog.builds().len(), "Fetched build catalog");

        let current = if request.force {
            None
        } else {
            Some(self.current_version(device, &catalog).await?)
        };

        match plan(&catalog, current, request)? {
            Decision::Skip { current } => {
                warn!(
                    device = %device.name(),
                    version = %current,
                    "Already on the latest firmware version; force an update to reflash"
                );
                Ok(UpdateOutcome::AlreadyCurrent { current })
            }
            Decision::Flash { target, from } => {
                let to = target.firmware_version()?;
                info!(
                    device = %device.name(),
                    from = %from.map(|v| v.to_string()).unwrap_or_else(|| "unknown".into()),
                    to = %to,
                    force = request.force,
                    "Updating firmware"
                );

                let images = self.source.fetch_artifact(&target).await?;
                flash::upgrade(device.flash_link()?, &images, !request.force).await?;

                info!(device = %device.name(), version = %to, "Firmware updated");
                Ok(UpdateOutcome::Updated { from, to })
            }
        }
    }
}
