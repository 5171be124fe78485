//! Command orchestration.
//!
//! Every board command follows the same shape: discover, settle on exactly
//! one device, run the command against it while watching for an interrupt,
//! and close every connection that was opened along the way.
//!
//! [`Orchestrator::get`] covers the first half. Discovery is cut short as
//! soon as the outcome is certain (the named board, or a USB board when no
//! name was given and LAN is not preferred). Otherwise the session runs to
//! its timeout and the candidates go through reconciliation and the
//! selection heuristic, falling back to a [`Disambiguator`] when the
//! heuristic cannot decide. All devices that were not chosen are closed
//! before `get` returns.
//!
//! [`Orchestrator::with_selected_device`] adds the second half: the command
//! races the cancellation token, the loser is dropped, and the chosen device
//! is closed exactly once whichever way the race went.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::{
    config::Config,
    device::{validate_name, Device, DeviceSummary},
    discovery::{Authorization, DiscoveryEvent, DiscoveryFilter, DiscoverySession},
    error::{Error, Result},
    flash::{self, program::new_uid, MacPair},
    select::{self, Reconciled, Selection},
    tracing::prelude::*,
    transport::{Link, SightingSource},
    update::{
        BuildCatalog, BuildDescriptor, BuildSource, UpdateOutcome, UpdateRequest, UpdateResolver,
    },
};

/// USB interface setting that exposes the flash bridge.
const RESTORE_ALT_SETTING: u8 = 1;

/// What an interrupt does to a search in progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OnInterrupt {
    /// Close everything found and fail with [`Error::Cancelled`]
    Cancel,
    /// Stop searching and keep what was found
    EndSearch,
}

/// Versions reported by [`Orchestrator::env_versions`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvVersions {
    /// This library
    pub tool: String,
    /// Firmware build the board runs
    pub firmware: String,
    /// Script runtime on the board
    pub runtime: String,
}

/// Asks the user to pick a device when the heuristic cannot.
#[async_trait]
pub trait Disambiguator: Send + Sync {
    /// Index of the chosen candidate, or `None` when the user declined.
    async fn choose(&self, candidates: &[DeviceSummary]) -> Option<usize>;
}

/// Runs board commands against discovered devices.
pub struct Orchestrator {
    sources: Vec<Arc<dyn SightingSource>>,
    config: Config,
    builds: Arc<dyn BuildSource>,
    disambiguator: Option<Arc<dyn Disambiguator>>,
}

impl Orchestrator {
    pub fn new(
        sources: Vec<Arc<dyn SightingSource>>,
        config: Config,
        builds: Arc<dyn BuildSource>,
    ) -> Self {
        Self {
            sources,
            config,
            builds,
            disambiguator: None,
        }
    }

    pub fn with_disambiguator(mut self, disambiguator: Arc<dyn Disambiguator>) -> Self {
        self.disambiguator = Some(disambiguator);
        self
    }

    /// Discovery filter with the configured defaults.
    pub fn filter(&self) -> DiscoveryFilter {
        self.config.discovery_filter()
    }

    /// Find every board within the filter's timeout.
    ///
    /// An interrupt ends the search early and reports what was found so far.
    /// All connections are closed before returning; the summaries are what
    /// remains.
    pub async fn list(
        &self,
        filter: DiscoveryFilter,
        cancel: &CancellationToken,
    ) -> Result<Vec<DeviceSummary>> {
        let not_found = not_found_message(&filter);
        let opts = self.config.select_options(filter.name.as_deref());
        let (found, _) = self
            .discover(filter, cancel, OnInterrupt::EndSearch, |_, _| false)
            .await?;

        if found.is_empty() {
            return Err(Error::NotFound(not_found));
        }

        let Reconciled {
            mut devices,
            mut duplicates,
        } = select::reconcile(found);
        close_links(&mut duplicates).await;
        let summaries: Vec<DeviceSummary> = devices.iter().map(Device::summary).collect();
        for summary in &summaries {
            info!(device = %summary.name, summary = %summary, "Found device");
        }

        if devices.len() > 1 {
            match select::select_one(&devices, &opts) {
                Selection::Chosen(i) => {
                    info!(device = %devices[i].name(), "Will default to this device")
                }
                _ => info!("Multiple devices found, name one to choose between them"),
            }
        }

        close_all(&mut devices).await;
        Ok(summaries)
    }

    /// Discover and settle on exactly one device.
    ///
    /// Every other device surfaced by discovery is closed before this
    /// returns. The caller owns the returned device and must close it.
    pub async fn get(&self, filter: DiscoveryFilter, cancel: &CancellationToken) -> Result<Device> {
        let opts = self.config.select_options(filter.name.as_deref());
        let name = filter.name.clone();
        let lan_prefer = filter.lan_prefer;
        let not_found = not_found_message(&filter);

        let (mut found, early) = self
            .discover(filter, cancel, OnInterrupt::Cancel, |device, found_early| {
                if found_early {
                    return false;
                }
                match &name {
                    Some(name) => device.name() == name,
                    None => !lan_prefer && device.has_usb(),
                }
            })
            .await?;

        if let Some(i) = early {
            let device = found.swap_remove(i);
            close_all(&mut found).await;
            info!(device = %device.name(), "Connected to device");
            return Ok(device);
        }

        // The session only surfaces the named board, and finding it would
        // have ended the search above.
        if let Some(name) = name {
            close_all(&mut found).await;
            return Err(Error::NotFound(format!("No device found by the name {}", name)));
        }
        if found.is_empty() {
            return Err(Error::NotFound(not_found));
        }

        let Reconciled {
            mut devices,
            mut duplicates,
        } = select::reconcile(found);
        close_links(&mut duplicates).await;

        let chosen = match select::select_one(&devices, &opts) {
            Selection::Chosen(i) => i,
            Selection::Ambiguous => match self.disambiguate(&devices).await {
                Ok(i) => i,
                Err(e) => {
                    close_all(&mut devices).await;
                    return Err(e);
                }
            },
            Selection::Empty => return Err(Error::NotFound(not_found)),
        };

        let device = devices.swap_remove(chosen);
        close_all(&mut devices).await;
        info!(device = %device.name(), "Connected to device");
        Ok(device)
    }

    /// Run `op` against one selected device, racing `cancel`.
    ///
    /// The device's connections are closed exactly once after the race,
    /// whether `op` succeeded, failed or was cancelled. A failure to close is
    /// logged and does not replace the result of `op`.
    pub async fn with_selected_device<T, F>(
        &self,
        filter: DiscoveryFilter,
        cancel: &CancellationToken,
        op: F,
    ) -> Result<T>
    where
        F: for<'d> FnOnce(&'d mut Device) -> BoxFuture<'d, Result<T>>,
    {
        let mut device = self.get(filter, cancel).await?;

        let result = tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                info!(device = %device.name(), "Command interrupted");
                Err(Error::Cancelled)
            }
            result = op(&mut device) => result,
        };

        if let Err(e) = device.close().await {
            warn!(device = %device.name(), error = %e, "Failed to close device after command");
        }
        result
    }

    pub async fn reboot(
        &self,
        mut filter: DiscoveryFilter,
        cancel: &CancellationToken,
    ) -> Result<()> {
        filter.authorized = Authorization::Required;
        self.with_selected_device(filter, cancel, |device| {
            Box::pin(async move {
                device.reboot().await?;
                info!(device = %device.name(), "Rebooting");
                Ok(())
            })
        })
        .await
    }

    /// Give the selected board a new name. The name is checked before any
    /// board is looked for.
    pub async fn rename(
        &self,
        mut filter: DiscoveryFilter,
        new_name: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        validate_name(new_name)?;
        filter.authorized = Authorization::Required;

        let new_name = new_name.to_string();
        self.with_selected_device(filter, cancel, move |device| {
            Box::pin(async move {
                info!(from = %device.name(), to = %new_name, "Renaming device");
                device.rename(&new_name).await
            })
        })
        .await
    }

    /// Give the selected board back its factory name.
    pub async fn reset_name(
        &self,
        mut filter: DiscoveryFilter,
        cancel: &CancellationToken,
    ) -> Result<()> {
        filter.authorized = Authorization::Required;
        self.with_selected_device(filter, cancel, |device| {
            Box::pin(async move {
                info!(device = %device.name(), "Resetting device name");
                device.reset_name().await
            })
        })
        .await
    }

    /// Install this host's key on a board connected over USB, authorizing
    /// it for LAN commands.
    ///
    /// Only boards this host is not yet authorized for are looked for.
    /// Removing existing host keys when `force` is set is left to the
    /// board's connection.
    pub async fn provision(
        &self,
        mut filter: DiscoveryFilter,
        force: bool,
        cancel: &CancellationToken,
    ) -> Result<()> {
        filter.usb = true;
        filter.authorized = Authorization::Forbidden;

        self.with_selected_device(filter, cancel, move |device| {
            Box::pin(async move { device.provision(force).await })
        })
        .await
    }

    /// The catalog entry of the build the selected board runs.
    pub async fn firmware_version(
        &self,
        mut filter: DiscoveryFilter,
        cancel: &CancellationToken,
    ) -> Result<BuildDescriptor> {
        filter.authorized = Authorization::Required;

        let builds = Arc::clone(&self.builds);
        self.with_selected_device(filter, cancel, move |device| {
            Box::pin(async move {
                let catalog = builds.fetch_catalog().await?;
                let sha = device.current_build_sha().await?;
                let build = running_build(&catalog, device.name(), sha)?;
                info!(device = %device.name(), version = %build.version, "Firmware version");
                Ok(build)
            })
        })
        .await
    }

    /// Versions of this library, the board's firmware and its script
    /// runtime.
    pub async fn env_versions(
        &self,
        mut filter: DiscoveryFilter,
        cancel: &CancellationToken,
    ) -> Result<EnvVersions> {
        filter.authorized = Authorization::Required;

        let builds = Arc::clone(&self.builds);
        self.with_selected_device(filter, cancel, move |device| {
            Box::pin(async move {
                let name = device.name().to_string();
                let (catalog, (sha, runtime)) = tokio::try_join!(builds.fetch_catalog(), async {
                    let sha = device.current_build_sha().await?;
                    let runtime = device.runtime_version().await?;
                    Ok::<_, Error>((sha, runtime))
                })?;

                let versions = EnvVersions {
                    tool: env!("CARGO_PKG_VERSION").to_string(),
                    firmware: running_build(&catalog, &name, sha)?.version,
                    runtime,
                };
                info!(
                    device = %name,
                    tool = %versions.tool,
                    firmware = %versions.firmware,
                    runtime = %versions.runtime,
                    "Environment versions"
                );
                Ok(versions)
            })
        })
        .await
    }

    pub async fn update(
        &self,
        mut filter: DiscoveryFilter,
        request: UpdateRequest,
        cancel: &CancellationToken,
    ) -> Result<UpdateOutcome> {
        filter.authorized = Authorization::Required;

        let builds = Arc::clone(&self.builds);
        self.with_selected_device(filter, cancel, move |device| {
            Box::pin(async move {
                UpdateResolver::new(builds.as_ref())
                    .update(device, &request)
                    .await
            })
        })
        .await
    }

    /// Reflash a board whose firmware no longer boots.
    ///
    /// Only USB is searched, with the flash bridge interface selected. The
    /// flash chip ID is checked unless `force` is set.
    pub async fn restore(
        &self,
        mut filter: DiscoveryFilter,
        force: bool,
        cancel: &CancellationToken,
    ) -> Result<()> {
        filter.usb = true;
        filter.lan = false;
        filter.usb_alt_setting = Some(RESTORE_ALT_SETTING);
        filter.authorized = Authorization::Any;

        let builds = Arc::clone(&self.builds);
        self.with_selected_device(filter, cancel, move |device| {
            Box::pin(async move {
                info!(device = %device.name(), "Restoring firmware");
                let images = builds.fetch_restore_images().await?;
                let macs = MacPair::from_uid(new_uid(device.name()));
                flash::restore(device.flash_link()?, &images, macs, !force).await?;
                info!(device = %device.name(), "Restore complete");
                Ok(())
            })
        })
        .await
    }

    /// The `n` newest published builds, newest first.
    pub async fn available_builds(&self, n: usize) -> Result<Vec<BuildDescriptor>> {
        let catalog = self.builds.fetch_catalog().await?;
        let recent: Vec<BuildDescriptor> = catalog.recent(n).cloned().collect();
        for build in &recent {
            info!(version = %build.version, released = %build.released, "Available build");
        }
        Ok(recent)
    }

    /// Run one discovery session, collecting every surfaced device.
    ///
    /// `ends_search` sees each device as it arrives, together with whether
    /// an earlier one already ended the search; returning true stops the
    /// session and marks that device. Devices still in flight when the
    /// session stops are collected too, so the caller can close them.
    async fn discover<P>(
        &self,
        filter: DiscoveryFilter,
        cancel: &CancellationToken,
        on_interrupt: OnInterrupt,
        mut ends_search: P,
    ) -> Result<(Vec<Device>, Option<usize>)>
    where
        P: FnMut(&Device, bool) -> bool,
    {
        let mut session = DiscoverySession::new(self.sources.clone());
        let mut events = session.start(filter)?;

        let mut found: Vec<Device> = Vec::new();
        let mut early: Option<usize> = None;
        let mut interrupted = false;

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled(), if !interrupted => {
                    interrupted = true;
                    session.stop();
                }
                event = events.recv() => match event {
                    Some(DiscoveryEvent::Found(device)) => {
                        if ends_search(&device, early.is_some()) {
                            debug!(device = %device.name(), "Ending search early");
                            early = Some(found.len());
                            session.stop();
                        }
                        found.push(device);
                    }
                    Some(DiscoveryEvent::End(reason)) => {
                        debug!(reason = %reason, found = found.len(), "Search finished");
                        break;
                    }
                    None => break,
                },
            }
        }
        session.finished().await;

        if interrupted && on_interrupt == OnInterrupt::Cancel {
            close_all(&mut found).await;
            return Err(Error::Cancelled);
        }
        Ok((found, early))
    }

    async fn disambiguate(&self, devices: &[Device]) -> Result<usize> {
        let Some(disambiguator) = &self.disambiguator else {
            info!("Please specify a device by name");
            return Err(Error::Ambiguous);
        };

        let summaries: Vec<DeviceSummary> = devices.iter().map(Device::summary).collect();
        match disambiguator.choose(&summaries).await {
            Some(i) if i < devices.len() => Ok(i),
            Some(i) => {
                warn!(index = i, candidates = devices.len(), "Chooser returned no such device");
                Err(Error::Aborted)
            }
            None => Err(Error::Aborted),
        }
    }
}

/// The catalog entry of the build a board reports it runs.
fn running_build(
    catalog: &BuildCatalog,
    device: &str,
    sha: Option<String>,
) -> Result<BuildDescriptor> {
    sha.and_then(|sha| catalog.find_by_sha(&sha).cloned())
        .ok_or_else(|| Error::VersionUnknown {
            device: device.to_string(),
        })
}

fn not_found_message(filter: &DiscoveryFilter) -> String {
    match filter.authorized {
        Authorization::Required => "No Authorized Devices Found.".to_string(),
        _ => "No Devices Found.".to_string(),
    }
}

/// Close links that belong to no device, logging failures.
async fn close_links(links: &mut [Link]) {
    for link in links.iter_mut() {
        if let Err(e) = link.close().await {
            warn!(transport = %link.kind(), error = %e, "Failed to close duplicate link");
        }
    }
}

/// Close every device, logging failures.
async fn close_all(devices: &mut [Device]) {
    for device in devices.iter_mut() {
        if let Err(e) = device.close().await {
            warn!(device = %device.name(), error = %e, "Failed to close device");
        }
    }
}
