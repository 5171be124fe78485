//! Reconciliation and the device selection heuristic.
//!
//! When discovery surfaces more than one device, same-named devices seen on
//! different transports are first merged, then one device is picked by a
//! fixed priority policy:
//!
//! 1. the name passed explicitly with the command
//! 2. the preferred name from the environment
//! 3. a device connected over USB
//! 4. a device reachable only over LAN
//!
//! A name match always wins. Otherwise a single USB device wins over any
//! number of LAN devices, and the choice is ambiguous when several devices
//! share the best connection class.

use std::collections::HashMap;

use strum::Display;

use crate::{device::Device, tracing::prelude::*, transport::Link};

/// How strongly a device is indicated as the one the user means. Lower is
/// stronger.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    NameOption,
    EnvPreference,
    Usb,
    Lan,
}

impl Priority {
    fn is_name_match(self) -> bool {
        matches!(self, Priority::NameOption | Priority::EnvPreference)
    }
}

/// Names the user indicated, sourced once at the boundary.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SelectOptions {
    /// Name given with the command
    pub name: Option<String>,
    /// Preferred device from the environment
    pub preferred_name: Option<String>,
}

/// Outcome of [`select_one`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selection {
    /// Index into the candidate slice
    Chosen(usize),
    /// The policy cannot decide; the caller may ask the user
    Ambiguous,
    /// There were no candidates
    Empty,
}

pub fn priority(device: &Device, opts: &SelectOptions) -> Priority {
    if opts.name.as_deref() == Some(device.name()) {
        Priority::NameOption
    } else if opts.preferred_name.as_deref() == Some(device.name()) {
        Priority::EnvPreference
    } else if device.has_usb() {
        Priority::Usb
    } else {
        Priority::Lan
    }
}

/// Outcome of [`reconcile`].
#[derive(Debug, Default)]
pub struct Reconciled {
    pub devices: Vec<Device>,
    /// Second links over a transport their device already had. Nothing uses
    /// them; the caller closes them.
    pub duplicates: Vec<Link>,
}

/// Merge devices that share a name into one device holding all of their
/// links. Devices keep the position their name was first seen at.
pub fn reconcile(devices: Vec<Device>) -> Reconciled {
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut merged = Reconciled {
        devices: Vec::with_capacity(devices.len()),
        duplicates: Vec::new(),
    };

    for device in devices {
        match index.get(device.name()) {
            Some(&i) => {
                trace!(device = %device.name(), "Merging connections of the same device");
                let duplicates = merged.devices[i].absorb(device);
                merged.duplicates.extend(duplicates);
            }
            None => {
                index.insert(device.name().to_string(), merged.devices.len());
                merged.devices.push(device);
            }
        }
    }

    merged
}

/// Pick one of `devices` by the priority policy.
pub fn select_one(devices: &[Device], opts: &SelectOptions) -> Selection {
    let ranked: Vec<(usize, Priority)> = devices
        .iter()
        .enumerate()
        .map(|(i, d)| (i, priority(d, opts)))
        .collect();

    // min_by_key keeps the first of equal elements
    let Some(&(best, best_priority)) = ranked.iter().min_by_key(|(_, p)| *p) else {
        return Selection::Empty;
    };

    if best_priority.is_name_match() {
        debug!(device = %devices[best].name(), priority = %best_priority, "Device named");
        return Selection::Chosen(best);
    }

    let usb = ranked.iter().filter(|(_, p)| *p == Priority::Usb).count();
    let lan = ranked.iter().filter(|(_, p)| *p == Priority::Lan).count();

    if usb > 1 || (usb == 0 && lan > 1) {
        debug!(usb, lan, "Cannot choose between devices");
        return Selection::Ambiguous;
    }

    debug!(device = %devices[best].name(), priority = %best_priority, "Device chosen");
    Selection::Chosen(best)
}
