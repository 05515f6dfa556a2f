use std::collections::{HashMap, HashSet};

use anyhow::Context;

use crate::{
    device_description::{DeviceDescription, Udn},
    schedule::MSearchReplyCp,
    ssdp::USN,
    FromXml,
};

/// How the device-type filter compares against the declared type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchMode {
    Substring,
    Exact,
}

/// Filter applied to discovered devices. An empty filter matches all.
#[derive(Debug, Clone)]
pub struct DeviceFilter {
    pub device_type: Option<String>,
    pub mode: MatchMode,
}

impl DeviceFilter {
    pub fn any() -> Self {
        Self {
            device_type: None,
            mode: MatchMode::Substring,
        }
    }

    pub fn device_type(device_type: impl Into<String>) -> Self {
        Self {
            device_type: Some(device_type.into()),
            mode: MatchMode::Substring,
        }
    }

    pub fn exact(mut self) -> Self {
        self.mode = MatchMode::Exact;
        self
    }

    pub fn matches(&self, device_type: &str) -> bool {
        match &self.device_type {
            None => true,
            Some(filter) => match self.mode {
                MatchMode::Substring => device_type.contains(filter.as_str()),
                MatchMode::Exact => device_type == filter,
            },
        }
    }
}

/// Service entry of a discovered device, with urls still relative to its
/// base.
#[derive(Debug, Clone)]
pub struct DiscoveredService {
    pub service_type: String,
    pub service_id: String,
    pub scpd_url: String,
    pub control_url: String,
    pub event_sub_url: String,
}

/// One remote device, keyed by UDN. A device announcing under many NT
/// variants still has exactly one entry.
#[derive(Debug, Clone)]
pub struct DiscoveredDevice {
    pub udn: Udn,
    pub device_type: String,
    pub friendly_name: String,
    pub location: reqwest::Url,
    pub base_url: reqwest::Url,
    pub services: Vec<DiscoveredService>,
    pub last_seen_ms: u64,
    removed: bool,
}

impl DiscoveredDevice {
    pub fn is_removed(&self) -> bool {
        self.removed
    }

    /// Find a service whose id contains `id`.
    pub fn service_by_id(&self, id: &str) -> Option<&DiscoveredService> {
        self.services.iter().find(|s| s.service_id.contains(id))
    }

    pub fn control_url(&self, service: &DiscoveredService) -> anyhow::Result<reqwest::Url> {
        self.base_url
            .join(&service.control_url)
            .context("resolve control url")
    }

    pub fn event_url(&self, service: &DiscoveredService) -> anyhow::Result<reqwest::Url> {
        self.base_url
            .join(&service.event_sub_url)
            .context("resolve event url")
    }
}

/// Collects SSDP observations into a UDN-keyed device table, fetching and
/// parsing descriptors as new locations appear.
pub struct DiscoveryEngine {
    client: reqwest::Client,
    filter: DeviceFilter,
    devices: HashMap<Udn, DiscoveredDevice>,
    seen_locations: HashSet<String>,
}

impl DiscoveryEngine {
    pub fn new(client: reqwest::Client, filter: DeviceFilter) -> Self {
        Self {
            client,
            filter,
            devices: HashMap::new(),
            seen_locations: HashSet::new(),
        }
    }

    pub fn filter(&self) -> &DeviceFilter {
        &self.filter
    }

    /// Live devices, announcement order not preserved.
    pub fn devices(&self) -> Vec<&DiscoveredDevice> {
        self.devices.values().filter(|d| !d.removed).collect()
    }

    pub fn get(&self, udn: &Udn) -> Option<&DiscoveredDevice> {
        self.devices.get(udn).filter(|d| !d.removed)
    }

    /// Number of live devices passing the filter.
    pub fn matching_count(&self) -> usize {
        self.devices
            .values()
            .filter(|d| !d.removed && self.filter.matches(&d.device_type))
            .count()
    }

    pub async fn observe_search_reply(&mut self, reply: &MSearchReplyCp, now_ms: u64) {
        self.observe_location(&reply.location, &reply.usn, now_ms)
            .await;
    }

    pub async fn observe_alive(&mut self, location: &str, usn: &USN, now_ms: u64) {
        self.observe_location(location, usn, now_ms).await;
    }

    /// A byebye marks the device removed; the caller cancels its
    /// subscriptions with the returned UDN.
    pub fn observe_byebye(&mut self, usn: &USN) -> Option<Udn> {
        let device = self.devices.get_mut(&usn.udn)?;
        if device.removed {
            return None;
        }
        tracing::info!(udn = %usn.udn, "Device said byebye");
        device.removed = true;
        self.seen_locations.remove(device.location.as_str());
        Some(usn.udn.clone())
    }

    async fn observe_location(&mut self, location: &str, usn: &USN, now_ms: u64) {
        let returning = self
            .devices
            .get(&usn.udn)
            .is_some_and(|device| device.removed);
        if self.seen_locations.contains(location) && !returning {
            if let Some(device) = self.devices.get_mut(&usn.udn) {
                device.last_seen_ms = now_ms;
            }
            return;
        }
        match self.fetch_device(location, now_ms).await {
            Ok(device) => {
                self.seen_locations.insert(location.to_string());
                tracing::info!(
                    udn = %device.udn,
                    device_type = %device.device_type,
                    name = %device.friendly_name,
                    "Discovered device"
                );
                // the descriptor's own UDN is the canonical key
                self.devices.insert(device.udn.clone(), device);
            }
            Err(e) => {
                tracing::warn!(location, "Cannot read device description: {e:#}");
            }
        }
    }

    async fn fetch_device(
        &self,
        location: &str,
        now_ms: u64,
    ) -> anyhow::Result<DiscoveredDevice> {
        let location: reqwest::Url = location.parse().context("parse location url")?;
        let body = self
            .client
            .get(location.clone())
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        let mut reader = quick_xml::Reader::from_str(&body);
        let description = DeviceDescription::read_xml(&mut reader)?;
        let base_url = if description.url_base.is_empty() {
            let mut base = location.clone();
            base.set_path("/");
            base
        } else {
            description
                .url_base
                .parse()
                .context("parse descriptor URLBase")?
        };
        let device = description.device;
        Ok(DiscoveredDevice {
            udn: device.udn.clone(),
            device_type: device.device_type.to_string(),
            friendly_name: device.friendly_name.to_string(),
            services: device
                .all_services()
                .map(|s| DiscoveredService {
                    service_type: s.service_type.to_string(),
                    service_id: s.service_id.to_string(),
                    scpd_url: s.scpd_url.to_string(),
                    control_url: s.control_url.to_string(),
                    event_sub_url: s.event_sub_url.to_string(),
                })
                .collect(),
            location,
            base_url,
            last_seen_ms: now_ms,
            removed: false,
        })
    }
}
