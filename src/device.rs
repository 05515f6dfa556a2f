use std::{
    borrow::Cow,
    net::{IpAddr, Ipv4Addr},
    sync::Arc,
};

use crate::{
    action::{Argument, SoapFault},
    config::DlnaConfig,
    device_description::{self, DeviceDescription, SpecVersion, Udn},
    ssdp::{NotificationType, UpnpAgent, USN},
    urn::{UrnType, URN},
    DlnaError,
};

/// Application hook invoked for SOAP control POSTs addressed to a service.
pub trait ControlHandler: Send + Sync + 'static {
    fn handle_action(
        &self,
        action: &str,
        arguments: Vec<Argument>,
    ) -> Result<Vec<Argument>, SoapFault>;
}

impl<F> ControlHandler for F
where
    F: Fn(&str, Vec<Argument>) -> Result<Vec<Argument>, SoapFault> + Send + Sync + 'static,
{
    fn handle_action(
        &self,
        action: &str,
        arguments: Vec<Argument>,
    ) -> Result<Vec<Argument>, SoapFault> {
        self(action, arguments)
    }
}

/// Icon published by the device and served over HTTP.
#[derive(Debug, Clone)]
pub struct DeviceIcon {
    pub mimetype: String,
    pub width: usize,
    pub height: usize,
    pub depth: usize,
    pub path: String,
    pub bytes: Vec<u8>,
    pub is_default: bool,
}

impl DeviceIcon {
    fn descriptor_entry(&self) -> device_description::Icon<'_> {
        device_description::Icon {
            mimetype: Cow::Borrowed(&self.mimetype),
            width: self.width,
            height: self.height,
            depth: self.depth,
            url: Cow::Borrowed(&self.path),
        }
    }
}

/// One service exposed by a device: its type, identity, the three relative
/// urls and the handlers behind them.
#[derive(Clone)]
pub struct ServiceInfo {
    pub service_type: URN,
    pub service_id: String,
    pub scpd_url: String,
    pub control_url: String,
    pub event_sub_url: String,
    pub instance_id: u32,
    /// Body served on SCPD GETs.
    pub scpd_xml: String,
    pub control_handler: Arc<dyn ControlHandler>,
}

impl std::fmt::Debug for ServiceInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceInfo")
            .field("service_type", &self.service_type)
            .field("service_id", &self.service_id)
            .field("scpd_url", &self.scpd_url)
            .field("control_url", &self.control_url)
            .field("event_sub_url", &self.event_sub_url)
            .field("instance_id", &self.instance_id)
            .finish()
    }
}

impl ServiceInfo {
    /// Service with the conventional `/<Name>/{scpd,control,event}.xml`
    /// url layout.
    pub fn new(service_type: URN, handler: impl ControlHandler) -> Self {
        let name = match &service_type.urn_type {
            UrnType::Service(service) => service.to_string(),
            UrnType::Device(device) => device.to_string(),
        };
        Self {
            service_id: format!("urn:upnp-org:serviceId:{name}"),
            scpd_url: format!("/{name}/scpd.xml"),
            control_url: format!("/{name}/control.xml"),
            event_sub_url: format!("/{name}/event.xml"),
            instance_id: 0,
            scpd_xml: String::new(),
            control_handler: Arc::new(handler),
            service_type,
        }
    }

    pub fn with_scpd_xml(mut self, scpd_xml: impl Into<String>) -> Self {
        self.scpd_xml = scpd_xml.into();
        self
    }

    pub fn with_instance_id(mut self, instance_id: u32) -> Self {
        self.instance_id = instance_id;
        self
    }

    fn descriptor_entry<'a>(&'a self, base_path: &str) -> device_description::Service<'a> {
        device_description::Service {
            service_type: Cow::Owned(self.service_type.to_string()),
            service_id: Cow::Borrowed(&self.service_id),
            scpd_url: Cow::Owned(join_paths(base_path, &self.scpd_url)),
            control_url: Cow::Owned(join_paths(base_path, &self.control_url)),
            event_sub_url: Cow::Owned(join_paths(base_path, &self.event_sub_url)),
        }
    }
}

/// Device metadata assembled by the application before start. Immutable
/// once the facade consumes it; services can only be added here.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub udn: Udn,
    pub device_type: URN,
    pub friendly_name: String,
    pub manufacturer: String,
    pub manufacturer_url: Option<String>,
    pub model_description: Option<String>,
    pub model_name: String,
    pub model_number: Option<String>,
    pub model_url: Option<String>,
    pub serial_number: Option<String>,
    pub upc: Option<String>,
    pub base_url: String,
    pub icons: Vec<DeviceIcon>,
    pub services: Vec<ServiceInfo>,
}

impl DeviceInfo {
    pub fn new(udn: Udn, device_type: URN, friendly_name: impl Into<String>) -> Self {
        let friendly_name = friendly_name.into();
        Self {
            udn,
            device_type,
            model_name: friendly_name.clone(),
            friendly_name,
            manufacturer: env!("CARGO_PKG_NAME").to_string(),
            manufacturer_url: None,
            model_description: None,
            model_number: None,
            model_url: None,
            serial_number: None,
            upc: None,
            base_url: "http://localhost:9876/dlna".to_string(),
            icons: Vec::new(),
            services: Vec::new(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_manufacturer(mut self, manufacturer: impl Into<String>) -> Self {
        self.manufacturer = manufacturer.into();
        self
    }

    pub fn with_model_name(mut self, model_name: impl Into<String>) -> Self {
        self.model_name = model_name.into();
        self
    }

    pub fn add_service(&mut self, service: ServiceInfo) {
        self.services.push(service);
    }

    pub fn add_icon(&mut self, icon: DeviceIcon) {
        self.icons.push(icon);
    }
}

/// Join a url prefix and a relative part, collapsing duplicate slashes.
pub(crate) fn join_paths(prefix: &str, rel: &str) -> String {
    let mut joined = format!("{prefix}/{rel}");
    while joined.contains("//") {
        joined = joined.replace("//", "/");
    }
    joined
}

/// The started, shared form of a device: resolved base url plus the
/// immutable metadata. Schedules and HTTP handlers hold it through `Arc`.
#[derive(Debug)]
pub struct DeviceModel {
    info: DeviceInfo,
    base_url: reqwest::Url,
    server: String,
    max_url_len: usize,
}

impl DeviceModel {
    pub fn new(
        info: DeviceInfo,
        observed_ip: Option<IpAddr>,
        config: &DlnaConfig,
    ) -> Result<Arc<Self>, DlnaError> {
        if info.services.is_empty() {
            return Err(DlnaError::Config("device defines no services".to_string()));
        }
        let mut base_url = reqwest::Url::parse(&info.base_url)
            .map_err(|e| DlnaError::Config(format!("invalid base url {}: {e}", info.base_url)))?;
        if base_url.host_str() == Some("localhost") {
            let Some(ip) = observed_ip else {
                return Err(DlnaError::Config(format!(
                    "base url {} resolves to localhost and no local address is known",
                    info.base_url
                )));
            };
            base_url
                .set_ip_host(ip)
                .map_err(|()| DlnaError::Config("cannot rewrite base url host".to_string()))?;
        }
        Ok(Arc::new(Self {
            info,
            base_url,
            server: UpnpAgent::default().to_string(),
            max_url_len: config.max_url_len,
        }))
    }

    pub fn udn(&self) -> &Udn {
        &self.info.udn
    }

    pub fn device_type(&self) -> &URN {
        &self.info.device_type
    }

    pub fn friendly_name(&self) -> &str {
        &self.info.friendly_name
    }

    pub fn services(&self) -> &[ServiceInfo] {
        &self.info.services
    }

    pub fn icons(&self) -> &[DeviceIcon] {
        &self.info.icons
    }

    /// SERVER/USER-AGENT string attached to outgoing announcements.
    pub fn server(&self) -> &str {
        &self.server
    }

    pub fn base_url(&self) -> &reqwest::Url {
        &self.base_url
    }

    pub fn base_path(&self) -> &str {
        self.base_url.path()
    }

    pub fn local_ip(&self) -> Option<Ipv4Addr> {
        match self.base_url.host_str()?.parse() {
            Ok(ip) => Some(ip),
            Err(_) => None,
        }
    }

    /// Absolute LOCATION url advertised over SSDP.
    pub fn location(&self) -> String {
        let mut url = self.base_url.clone();
        url.set_path(&self.device_path());
        url.to_string()
    }

    /// Path the descriptor is served under.
    pub fn device_path(&self) -> String {
        join_paths(self.base_url.path(), "device.xml")
    }

    /// Compose the absolute path for one of a service's relative urls.
    pub fn service_path(&self, rel: &str) -> Result<String, DlnaError> {
        let path = join_paths(self.base_url.path(), rel);
        if path.len() > self.max_url_len {
            return Err(DlnaError::Config(format!(
                "composed url {path} exceeds {} bytes",
                self.max_url_len
            )));
        }
        Ok(path)
    }

    /// Find a service whose id contains `id`, so short names like
    /// `AVTransport` match the full `urn:upnp-org:serviceId` form.
    pub fn service_by_id(&self, id: &str) -> Option<&ServiceInfo> {
        self.info.services.iter().find(|s| s.service_id.contains(id))
    }

    /// Does an M-SEARCH for `target` concern this device?
    pub fn serves_target(&self, target: &NotificationType) -> bool {
        match target {
            NotificationType::All | NotificationType::RootDevice => true,
            NotificationType::Uuid(udn) => *udn == self.info.udn,
            NotificationType::Urn(urn) => {
                *urn == self.info.device_type
                    || self.info.services.iter().any(|s| s.service_type == *urn)
            }
        }
    }

    /// Full announcement set: device uuid, root device, device type, then
    /// every service type.
    pub fn notification_targets(&self) -> Vec<(NotificationType, USN)> {
        let udn = self.info.udn.clone();
        let mut targets = vec![
            (
                NotificationType::Uuid(udn.clone()),
                USN::bare(udn.clone()),
            ),
            (NotificationType::RootDevice, USN::root(udn.clone())),
            (
                NotificationType::Urn(self.info.device_type.clone()),
                USN::target(udn.clone(), self.info.device_type.clone()),
            ),
        ];
        for service in &self.info.services {
            targets.push((
                NotificationType::Urn(service.service_type.clone()),
                USN::target(udn.clone(), service.service_type.clone()),
            ));
        }
        targets
    }

    /// Announcement subset answering a concrete search target.
    pub fn targets_for(&self, st: &NotificationType) -> Vec<(NotificationType, USN)> {
        match st {
            NotificationType::All => self.notification_targets(),
            _ => self
                .notification_targets()
                .into_iter()
                .filter(|(nt, _)| nt == st)
                .collect(),
        }
    }

    /// The UPnP 1.0 descriptor, rendered fresh on every call.
    pub fn description(&self) -> DeviceDescription<'_> {
        let info = &self.info;
        DeviceDescription {
            spec_version: SpecVersion::upnp_v1(),
            url_base: Cow::Owned(self.base_url.to_string()),
            device: device_description::Device {
                device_type: Cow::Owned(info.device_type.to_string()),
                friendly_name: Cow::Borrowed(&info.friendly_name),
                manufacturer: Cow::Borrowed(&info.manufacturer),
                manufacturer_url: info.manufacturer_url.as_deref().map(Cow::Borrowed),
                model_description: info.model_description.as_deref().map(Cow::Borrowed),
                model_name: Cow::Borrowed(&info.model_name),
                model_number: info.model_number.as_deref().map(Cow::Borrowed),
                model_url: info.model_url.as_deref().map(Cow::Borrowed),
                serial_number: info.serial_number.as_deref().map(Cow::Borrowed),
                udn: info.udn.clone(),
                upc: info.upc.as_deref().map(Cow::Borrowed),
                icon_list: info.icons.iter().map(|i| i.descriptor_entry()).collect(),
                service_list: info
                    .services
                    .iter()
                    .map(|s| s.descriptor_entry(self.base_url.path()))
                    .collect(),
                device_list: Vec::new(),
                presentation_url: None,
            },
        }
    }

    pub fn description_xml(&self) -> anyhow::Result<String> {
        self.description().into_xml()
    }
}
