use std::{borrow::Cow, fmt::Display, str::FromStr};

use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceType {
    MediaServer,
    MediaRenderer,
    Other(String),
}

impl DeviceType {
    fn name(&self) -> &str {
        match self {
            DeviceType::MediaServer => "MediaServer",
            DeviceType::MediaRenderer => "MediaRenderer",
            DeviceType::Other(name) => name,
        }
    }

    fn from_name(name: &str) -> Self {
        match name {
            "MediaServer" => DeviceType::MediaServer,
            "MediaRenderer" => DeviceType::MediaRenderer,
            other => DeviceType::Other(other.to_string()),
        }
    }
}

impl Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceType {
    AVTransport,
    RenderingControl,
    ConnectionManager,
    ContentDirectory,
    Other(String),
}

impl ServiceType {
    fn name(&self) -> &str {
        match self {
            ServiceType::AVTransport => "AVTransport",
            ServiceType::RenderingControl => "RenderingControl",
            ServiceType::ConnectionManager => "ConnectionManager",
            ServiceType::ContentDirectory => "ContentDirectory",
            ServiceType::Other(name) => name,
        }
    }

    fn from_name(name: &str) -> Self {
        match name {
            "AVTransport" => ServiceType::AVTransport,
            "RenderingControl" => ServiceType::RenderingControl,
            "ConnectionManager" => ServiceType::ConnectionManager,
            "ContentDirectory" => ServiceType::ContentDirectory,
            other => ServiceType::Other(other.to_string()),
        }
    }
}

impl Display for ServiceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UrnType {
    Device(DeviceType),
    Service(ServiceType),
}

/// Typed form of a `urn:<domain>:device|service:<name>:<version>`
/// identifier. The schema domain is preserved verbatim so vendor URNs
/// survive a parse/serialize round trip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct URN {
    pub domain: Cow<'static, str>,
    pub version: u8,
    pub urn_type: UrnType,
}

impl Serialize for URN {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl URN {
    pub const fn upnp_device(device: DeviceType, version: u8) -> Self {
        Self {
            domain: Cow::Borrowed("schemas-upnp-org"),
            version,
            urn_type: UrnType::Device(device),
        }
    }

    pub const fn upnp_service(service: ServiceType, version: u8) -> Self {
        Self {
            domain: Cow::Borrowed("schemas-upnp-org"),
            version,
            urn_type: UrnType::Service(service),
        }
    }

    pub fn media_renderer() -> Self {
        Self::upnp_device(DeviceType::MediaRenderer, 1)
    }

    pub fn media_server() -> Self {
        Self::upnp_device(DeviceType::MediaServer, 1)
    }

    pub fn is_service(&self) -> bool {
        matches!(self.urn_type, UrnType::Service(_))
    }
}

impl Display for URN {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "urn:{}:", self.domain)?;
        match &self.urn_type {
            UrnType::Device(device) => write!(f, "device:{}:{}", device.name(), self.version),
            UrnType::Service(service) => write!(f, "service:{}:{}", service.name(), self.version),
        }
    }
}

impl FromStr for URN {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = s.split(':').collect();
        let (domain, kind, name, version) = match fields.as_slice() {
            ["urn", domain, kind, name, version] => (*domain, *kind, *name, *version),
            _ => anyhow::bail!("{s:?} does not have the urn:<domain>:<kind>:<name>:<version> shape"),
        };
        let version = version
            .parse()
            .map_err(|_| anyhow::anyhow!("{s:?} carries a non numeric version"))?;
        let urn_type = match kind {
            "device" => UrnType::Device(DeviceType::from_name(name)),
            "service" => UrnType::Service(ServiceType::from_name(name)),
            _ => anyhow::bail!("{s:?} is neither a device nor a service urn"),
        };
        Ok(URN {
            domain: Cow::Owned(domain.to_string()),
            version,
            urn_type,
        })
    }
}
