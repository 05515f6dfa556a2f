use core::str;
use std::{
    fmt::Display,
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    str::FromStr,
};

use anyhow::Context;

use crate::device_description::Udn;

use super::urn;

pub const SSDP_IP_ADDR: Ipv4Addr = Ipv4Addr::new(239, 255, 255, 250);
pub const SSDP_PORT: u16 = 1900;
pub const SSDP_ADDR: SocketAddr = SocketAddr::V4(SocketAddrV4::new(SSDP_IP_ADDR, SSDP_PORT));

/// SERVER/USER-AGENT product token sent with every announcement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpnpAgent<'a> {
    pub os: &'a str,
    pub product: &'a str,
    pub product_version: &'a str,
}

impl Default for UpnpAgent<'static> {
    fn default() -> Self {
        Self {
            os: std::env::consts::OS,
            product: env!("CARGO_PKG_NAME"),
            product_version: env!("CARGO_PKG_VERSION"),
        }
    }
}

impl Display for UpnpAgent<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{os} UPnP/1.0 DLNADOC/1.50 {product}/{version}",
            os = self.os,
            product = self.product,
            version = self.product_version
        )
    }
}

/// Unique Service Name: a device UDN, optionally followed by `::` and the
/// advertised target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct USN {
    pub udn: Udn,
    pub suffix: UsnSuffix,
}

/// What comes after the UDN in a USN.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UsnSuffix {
    /// Bare `uuid:...` form announcing the device instance itself.
    Bare,
    RootDevice,
    Target(urn::URN),
}

impl USN {
    pub fn bare(udn: Udn) -> Self {
        Self {
            udn,
            suffix: UsnSuffix::Bare,
        }
    }
    pub fn root(udn: Udn) -> Self {
        Self {
            udn,
            suffix: UsnSuffix::RootDevice,
        }
    }
    pub fn target(udn: Udn, urn: urn::URN) -> Self {
        Self {
            udn,
            suffix: UsnSuffix::Target(urn),
        }
    }
}

impl Display for USN {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.suffix {
            UsnSuffix::Bare => write!(f, "{}", self.udn),
            UsnSuffix::RootDevice => write!(f, "{}::upnp:rootdevice", self.udn),
            UsnSuffix::Target(urn) => write!(f, "{}::{urn}", self.udn),
        }
    }
}

impl FromStr for USN {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once("::") {
            None => Ok(Self::bare(s.parse()?)),
            Some((udn, "upnp:rootdevice")) => Ok(Self::root(udn.parse()?)),
            Some((udn, target)) => Ok(Self::target(udn.parse()?, target.parse()?)),
        }
    }
}

/// Search target / notification type of an SSDP frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationType {
    /// `ssdp:all`: wildcard, the search is for all devices and services.
    All,
    /// `upnp:rootdevice`
    RootDevice,
    /// A specific device instance.
    Uuid(Udn),
    Urn(urn::URN),
}

impl FromStr for NotificationType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "ssdp:all" {
            Ok(Self::All)
        } else if s == "upnp:rootdevice" {
            Ok(Self::RootDevice)
        } else if s.starts_with("uuid:") {
            Ok(Self::Uuid(s.parse()?))
        } else if s.starts_with("urn:") {
            Ok(Self::Urn(s.parse()?))
        } else {
            anyhow::bail!("search target {s:?} names no device or service class")
        }
    }
}

impl Display for NotificationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NotificationType::All => f.write_str("ssdp:all"),
            NotificationType::RootDevice => f.write_str("upnp:rootdevice"),
            NotificationType::Uuid(udn) => udn.fmt(f),
            NotificationType::Urn(urn) => urn.fmt(f),
        }
    }
}

/// Notification subtype. Specifies the kind of notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationSubType {
    /// Sent when a device joins the network or reaffirms its presence.
    Alive,
    /// Sent when a device is being removed from the network.
    ByeBye,
    /// Sent when the device's details changed.
    Update,
}

impl Display for NotificationSubType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = match self {
            NotificationSubType::Alive => "alive",
            NotificationSubType::ByeBye => "byebye",
            NotificationSubType::Update => "update",
        };
        write!(f, "ssdp:{msg}")
    }
}

impl FromStr for NotificationSubType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "ssdp:alive" => Self::Alive,
            "ssdp:byebye" => Self::ByeBye,
            "ssdp:update" => Self::Update,
            rest => Err(anyhow::anyhow!("Unknown notification sub type: {rest}"))?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchMessage {
    /// Multicast group for group searches, the target address for unicast.
    pub host: SocketAddr,
    pub st: NotificationType,
    /// Maximum wait time in seconds; replies are delayed by a random
    /// duration inside that window to balance load on the control point.
    pub mx: Option<u8>,
    pub user_agent: Option<String>,
}

impl Display for SearchMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "M-SEARCH * HTTP/1.1\r\n\
HOST: {host}\r\n\
MAN: \"ssdp:discover\"\r\n",
            host = self.host,
        )?;
        if let Some(mx) = self.mx {
            write!(f, "MX: {mx}\r\n")?;
        }
        write!(f, "ST: {st}\r\n", st = self.st)?;
        if let Some(user_agent) = &self.user_agent {
            write!(f, "USER-AGENT: {user_agent}\r\n")?;
        }
        write!(f, "\r\n")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifyAliveMessage {
    pub host: SocketAddr,
    /// Url of the device description.
    pub location: String,
    pub nt: NotificationType,
    pub usn: USN,
    /// Cache life time in seconds.
    pub cache_control: u32,
    pub server: String,
}

impl Display for NotifyAliveMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "NOTIFY * HTTP/1.1\r\n\
HOST: {host}\r\n\
CACHE-CONTROL: max-age={cache_control}\r\n\
LOCATION: {location}\r\n\
NT: {nt}\r\n\
NTS: ssdp:alive\r\n\
SERVER: {server}\r\n\
USN: {usn}\r\n\r\n",
            host = self.host,
            cache_control = self.cache_control,
            location = self.location,
            nt = self.nt,
            server = self.server,
            usn = self.usn,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifyByeByeMessage {
    pub host: SocketAddr,
    pub nt: NotificationType,
    pub usn: USN,
}

impl Display for NotifyByeByeMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "NOTIFY * HTTP/1.1\r\n\
HOST: {host}\r\n\
NT: {nt}\r\n\
NTS: ssdp:byebye\r\n\
USN: {usn}\r\n\r\n",
            host = self.host,
            nt = self.nt,
            usn = self.usn,
        )
    }
}

/// Response to a search request. Intentionally parallel to an alive
/// advertisement, with the NT header replaced by ST.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchResponse {
    pub cache_control: u32,
    pub location: String,
    pub server: String,
    pub st: NotificationType,
    pub usn: USN,
}

impl Display for SearchResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "HTTP/1.1 200 OK\r\n\
CACHE-CONTROL: max-age={cache_control}\r\n\
EXT:\r\n\
LOCATION: {location}\r\n\
SERVER: {server}\r\n\
ST: {st}\r\n\
USN: {usn}\r\n\
CONTENT-LENGTH: 0\r\n\r\n",
            cache_control = self.cache_control,
            location = self.location,
            server = self.server,
            st = self.st,
            usn = self.usn,
        )
    }
}

/// A property-change NOTIFY as delivered to an event callback URL. Carried
/// here so the codec covers the full canonical frame set (SID/SEQ included).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifyEventMessage {
    pub delivery_path: String,
    pub host: String,
    pub sid: String,
    pub seq: u32,
    pub body: String,
}

impl Display for NotifyEventMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "NOTIFY {path} HTTP/1.1\r\n\
HOST: {host}\r\n\
CONTENT-TYPE: text/xml; charset=\"utf-8\"\r\n\
NT: upnp:event\r\n\
NTS: upnp:propchange\r\n\
SID: {sid}\r\n\
SEQ: {seq}\r\n\
CONTENT-LENGTH: {len}\r\n\r\n{body}",
            path = self.delivery_path,
            host = self.host,
            sid = self.sid,
            seq = self.seq,
            len = self.body.len(),
            body = self.body,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SsdpMessage {
    Search(SearchMessage),
    NotifyAlive(NotifyAliveMessage),
    NotifyByeBye(NotifyByeByeMessage),
    NotifyEvent(NotifyEventMessage),
    SearchResponse(SearchResponse),
}

fn headers(s: &str) -> impl Iterator<Item = (&str, &str)> {
    s.lines()
        .filter_map(|l| l.split_once(':'))
        .map(|(name, value)| (name, value.trim()))
}

impl SsdpMessage {
    /// Decode one SSDP text frame. Header names are matched
    /// case-insensitively, unknown headers are skipped.
    pub fn parse(s: &str) -> anyhow::Result<SsdpMessage> {
        let request_line = s.lines().next().context("request line")?;
        if request_line == "HTTP/1.1 200 OK" {
            return Self::parse_search_response(s);
        }
        let (method, rest) = request_line.split_once(' ').context("split request line")?;
        match method {
            "M-SEARCH" => Self::parse_search(s),
            "NOTIFY" => {
                let (path, _version) = rest.split_once(' ').context("split notify path")?;
                Self::parse_notify(s, path)
            }
            _ => Err(anyhow::anyhow!("Unknown method encountered: {method}")),
        }
    }

    fn parse_search(s: &str) -> anyhow::Result<SsdpMessage> {
        let mut host = None;
        let mut man = None;
        let mut st = None;
        let mut mx = None;
        let mut user_agent = None;
        for (name, value) in headers(s) {
            match name.to_ascii_lowercase().as_str() {
                "host" => {
                    host = Some(SocketAddr::V4(
                        SocketAddrV4::from_str(value).context("parse host address")?,
                    ));
                }
                "man" => man = Some(value.trim_matches('"').to_owned()),
                "st" => st = Some(NotificationType::from_str(value)?),
                "mx" => mx = Some(value.parse().context("parse mx")?),
                "user-agent" => user_agent = Some(value.to_owned()),
                _ => (),
            }
        }
        anyhow::ensure!(
            man.as_deref() == Some("ssdp:discover"),
            "search without ssdp:discover man header"
        );
        Ok(SsdpMessage::Search(SearchMessage {
            host: host.context("missing host")?,
            st: st.context("missing st")?,
            mx,
            user_agent,
        }))
    }

    fn parse_notify(s: &str, path: &str) -> anyhow::Result<SsdpMessage> {
        let mut host = None;
        let mut nts = None;
        let mut location = None;
        let mut nt = None;
        let mut usn = None;
        let mut cache_control = None;
        let mut server = None;
        let mut sid = None;
        let mut seq = None;
        for (name, value) in headers(s) {
            match name.to_ascii_lowercase().as_str() {
                "host" => host = Some(value.to_owned()),
                "location" => location = Some(value.to_owned()),
                "usn" => usn = Some(value.to_owned()),
                "nt" => nt = Some(value.to_owned()),
                "nts" => nts = Some(value.to_owned()),
                "server" => server = Some(value.to_owned()),
                "sid" => sid = Some(value.to_owned()),
                "seq" => seq = Some(value.parse::<u32>().context("parse seq")?),
                "cache-control" => {
                    let (prefix, cache_duration) =
                        value.split_once('=').context("split cache control")?;
                    anyhow::ensure!(prefix.trim() == "max-age");
                    cache_control = Some(cache_duration.parse().context("parse duration seconds")?)
                }
                _ => (),
            }
        }
        let nts = nts.context("missing nts")?;
        if nts == "upnp:propchange" {
            let body = s.split_once("\r\n\r\n").map(|(_, b)| b).unwrap_or_default();
            return Ok(SsdpMessage::NotifyEvent(NotifyEventMessage {
                delivery_path: path.to_owned(),
                host: host.context("missing host")?,
                sid: sid.context("missing sid")?,
                seq: seq.unwrap_or(0),
                body: body.to_owned(),
            }));
        }

        let host = host.context("missing host")?;
        let host = SocketAddr::V4(SocketAddrV4::from_str(&host).context("parse host address")?);
        let nt = NotificationType::from_str(&nt.context("missing nt")?)?;
        let usn = USN::from_str(&usn.context("missing usn")?)?;
        match NotificationSubType::from_str(&nts)? {
            NotificationSubType::Alive | NotificationSubType::Update => {
                Ok(SsdpMessage::NotifyAlive(NotifyAliveMessage {
                    host,
                    location: location.context("missing location")?,
                    nt,
                    usn,
                    cache_control: cache_control.context("missing cache control")?,
                    server: server.unwrap_or_default(),
                }))
            }
            NotificationSubType::ByeBye => {
                Ok(SsdpMessage::NotifyByeBye(NotifyByeByeMessage { host, nt, usn }))
            }
        }
    }

    fn parse_search_response(s: &str) -> anyhow::Result<SsdpMessage> {
        let mut cache_control = None;
        let mut location = None;
        let mut server = None;
        let mut st = None;
        let mut usn = None;
        for (name, value) in headers(s) {
            match name.to_ascii_lowercase().as_str() {
                "cache-control" => {
                    let (prefix, cache_duration) =
                        value.split_once('=').context("split cache control")?;
                    anyhow::ensure!(prefix.trim() == "max-age");
                    cache_control = Some(cache_duration.parse().context("parse duration seconds")?)
                }
                "location" => location = Some(value.to_owned()),
                "server" => server = Some(value.to_owned()),
                "st" => st = Some(NotificationType::from_str(value)?),
                "usn" => usn = Some(USN::from_str(value)?),
                _ => (),
            }
        }
        Ok(SsdpMessage::SearchResponse(SearchResponse {
            cache_control: cache_control.context("missing cache control")?,
            location: location.context("missing location")?,
            server: server.unwrap_or_default(),
            st: st.context("missing st")?,
            usn: usn.context("missing usn")?,
        }))
    }
}
