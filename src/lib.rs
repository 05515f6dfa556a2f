//! Embeddable UPnP/DLNA 1.0 stack: SSDP discovery and advertisement, a
//! cooperative schedule queue driving all outgoing multicast/unicast
//! traffic, SOAP control and GENA eventing for both the device and the
//! control point role.

/// Generic SOAP action model: arguments, requests, replies, envelopes
pub mod action;
mod clock;
pub mod config;
/// Control point facade: discovery, SOAP invocation, event subscriptions
pub mod control_point;
mod device;
mod device_description;
/// Device facade: advertisement, descriptor serving, control dispatch
pub mod device_host;
/// Control-point device registry fed by SSDP replies and notifications
pub mod discovery;
/// General Event Notification Architecture (GENA) subscribe/notify layer
pub mod eventing;
mod request_parser;
/// Axum router used to set up description, control and event endpoints
pub mod router;
pub mod schedule;
/// HTTP client performing SOAP action calls against a remote service
pub mod soap_client;
/// Simple Service Discovery Protocol ([SSDP](https://en.wikipedia.org/wiki/Simple_Service_Discovery_Protocol)) implementation
pub mod ssdp;
pub mod udp;
pub mod urn;

pub use clock::Clock;
pub use config::DlnaConfig;
pub use device::{ControlHandler, DeviceIcon, DeviceInfo, DeviceModel, ServiceInfo};
pub use device_description::{DeviceDescription, Icon, SpecVersion, Udn};

/// Errors surfaced by the public API, grouped by recovery policy.
#[derive(Debug)]
pub enum DlnaError {
    /// Startup validation failed. The facade refuses to start.
    Config(String),
    /// Socket or connection level failure.
    Transport(anyhow::Error),
    /// An HTTP request ran past its deadline; the connection was closed.
    Timeout,
    /// Malformed SSDP/SOAP/XML input. The offending frame was dropped.
    Protocol(anyhow::Error),
    /// Operation not allowed in the current lifecycle state.
    State(&'static str),
}

impl std::fmt::Display for DlnaError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DlnaError::Config(msg) => write!(f, "configuration error: {msg}"),
            DlnaError::Transport(e) => write!(f, "transport error: {e}"),
            DlnaError::Timeout => write!(f, "request timed out"),
            DlnaError::Protocol(e) => write!(f, "protocol error: {e}"),
            DlnaError::State(msg) => write!(f, "invalid state: {msg}"),
        }
    }
}

impl std::error::Error for DlnaError {}

impl From<std::io::Error> for DlnaError {
    fn from(value: std::io::Error) -> Self {
        Self::Transport(value.into())
    }
}

impl From<reqwest::Error> for DlnaError {
    fn from(value: reqwest::Error) -> Self {
        if value.is_timeout() {
            Self::Timeout
        } else {
            Self::Transport(value.into())
        }
    }
}

/// Useful utility functions for [Reader](quick_xml::Reader)
pub trait XmlReaderExt<'a> {
    fn read_event_err_eof(&mut self) -> anyhow::Result<quick_xml::events::Event<'a>>;
    fn read_to_start(&mut self) -> anyhow::Result<quick_xml::events::BytesStart<'a>>;
}

impl<'a> XmlReaderExt<'a> for quick_xml::Reader<&'a [u8]> {
    fn read_event_err_eof(&mut self) -> anyhow::Result<quick_xml::events::Event<'a>> {
        let event = self.read_event()?;
        match event {
            quick_xml::events::Event::Eof => Err(anyhow::anyhow!("early eof")),
            _ => Ok(event),
        }
    }
    fn read_to_start(&mut self) -> anyhow::Result<quick_xml::events::BytesStart<'a>> {
        loop {
            let event = self.read_event_err_eof()?.into_owned();
            if let quick_xml::events::Event::Start(e) = event {
                break Ok(e);
            }
        }
    }
}

pub type XmlWriter = quick_xml::Writer<Vec<u8>>;

/// Allows structs to serialize themselves into xml fragments
pub trait IntoXml {
    fn write_xml(&self, w: &mut XmlWriter) -> std::io::Result<()>;

    fn into_string(&self) -> std::io::Result<String> {
        let mut w = quick_xml::Writer::new(Vec::new());
        self.write_xml(&mut w)?;
        Ok(String::from_utf8(w.into_inner()).expect("produced value to be utf-8"))
    }
}

/// Allows structs to deserialize themselves from xml reader
pub trait FromXml<'a> {
    fn read_xml(r: &mut quick_xml::Reader<&'a [u8]>) -> anyhow::Result<Self>
    where
        Self: Sized;
}

impl<T: IntoXml> IntoXml for Vec<T> {
    fn write_xml(&self, w: &mut XmlWriter) -> std::io::Result<()> {
        for el in self {
            el.write_xml(w)?;
        }
        Ok(())
    }
}
