use std::{borrow::Cow, collections::HashMap, fmt::Display, str::FromStr};

use anyhow::Context;
use quick_xml::events::{BytesDecl, BytesStart, BytesText, Event};
use serde::{Deserialize, Serialize};

use crate::{FromXml, IntoXml, XmlReaderExt, XmlWriter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpecVersion {
    pub major: usize,
    pub minor: usize,
}

impl SpecVersion {
    /// UPnP 1.0 spec version
    pub const fn upnp_v1() -> Self {
        Self { major: 1, minor: 0 }
    }
}

impl IntoXml for SpecVersion {
    fn write_xml(&self, w: &mut XmlWriter) -> std::io::Result<()> {
        let parent = BytesStart::new("specVersion");
        let parent_end = parent.to_end().into_owned();
        w.write_event(Event::Start(parent)).map_err(std::io::Error::other)?;
        w.create_element("major")
            .write_text_content(BytesText::new(&self.major.to_string()))
            .map_err(std::io::Error::other)?;
        w.create_element("minor")
            .write_text_content(BytesText::new(&self.minor.to_string()))
            .map_err(std::io::Error::other)?;
        w.write_event(Event::End(parent_end))
            .map_err(std::io::Error::other)
    }
}

impl<'a> FromXml<'a> for SpecVersion {
    fn read_xml(r: &mut quick_xml::Reader<&'a [u8]>) -> anyhow::Result<Self> {
        let mut major = None;
        let mut minor = None;
        for_each_child(r, b"specVersion", |r, child, is_empty| {
            let value = text_of(r, child, is_empty)?;
            match child.local_name().as_ref() {
                b"major" => major = value.parse().ok(),
                b"minor" => minor = value.parse().ok(),
                _ => (),
            }
            Ok(())
        })?;
        Ok(Self {
            major: major.context("spec version major")?,
            minor: minor.context("spec version minor")?,
        })
    }
}

/// Unique Device Name. Universally-unique identifier for the device, shall
/// be the same over time for a specific device instance (i.e. shall survive
/// reboots). The part after the `uuid:` prefix is treated as opaque so host
/// provided identifiers are preserved untouched.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Udn(String);

impl Udn {
    pub fn new(uuid: uuid::Uuid) -> Self {
        Self(format!("uuid:{uuid}"))
    }
}

impl Display for Udn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Udn {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        anyhow::ensure!(s.starts_with("uuid:"), "udn should start with uuid:");
        anyhow::ensure!(s.len() > "uuid:".len(), "udn without identifier");
        Ok(Self(s.to_string()))
    }
}

/// Writes `<name>value</name>`, collapsing empty values to `<name/>`.
pub(crate) fn write_leaf(w: &mut XmlWriter, name: &str, value: &str) -> std::io::Result<()> {
    if value.is_empty() {
        w.write_event(Event::Empty(BytesStart::new(name)))
            .map_err(std::io::Error::other)
    } else {
        w.create_element(name)
            .write_text_content(BytesText::new(value))
            .map(|_| ())
            .map_err(std::io::Error::other)
    }
}

/// Hands every direct child element of the node the reader currently sits
/// in to `on_child`, stopping at the parent's closing tag. The callback
/// must consume the child's subtree (leaves usually go through
/// [text_of]); empty elements are flagged instead.
fn for_each_child<'a>(
    r: &mut quick_xml::Reader<&'a [u8]>,
    parent: &[u8],
    mut on_child: impl FnMut(
        &mut quick_xml::Reader<&'a [u8]>,
        &BytesStart<'static>,
        bool,
    ) -> anyhow::Result<()>,
) -> anyhow::Result<()> {
    loop {
        match r.read_event_err_eof()?.into_owned() {
            Event::Start(child) => on_child(r, &child, false)?,
            Event::Empty(child) => on_child(r, &child, true)?,
            Event::End(end) if end.local_name().as_ref() == parent => return Ok(()),
            Event::End(end) => anyhow::bail!(
                "closing tag </{}> where </{}> was expected",
                String::from_utf8_lossy(end.local_name().as_ref()),
                String::from_utf8_lossy(parent),
            ),
            _ => (),
        }
    }
}

/// Text content of a child element, `""` for the self-closing form. Nested
/// markup comes back verbatim as part of the text.
fn text_of<'a>(
    r: &mut quick_xml::Reader<&'a [u8]>,
    child: &BytesStart<'_>,
    is_empty: bool,
) -> anyhow::Result<Cow<'a, str>> {
    if is_empty {
        return Ok(Cow::Borrowed(""));
    }
    Ok(r.read_text(child.name())?)
}

/// Reads a `<listTag><entryTag>…</entryTag>…</listTag>` container. Foreign
/// entries are skipped, not rejected.
fn read_list<'a, T>(
    r: &mut quick_xml::Reader<&'a [u8]>,
    list_tag: &[u8],
    entry_tag: &[u8],
    mut read_entry: impl FnMut(&mut quick_xml::Reader<&'a [u8]>) -> anyhow::Result<T>,
) -> anyhow::Result<Vec<T>> {
    let mut entries = Vec::new();
    for_each_child(r, list_tag, |r, child, is_empty| {
        if child.local_name().as_ref() != entry_tag {
            if !is_empty {
                r.read_to_end(child.name())?;
            }
            return Ok(());
        }
        if !is_empty {
            entries.push(read_entry(r)?);
        }
        Ok(())
    })?;
    Ok(entries)
}

/// UPnP 1.0 device descriptor served at the device LOCATION url.
#[derive(Debug)]
pub struct DeviceDescription<'a> {
    pub spec_version: SpecVersion,
    pub url_base: Cow<'a, str>,
    pub device: Device<'a>,
}

impl DeviceDescription<'_> {
    pub fn into_xml(&self) -> anyhow::Result<String> {
        use quick_xml::Writer;
        let mut w = Writer::new(Vec::new());
        w.write_event(Event::Decl(BytesDecl::new("1.0", None, None)))?;
        let root = BytesStart::new("root").with_attributes([
            ("xmlns", "urn:schemas-upnp-org:device-1-0"),
            ("xmlns:dlna", "urn:schemas-dlna-org:device-1-0"),
        ]);
        let root_end = root.to_end().into_owned();
        w.write_event(Event::Start(root))?;
        self.spec_version.write_xml(&mut w)?;
        write_leaf(&mut w, "URLBase", &self.url_base)?;
        self.device.write_xml(&mut w)?;

        w.write_event(Event::End(root_end))?;
        Ok(String::from_utf8(w.into_inner())?)
    }
}

impl<'a> FromXml<'a> for DeviceDescription<'a> {
    fn read_xml(r: &mut quick_xml::Reader<&'a [u8]>) -> anyhow::Result<Self> {
        let root = r.read_to_start()?;
        anyhow::ensure!(
            root.local_name().as_ref() == b"root",
            "descriptor does not start with a root element"
        );

        let mut spec_version = None;
        let mut url_base = None;
        let mut device = None;
        for_each_child(r, b"root", |r, child, is_empty| {
            match child.local_name().as_ref() {
                b"specVersion" if !is_empty => spec_version = Some(SpecVersion::read_xml(r)?),
                b"URLBase" => url_base = Some(text_of(r, child, is_empty)?),
                b"device" if !is_empty => device = Some(Device::read_xml(r)?),
                _ => {
                    if !is_empty {
                        r.read_to_end(child.name())?;
                    }
                }
            }
            Ok(())
        })?;

        Ok(Self {
            spec_version: spec_version.context("descriptor without specVersion block")?,
            url_base: url_base.unwrap_or_default(),
            device: device.context("descriptor without device block")?,
        })
    }
}

#[derive(Debug)]
pub struct Device<'a> {
    pub device_type: Cow<'a, str>,
    pub friendly_name: Cow<'a, str>,
    /// Manufacturer name. Should be < 64 characters.
    pub manufacturer: Cow<'a, str>,
    pub manufacturer_url: Option<Cow<'a, str>>,
    /// Should be < 128 characters
    pub model_description: Option<Cow<'a, str>>,
    pub model_name: Cow<'a, str>,
    pub model_number: Option<Cow<'a, str>>,
    pub model_url: Option<Cow<'a, str>>,
    pub serial_number: Option<Cow<'a, str>>,
    pub udn: Udn,
    pub upc: Option<Cow<'a, str>>,
    pub icon_list: Vec<Icon<'a>>,
    pub service_list: Vec<Service<'a>>,
    pub device_list: Vec<Device<'a>>,
    pub presentation_url: Option<Cow<'a, str>>,
}

impl<'a> Device<'a> {
    pub fn all_services(&'a self) -> Box<dyn Iterator<Item = &'a Service<'a>> + 'a> {
        let self_services = self.service_list.iter();
        let nested_services = self.device_list.iter().flat_map(|d| d.all_services());
        Box::new(self_services.chain(nested_services))
    }
}

impl IntoXml for Device<'_> {
    fn write_xml(&self, w: &mut XmlWriter) -> std::io::Result<()> {
        let device = BytesStart::new("device");
        let device_end = device.to_end().into_owned();
        w.write_event(Event::Start(device)).map_err(std::io::Error::other)?;
        write_leaf(w, "deviceType", &self.device_type)?;
        write_leaf(w, "friendlyName", &self.friendly_name)?;
        write_leaf(w, "manufacturer", &self.manufacturer)?;
        if let Some(manufacturer_url) = &self.manufacturer_url {
            write_leaf(w, "manufacturerURL", manufacturer_url)?;
        }
        if let Some(model_description) = &self.model_description {
            write_leaf(w, "modelDescription", model_description)?;
        }
        write_leaf(w, "modelName", &self.model_name)?;
        if let Some(model_number) = &self.model_number {
            write_leaf(w, "modelNumber", model_number)?;
        }
        if let Some(model_url) = &self.model_url {
            write_leaf(w, "modelURL", model_url)?;
        }
        if let Some(serial_number) = &self.serial_number {
            write_leaf(w, "serialNumber", serial_number)?;
        }
        let udn = self.udn.to_string();
        write_leaf(w, "UDN", &udn)?;
        if let Some(upc) = &self.upc {
            write_leaf(w, "UPC", upc)?;
        }
        w.create_element("dlna:X_DLNADOC")
            .write_text_content(BytesText::new("DMS-1.50"))
            .map_err(std::io::Error::other)?;
        w.create_element("iconList")
            .write_inner_content(|w| -> Result<(), quick_xml::Error> {
                for icon in &self.icon_list {
                    w.write_serializable("icon", icon)
                        .expect("serialization not fail");
                }
                Ok(())
            })
            .map_err(std::io::Error::other)?;
        w.create_element("serviceList")
            .write_inner_content(|w| -> Result<(), quick_xml::Error> {
                for service in &self.service_list {
                    w.write_serializable("service", service)
                        .expect("serialization not fail");
                }
                Ok(())
            })
            .map_err(std::io::Error::other)?;
        if !self.device_list.is_empty() {
            w.create_element("deviceList")
                .write_inner_content(|w| -> Result<(), quick_xml::Error> {
                    for device in &self.device_list {
                        device.write_xml(w).map_err(quick_xml::Error::from)?;
                    }
                    Ok(())
                })
                .map_err(std::io::Error::other)?;
        }

        if let Some(presentation_url) = &self.presentation_url {
            write_leaf(w, "presentationURL", presentation_url)?;
        }
        w.write_event(Event::End(device_end))
            .map_err(std::io::Error::other)
    }
}

impl<'a> FromXml<'a> for Device<'a> {
    fn read_xml(r: &mut quick_xml::Reader<&'a [u8]>) -> anyhow::Result<Self> {
        let mut leaves: HashMap<Vec<u8>, Cow<'a, str>> = HashMap::new();
        let mut icons = Vec::new();
        let mut services = Vec::new();
        let mut embedded = Vec::new();
        for_each_child(r, b"device", |r, child, is_empty| {
            match child.local_name().as_ref() {
                b"iconList" if !is_empty => {
                    icons = read_list(r, b"iconList", b"icon", Icon::read_xml)?;
                }
                b"serviceList" if !is_empty => {
                    services = read_list(r, b"serviceList", b"service", Service::read_xml)?;
                }
                b"deviceList" if !is_empty => {
                    embedded = read_list(r, b"deviceList", b"device", Device::read_xml)?;
                }
                name => {
                    let value = text_of(r, child, is_empty)?;
                    leaves.insert(name.to_vec(), value);
                }
            }
            Ok(())
        })?;

        let udn = leaves
            .remove(b"UDN".as_slice())
            .context("device block without <UDN>")?
            .parse()?;
        let mut field = |tag: &'static str| {
            leaves
                .remove(tag.as_bytes())
                .with_context(|| format!("device block without <{tag}>"))
        };
        Ok(Self {
            device_type: field("deviceType")?,
            friendly_name: field("friendlyName")?,
            manufacturer: field("manufacturer")?,
            model_name: field("modelName")?,
            manufacturer_url: field("manufacturerURL").ok(),
            model_description: field("modelDescription").ok(),
            model_number: field("modelNumber").ok(),
            model_url: field("modelURL").ok(),
            serial_number: field("serialNumber").ok(),
            upc: field("UPC").ok(),
            presentation_url: field("presentationURL").ok(),
            udn,
            icon_list: icons,
            service_list: services,
            device_list: embedded,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Icon<'a> {
    pub mimetype: Cow<'a, str>,
    pub width: usize,
    pub height: usize,
    pub depth: usize,
    pub url: Cow<'a, str>,
}

impl<'a> FromXml<'a> for Icon<'a> {
    fn read_xml(r: &mut quick_xml::Reader<&'a [u8]>) -> anyhow::Result<Self> {
        let mut leaves: HashMap<Vec<u8>, Cow<'a, str>> = HashMap::new();
        for_each_child(r, b"icon", |r, child, is_empty| {
            let value = text_of(r, child, is_empty)?;
            leaves.insert(child.local_name().as_ref().to_vec(), value);
            Ok(())
        })?;
        let mut field = |tag: &'static str| {
            leaves
                .remove(tag.as_bytes())
                .with_context(|| format!("icon entry without <{tag}>"))
        };
        Ok(Self {
            mimetype: field("mimetype")?,
            width: field("width")?.parse().context("icon width")?,
            height: field("height")?.parse().context("icon height")?,
            depth: field("depth")?.parse().context("icon depth")?,
            url: field("url")?,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Service<'a> {
    #[serde(rename = "serviceType")]
    pub service_type: Cow<'a, str>,
    #[serde(rename = "serviceId")]
    pub service_id: Cow<'a, str>,
    /// URL for service description. Shall be relative to the URL at which
    /// the device description is located.
    #[serde(rename = "SCPDURL")]
    pub scpd_url: Cow<'a, str>,
    #[serde(rename = "controlURL")]
    pub control_url: Cow<'a, str>,
    #[serde(rename = "eventSubURL")]
    pub event_sub_url: Cow<'a, str>,
}

impl<'a> FromXml<'a> for Service<'a> {
    fn read_xml(r: &mut quick_xml::Reader<&'a [u8]>) -> anyhow::Result<Self> {
        let mut leaves: HashMap<Vec<u8>, Cow<'a, str>> = HashMap::new();
        for_each_child(r, b"service", |r, child, is_empty| {
            let value = text_of(r, child, is_empty)?;
            leaves.insert(child.local_name().as_ref().to_vec(), value);
            Ok(())
        })?;
        // a missing or self-closed eventSubURL means the service does not
        // accept subscriptions
        let event_sub_url = leaves.remove(b"eventSubURL".as_slice()).unwrap_or_default();
        let mut field = |tag: &'static str| {
            leaves
                .remove(tag.as_bytes())
                .with_context(|| format!("service entry without <{tag}>"))
        };
        Ok(Self {
            service_type: field("serviceType")?,
            service_id: field("serviceId")?,
            scpd_url: field("SCPDURL")?,
            control_url: field("controlURL")?,
            event_sub_url,
        })
    }
}
