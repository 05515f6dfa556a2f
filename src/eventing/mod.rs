use std::fmt::Display;

use anyhow::Context;
use quick_xml::events::{BytesStart, Event};

use crate::{device_description::write_leaf, IntoXml, XmlReaderExt, XmlWriter};

pub mod publisher;
pub mod subscription;

/// Lifecycle of a GENA subscription, shared by both directions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Unsubscribed,
    Subscribing,
    Subscribed,
    Renewing,
    Unsubscribing,
    Failed,
}

impl Display for SubscriptionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SubscriptionState::Unsubscribed => "unsubscribed",
            SubscriptionState::Subscribing => "subscribing",
            SubscriptionState::Subscribed => "subscribed",
            SubscriptionState::Renewing => "renewing",
            SubscriptionState::Unsubscribing => "unsubscribing",
            SubscriptionState::Failed => "failed",
        };
        write!(f, "{name}")
    }
}

/// Parse a GENA `TIMEOUT` header value (`Second-n` or `infinite`).
pub fn parse_timeout_seconds(value: &str) -> anyhow::Result<Option<u32>> {
    let value = value.trim();
    if value.eq_ignore_ascii_case("infinite") {
        return Ok(None);
    }
    let (prefix, seconds) = value.split_once('-').context("split timeout header")?;
    anyhow::ensure!(prefix.eq_ignore_ascii_case("second"), "expected Second-n");
    Ok(Some(seconds.trim().parse().context("parse timeout seconds")?))
}

pub fn format_timeout_seconds(seconds: u32) -> String {
    format!("Second-{seconds}")
}

/// RFC 1123 date for response headers.
pub(crate) fn http_date() -> String {
    let now = time::OffsetDateTime::now_utc();
    let format = time::format_description::parse_borrowed::<2>("[weekday repr:short], [day padding:zero] [month repr:short] [year] [hour]:[minute]:[second] GMT").expect("infallible");
    now.format(&format).expect("infallible")
}

/// One changed state variable inside a property set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Property {
    pub name: String,
    pub value: String,
}

/// `e:propertyset` body of a property-change NOTIFY.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PropertySet {
    pub properties: Vec<Property>,
}

impl PropertySet {
    pub fn single(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            properties: vec![Property {
                name: name.into(),
                value: value.into(),
            }],
        }
    }
}

impl IntoXml for PropertySet {
    fn write_xml(&self, w: &mut XmlWriter) -> std::io::Result<()> {
        let set = BytesStart::new("e:propertyset")
            .with_attributes([("xmlns:e", "urn:schemas-upnp-org:event-1-0")]);
        let set_end = set.to_end().into_owned();
        w.write_event(Event::Start(set)).map_err(std::io::Error::other)?;
        for property in &self.properties {
            let tag = BytesStart::new("e:property");
            let tag_end = tag.to_end().into_owned();
            w.write_event(Event::Start(tag)).map_err(std::io::Error::other)?;
            write_leaf(w, &property.name, &property.value)?;
            w.write_event(Event::End(tag_end)).map_err(std::io::Error::other)?;
        }
        w.write_event(Event::End(set_end)).map_err(std::io::Error::other)
    }
}

impl PropertySet {
    /// Walk a propertyset body: every `property` contributes its first
    /// child as `(name, value)`. Unknown elements are skipped, nesting past
    /// `max_depth` is refused.
    pub fn parse(raw_xml: &[u8], max_depth: usize) -> anyhow::Result<Self> {
        let mut r = quick_xml::Reader::from_reader(raw_xml);
        let set = r.read_to_start()?.into_owned();
        anyhow::ensure!(
            set.local_name().as_ref() == b"propertyset",
            "expected propertyset root"
        );
        let mut properties = Vec::new();
        loop {
            match r.read_event_err_eof()?.into_owned() {
                Event::Start(start) => {
                    if start.local_name().as_ref() == b"property" {
                        if let Some(property) = read_property(&mut r, max_depth)? {
                            properties.push(property);
                        }
                    } else {
                        r.read_to_end(start.name())?;
                    }
                }
                Event::End(end) => {
                    anyhow::ensure!(end.local_name().as_ref() == b"propertyset");
                    break;
                }
                _ => (),
            }
        }
        Ok(Self { properties })
    }
}

/// First child element of a `property` becomes the variable name and its
/// accumulated text the value. Returns `None` for an empty property.
fn read_property(
    r: &mut quick_xml::Reader<&[u8]>,
    max_depth: usize,
) -> anyhow::Result<Option<Property>> {
    let mut depth = 0usize;
    let mut current: Option<(String, String)> = None;
    let mut captured = None;
    loop {
        match r.read_event_err_eof()?.into_owned() {
            Event::Start(child) => {
                anyhow::ensure!(depth < max_depth, "propertyset nesting exceeds depth limit");
                depth += 1;
                if depth == 1 && captured.is_none() && current.is_none() {
                    let name = String::from_utf8(child.local_name().as_ref().to_vec())?;
                    current = Some((name, String::new()));
                }
            }
            Event::Empty(child) => {
                if depth == 0 && captured.is_none() && current.is_none() {
                    let name = String::from_utf8(child.local_name().as_ref().to_vec())?;
                    captured = Some(Property {
                        name,
                        value: String::new(),
                    });
                }
            }
            Event::Text(text) => {
                if let Some((_, value)) = &mut current {
                    value.push_str(&text.unescape()?);
                }
            }
            Event::End(_) => {
                if depth == 0 {
                    break;
                }
                depth -= 1;
                if depth == 0 {
                    if let Some((name, value)) = current.take() {
                        captured.get_or_insert(Property { name, value });
                    }
                }
            }
            _ => (),
        }
    }
    Ok(captured)
}

#[cfg(test)]
mod tests {
    use crate::IntoXml;

    use super::{parse_timeout_seconds, PropertySet};

    #[test]
    fn parse_single_property_notify_body() {
        let body = r#"<e:propertyset xmlns:e="urn:schemas-upnp-org:event-1-0"><e:property><TransportState>PLAYING</TransportState></e:property></e:propertyset>"#;
        let set = PropertySet::parse(body.as_bytes(), 16).unwrap();
        assert_eq!(set.properties.len(), 1);
        assert_eq!(set.properties[0].name, "TransportState");
        assert_eq!(set.properties[0].value, "PLAYING");
    }

    #[test]
    fn parse_multi_property_body_keeps_order() {
        let body = r#"<e:propertyset xmlns:e="urn:schemas-upnp-org:event-1-0">
  <e:property><Volume>42</Volume></e:property>
  <e:property><Mute>0</Mute></e:property>
  <e:property><Empty/></e:property>
</e:propertyset>"#;
        let set = PropertySet::parse(body.as_bytes(), 16).unwrap();
        let names: Vec<_> = set.properties.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, ["Volume", "Mute", "Empty"]);
        assert_eq!(set.properties[2].value, "");
    }

    #[test]
    fn property_set_round_trip() {
        let set = PropertySet::single("TransportState", "PLAYING");
        let xml = set.into_string().unwrap();
        assert!(xml.contains("xmlns:e=\"urn:schemas-upnp-org:event-1-0\""));
        let parsed = PropertySet::parse(xml.as_bytes(), 16).unwrap();
        assert_eq!(parsed, set);
    }

    #[test]
    fn timeout_header_forms() {
        assert_eq!(parse_timeout_seconds("Second-60").unwrap(), Some(60));
        assert_eq!(parse_timeout_seconds("second-1800").unwrap(), Some(1800));
        assert_eq!(parse_timeout_seconds("infinite").unwrap(), None);
        assert!(parse_timeout_seconds("60").is_err());
    }
}
