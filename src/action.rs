use core::str;

use quick_xml::events::{BytesDecl, BytesStart, BytesText, Event};

use crate::{device_description::write_leaf, XmlReaderExt};

/// Single SOAP argument. Values travel as UTF-8 text regardless of the
/// declared state variable type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Argument {
    pub name: String,
    pub value: String,
}

impl Argument {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

fn upsert(arguments: &mut Vec<Argument>, arg: Argument) {
    if let Some(existing) = arguments.iter_mut().find(|a| a.name == arg.name) {
        existing.value = arg.value;
    } else {
        arguments.push(arg);
    }
}

/// A request to invoke a remote service action. The service type is the
/// exact string from the service descriptor; it becomes both the action
/// namespace and the SOAPACTION header.
#[derive(Debug, Clone)]
pub struct ActionRequest {
    pub service_type: String,
    pub control_url: reqwest::Url,
    pub action: String,
    pub arguments: Vec<Argument>,
    /// Number of output arguments the caller expects; replies with fewer
    /// are logged but still returned.
    pub expected_result_count: usize,
}

impl ActionRequest {
    pub fn new(
        service_type: impl Into<String>,
        control_url: reqwest::Url,
        action: impl Into<String>,
    ) -> Self {
        Self {
            service_type: service_type.into(),
            control_url,
            action: action.into(),
            arguments: Vec::new(),
            expected_result_count: 0,
        }
    }

    /// Add an input argument. Names are unique within the request; adding
    /// under an existing name overwrites the previous value.
    pub fn add_argument(&mut self, name: impl Into<String>, value: impl Into<String>) {
        upsert(&mut self.arguments, Argument::new(name, value));
    }

    pub fn soap_action_header(&self) -> String {
        format!("\"{}#{}\"", self.service_type, self.action)
    }

    /// SOAP 1.1 envelope with `u:<action>` in the service type namespace.
    pub fn envelope(&self) -> anyhow::Result<String> {
        let mut w = quick_xml::Writer::new(Vec::new());
        w.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
        let envelope = BytesStart::new("s:Envelope").with_attributes([
            ("xmlns:s", "http://schemas.xmlsoap.org/soap/envelope/"),
            (
                "s:encodingStyle",
                "http://schemas.xmlsoap.org/soap/encoding/",
            ),
        ]);
        let envelope_end = envelope.to_end().into_owned();
        w.write_event(Event::Start(envelope))?;
        let body = BytesStart::new("s:Body");
        let body_end = body.to_end().into_owned();
        w.write_event(Event::Start(body))?;

        let action_name = format!("u:{}", self.action);
        let action = BytesStart::new(&action_name)
            .with_attributes([("xmlns:u", self.service_type.as_str())]);
        let action_end = action.to_end().into_owned();
        w.write_event(Event::Start(action))?;
        for argument in &self.arguments {
            write_leaf(&mut w, &argument.name, &argument.value)?;
        }
        w.write_event(Event::End(action_end))?;

        w.write_event(Event::End(body_end))?;
        w.write_event(Event::End(envelope_end))?;
        Ok(String::from_utf8(w.into_inner())?)
    }
}

/// Outcome of an action invocation. Peer rejections keep the reply
/// inspectable instead of surfacing as errors: `valid` turns false and the
/// fault detail is preserved.
#[derive(Debug, Clone, Default)]
pub struct ActionReply {
    pub arguments: Vec<Argument>,
    valid: bool,
    pub fault: Option<SoapFault>,
}

impl ActionReply {
    pub fn success(arguments: Vec<Argument>) -> Self {
        Self {
            arguments,
            valid: true,
            fault: None,
        }
    }

    pub fn failure(fault: Option<SoapFault>) -> Self {
        Self {
            arguments: Vec::new(),
            valid: false,
            fault,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn add_argument(&mut self, arg: Argument) {
        upsert(&mut self.arguments, arg);
    }

    /// Merge another reply into this one; invalidity is contagious.
    pub fn merge(&mut self, other: ActionReply) {
        if !other.valid {
            self.valid = false;
            if self.fault.is_none() {
                self.fault = other.fault;
            }
        }
        for arg in other.arguments {
            self.add_argument(arg);
        }
    }

    pub fn find_argument(&self, name: &str) -> Option<&str> {
        self.arguments
            .iter()
            .find(|a| a.name == name)
            .map(|a| a.value.as_str())
    }

    pub fn int_argument(&self, name: &str) -> Option<i64> {
        self.find_argument(name).map(parse_int_prefix)
    }
}

/// UPnP error carried inside a SOAP fault.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SoapFault {
    pub fault_code: String,
    pub fault_string: String,
    pub error_code: Option<u32>,
    pub error_description: Option<String>,
}

impl SoapFault {
    pub fn upnp_error(code: u32, description: impl Into<String>) -> Self {
        Self {
            fault_code: "s:Client".to_string(),
            fault_string: "UPnPError".to_string(),
            error_code: Some(code),
            error_description: Some(description.into()),
        }
    }

    pub fn invalid_action() -> Self {
        Self::upnp_error(401, "Invalid Action")
    }

    pub fn invalid_args() -> Self {
        Self::upnp_error(402, "Invalid Args")
    }

    pub fn action_failed() -> Self {
        Self::upnp_error(501, "Action Failed")
    }
}

impl std::fmt::Display for SoapFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.fault_string, self.fault_code)?;
        if let Some(code) = self.error_code {
            write!(f, ": error {code}")?;
        }
        if let Some(description) = &self.error_description {
            write!(f, " {description}")?;
        }
        Ok(())
    }
}

impl std::error::Error for SoapFault {}

/// Parsed SOAP response body: either the `<Action>Response` output
/// arguments or a fault.
#[derive(Debug)]
pub enum SoapResponse {
    Success {
        action: String,
        arguments: Vec<Argument>,
    },
    Fault(SoapFault),
}

/// Locate `s:Body`, then the first child whose local name ends with
/// `Response` or equals `Fault`, and return its children. Unknown siblings
/// are skipped, nesting deeper than `max_depth` is refused.
pub fn parse_soap_response(raw_xml: &[u8], max_depth: usize) -> anyhow::Result<SoapResponse> {
    let mut r = quick_xml::Reader::from_reader(raw_xml);

    let envelope = r.read_to_start()?.into_owned();
    anyhow::ensure!(envelope.local_name().as_ref() == b"Envelope");
    let body = r.read_to_start()?.into_owned();
    anyhow::ensure!(body.local_name().as_ref() == b"Body");

    let payload = loop {
        let start = r.read_to_start()?.into_owned();
        let local = start.local_name();
        let local = str::from_utf8(local.as_ref())?;
        if local == "Fault" {
            break SoapResponse::Fault(parse_fault(&mut r, max_depth)?);
        }
        if let Some(action) = local.strip_suffix("Response") {
            let arguments = read_argument_children(&mut r, start.name(), max_depth)?;
            break SoapResponse::Success {
                action: action.to_string(),
                arguments,
            };
        }
        r.read_to_end(start.name())?;
    };

    Ok(payload)
}

/// Device side: pull the invoked action and its input arguments out of a
/// control POST body.
pub fn parse_action_invocation(
    raw_xml: &[u8],
    max_depth: usize,
) -> anyhow::Result<(String, Vec<Argument>)> {
    let mut r = quick_xml::Reader::from_reader(raw_xml);
    let envelope = r.read_to_start()?.into_owned();
    anyhow::ensure!(envelope.local_name().as_ref() == b"Envelope");
    let body = r.read_to_start()?.into_owned();
    anyhow::ensure!(body.local_name().as_ref() == b"Body");
    let action = r.read_to_start()?.into_owned();
    let name = str::from_utf8(action.local_name().as_ref())?.to_string();
    let arguments = read_argument_children(&mut r, action.name(), max_depth)?;
    Ok((name, arguments))
}

fn read_argument_children(
    r: &mut quick_xml::Reader<&[u8]>,
    parent: quick_xml::name::QName,
    max_depth: usize,
) -> anyhow::Result<Vec<Argument>> {
    let parent = parent.as_ref().to_vec();
    let mut arguments = Vec::new();
    let mut depth = 0usize;
    let mut current: Option<(String, String)> = None;
    loop {
        match r.read_event_err_eof()?.into_owned() {
            Event::Start(var) => {
                anyhow::ensure!(depth < max_depth, "argument nesting exceeds depth limit");
                depth += 1;
                if depth == 1 {
                    let name = str::from_utf8(var.local_name().as_ref())?.to_string();
                    current = Some((name, String::new()));
                }
            }
            Event::Empty(var) => {
                if depth == 0 {
                    let name = str::from_utf8(var.local_name().as_ref())?.to_string();
                    upsert(&mut arguments, Argument::new(name, ""));
                }
            }
            Event::Text(text) => {
                if let Some((_, value)) = &mut current {
                    value.push_str(&text.unescape()?);
                }
            }
            Event::CData(data) => {
                if let Some((_, value)) = &mut current {
                    value.push_str(str::from_utf8(&data.into_inner())?);
                }
            }
            Event::End(end) => {
                if depth == 0 {
                    anyhow::ensure!(end.name().as_ref() == parent.as_slice());
                    break;
                }
                depth -= 1;
                if depth == 0 {
                    if let Some((name, value)) = current.take() {
                        upsert(&mut arguments, Argument { name, value });
                    }
                }
            }
            _ => (),
        }
    }
    Ok(arguments)
}

fn parse_fault(r: &mut quick_xml::Reader<&[u8]>, max_depth: usize) -> anyhow::Result<SoapFault> {
    let mut fault_code = String::new();
    let mut fault_string = String::new();
    let mut error_code = None;
    let mut error_description = None;
    let mut depth = 0usize;
    loop {
        match r.read_event_err_eof()? {
            Event::Start(start) => {
                anyhow::ensure!(depth < max_depth, "fault nesting exceeds depth limit");
                depth += 1;
                let start = start.to_owned();
                match start.local_name().as_ref() {
                    b"faultcode" => {
                        fault_code = r.read_text(start.name())?.into_owned();
                        depth -= 1;
                    }
                    b"faultstring" => {
                        fault_string = r.read_text(start.name())?.into_owned();
                        depth -= 1;
                    }
                    b"errorCode" => {
                        error_code = r.read_text(start.name())?.parse().ok();
                        depth -= 1;
                    }
                    b"errorDescription" => {
                        error_description = Some(r.read_text(start.name())?.into_owned());
                        depth -= 1;
                    }
                    _ => (),
                }
            }
            Event::End(end) => {
                if end.local_name().as_ref() == b"Fault" {
                    break;
                }
                depth = depth.saturating_sub(1);
            }
            _ => (),
        }
    }
    Ok(SoapFault {
        fault_code,
        fault_string,
        error_code,
        error_description,
    })
}

/// Device side: wrap output arguments into a `<Action>Response` envelope.
pub fn response_envelope(
    service_type: &str,
    action: &str,
    arguments: &[Argument],
) -> anyhow::Result<String> {
    let mut request = ActionRequest::new(
        service_type,
        reqwest::Url::parse("http://unused.invalid/").expect("static url to parse"),
        format!("{action}Response"),
    );
    request.arguments = arguments.to_vec();
    request.envelope()
}

/// Device side: standard UPnP fault envelope.
pub fn fault_envelope(fault: &SoapFault) -> anyhow::Result<String> {
    let mut w = quick_xml::Writer::new(Vec::new());
    w.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
    let envelope = BytesStart::new("s:Envelope").with_attributes([
        ("xmlns:s", "http://schemas.xmlsoap.org/soap/envelope/"),
        (
            "s:encodingStyle",
            "http://schemas.xmlsoap.org/soap/encoding/",
        ),
    ]);
    let envelope_end = envelope.to_end().into_owned();
    w.write_event(Event::Start(envelope))?;
    let body = BytesStart::new("s:Body");
    let body_end = body.to_end().into_owned();
    w.write_event(Event::Start(body))?;
    let fault_start = BytesStart::new("s:Fault");
    let fault_end = fault_start.to_end().into_owned();
    w.write_event(Event::Start(fault_start))?;
    write_leaf(&mut w, "faultcode", &fault.fault_code)?;
    write_leaf(&mut w, "faultstring", &fault.fault_string)?;
    w.create_element("detail").write_inner_content(|w| -> anyhow::Result<()> {
        let upnp_error = BytesStart::new("UPnPError")
            .with_attributes([("xmlns", "urn:schemas-upnp-org:control-1-0")]);
        let upnp_error_end = upnp_error.to_end().into_owned();
        w.write_event(Event::Start(upnp_error))?;
        if let Some(code) = fault.error_code {
            w.create_element("errorCode")
                .write_text_content(BytesText::new(&code.to_string()))?;
        }
        if let Some(description) = &fault.error_description {
            w.create_element("errorDescription")
                .write_text_content(BytesText::new(description))?;
        }
        w.write_event(Event::End(upnp_error_end))?;
        Ok(())
    })?;
    w.write_event(Event::End(fault_end))?;
    w.write_event(Event::End(body_end))?;
    w.write_event(Event::End(envelope_end))?;
    Ok(String::from_utf8(w.into_inner())?)
}

/// atoi-style integer prefix parse: optional sign, leading zeros allowed,
/// stops at the first non-digit. No digits yields 0.
pub fn parse_int_prefix(s: &str) -> i64 {
    let s = s.trim_start();
    let (negative, digits) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s.strip_prefix('+').unwrap_or(s)),
    };
    let mut value: i64 = 0;
    for c in digits.chars() {
        let Some(digit) = c.to_digit(10) else {
            break;
        };
        value = value.saturating_mul(10).saturating_add(digit as i64);
    }
    if negative {
        -value
    } else {
        value
    }
}

/// Parse a transport time value (`H:MM:SS`, `MM:SS` or `SS`) into
/// milliseconds. Unparseable input yields 0.
pub fn parse_time_ms(s: &str) -> u64 {
    let mut parts = s.split(':').map(parse_int_prefix);
    let (h, m, s) = match s.matches(':').count() {
        2 => (
            parts.next().unwrap_or(0),
            parts.next().unwrap_or(0),
            parts.next().unwrap_or(0),
        ),
        1 => (0, parts.next().unwrap_or(0), parts.next().unwrap_or(0)),
        _ => (0, 0, parts.next().unwrap_or(0)),
    };
    let total = h.max(0) as u64 * 3600 + m.max(0) as u64 * 60 + s.max(0) as u64;
    total * 1000
}

/// Render milliseconds as `H:MM:SS` for transport time arguments.
pub fn format_time_ms(ms: u64) -> String {
    let total = ms / 1000;
    format!(
        "{}:{:02}:{:02}",
        total / 3600,
        (total % 3600) / 60,
        total % 60
    )
}
