use std::sync::Arc;

use axum::{
    http::{HeaderMap, Method, StatusCode},
    response::{IntoResponse, Redirect, Response},
    routing::{any, get, post},
    Router,
};
use axum_extra::headers::{self, HeaderMapExt};

use crate::{
    action::{self, SoapFault},
    clock::Clock,
    config::DlnaConfig,
    device::DeviceModel,
    eventing::{self, publisher::EventPublisher},
};

/// Axum router exposing a device: descriptor, icons, per-service SCPD,
/// control and event endpoints. `/` and `/index.html` are rewritten to the
/// descriptor path.
pub struct UpnpRouter {
    path: String,
    device_path: String,
    router: Router,
}

impl From<UpnpRouter> for Router {
    fn from(upnp_router: UpnpRouter) -> Self {
        let device_path = upnp_router.device_path.clone();
        let rewrite = move || {
            let device_path = device_path.clone();
            async move { Redirect::temporary(&device_path) }
        };
        if upnp_router.path == "/" || upnp_router.path.is_empty() {
            // the descriptor already answers on "/"
            Router::new()
                .route("/index.html", get(rewrite))
                .merge(upnp_router.router)
        } else {
            Router::new()
                .route("/", get(rewrite.clone()))
                .route("/index.html", get(rewrite))
                .nest(&upnp_router.path, upnp_router.router)
        }
    }
}

fn xml_response(body: String) -> Response {
    let mut header_map = HeaderMap::new();
    header_map.typed_insert(headers::ContentType::xml());
    (header_map, body).into_response()
}

fn soap_fault_response(fault: &SoapFault) -> Response {
    let body = action::fault_envelope(fault).unwrap_or_default();
    let mut header_map = HeaderMap::new();
    header_map.typed_insert(headers::ContentType::xml());
    (StatusCode::INTERNAL_SERVER_ERROR, header_map, body).into_response()
}

fn subscribe_response(sid: &str, seconds: u32) -> Response {
    (
        [
            ("DATE", eventing::http_date()),
            ("SERVER", crate::ssdp::UpnpAgent::default().to_string()),
            ("SID", sid.to_string()),
            ("TIMEOUT", eventing::format_timeout_seconds(seconds)),
        ],
        "",
    )
        .into_response()
}

impl UpnpRouter {
    pub fn new(
        model: Arc<DeviceModel>,
        publisher: Arc<EventPublisher>,
        clock: Clock,
        config: &DlnaConfig,
    ) -> Result<Self, crate::DlnaError> {
        let path = model.base_path().to_string();
        let description = {
            let model = model.clone();
            move || {
                let model = model.clone();
                async move {
                    tracing::debug!("Serving device description");
                    match model.description_xml() {
                        Ok(xml) => xml_response(xml),
                        Err(e) => {
                            tracing::warn!("Descriptor serialization failed: {e}");
                            StatusCode::INTERNAL_SERVER_ERROR.into_response()
                        }
                    }
                }
            }
        };
        let mut router = Router::new()
            .route("/device.xml", get(description.clone()))
            .route("/", get(description));

        for icon in model.icons() {
            let body = icon.bytes.clone();
            let mimetype = icon.mimetype.clone();
            router = router.route(
                &icon.path,
                get(move || {
                    let body = body.clone();
                    let mimetype = mimetype.clone();
                    async move { ([("content-type", mimetype)], body).into_response() }
                }),
            );
        }

        let xml_max_depth = config.xml_max_depth;
        for service in model.services() {
            // composed absolute urls must fit the configured ceiling
            model.service_path(&service.scpd_url)?;
            model.service_path(&service.control_url)?;
            model.service_path(&service.event_sub_url)?;

            let scpd_body = service.scpd_xml.clone();
            let scpd = move || {
                let body = scpd_body.clone();
                async move { xml_response(body) }
            };

            let control_service = service.clone();
            let control = move |request_headers: HeaderMap, body: String| {
                let service = control_service.clone();
                async move {
                    let soap_action = request_headers
                        .get("soapaction")
                        .and_then(|v| v.to_str().ok())
                        .map(|header| header.trim_matches('"').to_string());
                    let parsed = action::parse_action_invocation(body.as_bytes(), xml_max_depth);
                    let (invoked, arguments) = match parsed {
                        Ok(parsed) => parsed,
                        Err(e) => {
                            tracing::warn!("Rejecting malformed control request: {e:#}");
                            return soap_fault_response(&SoapFault::invalid_args());
                        }
                    };
                    if let Some(header) = &soap_action {
                        let header_action =
                            header.split_once('#').map(|(_, a)| a).unwrap_or(header);
                        if header_action != invoked {
                            tracing::warn!(
                                "Inconsistent soapaction header and payload: {header_action} vs {invoked}",
                            );
                        }
                    }
                    tracing::info!(action = %invoked, service = %service.service_id, "Action invoked");
                    let service_type = service.service_type.to_string();
                    match service.control_handler.handle_action(&invoked, arguments) {
                        Ok(out_arguments) => {
                            match action::response_envelope(&service_type, &invoked, &out_arguments)
                            {
                                Ok(xml) => xml_response(xml),
                                Err(e) => {
                                    tracing::warn!("Response serialization failed: {e}");
                                    soap_fault_response(&SoapFault::action_failed())
                                }
                            }
                        }
                        Err(fault) => soap_fault_response(&fault),
                    }
                }
            };

            let event_service_id = service.service_id.clone();
            let event_publisher = publisher.clone();
            let event = move |method: Method, request_headers: HeaderMap| {
                let service_id = event_service_id.clone();
                let publisher = event_publisher.clone();
                async move {
                    let now_ms = clock.now_ms();
                    let sid = request_headers.get("sid").and_then(|v| v.to_str().ok());
                    let callback = request_headers
                        .get("callback")
                        .and_then(|v| v.to_str().ok());
                    let nt = request_headers.get("nt").and_then(|v| v.to_str().ok());
                    let timeout = request_headers
                        .get("timeout")
                        .and_then(|v| v.to_str().ok())
                        .and_then(|v| eventing::parse_timeout_seconds(v).ok())
                        .flatten();
                    match method.as_str() {
                        "SUBSCRIBE" => {
                            // an SID next to CALLBACK/NT is a malformed request
                            if sid.is_some() && (callback.is_some() || nt.is_some()) {
                                return StatusCode::BAD_REQUEST.into_response();
                            }
                            if let Some(sid) = sid {
                                return match publisher.renew(sid, timeout, now_ms) {
                                    Ok(seconds) => subscribe_response(sid, seconds),
                                    Err(_) => StatusCode::PRECONDITION_FAILED.into_response(),
                                };
                            }
                            if nt != Some("upnp:event") {
                                return StatusCode::PRECONDITION_FAILED.into_response();
                            }
                            let Some(callback) = callback else {
                                return StatusCode::PRECONDITION_FAILED.into_response();
                            };
                            match publisher.subscribe(&service_id, callback, timeout, now_ms) {
                                Ok((sid, seconds)) => subscribe_response(&sid, seconds),
                                Err(_) => StatusCode::PRECONDITION_FAILED.into_response(),
                            }
                        }
                        "UNSUBSCRIBE" => {
                            let Some(sid) = sid else {
                                return StatusCode::PRECONDITION_FAILED.into_response();
                            };
                            match publisher.unsubscribe(sid) {
                                Ok(()) => StatusCode::OK.into_response(),
                                Err(_) => StatusCode::PRECONDITION_FAILED.into_response(),
                            }
                        }
                        _ => StatusCode::METHOD_NOT_ALLOWED.into_response(),
                    }
                }
            };

            router = router
                .route(&service.scpd_url, get(scpd))
                .route(&service.control_url, post(control))
                .route(&service.event_sub_url, any(event));
        }

        Ok(Self {
            path,
            device_path: model.device_path(),
            router,
        })
    }

    /// The absolute path prefix this router is nested under.
    pub fn path(&self) -> &str {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::{
        action::{parse_soap_response, ActionRequest, Argument, SoapResponse},
        clock::Clock,
        config::DlnaConfig,
        device::{tests::renderer_info, DeviceInfo, DeviceModel},
        eventing::publisher::EventPublisher,
    };

    use super::UpnpRouter;

    async fn spawn_device_with(info: DeviceInfo) -> (String, Arc<DeviceModel>) {
        let config = DlnaConfig::default();
        let model = DeviceModel::new(info, None, &config).unwrap();
        let publisher = Arc::new(EventPublisher::new(reqwest::Client::new(), &config));
        let router = UpnpRouter::new(model.clone(), publisher, Clock::start(), &config).unwrap();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, axum::Router::from(router)).await.unwrap();
        });
        (format!("http://{addr}"), model)
    }

    async fn spawn_device() -> (String, Arc<DeviceModel>) {
        spawn_device_with(renderer_info()).await
    }

    #[tokio::test]
    async fn descriptor_is_served_as_xml() {
        let (base, model) = spawn_device().await;
        let response = reqwest::get(format!("{base}{}", model.device_path()))
            .await
            .unwrap();
        assert!(response.status().is_success());
        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap()
            .to_string();
        assert!(content_type.contains("xml"));
        let body = response.text().await.unwrap();
        assert!(body.contains("<friendlyName>Living room renderer</friendlyName>"));
    }

    #[tokio::test]
    async fn root_is_rewritten_to_the_descriptor() {
        let (base, _model) = spawn_device().await;
        let response = reqwest::get(format!("{base}/")).await.unwrap();
        assert!(response.status().is_success());
        let body = response.text().await.unwrap();
        assert!(body.contains("urn:schemas-upnp-org:device-1-0"));
    }

    #[tokio::test]
    async fn control_post_round_trips_through_the_handler() {
        let (base, model) = spawn_device().await;
        let control_path = model.service_path("/AVTransport/control.xml").unwrap();
        let url: reqwest::Url = format!("{base}{control_path}").parse().unwrap();
        let mut request = ActionRequest::new(
            "urn:schemas-upnp-org:service:AVTransport:1",
            url.clone(),
            "Play",
        );
        request.add_argument("InstanceID", "0");
        request.add_argument("Speed", "1");

        let response = reqwest::Client::new()
            .post(url)
            .header("SOAPACTION", request.soap_action_header())
            .header("content-type", "text/xml; charset=\"utf-8\"")
            .body(request.envelope().unwrap())
            .send()
            .await
            .unwrap();
        assert!(response.status().is_success());
        let body = response.bytes().await.unwrap();
        let SoapResponse::Success { action, arguments } = parse_soap_response(&body, 16).unwrap()
        else {
            panic!("expected success response");
        };
        assert_eq!(action, "Play");
        assert!(arguments.is_empty());
    }

    #[tokio::test]
    async fn subscribe_issues_sid_and_unsubscribe_clears_it() {
        let (base, model) = spawn_device().await;
        let event_path = model.service_path("/AVTransport/event.xml").unwrap();
        let url = format!("{base}{event_path}");
        let client = reqwest::Client::new();
        let subscribe = reqwest::Method::from_bytes(b"SUBSCRIBE").unwrap();
        let unsubscribe = reqwest::Method::from_bytes(b"UNSUBSCRIBE").unwrap();

        let response = client
            .request(subscribe.clone(), &url)
            .header("CALLBACK", "<http://127.0.0.1:9877/callback>")
            .header("NT", "upnp:event")
            .header("TIMEOUT", "Second-60")
            .send()
            .await
            .unwrap();
        assert!(response.status().is_success());
        let sid = response
            .headers()
            .get("SID")
            .and_then(|v| v.to_str().ok())
            .unwrap()
            .to_string();
        assert_eq!(
            response
                .headers()
                .get("TIMEOUT")
                .and_then(|v| v.to_str().ok()),
            Some("Second-60")
        );

        // renewal via SID keeps working
        let response = client
            .request(subscribe.clone(), &url)
            .header("SID", &sid)
            .header("TIMEOUT", "Second-120")
            .send()
            .await
            .unwrap();
        assert!(response.status().is_success());

        // SID combined with CALLBACK is refused
        let response = client
            .request(subscribe, &url)
            .header("SID", &sid)
            .header("CALLBACK", "<http://127.0.0.1:9877/callback>")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);

        let response = client
            .request(unsubscribe.clone(), &url)
            .header("SID", &sid)
            .send()
            .await
            .unwrap();
        assert!(response.status().is_success());
        let response = client
            .request(unsubscribe, &url)
            .header("SID", &sid)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::PRECONDITION_FAILED);
    }

    #[tokio::test]
    async fn malformed_control_body_yields_invalid_args_fault() {
        let (base, model) = spawn_device().await;
        let control_path = model.service_path("/AVTransport/control.xml").unwrap();
        let response = reqwest::Client::new()
            .post(format!("{base}{control_path}"))
            .header("SOAPACTION", "\"urn:x#Nonsense\"")
            .body("this is not xml")
            .send()
            .await
            .unwrap();
        assert_eq!(
            response.status(),
            reqwest::StatusCode::INTERNAL_SERVER_ERROR
        );
        let body = response.bytes().await.unwrap();
        let SoapResponse::Fault(fault) = parse_soap_response(&body, 16).unwrap() else {
            panic!("expected fault");
        };
        assert_eq!(fault.error_code, Some(402));
    }

    #[tokio::test]
    async fn handler_fault_is_propagated() {
        use crate::action::SoapFault;
        use crate::device::ServiceInfo;
        use crate::urn::{ServiceType, URN};

        let mut info = renderer_info();
        info.services.clear();
        info.add_service(ServiceInfo::new(
            URN::upnp_service(ServiceType::AVTransport, 1),
            |_action: &str, _args: Vec<Argument>| Err(SoapFault::invalid_action()),
        ));
        let (base, model) = spawn_device_with(info).await;

        let control_path = model.service_path("/AVTransport/control.xml").unwrap();
        let url: reqwest::Url = format!("{base}{control_path}").parse().unwrap();
        let mut request = ActionRequest::new(
            "urn:schemas-upnp-org:service:AVTransport:1",
            url.clone(),
            "Stop",
        );
        request.add_argument("InstanceID", "0");
        let response = reqwest::Client::new()
            .post(url)
            .header("SOAPACTION", request.soap_action_header())
            .body(request.envelope().unwrap())
            .send()
            .await
            .unwrap();
        let body = response.bytes().await.unwrap();
        let SoapResponse::Fault(fault) = parse_soap_response(&body, 16).unwrap() else {
            panic!("expected fault");
        };
        assert_eq!(fault.error_code, Some(401));
    }
}
