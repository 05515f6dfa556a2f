use std::net::IpAddr;

use axum::{
    http::{HeaderMap, Method, StatusCode},
    response::IntoResponse,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    action::{ActionReply, ActionRequest},
    clock::Clock,
    config::{http_client, DlnaConfig},
    device_description::Udn,
    discovery::{DeviceFilter, DiscoveredDevice, DiscoveryEngine},
    eventing::subscription::{NotifyCallback, SubscriptionKey, SubscriptionManager},
    request_parser::RequestParser,
    schedule::{CpEvent, NotifyReplyCp, Schedule, ScheduleKind, ScheduleQueue},
    soap_client::SoapInvoker,
    ssdp::{NotificationType, SSDP_ADDR},
    udp::{UdpTransport, MAX_DATAGRAM_LEN},
    DlnaError,
};

/// NOTIFY delivered to the callback endpoint, handed from the HTTP task to
/// the loop.
#[derive(Debug)]
struct InboundNotify {
    sid: String,
    seq: u32,
    body: String,
}

/// Control point facade: discovers devices, invokes their actions and
/// manages event subscriptions. All state changes happen on the loop that
/// calls [run_once](DlnaControlPoint::run_once).
pub struct DlnaControlPoint<U: UdpTransport> {
    udp: U,
    queue: ScheduleQueue,
    events_rx: mpsc::UnboundedReceiver<CpEvent>,
    notify_rx: mpsc::UnboundedReceiver<InboundNotify>,
    parser: RequestParser,
    discovery: DiscoveryEngine,
    subscriptions: SubscriptionManager,
    invoker: SoapInvoker,
    clock: Clock,
    config: DlnaConfig,
    cancellation: CancellationToken,
    last_scheduler_run_ms: Option<u64>,
    last_subscription_run_ms: Option<u64>,
    recv_buf: Vec<u8>,
}

impl<U: UdpTransport> DlnaControlPoint<U> {
    /// Start the notification endpoint on `listener`, bind the reply
    /// socket and enqueue the initial searches. `callback_ip` overrides
    /// the autodetected address control points hand out in CALLBACK urls.
    pub async fn begin(
        udp: U,
        listener: tokio::net::TcpListener,
        filter: DeviceFilter,
        callback_ip: Option<IpAddr>,
        config: DlnaConfig,
    ) -> Result<Self, DlnaError> {
        let clock = Clock::start();
        let callback_ip = match callback_ip {
            Some(ip) => ip,
            None => crate::udp::resolve_local_addr().await.map_err(|e| {
                DlnaError::Config(format!("cannot determine callback address: {e}"))
            })?,
        };
        let callback_port = listener.local_addr()?.port();
        let callback_url = format!("http://{callback_ip}:{callback_port}/callback");

        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        let handler = move |method: Method, headers: HeaderMap, body: String| {
            let notify_tx = notify_tx.clone();
            async move {
                if method.as_str() != "NOTIFY" {
                    return StatusCode::METHOD_NOT_ALLOWED.into_response();
                }
                let Some(sid) = headers.get("sid").and_then(|v| v.to_str().ok()) else {
                    return StatusCode::PRECONDITION_FAILED.into_response();
                };
                let seq = headers
                    .get("seq")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(0);
                let _ = notify_tx.send(InboundNotify {
                    sid: sid.to_string(),
                    seq,
                    body,
                });
                StatusCode::OK.into_response()
            }
        };
        let router =
            axum::Router::new().route("/callback", axum::routing::any(handler));
        let cancellation = CancellationToken::new();
        let server_cancellation = cancellation.clone();
        tokio::spawn(async move {
            let serve = axum::serve(listener, router)
                .with_graceful_shutdown(async move { server_cancellation.cancelled().await });
            if let Err(e) = serve.await {
                tracing::warn!("Notification endpoint failed: {e}");
            }
        });

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let mut queue = ScheduleQueue::new(config.multi_msg_delay_ms).with_events(events_tx);
        let now = clock.now_ms();
        queue.push(
            Schedule::new(ScheduleKind::MSearch {
                dest: SSDP_ADDR,
                st: NotificationType::All,
                mx: 2,
            })
            .at(now),
        );
        if let Some(st) = filter
            .device_type
            .as_deref()
            .and_then(|t| t.parse::<crate::urn::URN>().ok())
        {
            queue.push(
                Schedule::new(ScheduleKind::MSearch {
                    dest: SSDP_ADDR,
                    st: NotificationType::Urn(st),
                    mx: 2,
                })
                .at(now),
            );
        }

        let client = http_client(&config)?;
        Ok(Self {
            udp,
            queue,
            events_rx,
            notify_rx,
            parser: RequestParser::new(&config),
            discovery: DiscoveryEngine::new(client.clone(), filter),
            subscriptions: SubscriptionManager::new(client.clone(), callback_url, &config),
            invoker: SoapInvoker::new(client, &config),
            clock,
            config,
            cancellation,
            last_scheduler_run_ms: None,
            last_subscription_run_ms: None,
            recv_buf: vec![0; MAX_DATAGRAM_LEN],
        })
    }

    /// One cooperative iteration: socket → parser → queue, then the
    /// observation channel into discovery/eventing, then renewals.
    pub async fn run_once(&mut self) {
        let now = self.clock.now_ms();
        loop {
            match self.udp.try_recv_from(&mut self.recv_buf) {
                Ok(Some((read, peer))) => {
                    let data = self.recv_buf[..read].to_vec();
                    if let Some(schedule) = self.parser.parse_control_point(&data, peer, now) {
                        self.queue.push(schedule);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!("UDP receive failed: {e}");
                    break;
                }
            }
        }
        if self
            .last_scheduler_run_ms
            .is_none_or(|last| now.saturating_sub(last) >= self.config.run_scheduler_every_ms)
        {
            self.last_scheduler_run_ms = Some(now);
            self.queue.tick(now, &self.udp).await;
        }
        while let Ok(event) = self.events_rx.try_recv() {
            self.handle_event(event, now).await;
        }
        while let Ok(notify) = self.notify_rx.try_recv() {
            self.subscriptions
                .deliver_notify(&notify.sid, notify.seq, notify.body.as_bytes());
        }
        if self
            .last_subscription_run_ms
            .is_none_or(|last| now.saturating_sub(last) >= self.config.run_subscriptions_every_ms)
        {
            self.last_subscription_run_ms = Some(now);
            self.subscriptions.tick(now).await;
        }
    }

    async fn handle_event(&mut self, event: CpEvent, now_ms: u64) {
        match event {
            CpEvent::SearchReply(reply) => {
                self.discovery.observe_search_reply(&reply, now_ms).await;
            }
            CpEvent::Notify(NotifyReplyCp::Alive { location, usn, .. }) => {
                self.discovery.observe_alive(&location, &usn, now_ms).await;
            }
            CpEvent::Notify(NotifyReplyCp::ByeBye { usn, .. }) => {
                if let Some(udn) = self.discovery.observe_byebye(&usn) {
                    self.subscriptions.cancel_for_device(&udn);
                }
            }
            CpEvent::Notify(NotifyReplyCp::PropChange { sid, seq, payload, .. }) => {
                self.subscriptions
                    .deliver_notify(&sid, seq, payload.as_bytes());
            }
        }
    }

    /// Block until either a matching device is known and `min_ms` elapsed,
    /// or `max_ms` ran out. Returns whether a match exists.
    pub async fn wait_for_devices(&mut self, min_ms: u64, max_ms: u64) -> bool {
        let started = self.clock.now_ms();
        loop {
            self.run_once().await;
            let elapsed = self.clock.now_ms().saturating_sub(started);
            if self.discovery.matching_count() > 0 && elapsed >= min_ms {
                return true;
            }
            if elapsed >= max_ms {
                return self.discovery.matching_count() > 0;
            }
            self.clock.sleep_ms(self.config.loop_delay_ms).await;
        }
    }

    /// Snapshot of the live device table.
    pub fn devices(&self) -> Vec<DiscoveredDevice> {
        self.discovery.devices().into_iter().cloned().collect()
    }

    pub fn device(&self, udn: &Udn) -> Option<DiscoveredDevice> {
        self.discovery.get(udn).cloned()
    }

    /// Build an [ActionRequest] against a discovered device's service,
    /// with the control url resolved and the exact service type attached.
    pub fn action_request(
        &self,
        udn: &Udn,
        service_id: &str,
        action: impl Into<String>,
    ) -> Result<ActionRequest, DlnaError> {
        let device = self
            .discovery
            .get(udn)
            .ok_or(DlnaError::State("unknown device"))?;
        let service = device
            .service_by_id(service_id)
            .ok_or(DlnaError::State("unknown service"))?;
        let control_url = device
            .control_url(service)
            .map_err(DlnaError::Protocol)?;
        Ok(ActionRequest::new(
            service.service_type.clone(),
            control_url,
            action,
        ))
    }

    /// Run a SOAP action; sequential from the caller's point of view.
    pub async fn invoke(&self, request: &ActionRequest) -> Result<ActionReply, DlnaError> {
        self.invoker.invoke(request).await
    }

    /// Subscribe to a service's events; `callback` fires once per changed
    /// variable.
    pub async fn subscribe(
        &mut self,
        udn: &Udn,
        service_id: &str,
        callback: NotifyCallback,
        timeout_seconds: u32,
    ) -> Result<String, DlnaError> {
        let device = self
            .discovery
            .get(udn)
            .ok_or(DlnaError::State("unknown device"))?;
        let service = device
            .service_by_id(service_id)
            .ok_or(DlnaError::State("unknown service"))?;
        let event_url = device.event_url(service).map_err(DlnaError::Protocol)?;
        let key = SubscriptionKey {
            udn: udn.clone(),
            service_id: service.service_id.clone(),
        };
        let now = self.clock.now_ms();
        self.subscriptions
            .subscribe(key, event_url, timeout_seconds, callback, now)
            .await
    }

    pub async fn unsubscribe(&mut self, udn: &Udn, service_id: &str) -> Result<(), DlnaError> {
        let key = SubscriptionKey {
            udn: udn.clone(),
            service_id: service_id.to_string(),
        };
        let now = self.clock.now_ms();
        // the manager stores full service ids; retry with the resolved one
        if self.subscriptions.state(&key).is_none() {
            if let Some(service) = self
                .discovery
                .get(udn)
                .and_then(|d| d.service_by_id(service_id))
            {
                let key = SubscriptionKey {
                    udn: udn.clone(),
                    service_id: service.service_id.clone(),
                };
                return self.subscriptions.unsubscribe(&key, now).await;
            }
        }
        self.subscriptions.unsubscribe(&key, now).await
    }

    /// Stop the notification endpoint. Subscriptions are cancelled
    /// best-effort first.
    pub async fn stop(&mut self) {
        let keys: Vec<SubscriptionKey> = self
            .devices()
            .iter()
            .flat_map(|d| {
                d.services.iter().map(|s| SubscriptionKey {
                    udn: d.udn.clone(),
                    service_id: s.service_id.clone(),
                })
            })
            .collect();
        let now = self.clock.now_ms();
        for key in keys {
            if self.subscriptions.state(&key).is_some() {
                let _ = self.subscriptions.unsubscribe(&key, now).await;
            }
        }
        self.cancellation.cancel();
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;
    use std::sync::{Arc, Mutex};

    use crate::{
        clock::Clock,
        config::DlnaConfig,
        device::{tests::renderer_info, DeviceModel},
        device_description::Udn,
        discovery::DeviceFilter,
        eventing::{publisher::EventPublisher, PropertySet, SubscriptionState},
        router::UpnpRouter,
        udp::mock::MockUdp,
    };

    use super::DlnaControlPoint;

    struct TestDevice {
        base: String,
        model: std::sync::Arc<DeviceModel>,
        publisher: Arc<EventPublisher>,
    }

    /// A real device surface (descriptor + control + eventing) bound to
    /// the loopback for the control point to talk to.
    async fn spawn_device(config: &DlnaConfig) -> TestDevice {
        let mut info = renderer_info();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        info.base_url = format!("http://{addr}/dlna");
        let model = DeviceModel::new(info, None, config).unwrap();
        let publisher = Arc::new(EventPublisher::new(reqwest::Client::new(), config));
        let router = UpnpRouter::new(model.clone(), publisher.clone(), Clock::start(), config).unwrap();
        tokio::spawn(async move {
            axum::serve(listener, axum::Router::from(router)).await.unwrap();
        });
        TestDevice {
            base: format!("http://{addr}"),
            model,
            publisher,
        }
    }

    fn fast_config() -> DlnaConfig {
        let mut config = DlnaConfig::default().with_multi_msg_delay_ms(0);
        config.run_scheduler_every_ms = 0;
        config.run_subscriptions_every_ms = 0;
        config.loop_delay_ms = 1;
        config
    }

    fn search_reply_frame(location: &str) -> String {
        format!(
            "HTTP/1.1 200 OK\r\n\
CACHE-CONTROL: max-age=1800\r\n\
EXT:\r\n\
LOCATION: {location}\r\n\
SERVER: test\r\n\
ST: upnp:rootdevice\r\n\
USN: uuid:0aa02144-59fb-4fd7-b179-a7c07357dba8::upnp:rootdevice\r\n\
CONTENT-LENGTH: 0\r\n\r\n"
        )
    }

    fn udn() -> Udn {
        "uuid:0aa02144-59fb-4fd7-b179-a7c07357dba8".parse().unwrap()
    }

    #[tokio::test]
    async fn discovery_invoke_and_eventing_end_to_end() {
        let config = fast_config();
        let device = spawn_device(&config).await;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let udp = MockUdp::new(Ipv4Addr::new(127, 0, 0, 1));
        let mut cp = DlnaControlPoint::begin(
            udp,
            listener,
            DeviceFilter::device_type("MediaRenderer"),
            Some("127.0.0.1".parse().unwrap()),
            config,
        )
        .await
        .unwrap();

        // search went out on the queue
        cp.run_once().await;
        assert!(cp
            .udp
            .sent()
            .iter()
            .any(|(frame, _)| frame.starts_with("M-SEARCH * HTTP/1.1\r\n")));

        // the device answers with its location; the reply flows through
        // parser -> queue -> discovery
        let location = format!("{}{}", device.base, device.model.device_path());
        cp.udp.queue_inbound(
            search_reply_frame(&location).into_bytes(),
            "127.0.0.1:1900".parse().unwrap(),
        );
        for _ in 0..5 {
            cp.run_once().await;
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert!(cp.wait_for_devices(0, 500).await);
        let devices = cp.devices();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].udn, udn());

        // SOAP invocation against the discovered control url
        let mut request = cp.action_request(&udn(), "AVTransport", "Play").unwrap();
        request.add_argument("InstanceID", "0");
        request.add_argument("Speed", "1");
        let reply = cp.invoke(&request).await.unwrap();
        assert!(reply.is_valid());

        // subscribe, then have the device publish a change
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let sid = cp
            .subscribe(
                &udn(),
                "AVTransport",
                Arc::new(move |sid, name, value| {
                    sink.lock().unwrap().push((
                        sid.to_string(),
                        name.to_string(),
                        value.to_string(),
                    ));
                }),
                60,
            )
            .await
            .unwrap();
        assert!(sid.starts_with("uuid:"));

        device
            .publisher
            .notify_all(
                "urn:upnp-org:serviceId:AVTransport",
                &PropertySet::single("TransportState", "PLAYING"),
            )
            .await;
        for _ in 0..20 {
            cp.run_once().await;
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            if !seen.lock().unwrap().is_empty() {
                break;
            }
        }
        let events = seen.lock().unwrap().clone();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].1, "TransportState");
        assert_eq!(events[0].2, "PLAYING");

        // and cleanly unsubscribe
        cp.unsubscribe(&udn(), "AVTransport").await.unwrap();
        cp.stop().await;
    }

    #[tokio::test]
    async fn byebye_drops_device_and_subscription() {
        let config = fast_config();
        let device = spawn_device(&config).await;
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let udp = MockUdp::new(Ipv4Addr::new(127, 0, 0, 1));
        let mut cp = DlnaControlPoint::begin(
            udp,
            listener,
            DeviceFilter::any(),
            Some("127.0.0.1".parse().unwrap()),
            config,
        )
        .await
        .unwrap();

        let location = format!("{}{}", device.base, device.model.device_path());
        cp.udp.queue_inbound(
            search_reply_frame(&location).into_bytes(),
            "127.0.0.1:1900".parse().unwrap(),
        );
        assert!(cp.wait_for_devices(0, 500).await);

        cp.subscribe(&udn(), "AVTransport", Arc::new(|_, _, _| {}), 60)
            .await
            .unwrap();

        let byebye = "NOTIFY * HTTP/1.1\r\n\
HOST: 239.255.255.250:1900\r\n\
NT: upnp:rootdevice\r\n\
NTS: ssdp:byebye\r\n\
USN: uuid:0aa02144-59fb-4fd7-b179-a7c07357dba8::upnp:rootdevice\r\n\r\n";
        cp.udp
            .queue_inbound(byebye.as_bytes().to_vec(), "127.0.0.1:1900".parse().unwrap());
        for _ in 0..5 {
            cp.run_once().await;
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert!(cp.devices().is_empty());
        let key = crate::eventing::subscription::SubscriptionKey {
            udn: udn(),
            service_id: "urn:upnp-org:serviceId:AVTransport".to_string(),
        };
        assert_eq!(
            cp.subscriptions.state(&key),
            Some(SubscriptionState::Unsubscribed)
        );
    }

    #[tokio::test]
    async fn wait_for_devices_times_out_without_matches() {
        let config = fast_config();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let udp = MockUdp::new(Ipv4Addr::new(127, 0, 0, 1));
        let mut cp = DlnaControlPoint::begin(
            udp,
            listener,
            DeviceFilter::device_type("MediaRenderer"),
            Some("127.0.0.1".parse().unwrap()),
            config,
        )
        .await
        .unwrap();
        assert!(!cp.wait_for_devices(0, 100).await);
    }
}
