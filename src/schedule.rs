use std::{net::SocketAddr, sync::Arc, time::Duration};

use tokio::sync::mpsc;

use crate::{
    config::same_subnet,
    device::DeviceModel,
    ssdp::{
        NotificationType, NotifyAliveMessage, NotifyByeByeMessage, SearchMessage, SearchResponse,
        SSDP_ADDR, USN,
    },
    udp::UdpTransport,
};

/// Observation synthesised from an inbound search reply, consumed by the
/// discovery engine.
#[derive(Debug, Clone)]
pub struct MSearchReplyCp {
    pub location: String,
    pub usn: USN,
    pub st: NotificationType,
}

/// Observation synthesised from an inbound notification, consumed by the
/// discovery engine and the subscription manager.
#[derive(Debug, Clone)]
pub enum NotifyReplyCp {
    Alive {
        location: String,
        usn: USN,
        nt: NotificationType,
        cache_control: u32,
    },
    ByeBye {
        usn: USN,
        nt: NotificationType,
    },
    PropChange {
        delivery_host: String,
        delivery_path: String,
        sid: String,
        seq: u32,
        payload: String,
    },
}

/// Events leaving the queue towards the control point loop.
#[derive(Debug, Clone)]
pub enum CpEvent {
    SearchReply(MSearchReplyCp),
    Notify(NotifyReplyCp),
}

/// What a schedule does when it fires.
pub enum ScheduleKind {
    /// Send an M-SEARCH request.
    MSearch {
        dest: SocketAddr,
        st: NotificationType,
        mx: u8,
    },
    /// Answer an M-SEARCH with the matching burst of 200 OK datagrams.
    MSearchReply {
        device: Arc<DeviceModel>,
        peer: SocketAddr,
        st: NotificationType,
        netmask: std::net::Ipv4Addr,
        max_age: u32,
    },
    /// Dispatch a search reply observation to the control point.
    MSearchReplyCp(MSearchReplyCp),
    /// Dispatch a notification observation to the control point.
    NotifyReplyCp(NotifyReplyCp),
    /// Periodic ssdp:alive burst for a device.
    Alive {
        device: Arc<DeviceModel>,
        max_age: u32,
    },
    /// ssdp:byebye burst, repeated while shutting down.
    ByeBye { device: Arc<DeviceModel> },
    /// Raw GENA SUBSCRIBE frame towards a peer.
    Subscribe {
        peer: SocketAddr,
        path: String,
        callback: String,
        seconds: u32,
    },
    /// Invoke an arbitrary callback; the return value is only logged.
    Callback(Box<dyn FnMut() -> bool + Send>),
}

/// One queue entry. `repeat_ms == 0` marks a one-shot, `end_at_ms == 0`
/// repeats forever.
pub struct Schedule {
    pub fire_at_ms: u64,
    pub repeat_ms: u64,
    pub end_at_ms: u64,
    pub active: bool,
    fired: bool,
    kind: ScheduleKind,
}

impl Schedule {
    pub fn new(kind: ScheduleKind) -> Self {
        Self {
            fire_at_ms: 0,
            repeat_ms: 0,
            end_at_ms: 0,
            active: true,
            fired: false,
            kind,
        }
    }

    pub fn at(mut self, fire_at_ms: u64) -> Self {
        self.fire_at_ms = fire_at_ms;
        self
    }

    pub fn repeating(mut self, repeat_ms: u64) -> Self {
        self.repeat_ms = repeat_ms;
        self
    }

    pub fn until(mut self, end_at_ms: u64) -> Self {
        self.end_at_ms = end_at_ms;
        self
    }

    pub fn name(&self) -> &'static str {
        match &self.kind {
            ScheduleKind::MSearch { .. } => "MSearch",
            ScheduleKind::MSearchReply { .. } => "MSearchReply",
            ScheduleKind::MSearchReplyCp(_) => "MSearchReplyCp",
            ScheduleKind::NotifyReplyCp(_) => "NotifyReplyCp",
            ScheduleKind::Alive { .. } => "Alive",
            ScheduleKind::ByeBye { .. } => "ByeBye",
            ScheduleKind::Subscribe { .. } => "Subscribe",
            ScheduleKind::Callback(_) => "Callback",
        }
    }

    /// Entries failing this check are dropped at enqueue time, before any
    /// traffic results.
    pub fn is_valid(&self) -> bool {
        match &self.kind {
            ScheduleKind::MSearchReply {
                device,
                peer,
                st,
                netmask,
                ..
            } => {
                if !device.serves_target(st) {
                    tracing::debug!(st = %st, "Ignoring M-SEARCH for foreign target");
                    return false;
                }
                let SocketAddr::V4(peer) = peer else {
                    return false;
                };
                match device.local_ip() {
                    Some(local) if !same_subnet(local, *peer.ip(), *netmask) => {
                        tracing::debug!(
                            peer = %peer,
                            %netmask,
                            "Discovery request filtered, peer is outside the local subnet"
                        );
                        false
                    }
                    _ => true,
                }
            }
            _ => true,
        }
    }

    async fn process<U: UdpTransport>(
        &mut self,
        udp: &U,
        multi_msg_delay_ms: u64,
        events: Option<&mpsc::UnboundedSender<CpEvent>>,
    ) {
        self.fired = true;
        match &mut self.kind {
            ScheduleKind::MSearch { dest, st, mx } => {
                let msg = SearchMessage {
                    host: *dest,
                    st: st.clone(),
                    mx: Some(*mx),
                    user_agent: None,
                };
                tracing::debug!(st = %msg.st, dest = %dest, "Sending M-SEARCH");
                send(udp, msg.to_string().as_bytes(), *dest).await;
            }
            ScheduleKind::MSearchReply {
                device,
                peer,
                st,
                max_age,
                ..
            } => {
                let targets = device.targets_for(st);
                tracing::debug!(
                    st = %st,
                    peer = %peer,
                    replies = targets.len(),
                    "Answering M-SEARCH"
                );
                let mut first = true;
                for (st, usn) in targets {
                    if !std::mem::take(&mut first) {
                        tokio::time::sleep(Duration::from_millis(multi_msg_delay_ms)).await;
                    }
                    let response = SearchResponse {
                        cache_control: *max_age,
                        location: device.location(),
                        server: device.server().to_string(),
                        st,
                        usn,
                    };
                    send(udp, response.to_string().as_bytes(), *peer).await;
                }
            }
            ScheduleKind::MSearchReplyCp(reply) => {
                dispatch(events, CpEvent::SearchReply(reply.clone()));
            }
            ScheduleKind::NotifyReplyCp(notify) => {
                dispatch(events, CpEvent::Notify(notify.clone()));
            }
            ScheduleKind::Alive { device, max_age } => {
                let location = device.location();
                tracing::debug!(location = %location, "Sending alive announcements");
                let mut first = true;
                for (nt, usn) in device.notification_targets() {
                    if !std::mem::take(&mut first) {
                        tokio::time::sleep(Duration::from_millis(multi_msg_delay_ms)).await;
                    }
                    let msg = NotifyAliveMessage {
                        host: SSDP_ADDR,
                        location: location.clone(),
                        nt,
                        usn,
                        cache_control: *max_age,
                        server: device.server().to_string(),
                    };
                    send(udp, msg.to_string().as_bytes(), SSDP_ADDR).await;
                }
            }
            ScheduleKind::ByeBye { device } => {
                tracing::info!(udn = %device.udn(), "Sending byebye announcements");
                let mut first = true;
                for (nt, usn) in device.notification_targets() {
                    if !std::mem::take(&mut first) {
                        tokio::time::sleep(Duration::from_millis(multi_msg_delay_ms)).await;
                    }
                    let msg = NotifyByeByeMessage {
                        host: SSDP_ADDR,
                        nt,
                        usn,
                    };
                    send(udp, msg.to_string().as_bytes(), SSDP_ADDR).await;
                }
            }
            ScheduleKind::Subscribe {
                peer,
                path,
                callback,
                seconds,
            } => {
                let frame = format!(
                    "SUBSCRIBE {path} HTTP/1.1\r\n\
HOST: {peer}\r\n\
CALLBACK: <{callback}>\r\n\
NT: upnp:event\r\n\
TIMEOUT: Second-{seconds}\r\n\r\n"
                );
                tracing::debug!(peer = %peer, "Sending SUBSCRIBE");
                send(udp, frame.as_bytes(), *peer).await;
            }
            ScheduleKind::Callback(callback) => {
                if !callback() {
                    tracing::debug!("Callback schedule reported unhandled");
                }
            }
        }
    }
}

async fn send<U: UdpTransport>(udp: &U, data: &[u8], peer: SocketAddr) {
    if let Err(e) = udp.send_to(data, peer).await {
        tracing::warn!(peer = %peer, "Failed to send datagram: {e}");
    }
}

fn dispatch(events: Option<&mpsc::UnboundedSender<CpEvent>>, event: CpEvent) {
    match events {
        Some(tx) => {
            if tx.send(event).is_err() {
                tracing::debug!("Control point event receiver is gone");
            }
        }
        None => tracing::debug!("No control point attached, observation dropped"),
    }
}

/// Time-ordered set of pending schedules, driven by the owning loop.
/// Single-threaded and cooperative: entries fire in insertion order within
/// a tick, entries added during a tick wait for the next one.
pub struct ScheduleQueue {
    entries: Vec<Schedule>,
    events_tx: Option<mpsc::UnboundedSender<CpEvent>>,
    multi_msg_delay_ms: u64,
}

impl ScheduleQueue {
    pub fn new(multi_msg_delay_ms: u64) -> Self {
        Self {
            entries: Vec::new(),
            events_tx: None,
            multi_msg_delay_ms,
        }
    }

    pub fn with_events(mut self, events_tx: mpsc::UnboundedSender<CpEvent>) -> Self {
        self.events_tx = Some(events_tx);
        self
    }

    /// Enqueue after a validity check; invalid entries are dropped without
    /// emission.
    pub fn push(&mut self, schedule: Schedule) -> bool {
        if !schedule.is_valid() {
            return false;
        }
        self.entries.push(schedule);
        true
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Deactivate every repeating entry (shutdown path).
    pub fn cancel_repeating(&mut self) {
        for entry in &mut self.entries {
            if entry.repeat_ms > 0 {
                entry.active = false;
            }
        }
    }

    /// Run every due entry exactly once, reschedule repeaters, then sweep
    /// out inactive entries.
    pub async fn tick<U: UdpTransport>(&mut self, now_ms: u64, udp: &U) {
        let snapshot = self.entries.len();
        for i in 0..snapshot {
            let entry = &mut self.entries[i];
            if !entry.active {
                continue;
            }
            if entry.end_at_ms != 0 && entry.end_at_ms <= now_ms && entry.fire_at_ms > now_ms {
                // past its end without a pending firing
                entry.active = false;
                continue;
            }
            if entry.fire_at_ms > now_ms {
                continue;
            }
            entry
                .process(udp, self.multi_msg_delay_ms, self.events_tx.as_ref())
                .await;
            if entry.repeat_ms > 0 && (entry.end_at_ms == 0 || entry.end_at_ms > now_ms) {
                entry.fire_at_ms = now_ms + entry.repeat_ms;
            } else {
                entry.active = false;
            }
        }
        self.entries.retain(|entry| {
            if !entry.active && !entry.fired {
                tracing::debug!(name = entry.name(), "Removing schedule that never fired");
            }
            entry.active
        });
    }
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, SocketAddr};
    use std::sync::Arc;

    use crate::config::DlnaConfig;
    use crate::device::tests::renderer_info;
    use crate::device::DeviceModel;
    use crate::ssdp::{NotificationType, SSDP_ADDR};
    use crate::udp::mock::MockUdp;

    use super::{CpEvent, MSearchReplyCp, Schedule, ScheduleKind, ScheduleQueue};

    fn model() -> Arc<DeviceModel> {
        DeviceModel::new(renderer_info(), None, &DlnaConfig::default()).unwrap()
    }

    fn peer() -> SocketAddr {
        "192.168.1.50:54321".parse().unwrap()
    }

    fn reply_schedule(device: Arc<DeviceModel>, st: NotificationType, peer: SocketAddr) -> Schedule {
        Schedule::new(ScheduleKind::MSearchReply {
            device,
            peer,
            st,
            netmask: Ipv4Addr::new(255, 255, 255, 0),
            max_age: 86400,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn ssdp_all_reply_burst_covers_all_targets() {
        let udp = MockUdp::new(Ipv4Addr::new(192, 168, 1, 10));
        let mut queue = ScheduleQueue::new(80);
        assert!(queue.push(reply_schedule(model(), NotificationType::All, peer()).at(100)));

        queue.tick(50, &udp).await;
        assert!(udp.sent().is_empty(), "not due yet");

        queue.tick(100, &udp).await;
        let sent = udp.sent();
        // uuid + rootdevice + device type + 3 services
        assert_eq!(sent.len(), 6);
        assert!(sent.iter().all(|(_, to)| *to == peer()));
        assert!(sent[0].0.contains("USN: uuid:0aa02144-59fb-4fd7-b179-a7c07357dba8\r\n"));
        assert!(sent[1].0.contains("USN: uuid:0aa02144-59fb-4fd7-b179-a7c07357dba8::upnp:rootdevice"));
        assert!(sent[2].0.contains("::urn:schemas-upnp-org:device:MediaRenderer:1"));
        assert!(sent[3].0.contains("::urn:schemas-upnp-org:service:AVTransport:1"));
        assert!(sent.iter().all(|(frame, _)| frame.starts_with("HTTP/1.1 200 OK\r\n")));
        assert!(sent.iter().all(|(frame, _)| frame.contains("CONTENT-LENGTH: 0")));
        // one-shot: removed by the cleanup pass
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn concrete_search_target_gets_single_reply() {
        let udp = MockUdp::new(Ipv4Addr::new(192, 168, 1, 10));
        let mut queue = ScheduleQueue::new(80);
        let st: NotificationType = NotificationType::Urn(
            "urn:schemas-upnp-org:service:RenderingControl:1".parse().unwrap(),
        );
        queue.push(reply_schedule(model(), st, peer()).at(0));
        queue.tick(0, &udp).await;
        let sent = udp.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].0.contains("ST: urn:schemas-upnp-org:service:RenderingControl:1"));
    }

    #[test]
    fn foreign_target_is_dropped_at_enqueue() {
        let mut queue = ScheduleQueue::new(80);
        let st = NotificationType::Urn(
            "urn:schemas-upnp-org:device:InternetGatewayDevice:1".parse().unwrap(),
        );
        assert!(!queue.push(reply_schedule(model(), st, peer())));
        assert!(queue.is_empty());
    }

    #[test]
    fn peer_outside_subnet_is_dropped_at_enqueue() {
        let mut queue = ScheduleQueue::new(80);
        let outside = "10.0.0.5:54321".parse().unwrap();
        assert!(!queue.push(reply_schedule(model(), NotificationType::All, outside)));
    }

    #[tokio::test(start_paused = true)]
    async fn alive_cadence_repeats_full_bursts() {
        let udp = MockUdp::new(Ipv4Addr::new(192, 168, 1, 10));
        let mut queue = ScheduleQueue::new(80);
        queue.push(
            Schedule::new(ScheduleKind::Alive {
                device: model(),
                max_age: 70,
            })
            .repeating(60_000),
        );

        for start in [0u64, 60_000, 120_000] {
            queue.tick(start, &udp).await;
            let sent = udp.sent();
            assert_eq!(sent.len(), 6, "expected a full burst at t={start}");
            assert!(sent.iter().all(|(frame, to)| {
                *to == SSDP_ADDR
                    && frame.starts_with("NOTIFY * HTTP/1.1\r\n")
                    && frame.contains("NTS: ssdp:alive")
                    && frame.contains("CACHE-CONTROL: max-age=70")
            }));
            udp.clear_sent();
            // in between nothing is due
            queue.tick(start + 30_000, &udp).await;
            assert!(udp.sent().is_empty());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn byebye_fires_three_times_then_expires() {
        let udp = MockUdp::new(Ipv4Addr::new(192, 168, 1, 10));
        let mut queue = ScheduleQueue::new(0);
        queue.push(
            Schedule::new(ScheduleKind::ByeBye { device: model() })
                .at(0)
                .repeating(20_000)
                .until(40_000),
        );
        let mut firings = 0;
        for now in [0u64, 20_000, 40_000, 60_000, 80_000] {
            queue.tick(now, &udp).await;
            if !udp.sent().is_empty() {
                firings += 1;
                assert!(udp.sent().iter().all(|(frame, _)| frame.contains("NTS: ssdp:byebye")));
                udp.clear_sent();
            }
        }
        assert_eq!(firings, 3);
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn entries_fire_in_insertion_order() {
        let udp = MockUdp::new(Ipv4Addr::new(192, 168, 1, 10));
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut queue = ScheduleQueue::new(0);
        for tag in 1..=3u8 {
            let order = order.clone();
            queue.push(
                Schedule::new(ScheduleKind::Callback(Box::new(move || {
                    order.lock().unwrap().push(tag);
                    true
                })))
                .at(5),
            );
        }
        queue.tick(10, &udp).await;
        assert_eq!(*order.lock().unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn inactive_entries_are_swept_on_next_tick() {
        let udp = MockUdp::new(Ipv4Addr::new(192, 168, 1, 10));
        let mut queue = ScheduleQueue::new(0);
        queue.push(
            Schedule::new(ScheduleKind::Callback(Box::new(|| true)))
                .at(0)
                .repeating(1000),
        );
        queue.tick(0, &udp).await;
        assert_eq!(queue.len(), 1);
        queue.cancel_repeating();
        queue.tick(1, &udp).await;
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn cp_observations_are_forwarded_to_the_channel() {
        let udp = MockUdp::new(Ipv4Addr::new(192, 168, 1, 20));
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let mut queue = ScheduleQueue::new(0).with_events(tx);
        queue.push(
            Schedule::new(ScheduleKind::MSearchReplyCp(MSearchReplyCp {
                location: "http://192.168.1.10:9876/dlna/device.xml".to_string(),
                usn: "uuid:0aa02144-59fb-4fd7-b179-a7c07357dba8::upnp:rootdevice"
                    .parse()
                    .unwrap(),
                st: NotificationType::RootDevice,
            }))
            .at(0),
        );
        queue.tick(0, &udp).await;
        let Some(CpEvent::SearchReply(reply)) = rx.recv().await else {
            panic!("expected search reply event");
        };
        assert_eq!(reply.location, "http://192.168.1.10:9876/dlna/device.xml");
        assert!(udp.sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn subscribe_schedule_emits_gena_frame() {
        let udp = MockUdp::new(Ipv4Addr::new(192, 168, 1, 20));
        let mut queue = ScheduleQueue::new(0);
        queue.push(Schedule::new(ScheduleKind::Subscribe {
            peer: "192.168.1.30:1900".parse().unwrap(),
            path: "/AVTransport/event.xml".to_string(),
            callback: "http://192.168.1.20:9877/callback".to_string(),
            seconds: 300,
        }));
        queue.tick(0, &udp).await;
        let sent = udp.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].0.starts_with("SUBSCRIBE /AVTransport/event.xml HTTP/1.1\r\n"));
        assert!(sent[0].0.contains("NT: upnp:event"));
        assert!(sent[0].0.contains("TIMEOUT: Second-300"));
    }
}
