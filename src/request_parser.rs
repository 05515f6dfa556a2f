use std::{net::SocketAddr, sync::Arc};

use rand::Rng;

use crate::{
    config::DlnaConfig,
    device::DeviceModel,
    schedule::{MSearchReplyCp, NotifyReplyCp, Schedule, ScheduleKind},
    ssdp::SsdpMessage,
};

const MX_MIN: u8 = 1;
const MX_MAX: u8 = 5;

/// Translates inbound SSDP datagrams into schedules so replies and
/// observations go through the queue instead of being handled inline.
#[derive(Debug, Clone)]
pub struct RequestParser {
    netmask: std::net::Ipv4Addr,
    max_age: u32,
}

impl RequestParser {
    pub fn new(config: &DlnaConfig) -> Self {
        Self {
            netmask: config.discovery_netmask,
            max_age: config.max_age,
        }
    }

    fn decode(data: &[u8]) -> Option<SsdpMessage> {
        if data.is_empty() {
            return None;
        }
        let payload = match std::str::from_utf8(data) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::debug!("Dropping non utf-8 datagram: {e}");
                return None;
            }
        };
        match SsdpMessage::parse(payload) {
            Ok(message) => Some(message),
            Err(e) => {
                tracing::debug!("Dropping unparseable datagram: {e:#}");
                None
            }
        }
    }

    /// Device side: M-SEARCH requests become delayed reply schedules,
    /// everything else is ignored.
    pub fn parse_device(
        &self,
        device: &Arc<DeviceModel>,
        data: &[u8],
        peer: SocketAddr,
        now_ms: u64,
    ) -> Option<Schedule> {
        match Self::decode(data)? {
            SsdpMessage::Search(search) => {
                let mx = search.mx.unwrap_or(MX_MIN).clamp(MX_MIN, MX_MAX);
                let delay = rand::rng().random_range(0..=u64::from(mx) * 1000);
                tracing::debug!(
                    st = %search.st,
                    mx,
                    peer = %peer,
                    delay_ms = delay,
                    "Search message"
                );
                Some(
                    Schedule::new(ScheduleKind::MSearchReply {
                        device: device.clone(),
                        peer,
                        st: search.st,
                        netmask: self.netmask,
                        max_age: self.max_age,
                    })
                    .at(now_ms + delay),
                )
            }
            SsdpMessage::NotifyAlive(alive) => {
                tracing::trace!(nt = %alive.nt, "Received alive message");
                None
            }
            SsdpMessage::NotifyByeBye(byebye) => {
                tracing::trace!(nt = %byebye.nt, "Received byebye message");
                None
            }
            other => {
                tracing::trace!(peer = %peer, "Ignoring {other:?}");
                None
            }
        }
    }

    /// Control point side: replies and notifications become observation
    /// schedules for the discovery engine and subscription manager.
    pub fn parse_control_point(
        &self,
        data: &[u8],
        peer: SocketAddr,
        now_ms: u64,
    ) -> Option<Schedule> {
        match Self::decode(data)? {
            SsdpMessage::SearchResponse(response) => Some(
                Schedule::new(ScheduleKind::MSearchReplyCp(MSearchReplyCp {
                    location: response.location,
                    usn: response.usn,
                    st: response.st,
                }))
                .at(now_ms),
            ),
            SsdpMessage::NotifyAlive(alive) => Some(
                Schedule::new(ScheduleKind::NotifyReplyCp(NotifyReplyCp::Alive {
                    location: alive.location,
                    usn: alive.usn,
                    nt: alive.nt,
                    cache_control: alive.cache_control,
                }))
                .at(now_ms),
            ),
            SsdpMessage::NotifyByeBye(byebye) => Some(
                Schedule::new(ScheduleKind::NotifyReplyCp(NotifyReplyCp::ByeBye {
                    usn: byebye.usn,
                    nt: byebye.nt,
                }))
                .at(now_ms),
            ),
            SsdpMessage::NotifyEvent(event) => Some(
                Schedule::new(ScheduleKind::NotifyReplyCp(NotifyReplyCp::PropChange {
                    delivery_host: event.host,
                    delivery_path: event.delivery_path,
                    sid: event.sid,
                    seq: event.seq,
                    payload: event.body,
                }))
                .at(now_ms),
            ),
            SsdpMessage::Search(search) => {
                tracing::trace!(st = %search.st, peer = %peer, "Ignoring search on control point");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, SocketAddr};
    use std::sync::Arc;

    use crate::config::DlnaConfig;
    use crate::device::tests::renderer_info;
    use crate::device::DeviceModel;
    use crate::schedule::ScheduleQueue;
    use crate::udp::mock::MockUdp;

    use super::RequestParser;

    fn model() -> Arc<DeviceModel> {
        DeviceModel::new(renderer_info(), None, &DlnaConfig::default()).unwrap()
    }

    fn peer() -> SocketAddr {
        "192.168.1.50:54321".parse().unwrap()
    }

    fn msearch(st: &str, mx: Option<&str>) -> Vec<u8> {
        let mut frame = String::from("M-SEARCH * HTTP/1.1\r\nHOST:239.255.255.250:1900\r\nMAN:\"ssdp:discover\"\r\n");
        if let Some(mx) = mx {
            frame.push_str(&format!("MX:{mx}\r\n"));
        }
        frame.push_str(&format!("ST:{st}\r\n\r\n"));
        frame.into_bytes()
    }

    #[test]
    fn reply_delay_is_inside_the_mx_window() {
        let parser = RequestParser::new(&DlnaConfig::default());
        let device = model();
        for _ in 0..50 {
            let schedule = parser
                .parse_device(&device, &msearch("ssdp:all", Some("2")), peer(), 10_000)
                .expect("search should produce a reply schedule");
            assert!(schedule.fire_at_ms >= 10_000);
            assert!(schedule.fire_at_ms <= 12_000);
        }
    }

    #[test]
    fn missing_mx_defaults_to_one_second_window() {
        let parser = RequestParser::new(&DlnaConfig::default());
        let device = model();
        for _ in 0..50 {
            let schedule = parser
                .parse_device(&device, &msearch("upnp:rootdevice", None), peer(), 0)
                .unwrap();
            assert!(schedule.fire_at_ms <= 1000);
        }
    }

    #[test]
    fn oversized_mx_is_clamped_to_five_seconds() {
        let parser = RequestParser::new(&DlnaConfig::default());
        let device = model();
        for _ in 0..50 {
            let schedule = parser
                .parse_device(&device, &msearch("ssdp:all", Some("30")), peer(), 0)
                .unwrap();
            assert!(schedule.fire_at_ms <= 5000);
        }
    }

    #[test]
    fn empty_and_malformed_datagrams_are_dropped() {
        let parser = RequestParser::new(&DlnaConfig::default());
        let device = model();
        assert!(parser.parse_device(&device, b"", peer(), 0).is_none());
        assert!(parser
            .parse_device(&device, b"GET / HTTP/1.1\r\n\r\n", peer(), 0)
            .is_none());
        assert!(parser.parse_device(&device, &[0xff, 0xfe], peer(), 0).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn search_for_foreign_target_produces_no_traffic() {
        let parser = RequestParser::new(&DlnaConfig::default());
        let device = model();
        let udp = MockUdp::new(Ipv4Addr::new(192, 168, 1, 10));
        let mut queue = ScheduleQueue::new(0);
        if let Some(schedule) = parser.parse_device(
            &device,
            &msearch("urn:schemas-upnp-org:device:InternetGatewayDevice:1", Some("2")),
            peer(),
            0,
        ) {
            queue.push(schedule);
        }
        for now in (0..=6000).step_by(500) {
            queue.tick(now, &udp).await;
        }
        assert!(udp.sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn search_from_foreign_subnet_produces_no_traffic() {
        let parser = RequestParser::new(&DlnaConfig::default());
        let device = model();
        let udp = MockUdp::new(Ipv4Addr::new(192, 168, 1, 10));
        let mut queue = ScheduleQueue::new(0);
        let outside: SocketAddr = "10.0.0.5:54321".parse().unwrap();
        if let Some(schedule) =
            parser.parse_device(&device, &msearch("ssdp:all", Some("2")), outside, 0)
        {
            queue.push(schedule);
        }
        for now in (0..=6000).step_by(500) {
            queue.tick(now, &udp).await;
        }
        assert!(udp.sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn msearch_all_end_to_end_reply_burst() {
        let parser = RequestParser::new(&DlnaConfig::default());
        let device = model();
        let udp = MockUdp::new(Ipv4Addr::new(192, 168, 1, 10));
        let mut queue = ScheduleQueue::new(80);
        let schedule = parser
            .parse_device(&device, &msearch("ssdp:all", Some("2")), peer(), 0)
            .unwrap();
        assert!(queue.push(schedule));
        // everything inside the MX window must have fired by 2s
        for now in (0..=2000).step_by(100) {
            queue.tick(now, &udp).await;
        }
        let sent = udp.sent();
        assert_eq!(sent.len(), 6);
        assert!(sent.iter().all(|(_, to)| *to == peer()));
        assert!(sent[0].0.contains("USN: uuid:0aa02144-59fb-4fd7-b179-a7c07357dba8\r\n"));
    }

    #[test]
    fn control_point_classifies_inbound_frames() {
        let parser = RequestParser::new(&DlnaConfig::default());
        let reply = "HTTP/1.1 200 OK\r\n\
CACHE-CONTROL: max-age=1800\r\n\
EXT:\r\n\
LOCATION: http://192.168.1.10:9876/dlna/device.xml\r\n\
SERVER: test\r\n\
ST: upnp:rootdevice\r\n\
USN: uuid:0aa02144-59fb-4fd7-b179-a7c07357dba8::upnp:rootdevice\r\n\
CONTENT-LENGTH: 0\r\n\r\n";
        let schedule = parser.parse_control_point(reply.as_bytes(), peer(), 42);
        let schedule = schedule.expect("search response should be observed");
        assert_eq!(schedule.fire_at_ms, 42);
        assert_eq!(schedule.name(), "MSearchReplyCp");

        let byebye = "NOTIFY * HTTP/1.1\r\n\
HOST: 239.255.255.250:1900\r\n\
NT: upnp:rootdevice\r\n\
NTS: ssdp:byebye\r\n\
USN: uuid:0aa02144-59fb-4fd7-b179-a7c07357dba8::upnp:rootdevice\r\n\r\n";
        let schedule = parser.parse_control_point(byebye.as_bytes(), peer(), 0).unwrap();
        assert_eq!(schedule.name(), "NotifyReplyCp");
    }
}
