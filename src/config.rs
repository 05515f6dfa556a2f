use std::net::Ipv4Addr;

/// Tunables shared by the device and control point facades.
///
/// Defaults match the values every conforming peer expects; individual
/// fields can be adjusted builder-style before the facade starts.
#[derive(Debug, Clone)]
pub struct DlnaConfig {
    /// Sleep at the end of each loop iteration.
    pub loop_delay_ms: u64,
    /// Throttle between schedule queue dispatches.
    pub run_scheduler_every_ms: u64,
    /// Throttle between subscription renewal checks.
    pub run_subscriptions_every_ms: u64,
    /// Deadline for outgoing HTTP requests (descriptor fetch, SOAP, GENA).
    pub http_request_timeout_ms: u64,
    /// SSDP multicast/UDP port.
    pub ssdp_port: u16,
    /// Ceiling for composed URLs.
    pub max_url_len: usize,
    /// Maximum element nesting accepted by the XML parsers.
    pub xml_max_depth: usize,
    /// Read-ahead used when parsing streamed XML bodies.
    pub xml_buffer_size: usize,
    /// Retries before a failing subscription is dropped.
    pub max_notify_retries: u32,
    /// Peers outside this mask relative to the local address are ignored.
    pub discovery_netmask: Ipv4Addr,
    /// Spacing between datagrams of a multi-message burst.
    pub multi_msg_delay_ms: u64,
    /// CACHE-CONTROL max-age for M-SEARCH replies.
    pub max_age: u32,
    /// Interval between repeated alive announcements.
    pub alive_repeat_ms: u64,
    /// Spacing between the byebye firings on shutdown.
    pub byebye_repeat_ms: u64,
    /// Time granted to the byebye sequence before the queue is dropped.
    pub shutdown_budget_ms: u64,
    /// Multicast TTL for the SSDP socket.
    pub ssdp_ttl: u32,
}

impl Default for DlnaConfig {
    fn default() -> Self {
        Self {
            loop_delay_ms: 5,
            run_scheduler_every_ms: 10,
            run_subscriptions_every_ms: 10,
            http_request_timeout_ms: 60_000,
            ssdp_port: 1900,
            max_url_len: 256,
            xml_max_depth: 16,
            xml_buffer_size: 512,
            max_notify_retries: 3,
            discovery_netmask: Ipv4Addr::new(255, 255, 255, 0),
            multi_msg_delay_ms: 80,
            max_age: 86_400,
            alive_repeat_ms: 900_000,
            byebye_repeat_ms: 20_000,
            shutdown_budget_ms: 65_000,
            ssdp_ttl: 2,
        }
    }
}

impl DlnaConfig {
    pub fn with_alive_repeat_ms(mut self, ms: u64) -> Self {
        self.alive_repeat_ms = ms;
        self
    }

    pub fn with_http_request_timeout_ms(mut self, ms: u64) -> Self {
        self.http_request_timeout_ms = ms;
        self
    }

    pub fn with_discovery_netmask(mut self, netmask: Ipv4Addr) -> Self {
        self.discovery_netmask = netmask;
        self
    }

    pub fn with_multi_msg_delay_ms(mut self, ms: u64) -> Self {
        self.multi_msg_delay_ms = ms;
        self
    }

    /// CACHE-CONTROL max-age advertised by alive notifications: the repeat
    /// interval plus a safety margin so the entry outlives the next burst.
    pub fn alive_max_age(&self) -> u32 {
        (self.alive_repeat_ms / 1000) as u32 + 10
    }
}

/// HTTP client honoring the configured request deadline. Used for
/// descriptor fetches, SOAP calls and GENA traffic alike.
pub fn http_client(config: &DlnaConfig) -> Result<reqwest::Client, crate::DlnaError> {
    reqwest::Client::builder()
        .timeout(std::time::Duration::from_millis(config.http_request_timeout_ms))
        .build()
        .map_err(|e| crate::DlnaError::Transport(e.into()))
}

/// Check whether two hosts fall inside the same subnet under `netmask`.
pub(crate) fn same_subnet(local: Ipv4Addr, peer: Ipv4Addr, netmask: Ipv4Addr) -> bool {
    let mask = u32::from(netmask);
    (u32::from(local) & mask) == (u32::from(peer) & mask)
}
