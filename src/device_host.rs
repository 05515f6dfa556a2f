use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::{
    clock::Clock,
    config::{http_client, DlnaConfig},
    device::{DeviceInfo, DeviceModel},
    eventing::{publisher::EventPublisher, PropertySet},
    request_parser::RequestParser,
    router::UpnpRouter,
    schedule::{Schedule, ScheduleKind, ScheduleQueue},
    udp::{UdpTransport, MAX_DATAGRAM_LEN},
    DlnaError,
};

/// Delay before the second announcement burst after start; UDP frames get
/// lost, so the initial alive is posted twice.
const SECOND_ALIVE_DELAY_MS: u64 = 100;

/// Device-side facade: registers itself on the network, serves its
/// description and answers discovery queries and control requests until
/// [stop](DlnaDevice::stop) runs the byebye sequence.
pub struct DlnaDevice<U: UdpTransport> {
    model: Arc<DeviceModel>,
    publisher: Arc<EventPublisher>,
    udp: U,
    queue: ScheduleQueue,
    parser: RequestParser,
    clock: Clock,
    config: DlnaConfig,
    cancellation: CancellationToken,
    active: bool,
    last_scheduler_run_ms: Option<u64>,
    last_subscription_sweep_ms: Option<u64>,
    recv_buf: Vec<u8>,
}

impl<U: UdpTransport> DlnaDevice<U> {
    /// Validate the device, expose it over HTTP and seed the advertisement
    /// schedules. `listener` carries the descriptor/control/event
    /// endpoints, `udp` the SSDP traffic.
    pub async fn begin(
        info: DeviceInfo,
        udp: U,
        listener: tokio::net::TcpListener,
        config: DlnaConfig,
    ) -> Result<Self, DlnaError> {
        let clock = Clock::start();
        let observed_ip = if info.base_url.contains("localhost") {
            crate::udp::resolve_local_addr().await.ok()
        } else {
            None
        };
        let model = DeviceModel::new(info, observed_ip, &config)?;
        tracing::info!(
            udn = %model.udn(),
            location = %model.location(),
            "Starting device"
        );

        let publisher = Arc::new(EventPublisher::new(http_client(&config)?, &config));
        let router = UpnpRouter::new(model.clone(), publisher.clone(), clock, &config)?;
        let cancellation = CancellationToken::new();
        let server_cancellation = cancellation.clone();
        let server: axum::Router = router.into();
        tokio::spawn(async move {
            let serve = axum::serve(listener, server)
                .with_graceful_shutdown(async move { server_cancellation.cancelled().await });
            if let Err(e) = serve.await {
                tracing::warn!("Device http server failed: {e}");
            }
        });

        let mut queue = ScheduleQueue::new(config.multi_msg_delay_ms);
        let now = clock.now_ms();
        let alive_max_age = config.alive_max_age();
        queue.push(
            Schedule::new(ScheduleKind::Alive {
                device: model.clone(),
                max_age: alive_max_age,
            })
            .at(now)
            .repeating(config.alive_repeat_ms),
        );
        queue.push(
            Schedule::new(ScheduleKind::Alive {
                device: model.clone(),
                max_age: alive_max_age,
            })
            .at(now + SECOND_ALIVE_DELAY_MS),
        );

        Ok(Self {
            parser: RequestParser::new(&config),
            model,
            publisher,
            udp,
            queue,
            clock,
            config,
            cancellation,
            active: true,
            last_scheduler_run_ms: None,
            last_subscription_sweep_ms: None,
            recv_buf: vec![0; MAX_DATAGRAM_LEN],
        })
    }

    pub fn model(&self) -> &Arc<DeviceModel> {
        &self.model
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Emit a property change to every subscriber of the service.
    pub async fn notify_subscribers(&self, service_id: &str, set: &PropertySet) {
        self.publisher.notify_all(service_id, set).await;
    }

    /// One cooperative iteration: drain the socket into the parser, then
    /// dispatch due schedules and sweep stale subscribers on their own
    /// throttles.
    pub async fn tick(&mut self) {
        let now = self.clock.now_ms();
        loop {
            match self.udp.try_recv_from(&mut self.recv_buf) {
                Ok(Some((read, peer))) => {
                    let data = self.recv_buf[..read].to_vec();
                    if let Some(schedule) = self.parser.parse_device(&self.model, &data, peer, now)
                    {
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
        if self
            .last_subscription_sweep_ms
            .is_none_or(|last| now.saturating_sub(last) >= self.config.run_subscriptions_every_ms)
        {
            self.last_subscription_sweep_ms = Some(now);
            self.publisher.sweep_expired(now);
        }
    }

    /// Token that makes [run](DlnaDevice::run) return; callers follow up
    /// with [stop](DlnaDevice::stop) for the byebye sequence.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    /// Drive the device until the shutdown token fires or
    /// [stop](DlnaDevice::stop) was called.
    pub async fn run(&mut self) {
        while self.active && !self.cancellation.is_cancelled() {
            self.tick().await;
            self.clock.sleep_ms(self.config.loop_delay_ms).await;
        }
    }

    /// Cancel the advertisements, run the byebye sequence within the
    /// shutdown budget and take the HTTP endpoints down.
    pub async fn stop(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        self.queue.cancel_repeating();
        let now = self.clock.now_ms();
        self.queue.push(
            Schedule::new(ScheduleKind::ByeBye {
                device: self.model.clone(),
            })
            .at(now)
            .repeating(self.config.byebye_repeat_ms)
            .until(now + 2 * self.config.byebye_repeat_ms),
        );
        let deadline = now + self.config.shutdown_budget_ms;
        while !self.queue.is_empty() && self.clock.now_ms() < deadline {
            let now = self.clock.now_ms();
            self.queue.tick(now, &self.udp).await;
            self.clock.sleep_ms(self.config.run_scheduler_every_ms).await;
        }
        self.cancellation.cancel();
        tracing::info!(udn = %self.model.udn(), "Device stopped");
    }
}
