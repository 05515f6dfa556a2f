use std::{collections::HashMap, sync::Arc};

use anyhow::Context;

use crate::{
    config::DlnaConfig,
    device_description::Udn,
    eventing::{format_timeout_seconds, parse_timeout_seconds, PropertySet, SubscriptionState},
    DlnaError,
};

/// Invoked once per changed variable: `(sid, variable name, new value)`.
pub type NotifyCallback = Arc<dyn Fn(&str, &str, &str) + Send + Sync>;

/// Failed renewals wait this long before the next attempt.
const RETRY_DELAY_MS: u64 = 5_000;

fn subscribe_method() -> reqwest::Method {
    reqwest::Method::from_bytes(b"SUBSCRIBE").expect("valid method")
}

fn unsubscribe_method() -> reqwest::Method {
    reqwest::Method::from_bytes(b"UNSUBSCRIBE").expect("valid method")
}

/// Renewal fires this many milliseconds ahead of the expiry: at least 30
/// seconds, a tenth of the granted window for long leases, never more than
/// the window itself.
pub(crate) fn renew_guard_ms(timeout_seconds: u32) -> u64 {
    u64::from(30u32.max(timeout_seconds / 10).min(timeout_seconds)) * 1000
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionKey {
    pub udn: Udn,
    pub service_id: String,
}

/// One outgoing subscription. The SID survives renewals; it is cleared when
/// the subscription dies.
pub struct Subscription {
    key: SubscriptionKey,
    event_url: reqwest::Url,
    state: SubscriptionState,
    sid: Option<String>,
    timeout_seconds: u32,
    started_at_ms: u64,
    confirmed_at_ms: u64,
    expires_at_ms: u64,
    renew_at_ms: u64,
    retries: u32,
    last_seq: Option<u32>,
    callback: NotifyCallback,
}

impl Subscription {
    pub fn state(&self) -> SubscriptionState {
        self.state
    }

    pub fn sid(&self) -> Option<&str> {
        self.sid.as_deref()
    }

    pub fn started_at_ms(&self) -> u64 {
        self.started_at_ms
    }

    pub fn confirmed_at_ms(&self) -> u64 {
        self.confirmed_at_ms
    }

    pub fn expires_at_ms(&self) -> u64 {
        self.expires_at_ms
    }

    fn confirm(&mut self, sid: Option<String>, timeout_seconds: u32, now_ms: u64) {
        if let Some(sid) = sid {
            self.sid = Some(sid);
        }
        self.timeout_seconds = timeout_seconds;
        self.confirmed_at_ms = now_ms;
        self.expires_at_ms = now_ms + u64::from(timeout_seconds) * 1000;
        self.renew_at_ms = self
            .expires_at_ms
            .saturating_sub(renew_guard_ms(timeout_seconds))
            .max(now_ms + 1);
        self.retries = 0;
        self.state = SubscriptionState::Subscribed;
    }

    fn drop_sid(&mut self) {
        self.sid = None;
        self.state = SubscriptionState::Unsubscribed;
    }
}

/// Issues SUBSCRIBE/RENEW/UNSUBSCRIBE requests and feeds inbound NOTIFY
/// bodies to the registered callbacks. Distinct services are independent;
/// all traffic is serialised on the owning loop.
pub struct SubscriptionManager {
    client: reqwest::Client,
    callback_url: String,
    subscriptions: HashMap<SubscriptionKey, Subscription>,
    max_retries: u32,
    xml_max_depth: usize,
}

impl SubscriptionManager {
    pub fn new(client: reqwest::Client, callback_url: String, config: &DlnaConfig) -> Self {
        Self {
            client,
            callback_url,
            subscriptions: HashMap::new(),
            max_retries: config.max_notify_retries,
            xml_max_depth: config.xml_max_depth,
        }
    }

    pub fn state(&self, key: &SubscriptionKey) -> Option<SubscriptionState> {
        self.subscriptions.get(key).map(|s| s.state)
    }

    pub fn subscription(&self, key: &SubscriptionKey) -> Option<&Subscription> {
        self.subscriptions.get(key)
    }

    /// SUBSCRIBE with CALLBACK/NT/TIMEOUT headers. On success returns the
    /// SID assigned by the publisher.
    pub async fn subscribe(
        &mut self,
        key: SubscriptionKey,
        event_url: reqwest::Url,
        timeout_seconds: u32,
        callback: NotifyCallback,
        now_ms: u64,
    ) -> Result<String, DlnaError> {
        match self.subscriptions.get(&key).map(|s| s.state) {
            Some(SubscriptionState::Unsubscribing) => {
                return Err(DlnaError::State("subscribe while unsubscribing"));
            }
            Some(
                SubscriptionState::Subscribing
                | SubscriptionState::Subscribed
                | SubscriptionState::Renewing,
            ) => {
                return Err(DlnaError::State("service already has a live subscription"));
            }
            _ => (),
        }

        let mut subscription = Subscription {
            key: key.clone(),
            event_url: event_url.clone(),
            state: SubscriptionState::Subscribing,
            sid: None,
            timeout_seconds,
            started_at_ms: now_ms,
            confirmed_at_ms: 0,
            expires_at_ms: 0,
            renew_at_ms: 0,
            retries: 0,
            last_seq: None,
            callback,
        };

        let request = self
            .client
            .request(subscribe_method(), event_url)
            .header("CALLBACK", format!("<{}>", self.callback_url))
            .header("NT", "upnp:event")
            .header("TIMEOUT", format_timeout_seconds(timeout_seconds));
        let result = Self::execute_subscribe(request, timeout_seconds).await;
        match result {
            Ok((sid, granted)) => {
                tracing::info!(
                    sid = %sid,
                    timeout = granted,
                    service = %subscription.key.service_id,
                    "Subscribed"
                );
                subscription.confirm(Some(sid.clone()), granted, now_ms);
                self.subscriptions.insert(key, subscription);
                Ok(sid)
            }
            Err(e) => {
                tracing::warn!(service = %subscription.key.service_id, "Subscribe failed: {e}");
                subscription.state = SubscriptionState::Failed;
                self.subscriptions.insert(key, subscription);
                Err(e)
            }
        }
    }

    async fn execute_subscribe(
        request: reqwest::RequestBuilder,
        fallback_timeout: u32,
    ) -> Result<(String, u32), DlnaError> {
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(DlnaError::Protocol(anyhow::anyhow!(
                "subscription rejected with status {status}"
            )));
        }
        let sid = response
            .headers()
            .get("SID")
            .and_then(|v| v.to_str().ok())
            .context("response without SID header")
            .map_err(DlnaError::Protocol)?
            .to_string();
        let granted = response
            .headers()
            .get("TIMEOUT")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| parse_timeout_seconds(v).ok())
            .flatten()
            .unwrap_or(fallback_timeout);
        Ok((sid, granted))
    }

    /// SUBSCRIBE with the SID header only; keeps the SID on success.
    async fn renew(&mut self, key: &SubscriptionKey, now_ms: u64) {
        let Some(subscription) = self.subscriptions.get_mut(key) else {
            return;
        };
        let Some(sid) = subscription.sid.clone() else {
            subscription.drop_sid();
            return;
        };
        subscription.state = SubscriptionState::Renewing;
        let request = self
            .client
            .request(subscribe_method(), subscription.event_url.clone())
            .header("SID", &sid)
            .header("TIMEOUT", format_timeout_seconds(subscription.timeout_seconds));
        match Self::execute_subscribe(request, subscription.timeout_seconds).await {
            Ok((_, granted)) => {
                tracing::debug!(sid = %sid, timeout = granted, "Renewed subscription");
                subscription.confirm(None, granted, now_ms);
            }
            Err(e) => {
                subscription.retries += 1;
                if subscription.retries > self.max_retries {
                    tracing::warn!(sid = %sid, "Renewal abandoned after retries: {e}");
                    subscription.drop_sid();
                } else {
                    tracing::debug!(
                        sid = %sid,
                        retries = subscription.retries,
                        "Renewal failed, will retry: {e}"
                    );
                    subscription.state = SubscriptionState::Failed;
                    subscription.renew_at_ms = now_ms + RETRY_DELAY_MS;
                }
            }
        }
    }

    /// UNSUBSCRIBE with the SID header. The local state is cleared even
    /// when the peer cannot be reached.
    pub async fn unsubscribe(
        &mut self,
        key: &SubscriptionKey,
        _now_ms: u64,
    ) -> Result<(), DlnaError> {
        let Some(subscription) = self.subscriptions.get_mut(key) else {
            return Err(DlnaError::State("no subscription for service"));
        };
        match subscription.state {
            SubscriptionState::Subscribed
            | SubscriptionState::Renewing
            | SubscriptionState::Failed => (),
            _ => return Err(DlnaError::State("no live subscription to cancel")),
        }
        subscription.state = SubscriptionState::Unsubscribing;
        let sid = subscription.sid.clone();
        let url = subscription.event_url.clone();
        let result = match sid {
            Some(sid) => {
                let response = self
                    .client
                    .request(unsubscribe_method(), url)
                    .header("SID", sid)
                    .send()
                    .await;
                match response {
                    Ok(response) if response.status().is_success() => Ok(()),
                    Ok(response) => Err(DlnaError::Protocol(anyhow::anyhow!(
                        "unsubscribe rejected with status {}",
                        response.status()
                    ))),
                    Err(e) => Err(e.into()),
                }
            }
            None => Ok(()),
        };
        if let Some(subscription) = self.subscriptions.get_mut(key) {
            subscription.drop_sid();
        }
        result
    }

    /// Renewal / expiry sweep, run from the owning loop.
    pub async fn tick(&mut self, now_ms: u64) {
        let due: Vec<SubscriptionKey> = self
            .subscriptions
            .values()
            .filter_map(|s| match s.state {
                SubscriptionState::Subscribed | SubscriptionState::Failed
                    if s.renew_at_ms <= now_ms =>
                {
                    Some(s.key.clone())
                }
                _ => None,
            })
            .collect();
        for key in due {
            // expiry without renewal transitions silently
            let expired = self
                .subscriptions
                .get(&key)
                .is_some_and(|s| s.expires_at_ms <= now_ms);
            if expired {
                if let Some(subscription) = self.subscriptions.get_mut(&key) {
                    tracing::debug!(
                        service = %key.service_id,
                        "Subscription expired without renewal"
                    );
                    subscription.drop_sid();
                }
                continue;
            }
            self.renew(&key, now_ms).await;
        }
    }

    /// Deliver an inbound NOTIFY body to the subscription owning `sid`.
    /// Duplicate or reordered SEQ values are accepted; SEQ only feeds logs.
    pub fn deliver_notify(&mut self, sid: &str, seq: u32, body: &[u8]) {
        let Some(subscription) = self
            .subscriptions
            .values_mut()
            .find(|s| s.sid.as_deref() == Some(sid))
        else {
            tracing::debug!(sid = %sid, "NOTIFY for unknown subscription");
            return;
        };
        if let Some(last) = subscription.last_seq {
            if seq <= last {
                tracing::debug!(sid = %sid, seq, last, "Out of order event key");
            }
        }
        subscription.last_seq = Some(seq);
        let set = match PropertySet::parse(body, self.xml_max_depth) {
            Ok(set) => set,
            Err(e) => {
                tracing::warn!(sid = %sid, "Dropping unparseable propertyset: {e:#}");
                return;
            }
        };
        let callback = subscription.callback.clone();
        for property in &set.properties {
            callback(sid, &property.name, &property.value);
        }
    }

    /// Forget every subscription towards `udn` (the device said byebye).
    pub fn cancel_for_device(&mut self, udn: &Udn) {
        for subscription in self
            .subscriptions
            .values_mut()
            .filter(|s| s.key.udn == *udn)
        {
            tracing::debug!(
                service = %subscription.key.service_id,
                "Cancelling subscription, device left"
            );
            subscription.drop_sid();
        }
    }

    #[cfg(test)]
    pub(crate) fn force_renew_due(&mut self, key: &SubscriptionKey, now_ms: u64) {
        if let Some(subscription) = self.subscriptions.get_mut(key) {
            subscription.renew_at_ms = now_ms;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;
    use std::sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Mutex,
    };

    use axum::http::HeaderMap;

    use crate::{config::DlnaConfig, device_description::Udn, eventing::SubscriptionState, DlnaError};

    use super::{renew_guard_ms, SubscriptionKey, SubscriptionManager};

    fn manager() -> SubscriptionManager {
        SubscriptionManager::new(
            reqwest::Client::new(),
            "http://192.168.1.20:9877/callback".to_string(),
            &DlnaConfig::default(),
        )
    }

    fn key() -> SubscriptionKey {
        SubscriptionKey {
            udn: Udn::from_str("uuid:0aa02144-59fb-4fd7-b179-a7c07357dba8").unwrap(),
            service_id: "urn:upnp-org:serviceId:AVTransport".to_string(),
        }
    }

    /// Publisher stub answering SUBSCRIBE/UNSUBSCRIBE and counting calls.
    async fn spawn_publisher(granted_timeout: &'static str) -> (reqwest::Url, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let handler = move |headers: HeaderMap| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                let sid = headers
                    .get("SID")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("uuid:sub-1")
                    .to_string();
                (
                    [
                        ("SID", sid),
                        ("TIMEOUT", granted_timeout.to_string()),
                    ],
                    "",
                )
            }
        };
        let router = axum::Router::new().route("/event", axum::routing::any(handler));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        let url = reqwest::Url::parse(&format!("http://{addr}/event")).unwrap();
        (url, calls)
    }

    #[test]
    fn renew_guard_is_at_least_thirty_seconds_and_scales() {
        assert_eq!(renew_guard_ms(60), 30_000);
        assert_eq!(renew_guard_ms(600), 60_000);
        assert_eq!(renew_guard_ms(1800), 180_000);
        // tiny grants never push the guard past the whole window
        assert_eq!(renew_guard_ms(10), 10_000);
    }

    #[tokio::test]
    async fn subscribe_sets_sid_and_expiry_from_response() {
        let (url, calls) = spawn_publisher("Second-60").await;
        let mut manager = manager();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let sid = manager
            .subscribe(
                key(),
                url,
                60,
                Arc::new(move |sid, name, value| {
                    sink.lock().unwrap().push((
                        sid.to_string(),
                        name.to_string(),
                        value.to_string(),
                    ));
                }),
                1_000,
            )
            .await
            .unwrap();
        assert_eq!(sid, "uuid:sub-1");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let subscription = manager.subscription(&key()).unwrap();
        assert_eq!(subscription.state(), SubscriptionState::Subscribed);
        // expires_at - confirmed_at == n * 1000
        assert_eq!(subscription.expires_at_ms(), 1_000 + 60_000);

        // second live subscription for the same service is refused
        let err = manager
            .subscribe(key(), "http://127.0.0.1:1/event".parse().unwrap(), 60, Arc::new(|_, _, _| {}), 2_000)
            .await
            .unwrap_err();
        assert!(matches!(err, DlnaError::State(_)));

        // inbound NOTIFY reaches the callback per property
        let body = br#"<e:propertyset xmlns:e="urn:schemas-upnp-org:event-1-0"><e:property><TransportState>PLAYING</TransportState></e:property></e:propertyset>"#;
        manager.deliver_notify("uuid:sub-1", 0, body);
        let events = seen.lock().unwrap().clone();
        assert_eq!(
            events,
            vec![(
                "uuid:sub-1".to_string(),
                "TransportState".to_string(),
                "PLAYING".to_string()
            )]
        );
    }

    #[tokio::test]
    async fn renewal_preserves_sid_and_runs_before_expiry() {
        let (url, calls) = spawn_publisher("Second-60").await;
        let mut manager = manager();
        manager
            .subscribe(key(), url, 60, Arc::new(|_, _, _| {}), 0)
            .await
            .unwrap();
        // nothing due yet
        manager.tick(10_000).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        // due strictly before the 60s expiry
        manager.tick(30_000).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        let subscription = manager.subscription(&key()).unwrap();
        assert_eq!(subscription.state(), SubscriptionState::Subscribed);
        assert_eq!(subscription.sid(), Some("uuid:sub-1"));
        assert_eq!(subscription.expires_at_ms(), 30_000 + 60_000);
    }

    #[tokio::test]
    async fn expiry_without_renewal_goes_quiet() {
        let (url, calls) = spawn_publisher("Second-60").await;
        let mut manager = manager();
        manager
            .subscribe(key(), url, 60, Arc::new(|_, _, _| {}), 0)
            .await
            .unwrap();
        manager.force_renew_due(&key(), 61_000);
        manager.tick(61_000).await;
        let subscription = manager.subscription(&key()).unwrap();
        assert_eq!(subscription.state(), SubscriptionState::Unsubscribed);
        assert_eq!(subscription.sid(), None);
        // no renewal traffic was emitted
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unsubscribe_clears_state() {
        let (url, calls) = spawn_publisher("Second-60").await;
        let mut manager = manager();
        manager
            .subscribe(key(), url, 60, Arc::new(|_, _, _| {}), 0)
            .await
            .unwrap();
        manager.unsubscribe(&key(), 1_000).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(
            manager.state(&key()),
            Some(SubscriptionState::Unsubscribed)
        );
        // nothing live anymore
        let err = manager.unsubscribe(&key(), 2_000).await.unwrap_err();
        assert!(matches!(err, DlnaError::State(_)));
    }

    #[tokio::test]
    async fn byebye_cancels_device_subscriptions() {
        let (url, _) = spawn_publisher("Second-60").await;
        let mut manager = manager();
        manager
            .subscribe(key(), url, 60, Arc::new(|_, _, _| {}), 0)
            .await
            .unwrap();
        manager.cancel_for_device(&key().udn);
        assert_eq!(
            manager.state(&key()),
            Some(SubscriptionState::Unsubscribed)
        );
    }
}
