use std::{collections::HashMap, sync::Mutex};

use crate::{config::DlnaConfig, eventing::PropertySet, DlnaError, IntoXml};

/// Lease granted when the subscriber does not ask for a specific timeout.
const DEFAULT_TIMEOUT_SECONDS: u32 = 1800;

fn notify_method() -> reqwest::Method {
    reqwest::Method::from_bytes(b"NOTIFY").expect("valid method")
}

/// Split a CALLBACK header (`<url1><url2>…`) into urls, keeping only the
/// ones that parse.
fn parse_callback_header(value: &str) -> Vec<reqwest::Url> {
    value
        .split('<')
        .filter_map(|part| {
            let (url, _) = part.split_once('>')?;
            reqwest::Url::parse(url.trim()).ok()
        })
        .collect()
}

#[derive(Debug, Clone)]
struct Subscriber {
    sid: String,
    service_id: String,
    callbacks: Vec<reqwest::Url>,
    expires_at_ms: u64,
    seq: u32,
}

/// Device side of GENA: accepts subscriptions on the event endpoints and
/// fans property changes out to every subscriber. The subscriber table is
/// the one piece of state shared with the HTTP handlers, hence the mutex.
pub struct EventPublisher {
    client: reqwest::Client,
    subscribers: Mutex<HashMap<String, Subscriber>>,
    max_retries: u32,
}

impl EventPublisher {
    pub fn new(client: reqwest::Client, config: &DlnaConfig) -> Self {
        Self {
            client,
            subscribers: Mutex::new(HashMap::new()),
            max_retries: config.max_notify_retries,
        }
    }

    /// Register a subscriber; returns the assigned SID and granted lease.
    pub fn subscribe(
        &self,
        service_id: &str,
        callback_header: &str,
        timeout_seconds: Option<u32>,
        now_ms: u64,
    ) -> Result<(String, u32), DlnaError> {
        let callbacks = parse_callback_header(callback_header);
        if callbacks.is_empty() {
            return Err(DlnaError::Protocol(anyhow::anyhow!(
                "CALLBACK header without a usable url: {callback_header}"
            )));
        }
        let seconds = timeout_seconds.unwrap_or(DEFAULT_TIMEOUT_SECONDS);
        let sid = format!("uuid:{}", uuid::Uuid::new_v4());
        let subscriber = Subscriber {
            sid: sid.clone(),
            service_id: service_id.to_string(),
            callbacks,
            expires_at_ms: now_ms + u64::from(seconds) * 1000,
            seq: 0,
        };
        tracing::info!(sid = %sid, service = %service_id, timeout = seconds, "New subscriber");
        self.subscribers
            .lock()
            .expect("subscriber table not poisoned")
            .insert(sid.clone(), subscriber);
        Ok((sid, seconds))
    }

    /// Extend an existing lease; the SID stays the same.
    pub fn renew(
        &self,
        sid: &str,
        timeout_seconds: Option<u32>,
        now_ms: u64,
    ) -> Result<u32, DlnaError> {
        let seconds = timeout_seconds.unwrap_or(DEFAULT_TIMEOUT_SECONDS);
        let mut subscribers = self
            .subscribers
            .lock()
            .expect("subscriber table not poisoned");
        let Some(subscriber) = subscribers.get_mut(sid) else {
            return Err(DlnaError::State("renewal for unknown subscription"));
        };
        subscriber.expires_at_ms = now_ms + u64::from(seconds) * 1000;
        tracing::debug!(sid = %sid, timeout = seconds, "Renewed subscriber");
        Ok(seconds)
    }

    pub fn unsubscribe(&self, sid: &str) -> Result<(), DlnaError> {
        let removed = self
            .subscribers
            .lock()
            .expect("subscriber table not poisoned")
            .remove(sid);
        match removed {
            Some(_) => Ok(()),
            None => Err(DlnaError::State("cancel for unknown subscription")),
        }
    }

    /// Drop subscribers whose lease ran out.
    pub fn sweep_expired(&self, now_ms: u64) {
        self.subscribers
            .lock()
            .expect("subscriber table not poisoned")
            .retain(|sid, subscriber| {
                let live = subscriber.expires_at_ms > now_ms;
                if !live {
                    tracing::debug!(sid = %sid, "Subscriber lease expired");
                }
                live
            });
    }

    pub fn subscriber_count(&self, service_id: &str) -> usize {
        self.subscribers
            .lock()
            .expect("subscriber table not poisoned")
            .values()
            .filter(|s| s.service_id == service_id)
            .count()
    }

    /// NOTIFY every subscriber of `service_id` about changed variables.
    /// Delivery failures are retried up to the configured budget, then the
    /// subscriber is dropped.
    pub async fn notify_all(&self, service_id: &str, set: &PropertySet) {
        let body = match set.into_string() {
            Ok(body) => body,
            Err(e) => {
                tracing::warn!("Cannot serialize propertyset: {e}");
                return;
            }
        };
        let targets: Vec<Subscriber> = self
            .subscribers
            .lock()
            .expect("subscriber table not poisoned")
            .values()
            .filter(|s| s.service_id == service_id)
            .cloned()
            .collect();
        for subscriber in targets {
            let delivered = self.deliver(&subscriber, &body).await;
            let mut subscribers = self
                .subscribers
                .lock()
                .expect("subscriber table not poisoned");
            if delivered {
                if let Some(subscriber) = subscribers.get_mut(&subscriber.sid) {
                    subscriber.seq = subscriber.seq.wrapping_add(1);
                }
            } else {
                tracing::warn!(sid = %subscriber.sid, "Dropping unreachable subscriber");
                subscribers.remove(&subscriber.sid);
            }
        }
    }

    async fn deliver(&self, subscriber: &Subscriber, body: &str) -> bool {
        for url in &subscriber.callbacks {
            for attempt in 0..=self.max_retries {
                let request = self
                    .client
                    .request(notify_method(), url.clone())
                    .header("CONTENT-TYPE", "text/xml; charset=\"utf-8\"")
                    .header("NT", "upnp:event")
                    .header("NTS", "upnp:propchange")
                    .header("SID", &subscriber.sid)
                    .header("SEQ", subscriber.seq.to_string())
                    .body(body.to_string());
                match request.send().await {
                    Ok(response) if response.status().is_success() => {
                        return true;
                    }
                    Ok(response) => {
                        tracing::debug!(
                            sid = %subscriber.sid,
                            attempt,
                            status = %response.status(),
                            "Subscriber refused NOTIFY"
                        );
                    }
                    Err(e) => {
                        tracing::debug!(sid = %subscriber.sid, attempt, "NOTIFY failed: {e}");
                    }
                }
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use axum::http::HeaderMap;

    use crate::{config::DlnaConfig, eventing::PropertySet, DlnaError};

    use super::{parse_callback_header, EventPublisher};

    fn publisher() -> EventPublisher {
        EventPublisher::new(reqwest::Client::new(), &DlnaConfig::default())
    }

    #[test]
    fn callback_header_forms() {
        let urls = parse_callback_header("<http://192.168.1.20:9877/callback>");
        assert_eq!(urls.len(), 1);
        let urls =
            parse_callback_header("<http://192.168.1.20:9877/cb1><http://192.168.1.21:80/cb2>");
        assert_eq!(urls.len(), 2);
        assert!(parse_callback_header("not a url").is_empty());
    }

    #[test]
    fn subscribe_renew_expire_lifecycle() {
        let publisher = publisher();
        let (sid, seconds) = publisher
            .subscribe("svc", "<http://192.168.1.20:9877/callback>", Some(60), 0)
            .unwrap();
        assert!(sid.starts_with("uuid:"));
        assert_eq!(seconds, 60);
        assert_eq!(publisher.subscriber_count("svc"), 1);

        assert_eq!(publisher.renew(&sid, Some(120), 30_000).unwrap(), 120);
        // lease now runs to 150s; a sweep at 100s keeps it
        publisher.sweep_expired(100_000);
        assert_eq!(publisher.subscriber_count("svc"), 1);
        publisher.sweep_expired(151_000);
        assert_eq!(publisher.subscriber_count("svc"), 0);

        assert!(matches!(
            publisher.renew(&sid, None, 0),
            Err(DlnaError::State(_))
        ));
    }

    #[test]
    fn subscribe_without_callback_is_rejected() {
        let publisher = publisher();
        assert!(matches!(
            publisher.subscribe("svc", "nonsense", None, 0),
            Err(DlnaError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn notify_reaches_subscriber_with_increasing_seq() {
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        let handler = move |headers: HeaderMap, body: String| {
            let sink = sink.clone();
            async move {
                let seq = headers
                    .get("SEQ")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_string();
                sink.lock().unwrap().push((seq, body));
                ""
            }
        };
        let router = axum::Router::new().route("/callback", axum::routing::any(handler));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        let publisher = publisher();
        publisher
            .subscribe("svc", &format!("<http://{addr}/callback>"), Some(60), 0)
            .unwrap();
        publisher
            .notify_all("svc", &PropertySet::single("TransportState", "PLAYING"))
            .await;
        publisher
            .notify_all("svc", &PropertySet::single("TransportState", "STOPPED"))
            .await;

        let received = received.lock().unwrap().clone();
        assert_eq!(received.len(), 2);
        assert_eq!(received[0].0, "0");
        assert!(received[0].1.contains("<TransportState>PLAYING</TransportState>"));
        assert_eq!(received[1].0, "1");
    }

    #[tokio::test]
    async fn unreachable_subscriber_is_dropped_after_retries() {
        let publisher = publisher();
        publisher
            .subscribe("svc", "<http://127.0.0.1:9/callback>", Some(60), 0)
            .unwrap();
        publisher
            .notify_all("svc", &PropertySet::single("Mute", "1"))
            .await;
        assert_eq!(publisher.subscriber_count("svc"), 0);
    }
}
