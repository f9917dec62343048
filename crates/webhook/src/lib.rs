//! Event relay webhook adapter.
//!
//! Implements [`relay::EndpointDispatcher`] over `reqwest`: every event is
//! POSTed as a JSON [`relay::EventEnvelope`] to the endpoint URL, bounded by a
//! per-request timeout.
//!
//! ## Architectural Layer
//!
//! **Infrastructure.** HTTP transport, request formatting and response
//! classification live here. The engine sees only
//! [`relay::EndpointDispatcher`] and [`relay::DeliveryError`].
//!
//! ## Response classification
//!
//! | Outcome | Result |
//! |---------|--------|
//! | 2xx | `Ok(())` |
//! | 500 | [`DeliveryError::EndpointInternalError`] |
//! | any other status | [`DeliveryError::Failed`] with status and body |
//! | timeout elapsed | [`DeliveryError::Timeout`] |
//! | no response | [`DeliveryError::Transport`] |
//! | cancellation token fired | [`DeliveryError::Cancelled`] |

use std::time::Duration;

use async_trait::async_trait;
use relay::{DeliveryError, Endpoint, EndpointDispatcher, EventEnvelope};
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::StatusCode;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Upper bound on a single delivery, response body included.
pub const DEFAULT_DELIVERY_TIMEOUT: Duration = Duration::from_secs(100);

const JSON: &str = "application/json";

/// Failure building the HTTP client.
#[derive(Debug, Error)]
pub enum DispatcherError {
    #[error("Failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}

/// Tunables for [`HttpEndpointDispatcher`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpDispatcherConfig {
    pub timeout: Duration,
    pub user_agent: String,
}

impl Default for HttpDispatcherConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_DELIVERY_TIMEOUT,
            user_agent: concat!("event-relay/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

/// POSTs events to webhook endpoints.
#[derive(Debug, Clone)]
pub struct HttpEndpointDispatcher {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpEndpointDispatcher {
    pub fn new(config: HttpDispatcherConfig) -> Result<Self, DispatcherError> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent)
            .build()?;
        Ok(Self {
            client,
            timeout: config.timeout,
        })
    }

    async fn post(&self, endpoint: &Endpoint, event: &EventEnvelope) -> Result<(), DeliveryError> {
        let body = serde_json::to_vec(event).map_err(|err| DeliveryError::Serialisation {
            event_id: event.event_id,
            message: err.to_string(),
        })?;

        let response = self
            .client
            .post(&endpoint.url)
            .timeout(self.timeout)
            .header(CONTENT_TYPE, JSON)
            .header(ACCEPT, JSON)
            .body(body)
            .send()
            .await
            .map_err(|err| classify_transport_error(endpoint, event, err))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            return Err(DeliveryError::EndpointInternalError {
                endpoint: endpoint.url.clone(),
            });
        }

        let body = match response.text().await {
            Ok(body) => body,
            Err(err) if err.is_timeout() => {
                return Err(DeliveryError::Timeout {
                    endpoint: endpoint.url.clone(),
                    event_id: event.event_id,
                })
            }
            Err(err) => {
                debug!(endpoint = %endpoint.url, error = %err, "Failed to read response body");
                String::new()
            }
        };

        Err(DeliveryError::Failed {
            endpoint: endpoint.url.clone(),
            status: status.as_u16(),
            body,
        })
    }
}

fn classify_transport_error(
    endpoint: &Endpoint,
    event: &EventEnvelope,
    err: reqwest::Error,
) -> DeliveryError {
    if err.is_timeout() {
        DeliveryError::Timeout {
            endpoint: endpoint.url.clone(),
            event_id: event.event_id,
        }
    } else {
        DeliveryError::Transport {
            endpoint: endpoint.url.clone(),
            event_id: event.event_id,
            message: err.to_string(),
        }
    }
}

#[async_trait]
impl EndpointDispatcher for HttpEndpointDispatcher {
    async fn dispatch(
        &self,
        endpoint: &Endpoint,
        event: &EventEnvelope,
        cancel: &CancellationToken,
    ) -> Result<(), DeliveryError> {
        debug!(
            endpoint = %endpoint.url,
            event_id = %event.event_id,
            subscription_id = %event.subscription_group_id,
            "Posting event"
        );

        let result = tokio::select! {
            _ = cancel.cancelled() => Err(DeliveryError::Cancelled {
                endpoint: endpoint.url.clone(),
            }),
            result = self.post(endpoint, event) => result,
        };

        if let Err(err) = &result {
            warn!(endpoint = %endpoint.url, event_id = %event.event_id, error = %err, "Event delivery failed");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay::{EventId, SubscriptionId};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;
    use uuid::Uuid;

    /// Accepts one connection, answers with `status` after `delay`, and
    /// returns the raw request body.
    async fn serve_once(status: u16, body: &'static str, delay: Duration) -> (String, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/hook", listener.local_addr().unwrap());

        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let request = read_request(&mut socket).await;
            tokio::time::sleep(delay).await;
            let response = format!(
                "HTTP/1.1 {status} Status\r\ncontent-length: {}\r\ncontent-type: text/plain\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            let _ = socket.write_all(response.as_bytes()).await;
            let _ = socket.shutdown().await;
            request
        });

        (url, handle)
    }

    async fn read_request(socket: &mut tokio::net::TcpStream) -> String {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            let n = socket.read(&mut chunk).await.unwrap();
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
            let text = String::from_utf8_lossy(&buf);
            if let Some(split) = text.find("\r\n\r\n") {
                let length = text[..split]
                    .lines()
                    .find_map(|l| {
                        let (name, value) = l.split_once(':')?;
                        name.eq_ignore_ascii_case("content-length")
                            .then(|| value.trim().parse::<usize>().ok())
                            .flatten()
                    })
                    .unwrap_or(0);
                if buf.len() >= split + 4 + length {
                    return text.into_owned();
                }
            }
        }
        String::from_utf8_lossy(&buf).into_owned()
    }

    fn endpoint(url: &str) -> Endpoint {
        Endpoint {
            id: SubscriptionId::from_uuid(Uuid::from_u128(1)),
            name: "billing".into(),
            url: url.to_string(),
        }
    }

    fn event() -> EventEnvelope {
        EventEnvelope {
            event_id: EventId::from_uuid(Uuid::from_u128(42)),
            serialised_data: r#"{"orderId":7}"#.into(),
            subscription_group_id: SubscriptionId::from_uuid(Uuid::from_u128(1)),
        }
    }

    fn dispatcher(timeout: Duration) -> HttpEndpointDispatcher {
        HttpEndpointDispatcher::new(HttpDispatcherConfig {
            timeout,
            ..HttpDispatcherConfig::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn success_status_is_acknowledged_and_body_is_the_envelope() {
        let (url, server) = serve_once(200, "ok", Duration::ZERO).await;

        dispatcher(Duration::from_secs(5))
            .dispatch(&endpoint(&url), &event(), &CancellationToken::new())
            .await
            .unwrap();

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /hook HTTP/1.1"));
        assert!(request.to_ascii_lowercase().contains("content-type: application/json"));
        let body = request.split("\r\n\r\n").nth(1).unwrap();
        let json: serde_json::Value = serde_json::from_str(body).unwrap();
        assert_eq!(json["serialisedData"], r#"{"orderId":7}"#);
        assert_eq!(json["eventId"], Uuid::from_u128(42).to_string());
        assert_eq!(json["subscriptionGroupId"], Uuid::from_u128(1).to_string());
    }

    #[tokio::test]
    async fn client_error_carries_status_and_body() {
        let (url, _server) = serve_once(404, "no such hook", Duration::ZERO).await;

        let err = dispatcher(Duration::from_secs(5))
            .dispatch(&endpoint(&url), &event(), &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(
            err,
            DeliveryError::Failed {
                endpoint: url,
                status: 404,
                body: "no such hook".into(),
            }
        );
    }

    #[tokio::test]
    async fn server_error_is_classified_separately() {
        let (url, _server) = serve_once(500, "boom", Duration::ZERO).await;

        let err = dispatcher(Duration::from_secs(5))
            .dispatch(&endpoint(&url), &event(), &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(err, DeliveryError::EndpointInternalError { endpoint: url });
        assert!(err.retry_policy().is_retryable());
    }

    #[tokio::test]
    async fn other_server_statuses_are_delivery_failures() {
        let (url, _server) = serve_once(503, "busy", Duration::ZERO).await;

        let err = dispatcher(Duration::from_secs(5))
            .dispatch(&endpoint(&url), &event(), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, DeliveryError::Failed { status: 503, .. }));
    }

    #[tokio::test]
    async fn slow_endpoint_times_out() {
        let (url, _server) = serve_once(200, "late", Duration::from_secs(2)).await;

        let err = dispatcher(Duration::from_millis(100))
            .dispatch(&endpoint(&url), &event(), &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(
            err,
            DeliveryError::Timeout {
                endpoint: url,
                event_id: event().event_id,
            }
        );
    }

    #[tokio::test]
    async fn cancellation_abandons_the_request() {
        let (url, _server) = serve_once(200, "late", Duration::from_secs(2)).await;
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let err = dispatcher(Duration::from_secs(5))
            .dispatch(&endpoint(&url), &event(), &cancel)
            .await
            .unwrap_err();

        assert_eq!(err, DeliveryError::Cancelled { endpoint: url });
        assert!(!err.retry_policy().is_retryable());
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_a_transport_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/hook", listener.local_addr().unwrap());
        drop(listener);

        let err = dispatcher(Duration::from_secs(5))
            .dispatch(&endpoint(&url), &event(), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, DeliveryError::Transport { .. }));
    }

    #[test]
    fn default_timeout_is_one_hundred_seconds() {
        assert_eq!(HttpDispatcherConfig::default().timeout, Duration::from_secs(100));
    }
}
