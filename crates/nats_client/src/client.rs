//! NATS client implementation of the bus interface.

use crate::error::BusError;
use crate::traits::{BusClient, BusSubscription, EventHandler, ReconnectHandler, ReplyCallback};
use bytes::Bytes;
use futures::StreamExt;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Default reply timeout for requests.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(3);

/// Wrapper around the NATS core client.
///
/// Requests and subscriptions are driven on the tokio runtime captured
/// at connect time, so the callback-shaped [`BusClient`] methods can be
/// called from any thread.
#[derive(Clone)]
pub struct NatsClient {
    client: async_nats::Client,
    handle: tokio::runtime::Handle,
    request_timeout: Duration,
    reconnect: broadcast::Sender<()>,
}

impl NatsClient {
    /// Connect to a NATS server.
    ///
    /// The initial connect fires the connection event before anyone
    /// can have registered a reconnect handler, so only genuine
    /// reconnects reach [`BusClient::on_reconnect`] handlers.
    pub async fn connect(url: &str, request_timeout: Duration) -> Result<Self, BusError> {
        info!("Connecting to NATS at {}", url);
        let (reconnect, _) = broadcast::channel(16);
        let event_tx = reconnect.clone();
        let client = async_nats::ConnectOptions::new()
            .event_callback(move |event| {
                let event_tx = event_tx.clone();
                async move {
                    match event {
                        async_nats::Event::Connected => {
                            info!("NATS connection established");
                            let _ = event_tx.send(());
                        }
                        async_nats::Event::Disconnected => {
                            warn!("NATS connection lost");
                        }
                        other => debug!("NATS event: {}", other),
                    }
                }
            })
            .connect(url)
            .await
            .map_err(|e| BusError::Connection(e.to_string()))?;

        Ok(Self {
            client,
            handle: tokio::runtime::Handle::current(),
            request_timeout,
            reconnect,
        })
    }
}

impl BusClient for NatsClient {
    fn send_request(&self, subject: &str, payload: Bytes, callback: ReplyCallback) {
        let client = self.client.clone();
        let subject = subject.to_string();
        let timeout = self.request_timeout;
        self.handle.spawn(async move {
            let result = match tokio::time::timeout(
                timeout,
                client.request(subject.clone(), payload),
            )
            .await
            {
                Err(_) => Err(BusError::Timeout),
                Ok(Err(err)) => Err(match err.kind() {
                    async_nats::RequestErrorKind::TimedOut => BusError::Timeout,
                    async_nats::RequestErrorKind::NoResponders => {
                        BusError::NoResponders(subject.clone())
                    }
                    async_nats::RequestErrorKind::Other => BusError::Connection(err.to_string()),
                }),
                Ok(Ok(message)) => Ok(message.payload),
            };
            if let Err(ref err) = result {
                debug!("Request to {} failed: {}", subject, err);
            }
            callback(result);
        });
    }

    fn subscribe(
        &self,
        subject: &str,
        handler: EventHandler,
    ) -> Result<Box<dyn BusSubscription>, BusError> {
        let client = self.client.clone();
        let subject = subject.to_string();
        let task = self.handle.spawn(async move {
            let mut subscriber = match client.subscribe(subject.clone()).await {
                Ok(subscriber) => subscriber,
                Err(err) => {
                    error!("Failed to subscribe to {}: {}", subject, err);
                    return;
                }
            };
            debug!("Subscribed to {}", subject);
            while let Some(message) = subscriber.next().await {
                handler(message.subject.as_str(), message.payload);
            }
            debug!("Subscription to {} ended", subject);
        });
        Ok(Box::new(NatsSubscription { task }))
    }

    fn on_reconnect(&self, handler: ReconnectHandler) {
        let mut rx = self.reconnect.subscribe();
        self.handle.spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(()) | Err(broadcast::error::RecvError::Lagged(_)) => handler(),
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }
}

struct NatsSubscription {
    task: JoinHandle<()>,
}

impl BusSubscription for NatsSubscription {}

impl Drop for NatsSubscription {
    fn drop(&mut self) {
        // Dropping the inner Subscriber unsubscribes from the server.
        self.task.abort();
    }
}
