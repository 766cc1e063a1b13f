//! Redis Pub/Sub backplane.

use async_trait::async_trait;
use futures::StreamExt;
use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;
use std::time::Duration;
use tokio::sync::mpsc;

use super::{Backplane, BackplaneError, TransportEvent};

/// Configuration for RedisBackplane.
#[derive(Debug, Clone)]
pub struct RedisBackplaneConfig {
    /// Redis connection URL, e.g. `redis://localhost:6379`.
    pub url: String,

    /// First delay before reconnecting a lost subscription.
    pub reconnect_delay: Duration,

    /// Upper bound for the reconnect delay.
    pub max_reconnect_delay: Duration,
}

impl Default for RedisBackplaneConfig {
    fn default() -> Self {
        RedisBackplaneConfig {
            url: "redis://localhost:6379".to_string(),
            reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(300),
        }
    }
}

/// Backplane over Redis Pub/Sub.
///
/// Publishing uses a multiplexed connection; every subscription gets a dedicated
/// pub/sub connection that reconnects with exponential backoff and reports
/// [`TransportEvent::Reconnected`] once it is back.
pub struct RedisBackplane {
    client: redis::Client,
    connection: MultiplexedConnection,
    config: RedisBackplaneConfig,
}

impl RedisBackplane {
    pub async fn new(config: RedisBackplaneConfig) -> Result<Self, BackplaneError> {
        let client = redis::Client::open(config.url.as_str()).map_err(|e| {
            BackplaneError::Unavailable(format!("failed to create Redis client: {e}"))
        })?;
        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| BackplaneError::Unavailable(format!("failed to connect to Redis: {e}")))?;

        Ok(RedisBackplane {
            client,
            connection,
            config,
        })
    }
}

#[async_trait]
impl Backplane for RedisBackplane {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<(), BackplaneError> {
        let mut conn = self.connection.clone();
        conn.publish::<_, _, ()>(channel, payload)
            .await
            .map_err(|e| BackplaneError::Publish(e.to_string()))
    }

    async fn subscribe(
        &self,
        channel: &str,
        sender: mpsc::Sender<TransportEvent>,
    ) -> Result<(), BackplaneError> {
        // Fail fast if the first subscription cannot be established.
        let pubsub = open_subscription(&self.client, channel).await?;

        let client = self.client.clone();
        let channel = channel.to_string();
        let config = self.config.clone();

        tokio::spawn(async move {
            let mut pubsub = Some(pubsub);
            let mut backoff = config.reconnect_delay;

            loop {
                let current = match pubsub.take() {
                    Some(current) => current,
                    None => match open_subscription(&client, &channel).await {
                        Ok(current) => {
                            tracing::info!(channel = %channel, "backplane subscription restored");
                            backoff = config.reconnect_delay;
                            if sender.send(TransportEvent::Reconnected).await.is_err() {
                                return;
                            }
                            current
                        }
                        Err(e) => {
                            tracing::error!(
                                channel = %channel,
                                error = %e,
                                backoff_secs = backoff.as_secs_f64(),
                                "backplane subscription failed, reconnecting..."
                            );
                            tokio::time::sleep(backoff).await;
                            backoff = (backoff * 2).min(config.max_reconnect_delay);
                            continue;
                        }
                    },
                };

                if !forward_messages(current, &sender).await {
                    return;
                }
                tracing::warn!(channel = %channel, "backplane pub/sub connection closed");
            }
        });

        Ok(())
    }
}

async fn open_subscription(
    client: &redis::Client,
    channel: &str,
) -> Result<redis::aio::PubSub, BackplaneError> {
    let mut pubsub = client
        .get_async_pubsub()
        .await
        .map_err(|e| BackplaneError::Subscribe(format!("failed to get pub/sub connection: {e}")))?;
    pubsub
        .subscribe(channel)
        .await
        .map_err(|e| BackplaneError::Subscribe(format!("failed to subscribe: {e}")))?;
    Ok(pubsub)
}

/// Forward messages until the connection drops. Returns `false` once the receiving
/// side is gone and the subscription should end.
async fn forward_messages(
    mut pubsub: redis::aio::PubSub,
    sender: &mpsc::Sender<TransportEvent>,
) -> bool {
    let mut stream = pubsub.on_message();
    while let Some(msg) = stream.next().await {
        let payload: Vec<u8> = msg.get_payload_bytes().to_vec();
        if sender.send(TransportEvent::Message(payload)).await.is_err() {
            return false;
        }
    }
    !sender.is_closed()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    #[ignore = "requires running Redis instance"]
    async fn test_redis_publish_subscribe() {
        let a = RedisBackplane::new(RedisBackplaneConfig::default()).await.unwrap();
        let b = RedisBackplane::new(RedisBackplaneConfig::default()).await.unwrap();

        let (tx, mut rx) = mpsc::channel(8);
        b.subscribe("hybrid-cache:test", tx).await.unwrap();

        a.publish("hybrid-cache:test", b"ping".to_vec()).await.unwrap();
        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap();
        assert_eq!(event, Some(TransportEvent::Message(b"ping".to_vec())));
    }
}
