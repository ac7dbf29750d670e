//! Optional message-bus sink: a thin `redis` connection-manager wrapper
//! repurposed from a read/write cache client into a publish-only delivery
//! target.

use std::sync::Arc;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};

use crate::error::{AgentError, Result};
use crate::record::Record;

use super::Sink;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageBusConfig {
    pub url: String,
    pub channel: String,
}

pub struct MessageBusSink {
    name: String,
    channel: String,
    conn: ConnectionManager,
}

impl std::fmt::Debug for MessageBusSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBusSink").field("name", &self.name).field("channel", &self.channel).finish()
    }
}

impl MessageBusSink {
    pub async fn connect(name: impl Into<String>, config: MessageBusConfig) -> Result<Self> {
        let client = redis::Client::open(config.url.as_str())
            .map_err(|e| AgentError::Config(format!("invalid message bus url: {e}")))?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(|e| AgentError::SinkTransient { sink: "message_bus".into(), message: e.to_string() })?;
        Ok(MessageBusSink { name: name.into(), channel: config.channel, conn })
    }
}

#[async_trait]
impl Sink for MessageBusSink {
    async fn send(&self, records: &[Arc<Record>]) -> Result<()> {
        let mut conn = self.conn.clone();
        for record in records {
            let payload = serde_json::to_string(record.as_ref())?;
            let published: redis::RedisResult<i64> = conn.publish(&self.channel, payload).await;
            published.map_err(|e| AgentError::SinkTransient { sink: "message_bus".into(), message: e.to_string() })?;
        }
        Ok(())
    }

    fn is_healthy(&self) -> bool {
        true
    }

    fn name(&self) -> &str {
        &self.name
    }
}
