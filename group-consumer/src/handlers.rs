use async_trait::async_trait;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::event::Message;
use crate::kafka::source::MessageHandler;

/// Payload of the product events published on the default topic
#[derive(Debug, Deserialize, PartialEq)]
pub struct ProductCreated {
    pub id: String,
    pub name: String,
}

/// Logs every received event. Product creations are decoded and logged with
/// their fields, other event types only with their envelope.
#[derive(Debug, Default, Clone)]
pub struct LogEventHandler;

#[async_trait]
impl MessageHandler for LogEventHandler {
    async fn handle(&self, cancel: CancellationToken, message: Message) -> anyhow::Result<()> {
        if cancel.is_cancelled() {
            return Ok(());
        }

        let envelope = &message.value;
        match envelope.event_type.as_str() {
            "product_created" => {
                let product: ProductCreated = envelope.json_data()?;
                info!(
                    partition = %message.partition,
                    offset = message.offset,
                    event_id = %envelope.event_id,
                    product_id = %product.id,
                    product_name = %product.name,
                    "Product created"
                );
            }
            other => {
                info!(
                    partition = %message.partition,
                    offset = message.offset,
                    event_id = %envelope.event_id,
                    event_type = other,
                    "Event received"
                );
            }
        }
        Ok(())
    }
}
