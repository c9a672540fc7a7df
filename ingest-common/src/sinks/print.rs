use async_trait::async_trait;
use metrics::counter;
use tracing::info;

use crate::error::DispatchError;
use crate::queue::{MessageQueue, QueueMessage};
use crate::sinks::{BusMessage, RoutingBus};

/// Logs every message instead of sending it. Stands in for both the bus and the outbound
/// queue when running with `PRINT_SINK=true`.
pub struct PrintSink {}

#[async_trait]
impl RoutingBus for PrintSink {
    async fn publish(&self, message: BusMessage) -> Result<(), DispatchError> {
        info!(
            source = %message.source,
            detail_type = %message.detail_type,
            "bus message: {}",
            message.detail
        );
        counter!("ingest_print_sink_messages_total", "sink" => "bus").increment(1);

        Ok(())
    }
}

#[async_trait]
impl MessageQueue for PrintSink {
    async fn enqueue(&self, message: QueueMessage) -> Result<(), DispatchError> {
        info!(attributes = ?message.attributes, "queue message: {}", message.body);
        counter!("ingest_print_sink_messages_total", "sink" => "queue").increment(1);

        Ok(())
    }
}
