use std::time::Duration;

use async_trait::async_trait;
use metrics::{counter, gauge};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{DeliveryFuture, FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use rdkafka::ClientConfig;
use tracing::{debug, error, info, info_span, instrument, Instrument};

use crate::config::KafkaConfig;
use crate::error::DispatchError;
use crate::sinks::{BusMessage, RoutingBus};

struct KafkaContext;

impl rdkafka::ClientContext for KafkaContext {
    fn stats(&self, stats: rdkafka::Statistics) {
        gauge!("ingest_kafka_callback_queue_depth").set(stats.replyq as f64);
        gauge!("ingest_kafka_producer_queue_depth").set(stats.msg_cnt as f64);
        gauge!("ingest_kafka_producer_queue_depth_limit").set(stats.msg_max as f64);
        gauge!("ingest_kafka_producer_queue_bytes_limit").set(stats.msg_size_max as f64);

        for (_, stats) in stats.brokers {
            let id_string = format!("{}", stats.nodeid);
            if let Some(rtt) = stats.rtt {
                gauge!(
                    "ingest_kafka_produce_rtt_latency_us",
                    "quantile" => "p50",
                    "broker" => id_string.clone()
                )
                .set(rtt.p50 as f64);
                gauge!(
                    "ingest_kafka_produce_rtt_latency_us",
                    "quantile" => "p99",
                    "broker" => id_string.clone()
                )
                .set(rtt.p99 as f64);
            }
            counter!(
                "ingest_kafka_broker_tx_errors_total",
                "broker" => id_string
            )
            .absolute(stats.txerrs);
        }
    }
}

/// Routing bus on a single Kafka topic. Consumers route on the `source` and `detail-type`
/// headers; the remaining message attributes are carried as headers too.
#[derive(Clone)]
pub struct KafkaBus {
    producer: FutureProducer<KafkaContext>,
    topic: String,
}

impl KafkaBus {
    pub fn new(config: &KafkaConfig) -> anyhow::Result<KafkaBus> {
        info!("connecting to Kafka brokers at {}...", config.kafka_hosts);

        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &config.kafka_hosts)
            .set("statistics.interval.ms", "10000")
            .set("linger.ms", config.kafka_producer_linger_ms.to_string())
            .set(
                "message.max.bytes",
                config.kafka_producer_message_max_bytes.to_string(),
            )
            .set(
                "message.timeout.ms",
                config.kafka_message_timeout_ms.to_string(),
            )
            .set("compression.codec", &config.kafka_compression_codec)
            .set(
                "queue.buffering.max.kbytes",
                (config.kafka_producer_queue_mib * 1024).to_string(),
            );

        if config.kafka_tls {
            client_config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        };

        debug!("rdkafka configuration: {:?}", client_config);
        let producer: FutureProducer<KafkaContext> =
            client_config.create_with_context(KafkaContext)?;

        // Fail startup if brokers are unreachable within 10 seconds
        drop(producer.client().fetch_metadata(
            Some(&config.kafka_bus_topic),
            Timeout::After(Duration::new(10, 0)),
        )?);
        info!("connected to Kafka brokers");

        Ok(KafkaBus {
            producer,
            topic: config.kafka_bus_topic.clone(),
        })
    }

    pub fn flush(&self) -> Result<(), KafkaError> {
        self.producer.flush(Duration::new(30, 0))
    }

    fn kafka_send(&self, message: &BusMessage) -> Result<DeliveryFuture, DispatchError> {
        let payload = serde_json::to_string(&message.detail).map_err(|e| {
            error!("failed to serialize bus message: {}", e);
            DispatchError::Serialization(e.to_string())
        })?;

        let mut headers = OwnedHeaders::new()
            .insert(Header {
                key: "source",
                value: Some(message.source.as_str()),
            })
            .insert(Header {
                key: "detail-type",
                value: Some(message.detail_type.as_str()),
            });
        for (key, value) in &message.attributes {
            headers = headers.insert(Header {
                key: key.as_str(),
                value: Some(value.as_str()),
            });
        }

        match self.producer.send_result(FutureRecord {
            topic: &self.topic,
            payload: Some(&payload),
            partition: None,
            key: Some(message.key.as_str()),
            timestamp: None,
            headers: Some(headers),
        }) {
            Ok(ack) => Ok(ack),
            Err((e, _)) => match e.rdkafka_error_code() {
                Some(RDKafkaErrorCode::MessageSizeTooLarge) => Err(DispatchError::MessageTooBig),
                _ => {
                    error!("failed to produce bus message: {}", e);
                    Err(DispatchError::Bus(e.to_string()))
                }
            },
        }
    }

    async fn process_ack(delivery: DeliveryFuture) -> Result<(), DispatchError> {
        match delivery.await {
            Err(_) => {
                counter!("ingest_kafka_produce_errors_total").increment(1);
                error!("failed to produce to Kafka before write timeout");
                Err(DispatchError::Bus("delivery cancelled".to_owned()))
            }
            Ok(Err((KafkaError::MessageProduction(RDKafkaErrorCode::MessageSizeTooLarge), _))) => {
                Err(DispatchError::MessageTooBig)
            }
            Ok(Err((err, _))) => {
                counter!("ingest_kafka_produce_errors_total").increment(1);
                error!("failed to produce to Kafka: {}", err);
                Err(DispatchError::Bus(err.to_string()))
            }
            Ok(Ok(_)) => Ok(()),
        }
    }
}

#[async_trait]
impl RoutingBus for KafkaBus {
    #[instrument(skip_all, fields(source = %message.source, detail_type = %message.detail_type))]
    async fn publish(&self, message: BusMessage) -> Result<(), DispatchError> {
        let ack = self.kafka_send(&message)?;
        Self::process_ack(ack)
            .instrument(info_span!("ack_wait_one"))
            .await
    }
}
