use std::sync::Arc;

use envconfig::Envconfig;

use ingest_common::config::{EnvMsDuration, NonEmptyString, PipelineConfig};
use ingest_common::error::QueueError;
use ingest_common::pgqueue::PgQueue;
use ingest_common::queue::QueueConsumer;
use ingest_common::retry::RetryPolicy;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3301")]
    pub port: u16,

    #[envconfig(default = "ingest-worker")]
    pub worker_name: String,

    #[envconfig(default = "inbound")]
    pub inbound_queue_name: NonEmptyString,

    #[envconfig(default = "100")]
    pub poll_interval: EnvMsDuration,

    #[envconfig(default = "64")]
    pub max_concurrent_jobs: usize,

    #[envconfig(from = "EXPIRY_INTERVAL_MS", default = "60000")]
    pub expiry_interval: EnvMsDuration,

    #[envconfig(nested = true)]
    pub retry_policy: RetryPolicyConfig,

    #[envconfig(nested = true)]
    pub pipeline: PipelineConfig,
}

impl Config {
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// The queue to consume. None in print mode, where nothing is ever delivered to it.
    pub async fn inbound_queue(&self) -> Result<Option<Arc<dyn QueueConsumer>>, QueueError> {
        if self.pipeline.print_sink {
            return Ok(None);
        }

        let queue = PgQueue::new(
            self.inbound_queue_name.as_str(),
            &self.pipeline.database_url,
            self.pipeline.max_pg_connections,
            self.pipeline.visibility_timeout.0,
        )
        .await?;
        Ok(Some(Arc::new(queue)))
    }
}

#[derive(Envconfig, Clone)]
pub struct RetryPolicyConfig {
    #[envconfig(default = "2")]
    pub backoff_coefficient: u32,

    #[envconfig(default = "1000")]
    pub initial_interval: EnvMsDuration,

    #[envconfig(default = "100000")]
    pub maximum_interval: EnvMsDuration,
}

impl RetryPolicyConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.backoff_coefficient, self.initial_interval.0)
            .with_maximum_interval(self.maximum_interval.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time;

    #[test]
    fn retry_policy_from_env() {
        let env = HashMap::from([
            ("BACKOFF_COEFFICIENT".to_owned(), "3".to_owned()),
            ("INITIAL_INTERVAL".to_owned(), "500".to_owned()),
        ]);
        let config = Config::init_from_hashmap(&env).unwrap();
        let policy = config.retry_policy.policy();

        assert_eq!(policy.retry_interval(1), time::Duration::from_millis(500));
        assert_eq!(policy.retry_interval(3), time::Duration::from_millis(4500));
        assert_eq!(policy.maximum_interval, Some(time::Duration::from_secs(100)));
        assert_eq!(config.inbound_queue_name.as_str(), "inbound");
        assert_eq!(config.bind(), "0.0.0.0:3301");
    }

    #[tokio::test]
    async fn print_mode_has_no_inbound_queue() {
        let env = HashMap::from([("PRINT_SINK".to_owned(), "true".to_owned())]);
        let config = Config::init_from_hashmap(&env).unwrap();

        assert!(config.inbound_queue().await.unwrap().is_none());
    }
}
