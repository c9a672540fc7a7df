//! The generic pipeline shared by every processing unit.
//!
//! extract -> validate -> enrich -> persist -> bus -> class stage -> status -> queue -> notify
//!
//! Every I/O call runs under the configured timeout. Failures before the notify stage fail
//! the invocation; the notification itself is best-effort.
use std::future::Future;
use std::sync::Arc;
use std::time;

use serde_json::Value;
use tracing::{error, info, instrument, warn, Span};

use crate::batch::BatchEngine;
use crate::capability::{identifiers, message_attributes, subject_discriminator, Capability};
use crate::enrich::Enricher;
use crate::envelope::{new_id, parse_body, EventClass, InvocationContext};
use crate::error::{DispatchError, PipelineError, ValidationError};
use crate::model_router::ModelRouter;
use crate::notify::{notify_best_effort, Notification, NotificationStatus, Notifier};
use crate::processors::{
    AnalyticsProcessor, BatchProcessor, EventProcessor, MlProcessor, UserEventProcessor,
};
use crate::prometheus::{report_failed_invocation, report_invocation};
use crate::queue::{MessageQueue, QueueMessage};
use crate::response::{ProcessingResponse, Step};
use crate::sinks::{BusMessage, RoutingBus};
use crate::status::ProcessingStatus;
use crate::store::{DurableStore, Record, RecordKey, StatusUpdate};
use crate::time::TimeSource;

/// Process-scoped client handles, built once at startup and shared by every invocation.
#[derive(Clone)]
pub struct Dependencies {
    pub store: Arc<dyn DurableStore>,
    pub bus: Arc<dyn RoutingBus>,
    pub queue: Arc<dyn MessageQueue>,
    pub notifier: Arc<dyn Notifier>,
    pub time: Arc<dyn TimeSource>,
    pub io_timeout: time::Duration,
}

/// Run an I/O call under a timeout. Elapsing is reported like any other dependency error.
pub async fn with_timeout<T, E, F>(
    stage: &'static str,
    after: time::Duration,
    future: F,
) -> Result<T, PipelineError>
where
    F: Future<Output = Result<T, E>>,
    E: Into<PipelineError>,
{
    match tokio::time::timeout(after, future).await {
        Ok(result) => result.map_err(Into::into),
        Err(_) => Err(PipelineError::Timeout { stage, after }),
    }
}

#[derive(Default)]
struct Progress {
    steps: Vec<Step>,
    envelope: Option<Value>,
    key: Option<RecordKey>,
    status: Option<ProcessingStatus>,
}

pub struct Pipeline<C> {
    capability: C,
    deps: Dependencies,
    enricher: Enricher,
}

impl<C: Capability> Pipeline<C> {
    pub fn new(capability: C, deps: Dependencies, enricher: Enricher) -> Self {
        Self {
            capability,
            deps,
            enricher,
        }
    }

    /// Entry point for raw bodies (HTTP requests, queue messages).
    pub async fn run_bytes(&self, bytes: &[u8], ctx: InvocationContext) -> ProcessingResponse {
        match parse_body(bytes) {
            Ok(raw) => self.run(raw, ctx).await,
            Err(error) => {
                let correlation_id = ctx.correlation_id.clone().unwrap_or_else(new_id);
                self.fail(&Value::Null, correlation_id, &ctx, Progress::default(), error.into())
                    .await
            }
        }
    }

    #[instrument(
        skip_all,
        fields(class = %self.capability.class(), correlation_id = tracing::field::Empty)
    )]
    pub async fn run(&self, raw: Value, ctx: InvocationContext) -> ProcessingResponse {
        let correlation_id = ctx.resolve_correlation_id(&raw);
        Span::current().record("correlation_id", correlation_id.as_str());

        let mut progress = Progress {
            steps: vec![Step::Extract],
            ..Default::default()
        };

        match self
            .execute(&raw, correlation_id.clone(), &ctx, &mut progress)
            .await
        {
            Ok(result) => self.succeed(correlation_id, &ctx, progress, result).await,
            Err(error) => self.fail(&raw, correlation_id, &ctx, progress, error).await,
        }
    }

    async fn execute(
        &self,
        raw: &Value,
        correlation_id: String,
        ctx: &InvocationContext,
        progress: &mut Progress,
    ) -> Result<Option<Value>, PipelineError> {
        let capability = &self.capability;
        let class = capability.class();
        let timeout = self.deps.io_timeout;
        let tracks_status = capability.tracks_status();

        let object = capability.schema().validate(raw)?;
        let mut body: C::Body = serde_json::from_value(Value::Object(object.clone()))
            .map_err(|e| ValidationError::Malformed(e.to_string()))?;
        progress.steps.push(Step::Validate);

        capability.prepare(&mut body);
        let now = self.deps.time.now();
        let envelope =
            self.enricher
                .enrich(class, &object, body, correlation_id, &ctx.request_id, now);
        let value = serde_json::to_value(&envelope)
            .map_err(|e| DispatchError::Serialization(e.to_string()))?;
        let key = capability.key(&envelope);
        progress.envelope = Some(value.clone());
        progress.key = Some(key.clone());
        progress.steps.push(Step::Enrich);

        let mut item = value.clone();
        if let (true, Some(fields)) = (tracks_status, item.as_object_mut()) {
            fields.insert(
                "status".to_owned(),
                ProcessingStatus::Processing.as_str().into(),
            );
        }
        let record = Record::new(class.table(), key.clone(), item, capability.ttl(), now);
        with_timeout("persist", timeout, self.deps.store.put(record)).await?;
        if tracks_status {
            progress.status = Some(ProcessingStatus::Processing);
        }
        progress.steps.push(Step::Persist);

        let targets = capability.targets();
        let attributes = message_attributes(class, capability.discriminator_fields(), &value);

        if targets.bus {
            let (source, detail_type) = capability.bus_route(&envelope.body);
            let message = BusMessage {
                key: envelope.id.clone(),
                source,
                detail_type,
                detail: value.clone(),
                attributes: attributes.clone(),
            };
            with_timeout("dispatch_bus", timeout, self.deps.bus.publish(message)).await?;
            progress.steps.push(Step::DispatchBus);
        }

        let result = capability
            .process(&envelope, &self.deps, &mut progress.steps)
            .await?;

        if tracks_status {
            let current = progress.status.unwrap_or(ProcessingStatus::Processing);
            let update = StatusUpdate {
                transition: current.transition(ProcessingStatus::Completed)?,
                result: result.clone(),
                updated_at: self.deps.time.current_time(),
            };
            with_timeout(
                "update_status",
                timeout,
                self.deps.store.update_status(class.table(), &key, update),
            )
            .await?;
            progress.status = Some(ProcessingStatus::Completed);
            progress.steps.push(Step::UpdateStatus);
        }

        if targets.queue {
            let message = QueueMessage {
                body: value.to_string(),
                attributes,
            };
            with_timeout("enqueue", timeout, self.deps.queue.enqueue(message)).await?;
            progress.steps.push(Step::Enqueue);
        }

        Ok(result)
    }

    async fn succeed(
        &self,
        correlation_id: String,
        ctx: &InvocationContext,
        progress: Progress,
        result: Option<Value>,
    ) -> ProcessingResponse {
        let class = self.capability.class();
        let envelope = progress.envelope.unwrap_or_default();

        let mut response = ProcessingResponse {
            success: true,
            identifiers: identifiers(self.capability.identifier_fields(), &envelope),
            correlation_id,
            processing_time: elapsed_ms(ctx),
            steps_completed: progress.steps,
            error: None,
            message: format!("{} finished successfully", class.unit_name()),
            result,
            timestamp: self.deps.time.current_time(),
            retryable: false,
        };

        if self
            .notify(NotificationStatus::Success, &envelope, &response)
            .await
        {
            response.steps_completed.push(Step::Notify);
        }
        response.processing_time = elapsed_ms(ctx);

        info!(steps = response.steps_completed.len(), "invocation succeeded");
        report_invocation(class, true, ctx.started.elapsed());
        response
    }

    async fn fail(
        &self,
        raw: &Value,
        correlation_id: String,
        ctx: &InvocationContext,
        progress: Progress,
        error: PipelineError,
    ) -> ProcessingResponse {
        let class = self.capability.class();

        match &error {
            PipelineError::Validation(_) => warn!("rejected invalid input: {}", error),
            _ => error!(kind = error.kind(), "invocation failed: {}", error),
        }
        report_failed_invocation(class, error.kind());

        if let (true, Some(key)) = (self.capability.tracks_status(), &progress.key) {
            self.mark_failed(key, progress.status).await;
        }

        let source = progress.envelope.as_ref().unwrap_or(raw);
        let mut response = ProcessingResponse {
            success: false,
            identifiers: identifiers(self.capability.identifier_fields(), source),
            correlation_id,
            processing_time: elapsed_ms(ctx),
            steps_completed: progress.steps,
            error: Some(error.to_string()),
            message: format!("{} failed", class.unit_name()),
            result: None,
            timestamp: self.deps.time.current_time(),
            retryable: error.is_retryable(),
        };

        if self
            .notify(NotificationStatus::Error, source, &response)
            .await
        {
            response.steps_completed.push(Step::Notify);
        }
        response.processing_time = elapsed_ms(ctx);

        report_invocation(class, false, ctx.started.elapsed());
        response
    }

    /// Best-effort `processing -> failed`. Never masks the error that got us here.
    async fn mark_failed(&self, key: &RecordKey, current: Option<ProcessingStatus>) {
        let current = current.unwrap_or(ProcessingStatus::Processing);
        let transition = match current.transition(ProcessingStatus::Failed) {
            Ok(transition) => transition,
            Err(e) => {
                warn!(key = %key, "not marking record as failed: {}", e);
                return;
            }
        };

        let update = StatusUpdate {
            transition,
            result: None,
            updated_at: self.deps.time.current_time(),
        };
        let table = self.capability.class().table();
        if let Err(e) = with_timeout(
            "update_status",
            self.deps.io_timeout,
            self.deps.store.update_status(table, key, update),
        )
        .await
        {
            warn!(key = %key, "failed to mark record as failed: {}", e);
        }
    }

    async fn notify(
        &self,
        status: NotificationStatus,
        source: &Value,
        response: &ProcessingResponse,
    ) -> bool {
        let class = self.capability.class();
        let discriminator = subject_discriminator(self.capability.discriminator_fields(), source);
        let id = source
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or("unknown");
        let mut attributes =
            message_attributes(class, self.capability.discriminator_fields(), source);
        attributes.insert(
            "correlationId".to_owned(),
            response.correlation_id.as_str().into(),
        );

        let notification = Notification::new(
            class,
            status,
            &discriminator,
            id,
            serde_json::to_value(response).unwrap_or_default(),
            attributes,
        );

        notify_best_effort(
            self.deps.notifier.as_ref(),
            &notification,
            self.deps.io_timeout,
        )
        .await
    }
}

fn elapsed_ms(ctx: &InvocationContext) -> u64 {
    ctx.started.elapsed().as_millis() as u64
}

/// One pipeline per event class.
#[derive(Clone)]
pub struct Pipelines {
    pub events: Arc<Pipeline<EventProcessor>>,
    pub user_events: Arc<Pipeline<UserEventProcessor>>,
    pub analytics: Arc<Pipeline<AnalyticsProcessor>>,
    pub ml: Arc<Pipeline<MlProcessor>>,
    pub batch: Arc<Pipeline<BatchProcessor>>,
}

impl Pipelines {
    pub fn new(
        deps: Dependencies,
        enricher: Enricher,
        router: ModelRouter,
        engine: BatchEngine,
    ) -> Self {
        Self {
            events: Arc::new(Pipeline::new(
                EventProcessor {},
                deps.clone(),
                enricher.clone(),
            )),
            user_events: Arc::new(Pipeline::new(
                UserEventProcessor {},
                deps.clone(),
                enricher.clone(),
            )),
            analytics: Arc::new(Pipeline::new(
                AnalyticsProcessor {},
                deps.clone(),
                enricher.clone(),
            )),
            ml: Arc::new(Pipeline::new(
                MlProcessor::new(router),
                deps.clone(),
                enricher.clone(),
            )),
            batch: Arc::new(Pipeline::new(BatchProcessor::new(engine), deps, enricher)),
        }
    }

    pub async fn run(
        &self,
        class: EventClass,
        raw: Value,
        ctx: InvocationContext,
    ) -> ProcessingResponse {
        match class {
            EventClass::Event => self.events.run(raw, ctx).await,
            EventClass::UserEvent => self.user_events.run(raw, ctx).await,
            EventClass::Analytics => self.analytics.run(raw, ctx).await,
            EventClass::MlInference => self.ml.run(raw, ctx).await,
            EventClass::Batch => self.batch.run(raw, ctx).await,
        }
    }

    pub async fn run_bytes(
        &self,
        class: EventClass,
        bytes: &[u8],
        ctx: InvocationContext,
    ) -> ProcessingResponse {
        match class {
            EventClass::Event => self.events.run_bytes(bytes, ctx).await,
            EventClass::UserEvent => self.user_events.run_bytes(bytes, ctx).await,
            EventClass::Analytics => self.analytics.run_bytes(bytes, ctx).await,
            EventClass::MlInference => self.ml.run_bytes(bytes, ctx).await,
            EventClass::Batch => self.batch.run_bytes(bytes, ctx).await,
        }
    }
}
