//! The sink facade.

use std::{
    fmt,
    sync::{
        atomic::{AtomicU8, Ordering::AcqRel, Ordering::Acquire, Ordering::Release},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use snafu::{ResultExt as _, Snafu};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    config::{InvalidConfiguration, SinkConfiguration},
    encoder::{EncodeError, LineEncoder},
    error::GenericError,
    event::{EventRecord, MetricEvent},
    fault::{Fault, FaultHandler, LoggingFaultHandler, LossCause},
    publisher::{HttpTransport, Outcome, Publisher, Transport, TransportError},
    scheduler::{BatchHandler, Scheduler},
    telemetry::Telemetry,
};

/// Errors returned when writing directly through a sink.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum SinkError {
    /// The sink has been completed, failed, or disposed.
    #[snafu(display("Sink is no longer running."))]
    NotRunning,

    /// The event could not be encoded.
    #[snafu(display("Failed to encode event: {}", source))]
    Encode {
        /// Underlying encoding error.
        source: EncodeError,
    },
}

/// Lifecycle state of a [`Sink`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum SinkState {
    /// Accepting events. Entered on construction.
    Running = 0,

    /// Flushing pending events after the host completed.
    Completing = 1,

    /// Flushing pending events after the host reported an error.
    Erroring = 2,

    /// Stopped. No further events are accepted.
    Disposed = 3,
}

impl SinkState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Running,
            1 => Self::Completing,
            2 => Self::Erroring,
            _ => Self::Disposed,
        }
    }
}

/// Encodes released batches and publishes them, one at a time.
struct Delivery<T> {
    encoder: LineEncoder,
    publisher: Publisher<T>,
    faults: Arc<dyn FaultHandler>,
    telemetry: Telemetry,
    publish_lock: Mutex<()>,
}

impl<T: Transport> Delivery<T> {
    async fn publish(&self, payload: Bytes, cancel: &CancellationToken) -> Outcome {
        // Batches and direct writes share this lock so a sink never has two writes in flight.
        let _guard = self.publish_lock.lock().await;
        self.publisher.send(payload, cancel).await
    }

    fn record_outcome(&self, outcome: &Outcome, events: usize) {
        match outcome {
            Outcome::Success { .. } => self.telemetry.batches_sent().increment(1),
            Outcome::ServerError { .. } => {
                self.telemetry.batches_lost_server().increment(1);
                self.telemetry.events_dropped_publish().increment(events as u64);
            }
            Outcome::TransportError(_) => {
                self.telemetry.batches_lost_transport().increment(1);
                self.telemetry.events_dropped_publish().increment(events as u64);
            }
        }
    }
}

#[async_trait]
impl<T> BatchHandler for Delivery<T>
where
    T: Transport + 'static,
{
    async fn handle_batch(&self, batch: Vec<MetricEvent>, cancel: &CancellationToken) {
        let encoded = self.encoder.encode_batch(&batch);
        if encoded.skipped() > 0 {
            warn!(skipped = encoded.skipped(), "Dropped events that could not be encoded.");
            self.telemetry.events_dropped_encoder().increment(encoded.skipped() as u64);
        }
        if encoded.is_empty() {
            return;
        }

        let events = encoded.lines();
        let outcome = self.publish(encoded.into_bytes(), cancel).await;
        self.record_outcome(&outcome, events);

        let cause = match outcome {
            Outcome::Success { .. } => {
                debug!(events, "Batch written.");
                return;
            }
            Outcome::TransportError(TransportError::Cancelled) => {
                debug!(events, "Batch abandoned on shutdown.");
                return;
            }
            Outcome::ServerError { status, body } => LossCause::Rejected { status, body },
            Outcome::TransportError(e) => LossCause::Unreachable(e),
        };
        self.faults.on_fault(Fault::BatchLost { events, cause });
    }
}

/// Builder for [`Sink`].
pub struct SinkBuilder {
    config: SinkConfiguration,
    faults: Arc<dyn FaultHandler>,
}

impl SinkBuilder {
    /// Sets the handler that receives faults.
    ///
    /// Defaults to [`LoggingFaultHandler`].
    pub fn with_fault_handler<F>(mut self, handler: F) -> Self
    where
        F: FaultHandler + 'static,
    {
        self.faults = Arc::new(handler);
        self
    }

    /// Builds a sink that writes over HTTP.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// If the configuration is invalid, or the HTTP client could not be created, an error is returned.
    pub fn build(self) -> Result<Sink<HttpTransport>, GenericError> {
        let transport = HttpTransport::builder()
            .with_request_timeout(Some(self.config.request_timeout()))
            .build()?;
        Ok(self.build_with_transport(transport)?)
    }

    /// Builds a sink that writes over the given transport.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// If the configuration is invalid, an error is returned.
    pub fn build_with_transport<T>(self, transport: T) -> Result<Sink<T>, InvalidConfiguration>
    where
        T: Transport + 'static,
    {
        self.config.validate()?;

        let telemetry = Telemetry::new();
        let endpoint = self.config.write_endpoint()?;
        debug!(endpoint = %endpoint.sanitized(), "Starting sink.");

        let publisher = Publisher::new(transport, endpoint)
            .with_retry_schedule(self.config.retry_schedule())
            .with_telemetry(telemetry.clone());
        let delivery = Arc::new(Delivery {
            encoder: self.config.line_encoder(),
            publisher,
            faults: Arc::clone(&self.faults),
            telemetry: telemetry.clone(),
            publish_lock: Mutex::new(()),
        });

        let cancel = CancellationToken::new();
        let scheduler = Scheduler::start(self.config.scheduler_config(), Arc::clone(&delivery), cancel.clone());

        Ok(Sink {
            delivery,
            scheduler,
            faults: self.faults,
            telemetry,
            state: AtomicU8::new(SinkState::Running as u8),
            cancel,
            wait_write_timeout: self.config.wait_write_timeout(),
        })
    }
}

/// Writes metric events to a line protocol database.
///
/// A sink accepts events one at a time from any number of producers, batches them, and publishes each batch to the
/// database's write endpoint. Problems that only affect some events, such as a full buffer, an invalid record, or a
/// batch the server would not accept, are reported to the sink's [`FaultHandler`] instead of being returned to the
/// producer.
///
/// # Lifecycle
///
/// A sink is running as soon as it is built. [`complete`][Self::complete] and [`fail`][Self::fail] stop it after
/// giving pending events a bounded amount of time to be written, and [`dispose`][Self::dispose] does the same the first
/// time it is called and simply cancels outstanding work after that. Once stopped, a sink never runs again.
///
/// Dropping a sink cancels all outstanding work without flushing.
pub struct Sink<T = HttpTransport> {
    delivery: Arc<Delivery<T>>,
    scheduler: Scheduler,
    faults: Arc<dyn FaultHandler>,
    telemetry: Telemetry,
    state: AtomicU8,
    cancel: CancellationToken,
    wait_write_timeout: Duration,
}

impl Sink<HttpTransport> {
    /// Creates a builder for a sink with the given configuration.
    pub fn builder(config: SinkConfiguration) -> SinkBuilder {
        SinkBuilder {
            config,
            faults: Arc::new(LoggingFaultHandler),
        }
    }

    /// Creates a sink that writes over HTTP, logging faults.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// If the configuration is invalid, or the HTTP client could not be created, an error is returned.
    pub fn new(config: &SinkConfiguration) -> Result<Self, GenericError> {
        Self::builder(config.clone()).build()
    }
}

impl<T: Transport> Sink<T> {
    /// Returns the current lifecycle state.
    pub fn state(&self) -> SinkState {
        SinkState::from_u8(self.state.load(Acquire))
    }

    /// Converts a host record into a metric event and submits it.
    ///
    /// Field names are matched case-insensitively: `metrictype` names the measurement, `value` carries the value,
    /// `currenttime` carries the timestamp, and any other field becomes a tag. Records without a numeric value are
    /// reported as [`Fault::InvalidRecord`].
    ///
    /// Returns `true` if the event was accepted.
    pub fn on_event(&self, record: &EventRecord) -> bool {
        match MetricEvent::from_record(record) {
            Ok(event) => self.submit(event),
            Err(e) => {
                self.telemetry.events_rejected().increment(1);
                self.faults.on_fault(Fault::InvalidRecord(e));
                false
            }
        }
    }

    /// Submits an event for batching.
    ///
    /// Never blocks. If the pending buffer is full, the event is dropped and [`Fault::CapacityExceeded`] is reported.
    /// Events submitted after the sink has stopped are dropped silently.
    ///
    /// Returns `true` if the event was accepted.
    pub fn submit(&self, event: MetricEvent) -> bool {
        if self.state() != SinkState::Running {
            self.telemetry.events_rejected().increment(1);
            return false;
        }

        if self.scheduler.submit(event) {
            self.telemetry.events_submitted().increment(1);
            return true;
        }

        self.telemetry.events_rejected().increment(1);
        if !self.scheduler.is_closed() {
            self.faults.on_fault(Fault::CapacityExceeded {
                capacity: self.scheduler.capacity(),
            });
        }
        false
    }

    /// Encodes and publishes a single event immediately, bypassing batching.
    ///
    /// The write is serialized with batch writes, so it may wait for a batch being published to finish.
    ///
    /// # Errors
    ///
    /// If the sink has stopped, or the event cannot be encoded, an error is returned. Delivery failures are returned as
    /// the [`Outcome`].
    pub async fn write_direct(&self, event: &MetricEvent) -> Result<Outcome, SinkError> {
        if self.state() != SinkState::Running {
            return Err(SinkError::NotRunning);
        }

        let line = self.delivery.encoder.encode_event(event).context(Encode)?;
        let outcome = self.delivery.publish(Bytes::from(line), &self.cancel).await;
        self.delivery.record_outcome(&outcome, 1);
        Ok(outcome)
    }

    /// Stops the sink after the host has finished producing events.
    ///
    /// Pending events are given a bounded amount of time to be written before outstanding work is cancelled.
    pub async fn complete(&self) {
        if self.begin_shutdown(SinkState::Completing) {
            debug!("Host completed. Stopping sink.");
            self.shutdown().await;
        }
    }

    /// Stops the sink after the host has reported an error.
    ///
    /// Pending events are given a bounded amount of time to be written before outstanding work is cancelled.
    pub async fn fail<E>(&self, cause: &E)
    where
        E: fmt::Display + ?Sized,
    {
        if self.begin_shutdown(SinkState::Erroring) {
            warn!(error = %cause, "Host reported an error. Stopping sink.");
            self.shutdown().await;
        }
    }

    /// Disposes of the sink.
    ///
    /// The first call behaves like [`complete`][Self::complete] if the sink is still running. Any later call, or a
    /// call made while the sink is already stopping, cancels outstanding work without waiting. Safe to call any number
    /// of times.
    pub async fn dispose(&self) {
        if self.begin_shutdown(SinkState::Completing) {
            debug!("Disposing sink.");
            self.shutdown().await;
            return;
        }

        self.scheduler.close();
        self.state.store(SinkState::Disposed as u8, Release);
    }

    fn begin_shutdown(&self, next: SinkState) -> bool {
        self.state
            .compare_exchange(SinkState::Running as u8, next as u8, AcqRel, Acquire)
            .is_ok()
    }

    async fn shutdown(&self) {
        let pending = self.scheduler.pending();
        if !self.scheduler.flush(self.wait_write_timeout).await {
            warn!(
                pending,
                timeout = ?self.wait_write_timeout,
                "Timed out waiting for pending events to be written."
            );
        }

        self.scheduler.close();
        self.state.store(SinkState::Disposed as u8, Release);
        debug!("Sink stopped.");
    }
}

impl<T> Drop for Sink<T> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use chrono::{TimeZone as _, Utc};
    use http::{Request, StatusCode};
    use metrics_util::debugging::DebuggingRecorder;
    use tokio::time::Instant;

    use super::*;
    use crate::{
        encoder::EncodeError,
        event::RecordError,
        publisher::{TransportError, TransportResponse},
        telemetry::test_util::counter_value,
    };

    /// A transport that records request bodies and answers every request the same way.
    struct RecordingTransport {
        bodies: StdMutex<Vec<String>>,
        status: StatusCode,
        delay: Duration,
    }

    impl RecordingTransport {
        fn responding(status: StatusCode) -> Arc<Self> {
            Arc::new(Self {
                bodies: StdMutex::new(Vec::new()),
                status,
                delay: Duration::ZERO,
            })
        }

        fn hanging() -> Arc<Self> {
            Arc::new(Self {
                bodies: StdMutex::new(Vec::new()),
                status: StatusCode::NO_CONTENT,
                delay: Duration::from_secs(3600),
            })
        }

        fn bodies(&self) -> Vec<String> {
            self.bodies.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn send(&self, request: Request<Bytes>) -> Result<TransportResponse, TransportError> {
            let body = String::from_utf8(request.body().to_vec()).unwrap();
            self.bodies.lock().unwrap().push(body);
            tokio::time::sleep(self.delay).await;
            Ok(TransportResponse::new(self.status, "bad line"))
        }
    }

    type Faults = Arc<StdMutex<Vec<Fault>>>;

    fn build(
        config: SinkConfiguration, transport: Arc<RecordingTransport>,
    ) -> (Sink<Arc<RecordingTransport>>, Faults) {
        let faults: Faults = Arc::default();
        let collected = Arc::clone(&faults);
        let sink = Sink::builder(config)
            .with_fault_handler(move |fault: Fault| collected.lock().unwrap().push(fault))
            .build_with_transport(transport)
            .unwrap();
        (sink, faults)
    }

    fn config() -> SinkConfiguration {
        SinkConfiguration::new("http://localhost:8086", "telemetry").with_buffer_interval(Duration::from_secs(3600))
    }

    fn event(value: f64) -> MetricEvent {
        MetricEvent::new("cpu", value).with_timestamp(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap())
    }

    #[tokio::test(start_paused = true)]
    async fn host_record_is_written_as_line() {
        let transport = RecordingTransport::responding(StatusCode::NO_CONTENT);
        let (sink, faults) = build(config().with_buffering_count(1), Arc::clone(&transport));

        let record = EventRecord::new()
            .with_field("MetricType", "CPU")
            .with_field("Value", 42_i64)
            .with_field("CurrentTime", "2024-01-01T00:00:00Z")
            .with_field("Host", "A");
        assert!(sink.on_event(&record));

        sink.complete().await;
        assert_eq!(transport.bodies(), vec!["cpu,host=a value=42 1704067200000".to_string()]);
        assert!(faults.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn batch_preserves_submission_order() {
        let transport = RecordingTransport::responding(StatusCode::NO_CONTENT);
        let (sink, _) = build(config(), Arc::clone(&transport));

        for i in 1..=3 {
            assert!(sink.submit(event(i as f64)));
        }
        sink.complete().await;

        assert_eq!(
            transport.bodies(),
            vec!["cpu value=1 1704067200000\ncpu value=2 1704067200000\ncpu value=3 1704067200000".to_string()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_batch_is_counted_as_lost() {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();

        let transport = RecordingTransport::responding(StatusCode::BAD_REQUEST);
        let (sink, faults) = metrics::with_local_recorder(&recorder, || build(config(), Arc::clone(&transport)));

        assert!(sink.submit(event(1.0)));
        assert!(sink.submit(event(2.0)));
        sink.complete().await;

        let entries = snapshotter.snapshot().into_vec();
        assert_eq!(counter_value(&entries, "sluice_events_submitted_total", None), 2);
        assert_eq!(counter_value(&entries, "sluice_publish_attempts_total", None), 1);
        assert_eq!(counter_value(&entries, "sluice_batches_lost_total", Some("server")), 1);
        assert_eq!(counter_value(&entries, "sluice_batches_lost_total", Some("transport")), 0);
        assert_eq!(counter_value(&entries, "sluice_events_dropped_total", Some("publish")), 2);
        assert_eq!(counter_value(&entries, "sluice_batches_sent_total", None), 0);
        assert_eq!(counter_value(&entries, "sluice_bytes_sent_total", None), 0);

        let faults = faults.lock().unwrap();
        assert_eq!(faults.len(), 1);
        assert!(matches!(faults[0], Fault::BatchLost { events: 2, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn dispose_is_idempotent_and_flushes_once() {
        let transport = RecordingTransport::responding(StatusCode::NO_CONTENT);
        let (sink, _) = build(config(), Arc::clone(&transport));

        assert!(sink.submit(event(1.0)));
        sink.dispose().await;
        assert_eq!(sink.state(), SinkState::Disposed);
        assert_eq!(transport.bodies().len(), 1);

        sink.dispose().await;
        assert_eq!(sink.state(), SinkState::Disposed);
        assert_eq!(transport.bodies().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stopped_sink_rejects_events() {
        let transport = RecordingTransport::responding(StatusCode::NO_CONTENT);
        let (sink, faults) = build(config(), Arc::clone(&transport));

        sink.fail("upstream closed unexpectedly").await;
        assert_eq!(sink.state(), SinkState::Disposed);

        assert!(!sink.submit(event(1.0)));
        assert!(matches!(sink.write_direct(&event(1.0)).await, Err(SinkError::NotRunning)));
        assert!(faults.lock().unwrap().is_empty());

        // Completing after failing does nothing.
        sink.complete().await;
        assert!(transport.bodies().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn full_buffer_is_reported_as_fault() {
        let transport = RecordingTransport::responding(StatusCode::NO_CONTENT);
        let (sink, faults) = build(
            config().with_buffering_count(2).with_max_buffer_size(2),
            Arc::clone(&transport),
        );

        assert!(sink.submit(event(1.0)));
        assert!(sink.submit(event(2.0)));
        assert!(!sink.submit(event(3.0)));

        let faults = faults.lock().unwrap();
        assert_eq!(faults.len(), 1);
        assert!(matches!(faults[0], Fault::CapacityExceeded { capacity: 2 }));
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_record_is_reported_as_fault() {
        let transport = RecordingTransport::responding(StatusCode::NO_CONTENT);
        let (sink, faults) = build(config(), Arc::clone(&transport));

        let record = EventRecord::new().with_field("metrictype", "cpu").with_field("host", "a");
        assert!(!sink.on_event(&record));

        let faults = faults.lock().unwrap();
        assert!(matches!(faults[..], [Fault::InvalidRecord(RecordError::MissingValue)]));
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_batch_is_reported_as_fault() {
        let transport = RecordingTransport::responding(StatusCode::BAD_REQUEST);
        let (sink, faults) = build(config(), Arc::clone(&transport));

        assert!(sink.submit(event(1.0)));
        assert!(sink.submit(event(2.0)));
        sink.complete().await;

        // Rejections are final, so the batch was sent exactly once.
        assert_eq!(transport.bodies().len(), 1);
        let faults = faults.lock().unwrap();
        match &faults[..] {
            [Fault::BatchLost {
                events: 2,
                cause: LossCause::Rejected { status, body },
            }] => {
                assert_eq!(*status, StatusCode::BAD_REQUEST);
                assert_eq!(body, "bad line");
            }
            other => panic!("unexpected faults: {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn direct_write_publishes_immediately() {
        let transport = RecordingTransport::responding(StatusCode::NO_CONTENT);
        let (sink, _) = build(config(), Arc::clone(&transport));

        let outcome = sink.write_direct(&event(7.5)).await.unwrap();
        assert!(outcome.is_success());
        assert_eq!(transport.bodies(), vec!["cpu value=7.5 1704067200000".to_string()]);

        let unnamed = MetricEvent::unnamed(1.0);
        assert!(matches!(
            sink.write_direct(&unnamed).await,
            Err(SinkError::Encode {
                source: EncodeError::MissingMeasurement
            })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_wait_is_bounded() {
        let transport = RecordingTransport::hanging();
        let (sink, faults) = build(
            config().with_wait_write_timeout(Duration::from_millis(250)),
            Arc::clone(&transport),
        );

        assert!(sink.submit(event(1.0)));

        let started = Instant::now();
        sink.complete().await;
        assert_eq!(started.elapsed(), Duration::from_millis(250));
        assert_eq!(sink.state(), SinkState::Disposed);

        // The abandoned write is cancelled, not reported as lost.
        tokio::task::yield_now().await;
        assert!(faults.lock().unwrap().is_empty());
    }
}
