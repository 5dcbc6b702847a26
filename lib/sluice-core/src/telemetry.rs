//! Sink telemetry.

use metrics::{counter, Counter};

/// Counters describing what a sink accepted, dropped, and delivered.
///
/// Handles are registered against whichever recorder is installed when the `Telemetry` is created, so a sink should be
/// built after the application has installed its recorder.
#[derive(Clone)]
pub struct Telemetry {
    events_submitted: Counter,
    events_rejected: Counter,
    events_dropped_encoder: Counter,
    events_dropped_publish: Counter,
    batches_sent: Counter,
    batches_lost_server: Counter,
    batches_lost_transport: Counter,
    publish_attempts: Counter,
    bytes_sent: Counter,
}

impl Telemetry {
    /// Creates a new `Telemetry`, registering its counters with the current recorder.
    pub fn new() -> Self {
        Self {
            events_submitted: counter!("sluice_events_submitted_total"),
            events_rejected: counter!("sluice_events_rejected_total"),
            events_dropped_encoder: counter!("sluice_events_dropped_total", "reason" => "encoder"),
            events_dropped_publish: counter!("sluice_events_dropped_total", "reason" => "publish"),
            batches_sent: counter!("sluice_batches_sent_total"),
            batches_lost_server: counter!("sluice_batches_lost_total", "reason" => "server"),
            batches_lost_transport: counter!("sluice_batches_lost_total", "reason" => "transport"),
            publish_attempts: counter!("sluice_publish_attempts_total"),
            bytes_sent: counter!("sluice_bytes_sent_total"),
        }
    }

    /// Events accepted into the pending buffer.
    pub fn events_submitted(&self) -> &Counter {
        &self.events_submitted
    }

    /// Events refused because the sink was full, not running, or given an invalid record.
    pub fn events_rejected(&self) -> &Counter {
        &self.events_rejected
    }

    /// Events dropped because they could not be encoded.
    pub fn events_dropped_encoder(&self) -> &Counter {
        &self.events_dropped_encoder
    }

    /// Events dropped because the batch carrying them was lost.
    pub fn events_dropped_publish(&self) -> &Counter {
        &self.events_dropped_publish
    }

    /// Batches accepted by the server.
    pub fn batches_sent(&self) -> &Counter {
        &self.batches_sent
    }

    /// Batches rejected by the server.
    pub fn batches_lost_server(&self) -> &Counter {
        &self.batches_lost_server
    }

    /// Batches that never got a response, even after retrying.
    pub fn batches_lost_transport(&self) -> &Counter {
        &self.batches_lost_transport
    }

    /// Individual HTTP attempts, including retries.
    pub fn publish_attempts(&self) -> &Counter {
        &self.publish_attempts
    }

    /// Payload bytes accepted by the server.
    pub fn bytes_sent(&self) -> &Counter {
        &self.bytes_sent
    }
}

/// Helpers for asserting on counters captured by a `DebuggingRecorder`.
#[cfg(test)]
pub(crate) mod test_util {
    use metrics::{SharedString, Unit};
    use metrics_util::{debugging::DebugValue, CompositeKey};

    pub type Entry = (CompositeKey, Option<Unit>, Option<SharedString>, DebugValue);

    /// Returns the value of the counter with the given name and `reason` label, or zero if it was never registered.
    pub fn counter_value(entries: &[Entry], name: &str, reason: Option<&str>) -> u64 {
        entries
            .iter()
            .filter(|(k, _, _, _)| k.key().name() == name)
            .find(|(k, _, _, _)| {
                let label = k.key().labels().find(|l| l.key() == "reason").map(|l| l.value().to_string());
                label.as_deref() == reason
            })
            .map(|(_, _, _, value)| match value {
                DebugValue::Counter(value) => *value,
                other => panic!("expected a counter, got: {:?}", other),
            })
            .unwrap_or(0)
    }
}
