use std::future::Future;

use serde_json::Value;
use sluice_core::{
    error::{ErrorContext as _, GenericError},
    event::EventRecord,
    publisher::Transport,
    sink::Sink,
};
use tokio::io::{AsyncBufRead, AsyncBufReadExt as _};
use tracing::{debug, info, warn};

/// Counts of what happened to each input line.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RelayStats {
    /// Records the sink accepted.
    pub accepted: u64,

    /// Records the sink refused, either because they were invalid or because its buffer was full.
    pub refused: u64,

    /// Lines that were not JSON objects.
    pub skipped: u64,
}

/// Feeds each line of `input` to the sink until the input ends or `shutdown` resolves.
///
/// Reaching the end of the input completes the sink. A resolved `shutdown` fails it, as does an unreadable input, in
/// which case the read error is returned.
pub async fn relay<T, R, F>(sink: &Sink<T>, input: R, shutdown: F) -> Result<RelayStats, GenericError>
where
    T: Transport + 'static,
    R: AsyncBufRead + Unpin,
    F: Future<Output = ()>,
{
    let mut stats = RelayStats::default();
    let mut lines = input.lines();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            biased;

            _ = &mut shutdown => {
                info!("Interrupted. Stopping sink.");
                sink.fail("interrupted").await;
                return Ok(stats);
            }

            line = lines.next_line() => match line {
                Ok(Some(line)) => relay_line(sink, &line, &mut stats),
                Ok(None) => {
                    debug!(?stats, "Reached end of input.");
                    sink.complete().await;
                    return Ok(stats);
                }
                Err(e) => {
                    sink.fail(&e).await;
                    return Err(e).error_context("Failed to read event records.");
                }
            },
        }
    }
}

fn relay_line<T: Transport + 'static>(sink: &Sink<T>, line: &str, stats: &mut RelayStats) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }

    match serde_json::from_str::<Value>(line) {
        Ok(Value::Object(object)) => {
            if sink.on_event(&EventRecord::from(object)) {
                stats.accepted += 1;
            } else {
                stats.refused += 1;
            }
        }
        Ok(other) => {
            warn!(kind = json_kind(&other), "Skipping input line that is not a JSON object.");
            stats.skipped += 1;
        }
        Err(e) => {
            warn!(error = %e, "Skipping input line that is not valid JSON.");
            stats.skipped += 1;
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{Arc, Mutex},
        time::Duration,
    };

    use async_trait::async_trait;
    use bytes::Bytes;
    use http::{Request, StatusCode};
    use sluice_core::{
        config::SinkConfiguration,
        publisher::{TransportError, TransportResponse},
        sink::SinkState,
    };

    use super::*;

    #[derive(Clone, Default)]
    struct RecordingTransport {
        bodies: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn send(&self, request: Request<Bytes>) -> Result<TransportResponse, TransportError> {
            let body = String::from_utf8_lossy(request.body()).into_owned();
            self.bodies.lock().unwrap().push(body);
            Ok(TransportResponse::new(StatusCode::NO_CONTENT, Bytes::new()))
        }
    }

    fn sink(transport: RecordingTransport) -> Sink<RecordingTransport> {
        let config = SinkConfiguration::new("http://localhost:8086", "telemetry")
            .with_buffer_interval(Duration::from_secs(60))
            .with_buffering_count(100);
        Sink::builder(config).build_with_transport(transport).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn relays_object_lines_and_completes_at_end_of_input() {
        let transport = RecordingTransport::default();
        let sink = sink(transport.clone());

        let input = concat!(
            "{\"MetricType\":\"cpu\",\"Value\":42,\"CurrentTime\":\"2024-01-01T00:00:00Z\",\"Host\":\"a\"}\n",
            "\n",
            "[1, 2, 3]\n",
            "not json\n",
            "{\"metrictype\":\"cpu\",\"host\":\"b\"}\n",
            "{\"metrictype\":\"mem\",\"value\":1.5,\"currenttime\":\"2024-01-01T00:00:01Z\"}\n",
        );

        let stats = relay(&sink, input.as_bytes(), std::future::pending()).await.unwrap();
        assert_eq!(
            stats,
            RelayStats {
                accepted: 2,
                refused: 1,
                skipped: 2,
            }
        );
        assert_eq!(sink.state(), SinkState::Disposed);

        let bodies = transport.bodies.lock().unwrap().clone();
        assert_eq!(
            bodies,
            vec!["cpu,host=a value=42 1704067200000\nmem value=1.5 1704067201000".to_string()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_fails_the_sink() {
        let sink = sink(RecordingTransport::default());

        // Never yields a line, so only the shutdown signal can end the relay.
        let (_writer, reader) = tokio::io::duplex(64);
        let reader = tokio::io::BufReader::new(reader);

        let stats = relay(&sink, reader, async {}).await.unwrap();
        assert_eq!(stats, RelayStats::default());
        assert_eq!(sink.state(), SinkState::Disposed);
    }
}
