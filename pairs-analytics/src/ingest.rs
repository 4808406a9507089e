use crate::{
    normalizer::{Normalized, normalize_json},
    service::PairsService,
};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Counters accumulated by one ingestion task.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq, Deserialize, Serialize)]
pub struct IngestSummary {
    pub received: u64,
    pub ticks: u64,
    pub ignored: u64,
    pub rejected: u64,
    /// Bars sealed or corrected as a result of this stream's ticks.
    pub bars: u64,
}

/// Frames handed to one blocking aggregation pass at most.
const FRAME_BATCH: usize = 256;

impl IngestSummary {
    fn merge(&mut self, other: IngestSummary) {
        self.received += other.received;
        self.ticks += other.ticks;
        self.ignored += other.ignored;
        self.rejected += other.rejected;
        self.bars += other.bars;
    }
}

/// Normalise and aggregate every raw JSON frame of `frames` until the stream ends.
///
/// Frames already buffered are drained in batches onto the blocking pool, since sealing a
/// bar persists it synchronously. Batches run one after another so tick order is kept.
/// Malformed frames are logged, counted and skipped.
pub async fn ingest_frames<St>(
    service: Arc<PairsService>,
    name: SmolStr,
    frames: St,
) -> IngestSummary
where
    St: Stream<Item = String>,
{
    let frames = frames.ready_chunks(FRAME_BATCH);
    futures::pin_mut!(frames);

    let mut summary = IngestSummary::default();
    while let Some(batch) = frames.next().await {
        let received = batch.len() as u64;
        let task_service = Arc::clone(&service);
        let task_name = name.clone();

        match tokio::task::spawn_blocking(move || ingest_batch(&task_service, &task_name, batch))
            .await
        {
            Ok(batch) => summary.merge(batch),
            Err(error) => {
                summary.received += received;
                error!(stream = %name, %error, frames = received, "ingestion batch failed");
            }
        }
    }

    summary
}

fn ingest_batch(service: &PairsService, name: &str, batch: Vec<String>) -> IngestSummary {
    let mut summary = IngestSummary::default();
    for frame in batch {
        summary.received += 1;

        match normalize_json(&frame) {
            Ok(Normalized::Tick(tick)) => {
                summary.ticks += 1;
                summary.bars += service.on_tick(&tick).len() as u64;
            }
            Ok(Normalized::Ignored) => {
                summary.ignored += 1;
                debug!(stream = %name, "ignored non trade event");
            }
            Err(error) => {
                summary.rejected += 1;
                service.record_rejected(&error);
                warn!(
                    stream = %name,
                    %error,
                    frame = truncate(&frame, 200),
                    "rejected malformed trade event"
                );
            }
        }
    }
    summary
}

/// Prefix of `frame` holding at most `max_chars` characters.
fn truncate(frame: &str, max_chars: usize) -> &str {
    frame
        .char_indices()
        .nth(max_chars)
        .map_or(frame, |(index, _)| &frame[..index])
}

/// Spawn one ingestion task for the `frames` of a single upstream stream, preserving
/// per-stream tick order.
pub fn spawn_ingest<St>(
    service: Arc<PairsService>,
    name: SmolStr,
    frames: St,
) -> JoinHandle<IngestSummary>
where
    St: Stream<Item = String> + Send + 'static,
{
    tokio::spawn(async move {
        info!(stream = %name, "ingestion started");
        let summary = ingest_frames(service, name.clone(), frames).await;
        info!(stream = %name, ?summary, "ingestion finished");
        summary
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::EngineConfig, interval::Interval, store::InMemorySeriesStore};
    use futures::stream;

    fn trade(symbol: &str, time_ms: i64, price: &str) -> String {
        format!(r#"{{"e":"trade","s":"{symbol}","T":{time_ms},"p":"{price}","q":"0.5"}}"#)
    }

    #[tokio::test]
    async fn test_ingest_frames() {
        let config = EngineConfig::default().with_intervals([Interval::M1]);
        let service = Arc::new(PairsService::new(
            config,
            Arc::new(InMemorySeriesStore::new()),
        ));

        // 2025-01-01T00:00:00Z
        let base = 1_735_689_600_000;
        let frames = vec![
            trade("BTCUSDT", base + 1_000, "100.0"),
            r#"{"e":"24hrTicker","s":"BTCUSDT"}"#.to_string(),
            trade("BTCUSDT", base + 2_000, "not a price"),
            "{not json".to_string(),
            format!("{}é{}", "x".repeat(199), "y".repeat(10)),
            trade("BTCUSDT", base + 61_000, "101.0"),
        ];

        let summary = spawn_ingest(
            Arc::clone(&service),
            SmolStr::new("btcusdt@trade"),
            stream::iter(frames),
        )
        .await
        .unwrap();

        assert_eq!(
            summary,
            IngestSummary {
                received: 6,
                ticks: 2,
                ignored: 1,
                rejected: 3,
                bars: 1,
            }
        );
        assert_eq!(service.rejected_events(), 3);
        assert_eq!(
            service.aggregator().open_bar("BTCUSDT", Interval::M1).map(|bar| bar.close),
            Some(101.0)
        );
    }

    #[test]
    fn test_truncate() {
        struct TestCase {
            input: String,
            expected: String,
        }

        let tests = vec![
            TestCase {
                // TC0: shorter than the limit
                input: "abc".to_string(),
                expected: "abc".to_string(),
            },
            TestCase {
                // TC1: ascii longer than the limit
                input: "a".repeat(205),
                expected: "a".repeat(200),
            },
            TestCase {
                // TC2: multibyte character straddling byte 200
                input: format!("{}é{}", "x".repeat(199), "y".repeat(10)),
                expected: format!("{}é", "x".repeat(199)),
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            assert_eq!(truncate(&test.input, 200), test.expected, "TC{} failed", index);
        }
    }
}
