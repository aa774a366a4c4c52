//! Per-viewer branch records and the sample delivery loop

use async_trait::async_trait;
use camstream_media::{ElementHandle, EngineError, MediaEngine, PadHandle, Sample};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use crate::types::{BranchId, StreamId};

pub type WriteError = Box<dyn std::error::Error + Send + Sync>;

/// Destination of encoded samples pulled from a branch sink
#[async_trait]
pub trait SampleWriter: Send + Sync + 'static {
    async fn write(&self, sample: &Sample) -> Result<(), WriteError>;
}

#[async_trait]
impl SampleWriter for TrackLocalStaticSample {
    async fn write(&self, sample: &Sample) -> Result<(), WriteError> {
        let sample = webrtc::media::Sample {
            data: sample.data.clone(),
            duration: sample.duration,
            ..Default::default()
        };
        self.write_sample(&sample).await?;
        Ok(())
    }
}

/// Everything one attached viewer holds in the shared graph.
///
/// The three connection points live together so a half-built branch cannot
/// be stored.
pub(crate) struct BranchRecord {
    pub sink: ElementHandle,
    pub tee_src: PadHandle,
    pub queue_sink: PadHandle,
    pub queue_src: PadHandle,
    pub cancel: CancellationToken,
    pub delivery: JoinHandle<()>,
}

/// Pull samples from `sink` and hand them to `writer` until cancelled or the
/// sink runs dry
pub(crate) async fn run_delivery<W>(
    engine: Arc<dyn MediaEngine>,
    sink: ElementHandle,
    writer: Arc<W>,
    cancel: CancellationToken,
    stream_id: StreamId,
    branch_id: BranchId,
) where
    W: SampleWriter + ?Sized,
{
    let mut delivered: u64 = 0;

    loop {
        let pulled = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                debug!(%stream_id, %branch_id, delivered, "Delivery cancelled");
                return;
            }
            pulled = engine.pull_sample(sink) => pulled,
        };

        match pulled {
            Ok(sample) => {
                if let Err(err) = writer.write(&sample).await {
                    warn!(%stream_id, %branch_id, error = %err, "Failed to write sample to track");
                    continue;
                }
                delivered += 1;
                trace!(%stream_id, %branch_id, bytes = sample.data.len(), "Sample delivered");
            }
            Err(EngineError::EndOfStream) => {
                debug!(%stream_id, %branch_id, delivered, "Sink reached end of stream");
                return;
            }
            Err(err) => {
                warn!(%stream_id, %branch_id, error = %err, "Sample pull failed, stopping delivery");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use camstream_media::{ElementKind, GraphState, MemoryEngine};
    use parking_lot::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingWriter {
        written: Mutex<Vec<Bytes>>,
        fail_first: Mutex<bool>,
    }

    #[async_trait]
    impl SampleWriter for RecordingWriter {
        async fn write(&self, sample: &Sample) -> Result<(), WriteError> {
            let mut fail = self.fail_first.lock();
            if *fail {
                *fail = false;
                return Err("track closed".into());
            }
            self.written.lock().push(sample.data.clone());
            Ok(())
        }
    }

    fn sample(byte: u8) -> Sample {
        Sample {
            data: Bytes::from(vec![byte]),
            duration: Duration::from_millis(33),
        }
    }

    /// A playing graph with a tee feeding one app sink through a multiqueue
    fn wired(engine: &MemoryEngine) -> (camstream_media::GraphHandle, ElementHandle) {
        let graph = engine.create_graph("g").unwrap();
        let tee = engine
            .create_element(&ElementKind::Tee { allow_not_linked: true }, "tee")
            .unwrap();
        let mq = engine.create_element(&ElementKind::MultiQueue, "mq").unwrap();
        let sink = engine
            .create_element(&ElementKind::AppSink { sync: true }, "sink")
            .unwrap();
        for element in [tee, mq, sink] {
            assert!(engine.add_to_graph(graph, element));
        }
        let tee_src = engine.request_pad(tee, "src_%u").unwrap();
        let mq_sink = engine.request_pad(mq, "sink_0").unwrap();
        engine.link_pads(tee_src, mq_sink).unwrap();
        engine
            .link_pads(
                engine.static_pad(mq, "src_0").unwrap(),
                engine.static_pad(sink, "sink").unwrap(),
            )
            .unwrap();
        engine.set_graph_state(graph, GraphState::Playing).unwrap();
        (graph, sink)
    }

    #[tokio::test]
    async fn test_write_errors_do_not_stop_delivery() {
        let engine = Arc::new(MemoryEngine::new());
        let (graph, sink) = wired(&engine);
        let writer = Arc::new(RecordingWriter {
            fail_first: Mutex::new(true),
            ..Default::default()
        });

        engine.push_sample(graph, &sample(1));
        engine.push_sample(graph, &sample(2));

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_delivery(
            engine.clone(),
            sink,
            Arc::clone(&writer),
            cancel.clone(),
            StreamId::from("cam"),
            BranchId::new(0),
        ));

        tokio::time::timeout(Duration::from_secs(1), async {
            while writer.written.lock().is_empty() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("second sample should be delivered");
        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(*writer.written.lock(), vec![Bytes::from(vec![2u8])]);
    }

    #[tokio::test]
    async fn test_cancellation_stops_waiting_loop() {
        let engine = Arc::new(MemoryEngine::new());
        let (_graph, sink) = wired(&engine);
        let writer = Arc::new(RecordingWriter::default());
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(run_delivery(
            engine.clone(),
            sink,
            writer,
            cancel.clone(),
            StreamId::from("cam"),
            BranchId::new(0),
        ));

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("delivery loop should observe cancellation")
            .unwrap();
    }
}
