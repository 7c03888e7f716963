//! Keep-only-latest frame analysis.
//!
//! The camera side calls [`FrameAnalyzer::submit`] for every frame it gets. The
//! frame lands in a single slot; if the worker is still busy with the previous one
//! the unprocessed frame is replaced, never queued. One frame is analyzed at a time
//! and nothing runs until the model session exists.

use image::RgbImage;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::{analyze_frame, DetectionResult, PipelineConfig, TensorProducer, VisionError};

pub type AnalysisOutcome = Result<DetectionResult, VisionError>;

type Slot = Option<(u64, Arc<RgbImage>)>;

pub struct FrameAnalyzer {
    slot: watch::Sender<Slot>,
    results: mpsc::Receiver<AnalysisOutcome>,
    next_seq: AtomicU64,
    dropped: Arc<AtomicU64>,
    worker: JoinHandle<()>,
}

impl FrameAnalyzer {
    /// Spawn the worker on the current tokio runtime. `create` builds the model
    /// session on the blocking pool before the first frame is looked at.
    pub fn start<F, P>(create: F, cfg: PipelineConfig) -> Self
    where
        F: FnOnce() -> anyhow::Result<P> + Send + 'static,
        P: TensorProducer + 'static,
    {
        let (slot, frames) = watch::channel(None);
        let (tx, results) = mpsc::channel(cfg.result_queue.max(1));
        let dropped = Arc::new(AtomicU64::new(0));
        let worker = tokio::spawn(run_worker(create, cfg, frames, tx, dropped.clone()));

        Self { slot, results, next_seq: AtomicU64::new(1), dropped, worker }
    }

    /// Hand over a frame. Never blocks; replaces a frame that has not been picked up.
    pub fn submit(&self, frame: RgbImage) {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        self.slot.send_replace(Some((seq, Arc::new(frame))));
    }

    /// Next outcome in analysis order. `None` once the worker has stopped.
    pub async fn next_result(&mut self) -> Option<AnalysisOutcome> {
        self.results.recv().await
    }

    /// Frames that were replaced before the worker got to them.
    pub fn frames_dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub async fn shutdown(self) {
        let Self { slot, results, worker, .. } = self;
        drop(slot);
        drop(results);
        if let Err(e) = worker.await {
            warn!("analyzer: worker ended abnormally: {}", e);
        }
    }
}

async fn run_worker<F, P>(
    create: F,
    cfg: PipelineConfig,
    mut frames: watch::Receiver<Slot>,
    results: mpsc::Sender<AnalysisOutcome>,
    dropped: Arc<AtomicU64>,
) where
    F: FnOnce() -> anyhow::Result<P> + Send + 'static,
    P: TensorProducer + 'static,
{
    let mut producer = match tokio::task::spawn_blocking(create).await {
        Ok(Ok(p)) => p,
        Ok(Err(e)) => {
            error!("analyzer: model session creation failed: {:#}", e);
            return;
        }
        Err(e) => {
            error!("analyzer: model session task aborted: {}", e);
            return;
        }
    };
    info!("analyzer: model session ready");

    let cfg = Arc::new(cfg);
    let mut last_seq = 0u64;

    while frames.changed().await.is_ok() {
        let latest = frames.borrow_and_update().clone();
        let Some((seq, frame)) = latest else { continue };

        let skipped = seq.saturating_sub(last_seq + 1);
        if skipped > 0 {
            dropped.fetch_add(skipped, Ordering::Relaxed);
            debug!("analyzer: dropped {} stale frame(s) before #{}", skipped, seq);
        }
        last_seq = seq;

        let job_cfg = cfg.clone();
        let job = tokio::task::spawn_blocking(move || {
            let outcome = analyze_frame(&mut producer, frame, &job_cfg);
            (producer, outcome)
        });
        let (p, outcome) = match job.await {
            Ok(v) => v,
            Err(e) => {
                error!("analyzer: frame #{} aborted, stopping: {}", seq, e);
                return;
            }
        };
        producer = p;

        match &outcome {
            Ok(r) => debug!("analyzer: frame #{} -> {} detections in {:?}", seq, r.detections.len(), r.process_time),
            Err(e) => warn!("analyzer: frame #{} failed: {}", seq, e),
        }
        if results.send(outcome).await.is_err() {
            debug!("analyzer: result receiver gone");
            break;
        }
    }
    debug!("analyzer: worker stopped after frame #{}", last_seq);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::tensor_with;
    use crate::{InputTensor, RawTensor};

    fn one_box(_: &InputTensor) -> anyhow::Result<RawTensor> {
        Ok(tensor_with(&[(10, 0, 0.9, [320.0, 320.0, 64.0, 64.0])]))
    }

    #[tokio::test]
    async fn only_latest_frame_after_session_ready() {
        let (gate_tx, gate_rx) = std::sync::mpsc::channel::<()>();
        let mut analyzer = FrameAnalyzer::start(
            move || {
                gate_rx.recv()?;
                Ok(one_box)
            },
            PipelineConfig::default(),
        );

        for w in [10, 20, 30] {
            analyzer.submit(RgbImage::new(w, 10));
        }
        gate_tx.send(()).unwrap();

        let res = analyzer.next_result().await.unwrap().unwrap();
        assert_eq!(res.frame.width(), 30);
        assert_eq!(res.detections.len(), 1);
        assert_eq!(analyzer.frames_dropped(), 2);

        analyzer.shutdown().await;
    }

    #[tokio::test]
    async fn failed_frame_does_not_stop_the_analyzer() {
        let mut calls = 0;
        let producer = move |_: &InputTensor| -> anyhow::Result<RawTensor> {
            calls += 1;
            if calls == 1 {
                Ok(RawTensor::new(vec![0.0; 10], &[1, 2, 5])?)
            } else {
                Ok(tensor_with(&[(3, 0, 0.8, [100.0, 100.0, 20.0, 20.0])]))
            }
        };
        let mut analyzer = FrameAnalyzer::start(move || Ok(producer), PipelineConfig::default());

        analyzer.submit(RgbImage::new(8, 8));
        let first = analyzer.next_result().await.unwrap();
        assert!(matches!(first, Err(VisionError::ShapeMismatch { .. })));

        analyzer.submit(RgbImage::new(64, 64));
        let second = analyzer.next_result().await.unwrap().unwrap();
        assert_eq!(second.frame.width(), 64);
        assert_eq!(second.detections[0].class_id, 0);
        assert_eq!(analyzer.frames_dropped(), 0);

        analyzer.shutdown().await;
    }

    #[tokio::test]
    async fn session_failure_ends_the_stream() {
        let mut analyzer = FrameAnalyzer::start(
            || -> anyhow::Result<fn(&InputTensor) -> anyhow::Result<RawTensor>> {
                Err(anyhow::anyhow!("model file missing"))
            },
            PipelineConfig::default(),
        );
        analyzer.submit(RgbImage::new(4, 4));
        assert!(analyzer.next_result().await.is_none());
    }
}
