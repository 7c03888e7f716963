use anyhow::{Context, Result};

use crate::labels::LabelMap;
use crate::{PipelineConfig, NUM_CLASSES};

pub fn check_pipeline(cfg: &PipelineConfig) -> Result<()> {
    anyhow::ensure!(
        (0.0..=1.0).contains(&cfg.conf_threshold),
        "vision.conf_threshold must be in [0,1], got {}",
        cfg.conf_threshold
    );
    anyhow::ensure!(
        (0.0..=1.0).contains(&cfg.iou_threshold),
        "vision.iou_threshold must be in [0,1], got {}",
        cfg.iou_threshold
    );
    anyhow::ensure!(cfg.max_detections != Some(0), "vision.max_detections=0 would drop every box");
    anyhow::ensure!(cfg.result_queue >= 1, "vision.result_queue must be >= 1");

    if let Some(path) = &cfg.labels_path {
        let labels = LabelMap::load(path).context("vision.labels_path")?;
        anyhow::ensure!(!labels.is_empty(), "label file {} has no entries", path);
        if labels.len() > NUM_CLASSES {
            tracing::warn!("doctor: {} labels for a {}-class model", labels.len(), NUM_CLASSES);
        }
    }
    Ok(())
}
