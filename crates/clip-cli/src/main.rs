use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use clip_proto::RetrievalRequest;
use clip_retrieval::{doctor as retrieval_doctor, RetrievalClient, RetrievalConfig};
use clip_vision::labels::LabelMap;
use clip_vision::tensor::OUTPUT_SHAPE;
use clip_vision::{
    doctor as vision_doctor, mapper, preprocess, Bbox, Detection, FrameSize, PipelineConfig, RawTensor, Viewport,
};

#[derive(Debug, Parser)]
#[command(name = "clip", version, about = "Clip - on-device detection and similar-image retrieval")]
struct Cli {
    #[arg(long)]
    config: PathBuf,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Validate the configuration file.
    Doctor,
    /// Decode a raw 1x84x8400 little-endian f32 tensor dump into detections.
    Detect {
        #[arg(long)]
        tensor: PathBuf,
        #[arg(long)]
        frame_width: u32,
        #[arg(long)]
        frame_height: u32,
        /// Display surface as WxH; falls back to [viewport] in the config.
        #[arg(long)]
        viewport: Option<String>,
    },
    /// Send a query image to the retrieval server and save what comes back.
    Retrieve {
        #[arg(long)]
        image: PathBuf,
        #[arg(long)]
        count: Option<u32>,
        /// Frame-space box x1,y1,x2,y2 to cut out before sending.
        #[arg(long)]
        crop: Option<String>,
        #[arg(long)]
        out: PathBuf,
    },
}

#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct Config {
    vision: PipelineConfig,
    viewport: Option<ViewportCfg>,
    retrieval: RetrievalConfig,
}

#[derive(Debug, serde::Deserialize)]
struct ViewportCfg {
    width: f32,
    height: f32,
}

fn load_config(path: &Path) -> Result<Config> {
    let s = std::fs::read_to_string(path).with_context(|| format!("read config {}", path.display()))?;
    toml::from_str(&s).context("parse config toml")
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let cfg = load_config(&cli.config)?;

    match cli.cmd {
        Command::Doctor => doctor(&cfg)?,
        Command::Detect { tensor, frame_width, frame_height, viewport } => {
            let frame = FrameSize { width: frame_width, height: frame_height };
            detect(&cfg, &tensor, frame, viewport.as_deref())?
        }
        Command::Retrieve { image, count, crop, out } => {
            retrieve(&cfg, &image, count, crop.as_deref(), &out).await?
        }
    }
    Ok(())
}

fn doctor(cfg: &Config) -> Result<()> {
    info!("doctor: starting");
    vision_doctor::check_pipeline(&cfg.vision)?;
    retrieval_doctor::check_config(&cfg.retrieval)?;
    if let Some(vp) = &cfg.viewport {
        Viewport::new(vp.width, vp.height).context("[viewport]")?;
    }
    info!("doctor: OK");
    Ok(())
}

fn detect(cfg: &Config, tensor: &Path, frame: FrameSize, viewport: Option<&str>) -> Result<()> {
    anyhow::ensure!(frame.width > 0 && frame.height > 0, "frame size must be non-zero");

    let bytes = std::fs::read(tensor).with_context(|| format!("read tensor {}", tensor.display()))?;
    let raw = RawTensor::from_le_bytes(&bytes, &OUTPUT_SHAPE)?;
    let model = clip_vision::postprocess(&raw, &cfg.vision)?;
    let in_frame = mapper::to_frame(&model, frame);

    let viewport = match viewport {
        Some(s) => Some(parse_viewport(s)?),
        None => match &cfg.viewport {
            Some(vp) => Some(Viewport::new(vp.width, vp.height)?),
            None => None,
        },
    };
    let in_view = viewport.map(|vp| mapper::to_viewport(&in_frame, frame, vp));

    let labels = match &cfg.vision.labels_path {
        Some(p) => LabelMap::load(p)?,
        None => LabelMap::default(),
    };

    println!("detections={}", in_frame.len());
    for (i, d) in in_frame.iter().enumerate() {
        let name = labels.name(d.class_id).unwrap_or("?");
        print!("{:>3} {:<16} conf={:.3} frame={}", i, format!("{}({})", name, d.class_id), d.conf, fmt_box(d));
        if let Some(v) = in_view.as_ref().and_then(|v| v.get(i)) {
            print!(" view={}", fmt_box(v));
        }
        println!();
    }
    Ok(())
}

async fn retrieve(cfg: &Config, query_path: &Path, count: Option<u32>, crop: Option<&str>, out: &Path) -> Result<()> {
    let file = tokio::fs::read(query_path)
        .await
        .with_context(|| format!("read image {}", query_path.display()))?;

    let query = match crop {
        Some(rect) => {
            let bbox = parse_box(rect)?;
            let frame = image::load_from_memory(&file).context("decode query image")?.to_rgb8();
            preprocess::crop_jpeg(&frame, &bbox).context("crop query image")?
        }
        None => file,
    };

    let count = count.unwrap_or(cfg.retrieval.default_count);
    let req = RetrievalRequest::new(query, count)?;
    let client = RetrievalClient::new(cfg.retrieval.clone());
    let images = client.retrieve(req).await?;

    if images.is_empty() {
        warn!("retrieve: server returned no images");
        return Ok(());
    }

    tokio::fs::create_dir_all(out).await?;
    let stamp = time::OffsetDateTime::now_utc().unix_timestamp_nanos();
    for (i, img) in images.iter().enumerate() {
        let path = out.join(format!("{}_{}.jpg", stamp, i));
        tokio::fs::write(&path, &img.bytes).await.with_context(|| format!("write {}", path.display()))?;
        if img.is_truncated() {
            warn!("retrieve: {} is truncated ({}/{} bytes)", path.display(), img.bytes.len(), img.declared_len);
        }
        println!("{}", path.display());
    }
    info!("retrieve: saved {}/{} images to {}", images.len(), count, out.display());
    Ok(())
}

fn parse_viewport(s: &str) -> Result<Viewport> {
    let (w, h) = s.split_once(['x', 'X']).context("viewport must look like WxH")?;
    let w: f32 = w.trim().parse().context("viewport width")?;
    let h: f32 = h.trim().parse().context("viewport height")?;
    Ok(Viewport::new(w, h)?)
}

fn parse_box(s: &str) -> Result<Bbox> {
    let v = s
        .split(',')
        .map(|p| p.trim().parse::<f32>())
        .collect::<Result<Vec<_>, _>>()
        .context("crop must be four numbers x1,y1,x2,y2")?;
    anyhow::ensure!(v.len() == 4, "crop must be four numbers x1,y1,x2,y2");
    Ok(Bbox::new(v[0], v[1], v[2], v[3]))
}

fn fmt_box(d: &Detection) -> String {
    let b = d.bbox;
    format!("({:.1},{:.1},{:.1},{:.1})", b.x1, b.y1, b.x2, b.y2)
}
