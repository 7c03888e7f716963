use anyhow::{Context, Result};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use tracing::info;

/// Class index -> human readable name. Loaded once and handed to whoever renders.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelMap {
    names: BTreeMap<u32, String>,
}

impl LabelMap {
    /// JSON object keyed by the class index as a string: `{"0": "person", ...}`.
    pub fn from_json_str(s: &str) -> Result<Self> {
        let raw: HashMap<String, String> = serde_json::from_str(s).context("parse label json")?;
        let mut names = BTreeMap::new();
        for (k, v) in raw {
            let id: u32 = k
                .trim()
                .parse()
                .with_context(|| format!("label key {:?} is not a class index", k))?;
            names.insert(id, v);
        }
        Ok(Self { names })
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let s = std::fs::read_to_string(path)
            .with_context(|| format!("read labels {}", path.display()))?;
        let map = Self::from_json_str(&s)?;
        info!("labels: loaded {} classes from {}", map.len(), path.display());
        Ok(map)
    }

    pub fn name(&self, class_id: u32) -> Option<&str> {
        self.names.get(&class_id).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}
