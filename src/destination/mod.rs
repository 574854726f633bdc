// ABOUTME: Destination-side view - asset/instance labels and the telemetry submission seam
// ABOUTME: Labels are read-only; submission is all-or-nothing per call

pub mod client;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

pub use client::TelemetryClient;

/// One instance of the destination's asset graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestinationLabel {
    pub instance_id: String,
    pub asset_id: String,
    pub workspace_id: String,
    /// Source controller this instance is fed from; instances without one are
    /// not synchronised by this connector
    #[serde(default)]
    pub controller_id: Option<String>,
    /// Sensor key -> destination sensor id
    #[serde(default)]
    pub sensors: BTreeMap<String, String>,
}

/// Read-only snapshot of the destination labelling.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelRegistry {
    labels: Vec<DestinationLabel>,
}

impl LabelRegistry {
    pub fn from_labels(labels: Vec<DestinationLabel>) -> Self {
        Self { labels }
    }

    /// Load labels from a local JSON document (an array of labels).
    pub fn load_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read label file {:?}", path))?;
        let labels: Vec<DestinationLabel> = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse label file {:?}", path))?;
        tracing::info!("Loaded {} label(s) from {:?}", labels.len(), path);
        Ok(Self { labels })
    }

    pub fn labels(&self) -> &[DestinationLabel] {
        &self.labels
    }

    /// Labels that name a source controller.
    pub fn with_controller(&self) -> impl Iterator<Item = (&DestinationLabel, &str)> {
        self.labels
            .iter()
            .filter_map(|l| l.controller_id.as_deref().map(|c| (l, c)))
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// Where finished line-protocol records go.
///
/// `submit` succeeds only if every record was accepted; there is no partial
/// acknowledgement.
#[allow(async_fn_in_trait)]
pub trait TelemetrySink {
    async fn submit(&self, records: &[String]) -> Result<()>;
}

/// Where the label snapshot for a pass comes from.
#[allow(async_fn_in_trait)]
pub trait LabelSource {
    async fn load_labels(&self) -> Result<LabelRegistry>;
}

/// A registry loaded once (from a local file) serves every pass unchanged.
impl LabelSource for LabelRegistry {
    async fn load_labels(&self) -> Result<LabelRegistry> {
        Ok(self.clone())
    }
}
