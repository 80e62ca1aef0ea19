use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use tracing::info;

use super::{BranchError, BranchKind, BranchState, OutputBranch};
use crate::config::Config;
use crate::graph::{GraphError, MediaGraph, NodeSpec, NodeState, PropValue};
use crate::pipeline::PipelineContext;

pub const FILE_SINK: &str = "rec2-filesink";

/// Where a recording run writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordingTarget {
    pub directory: PathBuf,
    pub file: PathBuf,
}

/// File name for a recording started at `at`.
pub fn recording_path(directory: &Path, extension: &str, at: DateTime<Utc>) -> PathBuf {
    directory.join(format!(
        "VideoRecording-{}-utc.{}",
        at.format("%Y-%m-%d-%H-%M-%S"),
        extension
    ))
}

/// Muxes the elementary stream into a local file.
pub struct Recording;

impl OutputBranch for Recording {
    const KIND: BranchKind = BranchKind::Recording;
    type Target = RecordingTarget;

    fn target(ctx: &PipelineContext) -> Option<RecordingTarget> {
        let directory = ctx.recording_dir.clone()?;
        let file = recording_path(&directory, &ctx.config.recording.extension, Utc::now());
        Some(RecordingTarget { directory, file })
    }

    fn recipe(_config: &Config, target: &RecordingTarget) -> Vec<NodeSpec> {
        vec![
            NodeSpec::new("queue", "rec0-queue"),
            NodeSpec::new("flvmux", "rec1-flvmux"),
            NodeSpec::new("filesink", FILE_SINK)
                .property("location", target.file.to_string_lossy().into_owned()),
        ]
    }

    fn attached(ctx: &mut PipelineContext, target: &RecordingTarget) {
        info!("Recording to {}", target.file.display());
        ctx.recording_target = Some(target.directory.clone());
        ctx.recording_file = Some(target.file.clone());
    }

    fn detached(ctx: &mut PipelineContext) {
        ctx.recording_target = None;
        ctx.recording_file = None;
    }
}

/// Points a running recording at `directory`, restarting only the recording
/// subgraph. Returns false when nothing had to change.
pub fn retarget(
    graph: &dyn MediaGraph,
    ctx: &mut PipelineContext,
    directory: &Path,
) -> Result<bool, BranchError> {
    if ctx.state(BranchKind::Recording) != BranchState::Enabled
        || ctx.recording_target.as_deref() == Some(directory)
    {
        return Ok(false);
    }

    let file = recording_path(directory, &ctx.config.recording.extension, Utc::now());
    let timeout = ctx.config.graph.state_timeout();
    {
        let subgraph = ctx
            .subgraph(BranchKind::Recording)
            .ok_or_else(|| GraphError::Unsupported("recording without subgraph".to_string()))?;
        let sink = subgraph
            .find(FILE_SINK)
            .ok_or_else(|| GraphError::Unsupported("recording without file sink".to_string()))?;

        subgraph.set_state(graph, NodeState::Null, timeout)?;
        graph.set_property(
            sink,
            "location",
            &PropValue::from(file.to_string_lossy().into_owned()),
        )?;
        subgraph.sync_with_parent(graph)?;
    }

    info!("Recording moved to {}", file.display());
    ctx.recording_target = Some(directory.to_path_buf());
    ctx.recording_file = Some(file);
    Ok(true)
}
