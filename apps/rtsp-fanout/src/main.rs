use anyhow::Result;
use clap::Parser;
use rtsp_fanout::{
    config::Config,
    graph::StreamAnnouncement,
    host::LogNotifier,
    DisplayHandle, MediaGraph, MemoryGraph, Session,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// RTSP source url
    #[arg(short, long, env = "RTSP_FANOUT_SOURCE")]
    source: Option<String>,

    /// Push destination (rtsp:// or rtmp://), may be repeated
    #[arg(short, long)]
    push: Vec<String>,

    /// Record into this directory
    #[arg(long)]
    record_dir: Option<PathBuf>,

    /// Native window handle for the display branch
    #[arg(long)]
    surface: Option<usize>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Run against the in-memory graph instead of GStreamer
    #[arg(long)]
    simulate: bool,

    /// Check available GStreamer plugins and exit
    #[cfg(feature = "gst")]
    #[arg(long)]
    check_plugins: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = if args.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();

    info!("Starting RTSP fan-out v{}", env!("CARGO_PKG_VERSION"));

    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => {
            info!("No configuration file given, using defaults");
            Config::default()
        }
    };
    if args.record_dir.is_some() {
        config.recording.enabled = true;
    }

    let graph = build_graph(&args, &config)?;
    let Some(graph) = graph else {
        return Ok(());
    };

    let session = Session::start(config, graph, Arc::new(LogNotifier))?;

    match &args.source {
        Some(url) => session.set_source_url(url),
        None => warn!("No source url given, branches stay idle"),
    }

    if let Some(surface) = args.surface {
        session.set_surface(Some(DisplayHandle(surface)));
        if !session.play() {
            warn!("Display branch not requested");
        }
    }

    for url in &args.push {
        if !session.push_stream(true, url) {
            error!("Could not request push to {}", url);
        }
    }

    if let Some(dir) = &args.record_dir {
        if !session.set_recording(true, dir) {
            error!("Could not request recording into {}", dir.display());
        }
    }

    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C, shutting down");

    session.shutdown();
    Ok(())
}

/// Returns `None` when the invocation only inspects the installation.
fn build_graph(args: &Args, config: &Config) -> Result<Option<Arc<dyn MediaGraph>>> {
    if args.simulate {
        info!("Using in-memory graph");
        let graph = MemoryGraph::new();
        graph.announce_on_play(StreamAnnouncement {
            stream: "recv_rtp_src_0".to_string(),
            encoding: Some("H264".to_string()),
        });
        let graph: Arc<dyn MediaGraph> = Arc::new(graph);
        return Ok(Some(graph));
    }

    framework_graph(args, config)
}

#[cfg(feature = "gst")]
fn framework_graph(args: &Args, config: &Config) -> Result<Option<Arc<dyn MediaGraph>>> {
    use rtsp_fanout::{graph::gst::GstGraph, gst_utils};

    let capabilities = gst_utils::initialize(config)?;
    info!("GStreamer initialized successfully");

    if args.check_plugins {
        gst_utils::print_plugin_info(&capabilities);
        return Ok(None);
    }

    let graph: Arc<dyn MediaGraph> = GstGraph::new(&config.graph.name)?;
    Ok(Some(graph))
}

#[cfg(not(feature = "gst"))]
fn framework_graph(_args: &Args, _config: &Config) -> Result<Option<Arc<dyn MediaGraph>>> {
    anyhow::bail!("built without the gst feature; run with --simulate")
}
