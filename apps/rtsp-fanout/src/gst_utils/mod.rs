use gst::prelude::*;
use std::collections::HashMap;
use tracing::{debug, error, info};

use crate::config::Config;
use crate::{FanoutError, Result};

/// Elements the shared upstream cannot be built without.
const REQUIRED_ELEMENTS: &[&str] = &[
    "rtspsrc",
    "rtph264depay",
    "h264parse",
    "tee",
    "queue",
    "flvmux",
    "fakesink",
];

/// Elements only some branches need.
const OPTIONAL_ELEMENTS: &[&str] = &["rtmpsink", "rtspclientsink", "filesink"];

#[derive(Debug, Clone)]
pub struct GstCapabilities {
    pub has_rtmp_push: bool,
    pub has_rtsp_push: bool,
    pub has_recording: bool,
    pub has_display: bool,
    pub available_elements: HashMap<String, bool>,
}

/// Initializes GStreamer and checks the elements `config` refers to.
pub fn initialize(config: &Config) -> Result<GstCapabilities> {
    info!("Initializing GStreamer");

    gst::init().map_err(|e| {
        error!("Failed to initialize GStreamer: {}", e);
        FanoutError::FrameworkError(format!("GStreamer initialization failed: {}", e))
    })?;

    let (major, minor, micro, nano) = gst::version();
    info!("GStreamer version: {}.{}.{}.{}", major, minor, micro, nano);

    if let Ok(debug_str) = std::env::var("GST_DEBUG") {
        debug!("GST_DEBUG set to: {}", debug_str);
    }

    let capabilities = discover_plugins(config)?;
    info!(
        "Branch support: display={} rtmp={} rtsp={} recording={}",
        capabilities.has_display,
        capabilities.has_rtmp_push,
        capabilities.has_rtsp_push,
        capabilities.has_recording
    );
    Ok(capabilities)
}

fn element_available(name: &str) -> bool {
    match gst::ElementFactory::find(name) {
        Some(factory) => {
            debug!("Found element: {} (rank: {:?})", name, factory.rank());
            true
        }
        None => false,
    }
}

pub fn discover_plugins(config: &Config) -> Result<GstCapabilities> {
    let mut available_elements = HashMap::new();
    let mut missing_required = Vec::new();

    for element in REQUIRED_ELEMENTS {
        let found = element_available(element);
        if !found {
            error!("Missing required element: {}", element);
            missing_required.push(*element);
        }
        available_elements.insert(element.to_string(), found);
    }

    if !missing_required.is_empty() {
        return Err(FanoutError::FrameworkError(format!(
            "Missing required GStreamer elements: {:?}",
            missing_required
        )));
    }

    for element in OPTIONAL_ELEMENTS
        .iter()
        .copied()
        .chain([config.display.decoder.as_str(), config.display.sink.as_str()])
    {
        let found = element_available(element);
        if !found {
            debug!("Optional element not found: {}", element);
        }
        available_elements.insert(element.to_string(), found);
    }

    let has = |name: &str| available_elements.get(name).copied().unwrap_or(false);
    Ok(GstCapabilities {
        has_rtmp_push: has("rtmpsink"),
        has_rtsp_push: has("rtspclientsink"),
        has_recording: has("filesink"),
        has_display: has(&config.display.decoder) && has(&config.display.sink),
        available_elements,
    })
}

/// Report for `--check-plugins`.
pub fn print_plugin_info(capabilities: &GstCapabilities) {
    println!("\nGStreamer Plugin Discovery Report");
    println!("==================================");

    let (major, minor, micro, nano) = gst::version();
    println!("\nGStreamer Version: {}.{}.{}.{}", major, minor, micro, nano);

    let mut elements: Vec<_> = capabilities.available_elements.iter().collect();
    elements.sort();
    println!("\nElements:");
    for (element, found) in elements {
        println!("  {} {}", if *found { "✓" } else { "✗" }, element);
    }

    println!("\nBranches:");
    println!("  display:   {}", capabilities.has_display);
    println!("  push rtmp: {}", capabilities.has_rtmp_push);
    println!("  push rtsp: {}", capabilities.has_rtsp_push);
    println!("  recording: {}", capabilities.has_recording);
}
