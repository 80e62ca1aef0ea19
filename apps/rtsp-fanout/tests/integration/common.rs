use parking_lot::Mutex;
use rtsp_fanout::{
    BranchKind, BranchState, Config, DisplayHandle, HostNotifier, MemoryGraph, Session,
};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

pub const SOURCE_URL: &str = "rtsp://10.0.0.5:554/stream1";
pub const RTMP_URL: &str = "rtmp://live.example.com/app/key";
pub const RTSP_URL: &str = "rtsp://10.0.0.9:8554/relay";
pub const SURFACE: DisplayHandle = DisplayHandle(0x2a00);

/// Host stand-in that keeps everything it is told.
#[derive(Default)]
pub struct RecordingNotifier {
    messages: Mutex<Vec<String>>,
    sizes: Mutex<Vec<(u32, u32)>>,
}

impl RecordingNotifier {
    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().clone()
    }

    pub fn count_with_code(&self, code: char) -> usize {
        self.messages
            .lock()
            .iter()
            .filter(|m| m.starts_with(code))
            .count()
    }

    pub fn sizes(&self) -> Vec<(u32, u32)> {
        self.sizes.lock().clone()
    }
}

impl HostNotifier for RecordingNotifier {
    fn on_message(&self, text: &str) {
        self.messages.lock().push(text.to_string());
    }

    fn on_media_size_changed(&self, width: u32, height: u32) {
        self.sizes.lock().push((width, height));
    }
}

/// Polls `check` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(5));
    }
}

pub struct TestSession {
    pub graph: Arc<MemoryGraph>,
    pub notifier: Arc<RecordingNotifier>,
    pub session: Session,
}

impl TestSession {
    pub fn new(config: Config) -> Self {
        super::init_test_environment();
        let graph = Arc::new(MemoryGraph::new());
        let notifier = Arc::new(RecordingNotifier::default());
        let session = Session::start(config, graph.clone(), notifier.clone())
            .expect("session should start");
        Self {
            graph,
            notifier,
            session,
        }
    }

    /// A session with a source url already set.
    pub fn with_source(config: Config) -> Self {
        let test = Self::new(config);
        test.session.set_source_url(SOURCE_URL);
        test
    }

    pub fn wait_for(&self, kind: BranchKind, state: BranchState) -> bool {
        wait_until(Duration::from_secs(3), || {
            self.session.branch_state(kind) == state
        })
    }

    /// Starts the display on [`SURFACE`] and waits for it.
    pub fn start_display(&self) {
        self.session.set_surface(Some(SURFACE));
        assert!(self.session.play());
        assert!(
            self.wait_for(BranchKind::Display, BranchState::Enabled),
            "display did not come up"
        );
    }

    /// Waits until no restart is pending or running.
    pub fn wait_settled(&self) -> bool {
        wait_until(Duration::from_secs(5), || {
            self.session.pending_resets().is_empty() && !self.session.is_restarting()
        })
    }
}
