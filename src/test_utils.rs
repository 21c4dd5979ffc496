//! In-memory collaborators for unit tests.
//!
//! Every fake appends to a shared [`CallLog`] so tests can assert on the
//! order in which devices and connections were acquired and released.

use crate::audio::capture::{BlockSink, DeviceStream, FrameSink, Microphone};
use crate::audio::codec::AudioBuffer;
use crate::audio::device::ReadySink;
use crate::audio::playback::{OutputTimeline, SourceId};
use crate::dictation::{DictationEvent, DictationService, DictationSink};
use crate::error::{AssistError, Result};
use crate::live::transport::{
    DuplexChannel, DuplexTransport, EventSink, InboundEvent, SessionRequest,
};
use crate::service::{
    Completion, CompletionDelta, CompletionRequest, CompletionStream, GeneratedImage,
    ModelService,
};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Ordered record of side effects, shared between fakes.
#[derive(Debug, Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<String>>>);

impl CallLog {
    pub fn record(&self, entry: impl Into<String>) {
        self.0.lock().expect("call log").push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().expect("call log").clone()
    }

    pub fn count(&self, entry: &str) -> usize {
        self.entries().iter().filter(|e| *e == entry).count()
    }

    /// Index of the first occurrence of `entry`.
    pub fn position(&self, entry: &str) -> Option<usize> {
        self.entries().iter().position(|e| e == entry)
    }
}

// ---------------------------------------------------------------------------
// Microphone
// ---------------------------------------------------------------------------

type SharedBlockSink = Arc<Mutex<Option<BlockSink>>>;

/// An open waiting on the permission prompt: the block sink to install and
/// the ready callback to fire once granted.
type PendingOpen = Arc<Mutex<Option<(BlockSink, ReadySink)>>>;

/// A microphone whose blocks are pushed by the test through a [`MicTicker`].
pub struct ScriptedMicrophone {
    log: CallLog,
    sink: SharedBlockSink,
    pending: PendingOpen,
    fail: bool,
    defer: bool,
}

impl ScriptedMicrophone {
    pub fn new(log: CallLog) -> Self {
        Self {
            log,
            sink: Arc::new(Mutex::new(None)),
            pending: Arc::new(Mutex::new(None)),
            fail: false,
            defer: false,
        }
    }

    /// Make every `open` report `DeviceUnavailable`.
    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    /// Hold each `open` until [`MicTicker::grant`] is called.
    pub fn awaiting_permission(mut self) -> Self {
        self.defer = true;
        self
    }

    pub fn ticker(&self) -> MicTicker {
        MicTicker {
            sink: Arc::clone(&self.sink),
            pending: Arc::clone(&self.pending),
        }
    }
}

impl Microphone for ScriptedMicrophone {
    fn open(
        &mut self,
        _block_size: usize,
        on_block: BlockSink,
        on_ready: ReadySink,
    ) -> Result<Box<dyn DeviceStream>> {
        if self.fail {
            on_ready(Err(AssistError::DeviceUnavailable("no input device".into())));
        } else if self.defer {
            *self.pending.lock().expect("mic pending") = Some((on_block, on_ready));
        } else {
            self.log.record("mic.open");
            *self.sink.lock().expect("mic sink") = Some(on_block);
            on_ready(Ok(()));
        }
        Ok(Box::new(ScriptedStream {
            log: self.log.clone(),
            sink: Arc::clone(&self.sink),
            pending: Arc::clone(&self.pending),
            released: false,
        }))
    }
}

struct ScriptedStream {
    log: CallLog,
    sink: SharedBlockSink,
    pending: PendingOpen,
    released: bool,
}

impl DeviceStream for ScriptedStream {
    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.sink.lock().expect("mic sink").take();
        self.pending.lock().expect("mic pending").take();
        self.log.record("mic.release");
    }
}

/// Delivers blocks as if the device callback fired.
#[derive(Clone)]
pub struct MicTicker {
    sink: SharedBlockSink,
    pending: PendingOpen,
}

impl MicTicker {
    /// Answer the permission prompt for a held `open`. Does nothing when
    /// none is pending.
    pub fn grant(&self) {
        let Some((on_block, on_ready)) = self.pending.lock().expect("mic pending").take() else {
            return;
        };
        *self.sink.lock().expect("mic sink") = Some(on_block);
        on_ready(Ok(()));
    }

    /// Deliver one block. Does nothing when the device is not open.
    pub fn tick(&self, samples: &[f32]) {
        if let Some(sink) = self.sink.lock().expect("mic sink").as_mut() {
            sink(samples);
        }
    }
}

// ---------------------------------------------------------------------------
// Output timeline
// ---------------------------------------------------------------------------

#[derive(Default)]
struct TimelineState {
    now: f64,
    scheduled: Vec<(SourceId, f64)>,
    stopped: Vec<SourceId>,
    fail_next: bool,
}

/// An output clock the test advances by hand.
#[derive(Clone)]
pub struct ManualTimeline {
    log: CallLog,
    state: Arc<Mutex<TimelineState>>,
}

impl ManualTimeline {
    pub fn new(log: CallLog) -> Self {
        Self {
            log,
            state: Arc::new(Mutex::new(TimelineState::default())),
        }
    }

    pub fn set_time(&self, now: f64) {
        self.state.lock().expect("timeline").now = now;
    }

    /// Every `(id, start_at)` scheduled so far.
    pub fn scheduled(&self) -> Vec<(SourceId, f64)> {
        self.state.lock().expect("timeline").scheduled.clone()
    }

    pub fn stopped(&self) -> Vec<SourceId> {
        self.state.lock().expect("timeline").stopped.clone()
    }

    /// Reject the next `schedule` call.
    pub fn fail_next_schedule(&self) {
        self.state.lock().expect("timeline").fail_next = true;
    }
}

impl OutputTimeline for ManualTimeline {
    fn current_time(&self) -> f64 {
        self.state.lock().expect("timeline").now
    }

    fn schedule(&mut self, id: SourceId, _buffer: &AudioBuffer, start_at: f64) -> Result<()> {
        let mut state = self.state.lock().expect("timeline");
        if std::mem::take(&mut state.fail_next) {
            return Err(AssistError::DeviceUnavailable("output device lost".into()));
        }
        state.scheduled.push((id, start_at));
        self.log.record("timeline.schedule");
        Ok(())
    }

    fn stop(&mut self, id: SourceId) {
        self.state.lock().expect("timeline").stopped.push(id);
        self.log.record("timeline.stop");
    }
}

// ---------------------------------------------------------------------------
// Duplex transport
// ---------------------------------------------------------------------------

/// A transport whose inbound events are emitted by the test.
#[derive(Clone)]
pub struct FakeTransport {
    log: CallLog,
    sink: Arc<Mutex<Option<EventSink>>>,
    sent: Arc<Mutex<Vec<Vec<u8>>>>,
    requests: Arc<Mutex<Vec<SessionRequest>>>,
}

impl FakeTransport {
    pub fn new(log: CallLog) -> Self {
        Self {
            log,
            sink: Arc::new(Mutex::new(None)),
            sent: Arc::new(Mutex::new(Vec::new())),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Deliver an event through the most recently opened connection.
    pub fn emit(&self, event: InboundEvent) {
        if let Some(sink) = self.sink.lock().expect("transport sink").as_ref() {
            sink(event);
        }
    }

    pub fn sent_frames(&self) -> Vec<Vec<u8>> {
        self.sent.lock().expect("sent frames").clone()
    }

    pub fn requests(&self) -> Vec<SessionRequest> {
        self.requests.lock().expect("requests").clone()
    }
}

impl DuplexTransport for FakeTransport {
    fn open(&mut self, request: SessionRequest, sink: EventSink) -> Box<dyn DuplexChannel> {
        self.log.record("transport.open");
        self.requests.lock().expect("requests").push(request);
        *self.sink.lock().expect("transport sink") = Some(sink);
        Box::new(FakeChannel {
            log: self.log.clone(),
            sent: Arc::clone(&self.sent),
        })
    }
}

struct FakeChannel {
    log: CallLog,
    sent: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl DuplexChannel for FakeChannel {
    fn send_realtime_input(&self, frame: Vec<u8>) {
        self.sent.lock().expect("sent frames").push(frame);
    }

    fn frame_sink(&self) -> FrameSink {
        let sent = Arc::clone(&self.sent);
        Box::new(move |frame| sent.lock().expect("sent frames").push(frame))
    }

    fn close(&mut self) {
        self.log.record("channel.close");
    }
}

// ---------------------------------------------------------------------------
// Dictation
// ---------------------------------------------------------------------------

/// A recognizer the test speaks through.
#[derive(Clone)]
pub struct FakeDictation {
    log: CallLog,
    sink: Arc<Mutex<Option<DictationSink>>>,
    linger: Arc<AtomicBool>,
}

impl FakeDictation {
    pub fn new(log: CallLog) -> Self {
        Self {
            log,
            sink: Arc::new(Mutex::new(None)),
            linger: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Keep delivering through the old sink after `stop`, as recognizers
    /// that flush a final result on shutdown do.
    pub fn keep_sink_after_stop(&self) {
        self.linger.store(true, Ordering::SeqCst);
    }

    /// Deliver `Result(text)` then `Ended`, as a recognizer does for one utterance.
    pub fn say(&self, text: &str) {
        if let Some(sink) = self.sink.lock().expect("dictation sink").as_ref() {
            sink(DictationEvent::Result(text.to_owned()));
            sink(DictationEvent::Ended);
        }
    }
}

impl DictationService for FakeDictation {
    fn start(&mut self, _locale: &str, sink: DictationSink) -> Result<()> {
        self.log.record("dictation.start");
        sink(DictationEvent::Started);
        *self.sink.lock().expect("dictation sink") = Some(sink);
        Ok(())
    }

    fn stop(&mut self) {
        self.log.record("dictation.stop");
        if !self.linger.load(Ordering::SeqCst) {
            self.sink.lock().expect("dictation sink").take();
        }
    }
}

// ---------------------------------------------------------------------------
// Model service
// ---------------------------------------------------------------------------

/// Canned replies for the request/response surface.
pub struct FakeModelService {
    log: CallLog,
    reply: Mutex<std::result::Result<Vec<CompletionDelta>, AssistError>>,
    speech: Mutex<std::result::Result<Vec<u8>, AssistError>>,
    image: Mutex<std::result::Result<GeneratedImage, AssistError>>,
}

impl FakeModelService {
    pub fn new(log: CallLog) -> Self {
        Self {
            log,
            reply: Mutex::new(Ok(vec![CompletionDelta {
                text: "ok".into(),
                citations: Vec::new(),
            }])),
            speech: Mutex::new(Ok(Vec::new())),
            image: Mutex::new(Ok(GeneratedImage {
                bytes: vec![0x89, b'P', b'N', b'G'],
                mime_type: "image/png".into(),
            })),
        }
    }

    pub fn reply_with(&self, reply: std::result::Result<Vec<CompletionDelta>, AssistError>) {
        *self.reply.lock().expect("reply") = reply;
    }

    pub fn speak_with(&self, speech: std::result::Result<Vec<u8>, AssistError>) {
        *self.speech.lock().expect("speech") = speech;
    }

    pub fn image_with(&self, image: std::result::Result<GeneratedImage, AssistError>) {
        *self.image.lock().expect("image") = image;
    }
}

#[async_trait]
impl ModelService for FakeModelService {
    async fn complete_text(&self, request: &CompletionRequest) -> Result<Completion> {
        self.log.record(format!("service.complete:{}", request.prompt));
        let deltas = self.reply.lock().expect("reply").clone()?;
        Ok(Completion {
            text: deltas.iter().map(|d| d.text.as_str()).collect(),
            citations: deltas.into_iter().flat_map(|d| d.citations).collect(),
        })
    }

    async fn complete_text_stream(&self, request: &CompletionRequest) -> Result<CompletionStream> {
        self.log.record(format!("service.stream:{}", request.prompt));
        let deltas = self.reply.lock().expect("reply").clone()?;
        Ok(Box::pin(futures_util::stream::iter(deltas.into_iter().map(Ok))))
    }

    async fn synthesize_speech(&self, _text: &str) -> Result<Vec<u8>> {
        self.log.record("service.speech");
        self.speech.lock().expect("speech").clone()
    }

    async fn generate_image(&self, prompt: &str, _size_hint: &str) -> Result<GeneratedImage> {
        self.log.record(format!("service.image:{prompt}"));
        self.image.lock().expect("image").clone()
    }
}
