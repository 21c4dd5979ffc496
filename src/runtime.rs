//! The single event queue.
//!
//! [`App`] owns every component and mutates them only from [`App::run`].
//! Device callbacks, the duplex transport, dictation and spawned request
//! tasks never touch component state; they post events back into the loop.
//! Hosts drive the app through an [`AppHandle`] and observe it through a
//! broadcast stream of [`AppUpdate`]s.

use crate::audio::capture::{CaptureLoop, CpalMicrophone, Microphone};
use crate::audio::codec;
use crate::audio::playback::{CpalTimeline, OutputTimeline, PlaybackScheduler, SourceId};
use crate::chat::{Attachment, Conversation, Message};
use crate::config::AssistConfig;
use crate::dictation::{DictationEvent, DictationService, DictationSink, DictationState};
use crate::error::{AssistError, ErrorKind};
use crate::live::GeminiLiveTransport;
use crate::live::session::{LiveSession, SessionEffect, SessionEvent};
use crate::live::transport::{DuplexTransport, SessionRequest, switch_mode_tool};
use crate::mode::{ActionHandle, Mode, ModeOrchestrator, OrbState};
use crate::service::{
    AuthState, CompletionDelta, CompletionRequest, GeneratedImage, GeminiClient, ModelService,
    SPEECH_SAMPLE_RATE,
};
use crate::voice_command::{self, Routed, VoiceCommand};
use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Capacity of the update broadcast channel.
const UPDATE_CAPACITY: usize = 256;

/// Used when the configured error timeout is negative or not finite.
const DEFAULT_ERROR_CLEAR: Duration = Duration::from_secs(5);

/// Requests from the host.
#[derive(Debug, Clone, PartialEq)]
pub enum AppCommand {
    /// The primary trigger (orb tap).
    Tap,
    SwitchMode(Mode),
    SetMuted(bool),
    /// Typed input for the active mode.
    SubmitText(String),
    /// Stage a file for the next chat request.
    Attach(Attachment),
    ClearAttachment,
    /// Install a new API key after a permission failure.
    Authorize(String),
    Shutdown,
}

/// What hosts observe.
#[derive(Debug, Clone)]
pub enum AppUpdate {
    OrbChanged(OrbState),
    ModeChanged(Mode),
    /// The message shown next to the orb; `None` clears it.
    Status(Option<String>),
    MuteChanged(bool),
    MessageAppended(Message),
    MessageUpdated(Message),
    MessageRemoved(u64),
    ImageGenerated { prompt: String, image: GeneratedImage },
    FilePickerRequested,
    AttachmentChanged(Option<String>),
}

enum Event {
    Command(AppCommand),
    ToggleLive,
    ToggleDictation,
    /// Progress from the dictation started at `generation`.
    Dictation { generation: u64, event: DictationEvent },
    ChatDelta { id: u64, delta: CompletionDelta },
    ChatFinished { id: u64, result: Result<(), AssistError> },
    SpeechReady { mode: Mode, result: Result<Vec<u8>, AssistError> },
    ImageReady { prompt: String, result: Result<GeneratedImage, AssistError> },
}

enum Step {
    Event(Event),
    Live(SessionEvent),
    PlaybackEnded(SourceId),
    ErrorTimeout,
}

/// Sends commands to a running [`App`] and subscribes to its updates.
#[derive(Clone)]
pub struct AppHandle {
    tx: mpsc::UnboundedSender<Event>,
    updates: broadcast::Sender<AppUpdate>,
}

impl AppHandle {
    /// Queue a command. Returns `false` if the app has exited.
    pub fn send(&self, command: AppCommand) -> bool {
        self.tx.send(Event::Command(command)).is_ok()
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<AppUpdate> {
        self.updates.subscribe()
    }
}

/// External collaborators the app is built from.
pub struct Collaborators {
    pub microphone: Box<dyn Microphone>,
    pub timeline: Box<dyn OutputTimeline>,
    /// Completion notifications from `timeline`.
    pub playback_ended: mpsc::UnboundedReceiver<SourceId>,
    pub transport: Box<dyn DuplexTransport>,
    pub dictation: Box<dyn DictationService>,
    pub service: Arc<dyn ModelService>,
    pub auth: Arc<AuthState>,
}

impl Collaborators {
    /// System audio devices plus the hosted model; dictation is supplied by the host.
    pub fn system(config: &AssistConfig, dictation: Box<dyn DictationService>) -> Self {
        let auth = Arc::new(AuthState::new(config.service.api_key()));
        let (ended_tx, ended_rx) = mpsc::unbounded_channel();
        Self {
            microphone: Box::new(CpalMicrophone::new(&config.audio)),
            timeline: Box::new(CpalTimeline::new(&config.audio, ended_tx)),
            playback_ended: ended_rx,
            transport: Box::new(GeminiLiveTransport::new(
                config.service.live_url.clone(),
                Arc::clone(&auth),
            )),
            dictation,
            service: Arc::new(GeminiClient::new(&config.service, Arc::clone(&auth))),
            auth,
        }
    }
}

pub struct App {
    config: AssistConfig,
    orchestrator: ModeOrchestrator,
    session: LiveSession,
    playback: PlaybackScheduler,
    dictation: Box<dyn DictationService>,
    dictation_state: DictationState,
    service: Arc<dyn ModelService>,
    auth: Arc<AuthState>,
    conversation: Conversation,
    pending_attachment: Option<Attachment>,
    /// Assistant entry currently receiving a reply.
    pending_reply: Option<u64>,
    events_tx: mpsc::UnboundedSender<Event>,
    events_rx: mpsc::UnboundedReceiver<Event>,
    live_rx: mpsc::UnboundedReceiver<SessionEvent>,
    ended_rx: mpsc::UnboundedReceiver<SourceId>,
    updates: broadcast::Sender<AppUpdate>,
}

impl App {
    pub fn new(config: AssistConfig, parts: Collaborators) -> (Self, AppHandle) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (live_tx, live_rx) = mpsc::unbounded_channel();
        let (updates, _) = broadcast::channel(UPDATE_CAPACITY);

        let request = SessionRequest {
            model: config.service.live_model.clone(),
            voice: config.service.voice.clone(),
            system_instruction: config.service.system_instruction.clone(),
            input_sample_rate: config.audio.input_sample_rate,
            tools: vec![switch_mode_tool()],
        };
        let session = LiveSession::new(
            parts.transport,
            CaptureLoop::new(parts.microphone, config.audio.block_size),
            request,
            config.audio.output_sample_rate,
            live_tx,
        );
        let error_clear_after = Duration::try_from_secs_f64(config.ui.error_clear_secs)
            .unwrap_or_else(|_| {
                warn!(secs = config.ui.error_clear_secs, "invalid error_clear_secs; using 5s");
                DEFAULT_ERROR_CLEAR
            });

        let mut app = Self {
            orchestrator: ModeOrchestrator::new(Mode::Chat, error_clear_after),
            session,
            playback: PlaybackScheduler::new(parts.timeline),
            dictation: parts.dictation,
            dictation_state: DictationState::default(),
            service: parts.service,
            auth: parts.auth,
            conversation: Conversation::new(),
            pending_attachment: None,
            pending_reply: None,
            events_tx: events_tx.clone(),
            events_rx,
            live_rx,
            ended_rx: parts.playback_ended,
            updates: updates.clone(),
            config,
        };
        app.install_action(Mode::Chat);

        let handle = AppHandle {
            tx: events_tx,
            updates,
        };
        (app, handle)
    }

    /// Process events until [`AppCommand::Shutdown`].
    pub async fn run(mut self) {
        info!(mode = %self.orchestrator.mode(), "assistant running");
        loop {
            let deadline = self.orchestrator.error_deadline();
            let step = tokio::select! {
                Some(event) = self.events_rx.recv() => Step::Event(event),
                Some(event) = self.live_rx.recv() => Step::Live(event),
                Some(id) = self.ended_rx.recv() => Step::PlaybackEnded(id),
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    Step::ErrorTimeout
                }
                else => break,
            };

            match step {
                Step::Event(Event::Command(AppCommand::Shutdown)) => break,
                Step::Event(event) => self.handle_event(event),
                Step::Live(event) => {
                    let effects = self.session.handle(event, &mut self.playback);
                    self.apply_session_effects(effects);
                }
                Step::PlaybackEnded(id) => self.on_playback_ended(id),
                Step::ErrorTimeout => {
                    if self.orchestrator.expire_error(Instant::now()) {
                        self.publish_cleared();
                    }
                }
            }
        }
        self.shutdown();
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Command(command) => self.handle_command(command),
            Event::ToggleLive => self.toggle_live(),
            Event::ToggleDictation => self.toggle_dictation(),
            Event::Dictation { generation, event } => self.on_dictation(generation, event),
            Event::ChatDelta { id, delta } => {
                if self.conversation.append_delta(id, &delta.text, &delta.citations)
                    && let Some(msg) = self.conversation.get(id)
                {
                    self.publish(AppUpdate::MessageUpdated(msg.clone()));
                }
            }
            Event::ChatFinished { id, result } => self.on_chat_finished(id, result),
            Event::SpeechReady { mode, result } => self.on_speech_ready(mode, result),
            Event::ImageReady { prompt, result } => match result {
                Ok(image) => {
                    info!(bytes = image.bytes.len(), mime = %image.mime_type, "image generated");
                    self.publish(AppUpdate::ImageGenerated { prompt, image });
                    self.set_orb(Mode::ImageGen, OrbState::Idle);
                }
                Err(e) => self.report_error(e),
            },
        }
    }

    fn handle_command(&mut self, command: AppCommand) {
        match command {
            AppCommand::Tap => {
                if !self.orchestrator.invoke_action() {
                    // The tap dismissed an error.
                    self.publish_cleared();
                }
            }
            AppCommand::SwitchMode(mode) => self.switch_to(mode),
            AppCommand::SetMuted(muted) => {
                self.session.set_muted(muted);
                self.publish(AppUpdate::MuteChanged(muted));
            }
            AppCommand::SubmitText(text) => {
                let text = text.trim();
                if !text.is_empty() {
                    self.submit_input(text.to_owned());
                }
            }
            AppCommand::Attach(attachment) => {
                info!(name = %attachment.name, mime = %attachment.mime_type, "attachment staged");
                self.publish(AppUpdate::AttachmentChanged(Some(attachment.name.clone())));
                self.pending_attachment = Some(attachment);
            }
            AppCommand::ClearAttachment => {
                if self.pending_attachment.take().is_some() {
                    self.publish(AppUpdate::AttachmentChanged(None));
                }
            }
            AppCommand::Authorize(key) => self.auth.authorize(key),
            AppCommand::Shutdown => {}
        }
    }

    fn install_action(&mut self, mode: Mode) {
        let tx = self.events_tx.clone();
        let action: ActionHandle = match mode {
            Mode::Live => Box::new(move || {
                let _ = tx.send(Event::ToggleLive);
            }),
            Mode::Chat | Mode::ImageGen => Box::new(move || {
                let _ = tx.send(Event::ToggleDictation);
            }),
        };
        self.orchestrator.install_action(mode, action);
    }

    fn switch_to(&mut self, target: Mode) {
        let current = self.orchestrator.mode();
        if target == current {
            return;
        }
        match current {
            Mode::Live => {
                let effects = self.session.stop(&mut self.playback);
                self.apply_session_effects(effects);
            }
            Mode::Chat | Mode::ImageGen => self.cancel_dictation(),
        }
        self.playback.flush();

        if self.orchestrator.switch_mode(target) {
            self.publish(AppUpdate::ModeChanged(target));
            self.publish_cleared();
            self.install_action(target);
        }
    }

    fn toggle_live(&mut self) {
        if self.orchestrator.mode() != Mode::Live {
            return;
        }
        let effects = if self.session.is_running() {
            self.session.stop(&mut self.playback)
        } else {
            self.session.start()
        };
        self.apply_session_effects(effects);
    }

    fn apply_session_effects(&mut self, effects: Vec<SessionEffect>) {
        for effect in effects {
            match effect {
                SessionEffect::Orb(orb) => self.set_orb(Mode::Live, orb),
                SessionEffect::SwitchMode(mode) => self.switch_to(mode),
                SessionEffect::Error(e) => self.report_error(e),
            }
        }
    }

    fn toggle_dictation(&mut self) {
        let mode = self.orchestrator.mode();
        if mode == Mode::Live {
            return;
        }
        if self.dictation_state.is_listening() {
            self.stop_dictation();
            self.set_orb(mode, OrbState::Idle);
            return;
        }

        let generation = self.dictation_state.begin();
        let tx = self.events_tx.clone();
        let sink: DictationSink = Box::new(move |event| {
            let _ = tx.send(Event::Dictation { generation, event });
        });
        match self.dictation.start(&self.config.dictation.locale, sink) {
            Ok(()) => self.set_orb(mode, OrbState::Listening),
            Err(e) => {
                self.dictation_state.cancel();
                self.report_error(e);
            }
        }
    }

    /// Stop listening at the user's request. A final result may still follow.
    fn stop_dictation(&mut self) {
        if self.dictation_state.is_listening() {
            self.dictation.stop();
        }
        self.dictation_state.finish();
    }

    /// Stop listening and drop anything the recognizer delivers afterwards.
    fn cancel_dictation(&mut self) {
        if self.dictation_state.is_listening() {
            self.dictation.stop();
        }
        self.dictation_state.cancel();
    }

    fn on_dictation(&mut self, generation: u64, event: DictationEvent) {
        if !self.dictation_state.is_current(generation) {
            debug!(generation, ?event, "dropping stale dictation event");
            return;
        }
        let mode = self.orchestrator.mode();
        let transcript = self.dictation_state.apply(generation, &event);
        match &event {
            DictationEvent::Started => self.set_orb(mode, OrbState::Listening),
            DictationEvent::Error(text) => {
                self.report_error(AssistError::from_text(text.clone()));
            }
            DictationEvent::Ended | DictationEvent::Result(_) => {
                if self.orchestrator.orb() == OrbState::Listening && mode != Mode::Live {
                    self.set_orb(mode, OrbState::Idle);
                }
            }
        }
        if let Some(text) = transcript {
            self.on_transcript(text);
        }
    }

    fn on_transcript(&mut self, text: String) {
        let mut commands = Vec::new();
        let routed = voice_command::route(text, &mut |c| commands.push(c));
        if let Routed::Unhandled(text) = routed {
            self.submit_input(text);
            return;
        }
        for command in commands {
            match command {
                VoiceCommand::SwitchMode(mode) => self.switch_to(mode),
                VoiceCommand::OpenFilePicker => self.publish(AppUpdate::FilePickerRequested),
            }
        }
    }

    fn submit_input(&mut self, text: String) {
        match self.orchestrator.mode() {
            Mode::Chat => self.send_chat(text),
            Mode::ImageGen => self.generate_image(text),
            Mode::Live => debug!("ignoring text input in live mode"),
        }
    }

    fn send_chat(&mut self, text: String) {
        if self.pending_reply.is_some() {
            warn!("reply still streaming; input ignored");
            return;
        }
        let attachment = self.pending_attachment.take();
        if attachment.is_some() {
            self.publish(AppUpdate::AttachmentChanged(None));
        }

        let user_id = self.conversation.push_user(text.clone(), attachment.as_ref());
        self.publish_message(user_id, false);
        let reply_id = self.conversation.begin_assistant();
        self.publish_message(reply_id, false);
        self.pending_reply = Some(reply_id);
        self.set_orb(Mode::Chat, OrbState::Thinking);

        let request = CompletionRequest {
            prompt: text,
            attachment,
            grounding: self.config.service.grounding,
        };
        let service = Arc::clone(&self.service);
        let tx = self.events_tx.clone();
        let streaming = self.config.ui.stream_chat;
        let id = reply_id;

        tokio::spawn(async move {
            let result = if streaming {
                match service.complete_text_stream(&request).await {
                    Ok(mut stream) => {
                        let mut outcome = Ok(());
                        while let Some(item) = stream.next().await {
                            match item {
                                Ok(delta) => {
                                    if tx.send(Event::ChatDelta { id, delta }).is_err() {
                                        return;
                                    }
                                }
                                Err(e) => {
                                    outcome = Err(e);
                                    break;
                                }
                            }
                        }
                        outcome
                    }
                    Err(e) => Err(e),
                }
            } else {
                service.complete_text(&request).await.map(|c| {
                    let _ = tx.send(Event::ChatDelta {
                        id,
                        delta: CompletionDelta {
                            text: c.text,
                            citations: c.citations,
                        },
                    });
                })
            };
            let _ = tx.send(Event::ChatFinished { id, result });
        });
    }

    fn on_chat_finished(&mut self, id: u64, result: Result<(), AssistError>) {
        if self.pending_reply == Some(id) {
            self.pending_reply = None;
        }
        match result {
            Ok(()) => {
                let text = self.conversation.finish(id).map(|m| m.text.clone());
                self.publish_message(id, true);
                match text {
                    Some(text) if self.config.ui.speak_responses && !text.is_empty() => {
                        self.read_aloud(Mode::Chat, text);
                    }
                    _ => self.set_orb(Mode::Chat, OrbState::Idle),
                }
            }
            Err(e) => {
                if self.conversation.fail(id) {
                    self.publish(AppUpdate::MessageRemoved(id));
                } else {
                    self.publish_message(id, true);
                }
                self.report_error(e);
            }
        }
    }

    fn read_aloud(&mut self, mode: Mode, text: String) {
        let service = Arc::clone(&self.service);
        let tx = self.events_tx.clone();
        tokio::spawn(async move {
            let result = service.synthesize_speech(&text).await;
            let _ = tx.send(Event::SpeechReady { mode, result });
        });
    }

    fn on_speech_ready(&mut self, mode: Mode, result: Result<Vec<u8>, AssistError>) {
        if mode != self.orchestrator.mode() {
            debug!(%mode, "dropping speech for inactive mode");
            return;
        }
        let enqueued = result
            .and_then(|bytes| codec::decode(&bytes, SPEECH_SAMPLE_RATE, 1))
            .and_then(|buffer| self.playback.enqueue(&buffer));
        match enqueued {
            Ok(_) => self.set_orb(mode, OrbState::Speaking),
            Err(e) => self.report_error(e),
        }
    }

    fn on_playback_ended(&mut self, id: SourceId) {
        if !self.playback.source_ended(id) {
            return;
        }
        if self.session.is_running() {
            let effects = self.session.playback_drained();
            self.apply_session_effects(effects);
        } else if self.orchestrator.orb() == OrbState::Speaking {
            self.set_orb(self.orchestrator.mode(), OrbState::Idle);
        }
    }

    fn generate_image(&mut self, prompt: String) {
        self.set_orb(Mode::ImageGen, OrbState::Thinking);
        let service = Arc::clone(&self.service);
        let tx = self.events_tx.clone();
        let aspect_ratio = self.config.image.aspect_ratio.clone();
        tokio::spawn(async move {
            let result = service.generate_image(&prompt, &aspect_ratio).await;
            let _ = tx.send(Event::ImageReady { prompt, result });
        });
    }

    fn set_orb(&mut self, mode: Mode, orb: OrbState) {
        if self.orchestrator.report_status(mode, orb) {
            self.publish(AppUpdate::OrbChanged(orb));
        }
    }

    /// Show an error. Only the failing operation ends; the app keeps running.
    fn report_error(&mut self, error: AssistError) {
        if error.kind() == ErrorKind::PermissionDenied {
            self.auth.invalidate();
        }
        self.orchestrator.report_error(&error, Instant::now());
        self.publish(AppUpdate::OrbChanged(OrbState::Error));
        self.publish(AppUpdate::Status(
            self.orchestrator.status_message().map(str::to_owned),
        ));
    }

    /// The orb left the error state: clear the message, then report the orb.
    fn publish_cleared(&self) {
        self.publish(AppUpdate::Status(None));
        self.publish(AppUpdate::OrbChanged(self.orchestrator.orb()));
    }

    fn publish_message(&self, id: u64, updated: bool) {
        if let Some(msg) = self.conversation.get(id) {
            let msg = msg.clone();
            self.publish(if updated {
                AppUpdate::MessageUpdated(msg)
            } else {
                AppUpdate::MessageAppended(msg)
            });
        }
    }

    fn publish(&self, update: AppUpdate) {
        // No subscribers is fine.
        let _ = self.updates.send(update);
    }

    fn shutdown(&mut self) {
        let _ = self.session.stop(&mut self.playback);
        self.cancel_dictation();
        self.playback.flush();
        info!("assistant stopped");
    }
}
