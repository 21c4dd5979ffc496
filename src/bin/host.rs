//! Console host for the assistant.
//!
//! Reads one command per line from stdin and prints app updates to stdout.
//! Tracing goes to stderr so stdout stays readable.
//!
//! ```text
//! tap                  primary trigger (dictate in chat/image, toggle live session)
//! mode chat|live|image switch mode
//! mute | unmute        gate the microphone during a live session
//! attach <path>        stage a file for the next chat request
//! detach               drop the staged file
//! say <utterance>      deliver a dictated utterance (after `tap`)
//! key <api key>        re-authorize after a permission failure
//! devices              list audio devices
//! quit                 exit
//! <anything else>      typed input for the active mode
//! ```

use anyhow::Context;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::io::AsyncBufReadExt;
use tokio::sync::broadcast;
use tradie::audio::{CpalMicrophone, CpalTimeline};
use tradie::chat::Attachment;
use tradie::dictation::{DictationEvent, DictationService, DictationSink};
use tradie::service::GeneratedImage;
use tradie::{App, AppCommand, AppUpdate, AssistConfig, Collaborators, Mode};

/// Dictation fed from the console: `say` lines stand in for recognized speech.
#[derive(Clone, Default)]
struct ConsoleDictation {
    sink: Arc<Mutex<Option<DictationSink>>>,
}

impl ConsoleDictation {
    /// Deliver `text` as one finished utterance, ending the dictation.
    /// Returns `false` when not listening.
    fn say(&self, text: &str) -> bool {
        let sink = match self.sink.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        };
        let Some(sink) = sink else {
            return false;
        };
        sink(DictationEvent::Result(text.to_owned()));
        sink(DictationEvent::Ended);
        true
    }
}

impl DictationService for ConsoleDictation {
    fn start(&mut self, _locale: &str, sink: DictationSink) -> tradie::Result<()> {
        sink(DictationEvent::Started);
        if let Ok(mut slot) = self.sink.lock() {
            *slot = Some(sink);
        }
        Ok(())
    }

    fn stop(&mut self) {
        if let Ok(mut slot) = self.sink.lock() {
            slot.take();
        }
    }
}

#[derive(Debug, PartialEq)]
enum Line {
    Command(AppCommand),
    Attach(PathBuf),
    Say(String),
    Devices,
    Usage(&'static str),
    Empty,
}

fn parse_line(line: &str) -> Line {
    let line = line.trim();
    let (head, rest) = line
        .split_once(char::is_whitespace)
        .map_or((line, ""), |(h, r)| (h, r.trim()));
    match head {
        "" => Line::Empty,
        "tap" => Line::Command(AppCommand::Tap),
        "mute" => Line::Command(AppCommand::SetMuted(true)),
        "unmute" => Line::Command(AppCommand::SetMuted(false)),
        "detach" => Line::Command(AppCommand::ClearAttachment),
        "quit" | "exit" => Line::Command(AppCommand::Shutdown),
        "devices" => Line::Devices,
        "mode" => match Mode::from_alias(rest) {
            Some(mode) => Line::Command(AppCommand::SwitchMode(mode)),
            None => Line::Usage("mode chat|live|image"),
        },
        "attach" if !rest.is_empty() => Line::Attach(PathBuf::from(rest)),
        "attach" => Line::Usage("attach <path>"),
        "say" if !rest.is_empty() => Line::Say(rest.to_owned()),
        "say" => Line::Usage("say <utterance>"),
        "key" if !rest.is_empty() => Line::Command(AppCommand::Authorize(rest.to_owned())),
        "key" => Line::Usage("key <api key>"),
        _ => Line::Command(AppCommand::SubmitText(line.to_owned())),
    }
}

fn read_attachment(path: &Path) -> anyhow::Result<Attachment> {
    let bytes =
        std::fs::read(path).with_context(|| format!("reading attachment {}", path.display()))?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    let mime = Attachment::mime_for_name(&name);
    Ok(Attachment::from_bytes(name, mime, &bytes))
}

fn save_image(dir: &Path, image: &GeneratedImage) -> anyhow::Result<PathBuf> {
    let format = image::guess_format(&image.bytes).context("unrecognized image data")?;
    let ext = format.extensions_str().first().copied().unwrap_or("img");
    std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    let path = dir.join(format!(
        "tradie-{}.{ext}",
        chrono::Utc::now().format("%Y%m%d-%H%M%S%3f")
    ));
    std::fs::write(&path, &image.bytes).with_context(|| format!("writing {}", path.display()))?;
    Ok(path)
}

fn print_devices() {
    match CpalMicrophone::list_input_devices() {
        Ok(names) => names.iter().for_each(|n| println!("input:  {n}")),
        Err(e) => eprintln!("input devices: {e}"),
    }
    match CpalTimeline::list_output_devices() {
        Ok(names) => names.iter().for_each(|n| println!("output: {n}")),
        Err(e) => eprintln!("output devices: {e}"),
    }
}

async fn print_updates(mut updates: broadcast::Receiver<AppUpdate>, image_dir: PathBuf) {
    loop {
        let update = match updates.recv().await {
            Ok(update) => update,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!(skipped = n, "console fell behind");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        match update {
            AppUpdate::OrbChanged(orb) => println!("[orb] {orb}"),
            AppUpdate::ModeChanged(mode) => println!("[mode] {mode}"),
            AppUpdate::Status(Some(msg)) => println!("[status] {msg}"),
            AppUpdate::Status(None) => {}
            AppUpdate::MuteChanged(muted) => {
                println!("[mic] {}", if muted { "muted" } else { "live" });
            }
            AppUpdate::MessageAppended(msg) => {
                if !msg.text.is_empty() {
                    println!("[{:?}] {}", msg.role, msg.text);
                }
            }
            AppUpdate::MessageUpdated(msg) if !msg.is_streaming => {
                println!("[{:?}] {}", msg.role, msg.text);
                for c in &msg.citations {
                    println!("    source: {} <{}>", c.title, c.uri);
                }
            }
            AppUpdate::MessageUpdated(_) => {}
            AppUpdate::MessageRemoved(id) => tracing::debug!(id, "message withdrawn"),
            AppUpdate::ImageGenerated { prompt, image } => match save_image(&image_dir, &image) {
                Ok(path) => println!("[image] {prompt} -> {}", path.display()),
                Err(e) => eprintln!("[image] could not save: {e:#}"),
            },
            AppUpdate::FilePickerRequested => println!("[picker] use `attach <path>`"),
            AppUpdate::AttachmentChanged(Some(name)) => println!("[attach] {name}"),
            AppUpdate::AttachmentChanged(None) => println!("[attach] cleared"),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("tradie=info")),
        )
        .init();

    let config_path = AssistConfig::default_config_path();
    let config = AssistConfig::load_or_default(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    if config.service.api_key().is_none() {
        tracing::warn!(
            env = %config.service.api_key_env,
            "no API key set; requests will fail until `key <api key>`"
        );
    }

    let dictation = ConsoleDictation::default();
    let parts = Collaborators::system(&config, Box::new(dictation.clone()));
    let image_dir = config.image.output_dir.clone();
    let (app, handle) = App::new(config, parts);

    let printer = tokio::spawn(print_updates(handle.subscribe(), image_dir));
    let app_task = tokio::spawn(app.run());

    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("reading stdin")? {
        let command = match parse_line(&line) {
            Line::Empty => continue,
            Line::Usage(usage) => {
                eprintln!("usage: {usage}");
                continue;
            }
            Line::Devices => {
                print_devices();
                continue;
            }
            Line::Say(text) => {
                if !dictation.say(&text) {
                    eprintln!("not listening; `tap` first");
                }
                continue;
            }
            Line::Attach(path) => match read_attachment(&path) {
                Ok(attachment) => AppCommand::Attach(attachment),
                Err(e) => {
                    eprintln!("{e:#}");
                    continue;
                }
            },
            Line::Command(command) => command,
        };
        let quit = matches!(command, AppCommand::Shutdown);
        if !handle.send(command) || quit {
            break;
        }
    }

    handle.send(AppCommand::Shutdown);
    app_task.await.context("app task panicked")?;
    printer.abort();
    tracing::info!("tradie-host shut down cleanly");
    Ok(())
}
