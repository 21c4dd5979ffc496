//! Owner thread for `cpal` streams.
//!
//! A `cpal::Stream` is not `Send` on every platform, so each stream is built
//! and held on its own thread. Building can stall for as long as an OS
//! permission prompt is up, so [`StreamThread::spawn`] returns at once and the
//! outcome arrives later through a [`ReadySink`].

use crate::error::{AssistError, Result};
use crossbeam_channel::{Sender, bounded};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use tracing::{debug, warn};

/// Receives the outcome of opening a device. Called once, from the owner thread.
pub type ReadySink = Box<dyn FnOnce(Result<()>) + Send>;

/// A device stream held by a dedicated thread.
pub struct StreamThread {
    label: &'static str,
    stop_tx: Option<Sender<()>>,
    join: Option<JoinHandle<()>>,
    opened: Arc<AtomicBool>,
}

impl StreamThread {
    /// Build a stream on a fresh thread and keep it alive until released.
    ///
    /// `build` runs on the owner thread; its result goes to `on_ready`.
    ///
    /// # Errors
    ///
    /// Returns [`AssistError::DeviceUnavailable`] if the owner thread cannot be
    /// spawned. Failures of `build` itself are reported through `on_ready`.
    pub fn spawn<F>(label: &'static str, build: F, on_ready: ReadySink) -> Result<Self>
    where
        F: FnOnce() -> Result<cpal::Stream> + Send + 'static,
    {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let opened = Arc::new(AtomicBool::new(false));
        let thread_opened = Arc::clone(&opened);

        let join = std::thread::Builder::new()
            .name(format!("tradie-{label}"))
            .spawn(move || {
                let stream = match build() {
                    Ok(stream) => stream,
                    Err(e) => {
                        on_ready(Err(e));
                        return;
                    }
                };
                thread_opened.store(true, Ordering::Release);
                on_ready(Ok(()));
                // Hold the stream until the stop signal (or the sender drops).
                let _ = stop_rx.recv();
                drop(stream);
                debug!("{label} stream dropped");
            })
            .map_err(|e| AssistError::DeviceUnavailable(format!("cannot spawn {label} thread: {e}")))?;

        Ok(Self {
            label,
            stop_tx: Some(stop_tx),
            join: Some(join),
            opened,
        })
    }

    /// Stop and close the stream.
    ///
    /// Once the device has opened this blocks until the owner thread exits.
    /// Before that, the thread is left to drop the stream as soon as `build`
    /// returns. Safe to call more than once.
    pub fn release(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        let Some(join) = self.join.take() else {
            return;
        };
        if !self.opened.load(Ordering::Acquire) && !join.is_finished() {
            debug!("{} released while still opening", self.label);
            return;
        }
        if join.join().is_err() {
            warn!("{} owner thread panicked", self.label);
        }
    }

    /// Whether the stream is still held.
    pub fn is_running(&self) -> bool {
        self.join.is_some()
    }
}

impl Drop for StreamThread {
    fn drop(&mut self) {
        self.release();
    }
}
