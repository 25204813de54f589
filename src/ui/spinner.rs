use anyhow::{anyhow, Result};
use log::debug;
use std::io::Write;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::{Mark, ProgressWriter};

const SPINNER_CHARS: [&str; 4] = ["|", "/", "-", "\\"];
const TICK: Duration = Duration::from_millis(100);

struct Update {
    progress: String,
    rendered: SyncSender<()>,
}

/// Formats a status line with a spinner at the end and keeps it refreshed
/// from a background thread.
///
/// The spinner owns every line below the mark it takes on start until
/// [`stop`](Spinner::stop) returns; nothing else may write to the same
/// [`ProgressWriter`] in between except through [`update`](Spinner::update).
pub struct Spinner {
    tx: Option<SyncSender<Update>>,
    handle: Option<JoinHandle<()>>,
}

impl Spinner {
    /// Starts a spinner whose lines are all prefixed with `prefix`.
    pub fn start(writer: Arc<ProgressWriter>, prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        let (tx, rx) = mpsc::sync_channel(0);
        let mark = writer.mark();
        let handle = thread::spawn(move || spin(&writer, mark, &prefix, rx));
        Self {
            tx: Some(tx),
            handle: Some(handle),
        }
    }

    /// Hands a new progress status to the spinner and waits until it has
    /// been drawn.
    pub fn update(&self, progress: impl Into<String>) -> Result<()> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| anyhow!("spinner already stopped"))?;
        let (rendered, wait) = mpsc::sync_channel(1);
        tx.send(Update {
            progress: progress.into(),
            rendered,
        })
        .map_err(|_| anyhow!("spinner thread exited"))?;
        // A dropped sender means the thread died mid-draw; the join in
        // stop() surfaces that.
        let _ = wait.recv();
        Ok(())
    }

    /// Stops the background thread and waits for it to exit. No output is
    /// written by the spinner once this returns.
    pub fn stop(&mut self) {
        drop(self.tx.take());
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                debug!("spinner thread panicked");
            }
        }
    }
}

impl Drop for Spinner {
    fn drop(&mut self) {
        self.stop();
    }
}

fn spin(writer: &ProgressWriter, mark: Mark, prefix: &str, rx: Receiver<Update>) {
    let mut progress = String::new();
    let mut idx = 0;
    let mut ack: Option<SyncSender<()>> = None;
    loop {
        let glyph = SPINNER_CHARS[idx % SPINNER_CHARS.len()];
        if let Err(e) = draw(writer, mark, prefix, &progress, glyph) {
            debug!("spinner failed to draw: {e}");
        }
        idx += 1;
        if let Some(rendered) = ack.take() {
            let _ = rendered.send(());
        }

        match rx.recv_timeout(TICK) {
            Ok(update) => {
                progress = update.progress;
                ack = Some(update.rendered);
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => return,
        }
    }
}

fn draw(
    writer: &ProgressWriter,
    mark: Mark,
    prefix: &str,
    progress: &str,
    glyph: &str,
) -> std::io::Result<()> {
    writer.clear_to_mark(mark)?;
    let mut out = writer;
    writeln!(out, "{prefix}{progress} {glyph}")?;
    out.flush()
}

/// Formats `n/d` with `n` right-aligned to the width of `d`.
pub fn fraction(n: usize, d: usize) -> String {
    let width = d.to_string().len();
    format!("{n:>width$}/{d}")
}
