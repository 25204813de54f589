use std::io::{self, Write};
use std::sync::{Arc, Mutex, MutexGuard};

const CLEAR_LINE: &str = "\x1b[1A\x1b[2K\r";

/// A line-counting wrapper around a terminal stream which can erase
/// everything written after a [`Mark`].
///
/// The writer is shared by reference between the main flow and any running
/// [`Spinner`](super::Spinner). Every write and clear holds the internal lock
/// for its whole duration, so lines from different producers never
/// interleave mid-line.
///
/// Multiple marks may be held at once; callers clear the innermost (most
/// recently taken) mark first.
pub struct ProgressWriter {
    inner: Mutex<Inner>,
}

struct Inner {
    wrapped: Box<dyn Write + Send>,
    /// Index of the current line since the writer was created.
    line_idx: usize,
}

/// Snapshot of a [`ProgressWriter`]'s line position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Mark {
    line_idx: usize,
}

impl ProgressWriter {
    pub fn new(wrapped: impl Write + Send + 'static) -> Self {
        Self {
            inner: Mutex::new(Inner {
                wrapped: Box::new(wrapped),
                line_idx: 0,
            }),
        }
    }

    pub fn stderr() -> Self {
        Self::new(io::stderr())
    }

    /// Returns a mark for the current line. Later, [`clear_to_mark`] erases
    /// every line written since.
    ///
    /// [`clear_to_mark`]: ProgressWriter::clear_to_mark
    pub fn mark(&self) -> Mark {
        Mark {
            line_idx: self.lock().line_idx,
        }
    }

    /// Number of complete lines currently on screen since creation.
    pub fn lines(&self) -> usize {
        self.lock().line_idx
    }

    /// Issues escape sequences to erase all lines since the given mark.
    ///
    /// # Panics
    ///
    /// If the lines the mark refers to were already erased by clearing to an
    /// earlier mark.
    pub fn clear_to_mark(&self, mark: Mark) -> io::Result<()> {
        let mut inner = self.lock();
        if inner.line_idx < mark.line_idx {
            panic!("invalid use of mark (marked line was cleared)");
        }
        let erase = CLEAR_LINE.repeat(inner.line_idx - mark.line_idx);
        inner.line_idx = mark.line_idx;
        inner.wrapped.write_all(erase.as_bytes())?;
        inner.wrapped.flush()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panic while holding the lock leaves the counter consistent with
        // what was handed to the wrapped stream, so poisoning is ignored.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Write for &ProgressWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut inner = self.lock();
        let n = inner.wrapped.write(buf)?;
        inner.line_idx += buf[..n].iter().filter(|&&b| b == b'\n').count();
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.lock().wrapped.flush()
    }
}

/// Owned handle for sinks that need `Write + 'static`, such as the logger.
/// Log lines written while a spinner runs are counted and later erased with
/// the spinner's lines instead of shifting the region it redraws.
pub struct SharedProgress(pub Arc<ProgressWriter>);

impl Write for SharedProgress {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        (&*self.0).write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        (&*self.0).flush()
    }
}
