use std::{
    fmt,
    fs::File,
    io::{self, BufWriter, Write as _},
    path::Path,
    sync::{
        Mutex, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
};

use instlib_core::{MAX_THREADS, ThreadId};

/// The controller event log.
///
/// One line per dispatched event, plus a per-thread instruction count
/// maintained only while the log is enabled.
pub(crate) struct EventLog {
    out: Mutex<BufWriter<File>>,
    icount: Box<[AtomicU64]>,
}

impl EventLog {
    pub fn create(path: &Path) -> io::Result<Self> {
        Ok(Self {
            out: Mutex::new(BufWriter::new(File::create(path)?)),
            icount: (0..MAX_THREADS).map(|_| AtomicU64::new(0)).collect(),
        })
    }

    pub fn add_instructions(&self, tid: ThreadId, count: u64) {
        self.icount[tid.index()].fetch_add(count, Ordering::Relaxed);
    }

    pub fn icount(&self, tid: ThreadId) -> u64 {
        self.icount[tid.index()].load(Ordering::Relaxed)
    }

    pub fn line(&self, args: fmt::Arguments<'_>) {
        let mut out = self.out.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(err) = writeln!(out, "{args}") {
            tracing::warn!(%err, "failed to write controller log");
        }
    }

    pub fn flush(&self) {
        let mut out = self.out.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(err) = out.flush() {
            tracing::warn!(%err, "failed to flush controller log");
        }
    }
}

impl Drop for EventLog {
    fn drop(&mut self) {
        self.flush();
    }
}
