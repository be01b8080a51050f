use std::{
    io,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
        mpsc::{self, RecvTimeoutError, Sender},
    },
    thread,
    time::Duration,
};

/// A one-shot deadline started by arming.
///
/// A background thread waits until [`arm`] is called, then waits out the
/// duration and raises the expiry flag. Dropping the timer cancels it.
///
/// [`arm`]: Self::arm
pub struct Timeout {
    duration: Duration,
    armed: AtomicBool,
    sender: Mutex<Option<Sender<()>>>,
    expired: Arc<AtomicBool>,
}

impl Timeout {
    /// Spawns the timer thread.
    pub fn spawn(duration: Duration) -> io::Result<Self> {
        let (sender, receiver) = mpsc::channel::<()>();
        let expired = Arc::new(AtomicBool::new(false));

        let flag = expired.clone();
        thread::Builder::new()
            .name("instlib-timeout".into())
            .spawn(move || {
                if receiver.recv().is_err() {
                    return;
                }

                match receiver.recv_timeout(duration) {
                    Err(RecvTimeoutError::Timeout) => {
                        tracing::debug!(?duration, "timeout expired");
                        flag.store(true, Ordering::Release);
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                        tracing::trace!("timeout cancelled");
                    }
                }
            })?;

        Ok(Self {
            duration,
            armed: AtomicBool::new(false),
            sender: Mutex::new(Some(sender)),
            expired,
        })
    }

    /// Returns the configured duration.
    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Starts the countdown. Only the first call has an effect.
    pub fn arm(&self) {
        if self.armed.swap(true, Ordering::AcqRel) {
            return;
        }

        if let Some(sender) = &*self.sender.lock().unwrap_or_else(PoisonError::into_inner) {
            let _ = sender.send(());
        }
    }

    /// Stops the timer without expiring it.
    pub fn cancel(&self) {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    /// Returns `true` once the deadline has passed.
    pub fn expired(&self) -> bool {
        self.expired.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;

    fn wait_for(timeout: &Timeout, limit: Duration) -> bool {
        let start = Instant::now();
        while start.elapsed() < limit {
            if timeout.expired() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn expires_only_after_arming() {
        let timeout = Timeout::spawn(Duration::from_millis(20)).unwrap();
        assert!(!wait_for(&timeout, Duration::from_millis(100)));

        timeout.arm();
        timeout.arm();
        assert!(wait_for(&timeout, Duration::from_secs(5)));
    }

    #[test]
    fn cancel_prevents_expiry() {
        let timeout = Timeout::spawn(Duration::from_millis(50)).unwrap();
        timeout.arm();
        timeout.cancel();
        assert!(!wait_for(&timeout, Duration::from_millis(200)));
    }
}
