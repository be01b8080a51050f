//! Out-of-process trigger for `interactive` alarms.
//!
//! The listener binds a TCP port on all interfaces and publishes it in a
//! small JSON file, `<name>.<pid>`:
//!
//! ```text
//! {"port" : "40123"}
//! ```
//!
//! A controller connects and sends a single byte. `'1'` raises the
//! signal, which the next armed interactive alarm consumes.

use std::{
    io::{self, Read as _},
    net::{TcpListener, TcpStream},
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::Duration,
};

const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// The interactive controller's listening side.
pub struct InteractiveListener {
    path: PathBuf,
    port: u16,
    signal: Arc<AtomicBool>,
    exiting: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl InteractiveListener {
    /// Binds the listener and writes the port file `<name>.<pid>`.
    pub fn bind(name: &Path) -> io::Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", 0))?;
        listener.set_nonblocking(true)?;
        let port = listener.local_addr()?.port();

        let mut file_name = name.as_os_str().to_owned();
        file_name.push(format!(".{}", std::process::id()));
        let path = PathBuf::from(file_name);

        std::fs::write(&path, format!("{{\"port\" : \"{port}\"}}"))?;
        tracing::info!(port, path = %path.display(), "interactive listener ready");

        let signal = Arc::new(AtomicBool::new(false));
        let exiting = Arc::new(AtomicBool::new(false));

        let thread = {
            let signal = signal.clone();
            let exiting = exiting.clone();

            thread::Builder::new()
                .name("instlib-interactive".into())
                .spawn(move || serve(listener, &signal, &exiting))?
        };

        Ok(Self {
            path,
            port,
            signal,
            exiting,
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Returns the bound port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Returns the port file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns `true` if a signal is waiting, without consuming it.
    pub fn signal_pending(&self) -> bool {
        self.signal.load(Ordering::Acquire)
    }

    /// Consumes a pending signal. Returns `true` for exactly one caller
    /// per received signal.
    pub fn check_clear_signal(&self) -> bool {
        self.signal
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Stops the listener thread and removes the port file.
    pub fn close(&self) {
        if self.exiting.swap(true, Ordering::AcqRel) {
            return;
        }

        let thread = self
            .thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(thread) = thread
            && thread.join().is_err()
        {
            tracing::warn!("interactive listener thread panicked");
        }

        if let Err(err) = std::fs::remove_file(&self.path) {
            tracing::warn!(%err, path = %self.path.display(), "failed to remove port file");
        }

        tracing::info!(port = self.port, "interactive listener closed");
    }
}

impl Drop for InteractiveListener {
    fn drop(&mut self) {
        self.close();
    }
}

fn serve(listener: TcpListener, signal: &AtomicBool, exiting: &AtomicBool) {
    while !exiting.load(Ordering::Acquire) {
        match listener.accept() {
            Ok((stream, peer)) => {
                tracing::debug!(%peer, "interactive connection");
                if let Err(err) = read_signal(stream, signal) {
                    tracing::warn!(%err, "interactive session failed");
                }
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => thread::sleep(POLL_INTERVAL),
            Err(err) => {
                tracing::warn!(%err, "interactive accept failed");
                thread::sleep(POLL_INTERVAL);
            }
        }
    }
}

fn read_signal(mut stream: TcpStream, signal: &AtomicBool) -> io::Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(POLL_INTERVAL))?;

    let mut buffer = [0u8; 1];
    if stream.read(&mut buffer)? == 1 && buffer[0] == b'1' {
        signal.store(true, Ordering::Release);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::{io::Write as _, time::Instant};

    use super::*;

    fn send(port: u16, byte: u8) {
        let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
        stream.write_all(&[byte]).unwrap();
    }

    fn wait_pending(listener: &InteractiveListener) -> bool {
        let start = Instant::now();
        while start.elapsed() < Duration::from_secs(5) {
            if listener.signal_pending() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn signal_is_consumed_once() {
        let base = std::env::temp_dir().join(format!("instlib-listener-{}", line!()));
        let listener = InteractiveListener::bind(&base).unwrap();

        let contents = std::fs::read_to_string(listener.path()).unwrap();
        assert_eq!(contents, format!("{{\"port\" : \"{}\"}}", listener.port()));

        assert!(!listener.check_clear_signal());

        send(listener.port(), b'0');
        send(listener.port(), b'1');
        assert!(wait_pending(&listener));
        assert!(listener.check_clear_signal());
        assert!(!listener.check_clear_signal());

        let path = listener.path().to_owned();
        listener.close();
        assert!(!path.exists());
    }
}
