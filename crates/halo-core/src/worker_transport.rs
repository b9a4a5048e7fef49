use crate::worker_protocol::{HostMessage, WorkerMessage};
use parking_lot::Mutex;
use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::Duration;

/// Host-side handle for pushing messages into a worker's stdin. Shared
/// between the manager (shutdown) and the pages relay.
pub struct WorkerSender {
    stdin: Mutex<Option<ChildStdin>>,
}

impl WorkerSender {
    pub fn send(&self, message: &HostMessage) -> Result<(), String> {
        let payload = serde_json::to_string(message)
            .map_err(|err| format!("serialize host message failed: {err}"))?;

        let mut guard = self.stdin.lock();
        let Some(stdin) = guard.as_mut() else {
            return Err("worker stdin is closed".to_string());
        };
        stdin
            .write_all(payload.as_bytes())
            .and_then(|()| stdin.write_all(b"\n"))
            .and_then(|()| stdin.flush())
            .map_err(|err| format!("write worker stdin failed: {err}"))
    }

    /// Drop the stdin handle; the worker observes EOF, which doubles as a
    /// shutdown signal.
    pub fn close(&self) {
        self.stdin.lock().take();
    }
}

impl std::fmt::Debug for WorkerSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerSender").finish_non_exhaustive()
    }
}

/// Host-side consumer of a worker's stdout, fed by a dedicated reader
/// thread. Owned exclusively by the worker's monitor thread.
pub struct WorkerReceiver {
    rx: Receiver<Result<WorkerMessage, String>>,
}

impl WorkerReceiver {
    pub fn receive(&self, timeout: Duration) -> Result<Option<WorkerMessage>, String> {
        match self.rx.recv_timeout(timeout) {
            Ok(Ok(message)) => Ok(Some(message)),
            Ok(Err(err)) => Err(err),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => {
                Err("worker stdout channel disconnected".to_string())
            }
        }
    }
}

/// Take the spawned worker's piped stdio and split it into the host-side
/// halves.
pub fn split_child(child: &mut Child) -> Result<(WorkerSender, WorkerReceiver), String> {
    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| "worker stdin is not piped".to_string())?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| "worker stdout is not piped".to_string())?;

    let rx = spawn_reader_thread(stdout);
    Ok((
        WorkerSender {
            stdin: Mutex::new(Some(stdin)),
        },
        WorkerReceiver { rx },
    ))
}

fn spawn_reader_thread(
    stdout: impl std::io::Read + Send + 'static,
) -> Receiver<Result<WorkerMessage, String>> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let reader = BufReader::new(stdout);
        for line in reader.lines() {
            let line = match line {
                Ok(line) => line,
                Err(err) => {
                    let _ = tx.send(Err(format!("read worker stdout failed: {err}")));
                    return;
                }
            };

            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            let parsed = serde_json::from_str::<WorkerMessage>(trimmed)
                .map_err(|err| format!("invalid worker message: {err}"));
            let _ = tx.send(parsed);
        }
    });
    rx
}
