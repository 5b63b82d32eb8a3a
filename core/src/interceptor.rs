//! Transparent proxy over the worker's terminal. The child is spawned with
//! piped standard streams; stdout and stderr are copied byte-for-byte to the
//! host terminal while the same bytes accumulate in the analysis buffer.
//! Stdin writes (host keystrokes and synthesized injections) go through one
//! serialized writer queue, so injection lines never interleave with other
//! writes.

use std::process::Stdio;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;

use crate::config::Config;
use crate::error::ConductorErr;
use crate::error::Result;
use crate::util::lock;

/// Grace period between the graceful termination request and the forced
/// kill.
const KILL_ESCALATION: Duration = Duration::from_secs(5);

const READ_BUF_SIZE: usize = 8192;

#[derive(Debug, Clone, PartialEq)]
pub enum InterceptorEvent {
    /// Pass-through telemetry: one event per chunk read from the child.
    Output(String),
    /// The analysis buffer was released, by size, timer, or child exit.
    Flush(String),
    Exit {
        code: i32,
        signal: Option<i32>,
    },
    Error(String),
}

#[derive(Debug)]
pub struct Interceptor {
    stdin_tx: mpsc::UnboundedSender<Vec<u8>>,
    buffer: Arc<Mutex<String>>,
    events_tx: mpsc::UnboundedSender<InterceptorEvent>,
    stop_tx: Mutex<Option<oneshot::Sender<()>>>,
}

impl Interceptor {
    /// Spawn the wrapped command with all three standard streams piped and
    /// an environment hint requesting colored output. Fails only when the
    /// child cannot be started.
    pub fn spawn(
        config: &Config,
        events_tx: mpsc::UnboundedSender<InterceptorEvent>,
        forward_host_stdin: bool,
    ) -> Result<Self> {
        let mut command = Command::new(&config.wrapped_command);
        command
            .args(&config.wrapped_args)
            .env("FORCE_COLOR", "1")
            .env("CLICOLOR_FORCE", "1")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = command.spawn().map_err(|source| ConductorErr::ChildSpawnFailed {
            command: config.wrapped_command.clone(),
            source,
        })?;

        let child_stdin = child.stdin.take().ok_or(ConductorErr::Spawn)?;
        let child_stdout = child.stdout.take().ok_or(ConductorErr::Spawn)?;
        let child_stderr = child.stderr.take().ok_or(ConductorErr::Spawn)?;

        let buffer = Arc::new(Mutex::new(String::new()));
        let (stdin_tx, mut stdin_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let (done_tx, mut done_rx) = watch::channel(false);
        let max_buffer_size = config.max_buffer_size;

        // Writer task: owns child stdin and applies queued writes in order.
        tokio::spawn(async move {
            let mut child_stdin = child_stdin;
            while let Some(bytes) = stdin_rx.recv().await {
                if child_stdin.write_all(&bytes).await.is_err() {
                    break;
                }
                let _ = child_stdin.flush().await;
            }
        });

        // Output pumps: child stdout/stderr to the host's matching stream,
        // plus the shared analysis buffer.
        let stdout_handle = tokio::spawn(pump_output(
            child_stdout,
            tokio::io::stdout(),
            Arc::clone(&buffer),
            events_tx.clone(),
            max_buffer_size,
        ));
        let stderr_handle = tokio::spawn(pump_output(
            child_stderr,
            tokio::io::stderr(),
            Arc::clone(&buffer),
            events_tx.clone(),
            max_buffer_size,
        ));

        if forward_host_stdin {
            let stdin_tx = stdin_tx.clone();
            tokio::spawn(async move {
                let mut host_stdin = tokio::io::stdin();
                let mut buf = [0u8; READ_BUF_SIZE];
                loop {
                    match host_stdin.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stdin_tx.send(buf[..n].to_vec()).is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }

        // Periodic flush of the analysis buffer.
        tokio::spawn({
            let buffer = Arc::clone(&buffer);
            let events_tx = events_tx.clone();
            let interval = Duration::from_millis(config.buffer_flush_interval_ms);
            async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => flush_shared(&buffer, &events_tx),
                        _ = done_rx.changed() => break,
                    }
                }
            }
        });

        // Wait task: owns the child handle, drives graceful termination and
        // emits the final flush + exit event once the pumps have drained.
        tokio::spawn({
            let buffer = Arc::clone(&buffer);
            let events_tx = events_tx.clone();
            let child_id = child.id();
            async move {
                let natural_exit = tokio::select! {
                    status = child.wait() => Some(status),
                    _ = &mut stop_rx => None,
                };
                let status = match natural_exit {
                    Some(status) => status,
                    None => {
                        request_termination(child_id);
                        match tokio::time::timeout(KILL_ESCALATION, child.wait()).await {
                            Ok(status) => status,
                            Err(_) => {
                                let _ = child.start_kill();
                                child.wait().await
                            }
                        }
                    }
                };
                // The pumps finish once the pipes hit EOF; waiting for them
                // keeps the final flush behind the last output chunk.
                let _ = stdout_handle.await;
                let _ = stderr_handle.await;
                flush_shared(&buffer, &events_tx);
                let _ = done_tx.send(true);

                match status {
                    Ok(status) => {
                        let signal = exit_signal(&status);
                        let code = status
                            .code()
                            .unwrap_or_else(|| signal.map(|s| 128 + s).unwrap_or(-1));
                        let _ = events_tx.send(InterceptorEvent::Exit { code, signal });
                    }
                    Err(e) => {
                        let _ = events_tx.send(InterceptorEvent::Error(format!(
                            "failed to reap child: {e}"
                        )));
                        let _ = events_tx.send(InterceptorEvent::Exit {
                            code: -1,
                            signal: None,
                        });
                    }
                }
            }
        });

        Ok(Self {
            stdin_tx,
            buffer,
            events_tx,
            stop_tx: Mutex::new(Some(stop_tx)),
        })
    }

    /// Write arbitrary bytes to the child's stdin. Fails once stdin is no
    /// longer writable.
    pub fn inject(&self, bytes: impl Into<Vec<u8>>) -> Result<()> {
        self.stdin_tx
            .send(bytes.into())
            .map_err(|_| ConductorErr::StdinUnwritable)
    }

    /// `inject` with a trailing newline.
    pub fn inject_line(&self, text: &str) -> Result<()> {
        let mut bytes = text.as_bytes().to_vec();
        bytes.push(b'\n');
        self.inject(bytes)
    }

    /// Force-release the analysis buffer regardless of size or timer.
    pub fn flush_now(&self) {
        flush_shared(&self.buffer, &self.events_tx);
    }

    /// Request graceful termination; the wait task escalates to a forced
    /// kill after 5 seconds. Idempotent.
    pub fn stop(&self) {
        if let Some(tx) = lock(&self.stop_tx).take() {
            let _ = tx.send(());
        }
    }

    #[cfg(test)]
    pub(crate) fn buffered_len(&self) -> usize {
        lock(&self.buffer).len()
    }
}

fn request_termination(child_id: Option<u32>) {
    #[cfg(unix)]
    if let Some(pid) = child_id {
        // SAFETY: plain signal send to a pid we own.
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
    }
    #[cfg(not(unix))]
    {
        let _ = child_id;
    }
}

fn exit_signal(status: &std::process::ExitStatus) -> Option<i32> {
    #[cfg(unix)]
    {
        std::os::unix::process::ExitStatusExt::signal(status)
    }
    #[cfg(not(unix))]
    {
        let _ = status;
        None
    }
}

async fn pump_output<R, W>(
    mut reader: R,
    mut host: W,
    buffer: Arc<Mutex<String>>,
    events_tx: mpsc::UnboundedSender<InterceptorEvent>,
    max_buffer_size: usize,
) where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = [0u8; READ_BUF_SIZE];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                // Pass-through first: the worker's terminal must stay live
                // even if nobody consumes our events.
                if host.write_all(&buf[..n]).await.is_ok() {
                    let _ = host.flush().await;
                }
                let text = String::from_utf8_lossy(&buf[..n]).to_string();
                let _ = events_tx.send(InterceptorEvent::Output(text.clone()));
                let flushed = {
                    let mut b = lock(&buffer);
                    b.push_str(&text);
                    (b.len() >= max_buffer_size).then(|| std::mem::take(&mut *b))
                };
                if let Some(text) = flushed {
                    let _ = events_tx.send(InterceptorEvent::Flush(text));
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(_) => break,
        }
    }
}

fn flush_shared(buffer: &Mutex<String>, events_tx: &mpsc::UnboundedSender<InterceptorEvent>) {
    let text = {
        let mut b = lock(buffer);
        if b.is_empty() {
            return;
        }
        std::mem::take(&mut *b)
    };
    let _ = events_tx.send(InterceptorEvent::Flush(text));
}
