//! Debounced, coalescing background writes.
//!
//! `schedule` never blocks. The writer task keeps only the newest payload and
//! waits until no new payload has arrived for the debounce window before
//! writing it. `flush` cuts the window short, for shutdown. Failed writes are
//! retried with exponential backoff and then dropped with an error log;
//! callers never see write failures.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AutoSaveConfig {
    #[serde(with = "millis")]
    pub debounce: Duration,
    pub max_attempts: u32,
    #[serde(with = "millis")]
    pub base_backoff: Duration,
}

impl Default for AutoSaveConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_secs(1),
            max_attempts: 3,
            base_backoff: Duration::from_millis(500),
        }
    }
}

mod millis {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

/// Delay before retry number `attempt` (1-based): base, 2×base, 4×base, ...
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(1u32 << attempt.saturating_sub(1).min(16))
}

/// Run `write` until it succeeds or `max_attempts` is reached.
/// Returns whether the payload was written.
pub async fn write_with_retry<T, F, Fut, E>(name: &str, config: &AutoSaveConfig, payload: &T, write: &F) -> bool
where
    T: Clone,
    F: Fn(T) -> Fut,
    Fut: Future<Output = Result<(), E>>,
    E: Display,
{
    let attempts = config.max_attempts.max(1);
    for attempt in 1..=attempts {
        match write(payload.clone()).await {
            Ok(()) => {
                debug!("{name}: saved (attempt {attempt})");
                return true;
            }
            Err(e) if attempt < attempts => {
                let delay = backoff_delay(config.base_backoff, attempt);
                warn!("{name}: save failed ({e}), retrying in {delay:?}");
                sleep(delay).await;
            }
            Err(e) => error!("{name}: save failed after {attempts} attempts: {e}"),
        }
    }
    false
}

enum Message<T> {
    Save(T),
    /// Write what is pending now, then answer
    Flush(oneshot::Sender<()>),
}

#[derive(Debug)]
pub struct AutoSaver<T> {
    tx: mpsc::UnboundedSender<Message<T>>,
}

impl<T> Clone for AutoSaver<T> {
    fn clone(&self) -> Self {
        Self { tx: self.tx.clone() }
    }
}

impl<T: Clone + Send + Sync + 'static> AutoSaver<T> {
    /// Start the writer task. It ends, after a last write of any pending
    /// payload, once every `AutoSaver` handle is dropped.
    pub fn spawn<F, Fut, E>(name: &'static str, config: AutoSaveConfig, write: F) -> (Self, JoinHandle<()>)
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send,
        E: Display + Send,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<Message<T>>();

        let task = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let mut latest = match message {
                    Message::Save(payload) => payload,
                    Message::Flush(done) => {
                        let _ = done.send(());
                        continue;
                    }
                };
                let mut waiting = Vec::new();
                // every new payload restarts the window
                loop {
                    tokio::select! {
                        _ = sleep(config.debounce) => break,
                        next = rx.recv() => match next {
                            Some(Message::Save(payload)) => latest = payload,
                            Some(Message::Flush(done)) => {
                                waiting.push(done);
                                break;
                            }
                            None => break,
                        },
                    }
                }
                write_with_retry(name, &config, &latest, &write).await;
                for done in waiting {
                    let _ = done.send(());
                }
            }
            debug!("{name}: writer stopped");
        });

        (Self { tx }, task)
    }

    pub fn schedule(&self, payload: T) {
        if self.tx.send(Message::Save(payload)).is_err() {
            error!("autosave writer is gone, payload dropped");
        }
    }

    /// Skip the rest of the debounce window and wait until the pending
    /// payload, if any, has been written (or given up on).
    pub async fn flush(&self) {
        let (done, written) = oneshot::channel();
        if self.tx.send(Message::Flush(done)).is_ok() {
            let _ = written.await;
        }
    }
}
