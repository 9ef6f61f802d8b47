//! Background flushing for write-locked working directories.
//!
//! The worker owns its countdowns. The directory talks to it only through
//! a channel, so the two never share mutable counters; the sync client
//! itself is shared behind a mutex, which serializes a background flush
//! with a foreground one.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, select};
use tracing::{debug, error, info, warn};

use super::lock::{LockMessage, LockMessageHandler, check_lock_file};
use crate::settings::{RetryPolicy, SyncSettings};
use crate::sync::{SyncClient, run_until_settled};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkerMessage {
    ResetCountdown,
    Shutdown,
}

enum Event {
    Message(WorkerMessage),
    Tick,
}

/// When the worker wakes and how often it flushes.
#[derive(Debug, Clone, Copy)]
pub(crate) struct FlushSchedule {
    pub tick: Duration,
    /// Ticks per flush
    pub flush_frequency: u32,
    /// Successful flushes per full flush
    pub full_flush_frequency: u32,
    pub retry: RetryPolicy,
}

impl FlushSchedule {
    pub fn from_settings(settings: &SyncSettings) -> Self {
        Self {
            tick: settings.flush_tick(),
            flush_frequency: settings.flush_frequency.max(1),
            full_flush_frequency: settings.full_flush_frequency.max(1),
            retry: settings.sync_retry,
        }
    }
}

/// Everything the worker needs to flush one directory.
pub(crate) struct FlushJob {
    pub client: Arc<Mutex<SyncClient>>,
    pub cache_path: PathBuf,
    pub lock_path: PathBuf,
    pub owner: String,
    pub handler: Arc<dyn LockMessageHandler>,
}

/// Handle to the background flush thread. Stops and joins it on drop.
pub(crate) struct FlushWorker {
    control: Sender<WorkerMessage>,
    thread: Option<JoinHandle<()>>,
}

impl FlushWorker {
    pub fn start(job: FlushJob, schedule: FlushSchedule) -> Result<Self> {
        let (control, messages) = crossbeam_channel::unbounded();
        let lock_path = job.lock_path.clone();
        let thread = thread::Builder::new()
            .name("bundle-flush".to_owned())
            .spawn(move || job.run(schedule, messages))
            .map_err(|e| Error::io(lock_path, e))?;

        Ok(Self {
            control,
            thread: Some(thread),
        })
    }

    /// Restart the flush countdown, e.g. after a foreground flush.
    pub fn reset_countdown(&self) {
        let _ = self.control.send(WorkerMessage::ResetCountdown);
    }

    /// Stop the worker and wait for any flush in progress to finish.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let _ = self.control.send(WorkerMessage::Shutdown);
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            error!("Flush worker panicked");
        }
    }
}

impl Drop for FlushWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl FlushJob {
    fn run(self, schedule: FlushSchedule, messages: Receiver<WorkerMessage>) {
        let ticker = crossbeam_channel::tick(schedule.tick);
        let mut countdown = schedule.flush_frequency;
        let mut full_countdown = schedule.full_flush_frequency;
        debug!(tick = ?schedule.tick, "Flush worker started");

        loop {
            let event = select! {
                recv(messages) -> message => Event::Message(message.unwrap_or(WorkerMessage::Shutdown)),
                recv(ticker) -> _ => Event::Tick,
            };

            match event {
                Event::Message(WorkerMessage::Shutdown) => break,
                Event::Message(WorkerMessage::ResetCountdown) => {
                    countdown = schedule.flush_frequency;
                }
                Event::Tick => {
                    if let Err(e) = check_lock_file(&self.lock_path, &self.owner) {
                        warn!(error = %e, "Write lock lost; stopping background flush");
                        self.handler.handle_message(LockMessage::LockInvalid {
                            path: self.lock_path.clone(),
                            reason: e.to_string(),
                        });
                        break;
                    }

                    countdown -= 1;
                    if countdown > 0 {
                        continue;
                    }
                    countdown = schedule.flush_frequency;

                    let full = full_countdown <= 1;
                    match self.flush(&schedule.retry, full) {
                        Ok(()) if full => {
                            info!("Completed full background flush");
                            full_countdown = schedule.full_flush_frequency;
                        }
                        Ok(()) => {
                            debug!("Completed background flush");
                            full_countdown -= 1;
                        }
                        Err(e) if e.is_transient() || matches!(e, Error::SyncFailed { .. }) => {
                            debug!(error = %e, "Background flush failed; will retry");
                        }
                        Err(e) => {
                            error!(error = %e, "Unexpected background flush failure");
                            self.handler.handle_message(LockMessage::FlushFailed {
                                message: e.to_string(),
                            });
                        }
                    }
                }
            }
        }
        debug!("Flush worker stopped");
    }

    fn flush(&self, retry: &RetryPolicy, full: bool) -> Result<()> {
        let mut client = lock_client(&self.client, &self.lock_path)?;
        publish_changes(&mut client, retry)?;
        if full {
            save_auxiliary_state(&mut client, retry, &self.cache_path)?;
        }
        Ok(())
    }
}

pub(crate) fn lock_client<'a>(
    client: &'a Mutex<SyncClient>,
    path: &std::path::Path,
) -> Result<MutexGuard<'a, SyncClient>> {
    client.lock().map_err(|_| Error::LockFailed {
        path: path.to_path_buf(),
        reason: "sync client mutex poisoned".to_string(),
    })
}

/// Re-stat every file, then publish until no partition has changes left.
pub(crate) fn publish_changes(client: &mut SyncClient, retry: &RetryPolicy) -> Result<()> {
    client.collection().recheck_all_file_timestamps();
    run_until_settled(retry, "sync up", || client.sync_up())
}

/// Publish excluded partitions and persist the file-data cache.
///
/// Excluded partitions are retried by the next full flush, so failing to
/// publish them is only logged.
pub(crate) fn save_auxiliary_state(
    client: &mut SyncClient,
    retry: &RetryPolicy,
    cache_path: &std::path::Path,
) -> Result<()> {
    if let Err(e) = run_until_settled(retry, "save excluded files", || {
        client.save_default_excluded_files()
    }) {
        debug!(error = %e, "Excluded files not published yet");
    }
    client.collection().save_file_data_cache(cache_path)?;
    Ok(())
}
