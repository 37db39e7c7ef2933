//! Periodic sweep that deletes abandoned upload sessions.
//!
//! A session that never reaches its final PUT leaves orphaned chunk rows
//! and, once the GC review queues reclaim the blob bytes they point at,
//! nothing else cleans up the session row itself. `UploadPurger` runs for
//! the lifetime of the process, deleting sessions older than a configured
//! max age on a jittered interval so that concurrent registry instances
//! don't all sweep on the same tick.

use std::time::Duration as StdDuration;

use rand::Rng;

use super::config::UploadPurgeConfig;
use super::errors::Result;
use super::upload_sessions::PgSessionStore;

pub struct UploadPurger {
    sessions: PgSessionStore,
    config: UploadPurgeConfig,
}

impl UploadPurger {
    pub fn new(sessions: PgSessionStore, config: UploadPurgeConfig) -> Self {
        Self { sessions, config }
    }

    /// Runs one purge pass, deleting sessions older than the configured max
    /// age. Returns the number of sessions purged.
    pub async fn run_once(&self) -> Result<u64> {
        self.sessions
            .purge_stale_sessions(self.config.max_age())
            .await
    }

    /// Spawns the sweep loop as a detached background task. A random
    /// startup jitter (bounded by `config.jitter_secs`) delays the first
    /// sweep so that multiple registry instances restarted together don't
    /// all sweep in lockstep; subsequent sweeps run on the fixed interval.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let startup_jitter = if self.config.jitter_secs > 0 {
                rand::thread_rng().gen_range(0..self.config.jitter_secs)
            } else {
                0
            };
            tokio::time::sleep(StdDuration::from_secs(startup_jitter)).await;

            loop {
                match self.run_once().await {
                    Ok(count) if count > 0 => {
                        tracing::info!("purged {count} stale upload sessions");
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!("upload session purge failed: {e:?}"),
                }

                tokio::time::sleep(StdDuration::from_secs(self.config.interval_secs)).await;
            }
        })
    }
}
