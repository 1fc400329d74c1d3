/*
 * SPDX-FileCopyrightText: 2026 Coves Contributors
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::appview_db::AppViewDb;
use crate::oauth_store::OAuthStore;

const DEAD_LETTER_RETENTION: Duration = Duration::from_secs(7 * 24 * 3600);

/// Periodic sweeper for expired sessions, stale auth requests, the identity
/// cache, and old dead letter events.
pub struct CleanupWorker {
    db: AppViewDb,
    store: OAuthStore,
    interval: Duration,
}

impl CleanupWorker {
    pub fn new(db: AppViewDb, store: OAuthStore, interval_secs: u64) -> Self {
        Self {
            db,
            store,
            interval: Duration::from_secs(interval_secs.max(1)),
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // First tick fires immediately; skip it so startup stays quiet.
        ticker.tick().await;
        info!("cleanup worker running every {:?}", self.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.sweep(),
                _ = shutdown.changed() => {
                    info!("cleanup worker stopping");
                    return;
                }
            }
        }
    }

    fn sweep(&self) {
        let sessions = self.store.cleanup_expired_sessions();
        let requests = self.store.cleanup_expired_requests();
        let identities = self.db.cleanup_identity_cache();
        let dead_letters = self
            .db
            .cleanup_dead_letters(DEAD_LETTER_RETENTION.as_millis() as i64);
        match (sessions, requests, identities, dead_letters) {
            (Ok(s), Ok(r), Ok(i), Ok(d)) => {
                if s + r + i + d > 0 {
                    info!("cleanup removed {s} sessions, {r} auth requests, {i} cached identities, {d} dead letters");
                } else {
                    debug!("cleanup pass found nothing to remove");
                }
            }
            (s, r, i, d) => {
                for (what, res) in [
                    ("sessions", s),
                    ("auth requests", r),
                    ("identity cache", i),
                    ("dead letters", d),
                ] {
                    if let Err(e) = res {
                        warn!("cleanup of {what} failed: {e}");
                    }
                }
            }
        }
    }
}
