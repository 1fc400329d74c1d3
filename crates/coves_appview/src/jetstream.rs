/*
 * SPDX-FileCopyrightText: 2026 Coves Contributors
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use futures_util::{SinkExt, StreamExt};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::appview_db::AppViewDb;
use crate::comment_consumer::CommentConsumer;
use crate::community_consumer::CommunityConsumer;
use crate::config::ConsumerFailurePolicy;
use crate::error::AppResult;
use crate::post_consumer::PostConsumer;
use crate::user_consumer::UserConsumer;
use crate::vote_consumer::VoteConsumer;
use coves_protocol::{
    JetstreamEvent, COLLECTION_ACTOR_PROFILE, COLLECTION_COMMENT, COLLECTION_COMMUNITY_BLOCK,
    COLLECTION_COMMUNITY_PROFILE, COLLECTION_POST, COLLECTION_SUBSCRIPTION, COLLECTION_VOTE,
};

const QUEUE_CAPACITY: usize = 256;
const READ_DEADLINE: Duration = Duration::from_secs(30);
const PING_INTERVAL: Duration = Duration::from_secs(20);
const MAX_CONSECUTIVE_TIMEOUTS: u32 = 3;
const BACKOFF_MIN: Duration = Duration::from_secs(1);
const BACKOFF_MAX: Duration = Duration::from_secs(60);

pub const WANTED_COLLECTIONS: &[&str] = &[
    COLLECTION_COMMUNITY_PROFILE,
    COLLECTION_SUBSCRIPTION,
    COLLECTION_COMMUNITY_BLOCK,
    COLLECTION_POST,
    COLLECTION_COMMENT,
    COLLECTION_VOTE,
    COLLECTION_ACTOR_PROFILE,
];

/// Consumer groups. Each group gets its own bounded queue and worker, so
/// events stay ordered per (repo, collection) while groups proceed
/// independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Group {
    Community,
    Post,
    Comment,
    Vote,
    User,
}

pub fn group_for(event: &JetstreamEvent) -> Option<Group> {
    match event.kind.as_str() {
        "identity" | "account" => Some(Group::User),
        "commit" => {
            let commit = event.commit.as_ref()?;
            match commit.collection.as_str() {
                COLLECTION_COMMUNITY_PROFILE => Some(Group::Community),
                COLLECTION_POST => Some(Group::Post),
                COLLECTION_COMMENT => Some(Group::Comment),
                COLLECTION_VOTE => Some(Group::Vote),
                COLLECTION_SUBSCRIPTION | COLLECTION_COMMUNITY_BLOCK | COLLECTION_ACTOR_PROFILE => {
                    Some(Group::User)
                }
                _ => None,
            }
        }
        _ => None,
    }
}

pub fn subscribe_url(base: &str, cursor: Option<i64>) -> String {
    let mut url = format!("{}?", base.trim_end_matches('/'));
    for (i, collection) in WANTED_COLLECTIONS.iter().enumerate() {
        if i > 0 {
            url.push('&');
        }
        url.push_str("wantedCollections=");
        url.push_str(collection);
    }
    if let Some(cursor) = cursor {
        url.push_str(&format!("&cursor={cursor}"));
    }
    url
}

/// The consumer set behind the queues. Applies one event and decides what
/// to do with a failure per the configured policy.
#[derive(Clone)]
struct ConsumerSet {
    db: AppViewDb,
    community: CommunityConsumer,
    post: PostConsumer,
    comment: CommentConsumer,
    vote: VoteConsumer,
    user: UserConsumer,
    policy: ConsumerFailurePolicy,
}

impl ConsumerSet {
    fn apply(&self, event: &JetstreamEvent) -> AppResult<()> {
        match event.kind.as_str() {
            "identity" => self.user.handle_identity(event),
            "account" => self.user.handle_account(event),
            "commit" => {
                let Some(commit) = event.commit.as_ref() else {
                    return Ok(());
                };
                match commit.collection.as_str() {
                    COLLECTION_COMMUNITY_PROFILE => self.community.handle(event, commit),
                    COLLECTION_POST => self.post.handle(event, commit),
                    COLLECTION_COMMENT => self.comment.handle(event, commit),
                    COLLECTION_VOTE => self.vote.handle(event, commit),
                    COLLECTION_SUBSCRIPTION
                    | COLLECTION_COMMUNITY_BLOCK
                    | COLLECTION_ACTOR_PROFILE => self.user.handle_commit(event, commit),
                    _ => Ok(()),
                }
            }
            _ => Ok(()),
        }
    }
}

/// Tracks dispatched events across the group queues so the persisted
/// cursor never passes an event that has not been applied. Completing an
/// event yields the safe cursor: one below the oldest still-in-flight
/// event, or the newest dispatched event once nothing is in flight. An
/// event rejected under fail-fast is never completed, so the cursor stays
/// pinned below it and the reconnect replays it.
#[derive(Default)]
struct CursorTracker {
    inner: Mutex<TrackerInner>,
}

#[derive(Default)]
struct TrackerInner {
    in_flight: BTreeMap<i64, u32>,
    newest: i64,
}

impl CursorTracker {
    fn begin(&self, time_us: i64) {
        let mut inner = self.lock();
        *inner.in_flight.entry(time_us).or_insert(0) += 1;
        inner.newest = inner.newest.max(time_us);
    }

    fn complete(&self, time_us: i64) -> i64 {
        let mut inner = self.lock();
        if let Some(count) = inner.in_flight.get_mut(&time_us) {
            *count -= 1;
            if *count == 0 {
                inner.in_flight.remove(&time_us);
            }
        }
        match inner.in_flight.keys().next() {
            Some(&oldest) => oldest - 1,
            None => inner.newest,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TrackerInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn persist_watermark(db: &AppViewDb, watermark: i64) {
    if watermark <= 0 {
        return;
    }
    if let Err(e) = db.set_cursor(watermark) {
        warn!("cursor persist failed: {e}");
    }
}

/// One connection's worth of queues and workers. Dropped (sender side) on
/// disconnect, which lets the workers drain and exit.
struct Dispatcher {
    senders: Vec<(Group, mpsc::Sender<JetstreamEvent>)>,
    tracker: Arc<CursorTracker>,
}

impl Dispatcher {
    fn spawn(consumers: ConsumerSet, failure_tx: mpsc::Sender<()>) -> Self {
        let tracker = Arc::new(CursorTracker::default());
        let groups = [
            Group::Community,
            Group::Post,
            Group::Comment,
            Group::Vote,
            Group::User,
        ];
        let mut senders = Vec::with_capacity(groups.len());
        for group in groups {
            let (tx, mut rx) = mpsc::channel::<JetstreamEvent>(QUEUE_CAPACITY);
            let consumers = consumers.clone();
            let failure_tx = failure_tx.clone();
            let tracker = tracker.clone();
            tokio::spawn(async move {
                while let Some(event) = rx.recv().await {
                    match consumers.apply(&event) {
                        Ok(()) => {
                            persist_watermark(&consumers.db, tracker.complete(event.time_us));
                        }
                        Err(e) => match consumers.policy {
                            ConsumerFailurePolicy::FailFast => {
                                warn!("{group:?} consumer rejected event from {}: {e}", event.did);
                                // The failed event stays in flight, keeping
                                // the watermark below its time_us while the
                                // other groups finish draining.
                                let _ = failure_tx.try_send(());
                                break;
                            }
                            ConsumerFailurePolicy::DeadLetter => {
                                warn!(
                                    "{group:?} consumer dead-lettered event from {}: {e}",
                                    event.did
                                );
                                record_dead_letter(&consumers.db, &event, &e);
                                persist_watermark(&consumers.db, tracker.complete(event.time_us));
                            }
                        },
                    }
                }
            });
            senders.push((group, tx));
        }
        Self { senders, tracker }
    }

    async fn dispatch(&self, event: JetstreamEvent) -> bool {
        let Some(group) = group_for(&event) else {
            return true;
        };
        for (g, tx) in &self.senders {
            if *g == group {
                self.tracker.begin(event.time_us);
                // A full queue blocks here; TCP backpressure does the rest.
                return tx.send(event).await.is_ok();
            }
        }
        true
    }
}

fn record_dead_letter(
    db: &AppViewDb,
    event: &JetstreamEvent,
    error: &crate::error::AppError,
) {
    let (collection, rkey, operation) = match event.commit.as_ref() {
        Some(c) => (c.collection.clone(), c.rkey.clone(), c.operation.clone()),
        None => (String::new(), String::new(), event.kind.clone()),
    };
    let json = serde_json::to_string(event).unwrap_or_default();
    if let Err(e) = db.record_dead_letter(
        &event.did,
        &collection,
        &rkey,
        &operation,
        &json,
        &error.to_string(),
    ) {
        warn!("dead letter write failed: {e}");
    }
}

/// Long-running firehose subscriber. Resumes from the persisted cursor,
/// reconnects with capped jittered backoff, and forces a reconnect after a
/// few consecutive read timeouts.
pub struct JetstreamSubscriber {
    db: AppViewDb,
    url: String,
    policy: ConsumerFailurePolicy,
    verify_hosted_by: bool,
}

impl JetstreamSubscriber {
    pub fn new(
        db: AppViewDb,
        url: String,
        policy: ConsumerFailurePolicy,
        verify_hosted_by: bool,
    ) -> Self {
        Self {
            db,
            url,
            policy,
            verify_hosted_by,
        }
    }

    fn consumers(&self) -> ConsumerSet {
        ConsumerSet {
            db: self.db.clone(),
            community: CommunityConsumer::new(self.db.clone(), self.verify_hosted_by),
            post: PostConsumer::new(self.db.clone()),
            comment: CommentConsumer::new(self.db.clone()),
            vote: VoteConsumer::new(self.db.clone()),
            user: UserConsumer::new(self.db.clone()),
            policy: self.policy,
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut backoff = BACKOFF_MIN;
        loop {
            if *shutdown.borrow() {
                return;
            }
            match self.run_connection(&mut shutdown).await {
                Ok(()) => return,
                Err(e) => {
                    warn!("jetstream connection ended: {e:#}");
                }
            }
            let jitter =
                Duration::from_millis(rand::Rng::gen_range(&mut rand::thread_rng(), 0..500u64));
            tokio::select! {
                _ = tokio::time::sleep(backoff + jitter) => {}
                _ = shutdown.changed() => return,
            }
            backoff = (backoff * 2).min(BACKOFF_MAX);
        }
    }

    async fn run_connection(&self, shutdown: &mut watch::Receiver<bool>) -> anyhow::Result<()> {
        let cursor = self.db.get_cursor()?;
        let url = subscribe_url(&self.url, cursor);
        info!("connecting to jetstream (cursor={cursor:?})");
        let (stream, _) = connect_async(&url).await?;
        let (mut write, mut read) = stream.split();

        let (failure_tx, mut failure_rx) = mpsc::channel::<()>(1);
        let dispatcher = Dispatcher::spawn(self.consumers(), failure_tx);

        let mut ping = tokio::time::interval(PING_INTERVAL);
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut timeouts: u32 = 0;

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(());
                }
                _ = failure_rx.recv() => {
                    anyhow::bail!("consumer failure, reconnecting without advancing cursor");
                }
                _ = ping.tick() => {
                    write.send(Message::Ping(Vec::new())).await?;
                }
                msg = tokio::time::timeout(READ_DEADLINE, read.next()) => {
                    let msg = match msg {
                        Err(_) => {
                            timeouts += 1;
                            if timeouts >= MAX_CONSECUTIVE_TIMEOUTS {
                                anyhow::bail!("no frames for {timeouts} read deadlines");
                            }
                            continue;
                        }
                        Ok(None) => anyhow::bail!("jetstream closed the connection"),
                        Ok(Some(msg)) => msg?,
                    };
                    timeouts = 0;
                    match msg {
                        Message::Text(text) => {
                            let event: JetstreamEvent = match serde_json::from_str(&text) {
                                Ok(event) => event,
                                Err(e) => {
                                    debug!("skipping unparseable frame: {e}");
                                    continue;
                                }
                            };
                            if !dispatcher.dispatch(event).await {
                                anyhow::bail!("consumer worker exited");
                            }
                        }
                        Message::Ping(payload) => {
                            write.send(Message::Pong(payload)).await?;
                        }
                        Message::Close(_) => anyhow::bail!("jetstream sent close"),
                        _ => {}
                    }
                }
            }
        }
    }
}
