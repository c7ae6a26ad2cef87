#![allow(dead_code)]

use std::collections::HashSet;
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Result, bail};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use tokio::sync::Notify;

use tigris_imageguard::classifier::{ApiDetectionResult, ImageClassifier, ImageData};
use tigris_imageguard::config::Settings;
use tigris_imageguard::download::Downloader;
use tigris_imageguard::escalation::{DetectionAlert, Enforcer, Notifier, ReviewAlert};
use tigris_imageguard::prefilter::{HashPrefilter, HashStore};
use tigris_imageguard::scanner::Detector;
use tigris_imageguard::hashing::PerceptualHash;
use tigris_imageguard::store::{
    DetectionRecord, GuildConfig, KnownHash, MemoryStore, NewDetection, NewReview, NewSanction, OffenseRecord,
    ReviewItem, ReviewStatus, SanctionRecord, Severity, Store,
};

/* ---------- obrazki ---------- */

pub fn png(img: DynamicImage) -> Vec<u8> {
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
        .unwrap();
    buf
}

/// Deterministyczny obrazek; różne `seed` dają różne hashe.
pub fn sample_png(seed: u32) -> Vec<u8> {
    png(DynamicImage::ImageRgb8(RgbImage::from_fn(64, 64, |x, y| {
        let v = ((x * 7 + y * 13 + seed * 31) % 97) as u8;
        if (x / 8 + y / 8 + seed) % 2 == 0 {
            Rgb([v.saturating_add(150), 40, 40])
        } else {
            Rgb([v, 20, 200])
        }
    })))
}

/* ---------- konfiguracja ---------- */

pub fn settings() -> Settings {
    let mut s = Settings::defaults("test");
    s.database.url = String::new();
    // fake serwery na 127.0.0.1
    s.detection.allowed_hosts = vec![];
    s
}

pub fn detector(store: Arc<dyn Store>, classifier: Arc<dyn ImageClassifier>, settings: &Settings) -> Detector {
    let det = &settings.detection;
    let hashes = HashStore::new(store, det.hash_size, Duration::from_secs(60));
    Detector::new(
        Downloader::with_client(reqwest::Client::new(), det.max_image_bytes(), det.allowed_hosts.clone()),
        HashPrefilter::new(hashes, det.hash_match_threshold),
        classifier,
        det.detection_threshold,
        det.review_threshold,
    )
}

/* ---------- klasyfikator ---------- */

/// Stała odpowiedź + liczniki wywołań i maksymalnej współbieżności.
pub struct FakeClassifier {
    pub confidence: f64,
    pub fail: bool,
    pub delay: Duration,
    pub calls: AtomicUsize,
    pub current: AtomicUsize,
    pub max_seen: AtomicUsize,
    pub order: Mutex<Vec<usize>>,
}

impl FakeClassifier {
    pub fn new(confidence: f64) -> Self {
        Self {
            confidence,
            fail: false,
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            current: AtomicUsize::new(0),
            max_seen: AtomicUsize::new(0),
            order: Mutex::new(Vec::new()),
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new(0.99)
        }
    }

    pub fn with_delay(mut self, d: Duration) -> Self {
        self.delay = d;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ImageClassifier for FakeClassifier {
    async fn classify(&self, image: &ImageData) -> ApiDetectionResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.order.lock().unwrap().push(image.bytes.len());
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_seen.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.current.fetch_sub(1, Ordering::SeqCst);

        if self.fail {
            return ApiDetectionResult::failure("fake", "provider exploded", Duration::ZERO);
        }
        ApiDetectionResult {
            detected: self.confidence >= 0.5,
            confidence: self.confidence,
            provider: "fake".into(),
            labels: vec![],
            processing_time_ms: 1,
            error: None,
        }
    }
}

/* ---------- egzekucja ---------- */

#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Ban { guild_id: u64, user_id: u64 },
    Timeout { guild_id: u64, user_id: u64, until: DateTime<Utc> },
}

#[derive(Default)]
pub struct FakeEnforcer {
    pub guilds: Vec<u64>,
    pub failing: HashSet<u64>,
    pub actions: Mutex<Vec<Action>>,
    pub ban_delay: Duration,
    pub bans_in_flight: AtomicUsize,
    pub max_bans_in_flight: AtomicUsize,
}

impl FakeEnforcer {
    pub fn with_guilds(guilds: &[u64]) -> Self {
        Self {
            guilds: guilds.to_vec(),
            ..Default::default()
        }
    }

    pub fn with_ban_delay(mut self, d: Duration) -> Self {
        self.ban_delay = d;
        self
    }

    pub fn failing_in(mut self, gid: u64) -> Self {
        self.failing.insert(gid);
        self
    }

    pub fn actions(&self) -> Vec<Action> {
        self.actions.lock().unwrap().clone()
    }

    pub fn bans(&self) -> Vec<(u64, u64)> {
        self.actions()
            .into_iter()
            .filter_map(|a| match a {
                Action::Ban { guild_id, user_id } => Some((guild_id, user_id)),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl Enforcer for FakeEnforcer {
    async fn ban(&self, guild_id: u64, user_id: u64, _reason: &str) -> Result<()> {
        let now = self.bans_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_bans_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.ban_delay.is_zero() {
            tokio::time::sleep(self.ban_delay).await;
        }
        self.bans_in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.failing.contains(&guild_id) {
            bail!("missing permissions in {guild_id}");
        }
        self.actions.lock().unwrap().push(Action::Ban { guild_id, user_id });
        Ok(())
    }

    async fn timeout(&self, guild_id: u64, user_id: u64, until: DateTime<Utc>, _reason: &str) -> Result<()> {
        if self.failing.contains(&guild_id) {
            bail!("missing permissions in {guild_id}");
        }
        self.actions
            .lock()
            .unwrap()
            .push(Action::Timeout { guild_id, user_id, until });
        Ok(())
    }

    async fn guilds(&self) -> Result<Vec<u64>> {
        Ok(self.guilds.clone())
    }
}

/* ---------- powiadomienia ---------- */

#[derive(Default)]
pub struct FakeNotifier {
    pub detections: Mutex<Vec<DetectionAlert>>,
    pub reviews: Mutex<Vec<ReviewAlert>>,
}

#[async_trait]
impl Notifier for FakeNotifier {
    async fn detection_alert(&self, alert: &DetectionAlert) -> Result<()> {
        self.detections.lock().unwrap().push(alert.clone());
        Ok(())
    }

    async fn review_alert(&self, alert: &ReviewAlert) -> Result<()> {
        self.reviews.lock().unwrap().push(alert.clone());
        Ok(())
    }
}

/* ---------- magazyn z awariami ---------- */

/// MemoryStore z wstrzykiwanymi awariami: `fail_once("op")` sprawia, że
/// najbliższe wywołanie `op` zwróci błąd bez dotykania stanu.
#[derive(Default)]
pub struct FaultyStore {
    pub inner: MemoryStore,
    fail: Mutex<HashSet<&'static str>>,
    // (wszedł, puść) dla najbliższego active_hashes
    hold_active: Mutex<Option<(Arc<Notify>, Arc<Notify>)>>,
}

impl FaultyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_once(&self, op: &'static str) {
        self.fail.lock().unwrap().insert(op);
    }

    /// Najbliższe `active_hashes` wczyta listę, da znać i poczeka na zwolnienie.
    pub fn hold_next_active_hashes(&self) -> (Arc<Notify>, Arc<Notify>) {
        let pair = (Arc::new(Notify::new()), Arc::new(Notify::new()));
        *self.hold_active.lock().unwrap() = Some(pair.clone());
        pair
    }

    fn check(&self, op: &'static str) -> Result<()> {
        if self.fail.lock().unwrap().remove(op) {
            bail!("db blip in {op}");
        }
        Ok(())
    }
}

#[async_trait]
impl Store for FaultyStore {
    async fn guild_config(&self, guild_id: u64) -> Result<GuildConfig> {
        self.check("guild_config")?;
        self.inner.guild_config(guild_id).await
    }

    async fn upsert_guild_config(&self, cfg: &GuildConfig) -> Result<()> {
        self.check("upsert_guild_config")?;
        self.inner.upsert_guild_config(cfg).await
    }

    async fn offense_record(&self, user_id: u64) -> Result<Option<OffenseRecord>> {
        self.check("offense_record")?;
        self.inner.offense_record(user_id).await
    }

    async fn increment_offense(&self, user_id: u64, detection_id: i64) -> Result<OffenseRecord> {
        self.check("increment_offense")?;
        self.inner.increment_offense(user_id, detection_id).await
    }

    async fn set_globally_banned(&self, user_id: u64, banned: bool) -> Result<()> {
        self.check("set_globally_banned")?;
        self.inner.set_globally_banned(user_id, banned).await
    }

    async fn insert_detection(&self, d: &NewDetection) -> Result<i64> {
        self.check("insert_detection")?;
        self.inner.insert_detection(d).await
    }

    async fn set_detection_action(&self, id: i64, action_taken: &str) -> Result<()> {
        self.check("set_detection_action")?;
        self.inner.set_detection_action(id, action_taken).await
    }

    async fn detection(&self, id: i64) -> Result<Option<DetectionRecord>> {
        self.inner.detection(id).await
    }

    async fn insert_sanction(&self, s: &NewSanction) -> Result<SanctionRecord> {
        self.check("insert_sanction")?;
        self.inner.insert_sanction(s).await
    }

    async fn sanction(&self, id: i64) -> Result<Option<SanctionRecord>> {
        self.inner.sanction(id).await
    }

    async fn sanctions_for_user(&self, user_id: u64) -> Result<Vec<SanctionRecord>> {
        self.inner.sanctions_for_user(user_id).await
    }

    async fn insert_review(&self, r: &NewReview) -> Result<ReviewItem> {
        self.check("insert_review")?;
        self.inner.insert_review(r).await
    }

    async fn review(&self, id: i64) -> Result<Option<ReviewItem>> {
        self.inner.review(id).await
    }

    async fn decide_review(&self, id: i64, status: ReviewStatus, moderator_id: u64) -> Result<bool> {
        self.check("decide_review")?;
        self.inner.decide_review(id, status, moderator_id).await
    }

    async fn resolve_review(&self, id: i64, status: ReviewStatus, moderator_id: u64) -> Result<bool> {
        self.check("resolve_review")?;
        self.inner.resolve_review(id, status, moderator_id).await
    }

    async fn reopen_review(&self, id: i64) -> Result<bool> {
        self.check("reopen_review")?;
        self.inner.reopen_review(id).await
    }

    async fn pending_reviews(&self) -> Result<Vec<ReviewItem>> {
        self.inner.pending_reviews().await
    }

    async fn active_hashes(&self) -> Result<Vec<KnownHash>> {
        self.check("active_hashes")?;
        let list = self.inner.active_hashes().await?;
        let hold = self.hold_active.lock().unwrap().take();
        if let Some((entered, release)) = hold {
            entered.notify_one();
            release.notified().await;
        }
        Ok(list)
    }

    async fn add_known_hash(
        &self,
        hash: &PerceptualHash,
        severity: Severity,
        reason: Option<&str>,
        added_by: Option<u64>,
    ) -> Result<KnownHash> {
        self.check("add_known_hash")?;
        self.inner.add_known_hash(hash, severity, reason, added_by).await
    }

    async fn deactivate_hash(&self, id: i64) -> Result<bool> {
        self.check("deactivate_hash")?;
        self.inner.deactivate_hash(id).await
    }
}
