//! Pre-filtr hashy percepcyjnych + zarządzanie blocklistą.
//!
//! Zasada "pierwszy wygrywa": iterujemy aktywne wpisy w kolejności magazynu
//! (rosnące id) i zwracamy pierwszy z podobieństwem >= progu. Nie szukamy
//! najlepszego dopasowania, koszt jest liniowy i kończy się przy pierwszym trafieniu.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use moka::sync::Cache;
use serde::Serialize;

use crate::error::ScanError;
use crate::hashing::{self, PerceptualHash};
use crate::store::{KnownHash, Severity, Store};

/* ===========================
   HashStore – dostęp do blocklisty
   =========================== */

#[derive(Clone)]
pub struct HashStore {
    store: Arc<dyn Store>,
    // jeden klucz: cała aktywna lista
    cache: Cache<(), Arc<Vec<KnownHash>>>,
    // numer zapisu; lista wczytana przed zapisem nie trafia do cache
    generation: Arc<Mutex<u64>>,
    grid: u32,
}

impl HashStore {
    pub fn new(store: Arc<dyn Store>, grid: u32, ttl: Duration) -> Self {
        Self {
            store,
            cache: Cache::builder().max_capacity(1).time_to_live(ttl).build(),
            generation: Arc::new(Mutex::new(0)),
            grid,
        }
    }

    pub fn grid(&self) -> u32 {
        self.grid
    }

    /// Aktywne wpisy (z cache, TTL z konfiguracji).
    pub async fn active(&self) -> Result<Arc<Vec<KnownHash>>> {
        if let Some(list) = self.cache.get(&()) {
            return Ok(list);
        }
        let seen = self.current_generation();
        let list = Arc::new(self.store.active_hashes().await?);
        let generation = self.generation.lock().unwrap_or_else(|e| e.into_inner());
        if *generation == seen {
            self.cache.insert((), list.clone());
        }
        Ok(list)
    }

    fn current_generation(&self) -> u64 {
        *self.generation.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Po zapisie do magazynu: nowa generacja + pusty cache (pod jedną blokadą).
    fn invalidate(&self) {
        let mut generation = self.generation.lock().unwrap_or_else(|e| e.into_inner());
        *generation += 1;
        self.cache.invalidate(&());
    }

    pub async fn add(
        &self,
        hash: &PerceptualHash,
        severity: Severity,
        reason: Option<&str>,
        added_by: Option<u64>,
    ) -> Result<KnownHash> {
        let entry = self.store.add_known_hash(hash, severity, reason, added_by).await?;
        self.invalidate();
        tracing::info!(id = entry.id, severity = severity.as_str(), "known hash added");
        Ok(entry)
    }

    /// Liczy hash obrazka i dodaje go do blocklisty.
    pub async fn add_from_image(
        &self,
        bytes: Arc<[u8]>,
        severity: Severity,
        reason: Option<&str>,
        added_by: Option<u64>,
    ) -> Result<KnownHash> {
        let hash = hashing::compute_async(bytes, self.grid).await?;
        self.add(&hash, severity, reason, added_by).await
    }

    /// Logiczne usunięcie (`active=false`); wpis zostaje do audytu.
    pub async fn deactivate(&self, id: i64) -> Result<bool> {
        let changed = self.store.deactivate_hash(id).await?;
        self.invalidate();
        if changed {
            tracing::info!(id, "known hash deactivated");
        }
        Ok(changed)
    }
}

/* ===========================
   Pre-filtr
   =========================== */

#[derive(Debug, Clone, Serialize)]
pub struct PrefilterOutcome {
    pub matched: bool,
    pub hash: PerceptualHash,
    pub matched_hash: Option<KnownHash>,
    pub similarity: Option<f64>,
}

#[derive(Clone)]
pub struct HashPrefilter {
    hashes: HashStore,
    threshold: f64,
}

impl HashPrefilter {
    pub fn new(hashes: HashStore, threshold: f64) -> Self {
        Self { hashes, threshold }
    }

    pub fn hashes(&self) -> &HashStore {
        &self.hashes
    }

    pub async fn prefilter(&self, bytes: Arc<[u8]>) -> Result<PrefilterOutcome, ScanError> {
        let hash = hashing::compute_async(bytes, self.hashes.grid()).await?;
        let known = self.hashes.active().await.map_err(ScanError::Store)?;
        Ok(match_first(hash, &known, self.threshold))
    }
}

/// Pierwszy aktywny wpis z podobieństwem >= `threshold`.
pub fn match_first(hash: PerceptualHash, known: &[KnownHash], threshold: f64) -> PrefilterOutcome {
    for k in known.iter().filter(|k| k.active) {
        let sim = hash.similarity(&k.hash);
        if sim >= threshold {
            return PrefilterOutcome {
                matched: true,
                hash,
                matched_hash: Some(k.clone()),
                similarity: Some(sim),
            };
        }
    }
    PrefilterOutcome {
        matched: false,
        hash,
        matched_hash: None,
        similarity: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn known(id: i64, hash: PerceptualHash) -> KnownHash {
        KnownHash {
            id,
            hash,
            severity: Severity::High,
            active: true,
            reason: None,
            added_by: None,
        }
    }

    #[test]
    fn first_match_wins_over_better_match() {
        let base = PerceptualHash::from_bits(&[false; 256]);
        // 0.96 podobieństwa (10 bitów różnicy) vs identyczny wpis dalej na liście
        let mut near = base.clone();
        for i in 0..10 {
            near = near.with_flipped(i);
        }
        let list = vec![known(1, near), known(2, base.clone())];
        let out = match_first(base, &list, 0.95);
        assert!(out.matched);
        assert_eq!(out.matched_hash.unwrap().id, 1);
        assert!(out.similarity.unwrap() < 1.0);
    }

    #[test]
    fn inactive_entries_are_skipped() {
        let base = PerceptualHash::from_bits(&[true; 64]);
        let mut k = known(1, base.clone());
        k.active = false;
        assert!(!match_first(base, &[k], 0.95).matched);
    }

    #[tokio::test]
    async fn writes_invalidate_cached_list() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let hs = HashStore::new(store, 8, Duration::from_secs(300));
        assert!(hs.active().await.unwrap().is_empty());

        let h = PerceptualHash::from_bits(&[true; 64]);
        let k = hs.add(&h, Severity::Low, None, Some(5)).await.unwrap();
        assert_eq!(hs.active().await.unwrap().len(), 1);

        assert!(hs.deactivate(k.id).await.unwrap());
        assert!(hs.active().await.unwrap().is_empty());
    }
}
