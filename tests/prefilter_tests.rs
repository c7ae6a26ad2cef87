mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{FakeClassifier, FaultyStore, detector, sample_png, settings};
use tigris_imageguard::hashing;
use tigris_imageguard::prefilter::HashStore;
use tigris_imageguard::scanner::{DetectionMethod, ImageRef, ScanRequest};
use tigris_imageguard::store::{MemoryStore, Severity, Store};

#[tokio::test]
async fn near_duplicate_of_known_hash_skips_classifier() {
    let s = settings();
    let store = Arc::new(MemoryStore::new());
    let bytes = sample_png(3);

    // wpis blocklisty różni się o 7 z 256 bitów => podobieństwo ~0.973
    let mut known = hashing::compute(&bytes, s.detection.hash_size).unwrap();
    for i in [1, 30, 77, 100, 150, 201, 255] {
        known = known.with_flipped(i);
    }
    let real = hashing::compute(&bytes, s.detection.hash_size).unwrap();
    let sim = real.similarity(&known);
    assert!((sim - 249.0 / 256.0).abs() < 1e-12);
    assert!(sim >= 0.95 && sim < 1.0);
    store
        .add_known_hash(&known, Severity::High, Some("csam-db import"), Some(1))
        .await
        .unwrap();

    let classifier = Arc::new(FakeClassifier::new(0.0));
    let det = detector(store, classifier.clone(), &s);
    let res = det.scan(ScanRequest::new(ImageRef::Bytes(bytes))).await.unwrap();

    assert!(res.flagged);
    assert!(!res.requires_review);
    assert_eq!(res.confidence, 1.0);
    assert_eq!(res.method, DetectionMethod::HashMatch);
    assert_eq!(res.perceptual_hash, real.to_hex());
    assert_eq!(classifier.calls(), 0);
}

#[tokio::test]
async fn unrelated_image_goes_to_classifier() {
    let s = settings();
    let store = Arc::new(MemoryStore::new());
    let other = hashing::compute(&sample_png(1), s.detection.hash_size).unwrap();
    let mine = hashing::compute(&sample_png(2), s.detection.hash_size).unwrap();
    assert!(mine.similarity(&other) < 0.95);
    store.add_known_hash(&other, Severity::Low, None, None).await.unwrap();

    let classifier = Arc::new(FakeClassifier::new(0.1));
    let det = detector(store, classifier.clone(), &s);
    let res = det
        .scan(ScanRequest::new(ImageRef::Bytes(sample_png(2))))
        .await
        .unwrap();

    assert!(!res.flagged && !res.requires_review);
    assert_eq!(res.method, DetectionMethod::Provider("fake".into()));
    assert_eq!(classifier.calls(), 1);
}

#[tokio::test]
async fn deactivated_hash_no_longer_matches() {
    let s = settings();
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let classifier = Arc::new(FakeClassifier::new(0.0));
    let det = detector(store, classifier.clone(), &s);
    let hashes = det.prefilter().hashes();

    let k = hashes
        .add_from_image(Arc::from(sample_png(9)), Severity::Medium, None, Some(2))
        .await
        .unwrap();
    let hit = det.prefilter().prefilter(Arc::from(sample_png(9))).await.unwrap();
    assert!(hit.matched);
    assert_eq!(hit.matched_hash.unwrap().id, k.id);

    assert!(hashes.deactivate(k.id).await.unwrap());
    let miss = det.prefilter().prefilter(Arc::from(sample_png(9))).await.unwrap();
    assert!(!miss.matched);
}

#[tokio::test]
async fn undecodable_image_fails_the_scan() {
    let s = settings();
    let classifier = Arc::new(FakeClassifier::new(0.99));
    let det = detector(Arc::new(MemoryStore::new()), classifier.clone(), &s);
    let err = det
        .scan(ScanRequest::new(ImageRef::Bytes(b"GIF89a-but-not-really".to_vec())))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "hash");
    assert_eq!(classifier.calls(), 0);
}

#[tokio::test]
async fn list_loaded_before_a_write_is_not_cached() {
    let store = Arc::new(FaultyStore::new());
    let hashes = HashStore::new(store.clone(), 16, Duration::from_secs(600));
    let (entered, release) = store.hold_next_active_hashes();

    let reader = {
        let hashes = hashes.clone();
        tokio::spawn(async move { hashes.active().await.unwrap().len() })
    };
    // czytelnik ma już pustą listę, zapis wchodzi zanim trafi ona do cache
    entered.notified().await;
    hashes
        .add_from_image(sample_png(1).into(), Severity::Medium, None, None)
        .await
        .unwrap();
    release.notify_one();

    assert_eq!(reader.await.unwrap(), 0);
    assert_eq!(hashes.active().await.unwrap().len(), 1);
}
