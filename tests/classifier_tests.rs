mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use common::{detector, sample_png, settings};
use tigris_imageguard::classifier::{ClassifierAdapter, ImageClassifier, ImageData};
use tigris_imageguard::config::{ClassifierConfig, HttpProviderConfig};
use tigris_imageguard::scanner::{DetectionMethod, ImageRef, ScanRequest};
use tigris_imageguard::store::MemoryStore;

/// Przyjmuje połączenia i nigdy nie odpowiada.
async fn silent_server() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((sock, _)) = listener.accept().await {
            held.push(sock);
        }
    });
    format!("http://{addr}/v1/classify")
}

/// Odpowiada raz podanym statusem i ciałem; zwraca też przechwycone żądanie.
async fn one_shot_server(status: &'static str, body: &'static str) -> (String, tokio::sync::oneshot::Receiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        let (mut sock, _) = listener.accept().await.unwrap();
        let raw = read_request(&mut sock).await;
        let _ = tx.send(raw);
        let resp = format!(
            "HTTP/1.1 {status}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
            body.len()
        );
        let _ = sock.write_all(resp.as_bytes()).await;
    });
    (format!("http://{addr}/v1/classify"), rx)
}

/// Czyta nagłówki i całe ciało (wg content-length).
async fn read_request(sock: &mut tokio::net::TcpStream) -> String {
    let mut data = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        let n = sock.read(&mut chunk).await.unwrap_or(0);
        if n == 0 {
            break;
        }
        data.extend_from_slice(&chunk[..n]);
        let text = String::from_utf8_lossy(&data).to_string();
        if let Some(end) = text.find("\r\n\r\n") {
            let len = text[..end]
                .lines()
                .find_map(|l| {
                    let l = l.to_ascii_lowercase();
                    l.strip_prefix("content-length:").map(|v| v.trim().parse::<usize>().unwrap_or(0))
                })
                .unwrap_or(0);
            if data.len() >= end + 4 + len {
                break;
            }
        }
    }
    String::from_utf8_lossy(&data).to_string()
}

fn http_config(endpoint: String, timeout_secs: u64) -> ClassifierConfig {
    ClassifierConfig {
        priority: vec!["http".into(), "nudenet".into()],
        timeout_secs,
        http: Some(HttpProviderConfig {
            name: "modapi".into(),
            endpoint,
            api_key: "secret-key".into(),
            send_bytes: false,
        }),
        nudenet: None,
    }
}

fn image_with_url() -> ImageData {
    ImageData {
        bytes: Arc::from(vec![1u8, 2, 3, 4]),
        url: Some("https://cdn.discordapp.com/attachments/1/2/a.png".into()),
    }
}

#[tokio::test]
async fn provider_timeout_is_not_detected() {
    let adapter = ClassifierAdapter::from_config(&http_config(silent_server().await, 1)).unwrap();

    let started = Instant::now();
    let r = adapter.classify(&image_with_url()).await;
    assert!(started.elapsed() < Duration::from_secs(5));

    assert!(!r.detected);
    assert_eq!(r.confidence, 0.0);
    assert_eq!(r.provider, "modapi");
    assert!(r.error.as_deref().is_some_and(|e| !e.is_empty()));
}

#[tokio::test]
async fn provider_timeout_yields_pass_for_the_whole_scan() {
    let s = settings();
    let adapter = Arc::new(ClassifierAdapter::from_config(&http_config(silent_server().await, 1)).unwrap());
    let det = detector(Arc::new(MemoryStore::new()), adapter, &s);

    let res = det
        .scan(ScanRequest::new(ImageRef::Bytes(sample_png(4))))
        .await
        .unwrap();
    assert!(!res.flagged);
    assert!(!res.requires_review);
    assert_eq!(res.confidence, 0.0);
    assert_eq!(res.method, DetectionMethod::None);
}

#[tokio::test]
async fn non_2xx_is_a_provider_failure() {
    let (url, _req) = one_shot_server("503 Service Unavailable", r#"{"detected":true,"confidence":0.99}"#).await;
    let adapter = ClassifierAdapter::from_config(&http_config(url, 5)).unwrap();
    let r = adapter.classify(&image_with_url()).await;
    assert!(!r.detected);
    assert_eq!(r.confidence, 0.0);
    assert!(r.error.unwrap().contains("503"));
}

#[tokio::test]
async fn malformed_body_is_a_provider_failure() {
    let (url, _req) = one_shot_server("200 OK", r#"{"score":"high"}"#).await;
    let adapter = ClassifierAdapter::from_config(&http_config(url, 5)).unwrap();
    let r = adapter.classify(&image_with_url()).await;
    assert!(!r.detected);
    assert!(r.is_failure());
}

#[tokio::test]
async fn successful_response_is_normalised() {
    let (url, req) = one_shot_server(
        "200 OK",
        r#"{"detected":true,"confidence":0.91,"labels":["explicit"]}"#,
    )
    .await;
    let adapter = ClassifierAdapter::from_config(&http_config(url, 5)).unwrap();
    let r = adapter.classify(&image_with_url()).await;

    assert!(r.error.is_none(), "{:?}", r.error);
    assert!(r.detected);
    assert!((r.confidence - 0.91).abs() < 1e-9);
    assert_eq!(r.labels, vec!["explicit".to_string()]);
    assert_eq!(r.provider, "modapi");

    let raw = req.await.unwrap().to_ascii_lowercase();
    assert!(raw.starts_with("post /v1/classify"));
    assert!(raw.contains("authorization: bearer secret-key"));
    assert!(raw.contains("cdn.discordapp.com"));
}

#[tokio::test]
async fn review_band_confidence_requires_review() {
    let (url, _req) = one_shot_server("200 OK", r#"{"detected":true,"confidence":0.75}"#).await;
    let s = settings();
    let adapter = Arc::new(ClassifierAdapter::from_config(&http_config(url, 5)).unwrap());
    let det = detector(Arc::new(MemoryStore::new()), adapter, &s);

    let res = det
        .scan(ScanRequest::new(ImageRef::Bytes(sample_png(5))))
        .await
        .unwrap();
    assert!(!res.flagged);
    assert!(res.requires_review);
    assert_eq!(res.method, DetectionMethod::Provider("modapi".into()));
}
