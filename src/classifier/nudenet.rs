//! Lokalny dostawca: NudeNet przez `python3` (plik tymczasowy + JSON na stdout).

use anyhow::{Context as _, Result, bail};
use serde_json::Value as JsonValue;
use tempfile::NamedTempFile;
use tokio::{fs, process::Command};

use super::{ImageData, ProviderVerdict};
use crate::config::NudeNetConfig;

const SCRIPT: &str = "from nudenet import NudeClassifier;import sys,json;c=NudeClassifier();print(json.dumps(c.classify(sys.argv[1])))";

#[derive(Debug, Clone)]
pub struct NudeNetProvider {
    cfg: NudeNetConfig,
}

impl NudeNetProvider {
    pub fn new(cfg: NudeNetConfig) -> Self {
        Self { cfg }
    }

    pub(super) async fn call(&self, image: &ImageData) -> Result<ProviderVerdict> {
        let file = NamedTempFile::new().context("tempfile")?;
        fs::write(file.path(), &image.bytes[..]).await?;

        let output = Command::new(&self.cfg.python)
            .arg("-c")
            .arg(SCRIPT)
            .arg(file.path())
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("spawn {}", self.cfg.python))?;
        if !output.status.success() {
            bail!(
                "nudenet exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        let stdout = String::from_utf8(output.stdout).context("nudenet stdout not utf-8")?;
        let score = parse_unsafe_score(&stdout)?;
        Ok(ProviderVerdict {
            detected: score >= self.cfg.unsafe_threshold,
            confidence: score,
            labels: if score >= self.cfg.unsafe_threshold {
                vec!["unsafe".into()]
            } else {
                Vec::new()
            },
        })
    }
}

/// `{"<path>": {"safe": 0.1, "unsafe": 0.9}}` -> 0.9
fn parse_unsafe_score(stdout: &str) -> Result<f64> {
    let json: JsonValue = serde_json::from_str(stdout.trim()).context("nudenet output is not JSON")?;
    json.as_object()
        .and_then(|o| o.values().next())
        .and_then(|v| v.get("unsafe"))
        .and_then(|v| v.as_f64())
        .context("nudenet output has no `unsafe` score")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_unsafe_score() {
        let s = r#"{"/tmp/x": {"safe": 0.08, "unsafe": 0.92}}"#;
        assert!((parse_unsafe_score(s).unwrap() - 0.92).abs() < 1e-9);
        assert!(parse_unsafe_score("{}").is_err());
        assert!(parse_unsafe_score("boom").is_err());
    }

    #[tokio::test]
    async fn missing_interpreter_is_an_error() {
        let p = NudeNetProvider::new(NudeNetConfig {
            python: "/nonexistent/python-for-imageguard".into(),
            unsafe_threshold: 0.5,
        });
        let img = ImageData {
            bytes: std::sync::Arc::from(vec![0u8; 4]),
            url: None,
        };
        assert!(p.call(&img).await.is_err());
    }
}
