//! Hash percepcyjny (average hash na siatce N×N).
//!
//! Obrazek skalujemy do N×N w skali szarości, bit = piksel jaśniejszy od średniej.
//! Odporne na drobne skalowanie i rekompresję. Podobieństwo = znormalizowana
//! odległość Hamminga (odsetek zgodnych bitów).

use std::fmt;
use std::io::Cursor;

use image::{ImageReader, Limits, imageops::FilterType};
use serde::{Deserialize, Serialize};

use crate::error::ScanError;

/// Limit wymiarów dekodowanego obrazka (4096×4096).
pub const MAX_IMAGE_DIMENSION: u32 = 4096;

#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PerceptualHash {
    len: usize,
    words: Vec<u64>,
}

impl PerceptualHash {
    /// Buduje hash z ciągu bitów (indeks 0 = pierwszy bit).
    pub fn from_bits(bits: &[bool]) -> Self {
        let mut words = vec![0u64; bits.len().div_ceil(64)];
        for (i, &b) in bits.iter().enumerate() {
            if b {
                words[i / 64] |= 1u64 << (i % 64);
            }
        }
        Self {
            len: bits.len(),
            words,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn bit(&self, i: usize) -> bool {
        i < self.len && (self.words[i / 64] >> (i % 64)) & 1 == 1
    }

    /// Kopia z odwróconym bitem `i` (przydatne w testach i narzędziach).
    pub fn with_flipped(&self, i: usize) -> Self {
        let mut out = self.clone();
        if i < out.len {
            out.words[i / 64] ^= 1u64 << (i % 64);
        }
        out
    }

    /// Odsetek pozycji z tym samym bitem, w [0,1].
    /// Hashe różnej długości nigdy się nie dopasowują (0.0, nie błąd).
    pub fn similarity(&self, other: &Self) -> f64 {
        if self.len != other.len {
            return 0.0;
        }
        if self.len == 0 {
            return 1.0;
        }
        // niewykorzystane bity ostatniego słowa są zawsze zerami
        let differing: u32 = self
            .words
            .iter()
            .zip(&other.words)
            .map(|(a, b)| (a ^ b).count_ones())
            .sum();
        (self.len - differing as usize) as f64 / self.len as f64
    }

    /// Zapis heksadecymalny; każdy znak to 4 kolejne bity (pierwszy bit = najstarszy).
    pub fn to_hex(&self) -> String {
        let mut out = String::with_capacity(self.len.div_ceil(4));
        for nibble in 0..self.len.div_ceil(4) {
            let mut v = 0u8;
            for j in 0..4 {
                v <<= 1;
                if self.bit(nibble * 4 + j) {
                    v |= 1;
                }
            }
            out.push(char::from_digit(v as u32, 16).unwrap_or('0'));
        }
        out
    }

    pub fn from_hex(s: &str) -> Result<Self, ScanError> {
        let s = s.trim();
        let mut bits = Vec::with_capacity(s.len() * 4);
        for ch in s.chars() {
            let v = ch
                .to_digit(16)
                .ok_or_else(|| ScanError::hash(format!("invalid hex digit {ch:?} in hash")))?;
            for j in (0..4).rev() {
                bits.push((v >> j) & 1 == 1);
            }
        }
        Ok(Self::from_bits(&bits))
    }
}

impl fmt::Display for PerceptualHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for PerceptualHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PerceptualHash({}b:{})", self.len, self.to_hex())
    }
}

impl TryFrom<String> for PerceptualHash {
    type Error = ScanError;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::from_hex(&s)
    }
}

impl From<PerceptualHash> for String {
    fn from(h: PerceptualHash) -> Self {
        h.to_hex()
    }
}

/// Liczy hash z surowych bajtów (synchronicznie – wołać przez spawn_blocking).
pub fn compute(bytes: &[u8], grid: u32) -> Result<PerceptualHash, ScanError> {
    if bytes.is_empty() {
        return Err(ScanError::hash("empty image"));
    }

    let mut limits = Limits::default();
    limits.max_image_width = Some(MAX_IMAGE_DIMENSION);
    limits.max_image_height = Some(MAX_IMAGE_DIMENSION);

    let mut reader = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| ScanError::hash(format!("unrecognised image format: {e}")))?;
    reader.limits(limits);
    let img = reader
        .decode()
        .map_err(|e| ScanError::hash(format!("decode failed: {e}")))?;

    let gray = img.resize_exact(grid, grid, FilterType::Triangle).to_luma8();
    let cells = (grid * grid) as u64;
    let sum: u64 = gray.pixels().map(|p| p.0[0] as u64).sum();
    let avg = (sum / cells) as u8;

    let bits: Vec<bool> = gray.pixels().map(|p| p.0[0] > avg).collect();
    Ok(PerceptualHash::from_bits(&bits))
}

/// Asynchroniczna otoczka: dekodowanie na wątku blokującym.
pub async fn compute_async(bytes: std::sync::Arc<[u8]>, grid: u32) -> Result<PerceptualHash, ScanError> {
    tokio::task::spawn_blocking(move || compute(&bytes, grid))
        .await
        .map_err(|e| ScanError::Aborted(format!("hash task failed: {e}")))?
}
