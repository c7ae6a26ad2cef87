//! Polityka decyzji: confidence -> (flagged, requires_review).
//!
//! Trzy rozłączne pasma:
//! - `c >= detection`            => flagged
//! - `review <= c < detection`   => do przeglądu
//! - `c < review`                => przepuszczamy

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub flagged: bool,
    pub requires_review: bool,
}

impl Decision {
    pub const PASS: Decision = Decision {
        flagged: false,
        requires_review: false,
    };

    pub fn verdict(&self) -> Verdict {
        match (self.flagged, self.requires_review) {
            (true, _) => Verdict::Flagged,
            (false, true) => Verdict::NeedsReview,
            (false, false) => Verdict::Pass,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Pass,
    NeedsReview,
    Flagged,
}

/// Czysta funkcja, bez I/O. `flagged` i `requires_review` nigdy nie są oba true.
pub fn decide(confidence: f64, detection_threshold: f64, review_threshold: f64) -> Decision {
    if confidence >= detection_threshold {
        Decision {
            flagged: true,
            requires_review: false,
        }
    } else if confidence >= review_threshold {
        Decision {
            flagged: false,
            requires_review: true,
        }
    } else {
        Decision::PASS
    }
}
