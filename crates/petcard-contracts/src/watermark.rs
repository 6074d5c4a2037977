use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Named corner of the base image considered as a watermark placement site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CornerPosition {
    TopLeft,
    TopRight,
    BottomLeft,
    BottomRight,
}

impl CornerPosition {
    pub const ALL: [CornerPosition; 4] = [
        CornerPosition::TopLeft,
        CornerPosition::TopRight,
        CornerPosition::BottomLeft,
        CornerPosition::BottomRight,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CornerPosition::TopLeft => "top-left",
            CornerPosition::TopRight => "top-right",
            CornerPosition::BottomLeft => "bottom-left",
            CornerPosition::BottomRight => "bottom-right",
        }
    }

    /// Pixel offsets for this corner given base/overlay dimensions and a
    /// margin. Offsets are clamped so the overlay origin never leaves the
    /// base image, even when the overlay or margin is oversized.
    pub fn resolve_offsets(
        &self,
        base_width: u32,
        base_height: u32,
        overlay_width: u32,
        overlay_height: u32,
        margin: u32,
    ) -> (u32, u32) {
        let right = base_width.saturating_sub(overlay_width.saturating_add(margin));
        let left = margin.min(base_width.saturating_sub(overlay_width));
        let bottom = base_height.saturating_sub(overlay_height.saturating_add(margin));
        let top = margin.min(base_height.saturating_sub(overlay_height));
        match self {
            CornerPosition::TopLeft => (left, top),
            CornerPosition::TopRight => (right, top),
            CornerPosition::BottomLeft => (left, bottom),
            CornerPosition::BottomRight => (right, bottom),
        }
    }
}

impl fmt::Display for CornerPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CornerPosition {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "top-left" | "top_left" => Ok(CornerPosition::TopLeft),
            "top-right" | "top_right" => Ok(CornerPosition::TopRight),
            "bottom-left" | "bottom_left" => Ok(CornerPosition::BottomLeft),
            "bottom-right" | "bottom_right" => Ok(CornerPosition::BottomRight),
            other => Err(anyhow::anyhow!(
                "unknown corner position '{other}' (expected one of: top-left, top-right, bottom-left, bottom-right)"
            )),
        }
    }
}

/// Per-call watermark knobs. Every field has a default so callers can start
/// from `WatermarkOptions::default()` and override only what they need; the
/// struct also deserializes from a JSON options file with the same defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatermarkOptions {
    /// Pixel gap between the logo and the image edge.
    pub margin_px: u32,
    /// Logo width as a fraction of the base image width.
    pub logo_width_ratio: f64,
    /// Floor for the resized logo width, in pixels.
    pub min_logo_width_px: u32,
    pub jpeg_quality: u8,
    /// When set, used unconditionally; no scoring happens.
    pub force_position: Option<CornerPosition>,
    /// Used when auto placement is disabled or produced no usable candidate.
    pub fallback_position: CornerPosition,
    /// Corners to score, in preference order for ties.
    pub candidate_positions: Vec<CornerPosition>,
    pub auto_placement: bool,
    /// Explicit logo asset path, populated at the process boundary (e.g. from
    /// `WATERMARK_LOGO_PATH`). `None` means the conventional search list.
    pub logo_path: Option<PathBuf>,
}

impl Default for WatermarkOptions {
    fn default() -> Self {
        Self {
            margin_px: 24,
            logo_width_ratio: 0.22,
            min_logo_width_px: 64,
            jpeg_quality: 90,
            force_position: None,
            fallback_position: CornerPosition::BottomRight,
            candidate_positions: CornerPosition::ALL.to_vec(),
            auto_placement: true,
            logo_path: None,
        }
    }
}

impl WatermarkOptions {
    /// Candidate list with duplicates removed, preserving first-seen order.
    pub fn deduped_candidates(&self) -> Vec<CornerPosition> {
        let mut seen: Vec<CornerPosition> = Vec::new();
        for candidate in &self.candidate_positions {
            if !seen.contains(candidate) {
                seen.push(*candidate);
            }
        }
        seen
    }
}

/// Where the logo ended up and how the spot was chosen. Surfaced to callers
/// for observability, never as an error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlacementMetadata {
    pub position: CornerPosition,
    /// Busyness score of the winning corner; absent when scoring was bypassed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    pub auto_placed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatermarkReport {
    pub content_type: String,
    pub extension: String,
    pub watermarked: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub placement: Option<PlacementMetadata>,
}

/// Final bytes plus the serializable report about how they were produced.
#[derive(Debug, Clone)]
pub struct WatermarkOutcome {
    pub buffer: Vec<u8>,
    pub report: WatermarkReport,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offsets_stay_within_bounds_for_all_corners() {
        let cases = [
            (1000u32, 800u32, 220u32, 90u32, 24u32),
            (1000, 800, 220, 90, 0),
            (100, 100, 90, 90, 24),
            (64, 64, 64, 64, 24),
            (50, 50, 80, 80, 10),
            (1, 1, 1, 1, 1),
        ];
        for (bw, bh, ow, oh, margin) in cases {
            for corner in CornerPosition::ALL {
                let (left, top) = corner.resolve_offsets(bw, bh, ow, oh, margin);
                if ow <= bw {
                    assert!(left <= bw - ow, "{corner} left={left} bw={bw} ow={ow}");
                }
                if oh <= bh {
                    assert!(top <= bh - oh, "{corner} top={top} bh={bh} oh={oh}");
                }
            }
        }
    }

    #[test]
    fn offsets_respect_margin_on_roomy_images() {
        let (left, top) =
            CornerPosition::BottomRight.resolve_offsets(1000, 1000, 220, 90, 24);
        assert_eq!((left, top), (1000 - 220 - 24, 1000 - 90 - 24));

        let (left, top) = CornerPosition::TopLeft.resolve_offsets(1000, 1000, 220, 90, 24);
        assert_eq!((left, top), (24, 24));
    }

    #[test]
    fn serde_uses_kebab_case_names() {
        let parsed: CornerPosition = serde_json::from_str("\"bottom-right\"").unwrap();
        assert_eq!(parsed, CornerPosition::BottomRight);
        assert_eq!(
            serde_json::to_string(&CornerPosition::TopLeft).unwrap(),
            "\"top-left\""
        );
    }

    #[test]
    fn from_str_accepts_underscores_and_rejects_unknown() {
        assert_eq!(
            "top_right".parse::<CornerPosition>().unwrap(),
            CornerPosition::TopRight
        );
        assert!("center".parse::<CornerPosition>().is_err());
    }

    #[test]
    fn default_options_match_documented_values() {
        let options = WatermarkOptions::default();
        assert_eq!(options.margin_px, 24);
        assert_eq!(options.min_logo_width_px, 64);
        assert_eq!(options.jpeg_quality, 90);
        assert!((options.logo_width_ratio - 0.22).abs() < f64::EPSILON);
        assert_eq!(options.fallback_position, CornerPosition::BottomRight);
        assert_eq!(options.candidate_positions, CornerPosition::ALL.to_vec());
        assert!(options.auto_placement);
        assert!(options.force_position.is_none());
    }

    #[test]
    fn deduped_candidates_preserve_first_seen_order() {
        let options = WatermarkOptions {
            candidate_positions: vec![
                CornerPosition::BottomLeft,
                CornerPosition::TopRight,
                CornerPosition::BottomLeft,
                CornerPosition::TopLeft,
            ],
            ..WatermarkOptions::default()
        };
        assert_eq!(
            options.deduped_candidates(),
            vec![
                CornerPosition::BottomLeft,
                CornerPosition::TopRight,
                CornerPosition::TopLeft,
            ]
        );
    }

    #[test]
    fn options_deserialize_with_partial_json() {
        let options: WatermarkOptions =
            serde_json::from_str("{\"margin_px\": 12, \"force_position\": \"top-left\"}").unwrap();
        assert_eq!(options.margin_px, 12);
        assert_eq!(options.force_position, Some(CornerPosition::TopLeft));
        assert_eq!(options.jpeg_quality, 90);
    }
}
