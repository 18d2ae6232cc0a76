//! Local evidence collector: turns raw detector/OCR output into a normalized
//! [`DetectionSet`].
//!
//! Collection never fails. Malformed input yields an unprocessable set that
//! still flows through gate and policy, where the fail-closed rule handles it.

#![allow(missing_docs)]

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::core::config::CollectorConfig;
use crate::core::evidence::{DetectionCandidate, DetectionSet, DetectionSource, Locator};
use crate::monitor::telemetry::{Counter, FunnelCounters, TelemetrySample};

/// One detection as the external detector reports it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawDetection {
    pub label: String,
    pub confidence: f64,
    #[serde(default)]
    pub locator: Locator,
    #[serde(default)]
    pub timestamp_ms: u64,
    #[serde(default = "default_source")]
    pub source: DetectionSource,
    #[serde(default)]
    pub text: Option<String>,
}

const fn default_source() -> DetectionSource {
    DetectionSource::Visual
}

impl RawDetection {
    #[must_use]
    pub fn visual(label: impl Into<String>, confidence: f64) -> Self {
        Self {
            label: label.into(),
            confidence,
            locator: Locator::Unlocated,
            timestamp_ms: 0,
            source: DetectionSource::Visual,
            text: None,
        }
    }

    #[must_use]
    pub fn text(label: impl Into<String>, confidence: f64, text: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            confidence,
            locator: Locator::Unlocated,
            timestamp_ms: 0,
            source: DetectionSource::Text,
            text: Some(text.into()),
        }
    }
}

/// One media unit (frame or session) as delivered by the capture side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawUnit {
    pub unit_id: String,
    #[serde(default)]
    pub media_ref: Option<String>,
    #[serde(default)]
    pub detections: Vec<RawDetection>,
}

impl RawUnit {
    #[must_use]
    pub fn new(unit_id: impl Into<String>, detections: Vec<RawDetection>) -> Self {
        Self {
            unit_id: unit_id.into(),
            media_ref: None,
            detections,
        }
    }
}

/// Normalizes raw detections into detection sets.
#[derive(Debug, Clone)]
pub struct Collector {
    min_confidence: f64,
    max_candidates: usize,
    aliases: BTreeMap<String, String>,
    counters: Arc<FunnelCounters>,
}

impl Collector {
    #[must_use]
    pub fn from_config(config: &CollectorConfig, counters: Arc<FunnelCounters>) -> Self {
        let aliases = config
            .label_aliases
            .iter()
            .map(|(from, to)| (normalize_label(from), normalize_label(to)))
            .collect();
        Self {
            min_confidence: config.min_confidence,
            max_candidates: config.max_candidates,
            aliases,
            counters,
        }
    }

    /// Canonical label: trimmed, lowercased, alias-resolved.
    #[must_use]
    pub fn canonical_label(&self, raw: &str) -> String {
        let label = normalize_label(raw);
        self.aliases.get(&label).cloned().unwrap_or(label)
    }

    /// Normalize one unit. Any invalid detection rejects the whole unit.
    #[must_use]
    pub fn collect(&self, raw: RawUnit) -> DetectionSet {
        let RawUnit {
            unit_id,
            media_ref,
            detections,
        } = raw;

        if unit_id.trim().is_empty() {
            return self.reject(unit_id, media_ref, "empty unit id".to_string());
        }

        let mut candidates = Vec::with_capacity(detections.len().min(self.max_candidates));
        for (index, det) in detections.into_iter().enumerate() {
            if det.source == DetectionSource::Text
                && det.text.as_deref().is_none_or(|t| t.trim().is_empty())
            {
                return self.reject(
                    unit_id,
                    media_ref,
                    format!("detection {index}: text candidate without text"),
                );
            }
            let label = self.canonical_label(&det.label);
            let candidate = match DetectionCandidate::new(
                label,
                det.confidence,
                det.locator,
                det.timestamp_ms,
                det.source,
                det.text,
            ) {
                Ok(c) => c,
                Err(err) => {
                    return self.reject(unit_id, media_ref, format!("detection {index}: {err}"));
                }
            };
            if candidate.confidence() < self.min_confidence {
                continue;
            }
            if candidates.len() < self.max_candidates {
                candidates.push(candidate);
            }
        }

        DetectionSet::new(unit_id, media_ref, candidates)
    }

    /// Parse one JSON document and collect it. Unparseable input becomes an
    /// unprocessable set; `fallback_id` names it when no `unit_id` survives.
    #[must_use]
    pub fn collect_json(&self, raw: &str, fallback_id: &str) -> DetectionSet {
        match serde_json::from_str::<RawUnit>(raw) {
            Ok(unit) => self.collect(unit),
            Err(err) => {
                let unit_id = serde_json::from_str::<serde_json::Value>(raw)
                    .ok()
                    .and_then(|v| v.get("unit_id").and_then(|id| id.as_str()).map(str::to_string))
                    .filter(|id| !id.trim().is_empty())
                    .unwrap_or_else(|| fallback_id.to_string());
                self.reject(unit_id, None, format!("malformed detector input: {err}"))
            }
        }
    }

    fn reject(&self, unit_id: String, media_ref: Option<String>, reason: String) -> DetectionSet {
        let unit_id = if unit_id.trim().is_empty() {
            "unknown-unit".to_string()
        } else {
            unit_id
        };
        self.counters.event(
            Counter::Unprocessable,
            TelemetrySample::new("collector", "unprocessable", format!("{unit_id}: {reason}")),
        );
        log::warn!("unit {unit_id} unprocessable: {reason}");
        DetectionSet::unprocessable(unit_id, media_ref, reason)
    }
}

fn normalize_label(raw: &str) -> String {
    raw.trim().to_lowercase()
}
