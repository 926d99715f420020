//! Engagement Quality Score.

use serde::{Deserialize, Serialize};

/// Blend weights; they are normalized before use so only their ratio matters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EqsWeights {
    pub attention: f64,
    pub scroll: f64,
    pub conversion: f64,
    /// Average attention that maps to a full attention score
    pub attention_normalization_ms: f64,
}

impl Default for EqsWeights {
    fn default() -> Self {
        Self {
            attention: 0.5,
            scroll: 0.3,
            conversion: 0.2,
            attention_normalization_ms: 30_000.0,
        }
    }
}

impl EqsWeights {
    /// Negative weights become zero and the rest sum to one; all-zero becomes thirds
    pub fn normalized(&self) -> Self {
        let attention = self.attention.max(0.0);
        let scroll = self.scroll.max(0.0);
        let conversion = self.conversion.max(0.0);
        let sum = attention + scroll + conversion;
        let attention_normalization_ms = self.attention_normalization_ms.max(1.0);

        if sum == 0.0 || !sum.is_finite() {
            return Self {
                attention: 1.0 / 3.0,
                scroll: 1.0 / 3.0,
                conversion: 1.0 / 3.0,
                attention_normalization_ms,
            };
        }

        Self {
            attention: attention / sum,
            scroll: scroll / sum,
            conversion: conversion / sum,
            attention_normalization_ms,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EqsInput {
    pub page_views: u64,
    pub bot_page_views: u64,
    pub active_attention_ms_avg: f64,
    pub scroll_readthrough_avg: f64,
    pub conversion_rate: f64,
}

/// Clamp with non-finite values collapsing to `min`
fn clamp(value: f64, min: f64, max: f64) -> f64 {
    if !value.is_finite() {
        return min;
    }
    value.clamp(min, max)
}

/// Round half up at `10^-places`
pub fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor + 0.5).floor() / factor
}

/// Score in `[0, 100]` with two decimals; exactly 0 without human page views
pub fn calculate_eqs(input: &EqsInput, weights: &EqsWeights) -> f64 {
    let human_page_views = input.page_views.saturating_sub(input.bot_page_views);
    if human_page_views == 0 {
        return 0.0;
    }

    let weights = weights.normalized();
    let attention_avg = clamp(input.active_attention_ms_avg, 0.0, f64::MAX);
    let attention = clamp(attention_avg / weights.attention_normalization_ms, 0.0, 1.0);
    let scroll = clamp(input.scroll_readthrough_avg, 0.0, 1.0);
    let conversion = clamp(input.conversion_rate, 0.0, 1.0);

    let score = weights.attention * attention + weights.scroll * scroll + weights.conversion * conversion;
    round_to(clamp(score, 0.0, 1.0) * 100.0, 2)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_human_page_views_is_zero() {
        let input = EqsInput {
            page_views: 10,
            bot_page_views: 12,
            active_attention_ms_avg: 60_000.0,
            scroll_readthrough_avg: 1.0,
            conversion_rate: 1.0,
        };
        assert_eq!(calculate_eqs(&input, &EqsWeights::default()), 0.0);
    }

    #[test]
    fn test_default_weights() {
        let input = EqsInput {
            page_views: 4,
            bot_page_views: 0,
            active_attention_ms_avg: 15_000.0,
            scroll_readthrough_avg: 0.5,
            conversion_rate: 0.25,
        };
        // 0.5 * 0.5 + 0.3 * 0.5 + 0.2 * 0.25
        assert_eq!(calculate_eqs(&input, &EqsWeights::default()), 45.0);
    }

    #[test]
    fn test_inputs_are_clamped() {
        let input = EqsInput {
            page_views: 1,
            bot_page_views: 0,
            active_attention_ms_avg: 1e12,
            scroll_readthrough_avg: 3.0,
            conversion_rate: f64::NAN,
        };
        let weights = EqsWeights {
            attention: 1.0,
            scroll: 1.0,
            conversion: 1.0,
            attention_normalization_ms: 1000.0,
        };
        assert_eq!(calculate_eqs(&input, &weights), 66.67);
    }

    #[test]
    fn test_weight_normalization() {
        let weights = EqsWeights {
            attention: -1.0,
            scroll: 0.0,
            conversion: 0.0,
            attention_normalization_ms: 0.0,
        }
        .normalized();
        assert!((weights.attention - 1.0 / 3.0).abs() < 1e-12);
        assert_eq!(weights.attention_normalization_ms, 1.0);

        let weights = EqsWeights {
            attention: 2.0,
            scroll: 2.0,
            conversion: 0.0,
            attention_normalization_ms: 500.0,
        }
        .normalized();
        assert_eq!(weights.attention, 0.5);
        assert_eq!(weights.conversion, 0.0);
    }

    #[test]
    fn test_round_to() {
        assert_eq!(round_to(0.123_44, 4), 0.1234);
        assert_eq!(round_to(0.123_46, 4), 0.1235);
        assert_eq!(round_to(-20.0, 4), -20.0);
        assert_eq!(round_to(66.666_66, 2), 66.67);
    }
}
