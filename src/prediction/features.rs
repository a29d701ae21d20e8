// =============================================================================
// Feature Projection — fixed-order numeric vector from a market frame
// =============================================================================
//
// The model contract is positional: the same twelve features in the same
// order on every call. Missing inputs take documented defaults; NaN and
// infinities are scrubbed to 0 so a misbehaving host can never poison the
// model input.
// =============================================================================

use serde::Serialize;

use crate::protocol::messages::MarketFrame;

/// Feature order on the wire to the model service.
pub const FEATURE_NAMES: [&str; 12] = [
    "price",
    "rsi",
    "ema5",
    "ema8",
    "ema_alignment",
    "volume",
    "atr",
    "adx",
    "bid",
    "ask",
    "high",
    "low",
];

const IDX_PRICE: usize = 0;
const IDX_RSI: usize = 1;
const IDX_EMA5: usize = 2;
const IDX_EMA8: usize = 3;
const IDX_EMA_ALIGNMENT: usize = 4;
const IDX_VOLUME: usize = 5;
const IDX_ATR: usize = 6;

/// Fixed-order feature vector.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeatureVector(pub [f64; 12]);

impl FeatureVector {
    pub fn price(&self) -> f64 {
        self.0[IDX_PRICE]
    }

    pub fn rsi(&self) -> f64 {
        self.0[IDX_RSI]
    }

    pub fn ema5(&self) -> f64 {
        self.0[IDX_EMA5]
    }

    pub fn ema8(&self) -> f64 {
        self.0[IDX_EMA8]
    }

    pub fn ema_alignment(&self) -> f64 {
        self.0[IDX_EMA_ALIGNMENT]
    }

    pub fn volume(&self) -> f64 {
        self.0[IDX_VOLUME]
    }

    pub fn atr(&self) -> f64 {
        self.0[IDX_ATR]
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.0
    }
}

/// Project a market frame into the fixed feature order.
pub fn project(frame: &MarketFrame) -> FeatureVector {
    let price = frame.price;
    let values = [
        price,
        frame.rsi.unwrap_or(50.0),
        frame.ema5.unwrap_or(price),
        frame.ema8.unwrap_or(price),
        frame.ema_alignment.unwrap_or(0.0),
        frame.volume.unwrap_or(1000.0),
        frame.atr.unwrap_or(1.0),
        frame.adx.unwrap_or(20.0),
        frame.bid.unwrap_or(price),
        frame.ask.unwrap_or(price),
        frame.high.unwrap_or(price),
        frame.low.unwrap_or(price),
    ];

    FeatureVector(values.map(|v| if v.is_finite() { v } else { 0.0 }))
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn frame(price: f64) -> MarketFrame {
        MarketFrame {
            instrument: "ES 03-25".to_string(),
            price,
            ..Default::default()
        }
    }

    #[test]
    fn defaults_applied_for_missing_fields() {
        let v = project(&frame(21500.0));
        assert!((v.price() - 21500.0).abs() < f64::EPSILON);
        assert!((v.rsi() - 50.0).abs() < f64::EPSILON);
        assert!((v.ema5() - 21500.0).abs() < f64::EPSILON);
        assert!((v.ema_alignment()).abs() < f64::EPSILON);
        assert!((v.volume() - 1000.0).abs() < f64::EPSILON);
        assert!((v.atr() - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn non_finite_inputs_scrubbed_to_zero() {
        let mut f = frame(21500.0);
        f.rsi = Some(f64::NAN);
        f.atr = Some(f64::INFINITY);
        f.ema5 = Some(f64::NEG_INFINITY);
        let v = project(&f);
        assert_eq!(v.rsi(), 0.0);
        assert_eq!(v.atr(), 0.0);
        assert_eq!(v.ema5(), 0.0);
    }

    #[test]
    fn vector_length_matches_names() {
        let v = project(&frame(1.0));
        assert_eq!(v.as_slice().len(), FEATURE_NAMES.len());
    }
}
