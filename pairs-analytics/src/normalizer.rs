//! Trade event normalisation.
//!
//! Converts raw upstream trade events into canonical [`Tick`]s. Malformed events are
//! reported as [`AnalyticsError::MalformedEvent`] and never raised into the pipeline.

use crate::error::AnalyticsError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use smol_str::SmolStr;

/// Canonical trade. Immutable once normalised.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Tick {
    pub symbol: SmolStr,
    pub time: DateTime<Utc>,
    pub price: f64,
    pub size: f64,
}

impl Tick {
    /// Validate and construct a [`Tick`]. Symbols are upper-cased.
    pub fn new(
        symbol: impl AsRef<str>,
        time: DateTime<Utc>,
        price: f64,
        size: f64,
    ) -> Result<Self, AnalyticsError> {
        let symbol = symbol.as_ref().trim();
        if symbol.is_empty() {
            return Err(AnalyticsError::MalformedEvent("missing symbol".to_string()));
        }
        if !price.is_finite() || price <= 0.0 {
            return Err(AnalyticsError::MalformedEvent(format!(
                "{symbol}: price must be positive, got {price}"
            )));
        }
        if !size.is_finite() || size < 0.0 {
            return Err(AnalyticsError::MalformedEvent(format!(
                "{symbol}: size must be non-negative, got {size}"
            )));
        }

        Ok(Self {
            symbol: SmolStr::new(symbol.to_ascii_uppercase()),
            time,
            price,
            size,
        })
    }
}

/// ### Raw Payload Example
/// Binance Futures trade stream (`<symbol>@trade`):
///```json
/// {
///     "e": "trade",
///     "E": 1702742400012,
///     "T": 1702742400000,
///     "s": "BTCUSDT",
///     "t": 5001,
///     "p": "43250.50",
///     "q": "0.125",
///     "X": "MARKET",
///     "m": false
/// }
/// ```
///
/// Every field is optional at the serde layer so a structurally odd event becomes a
/// [`AnalyticsError::MalformedEvent`] rather than a deserialisation failure of the stream.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RawTradeEvent {
    #[serde(rename = "e", default)]
    pub event_type: Option<String>,

    #[serde(rename = "s", default)]
    pub symbol: Option<String>,

    #[serde(rename = "T", default)]
    pub trade_time: Option<Value>,

    #[serde(rename = "p", default)]
    pub price: Option<Value>,

    #[serde(rename = "q", default)]
    pub quantity: Option<Value>,
}

/// Outcome of normalising one raw event.
#[derive(Debug, Clone, PartialEq)]
pub enum Normalized {
    Tick(Tick),
    /// Not a trade event (eg/ subscription acks), skipped without error.
    Ignored,
}

/// Normalise one [`RawTradeEvent`].
pub fn normalize(event: &RawTradeEvent) -> Result<Normalized, AnalyticsError> {
    if let Some(kind) = event.event_type.as_deref() {
        if kind != "trade" {
            return Ok(Normalized::Ignored);
        }
    }

    let symbol = event
        .symbol
        .as_deref()
        .ok_or_else(|| AnalyticsError::MalformedEvent("missing symbol".to_string()))?;

    let time = event
        .trade_time
        .as_ref()
        .and_then(value_as_i64)
        .filter(|millis| *millis > 0)
        .and_then(DateTime::from_timestamp_millis)
        .ok_or_else(|| {
            AnalyticsError::MalformedEvent(format!("{symbol}: unparsable trade time"))
        })?;

    let price = event
        .price
        .as_ref()
        .and_then(value_as_f64)
        .ok_or_else(|| AnalyticsError::MalformedEvent(format!("{symbol}: unparsable price")))?;

    let size = event
        .quantity
        .as_ref()
        .and_then(value_as_f64)
        .ok_or_else(|| {
            AnalyticsError::MalformedEvent(format!("{symbol}: unparsable quantity"))
        })?;

    Tick::new(symbol, time, price, size).map(Normalized::Tick)
}

/// Parse and normalise one JSON text frame.
pub fn normalize_json(text: &str) -> Result<Normalized, AnalyticsError> {
    let event = serde_json::from_str::<RawTradeEvent>(text)
        .map_err(|error| AnalyticsError::MalformedEvent(format!("invalid json: {error}")))?;
    normalize(&event)
}

fn value_as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::String(string) => string.trim().parse().ok(),
        _ => None,
    }
}

fn value_as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(number) => number.as_i64(),
        Value::String(string) => string.trim().parse().ok(),
        _ => None,
    }
}
