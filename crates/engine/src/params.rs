//! Parameter spaces and the candidate parameter vectors drawn from them
//!
//! A `ParameterSpace` maps a parameter name to its bounds. The gene type is
//! fixed once when the space is built: two integer bounds make an integer
//! gene, anything else a real gene rounded to 4 decimals.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

/// Decimal places kept on real-valued genes
pub const REAL_DECIMALS: i32 = 4;

pub(crate) fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    let scaled = value * factor;
    if !scaled.is_finite() {
        return value;
    }
    scaled.round() / factor
}

/// Point `t` of the way from `low` to `high`. Finite for any finite bounds,
/// even when `high - low` overflows.
pub(crate) fn lerp(low: f64, high: f64, t: f64) -> f64 {
    low * (1.0 - t) + high * t
}

// ============================================================================
// Values and bounds
// ============================================================================

/// A single gene value
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Int(i64),
    Real(f64),
}

impl ParamValue {
    pub fn as_f64(&self) -> f64 {
        match *self {
            ParamValue::Int(v) => v as f64,
            ParamValue::Real(v) => v,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            ParamValue::Int(v) => Some(v),
            ParamValue::Real(_) => None,
        }
    }
}

impl std::fmt::Display for ParamValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParamValue::Int(v) => write!(f, "{v}"),
            ParamValue::Real(v) => write!(f, "{v:.4}"),
        }
    }
}

/// Inclusive bounds of one parameter, tagged with its gene type
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ParamBounds {
    Integer { low: i64, high: i64 },
    Real { low: f64, high: f64 },
}

impl ParamBounds {
    pub fn integer(low: i64, high: i64) -> Option<Self> {
        (low <= high).then_some(ParamBounds::Integer { low, high })
    }

    pub fn real(low: f64, high: f64) -> Option<Self> {
        (low.is_finite() && high.is_finite() && low <= high)
            .then_some(ParamBounds::Real { low, high })
    }

    /// Parse the `[low, high]` wire shape. Extra entries are ignored; fewer
    /// than two numeric entries is malformed.
    pub fn from_raw(raw: &[serde_json::Value]) -> Option<Self> {
        if raw.len() < 2 {
            return None;
        }
        match (raw[0].as_i64(), raw[1].as_i64()) {
            (Some(low), Some(high)) => Self::integer(low, high),
            _ => Self::real(raw[0].as_f64()?, raw[1].as_f64()?),
        }
    }

    pub fn to_raw(&self) -> Vec<serde_json::Value> {
        match *self {
            ParamBounds::Integer { low, high } => vec![low.into(), high.into()],
            ParamBounds::Real { low, high } => vec![low.into(), high.into()],
        }
    }

    pub fn is_integer(&self) -> bool {
        matches!(self, ParamBounds::Integer { .. })
    }

    /// Uniform draw over the closed interval
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> ParamValue {
        match *self {
            ParamBounds::Integer { low, high } => ParamValue::Int(rng.gen_range(low..=high)),
            ParamBounds::Real { low, high } => {
                let v = if (high - low).is_finite() {
                    rng.gen_range(low..=high)
                } else {
                    lerp(low, high, rng.gen::<f64>())
                };
                ParamValue::Real(round_to(v, REAL_DECIMALS).clamp(low, high))
            }
        }
    }

    /// Clip a raw value into bounds and round it to the gene's precision
    pub fn clip(&self, value: f64) -> ParamValue {
        match *self {
            ParamBounds::Integer { low, high } => {
                let v = value.clamp(low as f64, high as f64).round() as i64;
                ParamValue::Int(v.clamp(low, high))
            }
            ParamBounds::Real { low, high } => {
                let v = round_to(value.clamp(low, high), REAL_DECIMALS);
                ParamValue::Real(v.clamp(low, high))
            }
        }
    }

    /// True when the value has this gene's type and lies inside the bounds
    pub fn contains(&self, value: &ParamValue) -> bool {
        match (*self, *value) {
            (ParamBounds::Integer { low, high }, ParamValue::Int(v)) => (low..=high).contains(&v),
            (ParamBounds::Real { low, high }, ParamValue::Real(v)) => v >= low && v <= high,
            _ => false,
        }
    }
}

// ============================================================================
// Parameter space
// ============================================================================

/// Immutable-per-run mapping `name -> bounds`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(
    from = "BTreeMap<String, Vec<serde_json::Value>>",
    into = "BTreeMap<String, Vec<serde_json::Value>>"
)]
pub struct ParameterSpace {
    params: BTreeMap<String, ParamBounds>,
}

impl ParameterSpace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from the raw `name -> [low, high]` shape, silently dropping
    /// malformed entries.
    pub fn from_raw<I, S>(raw: I) -> Self
    where
        I: IntoIterator<Item = (S, Vec<serde_json::Value>)>,
        S: Into<String>,
    {
        let mut params = BTreeMap::new();
        for (name, bounds) in raw {
            let name = name.into();
            match ParamBounds::from_raw(&bounds) {
                Some(b) => {
                    params.insert(name, b);
                }
                None => debug!(param = %name, ?bounds, "Dropping parameter with malformed bounds"),
            }
        }
        Self { params }
    }

    pub fn with_integer(mut self, name: &str, low: i64, high: i64) -> Self {
        if let Some(b) = ParamBounds::integer(low, high) {
            self.params.insert(name.to_string(), b);
        }
        self
    }

    pub fn with_real(mut self, name: &str, low: f64, high: f64) -> Self {
        if let Some(b) = ParamBounds::real(low, high) {
            self.params.insert(name.to_string(), b);
        }
        self
    }

    pub fn get(&self, name: &str) -> Option<&ParamBounds> {
        self.params.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ParamBounds)> {
        self.params.iter()
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// Draw one individual, each gene uniform over its bounds
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Individual {
        self.params
            .iter()
            .map(|(name, bounds)| (name.clone(), bounds.sample(rng)))
            .collect()
    }

    /// True when every gene of `individual` is in bounds and correctly typed
    pub fn admits(&self, individual: &Individual) -> bool {
        individual.iter().all(|(name, value)| {
            self.params
                .get(name)
                .map(|b| b.contains(value))
                .unwrap_or(false)
        })
    }
}

impl From<BTreeMap<String, Vec<serde_json::Value>>> for ParameterSpace {
    fn from(raw: BTreeMap<String, Vec<serde_json::Value>>) -> Self {
        Self::from_raw(raw)
    }
}

impl From<ParameterSpace> for BTreeMap<String, Vec<serde_json::Value>> {
    fn from(space: ParameterSpace) -> Self {
        space
            .params
            .into_iter()
            .map(|(name, b)| (name, b.to_raw()))
            .collect()
    }
}

/// Draw a random individual from `space`
pub fn random_individual<R: Rng + ?Sized>(space: &ParameterSpace, rng: &mut R) -> Individual {
    space.sample(rng)
}

// ============================================================================
// Individual
// ============================================================================

/// One candidate parameter assignment. A value type: operators always return
/// a new `Individual` rather than editing one in place.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Individual(BTreeMap<String, ParamValue>);

impl Individual {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of `self` with `name` set to `value`
    pub fn with(mut self, name: &str, value: ParamValue) -> Self {
        self.0.insert(name.to_string(), value);
        self
    }

    pub fn get(&self, name: &str) -> Option<ParamValue> {
        self.0.get(name).copied()
    }

    pub fn get_f64(&self, name: &str) -> Option<f64> {
        self.get(name).map(|v| v.as_f64())
    }

    /// Integer genes as `usize`; real or negative values yield `None`
    pub fn get_usize(&self, name: &str) -> Option<usize> {
        self.get(name)?
            .as_i64()
            .and_then(|v| usize::try_from(v).ok())
    }

    pub fn contains_key(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ParamValue)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_default()
    }
}

impl FromIterator<(String, ParamValue)> for Individual {
    fn from_iter<T: IntoIterator<Item = (String, ParamValue)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl std::fmt::Display for Individual {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|(k, v)| format!("{k}={v}")).collect();
        write!(f, "{{{}}}", parts.join(", "))
    }
}
