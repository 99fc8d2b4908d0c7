//! Config space definitions: searched parameter domains plus fixed fields.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

use xfer_types::SpaceError;

/// A single searched parameter dimension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterDef {
    /// Parameter name (e.g. "max_concurrency").
    pub name: String,
    /// The kind of search range.
    pub kind: ParameterKind,
}

/// Describes how a parameter is sampled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ParameterKind {
    /// Integer range [low, high] inclusive, uniform prior.
    IntRange { low: i64, high: i64 },
    /// Integer range [low, high] inclusive whose logarithm is uniform.
    LogIntRange { low: i64, high: i64 },
    /// Categorical choices.
    Choice { values: Vec<serde_json::Value> },
}

impl ParameterKind {
    fn check_definition(&self, name: &str) -> Result<(), SpaceError> {
        let invalid = |message: &str| SpaceError::InvalidDomain {
            name: name.to_string(),
            message: message.to_string(),
        };
        match self {
            Self::IntRange { low, high } if low > high => Err(invalid("low exceeds high")),
            Self::LogIntRange { low, high } if low > high => Err(invalid("low exceeds high")),
            Self::LogIntRange { low, .. } if *low < 1 => {
                Err(invalid("log-scaled range needs low >= 1"))
            }
            Self::Choice { values } if values.is_empty() => Err(invalid("no choices")),
            _ => Ok(()),
        }
    }

    fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> ParameterValue {
        match self {
            Self::IntRange { low, high } => ParameterValue::Int(rng.gen_range(*low..=*high)),
            Self::LogIntRange { low, high } => {
                // floor(exp(u)) for u ~ U[ln low, ln(high + 1)) puts mass
                // ln((k + 1) / k) on every integer k of the range.
                let log_low = (*low as f64).ln();
                let log_high = ((*high as f64) + 1.0).ln();
                let log_val: f64 = rng.gen_range(log_low..log_high);
                ParameterValue::Int((log_val.exp().floor() as i64).clamp(*low, *high))
            }
            Self::Choice { values } => {
                let idx = rng.gen_range(0..values.len());
                ParameterValue::Json(values[idx].clone())
            }
        }
    }

    fn check_value(&self, name: &str, value: &ParameterValue) -> Result<(), SpaceError> {
        match self {
            Self::IntRange { low, high } | Self::LogIntRange { low, high } => {
                let v = value.as_int().ok_or_else(|| SpaceError::TypeMismatch {
                    name: name.to_string(),
                    expected: "integer".to_string(),
                })?;
                if v < *low || v > *high {
                    return Err(SpaceError::OutOfBounds {
                        name: name.to_string(),
                        value: v,
                        low: *low,
                        high: *high,
                    });
                }
                Ok(())
            }
            Self::Choice { values } => {
                let json = value.to_json();
                if values.contains(&json) {
                    Ok(())
                } else {
                    Err(SpaceError::NotAChoice {
                        name: name.to_string(),
                        value: json.to_string(),
                    })
                }
            }
        }
    }
}

/// A concrete parameter value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterValue {
    Int(i64),
    Json(serde_json::Value),
}

impl ParameterValue {
    /// Integer view of the value, if it holds one.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            Self::Json(v) => v.as_i64(),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Int(v) => serde_json::Value::from(*v),
            Self::Json(v) => v.clone(),
        }
    }
}

impl fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::Json(serde_json::Value::String(s)) => write!(f, "{s}"),
            Self::Json(v) => write!(f, "{v}"),
        }
    }
}

impl From<i64> for ParameterValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<&str> for ParameterValue {
    fn from(value: &str) -> Self {
        Self::Json(serde_json::Value::String(value.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// A fully resolved configuration: fixed fields plus searched fields.
///
/// Immutable once built; [`Configuration::with`] returns a modified copy.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Configuration(BTreeMap<String, ParameterValue>);

impl Configuration {
    pub fn from_map(values: BTreeMap<String, ParameterValue>) -> Self {
        Self(values)
    }

    pub fn get(&self, name: &str) -> Option<&ParameterValue> {
        self.0.get(name)
    }

    pub fn get_int(&self, name: &str) -> Option<i64> {
        self.0.get(name).and_then(ParameterValue::as_int)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ParameterValue)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Copy of this configuration with one value replaced.
    pub fn with(&self, name: impl Into<String>, value: ParameterValue) -> Self {
        let mut values = self.0.clone();
        values.insert(name.into(), value);
        Self(values)
    }
}

impl fmt::Display for Configuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (name, value) in &self.0 {
            if !first {
                write!(f, ", ")?;
            }
            write!(f, "{name}={value}")?;
            first = false;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Config space
// ---------------------------------------------------------------------------

/// The full config space: searched parameter definitions plus fixed fields
/// carried through every configuration unchanged.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ConfigSpace {
    pub parameters: Vec<ParameterDef>,
    #[serde(default)]
    pub fixed: BTreeMap<String, ParameterValue>,
}

impl ConfigSpace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_int(mut self, name: impl Into<String>, low: i64, high: i64) -> Self {
        self.parameters.push(ParameterDef {
            name: name.into(),
            kind: ParameterKind::IntRange { low, high },
        });
        self
    }

    pub fn add_log_int(mut self, name: impl Into<String>, low: i64, high: i64) -> Self {
        self.parameters.push(ParameterDef {
            name: name.into(),
            kind: ParameterKind::LogIntRange { low, high },
        });
        self
    }

    pub fn add_choice(mut self, name: impl Into<String>, values: Vec<serde_json::Value>) -> Self {
        self.parameters.push(ParameterDef {
            name: name.into(),
            kind: ParameterKind::Choice { values },
        });
        self
    }

    pub fn fix(mut self, name: impl Into<String>, value: impl Into<ParameterValue>) -> Self {
        self.fixed.insert(name.into(), value.into());
        self
    }

    pub fn parameter(&self, name: &str) -> Option<&ParameterDef> {
        self.parameters.iter().find(|p| p.name == name)
    }

    /// Check the definition itself: ordered bounds, positive log bounds,
    /// non-empty choices and unique names across searched and fixed fields.
    pub fn validate_definition(&self) -> Result<(), SpaceError> {
        let mut seen = HashSet::new();
        for param in &self.parameters {
            if !seen.insert(param.name.as_str()) || self.fixed.contains_key(&param.name) {
                return Err(SpaceError::DuplicateName {
                    name: param.name.clone(),
                });
            }
            param.kind.check_definition(&param.name)?;
        }
        Ok(())
    }

    /// Draw a configuration from the domain priors.
    pub fn sample_default<R: Rng + ?Sized>(&self, rng: &mut R) -> Configuration {
        let mut values = self.fixed.clone();
        for param in &self.parameters {
            values.insert(param.name.clone(), param.kind.sample(rng));
        }
        Configuration(values)
    }

    /// Draw a single searched parameter from its prior.
    pub fn sample_parameter<R: Rng + ?Sized>(
        &self,
        name: &str,
        rng: &mut R,
    ) -> Option<ParameterValue> {
        self.parameter(name).map(|p| p.kind.sample(rng))
    }

    pub fn validate(&self, config: &Configuration) -> bool {
        self.check(config).is_ok()
    }

    /// Like [`ConfigSpace::validate`] but reports the first violation.
    pub fn check(&self, config: &Configuration) -> Result<(), SpaceError> {
        for (name, expected) in &self.fixed {
            match config.get(name) {
                Some(actual) if actual.to_json() == expected.to_json() => {}
                Some(_) => {
                    return Err(SpaceError::FixedFieldChanged { name: name.clone() });
                }
                None => return Err(SpaceError::MissingParameter { name: name.clone() }),
            }
        }
        for param in &self.parameters {
            let value = config
                .get(&param.name)
                .ok_or_else(|| SpaceError::MissingParameter {
                    name: param.name.clone(),
                })?;
            param.kind.check_value(&param.name, value)?;
        }
        for (name, _) in config.iter() {
            if !self.fixed.contains_key(name) && self.parameter(name).is_none() {
                return Err(SpaceError::UnknownParameter { name: name.clone() });
            }
        }
        Ok(())
    }

    /// Build a configuration from searched values only, merging in the fixed
    /// fields, and check it against the space.
    pub fn resolve(
        &self,
        searched: &HashMap<String, ParameterValue>,
    ) -> Result<Configuration, SpaceError> {
        let mut values = self.fixed.clone();
        for (name, value) in searched {
            values.insert(name.clone(), value.clone());
        }
        let config = Configuration(values);
        self.check(&config)?;
        Ok(config)
    }
}
