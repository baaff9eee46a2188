mod duration;

use std::time::Duration;

use rand::Rng;
use thiserror::Error;

pub use duration::{format_duration, parse_duration};

pub const DEFAULT_MIN: Duration = Duration::from_millis(50);
pub const DEFAULT_MAX: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LatencyError {
    #[error("invalid duration {input:?}: {reason}")]
    InvalidDuration { input: String, reason: &'static str },
    #[error("negative duration {0:?} is not allowed")]
    NegativeDuration(String),
    #[error("failed to parse {bound} duration: {source}")]
    InvalidBound {
        bound: &'static str,
        source: Box<LatencyError>,
    },
    #[error("invalid pdf pair {0:?}, expected duration:weight")]
    InvalidPair(String),
    #[error("failed to parse duration in pdf: {0}")]
    InvalidPairDuration(Box<LatencyError>),
    #[error("failed to parse probability in pdf: {0:?}")]
    InvalidWeight(String),
    #[error("probability {0:?} in pdf must not be negative")]
    NegativeWeight(String),
    #[error("total probability in pdf must be greater than 0")]
    NonPositiveTotal,
    #[error("pdf must contain at least one duration:weight pair")]
    EmptyDistribution,
}

/// Discrete distribution over durations, normalized into a cumulative table in
/// the order the entries were given.
#[derive(Debug, Clone, PartialEq)]
pub struct Distribution {
    values: Vec<Duration>,
    cumulative: Vec<f64>,
}

impl Distribution {
    pub fn new(entries: Vec<(Duration, f64)>) -> Result<Self, LatencyError> {
        if entries.is_empty() {
            return Err(LatencyError::EmptyDistribution);
        }
        for (_, weight) in &entries {
            if !weight.is_finite() {
                return Err(LatencyError::InvalidWeight(weight.to_string()));
            }
            if *weight < 0.0 {
                return Err(LatencyError::NegativeWeight(weight.to_string()));
            }
        }

        let total: f64 = entries.iter().map(|(_, weight)| weight).sum();
        if !(total > 0.0 && total.is_finite()) {
            return Err(LatencyError::NonPositiveTotal);
        }

        let mut values = Vec::with_capacity(entries.len());
        let mut cumulative = Vec::with_capacity(entries.len());
        let mut running = 0.0_f64;
        for (value, weight) in entries {
            running += weight / total;
            values.push(value);
            cumulative.push(running);
        }
        Ok(Self { values, cumulative })
    }

    /// Parses `duration:weight` pairs separated by commas, e.g.
    /// `50ms:0.9,500ms:0.1`.
    pub fn parse(pdf: &str) -> Result<Self, LatencyError> {
        let mut entries = Vec::new();
        for pair in pdf.split(',') {
            let Some((duration, weight)) = pair.split_once(':') else {
                return Err(LatencyError::InvalidPair(pair.to_string()));
            };
            let duration = parse_duration(duration.trim())
                .map_err(|err| LatencyError::InvalidPairDuration(Box::new(err)))?;
            let weight = weight.trim();
            let parsed: f64 = weight
                .parse()
                .map_err(|_| LatencyError::InvalidWeight(weight.to_string()))?;
            entries.push((duration, parsed));
        }
        Self::new(entries)
    }

    pub fn values(&self) -> &[Duration] {
        &self.values
    }

    pub fn cumulative(&self) -> &[f64] {
        &self.cumulative
    }

    /// Inverse-transform lookup: the first entry whose cumulative probability
    /// reaches `r`, or the last entry when rounding left every bucket short.
    pub fn select(&self, r: f64) -> Duration {
        self.cumulative
            .iter()
            .position(|cdf| *cdf >= r)
            .and_then(|index| self.values.get(index))
            .or_else(|| self.values.last())
            .copied()
            .unwrap_or(Duration::ZERO)
    }

    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        self.select(rng.gen_range(0.0..1.0))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LatencySpec {
    Uniform { lo: Duration, hi: Duration },
    Weighted(Distribution),
}

impl Default for LatencySpec {
    fn default() -> Self {
        Self::Uniform {
            lo: DEFAULT_MIN,
            hi: DEFAULT_MAX,
        }
    }
}

impl LatencySpec {
    /// Builds a sampler from the raw `min`, `max` and `pdf` query values. A
    /// non-empty `pdf` takes precedence; empty bounds fall back to the defaults.
    pub fn from_params(
        min: Option<&str>,
        max: Option<&str>,
        pdf: Option<&str>,
    ) -> Result<Self, LatencyError> {
        if let Some(pdf) = pdf.filter(|pdf| !pdf.is_empty()) {
            return Distribution::parse(pdf).map(Self::Weighted);
        }
        let lo = parse_bound("min", min, DEFAULT_MIN)?;
        let hi = parse_bound("max", max, DEFAULT_MAX)?;
        Ok(Self::Uniform { lo, hi })
    }

    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        match self {
            Self::Uniform { lo, hi } => {
                if hi <= lo {
                    return *lo;
                }
                let span = (*hi - *lo).as_nanos().min(u64::MAX as u128) as u64;
                *lo + Duration::from_nanos(rng.gen_range(0..=span))
            }
            Self::Weighted(distribution) => distribution.sample(rng),
        }
    }
}

fn parse_bound(
    bound: &'static str,
    raw: Option<&str>,
    default: Duration,
) -> Result<Duration, LatencyError> {
    match raw.filter(|raw| !raw.is_empty()) {
        Some(raw) => parse_duration(raw).map_err(|err| LatencyError::InvalidBound {
            bound,
            source: Box::new(err),
        }),
        None => Ok(default),
    }
}
