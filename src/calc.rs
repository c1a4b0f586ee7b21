use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use thiserror::Error;

/// How the three recorded components turn into a percentage.
///
/// Schools disagree on whether `test1`, `test2` and `exam` are raw scores out
/// of 100 or marks that already carry their weight, so both readings are
/// selectable per workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GradingPolicy {
    /// Each component out of 100; percentage = total / 300 * 100.
    RawSum,
    /// Each component out of 100; percentage blends them by weight.
    Weighted,
    /// Components are capped at their weights; total is the percentage.
    Direct,
}

impl GradingPolicy {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "raw_sum" => Some(Self::RawSum),
            "weighted" => Some(Self::Weighted),
            "direct" => Some(Self::Direct),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::RawSum => "raw_sum",
            Self::Weighted => "weighted",
            Self::Direct => "direct",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentWeights {
    pub test1: f64,
    pub test2: f64,
    pub exam: f64,
}

impl Default for ComponentWeights {
    fn default() -> Self {
        Self {
            test1: 20.0,
            test2: 20.0,
            exam: 60.0,
        }
    }
}

impl ComponentWeights {
    pub fn validate(&self) -> Result<(), GradingError> {
        for w in [self.test1, self.test2, self.exam] {
            if !w.is_finite() || w < 0.0 {
                return Err(GradingError::NegativeWeight);
            }
        }
        let sum = self.test1 + self.test2 + self.exam;
        if (sum - 100.0).abs() > 1e-9 {
            return Err(GradingError::WeightsSum(sum));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct GradingConfig {
    pub policy: GradingPolicy,
    pub weights: ComponentWeights,
}

impl Default for GradingPolicy {
    fn default() -> Self {
        Self::RawSum
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Scores {
    pub test1: f64,
    pub test2: f64,
    pub exam: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Grade {
    A,
    B,
    C,
    D,
    E,
    F,
}

impl Grade {
    /// A≥80, B≥70, C≥60, D≥50, E≥40, otherwise F.
    pub fn from_percentage(percentage: f64) -> Self {
        if percentage >= 80.0 {
            Grade::A
        } else if percentage >= 70.0 {
            Grade::B
        } else if percentage >= 60.0 {
            Grade::C
        } else if percentage >= 50.0 {
            Grade::D
        } else if percentage >= 40.0 {
            Grade::E
        } else {
            Grade::F
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "A" | "a" => Some(Grade::A),
            "B" | "b" => Some(Grade::B),
            "C" | "c" => Some(Grade::C),
            "D" | "d" => Some(Grade::D),
            "E" | "e" => Some(Grade::E),
            "F" | "f" => Some(Grade::F),
            _ => None,
        }
    }

    pub fn letter(self) -> &'static str {
        match self {
            Grade::A => "A",
            Grade::B => "B",
            Grade::C => "C",
            Grade::D => "D",
            Grade::E => "E",
            Grade::F => "F",
        }
    }

    pub fn remark(self) -> &'static str {
        match self {
            Grade::A => "Excellent",
            Grade::B => "Very Good",
            Grade::C => "Good",
            Grade::D => "Fair",
            Grade::E => "Pass",
            Grade::F => "Fail",
        }
    }
}

impl fmt::Display for Grade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.letter())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ComputedResult {
    pub total: f64,
    pub percentage: f64,
    pub grade: Grade,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum GradingError {
    #[error("{field} must be a finite number")]
    NotFinite { field: &'static str },
    #[error("{field} must be between 0 and {max}, got {value}")]
    OutOfRange {
        field: &'static str,
        value: f64,
        max: f64,
    },
    #[error("component weights must sum to 100, got {0}")]
    WeightsSum(f64),
    #[error("component weights must be non-negative numbers")]
    NegativeWeight,
}

/// Half-up rounding to one decimal: `floor(10*x + 0.5) / 10`.
pub fn round_off_1_decimal(x: f64) -> f64 {
    ((10.0 * x) + 0.5).floor() / 10.0
}

/// Upper bound for each component under `config`.
pub fn component_caps(config: &GradingConfig) -> [f64; 3] {
    match config.policy {
        GradingPolicy::RawSum | GradingPolicy::Weighted => [100.0, 100.0, 100.0],
        GradingPolicy::Direct => [
            config.weights.test1,
            config.weights.test2,
            config.weights.exam,
        ],
    }
}

fn check_component(field: &'static str, value: f64, max: f64) -> Result<(), GradingError> {
    if !value.is_finite() {
        return Err(GradingError::NotFinite { field });
    }
    if value < 0.0 || value > max {
        return Err(GradingError::OutOfRange { field, value, max });
    }
    Ok(())
}

pub fn compute_result(scores: Scores, config: &GradingConfig) -> Result<ComputedResult, GradingError> {
    if config.policy != GradingPolicy::RawSum {
        config.weights.validate()?;
    }
    let [cap1, cap2, cap3] = component_caps(config);
    check_component("test1", scores.test1, cap1)?;
    check_component("test2", scores.test2, cap2)?;
    check_component("exam", scores.exam, cap3)?;

    let total = scores.test1 + scores.test2 + scores.exam;
    let raw_percentage = match config.policy {
        GradingPolicy::RawSum => total / 300.0 * 100.0,
        GradingPolicy::Weighted => {
            let w = &config.weights;
            (w.test1 * scores.test1 + w.test2 * scores.test2 + w.exam * scores.exam) / 100.0
        }
        GradingPolicy::Direct => total,
    };
    let percentage = round_off_1_decimal(raw_percentage);

    Ok(ComputedResult {
        total,
        percentage,
        grade: Grade::from_percentage(percentage),
    })
}

pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

/// Competition ranking ("1224"): equal values share a position and the next
/// position skips by the size of the tie. Higher values rank first.
pub fn competition_ranks(values: &[f64]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|&a, &b| {
        values[b]
            .partial_cmp(&values[a])
            .unwrap_or(Ordering::Equal)
    });

    let mut ranks = vec![0usize; values.len()];
    for (pos, &idx) in order.iter().enumerate() {
        if pos > 0 {
            let prev = order[pos - 1];
            if values[prev] == values[idx] {
                ranks[idx] = ranks[prev];
                continue;
            }
        }
        ranks[idx] = pos + 1;
    }
    ranks
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpreadStats {
    pub count: usize,
    pub average: f64,
    pub highest: f64,
    pub lowest: f64,
}

pub fn spread(values: &[f64]) -> Option<SpreadStats> {
    let average = mean(values)?;
    let highest = values.iter().copied().fold(f64::MIN, f64::max);
    let lowest = values.iter().copied().fold(f64::MAX, f64::min);
    Some(SpreadStats {
        count: values.len(),
        average: round_off_1_decimal(average),
        highest,
        lowest,
    })
}

pub fn ordinal(n: usize) -> String {
    let suffix = match (n % 10, n % 100) {
        (_, 11..=13) => "th",
        (1, _) => "st",
        (2, _) => "nd",
        (3, _) => "rd",
        _ => "th",
    };
    format!("{}{}", n, suffix)
}
