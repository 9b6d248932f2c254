use serde::{Deserialize, Serialize};

use crate::Money;

/// Readings below `severe_below` or `low_below` mark a deficiency.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeficiencyBands {
    pub unit: String,
    #[serde(default)]
    pub severe_below: Option<f64>,
    #[serde(default)]
    pub low_below: Option<f64>,
}

impl DeficiencyBands {
    fn new(unit: &str, severe_below: Option<f64>, low_below: Option<f64>) -> Self {
        Self { unit: unit.to_string(), severe_below, low_below }
    }

    #[must_use]
    pub fn is_severe(&self, value: f64) -> bool {
        self.severe_below.is_some_and(|limit| value < limit)
    }

    #[must_use]
    pub fn is_low(&self, value: f64) -> bool {
        self.low_below.is_some_and(|limit| value < limit)
    }
}

/// Readings strictly above `elevated_above` are elevated. Readings above `high_bound` are high,
/// or at and above it when `high_inclusive` is set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ElevationBands {
    pub unit: String,
    pub elevated_above: f64,
    pub high_bound: f64,
    #[serde(default)]
    pub high_inclusive: bool,
}

impl ElevationBands {
    fn strict(unit: &str, elevated_above: f64, high_above: f64) -> Self {
        Self {
            unit: unit.to_string(),
            elevated_above,
            high_bound: high_above,
            high_inclusive: false,
        }
    }

    fn inclusive(unit: &str, elevated_above: f64, high_from: f64) -> Self {
        Self {
            unit: unit.to_string(),
            elevated_above,
            high_bound: high_from,
            high_inclusive: true,
        }
    }

    #[must_use]
    pub fn is_elevated(&self, value: f64) -> bool {
        value > self.elevated_above
    }

    #[must_use]
    pub fn is_high(&self, value: f64) -> bool {
        if self.high_inclusive {
            value >= self.high_bound
        } else {
            value > self.high_bound
        }
    }
}

/// Reference ranges the rule engine compares lab readings against.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Thresholds {
    pub vitamin_b12: DeficiencyBands,
    pub vitamin_d: DeficiencyBands,
    pub iron: DeficiencyBands,
    pub ferritin: DeficiencyBands,
    pub omega3_index: DeficiencyBands,
    pub crp: ElevationBands,
    pub homocysteine: ElevationBands,
    pub glucose_fasting: ElevationBands,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            vitamin_b12: DeficiencyBands::new("pg/mL", Some(300.0), Some(500.0)),
            vitamin_d: DeficiencyBands::new("ng/mL", Some(20.0), Some(40.0)),
            iron: DeficiencyBands::new("mcg/dL", Some(60.0), None),
            ferritin: DeficiencyBands::new("ng/mL", None, Some(30.0)),
            omega3_index: DeficiencyBands::new("%", None, Some(4.0)),
            crp: ElevationBands::strict("mg/L", 3.0, 10.0),
            homocysteine: ElevationBands::strict("umol/L", 12.0, 15.0),
            glucose_fasting: ElevationBands::inclusive("mg/dL", 100.0, 125.0),
        }
    }
}

fn default_low_budget_threshold() -> Money {
    Money::from_dollars(100)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlannerConfig {
    /// Below this remaining budget a reachable pantry source wins over any priced one.
    #[serde(rename = "low_budget_threshold_cents", default = "default_low_budget_threshold")]
    pub low_budget_threshold: Money,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self { low_budget_threshold: default_low_budget_threshold() }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NutriplanConfig {
    pub thresholds: Thresholds,
    pub planner: PlannerConfig,
}
