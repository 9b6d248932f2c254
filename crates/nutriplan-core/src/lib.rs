use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};
use std::iter::Sum;
use std::ops::{Add, AddAssign};

use serde::{Deserialize, Serialize};

pub mod catalog;
pub mod config;
pub mod explain;
pub mod planner;
pub mod rules;

pub use catalog::{
    exclude_allergens, filter_benefit_eligible, filter_by_eligibility, filter_reachable, Benefits,
    Catalog, CatalogEntry, CatalogIndex, EligibilityFilter, NutrientSupply, Potency, Reachability,
    TravelClass,
};
pub use config::{DeficiencyBands, ElevationBands, NutriplanConfig, PlannerConfig, Thresholds};
pub use explain::{Explainer, FoodExplanation, FulfilledBy, NeedTrace, NutrientExplanation};
pub use planner::{
    plan, BudgetLine, BudgetSummary, DeterminismMetadata, PlanWarning, SelectionBasis,
    ShoppingListItem, ShoppingPlan, UnmetNeed, UnmetReason,
};
pub use rules::{
    classify_labs, evaluate, evaluate_with, MarkerReading, MarkerStatus, NeedCandidate, Rule,
    RuleSet, RULESET_VERSION,
};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum NutriplanError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid profile: {0}")]
    InvalidProfile(String),
    #[error("invalid catalog: {0}")]
    InvalidCatalog(String),
}

/// Whole cents. Budget arithmetic never touches floating point.
#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash,
)]
#[serde(transparent)]
pub struct Money(pub u64);

impl Money {
    pub const ZERO: Self = Self(0);

    #[must_use]
    pub fn from_cents(cents: u64) -> Self {
        Self(cents)
    }

    #[must_use]
    pub fn from_dollars(dollars: u64) -> Self {
        Self(dollars.saturating_mul(100))
    }

    #[must_use]
    pub fn cents(self) -> u64 {
        self.0
    }

    #[must_use]
    pub fn saturating_sub(self, rhs: Self) -> Self {
        Self(self.0.saturating_sub(rhs.0))
    }

    #[must_use]
    pub fn is_zero(self) -> bool {
        self.0 == 0
    }
}

impl Display for Money {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "${}.{:02}", self.0 / 100, self.0 % 100)
    }
}

impl Add for Money {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self(self.0.saturating_add(rhs.0))
    }
}

impl AddAssign for Money {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl Sum for Money {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::ZERO, Add::add)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Moderate,
    High,
    Critical,
}

impl Priority {
    #[must_use]
    pub fn rank(self) -> u8 {
        match self {
            Self::Critical => 4,
            Self::High => 3,
            Self::Moderate => 2,
            Self::Low => 1,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Moderate => "moderate",
            Self::Low => "low",
        }
    }

    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Critical => "CRITICAL",
            Self::High => "HIGH",
            Self::Moderate => "MODERATE",
            Self::Low => "LOW",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "critical" => Some(Self::Critical),
            "high" => Some(Self::High),
            "moderate" => Some(Self::Moderate),
            "low" => Some(Self::Low),
            _ => None,
        }
    }
}

impl Display for Priority {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Nutrient {
    Methylfolate,
    VitaminB12,
    VitaminD,
    Iron,
    Omega3,
    AntiInflammatory,
    Magnesium,
    Fiber,
    Antioxidants,
    Chromium,
}

impl Nutrient {
    pub const ALL: [Self; 10] = [
        Self::Methylfolate,
        Self::VitaminB12,
        Self::VitaminD,
        Self::Iron,
        Self::Omega3,
        Self::AntiInflammatory,
        Self::Magnesium,
        Self::Fiber,
        Self::Antioxidants,
        Self::Chromium,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Methylfolate => "methylfolate",
            Self::VitaminB12 => "vitamin_b12",
            Self::VitaminD => "vitamin_d",
            Self::Iron => "iron",
            Self::Omega3 => "omega3",
            Self::AntiInflammatory => "anti_inflammatory",
            Self::Magnesium => "magnesium",
            Self::Fiber => "fiber",
            Self::Antioxidants => "antioxidants",
            Self::Chromium => "chromium",
        }
    }

    #[must_use]
    pub fn display_name(self) -> &'static str {
        match self {
            Self::Methylfolate => "Methylfolate",
            Self::VitaminB12 => "Vitamin B12",
            Self::VitaminD => "Vitamin D",
            Self::Iron => "Iron",
            Self::Omega3 => "Omega-3 Fatty Acids",
            Self::AntiInflammatory => "Anti-inflammatory Foods",
            Self::Magnesium => "Magnesium",
            Self::Fiber => "Fiber",
            Self::Antioxidants => "Antioxidants",
            Self::Chromium => "Chromium",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        let normalized = normalize_term(value);
        Self::ALL.into_iter().find(|nutrient| nutrient.as_str() == normalized)
    }

    /// Resolve free text typed by a user: an id, a display name, or a fragment of either.
    #[must_use]
    pub fn resolve(value: &str) -> Option<Self> {
        let normalized = normalize_term(value);
        if normalized.is_empty() {
            return None;
        }

        if let Some(exact) = Self::ALL.into_iter().find(|nutrient| {
            nutrient.as_str() == normalized || normalize_term(nutrient.display_name()) == normalized
        }) {
            return Some(exact);
        }

        Self::ALL.into_iter().find(|nutrient| {
            nutrient.as_str().contains(&normalized)
                || normalize_term(nutrient.display_name()).contains(&normalized)
        })
    }
}

impl Display for Nutrient {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.display_name())
    }
}

/// Lowercase, trimmed, with spaces and hyphens folded to underscores.
#[must_use]
pub fn normalize_term(value: &str) -> String {
    value
        .trim()
        .chars()
        .map(|ch| match ch {
            ' ' | '-' => '_',
            other => other.to_ascii_lowercase(),
        })
        .collect()
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum IncomeTier {
    VeryLow,
    Low,
    Moderate,
    Comfortable,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BudgetTier {
    VeryLow,
    Low,
    Moderate,
    Comfortable,
}

impl BudgetTier {
    #[must_use]
    pub fn for_budget(weekly_budget: Money) -> Self {
        match weekly_budget.cents() {
            0..=4_999 => Self::VeryLow,
            5_000..=9_999 => Self::Low,
            10_000..=19_999 => Self::Moderate,
            _ => Self::Comfortable,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::VeryLow => "very_low",
            Self::Low => "low",
            Self::Moderate => "moderate",
            Self::Comfortable => "comfortable",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum Mobility {
    High,
    Moderate,
    Limited,
}

impl Mobility {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Moderate => "moderate",
            Self::Limited => "limited",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Financials {
    #[serde(rename = "weekly_budget_cents")]
    pub weekly_budget: Money,
    #[serde(default)]
    pub snap: bool,
    #[serde(default)]
    pub wic: bool,
    #[serde(default)]
    pub income_tier: Option<IncomeTier>,
}

fn default_trips_per_week() -> u8 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Logistics {
    pub zip_code: String,
    #[serde(default)]
    pub has_vehicle: bool,
    #[serde(default)]
    pub has_public_transit: bool,
    #[serde(default = "default_trips_per_week")]
    pub trips_per_week: u8,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct MedicalHistory {
    #[serde(default)]
    pub family_history: BTreeSet<String>,
    #[serde(default)]
    pub current_symptoms: BTreeSet<String>,
    #[serde(default)]
    pub prior_conditions: BTreeSet<String>,
    #[serde(default)]
    pub allergies: BTreeSet<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum LabValue {
    Numeric(f64),
    Variant(String),
}

impl LabValue {
    /// Numeric reading, accepting numbers written as strings. Non-finite values read as absent.
    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        let value = match self {
            Self::Numeric(value) => *value,
            Self::Variant(raw) => raw.trim().parse::<f64>().ok()?,
        };
        value.is_finite().then_some(value)
    }

    #[must_use]
    pub fn as_variant(&self) -> Option<&str> {
        match self {
            Self::Variant(raw) if !raw.trim().is_empty() => Some(raw.trim()),
            _ => None,
        }
    }
}

impl Display for LabValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Numeric(value) => write!(f, "{value}"),
            Self::Variant(raw) => f.write_str(raw),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserProfile {
    pub profile_id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    pub financials: Financials,
    pub logistics: Logistics,
    #[serde(default)]
    pub medical: MedicalHistory,
    #[serde(default)]
    pub labs: BTreeMap<String, LabValue>,
}

impl UserProfile {
    /// Validate a collected profile before it enters the pipeline.
    ///
    /// # Errors
    /// Returns [`NutriplanError::InvalidProfile`] when identity, location, trip frequency,
    /// medical history entries, or lab values are malformed.
    pub fn validate(&self) -> Result<(), NutriplanError> {
        if self.profile_id.trim().is_empty() {
            return Err(NutriplanError::InvalidProfile(
                "profile_id MUST be provided".to_string(),
            ));
        }

        let zip = self.logistics.zip_code.trim();
        if zip.len() != 5 || !zip.chars().all(|ch| ch.is_ascii_digit()) {
            return Err(NutriplanError::InvalidProfile(format!(
                "zip_code MUST be a 5-digit ZIP code (received: {:?})",
                self.logistics.zip_code
            )));
        }

        if !(1..=7).contains(&self.logistics.trips_per_week) {
            return Err(NutriplanError::InvalidProfile(
                "trips_per_week MUST be in [1, 7]".to_string(),
            ));
        }

        let medical = &self.medical;
        for entry in medical
            .family_history
            .iter()
            .chain(&medical.current_symptoms)
            .chain(&medical.prior_conditions)
            .chain(&medical.allergies)
        {
            if entry.trim().is_empty() {
                return Err(NutriplanError::InvalidProfile(
                    "medical history entries MUST be non-empty".to_string(),
                ));
            }
        }

        for (marker, value) in &self.labs {
            if marker.trim().is_empty() {
                return Err(NutriplanError::InvalidProfile(
                    "lab marker names MUST be non-empty".to_string(),
                ));
            }
            if let LabValue::Numeric(number) = value {
                if !number.is_finite() || *number < 0.0 {
                    return Err(NutriplanError::InvalidProfile(format!(
                        "lab value for `{marker}` MUST be a finite, non-negative number"
                    )));
                }
            }
        }

        Ok(())
    }

    #[must_use]
    pub fn budget_tier(&self) -> BudgetTier {
        BudgetTier::for_budget(self.financials.weekly_budget)
    }

    #[must_use]
    pub fn has_benefits(&self) -> bool {
        self.financials.snap || self.financials.wic
    }

    #[must_use]
    pub fn benefits(&self) -> Benefits {
        Benefits { snap: self.financials.snap, wic: self.financials.wic }
    }

    #[must_use]
    pub fn mobility(&self) -> Mobility {
        if self.logistics.has_vehicle {
            Mobility::High
        } else if self.logistics.has_public_transit {
            Mobility::Moderate
        } else {
            Mobility::Limited
        }
    }

    /// Find a lab reading by normalized marker name, returning the key as written in the profile.
    #[must_use]
    pub fn lab(&self, marker: &str) -> Option<(&str, &LabValue)> {
        let wanted = normalize_term(marker);
        self.labs
            .iter()
            .find(|(key, _)| normalize_term(key) == wanted)
            .map(|(key, value)| (key.as_str(), value))
    }

    /// Whether `fact` is literally present in this profile.
    #[must_use]
    pub fn contains_fact(&self, fact: &ProfileFact) -> bool {
        match fact {
            ProfileFact::LabValue { marker, value, .. } => self
                .labs
                .get(marker)
                .and_then(LabValue::as_f64)
                .is_some_and(|recorded| recorded.to_bits() == value.to_bits()),
            ProfileFact::Variant { marker, variant } => self
                .labs
                .get(marker)
                .and_then(LabValue::as_variant)
                .is_some_and(|recorded| recorded.eq_ignore_ascii_case(variant)),
            ProfileFact::Symptom { symptom } => self.medical.current_symptoms.contains(symptom),
            ProfileFact::FamilyHistory { condition } => {
                self.medical.family_history.contains(condition)
            }
            ProfileFact::PriorCondition { condition } => {
                self.medical.prior_conditions.contains(condition)
            }
        }
    }
}

/// One concrete input from a [`UserProfile`] cited as the reason a rule fired.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProfileFact {
    LabValue { marker: String, value: f64, unit: Option<String> },
    Variant { marker: String, variant: String },
    Symptom { symptom: String },
    FamilyHistory { condition: String },
    PriorCondition { condition: String },
}

impl ProfileFact {
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::LabValue { marker, value, unit: Some(unit) } => {
                format!("lab {marker} = {value} {unit}")
            }
            Self::LabValue { marker, value, unit: None } => format!("lab {marker} = {value}"),
            Self::Variant { marker, variant } => {
                format!("{} variant {variant}", marker.to_ascii_uppercase())
            }
            Self::Symptom { symptom } => format!("symptom: {symptom}"),
            Self::FamilyHistory { condition } => format!("family history: {condition}"),
            Self::PriorCondition { condition } => format!("prior condition: {condition}"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RuleCategory {
    Genetic,
    LabThreshold,
    Inflammation,
    Metabolic,
    Symptom,
    PriorCondition,
    FamilyHistory,
}

impl RuleCategory {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Genetic => "genetic",
            Self::LabThreshold => "lab_threshold",
            Self::Inflammation => "inflammation",
            Self::Metabolic => "metabolic",
            Self::Symptom => "symptom",
            Self::PriorCondition => "prior_condition",
            Self::FamilyHistory => "family_history",
        }
    }

    /// Self-reported categories. Needs backed only by these are capped at MODERATE.
    #[must_use]
    pub fn is_low_confidence(self) -> bool {
        matches!(self, Self::Symptom | Self::PriorCondition | Self::FamilyHistory)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Justification {
    pub rule_id: String,
    pub category: RuleCategory,
    pub priority: Priority,
    pub statement: String,
    pub facts: Vec<ProfileFact>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NutrientNeed {
    pub nutrient: Nutrient,
    pub priority: Priority,
    pub justification: Vec<Justification>,
    pub related_markers: Vec<String>,
}

impl NutrientNeed {
    /// Priority descending, then nutrient id ascending.
    #[must_use]
    pub fn precedence(lhs: &Self, rhs: &Self) -> Ordering {
        rhs.priority
            .cmp(&lhs.priority)
            .then_with(|| lhs.nutrient.as_str().cmp(rhs.nutrient.as_str()))
    }

    #[must_use]
    pub fn facts(&self) -> Vec<&ProfileFact> {
        self.justification.iter().flat_map(|entry| entry.facts.iter()).collect()
    }

    #[must_use]
    pub fn summary(&self) -> String {
        self.justification
            .first()
            .map_or_else(String::new, |first| first.statement.clone())
    }
}

#[must_use]
pub fn default_need_tie_breakers() -> Vec<String> {
    vec!["priority desc".to_string(), "nutrient_id asc".to_string()]
}
