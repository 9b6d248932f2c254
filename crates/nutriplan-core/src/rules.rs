use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Debug, Formatter};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::{DeficiencyBands, ElevationBands, Thresholds};
use crate::{
    normalize_term, Justification, LabValue, Nutrient, NutrientNeed, Priority, ProfileFact,
    RuleCategory, UserProfile,
};

pub const RULESET_VERSION: &str = "rules.v1";

const STRESS_SYMPTOMS: [&str; 4] = ["anxiety", "insomnia", "stress", "irritability"];

/// One rule's contribution before candidates for the same nutrient are merged.
#[derive(Debug, Clone, PartialEq)]
pub struct NeedCandidate {
    pub nutrient: Nutrient,
    pub justification: Justification,
    pub related_markers: Vec<String>,
}

pub trait Rule: Send + Sync {
    fn id(&self) -> &'static str;

    fn category(&self) -> RuleCategory;

    /// Returns `None` when the rule does not fire. Missing or unparsable inputs never fire.
    fn evaluate(&self, profile: &UserProfile, thresholds: &Thresholds) -> Option<NeedCandidate>;
}

fn fill(template: &str, values: &[(&str, &str)]) -> String {
    values.iter().fold(template.to_string(), |text, (key, value)| {
        text.replace(&format!("{{{key}}}"), value)
    })
}

fn candidate(
    rule: &dyn Rule,
    nutrient: Nutrient,
    priority: Priority,
    statement: String,
    facts: Vec<ProfileFact>,
    markers: &[&str],
) -> NeedCandidate {
    NeedCandidate {
        nutrient,
        justification: Justification {
            rule_id: rule.id().to_string(),
            category: rule.category(),
            priority,
            statement,
            facts,
        },
        related_markers: markers.iter().map(|marker| (*marker).to_string()).collect(),
    }
}

fn numeric_lab<'a>(profile: &'a UserProfile, marker: &str) -> Option<(&'a str, f64)> {
    let (key, reading) = profile.lab(marker)?;
    if let Some(value) = reading.as_f64() {
        Some((key, value))
    } else {
        warn!(marker = key, value = %reading, "skipping non-numeric lab value");
        None
    }
}

/// Fires when a genetic marker reports one of the listed variants.
pub struct VariantRule {
    pub id: &'static str,
    pub marker: &'static str,
    pub variants: &'static [&'static str],
    pub nutrient: Nutrient,
    pub priority: Priority,
    pub statement: &'static str,
}

impl Rule for VariantRule {
    fn id(&self) -> &'static str {
        self.id
    }

    fn category(&self) -> RuleCategory {
        RuleCategory::Genetic
    }

    fn evaluate(&self, profile: &UserProfile, _thresholds: &Thresholds) -> Option<NeedCandidate> {
        let (key, reading) = profile.lab(self.marker)?;
        let variant = reading.as_variant()?;
        let normalized = normalize_term(variant);
        if !self.variants.iter().any(|known| normalize_term(known) == normalized) {
            return None;
        }

        Some(candidate(
            self,
            self.nutrient,
            self.priority,
            fill(self.statement, &[("variant", variant.to_ascii_uppercase().as_str())]),
            vec![ProfileFact::Variant { marker: key.to_string(), variant: variant.to_string() }],
            &[self.marker],
        ))
    }
}

/// COMT slow metabolizers need magnesium; reported stress symptoms raise the priority.
pub struct ComtRule;

impl Rule for ComtRule {
    fn id(&self) -> &'static str {
        "genetic.comt_slow.magnesium"
    }

    fn category(&self) -> RuleCategory {
        RuleCategory::Genetic
    }

    fn evaluate(&self, profile: &UserProfile, _thresholds: &Thresholds) -> Option<NeedCandidate> {
        let (key, reading) = profile.lab("comt")?;
        let variant = reading.as_variant()?;
        if normalize_term(variant) != "slow" {
            return None;
        }

        let mut facts =
            vec![ProfileFact::Variant { marker: key.to_string(), variant: variant.to_string() }];
        let stress: Vec<&String> = profile
            .medical
            .current_symptoms
            .iter()
            .filter(|symptom| {
                let normalized = normalize_term(symptom);
                STRESS_SYMPTOMS.iter().any(|keyword| normalized.contains(keyword))
            })
            .collect();

        let (priority, statement) = if stress.is_empty() {
            (
                Priority::Moderate,
                "COMT slow variant reduces catecholamine clearance; magnesium supports COMT activity"
                    .to_string(),
            )
        } else {
            facts.extend(
                stress.iter().map(|symptom| ProfileFact::Symptom { symptom: (*symptom).clone() }),
            );
            (
                Priority::High,
                "COMT slow variant with stress-related symptoms; magnesium supports COMT activity"
                    .to_string(),
            )
        };

        Some(candidate(self, Nutrient::Magnesium, priority, statement, facts, &["comt"]))
    }
}

/// Fires when a numeric lab reading falls below its reference range.
pub struct DeficiencyRule {
    pub id: &'static str,
    pub marker: &'static str,
    pub nutrient: Nutrient,
    pub bands: fn(&Thresholds) -> &DeficiencyBands,
    pub severe: Priority,
    pub low: Priority,
    pub statement: &'static str,
}

impl Rule for DeficiencyRule {
    fn id(&self) -> &'static str {
        self.id
    }

    fn category(&self) -> RuleCategory {
        RuleCategory::LabThreshold
    }

    fn evaluate(&self, profile: &UserProfile, thresholds: &Thresholds) -> Option<NeedCandidate> {
        let (key, value) = numeric_lab(profile, self.marker)?;
        let bands = (self.bands)(thresholds);
        let priority = if bands.is_severe(value) {
            self.severe
        } else if bands.is_low(value) {
            self.low
        } else {
            return None;
        };

        Some(candidate(
            self,
            self.nutrient,
            priority,
            fill(
                self.statement,
                &[("value", value.to_string().as_str()), ("unit", bands.unit.as_str())],
            ),
            vec![ProfileFact::LabValue {
                marker: key.to_string(),
                value,
                unit: Some(bands.unit.clone()),
            }],
            &[self.marker],
        ))
    }
}

/// Fires when a numeric lab reading rises above its reference range.
pub struct ElevationRule {
    pub id: &'static str,
    pub marker: &'static str,
    pub category: RuleCategory,
    pub nutrient: Nutrient,
    pub bands: fn(&Thresholds) -> &ElevationBands,
    pub elevated: Priority,
    pub high: Priority,
    pub statement: &'static str,
}

impl Rule for ElevationRule {
    fn id(&self) -> &'static str {
        self.id
    }

    fn category(&self) -> RuleCategory {
        self.category
    }

    fn evaluate(&self, profile: &UserProfile, thresholds: &Thresholds) -> Option<NeedCandidate> {
        let (key, value) = numeric_lab(profile, self.marker)?;
        let bands = (self.bands)(thresholds);
        if !bands.is_elevated(value) {
            return None;
        }
        let priority = if bands.is_high(value) { self.high } else { self.elevated };

        Some(candidate(
            self,
            self.nutrient,
            priority,
            fill(
                self.statement,
                &[("value", value.to_string().as_str()), ("unit", bands.unit.as_str())],
            ),
            vec![ProfileFact::LabValue {
                marker: key.to_string(),
                value,
                unit: Some(bands.unit.clone()),
            }],
            &[self.marker],
        ))
    }
}

/// Fires when a self-reported symptom or condition contains one of the keywords.
pub struct KeywordRule {
    pub id: &'static str,
    pub category: RuleCategory,
    pub keywords: &'static [&'static str],
    pub nutrient: Nutrient,
    pub priority: Priority,
    pub statement: &'static str,
}

impl KeywordRule {
    fn source<'a>(&self, profile: &'a UserProfile) -> &'a BTreeSet<String> {
        match self.category {
            RuleCategory::FamilyHistory => &profile.medical.family_history,
            RuleCategory::PriorCondition => &profile.medical.prior_conditions,
            _ => &profile.medical.current_symptoms,
        }
    }

    fn fact(&self, entry: &str) -> ProfileFact {
        match self.category {
            RuleCategory::FamilyHistory => {
                ProfileFact::FamilyHistory { condition: entry.to_string() }
            }
            RuleCategory::PriorCondition => {
                ProfileFact::PriorCondition { condition: entry.to_string() }
            }
            _ => ProfileFact::Symptom { symptom: entry.to_string() },
        }
    }
}

impl Rule for KeywordRule {
    fn id(&self) -> &'static str {
        self.id
    }

    fn category(&self) -> RuleCategory {
        self.category
    }

    fn evaluate(&self, profile: &UserProfile, _thresholds: &Thresholds) -> Option<NeedCandidate> {
        let facts: Vec<ProfileFact> = self
            .source(profile)
            .iter()
            .filter(|entry| {
                let normalized = normalize_term(entry);
                self.keywords.iter().any(|keyword| normalized.contains(keyword))
            })
            .map(|entry| self.fact(entry))
            .collect();
        if facts.is_empty() {
            return None;
        }

        Some(candidate(
            self,
            self.nutrient,
            self.priority,
            self.statement.to_string(),
            facts,
            &[],
        ))
    }
}

/// Ordered rule registry. Registration order fixes justification order within a need.
pub struct RuleSet {
    rules: Vec<Box<dyn Rule>>,
}

impl RuleSet {
    #[must_use]
    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    #[must_use]
    pub fn with_rule(mut self, rule: impl Rule + 'static) -> Self {
        self.push(rule);
        self
    }

    pub fn push(&mut self, rule: impl Rule + 'static) {
        self.rules.push(Box::new(rule));
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    #[must_use]
    pub fn ids(&self) -> Vec<&'static str> {
        self.rules.iter().map(|rule| rule.id()).collect()
    }

    #[must_use]
    #[allow(clippy::too_many_lines)]
    pub fn standard() -> Self {
        const MTHFR_SEVERE: &[&str] = &["C677T", "COMPOUND", "HOMOZYGOUS"];

        Self::empty()
            .with_rule(VariantRule {
                id: "genetic.mthfr_severe.methylfolate",
                marker: "mthfr",
                variants: MTHFR_SEVERE,
                nutrient: Nutrient::Methylfolate,
                priority: Priority::Critical,
                statement: "MTHFR {variant} variant reduces folate activation; methylated folate bypasses the impaired step",
            })
            .with_rule(VariantRule {
                id: "genetic.mthfr_severe.vitamin_b12",
                marker: "mthfr",
                variants: MTHFR_SEVERE,
                nutrient: Nutrient::VitaminB12,
                priority: Priority::Critical,
                statement: "MTHFR {variant} variant strains the methylation cycle, which depends on vitamin B12",
            })
            .with_rule(VariantRule {
                id: "genetic.mthfr_a1298c.methylfolate",
                marker: "mthfr",
                variants: &["A1298C"],
                nutrient: Nutrient::Methylfolate,
                priority: Priority::High,
                statement: "MTHFR {variant} variant moderately reduces folate metabolism",
            })
            .with_rule(ComtRule)
            .with_rule(DeficiencyRule {
                id: "lab.vitamin_b12_low",
                marker: "vitamin_b12",
                nutrient: Nutrient::VitaminB12,
                bands: |thresholds| &thresholds.vitamin_b12,
                severe: Priority::Critical,
                low: Priority::High,
                statement: "Vitamin B12 level ({value} {unit}) is below the reference range",
            })
            .with_rule(DeficiencyRule {
                id: "lab.vitamin_d_low",
                marker: "vitamin_d",
                nutrient: Nutrient::VitaminD,
                bands: |thresholds| &thresholds.vitamin_d,
                severe: Priority::Critical,
                low: Priority::High,
                statement: "Vitamin D level ({value} {unit}) is below the reference range",
            })
            .with_rule(DeficiencyRule {
                id: "lab.iron_low",
                marker: "iron",
                nutrient: Nutrient::Iron,
                bands: |thresholds| &thresholds.iron,
                severe: Priority::Critical,
                low: Priority::High,
                statement: "Iron level ({value} {unit}) is below the reference range",
            })
            .with_rule(DeficiencyRule {
                id: "lab.ferritin_low",
                marker: "ferritin",
                nutrient: Nutrient::Iron,
                bands: |thresholds| &thresholds.ferritin,
                severe: Priority::Critical,
                low: Priority::High,
                statement: "Ferritin ({value} {unit}) indicates depleted iron stores",
            })
            .with_rule(DeficiencyRule {
                id: "lab.omega3_index_low",
                marker: "omega3_index",
                nutrient: Nutrient::Omega3,
                bands: |thresholds| &thresholds.omega3_index,
                severe: Priority::Critical,
                low: Priority::High,
                statement: "Omega-3 index ({value}{unit}) is below the reference range",
            })
            .with_rule(ElevationRule {
                id: "inflammation.crp_high.anti_inflammatory",
                marker: "crp",
                category: RuleCategory::Inflammation,
                nutrient: Nutrient::AntiInflammatory,
                bands: |thresholds| &thresholds.crp,
                elevated: Priority::High,
                high: Priority::Critical,
                statement: "CRP ({value} {unit}) indicates systemic inflammation",
            })
            .with_rule(ElevationRule {
                id: "inflammation.crp_high.omega3",
                marker: "crp",
                category: RuleCategory::Inflammation,
                nutrient: Nutrient::Omega3,
                bands: |thresholds| &thresholds.crp,
                elevated: Priority::High,
                high: Priority::Critical,
                statement: "CRP ({value} {unit}) is elevated; omega-3 fatty acids counter inflammation",
            })
            .with_rule(ElevationRule {
                id: "metabolic.homocysteine_high.methylfolate",
                marker: "homocysteine",
                category: RuleCategory::Metabolic,
                nutrient: Nutrient::Methylfolate,
                bands: |thresholds| &thresholds.homocysteine,
                elevated: Priority::High,
                high: Priority::Critical,
                statement: "Homocysteine ({value} {unit}) is elevated, suggesting impaired methylation",
            })
            .with_rule(ElevationRule {
                id: "metabolic.glucose_high.fiber",
                marker: "glucose_fasting",
                category: RuleCategory::Metabolic,
                nutrient: Nutrient::Fiber,
                bands: |thresholds| &thresholds.glucose_fasting,
                elevated: Priority::High,
                high: Priority::Critical,
                statement: "Fasting glucose ({value} {unit}) is elevated; fiber slows glucose absorption",
            })
            .with_rule(ElevationRule {
                id: "metabolic.glucose_high.chromium",
                marker: "glucose_fasting",
                category: RuleCategory::Metabolic,
                nutrient: Nutrient::Chromium,
                bands: |thresholds| &thresholds.glucose_fasting,
                elevated: Priority::Moderate,
                high: Priority::High,
                statement: "Fasting glucose ({value} {unit}) is elevated; chromium supports insulin sensitivity",
            })
            .with_rule(KeywordRule {
                id: "symptom.fatigue.iron",
                category: RuleCategory::Symptom,
                keywords: &["fatigue", "tired", "exhaust"],
                nutrient: Nutrient::Iron,
                priority: Priority::Moderate,
                statement: "Reported fatigue is commonly linked to low iron",
            })
            .with_rule(KeywordRule {
                id: "symptom.fatigue.vitamin_b12",
                category: RuleCategory::Symptom,
                keywords: &["fatigue", "tired", "exhaust"],
                nutrient: Nutrient::VitaminB12,
                priority: Priority::Moderate,
                statement: "Reported fatigue is commonly linked to low vitamin B12",
            })
            .with_rule(KeywordRule {
                id: "symptom.brain_fog.omega3",
                category: RuleCategory::Symptom,
                keywords: &["brain_fog"],
                nutrient: Nutrient::Omega3,
                priority: Priority::Moderate,
                statement: "Reported brain fog may respond to omega-3 fatty acids",
            })
            .with_rule(KeywordRule {
                id: "symptom.joint_pain.anti_inflammatory",
                category: RuleCategory::Symptom,
                keywords: &["joint_pain"],
                nutrient: Nutrient::AntiInflammatory,
                priority: Priority::Moderate,
                statement: "Reported joint pain suggests an inflammatory component",
            })
            .with_rule(KeywordRule {
                id: "symptom.anxiety.magnesium",
                category: RuleCategory::Symptom,
                keywords: &["anxiety", "anxious"],
                nutrient: Nutrient::Magnesium,
                priority: Priority::Moderate,
                statement: "Reported anxiety is commonly linked to low magnesium",
            })
            .with_rule(KeywordRule {
                id: "symptom.weak_immunity.vitamin_d",
                category: RuleCategory::Symptom,
                keywords: &["weak_immun", "frequent_illness"],
                nutrient: Nutrient::VitaminD,
                priority: Priority::Moderate,
                statement: "Reported weak immunity is commonly linked to low vitamin D",
            })
            .with_rule(KeywordRule {
                id: "condition.anemia.iron",
                category: RuleCategory::PriorCondition,
                keywords: &["anemia", "anaemia"],
                nutrient: Nutrient::Iron,
                priority: Priority::Moderate,
                statement: "A prior anemia diagnosis warrants continued iron intake",
            })
            .with_rule(KeywordRule {
                id: "condition.vitamin_d_deficiency.vitamin_d",
                category: RuleCategory::PriorCondition,
                keywords: &["vitamin_d_deficien"],
                nutrient: Nutrient::VitaminD,
                priority: Priority::Moderate,
                statement: "A prior vitamin D deficiency warrants continued vitamin D intake",
            })
            .with_rule(KeywordRule {
                id: "family.diabetes.fiber",
                category: RuleCategory::FamilyHistory,
                keywords: &["diabetes"],
                nutrient: Nutrient::Fiber,
                priority: Priority::Low,
                statement: "Family history of diabetes favors a high-fiber diet",
            })
            .with_rule(KeywordRule {
                id: "family.diabetes.chromium",
                category: RuleCategory::FamilyHistory,
                keywords: &["diabetes"],
                nutrient: Nutrient::Chromium,
                priority: Priority::Low,
                statement: "Family history of diabetes favors chromium-rich foods",
            })
            .with_rule(KeywordRule {
                id: "family.heart.omega3",
                category: RuleCategory::FamilyHistory,
                keywords: &["heart", "cardiovascular"],
                nutrient: Nutrient::Omega3,
                priority: Priority::Low,
                statement: "Family history of heart disease favors omega-3 fatty acids",
            })
            .with_rule(KeywordRule {
                id: "family.cancer.antioxidants",
                category: RuleCategory::FamilyHistory,
                keywords: &["cancer"],
                nutrient: Nutrient::Antioxidants,
                priority: Priority::Low,
                statement: "Family history of cancer favors antioxidant-rich foods",
            })
    }
}

impl Default for RuleSet {
    fn default() -> Self {
        Self::standard()
    }
}

impl Debug for RuleSet {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuleSet").field("rules", &self.ids()).finish()
    }
}

/// Evaluate a profile against the standard rule set and default thresholds.
#[must_use]
pub fn evaluate(profile: &UserProfile) -> Vec<NutrientNeed> {
    evaluate_with(profile, &RuleSet::standard(), &Thresholds::default())
}

/// Run every rule in registry order and merge candidates into a prioritized need list.
#[must_use]
pub fn evaluate_with(
    profile: &UserProfile,
    rules: &RuleSet,
    thresholds: &Thresholds,
) -> Vec<NutrientNeed> {
    let candidates = rules
        .rules
        .iter()
        .filter_map(|rule| {
            let fired = rule.evaluate(profile, thresholds)?;
            debug!(
                rule = rule.id(),
                nutrient = fired.nutrient.as_str(),
                priority = fired.justification.priority.as_str(),
                "rule fired"
            );
            Some(fired)
        })
        .collect();

    aggregate(candidates)
}

fn aggregate(candidates: Vec<NeedCandidate>) -> Vec<NutrientNeed> {
    let mut grouped: BTreeMap<Nutrient, Vec<NeedCandidate>> = BTreeMap::new();
    for fired in candidates {
        grouped.entry(fired.nutrient).or_default().push(fired);
    }

    let mut needs: Vec<NutrientNeed> = grouped
        .into_iter()
        .filter_map(|(nutrient, group)| {
            let highest = group.iter().map(|fired| fired.justification.priority).max()?;
            let corroborated =
                group.iter().any(|fired| !fired.justification.category.is_low_confidence());
            let priority = if corroborated { highest } else { highest.min(Priority::Moderate) };

            let related_markers: BTreeSet<String> =
                group.iter().flat_map(|fired| fired.related_markers.iter().cloned()).collect();

            Some(NutrientNeed {
                nutrient,
                priority,
                justification: group.into_iter().map(|fired| fired.justification).collect(),
                related_markers: related_markers.into_iter().collect(),
            })
        })
        .collect();

    needs.sort_by(NutrientNeed::precedence);
    needs
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum MarkerStatus {
    Low,
    Normal,
    Elevated,
    Variant,
    Unrecognized,
}

impl MarkerStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::Elevated => "elevated",
            Self::Variant => "variant",
            Self::Unrecognized => "unrecognized",
        }
    }
}

/// A lab reading annotated with where it sits against the configured reference ranges.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MarkerReading {
    pub marker: String,
    pub value: LabValue,
    pub unit: Option<String>,
    pub status: MarkerStatus,
}

enum ReferenceRange<'a> {
    Deficiency(&'a DeficiencyBands),
    Elevation(&'a ElevationBands),
}

fn reference_range<'a>(thresholds: &'a Thresholds, marker: &str) -> Option<ReferenceRange<'a>> {
    let range = match marker {
        "vitamin_b12" => ReferenceRange::Deficiency(&thresholds.vitamin_b12),
        "vitamin_d" => ReferenceRange::Deficiency(&thresholds.vitamin_d),
        "iron" => ReferenceRange::Deficiency(&thresholds.iron),
        "ferritin" => ReferenceRange::Deficiency(&thresholds.ferritin),
        "omega3_index" => ReferenceRange::Deficiency(&thresholds.omega3_index),
        "crp" => ReferenceRange::Elevation(&thresholds.crp),
        "homocysteine" => ReferenceRange::Elevation(&thresholds.homocysteine),
        "glucose_fasting" => ReferenceRange::Elevation(&thresholds.glucose_fasting),
        _ => return None,
    };
    Some(range)
}

/// Annotate every lab reading in the profile, in marker order.
#[must_use]
pub fn classify_labs(profile: &UserProfile, thresholds: &Thresholds) -> Vec<MarkerReading> {
    profile
        .labs
        .iter()
        .map(|(marker, value)| {
            let normalized = normalize_term(marker);
            let (unit, status) = match (reference_range(thresholds, &normalized), value.as_f64()) {
                (Some(ReferenceRange::Deficiency(bands)), Some(number)) => {
                    let status = if bands.is_severe(number) || bands.is_low(number) {
                        MarkerStatus::Low
                    } else {
                        MarkerStatus::Normal
                    };
                    (Some(bands.unit.clone()), status)
                }
                (Some(ReferenceRange::Elevation(bands)), Some(number)) => {
                    let status = if bands.is_elevated(number) {
                        MarkerStatus::Elevated
                    } else {
                        MarkerStatus::Normal
                    };
                    (Some(bands.unit.clone()), status)
                }
                (None, None) if value.as_variant().is_some() => (None, MarkerStatus::Variant),
                _ => (None, MarkerStatus::Unrecognized),
            };

            MarkerReading { marker: marker.clone(), value: value.clone(), unit, status }
        })
        .collect()
}
