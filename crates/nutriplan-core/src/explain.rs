use serde::{Deserialize, Serialize};

use crate::catalog::TravelClass;
use crate::planner::{SelectionBasis, ShoppingListItem, ShoppingPlan, UnmetNeed};
use crate::{Justification, Money, Nutrient, NutrientNeed, NutriplanError, Priority};

/// One need as recorded in the plan, with the facts that produced it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NeedTrace {
    pub nutrient: Nutrient,
    pub display_name: String,
    pub priority: Priority,
    pub justification: Vec<Justification>,
    pub related_markers: Vec<String>,
}

impl From<&NutrientNeed> for NeedTrace {
    fn from(need: &NutrientNeed) -> Self {
        Self {
            nutrient: need.nutrient,
            display_name: need.nutrient.display_name().to_string(),
            priority: need.priority,
            justification: need.justification.clone(),
            related_markers: need.related_markers.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FoodExplanation {
    pub entry_id: String,
    pub name: String,
    pub source: String,
    #[serde(rename = "price_cents")]
    pub price: Money,
    pub rank: usize,
    pub priority: Priority,
    pub travel_class: TravelClass,
    pub selection: SelectionBasis,
    pub reason: String,
    pub addressed: Vec<NeedTrace>,
    pub chain: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FulfilledBy {
    pub entry_id: String,
    pub name: String,
    pub source: String,
    #[serde(rename = "price_cents")]
    pub price: Money,
    pub rank: usize,
}

impl From<&ShoppingListItem> for FulfilledBy {
    fn from(item: &ShoppingListItem) -> Self {
        Self {
            entry_id: item.entry_id.clone(),
            name: item.name.clone(),
            source: item.source.clone(),
            price: item.price,
            rank: item.rank,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NutrientExplanation {
    pub need: NeedTrace,
    pub fulfilled_by: Option<FulfilledBy>,
    pub unmet: Option<UnmetNeed>,
    pub chain: Vec<String>,
}

/// Answers "why" questions from the provenance a [`ShoppingPlan`] already carries.
#[derive(Debug, Clone, Copy)]
pub struct Explainer<'a> {
    plan: &'a ShoppingPlan,
}

impl<'a> Explainer<'a> {
    #[must_use]
    pub fn new(plan: &'a ShoppingPlan) -> Self {
        Self { plan }
    }

    /// Explain a planned item, looked up by exact entry id or by a fragment of its name.
    ///
    /// # Errors
    /// Returns [`NutriplanError::NotFound`] when no planned item matches `query`.
    pub fn explain_food(&self, query: &str) -> Result<FoodExplanation, NutriplanError> {
        let item = self.find_item(query)?;

        let addressed: Vec<NeedTrace> = item
            .addresses
            .iter()
            .filter_map(|nutrient| self.plan.need(*nutrient))
            .map(NeedTrace::from)
            .collect();
        let chain = addressed
            .iter()
            .flat_map(|trace| chain_lines(trace, Some(item.name.as_str())))
            .collect();

        Ok(FoodExplanation {
            entry_id: item.entry_id.clone(),
            name: item.name.clone(),
            source: item.source.clone(),
            price: item.price,
            rank: item.rank,
            priority: item.priority,
            travel_class: item.travel_class,
            selection: item.selection,
            reason: item.reason.clone(),
            addressed,
            chain,
        })
    }

    /// Explain why a nutrient was prioritized and how the plan handled it.
    ///
    /// # Errors
    /// Returns [`NutriplanError::NotFound`] when `query` names no known nutrient, or a nutrient
    /// that is not among the plan's needs.
    pub fn explain_nutrient(&self, query: &str) -> Result<NutrientExplanation, NutriplanError> {
        let nutrient = Nutrient::resolve(query).ok_or_else(|| {
            NutriplanError::NotFound(format!("nutrient `{}` is not recognized", query.trim()))
        })?;
        let need = self.plan.need(nutrient).ok_or_else(|| {
            NutriplanError::NotFound(format!(
                "nutrient `{}` is not among the current priorities",
                nutrient.as_str()
            ))
        })?;

        let trace = NeedTrace::from(need);
        let fulfilled_by = self.plan.item_for(nutrient).map(FulfilledBy::from);
        let unmet = self.plan.unmet_for(nutrient).cloned();
        let chain = match (&fulfilled_by, &unmet) {
            (Some(item), _) => chain_lines(&trace, Some(item.name.as_str())),
            (None, Some(record)) => {
                let mut lines = chain_lines(&trace, None);
                lines.push(format!("unmet ({}): {}", record.reason.as_str(), record.message));
                lines
            }
            (None, None) => chain_lines(&trace, None),
        };

        Ok(NutrientExplanation { need: trace, fulfilled_by, unmet, chain })
    }

    /// An exact id wins. Otherwise a name or id fragment must pick out exactly one item.
    fn find_item(&self, query: &str) -> Result<&'a ShoppingListItem, NutriplanError> {
        let plan: &'a ShoppingPlan = self.plan;
        let query = query.trim();
        let missing =
            || NutriplanError::NotFound(format!("food `{query}` is not on the shopping list"));
        if query.is_empty() {
            return Err(missing());
        }
        if let Some(exact) = plan.items.iter().find(|item| item.entry_id == query) {
            return Ok(exact);
        }

        let fragment = query.to_lowercase();
        let candidates: Vec<&'a ShoppingListItem> = plan
            .items
            .iter()
            .filter(|item| {
                item.name.to_lowercase().contains(&fragment) || item.entry_id.contains(&fragment)
            })
            .collect();
        match candidates.as_slice() {
            [] => Err(missing()),
            [only] => Ok(*only),
            several => {
                let ids: Vec<&str> = several.iter().map(|item| item.entry_id.as_str()).collect();
                Err(NutriplanError::NotFound(format!(
                    "food `{query}` matches several items on the shopping list: {}",
                    ids.join(", ")
                )))
            }
        }
    }
}

fn chain_lines(trace: &NeedTrace, item_name: Option<&str>) -> Vec<String> {
    let suffix = item_name.map_or_else(String::new, |name| format!(" -> {name}"));
    let target = suffix.as_str();
    trace
        .justification
        .iter()
        .flat_map(|entry| {
            entry.facts.iter().map(move |fact| {
                format!(
                    "{} -> {} -> {} ({}){target}",
                    fact.describe(),
                    entry.rule_id,
                    trace.display_name,
                    trace.priority
                )
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use time::{Duration, OffsetDateTime};

    use super::*;
    use crate::config::PlannerConfig;
    use crate::planner::plan;
    use crate::rules::evaluate;
    use crate::test_support::{base_profile, entry, index, with_lab};
    use crate::LabValue;

    fn sample_plan() -> ShoppingPlan {
        let mut profile = with_lab(base_profile(), "iron", LabValue::Numeric(50.0));
        profile.labs.insert("crp".to_string(), LabValue::Numeric(3.5));
        profile.medical.allergies.insert("fish".to_string());
        let mut sardines = entry("sardines", 200, &[Nutrient::Omega3], TravelClass::Walkable);
        sardines.allergens.insert("fish".to_string());
        let mut spinach = entry(
            "spinach-fresh",
            250,
            &[Nutrient::Iron, Nutrient::AntiInflammatory],
            TravelClass::Walkable,
        );
        spinach.name = "Spinach (fresh bunch)".to_string();
        let catalog = index(vec![sardines, spinach]);

        plan(
            &evaluate(&profile),
            &catalog,
            &profile,
            &PlannerConfig::default(),
            OffsetDateTime::UNIX_EPOCH + Duration::seconds(1_760_000_000),
        )
    }

    // Test IDs: EXP-001
    #[test]
    fn explain_food_traces_item_back_to_lab_values() {
        let shopping = sample_plan();
        let explainer = Explainer::new(&shopping);
        let explanation = match explainer.explain_food("spinach") {
            Ok(explanation) => explanation,
            Err(err) => panic!("spinach should be explainable: {err}"),
        };

        assert_eq!(explanation.entry_id, "spinach-fresh");
        let nutrients: Vec<Nutrient> =
            explanation.addressed.iter().map(|trace| trace.nutrient).collect();
        assert_eq!(nutrients, vec![Nutrient::Iron, Nutrient::AntiInflammatory]);
        assert!(explanation
            .chain
            .iter()
            .any(|line| line.starts_with("lab iron = 50 mcg/dL -> lab.iron_low -> Iron (CRITICAL)")));
        assert!(explanation.chain.iter().all(|line| line.ends_with("-> Spinach (fresh bunch)")));
    }

    #[test]
    fn explain_food_prefers_exact_id_match() {
        let shopping = sample_plan();
        let explanation = Explainer::new(&shopping).explain_food("spinach-fresh");
        assert!(matches!(explanation, Ok(found) if found.name == "Spinach (fresh bunch)"));
    }

    // Test IDs: EXP-002
    #[test]
    fn explain_food_rejects_items_not_on_the_list() {
        let shopping = sample_plan();
        let explainer = Explainer::new(&shopping);
        assert!(matches!(
            explainer.explain_food("dragonfruit"),
            Err(NutriplanError::NotFound(message)) if message.contains("dragonfruit")
        ));
        assert!(matches!(explainer.explain_food("   "), Err(NutriplanError::NotFound(_))));
    }

    #[test]
    fn explain_food_rejects_fragments_matching_several_items() {
        let profile = with_lab(base_profile(), "iron", LabValue::Numeric(50.0));
        let profile = with_lab(profile, "crp", LabValue::Numeric(3.5));
        let mut frozen =
            entry("spinach-frozen", 180, &[Nutrient::AntiInflammatory], TravelClass::Walkable);
        frozen.name = "Spinach (frozen)".to_string();
        let catalog = index(vec![
            entry("spinach-fresh", 250, &[Nutrient::Iron], TravelClass::Walkable),
            frozen,
        ]);
        let shopping = plan(
            &evaluate(&profile),
            &catalog,
            &profile,
            &PlannerConfig::default(),
            OffsetDateTime::UNIX_EPOCH + Duration::seconds(1_760_000_000),
        );
        assert_eq!(shopping.items.len(), 2);
        let explainer = Explainer::new(&shopping);

        match explainer.explain_food("spinach") {
            Err(NutriplanError::NotFound(message)) => {
                assert!(message.contains("matches several items"));
                assert!(message.contains("spinach-fresh"));
                assert!(message.contains("spinach-frozen"));
            }
            other => panic!("ambiguous fragment should be rejected: {other:?}"),
        }
        assert!(matches!(explainer.explain_food("e"), Err(NutriplanError::NotFound(_))));
        assert!(matches!(
            explainer.explain_food("frozen"),
            Ok(found) if found.entry_id == "spinach-frozen"
        ));
        assert!(matches!(
            explainer.explain_food("spinach-fresh"),
            Ok(found) if found.entry_id == "spinach-fresh"
        ));
    }

    #[test]
    fn explain_nutrient_reports_fulfilment_or_unmet_record() {
        let shopping = sample_plan();
        let explainer = Explainer::new(&shopping);

        let iron = match explainer.explain_nutrient("Iron") {
            Ok(iron) => iron,
            Err(err) => panic!("iron should be explainable: {err}"),
        };
        assert_eq!(iron.need.priority, Priority::Critical);
        assert_eq!(iron.fulfilled_by.map(|item| item.entry_id), Some("spinach-fresh".to_string()));
        assert!(iron.unmet.is_none());

        let omega = match explainer.explain_nutrient("omega") {
            Ok(omega) => omega,
            Err(err) => panic!("omega-3 should be explainable: {err}"),
        };
        assert!(omega.fulfilled_by.is_none());
        assert!(omega.chain.iter().any(|line| line.starts_with("unmet (allergen-excluded)")));
    }

    #[test]
    fn explain_nutrient_distinguishes_unknown_from_unprioritized() {
        let shopping = sample_plan();
        let explainer = Explainer::new(&shopping);
        assert!(matches!(
            explainer.explain_nutrient("kryptonite"),
            Err(NutriplanError::NotFound(message)) if message.contains("not recognized")
        ));
        assert!(matches!(
            explainer.explain_nutrient("chromium"),
            Err(NutriplanError::NotFound(message)) if message.contains("not among")
        ));
    }
}
