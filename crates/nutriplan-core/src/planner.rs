use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;

use crate::catalog::{
    exclude_allergens, filter_benefit_eligible, filter_reachable, CatalogEntry, CatalogIndex,
    Reachability, TravelClass,
};
use crate::config::PlannerConfig;
use crate::rules::RULESET_VERSION;
use crate::{
    default_need_tie_breakers, BudgetTier, Money, Nutrient, NutrientNeed, Priority, UserProfile,
};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum SelectionBasis {
    PantryPreferred,
    LowestPrice,
}

impl SelectionBasis {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PantryPreferred => "pantry_preferred",
            Self::LowestPrice => "lowest_price",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum UnmetReason {
    NoSource,
    AllergenExcluded,
    Inaccessible,
    OverBudget,
}

impl UnmetReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NoSource => "no-source",
            Self::AllergenExcluded => "allergen-excluded",
            Self::Inaccessible => "inaccessible",
            Self::OverBudget => "over-budget",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ShoppingListItem {
    pub rank: usize,
    pub entry_id: String,
    pub name: String,
    pub source: String,
    #[serde(rename = "price_cents")]
    pub price: Money,
    pub priority: Priority,
    pub travel_class: TravelClass,
    pub addresses: Vec<Nutrient>,
    pub selection: SelectionBasis,
    pub benefit_restricted: bool,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UnmetNeed {
    pub nutrient: Nutrient,
    pub priority: Priority,
    pub reason: UnmetReason,
    pub excluded_entries: Vec<String>,
    pub message: String,
}

/// Caveats about the inputs that do not block planning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PlanWarning {
    NoLabResults,
    AllergenLimitedSources { nutrient: Nutrient, excluded_entries: Vec<String> },
}

impl PlanWarning {
    #[must_use]
    pub fn message(&self) -> String {
        match self {
            Self::NoLabResults => {
                "No lab results provided; priorities rest on symptoms and history only.".to_string()
            }
            Self::AllergenLimitedSources { nutrient, excluded_entries } => format!(
                "Limited sources of {} due to allergies ({} excluded).",
                nutrient.display_name(),
                excluded_entries.len()
            ),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BudgetLine {
    pub entry_id: String,
    pub name: String,
    pub source: String,
    #[serde(rename = "price_cents")]
    pub price: Money,
    pub priority: Priority,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BudgetSummary {
    #[serde(rename = "weekly_budget_cents")]
    pub weekly_budget: Money,
    #[serde(rename = "spent_cents")]
    pub spent: Money,
    #[serde(rename = "remaining_cents")]
    pub remaining: Money,
    pub budget_tier: BudgetTier,
    pub line_items: Vec<BudgetLine>,
    pub by_priority: BTreeMap<Priority, Money>,
    pub by_source: BTreeMap<String, Money>,
}

impl BudgetSummary {
    #[must_use]
    pub fn from_items(weekly_budget: Money, items: &[ShoppingListItem]) -> Self {
        let mut by_priority = BTreeMap::new();
        let mut by_source = BTreeMap::new();
        let mut line_items = Vec::with_capacity(items.len());
        for item in items {
            *by_priority.entry(item.priority).or_insert(Money::ZERO) += item.price;
            *by_source.entry(item.source.clone()).or_insert(Money::ZERO) += item.price;
            line_items.push(BudgetLine {
                entry_id: item.entry_id.clone(),
                name: item.name.clone(),
                source: item.source.clone(),
                price: item.price,
                priority: item.priority,
            });
        }

        let spent: Money = items.iter().map(|item| item.price).sum();
        Self {
            weekly_budget,
            spent,
            remaining: weekly_budget.saturating_sub(spent),
            budget_tier: BudgetTier::for_budget(weekly_budget),
            line_items,
            by_priority,
            by_source,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeterminismMetadata {
    pub ruleset_version: String,
    pub catalog_fingerprint: String,
    pub snapshot_id: String,
    pub tie_breakers: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ShoppingPlan {
    pub plan_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub generated_at: OffsetDateTime,
    pub profile_id: String,
    pub determinism: DeterminismMetadata,
    pub needs: Vec<NutrientNeed>,
    pub items: Vec<ShoppingListItem>,
    pub unmet: Vec<UnmetNeed>,
    pub budget: BudgetSummary,
    pub warnings: Vec<PlanWarning>,
    pub ordering_trace: Vec<String>,
}

impl ShoppingPlan {
    #[must_use]
    pub fn budget(&self) -> &BudgetSummary {
        &self.budget
    }

    #[must_use]
    pub fn need(&self, nutrient: Nutrient) -> Option<&NutrientNeed> {
        self.needs.iter().find(|need| need.nutrient == nutrient)
    }

    #[must_use]
    pub fn item_for(&self, nutrient: Nutrient) -> Option<&ShoppingListItem> {
        self.items.iter().find(|item| item.addresses.contains(&nutrient))
    }

    #[must_use]
    pub fn unmet_for(&self, nutrient: Nutrient) -> Option<&UnmetNeed> {
        self.unmet.iter().find(|unmet| unmet.nutrient == nutrient)
    }
}

#[must_use]
pub fn default_selection_tie_breakers() -> Vec<String> {
    vec!["price asc".to_string(), "potency desc".to_string(), "entry_id asc".to_string()]
}

#[must_use]
pub fn default_item_tie_breakers() -> Vec<String> {
    vec!["priority desc".to_string(), "price asc".to_string(), "entry_id asc".to_string()]
}

struct Draft<'a> {
    entry: &'a CatalogEntry,
    addressed: Vec<(Nutrient, Priority)>,
    statement: String,
    selection: SelectionBasis,
    benefit_restricted: bool,
}

struct Choice<'a> {
    entry: &'a CatalogEntry,
    selection: SelectionBasis,
    benefit_restricted: bool,
}

struct PlannerState<'a> {
    index: &'a CatalogIndex,
    profile: &'a UserProfile,
    reachability: Reachability,
    config: &'a PlannerConfig,
    remaining: Money,
    drafts: Vec<Draft<'a>>,
    positions: BTreeMap<String, usize>,
}

impl<'a> PlannerState<'a> {
    fn listed(&self, entry: &CatalogEntry) -> bool {
        self.positions.contains_key(&entry.id)
    }

    fn choose(&self, need: &NutrientNeed) -> Result<Choice<'a>, UnmetNeed> {
        let nutrient = need.nutrient;
        let unmet = |reason: UnmetReason, excluded: &[&CatalogEntry], message: String| UnmetNeed {
            nutrient,
            priority: need.priority,
            reason,
            excluded_entries: excluded.iter().map(|entry| entry.id.clone()).collect(),
            message,
        };

        let index: &'a CatalogIndex = self.index;
        let providing = index.entries_providing(nutrient);
        if providing.is_empty() {
            return Err(unmet(
                UnmetReason::NoSource,
                &[],
                format!("No catalog entry provides {}.", nutrient.display_name()),
            ));
        }

        let safe = exclude_allergens(&providing, &self.profile.medical.allergies);
        if safe.is_empty() {
            return Err(unmet(
                UnmetReason::AllergenExcluded,
                &providing,
                format!(
                    "Every source of {} conflicts with a listed allergy.",
                    nutrient.display_name()
                ),
            ));
        }

        let reachable = filter_reachable(&safe, &self.reachability);
        if reachable.is_empty() {
            return Err(unmet(
                UnmetReason::Inaccessible,
                &safe,
                format!(
                    "No source of {} is reachable with the available transportation.",
                    nutrient.display_name()
                ),
            ));
        }

        let benefits = self.profile.benefits();
        let (pool, benefit_restricted) = if benefits.any() {
            let eligible = filter_benefit_eligible(&reachable, benefits);
            if eligible.is_empty() {
                (reachable, false)
            } else {
                let restricted = eligible.len() < reachable.len();
                (eligible, restricted)
            }
        } else {
            (reachable, false)
        };

        let affordable: Vec<&'a CatalogEntry> = pool
            .iter()
            .copied()
            .filter(|entry| self.listed(entry) || entry.price <= self.remaining)
            .collect();
        if affordable.is_empty() {
            let cheapest = pool.iter().map(|entry| entry.price).min().unwrap_or_default();
            return Err(unmet(
                UnmetReason::OverBudget,
                &pool,
                format!(
                    "The cheapest accessible source of {} costs {cheapest}, above the remaining {}.",
                    nutrient.display_name(),
                    self.remaining
                ),
            ));
        }

        let by_price = |lhs: &&CatalogEntry, rhs: &&CatalogEntry| {
            lhs.price
                .cmp(&rhs.price)
                .then_with(|| rhs.potency_for(nutrient).cmp(&lhs.potency_for(nutrient)))
                .then_with(|| lhs.id.cmp(&rhs.id))
        };

        if self.remaining < self.config.low_budget_threshold {
            if let Some(entry) =
                affordable.iter().copied().filter(|entry| entry.is_pantry()).min_by(by_price)
            {
                return Ok(Choice {
                    entry,
                    selection: SelectionBasis::PantryPreferred,
                    benefit_restricted,
                });
            }
        }

        match affordable.iter().copied().min_by(by_price) {
            Some(entry) => {
                Ok(Choice { entry, selection: SelectionBasis::LowestPrice, benefit_restricted })
            }
            None => Err(unmet(
                UnmetReason::OverBudget,
                &pool,
                format!("No affordable source of {} remains.", nutrient.display_name()),
            )),
        }
    }

    fn apply(&mut self, need: &NutrientNeed, choice: Choice<'a>) {
        if let Some(position) = self.positions.get(&choice.entry.id).copied() {
            tracing::debug!(
                nutrient = need.nutrient.as_str(),
                entry = %choice.entry.id,
                "merged need into listed item"
            );
            self.drafts[position].addressed.push((need.nutrient, need.priority));
            return;
        }

        self.remaining = self.remaining.saturating_sub(choice.entry.price);
        tracing::debug!(
            nutrient = need.nutrient.as_str(),
            entry = %choice.entry.id,
            price = choice.entry.price.cents(),
            remaining = self.remaining.cents(),
            selection = choice.selection.as_str(),
            "selected item"
        );
        self.positions.insert(choice.entry.id.clone(), self.drafts.len());
        self.drafts.push(Draft {
            entry: choice.entry,
            addressed: vec![(need.nutrient, need.priority)],
            statement: need.summary(),
            selection: choice.selection,
            benefit_restricted: choice.benefit_restricted,
        });
    }
}

fn describe_item(draft: &Draft<'_>, low_budget_threshold: Money) -> String {
    let addressed = draft
        .addressed
        .iter()
        .map(|(nutrient, priority)| format!("{} ({priority})", nutrient.display_name()))
        .collect::<Vec<_>>()
        .join(", ");
    let basis = match draft.selection {
        SelectionBasis::PantryPreferred => format!(
            "Free pantry source preferred while the remaining budget is under {low_budget_threshold}."
        ),
        SelectionBasis::LowestPrice => "Lowest-priced accessible source.".to_string(),
    };
    let mut reason = format!("Addresses {addressed}. {}. {basis}", draft.statement);
    if draft.benefit_restricted {
        reason.push_str(" Limited to SNAP/WIC-eligible sources.");
    }
    reason
}

fn plan_warnings(
    needs: &[NutrientNeed],
    index: &CatalogIndex,
    profile: &UserProfile,
) -> Vec<PlanWarning> {
    let mut warnings = Vec::new();
    if profile.labs.is_empty() {
        warnings.push(PlanWarning::NoLabResults);
    }
    for need in needs {
        let providing = index.entries_providing(need.nutrient);
        let excluded: Vec<String> = providing
            .iter()
            .filter(|entry| entry.allergen_conflict(&profile.medical.allergies).is_some())
            .map(|entry| entry.id.clone())
            .collect();
        if !excluded.is_empty() {
            warnings.push(PlanWarning::AllergenLimitedSources {
                nutrient: need.nutrient,
                excluded_entries: excluded,
            });
        }
    }
    warnings
}

fn compute_snapshot_id(
    needs: &[NutrientNeed],
    index: &CatalogIndex,
    profile: &UserProfile,
    config: &PlannerConfig,
    as_of: OffsetDateTime,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(RULESET_VERSION.as_bytes());
    hasher.update(index.fingerprint().as_bytes());
    hasher.update(as_of.unix_timestamp().to_string().as_bytes());
    hasher.update(serde_json::to_vec(profile).unwrap_or_default());
    hasher.update(config.low_budget_threshold.cents().to_string().as_bytes());
    for need in needs {
        hasher.update(format!("{}:{}", need.nutrient.as_str(), need.priority.as_str()).as_bytes());
    }

    let digest = hasher.finalize();
    let digest_hex = format!("{digest:x}");
    format!("snap_{}", &digest_hex[..16])
}

fn ordering_trace(reachability: &Reachability, config: &PlannerConfig) -> Vec<String> {
    let classes = reachability
        .classes()
        .into_iter()
        .map(TravelClass::as_str)
        .collect::<Vec<_>>()
        .join(", ");
    vec![
        "needs: priority desc, nutrient_id asc".to_string(),
        "candidates: entries providing the nutrient".to_string(),
        "exclude: allergen conflicts".to_string(),
        format!("exclude: travel classes outside [{classes}]"),
        "restrict: benefit-eligible or pantry sources when SNAP/WIC applies".to_string(),
        "exclude: price above remaining budget unless already listed".to_string(),
        format!(
            "select: pantry when remaining < {}, else price asc, potency desc, entry_id asc",
            config.low_budget_threshold
        ),
        "merge: entries already listed absorb additional needs".to_string(),
        "items: priority desc, price asc, entry_id asc".to_string(),
    ]
}

/// Build a shopping list that covers `needs` from `index` within the profile's constraints.
///
/// Needs are processed in priority order. A need that cannot be covered becomes an
/// [`UnmetNeed`] with the stage that eliminated the last candidate.
#[must_use]
pub fn plan(
    needs: &[NutrientNeed],
    index: &CatalogIndex,
    profile: &UserProfile,
    config: &PlannerConfig,
    as_of: OffsetDateTime,
) -> ShoppingPlan {
    let mut ordered = needs.to_vec();
    ordered.sort_by(NutrientNeed::precedence);

    let mut state = PlannerState {
        index,
        profile,
        reachability: Reachability::for_profile(profile),
        config,
        remaining: profile.financials.weekly_budget,
        drafts: Vec::new(),
        positions: BTreeMap::new(),
    };

    let mut unmet = Vec::new();
    for need in &ordered {
        match state.choose(need) {
            Ok(choice) => state.apply(need, choice),
            Err(record) => {
                tracing::debug!(
                    nutrient = need.nutrient.as_str(),
                    reason = record.reason.as_str(),
                    "need left unmet"
                );
                unmet.push(record);
            }
        }
    }

    let mut items: Vec<ShoppingListItem> = state
        .drafts
        .iter()
        .map(|draft| ShoppingListItem {
            rank: 0,
            entry_id: draft.entry.id.clone(),
            name: draft.entry.name.clone(),
            source: draft.entry.source.clone(),
            price: draft.entry.price,
            priority: draft
                .addressed
                .iter()
                .map(|(_, priority)| *priority)
                .max()
                .unwrap_or(Priority::Low),
            travel_class: draft.entry.travel_class,
            addresses: draft.addressed.iter().map(|(nutrient, _)| *nutrient).collect(),
            selection: draft.selection,
            benefit_restricted: draft.benefit_restricted,
            reason: describe_item(draft, config.low_budget_threshold),
        })
        .collect();
    items.sort_by(|lhs, rhs| {
        rhs.priority
            .cmp(&lhs.priority)
            .then_with(|| lhs.price.cmp(&rhs.price))
            .then_with(|| lhs.entry_id.cmp(&rhs.entry_id))
    });
    for (position, item) in items.iter_mut().enumerate() {
        item.rank = position + 1;
    }

    let budget = BudgetSummary::from_items(profile.financials.weekly_budget, &items);
    let warnings = plan_warnings(&ordered, index, profile);
    let snapshot_id = compute_snapshot_id(&ordered, index, profile, config, as_of);
    let mut tie_breakers = default_need_tie_breakers()
        .into_iter()
        .map(|rule| format!("need: {rule}"))
        .collect::<Vec<_>>();
    tie_breakers.extend(
        default_selection_tie_breakers().into_iter().map(|rule| format!("selection: {rule}")),
    );
    tie_breakers
        .extend(default_item_tie_breakers().into_iter().map(|rule| format!("item: {rule}")));

    tracing::info!(
        profile = %profile.profile_id,
        items = items.len(),
        unmet = unmet.len(),
        spent = budget.spent.cents(),
        remaining = budget.remaining.cents(),
        "shopping plan built"
    );

    ShoppingPlan {
        plan_id: format!("plan_{}_{snapshot_id}", as_of.unix_timestamp()),
        generated_at: as_of,
        profile_id: profile.profile_id.clone(),
        determinism: DeterminismMetadata {
            ruleset_version: RULESET_VERSION.to_string(),
            catalog_fingerprint: index.fingerprint().to_string(),
            snapshot_id,
            tie_breakers,
        },
        needs: ordered,
        items,
        unmet,
        budget,
        warnings,
        ordering_trace: ordering_trace(&state.reachability, config),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use proptest::prelude::*;
    use time::Duration;

    use super::*;
    use crate::catalog::{Catalog, NutrientSupply, Potency};
    use crate::rules::evaluate;
    use crate::test_support::{base_profile, entry, index, with_lab};
    use crate::{Justification, LabValue, ProfileFact, RuleCategory};

    fn fixture_time() -> OffsetDateTime {
        OffsetDateTime::UNIX_EPOCH + Duration::seconds(1_760_000_000)
    }

    fn need(nutrient: Nutrient, priority: Priority) -> NutrientNeed {
        NutrientNeed {
            nutrient,
            priority,
            justification: vec![Justification {
                rule_id: format!("fixture.{}", nutrient.as_str()),
                category: RuleCategory::LabThreshold,
                priority,
                statement: format!("{} fixture need", nutrient.display_name()),
                facts: vec![ProfileFact::Symptom { symptom: "fixture".to_string() }],
            }],
            related_markers: Vec::new(),
        }
    }

    fn snap(mut catalog_entry: CatalogEntry) -> CatalogEntry {
        catalog_entry.snap_eligible = true;
        catalog_entry
    }

    fn build(
        needs: &[NutrientNeed],
        catalog: &CatalogIndex,
        profile: &UserProfile,
    ) -> ShoppingPlan {
        plan(needs, catalog, profile, &PlannerConfig::default(), fixture_time())
    }

    fn unmet_reason(shopping: &ShoppingPlan, nutrient: Nutrient) -> Option<UnmetReason> {
        shopping.unmet_for(nutrient).map(|unmet| unmet.reason)
    }

    // Test IDs: PLN-001
    #[test]
    fn snap_user_with_low_iron_gets_benefit_compatible_iron_source() {
        let mut profile = with_lab(base_profile(), "iron", LabValue::Numeric(50.0));
        profile.financials.snap = true;
        let catalog = index(vec![
            entry("cash-only-liver", 50, &[Nutrient::Iron], TravelClass::Walkable),
            snap(entry("frozen-spinach", 150, &[Nutrient::Iron], TravelClass::Walkable)),
            snap(entry("far-lentils", 40, &[Nutrient::Iron], TravelClass::CarRequired)),
        ]);

        let shopping = build(&evaluate(&profile), &catalog, &profile);
        let Some(item) = shopping.item_for(Nutrient::Iron) else {
            panic!("iron should be covered: {:?}", shopping.unmet);
        };
        assert_eq!(item.entry_id, "frozen-spinach");
        assert!(item.benefit_restricted);
        assert!(shopping.budget.spent <= Money::from_dollars(60));
    }

    #[test]
    fn pantry_wins_when_remaining_budget_is_low() {
        let profile = base_profile();
        let catalog = index(vec![
            entry("cheap-beans", 89, &[Nutrient::Iron], TravelClass::Walkable),
            entry("pantry-beans", 0, &[Nutrient::Iron], TravelClass::Pantry),
        ]);

        let shopping = build(&[need(Nutrient::Iron, Priority::Critical)], &catalog, &profile);
        assert_eq!(shopping.items[0].entry_id, "pantry-beans");
        assert_eq!(shopping.items[0].selection, SelectionBasis::PantryPreferred);

        let mut generous = profile;
        generous.financials.weekly_budget = Money::from_dollars(250);
        let pricey_pantry = index(vec![
            entry("cheap-beans", 89, &[Nutrient::Iron], TravelClass::Walkable),
            entry("pantry-box", 150, &[Nutrient::Iron], TravelClass::Pantry),
        ]);
        let shopping =
            build(&[need(Nutrient::Iron, Priority::Critical)], &pricey_pantry, &generous);
        assert_eq!(shopping.items[0].entry_id, "cheap-beans");
        assert_eq!(shopping.items[0].selection, SelectionBasis::LowestPrice);
    }

    #[test]
    fn price_ties_break_on_potency_then_id() {
        let mut profile = base_profile();
        profile.financials.weekly_budget = Money::from_dollars(200);
        let mut potent = entry("z-kale", 200, &[Nutrient::Iron], TravelClass::Walkable);
        potent.nutrients =
            vec![NutrientSupply { nutrient: Nutrient::Iron, potency: Some(Potency::High) }];
        let catalog = index(vec![
            entry("a-chard", 200, &[Nutrient::Iron], TravelClass::Walkable),
            potent,
            entry("m-lentils", 200, &[Nutrient::Iron], TravelClass::Walkable),
        ]);

        let shopping = build(&[need(Nutrient::Iron, Priority::High)], &catalog, &profile);
        assert_eq!(shopping.items[0].entry_id, "z-kale");
    }

    // Test IDs: PLN-003
    #[test]
    fn allergen_only_sources_leave_the_need_unmet() {
        let mut profile = base_profile();
        profile.medical.allergies.insert("fish".to_string());
        let mut salmon = entry("salmon", 350, &[Nutrient::Omega3], TravelClass::Walkable);
        salmon.allergens.insert("fish".to_string());
        let mut sardines = entry("sardines", 200, &[Nutrient::Omega3], TravelClass::Walkable);
        sardines.allergens.insert("fish".to_string());
        let catalog = index(vec![
            salmon,
            sardines,
            entry("beans", 89, &[Nutrient::Iron], TravelClass::Walkable),
        ]);

        let shopping = build(&[need(Nutrient::Omega3, Priority::High)], &catalog, &profile);
        assert!(shopping.items.is_empty());
        let Some(unmet) = shopping.unmet_for(Nutrient::Omega3) else {
            panic!("omega3 should be unmet");
        };
        assert_eq!(unmet.reason, UnmetReason::AllergenExcluded);
        assert_eq!(unmet.excluded_entries, vec!["salmon".to_string(), "sardines".to_string()]);
    }

    #[test]
    fn plan_warns_about_missing_labs_and_allergen_limited_sources() {
        let mut profile = base_profile();
        profile.medical.allergies.insert("shellfish".to_string());
        let mut mussels = entry("mussels", 900, &[Nutrient::Iron], TravelClass::Walkable);
        mussels.allergens.insert("shellfish".to_string());
        let catalog = index(vec![
            mussels,
            entry("beans", 89, &[Nutrient::Iron], TravelClass::Walkable),
            entry("oats", 120, &[Nutrient::Fiber], TravelClass::Walkable),
        ]);

        let shopping = build(
            &[need(Nutrient::Iron, Priority::Critical), need(Nutrient::Fiber, Priority::High)],
            &catalog,
            &profile,
        );
        assert_eq!(
            shopping.warnings,
            vec![
                PlanWarning::NoLabResults,
                PlanWarning::AllergenLimitedSources {
                    nutrient: Nutrient::Iron,
                    excluded_entries: vec!["mussels".to_string()],
                },
            ]
        );
        assert!(shopping.warnings[0].message().starts_with("No lab results provided"));

        let tested = with_lab(profile, "iron", LabValue::Numeric(80.0));
        let quiet = build(&[need(Nutrient::Fiber, Priority::High)], &catalog, &tested);
        assert!(quiet.warnings.is_empty());
    }

    #[test]
    fn unmet_reasons_name_the_deciding_stage() {
        let mut profile = base_profile();
        profile.logistics.has_public_transit = false;
        profile.financials.weekly_budget = Money::from_cents(100);
        let catalog = index(vec![
            entry("salmon-far", 350, &[Nutrient::Omega3], TravelClass::TransitAccessible),
            entry("walnuts", 600, &[Nutrient::Magnesium], TravelClass::Walkable),
        ]);
        let needs = [
            need(Nutrient::Chromium, Priority::Critical),
            need(Nutrient::Omega3, Priority::High),
            need(Nutrient::Magnesium, Priority::Moderate),
        ];

        let shopping = build(&needs, &catalog, &profile);
        assert_eq!(unmet_reason(&shopping, Nutrient::Chromium), Some(UnmetReason::NoSource));
        assert_eq!(unmet_reason(&shopping, Nutrient::Omega3), Some(UnmetReason::Inaccessible));
        assert_eq!(unmet_reason(&shopping, Nutrient::Magnesium), Some(UnmetReason::OverBudget));
        assert_eq!(shopping.budget.spent, Money::ZERO);
    }

    #[test]
    fn listed_entries_absorb_later_needs_without_new_cost() {
        let mut profile = base_profile();
        profile.financials.weekly_budget = Money::from_cents(300);
        let catalog = index(vec![
            entry("spinach", 250, &[Nutrient::Iron, Nutrient::Magnesium], TravelClass::Walkable),
            entry("walnuts", 600, &[Nutrient::Magnesium], TravelClass::Walkable),
        ]);
        let needs =
            [need(Nutrient::Magnesium, Priority::Moderate), need(Nutrient::Iron, Priority::Critical)];

        let shopping = build(&needs, &catalog, &profile);
        assert_eq!(shopping.items.len(), 1);
        assert_eq!(shopping.items[0].addresses, vec![Nutrient::Iron, Nutrient::Magnesium]);
        assert_eq!(shopping.items[0].priority, Priority::Critical);
        assert_eq!(shopping.budget.spent, Money::from_cents(250));
        assert!(shopping.items[0].reason.contains("Iron (CRITICAL), Magnesium (MODERATE)"));
    }

    #[test]
    fn items_are_ranked_by_priority_then_price() {
        let mut profile = base_profile();
        profile.financials.weekly_budget = Money::from_dollars(150);
        let catalog = index(vec![
            entry("broccoli", 175, &[Nutrient::Fiber], TravelClass::Walkable),
            entry("beans", 89, &[Nutrient::Chromium], TravelClass::Walkable),
            entry("spinach", 250, &[Nutrient::Iron], TravelClass::Walkable),
            entry("milk", 300, &[Nutrient::VitaminD], TravelClass::Walkable),
        ]);
        let needs = [
            need(Nutrient::Fiber, Priority::High),
            need(Nutrient::Chromium, Priority::High),
            need(Nutrient::Iron, Priority::Critical),
            need(Nutrient::VitaminD, Priority::Critical),
        ];

        let shopping = build(&needs, &catalog, &profile);
        let order: Vec<(usize, &str)> =
            shopping.items.iter().map(|item| (item.rank, item.entry_id.as_str())).collect();
        assert_eq!(order, vec![(1, "spinach"), (2, "milk"), (3, "beans"), (4, "broccoli")]);
        assert_eq!(
            shopping.budget.by_priority.get(&Priority::Critical),
            Some(&Money::from_cents(550))
        );
        assert_eq!(
            shopping.budget.by_source.get("Fixture Market"),
            Some(&Money::from_cents(814))
        );
    }

    #[test]
    fn plan_carries_determinism_metadata() {
        let profile = base_profile();
        let catalog = index(vec![entry("beans", 89, &[Nutrient::Iron], TravelClass::Walkable)]);
        let shopping = build(&[need(Nutrient::Iron, Priority::High)], &catalog, &profile);

        assert_eq!(shopping.determinism.ruleset_version, RULESET_VERSION);
        assert_eq!(shopping.determinism.catalog_fingerprint, catalog.fingerprint());
        assert!(shopping.determinism.snapshot_id.starts_with("snap_"));
        assert_eq!(
            shopping.plan_id,
            format!("plan_1760000000_{}", shopping.determinism.snapshot_id)
        );
        assert!(!shopping.ordering_trace.is_empty());
        assert_eq!(shopping.budget.budget_tier, BudgetTier::Low);
    }

    #[test]
    fn budget_summary_totals_line_items() {
        let items = vec![
            ShoppingListItem {
                rank: 1,
                entry_id: "a".to_string(),
                name: "A".to_string(),
                source: "Store".to_string(),
                price: Money::from_cents(250),
                priority: Priority::High,
                travel_class: TravelClass::Walkable,
                addresses: vec![Nutrient::Iron],
                selection: SelectionBasis::LowestPrice,
                benefit_restricted: false,
                reason: String::new(),
            },
            ShoppingListItem {
                rank: 2,
                entry_id: "b".to_string(),
                name: "B".to_string(),
                source: "Pantry".to_string(),
                price: Money::ZERO,
                priority: Priority::Low,
                travel_class: TravelClass::Pantry,
                addresses: vec![Nutrient::Fiber],
                selection: SelectionBasis::PantryPreferred,
                benefit_restricted: false,
                reason: String::new(),
            },
        ];

        let summary = BudgetSummary::from_items(Money::from_dollars(40), &items);
        assert_eq!(summary.spent, Money::from_cents(250));
        assert_eq!(summary.remaining, Money::from_cents(3_750));
        assert_eq!(summary.budget_tier, BudgetTier::VeryLow);
        assert_eq!(summary.line_items.len(), 2);
        assert_eq!(summary.by_source.get("Pantry"), Some(&Money::ZERO));
    }

    fn seeded_permutation<T: Clone>(values: &[T], seed: u64) -> Vec<T> {
        fn splitmix64(mut value: u64) -> u64 {
            value = value.wrapping_add(0x9E37_79B9_7F4A_7C15);
            value = (value ^ (value >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
            value = (value ^ (value >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
            value ^ (value >> 31)
        }

        let mut keyed = values
            .iter()
            .cloned()
            .enumerate()
            .map(|(position, value)| {
                let position_u64 = u64::try_from(position).unwrap_or(u64::MAX);
                (splitmix64(seed ^ position_u64), value)
            })
            .collect::<Vec<_>>();
        keyed.sort_by_key(|(key, _)| *key);
        keyed.into_iter().map(|(_, value)| value).collect()
    }

    fn arb_entry(id: usize) -> impl Strategy<Value = CatalogEntry> {
        (
            0_u64..900,
            prop::collection::btree_set(prop::sample::select(Nutrient::ALL.to_vec()), 1..4),
            prop::sample::select(vec![
                TravelClass::Pantry,
                TravelClass::Walkable,
                TravelClass::TransitAccessible,
                TravelClass::CarRequired,
            ]),
            any::<bool>(),
            prop::option::of(prop::sample::select(vec!["fish", "dairy", "peanut"])),
        )
            .prop_map(move |(price, nutrients, travel_class, snap_eligible, allergen)| {
                let nutrients: Vec<Nutrient> = nutrients.into_iter().collect();
                let mut generated =
                    entry(&format!("entry-{id:02}"), price, &nutrients, travel_class);
                generated.snap_eligible = snap_eligible;
                generated.allergens = allergen.into_iter().map(str::to_string).collect();
                generated
            })
    }

    fn arb_catalog() -> impl Strategy<Value = Vec<CatalogEntry>> {
        (1_usize..14).prop_flat_map(|count| (0..count).map(arb_entry).collect::<Vec<_>>())
    }

    fn arb_needs() -> impl Strategy<Value = Vec<NutrientNeed>> {
        prop::collection::btree_map(
            prop::sample::select(Nutrient::ALL.to_vec()),
            prop::sample::select(vec![
                Priority::Low,
                Priority::Moderate,
                Priority::High,
                Priority::Critical,
            ]),
            1..8,
        )
        .prop_map(|needs| {
            needs.into_iter().map(|(nutrient, priority)| need(nutrient, priority)).collect()
        })
    }

    fn arb_profile() -> impl Strategy<Value = UserProfile> {
        let allergies =
            prop::collection::btree_set(prop::sample::select(vec!["fish", "dairy", "peanut"]), 0..3);
        (0_u64..3_000, any::<bool>(), any::<bool>(), any::<bool>(), allergies)
            .prop_map(|(budget, has_vehicle, has_public_transit, snap_holder, allergies)| {
                let mut profile = base_profile();
                profile.financials.weekly_budget = Money::from_cents(budget);
                profile.financials.snap = snap_holder;
                profile.logistics.has_vehicle = has_vehicle;
                profile.logistics.has_public_transit = has_public_transit;
                profile.medical.allergies =
                    allergies.into_iter().map(str::to_string).collect::<BTreeSet<_>>();
                profile
            })
    }

    fn catalog_from(entries: Vec<CatalogEntry>) -> CatalogIndex {
        match CatalogIndex::new(Catalog { catalog_id: "generated".to_string(), entries }) {
            Ok(catalog) => catalog,
            Err(err) => panic!("generated catalog should index: {err}"),
        }
    }

    // Test IDs: PLN-DET
    proptest! {
        #[test]
        fn plan_is_deterministic_under_seeded_permutations(
            entries in arb_catalog(),
            needs in arb_needs(),
            profile in arb_profile(),
            seed_a in any::<u64>(),
            seed_b in any::<u64>(),
        ) {
            let catalog_a = catalog_from(seeded_permutation(&entries, seed_a));
            let catalog_b = catalog_from(seeded_permutation(&entries, seed_b));
            let needs_a = seeded_permutation(&needs, seed_b);
            let needs_b = seeded_permutation(&needs, seed_a);

            let plan_a = build(&needs_a, &catalog_a, &profile);
            let plan_b = build(&needs_b, &catalog_b, &profile);
            prop_assert_eq!(plan_a, plan_b);
        }

        #[test]
        fn plan_respects_allergies_reachability_and_budget(
            entries in arb_catalog(),
            needs in arb_needs(),
            profile in arb_profile(),
        ) {
            let catalog = catalog_from(entries);
            let shopping = build(&needs, &catalog, &profile);
            let reachability = Reachability::for_profile(&profile);

            prop_assert!(shopping.budget.spent <= profile.financials.weekly_budget);
            let mut covered = BTreeSet::new();
            for item in &shopping.items {
                prop_assert!(!item.addresses.is_empty());
                let Some(listed) = catalog.get(&item.entry_id) else {
                    return Err(TestCaseError::fail("item must exist in the catalog"));
                };
                prop_assert!(listed.allergen_conflict(&profile.medical.allergies).is_none());
                prop_assert!(reachability.allows(listed.travel_class));
                for nutrient in &item.addresses {
                    prop_assert!(listed.provides(*nutrient));
                    prop_assert!(covered.insert(*nutrient), "nutrient covered twice");
                }
            }
            let ids: BTreeSet<&str> =
                shopping.items.iter().map(|item| item.entry_id.as_str()).collect();
            prop_assert_eq!(ids.len(), shopping.items.len());
            prop_assert_eq!(covered.len() + shopping.unmet.len(), shopping.needs.len());
        }
    }
}
