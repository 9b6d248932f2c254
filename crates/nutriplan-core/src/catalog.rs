use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{normalize_term, Money, Nutrient, NutriplanError, UserProfile};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TravelClass {
    Pantry,
    Walkable,
    TransitAccessible,
    CarRequired,
}

impl TravelClass {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pantry => "pantry",
            Self::Walkable => "walkable",
            Self::TransitAccessible => "transit_accessible",
            Self::CarRequired => "car_required",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Potency {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct NutrientSupply {
    pub nutrient: Nutrient,
    #[serde(default)]
    pub potency: Option<Potency>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct CatalogEntry {
    pub id: String,
    pub name: String,
    pub source: String,
    #[serde(rename = "price_cents")]
    pub price: Money,
    pub nutrients: Vec<NutrientSupply>,
    #[serde(default)]
    pub snap_eligible: bool,
    #[serde(default)]
    pub wic_eligible: bool,
    pub travel_class: TravelClass,
    #[serde(default)]
    pub allergens: BTreeSet<String>,
}

impl CatalogEntry {
    #[must_use]
    pub fn provides(&self, nutrient: Nutrient) -> bool {
        self.nutrients.iter().any(|supply| supply.nutrient == nutrient)
    }

    #[must_use]
    pub fn potency_for(&self, nutrient: Nutrient) -> Option<Potency> {
        self.nutrients
            .iter()
            .find(|supply| supply.nutrient == nutrient)
            .and_then(|supply| supply.potency)
    }

    #[must_use]
    pub fn is_pantry(&self) -> bool {
        self.travel_class == TravelClass::Pantry
    }

    /// First allergy this entry conflicts with, by allergen tag or by appearing in the entry name.
    #[must_use]
    pub fn allergen_conflict<'a>(&self, allergies: &'a BTreeSet<String>) -> Option<&'a str> {
        let tags: BTreeSet<String> = self.allergens.iter().map(|tag| normalize_term(tag)).collect();
        let name = normalize_term(&self.name);
        allergies
            .iter()
            .find(|allergy| {
                let allergy = normalize_term(allergy);
                !allergy.is_empty() && (tags.contains(&allergy) || name.contains(&allergy))
            })
            .map(String::as_str)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Catalog {
    pub catalog_id: String,
    pub entries: Vec<CatalogEntry>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct Benefits {
    pub snap: bool,
    pub wic: bool,
}

impl Benefits {
    #[must_use]
    pub fn any(self) -> bool {
        self.snap || self.wic
    }

    /// Pantry entries are free and count as compatible with any benefit program.
    #[must_use]
    pub fn accepts(self, entry: &CatalogEntry) -> bool {
        entry.is_pantry() || (self.snap && entry.snap_eligible) || (self.wic && entry.wic_eligible)
    }
}

/// Travel classes a user can reach with their available transportation.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Reachability {
    classes: BTreeSet<TravelClass>,
}

impl Reachability {
    #[must_use]
    pub fn for_profile(profile: &UserProfile) -> Self {
        Self::from_transport(profile.logistics.has_vehicle, profile.logistics.has_public_transit)
    }

    #[must_use]
    pub fn from_transport(has_vehicle: bool, has_public_transit: bool) -> Self {
        let mut classes = BTreeSet::from([TravelClass::Pantry, TravelClass::Walkable]);
        if has_vehicle || has_public_transit {
            classes.insert(TravelClass::TransitAccessible);
        }
        if has_vehicle {
            classes.insert(TravelClass::CarRequired);
        }
        Self { classes }
    }

    #[must_use]
    pub fn allows(&self, class: TravelClass) -> bool {
        self.classes.contains(&class)
    }

    #[must_use]
    pub fn classes(&self) -> Vec<TravelClass> {
        self.classes.iter().copied().collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct EligibilityFilter {
    pub benefits: Benefits,
    pub reachability: Reachability,
}

impl EligibilityFilter {
    #[must_use]
    pub fn for_profile(profile: &UserProfile) -> Self {
        Self { benefits: profile.benefits(), reachability: Reachability::for_profile(profile) }
    }
}

/// Immutable catalog with a nutrient lookup index. Entries are held in id order.
#[derive(Debug, Clone)]
pub struct CatalogIndex {
    catalog_id: String,
    entries: Vec<CatalogEntry>,
    by_id: BTreeMap<String, usize>,
    by_nutrient: BTreeMap<Nutrient, Vec<usize>>,
    fingerprint: String,
}

impl CatalogIndex {
    /// Validate a catalog and build its lookup tables.
    ///
    /// # Errors
    /// Returns [`NutriplanError::InvalidCatalog`] when the catalog id is blank, an entry has a
    /// blank id, name, or source, an id repeats, or an entry provides no nutrients.
    pub fn new(catalog: Catalog) -> Result<Self, NutriplanError> {
        if catalog.catalog_id.trim().is_empty() {
            return Err(NutriplanError::InvalidCatalog("catalog_id MUST be provided".to_string()));
        }

        let mut entries = catalog.entries;
        for entry in &entries {
            validate_entry(entry)?;
        }
        entries.sort_by(|lhs, rhs| lhs.id.cmp(&rhs.id));

        let mut by_id = BTreeMap::new();
        let mut by_nutrient: BTreeMap<Nutrient, Vec<usize>> = BTreeMap::new();
        for (position, entry) in entries.iter().enumerate() {
            if by_id.insert(entry.id.clone(), position).is_some() {
                return Err(NutriplanError::InvalidCatalog(format!(
                    "entry id `{}` MUST be unique",
                    entry.id
                )));
            }
            for supply in &entry.nutrients {
                by_nutrient.entry(supply.nutrient).or_default().push(position);
            }
        }

        let fingerprint = fingerprint(&catalog.catalog_id, &entries)?;
        Ok(Self { catalog_id: catalog.catalog_id, entries, by_id, by_nutrient, fingerprint })
    }

    #[must_use]
    pub fn catalog_id(&self) -> &str {
        &self.catalog_id
    }

    #[must_use]
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn entries(&self) -> &[CatalogEntry] {
        &self.entries
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<&CatalogEntry> {
        self.by_id.get(id).map(|position| &self.entries[*position])
    }

    /// Entries that supply `nutrient`, in id order.
    #[must_use]
    pub fn entries_providing(&self, nutrient: Nutrient) -> Vec<&CatalogEntry> {
        self.by_nutrient
            .get(&nutrient)
            .map(|positions| positions.iter().map(|position| &self.entries[*position]).collect())
            .unwrap_or_default()
    }
}

fn validate_entry(entry: &CatalogEntry) -> Result<(), NutriplanError> {
    if entry.id.trim().is_empty() {
        return Err(NutriplanError::InvalidCatalog("entry id MUST be provided".to_string()));
    }
    if entry.name.trim().is_empty() {
        return Err(NutriplanError::InvalidCatalog(format!(
            "entry `{}` MUST have a name",
            entry.id
        )));
    }
    if entry.source.trim().is_empty() {
        return Err(NutriplanError::InvalidCatalog(format!(
            "entry `{}` MUST name its source",
            entry.id
        )));
    }
    if entry.nutrients.is_empty() {
        return Err(NutriplanError::InvalidCatalog(format!(
            "entry `{}` MUST provide at least one nutrient",
            entry.id
        )));
    }
    let distinct: BTreeSet<Nutrient> = entry.nutrients.iter().map(|supply| supply.nutrient).collect();
    if distinct.len() != entry.nutrients.len() {
        return Err(NutriplanError::InvalidCatalog(format!(
            "entry `{}` MUST list each nutrient once",
            entry.id
        )));
    }
    Ok(())
}

fn fingerprint(catalog_id: &str, entries: &[CatalogEntry]) -> Result<String, NutriplanError> {
    let body = serde_json::to_vec(entries).map_err(|err| {
        NutriplanError::InvalidCatalog(format!("catalog could not be serialized: {err}"))
    })?;
    let mut hasher = Sha256::new();
    hasher.update(catalog_id.as_bytes());
    hasher.update([0_u8]);
    hasher.update(&body);
    Ok(format!("sha256:{}", hex::encode(hasher.finalize())))
}

#[must_use]
pub fn exclude_allergens<'a>(
    entries: &[&'a CatalogEntry],
    allergies: &BTreeSet<String>,
) -> Vec<&'a CatalogEntry> {
    entries.iter().copied().filter(|entry| entry.allergen_conflict(allergies).is_none()).collect()
}

#[must_use]
pub fn filter_reachable<'a>(
    entries: &[&'a CatalogEntry],
    reachability: &Reachability,
) -> Vec<&'a CatalogEntry> {
    entries.iter().copied().filter(|entry| reachability.allows(entry.travel_class)).collect()
}

#[must_use]
pub fn filter_benefit_eligible<'a>(
    entries: &[&'a CatalogEntry],
    benefits: Benefits,
) -> Vec<&'a CatalogEntry> {
    entries.iter().copied().filter(|entry| benefits.accepts(entry)).collect()
}

/// Reachable entries, restricted to benefit-compatible ones when the user holds benefits.
#[must_use]
pub fn filter_by_eligibility<'a>(
    entries: &[&'a CatalogEntry],
    filter: &EligibilityFilter,
) -> Vec<&'a CatalogEntry> {
    let reachable = filter_reachable(entries, &filter.reachability);
    if filter.benefits.any() {
        filter_benefit_eligible(&reachable, filter.benefits)
    } else {
        reachable
    }
}
