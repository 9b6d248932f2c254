use std::fmt::{Display, Formatter};
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use nutriplan_core::{
    classify_labs, evaluate_with, plan, BudgetSummary, BudgetTier, Catalog, CatalogIndex,
    Explainer, FoodExplanation, MarkerReading, Mobility, Money, NutrientExplanation, NutrientNeed,
    NutriplanConfig, NutriplanError, PlanWarning, RuleSet, ShoppingPlan, UserProfile,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use ulid::Ulid;

pub const API_CONTRACT_VERSION: &str = "api.v1";

const SAMPLE_PROFILE_YAML: &str = include_str!("../fixtures/sample_profile.yaml");
const SAMPLE_CATALOG_YAML: &str = include_str!("../fixtures/sample_catalog.yaml");

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum DocumentFormat {
    Json,
    Yaml,
}

impl DocumentFormat {
    /// Pick a format from a file extension.
    ///
    /// # Errors
    /// Returns an error when the extension is missing or is not `json`, `yaml`, or `yml`.
    pub fn from_path(path: &Path) -> Result<Self> {
        let extension = path
            .extension()
            .and_then(|value| value.to_str())
            .map(str::to_ascii_lowercase)
            .ok_or_else(|| anyhow!("{} has no file extension", path.display()))?;
        match extension.as_str() {
            "json" => Ok(Self::Json),
            "yaml" | "yml" => Ok(Self::Yaml),
            other => {
                Err(anyhow!("unsupported document extension `.{other}` for {}", path.display()))
            }
        }
    }
}

/// Deserialize a JSON or YAML document.
///
/// # Errors
/// Returns an error when `body` is not a valid document of the requested shape.
pub fn parse_document<T: DeserializeOwned>(body: &str, format: DocumentFormat) -> Result<T> {
    match format {
        DocumentFormat::Json => serde_json::from_str(body).context("failed to parse JSON document"),
        DocumentFormat::Yaml => serde_yaml::from_str(body).context("failed to parse YAML document"),
    }
}

fn read_document<T: DeserializeOwned>(path: &Path, label: &str) -> Result<T> {
    let format = DocumentFormat::from_path(path)?;
    let body = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {label} from {}", path.display()))?;
    parse_document(&body, format).with_context(|| format!("invalid {label} in {}", path.display()))
}

/// Parse and validate a profile document.
///
/// # Errors
/// Returns an error when the document does not parse, or wraps
/// [`NutriplanError::InvalidProfile`] when the profile fails validation.
pub fn parse_profile(body: &str, format: DocumentFormat) -> Result<UserProfile> {
    let profile: UserProfile = parse_document(body, format)?;
    profile.validate()?;
    Ok(profile)
}

/// Load and validate a user profile from a JSON or YAML file.
///
/// # Errors
/// Returns an error when the file cannot be read or parsed, or the profile is invalid.
pub fn load_profile(path: &Path) -> Result<UserProfile> {
    let profile: UserProfile = read_document(path, "profile")?;
    profile.validate()?;
    tracing::debug!(profile = %profile.profile_id, path = %path.display(), "loaded profile");
    Ok(profile)
}

/// Load a catalog from a JSON or YAML file. Structural validation happens when it is indexed.
///
/// # Errors
/// Returns an error when the file cannot be read or parsed.
pub fn load_catalog(path: &Path) -> Result<Catalog> {
    let catalog: Catalog = read_document(path, "catalog")?;
    tracing::debug!(
        catalog = %catalog.catalog_id,
        entries = catalog.entries.len(),
        path = %path.display(),
        "loaded catalog"
    );
    Ok(catalog)
}

/// Load planner configuration. Omitted fields keep their defaults.
///
/// # Errors
/// Returns an error when the file cannot be read or parsed.
pub fn load_config(path: &Path) -> Result<NutriplanConfig> {
    read_document(path, "config")
}

/// Load a catalog file and build its index.
///
/// # Errors
/// Returns an error when the file cannot be loaded, or wraps [`NutriplanError::InvalidCatalog`].
pub fn load_catalog_index(path: &Path) -> Result<CatalogIndex> {
    let catalog = load_catalog(path)?;
    Ok(CatalogIndex::new(catalog)?)
}

/// The bundled sample user.
///
/// # Errors
/// Returns an error if the bundled fixture fails to parse or validate.
pub fn sample_profile() -> Result<UserProfile> {
    parse_profile(SAMPLE_PROFILE_YAML, DocumentFormat::Yaml).context("bundled sample profile")
}

/// The bundled synthetic catalog of stores, markets, and pantries.
///
/// # Errors
/// Returns an error if the bundled fixture fails to parse.
pub fn sample_catalog() -> Result<Catalog> {
    parse_document(SAMPLE_CATALOG_YAML, DocumentFormat::Yaml).context("bundled sample catalog")
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(transparent)]
pub struct SessionId(pub Ulid);

impl SessionId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for SessionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionSummary {
    pub session_id: SessionId,
    pub profile_id: String,
    pub display_name: Option<String>,
    pub zip_code: String,
    pub budget_tier: BudgetTier,
    pub mobility: Mobility,
    pub snap: bool,
    pub wic: bool,
    pub needs: usize,
    pub items: usize,
    pub unmet: usize,
    #[serde(rename = "spent_cents")]
    pub spent: Money,
    #[serde(rename = "remaining_cents")]
    pub remaining: Money,
    pub warnings: Vec<String>,
}

/// One user's pipeline run. Needs and plan are computed once and answered from memory.
#[derive(Debug, Clone)]
pub struct Session {
    session_id: SessionId,
    profile: UserProfile,
    index: CatalogIndex,
    config: NutriplanConfig,
    plan: ShoppingPlan,
}

impl Session {
    /// Validate inputs, evaluate the profile, and plan against the catalog.
    ///
    /// # Errors
    /// Wraps [`NutriplanError::InvalidProfile`] or [`NutriplanError::InvalidCatalog`] when an
    /// input fails validation.
    pub fn start(
        profile: UserProfile,
        catalog: Catalog,
        config: NutriplanConfig,
        as_of: OffsetDateTime,
    ) -> Result<Self> {
        profile.validate()?;
        let index = CatalogIndex::new(catalog)?;
        Ok(Self::with_index(profile, index, config, as_of))
    }

    /// Start a session against an already indexed catalog. The profile must be validated.
    #[must_use]
    pub fn with_index(
        profile: UserProfile,
        index: CatalogIndex,
        config: NutriplanConfig,
        as_of: OffsetDateTime,
    ) -> Self {
        let session_id = SessionId::new();
        let needs = evaluate_with(&profile, &RuleSet::standard(), &config.thresholds);
        let shopping = plan(&needs, &index, &profile, &config.planner, as_of);
        tracing::info!(
            session = %session_id,
            profile = %profile.profile_id,
            catalog = index.catalog_id(),
            needs = shopping.needs.len(),
            items = shopping.items.len(),
            "session started"
        );

        Self { session_id, profile, index, config, plan: shopping }
    }

    #[must_use]
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    #[must_use]
    pub fn profile(&self) -> &UserProfile {
        &self.profile
    }

    #[must_use]
    pub fn catalog(&self) -> &CatalogIndex {
        &self.index
    }

    #[must_use]
    pub fn config(&self) -> &NutriplanConfig {
        &self.config
    }

    #[must_use]
    pub fn needs(&self) -> &[NutrientNeed] {
        &self.plan.needs
    }

    #[must_use]
    pub fn plan(&self) -> &ShoppingPlan {
        &self.plan
    }

    #[must_use]
    pub fn budget_summary(&self) -> &BudgetSummary {
        self.plan.budget()
    }

    /// # Errors
    /// Returns [`NutriplanError::NotFound`] when `query` matches no planned item.
    pub fn explain_food(&self, query: &str) -> Result<FoodExplanation, NutriplanError> {
        Explainer::new(&self.plan).explain_food(query)
    }

    /// # Errors
    /// Returns [`NutriplanError::NotFound`] when `query` is not a prioritized nutrient.
    pub fn explain_nutrient(&self, query: &str) -> Result<NutrientExplanation, NutriplanError> {
        Explainer::new(&self.plan).explain_nutrient(query)
    }

    #[must_use]
    pub fn markers(&self) -> Vec<MarkerReading> {
        classify_labs(&self.profile, &self.config.thresholds)
    }

    #[must_use]
    pub fn summary(&self) -> SessionSummary {
        let budget = self.plan.budget();
        SessionSummary {
            session_id: self.session_id,
            profile_id: self.profile.profile_id.clone(),
            display_name: self.profile.display_name.clone(),
            zip_code: self.profile.logistics.zip_code.clone(),
            budget_tier: self.profile.budget_tier(),
            mobility: self.profile.mobility(),
            snap: self.profile.financials.snap,
            wic: self.profile.financials.wic,
            needs: self.plan.needs.len(),
            items: self.plan.items.len(),
            unmet: self.plan.unmet.len(),
            spent: budget.spent,
            remaining: budget.remaining,
            warnings: self.plan.warnings.iter().map(PlanWarning::message).collect(),
        }
    }
}
