use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use nutriplan_api::{
    load_catalog, load_config, load_profile, sample_catalog, sample_profile, Session,
};
use nutriplan_core::{
    default_need_tie_breakers, exclude_allergens, filter_by_eligibility, Catalog, CatalogEntry,
    CatalogIndex, EligibilityFilter, Nutrient, NutriplanConfig, NutriplanError, Priority,
    UserProfile, RULESET_VERSION,
};
use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

mod interactive;
mod render;

const CLI_CONTRACT_VERSION: &str = "cli.v1";
const LOG_ENV: &str = "NP_LOG";
const NOT_FOUND_EXIT: u8 = 2;
const INVALID_INPUT_EXIT: u8 = 1;

#[derive(Debug, Parser)]
#[command(name = "np")]
#[command(about = "Nutriplan: biomarker-driven nutrition priorities and shopping plans")]
struct Cli {
    #[command(flatten)]
    inputs: InputArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Args)]
struct InputArgs {
    /// Profile document (JSON or YAML). Defaults to the bundled sample user.
    #[arg(long, global = true)]
    profile: Option<PathBuf>,
    /// Catalog document (JSON or YAML). Defaults to the bundled synthetic catalog.
    #[arg(long, global = true)]
    catalog: Option<PathBuf>,
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// RFC 3339 UTC timestamp stamped on the plan. Defaults to now.
    #[arg(long, global = true)]
    as_of: Option<String>,
}

#[derive(Debug, Subcommand)]
enum Command {
    Evaluate(EvaluateArgs),
    Plan,
    Explain {
        #[command(subcommand)]
        command: Box<ExplainCommand>,
    },
    Budget,
    Catalog {
        #[command(subcommand)]
        command: Box<CatalogCommand>,
    },
    Profile {
        #[command(subcommand)]
        command: Box<ProfileCommand>,
    },
    Config {
        #[command(subcommand)]
        command: Box<ConfigCommand>,
    },
    /// Interactive text session over stdin/stdout.
    Session,
}

#[derive(Debug, Args)]
struct EvaluateArgs {
    #[arg(long)]
    min_priority: Option<PriorityArg>,
}

#[derive(Debug, Subcommand)]
enum ExplainCommand {
    Food(QueryArgs),
    Nutrient(QueryArgs),
}

#[derive(Debug, Args)]
struct QueryArgs {
    query: String,
}

#[derive(Debug, Subcommand)]
enum CatalogCommand {
    List(CatalogListArgs),
}

#[derive(Debug, Args)]
struct CatalogListArgs {
    #[arg(long)]
    nutrient: Option<String>,
    /// Only entries the profile can reach, afford with its benefits, and safely eat.
    #[arg(long, default_value_t = false)]
    eligible: bool,
}

#[derive(Debug, Subcommand)]
enum ProfileCommand {
    Validate,
    Show,
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    Show,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum PriorityArg {
    Low,
    Moderate,
    High,
    Critical,
}

impl From<PriorityArg> for Priority {
    fn from(value: PriorityArg) -> Self {
        match value {
            PriorityArg::Low => Self::Low,
            PriorityArg::Moderate => Self::Moderate,
            PriorityArg::High => Self::High,
            PriorityArg::Critical => Self::Critical,
        }
    }
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn emit_error(kind: &str, message: &str, code: u8) -> Result<ExitCode> {
    emit_json(serde_json::json!({
        "error": {
            "kind": kind,
            "message": message
        }
    }))?;
    Ok(ExitCode::from(code))
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    let parsed = OffsetDateTime::parse(value, &Rfc3339)
        .with_context(|| format!("invalid RFC3339 timestamp: {value}"))?;
    if parsed.offset() != time::UtcOffset::UTC {
        return Err(anyhow!("timestamp MUST use UTC offset Z (received: {value})"));
    }
    Ok(parsed)
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init();
}

impl InputArgs {
    fn profile(&self) -> Result<UserProfile> {
        match self.profile.as_deref() {
            Some(path) => load_profile(path),
            None => sample_profile(),
        }
    }

    fn catalog(&self) -> Result<Catalog> {
        match self.catalog.as_deref() {
            Some(path) => load_catalog(path),
            None => sample_catalog(),
        }
    }

    fn config(&self) -> Result<NutriplanConfig> {
        self.config.as_deref().map_or_else(|| Ok(NutriplanConfig::default()), load_config)
    }

    fn as_of(&self) -> Result<OffsetDateTime> {
        self.as_of.as_deref().map_or_else(|| Ok(OffsetDateTime::now_utc()), parse_rfc3339)
    }

    fn session(&self) -> Result<Session> {
        Session::start(self.profile()?, self.catalog()?, self.config()?, self.as_of()?)
    }
}

fn main() -> Result<ExitCode> {
    init_tracing();
    let cli = Cli::parse();
    let inputs = &cli.inputs;
    match cli.command {
        Command::Evaluate(args) => run_evaluate(&args, inputs),
        Command::Plan => {
            let session = inputs.session()?;
            emit_json(serde_json::to_value(session.plan())?)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Explain { command } => run_explain(&command, &inputs.session()?),
        Command::Budget => {
            let session = inputs.session()?;
            emit_json(serde_json::to_value(session.budget_summary())?)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Catalog { command } => run_catalog(&command, inputs),
        Command::Profile { command } => run_profile(&command, inputs),
        Command::Config { command } => match *command {
            ConfigCommand::Show => {
                emit_json(serde_json::to_value(inputs.config()?)?)?;
                Ok(ExitCode::SUCCESS)
            }
        },
        Command::Session => {
            let session = inputs.session()?;
            let stdin = std::io::stdin();
            let mut input = stdin.lock();
            let mut output = std::io::stdout();
            interactive::run_interactive(&session, &mut input, &mut output)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn run_evaluate(args: &EvaluateArgs, inputs: &InputArgs) -> Result<ExitCode> {
    let session = inputs.session()?;
    let floor = args.min_priority.map_or(Priority::Low, Priority::from);
    let needs: Vec<_> = session.needs().iter().filter(|need| need.priority >= floor).collect();
    emit_json(serde_json::json!({
        "profile_id": session.profile().profile_id,
        "ruleset_version": RULESET_VERSION,
        "min_priority": floor.as_str(),
        "tie_breakers": default_need_tie_breakers(),
        "needs": needs
    }))?;
    Ok(ExitCode::SUCCESS)
}

fn run_explain(command: &ExplainCommand, session: &Session) -> Result<ExitCode> {
    let explained = match command {
        ExplainCommand::Food(args) => session.explain_food(&args.query).map(serde_json::to_value),
        ExplainCommand::Nutrient(args) => {
            session.explain_nutrient(&args.query).map(serde_json::to_value)
        }
    };
    match explained {
        Ok(value) => {
            emit_json(value?)?;
            Ok(ExitCode::SUCCESS)
        }
        Err(NutriplanError::NotFound(message)) => {
            emit_error("not_found", &message, NOT_FOUND_EXIT)
        }
        Err(other) => Err(other.into()),
    }
}

fn run_catalog(command: &CatalogCommand, inputs: &InputArgs) -> Result<ExitCode> {
    match command {
        CatalogCommand::List(args) => {
            let index = CatalogIndex::new(inputs.catalog()?)?;
            let mut entries: Vec<&CatalogEntry> = match args.nutrient.as_deref() {
                Some(query) => {
                    let nutrient = Nutrient::resolve(query)
                        .ok_or_else(|| anyhow!("unknown nutrient `{query}`"))?;
                    index.entries_providing(nutrient)
                }
                None => index.entries().iter().collect(),
            };
            if args.eligible {
                let profile = inputs.profile()?;
                let eligible =
                    filter_by_eligibility(&entries, &EligibilityFilter::for_profile(&profile));
                entries = exclude_allergens(&eligible, &profile.medical.allergies);
            }

            emit_json(serde_json::json!({
                "catalog_id": index.catalog_id(),
                "fingerprint": index.fingerprint(),
                "count": entries.len(),
                "entries": entries
            }))?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn run_profile(command: &ProfileCommand, inputs: &InputArgs) -> Result<ExitCode> {
    match command {
        ProfileCommand::Validate => match inputs.profile() {
            Ok(profile) => {
                emit_json(serde_json::json!({
                    "profile_id": profile.profile_id,
                    "source": source_label(inputs.profile.as_deref()),
                    "valid": true
                }))?;
                Ok(ExitCode::SUCCESS)
            }
            Err(err) => match err.downcast_ref::<NutriplanError>() {
                Some(NutriplanError::InvalidProfile(message)) => {
                    emit_json(serde_json::json!({
                        "source": source_label(inputs.profile.as_deref()),
                        "valid": false,
                        "error": message
                    }))?;
                    Ok(ExitCode::from(INVALID_INPUT_EXIT))
                }
                _ => Err(err),
            },
        },
        ProfileCommand::Show => {
            let session = inputs.session()?;
            emit_json(serde_json::json!({
                "summary": session.summary(),
                "profile": session.profile(),
                "markers": session.markers()
            }))?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn source_label(path: Option<&Path>) -> String {
    path.map_or_else(|| "sample".to_string(), |path| path.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contract_version_wraps_non_objects() {
        let wrapped = with_contract_version(serde_json::json!([1, 2]));
        assert_eq!(wrapped["contract_version"], CLI_CONTRACT_VERSION);
        assert_eq!(wrapped["payload"], serde_json::json!([1, 2]));

        let object = with_contract_version(serde_json::json!({"a": 1}));
        assert_eq!(object["contract_version"], CLI_CONTRACT_VERSION);
        assert_eq!(object["a"], 1);
    }

    #[test]
    fn as_of_requires_utc() {
        assert!(parse_rfc3339("2025-10-09T08:00:00Z").is_ok());
        assert!(parse_rfc3339("2025-10-09T08:00:00+02:00").is_err());
        assert!(parse_rfc3339("yesterday").is_err());
    }
}
