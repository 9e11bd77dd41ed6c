use crate::config::AppConfig;
use crate::error::GatewayError;
use crate::pipeline::executor::ExecuteOptions;
use crate::pipeline::generator::QueryGenerator;
use crate::pipeline::result_validator::ValidationLevel;
use crate::state::AppState;
use clap::Subcommand;
use serde_json::{Value, json};
use tracing::info;

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Generate SQL for a question without running it
    Generate {
        question: String,
        #[arg(short, long)]
        database: Option<String>,
    },
    /// Generate SQL for a question and run it
    Execute {
        question: String,
        #[arg(short, long)]
        database: Option<String>,
        /// Maximum rows to return
        #[arg(short, long)]
        limit: Option<usize>,
        /// Check the result against the question
        #[arg(long)]
        validate_result: bool,
        #[arg(long, value_enum)]
        validation_level: Option<ValidationLevel>,
    },
    /// Show cached schemas and pool state for every database
    ListDatabases,
    /// Reload cached schemas
    RefreshSchema {
        /// Refresh only this database
        #[arg(short, long)]
        database: Option<String>,
    },
}

fn target_database(config: &AppConfig, requested: Option<&str>) -> Result<String, GatewayError> {
    config.resolve_database(requested).ok_or_else(|| {
        GatewayError::InvalidInput(
            "no database given and no default configured; pass --database".to_string(),
        )
    })
}

fn question_text(question: &str) -> Result<&str, GatewayError> {
    let trimmed = question.trim();
    if trimmed.is_empty() {
        return Err(GatewayError::InvalidInput("question must not be empty".to_string()));
    }
    Ok(trimmed)
}

/// Runs one command against the gateway and returns its JSON output.
pub async fn run(state: &AppState, command: Command) -> Result<Value, GatewayError> {
    match command {
        Command::Generate { question, database } => {
            let question = question_text(&question)?;
            let database = target_database(&state.config, database.as_deref())?;
            let generated = state.generator.generate(question, &database).await?;
            Ok(serde_json::to_value(generated)?)
        }
        Command::Execute {
            question,
            database,
            limit,
            validate_result,
            validation_level,
        } => {
            let question = question_text(&question)?;
            let database = target_database(&state.config, database.as_deref())?;
            let options = ExecuteOptions {
                limit,
                validate_result: validate_result.then_some(true),
                validation_level,
            };
            let result = state.executor.execute(question, &database, options).await?;
            Ok(serde_json::to_value(result)?)
        }
        Command::ListDatabases => {
            let pools = state.pools.status();
            let mut databases = Vec::new();
            for summary in state.schema_manager.summaries().await {
                let mut value = serde_json::to_value(&summary)?;
                let pool = pools.iter().find(|p| p.database == summary.name);
                if let (Some(object), Some(pool)) = (value.as_object_mut(), pool) {
                    object.insert("pool".to_string(), serde_json::to_value(pool)?);
                }
                databases.push(value);
            }

            Ok(json!({
                "databases": databases,
                "default_database": state.config.resolve_database(None),
                "started_at": state.startup_time,
            }))
        }
        Command::RefreshSchema { database } => match database {
            Some(database) => {
                let snapshot = state.schema_manager.refresh_schema(&database).await?;
                info!(database = %database, "Schema refreshed on request");
                Ok(json!({
                    "refreshed": [database],
                    "failed": [],
                    "table_count": snapshot.table_count(),
                }))
            }
            None => {
                let failed = state.schema_manager.refresh_all().await;
                let refreshed: Vec<String> = state
                    .schema_manager
                    .list_databases()
                    .into_iter()
                    .filter(|name| !failed.contains(name))
                    .collect();
                Ok(json!({ "refreshed": refreshed, "failed": failed }))
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CliArgs;
    use clap::Parser;
    use pretty_assertions::assert_eq;

    const TWO_DATABASES: &str = r#"
        [[databases]]
        name = "sales"
        host = "localhost"
        database = "sales"
        user = "reader"

        [[databases]]
        name = "hr"
        host = "localhost"
        database = "hr"
        user = "reader"

        [llm]
        backend = "ollama"
        model = "llama3"
    "#;

    #[test]
    fn parses_execute_with_overrides() {
        let args = CliArgs::try_parse_from([
            "nl-gate",
            "execute",
            "top customers by revenue",
            "--database",
            "sales",
            "--limit",
            "25",
            "--validate-result",
            "--validation-level",
            "semantic",
        ])
        .unwrap();

        assert_eq!(
            args.command,
            Command::Execute {
                question: "top customers by revenue".to_string(),
                database: Some("sales".to_string()),
                limit: Some(25),
                validate_result: true,
                validation_level: Some(ValidationLevel::Semantic),
            }
        );
    }

    #[test]
    fn parses_refresh_without_database() {
        let args = CliArgs::try_parse_from(["nl-gate", "refresh-schema"]).unwrap();
        assert_eq!(args.command, Command::RefreshSchema { database: None });
    }

    #[test]
    fn rejects_unknown_validation_level() {
        let parsed = CliArgs::try_parse_from(["nl-gate", "execute", "q", "--validation-level", "strict"]);
        assert!(parsed.is_err());
    }

    #[test]
    fn ambiguous_database_is_invalid_input() {
        let config = AppConfig::from_toml_str(TWO_DATABASES).unwrap();

        let err = target_database(&config, None).unwrap_err();
        assert_eq!(err.error_code(), "INVALID_INPUT");
        assert_eq!(target_database(&config, Some("hr")).unwrap(), "hr");
    }

    #[test]
    fn blank_question_is_rejected() {
        assert!(question_text("   ").is_err());
        assert_eq!(question_text("  count orders ").unwrap(), "count orders");
    }
}
