use clap::Parser;
use nl_gate::commands;
use nl_gate::config::{AppConfig, CliArgs};
use nl_gate::error::GatewayError;
use nl_gate::state::AppState;
use nl_gate::util::logging::init_tracing;
use serde_json::Value;
use tracing::{error, info};

fn print_json(value: &Value) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{}", text),
        Err(e) => error!("Failed to render output: {}", e),
    }
}

fn fail(err: GatewayError) -> ! {
    error!(code = err.error_code(), "{}", err);
    print_json(&err.to_json());
    std::process::exit(1);
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse command line arguments
    let args = CliArgs::parse();

    // Initialize logging
    init_tracing(args.json_logs);

    // Load configuration
    let config = match AppConfig::new(&args) {
        Ok(config) => config,
        Err(e) => fail(e.into()),
    };

    let state = match AppState::initialize(config).await {
        Ok(state) => state,
        Err(e) => fail(e),
    };
    info!("Running command: {:?}", args.command);

    let outcome = commands::run(&state, args.command).await;
    state.shutdown().await;

    match outcome {
        Ok(value) => {
            print_json(&value);
            Ok(())
        }
        Err(e) => fail(e),
    }
}
