//! mapping-probe: query the directory the way the bridge does and print JSON.
//!
//! Usage:
//!   mapping-probe search <query> [limit]
//!   mapping-probe lookup <protocol id>
//!
//! Reads ~/.idbridge/config.json. `RUST_LOG=debug` shows the request flow.

use std::process::ExitCode;

use idbridge::config::load_config;
use idbridge::directory::client::DirectoryClient;
use idbridge::types::IdentityMapping;

const USAGE: &str = "usage: mapping-probe search <query> [limit] | mapping-probe lookup <protocol id>";

#[tokio::main]
async fn main() -> ExitCode {
    idbridge::init_logging();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let (command, target) = match (args.first(), args.get(1)) {
        (Some(command), Some(target)) => (command.as_str(), target.as_str()),
        _ => {
            eprintln!("{}", USAGE);
            return ExitCode::from(2);
        }
    };

    let config = match load_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::FAILURE;
        }
    };
    let client = match DirectoryClient::new(&config.directory) {
        Ok(client) => client,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    let output = match command {
        "search" => {
            let limit = match args.get(2).map(|l| l.parse::<usize>()) {
                Some(Ok(limit)) => limit,
                Some(Err(e)) => {
                    eprintln!("invalid limit: {}", e);
                    return ExitCode::from(2);
                }
                None => config.directory.search_limit,
            };
            match client.try_search(target, limit).await {
                Ok(results) => serde_json::to_string_pretty(&results),
                Err(e) => return report(e),
            }
        }
        "lookup" => match client.try_lookup(target).await {
            Ok(found) => serde_json::to_string_pretty::<Option<IdentityMapping>>(&found),
            Err(e) => return report(e),
        },
        _ => {
            eprintln!("{}", USAGE);
            return ExitCode::from(2);
        }
    };

    match output {
        Ok(json) => {
            println!("{}", json);
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Failed to encode results: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn report(err: idbridge::DirectoryError) -> ExitCode {
    eprintln!("{}", err);
    if err.is_retryable() {
        eprintln!("(transient; try again)");
    }
    ExitCode::FAILURE
}
