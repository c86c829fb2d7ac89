// src/main.rs

//! The main entry point for the convoyd relay server.

use anyhow::Result;
use convoyd::config::Config;
use convoyd::server;
use std::env;
use tracing::error;
use tracing_subscriber::filter::EnvFilter;

const USAGE: &str = "\
usage: convoyd [options]

options:
  -h, --help             show this help and exit
      --version          print the server version and exit
      --config <path>    configuration file (default: config.yaml)
  -p, --port <port>      listen port (overrides server.port)
  -n, --name <name>      server name (overrides server.name)
  -o, --owner <owner>    server owner (overrides server.owner)
      --<section>.<key> <value>
                         override any configuration field,
                         e.g. --game.max_players 32";

#[tokio::main]
async fn main() -> Result<()> {
    const VERSION: &str = env!("CARGO_PKG_VERSION");

    let args: Vec<String> = env::args().skip(1).collect();

    if args.iter().any(|a| a == "--help" || a == "-h") {
        println!("{USAGE}");
        return Ok(());
    }
    if args.contains(&"--version".to_string()) {
        println!("convoyd version {VERSION}");
        return Ok(());
    }

    // Determine the configuration path, then apply CLI overrides on top of
    // the file. Overrides always win.
    let config_path = args
        .iter()
        .position(|arg| arg == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str())
        .unwrap_or("config.yaml");

    let mut config = match Config::from_file(config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Failed to load configuration from \"{config_path}\": {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = apply_cli_overrides(&mut config, &args) {
        eprintln!("{e}");
        eprintln!("{USAGE}");
        std::process::exit(1);
    }

    if let Err(e) = config.validate() {
        eprintln!("Invalid configuration: {e}");
        std::process::exit(1);
    }

    // RUST_LOG wins; otherwise server.debug picks the default level.
    let default_level = if config.server.debug { "debug" } else { "info" };
    let filter =
        EnvFilter::new(std::env::var("RUST_LOG").unwrap_or_else(|_| default_level.to_string()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .compact()
        .with_ansi(true)
        .init();

    if let Err(e) = server::run(config).await {
        error!("Server runtime error: {}", e);
        return Err(e);
    }
    Ok(())
}

/// Applies `--flag value` and `--flag=value` pairs onto the configuration.
fn apply_cli_overrides(config: &mut Config, args: &[String]) -> Result<()> {
    let mut i = 0;
    while i < args.len() {
        let arg = &args[i];
        if arg == "--config" {
            i += 2;
            continue;
        }
        let (flag, inline_value) = match arg.split_once('=') {
            Some((flag, value)) => (flag, Some(value.to_string())),
            None => (arg.as_str(), None),
        };
        let key = match flag {
            "-p" | "--port" => "server.port".to_string(),
            "-n" | "--name" => "server.name".to_string(),
            "-o" | "--owner" => "server.owner".to_string(),
            _ => match flag.strip_prefix("--") {
                Some(key) if key.contains('.') => key.to_string(),
                _ => anyhow::bail!("unknown argument '{arg}'"),
            },
        };
        let value = match inline_value {
            Some(value) => value,
            None => {
                i += 1;
                args.get(i)
                    .ok_or_else(|| anyhow::anyhow!("'{flag}' requires a value"))?
                    .clone()
            }
        };
        config.set_override(&key, &value)?;
        i += 1;
    }
    Ok(())
}
