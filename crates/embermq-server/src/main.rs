//! embermq - MQTT broker binary.

use log::{error, info};

use embermq_server::{Broker, Config, Server};

struct Args {
    config_path: String,
}

fn parse_args() -> Args {
    let args: Vec<String> = std::env::args().collect();
    let mut config_path = "embermq.toml".to_string();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-c" | "--config" => {
                if i + 1 < args.len() {
                    config_path = args[i + 1].clone();
                    i += 2;
                } else {
                    eprintln!("Error: -c requires a file path");
                    std::process::exit(1);
                }
            }
            "-h" | "--help" => {
                println!("embermq - MQTT broker");
                println!();
                println!("Usage: embermq [OPTIONS]");
                println!();
                println!("Options:");
                println!("  -c, --config <FILE>     Config file path (default: embermq.toml)");
                println!("  -h, --help              Show this help message");
                println!();
                println!("Configuration:");
                println!("  Config file uses TOML format. All settings can be overridden");
                println!("  with environment variables using the EMBERMQ__ prefix:");
                println!();
                println!("  EMBERMQ__SERVER__BIND=0.0.0.0:1884");
                println!("  EMBERMQ__LIMITS__MAX_QUEUED_MESSAGES=500");
                println!("  EMBERMQ__LOG__LEVEL=debug");
                std::process::exit(0);
            }
            arg => {
                eprintln!("Unknown argument: {}", arg);
                eprintln!("Use --help for usage information");
                std::process::exit(1);
            }
        }
    }

    Args { config_path }
}

fn main() {
    let args = parse_args();

    let config = match Config::load(&args.config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&config.log.level))
        .init();

    info!(
        "starting embermq on {} (max_inflight={}, max_queued={})",
        config.server.bind, config.limits.max_inflight_messages, config.limits.max_queued_messages
    );

    let broker = Broker::with_defaults(config);
    let mut server = match Server::new(broker) {
        Ok(s) => s,
        Err(e) => {
            error!("failed to start server: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = server.run() {
        error!("server error: {}", e);
        std::process::exit(1);
    }
}
