//! Service entry point — CLI wiring and config-driven server construction.

use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::process;
use std::sync::Arc;

use rec_lem_api::api::{self, AppState};
use rec_lem_api::config::ServiceConfig;
use rec_lem_api::dataspace::LiveDataSource;
use rec_lem_api::logging;
use rec_lem_api::orders::OrderStore;
use rec_lem_api::registry::Registry;

/// Parsed CLI arguments.
struct CliArgs {
    config_path: Option<String>,
    host_override: Option<String>,
    port_override: Option<u16>,
    log_dir_override: Option<String>,
}

fn print_help() {
    eprintln!("rec-lem-api — community operation scheduling and market pricing API");
    eprintln!();
    eprintln!("Usage: rec-lem-api [OPTIONS]");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --config <path>   Load service configuration from TOML file");
    eprintln!("  --host <addr>     Override the bind address");
    eprintln!("  --port <u16>      Override the bind port");
    eprintln!("  --log-dir <path>  Override the log file directory");
    eprintln!("  --help            Show this help message");
    eprintln!();
    eprintln!("Without --config, built-in defaults are used. Connector secrets");
    eprintln!("can be supplied via RECLEM_INDATA_TOKEN, RECLEM_SEL_EMAIL and");
    eprintln!("RECLEM_SEL_PASSWORD (a .env file at the working directory is read).");
}

fn parse_args() -> CliArgs {
    let args: Vec<String> = std::env::args().collect();
    let mut cli = CliArgs {
        config_path: None,
        host_override: None,
        port_override: None,
        log_dir_override: None,
    };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--help" | "-h" => {
                print_help();
                process::exit(0);
            }
            "--config" => {
                i += 1;
                if i >= args.len() {
                    eprintln!("error: --config requires a path argument");
                    process::exit(1);
                }
                cli.config_path = Some(args[i].clone());
            }
            "--host" => {
                i += 1;
                if i >= args.len() {
                    eprintln!("error: --host requires an address argument");
                    process::exit(1);
                }
                cli.host_override = Some(args[i].clone());
            }
            "--port" => {
                i += 1;
                if i >= args.len() {
                    eprintln!("error: --port requires a u16 argument");
                    process::exit(1);
                }
                if let Ok(p) = args[i].parse::<u16>() {
                    cli.port_override = Some(p);
                } else {
                    eprintln!("error: --port value \"{}\" is not a valid u16", args[i]);
                    process::exit(1);
                }
            }
            "--log-dir" => {
                i += 1;
                if i >= args.len() {
                    eprintln!("error: --log-dir requires a path argument");
                    process::exit(1);
                }
                cli.log_dir_override = Some(args[i].clone());
            }
            other => {
                eprintln!("error: unknown argument \"{other}\"");
                print_help();
                process::exit(1);
            }
        }
        i += 1;
    }

    cli
}

fn main() {
    let cli = parse_args();

    // Secrets may come from a local .env file.
    dotenvy::dotenv().ok();

    let mut config = if let Some(ref path) = cli.config_path {
        match ServiceConfig::from_toml_file(Path::new(path)) {
            Ok(cfg) => cfg,
            Err(e) => {
                eprintln!("{e}");
                process::exit(1);
            }
        }
    } else {
        ServiceConfig::default()
    };

    if let Some(host) = cli.host_override {
        config.server.host = host;
    }
    if let Some(port) = cli.port_override {
        config.server.port = port;
    }
    if let Some(dir) = cli.log_dir_override {
        config.logging.directory = dir;
    }
    config.apply_env_overrides();

    let errors = config.validate();
    if !errors.is_empty() {
        for e in &errors {
            eprintln!("{e}");
        }
        process::exit(1);
    }

    let _log_guard = logging::init(&config.logging);

    let host: IpAddr = match config.server.host.parse() {
        Ok(host) => host,
        Err(_) => {
            eprintln!("error: server.host \"{}\" is not a valid IP address", config.server.host);
            process::exit(1);
        }
    };
    let addr = SocketAddr::from((host, config.server.port));

    let registry = Registry::new();
    let state = Arc::new(AppState {
        orders: OrderStore::new(),
        source: Arc::new(LiveDataSource::new(&config.dataspace, registry.clone())),
        registry,
        market: config.market.clone(),
    });

    let rt = tokio::runtime::Runtime::new().unwrap_or_else(|e| {
        eprintln!("error: failed to create tokio runtime: {e}");
        process::exit(1);
    });
    rt.block_on(api::serve(state, addr));
}
