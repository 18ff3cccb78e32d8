//! The reference SCPI server binary: loads configuration, builds the
//! engine, installs the built-in command set, and runs the plain-TCP
//! listener. Log setup lives only here; the library crate itself stays
//! logger-agnostic and only calls through the `log` facade.

use scpi_server::config::EngineConfig;
use scpi_server::{builtin, transport, Engine};
use std::env;
use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();

    let config = match env::args().nth(1) {
        Some(path) => match EngineConfig::load_utf8(&path) {
            Ok(config) => config,
            Err(err) => {
                eprintln!("failed to read configuration at {path}: {err}");
                return ExitCode::from(2);
            }
        },
        None => EngineConfig::default(),
    };

    let engine = Engine::new();
    if let Err(err) = builtin::install(&engine) {
        eprintln!("failed to install built-in command set: {err}");
        return ExitCode::from(2);
    }

    let access_limit = config.access_cap("tcp");
    let bind = config.bind().to_string();
    log::info!("starting on {bind} with access cap {access_limit}");

    match transport::serve(engine, &bind, access_limit).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("listener failed: {err}");
            ExitCode::from(2)
        }
    }
}
