#![forbid(unsafe_code)]

use std::process::ExitCode;

use strongbox_app::AppConfig;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let Some(path) = std::env::args_os().nth(1) else {
        eprintln!("usage: strongbox-migrate <config.json>");
        return ExitCode::from(2);
    };
    let config = match AppConfig::from_file(&path) {
        Ok(config) => config,
        Err(error) => {
            eprintln!("{error}");
            return ExitCode::from(error.exit_code());
        }
    };
    match strongbox_app::migrate(&config).await {
        Ok(()) => {
            println!("migrations complete");
            ExitCode::SUCCESS
        }
        Err(error) => {
            eprintln!("migration failed: {error:#}");
            ExitCode::FAILURE
        }
    }
}
