#![forbid(unsafe_code)]

use std::process::ExitCode;

use strongbox_app::AppConfig;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let Some(path) = std::env::args_os().nth(1) else {
        eprintln!("usage: strongbox-server <config.json>");
        return ExitCode::from(2);
    };
    let config = match AppConfig::from_file(&path) {
        Ok(config) => config,
        Err(error) => {
            tracing::error!(error = %error, "configuration rejected");
            return ExitCode::from(error.exit_code());
        }
    };
    match strongbox_app::run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            tracing::error!(error = %format!("{error:#}"), "server failed");
            ExitCode::FAILURE
        }
    }
}
