use std::process::ExitCode;

use app::settings::{Cli, Settings};
use app::AppError;
use clap::Parser;

fn main() -> ExitCode {
    let env = env_logger::Env::default()
        .filter_or("SIP_AGENT_LOG", "info")
        .write_style_or("SIP_AGENT_LOG_STYLE", "auto");

    env_logger::init_from_env(env);

    let result = Settings::load(Cli::parse())
        .map_err(AppError::from)
        .and_then(|settings| app::run(&settings));

    match result {
        Ok(outcome) => {
            log::info!("done: call {} ({:?} hangup)", outcome.call_id, outcome.hangup);
            ExitCode::SUCCESS
        }
        Err(err) => {
            log::error!("app error: {err}");
            ExitCode::FAILURE
        }
    }
}
