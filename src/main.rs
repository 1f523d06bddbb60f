//! Main module for the askai CLI application.
//!
//! Parses the command line, resolves the vault, installs logging, loads `config.yaml` with the
//! command-line overrides applied, and dispatches to the handlers in [`askai::api`].
//!
//! # Examples
//!
//! ```sh
//! askai init
//! askai ask "What is the meaning of life?"
//! askai interactive --model llama3.2 --temperature 0.4
//! askai search "meaning of life" -n 3
//! ```

use std::error::Error;

use askai::{
    api::{self, App},
    archive::ensure_vault,
    commands::{Cli, Commands},
    config::{self, CONFIG_FILE},
    logging, vault_dir,
};
use clap::Parser;
use tracing::{debug, info};

fn main() -> Result<(), Box<dyn Error>> {
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(run())
}

/// Runs one command.
///
/// # Errors
///
/// Returns an error if the vault is unusable, the configuration is invalid, or the command
/// itself fails.
async fn run() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    let vault = vault_dir(cli.vault.clone());

    ensure_vault(&vault)?;
    logging::init_logging(&vault, cli.verbose)?;
    info!(vault = %vault.display(), "askai starting");

    if let Commands::Init { force } = cli.command {
        let path = api::init(&vault, force)?;
        println!("Wrote {}", path.display());
        return Ok(());
    }

    let config_path = vault.join(CONFIG_FILE);
    debug!(path = %config_path.display(), "loading config");
    let mut askai_config = config::load_or_default(&config_path)?;
    askai_config.apply_overrides(&cli.overrides());
    debug!(
        model = %askai_config.model_name,
        api_url = %askai_config.api_url,
        temperature = askai_config.temperature,
        "effective config"
    );

    let app = App::connect(vault, askai_config).await?;

    match cli.command {
        Commands::Ask { question } => {
            debug!(question = %question, "asking question");
            api::ask(app, question).await?;
        }
        Commands::Interactive => api::interactive_mode(app).await?,
        Commands::Reindex => api::reindex(&app.dedup).await?,
        Commands::Search { query, limit } => api::search(&app.dedup, &query, limit).await?,
        Commands::Reset { yes } => api::reset(&app.dedup, yes).await?,
        Commands::Init { .. } => {}
    }

    Ok(())
}
