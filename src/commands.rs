//! This module defines the command-line interface for the application using `clap`.
//!
//! Global options describe *where* things are (vault, services) and *how* to answer (model,
//! temperature, backend). Each may also come from an environment variable; an explicit flag
//! wins, then the variable, then `config.yaml`, then the built-in default.
//!
//! | Flag | Environment |
//! |---|---|
//! | `--vault` | `ASKAI_VAULT` |
//! | `--api-url` | `OLLAMA_API_URL` |
//! | `--model` | `OLLAMA_MODEL` |
//! | `--embedding-url` | `OLLAMA_URL` |
//! | `--qdrant-url` | `QDRANT_URL` |
//!
//! # Examples
//!
//! ```no_run
//! use clap::Parser;
//! use askai::commands::{Cli, Commands};
//!
//! let cli = Cli::parse();
//! match cli.command {
//!     Commands::Ask { question } => println!("asking {question}"),
//!     _ => {}
//! }
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::config::{Backend, ConfigOverrides};

/// Represents the parsed command-line arguments.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None, propagate_version = true, color = clap::ColorChoice::Always)]
pub struct Cli {
    /// Directory holding config.yaml, que_ans.json and askai.log.
    #[arg(long, global = true, env = "ASKAI_VAULT")]
    pub vault: Option<PathBuf>,

    /// Base URL of the generation service.
    #[arg(long, global = true, env = "OLLAMA_API_URL")]
    pub api_url: Option<String>,

    /// Model used for answers.
    #[arg(long, short = 'm', global = true, env = "OLLAMA_MODEL")]
    pub model: Option<String>,

    /// Sampling temperature, clamped to 0.1..=2.0.
    #[arg(long, global = true)]
    pub temperature: Option<f32>,

    /// Wire protocol of the generation service.
    #[arg(long, global = true, value_enum)]
    pub backend: Option<Backend>,

    /// Base URL of the embedding service, if different from --api-url.
    #[arg(long, global = true, env = "OLLAMA_URL")]
    pub embedding_url: Option<String>,

    /// Qdrant REST endpoint.
    #[arg(long, global = true, env = "QDRANT_URL")]
    pub qdrant_url: Option<String>,

    /// Log at debug level.
    #[arg(long, short = 'v', global = true)]
    pub verbose: bool,

    /// The parsed subcommand and its options.
    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// The flags (and environment variables) that override `config.yaml`.
    pub fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            model_name: self.model.clone(),
            api_url: self.api_url.clone(),
            temperature: self.temperature,
            backend: self.backend,
            embedding_url: self.embedding_url.clone(),
            qdrant_url: self.qdrant_url.clone(),
        }
    }
}

/// Represents the available subcommands and their options.
#[derive(Subcommand, Debug, PartialEq)]
#[command(about, long_about = None, color = clap::ColorChoice::Always)]
pub enum Commands {
    /// Ask one question, stream the answer and archive it.
    #[clap(name = "ask", alias = "a")]
    Ask {
        /// The question to be asked.
        question: String,
    },

    /// Prompt for questions until `exit`. Ctrl-C stops the current answer.
    #[clap(name = "interactive", alias = "i")]
    Interactive,

    /// Write a default config.yaml into the vault.
    Init {
        /// Replace an existing config.yaml.
        #[arg(long)]
        force: bool,
    },

    /// Index every archived pair that is not in the vector store yet.
    Reindex,

    /// List archived questions similar to a query.
    #[clap(name = "search", alias = "s")]
    Search {
        query: String,

        #[arg(long, short = 'n', default_value_t = 5)]
        limit: usize,
    },

    /// Drop and recreate the vector collection. The archive is kept.
    Reset {
        /// Do not ask for confirmation.
        #[arg(long, short = 'y')]
        yes: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ask_with_globals() {
        let cli = Cli::try_parse_from([
            "askai",
            "ask",
            "What is AI?",
            "--model",
            "llama3.2",
            "--temperature",
            "0.4",
            "--vault",
            "/tmp/v",
        ])
        .unwrap();

        assert_eq!(
            cli.command,
            Commands::Ask {
                question: "What is AI?".into()
            }
        );
        assert_eq!(cli.vault, Some(PathBuf::from("/tmp/v")));
        let overrides = cli.overrides();
        assert_eq!(overrides.model_name.as_deref(), Some("llama3.2"));
        assert_eq!(overrides.temperature, Some(0.4));
    }

    #[test]
    fn test_aliases_and_defaults() {
        let cli = Cli::try_parse_from(["askai", "s", "rust"]).unwrap();
        assert_eq!(
            cli.command,
            Commands::Search {
                query: "rust".into(),
                limit: 5
            }
        );

        let cli = Cli::try_parse_from(["askai", "i", "--backend", "openai"]).unwrap();
        assert_eq!(cli.command, Commands::Interactive);
        assert_eq!(cli.backend, Some(Backend::Openai));
    }

    #[test]
    fn test_ask_requires_question() {
        assert!(Cli::try_parse_from(["askai", "ask"]).is_err());
    }

    #[test]
    fn test_cli_is_well_formed() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
