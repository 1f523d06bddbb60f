//! # askai (library root)
//!
//! A terminal assistant that streams answers from a local language model and keeps every
//! question/answer pair in a deduplicated, similarity-searchable archive.
//!
//! - Streaming sessions and the consumer loop that drives them (`session`, `driver`).
//! - Generation backends (`generate`): Ollama and OpenAI-compatible servers.
//! - The persistence side: embeddings (`embedder`), the vector store (`store`), the local JSON
//!   archive (`archive`) and the service that ties them together (`dedup`).
//! - CLI parsing, configuration, logging and command handlers (`commands`, `config`,
//!   `logging`, `api`).
//!
//! ## Vault layout
//!
//! Everything local lives in one directory, the *vault* (see [`vault_dir`]):
//!
//! ```text
//! ~/.askAI/
//! ├── config.yaml    settings written by `askai init` or `:save`
//! ├── que_ans.json   every question/answer pair, in order
//! └── askai.log      JSON log lines
//! ```
//!
//! ## Modules
//! - [`api`], [`archive`], [`commands`], [`config`], [`dedup`], [`driver`], [`embedder`],
//!   [`error`], [`generate`], [`logging`], [`session`], [`store`]

use std::path::PathBuf;

pub mod api;
pub mod archive;
pub mod commands;
pub mod config;
pub mod dedup;
pub mod driver;
pub mod embedder;
pub mod error;
pub mod generate;
pub mod logging;
pub mod session;
pub mod store;

#[cfg(test)]
pub(crate) mod testing;

/// Name of the vault directory under the home directory.
pub const VAULT_DIR_NAME: &str = ".askAI";

/// Resolve the vault directory.
///
/// `explicit` (the `--vault` flag or `ASKAI_VAULT`, both resolved by clap) wins. Otherwise the
/// vault is `~/.askAI`, or `./.askAI` when no home directory can be determined.
///
/// The directory is **not** created here; see [`archive::ensure_vault`].
///
/// # Examples
/// ```rust
/// use std::path::PathBuf;
///
/// let vault = askai::vault_dir(Some(PathBuf::from("/tmp/vault")));
/// assert_eq!(vault, PathBuf::from("/tmp/vault"));
/// ```
pub fn vault_dir(explicit: Option<PathBuf>) -> PathBuf {
    if let Some(path) = explicit {
        return path;
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(VAULT_DIR_NAME)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vault_dir_default_ends_with_name() {
        assert!(vault_dir(None).ends_with(VAULT_DIR_NAME));
    }
}
