//! # API Module
//!
//! Command handlers behind the `askai` binary. [`App::connect`] wires the configured generator,
//! embedder, vector store and archive together; the handlers then drive a [`SessionDriver`] and
//! render its events on the terminal.
//!
//! Answers stream in bold blue, status lines are dimmed and errors are red. Ctrl-C while an
//! answer is streaming cancels it (nothing is archived); Ctrl-C at the interactive prompt exits.
//!
//! # Example
//!
//! ```no_run
//! use askai::api::{App, ask};
//! use askai::config::AskAiConfig;
//! use std::path::PathBuf;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let app = App::connect(PathBuf::from("/tmp/vault"), AskAiConfig::default()).await?;
//! ask(app, "What is the meaning of life?".to_string()).await?;
//! # Ok(())
//! # }
//! ```

use std::{
    error::Error,
    io::{Write, stdout},
    path::PathBuf,
    sync::Arc,
};

use crossterm::{
    ExecutableCommand,
    style::{Attribute, Color, Print, SetAttribute, SetForegroundColor},
};
use indicatif::{ProgressBar, ProgressStyle};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};

use crate::{
    archive::{QaArchive, ensure_vault},
    config::{self, AskAiConfig, Backend, CONFIG_FILE, TEMPERATURE_STEP},
    dedup::DedupService,
    driver::{DriverEvent, SessionDriver},
    embedder::OllamaEmbedder,
    error::AskAiError,
    generate::{Generator, OllamaGenerator, OpenAiGenerator},
    store::QdrantStore,
};

/// Build the generator for the configured backend.
pub fn create_generator(config: &AskAiConfig) -> Arc<dyn Generator> {
    match config.backend {
        Backend::Ollama => Arc::new(OllamaGenerator::new(&config.api_url)),
        Backend::Openai => Arc::new(OpenAiGenerator::new(
            &config.api_url,
            config.api_key.as_deref().unwrap_or_default(),
        )),
    }
}

/// Build the deduplication service: Ollama embeddings, Qdrant index, vault archive.
///
/// # Errors
/// Fails when the embedding and collection dimensions disagree.
pub fn create_dedup(
    config: &AskAiConfig,
    vault: &std::path::Path,
) -> Result<DedupService, AskAiError> {
    let embedder = OllamaEmbedder::new(
        config.embedding_base(),
        &config.embedding_model,
        config.embedding_dimension,
    );
    let store = QdrantStore::new(
        &config.qdrant_url,
        &config.collection,
        config.embedding_dimension,
        config.qdrant_api_key.clone(),
    );
    DedupService::new(
        Arc::new(embedder),
        Arc::new(store),
        Arc::new(QaArchive::new(vault)),
    )
}

/// Everything a command needs.
pub struct App {
    pub vault: PathBuf,
    pub config: AskAiConfig,
    pub generator: Arc<dyn Generator>,
    pub dedup: Arc<DedupService>,
}

impl App {
    /// Check the vault and config, build the components and make sure the collection exists.
    ///
    /// An unreachable vector store is not fatal: answers are still streamed and archived, and
    /// each failed index attempt is reported.
    pub async fn connect(vault: PathBuf, config: AskAiConfig) -> Result<Self, Box<dyn Error>> {
        ensure_vault(&vault)?;
        config.validate()?;

        let dedup = create_dedup(&config, &vault)?;
        if let Err(e) = dedup.ensure_ready().await {
            warn!(error = %e, qdrant = %config.qdrant_url, "vector store unavailable");
            print_status(
                &mut stdout(),
                Color::Yellow,
                &format!("Vector store unavailable ({e}); answers will only be archived."),
            )?;
        }

        Ok(Self {
            generator: create_generator(&config),
            dedup: Arc::new(dedup),
            vault,
            config,
        })
    }

    pub fn driver(&self) -> SessionDriver {
        SessionDriver::new(
            self.generator.clone(),
            self.dedup.clone(),
            self.config.clone(),
        )
    }
}

/// How a rendered answer ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Answered,
    Failed,
    Canceled,
}

fn print_status<W: Write>(out: &mut W, color: Color, message: &str) -> Result<(), Box<dyn Error>> {
    out.execute(SetForegroundColor(color))?;
    out.execute(SetAttribute(Attribute::Dim))?;
    out.execute(Print(format!("{message}\n")))?;
    out.execute(SetAttribute(Attribute::Reset))?;
    out.execute(SetForegroundColor(Color::Reset))?;
    Ok(())
}

fn reset_style<W: Write>(out: &mut W) -> Result<(), Box<dyn Error>> {
    out.execute(SetAttribute(Attribute::Reset))?;
    out.execute(SetForegroundColor(Color::Reset))?;
    Ok(())
}

/// Render events until the driver is idle. Ctrl-C cancels a streaming answer.
pub async fn render_answer<W: Write>(
    driver: &mut SessionDriver,
    out: &mut W,
) -> Result<Outcome, Box<dyn Error>> {
    out.execute(SetForegroundColor(Color::Blue))?;
    out.execute(SetAttribute(Attribute::Bold))?;

    let mut outcome = Outcome::Answered;
    loop {
        let event = tokio::select! {
            biased;
            _ = tokio::signal::ctrl_c() => None,
            event = driver.next_event() => Some(event),
        };

        let Some(event) = event else {
            if driver.cancel() {
                reset_style(out)?;
                print_status(out, Color::Yellow, "\n[canceled]")?;
                outcome = Outcome::Canceled;
            }
            continue;
        };

        match event {
            DriverEvent::Token(token) => {
                write!(out, "{token}")?;
                out.flush()?;
            }
            DriverEvent::Completed(_) => {
                reset_style(out)?;
                writeln!(out)?;
            }
            DriverEvent::Failed(message) => {
                reset_style(out)?;
                out.execute(SetForegroundColor(Color::Red))?;
                writeln!(out, "\nError: {message}")?;
                out.execute(SetForegroundColor(Color::Reset))?;
                outcome = Outcome::Failed;
            }
            DriverEvent::Canceled => {
                reset_style(out)?;
                print_status(out, Color::Yellow, "\n[canceled]")?;
                outcome = Outcome::Canceled;
            }
            DriverEvent::Archived(report) => {
                let color = if report.is_ok() {
                    Color::DarkGrey
                } else {
                    Color::Yellow
                };
                print_status(out, color, &format!("({})", report.summary()))?;
            }
            DriverEvent::Idle => break,
        }
    }

    reset_style(out)?;
    out.flush()?;
    Ok(outcome)
}

/// Ask one question, stream the answer and wait for it to be archived.
///
/// # Errors
/// Returns an error if the question is empty or the answer failed.
pub async fn ask(app: App, question: String) -> Result<(), Box<dyn Error>> {
    let mut driver = app.driver();
    driver.submit(&question).await?;

    let outcome = render_answer(&mut driver, &mut stdout()).await?;
    driver.shutdown().await;

    match outcome {
        Outcome::Failed => Err("the answer could not be generated".into()),
        _ => Ok(()),
    }
}

/// A line typed at the interactive prompt.
#[derive(Debug, Clone, PartialEq)]
pub enum Input {
    Empty,
    Exit,
    Help,
    TemperatureUp,
    TemperatureDown,
    /// `:model` alone shows the current model.
    Model(Option<String>),
    Url(Option<String>),
    Save,
    Reindex,
    Unknown(String),
    Question(String),
}

pub fn parse_input(line: &str) -> Input {
    let line = line.trim();
    if line.is_empty() {
        return Input::Empty;
    }
    if line.eq_ignore_ascii_case("exit") || line.eq_ignore_ascii_case("quit") {
        return Input::Exit;
    }
    let Some(command) = line.strip_prefix(':') else {
        return Input::Question(line.to_string());
    };

    let (name, arg) = match command.split_once(char::is_whitespace) {
        Some((name, arg)) => (name, Some(arg.trim().to_string()).filter(|a| !a.is_empty())),
        None => (command, None),
    };
    match name {
        "temp+" => Input::TemperatureUp,
        "temp-" => Input::TemperatureDown,
        "model" => Input::Model(arg),
        "url" => Input::Url(arg),
        "save" => Input::Save,
        "reindex" => Input::Reindex,
        "help" | "h" | "?" => Input::Help,
        "exit" | "quit" | "q" => Input::Exit,
        other => Input::Unknown(other.to_string()),
    }
}

const HELP: &str = "\
Commands:
  :temp+ / :temp-   raise or lower the temperature by 0.1 (0.1..=2.0)
  :model [name]     show or change the model
  :url [url]        show or change the generation API URL
  :save             write the current settings to config.yaml
  :reindex          index archived pairs missing from the vector store
  :help             this text
  exit, quit        leave (Ctrl-C at the prompt does the same)
Ctrl-C while an answer is streaming stops it; stopped answers are not saved.";

fn print_settings<W: Write>(out: &mut W, config: &AskAiConfig) -> Result<(), Box<dyn Error>> {
    print_status(
        out,
        Color::DarkGrey,
        &format!(
            "model: {}  temperature: {:.1}  api: {}",
            config.model_name, config.temperature, config.api_url
        ),
    )
}

/// Enters interactive conversation mode with the assistant.
///
/// Reads questions (and `:` commands) until `exit`, end of input or Ctrl-C at the prompt.
///
/// # Parameters
/// - `app: App`: Connected components and the effective configuration.
///
/// # Returns
/// - `Result<(), Box<dyn Error>>`: Success or error.
pub async fn interactive_mode(app: App) -> Result<(), Box<dyn Error>> {
    let mut driver = app.driver();
    let mut out = stdout();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    print_settings(&mut out, driver.config())?;
    print_status(&mut out, Color::DarkGrey, "Type :help for commands.")?;

    loop {
        out.execute(SetForegroundColor(Color::Green))?;
        out.execute(Print("\nYou: "))?;
        out.execute(SetForegroundColor(Color::Reset))?;
        out.flush()?;

        let line = tokio::select! {
            _ = tokio::signal::ctrl_c() => None,
            line = lines.next_line() => line?,
        };
        let Some(line) = line else {
            writeln!(out)?;
            break;
        };

        match parse_input(&line) {
            Input::Empty => {}
            Input::Exit => break,
            Input::Help => writeln!(out, "{HELP}")?,
            Input::TemperatureUp => {
                let t = driver.config_mut().adjust_temperature(TEMPERATURE_STEP);
                print_status(&mut out, Color::DarkGrey, &format!("temperature: {t:.1}"))?;
            }
            Input::TemperatureDown => {
                let t = driver.config_mut().adjust_temperature(-TEMPERATURE_STEP);
                print_status(&mut out, Color::DarkGrey, &format!("temperature: {t:.1}"))?;
            }
            Input::Model(None) | Input::Url(None) => print_settings(&mut out, driver.config())?,
            Input::Model(Some(model)) => {
                info!(model = %model, "model changed");
                driver.config_mut().model_name = model;
                print_settings(&mut out, driver.config())?;
            }
            Input::Url(Some(url)) => {
                info!(url = %url, "generation URL changed");
                driver.config_mut().api_url = url;
                let generator = create_generator(driver.config());
                driver.set_generator(generator);
                print_settings(&mut out, driver.config())?;
            }
            Input::Save => {
                let path = app.vault.join(CONFIG_FILE);
                config::save_config(driver.config(), &path)?;
                print_status(
                    &mut out,
                    Color::DarkGrey,
                    &format!("saved {}", path.display()),
                )?;
            }
            Input::Reindex => reindex(driver.dedup()).await?,
            Input::Unknown(name) => print_status(
                &mut out,
                Color::Yellow,
                &format!("unknown command :{name} (try :help)"),
            )?,
            Input::Question(question) => {
                debug!(question = %question, "interactive question");
                writeln!(out)?;
                driver.submit(&question).await?;
                render_answer(&mut driver, &mut out).await?;
            }
        }
    }

    driver.shutdown().await;
    Ok(())
}

/// Index every archived pair missing from the vector store, with a progress bar.
pub async fn reindex(dedup: &DedupService) -> Result<(), Box<dyn Error>> {
    let bar = ProgressBar::new(0);
    bar.set_style(
        ProgressStyle::with_template("{spinner} [{bar:40.cyan/blue}] {pos}/{len} {msg}")?
            .progress_chars("=> "),
    );
    bar.set_message("indexing archive");

    let summary = dedup
        .reindex_archive(|position, total| {
            bar.set_length(total as u64);
            bar.set_position(position as u64);
        })
        .await?;
    bar.finish_and_clear();

    let message = format!(
        "{} pairs: {} stored, {} already indexed, {} skipped, {} failed",
        summary.total, summary.stored, summary.duplicates, summary.skipped, summary.failed
    );
    let color = if summary.failed == 0 {
        Color::Green
    } else {
        Color::Yellow
    };
    print_status(&mut stdout(), color, &message)?;
    Ok(())
}

/// Print the archived questions most similar to `query`.
pub async fn search(dedup: &DedupService, query: &str, limit: usize) -> Result<(), Box<dyn Error>> {
    let hits = dedup.search_similar(query, limit).await?;
    let mut out = stdout();

    if hits.is_empty() {
        print_status(&mut out, Color::DarkGrey, "no similar questions indexed")?;
    }
    for hit in &hits {
        let question = hit.payload.get("question").map_or("", String::as_str);
        let stored_at = hit.payload.get("stored_at").map_or("", String::as_str);
        out.execute(SetForegroundColor(Color::Cyan))?;
        write!(out, "{:.3}", hit.score)?;
        out.execute(SetForegroundColor(Color::Reset))?;
        writeln!(out, "  {question}  ")?;
        print_status(&mut out, Color::DarkGrey, &format!("       {stored_at}"))?;
    }

    let total = dedup.store().count().await?;
    print_status(
        &mut out,
        Color::DarkGrey,
        &format!("{total} pairs in '{}'", dedup.store().collection()),
    )?;
    Ok(())
}

/// Read one line and accept only `yes`.
async fn confirm<R: AsyncBufRead + Unpin>(input: &mut R) -> std::io::Result<bool> {
    let mut answer = String::new();
    input.read_line(&mut answer).await?;
    Ok(answer.trim() == "yes")
}

/// Drop and recreate the collection after confirmation.
pub async fn reset(dedup: &DedupService, yes: bool) -> Result<(), Box<dyn Error>> {
    let collection = dedup.store().collection().to_string();
    if !yes {
        print!("Delete every point in '{collection}'? The archive is kept. Type 'yes': ");
        stdout().flush()?;
        if !confirm(&mut BufReader::new(tokio::io::stdin())).await? {
            println!("aborted");
            return Ok(());
        }
    }

    dedup.store().reset_collection().await?;
    info!(collection = %collection, "collection reset");
    print_status(
        &mut stdout(),
        Color::Green,
        &format!("collection '{collection}' recreated; run `askai reindex` to rebuild it"),
    )?;
    Ok(())
}

/// Write a default `config.yaml` into the vault.
///
/// # Errors
/// Refuses to replace an existing file unless `force` is set.
pub fn init(vault: &std::path::Path, force: bool) -> Result<PathBuf, Box<dyn Error>> {
    ensure_vault(vault)?;
    let path = vault.join(CONFIG_FILE);
    if path.exists() && !force {
        return Err(format!("{} already exists (use --force to replace it)", path.display()).into());
    }
    info!(path = %path.display(), "creating config file");
    config::save_config(&AskAiConfig::default(), &path)?;
    Ok(path)
}
