//! CLI entry point for the MDML client.
//!
//! Offline tools around the message formats:
//! - validate a configuration file and print the normalized document
//! - split a file into chunk messages, or reassemble files from them
//! - infer a JSON Schema from a sample record
//! - print the topic routing table of an experiment
//!
//! # Usage
//!
//! ```bash
//! mdml validate fsp.json --run-id run_1
//! mdml chunk scan.tif --file-id scan_1 --chunk-size 65536 > scan.jsonl
//! mdml reassemble scan.jsonl --out-dir received/
//! mdml topics fsp --device dht11
//! ```

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use mdml_client::chunk::{self, ChunkInput, Reassembler};
use mdml_client::config::{self, ConfigSource};
use mdml_client::logging;
use mdml_client::schema;
use mdml_client::settings::ClientSettings;
use mdml_client::topic::TopicBuilder;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "mdml")]
#[command(about = "Offline tools for MDML experiment messages", long_about = None)]
struct Cli {
    /// Settings file (defaults to ./mdml.toml when present)
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate an experiment configuration and print it normalized
    Validate {
        /// Path to the JSON configuration (ignored with --auto)
        config: Option<PathBuf>,

        /// Run ID merged into the experiment section
        #[arg(long, default_value = "")]
        run_id: String,

        /// Print the auto-mode skeleton for this experiment instead
        #[arg(long, value_name = "EXPERIMENT_ID")]
        auto: Option<String>,
    },

    /// Split a file into chunk messages, one JSON object per line
    Chunk {
        /// File to split
        file: PathBuf,

        /// File ID shared by all chunks (defaults to the file name)
        #[arg(long)]
        file_id: Option<String>,

        /// Characters of encoded payload per chunk
        #[arg(long)]
        chunk_size: Option<usize>,

        /// Send the file as UTF-8 text instead of base64
        #[arg(long)]
        text: bool,
    },

    /// Reassemble files from a JSON-lines stream of chunk messages
    Reassemble {
        /// JSON-lines input
        input: PathBuf,

        /// Directory for completed files
        #[arg(long, default_value = ".")]
        out_dir: PathBuf,
    },

    /// Infer a JSON Schema from a sample record
    Schema {
        /// JSON file holding one sample object
        sample: PathBuf,

        #[arg(long, default_value = "Data schema")]
        title: String,

        #[arg(long, default_value = "")]
        description: String,
    },

    /// Print the topics used by an experiment
    Topics {
        /// Experiment ID
        experiment_id: String,

        /// Device to show data/analysis topics for
        #[arg(long)]
        device: Option<String>,

        /// Run ID to show the replay topic for
        #[arg(long)]
        run_id: Option<String>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = match &cli.settings {
        Some(path) => ClientSettings::load_from(path)
            .with_context(|| format!("loading settings from {}", path.display()))?,
        None => ClientSettings::load().context("loading settings")?,
    };
    settings.validate()?;
    logging::init_from_settings(&settings)?;

    match cli.command {
        Commands::Validate {
            config,
            run_id,
            auto,
        } => run_validate(config, &run_id, auto),
        Commands::Chunk {
            file,
            file_id,
            chunk_size,
            text,
        } => {
            let size = chunk_size
                .or(settings.experiment.chunk_size)
                .unwrap_or(chunk::DEFAULT_CHUNK_SIZE);
            run_chunk(&file, file_id, size, text)
        }
        Commands::Reassemble { input, out_dir } => run_reassemble(&input, &out_dir),
        Commands::Schema {
            sample,
            title,
            description,
        } => run_schema(&sample, &title, &description),
        Commands::Topics {
            experiment_id,
            device,
            run_id,
        } => run_topics(
            &settings.experiment.root_topic,
            &experiment_id,
            device.as_deref(),
            run_id.as_deref(),
        ),
    }
}

fn run_validate(path: Option<PathBuf>, run_id: &str, auto: Option<String>) -> Result<()> {
    let normalized = match (auto, path) {
        (Some(experiment_id), _) => config::auto_config(&experiment_id, run_id)?,
        (None, Some(path)) => {
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            config::validate(ConfigSource::Text(text), run_id)?
        }
        (None, None) => bail!("either a configuration file or --auto <EXPERIMENT_ID> is required"),
    };
    println!("{}", serde_json::to_string_pretty(normalized.document())?);
    Ok(())
}

fn run_chunk(path: &Path, file_id: Option<String>, size: usize, text: bool) -> Result<()> {
    let file_id = match file_id {
        Some(id) => id,
        None => path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .context("input path has no file name; pass --file-id")?,
    };
    let input = if text {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {} as UTF-8", path.display()))?;
        ChunkInput::text(content)
    } else {
        ChunkInput::Binary(std::fs::read(path).with_context(|| format!("reading {}", path.display()))?)
    };

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    for part in chunk::chunk(input, size, &file_id)? {
        writeln!(out, "{}", part.to_json()?)?;
    }
    Ok(())
}

fn run_reassemble(input: &Path, out_dir: &Path) -> Result<()> {
    let reader = BufReader::new(
        std::fs::File::open(input).with_context(|| format!("opening {}", input.display()))?,
    );
    std::fs::create_dir_all(out_dir)?;

    let mut reassembler = Reassembler::new();
    let mut written = 0usize;
    for (number, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let Some(file) = reassembler
            .ingest_json(&line)
            .with_context(|| format!("line {}", number + 1))?
        else {
            continue;
        };
        // File IDs come from the stream; keep only the final path component.
        let name = Path::new(&file.file_id)
            .file_name()
            .with_context(|| format!("unusable file ID '{}'", file.file_id))?;
        let target = out_dir.join(name);
        std::fs::write(&target, file.payload.as_bytes())
            .with_context(|| format!("writing {}", target.display()))?;
        println!("{}", target.display());
        written += 1;
    }

    for file_id in reassembler.pending_ids() {
        if let Some((received, total)) = reassembler.progress(&file_id) {
            tracing::warn!(file_id = %file_id, received, total, "Transfer incomplete");
        }
    }
    tracing::info!(files = written, "Reassembly finished");
    Ok(())
}

fn run_schema(sample: &Path, title: &str, description: &str) -> Result<()> {
    let text = std::fs::read_to_string(sample)
        .with_context(|| format!("reading {}", sample.display()))?;
    let value: serde_json::Value = serde_json::from_str(&text)?;
    let schema = schema::create_schema(&value, title, description)?;
    println!("{}", serde_json::to_string_pretty(&schema)?);
    Ok(())
}

fn run_topics(root: &str, experiment_id: &str, device: Option<&str>, run_id: Option<&str>) -> Result<()> {
    let topics = TopicBuilder::new(root, experiment_id);
    println!("config  {}", topics.config());
    println!("reset   {}", topics.reset());
    println!("debug   {}", topics.debug());
    if let Some(device) = device {
        println!("data    {}", topics.data(device)?);
        println!("funcx   {}", topics.funcx(device)?);
        println!("dlhub   {}", topics.dlhub(device)?);
    }
    if let Some(run_id) = run_id {
        println!("replay  {}", topics.replay(run_id)?);
    }
    Ok(())
}
