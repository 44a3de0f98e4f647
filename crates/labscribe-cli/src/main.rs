use std::fs;
use std::io;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use labscribe_contracts::fence::BlockPolicy;
use labscribe_contracts::fhir;
use labscribe_contracts::models::{ModelSelector, TOOLS};
use labscribe_contracts::records::SubjectFields;
use labscribe_contracts::tools::ToolRegistry;
use labscribe_engine::{
    review_payload, CancelToken, ModelConfig, OpenAiChatBackend, Pipeline, PipelineConfig,
    PipelineReport, RepairOutcome,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "labscribe", version, about = "Lab report images to validated HL7 FHIR JSON")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Fetch a subject's lab report from the record authority and convert it.
    Run(RunArgs),
    /// Convert a lab report image already on disk.
    Convert(ConvertArgs),
    /// Validate FHIR JSON files.
    Validate(ValidateArgs),
    /// Ask the model to review a payload with the validator as a tool.
    Review(ReviewArgs),
}

#[derive(Debug, Parser)]
struct RunArgs {
    /// JSON file with the subject's demographics.
    #[arg(long)]
    subject: PathBuf,
    #[arg(long)]
    out: PathBuf,
    #[arg(long)]
    file_id: Option<String>,
    #[arg(long)]
    max_attempts: Option<u32>,
    #[arg(long)]
    model: Option<String>,
    #[arg(long)]
    events: Option<PathBuf>,
}

#[derive(Debug, Parser)]
struct ConvertArgs {
    #[arg(long)]
    image: PathBuf,
    #[arg(long)]
    out: PathBuf,
    #[arg(long)]
    instruction: Option<String>,
    #[arg(long)]
    max_attempts: Option<u32>,
    #[arg(long)]
    model: Option<String>,
    /// Surface fenced blocks that are not valid JSON as invalid payloads.
    #[arg(long)]
    strict_blocks: bool,
}

#[derive(Debug, Parser)]
struct ValidateArgs {
    #[arg(required = true)]
    files: Vec<PathBuf>,
}

#[derive(Debug, Parser)]
struct ReviewArgs {
    #[arg(long)]
    payload: PathBuf,
    #[arg(long)]
    model: Option<String>,
}

fn main() {
    init_tracing();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("labscribe error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run(args) => run_records(args),
        Command::Convert(args) => run_convert(args),
        Command::Validate(args) => run_validate(args),
        Command::Review(args) => run_review(args),
    }
}

fn run_records(args: RunArgs) -> Result<i32> {
    let raw = fs::read_to_string(&args.subject)
        .with_context(|| format!("failed reading {}", args.subject.display()))?;
    let subject: SubjectFields = serde_json::from_str(&raw)
        .with_context(|| format!("{} is not a subject JSON object", args.subject.display()))?;

    let mut config = PipelineConfig::from_env();
    config.out_dir = args.out;
    config.file_id = args.file_id;
    config.events_path = args.events;
    if let Some(max_attempts) = args.max_attempts {
        config.repair.max_attempts = max_attempts;
    }
    if let Some(model) = args.model {
        config.model.model = model;
    }

    let mut pipeline = Pipeline::from_config(config)?;
    let report = pipeline.run(&subject, &CancelToken::new())?;
    Ok(print_report(&report))
}

fn run_convert(args: ConvertArgs) -> Result<i32> {
    let mut config = PipelineConfig::from_env();
    config.out_dir = args.out;
    if let Some(instruction) = args.instruction {
        config.repair.instruction = instruction;
    }
    if let Some(max_attempts) = args.max_attempts {
        config.repair.max_attempts = max_attempts;
    }
    if let Some(model) = args.model {
        config.model.model = model;
    }
    if args.strict_blocks {
        config.repair.block_policy = BlockPolicy::strict();
    }

    let mut pipeline = Pipeline::from_config(config)?;
    let report = pipeline.convert_local(&args.image, &CancelToken::new())?;
    Ok(print_report(&report))
}

fn run_validate(args: ValidateArgs) -> Result<i32> {
    let mut all_valid = true;
    for path in &args.files {
        match fs::read_to_string(path) {
            Ok(text) => {
                let result = fhir::validate(&text);
                all_valid &= result.valid;
                println!("{}: {}", path.display(), result.message);
            }
            Err(err) => {
                all_valid = false;
                println!("{}: failed reading file: {err}", path.display());
            }
        }
    }
    Ok(if all_valid { 0 } else { 1 })
}

fn run_review(args: ReviewArgs) -> Result<i32> {
    let payload = fs::read_to_string(&args.payload)
        .with_context(|| format!("failed reading {}", args.payload.display()))?;
    let mut config = ModelConfig::from_env();
    if let Some(model) = args.model {
        config.model = model;
    }
    let selection = ModelSelector::default()
        .select(Some(&config.model), TOOLS)
        .map_err(anyhow::Error::msg)?;
    if let Some(reason) = &selection.fallback_reason {
        warn!(model = %selection.model.name, reason = %reason, "model selection fell back");
    }

    let backend = OpenAiChatBackend::new(&config)?;
    let tools = ToolRegistry::with_validator();
    let outcome = review_payload(
        &backend,
        &tools,
        &selection.model.name,
        &payload,
        BlockPolicy::tolerant(),
    )?;
    info!(
        rounds = outcome.reply.rounds,
        tool_calls = outcome.reply.tool_outcomes.len(),
        blocks = outcome.blocks.len(),
        "review finished"
    );
    println!("{}", outcome.reply.text.trim());

    let mut all_valid = true;
    for (index, block) in outcome.blocks.iter().enumerate() {
        let result = fhir::validate(&block.source);
        all_valid &= result.valid;
        eprintln!("block {}: {}", index + 1, result.message);
    }
    Ok(if all_valid { 0 } else { 1 })
}

/// Prints where the run landed; exit code 2 flags payloads left invalid.
fn print_report(report: &PipelineReport) -> i32 {
    let repair = &report.repair;
    println!("run {}: {}", report.run_id, repair.outcome.as_str());
    println!("attempts: {}", repair.attempts);
    for path in &report.resource_paths {
        println!("resource: {}", path.display());
    }
    for block in &repair.invalid {
        println!("invalid block {}: {}", block.index, block.result.message);
    }
    println!("summary: {}", report.summary_path.display());
    println!("events: {}", report.events_path.display());
    match repair.outcome {
        RepairOutcome::AllValid => 0,
        RepairOutcome::BudgetExhausted | RepairOutcome::Cancelled => 2,
    }
}
