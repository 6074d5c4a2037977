use std::env;
use std::fs;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use petcard_contracts::events::{new_run_id, EventLog};
use petcard_contracts::generation::Theme;
use petcard_contracts::watermark::{CornerPosition, WatermarkOptions};
use petcard_engine::{
    default_provider_registry, guess_content_type, stylize_and_brand, watermark_and_prefer_jpeg,
    GenerateRequest, PipelineRunSummary,
};
use reqwest::blocking::Client as HttpClient;
use serde_json::json;

#[derive(Debug, Parser)]
#[command(name = "petcard", version, about = "Petcard watermark and stylize debug tools")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Watermark a local image file and re-encode it as JPEG.
    Watermark(WatermarkArgs),
    /// Fetch an image over HTTP, watermark it, and write the result.
    Fetch(FetchArgs),
    /// Generate stylized pet images and watermark each artifact.
    Stylize(StylizeArgs),
}

#[derive(Debug, Parser)]
struct WatermarkArgs {
    #[arg(long)]
    input: PathBuf,
    #[arg(long)]
    out: PathBuf,
    #[command(flatten)]
    knobs: WatermarkKnobs,
}

#[derive(Debug, Parser)]
struct FetchArgs {
    #[arg(long)]
    url: String,
    #[arg(long)]
    out: PathBuf,
    #[command(flatten)]
    knobs: WatermarkKnobs,
}

#[derive(Debug, Parser)]
struct StylizeArgs {
    /// Pet details entered in the wizard, e.g. "a corgi named Biscuit".
    #[arg(long)]
    prompt: String,
    /// baseball-card or superhero; omitted means the prompt is sent verbatim.
    #[arg(long)]
    theme: Option<String>,
    #[arg(long)]
    out: PathBuf,
    #[arg(long, default_value = "dryrun")]
    provider: String,
    #[arg(long, default_value = "1024x1024")]
    size: String,
    #[arg(long, default_value_t = 1)]
    n: u64,
    #[arg(long)]
    seed: Option<i64>,
    #[command(flatten)]
    knobs: WatermarkKnobs,
}

/// Watermark flags shared by every subcommand. `--logo` falls back to the
/// `WATERMARK_LOGO_PATH` environment variable, read here at the process
/// boundary and passed down as a plain path.
#[derive(Debug, Parser)]
struct WatermarkKnobs {
    #[arg(long)]
    logo: Option<PathBuf>,
    #[arg(long)]
    margin: Option<u32>,
    #[arg(long)]
    quality: Option<u8>,
    /// Corner to force, bypassing placement scoring.
    #[arg(long)]
    position: Option<String>,
    /// Corner used when scoring is disabled or unusable.
    #[arg(long)]
    fallback: Option<String>,
    /// Disable the placement scoring pass.
    #[arg(long)]
    no_auto: bool,
}

impl WatermarkKnobs {
    fn into_options(self) -> Result<WatermarkOptions> {
        let mut options = WatermarkOptions::default();
        options.logo_path = self.logo.or_else(|| {
            env::var("WATERMARK_LOGO_PATH")
                .ok()
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
                .map(PathBuf::from)
        });
        if let Some(margin) = self.margin {
            options.margin_px = margin;
        }
        if let Some(quality) = self.quality {
            options.jpeg_quality = quality;
        }
        if let Some(raw) = self.position.as_deref() {
            options.force_position = Some(raw.parse::<CornerPosition>()?);
        }
        if let Some(raw) = self.fallback.as_deref() {
            options.fallback_position = raw.parse::<CornerPosition>()?;
        }
        if self.no_auto {
            options.auto_placement = false;
        }
        Ok(options)
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Watermark(args) => run_watermark(args),
        Command::Fetch(args) => run_fetch(args),
        Command::Stylize(args) => run_stylize(args),
    }
}

fn run_watermark(args: WatermarkArgs) -> Result<()> {
    let options = args.knobs.into_options()?;
    let bytes = fs::read(&args.input)
        .with_context(|| format!("failed reading {}", args.input.display()))?;
    let declared = guess_content_type(&args.input);

    let outcome = watermark_and_prefer_jpeg(&bytes, declared, &options)?;
    fs::write(&args.out, &outcome.buffer)
        .with_context(|| format!("failed to write {}", args.out.display()))?;
    if !outcome.report.watermarked {
        eprintln!(
            "warning: input could not be watermarked; wrote {} bytes unbranded",
            outcome.buffer.len()
        );
    }
    println!(
        "{}",
        json!({
            "output": args.out.display().to_string(),
            "report": outcome.report,
        })
    );
    Ok(())
}

fn run_fetch(args: FetchArgs) -> Result<()> {
    let options = args.knobs.into_options()?;
    let http = HttpClient::new();
    let response = http
        .get(&args.url)
        .send()
        .with_context(|| format!("failed fetching {}", args.url))?;
    if !response.status().is_success() {
        bail!("fetch failed ({}): {}", response.status().as_u16(), args.url);
    }
    let declared = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    let bytes = response
        .bytes()
        .context("failed reading fetched image bytes")?
        .to_vec();

    let outcome = watermark_and_prefer_jpeg(&bytes, declared.as_deref(), &options)?;
    fs::write(&args.out, &outcome.buffer)
        .with_context(|| format!("failed to write {}", args.out.display()))?;
    println!(
        "{}",
        json!({
            "source": args.url,
            "output": args.out.display().to_string(),
            "report": outcome.report,
        })
    );
    Ok(())
}

fn run_stylize(args: StylizeArgs) -> Result<()> {
    let options = args.knobs.into_options()?;
    let theme = args
        .theme
        .as_deref()
        .map(str::parse::<Theme>)
        .transpose()?;
    let request = GenerateRequest {
        run_dir: args.out.clone(),
        prompt: args.prompt,
        theme,
        size: args.size,
        n: args.n,
        seed: args.seed,
    };
    let events = EventLog::new(args.out.join("events.jsonl"), new_run_id());
    let registry = default_provider_registry();

    let summary = stylize_and_brand(&registry, &args.provider, &request, &options, &events)?;
    for warning in &summary.warnings {
        eprintln!("warning: {warning}");
    }
    println!("{}", summary_json(&summary, events.run_id()));
    Ok(())
}

fn summary_json(summary: &PipelineRunSummary, run_id: &str) -> serde_json::Value {
    json!({
        "run_id": run_id,
        "provider": summary.provider,
        "prompt": summary.prompt,
        "warnings": summary.warnings,
        "artifacts": summary
            .artifacts
            .iter()
            .map(|artifact| {
                json!({
                    "source": artifact.source_path.display().to_string(),
                    "output": artifact.output_path.display().to_string(),
                    "report": artifact.report,
                })
            })
            .collect::<Vec<_>>(),
    })
}
