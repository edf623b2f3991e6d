use std::io::{self, BufRead, ErrorKind, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use archviz_contracts::analysis::{PromptSuggestion, SynthesisError, STYLE_PRESETS};
use archviz_contracts::events::EventWriter;
use archviz_contracts::render::RenderOutput;
use archviz_contracts::studio::{parse_intent, STUDIO_HELP_COMMANDS};
use archviz_engine::{new_session_id, EngineConfig, RenderError, StudioSession};
use clap::{Args, Parser, Subcommand};
use serde_json::Value;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Exit status for missing credentials and unusable input.
const USAGE_EXIT_CODE: i32 = 2;

#[derive(Debug, Parser)]
#[command(
    name = "archviz",
    version,
    about = "Turn architectural line drawings into render prompts and ControlNet renders"
)]
struct Cli {
    /// Debug-level logging (overridden by RUST_LOG).
    #[arg(long, short, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Write a render prompt for a geometry drawing.
    Analyze(AnalyzeArgs),
    /// Look up a vision-capable model from the live model list.
    Discover(DiscoverArgs),
    /// Render the geometry drawing with a prompt (analyzing first if none is given).
    Render(RenderArgs),
    /// Interactive session: load images, analyze, edit the prompt, render.
    Studio(StudioArgs),
}

#[derive(Debug, Clone, Args)]
struct EngineArgs {
    /// JSONL file to append session events to.
    #[arg(long)]
    events: Option<PathBuf>,
    /// Per-request network timeout in seconds.
    #[arg(long)]
    timeout: Option<f64>,
    /// Look up a vision model before the first analysis.
    #[arg(long)]
    discover: bool,
    /// Candidate vision model, most preferred first. Repeatable.
    #[arg(long = "model")]
    models: Vec<String>,
}

#[derive(Debug, Clone, Args)]
struct PromptArgs {
    /// Style preset key (glass, concrete, brick, forest) or free text.
    #[arg(long, default_value = "glass")]
    style: String,
    #[arg(long)]
    notes: Option<String>,
    /// Ask for a plain studio background instead of a surrounding environment.
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    clean: bool,
    /// Optional style reference image.
    #[arg(long)]
    reference: Option<PathBuf>,
}

#[derive(Debug, Parser)]
struct AnalyzeArgs {
    #[arg(long)]
    geometry: PathBuf,
    #[command(flatten)]
    prompt: PromptArgs,
    #[command(flatten)]
    engine: EngineArgs,
    /// Print the result as JSON.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Parser)]
struct DiscoverArgs {
    #[command(flatten)]
    engine: EngineArgs,
}

#[derive(Debug, Parser)]
struct RenderArgs {
    #[arg(long)]
    geometry: PathBuf,
    /// Render prompt; when omitted the drawing is analyzed first.
    #[arg(long)]
    prompt: Option<String>,
    #[command(flatten)]
    prompt_args: PromptArgs,
    #[arg(long)]
    negative: Option<String>,
    #[arg(long)]
    resolution: Option<u32>,
    #[arg(long)]
    scale: Option<f64>,
    #[arg(long)]
    steps: Option<u32>,
    #[arg(long)]
    render_model: Option<String>,
    /// Write the rendered image here.
    #[arg(long)]
    save: Option<PathBuf>,
    #[command(flatten)]
    engine: EngineArgs,
}

#[derive(Debug, Parser)]
struct StudioArgs {
    #[arg(long)]
    geometry: Option<PathBuf>,
    #[arg(long)]
    reference: Option<PathBuf>,
    #[arg(long)]
    style: Option<String>,
    #[arg(long)]
    render_model: Option<String>,
    #[command(flatten)]
    engine: EngineArgs,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("archviz error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    match cli.command {
        Command::Analyze(args) => run_analyze(args),
        Command::Discover(args) => run_discover(args),
        Command::Render(args) => run_render(args),
        Command::Studio(args) => run_studio(args),
    }
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .try_init();
}

fn build_session(engine: &EngineArgs) -> StudioSession {
    let mut config = EngineConfig::from_env();
    if let Some(seconds) = engine.timeout {
        config = config.with_timeout_seconds(seconds);
    }
    if engine.discover {
        config.discover_models = true;
    }
    tracing::debug!(?config, "engine configuration");
    let session_id = new_session_id();
    let events = match engine.events.as_ref() {
        Some(path) => EventWriter::new(path, session_id),
        None => EventWriter::disabled(session_id),
    };
    let mut session = StudioSession::new(config, events);
    session.set_models(engine.models.clone());
    session
}

fn apply_prompt_args(session: &mut StudioSession, args: &PromptArgs) -> Result<()> {
    session.set_style(&args.style)?;
    session.set_notes(args.notes.as_deref());
    session.set_clean_background(args.clean);
    if let Some(reference) = args.reference.as_deref() {
        session.set_reference_path(reference)?;
    }
    Ok(())
}

/// Credential and input problems are the caller's to fix; everything else is
/// an upstream failure.
fn synthesis_exit_code(err: &SynthesisError) -> i32 {
    match err {
        SynthesisError::AllCandidatesFailed(_) => 1,
        _ => USAGE_EXIT_CODE,
    }
}

fn render_exit_code(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<RenderError>() {
        Some(RenderError::UnknownRenderer(_)) | None => 1,
        Some(_) => USAGE_EXIT_CODE,
    }
}

fn print_suggestion(out: &mut impl Write, suggestion: &PromptSuggestion) -> io::Result<()> {
    let noun = if suggestion.attempts == 1 {
        "attempt"
    } else {
        "attempts"
    };
    writeln!(
        out,
        "Prompt ({}, {} {noun}):\n{}",
        suggestion.model, suggestion.attempts, suggestion.prompt
    )
}

fn run_analyze(args: AnalyzeArgs) -> Result<i32> {
    let mut session = build_session(&args.engine);
    session.set_geometry_path(&args.geometry)?;
    apply_prompt_args(&mut session, &args.prompt)?;

    match session.analyze() {
        Ok(suggestion) => {
            let mut stdout = io::stdout();
            if args.json {
                let payload = serde_json::json!({
                    "model": suggestion.model,
                    "attempts": suggestion.attempts,
                    "prompt": suggestion.prompt,
                });
                writeln!(stdout, "{}", serde_json::to_string_pretty(&payload)?)?;
            } else {
                print_suggestion(&mut stdout, &suggestion)?;
            }
            Ok(0)
        }
        Err(err) => {
            eprintln!("Analysis failed: {err}");
            Ok(synthesis_exit_code(&err))
        }
    }
}

fn run_discover(args: DiscoverArgs) -> Result<i32> {
    let mut session = build_session(&args.engine);
    match session.discover() {
        Ok(model) => {
            println!("{model}");
            Ok(0)
        }
        Err(err) => {
            eprintln!("Discovery failed: {err:#}");
            let code = match err.downcast_ref::<SynthesisError>() {
                Some(SynthesisError::MissingCredential(_)) => USAGE_EXIT_CODE,
                _ => 1,
            };
            Ok(code)
        }
    }
}

fn run_render(args: RenderArgs) -> Result<i32> {
    let mut session = build_session(&args.engine);
    session.set_geometry_path(&args.geometry)?;
    apply_prompt_args(&mut session, &args.prompt_args)?;
    session.set_render_model(args.render_model.clone());
    if let Some(negative) = args.negative.as_deref() {
        session.set_negative_prompt(negative);
    }
    if let Some(resolution) = args.resolution {
        session.set_resolution(resolution);
    }
    if let Some(scale) = args.scale {
        session.set_guidance_scale(scale);
    }
    session.set_steps(args.steps);

    match args.prompt.as_deref() {
        Some(prompt) => session.set_prompt(prompt),
        None => match session.analyze() {
            Ok(suggestion) => print_suggestion(&mut io::stderr(), &suggestion)?,
            Err(err) => {
                eprintln!("Analysis failed: {err}");
                return Ok(synthesis_exit_code(&err));
            }
        },
    }

    let output = match session.render() {
        Ok(output) => output,
        Err(err) => {
            eprintln!("Render failed: {err:#}");
            return Ok(render_exit_code(&err));
        }
    };
    print_render_output(&mut io::stdout(), &output)?;
    if let Some(path) = args.save.as_deref() {
        let saved = session.save_render(path)?;
        println!("Saved {}", saved.display());
    }
    Ok(0)
}

fn print_render_output(out: &mut impl Write, output: &RenderOutput) -> io::Result<()> {
    match output.canonical() {
        Some(url) if url.starts_with("data:") => writeln!(out, "Rendered (inline image)"),
        Some(url) => writeln!(out, "Rendered: {url}"),
        None => writeln!(out, "Render returned no image"),
    }
}

fn run_studio(args: StudioArgs) -> Result<i32> {
    let mut session = build_session(&args.engine);
    if let Some(path) = args.geometry.as_deref() {
        session.set_geometry_path(path)?;
    }
    if let Some(path) = args.reference.as_deref() {
        session.set_reference_path(path)?;
    }
    if let Some(style) = args.style.as_deref() {
        session.set_style(style)?;
    }
    session.set_render_model(args.render_model.clone());

    println!("archviz studio started. Type /help for commands.");
    let stdin = io::stdin();
    run_studio_loop(&mut session, stdin.lock(), &mut io::stdout())?;
    Ok(0)
}

fn run_studio_loop(
    session: &mut StudioSession,
    mut input: impl BufRead,
    out: &mut impl Write,
) -> Result<()> {
    let mut line = String::new();
    loop {
        write!(out, "> ")?;
        out.flush()?;

        line.clear();
        let read = match input.read_line(&mut line) {
            Ok(read) => read,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        };
        if read == 0 {
            break;
        }

        let intent = parse_intent(line.trim_end_matches(['\n', '\r']));
        match intent.action.as_str() {
            "noop" => {}
            "help" => writeln!(out, "Commands: {}", STUDIO_HELP_COMMANDS.join(" "))?,
            "styles" => {
                for preset in STYLE_PRESETS {
                    writeln!(out, "  {:<10} {}", preset.key, preset.label)?;
                }
            }
            "set_geometry" | "set_reference" => {
                let Some(path) = value_as_non_empty_string(intent.command_args.get("path"))
                else {
                    writeln!(out, "/{} requires a path", intent.action.trim_start_matches("set_"))?;
                    continue;
                };
                let path = PathBuf::from(path);
                let loaded = if intent.action == "set_geometry" {
                    session.set_geometry_path(&path)
                } else {
                    session.set_reference_path(&path)
                };
                match loaded {
                    Ok(()) => writeln!(out, "Loaded {}", path.display())?,
                    Err(err) => writeln!(out, "Load failed: {err:#}")?,
                }
            }
            "clear_reference" => {
                session.clear_reference();
                writeln!(out, "Reference image cleared")?;
            }
            "set_style" => {
                let raw = value_as_non_empty_string(intent.command_args.get("style"))
                    .unwrap_or_default();
                match session.set_style(&raw) {
                    Ok(label) => writeln!(out, "Style set to {label}")?,
                    Err(_) => writeln!(out, "/style requires a preset key or description")?,
                }
            }
            "set_notes" => {
                let notes = value_as_non_empty_string(intent.command_args.get("notes"));
                session.set_notes(notes.as_deref());
                match session.notes() {
                    Some(notes) => writeln!(out, "Notes: {notes}")?,
                    None => writeln!(out, "Notes cleared")?,
                }
            }
            "set_negative" => {
                let negative = value_as_non_empty_string(intent.command_args.get("negative_prompt"))
                    .unwrap_or_default();
                session.set_negative_prompt(&negative);
                writeln!(out, "Negative prompt: {}", session.negative_prompt())?;
            }
            "set_models" => {
                let models = intent
                    .command_args
                    .get("models")
                    .and_then(Value::as_array)
                    .map(|rows| {
                        rows.iter()
                            .filter_map(Value::as_str)
                            .map(str::to_string)
                            .collect::<Vec<_>>()
                    })
                    .unwrap_or_default();
                if models.is_empty() {
                    writeln!(out, "Using default vision models")?;
                } else {
                    writeln!(out, "Vision models: {}", models.join(", "))?;
                }
                session.set_models(models);
            }
            "set_render_param" | "set_clean" => match session.apply_settings(&intent.settings_update) {
                Ok(()) => writeln!(out, "Updated {}", describe_settings(&intent.settings_update))?,
                Err(err) => writeln!(out, "{err}")?,
            },
            "discover" => match session.discover() {
                Ok(model) => writeln!(out, "Discovered model: {model}")?,
                Err(err) => writeln!(out, "Discovery failed: {err:#}")?,
            },
            "analyze" => match session.analyze() {
                Ok(suggestion) => {
                    print_suggestion(out, &suggestion)?;
                    writeln!(out, "Type to replace the prompt, or /render.")?;
                }
                Err(err) => writeln!(out, "Analysis failed: {err}")?,
            },
            "edit_prompt" => {
                session.set_prompt(intent.prompt.as_deref().unwrap_or_default());
                writeln!(out, "Prompt updated.")?;
            }
            "render" => match session.render() {
                Ok(output) => print_render_output(out, &output)?,
                Err(err) => writeln!(out, "Render failed: {err:#}")?,
            },
            "save_render" => {
                let Some(path) = value_as_non_empty_string(intent.command_args.get("path"))
                else {
                    writeln!(out, "/save requires a path")?;
                    continue;
                };
                match session.save_render(Path::new(&path)) {
                    Ok(saved) => writeln!(out, "Saved {}", saved.display())?,
                    Err(err) => writeln!(out, "Save failed: {err:#}")?,
                }
            }
            "show" => {
                let summary = serde_json::to_string_pretty(&session.summary())
                    .context("failed formatting session summary")?;
                writeln!(out, "{summary}")?;
            }
            "invalid" => {
                let message = value_as_non_empty_string(intent.command_args.get("error"))
                    .unwrap_or_else(|| "invalid command".to_string());
                writeln!(out, "{message}")?;
            }
            _ => {
                let command = value_as_non_empty_string(intent.command_args.get("command"))
                    .unwrap_or_else(|| intent.raw.trim().to_string());
                writeln!(out, "Unknown command /{command}. Type /help for commands.")?;
            }
        }
    }
    Ok(())
}

fn describe_settings(settings: &std::collections::BTreeMap<String, Value>) -> String {
    settings
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join(", ")
}

fn value_as_non_empty_string(value: Option<&Value>) -> Option<String> {
    let raw = value
        .and_then(Value::as_str)
        .map(str::trim)
        .unwrap_or_default();
    if raw.is_empty() {
        None
    } else {
        Some(raw.to_string())
    }
}
