//! promptshift CLI - transform an image under a text prompt.

use std::ffi::OsString;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use promptshift::config::{DEFAULT_ENDPOINT, DEFAULT_TOKENIZER_MODEL};
use promptshift::{Config, Device, MemoryStrategy, ModelSource, ResizeMode, Runner};

/// Transform an image with a ControlNet diffusion pipeline guided by a prompt.
///
/// Prints `output_path is: <OUTPUT>` and exits 0 on success; exits 1 on failure.
/// The first three arguments are always INPUT, OUTPUT and PROMPT, taken
/// verbatim; options follow them.
#[derive(Parser, Debug)]
#[command(name = "promptshift")]
#[command(version, about, long_about = None)]
struct Args {
    /// Input image path.
    #[arg(value_name = "INPUT")]
    input: PathBuf,

    /// Output image path.
    #[arg(value_name = "OUTPUT")]
    output: PathBuf,

    /// Text prompt (may be empty).
    #[arg(value_name = "PROMPT", allow_hyphen_values = true)]
    prompt: String,

    /// Number of denoising steps. More steps = better quality but slower.
    #[arg(long, default_value = "20", value_name = "INT")]
    steps: u32,

    /// Classifier-free guidance scale. Values <= 1 disable guidance.
    #[arg(long, default_value = "7.5", value_name = "FLOAT")]
    guidance_scale: f32,

    /// Multiplier for the ControlNet residuals.
    #[arg(long, default_value = "1.0", value_name = "FLOAT")]
    conditioning_scale: f32,

    /// Prompt for the unconditional guidance branch.
    #[arg(long, default_value = "", value_name = "TEXT")]
    negative_prompt: String,

    /// Random seed for reproducibility.
    #[arg(long, value_name = "INT")]
    seed: Option<u64>,

    /// Target resolution of the control image.
    #[arg(long, default_value = "512", value_name = "PIXELS")]
    resolution: u32,

    /// Resize mode: exact (square), preserve-aspect or none.
    #[arg(long, default_value = "exact", value_name = "MODE")]
    resize: ResizeMode,

    /// Compute device: auto, cpu, cuda or cuda:N.
    #[arg(long, default_value = "auto", value_name = "DEVICE")]
    device: Device,

    /// Base pipeline repository (ONNX export with a ControlNet-aware `UNet`).
    #[arg(long, value_name = "REPO")]
    base_model: Option<String>,

    /// ControlNet repository (ONNX export).
    #[arg(long, value_name = "REPO")]
    controlnet_model: Option<String>,

    /// Tokenizer repository.
    #[arg(long, default_value = DEFAULT_TOKENIZER_MODEL, value_name = "REPO")]
    tokenizer_model: String,

    /// Registry revision.
    #[arg(long, default_value = "main", value_name = "REV")]
    revision: String,

    /// Registry base URL.
    #[arg(long, default_value = DEFAULT_ENDPOINT, value_name = "URL")]
    endpoint: String,

    /// Read all models from this directory instead of downloading.
    #[arg(long, value_name = "DIR")]
    model_dir: Option<PathBuf>,

    /// Run the content safety checker on the output.
    #[arg(long)]
    safety_checker: bool,

    /// Unload each model as soon as its stage is done.
    #[arg(long)]
    offload: bool,

    /// Device memory limit in bytes.
    #[arg(long, value_name = "BYTES")]
    memory_limit: Option<usize>,

    /// Enable verbose output.
    #[arg(short, long)]
    verbose: bool,
}

/// Flags that print help or version instead of running.
const INFO_FLAGS: [&str; 4] = ["-h", "--help", "-V", "--version"];

/// Parse the command line so that the three positionals are never read as
/// options, whatever they look like.
///
/// `prog INPUT OUTPUT PROMPT [OPTIONS]` is reordered to
/// `prog [OPTIONS] -- INPUT OUTPUT PROMPT` before clap sees it. Shorter command
/// lines, or ones starting with a help/version flag, are parsed as given.
fn parse_args<I, T>(argv: I) -> std::result::Result<Args, clap::Error>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString>,
{
    let argv: Vec<OsString> = argv.into_iter().map(Into::into).collect();

    let leading_info_flag = argv
        .get(1)
        .is_some_and(|first| INFO_FLAGS.iter().any(|flag| first == flag));

    if argv.len() < 4 || leading_info_flag {
        return Args::try_parse_from(argv);
    }

    let (head, options) = argv.split_at(4);
    let reordered = head[..1]
        .iter()
        .chain(options)
        .cloned()
        .chain(std::iter::once(OsString::from("--")))
        .chain(head[1..].iter().cloned());

    Args::try_parse_from(reordered)
}

/// The stdout text and exit status for a finished run.
fn report(result: &Result<PathBuf>) -> (String, u8) {
    match result {
        Ok(output) => (format!("output_path is: {}", output.display()), 0),
        Err(err) => (format!("Error: {err:#}"), 1),
    }
}

fn main() -> ExitCode {
    let args = match parse_args(std::env::args_os()) {
        Ok(args) => args,
        Err(err) => {
            // Help, version and usage errors all go to stdout
            print!("{}", err.render());
            return if err.use_stderr() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    // Initialize logging; stdout is reserved for the result line
    let log_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("promptshift={log_level}").into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    let result = run(&args);
    if let Err(err) = &result {
        tracing::error!("{err:#}");
    }

    let (line, code) = report(&result);
    println!("{line}");
    ExitCode::from(code)
}

fn run(args: &Args) -> Result<PathBuf> {
    // Build configuration
    let config = Config {
        models: ModelSource {
            base_model: args.base_model.clone().unwrap_or_default(),
            controlnet_model: args.controlnet_model.clone().unwrap_or_default(),
            tokenizer_model: args.tokenizer_model.clone(),
            revision: args.revision.clone(),
            endpoint: args.endpoint.clone(),
            model_dir: args.model_dir.clone(),
        },
        device: args.device,
        memory: MemoryStrategy {
            offload_between_stages: args.offload,
            conservative_arena: true,
            memory_limit: args.memory_limit,
        },
        num_steps: args.steps,
        guidance_scale: args.guidance_scale,
        conditioning_scale: args.conditioning_scale,
        negative_prompt: args.negative_prompt.clone(),
        resolution: args.resolution,
        resize: args.resize,
        seed: args.seed,
        safety_checker: args.safety_checker,
    };

    let runner = Runner::new(config).context("Invalid configuration")?;

    runner
        .run(&args.input, &args.output, &args.prompt)
        .with_context(|| format!("Failed to process {}", args.input.display()))
}
