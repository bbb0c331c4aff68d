use clap::{Parser, Subcommand};
use std::io;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;
use upscale_worker::config;
use upscale_worker::dispatch::Dispatcher;
use upscale_worker::imaging::{calculate_output_dimensions, calculate_scale_for_crop};
use upscale_worker::output::{Emitter, format_plan};
use upscale_worker::runtime::ReferenceRuntime;

const DEFAULT_LOG_FILTER: &str = "upscale_worker=info";

fn version_string() -> &'static str {
    let on_tag = env!("ON_RELEASE_TAG");
    if on_tag == "true" {
        env!("CARGO_PKG_VERSION")
    } else {
        let hash = env!("GIT_HASH");
        if hash.is_empty() {
            "dev@unknown"
        } else {
            // Leaked once at startup
            Box::leak(format!("dev@{hash}").into_boxed_str())
        }
    }
}

#[derive(Parser)]
#[command(name = "upscale-worker")]
#[command(about = "Image upscaling worker driven by JSON lines on stdin")]
#[command(long_about = "\
Image upscaling worker driven by JSON lines on stdin

Each input line is one job; each job gets exactly one response line:

  → {\"method\":\"esrgan\",\"config\":{\"image_path\":\"/in/a.jpg\"},\"job_id\":\"j1\"}
  ← {\"type\":\"result\",\"job_id\":\"j1\",\"output_path\":\"/app/results/a_esrgan.png\",...}

Methods:
  esrgan   Tiled super-resolution with a local upscale network
  flux     Network upscale followed by tiled diffusion refinement
  imagen   Remote upscale through the Vertex AI Imagen API

Models are read from <model_cache_dir>/{upscale_models,unet,vae,clip}/.
Logs go to stderr; stdout carries only protocol lines.

Run 'upscale-worker gen-config' to generate a documented upscale-worker.toml.")]
#[command(version = version_string())]
struct Cli {
    /// Worker config file (missing file = stock defaults)
    #[arg(long, default_value = config::CONFIG_FILE_NAME, global = true)]
    config: PathBuf,

    /// Log filter directive, e.g. "upscale_worker=debug" (overrides RUST_LOG)
    #[arg(long, global = true)]
    log_filter: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve jobs from stdin until end of input
    Serve,
    /// Print the output dimension plan for an input size
    Plan(PlanArgs),
    /// Print a stock upscale-worker.toml with all options documented
    GenConfig,
}

#[derive(clap::Args)]
struct PlanArgs {
    /// Input width in pixels
    #[arg(long)]
    width: u32,
    /// Input height in pixels
    #[arg(long)]
    height: u32,
    /// Print width in inches
    #[arg(long, requires = "print_height")]
    print_width: Option<f64>,
    /// Print height in inches
    #[arg(long, requires = "print_width")]
    print_height: Option<f64>,
    /// Print density (default from config)
    #[arg(long)]
    dpi: Option<u32>,
    /// Upscale factor when no print size is given (default from config)
    #[arg(long)]
    factor: Option<f64>,
    /// Human-readable summary instead of JSON
    #[arg(long)]
    text: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_tracing(cli.log_filter.as_deref());

    match cli.command {
        Command::Serve => {
            let config = config::load_config(&cli.config)?;
            init_thread_pool(&config.processing);
            let runtime = ReferenceRuntime::new(config.device());
            info!(
                version = version_string(),
                models = %config.model_cache_dir.display(),
                output = %config.output_dir.display(),
                "worker starting"
            );
            let mut dispatcher = Dispatcher::with_default_providers(&runtime, &config)?;
            let mut emitter = Emitter::new(io::stdout().lock());
            dispatcher.run(io::stdin().lock(), &mut emitter)?;
        }
        Command::Plan(args) => {
            let config = config::load_config(&cli.config)?;
            let dpi = args.dpi.unwrap_or(config.defaults.dpi);
            match (args.print_width, args.print_height) {
                (Some(print_width), Some(print_height)) => {
                    let plan = calculate_scale_for_crop(
                        args.width,
                        args.height,
                        print_width,
                        print_height,
                        dpi,
                    )?;
                    if args.text {
                        for line in format_plan(&plan) {
                            println!("{}", line);
                        }
                    } else {
                        println!("{}", serde_json::to_string_pretty(&plan)?);
                    }
                }
                _ => {
                    let factor = args
                        .factor
                        .unwrap_or(f64::from(config.defaults.upscale_factor));
                    let dims =
                        calculate_output_dimensions((args.width, args.height), factor, None)?;
                    if args.text {
                        println!(
                            "Output: {}x{} px (scale {:.4})",
                            dims.output_width, dims.output_height, dims.scale_factor
                        );
                    } else {
                        println!("{}", serde_json::to_string_pretty(&dims)?);
                    }
                }
            }
        }
        Command::GenConfig => {
            print!("{}", config::stock_config_toml());
        }
    }

    Ok(())
}

/// Install the stderr subscriber. `--log-filter` wins over `RUST_LOG`.
fn init_tracing(filter: Option<&str>) {
    let directives = filter
        .map(str::to_string)
        .or_else(|| std::env::var("RUST_LOG").ok())
        .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::builder().parse_lossy(directives))
        .with_writer(io::stderr)
        .with_target(true)
        .init();
}

/// Initialize the rayon thread pool based on processing config.
///
/// Capped at the number of available CPU cores.
fn init_thread_pool(processing: &config::ProcessingConfig) {
    let threads = config::effective_threads(processing);
    rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .build_global()
        .ok();
}
