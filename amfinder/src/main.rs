use clap::Parser;
use env_logger::Builder;
use env_logger::Env;
use log::{error, info, Level};
use std::io::Write;

use amfinder::color_utils::{colors, init_color_config, symbols};
use amfinder::config::{GlobalArgs, PredictCommand, PredictionConfig};
use amfinder::error::exit_code_for;
use amfinder::mosaic_processing::run_prediction;

#[derive(clap::Subcommand)]
pub enum Commands {
    /// Predict mycorrhizal structures on tiled mosaic images
    Predict(PredictCommand),

    /// Show version information
    Version,
}

#[derive(Parser)]
#[command(name = "amfinder")]
#[command(about = "Tiled prediction of mycorrhizal colonization with class activation maps")]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Option<Commands>,
}

fn get_log_level_from_verbosity(
    verbosity: &clap_verbosity_flag::Verbosity<clap_verbosity_flag::ErrorLevel>,
) -> log::LevelFilter {
    // -q is ERROR; otherwise one level more verbose than clap's default mapping
    if verbosity.is_silent() {
        return log::LevelFilter::Error;
    }
    match verbosity.log_level_filter() {
        log::LevelFilter::Off => log::LevelFilter::Off,
        log::LevelFilter::Error => log::LevelFilter::Warn,
        log::LevelFilter::Warn => log::LevelFilter::Info,
        log::LevelFilter::Info => log::LevelFilter::Debug,
        log::LevelFilter::Debug | log::LevelFilter::Trace => log::LevelFilter::Trace,
    }
}

fn init_logging(global: &GlobalArgs) {
    // RUST_LOG applies only when no -v/-q flag was given
    let use_env = !global.verbosity.is_present() && std::env::var_os("RUST_LOG").is_some();

    let mut logger = if use_env {
        Builder::from_env(Env::default())
    } else {
        let mut b = Builder::new();
        b.filter_level(get_log_level_from_verbosity(&global.verbosity));
        b
    };

    logger
        .format(|buf, record| {
            let level_str = match record.level() {
                Level::Error => colors::error_level("ERROR"),
                Level::Warn => colors::warning_level("WARN"),
                Level::Info => colors::info_level("INFO"),
                Level::Debug => colors::debug_level("DEBUG"),
                Level::Trace => colors::trace_level("TRACE"),
            };
            writeln!(buf, "[{}] {}", level_str, record.args())
        })
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_color_config(cli.global.no_color);
    init_logging(&cli.global);

    match &cli.command {
        Some(Commands::Predict(cmd)) => {
            let sources_desc = if cmd.sources.len() == 1 {
                cmd.sources[0].clone()
            } else {
                format!("{} inputs", cmd.sources.len())
            };
            info!(
                "{} Prediction: {} | model: {} | tile: {} px | batch: {}",
                symbols::prediction_start(),
                sources_desc,
                cmd.model.display(),
                cmd.tile_size,
                cmd.batch_size
            );
            if cmd.cams {
                info!("   Activation maps: on ({:?})", cmd.colormap);
            }

            let config = match PredictionConfig::from_args(cli.global.clone(), cmd.clone()) {
                Ok(config) => config,
                Err(e) => {
                    error!("{} {e}", symbols::operation_failed());
                    std::process::exit(2);
                }
            };
            if let Err(e) = run_prediction(config) {
                error!("{} Prediction failed: {e:#}", symbols::operation_failed());
                std::process::exit(exit_code_for(&e));
            }
        }
        Some(Commands::Version) => {
            println!("amfinder v{}", env!("CARGO_PKG_VERSION"));
        }
        None => {
            use clap::CommandFactory;
            let mut cmd = Cli::command();
            if let Err(e) = cmd.print_help() {
                eprintln!("{e}");
            }
        }
    }
}
