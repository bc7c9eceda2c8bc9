//! Kmsnap CLI
//!
//! Captures the active KMS scanout to a PPM file.
//!
//! # Usage
//!
//! ```bash
//! # List planes and their bound framebuffers
//! sudo kmsnap --list
//!
//! # Capture the primary framebuffer
//! sudo kmsnap --output shot.ppm
//!
//! # HDR capture with a specific curve
//! sudo kmsnap --tonemap 5 --exposure 1.2
//! ```

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

use kmsnap_core::capture::{self, DrmCard};
use kmsnap_core::formats;
use kmsnap_core::tonemap::{ToneMapOperator, ToneMapSettings};
use kmsnap_core::output::write_ppm;

/// Capture the current KMS scanout to a portable bitmap
#[derive(Parser)]
#[command(name = "kmsnap")]
#[command(version)]
#[command(about = "KMS screenshot tool with GPU de-tiling and HDR tone mapping", long_about = None)]
struct Cli {
    /// List planes and their bound framebuffers, then exit
    #[arg(long)]
    list: bool,

    /// DRM character device
    #[arg(long, default_value = "/dev/dri/card1")]
    device: PathBuf,

    /// Output path
    #[arg(long, default_value = "screenshot.ppm")]
    output: PathBuf,

    /// Numeric framebuffer id; 0 auto-detects the primary scanout
    #[arg(long, default_value_t = 0)]
    fb: u32,

    /// HDR exposure multiplier, must be > 0
    #[arg(long, default_value_t = 1.0)]
    exposure: f32,

    /// Tone mapping curve: 0=Reinhard, 1=ACES Narkowicz, 2=ACES Hill,
    /// 3=ACES Day, 4=ACES Full RRT, 5=Hable, 6=Reinhard Extended,
    /// 7=Uchimura
    #[arg(long, default_value_t = 2)]
    tonemap: u32,

    /// Enable verbose logging
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> ExitCode {
    // Malformed arguments print usage and exit 1
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return if e.use_stderr() {
                ExitCode::FAILURE
            } else {
                // --help and --version land here
                ExitCode::SUCCESS
            };
        }
    };

    let level = match cli.verbose {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(format!("kmsnap={level}")))
        .with_target(false)
        .init();

    if unsafe { libc::getuid() } != 0 {
        eprintln!("This program requires root privileges to access DRM devices.");
        eprintln!("Please run with: sudo kmsnap");
        return ExitCode::FAILURE;
    }

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            if let Some(hint) = e
                .downcast_ref::<kmsnap_core::CaptureError>()
                .and_then(|c| c.user_hint())
            {
                eprintln!("\n{hint}");
            }
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    if cli.exposure <= 0.0 {
        anyhow::bail!("exposure must be positive (got {})", cli.exposure);
    }
    let operator = ToneMapOperator::from_mode(cli.tonemap)?;
    let settings = ToneMapSettings {
        exposure: cli.exposure,
        operator,
    };

    let card = DrmCard::open(&cli.device)?;
    card.enable_universal_planes();

    if cli.list {
        return list_planes(&card);
    }

    let fb_id = if cli.fb != 0 {
        cli.fb
    } else {
        let id = capture::find_primary_framebuffer(&card)
            .context("no active framebuffers found; try --list")?;
        info!("Auto-detected primary framebuffer: {id}");
        id
    };

    info!(
        "Tone mapping settings: {} (mode {}), exposure={:.2}",
        settings.operator, settings.operator.mode(), settings.exposure
    );

    let raster = capture::acquire(&card, fb_id, &settings)?;
    write_ppm(&cli.output, &raster)?;
    println!("Screenshot saved to {}", cli.output.display());
    Ok(())
}

fn list_planes(card: &DrmCard) -> anyhow::Result<()> {
    let bindings = capture::list_planes(card)?;
    println!("Found {} planes:", bindings.len());

    for binding in bindings {
        match (&binding.framebuffer, binding.fb_id) {
            (Some(fb), _) => println!(
                "  Plane {}: FB {} ({}x{}, {})",
                binding.plane_id,
                fb.id,
                fb.width,
                fb.height,
                formats::format_name(fb.format)
            ),
            (None, 0) => println!("  Plane {}: (no framebuffer)", binding.plane_id),
            (None, fb_id) => println!("  Plane {}: FB {}", binding.plane_id, fb_id),
        }
    }
    Ok(())
}
