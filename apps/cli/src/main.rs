use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use tracing::{error, info};

use ccdscan_core::{
    ColorMode, DeviceProfile, OutputFormat, PaperSource, ScanArea, ScanRequest, Scanner,
    ScannerTransport, SessionConfig, SimulatedScanner, TracingObserver, builtin_profiles,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Canon PIXMA / CanoScan scanner tool (Pure Rust)", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Scan one page to a PNM file
    Scan(ScanArgs),
    /// Query the device status and optionally wait for a button press
    Status {
        #[command(flatten)]
        device: DeviceArgs,
        /// Seconds to wait for device events
        #[arg(long, default_value_t = 0)]
        wait: u64,
    },
    /// List the built-in models
    Models,
    /// Print or save the default session configuration
    Config {
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Print or save a built-in model profile for editing
    Profile {
        model: String,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(Args, Debug)]
struct DeviceArgs {
    /// Model name or USB product id
    #[arg(short, long, default_value = "MP810")]
    model: String,

    /// Model profile TOML, overrides --model
    #[arg(long)]
    profile: Option<PathBuf>,

    /// Session configuration TOML
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Talk to a simulated device instead of USB
    #[arg(long)]
    simulate: bool,
}

#[derive(Args, Debug)]
struct ScanArgs {
    #[command(flatten)]
    device: DeviceArgs,

    /// Resolution in dpi
    #[arg(short, long, default_value_t = 75)]
    resolution: u32,

    /// color, color48, gray, gray16, lineart or infrared
    #[arg(long, default_value = "color")]
    mode: ColorMode,

    /// flatbed, adf, adf-duplex or tpu
    #[arg(long, default_value = "flatbed")]
    source: PaperSource,

    /// Left edge in pixels
    #[arg(short, default_value_t = 0)]
    x: u32,

    /// Top edge in pixels
    #[arg(short, default_value_t = 0)]
    y: u32,

    /// Width in pixels, full bed when omitted
    #[arg(long)]
    width: Option<u32>,

    /// Height in pixels, full bed when omitted
    #[arg(long)]
    height: Option<u32>,

    /// Tone curve exponent
    #[arg(long)]
    gamma: Option<f64>,

    /// Lineart threshold
    #[arg(long)]
    threshold: Option<u8>,

    /// Output file (PNM)
    #[arg(short, long, default_value = "scan.pnm")]
    output: PathBuf,
}

fn main() {
    let cli = Cli::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if cli.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    if let Err(e) = run(cli.command) {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run(command: Commands) -> Result<()> {
    match command {
        Commands::Scan(args) => scan(args),
        Commands::Status { device, wait } => status(device, wait),
        Commands::Models => {
            for p in builtin_profiles() {
                println!(
                    "{:<6} {:04X}:{:04X}  {:<24} {:?}{}{}",
                    p.model,
                    p.vendor_id,
                    p.product_id,
                    p.name,
                    p.sensor,
                    if p.capabilities.adf { " adf" } else { "" },
                    if p.capabilities.tpu { " tpu" } else { "" },
                );
            }
            Ok(())
        }
        Commands::Config { output } => match output {
            Some(path) => SessionConfig::default().save_to_file(&path),
            None => {
                print!("{}", toml::to_string_pretty(&SessionConfig::default())?);
                Ok(())
            }
        },
        Commands::Profile { model, output } => {
            let profile = DeviceProfile::find(&model).with_context(|| format!("unknown model '{model}'"))?;
            match output {
                Some(path) => profile.save_to_file(&path),
                None => {
                    print!("{}", toml::to_string_pretty(&profile)?);
                    Ok(())
                }
            }
        }
    }
}

fn load(device: &DeviceArgs) -> Result<(DeviceProfile, SessionConfig)> {
    let profile = match &device.profile {
        Some(path) => DeviceProfile::load_from_file(path)?,
        None => DeviceProfile::find(&device.model)
            .with_context(|| format!("unknown model '{}', see `ccdscan models`", device.model))?,
    };
    let mut config = match &device.config {
        Some(path) => SessionConfig::load_from_file(path)?,
        None => SessionConfig::default(),
    };
    if device.simulate {
        config = config.without_delays();
    }
    Ok((profile, config))
}

fn scan(args: ScanArgs) -> Result<()> {
    let (profile, config) = load(&args.device)?;
    let request = build_request(&args, &profile);
    if args.device.simulate {
        info!(model = %profile.model, "Using simulated device");
        let sim = SimulatedScanner::new(&profile);
        scan_with(Scanner::open(sim, profile, config)?, &request, &args.output)
    } else {
        let scanner = Scanner::open_usb(profile, config, Arc::new(TracingObserver))?;
        scan_with(scanner, &request, &args.output)
    }
}

fn build_request(args: &ScanArgs, profile: &DeviceProfile) -> ScanRequest {
    // Profile sizes are in 1/75 inch.
    let full_w = profile.width * args.resolution / 75;
    let full_h = profile.height * args.resolution / 75;
    let area = ScanArea::new(
        args.x,
        args.y,
        args.width.unwrap_or(full_w.saturating_sub(args.x)),
        args.height.unwrap_or(full_h.saturating_sub(args.y)),
    );
    let mut request = ScanRequest::new(args.resolution, area, args.mode, args.source);
    request.gamma = args.gamma;
    if let Some(threshold) = args.threshold {
        request.lineart.threshold = threshold;
    }
    request
}

fn scan_with<T: ScannerTransport>(mut scanner: Scanner<T>, request: &ScanRequest, output: &Path) -> Result<()> {
    let geometry = scanner.configure(request)?;
    let format = scanner.output_format().context("scan not configured")?;

    let file = File::create(output).with_context(|| format!("creating {}", output.display()))?;
    let mut out = BufWriter::new(file);
    write_pnm_header(&mut out, &format, geometry.width, geometry.height)?;

    scanner.start()?;
    let mut lines = 0u32;
    for line in scanner.lines() {
        write_pnm_line(&mut out, &format, &line?)?;
        lines += 1;
    }
    out.flush()?;
    scanner.close()?;

    if lines != geometry.height {
        bail!("expected {} lines, got {}", geometry.height, lines);
    }
    info!(
        path = %output.display(),
        width = geometry.width,
        height = geometry.height,
        dpi = geometry.xdpi,
        "Scan saved"
    );
    Ok(())
}

fn write_pnm_header(out: &mut impl Write, format: &OutputFormat, width: u32, height: u32) -> Result<()> {
    match (format.channels, format.depth) {
        (1, 1) => write!(out, "P4\n{width} {height}\n")?,
        (1, depth) => write!(out, "P5\n{width} {height}\n{}\n", max_value(depth))?,
        (_, depth) => write!(out, "P6\n{width} {height}\n{}\n", max_value(depth))?,
    }
    Ok(())
}

fn max_value(depth: u8) -> u32 {
    if depth == 16 { 65535 } else { 255 }
}

/// PNM wants 16-bit samples big-endian; the device delivers them
/// little-endian.
fn write_pnm_line(out: &mut impl Write, format: &OutputFormat, line: &[u8]) -> Result<()> {
    if format.depth == 16 {
        let swapped: Vec<u8> = line.chunks_exact(2).flat_map(|s| [s[1], s[0]]).collect();
        out.write_all(&swapped)?;
    } else {
        out.write_all(line)?;
    }
    Ok(())
}

fn status(device: DeviceArgs, wait: u64) -> Result<()> {
    let (profile, config) = load(&device)?;
    if device.simulate {
        let sim = SimulatedScanner::new(&profile);
        report_status(Scanner::open(sim, profile, config)?, wait)
    } else {
        report_status(Scanner::open_usb(profile, config, Arc::new(TracingObserver))?, wait)
    }
}

fn report_status<T: ScannerTransport>(mut scanner: Scanner<T>, wait: u64) -> Result<()> {
    let status = scanner.status()?;
    println!("Model:       {}", scanner.profile().model);
    println!("Paper:       {}", if status.paper_present { "present" } else { "none" });
    println!("Calibrated:  {}", status.calibrated);
    if let Some(lamp) = status.lamp_on {
        println!("Lamp:        {}", if lamp { "on" } else { "off" });
    }
    if status.jammed {
        println!("Paper jam");
    }
    if status.cover_open {
        println!("Cover open");
    }

    if wait > 0 {
        info!(seconds = wait, "Waiting for device events");
        let deadline = std::time::Instant::now() + Duration::from_secs(wait);
        while std::time::Instant::now() < deadline {
            if let Some(event) = scanner.wait_event(Duration::from_millis(500))? {
                println!("Event:       {event}");
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pnm_headers() {
        let mut buf = Vec::new();
        let format = OutputFormat {
            channels: 3,
            depth: 8,
            bytes_per_line: 30,
        };
        write_pnm_header(&mut buf, &format, 10, 4).unwrap();
        assert_eq!(buf, b"P6\n10 4\n255\n");

        let mut buf = Vec::new();
        let format = OutputFormat {
            channels: 1,
            depth: 1,
            bytes_per_line: 2,
        };
        write_pnm_header(&mut buf, &format, 16, 4).unwrap();
        assert_eq!(buf, b"P4\n16 4\n");
    }

    #[test]
    fn test_wide_samples_swapped() {
        let mut buf = Vec::new();
        let format = OutputFormat {
            channels: 1,
            depth: 16,
            bytes_per_line: 4,
        };
        write_pnm_line(&mut buf, &format, &[0x34, 0x12, 0x78, 0x56]).unwrap();
        assert_eq!(buf, vec![0x12, 0x34, 0x56, 0x78]);
    }

    #[test]
    fn test_simulated_scan_writes_file() {
        let dir = std::env::temp_dir().join(format!("ccdscan-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("scan.pnm");

        let profile = DeviceProfile::find("MP150").unwrap();
        let sim = SimulatedScanner::new(&profile);
        let scanner = Scanner::open(sim, profile, SessionConfig::default().without_delays()).unwrap();
        let request = ScanRequest::new(75, ScanArea::new(0, 0, 16, 16), ColorMode::Gray, PaperSource::Flatbed);
        scan_with(scanner, &request, &path).unwrap();

        let data = std::fs::read(&path).unwrap();
        let header = b"P5\n16 16\n255\n";
        assert!(data.starts_with(header));
        assert_eq!(data.len(), header.len() + 16 * 16);
        std::fs::remove_dir_all(&dir).ok();
    }
}
