use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand, ValueEnum};
use gmp_hwcodec::config::{DeviceProfile, Settings};
use gmp_hwcodec::hal::loopback::{LoopbackConfig, LoopbackService};
use gmp_hwcodec::hal::profile::ProfileService;
use gmp_hwcodec::hal::{CodecService, ColorFormatConstants};
use gmp_hwcodec::host::HeapAllocator;
use gmp_hwcodec::observability::configure_tracing;
use gmp_hwcodec::probe::CapabilityDescriptor;
use gmp_hwcodec::video::convert::{FrameGeometry, PixelConverter, SoftwareLayout};
use gmp_hwcodec::video::reframe::{annex_b_to_length_prefixed, length_prefixed_to_annex_b};
use gmp_hwcodec::video::{BufferFraming, CropRect, PlanarFrame, RawFrame};
use serde_json::{json, to_writer_pretty};
use tracing::{info, warn};

fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = Settings::resolve(cli.config.as_deref())?;
    configure_tracing(&settings)?;

    match cli.command {
        Commands::Probe {
            profile,
            output,
            json,
        } => probe_command(&settings, profile, output, json),
        Commands::Reframe {
            direction,
            framing,
            input,
            output,
        } => reframe_command(direction, framing, &input, &output),
        Commands::Convert(args) => convert_command(args),
    }
}

fn probe_command(
    settings: &Settings,
    profile: Option<PathBuf>,
    output: Option<PathBuf>,
    json: bool,
) -> Result<()> {
    let service: Arc<dyn CodecService> = match profile.or_else(|| settings.device_profile.clone()) {
        Some(path) => {
            let profile = DeviceProfile::load(&path)?;
            info!(
                profile = profile.name.as_deref().unwrap_or("unnamed"),
                path = %path.display(),
                "Loaded device profile"
            );
            Arc::new(ProfileService::new(profile))
        }
        None => {
            warn!("No device profile given; probing the loopback service");
            Arc::new(LoopbackService::new(LoopbackConfig::default()))
        }
    };

    service
        .init()
        .map_err(|err| anyhow!("Failed to initialise codec service: {err}"))?;
    let descriptor = CapabilityDescriptor::probe(service.as_ref(), settings.descriptor.clone());
    service.deinit();

    if let Some(path) = output {
        descriptor.write_to(&path)?;
        info!(path = %path.display(), "Descriptor written");
    } else if json {
        to_writer_pretty(std::io::stdout(), &descriptor)?;
        println!();
    } else {
        print!("{}", descriptor.render());
    }
    Ok(())
}

fn reframe_command(
    direction: Direction,
    framing: FramingArg,
    input: &Path,
    output: &Path,
) -> Result<()> {
    let mut data =
        fs::read(input).with_context(|| format!("Failed to read input: {}", input.display()))?;

    let summary = match direction {
        Direction::ToAnnexB => {
            let report = length_prefixed_to_annex_b(&mut data, framing.into());
            json!({
                "direction": "to-annex-b",
                "units": report.units,
                "stop": format!("{:?}", report.stop),
                "bytes": data.len(),
            })
        }
        Direction::ToLength => {
            let units = annex_b_to_length_prefixed(&mut data);
            json!({
                "direction": "to-length",
                "units": units,
                "bytes": data.len(),
            })
        }
    };

    fs::write(output, &data)
        .with_context(|| format!("Failed to write output: {}", output.display()))?;
    to_writer_pretty(std::io::stdout(), &summary)?;
    println!();
    Ok(())
}

fn convert_command(args: ConvertArgs) -> Result<()> {
    let data = fs::read(&args.input)
        .with_context(|| format!("Failed to read input: {}", args.input.display()))?;
    let layout = SoftwareLayout::from(args.layout);
    let constants = ColorFormatConstants::default();
    let stride = args.stride.unwrap_or(args.width);
    let slice_height = args.slice_height.unwrap_or(args.height);
    if args.crop_left.checked_add(args.width).is_none()
        || args.crop_top.checked_add(args.height).is_none()
    {
        return Err(anyhow!(
            "crop origin {}x{} plus frame size {}x{} overflows",
            args.crop_left,
            args.crop_top,
            args.width,
            args.height
        ));
    }

    let frame = RawFrame {
        data,
        timestamp_ns: 0,
        stride,
        slice_height,
        crop: CropRect::new(args.crop_left, args.crop_top, args.width, args.height),
        color_format: layout.color_format(&constants),
    };
    let mut converter = PixelConverter::with_layout(layout, FrameGeometry::from_raw(&frame));
    let geometry = *converter.geometry();
    let planar = converter
        .convert(&HeapAllocator, &frame)
        .with_context(|| format!("Failed to convert {}", args.input.display()))?;

    let i420 = pack_planes(&planar)?;
    fs::write(&args.output, &i420)
        .with_context(|| format!("Failed to write output: {}", args.output.display()))?;

    let summary = json!({
        "converter": converter.name(),
        "geometry": geometry,
        "bytes": i420.len(),
    });
    to_writer_pretty(std::io::stdout(), &summary)?;
    println!();
    Ok(())
}

/// Tightly packed I420: cropped rows only, no stride padding.
fn pack_planes(frame: &PlanarFrame) -> Result<Vec<u8>> {
    let width = frame.width as usize;
    let height = frame.height as usize;
    let mut out = Vec::with_capacity(width * height * 3 / 2);
    let planes = [
        (&frame.y, width, height),
        (&frame.u, width / 2, height / 2),
        (&frame.v, width / 2, height / 2),
    ];
    for (plane, row_len, rows) in planes {
        for row in 0..rows {
            let start = row * plane.stride as usize;
            let line = plane
                .data
                .get(start..start + row_len)
                .ok_or_else(|| anyhow!("Plane row {row} is out of bounds"))?;
            out.extend_from_slice(line);
        }
    }
    Ok(out)
}

#[derive(Parser)]
#[command(
    name = "gmp-hwcodec",
    version,
    about = "Hardware codec plugin tooling: capability probe, NAL reframing and frame conversion"
)]
struct Cli {
    /// Settings YAML (falls back to GMP_HWCODEC_CONFIG).
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the capability descriptor for a device.
    Probe {
        #[arg(long)]
        profile: Option<PathBuf>,
        #[arg(long)]
        output: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// Rewrite H.264 NAL framing in a file.
    Reframe {
        #[arg(long, value_enum)]
        direction: Direction,
        #[arg(long, value_enum, default_value_t = FramingArg::Length32)]
        framing: FramingArg,
        input: PathBuf,
        output: PathBuf,
    },
    /// Convert one raw hardware frame to packed I420.
    Convert(ConvertArgs),
}

#[derive(clap::Args)]
struct ConvertArgs {
    #[arg(long, value_enum)]
    layout: LayoutArg,
    #[arg(long)]
    width: u32,
    #[arg(long)]
    height: u32,
    #[arg(long)]
    stride: Option<u32>,
    #[arg(long = "slice-height")]
    slice_height: Option<u32>,
    #[arg(long = "crop-left", default_value_t = 0)]
    crop_left: u32,
    #[arg(long = "crop-top", default_value_t = 0)]
    crop_top: u32,
    input: PathBuf,
    output: PathBuf,
}

#[derive(Clone, Copy, ValueEnum)]
enum Direction {
    ToAnnexB,
    ToLength,
}

#[derive(Clone, Copy, ValueEnum)]
enum FramingArg {
    Length8,
    Length16,
    Length32,
}

impl From<FramingArg> for BufferFraming {
    fn from(value: FramingArg) -> Self {
        match value {
            FramingArg::Length8 => BufferFraming::Length8,
            FramingArg::Length16 => BufferFraming::Length16,
            FramingArg::Length32 => BufferFraming::Length32,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum LayoutArg {
    Planar,
    SemiPlanar,
    #[value(name = "packed-semi-planar-32m")]
    PackedSemiPlanar32m,
}

impl From<LayoutArg> for SoftwareLayout {
    fn from(value: LayoutArg) -> Self {
        match value {
            LayoutArg::Planar => SoftwareLayout::Planar,
            LayoutArg::SemiPlanar => SoftwareLayout::SemiPlanar,
            LayoutArg::PackedSemiPlanar32m => SoftwareLayout::PackedSemiPlanar32m,
        }
    }
}
