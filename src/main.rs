//! voxcache demo
//!
//! Builds one image, fills it through the cache's write path and reads it
//! back at every tier, printing change events and a metrics snapshot.
//!
//! ```text
//! ┌──────────────┐   set(slice)   ┌──────────────┐   get(volume)   ┌─────────────┐
//! │   Writer     │──────────────▶│    Image     │◀────────────────│   Reader    │
//! └──────────────┘                │  slice/vol/  │                 └─────────────┘
//!                                 │   channel    │  update()       ┌─────────────┐
//!                                 │    tiers     │────────────────▶│  Producer   │
//!                                 └──────────────┘                 └─────────────┘
//! ```

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use voxcache::cache::channel_observer;
use voxcache::{
    CacheConfig, Coord, Image, ImageRegistry, ImportBuffer, PixelType, Producer, SliceBacking,
    UpdateFlag,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// voxcache - hierarchical lazy voxel-buffer cache demo
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Pixels along x
    #[arg(long, env = "VOXCACHE_WIDTH", default_value = "64")]
    width: usize,

    /// Pixels along y
    #[arg(long, env = "VOXCACHE_HEIGHT", default_value = "64")]
    height: usize,

    /// Slices per volume
    #[arg(long, env = "VOXCACHE_SLICES", default_value = "8")]
    slices: usize,

    /// Volumes per channel
    #[arg(long, env = "VOXCACHE_TIME_STEPS", default_value = "2")]
    time_steps: usize,

    /// Number of channels
    #[arg(long, env = "VOXCACHE_CHANNELS", default_value = "2")]
    channels: usize,

    /// Pixel type (u8, i16, f32, rgb<u8>, ...)
    #[arg(long, env = "VOXCACHE_PIXEL_TYPE", default_value = "u8")]
    pixel_type: String,

    /// Attach a synthetic producer that fills channels on demand
    #[arg(long, env = "VOXCACHE_PRODUCER")]
    producer: bool,

    /// Slice memory placement (independent, volume)
    #[arg(long, env = "VOXCACHE_SLICE_BACKING", default_value = "independent")]
    slice_backing: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

// =============================================================================
// Synthetic Producer
// =============================================================================

/// Fills the requested channel with a byte ramp
struct GradientProducer {
    flag: UpdateFlag,
}

impl Producer for GradientProducer {
    fn is_updating(&self) -> bool {
        self.flag.is_set()
    }

    fn update(&self, image: &Image) -> voxcache::Result<()> {
        let _guard = self.flag.raise();

        let Some(region) = image.requested_region() else {
            return Ok(());
        };
        let channel = Coord::channel(region.origin[4]);
        let Some(len) = image.unit_bytes(channel) else {
            return Ok(());
        };

        let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        image.import_set(channel, ImportBuffer::Adopt(data))?;
        Ok(())
    }
}

// =============================================================================
// Main
// =============================================================================

fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    init_logging(&args);

    info!("Starting voxcache demo");
    info!(
        "  Extents: {}x{}x{}, {} time steps, {} channels",
        args.width, args.height, args.slices, args.time_steps, args.channels
    );
    info!("  Pixel type: {}", args.pixel_type);
    info!("  Slice backing: {}", args.slice_backing);

    let pixel_type: PixelType = args.pixel_type.parse()?;
    let slice_backing: SliceBacking = args
        .slice_backing
        .parse()
        .map_err(anyhow::Error::msg)?;

    let registry = ImageRegistry::new();
    let image = Arc::new(Image::with_config(CacheConfig {
        slice_backing,
        ..CacheConfig::default()
    }));
    image.initialize_with(
        &[args.width, args.height, args.slices, args.time_steps],
        pixel_type,
        args.channels,
    )?;
    let id = registry.register(&image);
    info!(image = %id, "Image registered");

    if args.producer {
        image.set_producer(Some(Arc::new(GradientProducer {
            flag: UpdateFlag::new(),
        })));
    }

    let (observer, events) = channel_observer();
    image.subscribe(observer);

    // Channel 0 written slice by slice; volumes consolidate on first read
    for t in 0..args.time_steps {
        for s in 0..args.slices {
            let coord = Coord::slice(s, t, 0);
            let len = image.unit_bytes(coord).context("slice outside image")?;
            image.set(coord, &vec![(s + t * args.slices) as u8; len])?;
        }
    }

    let volume = image
        .get(Coord::volume(0, 0))?
        .context("volume outside image")?;
    info!(
        bytes = volume.len(),
        channel_ready = image.is_set(Coord::channel(0)),
        "Read consolidated volume"
    );

    if args.channels > 1 {
        let slice = image
            .get(Coord::slice(0, 0, 1))?
            .context("slice outside image")?;
        info!(
            bytes = slice.len(),
            view = slice.is_view(),
            first = slice.read().first().copied().unwrap_or_default(),
            "Read channel 1"
        );
    }

    // Overwrite emits exactly one change event
    let coord = Coord::slice(0, 0, 0);
    let len = image.unit_bytes(coord).context("slice outside image")?;
    image.set(coord, &vec![0xFF; len])?;
    for event in events.try_iter() {
        println!("{}", serde_json::to_string(&event)?);
    }

    println!("{}", serde_json::to_string_pretty(&image.metrics())?);

    info!("Demo complete");
    Ok(())
}

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}
