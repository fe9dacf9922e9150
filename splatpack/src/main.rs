use clap::{Parser, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use serde_json::json;
use splatpack_lib::{pack_splats, read_ply, InputSplat, PackParams, QualityPreset, SplatAsset};
use std::error::Error;
use std::fs;
use std::path::Path;
use std::process;
use std::time::Instant;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Preset {
    VeryLow,
    Low,
    Medium,
    High,
    VeryHigh,
}

impl From<Preset> for QualityPreset {
    fn from(p: Preset) -> Self {
        match p {
            Preset::VeryLow => QualityPreset::VeryLow,
            Preset::Low => QualityPreset::Low,
            Preset::Medium => QualityPreset::Medium,
            Preset::High => QualityPreset::High,
            Preset::VeryHigh => QualityPreset::VeryHigh,
        }
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "Splat Packer",
    version = "1.0",
    about = "Packs Gaussian splat PLY files into GPU-ready asset buffers"
)]
struct Cli {
    #[arg(
        short = 'i',
        long = "input",
        value_name = "INPUT",
        required = true,
        help = "Path to the input PLY file."
    )]
    input: String,

    #[arg(
        short = 'o',
        long = "output",
        value_name = "OUTPUT_DIR",
        required = true,
        help = "Directory to write the asset buffers into."
    )]
    output: String,

    #[arg(
        short = 'q',
        long = "quality",
        value_name = "PRESET",
        default_value = "medium",
        help = "Quality preset controlling the per-attribute formats."
    )]
    quality: Preset,

    #[arg(
        short = 's',
        long = "seed",
        value_name = "SEED",
        default_value = "42",
        help = "Seed for the SH clustering sampler."
    )]
    seed: u32,

    #[arg(
        short = 'p',
        long = "passes",
        value_name = "PASSES",
        help = "Passes over the data for SH cluster refinement (default depends on the preset)."
    )]
    passes: Option<f32>,
}

fn write_buffers(dir: &Path, asset: &SplatAsset) -> std::io::Result<()> {
    fs::create_dir_all(dir)?;
    fs::write(dir.join("chunks.bin"), &asset.chunk_data)?;
    fs::write(dir.join("positions.bin"), &asset.pos_data)?;
    fs::write(dir.join("other.bin"), &asset.other_data)?;
    fs::write(dir.join("color.bin"), &asset.color_data)?;
    fs::write(dir.join("sh.bin"), &asset.sh_data)?;

    let manifest = json!({
        "version": splatpack_lib::FORMAT_VERSION,
        "splat_count": asset.splat_count,
        "pos_format": format!("{:?}", asset.pos_format),
        "scale_format": format!("{:?}", asset.scale_format),
        "color_format": format!("{:?}", asset.color_format),
        "sh_format": format!("{:?}", asset.sh_format),
        "color_width": asset.color_width,
        "color_height": asset.color_height,
        "data_hash": format!("{:032x}", asset.data_hash),
    });
    fs::write(dir.join("manifest.json"), serde_json::to_vec_pretty(&manifest)?)
}

fn main() -> Result<(), Box<dyn Error + Send + Sync>> {
    let cli = Cli::parse();

    let raw_data = fs::read(&cli.input).unwrap_or_else(|e| {
        eprintln!("Error reading input file {}: {}", cli.input, e);
        process::exit(1);
    });

    println!(
        "Input: {} | Output: {} | Quality: {:?}",
        cli.input, cli.output, cli.quality
    );

    let start = Instant::now();
    let splats = read_ply(&raw_data)?;
    println!(
        "Parsed {} splats in {} ms",
        splats.len(),
        start.elapsed().as_millis()
    );
    let raw_size = splats.len() * std::mem::size_of::<InputSplat>();

    let mut params = PackParams::from_preset(cli.quality.into());
    params.seed = cli.seed;
    params.cluster_passes = cli.passes;

    let bar = ProgressBar::new(1000);
    bar.set_style(ProgressStyle::with_template(
        "{bar:40.cyan/blue} {percent}% {msg}",
    )?);
    bar.set_message("clustering");
    let mut on_progress = |f: f32| {
        bar.set_position((f * 1000.0) as u64);
        true
    };

    let pack_start = Instant::now();
    let asset = pack_splats(splats, &params, None, Some(&mut on_progress))?;
    bar.finish_and_clear();
    println!("Packing Time: {} ms", pack_start.elapsed().as_millis());

    let packed = asset.total_size();
    println!(
        "Packed size: {} bytes ({:.2}x smaller than {} bytes raw)",
        packed,
        raw_size as f64 / packed.max(1) as f64,
        raw_size
    );

    write_buffers(Path::new(&cli.output), &asset).unwrap_or_else(|e| {
        eprintln!("Error writing output '{}': {}", cli.output, e);
        process::exit(1);
    });
    println!("Successfully wrote asset to '{}'.", cli.output);

    Ok(())
}
