use std::path::PathBuf;

use clap::{AppSettings, Parser};
use log::{debug, info};

use visgrid::{
    cli::{read_args_file, PipelineArgs},
    read::{BinarySpanSource, SpanSource, TextSpanSource},
    run_pipeline,
    write::{ImageOutputType, ImageSink, RawImageWriter},
};

#[derive(Parser)]
#[clap(global_setting(AppSettings::DeriveDisplayOrder))]
#[clap(disable_help_subcommand = true)]
#[clap(infer_long_args = true)]
struct Args {
    /// The spans to be imaged. Binary spans (.bin) or text records (.dat,
    /// .txt).
    data: PathBuf,

    /// Where to write the images. Raw little-endian images (.bin), or FITS
    /// (.fits) if compiled with the "fits" feature.
    #[clap(short, long)]
    output: PathBuf,

    /// A TOML file with pipeline settings. Settings given on the command line
    /// take precedence.
    #[clap(long)]
    args_file: Option<PathBuf>,

    #[clap(flatten)]
    pipeline: PipelineArgs,

    /// The verbosity of the program. Increase by specifying multiple times
    /// (e.g. -vv). The default is to print only high-level information.
    #[clap(short, long, parse(from_occurrences))]
    verbosity: u8,

    /// Disable progress bars.
    #[clap(long)]
    no_progress_bars: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SpanInputType {
    Binary,
    Text,
}

fn main() {
    if let Err(e) = try_main() {
        eprintln!("{e}");
        std::process::exit(1);
    }
}

fn try_main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    setup_logging(args.verbosity);

    let pipeline_args = match &args.args_file {
        Some(f) => args.pipeline.merge(read_args_file(f)?),
        None => args.pipeline,
    };
    debug!("{pipeline_args:#?}");
    let config = pipeline_args.parse()?;

    let input_type = match args.data.extension().and_then(|os_str| os_str.to_str()) {
        Some("bin") => SpanInputType::Binary,
        Some("dat" | "txt") => SpanInputType::Text,
        _ => {
            return Err(format!(
                "Don't know how to read '{}'; expected a .bin, .dat or .txt file",
                args.data.display()
            )
            .into())
        }
    };
    info!("Input type: {input_type:?}");

    let output_type = match args.output.extension().and_then(|os_str| os_str.to_str()) {
        Some("bin") => ImageOutputType::Raw,
        #[cfg(feature = "fits")]
        Some("fits") => ImageOutputType::Fits,
        _ => {
            return Err(format!(
                "Don't know how to write '{}'; expected a .bin file{}",
                args.output.display(),
                if cfg!(feature = "fits") {
                    " or a .fits file"
                } else {
                    ""
                }
            )
            .into())
        }
    };
    info!("Output type: {output_type:?}");

    let mut source: Box<dyn SpanSource> = match input_type {
        SpanInputType::Binary => Box::new(BinarySpanSource::from_file(&args.data, config.n_stands)?),
        SpanInputType::Text => Box::new(TextSpanSource::from_file(&args.data, config.n_stands)?),
    };
    let mut sink: Box<dyn ImageSink> = match output_type {
        ImageOutputType::Raw => Box::new(RawImageWriter::create(&args.output, config.fft_size)?),
        #[cfg(feature = "fits")]
        ImageOutputType::Fits => Box::new(visgrid::write::FitsImageWriter::create(
            &args.output,
            config.fft_size,
        )?),
    };

    let summary = run_pipeline(
        &config,
        source.as_mut(),
        sink.as_mut(),
        !args.no_progress_bars,
    )?;
    for failure in &summary.failures {
        info!("Skipped: {failure}");
    }
    info!(
        "Wrote {} images to {}",
        summary.images_written,
        args.output.display()
    );

    Ok(())
}

fn setup_logging(verbosity: u8) {
    let mut builder = env_logger::Builder::from_default_env();
    builder.target(env_logger::Target::Stdout);
    builder.format_target(false);
    match verbosity {
        0 => builder.filter_level(log::LevelFilter::Info),
        1 => builder.filter_level(log::LevelFilter::Debug),
        2 => builder.filter_level(log::LevelFilter::Trace),
        _ => {
            builder.filter_level(log::LevelFilter::Trace);
            builder.format(|buf, record| {
                use std::io::Write;

                let timestamp = buf.timestamp();
                let level = record.level();
                let target = record.target();
                let line = record.line().unwrap_or(0);
                let message = record.args();

                writeln!(buf, "[{timestamp} {level} {target}:{line}] {message}")
            })
        }
    };
    builder.init();
}
