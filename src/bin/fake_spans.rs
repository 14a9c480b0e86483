//! Write synthetic spans of point-source visibilities.

use std::{
    fs::File,
    io::{BufWriter, Write},
    path::PathBuf,
};

use clap::{AppSettings, Parser};
use log::{debug, info};
use rand::{rngs::StdRng, SeedableRng};

use visgrid::{
    constants::{DEFAULT_FFT_SIZE, DEFAULT_N_STANDS, MAX_N_STANDS},
    encode_span,
    simulate::{PointSource, SimulatedArray},
    ConfigurationError,
};

#[derive(Parser)]
#[clap(global_setting(AppSettings::DeriveDisplayOrder))]
#[clap(disable_help_subcommand = true)]
#[clap(infer_long_args = true)]
struct Args {
    /// Where to write the spans. Binary spans (.bin) or text records (.dat,
    /// .txt).
    output: PathBuf,

    /// The total number of antennas in the array.
    #[clap(short, long, default_value_t = DEFAULT_N_STANDS)]
    n_stands: usize,

    /// The side length of the grid the spans are meant for [pixels].
    #[clap(short, long, default_value_t = DEFAULT_FFT_SIZE)]
    fft_size: usize,

    /// The number of spans to write.
    #[clap(long, default_value_t = 10)]
    num_spans: usize,

    /// Point sources as "l,m,flux", with (l, m) the offset from the image
    /// centre [pixels]. The default is a single source at the centre.
    #[clap(short, long, multiple_values(true), parse(try_from_str = parse_source))]
    sources: Vec<PointSource>,

    /// How far the array rotates between spans [degrees].
    #[clap(long, default_value_t = 1.0)]
    rotation: f64,

    /// The random seed for antenna positions.
    #[clap(long)]
    seed: Option<u64>,

    /// The verbosity of the program. Increase by specifying multiple times
    /// (e.g. -vv).
    #[clap(short, long, parse(from_occurrences))]
    verbosity: u8,
}

fn parse_source(s: &str) -> Result<PointSource, String> {
    let parts: Vec<&str> = s.split(',').map(|p| p.trim()).collect();
    match parts.as_slice() {
        [l, m, flux] => {
            let parse = |p: &str| {
                p.parse::<f64>()
                    .map_err(|e| format!("couldn't parse '{p}' in source '{s}': {e}"))
            };
            Ok(PointSource {
                l: parse(*l)?,
                m: parse(*m)?,
                flux: parse(*flux)?,
            })
        }
        _ => Err(format!("expected a source as 'l,m,flux', got '{s}'")),
    }
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

    if args.n_stands == 0 || args.n_stands > MAX_N_STANDS {
        return Err(ConfigurationError::BadNStands {
            n_stands: args.n_stands,
            max: MAX_N_STANDS,
        }
        .into());
    }
    if args.fft_size == 0 {
        return Err(ConfigurationError::FftSizeZero(args.fft_size).into());
    }
    if args.fft_size % 2 != 0 {
        return Err(ConfigurationError::FftSizeOdd(args.fft_size).into());
    }

    let text = match args.output.extension().and_then(|os_str| os_str.to_str()) {
        Some("bin") => false,
        Some("dat" | "txt") => true,
        _ => {
            return Err(format!(
                "Don't know how to write '{}'; expected a .bin, .dat or .txt file",
                args.output.display()
            )
            .into())
        }
    };

    let sources = if args.sources.is_empty() {
        vec![PointSource {
            l: 0.0,
            m: 0.0,
            flux: 1.0,
        }]
    } else {
        args.sources
    };
    let seed = args.seed.unwrap_or_else(rand::random);
    info!("Using seed {seed}");
    let mut rng = StdRng::seed_from_u64(seed);
    let array = SimulatedArray::new(&mut rng, args.n_stands, args.fft_size);
    debug!("Antenna positions: {:?}", array.positions());

    let mut out = BufWriter::new(File::create(&args.output)?);
    if text {
        writeln!(out, "# id stand1 stand2 u v re im")?;
    }
    for i_span in 0..args.num_spans {
        let span = array
            .rotated(i_span as f64 * args.rotation.to_radians())
            .point_source_span(&sources);
        if text {
            for (i_record, r) in span.records().iter().enumerate() {
                writeln!(
                    out,
                    "{i_record} {} {} {} {} {} {}",
                    r.antenna1, r.antenna2, r.u, r.v, r.vis.re, r.vis.im
                )?;
            }
        } else {
            out.write_all(&encode_span(&span))?;
        }
        debug!("Wrote span {i_span}");
    }
    out.flush()?;

    info!(
        "Wrote {} spans of {} antennas to {}",
        args.num_spans,
        args.n_stands,
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
        _ => builder.filter_level(log::LevelFilter::Trace),
    };
    builder.init();
}
