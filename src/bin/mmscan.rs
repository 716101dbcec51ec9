use mmscan::{
    archive::{AlertArchive, AmpelArchive},
    catalog::AmpelCatalogMatcher,
    conf::{load_dotenv, AppConfig, ConfigurationError, MmscanConfigError},
    coverage::{CoverageError, CsvObservationLog, ObservationLog},
    event::{CircleEvent, ErrorBox, Event, EventError, GravitationalWave, Neutrino, NoticeType},
    report::DirectoryReport,
    scanner::{ScanError, ScanOrchestrator},
    utils::{
        o11y::logging::{build_subscriber, log_error, ERROR},
        spatial::{iso_to_jd, TimeParseError},
    },
};

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, info_span, instrument, warn, Instrument};

#[derive(thiserror::Error, Debug)]
enum CliError {
    #[error("could not load configuration")]
    Config(#[from] MmscanConfigError),
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error("could not build the event")]
    Event(#[from] EventError),
    #[error("scan failed")]
    Scan(#[from] ScanError),
    #[error("could not read observations")]
    Coverage(#[from] CoverageError),
    #[error(transparent)]
    Time(#[from] TimeParseError),
}

#[derive(Parser)]
#[command(about = "Search an optical alert archive for counterparts of a multi-messenger event")]
struct Cli {
    /// Path to the configuration file
    #[arg(long, value_name = "FILE", env = "MMSCAN_CONFIG")]
    config: Option<String>,

    /// Directory the report is written to
    #[arg(long, value_name = "DIR", default_value = "mmscan-report")]
    output: PathBuf,

    /// End of the search window (ISO-8601 UTC), defaults to the configured
    /// window after the event
    #[arg(long)]
    t_max: Option<String>,

    /// HEALPix nside of the search cones
    #[arg(long)]
    cone_nside: Option<u32>,

    /// Skip history look-ups and the merge
    #[arg(long)]
    fast_query: bool,

    /// Scan at most this many cones
    #[arg(long)]
    max_cones: Option<usize>,

    /// CSV log of survey pointings for the coverage estimate
    #[arg(long, value_name = "FILE")]
    observations: Option<PathBuf>,

    /// Download the cutouts of every candidate
    #[arg(long)]
    with_cutouts: bool,

    /// Add these objects to the candidates without filtering
    #[arg(long = "add", value_name = "OBJECT_ID")]
    add: Vec<String>,

    /// Log the outcome of every filter stage for these objects
    #[arg(long = "check", value_name = "OBJECT_ID")]
    check: Vec<String>,

    /// Hide the progress bar
    #[arg(long)]
    quiet: bool,

    #[command(subcommand)]
    event: EventArgs,
}

#[derive(Subcommand)]
enum EventArgs {
    /// Gravitational-wave trigger with a HEALPix sky map
    Gw {
        /// Sky map FITS file, optionally gzipped
        skymap: PathBuf,
        /// Event name, defaults to the map's OBJECT keyword
        #[arg(long)]
        name: Option<String>,
        #[arg(long, default_value = "initial")]
        notice: NoticeType,
        /// Cumulative probability of the credible region
        #[arg(long)]
        prob_threshold: Option<f64>,
    },
    /// Neutrino alert with a rectangular error box
    Neutrino {
        name: String,
        /// Arrival time (ISO-8601 UTC)
        #[arg(long)]
        time: String,
        #[arg(long)]
        ra: f64,
        #[arg(long, allow_negative_numbers = true)]
        dec: f64,
        #[arg(long)]
        ra_plus: f64,
        #[arg(long, allow_negative_numbers = true)]
        ra_minus: f64,
        #[arg(long)]
        dec_plus: f64,
        #[arg(long, allow_negative_numbers = true)]
        dec_minus: f64,
    },
    /// Any event localised by a circle
    Circle {
        name: String,
        /// Event time (ISO-8601 UTC)
        #[arg(long)]
        time: String,
        #[arg(long)]
        ra: f64,
        #[arg(long, allow_negative_numbers = true)]
        dec: f64,
        /// Radius in degrees
        #[arg(long)]
        radius: f64,
    },
}

fn build_event(args: &EventArgs, default_prob_threshold: f64) -> Result<Event, CliError> {
    let event = match args {
        EventArgs::Gw {
            skymap,
            name,
            notice,
            prob_threshold,
        } => GravitationalWave::from_file(
            name.as_deref(),
            *notice,
            skymap,
            prob_threshold.unwrap_or(default_prob_threshold),
        )?
        .into(),
        EventArgs::Neutrino {
            name,
            time,
            ra,
            dec,
            ra_plus,
            ra_minus,
            dec_plus,
            dec_minus,
        } => {
            let region = ErrorBox::new(*ra, *dec, (*ra_plus, *ra_minus), (*dec_plus, *dec_minus))?;
            Neutrino::new(name.as_str(), iso_to_jd(time)?, region).into()
        }
        EventArgs::Circle {
            name,
            time,
            ra,
            dec,
            radius,
        } => CircleEvent::new(name.as_str(), iso_to_jd(time)?, *ra, *dec, *radius)?.into(),
    };
    Ok(event)
}

#[instrument(skip_all, err)]
async fn run(args: Cli) -> Result<(), CliError> {
    let config_path = args.config.clone().unwrap_or_else(|| {
        let default_config_path = mmscan::conf::DEFAULT_CONFIG_PATH.to_string();
        warn!("no config file provided, using {}", default_config_path);
        default_config_path
    });
    let config = AppConfig::from_path(&config_path)?;

    let mut scan = config.scan.clone();
    if let Some(cone_nside) = args.cone_nside {
        scan.cone_nside = cone_nside;
    }
    if let Some(max_cones) = args.max_cones {
        scan.max_cones = Some(max_cones);
    }
    scan.fast_query |= args.fast_query;

    let event = build_event(&args.event, scan.prob_threshold)?;
    let t_max_jd = args.t_max.as_deref().map(iso_to_jd).transpose()?;
    let window_days = scan.window_days;

    let archive: Arc<dyn AlertArchive> = Arc::new(AmpelArchive::new(&config.archive)?);
    let mut scanner = ScanOrchestrator::new(Arc::clone(&archive), event, scan, config.filter.clone())?
        .with_progress(!args.quiet);

    let abort = scanner.abort_handle();
    tokio::spawn(
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("received ctrl-c, stopping after the current cone");
                abort.abort();
            }
        }
        .instrument(info_span!("sigint handler")),
    );

    for object_id in &args.check {
        scanner.check_object(object_id, t_max_jd).await?;
    }
    if !args.add.is_empty() {
        let ids: Vec<&str> = args.add.iter().map(String::as_str).collect();
        scanner.add_objects(&ids).await?;
    }
    let summary = scanner.scan_cones(t_max_jd, None).await?;
    if summary.cones_scanned < summary.cones_total {
        warn!(
            remaining = summary.cones_total - summary.cones_scanned,
            "not every cone was scanned"
        );
    }

    let mut sink = DirectoryReport::new(&args.output);
    if let Some(catalog) = &config.catalog {
        sink = sink.with_matcher(
            Arc::new(AmpelCatalogMatcher::new(catalog)?),
            catalog.search_radius_arcsec,
        );
    }
    if args.with_cutouts {
        sink = sink.with_cutouts(Arc::clone(&archive));
    }
    if let Some(path) = &args.observations {
        let context = scanner.event().context();
        let t_min_jd = context.t_min_jd();
        let t_max_jd = t_max_jd.unwrap_or_else(|| context.default_t_max_jd(window_days));
        let observations = CsvObservationLog::new(path).observations(t_min_jd, t_max_jd)?;
        sink = sink.with_observations(observations);
    }
    let summary = scanner.finish(&sink).await?;
    info!(
        candidates = summary.candidates,
        output = %args.output.display(),
        "report written"
    );
    Ok(())
}

#[tokio::main]
async fn main() {
    // Load environment variables from .env file before anything else
    load_dotenv();

    let args = Cli::parse();

    let subscriber = build_subscriber().expect("failed to build subscriber");
    tracing::subscriber::set_global_default(subscriber).expect("failed to install subscriber");

    if let Err(error) = run(args).await {
        log_error!(ERROR, error, "mmscan failed");
        std::process::exit(1);
    }
}
