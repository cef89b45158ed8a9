use clap::{Parser, Subcommand};
use dicom_core::header::Header;
use dicom_object::InMemDicomObject;
use dimse_scu::{ScuOptions, ServiceClassUser};
use dimse_ul::ReleaseMode;
use snafu::{Report, ResultExt, Whatever};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

/// DICOM query/retrieve, storage and verification SCU
#[derive(Debug, Parser)]
#[command(version)]
struct App {
    /// host name or address of the SCP
    #[arg(long, default_value = "localhost")]
    host: String,
    /// port of the SCP
    #[arg(short, long, default_value = "104")]
    port: u16,
    /// verbose mode
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,
    /// the calling AE title
    #[arg(long = "calling-ae-title", default_value = "THIS-SCU")]
    calling_ae_title: String,
    /// the called AE title
    #[arg(long = "called-ae-title", default_value = "ANY-SCP")]
    called_ae_title: String,
    /// the maximum PDU length
    #[arg(
        long = "max-pdu-length",
        default_value = "16384",
        value_parser(clap::value_parser!(u32).range(4096..=131_072))
    )]
    max_pdu_length: u32,
    /// seconds to wait for each response
    #[arg(long = "timeout", default_value = "120")]
    timeout: u64,
    /// transfer syntaxes to propose for queries and retrievals,
    /// implicit VR little endian if none is given
    #[arg(short = 't', long = "transfer-syntax")]
    transfer_syntaxes: Vec<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Verify the connection with C-ECHO
    Echo,
    /// Find studies, by patient or by study instance UID
    FindStudies {
        /// patient ID
        #[arg(long, requires = "patient_name", conflicts_with = "study")]
        patient_id: Option<String>,
        /// patient name
        #[arg(long, requires = "patient_id")]
        patient_name: Option<String>,
        /// study instance UIDs
        #[arg(long)]
        study: Vec<String>,
    },
    /// Find series, by study or by series instance UID
    FindSeries {
        /// study instance UIDs
        #[arg(long)]
        study: Vec<String>,
        /// series instance UIDs
        #[arg(long)]
        series: Vec<String>,
    },
    /// Find the instances of studies and series
    FindInstances {
        /// study instance UIDs
        #[arg(long)]
        study: Vec<String>,
        /// series instance UIDs
        #[arg(long)]
        series: Vec<String>,
    },
    /// Retrieve a study, series or instance with C-GET
    Get {
        #[arg(long)]
        study: Option<String>,
        #[arg(long)]
        series: Option<String>,
        #[arg(long)]
        instance: Option<String>,
        /// storage SOP classes to accept from the SCP
        #[arg(long = "storage-class")]
        storage_classes: Vec<String>,
    },
    /// Move series to another AE with C-MOVE
    Move {
        /// the destination AE title
        destination: String,
        /// study instance UIDs
        #[arg(long)]
        study: Vec<String>,
        /// series instance UIDs
        #[arg(long)]
        series: Vec<String>,
        /// release with A-RELEASE instead of A-ABORT after each move
        #[arg(long)]
        graceful: bool,
    },
    /// Send DICOM files with C-STORE
    Store {
        /// the files to send
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
}

fn main() {
    let app = App::parse();
    tracing::subscriber::set_global_default(
        tracing_subscriber::FmtSubscriber::builder()
            .with_env_filter(
                EnvFilter::builder()
                    .with_default_directive(
                        if app.verbose {
                            LevelFilter::DEBUG
                        } else {
                            LevelFilter::INFO
                        }
                        .into(),
                    )
                    .from_env_lossy(),
            )
            .finish(),
    )
    .whatever_context("Could not set up global logging subscriber")
    .unwrap_or_else(|e: Whatever| {
        eprintln!("[ERROR] {}", Report::from_error(e));
    });

    run(app).unwrap_or_else(|e| {
        error!("{}", Report::from_error(e));
        std::process::exit(-2);
    });
}

fn run(app: App) -> Result<(), Whatever> {
    let App {
        host,
        port,
        verbose: _,
        calling_ae_title,
        called_ae_title,
        max_pdu_length,
        timeout,
        transfer_syntaxes,
        command,
    } = app;

    let mut options = ScuOptions::new()
        .calling_ae_title(calling_ae_title)
        .called_ae_title(called_ae_title)
        .host(host)
        .port(port)
        .max_pdu_length(max_pdu_length)
        .response_timeout(Duration::from_secs(timeout))
        .transfer_syntaxes(transfer_syntaxes);
    if let Command::Get {
        storage_classes, ..
    } = &command
    {
        for sop_class_uid in storage_classes {
            options = options.with_retrieve_storage_class(sop_class_uid.as_str());
        }
    }
    if let Command::Move { graceful: true, .. } = &command {
        options = options.move_release_mode(ReleaseMode::Graceful);
    }

    let scu = ServiceClassUser::new(options).whatever_context("Could not initialize SCU")?;

    match command {
        Command::Echo => {
            let success = scu.echo().whatever_context("C-ECHO failed")?;
            if !success {
                snafu::whatever!("C-ECHO was not successful");
            }
            info!("C-ECHO successful");
        }
        Command::FindStudies {
            patient_id,
            patient_name,
            study,
        } => {
            let results = match (patient_id, patient_name) {
                (Some(id), Some(name)) => scu.find_studies_for_patient(&id, &name),
                _ => scu.find_studies(&study),
            }
            .whatever_context("C-FIND failed")?;
            print_all(&results);
        }
        Command::FindSeries { study, series } => {
            let mut results = scu
                .find_series_list(&series)
                .whatever_context("C-FIND failed")?;
            results.extend(
                scu.find_series_for_studies(&study)
                    .whatever_context("C-FIND failed")?,
            );
            print_all(&results);
        }
        Command::FindInstances { study, series } => {
            let results = scu
                .find_instances(&study, &series)
                .whatever_context("C-FIND failed")?;
            print_all(&results);
        }
        Command::Get {
            study,
            series,
            instance,
            storage_classes: _,
        } => {
            let Some(retrieved) = scu
                .get(study.as_deref(), series.as_deref(), instance.as_deref())
                .whatever_context("C-GET failed")?
            else {
                snafu::whatever!("Nothing to retrieve: give a study, series or instance UID");
            };
            print_all(&retrieved.identifiers);
            info!("Received {} instances", retrieved.instances.len());
        }
        Command::Move {
            destination,
            study,
            series,
            graceful: _,
        } => {
            let moved = scu
                .move_series(&study, &series, &destination)
                .whatever_context("C-MOVE failed")?;
            info!("Requested {} series to be moved to {}", moved.len(), destination);
        }
        Command::Store { files } => {
            let mut failed = 0;
            for file in &files {
                let stored = scu
                    .store_file(file)
                    .with_whatever_context(|_| format!("Could not store {}", file.display()))?;
                if !stored {
                    error!("{} was not stored", file.display());
                    failed += 1;
                }
            }
            if failed > 0 {
                snafu::whatever!("{} of {} files were not stored", failed, files.len());
            }
        }
    }
    Ok(())
}

/// Print each result as `(GGGG,EEEE) value` lines.
fn print_all(results: &[InMemDicomObject]) {
    for (i, result) in results.iter().enumerate() {
        println!("# result {}", i + 1);
        for element in result {
            let value = element
                .to_str()
                .map(|v| v.trim_end_matches(['\0', ' ']).to_string())
                .unwrap_or_else(|_| format!("<{}>", element.vr()));
            println!("{} {}", element.tag(), value);
        }
    }
}
