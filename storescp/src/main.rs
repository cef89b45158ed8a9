use clap::Parser;
use dimse_storescp::{syntax, StoreScp};
use dimse_ul::association::{AcceptorOptions, TcpAssociation};
use dimse_ul::Association;
use snafu::{Report, ResultExt, Whatever};
use std::net::{Ipv4Addr, SocketAddrV4, TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

/// DICOM C-STORE SCP
#[derive(Debug, Parser)]
#[command(version)]
struct App {
    /// Verbose mode
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,
    /// The AE title of this node
    #[arg(long = "ae-title", default_value = "STORE-SCP")]
    ae_title: String,
    /// Enforce max pdu length
    #[arg(short = 's', long = "strict")]
    strict: bool,
    /// Only accept native/uncompressed transfer syntaxes
    #[arg(long)]
    uncompressed_only: bool,
    /// Accept unknown SOP classes
    #[arg(long)]
    promiscuous: bool,
    /// Maximum PDU length
    #[arg(
        short = 'm',
        long = "max-pdu-length",
        default_value = "16384",
        value_parser(clap::value_parser!(u32).range(4096..=131_072))
    )]
    max_pdu_length: u32,
    /// Archive directory for incoming objects
    #[arg(short = 'o', default_value = "_archive")]
    out_dir: PathBuf,
    /// Number of patient name prefix directories
    #[arg(long = "dir-split-level", default_value = "1")]
    dir_split_level: usize,
    /// Which port to listen on
    #[arg(short, default_value = "11111")]
    port: u16,
    /// Seconds to wait for an association request, 0 to wait indefinitely
    #[arg(short = 't', long = "timeout", default_value = "30")]
    timeout: u64,
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
        verbose: _,
        ae_title,
        strict,
        uncompressed_only,
        promiscuous,
        max_pdu_length,
        out_dir,
        dir_split_level,
        port,
        timeout,
    } = app;

    let scp = StoreScp::new(&out_dir)
        .whatever_context("Could not create archive directory")?
        .dir_split_level(dir_split_level);
    let scp = Arc::new(scp);
    let options = Arc::new(AcceptorOptions {
        ae_title,
        abstract_syntaxes: syntax::abstract_syntaxes(),
        transfer_syntaxes: syntax::transfer_syntaxes(uncompressed_only),
        promiscuous,
        max_pdu_length,
        strict,
        read_timeout: (timeout > 0).then(|| Duration::from_secs(timeout)),
    });

    let listen_addr = SocketAddrV4::new(Ipv4Addr::from(0), port);
    let listener = TcpListener::bind(listen_addr)
        .with_whatever_context(|_| format!("Could not bind to {}", listen_addr))?;
    info!(
        "{} listening on: tcp://{}, storing into {}",
        options.ae_title,
        listen_addr,
        out_dir.display()
    );

    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                let scp = Arc::clone(&scp);
                let options = Arc::clone(&options);
                let spawned = std::thread::Builder::new()
                    .name("association".to_string())
                    .spawn(move || {
                        if let Err(e) = handle(stream, &options, &scp) {
                            error!("{}", Report::from_error(e));
                        }
                    });
                if let Err(e) = spawned {
                    error!("Could not spawn association thread: {}", e);
                }
            }
            Err(e) => error!("{}", Report::from_error(e)),
        }
    }
    Ok(())
}

fn handle(stream: TcpStream, options: &AcceptorOptions, scp: &StoreScp) -> Result<(), Whatever> {
    let peer = stream
        .peer_addr()
        .whatever_context("Could not read peer address")?;
    let mut association = TcpAssociation::accept(stream, options)
        .with_whatever_context(|_| format!("Could not establish association with {}", peer))?;
    info!("New association from {}", peer);
    debug!(
        "> Presentation contexts: {:?}",
        association.presentation_contexts()
    );
    scp.serve(&mut association)
        .with_whatever_context(|_| format!("Association with {} failed", peer))
}
