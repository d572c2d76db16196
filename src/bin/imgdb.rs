use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use clap::Parser;
use clap_derive::Parser;
use tracing::{info, Level};
use netimg::config::{NetimgConfig, DEFAULT_DROP_PROBABILITY, DEFAULT_SEED};
use netimg::image_store::DirectoryImageStore;
use netimg::server::ImageServer;
use netimg::socket::bind_udp_socket;

/// Serves the TGA images in a directory to `netimg` clients
#[derive(Parser)]
struct Args {
    /// UDP port to listen on; 0 picks a free port
    #[clap(short, long, default_value_t = 0)]
    port: u16,

    /// directory containing the images
    #[clap(long, default_value = ".")]
    dir: PathBuf,

    /// probability of dropping an outgoing DATA or FEC segment; negative turns loss off
    #[clap(short, long, default_value_t = DEFAULT_DROP_PROBABILITY, allow_negative_numbers = true)]
    drop: f64,

    #[clap(long, default_value_t = DEFAULT_SEED)]
    seed: u64,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,

    #[clap(long, default_value_t = false)]
    very_verbose: bool,
}

#[tokio::main(flavor = "current_thread")]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match (args.verbose, args.very_verbose) {
        (_, true) => Level::TRACE,
        (true, _) => Level::DEBUG,
        (false, false) => Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .try_init()
        .ok();

    let config = NetimgConfig {
        drop_probability: args.drop,
        seed: args.seed,
        ..NetimgConfig::new()
    };
    config.validate()?;

    // one segment of the largest supported size must fit the send buffer
    let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    let socket = Arc::new(bind_udp_socket(addr, None, Some(config.mss as usize))?);
    info!("imgdb listening on port {}, serving images from {:?}", socket.local_addr()?.port(), args.dir);

    let store = Arc::new(DirectoryImageStore::new(args.dir));
    let mut server = ImageServer::new(socket, store, config)?;
    server.serve().await
}
