use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use anyhow::{anyhow, bail};
use clap::Parser;
use clap_derive::Parser;
use tracing::{info, Level};
use netimg::config::{NetimgConfig, DEFAULT_MSS, DEFAULT_RWND, DEFAULT_SEED};
use netimg::control_messages::MetadataReply;
use netimg::display::{save_tga, ProgressDisplay};
use netimg::loss;
use netimg::receiver::{query_image, ImageReceiver};
use netimg::socket::{bind_udp_socket, DatagramSocket, PeerSocket};

/// Fetches an image from an `imgdb` server
#[derive(Parser)]
struct Args {
    /// the server's address as host:port
    #[clap(short, long)]
    server: String,

    /// name of the image to fetch
    #[clap(short, long)]
    query: String,

    /// receive window in segments
    #[clap(short = 'w', long, default_value_t = DEFAULT_RWND)]
    rwnd: u8,

    /// FEC window in segments, defaults to the largest supported value below the receive window
    #[clap(short = 'f', long)]
    fwnd: Option<u8>,

    /// maximum segment size in bytes, including all headers
    #[clap(short, long, default_value_t = DEFAULT_MSS)]
    mss: u16,

    /// probability of dropping an outgoing ACK
    #[clap(short, long, default_value_t = 0.0, allow_negative_numbers = true)]
    drop: f64,

    #[clap(long, default_value_t = DEFAULT_SEED)]
    seed: u64,

    /// stores the received image as a TGA file
    #[clap(short, long)]
    output: Option<PathBuf>,

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
        mss: args.mss,
        rwnd: args.rwnd,
        fwnd: args.fwnd.unwrap_or_else(|| NetimgConfig::default_fwnd(args.rwnd)),
        drop_probability: args.drop,
        seed: args.seed,
        ..NetimgConfig::new()
    };
    let params = config.session_params()?;

    let server_addr = tokio::net::lookup_host(&args.server).await?
        .next()
        .ok_or_else(|| anyhow!("could not resolve {}", args.server))?;
    let local_addr: SocketAddr = if server_addr.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" }.parse()?;

    let socket = Arc::new(bind_udp_socket(local_addr, Some(config.receive_buffer_size()), None)?);
    let socket: Arc<dyn DatagramSocket> = Arc::new(PeerSocket::client(socket, server_addr));

    let geometry = match query_image(socket.as_ref(), &params, &config, &args.query).await? {
        MetadataReply::Found(geometry) => geometry,
        MetadataReply::NotFound => bail!("{}: image {:?} not found", args.server, args.query),
        MetadataReply::Error(code) => bail!("{}: query for {:?} refused: {:?}", args.server, args.query, code),
    };
    info!("receiving {:?}: {:?}, {} bytes", args.query, geometry, geometry.img_size());

    let loss = loss::for_probability(config.drop_probability, config.seed);
    let receiver = ImageReceiver::new(socket, geometry, &params, &config, loss)?;
    let received = receiver.run(&mut ProgressDisplay::new()).await?;

    if !received.complete {
        bail!("image {:?} is incomplete", args.query);
    }
    if let Some(output) = &args.output {
        save_tga(output, &received.geometry, &received.pixels)?;
    }
    Ok(())
}
