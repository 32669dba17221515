use anyhow::Context;
use clap::Parser;
use oobfabric::{Config, Outcome, Role};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(about = "Reliable-datagram message exchange with out-of-band address setup.")]
pub struct Args {
    /// Local address to bind. The listener accepts on it and the fabric endpoint is reachable
    /// there.
    #[arg(short)]
    pub src_addr: Option<String>,

    /// The peer to connect to. If not specified, the binary waits for a peer to connect.
    pub dst_addr: Option<String>,
}

#[inline]
pub fn get_args() -> &'static Args {
    use std::sync::OnceLock;
    static ARGS: OnceLock<Args> = OnceLock::new();

    ARGS.get_or_init(Args::parse)
}

fn run(args: &Args) -> anyhow::Result<()> {
    let config = Config {
        src_addr: args.src_addr.clone(),
        dst_addr: args.dst_addr.clone(),
        ..Config::default()
    }
    .with_env()?;
    tracing::debug!(?config, "configuration");

    match (config.role(), config.dst_addr.as_deref()) {
        (Role::Connector, Some(dst)) => println!("Client: send to server {dst}"),
        _ => println!("Server: post buffer and wait for message from client"),
    }

    let outcome = oobfabric::run_demo(&config).context("rdm exchange")?;
    match outcome {
        Outcome::Sent { .. } => println!("My sent message got sent!"),
        Outcome::Received { text, .. } => {
            println!("I received a message!");
            println!("This is the message I received: {text}");
        }
    }
    Ok(())
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    let args = get_args();
    if let Err(e) = run(args) {
        let code = e
            .downcast_ref::<oobfabric::Error>()
            .map_or(-oobfabric::error::errno::EINVAL, oobfabric::Error::code);
        eprintln!("{e:#} ({code})");
        std::process::exit(code);
    }
}
