// ember — mesh engine workbench
//
// Small CLI for poking at the engine without a radio: key/identity
// inspection, frame decoding, and an in-process multi-node demo mesh.

mod demo;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ember_core::protocol::Envelope;
use ember_core::{Ed25519Signer, MeshConfig, Signer};

#[derive(Parser)]
#[command(name = "ember")]
#[command(about = "Ember — serverless mesh messaging engine", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Derive a node identity from a seed (or a fresh random one)
    Keygen {
        /// 32-byte hex seed; random when omitted
        #[arg(short, long)]
        seed: Option<String>,
    },
    /// Decode a hex-encoded wire frame and print its envelope
    Decode {
        /// Envelope bytes as hex
        frame: String,
    },
    /// Run an in-process demo mesh and exchange messages
    Demo {
        /// Number of nodes in a line topology
        #[arg(short, long, default_value = "3")]
        nodes: usize,
        /// Broadcasts to send from the first node
        #[arg(short, long, default_value = "3")]
        messages: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Keygen { seed } => cmd_keygen(seed),
        Commands::Decode { frame } => cmd_decode(&frame),
        Commands::Demo { nodes, messages } => demo::run(nodes, messages).await,
    }
}

fn cmd_keygen(seed: Option<String>) -> Result<()> {
    let signer = match seed {
        Some(seed_hex) => {
            let bytes = hex::decode(seed_hex.trim()).context("seed is not valid hex")?;
            let seed: [u8; 32] = bytes
                .try_into()
                .map_err(|_| anyhow::anyhow!("seed must be exactly 32 bytes"))?;
            Ed25519Signer::from_seed(seed)
        }
        None => Ed25519Signer::generate(),
    };
    println!("node id:     {}", hex::encode(signer.node_id()));
    println!("signing key: {}", hex::encode(signer.public_key()));
    Ok(())
}

fn cmd_decode(frame_hex: &str) -> Result<()> {
    let bytes = hex::decode(frame_hex.trim()).context("frame is not valid hex")?;
    let ceiling = MeshConfig::default().payload_ceiling;
    let envelope = Envelope::decode(&bytes, ceiling).context("frame does not decode")?;

    println!("version:    {}", envelope.version);
    println!("type:       {:?}", envelope.msg_type);
    println!("ttl:        {}", envelope.ttl);
    println!("timestamp:  {} ms", envelope.timestamp_ms);
    println!("sender:     {}", hex::encode(envelope.sender));
    match envelope.recipient {
        Some(recipient) => println!("recipient:  {}", hex::encode(recipient)),
        None => println!("recipient:  (broadcast)"),
    }
    if !envelope.route.is_empty() {
        let hops: Vec<String> = envelope.route.iter().map(hex::encode).collect();
        println!("route:      {}", hops.join(" -> "));
    }
    println!(
        "payload:    {} bytes{}",
        envelope.payload.len(),
        if envelope.compressed {
            " (lz4 compressed)"
        } else {
            ""
        }
    );
    println!(
        "signed:     {}",
        if envelope.signature.is_some() {
            "yes"
        } else {
            "no"
        }
    );
    Ok(())
}
