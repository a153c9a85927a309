use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use mixnet_node::{
    admin::MixnetAdmin,
    challenge::{DecryptionChallengeSpec, DecryptionChallengeVerifier},
    config::NodeConfig,
    crypto::{
        elgamal::{decode_u64, encode_u64},
        CiphertextRow, Curve,
    },
    messages::{Algorithm, NodeName},
    network::InMemoryNetwork,
    MixnetError,
};
use tracing::info;

#[derive(Parser, Debug)]
#[command(
    about = "Runs a key generation, shuffle and audited decryption on an in-process mix network",
    author,
    version
)]
struct Cli {
    /// Number of nodes (named A, B, C, ...)
    #[arg(long = "nodes", default_value_t = 5)]
    nodes: usize,

    /// Decryption threshold (between 1 and nodes)
    #[arg(long = "threshold", default_value_t = 3)]
    threshold: usize,

    /// Number of messages uploaded to the board
    #[arg(long = "messages", default_value_t = 100)]
    messages: u64,

    /// Shuffle path as node names (repeat flag); defaults to the first three nodes
    #[arg(long = "hop")]
    hops: Vec<String>,

    /// Challenge every index divisible by this value
    #[arg(long = "challenge-modulus", default_value_t = 10)]
    challenge_modulus: u64,

    /// File receiving the decryption challenge log
    #[arg(
        long = "challenge-log",
        value_name = "FILE",
        default_value = "artifacts/demo/challenge.log"
    )]
    challenge_log: PathBuf,

    /// Disable pairing of consecutive links in the shuffle audit
    #[arg(long = "no-pairing", default_value_t = false)]
    no_pairing: bool,
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        eprintln!("Demo failed: {e}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), MixnetError> {
    if cli.nodes == 0 || cli.nodes > 26 {
        return Err(MixnetError::InvalidParameter(
            "between 1 and 26 nodes are supported".to_string(),
        ));
    }
    let names: Vec<NodeName> = (0..cli.nodes)
        .map(|i| char::from(b'A' + i as u8).to_string())
        .collect();
    let path = if cli.hops.is_empty() {
        names.iter().take(3).cloned().collect()
    } else {
        cli.hops.clone()
    };

    let network = InMemoryNetwork::new();
    let configs = names
        .iter()
        .map(|name| {
            NodeConfig::new(name.as_str())
                .with_retry_intervals(Duration::from_millis(200), Duration::from_millis(100))
        })
        .collect();
    let nodes = network.spawn_nodes(configs)?;
    let admin = MixnetAdmin::new(network.peer_map(&names))
        .with_polling(Duration::from_millis(20), Duration::from_secs(120));

    let key_id = "demo-elgamal";
    let pk = admin
        .generate_key(key_id, Algorithm::EcElGamal, cli.threshold, &names)
        .await?
        .as_g1()?;

    let host = &names[0];
    let mut rng = ark_std::test_rng();
    let rows: Vec<_> = (0..cli.messages)
        .map(|m| CiphertextRow::<Curve>::encrypt(pk, &[encode_u64::<Curve>(m)], &mut rng))
        .collect();
    admin.upload("X", host, &rows).await?;

    let receipt = admin.shuffle("X", host, key_id, &path).await?;
    let audit = admin.verify_shuffle(&receipt, !cli.no_pairing).await?;
    info!(
        combined_seed = %hex::encode(&audit.combined_seed),
        links = audit.links_checked,
        "shuffle audit passed"
    );

    if let Some(dir) = cli.challenge_log.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let sink = BufWriter::new(File::create(&cli.challenge_log)?);
    let mut spec = DecryptionChallengeSpec::every_nth(cli.challenge_modulus, sink)?;
    let decrypted = admin.download_challenged("X", host, key_id, &mut spec).await?;
    spec.into_sink()
        .into_inner()
        .map_err(|e| MixnetError::from(e.into_error()))?;

    let mut values: Vec<u64> = decrypted
        .iter()
        .filter_map(|row| decode_u64::<Curve>(row.plaintext[0], cli.messages))
        .collect();
    values.sort_unstable();
    let intact = values == (0..cli.messages).collect::<Vec<_>>();
    info!(decrypted = decrypted.len(), intact, "board decrypted");

    let report = DecryptionChallengeVerifier::new(pk).verify(File::open(&cli.challenge_log)?)?;
    info!("{}", report);

    for stats in admin.network_statistics().await {
        info!(
            node = %stats.node,
            keys = stats.keys.len(),
            running = stats.tasks_running,
            queued = stats.tasks_queued,
            services = ?stats.services,
            "node statistics"
        );
    }

    for node in &nodes {
        node.shutdown(Duration::from_secs(5)).await;
    }

    if !intact || !report.all_passed() {
        return Err(MixnetError::Protocol(
            "decrypted board does not match the uploaded messages".to_string(),
        ));
    }
    println!(
        "{} messages shuffled over {:?}, {} links and {} challenged indices verified",
        cli.messages,
        path,
        audit.links_checked,
        report.verdicts.len()
    );
    Ok(())
}

fn init_tracing() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "info".into()),
            )
            .try_init();
    });
}
