//! cloudRIG operator CLI.
//!
//! Starts provisioning and stop chains, aborts running chains and prints
//! what an envelope says about its chain.

use anyhow::{Context as _, Result};
use clap::{Args, Parser, Subcommand};
use cloudrig_steps::templates::{compensating_chain, provision, stop, ProvisionRequest};
use cloudrig_worker::nats::{NatsAborts, NatsBus, DEFAULT_ABORT_BUCKET, DEFAULT_STREAM};
use cloudrig_workflow::{
    describe_chain_state, start_chain, trigger_rollback, BusDispatcher, DeploymentConfig,
    Envelope, RollbackCause, Settings,
};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "cloudrigctl")]
#[command(version, about = "cloudRIG operator tool", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// NATS server URL
    #[arg(long, env = "NATS_URL", default_value = "nats://localhost:4222", global = true)]
    nats_url: String,

    /// JetStream stream holding step messages
    #[arg(long, env = "CLOUDRIG_NATS_STREAM", default_value = DEFAULT_STREAM, global = true)]
    stream: String,

    /// KV bucket holding abort markers
    #[arg(long, env = "CLOUDRIG_ABORT_BUCKET", default_value = DEFAULT_ABORT_BUCKET, global = true)]
    abort_bucket: String,
}

#[derive(Args)]
struct Deployment {
    /// Provider region
    #[arg(long, env = "CLOUDRIG_REGION")]
    region: String,

    /// Account the resources are billed to
    #[arg(long, env = "CLOUDRIG_ACCOUNT")]
    account: String,

    /// Owner the chain runs for
    #[arg(long, env = "CLOUDRIG_OWNER")]
    owner: String,
}

impl Deployment {
    fn split(self) -> (DeploymentConfig, Settings) {
        (
            DeploymentConfig::new(self.region, self.account),
            Settings::new(self.owner),
        )
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Provision a new rig
    ///
    /// Examples:
    ///     cloudrigctl start --region eu-west-2 --account 1234 --owner alice \
    ///         --network 8056c2e21c000001 --package steam --package parsec
    #[command(verbatim_doc_comment)]
    Start {
        #[command(flatten)]
        deployment: Deployment,

        /// Instance type to request
        #[arg(long, default_value = "g4dn.xlarge")]
        instance_type: String,

        /// Machine image
        #[arg(long)]
        image: Option<String>,

        /// Private network to join
        #[arg(long)]
        network: String,

        /// Package to install, can be repeated
        #[arg(long = "package", value_name = "NAME")]
        packages: Vec<String>,

        /// Write the initial envelope to this file
        #[arg(short, long)]
        out: Option<PathBuf>,
    },

    /// Terminate an existing rig
    Stop {
        #[command(flatten)]
        deployment: Deployment,

        /// Resource to terminate
        #[arg(long)]
        resource_id: String,
    },

    /// Abort a chain by sending it down the compensating chain
    Rollback {
        /// Envelope file of the chain, `-` for stdin
        #[arg(value_name = "ENVELOPE")]
        envelope: PathBuf,

        /// Reason recorded as the rollback cause
        #[arg(long, default_value = "aborted by operator")]
        reason: String,
    },

    /// Show what an envelope says about its chain
    Describe {
        /// Envelope file, `-` for stdin
        #[arg(value_name = "ENVELOPE")]
        envelope: PathBuf,

        /// Emit JSON
        #[arg(short, long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn,cloudrigctl=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Start {
            deployment,
            instance_type,
            image,
            network,
            packages,
            out,
        } => {
            let (config, settings) = deployment.split();
            let request = ProvisionRequest {
                instance_type,
                image,
                network_id: network,
                packages,
            };
            let envelope = provision(config, settings, &request);
            if let Some(path) = &out {
                write_envelope(path, &envelope)?;
            }
            let bus = connect(&cli.nats_url, &cli.stream).await?;
            let key = start_chain(&dispatcher(&bus), &envelope).await?;
            tracing::info!(
                chain_id = %envelope.config.chain_id,
                routing_key = %key,
                packages = request.packages.len(),
                "Provision chain started"
            );
            println!("Started chain {} ({})", envelope.config.chain_id, key);
        }
        Commands::Stop {
            deployment,
            resource_id,
        } => {
            let (config, settings) = deployment.split();
            let envelope = stop(config, settings, &resource_id);
            let bus = connect(&cli.nats_url, &cli.stream).await?;
            let key = start_chain(&dispatcher(&bus), &envelope).await?;
            tracing::info!(
                chain_id = %envelope.config.chain_id,
                resource_id = %resource_id,
                routing_key = %key,
                "Stop chain started"
            );
            println!("Stopping {} in chain {} ({})", resource_id, envelope.config.chain_id, key);
        }
        Commands::Rollback { envelope, reason } => {
            let envelope = read_envelope(&envelope)?;
            let bus = connect(&cli.nats_url, &cli.stream).await?;
            let aborts = NatsAborts::new(bus.context(), Some(cli.abort_bucket.as_str())).await?;
            tracing::info!(
                chain_id = %envelope.config.chain_id,
                reason = %reason,
                "Aborting chain"
            );
            let rolled = trigger_rollback(
                &dispatcher(&bus),
                &aborts,
                envelope,
                RollbackCause::new(reason),
            )
            .await?;
            println!("{}", describe_chain_state(&rolled));
        }
        Commands::Describe { envelope, json } => {
            let description = describe_chain_state(&read_envelope(&envelope)?);
            if json {
                println!("{}", serde_json::to_string_pretty(&description)?);
            } else {
                println!("{description}");
            }
        }
    }

    Ok(())
}

async fn connect(nats_url: &str, stream: &str) -> Result<NatsBus> {
    let client = async_nats::connect(nats_url)
        .await
        .with_context(|| format!("connecting to NATS at {nats_url}"))?;
    Ok(NatsBus::new(client, Some(stream)).await?)
}

fn dispatcher(bus: &NatsBus) -> BusDispatcher {
    let bus = Arc::new(bus.clone());
    BusDispatcher::new(bus.clone(), bus, compensating_chain())
}

fn read_envelope(path: &Path) -> Result<Envelope> {
    let bytes = if path == Path::new("-") {
        let mut buf = Vec::new();
        std::io::stdin()
            .read_to_end(&mut buf)
            .context("reading envelope from stdin")?;
        buf
    } else {
        std::fs::read(path).with_context(|| format!("reading {}", path.display()))?
    };
    Envelope::from_slice(&bytes).with_context(|| format!("parsing envelope {}", path.display()))
}

fn write_envelope(path: &Path, envelope: &Envelope) -> Result<()> {
    let body = serde_json::to_vec_pretty(envelope)?;
    std::fs::write(path, body).with_context(|| format!("writing {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_start() {
        let cli = Cli::try_parse_from([
            "cloudrigctl",
            "start",
            "--region",
            "eu-west-2",
            "--account",
            "1234",
            "--owner",
            "alice",
            "--network",
            "8056c2e21c000001",
            "--package",
            "steam",
            "--package",
            "parsec",
        ])
        .unwrap();

        match cli.command {
            Commands::Start {
                deployment,
                packages,
                instance_type,
                ..
            } => {
                assert_eq!(deployment.owner, "alice");
                assert_eq!(packages, vec!["steam", "parsec"]);
                assert_eq!(instance_type, "g4dn.xlarge");
            }
            _ => panic!("expected start"),
        }
    }

    #[test]
    fn test_envelope_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("envelope.json");

        let envelope = stop(
            DeploymentConfig::new("eu-west-2", "1234"),
            Settings::new("alice"),
            "i-0abc",
        );
        write_envelope(&path, &envelope).unwrap();
        assert_eq!(read_envelope(&path).unwrap(), envelope);
    }

    #[test]
    fn test_unparseable_envelope_names_the_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut file, b"{\"pendingSteps\": 3}").unwrap();

        let err = read_envelope(file.path()).unwrap_err();
        assert!(format!("{err:#}").contains(&file.path().display().to_string()));
    }

    #[test]
    fn test_parse_rollback_defaults() {
        let cli = Cli::try_parse_from(["cloudrigctl", "rollback", "chain.json"]).unwrap();
        assert_eq!(cli.abort_bucket, DEFAULT_ABORT_BUCKET);
        match cli.command {
            Commands::Rollback { envelope, reason } => {
                assert_eq!(envelope, PathBuf::from("chain.json"));
                assert_eq!(reason, "aborted by operator");
            }
            _ => panic!("expected rollback"),
        }
    }
}
