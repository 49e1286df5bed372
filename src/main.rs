use anyhow::{Context, Result};
use appctl::api::DeployRequest;
use appctl::auth::{derive_token, TokenStore};
use appctl::client::ApiClient;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "appctl", version, about = "Deploy and inspect AppDeployments")]
struct Cli {
    /// API server base URL
    #[arg(
        long,
        global = true,
        env = "APPCTL_SERVER",
        default_value = "http://localhost:8080"
    )]
    server: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Store an API token derived from credentials
    Login {
        #[arg(long)]
        username: String,
        #[arg(long)]
        password: String,
    },
    /// Create an AppDeployment
    Deploy {
        #[arg(long)]
        image: String,
        #[arg(long)]
        name: String,
        #[arg(long)]
        memory_limit: String,
        #[arg(long, default_value_t = 1)]
        min_replicas: i32,
        #[arg(long, default_value_t = 3)]
        max_replicas: i32,
    },
    /// Show state and available replicas
    Status {
        #[arg(long)]
        name: String,
    },
    /// Delete an AppDeployment
    Destroy {
        #[arg(long)]
        name: String,
    },
}

fn authed_client(server: &str, store: &TokenStore) -> Result<ApiClient> {
    let token = store.require()?;
    Ok(ApiClient::new(server)?.with_token(token))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let store = TokenStore::default_location()?;

    match cli.command {
        Command::Login { username, password } => {
            store
                .save(&derive_token(&username, &password))
                .with_context(|| format!("failed to write {}", store.path().display()))?;
            println!("✅ Logged in as {username}");
        }
        Command::Deploy {
            image,
            name,
            memory_limit,
            min_replicas,
            max_replicas,
        } => {
            let client = authed_client(&cli.server, &store)?;
            let response = client
                .deploy(&DeployRequest {
                    image,
                    name,
                    memory_limit,
                    min_replicas,
                    max_replicas,
                })
                .await?;
            println!("🚀 {}", response.message);
        }
        Command::Status { name } => {
            let client = authed_client(&cli.server, &store)?;
            let status = client.status(&name).await?;
            println!("📊 {name}: {} ({} replica(s) available)", status.status, status.replicas);
        }
        Command::Destroy { name } => {
            let client = authed_client(&cli.server, &store)?;
            let response = client.destroy(&name).await?;
            println!("🗑️  {}", response.message);
        }
    }

    Ok(())
}
