mod cli;
mod ui;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use cli::{BackendArg, Cli, Command};
use provisioner::persist::StateFile;
use provisioner::{
    Allocator, MockBackend, PoolBackend, ProvisionRequest, ProvisionRequestStore, Provisioner,
    ProvisionerConfig, RequestId, ResourceBackend, ResourcePool,
};
use ui::RequestProgress;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = match &cli.config {
        Some(path) => ProvisionerConfig::load_from(path),
        None => ProvisionerConfig::load(),
    }
    .context("failed to load configuration")?;

    if let Command::Demo = cli.command {
        return demo(config).await;
    }

    let state_path = cli
        .state
        .clone()
        .unwrap_or_else(|| PathBuf::from(&config.state_file));
    let state = StateFile::load(&state_path)
        .with_context(|| format!("failed to read state file {}", state_path.display()))?;

    let (store, pool) = match state {
        Some(state) => (
            ProvisionRequestStore::restore(state.store)?,
            ResourcePool::restore(state.slots)?,
        ),
        None => (
            ProvisionRequestStore::new(),
            ResourcePool::new(config.pool.seed_slots()),
        ),
    };
    let store = Arc::new(store);
    let allocator = Allocator::new(Arc::new(pool), config.templates.clone());

    match cli.backend {
        BackendArg::Mock => {
            let backend = Arc::new(MockBackend::new(config.mock.clone(), config.templates.clone()));
            let provisioner = Provisioner::new(config, store, allocator, backend);
            execute(&provisioner, cli.command, &state_path).await
        }
        BackendArg::Pool => {
            let owner_tag = Some(config.pool.owner_tag.clone());
            let backend = Arc::new(PoolBackend::new(allocator.clone(), config.mock.clone(), owner_tag));
            let provisioner = Provisioner::new(config, store, allocator, backend);
            execute(&provisioner, cli.command, &state_path).await
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn execute<B: ResourceBackend>(
    provisioner: &Provisioner<B>,
    command: Command,
    state_path: &Path,
) -> Result<()> {
    let recovered = provisioner.recover_interrupted().await;
    if !recovered.is_empty() {
        info!(count = recovered.len(), "marked interrupted requests as failed");
    }

    let labels = provisioner.config().status_labels.clone();
    match command {
        Command::Submit {
            name,
            template,
            input,
        } => {
            let input = match input {
                Some(raw) => serde_json::from_str(&raw).context("--input must be valid JSON")?,
                None => serde_json::json!({}),
            };
            let id = provisioner.submit_request(&name, &template, input).await?;
            let request = follow(provisioner, id, &name).await?;
            ui::print_record(&request);
        }
        Command::List => {
            ui::print_requests(&provisioner.list_requests().await, &labels);
        }
        Command::Show { id } => {
            ui::print_record(&provisioner.get_request(RequestId(id)).await?);
        }
        Command::Delete { id } => {
            provisioner.delete_request(RequestId(id)).await?;
            println!("Request #{id} deleted.");
        }
        Command::Pool => {
            ui::print_slots(&provisioner.pool_slots().await);
        }
        Command::Templates => {
            for (name, count) in provisioner.templates().iter() {
                println!("{name:<12} {count} slot(s)");
            }
        }
        Command::Demo => bail!("demo does not use a state file"),
    }

    provisioner
        .save_state(state_path)
        .await
        .with_context(|| format!("failed to write state file {}", state_path.display()))?;
    Ok(())
}

/// Poll the request, echoing its log, until it is terminal.
async fn follow<B: ResourceBackend>(
    provisioner: &Provisioner<B>,
    id: RequestId,
    name: &str,
) -> Result<ProvisionRequest> {
    let mut progress = RequestProgress::start(name, provisioner.config().status_labels.clone());
    loop {
        let request = provisioner.get_request(id).await?;
        if request.is_terminal() {
            progress.complete(&request);
            return Ok(request);
        }
        progress.update(&request);
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Submit, watch and tear down one request against a fresh in-memory pool.
async fn demo(config: ProvisionerConfig) -> Result<()> {
    let allocator = Allocator::new(
        Arc::new(ResourcePool::new(config.pool.seed_slots())),
        config.templates.clone(),
    );
    let owner_tag = Some(config.pool.owner_tag.clone());
    let backend = Arc::new(PoolBackend::new(allocator.clone(), config.mock.clone(), owner_tag));
    let provisioner = Provisioner::new(
        config,
        Arc::new(ProvisionRequestStore::new()),
        allocator,
        backend,
    );

    println!("Pool before:");
    ui::print_slots(&provisioner.pool_slots().await);

    let id = provisioner
        .submit_request("Demo Shop", "standard", serde_json::json!({"owner": "demo"}))
        .await?;
    let request = follow(&provisioner, id, "Demo Shop").await?;
    ui::print_record(&request);

    println!("\nPool while provisioned:");
    ui::print_slots(&provisioner.pool_slots().await);

    provisioner.delete_request(id).await?;
    println!("\nPool after teardown:");
    ui::print_slots(&provisioner.pool_slots().await);
    Ok(())
}
