//! maci-finalize: drive maci polls to an on-chain tally
//!
//! wraps the coordinator client, the finalize state machine and the poll
//! reads in a cli. settings come from a toml file, flags or environment.

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use maci_coordinator::contracts::{MaciVoting, PollStateSource};
use maci_coordinator::finalize::{FinalizeOutcome, Finalizer};
use maci_coordinator::poll_data::{can_finalize, fetch_poll_data, PollData, PollWatcher};
use maci_coordinator::proposal::{
    proposal_status, status_variant, winning_option, ExecuteOutcome, ProposalExecutor,
};
use maci_coordinator::{
    to_backend_chain_format, Address, Config, CoordinatorClient, MaciReader, RpcProvider,
    TracingAlerts, VoteMode,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "maci-finalize")]
#[command(about = "Finalize MACI polls through a coordinator service")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[command(flatten)]
    settings: Settings,
}

/// overrides on top of the config file (or defaults)
#[derive(Args)]
struct Settings {
    /// toml config file
    #[arg(long, global = true, env = "MACI_FINALIZE_CONFIG")]
    config: Option<PathBuf>,

    /// coordinator service base url
    #[arg(long, global = true, env = "COORDINATOR_SERVICE_URL")]
    coordinator_url: Option<String>,

    /// authorization header sent to the coordinator
    #[arg(long, global = true, env = "COORDINATOR_AUTH_TOKEN", hide_env_values = true)]
    auth_token: Option<String>,

    /// sign the coordinator authorization with the signer account instead
    #[arg(long, global = true)]
    sign_auth: bool,

    /// coordinator request timeout in seconds
    #[arg(long, global = true, env = "COORDINATOR_TIMEOUT_SECS")]
    timeout: Option<u64>,

    /// maci contract address
    #[arg(long, global = true, env = "MACI_ADDRESS")]
    maci: Option<Address>,

    /// block the maci contract was deployed at
    #[arg(long, global = true, env = "MACI_DEPLOYMENT_BLOCK")]
    deployment_block: Option<u64>,

    /// maci voting plugin address
    #[arg(long, global = true, env = "MACI_VOTING_PLUGIN_ADDRESS")]
    plugin: Option<Address>,

    /// chain name (camelCase, e.g. arbitrumSepolia)
    #[arg(long, global = true, env = "CHAIN_NAME")]
    chain: Option<String>,

    /// json-rpc endpoint
    #[arg(long, global = true, env = "WEB3_ENDPOINT")]
    rpc: Option<String>,

    /// node-managed account used for transactions and signatures
    #[arg(long, global = true, env = "SIGNER_ADDRESS")]
    signer: Option<Address>,

    #[arg(long, global = true, env = "SECONDS_PER_BLOCK")]
    seconds_per_block: Option<u64>,

    #[arg(long, global = true, env = "BLOCKS_PER_BATCH")]
    blocks_per_batch: Option<u64>,

    /// vote mode: 0 qv, 1 non-qv, 2 full
    #[arg(long, global = true)]
    mode: Option<u8>,
}

#[derive(Subcommand)]
enum Commands {
    /// Merge, prove and submit a poll
    Finalize {
        poll_id: u64,

        /// give up on a coordinator call after this many seconds
        #[arg(long)]
        stage_timeout: Option<u64>,
    },

    /// Check whether a poll's voting period is over
    CanFinalize { poll_id: u64 },

    /// Show poll window, tally state and results
    Poll { poll_id: u64 },

    /// Follow a poll until voting ends
    Watch {
        poll_id: u64,

        /// refresh interval in seconds
        #[arg(long)]
        interval: Option<u64>,
    },

    /// Print the coordinator chain name for a frontend chain name
    ChainName { name: String },

    /// Show a proposal's status and leading option
    Proposal { id: u64 },

    /// Execute a passed proposal
    Execute { id: u64 },
}

impl Settings {
    fn load(&self) -> anyhow::Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::from_toml_file(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => Config::default(),
        };

        if let Some(url) = &self.coordinator_url {
            config.coordinator_url = url.clone();
        }
        if let Some(token) = self.auth_token.as_ref().filter(|t| !t.is_empty()) {
            config.auth_token = Some(token.clone());
        }
        if let Some(timeout) = self.timeout {
            config.timeout_secs = timeout;
        }
        if let Some(maci) = self.maci {
            config.maci_address = maci;
        }
        if let Some(block) = self.deployment_block {
            config.maci_deployment_block = block;
        }
        if let Some(plugin) = self.plugin {
            config.voting_plugin_address = plugin;
        }
        if let Some(chain) = &self.chain {
            config.chain_name = chain.clone();
        }
        if let Some(rpc) = &self.rpc {
            config.rpc_endpoint = rpc.clone();
        }
        if let Some(spb) = self.seconds_per_block {
            config.seconds_per_block = spb;
        }
        if let Some(batch) = self.blocks_per_batch {
            config.blocks_per_batch = batch;
        }
        if let Some(mode) = self.mode {
            config.mode = VoteMode::try_from(mode).map_err(anyhow::Error::msg)?;
        }

        config.validate()?;
        Ok(config)
    }
}

struct App {
    config: Config,
    provider: Arc<RpcProvider>,
    reader: Arc<MaciReader>,
}

impl App {
    fn new(settings: &Settings) -> anyhow::Result<Self> {
        let config = settings.load()?;
        if config.maci_address.is_zero() {
            bail!("maci address not set (--maci or MACI_ADDRESS)");
        }
        let mut provider = RpcProvider::with_timeout(&config.rpc_endpoint, config.request_timeout())?;
        if let Some(signer) = settings.signer {
            provider = provider.with_signer(signer);
        }
        let provider = Arc::new(provider);
        let reader = Arc::new(MaciReader::new(
            config.maci_address,
            provider.clone(),
            config.seconds_per_block,
        ));
        Ok(Self {
            config,
            provider,
            reader,
        })
    }

    fn voting(&self) -> anyhow::Result<MaciVoting> {
        if self.config.voting_plugin_address.is_zero() {
            bail!("voting plugin address not set (--plugin or MACI_VOTING_PLUGIN_ADDRESS)");
        }
        Ok(MaciVoting::new(
            self.config.voting_plugin_address,
            self.provider.clone(),
        ))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "maci_finalize=info,maci_coordinator=info".into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::ChainName { name } => {
            println!("{}", to_backend_chain_format(&name));
        }
        Commands::Finalize {
            poll_id,
            stage_timeout,
        } => {
            let ctx = App::new(&cli.settings)?;
            handle_finalize(&ctx, cli.settings.sign_auth, poll_id, stage_timeout).await?;
        }
        Commands::CanFinalize { poll_id } => {
            let ctx = App::new(&cli.settings)?;
            let ready = can_finalize(&*ctx.reader, poll_id).await;
            println!("{}", ready);
        }
        Commands::Poll { poll_id } => {
            let ctx = App::new(&cli.settings)?;
            let data = fetch_poll_data(&*ctx.reader, poll_id).await?;
            print_poll(&data);
        }
        Commands::Watch { poll_id, interval } => {
            let ctx = App::new(&cli.settings)?;
            let interval = interval
                .map(Duration::from_secs)
                .unwrap_or_else(|| ctx.config.refresh_interval());
            handle_watch(ctx.reader.clone(), poll_id, interval).await;
        }
        Commands::Proposal { id } => {
            let ctx = App::new(&cli.settings)?;
            handle_proposal(&ctx, id).await?;
        }
        Commands::Execute { id } => {
            let ctx = App::new(&cli.settings)?;
            let executor = ProposalExecutor::new(ctx.voting()?, Arc::new(TracingAlerts));
            match executor.execute(id).await? {
                ExecuteOutcome::Submitted(tx_hash) => println!("{}", tx_hash),
                ExecuteOutcome::NotExecutable => bail!("proposal {} cannot be executed", id),
                ExecuteOutcome::Failed(failure) => bail!("execute failed: {:?}", failure),
            }
        }
    }

    Ok(())
}

async fn handle_finalize(
    ctx: &App,
    sign_auth: bool,
    poll_id: u64,
    stage_timeout: Option<u64>,
) -> anyhow::Result<()> {
    let mut client = CoordinatorClient::new(&ctx.config)?;
    if sign_auth {
        client = client.with_signer_auth(ctx.provider.clone());
    }
    info!("coordinator: {}", client.base_url());
    info!("maci: {} (deployed at block {})", ctx.config.maci_address, ctx.config.maci_deployment_block);
    info!("chain: {} ({})", ctx.config.chain_name, ctx.config.backend_chain());

    let mut finalizer = Finalizer::new(
        Arc::new(client),
        ctx.reader.clone(),
        Arc::new(TracingAlerts),
        ctx.config.maci_deployment_block,
    );
    if let Some(secs) = stage_timeout {
        finalizer = finalizer.with_stage_timeout(Duration::from_secs(secs));
    }

    let report = tokio::select! {
        report = finalizer.finalize(poll_id) => report?,
        _ = tokio::signal::ctrl_c() => {
            warn!("interrupted, poll {} left at {}", poll_id, finalizer.status(poll_id));
            bail!("finalize interrupted");
        }
    };

    match report.outcome {
        FinalizeOutcome::AlreadyFinalized => {
            println!("poll {} already finalized", poll_id);
        }
        FinalizeOutcome::Finalized(tally) => {
            println!("poll {} finalized", poll_id);
            println!("tally: {}", tally.results.tally.join(", "));
            println!("spent voice credits: {}", tally.total_spent_voice_credits.spent);
        }
        FinalizeOutcome::Failed { stage, reason } => {
            bail!("finalize failed at {}: {}", stage, reason);
        }
    }
    Ok(())
}

fn print_poll(data: &PollData) {
    println!("poll {}", data.poll_id);
    println!("  start:    {}", data.vote_start);
    println!("  end:      {}", data.vote_end);
    println!("  now:      {}", data.now);
    println!("  ended:    {}", data.vote_ended);
    println!("  voting:   {}", if data.disabled { "closed" } else { "open" });
    println!("  tallied:  {}", data.tallied);
    if let Some(results) = &data.results {
        let winner = winning_option(Some(&results.tally));
        println!(
            "  results:  yes {} / no {} / abstain {}",
            results.tally.yes, results.tally.no, results.tally.abstain
        );
        println!("  leading:  {} ({}%)", winner.option, winner.percentage);
    }
}

async fn handle_watch(reader: Arc<MaciReader>, poll_id: u64, interval: Duration) {
    let mut watcher = PollWatcher::spawn(reader, poll_id, interval);
    while let Some(data) = watcher.changed().await {
        print_poll(&data);
    }
    info!("voting ended for poll {}", poll_id);
}

async fn handle_proposal(ctx: &App, id: u64) -> anyhow::Result<()> {
    let voting = ctx.voting()?;
    let proposal = voting.get_proposal(id).await?;
    let now = ctx.reader.chain_time().await?;
    let tallied = match ctx.reader.is_tallied(proposal.poll_id).await {
        Ok(tallied) => tallied,
        Err(e) => {
            warn!("could not read tally state of poll {}: {}", proposal.poll_id, e);
            false
        }
    };

    let variant = status_variant(Some(&proposal), now);
    let winner = winning_option(Some(&proposal.tally));

    println!("proposal {}", id);
    match voting
        .proposal_creation(id, proposal.parameters.snapshot_block)
        .await
    {
        Ok(Some(created)) => {
            println!("  creator:  {}", created.creator);
            println!("  metadata: {}", created.metadata);
        }
        Ok(None) => {}
        Err(e) => warn!("could not read proposal creation event: {}", e),
    }
    println!("  poll:     {} at {}", proposal.poll_id, proposal.poll_address);
    println!("  status:   {}", proposal_status(&proposal, now, tallied).as_str());
    println!("  badge:    {}", variant.label());
    println!(
        "  votes:    yes {} / no {} / abstain {}",
        proposal.tally.yes, proposal.tally.no, proposal.tally.abstain
    );
    println!("  leading:  {} ({}%)", winner.option, winner.percentage);
    println!("  actions:  {}", proposal.actions.len());
    Ok(())
}
