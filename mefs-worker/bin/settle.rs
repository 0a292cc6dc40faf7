use std::io;
use std::panic;
use std::path::PathBuf;
use std::time::Duration;
use std::time::Instant;

use alloy::primitives::Address;
use alloy::primitives::B256;
use alloy::primitives::U256;
use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use backtrace::Backtrace;
use clap::Args;
use clap::Parser;
use clap::Subcommand;
use clap::ValueEnum;
use mefs_auth::PaymentVoucher;
use mefs_contracts::proofs::DirBlockSource;
use mefs_contracts::roles::PledgeAmount;
use mefs_contracts::with_deadline;
use mefs_contracts::OrderTerms;
use mefs_contracts::Role;
use mefs_worker::config::Config;
use mefs_worker::context::Settlement;
use mefs_worker::keys::new_keystore;
use mefs_worker::keys::new_keystore_password;
use mefs_worker::keys::terminal_prompt;
use mefs_worker::metrics::Metrics;
use mefs_worker::proposal::SettlementProposal;
use serde::Serialize;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const DEFAULT_KEYSTORE: &str = "mefs_keystore.json";

#[derive(Parser, Debug)]
#[command(version, about = "Settlement client for mefs participants")]
struct Cli {
    /// Path to the configuration file.
    #[clap(short, long, global = true)]
    config: Option<String>,

    /// If set, output logs in JSON format.
    #[clap(short, long, action, global = true)]
    json: bool,

    /// Log at debug level unless RUST_LOG says otherwise.
    #[clap(short, long, action, global = true)]
    verbose: bool,

    /// Give up on the command after this many seconds.
    #[clap(long, global = true)]
    timeout_secs: Option<u64>,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate a new signer keystore
    NewKey(NewKey),
    /// Find an owner's mapper under a directory key, optionally creating it
    Resolve(Resolve),
    /// Append an address to the signer's mapper under a directory key
    Publish(Publish),
    /// Advertise a price and stake as keeper or provider
    Register(Register),
    /// Enable, disable, ban or unban a role holder (admin only)
    Admin(Admin),
    /// Pair a keeper with providers in the keeper/provider map (admin only)
    Pair(Pair),
    /// Show a role holder's registry entry
    RoleInfo(RoleInfo),
    /// Open a payment channel to a payee
    OpenChannel(OpenChannel),
    /// Sign a cumulative voucher for a channel the signer pays into
    Voucher(IssueVoucher),
    /// Cash a voucher in, as the payee
    CloseChannel(CloseChannel),
    /// Close, time out or leave a channel, whichever is due
    SettleChannel(SettleChannel),
    /// Deploy an upkeeping order
    DeployOrder(DeployOrder),
    /// Show an upkeeping order
    OrderInfo(OrderInfo),
    /// Propose the next space-time payment for a provider and sign it
    Propose(Propose),
    /// Recompute a proposal and add the signer's keeper signature
    Cosign(Cosign),
    /// Submit a co-signed proposal
    Pay(Pay),
    /// Refund an expired order to its user
    Destruct(Destruct),
    /// Publish a Merkle root in the signer's root store
    SetRoot(SetRoot),
    /// Read a Merkle root, the latest one by default
    GetRoot(GetRoot),
}

impl Command {
    fn name(&self) -> &'static str {
        match self {
            Command::NewKey(_) => "new_key",
            Command::Resolve(_) => "resolve",
            Command::Publish(_) => "publish",
            Command::Register(_) => "register",
            Command::Admin(_) => "admin",
            Command::Pair(_) => "pair",
            Command::RoleInfo(_) => "role_info",
            Command::OpenChannel(_) => "open_channel",
            Command::Voucher(_) => "voucher",
            Command::CloseChannel(_) => "close_channel",
            Command::SettleChannel(_) => "settle_channel",
            Command::DeployOrder(_) => "deploy_order",
            Command::OrderInfo(_) => "order_info",
            Command::Propose(_) => "propose",
            Command::Cosign(_) => "cosign",
            Command::Pay(_) => "pay",
            Command::Destruct(_) => "destruct",
            Command::SetRoot(_) => "set_root",
            Command::GetRoot(_) => "get_root",
        }
    }

    async fn run(
        &self,
        ctx: &Settlement,
    ) -> Result<()> {
        match self {
            Command::NewKey(cmd) => cmd.run(),
            Command::Resolve(cmd) => cmd.run(ctx).await,
            Command::Publish(cmd) => cmd.run(ctx).await,
            Command::Register(cmd) => cmd.run(ctx).await,
            Command::Admin(cmd) => cmd.run(ctx).await,
            Command::Pair(cmd) => cmd.run(ctx).await,
            Command::RoleInfo(cmd) => cmd.run(ctx).await,
            Command::OpenChannel(cmd) => cmd.run(ctx).await,
            Command::Voucher(cmd) => cmd.run(ctx).await,
            Command::CloseChannel(cmd) => cmd.run(ctx).await,
            Command::SettleChannel(cmd) => cmd.run(ctx).await,
            Command::DeployOrder(cmd) => cmd.run(ctx).await,
            Command::OrderInfo(cmd) => cmd.run(ctx).await,
            Command::Propose(cmd) => cmd.run(ctx).await,
            Command::Cosign(cmd) => cmd.run(ctx).await,
            Command::Pay(cmd) => cmd.run(ctx).await,
            Command::Destruct(cmd) => cmd.run(ctx).await,
            Command::SetRoot(cmd) => cmd.run(ctx).await,
            Command::GetRoot(cmd) => cmd.run(ctx).await,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum RoleArg {
    Keeper,
    Provider,
}

impl From<RoleArg> for Role {
    fn from(role: RoleArg) -> Self {
        match role {
            RoleArg::Keeper => Role::Keeper,
            RoleArg::Provider => Role::Provider,
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[derive(Args, Debug)]
struct NewKey {
    /// Where to write the keystore. The password comes from SIGNER__PASSWORD
    /// or is typed twice.
    #[clap(long, default_value_t = { DEFAULT_KEYSTORE.to_string() })]
    keystore: String,
}

impl NewKey {
    fn run(&self) -> Result<()> {
        let password = new_keystore_password(&self.keystore, &mut terminal_prompt)?;
        let signer = new_keystore(&self.keystore, password)?;
        info!("address: {}", signer.address());
        Ok(())
    }
}

#[derive(Args, Debug)]
struct Resolve {
    /// Directory key, e.g. `query` or `upkeeping`.
    #[clap(long)]
    key: String,
    /// Defaults to the signer.
    #[clap(long)]
    owner: Option<Address>,
    /// Deploy missing resolver and mapper contracts.
    #[clap(long, action)]
    deploy: bool,
}

impl Resolve {
    async fn run(
        &self,
        ctx: &Settlement,
    ) -> Result<()> {
        let owner = self.owner.unwrap_or(ctx.signer().address());
        let mapper = ctx
            .directory()
            .resolve_or_deploy(&self.key, owner, ctx.signer(), self.deploy)
            .await?;
        let history = ctx.directory().history(&self.key, owner).await?;
        print_json(&serde_json::json!({ "mapper": mapper, "addresses": history }))
    }
}

#[derive(Args, Debug)]
struct Publish {
    #[clap(long)]
    key: String,
    #[clap(long)]
    address: Address,
}

impl Publish {
    async fn run(
        &self,
        ctx: &Settlement,
    ) -> Result<()> {
        let mapper = ctx
            .directory()
            .publish(&self.key, ctx.signer(), self.address)
            .await?;
        info!("{} listed in mapper {}", self.address, mapper);
        Ok(())
    }
}

#[derive(Args, Debug)]
struct Register {
    #[clap(long, value_enum)]
    role: RoleArg,
    /// Advertised unit price.
    #[clap(long)]
    price: U256,
    /// Keeper deposit.
    #[clap(long, conflicts_with = "size")]
    deposit: Option<U256>,
    /// Storage a provider backs; the deposit follows from price and ratio.
    #[clap(long)]
    size: Option<U256>,
}

impl Register {
    async fn run(
        &self,
        ctx: &Settlement,
    ) -> Result<()> {
        let amount = match (self.deposit, self.size) {
            (Some(deposit), None) => PledgeAmount::Fixed(deposit),
            (None, Some(size)) => PledgeAmount::Size(size),
            _ => bail!("pass --deposit for a keeper or --size for a provider"),
        };
        let record = ctx
            .roles()
            .register(ctx.signer(), self.role.into(), self.price, amount)
            .await?;
        print_json(&record)
    }
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum AdminAction {
    Enable,
    Disable,
    Ban,
    Unban,
}

#[derive(Args, Debug)]
struct Admin {
    #[clap(long, value_enum)]
    role: RoleArg,
    #[clap(long)]
    holder: Address,
    #[clap(long, value_enum)]
    action: AdminAction,
}

impl Admin {
    async fn run(
        &self,
        ctx: &Settlement,
    ) -> Result<()> {
        let roles = ctx.roles();
        let role = self.role.into();
        match self.action {
            AdminAction::Enable => roles.set_flag(ctx.signer(), role, self.holder, true).await?,
            AdminAction::Disable => roles.set_flag(ctx.signer(), role, self.holder, false).await?,
            AdminAction::Ban => roles.set_banned(ctx.signer(), role, self.holder, true).await?,
            AdminAction::Unban => roles.set_banned(ctx.signer(), role, self.holder, false).await?,
        }
        print_json(&roles.get_info(role, self.holder).await?)
    }
}

#[derive(Args, Debug)]
struct Pair {
    #[clap(long)]
    keeper: Address,
    /// Providers to pair; leave empty with --remove to drop the keeper.
    #[clap(long = "provider")]
    providers: Vec<Address>,
    #[clap(long, action)]
    remove: bool,
}

impl Pair {
    async fn run(
        &self,
        ctx: &Settlement,
    ) -> Result<()> {
        let roles = ctx.roles();
        match (self.remove, self.providers.is_empty()) {
            (false, _) => {
                roles
                    .add_keeper_providers(ctx.signer(), self.keeper, self.providers.clone())
                    .await?
            },
            (true, true) => roles.delete_keeper(ctx.signer(), self.keeper).await?,
            (true, false) => {
                for provider in &self.providers {
                    roles
                        .delete_provider(ctx.signer(), self.keeper, *provider)
                        .await?;
                }
            },
        }
        print_json(&roles.providers_of(self.keeper).await?)
    }
}

#[derive(Args, Debug)]
struct RoleInfo {
    #[clap(long, value_enum)]
    role: RoleArg,
    /// Defaults to the signer.
    #[clap(long)]
    holder: Option<Address>,
}

impl RoleInfo {
    async fn run(
        &self,
        ctx: &Settlement,
    ) -> Result<()> {
        let holder = self.holder.unwrap_or(ctx.signer().address());
        print_json(&ctx.roles().get_info(self.role.into(), holder).await?)
    }
}

#[derive(Args, Debug)]
struct OpenChannel {
    #[clap(long)]
    payee: Address,
    /// Seconds until the payer may reclaim the deposit.
    #[clap(long)]
    duration: u64,
    #[clap(long)]
    deposit: U256,
}

impl OpenChannel {
    async fn run(
        &self,
        ctx: &Settlement,
    ) -> Result<()> {
        let channels = ctx.channels();
        let channel = channels
            .open(ctx.signer(), self.payee, self.duration, self.deposit)
            .await?;
        print_json(&channels.state(channel).await?)
    }
}

#[derive(Args, Debug)]
struct IssueVoucher {
    #[clap(long)]
    channel: Address,
    /// Cumulative amount owed to the payee.
    #[clap(long)]
    value: U256,
}

impl IssueVoucher {
    async fn run(
        &self,
        ctx: &Settlement,
    ) -> Result<()> {
        let state = ctx.channels().state(self.channel).await?;
        if state.payer != ctx.signer().address() {
            bail!("{} is not the payer of channel {}", ctx.signer().address(), self.channel);
        }
        if self.value > state.balance {
            bail!("voucher value {} exceeds channel balance {}", self.value, state.balance);
        }
        let voucher = PaymentVoucher::sign(ctx.signer().key(), self.channel, self.value)?;
        println!("{}", voucher.encode()?);
        Ok(())
    }
}

#[derive(Args, Debug)]
struct CloseChannel {
    /// Encoded voucher as printed by `voucher`.
    #[clap(long)]
    voucher: String,
}

impl CloseChannel {
    async fn run(
        &self,
        ctx: &Settlement,
    ) -> Result<()> {
        let voucher = PaymentVoucher::decode(&self.voucher)?;
        let receipt = ctx.channels().close(ctx.signer(), &voucher).await?;
        info!("channel {} closed in {}", voucher.channel, receipt.hash);
        Ok(())
    }
}

#[derive(Args, Debug)]
struct SettleChannel {
    #[clap(long)]
    channel: Address,
    /// Best voucher held, payee side.
    #[clap(long)]
    voucher: Option<String>,
    /// Seconds past expiry the payer leaves the payee to cash a voucher in.
    #[clap(long, default_value_t = 600)]
    margin: u64,
}

impl SettleChannel {
    async fn run(
        &self,
        ctx: &Settlement,
    ) -> Result<()> {
        let voucher = self
            .voucher
            .as_deref()
            .map(PaymentVoucher::decode)
            .transpose()?;
        let action = ctx
            .channels()
            .settle(ctx.signer(), self.channel, voucher.as_ref(), self.margin)
            .await?;
        print_json(&action)
    }
}

#[derive(Args, Debug)]
struct DeployOrder {
    #[clap(long)]
    query: Address,
    #[clap(long = "keeper", required = true)]
    keepers: Vec<Address>,
    #[clap(long = "provider", required = true)]
    providers: Vec<Address>,
    /// Seconds.
    #[clap(long)]
    duration: u64,
    #[clap(long)]
    size: U256,
    #[clap(long)]
    price: U256,
    /// Settlement period, seconds.
    #[clap(long)]
    cycle: u64,
    /// Defaults to size × duration × price.
    #[clap(long)]
    prepaid: Option<U256>,
}

impl DeployOrder {
    async fn run(
        &self,
        ctx: &Settlement,
    ) -> Result<()> {
        let mut terms = OrderTerms {
            query: self.query,
            keepers: self.keepers.clone(),
            providers: self.providers.clone(),
            duration: self.duration,
            size: self.size,
            price: self.price,
            cycle: self.cycle,
            prepaid: U256::ZERO,
        };
        terms.prepaid = self.prepaid.unwrap_or_else(|| terms.committed());

        let orders = ctx.orders();
        let order = orders.deploy(ctx.signer(), &terms).await?;
        print_json(&orders.info(order).await?)
    }
}

#[derive(Args, Debug)]
struct OrderInfo {
    #[clap(long, conflicts_with = "query")]
    order: Option<Address>,
    /// Look the signer's order for this query up instead.
    #[clap(long)]
    query: Option<Address>,
}

impl OrderInfo {
    async fn run(
        &self,
        ctx: &Settlement,
    ) -> Result<()> {
        let orders = ctx.orders();
        let order = match (self.order, self.query) {
            (Some(order), _) => order,
            (None, Some(query)) => orders.find(ctx.signer().address(), query).await?,
            (None, None) => bail!("pass --order or --query"),
        };
        print_json(&orders.info(order).await?)
    }
}

#[derive(Args, Debug)]
struct Propose {
    #[clap(long)]
    order: Address,
    #[clap(long)]
    provider: Address,
    /// Period length in seconds, one cycle by default.
    #[clap(long)]
    length: Option<u64>,
    /// Directory holding one proof blob per block id.
    #[clap(long)]
    blocks: PathBuf,
    #[clap(long = "block", required = true)]
    block_ids: Vec<String>,
    /// Percentages over the provider then each keeper.
    #[clap(long, value_delimiter = ',')]
    share: Option<Vec<u8>>,
    #[clap(long)]
    out: PathBuf,
}

impl Propose {
    async fn run(
        &self,
        ctx: &Settlement,
    ) -> Result<()> {
        let source = DirBlockSource::new(self.blocks.clone());
        let authorization = ctx
            .orders()
            .propose_settlement(
                self.order,
                self.provider,
                self.length,
                &source,
                &self.block_ids,
                self.share.clone(),
            )
            .await?;

        let mut proposal = SettlementProposal::try_from(authorization.clone())?;
        proposal.add_signature(authorization.sign(ctx.signer().key())?);
        proposal.write(&self.out)?;
        info!(
            "proposal for {} written to {}. value: {} root: {}",
            self.provider,
            self.out.display(),
            proposal.value,
            proposal.root
        );
        Ok(())
    }
}

#[derive(Args, Debug)]
struct Cosign {
    #[clap(long)]
    proposal: PathBuf,
    /// Directory holding this keeper's copy of the proven blocks.
    #[clap(long)]
    blocks: PathBuf,
    #[clap(long = "block", required = true)]
    block_ids: Vec<String>,
    /// Expected percentages over the provider then each keeper.
    #[clap(long, value_delimiter = ',')]
    share: Option<Vec<u8>>,
}

impl Cosign {
    async fn run(
        &self,
        ctx: &Settlement,
    ) -> Result<()> {
        let mut proposal = SettlementProposal::read(&self.proposal)?;
        let authorization = proposal.authorization();
        ctx.orders()
            .check_proposal(
                ctx.signer().address(),
                &authorization,
                &DirBlockSource::new(self.blocks.clone()),
                &self.block_ids,
                self.share.clone(),
            )
            .await
            .with_context(|| format!("refusing to co-sign `{}`", self.proposal.display()))?;

        proposal.add_signature(authorization.sign(ctx.signer().key())?);
        proposal.write(&self.proposal)?;
        info!(
            "{} signatures on {}",
            proposal.signatures.len(),
            self.proposal.display()
        );
        Ok(())
    }
}

#[derive(Args, Debug)]
struct Pay {
    #[clap(long)]
    proposal: PathBuf,
}

impl Pay {
    async fn run(
        &self,
        ctx: &Settlement,
    ) -> Result<()> {
        let proposal = SettlementProposal::read(&self.proposal)?;
        let receipt = ctx
            .orders()
            .space_time_pay(ctx.signer(), &proposal.authorization(), &proposal.signatures)
            .await?;
        info!("settled in {}", receipt.hash);
        Ok(())
    }
}

#[derive(Args, Debug)]
struct Destruct {
    #[clap(long)]
    order: Address,
}

impl Destruct {
    async fn run(
        &self,
        ctx: &Settlement,
    ) -> Result<()> {
        ctx.orders().destruct(ctx.signer(), self.order).await?;
        Ok(())
    }
}

#[derive(Args, Debug)]
struct SetRoot {
    #[clap(long)]
    key: i64,
    #[clap(long)]
    root: B256,
}

impl SetRoot {
    async fn run(
        &self,
        ctx: &Settlement,
    ) -> Result<()> {
        let roots = ctx.roots();
        let contract = roots.deploy(ctx.signer()).await?;
        match roots
            .set_root(ctx.signer(), contract, self.key, self.root)
            .await?
        {
            Some(receipt) => info!("root {} published in {}", self.key, receipt.hash),
            None => info!("root {} already published", self.key),
        }
        Ok(())
    }
}

#[derive(Args, Debug)]
struct GetRoot {
    /// Defaults to the signer.
    #[clap(long)]
    owner: Option<Address>,
    #[clap(long)]
    key: Option<i64>,
}

impl GetRoot {
    async fn run(
        &self,
        ctx: &Settlement,
    ) -> Result<()> {
        let roots = ctx.roots();
        let contract = roots
            .find(self.owner.unwrap_or(ctx.signer().address()))
            .await?;
        let (key, root) = match self.key {
            Some(key) => (key, roots.get_root(contract, key).await?),
            None => roots.latest(contract).await?,
        };
        print_json(&serde_json::json!({ "key": key, "root": root }))
    }
}

/// Logs go to stderr so `--json` results on stdout stay parseable.
fn setup_logging(cli: &Cli) -> Result<()> {
    let level = if cli.verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    let (json, compact) = if cli.json {
        let layer = fmt::layer()
            .json()
            .with_current_span(true)
            .with_file(true)
            .with_line_number(true)
            .with_writer(io::stderr);
        (Some(layer), None)
    } else {
        let layer = fmt::layer()
            .compact()
            .with_target(cli.verbose)
            .with_writer(io::stderr);
        (None, Some(layer))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(json)
        .with(compact)
        .try_init()
        .context("setting up logging")
}

/// A panic mid-command may leave a transaction in flight; say which command
/// it was before dying.
fn install_panic_hook(command: &'static str) {
    panic::set_hook(Box::new(move |info| {
        let payload = info.payload();
        let reason = payload
            .downcast_ref::<&str>()
            .copied()
            .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
            .unwrap_or("unknown cause");
        let location = info
            .location()
            .map(|l| format!("{}:{}", l.file(), l.line()))
            .unwrap_or_default();

        error!(
            command,
            location = %location,
            "`{}` panicked: {}. check the signer's pending transactions before rerunning\n{:?}",
            command,
            reason,
            Backtrace::new(),
        );
    }));
}

async fn run(cli: &Cli) -> Result<()> {
    // Key generation needs neither a node nor a configuration.
    if let Command::NewKey(cmd) = &cli.command {
        return cmd.run();
    }

    let config = Config::load(cli.config.clone())?;
    config.validate();
    debug!("Loaded configuration: {:?}", config);

    if let Some(port) = config.prometheus.port {
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(([0, 0, 0, 0], port))
            .install()
            .context("setting up Prometheus")?;
    }

    let ctx = Settlement::connect(&config).await?;
    cli.command.run(&ctx).await
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(&cli)?;
    let name = cli.command.name();
    install_panic_hook(name);
    debug!("mefs-settle {}", env!("CARGO_PKG_VERSION"));

    let metrics = Metrics::new();
    metrics.increment_commands_run(name);
    let started = Instant::now();

    let result = match cli.timeout_secs {
        Some(secs) => with_deadline(Duration::from_secs(secs), run(&cli)).await,
        None => run(&cli).await,
    };
    metrics.observe_command_duration(name, started.elapsed());

    if let Err(err) = &result {
        metrics.increment_commands_failed(name);
        error!("{} failed: {:?}", name, err);
    }
    result
}
