use std::env;
use std::fmt;
use std::fs;
use std::io::{self, IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use log::{LevelFilter, debug, info, warn};

use parley::{
    ChatClient, ClientConfig, Credentials, HistoryQuery, Identified, Message, Snowflake,
};

const APP_NAME: &str = "parley";

fn main() {
    if let Err(err) = try_main() {
        let _ = writeln!(io::stderr(), "{err:?}");
        std::process::exit(1);
    }
}

#[tokio::main]
async fn async_main(ctx: RuntimeContext, cmd: Command) -> Result<()> {
    let client = ctx.client()?;
    match cmd {
        Command::Channels => handle_channels(&ctx, &client).await,
        Command::Channel { id } => handle_channel(&ctx, &client, id).await,
        Command::CreateChannel(cmd) => handle_create_channel(&ctx, &client, cmd).await,
        Command::History(cmd) => handle_history(&ctx, &client, cmd).await,
        Command::Send { channel_id, content } => {
            handle_send(&ctx, &client, channel_id, &content).await
        }
        Command::Follow { channel_id } => handle_follow(&ctx, &client, channel_id).await,
        Command::Register { username } => handle_register(&ctx, &client, &username).await,
        Command::Whoami => handle_whoami(&ctx, &client).await,
        Command::Config { .. } | Command::Completions { .. } => Ok(()),
    }
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();

    let ctx = RuntimeContext::new(cli.common.clone())?;
    ctx.init_logging()?;
    debug!("resolved paths: {}", ctx.paths);

    match cli.command {
        Command::Config { command } => handle_config(&ctx, command),
        Command::Completions { shell } => handle_completions(shell),
        cmd => async_main(ctx, cmd),
    }
}

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Parley - command-line client for the parley chat service.",
    propagate_version = true
)]
struct Cli {
    #[command(flatten)]
    common: CommonOpts,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Args)]
struct CommonOpts {
    /// Override the config file path
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,
    /// Override the service base URL
    #[arg(long, value_name = "URL", global = true)]
    server: Option<String>,
    /// Account name used to log in
    #[arg(long, env = "PARLEY_USERNAME", global = true)]
    username: Option<String>,
    /// Account password used to log in
    #[arg(long, env = "PARLEY_PASSWORD", hide_env_values = true, global = true)]
    password: Option<String>,
    /// Reduce output to only errors
    #[arg(short, long, action = clap::ArgAction::SetTrue, global = true)]
    quiet: bool,
    /// Increase logging verbosity (stackable)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Enable debug logging (equivalent to -vv)
    #[arg(long, global = true)]
    debug: bool,
    /// Enable trace logging (overrides other levels)
    #[arg(long, global = true)]
    trace: bool,
    /// Output machine readable JSON
    #[arg(long, global = true)]
    json: bool,
    /// Disable ANSI colors in output
    #[arg(long = "no-color", global = true, conflicts_with = "color")]
    no_color: bool,
    /// Control color output (auto, always, never)
    #[arg(long, value_enum, default_value_t = ColorOption::Auto, global = true)]
    color: ColorOption,
    /// Do not change anything on disk
    #[arg(long = "dry-run", global = true)]
    dry_run: bool,
    /// Maximum seconds to allow a request to run
    #[arg(long = "timeout", value_name = "SECONDS", global = true)]
    timeout: Option<u64>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ColorOption {
    Auto,
    Always,
    Never,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List all channels
    Channels,
    /// Show one channel
    Channel {
        /// Channel ID
        id: Snowflake,
    },
    /// Create a channel
    CreateChannel(CreateChannelCommand),
    /// Print a window of a channel's history
    History(HistoryCommand),
    /// Post a message to a channel
    Send {
        /// Channel ID
        channel_id: Snowflake,
        /// Message text
        content: String,
    },
    /// Print new messages in a channel as they arrive
    Follow {
        /// Channel ID
        channel_id: Snowflake,
    },
    /// Create an account (password from --password or PARLEY_PASSWORD)
    Register {
        /// Account name
        username: String,
    },
    /// Log in and show the current user
    Whoami,
    /// Inspect and manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Debug, Clone, Args)]
struct CreateChannelCommand {
    /// Channel name
    name: String,
    /// Channel description
    #[arg(long, default_value = "")]
    description: String,
}

#[derive(Debug, Clone, Args)]
struct HistoryCommand {
    /// Channel ID
    channel_id: Snowflake,
    /// Maximum number of messages
    #[arg(long, default_value_t = 50)]
    limit: u32,
    /// Walk up from the oldest message instead of down from the newest
    #[arg(long)]
    oldest: bool,
    /// Only messages with an ID at or below this one
    #[arg(long, value_name = "ID")]
    before: Option<Snowflake>,
    /// Only messages with an ID at or above this one
    #[arg(long, value_name = "ID")]
    after: Option<Snowflake>,
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    /// Output the effective configuration
    Show,
    /// Print the resolved config file path
    Path,
    /// Regenerate the default configuration file
    Reset,
}

#[derive(Debug, Clone)]
struct RuntimeContext {
    common: CommonOpts,
    paths: AppPaths,
    config: ClientConfig,
}

impl RuntimeContext {
    fn new(common: CommonOpts) -> Result<Self> {
        let paths = AppPaths::discover(common.config.clone())?;
        let mut config = load_or_init_config(&paths, &common)?;
        if let Some(ref server) = common.server {
            config.base_url = server.clone();
        }
        if let Some(timeout) = common.timeout {
            config.request_timeout_secs = timeout;
        }
        Ok(Self {
            common,
            paths,
            config,
        })
    }

    fn init_logging(&self) -> Result<()> {
        use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

        if self.common.quiet {
            log::set_max_level(LevelFilter::Off);
            return Ok(());
        }

        let level = match self.effective_log_level() {
            LevelFilter::Off => "off",
            LevelFilter::Error => "error",
            LevelFilter::Warn => "warn",
            LevelFilter::Info => "info",
            LevelFilter::Debug => "debug",
            LevelFilter::Trace => "trace",
        };

        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(format!("parley={level}")));

        // Logs go to stderr so stdout stays parseable with --json
        if self.common.json {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json().with_writer(io::stderr))
                .try_init()
                .ok();
        } else {
            let force_color = matches!(self.common.color, ColorOption::Always)
                || env::var_os("FORCE_COLOR").is_some();
            let disable_color = self.common.no_color
                || matches!(self.common.color, ColorOption::Never)
                || env::var_os("NO_COLOR").is_some()
                || (!force_color && !io::stderr().is_terminal());

            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(io::stderr)
                        .with_ansi(!disable_color)
                        .with_target(false),
                )
                .try_init()
                .ok();
        }

        // Library modules log through the `log` facade
        let mut builder =
            env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"));
        builder.filter_module(APP_NAME, self.effective_log_level());
        builder.try_init().ok();

        Ok(())
    }

    fn effective_log_level(&self) -> LevelFilter {
        if self.common.trace {
            LevelFilter::Trace
        } else if self.common.debug {
            LevelFilter::Debug
        } else {
            match self.common.verbose {
                0 => LevelFilter::Warn,
                1 => LevelFilter::Info,
                2 => LevelFilter::Debug,
                _ => LevelFilter::Trace,
            }
        }
    }

    fn client(&self) -> Result<ChatClient> {
        ChatClient::new(self.config.clone())
            .with_context(|| format!("creating client for {}", self.config.base_url))
    }

    fn credentials(&self) -> Option<Credentials> {
        match (&self.common.username, &self.common.password) {
            (Some(username), Some(password)) => Some(Credentials::new(username, password)),
            _ => None,
        }
    }

    /// Log in when credentials were given; anonymous otherwise.
    async fn login(&self, client: &ChatClient) -> Result<()> {
        if let Some(credentials) = self.credentials() {
            let user = client
                .login(credentials)
                .await
                .context("logging in")?;
            info!("logged in as {}", user.username);
        }
        Ok(())
    }

    fn print_json<T: serde::Serialize + ?Sized>(&self, value: &T) -> Result<()> {
        println!(
            "{}",
            serde_json::to_string_pretty(value).context("serializing output to JSON")?
        );
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct AppPaths {
    config_file: PathBuf,
}

impl AppPaths {
    fn discover(override_path: Option<PathBuf>) -> Result<Self> {
        let config_file = match override_path {
            Some(path) => {
                let expanded = expand_path(path)?;
                if expanded.is_dir() {
                    expanded.join("config.toml")
                } else {
                    expanded
                }
            }
            None => default_config_dir()?.join("config.toml"),
        };

        if config_file.parent().is_none() {
            return Err(anyhow!("invalid config file path: {config_file:?}"));
        }

        Ok(Self { config_file })
    }
}

impl fmt::Display for AppPaths {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "config: {}", self.config_file.display())
    }
}

async fn handle_channels(ctx: &RuntimeContext, client: &ChatClient) -> Result<()> {
    ctx.login(client).await?;
    let channels = client.query_channels().await.context("listing channels")?;
    if ctx.common.json {
        let list: Vec<&parley::Channel> = channels.iter().map(|c| c.as_ref()).collect();
        return ctx.print_json(&list);
    }
    for channel in channels.iter() {
        if channel.description.is_empty() {
            println!("{}\t#{}", channel.id, channel.name);
        } else {
            println!("{}\t#{}\t{}", channel.id, channel.name, channel.description);
        }
    }
    Ok(())
}

async fn handle_channel(ctx: &RuntimeContext, client: &ChatClient, id: Snowflake) -> Result<()> {
    ctx.login(client).await?;
    let channel = client
        .fetch_channel(id)
        .await
        .with_context(|| format!("fetching channel {id}"))?;
    if ctx.common.json {
        return ctx.print_json(channel.as_ref());
    }
    let epoch_loaded = load_epoch(ctx, client).await;
    println!("#{} ({})", channel.name, channel.id);
    if !channel.description.is_empty() {
        println!("{}", channel.description);
    }
    println!("owner: {}", channel.owner.username);
    if epoch_loaded {
        println!("created: {}", client.created_at(channel.as_ref()));
    }
    Ok(())
}

async fn handle_create_channel(
    ctx: &RuntimeContext,
    client: &ChatClient,
    cmd: CreateChannelCommand,
) -> Result<()> {
    ctx.login(client).await?;
    let channel = client
        .create_channel(&cmd.name, &cmd.description)
        .await
        .with_context(|| format!("creating channel {}", cmd.name))?;
    if ctx.common.json {
        return ctx.print_json(&channel);
    }
    println!("{}\t#{}", channel.id, channel.name);
    Ok(())
}

async fn handle_history(
    ctx: &RuntimeContext,
    client: &ChatClient,
    cmd: HistoryCommand,
) -> Result<()> {
    ctx.login(client).await?;

    let mut query = if cmd.oldest {
        HistoryQuery::oldest(cmd.limit)
    } else {
        HistoryQuery::newest(cmd.limit)
    };
    if let Some(before) = cmd.before {
        query = query.before(before);
    }
    if let Some(after) = cmd.after {
        query = query.after(after);
    }

    let messages = client
        .history(cmd.channel_id, query)
        .await
        .with_context(|| format!("fetching history of channel {}", cmd.channel_id))?;
    if ctx.common.json {
        return ctx.print_json(&messages);
    }

    let epoch_loaded = load_epoch(ctx, client).await;
    for message in &messages {
        print_message(client, message, epoch_loaded);
    }
    Ok(())
}

async fn handle_send(
    ctx: &RuntimeContext,
    client: &ChatClient,
    channel_id: Snowflake,
    content: &str,
) -> Result<()> {
    ctx.login(client).await?;
    let message = client
        .send_message(channel_id, content)
        .await
        .with_context(|| format!("sending message to channel {channel_id}"))?;
    if ctx.common.json {
        return ctx.print_json(&message);
    }
    println!("{}", message.id);
    Ok(())
}

async fn handle_follow(
    ctx: &RuntimeContext,
    client: &ChatClient,
    channel_id: Snowflake,
) -> Result<()> {
    ctx.login(client).await?;
    let epoch_loaded = load_epoch(ctx, client).await;

    let json = ctx.common.json;
    let printer = client.clone();
    let feed = client
        .subscribe(channel_id, move |message| {
            if json {
                match serde_json::to_string(&message) {
                    Ok(line) => println!("{line}"),
                    Err(e) => warn!("failed to serialize message {}: {}", message.id, e),
                }
            } else {
                print_message(&printer, &message, epoch_loaded);
            }
        })
        .await
        .with_context(|| format!("subscribing to channel {channel_id}"))?;
    info!("following channel {} (Ctrl-C to stop)", channel_id);

    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl-C")?;
    feed.shutdown().await.context("closing feed")?;
    Ok(())
}

async fn handle_register(ctx: &RuntimeContext, client: &ChatClient, username: &str) -> Result<()> {
    let password = ctx
        .common
        .password
        .as_deref()
        .ok_or_else(|| anyhow!("a password is required (--password or PARLEY_PASSWORD)"))?;
    let status = client.register(username, password).await;
    if ctx.common.json {
        ctx.print_json(&status)?;
    } else {
        println!("{}", status.message);
    }
    if status.success {
        Ok(())
    } else {
        Err(anyhow!("registration failed: {}", status.message))
    }
}

async fn handle_whoami(ctx: &RuntimeContext, client: &ChatClient) -> Result<()> {
    if ctx.credentials().is_none() {
        return Err(anyhow!(
            "credentials are required (--username/--password or PARLEY_USERNAME/PARLEY_PASSWORD)"
        ));
    }
    ctx.login(client).await?;
    let user = client
        .current_user()
        .await
        .ok_or_else(|| anyhow!("no current user after login"))?;
    if ctx.common.json {
        return ctx.print_json(&user);
    }
    println!("{} ({})", user.username, user.id);
    println!("permissions: {:#x}", user.permissions);
    Ok(())
}

fn handle_config(ctx: &RuntimeContext, command: ConfigCommand) -> Result<()> {
    match command {
        ConfigCommand::Show => {
            if ctx.common.json {
                ctx.print_json(&ctx.config)?;
            } else {
                print!(
                    "{}",
                    toml::to_string_pretty(&ctx.config).context("serializing config to TOML")?
                );
            }
            Ok(())
        }
        ConfigCommand::Path => {
            println!("{}", ctx.paths.config_file.display());
            Ok(())
        }
        ConfigCommand::Reset => {
            if ctx.common.dry_run {
                info!(
                    "dry-run: would reset config at {}",
                    ctx.paths.config_file.display()
                );
                return Ok(());
            }
            write_default_config(&ctx.paths.config_file)
        }
    }
}

fn handle_completions(shell: Shell) -> Result<()> {
    let mut cmd = Cli::command();
    clap_complete::generate(shell, &mut cmd, APP_NAME, &mut io::stdout());
    Ok(())
}

/// Load the service epoch, giving up after one request timeout.
async fn load_epoch(ctx: &RuntimeContext, client: &ChatClient) -> bool {
    let wait = Duration::from_secs(ctx.config.request_timeout_secs.max(1));
    match tokio::time::timeout(wait, client.load_epoch()).await {
        Ok(_) => true,
        Err(_) => {
            warn!("service epoch unavailable, timestamps omitted");
            false
        }
    }
}

fn print_message(client: &ChatClient, message: &Message, with_time: bool) {
    if with_time {
        println!(
            "[{}] {}: {}",
            message.created_at(client.epoch()).format("%Y-%m-%d %H:%M:%S"),
            message.author.username,
            message.content
        );
    } else {
        println!("{}: {}", message.author.username, message.content);
    }
}

fn load_or_init_config(paths: &AppPaths, common: &CommonOpts) -> Result<ClientConfig> {
    if !paths.config_file.exists() {
        if common.dry_run {
            info!(
                "dry-run: would create default config at {}",
                paths.config_file.display()
            );
        } else if let Err(e) = write_default_config(&paths.config_file) {
            // A read-only home must not stop the client from running.
            warn!("{e:#}");
        }
    }

    ClientConfig::load(Some(paths.config_file.as_path()))
        .with_context(|| format!("loading config from {}", paths.config_file.display()))
}

fn write_default_config(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating config directory {parent:?}"))?;
    }

    let config = ClientConfig::default();
    let toml = toml::to_string_pretty(&config).context("serializing default config to TOML")?;
    let mut body = default_config_header(path);
    body.push_str(&toml);
    fs::write(path, body).with_context(|| format!("writing config file to {}", path.display()))
}

fn default_config_header(path: &Path) -> String {
    let mut buffer = String::new();
    buffer.push_str("# Configuration for ");
    buffer.push_str(APP_NAME);
    buffer.push('\n');
    buffer.push_str("# File: ");
    buffer.push_str(&path.display().to_string());
    buffer.push('\n');
    buffer.push_str("# Environment overrides: PARLEY__<KEY>, e.g. PARLEY__FEED__MAX_BACKOFF_MS\n");
    buffer.push('\n');
    buffer
}

fn expand_path(path: PathBuf) -> Result<PathBuf> {
    if let Some(text) = path.to_str() {
        expand_str_path(text)
    } else {
        Ok(path)
    }
}

fn expand_str_path(text: &str) -> Result<PathBuf> {
    let expanded = shellexpand::full(text).context("expanding path")?;
    Ok(PathBuf::from(expanded.to_string()))
}

fn default_config_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_CONFIG_HOME").filter(|v| !v.is_empty()) {
        let mut path = PathBuf::from(dir);
        path.push(APP_NAME);
        return Ok(path);
    }

    if let Some(mut dir) = dirs::config_dir() {
        dir.push(APP_NAME);
        return Ok(dir);
    }

    dirs::home_dir()
        .map(|home| home.join(".config").join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine configuration directory"))
}
