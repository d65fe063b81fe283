//! # SQS-MQ CLI
//!
//! Operator command-line interface for the queues used by `sqs-mq`.
//!
//! This module provides CLI commands for:
//! - Listing, creating, inspecting, purging and deleting queues
//! - Sweeping empty temporary (reply) queues
//! - Sending and receiving single messages
//! - Showing the resolved settings

use clap::{CommandFactory, Parser, Subcommand};
use serde::Serialize;
use sqs_mq::{
    ConfigurationError, Message, MqSettings, ProviderConfig, QueueCache, QueueClientFactory,
    QueueDefinition, QueueError, QueueManager, QueueName, QueueOptions, ReceiveRequest,
    ReceivedMessage, RedrivePolicy, Timestamp, ValidationError,
};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;

// ============================================================================
// CLI Structure
// ============================================================================

/// SQS-MQ CLI - queue administration for sqs-mq deployments
#[derive(Parser)]
#[command(name = "sqs-mq")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Administer the queues behind an sqs-mq message server")]
pub struct Cli {
    /// Settings file path (TOML, YAML or JSON)
    #[arg(short, long, env = "SQS_MQ_CONFIG")]
    pub config: Option<PathBuf>,

    /// Logging level or filter directive
    #[arg(short, long, default_value = "warn")]
    pub log_level: String,

    /// Enable JSON logging
    #[arg(long)]
    pub json_logs: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Queue management commands
    Queues {
        #[command(subcommand)]
        action: QueueCommands,
    },

    /// Send one message to a queue, creating the queue if needed
    Send {
        /// Target queue name
        queue: String,

        /// Message body
        body: String,

        /// Queue the receiver should reply to
        #[arg(short, long)]
        reply_to: Option<String>,

        /// Output format
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// Receive one message from a queue
    Receive {
        /// Source queue name
        queue: String,

        /// Long-poll wait in seconds (at most 20)
        #[arg(short, long, default_value = "0")]
        wait: u32,

        /// Delete the message after printing it
        #[arg(short, long)]
        ack: bool,

        /// Output format
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// Settings commands
    Config {
        #[command(subcommand)]
        action: ConfigCommands,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

/// Queue management subcommands
#[derive(Subcommand)]
pub enum QueueCommands {
    /// List queue URLs
    List {
        /// Only queues whose name starts with this prefix
        #[arg(short, long)]
        prefix: Option<String>,

        /// Output format
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// Create a queue, or update the attributes of an existing one
    Create {
        /// Queue name
        name: String,

        /// Visibility timeout in seconds
        #[arg(long)]
        visibility_timeout: Option<u32>,

        /// Receive wait time in seconds
        #[arg(long)]
        receive_wait: Option<u32>,

        /// ARN of the dead-letter queue
        #[arg(long, requires = "max_receive_count")]
        dead_letter_arn: Option<String>,

        /// Receives before a message moves to the dead-letter queue
        #[arg(long, requires = "dead_letter_arn")]
        max_receive_count: Option<u32>,

        /// Output format
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// Show the attributes of a queue
    Show {
        /// Queue name
        name: String,

        /// Output format
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// Delete a queue
    Delete {
        /// Queue name
        name: String,
    },

    /// Remove every message from a queue
    Purge {
        /// Queue name
        name: String,
    },

    /// Delete empty temporary queues
    CleanupTemp {
        /// Only queues created at least this many seconds ago
        #[arg(long, default_value = "3600")]
        older_than_secs: u64,
    },
}

/// Settings subcommands
#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Print the resolved settings
    Show {
        /// Output format for the settings
        #[arg(short, long, default_value = "toml")]
        format: ConfigFormat,
    },
}

/// Output format options
#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text
    Text,
    /// JSON output
    Json,
}

/// Settings format options
#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum ConfigFormat {
    /// TOML format
    Toml,
    /// YAML format
    Yaml,
    /// JSON format
    Json,
}

// ============================================================================
// CLI Error Types
// ============================================================================

/// CLI-specific errors
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Invalid argument: {arg} - {message}")]
    InvalidArgument { arg: String, message: String },

    #[error("Output error: {message}")]
    Output { message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CliError {
    /// Process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Configuration(_) => 1,
            Self::Queue(e) if e.is_not_found() => 3,
            Self::Queue(_) => 2,
            Self::InvalidArgument { .. } => 4,
            Self::Io(_) => 5,
            Self::Output { .. } => 6,
        }
    }

    fn invalid_argument(arg: &str, error: ValidationError) -> Self {
        Self::InvalidArgument {
            arg: arg.to_string(),
            message: error.to_string(),
        }
    }

    fn output(error: impl std::fmt::Display) -> Self {
        Self::Output {
            message: error.to_string(),
        }
    }
}

// ============================================================================
// Output Types
// ============================================================================

/// Queue attributes as printed by `queues show` and `queues create`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueSummary {
    pub name: String,
    pub url: String,
    pub arn: Option<String>,
    pub visibility_timeout: u32,
    pub receive_wait_time: u32,
    pub approximate_number_of_messages: u64,
    pub created_timestamp: i64,
    pub redrive_policy: Option<RedrivePolicy>,
    pub temporary: bool,
}

impl From<&QueueDefinition> for QueueSummary {
    fn from(definition: &QueueDefinition) -> Self {
        Self {
            name: definition.queue_name.to_string(),
            url: definition.queue_url.clone(),
            arn: definition.queue_arn.clone(),
            visibility_timeout: definition.visibility_timeout,
            receive_wait_time: definition.receive_wait_time,
            approximate_number_of_messages: definition.approximate_number_of_messages,
            created_timestamp: definition.created_timestamp,
            redrive_policy: definition.redrive_policy.clone(),
            temporary: definition.is_temporary(),
        }
    }
}

/// A received message as printed by `receive`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReceivedSummary {
    pub message_id: String,
    pub body: String,
    pub reply_to: Option<String>,
    pub receive_count: u32,
    pub sent_at: String,
    pub acknowledged: bool,
}

impl ReceivedSummary {
    fn new(message: &ReceivedMessage, acknowledged: bool) -> Self {
        Self {
            message_id: message.message_id.to_string(),
            body: String::from_utf8_lossy(&message.body).into_owned(),
            reply_to: message.reply_to.as_ref().map(ToString::to_string),
            receive_count: message.receive_count,
            sent_at: message.sent_at.to_string(),
            acknowledged,
        }
    }
}

fn write_json<T: Serialize>(out: &mut impl Write, value: &T) -> Result<(), CliError> {
    let json = serde_json::to_string_pretty(value).map_err(CliError::output)?;
    writeln!(out, "{}", json)?;
    Ok(())
}

fn write_queue_summary(
    out: &mut impl Write,
    summary: &QueueSummary,
    format: OutputFormat,
) -> Result<(), CliError> {
    if format == OutputFormat::Json {
        return write_json(out, summary);
    }

    writeln!(out, "name:                {}", summary.name)?;
    writeln!(out, "url:                 {}", summary.url)?;
    writeln!(out, "arn:                 {}", summary.arn.as_deref().unwrap_or("-"))?;
    writeln!(out, "visibility timeout:  {}s", summary.visibility_timeout)?;
    writeln!(out, "receive wait time:   {}s", summary.receive_wait_time)?;
    writeln!(out, "messages:            {}", summary.approximate_number_of_messages)?;
    match Timestamp::from_epoch_seconds(summary.created_timestamp) {
        Some(created) => writeln!(out, "created:             {}", created)?,
        None => writeln!(out, "created:             -")?,
    }
    match &summary.redrive_policy {
        Some(policy) => writeln!(
            out,
            "dead-letter target:  {} (after {} receives)",
            policy.dead_letter_target_arn, policy.max_receive_count
        )?,
        None => writeln!(out, "dead-letter target:  -")?,
    }
    if summary.temporary {
        writeln!(out, "temporary:           yes")?;
    }
    Ok(())
}

// ============================================================================
// Main Entry Point
// ============================================================================

/// Main CLI entry point
pub async fn run_cli() -> Result<(), CliError> {
    let cli = Cli::parse();

    initialize_logging(&cli)?;

    let settings = MqSettings::load(cli.config.as_deref())?;
    debug!(provider = ?settings.provider.provider_type(), "Loaded settings");

    execute_command(cli.command, &settings, &mut std::io::stdout()).await
}

/// Initialize logging based on CLI arguments. Logs go to stderr so command
/// output stays machine-readable.
pub fn initialize_logging(cli: &Cli) -> Result<(), CliError> {
    let filter = EnvFilter::try_new(&cli.log_level).map_err(|e| CliError::InvalidArgument {
        arg: "log-level".to_string(),
        message: e.to_string(),
    })?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    let result = if cli.json_logs {
        builder.json().try_init()
    } else {
        builder.try_init()
    };

    // A subscriber installed earlier (tests, embedding) stays in place.
    if let Err(e) = result {
        debug!(error = %e, "Logging already initialised");
    }
    Ok(())
}

/// Execute `command` against the provider named in `settings`
pub async fn execute_command(
    command: Commands,
    settings: &MqSettings,
    out: &mut impl Write,
) -> Result<(), CliError> {
    match command {
        Commands::Config { action } => execute_config_command(action, settings, out),
        Commands::Completions { shell } => {
            clap_complete::generate(shell, &mut Cli::command(), "sqs-mq", out);
            Ok(())
        }
        command => {
            let client = QueueClientFactory::create_client(&settings.provider)?;
            let manager =
                QueueManager::with_cache(client, QueueCache::new(), settings.queues.clone());
            execute_queue_command(command, &manager, out).await
        }
    }
}

/// Execute a command that talks to the remote service through `manager`
pub async fn execute_queue_command(
    command: Commands,
    manager: &QueueManager,
    out: &mut impl Write,
) -> Result<(), CliError> {
    match command {
        Commands::Queues { action } => execute_queues_command(action, manager, out).await,
        Commands::Send {
            queue,
            body,
            reply_to,
            format,
        } => execute_send_command(manager, &queue, body, reply_to, format, out).await,
        Commands::Receive {
            queue,
            wait,
            ack,
            format,
        } => execute_receive_command(manager, &queue, wait, ack, format, out).await,
        Commands::Config { .. } | Commands::Completions { .. } => Err(CliError::InvalidArgument {
            arg: "command".to_string(),
            message: "does not use the queue service".to_string(),
        }),
    }
}

// ============================================================================
// Command Implementations
// ============================================================================

fn parse_queue_name(arg: &str, value: &str) -> Result<QueueName, CliError> {
    QueueName::new(value).map_err(|e| CliError::invalid_argument(arg, e))
}

async fn execute_queues_command(
    action: QueueCommands,
    manager: &QueueManager,
    out: &mut impl Write,
) -> Result<(), CliError> {
    match action {
        QueueCommands::List { prefix, format } => {
            info!(prefix = ?prefix, "Listing queues");
            let urls = manager.list_queues(prefix.as_deref()).await?;
            match format {
                OutputFormat::Json => write_json(out, &urls)?,
                OutputFormat::Text if urls.is_empty() => writeln!(out, "no queues")?,
                OutputFormat::Text => {
                    for url in &urls {
                        writeln!(out, "{}", url)?;
                    }
                }
            }
            Ok(())
        }
        QueueCommands::Create {
            name,
            visibility_timeout,
            receive_wait,
            dead_letter_arn,
            max_receive_count,
            format,
        } => {
            let name = parse_queue_name("name", &name)?;
            let mut options = QueueOptions::default();
            if let Some(seconds) = visibility_timeout {
                options = options.with_visibility_timeout(seconds);
            }
            if let Some(seconds) = receive_wait {
                options = options.with_receive_wait_time(seconds);
            }
            if let (Some(arn), Some(count)) = (dead_letter_arn, max_receive_count) {
                options = options.with_redrive_policy(RedrivePolicy::new(arn, count));
            }

            info!(queue = %name, "Creating queue");
            let definition = manager.create_queue(&name, &options).await?;
            write_queue_summary(out, &QueueSummary::from(definition.as_ref()), format)
        }
        QueueCommands::Show { name, format } => {
            let name = parse_queue_name("name", &name)?;
            let definition = manager.get_queue_definition(&name, true).await?;
            write_queue_summary(out, &QueueSummary::from(definition.as_ref()), format)
        }
        QueueCommands::Delete { name } => {
            let name = parse_queue_name("name", &name)?;
            // Fail loudly on unknown queues; the manager's delete is quiet.
            manager.get_queue_url(&name, true).await?;
            manager.delete_queue(&name).await?;
            info!(queue = %name, "Deleted queue");
            writeln!(out, "deleted {}", name)?;
            Ok(())
        }
        QueueCommands::Purge { name } => {
            let name = parse_queue_name("name", &name)?;
            manager.get_queue_url(&name, true).await?;
            manager.purge_queue(&name).await?;
            info!(queue = %name, "Purged queue");
            writeln!(out, "purged {}", name)?;
            Ok(())
        }
        QueueCommands::CleanupTemp { older_than_secs } => {
            let older_than = i64::try_from(older_than_secs).unwrap_or(i64::MAX);
            // Created at or before now - older_than.
            let cutoff = Timestamp::now()
                .epoch_seconds()
                .saturating_sub(older_than)
                .saturating_add(1);
            let removed = manager.remove_empty_temporary_queues(cutoff).await?;
            info!(removed = removed, "Removed temporary queues");
            writeln!(out, "removed {} temporary queue(s)", removed)?;
            Ok(())
        }
    }
}

async fn execute_send_command(
    manager: &QueueManager,
    queue: &str,
    body: String,
    reply_to: Option<String>,
    format: OutputFormat,
    out: &mut impl Write,
) -> Result<(), CliError> {
    let queue = parse_queue_name("queue", queue)?;
    let mut message = Message::new(body);
    if let Some(reply_to) = reply_to {
        message = message.with_reply_to(parse_queue_name("reply-to", &reply_to)?);
    }

    let definition = manager.get_or_create(&queue).await?;
    let message_id = manager
        .client()
        .send_message(&definition.queue_url, &message)
        .await?;
    info!(queue = %queue, message_id = %message_id, "Sent message");

    match format {
        OutputFormat::Json => write_json(
            out,
            &serde_json::json!({ "queue": queue.as_str(), "message_id": message_id.as_str() }),
        ),
        OutputFormat::Text => {
            writeln!(out, "{}", message_id)?;
            Ok(())
        }
    }
}

async fn execute_receive_command(
    manager: &QueueManager,
    queue: &str,
    wait: u32,
    ack: bool,
    format: OutputFormat,
    out: &mut impl Write,
) -> Result<(), CliError> {
    let queue = parse_queue_name("queue", queue)?;
    let url = manager.get_queue_url(&queue, false).await?;
    let client: &Arc<dyn sqs_mq::SqsClient> = manager.client();

    let request = ReceiveRequest::new(1).with_wait_time(wait);
    let message = client.receive_messages(&url, &request).await?.into_iter().next();

    let Some(message) = message else {
        match format {
            OutputFormat::Json => write_json(out, &Option::<ReceivedSummary>::None)?,
            OutputFormat::Text => writeln!(out, "no message")?,
        }
        return Ok(());
    };

    if ack {
        client.delete_message(&url, &message.receipt_handle).await?;
        debug!(queue = %queue, message_id = %message.message_id, "Acknowledged message");
    }

    let summary = ReceivedSummary::new(&message, ack);
    match format {
        OutputFormat::Json => write_json(out, &summary),
        OutputFormat::Text => {
            writeln!(out, "message id:    {}", summary.message_id)?;
            writeln!(out, "sent:          {}", summary.sent_at)?;
            writeln!(out, "receive count: {}", summary.receive_count)?;
            if let Some(reply_to) = &summary.reply_to {
                writeln!(out, "reply to:      {}", reply_to)?;
            }
            writeln!(out, "acknowledged:  {}", if ack { "yes" } else { "no" })?;
            writeln!(out)?;
            writeln!(out, "{}", summary.body)?;
            Ok(())
        }
    }
}

fn execute_config_command(
    action: ConfigCommands,
    settings: &MqSettings,
    out: &mut impl Write,
) -> Result<(), CliError> {
    match action {
        ConfigCommands::Show { format } => {
            let shown = redact_secrets(settings);
            let rendered = match format {
                ConfigFormat::Toml => toml::to_string_pretty(&shown).map_err(CliError::output)?,
                ConfigFormat::Yaml => serde_yaml::to_string(&shown).map_err(CliError::output)?,
                ConfigFormat::Json => {
                    serde_json::to_string_pretty(&shown).map_err(CliError::output)?
                }
            };
            writeln!(out, "{}", rendered.trim_end())?;
            Ok(())
        }
    }
}

/// Copy of `settings` with credentials masked
pub fn redact_secrets(settings: &MqSettings) -> MqSettings {
    let mut shown = settings.clone();
    if let ProviderConfig::AwsSqs(aws) = &mut shown.provider {
        if aws.secret_access_key.is_some() {
            aws.secret_access_key = Some("<redacted>".to_string());
        }
    }
    shown
}
