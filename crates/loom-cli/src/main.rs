use clap::{ArgAction, Parser, Subcommand};
use loom_agent::{
    AgentError, ConversationRunner, EventSink, PollerConfig, ProgressEvent, ProgressEventKind,
    build_filesystem_tool_registry,
};
use loom_llm::{AgentDefinition, ProviderRegistry, default_factories};
use serde::Deserialize;
use std::io::{BufRead, IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "loom-cli")]
#[command(about = "In-process CLI host for Loom run orchestration")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List providers configured from the environment.
    Providers,
    /// Send one message, or chat interactively, with a named agent.
    Chat(ChatArgs),
}

#[derive(clap::Args, Debug)]
struct ChatArgs {
    #[arg(long)]
    agents_file: PathBuf,
    #[arg(long)]
    agent: String,
    #[arg(long)]
    provider: Option<String>,
    #[arg(long, default_value = "cli")]
    session: String,
    /// Message to send; reads turns from stdin when omitted.
    #[arg(long)]
    message: Option<String>,
    /// Workspace root for the filesystem tools.
    #[arg(long, default_value = ".")]
    root: PathBuf,
    #[arg(long)]
    max_iterations: Option<usize>,
    #[arg(long = "no-stream-events", action = ArgAction::SetTrue)]
    no_stream_events: bool,
    #[arg(long, action = ArgAction::SetTrue)]
    event_json: bool,
}

/// Agent entry of the `--agents-file` JSON array.
#[derive(Debug, Deserialize)]
struct AgentSpec {
    name: String,
    instructions: String,
    #[serde(default)]
    tools: Vec<String>,
    model: String,
    #[serde(default)]
    remote_id: Option<String>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    init_tracing();

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Providers => providers_command().await,
        Commands::Chat(args) => chat_command(args).await,
    };

    match result {
        Ok(code) => code,
        Err(error) => {
            eprintln!("error: {error}");
            ExitCode::from(1)
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("LOOM_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

async fn providers_command() -> Result<ExitCode, String> {
    let registry = ProviderRegistry::from_factories(&default_factories());
    let names = registry.names();
    if names.is_empty() {
        println!("no providers configured");
        return Ok(ExitCode::SUCCESS);
    }
    for name in names {
        let adapter = registry
            .resolve(Some(name.as_str()))
            .map_err(|error| error.to_string())?;
        let state = if adapter.is_configured().await {
            "ready"
        } else {
            "unavailable"
        };
        let marker = if registry.default_provider() == Some(name.as_str()) {
            " (default)"
        } else {
            ""
        };
        println!("{name}{marker}: {state}");
    }
    Ok(ExitCode::SUCCESS)
}

async fn chat_command(args: ChatArgs) -> Result<ExitCode, String> {
    let specs = load_agent_specs(&args.agents_file)?;
    let spec = specs
        .into_iter()
        .find(|spec| spec.name == args.agent)
        .ok_or_else(|| {
            format!(
                "agent '{}' not found in '{}'",
                args.agent,
                args.agents_file.display()
            )
        })?;

    let tools = Arc::new(build_filesystem_tool_registry(&args.root));
    let agent = AgentDefinition {
        tools: tools
            .definitions_for(spec.tools.as_slice())
            .map_err(|error| error.to_string())?,
        name: spec.name,
        instructions: spec.instructions,
        model: spec.model,
        remote_id: spec.remote_id,
    };

    let registry = ProviderRegistry::from_factories(&default_factories());
    let adapter = registry
        .resolve(args.provider.as_deref())
        .map_err(|error| error.to_string())?;
    debug!(provider = adapter.name(), agent = %agent.name, "chat starting");

    let mut config = PollerConfig::default();
    if let Some(max_iterations) = args.max_iterations {
        config.max_iterations = max_iterations;
    }
    let runner = ConversationRunner::new(adapter, tools).with_config(config);
    let sink: Arc<dyn EventSink> = Arc::new(ConsoleEventSink {
        enabled: !args.no_stream_events,
        json: args.event_json,
    });

    if let Some(message) = args.message {
        return run_turn(&runner, &args.session, &agent, &message, &sink).await;
    }

    let interactive = std::io::stdin().is_terminal();
    let mut exit = ExitCode::SUCCESS;
    let mut lines = std::io::stdin().lock().lines();
    loop {
        if interactive {
            print!("> ");
            std::io::stdout()
                .flush()
                .map_err(|error| error.to_string())?;
        }
        let Some(line) = lines.next() else {
            break;
        };
        let line = line.map_err(|error| format!("failed reading stdin: {error}"))?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if matches!(line, "/exit" | "/quit") {
            break;
        }
        exit = run_turn(&runner, &args.session, &agent, line, &sink).await?;
    }
    Ok(exit)
}

fn load_agent_specs(path: &Path) -> Result<Vec<AgentSpec>, String> {
    let source = std::fs::read_to_string(path)
        .map_err(|e| format!("failed reading agents file '{}': {e}", path.display()))?;
    serde_json::from_str(&source)
        .map_err(|e| format!("invalid agents file '{}': {e}", path.display()))
}

async fn run_turn(
    runner: &ConversationRunner,
    session_id: &str,
    agent: &AgentDefinition,
    message: &str,
    sink: &Arc<dyn EventSink>,
) -> Result<ExitCode, String> {
    match runner
        .send_message(session_id, agent, message, sink.clone(), None)
        .await
    {
        Ok(completion) => {
            println!("{}", completion.message);
            let usage = completion.token_usage;
            println!(
                "tokens: prompt={} completion={} total={}",
                usage.prompt_tokens, usage.completion_tokens, usage.total_tokens
            );
            Ok(ExitCode::SUCCESS)
        }
        Err(error @ AgentError::Provider(_)) => Err(error.user_facing_message()),
        Err(error) => {
            eprintln!("{}", error.user_facing_message());
            Ok(ExitCode::from(2))
        }
    }
}

/// Prints progress events to stdout as they arrive.
struct ConsoleEventSink {
    enabled: bool,
    json: bool,
}

impl EventSink for ConsoleEventSink {
    fn emit(&self, event: &ProgressEvent) -> Result<(), AgentError> {
        if !self.enabled {
            return Ok(());
        }
        if self.json {
            let line = serde_json::to_string(event)
                .map_err(|error| AgentError::Event(error.to_string()))?;
            println!("{line}");
        } else {
            println!("[event] {}", event_text(&event.kind));
        }
        Ok(())
    }
}

fn event_text(kind: &ProgressEventKind) -> String {
    match kind {
        ProgressEventKind::AssistantMessage { message_id, .. } => {
            format!("assistant_message {message_id}")
        }
        ProgressEventKind::ToolCallsRequested { calls, .. } => {
            format!("tool_calls_requested count={}", calls.len())
        }
        ProgressEventKind::ActionStart { function, .. } => format!("action_start {function}"),
        ProgressEventKind::ToolCallResult {
            function,
            success,
            execution_time_ms,
            ..
        } => format!("tool_call_result {function} success={success} ms={execution_time_ms}"),
        ProgressEventKind::ActionComplete { status, .. } => format!("action_complete {status}"),
    }
}
