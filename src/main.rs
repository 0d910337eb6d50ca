//! pyagent command line: run one request against the agent loop and print
//! the streamed response

use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use futures_util::StreamExt;
use tracing::info;
use uuid::Uuid;

use pyagent::agent::SessionStore;
use pyagent::artifact::{DirectoryImageHost, HttpImageHost, ImageHost};
use pyagent::config::Settings;
use pyagent::fetch::HttpFetcher;
use pyagent::ollama::ChatClient;
use pyagent::protocol::{QueryRequest, ResponseEvent, Turn};
use pyagent::sandbox::ProcessSandbox;
use pyagent::storage::{LocalVolumes, VolumeProvider};
use pyagent::{metrics, telemetry, AgentController};

#[derive(Parser, Debug)]
#[command(name = "pyagent", version, about = "Chat with a model that runs its python code in your sandbox")]
struct Cli {
    /// Owner of the persistent area (volume `vol-<user>`)
    #[arg(long, env = "PYAGENT_USER_ID", default_value = "local")]
    user_id: String,

    /// Conversation to continue; session state is keyed by this id
    #[arg(long, env = "PYAGENT_CONVERSATION_ID")]
    conversation_id: Option<String>,

    /// Attach a file to the prompt, fetched from URL and stored as NAME
    #[arg(long = "attach", value_name = "NAME=URL", value_parser = parse_attachment)]
    attachments: Vec<(String, String)>,

    /// Read a full JSON request (conversation history included) from FILE
    #[arg(long, value_name = "FILE", conflicts_with_all = ["prompt", "attachments"])]
    request: Option<PathBuf>,

    /// Inline the content of URLs found in the prompt
    #[arg(long)]
    link_aware: bool,

    /// Print Prometheus metrics after the run
    #[arg(long)]
    print_metrics: bool,

    /// List the saved sessions of the user and exit
    #[arg(long)]
    sessions: bool,

    /// Prompt text; read from stdin when omitted
    prompt: Option<String>,
}

fn parse_attachment(value: &str) -> Result<(String, String), String> {
    match value.split_once('=') {
        Some((name, url)) if !name.is_empty() && !url.is_empty() => {
            Ok((name.to_string(), url.to_string()))
        }
        _ => Err(format!("expected NAME=URL, got {:?}", value)),
    }
}

fn build_request(cli: &Cli) -> Result<QueryRequest, Box<dyn std::error::Error + Send + Sync>> {
    if let Some(path) = &cli.request {
        let raw = std::fs::read_to_string(path)?;
        return Ok(serde_json::from_str(&raw)?);
    }

    let prompt = match &cli.prompt {
        Some(prompt) => prompt.clone(),
        None => {
            let mut buf = String::new();
            std::io::stdin().read_to_string(&mut buf)?;
            buf
        }
    };
    if prompt.trim().is_empty() {
        return Err("empty prompt".into());
    }

    let turn = cli
        .attachments
        .iter()
        .fold(Turn::user(prompt), |turn, (name, url)| turn.with_attachment(name, url));
    let conversation_id = cli
        .conversation_id
        .clone()
        .unwrap_or_else(|| Uuid::now_v7().to_string());
    Ok(QueryRequest::new(vec![turn], cli.user_id.clone(), conversation_id))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let cli = Cli::parse();
    let settings = Settings::from_env()?;
    telemetry::init_tracing("pyagent", settings.otlp_endpoint.as_deref(), settings.log_json)?;

    let volumes = Arc::new(LocalVolumes::new(&settings.volumes_dir));

    if cli.sessions {
        let area = volumes.open(&cli.user_id).await?;
        for session in SessionStore::list(area.as_ref()).await? {
            println!(
                "{}\t{}\t{} variables",
                session.conversation_id,
                session.updated_at.as_deref().unwrap_or("-"),
                session.variables
            );
        }
        return Ok(());
    }

    let request = build_request(&cli)?;
    info!(
        user_id = %request.user_id,
        conversation_id = %request.conversation_id,
        turns = request.query.len(),
        "Starting request"
    );

    let model = ChatClient::new(&settings.ollama_url, &settings.model);
    let model = match settings.system_prompt()? {
        Some(prompt) => model.with_system_prompt(Some(prompt)),
        None => model,
    };
    let images: Arc<dyn ImageHost> = match &settings.image_upload_url {
        Some(url) => Arc::new(HttpImageHost::new(url)),
        None => Arc::new(DirectoryImageHost::new(&settings.image_dir)),
    };
    let mut config = settings.agent_config();
    config.link_aware = cli.link_aware;

    let controller = Arc::new(AgentController::new(
        Arc::new(model),
        Arc::new(ProcessSandbox::new(&settings.volumes_dir, settings.launcher())),
        volumes,
        images,
        Arc::new(HttpFetcher::new()),
        config,
    ));

    let (mut events, handle) = controller.stream(request);
    let mut suggestions = Vec::new();
    let mut stdout = std::io::stdout();
    while let Some(event) = events.next().await {
        match event {
            ResponseEvent::Text(text) => print!("{}", text),
            ResponseEvent::ReplaceResponse(text) => print!("\n\n{}", text),
            ResponseEvent::SuggestedReply(text) => suggestions.push(text),
        }
        stdout.flush()?;
    }
    println!();
    for suggestion in &suggestions {
        println!("> {}", suggestion);
    }

    let result = handle.await??;
    info!(
        trace_id = %result.trace_id,
        outcome = result.outcome.as_label(),
        rounds = result.rounds,
        executions = result.execution_records.len(),
        "Request finished"
    );

    if cli.print_metrics {
        eprintln!("{}", metrics::gather_text());
    }

    telemetry::shutdown_tracing();
    Ok(())
}
