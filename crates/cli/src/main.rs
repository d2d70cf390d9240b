use std::{io::Write, path::PathBuf, process::ExitCode};

use clap::Parser;
use cli::{CliError, attachment_for_path, build_dispatcher, ensure_provider_configured, load_config};
use thiserror::Error;
use tracing::info;
use types::{CallbackSink, Conversation, Message, ProviderId, StreamRequest, init_tracing};

#[derive(Debug, Clone, Parser, PartialEq, Eq)]
#[command(
    name = "switchboard",
    about = "Stream one prompt through a configured LLM provider"
)]
struct SwitchboardArgs {
    /// Provider id from `providers.toml`.
    #[arg(long)]
    provider: String,
    #[arg(long)]
    model: String,
    #[arg(long)]
    system: Option<String>,
    /// Local file to attach; may be repeated.
    #[arg(long = "attach")]
    attachments: Vec<PathBuf>,
    prompt: String,
}

#[derive(Debug, Error)]
enum RunError {
    #[error(transparent)]
    Cli(#[from] CliError),
    #[error("{0}")]
    Stream(String),
}

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(error) = run().await {
        eprintln!("switchboard error: {error}");
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

async fn run() -> Result<(), RunError> {
    init_tracing();
    let args = SwitchboardArgs::parse();
    let config = load_config()?;
    ensure_provider_configured(&config, &args.provider)?;
    let dispatcher = build_dispatcher(&config, None)?;
    info!(provider = %args.provider, model = %args.model, "configuration loaded");

    let conversation = Conversation::new(vec![Message::User {
        text: Some(args.prompt),
        attachments: args
            .attachments
            .iter()
            .map(|path| attachment_for_path(path))
            .collect(),
    }]);
    let mut request = StreamRequest::new(&conversation, args.model);
    if let Some(system) = args.system {
        request = request.with_system_prompt(system);
    }

    let mut failure = None;
    let mut sink = CallbackSink::new(
        |text: &str| {
            let mut stdout = std::io::stdout().lock();
            let _ = stdout.write_all(text.as_bytes());
            let _ = stdout.flush();
        },
        |finish_reason, tool_calls| {
            println!();
            if let Some(tool_calls) = tool_calls {
                match serde_json::to_string_pretty(&tool_calls) {
                    Ok(json) => eprintln!("{json}"),
                    Err(error) => eprintln!("failed to render tool calls: {error}"),
                }
            }
            info!(finish_reason = ?finish_reason, "stream finished");
        },
        |message| failure = Some(message),
    );
    dispatcher
        .stream_response(&ProviderId::from(args.provider), request, &mut sink)
        .await;
    drop(sink);

    match failure {
        Some(message) => Err(RunError::Stream(message)),
        None => Ok(()),
    }
}
