use clap::Parser;
use colored::*;
use futures_util::{FutureExt, StreamExt};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use streamkeeper::accumulator::IndicatorPhase;
use streamkeeper::controller::{SessionOutcome, StreamController};
use streamkeeper::events::ControllerEvent;
use streamkeeper::logging;
use streamkeeper::main_helper::{api_key, build_store, build_stream_client};
use streamkeeper::recovery::RecoveryState;
use streamkeeper::transport::HttpTransport;
use streamkeeper::Args;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;

fn render(event: ControllerEvent) {
    match event {
        ControllerEvent::Content { delta, replaced, .. } => {
            if replaced {
                println!();
                eprintln!("{}", "[content replaced by server]".dimmed());
            }
            print!("{}", delta);
            let _ = std::io::stdout().flush();
        }
        ControllerEvent::Indicator { channel, phase, .. } => match phase {
            IndicatorPhase::Active { detail } => eprintln!(
                "{} {}{}",
                "⟳".yellow(),
                channel.label().yellow(),
                detail.map(|d| format!(": {}", d)).unwrap_or_default()
            ),
            IndicatorPhase::Complete { .. } => {
                eprintln!("{} {}", "✓".green(), channel.label().green())
            }
            IndicatorPhase::Error { message } => eprintln!(
                "{} {}{}",
                "✗".red(),
                channel.label().red(),
                message.map(|m| format!(": {}", m)).unwrap_or_default()
            ),
            IndicatorPhase::Idle => {}
        },
        ControllerEvent::SourceDomains { domains, .. } => {
            eprintln!("{} {}", "sources:".dimmed(), domains.join(", ").dimmed());
        }
        ControllerEvent::ThinkingRecorded { label, .. } => {
            eprintln!("{}", label.dimmed());
        }
        ControllerEvent::Recovery { state, .. } => {
            let text = match state {
                RecoveryState::Interrupted => {
                    "connection lost, checking for the saved reply".yellow()
                }
                RecoveryState::Recovering => "recovering...".yellow(),
                RecoveryState::Resolved => "recovered from saved reply".green(),
                RecoveryState::Abandoned => "could not recover; keeping partial reply".red(),
                RecoveryState::Active => return,
            };
            eprintln!("\n{}", text);
        }
        ControllerEvent::UsageLimit { message, .. } => {
            eprintln!("\n{} {}", "Usage limit reached:".red().bold(), message);
        }
        ControllerEvent::Failed { message, .. } => {
            eprintln!("\n{} {}", "Failed:".red().bold(), message);
        }
        ControllerEvent::Promoted { persisted_id, .. } => {
            tracing::debug!("Response saved as {}", persisted_id);
        }
        _ => {}
    }
}

fn handle(item: Result<ControllerEvent, BroadcastStreamRecvError>) {
    match item {
        Ok(event) => render(event),
        Err(BroadcastStreamRecvError::Lagged(n)) => {
            tracing::warn!("Event renderer lagged by {} events", n);
        }
    }
}

/// Renders whatever is already queued without waiting for more.
fn drain(events: &mut BroadcastStream<ControllerEvent>) {
    while let Some(Some(item)) = events.next().now_or_never() {
        handle(item);
    }
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let _guard = logging::init_tracing(Path::new(&args.log_dir), args.log_json);
    logging::setup_panic_hook();

    let request = match args.submit_request() {
        Ok(r) => r,
        Err(e) => {
            eprintln!("{} {}", "Error:".red().bold(), e.inner);
            std::process::exit(2);
        }
    };

    let key = api_key();
    if key.is_none() {
        tracing::warn!("No API key set; requests are sent unauthenticated");
    }

    let client = match build_stream_client(&args) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to build HTTP client: {}", e);
            eprintln!("Failed to build HTTP client: {}", e.inner);
            std::process::exit(1);
        }
    };
    let store = match build_store(&args, key.clone()).await {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Failed to initialize message store: {}", e.inner);
            std::process::exit(1);
        }
    };

    let transport = HttpTransport::new(client, args.endpoint.as_str(), key);
    let controller = StreamController::new(
        Arc::new(transport),
        Arc::new(store),
        args.controller_config(),
    );
    controller.switch_conversation(&request.conversation_id);
    let mut events = BroadcastStream::new(controller.subscribe());

    let cid = request.conversation_id.clone();
    let message = request.message.clone();
    let submit = controller.submit(request);
    tokio::pin!(submit);

    let result = loop {
        tokio::select! {
            result = &mut submit => break result,
            Some(item) = events.next() => handle(item),
            _ = tokio::signal::ctrl_c() => {
                eprintln!("\n{}", "Stopping...".yellow());
                controller.stop(&cid, &message);
            }
        }
    };
    drain(&mut events);
    println!();

    match result {
        Ok(finished) => {
            let summary = format!(
                "[{}] {} ({} chars, {})",
                finished.outcome.as_str(),
                finished.message_id,
                finished.content.chars().count(),
                finished.thinking.label
            );
            match finished.outcome {
                SessionOutcome::Completed | SessionOutcome::Recovered => {
                    eprintln!("{}", summary.green())
                }
                SessionOutcome::Abandoned | SessionOutcome::Cancelled => {
                    eprintln!("{}", summary.yellow())
                }
            }
        }
        Err(e) => {
            tracing::error!("Session failed: {}", e);
            if e.inner.is_usage_limit() {
                std::process::exit(3);
            }
            eprintln!("{} {}", "Error:".red().bold(), e.inner);
            std::process::exit(1);
        }
    }
}
