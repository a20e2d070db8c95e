#![allow(clippy::manual_unwrap_or_default)]
#![allow(clippy::manual_unwrap_or)]
use clap::Parser;
use colored::*;
use delve::db::SqliteStore;
use delve::engine::{DelveEngine, EngineEvent, EngineHandle};
use delve::main_helper::{Args, Command};
use delve::session::LifecycleSignal;
use delve::store::StoreChange;
use delve::transport::HttpTransport;
use delve::*;
use std::io::Write;
use std::sync::Arc;
use tokio::sync::broadcast;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    use tracing_subscriber::prelude::*;

    let filter = match tracing_subscriber::EnvFilter::try_from_default_env() {
        Ok(f) => f,
        Err(_) => "delve=info".into(),
    };

    let file_appender = tracing_appender::rolling::daily(".", "delve.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false),
        )
        .with(tracing_error::ErrorLayer::default())
        .init();

    delve::logging::setup_panic_hook();

    let args = Args::parse();

    let store = match SqliteStore::open(&args.database).await {
        Ok(store) => store,
        Err(e) => {
            eprintln!("Failed to initialize database: {}", e);
            std::process::exit(1);
        }
    };

    let client = match HttpTransport::build_client(args.connect_timeout()) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to build HTTP client: {}", e);
            eprintln!("Failed to build HTTP client: {}", e);
            std::process::exit(1);
        }
    };
    let transport =
        Arc::new(HttpTransport::new(client, args.endpoint.clone()).with_api_key(args.api_key.clone()));

    let engine = DelveEngine::start(args.engine_config(), transport, Arc::new(store));

    let outcome = match &args.command {
        Command::Ask { question, image } => ask(&engine, question, image.clone()).await,
        Command::History { force } => history(&engine, *force).await,
        Command::Sessions => sessions(&engine).await,
        Command::New => engine.new_conversation().await.map(|id| {
            println!("Started {}", id);
        }),
    };

    if let Err(e) = engine.shutdown().await {
        tracing::error!("[💾] Engine did not shut down cleanly: {}", e);
    }

    // Leaving the CLI counts as a graceful suspension for the next run.
    if let Err(e) = engine
        .session()
        .handle_signal(LifecycleSignal::EnteringBackground)
        .await
    {
        tracing::error!("[💾] Failed to record suspension: {}", e);
    }

    if let Err(e) = outcome {
        eprintln!("{} {}", "error:".red().bold(), e);
        std::process::exit(1);
    }
}

async fn ask(engine: &EngineHandle, question: &str, image: Option<String>) -> Result<()> {
    engine.restore(false).await?;
    let mut events = engine.subscribe();
    let answer_id = engine.submit(question, image).await?;

    let mut printed = 0usize;
    let mut last_caption: Option<String> = None;
    let mut stdout = std::io::stdout();

    loop {
        let event = tokio::select! {
            event = events.recv() => event,
            _ = tokio::signal::ctrl_c() => {
                engine.cancel(&answer_id).await?;
                eprintln!("\n{}", "cancelled".yellow());
                break;
            }
        };
        match event {
            Ok(EngineEvent::Stages(stages)) => {
                if let Some(view) = stages.get(&answer_id) {
                    let caption = view.caption();
                    if last_caption.as_deref() != Some(caption.as_str()) {
                        eprintln!("{}", format!("… {}", caption).dimmed());
                        last_caption = Some(caption);
                    }
                }
            }
            Ok(EngineEvent::Answer(StoreChange::Searching { answer_id: id, searching }))
                if id == answer_id && printed == 0 =>
            {
                let note = if searching { "searching sources" } else { "sources in" };
                eprintln!("{}", format!("  ({})", note).dimmed());
            }
            Ok(EngineEvent::Answer(StoreChange::Updated { answer, .. })) if answer.id == answer_id => {
                if answer.content.len() > printed && answer.content.is_char_boundary(printed) {
                    let _ = write!(stdout, "{}", &answer.content[printed..]);
                    let _ = stdout.flush();
                    printed = answer.content.len();
                }
            }
            Ok(EngineEvent::Status(status)) if !status.loading => break,
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(_)) => {}
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    let status = engine.wait_until_idle().await?;
    if let Some(answer) = engine.answer(&answer_id).await? {
        // The final content may have been replaced wholesale on completion.
        if printed == 0 {
            let _ = write!(stdout, "{}", answer.content);
        } else if answer.content.len() > printed && answer.content.is_char_boundary(printed) {
            let _ = write!(stdout, "{}", &answer.content[printed..]);
        }
        println!();
        print_sources(&answer);
    } else {
        println!();
    }
    if let Some(error) = status.error {
        eprintln!("{} {}", "research failed:".red(), error);
    }
    Ok(())
}

async fn history(engine: &EngineHandle, force: bool) -> Result<()> {
    engine.restore(force).await?;
    let answers = engine.answers().await?;
    if answers.is_empty() {
        println!("{}", "No answers in the current conversation.".dimmed());
        return Ok(());
    }
    for answer in answers.iter().rev() {
        println!("{} {}", "Q:".bold(), answer.query);
        let tier = answer.tier.map(|t| t.to_string()).unwrap_or_else(|| "-".into());
        println!(
            "{}",
            format!(
                "[{} | {} | {} sources]",
                answer.created_at.format("%Y-%m-%d %H:%M"),
                tier,
                answer.sources.len()
            )
            .dimmed()
        );
        println!("{}\n", answer.content);
    }
    Ok(())
}

async fn sessions(engine: &EngineHandle) -> Result<()> {
    for session in engine.session().sessions().await? {
        let title = match &session.metadata {
            Some(m) => m.title.clone(),
            None => "(in progress)".to_string(),
        };
        println!(
            "{}  {:?}  {}  {} messages",
            session.last_activity.format("%Y-%m-%d %H:%M"),
            session.status,
            title,
            session.messages.len()
        );
    }
    Ok(())
}

fn print_sources(answer: &Answer) {
    if answer.sources.is_empty() {
        return;
    }
    println!("{}", "Sources".bold());
    for (i, source) in answer.sources.iter().enumerate() {
        println!(
            "  [{}] {} ({}, {:?})",
            i + 1,
            source.title,
            source.domain.cyan(),
            source.credibility
        );
    }
}
