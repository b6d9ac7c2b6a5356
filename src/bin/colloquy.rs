//! All-in-one launcher for the dialogue middleware.
//!
//! Runs the selected modules in one process. With `--local` the modules
//! talk over the in-process bus; otherwise they connect to the configured
//! NATS broker, which also allows one-module-per-process deployments
//! (`colloquy --modules asr`, `colloquy --modules dialogue,tts`, ...).

use std::sync::Arc;

use anyhow::Context as _;
use tokio_util::sync::CancellationToken;
use tracing::info;

use colloquy::broker::local::LocalBus;
use colloquy::broker::nats::NatsBroker;
use colloquy::broker::Broker;
use colloquy::llm::ApiChatClient;
use colloquy::runtime::{Collaborators, ModuleSelection, Runtime};
use colloquy::tts::engine_from_config;
use colloquy::Config;

struct Args {
    config_path: Option<std::path::PathBuf>,
    modules: ModuleSelection,
    local: bool,
}

fn parse_args() -> anyhow::Result<Args> {
    let mut args = Args {
        config_path: None,
        modules: ModuleSelection::default(),
        local: false,
    };
    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--config" => {
                let path = iter.next().context("--config requires a path")?;
                args.config_path = Some(path.into());
            }
            "--modules" => {
                let list = iter.next().context("--modules requires a list")?;
                args.modules = ModuleSelection::parse(&list)?;
            }
            "--local" => args.local = true,
            "--help" | "-h" => {
                println!(
                    "usage: colloquy [--config <path>] [--modules asr,audio_vap,text_vap,dialogue,tts] [--local]"
                );
                std::process::exit(0);
            }
            other => anyhow::bail!("unknown argument: {other}"),
        }
    }
    Ok(args)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = parse_args()?;
    let config = match &args.config_path {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    let runtime = Runtime::new(config.clone());
    let cancel = runtime.cancel_token();
    spawn_ctrl_c_handler(cancel);

    let broker: Arc<dyn Broker> = if args.local {
        info!("using in-process bus");
        Arc::new(LocalBus::new(config.broker.subscriber_queue_bound))
    } else {
        info!("connecting to broker {}", config.broker.host);
        Arc::new(NatsBroker::connect(&config.broker, runtime.cancel_token()).await?)
    };

    // The recognizer and turn model are external collaborators wired in by
    // deployment-specific builds; without them those modules are skipped.
    let collaborators = Collaborators {
        recognizer: None,
        turn_model: None,
        chat: Arc::new(ApiChatClient::new(&config.llm)),
        synthesizer: engine_from_config(&config.tts)?,
    };

    runtime.run(broker, args.modules, collaborators).await?;
    Ok(())
}

fn spawn_ctrl_c_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("ctrl-c received; shutting down");
            cancel.cancel();
        }
    });
}
