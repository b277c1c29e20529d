//! # IPC Fabric - Main Entry Point
//!
//! One binary, three roles:
//!
//! 1. **initiate** supervises worker processes: it runs the job queue,
//!    allocates their listen ports and pipes each child its configuration.
//! 2. **work** is the child side: it reads configuration from standard
//!    input, mints a registry token, attaches a UDP node and serves until
//!    interrupted.
//! 3. **send** is a one-shot smoke check that parcels a single message
//!    at a named application.
//!
//! Startup faults (unreadable configuration, a rejected socket bind,
//! an unsupported registry scheme) are fatal and exit non-zero;
//! everything after startup is logged and survived.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use configparser::ini::Ini;
use ipc_fabric::{
    cli::{Args, FabricConfiguration, FabricMode},
    defaults,
    message::{self, parcel, Address, Alert},
    node::create_udp_node,
    proactor::{Initiator, Processor},
    registry,
};
use tokio::sync::{mpsc, watch};
use tracing::{error, info};
use tracing_subscriber::{filter::LevelFilter, prelude::*, Layer};

mod logging;
use logging::ColorizedFormatter;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command-line arguments first, as they control logging behavior.
    let args = Args::parse();

    // -v raises the diagnostic level for both the file and stdout layers.
    let log_level = match args.verbose {
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };

    // Configure the detailed log layer (file or stderr). The guard must
    // stay alive for the duration of the program for file logging.
    let guard;
    let detailed_log_layer;

    if let Some("stderr") = args.log.as_deref() {
        detailed_log_layer = tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_filter(log_level)
            .boxed();
        guard = None;
    } else {
        let file_appender = match args.log.as_deref() {
            Some(path_str) => {
                let log_path = std::path::Path::new(path_str);
                let log_dir = log_path
                    .parent()
                    .unwrap_or_else(|| std::path::Path::new("."));
                let log_filename = log_path
                    .file_name()
                    .unwrap_or_else(|| std::ffi::OsStr::new("ipc_fabric.log"));
                tracing_appender::rolling::daily(log_dir, log_filename)
            }
            None => tracing_appender::rolling::daily(".", "ipc_fabric.log"),
        };
        let (non_blocking_writer, file_guard) = tracing_appender::non_blocking(file_appender);
        detailed_log_layer = tracing_subscriber::fmt::layer()
            .with_writer(non_blocking_writer)
            .with_ansi(false) // No color codes in the file record
            .with_filter(log_level)
            .boxed();
        guard = Some(file_guard);
    }

    // Clean, user-facing lines on stdout unless --quiet.
    let stdout_log = if !args.quiet {
        Some(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stdout)
                .event_format(ColorizedFormatter)
                .with_filter(log_level),
        )
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(detailed_log_layer)
        .with(stdout_log)
        .init();
    let _log_guard = guard;

    // The record catalogue is write-once, before any message moves.
    message::register_builtin();

    let config = FabricConfiguration::from_args(&args)?;
    info!(
        "ipc-fabric {} starting in {} mode",
        ipc_fabric::VERSION,
        config.mode
    );

    match config.mode {
        FabricMode::Initiate => run_initiator(&config).await,
        FabricMode::Work => run_worker(&config).await,
        FabricMode::Send => run_sender(&config).await,
    }
}

/// Supervise worker processes until interrupted.
async fn run_initiator(config: &FabricConfiguration) -> Result<()> {
    let mut cfg = Ini::new();
    if let Some(path) = &config.config {
        cfg.load(path)
            .map_err(|fault| anyhow!("unreadable configuration {:?}: {}", path, fault))?;
    }

    // Seed the section every worker's own section is cloned from.
    cfg.set(
        "work",
        "child_port_min",
        Some(config.child_port_min.to_string()),
    );
    cfg.set(
        "work",
        "child_port_max",
        Some(config.child_port_max.to_string()),
    );
    cfg.set("work", "host_scheme", Some("http".to_string()));
    cfg.set("work", "host_addr", Some(config.listen_addr.clone()));
    cfg.set("work", "host_port", Some(config.listen_port.to_string()));
    if let Some(token) = &config.token {
        cfg.set("work", "token", Some(token.clone()));
    }

    let options = config.supervisor_options()?;
    let (initiator, pending) = Initiator::new(options, cfg);
    let initiator = Arc::new(initiator);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let runner = {
        let initiator = initiator.clone();
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { initiator.run_jobs(pending, shutdown).await })
    };

    for _ in 0..config.workers {
        let guid = initiator.launch("work", None).await;
        info!("scheduled worker {}", guid);
    }

    tokio::signal::ctrl_c().await?;
    info!("interrupt received; draining tasks");
    let _ = shutdown_tx.send(true);
    let _ = runner.await;
    Ok(())
}

/// Host one node endpoint as a supervised child.
async fn run_worker(config: &FabricConfiguration) -> Result<()> {
    let guid = config
        .guid
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());
    let processor = Processor::new(&guid);

    let window = Duration::from_secs(defaults::CONFIG_TIMEOUT_SEC);
    let outcome = match &config.config {
        Some(path) => processor.read_config_file(path, window).await,
        None => processor.read_config_stdin(window).await,
    };
    if let Err(fault) = outcome {
        // A worker without configuration cannot join the fabric.
        error!("configuration did not arrive: {}", fault);
        std::process::exit(1);
    }

    if let Some(port) = config.port {
        let (addr, port) = processor.register_connection(port).await;
        info!("worker {} registered on {}:{}", guid, addr, port);
    }

    let token = mint_token(config).await?;
    let (down_tx, down_rx) = mpsc::channel(defaults::QUEUE_DEPTH);
    let (up_tx, mut up_rx) = mpsc::channel(defaults::QUEUE_DEPTH);
    let node = create_udp_node(&token, down_rx, up_tx).await?;
    info!("node {} attached on {:?}", token.address(), node.attachment());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let node_task = tokio::spawn(node.run(shutdown_rx.clone()));
    let refresh_task = {
        let processor = processor.clone();
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { processor.refresh_config(shutdown).await })
    };
    let delivery_task = tokio::spawn(async move {
        while let Some(msg) = up_rx.recv().await {
            info!(
                "delivered message {} carrying {} payload records",
                msg.header.id,
                msg.payload.len()
            );
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("interrupt received; draining tasks");
    let _ = shutdown_tx.send(true);
    let _ = node_task.await;
    let _ = refresh_task.await;
    drop(down_tx);
    let _ = delivery_task.await;
    Ok(())
}

/// Parcel one message at a named application and exit.
async fn run_sender(config: &FabricConfiguration) -> Result<()> {
    let token = mint_token(config).await?;
    let to = config.to.clone().context("send mode needs a --to application")?;

    let (down_tx, down_rx) = mpsc::channel(defaults::QUEUE_DEPTH);
    let (up_tx, mut up_rx) = mpsc::channel(defaults::QUEUE_DEPTH);
    let node = create_udp_node(&token, down_rx, up_tx).await?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let node_task = tokio::spawn(node.run(shutdown_rx));

    let dst = Address::new(&token.namespace, &token.user, &token.service, &to);
    let greeting = Alert {
        ts: chrono::Local::now().naive_local(),
        text: "Hello World!".to_string(),
    };
    let payload: Vec<ipc_fabric::assembly::Item> = vec![Box::new(greeting)];
    let msg = parcel(&token, payload, Some(dst), None, defaults::HOP_LIMIT);
    info!("sending message {} to {}", msg.header.id, to);
    down_tx
        .send(msg)
        .await
        .map_err(|_| anyhow!("node stopped before the parcel was sent"))?;

    // Give the datagram time to leave; a loopback parcel comes back up.
    if let Ok(Some(delivered)) =
        tokio::time::timeout(Duration::from_millis(250), up_rx.recv()).await
    {
        info!("received message {} back", delivered.header.id);
    }

    let _ = shutdown_tx.send(true);
    let _ = node_task.await;
    Ok(())
}

/// Mint the endpoint's registry token off the event loop.
async fn mint_token(config: &FabricConfiguration) -> Result<ipc_fabric::Token> {
    let connect = config.connect.clone();
    let service = config.service.clone();
    let application = config.application.clone();
    let token =
        tokio::task::spawn_blocking(move || registry::token(&connect, &service, &application))
            .await??;
    match token {
        Some(token) => Ok(token),
        None => bail!("unsupported connect scheme in {}", config.connect),
    }
}
