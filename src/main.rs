//! # Cyphal CLI — Main Entry Point
//!
//! Wires the register store, the loopback transport, and the presentation
//! layer together behind the subcommands declared in [`cyphal_core::cli`].
//! Exit codes: 0 success, 1 runtime error, 2 unusable arguments.

use anyhow::{Context, Result};
use clap::Parser;
use cyphal_core::cli::{Args, Command};
use cyphal_core::presentation::{GetInfoRequest, GetInfoResponse, Handler, PresentationController, ScalarValue};
use cyphal_core::register::{pnp_protocol_version_for_mtu, RegisterStore};
use std::sync::Arc;
use tracing::{error, info};
use cyphal_core::logging::ColorizedFormatter;
use tracing_subscriber::{filter::LevelFilter, prelude::*, Layer};

// clap itself exits 2 on unusable arguments before
// `main` is even entered; returning `Err` here exits 1 via `anyhow`'s
// `Termination` impl, and returning `Ok(())` exits 0.
#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let _log_guard = init_logging(&args);

    if let Err(err) = run(args).await {
        error!("{err:#}");
        return Err(err);
    }
    Ok(())
}

fn init_logging(args: &Args) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let log_level = match args.verbose {
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };

    let guard;
    let detailed_log_layer;
    if matches!(args.log_file.as_deref(), None | Some("stderr")) {
        detailed_log_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr).with_filter(log_level).boxed();
        guard = None;
    } else {
        let path = args.log_file.as_deref().unwrap();
        let log_path = std::path::Path::new(path);
        let log_dir = log_path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or_else(|| std::path::Path::new("."));
        let log_filename = log_path.file_name().unwrap_or_else(|| std::ffi::OsStr::new("cyphal.log"));
        let file_appender = tracing_appender::rolling::daily(log_dir, log_filename);
        let (non_blocking_writer, file_guard) = tracing_appender::non_blocking(file_appender);
        detailed_log_layer = tracing_subscriber::fmt::layer()
            .with_writer(non_blocking_writer)
            .with_ansi(false)
            .with_filter(log_level)
            .boxed();
        guard = Some(file_guard);
    }

    let stdout_log = if !args.quiet {
        Some(tracing_subscriber::fmt::layer().with_writer(std::io::stdout).event_format(ColorizedFormatter).with_filter(log_level))
    } else {
        None
    };

    tracing_subscriber::registry().with(detailed_log_layer).with(stdout_log).init();
    guard
}

async fn run(args: Args) -> Result<()> {
    match args.command {
        Command::Publish { subject_id, value, timeout } => publish(subject_id, value, timeout).await,
        Command::Subscribe { subject_id, count, duration } => subscribe(subject_id, count, duration).await,
        Command::Call { server_node_id, service_id, timeout } => call(server_node_id, service_id, timeout).await,
        Command::PickNodeId => pick_node_id().await,
        Command::ShowTransport => show_transport().await,
        Command::DsdlGeneratePackages => {
            anyhow::bail!("dsdl-generate-packages is not implemented: the DSDL compiler is an external collaborator")
        }
    }
}

async fn publish(subject_id: u16, value: f32, timeout: std::time::Duration) -> Result<()> {
    let store = RegisterStore::bootstrap();
    let transport = store.build_transport().await.context("building transport from registers")?;
    let controller = PresentationController::new(transport);
    let mut publisher = controller.make_publisher::<ScalarValue>(subject_id).await.context("creating publisher")?;
    publisher.set_send_timeout(timeout);
    publisher.publish(&ScalarValue(value)).await.context("publishing message")?;
    info!(subject_id, value, "published message");
    controller.close().await;
    Ok(())
}

async fn subscribe(subject_id: u16, count: Option<usize>, duration: Option<std::time::Duration>) -> Result<()> {
    let store = RegisterStore::bootstrap();
    let transport = store.build_transport().await.context("building transport from registers")?;
    let controller = PresentationController::new(transport);
    let subscriber = controller.make_subscriber::<ScalarValue>(subject_id, None).await.context("creating subscriber")?;

    let stop_at = duration.map(|d| cyphal_core::transport::Timestamp::now() + d);
    let mut received = 0usize;
    loop {
        if let Some(limit) = count {
            if received >= limit {
                break;
            }
        }
        let deadline = match stop_at {
            Some(t) => t,
            None => cyphal_core::transport::Timestamp::now() + std::time::Duration::from_secs(1),
        };
        match subscriber.receive(deadline).await {
            Ok(Some((value, transfer))) => {
                println!("{:?} from node {:?} (transfer {})", value, transfer.source_node_id, transfer.transfer_id);
                received += 1;
            }
            Ok(None) => {
                if let Some(t) = stop_at {
                    if cyphal_core::transport::Timestamp::now() >= t {
                        break;
                    }
                }
            }
            Err(err) => return Err(err.into()),
        }
    }
    controller.close().await;
    Ok(())
}

async fn call(server_node_id: u16, service_id: u16, timeout: std::time::Duration) -> Result<()> {
    let store = RegisterStore::bootstrap();
    let transport = store.build_transport().await.context("building transport from registers")?;
    let controller = PresentationController::new(transport);

    let server = controller.get_server::<GetInfoRequest, GetInfoResponse>(service_id).await.context("creating server")?;
    let handler: Handler<GetInfoRequest, GetInfoResponse> =
        Arc::new(|_req, _meta| Box::pin(async move { Some(GetInfoResponse { name: "cyphal-cli".into(), software_version: (0, 1) }) }));
    let server_deadline = cyphal_core::transport::Timestamp::now() + timeout;
    tokio::spawn(async move {
        let _ = server.serve_until(server_deadline, handler).await;
    });

    let mut client = controller.make_client::<GetInfoRequest, GetInfoResponse>(service_id, server_node_id).await.context("creating client")?;
    client.set_response_timeout(timeout);
    let (response, transfer) = client.call(&GetInfoRequest).await.context("calling service")?;
    println!("{:?} (transfer {})", response, transfer.transfer_id);
    controller.close().await;
    Ok(())
}

async fn pick_node_id() -> Result<()> {
    let store = RegisterStore::bootstrap();
    let transport = store.build_transport().await.context("building transport from registers")?;
    let mtu = transport.protocol_parameters().mtu;
    let version = pnp_protocol_version_for_mtu(mtu);
    let unique_id = store.get_unstructured("uavcan.node.unique_id").await.unwrap_or_default();
    let max_nodes = transport.protocol_parameters().max_nodes.max(1) as u64;
    let hash: u64 = unique_id.iter().fold(0u64, |acc, b| acc.wrapping_mul(31).wrapping_add(*b as u64));
    let allocated = (hash % max_nodes) as u16;
    info!(version, allocated_node_id = allocated, "plug-and-play allocation");
    println!("{allocated}");
    Ok(())
}

async fn show_transport() -> Result<()> {
    let store = RegisterStore::bootstrap();
    let transport = store.build_transport().await.context("building transport from registers")?;
    let params = transport.protocol_parameters();
    let stats = transport.sample_statistics();
    println!(
        "protocol_parameters: transfer_id_modulo={} max_nodes={} mtu={}",
        params.transfer_id_modulo, params.max_nodes, params.mtu
    );
    println!("statistics: frames_tx={} frames_rx={} errors={}", stats.frames_tx, stats.frames_rx, stats.errors);
    transport.close().await;
    Ok(())
}
