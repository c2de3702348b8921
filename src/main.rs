use std::sync::Arc;

use chrono::Local;
use clap::Parser;
use log::{error, info, warn};
use tokio::io::{AsyncBufReadExt, BufReader};
use voxlink::audio::FileAudioBackend;
use voxlink::{Cli, ControllerHandle, SessionController};
use voxlink_mqtt_transport::MqttSignalingConnector;
use voxlink_ureq_http_client::UreqHttpClient;

// Headless device client.
//
// Usage:
//   cargo run -- --ota-url http://host:8002/toy/ota/
//   cargo run -- --input mic.raw --output speaker.raw
//
// Operator keys (one per line on stdin):
//   s  start a turn        x  abort
//   c  clear history       p  stop listening
//   q  quit

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            use std::io::Write;
            writeln!(
                buf,
                "{} [{:<5}] [{}] - {}",
                Local::now().format("%H:%M:%S"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();

    let config = match Cli::parse().into_config() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {e}");
            std::process::exit(2);
        }
    };

    let rt = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            error!("Failed to build tokio runtime: {e}");
            std::process::exit(1);
        }
    };

    let code = rt.block_on(async move {
        let audio = Arc::new(FileAudioBackend::new(
            config.input.clone(),
            config.output.clone(),
        ));
        let (controller, handle) = SessionController::new(
            config,
            Arc::new(UreqHttpClient::new()),
            Arc::new(MqttSignalingConnector::new()),
            audio,
        );

        tokio::spawn(operator(handle.clone()));
        {
            let handle = handle.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("Interrupted, shutting down");
                    handle.shutdown();
                }
            });
        }

        match controller.run().await {
            Ok(reason) => {
                info!("Session ended: {reason:?}");
                0
            }
            Err(e) => {
                error!("Session failed: {e}");
                1
            }
        }
    });
    std::process::exit(code);
}

/// Line-based operator surface on stdin.
async fn operator(handle: ControllerHandle) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => return,
            Err(e) => {
                warn!("stdin closed: {e}");
                return;
            }
        };
        let result = match line.trim() {
            "s" => handle.trigger_turn_start().await,
            "x" => handle.trigger_abort().await,
            "c" => handle.trigger_clear_history().await,
            "p" => handle.trigger_listen_stop().await,
            "q" => {
                handle.shutdown();
                return;
            }
            "" => continue,
            other => {
                warn!("Unknown command {other:?} (s, x, c, p, q)");
                continue;
            }
        };
        if let Err(e) = result {
            warn!("{e} (state {})", handle.state().name());
        }
    }
}
