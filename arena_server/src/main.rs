//! Standalone server binary.
//!
//! Usage:
//!   cargo run -p arena_server -- [--addr 127.0.0.1:0] [--password pw] [--max-clients 3]
//!
//! Opens a session, advertises it on the LAN and relays tank updates: each
//! incoming snapshot is advanced by its observed latency and rebroadcast
//! to every client with loss-info delivery, so a dropped relay triggers a
//! resend from the authoritative copy.
//!
//! Console commands:
//!   status - session and connection info
//!   quit   - exit

use std::env;
use std::io::BufRead;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use arena_server::discovery::LanAdvertiser;
use arena_server::server::Server;
use arena_shared::config::NetConfig;
use arena_shared::sender::{Delivery, LossToken};
use arena_shared::tank::{Tank, TANK_UPDATE_MESSAGE};
use arena_shared::wire::{Wire, WireReader};

fn parse_args() -> NetConfig {
    let mut cfg = NetConfig {
        server_addr: "127.0.0.1:0".to_string(),
        max_clients: 3,
        ..NetConfig::default()
    };
    let args: Vec<String> = env::args().collect();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--addr" if i + 1 < args.len() => {
                cfg.server_addr = args[i + 1].clone();
                i += 2;
            }
            "--password" if i + 1 < args.len() => {
                cfg.password = args[i + 1].clone();
                i += 2;
            }
            "--max-clients" if i + 1 < args.len() => {
                cfg.max_clients = args[i + 1].parse().unwrap_or(3);
                i += 2;
            }
            _ => i += 1,
        }
    }
    cfg
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cfg = parse_args();
    let mut server = Server::bind(cfg.clone()).await.context("bind server")?;
    let local = server.local_addr()?;
    info!(%local, "server listening");

    let SocketAddr::V4(local) = local else {
        anyhow::bail!("ipv6 endpoints are not supported");
    };
    let mut advertiser = LanAdvertiser::bind(&cfg, *local.ip(), local.port()).await?;

    // Console input from a blocking stdin thread.
    let (console_tx, mut console_rx) = mpsc::channel::<String>(32);
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            let line = line.trim().to_string();
            if !line.is_empty() && console_tx.blocking_send(line).is_err() {
                break;
            }
        }
    });

    let tick = Duration::from_millis(5);
    loop {
        server.update().await?;
        advertiser.update()?;

        while let Ok(line) = console_rx.try_recv() {
            match line.as_str() {
                "status" => {
                    println!("connections: {}", server.connection_count());
                    println!("network time: {:.3}", server.network_time());
                    for member in server.session().members() {
                        println!(
                            "  member {} at {}:{} multicast={}",
                            member.id,
                            member.ipv4(),
                            member.udp_port,
                            member.multicast
                        );
                    }
                }
                "quit" | "exit" => return Ok(()),
                other => println!("unknown command: {other}"),
            }
        }

        relay_tank_updates(&mut server);

        for token in server.drain_lost() {
            debug!(token = token.0, "relayed snapshot lost, client will refresh");
        }

        server.send().await?;
        advertiser.send_responses()?;
        tokio::time::sleep(tick).await;
    }
}

/// Forwards every received tank snapshot to all clients, advanced by the
/// time it spent in flight.
fn relay_tank_updates(server: &mut Server) {
    while let Some(packet) = server.next_udp_message() {
        let latency = (server.network_time() - packet.network_time()).max(0.0);
        let mut reader = WireReader::new(packet.payload());
        while reader.current_tag() == TANK_UPDATE_MESSAGE {
            let Some(mut tank) = Tank::decode(&mut reader) else { break };
            tank.integrate(latency);

            let token = LossToken(tank.id as u32);
            let failed =
                server.add_udp_message(TANK_UPDATE_MESSAGE, &tank, Delivery::LossInfo, Some(token));
            if !failed.is_empty() {
                warn!(?failed, "tank update did not fit this period");
            }
            reader.advance_tag();
        }
    }
}
