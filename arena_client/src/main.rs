//! Standalone client binary.
//!
//! Usage:
//!   cargo run -p arena_client -- [--addr 127.0.0.1:7777] [--password pw] [--discover]
//!
//! Connects to a server (or discovers one on the LAN first), joins the
//! session and drives a locally simulated tank, replicating it with the
//! dead-reckoning pattern.
//!
//! Console commands:
//!   forward|back|left|right|brake|coast - tank input
//!   status                              - connection and roster info
//!   disconnect                          - leave the session
//!   quit                                - exit

use std::collections::HashMap;
use std::env;
use std::io::BufRead;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::mpsc;
use tracing::{info, warn};

use arena_client::client::{Client, ClientEvent};
use arena_client::discovery::LanFinder;
use arena_client::replicate::{LocalReplica, RemoteReplica, ReplicationThresholds};
use arena_client::ClientStateKind;
use arena_shared::config::NetConfig;
use arena_shared::sender::{Delivery, LossToken};
use arena_shared::tank::{Tank, TANK_UPDATE_MESSAGE};
use arena_shared::wire::{Wire, WireReader, SERVER_ID};

struct Args {
    cfg: NetConfig,
    discover: bool,
}

fn parse_args() -> Args {
    let mut cfg = NetConfig {
        server_addr: "127.0.0.1:7777".to_string(),
        ..NetConfig::default()
    };
    let mut discover = false;
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
            "--discover" => {
                discover = true;
                i += 1;
            }
            _ => i += 1,
        }
    }
    Args { cfg, discover }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = parse_args();
    let server_addr = if args.discover {
        discover_server(&args.cfg).await?
    } else {
        args.cfg.server_addr.parse().context("parse server addr")?
    };

    let mut client = Client::new(args.cfg.clone());
    client.connect(server_addr, &args.cfg.password)?;

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

    let mut local: Option<LocalReplica> = None;
    let mut remotes: HashMap<u16, RemoteReplica> = HashMap::new();
    let tick = Duration::from_millis(5);
    let dt = tick.as_secs_f32();

    loop {
        client.update().await?;

        for event in client.drain_events() {
            match event {
                ClientEvent::JoinedSession { own_id } => {
                    info!(own_id, "session joined, spawning tank");
                    local = Some(LocalReplica::new(
                        Tank::new(own_id),
                        ReplicationThresholds::default(),
                    ));
                }
                ClientEvent::MemberJoined(member) => {
                    let own = client.session().map(|s| s.own_id());
                    if member.id != SERVER_ID && Some(member.id) != own {
                        remotes.insert(member.id, RemoteReplica::new(Tank::new(member.id)));
                        // The newcomer needs to hear about this tank.
                        if let Some(local) = &mut local {
                            local.request_snapshot();
                        }
                    }
                }
                ClientEvent::MemberLeft(id) => {
                    remotes.remove(&id);
                }
                ClientEvent::ConnectFailed(reason) => {
                    warn!(?reason, "connection failed");
                }
                ClientEvent::Disconnected(reason) => {
                    info!(?reason, "disconnected");
                }
                ClientEvent::Connected => {}
            }
        }

        if client.state() == ClientStateKind::Disconnected {
            break;
        }

        while let Ok(line) = console_rx.try_recv() {
            if !exec_console(&line, &mut client, &mut local, &remotes).await? {
                return Ok(());
            }
        }

        if client.state() == ClientStateKind::ReadyToUse {
            step_replication(&mut client, &mut local, &mut remotes, dt)?;
        }

        client.send().await?;
        tokio::time::sleep(tick).await;
    }

    Ok(())
}

/// One replication tick: advance simulations, emit pending snapshots,
/// apply received ones, resend on loss notification.
fn step_replication(
    client: &mut Client,
    local: &mut Option<LocalReplica>,
    remotes: &mut HashMap<u16, RemoteReplica>,
    dt: f32,
) -> anyhow::Result<()> {
    if let Some(local) = local.as_mut() {
        local.update(dt);

        for token in client.drain_lost() {
            info!(token = token.0, "snapshot reported lost, resending");
            local.request_snapshot();
        }

        if local.pending_snapshot() {
            let token = LossToken(local.snapshot().id as u32);
            let snapshot = *local.snapshot();
            if client.add_udp_message(
                TANK_UPDATE_MESSAGE,
                &snapshot,
                Delivery::LossInfo,
                Some(token),
            )? {
                local.mark_snapshot_sent();
            }
        }
    }

    for remote in remotes.values_mut() {
        remote.update(dt);
    }

    while let Some(packet) = client.next_udp_message() {
        let mut reader = WireReader::new(packet.payload());
        while reader.current_tag() == TANK_UPDATE_MESSAGE {
            let Some(tank) = Tank::decode(&mut reader) else { break };
            if let Some(remote) = remotes.get_mut(&tank.id) {
                remote.apply_snapshot(tank);
            }
            reader.advance_tag();
        }
    }
    Ok(())
}

/// Returns `false` when the client should exit.
async fn exec_console(
    line: &str,
    client: &mut Client,
    local: &mut Option<LocalReplica>,
    remotes: &HashMap<u16, RemoteReplica>,
) -> anyhow::Result<bool> {
    match line {
        "forward" => input(local, Tank::start_accelerating_forwards),
        "back" => input(local, Tank::start_accelerating_backwards),
        "left" => input(local, Tank::start_turning_left),
        "right" => input(local, Tank::start_turning_right),
        "brake" => input(local, Tank::start_braking),
        "coast" => input(local, |t| {
            t.stop_accelerating_forwards();
            t.stop_accelerating_backwards();
            t.stop_braking();
            t.stop_turning_left();
            t.stop_turning_right();
        }),
        "status" => {
            println!("state: {:?}", client.state());
            println!("network time: {:.3}", client.network_time());
            if let Some(session) = client.session() {
                for member in session.members() {
                    println!(
                        "  member {} at {}:{} multicast={}",
                        member.id,
                        member.ipv4(),
                        member.udp_port,
                        member.multicast
                    );
                }
            }
            if let Some(local) = local {
                let t = local.tank();
                println!("tank: x={:.2} z={:.2} v={:.2}", t.pos_x, t.pos_z, t.velocity);
            }
            println!("remote tanks: {}", remotes.len());
        }
        "disconnect" => client.disconnect().await,
        "quit" | "exit" => return Ok(false),
        other => println!("unknown command: {other}"),
    }
    Ok(true)
}

fn input(local: &mut Option<LocalReplica>, f: impl FnOnce(&mut Tank)) {
    if let Some(local) = local {
        f(local.tank_mut());
    }
}

/// Broadcasts a discovery request and waits briefly for a server.
async fn discover_server(cfg: &NetConfig) -> anyhow::Result<std::net::SocketAddr> {
    let mut finder = LanFinder::bind(cfg).await?;
    finder.send_discovery().await?;
    for _ in 0..100 {
        finder.update()?;
        if let Some(server) = finder.servers().first() {
            info!(ip = %server.ip, port = server.tcp_port, "discovered server");
            return Ok(std::net::SocketAddr::new(server.ip.into(), server.tcp_port));
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    anyhow::bail!("no server discovered on the LAN")
}
