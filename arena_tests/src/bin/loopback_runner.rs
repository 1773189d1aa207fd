//! Loopback soak harness: one server and two clients in a single process,
//! exchanging tank state through the full stack for a few seconds.
//!
//! Usage:
//!   cargo run -p arena_tests --bin loopback_runner -- [--seconds 5]

use std::collections::HashMap;
use std::env;
use std::time::Duration;

use anyhow::Context;
use tracing::info;

use arena_client::client::{Client, ClientEvent};
use arena_client::replicate::{LocalReplica, RemoteReplica, ReplicationThresholds};
use arena_client::ClientStateKind;
use arena_server::server::bind_ephemeral;
use arena_shared::config::NetConfig;
use arena_shared::sender::{Delivery, LossToken};
use arena_shared::tank::{Tank, TANK_UPDATE_MESSAGE};
use arena_shared::wire::{Wire, WireReader, SERVER_ID};

struct Participant {
    client: Client,
    local: Option<LocalReplica>,
    remotes: HashMap<u16, RemoteReplica>,
    snapshots_sent: u32,
    snapshots_applied: u32,
}

impl Participant {
    fn new() -> Self {
        Self {
            client: Client::new(NetConfig {
                multicast: Some(false),
                ..NetConfig::default()
            }),
            local: None,
            remotes: HashMap::new(),
            snapshots_sent: 0,
            snapshots_applied: 0,
        }
    }

    fn handle_events(&mut self) {
        for event in self.client.drain_events() {
            match event {
                ClientEvent::JoinedSession { own_id } => {
                    self.local = Some(LocalReplica::new(
                        Tank::new(own_id),
                        ReplicationThresholds::default(),
                    ));
                }
                ClientEvent::MemberJoined(member) => {
                    let own = self.client.session().map(|s| s.own_id());
                    if member.id != SERVER_ID && Some(member.id) != own {
                        self.remotes
                            .insert(member.id, RemoteReplica::new(Tank::new(member.id)));
                        if let Some(local) = &mut self.local {
                            local.request_snapshot();
                        }
                    }
                }
                ClientEvent::MemberLeft(id) => {
                    self.remotes.remove(&id);
                }
                _ => {}
            }
        }
    }

    fn step(&mut self, dt: f32) -> anyhow::Result<()> {
        if self.client.state() != ClientStateKind::ReadyToUse {
            return Ok(());
        }
        if let Some(local) = &mut self.local {
            local.update(dt);
            for _ in self.client.drain_lost() {
                local.request_snapshot();
            }
            if local.pending_snapshot() {
                let snapshot = *local.snapshot();
                let token = LossToken(snapshot.id as u32);
                if self.client.add_udp_message(
                    TANK_UPDATE_MESSAGE,
                    &snapshot,
                    Delivery::LossInfo,
                    Some(token),
                )? {
                    local.mark_snapshot_sent();
                    self.snapshots_sent += 1;
                }
            }
        }
        for remote in self.remotes.values_mut() {
            remote.update(dt);
        }
        while let Some(packet) = self.client.next_udp_message() {
            let mut reader = WireReader::new(packet.payload());
            while reader.current_tag() == TANK_UPDATE_MESSAGE {
                let Some(tank) = Tank::decode(&mut reader) else { break };
                if let Some(remote) = self.remotes.get_mut(&tank.id) {
                    remote.apply_snapshot(tank);
                    self.snapshots_applied += 1;
                }
                reader.advance_tag();
            }
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let seconds: f32 = env::args()
        .skip_while(|a| a != "--seconds")
        .nth(1)
        .map(|v| v.parse().context("parse --seconds"))
        .transpose()?
        .unwrap_or(5.0);

    let mut server = bind_ephemeral("", 0).await?;
    let addr = server.local_addr()?;
    info!(%addr, "soak server up");

    let mut a = Participant::new();
    let mut b = Participant::new();
    a.client.connect(addr, "")?;
    b.client.connect(addr, "")?;

    let tick = Duration::from_millis(5);
    let dt = tick.as_secs_f32();
    let mut elapsed = 0.0f32;
    let mut started = false;
    let mut steering_flipped = false;

    while elapsed < seconds {
        server.update().await?;
        a.client.update().await?;
        b.client.update().await?;
        a.handle_events();
        b.handle_events();

        // Give the tanks something to do.
        if !started {
            if let Some(local) = &mut a.local {
                local.tank_mut().start_accelerating_forwards();
                started = true;
            }
        }
        if elapsed > seconds / 2.0 && !steering_flipped {
            if let (Some(la), Some(lb)) = (&mut a.local, &mut b.local) {
                la.tank_mut().start_turning_left();
                lb.tank_mut().start_accelerating_backwards();
                steering_flipped = true;
            }
        }

        a.step(dt)?;
        b.step(dt)?;

        // Relay tank updates to every client, as the game server does.
        while let Some(packet) = server.next_udp_message() {
            let mut reader = WireReader::new(packet.payload());
            while reader.current_tag() == TANK_UPDATE_MESSAGE {
                let Some(tank) = Tank::decode(&mut reader) else { break };
                let token = LossToken(tank.id as u32);
                server.add_udp_message(TANK_UPDATE_MESSAGE, &tank, Delivery::LossInfo, Some(token));
                reader.advance_tag();
            }
        }
        for token in server.drain_lost() {
            info!(token = token.0, "relay snapshot lost");
        }

        a.client.send().await?;
        b.client.send().await?;
        server.send().await?;

        elapsed += dt;
        tokio::time::sleep(tick).await;
    }

    info!(
        a_sent = a.snapshots_sent,
        a_applied = a.snapshots_applied,
        b_sent = b.snapshots_sent,
        b_applied = b.snapshots_applied,
        "soak complete"
    );
    if let (Some(la), Some(ra)) = (&a.local, b.remotes.get(&a.client.session().map(|s| s.own_id()).unwrap_or(1))) {
        info!(
            driven_z = la.tank().pos_z,
            shown_z = ra.tank().pos_z,
            "replication residual"
        );
    }
    Ok(())
}
