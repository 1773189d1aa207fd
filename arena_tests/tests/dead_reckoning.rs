//! Dead-reckoning replication, from the divergence detector through the
//! transport to the receiving smoother.

use std::time::Duration;

use arena_client::client::Client;
use arena_client::replicate::{LocalReplica, RemoteReplica, ReplicationThresholds};
use arena_client::ClientStateKind;
use arena_server::server::{bind_ephemeral, Server};
use arena_shared::config::NetConfig;
use arena_shared::sender::{Delivery, LossToken};
use arena_shared::tank::{Tank, TANK_UPDATE_MESSAGE};
use arena_shared::wire::{Wire, WireReader};

fn client_cfg() -> NetConfig {
    NetConfig {
        multicast: Some(false),
        ..NetConfig::default()
    }
}

async fn join(server: &mut Server, client: &mut Client) -> anyhow::Result<()> {
    for _ in 0..500 {
        server.update().await?;
        client.update().await?;
        client.send().await?;
        server.send().await?;
        if client.state() == ClientStateKind::ReadyToUse {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    anyhow::bail!("client never joined")
}

/// Relays tank updates like the standalone server binary does.
fn relay(server: &mut Server) {
    while let Some(packet) = server.next_udp_message() {
        let mut reader = WireReader::new(packet.payload());
        while reader.current_tag() == TANK_UPDATE_MESSAGE {
            let Some(tank) = Tank::decode(&mut reader) else { break };
            let token = LossToken(tank.id as u32);
            server.add_udp_message(TANK_UPDATE_MESSAGE, &tank, Delivery::LossInfo, Some(token));
            reader.advance_tag();
        }
    }
}

/// A tank driven forward from rest crosses the position threshold within
/// 0.35 s, emits exactly one snapshot for the whole drive, and the other
/// client's smoothed view converges toward the driver's state.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn forward_drive_replicates_with_a_single_snapshot() -> anyhow::Result<()> {
    let mut server = bind_ephemeral("", 0).await?;
    let addr = server.local_addr()?;

    let mut driver = Client::new(client_cfg());
    driver.connect(addr, "")?;
    join(&mut server, &mut driver).await?;

    let mut observer = Client::new(client_cfg());
    observer.connect(addr, "")?;
    join(&mut server, &mut observer).await?;

    let driver_id = driver.session().unwrap().own_id();
    let mut local = LocalReplica::new(Tank::new(driver_id), ReplicationThresholds::default());
    let mut remote = RemoteReplica::new(Tank::new(driver_id));

    local.tank_mut().start_accelerating_forwards();

    let tick = Duration::from_millis(5);
    let dt = tick.as_secs_f32();
    let mut elapsed = 0.0f32;
    let mut snapshots_sent = 0u32;
    let mut first_snapshot_at = None;

    while elapsed < 1.0 {
        server.update().await?;
        driver.update().await?;
        observer.update().await?;

        // Driver side: simulate and emit on divergence.
        local.update(dt);
        elapsed += dt;
        for _ in driver.drain_lost() {
            local.request_snapshot();
        }
        if local.pending_snapshot() {
            let snapshot = *local.snapshot();
            if driver.add_udp_message(
                TANK_UPDATE_MESSAGE,
                &snapshot,
                Delivery::LossInfo,
                Some(LossToken(driver_id as u32)),
            )? {
                local.mark_snapshot_sent();
                snapshots_sent += 1;
                first_snapshot_at.get_or_insert(elapsed);
            }
        }

        relay(&mut server);

        // Observer side: smooth toward whatever arrives.
        remote.update(dt);
        while let Some(packet) = observer.next_udp_message() {
            let mut reader = WireReader::new(packet.payload());
            while reader.current_tag() == TANK_UPDATE_MESSAGE {
                let Some(tank) = Tank::decode(&mut reader) else { break };
                if tank.id == driver_id {
                    remote.apply_snapshot(tank);
                }
                reader.advance_tag();
            }
        }

        driver.send().await?;
        observer.send().await?;
        server.send().await?;
        tokio::time::sleep(tick).await;
    }

    let when = first_snapshot_at.expect("the drive must trigger a snapshot");
    assert!(when <= 0.35, "threshold crossed too late: {when}");
    assert_eq!(
        snapshots_sent, 1,
        "no further divergence without input changes"
    );

    // The smoothed view picked up the drive: it moved well past the
    // divergence threshold and roughly tracks the driver.
    let shown = remote.tank();
    let driven = local.tank();
    assert!(shown.pos_z > 0.5, "observer tank never moved: {}", shown.pos_z);
    assert!(
        (shown.pos_z - driven.pos_z).abs() < 3.0,
        "observer diverged: shown {} vs driven {}",
        shown.pos_z,
        driven.pos_z
    );
    Ok(())
}
