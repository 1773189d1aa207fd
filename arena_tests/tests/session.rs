//! Socket-based integration tests for session negotiation and the client
//! connection state machine.

use std::net::SocketAddr;
use std::time::Duration;

use arena_client::client::{Client, ClientEvent, ConnectFailure};
use arena_client::ClientStateKind;
use arena_server::server::{bind_ephemeral, Server};
use arena_shared::config::NetConfig;

fn client_cfg() -> NetConfig {
    NetConfig {
        multicast: Some(false),
        ..NetConfig::default()
    }
}

/// Drives server and clients for one cooperative tick.
async fn tick(server: &mut Server, clients: &mut [&mut Client]) -> anyhow::Result<()> {
    server.update().await?;
    for client in clients.iter_mut() {
        client.update().await?;
        client.send().await?;
    }
    server.send().await?;
    tokio::time::sleep(Duration::from_millis(2)).await;
    Ok(())
}

/// Ticks until `cond` holds, with a bounded number of iterations.
macro_rules! drive_until {
    ($server:expr, $clients:expr, $cond:expr) => {{
        let mut done = false;
        for _ in 0..500 {
            tick($server, $clients).await?;
            if $cond {
                done = true;
                break;
            }
        }
        assert!(done, "condition not reached: {}", stringify!($cond));
    }};
}

#[tokio::test]
async fn happy_path_join_and_leave() -> anyhow::Result<()> {
    let mut server = bind_ephemeral("0", 3).await?;
    let addr = server.local_addr()?;

    let mut client = Client::new(client_cfg());
    client.connect(addr, "0")?;

    // Record the distinct states the machine passes through.
    let mut states = vec![client.state()];
    let mut events = Vec::new();
    for _ in 0..500 {
        tick(&mut server, &mut [&mut client]).await?;
        let state = client.state();
        if *states.last().unwrap() != state {
            states.push(state);
        }
        events.extend(client.drain_events());
        if state == ClientStateKind::ReadyToUse {
            break;
        }
    }
    assert_eq!(
        states,
        vec![
            ClientStateKind::Connecting,
            ClientStateKind::Connected,
            ClientStateKind::ReadyToUse,
        ]
    );
    assert!(events.contains(&ClientEvent::Connected));
    assert!(events.contains(&ClientEvent::JoinedSession { own_id: 1 }));

    // Server roster is {0, 1}; the client sees the same member ids.
    let ids: Vec<u16> = server.session().members().iter().map(|m| m.id).collect();
    assert_eq!(ids, vec![0, 1]);
    let client_ids: Vec<u16> = client
        .session()
        .unwrap()
        .members()
        .iter()
        .map(|m| m.id)
        .collect();
    assert_eq!(client_ids, vec![0, 1]);

    // Disconnect: the roster shrinks back to the server alone.
    client.disconnect().await;
    drive_until!(
        &mut server,
        &mut [&mut client],
        client.state() == ClientStateKind::Disconnected
    );
    assert_eq!(server.session().members().len(), 1);
    assert_eq!(server.connection_count(), 0);
    Ok(())
}

#[tokio::test]
async fn other_clients_observe_join_and_leave() -> anyhow::Result<()> {
    let mut server = bind_ephemeral("", 0).await?;
    let addr = server.local_addr()?;

    let mut first = Client::new(client_cfg());
    first.connect(addr, "")?;
    drive_until!(
        &mut server,
        &mut [&mut first],
        first.state() == ClientStateKind::ReadyToUse
    );
    first.drain_events();

    let mut second = Client::new(client_cfg());
    second.connect(addr, "")?;
    drive_until!(
        &mut server,
        &mut [&mut first, &mut second],
        second.state() == ClientStateKind::ReadyToUse
    );

    // The first client heard about the newcomer.
    let mut first_events = first.drain_events();
    drive_until!(&mut server, &mut [&mut first, &mut second], {
        first_events.extend(first.drain_events());
        first_events
            .iter()
            .any(|e| matches!(e, ClientEvent::MemberJoined(m) if m.id == 2))
    });
    let first_ids: Vec<u16> = first
        .session()
        .unwrap()
        .members()
        .iter()
        .map(|m| m.id)
        .collect();
    assert_eq!(first_ids, vec![0, 1, 2]);

    // The second client received the full roster on join.
    let second_ids: Vec<u16> = second
        .session()
        .unwrap()
        .members()
        .iter()
        .map(|m| m.id)
        .collect();
    assert_eq!(second_ids, vec![0, 1, 2]);

    // Leaving propagates a remove-member to the remaining client.
    second.disconnect().await;
    let mut removed = Vec::new();
    drive_until!(&mut server, &mut [&mut first, &mut second], {
        removed.extend(
            first
                .drain_events()
                .into_iter()
                .filter(|e| matches!(e, ClientEvent::MemberLeft(2))),
        );
        !removed.is_empty() && second.state() == ClientStateKind::Disconnected
    });
    let first_ids: Vec<u16> = first
        .session()
        .unwrap()
        .members()
        .iter()
        .map(|m| m.id)
        .collect();
    assert_eq!(first_ids, vec![0, 1]);
    Ok(())
}

#[tokio::test]
async fn wrong_password_is_rejected_without_roster_change() -> anyhow::Result<()> {
    let mut server = bind_ephemeral("abc", 0).await?;
    let addr = server.local_addr()?;

    let mut client = Client::new(client_cfg());
    client.connect(addr, "def")?;

    let mut events = Vec::new();
    drive_until!(&mut server, &mut [&mut client], {
        events.extend(client.drain_events());
        client.state() == ClientStateKind::Disconnected
    });

    let failure = events
        .iter()
        .find_map(|e| match e {
            ClientEvent::ConnectFailed(f) => Some(f.clone()),
            _ => None,
        })
        .expect("a rejection must be reported");
    assert_eq!(
        failure,
        ConnectFailure::WrongPassword {
            addr,
            password: "def".to_string(),
        }
    );
    // No member was ever announced.
    assert!(!events.iter().any(|e| matches!(e, ClientEvent::MemberJoined(_))));
    assert_eq!(server.session().members().len(), 1);
    Ok(())
}

#[tokio::test]
async fn session_full_rejects_the_loser() -> anyhow::Result<()> {
    let mut server = bind_ephemeral("", 1).await?;
    let addr = server.local_addr()?;

    let mut winner = Client::new(client_cfg());
    winner.connect(addr, "")?;
    drive_until!(
        &mut server,
        &mut [&mut winner],
        winner.state() == ClientStateKind::ReadyToUse
    );

    let mut loser = Client::new(client_cfg());
    loser.connect(addr, "")?;
    let mut events = Vec::new();
    drive_until!(&mut server, &mut [&mut winner, &mut loser], {
        events.extend(loser.drain_events());
        loser.state() == ClientStateKind::Disconnected
    });

    assert!(events
        .iter()
        .any(|e| matches!(e, ClientEvent::ConnectFailed(ConnectFailure::SessionFull { .. }))));

    // The roster never grew beyond server + winner.
    let ids: Vec<u16> = server.session().members().iter().map(|m| m.id).collect();
    assert_eq!(ids, vec![0, 1]);
    Ok(())
}

#[tokio::test]
async fn kicked_member_is_removed_and_disconnected() -> anyhow::Result<()> {
    let mut server = bind_ephemeral("", 0).await?;
    let addr = server.local_addr()?;

    let mut kicker = Client::new(client_cfg());
    kicker.connect(addr, "")?;
    drive_until!(
        &mut server,
        &mut [&mut kicker],
        kicker.state() == ClientStateKind::ReadyToUse
    );

    let mut victim = Client::new(client_cfg());
    victim.connect(addr, "")?;
    drive_until!(
        &mut server,
        &mut [&mut kicker, &mut victim],
        victim.state() == ClientStateKind::ReadyToUse
    );
    kicker.drain_events();

    // The kicker asks the server to remove member 2; the server closes the
    // victim's connection and the roster contracts everywhere.
    kicker.kick(2)?;
    let mut kicker_events = Vec::new();
    drive_until!(&mut server, &mut [&mut kicker, &mut victim], {
        kicker_events.extend(kicker.drain_events());
        victim.state() == ClientStateKind::Disconnected
            && kicker_events
                .iter()
                .any(|e| matches!(e, ClientEvent::MemberLeft(2)))
    });

    let ids: Vec<u16> = server.session().members().iter().map(|m| m.id).collect();
    assert_eq!(ids, vec![0, 1]);
    let kicker_ids: Vec<u16> = kicker
        .session()
        .unwrap()
        .members()
        .iter()
        .map(|m| m.id)
        .collect();
    assert_eq!(kicker_ids, vec![0, 1]);
    Ok(())
}

#[tokio::test]
async fn connect_to_dead_port_times_out() -> anyhow::Result<()> {
    // A port with nothing behind it; localhost refuses instantly, which
    // surfaces as a socket failure rather than a timeout, so both outcomes
    // leave the machine disconnected.
    let addr: SocketAddr = "127.0.0.1:9".parse()?;
    let mut client = Client::new(client_cfg());
    client.connect(addr, "")?;

    let mut events = Vec::new();
    let mut done = false;
    for _ in 0..800 {
        client.update().await?;
        events.extend(client.drain_events());
        if client.state() == ClientStateKind::Disconnected {
            done = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    assert!(done, "attempt should end disconnected");
    assert!(events.iter().any(|e| matches!(
        e,
        ClientEvent::ConnectFailed(ConnectFailure::TimedOut { .. })
            | ClientEvent::ConnectFailed(ConnectFailure::Socket { .. })
    )));
    Ok(())
}
