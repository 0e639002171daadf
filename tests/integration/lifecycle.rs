use crate::*;

use std::sync::atomic::{AtomicUsize, Ordering};

use beacon_agent::{AgentError, AgentState};

#[tokio::test(start_paused = true)]
async fn test_disposed_agent_rejects_operations() -> Result<()> {
    let network = MemoryNetwork::new();
    let a = agent(&network);
    let room = a.publish("Room", "conn1", None).await?;
    assert_eq!(a.local_resources().len(), 1);

    a.dispose().await;
    assert!(a.is_disposed());
    assert_eq!(a.state(), AgentState::Disposed);
    assert!(a.local_resources().is_empty());

    assert!(matches!(a.subscribe("Room"), Err(AgentError::Disposed)));
    assert!(matches!(
        a.publish("Room", "conn2", None).await,
        Err(AgentError::Disposed)
    ));

    let mut edit = room.request_edit().context("editable")?;
    edit.put_attribute("k", "v");
    assert!(matches!(edit.commit().await, Err(AgentError::Disposed)));

    // Second dispose is a no-op.
    a.dispose().await;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_transport_runs_only_while_used() -> Result<()> {
    let network = MemoryNetwork::new();
    let a = agent(&network);
    assert_eq!(network.active_endpoints(), 0);

    let first = a.subscribe("Room")?;
    let second = a.subscribe("Lobby")?;
    assert_eq!(network.active_endpoints(), 1);

    first.dispose();
    assert_eq!(network.active_endpoints(), 1);
    drop(second);
    assert_eq!(network.active_endpoints(), 0);

    // A later subscription starts it again.
    let third = a.subscribe("Room")?;
    assert_eq!(network.active_endpoints(), 1);
    third.dispose();
    third.dispose();
    assert_eq!(network.active_endpoints(), 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_dispose_stops_transport_once() -> Result<()> {
    let network = MemoryNetwork::new();
    let a = Arc::new(agent(&network));
    for i in 0..4 {
        a.publish("Room", format!("conn{i}"), None).await?;
    }
    assert_eq!(network.active_endpoints(), 1);

    let tasks: Vec<_> = (0..16)
        .map(|_| {
            let a = a.clone();
            tokio::spawn(async move { a.dispose().await })
        })
        .collect();
    for task in tasks {
        task.await?;
    }
    assert!(a.is_disposed());
    assert_eq!(network.active_endpoints(), 0);
    Ok(())
}

/// A callback may dispose the very subscription it is registered on.
#[tokio::test(start_paused = true)]
async fn test_callback_can_dispose_its_own_subscription() -> Result<()> {
    let network = MemoryNetwork::new();
    let a = agent(&network);
    let b = agent(&network);

    let rooms = Arc::new(b.subscribe("Room")?);
    let calls = Arc::new(AtomicUsize::new(0));
    {
        let calls = calls.clone();
        let weak = Arc::downgrade(&rooms);
        rooms.on_updated(move || {
            calls.fetch_add(1, Ordering::SeqCst);
            if let Some(rooms) = weak.upgrade() {
                rooms.dispose();
            }
        });
    }

    a.publish("Room", "conn1", None).await?;
    tokio::time::timeout(WAIT, async {
        while !rooms.is_disposed() {
            settle().await;
        }
    })
    .await
    .context("callback never ran")?;

    a.publish("Room", "conn2", None).await?;
    tokio::time::sleep(Duration::from_secs(TEST_EXPIRY_SECS as u64)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // The agent itself is still usable.
    let again = b.subscribe("Room")?;
    wait_for(&again, "both rooms", |r| r.len() == 2).await?;
    Ok(())
}

/// A subscriber callback that calls back into its own agent must not
/// deadlock.
#[tokio::test(start_paused = true)]
async fn test_callback_can_reenter_agent() -> Result<()> {
    let network = MemoryNetwork::new();
    let a = agent(&network);
    let b = Arc::new(agent(&network));

    let rooms = b.subscribe("Room")?;
    let nested = Arc::new(std::sync::Mutex::new(Vec::new()));
    {
        let b = Arc::downgrade(&b);
        let nested = nested.clone();
        rooms.on_updated(move || {
            if let Some(b) = b.upgrade() {
                if let Ok(sub) = b.subscribe("Lobby") {
                    nested.lock().unwrap().push(sub);
                }
            }
        });
    }

    a.publish("Room", "conn1", None).await?;
    wait_for(&rooms, "room", |r| r.len() == 1).await?;
    settle().await;
    assert!(!nested.lock().unwrap().is_empty());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_dropping_agent_withdraws_resources() -> Result<()> {
    let network = MemoryNetwork::new();
    let a = agent(&network);
    let b = agent(&network);

    let rooms = b.subscribe("Room")?;
    a.publish("Room", "conn1", None).await?;
    wait_for(&rooms, "room", |r| r.len() == 1).await?;

    drop(a);
    wait_for(&rooms, "withdrawal after drop", |r| r.is_empty()).await?;
    Ok(())
}

/// A subscription handle kept past its agent's dispose goes empty and stops
/// holding the transport, even once its peers are long gone.
#[tokio::test(start_paused = true)]
async fn test_subscription_outliving_dispose_empties() -> Result<()> {
    let network = MemoryNetwork::new();
    let a = agent(&network);
    let b = agent(&network);

    let rooms = b.subscribe("Room")?;
    let mut updates = rooms.updates();
    a.publish("Room", "conn1", None).await?;
    wait_for(&rooms, "room", |r| r.len() == 1).await?;
    updates.borrow_and_update();

    b.dispose().await;
    assert!(rooms.is_disposed());
    assert!(rooms.resources().is_empty());
    // The final update is visible to async waiters.
    assert!(updates.has_changed()?);
    updates.borrow_and_update();

    a.dispose().await;
    tokio::time::sleep(Duration::from_secs(100)).await;
    assert!(rooms.resources().is_empty());
    assert_eq!(network.active_endpoints(), 0);
    assert!(!updates.has_changed()?);

    rooms.dispose();
    drop(rooms);
    assert_eq!(network.active_endpoints(), 0);
    Ok(())
}
