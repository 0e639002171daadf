use crate::*;

use std::sync::atomic::{AtomicUsize, Ordering};

use beacon_core::AttributeMap;

/// A subscriber that arrives after the publication hears about it from the
/// query reply, well before the first periodic re-announce.
#[tokio::test(start_paused = true)]
async fn test_late_subscriber_discovers_via_query() -> Result<()> {
    let network = MemoryNetwork::new();
    let a = agent(&network);
    let b = agent(&network);

    let room = a.publish("Room", "conn1", None).await?;
    settle().await;

    let started = tokio::time::Instant::now();
    let rooms = b.subscribe("Room")?;
    let seen = wait_for(&rooms, "reply to query", |r| r.len() == 1).await?;
    assert_eq!(seen[0].id(), room.id());
    assert!(started.elapsed() < Duration::from_secs(1));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_attributes_travel_with_publication() -> Result<()> {
    let network = MemoryNetwork::new();
    let a = agent(&network);
    let b = agent(&network);
    let rooms = b.subscribe("Room")?;

    let attributes = AttributeMap::from([
        ("map".to_string(), "harbor".to_string()),
        ("players".to_string(), "3".to_string()),
    ]);
    a.publish("Room", "conn1", Some(attributes.clone())).await?;

    let seen = wait_for(&rooms, "room", |r| r.len() == 1).await?;
    assert_eq!(*seen[0].attributes(), attributes);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_categories_are_isolated() -> Result<()> {
    let network = MemoryNetwork::new();
    let a = agent(&network);
    let b = agent(&network);
    let rooms = b.subscribe("Room")?;
    let lobbies = b.subscribe("Lobby")?;

    a.publish("Room", "r1", None).await?;
    a.publish("Room", "r2", None).await?;
    a.publish("Lobby", "l1", None).await?;
    a.publish("Arena", "x", None).await?;

    wait_for(&rooms, "two rooms", |r| r.len() == 2).await?;
    let seen = wait_for(&lobbies, "one lobby", |r| r.len() == 1).await?;
    assert_eq!(seen[0].category(), "Lobby");

    tokio::time::sleep(Duration::from_secs(TEST_EXPIRY_SECS as u64)).await;
    assert_eq!(rooms.resources().len(), 2);
    assert!(rooms.resources().iter().all(|r| r.category() == "Room"));
    assert_eq!(lobbies.resources().len(), 1);
    Ok(())
}

/// Lists come back sorted by id and the same allocation is reused until
/// something changes.
#[tokio::test(start_paused = true)]
async fn test_resource_list_is_sorted_and_cached() -> Result<()> {
    let network = MemoryNetwork::new();
    let a = agent(&network);
    let b = agent(&network);
    let rooms = b.subscribe("Room")?;

    for i in 0..5 {
        a.publish("Room", format!("conn{i}"), None).await?;
    }
    let first = wait_for(&rooms, "five rooms", |r| r.len() == 5).await?;
    let ids: Vec<_> = first.iter().map(Resource::id).collect();
    let mut sorted = ids.clone();
    sorted.sort();
    assert_eq!(ids, sorted);

    let second = rooms.resources();
    assert!(Arc::ptr_eq(&first, &second));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_subscriptions_to_one_category_share_updates() -> Result<()> {
    let network = MemoryNetwork::new();
    let a = agent(&network);
    let b = agent(&network);

    let first = b.subscribe("Room")?;
    let second = b.subscribe("Room")?;
    let calls = Arc::new(AtomicUsize::new(0));
    {
        let calls = calls.clone();
        second.on_updated(move || {
            calls.fetch_add(1, Ordering::SeqCst);
        });
    }

    a.publish("Room", "conn1", None).await?;
    wait_for(&first, "room on first", |r| r.len() == 1).await?;
    wait_for(&second, "room on second", |r| r.len() == 1).await?;
    assert_eq!(first.serial(), second.serial());

    // The category outlives one of its subscriptions.
    first.dispose();
    a.publish("Room", "conn2", None).await?;
    wait_for(&second, "second room", |r| r.len() == 2).await?;
    assert!(calls.load(Ordering::SeqCst) >= 2);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_serial_only_moves_forward() -> Result<()> {
    let network = MemoryNetwork::new();
    let a = agent(&network);
    let b = agent(&network);
    let rooms = b.subscribe("Room")?;

    let mut last = rooms.serial();
    let room = a.publish("Room", "conn1", None).await?;
    for i in 0..5 {
        let mut edit = room.request_edit().context("editable")?;
        edit.put_attribute("round", i.to_string());
        edit.commit().await?;
        settle().await;
        let serial = rooms.serial();
        assert!(serial > last, "serial went from {last} to {serial}");
        last = serial;
    }
    Ok(())
}
