use crate::*;

use std::sync::atomic::{AtomicUsize, Ordering};

/// With half the deliveries dropped, re-announcing still gets both the
/// publication and a later edit across.
#[tokio::test(start_paused = true)]
async fn test_eventual_visibility_under_loss() -> Result<()> {
    let network = MemoryNetwork::new();
    network.set_loss_rate(0.5);
    let a = agent(&network);
    let b = agent(&network);

    let rooms = b.subscribe("Room")?;
    let room = a.publish("Room", "conn1", None).await?;
    wait_for(&rooms, "room despite loss", |r| r.len() == 1).await?;

    let mut edit = room.request_edit().context("editable")?;
    edit.put_attribute("k", "v");
    edit.commit().await?;
    wait_for(&rooms, "edit despite loss", |r| {
        r.first().is_some_and(|res| res.attributes().get("k").map(String::as_str) == Some("v"))
    })
    .await?;
    Ok(())
}

/// Every payload arrives twice; the cache changes once.
#[tokio::test(start_paused = true)]
async fn test_duplicate_delivery_is_idempotent() -> Result<()> {
    let network = MemoryNetwork::new();
    network.set_duplicate(true);
    let a = agent(&network);
    let b = agent(&network);

    let rooms = b.subscribe("Room")?;
    let calls = Arc::new(AtomicUsize::new(0));
    {
        let calls = calls.clone();
        rooms.on_updated(move || {
            calls.fetch_add(1, Ordering::SeqCst);
        });
    }

    a.publish("Room", "conn1", None).await?;
    wait_for(&rooms, "room", |r| r.len() == 1).await?;
    settle().await;

    assert_eq!(rooms.resources().len(), 1);
    assert_eq!(rooms.serial(), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // Re-announcements of unchanged state are invisible too.
    tokio::time::sleep(Duration::from_secs(3 * TEST_EXPIRY_SECS as u64)).await;
    assert_eq!(rooms.serial(), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    Ok(())
}

/// A bye-bye lost in transit is covered by expiry.
#[tokio::test(start_paused = true)]
async fn test_lost_bye_bye_falls_back_to_expiry() -> Result<()> {
    let network = MemoryNetwork::new();
    let a = agent(&network);
    let b = agent(&network);

    let rooms = b.subscribe("Room")?;
    a.publish("Room", "conn1", None).await?;
    wait_for(&rooms, "room", |r| r.len() == 1).await?;

    network.set_loss_rate(1.0);
    a.dispose().await;
    settle().await;
    assert_eq!(rooms.resources().len(), 1, "bye-bye should have been lost");

    let started = tokio::time::Instant::now();
    wait_for(&rooms, "expiry", |r| r.is_empty()).await?;
    let elapsed = started.elapsed();
    assert!(elapsed <= Duration::from_secs(TEST_EXPIRY_SECS as u64 + 1), "took {elapsed:?}");
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_bye_bye_withdraws_before_expiry() -> Result<()> {
    let network = MemoryNetwork::new();
    let a = agent(&network);
    let b = agent(&network);

    let rooms = b.subscribe("Room")?;
    a.publish("Room", "conn1", None).await?;
    a.publish("Room", "conn2", None).await?;
    wait_for(&rooms, "rooms", |r| r.len() == 2).await?;

    let started = tokio::time::Instant::now();
    a.dispose().await;
    wait_for(&rooms, "withdrawal", |r| r.is_empty()).await?;
    assert!(started.elapsed() < Duration::from_secs(1));
    Ok(())
}

/// A live publisher keeps its resource visible indefinitely.
#[tokio::test(start_paused = true)]
async fn test_reannounce_keeps_resource_alive() -> Result<()> {
    let network = MemoryNetwork::new();
    let a = agent(&network);
    let b = agent(&network);

    let rooms = b.subscribe("Room")?;
    a.publish("Room", "conn1", None).await?;
    wait_for(&rooms, "room", |r| r.len() == 1).await?;

    for _ in 0..5 {
        tokio::time::sleep(Duration::from_secs(TEST_EXPIRY_SECS as u64)).await;
        assert_eq!(rooms.resources().len(), 1);
    }
    Ok(())
}
