use crate::*;

use beacon_agent::AgentError;

fn attribute(resource: &Resource, key: &str) -> Option<String> {
    resource.attributes().get(key).cloned()
}

#[tokio::test(start_paused = true)]
async fn test_stale_editor_is_rejected() -> Result<()> {
    let network = MemoryNetwork::new();
    let a = agent(&network);
    let b = agent(&network);
    let rooms = b.subscribe("Room")?;
    let room = a.publish("Room", "conn1", None).await?;

    let mut first = room.request_edit().context("editable")?;
    let mut second = room.request_edit().context("editable")?;
    assert_eq!(first.baseline(), 0);
    assert_eq!(second.baseline(), 0);

    first.put_attribute("k", "v");
    second.put_attribute("k", "w");
    first.commit().await?;
    assert_eq!(room.edit_serial(), Some(1));

    match second.commit().await {
        Err(AgentError::StaleEdit { baseline, current }) => {
            assert_eq!(baseline, 0);
            assert_eq!(current, 1);
        }
        other => panic!("expected stale edit, got {other:?}"),
    }
    assert_eq!(attribute(&room, "k").as_deref(), Some("v"));

    wait_for(&rooms, "committed value", |r| {
        r.first().and_then(|res| attribute(res, "k")).as_deref() == Some("v")
    })
    .await?;

    // A fresh editor starts from the new serial and succeeds.
    let mut third = room.request_edit().context("editable")?;
    assert_eq!(third.baseline(), 1);
    third.put_attribute("k", "w");
    third.commit().await?;
    wait_for(&rooms, "second commit", |r| {
        r.first().and_then(|res| attribute(res, "k")).as_deref() == Some("w")
    })
    .await?;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_remove_attribute_propagates() -> Result<()> {
    let network = MemoryNetwork::new();
    let a = agent(&network);
    let b = agent(&network);
    let rooms = b.subscribe("Room")?;

    let attributes = beacon_core::AttributeMap::from([
        ("map".to_string(), "harbor".to_string()),
        ("mode".to_string(), "ctf".to_string()),
    ]);
    let room = a.publish("Room", "conn1", Some(attributes)).await?;
    wait_for(&rooms, "room", |r| r.len() == 1).await?;

    let mut edit = room.request_edit().context("editable")?;
    edit.remove_attribute("mode").put_attribute("map", "dunes");
    edit.commit().await?;

    let seen = wait_for(&rooms, "edited attributes", |r| {
        r.first().is_some_and(|res| !res.attributes().contains_key("mode"))
    })
    .await?;
    assert_eq!(attribute(&seen[0], "map").as_deref(), Some("dunes"));
    assert_eq!(seen[0].attributes().len(), 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_remote_resources_are_read_only() -> Result<()> {
    let network = MemoryNetwork::new();
    let a = agent(&network);
    let b = agent(&network);
    let rooms = b.subscribe("Room")?;
    a.publish("Room", "conn1", None).await?;

    let seen = wait_for(&rooms, "room", |r| r.len() == 1).await?;
    assert!(seen[0].request_edit().is_none());
    assert!(seen[0].edit_serial().is_none());
    Ok(())
}

/// Editors racing from the same baseline: exactly one commit lands.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_commits_have_one_winner() -> Result<()> {
    let network = MemoryNetwork::new();
    let a = agent(&network);
    let room = a.publish("Room", "conn1", None).await?;

    let editors: Vec<_> = (0..8)
        .map(|i| {
            let mut edit = room.request_edit().expect("local resource");
            edit.put_attribute("winner", i.to_string());
            edit
        })
        .collect();

    let tasks: Vec<_> = editors
        .into_iter()
        .map(|edit| tokio::spawn(edit.commit()))
        .collect();

    let mut committed = 0;
    let mut stale = 0;
    for task in tasks {
        match task.await? {
            Ok(()) => committed += 1,
            Err(e) if e.is_stale_edit() => stale += 1,
            Err(e) => return Err(e.into()),
        }
    }
    assert_eq!(committed, 1);
    assert_eq!(stale, 7);
    assert_eq!(room.edit_serial(), Some(1));
    assert!(room.attributes().contains_key("winner"));

    a.dispose().await;
    Ok(())
}

/// Resources peers could not decode are refused instead of published
/// invisibly, and a refused edit leaves the published state alone.
#[tokio::test(start_paused = true)]
async fn test_oversized_publish_and_edit_are_refused() -> Result<()> {
    let network = MemoryNetwork::new();
    let a = agent(&network);
    let b = agent(&network);
    let rooms = b.subscribe("Room")?;

    let crowded: beacon_agent::AttributeMap = (0..1100)
        .map(|i| (format!("key{i}"), "x".to_string()))
        .collect();
    let err = a.publish("Room", "crowded", Some(crowded)).await.unwrap_err();
    assert!(matches!(err, AgentError::Unencodable(_)), "{err}");
    assert!(a.local_resources().is_empty());

    let room = a.publish("Room", "conn1", None).await?;
    wait_for(&rooms, "room", |r| r.len() == 1).await?;

    let mut edit = room.request_edit().context("editable")?;
    edit.put_attribute("blob", "x".repeat(70 * 1024));
    assert!(matches!(edit.commit().await, Err(AgentError::Unencodable(_))));
    assert_eq!(room.edit_serial(), Some(0));

    tokio::time::sleep(Duration::from_secs(TEST_EXPIRY_SECS as u64)).await;
    let seen = rooms.resources();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].connection(), "conn1");
    assert!(seen[0].attributes().is_empty());
    Ok(())
}
