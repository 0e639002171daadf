//! Beacon integration test harness.
//!
//! Every test builds a handful of agents on one in-process
//! [`MemoryNetwork`] and drives them through the public API only.
//! Most run on a paused clock, so expiry and re-announce periods cost
//! no wall time:
//!
//!   cargo test --test integration

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use beacon_agent::{AgentConfig, DiscoveryAgent, MemoryNetwork, Resource, Subscription};

mod discovery;
mod editing;
mod faults;
mod lifecycle;

// ── Harness ───────────────────────────────────────────────────────────────────

/// Advertised expiry used by the tests. Re-announce period is 0.45 × this.
pub const TEST_EXPIRY_SECS: u32 = 10;

/// Upper bound on any single wait, in (usually virtual) time.
pub const WAIT: Duration = Duration::from_secs(120);

pub fn test_config() -> AgentConfig {
    AgentConfig {
        resource_expiry_secs: TEST_EXPIRY_SECS,
        ..AgentConfig::default()
    }
}

/// A new agent on its own endpoint of `network`.
pub fn agent(network: &MemoryNetwork) -> DiscoveryAgent {
    DiscoveryAgent::new(network.endpoint(), test_config()).expect("agent inside a runtime")
}

/// Wait until `predicate` holds for the subscription's resource list and
/// return that list.
pub async fn wait_for<F>(subscription: &Subscription, what: &str, mut predicate: F) -> Result<Arc<[Resource]>>
where
    F: FnMut(&[Resource]) -> bool,
{
    let mut updates = subscription.updates();
    let wait = async {
        loop {
            let resources = subscription.resources();
            if predicate(&resources[..]) {
                return Ok::<_, anyhow::Error>(resources);
            }
            updates.changed().await.context("subscription closed")?;
        }
    };
    tokio::time::timeout(WAIT, wait)
        .await
        .with_context(|| format!("timed out waiting for {what}"))?
}

/// Let in-flight deliveries drain.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

// ── Tests ─────────────────────────────────────────────────────────────────────

/// The walk-through every other test elaborates on: publish, discover,
/// edit, withdraw.
#[tokio::test(start_paused = true)]
async fn test_publish_edit_dispose_scenario() -> Result<()> {
    let network = MemoryNetwork::new();
    let a = agent(&network);
    let b = agent(&network);

    let rooms = b.subscribe("Room")?;
    let room = a.publish("Room", "conn1", None).await?;

    let seen = wait_for(&rooms, "room to appear", |r| r.len() == 1).await?;
    assert_eq!(seen[0].id(), room.id());
    assert_eq!(seen[0].connection(), "conn1");
    assert!(seen[0].attributes().is_empty());
    assert!(!seen[0].is_local());

    let mut edit = room.request_edit().context("local resource is editable")?;
    edit.put_attribute("k", "v");
    edit.commit().await?;

    let seen = wait_for(&rooms, "edit to arrive", |r| {
        r.first().is_some_and(|res| res.attributes().get("k").map(String::as_str) == Some("v"))
    })
    .await?;
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].id(), room.id());

    a.dispose().await;
    wait_for(&rooms, "room to be withdrawn", |r| r.is_empty()).await?;

    b.dispose().await;
    Ok(())
}
