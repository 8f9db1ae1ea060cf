//! Background recycler for idle user records.
//!
//! Deletion candidates arrive on a channel of domain names, fed by the
//! post-registration grace timer and by removals that drain a pool. The
//! queue decouples the deletion decision from the code path that observed
//! emptiness, keeping the HTTP fast path lock-light.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::info;

use crate::registry::Registry;

/// Consume recycle candidates until the channel closes (which happens when
/// the registry, holder of the sending side, is dropped).
pub async fn run(registry: Arc<Registry>, mut candidates: mpsc::Receiver<String>) {
    while let Some(domain) = candidates.recv().await {
        if registry.try_recycle(&domain) {
            info!(domain, "idle registration recycled");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge;
    use crate::registry::RECYCLE_DELAY;
    use std::time::Duration;

    /// Let the probe task and the recycler drain their queues.
    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn recycles_a_registration_that_never_opened_a_tunnel() {
        let (registry, candidates) = Registry::new(80);
        tokio::spawn(run(registry.clone(), candidates));

        let (_, first_token) = registry.register("e.example").unwrap();
        tokio::time::sleep(RECYCLE_DELAY + Duration::from_millis(100)).await;
        settle().await;

        // the slot is free again and a fresh registration mints a new token
        let (_, second_token) = registry.register("e.example").unwrap();
        assert_ne!(first_token, second_token);
    }

    #[tokio::test(start_paused = true)]
    async fn a_pooled_tunnel_outlives_the_grace_probe() {
        let (registry, candidates) = Registry::new(80);
        tokio::spawn(run(registry.clone(), candidates));

        let (_, token) = registry.register("e.example").unwrap();
        let (_p1, p2) = bridge::pipe();
        registry.put_waiting("e.example", p2).unwrap();

        tokio::time::sleep(RECYCLE_DELAY * 3).await;
        settle().await;

        assert!(registry.authenticate("e.example", &token));
        assert!(registry.tunnel_exists("e.example"));
    }

    #[tokio::test(start_paused = true)]
    async fn draining_the_pool_schedules_a_delayed_recycle() {
        let (registry, candidates) = Registry::new(80);
        tokio::spawn(run(registry.clone(), candidates));

        let (_, token) = registry.register("e.example").unwrap();
        let (_p1, p2) = bridge::pipe();
        let id = registry.put_waiting("e.example", p2).unwrap();

        // ride out the registration grace probe while the tunnel is live
        tokio::time::sleep(RECYCLE_DELAY * 2).await;
        registry.remove_waiting("e.example", id);

        // not yet: the drain probe fires a full grace period after the removal
        tokio::time::sleep(Duration::from_millis(500)).await;
        settle().await;
        assert!(registry.authenticate("e.example", &token));

        tokio::time::sleep(RECYCLE_DELAY).await;
        settle().await;
        assert!(!registry.authenticate("e.example", &token));
    }
}
