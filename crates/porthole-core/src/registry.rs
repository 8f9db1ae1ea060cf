//! Server-side registry of subdomain registrations: `domain → user` with a
//! bearer token and a pool of waiting tunnels per user.
//!
//! Locking: the registry map has its own reader/writer lock, each user
//! guards its pool and timestamps with another. The registry lock is taken
//! first, the user lock second, never the other way around, and neither is
//! held across I/O.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use parking_lot::RwLock;
use rand::RngCore;
use subtle::ConstantTimeEq;
use tokio::io::DuplexStream;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

use crate::error::{Result, TunnelError};
use crate::pool::{TunnelId, WaitingConn, WaitingPool};

/// Grace period between a pool draining (or a registration with no tunnel
/// yet) and the user record becoming eligible for deletion.
pub const RECYCLE_DELAY: Duration = Duration::from_secs(1);

/// Raw length of a minted bearer token, before text encoding.
const TOKEN_LEN: usize = 32;

pub struct User {
    token: String,
    #[allow(dead_code)]
    created_at: Instant,
    state: RwLock<UserState>,
}

struct UserState {
    pool: WaitingPool,
    last_conn_at: Instant,
}

pub struct Registry {
    /// Port of the public HTTP ingress, used to build the full domain
    /// returned at registration.
    public_port: u16,
    users: RwLock<HashMap<String, Arc<User>>>,
    recycles: mpsc::Sender<String>,
}

impl Registry {
    /// Create the registry and the receiving end of its recycle-candidate
    /// queue, which [`crate::recycle::run`] consumes.
    pub fn new(public_port: u16) -> (Arc<Self>, mpsc::Receiver<String>) {
        let (recycles, candidates) = mpsc::channel(16);
        let registry = Arc::new(Self {
            public_port,
            users: RwLock::new(HashMap::new()),
            recycles,
        });
        (registry, candidates)
    }

    /// Register `domain`, minting a fresh token. Fails with
    /// [`TunnelError::NameTaken`] while the domain has live tunnels; a
    /// registered-but-idle domain is re-assignable during its grace window.
    pub fn register(&self, domain: &str) -> Result<(String, String)> {
        if self.tunnel_exists(domain) {
            return Err(TunnelError::NameTaken(domain.to_string()));
        }

        let token = mint_token();
        let now = Instant::now();
        let user = Arc::new(User {
            token: token.clone(),
            created_at: now,
            state: RwLock::new(UserState {
                pool: WaitingPool::default(),
                last_conn_at: now,
            }),
        });

        let count = {
            let mut users = self.users.write();
            users.insert(domain.to_string(), user);
            users.len()
        };
        debug!(domain, users = count, "domain registered");

        // reclaim the slot if the client never follows through with a tunnel
        self.schedule_recycle(domain.to_string());

        Ok((self.full_domain(domain), token))
    }

    /// True iff the domain exists and the presented token matches the
    /// stored one. A missing entry, or an empty domain or token, is
    /// unauthenticated.
    pub fn authenticate(&self, domain: &str, token: &str) -> bool {
        if domain.is_empty() || token.is_empty() {
            return false;
        }
        let Some(user) = self.lookup(domain) else {
            return false;
        };
        token.as_bytes().ct_eq(user.token.as_bytes()).into()
    }

    /// True iff the domain is registered and has at least one waiting
    /// tunnel.
    pub fn tunnel_exists(&self, domain: &str) -> bool {
        match self.lookup(domain) {
            Some(user) => !user.state.read().pool.is_empty(),
            None => false,
        }
    }

    /// Take the longest-waiting endpoint for `domain`.
    pub fn get_idle(&self, domain: &str) -> Result<DuplexStream> {
        let user = self.lookup(domain).ok_or(TunnelError::NoIdle)?;
        let waiting = user.state.write().pool.take()?;
        debug!(domain, id = %waiting.id, "virtual connection dispatched");
        Ok(waiting.conn)
    }

    /// Append a waiting endpoint to `domain`'s pool, refusing beyond
    /// [`crate::pool::MAX_WAITING`]. The capacity check and the append
    /// happen under one lock acquisition.
    pub fn put_waiting(&self, domain: &str, conn: DuplexStream) -> Result<TunnelId> {
        let user = self.lookup(domain).ok_or(TunnelError::Unauthenticated)?;
        let id = TunnelId::next();
        let mut state = user.state.write();
        state.pool.put(WaitingConn { id, conn })?;
        state.last_conn_at = Instant::now();
        let waiting = state.pool.len();
        drop(state);
        debug!(domain, %id, waiting, "tunnel pooled");
        Ok(id)
    }

    /// Remove a closed tunnel from `domain`'s pool. When the pool drains,
    /// schedule a recycle probe for the grace period from now.
    pub fn remove_waiting(&self, domain: &str, id: TunnelId) {
        let Some(user) = self.lookup(domain) else {
            return;
        };
        let mut state = user.state.write();
        state.pool.remove(id);
        let drained = state.pool.is_empty();
        let waiting = state.pool.len();
        drop(state);
        debug!(domain, %id, waiting, "tunnel removed");
        if drained {
            self.schedule_recycle(domain.to_string());
        }
    }

    /// Delete `domain` if its pool has stayed empty for the whole grace
    /// period. Called by the recycler for each candidate it receives.
    /// Returns whether the record was deleted.
    pub fn try_recycle(&self, domain: &str) -> bool {
        let Some(user) = self.lookup(domain) else {
            return false;
        };
        if !Self::recyclable(&user) {
            return false;
        }

        let mut users = self.users.write();
        // the record may have been replaced or revived since the check
        match users.get(domain) {
            Some(current) if Arc::ptr_eq(current, &user) && Self::recyclable(current) => {
                users.remove(domain);
                true
            }
            _ => false,
        }
    }

    fn recyclable(user: &Arc<User>) -> bool {
        let state = user.state.read();
        state.pool.is_empty() && state.last_conn_at.elapsed() >= RECYCLE_DELAY
    }

    fn lookup(&self, domain: &str) -> Option<Arc<User>> {
        self.users.read().get(domain).cloned()
    }

    fn schedule_recycle(&self, domain: String) {
        let recycles = self.recycles.clone();
        tokio::spawn(async move {
            tokio::time::sleep(RECYCLE_DELAY).await;
            let _ = recycles.send(domain).await;
        });
    }

    fn full_domain(&self, domain: &str) -> String {
        if self.public_port == 80 {
            domain.to_string()
        } else {
            format!("{domain}:{}", self.public_port)
        }
    }
}

fn mint_token() -> String {
    let mut raw = [0u8; TOKEN_LEN];
    rand::rng().fill_bytes(&mut raw);
    URL_SAFE_NO_PAD.encode(raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge;
    use crate::pool::MAX_WAITING;

    fn registry() -> Arc<Registry> {
        Registry::new(8080).0
    }

    fn attach_tunnel(registry: &Registry, domain: &str) -> TunnelId {
        let (_p1, p2) = bridge::pipe();
        registry.put_waiting(domain, p2).unwrap()
    }

    #[tokio::test]
    async fn register_returns_domain_with_port_and_a_token() {
        let (registry, _candidates) = Registry::new(8080);
        let (full_domain, token) = registry.register("a.example").unwrap();
        assert_eq!(full_domain, "a.example:8080");
        assert!(!token.is_empty());
    }

    #[tokio::test]
    async fn register_on_port_80_returns_domain_verbatim() {
        let (registry, _candidates) = Registry::new(80);
        let (full_domain, _token) = registry.register("a.example").unwrap();
        assert_eq!(full_domain, "a.example");
    }

    #[tokio::test]
    async fn register_rejects_a_domain_with_live_tunnels() {
        let registry = registry();
        registry.register("a.example").unwrap();
        attach_tunnel(&registry, "a.example");

        assert!(matches!(
            registry.register("a.example"),
            Err(TunnelError::NameTaken(_))
        ));
    }

    #[tokio::test]
    async fn register_reassigns_an_idle_domain() {
        let registry = registry();
        let (_, first_token) = registry.register("a.example").unwrap();
        let (_, second_token) = registry.register("a.example").unwrap();
        assert_ne!(first_token, second_token);
        assert!(!registry.authenticate("a.example", &first_token));
        assert!(registry.authenticate("a.example", &second_token));
    }

    #[tokio::test]
    async fn authenticate_rejects_missing_wrong_and_empty() {
        let registry = registry();
        let (_, token) = registry.register("a.example").unwrap();

        assert!(registry.authenticate("a.example", &token));
        assert!(!registry.authenticate("a.example", "wrong"));
        assert!(!registry.authenticate("a.example", ""));
        assert!(!registry.authenticate("", &token));
        assert!(!registry.authenticate("missing.example", &token));
    }

    #[tokio::test]
    async fn get_idle_drains_the_pool_in_order() {
        let registry = registry();
        registry.register("a.example").unwrap();
        attach_tunnel(&registry, "a.example");
        attach_tunnel(&registry, "a.example");

        assert!(registry.tunnel_exists("a.example"));
        registry.get_idle("a.example").unwrap();
        registry.get_idle("a.example").unwrap();
        assert!(!registry.tunnel_exists("a.example"));
        assert!(matches!(
            registry.get_idle("a.example"),
            Err(TunnelError::NoIdle)
        ));
        assert!(matches!(
            registry.get_idle("missing.example"),
            Err(TunnelError::NoIdle)
        ));
    }

    #[tokio::test]
    async fn put_waiting_enforces_the_cap() {
        let registry = registry();
        registry.register("a.example").unwrap();
        for _ in 0..MAX_WAITING {
            attach_tunnel(&registry, "a.example");
        }

        let (_p1, p2) = bridge::pipe();
        assert!(matches!(
            registry.put_waiting("a.example", p2),
            Err(TunnelError::Capacity(MAX_WAITING))
        ));

        // a slot opens once a tunnel is dispatched
        registry.get_idle("a.example").unwrap();
        attach_tunnel(&registry, "a.example");
    }

    #[tokio::test]
    async fn put_waiting_requires_a_registration() {
        let registry = registry();
        let (_p1, p2) = bridge::pipe();
        assert!(matches!(
            registry.put_waiting("missing.example", p2),
            Err(TunnelError::Unauthenticated)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn try_recycle_deletes_only_stale_idle_users() {
        let registry = registry();
        registry.register("a.example").unwrap();

        // too fresh
        assert!(!registry.try_recycle("a.example"));

        tokio::time::advance(RECYCLE_DELAY + Duration::from_millis(100)).await;
        // live tunnels protect the record
        let id = attach_tunnel(&registry, "a.example");
        assert!(!registry.try_recycle("a.example"));

        registry.remove_waiting("a.example", id);
        tokio::time::advance(RECYCLE_DELAY + Duration::from_millis(100)).await;
        assert!(registry.try_recycle("a.example"));
        assert!(!registry.authenticate("a.example", "anything"));
        // already gone
        assert!(!registry.try_recycle("a.example"));
    }
}
