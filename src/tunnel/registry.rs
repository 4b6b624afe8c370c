//! Tunnel registry — live mapping from public hostname to tunnel connection.
//!
//! A single `RwLock` guards the map: routing lookups take the read lock,
//! registration and eviction take the write lock. Connections are handed out
//! as `Arc`s and used outside the lock, so an eviction can race with an
//! in-flight send; that send simply fails.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::RwLock;
use tracing::{info, warn};

use super::naming::WordLists;
use super::transport::TunnelConn;
use crate::error::RegistryError;

/// Registry tuning knobs, taken from `[relay]` config.
#[derive(Debug, Clone)]
pub struct RegistrySettings {
    /// Labels tried before giving up on a registration.
    pub max_name_attempts: usize,
    /// Deadline for each request/response exchange on a tunnel.
    pub tunnel_timeout: Duration,
    /// Deadline for writing the greeting line.
    pub greeting_timeout: Duration,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            max_name_attempts: 16,
            tunnel_timeout: Duration::from_secs(60),
            greeting_timeout: Duration::from_secs(10),
        }
    }
}

/// One row of the status view.
#[derive(Debug, Clone, Serialize)]
pub struct TunnelInfo {
    pub hostname: String,
    pub peer: String,
    pub connected_secs: u64,
    pub requests_served: u64,
}

struct Inner {
    tunnels: HashMap<String, Arc<TunnelConn>>,
    /// Hostnames handed out whose greeting/handshake is still in progress.
    reserved: HashSet<String>,
    rng: StdRng,
}

/// Shared, cloneable handle to the tunnel map.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<RwLock<Inner>>,
    domain: Arc<str>,
    words: Arc<WordLists>,
    settings: RegistrySettings,
}

impl Registry {
    /// Create an empty registry for `domain` that draws labels from `words`
    /// using `rng`.
    pub fn new(domain: &str, words: WordLists, rng: StdRng, settings: RegistrySettings) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner {
                tunnels: HashMap::new(),
                reserved: HashSet::new(),
                rng,
            })),
            domain: domain.to_ascii_lowercase().into(),
            words: Arc::new(words),
            settings,
        }
    }

    /// Registry with the built-in word lists and an entropy-seeded RNG.
    pub fn with_defaults(domain: &str, settings: RegistrySettings) -> Self {
        Self::new(domain, WordLists::default(), StdRng::from_entropy(), settings)
    }

    /// The relay's base domain.
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Register a freshly accepted tunnel connection.
    ///
    /// Picks an unused label, writes `<label>\n` to the agent, then takes over
    /// the socket as an HTTP/1.1 tunnel. Returns the bare label. On error the
    /// socket is dropped (closed) and nothing is registered.
    pub async fn register<S>(&self, io: S, peer: SocketAddr) -> Result<String, RegistryError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (label, hostname) = self.reserve().await?;

        let attached = self.attach(io, peer, &label).await;

        let mut inner = self.inner.write().await;
        inner.reserved.remove(&hostname);
        let conn = attached?;
        inner.tunnels.insert(hostname.clone(), Arc::new(conn));
        drop(inner);

        info!(hostname = %hostname, peer = %peer, "Tunnel registered");
        Ok(label)
    }

    /// Claim a hostname that is neither live nor mid-registration.
    async fn reserve(&self) -> Result<(String, String), RegistryError> {
        let mut guard = self.inner.write().await;
        let inner = &mut *guard;
        let attempts = self.settings.max_name_attempts.max(1);

        for _ in 0..attempts {
            let label = self.words.generate(&mut inner.rng);
            let hostname = format!("{label}.{}", self.domain);
            if !inner.tunnels.contains_key(&hostname) && !inner.reserved.contains(&hostname) {
                inner.reserved.insert(hostname.clone());
                return Ok((label, hostname));
            }
        }

        warn!(attempts, "Subdomain namespace exhausted");
        Err(RegistryError::NamespaceExhausted { attempts })
    }

    async fn attach<S>(
        &self,
        mut io: S,
        peer: SocketAddr,
        label: &str,
    ) -> Result<TunnelConn, RegistryError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let greeting = format!("{label}\n");
        tokio::time::timeout(self.settings.greeting_timeout, async {
            io.write_all(greeting.as_bytes()).await?;
            io.flush().await
        })
        .await
        .map_err(|_| std::io::Error::from(std::io::ErrorKind::TimedOut))
        .and_then(|r| r)
        .map_err(RegistryError::Greeting)?;

        TunnelConn::open(io, peer, self.settings.tunnel_timeout)
            .await
            .map_err(RegistryError::Handshake)
    }

    /// Exact-match lookup.
    pub async fn resolve(&self, hostname: &str) -> Option<Arc<TunnelConn>> {
        self.inner.read().await.tunnels.get(hostname).cloned()
    }

    /// Remove `hostname` and close its connection. Safe to call on a missing key.
    pub async fn evict(&self, hostname: &str) {
        let removed = self.inner.write().await.tunnels.remove(hostname);
        if let Some(conn) = removed {
            conn.close();
            info!(hostname = %hostname, "Tunnel evicted");
        }
    }

    /// Evict `hostname` only if it still maps to `conn`.
    ///
    /// A failed send must not evict a newer tunnel that re-registered under
    /// the same hostname. `conn` is closed either way.
    pub async fn evict_conn(&self, hostname: &str, conn: &Arc<TunnelConn>) {
        {
            let mut inner = self.inner.write().await;
            if inner
                .tunnels
                .get(hostname)
                .is_some_and(|live| Arc::ptr_eq(live, conn))
            {
                inner.tunnels.remove(hostname);
                info!(hostname = %hostname, "Tunnel evicted");
            }
        }
        conn.close();
    }

    /// Evict tunnels whose connection has already ended (agent hung up while idle).
    /// Returns the evicted hostnames.
    pub async fn sweep_closed(&self) -> Vec<String> {
        let mut inner = self.inner.write().await;
        let dead: Vec<String> = inner
            .tunnels
            .iter()
            .filter(|(_, conn)| conn.is_closed())
            .map(|(hostname, _)| hostname.clone())
            .collect();
        for hostname in &dead {
            if let Some(conn) = inner.tunnels.remove(hostname) {
                conn.close();
            }
            warn!(hostname = %hostname, "Evicted tunnel (connection closed)");
        }
        dead
    }

    /// Close and remove every tunnel (relay shutdown).
    pub async fn drain_all(&self) {
        let mut inner = self.inner.write().await;
        for (hostname, conn) in inner.tunnels.drain() {
            conn.close();
            info!(hostname = %hostname, "Drained tunnel for relay shutdown");
        }
    }

    /// Current tunnels, sorted by hostname.
    pub async fn snapshot(&self) -> Vec<TunnelInfo> {
        let inner = self.inner.read().await;
        let mut rows: Vec<TunnelInfo> = inner
            .tunnels
            .iter()
            .map(|(hostname, conn)| TunnelInfo {
                hostname: hostname.clone(),
                peer: conn.peer().to_string(),
                connected_secs: conn.connected_at().elapsed().as_secs(),
                requests_served: conn.served(),
            })
            .collect();
        rows.sort_by(|a, b| a.hostname.cmp(&b.hostname));
        rows
    }

    #[cfg(test)]
    pub(crate) async fn insert(&self, hostname: &str, conn: Arc<TunnelConn>) {
        self.inner
            .write()
            .await
            .tunnels
            .insert(hostname.to_string(), conn);
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.tunnels.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader, DuplexStream};

    fn peer() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    fn registry(seed: u64) -> Registry {
        Registry::new(
            "Example.com",
            WordLists::default(),
            StdRng::seed_from_u64(seed),
            RegistrySettings::default(),
        )
    }

    async fn read_greeting(far: &mut BufReader<DuplexStream>) -> String {
        let mut line = String::new();
        far.read_line(&mut line).await.unwrap();
        line
    }

    #[tokio::test]
    async fn test_register_writes_label_and_is_resolvable() {
        let reg = registry(3);
        let (near, far) = tokio::io::duplex(4096);
        let mut far = BufReader::new(far);

        let label = reg.register(near, peer()).await.unwrap();
        assert!(!label.is_empty());
        assert_eq!(read_greeting(&mut far).await, format!("{label}\n"));

        let hostname = format!("{label}.example.com");
        assert!(reg.resolve(&hostname).await.is_some());
        assert!(reg.resolve(&label).await.is_none());
        assert_eq!(reg.len().await, 1);
    }

    #[tokio::test]
    async fn test_labels_follow_seed() {
        let words = WordLists::default();
        let expected = words.generate(&mut StdRng::seed_from_u64(11));

        let reg = registry(11);
        let (near, _far) = tokio::io::duplex(4096);
        assert_eq!(reg.register(near, peer()).await.unwrap(), expected);
    }

    #[tokio::test]
    async fn test_evict_closes_and_forgets() {
        let reg = registry(5);
        let (near, far) = tokio::io::duplex(4096);
        let mut far = BufReader::new(far);
        let label = reg.register(near, peer()).await.unwrap();
        read_greeting(&mut far).await;
        let hostname = format!("{label}.example.com");

        let conn = reg.resolve(&hostname).await.unwrap();
        reg.evict(&hostname).await;
        assert!(reg.resolve(&hostname).await.is_none());
        assert!(conn.is_closed());

        // The agent side sees EOF once the driver task is gone.
        let mut rest = Vec::new();
        let n = tokio::time::timeout(Duration::from_secs(2), far.read_to_end(&mut rest))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);

        // Idempotent.
        reg.evict(&hostname).await;
        assert!(reg.is_empty().await);
    }

    #[tokio::test]
    async fn test_evict_conn_spares_replacement() {
        let reg = registry(9);
        let (near, _far) = tokio::io::duplex(4096);
        let label = reg.register(near, peer()).await.unwrap();
        let hostname = format!("{label}.example.com");
        let live = reg.resolve(&hostname).await.unwrap();

        let (stale_io, _stale_far) = tokio::io::duplex(4096);
        let stale = Arc::new(
            TunnelConn::open(stale_io, peer(), Duration::from_secs(1))
                .await
                .unwrap(),
        );
        reg.evict_conn(&hostname, &stale).await;
        assert!(stale.is_closed());
        assert!(reg.resolve(&hostname).await.is_some());

        reg.evict_conn(&hostname, &live).await;
        assert!(reg.resolve(&hostname).await.is_none());
    }

    #[tokio::test]
    async fn test_collision_retries_then_exhausts() {
        let words = WordLists::new(["one"], ["alpha"], ["vega"], ["paris"]).unwrap();
        let reg = Registry::new(
            "example.com",
            words,
            StdRng::seed_from_u64(0),
            RegistrySettings {
                max_name_attempts: 4,
                ..RegistrySettings::default()
            },
        );

        let (first, _first_far) = tokio::io::duplex(4096);
        assert_eq!(
            reg.register(first, peer()).await.unwrap(),
            "one-alpha-vega-paris"
        );

        let (second, second_far) = tokio::io::duplex(4096);
        let err = reg.register(second, peer()).await.unwrap_err();
        assert!(matches!(
            err,
            RegistryError::NamespaceExhausted { attempts: 4 }
        ));

        // The rejected agent gets no greeting, only EOF.
        let mut buf = Vec::new();
        let mut second_far = second_far;
        assert_eq!(second_far.read_to_end(&mut buf).await.unwrap(), 0);
        assert_eq!(reg.len().await, 1);
    }

    #[tokio::test]
    async fn test_sweep_evicts_hung_up_agents() {
        let reg = registry(21);
        let (near, far) = tokio::io::duplex(4096);
        let label = reg.register(near, peer()).await.unwrap();
        let conn = reg
            .resolve(&format!("{label}.example.com"))
            .await
            .unwrap();
        drop(far);

        tokio::time::timeout(Duration::from_secs(2), async {
            while !conn.is_closed() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(reg.sweep_closed().await, vec![format!("{label}.example.com")]);
        assert!(reg.is_empty().await);
    }

    #[tokio::test]
    async fn test_snapshot_and_drain() {
        let reg = registry(1);
        let mut fars = Vec::new();
        for _ in 0..3 {
            let (near, far) = tokio::io::duplex(4096);
            reg.register(near, peer()).await.unwrap();
            fars.push(far);
        }
        let rows = reg.snapshot().await;
        assert_eq!(rows.len(), 3);
        assert!(rows.windows(2).all(|w| w[0].hostname < w[1].hostname));
        assert!(rows.iter().all(|r| r.hostname.ends_with(".example.com")));
        assert_eq!(rows[0].peer, "127.0.0.1:40000");

        reg.drain_all().await;
        assert!(reg.snapshot().await.is_empty());
    }
}
