#![allow(dead_code)]

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use num_bigint::BigUint;
use tokio_util::sync::CancellationToken;

use smpcnet::coordinator::{Coordinator, CoordinatorParams, DistributionMode, PartyEndpoint};
use smpcnet::node::{ComputeNode, NodeServer};
use smpcnet::repository::{HashMapShareBundleDao, ShareBundleDao};
use smpcnet::share::Party;
use smpcnet::tls::{TlsContext, TlsFiles};
use smpcnet::transport::{Listener, RetryPolicy, Transport};

pub fn prime() -> BigUint {
    smpcnet::config::default_prime()
}

pub fn secrets(values: &[u32]) -> Vec<BigUint> {
    values.iter().map(|v| BigUint::from(*v)).collect()
}

pub fn retry() -> RetryPolicy {
    RetryPolicy {
        delay: Duration::from_millis(100),
        max_attempts: Some(100),
    }
}

pub fn free_addr() -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap()
}

pub fn fixture_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/tls")
}

pub fn tls_transport(name: &str) -> Transport {
    let files = TlsFiles::in_dir(fixture_dir(), name);
    Transport::tls(TlsContext::load(&files, "localhost").unwrap())
}

/// A coordinator and its parties on loopback.
pub struct Cluster {
    pub coordinator: Arc<Coordinator>,
    pub coordinator_addr: SocketAddr,
    pub parties: Vec<PartyEndpoint>,
    pub stores: BTreeMap<u32, Arc<dyn ShareBundleDao>>,
    pub shutdown: CancellationToken,
    transport_for: fn(&str) -> Transport,
    listeners: Vec<Listener>,
}

impl Cluster {
    /// Starts a coordinator for `n` parties without starting any party.
    pub async fn coordinator_only(
        n: u32,
        threshold: usize,
        mode: DistributionMode,
        transport_for: fn(&str) -> Transport,
    ) -> Cluster {
        let shutdown = CancellationToken::new();
        let parties: Vec<PartyEndpoint> = (1..=n)
            .map(|id| PartyEndpoint {
                party: Party::new(id),
                addr: free_addr(),
            })
            .collect();
        let coordinator = Arc::new(
            Coordinator::new(
                CoordinatorParams {
                    threshold,
                    parties: parties.clone(),
                    prime: prime(),
                    mode,
                    retry: retry(),
                },
                transport_for("Controller"),
                shutdown.clone(),
            )
            .unwrap(),
        );
        let listener = coordinator
            .start_listener("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        Cluster {
            coordinator,
            coordinator_addr: listener.local_addr(),
            parties,
            stores: BTreeMap::new(),
            shutdown,
            transport_for,
            listeners: vec![listener],
        }
    }

    /// Starts a coordinator and all `n` parties.
    pub async fn start(
        n: u32,
        threshold: usize,
        mode: DistributionMode,
        transport_for: fn(&str) -> Transport,
    ) -> Cluster {
        let mut cluster = Cluster::coordinator_only(n, threshold, mode, transport_for).await;
        for id in 1..=n {
            cluster.start_party(id).await;
        }
        cluster
    }

    pub fn plain(_name: &str) -> Transport {
        Transport::plain()
    }

    pub async fn start_party(&mut self, id: u32) {
        let endpoint = self.parties[id as usize - 1].clone();
        let node = ComputeNode::new(id).unwrap();
        let store: Arc<dyn ShareBundleDao> = Arc::new(HashMapShareBundleDao::default());
        let server = Arc::new(NodeServer::new(
            node,
            store.clone(),
            self.coordinator_addr,
            (self.transport_for)(endpoint.party.name()),
            retry(),
            self.shutdown.clone(),
        ));
        let listener = server.serve(endpoint.addr).await.unwrap();
        self.stores.insert(id, store);
        self.listeners.push(listener);
    }

    /// Waits until every party has reported for `computation_id`.
    pub async fn wait_for_all(&self, computation_id: &str) {
        let n = self.parties.len();
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let received = self
                    .coordinator
                    .partial_sums(computation_id)
                    .map(|sums| sums.len())
                    .unwrap_or_default();
                if received == n {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("not every party reported");
    }

    pub async fn stop(self) {
        self.shutdown.cancel();
        for listener in self.listeners {
            listener.join().await.unwrap();
        }
    }
}
