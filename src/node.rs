use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use num_bigint::BigUint;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::protocol::{Request, Response};
use crate::repository::ShareBundleDao;
use crate::share::{short, Party, Share};
use crate::sss;
use crate::transport::{Listener, MessageHandler, RetryPolicy, Transport};

/// A compute party: reduces the shares it is given to one local sum.
///
/// The node holds no state of its own. Persistence for the store-then-compute flow lives in
/// [`NodeServer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComputeNode {
    party: Party,
}

impl ComputeNode {
    pub fn new(id: u32) -> Result<Self> {
        if id < 1 {
            return Err(Error::Validation("party id must be at least 1".to_string()));
        }
        Ok(ComputeNode {
            party: Party::new(id),
        })
    }

    pub fn id(&self) -> u32 {
        self.party.id()
    }

    pub fn name(&self) -> &str {
        self.party.name()
    }

    pub fn party(&self) -> &Party {
        &self.party
    }

    /// Sums this party's share values modulo `prime`.
    ///
    /// # Arguments
    ///
    /// * `shares` - The party's bundle: one share per secret, all addressed to this party.
    /// * `prime` - The field modulus, at least 2.
    ///
    /// # Returns
    ///
    /// `Σ value mod prime`. An empty bundle sums to zero.
    pub fn compute_sum(&self, shares: &[Share], prime: &BigUint) -> Result<BigUint> {
        validate_bundle(self.id(), shares)?;
        let values: Vec<BigUint> = shares.iter().map(|share| share.value.clone()).collect();
        let sum = sss::add_shares(&values, prime)?;
        debug!(
            "[{}] Computed sum of {} shares: {}",
            self.name(),
            shares.len(),
            short(&sum)
        );
        Ok(sum)
    }
}

fn validate_bundle(party_id: u32, shares: &[Share]) -> Result<()> {
    let mut seen = HashSet::with_capacity(shares.len());
    for share in shares {
        if share.party_id != party_id {
            return Err(Error::Validation(format!(
                "share {} is addressed to party {}, not {}",
                share.name, share.party_id, party_id
            )));
        }
        if !seen.insert(share.secret_idx) {
            return Err(Error::Validation(format!(
                "secret index {} appears twice in the bundle",
                share.secret_idx
            )));
        }
    }
    Ok(())
}

/// How long `compute_stored` waits for its `store_shares` to land.
pub const STORE_WAIT: Duration = Duration::from_secs(5);

/// A [`ComputeNode`] wired to the network: it answers coordinator requests and reports partial
/// sums back to `coordinator`.
pub struct NodeServer {
    node: ComputeNode,
    store: Arc<dyn ShareBundleDao>,
    coordinator: SocketAddr,
    transport: Transport,
    retry: RetryPolicy,
    shutdown: CancellationToken,
    stored: Notify,
    store_wait: Duration,
}

impl NodeServer {
    pub fn new(
        node: ComputeNode,
        store: Arc<dyn ShareBundleDao>,
        coordinator: SocketAddr,
        transport: Transport,
        retry: RetryPolicy,
        shutdown: CancellationToken,
    ) -> Self {
        NodeServer {
            node,
            store,
            coordinator,
            transport,
            retry,
            shutdown,
            stored: Notify::new(),
            store_wait: STORE_WAIT,
        }
    }

    /// Overrides [`STORE_WAIT`].
    pub fn with_store_wait(mut self, store_wait: Duration) -> Self {
        self.store_wait = store_wait;
        self
    }

    pub fn node(&self) -> &ComputeNode {
        &self.node
    }

    /// Starts listening on `addr` until the server's shutdown token is cancelled.
    ///
    /// # Examples
    ///
    /// ```ignore
    /// let server = Arc::new(NodeServer::new(node, dao(None)?, coordinator, transport, retry, token));
    /// let listener = server.serve("0.0.0.0:8001".parse()?).await?;
    /// listener.join().await?;
    /// ```
    pub async fn serve(self: Arc<Self>, addr: SocketAddr) -> Result<Listener> {
        let name = self.node.name().to_string();
        let shutdown = self.shutdown.clone();
        let transport = self.transport.clone();
        transport
            .listen::<Request, NodeServer>(addr, &name, self, shutdown)
            .await
    }

    /// Handles one request from the coordinator.
    ///
    /// Validation failures are returned to the listener, which logs them. No reply is sent for a
    /// request that fails.
    pub async fn handle_request(&self, request: Request) -> Result<()> {
        debug!(
            "[{}] Received {} for {}",
            self.node.name(),
            request.action(),
            request.computation_id()
        );
        match request {
            Request::ComputeSum {
                computation_id,
                shares,
                prime,
            } => {
                let sum = self.node.compute_sum(&shares, &prime)?;
                self.report(computation_id, sum).await
            }
            Request::StoreShares {
                computation_id,
                shares,
            } => {
                validate_bundle(self.node.id(), &shares)?;
                self.store.insert(&computation_id, &shares)?;
                self.stored.notify_waiters();
                info!(
                    "[{}] Stored {} shares for {}",
                    self.node.name(),
                    shares.len(),
                    computation_id
                );
                Ok(())
            }
            Request::ComputeStored {
                computation_id,
                prime,
            } => {
                let shares = self.stored_bundle(&computation_id).await?;
                let sum = self.node.compute_sum(&shares, &prime)?;
                self.report(computation_id, sum).await
            }
            Request::Clear { computation_id } => {
                self.store.delete(&computation_id)?;
                info!("[{}] Cleared {}", self.node.name(), computation_id);
                Ok(())
            }
        }
    }

    /// Connections are served concurrently, so a `compute_stored` may overtake the
    /// `store_shares` sent just before it.
    async fn stored_bundle(&self, computation_id: &str) -> Result<Vec<Share>> {
        let deadline = tokio::time::sleep(self.store_wait);
        tokio::pin!(deadline);
        loop {
            let stored = self.stored.notified();
            tokio::pin!(stored);
            stored.as_mut().enable();

            if let Some(shares) = self.store.get(computation_id)? {
                return Ok(shares);
            }
            tokio::select! {
                _ = self.shutdown.cancelled() => return Err(Error::Cancelled),
                _ = &mut deadline => {
                    return Err(Error::Validation(format!(
                        "missing shares for computation {computation_id}"
                    )));
                }
                _ = &mut stored => {}
            }
        }
    }

    async fn report(&self, computation_id: String, sum: BigUint) -> Result<()> {
        info!(
            "[{}] Sending partial sum {} for {}",
            self.node.name(),
            short(&sum),
            computation_id
        );
        let response = Response::PartialSum {
            computation_id,
            party_id: self.node.id(),
            sum,
        };
        self.transport
            .send_with_retry(self.coordinator, &response, &self.retry, &self.shutdown)
            .await
    }
}

impl MessageHandler<Request> for NodeServer {
    fn handle(&self, message: Request) -> BoxFuture<'_, Result<()>> {
        self.handle_request(message).boxed()
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpStream;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    use super::*;
    use crate::repository::HashMapShareBundleDao;
    use crate::transport::tests::{free_port, Collect};

    fn prime() -> BigUint {
        BigUint::from(7919u32)
    }

    fn bundle(party_id: u32, values: &[u32]) -> Vec<Share> {
        values
            .iter()
            .enumerate()
            .map(|(idx, value)| Share::new(BigUint::from(*value), party_id, idx as u32 + 1))
            .collect()
    }

    #[test]
    fn test_node_identity() {
        let node = ComputeNode::new(3).unwrap();
        assert_eq!(node.id(), 3);
        assert_eq!(node.name(), "Party_C");
        assert!(matches!(ComputeNode::new(0), Err(Error::Validation(_))));
    }

    #[test]
    fn test_compute_sum() {
        let node = ComputeNode::new(1).unwrap();
        let sum = node.compute_sum(&bundle(1, &[7000, 1000]), &prime()).unwrap();
        assert_eq!(sum, BigUint::from(81u32));
        assert_eq!(node.compute_sum(&[], &prime()).unwrap(), BigUint::from(0u32));
    }

    #[test]
    fn test_compute_sum_rejects_bad_input() {
        let node = ComputeNode::new(1).unwrap();
        assert!(matches!(
            node.compute_sum(&bundle(2, &[1]), &prime()),
            Err(Error::Validation(_))
        ));

        let mut repeated = bundle(1, &[1, 2]);
        repeated[1].secret_idx = 1;
        assert!(matches!(
            node.compute_sum(&repeated, &prime()),
            Err(Error::Validation(_))
        ));

        assert!(matches!(
            node.compute_sum(&bundle(1, &[1]), &BigUint::from(1u32)),
            Err(Error::Validation(_))
        ));
    }

    struct Harness {
        server: Arc<NodeServer>,
        sums: mpsc::UnboundedReceiver<Response>,
        shutdown: CancellationToken,
        _coordinator: Listener,
    }

    fn quick_retry() -> RetryPolicy {
        RetryPolicy {
            delay: Duration::from_millis(50),
            max_attempts: Some(20),
        }
    }

    async fn harness(party_id: u32) -> Harness {
        let shutdown = CancellationToken::new();
        let (collect, sums) = Collect::<Response>::new();
        let coordinator = Transport::plain()
            .listen(
                "127.0.0.1:0".parse().unwrap(),
                "coordinator",
                collect,
                shutdown.clone(),
            )
            .await
            .unwrap();
        let server = NodeServer::new(
            ComputeNode::new(party_id).unwrap(),
            Arc::new(HashMapShareBundleDao::default()),
            coordinator.local_addr(),
            Transport::plain(),
            quick_retry(),
            shutdown.clone(),
        )
        .with_store_wait(Duration::from_millis(200));
        let server = Arc::new(server);
        Harness {
            server,
            sums,
            shutdown,
            _coordinator: coordinator,
        }
    }

    async fn next_sum(rx: &mut mpsc::UnboundedReceiver<Response>) -> Response {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("no partial sum reported")
            .expect("channel closed")
    }

    #[tokio::test]
    async fn test_compute_sum_request_reports_back() {
        let mut h = harness(2).await;
        h.server
            .handle_request(Request::ComputeSum {
                computation_id: "c1".to_string(),
                shares: bundle(2, &[100, 250]),
                prime: prime(),
            })
            .await
            .unwrap();
        assert_eq!(
            next_sum(&mut h.sums).await,
            Response::PartialSum {
                computation_id: "c1".to_string(),
                party_id: 2,
                sum: BigUint::from(350u32),
            }
        );
        h.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_store_compute_and_clear() {
        let mut h = harness(1).await;
        let compute = |id: &str| Request::ComputeStored {
            computation_id: id.to_string(),
            prime: prime(),
        };

        // Computing before anything is stored is rejected.
        let err = h.server.handle_request(compute("c1")).await.unwrap_err();
        assert!(matches!(err, Error::Validation(ref msg) if msg.contains("missing shares")));

        for (id, values) in [("c1", [1u32, 2]), ("c2", [10, 20])] {
            h.server
                .handle_request(Request::StoreShares {
                    computation_id: id.to_string(),
                    shares: bundle(1, &values),
                })
                .await
                .unwrap();
        }

        h.server.handle_request(compute("c2")).await.unwrap();
        assert!(matches!(
            next_sum(&mut h.sums).await,
            Response::PartialSum { ref computation_id, ref sum, .. }
                if computation_id == "c2" && *sum == BigUint::from(30u32)
        ));

        h.server
            .handle_request(Request::Clear {
                computation_id: "c1".to_string(),
            })
            .await
            .unwrap();
        assert!(h.server.handle_request(compute("c1")).await.is_err());

        // Clearing one computation leaves the other intact.
        h.server.handle_request(compute("c2")).await.unwrap();
        assert!(matches!(
            next_sum(&mut h.sums).await,
            Response::PartialSum { ref sum, .. } if *sum == BigUint::from(30u32)
        ));
        h.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_compute_stored_waits_for_late_store() {
        let mut h = harness(1).await;
        let server = h.server.clone();
        let compute = tokio::spawn(async move {
            server
                .handle_request(Request::ComputeStored {
                    computation_id: "late".to_string(),
                    prime: prime(),
                })
                .await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        h.server
            .handle_request(Request::StoreShares {
                computation_id: "late".to_string(),
                shares: bundle(1, &[3, 4]),
            })
            .await
            .unwrap();

        compute.await.unwrap().unwrap();
        assert!(matches!(
            next_sum(&mut h.sums).await,
            Response::PartialSum { ref computation_id, ref sum, .. }
                if computation_id == "late" && *sum == BigUint::from(7u32)
        ));
        h.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_unreachable_coordinator_does_not_block_other_requests() {
        let shutdown = CancellationToken::new();
        let store: Arc<dyn ShareBundleDao> = Arc::new(HashMapShareBundleDao::default());
        let server = Arc::new(NodeServer::new(
            ComputeNode::new(1).unwrap(),
            store.clone(),
            free_port(),
            Transport::plain(),
            RetryPolicy {
                delay: Duration::from_millis(50),
                max_attempts: None,
            },
            shutdown.clone(),
        ));
        let listener = server.serve("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let node_addr = listener.local_addr();

        // The reply to this one retries until shutdown.
        Transport::plain()
            .send(
                node_addr,
                &Request::ComputeSum {
                    computation_id: "stuck".to_string(),
                    shares: bundle(1, &[1]),
                    prime: prime(),
                },
            )
            .await
            .unwrap();
        Transport::plain()
            .send(
                node_addr,
                &Request::StoreShares {
                    computation_id: "other".to_string(),
                    shares: bundle(1, &[2]),
                },
            )
            .await
            .unwrap();

        timeout(Duration::from_secs(5), async {
            while store.get("other").unwrap().is_none() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("store request was not served");

        shutdown.cancel();
        timeout(Duration::from_secs(3), listener.join())
            .await
            .expect("node kept running after cancel")
            .unwrap();
    }

    #[tokio::test]
    async fn test_store_rejects_foreign_bundle() {
        let h = harness(1).await;
        let result = h
            .server
            .handle_request(Request::StoreShares {
                computation_id: "c1".to_string(),
                shares: bundle(3, &[5]),
            })
            .await;
        assert!(matches!(result, Err(Error::Validation(_))));
        assert!(h.server.store.get("c1").unwrap().is_none());
        h.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_missing_prime_is_dropped_and_node_keeps_serving() {
        let mut h = harness(1).await;
        let listener = h
            .server
            .clone()
            .serve("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let node_addr = listener.local_addr();

        let malformed = serde_cbor::to_vec(&serde_json::json!({
            "action": "compute_sum",
            "computation_id": "bad",
            "shares": [],
        }))
        .unwrap();
        let mut raw = TcpStream::connect(node_addr).await.unwrap();
        raw.write_all(&malformed).await.unwrap();
        raw.shutdown().await.unwrap();
        drop(raw);

        Transport::plain()
            .send(
                node_addr,
                &Request::ComputeSum {
                    computation_id: "good".to_string(),
                    shares: bundle(1, &[5, 6]),
                    prime: prime(),
                },
            )
            .await
            .unwrap();

        // Only the well-formed request produces a reply.
        assert!(matches!(
            next_sum(&mut h.sums).await,
            Response::PartialSum { ref computation_id, .. } if computation_id == "good"
        ));
        assert!(h.sums.try_recv().is_err());

        h.shutdown.cancel();
        timeout(Duration::from_secs(5), listener.join())
            .await
            .unwrap()
            .unwrap();
    }
}
