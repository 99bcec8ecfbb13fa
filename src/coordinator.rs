use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::{self, join_all, BoxFuture};
use futures::FutureExt;
use num_bigint::BigUint;
use num_traits::Zero;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::protocol::{Request, Response};
use crate::share::{party_label, short, Party, Share};
use crate::sss::{self, Point};
use crate::transport::{Listener, MessageHandler, RetryPolicy, Transport};

/// How share bundles reach the parties.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum DistributionMode {
    /// One `compute_sum` request carries the bundle and the prime.
    #[default]
    Stateless,
    /// `store_shares` to every party first, then `compute_stored`.
    Stored,
}

impl fmt::Display for DistributionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DistributionMode::Stateless => f.write_str("stateless"),
            DistributionMode::Stored => f.write_str("stored"),
        }
    }
}

/// A party and the address its node listens on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartyEndpoint {
    pub party: Party,
    pub addr: SocketAddr,
}

/// Fixed for the lifetime of a coordinator.
#[derive(Debug, Clone)]
pub struct CoordinatorParams {
    pub threshold: usize,
    /// Exactly one endpoint for each party id `1..=n`.
    pub parties: Vec<PartyEndpoint>,
    pub prime: BigUint,
    pub mode: DistributionMode,
    pub retry: RetryPolicy,
}

/// Progress of one computation. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionStatus {
    Created,
    SharesDistributed,
    SumsCollected,
    Reconstructed,
}

struct Session {
    status: SessionStatus,
    bundles: BTreeMap<u32, Vec<Share>>,
    // Arrival order; a resend overwrites in place.
    sums: Vec<(u32, BigUint)>,
    quorum: watch::Sender<usize>,
}

impl Session {
    fn new(bundles: BTreeMap<u32, Vec<Share>>) -> Self {
        let (quorum, _) = watch::channel(0);
        Session {
            status: SessionStatus::Created,
            bundles,
            sums: Vec::new(),
            quorum,
        }
    }

    fn advance(&mut self, status: SessionStatus) {
        if status > self.status {
            self.status = status;
        }
    }
}

/// Orchestrates summations: shares secrets out to the parties, collects their partial sums and
/// reconstructs the total once `threshold` of them have arrived.
///
/// Every computation lives in its own session keyed by a computation id, so several can run
/// through the same coordinator and the same nodes at once.
///
/// # Examples
///
/// ```ignore
/// let coordinator = Arc::new(Coordinator::new(params, Transport::plain(), token.clone())?);
/// let _listener = coordinator.start_listener("127.0.0.1:9000".parse()?).await?;
/// let total = coordinator.run(&computation_id(), &[100u32.into(), 250u32.into()]).await?;
/// ```
pub struct Coordinator {
    params: CoordinatorParams,
    transport: Transport,
    shutdown: CancellationToken,
    sessions: Mutex<HashMap<String, Session>>,
}

impl Coordinator {
    /// Creates a coordinator.
    ///
    /// # Arguments
    ///
    /// * `params` - Threshold, party endpoints, field prime, distribution mode and retry policy.
    /// * `transport` - Used for outbound requests and for the partial-sum listener.
    /// * `shutdown` - Cancels pending retries, quorum waits and the listener.
    ///
    /// # Returns
    ///
    /// A validation error unless `1 <= threshold <= n`, the prime is at least 2 and larger than
    /// `n`, and the party ids are exactly `1..=n`.
    pub fn new(
        params: CoordinatorParams,
        transport: Transport,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        let n = params.parties.len();
        if n < 1 {
            return Err(Error::Validation("at least one party is required".to_string()));
        }
        if params.threshold < 1 || params.threshold > n {
            return Err(Error::Validation(format!(
                "threshold must be between 1 and {n}, got {}",
                params.threshold
            )));
        }
        if params.prime <= BigUint::from(n) {
            return Err(Error::Validation(format!(
                "prime must exceed the party count {n}"
            )));
        }
        let ids: BTreeSet<u32> = params.parties.iter().map(|ep| ep.party.id()).collect();
        if ids.len() != n || !ids.iter().copied().eq(1..=n as u32) {
            return Err(Error::Validation(format!(
                "party ids must be exactly 1..={n}, got {ids:?}"
            )));
        }

        Ok(Coordinator {
            params,
            transport,
            shutdown,
            sessions: Mutex::new(HashMap::new()),
        })
    }

    pub fn threshold(&self) -> usize {
        self.params.threshold
    }

    pub fn prime(&self) -> &BigUint {
        &self.params.prime
    }

    pub fn parties(&self) -> &[PartyEndpoint] {
        &self.params.parties
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<String, Session>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Shares every secret and groups the shares by party.
    ///
    /// Each party's bundle holds exactly one share per secret, in secret order, named from
    /// `(secret_idx, party_id)`.
    pub fn create_shares_for_parties(
        &self,
        secrets: &[BigUint],
    ) -> Result<BTreeMap<u32, Vec<Share>>> {
        let mut bundles: BTreeMap<u32, Vec<Share>> = BTreeMap::new();
        for (idx, secret) in secrets.iter().enumerate() {
            let secret_idx = idx as u32 + 1;
            let points = sss::create_shares(
                secret,
                self.params.threshold,
                self.params.parties.len(),
                &self.params.prime,
            )?;
            for (x, y) in points {
                bundles
                    .entry(x)
                    .or_default()
                    .push(Share::new(y, x, secret_idx));
            }
        }
        Ok(bundles)
    }

    fn open_session(&self, computation_id: &str, bundles: BTreeMap<u32, Vec<Share>>) -> Result<()> {
        let mut sessions = self.sessions();
        if sessions.contains_key(computation_id) {
            return Err(Error::Validation(format!(
                "computation {computation_id} already exists"
            )));
        }
        sessions.insert(computation_id.to_string(), Session::new(bundles));
        Ok(())
    }

    /// Creates the session for `computation_id` and sends every party its bundle.
    ///
    /// Unreachable parties are retried per the retry policy. In stored mode every party must
    /// acknowledge the store (by accepting the connection) before any compute request goes out.
    pub async fn distribute(&self, computation_id: &str, secrets: &[BigUint]) -> Result<()> {
        if secrets.is_empty() {
            return Err(Error::Validation("no secrets to distribute".to_string()));
        }
        let bundles = self.create_shares_for_parties(secrets)?;
        for (party_id, bundle) in &bundles {
            let rendered: Vec<String> = bundle.iter().map(Share::to_string).collect();
            debug!("Shares for {}: [{}]", party_label(*party_id), rendered.join(", "));
        }
        self.open_session(computation_id, bundles.clone())?;
        info!(
            "Distributing {} secrets to {} parties for {} ({} mode)",
            secrets.len(),
            bundles.len(),
            computation_id,
            self.params.mode
        );

        match self.params.mode {
            DistributionMode::Stateless => {
                self.broadcast(|party_id| Request::ComputeSum {
                    computation_id: computation_id.to_string(),
                    shares: bundles.get(&party_id).cloned().unwrap_or_default(),
                    prime: self.params.prime.clone(),
                })
                .await?;
            }
            DistributionMode::Stored => {
                self.broadcast(|party_id| Request::StoreShares {
                    computation_id: computation_id.to_string(),
                    shares: bundles.get(&party_id).cloned().unwrap_or_default(),
                })
                .await?;
                self.broadcast(|_| Request::ComputeStored {
                    computation_id: computation_id.to_string(),
                    prime: self.params.prime.clone(),
                })
                .await?;
            }
        }

        if let Some(session) = self.sessions().get_mut(computation_id) {
            session.advance(SessionStatus::SharesDistributed);
        }
        Ok(())
    }

    async fn broadcast(&self, request_for: impl Fn(u32) -> Request) -> Result<()> {
        let requests: Vec<(SocketAddr, Request)> = self
            .params
            .parties
            .iter()
            .map(|ep| (ep.addr, request_for(ep.party.id())))
            .collect();
        let results = join_all(requests.iter().map(|(addr, request)| {
            self.transport
                .send_with_retry(*addr, request, &self.params.retry, &self.shutdown)
        }))
        .await;
        results.into_iter().collect::<Result<Vec<()>>>()?;
        Ok(())
    }

    /// Records a partial sum reported by a party.
    ///
    /// A second report from the same party replaces the first without changing its place in the
    /// arrival order.
    pub fn handle_incoming(&self, response: Response) -> Result<()> {
        let Response::PartialSum {
            computation_id,
            party_id,
            sum,
        } = response;

        if !self.params.parties.iter().any(|ep| ep.party.id() == party_id) {
            return Err(Error::Validation(format!("unknown party {party_id}")));
        }
        if sum >= self.params.prime {
            return Err(Error::Validation(format!(
                "partial sum from party {party_id} is not a field element"
            )));
        }

        let mut sessions = self.sessions();
        let session = sessions
            .get_mut(&computation_id)
            .ok_or_else(|| Error::UnknownComputation(computation_id.clone()))?;

        info!(
            "Received partial sum from {}: {} ({})",
            party_label(party_id),
            short(&sum),
            computation_id
        );
        match session.sums.iter_mut().find(|(id, _)| *id == party_id) {
            Some(entry) => {
                debug!("Party {} resent its partial sum", party_label(party_id));
                entry.1 = sum;
            }
            None => session.sums.push((party_id, sum)),
        }

        let received = session.sums.len();
        if received >= self.params.threshold {
            session.advance(SessionStatus::SumsCollected);
        }
        session.quorum.send_replace(received);
        Ok(())
    }

    /// Waits until at least `threshold` partial sums have arrived for `computation_id`.
    ///
    /// There is no timeout: an offline party stalls this until shutdown. Resetting the session
    /// while waiting yields `UnknownComputation`.
    pub async fn await_quorum(&self, computation_id: &str) -> Result<()> {
        let mut quorum = self
            .sessions()
            .get(computation_id)
            .map(|session| session.quorum.subscribe())
            .ok_or_else(|| Error::UnknownComputation(computation_id.to_string()))?;
        let threshold = self.params.threshold;

        tokio::select! {
            _ = self.shutdown.cancelled() => Err(Error::Cancelled),
            reached = quorum.wait_for(|received| *received >= threshold) => match reached {
                Ok(_) => Ok(()),
                Err(_) => Err(Error::UnknownComputation(computation_id.to_string())),
            },
        }
    }

    /// Reconstructs the total from the collected partial sums.
    ///
    /// # Arguments
    ///
    /// * `computation_id` - The session to reconstruct.
    /// * `party_ids` - Parties whose sums to use. When `None`, the first `threshold` parties to
    ///   report are used.
    ///
    /// # Returns
    ///
    /// `InsufficientShares` if fewer than `threshold` parties are selected or a selected party
    /// has not reported.
    pub fn reconstruct(&self, computation_id: &str, party_ids: Option<&[u32]>) -> Result<BigUint> {
        let threshold = self.params.threshold;
        let mut sessions = self.sessions();
        let session = sessions
            .get_mut(computation_id)
            .ok_or_else(|| Error::UnknownComputation(computation_id.to_string()))?;

        let points: Vec<Point> = match party_ids {
            Some(ids) => {
                // Repeated ids select the same party once, in first-seen order.
                let mut seen = BTreeSet::new();
                let selected: Vec<u32> = ids.iter().copied().filter(|id| seen.insert(*id)).collect();
                let points: Vec<Point> = selected
                    .iter()
                    .filter_map(|id| session.sums.iter().find(|(party, _)| party == id))
                    .cloned()
                    .collect();
                if selected.len() < threshold || points.len() < selected.len() {
                    return Err(Error::InsufficientShares {
                        needed: threshold.max(selected.len()),
                        got: points.len(),
                    });
                }
                points
            }
            None => {
                if session.sums.len() < threshold {
                    return Err(Error::InsufficientShares {
                        needed: threshold,
                        got: session.sums.len(),
                    });
                }
                session.sums[..threshold].to_vec()
            }
        };

        // A threshold of one shares the secret as a constant polynomial.
        let result = match points.as_slice() {
            [(_, value)] => value.clone(),
            _ => sss::reconstruct_secret(&points, &self.params.prime)?,
        };

        let used: Vec<String> = points.iter().map(|(id, _)| party_label(*id)).collect();
        info!(
            "Reconstructed {} from parties [{}]: {}",
            computation_id,
            used.join(", "),
            short(&result)
        );
        session.advance(SessionStatus::Reconstructed);
        Ok(result)
    }

    /// Distributes, waits for quorum and reconstructs.
    ///
    /// The result is compared against `(Σ secrets) mod p` and a mismatch is logged.
    pub async fn run(&self, computation_id: &str, secrets: &[BigUint]) -> Result<BigUint> {
        let expected = secrets
            .iter()
            .fold(BigUint::zero(), |acc, s| (acc + s) % &self.params.prime);

        self.distribute(computation_id, secrets).await?;
        self.await_quorum(computation_id).await?;
        let result = self.reconstruct(computation_id, None)?;

        if result == expected {
            info!("✅ {}: result {} matches expected sum", computation_id, result);
        } else {
            warn!(
                "❌ {}: result {} differs from expected sum {}",
                computation_id, result, expected
            );
        }
        Ok(result)
    }

    pub fn status(&self, computation_id: &str) -> Option<SessionStatus> {
        self.sessions()
            .get(computation_id)
            .map(|session| session.status)
    }

    /// Partial sums received so far, in arrival order.
    pub fn partial_sums(&self, computation_id: &str) -> Option<Vec<(u32, BigUint)>> {
        self.sessions()
            .get(computation_id)
            .map(|session| session.sums.clone())
    }

    pub fn share_bundles(&self, computation_id: &str) -> Option<BTreeMap<u32, Vec<Share>>> {
        self.sessions()
            .get(computation_id)
            .map(|session| session.bundles.clone())
    }

    /// Forgets `computation_id` here and on every party. Other sessions are untouched.
    ///
    /// Each party is contacted once; a party that cannot be reached is logged and skipped.
    pub async fn reset(&self, computation_id: &str) -> Result<()> {
        if self.sessions().remove(computation_id).is_none() {
            debug!("No local session for {}", computation_id);
        }

        let request = Request::Clear {
            computation_id: computation_id.to_string(),
        };
        let results = join_all(
            self.params
                .parties
                .iter()
                .map(|ep| self.transport.send(ep.addr, &request)),
        )
        .await;
        for (ep, result) in self.params.parties.iter().zip(results) {
            if let Err(err) = result {
                warn!("Failed to clear {} on {}: {}", computation_id, ep.party, err);
            }
        }
        info!("🔄 Reset {}", computation_id);
        Ok(())
    }

    /// Starts the listener that feeds partial sums into [`Coordinator::handle_incoming`].
    pub async fn start_listener(self: &Arc<Self>, addr: SocketAddr) -> Result<Listener> {
        self.transport
            .listen::<Response, Coordinator>(addr, "Controller", self.clone(), self.shutdown.clone())
            .await
    }
}

impl MessageHandler<Response> for Coordinator {
    fn handle(&self, message: Response) -> BoxFuture<'_, Result<()>> {
        future::ready(self.handle_incoming(message)).boxed()
    }
}

/// A fresh random computation id: 16 bytes, hex encoded.
pub fn computation_id() -> String {
    let mut bytes = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}
