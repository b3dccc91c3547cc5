//! Replica-set consistency engine.
//!
//! Turns one logical request into per-replica invocations and decides,
//! from the collected [`StoreResult`]s, whether the requested consistency
//! level is satisfied, whether to retry against refreshed addresses, or
//! whether the request has failed.
//!
//! # Strategies
//!
//! - **Eventual / ConsistentPrefix reads**: one replica at a time until a
//!   valid answer arrives.
//! - **Session reads**: like the above, but only a replica whose session
//!   token dominates the caller's token is accepted.
//! - **Strong / BoundedStaleness reads**: a read quorum is collected in
//!   parallel; `current_write_quorum` replicas must agree on the highest
//!   LSN, re-reading with barrier requests while they catch up. Strong
//!   reads in multi-region accounts also wait for the global commit.
//! - **Writes**: sent to the primary, followed by a barrier against the
//!   secondaries when the primary has not yet seen quorum acknowledgement.
//!
//! # Retry Logic
//!
//! When every contacted replica is gone or reports stale routing, the
//! partition's addresses are invalidated once and the whole request is
//! replayed after an exponential backoff, up to `retry.max_retries` times.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use rntbd_client::{DirectConfig, RequestChargeTracker, StoreInvoker, StoreResult};
use rntbd_common::protocol::error::{Diagnostics, Result, RntbdError};
use rntbd_common::{status_codes, sub_status_codes, ConsistencyLevel, PartitionId, StoreRequest, StoreResponse};

use crate::address::AddressResolver;
use crate::selector::ReplicaSelector;
use crate::session_store::SessionTokenStore;

/// Stage of one logical request. Logged on every transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Dispatching,
    Collecting,
    Deciding,
    Satisfied,
    Retrying,
    Failed,
}

enum Decision {
    Satisfied(StoreResult),
    Retry(RetryCause),
    Failed(RntbdError),
}

enum RetryCause {
    /// Every contacted replica was gone, timed out or had stale routing.
    Unavailable(Diagnostics),
    QuorumNotMet {
        required: usize,
        observed: usize,
        diagnostics: Diagnostics,
    },
}

impl RetryCause {
    fn into_error(self, partition_key_range_id: &str) -> RntbdError {
        match self {
            RetryCause::Unavailable(diagnostics) => RntbdError::NoReplicasAvailable {
                partition_key_range_id: partition_key_range_id.to_string(),
                diagnostics,
            },
            RetryCause::QuorumNotMet {
                required,
                observed,
                diagnostics,
            } => RntbdError::QuorumNotMet {
                required,
                observed,
                diagnostics,
            },
        }
    }
}

/// What a barrier round has to observe.
struct BarrierTarget {
    lsn: i64,
    /// Replicas that must report `lsn >= target`.
    required: usize,
    /// Replicas that must report `global_committed_lsn >= target`. Zero
    /// skips the global check.
    global_required: usize,
}

enum BarrierOutcome {
    Met,
    Missed { observed: usize },
}

/// Answers that say nothing about the data: gone, stale routing, timeout,
/// or a response that cannot be used.
fn is_unavailable(result: &StoreResult) -> bool {
    result.is_gone() || result.is_invalid_partition() || result.is_timeout() || !result.is_valid()
}

/// Replicas that must agree, from the write quorum the replica reported.
fn quorum_size(result: &StoreResult, fallback: usize, replica_count: usize) -> usize {
    match result.current_write_quorum() {
        0 => fallback,
        quorum => (quorum as usize).min(replica_count),
    }
}

fn charged(mut error: RntbdError, tracker: &RequestChargeTracker) -> RntbdError {
    if let Some(diagnostics) = error.diagnostics_mut() {
        diagnostics.request_charge = Some(tracker.total());
    }
    error
}

/// Valid results decide the request; successes win over errors at the
/// same LSN.
fn decide(winner: StoreResult) -> Decision {
    if winner.is_success() {
        Decision::Satisfied(winner)
    } else {
        Decision::Failed(winner.to_error())
    }
}

pub struct ConsistencyEngine {
    resolver: Arc<dyn AddressResolver>,
    invoker: Arc<dyn StoreInvoker>,
    sessions: Arc<SessionTokenStore>,
    selector: ReplicaSelector,
    config: DirectConfig,
}

impl ConsistencyEngine {
    pub fn new(
        resolver: Arc<dyn AddressResolver>,
        invoker: Arc<dyn StoreInvoker>,
        sessions: Arc<SessionTokenStore>,
        config: DirectConfig,
    ) -> Self {
        Self {
            resolver,
            invoker,
            sessions,
            selector: ReplicaSelector::new(),
            config,
        }
    }

    pub fn sessions(&self) -> &Arc<SessionTokenStore> {
        &self.sessions
    }

    pub fn config(&self) -> &DirectConfig {
        &self.config
    }

    /// Executes one logical request against its partition's replica set.
    ///
    /// # Returns
    /// - `Ok(response)` - consistency level satisfied; the response carries
    ///   the request charge accumulated over every replica contacted
    /// - `Err(NotFound)` / `Err(Status)` - authoritative replica answer
    /// - `Err(SessionNotAvailable)` - no replica has caught up with the
    ///   caller's session
    /// - `Err(QuorumNotMet)` / `Err(NoReplicasAvailable)` - retries
    ///   exhausted
    /// - `Err(...)` - fatal transport or codec errors, never retried
    pub async fn execute(&self, request: StoreRequest) -> Result<StoreResponse> {
        let level = request.consistency_level.unwrap_or(self.config.consistency_level);
        let partition = request.partition.clone();
        let retry = &self.config.retry;
        let mut tracker = RequestChargeTracker::new();
        let mut backoff_ms = retry.initial_backoff_ms;
        let mut last_cause = None;

        for attempt in 0..=retry.max_retries {
            self.trace(Phase::Dispatching, &request, attempt);
            let replicas = self.resolver.resolve(&partition).await?;
            if replicas.is_empty() {
                self.trace(Phase::Failed, &request, attempt);
                return Err(RntbdError::NoReplicasAvailable {
                    partition_key_range_id: partition.partition_key_range_id.clone(),
                    diagnostics: Diagnostics::default()
                        .with_partition_key_range_id(partition.partition_key_range_id.clone())
                        .with_message("address resolution returned no replicas"),
                });
            }

            self.trace(Phase::Collecting, &request, attempt);
            let decision = if request.is_write() {
                self.write(&request, level, &replicas, &mut tracker).await?
            } else {
                match level {
                    ConsistencyLevel::Strong | ConsistencyLevel::BoundedStaleness => {
                        self.quorum_read(&request, level, &replicas, &mut tracker).await?
                    }
                    ConsistencyLevel::Session => self.session_read(&request, &replicas, &mut tracker).await?,
                    ConsistencyLevel::Eventual | ConsistencyLevel::ConsistentPrefix => {
                        self.single_read(&request, &replicas, &mut tracker).await?
                    }
                }
            };
            self.trace(Phase::Deciding, &request, attempt);

            match decision {
                Decision::Satisfied(result) => {
                    self.trace(Phase::Satisfied, &request, attempt);
                    if let Some(token) = result.session_token() {
                        self.sessions.merge(&partition, token);
                    }
                    return result.into_response(Some(&tracker));
                }
                Decision::Failed(error) => {
                    self.trace(Phase::Failed, &request, attempt);
                    return Err(charged(error, &tracker));
                }
                Decision::Retry(cause) => {
                    self.trace(Phase::Retrying, &request, attempt);
                    self.resolver.invalidate(&partition).await;
                    self.retire_departed(&partition, &replicas).await;
                    last_cause = Some(cause);
                    if attempt < retry.max_retries {
                        tracing::warn!(
                            %partition,
                            attempt = attempt + 1,
                            backoff_ms,
                            "replica set could not serve request, retrying"
                        );
                        tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                        backoff_ms = retry.next_backoff_ms(backoff_ms);
                    }
                }
            }
        }

        self.trace(Phase::Failed, &request, retry.max_retries);
        let error = match last_cause {
            Some(cause) => cause.into_error(&partition.partition_key_range_id),
            None => RntbdError::NoReplicasAvailable {
                partition_key_range_id: partition.partition_key_range_id.clone(),
                diagnostics: Diagnostics::default(),
            },
        };
        Err(charged(error, &tracker))
    }

    /// Retires replicas that refreshed address resolution no longer lists.
    async fn retire_departed(&self, partition: &PartitionId, previous: &[String]) {
        let current = match self.resolver.resolve(partition).await {
            Ok(current) => current,
            Err(e) => {
                tracing::debug!(%partition, error = %e, "could not re-resolve after invalidation");
                return;
            }
        };
        for address in previous.iter().filter(|address| !current.contains(address)) {
            tracing::debug!(%partition, %address, "replica left the replica set");
            self.invoker.retire(address).await;
        }
    }

    fn trace(&self, phase: Phase, request: &StoreRequest, attempt: usize) {
        tracing::debug!(
            request_id = %request.request_id,
            partition = %request.partition,
            operation = ?request.operation_type,
            ?phase,
            attempt,
            "consistency phase"
        );
    }

    async fn single_read(
        &self,
        request: &StoreRequest,
        replicas: &[String],
        tracker: &mut RequestChargeTracker,
    ) -> Result<Decision> {
        let mut last = None;
        for address in self.selector.read_order(replicas) {
            let result = self.invoker.invoke(request, &address).await?;
            tracker.add(result.request_charge());
            if is_unavailable(&result) {
                last = Some(result.diagnostics());
                continue;
            }
            return Ok(decide(result));
        }
        Ok(Decision::Retry(RetryCause::Unavailable(last.unwrap_or_default())))
    }

    async fn session_read(
        &self,
        request: &StoreRequest,
        replicas: &[String],
        tracker: &mut RequestChargeTracker,
    ) -> Result<Decision> {
        let requested = match &request.session_token {
            Some(token) if !token.is_empty() => token.clone(),
            _ => self.sessions.get(&request.partition),
        };
        let request = if requested.is_empty() {
            request.clone()
        } else {
            request.clone().with_session_token(requested.clone())
        };

        let mut stale = None;
        let mut unavailable = None;
        for address in self.selector.read_order(replicas) {
            let result = self.invoker.invoke(&request, &address).await?;
            tracker.add(result.request_charge());

            if is_unavailable(&result) {
                unavailable = Some(result.diagnostics());
                continue;
            }
            if result.is_read_session_not_available() {
                stale = Some(result.diagnostics());
                continue;
            }

            let caught_up = requested.is_empty()
                || result
                    .session_token()
                    .is_some_and(|token| token.dominates(&requested));
            if (result.is_success() || result.is_not_found()) && !caught_up {
                tracing::debug!(%address, lsn = result.lsn(), "replica behind session, trying next");
                stale = Some(result.diagnostics());
                continue;
            }
            return Ok(decide(result));
        }

        if let Some(diagnostics) = stale {
            return Ok(Decision::Failed(RntbdError::SessionNotAvailable(Diagnostics {
                status_code: Some(status_codes::NOT_FOUND),
                sub_status_code: Some(sub_status_codes::READ_SESSION_NOT_AVAILABLE),
                message: Some(format!("no replica has reached session {}", requested)),
                ..diagnostics
            })));
        }
        Ok(Decision::Retry(RetryCause::Unavailable(unavailable.unwrap_or_default())))
    }

    async fn quorum_read(
        &self,
        request: &StoreRequest,
        level: ConsistencyLevel,
        replicas: &[String],
        tracker: &mut RequestChargeTracker,
    ) -> Result<Decision> {
        let read_quorum = replicas.len() / 2 + 1;
        let order = self.selector.read_order(replicas);
        let mut remaining = order.iter();

        let mut valid: Vec<StoreResult> = Vec::with_capacity(read_quorum);
        let mut last = None;
        {
            let mut in_flight: FuturesUnordered<BoxFuture<'_, Result<StoreResult>>> = remaining
                .by_ref()
                .take(read_quorum)
                .map(|address| self.invoker.invoke(request, address))
                .collect();

            while let Some(result) = in_flight.next().await {
                let result = result?;
                tracker.add(result.request_charge());
                if !is_unavailable(&result) {
                    valid.push(result);
                    if valid.len() >= read_quorum {
                        break;
                    }
                } else {
                    last = Some(result.diagnostics());
                    // replace the failed replica with one not yet asked
                    if let Some(address) = remaining.next() {
                        in_flight.push(self.invoker.invoke(request, address));
                    }
                }
            }
        }

        if valid.len() < read_quorum {
            let cause = if valid.is_empty() {
                RetryCause::Unavailable(last.unwrap_or_default())
            } else {
                RetryCause::QuorumNotMet {
                    required: read_quorum,
                    observed: valid.len(),
                    diagnostics: last.unwrap_or_default(),
                }
            };
            return Ok(Decision::Retry(cause));
        }

        let winner_index = valid
            .iter()
            .enumerate()
            .max_by_key(|(_, result)| (result.lsn(), result.is_success()))
            .map(|(index, _)| index)
            .unwrap_or(0);
        let winner = valid.swap_remove(winner_index);
        let target = winner.lsn();
        let required = quorum_size(&winner, read_quorum, replicas.len());
        let agreeing = 1 + valid.iter().filter(|result| result.lsn() >= target).count();
        let needs_global = level == ConsistencyLevel::Strong
            && winner.number_of_read_regions() > 0
            && winner.global_committed_lsn() < target;

        if agreeing < required || needs_global {
            tracing::debug!(
                lsn = target,
                agreeing,
                required,
                needs_global,
                "quorum not yet confirmed, starting barrier"
            );
            let barrier = BarrierTarget {
                lsn: target,
                required,
                global_required: if needs_global { required } else { 0 },
            };
            if let BarrierOutcome::Missed { observed } = self.barrier(request, replicas, &barrier, tracker).await? {
                return Ok(Decision::Retry(RetryCause::QuorumNotMet {
                    required,
                    observed,
                    diagnostics: winner.diagnostics(),
                }));
            }
        }

        Ok(decide(winner))
    }

    async fn write(
        &self,
        request: &StoreRequest,
        level: ConsistencyLevel,
        replicas: &[String],
        tracker: &mut RequestChargeTracker,
    ) -> Result<Decision> {
        let Some(primary) = ReplicaSelector::primary(replicas) else {
            return Ok(Decision::Retry(RetryCause::Unavailable(Diagnostics::default())));
        };

        let result = self.invoker.invoke(request, primary).await?;
        tracker.add(result.request_charge());

        // The write may already have been applied.
        if result.is_timeout() {
            return Ok(Decision::Failed(result.to_error()));
        }
        if result.is_gone() || result.is_invalid_partition() {
            return Ok(Decision::Retry(RetryCause::Unavailable(result.diagnostics())));
        }
        if !result.is_success() || !result.has_valid_lsn() {
            return Ok(Decision::Failed(result.to_error()));
        }

        let lsn = result.lsn();
        let write_quorum = quorum_size(&result, replicas.len() / 2 + 1, replicas.len());
        let needs_quorum = result.quorum_acked_lsn() >= 0 && result.quorum_acked_lsn() < lsn;
        let needs_global = level == ConsistencyLevel::Strong
            && result.number_of_read_regions() > 0
            && result.global_committed_lsn() < lsn;

        if needs_quorum || needs_global {
            let secondaries = ReplicaSelector::secondaries(replicas);
            let targets = if secondaries.is_empty() { replicas } else { secondaries };
            let barrier = BarrierTarget {
                lsn,
                // the primary already counts toward the quorum
                required: if needs_quorum { write_quorum.saturating_sub(1) } else { 0 },
                global_required: usize::from(needs_global),
            };
            if let BarrierOutcome::Missed { observed } = self.barrier(request, targets, &barrier, tracker).await? {
                return Ok(Decision::Failed(RntbdError::QuorumNotMet {
                    required: write_quorum,
                    observed: observed + 1,
                    diagnostics: result
                        .diagnostics()
                        .with_message("write was not acknowledged by a quorum"),
                }));
            }
        }

        Ok(Decision::Satisfied(result))
    }

    /// Re-reads LSNs with head requests until `target` is observed or the
    /// attempts run out.
    async fn barrier(
        &self,
        request: &StoreRequest,
        replicas: &[String],
        target: &BarrierTarget,
        tracker: &mut RequestChargeTracker,
    ) -> Result<BarrierOutcome> {
        let mut observed = 0;
        for attempt in 0..self.config.max_barrier_attempts {
            if attempt > 0 {
                tokio::time::sleep(self.config.barrier_interval()).await;
            }

            let barrier = request.barrier();
            let mut in_flight: FuturesUnordered<BoxFuture<'_, Result<StoreResult>>> = replicas
                .iter()
                .map(|address| self.invoker.invoke(&barrier, address))
                .collect();

            let mut caught_up = 0;
            let mut committed = 0;
            while let Some(result) = in_flight.next().await {
                let result = result?;
                tracker.add(result.request_charge());
                if is_unavailable(&result) || !result.has_valid_lsn() {
                    continue;
                }
                if result.lsn() >= target.lsn {
                    caught_up += 1;
                }
                if result.global_committed_lsn() >= target.lsn {
                    committed += 1;
                }
            }

            observed = observed.max(caught_up);
            if caught_up >= target.required && committed >= target.global_required {
                tracing::debug!(lsn = target.lsn, attempt, caught_up, committed, "barrier met");
                return Ok(BarrierOutcome::Met);
            }
        }

        tracing::warn!(
            lsn = target.lsn,
            observed,
            required = target.required,
            attempts = self.config.max_barrier_attempts,
            "barrier not met"
        );
        Ok(BarrierOutcome::Missed { observed })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::StaticAddressResolver;
    use async_trait::async_trait;
    use bytes::Bytes;
    use rntbd_client::RetryConfig;
    use rntbd_common::{Metadata, OperationType, ResourceType, SessionToken};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    type Handler = Box<dyn Fn(&StoreRequest, usize) -> Result<StoreResult> + Send + Sync>;

    struct FakeReplica {
        handler: Handler,
        calls: AtomicUsize,
    }

    /// In-process replica set. Each replica answers through a closure that
    /// sees the request and how many times it has been called.
    #[derive(Default)]
    struct FakeInvoker {
        replicas: HashMap<String, FakeReplica>,
        retired: std::sync::Mutex<Vec<String>>,
    }

    impl FakeInvoker {
        fn with(
            mut self,
            address: &str,
            handler: impl Fn(&StoreRequest, usize) -> Result<StoreResult> + Send + Sync + 'static,
        ) -> Self {
            self.replicas.insert(
                address.to_string(),
                FakeReplica {
                    handler: Box::new(handler),
                    calls: AtomicUsize::new(0),
                },
            );
            self
        }

        fn calls(&self, address: &str) -> usize {
            self.replicas
                .get(address)
                .map_or(0, |replica| replica.calls.load(Ordering::SeqCst))
        }

        fn total_calls(&self) -> usize {
            self.replicas.keys().map(|address| self.calls(address)).sum()
        }

        fn retired(&self) -> Vec<String> {
            self.retired.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl StoreInvoker for FakeInvoker {
        async fn invoke(&self, request: &StoreRequest, address: &str) -> Result<StoreResult> {
            match self.replicas.get(address) {
                Some(replica) => {
                    let call = replica.calls.fetch_add(1, Ordering::SeqCst);
                    (replica.handler)(request, call)
                }
                None => Ok(StoreResult::gone(
                    address,
                    &RntbdError::Connection(format!("no replica at {}", address)),
                )),
            }
        }

        async fn retire(&self, address: &str) {
            self.retired.lock().unwrap().push(address.to_string());
        }
    }

    fn reply(request: &StoreRequest, address: &str, metadata: Metadata) -> Result<StoreResult> {
        let frame = rntbd_common::Frame::response(&request.to_frame(), metadata, Bytes::from_static(b"doc"));
        Ok(StoreResult::from_frame(frame, address))
    }

    fn status(status: u32, lsn: i64) -> Metadata {
        Metadata {
            status_code: Some(status),
            lsn: Some(lsn),
            request_charge: Some(1.0),
            ..Metadata::default()
        }
    }

    fn partition() -> PartitionId {
        PartitionId::new("coll", "0")
    }

    fn addresses(count: usize) -> Vec<String> {
        (0..count).map(|i| format!("r{}", i)).collect()
    }

    fn config() -> DirectConfig {
        DirectConfig {
            retry: RetryConfig {
                max_retries: 2,
                initial_backoff_ms: 1,
                max_backoff_ms: 5,
                backoff_multiplier: 2.0,
            },
            max_barrier_attempts: 3,
            barrier_interval_ms: 1,
            ..DirectConfig::default()
        }
    }

    fn setup(invoker: FakeInvoker, replicas: usize) -> (ConsistencyEngine, Arc<FakeInvoker>, Arc<StaticAddressResolver>) {
        let invoker = Arc::new(invoker);
        let resolver = Arc::new(StaticAddressResolver::new().with_partition(partition(), addresses(replicas)));
        let engine = ConsistencyEngine::new(
            resolver.clone(),
            invoker.clone(),
            Arc::new(SessionTokenStore::new()),
            config(),
        );
        (engine, invoker, resolver)
    }

    fn read(level: ConsistencyLevel) -> StoreRequest {
        StoreRequest::read("dbs/d/colls/c/docs/x", partition()).with_consistency(level)
    }

    fn write() -> StoreRequest {
        StoreRequest::new(
            OperationType::Create,
            ResourceType::Document,
            "dbs/d/colls/c/docs/x",
            partition(),
        )
        .with_consistency(ConsistencyLevel::Session)
        .with_payload(Bytes::from_static(b"{}"))
    }

    fn token(text: &str) -> SessionToken {
        text.parse().unwrap()
    }

    // ==========================================================================
    // Retry
    // ==========================================================================

    #[tokio::test]
    async fn test_no_replicas_fails_immediately() {
        let (engine, invoker, resolver) = setup(FakeInvoker::default(), 0);

        let err = engine.execute(read(ConsistencyLevel::Eventual)).await.unwrap_err();
        assert!(matches!(err, RntbdError::NoReplicasAvailable { .. }));
        assert_eq!(invoker.total_calls(), 0);
        assert_eq!(resolver.invalidation_count(), 0);
    }

    #[tokio::test]
    async fn test_all_gone_retries_then_fails() {
        let mut invoker = FakeInvoker::default();
        for address in addresses(3) {
            let addr = address.clone();
            invoker = invoker.with(&address, move |req, _| reply(req, &addr, status(410, -1)));
        }
        let (engine, invoker, resolver) = setup(invoker, 3);

        let err = engine.execute(read(ConsistencyLevel::Eventual)).await.unwrap_err();
        assert!(matches!(err, RntbdError::NoReplicasAvailable { .. }));
        // initial attempt plus two retries, one invalidation each
        assert_eq!(resolver.invalidation_count(), 3);
        for address in addresses(3) {
            assert_eq!(invoker.calls(&address), 3);
        }
        assert_eq!(err.diagnostics().unwrap().request_charge, Some(9.0));
        // still listed after every refresh, so nothing is retired
        assert!(invoker.retired().is_empty());
    }

    #[tokio::test]
    async fn test_retry_uses_refreshed_addresses() {
        let invoker = FakeInvoker::default()
            .with("r0", |req, _| {
                reply(
                    req,
                    "r0",
                    Metadata {
                        sub_status_code: Some(sub_status_codes::PARTITION_KEY_RANGE_GONE),
                        ..status(410, -1)
                    },
                )
            })
            .with("moved", |req, _| reply(req, "moved", status(200, 4)));
        let (engine, invoker, resolver) = setup(invoker, 1);
        resolver.stage_refresh(partition(), vec!["moved".to_string()]);

        let response = engine.execute(read(ConsistencyLevel::Eventual)).await.unwrap();
        assert_eq!(response.lsn, 4);
        assert_eq!(resolver.invalidation_count(), 1);
        assert_eq!(invoker.calls("r0"), 1);
        assert_eq!(invoker.calls("moved"), 1);
        assert_eq!(invoker.retired(), vec!["r0".to_string()]);
    }

    #[tokio::test]
    async fn test_fatal_error_is_not_retried() {
        let invoker =
            FakeInvoker::default().with("r0", |_, _| Err(RntbdError::MalformedFrame("bad header".into())));
        let (engine, _invoker, resolver) = setup(invoker, 1);

        let err = engine.execute(read(ConsistencyLevel::Eventual)).await.unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(resolver.invalidation_count(), 0);
    }

    // ==========================================================================
    // Eventual reads
    // ==========================================================================

    #[tokio::test]
    async fn test_eventual_read_skips_gone_replica() {
        let invoker = FakeInvoker::default()
            .with("r0", |req, _| reply(req, "r0", status(410, -1)))
            .with("r1", |req, _| {
                reply(
                    req,
                    "r1",
                    Metadata {
                        request_charge: Some(2.5),
                        ..status(200, 5)
                    },
                )
            })
            .with("r2", |req, _| reply(req, "r2", status(200, 5)));
        let (engine, invoker, _resolver) = setup(invoker, 3);

        let response = engine.execute(read(ConsistencyLevel::Eventual)).await.unwrap();
        assert_eq!(response.lsn, 5);
        assert_eq!(response.request_charge, 3.5);
        assert_eq!(invoker.calls("r0"), 1);
        assert_eq!(invoker.calls("r1"), 1);
        assert_eq!(invoker.calls("r2"), 0);
    }

    #[tokio::test]
    async fn test_eventual_read_not_found_is_final() {
        let mut invoker = FakeInvoker::default();
        for address in addresses(3) {
            let addr = address.clone();
            invoker = invoker.with(&address, move |req, _| reply(req, &addr, status(404, 3)));
        }
        let (engine, invoker, resolver) = setup(invoker, 3);

        let err = engine.execute(read(ConsistencyLevel::Eventual)).await.unwrap_err();
        assert!(matches!(err, RntbdError::NotFound(_)));
        assert_eq!(invoker.total_calls(), 1);
        assert_eq!(resolver.invalidation_count(), 0);
    }

    // ==========================================================================
    // Session reads
    // ==========================================================================

    #[tokio::test]
    async fn test_session_read_skips_stale_replicas() {
        let invoker = FakeInvoker::default()
            .with("r0", |req, _| {
                reply(
                    req,
                    "r0",
                    Metadata {
                        session_token: Some("1=3".into()),
                        ..status(200, 3)
                    },
                )
            })
            .with("r1", |req, _| {
                reply(
                    req,
                    "r1",
                    Metadata {
                        sub_status_code: Some(sub_status_codes::READ_SESSION_NOT_AVAILABLE),
                        ..status(404, 4)
                    },
                )
            })
            .with("r2", |req, _| {
                reply(
                    req,
                    "r2",
                    Metadata {
                        session_token: Some("1=6".into()),
                        ..status(200, 6)
                    },
                )
            });
        let (engine, _invoker, _resolver) = setup(invoker, 3);

        let request = read(ConsistencyLevel::Session).with_session_token(token("1=5"));
        let response = engine.execute(request).await.unwrap();
        assert_eq!(response.lsn, 6);
        assert_eq!(engine.sessions().get(&partition()), token("1=6"));
    }

    #[tokio::test]
    async fn test_session_read_all_stale() {
        let mut invoker = FakeInvoker::default();
        for address in addresses(3) {
            let addr = address.clone();
            invoker = invoker.with(&address, move |req, _| {
                reply(
                    req,
                    &addr,
                    Metadata {
                        session_token: Some("1=1".into()),
                        ..status(200, 1)
                    },
                )
            });
        }
        let (engine, invoker, resolver) = setup(invoker, 3);

        let request = read(ConsistencyLevel::Session).with_session_token(token("1=5"));
        let err = engine.execute(request).await.unwrap_err();
        assert!(matches!(err, RntbdError::SessionNotAvailable(_)));
        assert_eq!(err.status_code(), Some(404));
        assert_eq!(invoker.total_calls(), 3);
        assert_eq!(resolver.invalidation_count(), 0);
    }

    #[tokio::test]
    async fn test_session_read_sends_stored_token() {
        let invoker = FakeInvoker::default().with("r0", |req, _| {
            let sent = req.session_token.clone().unwrap_or_default();
            let lsn = sent.lsn(1).unwrap_or(-1);
            reply(
                req,
                "r0",
                Metadata {
                    session_token: Some(format!("1={}", lsn)),
                    ..status(200, lsn)
                },
            )
        });
        let (engine, _invoker, _resolver) = setup(invoker, 1);
        engine.sessions().merge(&partition(), &token("1=5"));

        let response = engine.execute(read(ConsistencyLevel::Session)).await.unwrap();
        assert_eq!(response.lsn, 5);
    }

    // ==========================================================================
    // Quorum reads
    // ==========================================================================

    fn quorum_reply(req: &StoreRequest, address: &str, lsn: i64, write_quorum: u32) -> Result<StoreResult> {
        reply(
            req,
            address,
            Metadata {
                write_quorum: Some(write_quorum),
                replica_set_size: Some(4),
                ..status(200, lsn)
            },
        )
    }

    #[tokio::test]
    async fn test_quorum_read_satisfied_directly() {
        let mut invoker = FakeInvoker::default();
        for address in addresses(4) {
            let addr = address.clone();
            invoker = invoker.with(&address, move |req, _| quorum_reply(req, &addr, 10, 3));
        }
        let (engine, invoker, _resolver) = setup(invoker, 4);

        let response = engine.execute(read(ConsistencyLevel::Strong)).await.unwrap();
        assert_eq!(response.lsn, 10);
        // read quorum of four is three
        assert_eq!(invoker.total_calls(), 3);
    }

    #[tokio::test]
    async fn test_quorum_read_confirms_with_barrier() {
        let invoker = FakeInvoker::default()
            .with("r0", |req, _| quorum_reply(req, "r0", 10, 3))
            // lags on the first read, caught up by the barrier
            .with("r1", |req, call| quorum_reply(req, "r1", if call == 0 { 9 } else { 10 }, 3))
            .with("r2", |req, _| quorum_reply(req, "r2", 10, 3))
            .with("r3", |req, _| quorum_reply(req, "r3", 9, 3));
        let (engine, invoker, resolver) = setup(invoker, 4);

        let response = engine.execute(read(ConsistencyLevel::BoundedStaleness)).await.unwrap();
        assert_eq!(response.lsn, 10);
        assert_eq!(invoker.calls("r1"), 2);
        assert_eq!(invoker.calls("r3"), 1);
        assert_eq!(resolver.invalidation_count(), 0);
    }

    #[tokio::test]
    async fn test_quorum_read_picks_highest_lsn_and_merges_token() {
        let lsns = [98, 100, 100];
        let mut invoker = FakeInvoker::default();
        for (address, lsn) in addresses(3).into_iter().zip(lsns) {
            let addr = address.clone();
            invoker = invoker.with(&address, move |req, _| {
                reply(
                    req,
                    &addr,
                    Metadata {
                        write_quorum: Some(2),
                        session_token: Some(format!("1={}", lsn)),
                        ..status(200, lsn)
                    },
                )
            });
        }
        let (engine, _invoker, _resolver) = setup(invoker, 3);

        let response = engine.execute(read(ConsistencyLevel::Strong)).await.unwrap();
        assert_eq!(response.lsn, 100);
        assert_eq!(engine.sessions().get(&partition()), token("1=100"));
    }

    #[tokio::test]
    async fn test_quorum_read_not_met() {
        let lsns = [10, 9, 8, 7];
        let mut invoker = FakeInvoker::default();
        for (address, lsn) in addresses(4).into_iter().zip(lsns) {
            let addr = address.clone();
            invoker = invoker.with(&address, move |req, _| quorum_reply(req, &addr, lsn, 3));
        }
        let (engine, _invoker, resolver) = setup(invoker, 4);

        let err = engine.execute(read(ConsistencyLevel::Strong)).await.unwrap_err();
        match err {
            RntbdError::QuorumNotMet { required, observed, .. } => {
                assert_eq!(required, 3);
                assert!(observed < 3);
            }
            other => panic!("expected QuorumNotMet, got {:?}", other),
        }
        assert_eq!(resolver.invalidation_count(), 3);
    }

    #[tokio::test]
    async fn test_quorum_read_not_found_is_final() {
        let mut invoker = FakeInvoker::default();
        for address in addresses(3) {
            let addr = address.clone();
            invoker = invoker.with(&address, move |req, _| {
                reply(
                    req,
                    &addr,
                    Metadata {
                        write_quorum: Some(2),
                        ..status(404, 4)
                    },
                )
            });
        }
        let (engine, _invoker, _resolver) = setup(invoker, 3);

        let err = engine.execute(read(ConsistencyLevel::Strong)).await.unwrap_err();
        assert!(matches!(err, RntbdError::NotFound(_)));
        assert_eq!(err.diagnostics().unwrap().request_charge, Some(2.0));
    }

    #[tokio::test]
    async fn test_not_found_without_lsn_is_final_for_every_level() {
        let mut invoker = FakeInvoker::default();
        for address in addresses(3) {
            let addr = address.clone();
            invoker = invoker.with(&address, move |req, _| {
                reply(
                    req,
                    &addr,
                    Metadata {
                        status_code: Some(404),
                        ..Metadata::default()
                    },
                )
            });
        }
        let (engine, _invoker, resolver) = setup(invoker, 3);

        for level in [ConsistencyLevel::Eventual, ConsistencyLevel::Strong] {
            let err = engine.execute(read(level)).await.unwrap_err();
            assert!(matches!(err, RntbdError::NotFound(_)), "{:?}: {:?}", level, err);
        }
        assert_eq!(resolver.invalidation_count(), 0);
    }

    #[tokio::test]
    async fn test_strong_read_waits_for_global_commit() {
        let barriers = Arc::new(AtomicUsize::new(0));
        let mut invoker = FakeInvoker::default();
        for address in addresses(3) {
            let addr = address.clone();
            let barriers = barriers.clone();
            invoker = invoker.with(&address, move |req, _| {
                let global_committed_lsn = if req.operation_type == OperationType::Head {
                    // committed globally from the second barrier round on
                    if barriers.fetch_add(1, Ordering::SeqCst) >= 3 {
                        10
                    } else {
                        8
                    }
                } else {
                    8
                };
                reply(
                    req,
                    &addr,
                    Metadata {
                        write_quorum: Some(2),
                        number_of_read_regions: Some(1),
                        global_committed_lsn: Some(global_committed_lsn),
                        ..status(200, 10)
                    },
                )
            });
        }
        let (engine, _invoker, _resolver) = setup(invoker, 3);

        let response = engine.execute(read(ConsistencyLevel::Strong)).await.unwrap();
        assert_eq!(response.lsn, 10);
        assert_eq!(barriers.load(Ordering::SeqCst), 6);
    }

    // ==========================================================================
    // Writes
    // ==========================================================================

    #[tokio::test]
    async fn test_write_goes_to_primary_and_merges_session() {
        let invoker = FakeInvoker::default()
            .with("r0", |req, _| {
                assert!(req.is_write());
                reply(
                    req,
                    "r0",
                    Metadata {
                        session_token: Some("1=7".into()),
                        quorum_acked_lsn: Some(7),
                        ..status(201, 7)
                    },
                )
            })
            .with("r1", |req, _| reply(req, "r1", status(200, 7)))
            .with("r2", |req, _| reply(req, "r2", status(200, 7)));
        let (engine, invoker, _resolver) = setup(invoker, 3);

        let response = engine.execute(write()).await.unwrap();
        assert_eq!(response.status_code, 201);
        assert_eq!(engine.sessions().get(&partition()), token("1=7"));
        assert_eq!(invoker.calls("r1") + invoker.calls("r2"), 0);
    }

    #[tokio::test]
    async fn test_write_timeout_is_not_retried() {
        let invoker = FakeInvoker::default().with("r0", |_, _| Ok(StoreResult::timeout("r0", 100)));
        let (engine, invoker, resolver) = setup(invoker, 3);

        let err = engine.execute(write()).await.unwrap_err();
        assert!(matches!(err, RntbdError::Timeout { timeout_ms: 100, .. }));
        assert_eq!(invoker.calls("r0"), 1);
        assert_eq!(resolver.invalidation_count(), 0);
    }

    #[tokio::test]
    async fn test_write_barrier_waits_for_secondaries() {
        let invoker = FakeInvoker::default()
            .with("r0", |req, _| {
                reply(
                    req,
                    "r0",
                    Metadata {
                        quorum_acked_lsn: Some(6),
                        write_quorum: Some(3),
                        ..status(201, 7)
                    },
                )
            })
            .with("r1", |req, call| reply(req, "r1", status(200, if call == 0 { 6 } else { 7 })))
            .with("r2", |req, _| reply(req, "r2", status(200, 7)));
        let (engine, invoker, _resolver) = setup(invoker, 3);

        let response = engine.execute(write()).await.unwrap();
        assert_eq!(response.lsn, 7);
        assert_eq!(invoker.calls("r0"), 1);
        assert_eq!(invoker.calls("r1"), 2);
    }

    #[tokio::test]
    async fn test_write_barrier_exhausted() {
        let invoker = FakeInvoker::default()
            .with("r0", |req, _| {
                reply(
                    req,
                    "r0",
                    Metadata {
                        quorum_acked_lsn: Some(6),
                        write_quorum: Some(2),
                        ..status(201, 7)
                    },
                )
            })
            .with("r1", |req, _| reply(req, "r1", status(200, 6)));
        let (engine, invoker, _resolver) = setup(invoker, 2);

        let err = engine.execute(write()).await.unwrap_err();
        assert!(matches!(err, RntbdError::QuorumNotMet { required: 2, observed: 1, .. }));
        assert_eq!(invoker.calls("r1"), config().max_barrier_attempts);
    }
}
