use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use rntbd_common::protocol::error::{Result, RntbdError};
use rntbd_common::transport::{Channel, ChannelConfig, RequestTimer};
use rntbd_common::Frame;
use tokio::sync::{Mutex, Notify, OwnedSemaphorePermit, Semaphore};

use crate::config::{DirectConfig, SaturationPolicy};

/// Point-in-time view of one endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointStats {
    pub address: String,
    pub channels: usize,
    pub open_channels: usize,
    pub in_flight: usize,
    pub available_permits: usize,
}

/// One replica address: its pooled channels, its admission semaphore and
/// the number of requests currently admitted.
pub struct Endpoint {
    address: String,
    channels: Mutex<Vec<Arc<Channel>>>,
    /// Connects in progress. Only changed while `channels` is locked.
    connecting: AtomicUsize,
    connected: Notify,
    permits: Arc<Semaphore>,
    in_flight: AtomicUsize,
}

impl Endpoint {
    fn new(address: &str, max_requests: usize) -> Self {
        Self {
            address: address.to_string(),
            channels: Mutex::new(Vec::new()),
            connecting: AtomicUsize::new(0),
            connected: Notify::new(),
            permits: Arc::new(Semaphore::new(max_requests)),
            in_flight: AtomicUsize::new(0),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    async fn stats(&self) -> EndpointStats {
        let channels = self.channels.lock().await;
        EndpointStats {
            address: self.address.clone(),
            channels: channels.len(),
            open_channels: channels.iter().filter(|c| c.is_open()).count(),
            in_flight: self.in_flight(),
            available_permits: self.permits.available_permits(),
        }
    }

    async fn close(&self) {
        self.permits.close();
        let channels: Vec<Arc<Channel>> = self.channels.lock().await.drain(..).collect();
        for channel in channels {
            channel.close();
        }
    }
}

/// Admitted slot on an endpoint, bound to the channel it will use.
///
/// Holds one admission permit until dropped.
pub struct EndpointLease {
    endpoint: Arc<Endpoint>,
    channel: Arc<Channel>,
    _permit: OwnedSemaphorePermit,
}

impl EndpointLease {
    pub fn channel(&self) -> &Arc<Channel> {
        &self.channel
    }

    pub fn address(&self) -> &str {
        &self.endpoint.address
    }

    pub async fn send(&self, frame: Frame) -> Result<Frame> {
        self.channel.send(frame).await
    }
}

impl Drop for EndpointLease {
    fn drop(&mut self) {
        let previous = self.endpoint.in_flight.fetch_sub(1, Ordering::AcqRel);
        rntbd_common::report_issue_unless!(
            previous > 0,
            self.endpoint.address,
            "in-flight counter underflow"
        );
    }
}

/// Per-address channel pools with bounded admission.
///
/// # Architecture
///
/// - Endpoints are created on first use and keyed by address
/// - Each endpoint opens up to `max_channels_per_endpoint` channels lazily
/// - Requests go to the least loaded open channel; closed channels are
///   evicted and replaced on the next acquisition
/// - At most `max_requests_per_endpoint` requests are admitted at once;
///   beyond that the saturation policy decides between waiting and failing
pub struct EndpointManager {
    endpoints: DashMap<String, Arc<Endpoint>>,
    timer: Arc<RequestTimer>,
    channel_config: ChannelConfig,
    config: DirectConfig,
    closed: AtomicBool,
}

impl EndpointManager {
    /// Creates a manager and its request timer. Must be called inside a
    /// tokio runtime.
    pub fn new(config: DirectConfig) -> Result<Self> {
        config.validate()?;
        let timer = Arc::new(RequestTimer::new(config.request_timeout(), config.timer_resolution())?);
        Ok(Self {
            endpoints: DashMap::new(),
            timer,
            channel_config: config.channel_config(),
            config,
            closed: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &DirectConfig {
        &self.config
    }

    pub fn timer(&self) -> &Arc<RequestTimer> {
        &self.timer
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn endpoint(&self, address: &str) -> Arc<Endpoint> {
        self.endpoints
            .entry(address.to_string())
            .or_insert_with(|| Arc::new(Endpoint::new(address, self.config.max_requests_per_endpoint)))
            .clone()
    }

    /// Admits one request to `address` and picks the channel it will use.
    ///
    /// # Errors
    ///
    /// - `EndpointSaturated` when no permit is available under `FailFast`,
    ///   or none frees up within `acquire_timeout_ms` under `Wait`
    /// - `Connection` when a new channel cannot be opened
    /// - `Shutdown` after [`close`](Self::close) or [`retire`](Self::retire)
    pub async fn acquire(&self, address: &str) -> Result<EndpointLease> {
        if self.is_closed() {
            return Err(RntbdError::Shutdown("endpoint manager is closed".to_string()));
        }

        let endpoint = self.endpoint(address);
        let permit = self.admit(&endpoint).await?;
        endpoint.in_flight.fetch_add(1, Ordering::AcqRel);

        let channel = match self.select_channel(&endpoint).await {
            Ok(channel) => channel,
            Err(e) => {
                endpoint.in_flight.fetch_sub(1, Ordering::AcqRel);
                drop(permit);
                return Err(e);
            }
        };

        Ok(EndpointLease {
            endpoint,
            channel,
            _permit: permit,
        })
    }

    async fn admit(&self, endpoint: &Arc<Endpoint>) -> Result<OwnedSemaphorePermit> {
        let saturated = || RntbdError::EndpointSaturated {
            address: endpoint.address.clone(),
            limit: self.config.max_requests_per_endpoint,
        };
        let shut_down = || RntbdError::Shutdown(format!("endpoint {} was retired", endpoint.address));

        match self.config.saturation_policy {
            SaturationPolicy::FailFast => match endpoint.permits.clone().try_acquire_owned() {
                Ok(permit) => Ok(permit),
                Err(tokio::sync::TryAcquireError::NoPermits) => {
                    tracing::debug!(address = %endpoint.address, "endpoint saturated, failing fast");
                    Err(saturated())
                }
                Err(tokio::sync::TryAcquireError::Closed) => Err(shut_down()),
            },
            SaturationPolicy::Wait => {
                let acquire = endpoint.permits.clone().acquire_owned();
                match tokio::time::timeout(self.config.acquire_timeout(), acquire).await {
                    Ok(Ok(permit)) => Ok(permit),
                    Ok(Err(_)) => Err(shut_down()),
                    Err(_) => {
                        tracing::debug!(
                            address = %endpoint.address,
                            timeout_ms = self.config.acquire_timeout_ms,
                            "timed out waiting for endpoint admission"
                        );
                        Err(saturated())
                    }
                }
            }
        }
    }

    /// Picks the least loaded open channel, opening a new one when every
    /// channel is busy and the endpoint is below its channel limit.
    ///
    /// The pool lock is never held across a connect. Acquirers that find no
    /// open channel while connects are already in progress wait for one of
    /// them instead of starting their own; if that connect fails they fail
    /// with it.
    async fn select_channel(&self, endpoint: &Endpoint) -> Result<Arc<Channel>> {
        let mut waited = false;
        loop {
            let connected = endpoint.connected.notified();
            let fallback = {
                let mut channels = endpoint.channels.lock().await;

                let before = channels.len();
                channels.retain(|c| c.is_open());
                if channels.len() < before {
                    tracing::debug!(
                        address = %endpoint.address,
                        evicted = before - channels.len(),
                        "Removing closed channels from endpoint"
                    );
                }

                let least_loaded = channels
                    .iter()
                    .min_by_key(|c| c.pending_count())
                    .cloned();
                let opening = endpoint.connecting.load(Ordering::Acquire);
                let below_limit = channels.len() + opening < self.config.max_channels_per_endpoint;

                match least_loaded {
                    Some(channel) if channel.pending_count() == 0 || !below_limit => return Ok(channel),
                    None if waited => {
                        return Err(RntbdError::Connection(format!(
                            "no channel to {} could be opened",
                            endpoint.address
                        )));
                    }
                    None if !below_limit => None,
                    least_loaded => {
                        endpoint.connecting.fetch_add(1, Ordering::AcqRel);
                        Some(least_loaded)
                    }
                }
            };

            let Some(fallback) = fallback else {
                connected.await;
                waited = true;
                continue;
            };

            let opened = Channel::connect(&endpoint.address, &self.channel_config, self.timer.clone()).await;
            let result = {
                let mut channels = endpoint.channels.lock().await;
                endpoint.connecting.fetch_sub(1, Ordering::AcqRel);
                match opened {
                    Ok(channel) => {
                        let channel = Arc::new(channel);
                        channels.push(channel.clone());
                        tracing::debug!(
                            address = %endpoint.address,
                            channel = channel.id(),
                            channels = channels.len(),
                            "opened channel"
                        );
                        Ok(channel)
                    }
                    Err(e) => match fallback {
                        Some(channel) => {
                            tracing::debug!(address = %endpoint.address, error = %e, "connect failed, reusing busy channel");
                            Ok(channel)
                        }
                        None => Err(e),
                    },
                }
            };
            endpoint.connected.notify_waiters();
            return result;
        }
    }

    /// Closes and forgets the endpoint for `address`. Waiters on its
    /// admission semaphore fail with `Shutdown`.
    pub async fn retire(&self, address: &str) -> bool {
        match self.endpoints.remove(address) {
            Some((_, endpoint)) => {
                tracing::debug!(%address, "retiring endpoint");
                endpoint.close().await;
                true
            }
            None => false,
        }
    }

    /// Closes every endpoint and the request timer.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let addresses: Vec<String> = self.endpoints.iter().map(|e| e.key().clone()).collect();
        for address in addresses {
            self.retire(&address).await;
        }
        let cancelled = self.timer.close();
        tracing::debug!(cancelled, "endpoint manager closed");
    }

    pub fn endpoint_count(&self) -> usize {
        self.endpoints.len()
    }

    pub async fn stats(&self, address: &str) -> Option<EndpointStats> {
        let endpoint = self.endpoints.get(address).map(|e| e.value().clone())?;
        Some(endpoint.stats().await)
    }
}
