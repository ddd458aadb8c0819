//! Process-level entry point: one loop thread plus the endpoints it drives.
//!
//! ```text
//!  App threads (blocking or async)
//!       │
//!  Network / EndpointHandle / ConnectionHandle
//!       │  call_soon / call_get
//!       ▼
//!  loop thread ── NetworkState
//!                   └── Endpoint (socket, routes)
//!                         └── Connection (engine, timer)
//!                               └── Stream
//! ```
//!
//! Ownership only points down. Anything that needs to reach upward (timers,
//! socket tasks, handles) carries ids and looks the owner up again on the
//! loop thread.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, warn};

use crate::address::Address;
use crate::config::{EndpointConfig, NetworkConfig};
use crate::connection::{Connection, Transport};
use crate::endpoint::{ConnectionKey, Endpoint, EndpointId};
use crate::engine::EngineFactory;
use crate::error::{Error, Result};
use crate::event_loop::{EventLoop, LoopHandle, Ticker, TimerHandle};
use crate::handle::EndpointHandle;

/// How often a graceful close checks whether draining has finished
const CLOSE_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Loop-thread state: every endpoint of one network.
pub struct NetworkState {
    handle: LoopHandle<NetworkState>,
    endpoints: HashMap<EndpointId, Endpoint>,
    next_endpoint: EndpointId,
    close_ticker: Option<Ticker>,
}

impl NetworkState {
    fn new(handle: LoopHandle<NetworkState>) -> Self {
        Self {
            handle,
            endpoints: HashMap::new(),
            next_endpoint: 0,
            close_ticker: None,
        }
    }

    pub fn handle(&self) -> &LoopHandle<NetworkState> {
        &self.handle
    }

    pub fn endpoint(&self, id: EndpointId) -> Option<&Endpoint> {
        self.endpoints.get(&id)
    }

    pub fn endpoint_mut(&mut self, id: EndpointId) -> Result<&mut Endpoint> {
        self.endpoints.get_mut(&id).ok_or(Error::UnknownEndpoint(id))
    }

    pub fn endpoint_count(&self) -> usize {
        self.endpoints.len()
    }

    pub fn connection_count(&self) -> usize {
        self.endpoints.values().map(Endpoint::connection_count).sum()
    }

    pub(crate) fn add_endpoint(
        &mut self,
        local: Address,
        config: EndpointConfig,
        factory: Arc<dyn EngineFactory>,
    ) -> Result<(EndpointId, Address)> {
        let id = self.next_endpoint;
        let endpoint = Endpoint::bind(id, local, config, factory, self.handle.clone())?;
        let bound = endpoint.local_addr();
        self.next_endpoint += 1;
        self.endpoints.insert(id, endpoint);
        Ok((id, bound))
    }

    /// Run `f` against a live connection; `ConnectionGone` once it has been
    /// unregistered.
    pub(crate) fn with_connection<R>(
        &mut self,
        endpoint: EndpointId,
        key: ConnectionKey,
        f: impl FnOnce(&mut Connection, &mut dyn Transport) -> R,
    ) -> Result<R> {
        let result = self
            .endpoints
            .get_mut(&endpoint)
            .and_then(|ep| ep.with_connection(key, f))
            .ok_or(Error::ConnectionGone);
        self.reap(endpoint);
        result
    }

    pub(crate) fn dispatch_datagram(&mut self, endpoint: EndpointId, from: SocketAddr, data: Bytes) {
        if let Some(ep) = self.endpoints.get_mut(&endpoint) {
            ep.handle_datagram(from, data);
            self.reap(endpoint);
        }
    }

    pub(crate) fn connection_timeout(&mut self, endpoint: EndpointId, key: ConnectionKey) {
        if let Some(ep) = self.endpoints.get_mut(&endpoint) {
            ep.connection_timeout(key);
            self.reap(endpoint);
        }
    }

    pub(crate) fn flush_endpoint(&mut self, endpoint: EndpointId) {
        if let Some(ep) = self.endpoints.get_mut(&endpoint) {
            ep.flush();
        }
    }

    /// Begin a graceful close of one endpoint; it is dropped once drained.
    pub(crate) fn close_endpoint(&mut self, endpoint: EndpointId) -> Result<()> {
        self.endpoint_mut(endpoint)?.close();
        self.reap(endpoint);
        Ok(())
    }

    /// Drop a closing endpoint whose connections are all gone.
    fn reap(&mut self, endpoint: EndpointId) {
        let drained = self
            .endpoints
            .get(&endpoint)
            .is_some_and(|ep| ep.is_closing() && ep.connection_count() == 0);
        if drained {
            self.endpoints.remove(&endpoint);
            debug!("Endpoint {} removed", endpoint);
        }
    }

    /// Close every endpoint gracefully and stop the loop once all
    /// connections have drained.
    fn begin_close(&mut self) {
        let ids: Vec<_> = self.endpoints.keys().copied().collect();
        for id in ids {
            if let Some(ep) = self.endpoints.get_mut(&id) {
                ep.close();
            }
            self.reap(id);
        }

        if self.endpoints.is_empty() {
            self.handle.shutdown();
            return;
        }

        debug!("Waiting for {} connections to drain", self.connection_count());
        let ticker = self.handle.call_every(
            CLOSE_POLL_INTERVAL,
            |net: &mut NetworkState| {
                let ids: Vec<_> = net.endpoints.keys().copied().collect();
                for id in ids {
                    net.reap(id);
                }
                if net.endpoints.is_empty() {
                    net.handle.shutdown();
                }
            },
            true,
        );
        match ticker {
            Ok(ticker) => self.close_ticker = Some(ticker),
            Err(_) => self.handle.shutdown(),
        }
    }

    fn abort_all(&mut self) {
        for (_, mut ep) in self.endpoints.drain() {
            ep.abort();
        }
    }
}

/// Owns the loop thread and, through it, every endpoint.
///
/// Dropping the network closes it: gracefully by default (every connection
/// is closed and drained first), or immediately after
/// [`set_shutdown_immediate`](Self::set_shutdown_immediate).
pub struct Network {
    event_loop: EventLoop<NetworkState>,
    shutdown_immediate: bool,
}

impl Network {
    pub fn new() -> Result<Self> {
        Self::with_config(NetworkConfig::default())
    }

    pub fn with_config(config: NetworkConfig) -> Result<Self> {
        let event_loop = EventLoop::spawn(&config.thread_name, |handle| {
            NetworkState::new(handle.clone())
        })?;
        debug!("Network started on thread {}", config.thread_name);
        Ok(Self {
            event_loop,
            shutdown_immediate: false,
        })
    }

    pub fn handle(&self) -> &LoopHandle<NetworkState> {
        self.event_loop.handle()
    }

    /// Bind a new endpoint on `local`.
    pub fn endpoint(
        &self,
        local: Address,
        config: EndpointConfig,
        factory: Arc<dyn EngineFactory>,
    ) -> Result<EndpointHandle> {
        let (id, bound) = self
            .handle()
            .call_get(move |net| net.add_endpoint(local, config, factory))??;
        Ok(EndpointHandle::new(self.handle().clone(), id, bound))
    }

    // ── scheduling ────────────────────────────────────────────────────────

    pub fn in_event_loop(&self) -> bool {
        self.handle().in_event_loop()
    }

    pub fn call_soon<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut NetworkState) + Send + 'static,
    {
        self.handle().call_soon(f)
    }

    pub fn call<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut NetworkState) + Send + 'static,
    {
        self.handle().call(f)
    }

    pub fn call_get<R, F>(&self, f: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut NetworkState) -> R + Send + 'static,
    {
        self.handle().call_get(f)
    }

    pub fn call_later<F>(&self, delay: Duration, f: F) -> Result<TimerHandle>
    where
        F: FnOnce(&mut NetworkState) + Send + 'static,
    {
        self.handle().call_later(delay, f)
    }

    pub fn call_every<F>(&self, interval: Duration, f: F, start_immediately: bool) -> Result<Ticker>
    where
        F: FnMut(&mut NetworkState) + Send + 'static,
    {
        self.handle().call_every(interval, f, start_immediately)
    }

    pub fn call_every_weak<T, F>(&self, interval: Duration, target: Weak<T>, f: F) -> Result<()>
    where
        T: Send + Sync + 'static,
        F: FnMut(&mut NetworkState, &T) + Send + 'static,
    {
        self.handle().call_every_weak(interval, target, f)
    }

    /// Drop `value` on the loop thread after work already queued there.
    pub fn reset_soon<T: Send + 'static>(&self, value: T) -> Result<()> {
        self.handle().call_soon(move |_| drop(value))
    }

    // ── shutdown ──────────────────────────────────────────────────────────

    /// Skip the graceful drain when the network is closed or dropped.
    pub fn set_shutdown_immediate(&mut self, immediate: bool) {
        self.shutdown_immediate = immediate;
    }

    /// Close every endpoint and stop the loop, blocking until it exits.
    pub fn close(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if !self.handle().is_running() {
            self.event_loop.stop();
            return;
        }

        let queued = if self.shutdown_immediate {
            self.handle().call_soon(|net: &mut NetworkState| {
                net.abort_all();
                net.handle.shutdown();
            })
        } else {
            self.handle().call_soon(NetworkState::begin_close)
        };

        if queued.is_err() {
            warn!("Network loop already gone during shutdown");
            self.event_loop.stop();
            return;
        }
        self.event_loop.join();
        debug!("Network closed");
    }
}

impl Drop for Network {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_network_scheduling() {
        let network = Network::new().unwrap();
        assert!(!network.in_event_loop());
        assert!(network.call_get(|net| net.handle().in_event_loop()).unwrap());
        assert_eq!(network.call_get(|net| net.endpoint_count()).unwrap(), 0);
    }

    #[test]
    fn test_reset_soon_drops_on_loop_thread() {
        struct DropWitness(Arc<Mutex<Option<std::thread::ThreadId>>>);
        impl Drop for DropWitness {
            fn drop(&mut self) {
                *self.0.lock().unwrap() = Some(std::thread::current().id());
            }
        }

        let network = Network::new().unwrap();
        let seen = Arc::new(Mutex::new(None));
        network.reset_soon(DropWitness(seen.clone())).unwrap();
        let loop_thread = network.call_get(|_| std::thread::current().id()).unwrap();
        assert_eq!(*seen.lock().unwrap(), Some(loop_thread));
    }

    #[test]
    fn test_close_without_endpoints() {
        let network = Network::with_config(NetworkConfig {
            thread_name: "close-test".to_string(),
        })
        .unwrap();
        let handle = network.handle().clone();
        network.close();
        assert!(!handle.is_running());
        assert!(matches!(handle.call_soon(|_| ()), Err(Error::LoopStopped)));
    }

    #[test]
    fn test_shutdown_immediate() {
        let mut network = Network::new().unwrap();
        network.set_shutdown_immediate(true);
        let handle = network.handle().clone();
        drop(network);
        assert!(!handle.is_running());
    }
}
