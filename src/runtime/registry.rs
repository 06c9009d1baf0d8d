//! Endpoint registry: the host-facing handle that owns broker and VM
//! lifecycles per URL. There are deliberately no process-wide tables; a
//! host binding owns a [`Runtime`] and every start/stop/connect goes
//! through it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;

use tracing::warn;

use crate::config::Limits;
use crate::error::Error;
use crate::runtime::broker;
use crate::runtime::client::BrokerClient;
use crate::runtime::signal::StopFlag;
use crate::runtime::socket::Acceptor;
use crate::vm;
use crate::vm::module::Module;

struct VmHandle {
    stop: StopFlag,
    thread: Option<JoinHandle<()>>,
}

struct Endpoint {
    acceptor: Arc<Acceptor>,
    stop: StopFlag,
    thread: Option<JoinHandle<()>>,
    vm: Option<VmHandle>,
}

/// Owns every broker endpoint and VM started by this host.
pub struct Runtime {
    limits: Limits,
    endpoints: Mutex<HashMap<String, Endpoint>>,
}

fn lock_endpoints(runtime: &Runtime) -> MutexGuard<'_, HashMap<String, Endpoint>> {
    match runtime.endpoints.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl Runtime {
    pub fn new() -> Self {
        Self::with_limits(Limits::default())
    }

    pub fn with_limits(limits: Limits) -> Self {
        Self {
            limits,
            endpoints: Mutex::new(HashMap::new()),
        }
    }

    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    /// Starts a broker thread for `url`. Returns once the endpoint accepts
    /// connections.
    pub fn broker_start(&self, url: &str) -> Result<(), Error> {
        let mut endpoints = lock_endpoints(self);
        if endpoints.contains_key(url) {
            return Err(Error::UrlOccupied(url.to_string()));
        }
        let acceptor = Arc::new(Acceptor::new());
        let stop = StopFlag::new();
        let (ready_tx, ready_rx) = crossbeam::channel::bounded(1);
        let thread = std::thread::Builder::new()
            .name(format!("ailoy-broker {url}"))
            .spawn({
                let url = url.to_string();
                let acceptor = Arc::clone(&acceptor);
                let stop = stop.clone();
                let limits = self.limits.clone();
                move || broker::run(url, acceptor, stop, limits, ready_tx)
            })
            .map_err(|err| Error::Connect {
                url: url.to_string(),
                reason: format!("broker thread spawn failed: {err}"),
            })?;
        if ready_rx.recv().is_err() {
            return Err(Error::Connect {
                url: url.to_string(),
                reason: "broker thread exited before ready".to_string(),
            });
        }
        endpoints.insert(
            url.to_string(),
            Endpoint {
                acceptor,
                stop,
                thread: Some(thread),
                vm: None,
            },
        );
        Ok(())
    }

    /// Stops the broker (and any VM) at `url` and joins their threads.
    pub fn broker_stop(&self, url: &str) -> Result<(), Error> {
        let mut endpoint = {
            let mut endpoints = lock_endpoints(self);
            endpoints
                .remove(url)
                .ok_or_else(|| Error::UnknownEndpoint(url.to_string()))?
        };
        if let Some(vm) = endpoint.vm.take() {
            stop_vm(vm, url);
        }
        endpoint.stop.raise();
        if let Some(thread) = endpoint.thread.take() {
            if thread.join().is_err() {
                warn!(url, "broker thread panicked");
            }
        }
        Ok(())
    }

    /// Starts a VM thread against the broker at `url` with an ordered list
    /// of modules (earlier modules win name collisions). Returns once the
    /// VM is connected and subscribed.
    pub fn vm_start(&self, url: &str, modules: Vec<Arc<Module>>) -> Result<(), Error> {
        let stop = StopFlag::new();
        // Reserve the VM slot first so concurrent starts race on the table,
        // not on thread spawn.
        let acceptor = {
            let mut endpoints = lock_endpoints(self);
            let endpoint = endpoints
                .get_mut(url)
                .ok_or_else(|| Error::UnknownEndpoint(url.to_string()))?;
            if endpoint.vm.is_some() {
                return Err(Error::VmAlreadyRunning(url.to_string()));
            }
            endpoint.vm = Some(VmHandle {
                stop: stop.clone(),
                thread: None,
            });
            Arc::clone(&endpoint.acceptor)
        };

        let (ready_tx, ready_rx) = crossbeam::channel::bounded(1);
        let spawned = std::thread::Builder::new()
            .name(format!("ailoy-vm {url}"))
            .spawn({
                let url = url.to_string();
                let stop = stop.clone();
                let limits = self.limits.clone();
                move || vm::dispatch::run(url, acceptor, stop, limits, modules, ready_tx)
            });
        let thread = match spawned {
            Ok(thread) => thread,
            Err(err) => {
                self.clear_vm_slot(url);
                return Err(Error::VmStartup(format!("thread spawn failed: {err}")));
            }
        };

        match ready_rx.recv() {
            Ok(Ok(())) => {
                let mut endpoints = lock_endpoints(self);
                if let Some(vm) = endpoints.get_mut(url).and_then(|e| e.vm.as_mut()) {
                    vm.thread = Some(thread);
                }
                Ok(())
            }
            Ok(Err(reason)) => {
                self.clear_vm_slot(url);
                let _ = thread.join();
                Err(Error::VmStartup(reason))
            }
            Err(_) => {
                self.clear_vm_slot(url);
                let _ = thread.join();
                Err(Error::VmStartup("VM thread exited before ready".to_string()))
            }
        }
    }

    fn clear_vm_slot(&self, url: &str) {
        let mut endpoints = lock_endpoints(self);
        if let Some(endpoint) = endpoints.get_mut(url) {
            endpoint.vm = None;
        }
    }

    /// Signals the VM at `url` to unwind (unsubscribe, disconnect) and
    /// joins its thread.
    pub fn vm_stop(&self, url: &str) -> Result<(), Error> {
        let vm = {
            let mut endpoints = lock_endpoints(self);
            let endpoint = endpoints
                .get_mut(url)
                .ok_or_else(|| Error::UnknownEndpoint(url.to_string()))?;
            endpoint.vm.take()
        };
        match vm {
            Some(vm) => {
                stop_vm(vm, url);
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// Connects a fresh client to the broker at `url`.
    pub fn client(&self, url: &str) -> Result<BrokerClient, Error> {
        let acceptor = {
            let endpoints = lock_endpoints(self);
            let endpoint = endpoints
                .get(url)
                .ok_or_else(|| Error::UnknownEndpoint(url.to_string()))?;
            Arc::clone(&endpoint.acceptor)
        };
        BrokerClient::connect(url, &acceptor, &self.limits)
    }
}

fn stop_vm(mut vm: VmHandle, url: &str) {
    vm.stop.raise();
    if let Some(thread) = vm.thread.take() {
        if thread.join().is_err() {
            warn!(url, "VM thread panicked");
        }
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        let endpoints: Vec<(String, Endpoint)> = lock_endpoints(self).drain().collect();
        for (url, mut endpoint) in endpoints {
            if let Some(vm) = endpoint.vm.take() {
                stop_vm(vm, &url);
            }
            endpoint.stop.raise();
            if let Some(thread) = endpoint.thread.take() {
                let _ = thread.join();
            }
        }
    }
}
