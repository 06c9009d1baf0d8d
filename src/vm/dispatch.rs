//! The VM dispatch loop: consumes `execute` packets routed to this VM's
//! client identity and drives operators, streaming results back on the
//! same transaction id.
//!
//! Single-threaded per endpoint. Long-running iterative methods block the
//! loop by design (no component method runs concurrently with another);
//! between steps the loop drains its inbound queue so a broker nak for the
//! live transaction cancels the stream at the next step boundary.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::config::Limits;
use crate::error::{ErrorCode, OperatorError};
use crate::generate_uuid;
use crate::runtime::client::BrokerClient;
use crate::runtime::packet::{InstructionKind, Packet, PacketKind, TargetKey};
use crate::runtime::signal::StopFlag;
use crate::runtime::socket::Acceptor;
use crate::value::Value;
use crate::vm::component::{Component, ComponentFactory};
use crate::vm::module::Module;
use crate::vm::operator::{ActiveRun, InstantFunction, Method};

struct Vm {
    client: BrokerClient,
    limits: Limits,
    functions: BTreeMap<String, Arc<dyn InstantFunction>>,
    factories: BTreeMap<String, ComponentFactory>,
    components: BTreeMap<String, Arc<Component>>,
    /// Subscription/unsubscription txids awaiting a broker ack.
    expected_acks: HashSet<String>,
    /// Execute packets that arrived while a stream was in flight.
    backlog: VecDeque<Packet>,
}

pub(crate) fn run(
    url: String,
    acceptor: Arc<Acceptor>,
    stop: StopFlag,
    limits: Limits,
    modules: Vec<Arc<Module>>,
    ready: crossbeam::channel::Sender<Result<(), String>>,
) {
    let client = match BrokerClient::connect(&url, &acceptor, &limits) {
        Ok(client) => client,
        Err(err) => {
            let _ = ready.send(Err(err.to_string()));
            return;
        }
    };

    let mut vm = Vm {
        client,
        limits,
        functions: BTreeMap::new(),
        factories: BTreeMap::new(),
        components: BTreeMap::new(),
        expected_acks: HashSet::new(),
        backlog: VecDeque::new(),
    };

    if let Err(err) = vm.import_modules(&modules) {
        let _ = ready.send(Err(err.to_string()));
        return;
    }
    let _ = ready.send(Ok(()));

    loop {
        if let Some(packet) = vm.backlog.pop_front() {
            vm.handle_packet(packet);
            continue;
        }
        match vm.client.listen(vm.limits.vm_tick()) {
            Some(packet) => vm.handle_packet(packet),
            None => {
                if stop.is_raised() {
                    break;
                }
            }
        }
    }

    vm.unwind(&url);
}

impl Vm {
    /// Registers every module's operators and factories, earlier modules
    /// winning name collisions, and subscribes their channels.
    fn import_modules(&mut self, modules: &[Arc<Module>]) -> Result<(), crate::error::Error> {
        for module in modules {
            for (name, op) in module.functions() {
                if self.functions.contains_key(name) {
                    debug!(module = module.name(), function = name, "shadowed by earlier module");
                    continue;
                }
                self.functions.insert(name.to_string(), Arc::clone(op));
                self.subscribe(TargetKey::function(name))?;
            }
            for (type_name, factory) in module.factories() {
                if self.factories.contains_key(type_name) {
                    debug!(module = module.name(), factory = type_name, "shadowed by earlier module");
                    continue;
                }
                self.factories
                    .insert(type_name.to_string(), Arc::clone(factory));
                self.subscribe(TargetKey::define(type_name))?;
            }
        }
        Ok(())
    }

    fn subscribe(&mut self, target: TargetKey) -> Result<(), crate::error::Error> {
        let tx_id = generate_uuid();
        self.client.send_subscribe(&tx_id, &target)?;
        self.expected_acks.insert(tx_id);
        Ok(())
    }

    fn unsubscribe(&mut self, target: TargetKey) {
        let tx_id = generate_uuid();
        if self.client.send_unsubscribe(&tx_id, &target).is_ok() {
            self.expected_acks.insert(tx_id);
        }
    }

    fn handle_packet(&mut self, packet: Packet) {
        debug!(packet = %packet, "VM packet received");
        match packet.kind {
            PacketKind::Respond => {
                self.handle_respond(&packet, None);
            }
            PacketKind::Execute => self.handle_execute(packet),
            other => warn!(kind = other.as_str(), "VM ignoring unexpected packet"),
        }
    }

    /// Consumes a broker `respond`. When `streaming_tx` is set, returns
    /// true if the respond is a nak for that transaction (initiator is
    /// gone and the stream must cancel).
    fn handle_respond(&mut self, packet: &Packet, streaming_tx: Option<&str>) -> bool {
        let tx_id = match packet.tx_id() {
            Ok(tx_id) => tx_id.to_string(),
            Err(_) => return false,
        };
        if self.expected_acks.remove(&tx_id) {
            if packet.status == Some(false) {
                error!(reason = packet.reason().unwrap_or("unknown"), "subscription refused");
            }
            return false;
        }
        if packet.status == Some(false) {
            if streaming_tx == Some(tx_id.as_str()) {
                return true;
            }
            debug!(tx = %tx_id, reason = packet.reason().unwrap_or(""), "late nak ignored");
        }
        false
    }

    fn handle_execute(&mut self, packet: Packet) {
        let Ok(tx_id) = packet.tx_id().map(str::to_string) else {
            warn!("execute without tx id");
            return;
        };
        match packet.instruction {
            Some(InstructionKind::CallFunction) => self.call_function(&tx_id, &packet),
            Some(InstructionKind::DefineComponent) => self.define_component(&tx_id, &packet),
            Some(InstructionKind::DeleteComponent) => self.delete_component(&tx_id, &packet),
            Some(InstructionKind::CallMethod) => self.call_method(&tx_id, &packet),
            None => self.reply_failure(&tx_id, 0, &OperatorError::code(ErrorCode::InvalidPacket)),
        }
    }

    fn call_function(&mut self, tx_id: &str, packet: &Packet) {
        let name = match packet.headers.at(1).and_then(Value::as_str) {
            Some(name) => name.to_string(),
            None => {
                self.reply_failure(tx_id, 0, &OperatorError::code(ErrorCode::InvalidPacket));
                return;
            }
        };
        let Some(op) = self.functions.get(&name).cloned() else {
            self.reply_failure(
                tx_id,
                0,
                &OperatorError::new(ErrorCode::NoSuchFunction, name),
            );
            return;
        };
        let input = packet.input();
        match guarded(|| op.run(input)) {
            Ok(value) => self.reply_value(tx_id, value),
            Err(err) => self.reply_failure(tx_id, 0, &err),
        }
    }

    fn define_component(&mut self, tx_id: &str, packet: &Packet) {
        let type_name = match packet.headers.at(1).and_then(Value::as_str) {
            Some(name) => name.to_string(),
            None => {
                self.reply_failure(tx_id, 0, &OperatorError::code(ErrorCode::InvalidPacket));
                return;
            }
        };
        let instance = match packet.component_name() {
            Ok(name) => name.to_string(),
            Err(_) => {
                self.reply_failure(tx_id, 0, &OperatorError::code(ErrorCode::InvalidPacket));
                return;
            }
        };
        if self.components.contains_key(&instance) {
            self.reply_failure(
                tx_id,
                0,
                &OperatorError::new(ErrorCode::ComponentExists, instance),
            );
            return;
        }
        let Some(factory) = self.factories.get(&type_name).cloned() else {
            self.reply_failure(
                tx_id,
                0,
                &OperatorError::new(ErrorCode::NoSuchComponent, type_name),
            );
            return;
        };
        let attrs = packet.input();
        let component = match guarded(|| factory(attrs)) {
            Ok(component) => Arc::new(component),
            Err(err) => {
                self.reply_failure(tx_id, 0, &err);
                return;
            }
        };

        if self.subscribe(TargetKey::delete(&instance)).is_err() {
            self.reply_failure(tx_id, 0, &OperatorError::code(ErrorCode::NotConnected));
            return;
        }
        let methods: Vec<String> = component.method_names().map(str::to_string).collect();
        for method in &methods {
            if self.subscribe(TargetKey::method(&instance, method)).is_err() {
                self.reply_failure(tx_id, 0, &OperatorError::code(ErrorCode::NotConnected));
                return;
            }
        }
        self.components.insert(instance, component);
        self.reply_value(tx_id, Value::empty_map());
    }

    fn delete_component(&mut self, tx_id: &str, packet: &Packet) {
        let instance = match packet.headers.at(1).and_then(Value::as_str) {
            Some(name) => name.to_string(),
            None => {
                self.reply_failure(tx_id, 0, &OperatorError::code(ErrorCode::InvalidPacket));
                return;
            }
        };
        let Some(component) = self.components.remove(&instance) else {
            self.reply_failure(
                tx_id,
                0,
                &OperatorError::new(ErrorCode::NoSuchComponent, instance),
            );
            return;
        };
        for method in component.method_names() {
            self.unsubscribe(TargetKey::method(&instance, method));
        }
        self.unsubscribe(TargetKey::delete(&instance));
        self.reply_value(tx_id, Value::empty_map());
    }

    fn call_method(&mut self, tx_id: &str, packet: &Packet) {
        let (instance, method_name) = match (
            packet.headers.at(1).and_then(Value::as_str),
            packet.headers.at(2).and_then(Value::as_str),
        ) {
            (Some(instance), Some(method)) => (instance.to_string(), method.to_string()),
            _ => {
                self.reply_failure(tx_id, 0, &OperatorError::code(ErrorCode::InvalidPacket));
                return;
            }
        };
        let Some(component) = self.components.get(&instance).cloned() else {
            self.reply_failure(
                tx_id,
                0,
                &OperatorError::new(ErrorCode::NoSuchComponent, instance),
            );
            return;
        };
        let Some(method) = component.method(&method_name).cloned() else {
            self.reply_failure(
                tx_id,
                0,
                &OperatorError::new(
                    ErrorCode::NoSuchMethod,
                    format!("{instance}.{method_name}"),
                ),
            );
            return;
        };

        let input = packet.input();
        match method {
            Method::Instant(op) => match guarded(|| op.run(&component, input)) {
                Ok(value) => self.reply_value(tx_id, value),
                Err(err) => self.reply_failure(tx_id, 0, &err),
            },
            Method::Iterative(op) => {
                let run = match guarded(|| op.start(&component, input)) {
                    Ok(run) => run,
                    Err(err) => {
                        self.reply_failure(tx_id, 0, &err);
                        return;
                    }
                };
                self.stream(tx_id, ActiveRun::new(run));
            }
        }
    }

    /// Streaming sub-loop for one iterative run. Sequence numbers are
    /// contiguous from 0; a cancelled transaction emits nothing further.
    fn stream(&mut self, tx_id: &str, mut run: ActiveRun) {
        let mut sequence: u32 = 0;
        loop {
            if self.drain_for_cancel(tx_id) {
                debug!(tx = tx_id, "stream cancelled at step boundary");
                return;
            }
            let step = match guarded(|| run.step()) {
                Ok(step) => step,
                Err(err) => {
                    self.reply_failure(tx_id, sequence, &err);
                    return;
                }
            };
            let finished = step.finished;
            if self
                .client
                .send_respond_execute(tx_id, sequence, finished, step.value)
                .is_err()
            {
                warn!(tx = tx_id, "broker gone mid-stream");
                return;
            }
            if finished {
                return;
            }
            sequence += 1;
        }
    }

    /// Drains queued packets without blocking. Returns true if a nak for
    /// `tx_id` arrived (the initiator disconnected). Execute packets are
    /// kept for after the stream.
    fn drain_for_cancel(&mut self, tx_id: &str) -> bool {
        let mut cancelled = false;
        while let Some(packet) = self.client.try_listen() {
            match packet.kind {
                PacketKind::Respond => {
                    if self.handle_respond(&packet, Some(tx_id)) {
                        cancelled = true;
                    }
                }
                PacketKind::Execute => self.backlog.push_back(packet),
                other => warn!(kind = other.as_str(), "VM ignoring unexpected packet"),
            }
        }
        cancelled
    }

    fn reply_value(&mut self, tx_id: &str, value: Value) {
        if self
            .client
            .send_respond_execute(tx_id, 0, true, value)
            .is_err()
        {
            warn!(tx = tx_id, "result dropped, broker gone");
        }
    }

    fn reply_failure(&mut self, tx_id: &str, sequence: u32, err: &OperatorError) {
        if self
            .client
            .send_respond_execute_err(tx_id, sequence, &err.reason())
            .is_err()
        {
            warn!(tx = tx_id, "failure dropped, broker gone");
        }
    }

    /// Teardown: unsubscribe everything, drain outstanding acks with
    /// bounded retries, then disconnect.
    fn unwind(&mut self, url: &str) {
        let functions: Vec<String> = self.functions.keys().cloned().collect();
        for name in functions {
            self.unsubscribe(TargetKey::function(name));
        }
        let factories: Vec<String> = self.factories.keys().cloned().collect();
        for type_name in factories {
            self.unsubscribe(TargetKey::define(type_name));
        }
        let components: Vec<(String, Arc<Component>)> = self
            .components
            .iter()
            .map(|(name, component)| (name.clone(), Arc::clone(component)))
            .collect();
        for (instance, component) in components {
            for method in component.method_names() {
                self.unsubscribe(TargetKey::method(&instance, method));
            }
            self.unsubscribe(TargetKey::delete(&instance));
        }
        self.components.clear();

        let mut idle_ticks = 0;
        while !self.expected_acks.is_empty() && idle_ticks < self.limits.drain_retry_limit {
            match self.client.listen(self.limits.vm_tick()) {
                Some(packet) => {
                    idle_ticks = 0;
                    if packet.kind == PacketKind::Respond {
                        self.handle_respond(&packet, None);
                    }
                }
                None => idle_ticks += 1,
            }
        }
        if !self.expected_acks.is_empty() {
            warn!(
                url,
                outstanding = self.expected_acks.len(),
                "VM stopping with unacked subscriptions"
            );
        }

        let tx_id = generate_uuid();
        if self.client.send_disconnect(&tx_id).is_ok() {
            let _ = self.client.listen(self.limits.vm_tick());
        }
        debug!(url, "VM stopped");
    }
}

/// Runs user code, converting panics into operator errors so the VM thread
/// survives any operator failure.
fn guarded<T>(f: impl FnOnce() -> Result<T, OperatorError>) -> Result<T, OperatorError> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(panic) => {
            let detail = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "operator panicked".to_string());
            Err(OperatorError::new(ErrorCode::ValueError, detail))
        }
    }
}
