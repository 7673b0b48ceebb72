//! An exported node: the node side of the client-node protocol.
//!
//! [`RemoteNode`] owns the control-context state of one exported node: the
//! memory regions the driver registered, the ports and their mixes, and the
//! node-scope I/O bindings. The node implementation itself runs on a
//! [`DataLoop`]; every call into it is an `invoke`.
//!
//! Requests carrying a sequence number are answered with `Done { seq, res }`,
//! `res` being 0 or a negative errno. Messages without one only log failures.
//! Outgoing messages are queued on the channel returned by [`RemoteNode::new`].
//!
//! # Example
//!
//! ```rust,ignore
//! use parallax_remote::node::{BufferSource, RemoteNode};
//!
//! let (mut node, outbox) = RemoteNode::new(NodeConfig::default(), BufferSource::new())?;
//! node.serve(&mut socket, &outbox)?;
//! ```

use super::implementation::{EnumParams, NodeEvent, NodeImpl};
use crate::buffer::{Buffer, BufferBuilder, WireBufferRef};
use crate::config::NodeConfig;
use crate::error::{Error, Result};
use crate::memory::{MemoryKind, ProtFlags, RegionRegistry};
use crate::ownership::INVALID_ID;
use crate::port::{
    Direction, IoBinding, IoBuffers, IoKind, Mix, MixKey, MixPool, MixState, Param, Port,
    param_id,
};
use crate::rt::{DataLoop, RtState};
use crate::sync::SyncPoints;
use crate::transport::{Command, ControlMessage, ControlSocket, Received, TransportChannel};
use rustix::fd::OwnedFd;
use std::collections::{BTreeMap, HashMap};

/// Enumeration request waiting for asynchronous results.
#[derive(Debug, Clone, Copy)]
struct PendingEnum {
    seq: u32,
    direction: Direction,
    port_id: u32,
}

/// Control-context state of an exported node.
pub struct RemoteNode {
    config: NodeConfig,
    registry: RegionRegistry,
    mixes: MixPool,
    ports: BTreeMap<(Direction, u32), Port>,
    node_io: HashMap<IoKind, IoBinding>,
    sync: SyncPoints<PendingEnum>,
    data_loop: DataLoop,
    events: kanal::Receiver<NodeEvent>,
    outbox: kanal::Sender<ControlMessage>,
    remote_id: Option<u32>,
    transport_generation: u64,
    active: bool,
    available: bool,
    destroyed: bool,
}

impl RemoteNode {
    /// Start the data loop for `node`.
    ///
    /// Returns the node and the receiver of the messages it sends to the
    /// driver.
    pub fn new<N>(config: NodeConfig, node: N) -> Result<(Self, kanal::Receiver<ControlMessage>)>
    where
        N: NodeImpl + 'static,
    {
        let (event_tx, events) = kanal::unbounded();
        let (outbox, outbox_rx) = kanal::unbounded();
        let data_loop = DataLoop::spawn(&config.rt, Box::new(node), event_tx)?;

        let mut remote = Self {
            mixes: MixPool::new(config.max_mixes),
            config,
            registry: RegionRegistry::new(),
            ports: BTreeMap::new(),
            node_io: HashMap::new(),
            sync: SyncPoints::new(),
            data_loop,
            events,
            outbox,
            remote_id: None,
            transport_generation: 0,
            active: false,
            available: false,
            destroyed: false,
        };
        remote.refresh_ports()?;
        Ok((remote, outbox_rx))
    }

    /// Memory regions registered by the driver.
    pub fn registry(&self) -> &RegionRegistry {
        &self.registry
    }

    /// Mixes of all ports.
    pub fn mixes(&self) -> &MixPool {
        &self.mixes
    }

    /// Local bookkeeping of a port.
    pub fn port(&self, direction: Direction, port_id: u32) -> Option<&Port> {
        self.ports.get(&(direction, port_id))
    }

    /// Node-scope I/O binding of `kind`.
    pub fn node_io(&self, kind: IoKind) -> Option<&IoBinding> {
        self.node_io.get(&kind)
    }

    /// Id the driver gave the node, once a transport arrived.
    pub fn remote_id(&self) -> Option<u32> {
        self.remote_id
    }

    /// True while the node wants to be scheduled.
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// True while a working transport is installed.
    pub fn is_available(&self) -> bool {
        self.available
    }

    /// Enumerations waiting for asynchronous results.
    pub fn pending_syncs(&self) -> usize {
        self.sync.len()
    }

    /// The realtime loop running the node implementation.
    pub fn data_loop(&self) -> &DataLoop {
        &self.data_loop
    }

    /// Announce the node: `Update`, one `PortUpdate` per port, `Done(0, 0)`.
    pub fn export(&mut self) -> Result<()> {
        let (max_input_ports, max_output_ports, params) = self.data_loop.invoke(|state| {
            let node = state.node();
            let (inputs, outputs) = node.max_ports();
            (inputs, outputs, node.params())
        })?;
        self.refresh_ports()?;

        self.send(ControlMessage::Update {
            max_input_ports,
            max_output_ports,
            params,
        });
        for port in self.ports.values() {
            let update = ControlMessage::PortUpdate {
                direction: port.direction(),
                port_id: port.port_id(),
                params: port.params().to_vec(),
                info: Some(port.exported_info()),
            };
            self.send(update);
        }
        self.send(ControlMessage::Done { seq: 0, res: 0 });
        tracing::debug!("exported node with {} ports", self.ports.len());
        Ok(())
    }

    /// Ask the driver to (de)activate the node.
    pub fn set_active(&mut self, active: bool) {
        self.active = active;
        self.send(ControlMessage::SetActive { active });
    }

    /// Handle one message from the driver.
    ///
    /// Errors are protocol violations (wrong descriptors, node-bound
    /// messages); failed requests are answered with `Done` instead.
    pub fn handle(&mut self, message: ControlMessage, fds: Vec<OwnedFd>) -> Result<()> {
        if self.destroyed {
            return Err(Error::LoopStopped);
        }
        if fds.len() != message.fd_count() {
            return Err(Error::Protocol(format!(
                "{} with {} fds, expected {}",
                message.name(),
                fds.len(),
                message.fd_count()
            )));
        }
        let name = message.name();
        tracing::trace!("handle {}", name);
        let mut fds = fds.into_iter();

        match message {
            ControlMessage::AddMemory {
                mem_id,
                kind,
                flags,
            } => {
                let fd = fds.next().ok_or_else(|| Error::Protocol("missing fd".into()))?;
                if let Err(e) = self.add_memory(mem_id, kind, fd, flags) {
                    tracing::warn!("add memory {}: {}", mem_id, e);
                }
            }
            ControlMessage::Transport { node_id } => {
                let (Some(read), Some(write)) = (fds.next(), fds.next()) else {
                    return Err(Error::Protocol("transport needs two fds".into()));
                };
                if let Err(e) = self.set_transport(node_id, read, write) {
                    tracing::error!("node {}: failed to install transport: {}", node_id, e);
                }
            }
            ControlMessage::SetIo {
                id,
                mem_id,
                offset,
                size,
            } => {
                if let Err(e) = self.set_io(IoKind::from_raw(id), mem_id, offset, size) {
                    tracing::warn!("set io {}: {}", id, e);
                }
            }
            ControlMessage::PortSetIo {
                seq,
                direction,
                port_id,
                mix_id,
                id,
                mem_id,
                offset,
                size,
            } => {
                let key = MixKey::new(direction, port_id, mix_id);
                let res = self.port_set_io(key, IoKind::from_raw(id), mem_id, offset, size);
                self.release_unused_mix(key);
                self.done(seq, res);
            }
            ControlMessage::PortUseBuffers {
                seq,
                direction,
                port_id,
                mix_id,
                buffers,
            } => {
                let key = MixKey::new(direction, port_id, mix_id);
                let res = self.port_use_buffers(key, &buffers);
                self.release_unused_mix(key);
                self.done(seq, res);
            }
            ControlMessage::PortSetParam {
                seq,
                direction,
                port_id,
                param,
            } => {
                let res = self.port_set_param(direction, port_id, param);
                self.done(seq, res);
            }
            ControlMessage::Command { seq, command } => {
                let res = self.command(command);
                self.done(seq, res);
            }
            ControlMessage::PortEnumParams {
                seq,
                direction,
                port_id,
                id,
                start,
                num,
            } => match self.port_enum_params(seq, direction, port_id, id, start, num) {
                Ok(true) => self.done(seq, Ok(())),
                Ok(false) => {}
                Err(e) => self.done(seq, Err(e)),
            },
            ControlMessage::PortReuseBuffer { port_id, buffer_id } => {
                let res = self
                    .data_loop
                    .invoke(move |state| state.node_mut().port_reuse_buffer(port_id, buffer_id))
                    .and_then(|res| res);
                if let Err(e) = res {
                    tracing::warn!("reuse buffer {} on port {}: {}", buffer_id, port_id, e);
                }
            }
            ControlMessage::AddPort { seq, .. } => {
                tracing::warn!("add port not supported");
                self.done(seq, Err(Error::NotSupported("add port".into())));
            }
            ControlMessage::RemovePort { seq, .. } => {
                tracing::warn!("remove port not supported");
                self.done(seq, Err(Error::NotSupported("remove port".into())));
            }
            ControlMessage::SetParam { seq, .. } => {
                tracing::warn!("set param not supported");
                self.done(seq, Err(Error::NotSupported("set param".into())));
            }
            ControlMessage::Update { .. }
            | ControlMessage::PortUpdate { .. }
            | ControlMessage::PortParam { .. }
            | ControlMessage::Done { .. }
            | ControlMessage::SetActive { .. } => {
                return Err(Error::Protocol(format!("unexpected {} from driver", name)));
            }
        }
        Ok(())
    }

    /// Forward events from the data loop. Returns how many were handled.
    pub fn dispatch_events(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(Some(event)) = self.events.try_recv() {
            handled += 1;
            match event {
                NodeEvent::Result { seq, result } => {
                    let targets: Vec<PendingEnum> = self.sync.matching(seq).copied().collect();
                    if targets.is_empty() {
                        tracing::trace!("result for unknown seq {}", seq);
                    }
                    for target in targets {
                        self.send(ControlMessage::PortParam {
                            seq: target.seq,
                            direction: result.direction,
                            port_id: result.port_id,
                            param: result.param.clone(),
                        });
                    }
                }
                NodeEvent::Done { seq, res } => {
                    for target in self.sync.complete(seq) {
                        tracing::trace!(
                            "enum {} on {} port {} complete",
                            target.seq,
                            target.direction,
                            target.port_id
                        );
                        self.send(ControlMessage::Done {
                            seq: target.seq,
                            res,
                        });
                    }
                }
                NodeEvent::TransportLost {
                    node_id,
                    generation,
                } => {
                    if generation != self.transport_generation {
                        tracing::debug!(
                            "node {}: ignoring loss of superseded transport {}",
                            node_id,
                            generation
                        );
                        continue;
                    }
                    tracing::warn!("node {}: transport lost, node unavailable", node_id);
                    self.available = false;
                }
            }
        }
        handled
    }

    /// Export, then handle messages from `socket` until the driver hangs up.
    pub fn serve(
        &mut self,
        socket: &mut ControlSocket,
        outbox: &kanal::Receiver<ControlMessage>,
    ) -> Result<()> {
        self.export()?;
        Self::flush(socket, outbox)?;

        while let Some(Received { message, fds }) = socket.recv()? {
            if let Err(e) = self.handle(message, fds) {
                tracing::warn!("dropping message: {}", e);
            }
            self.dispatch_events();
            Self::flush(socket, outbox)?;
        }
        tracing::debug!("driver closed the control socket");
        Ok(())
    }

    /// Send every queued outgoing message on `socket`.
    pub fn flush(socket: &mut ControlSocket, outbox: &kanal::Receiver<ControlMessage>) -> Result<()> {
        while let Ok(Some(message)) = outbox.try_recv() {
            socket.send(&message, &[])?;
        }
        Ok(())
    }

    /// Tear the node down: cancel pending replies, clear every mix, drop the
    /// transport, stop the data loop and release all memory.
    ///
    /// Runs once; later calls do nothing.
    pub fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;
        tracing::debug!("destroy node {:?}", self.remote_id);

        self.sync.cancel_all();

        for key in self.mixes.keys() {
            self.clear_mix(key);
        }

        let kinds: Vec<IoKind> = self.node_io.keys().copied().collect();
        for kind in kinds {
            if let Err(e) = self.call(move |state| state.node_mut().set_io(kind, None)) {
                tracing::trace!("clear node io {:?}: {}", kind, e);
            }
            if let Some(binding) = self.node_io.remove(&kind) {
                binding.release(&mut self.registry);
            }
        }

        if let Err(e) = self.data_loop.invoke(RtState::clear_transport) {
            tracing::trace!("clear transport: {}", e);
        }
        self.data_loop.stop();
        self.registry.purge();
        self.available = false;
    }

    fn send(&self, message: ControlMessage) {
        if self.outbox.send(message).is_err() {
            tracing::trace!("outbox closed, message dropped");
        }
    }

    fn done(&self, seq: u32, res: Result<()>) {
        let res = match res {
            Ok(()) => 0,
            Err(e) => {
                tracing::warn!("request {} failed: {}", seq, e);
                e.errno()
            }
        };
        self.send(ControlMessage::Done { seq, res });
    }

    fn call<R, F>(&self, f: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut RtState) -> Result<R> + Send + 'static,
    {
        self.data_loop.invoke(f)?
    }

    fn refresh_ports(&mut self) -> Result<()> {
        let ports = self.data_loop.invoke(|state| {
            let node = state.node();
            node.ports()
                .into_iter()
                .map(|(direction, port_id, info)| {
                    (direction, port_id, info, node.port_params(direction, port_id))
                })
                .collect::<Vec<_>>()
        })?;

        self.ports.clear();
        for (direction, port_id, info, params) in ports {
            let mut port = Port::new(direction, port_id, info);
            port.set_params(params);
            self.ports.insert((direction, port_id), port);
        }
        Ok(())
    }

    fn check_port(&self, direction: Direction, port_id: u32) -> Result<()> {
        if self.ports.contains_key(&(direction, port_id)) {
            Ok(())
        } else {
            Err(Error::UnknownPort { direction, port_id })
        }
    }

    fn add_memory(&mut self, mem_id: u32, kind: u32, fd: OwnedFd, flags: u32) -> Result<()> {
        tracing::debug!("add memory {} type {} flags {:#x}", mem_id, kind, flags);
        self.registry
            .register(mem_id, MemoryKind::from_raw(kind), fd, flags)
    }

    fn set_transport(&mut self, node_id: u32, read: OwnedFd, write: OwnedFd) -> Result<()> {
        let channel = TransportChannel::new(node_id, read, write);
        self.transport_generation = self
            .data_loop
            .invoke(move |state| state.set_transport(channel))?;
        self.remote_id = Some(node_id);
        self.available = true;

        if self.active {
            self.send(ControlMessage::SetActive { active: true });
        }
        Ok(())
    }

    fn bind_io(&mut self, mem_id: u32, offset: u32, size: u32) -> Result<Option<IoBinding>> {
        if mem_id == INVALID_ID {
            return Ok(None);
        }
        let handle = self
            .registry
            .acquire(mem_id)
            .ok_or(Error::UnknownMemory(mem_id))?;
        match self.registry.map(
            &handle,
            u64::from(offset),
            size as usize,
            ProtFlags::READ | ProtFlags::WRITE,
        ) {
            Ok(range) => Ok(Some(IoBinding::new(handle, range))),
            Err(e) => {
                self.registry.release(handle);
                Err(e)
            }
        }
    }

    fn set_io(&mut self, kind: IoKind, mem_id: u32, offset: u32, size: u32) -> Result<()> {
        let binding = self.bind_io(mem_id, offset, size)?;
        let area = binding.as_ref().map(|b| b.range().clone());

        if let Err(e) = self.call(move |state| state.node_mut().set_io(kind, area)) {
            if let Some(binding) = binding {
                binding.release(&mut self.registry);
            }
            return Err(e);
        }

        let old = match binding {
            Some(binding) => self.node_io.insert(kind, binding),
            None => self.node_io.remove(&kind),
        };
        if let Some(old) = old {
            tracing::debug!("release node io {:?} (mem {})", kind, old.region_id());
            old.release(&mut self.registry);
        }
        Ok(())
    }

    fn port_set_io(
        &mut self,
        key: MixKey,
        kind: IoKind,
        mem_id: u32,
        offset: u32,
        size: u32,
    ) -> Result<()> {
        self.check_port(key.direction, key.port_id)?;
        self.mixes.ensure(key)?;

        let binding = self.bind_io(mem_id, offset, size)?;
        if kind == IoKind::Buffers {
            return self.set_buffers_io(key, binding);
        }

        let area = binding.as_ref().map(|b| b.range().clone());
        if let Err(e) = self.call(move |state| state.node_mut().port_set_io(key, kind, area)) {
            if let Some(binding) = binding {
                binding.release(&mut self.registry);
            }
            return Err(e);
        }
        self.replace_io(key, kind, binding)
    }

    fn set_buffers_io(&mut self, key: MixKey, binding: Option<IoBinding>) -> Result<()> {
        let io = match binding.as_ref().map(|b| IoBuffers::new(b.range().clone())) {
            Some(Err(e)) => {
                if let Some(binding) = binding {
                    binding.release(&mut self.registry);
                }
                return Err(e);
            }
            Some(Ok(io)) => Some(io),
            None => None,
        };

        // The data loop must stop using the old area before it is released.
        if let Err(e) = self.deactivate(key) {
            if let Some(binding) = binding {
                binding.release(&mut self.registry);
            }
            return Err(e);
        }
        self.replace_io(key, IoKind::Buffers, binding)?;

        match io {
            Some(io) => self.activate(key, io),
            None => Ok(()),
        }
    }

    fn replace_io(&mut self, key: MixKey, kind: IoKind, binding: Option<IoBinding>) -> Result<()> {
        let Some(mix) = self.mixes.find_mut(&key) else {
            if let Some(binding) = binding {
                binding.release(&mut self.registry);
            }
            return Err(Error::UnknownMix {
                direction: key.direction,
                port_id: key.port_id,
                mix_id: key.mix_id,
            });
        };
        if let Some(old) = mix.set_io(kind, binding) {
            tracing::debug!("mix {}: release io {:?} (mem {})", key, kind, old.region_id());
            old.release(&mut self.registry);
        }
        Ok(())
    }

    fn activate(&mut self, key: MixKey, io: IoBuffers) -> Result<()> {
        self.data_loop.post(move |state| state.add_mix(key, io))?;
        if let Some(mix) = self.mixes.find_mut(&key) {
            mix.set_state(MixState::Active);
        }
        Ok(())
    }

    fn deactivate(&mut self, key: MixKey) -> Result<()> {
        if self.mixes.state(&key) != MixState::Active {
            return Ok(());
        }
        self.data_loop.invoke(move |state| state.remove_mix(&key))?;
        if let Some(mix) = self.mixes.find_mut(&key) {
            mix.set_state(MixState::Inactive);
        }
        Ok(())
    }

    fn port_use_buffers(&mut self, key: MixKey, wires: &[WireBufferRef]) -> Result<()> {
        self.check_port(key.direction, key.port_id)?;
        if wires.len() > self.config.max_buffers {
            return Err(Error::InvalidArgument(format!(
                "{} buffers, at most {}",
                wires.len(),
                self.config.max_buffers
            )));
        }
        self.mixes.ensure(key)?;
        self.clear_buffers(key);
        if wires.is_empty() {
            return Ok(());
        }

        let buffers = BufferBuilder::new(&mut self.registry, key)
            .with_lock_memory(self.config.lock_memory)
            .build_all(wires)?;
        let refs: Vec<_> = buffers.iter().map(Buffer::to_ref).collect();
        tracing::debug!("mix {}: use {} buffers", key, buffers.len());

        if let Some(mix) = self.mixes.find_mut(&key) {
            for old in mix.replace_buffers(buffers) {
                old.release(&mut self.registry);
            }
        }

        if let Err(e) = self.call(move |state| state.node_mut().port_use_buffers(key, &refs)) {
            if let Some(mix) = self.mixes.find_mut(&key) {
                mix.clear_buffers(&mut self.registry);
            }
            return Err(e);
        }
        Ok(())
    }

    fn clear_buffers(&mut self, key: MixKey) {
        let has_buffers = self
            .mixes
            .find(&key)
            .is_some_and(|mix| !mix.buffers().is_empty());
        if !has_buffers {
            return;
        }

        if let Err(e) = self.call(move |state| state.node_mut().port_use_buffers(key, &[])) {
            tracing::warn!("mix {}: node failed to drop buffers: {}", key, e);
        }
        if let Some(mix) = self.mixes.find_mut(&key) {
            mix.clear_buffers(&mut self.registry);
        }
    }

    fn clear_mix(&mut self, key: MixKey) {
        if let Err(e) = self.deactivate(key) {
            tracing::trace!("mix {}: deactivate: {}", key, e);
        }
        self.clear_buffers(key);
        if let Some(mix) = self.mixes.remove(&key) {
            mix.release(&mut self.registry);
        }
    }

    /// Return the slot of a mix left with no buffers and no I/O areas.
    fn release_unused_mix(&mut self, key: MixKey) {
        if self.mixes.find(&key).is_some_and(Mix::is_unused) {
            tracing::debug!("mix {}: unused, slot returned", key);
            self.clear_mix(key);
        }
    }

    fn port_set_param(&mut self, direction: Direction, port_id: u32, param: Param) -> Result<()> {
        self.check_port(direction, port_id)?;

        if param.id == param_id::FORMAT {
            for key in self.mixes.keys_on(direction, port_id) {
                self.clear_buffers(key);
                self.release_unused_mix(key);
            }
        }

        let node_param = param.clone();
        self.call(move |state| {
            state
                .node_mut()
                .port_set_param(direction, port_id, &node_param)
        })?;
        let info = self
            .data_loop
            .invoke(move |state| state.node().port_info(direction, port_id))?;

        let port = self
            .ports
            .get_mut(&(direction, port_id))
            .ok_or(Error::UnknownPort { direction, port_id })?;
        if let Some(info) = info {
            port.set_info(info);
        }
        port.set_param(param);

        let update = ControlMessage::PortUpdate {
            direction,
            port_id,
            params: port.params().to_vec(),
            info: Some(port.exported_info()),
        };
        self.send(update);
        Ok(())
    }

    fn command(&mut self, command: Command) -> Result<()> {
        match command {
            Command::Pause => {
                tracing::debug!("pause");
                self.data_loop
                    .invoke(|state| state.set_process_enabled(false))?;
                self.call(move |state| state.node_mut().send_command(command))
            }
            Command::Start => {
                tracing::debug!("start");
                self.call(move |state| state.node_mut().send_command(command))?;
                self.data_loop
                    .invoke(|state| state.set_process_enabled(true))
            }
            Command::Other(id) => {
                tracing::warn!("unhandled node command {}", id);
                Err(Error::NotSupported(format!("command {}", id)))
            }
        }
    }

    /// Returns true when the enumeration completed synchronously.
    fn port_enum_params(
        &mut self,
        seq: u32,
        direction: Direction,
        port_id: u32,
        id: u32,
        start: u32,
        num: u32,
    ) -> Result<bool> {
        self.check_port(direction, port_id)?;

        let outcome = self.call(move |state| {
            let (node, emitter) = state.split();
            node.port_enum_params(direction, port_id, id, start, num, emitter)
        })?;

        match outcome {
            EnumParams::Ready(params) => {
                for param in params {
                    self.send(ControlMessage::PortParam {
                        seq,
                        direction,
                        port_id,
                        param,
                    });
                }
                Ok(true)
            }
            EnumParams::Pending(async_seq) => {
                let end = self.call(move |state| {
                    let (node, emitter) = state.split();
                    node.sync(async_seq, emitter)
                })?;
                self.sync.register(
                    async_seq,
                    end,
                    PendingEnum {
                        seq,
                        direction,
                        port_id,
                    },
                );
                Ok(false)
            }
        }
    }
}

impl Drop for RemoteNode {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{MetaType, WireBuffer, WireData, WireMeta};
    use crate::config::RtConfig;
    use crate::memory::MemFd;
    use crate::node::BufferSource;
    use crate::transport::EventFd;

    const KEY: MixKey = MixKey::new(Direction::Output, 0, 0);

    fn node_with(source: BufferSource) -> (RemoteNode, kanal::Receiver<ControlMessage>) {
        let config = NodeConfig::default()
            .with_max_mixes(2)
            .with_lock_memory(false)
            .with_rt(RtConfig::default().with_name("test-remote"));
        RemoteNode::new(config, source).unwrap()
    }

    fn drain(outbox: &kanal::Receiver<ControlMessage>) -> Vec<ControlMessage> {
        let mut messages = Vec::new();
        while let Ok(Some(message)) = outbox.try_recv() {
            messages.push(message);
        }
        messages
    }

    fn add_memory(node: &mut RemoteNode, memfd: &MemFd, mem_id: u32) {
        node.handle(
            ControlMessage::AddMemory {
                mem_id,
                kind: MemoryKind::MemFd.as_raw(),
                flags: 3,
            },
            vec![memfd.try_clone_fd().unwrap()],
        )
        .unwrap();
    }

    fn wire(offset: u32) -> WireBufferRef {
        WireBufferRef {
            mem_id: 0,
            offset,
            size: 4096,
            buffer: WireBuffer::new()
                .with_meta(WireMeta::new(MetaType::Header))
                .with_data(WireData::mem_ptr(256, 512)),
        }
    }

    #[test]
    fn test_export_sequence() {
        let source = BufferSource::new()
            .with_port_flags(crate::port::PortFlags::CAN_ALLOC_BUFFERS | crate::port::PortFlags::LIVE);
        let (mut node, outbox) = node_with(source);
        node.export().unwrap();

        let messages = drain(&outbox);
        assert_eq!(messages.len(), 3);
        assert!(matches!(
            messages[0],
            ControlMessage::Update {
                max_input_ports: 0,
                max_output_ports: 1,
                ..
            }
        ));
        match &messages[1] {
            ControlMessage::PortUpdate { info: Some(info), .. } => {
                assert!(!info.flags.contains(crate::port::PortFlags::CAN_ALLOC_BUFFERS));
                assert!(info.flags.contains(crate::port::PortFlags::LIVE));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(messages[2], ControlMessage::Done { seq: 0, res: 0 });
    }

    #[test]
    fn test_wrong_fd_count_is_protocol_error() {
        let (mut node, _outbox) = node_with(BufferSource::new());
        let err = node
            .handle(ControlMessage::Transport { node_id: 1 }, Vec::new())
            .unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
        let err = node
            .handle(ControlMessage::Done { seq: 1, res: 0 }, Vec::new())
            .unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn test_duplicate_memory_ignored() {
        let (mut node, _outbox) = node_with(BufferSource::new());
        let memfd = MemFd::new("test-remote-dup", 4096).unwrap();
        add_memory(&mut node, &memfd, 0);
        add_memory(&mut node, &memfd, 0);
        assert_eq!(node.registry().len(), 1);
        assert!(node.registry().contains(0));
        assert_eq!(node.registry().stats().closes, 0);
    }

    #[test]
    fn test_use_buffers_on_unknown_port() {
        let (mut node, outbox) = node_with(BufferSource::new());
        node.handle(
            ControlMessage::PortUseBuffers {
                seq: 5,
                direction: Direction::Input,
                port_id: 0,
                mix_id: 0,
                buffers: vec![wire(0)],
            },
            Vec::new(),
        )
        .unwrap();
        assert_eq!(
            drain(&outbox),
            vec![ControlMessage::Done {
                seq: 5,
                res: -libc::EINVAL
            }]
        );
        assert!(node.mixes().is_empty());
    }

    #[test]
    fn test_format_then_buffers_then_clear() {
        let (mut node, outbox) = node_with(BufferSource::new());
        let memfd = MemFd::new("test-remote-bufs", 16384).unwrap();
        add_memory(&mut node, &memfd, 0);

        node.handle(
            ControlMessage::PortSetParam {
                seq: 1,
                direction: Direction::Output,
                port_id: 0,
                param: Param::new(param_id::FORMAT, vec![1, 2, 3]),
            },
            Vec::new(),
        )
        .unwrap();
        let messages = drain(&outbox);
        assert!(matches!(&messages[0], ControlMessage::PortUpdate { params, .. } if params.len() == 1));
        assert_eq!(messages[1], ControlMessage::Done { seq: 1, res: 0 });

        node.handle(
            ControlMessage::PortUseBuffers {
                seq: 2,
                direction: Direction::Output,
                port_id: 0,
                mix_id: 0,
                buffers: vec![wire(0), wire(4096)],
            },
            Vec::new(),
        )
        .unwrap();
        assert_eq!(drain(&outbox), vec![ControlMessage::Done { seq: 2, res: 0 }]);
        assert_eq!(node.registry().ref_count(0), Some(2));

        // A new format drops the buffers of every mix on the port
        node.handle(
            ControlMessage::PortSetParam {
                seq: 3,
                direction: Direction::Output,
                port_id: 0,
                param: Param::new(param_id::FORMAT, vec![4]),
            },
            Vec::new(),
        )
        .unwrap();
        assert!(node.mixes().find(&KEY).is_none());
        assert!(!node.registry().contains(0));
        assert_eq!(node.registry().stats().closes, 1);
    }

    #[test]
    fn test_command_replies() {
        let (mut node, outbox) = node_with(BufferSource::new());
        node.handle(
            ControlMessage::Command {
                seq: 1,
                command: Command::Start,
            },
            Vec::new(),
        )
        .unwrap();
        node.handle(
            ControlMessage::Command {
                seq: 2,
                command: Command::Other(7),
            },
            Vec::new(),
        )
        .unwrap();
        assert_eq!(
            drain(&outbox),
            vec![
                // No format yet
                ControlMessage::Done {
                    seq: 1,
                    res: -libc::EINVAL
                },
                ControlMessage::Done {
                    seq: 2,
                    res: -libc::ENOTSUP
                },
            ]
        );
    }

    #[test]
    fn test_async_enum_fires_once() {
        let source = BufferSource::new()
            .with_param(Param::new(param_id::ENUM_FORMAT, vec![1]))
            .with_param(Param::new(param_id::ENUM_FORMAT, vec![2]))
            .with_async_params(true);
        let (mut node, outbox) = node_with(source);

        node.handle(
            ControlMessage::PortEnumParams {
                seq: 9,
                direction: Direction::Output,
                port_id: 0,
                id: param_id::ENUM_FORMAT,
                start: 0,
                num: 0,
            },
            Vec::new(),
        )
        .unwrap();
        assert!(drain(&outbox).is_empty());
        assert_eq!(node.pending_syncs(), 1);

        assert_eq!(node.dispatch_events(), 3);
        let messages = drain(&outbox);
        assert_eq!(messages.len(), 3);
        assert!(matches!(messages[0], ControlMessage::PortParam { seq: 9, .. }));
        assert!(matches!(messages[1], ControlMessage::PortParam { seq: 9, .. }));
        assert_eq!(messages[2], ControlMessage::Done { seq: 9, res: 0 });
        assert_eq!(node.pending_syncs(), 0);

        assert_eq!(node.dispatch_events(), 0);
    }

    #[test]
    fn test_transport_resends_set_active() {
        let (mut node, outbox) = node_with(BufferSource::new());
        node.set_active(true);
        drain(&outbox);

        let to_node = EventFd::new().unwrap();
        let from_node = EventFd::new().unwrap();
        node.handle(
            ControlMessage::Transport { node_id: 4 },
            vec![to_node.try_clone_fd().unwrap(), from_node.try_clone_fd().unwrap()],
        )
        .unwrap();
        assert_eq!(drain(&outbox), vec![ControlMessage::SetActive { active: true }]);
        assert_eq!(node.remote_id(), Some(4));
        assert!(node.is_available());
    }

    #[test]
    fn test_unsupported_port_ops() {
        let (mut node, outbox) = node_with(BufferSource::new());
        node.handle(
            ControlMessage::AddPort {
                seq: 3,
                direction: Direction::Input,
                port_id: 1,
            },
            Vec::new(),
        )
        .unwrap();
        assert_eq!(
            drain(&outbox),
            vec![ControlMessage::Done {
                seq: 3,
                res: -libc::ENOTSUP
            }]
        );
    }

    #[test]
    fn test_destroy_is_idempotent() {
        let (mut node, _outbox) = node_with(BufferSource::new());
        let memfd = MemFd::new("test-remote-destroy", 4096).unwrap();
        add_memory(&mut node, &memfd, 0);
        node.destroy();
        node.destroy();
        assert!(node.registry().is_empty());
        assert!(!node.data_loop().is_running());
        assert!(matches!(
            node.handle(ControlMessage::Transport { node_id: 1 }, Vec::new()),
            Err(Error::LoopStopped)
        ));
    }
}
