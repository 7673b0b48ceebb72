//! The realtime data loop of an exported node.
//!
//! One thread owns the node implementation, the set of active mixes and the
//! transport channel. It sleeps in `poll(2)` on a wake eventfd and the
//! transport's read side. The control context reaches it only through
//! [`DataLoop::invoke`] (run a closure and wait for its result) and
//! [`DataLoop::post`] (fire and forget); both run between cycles, never
//! during `process`.
//!
//! # Example
//!
//! ```rust,ignore
//! use parallax_remote::rt::DataLoop;
//!
//! let (tx, rx) = kanal::unbounded();
//! let data_loop = DataLoop::spawn(&RtConfig::default(), Box::new(node), tx)?;
//! let ports = data_loop.invoke(|state| state.node().ports())?;
//! ```

use crate::config::RtConfig;
use crate::error::{Error, Result};
use crate::node::{Emitter, NodeEvent, NodeImpl, ProcessContext, ProcessStatus};
use crate::port::{IoBuffers, MixKey};
use crate::transport::{Condition, EventFd, TransportChannel};
use rustix::event::{PollFd, PollFlags};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

type Task = Box<dyn FnOnce(&mut RtState) + Send>;

/// A mix scheduled on the data loop.
#[derive(Debug, Clone)]
pub struct ActiveMix {
    /// The mix.
    pub key: MixKey,
    /// Its buffers I/O area.
    pub io: IoBuffers,
}

/// Everything the data loop owns.
///
/// Only reachable from closures run by [`DataLoop::invoke`]/[`DataLoop::post`].
pub struct RtState {
    node: Box<dyn NodeImpl>,
    emitter: Emitter,
    mixes: Vec<ActiveMix>,
    transport: Option<TransportChannel>,
    generation: u64,
    cycles: u64,
}

impl RtState {
    fn new(node: Box<dyn NodeImpl>, emitter: Emitter) -> Self {
        Self {
            node,
            emitter,
            mixes: Vec::new(),
            transport: None,
            generation: 0,
            cycles: 0,
        }
    }

    /// The node implementation.
    pub fn node(&self) -> &dyn NodeImpl {
        self.node.as_ref()
    }

    /// The node implementation, mutably.
    pub fn node_mut(&mut self) -> &mut dyn NodeImpl {
        self.node.as_mut()
    }

    /// The node implementation together with the event emitter.
    pub fn split(&mut self) -> (&mut dyn NodeImpl, &Emitter) {
        (self.node.as_mut(), &self.emitter)
    }

    /// Schedule a mix. Replaces the I/O area if it is already active.
    pub fn add_mix(&mut self, key: MixKey, io: IoBuffers) {
        match self.mixes.iter_mut().find(|m| m.key == key) {
            Some(mix) => mix.io = io,
            None => self.mixes.push(ActiveMix { key, io }),
        }
        tracing::debug!("mix {}: activated ({} active)", key, self.mixes.len());
    }

    /// Unschedule a mix. Returns false if it was not active.
    pub fn remove_mix(&mut self, key: &MixKey) -> bool {
        let before = self.mixes.len();
        self.mixes.retain(|m| m.key != *key);
        let removed = self.mixes.len() != before;
        if removed {
            tracing::debug!("mix {}: deactivated ({} active)", key, self.mixes.len());
        }
        removed
    }

    /// Currently scheduled mixes.
    pub fn active_mixes(&self) -> &[ActiveMix] {
        &self.mixes
    }

    /// Install a transport, tearing down the previous one.
    ///
    /// Returns the generation stamped on loss events of the new transport.
    pub fn set_transport(&mut self, channel: TransportChannel) -> u64 {
        self.clear_transport();
        self.transport = Some(channel);
        self.generation += 1;
        self.generation
    }

    /// Generation of the current transport, 0 before the first one.
    pub fn transport_generation(&self) -> u64 {
        self.generation
    }

    /// Tear down and drop the transport.
    pub fn clear_transport(&mut self) {
        if let Some(mut old) = self.transport.take() {
            old.teardown();
        }
    }

    /// The transport, also after it was torn down by a hangup.
    pub fn transport(&self) -> Option<&TransportChannel> {
        self.transport.as_ref()
    }

    /// Start or stop reacting to driver wake-ups.
    pub fn set_process_enabled(&mut self, enabled: bool) {
        if let Some(transport) = &mut self.transport {
            transport.set_process_enabled(enabled);
        }
    }

    /// Number of cycles run so far.
    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    /// React to `mask` reported on the transport.
    pub fn transport_condition(&mut self, mask: PollFlags) {
        let Some(transport) = &mut self.transport else {
            return;
        };
        match transport.handle_condition(mask) {
            Condition::Process => {
                self.run_cycle();
            }
            Condition::Lost => {
                let node_id = transport.node_id();
                self.emitter.emit(NodeEvent::TransportLost {
                    node_id,
                    generation: self.generation,
                });
            }
            Condition::Ignored => {}
        }
    }

    /// Run one processing cycle and signal the driver if output was
    /// published.
    pub fn run_cycle(&mut self) -> ProcessStatus {
        self.cycles += 1;
        let ctx = ProcessContext::new(&self.mixes, self.cycles);
        let status = self.node.process(&ctx);

        if status.contains(ProcessStatus::HAVE_BUFFER) {
            if let Some(transport) = &self.transport {
                if let Err(e) = transport.signal() {
                    tracing::trace!("cycle {}: signal failed: {}", self.cycles, e);
                }
            }
        }
        status
    }
}

/// Handle to the data loop thread.
pub struct DataLoop {
    tasks: kanal::Sender<Task>,
    wake: Arc<EventFd>,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl DataLoop {
    /// Spawn the data loop owning `node`. Node events go to `events`.
    pub fn spawn(
        config: &RtConfig,
        node: Box<dyn NodeImpl>,
        events: kanal::Sender<NodeEvent>,
    ) -> Result<Self> {
        let (tasks, task_rx) = kanal::bounded::<Task>(config.queue_capacity.max(1));
        let wake = Arc::new(EventFd::new()?);
        let stop = Arc::new(AtomicBool::new(false));

        let thread_wake = Arc::clone(&wake);
        let thread_stop = Arc::clone(&stop);
        let config = config.clone();
        let mut state = RtState::new(node, Emitter::new(events));

        let thread = std::thread::Builder::new()
            .name(config.name.clone())
            .spawn(move || {
                if let Err(e) = apply_rt_priority(&config) {
                    tracing::warn!("data loop '{}': keeping default scheduling: {}", config.name, e);
                }
                let name = &config.name;
                tracing::debug!("data loop '{}' started", name);
                run(&mut state, &task_rx, &thread_wake, &thread_stop);
                // Drops queued tasks, so pending invokes see LoopStopped
                task_rx.close();
                state.clear_transport();
                tracing::debug!("data loop '{}' stopped after {} cycles", name, state.cycles);
            })?;

        Ok(Self {
            tasks,
            wake,
            stop,
            thread: Some(thread),
        })
    }

    /// Run `f` on the data loop and wait for its result.
    ///
    /// Must not be called from the data loop itself.
    pub fn invoke<R, F>(&self, f: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut RtState) -> R + Send + 'static,
    {
        let (tx, rx) = kanal::bounded(1);
        self.post(move |state| {
            let _ = tx.send(f(state));
        })?;
        rx.recv().map_err(|_| Error::LoopStopped)
    }

    /// Queue `f` on the data loop without waiting.
    pub fn post<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut RtState) + Send + 'static,
    {
        if self.stop.load(Ordering::Acquire) {
            return Err(Error::LoopStopped);
        }
        self.tasks
            .send(Box::new(f))
            .map_err(|_| Error::LoopStopped)?;
        self.wake.notify()
    }

    /// True while the thread runs.
    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Stop the thread and wait for it. Queued tasks are dropped.
    pub fn stop(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        self.stop.store(true, Ordering::Release);
        if let Err(e) = self.wake.notify() {
            tracing::error!("failed to wake data loop: {}", e);
        }
        if thread.join().is_err() {
            tracing::error!("data loop panicked");
        }
    }
}

impl Drop for DataLoop {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(state: &mut RtState, tasks: &kanal::Receiver<Task>, wake: &EventFd, stop: &AtomicBool) {
    while !stop.load(Ordering::Acquire) {
        while let Ok(Some(task)) = tasks.try_recv() {
            task(state);
        }

        let (wake_events, transport_events) = {
            let transport_fd = state.transport.as_ref().and_then(TransportChannel::poll_fd);
            let has_transport = transport_fd.is_some();
            let mut fds = Vec::with_capacity(2);
            fds.push(PollFd::new(wake, PollFlags::IN));
            fds.extend(transport_fd);

            match rustix::event::poll(&mut fds, None) {
                Ok(_) => {}
                Err(rustix::io::Errno::INTR) => continue,
                Err(e) => {
                    tracing::error!("data loop poll failed: {}", e);
                    break;
                }
            }
            let transport_events = if has_transport {
                fds[1].revents()
            } else {
                PollFlags::empty()
            };
            (fds[0].revents(), transport_events)
        };

        if wake_events.contains(PollFlags::IN) {
            if let Err(e) = wake.read_token() {
                tracing::warn!("failed to drain data loop wake: {}", e);
            }
        }
        if !transport_events.is_empty() {
            state.transport_condition(transport_events);
        }
    }
}

/// Move the calling thread to `SCHED_FIFO` at the configured priority.
fn apply_rt_priority(config: &RtConfig) -> Result<()> {
    let Some(priority) = config.rt_priority else {
        return Ok(());
    };

    // SAFETY: pure queries, no memory is passed.
    let (min, max) = unsafe {
        (
            libc::sched_get_priority_min(libc::SCHED_FIFO),
            libc::sched_get_priority_max(libc::SCHED_FIFO),
        )
    };
    if !(min..=max).contains(&priority) {
        return Err(Error::InvalidArgument(format!(
            "priority {} outside SCHED_FIFO range {}..={}",
            priority, min, max
        )));
    }

    let param = libc::sched_param {
        sched_priority: priority,
    };
    // SAFETY: pid 0 is the calling thread and `param` outlives the call.
    if unsafe { libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) } == -1 {
        let errno = std::io::Error::last_os_error()
            .raw_os_error()
            .unwrap_or(libc::EPERM);
        return Err(Error::System(rustix::io::Errno::from_raw_os_error(errno)));
    }
    tracing::debug!("data loop '{}': SCHED_FIFO priority {}", config.name, priority);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferRef;
    use crate::memory::{MemFd, MemoryKind, ProtFlags, RegionRegistry};
    use crate::node::EnumParams;
    use crate::port::{Direction, Param, PortInfo};
    use crate::transport::Command;
    use std::sync::atomic::AtomicU64;

    struct Counter {
        processed: Arc<AtomicU64>,
        status: ProcessStatus,
    }

    impl NodeImpl for Counter {
        fn ports(&self) -> Vec<(Direction, u32, PortInfo)> {
            vec![(Direction::Output, 0, PortInfo::default())]
        }

        fn port_enum_params(
            &mut self,
            _direction: Direction,
            _port_id: u32,
            _id: u32,
            _start: u32,
            _num: u32,
            _emitter: &Emitter,
        ) -> Result<EnumParams> {
            Ok(EnumParams::Ready(Vec::new()))
        }

        fn port_set_param(&mut self, _: Direction, _: u32, _: &Param) -> Result<()> {
            Ok(())
        }

        fn port_use_buffers(&mut self, _: MixKey, _: &[BufferRef]) -> Result<()> {
            Ok(())
        }

        fn send_command(&mut self, _: Command) -> Result<()> {
            Ok(())
        }

        fn process(&mut self, ctx: &ProcessContext<'_>) -> ProcessStatus {
            self.processed.store(ctx.cycle(), Ordering::Release);
            self.status
        }
    }

    fn spawn(status: ProcessStatus) -> (DataLoop, kanal::Receiver<NodeEvent>, Arc<AtomicU64>) {
        let processed = Arc::new(AtomicU64::new(0));
        let (tx, rx) = kanal::unbounded();
        let node = Counter {
            processed: Arc::clone(&processed),
            status,
        };
        let data_loop =
            DataLoop::spawn(&RtConfig::default().with_name("test-rt"), Box::new(node), tx).unwrap();
        (data_loop, rx, processed)
    }

    fn wait_for(mut cond: impl FnMut() -> bool) {
        for _ in 0..500 {
            if cond() {
                return;
            }
            std::thread::sleep(std::time::Duration::from_millis(2));
        }
        panic!("condition not reached");
    }

    #[test]
    fn test_invoke_returns_result() {
        let (data_loop, _rx, _) = spawn(ProcessStatus::OK);
        let ports = data_loop.invoke(|state| state.node().ports().len()).unwrap();
        assert_eq!(ports, 1);
        assert!(data_loop.is_running());
    }

    #[test]
    fn test_post_runs_in_order() {
        let (data_loop, _rx, _) = spawn(ProcessStatus::OK);
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        for i in 0..10 {
            let seen = Arc::clone(&seen);
            data_loop.post(move |_| seen.lock().unwrap().push(i)).unwrap();
        }
        data_loop.invoke(|_| ()).unwrap();
        assert_eq!(*seen.lock().unwrap(), (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_stopped_loop_rejects_invoke() {
        let (mut data_loop, _rx, _) = spawn(ProcessStatus::OK);
        data_loop.stop();
        assert!(!data_loop.is_running());
        assert!(matches!(data_loop.invoke(|_| ()), Err(Error::LoopStopped)));
    }

    #[test]
    fn test_wake_token_runs_cycle_and_signals() {
        let (data_loop, _rx, processed) = spawn(ProcessStatus::HAVE_BUFFER);
        let to_node = EventFd::new().unwrap();
        let from_node = EventFd::new().unwrap();
        let channel = TransportChannel::new(
            3,
            to_node.try_clone_fd().unwrap(),
            from_node.try_clone_fd().unwrap(),
        );
        data_loop
            .invoke(move |state| {
                state.set_transport(channel);
                state.set_process_enabled(true);
            })
            .unwrap();

        to_node.notify().unwrap();
        wait_for(|| processed.load(Ordering::Acquire) == 1);
        wait_for(|| from_node.try_wait().unwrap());
    }

    #[test]
    fn test_no_cycle_until_enabled() {
        let (data_loop, _rx, processed) = spawn(ProcessStatus::OK);
        let to_node = EventFd::new().unwrap();
        let from_node = EventFd::new().unwrap();
        let channel = TransportChannel::new(
            3,
            to_node.try_clone_fd().unwrap(),
            from_node.try_clone_fd().unwrap(),
        );
        data_loop.invoke(move |state| state.set_transport(channel)).unwrap();

        to_node.notify().unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert_eq!(processed.load(Ordering::Acquire), 0);

        data_loop.invoke(|state| state.set_process_enabled(true)).unwrap();
        wait_for(|| processed.load(Ordering::Acquire) == 1);
    }

    #[test]
    fn test_hangup_reported_once() {
        let (data_loop, rx, _) = spawn(ProcessStatus::OK);
        let to_node = EventFd::new().unwrap();
        let from_node = EventFd::new().unwrap();
        let channel = TransportChannel::new(
            9,
            to_node.try_clone_fd().unwrap(),
            from_node.try_clone_fd().unwrap(),
        );
        let teardowns = data_loop
            .invoke(move |state| {
                state.set_transport(channel);
                state.transport_condition(PollFlags::HUP);
                state.transport_condition(PollFlags::HUP);
                state.transport().map(TransportChannel::teardown_count)
            })
            .unwrap();
        assert_eq!(teardowns, Some(1));

        assert_eq!(
            rx.recv().unwrap(),
            NodeEvent::TransportLost {
                node_id: 9,
                generation: 1
            }
        );
        assert!(rx.try_recv().unwrap().is_none());
    }

    #[test]
    fn test_rt_priority_validated() {
        assert!(apply_rt_priority(&RtConfig::default()).is_ok());
        assert!(matches!(
            apply_rt_priority(&RtConfig::default().with_priority(1000)),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_loop_runs_without_rt_privileges() {
        // Either granted or refused; the loop comes up regardless
        let (tx, _rx) = kanal::unbounded();
        let config = RtConfig::default().with_name("test-rt-prio").with_priority(10);
        let node = Counter {
            processed: Arc::new(AtomicU64::new(0)),
            status: ProcessStatus::OK,
        };
        let data_loop = DataLoop::spawn(&config, Box::new(node), tx).unwrap();
        assert_eq!(data_loop.invoke(|state| state.cycles()).unwrap(), 0);
    }

    #[test]
    fn test_transport_generation_advances() {
        let (data_loop, rx, _) = spawn(ProcessStatus::OK);
        let fds: Vec<(EventFd, EventFd)> = (0..2)
            .map(|_| (EventFd::new().unwrap(), EventFd::new().unwrap()))
            .collect();
        let channels: Vec<TransportChannel> = fds
            .iter()
            .map(|(r, w)| {
                TransportChannel::new(5, r.try_clone_fd().unwrap(), w.try_clone_fd().unwrap())
            })
            .collect();

        let generations = data_loop
            .invoke(move |state| {
                let mut generations = Vec::new();
                for channel in channels {
                    generations.push(state.set_transport(channel));
                    state.transport_condition(PollFlags::HUP);
                }
                generations.push(state.transport_generation());
                generations
            })
            .unwrap();
        assert_eq!(generations, vec![1, 2, 2]);

        for generation in [1, 2] {
            assert_eq!(
                rx.recv().unwrap(),
                NodeEvent::TransportLost {
                    node_id: 5,
                    generation
                }
            );
        }
    }

    #[test]
    fn test_active_mix_set() {
        let (data_loop, _rx, _) = spawn(ProcessStatus::OK);
        let memfd = MemFd::new("test-rt-io", 4096).unwrap();
        let mut registry = RegionRegistry::new();
        registry
            .register(0, MemoryKind::MemFd, memfd.try_clone_fd().unwrap(), 0)
            .unwrap();
        let handle = registry.acquire(0).unwrap();
        let io = IoBuffers::new(
            registry
                .map(&handle, 0, 8, ProtFlags::READ | ProtFlags::WRITE)
                .unwrap(),
        )
        .unwrap();

        let key = MixKey::new(Direction::Output, 0, 0);
        let (active, removed, again) = data_loop
            .invoke(move |state| {
                state.add_mix(key, io.clone());
                state.add_mix(key, io);
                let active = state.active_mixes().len();
                (active, state.remove_mix(&key), state.remove_mix(&key))
            })
            .unwrap();
        assert_eq!(active, 1);
        assert!(removed);
        assert!(!again);
        registry.release(handle);
    }
}
