//! Configuration for exported remote nodes.

/// Default number of mixes a node can have bound at the same time.
pub const DEFAULT_MAX_MIXES: usize = 4096;

/// Default number of buffers a single mix may carry.
pub const DEFAULT_MAX_BUFFERS: usize = 64;

/// Configuration of the realtime data loop.
#[derive(Debug, Clone)]
pub struct RtConfig {
    /// Name of the data thread (visible in `/proc/<pid>/task/*/comm`).
    pub name: String,

    /// Real-time thread priority (SCHED_FIFO).
    ///
    /// Requires CAP_SYS_NICE or root. Range 1-99.
    /// `None` means use default thread priority.
    pub rt_priority: Option<i32>,

    /// Capacity of the invoke queue.
    pub queue_capacity: usize,
}

impl Default for RtConfig {
    fn default() -> Self {
        Self {
            name: String::from("remote-data"),
            rt_priority: None,
            queue_capacity: 64,
        }
    }
}

impl RtConfig {
    /// Set the data thread name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the SCHED_FIFO priority.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.rt_priority = Some(priority);
        self
    }
}

/// Configuration of a [`RemoteNode`](crate::node::RemoteNode).
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Capacity of the mix pool.
    pub max_mixes: usize,

    /// Upper bound for the number of buffers in one `UseBuffers` request.
    pub max_buffers: usize,

    /// `mlock` buffer memory after mapping it.
    ///
    /// Failures are logged and otherwise ignored.
    pub lock_memory: bool,

    /// Realtime loop configuration.
    pub rt: RtConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            max_mixes: DEFAULT_MAX_MIXES,
            max_buffers: DEFAULT_MAX_BUFFERS,
            lock_memory: true,
            rt: RtConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Set the capacity of the mix pool.
    pub fn with_max_mixes(mut self, max_mixes: usize) -> Self {
        self.max_mixes = max_mixes;
        self
    }

    /// Set the maximum number of buffers per mix.
    pub fn with_max_buffers(mut self, max_buffers: usize) -> Self {
        self.max_buffers = max_buffers;
        self
    }

    /// Enable or disable `mlock` of buffer memory.
    pub fn with_lock_memory(mut self, lock: bool) -> Self {
        self.lock_memory = lock;
        self
    }

    /// Set the realtime loop configuration.
    pub fn with_rt(mut self, rt: RtConfig) -> Self {
        self.rt = rt;
        self
    }
}
