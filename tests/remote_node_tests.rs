//! End-to-end tests of an exported node driven through its control messages.
//!
//! The test plays the driver: it owns the shared memory, registers it with the
//! node, installs buffers and I/O areas, and runs processing cycles through
//! the eventfd transport.

use parallax_remote::buffer::{MetaType, WireBuffer, WireBufferRef, WireData, WireMeta};
use parallax_remote::config::{NodeConfig, RtConfig};
use parallax_remote::memory::{MEMORY_FLAG_READABLE, MEMORY_FLAG_WRITABLE, MemFd, MemoryKind};
use parallax_remote::node::{BufferSource, RemoteNode};
use parallax_remote::ownership::INVALID_ID;
use parallax_remote::port::{Direction, IoKind, MixKey, MixState, Param, Status, param_id};
use parallax_remote::transport::{Command, ControlMessage, ControlSocket, EventFd};
use rustix::fd::AsFd;
use std::time::Duration;

const POOL: u32 = 0;
const IO: u32 = 1;
const IO_OFFSET: u64 = 32768;
const KEY: MixKey = MixKey::new(Direction::Output, 0, 0);

fn config() -> NodeConfig {
    NodeConfig::default()
        .with_lock_memory(false)
        .with_rt(RtConfig::default().with_name("test-e2e"))
}

fn wire(offset: u32) -> WireBufferRef {
    WireBufferRef {
        mem_id: POOL,
        offset,
        size: 4096,
        buffer: WireBuffer::new()
            .with_meta(WireMeta::new(MetaType::Header))
            .with_data(WireData::mem_ptr(256, 1024)),
    }
}

fn wait_for(mut cond: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if cond() {
            return;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    panic!("condition not reached");
}

struct Driver {
    node: RemoteNode,
    outbox: kanal::Receiver<ControlMessage>,
    memfd: MemFd,
    seq: u32,
}

impl Driver {
    fn new(source: BufferSource) -> Self {
        let (mut node, outbox) = RemoteNode::new(config(), source).unwrap();
        let memfd = MemFd::new("driver-pool", 65536).unwrap();
        for mem_id in [POOL, IO] {
            node.handle(
                ControlMessage::AddMemory {
                    mem_id,
                    kind: MemoryKind::MemFd.as_raw(),
                    flags: MEMORY_FLAG_READABLE | MEMORY_FLAG_WRITABLE,
                },
                vec![memfd.try_clone_fd().unwrap()],
            )
            .unwrap();
        }
        Self {
            node,
            outbox,
            memfd,
            seq: 0,
        }
    }

    /// Send a request and return the result code of its `Done`.
    fn request(&mut self, build: impl FnOnce(u32) -> ControlMessage) -> i32 {
        self.seq += 1;
        let seq = self.seq;
        self.node.handle(build(seq), Vec::new()).unwrap();
        self.node.dispatch_events();
        while let Ok(Some(message)) = self.outbox.try_recv() {
            if let ControlMessage::Done { seq: s, res } = message {
                if s == seq {
                    return res;
                }
            }
        }
        panic!("no reply for request {}", seq);
    }

    fn io(&self) -> (Status, u32) {
        let mut buf = [0u8; 8];
        self.memfd.read_at(IO_OFFSET, &mut buf).unwrap();
        let status = i32::from_ne_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let id = u32::from_ne_bytes([buf[4], buf[5], buf[6], buf[7]]);
        (Status::from_raw(status), id)
    }

    fn set_io(&self, status: Status, id: u32) {
        let mut buf = [0u8; 8];
        buf[..4].copy_from_slice(&status.as_raw().to_ne_bytes());
        buf[4..].copy_from_slice(&id.to_ne_bytes());
        self.memfd.write_at(IO_OFFSET, &buf).unwrap();
    }

    fn read_u32(&self, offset: u64) -> u32 {
        let mut buf = [0u8; 4];
        self.memfd.read_at(offset, &mut buf).unwrap();
        u32::from_ne_bytes(buf)
    }
}

#[test]
fn test_add_memory_use_buffers_process_clear() {
    let source = BufferSource::new().with_fill(|data| {
        data[..5].copy_from_slice(b"frame");
        5
    });
    let mut driver = Driver::new(source);

    let res = driver.request(|seq| ControlMessage::PortSetParam {
        seq,
        direction: Direction::Output,
        port_id: 0,
        param: Param::new(param_id::FORMAT, vec![0xaa]),
    });
    assert_eq!(res, 0);

    let res = driver.request(|seq| ControlMessage::PortUseBuffers {
        seq,
        direction: Direction::Output,
        port_id: 0,
        mix_id: 0,
        buffers: vec![wire(0), wire(4096)],
    });
    assert_eq!(res, 0);
    assert_eq!(driver.node.registry().ref_count(POOL), Some(2));

    driver.set_io(Status::Idle, INVALID_ID);
    let res = driver.request(|seq| ControlMessage::PortSetIo {
        seq,
        direction: Direction::Output,
        port_id: 0,
        mix_id: 0,
        id: IoKind::Buffers.as_raw(),
        mem_id: IO,
        offset: IO_OFFSET as u32,
        size: 8,
    });
    assert_eq!(res, 0);
    assert_eq!(driver.node.mixes().state(&KEY), MixState::Active);

    let to_node = EventFd::new().unwrap();
    let from_node = EventFd::new().unwrap();
    driver
        .node
        .handle(
            ControlMessage::Transport { node_id: 12 },
            vec![to_node.try_clone_fd().unwrap(), from_node.try_clone_fd().unwrap()],
        )
        .unwrap();
    let res = driver.request(|seq| ControlMessage::Command {
        seq,
        command: Command::Start,
    });
    assert_eq!(res, 0);

    // Cycle 1: buffer 0 is filled and published
    to_node.notify().unwrap();
    wait_for(|| from_node.try_wait().unwrap());
    assert_eq!(driver.io(), (Status::HaveBuffer, 0));
    // Header meta is 24 bytes, the chunk follows: { offset, size, stride }
    assert_eq!(driver.read_u32(24 + 4), 5);
    let mut data = [0u8; 5];
    driver.memfd.read_at(256, &mut data).unwrap();
    assert_eq!(&data, b"frame");
    // Header seq
    assert_eq!(driver.read_u32(4), 0);

    // Consume it, then run another cycle
    driver.set_io(Status::NeedBuffer, 0);
    to_node.notify().unwrap();
    wait_for(|| from_node.try_wait().unwrap());
    let (status, id) = driver.io();
    assert_eq!(status, Status::HaveBuffer);
    assert!(id < 2);
    assert_eq!(driver.read_u32(u64::from(id) * 4096 + 4), 1);

    // Clear the buffers, then the I/O area
    let res = driver.request(|seq| ControlMessage::PortUseBuffers {
        seq,
        direction: Direction::Output,
        port_id: 0,
        mix_id: 0,
        buffers: Vec::new(),
    });
    assert_eq!(res, 0);
    assert!(!driver.node.registry().contains(POOL));
    assert_eq!(driver.node.registry().ref_count(IO), Some(1));

    let res = driver.request(|seq| ControlMessage::PortSetIo {
        seq,
        direction: Direction::Output,
        port_id: 0,
        mix_id: 0,
        id: IoKind::Buffers.as_raw(),
        mem_id: INVALID_ID,
        offset: 0,
        size: 0,
    });
    assert_eq!(res, 0);
    // Nothing left on the mix, its slot went back to the pool
    assert_eq!(driver.node.mixes().state(&KEY), MixState::Free);
    assert!(driver.node.mixes().is_empty());
    assert!(driver.node.registry().is_empty());
    assert_eq!(driver.node.registry().stats().closes, 2);

    let active = driver
        .node
        .data_loop()
        .invoke(|state| state.active_mixes().len())
        .unwrap();
    assert_eq!(active, 0);
}

#[test]
fn test_serve_over_socket() {
    let (mut driver, mut node_socket) = ControlSocket::pair().unwrap();
    let memfd = MemFd::new("driver-socket", 4096).unwrap();

    let server = std::thread::spawn(move || {
        let source = BufferSource::new()
            .with_param(Param::new(param_id::ENUM_FORMAT, vec![1]))
            .with_param(Param::new(param_id::ENUM_FORMAT, vec![2]))
            .with_async_params(true);
        let (mut node, outbox) = RemoteNode::new(config(), source)?;
        node.serve(&mut node_socket, &outbox)?;
        Ok::<usize, parallax_remote::Error>(node.registry().len())
    });

    let mut exported = Vec::new();
    for _ in 0..3 {
        exported.push(driver.recv().unwrap().unwrap().message);
    }
    assert!(matches!(exported[0], ControlMessage::Update { .. }));
    assert!(matches!(
        exported[1],
        ControlMessage::PortUpdate {
            direction: Direction::Output,
            port_id: 0,
            ..
        }
    ));
    assert_eq!(exported[2], ControlMessage::Done { seq: 0, res: 0 });

    driver
        .send(
            &ControlMessage::AddMemory {
                mem_id: 0,
                kind: MemoryKind::MemFd.as_raw(),
                flags: MEMORY_FLAG_READABLE,
            },
            &[memfd.as_fd()],
        )
        .unwrap();
    driver
        .send(
            &ControlMessage::PortEnumParams {
                seq: 7,
                direction: Direction::Output,
                port_id: 0,
                id: param_id::ENUM_FORMAT,
                start: 0,
                num: 0,
            },
            &[],
        )
        .unwrap();

    let mut params = Vec::new();
    loop {
        match driver.recv().unwrap().unwrap().message {
            ControlMessage::PortParam { seq: 7, param, .. } => params.push(param.pod),
            ControlMessage::Done { seq: 7, res } => {
                assert_eq!(res, 0);
                break;
            }
            other => panic!("unexpected {:?}", other),
        }
    }
    assert_eq!(params, vec![vec![1], vec![2]]);

    drop(driver);
    let regions = server.join().unwrap().unwrap();
    assert_eq!(regions, 1);
}
