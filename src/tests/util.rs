//! In-memory RPMsg fabric for end-to-end tests.
//!
//! A [`Fabric`] simulates the bus between a handful of named CPUs. Frames are
//! delivered synchronously on the sender's thread and serially per endpoint,
//! matching the delivery contract real RPMsg implementations provide. The
//! fabric also counts frames by kind so flow-control behavior is observable.

use std::collections::HashMap;
use std::io::{self, Write};
use std::str;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::address::RpmsgAddr;
use crate::bus::{
    Bus, BusError, BusHooks, Device, Endpoint, EndpointHandlers, TxBuffer, ADDR_ANY,
};
use crate::config::Config;
use crate::frame::{CMD_DATA, CMD_SYNC, DATA_HEADER_SIZE};
use crate::socket::RpmsgSocket;
use crate::SocketType;

pub fn subscribe() -> tracing::subscriber::DefaultGuard {
    let sub = tracing_subscriber::FmtSubscriber::builder()
        .with_max_level(tracing::Level::TRACE)
        .with_writer(|| TestWriter)
        .finish();
    tracing::subscriber::set_default(sub)
}

struct TestWriter;

impl Write for TestWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        print!(
            "{}",
            str::from_utf8(buf).expect("tried to log invalid UTF-8")
        );
        Ok(buf.len())
    }
    fn flush(&mut self) -> io::Result<()> {
        io::stdout().flush()
    }
}

/// Frame counts observed on the fabric
#[derive(Debug, Default, Copy, Clone)]
pub struct Stats {
    pub syncs: u64,
    pub data_frames: u64,
    pub refunds: u64,
}

pub struct Fabric {
    state: Mutex<FabricState>,
    ipcsize: usize,
}

struct FabricState {
    nodes: HashMap<String, Node>,
    next_addr: u32,
    stats: Stats,
}

#[derive(Default)]
struct Node {
    hooks: Vec<Arc<dyn BusHooks>>,
    endpoints: HashMap<u32, Arc<LoopEndpoint>>,
}

impl Fabric {
    pub fn with_ipcsize(ipcsize: usize) -> Arc<Fabric> {
        Arc::new(Fabric {
            state: Mutex::new(FabricState {
                nodes: HashMap::new(),
                next_addr: 1,
                stats: Stats::default(),
            }),
            ipcsize,
        })
    }

    /// Attach a CPU to the fabric
    pub fn node(self: &Arc<Self>, cpu: &str) -> Arc<NodeBus> {
        self.state
            .lock()
            .unwrap()
            .nodes
            .entry(cpu.to_string())
            .or_default();
        Arc::new(NodeBus {
            cpu: cpu.to_string(),
            fabric: self.clone(),
        })
    }

    pub fn stats(&self) -> Stats {
        self.state.lock().unwrap().stats
    }

    /// Simulate a core going down: its endpoints vanish and every other
    /// node's hooks observe the device destruction
    pub fn remove_node(self: &Arc<Self>, cpu: &str) {
        let watchers: Vec<(Arc<dyn BusHooks>, Arc<dyn Device>)> = {
            let mut state = self.state.lock().unwrap();
            state.nodes.remove(cpu);
            state
                .nodes
                .iter()
                .flat_map(|(other, node)| {
                    node.hooks.iter().map(|hooks| {
                        let device: Arc<dyn Device> = Arc::new(LoopDevice {
                            fabric: self.clone(),
                            owner: other.clone(),
                            remote: cpu.to_string(),
                        });
                        (hooks.clone(), device)
                    })
                })
                .collect()
        };
        for (hooks, device) in watchers {
            hooks.device_destroyed(&device);
        }
    }
}

/// One CPU's view of the fabric
pub struct NodeBus {
    cpu: String,
    fabric: Arc<Fabric>,
}

impl Bus for NodeBus {
    fn local_cpu(&self) -> &str {
        &self.cpu
    }

    fn register(&self, hooks: Arc<dyn BusHooks>) {
        let devices: Vec<Arc<dyn Device>> = {
            let mut state = self.fabric.state.lock().unwrap();
            state
                .nodes
                .entry(self.cpu.clone())
                .or_default()
                .hooks
                .push(hooks.clone());
            state
                .nodes
                .keys()
                .filter(|cpu| **cpu != self.cpu)
                .map(|cpu| {
                    Arc::new(LoopDevice {
                        fabric: self.fabric.clone(),
                        owner: self.cpu.clone(),
                        remote: cpu.clone(),
                    }) as Arc<dyn Device>
                })
                .collect()
        };
        for device in devices {
            hooks.device_created(&device);
        }
    }

    fn unregister(&self, hooks: &Arc<dyn BusHooks>) {
        let mut state = self.fabric.state.lock().unwrap();
        if let Some(node) = state.nodes.get_mut(&self.cpu) {
            node.hooks
                .retain(|h| !std::ptr::addr_eq(Arc::as_ptr(h), Arc::as_ptr(hooks)));
        }
    }
}

/// A remote CPU as seen from `owner`
struct LoopDevice {
    fabric: Arc<Fabric>,
    owner: String,
    remote: String,
}

enum AfterCreate {
    /// Newly linked endpoints whose `ns_bound` fires once the lock drops
    Link(Vec<Arc<LoopEndpoint>>),
    /// Announce the name to the remote node's registered hooks
    Announce(Vec<Arc<dyn BusHooks>>),
    Nothing,
}

impl Device for LoopDevice {
    fn cpu_name(&self) -> &str {
        &self.remote
    }

    fn create_endpoint(
        &self,
        name: &str,
        dest: u32,
        handlers: Arc<dyn EndpointHandlers>,
    ) -> Result<Arc<dyn Endpoint>, BusError> {
        let (ept, after) = {
            let mut state = self.fabric.state.lock().unwrap();
            let addr = state.next_addr;
            state.next_addr += 1;
            let ept = Arc::new(LoopEndpoint {
                fabric: self.fabric.clone(),
                node: self.owner.clone(),
                name: name.to_string(),
                addr,
                handlers,
                dest: Mutex::new(None),
                alive: AtomicBool::new(true),
            });
            state
                .nodes
                .get_mut(&self.owner)
                .ok_or(BusError::Gone)?
                .endpoints
                .insert(addr, ept.clone());

            let after = if dest == ADDR_ANY {
                // an unlinked endpoint of the same name on the remote side
                // binds directly, the way the rpmsg name service pairs
                // identically named endpoints
                let peer = state.nodes.get(&self.remote).and_then(|node| {
                    node.endpoints
                        .values()
                        .find(|e| {
                            e.name == name
                                && e.alive.load(Ordering::SeqCst)
                                && e.dest.lock().unwrap().is_none()
                        })
                        .cloned()
                });
                if let Some(peer) = peer {
                    *peer.dest.lock().unwrap() = Some((self.owner.clone(), addr));
                    *ept.dest.lock().unwrap() = Some((self.remote.clone(), peer.addr));
                    AfterCreate::Link(vec![ept.clone(), peer])
                } else {
                    let hooks = state
                        .nodes
                        .get(&self.remote)
                        .map(|node| node.hooks.clone())
                        .unwrap_or_default();
                    AfterCreate::Announce(hooks)
                }
            } else {
                *ept.dest.lock().unwrap() = Some((self.remote.clone(), dest));
                let peer = state
                    .nodes
                    .get(&self.remote)
                    .and_then(|node| node.endpoints.get(&dest))
                    .cloned();
                if let Some(peer) = peer {
                    *peer.dest.lock().unwrap() = Some((self.owner.clone(), addr));
                    // the creator announces its own bind itself
                    AfterCreate::Link(vec![peer])
                } else {
                    AfterCreate::Nothing
                }
            };
            (ept, after)
        };

        match after {
            AfterCreate::Link(endpoints) => {
                for endpoint in endpoints {
                    let handle: Arc<dyn Endpoint> = endpoint.clone();
                    endpoint.handlers.on_ns_bound(&handle);
                }
            }
            AfterCreate::Announce(hooks_list) => {
                let device: Arc<dyn Device> = Arc::new(LoopDevice {
                    fabric: self.fabric.clone(),
                    owner: self.remote.clone(),
                    remote: self.owner.clone(),
                });
                let addr = ept.addr;
                for hooks in hooks_list {
                    if hooks.ns_match(&device, name, addr) {
                        hooks.ns_bind(&device, name, addr);
                        break;
                    }
                }
            }
            AfterCreate::Nothing => {}
        }
        Ok(ept)
    }
}

struct LoopEndpoint {
    fabric: Arc<Fabric>,
    node: String,
    name: String,
    addr: u32,
    handlers: Arc<dyn EndpointHandlers>,
    dest: Mutex<Option<(String, u32)>>,
    alive: AtomicBool,
}

impl LoopEndpoint {
    fn transmit(&self, frame: &[u8]) -> Result<(), BusError> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(BusError::Gone);
        }
        let handlers = {
            let mut state = self.fabric.state.lock().unwrap();
            if frame.len() >= 4 {
                let cmd = u32::from_le_bytes(frame[..4].try_into().unwrap());
                match cmd {
                    CMD_SYNC => state.stats.syncs += 1,
                    CMD_DATA if frame.len() == DATA_HEADER_SIZE => state.stats.refunds += 1,
                    CMD_DATA => state.stats.data_frames += 1,
                    _ => {}
                }
            }
            let dest = self.dest.lock().unwrap().clone();
            let Some((node, addr)) = dest else {
                return Err(BusError::Gone);
            };
            let Some(peer) = state
                .nodes
                .get(&node)
                .and_then(|node| node.endpoints.get(&addr))
            else {
                return Err(BusError::Gone);
            };
            peer.handlers.clone()
        };
        handlers.on_message(frame);
        Ok(())
    }
}

impl Endpoint for LoopEndpoint {
    fn send(&self, frame: &[u8]) -> Result<(), BusError> {
        self.transmit(frame)
    }

    fn tx_buffer(&self) -> Result<TxBuffer, BusError> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(BusError::Gone);
        }
        Ok(TxBuffer::new(self.fabric.ipcsize))
    }

    fn send_nocopy(&self, buf: TxBuffer) -> Result<(), BusError> {
        self.transmit(&buf)
    }

    fn destroy(&self) {
        if !self.alive.swap(false, Ordering::SeqCst) {
            return;
        }
        let peer = {
            let mut state = self.fabric.state.lock().unwrap();
            if let Some(node) = state.nodes.get_mut(&self.node) {
                node.endpoints.remove(&self.addr);
            }
            let dest = self.dest.lock().unwrap().clone();
            dest.and_then(|(node, addr)| {
                state
                    .nodes
                    .get(&node)
                    .and_then(|node| node.endpoints.get(&addr))
                    .cloned()
            })
        };
        if let Some(peer) = peer {
            if peer.alive.load(Ordering::SeqCst) {
                peer.handlers.on_ns_unbind();
            }
        }
    }
}

/// Two CPUs, "cpuA" and "cpuB", joined by one fabric
pub struct Pair {
    pub fabric: Arc<Fabric>,
    pub a: Arc<dyn Bus>,
    pub b: Arc<dyn Bus>,
}

impl Pair {
    pub fn new() -> Self {
        // the default virtio rpmsg buffer is 512 bytes, 16 reserved
        Pair::with_ipcsize(496)
    }

    pub fn with_ipcsize(ipcsize: usize) -> Self {
        let fabric = Fabric::with_ipcsize(ipcsize);
        let a = fabric.node("cpuA");
        let b = fabric.node("cpuB");
        Pair { fabric, a, b }
    }

    /// Stream listener on cpuB accepting any CPU
    pub fn listener(&self, name: &str, backlog: usize, config: Config) -> RpmsgSocket {
        let sock = RpmsgSocket::new(self.b.clone(), SocketType::Stream, config);
        sock.bind(&RpmsgAddr::new(name, "").unwrap()).unwrap();
        sock.listen(backlog).unwrap();
        sock
    }

    /// Stream client on cpuA connected to cpuB
    pub fn client(&self, name: &str, config: Config) -> RpmsgSocket {
        let sock = RpmsgSocket::new(self.a.clone(), SocketType::Stream, config);
        sock.connect(&RpmsgAddr::new(name, "cpuB").unwrap()).unwrap();
        sock
    }

    /// Connected stream pair plus the listener that produced it
    pub fn stream_pair(&self, name: &str, config: Config) -> (RpmsgSocket, RpmsgSocket, RpmsgSocket) {
        let listener = self.listener(name, 4, config.clone());
        let client = self.client(name, config);
        let (server, _) = listener.accept().unwrap();
        (client, server, listener)
    }
}
