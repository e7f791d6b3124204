//! Host-only stand-in for a GPU: device memory is ordinary heap memory and
//! every stream is a worker thread draining an in-order instruction queue.

use crate::config::HostStageConfig;
use crate::device::runtime::{DeviceRuntime, HostFlag, StreamId};
use crate::error::{HostStageError, Result};
use crate::types::{Element, from_bytes, to_bytes};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, mpsc};
use std::thread;
use std::time::Duration;

type Kernel = Box<dyn FnOnce() + Send + 'static>;

enum Instr {
    Copy { dst: usize, src: usize, len: usize },
    Upload { dst: usize, data: Vec<u8> },
    Download { src: usize, len: usize, reply: mpsc::Sender<Vec<u8>> },
    WriteValue { flag: HostFlag, value: u32 },
    WaitValue { flag: HostFlag, value: u32 },
    Kernel(Kernel),
    Fence(mpsc::Sender<()>),
}

struct SimStream {
    queue: mpsc::Sender<Instr>,
    worker: Option<thread::JoinHandle<()>>,
}

/// Simulated device implementing [`DeviceRuntime`].
///
/// Streams execute asynchronously with respect to the host, in issue order
/// within a stream, and concurrently across streams. Dropping the device
/// releases streams still parked on a wait and joins every worker.
pub struct SimDevice {
    streams: RwLock<HashMap<StreamId, SimStream>>,
    next_stream: AtomicU64,
    allocations: Mutex<BTreeMap<u64, Box<[u8]>>>,
    shutdown: Arc<AtomicBool>,
    latency: Duration,
}

impl SimDevice {
    pub fn new() -> Arc<Self> {
        Self::with_config(&HostStageConfig::default())
    }

    pub fn with_config(config: &HostStageConfig) -> Arc<Self> {
        Arc::new(Self {
            streams: RwLock::new(HashMap::new()),
            next_stream: AtomicU64::new(1),
            allocations: Mutex::new(BTreeMap::new()),
            shutdown: Arc::new(AtomicBool::new(false)),
            latency: config.sim_copy_latency,
        })
    }

    /// Create a new stream with its own worker.
    pub fn create_stream(&self) -> Result<StreamId> {
        let id = StreamId(self.next_stream.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel();
        let shutdown = Arc::clone(&self.shutdown);
        let latency = self.latency;
        let worker = thread::Builder::new()
            .name(format!("sim-{id}"))
            .spawn(move || run_stream(rx, shutdown, latency))
            .map_err(|e| HostStageError::device_with_source("failed to spawn stream worker", e))?;

        self.streams
            .write()
            .map_err(|_| HostStageError::LockPoisoned("sim streams"))?
            .insert(
                id,
                SimStream {
                    queue: tx,
                    worker: Some(worker),
                },
            );
        tracing::debug!(stream = %id, "sim stream created");
        Ok(id)
    }

    /// Allocate zeroed device memory and return its address.
    pub fn alloc(&self, size_bytes: usize) -> Result<u64> {
        let mem = vec![0u8; size_bytes.max(1)].into_boxed_slice();
        let addr = mem.as_ptr() as u64;
        self.allocations
            .lock()
            .map_err(|_| HostStageError::LockPoisoned("sim allocations"))?
            .insert(addr, mem);
        Ok(addr)
    }

    /// Allocate room for `count` elements of `T`.
    pub fn alloc_elems<T: Element>(&self, count: usize) -> Result<u64> {
        self.alloc(count * T::DTYPE.size_in_bytes())
    }

    /// Free an allocation. Work still queued against it is the caller's problem,
    /// exactly as with a real device.
    pub fn free(&self, ptr: u64) -> Result<()> {
        self.allocations
            .lock()
            .map_err(|_| HostStageError::LockPoisoned("sim allocations"))?
            .remove(&ptr)
            .map(|_| ())
            .ok_or_else(|| HostStageError::device(format!("free of unknown pointer {ptr:#x}")))
    }

    /// Enqueue a host closure as a "kernel" on `stream`.
    pub fn launch<F>(&self, stream: StreamId, kernel: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.enqueue(stream, Instr::Kernel(Box::new(kernel)))
    }

    /// Copy `values` into device memory at `ptr`, ordered on `stream`, and
    /// wait for it.
    pub fn upload<T: Element>(&self, stream: StreamId, ptr: u64, values: &[T]) -> Result<()> {
        let data = to_bytes(values);
        self.check_range(ptr, data.len())?;
        self.enqueue(
            stream,
            Instr::Upload {
                dst: ptr as usize,
                data,
            },
        )?;
        self.synchronize(stream)
    }

    /// Read `count` elements at `ptr` once everything queued on `stream` ran.
    pub fn download<T: Element>(&self, stream: StreamId, ptr: u64, count: usize) -> Result<Vec<T>> {
        let len = count * T::DTYPE.size_in_bytes();
        self.check_range(ptr, len)?;
        let (reply, rx) = mpsc::channel();
        self.enqueue(
            stream,
            Instr::Download {
                src: ptr as usize,
                len,
                reply,
            },
        )?;
        let bytes = rx
            .recv()
            .map_err(|_| HostStageError::device(format!("{stream} shut down during download")))?;
        Ok(from_bytes(&bytes))
    }

    /// Block the calling thread until `stream` has drained.
    pub fn synchronize(&self, stream: StreamId) -> Result<()> {
        let (tx, rx) = mpsc::channel();
        self.enqueue(stream, Instr::Fence(tx))?;
        rx.recv()
            .map_err(|_| HostStageError::device(format!("{stream} shut down before draining")))
    }

    fn enqueue(&self, stream: StreamId, instr: Instr) -> Result<()> {
        let streams = self
            .streams
            .read()
            .map_err(|_| HostStageError::LockPoisoned("sim streams"))?;
        let s = streams
            .get(&stream)
            .ok_or_else(|| HostStageError::device(format!("invalid stream handle {stream}")))?;
        s.queue
            .send(instr)
            .map_err(|_| HostStageError::device(format!("{stream} worker has exited")))
    }

    /// Reject device ranges outside every live allocation.
    fn check_range(&self, ptr: u64, len: usize) -> Result<()> {
        let allocations = self
            .allocations
            .lock()
            .map_err(|_| HostStageError::LockPoisoned("sim allocations"))?;
        let in_bounds = allocations
            .range(..=ptr)
            .next_back()
            .is_some_and(|(&base, mem)| {
                (ptr - base)
                    .checked_add(len as u64)
                    .is_some_and(|end| end <= mem.len() as u64)
            });
        if in_bounds {
            Ok(())
        } else {
            Err(HostStageError::device(format!(
                "invalid device range {ptr:#x}+{len}"
            )))
        }
    }
}

impl DeviceRuntime for SimDevice {
    unsafe fn memcpy_dtoh_async(
        &self,
        dst: *mut u8,
        src: u64,
        size_bytes: usize,
        stream: StreamId,
    ) -> Result<()> {
        self.check_range(src, size_bytes)?;
        self.enqueue(
            stream,
            Instr::Copy {
                dst: dst as usize,
                src: src as usize,
                len: size_bytes,
            },
        )
    }

    unsafe fn memcpy_htod_async(
        &self,
        dst: u64,
        src: *const u8,
        size_bytes: usize,
        stream: StreamId,
    ) -> Result<()> {
        self.check_range(dst, size_bytes)?;
        self.enqueue(
            stream,
            Instr::Copy {
                dst: dst as usize,
                src: src as usize,
                len: size_bytes,
            },
        )
    }

    fn check_device_range(&self, ptr: u64, size_bytes: usize) -> Result<()> {
        self.check_range(ptr, size_bytes)
    }

    fn write_value(&self, stream: StreamId, flag: &HostFlag, value: u32) -> Result<()> {
        self.enqueue(
            stream,
            Instr::WriteValue {
                flag: flag.clone(),
                value,
            },
        )
    }

    fn wait_value(&self, stream: StreamId, flag: &HostFlag, value: u32) -> Result<()> {
        self.enqueue(
            stream,
            Instr::WaitValue {
                flag: flag.clone(),
                value,
            },
        )
    }
}

impl Drop for SimDevice {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        let streams = match self.streams.get_mut() {
            Ok(streams) => std::mem::take(streams),
            Err(poisoned) => std::mem::take(poisoned.into_inner()),
        };
        for (id, SimStream { queue, worker }) in streams {
            drop(queue);
            if let Some(worker) = worker
                && worker.join().is_err()
            {
                tracing::warn!(stream = %id, "sim stream worker panicked");
            }
        }
    }
}

fn run_stream(rx: mpsc::Receiver<Instr>, shutdown: Arc<AtomicBool>, latency: Duration) {
    while let Ok(instr) = rx.recv() {
        if !latency.is_zero() {
            thread::sleep(latency);
        }
        match instr {
            Instr::Copy { dst, src, len } => {
                if len > 0 {
                    // SAFETY: both ranges were validated or supplied by an
                    // `unsafe` caller that guarantees them until execution.
                    unsafe {
                        std::ptr::copy_nonoverlapping(src as *const u8, dst as *mut u8, len)
                    };
                }
            }
            Instr::Upload { dst, data } => unsafe {
                std::ptr::copy_nonoverlapping(data.as_ptr(), dst as *mut u8, data.len());
            },
            Instr::Download { src, len, reply } => {
                let bytes = unsafe { std::slice::from_raw_parts(src as *const u8, len) }.to_vec();
                let _ = reply.send(bytes);
            }
            Instr::WriteValue { flag, value } => flag.store(value),
            Instr::WaitValue { flag, value } => {
                while flag.load() < value {
                    if shutdown.load(Ordering::Acquire) {
                        return;
                    }
                    thread::yield_now();
                }
            }
            Instr::Kernel(kernel) => kernel(),
            Instr::Fence(done) => {
                let _ = done.send(());
            }
        }
    }
}
