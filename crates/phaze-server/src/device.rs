//! Virtual network interface bridge.
//!
//! Device reads and writes block, so each half runs on its own OS thread and
//! talks to the event loop through bounded channels.

use std::collections::VecDeque;
use std::io;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Packets buffered in each direction before new ones are dropped.
pub const DEVICE_QUEUE_DEPTH: usize = 1024;

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("failed to open tunnel device: {0}")]
    Open(String),

    #[error("device I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Read side of a packet device.
pub trait DeviceReader: Send + 'static {
    /// Block until one IP packet is available. `Ok(0)` means the device
    /// has been closed.
    fn read_packet(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

/// Write side of a packet device.
pub trait DeviceWriter: Send + 'static {
    fn write_packet(&mut self, packet: &[u8]) -> io::Result<()>;
}

/// A device that can be split into independently owned halves.
pub trait VirtualDevice {
    type Reader: DeviceReader;
    type Writer: DeviceWriter;

    fn split(self) -> (Self::Reader, Self::Writer);
}

/// Settings for the kernel TUN interface.
#[derive(Debug, Clone)]
pub struct TunSettings {
    pub name: String,
    pub address: Ipv4Addr,
    pub prefix_len: u8,
    pub mtu: u16,
}

/// Kernel TUN interface (no packet-information header).
pub struct TunDevice {
    device: tun::platform::Device,
}

impl TunDevice {
    pub fn open(settings: &TunSettings) -> Result<Self, DeviceError> {
        let netmask = ipnet::Ipv4Net::new(settings.address, settings.prefix_len)
            .map_err(|e| DeviceError::Open(e.to_string()))?
            .netmask();

        let mut config = tun::Configuration::default();
        config
            .name(&settings.name)
            .address(settings.address)
            .netmask(netmask)
            .mtu(i32::from(settings.mtu))
            .up();

        #[cfg(target_os = "linux")]
        config.platform(|cfg| {
            cfg.packet_information(false);
        });

        let device = tun::create(&config).map_err(|e| DeviceError::Open(e.to_string()))?;
        info!(
            "tunnel device {} up at {}/{} (mtu {})",
            settings.name, settings.address, settings.prefix_len, settings.mtu
        );
        Ok(Self { device })
    }
}

pub struct TunReader(tun::platform::posix::Reader);
pub struct TunWriter(tun::platform::posix::Writer);

impl DeviceReader for TunReader {
    fn read_packet(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        io::Read::read(&mut self.0, buf)
    }
}

impl DeviceWriter for TunWriter {
    fn write_packet(&mut self, packet: &[u8]) -> io::Result<()> {
        io::Write::write_all(&mut self.0, packet)
    }
}

impl VirtualDevice for TunDevice {
    type Reader = TunReader;
    type Writer = TunWriter;

    fn split(self) -> (TunReader, TunWriter) {
        let (reader, writer) = self.device.split();
        (TunReader(reader), TunWriter(writer))
    }
}

/// Running reader and writer threads for one device.
///
/// `close` (or dropping the bridge) flushes the write queue and joins the
/// writer thread. The reader cannot be woken from a blocking device read, so
/// it is told to stop and releases its half of the device as soon as that
/// read returns. A reader still parked at process exit has its descriptor
/// closed by the OS.
pub struct DeviceBridge {
    inbound: Option<mpsc::Receiver<Vec<u8>>>,
    outbound: Option<mpsc::Sender<Vec<u8>>>,
    stop: Arc<AtomicBool>,
    reader: JoinHandle<()>,
    writer: Option<JoinHandle<()>>,
}

impl DeviceBridge {
    pub fn spawn<D: VirtualDevice>(device: D, mtu: usize) -> io::Result<Self> {
        let (mut reader, mut writer) = device.split();
        let (inbound_tx, inbound_rx) = mpsc::channel::<Vec<u8>>(DEVICE_QUEUE_DEPTH);
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<Vec<u8>>(DEVICE_QUEUE_DEPTH);
        let stop = Arc::new(AtomicBool::new(false));

        let reader_stop = stop.clone();
        let reader = thread::Builder::new()
            .name("phaze-dev-read".into())
            .spawn(move || {
                let mut buf = vec![0u8; mtu.max(1) + 1];
                while !reader_stop.load(Ordering::Acquire) {
                    let result = reader.read_packet(&mut buf);
                    if reader_stop.load(Ordering::Acquire) {
                        break;
                    }
                    let len = match result {
                        Ok(0) => break,
                        Ok(len) => len,
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => {
                            warn!("device read failed: {}", e);
                            break;
                        }
                    };
                    if len > mtu {
                        debug!("dropping {} byte packet from device (mtu {})", len, mtu);
                        continue;
                    }
                    if inbound_tx.blocking_send(buf[..len].to_vec()).is_err() {
                        break;
                    }
                }
                debug!("device reader stopped");
            })?;

        let writer = thread::Builder::new()
            .name("phaze-dev-write".into())
            .spawn(move || {
                while let Some(packet) = outbound_rx.blocking_recv() {
                    if let Err(e) = writer.write_packet(&packet) {
                        debug!("device write failed: {}", e);
                    }
                }
                debug!("device writer stopped");
            })?;

        Ok(Self {
            inbound: Some(inbound_rx),
            outbound: Some(outbound_tx),
            stop,
            reader,
            writer: Some(writer),
        })
    }

    /// Packets read from the device. Can be taken once.
    pub fn take_inbound(&mut self) -> Option<mpsc::Receiver<Vec<u8>>> {
        self.inbound.take()
    }

    /// Queue a packet for the device. Returns false if it was dropped.
    pub fn write(&self, packet: Vec<u8>) -> bool {
        self.outbound
            .as_ref()
            .is_some_and(|tx| tx.try_send(packet).is_ok())
    }

    /// Stop both threads. Packets already queued for the device are written
    /// before this returns; later writes are refused.
    pub fn close(&mut self) {
        self.stop.store(true, Ordering::Release);
        self.inbound = None;
        self.outbound = None;
        if let Some(writer) = self.writer.take() {
            if writer.join().is_err() {
                warn!("device writer panicked");
            }
        }
    }

    /// Whether the reader thread has released the device.
    pub fn reader_stopped(&self) -> bool {
        self.reader.is_finished()
    }
}

impl Drop for DeviceBridge {
    fn drop(&mut self) {
        self.close();
    }
}

#[derive(Default)]
struct Pipe {
    queue: Mutex<(VecDeque<Vec<u8>>, bool)>,
    ready: Condvar,
}

impl Pipe {
    fn push(&self, packet: Vec<u8>) {
        let mut guard = self.queue.lock();
        guard.0.push_back(packet);
        self.ready.notify_one();
    }

    fn pop_blocking(&self) -> Option<Vec<u8>> {
        let mut guard = self.queue.lock();
        loop {
            if let Some(packet) = guard.0.pop_front() {
                return Some(packet);
            }
            if guard.1 {
                return None;
            }
            self.ready.wait(&mut guard);
        }
    }

    fn close(&self) {
        self.queue.lock().1 = true;
        self.ready.notify_all();
    }
}

/// In-process device for tests and embedding.
///
/// The paired `MemoryDeviceHandle` plays the kernel side: it injects
/// packets the device will "read" and collects what the device writes.
pub struct MemoryDevice {
    to_device: Arc<Pipe>,
    from_device: Arc<Pipe>,
}

#[derive(Clone)]
pub struct MemoryDeviceHandle {
    to_device: Arc<Pipe>,
    from_device: Arc<Pipe>,
}

impl MemoryDevice {
    pub fn pair() -> (Self, MemoryDeviceHandle) {
        let to_device = Arc::new(Pipe::default());
        let from_device = Arc::new(Pipe::default());
        (
            Self {
                to_device: to_device.clone(),
                from_device: from_device.clone(),
            },
            MemoryDeviceHandle {
                to_device,
                from_device,
            },
        )
    }
}

impl MemoryDeviceHandle {
    /// Make `packet` readable from the device.
    pub fn inject(&self, packet: Vec<u8>) {
        self.to_device.push(packet);
    }

    /// Block until the device has written a packet.
    pub fn next_written(&self) -> Option<Vec<u8>> {
        self.from_device.pop_blocking()
    }

    /// Simulate the interface going away.
    pub fn close(&self) {
        self.to_device.close();
        self.from_device.close();
    }
}

pub struct MemoryReader(Arc<Pipe>);
pub struct MemoryWriter(Arc<Pipe>);

impl DeviceReader for MemoryReader {
    fn read_packet(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.0.pop_blocking() {
            Some(packet) => {
                let len = packet.len().min(buf.len());
                buf[..len].copy_from_slice(&packet[..len]);
                Ok(len)
            }
            None => Ok(0),
        }
    }
}

impl DeviceWriter for MemoryWriter {
    fn write_packet(&mut self, packet: &[u8]) -> io::Result<()> {
        self.0.push(packet.to_vec());
        Ok(())
    }
}

impl VirtualDevice for MemoryDevice {
    type Reader = MemoryReader;
    type Writer = MemoryWriter;

    fn split(self) -> (MemoryReader, MemoryWriter) {
        (MemoryReader(self.to_device), MemoryWriter(self.from_device))
    }
}
