//! Byte links to a radio: a USB/UART serial port or a TCP socket.
//!
//! Reads and writes are independent so a blocked read never delays a send. `close()`
//! flips a watch flag; pending TCP reads observe it immediately and serial reads within
//! one read timeout.

use log::{debug, trace};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};

#[cfg(feature = "serial")]
use serialport::SerialPort;
#[cfg(feature = "serial")]
use std::io::{Read, Write};
#[cfg(feature = "serial")]
use std::sync::{Arc, Mutex as StdMutex};

use super::{DeviceDescriptor, TransportError};
use crate::logutil::hex_snippet;

const READ_CHUNK: usize = 1024;
#[cfg(feature = "serial")]
const SERIAL_READ_TIMEOUT: Duration = Duration::from_millis(200);

enum Reader {
    Tcp(OwnedReadHalf),
    #[cfg(feature = "serial")]
    Serial(Arc<StdMutex<Box<dyn SerialPort>>>),
}

enum Writer {
    Tcp(OwnedWriteHalf),
    #[cfg(feature = "serial")]
    Serial(Arc<StdMutex<Box<dyn SerialPort>>>),
}

pub struct Link {
    label: String,
    reader: Mutex<Reader>,
    writer: Mutex<Writer>,
    closed: watch::Sender<bool>,
}

impl Link {
    pub async fn open(device: &DeviceDescriptor, connect_timeout: Duration) -> Result<Self, TransportError> {
        let (reader, writer) = match device {
            DeviceDescriptor::Tcp { host, port } => {
                let addr = format!("{}:{}", host, port);
                let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(&addr))
                    .await
                    .map_err(|_| TransportError::Timeout(format!("connecting to {}", addr)))??;
                let _ = stream.set_nodelay(true);
                let (r, w) = stream.into_split();
                (Reader::Tcp(r), Writer::Tcp(w))
            }
            #[cfg(feature = "serial")]
            DeviceDescriptor::Serial { path, baud } => {
                let port = open_serial(path, *baud).await?;
                let shared = Arc::new(StdMutex::new(port));
                (Reader::Serial(shared.clone()), Writer::Serial(shared))
            }
            #[cfg(not(feature = "serial"))]
            DeviceDescriptor::Serial { .. } => {
                return Err(TransportError::Unsupported("serial links (built without the serial feature)"));
            }
        };
        let (closed, _) = watch::channel(false);
        debug!("Opened link {}", device);
        Ok(Self {
            label: device.to_string(),
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            closed,
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Wait for the next chunk of bytes. An empty vector means end of stream.
    pub async fn read_chunk(&self) -> Result<Vec<u8>, TransportError> {
        let mut closed_rx = self.closed.subscribe();
        if *closed_rx.borrow() {
            return Err(TransportError::Closed);
        }
        let mut reader = self.reader.lock().await;
        match &mut *reader {
            Reader::Tcp(stream) => {
                let mut buf = vec![0u8; READ_CHUNK];
                tokio::select! {
                    res = stream.read(&mut buf) => {
                        let n = res?;
                        buf.truncate(n);
                        trace!("{} RX {} bytes: {}", self.label, n, hex_snippet(&buf, 64));
                        Ok(buf)
                    }
                    _ = closed_rx.wait_for(|c| *c) => Err(TransportError::Closed),
                }
            }
            #[cfg(feature = "serial")]
            Reader::Serial(port) => loop {
                if *closed_rx.borrow() {
                    return Err(TransportError::Closed);
                }
                let port = port.clone();
                let read = tokio::task::spawn_blocking(move || {
                    let mut buf = vec![0u8; READ_CHUNK];
                    let mut guard = match port.lock() {
                        Ok(g) => g,
                        Err(poisoned) => poisoned.into_inner(),
                    };
                    guard.read(&mut buf).map(|n| {
                        buf.truncate(n);
                        buf
                    })
                })
                .await
                .map_err(|e| TransportError::Serial(format!("read task failed: {}", e)))?;
                match read {
                    Ok(buf) if !buf.is_empty() => {
                        trace!("{} RX {} bytes: {}", self.label, buf.len(), hex_snippet(&buf, 64));
                        return Ok(buf);
                    }
                    // A serial port never reports EOF; a zero read is just an idle line
                    Ok(_) => continue,
                    Err(e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
                    Err(e) => return Err(e.into()),
                }
            },
        }
    }

    pub async fn write_all(&self, data: &[u8]) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let mut writer = self.writer.lock().await;
        trace!("{} TX {} bytes: {}", self.label, data.len(), hex_snippet(data, 64));
        match &mut *writer {
            Writer::Tcp(stream) => {
                stream.write_all(data).await?;
                stream.flush().await?;
            }
            #[cfg(feature = "serial")]
            Writer::Serial(port) => {
                let port = port.clone();
                let data = data.to_vec();
                tokio::task::spawn_blocking(move || {
                    let mut guard = match port.lock() {
                        Ok(g) => g,
                        Err(poisoned) => poisoned.into_inner(),
                    };
                    guard.write_all(&data)?;
                    guard.flush()
                })
                .await
                .map_err(|e| TransportError::Serial(format!("write task failed: {}", e)))??;
            }
        }
        Ok(())
    }

    pub async fn close(&self) {
        if self.closed.send_replace(true) {
            return;
        }
        let mut writer = self.writer.lock().await;
        if let Writer::Tcp(stream) = &mut *writer {
            let _ = stream.shutdown().await;
        }
        debug!("Closed link {}", self.label);
    }
}

#[cfg(feature = "serial")]
async fn open_serial(path: &str, baud: u32) -> Result<Box<dyn SerialPort>, TransportError> {
    #[cfg(unix)]
    if !std::path::Path::new(path).exists() {
        return Err(TransportError::DeviceNotFound(path.to_string()));
    }

    debug!("Opening serial port {} at {} baud", path, baud);
    let mut builder = serialport::new(path, baud).timeout(SERIAL_READ_TIMEOUT);
    #[cfg(unix)]
    {
        builder = builder
            .data_bits(serialport::DataBits::Eight)
            .stop_bits(serialport::StopBits::One)
            .parity(serialport::Parity::None);
    }
    let mut port = builder.open().map_err(|e| match e.kind() {
        serialport::ErrorKind::NoDevice => TransportError::DeviceNotFound(path.to_string()),
        serialport::ErrorKind::InvalidInput => TransportError::InvalidDevice(path.to_string()),
        _ => TransportError::Serial(format!("{}: {}", path, e)),
    })?;

    // Toggle DTR/RTS so the radio wakes up and starts talking
    let _ = port.write_data_terminal_ready(true);
    let _ = port.write_request_to_send(true);
    tokio::time::sleep(Duration::from_millis(150)).await;

    // Discard boot chatter already sitting in the buffer
    if let Ok(available) = port.bytes_to_read() {
        if available > 0 {
            let mut purge = [0u8; 512];
            let _ = port.read(&mut purge);
        }
    }
    Ok(port)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn tcp_link_reads_writes_and_closes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            sock.write_all(b"hello").await.unwrap();
            let mut buf = [0u8; 3];
            sock.read_exact(&mut buf).await.unwrap();
            buf
        });

        let device = DeviceDescriptor::Tcp {
            host: "127.0.0.1".into(),
            port: addr.port(),
        };
        let link = Link::open(&device, Duration::from_secs(2)).await.unwrap();
        let mut got = Vec::new();
        while got.len() < 5 {
            got.extend(link.read_chunk().await.unwrap());
        }
        assert_eq!(got, b"hello");
        link.write_all(b"abc").await.unwrap();
        assert_eq!(&server.await.unwrap(), b"abc");

        link.close().await;
        assert!(link.is_closed());
        assert!(matches!(link.read_chunk().await, Err(TransportError::Closed)));
    }

    #[cfg(all(feature = "serial", unix))]
    #[tokio::test]
    async fn missing_serial_device_is_configuration_error() {
        let device = DeviceDescriptor::Serial {
            path: "/dev/does-not-exist-meshbridge".into(),
            baud: 115200,
        };
        match Link::open(&device, Duration::from_secs(1)).await {
            Err(e) => assert!(e.is_configuration(), "{e}"),
            Ok(_) => panic!("expected failure"),
        }
    }
}
