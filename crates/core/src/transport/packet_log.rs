//! Binary log of datagram headers.
//!
//! Each record is a big-endian u32 length followed by:
//!
//! ```ascii
//! direction (u8, 0 = inbound, 1 = outbound)
//! unix time in millis (u64)
//! address family (u8, 4 or 6), address (4 or 16 bytes), port (u16)
//! header bytes: fixed header, extra header and up to 4 bytes of message id
//! ```
//!
//! Files are named `packets-<unix secs>.log` and a new one is started once the rotation
//! period has elapsed.

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
use parking_lot::Mutex;

use super::packet_data::HEADER_LEN;
use crate::config::PacketLogConfig;

type DefaultEndian = BigEndian;

/// Message id bytes kept after the header.
const MESSAGE_ID_BYTES: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Direction {
    Inbound = 0,
    Outbound = 1,
}

pub(crate) struct PacketLog {
    directory: PathBuf,
    rotation: Duration,
    current: Mutex<Option<LogFile>>,
}

struct LogFile {
    writer: BufWriter<File>,
    opened_at: Instant,
}

impl PacketLog {
    pub(crate) fn open(config: &PacketLogConfig) -> io::Result<Self> {
        fs::create_dir_all(&config.directory)?;
        tracing::info!(directory = ?config.directory, "Packet header logging enabled");
        Ok(PacketLog {
            directory: config.directory.clone(),
            rotation: config.rotation(),
            current: Mutex::new(None),
        })
    }

    pub(crate) fn record(&self, direction: Direction, remote: SocketAddr, datagram: &[u8]) {
        if let Err(error) = self.try_record(direction, remote, datagram) {
            tracing::warn!(%error, "Failed writing packet log record");
        }
    }

    fn try_record(
        &self,
        direction: Direction,
        remote: SocketAddr,
        datagram: &[u8],
    ) -> io::Result<()> {
        let mut body = Vec::with_capacity(64);
        body.push(direction as u8);
        body.write_u64::<DefaultEndian>(unix_millis())?;
        match remote.ip() {
            IpAddr::V4(ip) => {
                body.push(4);
                body.extend_from_slice(&ip.octets());
            }
            IpAddr::V6(ip) => {
                body.push(6);
                body.extend_from_slice(&ip.octets());
            }
        }
        body.write_u16::<DefaultEndian>(remote.port())?;
        body.extend_from_slice(&datagram[..header_span(datagram)]);

        let mut length = [0u8; 4];
        DefaultEndian::write_u32(&mut length, body.len() as u32);

        let mut current = self.current.lock();
        let now = Instant::now();
        let expired = current
            .as_ref()
            .map_or(true, |file| now.duration_since(file.opened_at) >= self.rotation);
        if expired {
            if let Some(mut previous) = current.take() {
                previous.writer.flush()?;
            }
            *current = Some(self.new_file(now)?);
        }
        let Some(file) = current.as_mut() else {
            return Ok(());
        };
        file.writer.write_all(&length)?;
        file.writer.write_all(&body)?;
        Ok(())
    }

    fn new_file(&self, now: Instant) -> io::Result<LogFile> {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_secs());
        let mut path = self.directory.join(format!("packets-{secs}.log"));
        let mut suffix = 1;
        // rotation periods shorter than a second would otherwise reuse the name
        while path.exists() {
            path = self.directory.join(format!("packets-{secs}-{suffix}.log"));
            suffix += 1;
        }
        tracing::debug!(?path, "Opening packet log");
        Ok(LogFile {
            writer: BufWriter::new(File::create(path)?),
            opened_at: now,
        })
    }

    pub(crate) fn flush(&self) {
        if let Some(file) = self.current.lock().as_mut() {
            if let Err(error) = file.writer.flush() {
                tracing::warn!(%error, "Failed flushing packet log");
            }
        }
    }
}

impl Drop for PacketLog {
    fn drop(&mut self) {
        self.flush();
    }
}

fn header_span(datagram: &[u8]) -> usize {
    let extra = datagram.get(5).copied().unwrap_or(0) as usize;
    (HEADER_LEN + extra + MESSAGE_ID_BYTES).min(datagram.len())
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}
