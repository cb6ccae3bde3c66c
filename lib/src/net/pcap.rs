//! Classic pcap capture of frames crossing the interface.
//!
//! Writing happens on a dedicated thread behind a bounded queue so a slow
//! writer never stalls packet processing; frames that do not fit are counted
//! and dropped.

use std::{
    io::Write,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{SystemTime, UNIX_EPOCH},
};

use crossbeam_channel::{Receiver, Sender};
use tracing::warn;

/// Classic pcap magic, microsecond timestamps.
const PCAP_MAGIC: u32 = 0xa1b2c3d4;

/// LINKTYPE_ETHERNET.
const LINKTYPE_ETHERNET: u32 = 1;

/// Bytes kept per captured frame.
pub const SNAP_LEN: u32 = 65535;

/// Frames buffered for the writer thread before dropping.
const QUEUE_DEPTH: usize = 1024;

/// Counters exposed alongside a capture.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PcapStats {
    pub captured: u64,
    pub dropped: u64,
}

pub(crate) struct PcapHandle {
    tx: Sender<(SystemTime, Vec<u8>)>,
    captured: Arc<AtomicU64>,
    dropped: Arc<AtomicU64>,
}

impl PcapHandle {
    /// Start a capture writing to `writer`. The global header goes out
    /// before any frames.
    pub(crate) fn new(writer: Box<dyn Write + Send>) -> Self {
        let (tx, rx) = crossbeam_channel::bounded(QUEUE_DEPTH);
        std::thread::Builder::new()
            .name("pcap-writer".to_string())
            .spawn(move || write_loop(writer, rx))
            .expect("spawn pcap writer");
        Self {
            tx,
            captured: Arc::new(AtomicU64::new(0)),
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Capture one frame. Never blocks: a full queue drops the frame and
    /// bumps the counter.
    pub(crate) fn capture(&self, frame: &[u8]) {
        let snapped = &frame[..frame.len().min(SNAP_LEN as usize)];
        match self.tx.try_send((SystemTime::now(), snapped.to_vec())) {
            Ok(()) => {
                self.captured.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub(crate) fn stats(&self) -> PcapStats {
        PcapStats {
            captured: self.captured.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

fn write_loop(mut writer: Box<dyn Write + Send>, rx: Receiver<(SystemTime, Vec<u8>)>) {
    if let Err(err) = write_global_header(&mut writer) {
        warn!(?err, "pcap: global header write failed");
        return;
    }
    while let Ok((timestamp, frame)) = rx.recv() {
        if let Err(err) = write_record(&mut writer, timestamp, &frame) {
            warn!(?err, "pcap: record write failed; stopping capture");
            return;
        }
    }
    let _ = writer.flush();
}

fn write_global_header(writer: &mut impl Write) -> std::io::Result<()> {
    writer.write_all(&PCAP_MAGIC.to_le_bytes())?;
    writer.write_all(&2u16.to_le_bytes())?; // major
    writer.write_all(&4u16.to_le_bytes())?; // minor
    writer.write_all(&0i32.to_le_bytes())?; // thiszone
    writer.write_all(&0u32.to_le_bytes())?; // sigfigs
    writer.write_all(&SNAP_LEN.to_le_bytes())?;
    writer.write_all(&LINKTYPE_ETHERNET.to_le_bytes())
}

fn write_record(
    writer: &mut impl Write,
    timestamp: SystemTime,
    frame: &[u8],
) -> std::io::Result<()> {
    let since_epoch = timestamp.duration_since(UNIX_EPOCH).unwrap_or_default();
    writer.write_all(&(since_epoch.as_secs() as u32).to_le_bytes())?;
    writer.write_all(&since_epoch.subsec_micros().to_le_bytes())?;
    writer.write_all(&(frame.len() as u32).to_le_bytes())?; // included
    writer.write_all(&(frame.len() as u32).to_le_bytes())?; // original
    writer.write_all(frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().expect("lock").extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn header_and_records_are_classic_pcap() {
        let buf = SharedBuf::default();
        let handle = PcapHandle::new(Box::new(buf.clone()));
        handle.capture(&[0xaa; 60]);

        // The writer thread drains asynchronously.
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
        loop {
            let written = buf.0.lock().expect("lock").clone();
            if written.len() >= 24 + 16 + 60 {
                assert_eq!(&written[0..4], &PCAP_MAGIC.to_le_bytes());
                assert_eq!(&written[20..24], &LINKTYPE_ETHERNET.to_le_bytes());
                // Record header: included and original length both 60.
                assert_eq!(&written[32..36], &60u32.to_le_bytes());
                assert_eq!(&written[36..40], &60u32.to_le_bytes());
                assert_eq!(&written[40..100], &[0xaa; 60][..]);
                break;
            }
            assert!(std::time::Instant::now() < deadline, "pcap never flushed");
            std::thread::yield_now();
        }
        assert_eq!(handle.stats().captured, 1);
        assert_eq!(handle.stats().dropped, 0);
    }
}
