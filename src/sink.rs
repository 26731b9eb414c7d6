//! Write sink seam.
//!
//! The shuffler does not own storage. Its only contract with the indexed
//! log directory underneath is a pair of delivery entry points: the
//! native path for records that stay on the originating rank, and the
//! foreign path for records arriving from (or routed as if from) another
//! rank. The two flavors are distinct on purpose: the sink tags foreign
//! records differently, and benchmarking the RPC path relies on being able
//! to force local records through the foreign entry.

use std::sync::Mutex;

/// The sink rejected a record.
#[derive(Debug, thiserror::Error)]
#[error("sink write failed: {0}")]
pub struct SinkError(pub String);

/// Local append-only record sink, per-rank.
pub trait ParticleSink: Send + Sync {
    /// Direct write of a record the local rank owns (local-bypass path).
    fn native_write(&self, fname: &[u8], data: &[u8], epoch: u32) -> Result<(), SinkError>;

    /// Write of a record on behalf of another rank (shuffled path).
    fn foreign_write(&self, fname: &[u8], data: &[u8], epoch: u32) -> Result<(), SinkError>;
}

/// Which sink entry a record arrived through
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteFlavor {
    Native,
    Foreign,
}

/// A captured record, for inspection in tests and the bench driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedWrite {
    pub fname: Vec<u8>,
    pub data: Vec<u8>,
    pub epoch: u32,
    pub flavor: WriteFlavor,
}

/// In-memory sink that records every delivery.
#[derive(Default)]
pub struct MemorySink {
    writes: Mutex<Vec<CapturedWrite>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn writes(&self) -> Vec<CapturedWrite> {
        self.writes.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.writes.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of captured records labeled with the given epoch.
    pub fn count_epoch(&self, epoch: u32) -> usize {
        self.writes
            .lock()
            .unwrap()
            .iter()
            .filter(|w| w.epoch == epoch)
            .count()
    }

    fn push(&self, fname: &[u8], data: &[u8], epoch: u32, flavor: WriteFlavor) {
        self.writes.lock().unwrap().push(CapturedWrite {
            fname: fname.to_vec(),
            data: data.to_vec(),
            epoch,
            flavor,
        });
    }
}

impl ParticleSink for MemorySink {
    fn native_write(&self, fname: &[u8], data: &[u8], epoch: u32) -> Result<(), SinkError> {
        self.push(fname, data, epoch, WriteFlavor::Native);
        Ok(())
    }

    fn foreign_write(&self, fname: &[u8], data: &[u8], epoch: u32) -> Result<(), SinkError> {
        self.push(fname, data, epoch, WriteFlavor::Foreign);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_sink_captures_flavor() {
        let sink = MemorySink::new();
        sink.native_write(b"aaa", b"xx", 0).unwrap();
        sink.foreign_write(b"bbb", b"yy", 1).unwrap();

        let writes = sink.writes();
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[0].flavor, WriteFlavor::Native);
        assert_eq!(writes[1].flavor, WriteFlavor::Foreign);
        assert_eq!(sink.count_epoch(1), 1);
    }
}
