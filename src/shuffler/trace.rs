//! Per-record trace log for testing mode.
//!
//! When a test log path is configured, every routed record leaves one line
//! here: `[SEND]` for records handed to the RPC path, `[LO]` for
//! local-bypass records and `[RECV]` on the receiving side. Lines carry an
//! xxh32 checksum of the payload so a post-run script can match sends to
//! receives. Not meant for production runs.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

use crate::comm::Rank;

pub struct TraceLog {
    file: Mutex<File>,
}

impl TraceLog {
    pub fn create(path: &Path) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }

    pub fn send(&self, fname: &[u8], len: usize, epoch: u32, from: Rank, to: Rank, hash: u32) {
        self.line(format_args!(
            "[SEND] {} {} bytes (e{}) r{} >> r{} (hash={:08x})",
            String::from_utf8_lossy(fname),
            len,
            epoch,
            from,
            to,
            hash
        ));
    }

    pub fn local(&self, fname: &[u8], len: usize, epoch: u32, hash: u32) {
        self.line(format_args!(
            "[LO] {} {} bytes (e{}) (hash={:08x})",
            String::from_utf8_lossy(fname),
            len,
            epoch,
            hash
        ));
    }

    pub fn recv(&self, fname: &[u8], len: usize, epoch: u32, at: Rank, from: Rank, hash: u32) {
        self.line(format_args!(
            "[RECV] {} {} bytes (e{}) r{} << r{} (hash={:08x})",
            String::from_utf8_lossy(fname),
            len,
            epoch,
            at,
            from,
            hash
        ));
    }

    fn line(&self, args: std::fmt::Arguments<'_>) {
        let mut file = self.file.lock().unwrap();
        // tracing errors here must not fail the write path
        let _ = writeln!(file, "{}", args);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trace_lines() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("shufflefs_trace_{}.log", std::process::id()));
        let _ = std::fs::remove_file(&path);

        let log = TraceLog::create(&path).unwrap();
        log.send(b"p1", 16, 0, 1, 2, 0xdead);
        log.local(b"p2", 16, 0, 0xbeef);
        log.recv(b"p1", 16, 0, 2, 1, 0xdead);
        drop(log);

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = contents.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "[SEND] p1 16 bytes (e0) r1 >> r2 (hash=0000dead)");
        assert_eq!(lines[1], "[LO] p2 16 bytes (e0) (hash=0000beef)");
        assert_eq!(lines[2], "[RECV] p1 16 bytes (e0) r2 << r1 (hash=0000dead)");

        let _ = std::fs::remove_file(&path);
    }
}
