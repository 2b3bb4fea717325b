//! In-memory byte pipes connecting pipeline stages.
//!
//! A bounded chunk channel with a [`Write`] half and a [`Read`] half. When
//! the reader is dropped, writes fail with `BrokenPipe` — the same signal a
//! process pipeline would deliver — and when the writer is dropped the
//! reader sees EOF.

use std::io::{self, Read, Write};
use std::sync::mpsc::{Receiver, SyncSender, sync_channel};

const CHANNEL_DEPTH: usize = 64;

pub fn pipe() -> (PipeWriter, PipeReader) {
    let (tx, rx) = sync_channel(CHANNEL_DEPTH);
    (
        PipeWriter { tx },
        PipeReader {
            rx,
            current: Vec::new(),
            pos: 0,
        },
    )
}

pub struct PipeWriter {
    tx: SyncSender<Vec<u8>>,
}

impl Write for PipeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.tx
            .send(buf.to_vec())
            .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

pub struct PipeReader {
    rx: Receiver<Vec<u8>>,
    current: Vec<u8>,
    pos: usize,
}

impl Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.pos >= self.current.len() {
            match self.rx.recv() {
                Ok(chunk) => {
                    self.current = chunk;
                    self.pos = 0;
                }
                // All writers gone: EOF.
                Err(_) => return Ok(0),
            }
        }
        let n = (self.current.len() - self.pos).min(buf.len());
        buf[..n].copy_from_slice(&self.current[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader};

    #[test]
    fn bytes_round_trip() {
        let (mut w, r) = pipe();
        let writer = std::thread::spawn(move || {
            w.write_all(b"hello\nworld\n").unwrap();
        });
        let mut lines = BufReader::new(r).lines();
        assert_eq!(lines.next().unwrap().unwrap(), "hello");
        assert_eq!(lines.next().unwrap().unwrap(), "world");
        assert!(lines.next().is_none());
        writer.join().unwrap();
    }

    #[test]
    fn dropped_reader_breaks_the_pipe() {
        let (mut w, r) = pipe();
        drop(r);
        // The channel may absorb a buffered chunk; keep writing until the
        // break surfaces.
        let err = loop {
            if let Err(e) = w.write_all(b"x") {
                break e;
            }
        };
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }
}
