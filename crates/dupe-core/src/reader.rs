use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::task::JoinHandle;

/// Size of a single read from the pipe.
const READ_CHUNK: usize = 8 * 1024;

/// Incremental line splitter for raw pipe bytes.
///
/// Bytes are buffered until a line terminator (`\n` or `\r`) arrives, so a
/// line split across two reads is delivered once, whole. Lines are trimmed
/// and empty lines are dropped. Splitting on raw bytes is safe for UTF-8
/// because neither terminator can appear inside a multi-byte sequence.
#[derive(Debug, Default)]
pub struct LineAssembler {
    pending: Vec<u8>,
}

impl LineAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of bytes, returning every line it completes.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &byte in chunk {
            if byte == b'\n' || byte == b'\r' {
                if let Some(line) = take_line(&mut self.pending) {
                    lines.push(line);
                }
            } else {
                self.pending.push(byte);
            }
        }
        lines
    }

    /// Flush a trailing line that never got its terminator.
    pub fn finish(&mut self) -> Option<String> {
        take_line(&mut self.pending)
    }
}

fn take_line(buf: &mut Vec<u8>) -> Option<String> {
    let raw = std::mem::take(buf);
    let line = String::from_utf8_lossy(&raw);
    let trimmed = line.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Drains a process output pipe on a background task, delivering each
/// complete, trimmed, non-empty line to a callback in emission order.
///
/// The reader keeps draining independently of the process so the writer
/// never blocks on a full pipe. [`detach`](Self::detach) consumes the reader,
/// so it can happen only once; after it returns the callback is never
/// invoked again.
#[derive(Debug)]
pub struct OutputStreamReader {
    task: JoinHandle<()>,
}

impl OutputStreamReader {
    /// Start draining `stream` on a background task.
    pub fn attach<R, F>(mut stream: R, mut on_line: F) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        F: FnMut(String) + Send + 'static,
    {
        let task = tokio::spawn(async move {
            let mut assembler = LineAssembler::new();
            let mut chunk = vec![0u8; READ_CHUNK];
            loop {
                match stream.read(&mut chunk).await {
                    Ok(0) => break,
                    Ok(n) => {
                        for line in assembler.push(&chunk[..n]) {
                            on_line(line);
                        }
                    }
                    Err(e) => {
                        tracing::debug!(error = %e, "output stream read failed");
                        break;
                    }
                }
            }
            if let Some(line) = assembler.finish() {
                on_line(line);
            }
        });
        Self { task }
    }

    /// Stop reading.
    ///
    /// Waits up to `grace` for the stream to reach EOF so output buffered at
    /// process exit is still delivered, then aborts the drain task. Returns
    /// `true` if the stream was drained to EOF.
    pub async fn detach(self, grace: Duration) -> bool {
        let mut task = self.task;
        match tokio::time::timeout(grace, &mut task).await {
            Ok(_) => true,
            Err(_) => {
                task.abort();
                // Awaiting the aborted task guarantees the callback has returned.
                let _ = task.await;
                tracing::debug!(
                    grace_ms = grace.as_millis() as u64,
                    "output stream still open after grace period, detached"
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tokio::io::AsyncWriteExt;

    #[test]
    fn test_assembler_splits_complete_lines() {
        let mut asm = LineAssembler::new();
        assert_eq!(asm.push(b"one\ntwo\n"), vec!["one", "two"]);
        assert_eq!(asm.finish(), None);
    }

    #[test]
    fn test_assembler_joins_partial_lines() {
        let mut asm = LineAssembler::new();
        assert!(asm.push(b"Creating ima").is_empty());
        assert!(asm.push(b"ge... 4").is_empty());
        assert_eq!(asm.push(b"5%\nnext"), vec!["Creating image... 45%"]);
        assert_eq!(asm.finish(), Some("next".to_string()));
    }

    #[test]
    fn test_assembler_trims_and_drops_blank_lines() {
        let mut asm = LineAssembler::new();
        assert_eq!(asm.push(b"  padded  \n\n   \n\tx\t\n"), vec!["padded", "x"]);
    }

    #[test]
    fn test_assembler_treats_carriage_return_as_terminator() {
        let mut asm = LineAssembler::new();
        assert_eq!(
            asm.push(b"10%\r20%\r30%\r\n"),
            vec!["10%", "20%", "30%"]
        );
    }

    #[test]
    fn test_assembler_keeps_split_utf8_sequences_intact() {
        let bytes = "✅ done\n".as_bytes();
        let mut asm = LineAssembler::new();
        assert!(asm.push(&bytes[..1]).is_empty());
        assert_eq!(asm.push(&bytes[1..]), vec!["✅ done"]);
    }

    #[test]
    fn test_assembler_lossy_on_invalid_utf8() {
        let mut asm = LineAssembler::new();
        let lines = asm.push(b"bad \xff byte\n");
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("bad "));
    }

    #[tokio::test]
    async fn test_reader_delivers_lines_in_order_across_writes() {
        let (mut writer, reader) = tokio::io::duplex(16);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let reader = OutputStreamReader::attach(reader, move |line| {
            sink.lock().expect("lock").push(line);
        });

        writer.write_all(b"first li").await.expect("write");
        writer.write_all(b"ne\nsecond\n\nthi").await.expect("write");
        writer.write_all(b"rd").await.expect("write");
        drop(writer);

        assert!(reader.detach(Duration::from_secs(1)).await);
        assert_eq!(
            *seen.lock().expect("lock"),
            vec!["first line", "second", "third"]
        );
    }

    #[tokio::test]
    async fn test_detach_aborts_open_stream_and_stops_callbacks() {
        let (mut writer, reader) = tokio::io::duplex(64);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let reader = OutputStreamReader::attach(reader, move |line| {
            sink.lock().expect("lock").push(line);
        });

        writer.write_all(b"before\n").await.expect("write");
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Writer stays open, so the reader never sees EOF.
        assert!(!reader.detach(Duration::from_millis(20)).await);
        let _ = writer.write_all(b"after\n").await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(*seen.lock().expect("lock"), vec!["before"]);
    }
}
