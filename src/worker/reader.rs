//! Pipe reader thread.
//!
//! Reads from the child's combined stdout/stderr on a dedicated thread and
//! forwards what it gets over a channel, so the prompt loop can wait with a
//! deadline instead of sitting in a blocking `read`.

use std::io::{self, ErrorKind, Read};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use log::{debug, warn};

const READ_BUFFER_SIZE: usize = 4096;

/// Retry budget for transient read errors.
const MAX_TRANSIENT_RETRIES: u32 = 8;
const INITIAL_BACKOFF: Duration = Duration::from_millis(1);
const MAX_BACKOFF: Duration = Duration::from_millis(64);

/// What the reader observed on the pipe.
#[derive(Debug)]
pub enum ReadEvent {
    Chunk(Vec<u8>),
    /// End of stream or broken pipe. The child is gone.
    Closed,
    /// A read error that did not clear up within the retry budget.
    Failed(io::Error),
}

/// Spawn the reader. It exits after sending `Closed` or `Failed`, or once
/// the receiving side has been dropped.
pub fn spawn_reader<R>(
    source: R,
    label: String,
) -> io::Result<(Receiver<ReadEvent>, JoinHandle<()>)>
where
    R: Read + Send + 'static,
{
    let (tx, rx) = crossbeam_channel::unbounded();
    let handle = thread::Builder::new()
        .name(format!("pipe-reader-{label}"))
        .spawn(move || read_loop(source, &tx, &label))?;
    Ok((rx, handle))
}

fn read_loop<R: Read>(mut source: R, tx: &Sender<ReadEvent>, label: &str) {
    let mut buffer = [0u8; READ_BUFFER_SIZE];
    let mut retries = 0u32;
    let mut backoff = INITIAL_BACKOFF;

    loop {
        let event = match source.read(&mut buffer) {
            Ok(0) => ReadEvent::Closed,
            Ok(n) => {
                retries = 0;
                backoff = INITIAL_BACKOFF;
                ReadEvent::Chunk(buffer[..n].to_vec())
            }
            Err(e) if e.kind() == ErrorKind::BrokenPipe => ReadEvent::Closed,
            Err(e) if is_transient(&e) && retries < MAX_TRANSIENT_RETRIES => {
                retries += 1;
                debug!("[PIPE_READER] {label}: transient read error ({e}), retry #{retries} in {backoff:?}");
                thread::sleep(backoff);
                backoff = (backoff * 2).min(MAX_BACKOFF);
                continue;
            }
            Err(e) => {
                warn!("[PIPE_READER] {label}: read failed: {e}");
                ReadEvent::Failed(e)
            }
        };

        let terminal = !matches!(event, ReadEvent::Chunk(_));
        if tx.send(event).is_err() || terminal {
            break;
        }
    }
    debug!("[PIPE_READER] {label}: exiting");
}

fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        ErrorKind::Interrupted | ErrorKind::WouldBlock | ErrorKind::TimedOut
    )
}
