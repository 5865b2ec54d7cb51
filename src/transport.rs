//! `BlockTransport`: the external collaborator that turns `(file_id,
//! chunk_index, destination_buffer)` into bytes. NVMe submission, DMA setup,
//! and extent-tree lookups live on the other side of this trait and are out
//! of scope for this crate.

use std::sync::Arc;

/// Error surfaced by a transport's `submit`/completion path. Converted into
/// [`crate::error::CoreError::TransportError`] at the firehose boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportError {
    pub chunk_id: u64,
    pub reason: String,
}

/// A single completion: how many bytes actually landed in the destination
/// buffer (may be less than a full chunk for the final chunk of a file).
#[derive(Debug, Clone, Copy)]
pub struct Completion {
    pub chunk_id: u64,
    pub filled_bytes: u32,
}

pub type CompletionResult = Result<Completion, TransportError>;

/// Callback invoked by the transport once a submitted command completes.
/// Boxed so `FirehoseCtrl` can close over per-submission state (the target
/// SPCB, the channel, whether this was an OnTrack or derailed request).
pub type CompletionCallback = Box<dyn FnOnce(CompletionResult) + Send>;

/// Asynchronous bulk-read transport. Implementors deliver bytes into
/// `destination` and later invoke `on_complete` with the number of bytes
/// filled; `destination` must stay valid until the callback fires.
pub trait BlockTransport: Send + Sync {
    /// Submit a read of up to `len` bytes at `chunk_index` (logical chunk,
    /// not byte offset) of `file_id` into `destination`. Returns immediately;
    /// completion is asynchronous via `on_complete`.
    fn submit(
        &self,
        file_id: u32,
        chunk_index: u64,
        destination: *mut u8,
        len: usize,
        on_complete: CompletionCallback,
    );
}

/// In-memory test double. Completes every submission synchronously (or, if
/// configured with a delay queue, on a later `drain` call) with a
/// caller-specified fill size, copying from an in-memory file image so tests
/// can assert on bytes observed through the switchboard.
pub struct FakeBlockTransport {
    inner: parking_lot::Mutex<FakeTransportState>,
}

struct FakeTransportState {
    /// file_id -> concatenated bytes for that file.
    files: std::collections::HashMap<u32, Arc<Vec<u8>>>,
    /// Pending submissions when `synchronous = false`.
    pending: Vec<PendingSubmission>,
    synchronous: bool,
    fail_chunk: Option<u64>,
}

struct PendingSubmission {
    chunk_id: u64,
    destination: usize,
    len: usize,
    bytes: Arc<Vec<u8>>,
    offset: usize,
    on_complete: CompletionCallback,
}

// SAFETY: `destination` pointers are only dereferenced on the thread that
// later calls `drain`/`submit`, matching how the real transport would hand
// the buffer back to the same completion path that owns it.
unsafe impl Send for PendingSubmission {}

impl FakeBlockTransport {
    pub fn new(synchronous: bool) -> Self {
        Self {
            inner: parking_lot::Mutex::new(FakeTransportState {
                files: std::collections::HashMap::new(),
                pending: Vec::new(),
                synchronous,
                fail_chunk: None,
            }),
        }
    }

    pub fn register_file(&self, file_id: u32, bytes: Vec<u8>) {
        self.inner.lock().files.insert(file_id, Arc::new(bytes));
    }

    /// Forces the next submission for `chunk_id` to complete with a
    /// transport error, for exercising derailment/error paths.
    pub fn fail_next(&self, chunk_id: u64) {
        self.inner.lock().fail_chunk = Some(chunk_id);
    }

    /// Runs every pending (non-synchronous) submission to completion.
    pub fn drain(&self) {
        let pending = std::mem::take(&mut self.inner.lock().pending);
        for p in pending {
            Self::complete(p);
        }
    }

    fn complete(p: PendingSubmission) {
        let dst = p.destination as *mut u8;
        let copy_len = p.len.min(p.bytes.len().saturating_sub(p.offset));
        unsafe {
            std::ptr::copy_nonoverlapping(p.bytes[p.offset..].as_ptr(), dst, copy_len);
        }
        (p.on_complete)(Ok(Completion {
            chunk_id: p.chunk_id,
            filled_bytes: copy_len as u32,
        }));
    }
}

impl BlockTransport for FakeBlockTransport {
    fn submit(
        &self,
        file_id: u32,
        chunk_index: u64,
        destination: *mut u8,
        len: usize,
        on_complete: CompletionCallback,
    ) {
        let mut state = self.inner.lock();
        if state.fail_chunk == Some(chunk_index) {
            state.fail_chunk = None;
            drop(state);
            on_complete(Err(TransportError {
                chunk_id: chunk_index,
                reason: "injected failure".to_string(),
            }));
            return;
        }
        let bytes = state
            .files
            .get(&file_id)
            .cloned()
            .unwrap_or_else(|| Arc::new(Vec::new()));
        let offset = (chunk_index as usize) * len;
        let synchronous = state.synchronous;
        let submission = PendingSubmission {
            chunk_id: chunk_index,
            destination: destination as usize,
            len,
            bytes,
            offset,
            on_complete,
        };
        if synchronous {
            drop(state);
            Self::complete(submission);
        } else {
            state.pending.push(submission);
        }
    }
}
