//! Blocking-read engine for streaming output files.
//!
//! A [`StreamFile`] accumulates producer batches and delivers each batch to
//! readers exactly once. Readers drive the cycle themselves: after a batch
//! has been fully delivered (a read past the end returned EOF), the next
//! read at offset 0 rearms the buffer and waits for the following batch.
//! This is what makes `while true; do cat X; done` a well-defined pipeline
//! stage instead of a busy-loop.
//!
//! Readiness is a latched event: `mark_ready` may fire before any reader is
//! waiting, and once set it stays set until rearm, so every concurrent
//! reader unblocks. `mark_ready` on an empty buffer is a no-op — a spurious
//! wake would hand the reader an empty read and send it into a tight loop.

use {
    crate::{
        error::Result,
        node::{self, FileOps},
    },
    async_trait::async_trait,
    std::sync::Mutex,
    tokio::sync::Notify,
};

/// How a read behaves while no batch is ready.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StreamMode {
    /// Idle reads return empty immediately; only once the producer has
    /// posted does the file block. Keeps `ls`, stat and tab-completion from
    /// hanging on files that are usually quiet.
    StateAware,

    /// Every read blocks until the producer marks a batch ready, even the
    /// first read with no producer in sight. The source side of a route.
    Blocking,
}

#[derive(Default)]
struct State {
    chunks: Vec<Vec<u8>>,
    ready: bool,
    consumed: bool,
    active: bool,
}

impl State {
    fn content_len(&self) -> u64 {
        self.chunks.iter().map(|c| c.len() as u64).sum()
    }

    fn rearm(&mut self) {
        self.chunks.clear();
        self.ready = false;
        self.consumed = false;
        self.active = false;
    }
}

pub struct StreamFile {
    mode: StreamMode,
    state: Mutex<State>,
    notify: Notify,
}

impl StreamFile {
    pub fn new(mode: StreamMode) -> Self {
        StreamFile {
            mode,
            state: Mutex::new(State::default()),
            notify: Notify::new(),
        }
    }

    /// Append a chunk to the pending batch. Accumulates only — readers stay
    /// blocked until [`mark_ready`](Self::mark_ready). Empty chunks are
    /// dropped so they can never arm the buffer.
    pub fn post(&self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        let mut st = self.state.lock().unwrap();
        st.chunks.push(bytes.to_vec());
        st.active = true;
    }

    /// Signal that the pending batch is complete. No-op when nothing was
    /// posted. Latches until the next rearm.
    pub fn mark_ready(&self) {
        {
            let mut st = self.state.lock().unwrap();
            if st.chunks.is_empty() {
                return;
            }
            st.ready = true;
        }
        self.notify.notify_waiters();
    }

    /// Discard everything and return to the unarmed state. Producers call
    /// this at the start of a logical batch (execution start, capture arm).
    pub fn reset(&self) {
        let mut st = self.state.lock().unwrap();
        st.rearm();
    }

    pub fn is_ready(&self) -> bool {
        self.state.lock().unwrap().ready
    }

    /// Current batch flattened, for producers that need to inspect it.
    pub fn snapshot(&self) -> Vec<u8> {
        let st = self.state.lock().unwrap();
        st.chunks.concat()
    }

    /// The read protocol described in the module docs. Suspends on the
    /// readiness event; never holds the state mutex across a suspension.
    pub async fn read_at(&self, offset: u64, count: u32) -> Vec<u8> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register with the event before inspecting state, otherwise a
            // notify_waiters between the check and the await is lost.
            notified.as_mut().enable();
            {
                let mut st = self.state.lock().unwrap();
                if st.consumed && offset == 0 {
                    st.rearm();
                }
                if st.ready {
                    if offset >= st.content_len() {
                        st.consumed = true;
                        return Vec::new();
                    }
                    let content = st.chunks.concat();
                    return node::slice_at(&content, offset, count);
                }
                if self.mode == StreamMode::StateAware && !st.active {
                    return Vec::new();
                }
            }
            notified.await;
        }
    }
}

#[async_trait]
impl FileOps for StreamFile {
    async fn read(&self, _fid: u32, offset: u64, count: u32) -> Result<Vec<u8>> {
        Ok(self.read_at(offset, count).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{sync::Arc, time::Duration};
    use tokio::time::timeout;

    const SHORT: Duration = Duration::from_millis(50);

    #[tokio::test]
    async fn state_aware_idle_read_returns_empty_immediately() {
        let f = StreamFile::new(StreamMode::StateAware);
        let out = timeout(Duration::from_millis(10), f.read_at(0, 4096))
            .await
            .expect("idle read must not block");
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn blocking_idle_read_blocks() {
        let f = StreamFile::new(StreamMode::Blocking);
        assert!(timeout(SHORT, f.read_at(0, 4096)).await.is_err());
    }

    #[tokio::test]
    async fn state_aware_blocks_once_posted() {
        let f = StreamFile::new(StreamMode::StateAware);
        f.post(b"partial");
        // Posted but not ready: the file is now active and reads block.
        assert!(timeout(SHORT, f.read_at(0, 4096)).await.is_err());
    }

    #[tokio::test]
    async fn mark_ready_on_empty_buffer_does_not_wake() {
        let f = Arc::new(StreamFile::new(StreamMode::Blocking));
        f.post(b"");
        f.mark_ready();
        assert!(timeout(SHORT, f.read_at(0, 4096)).await.is_err());
    }

    #[tokio::test]
    async fn ready_unblocks_and_latches_for_late_readers() {
        let f = Arc::new(StreamFile::new(StreamMode::Blocking));
        let early = {
            let f = f.clone();
            tokio::spawn(async move { f.read_at(0, 4096).await })
        };
        tokio::task::yield_now().await;
        f.post(b"batch one");
        f.mark_ready();
        assert_eq!(early.await.unwrap(), b"batch one");
        // Latched: a reader arriving after the event still sees the batch.
        assert_eq!(f.read_at(0, 4096).await, b"batch one");
    }

    #[tokio::test]
    async fn rearm_delivers_the_next_batch_not_a_stale_prefix() {
        let f = Arc::new(StreamFile::new(StreamMode::Blocking));
        f.post(b"first");
        f.mark_ready();
        assert_eq!(f.read_at(0, 4096).await, b"first");
        assert!(f.read_at(5, 4096).await.is_empty()); // EOF, batch consumed

        let next = {
            let f = f.clone();
            tokio::spawn(async move { f.read_at(0, 4096).await })
        };
        tokio::task::yield_now().await;
        f.post(b"second");
        f.mark_ready();
        assert_eq!(next.await.unwrap(), b"second");
    }

    #[tokio::test]
    async fn chunks_accumulate_into_one_batch() {
        let f = StreamFile::new(StreamMode::StateAware);
        f.post(b"hello ");
        f.post(b"world");
        f.mark_ready();
        assert_eq!(f.read_at(0, 4096).await, b"hello world");
        assert_eq!(f.read_at(6, 4096).await, b"world");
    }

    #[tokio::test]
    async fn concurrent_readers_all_unblock() {
        let f = Arc::new(StreamFile::new(StreamMode::Blocking));
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let f = f.clone();
                tokio::spawn(async move { f.read_at(0, 4096).await })
            })
            .collect();
        tokio::task::yield_now().await;
        f.post(b"fan-out");
        f.mark_ready();
        for r in readers {
            assert_eq!(r.await.unwrap(), b"fan-out");
        }
    }

    #[tokio::test]
    async fn reset_returns_state_aware_file_to_idle() {
        let f = StreamFile::new(StreamMode::StateAware);
        f.post(b"stale");
        f.mark_ready();
        f.reset();
        let out = timeout(Duration::from_millis(10), f.read_at(0, 4096))
            .await
            .expect("reset file must be idle");
        assert!(out.is_empty());
    }
}
