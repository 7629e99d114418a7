//! Fid table and file-op dispatch.
//!
//! The dispatcher tracks open handles and routes `walk/open/read/write/
//! clunk` to tree nodes. Reads run on their own task so that a reader
//! blocked on a streaming file never stalls writes on other fids; the
//! spawned task's abort handle is kept on the fid and fired on clunk, which
//! is how a client cancels a blocked read (it closes the file).
//!
//! Writes to the same fid are serialized FIFO through a per-fid async
//! mutex. Writes to different fids of the same file are deliberately not
//! ordered with each other; files that care key their scratch by fid.

use {
    crate::{
        error::{Error, Result},
        node::{self, Node, OpenMode},
    },
    log::debug,
    std::{
        collections::HashMap,
        io,
        sync::{
            Arc, Mutex,
            atomic::{AtomicU32, Ordering},
        },
    },
    tokio::{sync::RwLock, task::AbortHandle},
};

/// In-flight reads of one fid, plus the tombstone a clunk leaves behind.
/// Both live under one mutex: a clunk's abort sweep and a read's handle
/// registration must exclude each other, or a read spawned in between is
/// never cancelled.
#[derive(Default)]
struct ReadState {
    tasks: Vec<AbortHandle>,
    clunked: bool,
}

/// An open handle. The node reference borrows the tree; per-file scratch is
/// owned by the file itself, keyed by [`Fid::id`].
pub struct Fid {
    pub id: u32,
    pub node: Node,
    mode: Mutex<Option<OpenMode>>,
    reads: Mutex<ReadState>,
    write_gate: tokio::sync::Mutex<()>,
}

impl Fid {
    fn new(id: u32, node: Node) -> Arc<Fid> {
        Arc::new(Fid {
            id,
            node,
            mode: Mutex::new(None),
            reads: Mutex::new(ReadState::default()),
            write_gate: tokio::sync::Mutex::new(()),
        })
    }

    fn mode(&self) -> Option<OpenMode> {
        *self.mode.lock().unwrap()
    }
}

/// The op surface a transport (9P codec, FUSE bridge, in-process client)
/// drives. Fids are server-assigned and unique within this dispatcher.
pub struct Dispatch {
    root: Node,
    fids: RwLock<HashMap<u32, Arc<Fid>>>,
    next_fid: AtomicU32,
}

impl Dispatch {
    pub fn new(root: Node) -> Arc<Dispatch> {
        Arc::new(Dispatch {
            root,
            fids: RwLock::new(HashMap::new()),
            next_fid: AtomicU32::new(1),
        })
    }

    pub fn root(&self) -> Node {
        self.root.clone()
    }

    async fn get(&self, fid: u32) -> Result<Arc<Fid>> {
        let fids = self.fids.read().await;
        fids.get(&fid).cloned().ok_or(Error::BadFid(fid))
    }

    async fn insert(&self, node: Node) -> u32 {
        let id = self.next_fid.fetch_add(1, Ordering::Relaxed);
        let mut fids = self.fids.write().await;
        fids.insert(id, Fid::new(id, node));
        id
    }

    /// Bind a fresh fid to the tree root.
    pub async fn attach(&self) -> u32 {
        let fid = self.insert(self.root.clone()).await;
        debug!("attach -> fid {fid}");
        fid
    }

    /// Walk from `fid` along `components`, binding the destination to a new
    /// fid. The original fid stays valid. An empty walk duplicates.
    pub async fn walk(&self, fid: u32, components: &[&str]) -> Result<u32> {
        let from = self.get(fid).await?;
        let dest = from.node.walk(components)?;
        let newfid = self.insert(dest).await;
        debug!("walk fid {fid} {components:?} -> fid {newfid}");
        Ok(newfid)
    }

    pub async fn open(&self, fid: u32, mode: OpenMode) -> Result<()> {
        let f = self.get(fid).await?;
        if f.node.is_dir() && mode.contains(OpenMode::WRITE) {
            return Err(Error::Permission);
        }
        *f.mode.lock().unwrap() = Some(mode);
        Ok(())
    }

    /// Read dispatched as an independent task. Returns the bytes, an empty
    /// vec at EOF, or `Io` if the read was cancelled by a concurrent clunk.
    pub async fn read(&self, fid: u32, offset: u64, count: u32) -> Result<Vec<u8>> {
        let f = self.get(fid).await?;
        match f.mode() {
            Some(m) if m.contains(OpenMode::READ) => {}
            _ => return Err(Error::Permission),
        }

        let node = f.node.clone();
        let task = tokio::spawn(async move {
            match &node {
                Node::Dir(d) => Ok(node::slice_at(d.listing().as_bytes(), offset, count)),
                Node::File(file) => file.ops.read(fid, offset, count).await,
            }
        });
        {
            let mut reads = f.reads.lock().unwrap();
            reads.tasks.retain(|h| !h.is_finished());
            reads.tasks.push(task.abort_handle());
            if reads.clunked {
                // A concurrent clunk swept before this read registered.
                task.abort();
            }
        }

        match task.await {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Err(Error::Io(io::Error::new(
                io::ErrorKind::Interrupted,
                "read cancelled by clunk",
            ))),
            Err(e) => Err(Error::Io(io::Error::other(e))),
        }
    }

    /// Write, serialized per fid in call order.
    pub async fn write(&self, fid: u32, offset: u64, data: &[u8]) -> Result<u32> {
        let f = self.get(fid).await?;
        match f.mode() {
            Some(m) if m.contains(OpenMode::WRITE) => {}
            _ => return Err(Error::Permission),
        }

        let _gate = f.write_gate.lock().await;
        match &f.node {
            Node::Dir(_) => Err(Error::Permission),
            Node::File(file) => file.ops.write(fid, offset, data).await,
        }
    }

    /// Release the fid: cancel any blocked reads, notify the file so it can
    /// free per-fid scratch, drop the handle.
    pub async fn clunk(&self, fid: u32) -> Result<()> {
        let f = {
            let mut fids = self.fids.write().await;
            fids.remove(&fid).ok_or(Error::BadFid(fid))?
        };
        {
            let mut reads = f.reads.lock().unwrap();
            reads.clunked = true;
            for h in reads.tasks.iter() {
                h.abort();
            }
        }
        if let Node::File(file) = &f.node {
            file.ops.clunk(fid).await;
        }
        debug!("clunk fid {fid}");
        Ok(())
    }

    /// Convenience for in-process clients (route workers, tests):
    /// attach + walk + open in one call.
    pub async fn open_path(&self, path: &str, mode: OpenMode) -> Result<u32> {
        let components: Vec<&str> = path.split('/').filter(|c| !c.is_empty()).collect();
        let root = self.attach().await;
        let fid = match self.walk(root, &components).await {
            Ok(fid) => fid,
            Err(e) => {
                let _ = self.clunk(root).await;
                return Err(e);
            }
        };
        let _ = self.clunk(root).await;
        self.open(fid, mode).await?;
        Ok(fid)
    }

    /// Whether `path` names a node in this tree.
    pub fn resolves(&self, path: &str) -> bool {
        let components: Vec<&str> = path.split('/').filter(|c| !c.is_empty()).collect();
        self.root.walk(&components).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        node::{Dir, FileNode, FileOps},
        stream::{StreamFile, StreamMode},
    };
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::time::timeout;

    struct Static(&'static [u8]);

    #[async_trait]
    impl FileOps for Static {
        async fn read(&self, _fid: u32, offset: u64, count: u32) -> Result<Vec<u8>> {
            Ok(node::slice_at(self.0, offset, count))
        }
    }

    struct Sink;

    #[async_trait]
    impl FileOps for Sink {
        async fn read(&self, _fid: u32, _offset: u64, _count: u32) -> Result<Vec<u8>> {
            Ok(Vec::new())
        }

        async fn write(&self, _fid: u32, _offset: u64, data: &[u8]) -> Result<u32> {
            Ok(data.len() as u32)
        }
    }

    fn fixture() -> Arc<Dispatch> {
        let root = Dir::new("/");
        root.add(FileNode::new("hello", Arc::new(Static(b"hello world\n"))));
        root.add(FileNode::new("sink", Arc::new(Sink)));
        root.add(FileNode::new(
            "stream",
            Arc::new(StreamFile::new(StreamMode::Blocking)),
        ));
        Dispatch::new(Node::Dir(root))
    }

    #[tokio::test]
    async fn walk_open_read() {
        let d = fixture();
        let root = d.attach().await;
        let fid = d.walk(root, &["hello"]).await.unwrap();
        d.open(fid, OpenMode::READ).await.unwrap();
        assert_eq!(d.read(fid, 0, 4096).await.unwrap(), b"hello world\n");
        assert_eq!(d.read(fid, 6, 4096).await.unwrap(), b"world\n");
        assert!(d.read(fid, 12, 4096).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn directory_read_lists_children_in_order() {
        let d = fixture();
        let root = d.attach().await;
        d.open(root, OpenMode::READ).await.unwrap();
        assert_eq!(d.read(root, 0, 4096).await.unwrap(), b"hello\nsink\nstream\n");
    }

    #[tokio::test]
    async fn write_to_read_only_file_is_permission() {
        let d = fixture();
        let fid = d.open_path("/hello", OpenMode::rdwr()).await.unwrap();
        assert!(matches!(
            d.write(fid, 0, b"x").await,
            Err(Error::Permission)
        ));
    }

    #[tokio::test]
    async fn unopened_fid_cannot_read() {
        let d = fixture();
        let root = d.attach().await;
        let fid = d.walk(root, &["hello"]).await.unwrap();
        assert!(matches!(d.read(fid, 0, 16).await, Err(Error::Permission)));
    }

    #[tokio::test]
    async fn walk_to_missing_child_is_not_found() {
        let d = fixture();
        let root = d.attach().await;
        assert!(matches!(
            d.walk(root, &["nope"]).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn clunked_fid_is_gone() {
        let d = fixture();
        let fid = d.open_path("/hello", OpenMode::READ).await.unwrap();
        d.clunk(fid).await.unwrap();
        assert!(matches!(d.read(fid, 0, 16).await, Err(Error::BadFid(_))));
        assert!(matches!(d.clunk(fid).await, Err(Error::BadFid(_))));
    }

    #[tokio::test]
    async fn blocked_read_does_not_delay_writes_on_other_fids() {
        let d = fixture();
        let blocked = d.open_path("/stream", OpenMode::READ).await.unwrap();
        let reader = {
            let d = d.clone();
            tokio::spawn(async move { d.read(blocked, 0, 4096).await })
        };
        tokio::task::yield_now().await;

        let w = d.open_path("/sink", OpenMode::WRITE).await.unwrap();
        let n = timeout(Duration::from_millis(50), d.write(w, 0, b"through"))
            .await
            .expect("write must not wait on the blocked reader")
            .unwrap();
        assert_eq!(n, 7);
        reader.abort();
    }

    #[tokio::test]
    async fn clunk_cancels_a_blocked_read() {
        let d = fixture();
        let fid = d.open_path("/stream", OpenMode::READ).await.unwrap();
        let reader = {
            let d = d.clone();
            tokio::spawn(async move { d.read(fid, 0, 4096).await })
        };
        tokio::task::yield_now().await;
        d.clunk(fid).await.unwrap();

        let res = timeout(Duration::from_millis(200), reader)
            .await
            .expect("clunk must unblock the reader")
            .unwrap();
        assert!(matches!(res, Err(Error::Io(_))));
    }
}
