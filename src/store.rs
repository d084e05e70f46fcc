//! B-tree backed storage engine.
//!
//! Reads execute inline on the calling reactor thread. Mutations are
//! dispatched as tasks to a small pool of write workers; each task may carry
//! a [`CompletionSink`] through which exactly one reply is posted back to the
//! connection's owning reactor. Tasks without a sink are fire-and-forget
//! (noreply).

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread::JoinHandle;

use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender};
use parking_lot::RwLock;
use tracing::{debug, trace};

use crate::event::ConnId;

/// A stored value with its client-supplied flags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub flags: u32,
    pub value: Bytes,
}

/// A mutation executed by the write workers.
#[derive(Debug)]
pub enum WriteOp {
    Set {
        key: Vec<u8>,
        flags: u32,
        value: Bytes,
    },
    Add {
        key: Vec<u8>,
        flags: u32,
        value: Bytes,
    },
    Replace {
        key: Vec<u8>,
        flags: u32,
        value: Bytes,
    },
    Delete {
        key: Vec<u8>,
    },
    Incr {
        key: Vec<u8>,
        delta: u64,
    },
    Decr {
        key: Vec<u8>,
        delta: u64,
    },
}

/// The result of a completed mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreReply {
    Stored,
    NotStored,
    Deleted,
    NotFound,
    Counter(u64),
    Error(&'static str),
}

/// Channel + waker pair a write worker uses to post a completion to the
/// reactor that owns the target connection.
#[derive(Clone)]
pub struct CompletionSink {
    tx: Sender<(ConnId, StoreReply)>,
    waker: Arc<mio::Waker>,
}

impl CompletionSink {
    pub fn new(tx: Sender<(ConnId, StoreReply)>, waker: Arc<mio::Waker>) -> Self {
        Self { tx, waker }
    }

    /// Post one completion. Errors are ignored: a closed channel means the
    /// owning reactor is gone and the completion is moot.
    pub fn send(&self, conn: ConnId, reply: StoreReply) {
        if self.tx.send((conn, reply)).is_ok() {
            let _ = self.waker.wake();
        }
    }
}

struct Task {
    conn: ConnId,
    op: WriteOp,
    sink: Option<CompletionSink>,
}

/// Handle to the storage engine. Cheap to clone; the write workers exit when
/// the last handle is dropped.
#[derive(Clone)]
pub struct BtreeStore {
    shared: Arc<Shared>,
    tasks: Sender<Task>,
}

/// Join handles for the write worker threads.
pub struct StorePool {
    handles: Vec<JoinHandle<()>>,
}

impl StorePool {
    /// Wait for the write workers to drain and exit. Call after every
    /// [`BtreeStore`] handle has been dropped.
    pub fn join(self) {
        for handle in self.handles {
            let _ = handle.join();
        }
    }
}

struct Shared {
    map: RwLock<BTreeMap<Vec<u8>, Entry>>,
}

impl BtreeStore {
    /// Create the store and spawn `workers` write worker threads.
    pub fn spawn(workers: usize) -> (Self, StorePool) {
        let shared = Arc::new(Shared {
            map: RwLock::new(BTreeMap::new()),
        });
        let (tx, rx) = crossbeam_channel::unbounded::<Task>();

        let mut handles = Vec::with_capacity(workers);
        for id in 0..workers.max(1) {
            let shared = shared.clone();
            let rx: Receiver<Task> = rx.clone();
            let handle = std::thread::Builder::new()
                .name(format!("store-{}", id))
                .spawn(move || {
                    while let Ok(task) = rx.recv() {
                        let reply = shared.apply(task.op);
                        trace!(conn = ?task.conn, reply = ?reply, "write op applied");
                        if let Some(sink) = task.sink {
                            sink.send(task.conn, reply);
                        }
                    }
                    debug!("store worker exiting");
                })
                .expect("failed to spawn store worker");
            handles.push(handle);
        }

        (Self { shared, tasks: tx }, StorePool { handles })
    }

    /// Inline read.
    pub fn get(&self, key: &[u8]) -> Option<Entry> {
        self.shared.map.read().get(key).cloned()
    }

    /// Queue a mutation. With a sink, exactly one completion is posted when
    /// the op finishes; without one, the op is fire-and-forget.
    pub fn dispatch(&self, conn: ConnId, op: WriteOp, sink: Option<CompletionSink>) {
        let _ = self.tasks.send(Task { conn, op, sink });
    }

    /// Number of keys currently stored.
    pub fn len(&self) -> usize {
        self.shared.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.map.read().is_empty()
    }
}

impl Shared {
    fn apply(&self, op: WriteOp) -> StoreReply {
        let mut map = self.map.write();
        match op {
            WriteOp::Set { key, flags, value } => {
                map.insert(key, Entry { flags, value });
                StoreReply::Stored
            }
            WriteOp::Add { key, flags, value } => {
                if map.contains_key(&key) {
                    StoreReply::NotStored
                } else {
                    map.insert(key, Entry { flags, value });
                    StoreReply::Stored
                }
            }
            WriteOp::Replace { key, flags, value } => {
                if map.contains_key(&key) {
                    map.insert(key, Entry { flags, value });
                    StoreReply::Stored
                } else {
                    StoreReply::NotStored
                }
            }
            WriteOp::Delete { key } => {
                if map.remove(&key).is_some() {
                    StoreReply::Deleted
                } else {
                    StoreReply::NotFound
                }
            }
            WriteOp::Incr { key, delta } => adjust(&mut map, key, |n| n.wrapping_add(delta)),
            WriteOp::Decr { key, delta } => adjust(&mut map, key, |n| n.saturating_sub(delta)),
        }
    }
}

/// Counter update shared by incr/decr: the value must be ASCII decimal and
/// the result is stored back as ASCII decimal.
fn adjust(
    map: &mut BTreeMap<Vec<u8>, Entry>,
    key: Vec<u8>,
    f: impl FnOnce(u64) -> u64,
) -> StoreReply {
    let entry = match map.get_mut(&key) {
        Some(e) => e,
        None => return StoreReply::NotFound,
    };
    let current: u64 = match std::str::from_utf8(&entry.value)
        .ok()
        .and_then(|s| s.parse().ok())
    {
        Some(n) => n,
        None => return StoreReply::Error("cannot increment or decrement non-numeric value"),
    };
    let next = f(current);
    let mut buf = itoa::Buffer::new();
    entry.value = Bytes::copy_from_slice(buf.format(next).as_bytes());
    StoreReply::Counter(next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mio::{Poll, Token, Waker};
    use std::time::Duration;

    fn sink() -> (CompletionSink, Receiver<(ConnId, StoreReply)>, Poll) {
        let poll = Poll::new().unwrap();
        let waker = Arc::new(Waker::new(poll.registry(), Token(0)).unwrap());
        let (tx, rx) = crossbeam_channel::unbounded();
        (CompletionSink::new(tx, waker), rx, poll)
    }

    fn set_op(key: &[u8], value: &[u8]) -> WriteOp {
        WriteOp::Set {
            key: key.to_vec(),
            flags: 0,
            value: Bytes::copy_from_slice(value),
        }
    }

    #[test]
    fn set_then_get_roundtrip() {
        let (store, pool) = BtreeStore::spawn(1);
        let (sink, rx, _poll) = sink();
        let conn = ConnId::new(0, 0);

        store.dispatch(conn, set_op(b"k", b"hello"), Some(sink));
        let (got_conn, reply) = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(got_conn, conn);
        assert_eq!(reply, StoreReply::Stored);

        let entry = store.get(b"k").unwrap();
        assert_eq!(&entry.value[..], b"hello");

        drop(store);
        pool.join();
    }

    #[test]
    fn add_respects_existing_keys() {
        let (store, pool) = BtreeStore::spawn(1);
        let (sink, rx, _poll) = sink();
        let conn = ConnId::new(0, 0);

        store.dispatch(
            conn,
            WriteOp::Add {
                key: b"k".to_vec(),
                flags: 0,
                value: Bytes::from_static(b"one"),
            },
            Some(sink.clone()),
        );
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(1)).unwrap().1,
            StoreReply::Stored
        );

        store.dispatch(
            conn,
            WriteOp::Add {
                key: b"k".to_vec(),
                flags: 0,
                value: Bytes::from_static(b"two"),
            },
            Some(sink),
        );
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(1)).unwrap().1,
            StoreReply::NotStored
        );
        assert_eq!(&store.get(b"k").unwrap().value[..], b"one");

        drop(store);
        pool.join();
    }

    #[test]
    fn replace_requires_existing_key() {
        let (store, pool) = BtreeStore::spawn(1);
        let (sink, rx, _poll) = sink();
        let conn = ConnId::new(0, 0);

        store.dispatch(
            conn,
            WriteOp::Replace {
                key: b"missing".to_vec(),
                flags: 0,
                value: Bytes::from_static(b"x"),
            },
            Some(sink),
        );
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(1)).unwrap().1,
            StoreReply::NotStored
        );

        drop(store);
        pool.join();
    }

    #[test]
    fn delete_reports_presence() {
        let (store, pool) = BtreeStore::spawn(1);
        let (sink, rx, _poll) = sink();
        let conn = ConnId::new(0, 0);

        store.dispatch(conn, set_op(b"k", b"v"), Some(sink.clone()));
        rx.recv_timeout(Duration::from_secs(1)).unwrap();

        store.dispatch(
            conn,
            WriteOp::Delete { key: b"k".to_vec() },
            Some(sink.clone()),
        );
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(1)).unwrap().1,
            StoreReply::Deleted
        );

        store.dispatch(conn, WriteOp::Delete { key: b"k".to_vec() }, Some(sink));
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(1)).unwrap().1,
            StoreReply::NotFound
        );

        drop(store);
        pool.join();
    }

    #[test]
    fn counter_semantics() {
        let (store, pool) = BtreeStore::spawn(1);
        let (sink, rx, _poll) = sink();
        let conn = ConnId::new(0, 0);

        store.dispatch(conn, set_op(b"c", b"10"), Some(sink.clone()));
        rx.recv_timeout(Duration::from_secs(1)).unwrap();

        store.dispatch(
            conn,
            WriteOp::Incr {
                key: b"c".to_vec(),
                delta: 5,
            },
            Some(sink.clone()),
        );
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(1)).unwrap().1,
            StoreReply::Counter(15)
        );

        // decr saturates at zero
        store.dispatch(
            conn,
            WriteOp::Decr {
                key: b"c".to_vec(),
                delta: 100,
            },
            Some(sink.clone()),
        );
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(1)).unwrap().1,
            StoreReply::Counter(0)
        );
        assert_eq!(&store.get(b"c").unwrap().value[..], b"0");

        // non-numeric values refuse arithmetic
        store.dispatch(conn, set_op(b"s", b"abc"), Some(sink.clone()));
        rx.recv_timeout(Duration::from_secs(1)).unwrap();
        store.dispatch(
            conn,
            WriteOp::Incr {
                key: b"s".to_vec(),
                delta: 1,
            },
            Some(sink),
        );
        assert!(matches!(
            rx.recv_timeout(Duration::from_secs(1)).unwrap().1,
            StoreReply::Error(_)
        ));

        drop(store);
        pool.join();
    }

    #[test]
    fn noreply_dispatch_posts_nothing() {
        let (store, pool) = BtreeStore::spawn(1);
        let (_sink, rx, _poll) = sink();
        let conn = ConnId::new(0, 0);

        store.dispatch(conn, set_op(b"k", b"v"), None);

        // The write lands without any completion being posted.
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
        assert_eq!(&store.get(b"k").unwrap().value[..], b"v");

        drop(store);
        pool.join();
    }
}
