//! Bridges `fuser`'s synchronous kernel-thread callbacks onto the async
//! `studip-core` resolver (spec §5): every request is funneled through a
//! single channel to one task, so node-tree mutation never needs per-node
//! locking beyond what `Resolver` already does internally.

use std::ffi::OsStr;
use std::os::unix::fs::FileExt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use dashmap::DashMap;
use fuser::{
    FileAttr, FileType, Filesystem, ReplyAttr, ReplyData, ReplyDirectory, ReplyEntry, ReplyOpen,
    ReplyStatfs, ReplyXattr, Request as FuseRequest,
};
use tokio::sync::{mpsc, oneshot};
use tracing::{error, warn};

use studip_core::{ContentCache, NodeId, RemoteSource, Resolver, StatusReporter};

const TTL: Duration = Duration::from_secs(1);
const ROOT_INO: u64 = 1;

fn node_to_ino(id: NodeId) -> u64 {
    id.0 as u64 + 1
}

fn ino_to_node(ino: u64) -> NodeId {
    NodeId((ino - 1) as usize)
}

enum Command {
    Lookup { parent: NodeId, name: String, reply: oneshot::Sender<LookupOutcome> },
    GetAttr { node: NodeId, reply: oneshot::Sender<Result<NodeSnapshot, i32>> },
    ReadDir { node: NodeId, reply: oneshot::Sender<Result<Vec<(String, NodeId, bool)>, i32>> },
    EnsureLocal { node: NodeId, reply: oneshot::Sender<Result<PathBuf, i32>> },
    GetXattr { node: NodeId, name: String, reply: oneshot::Sender<Result<Vec<u8>, i32>> },
    ListXattr { node: NodeId, reply: oneshot::Sender<Result<Vec<u8>, i32>> },
}

enum LookupOutcome {
    Found(NodeSnapshot),
    NotFound,
    Err(i32),
}

#[derive(Clone)]
struct NodeSnapshot {
    id: NodeId,
    is_dir: bool,
    size: u64,
}

/// Owns the `Resolver`/`ContentCache` and drains `Command`s, fanning each
/// one out onto its own task so a slow `EnsureLocal` download never blocks
/// unrelated lookups/getattrs/readdirs (spec §5: "expansions of independent
/// nodes may interleave arbitrarily").
struct Worker<S: RemoteSource + 'static> {
    resolver: Arc<Resolver<S>>,
    cache: Arc<ContentCache<S>>,
    status: Arc<StatusReporter>,
    base_url: url::Url,
}

impl<S: RemoteSource + 'static> Clone for Worker<S> {
    fn clone(&self) -> Self {
        Worker {
            resolver: self.resolver.clone(),
            cache: self.cache.clone(),
            status: self.status.clone(),
            base_url: self.base_url.clone(),
        }
    }
}

impl<S: RemoteSource + 'static> Worker<S> {
    async fn run(self, mut rx: mpsc::UnboundedReceiver<Command>) {
        while let Some(cmd) = rx.recv().await {
            let worker = self.clone();
            tokio::spawn(async move { worker.handle(cmd).await });
        }
    }

    async fn handle(&self, cmd: Command) {
        match cmd {
            Command::Lookup { parent, name, reply } => {
                let outcome = match self.resolver.lookup_child(parent, &name).await {
                    Ok(Some(child)) => match self.snapshot(child).await {
                        Ok(s) => LookupOutcome::Found(s),
                        Err(e) => LookupOutcome::Err(e),
                    },
                    Ok(None) => LookupOutcome::NotFound,
                    Err(e) => {
                        warn!(error = %e, "expansion failed during lookup");
                        LookupOutcome::Err(libc::EIO)
                    }
                };
                let _ = reply.send(outcome);
            }
            Command::GetAttr { node, reply } => {
                let _ = reply.send(self.snapshot(node).await);
            }
            Command::ReadDir { node, reply } => {
                let result = match self.resolver.readdir(node).await {
                    Ok(children) => {
                        let mut out = Vec::with_capacity(children.len());
                        for (name, id) in children {
                            let is_dir = self.resolver.is_dir(id).await;
                            out.push((name, id, is_dir));
                        }
                        Ok(out)
                    }
                    Err(e) => {
                        warn!(error = %e, "expansion failed during readdir");
                        Err(libc::EIO)
                    }
                };
                let _ = reply.send(result);
            }
            Command::EnsureLocal { node, reply } => {
                let result = match self.resolver.file(node).await {
                    Some(file) => match self.cache.ensure_local(&file).await {
                        Ok(path) => Ok(path),
                        Err(e) => {
                            error!(error = %e, file_id = %file.id, "content fetch failed");
                            let _ = self.status.error(format!("failed to fetch {}: {e}", file.name)).await;
                            Err(libc::EIO)
                        }
                    },
                    None => Err(libc::EISDIR),
                };
                let _ = reply.send(result);
            }
            Command::GetXattr { node, name, reply } => {
                let result = self.xattr_value(node, &name).await;
                let _ = reply.send(result);
            }
            Command::ListXattr { node, reply } => {
                let names = [
                    "studip-fuse.known-tokens",
                    "studip-fuse.json",
                    "studip-fuse.contents-status",
                    "studip-fuse.contents-exception",
                    "studip-fuse.url",
                ];
                let mut buf = Vec::new();
                for n in names {
                    buf.extend_from_slice(n.as_bytes());
                    buf.push(0);
                }
                let _ = reply.send(Ok(buf));
            }
        }
    }

    async fn snapshot(&self, node: NodeId) -> Result<NodeSnapshot, i32> {
        let is_dir = self.resolver.is_dir(node).await;
        let size = match self.resolver.file(node).await {
            Some(file) => file.size,
            None => 0,
        };
        Ok(NodeSnapshot { id: node, is_dir, size })
    }

    async fn xattr_value(&self, node: NodeId, name: &str) -> Result<Vec<u8>, i32> {
        match name {
            "studip-fuse.known-tokens" => {
                let bindings = self.resolver.bindings(node).await;
                let roots = studip_core::token::default_generic_roots();
                let tokens = studip_core::token::all_tokens(&bindings, &roots);
                let map: std::collections::BTreeMap<_, _> = tokens.into_iter().collect();
                serde_json::to_vec(&map).map_err(|_| libc::EIO)
            }
            "studip-fuse.json" => match self.resolver.entity(node).await {
                Some(entity) => serde_json::to_vec(&entity).map_err(|_| libc::EIO),
                None => Err(libc::ENODATA),
            },
            "studip-fuse.contents-status" => match self.resolver.file(node).await {
                Some(file) => Ok(self.cache.status(&file).as_str().as_bytes().to_vec()),
                None => Err(libc::ENODATA),
            },
            "studip-fuse.contents-exception" => match self.resolver.node_state(node).await {
                studip_core::MaterializationState::Failed(e) => Ok(e.to_string().into_bytes()),
                _ => Err(libc::ENODATA),
            },
            "studip-fuse.url" => match self.resolver.entity(node).await {
                Some(entity) => Ok(entity.web_url(&self.base_url).to_string().into_bytes()),
                None => Err(libc::ENODATA),
            },
            _ => Err(libc::ENODATA),
        }
    }
}

/// `fuser::Filesystem` implementation. Every method is a thin synchronous
/// shell: build a `Command`, push it into the channel, block on the reply.
pub struct StudipFs {
    tx: mpsc::UnboundedSender<Command>,
    handles: DashMap<u64, (PathBuf, std::fs::File)>,
    next_fh: AtomicU64,
}

impl StudipFs {
    pub fn spawn<S: RemoteSource + 'static>(
        resolver: Arc<Resolver<S>>,
        cache: Arc<ContentCache<S>>,
        status: Arc<StatusReporter>,
        base_url: url::Url,
        runtime: &tokio::runtime::Runtime,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = Worker { resolver, cache, status, base_url };
        runtime.spawn(worker.run(rx));
        StudipFs { tx, handles: DashMap::new(), next_fh: AtomicU64::new(1) }
    }

    fn request<T: Send + 'static>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, i32> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.tx.send(build(reply_tx)).is_err() {
            return Err(libc::EIO);
        }
        reply_rx.blocking_recv().map_err(|_| libc::EIO)
    }

    fn attr(ino: u64, snapshot: &NodeSnapshot) -> FileAttr {
        let now = SystemTime::now();
        let kind = if snapshot.is_dir { FileType::Directory } else { FileType::RegularFile };
        let perm = if snapshot.is_dir { 0o555 } else { 0o444 };
        FileAttr {
            ino,
            size: snapshot.size,
            blocks: snapshot.size.div_ceil(512),
            atime: now,
            mtime: now,
            ctime: now,
            crtime: now,
            kind,
            perm,
            nlink: if snapshot.is_dir { 2 } else { 1 },
            uid: unsafe { libc::getuid() },
            gid: unsafe { libc::getgid() },
            rdev: 0,
            blksize: 512,
            flags: 0,
        }
    }
}

impl Filesystem for StudipFs {
    fn lookup(&mut self, _req: &FuseRequest<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let parent_node = if parent == ROOT_INO { NodeId::ROOT } else { ino_to_node(parent) };
        let Some(name) = name.to_str() else {
            reply.error(libc::EINVAL);
            return;
        };
        let result = self.request::<LookupOutcome>(|tx| Command::Lookup {
            parent: parent_node,
            name: name.to_string(),
            reply: tx,
        });
        match result {
            Ok(LookupOutcome::Found(snapshot)) => {
                let ino = node_to_ino(snapshot.id);
                reply.entry(&TTL, &Self::attr(ino, &snapshot), 0);
            }
            Ok(LookupOutcome::NotFound) => reply.error(libc::ENOENT),
            Ok(LookupOutcome::Err(errno)) => reply.error(errno),
            Err(errno) => reply.error(errno),
        }
    }

    fn getattr(&mut self, _req: &FuseRequest<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        let node = if ino == ROOT_INO { NodeId::ROOT } else { ino_to_node(ino) };
        match self.request(|tx| Command::GetAttr { node, reply: tx }) {
            Ok(snapshot) => reply.attr(&TTL, &Self::attr(ino, &snapshot)),
            Err(errno) => reply.error(errno),
        }
    }

    fn readdir(&mut self, _req: &FuseRequest<'_>, ino: u64, _fh: u64, offset: i64, mut reply: ReplyDirectory) {
        let node = if ino == ROOT_INO { NodeId::ROOT } else { ino_to_node(ino) };
        let children = match self.request(|tx| Command::ReadDir { node, reply: tx }) {
            Ok(children) => children,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };

        let mut entries: Vec<(u64, FileType, String)> =
            vec![(ino, FileType::Directory, ".".to_string()), (ino, FileType::Directory, "..".to_string())];
        for (name, child, is_dir) in children {
            let kind = if is_dir { FileType::Directory } else { FileType::RegularFile };
            entries.push((node_to_ino(child), kind, name));
        }

        for (i, (ino, kind, name)) in entries.into_iter().enumerate().skip(offset as usize) {
            if reply.add(ino, (i + 1) as i64, kind, &name) {
                break;
            }
        }
        reply.ok();
    }

    fn open(&mut self, _req: &FuseRequest<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        let node = ino_to_node(ino);
        let path = match self.request(|tx| Command::EnsureLocal { node, reply: tx }) {
            Ok(path) => path,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };
        let file = match std::fs::File::open(&path) {
            Ok(f) => f,
            Err(_) => {
                reply.error(libc::EIO);
                return;
            }
        };
        let fh = self.next_fh.fetch_add(1, Ordering::SeqCst);
        self.handles.insert(fh, (path, file));
        reply.opened(fh, 0);
    }

    fn read(
        &mut self,
        _req: &FuseRequest<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let Some(entry) = self.handles.get(&fh) else {
            reply.error(libc::EBADF);
            return;
        };
        let mut buf = vec![0u8; size as usize];
        match entry.1.read_at(&mut buf, offset as u64) {
            Ok(n) => reply.data(&buf[..n]),
            Err(_) => reply.error(libc::EIO),
        }
    }

    fn release(
        &mut self,
        _req: &FuseRequest<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: fuser::ReplyEmpty,
    ) {
        self.handles.remove(&fh);
        reply.ok();
    }

    fn getxattr(&mut self, _req: &FuseRequest<'_>, ino: u64, name: &OsStr, size: u32, reply: ReplyXattr) {
        let node = if ino == ROOT_INO { NodeId::ROOT } else { ino_to_node(ino) };
        let Some(name) = name.to_str() else {
            reply.error(libc::EINVAL);
            return;
        };
        match self.request(|tx| Command::GetXattr { node, name: name.to_string(), reply: tx }) {
            Ok(value) if size == 0 => reply.size(value.len() as u32),
            Ok(value) if (value.len() as u32) <= size => reply.data(&value),
            Ok(_) => reply.error(libc::ERANGE),
            Err(errno) => reply.error(errno),
        }
    }

    fn listxattr(&mut self, _req: &FuseRequest<'_>, ino: u64, size: u32, reply: ReplyXattr) {
        let node = if ino == ROOT_INO { NodeId::ROOT } else { ino_to_node(ino) };
        match self.request(|tx| Command::ListXattr { node, reply: tx }) {
            Ok(value) if size == 0 => reply.size(value.len() as u32),
            Ok(value) if (value.len() as u32) <= size => reply.data(&value),
            Ok(_) => reply.error(libc::ERANGE),
            Err(errno) => reply.error(errno),
        }
    }

    fn statfs(&mut self, _req: &FuseRequest<'_>, _ino: u64, reply: ReplyStatfs) {
        reply.statfs(0, 0, 0, 0, 0, 512, 255, 0);
    }

    // --- Read-only invariant (spec §4.7): every write-shaped op is EROFS ---

    fn write(
        &mut self,
        _req: &FuseRequest<'_>,
        _ino: u64,
        _fh: u64,
        _offset: i64,
        _data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        reply.error(libc::EROFS);
    }

    fn create(
        &mut self,
        _req: &FuseRequest<'_>,
        _parent: u64,
        _name: &OsStr,
        _mode: u32,
        _umask: u32,
        _flags: i32,
        reply: fuser::ReplyCreate,
    ) {
        reply.error(libc::EROFS);
    }

    fn mkdir(
        &mut self,
        _req: &FuseRequest<'_>,
        _parent: u64,
        _name: &OsStr,
        _mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        reply.error(libc::EROFS);
    }

    fn unlink(&mut self, _req: &FuseRequest<'_>, _parent: u64, _name: &OsStr, reply: fuser::ReplyEmpty) {
        reply.error(libc::EROFS);
    }

    fn rmdir(&mut self, _req: &FuseRequest<'_>, _parent: u64, _name: &OsStr, reply: fuser::ReplyEmpty) {
        reply.error(libc::EROFS);
    }

    fn rename(
        &mut self,
        _req: &FuseRequest<'_>,
        _parent: u64,
        _name: &OsStr,
        _newparent: u64,
        _newname: &OsStr,
        _flags: u32,
        reply: fuser::ReplyEmpty,
    ) {
        reply.error(libc::EROFS);
    }

    fn setattr(
        &mut self,
        _req: &FuseRequest<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<fuser::TimeOrNow>,
        mtime: Option<fuser::TimeOrNow>,
        ctime: Option<SystemTime>,
        _fh: Option<u64>,
        crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let any_mutation = mode.is_some()
            || uid.is_some()
            || gid.is_some()
            || size.is_some()
            || atime.is_some()
            || mtime.is_some()
            || ctime.is_some()
            || crtime.is_some()
            || flags.is_some();
        if any_mutation {
            reply.error(libc::EROFS);
            return;
        }
        let node = if ino == ROOT_INO { NodeId::ROOT } else { ino_to_node(ino) };
        match self.request(|tx| Command::GetAttr { node, reply: tx }) {
            Ok(snapshot) => reply.attr(&TTL, &Self::attr(ino, &snapshot)),
            Err(errno) => reply.error(errno),
        }
    }

    fn mknod(
        &mut self,
        _req: &FuseRequest<'_>,
        _parent: u64,
        _name: &OsStr,
        _mode: u32,
        _umask: u32,
        _rdev: u32,
        reply: ReplyEntry,
    ) {
        reply.error(libc::EROFS);
    }

    fn setxattr(
        &mut self,
        _req: &FuseRequest<'_>,
        _ino: u64,
        _name: &OsStr,
        _value: &[u8],
        _flags: i32,
        _position: u32,
        reply: fuser::ReplyEmpty,
    ) {
        reply.error(libc::EROFS);
    }

    fn removexattr(&mut self, _req: &FuseRequest<'_>, _ino: u64, _name: &OsStr, reply: fuser::ReplyEmpty) {
        reply.error(libc::EROFS);
    }
}
