//! Routes: persistent tail-style pipes between files.
//!
//! A route is a background task looping open → blocking-read-to-EOF →
//! close → open-destination → write → close, forever. Reading to EOF trips
//! the source's rearm protocol, so one route instance drives a streaming
//! file perpetually without busy-polling. Paths inside the synthetic tree
//! are driven through the dispatcher exactly like an external client;
//! anything else falls back to ordinary OS files.
//!
//! At most one route exists per source path: adding a second replaces the
//! first.

use {
    crate::{
        dispatch::Dispatch,
        error::Result,
        node::{self, FileOps, OpenMode},
        usage,
    },
    async_trait::async_trait,
    log::{info, warn},
    std::{
        collections::HashMap,
        path::PathBuf,
        sync::{Arc, Mutex, Weak},
        time::Duration,
    },
    tokio::{sync::broadcast, task::JoinHandle},
};

const RETRY_DELAY: Duration = Duration::from_millis(500);

/// Notifications for UIs mirroring route state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RouteEvent {
    Added { source: String, destination: String },
    Removed { source: String },
}

struct Route {
    destination: String,
    task: JoinHandle<()>,
}

pub struct RouteManager {
    mount_root: PathBuf,
    dispatch: Mutex<Weak<Dispatch>>,
    routes: Mutex<HashMap<String, Route>>,
    events: broadcast::Sender<RouteEvent>,
}

impl RouteManager {
    pub fn new(mount_root: PathBuf) -> Arc<RouteManager> {
        let (events, _) = broadcast::channel(32);
        Arc::new(RouteManager {
            mount_root,
            dispatch: Mutex::new(Weak::new()),
            routes: Mutex::new(HashMap::new()),
            events,
        })
    }

    /// Wire the manager to the dispatcher it tunnels through. Weak: routes
    /// must not keep a torn-down tree alive.
    pub fn set_dispatch(&self, dispatch: &Arc<Dispatch>) {
        *self.dispatch.lock().unwrap() = Arc::downgrade(dispatch);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RouteEvent> {
        self.events.subscribe()
    }

    fn normalize(&self, path: &str) -> String {
        if path.starts_with('/') {
            path.to_string()
        } else {
            format!("{}/{}", self.mount_root.display(), path)
        }
    }

    /// Create (or replace) the attachment for `source`.
    pub fn add_route(&self, source: &str, destination: &str) -> Result<()> {
        let source = self.normalize(source);
        let destination = self.normalize(destination);

        let worker = spawn_worker(
            self.dispatch.lock().unwrap().clone(),
            self.mount_root.clone(),
            source.clone(),
            destination.clone(),
        );

        let old = self.routes.lock().unwrap().insert(
            source.clone(),
            Route {
                destination: destination.clone(),
                task: worker,
            },
        );
        if let Some(old) = old {
            old.task.abort();
            let _ = self.events.send(RouteEvent::Removed {
                source: source.clone(),
            });
        }
        info!("route added: {source} -> {destination}");
        let _ = self.events.send(RouteEvent::Added {
            source,
            destination,
        });
        Ok(())
    }

    pub fn remove_route(&self, source: &str) -> Result<()> {
        let source = self.normalize(source);
        let route = self
            .routes
            .lock()
            .unwrap()
            .remove(&source)
            .ok_or_else(|| crate::not_found!("route {source}"))?;
        route.task.abort();
        info!("route removed: {source}");
        let _ = self.events.send(RouteEvent::Removed { source });
        Ok(())
    }

    /// `(source, destination, running)` triples in no particular order.
    pub fn list_routes(&self) -> Vec<(String, String, bool)> {
        let routes = self.routes.lock().unwrap();
        let mut out: Vec<(String, String, bool)> = routes
            .iter()
            .map(|(src, route)| {
                (
                    src.clone(),
                    route.destination.clone(),
                    !route.task.is_finished(),
                )
            })
            .collect();
        out.sort();
        out
    }

    pub fn stop_all(&self) {
        let mut routes = self.routes.lock().unwrap();
        for (source, route) in routes.drain() {
            route.task.abort();
            let _ = self.events.send(RouteEvent::Removed { source });
        }
    }
}

fn spawn_worker(
    dispatch: Weak<Dispatch>,
    mount_root: PathBuf,
    source: String,
    destination: String,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let Some(d) = dispatch.upgrade() else {
                // Not wired yet, or the tree is gone; the latter resolves
                // to the task being aborted with its manager.
                tokio::time::sleep(RETRY_DELAY).await;
                continue;
            };

            let data = match read_source(&d, &mount_root, &source).await {
                Ok(data) => data,
                Err(e) => {
                    warn!("route {source}: read failed: {e}");
                    tokio::time::sleep(RETRY_DELAY).await;
                    continue;
                }
            };
            if data.is_empty() {
                tokio::time::sleep(RETRY_DELAY).await;
                continue;
            }
            if let Err(e) = write_destination(&d, &mount_root, &destination, &data).await {
                warn!("route {source} -> {destination}: write failed: {e}");
                tokio::time::sleep(RETRY_DELAY).await;
            }
        }
    })
}

/// Map an absolute path onto the synthetic tree when it points there:
/// either it carries the mount-root prefix or it resolves directly.
fn tree_path(d: &Dispatch, mount_root: &std::path::Path, path: &str) -> Option<String> {
    let mount = mount_root.to_string_lossy();
    let candidate = match path.strip_prefix(mount.as_ref()) {
        Some(rest) if rest.starts_with('/') => rest.to_string(),
        Some("") => "/".to_string(),
        _ => path.to_string(),
    };
    d.resolves(&candidate).then_some(candidate)
}

async fn read_source(d: &Dispatch, mount_root: &std::path::Path, source: &str) -> Result<Vec<u8>> {
    match tree_path(d, mount_root, source) {
        Some(path) => {
            let fid = d.open_path(&path, OpenMode::READ).await?;
            let mut out = Vec::new();
            loop {
                let chunk = match d.read(fid, out.len() as u64, 65536).await {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        let _ = d.clunk(fid).await;
                        return Err(e);
                    }
                };
                if chunk.is_empty() {
                    break;
                }
                out.extend_from_slice(&chunk);
            }
            let _ = d.clunk(fid).await;
            Ok(out)
        }
        None => {
            // OS file: a plain read; the retry delay above provides pacing.
            Ok(tokio::fs::read(source).await?)
        }
    }
}

async fn write_destination(
    d: &Dispatch,
    mount_root: &std::path::Path,
    destination: &str,
    data: &[u8],
) -> Result<()> {
    match tree_path(d, mount_root, destination) {
        Some(path) => {
            let fid = d.open_path(&path, OpenMode::WRITE).await?;
            let res = d.write(fid, 0, data).await;
            let _ = d.clunk(fid).await;
            res.map(|_| ())
        }
        None => {
            use tokio::io::AsyncWriteExt;
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(destination)
                .await?;
            file.write_all(data).await?;
            Ok(())
        }
    }
}

/// The `/routes` file: one line per attachment on read; `src -> dst` adds
/// and `-src` removes on write.
pub struct RoutesFile {
    manager: Arc<RouteManager>,
    cache: Mutex<HashMap<u32, Vec<u8>>>,
}

impl RoutesFile {
    pub fn new(manager: Arc<RouteManager>) -> RoutesFile {
        RoutesFile {
            manager,
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn render(&self) -> Vec<u8> {
        let routes = self.manager.list_routes();
        if routes.is_empty() {
            return b"(no routes)\n".to_vec();
        }
        let mut out = String::new();
        for (source, destination, running) in routes {
            let state = if running { "running" } else { "stopped" };
            out.push_str(&format!("{source} -> {destination} [{state}]\n"));
        }
        out.into_bytes()
    }
}

/// Parse one `routes` write line. `Ok(None)` removes, `Ok(Some(..))` adds.
fn parse_route_line(line: &str) -> Result<(String, Option<String>)> {
    let line = line.trim();
    if let Some(source) = line.strip_prefix('-') {
        let source = source.trim();
        if source.is_empty() {
            return Err(usage!("expected '-<source_path>'"));
        }
        return Ok((source.to_string(), None));
    }
    let (source, destination) = line
        .split_once("->")
        .ok_or_else(|| usage!("expected '<source> -> <destination>' or '-<source>'"))?;
    let (source, destination) = (source.trim(), destination.trim());
    if source.is_empty() || destination.is_empty() {
        return Err(usage!("expected '<source> -> <destination>'"));
    }
    Ok((source.to_string(), Some(destination.to_string())))
}

#[async_trait]
impl FileOps for RoutesFile {
    async fn read(&self, fid: u32, offset: u64, count: u32) -> Result<Vec<u8>> {
        let cached = if offset == 0 {
            None
        } else {
            self.cache.lock().unwrap().get(&fid).cloned()
        };
        let content = match cached {
            Some(c) => c,
            None => {
                let bytes = self.render();
                self.cache.lock().unwrap().insert(fid, bytes.clone());
                bytes
            }
        };
        Ok(node::slice_at(&content, offset, count))
    }

    async fn write(&self, _fid: u32, _offset: u64, data: &[u8]) -> Result<u32> {
        let text = String::from_utf8_lossy(data);
        match parse_route_line(&text)? {
            (source, Some(destination)) => self.manager.add_route(&source, &destination)?,
            (source, None) => self.manager.remove_route(&source)?,
        }
        Ok(data.len() as u32)
    }

    async fn clunk(&self, fid: u32) {
        self.cache.lock().unwrap().remove(&fid);
    }
}
