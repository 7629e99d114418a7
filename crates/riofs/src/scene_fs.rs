//! File surface of the scene subsystem.
//!
//! Everything here glues the executor and the scene manager to synthetic
//! files: `parse` consumes streamed code, `stdout`/`STDERR` expose captured
//! execution output through the blocking-read engine, `vars`/`state`/
//! `version` give structured views, and the root-level `CONTEXT` and
//! `screen` files round out what an agent sees.

use {
    crate::{
        context,
        ctl::{CtlHandler, split_command},
        error::{Error, Result},
        exec::{ExecCtx, Value},
        node::{self, FileOps},
        scene::{SceneManager, unix_now},
        stream::{StreamFile, StreamMode},
        usage,
    },
    async_trait::async_trait,
    log::{error, info, warn},
    serde_json::{Value as Json, json},
    std::{
        collections::{HashMap, HashSet},
        path::{Path, PathBuf},
        sync::{Arc, Mutex},
    },
};

/// Provider of rendered-scene captures for the `screen` file. The real
/// implementation lives with the GUI; headless assemblies use
/// [`PlaceholderScreen`].
pub trait ScreenSource: Send + Sync {
    fn capture(&self) -> Result<Vec<u8>>;
}

/// A single transparent pixel, so `screen` always serves a valid PNG.
pub struct PlaceholderScreen;

const BLANK_PNG: &[u8] = &[
    0x89, 0x50, 0x4e, 0x47, 0x0d, 0x0a, 0x1a, 0x0a, 0x00, 0x00, 0x00, 0x0d, 0x49, 0x48, 0x44,
    0x52, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x08, 0x06, 0x00, 0x00, 0x00, 0x1f,
    0x15, 0xc4, 0x89, 0x00, 0x00, 0x00, 0x0a, 0x49, 0x44, 0x41, 0x54, 0x78, 0x9c, 0x63, 0x00,
    0x01, 0x00, 0x00, 0x05, 0x00, 0x01, 0x0d, 0x0a, 0x2d, 0xb4, 0x00, 0x00, 0x00, 0x00, 0x49,
    0x45, 0x4e, 0x44, 0xae, 0x42, 0x60, 0x82,
];

impl ScreenSource for PlaceholderScreen {
    fn capture(&self) -> Result<Vec<u8>> {
        Ok(BLANK_PNG.to_vec())
    }
}

/// Shared spine of the scene subsystem: executor, manager and the streaming
/// output files, plus envelope build/restore used by `state` and the root
/// `ctl` save/load verbs.
pub struct SceneRunner {
    pub scene: Arc<SceneManager>,
    pub exec: Arc<tokio::sync::Mutex<ExecCtx>>,
    pub stdout: Arc<StreamFile>,
    pub stderr: Arc<StreamFile>,
    pub context: Arc<ContextFile>,
}

impl SceneRunner {
    pub fn new(scene: Arc<SceneManager>) -> Arc<SceneRunner> {
        Arc::new(SceneRunner {
            exec: Arc::new(tokio::sync::Mutex::new(ExecCtx::new(scene.clone()))),
            scene,
            stdout: Arc::new(StreamFile::new(StreamMode::StateAware)),
            stderr: Arc::new(StreamFile::new(StreamMode::Blocking)),
            context: Arc::new(ContextFile::new()),
        })
    }

    /// Run one drained submission through the executor and post the results
    /// to the streaming files. Failures surface on `STDERR` only; the
    /// submitting write has already succeeded.
    pub async fn execute(&self, code: &str) {
        self.stdout.reset();
        self.stderr.reset();

        let mut exec = self.exec.lock().await;
        let (outcome, capture) = exec.run(code);
        self.stdout.post(&capture.out);
        self.stderr.post(&capture.err);

        if outcome.success {
            let rendered = outcome
                .result
                .as_ref()
                .map(Value::repr)
                .unwrap_or_else(|| "None".to_string());
            self.stdout.post(format!("→ {rendered}\n").as_bytes());
            for w in &outcome.widgets_created {
                self.stdout.post(format!("✚ widget {w}\n").as_bytes());
            }
            for item in &outcome.items_registered {
                self.stdout.post(format!("● item {item}\n").as_bytes());
            }

            let live: HashSet<String> = exec.binding_names().into_iter().collect();
            self.context.append(code, &live);

            let label = code.lines().next().unwrap_or("").trim().to_string();
            let version = self.scene.take_snapshot(&label, code);
            self.stdout.post(format!("✓ Version {version}\n").as_bytes());
        } else if let Some(err) = &outcome.error {
            self.stderr.post(format!("{err}\n").as_bytes());
        }
        drop(exec);

        self.stdout.mark_ready();
        self.stderr.mark_ready();
    }

    /// The cp-friendly `state` envelope.
    pub async fn build_envelope(&self) -> Json {
        let exec = self.exec.lock().await;
        let snapshots = self.scene.snapshots();
        let versions: Vec<Json> = snapshots
            .iter()
            .map(|s| {
                json!({
                    "version": s.version,
                    "label": s.label,
                    "item_count": s.item_count,
                    "timestamp": s.timestamp,
                })
            })
            .collect();
        let code_history: Vec<Json> = snapshots
            .iter()
            .filter(|s| !s.code.trim().is_empty())
            .map(|s| json!({ "version": s.version, "code": s.code }))
            .collect();
        let settings = self.scene.settings();
        json!({
            "rio_state": 1,
            "timestamp": unix_now(),
            "scene": self.scene.to_json(),
            "settings": {
                "width": settings.width,
                "height": settings.height,
                "background": settings.background,
            },
            "versions": versions,
            "vars": exec.primitive_vars(),
            "code_history": code_history,
        })
    }

    /// Restore a session from an envelope. Validation happens before any
    /// mutation so a corrupt payload leaves the scene untouched. Replay is
    /// best-effort: a failing historical fragment is logged and skipped.
    pub async fn restore_envelope(&self, payload: &[u8]) -> Result<()> {
        let envelope: Json = serde_json::from_slice(payload)?;
        match envelope.get("rio_state").and_then(Json::as_u64) {
            Some(1) => {}
            other => {
                return Err(Error::CorruptState(format!(
                    "unsupported rio_state {other:?}"
                )));
            }
        }

        let mut exec = self.exec.lock().await;
        self.scene.clear();
        if let Some(settings) = envelope.get("settings") {
            if let (Some(w), Some(h)) = (
                settings.get("width").and_then(Json::as_u64),
                settings.get("height").and_then(Json::as_u64),
            ) {
                self.scene.set_size(w as u32, h as u32);
            }
            if let Some(bg) = settings.get("background").and_then(Json::as_str) {
                self.scene.set_background(bg);
            }
        }

        if let Some(history) = envelope.get("code_history").and_then(Json::as_array) {
            for entry in history {
                let Some(code) = entry.get("code").and_then(Json::as_str) else {
                    continue;
                };
                let (outcome, _) = exec.run(code);
                if !outcome.success {
                    warn!(
                        "state restore: replay of version {:?} failed: {}",
                        entry.get("version"),
                        outcome.error.unwrap_or_default()
                    );
                }
            }
        }

        if let Some(vars) = envelope.get("vars").and_then(Json::as_object) {
            for (name, value) in vars {
                if !exec.has_binding(name) {
                    exec.set(name, Value::from_json(value));
                }
            }
        }
        drop(exec);

        self.scene.take_snapshot("restored session", "");
        info!("state restored: {} items", self.scene.item_count());
        Ok(())
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        let envelope = self.build_envelope().await;
        tokio::fs::write(path, serde_json::to_vec_pretty(&envelope)?).await?;
        info!("state saved to {}", path.display());
        Ok(())
    }

    pub async fn load(&self, path: &Path) -> Result<()> {
        let payload = tokio::fs::read(path).await?;
        self.restore_envelope(&payload).await
    }
}

/// `scene/parse`: write-only consumer of streamed code fragments.
///
/// Chunks arrive in whatever sizes the transport picked; they accumulate
/// per fid and execute when the fid is clunked, so one `cat prog > parse`
/// is exactly one submission.
pub struct ParseFile {
    runner: Arc<SceneRunner>,
    buffers: Mutex<HashMap<u32, Vec<u8>>>,
}

impl ParseFile {
    pub fn new(runner: Arc<SceneRunner>) -> ParseFile {
        ParseFile {
            runner,
            buffers: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl FileOps for ParseFile {
    async fn read(&self, fid: u32, offset: u64, count: u32) -> Result<Vec<u8>> {
        let buffering = self
            .buffers
            .lock()
            .unwrap()
            .get(&fid)
            .is_some_and(|b| !b.is_empty());
        let status: &[u8] = if buffering { b"buffering...\n" } else { b"ready\n" };
        Ok(node::slice_at(status, offset, count))
    }

    async fn write(&self, fid: u32, _offset: u64, data: &[u8]) -> Result<u32> {
        let mut buffers = self.buffers.lock().unwrap();
        buffers.entry(fid).or_default().extend_from_slice(data);
        Ok(data.len() as u32)
    }

    async fn clunk(&self, fid: u32) {
        let drained = self.buffers.lock().unwrap().remove(&fid);
        if let Some(buf) = drained {
            if !buf.is_empty() {
                let code = String::from_utf8_lossy(&buf).into_owned();
                self.runner.execute(&code).await;
            }
        }
    }
}

/// Root-level `CONTEXT`: the compacted program text, served through an
/// always-blocking stream so agents can `cat` it every cycle and always get
/// the latest coherent view.
pub struct ContextFile {
    log: Mutex<Vec<String>>,
    stream: StreamFile,
}

impl ContextFile {
    pub fn new() -> ContextFile {
        ContextFile {
            log: Mutex::new(Vec::new()),
            stream: StreamFile::new(StreamMode::Blocking),
        }
    }

    /// Append a successfully executed fragment and publish the recompacted
    /// program. Compaction failures fall back to the raw concatenation.
    pub fn append(&self, code: &str, live: &HashSet<String>) {
        let text = {
            let mut log = self.log.lock().unwrap();
            log.push(code.to_string());
            match context::compact(&log, &|name| live.contains(name)) {
                Ok(text) => text,
                Err(e) => {
                    warn!("context compaction failed, serving raw log: {e}");
                    log.iter()
                        .map(|frag| {
                            let mut f = frag.clone();
                            if !f.ends_with('\n') {
                                f.push('\n');
                            }
                            f
                        })
                        .collect()
                }
            }
        };
        self.stream.reset();
        self.stream.post(text.as_bytes());
        self.stream.mark_ready();
    }
}

impl Default for ContextFile {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FileOps for ContextFile {
    async fn read(&self, _fid: u32, offset: u64, count: u32) -> Result<Vec<u8>> {
        Ok(self.stream.read_at(offset, count).await)
    }
}

/// `scene/vars`: read-only JSON snapshot of the namespace.
pub struct VarsFile {
    runner: Arc<SceneRunner>,
    cache: Mutex<HashMap<u32, Vec<u8>>>,
}

impl VarsFile {
    pub fn new(runner: Arc<SceneRunner>) -> VarsFile {
        VarsFile {
            runner,
            cache: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl FileOps for VarsFile {
    async fn read(&self, fid: u32, offset: u64, count: u32) -> Result<Vec<u8>> {
        let cached = if offset == 0 {
            None
        } else {
            self.cache.lock().unwrap().get(&fid).cloned()
        };
        let content = match cached {
            Some(c) => c,
            None => {
                let vars = self.runner.exec.lock().await.namespace_json();
                let mut text = serde_json::to_string_pretty(&vars).unwrap_or_default();
                text.push('\n');
                let bytes = text.into_bytes();
                self.cache.lock().unwrap().insert(fid, bytes.clone());
                bytes
            }
        };
        Ok(node::slice_at(&content, offset, count))
    }

    async fn clunk(&self, fid: u32) {
        self.cache.lock().unwrap().remove(&fid);
    }
}

/// `scene/state`: the whole session as one JSON envelope. Reads are built
/// once per fid; a completed write restores the session on clunk.
pub struct StateFile {
    runner: Arc<SceneRunner>,
    reads: Mutex<HashMap<u32, Vec<u8>>>,
    writes: Mutex<HashMap<u32, Vec<u8>>>,
}

impl StateFile {
    pub fn new(runner: Arc<SceneRunner>) -> StateFile {
        StateFile {
            runner,
            reads: Mutex::new(HashMap::new()),
            writes: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl FileOps for StateFile {
    async fn read(&self, fid: u32, offset: u64, count: u32) -> Result<Vec<u8>> {
        let cached = if offset == 0 {
            None
        } else {
            self.reads.lock().unwrap().get(&fid).cloned()
        };
        let content = match cached {
            Some(c) => c,
            None => {
                let envelope = self.runner.build_envelope().await;
                let mut text = serde_json::to_string_pretty(&envelope)?;
                text.push('\n');
                let bytes = text.into_bytes();
                self.reads.lock().unwrap().insert(fid, bytes.clone());
                bytes
            }
        };
        Ok(node::slice_at(&content, offset, count))
    }

    async fn write(&self, fid: u32, _offset: u64, data: &[u8]) -> Result<u32> {
        let mut writes = self.writes.lock().unwrap();
        writes.entry(fid).or_default().extend_from_slice(data);
        Ok(data.len() as u32)
    }

    async fn clunk(&self, fid: u32) {
        self.reads.lock().unwrap().remove(&fid);
        let pending = self.writes.lock().unwrap().remove(&fid);
        if let Some(payload) = pending {
            if payload.is_empty() {
                return;
            }
            if let Err(e) = self.runner.restore_envelope(&payload).await {
                error!("state restore aborted: {e}");
            }
        }
    }
}

/// `scene/version`: snapshot history as text; accepts `undo`, `redo` or a
/// version number.
pub struct VersionFile {
    scene: Arc<SceneManager>,
    cache: Mutex<HashMap<u32, Vec<u8>>>,
}

impl VersionFile {
    pub fn new(scene: Arc<SceneManager>) -> VersionFile {
        VersionFile {
            scene,
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn render(&self) -> Vec<u8> {
        let current = self.scene.current_version();
        let mut out = String::new();
        for snap in self.scene.snapshots() {
            let marker = if snap.version == current { " *" } else { "" };
            out.push_str(&format!(
                "{}\t{} items\t{}{}\n",
                snap.version, snap.item_count, snap.label, marker
            ));
        }
        out.push_str(&format!("current {current}\n"));
        out.push_str(&format!("can_undo {}\n", self.scene.can_undo()));
        out.push_str(&format!("can_redo {}\n", self.scene.can_redo()));
        out.into_bytes()
    }
}

#[async_trait]
impl FileOps for VersionFile {
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
        let command = text.trim();
        match command {
            "undo" => {
                self.scene.undo();
            }
            "redo" => {
                self.scene.redo();
            }
            _ => match command.parse::<u64>() {
                Ok(version) => {
                    self.scene.goto_version(version)?;
                }
                Err(_) => {
                    return Err(usage!("expected 'undo', 'redo' or a version number"));
                }
            },
        }
        Ok(data.len() as u32)
    }

    async fn clunk(&self, fid: u32) {
        self.cache.lock().unwrap().remove(&fid);
    }
}

/// Root-level `screen`: a PNG of the rendered scene, captured lazily on the
/// first read of each fid and cached until clunk.
pub struct ScreenFile {
    source: Arc<dyn ScreenSource>,
    cache: Mutex<HashMap<u32, Vec<u8>>>,
}

impl ScreenFile {
    pub fn new(source: Arc<dyn ScreenSource>) -> ScreenFile {
        ScreenFile {
            source,
            cache: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl FileOps for ScreenFile {
    async fn read(&self, fid: u32, offset: u64, count: u32) -> Result<Vec<u8>> {
        let cached = self.cache.lock().unwrap().get(&fid).cloned();
        let content = match cached {
            Some(c) => c,
            None => {
                let png = self.source.capture()?;
                self.cache.lock().unwrap().insert(fid, png.clone());
                png
            }
        };
        Ok(node::slice_at(&content, offset, count))
    }

    async fn clunk(&self, fid: u32) {
        self.cache.lock().unwrap().remove(&fid);
    }
}

/// Handler behind `scene/ctl`.
pub struct SceneCtl {
    runner: Arc<SceneRunner>,
}

impl SceneCtl {
    pub fn new(runner: Arc<SceneRunner>) -> SceneCtl {
        SceneCtl { runner }
    }
}

#[async_trait]
impl CtlHandler for SceneCtl {
    async fn command(&self, verb: &str, arg: &str) -> Result<Option<String>> {
        let scene = &self.runner.scene;
        match verb {
            "clear" => {
                scene.take_snapshot("clear", "");
                scene.clear();
                Ok(None)
            }
            "refresh" => {
                scene.refresh();
                Ok(None)
            }
            "export" => Ok(Some(scene.to_json().to_string())),
            "undo" => {
                scene.undo();
                Ok(None)
            }
            "redo" => {
                scene.redo();
                Ok(None)
            }
            "goto" => {
                let version: u64 = arg
                    .parse()
                    .map_err(|_| usage!("goto takes a version number"))?;
                scene.goto_version(version)?;
                Ok(None)
            }
            "snapshot" => {
                let label = if arg.is_empty() { "manual" } else { arg };
                scene.take_snapshot(label, "");
                Ok(None)
            }
            _ => Err(usage!("unknown scene ctl verb '{verb}'")),
        }
    }

    async fn status(&self) -> Vec<(String, String)> {
        let scene = &self.runner.scene;
        vec![
            ("items".into(), scene.item_count().to_string()),
            ("version".into(), scene.current_version().to_string()),
            ("can_undo".into(), scene.can_undo().to_string()),
            ("can_redo".into(), scene.can_redo().to_string()),
        ]
    }
}

/// Handler behind the root `ctl`.
pub struct RootCtl {
    runner: Arc<SceneRunner>,
    state_path: PathBuf,
}

impl RootCtl {
    pub fn new(runner: Arc<SceneRunner>, state_path: PathBuf) -> RootCtl {
        RootCtl { runner, state_path }
    }
}

#[async_trait]
impl CtlHandler for RootCtl {
    async fn command(&self, verb: &str, arg: &str) -> Result<Option<String>> {
        let scene = &self.runner.scene;
        match verb {
            "refresh" => {
                scene.refresh();
                Ok(None)
            }
            "clear" => {
                scene.take_snapshot("clear", "");
                scene.clear();
                Ok(None)
            }
            "export" => Ok(Some(scene.to_json().to_string())),
            "import" => {
                let payload: Json = serde_json::from_str(arg)?;
                scene.from_json(&payload)?;
                Ok(None)
            }
            "size" => {
                let (w, h) = split_command(arg)
                    .and_then(|(w, h)| Some((w.parse::<u32>().ok()?, h.parse::<u32>().ok()?)))
                    .ok_or_else(|| usage!("size takes 'W H'"))?;
                scene.set_size(w, h);
                Ok(None)
            }
            "background" => {
                if arg.is_empty() {
                    Ok(Some(format!("{}\n", scene.settings().background)))
                } else {
                    scene.set_background(arg);
                    Ok(None)
                }
            }
            "save" => {
                let path = if arg.is_empty() {
                    self.state_path.clone()
                } else {
                    PathBuf::from(arg)
                };
                self.runner.save(&path).await?;
                Ok(None)
            }
            "load" => {
                let path = if arg.is_empty() {
                    self.state_path.clone()
                } else {
                    PathBuf::from(arg)
                };
                self.runner.load(&path).await?;
                Ok(None)
            }
            _ => Err(usage!("unknown ctl verb '{verb}'")),
        }
    }

    async fn status(&self) -> Vec<(String, String)> {
        let settings = self.runner.scene.settings();
        vec![
            ("width".into(), settings.width.to_string()),
            ("height".into(), settings.height.to_string()),
            ("background".into(), settings.background),
            ("items".into(), self.runner.scene.item_count().to_string()),
            (
                "version".into(),
                self.runner.scene.current_version().to_string(),
            ),
        ]
    }
}
