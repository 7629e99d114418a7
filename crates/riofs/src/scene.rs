//! Scene manager and version store.
//!
//! The scene is the shared drawing surface agents build up through the
//! `parse` file: a flat list of registered items plus display settings.
//! Every successful execution snapshots the serialized scene together with
//! the code that produced it, giving `undo`/`redo`/`goto` over the whole
//! session history.

use {
    crate::error::Result,
    log::info,
    serde::{Deserialize, Serialize},
    serde_json::{Value as Json, json},
    std::{
        sync::Mutex,
        time::{SystemTime, UNIX_EPOCH},
    },
};

/// A registered scene item. Props are free-form JSON so the file surface
/// can round-trip anything a renderer understands.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SceneItem {
    pub id: u64,
    pub kind: String,
    #[serde(default)]
    pub props: serde_json::Map<String, Json>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    pub width: u32,
    pub height: u32,
    pub background: String,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            width: 1024,
            height: 768,
            background: "#101014".to_string(),
        }
    }
}

/// An immutable record of scene state plus the code that produced it.
#[derive(Clone, Debug)]
pub struct Snapshot {
    pub version: u64,
    pub timestamp: f64,
    pub label: String,
    pub code: String,
    pub scene_state: Json,
    pub item_count: u32,
}

struct VersionStore {
    snapshots: Vec<Snapshot>,
    current: u64,
    redo_stack: Vec<u64>,
    next: u64,
}

impl VersionStore {
    fn new() -> VersionStore {
        VersionStore {
            snapshots: Vec::new(),
            current: 0,
            redo_stack: Vec::new(),
            next: 1,
        }
    }

    fn index_of(&self, version: u64) -> Option<usize> {
        self.snapshots.iter().position(|s| s.version == version)
    }
}

struct SceneState {
    items: Vec<SceneItem>,
    settings: Settings,
    next_item_id: u64,
}

pub struct SceneManager {
    state: Mutex<SceneState>,
    versions: Mutex<VersionStore>,
}

pub fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

impl SceneManager {
    pub fn new(settings: Settings) -> SceneManager {
        SceneManager {
            state: Mutex::new(SceneState {
                items: Vec::new(),
                settings,
                next_item_id: 1,
            }),
            versions: Mutex::new(VersionStore::new()),
        }
    }

    pub fn register_item(
        &self,
        kind: &str,
        props: serde_json::Map<String, Json>,
    ) -> SceneItem {
        let mut st = self.state.lock().unwrap();
        let item = SceneItem {
            id: st.next_item_id,
            kind: kind.to_string(),
            props,
        };
        st.next_item_id += 1;
        st.items.push(item.clone());
        item
    }

    pub fn list_parsed_items(&self) -> Vec<SceneItem> {
        self.state.lock().unwrap().items.clone()
    }

    pub fn item_count(&self) -> u32 {
        self.state.lock().unwrap().items.len() as u32
    }

    pub fn clear(&self) {
        let mut st = self.state.lock().unwrap();
        st.items.clear();
    }

    /// Re-emit the registered items to whatever is rendering. Headless
    /// builds have nothing to redraw; the call still logs so pipelines can
    /// see it happened.
    pub fn refresh(&self) {
        info!("scene refresh: {} items", self.item_count());
    }

    pub fn settings(&self) -> Settings {
        self.state.lock().unwrap().settings.clone()
    }

    pub fn set_size(&self, width: u32, height: u32) {
        let mut st = self.state.lock().unwrap();
        st.settings.width = width;
        st.settings.height = height;
    }

    pub fn set_background(&self, color: &str) {
        let mut st = self.state.lock().unwrap();
        st.settings.background = color.to_string();
    }

    pub fn to_json(&self) -> Json {
        let st = self.state.lock().unwrap();
        json!({ "items": st.items, "settings": st.settings })
    }

    /// Replace the scene with a serialized payload. Accepts the envelope
    /// produced by [`to_json`](Self::to_json) or a bare item array.
    pub fn from_json(&self, payload: &Json) -> Result<()> {
        let items: Vec<SceneItem> = match payload {
            Json::Array(_) => serde_json::from_value(payload.clone())?,
            Json::Object(map) => {
                if let Some(settings) = map.get("settings") {
                    let settings: Settings = serde_json::from_value(settings.clone())?;
                    self.state.lock().unwrap().settings = settings;
                }
                match map.get("items") {
                    Some(items) => serde_json::from_value(items.clone())?,
                    None => Vec::new(),
                }
            }
            _ => {
                return Err(crate::error::Error::CorruptState(
                    "scene payload must be an object or array".into(),
                ));
            }
        };
        let mut st = self.state.lock().unwrap();
        st.next_item_id = items.iter().map(|i| i.id + 1).max().unwrap_or(1);
        st.items = items;
        Ok(())
    }

    /// Capture the current scene under a new version. Truncates any redo
    /// history: the timeline has one future.
    pub fn take_snapshot(&self, label: &str, code: &str) -> u64 {
        let scene_state = self.to_json();
        let item_count = self.item_count();
        let mut vs = self.versions.lock().unwrap();
        let version = vs.next;
        vs.next += 1;
        vs.redo_stack.clear();
        vs.snapshots.push(Snapshot {
            version,
            timestamp: unix_now(),
            label: label.to_string(),
            code: code.to_string(),
            scene_state,
            item_count,
        });
        vs.current = version;
        version
    }

    /// Step back one snapshot, restoring its scene. Returns the new
    /// current version, or `None` when already at the oldest.
    pub fn undo(&self) -> Option<u64> {
        let target = {
            let mut vs = self.versions.lock().unwrap();
            let idx = vs.index_of(vs.current)?;
            if idx == 0 {
                return None;
            }
            let current = vs.current;
            let prev = vs.snapshots[idx - 1].clone();
            vs.redo_stack.push(current);
            vs.current = prev.version;
            prev
        };
        let _ = self.from_json(&target.scene_state);
        Some(target.version)
    }

    pub fn redo(&self) -> Option<u64> {
        let target = {
            let mut vs = self.versions.lock().unwrap();
            let version = vs.redo_stack.pop()?;
            let idx = vs.index_of(version)?;
            let snap = vs.snapshots[idx].clone();
            vs.current = version;
            snap
        };
        let _ = self.from_json(&target.scene_state);
        Some(target.version)
    }

    /// Jump to an arbitrary version, abandoning the redo history.
    pub fn goto_version(&self, version: u64) -> Result<u64> {
        let target = {
            let mut vs = self.versions.lock().unwrap();
            let idx = vs
                .index_of(version)
                .ok_or_else(|| crate::not_found!("version {version}"))?;
            let snap = vs.snapshots[idx].clone();
            vs.current = version;
            vs.redo_stack.clear();
            snap
        };
        self.from_json(&target.scene_state)?;
        Ok(target.version)
    }

    pub fn snapshots(&self) -> Vec<Snapshot> {
        self.versions.lock().unwrap().snapshots.clone()
    }

    pub fn current_version(&self) -> u64 {
        self.versions.lock().unwrap().current
    }

    pub fn current_label(&self) -> Option<String> {
        let vs = self.versions.lock().unwrap();
        let idx = vs.index_of(vs.current)?;
        Some(vs.snapshots[idx].label.clone())
    }

    pub fn can_undo(&self) -> bool {
        let vs = self.versions.lock().unwrap();
        matches!(vs.index_of(vs.current), Some(idx) if idx > 0)
    }

    pub fn can_redo(&self) -> bool {
        !self.versions.lock().unwrap().redo_stack.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(pairs: &[(&str, Json)]) -> serde_json::Map<String, Json> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn manager_with_items(n: usize) -> SceneManager {
        let m = SceneManager::new(Settings::default());
        for i in 0..n {
            m.register_item("rect", props(&[("x", json!(i))]));
        }
        m
    }

    #[test]
    fn items_get_sequential_ids() {
        let m = manager_with_items(3);
        let ids: Vec<u64> = m.list_parsed_items().iter().map(|i| i.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn export_clear_import_round_trips() {
        let m = manager_with_items(2);
        let payload = m.to_json();
        m.clear();
        assert_eq!(m.item_count(), 0);
        m.from_json(&payload).unwrap();
        assert_eq!(m.list_parsed_items().len(), 2);
        assert_eq!(m.list_parsed_items()[1].props["x"], json!(1));
    }

    #[test]
    fn undo_then_redo_restores_current_version() {
        let m = SceneManager::new(Settings::default());
        m.register_item("rect", props(&[]));
        m.take_snapshot("one", "rect()");
        m.register_item("rect", props(&[]));
        m.take_snapshot("two", "rect()");

        assert_eq!(m.current_version(), 2);
        assert_eq!(m.undo(), Some(1));
        assert_eq!(m.item_count(), 1);
        assert!(m.can_redo());
        assert_eq!(m.redo(), Some(2));
        assert_eq!(m.current_version(), 2);
        assert_eq!(m.item_count(), 2);
        assert!(!m.can_redo());
    }

    #[test]
    fn undo_at_oldest_fails() {
        let m = SceneManager::new(Settings::default());
        assert_eq!(m.undo(), None);
        m.take_snapshot("only", "");
        assert_eq!(m.undo(), None);
    }

    #[test]
    fn snapshot_truncates_redo_stack() {
        let m = SceneManager::new(Settings::default());
        m.take_snapshot("one", "");
        m.register_item("rect", props(&[]));
        m.take_snapshot("two", "");
        m.undo();
        assert!(m.can_redo());

        m.take_snapshot("branch", "");
        assert!(!m.can_redo());
        assert_eq!(m.redo(), None);
        assert_eq!(m.current_version(), 3);
    }

    #[test]
    fn goto_jumps_and_clears_redo() {
        let m = SceneManager::new(Settings::default());
        for i in 0..3 {
            m.register_item("rect", props(&[]));
            m.take_snapshot(&format!("v{i}"), "");
        }
        m.undo();
        assert!(m.can_redo());
        assert_eq!(m.goto_version(1).unwrap(), 1);
        assert_eq!(m.item_count(), 1);
        assert!(!m.can_redo());
        assert!(matches!(
            m.goto_version(99),
            Err(crate::error::Error::NotFound(_))
        ));
    }

    #[test]
    fn settings_survive_import() {
        let m = SceneManager::new(Settings::default());
        m.set_size(640, 480);
        m.set_background("#ffffff");
        let payload = m.to_json();

        let fresh = SceneManager::new(Settings::default());
        fresh.from_json(&payload).unwrap();
        let s = fresh.settings();
        assert_eq!((s.width, s.height), (640, 480));
        assert_eq!(s.background, "#ffffff");
    }
}
