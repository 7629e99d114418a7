//! Root assembly: wire every subsystem into one tree and hand out the
//! dispatcher that transports drive.

use {
    crate::{
        ctl::CtlFile,
        dispatch::Dispatch,
        node::{Dir, FileNode, Node},
        routes::{RouteManager, RoutesFile},
        sandbox::Sandbox,
        scene::{SceneManager, Settings},
        scene_fs::{
            ParseFile, PlaceholderScreen, RootCtl, SceneCtl, SceneRunner, ScreenFile,
            ScreenSource, StateFile, VarsFile, VersionFile,
        },
        term::{TermManager, TermSettings},
    },
    log::{info, warn},
    std::{path::PathBuf, sync::Arc, time::Duration},
};

pub struct Config {
    /// Where this tree is mounted on the host; route paths and the sandbox
    /// write policy are relative to it.
    pub mount_root: PathBuf,
    /// Mount point of the agent filesystem, for `terms/*/input` forwarding.
    pub llmfs_mount: PathBuf,
    /// Shell spawned for new terminals.
    pub shell: String,
    /// Quiet interval before terminal output is marked ready.
    pub debounce: Duration,
    /// Default target of root `ctl` `save`/`load`.
    pub state_path: PathBuf,
    /// Initial display settings.
    pub settings: Settings,
    /// When false, every shell command passes the sandbox.
    pub sandbox_enabled: bool,
    /// Renderer hook for the `screen` file.
    pub screen_source: Option<Arc<dyn ScreenSource>>,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            mount_root: PathBuf::from("/mnt/rio"),
            llmfs_mount: PathBuf::from("/mnt/llm"),
            shell: std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string()),
            debounce: Duration::from_millis(120),
            state_path: std::env::temp_dir().join("rio-state.json"),
            settings: Settings::default(),
            sandbox_enabled: true,
            screen_source: None,
        }
    }
}

/// The assembled server. Owns the tree and every subsystem behind it.
pub struct Rio {
    pub dispatch: Arc<Dispatch>,
    pub runner: Arc<SceneRunner>,
    pub terms: Arc<TermManager>,
    pub routes: Arc<RouteManager>,
}

impl Rio {
    pub fn new(config: Config) -> Rio {
        let sandbox = if config.sandbox_enabled {
            Arc::new(Sandbox::new(config.mount_root.clone()))
        } else {
            warn!("sandbox disabled: running with the permissive fallback policy");
            Arc::new(Sandbox::permissive(config.mount_root.clone()))
        };

        let scene = Arc::new(SceneManager::new(config.settings.clone()));
        let runner = SceneRunner::new(scene.clone());

        let terms_dir = Dir::new("terms");
        let terms = Arc::new(TermManager::new(
            terms_dir.clone(),
            sandbox,
            TermSettings {
                shell: config.shell.clone(),
                debounce: config.debounce,
                llmfs_mount: config.llmfs_mount.clone(),
            },
        ));

        let routes = RouteManager::new(config.mount_root.clone());

        let screen: Arc<dyn ScreenSource> = config
            .screen_source
            .unwrap_or_else(|| Arc::new(PlaceholderScreen));

        let scene_dir = Dir::new("scene");
        scene_dir.add(FileNode::new(
            "ctl",
            Arc::new(CtlFile::new(SceneCtl::new(runner.clone()))),
        ));
        scene_dir.add(FileNode::new("parse", Arc::new(ParseFile::new(runner.clone()))));
        scene_dir.add(FileNode::new("stdout", runner.stdout.clone()));
        scene_dir.add(FileNode::new("STDERR", runner.stderr.clone()));
        scene_dir.add(FileNode::new("vars", Arc::new(VarsFile::new(runner.clone()))));
        scene_dir.add(FileNode::new("state", Arc::new(StateFile::new(runner.clone()))));
        scene_dir.add(FileNode::new(
            "version",
            Arc::new(VersionFile::new(scene.clone())),
        ));

        let root = Dir::new("/");
        root.add(FileNode::new(
            "ctl",
            Arc::new(CtlFile::new(RootCtl::new(
                runner.clone(),
                config.state_path.clone(),
            ))),
        ));
        root.add(FileNode::new("screen", Arc::new(ScreenFile::new(screen))));
        root.add(FileNode::new("CONTEXT", runner.context.clone()));
        root.add(FileNode::new("routes", Arc::new(RoutesFile::new(routes.clone()))));
        root.add(Node::Dir(terms_dir));
        root.add(Node::Dir(scene_dir));

        let dispatch = Dispatch::new(Node::Dir(root));
        routes.set_dispatch(&dispatch);

        info!(
            "riofs assembled: mount root {}, shell {}",
            config.mount_root.display(),
            config.shell
        );

        Rio {
            dispatch,
            runner,
            terms,
            routes,
        }
    }

    /// Stop route workers and tear down terminals.
    pub fn shutdown(&self) {
        self.routes.stop_all();
        self.terms.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::OpenMode;
    use std::time::Duration;
    use tokio::time::timeout;

    fn rio() -> Rio {
        Rio::new(Config::default())
    }

    async fn submit(rio: &Rio, code: &str) {
        let fid = rio
            .dispatch
            .open_path("/scene/parse", OpenMode::WRITE)
            .await
            .unwrap();
        rio.dispatch.write(fid, 0, code.as_bytes()).await.unwrap();
        rio.dispatch.clunk(fid).await.unwrap();
    }

    async fn read_all(rio: &Rio, path: &str) -> Vec<u8> {
        let fid = rio.dispatch.open_path(path, OpenMode::READ).await.unwrap();
        let mut out = Vec::new();
        loop {
            let chunk = rio
                .dispatch
                .read(fid, out.len() as u64, 65536)
                .await
                .unwrap();
            if chunk.is_empty() {
                break;
            }
            out.extend_from_slice(&chunk);
        }
        rio.dispatch.clunk(fid).await.unwrap();
        out
    }

    #[tokio::test]
    async fn tree_has_the_published_layout() {
        let rio = rio();
        let root = rio.dispatch.attach().await;
        rio.dispatch.open(root, OpenMode::READ).await.unwrap();
        let listing = rio.dispatch.read(root, 0, 4096).await.unwrap();
        assert_eq!(
            String::from_utf8(listing).unwrap(),
            "ctl\nscreen\nCONTEXT\nroutes\nterms/\nscene/\n"
        );

        for path in [
            "/scene/ctl",
            "/scene/parse",
            "/scene/stdout",
            "/scene/STDERR",
            "/scene/vars",
            "/scene/state",
            "/scene/version",
        ] {
            assert!(rio.dispatch.resolves(path), "{path} missing");
        }
    }

    #[tokio::test]
    async fn idle_stdout_is_empty_while_stderr_blocks() {
        let rio = rio();
        let out = rio
            .dispatch
            .open_path("/scene/stdout", OpenMode::READ)
            .await
            .unwrap();
        let got = timeout(Duration::from_millis(10), rio.dispatch.read(out, 0, 4096))
            .await
            .expect("idle stdout must answer immediately")
            .unwrap();
        assert!(got.is_empty());

        let err = rio
            .dispatch
            .open_path("/scene/STDERR", OpenMode::READ)
            .await
            .unwrap();
        assert!(
            timeout(Duration::from_millis(100), rio.dispatch.read(err, 0, 4096))
                .await
                .is_err(),
            "STDERR must block with no producer"
        );
        rio.dispatch.clunk(err).await.unwrap();
    }

    #[tokio::test]
    async fn parse_submission_shows_up_in_stdout_and_version() {
        let rio = rio();
        submit(&rio, "x = 1\nprint(x)\n").await;

        let out = read_all(&rio, "/scene/stdout").await;
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "1\n→ None\n✓ Version 1\n"
        );

        let version = String::from_utf8(read_all(&rio, "/scene/version").await).unwrap();
        assert!(version.contains("1\t0 items\tx = 1 *\n"));
        assert!(version.contains("current 1\n"));
    }

    #[tokio::test]
    async fn malformed_code_is_never_a_protocol_error() {
        let rio = rio();
        let fid = rio
            .dispatch
            .open_path("/scene/parse", OpenMode::WRITE)
            .await
            .unwrap();
        let n = rio
            .dispatch
            .write(fid, 0, b"this is )( not a program")
            .await
            .unwrap();
        assert_eq!(n as usize, "this is )( not a program".len());
        rio.dispatch.clunk(fid).await.unwrap();

        let err = read_all(&rio, "/scene/STDERR").await;
        assert!(String::from_utf8(err).unwrap().starts_with("SyntaxError"));
    }

    #[tokio::test]
    async fn context_compacts_across_submissions() {
        let rio = rio();
        submit(&rio, "import math\na = 1\n").await;
        submit(&rio, "import math\na = 2\nprint(a)\n").await;

        let ctx = String::from_utf8(read_all(&rio, "/CONTEXT").await).unwrap();
        assert_eq!(ctx, "import math\na = 2\nprint(a)\n");
    }

    #[tokio::test]
    async fn route_delivers_execution_errors_to_a_terminal() {
        let rio = rio();
        let term_id = rio.terms.spawn().expect("pty spawn");

        let routes = rio
            .dispatch
            .open_path("/routes", OpenMode::rdwr())
            .await
            .unwrap();
        let line = format!("/scene/STDERR -> /terms/{term_id}/output\n");
        rio.dispatch.write(routes, 0, line.as_bytes()).await.unwrap();

        let listing = String::from_utf8(rio.dispatch.read(routes, 0, 4096).await.unwrap()).unwrap();
        assert_eq!(
            listing,
            format!("/scene/STDERR -> /terms/{term_id}/output [running]\n")
        );

        // Let the route worker block on STDERR before producing the error.
        tokio::time::sleep(Duration::from_millis(50)).await;
        submit(&rio, "nope_not_defined\n").await;

        let fid = rio
            .dispatch
            .open_path(&format!("/terms/{term_id}/output"), OpenMode::READ)
            .await
            .unwrap();
        let delivered = timeout(Duration::from_secs(2), rio.dispatch.read(fid, 0, 65536))
            .await
            .expect("route must deliver the error text")
            .unwrap();
        assert!(
            String::from_utf8_lossy(&delivered).contains("NameError"),
            "got {delivered:?}"
        );
        rio.dispatch.clunk(fid).await.unwrap();

        rio.dispatch.write(routes, 0, b"-/scene/STDERR\n").await.unwrap();
        rio.dispatch.clunk(routes).await.unwrap();
        let fresh = rio
            .dispatch
            .open_path("/routes", OpenMode::READ)
            .await
            .unwrap();
        assert_eq!(
            rio.dispatch.read(fresh, 0, 4096).await.unwrap(),
            b"(no routes)\n"
        );
        rio.shutdown();
    }

    #[tokio::test]
    async fn root_ctl_drives_display_settings() {
        let rio = rio();
        let ctl = rio.dispatch.open_path("/ctl", OpenMode::rdwr()).await.unwrap();
        rio.dispatch.write(ctl, 0, b"size 800 600\n").await.unwrap();
        rio.dispatch
            .write(ctl, 0, b"background #334455\n")
            .await
            .unwrap();

        let status = String::from_utf8(rio.dispatch.read(ctl, 0, 4096).await.unwrap()).unwrap();
        assert!(status.contains("width 800\n"));
        assert!(status.contains("height 600\n"));
        assert!(status.contains("background #334455\n"));
        rio.dispatch.clunk(ctl).await.unwrap();
    }

    #[tokio::test]
    async fn save_and_load_round_trip_through_disk() {
        let path = std::env::temp_dir().join(format!("riofs-state-{}.json", std::process::id()));
        let mut config = Config::default();
        config.state_path = path.clone();
        let rio = Rio::new(config);

        submit(&rio, "marker = 451\n").await;
        let ctl = rio.dispatch.open_path("/ctl", OpenMode::rdwr()).await.unwrap();
        rio.dispatch.write(ctl, 0, b"save\n").await.unwrap();
        rio.dispatch.write(ctl, 0, b"clear\n").await.unwrap();
        rio.dispatch.write(ctl, 0, b"load\n").await.unwrap();
        rio.dispatch.clunk(ctl).await.unwrap();

        let exec = rio.runner.exec.lock().await;
        assert_eq!(
            exec.get("marker"),
            Some(&crate::exec::Value::Int(451))
        );
        drop(exec);
        let _ = tokio::fs::remove_file(&path).await;
    }
}
