//! PTY-backed terminals reified as files.
//!
//! Each live terminal is a directory `terms/<id>/` holding `ctl`, `stdin`,
//! `stdout`, `input`, `output` and `interrupt`. The shell runs on a real
//! PTY (openpty + setsid + TIOCSCTTY in the child); one task per terminal
//! drains the master side, strips ANSI control sequences and feeds the
//! blocking `stdout` stream. A debounce timer marks the batch ready once
//! the shell has been quiet for the configured interval.
//!
//! Files hold weak references to their terminal record so the filesystem
//! never keeps a dead terminal alive; operations on a vanished terminal
//! fail with "no longer exists".

use {
    crate::{
        ctl::CtlHandler,
        error::{Error, Result},
        node::{Dir, FileNode, FileOps, Node},
        sandbox::Sandbox,
        stream::{StreamFile, StreamMode},
    },
    async_trait::async_trait,
    log::{info, warn},
    nix::{
        sys::signal::{Signal, killpg},
        unistd::Pid,
    },
    std::{
        collections::{HashMap, HashSet},
        os::fd::OwnedFd,
        path::PathBuf,
        process::Stdio,
        sync::{
            Arc, Mutex, Weak,
            atomic::{AtomicU32, AtomicU64, Ordering},
        },
        time::Duration,
    },
    tokio::{io::AsyncReadExt, task::JoinHandle},
};

/// Sink for bytes written to a terminal's `output` file, normally the
/// embedded terminal widget. Held weakly: the file layer must never extend
/// a widget's lifetime.
pub trait TermDisplay: Send + Sync {
    fn show(&self, term_id: &str, bytes: &[u8]);
}

/// Strips ANSI control sequences from PTY output. Stateful so a sequence
/// split across read chunks is still recognized.
#[derive(Default)]
pub struct AnsiStripper {
    state: StripState,
}

#[derive(Default, Clone, Copy, PartialEq)]
enum StripState {
    #[default]
    Ground,
    Esc,
    Csi,
    Osc,
    OscEsc,
}

impl AnsiStripper {
    pub fn strip(&mut self, input: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(input.len());
        for &b in input {
            self.state = match self.state {
                StripState::Ground => match b {
                    0x1b => StripState::Esc,
                    b'\r' => StripState::Ground,
                    _ => {
                        out.push(b);
                        StripState::Ground
                    }
                },
                StripState::Esc => match b {
                    b'[' => StripState::Csi,
                    b']' => StripState::Osc,
                    // Two-byte escape: drop the discriminant as well.
                    _ => StripState::Ground,
                },
                StripState::Csi => {
                    // Parameter and intermediate bytes continue; a final
                    // byte (0x40..=0x7e) ends the sequence.
                    if (0x40..=0x7e).contains(&b) {
                        StripState::Ground
                    } else {
                        StripState::Csi
                    }
                }
                StripState::Osc => match b {
                    0x07 => StripState::Ground,
                    0x1b => StripState::OscEsc,
                    _ => StripState::Osc,
                },
                StripState::OscEsc => match b {
                    b'\\' => StripState::Ground,
                    _ => StripState::Osc,
                },
            };
        }
        out
    }
}

/// The blocking `stdout` stream plus the capture gate and debounce state.
pub struct TermOutput {
    stream: StreamFile,
    stripper: Mutex<AnsiStripper>,
    capturing: std::sync::atomic::AtomicBool,
    generation: AtomicU64,
    quiet: Duration,
}

impl TermOutput {
    fn new(quiet: Duration) -> Arc<TermOutput> {
        Arc::new(TermOutput {
            stream: StreamFile::new(StreamMode::Blocking),
            stripper: Mutex::new(AnsiStripper::default()),
            capturing: std::sync::atomic::AtomicBool::new(false),
            generation: AtomicU64::new(0),
            quiet,
        })
    }

    /// Arm the capture window: clear the buffer and start collecting.
    pub fn start_capture(&self) {
        self.stream.reset();
        self.capturing.store(true, Ordering::SeqCst);
    }

    /// Inject a message (sandbox rejection, forwarding failure) as its own
    /// ready batch.
    pub fn feed_error(&self, message: &str) {
        self.stream.reset();
        self.stream.post(message.as_bytes());
        self.stream.post(b"\n");
        self.stream.mark_ready();
    }

    /// PTY reader callback. Stripping always runs so sequence state stays
    /// coherent; bytes are only kept while a capture window is open.
    fn feed(self: &Arc<Self>, bytes: &[u8]) {
        let stripped = self.stripper.lock().unwrap().strip(bytes);
        if stripped.is_empty() || !self.capturing.load(Ordering::SeqCst) {
            return;
        }
        self.stream.post(&stripped);

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let this = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(this.quiet).await;
            if this.generation.load(Ordering::SeqCst) == generation {
                // mark_ready is a no-op on an empty buffer, so a quiet
                // window with nothing captured never wakes readers.
                this.stream.mark_ready();
            }
        });
    }

    pub async fn read_at(&self, offset: u64, count: u32) -> Vec<u8> {
        self.stream.read_at(offset, count).await
    }
}

/// One live terminal.
pub struct TermRecord {
    pub term_id: String,
    shell_pid: Pid,
    master: OwnedFd,
    font: AtomicU32,
    connected_agent: Mutex<Option<String>>,
    known_agents: Mutex<HashSet<String>>,
    stdout: Arc<TermOutput>,
    output: StreamFile,
    display: Mutex<Option<Weak<dyn TermDisplay>>>,
}

impl TermRecord {
    pub fn shell_pid(&self) -> i32 {
        self.shell_pid.as_raw()
    }

    pub fn connected_agent(&self) -> Option<String> {
        self.connected_agent.lock().unwrap().clone()
    }

    pub fn set_display(&self, display: Weak<dyn TermDisplay>) {
        *self.display.lock().unwrap() = Some(display);
    }

    fn write_pty(&self, bytes: &[u8]) -> Result<()> {
        nix::unistd::write(&self.master, bytes)
            .map_err(|e| Error::Io(std::io::Error::from_raw_os_error(e as i32)))?;
        Ok(())
    }

    /// Gate a command through the sandbox and hand it to the shell. The
    /// caller's write succeeds either way; a rejection is observable only
    /// by reading `stdout`.
    fn submit_command(&self, sandbox: &Sandbox, command: &str) -> Result<()> {
        let command = command.trim();
        if command.is_empty() {
            return Ok(());
        }
        let (ok, reason) = sandbox.validate(command);
        if !ok {
            warn!("terminal {}: sandbox rejected: {reason}", self.term_id);
            self.stdout.feed_error(&format!("SANDBOX BLOCKED: {reason}"));
            return Ok(());
        }
        if let Some(agent) = parse_agent_registration(command) {
            info!("terminal {}: agent '{agent}' registered", self.term_id);
            self.known_agents.lock().unwrap().insert(agent.clone());
            *self.connected_agent.lock().unwrap() = Some(agent);
        }
        self.stdout.start_capture();
        let mut line = command.as_bytes().to_vec();
        line.push(b'\n');
        self.write_pty(&line)
    }
}

/// `echo 'new <name>'` in a command line announces an agent that wants this
/// terminal as its console.
fn parse_agent_registration(command: &str) -> Option<String> {
    for quote in ['\'', '"'] {
        let needle = format!("echo {quote}new ");
        if let Some(start) = command.find(&needle) {
            let rest = &command[start + needle.len()..];
            let name = rest.split(quote).next()?.trim();
            if !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
                return Some(name.to_string());
            }
        }
    }
    None
}

fn upgrade(rec: &Weak<TermRecord>) -> Result<Arc<TermRecord>> {
    rec.upgrade().ok_or(Error::Gone)
}

/// Spawn a shell on a fresh PTY. The child becomes a session leader with
/// the slave as its controlling terminal, Alacritty-style.
fn spawn_shell(shell: &str) -> Result<(OwnedFd, Pid)> {
    use std::os::unix::process::CommandExt;

    let pty = nix::pty::openpty(None, None)
        .map_err(|e| Error::Io(std::io::Error::from_raw_os_error(e as i32)))?;

    let mut cmd = std::process::Command::new(shell);
    cmd.stdin(Stdio::from(pty.slave.try_clone()?))
        .stdout(Stdio::from(pty.slave.try_clone()?))
        .stderr(Stdio::from(pty.slave))
        .env("TERM", "xterm-256color");
    unsafe {
        cmd.pre_exec(|| {
            if nix::libc::setsid() == -1 {
                return Err(std::io::Error::last_os_error());
            }
            // stdin is the PTY slave at this point.
            if nix::libc::ioctl(0, nix::libc::TIOCSCTTY as nix::libc::c_ulong, 0) == -1 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }
    let child = cmd.spawn()?;

    Ok((pty.master, Pid::from_raw(child.id() as i32)))
}

pub struct TermSettings {
    pub shell: String,
    pub debounce: Duration,
    pub llmfs_mount: PathBuf,
}

/// Owner of all terminal records and their subtree under `terms/`.
pub struct TermManager {
    terms_dir: Arc<Dir>,
    sandbox: Arc<Sandbox>,
    settings: TermSettings,
    records: Mutex<HashMap<String, (Arc<TermRecord>, JoinHandle<()>)>>,
    next_id: AtomicU32,
}

impl TermManager {
    pub fn new(terms_dir: Arc<Dir>, sandbox: Arc<Sandbox>, settings: TermSettings) -> TermManager {
        TermManager {
            terms_dir,
            sandbox,
            settings,
            records: Mutex::new(HashMap::new()),
            next_id: AtomicU32::new(1),
        }
    }

    /// Spawn a shell and reify it under `terms/<id>/`. Returns the id.
    pub fn spawn(&self) -> Result<String> {
        let term_id = format!("t{}", self.next_id.fetch_add(1, Ordering::Relaxed));
        let (master, shell_pid) = spawn_shell(&self.settings.shell)?;

        let reader_fd = master.try_clone()?;
        let record = Arc::new(TermRecord {
            term_id: term_id.clone(),
            shell_pid,
            master,
            font: AtomicU32::new(12),
            connected_agent: Mutex::new(None),
            known_agents: Mutex::new(HashSet::new()),
            stdout: TermOutput::new(self.settings.debounce),
            output: StreamFile::new(StreamMode::Blocking),
            display: Mutex::new(None),
        });

        let reader = {
            let rec = Arc::downgrade(&record);
            let mut file = tokio::fs::File::from_std(std::fs::File::from(reader_fd));
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                loop {
                    match file.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            let Some(rec) = rec.upgrade() else { break };
                            rec.stdout.feed(&buf[..n]);
                        }
                    }
                }
            })
        };

        let dir = Dir::new(term_id.clone());
        let weak = Arc::downgrade(&record);
        dir.add(FileNode::new(
            "ctl",
            Arc::new(crate::ctl::CtlFile::new(TermCtl {
                rec: weak.clone(),
                sandbox: self.sandbox.clone(),
            })),
        ));
        dir.add(FileNode::new(
            "stdin",
            Arc::new(StdinFile {
                rec: weak.clone(),
                sandbox: self.sandbox.clone(),
            }),
        ));
        dir.add(FileNode::new("stdout", Arc::new(StdoutFile { rec: weak.clone() })));
        dir.add(FileNode::new(
            "input",
            Arc::new(InputFile {
                rec: weak.clone(),
                llmfs_mount: self.settings.llmfs_mount.clone(),
            }),
        ));
        dir.add(FileNode::new("output", Arc::new(OutputFile { rec: weak.clone() })));
        dir.add(FileNode::new("interrupt", Arc::new(InterruptFile { rec: weak })));
        self.terms_dir.add(Node::Dir(dir));

        info!("terminal {term_id} spawned: pid {}", shell_pid.as_raw());
        self.records
            .lock()
            .unwrap()
            .insert(term_id.clone(), (record, reader));
        Ok(term_id)
    }

    pub fn get(&self, term_id: &str) -> Option<Arc<TermRecord>> {
        self.records
            .lock()
            .unwrap()
            .get(term_id)
            .map(|(rec, _)| rec.clone())
    }

    pub fn ids(&self) -> Vec<String> {
        self.records.lock().unwrap().keys().cloned().collect()
    }

    /// Tear a terminal down: SIGTERM to its process group, stop the reader,
    /// unlink its directory.
    pub fn remove(&self, term_id: &str) -> Result<()> {
        let (record, reader) = self
            .records
            .lock()
            .unwrap()
            .remove(term_id)
            .ok_or_else(|| crate::not_found!("terminal {term_id}"))?;
        if let Err(e) = killpg(record.shell_pid, Signal::SIGTERM) {
            warn!("terminal {term_id}: SIGTERM failed: {e}");
        }
        reader.abort();
        // Reap the shell off the async runtime.
        let pid = record.shell_pid;
        std::thread::spawn(move || {
            let _ = nix::sys::wait::waitpid(pid, None);
        });
        self.terms_dir.remove(term_id);
        info!("terminal {term_id} removed");
        Ok(())
    }

    pub fn shutdown(&self) {
        for id in self.ids() {
            let _ = self.remove(&id);
        }
    }
}

/// `terms/<id>/ctl`: `font <n>` adjusts the font; anything else is treated
/// as a shell command and goes through the same gate as `stdin`.
struct TermCtl {
    rec: Weak<TermRecord>,
    sandbox: Arc<Sandbox>,
}

#[async_trait]
impl CtlHandler for TermCtl {
    async fn command(&self, verb: &str, arg: &str) -> Result<Option<String>> {
        let rec = upgrade(&self.rec)?;
        match verb {
            "font" => {
                let size: u32 = arg.parse().map_err(|_| crate::usage!("font takes a point size"))?;
                rec.font.store(size, Ordering::SeqCst);
                Ok(None)
            }
            _ => {
                let command = if arg.is_empty() {
                    verb.to_string()
                } else {
                    format!("{verb} {arg}")
                };
                rec.submit_command(&self.sandbox, &command)?;
                Ok(None)
            }
        }
    }

    async fn status(&self) -> Vec<(String, String)> {
        let Ok(rec) = upgrade(&self.rec) else {
            return vec![("state".into(), "gone".into())];
        };
        let mut status = vec![
            ("font".into(), rec.font.load(Ordering::SeqCst).to_string()),
            ("pid".into(), rec.shell_pid().to_string()),
        ];
        if let Some(agent) = rec.connected_agent() {
            status.push(("agent".into(), agent));
        }
        status
    }
}

/// `terms/<id>/stdin`: write-only gated command entry.
struct StdinFile {
    rec: Weak<TermRecord>,
    sandbox: Arc<Sandbox>,
}

#[async_trait]
impl FileOps for StdinFile {
    async fn read(&self, _fid: u32, _offset: u64, _count: u32) -> Result<Vec<u8>> {
        Err(Error::Permission)
    }

    async fn write(&self, _fid: u32, _offset: u64, data: &[u8]) -> Result<u32> {
        let rec = upgrade(&self.rec)?;
        let command = String::from_utf8_lossy(data);
        rec.submit_command(&self.sandbox, &command)?;
        Ok(data.len() as u32)
    }
}

/// `terms/<id>/stdout`: blocking read of captured, ANSI-stripped output.
struct StdoutFile {
    rec: Weak<TermRecord>,
}

#[async_trait]
impl FileOps for StdoutFile {
    async fn read(&self, _fid: u32, offset: u64, count: u32) -> Result<Vec<u8>> {
        let rec = upgrade(&self.rec)?;
        Ok(rec.stdout.read_at(offset, count).await)
    }
}

/// `terms/<id>/input`: forwards to the connected agent's `input` file on
/// the agent filesystem mount. No-op without a connected agent.
struct InputFile {
    rec: Weak<TermRecord>,
    llmfs_mount: PathBuf,
}

#[async_trait]
impl FileOps for InputFile {
    async fn read(&self, _fid: u32, _offset: u64, _count: u32) -> Result<Vec<u8>> {
        Err(Error::Permission)
    }

    async fn write(&self, _fid: u32, _offset: u64, data: &[u8]) -> Result<u32> {
        let rec = upgrade(&self.rec)?;
        let Some(agent) = rec.connected_agent() else {
            return Ok(data.len() as u32);
        };
        let path = self.llmfs_mount.join("agents").join(&agent).join("input");
        use tokio::io::AsyncWriteExt;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(data).await?;
        Ok(data.len() as u32)
    }
}

/// `terms/<id>/output`: bidirectional. Writes go to the terminal's display
/// (when one is attached) and into a blocking mirror buffer; reads tap the
/// mirror. The natural destination for an agent's output route.
struct OutputFile {
    rec: Weak<TermRecord>,
}

#[async_trait]
impl FileOps for OutputFile {
    async fn read(&self, _fid: u32, offset: u64, count: u32) -> Result<Vec<u8>> {
        let rec = upgrade(&self.rec)?;
        Ok(rec.output.read_at(offset, count).await)
    }

    async fn write(&self, _fid: u32, _offset: u64, data: &[u8]) -> Result<u32> {
        let rec = upgrade(&self.rec)?;
        let display = rec.display.lock().unwrap().clone();
        if let Some(display) = display.and_then(|w| w.upgrade()) {
            display.show(&rec.term_id, data);
        }
        rec.output.post(data);
        rec.output.mark_ready();
        Ok(data.len() as u32)
    }
}

/// `terms/<id>/interrupt`: any write sends SIGINT to the shell's group.
struct InterruptFile {
    rec: Weak<TermRecord>,
}

#[async_trait]
impl FileOps for InterruptFile {
    async fn read(&self, _fid: u32, _offset: u64, _count: u32) -> Result<Vec<u8>> {
        Err(Error::Permission)
    }

    async fn write(&self, _fid: u32, _offset: u64, data: &[u8]) -> Result<u32> {
        let rec = upgrade(&self.rec)?;
        killpg(Pid::from_raw(rec.shell_pid()), Signal::SIGINT)
            .map_err(|e| Error::Io(std::io::Error::from_raw_os_error(e as i32)))?;
        Ok(data.len() as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    fn strip_all(input: &[u8]) -> Vec<u8> {
        AnsiStripper::default().strip(input)
    }

    #[test]
    fn strips_csi_sequences() {
        assert_eq!(strip_all(b"\x1b[31mred\x1b[0m"), b"red");
        assert_eq!(strip_all(b"\x1b[2J\x1b[Hclear"), b"clear");
    }

    #[test]
    fn strips_osc_sequences_with_both_terminators() {
        assert_eq!(strip_all(b"\x1b]0;title\x07body"), b"body");
        assert_eq!(strip_all(b"\x1b]0;title\x1b\\body"), b"body");
    }

    #[test]
    fn strips_two_byte_escapes_and_carriage_returns() {
        assert_eq!(strip_all(b"\x1b=hi\r\n"), b"hi\n");
        assert_eq!(strip_all(b"a\rb"), b"ab");
    }

    #[test]
    fn sequences_split_across_chunks_are_still_stripped() {
        let mut s = AnsiStripper::default();
        let mut out = s.strip(b"one\x1b[3");
        out.extend(s.strip(b"1mtwo"));
        assert_eq!(out, b"onetwo");
    }

    #[test]
    fn agent_registration_is_parsed_from_echo() {
        assert_eq!(
            parse_agent_registration("echo 'new claude'"),
            Some("claude".to_string())
        );
        assert_eq!(
            parse_agent_registration("setup && echo \"new helper-2\""),
            Some("helper-2".to_string())
        );
        assert_eq!(parse_agent_registration("echo 'hello'"), None);
        assert_eq!(parse_agent_registration("ls -la"), None);
    }

    fn manager() -> TermManager {
        TermManager::new(
            Dir::new("terms"),
            Arc::new(Sandbox::new("/mnt/rio")),
            TermSettings {
                shell: "/bin/sh".to_string(),
                debounce: Duration::from_millis(60),
                llmfs_mount: PathBuf::from("/mnt/llm"),
            },
        )
    }

    #[tokio::test]
    async fn shell_output_reaches_stdout_after_debounce() {
        let mgr = manager();
        let id = mgr.spawn().expect("pty spawn");
        let rec = mgr.get(&id).unwrap();

        rec.submit_command(mgr.sandbox.as_ref(), "echo rio_works").unwrap();
        let out = timeout(Duration::from_secs(5), rec.stdout.read_at(0, 65536))
            .await
            .expect("stdout must become ready");
        let text = String::from_utf8_lossy(&out);
        assert!(text.contains("rio_works"), "captured: {text:?}");
        mgr.shutdown();
    }

    #[tokio::test]
    async fn sandbox_rejection_lands_in_stdout_and_shell_survives() {
        let mgr = manager();
        let id = mgr.spawn().expect("pty spawn");
        let rec = mgr.get(&id).unwrap();

        rec.submit_command(mgr.sandbox.as_ref(), "rm -rf /").unwrap();
        let out = timeout(Duration::from_secs(2), rec.stdout.read_at(0, 65536))
            .await
            .expect("rejection must be readable");
        let text = String::from_utf8_lossy(&out);
        assert!(text.starts_with("SANDBOX BLOCKED: "), "got: {text:?}");

        // Shell process group still exists.
        assert!(nix::sys::signal::kill(Pid::from_raw(rec.shell_pid()), None).is_ok());
        mgr.shutdown();
    }

    #[tokio::test]
    async fn output_file_mirrors_writes_into_the_blocking_buffer() {
        let mgr = manager();
        let id = mgr.spawn().expect("pty spawn");
        let rec = mgr.get(&id).unwrap();
        let file = OutputFile {
            rec: Arc::downgrade(&rec),
        };

        file.write(1, 0, b"agent says hi\n").await.unwrap();
        let out = timeout(Duration::from_secs(1), file.read(2, 0, 4096))
            .await
            .expect("mirrored write must be readable")
            .unwrap();
        assert_eq!(out, b"agent says hi\n");
        mgr.shutdown();
    }

    #[tokio::test]
    async fn files_fail_gracefully_once_the_terminal_is_gone() {
        let mgr = manager();
        let id = mgr.spawn().expect("pty spawn");
        let rec = mgr.get(&id).unwrap();
        let stdin = StdinFile {
            rec: Arc::downgrade(&rec),
            sandbox: mgr.sandbox.clone(),
        };
        drop(rec);
        mgr.remove(&id).unwrap();

        assert!(matches!(stdin.write(1, 0, b"ls\n").await, Err(Error::Gone)));
        assert!(mgr.get(&id).is_none());
    }

    #[tokio::test]
    async fn removed_terminal_disappears_from_the_tree() {
        let mgr = manager();
        let id = mgr.spawn().expect("pty spawn");
        assert!(mgr.terms_dir.child(&id).is_some());
        mgr.remove(&id).unwrap();
        assert!(mgr.terms_dir.child(&id).is_none());
    }
}
