use std::{
    collections::BTreeSet,
    path::{Path, PathBuf},
    process::{ExitStatus, Stdio},
    sync::Arc,
    time::Duration,
};

use roomctl_process::{RoomId, RoomStatus};
use tokio::process::{Child, Command};

use crate::{
    config::ManagerConfig,
    console_log::{self, ConsoleSink, Stream},
    error::ManagerError,
    registry::{AlreadyExists, ManagedProcess, Registry, TerminationTicket},
};

#[derive(Debug, Clone)]
pub struct StartRequest {
    pub server_url: String,
    /// `None` draws a random 8-digit id.
    pub room_id: Option<RoomId>,
    pub autoconnect: bool,
}

impl StartRequest {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            room_id: None,
            autoconnect: true,
        }
    }

    pub fn room(mut self, room_id: RoomId) -> Self {
        self.room_id = Some(room_id);
        self
    }
}

/// How a stopped client went away. Only logged; callers see plain success.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    AlreadyExited(ExitStatus),
    Graceful(ExitStatus),
    Forced(ExitStatus),
}

pub fn build_command_line(
    exec: &Path,
    server_url: &str,
    room_id: &RoomId,
    autoconnect: bool,
) -> Vec<String> {
    let mut argv = vec![exec.display().to_string(), format!("--server={server_url}")];
    if autoconnect {
        argv.push("--autoconnect".to_string());
    }
    argv.push(format!("--room_id={room_id}"));
    argv
}

#[cfg(target_os = "linux")]
unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    // If we die (crash/kill), the client goes with us.
    let rc = unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) };
    if rc == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(all(unix, not(target_os = "linux")))]
unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    Ok(())
}

#[cfg(unix)]
fn signal_group(pgid: i32, sig: libc::c_int) {
    unsafe {
        libc::kill(-pgid, sig);
    }
}

fn request_graceful_exit(child: &mut Child, pgid: Option<i32>) {
    match pgid {
        #[cfg(unix)]
        Some(pgid) => signal_group(pgid, libc::SIGTERM),
        // No cooperative signal available.
        _ => {
            let _ = child.start_kill();
        }
    }
}

fn force_kill(child: &mut Child, pgid: Option<i32>) {
    #[cfg(unix)]
    if let Some(pgid) = pgid {
        signal_group(pgid, libc::SIGKILL);
    }
    #[cfg(not(unix))]
    let _ = pgid;
    let _ = child.start_kill();
}

/// SIGTERM, bounded wait, then SIGKILL and an unbounded wait.
async fn terminate(
    room_id: &RoomId,
    child: &mut Child,
    pgid: Option<i32>,
    grace: Duration,
) -> std::io::Result<StopOutcome> {
    if let Some(status) = child.try_wait()? {
        return Ok(StopOutcome::AlreadyExited(status));
    }

    request_graceful_exit(child, pgid);
    tracing::info!(room_id = %room_id, ?pgid, "sent SIGTERM");

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => Ok(StopOutcome::Graceful(status?)),
        Err(_) => {
            tracing::warn!(
                room_id = %room_id,
                grace_ms = grace.as_millis() as u64,
                "client ignored SIGTERM; sending SIGKILL"
            );
            force_kill(child, pgid);
            let status = child.wait().await?;
            Ok(StopOutcome::Forced(status))
        }
    }
}

/// Starts, tracks and tears down client processes keyed by room.
#[derive(Clone, Debug)]
pub struct ProcessManager {
    cfg: Arc<ManagerConfig>,
    registry: Arc<Registry>,
}

impl ProcessManager {
    pub fn new(cfg: ManagerConfig) -> Self {
        Self {
            cfg: Arc::new(cfg),
            registry: Arc::new(Registry::default()),
        }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.cfg
    }

    pub fn client_executable_present(&self) -> bool {
        self.cfg.client_executable.is_file()
    }

    async fn resolve_executable(&self) -> Result<PathBuf, ManagerError> {
        let exec = &self.cfg.client_executable;
        let not_found = || ManagerError::ExecutableNotFound(exec.clone());
        let meta = tokio::fs::metadata(exec).await.map_err(|_| not_found())?;
        if !meta.is_file() {
            return Err(not_found());
        }
        // Absolute, so a configured workdir cannot change what gets executed.
        tokio::fs::canonicalize(exec).await.map_err(|_| not_found())
    }

    fn spawn_client(&self, exec: &Path, argv: &[String]) -> std::io::Result<Child> {
        let mut cmd = Command::new(exec);
        cmd.args(&argv[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.cfg.client_workdir {
            cmd.current_dir(dir);
        }

        #[cfg(unix)]
        {
            unsafe {
                cmd.pre_exec(|| {
                    set_parent_death_signal()?;
                    if libc::setsid() == -1 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        cmd.spawn()
    }

    pub async fn start(&self, req: StartRequest) -> Result<RoomId, ManagerError> {
        let room_id = req.room_id.unwrap_or_else(RoomId::generate);
        let exec = match self.resolve_executable().await {
            Ok(p) => p,
            Err(err) => {
                tracing::error!(room_id = %room_id, %err, "cannot start client");
                return Err(err);
            }
        };

        // Fast path; the insert below is what actually enforces uniqueness.
        if self.registry.contains(room_id.as_str()).await {
            tracing::warn!(room_id = %room_id, "room already active");
            return Err(ManagerError::RoomAlreadyActive(room_id));
        }

        let argv = build_command_line(&exec, &req.server_url, &room_id, req.autoconnect);
        tracing::info!(room_id = %room_id, command = %argv.join(" "), "starting client");

        let child = self
            .spawn_client(&exec, &argv)
            .map_err(|source| {
                tracing::error!(room_id = %room_id, err = %source, "spawn failed");
                ManagerError::SpawnFailed {
                    room_id: room_id.clone(),
                    source,
                }
            })?;

        let pid = self.register(&room_id, argv, child).await?;
        tracing::info!(room_id = %room_id, ?pid, "started client");
        Ok(room_id)
    }

    /// Hands a freshly spawned client to the registry. Its console is attached
    /// only once the room is won; a losing duplicate is killed with its pipes
    /// unread.
    async fn register(
        &self,
        room_id: &RoomId,
        argv: Vec<String>,
        mut child: Child,
    ) -> Result<Option<u32>, ManagerError> {
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let pid = child.id();

        let process = ManagedProcess::new(room_id.clone(), argv, child);
        if let Err(AlreadyExists(mut lost)) = self.registry.insert(process).await {
            tracing::warn!(
                room_id = %room_id,
                ?pid,
                "room claimed concurrently; killing duplicate client"
            );
            let pgid = lost.pgid();
            if let Some(child) = lost.child_mut() {
                force_kill(child, pgid);
                let _ = child.wait().await;
            }
            return Err(ManagerError::RoomAlreadyActive(room_id.clone()));
        }

        let sink = ConsoleSink::open(&self.cfg, room_id);
        if let Some(out) = stdout {
            console_log::drain(out, Stream::Stdout, room_id.clone(), sink.clone());
        }
        if let Some(err) = stderr {
            console_log::drain(err, Stream::Stderr, room_id.clone(), sink);
        }
        Ok(pid)
    }

    /// Runs to completion even if the caller stops polling: the termination
    /// sequence lives on its own task.
    pub async fn stop(&self, room_id: &str) -> Result<StopOutcome, ManagerError> {
        let Some(ticket) = self.registry.begin_termination(room_id).await else {
            tracing::warn!(room_id, "no active connection found");
            return Err(ManagerError::RoomNotFound(room_id.to_string()));
        };

        let manager = self.clone();
        let room = ticket.room_id.clone();
        tokio::spawn(async move { manager.finish_stop(ticket).await })
            .await
            .unwrap_or_else(|join_err| {
                Err(ManagerError::TerminationFailed {
                    room_id: room,
                    source: std::io::Error::other(join_err.to_string()),
                })
            })
    }

    async fn finish_stop(&self, ticket: TerminationTicket) -> Result<StopOutcome, ManagerError> {
        let TerminationTicket {
            room_id,
            pgid,
            mut child,
        } = ticket;

        let result = terminate(&room_id, &mut child, pgid, self.cfg.stop_grace).await;
        self.registry.remove(room_id.as_str()).await;

        match result {
            Ok(outcome) => {
                tracing::info!(room_id = %room_id, ?outcome, "stopped client");
                Ok(outcome)
            }
            Err(source) => {
                tracing::error!(room_id = %room_id, err = %source, "could not confirm client exit");
                Err(ManagerError::TerminationFailed { room_id, source })
            }
        }
    }

    /// Number of registered rooms, including ones whose client already
    /// exited. Never prunes.
    pub async fn active_count(&self) -> usize {
        self.registry.len().await
    }

    /// Active room ids. Without `prune_exited_on_status`, clients that died on
    /// their own stay listed until stopped.
    pub async fn status(&self) -> BTreeSet<RoomId> {
        if self.cfg.prune_exited_on_status {
            for (room_id, status) in self.registry.prune_exited().await {
                tracing::info!(room_id = %room_id, %status, "pruned exited client");
            }
        }
        self.registry.list_ids().await
    }

    pub async fn describe(&self, room_id: &str) -> Option<RoomStatus> {
        self.registry.lookup(room_id).await
    }

    /// Stops every registered room concurrently.
    pub async fn shutdown_all(&self) {
        let ids = self.registry.list_ids().await;
        if ids.is_empty() {
            return;
        }
        tracing::info!(count = ids.len(), "stopping all clients");

        let mut set = tokio::task::JoinSet::new();
        for id in ids {
            let manager = self.clone();
            set.spawn(async move {
                if let Err(err) = manager.stop(id.as_str()).await {
                    tracing::warn!(room_id = %id, %err, "stop during shutdown failed");
                }
            });
        }
        while set.join_next().await.is_some() {}
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::{os::unix::fs::PermissionsExt, sync::OnceLock};

    use roomctl_process::RoomState;

    use super::*;

    struct Fixtures {
        _dir: tempfile::TempDir,
        root: PathBuf,
    }

    /// Scripts are written once, before any test spawns one, so no exec can
    /// race a still-open write handle.
    fn fixtures() -> &'static Fixtures {
        static FIXTURES: OnceLock<Fixtures> = OnceLock::new();
        FIXTURES.get_or_init(|| {
            let dir = tempfile::tempdir().unwrap();
            let root = dir.path().to_path_buf();
            let scripts = [
                ("sleeper.sh", "#!/bin/sh\necho \"ready $*\"\nexec sleep 30\n"),
                (
                    "stubborn.sh",
                    "#!/bin/sh\ntrap '' TERM\necho ready\nwhile true; do sleep 0.1; done\n",
                ),
                ("quick.sh", "#!/bin/sh\nexit 0\n"),
            ];
            for (name, body) in scripts {
                let path = root.join(name);
                std::fs::write(&path, body).unwrap();
                std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            }
            Fixtures { _dir: dir, root }
        })
    }

    fn manager(script: &str) -> ProcessManager {
        ProcessManager::new(ManagerConfig {
            client_executable: fixtures().root.join(script),
            stop_grace: Duration::from_secs(1),
            ..ManagerConfig::default()
        })
    }

    fn room(id: &str) -> RoomId {
        RoomId::parse(id).unwrap()
    }

    fn alive(pid: u32) -> bool {
        unsafe { libc::kill(pid as i32, 0) == 0 }
    }

    async fn wait_for_console(path: &Path, needle: &str) -> String {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let text = tokio::fs::read_to_string(path).await.unwrap_or_default();
            if text.contains(needle) || tokio::time::Instant::now() >= deadline {
                return text;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    #[test]
    fn command_line_flags() {
        let id = room("12345678");
        let exec = Path::new("/opt/client");
        assert_eq!(
            build_command_line(exec, "ws://sig:8080", &id, true),
            vec![
                "/opt/client",
                "--server=ws://sig:8080",
                "--autoconnect",
                "--room_id=12345678"
            ]
        );
        assert_eq!(
            build_command_line(exec, "ws://sig:8080", &id, false),
            vec!["/opt/client", "--server=ws://sig:8080", "--room_id=12345678"]
        );
    }

    #[tokio::test]
    async fn start_without_room_generates_numeric_id() {
        let m = manager("sleeper.sh");
        let id = m.start(StartRequest::new("ws://sig:8080")).await.unwrap();
        assert_eq!(id.as_str().len(), 8);
        assert!(id.as_str().chars().all(|c| c.is_ascii_digit()));
        assert!(m.status().await.contains(id.as_str()));

        m.stop(id.as_str()).await.unwrap();
        assert!(m.status().await.is_empty());
    }

    #[tokio::test]
    async fn status_lists_exactly_started_rooms() {
        let m = manager("sleeper.sh");
        for id in ["a1", "b2", "c3"] {
            m.start(StartRequest::new("ws://sig").room(room(id))).await.unwrap();
        }
        let ids: Vec<String> = m
            .status()
            .await
            .into_iter()
            .map(RoomId::into_string)
            .collect();
        assert_eq!(ids, vec!["a1", "b2", "c3"]);
        m.shutdown_all().await;
        assert!(m.status().await.is_empty());
    }

    #[tokio::test]
    async fn missing_executable_leaves_registry_untouched() {
        let m = ProcessManager::new(ManagerConfig {
            client_executable: fixtures().root.join("does-not-exist"),
            ..ManagerConfig::default()
        });
        let err = m.start(StartRequest::new("ws://sig")).await.unwrap_err();
        assert!(matches!(err, ManagerError::ExecutableNotFound(_)));
        assert_eq!(err.kind(), crate::ErrorKind::Execution);
        assert!(m.status().await.is_empty());
        assert!(!m.client_executable_present());
    }

    #[tokio::test]
    async fn duplicate_start_is_rejected_without_spawning() {
        let m = manager("sleeper.sh");
        m.start(StartRequest::new("ws://sig").room(room("dup"))).await.unwrap();
        let pid = m.describe("dup").await.unwrap().pid;

        let err = m
            .start(StartRequest::new("ws://sig").room(room("dup")))
            .await
            .unwrap_err();
        assert!(matches!(err, ManagerError::RoomAlreadyActive(_)));
        assert_eq!(err.kind(), crate::ErrorKind::Conflict);
        assert_eq!(m.status().await.len(), 1);
        assert_eq!(m.describe("dup").await.unwrap().pid, pid);

        m.stop("dup").await.unwrap();
    }

    #[tokio::test]
    async fn stop_unknown_room_is_not_found() {
        let m = manager("sleeper.sh");
        let err = m.stop("99999999").await.unwrap_err();
        assert!(matches!(err, ManagerError::RoomNotFound(_)));
        assert_eq!(err.kind(), crate::ErrorKind::NotFound);
        assert!(m.status().await.is_empty());
    }

    #[tokio::test]
    async fn stop_terminates_and_second_stop_is_not_found() {
        let m = manager("sleeper.sh");
        m.start(StartRequest::new("ws://sig").room(room("r1"))).await.unwrap();
        let pid = m.describe("r1").await.unwrap().pid.unwrap();
        assert!(alive(pid));

        let outcome = m.stop("r1").await.unwrap();
        assert!(matches!(outcome, StopOutcome::Graceful(_)));
        assert!(!alive(pid));
        assert!(m.describe("r1").await.is_none());

        let err = m.stop("r1").await.unwrap_err();
        assert!(matches!(err, ManagerError::RoomNotFound(_)));
    }

    #[tokio::test]
    async fn stubborn_client_is_force_killed_after_grace() {
        let logs = tempfile::tempdir().unwrap();
        let m = ProcessManager::new(ManagerConfig {
            client_executable: fixtures().root.join("stubborn.sh"),
            stop_grace: Duration::from_secs(1),
            console_log_dir: Some(logs.path().to_path_buf()),
            ..ManagerConfig::default()
        });
        m.start(StartRequest::new("ws://sig").room(room("stubborn")))
            .await
            .unwrap();
        // SIGTERM must land after the trap is installed.
        let console = logs.path().join("stubborn").join("console.log");
        assert!(wait_for_console(&console, "ready").await.contains("ready"));

        let started = tokio::time::Instant::now();
        let outcome = m.stop("stubborn").await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(1));
        assert!(matches!(outcome, StopOutcome::Forced(_)));
        assert!(m.status().await.is_empty());
    }

    #[tokio::test]
    async fn restart_after_stop_creates_fresh_entry() {
        let m = manager("sleeper.sh");
        m.start(StartRequest::new("ws://sig").room(room("again"))).await.unwrap();
        let first = m.describe("again").await.unwrap().pid;
        m.stop("again").await.unwrap();

        m.start(StartRequest::new("ws://sig").room(room("again"))).await.unwrap();
        let second = m.describe("again").await.unwrap();
        assert_eq!(second.state, RoomState::Running);
        assert_ne!(second.pid, first);
        m.stop("again").await.unwrap();
    }

    #[tokio::test]
    async fn exited_client_stays_listed_until_stopped() {
        let m = manager("quick.sh");
        m.start(StartRequest::new("ws://sig").room(room("gone"))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert!(m.status().await.contains("gone"));
        let outcome = m.stop("gone").await.unwrap();
        assert!(matches!(outcome, StopOutcome::AlreadyExited(_)));
        assert!(m.status().await.is_empty());
    }

    #[tokio::test]
    async fn prune_drops_exited_clients_when_enabled() {
        let m = ProcessManager::new(ManagerConfig {
            client_executable: fixtures().root.join("quick.sh"),
            prune_exited_on_status: true,
            ..ManagerConfig::default()
        });
        m.start(StartRequest::new("ws://sig").room(room("gone"))).await.unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !m.status().await.is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        assert!(m.status().await.is_empty());
    }

    #[tokio::test]
    async fn console_log_records_command_line() {
        let logs = tempfile::tempdir().unwrap();
        let m = ProcessManager::new(ManagerConfig {
            client_executable: fixtures().root.join("sleeper.sh"),
            console_log_dir: Some(logs.path().to_path_buf()),
            ..ManagerConfig::default()
        });
        let mut req = StartRequest::new("ws://sig:8080").room(room("logged"));
        req.autoconnect = false;
        m.start(req).await.unwrap();

        let console = logs.path().join("logged").join("console.log");
        let text = wait_for_console(&console, "ready").await;
        assert!(text.contains("[stdout] ready --server=ws://sig:8080 --room_id=logged"));

        let st = m.describe("logged").await.unwrap();
        assert_eq!(st.command_line.len(), 3);
        assert_eq!(st.command_line[2], "--room_id=logged");
        m.stop("logged").await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_distinct_starts_all_succeed() {
        let m = manager("sleeper.sh");
        let mut set = tokio::task::JoinSet::new();
        for i in 0..8 {
            let m = m.clone();
            set.spawn(async move {
                m.start(StartRequest::new("ws://sig").room(room(&format!("room{i}"))))
                    .await
            });
        }
        while let Some(res) = set.join_next().await {
            res.unwrap().unwrap();
        }
        assert_eq!(m.status().await.len(), 8);
        m.shutdown_all().await;
        assert!(m.status().await.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_same_room_starts_yield_one_winner() {
        let logs = tempfile::tempdir().unwrap();
        let m = ProcessManager::new(ManagerConfig {
            client_executable: fixtures().root.join("sleeper.sh"),
            console_log_dir: Some(logs.path().to_path_buf()),
            ..ManagerConfig::default()
        });
        for round in 0..5 {
            let id = format!("shared{round}");
            let mut set = tokio::task::JoinSet::new();
            for _ in 0..16 {
                let m = m.clone();
                let req = StartRequest::new("ws://sig").room(room(&id));
                set.spawn(async move { m.start(req).await });
            }

            let (mut ok, mut conflicts) = (0, 0);
            while let Some(res) = set.join_next().await {
                match res.unwrap() {
                    Ok(_) => ok += 1,
                    Err(ManagerError::RoomAlreadyActive(_)) => conflicts += 1,
                    Err(other) => panic!("unexpected error: {other}"),
                }
            }
            assert_eq!((ok, conflicts), (1, 15));
            assert_eq!(m.active_count().await, round + 1);

            let console = logs.path().join(&id).join("console.log");
            wait_for_console(&console, "ready").await;
            tokio::time::sleep(Duration::from_millis(200)).await;
            let text = tokio::fs::read_to_string(&console).await.unwrap();
            assert_eq!(text.matches("ready").count(), 1, "room {id}: {text}");
        }
        m.shutdown_all().await;
        assert!(m.status().await.is_empty());
    }

    #[tokio::test]
    async fn losing_duplicate_is_killed_before_touching_console() {
        let logs = tempfile::tempdir().unwrap();
        let m = ProcessManager::new(ManagerConfig {
            client_executable: fixtures().root.join("sleeper.sh"),
            console_log_dir: Some(logs.path().to_path_buf()),
            ..ManagerConfig::default()
        });
        let exec = m.resolve_executable().await.unwrap();
        let id = room("contested");

        let winner_argv = build_command_line(&exec, "ws://winner", &id, true);
        let loser_argv = build_command_line(&exec, "ws://loser", &id, true);
        let winner = m.spawn_client(&exec, &winner_argv).unwrap();
        let loser = m.spawn_client(&exec, &loser_argv).unwrap();
        let loser_pid = loser.id().unwrap();
        // Let the loser print before it loses.
        tokio::time::sleep(Duration::from_millis(200)).await;

        m.register(&id, winner_argv, winner).await.unwrap();
        let err = m.register(&id, loser_argv, loser).await.unwrap_err();
        assert!(matches!(err, ManagerError::RoomAlreadyActive(_)));
        assert!(!alive(loser_pid));
        assert_eq!(m.active_count().await, 1);

        let console = logs.path().join("contested").join("console.log");
        wait_for_console(&console, "ws://winner").await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        let text = tokio::fs::read_to_string(&console).await.unwrap();
        assert_eq!(text.lines().count(), 1, "{text}");
        assert!(text.starts_with("[stdout] ready --server=ws://winner"));
        assert!(!text.contains("ws://loser"));

        m.stop("contested").await.unwrap();
    }

    #[tokio::test]
    async fn active_count_never_prunes() {
        let m = ProcessManager::new(ManagerConfig {
            client_executable: fixtures().root.join("quick.sh"),
            prune_exited_on_status: true,
            ..ManagerConfig::default()
        });
        m.start(StartRequest::new("ws://sig").room(room("gone"))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(m.active_count().await, 1);
        assert_eq!(m.active_count().await, 1);

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !m.status().await.is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        assert_eq!(m.active_count().await, 0);
    }
}
