use std::{
    collections::{BTreeSet, HashMap},
    process::ExitStatus,
};

use roomctl_process::{RoomId, RoomState, RoomStatus};
use tokio::{process::Child, sync::Mutex};

/// One spawned client. Owned by the registry for its whole life; a stop
/// borrows the child handle through [`Registry::begin_termination`].
#[derive(Debug)]
pub struct ManagedProcess {
    room_id: RoomId,
    command_line: Vec<String>,
    pid: Option<u32>,
    pgid: Option<i32>,
    started_at_unix_ms: u64,
    state: RoomState,
    child: Option<Child>,
}

impl ManagedProcess {
    pub fn new(room_id: RoomId, command_line: Vec<String>, child: Child) -> Self {
        let pid = child.id();
        // Clients are spawned as session leaders, so pgid == pid.
        let pgid = if cfg!(unix) {
            pid.and_then(|p| i32::try_from(p).ok())
        } else {
            None
        };
        let started_at_unix_ms = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        Self {
            room_id,
            command_line,
            pid,
            pgid,
            started_at_unix_ms,
            state: RoomState::Running,
            child: Some(child),
        }
    }

    pub fn pgid(&self) -> Option<i32> {
        self.pgid
    }

    pub fn child_mut(&mut self) -> Option<&mut Child> {
        self.child.as_mut()
    }

    fn status(&self) -> RoomStatus {
        RoomStatus {
            room_id: self.room_id.clone(),
            state: self.state,
            pid: self.pid,
            command_line: self.command_line.clone(),
            started_at_unix_ms: self.started_at_unix_ms,
        }
    }
}

/// Returned by a rejected insert; hands the process back so the caller can
/// reap it instead of orphaning it.
#[derive(Debug)]
pub struct AlreadyExists(pub ManagedProcess);

/// Exclusive right to terminate one room, taken out of a `Running` entry.
#[derive(Debug)]
pub struct TerminationTicket {
    pub room_id: RoomId,
    pub pgid: Option<i32>,
    pub child: Child,
}

#[derive(Debug, Default)]
pub struct Registry {
    inner: Mutex<HashMap<RoomId, ManagedProcess>>,
}

impl Registry {
    pub async fn insert(&self, process: ManagedProcess) -> Result<(), AlreadyExists> {
        let mut map = self.inner.lock().await;
        if map.contains_key(&process.room_id) {
            return Err(AlreadyExists(process));
        }
        map.insert(process.room_id.clone(), process);
        Ok(())
    }

    pub async fn contains(&self, room_id: &str) -> bool {
        self.inner.lock().await.contains_key(room_id)
    }

    pub async fn lookup(&self, room_id: &str) -> Option<RoomStatus> {
        self.inner.lock().await.get(room_id).map(ManagedProcess::status)
    }

    pub async fn remove(&self, room_id: &str) -> Option<ManagedProcess> {
        self.inner.lock().await.remove(room_id)
    }

    pub async fn list_ids(&self) -> BTreeSet<RoomId> {
        self.inner.lock().await.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Marks a `Running` entry `Terminating` and takes its child handle. The
    /// entry stays registered until [`Registry::remove`]. A room that is
    /// already terminating yields `None`, like an unknown one.
    pub async fn begin_termination(&self, room_id: &str) -> Option<TerminationTicket> {
        let mut map = self.inner.lock().await;
        let e = map.get_mut(room_id)?;
        if e.state != RoomState::Running {
            return None;
        }
        let child = e.child.take()?;
        e.state = RoomState::Terminating;
        Some(TerminationTicket {
            room_id: e.room_id.clone(),
            pgid: e.pgid,
            child,
        })
    }

    /// Removes `Running` entries whose process has already exited. Never
    /// blocks on a live process.
    pub async fn prune_exited(&self) -> Vec<(RoomId, ExitStatus)> {
        let mut map = self.inner.lock().await;
        let mut exited = Vec::new();
        for (id, e) in map.iter_mut() {
            if e.state != RoomState::Running {
                continue;
            }
            let Some(child) = e.child.as_mut() else {
                continue;
            };
            if let Ok(Some(status)) = child.try_wait() {
                exited.push((id.clone(), status));
            }
        }
        for (id, _) in &exited {
            map.remove(id);
        }
        exited
    }
}
