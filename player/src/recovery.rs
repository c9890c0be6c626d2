use crate::{error::SessionError, gateway::Gateway, table::TableState};
use std::{
    fs, io,
    path::{Path, PathBuf},
};
use tracing::{info, warn};
use unobot_types::{RoomSnapshot, RoomStatus, SessionPointer};

/// Durable home of the [SessionPointer].
///
/// Writes go to a sibling temp file first and are renamed into place, so a
/// crash leaves either the previous pointer or the new one.
#[derive(Clone, Debug)]
pub struct PointerStore {
    path: PathBuf,
}

impl PointerStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Where the final pointer of a finished game is kept.
    pub fn archive_path(&self) -> PathBuf {
        self.sibling("archived")
    }

    fn sibling(&self, suffix: &str) -> PathBuf {
        let name = self
            .path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "session.json".to_string());
        self.path.with_file_name(format!("{name}.{suffix}"))
    }

    /// A missing or unreadable pointer means there is nothing to resume.
    pub fn load(&self) -> Result<Option<SessionPointer>, SessionError> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        match serde_json::from_str(&raw) {
            Ok(pointer) => Ok(Some(pointer)),
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "discarding unreadable session pointer");
                self.discard()?;
                Ok(None)
            }
        }
    }

    pub fn save(&self, pointer: &SessionPointer) -> Result<(), SessionError> {
        write_atomic(&self.path, &serde_json::to_vec_pretty(pointer)?)?;
        Ok(())
    }

    /// Record the pointer of a finished game and clear the live one.
    pub fn archive(&self, pointer: &SessionPointer) -> Result<(), SessionError> {
        write_atomic(&self.archive_path(), &serde_json::to_vec_pretty(pointer)?)?;
        self.discard()
    }

    pub fn discard(&self) -> Result<(), SessionError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!(".{name}.tmp"));
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)
}

#[derive(Debug)]
pub enum Resume {
    /// The pointer still names a live seat; the table is rebuilt from the server.
    Resumed {
        pointer: SessionPointer,
        table: TableState,
    },
    /// Nothing to resume; join a room from scratch.
    Fresh,
}

/// Why a stored pointer can no longer be used, if it cannot.
fn unusable(pointer: &SessionPointer, snapshot: &RoomSnapshot) -> Option<&'static str> {
    if snapshot.status == RoomStatus::Ended {
        return Some("game ended while offline");
    }
    if !snapshot.players.is_empty() && !snapshot.contains_player(&pointer.player_id) {
        return Some("seat no longer in the room");
    }
    if snapshot.turn_sequence < pointer.last_ack_seq {
        return Some("room is behind the stored pointer");
    }
    None
}

/// Try to pick up the session named by the stored pointer.
pub async fn resume<G: Gateway>(gateway: &G, store: &PointerStore) -> Result<Resume, SessionError> {
    let Some(pointer) = store.load()? else {
        return Ok(Resume::Fresh);
    };
    let snapshot = match gateway
        .room_state(&pointer.room_id, &pointer.player_id)
        .await
    {
        Ok(snapshot) => snapshot,
        Err(err) if err.is_fatal() || err.is_rejection() => {
            info!(room = %pointer.room_id, error = %err, "stored room is gone, starting fresh");
            store.discard()?;
            return Ok(Resume::Fresh);
        }
        Err(err) => return Err(SessionError::TransportExhausted(err.to_string())),
    };
    if let Some(reason) = unusable(&pointer, &snapshot) {
        info!(room = %pointer.room_id, reason, "discarding session pointer");
        store.discard()?;
        return Ok(Resume::Fresh);
    }
    info!(
        room = %pointer.room_id,
        player = %pointer.player_id,
        seq = snapshot.turn_sequence,
        "resuming session"
    );
    let table = TableState::from_snapshot(pointer.player_id.clone(), &snapshot);
    Ok(Resume::Resumed { pointer, table })
}
