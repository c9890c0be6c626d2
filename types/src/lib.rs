pub mod api;
pub mod cards;
pub mod session;

pub use api::{
    ActionAck, ActionKind, ActionNotice, ActionResult, Command, GameEnd, GameStart, Notification,
    PlayerId, RoomId, RoomSnapshot, RoomStatus, Seat, Subscribe, TurnSequence, TurnSnapshot,
    Winner,
};
pub use cards::{Card, CardError, CardKind, Color, COLORS};
pub use session::{ActionCounts, GameResult, GameSummary, SessionPointer};
