use std::future::Future;
use unobot_client::{Client, Error};
use unobot_types::{ActionAck, Command, PlayerId, RoomId, RoomSnapshot};

/// The request/response operations the session needs from the server.
pub trait Gateway: Clone + Send + Sync + 'static {
    fn submit(
        &self,
        room: &RoomId,
        player: &PlayerId,
        command: &Command,
    ) -> impl Future<Output = Result<ActionAck, Error>> + Send;

    fn room_state(
        &self,
        room: &RoomId,
        player: &PlayerId,
    ) -> impl Future<Output = Result<RoomSnapshot, Error>> + Send;
}

impl Gateway for Client {
    fn submit(
        &self,
        room: &RoomId,
        player: &PlayerId,
        command: &Command,
    ) -> impl Future<Output = Result<ActionAck, Error>> + Send {
        Client::submit(self, room, player, command)
    }

    fn room_state(
        &self,
        room: &RoomId,
        player: &PlayerId,
    ) -> impl Future<Output = Result<RoomSnapshot, Error>> + Send {
        Client::room_state(self, room, player)
    }
}
