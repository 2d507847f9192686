//! Process-wide server state.

use crate::maze::Maze;
use crate::player::PlayerTable;
use crate::registry::ConnectionRegistry;

/// The shared engine state handed to every session.
pub struct ServerState {
    pub maze: Maze,
    pub players: PlayerTable,
    pub registry: ConnectionRegistry,
}

impl ServerState {
    pub fn new(maze: Maze) -> ServerState {
        ServerState {
            maze,
            players: PlayerTable::new(),
            registry: ConnectionRegistry::new(),
        }
    }
}
