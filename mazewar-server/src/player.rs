//! The player table and the per-player game actions.
//!
//! Records are `Arc<Player>`: the table holds one reference, the owning
//! session another, and transient lookups clone under the table lock. A
//! record is destroyed exactly when its last reference drops.
//!
//! Each record carries two locks. `state` guards position, facing, score
//! and the cached view; `conn` guards the transport write half that the
//! session shares with the record. The split means a broadcast that reaches
//! the sender itself only touches the transport lock and never re-enters
//! `state`, and no task ever holds the state locks of two players at once:
//! cross-player work first snapshots the table, then visits one record at a
//! time.
//!
//! Lock order is table, then one record's state, then the maze.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use protocol::{Frame, FrameType, ProtocolError};
use thiserror::Error;
use tokio::io::AsyncWrite;
use tokio::sync::{Mutex, Notify};

use crate::maze::{self, Direction, Maze, VIEW_DEPTH, ViewRow};

/// Avatar slots, one per letter `A..=Z`.
pub const MAX_PLAYERS: usize = 26;

/// How long a hit player stays out of the maze before respawning.
pub const PURGATORY: Duration = Duration::from_secs(3);

/// Name used when a client does not provide one.
pub const DEFAULT_NAME: &str = "Anonymous";

/// The write half of a client connection, shared between its session and
/// its player record.
pub type Transport = Arc<Mutex<Box<dyn AsyncWrite + Send + Unpin>>>;

/// Rejected login attempts, surfaced to the client as an `InUse` frame.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LoginError {
    #[error("avatar must be an uppercase letter")]
    Invalid,
    #[error("avatar is already in use")]
    AvatarInUse,
}

struct PlayerState {
    score: i32,
    row: i32,
    col: i32,
    dir: Direction,
    view: Vec<ViewRow>,
}

/// One logged-in player.
pub struct Player {
    pub avatar: u8,
    pub name: String,
    conn: Transport,
    state: Mutex<PlayerState>,
    hit_flag: AtomicBool,
    hit_notify: Notify,
}

impl std::fmt::Debug for Player {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Player")
            .field("avatar", &self.avatar)
            .field("name", &self.name)
            .finish()
    }
}

impl Player {
    fn new(conn: Transport, avatar: u8, name: String) -> Arc<Player> {
        Arc::new(Player {
            avatar,
            name,
            conn,
            state: Mutex::new(PlayerState {
                score: 0,
                row: 0,
                col: 0,
                dir: Direction::North,
                view: Vec::new(),
            }),
            hit_flag: AtomicBool::new(false),
            hit_notify: Notify::new(),
        })
    }

    /// Marks the player as hit and wakes its session. Called from the
    /// shooter's task; the flag is cleared by the owner in `check_hit`.
    pub fn notify_hit(&self) {
        self.hit_flag.store(true, Ordering::Release);
        self.hit_notify.notify_one();
    }

    /// Completes once a hit notification arrives. The notifier stores a
    /// permit, so a hit delivered while the session is busy with a frame is
    /// picked up on its next loop iteration.
    pub async fn hit_wait(&self) {
        self.hit_notify.notified().await;
    }

    fn take_hit_flag(&self) -> bool {
        self.hit_flag.swap(false, Ordering::AcqRel)
    }

    /// Test hook: pins the record to a position without touching the maze.
    #[cfg(test)]
    pub(crate) async fn force_position(&self, row: i32, col: i32, dir: Direction) {
        let mut state = self.state.lock().await;
        state.row = row;
        state.col = col;
        state.dir = dir;
    }

    /// Writes one frame to this player's connection. Failures are reported
    /// to the caller; broadcast paths log them and keep going, the peer's
    /// own session will notice the dead transport soon enough.
    pub async fn send_frame(&self, frame: &Frame) -> Result<(), ProtocolError> {
        let mut conn = self.conn.lock().await;
        protocol::send_frame(conn.as_mut(), frame).await
    }

    /// Current position and facing.
    pub async fn position(&self) -> (i32, i32, Direction) {
        let state = self.state.lock().await;
        (state.row, state.col, state.dir)
    }

    pub async fn score(&self) -> i32 {
        self.state.lock().await.score
    }

    /// Moves one cell, `sign` +1 along the facing and -1 against it. On
    /// success the position is updated and the view refreshed. A blocked
    /// move leaves the client without any response.
    pub async fn step(&self, sign: i8, maze: &Maze) -> bool {
        let mut state = self.state.lock().await;
        let dir = if sign == 1 { state.dir } else { state.dir.reverse() };

        if maze.step(state.row, state.col, dir).is_err() {
            tracing::debug!(avatar = %(self.avatar as char), "move blocked");
            return false;
        }

        let (dr, dc) = dir.delta();
        state.row += dr;
        state.col += dc;
        self.refresh_view(&mut state, maze).await;
        true
    }

    /// Turns the player, `sense` +1 left and anything else right, and drops
    /// the cached view.
    pub async fn rotate(&self, sense: i8) {
        let mut state = self.state.lock().await;
        state.dir = if sense == 1 { state.dir.left() } else { state.dir.right() };
        state.view.clear();
    }

    /// Drops the cached view buffer.
    pub async fn invalidate_view(&self) {
        self.state.lock().await.view.clear();
    }

    /// Recomputes the view and replays it to the client: one `Clear`, then
    /// one `Show` per cell in depth major, side minor order. The order is
    /// part of the protocol contract.
    pub async fn update_view(&self, maze: &Maze) {
        let mut state = self.state.lock().await;
        self.refresh_view(&mut state, maze).await;
    }

    async fn refresh_view(&self, state: &mut PlayerState, maze: &Maze) {
        state.view = maze.get_view(state.row, state.col, state.dir, VIEW_DEPTH);
        if state.view.is_empty() {
            return;
        }

        if let Err(err) = self.send_frame(&Frame::control(FrameType::Clear)).await {
            tracing::debug!(avatar = %(self.avatar as char), %err, "failed to send view clear");
            return;
        }
        for (depth, row) in state.view.iter().enumerate() {
            for (side, &cell) in row.iter().enumerate() {
                let show = Frame::show(cell, side as u8, depth as u8);
                if let Err(err) = self.send_frame(&show).await {
                    tracing::debug!(avatar = %(self.avatar as char), %err, "failed to send view cell");
                    return;
                }
            }
        }
    }
}

/// The 26 avatar slots. The slot lock covers lookup plus reference
/// acquisition in one step, so a record can never be freed between finding
/// it and cloning it.
pub struct PlayerTable {
    slots: Mutex<[Option<Arc<Player>>; MAX_PLAYERS]>,
}

impl PlayerTable {
    pub fn new() -> PlayerTable {
        PlayerTable {
            slots: Mutex::new(std::array::from_fn(|_| None)),
        }
    }

    fn slot_of(avatar: u8) -> Result<usize, LoginError> {
        if avatar.is_ascii_uppercase() {
            Ok((avatar - b'A') as usize)
        } else {
            Err(LoginError::Invalid)
        }
    }

    /// Creates a record for `avatar` if the letter is valid and free. An
    /// empty name becomes [`DEFAULT_NAME`].
    pub async fn login(
        &self,
        conn: Transport,
        avatar: u8,
        name: &str,
    ) -> Result<Arc<Player>, LoginError> {
        let index = Self::slot_of(avatar)?;
        let name = if name.is_empty() { DEFAULT_NAME } else { name };

        let mut slots = self.slots.lock().await;
        if slots[index].is_some() {
            return Err(LoginError::AvatarInUse);
        }
        let player = Player::new(conn, avatar, name.to_string());
        slots[index] = Some(player.clone());
        tracing::info!(avatar = %(avatar as char), name, "player logged in");
        Ok(player)
    }

    /// Looks up a record, cloning it under the table lock.
    pub async fn get(&self, avatar: u8) -> Option<Arc<Player>> {
        let index = Self::slot_of(avatar).ok()?;
        self.slots.lock().await[index].clone()
    }

    /// The lowest avatar letter without a record, for auto-login and the
    /// login fallback.
    pub async fn lowest_free_avatar(&self) -> Option<u8> {
        let slots = self.slots.lock().await;
        slots
            .iter()
            .position(|slot| slot.is_none())
            .map(|index| b'A' + index as u8)
    }

    /// All live records at this instant. Taken under the table lock, used
    /// after releasing it.
    pub async fn snapshot(&self) -> Vec<Arc<Player>> {
        self.slots.lock().await.iter().flatten().cloned().collect()
    }

    /// Removes the player from the table and the maze and tells the
    /// remaining players that the avatar is gone.
    pub async fn logout(&self, player: Arc<Player>, maze: &Maze) {
        {
            let mut slots = self.slots.lock().await;
            let index = (player.avatar - b'A') as usize;
            if slots[index]
                .as_ref()
                .is_some_and(|slot| Arc::ptr_eq(slot, &player))
            {
                slots[index] = None;
            }
        }

        {
            let state = player.state.lock().await;
            maze.remove(player.avatar, state.row, state.col);
        }

        tracing::info!(avatar = %(player.avatar as char), "player logged out");
        self.broadcast(&Frame::score(player.avatar, -1, b"")).await;
    }

    /// Sends one frame to every logged-in player.
    pub async fn broadcast(&self, frame: &Frame) {
        for peer in self.snapshot().await {
            if let Err(err) = peer.send_frame(frame).await {
                tracing::debug!(avatar = %(peer.avatar as char), %err, "dropping broadcast to unreachable player");
            }
        }
    }

    /// Announces `player`'s current score to everyone.
    pub async fn broadcast_score(&self, player: &Arc<Player>) {
        let score = player.score().await;
        self.broadcast(&Frame::score(player.avatar, score as i8, b"")).await;
    }

    /// Fires the laser. A hit flags the victim, wakes its session, earns
    /// the shooter a point and announces the new score. A miss is silent.
    pub async fn fire(&self, shooter: &Arc<Player>, maze: &Maze) {
        let target = {
            let mut state = shooter.state.lock().await;
            let target = maze.find_target(state.row, state.col, state.dir);
            if maze::is_avatar(target) {
                state.score += 1;
            }
            target
        };

        if !maze::is_avatar(target) {
            tracing::debug!(avatar = %(shooter.avatar as char), "laser hit nothing");
            return;
        }

        if let Some(victim) = self.get(target).await {
            tracing::info!(
                shooter = %(shooter.avatar as char),
                victim = %(victim.avatar as char),
                "laser hit"
            );
            victim.notify_hit();
        }
        self.broadcast_score(shooter).await;
    }

    /// Relays a chat line, prefixed with the sender's name and avatar, to
    /// every logged-in player. Empty submissions are dropped.
    pub async fn send_chat(&self, sender: &Arc<Player>, message: &[u8]) {
        if message.is_empty() {
            return;
        }

        let mut text = format!("{}[{}] ", sender.name, sender.avatar as char).into_bytes();
        text.extend_from_slice(message);
        text.truncate(protocol::MAX_PAYLOAD);

        self.broadcast(&Frame::chat(&text)).await;
    }

    /// Processes a pending hit, if any: take the player out of the maze,
    /// tell it about its demise, refresh everyone else's view, and respawn
    /// after the purgatory delay.
    pub async fn check_hit(&self, player: &Arc<Player>, maze: &Maze) {
        if !player.take_hit_flag() {
            return;
        }
        tracing::info!(avatar = %(player.avatar as char), "processing laser hit");

        {
            let state = player.state.lock().await;
            maze.remove(player.avatar, state.row, state.col);
        }

        if let Err(err) = player.send_frame(&Frame::score(player.avatar, -1, b"")).await {
            tracing::debug!(avatar = %(player.avatar as char), %err, "failed to send hit score");
        }
        if let Err(err) = player.send_frame(&Frame::control(FrameType::Alert)).await {
            tracing::debug!(avatar = %(player.avatar as char), %err, "failed to send hit alert");
        }

        self.refresh_other_views(player, maze).await;

        tokio::time::sleep(PURGATORY).await;
        self.reset(player, maze).await;
    }

    /// Respawns the player at a random empty cell and brings every view and
    /// the scoreboard up to date. When no cell is found the player stays
    /// unplaced; a later reset may still succeed.
    pub async fn reset(&self, player: &Arc<Player>, maze: &Maze) {
        {
            let mut state = player.state.lock().await;
            maze.remove(player.avatar, state.row, state.col);
            match maze.place_random(player.avatar) {
                Ok((row, col)) => {
                    state.row = row;
                    state.col = col;
                }
                Err(_) => {
                    tracing::warn!(
                        avatar = %(player.avatar as char),
                        "no free cell to place player, skipping respawn"
                    );
                    return;
                }
            }
        }

        player.update_view(maze).await;
        self.refresh_other_views(player, maze).await;
        self.broadcast_score(player).await;
    }

    async fn refresh_other_views(&self, except: &Arc<Player>, maze: &Maze) {
        for peer in self.snapshot().await {
            if Arc::ptr_eq(&peer, except) {
                continue;
            }
            peer.invalidate_view().await;
            peer.update_view(maze).await;
        }
    }
}
