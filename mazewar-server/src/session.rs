//! The per-connection session.
//!
//! Each accepted connection gets two tasks. The reader task pulls frames
//! off the wire and forwards them over a bounded channel; it stops on
//! disconnect, on a protocol violation, or when the registry broadcasts
//! shutdown. The dispatch loop races that channel against the player's hit
//! notifier, so a laser hit is processed promptly even while the client is
//! idle, and a partially read frame is never cancelled mid-read.
//!
//! A client that never logs in is logged in automatically on its first
//! frame, with the lowest free avatar and the default name.

use std::sync::Arc;

use protocol::{Frame, FrameType, MAX_NAME_LEN};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::sync::{Mutex, Notify};

use crate::player::{DEFAULT_NAME, Player, Transport};
use crate::state::ServerState;

/// Frames buffered between the reader task and the dispatch loop.
const FRAME_BUFFER: usize = 256;

/// Serves one client connection from accept to teardown.
pub async fn serve_connection<S>(stream: S, state: Arc<ServerState>)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let Some((id, shutdown)) = state.registry.register() else {
        tracing::error!("connection limit reached, refusing client");
        return;
    };

    let (read_half, write_half) = tokio::io::split(stream);
    let conn: Transport = Arc::new(Mutex::new(Box::new(write_half)));

    let (frame_tx, frame_rx) = mpsc::channel(FRAME_BUFFER);
    let reader = tokio::spawn(read_frames(read_half, frame_tx, shutdown));

    let reason = drive_session(conn, frame_rx, &state).await;

    reader.abort();
    state.registry.unregister(id);
    tracing::info!(connection = id, reason, "session closed");
}

/// Reads frames until the connection ends or shutdown is requested and
/// forwards them to the dispatch loop. Dropping the sender is how the
/// dispatch loop learns that no more frames will come.
async fn read_frames<R>(mut reader: R, frames: mpsc::Sender<Frame>, shutdown: Arc<Notify>)
where
    R: AsyncRead + Send + Unpin,
{
    loop {
        tokio::select! {
            _ = shutdown.notified() => {
                tracing::debug!("shutdown requested, closing read side");
                return;
            }
            received = protocol::recv_frame(&mut reader) => match received {
                Ok(frame) => {
                    if frames.send(frame).await.is_err() {
                        return;
                    }
                }
                Err(err) if err.is_clean_close() => {
                    tracing::debug!("client disconnected");
                    return;
                }
                Err(err) => {
                    tracing::error!(%err, "dropping connection");
                    return;
                }
            }
        }
    }
}

async fn drive_session(
    conn: Transport,
    mut frames: mpsc::Receiver<Frame>,
    state: &Arc<ServerState>,
) -> &'static str {
    let mut player: Option<Arc<Player>> = None;

    let reason = loop {
        // Race the next frame against a laser hit. The pending future keeps
        // the select shape uniform while nobody is logged in.
        let frame = {
            let hit = async {
                match &player {
                    Some(current) => current.hit_wait().await,
                    None => std::future::pending().await,
                }
            };
            tokio::select! {
                received = frames.recv() => match received {
                    Some(frame) => frame,
                    None => break "connection closed",
                },
                _ = hit => {
                    if let Some(current) = &player {
                        state.players.check_hit(current, &state.maze).await;
                    }
                    continue;
                }
            }
        };

        // First frame of any other type triggers the automatic login. The
        // triggering frame itself is dropped; dispatch starts with the next
        // one.
        if player.is_none() && frame.header.frame_type() != Some(FrameType::Login) {
            match auto_login(&conn, state).await {
                Some(fresh) => {
                    player = Some(fresh);
                    continue;
                }
                None => break "no avatar available",
            }
        }

        match frame.header.frame_type() {
            Some(FrameType::Login) => {
                if player.is_some() {
                    tracing::debug!("ignoring login while logged in");
                    continue;
                }
                if frame.payload.len() > MAX_NAME_LEN {
                    break "oversized login name";
                }
                let name = parse_name(&frame.payload);
                match login_with_fallback(&conn, state, frame.header.param1, &name).await {
                    Some(fresh) => {
                        let announce = Frame::score(
                            fresh.avatar,
                            fresh.score().await as i8,
                            fresh.name.as_bytes(),
                        );
                        state.players.broadcast(&announce).await;
                        player = Some(fresh);
                    }
                    None => break "avatar in use",
                }
            }
            Some(FrameType::Move) => {
                let Some(current) = &player else { continue };
                match frame.header.param1 as i8 {
                    sign @ (1 | -1) => {
                        current.step(sign, &state.maze).await;
                    }
                    sign => {
                        tracing::debug!(sign, "ignoring move with unsupported sign");
                    }
                }
            }
            Some(FrameType::Turn) => {
                let Some(current) = &player else { continue };
                current.rotate(frame.header.param1 as i8).await;
                current.update_view(&state.maze).await;
            }
            Some(FrameType::Fire) => {
                let Some(current) = &player else { continue };
                state.players.fire(current, &state.maze).await;
            }
            Some(FrameType::Refresh) => {
                let Some(current) = &player else { continue };
                current.invalidate_view().await;
                current.update_view(&state.maze).await;
            }
            Some(FrameType::Send) => {
                let Some(current) = &player else { continue };
                state.players.send_chat(current, &frame.payload).await;
            }
            other => {
                tracing::warn!(kind = frame.header.kind, ?other, "unhandled frame type");
            }
        }

        tracing::trace!(maze = %state.maze.render(), "maze after command");
    };

    if let Some(current) = player.take() {
        state.players.logout(current, &state.maze).await;
    }
    reason
}

/// Name bytes end at the first NUL; the rest is decoded leniently. A
/// missing name becomes the default one.
fn parse_name(payload: &[u8]) -> String {
    let bytes = payload.split(|&byte| byte == 0).next().unwrap_or(payload);
    if bytes.is_empty() {
        return DEFAULT_NAME.to_string();
    }
    String::from_utf8_lossy(bytes).into_owned()
}

/// Logs the client in with the lowest free avatar and the default name.
async fn auto_login(conn: &Transport, state: &Arc<ServerState>) -> Option<Arc<Player>> {
    let Some(avatar) = state.players.lowest_free_avatar().await else {
        tracing::info!("automatic login failed, no avatar available");
        send_control(conn, FrameType::InUse).await;
        return None;
    };

    match state.players.login(conn.clone(), avatar, DEFAULT_NAME).await {
        Ok(player) => {
            tracing::debug!(avatar = %(avatar as char), "automatic login");
            send_control(conn, FrameType::Ready).await;
            state.players.reset(&player, &state.maze).await;
            Some(player)
        }
        Err(_) => {
            send_control(conn, FrameType::InUse).await;
            None
        }
    }
}

/// Attempts the requested avatar; an anonymous client whose avatar is taken
/// falls back to the lowest free letter. On success the client gets `Ready`
/// and a spawn point.
async fn login_with_fallback(
    conn: &Transport,
    state: &Arc<ServerState>,
    avatar: u8,
    name: &str,
) -> Option<Arc<Player>> {
    let mut result = state.players.login(conn.clone(), avatar, name).await;

    if result.is_err() && name == DEFAULT_NAME {
        for fallback in b'A'..=b'Z' {
            result = state.players.login(conn.clone(), fallback, name).await;
            if result.is_ok() {
                break;
            }
        }
    }

    match result {
        Ok(player) => {
            send_control(conn, FrameType::Ready).await;
            state.players.reset(&player, &state.maze).await;
            Some(player)
        }
        Err(err) => {
            tracing::info!(avatar = %(avatar as char), %err, "login rejected");
            send_control(conn, FrameType::InUse).await;
            None
        }
    }
}

async fn send_control(conn: &Transport, kind: FrameType) {
    let mut conn = conn.lock().await;
    if let Err(err) = protocol::send_frame(conn.as_mut(), &Frame::control(kind)).await {
        tracing::debug!(%err, "failed to send control frame");
    }
}
