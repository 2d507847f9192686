//! The wire protocol shared between the MazeWar server and its clients.
//!
//! Every message on the wire is one frame: a 16 byte header followed by an
//! optional payload of exactly `size` bytes. Multi-byte header fields travel
//! in network byte order. Two alignment padding bytes sit between `size` and
//! the timestamps, so the full header is:
//!
//! ```text
//! offset  0: type    (1 byte)
//! offset  1: param1  (1 byte)
//! offset  2: param2  (1 byte)
//! offset  3: param3  (1 byte)
//! offset  4: size    (u16, big endian)
//! offset  6: padding (2 bytes, always zero)
//! offset  8: timestamp seconds     (u32, big endian)
//! offset 12: timestamp nanoseconds (u32, big endian)
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Size of the packed frame header on the wire.
pub const HEADER_LEN: usize = 16;

/// Upper bound for any frame payload. Larger announced sizes are rejected
/// before the payload is read.
pub const MAX_PAYLOAD: usize = 1024;

/// Upper bound for the name payload of a `Login` frame.
pub const MAX_NAME_LEN: usize = 256;

/// The frame types of the protocol, dense byte encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    /// Client requests an avatar, payload is the player name.
    Login = 0,
    /// Server accepts a login.
    Ready = 1,
    /// Server rejects a login because no avatar is available.
    InUse = 2,
    /// Client rotates, `param1` is +1 (left) or -1 (right).
    Turn = 3,
    /// Client fires the laser.
    Fire = 4,
    /// Client asks for a full view refresh.
    Refresh = 5,
    /// Client submits a chat message, payload is the message bytes.
    Send = 6,
    /// Client moves, `param1` is +1 (forward) or -1 (backward).
    Move = 7,
    /// Server tells a player it has been hit.
    Alert = 8,
    /// Reserved for client side rendering.
    View = 9,
    /// Server clears the client's view window.
    Clear = 10,
    /// Server paints one view cell: `param1` cell, `param2` side, `param3` depth.
    Show = 11,
    /// Server scoreboard update: `param1` avatar, `param2` score as signed
    /// byte (-1 marks departure), payload optionally the player name.
    Score = 12,
    /// Server relays a chat message, payload is the message bytes.
    Chat = 13,
}

impl FrameType {
    /// Maps a raw header byte back to a frame type. Unknown bytes yield
    /// `None` so the session layer can log them as unhandled instead of
    /// tearing the connection down.
    pub fn from_byte(byte: u8) -> Option<FrameType> {
        Some(match byte {
            0 => FrameType::Login,
            1 => FrameType::Ready,
            2 => FrameType::InUse,
            3 => FrameType::Turn,
            4 => FrameType::Fire,
            5 => FrameType::Refresh,
            6 => FrameType::Send,
            7 => FrameType::Move,
            8 => FrameType::Alert,
            9 => FrameType::View,
            10 => FrameType::Clear,
            11 => FrameType::Show,
            12 => FrameType::Score,
            13 => FrameType::Chat,
            _ => return None,
        })
    }
}

/// Errors of the framing layer.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The peer closed the connection cleanly, at a frame boundary.
    #[error("connection closed by peer")]
    Eof,
    /// The stream ended in the middle of a frame.
    #[error("connection closed mid-frame")]
    Truncated,
    /// A transport read or write failed.
    #[error("transport failure: {0}")]
    Io(#[from] std::io::Error),
    /// The header announced a payload beyond [`MAX_PAYLOAD`].
    #[error("announced payload of {0} bytes exceeds the {MAX_PAYLOAD} byte cap")]
    Oversize(usize),
}

impl ProtocolError {
    /// True for a clean disconnect, which sessions log quietly.
    pub fn is_clean_close(&self) -> bool {
        matches!(self, ProtocolError::Eof)
    }
}

/// The decoded frame header. `kind` stays a raw byte so unknown types can
/// travel up to the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub kind: u8,
    pub param1: u8,
    pub param2: u8,
    pub param3: u8,
    pub size: u16,
    pub timestamp_sec: u32,
    pub timestamp_nsec: u32,
}

impl Header {
    /// The frame type, if the type byte is a known one.
    pub fn frame_type(&self) -> Option<FrameType> {
        FrameType::from_byte(self.kind)
    }
}

/// One protocol frame: header plus payload of exactly `header.size` bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: Header,
    pub payload: Bytes,
}

impl Frame {
    fn build(kind: FrameType, params: [u8; 3], payload: Bytes) -> Frame {
        debug_assert!(payload.len() <= MAX_PAYLOAD);
        let (sec, nsec) = now();
        Frame {
            header: Header {
                kind: kind as u8,
                param1: params[0],
                param2: params[1],
                param3: params[2],
                size: payload.len() as u16,
                timestamp_sec: sec,
                timestamp_nsec: nsec,
            },
            payload,
        }
    }

    /// A frame without parameters or payload (`Ready`, `InUse`, `Fire`,
    /// `Refresh`, `Alert`, `Clear`).
    pub fn control(kind: FrameType) -> Frame {
        Frame::build(kind, [0; 3], Bytes::new())
    }

    /// A login request for `avatar` carrying the player name.
    pub fn login(avatar: u8, name: &[u8]) -> Frame {
        Frame::build(FrameType::Login, [avatar, 0, 0], Bytes::copy_from_slice(name))
    }

    /// A movement request, `sign` +1 forward or -1 backward.
    pub fn step(sign: i8) -> Frame {
        Frame::build(FrameType::Move, [sign as u8, 0, 0], Bytes::new())
    }

    /// A rotation request, `sense` +1 left or -1 right.
    pub fn turn(sense: i8) -> Frame {
        Frame::build(FrameType::Turn, [sense as u8, 0, 0], Bytes::new())
    }

    /// A chat submission from a client.
    pub fn message(text: &[u8]) -> Frame {
        Frame::build(FrameType::Send, [0; 3], Bytes::copy_from_slice(text))
    }

    /// One view cell for the client renderer.
    pub fn show(cell: u8, side: u8, depth: u8) -> Frame {
        Frame::build(FrameType::Show, [cell, side, depth], Bytes::new())
    }

    /// A scoreboard update. `score` of -1 marks the avatar as gone. The
    /// name payload is sent when the scoreboard entry is first announced.
    pub fn score(avatar: u8, score: i8, name: &[u8]) -> Frame {
        Frame::build(
            FrameType::Score,
            [avatar, score as u8, 0],
            Bytes::copy_from_slice(name),
        )
    }

    /// A chat line relayed to every player.
    pub fn chat(text: &[u8]) -> Frame {
        Frame::build(FrameType::Chat, [0; 3], Bytes::copy_from_slice(text))
    }
}

fn now() -> (u32, u32) {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(elapsed) => (elapsed.as_secs() as u32, elapsed.subsec_nanos()),
        Err(_) => (0, 0),
    }
}

/// Serializes and writes one frame. `write_all` already retries partial
/// writes and interrupted syscalls, so a success means the full header and
/// payload are on the wire.
pub async fn send_frame<W>(writer: &mut W, frame: &Frame) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    debug_assert_eq!(frame.header.size as usize, frame.payload.len());

    let mut buf = BytesMut::with_capacity(HEADER_LEN + frame.payload.len());
    buf.put_u8(frame.header.kind);
    buf.put_u8(frame.header.param1);
    buf.put_u8(frame.header.param2);
    buf.put_u8(frame.header.param3);
    buf.put_u16(frame.header.size);
    buf.put_u16(0); // struct padding, part of the 16 byte wire header
    buf.put_u32(frame.header.timestamp_sec);
    buf.put_u32(frame.header.timestamp_nsec);
    buf.put_slice(&frame.payload);

    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one full frame. Distinguishes a clean close before the first
/// header byte ([`ProtocolError::Eof`]) from a close mid-frame
/// ([`ProtocolError::Truncated`]). An announced payload beyond
/// [`MAX_PAYLOAD`] is rejected without reading it.
pub async fn recv_frame<R>(reader: &mut R) -> Result<Frame, ProtocolError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut raw = [0u8; HEADER_LEN];
    read_full(reader, &mut raw).await?;

    let mut buf = &raw[..];
    let kind = buf.get_u8();
    let param1 = buf.get_u8();
    let param2 = buf.get_u8();
    let param3 = buf.get_u8();
    let size = buf.get_u16();
    let _padding = buf.get_u16();
    let timestamp_sec = buf.get_u32();
    let timestamp_nsec = buf.get_u32();

    if size as usize > MAX_PAYLOAD {
        return Err(ProtocolError::Oversize(size as usize));
    }

    let payload = if size > 0 {
        let mut data = vec![0u8; size as usize];
        if let Err(err) = reader.read_exact(&mut data).await {
            if err.kind() == std::io::ErrorKind::UnexpectedEof {
                return Err(ProtocolError::Truncated);
            }
            return Err(ProtocolError::Io(err));
        }
        Bytes::from(data)
    } else {
        Bytes::new()
    };

    Ok(Frame {
        header: Header {
            kind,
            param1,
            param2,
            param3,
            size,
            timestamp_sec,
            timestamp_nsec,
        },
        payload,
    })
}

/// Fills `buf` completely. Zero bytes before any progress is a clean close,
/// zero bytes after partial progress is a truncated frame.
async fn read_full<R>(reader: &mut R, buf: &mut [u8]) -> Result<(), ProtocolError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Err(ProtocolError::Eof);
            }
            return Err(ProtocolError::Truncated);
        }
        filled += n;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frame_round_trips_with_payload() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        let sent = Frame::login(b'Q', b"Gandalf");
        send_frame(&mut client, &sent).await.unwrap();

        let received = recv_frame(&mut server).await.unwrap();
        assert_eq!(received, sent);
        assert_eq!(received.header.frame_type(), Some(FrameType::Login));
        assert_eq!(received.header.param1, b'Q');
        assert_eq!(&received.payload[..], b"Gandalf");
    }

    #[tokio::test]
    async fn header_is_sixteen_bytes_with_zero_padding() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        send_frame(&mut client, &Frame::show(b'*', 1, 3)).await.unwrap();
        drop(client);

        let mut raw = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut server, &mut raw)
            .await
            .unwrap();
        assert_eq!(raw.len(), HEADER_LEN);
        assert_eq!(raw[0], FrameType::Show as u8);
        assert_eq!([raw[1], raw[2], raw[3]], [b'*', 1, 3]);
        assert_eq!([raw[4], raw[5]], [0, 0]); // size
        assert_eq!([raw[6], raw[7]], [0, 0]); // padding
    }

    #[tokio::test]
    async fn size_field_is_network_byte_order() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        let payload = vec![b'x'; 300];
        send_frame(&mut client, &Frame::chat(&payload)).await.unwrap();

        let mut raw = vec![0u8; HEADER_LEN];
        tokio::io::AsyncReadExt::read_exact(&mut server, &mut raw)
            .await
            .unwrap();
        assert_eq!(u16::from_be_bytes([raw[4], raw[5]]), 300);
    }

    #[tokio::test]
    async fn oversize_announcement_is_rejected() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        let mut raw = [0u8; HEADER_LEN];
        raw[0] = FrameType::Send as u8;
        raw[4..6].copy_from_slice(&((MAX_PAYLOAD as u16 + 1).to_be_bytes()));
        tokio::io::AsyncWriteExt::write_all(&mut client, &raw)
            .await
            .unwrap();

        match recv_frame(&mut server).await {
            Err(ProtocolError::Oversize(announced)) => {
                assert_eq!(announced, MAX_PAYLOAD + 1);
            }
            other => panic!("expected oversize rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn clean_close_is_distinguished_from_truncation() {
        let (client, mut server) = tokio::io::duplex(4096);
        drop(client);
        assert!(recv_frame(&mut server).await.unwrap_err().is_clean_close());

        let (mut client, mut server) = tokio::io::duplex(4096);
        tokio::io::AsyncWriteExt::write_all(&mut client, &[0u8; 5])
            .await
            .unwrap();
        drop(client);
        match recv_frame(&mut server).await {
            Err(ProtocolError::Truncated) => {}
            other => panic!("expected truncation, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn negative_score_travels_as_raw_byte() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        send_frame(&mut client, &Frame::score(b'B', -1, b"")).await.unwrap();
        let frame = recv_frame(&mut server).await.unwrap();
        assert_eq!(frame.header.param2, 0xff);
        assert_eq!(frame.header.param2 as i8, -1);
    }

    #[test]
    fn type_bytes_are_dense_and_stable() {
        for byte in 0..=13u8 {
            let kind = FrameType::from_byte(byte).unwrap();
            assert_eq!(kind as u8, byte);
        }
        assert_eq!(FrameType::from_byte(14), None);
        assert_eq!(FrameType::Login as u8, 0);
        assert_eq!(FrameType::Chat as u8, 13);
    }
}
