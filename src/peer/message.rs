use super::bitfield::Bitfield;
use super::error::PeerError;
use super::piece::PieceId;
use crate::constants::MAX_ID_LEN;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::BTreeMap;

/// Per-file bitfields, keyed by file id.
pub type BitfieldMap = BTreeMap<String, Bitfield>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    ServerClose = 8,
}

impl TryFrom<u8> for MessageId {
    type Error = PeerError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(MessageId::Choke),
            1 => Ok(MessageId::Unchoke),
            2 => Ok(MessageId::Interested),
            3 => Ok(MessageId::NotInterested),
            4 => Ok(MessageId::Have),
            5 => Ok(MessageId::Bitfield),
            6 => Ok(MessageId::Request),
            7 => Ok(MessageId::Piece),
            8 => Ok(MessageId::ServerClose),
            _ => Err(PeerError::InvalidMessageId(value)),
        }
    }
}

/// A peer wire message.
///
/// `encode`/`decode` deal with the frame payload only; the length prefix
/// belongs to [`FrameTransport`](super::FrameTransport). An empty payload is
/// a KeepAlive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have {
        file: String,
        index: u32,
        have: bool,
    },
    Bitfield {
        peer_id: Option<String>,
        bitfields: BitfieldMap,
    },
    Request {
        file: String,
        index: u32,
    },
    Piece {
        file: String,
        index: u32,
        data: Bytes,
    },
    ServerClose,
}

impl Message {
    pub fn request(piece: &PieceId) -> Self {
        Message::Request {
            file: piece.file_id.clone(),
            index: piece.index,
        }
    }

    pub fn have(piece: &PieceId) -> Self {
        Message::Have {
            file: piece.file_id.clone(),
            index: piece.index,
            have: true,
        }
    }

    /// Short name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::KeepAlive => "KeepAlive",
            Message::Choke => "Choke",
            Message::Unchoke => "UnChoke",
            Message::Interested => "Interested",
            Message::NotInterested => "UnInterested",
            Message::Have { .. } => "Have",
            Message::Bitfield { .. } => "Bitfield",
            Message::Request { .. } => "Request",
            Message::Piece { .. } => "Piece",
            Message::ServerClose => "ServerClose",
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();

        match self {
            Message::KeepAlive => {}
            Message::Choke => buf.put_u8(MessageId::Choke as u8),
            Message::Unchoke => buf.put_u8(MessageId::Unchoke as u8),
            Message::Interested => buf.put_u8(MessageId::Interested as u8),
            Message::NotInterested => buf.put_u8(MessageId::NotInterested as u8),
            Message::Have { file, index, have } => {
                buf.put_u8(MessageId::Have as u8);
                put_str(&mut buf, file);
                buf.put_u32(*index);
                buf.put_u8(u8::from(*have));
            }
            Message::Bitfield { peer_id, bitfields } => {
                buf.put_u8(MessageId::Bitfield as u8);
                put_str(&mut buf, peer_id.as_deref().unwrap_or(""));
                debug_assert!(bitfields.len() <= u16::MAX as usize);
                buf.put_u16(bitfields.len() as u16);
                for (file, bitfield) in bitfields {
                    put_str(&mut buf, file);
                    buf.put_u32(bitfield.len() as u32);
                    buf.put_slice(bitfield.as_bytes());
                }
            }
            Message::Request { file, index } => {
                buf.put_u8(MessageId::Request as u8);
                put_str(&mut buf, file);
                buf.put_u32(*index);
            }
            Message::Piece { file, index, data } => {
                buf.reserve(7 + file.len() + data.len());
                buf.put_u8(MessageId::Piece as u8);
                put_str(&mut buf, file);
                buf.put_u32(*index);
                buf.put_slice(data);
            }
            Message::ServerClose => buf.put_u8(MessageId::ServerClose as u8),
        }

        buf.freeze()
    }

    pub fn decode(mut data: Bytes) -> Result<Self, PeerError> {
        if data.is_empty() {
            return Ok(Message::KeepAlive);
        }

        let id = MessageId::try_from(data.get_u8())?;

        match id {
            MessageId::Choke => Ok(Message::Choke),
            MessageId::Unchoke => Ok(Message::Unchoke),
            MessageId::Interested => Ok(Message::Interested),
            MessageId::NotInterested => Ok(Message::NotInterested),
            MessageId::Have => {
                let file = get_str(&mut data, "have")?;
                if data.remaining() < 5 {
                    return Err(PeerError::InvalidMessage("have too short".into()));
                }
                let index = data.get_u32();
                let have = data.get_u8() != 0;
                Ok(Message::Have { file, index, have })
            }
            MessageId::Bitfield => {
                let peer_id = get_str(&mut data, "bitfield")?;
                if data.remaining() < 2 {
                    return Err(PeerError::InvalidMessage("bitfield too short".into()));
                }
                let count = data.get_u16();
                let mut bitfields = BitfieldMap::new();
                for _ in 0..count {
                    let file = get_str(&mut data, "bitfield")?;
                    if data.remaining() < 4 {
                        return Err(PeerError::InvalidMessage("bitfield too short".into()));
                    }
                    let piece_count = data.get_u32() as usize;
                    let byte_count = piece_count.div_ceil(8);
                    if data.remaining() < byte_count {
                        return Err(PeerError::InvalidMessage(format!(
                            "bitfield for {} truncated",
                            file
                        )));
                    }
                    let bits = data.copy_to_bytes(byte_count);
                    bitfields.insert(file, Bitfield::from_bytes(&bits, piece_count));
                }
                Ok(Message::Bitfield {
                    peer_id: (!peer_id.is_empty()).then_some(peer_id),
                    bitfields,
                })
            }
            MessageId::Request => {
                let file = get_str(&mut data, "request")?;
                if data.remaining() < 4 {
                    return Err(PeerError::InvalidMessage("request too short".into()));
                }
                Ok(Message::Request {
                    file,
                    index: data.get_u32(),
                })
            }
            MessageId::Piece => {
                let file = get_str(&mut data, "piece")?;
                if data.remaining() < 4 {
                    return Err(PeerError::InvalidMessage("piece too short".into()));
                }
                let index = data.get_u32();
                Ok(Message::Piece { file, index, data })
            }
            MessageId::ServerClose => Ok(Message::ServerClose),
        }
    }
}

/// Rejects ids whose length does not fit the u16 wire prefix.
pub(crate) fn check_id_len(value: &str, what: &str) -> Result<(), PeerError> {
    if value.len() > MAX_ID_LEN {
        return Err(PeerError::InvalidMessage(format!(
            "{} is {} bytes, at most {} allowed",
            what,
            value.len(),
            MAX_ID_LEN
        )));
    }
    Ok(())
}

fn put_str(buf: &mut BytesMut, value: &str) {
    debug_assert!(value.len() <= MAX_ID_LEN);
    buf.put_u16(value.len() as u16);
    buf.put_slice(value.as_bytes());
}

fn get_str(data: &mut Bytes, what: &str) -> Result<String, PeerError> {
    if data.remaining() < 2 {
        return Err(PeerError::InvalidMessage(format!("{} too short", what)));
    }
    let len = data.get_u16() as usize;
    if data.remaining() < len {
        return Err(PeerError::InvalidMessage(format!("{} too short", what)));
    }
    let raw = data.copy_to_bytes(len);
    String::from_utf8(raw.to_vec())
        .map_err(|_| PeerError::InvalidMessage(format!("{} file id is not utf-8", what)))
}
