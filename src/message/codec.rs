//! Binary wire format.
//!
//! Frame layout: `[type:u8][messageId:i64][flags:u8]`, the type-specific structured
//! fields, then the data buffers the type carries. Buffers are `[len:u16][bytes]` with
//! `0xFFFF` marking an absent buffer. Integers are big-endian. The sending node is not
//! part of the frame; the transport supplies it on decode.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::types::{BackupData, BackupEntry, Message, MessageBody, MessageFlags, MessageType};
use crate::cluster::types::NodeId;
use crate::error::CodecError;

const NULL_BUFFER: u16 = u16::MAX;

/// Largest buffer that fits the u16 length prefix.
pub const MAX_BUFFER_LEN: usize = (u16::MAX - 1) as usize;

const BACKUP_EMPTY: u8 = 0;
const BACKUP_DATA: u8 = 1;
const BACKUP_DELETED: u8 = 2;

const HEADER_LEN: usize = 1 + 8 + 1;

pub fn encode(msg: &Message) -> Result<Bytes, CodecError> {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + 32);
    buf.put_u8(msg.message_type() as u8);
    buf.put_i64(msg.message_id);
    buf.put_u8(msg.flags.bits());

    match &msg.body {
        MessageBody::Get { line }
        | MessageBody::Getx { line }
        | MessageBody::InvAck { line }
        | MessageBody::NotFound { line }
        | MessageBody::Timeout { line }
        | MessageBody::MsgAck { line } => {
            buf.put_i64(*line);
        }
        MessageBody::Put {
            line,
            version,
            data,
        } => {
            buf.put_i64(*line);
            buf.put_u64(*version);
            put_buffer(&mut buf, data.as_ref())?;
        }
        MessageBody::Putx {
            line,
            version,
            sharers,
            data,
        } => {
            buf.put_i64(*line);
            buf.put_u64(*version);
            put_sharers(&mut buf, sharers)?;
            put_buffer(&mut buf, data.as_ref())?;
        }
        MessageBody::Inv {
            line,
            previous_owner,
        } => {
            buf.put_i64(*line);
            buf.put_i16(previous_owner.0);
        }
        MessageBody::ChngdOwnr {
            line,
            new_owner,
            certain,
        } => {
            buf.put_i64(*line);
            buf.put_i16(new_owner.0);
            buf.put_u8(u8::from(*certain));
        }
        MessageBody::Invoke { line, function } => {
            buf.put_i64(*line);
            put_buffer(&mut buf, Some(function))?;
        }
        MessageBody::InvRes { line, ok, payload } => {
            buf.put_i64(*line);
            buf.put_u8(u8::from(*ok));
            put_buffer(&mut buf, payload.as_ref())?;
        }
        MessageBody::Backup(entry) => {
            put_backup(&mut buf, entry)?;
        }
        MessageBody::BackupAck { line, version } => {
            buf.put_i64(*line);
            buf.put_u64(*version);
        }
        MessageBody::BackupPacket { packet_id, backups } => {
            buf.put_i64(*packet_id);
            buf.put_i32(backups.len() as i32);
            for entry in backups {
                put_backup(&mut buf, entry)?;
            }
        }
        MessageBody::BackupPacketAck { packet_id } => {
            buf.put_i64(*packet_id);
        }
        MessageBody::AllocRef { count } => {
            buf.put_i32(*count);
        }
        MessageBody::AllocedRef { start, count } => {
            buf.put_i64(*start);
            buf.put_i32(*count);
        }
        MessageBody::Msg { line, data } => {
            buf.put_i64(*line);
            put_buffer(&mut buf, data.as_ref())?;
        }
        MessageBody::Ack => {}
    }

    Ok(buf.freeze())
}

pub fn decode(from: NodeId, mut frame: Bytes) -> Result<Message, CodecError> {
    need(&frame, HEADER_LEN)?;
    let message_type = MessageType::from_u8(frame.get_u8())?;
    let message_id = frame.get_i64();
    let flags = MessageFlags::from_bits_truncate(frame.get_u8());

    let body = match message_type {
        MessageType::Get => MessageBody::Get {
            line: get_i64(&mut frame)?,
        },
        MessageType::Getx => MessageBody::Getx {
            line: get_i64(&mut frame)?,
        },
        MessageType::InvAck => MessageBody::InvAck {
            line: get_i64(&mut frame)?,
        },
        MessageType::NotFound => MessageBody::NotFound {
            line: get_i64(&mut frame)?,
        },
        MessageType::Timeout => MessageBody::Timeout {
            line: get_i64(&mut frame)?,
        },
        MessageType::MsgAck => MessageBody::MsgAck {
            line: get_i64(&mut frame)?,
        },
        MessageType::Put => {
            let line = get_i64(&mut frame)?;
            let version = get_u64(&mut frame)?;
            let data = get_buffer(&mut frame)?;
            MessageBody::Put {
                line,
                version,
                data,
            }
        }
        MessageType::Putx => {
            let line = get_i64(&mut frame)?;
            let version = get_u64(&mut frame)?;
            let sharers = get_sharers(&mut frame)?;
            let data = get_buffer(&mut frame)?;
            MessageBody::Putx {
                line,
                version,
                sharers,
                data,
            }
        }
        MessageType::Inv => {
            let line = get_i64(&mut frame)?;
            need(&frame, 2)?;
            MessageBody::Inv {
                line,
                previous_owner: NodeId(frame.get_i16()),
            }
        }
        MessageType::ChngdOwnr => {
            let line = get_i64(&mut frame)?;
            need(&frame, 3)?;
            let new_owner = NodeId(frame.get_i16());
            let certain = frame.get_u8() != 0;
            MessageBody::ChngdOwnr {
                line,
                new_owner,
                certain,
            }
        }
        MessageType::Invoke => {
            let line = get_i64(&mut frame)?;
            let function = get_buffer(&mut frame)?.unwrap_or_default();
            MessageBody::Invoke { line, function }
        }
        MessageType::InvRes => {
            let line = get_i64(&mut frame)?;
            need(&frame, 1)?;
            let ok = frame.get_u8() != 0;
            let payload = get_buffer(&mut frame)?;
            MessageBody::InvRes { line, ok, payload }
        }
        MessageType::Backup => MessageBody::Backup(get_backup(&mut frame)?),
        MessageType::BackupAck => {
            let line = get_i64(&mut frame)?;
            let version = get_u64(&mut frame)?;
            MessageBody::BackupAck { line, version }
        }
        MessageType::BackupPacket => {
            let packet_id = get_i64(&mut frame)?;
            need(&frame, 4)?;
            let count = frame.get_i32().max(0) as usize;
            let mut backups = Vec::with_capacity(count.min(1024));
            for _ in 0..count {
                backups.push(get_backup(&mut frame)?);
            }
            MessageBody::BackupPacket { packet_id, backups }
        }
        MessageType::BackupPacketAck => MessageBody::BackupPacketAck {
            packet_id: get_i64(&mut frame)?,
        },
        MessageType::AllocRef => {
            need(&frame, 4)?;
            MessageBody::AllocRef {
                count: frame.get_i32(),
            }
        }
        MessageType::AllocedRef => {
            let start = get_i64(&mut frame)?;
            need(&frame, 4)?;
            MessageBody::AllocedRef {
                start,
                count: frame.get_i32(),
            }
        }
        MessageType::Msg => {
            let line = get_i64(&mut frame)?;
            let data = get_buffer(&mut frame)?;
            MessageBody::Msg { line, data }
        }
        MessageType::Ack => MessageBody::Ack,
    };

    if frame.has_remaining() {
        return Err(CodecError::TrailingBytes(frame.remaining()));
    }

    Ok(Message {
        node: from,
        message_id,
        flags,
        body,
    })
}

fn need(frame: &Bytes, len: usize) -> Result<(), CodecError> {
    if frame.remaining() < len {
        Err(CodecError::UnexpectedEof)
    } else {
        Ok(())
    }
}

fn get_i64(frame: &mut Bytes) -> Result<i64, CodecError> {
    need(frame, 8)?;
    Ok(frame.get_i64())
}

fn get_u64(frame: &mut Bytes) -> Result<u64, CodecError> {
    need(frame, 8)?;
    Ok(frame.get_u64())
}

fn put_buffer(buf: &mut BytesMut, data: Option<&Bytes>) -> Result<(), CodecError> {
    match data {
        None => buf.put_u16(NULL_BUFFER),
        Some(bytes) => {
            if bytes.len() > MAX_BUFFER_LEN {
                return Err(CodecError::BufferTooLarge(bytes.len()));
            }
            buf.put_u16(bytes.len() as u16);
            buf.put_slice(bytes);
        }
    }
    Ok(())
}

fn get_buffer(frame: &mut Bytes) -> Result<Option<Bytes>, CodecError> {
    need(frame, 2)?;
    let len = frame.get_u16();
    if len == NULL_BUFFER {
        return Ok(None);
    }
    let len = len as usize;
    need(frame, len)?;
    Ok(Some(frame.split_to(len)))
}

fn put_sharers(buf: &mut BytesMut, sharers: &[NodeId]) -> Result<(), CodecError> {
    if sharers.len() > u16::MAX as usize {
        return Err(CodecError::BufferTooLarge(sharers.len()));
    }
    buf.put_u16(sharers.len() as u16);
    for node in sharers {
        buf.put_i16(node.0);
    }
    Ok(())
}

fn get_sharers(frame: &mut Bytes) -> Result<Vec<NodeId>, CodecError> {
    need(frame, 2)?;
    let count = frame.get_u16() as usize;
    need(frame, count * 2)?;
    Ok((0..count).map(|_| NodeId(frame.get_i16())).collect())
}

fn put_backup(buf: &mut BytesMut, entry: &BackupEntry) -> Result<(), CodecError> {
    buf.put_i64(entry.line);
    buf.put_u64(entry.version);
    match &entry.data {
        BackupData::Empty => buf.put_u8(BACKUP_EMPTY),
        BackupData::Data(bytes) => {
            buf.put_u8(BACKUP_DATA);
            put_buffer(buf, Some(bytes))?;
        }
        BackupData::Deleted => buf.put_u8(BACKUP_DELETED),
    }
    Ok(())
}

fn get_backup(frame: &mut Bytes) -> Result<BackupEntry, CodecError> {
    let line = get_i64(frame)?;
    let version = get_u64(frame)?;
    need(frame, 1)?;
    let data = match frame.get_u8() {
        BACKUP_EMPTY => BackupData::Empty,
        BACKUP_DATA => BackupData::Data(get_buffer(frame)?.unwrap_or_default()),
        BACKUP_DELETED => BackupData::Deleted,
        other => return Err(CodecError::UnknownBackupKind(other)),
    };
    Ok(BackupEntry {
        line,
        version,
        data,
    })
}
