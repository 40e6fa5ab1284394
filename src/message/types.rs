use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::cluster::types::NodeId;
use crate::error::CodecError;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MessageFlags: u8 {
        const RESPONSE = 0x01;
        const BROADCAST = 0x02;
        const REPLY_REQUIRED = 0x04;
    }
}

/// Wire tag of every message kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Get = 1,
    Getx = 2,
    Put = 3,
    Putx = 4,
    Inv = 5,
    InvAck = 6,
    ChngdOwnr = 7,
    NotFound = 8,
    Timeout = 9,
    Invoke = 10,
    InvRes = 11,
    Backup = 12,
    BackupAck = 13,
    BackupPacket = 14,
    BackupPacketAck = 15,
    AllocRef = 16,
    AllocedRef = 17,
    Msg = 18,
    MsgAck = 19,
    Ack = 20,
}

impl MessageType {
    pub fn from_u8(tag: u8) -> Result<Self, CodecError> {
        use MessageType::*;
        Ok(match tag {
            1 => Get,
            2 => Getx,
            3 => Put,
            4 => Putx,
            5 => Inv,
            6 => InvAck,
            7 => ChngdOwnr,
            8 => NotFound,
            9 => Timeout,
            10 => Invoke,
            11 => InvRes,
            12 => Backup,
            13 => BackupAck,
            14 => BackupPacket,
            15 => BackupPacketAck,
            16 => AllocRef,
            17 => AllocedRef,
            18 => Msg,
            19 => MsgAck,
            20 => Ack,
            other => return Err(CodecError::UnknownType(other)),
        })
    }

    /// Whether a message of this type may answer a request of type `request`.
    pub fn is_reply_to(self, request: MessageType) -> bool {
        use MessageType::*;
        match request {
            Get => matches!(self, Put | ChngdOwnr | NotFound | Ack),
            Getx => matches!(self, Putx | ChngdOwnr | NotFound | Ack),
            Invoke => matches!(self, InvRes | ChngdOwnr | NotFound | Ack),
            Msg => matches!(self, MsgAck | ChngdOwnr | NotFound | Ack),
            Inv => self == InvAck,
            Backup => self == BackupAck,
            BackupPacket => self == BackupPacketAck,
            AllocRef => self == AllocedRef,
            _ => false,
        }
    }

    /// Requests that are always sent expecting an answer.
    pub fn expects_reply(self) -> bool {
        use MessageType::*;
        matches!(
            self,
            Get | Getx | Inv | Invoke | Msg | Backup | BackupPacket | AllocRef
        )
    }
}

/// One line snapshot carried by a backup message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupEntry {
    pub line: i64,
    pub version: u64,
    pub data: BackupData,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackupData {
    /// Allocated line that never received a payload.
    Empty,
    Data(Bytes),
    /// Logical tombstone for a deleted line.
    Deleted,
}

impl BackupData {
    pub fn from_payload(data: Option<&Bytes>, deleted: bool) -> Self {
        if deleted {
            BackupData::Deleted
        } else {
            match data {
                Some(bytes) => BackupData::Data(bytes.clone()),
                None => BackupData::Empty,
            }
        }
    }
}

/// Line id used by the backup that tells a slave its initial replication is complete.
pub const REPLICATION_COMPLETE_MARKER: i64 = -1;

/// Message bodies, one variant per wire type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageBody {
    Get { line: i64 },
    Getx { line: i64 },
    Put { line: i64, version: u64, data: Option<Bytes> },
    Putx { line: i64, version: u64, sharers: Vec<NodeId>, data: Option<Bytes> },
    Inv { line: i64, previous_owner: NodeId },
    InvAck { line: i64 },
    ChngdOwnr { line: i64, new_owner: NodeId, certain: bool },
    NotFound { line: i64 },
    Timeout { line: i64 },
    Invoke { line: i64, function: Bytes },
    /// `ok == false` means `payload` holds a UTF-8 error description.
    InvRes { line: i64, ok: bool, payload: Option<Bytes> },
    Backup(BackupEntry),
    BackupAck { line: i64, version: u64 },
    BackupPacket { packet_id: i64, backups: Vec<BackupEntry> },
    BackupPacketAck { packet_id: i64 },
    AllocRef { count: i32 },
    AllocedRef { start: i64, count: i32 },
    Msg { line: i64, data: Option<Bytes> },
    MsgAck { line: i64 },
    Ack,
}

impl MessageBody {
    pub fn message_type(&self) -> MessageType {
        match self {
            MessageBody::Get { .. } => MessageType::Get,
            MessageBody::Getx { .. } => MessageType::Getx,
            MessageBody::Put { .. } => MessageType::Put,
            MessageBody::Putx { .. } => MessageType::Putx,
            MessageBody::Inv { .. } => MessageType::Inv,
            MessageBody::InvAck { .. } => MessageType::InvAck,
            MessageBody::ChngdOwnr { .. } => MessageType::ChngdOwnr,
            MessageBody::NotFound { .. } => MessageType::NotFound,
            MessageBody::Timeout { .. } => MessageType::Timeout,
            MessageBody::Invoke { .. } => MessageType::Invoke,
            MessageBody::InvRes { .. } => MessageType::InvRes,
            MessageBody::Backup(_) => MessageType::Backup,
            MessageBody::BackupAck { .. } => MessageType::BackupAck,
            MessageBody::BackupPacket { .. } => MessageType::BackupPacket,
            MessageBody::BackupPacketAck { .. } => MessageType::BackupPacketAck,
            MessageBody::AllocRef { .. } => MessageType::AllocRef,
            MessageBody::AllocedRef { .. } => MessageType::AllocedRef,
            MessageBody::Msg { .. } => MessageType::Msg,
            MessageBody::MsgAck { .. } => MessageType::MsgAck,
            MessageBody::Ack => MessageType::Ack,
        }
    }

    /// The line this message is about, if any.
    pub fn line(&self) -> Option<i64> {
        match self {
            MessageBody::Get { line }
            | MessageBody::Getx { line }
            | MessageBody::Put { line, .. }
            | MessageBody::Putx { line, .. }
            | MessageBody::Inv { line, .. }
            | MessageBody::InvAck { line }
            | MessageBody::ChngdOwnr { line, .. }
            | MessageBody::NotFound { line }
            | MessageBody::Timeout { line }
            | MessageBody::Invoke { line, .. }
            | MessageBody::InvRes { line, .. }
            | MessageBody::BackupAck { line, .. }
            | MessageBody::Msg { line, .. }
            | MessageBody::MsgAck { line } => Some(*line),
            MessageBody::Backup(entry) => Some(entry.line),
            MessageBody::BackupPacket { .. }
            | MessageBody::BackupPacketAck { .. }
            | MessageBody::AllocRef { .. }
            | MessageBody::AllocedRef { .. }
            | MessageBody::Ack => None,
        }
    }
}

/// A protocol message.
///
/// `node` is the destination while sending and the source once received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub node: NodeId,
    pub message_id: i64,
    pub flags: MessageFlags,
    pub body: MessageBody,
}

impl Message {
    /// A new outbound message; the sender assigns `message_id`.
    pub fn to(node: NodeId, body: MessageBody) -> Self {
        let flags = if body.message_type().expects_reply() {
            MessageFlags::REPLY_REQUIRED
        } else {
            MessageFlags::empty()
        };
        Self {
            node,
            message_id: 0,
            flags,
            body,
        }
    }

    pub fn broadcast(body: MessageBody) -> Self {
        let mut msg = Self::to(NodeId::NONE, body);
        msg.flags |= MessageFlags::BROADCAST;
        msg
    }

    /// A response paired with this message: same id, addressed back to its sender.
    pub fn reply(&self, body: MessageBody) -> Message {
        Message {
            node: self.node,
            message_id: self.message_id,
            flags: MessageFlags::RESPONSE,
            body,
        }
    }

    pub fn message_type(&self) -> MessageType {
        self.body.message_type()
    }

    pub fn line(&self) -> Option<i64> {
        self.body.line()
    }

    pub fn is_response(&self) -> bool {
        self.flags.contains(MessageFlags::RESPONSE)
    }

    pub fn is_broadcast(&self) -> bool {
        self.flags.contains(MessageFlags::BROADCAST)
    }

    pub fn is_reply_required(&self) -> bool {
        self.flags.contains(MessageFlags::REPLY_REQUIRED)
    }

    /// Response pairing: type-compatible, same message id, and from the node that was
    /// asked (any node for a broadcast). Object identity plays no part.
    pub fn is_response_to(&self, request: &Message) -> bool {
        self.is_response()
            && self.message_id == request.message_id
            && self.message_type().is_reply_to(request.message_type())
            && (request.is_broadcast() || self.node == request.node)
    }
}

/// A named function shipped to a line's owner by INVOKE.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineFunction {
    pub name: String,
    pub args: Bytes,
}

impl LineFunction {
    pub fn new(name: impl Into<String>, args: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            args: args.into(),
        }
    }

    /// `[nameLen:u16][name][args]`
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(2 + self.name.len() + self.args.len());
        buf.put_u16(self.name.len() as u16);
        buf.put_slice(self.name.as_bytes());
        buf.put_slice(&self.args);
        buf.freeze()
    }

    pub fn from_bytes(mut blob: Bytes) -> Result<Self, CodecError> {
        if blob.remaining() < 2 {
            return Err(CodecError::InvalidFunction);
        }
        let name_len = blob.get_u16() as usize;
        if blob.remaining() < name_len {
            return Err(CodecError::InvalidFunction);
        }
        let name_bytes = blob.split_to(name_len);
        let name = String::from_utf8(name_bytes.to_vec()).map_err(|_| CodecError::InvalidFunction)?;
        Ok(Self { name, args: blob })
    }
}
