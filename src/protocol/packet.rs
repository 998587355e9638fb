//! The typed packet model.
//!
//! [`Packet`] is a sum type over every message kind the relay understands,
//! one variant per integer tag in [`code`]. Payload structs mirror the wire
//! fields exactly; nothing here validates who may send what, that is the
//! router's job.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::Capability;
use crate::sync::diff::Fragment;

/// Integer `packet` tags.
pub mod code {
    pub const CONNECTION_UPDATE: u64 = 0x00;
    pub const CONNECTION_ABUSE: u64 = 0x01;
    pub const CONNECTION_PING: u64 = 0x02;
    pub const TERMINAL_CONTENTS: u64 = 0x10;
    pub const TERMINAL_INFO: u64 = 0x11;
    pub const TERMINAL_PASTE: u64 = 0x20;
    pub const TERMINAL_KEY: u64 = 0x21;
    pub const TERMINAL_MOUSE: u64 = 0x22;
    pub const FILE_LISTING: u64 = 0x30;
    pub const FILE_REQUEST: u64 = 0x31;
    pub const FILE_ACTION: u64 = 0x32;
    pub const FILE_CONSUME: u64 = 0x33;
}

/// One protocol message.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    ConnectionUpdate(ConnectionUpdate),
    ConnectionAbuse(ConnectionAbuse),
    ConnectionPing,
    TerminalContents(TerminalContents),
    TerminalInfo(TerminalInfo),
    TerminalPaste(TerminalPaste),
    TerminalKey(TerminalKey),
    TerminalMouse(TerminalMouse),
    FileListing(FileListing),
    FileRequest(FileRequest),
    FileAction(FileAction),
    FileConsume(FileConsume),
    /// A well-formed envelope whose tag is outside the known set. Decodes
    /// opaquely so the router can drop it without tearing the socket down.
    Unknown { packet: u64 },
}

impl Packet {
    pub fn code(&self) -> u64 {
        match self {
            Packet::ConnectionUpdate(_) => code::CONNECTION_UPDATE,
            Packet::ConnectionAbuse(_) => code::CONNECTION_ABUSE,
            Packet::ConnectionPing => code::CONNECTION_PING,
            Packet::TerminalContents(_) => code::TERMINAL_CONTENTS,
            Packet::TerminalInfo(_) => code::TERMINAL_INFO,
            Packet::TerminalPaste(_) => code::TERMINAL_PASTE,
            Packet::TerminalKey(_) => code::TERMINAL_KEY,
            Packet::TerminalMouse(_) => code::TERMINAL_MOUSE,
            Packet::FileListing(_) => code::FILE_LISTING,
            Packet::FileRequest(_) => code::FILE_REQUEST,
            Packet::FileAction(_) => code::FILE_ACTION,
            Packet::FileConsume(_) => code::FILE_CONSUME,
            Packet::Unknown { packet } => *packet,
        }
    }

    /// The kind name used in log lines.
    pub fn name(&self) -> &'static str {
        match self {
            Packet::ConnectionUpdate(_) => "ConnectionUpdate",
            Packet::ConnectionAbuse(_) => "ConnectionAbuse",
            Packet::ConnectionPing => "ConnectionPing",
            Packet::TerminalContents(_) => "TerminalContents",
            Packet::TerminalInfo(_) => "TerminalInfo",
            Packet::TerminalPaste(_) => "TerminalPaste",
            Packet::TerminalKey(_) => "TerminalKey",
            Packet::TerminalMouse(_) => "TerminalMouse",
            Packet::FileListing(_) => "FileListing",
            Packet::FileRequest(_) => "FileRequest",
            Packet::FileAction(_) => "FileAction",
            Packet::FileConsume(_) => "FileConsume",
            Packet::Unknown { .. } => "Unknown",
        }
    }
}

/// Relay → client: who else is on the session.
///
/// `capabilities` is the union over the *other* clients, never the
/// recipient's own declaration, so a viewer can tell "a host is present"
/// without learning about fellow viewers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionUpdate {
    pub clients: u32,
    pub capabilities: Vec<Capability>,
}

/// Relay → client: the session is misbehaving (bandwidth, flooding). The
/// relay reserves the right to close instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionAbuse {
    pub message: String,
}

/// Full terminal repaint from the host.
///
/// `text`/`fore`/`back` hold one string per row; colors are hex nibbles into
/// the 16-entry palette.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalContents {
    pub width: u8,
    pub height: u8,
    pub cursor_x: u8,
    pub cursor_y: u8,
    pub cursor_blink: bool,
    pub cur_fore: u8,
    pub cur_back: u8,
    pub palette: [[u8; 3]; 16],
    pub text: Vec<String>,
    pub fore: Vec<String>,
    pub back: Vec<String>,
}

/// Host → viewers: a status line, without a full repaint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerminalInfo {
    pub message: String,
}

/// Viewer → host: pasted text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerminalPaste {
    pub contents: String,
}

/// Viewer → host: a key press (`kind` 0) or release (`kind` 1), with the
/// produced character if any.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerminalKey {
    pub kind: u8,
    pub code: u8,
    pub r#char: String,
}

/// Viewer → host: a mouse press/release/drag/scroll (`kind` 0-3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerminalMouse {
    pub kind: u8,
    pub button: u8,
    pub x: u8,
    pub y: u8,
}

/// One file a party knows about, with the checksum of its copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileEntry {
    pub file: String,
    pub checksum: u32,
}

/// File host → editors: the files available on the session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileListing {
    pub id: u8,
    pub files: Vec<FileEntry>,
}

/// Ask the addressed party to send the named files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRequest {
    pub id: u8,
    #[serde(rename = "file")]
    pub files: Vec<FileEntry>,
}

/// Bitset of file transfer modifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileFlags(pub u8);

impl FileFlags {
    /// Apply regardless of the expected checksum.
    pub const FORCE: FileFlags = FileFlags(0x01);
    /// Open the file in the recipient's editor.
    pub const OPEN: FileFlags = FileFlags(0x02);
    /// The file must not be written back.
    pub const READ_ONLY: FileFlags = FileFlags(0x04);
    /// The file did not previously exist on the sender.
    pub const NEW: FileFlags = FileFlags(0x08);

    pub fn contains(self, flags: FileFlags) -> bool {
        self.0 & flags.0 == flags.0
    }
}

impl std::ops::BitOr for FileFlags {
    type Output = FileFlags;

    fn bitor(self, rhs: FileFlags) -> FileFlags {
        FileFlags(self.0 | rhs.0)
    }
}

/// What to do to one file.
#[derive(Debug, Clone, PartialEq)]
pub enum FileActionKind {
    /// Full replacement contents.
    Replace { contents: String },
    /// An ordered fragment list against the sender's last-known remote copy.
    Patch { delta: Vec<Fragment> },
    Delete,
}

const ACTION_REPLACE: u8 = 0;
const ACTION_PATCH: u8 = 1;
const ACTION_DELETE: u8 = 2;

/// One file's proposed change, tagged with the checksum the proposer
/// believes is current on the receiving side.
#[derive(Debug, Clone, PartialEq)]
pub struct FileActionEntry {
    pub file: String,
    pub checksum: u32,
    pub flags: FileFlags,
    pub action: FileActionKind,
}

#[derive(Serialize, Deserialize)]
struct RawActionEntry {
    file: String,
    checksum: u32,
    #[serde(default)]
    flags: FileFlags,
    action: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    contents: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    delta: Option<Vec<Fragment>>,
}

impl Serialize for FileActionEntry {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let (action, contents, delta) = match &self.action {
            FileActionKind::Replace { contents } => {
                (ACTION_REPLACE, Some(contents.clone()), None)
            }
            FileActionKind::Patch { delta } => (ACTION_PATCH, None, Some(delta.clone())),
            FileActionKind::Delete => (ACTION_DELETE, None, None),
        };
        RawActionEntry {
            file: self.file.clone(),
            checksum: self.checksum,
            flags: self.flags,
            action,
            contents,
            delta,
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for FileActionEntry {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = RawActionEntry::deserialize(deserializer)?;
        let action = match raw.action {
            ACTION_REPLACE => FileActionKind::Replace {
                contents: raw.contents.ok_or_else(|| D::Error::missing_field("contents"))?,
            },
            ACTION_PATCH => FileActionKind::Patch {
                delta: raw.delta.ok_or_else(|| D::Error::missing_field("delta"))?,
            },
            ACTION_DELETE => FileActionKind::Delete,
            other => return Err(D::Error::custom(format!("unknown file action {other}"))),
        };
        Ok(FileActionEntry {
            file: raw.file,
            checksum: raw.checksum,
            flags: raw.flags,
            action,
        })
    }
}

/// Proposed changes to a set of files, under optimistic concurrency.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileAction {
    pub id: u8,
    pub actions: Vec<FileActionEntry>,
}

/// Outcome of one proposed change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum FileResult {
    /// Applied; the reported checksum is now current.
    Ok,
    /// Checksum mismatch; nothing was applied. Re-fetch and retry.
    Reject,
    /// Checksum matched but the change could not be applied.
    Failure,
}

impl From<FileResult> for u8 {
    fn from(result: FileResult) -> u8 {
        match result {
            FileResult::Ok => 0,
            FileResult::Reject => 1,
            FileResult::Failure => 2,
        }
    }
}

impl TryFrom<u8> for FileResult {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, String> {
        match value {
            0 => Ok(FileResult::Ok),
            1 => Ok(FileResult::Reject),
            2 => Ok(FileResult::Failure),
            other => Err(format!("unknown file result {other}")),
        }
    }
}

/// Per-file outcome report for an earlier [`FileAction`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileConsumeEntry {
    pub file: String,
    pub checksum: u32,
    pub result: FileResult,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileConsume {
    pub id: u8,
    pub files: Vec<FileConsumeEntry>,
}
