//! Command and reply codecs
//!
//! Commands are a single-byte tag frame followed by argument frames:
//!
//! | Tag | Command | Arguments |
//! |---|---|---|
//! | `0x01` | `GET_FILE` | fid |
//! | `0x02` | `TRANSFER` | fid, source driver, size (u64) |
//! | `0x03` | `TRANSFER_COMPLETE` | fid, driver |
//! | `0x04` | `DELETE` | fid, driver |
//! | `0x05` | `UPDATE` | fid, driver |
//!
//! Chunk requests are three frames `(name, offset: u64, size: u64)` and are
//! told apart from commands by shape: a command's first frame is exactly one
//! tag byte.
//!
//! Replies: a data reply is a single frame of raw bytes; acknowledgements
//! and failures are tagged - `[OK]`, `[ERROR, reason]`, `[BUSY, ""]`. The
//! two-frame shape of `ERROR`/`BUSY` keeps them unambiguous against data
//! frames that happen to spell the same words.

use onitu_core::{DriverName, Fid};

use crate::FabricError;

/// `GET_FILE` tag byte.
pub const TAG_GET_FILE: u8 = 0x01;
/// `TRANSFER` tag byte.
pub const TAG_TRANSFER: u8 = 0x02;
/// `TRANSFER_COMPLETE` tag byte.
pub const TAG_TRANSFER_COMPLETE: u8 = 0x03;
/// `DELETE` tag byte.
pub const TAG_DELETE: u8 = 0x04;
/// `UPDATE` tag byte.
pub const TAG_UPDATE: u8 = 0x05;

/// A command carried over the fabric.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Broker request: fetch the whole file addressed by fid.
    GetFile { fid: Fid },
    /// Referee order: pull `fid` from `source`, expecting `size` bytes.
    Transfer {
        fid: Fid,
        source: DriverName,
        size: u64,
    },
    /// Plug report: `driver` now holds the latest version of `fid`.
    TransferComplete { fid: Fid, driver: DriverName },
    /// Deletion report (plug -> referee) or order (referee -> plug).
    Delete { fid: Fid, driver: DriverName },
    /// Metadata-change report: `driver` updated the record of `fid`.
    Update { fid: Fid, driver: DriverName },
}

impl Command {
    /// The command's tag byte.
    #[must_use]
    pub fn tag(&self) -> u8 {
        match self {
            Self::GetFile { .. } => TAG_GET_FILE,
            Self::Transfer { .. } => TAG_TRANSFER,
            Self::TransferComplete { .. } => TAG_TRANSFER_COMPLETE,
            Self::Delete { .. } => TAG_DELETE,
            Self::Update { .. } => TAG_UPDATE,
        }
    }

    /// Encodes the command as wire frames.
    #[must_use]
    pub fn to_frames(&self) -> Vec<Vec<u8>> {
        match self {
            Self::GetFile { fid } => vec![vec![self.tag()], fid.as_bytes().to_vec()],
            Self::Transfer { fid, source, size } => vec![
                vec![self.tag()],
                fid.as_bytes().to_vec(),
                source.as_str().as_bytes().to_vec(),
                size.to_be_bytes().to_vec(),
            ],
            Self::TransferComplete { fid, driver }
            | Self::Delete { fid, driver }
            | Self::Update { fid, driver } => vec![
                vec![self.tag()],
                fid.as_bytes().to_vec(),
                driver.as_str().as_bytes().to_vec(),
            ],
        }
    }

    /// Decodes a command from wire frames.
    pub fn from_frames(frames: &[Vec<u8>]) -> Result<Self, FabricError> {
        let tag = frames
            .first()
            .filter(|f| f.len() == 1)
            .map(|f| f[0])
            .ok_or_else(|| FabricError::Protocol("missing command tag".into()))?;

        match tag {
            TAG_GET_FILE => {
                let fid = fid_frame(frames.get(1))?;
                Ok(Self::GetFile { fid })
            }
            TAG_TRANSFER => {
                let fid = fid_frame(frames.get(1))?;
                let source = driver_frame(frames.get(2))?;
                let size = u64_frame(frames.get(3))?;
                Ok(Self::Transfer { fid, source, size })
            }
            TAG_TRANSFER_COMPLETE => {
                let fid = fid_frame(frames.get(1))?;
                let driver = driver_frame(frames.get(2))?;
                Ok(Self::TransferComplete { fid, driver })
            }
            TAG_DELETE => {
                let fid = fid_frame(frames.get(1))?;
                let driver = driver_frame(frames.get(2))?;
                Ok(Self::Delete { fid, driver })
            }
            TAG_UPDATE => {
                let fid = fid_frame(frames.get(1))?;
                let driver = driver_frame(frames.get(2))?;
                Ok(Self::Update { fid, driver })
            }
            other => Err(FabricError::Protocol(format!("unknown command tag {other:#04x}"))),
        }
    }
}

/// A request arriving at a router endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Chunk read: `(name, offset, size)`.
    Chunk {
        name: String,
        offset: u64,
        size: u64,
    },
    /// A tagged command.
    Command(Command),
}

impl Request {
    /// Encodes the request as wire frames.
    #[must_use]
    pub fn to_frames(&self) -> Vec<Vec<u8>> {
        match self {
            Self::Chunk { name, offset, size } => vec![
                name.as_bytes().to_vec(),
                offset.to_be_bytes().to_vec(),
                size.to_be_bytes().to_vec(),
            ],
            Self::Command(cmd) => cmd.to_frames(),
        }
    }

    /// Decodes a request, telling chunk reads and commands apart by shape.
    pub fn from_frames(frames: &[Vec<u8>]) -> Result<Self, FabricError> {
        if frames.first().map(|f| f.len()) == Some(1) {
            return Command::from_frames(frames).map(Self::Command);
        }

        if frames.len() != 3 {
            return Err(FabricError::Protocol(format!(
                "chunk request needs 3 frames, got {}",
                frames.len()
            )));
        }
        let name = String::from_utf8(frames[0].clone())
            .map_err(|_| FabricError::Protocol("chunk name is not UTF-8".into()))?;
        let offset = u64_frame(frames.get(1))?;
        let size = u64_frame(frames.get(2))?;
        Ok(Self::Chunk { name, offset, size })
    }
}

/// A reply sent back over the same connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Acknowledgement without payload.
    Ok,
    /// Raw data payload (chunk bytes, whole file).
    Bytes(Vec<u8>),
    /// Explicit failure with a reason the caller can log or surface.
    Error(String),
    /// Bounded queue overflow; try again later.
    Busy,
}

impl Reply {
    /// Encodes the reply as wire frames.
    #[must_use]
    pub fn to_frames(&self) -> Vec<Vec<u8>> {
        match self {
            Self::Ok => vec![b"OK".to_vec()],
            Self::Bytes(data) => vec![data.clone()],
            Self::Error(reason) => vec![b"ERROR".to_vec(), reason.as_bytes().to_vec()],
            Self::Busy => vec![b"BUSY".to_vec(), Vec::new()],
        }
    }

    /// Decodes a reply to a data request (chunk read, `GET_FILE`).
    ///
    /// A single frame is the payload; the tagged two-frame shapes are
    /// failures.
    pub fn decode_data(frames: Vec<Vec<u8>>) -> Result<Self, FabricError> {
        if let Some(reply) = Self::decode_tagged(&frames) {
            return Ok(reply);
        }
        let mut frames = frames;
        if frames.len() == 1 {
            Ok(Self::Bytes(frames.remove(0)))
        } else {
            Err(FabricError::Protocol(format!(
                "unexpected data reply of {} frames",
                frames.len()
            )))
        }
    }

    /// Decodes a reply to a command (acknowledgement expected).
    pub fn decode_ack(frames: Vec<Vec<u8>>) -> Result<Self, FabricError> {
        match Self::decode_tagged(&frames) {
            Some(reply) => Ok(reply),
            None if frames.len() == 1 && frames[0] == b"OK" => Ok(Self::Ok),
            None => Err(FabricError::Protocol("malformed acknowledgement".into())),
        }
    }

    fn decode_tagged(frames: &[Vec<u8>]) -> Option<Self> {
        if frames.len() == 2 {
            if frames[0] == b"ERROR" {
                return Some(Self::Error(String::from_utf8_lossy(&frames[1]).into_owned()));
            }
            if frames[0] == b"BUSY" {
                return Some(Self::Busy);
            }
        }
        None
    }
}

fn fid_frame(frame: Option<&Vec<u8>>) -> Result<Fid, FabricError> {
    let frame = frame.ok_or_else(|| FabricError::Protocol("missing fid frame".into()))?;
    let bytes: [u8; 16] = frame
        .as_slice()
        .try_into()
        .map_err(|_| FabricError::Protocol(format!("fid frame of {} bytes", frame.len())))?;
    Ok(Fid::from_bytes(bytes))
}

fn driver_frame(frame: Option<&Vec<u8>>) -> Result<DriverName, FabricError> {
    let frame = frame.ok_or_else(|| FabricError::Protocol("missing driver frame".into()))?;
    let name = String::from_utf8(frame.clone())
        .map_err(|_| FabricError::Protocol("driver name is not UTF-8".into()))?;
    DriverName::new(name).map_err(|e| FabricError::Protocol(e.to_string()))
}

fn u64_frame(frame: Option<&Vec<u8>>) -> Result<u64, FabricError> {
    let frame = frame.ok_or_else(|| FabricError::Protocol("missing integer frame".into()))?;
    let bytes: [u8; 8] = frame
        .as_slice()
        .try_into()
        .map_err(|_| FabricError::Protocol(format!("integer frame of {} bytes", frame.len())))?;
    Ok(u64::from_be_bytes(bytes))
}
