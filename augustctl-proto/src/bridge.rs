//! Messages exchanged with the bridge process that owns the BLE stack
//!
//! Every message travels in a frame: a 2 byte type, a 4 byte length, both big
//! endian, then a JSON payload.

use std::io::{self, Read, Write};

use crate::{Command, Outcome, ProtocolError};

pub const MSG_REQUEST: u16 = 0x0001;
pub const MSG_RESPONSE: u16 = 0x0002;

/// Upper bound on a frame payload; real messages are well under 1 KiB
pub const MAX_FRAME_LEN: usize = 64 * 1024;

/// Ask the bridge to run one lock command
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeRequest {
    pub correlation_id: u64,
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub argument: Option<u16>,
}

impl BridgeRequest {
    pub fn new(correlation_id: u64, command: Command) -> Self {
        Self {
            correlation_id,
            command: command.name().to_string(),
            argument: command.argument(),
        }
    }

    pub fn command(&self) -> Result<Command, ProtocolError> {
        Command::from_parts(&self.command, self.argument)
    }

    pub fn to_frame(&self) -> io::Result<Frame> {
        Ok(Frame::new(MSG_REQUEST, serde_json::to_vec(self)?))
    }
}

/// The bridge's answer, matched to its request by `correlation_id`
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeResponse {
    pub correlation_id: u64,
    pub result: Result<Outcome, ProtocolError>,
}

impl BridgeResponse {
    pub fn to_frame(&self) -> io::Result<Frame> {
        Ok(Frame::new(MSG_RESPONSE, serde_json::to_vec(self)?))
    }
}

/// Frame: wraps any message with type and length
#[derive(Debug, Clone)]
pub struct Frame {
    pub msg_type: u16,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(msg_type: u16, payload: Vec<u8>) -> Self {
        Self { msg_type, payload }
    }

    /// Decodes the payload, checking the frame carries `expected`
    pub fn decode<T: serde::de::DeserializeOwned>(&self, expected: u16) -> io::Result<T> {
        if self.msg_type != expected {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("expected frame 0x{expected:04x}, got 0x{:04x}", self.msg_type),
            ));
        }
        serde_json::from_slice(&self.payload).map_err(io::Error::from)
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        let len = self.payload.len() as u32;
        writer.write_all(&self.msg_type.to_be_bytes())?;
        writer.write_all(&len.to_be_bytes())?;
        writer.write_all(&self.payload)?;
        Ok(())
    }

    pub fn read_from<R: Read>(reader: &mut R) -> io::Result<Self> {
        let mut header = [0u8; 6];
        reader.read_exact(&mut header)?;
        let (msg_type, len) = parse_header(&header)?;

        let mut payload = vec![0u8; len];
        reader.read_exact(&mut payload)?;

        Ok(Self { msg_type, payload })
    }
}

fn parse_header(header: &[u8; 6]) -> io::Result<(u16, usize)> {
    let msg_type = u16::from_be_bytes([header[0], header[1]]);
    let len = u32::from_be_bytes([header[2], header[3], header[4], header[5]]) as usize;
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "frame too large"));
    }
    Ok((msg_type, len))
}

/// Async frame operations for tokio
#[cfg(feature = "async")]
pub mod async_io {
    use super::*;
    use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

    pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &Frame) -> io::Result<()> {
        let len = frame.payload.len() as u32;
        writer.write_all(&frame.msg_type.to_be_bytes()).await?;
        writer.write_all(&len.to_be_bytes()).await?;
        writer.write_all(&frame.payload).await?;
        writer.flush().await?;
        Ok(())
    }

    pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Frame> {
        let mut header = [0u8; 6];
        reader.read_exact(&mut header).await?;
        let (msg_type, len) = parse_header(&header)?;

        let mut payload = vec![0u8; len];
        reader.read_exact(&mut payload).await?;

        Ok(Frame { msg_type, payload })
    }
}
