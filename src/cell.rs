//! Cell codec
//!
//! Frames fixed-length (514-byte) and variable-length cells on a byte
//! stream, for link protocol versions >= 4 (4-byte circuit ids). The
//! VERSIONS exchange is special: it always uses a 2-byte circuit id, so the
//! codec exposes dedicated entry points for it and VERSIONS payloads never
//! appear as [`Cell`] values.

use crate::error::{CellError, Error, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Payload length of a fixed cell.
pub const PAYLOAD_LEN: usize = 509;

/// Total length of a fixed cell: 4 (circ id) + 1 (command) + 509 (payload).
pub const FIXED_CELL_LEN: usize = 514;

/// Policy cap for variable-length cell payloads.
pub const MAX_VAR_PAYLOAD_LEN: usize = 10_000;

/// Cell command types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CellCommand {
    Padding = 0,
    Create = 1,
    Created = 2,
    Relay = 3,
    Destroy = 4,
    CreateFast = 5,
    CreatedFast = 6,
    Versions = 7,
    Netinfo = 8,
    RelayEarly = 9,
    Create2 = 10,
    Created2 = 11,
    PaddingNegotiate = 12,
    Vpadding = 128,
    Certs = 129,
    AuthChallenge = 130,
    Authenticate = 131,
    Authorize = 132,
}

impl CellCommand {
    pub fn from_u8(cmd: u8) -> Option<Self> {
        match cmd {
            0 => Some(CellCommand::Padding),
            1 => Some(CellCommand::Create),
            2 => Some(CellCommand::Created),
            3 => Some(CellCommand::Relay),
            4 => Some(CellCommand::Destroy),
            5 => Some(CellCommand::CreateFast),
            6 => Some(CellCommand::CreatedFast),
            7 => Some(CellCommand::Versions),
            8 => Some(CellCommand::Netinfo),
            9 => Some(CellCommand::RelayEarly),
            10 => Some(CellCommand::Create2),
            11 => Some(CellCommand::Created2),
            12 => Some(CellCommand::PaddingNegotiate),
            128 => Some(CellCommand::Vpadding),
            129 => Some(CellCommand::Certs),
            130 => Some(CellCommand::AuthChallenge),
            131 => Some(CellCommand::Authenticate),
            132 => Some(CellCommand::Authorize),
            _ => None,
        }
    }

    /// VERSIONS and commands >= 128 carry a 2-byte length and a variable
    /// payload; everything else is fixed at 509 payload bytes.
    pub fn is_variable_length(self) -> bool {
        self == CellCommand::Versions || (self as u8) >= 128
    }
}

/// A cell on a version >= 4 link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cell {
    pub circ_id: u32,
    pub command: CellCommand,
    payload: Vec<u8>,
}

impl Cell {
    /// Creates a fixed-length cell with a zeroed 509-byte payload.
    pub fn fixed(circ_id: u32, command: CellCommand) -> Self {
        debug_assert!(!command.is_variable_length());
        Self {
            circ_id,
            command,
            payload: vec![0; PAYLOAD_LEN],
        }
    }

    /// Creates a variable-length cell with the given payload.
    pub fn variable(circ_id: u32, command: CellCommand, payload: Vec<u8>) -> Self {
        debug_assert!(command.is_variable_length());
        Self {
            circ_id,
            command,
            payload,
        }
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.payload
    }

    /// Wire encoding: circ_id(4) | command(1) | [length(2)] | payload.
    pub fn to_bytes(&self) -> Vec<u8> {
        let variable = self.command.is_variable_length();
        let mut buf = Vec::with_capacity(5 + if variable { 2 } else { 0 } + self.payload.len());
        buf.extend_from_slice(&self.circ_id.to_be_bytes());
        buf.push(self.command as u8);
        if variable {
            buf.extend_from_slice(&(self.payload.len() as u16).to_be_bytes());
        }
        buf.extend_from_slice(&self.payload);
        buf
    }
}

/// Encodes a VERSIONS cell. VERSIONS always uses a 2-byte circuit id (zero),
/// regardless of the link version eventually negotiated.
pub fn encode_versions(versions: &[u16]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(5 + 2 * versions.len());
    buf.extend_from_slice(&[0, 0]); // circ id
    buf.push(CellCommand::Versions as u8);
    buf.extend_from_slice(&((2 * versions.len()) as u16).to_be_bytes());
    for v in versions {
        buf.extend_from_slice(&v.to_be_bytes());
    }
    buf
}

/// Reads cells from a byte stream.
pub struct CellReader<R> {
    inner: R,
}

impl<R: AsyncRead + Unpin> CellReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Reads one cell in 4-byte circuit id mode (after VERSIONS negotiation).
    pub async fn read_cell(&mut self) -> Result<Cell> {
        let mut hdr = [0u8; 5];
        self.read_exact(&mut hdr).await?;
        let circ_id = u32::from_be_bytes([hdr[0], hdr[1], hdr[2], hdr[3]]);
        let command =
            CellCommand::from_u8(hdr[4]).ok_or(CellError::UnknownCommand(hdr[4]))?;

        if command.is_variable_length() {
            let mut len_buf = [0u8; 2];
            self.read_exact(&mut len_buf).await?;
            let len = u16::from_be_bytes(len_buf) as usize;
            if len > MAX_VAR_PAYLOAD_LEN {
                return Err(CellError::Oversized(len).into());
            }
            let mut payload = vec![0u8; len];
            self.read_exact(&mut payload).await?;
            log::trace!("read var cell: circ=0x{circ_id:08x} cmd={command:?} len={len}");
            Ok(Cell::variable(circ_id, command, payload))
        } else {
            let mut payload = vec![0u8; PAYLOAD_LEN];
            self.read_exact(&mut payload).await?;
            log::trace!("read fixed cell: circ=0x{circ_id:08x} cmd={command:?}");
            Ok(Cell {
                circ_id,
                command,
                payload,
            })
        }
    }

    /// Reads the server's VERSIONS cell, which uses a 2-byte circuit id.
    /// Returns the offered version numbers.
    pub async fn read_versions(&mut self) -> Result<Vec<u16>> {
        // 2-byte circ id + command + 2-byte length
        let mut hdr = [0u8; 5];
        self.read_exact(&mut hdr).await?;
        if hdr[2] != CellCommand::Versions as u8 {
            return Err(Error::Handshake(crate::error::HandshakeError::UnexpectedCell {
                expected: CellCommand::Versions as u8,
                got: hdr[2],
            }));
        }
        let len = u16::from_be_bytes([hdr[3], hdr[4]]) as usize;
        if len > MAX_VAR_PAYLOAD_LEN {
            return Err(CellError::Oversized(len).into());
        }
        let mut payload = vec![0u8; len];
        self.read_exact(&mut payload).await?;

        let versions = payload
            .chunks_exact(2)
            .map(|c| u16::from_be_bytes([c[0], c[1]]))
            .collect();
        Ok(versions)
    }

    async fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        match self.inner.read_exact(buf).await {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(Error::LinkClosed),
            Err(e) => Err(e.into()),
        }
    }
}

/// Writes cells to a byte stream.
pub struct CellWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> CellWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub async fn write_cell(&mut self, cell: &Cell) -> Result<()> {
        self.inner.write_all(&cell.to_bytes()).await?;
        self.inner.flush().await?;
        Ok(())
    }

    pub async fn write_versions(&mut self, versions: &[u16]) -> Result<()> {
        self.inner.write_all(&encode_versions(versions)).await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Shuts down the underlying stream, cancelling pending reads on the
    /// peer half.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fixed_cell_round_trip() {
        let mut cell = Cell::fixed(0x8000_0001, CellCommand::Netinfo);
        cell.payload_mut()[0] = 0xAB;

        let bytes = cell.to_bytes();
        assert_eq!(bytes.len(), FIXED_CELL_LEN);
        assert_eq!(&bytes[..6], &[0x80, 0x00, 0x00, 0x01, 0x08, 0xAB]);

        let mut reader = CellReader::new(&bytes[..]);
        let parsed = reader.read_cell().await.unwrap();
        assert_eq!(parsed.circ_id, 0x8000_0001);
        assert_eq!(parsed.command, CellCommand::Netinfo);
        assert_eq!(parsed.payload()[0], 0xAB);
        assert_eq!(parsed, cell);
    }

    #[tokio::test]
    async fn variable_cell_round_trip() {
        let cell = Cell::variable(0x8000_0002, CellCommand::Certs, vec![1, 2, 3, 4, 5]);
        let bytes = cell.to_bytes();
        assert_eq!(bytes.len(), 5 + 2 + 5);

        let mut reader = CellReader::new(&bytes[..]);
        let parsed = reader.read_cell().await.unwrap();
        assert_eq!(parsed, cell);
    }

    #[test]
    fn versions_cell_shape() {
        // 2-byte circ id, command 7, 2-byte length, two u16 versions.
        let bytes = encode_versions(&[4, 5]);
        assert_eq!(bytes, vec![0x00, 0x00, 0x07, 0x00, 0x04, 0x00, 0x04, 0x00, 0x05]);
    }

    #[tokio::test]
    async fn versions_parse() {
        let bytes = encode_versions(&[3, 4, 5]);
        let mut reader = CellReader::new(&bytes[..]);
        let versions = reader.read_versions().await.unwrap();
        assert_eq!(versions, vec![3, 4, 5]);
    }

    #[tokio::test]
    async fn oversized_variable_cell_rejected() {
        let mut bytes = vec![0, 0, 0, 1, CellCommand::Vpadding as u8];
        bytes.extend_from_slice(&20_000u16.to_be_bytes());
        let mut reader = CellReader::new(&bytes[..]);
        match reader.read_cell().await {
            Err(Error::MalformedCell(CellError::Oversized(n))) => assert_eq!(n, 20_000),
            other => panic!("expected Oversized, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_command_rejected() {
        let bytes = [0, 0, 0, 1, 42u8];
        let mut reader = CellReader::new(&bytes[..]);
        assert!(matches!(
            reader.read_cell().await,
            Err(Error::MalformedCell(CellError::UnknownCommand(42)))
        ));
    }

    #[tokio::test]
    async fn truncated_stream_is_link_closed() {
        let bytes = [0u8, 0, 0, 1, 3, 9, 9]; // fixed cell header + 2 bytes
        let mut reader = CellReader::new(&bytes[..]);
        assert!(matches!(reader.read_cell().await, Err(Error::LinkClosed)));
    }
}
