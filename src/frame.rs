//! The fixed-size frame carried by each SPI transfer.
//!
//! Matching the peripheral firmware's layout:
//!
//! ```text
//! struct spi_pl_packet {
//!     uint8_t id;       // monotonic, 1..=0x7f, wraps to 0
//!     uint8_t endpoint;
//!     uint8_t nparts;   // frames still to come after this one
//!     uint8_t flags;    // reserved, 0
//!     uint8_t data[SPI_PACKET_DATA_LEN];
//!     uint8_t crc;      // CRC8 over everything above
//! };
//! ```
//!
//! The payload length is fixed per link (`datalen`), so every frame is
//! exactly `4 + datalen + 1` bytes on the wire.

use crate::crc::Crc8;
use crate::{Error, Result};

/// Header bytes before the payload: id, endpoint, nparts, flags.
pub const HDR_LEN: usize = 4;

/// Size on the wire of a frame carrying `datalen` payload bytes.
#[must_use]
pub fn wire_len(datalen: usize) -> usize {
    HDR_LEN + datalen + 1
}

/// The decoded fields of a frame header. Flags are reserved and not
/// carried here.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Header {
    /// Frame id.
    pub id: u8,
    /// Endpoint of the logical packet this frame belongs to.
    pub endpoint: u8,
    /// Number of frames still to come after this one.
    pub nparts: u8,
}

/// Build one frame: header, zero-padded payload, trailing CRC.
///
/// `payload` must fit in `datalen` bytes; splitting longer packets is
/// the serialiser's job.
#[must_use]
pub fn make(crc: &Crc8, hdr: Header, payload: &[u8], datalen: usize) -> Vec<u8> {
    assert!(payload.len() <= datalen, "payload longer than one frame");
    let mut d = vec![0u8; wire_len(datalen)];
    d[0] = hdr.id;
    d[1] = hdr.endpoint;
    d[2] = hdr.nparts;
    d[3] = 0;
    d[HDR_LEN..HDR_LEN + payload.len()].copy_from_slice(payload);
    let end = d.len() - 1;
    d[end] = crc.checksum(&d[..end]);
    d
}

/// Split a received frame into header and payload.
///
/// Rejects input shorter than the frame size, and any frame whose CRC8
/// residual is non-zero (a valid frame checksums to zero, trailing CRC
/// byte included). Bytes past the frame size are ignored.
pub fn parse<'a>(crc: &Crc8, raw: &'a [u8], datalen: usize) -> Result<(Header, &'a [u8])> {
    let need = wire_len(datalen);
    if raw.len() < need {
        return Err(Error::ShortData {
            have: raw.len(),
            need,
        });
    }
    if crc.checksum(&raw[..need]) != 0 {
        return Err(Error::Crc);
    }
    let hdr = Header {
        id: raw[0],
        endpoint: raw[1],
        nparts: raw[2],
    };
    Ok((hdr, &raw[HDR_LEN..need - 1]))
}
