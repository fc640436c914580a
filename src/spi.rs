/*! The SPI transactor.

Opens a spidev character device and exchanges fixed-size frames with the
peripheral. Each frame goes out as its own full-duplex transfer: the
peripheral needs the inter-frame gap to shuffle its DMA buffers, so
batching a whole transaction into one transfer would outrun it.
*/
use std::path::Path;

use spidev::{SpiModeFlags, Spidev, SpidevOptions, SpidevTransfer};

use crate::codec::{DEFAULT_DATALEN, SpiCodec};
use crate::{Packet, Result, Transactor, Transport};

/// Bit rate the bus is clocked at.
pub const SPI_SPEED_HZ: u32 = 1_000_000;

/// [`Transport`] over a `/dev/spidevX.Y` character device.
pub struct SpidevTransport {
    dev: Spidev,
}

impl SpidevTransport {
    /// Open and configure a spidev device: mode 0, 8 bits per word,
    /// [`SPI_SPEED_HZ`].
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut dev = Spidev::open(path)?;
        let options = SpidevOptions::new()
            .bits_per_word(8)
            .max_speed_hz(SPI_SPEED_HZ)
            .mode(SpiModeFlags::SPI_MODE_0)
            .build();
        dev.configure(&options)?;
        Ok(Self { dev })
    }
}

impl Transport for SpidevTransport {
    fn transfer(&mut self, tx: &[u8]) -> Result<Vec<u8>> {
        let mut rx = vec![0u8; tx.len()];
        {
            let mut transfer = SpidevTransfer::read_write(tx, &mut rx);
            self.dev.transfer(&mut transfer)?;
        }
        Ok(rx)
    }
}

/// A [`Transactor`] over a frame-at-a-time byte transport.
///
/// Owns the codec, so it owns the link's id sequence and reassembly
/// state; one `SpiLink` per bus, one owner per `SpiLink`.
pub struct SpiLink<T> {
    codec: SpiCodec,
    transport: T,
}

impl SpiLink<SpidevTransport> {
    /// Open a link on a spidev device with the production frame size.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(Self::new(SpidevTransport::open(path)?, DEFAULT_DATALEN))
    }
}

impl<T: Transport> SpiLink<T> {
    /// Create a link over `transport` with `datalen` payload bytes per
    /// frame. Both ends must agree on `datalen`.
    pub fn new(transport: T, datalen: usize) -> Self {
        Self {
            codec: SpiCodec::new(datalen),
            transport,
        }
    }

    /// Drop any half-reassembled inbound packet.
    pub fn reset(&mut self) {
        self.codec.reset();
    }
}

impl<T: Transport> Transactor for SpiLink<T> {
    fn transact(&mut self, tx: &[Packet], rx: &mut Vec<Packet>) -> Result<()> {
        let frames = self.codec.serialise(tx);
        let mut replies = Vec::with_capacity(frames.len());
        for f in &frames {
            replies.push(self.transport.transfer(f)?);
        }
        self.codec.deserialise(&replies, rx)
    }
}
