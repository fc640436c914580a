/*! Host-side datalink for talking to a peripheral microcontroller.

The peripheral sits on the far end of a full-duplex byte channel,
usually SPI. It can never speak unsolicited: every byte it sends is
clocked out by a byte the host sends. This crate provides the framing
that makes the exchange look like passing [`Packet`]s back and forth,
plus the plumbing to keep the channel busy.

# Architecture overview

A transaction flows through three layers:

```text
      [ caller ]
          ↓ packets
   [ SpiCodec::serialise ]
          ↓ fixed-size frames (header + payload + CRC8)
   [ Transport::transfer, one full-duplex exchange per frame ]
          ↓ received frames
   [ SpiCodec::deserialise ]
          ↓ packets
      [ caller ]
```

[`spi::SpiLink`] bundles the three into one [`Transactor`]. On top of
that sit two optional layers:

* [`pump::Pump`] runs transactions on a fixed period so the peripheral
  can drain its outbound queue even when the host has nothing to say.
* [`rpc`] relays [`Transactor::transact`] calls over TCP, so a machine
  without the SPI wiring can drive the peripheral remotely.

[`net::NetLink`] is an alternative transactor speaking a simple
length-prefixed stream format, for peripheral simulators.

# Example

```no_run
use spilink::{Packet, Transactor};
use spilink::spi::SpiLink;

let mut link = SpiLink::open("/dev/spidev0.0")?;
let mut rx = Vec::new();
link.transact(&[Packet::new(1, [0x01])], &mut rx)?;
for pkt in &rx {
    println!("endpoint {}: {:02x?}", pkt.endpoint, pkt.data);
}
# Ok::<(), spilink::Error>(())
```
*/
use serde::{Deserialize, Serialize};

pub mod codec;
pub mod crc;
pub mod frame;
pub mod net;
pub mod pump;
pub mod rpc;
pub mod spi;

/// Datalink error.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Received frame shorter than the fixed frame size.
    #[error("short data: have {have} bytes, need {need}")]
    ShortData {
        /// Bytes actually received.
        have: usize,
        /// The fixed frame size for this link.
        need: usize,
    },

    /// CRC8 over a received frame did not come out to zero.
    #[error("CRC error in received frame")]
    Crc,

    /// A continuation frame's id did not follow the previous frame's.
    #[error("invalid frame id: expected {expected}, got {got}")]
    BadId {
        /// Id the reassembly context called for.
        expected: u8,
        /// Id carried by the frame.
        got: u8,
    },

    /// A continuation frame addressed a different endpoint.
    #[error("invalid endpoint: expected {expected}, got {got}")]
    BadEndpoint {
        /// Endpoint of the packet being reassembled.
        expected: u8,
        /// Endpoint carried by the frame.
        got: u8,
    },

    /// A continuation frame's part counter did not count down.
    #[error("invalid nparts: expected {expected}, got {got}")]
    BadNparts {
        /// One less than the previous frame's counter.
        expected: u8,
        /// Counter carried by the frame.
        got: u8,
    },

    /// The underlying byte channel failed.
    #[error("transport: {0}")]
    Transport(#[from] std::io::Error),

    /// RPC request or response could not be encoded or decoded.
    #[error("rpc wire: {0}")]
    Wire(#[from] serde_json::Error),

    /// The remote end of an RPC link reported a failure.
    #[error("rpc: {0}")]
    Rpc(String),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// A logical, endpoint-addressed message exchanged with the peripheral.
///
/// One packet may span several frames on the wire. Payloads reassembled
/// from the wire keep the zero padding of the final frame; callers that
/// need exact lengths encode them in-band.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Packet {
    /// Address of the peripheral subsystem this packet is for.
    pub endpoint: u8,
    /// Payload bytes. May be empty.
    pub data: Vec<u8>,
}

impl Packet {
    /// Create a packet for `endpoint` carrying `data`.
    pub fn new(endpoint: u8, data: impl Into<Vec<u8>>) -> Self {
        Self {
            endpoint,
            data: data.into(),
        }
    }

    /// The null packet: endpoint 0, no payload.
    ///
    /// Clocks the bus without addressing anything, giving the
    /// peripheral a slot to send on. The pump pads its batches with
    /// these.
    #[must_use]
    pub fn null() -> Self {
        Self::default()
    }
}

/// Anything that can exchange a batch of packets with the peripheral.
///
/// Implemented by [`spi::SpiLink`] for the real bus, [`rpc::RpcClient`]
/// for a remote bus, and [`net::NetLink`] for simulators.
pub trait Transactor {
    /// Send `tx` and append whatever came back to `rx`.
    ///
    /// Packets are appended as they are decoded, so anything that
    /// completed before a mid-batch error is kept. Implementations are
    /// not safe for concurrent callers; serialise through a
    /// [`pump::Pump`] or a lock.
    fn transact(&mut self, tx: &[Packet], rx: &mut Vec<Packet>) -> Result<()>;
}

/// A full-duplex byte exchange: every byte written clocks one byte read.
pub trait Transport {
    /// Transfer `tx` out while reading back the same number of bytes.
    fn transfer(&mut self, tx: &[u8]) -> Result<Vec<u8>>;
}
