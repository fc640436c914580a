/*! Stream transactor, for simulators and tunnels.

Speaks the [`Transactor`] contract over a plain byte stream instead of
SPI framing. Useful against a peripheral simulator running as a normal
process, where CRCs and fixed frame sizes would just get in the way.

Wire format, both directions, little endian:

```text
u32 endpoint
u32 length
u8  data[length]
```

A transaction writes every outbound packet, then drains whatever the far
end has already queued. A short read timeout, not end-of-stream, ends
the drain; bytes of a packet that has only partially arrived are carried
over to the next call.
*/
use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use log::trace;

use crate::{Packet, Result, Transactor};

const PKT_HDR_LEN: usize = 8;

/// How long a drain waits on a silent socket before giving up.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(1);

/// A [`Transactor`] over a TCP stream.
pub struct NetLink {
    stream: TcpStream,
    /// Inbound bytes not yet forming a whole packet.
    buf: Vec<u8>,
}

impl NetLink {
    /// Connect to a peripheral simulator at `addr`.
    pub fn connect<A: ToSocketAddrs>(addr: A) -> Result<Self> {
        Self::new(TcpStream::connect(addr)?)
    }

    /// Wrap an already-connected stream.
    pub fn new(stream: TcpStream) -> Result<Self> {
        stream.set_read_timeout(Some(DRAIN_TIMEOUT))?;
        Ok(Self {
            stream,
            buf: Vec::new(),
        })
    }

    /// Pull everything currently readable into the carry buffer.
    fn drain(&mut self) -> Result<()> {
        let mut tmp = [0u8; 4096];
        loop {
            match self.stream.read(&mut tmp) {
                Ok(0) => return Ok(()), // peer closed; parse what we have
                Ok(n) => self.buf.extend_from_slice(&tmp[..n]),
                Err(e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::TimedOut =>
                {
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Parse complete packets out of the carry buffer.
    fn parse(&mut self, rx: &mut Vec<Packet>) {
        let mut pos = 0;
        while self.buf.len() - pos >= PKT_HDR_LEN {
            let b = &self.buf[pos..];
            let endpoint = u32::from_le_bytes([b[0], b[1], b[2], b[3]]);
            let len = u32::from_le_bytes([b[4], b[5], b[6], b[7]]) as usize;
            if self.buf.len() - pos - PKT_HDR_LEN < len {
                break;
            }
            let start = pos + PKT_HDR_LEN;
            rx.push(Packet {
                endpoint: endpoint as u8,
                data: self.buf[start..start + len].to_vec(),
            });
            pos = start + len;
        }
        if pos > 0 {
            trace!("netlink: parsed up to byte {pos} of {}", self.buf.len());
            self.buf.drain(..pos);
        }
    }
}

impl Transactor for NetLink {
    fn transact(&mut self, tx: &[Packet], rx: &mut Vec<Packet>) -> Result<()> {
        for p in tx {
            let mut wire = Vec::with_capacity(PKT_HDR_LEN + p.data.len());
            wire.extend_from_slice(&u32::from(p.endpoint).to_le_bytes());
            wire.extend_from_slice(&(p.data.len() as u32).to_le_bytes());
            wire.extend_from_slice(&p.data);
            self.stream.write_all(&wire)?;
        }

        self.drain()?;
        self.parse(rx);
        Ok(())
    }
}
