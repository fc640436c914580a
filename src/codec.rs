/*! Serialising packets into SPI frames, and reassembling the replies.

The codec is the stateful heart of the link. Outbound, it slices each
[`Packet`] into as many fixed-size frames as the payload needs, stamping
every frame with the next id in sequence. Inbound, it validates each
frame and stitches continuation frames back into packets, carrying the
reassembly context across calls so a packet may straddle two receive
windows.

One codec per link. Both directions mutate codec state, so the codec has
exactly one owner.
*/
use log::{debug, info, trace};

use crate::crc::Crc8;
use crate::frame::{self, Header};
use crate::{Error, Packet, Result};

/// Payload bytes per frame on production links.
///
/// The test suites use 4 to keep vectors readable; the peripheral
/// firmware is built with 32.
pub const DEFAULT_DATALEN: usize = 32;

/// Highest frame id. The next id after this wraps to 0.
const MAX_ID: u8 = 0x7f;

/// Successor of a frame id, wrapping after [`MAX_ID`].
fn next_id(id: u8) -> u8 {
    if id >= MAX_ID { 0 } else { id + 1 }
}

/// Reassembly context, carried between frames and across
/// [`SpiCodec::deserialise`] calls.
#[derive(Debug, Default)]
enum RxState {
    /// Expecting the first frame of a new packet.
    #[default]
    Idle,
    /// Mid-packet, collecting continuation frames.
    Assembling {
        /// Id of the last frame accepted.
        id: u8,
        /// Endpoint of the packet under reassembly.
        endpoint: u8,
        /// Part counter of the last frame accepted; always non-zero
        /// here, a zero counter completes the packet.
        nparts: u8,
        /// Payload gathered so far.
        payload: Vec<u8>,
    },
}

/// Stateful frame codec for one SPI link.
pub struct SpiCodec {
    datalen: usize,
    /// Last id handed out; incremented before each frame, so a fresh
    /// codec emits 1 first.
    id: u8,
    crc: Crc8,
    rx: RxState,
    decoded: usize,
    errors: usize,
}

impl SpiCodec {
    /// Create a codec for frames carrying `datalen` payload bytes.
    #[must_use]
    pub fn new(datalen: usize) -> Self {
        Self {
            datalen,
            id: 0,
            crc: Crc8::default(),
            rx: RxState::Idle,
            decoded: 0,
            errors: 0,
        }
    }

    /// Size on the wire of every frame this codec produces or accepts.
    #[must_use]
    pub fn wire_len(&self) -> usize {
        frame::wire_len(self.datalen)
    }

    /// Drop any half-assembled inbound packet and return to idle.
    ///
    /// There is no reassembly timeout: if the peripheral never sends
    /// the final frame of a packet, the codec stays mid-assembly until
    /// a later frame fails validation. This is the manual way out.
    pub fn reset(&mut self) {
        self.rx = RxState::Idle;
    }

    /// Turn one packet into frames, appending them to `out`.
    fn serialise_one(&mut self, pkt: &Packet, out: &mut Vec<Vec<u8>>) {
        // An empty packet still occupies one frame on the wire: a
        // single zero payload byte, padded out. The pump's null/poll
        // packets depend on this.
        let data: &[u8] = if pkt.data.is_empty() { &[0] } else { &pkt.data };

        let total = data.len().div_ceil(self.datalen);
        for (i, chunk) in data.chunks(self.datalen).enumerate() {
            self.id = next_id(self.id);
            let hdr = Header {
                id: self.id,
                endpoint: pkt.endpoint,
                // Frames still to come after this one; 0 on the last.
                nparts: (total - 1 - i) as u8,
            };
            out.push(frame::make(&self.crc, hdr, chunk, self.datalen));
        }
    }

    /// Serialise a batch of packets into wire frames, in order.
    ///
    /// Every packet produces at least one frame; ids run monotonically
    /// across the whole batch and across calls.
    pub fn serialise(&mut self, pkts: &[Packet]) -> Vec<Vec<u8>> {
        // One frame per packet is right unless a payload spans frames.
        let mut out = Vec::with_capacity(pkts.len());
        for pkt in pkts {
            self.serialise_one(pkt, &mut out);
        }
        out
    }

    /// Reassemble received frames, appending completed packets to `out`.
    ///
    /// Packets are appended as their final frame arrives, so anything
    /// completed before a bad frame is kept alongside the returned
    /// error. The reassembly context survives between calls while a
    /// packet is still in flight, and is cleared by any error.
    ///
    /// A null frame (endpoint 0) arriving mid-reassembly consumes its
    /// id but is otherwise ignored, letting the peripheral acknowledge
    /// without disturbing the packet in flight.
    pub fn deserialise(&mut self, frames: &[Vec<u8>], out: &mut Vec<Packet>) -> Result<()> {
        for (i, raw) in frames.iter().enumerate() {
            if let Err(e) = self.push_frame(raw, out) {
                debug!("frame {i}: {e}");
                self.errors += 1;
                self.rx = RxState::Idle;
                return Err(e);
            }
        }
        Ok(())
    }

    /// Feed one frame through the reassembly state machine.
    fn push_frame(&mut self, raw: &[u8], out: &mut Vec<Packet>) -> Result<()> {
        let (hdr, body) = frame::parse(&self.crc, raw, self.datalen)?;

        let mut payload = match std::mem::take(&mut self.rx) {
            RxState::Idle => Vec::with_capacity(usize::from(hdr.nparts) * self.datalen),
            RxState::Assembling {
                id,
                endpoint,
                nparts,
                payload,
            } => {
                if hdr.id != next_id(id) {
                    return Err(Error::BadId {
                        expected: next_id(id),
                        got: hdr.id,
                    });
                }
                if hdr.endpoint == 0 {
                    trace!("null frame {} mid-reassembly, skipping", hdr.id);
                    self.rx = RxState::Assembling {
                        id: hdr.id,
                        endpoint,
                        nparts,
                        payload,
                    };
                    return Ok(());
                }
                if hdr.endpoint != endpoint {
                    return Err(Error::BadEndpoint {
                        expected: endpoint,
                        got: hdr.endpoint,
                    });
                }
                if hdr.nparts != nparts - 1 {
                    return Err(Error::BadNparts {
                        expected: nparts - 1,
                        got: hdr.nparts,
                    });
                }
                payload
            }
        };

        payload.extend_from_slice(body);
        if hdr.nparts == 0 {
            self.decoded += 1;
            out.push(Packet {
                endpoint: hdr.endpoint,
                data: payload,
            });
            // rx was taken above, so the context is already clear.
        } else {
            self.rx = RxState::Assembling {
                id: hdr.id,
                endpoint: hdr.endpoint,
                nparts: hdr.nparts,
                payload,
            };
        }
        Ok(())
    }
}

impl Drop for SpiCodec {
    fn drop(&mut self) {
        info!(
            "SPI codec: decoded {} packets, {} bad frames",
            self.decoded, self.errors
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::make;

    const DATALEN: usize = 4;

    fn codec() -> SpiCodec {
        SpiCodec::new(DATALEN)
    }

    /// Hand-build a frame, CRC included.
    fn mk(id: u8, endpoint: u8, nparts: u8, payload: &[u8]) -> Vec<u8> {
        make(
            &Crc8::default(),
            Header {
                id,
                endpoint,
                nparts,
            },
            payload,
            DATALEN,
        )
    }

    #[test]
    fn serialise_single_frame() {
        let mut c = codec();
        let frames = c.serialise(&[Packet::new(0x37, [0x0a, 0x0b, 0x0c, 0x0d])]);
        assert_eq!(
            frames,
            vec![vec![0x01, 0x37, 0x00, 0x00, 0x0a, 0x0b, 0x0c, 0x0d, 0xdd]]
        );
    }

    #[test]
    fn serialise_advances_id() {
        let mut c = codec();
        let pkt = Packet::new(0x37, [0x0a, 0x0b, 0x0c, 0x0d]);
        assert_eq!(c.serialise(&[pkt.clone()])[0][0], 0x01);
        assert_eq!(c.serialise(&[pkt.clone()])[0][0], 0x02);
        assert_eq!(c.serialise(&[pkt])[0][0], 0x03);
    }

    #[test]
    fn serialise_pads_short_payload() {
        let mut c = codec();
        let frames = c.serialise(&[Packet::new(0x37, [0x0a])]);
        assert_eq!(frames, vec![mk(0x01, 0x37, 0x00, &[0x0a])]);
    }

    #[test]
    fn serialise_empty_payload() {
        // An empty packet goes out as one frame with a single zero
        // byte of payload.
        let mut c = codec();
        let frames = c.serialise(&[Packet::null()]);
        assert_eq!(
            frames,
            vec![vec![0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x13]]
        );
        let frames = c.serialise(&[Packet::null()]);
        assert_eq!(
            frames,
            vec![vec![0x02, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x26]]
        );
    }

    #[test]
    fn serialise_three_frame_fragmentation() {
        let mut c = codec();
        let data: Vec<u8> = (0x0a..=0x15).collect();
        let frames = c.serialise(&[Packet::new(0x37, data)]);
        assert_eq!(
            frames,
            vec![
                vec![0x01, 0x37, 0x02, 0x00, 0x0a, 0x0b, 0x0c, 0x0d, 0x8f],
                vec![0x02, 0x37, 0x01, 0x00, 0x0e, 0x0f, 0x10, 0x11, 0xcd],
                vec![0x03, 0x37, 0x00, 0x00, 0x12, 0x13, 0x14, 0x15, 0x68],
            ]
        );
    }

    #[test]
    fn serialise_multi_packet() {
        let mut c = codec();
        let frames = c.serialise(&[
            Packet::new(0x37, (0x0a..=0x13).collect::<Vec<u8>>()),
            Packet::new(0x42, [0x00, 0x01, 0x02, 0x03]),
        ]);
        assert_eq!(
            frames,
            vec![
                mk(0x01, 0x37, 0x02, &[0x0a, 0x0b, 0x0c, 0x0d]),
                mk(0x02, 0x37, 0x01, &[0x0e, 0x0f, 0x10, 0x11]),
                mk(0x03, 0x37, 0x00, &[0x12, 0x13]),
                mk(0x04, 0x42, 0x00, &[0x00, 0x01, 0x02, 0x03]),
            ]
        );
    }

    #[test]
    fn serialise_batch_frame_count() {
        let mut c = codec();
        let pkts = vec![
            Packet::null(),
            Packet::new(1, vec![0; 1]),
            Packet::new(2, vec![0; 4]),
            Packet::new(3, vec![0; 5]),
            Packet::new(4, vec![0; 12]),
            Packet::new(5, vec![0; 13]),
        ];
        let want: usize = pkts
            .iter()
            .map(|p| std::cmp::max(1, p.data.len().div_ceil(DATALEN)))
            .sum();
        assert_eq!(c.serialise(&pkts).len(), want);
    }

    #[test]
    fn serialise_id_wraps() {
        let mut c = codec();
        let frames = c.serialise(&vec![Packet::null(); 130]);
        let ids: Vec<u8> = frames.iter().map(|f| f[0]).collect();
        let want: Vec<u8> = (1..=0x7f).chain(0..=2).collect();
        assert_eq!(ids, want);
    }

    #[test]
    fn frames_have_zero_residual() {
        let mut c = codec();
        let crc = Crc8::default();
        let frames = c.serialise(&[
            Packet::null(),
            Packet::new(0x37, (0..23).collect::<Vec<u8>>()),
        ]);
        for f in &frames {
            assert_eq!(crc.checksum(f), 0, "frame {f:02x?}");
        }
    }

    #[test]
    fn round_trip_single_frame() -> Result<()> {
        let mut c = codec();
        let pkt = Packet::new(0x37, [0x0a, 0x0b, 0x0c, 0x0d]);
        let frames = c.serialise(&[pkt.clone()]);
        let mut out = Vec::new();
        c.deserialise(&frames, &mut out)?;
        assert_eq!(out, vec![pkt]);
        Ok(())
    }

    #[test]
    fn round_trip_three_frames() -> Result<()> {
        let mut c = codec();
        let pkt = Packet::new(0x37, (0x0a..=0x15).collect::<Vec<u8>>());
        let frames = c.serialise(&[pkt.clone()]);
        let mut out = Vec::new();
        c.deserialise(&frames, &mut out)?;
        assert_eq!(out, vec![pkt]);
        Ok(())
    }

    #[test]
    fn round_trip_retains_padding() -> Result<()> {
        // The wire has no length field, so a reassembled payload keeps
        // the final frame's zero padding.
        let mut c = codec();
        let frames = c.serialise(&[Packet::new(0x37, [0x0a, 0x0b])]);
        let mut out = Vec::new();
        c.deserialise(&frames, &mut out)?;
        assert_eq!(out, vec![Packet::new(0x37, [0x0a, 0x0b, 0x00, 0x00])]);
        Ok(())
    }

    #[test]
    fn deserialise_crc_error() {
        let mut c = codec();
        let mut frames = c.serialise(&[Packet::new(0x37, [0x0a, 0x0b, 0x0c, 0x0d])]);
        frames[0][5] = frames[0][5].wrapping_add(1);
        let mut out = Vec::new();
        assert!(matches!(
            c.deserialise(&frames, &mut out),
            Err(Error::Crc)
        ));
        assert!(out.is_empty());
    }

    #[test]
    fn deserialise_short_frame() {
        let mut c = codec();
        let mut out = Vec::new();
        let err = c.deserialise(&[vec![0x01, 0x37]], &mut out);
        assert!(matches!(err, Err(Error::ShortData { have: 2, need: 9 })));
        assert!(out.is_empty());
    }

    #[test]
    fn split_delivery_carries_context() -> Result<()> {
        let mut c = codec();
        let pkt = Packet::new(0x37, (0x0a..=0x15).collect::<Vec<u8>>());
        let frames = c.serialise(&[pkt.clone()]);

        let mut out = Vec::new();
        c.deserialise(&frames[..1], &mut out)?;
        assert!(out.is_empty());
        c.deserialise(&frames[1..], &mut out)?;
        assert_eq!(out, vec![pkt]);
        Ok(())
    }

    #[test]
    fn bad_id_mid_reassembly() {
        let mut c = codec();
        let frames = vec![
            mk(0x01, 0x37, 0x02, &[0x0a, 0x0b, 0x0c, 0x0d]),
            mk(0x08, 0x37, 0x01, &[0x0e, 0x0f, 0x10, 0x11]),
            mk(0x03, 0x37, 0x00, &[0x12, 0x13, 0x14, 0x15]),
        ];
        let mut out = Vec::new();
        assert!(matches!(
            c.deserialise(&frames, &mut out),
            Err(Error::BadId {
                expected: 0x02,
                got: 0x08
            })
        ));
        assert!(out.is_empty());
    }

    #[test]
    fn bad_endpoint_mid_reassembly() {
        let mut c = codec();
        let frames = vec![
            mk(0x01, 0x37, 0x01, &[0x0a, 0x0b, 0x0c, 0x0d]),
            mk(0x02, 0x42, 0x00, &[0x0e, 0x0f, 0x10, 0x11]),
        ];
        let mut out = Vec::new();
        assert!(matches!(
            c.deserialise(&frames, &mut out),
            Err(Error::BadEndpoint {
                expected: 0x37,
                got: 0x42
            })
        ));
    }

    #[test]
    fn bad_nparts_mid_reassembly() {
        let mut c = codec();
        let frames = vec![
            mk(0x01, 0x37, 0x02, &[0x0a, 0x0b, 0x0c, 0x0d]),
            mk(0x02, 0x37, 0x02, &[0x0e, 0x0f, 0x10, 0x11]),
        ];
        let mut out = Vec::new();
        assert!(matches!(
            c.deserialise(&frames, &mut out),
            Err(Error::BadNparts {
                expected: 0x01,
                got: 0x02
            })
        ));
    }

    #[test]
    fn null_frame_skipped_mid_reassembly() -> Result<()> {
        // The peripheral may interleave a null frame into a multi-frame
        // packet. It consumes an id but must not disturb reassembly.
        let mut c = codec();
        let frames = vec![
            mk(0x01, 0x37, 0x02, &[0x0a, 0x0b, 0x0c, 0x0d]),
            mk(0x02, 0x00, 0x00, &[]),
            mk(0x03, 0x37, 0x01, &[0x0e, 0x0f, 0x10, 0x11]),
            mk(0x04, 0x37, 0x00, &[0x12, 0x13, 0x14, 0x15]),
        ];
        let mut out = Vec::new();
        c.deserialise(&frames, &mut out)?;
        assert_eq!(out, vec![Packet::new(0x37, (0x0a..=0x15).collect::<Vec<u8>>())]);
        Ok(())
    }

    #[test]
    fn null_frame_still_needs_sequential_id() {
        // The id check comes before the null skip.
        let mut c = codec();
        let frames = vec![
            mk(0x01, 0x37, 0x01, &[0x0a, 0x0b, 0x0c, 0x0d]),
            mk(0x09, 0x00, 0x00, &[]),
        ];
        let mut out = Vec::new();
        assert!(matches!(
            c.deserialise(&frames, &mut out),
            Err(Error::BadId {
                expected: 0x02,
                got: 0x09
            })
        ));
    }

    #[test]
    fn null_frame_while_idle_is_delivered() -> Result<()> {
        // Only mid-reassembly nulls are swallowed; an idle-state null
        // frame is an ordinary single-frame packet.
        let mut c = codec();
        let mut out = Vec::new();
        c.deserialise(&[mk(0x01, 0x00, 0x00, &[])], &mut out)?;
        assert_eq!(out, vec![Packet::new(0, [0, 0, 0, 0])]);
        Ok(())
    }

    #[test]
    fn error_keeps_earlier_packets() {
        let mut c = codec();
        let mut frames = c.serialise(&[
            Packet::new(0x11, [1, 2, 3, 4]),
            Packet::new(0x22, [5, 6, 7, 8]),
        ]);
        frames[1][0] ^= 0x40;
        let mut out = Vec::new();
        assert!(matches!(
            c.deserialise(&frames, &mut out),
            Err(Error::Crc)
        ));
        assert_eq!(out, vec![Packet::new(0x11, [1, 2, 3, 4])]);
    }

    #[test]
    fn error_clears_context() -> Result<()> {
        let mut c = codec();
        let frames = vec![
            mk(0x01, 0x37, 0x02, &[0x0a, 0x0b, 0x0c, 0x0d]),
            mk(0x02, 0x37, 0x00, &[0x0e, 0x0f, 0x10, 0x11]),
        ];
        let mut out = Vec::new();
        assert!(matches!(
            c.deserialise(&frames, &mut out),
            Err(Error::BadNparts { .. })
        ));
        // A fresh first frame must now be accepted as such, whatever
        // its id.
        c.deserialise(&[mk(0x30, 0x42, 0x00, &[1, 2, 3, 4])], &mut out)?;
        assert_eq!(out, vec![Packet::new(0x42, [1, 2, 3, 4])]);
        Ok(())
    }

    #[test]
    fn reset_drops_partial_packet() -> Result<()> {
        let mut c = codec();
        let mut out = Vec::new();
        c.deserialise(&[mk(0x01, 0x37, 0x02, &[0x0a, 0x0b, 0x0c, 0x0d])], &mut out)?;
        c.reset();
        c.deserialise(&[mk(0x55, 0x42, 0x00, &[1, 2, 3, 4])], &mut out)?;
        assert_eq!(out, vec![Packet::new(0x42, [1, 2, 3, 4])]);
        Ok(())
    }

    #[test]
    fn chunked_delivery_equals_whole() -> Result<()> {
        use rand::Rng;
        let pkts = vec![
            Packet::new(0x10, (0..12).collect::<Vec<u8>>()),
            Packet::null(),
            Packet::new(0x20, (0..8).collect::<Vec<u8>>()),
            Packet::new(0x30, (0..4).collect::<Vec<u8>>()),
        ];

        let mut c = codec();
        let frames = c.serialise(&pkts);
        let mut whole = Vec::new();
        let mut ref_codec = codec();
        ref_codec.deserialise(&frames, &mut whole)?;

        let mut rng = rand::rng();
        for _ in 0..50 {
            let mut chunked = Vec::new();
            let mut d = codec();
            let mut rest = &frames[..];
            while !rest.is_empty() {
                let n = rng.random_range(1..=rest.len());
                d.deserialise(&rest[..n], &mut chunked)?;
                rest = &rest[n..];
            }
            assert_eq!(chunked, whole);
        }
        Ok(())
    }
}
