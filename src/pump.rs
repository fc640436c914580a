/*! Periodic link driver.

The peripheral can only transmit when the host clocks the bus, so
somebody has to keep transactions flowing even when the application has
nothing to say. The pump owns a link on a background thread and runs a
transaction every tick: it drains the send queue into a batch, pads the
batch with null packets so the peripheral always gets slots to reply in,
and hands everything received to the caller over a channel.

The thread multiplexes over one point: sleeping until the next tick
doubles as watching the stop channel. A transaction that overruns the
period costs ticks rather than queueing them; the next transaction
starts a fresh period.

```no_run
use std::time::Duration;
use spilink::Packet;
use spilink::pump::Pump;
use spilink::spi::SpiLink;

let link = SpiLink::open("/dev/spidev0.0")?;
let (pump, rx) = Pump::spawn(link, Duration::from_millis(100));
pump.send(Packet::new(1, [0x01])).unwrap();
for pkt in rx.iter() {
    println!("endpoint {}: {:02x?}", pkt.endpoint, pkt.data);
}
pump.stop();
# Ok::<(), spilink::Error>(())
```
*/
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SendError, Sender};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::{Packet, Transactor};

/// Batches are padded with null packets up to this size, so the
/// peripheral can flush its outbound queue even on an idle link.
pub const MIN_BATCH: usize = 4;

/// Tick period that suits most links.
pub const DEFAULT_PERIOD: Duration = Duration::from_millis(100);

/// Handle to a pump thread.
///
/// Dropping the handle also shuts the pump down: the thread notices the
/// disconnected stop channel at its next tick.
pub struct Pump {
    tx: Sender<Packet>,
    stop: Sender<()>,
    handle: thread::JoinHandle<()>,
}

impl Pump {
    /// Start a pump driving `link` every `period`.
    ///
    /// Returns the handle and the channel delivering received packets.
    /// The link moves onto the pump thread; from here on the pump's
    /// channels are the only way to it.
    pub fn spawn<L>(link: L, period: Duration) -> (Self, Receiver<Packet>)
    where
        L: Transactor + Send + 'static,
    {
        let (tx, pending) = mpsc::channel();
        let (stop, stop_rx) = mpsc::channel();
        let (deliver, rx) = mpsc::channel();
        let handle = thread::spawn(move || run(link, period, &pending, &deliver, &stop_rx));
        (Self { tx, stop, handle }, rx)
    }

    /// Queue a packet for the next batch.
    ///
    /// Fails only once the pump has stopped.
    pub fn send(&self, pkt: Packet) -> std::result::Result<(), SendError<Packet>> {
        self.tx.send(pkt)
    }

    /// A clonable handle onto the send queue, for hanging onto after
    /// the pump itself moves elsewhere. Any number of producers may
    /// send; the pump preserves their arrival order within a batch.
    #[must_use]
    pub fn sender(&self) -> Sender<Packet> {
        self.tx.clone()
    }

    /// Stop the pump and wait for the thread to finish.
    pub fn stop(self) {
        let _ = self.stop.send(());
        let _ = self.handle.join();
    }
}

fn run<L: Transactor>(
    mut link: L,
    period: Duration,
    pending: &Receiver<Packet>,
    deliver: &Sender<Packet>,
    stop: &Receiver<()>,
) {
    let mut deadline = Instant::now() + period;
    loop {
        // Sleep until the tick, watching for shutdown. A dropped stop
        // sender means the handle is gone, which also ends the pump.
        match stop.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
            Err(RecvTimeoutError::Timeout) => {}
        }
        // Missed ticks are coalesced, not queued.
        deadline += period;
        let now = Instant::now();
        if deadline < now {
            deadline = now + period;
        }

        let mut batch: Vec<Packet> = pending.try_iter().collect();
        while batch.len() < MIN_BATCH {
            batch.push(Packet::null());
        }

        let mut got = Vec::new();
        if let Err(e) = link.transact(&batch, &mut got) {
            // Drop the batch and carry on; the next tick gets a fresh
            // start. Packets decoded before the error still count.
            warn!("pump: transact failed: {e}");
        }
        for pkt in got {
            if deliver.send(pkt).is_err() {
                debug!("pump: receiver gone, discarding inbound packets");
                break;
            }
        }
    }
}
