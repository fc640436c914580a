/*! Pump a link and print everything the peripheral sends.

Keeps the bus clocked with null packets so asynchronous data (telemetry,
log messages) can flow out of the peripheral, and prints each received
packet. Ctrl-C stops the pump cleanly.

```no_run
$ ./monitor --device /dev/spidev0.0
$ ./monitor --device tcp:bot:9000 --period-ms 50
```
*/
use std::time::Duration;

use anyhow::Result;
use clap::Parser;

use spilink::Packet;
use spilink::pump::Pump;
use spilink::rpc::RpcClient;
use spilink::spi::SpiLink;

#[derive(clap::Parser, Debug)]
#[command(version, about)]
struct Opt {
    #[arg(
        long,
        default_value = "/dev/spidev0.0",
        help = "spidev node, or tcp:host:port for a spibridge"
    )]
    device: String,

    #[arg(long = "period-ms", default_value = "100")]
    period_ms: u64,

    #[arg(long, help = "Hide null packets instead of printing them")]
    quiet_nulls: bool,

    #[arg(short = 'v', default_value = "0")]
    verbose: usize,
}

fn spawn_pump(opt: &Opt) -> Result<(Pump, std::sync::mpsc::Receiver<Packet>)> {
    let period = Duration::from_millis(opt.period_ms);
    Ok(match opt.device.strip_prefix("tcp:") {
        Some(addr) => Pump::spawn(RpcClient::connect(addr)?, period),
        None => Pump::spawn(SpiLink::open(&opt.device)?, period),
    })
}

fn main() -> Result<()> {
    let opt = Opt::parse();
    stderrlog::new()
        .module(module_path!())
        .module("spilink")
        .verbosity(opt.verbose)
        .timestamp(stderrlog::Timestamp::Second)
        .init()?;

    let (pump, rx) = spawn_pump(&opt)?;

    let (stop_tx, stop_rx) = std::sync::mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = stop_tx.send(());
    })?;

    loop {
        if stop_rx.try_recv().is_ok() {
            break;
        }
        match rx.recv_timeout(Duration::from_millis(100)) {
            Ok(pkt) => {
                if opt.quiet_nulls && pkt.endpoint == 0 && pkt.data.iter().all(|&b| b == 0) {
                    continue;
                }
                println!("endpoint {:#04x}: {:02x?}", pkt.endpoint, pkt.data);
            }
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {}
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }
    pump.stop();
    Ok(())
}
