/*! One-shot transaction against the peripheral.

Sends a single packet and prints whatever comes back. The device can be
a local spidev node or a `tcp:host:port` pointing at a spibridge.

```no_run
$ ./transact --device /dev/spidev0.0 1 0a0b0c0d
$ ./transact --device tcp:bot:9000 1 0a0b0c0d
```
*/
use anyhow::{Result, anyhow};
use clap::Parser;

use spilink::rpc::RpcClient;
use spilink::spi::SpiLink;
use spilink::{Packet, Transactor};

#[derive(clap::Parser, Debug)]
#[command(version, about)]
struct Opt {
    #[arg(
        long,
        default_value = "/dev/spidev0.0",
        help = "spidev node, or tcp:host:port for a spibridge"
    )]
    device: String,

    #[arg(short = 'v', default_value = "0")]
    verbose: usize,

    #[arg(help = "Destination endpoint")]
    endpoint: u8,

    #[arg(help = "Payload as hex digits, e.g. 0a0b0c0d", default_value = "")]
    payload: String,
}

fn parse_hex(s: &str) -> Result<Vec<u8>> {
    if !s.len().is_multiple_of(2) {
        return Err(anyhow!("odd number of hex digits"));
    }
    (0..s.len())
        .step_by(2)
        .map(|i| Ok(u8::from_str_radix(&s[i..i + 2], 16)?))
        .collect()
}

fn main() -> Result<()> {
    let opt = Opt::parse();
    stderrlog::new()
        .module(module_path!())
        .module("spilink")
        .verbosity(opt.verbose)
        .timestamp(stderrlog::Timestamp::Second)
        .init()?;

    let mut link: Box<dyn Transactor> = match opt.device.strip_prefix("tcp:") {
        Some(addr) => Box::new(RpcClient::connect(addr)?),
        None => Box::new(SpiLink::open(&opt.device)?),
    };

    let pkt = Packet::new(opt.endpoint, parse_hex(&opt.payload)?);
    let mut rx = Vec::new();
    link.transact(&[pkt], &mut rx)?;
    for p in &rx {
        println!("endpoint {:#04x}: {:02x?}", p.endpoint, p.data);
    }
    Ok(())
}
