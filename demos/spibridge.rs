/*! Bridge the SPI bus onto the network.

Runs next to the peripheral and serves the local SPI link over TCP, so
machines without the wiring can transact against it remotely with
`RpcClient` (or the `transact` demo's `tcp:` device syntax).

```no_run
$ ./spibridge --device /dev/spidev0.0 --port 9000
```
*/
use std::net::TcpListener;

use anyhow::Result;
use clap::Parser;
use log::info;

use spilink::rpc::{DEFAULT_PORT, RpcServer};
use spilink::spi::SpiLink;

#[derive(clap::Parser, Debug)]
#[command(version, about)]
struct Opt {
    #[arg(long, default_value = "/dev/spidev0.0")]
    device: String,

    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,

    #[arg(short = 'v', default_value = "0")]
    verbose: usize,
}

fn main() -> Result<()> {
    let opt = Opt::parse();
    stderrlog::new()
        .module(module_path!())
        .module("spilink")
        .verbosity(opt.verbose)
        .timestamp(stderrlog::Timestamp::Second)
        .init()?;

    let link = SpiLink::open(&opt.device)?;
    let listener = TcpListener::bind(("::", opt.port))?;
    info!("Serving {} on port {}...", opt.device, opt.port);
    RpcServer::new(link).serve(listener)?;
    Ok(())
}
