/*! Relaying transactions over TCP.

The usual deployment keeps the SPI wiring on a small board next to the
peripheral and does the interesting work somewhere comfortable. The
bridge daemon runs [`RpcServer`] next to the bus; development machines
talk to it through [`RpcClient`], which is itself a [`Transactor`], so
everything above the link neither knows nor cares that the bus is
remote.

The wire is newline-delimited JSON, one object per line:

```text
-> {"method": "RPCEndpoint.RPCTransact", "params": [[{packet}, …]], "id": 1}
<- {"id": 1, "result": [{packet}, …], "error": null}
```

A remote link failure travels back in `error` as a string; `result`
still carries whatever packets were decoded before the failure.
*/
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::net::{TcpListener, TcpStream, ToSocketAddrs};
use std::sync::{Arc, Mutex};
use std::thread;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::{Error, Packet, Result, Transactor};

/// TCP port the bridge daemon listens on by default.
pub const DEFAULT_PORT: u16 = 9000;

/// The one method the relay understands.
pub const TRANSACT_METHOD: &str = "RPCEndpoint.RPCTransact";

#[derive(Debug, Serialize, Deserialize)]
struct Request {
    method: String,
    /// One positional parameter: the outbound packet batch.
    params: (Vec<Packet>,),
    id: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct Response {
    id: u64,
    result: Vec<Packet>,
    error: Option<String>,
}

/// Serves a local link to remote [`RpcClient`]s.
pub struct RpcServer<L> {
    link: Arc<Mutex<L>>,
}

impl<L: Transactor + Send + 'static> RpcServer<L> {
    /// Wrap `link` for serving. The mutex inside is what serialises
    /// concurrent client connections onto the one link.
    pub fn new(link: L) -> Self {
        Self {
            link: Arc::new(Mutex::new(link)),
        }
    }

    /// Accept and serve connections forever.
    pub fn serve(&self, listener: TcpListener) -> Result<()> {
        for stream in listener.incoming() {
            match stream {
                Ok(stream) => {
                    if let Ok(peer) = stream.peer_addr() {
                        info!("rpc: connection from {peer}");
                    }
                    let link = Arc::clone(&self.link);
                    thread::spawn(move || {
                        if let Err(e) = serve_client(&link, stream) {
                            debug!("rpc: client dropped: {e}");
                        }
                    });
                }
                Err(e) => warn!("rpc: accept failed: {e}"),
            }
        }
        Ok(())
    }
}

fn serve_client<L: Transactor>(link: &Mutex<L>, stream: TcpStream) -> Result<()> {
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut writer = BufWriter::new(stream);
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            return Ok(()); // clean hangup
        }
        let req: Request = serde_json::from_str(&line)?;

        let mut result = Vec::new();
        let error = if req.method == TRANSACT_METHOD {
            let mut link = match link.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            link.transact(&req.params.0, &mut result)
                .err()
                .map(|e| e.to_string())
        } else {
            Some(format!("unknown method {:?}", req.method))
        };

        let resp = Response {
            id: req.id,
            result,
            error,
        };
        serde_json::to_writer(&mut writer, &resp)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
    }
}

/// A [`Transactor`] whose link lives on the far end of a TCP
/// connection.
pub struct RpcClient {
    reader: BufReader<TcpStream>,
    writer: BufWriter<TcpStream>,
    next_id: u64,
}

impl RpcClient {
    /// Dial a bridge at `addr`.
    pub fn connect<A: ToSocketAddrs>(addr: A) -> Result<Self> {
        let stream = TcpStream::connect(addr)?;
        let reader = BufReader::new(stream.try_clone()?);
        Ok(Self {
            reader,
            writer: BufWriter::new(stream),
            next_id: 0,
        })
    }
}

impl Transactor for RpcClient {
    fn transact(&mut self, tx: &[Packet], rx: &mut Vec<Packet>) -> Result<()> {
        self.next_id += 1;
        let req = Request {
            method: TRANSACT_METHOD.to_string(),
            params: (tx.to_vec(),),
            id: self.next_id,
        };
        serde_json::to_writer(&mut self.writer, &req)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;

        let mut line = String::new();
        if self.reader.read_line(&mut line)? == 0 {
            return Err(Error::Rpc("server closed the connection".into()));
        }
        let resp: Response = serde_json::from_str(&line)?;
        if resp.id != req.id {
            return Err(Error::Rpc(format!(
                "response id {} for request {}",
                resp.id, req.id
            )));
        }
        rx.extend(resp.result);
        match resp.error {
            Some(e) => Err(Error::Rpc(e)),
            None => Ok(()),
        }
    }
}
