//! Raw socket transport (SCPI over TCP port 5025, Ensemble ASCII port 8000).

use super::Transport;
use crate::error::{CalError, CalResult};
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info};

pub struct TcpTransport {
    address: String,
    terminator: String,
    timeout: Duration,
    // Reader and writer share one lock so a query's write and read are never
    // interleaved with another command.
    io: Mutex<(BufReader<OwnedReadHalf>, OwnedWriteHalf)>,
}

impl TcpTransport {
    /// Connect to `address` (`host:port`).
    ///
    /// # Errors
    /// - `Timeout` if the connection is not established within `timeout`
    /// - `Transport` if the peer refuses it
    pub async fn connect(address: &str, terminator: &str, timeout_dur: Duration) -> CalResult<Self> {
        let stream = timeout(timeout_dur, TcpStream::connect(address))
            .await
            .map_err(|_| CalError::Timeout(address.to_string()))?
            .map_err(|e| CalError::transport(address, e))?;
        stream
            .set_nodelay(true)
            .map_err(|e| CalError::transport(address, e))?;
        let (read, write) = stream.into_split();
        info!("Connected to instrument at {}", address);
        Ok(Self {
            address: address.to_string(),
            terminator: terminator.to_string(),
            timeout: timeout_dur,
            io: Mutex::new((BufReader::new(read), write)),
        })
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn resource(&self) -> &str {
        &self.address
    }

    async fn write(&self, command: &str) -> CalResult<()> {
        let mut io = self.io.lock().await;
        debug!("{} <- {}", self.address, command);
        let line = format!("{}{}", command, self.terminator);
        io.1
            .write_all(line.as_bytes())
            .await
            .map_err(|e| CalError::transport(&self.address, e))
    }

    async fn query(&self, command: &str) -> CalResult<String> {
        let mut io = self.io.lock().await;
        debug!("{} <- {}", self.address, command);
        let line = format!("{}{}", command, self.terminator);
        io.1
            .write_all(line.as_bytes())
            .await
            .map_err(|e| CalError::transport(&self.address, e))?;

        let mut reply = String::new();
        let read = timeout(self.timeout, io.0.read_line(&mut reply))
            .await
            .map_err(|_| CalError::Timeout(format!("{} reply to '{}'", self.address, command)))?
            .map_err(|e| CalError::transport(&self.address, e))?;
        if read == 0 {
            return Err(CalError::transport(&self.address, "connection closed"));
        }
        let reply = reply.trim_end_matches(['\r', '\n']).to_string();
        debug!("{} -> {}", self.address, reply);
        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_query_roundtrip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let (read, mut write) = socket.into_split();
            let mut lines = BufReader::new(read).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line.ends_with('?') {
                    write.write_all(format!("echo:{}\n", line).as_bytes()).await.unwrap();
                }
            }
        });

        let transport = TcpTransport::connect(&addr, "\n", Duration::from_secs(1))
            .await
            .unwrap();
        transport.write("*CLS").await.unwrap();
        assert_eq!(transport.query("*IDN?").await.unwrap(), "echo:*IDN?");
    }

    #[tokio::test]
    async fn test_connect_refused_is_transport_fault() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);
        let err = TcpTransport::connect(&addr, "\n", Duration::from_millis(500))
            .await
            .err()
            .unwrap();
        assert!(err.is_transport());
    }
}
