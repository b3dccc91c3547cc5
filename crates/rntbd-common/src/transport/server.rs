use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::protocol::error::{Result, RntbdError};
use crate::protocol::{status_codes, Frame, Metadata};
use crate::transport::codec::RntbdCodec;

/// Async TCP server answering RNTBD frames, used to stand in for a replica.
///
/// Every request on a connection is handled on its own task, so responses
/// are written in completion order rather than request order.
pub struct ReplicaServer {
    listener: TcpListener,
}

impl ReplicaServer {
    /// Creates a new server bound to the specified address.
    ///
    /// # Arguments
    /// * `bind_addr` - The address to bind to (e.g., "127.0.0.1:0")
    pub async fn bind(bind_addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|e| RntbdError::Connection(format!("Failed to bind to {}: {}", bind_addr, e)))?;

        Ok(Self { listener })
    }

    /// Gets the actual bound address.
    pub fn local_addr(&self) -> Result<std::net::SocketAddr> {
        self.listener
            .local_addr()
            .map_err(|e| RntbdError::Connection(format!("Failed to get local addr: {}", e)))
    }

    /// Runs the server with the given frame handler.
    ///
    /// Accepts connections in a loop and spawns a task per connection. A
    /// handler error is answered with a 500 frame carrying the message.
    pub async fn run_with_handler<F, Fut>(&self, handler: F) -> Result<()>
    where
        F: Fn(Frame) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Frame>> + Send + 'static,
    {
        let handler = Arc::new(handler);

        loop {
            let (stream, peer_addr) = self
                .listener
                .accept()
                .await
                .map_err(|e| RntbdError::Connection(format!("Failed to accept connection: {}", e)))?;

            tracing::debug!(%peer_addr, "connection established");

            let handler = handler.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, handler).await {
                    tracing::debug!(%peer_addr, error = %e, "connection error");
                }
            });
        }
    }
}

/// Builds the frame sent back when a handler fails.
pub fn error_frame(request: &Frame, error: &RntbdError) -> Frame {
    let metadata = Metadata {
        status_code: Some(status_codes::INTERNAL_SERVER_ERROR),
        sub_status_code: Some(0),
        error_message: Some(error.to_string()),
        ..Metadata::default()
    };
    Frame::response(request, metadata, Bytes::new())
}

async fn handle_connection<F, Fut>(stream: TcpStream, handler: Arc<F>) -> Result<()>
where
    F: Fn(Frame) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Frame>> + Send + 'static,
{
    let (read_half, write_half) = stream.into_split();
    let mut reader = FramedRead::new(read_half, RntbdCodec::new());
    let mut writer = FramedWrite::new(write_half, RntbdCodec::new());
    let (responses, mut outbound) = mpsc::unbounded_channel::<Frame>();

    let write_task = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            writer.send(frame).await?;
        }
        Ok::<_, RntbdError>(())
    });

    while let Some(next) = reader.next().await {
        // a framing error cannot be resynchronised, so drop the connection
        let request = next?;
        let handler = handler.clone();
        let responses = responses.clone();
        tokio::spawn(async move {
            let response = match handler(request.clone()).await {
                Ok(response) => response,
                Err(e) => {
                    tracing::debug!(activity_id = %request.activity_id(), error = %e, "handler error");
                    error_frame(&request, &e)
                }
            };
            let _ = responses.send(response);
        });
    }

    tracing::debug!("connection closed by peer");
    drop(responses);
    write_task
        .await
        .map_err(|e| RntbdError::Connection(format!("writer task failed: {}", e)))?
}
