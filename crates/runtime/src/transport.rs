//! Transports carrying serialized protocol frames.
//!
//! The connection layer only needs a byte/message duplex: something to
//! write outbound frames into, and a stream of inbound frames that ends
//! when the peer goes away. Three flavors are provided:
//!
//! - [`WebSocketTransport`]: the browser's remote-debugging WebSocket
//! - [`PipeTransport`]: NUL-delimited frames over the browser's
//!   `--remote-debugging-pipe` file descriptors (or any byte duplex)
//! - [`bridge`]: an in-process pair for hosts that supply their own
//!   message channel (also used heavily in tests)

use futures_util::stream::StreamExt;
use futures_util::SinkExt;
use std::future::Future;
use std::pin::Pin;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::error::{Error, Result};

/// Writer half of a transport.
///
/// Object-safe: `send` returns a boxed future so `Box<dyn TransportSender>`
/// can be driven from the connection's writer task.
pub trait TransportSender: Send {
	fn send(&mut self, message: String) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;
}

/// A transport split into its writer half and the inbound frame stream.
///
/// The inbound receiver yielding `None` is the transport's close
/// signal; the reader task that feeds it drops the sender when the
/// underlying stream ends or errors.
pub struct TransportParts {
	pub sender: Box<dyn TransportSender>,
	pub incoming: mpsc::UnboundedReceiver<String>,
}

/// WebSocket transport over the browser's remote-debugging endpoint.
pub struct WebSocketTransport {
	sink: futures_util::stream::SplitSink<
		WebSocketStream<MaybeTlsStream<TcpStream>>,
		WsMessage,
	>,
}

impl WebSocketTransport {
	/// Connects to a `ws://` debugging URL and spawns the reader task.
	pub async fn connect(url: &str) -> Result<TransportParts> {
		let (stream, _) = tokio_tungstenite::connect_async(url)
			.await
			.map_err(|e| Error::ConnectionFailed(e.to_string()))?;
		let (sink, mut ws_rx) = stream.split();

		let (incoming_tx, incoming) = mpsc::unbounded_channel();
		tokio::spawn(async move {
			while let Some(frame) = ws_rx.next().await {
				match frame {
					Ok(WsMessage::Text(text)) => {
						if incoming_tx.send(text.to_string()).is_err() {
							break;
						}
					}
					Ok(WsMessage::Close(_)) | Err(_) => break,
					Ok(_) => {}
				}
			}
			// Dropping incoming_tx signals close to the connection.
		});

		Ok(TransportParts {
			sender: Box::new(WebSocketTransport { sink }),
			incoming,
		})
	}
}

impl TransportSender for WebSocketTransport {
	fn send(&mut self, message: String) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
		Box::pin(async move {
			self.sink
				.send(WsMessage::text(message))
				.await
				.map_err(|e| Error::Transport(e.to_string()))
		})
	}
}

/// Pipe transport framing: each JSON message is terminated by a NUL
/// byte, matching the browser's `--remote-debugging-pipe` protocol.
pub struct PipeTransport<W> {
	writer: W,
}

impl<W: AsyncWrite + Unpin + Send + 'static> PipeTransport<W> {
	/// Wraps a byte duplex and spawns the reader task.
	pub fn new<R: AsyncRead + Unpin + Send + 'static>(writer: W, reader: R) -> TransportParts {
		let (incoming_tx, incoming) = mpsc::unbounded_channel();
		tokio::spawn(read_pipe_frames(reader, incoming_tx));

		TransportParts {
			sender: Box::new(PipeTransport { writer }),
			incoming,
		}
	}
}

impl<W: AsyncWrite + Unpin + Send> TransportSender for PipeTransport<W> {
	fn send(&mut self, message: String) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
		Box::pin(async move {
			self.writer.write_all(message.as_bytes()).await?;
			self.writer.write_all(&[0]).await?;
			self.writer.flush().await?;
			Ok(())
		})
	}
}

async fn read_pipe_frames<R: AsyncRead + Unpin>(
	mut reader: R,
	incoming_tx: mpsc::UnboundedSender<String>,
) {
	let mut pending = Vec::new();
	let mut chunk = [0u8; 8192];
	loop {
		let n = match reader.read(&mut chunk).await {
			Ok(0) | Err(_) => break,
			Ok(n) => n,
		};
		pending.extend_from_slice(&chunk[..n]);
		while let Some(end) = pending.iter().position(|b| *b == 0) {
			let frame: Vec<u8> = pending.drain(..=end).take(end).collect();
			match String::from_utf8(frame) {
				Ok(text) => {
					if incoming_tx.send(text).is_err() {
						return;
					}
				}
				Err(e) => {
					tracing::error!("Dropping non-UTF-8 pipe frame: {e}");
				}
			}
		}
	}
}

/// In-process bridge transport for hosts that provide their own message
/// channel.
pub mod bridge {
	use super::*;

	/// The host's end of a [`pair`]: outbound frames from the
	/// connection arrive on `outgoing`, and frames pushed into
	/// `incoming` are delivered to the connection. Dropping `incoming`
	/// closes the transport.
	pub struct BridgeHandle {
		pub outgoing: mpsc::UnboundedReceiver<String>,
		pub incoming: mpsc::UnboundedSender<String>,
	}

	struct BridgeSender {
		outgoing_tx: mpsc::UnboundedSender<String>,
	}

	impl TransportSender for BridgeSender {
		fn send(
			&mut self,
			message: String,
		) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
			let result = self
				.outgoing_tx
				.send(message)
				.map_err(|_| Error::ChannelClosed);
			Box::pin(async move { result })
		}
	}

	/// Creates a connected (transport, host handle) pair.
	pub fn pair() -> (TransportParts, BridgeHandle) {
		let (outgoing_tx, outgoing) = mpsc::unbounded_channel();
		let (incoming_tx, incoming) = mpsc::unbounded_channel();
		(
			TransportParts {
				sender: Box::new(BridgeSender { outgoing_tx }),
				incoming,
			},
			BridgeHandle {
				outgoing,
				incoming: incoming_tx,
			},
		)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn pipe_reader_reassembles_split_frames() {
		let (mut ours, theirs) = tokio::io::duplex(1024);
		let (read_half, write_half) = tokio::io::split(theirs);
		let mut parts = PipeTransport::new(write_half, read_half);

		ours.write_all(b"{\"id\":1,\"resu").await.unwrap();
		ours.flush().await.unwrap();
		ours.write_all(b"lt\":{}}\0{\"method\":\"x\"}\0").await.unwrap();
		ours.flush().await.unwrap();

		assert_eq!(parts.incoming.recv().await.unwrap(), "{\"id\":1,\"result\":{}}");
		assert_eq!(parts.incoming.recv().await.unwrap(), "{\"method\":\"x\"}");

		// Closing the peer ends the inbound stream.
		drop(ours);
		assert!(parts.incoming.recv().await.is_none());
	}

	#[tokio::test]
	async fn pipe_writer_appends_nul_terminator() {
		let (mut ours, theirs) = tokio::io::duplex(1024);
		let (read_half, write_half) = tokio::io::split(theirs);
		let mut parts = PipeTransport::new(write_half, read_half);

		parts.sender.send("{\"id\":7}".to_string()).await.unwrap();

		let mut buf = [0u8; 9];
		ours.read_exact(&mut buf).await.unwrap();
		assert_eq!(&buf[..8], b"{\"id\":7}");
		assert_eq!(buf[8], 0);
	}

	#[tokio::test]
	async fn bridge_pair_is_bidirectional() {
		let (mut parts, mut handle) = bridge::pair();

		parts.sender.send("hello".to_string()).await.unwrap();
		assert_eq!(handle.outgoing.recv().await.unwrap(), "hello");

		handle.incoming.send("world".to_string()).unwrap();
		assert_eq!(parts.incoming.recv().await.unwrap(), "world");

		drop(handle);
		assert!(parts.incoming.recv().await.is_none());
	}
}
