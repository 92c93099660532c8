//! # Summary
//!
//! Accepts inbound connections until the node shuts down, handing each
//! one to its own `connection::serve` task.

use tokio::net::TcpListener;

use crate::node::Node;
use crate::state::Section;
use crate::thread::connection;

pub async fn run<S: Section>(node: Node<S>, listener: TcpListener, retries: usize) {
    let shutdown = node.shutdown_token().clone();
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("node {} no longer accepting connections", node.id());
                break
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    trace!("connection from {}", addr);
                    stream.set_nodelay(true).ok();
                    let node = node.clone();
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        tokio::select! {
                            _ = shutdown.cancelled() => (),
                            served = connection::serve(node, stream, retries) => {
                                if let Err(error) = served {
                                    warn!("dropped connection from {}: {}", addr, error);
                                }
                            }
                        }
                    });
                }
                Err(error) => warn!("failed to accept connection: {}", error),
            },
        }
    }
}
