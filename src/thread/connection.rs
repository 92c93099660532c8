//! # Summary
//!
//! Serves one inbound connection: read a line, run it through the node
//! state, write the reply, repeat until the peer hangs up. Peers that keep
//! a connection open (heartbeats) are served by the same loop.

use std::io;

use tokio::net::TcpStream;
use tokio_util::codec::LinesCodecError;

use crate::error::{Error, Result};
use crate::message::Message;
use crate::node::Node;
use crate::socket::Connection;
use crate::state::Section;

pub async fn serve<S: Section>(node: Node<S>, stream: TcpStream, retries: usize) -> Result<()> {
    let mut connection = Connection::new(stream);
    let mut resets = 0;
    let mut reset = None;
    loop {
        let line = match connection.recv().await {
        | None => match reset {
            | None => break,
            | Some(source) => {
                return Err(Error::Unreachable { addr: connection.peer().to_string(), source })
            }
        },
        | Some(Ok(line)) => {
            reset = None;
            line
        }
        | Some(Err(LinesCodecError::Io(error))) if error.kind() == io::ErrorKind::ConnectionReset => {
            resets += 1;
            warn!("connection reset by {} ({} of {})", connection.peer(), resets, retries);
            if resets >= retries {
                return Err(Error::Unreachable { addr: connection.peer().to_string(), source: error })
            }
            reset = Some(error);
            connection = connection.resume();
            continue
        }
        | Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
            let reply = node.shared().lock().unrecognized("<oversized line>");
            connection = connection.resume();
            connection.send(&reply).await?;
            continue
        }
        | Some(Err(LinesCodecError::Io(source))) => {
            return Err(Error::Unreachable { addr: connection.peer().to_string(), source })
        }
        };

        trace!("received {:?} from {}", line, connection.peer());
        let (reply, hold) = {
            let mut state = node.shared().lock();
            match line.parse::<Message>() {
            | Ok(message) => {
                let response = state.receive(message);
                (response.reply, response.hold)
            }
            | Err(_) => (state.unrecognized(&line), None),
            }
        };

        if let Some(hold) = hold {
            node.execute(hold);
        }

        connection.send(&reply).await?;
    }
    trace!("{} disconnected", connection.peer());
    Ok(())
}
