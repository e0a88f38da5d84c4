//! The single TCP connection shared by everything.
//!
//! The receive side belongs to the command loop thread. The send side is a
//! mutex around the stream: every outbound message is written while the lock
//! is held so multi-part messages never interleave on the wire. Losing the
//! peer mid-send is what makes the whole session detach; that cascade lives
//! in the session, which owns the only reference to this struct.

use crate::wire::MessageReader;
use crate::wire::MessageWriter;
use std::io;
use std::net::TcpStream;
use std::sync::Mutex;
use std::thread::sleep;
use std::time::Duration;

const CONNECT_ATTEMPTS: u32 = 50;
const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(50);

pub struct Connection {
    writer: Mutex<MessageWriter<TcpStream>>,
}

impl Connection {
    /// Connect to the front-end at `127.0.0.1:port`, retrying while it
    /// finishes binding its listener. Returns the send half and the reader
    /// for the command loop.
    pub fn connect(port: u16) -> io::Result<(Connection, MessageReader<TcpStream>)> {
        let mut last_err = None;
        for _ in 0..CONNECT_ATTEMPTS {
            match TcpStream::connect(("127.0.0.1", port)) {
                Ok(stream) => {
                    let reader = MessageReader::new(stream.try_clone()?);
                    let conn = Connection {
                        writer: Mutex::new(MessageWriter::new(stream)),
                    };
                    return Ok((conn, reader));
                }
                Err(e) => {
                    last_err = Some(e);
                    sleep(CONNECT_RETRY_DELAY);
                }
            }
        }
        Err(last_err
            .unwrap_or_else(|| io::Error::new(io::ErrorKind::TimedOut, "failed to attach")))
    }

    /// Exclusive access to the send half. Callers hold the guard for the
    /// entire multi-part message and for nothing longer; user code is never
    /// evaluated while it is held.
    pub fn sender(&self) -> std::sync::MutexGuard<MessageWriter<TcpStream>> {
        match self.writer.lock() {
            Ok(guard) => guard,
            // A panic while holding the send lock already tore the session
            // down; the stream is still usable for a best-effort message.
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
