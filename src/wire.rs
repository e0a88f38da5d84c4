//! Framed binary codec shared by both directions of the debugger connection.
//!
//! Primitives:
//! - command tags: fixed 4 ASCII bytes, case sensitive
//! - integers: little-endian signed 32-bit
//! - backend -> front-end strings: a one byte prefix `N` (null), `A` (7-bit
//!   clean) or `U` (UTF-8), then for `A`/`U` a 32-bit length and that many
//!   bytes
//! - front-end -> backend strings: no prefix, a 32-bit length followed by
//!   UTF-8 bytes
//! - object descriptors: repr string, hex-repr string or null, type-name
//!   string, then an expandable flag (1 if the object may have children)
//!
//! Short reads surface as `WireError::Protocol`; failed writes surface as
//! `WireError::PeerDisconnected`. Either one makes the session detach.

use std::io;
use std::io::Read;
use std::io::Write;

use thiserror::Error;

pub type Cmd = [u8; 4];

// Events emitted by the backend.
pub const ASBR: Cmd = *b"ASBR";
pub const BRKF: Cmd = *b"BRKF";
pub const BRKH: Cmd = *b"BRKH";
pub const BRKS: Cmd = *b"BRKS";
pub const CHLD: Cmd = *b"CHLD";
pub const DETC: Cmd = *b"DETC";
pub const EXCE: Cmd = *b"EXCE";
pub const EXCP: Cmd = *b"EXCP";
pub const EXCR: Cmd = *b"EXCR";
pub const EXIT: Cmd = *b"EXIT";
pub const EXTT: Cmd = *b"EXTT";
pub const LOAD: Cmd = *b"LOAD";
pub const MODL: Cmd = *b"MODL";
pub const NEWT: Cmd = *b"NEWT";
pub const OUTP: Cmd = *b"OUTP";
pub const REQH: Cmd = *b"REQH";
pub const SETL: Cmd = *b"SETL";
pub const STPD: Cmd = *b"STPD";
pub const THRF: Cmd = *b"THRF";

const NONE_PREFIX: u8 = b'N';
const ASCII_PREFIX: u8 = b'A';
const UNICODE_PREFIX: u8 = b'U';

#[derive(Error, Debug)]
pub enum WireError {
    /// The peer closed the connection while we were writing to it.
    #[error("debugger front-end disconnected")]
    PeerDisconnected,
    /// A short read or a malformed frame.
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Everything needed to describe one evaluation result or child on the wire.
/// The expandable flag is computed when the descriptor is built: an object is
/// not expandable when its type is one of the leaf types or its reported
/// length is zero.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ObjDesc {
    pub repr: String,
    pub hex_repr: Option<String>,
    pub type_name: String,
    pub expandable: bool,
}

pub struct MessageWriter<W: Write> {
    sink: W,
}

impl<W: Write> MessageWriter<W> {
    pub fn new(sink: W) -> MessageWriter<W> {
        MessageWriter { sink }
    }

    fn put(&mut self, bytes: &[u8]) -> Result<(), WireError> {
        match self.sink.write_all(bytes) {
            Ok(()) => Ok(()),
            Err(e) => match e.kind() {
                io::ErrorKind::BrokenPipe
                | io::ErrorKind::ConnectionReset
                | io::ErrorKind::ConnectionAborted
                | io::ErrorKind::UnexpectedEof
                | io::ErrorKind::WriteZero => Err(WireError::PeerDisconnected),
                _ => Err(WireError::Io(e)),
            },
        }
    }

    pub fn write_cmd(&mut self, cmd: Cmd) -> Result<(), WireError> {
        self.put(&cmd)
    }

    pub fn write_int(&mut self, value: i32) -> Result<(), WireError> {
        self.put(&value.to_le_bytes())
    }

    pub fn write_string(&mut self, string: Option<&str>) -> Result<(), WireError> {
        match string {
            None => self.put(&[NONE_PREFIX]),
            Some(s) => {
                let bytes = s.as_bytes();
                let prefix = if s.is_ascii() {
                    ASCII_PREFIX
                } else {
                    UNICODE_PREFIX
                };
                self.put(&[prefix])?;
                self.write_int(bytes.len() as i32)?;
                self.put(bytes)
            }
        }
    }

    pub fn write_object(&mut self, desc: &ObjDesc) -> Result<(), WireError> {
        self.write_string(Some(&desc.repr))?;
        self.write_string(desc.hex_repr.as_ref().map(|s| s.as_str()))?;
        self.write_string(Some(&desc.type_name))?;
        self.write_int(if desc.expandable { 1 } else { 0 })
    }

    pub fn flush(&mut self) -> Result<(), WireError> {
        self.sink.flush()?;
        Ok(())
    }
}

pub struct MessageReader<R: Read> {
    source: R,
}

impl<R: Read> MessageReader<R> {
    pub fn new(source: R) -> MessageReader<R> {
        MessageReader { source }
    }

    fn get(&mut self, buf: &mut [u8]) -> Result<(), WireError> {
        match self.source.read_exact(buf) {
            Ok(()) => Ok(()),
            Err(ref e) if e.kind() == io::ErrorKind::UnexpectedEof => Err(WireError::Protocol(
                "connection truncated mid-message".to_owned(),
            )),
            Err(e) => Err(WireError::Io(e)),
        }
    }

    pub fn read_cmd(&mut self) -> Result<Cmd, WireError> {
        let mut cmd: Cmd = [0; 4];
        self.get(&mut cmd)?;
        Ok(cmd)
    }

    pub fn read_int(&mut self) -> Result<i32, WireError> {
        let mut buf = [0; 4];
        self.get(&mut buf)?;
        Ok(i32::from_le_bytes(buf))
    }

    /// Read a front-end string: 32-bit length then UTF-8 bytes, no prefix.
    pub fn read_string(&mut self) -> Result<String, WireError> {
        let len = self.read_int()?;
        if len < 0 {
            return Err(WireError::Protocol(format!(
                "negative string length {}",
                len
            )));
        }
        let mut buf = vec![0; len as usize];
        self.get(&mut buf)?;
        String::from_utf8(buf)
            .map_err(|_| WireError::Protocol("string payload is not valid UTF-8".to_owned()))
    }

    /// Read a backend-style prefixed string (`N`/`A`/`U`). The debugger
    /// itself only writes these; decoding is here so the codec round-trips.
    pub fn read_prefixed_string(&mut self) -> Result<Option<String>, WireError> {
        let mut prefix = [0; 1];
        self.get(&mut prefix)?;
        match prefix[0] {
            NONE_PREFIX => Ok(None),
            ASCII_PREFIX | UNICODE_PREFIX => {
                let len = self.read_int()?;
                if len < 0 {
                    return Err(WireError::Protocol(format!(
                        "negative string length {}",
                        len
                    )));
                }
                let mut buf = vec![0; len as usize];
                self.get(&mut buf)?;
                String::from_utf8(buf)
                    .map(Some)
                    .map_err(|_| WireError::Protocol("string payload is not valid UTF-8".to_owned()))
            }
            other => Err(WireError::Protocol(format!(
                "unknown string prefix {:#x}",
                other
            ))),
        }
    }
}
