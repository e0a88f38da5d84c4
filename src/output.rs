//! Redirection of the interpreter's stdout/stderr to the front-end.
//!
//! The wrapper forwards every chunk as an `OUTP` event and then writes it
//! through to the original sink, so the program's console behavior is
//! unchanged. The session keeps a handle on the shared inner state so it can
//! take the original sink back at detach.

use crate::interp::Tid;
use crate::session::Session;
use std::io;
use std::io::Write;
use std::sync::Mutex;
use std::sync::Weak;

pub struct OutputInner {
    pub session: Weak<Session>,
    pub is_stdout: bool,
    /// The sink that was installed before redirection. Taken back at detach.
    pub old: Mutex<Option<Box<dyn Write + Send>>>,
}

pub struct DebuggerOutput {
    pub inner: std::sync::Arc<OutputInner>,
}

impl Write for DebuggerOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if let Some(session) = self.inner.session.upgrade() {
            if !session.detached() {
                let tid: Tid = session.interp().current_thread_id();
                let text = String::from_utf8_lossy(buf).into_owned();
                session.report_output(tid, &text);
            }
        }
        let mut old = self.inner.old.lock().unwrap();
        match &mut *old {
            Some(sink) => sink.write(buf),
            // Redirection is mid-install or already torn down; the event
            // above is all that can be done with the data.
            None => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut old = self.inner.old.lock().unwrap();
        match &mut *old {
            Some(sink) => sink.flush(),
            None => Ok(()),
        }
    }
}
