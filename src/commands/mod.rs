//! The command loop: a dedicated thread that owns the receive half of the
//! connection, reads 4-byte opcodes and dispatches them against the session.
//!
//! Commands either mutate shared state directly (breakpoints, stepping,
//! exception policy) or schedule work onto a parked thread (`exec`, `chld`)
//! so user expressions never run on this thread. An unknown opcode or a
//! protocol error ends the loop; the debuggee keeps running without a
//! front-end.

use crate::breakpoints::canonical_file;
use crate::breakpoints::ConditionInfo;
use crate::breakpoints::PendingBreakpoint;
use crate::exceptions::BreakMode;
use crate::exceptions::HandlerRange;
use crate::interp::FrameRef;
use crate::interp::Tid;
use crate::log::LogLevel::LogDebug;
use crate::log::LogLevel::LogWarn;
use crate::session::Session;
use crate::thread::TracedThread;
use crate::thread::STEPPING_INTO;
use crate::thread::STEPPING_NONE;
use crate::thread::STEPPING_OUT;
use crate::thread::STEPPING_OVER;
use crate::wire;
use crate::wire::MessageReader;
use crate::wire::WireError;
use std::collections::HashSet;
use std::net::TcpStream;
use std::sync::Arc;
use std::thread;

pub struct DebuggerLoop {
    session: Arc<Session>,
    reader: MessageReader<TcpStream>,
}

impl DebuggerLoop {
    pub fn spawn(session: Arc<Session>, reader: MessageReader<TcpStream>) {
        let mut debugger_loop = DebuggerLoop { session, reader };
        thread::Builder::new()
            .name("rdb-command-loop".to_owned())
            .spawn(move || debugger_loop.run())
            .expect("failed to spawn the command loop thread");
    }

    fn run(&mut self) {
        loop {
            let cmd = match self.reader.read_cmd() {
                Ok(cmd) => cmd,
                Err(err) => {
                    log!(LogDebug, "command loop ending: {}", err);
                    return;
                }
            };
            let result = match &cmd {
                b"exit" => self.command_exit(),
                b"stpi" => self.command_step(STEPPING_INTO),
                b"stpo" => self.command_step(STEPPING_OUT),
                b"stpv" => self.command_step(STEPPING_OVER),
                b"brkp" => self.command_set_breakpoint(),
                b"brkc" => self.command_set_breakpoint_condition(),
                b"brkr" => self.command_remove_breakpoint(),
                b"brka" => self.command_break_all(),
                b"resa" => self.command_resume_all(),
                b"rest" => self.command_resume_thread(),
                b"exec" => self.command_execute_code(),
                b"chld" => self.command_enum_children(),
                b"setl" => self.command_set_lineno(),
                b"detc" => {
                    self.session.detach();
                    return;
                }
                b"clst" => self.command_clear_stepping(),
                b"sexi" => self.command_set_exception_info(),
                b"sehi" => self.command_set_exception_handler_info(),
                unknown => {
                    log!(
                        LogWarn,
                        "unknown command {:?}; leaving command loop",
                        String::from_utf8_lossy(unknown)
                    );
                    return;
                }
            };
            if let Err(err) = result {
                log!(LogWarn, "command failed ({}); leaving command loop", err);
                return;
            }
        }
    }

    fn command_exit(&mut self) -> Result<(), WireError> {
        self.session.release_exit_wait();
        Ok(())
    }

    fn command_step(&mut self, stepping: i32) -> Result<(), WireError> {
        let tid = self.reader.read_int()? as Tid;
        if let Some(thread) = self.session.get_thread(tid) {
            thread.set_stepping(stepping);
            self.session.resume_all();
        }
        Ok(())
    }

    fn command_set_breakpoint(&mut self) -> Result<(), WireError> {
        let id = self.reader.read_int()?;
        let line = self.reader.read_int()?;
        let filename = self.reader.read_string()?;
        let condition = self.reader.read_string()?;
        let break_when_changed = self.reader.read_int()? != 0;

        let canonical = canonical_file(&filename);
        let bound = self
            .session
            .modules_snapshot()
            .iter()
            .any(|(_, module)| module.filename == canonical);

        self.add_breakpoint(&canonical, line, id, &condition, break_when_changed);
        if bound {
            self.session.report_breakpoint_bound(id);
        } else {
            // No matching module yet: remember it so a later module load
            // can claim it, and tell the front-end it is not bound.
            self.session.breakpoints().add_pending(PendingBreakpoint {
                id,
                line,
                filename: canonical,
                condition,
                break_when_changed,
            });
            self.session.report_breakpoint_failed(id);
        }
        Ok(())
    }

    fn add_breakpoint(
        &self,
        filename: &str,
        line: i32,
        id: i32,
        condition: &str,
        break_when_changed: bool,
    ) {
        let info = if condition.is_empty() {
            None
        } else {
            Some(ConditionInfo::new(condition, break_when_changed))
        };
        self.session.breakpoints().add(filename, line, id, info);
    }

    fn command_set_breakpoint_condition(&mut self) -> Result<(), WireError> {
        let id = self.reader.read_int()?;
        let condition = self.reader.read_string()?;
        let break_when_changed = self.reader.read_int()? != 0;
        self.session
            .breakpoints()
            .set_condition(id, condition, break_when_changed);
        Ok(())
    }

    fn command_remove_breakpoint(&mut self) -> Result<(), WireError> {
        let line = self.reader.read_int()?;
        let id = self.reader.read_int()?;
        self.session.breakpoints().remove(line, id);
        Ok(())
    }

    fn command_break_all(&mut self) -> Result<(), WireError> {
        self.session.arm_break_all();
        Ok(())
    }

    fn command_resume_all(&mut self) -> Result<(), WireError> {
        self.session.resume_all();
        Ok(())
    }

    fn command_resume_thread(&mut self) -> Result<(), WireError> {
        let tid = self.reader.read_int()? as Tid;
        if let Some(thread) = self.session.get_thread(tid) {
            if thread.take_reported_process_loaded() {
                // Resuming the thread that reported the attach break means
                // resuming the process.
                self.session.resume_all();
            } else {
                let _guard = thread.lock_starting();
                if thread.is_blocked() {
                    thread.unblock();
                }
            }
        }
        Ok(())
    }

    fn command_execute_code(&mut self) -> Result<(), WireError> {
        let text = self.reader.read_string()?;
        let tid = self.reader.read_int()? as Tid;
        let fid = self.reader.read_int()?;
        let eid = self.reader.read_int()?;

        if let Some(thread) = self.session.get_thread(tid) {
            if let Some(frame) = walk_to_frame(&thread, fid) {
                thread.run_on_thread(&self.session, text, frame, eid);
            }
        }
        Ok(())
    }

    fn command_enum_children(&mut self) -> Result<(), WireError> {
        let text = self.reader.read_string()?;
        let tid = self.reader.read_int()? as Tid;
        let fid = self.reader.read_int()?;
        let eid = self.reader.read_int()?;
        let child_is_enumerate = self.reader.read_int()? != 0;

        if let Some(thread) = self.session.get_thread(tid) {
            if let Some(frame) = walk_to_frame(&thread, fid) {
                thread.enum_child_on_thread(&self.session, text, frame, eid, child_is_enumerate);
            }
        }
        Ok(())
    }

    fn command_set_lineno(&mut self) -> Result<(), WireError> {
        let tid = self.reader.read_int()? as Tid;
        let fid = self.reader.read_int()?;
        let line = self.reader.read_int()?;

        let new_line = self
            .session
            .get_thread(tid)
            .and_then(|thread| walk_to_frame(&thread, fid))
            .and_then(|frame| frame.set_lineno(line).ok());

        self.session.send(|w| {
            w.write_cmd(wire::SETL)?;
            match new_line {
                Some(line) => {
                    w.write_int(1)?;
                    w.write_int(tid)?;
                    w.write_int(line)
                }
                None => {
                    w.write_int(0)?;
                    w.write_int(tid)?;
                    w.write_int(0)
                }
            }
        });
        Ok(())
    }

    fn command_clear_stepping(&mut self) -> Result<(), WireError> {
        let tid = self.reader.read_int()? as Tid;
        if let Some(thread) = self.session.get_thread(tid) {
            thread.set_stepping(STEPPING_NONE);
        }
        Ok(())
    }

    fn command_set_exception_info(&mut self) -> Result<(), WireError> {
        let policy = self.session.exceptions();
        policy.clear();
        policy.set_default_mode(BreakMode::from_bits_truncate(self.reader.read_int()?));

        let count = self.reader.read_int()?;
        for _ in 0..count {
            let mode = BreakMode::from_bits_truncate(self.reader.read_int()?);
            let name = self.reader.read_string()?;
            policy.add_exception(&name, mode);
        }
        Ok(())
    }

    fn command_set_exception_handler_info(&mut self) -> Result<(), WireError> {
        let filename = match self.reader.read_string() {
            Ok(filename) => filename,
            Err(err) => {
                // Whoever requested handlers must not wait forever.
                self.session.exceptions().abort_requests();
                return Err(err);
            }
        };
        match self.read_handler_ranges() {
            Ok(handlers) => {
                self.session.exceptions().set_handlers(&filename, handlers);
                Ok(())
            }
            Err(err) => {
                self.session.exceptions().finish_request(&filename);
                Err(err)
            }
        }
    }

    fn read_handler_ranges(&mut self) -> Result<Vec<HandlerRange>, WireError> {
        let count = self.reader.read_int()?;
        let mut handlers = Vec::with_capacity(count.max(0) as usize);
        for _ in 0..count {
            let line_start = self.reader.read_int()?;
            let line_end = self.reader.read_int()?;

            // Type expressions for this range, terminated by "-".
            let mut expressions = HashSet::new();
            loop {
                let text = self.reader.read_string()?.trim().to_owned();
                if text == "-" {
                    break;
                }
                expressions.insert(text);
            }
            if expressions.is_empty() {
                expressions.insert("*".to_owned());
            }
            handlers.push(HandlerRange {
                line_start,
                line_end,
                expressions,
            });
        }
        Ok(handlers)
    }
}

/// The `fid`-th frame outward from the thread's current frame.
fn walk_to_frame(thread: &Arc<TracedThread>, fid: i32) -> Option<FrameRef> {
    let mut frame = thread.cur_frame()?;
    for _ in 0..fid {
        frame = frame.back()?;
    }
    Some(frame)
}
