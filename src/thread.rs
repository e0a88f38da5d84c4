//! Per-thread tracing state.
//!
//! Every traced interpreter thread owns one `TracedThread`. The record is
//! shared: the thread itself drives the state machine from its trace hook,
//! while the command loop flips stepping modes and schedules evaluations
//! from the other side of the connection.
//!
//! Stepping is an ordinal. `STEPPING_OVER` is the floor for nesting: every
//! `call` while stepping over increments (we descended a frame), every
//! `return` decrements. `STEPPING_OUT` mirrors that downwards. A thread only
//! actually stops at the next line when the ordinal is exactly
//! `STEPPING_OVER` or `STEPPING_INTO`, i.e. back at the frame the step was
//! issued in.

use crate::eval;
use crate::eval::describe;
use crate::eval::undefined_desc;
use crate::interp::ExceptionRef;
use crate::interp::FrameRef;
use crate::interp::Tid;
use crate::interp::TraceEvent;
use crate::interp::TraceFn;
use crate::interp::TraceSink;
use crate::log::LogLevel::LogError;
use crate::session::Session;
use crate::sync::Semaphore;
use crate::wire;
use crate::wire::ObjDesc;
use backtrace::Backtrace;
use std::panic;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicI32;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::Weak;

pub const STEPPING_OUT: i32 = -1; // first value, we decrement below this
pub const STEPPING_NONE: i32 = 0;
pub const STEPPING_BREAK: i32 = 1;
pub const STEPPING_LAUNCH_BREAK: i32 = 2;
pub const STEPPING_ATTACH_BREAK: i32 = 3;
pub const STEPPING_INTO: i32 = 4;
pub const STEPPING_OVER: i32 = 5; // last value, we increment past this

const_assert!(STEPPING_OUT < STEPPING_NONE);
const_assert_eq!(STEPPING_OVER, STEPPING_INTO + 1);

/// One frame of a stack snapshot, ready to serialize.
pub struct FrameData {
    pub first_lineno: i32,
    pub end_lineno: i32,
    pub cur_lineno: i32,
    pub name: String,
    pub filename: String,
    pub arg_count: i32,
    pub vars: Vec<(String, ObjDesc)>,
}

/// Predecessor trace hooks, chained per frame: the hook active in the
/// calling frame is pushed on `call` and popped again on `return`.
struct TraceChain {
    prev: Option<TraceFn>,
    stack: Vec<TraceFn>,
}

type Work = Box<dyn FnOnce() + Send>;

pub struct TracedThread {
    pub id: Tid,
    cur_frame: Mutex<Option<FrameRef>>,
    stepping: AtomicI32,
    /// Line the thread last parked on; stepping will not re-stop there.
    /// `-1` when unset.
    stopped_on_line: AtomicI32,
    /// One-shot: the next event turns the tracer into a pass-through.
    detach: AtomicBool,
    /// True between reporting the attach break and the matching resume.
    reported_process_loaded: AtomicBool,
    is_blocked: AtomicBool,
    is_working: AtomicBool,
    /// Deferred closure to run on this thread's own stack while parked.
    unblock_work: Mutex<Option<Work>>,
    /// The park primitive: the parked thread waits here, a resumer releases.
    block_lock: Semaphore,
    /// Held only around flips of the blocked flag and work assignment.
    block_starting: Mutex<()>,
    chain: Mutex<TraceChain>,
}

impl TracedThread {
    pub fn new(id: Tid) -> Arc<TracedThread> {
        Arc::new(TracedThread {
            id,
            cur_frame: Mutex::new(None),
            stepping: AtomicI32::new(STEPPING_NONE),
            stopped_on_line: AtomicI32::new(-1),
            detach: AtomicBool::new(false),
            reported_process_loaded: AtomicBool::new(false),
            is_blocked: AtomicBool::new(false),
            is_working: AtomicBool::new(false),
            unblock_work: Mutex::new(None),
            block_lock: Semaphore::new(0),
            block_starting: Mutex::new(()),
            chain: Mutex::new(TraceChain {
                prev: None,
                stack: Vec::new(),
            }),
        })
    }

    pub fn stepping(&self) -> i32 {
        self.stepping.load(SeqCst)
    }

    pub fn set_stepping(&self, stepping: i32) {
        self.stepping.store(stepping, SeqCst);
    }

    pub fn stopped_on_line(&self) -> i32 {
        self.stopped_on_line.load(SeqCst)
    }

    pub fn is_blocked(&self) -> bool {
        self.is_blocked.load(SeqCst)
    }

    pub fn mark_detached(&self) {
        self.detach.store(true, SeqCst);
    }

    pub fn is_marked_detached(&self) -> bool {
        self.detach.load(SeqCst)
    }

    /// Consume the process-loaded marker; resuming such a thread resumes
    /// every thread.
    pub fn take_reported_process_loaded(&self) -> bool {
        self.reported_process_loaded.swap(false, SeqCst)
    }

    pub fn cur_frame(&self) -> Option<FrameRef> {
        self.cur_frame.lock().unwrap().clone()
    }

    pub fn set_cur_frame(&self, frame: Option<FrameRef>) {
        *self.cur_frame.lock().unwrap() = frame;
    }

    /// Seed the predecessor hook observed when the tracer was installed.
    pub fn set_prev_trace(&self, prev: Option<TraceFn>) {
        self.chain.lock().unwrap().prev = prev;
    }

    /// Hold the flag lock while inspecting or resuming this thread.
    pub fn lock_starting(&self) -> std::sync::MutexGuard<()> {
        self.block_starting.lock().unwrap()
    }

    // ------------------------------------------------------------------
    // The state machine.

    pub fn handle_event(&self, session: &Arc<Session>, frame: &FrameRef, event: TraceEvent) {
        if self.stepping() == STEPPING_BREAK
            && session.should_debug_code(&frame.code().filename())
        {
            if self.cur_frame().is_none() {
                // Happens during attach; parking needs a frame to report.
                self.set_cur_frame(Some(frame.clone()));
            }
            if self.detach.load(SeqCst) {
                session.interp().clear_trace();
                return;
            }
            self.async_break(session);
        }

        match event {
            TraceEvent::Call => self.handle_call(session, frame),
            TraceEvent::Line => self.handle_line(session, frame),
            TraceEvent::Return => self.handle_return(session, frame),
            TraceEvent::Exception(exc) => self.handle_exception(session, frame, exc),
            TraceEvent::CCall | TraceEvent::CReturn | TraceEvent::CException => {}
        }
    }

    fn handle_call(&self, session: &Arc<Session>, frame: &FrameRef) {
        self.set_cur_frame(Some(frame.clone()));

        let code = frame.code();
        if code.name() == "<module>" && code.filename() != "<string>" {
            let module = session.new_module(&code.filename());
            if !session.detached() {
                session.report_module_load(&module);
                // This module may bind breakpoints set before it loaded.
                session.bind_pending_breakpoints(&module);
            }
        }

        let stepping = self.stepping();
        if stepping != STEPPING_NONE {
            if stepping == STEPPING_INTO {
                // Stop at the first line of the callee, not on its def;
                // clear the stop line so the same line number still breaks.
                self.stepping.store(STEPPING_OVER, SeqCst);
                self.stopped_on_line.store(-1, SeqCst);
            } else if stepping >= STEPPING_OVER {
                self.stepping.fetch_add(1, SeqCst);
            } else if stepping <= STEPPING_OUT {
                self.stepping.fetch_sub(1, SeqCst);
            }
        }

        let mut chain = self.chain.lock().unwrap();
        if let Some(prev) = chain.prev.take() {
            // Save the caller's hook for the matching return, then let it
            // produce the hook for the new frame.
            chain.stack.push(prev);
            let new_prev = chain
                .stack
                .last_mut()
                .unwrap()
                .call(frame, &TraceEvent::Call);
            chain.prev = new_prev;
        }
    }

    fn handle_line(&self, session: &Arc<Session>, frame: &FrameRef) {
        if !session.detached() {
            let stepping = self.stepping();
            if stepping != STEPPING_NONE {
                let wants_stop = ((stepping == STEPPING_OVER || stepping == STEPPING_INTO)
                    && frame.lineno() != self.stopped_on_line())
                    || stepping == STEPPING_LAUNCH_BREAK
                    || stepping == STEPPING_ATTACH_BREAK;
                if wants_stop {
                    let filename = frame.code().filename();
                    if (stepping == STEPPING_LAUNCH_BREAK && !session.any_module_loaded())
                        || session.interp().is_internal_file(&filename)
                        || !session.should_debug_code(&filename)
                    {
                        // Interpreter-internal setup code, or our own: keep
                        // going without probing breakpoints here.
                        return;
                    }
                    self.block_maybe_attach(session);
                }
            }

            // The debugger's own files never break, not even for an
            // explicitly placed breakpoint.
            if session.breakpoints().any_set()
                && session.should_debug_code(&frame.code().filename())
            {
                if let Some(bp_id) = session.breakpoints().check_line(frame, frame.lineno()) {
                    let tid = self.id;
                    let s = session.clone();
                    self.block(session, || {
                        s.report_breakpoint_hit(bp_id, tid);
                        s.mark_all_threads_for_break();
                    });
                }
            }
        }

        let mut chain = self.chain.lock().unwrap();
        if let Some(mut prev) = chain.prev.take() {
            chain.prev = prev.call(frame, &TraceEvent::Line);
        }
    }

    fn handle_return(&self, session: &Arc<Session>, frame: &FrameRef) {
        if !session.detached() {
            let stepping = self.stepping();
            if stepping != STEPPING_NONE {
                if stepping == STEPPING_OUT {
                    // Break at the next line of the caller.
                    self.stepping.store(STEPPING_OVER, SeqCst);
                    self.stopped_on_line.store(-1, SeqCst);
                } else if stepping == STEPPING_OVER {
                    let code = frame.code();
                    if code.name() == "<module>" && session.should_debug_code(&code.filename())
                    {
                        // Stepped over the end of the script.
                        self.stepping.store(STEPPING_NONE, SeqCst);
                        let tid = self.id;
                        let s = session.clone();
                        self.block(session, move || s.report_step_finished(tid));
                    }
                } else if stepping > STEPPING_OVER {
                    self.stepping.fetch_sub(1, SeqCst);
                } else if stepping < STEPPING_OUT {
                    self.stepping.fetch_add(1, SeqCst);
                }
            }
        }

        {
            let mut chain = self.chain.lock().unwrap();
            if let Some(prev) = chain.prev.as_mut() {
                prev.call(frame, &TraceEvent::Return);
            }
            if let Some(popped) = chain.stack.pop() {
                chain.prev = Some(popped);
            }
        }

        self.set_cur_frame(frame.back());
    }

    fn handle_exception(&self, session: &Arc<Session>, frame: &FrameRef, exc: ExceptionRef) {
        if self.stepping() == STEPPING_ATTACH_BREAK {
            self.block_maybe_attach(session);
        }

        if !session.detached()
            && session.should_debug_code(&frame.code().filename())
            && session.exceptions().should_break(session, &exc)
        {
            let tid = self.id;
            let s = session.clone();
            let exc2 = exc.clone();
            self.block(session, move || s.report_exception(&exc2, tid));
        }

        let mut chain = self.chain.lock().unwrap();
        if let Some(mut prev) = chain.prev.take() {
            chain.prev = prev.call(frame, &TraceEvent::Exception(exc));
        }
    }

    // ------------------------------------------------------------------
    // Parking.

    /// Park the calling thread (which must be this record's thread) until
    /// the front-end resumes it, running any evaluation work scheduled on it
    /// in the meantime. `reason` reports why we stopped; it runs under the
    /// starting lock so a concurrent resume-all observes consistent state.
    pub fn block<F: FnOnce()>(&self, session: &Arc<Session>, reason: F) {
        debug_assert!(!self.is_blocked());

        // Send this thread's frames before anything is reported.
        self.enum_thread_frames_locally(session);
        let line = self.cur_frame().map(|f| f.lineno()).unwrap_or(-1);
        self.stopped_on_line.store(line, SeqCst);

        {
            let _guard = self.block_starting.lock().unwrap();
            self.is_blocked.store(true, SeqCst);
            reason();
        }

        while !session.detached() {
            self.block_lock.acquire();
            let work = self.unblock_work.lock().unwrap().take();
            match work {
                None => break,
                Some(work) => {
                    // The front-end wants something evaluated on our stack;
                    // do it and park again.
                    self.is_working.store(true, SeqCst);
                    work();
                    self.is_working.store(false, SeqCst);
                }
            }
        }

        let _guard = self.block_starting.lock().unwrap();
        self.is_blocked.store(false, SeqCst);
    }

    /// Wake the parked thread. Only ever called from another thread.
    pub fn unblock(&self) {
        self.block_lock.release();
    }

    /// Hand `work` to the parked thread and wake it; it runs the closure on
    /// its own stack and parks again.
    pub fn schedule_work(&self, work: Work) {
        let _guard = self.block_starting.lock().unwrap();
        *self.unblock_work.lock().unwrap() = Some(work);
        self.unblock();
    }

    pub fn run_on_thread(&self, session: &Arc<Session>, text: String, frame: FrameRef, eid: i32) {
        if !self.is_working.load(SeqCst) {
            let s = session.clone();
            self.schedule_work(Box::new(move || match frame.eval(&text) {
                Ok(res) => s.report_execution_result(eid, &res),
                Err(err) => s.report_execution_error(&err.text, eid),
            }));
        } else {
            session
                .report_execution_error("<error: previous evaluation has not completed>", eid);
        }
    }

    pub fn enum_child_on_thread(
        &self,
        session: &Arc<Session>,
        text: String,
        frame: FrameRef,
        eid: i32,
        child_is_enumerate: bool,
    ) {
        if !self.is_working.load(SeqCst) {
            let s = session.clone();
            self.schedule_work(Box::new(move || {
                let children = eval::enum_children(&frame, &text, child_is_enumerate);
                s.report_children(eid, &children);
            }));
        } else {
            session.report_children(eid, &eval::ChildList::empty());
        }
    }

    // ------------------------------------------------------------------
    // Break-all.

    /// Service a pending break-all: exactly one of the threads marked for
    /// break gets to announce it, and that thread also snapshots the stacks
    /// of everyone who has not parked yet.
    fn async_break(&self, session: &Arc<Session>) {
        self.stepping.store(STEPPING_NONE, SeqCst);
        let tid = self.id;
        let s = session.clone();
        self.block(session, || {
            let mut sent_break_complete = false;
            s.send(|w| {
                // Multiple threads race here; the flag decides under the
                // send lock.
                if s.take_send_break_complete() {
                    w.write_cmd(wire::ASBR)?;
                    w.write_int(tid)?;
                    sent_break_complete = true;
                }
                Ok(())
            });
            if sent_break_complete {
                s.update_all_thread_stacks(tid);
            }
        });
    }

    /// Park for a step/launch/attach stop. During attach only the first
    /// thread to get here reports the process as loaded; the rest just park.
    fn block_maybe_attach(&self, session: &Arc<Session>) {
        let mut will_block_now = true;
        if self.stepping() == STEPPING_ATTACH_BREAK {
            will_block_now = session.claim_attach_break();
        }

        let stepping = self.stepping.swap(STEPPING_NONE, SeqCst);
        let tid = self.id;
        let s = session.clone();
        self.block(session, || {
            if will_block_now {
                if stepping == STEPPING_OVER || stepping == STEPPING_INTO {
                    s.report_step_finished(tid);
                } else {
                    if stepping == STEPPING_ATTACH_BREAK {
                        self.reported_process_loaded.store(true, SeqCst);
                    }
                    s.report_process_loaded(tid);
                }
            }
        });
    }

    // ------------------------------------------------------------------
    // Stack snapshots.

    /// Walk the stack outward collecting user frames only.
    pub fn get_frame_list(&self, session: &Session) -> Vec<FrameData> {
        let mut frames = Vec::new();
        let mut cur = self.cur_frame();
        while let Some(frame) = cur {
            let code = frame.code();
            let filename = code.filename();
            if !session.should_debug_code(&filename) {
                break;
            }

            // The end line comes from summing the line-table deltas.
            let first = code.first_lineno();
            let mut end = first;
            for delta in code.line_deltas() {
                end += delta as i32;
            }

            let names = if frame.locals_are_globals() {
                frame.global_names()
            } else {
                code.var_names()
            };
            let mut vars = Vec::with_capacity(names.len());
            for name in names {
                let desc = match frame.get_local(&name) {
                    Some(obj) => describe(&obj),
                    None => undefined_desc(),
                };
                vars.push((name, desc));
            }

            frames.push(FrameData {
                first_lineno: first,
                end_lineno: end,
                cur_lineno: frame.lineno(),
                name: code.name(),
                filename,
                arg_count: code.arg_count(),
                vars,
            });
            cur = frame.back();
        }
        frames
    }

    pub fn send_frame_list(
        &self,
        session: &Session,
        frames: &[FrameData],
        thread_name: Option<&str>,
    ) {
        let tid = self.id;
        session.send(|w| {
            w.write_cmd(wire::THRF)?;
            w.write_int(tid)?;
            w.write_string(thread_name)?;
            w.write_int(frames.len() as i32)?;
            for frame in frames {
                w.write_int(frame.first_lineno)?;
                w.write_int(frame.end_lineno)?;
                w.write_int(frame.cur_lineno)?;
                w.write_string(Some(&frame.name))?;
                w.write_string(Some(&frame.filename))?;
                w.write_int(frame.arg_count)?;
                w.write_int(frame.vars.len() as i32)?;
                for (name, desc) in &frame.vars {
                    w.write_string(Some(name))?;
                    w.write_object(desc)?;
                }
            }
            Ok(())
        });
    }

    fn enum_thread_frames_locally(&self, session: &Session) {
        let frames = self.get_frame_list(session);
        let name = session.interp().current_thread_name();
        self.send_frame_list(session, &frames, name.as_ref().map(|s| s.as_str()));
    }
}

/// The hook handed to the interpreter for one thread. Faults inside the
/// machinery are suppressed so a debugger bug cannot take the traced thread
/// down with it; tracing resumes on the next event.
pub struct Tracer {
    pub thread: Arc<TracedThread>,
    pub session: Weak<Session>,
}

impl TraceSink for Tracer {
    fn trace(&self, frame: &FrameRef, event: TraceEvent) {
        let session = match self.session.upgrade() {
            Some(session) => session,
            None => return,
        };
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            self.thread.handle_event(&session, frame, event);
        }));
        if outcome.is_err() {
            log!(
                LogError,
                "fault in trace hook suppressed; tracing continues\n{:?}",
                Backtrace::new()
            );
        }
    }
}
