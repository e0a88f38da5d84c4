//! Process-wide debugger state and the attach/detach lifecycle.
//!
//! One `Session` exists per attached front-end. Traced threads reach it
//! through `Arc`s captured in their trace hooks; the command loop owns the
//! receive half of the connection and mutates the registries here. The
//! breakpoint table and exception policy are only ever mutated by the
//! command loop; traced threads read them.

use crate::breakpoints::canonical_file;
use crate::breakpoints::BreakpointTable;
use crate::breakpoints::ConditionInfo;
use crate::commands::DebuggerLoop;
use crate::connection::Connection;
use crate::eval::describe;
use crate::eval::ChildList;
use crate::exceptions::ExceptionPolicy;
use crate::flags::DebugFlags;
use crate::interp::ExceptionRef;
use crate::interp::FrameRef;
use crate::interp::Interp;
use crate::interp::ObjectRef;
use crate::interp::RunOutcome;
use crate::interp::SpawnHook;
use crate::interp::Tid;
use crate::interp::TraceSink;
use crate::log::LogLevel::LogDebug;
use crate::log::LogLevel::LogWarn;
use crate::output::DebuggerOutput;
use crate::output::OutputInner;
use crate::sync::Semaphore;
use crate::thread::TracedThread;
use crate::thread::Tracer;
use crate::thread::STEPPING_ATTACH_BREAK;
use crate::thread::STEPPING_BREAK;
use crate::thread::STEPPING_LAUNCH_BREAK;
use crate::thread::STEPPING_NONE;
use crate::wire;
use crate::wire::MessageWriter;
use crate::wire::WireError;
use std::collections::HashMap;
use std::io;
use std::io::Read;
use std::io::Write;
use std::net::TcpStream;
use std::panic;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicI32;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::Weak;

/// One loaded module. Ids are handed out in observation order and never
/// reused.
#[derive(Clone)]
pub struct Module {
    pub module_id: i32,
    /// Canonical absolute path of the module's source.
    pub filename: String,
}

pub struct Session {
    interp: Arc<dyn Interp>,
    conn: Connection,
    threads: Mutex<HashMap<Tid, Arc<TracedThread>>>,
    /// (filename as the code object reports it, module record) pairs, in
    /// load order.
    modules: Mutex<Vec<(String, Module)>>,
    module_index: AtomicI32,
    breakpoints: BreakpointTable,
    exceptions: ExceptionPolicy,
    detached: AtomicBool,
    /// Guards the detach sequence against running twice (the command can
    /// race a send failure).
    detaching: AtomicBool,
    /// Armed by break-all; the first thread to observe it under the send
    /// lock announces the break.
    send_break_complete: AtomicBool,
    /// Only one thread reports the attach break.
    attach_sent_break: Mutex<bool>,
    intercepting_for_attach: AtomicBool,
    /// Released by the front-end's `exit` command; the exit reporter waits
    /// on it so the process does not vanish before the event is handled.
    exit_wait: Semaphore,
    /// Source files the debugger must never stop in.
    dont_debug: Mutex<Vec<String>>,
    detach_callbacks: Mutex<Vec<Box<dyn Fn() + Send>>>,
    redirected: Mutex<Vec<Arc<OutputInner>>>,
}

impl Session {
    fn new(interp: Arc<dyn Interp>, conn: Connection) -> Arc<Session> {
        Arc::new(Session {
            interp,
            conn,
            threads: Mutex::new(HashMap::new()),
            modules: Mutex::new(Vec::new()),
            module_index: AtomicI32::new(0),
            breakpoints: BreakpointTable::new(),
            exceptions: ExceptionPolicy::new(),
            detached: AtomicBool::new(false),
            detaching: AtomicBool::new(false),
            send_break_complete: AtomicBool::new(false),
            attach_sent_break: Mutex::new(false),
            intercepting_for_attach: AtomicBool::new(false),
            exit_wait: Semaphore::new(0),
            dont_debug: Mutex::new(Vec::new()),
            detach_callbacks: Mutex::new(Vec::new()),
            redirected: Mutex::new(Vec::new()),
        })
    }

    pub fn interp(&self) -> &Arc<dyn Interp> {
        &self.interp
    }

    pub fn breakpoints(&self) -> &BreakpointTable {
        &self.breakpoints
    }

    pub fn exceptions(&self) -> &ExceptionPolicy {
        &self.exceptions
    }

    pub fn detached(&self) -> bool {
        self.detached.load(SeqCst)
    }

    /// Register a source file the debugger must treat as its own: no
    /// breakpoints, no stepping stops, no stack frames from it.
    pub fn add_dont_debug_file(&self, filename: &str) {
        self.dont_debug.lock().unwrap().push(filename.to_owned());
    }

    pub fn should_debug_code(&self, filename: &str) -> bool {
        !self
            .dont_debug
            .lock()
            .unwrap()
            .iter()
            .any(|f| f == filename)
    }

    pub fn add_detach_callback(&self, callback: Box<dyn Fn() + Send>) {
        self.detach_callbacks.lock().unwrap().push(callback);
    }

    // ------------------------------------------------------------------
    // Sending.

    /// Run `f` with exclusive access to the send half. A failed send means
    /// the front-end is gone: the session detaches and the error stops
    /// here.
    pub fn send<F>(&self, f: F)
    where
        F: FnOnce(&mut MessageWriter<TcpStream>) -> Result<(), WireError>,
    {
        let result = {
            let mut writer = self.conn.sender();
            f(&mut *writer)
        };
        if let Err(err) = result {
            log!(LogWarn, "send to front-end failed ({}); detaching", err);
            self.detach_internal(false);
        }
    }

    pub fn report_new_thread(&self, tid: Tid) {
        self.send(|w| {
            w.write_cmd(wire::NEWT)?;
            w.write_int(tid)
        });
    }

    pub fn report_thread_exit(&self, tid: Tid) {
        self.send(|w| {
            w.write_cmd(wire::EXTT)?;
            w.write_int(tid)
        });
    }

    /// Report the exit code, then wait until the front-end acknowledges
    /// with the `exit` command so the event is not lost to a dying process.
    pub fn report_process_exit(&self, exit_code: i32) {
        self.send(|w| {
            w.write_cmd(wire::EXIT)?;
            w.write_int(exit_code)
        });
        self.exit_wait.acquire();
    }

    /// Called by the command loop when the front-end acknowledges exit.
    pub fn release_exit_wait(&self) {
        self.exit_wait.release();
    }

    pub fn report_exception(&self, exc: &ExceptionRef, tid: Tid) {
        let name = format!("{}.{}", exc.type_module(), exc.type_qualname());
        let text = exc.format();
        self.send(|w| {
            w.write_cmd(wire::EXCP)?;
            w.write_string(Some(&name))?;
            w.write_int(tid)?;
            w.write_string(Some(&text))
        });
    }

    pub fn report_module_load(&self, module: &Module) {
        self.send(|w| {
            w.write_cmd(wire::MODL)?;
            w.write_int(module.module_id)?;
            w.write_string(Some(&module.filename))
        });
    }

    pub fn report_step_finished(&self, tid: Tid) {
        self.send(|w| {
            w.write_cmd(wire::STPD)?;
            w.write_int(tid)
        });
    }

    pub fn report_breakpoint_bound(&self, id: i32) {
        self.send(|w| {
            w.write_cmd(wire::BRKS)?;
            w.write_int(id)
        });
    }

    pub fn report_breakpoint_failed(&self, id: i32) {
        self.send(|w| {
            w.write_cmd(wire::BRKF)?;
            w.write_int(id)
        });
    }

    pub fn report_breakpoint_hit(&self, id: i32, tid: Tid) {
        self.send(|w| {
            w.write_cmd(wire::BRKH)?;
            w.write_int(id)?;
            w.write_int(tid)
        });
    }

    pub fn report_process_loaded(&self, tid: Tid) {
        self.send(|w| {
            w.write_cmd(wire::LOAD)?;
            w.write_int(tid)
        });
    }

    pub fn report_execution_error(&self, exc_text: &str, eid: i32) {
        self.send(|w| {
            w.write_cmd(wire::EXCE)?;
            w.write_int(eid)?;
            w.write_string(Some(exc_text))
        });
    }

    pub fn report_execution_result(&self, eid: i32, result: &ObjectRef) {
        let desc = describe(result);
        self.send(|w| {
            w.write_cmd(wire::EXCR)?;
            w.write_int(eid)?;
            w.write_object(&desc)
        });
    }

    pub fn report_children(&self, eid: i32, children: &ChildList) {
        self.send(|w| {
            w.write_cmd(wire::CHLD)?;
            w.write_int(eid)?;
            w.write_int(children.children.len() as i32)?;
            w.write_int(if children.is_index { 1 } else { 0 })?;
            w.write_int(if children.is_enumerate { 1 } else { 0 })?;
            for (name, desc) in &children.children {
                w.write_string(Some(name))?;
                w.write_object(desc)?;
            }
            Ok(())
        });
    }

    pub fn report_output(&self, tid: Tid, text: &str) {
        self.send(|w| {
            w.write_cmd(wire::OUTP)?;
            w.write_int(tid)?;
            w.write_string(Some(text))
        });
    }

    /// Ask the front-end for the exception-handler ranges of `filename`.
    /// The reply arrives as a `sehi` command.
    pub fn request_handlers(&self, filename: &str) {
        self.send(|w| {
            w.write_cmd(wire::REQH)?;
            w.write_string(Some(filename))
        });
    }

    // ------------------------------------------------------------------
    // Threads.

    /// Create and register the record for a thread, reporting it to the
    /// front-end when attached. With `set_break` the thread parks at its
    /// next trace event (the attach flow).
    pub fn new_thread(
        &self,
        tid: Option<Tid>,
        set_break: bool,
        frame: Option<FrameRef>,
    ) -> Arc<TracedThread> {
        let id = tid.unwrap_or_else(|| self.interp.current_thread_id());
        let thread = TracedThread::new(id);
        thread.set_cur_frame(frame);
        if set_break {
            thread.set_stepping(STEPPING_ATTACH_BREAK);
        }
        self.threads.lock().unwrap().insert(id, thread.clone());
        if !self.detached() {
            self.report_new_thread(id);
        }
        thread
    }

    pub fn get_thread(&self, tid: Tid) -> Option<Arc<TracedThread>> {
        self.threads.lock().unwrap().get(&tid).cloned()
    }

    pub fn remove_thread(&self, tid: Tid) -> Option<Arc<TracedThread>> {
        self.threads.lock().unwrap().remove(&tid)
    }

    fn threads_snapshot(&self) -> Vec<Arc<TracedThread>> {
        self.threads.lock().unwrap().values().cloned().collect()
    }

    /// Build the hook that routes one thread's events into the tracer.
    pub fn make_tracer(self: &Arc<Self>, thread: &Arc<TracedThread>) -> Arc<dyn TraceSink> {
        Arc::new(Tracer {
            thread: thread.clone(),
            session: Arc::downgrade(self),
        })
    }

    pub fn mark_all_threads_for_break(&self) {
        for thread in self.threads_snapshot() {
            thread.set_stepping(STEPPING_BREAK);
        }
    }

    /// Arm the break-all announcement and mark every thread. The next event
    /// on each thread parks it; exactly one emits `ASBR`.
    pub fn arm_break_all(&self) {
        self.send_break_complete.store(true, SeqCst);
        self.mark_all_threads_for_break();
    }

    /// Check-and-clear of the break-all announcement flag. Must only be
    /// called while holding the send lock.
    pub fn take_send_break_complete(&self) -> bool {
        self.send_break_complete.swap(false, SeqCst)
    }

    /// True for the one thread that gets to report the attach break.
    pub fn claim_attach_break(&self) -> bool {
        let mut sent = self.attach_sent_break.lock().unwrap();
        let first = !*sent;
        *sent = true;
        first
    }

    pub fn resume_all(&self) {
        for thread in self.threads_snapshot() {
            let _guard = thread.lock_starting();
            if thread.is_blocked() {
                if thread.stepping() == STEPPING_BREAK {
                    thread.set_stepping(STEPPING_NONE);
                }
                thread.unblock();
            }
        }
    }

    /// Send a stack snapshot for every thread that has not parked yet, so a
    /// break-all gives the front-end a full picture immediately. Threads
    /// that park later resend their own, possibly more accurate, list.
    pub fn update_all_thread_stacks(&self, blocking_tid: Tid) {
        for thread in self.threads_snapshot() {
            if thread.id == blocking_tid {
                continue;
            }
            let guard = thread.lock_starting();
            if !thread.is_blocked() {
                // Collecting frames runs user-object accessors; do not hold
                // the flag lock across that.
                drop(guard);
                let frames = thread.get_frame_list(self);
                let _guard = thread.lock_starting();
                if !thread.is_blocked() {
                    thread.send_frame_list(self, &frames, None);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Modules.

    pub fn any_module_loaded(&self) -> bool {
        !self.modules.lock().unwrap().is_empty()
    }

    pub fn modules_snapshot(&self) -> Vec<(String, Module)> {
        self.modules.lock().unwrap().clone()
    }

    /// Allocate the record for a newly observed module frame.
    pub fn new_module(&self, code_filename: &str) -> Module {
        let module = Module {
            module_id: self.module_index.fetch_add(1, SeqCst),
            filename: canonical_file(code_filename),
        };
        self.modules
            .lock()
            .unwrap()
            .push((code_filename.to_owned(), module.clone()));
        module
    }

    /// Bind every pending breakpoint whose file this module resolves.
    pub fn bind_pending_breakpoints(&self, module: &Module) {
        for bp in self.breakpoints.take_pending_for(&module.filename) {
            let condition = if bp.condition.is_empty() {
                None
            } else {
                Some(ConditionInfo::new(bp.condition.clone(), bp.break_when_changed))
            };
            self.breakpoints.add(&bp.filename, bp.line, bp.id, condition);
            self.report_breakpoint_bound(bp.id);
        }
    }

    // ------------------------------------------------------------------
    // Output redirection.

    pub fn redirect_output(self: &Arc<Self>) {
        let stdout_inner = Arc::new(OutputInner {
            session: Arc::downgrade(self),
            is_stdout: true,
            old: Mutex::new(None),
        });
        let old = self.interp.swap_stdout(Box::new(DebuggerOutput {
            inner: stdout_inner.clone(),
        }));
        *stdout_inner.old.lock().unwrap() = Some(old);
        self.redirected.lock().unwrap().push(stdout_inner);

        let stderr_inner = Arc::new(OutputInner {
            session: Arc::downgrade(self),
            is_stdout: false,
            old: Mutex::new(None),
        });
        let old = self.interp.swap_stderr(Box::new(DebuggerOutput {
            inner: stderr_inner.clone(),
        }));
        *stderr_inner.old.lock().unwrap() = Some(old);
        self.redirected.lock().unwrap().push(stderr_inner);
    }

    fn restore_output(&self) {
        let redirected: Vec<Arc<OutputInner>> =
            self.redirected.lock().unwrap().drain(..).collect();
        for inner in redirected {
            if let Some(old) = inner.old.lock().unwrap().take() {
                // Hand the original sink back; our wrapper is dropped by
                // the interpreter.
                if inner.is_stdout {
                    drop(self.interp.swap_stdout(old));
                } else {
                    drop(self.interp.swap_stderr(old));
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Thread interception.

    /// Route new interpreter threads through the debugger so they are
    /// traced from their first instruction.
    pub fn intercept_threads(self: &Arc<Self>, for_attach: bool) {
        self.intercepting_for_attach.store(for_attach, SeqCst);
        self.interp.intercept_spawn(Arc::new(SessionSpawnHook {
            session: Arc::downgrade(self),
        }));
    }

    // ------------------------------------------------------------------
    // Detach.

    /// Front-end-requested detach.
    pub fn detach(&self) {
        self.detach_internal(true);
    }

    fn detach_internal(&self, emit_detc: bool) {
        if self.detaching.swap(true, SeqCst) {
            return;
        }
        log!(LogDebug, "detaching from front-end");
        self.detach_threads();
        if emit_detc {
            // Best effort: the peer may already be gone.
            let mut writer = self.conn.sender();
            let _ = writer.write_cmd(wire::DETC);
        }
        self.detach_process();
        let callbacks = self.detach_callbacks.lock().unwrap();
        for callback in callbacks.iter() {
            callback();
        }
    }

    /// Flip every traced thread into pass-through mode and wake the parked
    /// ones so they notice.
    fn detach_threads(&self) {
        let intercepting = self.intercepting_for_attach.load(SeqCst);
        for thread in self.threads_snapshot() {
            if !intercepting {
                thread.mark_detached();
                thread.set_stepping(STEPPING_BREAK);
            }
            if thread.is_blocked() {
                thread.unblock();
            }
        }
        if !intercepting {
            self.threads.lock().unwrap().clear();
        }
        self.breakpoints.clear();
    }

    fn detach_process(&self) {
        self.detached.store(true, SeqCst);
        // Nobody will answer in-flight handler requests or the exit wait.
        self.exceptions.abort_requests();
        self.exit_wait.release();
        if !self.intercepting_for_attach.load(SeqCst) {
            self.restore_output();
            self.interp.restore_spawn();
        }
    }

    // ------------------------------------------------------------------
    // Unhandled-exception printing.

    /// Render a traceback for an uncaught exception with the debugger's
    /// own frames stripped out.
    pub fn format_exception(&self, exc: &ExceptionRef) -> String {
        let mut entries = Vec::new();
        let mut tb = exc.traceback();
        while let Some(entry) = tb {
            let frame = entry.frame();
            let code = frame.code();
            if self.should_debug_code(&code.filename()) {
                entries.push(format!(
                    "  File \"{}\", line {}, in {}",
                    code.filename(),
                    frame.lineno(),
                    code.name()
                ));
            }
            tb = entry.next();
        }

        let mut text = String::new();
        if !entries.is_empty() {
            text.push_str("Traceback (most recent call last):\n");
            for entry in entries {
                text.push_str(&entry);
                text.push('\n');
            }
        }
        text.push_str(&exc.exception_only());
        text.push('\n');
        text
    }

    pub fn print_exception(&self, exc: &ExceptionRef) {
        let mut out = io::stdout();
        let _ = out.write_all(self.format_exception(exc).as_bytes());
    }
}

/// Wraps the body of every newly spawned interpreter thread while the
/// debugger is attached: register the thread, install its tracer, and
/// deregister with a thread-exit event when the body finishes.
pub struct SessionSpawnHook {
    session: Weak<Session>,
}

impl SpawnHook for SessionSpawnHook {
    fn wrap(&self, body: Box<dyn FnOnce() + Send>) {
        let session = match self.session.upgrade() {
            Some(session) => session,
            None => {
                body();
                return;
            }
        };

        let thread = session.new_thread(None, false, None);
        let tracer = session.make_tracer(&thread);
        let prev = session.interp.install_trace(tracer);
        thread.set_prev_trace(prev);

        let outcome = panic::catch_unwind(AssertUnwindSafe(body));

        session.interp.clear_trace();
        if !thread.is_marked_detached() {
            session.remove_thread(thread.id);
            session.report_thread_exit(thread.id);
        }

        if let Err(payload) = outcome {
            panic::resume_unwind(payload);
        }
    }
}

// ----------------------------------------------------------------------
// Entrypoints.

/// Open the connection to the front-end at `127.0.0.1:port`, send the
/// debug-id handshake and start the command loop. With
/// `report_and_block`, also register every pre-existing interpreter thread
/// (they park at their next trace event), report already-imported modules,
/// and park the calling thread with a process-loaded event until the
/// front-end resumes it.
pub fn attach_process(
    interp: Arc<dyn Interp>,
    port: u16,
    debug_id: &str,
    report_and_block: bool,
) -> io::Result<Arc<Session>> {
    let (conn, reader) = Connection::connect(port)?;
    let session = Session::new(interp, conn);
    // The debugger's own glue files are off limits before any tracing
    // starts: no stops in them, no frames from them.
    for file in session.interp.debugger_files() {
        session.add_dont_debug_file(&file);
    }
    session.send(|w| w.write_string(Some(debug_id)));
    DebuggerLoop::spawn(session.clone(), reader);

    if report_and_block {
        let current = session.interp.current_thread_id();
        let mut main_thread = None;
        for (tid, frame) in session.interp.existing_threads() {
            let is_current = tid == current;
            let thread = session.new_thread(Some(tid), !is_current, frame);
            if is_current {
                main_thread = Some(thread);
            }
        }
        let main_thread = match main_thread {
            Some(thread) => thread,
            None => session.new_thread(None, false, None),
        };

        for file in session.interp.loaded_modules() {
            let module = session.new_module(&file);
            session.report_module_load(&module);
        }

        let tid = main_thread.id;
        let s = session.clone();
        main_thread.block(&session, move || s.report_process_loaded(tid));
    } else {
        // Known modules still count for breakpoint binding and the
        // launch-break gate, they are just not announced.
        for file in session.interp.loaded_modules() {
            session.new_module(&file);
        }
    }

    if !session.intercepting_for_attach.load(SeqCst) {
        session.intercept_threads(false);
    }
    Ok(session)
}

/// Launch-mode entrypoint: attach, optionally redirect output, trace the
/// calling thread with a launch break armed, run `file`, and report the
/// process exit. Returns the exit code.
pub fn debug(
    interp: Arc<dyn Interp>,
    file: &str,
    port: u16,
    debug_id: &str,
    globals: &ObjectRef,
    locals: &ObjectRef,
    flags: &DebugFlags,
) -> io::Result<i32> {
    let session = attach_process(interp.clone(), port, debug_id, false)?;

    if flags.redirect_output {
        session.redirect_output();
    }

    let thread = session.new_thread(None, false, None);
    thread.set_stepping(STEPPING_LAUNCH_BREAK);
    let tracer = session.make_tracer(&thread);
    let prev = interp.install_trace(tracer);
    thread.set_prev_trace(prev);

    let outcome = interp.run_file(file, globals, locals);

    interp.clear_trace();
    if !thread.is_marked_detached() {
        session.remove_thread(thread.id);
        session.report_thread_exit(thread.id);
    }

    match outcome {
        RunOutcome::Finished => {
            if flags.wait_on_exit {
                do_wait();
            }
            session.report_process_exit(0);
            Ok(0)
        }
        RunOutcome::Exited(code) => {
            session.report_process_exit(code);
            if flags.wait_on_exception && code != 0 {
                do_wait();
            }
            Ok(code)
        }
        RunOutcome::Uncaught(exc) => {
            session.print_exception(&exc);
            if flags.wait_on_exception {
                do_wait();
            }
            session.report_process_exit(1);
            Ok(1)
        }
    }
}

fn do_wait() {
    let mut out = io::stdout();
    let _ = write!(out, "Press any key to continue . . . ");
    let _ = out.flush();
    let _ = io::stdin().read(&mut [0u8; 1]);
}
