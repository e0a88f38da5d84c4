//! The contract the host interpreter provides to the debugger.
//!
//! The interpreter owns frames, scopes and objects; the debugger only ever
//! sees them through the object-safe traits below. Events are delivered
//! synchronously on the thread that produced them, and a frame or object
//! handle stays valid for as long as the debugger holds a reference to it.
//! All handles are shareable across threads because the command loop reads
//! frames of a parked thread and the break-all fan-out snapshots frames of
//! running ones.

use std::fmt;
use std::io::Write;
use std::sync::Arc;

/// Identifies one OS thread of the host. Matches what the interpreter
/// reports for the thread an event arrived on.
pub type Tid = libc::pid_t;

pub type FrameRef = Arc<dyn Frame>;
pub type CodeRef = Arc<dyn Code>;
pub type ObjectRef = Arc<dyn Object>;
pub type ExceptionRef = Arc<dyn Exception>;
pub type TracebackRef = Arc<dyn Traceback>;

/// One trace event. The `c_*` events exist because some hosts report calls
/// into native code; the debugger ignores them.
#[derive(Clone)]
pub enum TraceEvent {
    Call,
    Line,
    Return,
    Exception(ExceptionRef),
    CCall,
    CReturn,
    CException,
}

impl fmt::Debug for TraceEvent {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            TraceEvent::Call => "call",
            TraceEvent::Line => "line",
            TraceEvent::Return => "return",
            TraceEvent::Exception(_) => "exception",
            TraceEvent::CCall => "c_call",
            TraceEvent::CReturn => "c_return",
            TraceEvent::CException => "c_exception",
        };
        f.write_str(name)
    }
}

/// Failure from compiling or evaluating user text in a frame. The message is
/// what the front-end gets to see; it never propagates further.
#[derive(Clone, Debug)]
pub struct EvalError {
    pub text: String,
}

impl EvalError {
    pub fn new<S: Into<String>>(text: S) -> EvalError {
        EvalError { text: text.into() }
    }
}

/// A code object: the static half of a frame.
pub trait Code: Send + Sync {
    /// The function name; `<module>` for module toplevel.
    fn name(&self) -> String;

    /// Absolute path of the source file, or a pseudo name such as
    /// `<string>` for source-less code.
    fn filename(&self) -> String;

    /// First source line of the code object.
    fn first_lineno(&self) -> i32;

    fn arg_count(&self) -> i32;

    /// Declared variable names, used for frames whose locals are distinct
    /// from their globals.
    fn var_names(&self) -> Vec<String>;

    /// Signed per-statement line increments from the code's line-number
    /// table. Summing them onto `first_lineno` yields the last line.
    fn line_deltas(&self) -> Vec<i8>;
}

/// One activation record. `Send + Sync` because the command loop walks the
/// chain of a parked thread and mutates the current line on `setl`.
pub trait Frame: Send + Sync {
    fn code(&self) -> CodeRef;

    /// The line currently executing in this frame.
    fn lineno(&self) -> i32;

    /// Try to move execution of this frame to `line`. Returns the resulting
    /// line on success; hosts reject jumps they cannot express.
    fn set_lineno(&self, line: i32) -> Result<i32, EvalError>;

    /// Parent frame, or `None` at the bottom of the stack.
    fn back(&self) -> Option<FrameRef>;

    /// True when this frame executes with its globals as its locals
    /// (module toplevel).
    fn locals_are_globals(&self) -> bool;

    /// Keys of the global scope, used instead of declared names when
    /// `locals_are_globals` holds.
    fn global_names(&self) -> Vec<String>;

    /// Look one name up in the frame's locals.
    fn get_local(&self, name: &str) -> Option<ObjectRef>;

    /// Compile `text` as an expression (falling back to statement execution)
    /// and evaluate it in this frame's scopes.
    fn eval(&self, text: &str) -> Result<ObjectRef, EvalError>;

    /// Resolve a dotted name: the head in locals, then globals, then the
    /// frame's builtins, remaining segments by attribute access.
    fn resolve_name(&self, dotted: &str) -> Option<ObjectRef>;
}

/// A value handle. Every accessor that runs host code is fallible or
/// optional; the debugger substitutes placeholders rather than propagate.
pub trait Object: Send + Sync {
    fn repr(&self) -> Result<String, EvalError>;

    /// Hexadecimal rendering for integral values, `None` otherwise.
    fn hex_repr(&self) -> Option<String>;

    fn type_name(&self) -> String;

    fn len(&self) -> Option<usize>;

    /// True for the fixed leaf set: integers, booleans, strings, floats,
    /// none and plain objects. Leaf values are never expandable.
    fn is_leaf_type(&self) -> bool;

    fn is_truthy(&self) -> bool;

    /// Value equality, used by change-triggered breakpoint conditions.
    fn equals(&self, other: &dyn Object) -> bool;

    /// A token identifying the underlying host object, used to detect
    /// whether indexing returned the same object iteration produced.
    fn identity(&self) -> usize;

    fn is_generator(&self) -> bool;

    /// Key/value pairs for mapping-like objects, `None` otherwise.
    fn items(&self) -> Option<Vec<(ObjectRef, ObjectRef)>>;

    /// The values produced by iterating, `None` when not iterable.
    fn iterate(&self) -> Option<Vec<ObjectRef>>;

    /// `self[index]`, `None` when unsupported or out of range.
    fn index(&self, index: usize) -> Option<ObjectRef>;

    fn attr_names(&self) -> Vec<String>;

    fn get_attr(&self, name: &str) -> Option<ObjectRef>;

    fn is_callable(&self) -> bool;
}

/// A raised exception together with its traceback.
pub trait Exception: Send + Sync {
    /// Module of the exception type, e.g. `builtins`.
    fn type_module(&self) -> String;

    /// Name of the exception type within its module.
    fn type_qualname(&self) -> String;

    /// The full formatted traceback, as the host would print it.
    fn format(&self) -> String;

    /// The "TypeName: message" line alone.
    fn exception_only(&self) -> String;

    fn traceback(&self) -> Option<TracebackRef>;

    /// Whether the raised type is a subtype of `ty`.
    fn is_subtype_of(&self, ty: &ObjectRef) -> bool;
}

pub trait Traceback: Send + Sync {
    fn frame(&self) -> FrameRef;

    /// The next (inner) traceback entry, if the exception has already
    /// propagated through further frames.
    fn next(&self) -> Option<TracebackRef>;
}

/// A predecessor trace hook that was installed before the debugger's.
/// Mirrors the host convention where the hook invoked for a `call` returns
/// the hook to use for the new frame.
pub struct TraceFn(pub Box<dyn FnMut(&FrameRef, &TraceEvent) -> Option<TraceFn> + Send>);

impl TraceFn {
    pub fn call(&mut self, frame: &FrameRef, event: &TraceEvent) -> Option<TraceFn> {
        (self.0)(frame, event)
    }
}

/// Installed into the host for one thread; the host calls it on every event
/// that thread produces.
pub trait TraceSink: Send + Sync {
    fn trace(&self, frame: &FrameRef, event: TraceEvent);
}

/// Runs a thread body on a freshly spawned interpreter thread while the
/// debugger is intercepting thread creation.
pub trait SpawnHook: Send + Sync {
    fn wrap(&self, body: Box<dyn FnOnce() + Send>);
}

/// How running the main file ended.
pub enum RunOutcome {
    Finished,
    /// The program requested exit with this code.
    Exited(i32),
    /// An exception reached the toplevel.
    Uncaught(ExceptionRef),
}

/// Process-wide interpreter services.
pub trait Interp: Send + Sync {
    fn current_thread_id(&self) -> Tid;

    fn current_thread_name(&self) -> Option<String>;

    /// Threads that were already running before the debugger attached,
    /// with their topmost frame where the host knows it.
    fn existing_threads(&self) -> Vec<(Tid, Option<FrameRef>)>;

    /// Absolute source files of every module imported so far.
    fn loaded_modules(&self) -> Vec<String>;

    /// Source files of the debugger's own in-interpreter glue (bootstrap
    /// and launcher code). The debugger never breaks in these and strips
    /// their frames from reported stacks.
    fn debugger_files(&self) -> Vec<String>;

    /// True for files belonging to the interpreter's own library tree;
    /// stepping never stops inside those.
    fn is_internal_file(&self, filename: &str) -> bool;

    /// Install `sink` as the trace hook of the calling thread, returning a
    /// hook that was installed before, if any.
    fn install_trace(&self, sink: Arc<dyn TraceSink>) -> Option<TraceFn>;

    /// Remove the calling thread's trace hook.
    fn clear_trace(&self);

    /// Route every newly spawned interpreter thread through `hook` so it is
    /// traced from its first instruction.
    fn intercept_spawn(&self, hook: Arc<dyn SpawnHook>);

    /// Restore the original spawn primitive.
    fn restore_spawn(&self);

    /// Swap the interpreter-level stdout sink, returning the previous one.
    fn swap_stdout(&self, sink: Box<dyn Write + Send>) -> Box<dyn Write + Send>;

    /// Swap the interpreter-level stderr sink, returning the previous one.
    fn swap_stderr(&self, sink: Box<dyn Write + Send>) -> Box<dyn Write + Send>;

    /// Execute `file` in the given global/local scopes on the calling
    /// thread, delivering trace events along the way.
    fn run_file(&self, file: &str, globals: &ObjectRef, locals: &ObjectRef) -> RunOutcome;
}
