//! Shared harness for the integration tests: a scripted mock interpreter
//! implementing the host contract, and a front-end driver speaking the wire
//! protocol over a real loopback connection.

#![allow(dead_code)]

use rdb::interp::Code;
use rdb::interp::CodeRef;
use rdb::interp::EvalError;
use rdb::interp::Exception;
use rdb::interp::ExceptionRef;
use rdb::interp::Frame;
use rdb::interp::FrameRef;
use rdb::interp::Interp;
use rdb::interp::Object;
use rdb::interp::ObjectRef;
use rdb::interp::RunOutcome;
use rdb::interp::SpawnHook;
use rdb::interp::Tid;
use rdb::interp::TraceEvent;
use rdb::interp::TraceFn;
use rdb::interp::TraceSink;
use rdb::interp::Traceback;
use rdb::interp::TracebackRef;
use rdb::session::attach_process;
use rdb::session::Session;
use rdb::wire::MessageReader;
use std::cell::Cell;
use std::collections::HashMap;
use std::collections::HashSet;
use std::io;
use std::io::Write;
use std::net::TcpListener;
use std::net::TcpStream;
use std::sync::atomic::AtomicI32;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::Weak;
use std::thread;
use std::time::Duration;

// ----------------------------------------------------------------------
// Thread identity for the mock host.

static NEXT_TID: AtomicI32 = AtomicI32::new(1001);

thread_local! {
    static MOCK_TID: Cell<Option<Tid>> = Cell::new(None);
}

pub fn current_tid() -> Tid {
    MOCK_TID.with(|cell| match cell.get() {
        Some(tid) => tid,
        None => {
            let tid = NEXT_TID.fetch_add(1, SeqCst);
            cell.set(Some(tid));
            tid
        }
    })
}

// ----------------------------------------------------------------------
// The mock object model.

pub type Value = Arc<Val>;

pub enum Val {
    Int(i64),
    Bool(bool),
    Str(String),
    NoneV,
    List(Vec<Value>),
    Dict(Vec<(Value, Value)>),
    Gen,
    /// A type object, e.g. an exception class handler expressions resolve to.
    Type(String),
    Obj {
        type_name: String,
        attrs: Vec<(String, Value)>,
    },
    Func,
}

pub fn int(n: i64) -> Value {
    Arc::new(Val::Int(n))
}

pub fn boolean(b: bool) -> Value {
    Arc::new(Val::Bool(b))
}

pub fn string(s: &str) -> Value {
    Arc::new(Val::Str(s.to_owned()))
}

pub fn none() -> Value {
    Arc::new(Val::NoneV)
}

pub fn list(values: Vec<Value>) -> Value {
    Arc::new(Val::List(values))
}

pub fn dict(pairs: Vec<(Value, Value)>) -> Value {
    Arc::new(Val::Dict(pairs))
}

pub fn generator() -> Value {
    Arc::new(Val::Gen)
}

pub fn type_object(qualified: &str) -> Value {
    Arc::new(Val::Type(qualified.to_owned()))
}

fn val_repr(val: &Val) -> String {
    match val {
        Val::Int(n) => n.to_string(),
        Val::Bool(true) => "True".to_owned(),
        Val::Bool(false) => "False".to_owned(),
        Val::Str(s) => format!("'{}'", s),
        Val::NoneV => "None".to_owned(),
        Val::List(items) => {
            let inner: Vec<String> = items.iter().map(|v| val_repr(v)).collect();
            format!("[{}]", inner.join(", "))
        }
        Val::Dict(pairs) => {
            let inner: Vec<String> = pairs
                .iter()
                .map(|(k, v)| format!("{}: {}", val_repr(k), val_repr(v)))
                .collect();
            format!("{{{}}}", inner.join(", "))
        }
        Val::Gen => "<generator object>".to_owned(),
        Val::Type(name) => format!("<class '{}'>", name),
        Val::Obj { type_name, .. } => format!("<{} object>", type_name),
        Val::Func => "<function>".to_owned(),
    }
}

fn val_eq(a: &Value, b: &Value) -> bool {
    match (&**a, &**b) {
        (Val::Int(x), Val::Int(y)) => x == y,
        (Val::Bool(x), Val::Bool(y)) => x == y,
        (Val::Str(x), Val::Str(y)) => x == y,
        (Val::NoneV, Val::NoneV) => true,
        _ => Arc::ptr_eq(a, b),
    }
}

pub struct MockObject(pub Value);

pub fn obj(value: &Value) -> ObjectRef {
    Arc::new(MockObject(value.clone()))
}

impl Object for MockObject {
    fn repr(&self) -> Result<String, EvalError> {
        Ok(val_repr(&self.0))
    }

    fn hex_repr(&self) -> Option<String> {
        match &*self.0 {
            Val::Int(n) => Some(format!("{:#x}", n)),
            _ => None,
        }
    }

    fn type_name(&self) -> String {
        match &*self.0 {
            Val::Int(_) => "int".to_owned(),
            Val::Bool(_) => "bool".to_owned(),
            Val::Str(_) => "str".to_owned(),
            Val::NoneV => "NoneType".to_owned(),
            Val::List(_) => "list".to_owned(),
            Val::Dict(_) => "dict".to_owned(),
            Val::Gen => "generator".to_owned(),
            Val::Type(_) => "type".to_owned(),
            Val::Obj { type_name, .. } => type_name.clone(),
            Val::Func => "function".to_owned(),
        }
    }

    fn len(&self) -> Option<usize> {
        match &*self.0 {
            Val::Str(s) => Some(s.len()),
            Val::List(items) => Some(items.len()),
            Val::Dict(pairs) => Some(pairs.len()),
            _ => None,
        }
    }

    fn is_leaf_type(&self) -> bool {
        match &*self.0 {
            Val::Int(_) | Val::Bool(_) | Val::Str(_) | Val::NoneV => true,
            _ => false,
        }
    }

    fn is_truthy(&self) -> bool {
        match &*self.0 {
            Val::Int(n) => *n != 0,
            Val::Bool(b) => *b,
            Val::Str(s) => !s.is_empty(),
            Val::NoneV => false,
            Val::List(items) => !items.is_empty(),
            Val::Dict(pairs) => !pairs.is_empty(),
            _ => true,
        }
    }

    fn equals(&self, other: &dyn Object) -> bool {
        // The mock never mixes object models in one session.
        match other.repr() {
            Ok(r) => r == val_repr(&self.0) && other.type_name() == self.type_name(),
            Err(_) => false,
        }
    }

    fn identity(&self) -> usize {
        Arc::as_ptr(&self.0) as *const () as usize
    }

    fn is_generator(&self) -> bool {
        match &*self.0 {
            Val::Gen => true,
            _ => false,
        }
    }

    fn items(&self) -> Option<Vec<(ObjectRef, ObjectRef)>> {
        match &*self.0 {
            Val::Dict(pairs) => Some(
                pairs
                    .iter()
                    .map(|(k, v)| (obj(k), obj(v)))
                    .collect(),
            ),
            _ => None,
        }
    }

    fn iterate(&self) -> Option<Vec<ObjectRef>> {
        match &*self.0 {
            Val::List(items) => Some(items.iter().map(|v| obj(v)).collect()),
            _ => None,
        }
    }

    fn index(&self, index: usize) -> Option<ObjectRef> {
        match &*self.0 {
            Val::List(items) => items.get(index).map(|v| obj(v)),
            _ => None,
        }
    }

    fn attr_names(&self) -> Vec<String> {
        match &*self.0 {
            Val::Obj { attrs, .. } => attrs.iter().map(|(n, _)| n.clone()).collect(),
            _ => Vec::new(),
        }
    }

    fn get_attr(&self, name: &str) -> Option<ObjectRef> {
        match &*self.0 {
            Val::Obj { attrs, .. } => attrs
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, v)| obj(v)),
            _ => None,
        }
    }

    fn is_callable(&self) -> bool {
        match &*self.0 {
            Val::Func | Val::Type(_) => true,
            _ => false,
        }
    }
}

// ----------------------------------------------------------------------
// Code objects and frames.

pub struct MockCode {
    pub name: String,
    pub filename: String,
    pub first_lineno: i32,
    pub arg_count: i32,
    pub var_names: Vec<String>,
    pub line_deltas: Vec<i8>,
}

impl Code for MockCode {
    fn name(&self) -> String {
        self.name.clone()
    }
    fn filename(&self) -> String {
        self.filename.clone()
    }
    fn first_lineno(&self) -> i32 {
        self.first_lineno
    }
    fn arg_count(&self) -> i32 {
        self.arg_count
    }
    fn var_names(&self) -> Vec<String> {
        self.var_names.clone()
    }
    fn line_deltas(&self) -> Vec<i8> {
        self.line_deltas.clone()
    }
}

pub type Scope = Arc<Mutex<Vec<(String, Value)>>>;

pub fn scope() -> Scope {
    Arc::new(Mutex::new(Vec::new()))
}

fn scope_get(scope: &Scope, name: &str) -> Option<Value> {
    scope
        .lock()
        .unwrap()
        .iter()
        .find(|(n, _)| n == name)
        .map(|(_, v)| v.clone())
}

fn scope_set(scope: &Scope, name: &str, value: Value) {
    let mut guard = scope.lock().unwrap();
    for entry in guard.iter_mut() {
        if entry.0 == name {
            entry.1 = value;
            return;
        }
    }
    guard.push((name.to_owned(), value));
}

pub struct MockFrame {
    pub code: Arc<MockCode>,
    pub line: AtomicI32,
    pub back: Option<Arc<MockFrame>>,
    pub locals: Scope,
    pub globals: Scope,
    pub locals_are_globals: bool,
    /// Lines a `setl` jump may land on; empty means any line is accepted.
    pub settable_lines: Mutex<HashSet<i32>>,
}

impl MockFrame {
    pub fn module(filename: &str, globals: Scope) -> Arc<MockFrame> {
        Arc::new(MockFrame {
            code: Arc::new(MockCode {
                name: "<module>".to_owned(),
                filename: filename.to_owned(),
                first_lineno: 1,
                arg_count: 0,
                var_names: Vec::new(),
                line_deltas: Vec::new(),
            }),
            line: AtomicI32::new(1),
            back: None,
            locals: globals.clone(),
            globals,
            locals_are_globals: true,
            settable_lines: Mutex::new(HashSet::new()),
        })
    }

    pub fn func(
        name: &str,
        filename: &str,
        first_lineno: i32,
        var_names: Vec<String>,
        back: Arc<MockFrame>,
    ) -> Arc<MockFrame> {
        let globals = back.globals.clone();
        Arc::new(MockFrame {
            code: Arc::new(MockCode {
                name: name.to_owned(),
                filename: filename.to_owned(),
                first_lineno,
                arg_count: 0,
                var_names,
                line_deltas: Vec::new(),
            }),
            line: AtomicI32::new(first_lineno),
            back: Some(back),
            locals: scope(),
            globals,
            locals_are_globals: false,
            settable_lines: Mutex::new(HashSet::new()),
        })
    }

    fn lookup(&self, name: &str) -> Option<Value> {
        scope_get(&self.locals, name).or_else(|| scope_get(&self.globals, name))
    }
}

impl Frame for MockFrame {
    fn code(&self) -> CodeRef {
        self.code.clone()
    }

    fn lineno(&self) -> i32 {
        self.line.load(SeqCst)
    }

    fn set_lineno(&self, line: i32) -> Result<i32, EvalError> {
        let allowed = {
            let settable = self.settable_lines.lock().unwrap();
            settable.is_empty() || settable.contains(&line)
        };
        if !allowed || line < self.code.first_lineno {
            return Err(EvalError::new("line is not a valid jump target"));
        }
        self.line.store(line, SeqCst);
        Ok(line)
    }

    fn back(&self) -> Option<FrameRef> {
        match &self.back {
            Some(frame) => {
                let frame: FrameRef = frame.clone();
                Some(frame)
            }
            None => None,
        }
    }

    fn locals_are_globals(&self) -> bool {
        self.locals_are_globals
    }

    fn global_names(&self) -> Vec<String> {
        self.globals
            .lock()
            .unwrap()
            .iter()
            .map(|(n, _)| n.clone())
            .collect()
    }

    fn get_local(&self, name: &str) -> Option<ObjectRef> {
        scope_get(&self.locals, name).map(|v| obj(&v))
    }

    fn eval(&self, text: &str) -> Result<ObjectRef, EvalError> {
        let text = text.trim();
        if let Ok(n) = text.parse::<i64>() {
            return Ok(obj(&int(n)));
        }
        if let Some(plus) = text.find('+') {
            let left = text[..plus].trim();
            let right = text[plus + 1..].trim();
            let lhs = match self.lookup(left) {
                Some(v) => v,
                None => return Err(EvalError::new(format!("name '{}' is not defined", left))),
            };
            let rhs: i64 = right
                .parse()
                .map_err(|_| EvalError::new("unsupported operand"))?;
            return match &*lhs {
                Val::Int(n) => Ok(obj(&int(n + rhs))),
                _ => Err(EvalError::new("unsupported operand type for +")),
            };
        }
        match self.lookup(text) {
            Some(v) => Ok(obj(&v)),
            None => Err(EvalError::new(format!("name '{}' is not defined", text))),
        }
    }

    fn resolve_name(&self, dotted: &str) -> Option<ObjectRef> {
        let mut parts = dotted.split('.');
        let head = parts.next()?;
        let mut value = self.lookup(head)?;
        for part in parts {
            let attrs = match &*value {
                Val::Obj { attrs, .. } => attrs.clone(),
                _ => return None,
            };
            value = attrs.iter().find(|(n, _)| n == part)?.1.clone();
        }
        Some(obj(&value))
    }
}

// ----------------------------------------------------------------------
// Exceptions.

pub struct MockExc {
    pub module: String,
    pub name: String,
    pub message: String,
    /// Qualified names of the type and all its ancestors.
    pub ancestors: Vec<String>,
    pub tb: Mutex<Option<TracebackRef>>,
}

impl MockExc {
    pub fn new(module: &str, name: &str, message: &str) -> MockExc {
        MockExc {
            module: module.to_owned(),
            name: name.to_owned(),
            message: message.to_owned(),
            ancestors: vec![format!("{}.{}", module, name)],
            tb: Mutex::new(None),
        }
    }

    pub fn with_ancestor(mut self, qualified: &str) -> MockExc {
        self.ancestors.push(qualified.to_owned());
        self
    }
}

impl Exception for MockExc {
    fn type_module(&self) -> String {
        self.module.clone()
    }

    fn type_qualname(&self) -> String {
        self.name.clone()
    }

    fn format(&self) -> String {
        format!(
            "Traceback (most recent call last):\n{}.{}: {}\n",
            self.module, self.name, self.message
        )
    }

    fn exception_only(&self) -> String {
        format!("{}.{}: {}", self.module, self.name, self.message)
    }

    fn traceback(&self) -> Option<TracebackRef> {
        self.tb.lock().unwrap().clone()
    }

    fn is_subtype_of(&self, ty: &ObjectRef) -> bool {
        match ty.repr() {
            Ok(repr) => self
                .ancestors
                .iter()
                .any(|a| repr == format!("<class '{}'>", a)),
            Err(_) => false,
        }
    }
}

pub struct MockTraceback {
    pub frame: FrameRef,
    pub next: Option<TracebackRef>,
}

impl Traceback for MockTraceback {
    fn frame(&self) -> FrameRef {
        self.frame.clone()
    }

    fn next(&self) -> Option<TracebackRef> {
        self.next.clone()
    }
}

// ----------------------------------------------------------------------
// The mock interpreter.

type Program = Arc<dyn Fn(&FrameCtx) + Send + Sync>;

struct SinkTable {
    sinks: HashMap<Tid, Arc<dyn TraceSink>>,
}

pub struct MockInterp {
    weak_self: Mutex<Weak<MockInterp>>,
    sinks: Mutex<SinkTable>,
    spawn_hook: Mutex<Option<Arc<dyn SpawnHook>>>,
    thread_names: Mutex<HashMap<Tid, String>>,
    existing: Mutex<Vec<(Tid, Option<FrameRef>)>>,
    loaded: Mutex<Vec<String>>,
    debugger_files: Mutex<Vec<String>>,
    internal_files: Mutex<HashSet<String>>,
    programs: Mutex<HashMap<String, Program>>,
    stdout: Mutex<Box<dyn Write + Send>>,
    stderr: Mutex<Box<dyn Write + Send>>,
}

impl MockInterp {
    pub fn new() -> Arc<MockInterp> {
        let interp = Arc::new(MockInterp {
            weak_self: Mutex::new(Weak::new()),
            sinks: Mutex::new(SinkTable {
                sinks: HashMap::new(),
            }),
            spawn_hook: Mutex::new(None),
            thread_names: Mutex::new(HashMap::new()),
            existing: Mutex::new(Vec::new()),
            loaded: Mutex::new(Vec::new()),
            debugger_files: Mutex::new(Vec::new()),
            internal_files: Mutex::new(HashSet::new()),
            programs: Mutex::new(HashMap::new()),
            stdout: Mutex::new(Box::new(io::sink())),
            stderr: Mutex::new(Box::new(io::sink())),
        });
        *interp.weak_self.lock().unwrap() = Arc::downgrade(&interp);
        interp
    }

    fn strong(&self) -> Arc<MockInterp> {
        self.weak_self.lock().unwrap().upgrade().unwrap()
    }

    pub fn name_current_thread(&self, name: &str) {
        self.thread_names
            .lock()
            .unwrap()
            .insert(current_tid(), name.to_owned());
    }

    pub fn add_loaded_module(&self, filename: &str) {
        self.loaded.lock().unwrap().push(filename.to_owned());
    }

    pub fn add_existing_thread(&self, tid: Tid, frame: Option<FrameRef>) {
        self.existing.lock().unwrap().push((tid, frame));
    }

    pub fn add_debugger_file(&self, filename: &str) {
        self.debugger_files
            .lock()
            .unwrap()
            .push(filename.to_owned());
    }

    pub fn add_internal_file(&self, filename: &str) {
        self.internal_files
            .lock()
            .unwrap()
            .insert(filename.to_owned());
    }

    pub fn set_stdout(&self, sink: Box<dyn Write + Send>) {
        *self.stdout.lock().unwrap() = sink;
    }

    pub fn register_program<F>(&self, file: &str, body: F)
    where
        F: Fn(&FrameCtx) + Send + Sync + 'static,
    {
        self.programs
            .lock()
            .unwrap()
            .insert(file.to_owned(), Arc::new(body));
    }

    /// Write through the interpreter-level stdout (possibly the debugger's
    /// redirection wrapper).
    pub fn print(&self, text: &str) {
        let mut stdout = self.stdout.lock().unwrap();
        let _ = stdout.write_all(text.as_bytes());
        let _ = stdout.flush();
    }

    fn emit(&self, frame: &FrameRef, event: TraceEvent) {
        let sink = self
            .sinks
            .lock()
            .unwrap()
            .sinks
            .get(&current_tid())
            .cloned();
        if let Some(sink) = sink {
            sink.trace(frame, event);
        }
    }

    /// Spawn an interpreter thread, honoring a spawn interception the
    /// debugger may have installed.
    pub fn spawn_thread<F>(self: &Arc<Self>, body: F) -> thread::JoinHandle<()>
    where
        F: FnOnce(&Arc<MockInterp>) + Send + 'static,
    {
        let interp = self.clone();
        thread::spawn(move || {
            let hook = interp.spawn_hook.lock().unwrap().clone();
            let interp2 = interp.clone();
            let boxed: Box<dyn FnOnce() + Send> = Box::new(move || body(&interp2));
            match hook {
                Some(hook) => hook.wrap(boxed),
                None => boxed(),
            }
        })
    }
}

impl Interp for MockInterp {
    fn current_thread_id(&self) -> Tid {
        current_tid()
    }

    fn current_thread_name(&self) -> Option<String> {
        self.thread_names.lock().unwrap().get(&current_tid()).cloned()
    }

    fn existing_threads(&self) -> Vec<(Tid, Option<FrameRef>)> {
        self.existing.lock().unwrap().clone()
    }

    fn loaded_modules(&self) -> Vec<String> {
        self.loaded.lock().unwrap().clone()
    }

    fn debugger_files(&self) -> Vec<String> {
        self.debugger_files.lock().unwrap().clone()
    }

    fn is_internal_file(&self, filename: &str) -> bool {
        self.internal_files.lock().unwrap().contains(filename)
    }

    fn install_trace(&self, sink: Arc<dyn TraceSink>) -> Option<TraceFn> {
        self.sinks.lock().unwrap().sinks.insert(current_tid(), sink);
        None
    }

    fn clear_trace(&self) {
        self.sinks.lock().unwrap().sinks.remove(&current_tid());
    }

    fn intercept_spawn(&self, hook: Arc<dyn SpawnHook>) {
        *self.spawn_hook.lock().unwrap() = Some(hook);
    }

    fn restore_spawn(&self) {
        *self.spawn_hook.lock().unwrap() = None;
    }

    fn swap_stdout(&self, sink: Box<dyn Write + Send>) -> Box<dyn Write + Send> {
        std::mem::replace(&mut *self.stdout.lock().unwrap(), sink)
    }

    fn swap_stderr(&self, sink: Box<dyn Write + Send>) -> Box<dyn Write + Send> {
        std::mem::replace(&mut *self.stderr.lock().unwrap(), sink)
    }

    fn run_file(&self, file: &str, _globals: &ObjectRef, _locals: &ObjectRef) -> RunOutcome {
        let program = self.programs.lock().unwrap().get(file).cloned();
        match program {
            Some(program) => {
                let interp = self.strong();
                run_module(&interp, file, scope(), |ctx| program(ctx));
                RunOutcome::Finished
            }
            None => RunOutcome::Exited(2),
        }
    }
}

// ----------------------------------------------------------------------
// The script driver: runs "interpreter code" that raises trace events.

pub struct FrameCtx {
    pub interp: Arc<MockInterp>,
    pub frame: Arc<MockFrame>,
}

impl FrameCtx {
    fn frame_ref(&self) -> FrameRef {
        self.frame.clone()
    }

    /// Execute one source line: move the frame there and raise the event.
    pub fn line(&self, lineno: i32) {
        self.frame.line.store(lineno, SeqCst);
        self.interp.emit(&self.frame_ref(), TraceEvent::Line);
    }

    /// Bind a local without any trace traffic.
    pub fn assign(&self, name: &str, value: Value) {
        scope_set(&self.frame.locals, name, value);
    }

    pub fn assign_global(&self, name: &str, value: Value) {
        scope_set(&self.frame.globals, name, value);
    }

    /// Call a function: new frame, `call` event, the body, `return` event.
    pub fn call<F>(&self, name: &str, filename: &str, first_lineno: i32, body: F)
    where
        F: FnOnce(&FrameCtx),
    {
        let callee = MockFrame::func(name, filename, first_lineno, Vec::new(), self.frame.clone());
        let callee_ref: FrameRef = callee.clone();
        self.interp.emit(&callee_ref, TraceEvent::Call);
        body(&FrameCtx {
            interp: self.interp.clone(),
            frame: callee,
        });
        self.interp.emit(&callee_ref, TraceEvent::Return);
    }

    /// Raise `exc` at the current line, attaching a fresh traceback rooted
    /// at this frame unless the test built one already.
    pub fn raise(&self, exc: MockExc) {
        let tb_is_set = exc.tb.lock().unwrap().is_some();
        if !tb_is_set {
            *exc.tb.lock().unwrap() = Some(Arc::new(MockTraceback {
                frame: self.frame_ref(),
                next: None,
            }));
        }
        let exc: ExceptionRef = Arc::new(exc);
        self.interp
            .emit(&self.frame_ref(), TraceEvent::Exception(exc));
    }
}

/// Run a module toplevel: module frame, `call` event, body, `return` event.
pub fn run_module<F>(interp: &Arc<MockInterp>, filename: &str, globals: Scope, body: F)
where
    F: FnOnce(&FrameCtx),
{
    let frame = MockFrame::module(filename, globals);
    let frame_ref: FrameRef = frame.clone();
    interp.emit(&frame_ref, TraceEvent::Call);
    body(&FrameCtx {
        interp: interp.clone(),
        frame,
    });
    interp.emit(&frame_ref, TraceEvent::Return);
}

// ----------------------------------------------------------------------
// The front-end driver.

#[derive(Clone, Debug, PartialEq)]
pub struct Desc {
    pub repr: String,
    pub hex: Option<String>,
    pub type_name: String,
    pub expandable: i32,
}

#[derive(Clone, Debug)]
pub struct FrameInfo {
    pub first_lineno: i32,
    pub end_lineno: i32,
    pub cur_lineno: i32,
    pub name: String,
    pub filename: String,
    pub arg_count: i32,
    pub vars: Vec<(String, Desc)>,
}

#[derive(Clone, Debug)]
pub enum Event {
    NewThread(Tid),
    ThreadExit(Tid),
    ProcessExit(i32),
    Excp {
        name: String,
        tid: Tid,
        text: String,
    },
    Module {
        id: i32,
        filename: String,
    },
    StepDone(Tid),
    BreakpointBound(i32),
    BreakpointFailed(i32),
    BreakpointHit {
        id: i32,
        tid: Tid,
    },
    Loaded(Tid),
    ExecResult {
        eid: i32,
        desc: Desc,
    },
    ExecError {
        eid: i32,
        text: String,
    },
    Children {
        eid: i32,
        is_index: i32,
        is_enumerate: i32,
        children: Vec<(String, Desc)>,
    },
    Output {
        tid: Tid,
        text: String,
    },
    RequestHandlers(String),
    AsyncBreak(Tid),
    Detached,
    SetLine {
        ok: i32,
        tid: Tid,
        line: i32,
    },
    Frames {
        tid: Tid,
        thread_name: Option<String>,
        frames: Vec<FrameInfo>,
    },
}

pub struct FrontEnd {
    stream: TcpStream,
    reader: MessageReader<TcpStream>,
}

impl FrontEnd {
    pub fn accept(listener: &TcpListener) -> FrontEnd {
        let (stream, _) = listener.accept().expect("front-end accept failed");
        stream
            .set_read_timeout(Some(Duration::from_secs(20)))
            .unwrap();
        let reader = MessageReader::new(stream.try_clone().unwrap());
        FrontEnd { stream, reader }
    }

    pub fn read_handshake(&mut self) -> String {
        self.reader
            .read_prefixed_string()
            .expect("handshake read failed")
            .expect("handshake must not be null")
    }

    // -- command senders ------------------------------------------------

    fn put(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).expect("command write failed");
    }

    pub fn send_cmd(&mut self, cmd: &[u8; 4]) {
        let bytes = *cmd;
        self.put(&bytes);
    }

    pub fn send_int(&mut self, value: i32) {
        let bytes = value.to_le_bytes();
        self.put(&bytes);
    }

    pub fn send_str(&mut self, value: &str) {
        self.send_int(value.as_bytes().len() as i32);
        let bytes = value.as_bytes().to_vec();
        self.put(&bytes);
    }

    pub fn step_into(&mut self, tid: Tid) {
        self.send_cmd(b"stpi");
        self.send_int(tid);
    }

    pub fn step_out(&mut self, tid: Tid) {
        self.send_cmd(b"stpo");
        self.send_int(tid);
    }

    pub fn step_over(&mut self, tid: Tid) {
        self.send_cmd(b"stpv");
        self.send_int(tid);
    }

    pub fn set_breakpoint(&mut self, id: i32, line: i32, file: &str, condition: &str, bwc: bool) {
        self.send_cmd(b"brkp");
        self.send_int(id);
        self.send_int(line);
        self.send_str(file);
        self.send_str(condition);
        self.send_int(if bwc { 1 } else { 0 });
    }

    pub fn set_condition(&mut self, id: i32, condition: &str, bwc: bool) {
        self.send_cmd(b"brkc");
        self.send_int(id);
        self.send_str(condition);
        self.send_int(if bwc { 1 } else { 0 });
    }

    pub fn remove_breakpoint(&mut self, line: i32, id: i32) {
        self.send_cmd(b"brkr");
        self.send_int(line);
        self.send_int(id);
    }

    pub fn break_all(&mut self) {
        self.send_cmd(b"brka");
    }

    pub fn resume_all(&mut self) {
        self.send_cmd(b"resa");
    }

    pub fn resume_thread(&mut self, tid: Tid) {
        self.send_cmd(b"rest");
        self.send_int(tid);
    }

    pub fn execute(&mut self, text: &str, tid: Tid, fid: i32, eid: i32) {
        self.send_cmd(b"exec");
        self.send_str(text);
        self.send_int(tid);
        self.send_int(fid);
        self.send_int(eid);
    }

    pub fn enum_children(&mut self, text: &str, tid: Tid, fid: i32, eid: i32, is_enum: bool) {
        self.send_cmd(b"chld");
        self.send_str(text);
        self.send_int(tid);
        self.send_int(fid);
        self.send_int(eid);
        self.send_int(if is_enum { 1 } else { 0 });
    }

    pub fn set_lineno(&mut self, tid: Tid, fid: i32, line: i32) {
        self.send_cmd(b"setl");
        self.send_int(tid);
        self.send_int(fid);
        self.send_int(line);
    }

    pub fn detach(&mut self) {
        self.send_cmd(b"detc");
    }

    pub fn clear_stepping(&mut self, tid: Tid) {
        self.send_cmd(b"clst");
        self.send_int(tid);
    }

    pub fn set_exception_info(&mut self, default_mode: i32, entries: &[(i32, &str)]) {
        self.send_cmd(b"sexi");
        self.send_int(default_mode);
        self.send_int(entries.len() as i32);
        for (mode, name) in entries {
            self.send_int(*mode);
            let name = (*name).to_owned();
            self.send_str(&name);
        }
    }

    pub fn set_handler_info(&mut self, file: &str, ranges: &[(i32, i32, &[&str])]) {
        self.send_cmd(b"sehi");
        self.send_str(file);
        self.send_int(ranges.len() as i32);
        for (start, end, expressions) in ranges {
            self.send_int(*start);
            self.send_int(*end);
            for expr in *expressions {
                let expr = (*expr).to_owned();
                self.send_str(&expr);
            }
            self.send_str("-");
        }
    }

    pub fn ack_exit(&mut self) {
        self.send_cmd(b"exit");
    }

    // -- event reading --------------------------------------------------

    fn read_desc(&mut self) -> Desc {
        let repr = self
            .reader
            .read_prefixed_string()
            .unwrap()
            .unwrap_or_default();
        let hex = self.reader.read_prefixed_string().unwrap();
        let type_name = self
            .reader
            .read_prefixed_string()
            .unwrap()
            .unwrap_or_default();
        let expandable = self.reader.read_int().unwrap();
        Desc {
            repr,
            hex,
            type_name,
            expandable,
        }
    }

    pub fn read_event(&mut self) -> Event {
        let cmd = self.reader.read_cmd().expect("event read failed");
        match &cmd {
            b"NEWT" => Event::NewThread(self.reader.read_int().unwrap()),
            b"EXTT" => Event::ThreadExit(self.reader.read_int().unwrap()),
            b"EXIT" => Event::ProcessExit(self.reader.read_int().unwrap()),
            b"EXCP" => {
                let name = self.reader.read_prefixed_string().unwrap().unwrap();
                let tid = self.reader.read_int().unwrap();
                let text = self.reader.read_prefixed_string().unwrap().unwrap();
                Event::Excp { name, tid, text }
            }
            b"MODL" => {
                let id = self.reader.read_int().unwrap();
                let filename = self.reader.read_prefixed_string().unwrap().unwrap();
                Event::Module { id, filename }
            }
            b"STPD" => Event::StepDone(self.reader.read_int().unwrap()),
            b"BRKS" => Event::BreakpointBound(self.reader.read_int().unwrap()),
            b"BRKF" => Event::BreakpointFailed(self.reader.read_int().unwrap()),
            b"BRKH" => {
                let id = self.reader.read_int().unwrap();
                let tid = self.reader.read_int().unwrap();
                Event::BreakpointHit { id, tid }
            }
            b"LOAD" => Event::Loaded(self.reader.read_int().unwrap()),
            b"EXCR" => {
                let eid = self.reader.read_int().unwrap();
                let desc = self.read_desc();
                Event::ExecResult { eid, desc }
            }
            b"EXCE" => {
                let eid = self.reader.read_int().unwrap();
                let text = self.reader.read_prefixed_string().unwrap().unwrap();
                Event::ExecError { eid, text }
            }
            b"CHLD" => {
                let eid = self.reader.read_int().unwrap();
                let count = self.reader.read_int().unwrap();
                let is_index = self.reader.read_int().unwrap();
                let is_enumerate = self.reader.read_int().unwrap();
                let mut children = Vec::new();
                for _ in 0..count {
                    let name = self.reader.read_prefixed_string().unwrap().unwrap();
                    let desc = self.read_desc();
                    children.push((name, desc));
                }
                Event::Children {
                    eid,
                    is_index,
                    is_enumerate,
                    children,
                }
            }
            b"OUTP" => {
                let tid = self.reader.read_int().unwrap();
                let text = self.reader.read_prefixed_string().unwrap().unwrap();
                Event::Output { tid, text }
            }
            b"REQH" => {
                Event::RequestHandlers(self.reader.read_prefixed_string().unwrap().unwrap())
            }
            b"ASBR" => Event::AsyncBreak(self.reader.read_int().unwrap()),
            b"DETC" => Event::Detached,
            b"SETL" => {
                let ok = self.reader.read_int().unwrap();
                let tid = self.reader.read_int().unwrap();
                let line = self.reader.read_int().unwrap();
                Event::SetLine { ok, tid, line }
            }
            b"THRF" => {
                let tid = self.reader.read_int().unwrap();
                let thread_name = self.reader.read_prefixed_string().unwrap();
                let count = self.reader.read_int().unwrap();
                let mut frames = Vec::new();
                for _ in 0..count {
                    let first_lineno = self.reader.read_int().unwrap();
                    let end_lineno = self.reader.read_int().unwrap();
                    let cur_lineno = self.reader.read_int().unwrap();
                    let name = self.reader.read_prefixed_string().unwrap().unwrap();
                    let filename = self.reader.read_prefixed_string().unwrap().unwrap();
                    let arg_count = self.reader.read_int().unwrap();
                    let var_count = self.reader.read_int().unwrap();
                    let mut vars = Vec::new();
                    for _ in 0..var_count {
                        let var_name = self.reader.read_prefixed_string().unwrap().unwrap();
                        let desc = self.read_desc();
                        vars.push((var_name, desc));
                    }
                    frames.push(FrameInfo {
                        first_lineno,
                        end_lineno,
                        cur_lineno,
                        name,
                        filename,
                        arg_count,
                        vars,
                    });
                }
                Event::Frames {
                    tid,
                    thread_name,
                    frames,
                }
            }
            other => panic!("unexpected event tag {:?}", String::from_utf8_lossy(other)),
        }
    }

    /// Next event that is not a stack snapshot or output chatter.
    pub fn read_significant(&mut self) -> Event {
        loop {
            match self.read_event() {
                Event::Frames { .. } | Event::Output { .. } => continue,
                event => return event,
            }
        }
    }

    /// Read until `pred` matches, failing the test after too many events.
    pub fn wait_for<F>(&mut self, pred: F) -> Event
    where
        F: Fn(&Event) -> bool,
    {
        for _ in 0..1000 {
            let event = self.read_event();
            if pred(&event) {
                return event;
            }
        }
        panic!("event never arrived");
    }
}

// ----------------------------------------------------------------------
// Session/front-end pairing.

pub struct TestSetup {
    pub interp: Arc<MockInterp>,
    pub session: Arc<Session>,
    pub fe: FrontEnd,
}

/// Bind a listener, attach a fresh session to it, and finish the handshake.
pub fn attach_pair() -> TestSetup {
    attach_pair_with(|_| {})
}

/// Like `attach_pair`, with a hook to configure the interpreter (loaded
/// modules, existing threads) before the session attaches.
pub fn attach_pair_with<F>(configure: F) -> TestSetup
where
    F: FnOnce(&Arc<MockInterp>),
{
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let interp = MockInterp::new();
    configure(&interp);
    let session =
        attach_process(interp.clone(), port, "test-debug-id", false).expect("attach failed");
    let mut fe = FrontEnd::accept(&listener);
    assert_eq!(fe.read_handshake(), "test-debug-id");
    TestSetup { interp, session, fe }
}

/// Run `program` on a new OS thread as a traced interpreter thread, the way
/// the launch path traces its main thread. Emits NEWT when it starts and
/// EXTT when it finishes.
pub fn start_traced_thread<F>(setup: &TestSetup, program: F) -> thread::JoinHandle<()>
where
    F: FnOnce(&Arc<MockInterp>) + Send + 'static,
{
    let session = setup.session.clone();
    let interp = setup.interp.clone();
    thread::spawn(move || {
        let thread = session.new_thread(None, false, None);
        let tracer = session.make_tracer(&thread);
        let prev = interp.install_trace(tracer);
        thread.set_prev_trace(prev);

        program(&interp);

        interp.clear_trace();
        if !thread.is_marked_detached() {
            session.remove_thread(thread.id);
            session.report_thread_exit(thread.id);
        }
    })
}
