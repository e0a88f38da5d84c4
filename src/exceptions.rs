//! Deciding which raised exceptions stop a thread.
//!
//! The front-end configures a default break mode plus per-exception-name
//! overrides. Breaking on "unhandled" needs to know whether some frame up
//! the stack will catch the exception; the front-end owns the source
//! analysis for that, so handler ranges are fetched per file on demand and
//! cached. The fetch is a one-shot request/reply: the tracer emits `REQH`
//! and waits on a signal the command loop fires when the matching `sehi`
//! arrives. Concurrent requests for the same file share one signal.

use crate::interp::ExceptionRef;
use crate::interp::FrameRef;
use crate::session::Session;
use crate::sync::OneShot;
use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex;

bitflags! {
    /// Values mirror the front-end's exception-state enumeration.
    pub struct BreakMode: i32 {
        const NEVER = 0;
        const ALWAYS = 1;
        const UNHANDLED = 32;
    }
}

/// One `except`-style clause of a source file: the protected line span and
/// the textual type expressions it catches (`*` catches everything).
#[derive(Clone, Debug)]
pub struct HandlerRange {
    pub line_start: i32,
    pub line_end: i32,
    pub expressions: HashSet<String>,
}

impl HandlerRange {
    fn covers(&self, line: i32) -> bool {
        self.line_start <= line && line < self.line_end
    }
}

/// Rewrite the legacy `exceptions.` module prefix to `builtins.` so old
/// front-ends and new hosts agree on names.
pub fn rewrite_legacy_name(name: &str) -> String {
    if let Some(rest) = name.strip_prefix("exceptions.") {
        format!("builtins.{}", rest)
    } else {
        name.to_owned()
    }
}

pub struct ExceptionPolicy {
    default_mode: Mutex<BreakMode>,
    break_on: Mutex<HashMap<String, BreakMode>>,
    handler_cache: Mutex<HashMap<String, Vec<HandlerRange>>>,
    /// In-flight `REQH` round trips, keyed by filename.
    handler_requests: Mutex<HashMap<String, Arc<OneShot>>>,
}

impl ExceptionPolicy {
    pub fn new() -> ExceptionPolicy {
        let policy = ExceptionPolicy {
            default_mode: Mutex::new(BreakMode::UNHANDLED),
            break_on: Mutex::new(HashMap::new()),
            handler_cache: Mutex::new(HashMap::new()),
            handler_requests: Mutex::new(HashMap::new()),
        };
        // Exceptions commonly used for control flow never break by default.
        policy.add_exception("exceptions.IndexError", BreakMode::NEVER);
        policy.add_exception("exceptions.KeyError", BreakMode::NEVER);
        policy.add_exception("exceptions.AttributeError", BreakMode::NEVER);
        policy.add_exception("exceptions.StopIteration", BreakMode::NEVER);
        policy.add_exception("exceptions.GeneratorExit", BreakMode::NEVER);
        policy
    }

    /// Drop everything the front-end configured, reverting to the
    /// break-on-unhandled default.
    pub fn clear(&self) {
        *self.default_mode.lock().unwrap() = BreakMode::UNHANDLED;
        self.break_on.lock().unwrap().clear();
        self.handler_cache.lock().unwrap().clear();
    }

    pub fn set_default_mode(&self, mode: BreakMode) {
        *self.default_mode.lock().unwrap() = mode;
    }

    pub fn add_exception(&self, name: &str, mode: BreakMode) {
        let name = rewrite_legacy_name(name);
        self.break_on.lock().unwrap().insert(name, mode);
    }

    pub fn lookup_mode(&self, qualified: &str) -> BreakMode {
        let break_on = self.break_on.lock().unwrap();
        match break_on.get(qualified) {
            Some(mode) => *mode,
            None => *self.default_mode.lock().unwrap(),
        }
    }

    /// Store the handler ranges the front-end computed for `filename` and
    /// wake whoever is waiting on them.
    pub fn set_handlers(&self, filename: &str, handlers: Vec<HandlerRange>) {
        self.handler_cache
            .lock()
            .unwrap()
            .insert(filename.to_owned(), handlers);
        self.finish_request(filename);
    }

    /// Release the signal for `filename` whether or not handlers arrived;
    /// the reply handler calls this even on a malformed payload so no
    /// tracer waits forever.
    pub fn finish_request(&self, filename: &str) {
        let signal = self.handler_requests.lock().unwrap().remove(filename);
        if let Some(signal) = signal {
            signal.fire();
        }
    }

    /// Wake every in-flight request; used at detach when no reply can come.
    pub fn abort_requests(&self) {
        let signals: Vec<Arc<OneShot>> = {
            let mut requests = self.handler_requests.lock().unwrap();
            requests.drain().map(|(_, s)| s).collect()
        };
        for signal in signals {
            signal.fire();
        }
    }

    pub fn should_break(&self, session: &Session, exc: &ExceptionRef) -> bool {
        let name = format!("{}.{}", exc.type_module(), exc.type_qualname());
        let mode = self.lookup_mode(&name);
        if mode.intersects(BreakMode::ALWAYS) {
            return true;
        }
        mode.intersects(BreakMode::UNHANDLED) && !self.is_handled(session, exc)
    }

    /// Whether some frame above the raise site will catch this exception.
    pub fn is_handled(&self, session: &Session, exc: &ExceptionRef) -> bool {
        let tb = match exc.traceback() {
            None => return false,
            Some(tb) => tb,
        };
        if tb.next().is_some() {
            // Not the top of the traceback: the exception already propagated
            // past at least one frame, so something upstream owns it.
            return true;
        }

        let mut cur = Some(tb.frame());
        while let Some(frame) = cur {
            let filename = frame.code().filename();
            if filename.is_empty() {
                break;
            }
            if session.should_debug_code(&filename) {
                let handlers = match self.handlers_for(session, &filename) {
                    // No handler info available: assume unhandled.
                    None => return false,
                    Some(handlers) => handlers,
                };
                if ranges_handle(&frame, exc, &handlers) {
                    return true;
                }
            }
            cur = frame.back();
        }
        false
    }

    /// Handler ranges for `filename`, fetching them from the front-end the
    /// first time the file comes up.
    fn handlers_for(&self, session: &Session, filename: &str) -> Option<Vec<HandlerRange>> {
        if let Some(handlers) = self.handler_cache.lock().unwrap().get(filename) {
            return Some(handlers.clone());
        }
        if session.detached() {
            return None;
        }

        let (signal, leader) = {
            let mut requests = self.handler_requests.lock().unwrap();
            match requests.get(filename) {
                Some(signal) => (signal.clone(), false),
                None => {
                    let signal = Arc::new(OneShot::new());
                    requests.insert(filename.to_owned(), signal.clone());
                    (signal, true)
                }
            }
        };
        if leader {
            session.request_handlers(filename);
            if session.detached() {
                // The request never went out; nobody will answer it.
                self.finish_request(filename);
            }
        }
        signal.wait();

        self.handler_cache.lock().unwrap().get(filename).cloned()
    }
}

fn ranges_handle(frame: &FrameRef, exc: &ExceptionRef, handlers: &[HandlerRange]) -> bool {
    let line = frame.lineno();
    for range in handlers {
        if !range.covers(line) {
            continue;
        }
        if range.expressions.contains("*") {
            return true;
        }
        for text in &range.expressions {
            if let Some(ty) = frame.resolve_name(text) {
                if exc.is_subtype_of(&ty) {
                    return true;
                }
            }
        }
    }
    false
}
