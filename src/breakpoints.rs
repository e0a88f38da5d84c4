//! Line-indexed breakpoint storage.
//!
//! Breakpoints are logically keyed by the integer id the front-end assigned,
//! but stored as `line -> {(filename, id) -> condition}` so the tracer's
//! line-event probe is one bucket lookup. A breakpoint whose file does not
//! match any loaded module yet goes into the pending set as well and is
//! drained when a matching module loads.
//!
//! Filenames are normalized to an absolute, lexically cleaned form at every
//! site that stores or compares one, so the hot-path match and the
//! pending-bind match cannot disagree about what "the same file" means.

use crate::interp::FrameRef;
use crate::interp::ObjectRef;
use std::collections::HashMap;
use std::env;
use std::path::Component;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;

/// Absolute, lexically cleaned rendition of `path`. Purely textual: the file
/// does not have to exist, and symlinks are not chased.
pub fn canonical_file(path: &str) -> String {
    let p = PathBuf::from(path);
    let absolute = if p.is_absolute() {
        p
    } else {
        match env::current_dir() {
            Ok(cwd) => cwd.join(p),
            Err(_) => p,
        }
    };
    let mut cleaned = PathBuf::new();
    for comp in absolute.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => {
                cleaned.pop();
            }
            other => cleaned.push(other.as_os_str()),
        }
    }
    cleaned.to_string_lossy().into_owned()
}

pub struct ConditionInfo {
    pub expression: String,
    pub break_when_changed: bool,
    /// `None` until the first evaluation; a change-triggered condition always
    /// fires the first time it is seen.
    last_value: Mutex<Option<ObjectRef>>,
}

impl ConditionInfo {
    pub fn new<S: Into<String>>(expression: S, break_when_changed: bool) -> ConditionInfo {
        ConditionInfo {
            expression: expression.into(),
            break_when_changed,
            last_value: Mutex::new(None),
        }
    }

    /// Evaluate the condition in `frame` and decide whether to stop. A
    /// condition that fails to evaluate is treated as a hit rather than
    /// silently skipped.
    pub fn should_break(&self, frame: &FrameRef) -> bool {
        let res = match frame.eval(&self.expression) {
            Ok(res) => res,
            Err(_) => return true,
        };
        if self.break_when_changed {
            let mut last = self.last_value.lock().unwrap();
            let changed = match &*last {
                None => true,
                Some(prev) => !prev.equals(res.as_ref()),
            };
            *last = Some(res);
            changed
        } else {
            res.is_truthy()
        }
    }
}

/// A breakpoint whose file matched no loaded module when it was set.
#[derive(Clone)]
pub struct PendingBreakpoint {
    pub id: i32,
    pub line: i32,
    /// Already canonical.
    pub filename: String,
    pub condition: String,
    pub break_when_changed: bool,
}

type Bucket = HashMap<(String, i32), Option<Arc<ConditionInfo>>>;

pub struct BreakpointTable {
    by_line: Mutex<HashMap<i32, Bucket>>,
    pending: Mutex<Vec<PendingBreakpoint>>,
}

impl BreakpointTable {
    pub fn new() -> BreakpointTable {
        BreakpointTable {
            by_line: Mutex::new(HashMap::new()),
            pending: Mutex::new(Vec::new()),
        }
    }

    /// Cheap probe so the tracer can skip the bucket lookup entirely in the
    /// common no-breakpoints case.
    pub fn any_set(&self) -> bool {
        !self.by_line.lock().unwrap().is_empty()
    }

    pub fn add(&self, filename: &str, line: i32, id: i32, condition: Option<ConditionInfo>) {
        let key = (canonical_file(filename), id);
        let mut by_line = self.by_line.lock().unwrap();
        by_line
            .entry(line)
            .or_insert_with(HashMap::new)
            .insert(key, condition.map(Arc::new));
    }

    /// Decide whether any breakpoint stops `frame` at `lineno`. Returns the
    /// id to report. Only the first entry whose file matches is considered;
    /// its condition decides and the probe ends there.
    pub fn check_line(&self, frame: &FrameRef, lineno: i32) -> Option<i32> {
        let entries: Vec<((String, i32), Option<Arc<ConditionInfo>>)> = {
            let by_line = self.by_line.lock().unwrap();
            match by_line.get(&lineno) {
                None => return None,
                Some(bucket) => bucket
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            }
        };
        // Conditions run user code; the table lock is not held for that.
        let frame_file = canonical_file(&frame.code().filename());
        for ((filename, id), condition) in entries {
            if filename == frame_file {
                let hit = match condition {
                    None => true,
                    Some(cond) => cond.should_break(frame),
                };
                if hit {
                    return Some(id);
                }
                return None;
            }
        }
        None
    }

    /// Replace the condition of the breakpoint with this id, wherever it is.
    pub fn set_condition(&self, id: i32, condition: String, break_when_changed: bool) {
        let mut by_line = self.by_line.lock().unwrap();
        for bucket in by_line.values_mut() {
            let found = bucket.keys().find(|(_, bid)| *bid == id).cloned();
            if let Some(key) = found {
                let info = if condition.is_empty() {
                    None
                } else {
                    Some(Arc::new(ConditionInfo::new(condition, break_when_changed)))
                };
                bucket.insert(key, info);
                return;
            }
        }
    }

    pub fn remove(&self, line: i32, id: i32) {
        let mut by_line = self.by_line.lock().unwrap();
        if let Some(bucket) = by_line.get_mut(&line) {
            let found = bucket.keys().find(|(_, bid)| *bid == id).cloned();
            if let Some(key) = found {
                bucket.remove(&key);
            }
            if bucket.is_empty() {
                by_line.remove(&line);
            }
        }
    }

    pub fn add_pending(&self, bp: PendingBreakpoint) {
        self.pending.lock().unwrap().push(bp);
    }

    /// Take every pending breakpoint whose file is `module_filename`
    /// (canonical) out of the pending set. The caller re-adds them to the
    /// table and reports each as bound.
    pub fn take_pending_for(&self, module_filename: &str) -> Vec<PendingBreakpoint> {
        let mut pending = self.pending.lock().unwrap();
        let mut bound = Vec::new();
        let mut rest = Vec::new();
        for bp in pending.drain(..) {
            if bp.filename == module_filename {
                bound.push(bp);
            } else {
                rest.push(bp);
            }
        }
        *pending = rest;
        bound
    }

    pub fn clear(&self) {
        self.by_line.lock().unwrap().clear();
        self.pending.lock().unwrap().clear();
    }
}
