/// Options for the `debug` entrypoint, supplied by whatever launched the
/// debuggee.
#[derive(Clone)]
pub struct DebugFlags {
    /// Pause for a keypress after printing an unhandled exception, so a
    /// console window opened just for this run does not vanish.
    pub wait_on_exception: bool,
    /// Wrap the interpreter's stdout/stderr so writes are forwarded to the
    /// front-end as output events.
    pub redirect_output: bool,
    /// Pause for a keypress after a clean exit.
    pub wait_on_exit: bool,
}

impl Default for DebugFlags {
    fn default() -> DebugFlags {
        DebugFlags {
            wait_on_exception: false,
            redirect_output: false,
            wait_on_exit: false,
        }
    }
}
