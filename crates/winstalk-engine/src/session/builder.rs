use super::state::Options;
use super::{DebugSession, Session};
use crate::handler::EventHandler;
use crate::native::NativeDebugger;

/// Builder for [DebugSession].
///
/// It is created by calling [Builder::new], and allows to specify which
/// native debugger and event handler to use, then to tune the session
/// options.
pub struct Builder<S> {
    state: S,
}

impl Builder<NeedsNative> {
    /// Creates a session builder.
    pub const fn new() -> Self {
        Self { state: NeedsNative }
    }

    /// Specifies the native debugger driving the debuggees.
    pub const fn with_native<N: NativeDebugger>(self, native: N) -> Builder<NeedsHandler<N>> {
        Builder {
            state: NeedsHandler { native },
        }
    }
}

impl Default for Builder<NeedsNative> {
    fn default() -> Self {
        Self::new()
    }
}

impl<N: NativeDebugger> Builder<NeedsHandler<N>> {
    /// Specifies the handler of debug events.
    pub fn with_event_handler<H>(self, handler: H) -> Builder<Ready<N, H>>
    where
        H: EventHandler<Native = N>,
    {
        Builder {
            state: Ready {
                native: self.state.native,
                handler,
                options: Options::default(),
            },
        }
    }
}

impl<N, H> Builder<Ready<N, H>>
where
    N: NativeDebugger,
    H: EventHandler<Native = N>,
{
    /// Specifies whether the debuggees are killed when the session stops,
    /// instead of being detached from (the default).
    pub const fn kill_on_exit(mut self, kill_on_exit: bool) -> Self {
        self.state.options.kill_on_exit = kill_on_exit;
        self
    }

    /// Specifies whether the debuggees are expected to fight back.
    ///
    /// When set, code breakpoints are only placed in executable memory over
    /// a byte that is not already an `int3`, and return addresses read from
    /// the stack by hooks are only trusted when executable.
    pub const fn hostile_code(mut self, hostile_code: bool) -> Self {
        self.state.options.hostile_code = hostile_code;
        self
    }

    /// Builds the session.
    pub fn build(self) -> DebugSession<N, H> {
        let Ready {
            native,
            handler,
            options,
        } = self.state;

        DebugSession {
            session: Session::new(native, options),
            handler,
        }
    }
}

pub struct NeedsNative;

pub struct NeedsHandler<N> {
    native: N,
}

pub struct Ready<N, H> {
    native: N,
    handler: H,
    options: Options,
}
