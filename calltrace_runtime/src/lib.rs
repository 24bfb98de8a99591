//! Call tracing for functions, impl blocks, and traits.
//!
//! Annotating a callable with [`trace`] rewrites its body so that every
//! invocation reports its arguments, its return value, and any panic, one
//! formatted line per event:
//!
//! ```
//! use calltrace_runtime::trace;
//!
//! #[trace]
//! fn add(a: i32, b: i32) -> i32 {
//!     a + b
//! }
//!
//! assert_eq!(add(2, 2), 4);
//! ```
//!
//! With the default [`ConsoleSink`] installed, the call above writes
//! `Thread{1}:add(a=2, b=2)` and `Thread{1}:add returned 4` to stdout.
//! [`set_sink`] swaps the destination at runtime; the `channel` Cargo feature
//! makes [`ChannelSink`] (the `tracing` facade) the initial destination
//! instead.
//!
//! Values are rendered through their `Display` impl where the declared type
//! provides one, through `Debug` otherwise, and as an opaque type-name
//! placeholder when it provides neither. A per-thread guard keeps that
//! rendering from re-entering the tracer: a traced method invoked while one
//! of its arguments is being formatted runs normally but reports nothing.

#[cfg(feature = "with_macro")]
pub use calltrace_macro::trace;

pub use format::{is_formatting, safe_debug, safe_display};
pub use identity::{instance_tag, thread_tag};
pub use sink::{set_sink, ChannelSink, ConsoleSink, MemorySink, TraceEvent, TraceRecord, TraceSink};
pub use tracer::{CallTracer, CallableSpec, TracerCell};

// --- format module ---
pub mod format {
    //! Safe value rendering and the per-thread recursion guard.

    use std::cell::Cell;
    use std::fmt;
    use std::panic::{catch_unwind, AssertUnwindSafe};

    use crate::identity;

    thread_local! {
        static FORMATTING: Cell<bool> = Cell::new(false);
    }

    /// True while the current thread is inside a value render. Traced
    /// callables consult this to suppress their own reporting.
    pub fn is_formatting() -> bool {
        FORMATTING.with(|flag| flag.get())
    }

    struct FormatGuard {
        was_formatting: bool,
    }

    impl FormatGuard {
        fn enter() -> FormatGuard {
            let was_formatting = FORMATTING.with(|flag| flag.replace(true));
            FormatGuard { was_formatting }
        }
    }

    impl Drop for FormatGuard {
        // Restores the previous state on every exit path, including unwinds
        // out of a panicking Display impl.
        fn drop(&mut self) {
            FORMATTING.with(|flag| flag.set(self.was_formatting));
        }
    }

    /// Renders a value through its `Display` impl with the recursion guard
    /// held. A panicking impl is caught and replaced by the value's opaque
    /// instance placeholder.
    pub fn safe_display<T: fmt::Display + ?Sized>(value: &T) -> String {
        let _guard = FormatGuard::enter();
        catch_unwind(AssertUnwindSafe(|| value.to_string()))
            .unwrap_or_else(|_| unprintable(value))
    }

    /// `Debug` counterpart of [`safe_display`].
    pub fn safe_debug<T: fmt::Debug + ?Sized>(value: &T) -> String {
        let _guard = FormatGuard::enter();
        catch_unwind(AssertUnwindSafe(|| format!("{:?}", value)))
            .unwrap_or_else(|_| unprintable(value))
    }

    /// Placeholder for values whose declared type offers no rendering at all.
    /// The underscore parameter exists for type inference only.
    pub fn opaque_value<T: ?Sized>(_value: &T) -> String {
        format!("<{}>", std::any::type_name::<T>())
    }

    fn unprintable<T: ?Sized>(value: &T) -> String {
        format!("<instance {}>", identity::instance_tag(value))
    }

    /// Joins rendered arguments as `name=value` pairs in declaration order.
    pub fn join_args(args: &[(&'static str, String)]) -> String {
        args.iter()
            .map(|(name, value)| format!("{}={}", name, value))
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Carrier for capability-based rendering; see [`render_value!`].
    ///
    /// Method resolution on `(&&FmtArg(value)).render_arg()` picks
    /// [`RenderDisplay`] when the declared type implements `Display`,
    /// [`RenderDebug`] when it only implements `Debug`, and [`RenderOpaque`]
    /// otherwise. Generic parameters resolve against their declared bounds.
    ///
    /// [`render_value!`]: crate::render_value
    pub struct FmtArg<'a, T: ?Sized>(pub &'a T);

    pub trait RenderDisplay {
        fn render_arg(&self) -> String;
    }

    pub trait RenderDebug {
        fn render_arg(&self) -> String;
    }

    pub trait RenderOpaque {
        fn render_arg(&self) -> String;
    }

    impl<T: fmt::Display + ?Sized> RenderDisplay for &FmtArg<'_, T> {
        fn render_arg(&self) -> String {
            safe_display(self.0)
        }
    }

    impl<T: fmt::Debug + ?Sized> RenderDebug for &&FmtArg<'_, T> {
        fn render_arg(&self) -> String {
            safe_debug(self.0)
        }
    }

    impl<T: ?Sized> RenderOpaque for FmtArg<'_, T> {
        fn render_arg(&self) -> String {
            opaque_value(self.0)
        }
    }
}

/// Renders a referenced value for trace output: `Display` if the declared
/// type has it, else `Debug`, else an opaque type-name placeholder.
///
/// ```
/// assert_eq!(calltrace_runtime::render_value!(&42), "42");
/// assert_eq!(calltrace_runtime::render_value!(&vec![1, 2]), "[1, 2]");
/// ```
#[macro_export]
macro_rules! render_value {
    ($value:expr) => {{
        #[allow(unused_imports)]
        use $crate::format::{RenderDebug as _, RenderDisplay as _, RenderOpaque as _};
        (&&$crate::format::FmtArg($value)).render_arg()
    }};
}

// --- identity module ---
pub mod identity {
    //! Opaque identity tags for instances and threads.
    //!
    //! Raw addresses and thread ids never appear in output; both are mapped
    //! to small sequence numbers assigned on first sight. Instance tags are
    //! keyed by address, so a value that moves gets a fresh tag. Zero is
    //! reserved as the "identity unavailable" sentinel.

    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex;

    lazy_static::lazy_static! {
        static ref INSTANCE_TAGS: Mutex<HashMap<usize, u64>> = Mutex::new(HashMap::new());
    }

    static NEXT_INSTANCE_TAG: AtomicU64 = AtomicU64::new(1);
    static NEXT_THREAD_TAG: AtomicU64 = AtomicU64::new(1);

    thread_local! {
        static THREAD_TAG: u64 = NEXT_THREAD_TAG.fetch_add(1, Ordering::Relaxed);
    }

    /// The tag assigned to the value at this address, allocating one on
    /// first sight. Never returns the zero sentinel.
    pub fn instance_tag<T: ?Sized>(value: &T) -> u64 {
        let address = value as *const T as *const () as usize;
        let mut tags = INSTANCE_TAGS
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *tags
            .entry(address)
            .or_insert_with(|| NEXT_INSTANCE_TAG.fetch_add(1, Ordering::Relaxed))
    }

    /// The calling thread's tag, assigned on the thread's first use.
    pub fn thread_tag() -> u64 {
        THREAD_TAG.with(|tag| *tag)
    }
}

// --- tracer module ---
pub mod tracer {
    //! Per-callable tracers driving the call/return/panic reporting.

    use std::any::Any;
    use std::backtrace::Backtrace;
    use std::sync::OnceLock;

    use crate::format;
    use crate::sink::{self, TraceEvent};

    /// Static description of one traced callable, assembled by the attribute
    /// macro at expansion time.
    #[derive(Debug, Clone)]
    pub struct CallableSpec {
        pub name: &'static str,
        pub type_name: Option<&'static str>,
        pub has_receiver: bool,
    }

    // The four reported name forms: `Type[tag].name`, `Type.name`,
    // `[tag].name`, and `name`. Tagged forms splice the instance tag between
    // a prefix and suffix prepared once.
    #[derive(Debug)]
    enum QualifiedName {
        Tagged { prefix: String, suffix: String },
        Plain(String),
    }

    /// Reports the lifecycle of one callable's invocations.
    #[derive(Debug)]
    pub struct CallTracer {
        name: QualifiedName,
    }

    impl CallTracer {
        /// Derives the reported name form from a macro-built spec.
        pub fn from_spec(spec: CallableSpec) -> CallTracer {
            let name = match (spec.type_name, spec.has_receiver) {
                (Some(type_name), true) => QualifiedName::Tagged {
                    prefix: format!("{}[", type_name),
                    suffix: format!("].{}", spec.name),
                },
                (Some(type_name), false) => {
                    QualifiedName::Plain(format!("{}.{}", type_name, spec.name))
                }
                (None, true) => QualifiedName::Tagged {
                    prefix: "[".to_string(),
                    suffix: format!("].{}", spec.name),
                },
                (None, false) => QualifiedName::Plain(spec.name.to_string()),
            };
            CallTracer { name }
        }

        /// Tracer for a free-standing callable, reported by bare name.
        pub fn function(name: &str) -> CallTracer {
            CallTracer {
                name: QualifiedName::Plain(name.to_string()),
            }
        }

        /// Tracer for a type-associated callable, reported as `Type.name`.
        pub fn method(type_name: &str, name: &str) -> CallTracer {
            CallTracer {
                name: QualifiedName::Plain(format!("{}.{}", type_name, name)),
            }
        }

        fn qualified(&self, instance: u64) -> String {
            match &self.name {
                QualifiedName::Tagged { prefix, suffix } => {
                    format!("{}{}{}", prefix, instance, suffix)
                }
                QualifiedName::Plain(name) => name.clone(),
            }
        }

        pub fn log_call(&self, instance: u64, args: &[(&'static str, String)]) {
            let line = format!("{}({})", self.qualified(instance), format::join_args(args));
            sink::dispatch(TraceEvent::Call { line: &line });
        }

        pub fn log_return(&self, instance: u64, value: String) {
            let line = format!("{} returned {}", self.qualified(instance), value);
            sink::dispatch(TraceEvent::Return { line: &line });
        }

        /// Reports a panic unwinding out of the wrapped body. Runs even while
        /// reporting is suppressed; the zero instance sentinel stands in when
        /// the call never reached its pre-call step.
        pub fn log_panic(&self, instance: u64, payload: &(dyn Any + Send)) {
            let line = format!("{} raised an exception", self.qualified(instance));
            let detail = format!(
                "panicked with '{}'\n{}",
                panic_message(payload),
                Backtrace::force_capture()
            );
            sink::dispatch(TraceEvent::Panic {
                line: &line,
                detail: &detail,
            });
        }

    }

    fn panic_message(payload: &(dyn Any + Send)) -> &str {
        if let Some(message) = payload.downcast_ref::<&'static str>() {
            message
        } else if let Some(message) = payload.downcast_ref::<String>() {
            message.as_str()
        } else {
            "Box<dyn Any>"
        }
    }

    /// One-time tracer storage embedded in each wrapped body, so the name
    /// templates are prepared on the first invocation only.
    pub struct TracerCell {
        cell: OnceLock<CallTracer>,
    }

    impl TracerCell {
        pub const fn new() -> TracerCell {
            TracerCell {
                cell: OnceLock::new(),
            }
        }

        pub fn get_or_init<F>(&self, build: F) -> &CallTracer
        where
            F: FnOnce() -> CallTracer,
        {
            self.cell.get_or_init(build)
        }
    }
}

/// Runs a closure under the full call/return/panic reporting cycle of a
/// [`CallTracer`].
///
/// This is the composition form for call sites the attribute cannot reach.
/// Expansion happens where the closure's return type is concrete, so the
/// returned value gets the usual `Display`-else-`Debug`-else-opaque
/// rendering. Closures carry no parameter names or receiver, so the call
/// line reports an empty argument list.
///
/// ```
/// use calltrace_runtime::{trace_call, CallTracer};
///
/// let tracer = CallTracer::function("rebuild");
/// let value = trace_call!(tracer, || 2 + 2);
/// assert_eq!(value, 4);
/// ```
#[macro_export]
macro_rules! trace_call {
    ($tracer:expr, $body:expr) => {{
        let __calltrace_tracer = &$tracer;
        let __calltrace_suppressed = $crate::is_formatting();
        if !__calltrace_suppressed {
            __calltrace_tracer.log_call(0, &[]);
        }
        match ::std::panic::catch_unwind(::std::panic::AssertUnwindSafe($body)) {
            ::std::result::Result::Ok(__calltrace_value) => {
                if !__calltrace_suppressed {
                    __calltrace_tracer.log_return(0, $crate::render_value!(&__calltrace_value));
                }
                __calltrace_value
            }
            ::std::result::Result::Err(__calltrace_panic) => {
                __calltrace_tracer.log_panic(0, __calltrace_panic.as_ref());
                ::std::panic::resume_unwind(__calltrace_panic)
            }
        }
    }};
}

// --- sink module ---
pub mod sink {
    //! Emission backends and the process-wide sink registration.

    use std::sync::{Arc, Mutex, MutexGuard, RwLock};

    use crate::identity;

    /// Borrowed view of one emission, as handed to a [`TraceSink`].
    #[derive(Debug, Clone, Copy)]
    pub enum TraceEvent<'a> {
        Call { line: &'a str },
        Return { line: &'a str },
        Panic { line: &'a str, detail: &'a str },
    }

    /// Owned copy of one emission, as kept by [`MemorySink`].
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum TraceRecord {
        Call(String),
        Return(String),
        Panic { line: String, detail: String },
    }

    impl TraceRecord {
        fn from_event(event: TraceEvent<'_>) -> TraceRecord {
            match event {
                TraceEvent::Call { line } => TraceRecord::Call(line.to_string()),
                TraceEvent::Return { line } => TraceRecord::Return(line.to_string()),
                TraceEvent::Panic { line, detail } => TraceRecord::Panic {
                    line: line.to_string(),
                    detail: detail.to_string(),
                },
            }
        }
    }

    /// Destination for trace emissions. Implementations must tolerate
    /// concurrent calls from multiple threads.
    pub trait TraceSink: Send + Sync {
        fn emit(&self, event: TraceEvent<'_>);
    }

    /// Writes `Thread{N}:`-prefixed lines to stdout; the panic detail is a
    /// separate, unprefixed write. The initial sink unless the `channel`
    /// feature selects [`ChannelSink`].
    #[derive(Debug, Default)]
    pub struct ConsoleSink;

    impl ConsoleSink {
        pub(crate) fn render(event: TraceEvent<'_>) -> Vec<String> {
            let thread = identity::thread_tag();
            match event {
                TraceEvent::Call { line } | TraceEvent::Return { line } => {
                    vec![format!("Thread{{{}}}:{}", thread, line)]
                }
                TraceEvent::Panic { line, detail } => vec![
                    format!("Thread{{{}}}:{}", thread, line),
                    detail.to_string(),
                ],
            }
        }
    }

    impl TraceSink for ConsoleSink {
        fn emit(&self, event: TraceEvent<'_>) {
            for line in ConsoleSink::render(event) {
                println!("{}", line);
            }
        }
    }

    /// Forwards emissions to the `tracing` facade under target `"calltrace"`:
    /// debug severity for calls and returns, error severity (with the panic
    /// detail appended) for panics. The subscriber supplies thread context,
    /// so lines carry no `Thread{N}:` prefix.
    #[derive(Debug, Default)]
    pub struct ChannelSink;

    impl TraceSink for ChannelSink {
        fn emit(&self, event: TraceEvent<'_>) {
            match event {
                TraceEvent::Call { line } | TraceEvent::Return { line } => {
                    tracing::debug!(target: "calltrace", "{}", line);
                }
                TraceEvent::Panic { line, detail } => {
                    tracing::error!(target: "calltrace", "{}\n{}", line, detail);
                }
            }
        }
    }

    /// Collects records in memory, in emission order. Intended for tests and
    /// in-process inspection.
    #[derive(Debug, Default)]
    pub struct MemorySink {
        records: Mutex<Vec<TraceRecord>>,
    }

    impl MemorySink {
        pub fn new() -> MemorySink {
            MemorySink::default()
        }

        /// Copies out everything recorded so far.
        pub fn records(&self) -> Vec<TraceRecord> {
            self.lock().clone()
        }

        /// Drains and returns everything recorded so far.
        pub fn take(&self) -> Vec<TraceRecord> {
            std::mem::take(&mut *self.lock())
        }

        pub fn clear(&self) {
            self.lock().clear();
        }

        pub fn len(&self) -> usize {
            self.lock().len()
        }

        pub fn is_empty(&self) -> bool {
            self.lock().is_empty()
        }

        fn lock(&self) -> MutexGuard<'_, Vec<TraceRecord>> {
            self.records
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
        }
    }

    impl TraceSink for MemorySink {
        fn emit(&self, event: TraceEvent<'_>) {
            self.lock().push(TraceRecord::from_event(event));
        }
    }

    fn initial_sink() -> Arc<dyn TraceSink> {
        #[cfg(feature = "channel")]
        let sink: Arc<dyn TraceSink> = Arc::new(ChannelSink);
        #[cfg(not(feature = "channel"))]
        let sink: Arc<dyn TraceSink> = Arc::new(ConsoleSink);
        sink
    }

    lazy_static::lazy_static! {
        static ref ACTIVE_SINK: RwLock<Arc<dyn TraceSink>> = RwLock::new(initial_sink());
    }

    /// Replaces the process-wide sink, returning the one previously
    /// installed so callers can restore it.
    ///
    /// ```
    /// use std::sync::Arc;
    /// use calltrace_runtime::{set_sink, trace_call, CallTracer, MemorySink, TraceRecord};
    ///
    /// let sink = Arc::new(MemorySink::new());
    /// let previous = set_sink(sink.clone());
    /// trace_call!(CallTracer::function("job"), || ());
    /// set_sink(previous);
    ///
    /// assert_eq!(sink.records()[0], TraceRecord::Call("job()".to_string()));
    /// ```
    pub fn set_sink(sink: Arc<dyn TraceSink>) -> Arc<dyn TraceSink> {
        let mut active = ACTIVE_SINK
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        std::mem::replace(&mut *active, sink)
    }

    // Emission must never fail the host program: poisoned locks are
    // recovered, and the lock is released before the sink runs.
    pub(crate) fn dispatch(event: TraceEvent<'_>) {
        let sink = ACTIVE_SINK
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        sink.emit(event);
    }
}
