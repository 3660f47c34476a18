//! # Logging.
//!
//! There is no logger backend here; log lines are emitted as
//! [`crate::EventType`] items through the context's event channel and the
//! hosting layer decides where they end up.

use crate::context::Context;

#[macro_export]
macro_rules! info {
    ($ctx:expr,  $msg:expr) => {
        info!($ctx, $msg,)
    };
    ($ctx:expr, $msg:expr, $($args:expr),* $(,)?) => {{
        let formatted = format!($msg, $($args),*);
        let full = format!("{file}:{line}: {msg}",
                           file = file!(),
                           line = line!(),
                           msg = &formatted);
        emit_event!($ctx, $crate::EventType::Info(full));
    }};
}

#[macro_export]
macro_rules! warn {
    ($ctx:expr, $msg:expr) => {
        warn!($ctx, $msg,)
    };
    ($ctx:expr, $msg:expr, $($args:expr),* $(,)?) => {{
        let formatted = format!($msg, $($args),*);
        let full = format!("{file}:{line}: {msg}",
                           file = file!(),
                           line = line!(),
                           msg = &formatted);
        emit_event!($ctx, $crate::EventType::Warning(full));
    }};
}

#[macro_export]
macro_rules! error {
    ($ctx:expr, $msg:expr) => {
        error!($ctx, $msg,)
    };
    ($ctx:expr, $msg:expr, $($args:expr),* $(,)?) => {{
        let formatted = format!($msg, $($args),*);
        emit_event!($ctx, $crate::EventType::Error(formatted));
    }};
}

#[macro_export]
macro_rules! emit_event {
    ($ctx:expr, $event:expr) => {
        $ctx.emit_event($event)
    };
}

pub(crate) trait LogExt<T> {
    /// Emits a warning if the receiver contained an Err value.
    ///
    /// Returns an [`Option<T>`] with the `Ok(_)` value, if any:
    /// - You won't get any warnings about unused results but can still use
    ///   the value if you need it
    /// - This prevents the same warning from being printed to the log
    ///   multiple times
    #[track_caller]
    fn log_err(self, context: &Context) -> Option<T>;
}

impl<T> LogExt<T> for anyhow::Result<T> {
    #[track_caller]
    fn log_err(self, context: &Context) -> Option<T> {
        match self {
            Err(e) => {
                let location = std::panic::Location::caller();
                // Uses anyhow's `{:#}` format to show the error context chain.
                let full = format!(
                    "{file}:{line}: {e:#}",
                    file = location.file(),
                    line = location.line(),
                    e = e
                );
                // We can't use the warn!() macro here as the file!() and
                // line!() macros don't work with #[track_caller].
                emit_event!(context, crate::EventType::Warning(full));
                None
            }
            Ok(v) => Some(v),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::TestContext;
    use crate::EventType;
    use anyhow::format_err;

    #[tokio::test]
    async fn test_log_err_emits_warning() {
        let t = TestContext::new().await;
        let emitter = t.get_event_emitter();
        let res: anyhow::Result<()> = Err(format_err!("testerror").context("some context"));
        assert!(res.log_err(&t).is_none());

        // Skip over events emitted while the test context came up.
        let msg = loop {
            match emitter.try_recv() {
                Some(EventType::Warning(msg)) => break msg,
                Some(_) => continue,
                None => panic!("no warning emitted"),
            }
        };
        assert!(msg.contains("some context"));
        assert!(msg.contains("testerror"));
    }
}
