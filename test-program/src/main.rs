//! Drives the crash reporter end to end.
//!
//! ```text
//! test-program [backtrace|segfault|abort] [crash-log-path]
//! ```
//!
//! Without a path the crash log goes to stderr.

use std::ffi::CString;
use std::hint::black_box;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn main() {
    let registry = tracing_subscriber::Registry::default().with(
        EnvFilter::builder()
            .with_default_directive(tracing::Level::INFO.into())
            .from_env()
            .unwrap(),
    );

    let tree_layer = tracing_tree::HierarchicalLayer::new(2)
        .with_targets(true)
        .with_bracketed_fields(true);

    registry.with(tree_layer).init();

    let mut args = std::env::args().skip(1);
    let action = args.next().unwrap_or_else(|| "backtrace".to_owned());

    let mut config = crashwind::Config::default();
    if let Some(path) = args.next() {
        let path: &'static _ = Box::leak(CString::new(path).unwrap().into_boxed_c_str());
        config = config.with_log_path(path);
    }
    let reporter = crashwind::install(config).unwrap();
    tracing::info!(images = reporter.images().len(), "installed");

    match action.as_str() {
        "backtrace" => {
            let frames = nested(4, &|| crashwind::log_current_thread());
            tracing::info!(?frames, "walked the current thread");
        }
        "segfault" => {
            nested(4, &|| {
                // SAFETY: None, this is the crash we want to report.
                unsafe { std::ptr::null_mut::<usize>().write_volatile(0xdead) };
                Ok(0)
            });
        }
        "abort" => {
            nested(4, &|| std::process::abort());
        }
        other => {
            eprintln!("unknown action {other:?}, expected backtrace, segfault or abort");
            std::process::exit(2);
        }
    }
}

/// A few real frames between `main` and the interesting part.
#[inline(never)]
fn nested(depth: usize, f: &dyn Fn() -> crashwind::Result<usize>) -> crashwind::Result<usize> {
    if depth == 0 {
        return f();
    }
    black_box(nested(black_box(depth - 1), f))
}
