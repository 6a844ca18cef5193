use indicatif::ProgressStyle;

pub(crate) fn task_style() -> ProgressStyle {
    ProgressStyle::with_template("{spinner:.blue} {msg}")
        .expect("template is valid")
}

pub(crate) fn bar_style() -> ProgressStyle {
    ProgressStyle::with_template("{wide_bar} {pos}/{len} {msg}")
        .expect("template is valid")
}

/// Best-effort extraction of a message from a panic payload.
pub(crate) fn panic_message(payload: &dyn std::any::Any) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "Unknown panic".to_string()
    }
}

/// Install a global tracing subscriber wired up to the progress bars drawn
/// during execution. Call this once, early in `main`.
#[cfg(feature = "logging")]
pub fn init_logging() {
    use tracing_indicatif::IndicatifLayer;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let indicatif_layer = IndicatifLayer::new();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(indicatif_layer.get_stderr_writer()))
        .with(indicatif_layer)
        .init();
}
