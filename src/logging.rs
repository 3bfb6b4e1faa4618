use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// Initialize structured logging on stderr, keeping stdout free for
/// streamed model output and rendered artifacts.
pub(crate) fn init(verbose: bool) {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber).ok(); // Ignore err on repeat init
}
