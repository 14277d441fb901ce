use color_eyre::eyre::Result;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// Initializes logs and error reporting for the integration tests.
pub fn init() -> Result<()> {
    let _ = color_eyre::install();

    let subscriber = FmtSubscriber::builder().with_max_level(Level::ERROR).finish();
    let _ = tracing::subscriber::set_global_default(subscriber);

    Ok(())
}
