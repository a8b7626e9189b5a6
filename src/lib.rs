pub mod iriswire;
#[cfg(test)]
mod tests;

pub use crate::iriswire::*;

use tracing::Level;
use tracing_subscriber::FmtSubscriber;

pub fn init_tracing(max_level: Level) {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(max_level)
        .finish();

    // tests may have installed a subscriber already
    let _ = tracing::subscriber::set_global_default(subscriber);
}
