//! Replay of user logs into change processors.
//!
//! Each message on a user log is a committed transaction's modification list.
//! [`LogProcessorFramework`] turns it into a [`ChangeState`] and hands it to
//! every registered [`ChangeProcessor`] inside a fresh graph transaction.

mod framework;
mod state;

pub use framework::{ChangeProcessor, LogProcessorBuilder, LogProcessorFramework};
pub use state::ChangeState;
