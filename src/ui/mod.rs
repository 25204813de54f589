//! Terminal progress reporting: a line-counting writer that can erase what
//! it printed, and a spinner that redraws a status line on top of it.

mod spinner;
pub(crate) mod writer;

pub use spinner::{fraction, Spinner};
pub use writer::{Mark, ProgressWriter, SharedProgress};
