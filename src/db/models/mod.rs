//! Domain models persisted by the repositories.

pub mod calendar;
pub mod reminder;

pub use self::calendar::*;
pub use self::reminder::*;
