pub mod inspect;
pub mod run;
pub mod units;

pub use inspect::{audit, cron, sync};
pub use run::run;
pub use units::{clear, fire};
