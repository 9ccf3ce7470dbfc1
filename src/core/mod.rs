pub mod clock;
pub mod error;
pub mod lifetime;
pub mod value;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{Result, SessionError};
pub use lifetime::LifeTime;
pub use value::Value;
