mod bail;
mod signal;
mod window;

pub mod prelude {
    pub use crate::bail::UnitBailError;
    pub use crate::signal::{DelegatedStopListener, StopHandle, StopSignalError};
    pub use crate::window::TimeWindow;
}
