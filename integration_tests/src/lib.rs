pub mod sim;
pub mod utils;

pub mod prelude {
    pub use super::sim::{SimClock, SimCountdown, SimDriver, SimPin, SimSsiBus};
    pub use super::utils::{completion_log, init_logging, leak, LinkFixture, TestLink};
    pub use fieldlink_common::{AppStatus, ErrorCode, LinkState, Status};
    pub use fieldlink_node::{Callbacks, EventLoop, FieldbusLink};
}
