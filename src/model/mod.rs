pub mod reply;
pub mod settings;

pub use reply::{FreeReply, LimiterStatus, RegisterReply, SubmitReply};
pub use settings::{LimiterSettings, SettingChange, Strategy};
