pub mod executor;
pub mod result;
pub mod standby;
pub mod validator;

pub use executor::{CommandExecutor, CommandHandler, HandlerOutput};
pub use result::{CommandParams, CommandResult, CommandSnapshot, CommandStatus};
pub use standby::{ImageCache, ImageInfo, InMemoryImageCache, StandbyCommands};
pub use validator::require_params;
