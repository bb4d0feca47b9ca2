mod command;
mod frame;

pub use command::{Command, MAX_NAME_LEN};
pub use frame::{EOM, FrameBuf, frame, frame_into};
