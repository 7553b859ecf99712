pub mod frame;
pub mod message;

pub use frame::{read_frame, read_message, write_frame, write_message, FrameError, MAX_FRAME_LEN};
pub use message::{ActuatorAction, ErrorBody, ErrorCode, Request, Response};
