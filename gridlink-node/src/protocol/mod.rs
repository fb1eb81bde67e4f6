pub mod context;
pub mod frame;

pub use context::{RequestContext, SubscriptionView};
pub use frame::{CONTROL_TID, Frame, FrameBody, FrameMeta, PushPayload};
