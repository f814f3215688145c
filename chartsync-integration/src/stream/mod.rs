/// Idle timeout wrapper failing a transport stream that stops producing frames.
pub mod timeout;

pub use timeout::TimeoutStream;
