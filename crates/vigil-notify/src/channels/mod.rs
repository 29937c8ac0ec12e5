pub mod email;
pub mod http;

pub use email::{EmailChannel, SmtpConfig};
pub use http::HttpChannel;
