//! Client-side behavior of the visitor chat widget and the admin support
//! console, driven against any [`api::SupportApi`] / [`api::AdminApi`].

pub mod api;
pub mod console;
pub mod identity;
pub mod poller;
pub mod widget;

use std::time::Duration;

/// Visitor message refresh period.
pub const VISITOR_POLL_INTERVAL: Duration = Duration::from_secs(3);
/// Admin console refresh period.
pub const ADMIN_POLL_INTERVAL: Duration = Duration::from_secs(30);
/// Delay before the bot auto-response is sent.
pub const BOT_REPLY_DELAY: Duration = Duration::from_secs(1);
/// Delay between the closing message and the widget being dismissed.
pub const DISMISS_DELAY: Duration = Duration::from_secs(2);
/// Per-request timeout for the HTTP transport.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
