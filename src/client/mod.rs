//! pathgauge client: the far end of each measurement
// (c) 2024 Ross Younger
//!
//! The server does the measuring; the client plays its part in each test
//! (answering pings, receiving the download, sending the upload) and reports
//! the results it is sent.

mod main_loop;
mod meter;
mod peer;
mod report;

pub(crate) use main_loop::client_main;
pub use main_loop::{connect, download, ping, upload};
pub use peer::{answer_pings, sink_download, source_upload, IDLE_TIMEOUT};
pub use report::Report;
