mod handlers;
mod jobs;
mod models;
mod state;

pub use handlers::{router, run_server};
