pub mod problem;
pub mod submissions_handler;
