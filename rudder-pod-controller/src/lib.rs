mod context;
mod controller;
mod handler;
mod runtime;

pub use handler::PodHandler;
pub use runtime::start_pod_controller;
