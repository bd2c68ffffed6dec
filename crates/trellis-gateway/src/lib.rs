pub mod api;
pub mod bootstrap;
pub mod router;
pub mod scheduler;
pub mod server;
pub mod state;
pub mod upstream;
pub mod ws;

pub use scheduler::CronScheduler;
pub use server::GatewayServer;
pub use upstream::HttpService;
